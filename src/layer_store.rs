//! Layer store: content-addressed layer data keyed by chain ID.
//!
//! Layers are stored as uncompressed tars under `layers/<chainIdHex>/`.
//! [`LayerStore::register`] streams a tar in, computing its [`DiffId`] on
//! the fly and deriving the [`ChainId`] from the parent chain; registering
//! a chain that already exists is a no-op returning the existing layer.
//!
//! Access goes through ref-counted [`LayerHandle`]s. The count is held in
//! memory on the owning [`Store`] and dropped when the handle drops, so a
//! session releases every handle it acquired on all exit paths.

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::digest::{ChainId, DiffId, chain_id};
use crate::digest::DigestWriter;
use crate::error::{ArchiveError, Result};
use crate::store::{LAYERS_DIR, Store, read_json_or_default, temp_name, write_json_atomic};

const LAYERS_JSON: &str = "layers.json";
const LAYER_TAR: &str = "layer.tar";

/// A layer record in `layers.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct LayerRecord {
    /// Chain ID of this layer stacked on its parent (`sha256:<hex>`).
    pub chain_id: String,

    /// Digest of the uncompressed tar.
    pub diff_id: String,

    /// Parent chain ID, absent for base layers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Uncompressed tar size in bytes.
    pub size: u64,

    /// Creation timestamp in RFC3339 format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
}

/// View over the layer store of a [`Store`].
#[derive(Debug)]
pub struct LayerStore<'a> {
    store: &'a Store,
}

/// A ref-counted handle to a stored layer. The reference is held until
/// the handle is dropped.
#[derive(Debug)]
pub struct LayerHandle<'a> {
    store: &'a Store,
    chain_id: ChainId,
    diff_id: DiffId,
    size: u64,
}

impl LayerHandle<'_> {
    /// Chain ID addressing this layer.
    pub fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    /// Digest of the layer's uncompressed tar.
    pub fn diff_id(&self) -> &DiffId {
        &self.diff_id
    }

    /// Uncompressed tar size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Open the layer's uncompressed tar stream.
    pub fn tar_stream(&self) -> Result<cap_std::fs::File> {
        let layer_dir = self
            .store
            .root_dir()
            .open_dir(LAYERS_DIR)?
            .open_dir(self.chain_id.hex())?;
        Ok(layer_dir.open(LAYER_TAR)?)
    }
}

impl Drop for LayerHandle<'_> {
    fn drop(&mut self) {
        let mut refs = self.store.layer_refs.lock().unwrap();
        if let Some(count) = refs.get_mut(&self.chain_id) {
            *count -= 1;
            if *count == 0 {
                refs.remove(&self.chain_id);
            }
        }
    }
}

impl<'a> LayerStore<'a> {
    /// Stream an uncompressed layer tar into the store.
    ///
    /// The diff ID is computed over the stream; the chain ID follows from
    /// `parent`. Registering an existing chain discards the new bytes and
    /// returns the stored layer. The returned handle holds a reference.
    pub fn register(
        &self,
        mut tar: impl Read,
        parent: Option<&ChainId>,
    ) -> Result<LayerHandle<'a>> {
        if let Some(parent) = parent {
            if !self.contains(parent)? {
                return Err(ArchiveError::LayoutMalformed(format!(
                    "parent layer {parent} not present in layer store"
                )));
            }
        }

        let layers_dir = self.store.root_dir().open_dir(LAYERS_DIR)?;

        // The chain ID is only known once the stream has been digested,
        // so the tar lands in a temp file first.
        let temp = temp_name(LAYER_TAR);
        let mut writer = DigestWriter::new(layers_dir.create(&temp)?);
        let copied = std::io::copy(&mut tar, &mut writer);
        if let Err(e) = copied {
            let _ = layers_dir.remove_file(&temp);
            return Err(e.into());
        }
        let (file, digest, size) = writer.finish();
        file.sync_all()?;
        drop(file);

        let diff_id = DiffId(digest);
        let chain = chain_id(parent, &diff_id);

        if layers_dir.try_exists(chain.hex())? {
            layers_dir.remove_file(&temp)?;
            tracing::trace!(chain = %chain, "layer already present");
            return self.acquire(chain);
        }

        layers_dir.create_dir(chain.hex())?;
        layers_dir.rename(&temp, &layers_dir, &format!("{}/{}", chain.hex(), LAYER_TAR))?;

        let mut records = self.load_records()?;
        records.push(LayerRecord {
            chain_id: chain.to_string(),
            diff_id: diff_id.to_string(),
            parent: parent.map(|p| p.to_string()),
            size,
            created: Some(chrono::Utc::now().to_rfc3339()),
        });
        self.save_records(&records)?;

        tracing::debug!(chain = %chain, diff = %diff_id, size, "registered layer");
        self.acquire(chain)
    }

    /// Acquire a handle to a stored layer, or `None` if the chain is not
    /// present.
    pub fn get(&self, chain: &ChainId) -> Result<Option<LayerHandle<'a>>> {
        if !self.contains(chain)? {
            return Ok(None);
        }
        Ok(Some(self.acquire(chain.clone())?))
    }

    /// Whether the chain is present.
    pub fn contains(&self, chain: &ChainId) -> Result<bool> {
        let layers_dir = self.store.root_dir().open_dir(LAYERS_DIR)?;
        Ok(layers_dir.try_exists(chain.hex())?)
    }

    /// All layer records.
    pub fn list(&self) -> Result<Vec<LayerRecord>> {
        self.load_records()
    }

    /// Number of outstanding handles for a chain. Zero once every session
    /// has released its references.
    pub fn ref_count(&self, chain: &ChainId) -> u64 {
        let refs = self.store.layer_refs.lock().unwrap();
        refs.get(chain).copied().unwrap_or(0)
    }

    fn acquire(&self, chain: ChainId) -> Result<LayerHandle<'a>> {
        let record = self
            .load_records()?
            .into_iter()
            .find(|r| r.chain_id == chain.to_string())
            .ok_or_else(|| {
                ArchiveError::LayoutMalformed(format!("layer {chain} has no store record"))
            })?;

        let diff_id: DiffId = record.diff_id.parse()?;
        {
            let mut refs = self.store.layer_refs.lock().unwrap();
            *refs.entry(chain.clone()).or_insert(0) += 1;
        }
        Ok(LayerHandle {
            store: self.store,
            chain_id: chain,
            diff_id,
            size: record.size,
        })
    }

    fn load_records(&self) -> Result<Vec<LayerRecord>> {
        let layers_dir = self.store.root_dir().open_dir(LAYERS_DIR)?;
        read_json_or_default(&layers_dir, LAYERS_JSON)
    }

    fn save_records(&self, records: &[LayerRecord]) -> Result<()> {
        let layers_dir = self.store.root_dir().open_dir(LAYERS_DIR)?;
        write_json_atomic(&layers_dir, LAYERS_JSON, &records.to_vec())
    }
}

impl Store {
    /// View over the layer store.
    pub fn layer_store(&self) -> LayerStore<'_> {
        LayerStore { store: self }
    }
}
