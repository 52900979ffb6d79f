//! Image configuration model.
//!
//! An [`Image`] wraps the configuration JSON of a stored image. The raw
//! bytes are preserved verbatim — the image ID is a digest over them, and
//! a save/load round trip must reproduce them bit for bit — while the
//! handful of fields the engine acts on (`rootfs.diff_ids`, `parent`) are
//! parsed out up front.

use serde::Deserialize;

use crate::digest::{ChainId, DiffId, ImageId, chain_id_for};
use crate::error::{ArchiveError, Result};

/// A container image: verbatim configuration bytes plus the parsed fields
/// the save/load engine needs.
#[derive(Debug, Clone)]
pub struct Image {
    raw: Vec<u8>,
    id: ImageId,
    diff_ids: Vec<DiffId>,
    parent: Option<ImageId>,
}

/// The subset of the configuration document the engine reads. Unknown
/// fields are carried only in the raw bytes.
#[derive(Debug, Deserialize)]
struct ConfigDoc {
    #[serde(default)]
    rootfs: Option<RootFsDoc>,
    #[serde(default)]
    parent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RootFsDoc {
    #[serde(rename = "type", default)]
    fs_type: String,
    #[serde(default)]
    diff_ids: Vec<String>,
}

impl Image {
    /// Parse configuration bytes into an image.
    ///
    /// The image ID is the digest of `raw` exactly as given.
    pub fn from_json(raw: Vec<u8>) -> Result<Image> {
        let doc: ConfigDoc = serde_json::from_slice(&raw)?;

        let mut diff_ids = Vec::new();
        if let Some(rootfs) = doc.rootfs {
            if !rootfs.fs_type.is_empty() && rootfs.fs_type != "layers" {
                return Err(ArchiveError::LayoutMalformed(format!(
                    "unsupported rootfs type {:?}",
                    rootfs.fs_type
                )));
            }
            for diff_id in rootfs.diff_ids {
                diff_ids.push(diff_id.parse()?);
            }
        }

        let parent = doc.parent.map(|p| p.parse()).transpose()?;

        let id = ImageId::from_config(&raw);
        Ok(Image {
            raw,
            id,
            diff_ids,
            parent,
        })
    }

    /// The canonical image ID (digest of the configuration bytes).
    pub fn id(&self) -> &ImageId {
        &self.id
    }

    /// The configuration bytes, exactly as stored.
    pub fn raw_json(&self) -> &[u8] {
        &self.raw
    }

    /// Layer diff IDs in stacking order, base first.
    pub fn diff_ids(&self) -> &[DiffId] {
        &self.diff_ids
    }

    /// Parent image declared by the configuration, if any.
    pub fn parent(&self) -> Option<&ImageId> {
        self.parent.as_ref()
    }

    /// Chain ID of the fully stacked rootfs; `None` for zero layers.
    pub fn chain_id(&self) -> Option<ChainId> {
        chain_id_for(&self.diff_ids)
    }

    /// Chain ID of the stack truncated to the first `depth` layers.
    pub fn chain_id_at(&self, depth: usize) -> Option<ChainId> {
        chain_id_for(&self.diff_ids[..depth.min(self.diff_ids.len())])
    }
}
