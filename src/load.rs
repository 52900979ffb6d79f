//! Load sessions: reconstruct images from a save archive.
//!
//! The session extracts the incoming tar into a temporary directory
//! (entry paths are validated; writes are fd-relative to the extraction
//! root), detects the archive format, then validates and materializes
//! each image: blobs are digest-verified against what the archive
//! declares, layers stream through the decompression pipe into the layer
//! store, configurations register with the image store, and references
//! bind last-writer-wins.
//!
//! Per image the progression is parse → config validation → layer
//! hydration → image registration → reference binding. A failure before
//! registration leaves no trace of that image; a failure while binding
//! leaves the image registered with the remaining references unbound.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

use cap_std::ambient_authority;
use cap_std::fs::Dir;
use oci_spec::image::{Descriptor, ImageManifest, MediaType};

use crate::cancel::CancelToken;
use crate::digest::{Digest, ImageId, is_full_hex};
use crate::error::{ArchiveError, Result};
use crate::image::Image;
use crate::layer_store::LayerHandle;
use crate::manifest::{
    MANIFESTS_JSON, ManifestItem, OCI_LAYOUT_FILE, OCI_LAYOUT_VERSION, OciLayout, REFS_DIR,
    blob_rel_path, descriptor_digest,
};
use crate::pipe::{LayerArchiveMode, copy_cancellable, hydrate_layer};
use crate::reference::Reference;
use crate::store::Store;

/// The canonical empty layer tar: two zero blocks. Zero-byte layer blobs
/// in an archive denote this content.
const EMPTY_TAR: [u8; 1024] = [0; 1024];

/// Progress events emitted once per image at the end of a load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadEvent {
    /// An image without references was loaded.
    ImageLoaded {
        /// The registered image ID.
        id: ImageId,
    },
    /// A reference to a loaded image was bound.
    ReferenceLoaded {
        /// The bound `name:tag` reference.
        reference: Reference,
    },
}

impl fmt::Display for LoadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadEvent::ImageLoaded { id } => write!(f, "Loaded image ID: {id}"),
            LoadEvent::ReferenceLoaded { reference } => write!(f, "Loaded image: {reference}"),
        }
    }
}

/// Load an archive from `input` into the store, emitting a progress event
/// per image.
pub fn load(
    store: &Store,
    input: impl Read,
    cancel: &CancelToken,
    mut on_event: impl FnMut(&LoadEvent),
) -> Result<()> {
    let temp = tempfile::TempDir::new()?;
    let root = Dir::open_ambient_dir(temp.path(), ambient_authority())?;
    extract_archive(input, &root, cancel)?;

    let mut session = LoadSession {
        store,
        root,
        cancel: cancel.clone(),
        on_event: &mut on_event,
    };

    let has_oci = session.root.try_exists(OCI_LAYOUT_FILE)?;
    let has_legacy = session.root.try_exists(MANIFESTS_JSON)?;
    match (has_oci, has_legacy) {
        (true, true) => Err(ArchiveError::LayoutMalformed(
            "ambiguous archive".to_string(),
        )),
        (false, false) => Err(ArchiveError::LayoutMalformed(
            "unknown archive format".to_string(),
        )),
        (true, false) => session.load_oci(),
        (false, true) => session.load_legacy(),
    }
}

/// Extract a tar stream entry by entry into `root`.
///
/// Only directories and regular files are accepted; every entry path must
/// be relative and must not contain `..` components. Writes go through
/// the capability handle, so even a hostile path cannot escape the
/// extraction root.
fn extract_archive(input: impl Read, root: &Dir, cancel: &CancelToken) -> Result<()> {
    let mut archive = tar::Archive::new(input);
    for entry in archive.entries()? {
        cancel.check()?;
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        for component in path.components() {
            match component {
                std::path::Component::Normal(_) | std::path::Component::CurDir => {}
                _ => {
                    return Err(ArchiveError::LayoutMalformed(format!(
                        "entry path {} escapes the archive root",
                        path.display()
                    )));
                }
            }
        }

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                root.create_dir_all(&path)?;
            }
            tar::EntryType::Regular => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        root.create_dir_all(parent)?;
                    }
                }
                let mut file = root.create(&path)?;
                copy_cancellable(&mut entry, &mut file, cancel)?;
            }
            tar::EntryType::XGlobalHeader | tar::EntryType::XHeader => {}
            other => {
                return Err(ArchiveError::LayoutMalformed(format!(
                    "unsupported entry type {:?} for {}",
                    other,
                    path.display()
                )));
            }
        }
    }
    Ok(())
}

struct LoadSession<'a> {
    store: &'a Store,
    root: Dir,
    cancel: CancelToken,
    on_event: &'a mut dyn FnMut(&LoadEvent),
}

impl<'a> LoadSession<'a> {
    fn load_oci(&mut self) -> Result<()> {
        let layout: OciLayout = serde_json::from_slice(&self.root.read(OCI_LAYOUT_FILE)?)?;
        if layout.image_layout_version != OCI_LAYOUT_VERSION {
            return Err(ArchiveError::LayoutMalformed(format!(
                "unsupported OCI layout version {:?}",
                layout.image_layout_version
            )));
        }

        // Group reference files by the manifest they point at, so an
        // image named several times is materialized once.
        let mut by_manifest: BTreeMap<Digest, Vec<String>> = BTreeMap::new();
        let refs_dir = self.root.open_dir(REFS_DIR).map_err(|_| {
            ArchiveError::LayoutMalformed("archive has no refs directory".to_string())
        })?;
        let mut ref_names: Vec<String> = Vec::new();
        for entry in refs_dir.entries()? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            ref_names.push(entry.file_name().into_string().map_err(|name| {
                ArchiveError::LayoutMalformed(format!("non-UTF-8 ref name {name:?}"))
            })?);
        }
        ref_names.sort();

        for name in ref_names {
            let descriptor: Descriptor =
                serde_json::from_slice(&refs_dir.read(&name)?)?;
            if descriptor.media_type() != &MediaType::ImageManifest {
                return Err(ArchiveError::LayoutMalformed(format!(
                    "ref {name:?} does not point at an image manifest"
                )));
            }
            by_manifest
                .entry(descriptor_digest(&descriptor)?)
                .or_default()
                .push(name);
        }
        if by_manifest.is_empty() {
            return Err(ArchiveError::LayoutMalformed(
                "archive contains no references".to_string(),
            ));
        }

        for (manifest_digest, names) in by_manifest {
            self.cancel.check()?;
            self.load_oci_image(&manifest_digest, &names)?;
        }
        Ok(())
    }

    fn load_oci_image(&mut self, manifest_digest: &Digest, ref_names: &[String]) -> Result<()> {
        let manifest_bytes = self.read_blob(manifest_digest, "manifest")?;
        let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)?;
        if manifest.media_type() != &Some(MediaType::ImageManifest) {
            return Err(ArchiveError::LayoutMalformed(format!(
                "blob {manifest_digest} is not an image manifest"
            )));
        }

        let config_digest = descriptor_digest(manifest.config())?;
        let config = self.read_blob(&config_digest, "config")?;
        let image = Image::from_json(config.clone())?;

        if manifest.layers().len() != image.diff_ids().len() {
            return Err(ArchiveError::LayoutMalformed(format!(
                "invalid manifest, layers length mismatch: expected {}, got {}",
                manifest.layers().len(),
                image.diff_ids().len()
            )));
        }

        // Handles keep every hydrated chain alive until the image is
        // registered; dropping them afterwards releases the references.
        let mut handles: Vec<LayerHandle<'_>> = Vec::new();
        for (index, layer_descriptor) in manifest.layers().iter().enumerate() {
            self.cancel.check()?;
            let handle = self.hydrate_oci_layer(&image, index, layer_descriptor)?;
            handles.push(handle);
        }

        let id = self.store.image_store().create(&config)?;
        tracing::debug!(image = %id, refs = ref_names.len(), "image loaded");
        drop(handles);

        let mut bound = 0usize;
        for name in ref_names {
            if is_full_hex(name) {
                // A bare image ID file marks an unnamed export.
                continue;
            }
            // The layout stores only the tag component, so the filename
            // doubles as the name. Filenames that do not form a valid
            // reference (tags may use characters names cannot) load the
            // image unnamed.
            let Ok(reference) = Reference::parse(name) else {
                tracing::debug!(file = %name, "ref filename is not bindable");
                continue;
            };
            let reference = reference.with_default_tag();
            self.store.ref_store().bind(&reference, &id)?;
            (self.on_event)(&LoadEvent::ReferenceLoaded { reference });
            bound += 1;
        }
        if bound == 0 {
            (self.on_event)(&LoadEvent::ImageLoaded { id });
        }
        Ok(())
    }

    fn hydrate_oci_layer(
        &self,
        image: &Image,
        index: usize,
        layer_descriptor: &Descriptor,
    ) -> Result<LayerHandle<'a>> {
        let layer_store = self.store.layer_store();
        let chain = image.chain_id_at(index + 1).expect("index is in range");
        if let Some(existing) = layer_store.get(&chain)? {
            tracing::trace!(chain = %chain, "layer already present, reused");
            return Ok(existing);
        }

        let declared = descriptor_digest(layer_descriptor)?;
        let parent = image.chain_id_at(index);
        let expected_diff = &image.diff_ids()[index];

        let blob = self.root.open(blob_rel_path(&declared)).map_err(|_| {
            ArchiveError::LayoutMalformed(format!("missing blob {declared}"))
        })?;

        let (handle, stored_digest) = if blob.metadata()?.len() == 0 {
            // A zero-byte blob denotes the empty layer.
            let handle = layer_store.register(&EMPTY_TAR[..], parent.as_ref())?;
            (handle, Digest::sha256_of(b""))
        } else {
            let (handle, stored_digest, _) = hydrate_layer(
                blob,
                LayerArchiveMode::Gzip,
                &self.cancel,
                |tar| layer_store.register(tar, parent.as_ref()),
            )?;
            (handle, stored_digest)
        };

        if stored_digest != declared {
            return Err(ArchiveError::DigestMismatch {
                context: format!("layer blob {}", blob_rel_path(&declared)),
                expected: declared.to_string(),
                actual: stored_digest.to_string(),
            });
        }
        if handle.diff_id() != expected_diff {
            return Err(ArchiveError::DigestMismatch {
                context: format!("diff ID for layer {index}"),
                expected: expected_diff.to_string(),
                actual: handle.diff_id().to_string(),
            });
        }
        Ok(handle)
    }

    /// Read a blob and verify its bytes against the declared digest.
    fn read_blob(&self, declared: &Digest, what: &str) -> Result<Vec<u8>> {
        let path = blob_rel_path(declared);
        let bytes = self.root.read(&path).map_err(|_| {
            ArchiveError::LayoutMalformed(format!("missing {what} blob {declared}"))
        })?;
        let actual = Digest::sha256_of(&bytes);
        if &actual != declared {
            return Err(ArchiveError::DigestMismatch {
                context: format!("{what} blob {path}"),
                expected: declared.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(bytes)
    }

    fn load_legacy(&mut self) -> Result<()> {
        let items: Vec<ManifestItem> =
            serde_json::from_slice(&self.root.read(MANIFESTS_JSON)?)?;

        // Parse every config up front, then register in parent order.
        let mut entries = Vec::new();
        for item in items {
            let config = self.root.read(&item.config).map_err(|_| {
                ArchiveError::LayoutMalformed(format!("missing config file {:?}", item.config))
            })?;
            let image = Image::from_json(config.clone())?;
            entries.push(LegacyEntry {
                id: image.id().clone(),
                image,
                config,
                item,
            });
        }

        for index in topo_order(&entries, self.store)? {
            self.cancel.check()?;
            self.load_legacy_image(&entries[index])?;
        }
        Ok(())
    }

    fn load_legacy_image(&mut self, entry: &LegacyEntry) -> Result<()> {
        let image = &entry.image;
        if entry.item.layers.len() != image.diff_ids().len() {
            return Err(ArchiveError::LayoutMalformed(format!(
                "invalid manifest, layers length mismatch: expected {}, got {}",
                entry.item.layers.len(),
                image.diff_ids().len()
            )));
        }

        let layer_store = self.store.layer_store();
        let mut handles: Vec<LayerHandle<'_>> = Vec::new();
        for (index, layer_path) in entry.item.layers.iter().enumerate() {
            self.cancel.check()?;
            let chain = image.chain_id_at(index + 1).expect("index is in range");
            if let Some(existing) = layer_store.get(&chain)? {
                handles.push(existing);
                continue;
            }

            let parent = image.chain_id_at(index);
            let blob = self.root.open(layer_path).map_err(|_| {
                ArchiveError::LayoutMalformed(format!("missing layer tar {layer_path:?}"))
            })?;

            let handle = if blob.metadata()?.len() == 0 {
                layer_store.register(&EMPTY_TAR[..], parent.as_ref())?
            } else {
                let (handle, _, _) = hydrate_layer(
                    blob,
                    LayerArchiveMode::Uncompressed,
                    &self.cancel,
                    |tar| layer_store.register(tar, parent.as_ref()),
                )?;
                handle
            };

            let expected_diff = &image.diff_ids()[index];
            if handle.diff_id() != expected_diff {
                return Err(ArchiveError::DigestMismatch {
                    context: format!("diff ID for layer {index}"),
                    expected: expected_diff.to_string(),
                    actual: handle.diff_id().to_string(),
                });
            }
            handles.push(handle);
        }

        let image_store = self.store.image_store();
        let id = image_store.create(&entry.config)?;
        if let Some(parent) = image.parent() {
            image_store.set_parent(&id, parent)?;
        }
        tracing::debug!(image = %id, "image loaded");
        drop(handles);

        let mut bound = 0usize;
        for repo_tag in &entry.item.repo_tags {
            let reference = Reference::parse(repo_tag)?.with_default_tag();
            self.store.ref_store().bind(&reference, &id)?;
            (self.on_event)(&LoadEvent::ReferenceLoaded { reference });
            bound += 1;
        }
        if bound == 0 {
            (self.on_event)(&LoadEvent::ImageLoaded { id });
        }
        Ok(())
    }
}

struct LegacyEntry {
    id: ImageId,
    image: Image,
    config: Vec<u8>,
    item: ManifestItem,
}

/// Order archive entries so every parent is registered before its
/// children. A parent missing from both the archive and the image store,
/// or a cycle, is fatal.
fn topo_order(entries: &[LegacyEntry], store: &Store) -> Result<Vec<usize>> {
    let by_id: BTreeMap<&ImageId, usize> = entries
        .iter()
        .enumerate()
        .map(|(index, e)| (&e.id, index))
        .collect();

    let mut order = Vec::with_capacity(entries.len());
    // 0 = unvisited, 1 = on stack, 2 = done
    let mut state = vec![0u8; entries.len()];

    fn visit(
        index: usize,
        entries: &[LegacyEntry],
        by_id: &BTreeMap<&ImageId, usize>,
        state: &mut [u8],
        order: &mut Vec<usize>,
        store: &Store,
    ) -> Result<()> {
        match state[index] {
            2 => return Ok(()),
            1 => {
                return Err(ArchiveError::LayoutMalformed(format!(
                    "parent cycle involving image {}",
                    entries[index].id
                )));
            }
            _ => {}
        }
        state[index] = 1;

        if let Some(parent) = entries[index].image.parent() {
            if let Some(&parent_index) = by_id.get(parent) {
                visit(parent_index, entries, by_id, state, order, store)?;
            } else if !store.image_store().contains(parent)? {
                return Err(ArchiveError::LayoutMalformed(format!(
                    "image {} references missing parent {parent}",
                    entries[index].id
                )));
            }
        }

        state[index] = 2;
        order.push(index);
        Ok(())
    }

    for index in 0..entries.len() {
        visit(index, entries, &by_id, &mut state, &mut order, store)?;
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::DiffId;

    #[test]
    fn test_load_event_display() {
        let id = ImageId::from_config(b"{}");
        let event = LoadEvent::ImageLoaded { id: id.clone() };
        assert_eq!(event.to_string(), format!("Loaded image ID: {id}"));

        let event = LoadEvent::ReferenceLoaded {
            reference: Reference::parse("name:latest").unwrap(),
        };
        assert_eq!(event.to_string(), "Loaded image: name:latest");
    }

    #[test]
    fn test_empty_tar_diff_id_is_canonical() {
        // The well-known digest of two zero blocks.
        let diff = DiffId(Digest::sha256_of(&EMPTY_TAR));
        assert_eq!(
            diff.hex(),
            "5f70bf18a086007016e948b04aed3b82103a36bea41755b6cddfaf10ace3c6ef"
        );
    }

    #[test]
    fn test_extract_rejects_escaping_paths() {
        let temp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(temp.path(), ambient_authority()).unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_ustar();
        let name = header.as_old_mut().name.as_mut();
        name[.."../escape".len()].copy_from_slice(b"../escape");
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &b"oops"[..]).unwrap();
        let archive = builder.into_inner().unwrap();

        let result = extract_archive(archive.as_slice(), &root, &CancelToken::new());
        assert!(matches!(result, Err(ArchiveError::LayoutMalformed(_))));
    }

    #[test]
    fn test_extract_rejects_links() {
        let temp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(temp.path(), ambient_authority()).unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_cksum();
        builder
            .append_link(&mut header, "link", "/etc/passwd")
            .unwrap();
        let archive = builder.into_inner().unwrap();

        let result = extract_archive(archive.as_slice(), &root, &CancelToken::new());
        assert!(matches!(result, Err(ArchiveError::LayoutMalformed(_))));
    }

    #[test]
    fn test_extract_writes_files_and_dirs() {
        let temp = tempfile::tempdir().unwrap();
        let root = Dir::open_ambient_dir(temp.path(), ambient_authority()).unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_ustar();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "sub/dir/file", &b"bytes"[..])
            .unwrap();
        let archive = builder.into_inner().unwrap();

        extract_archive(archive.as_slice(), &root, &CancelToken::new()).unwrap();
        assert_eq!(root.read("sub/dir/file").unwrap(), b"bytes");
    }
}
