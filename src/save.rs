//! Save sessions: serialize stored images into a streamable archive.
//!
//! A session resolves the requested names, assembles the archive content
//! in a staging directory ([`BlobStager`]), then streams the staging tree
//! as a single uncompressed tar to the output writer. Any error aborts
//! the session; the staging directory is removed on every exit path and
//! no persistent store state is modified. The caller may observe a
//! truncated (invalid) tar on failure.
//!
//! Entry order in the output is deterministic: images are processed in
//! image-ID order and the final tar is emitted from a sorted walk of the
//! staging tree.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};

use oci_spec::image::MediaType;

use crate::cancel::CancelToken;
use crate::digest::{Digest, ImageId};
use crate::error::{ArchiveError, Result};
use crate::image::Image;
use crate::manifest::{
    LEGACY_LAYER_JSON, LEGACY_VERSION, LEGACY_VERSION_FILE, LegacyLayerMeta, MANIFESTS_JSON,
    ManifestItem, OCI_LAYOUT_FILE, OciLayout, REFS_DIR, REPOSITORIES_FILE, Repositories,
    blob_rel_path, build_oci_manifest, descriptor, legacy_config_path, legacy_layer_path,
};
use crate::pipe::LayerArchiveMode;
use crate::resolve::{ImageDescriptor, RefOverrides, resolve};
use crate::stager::BlobStager;
use crate::store::Store;

/// Output archive format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveFormat {
    /// One directory per image, `layer.tar` per layer, top-level
    /// `manifests.json` and `repositories`.
    #[default]
    Legacy,
    /// Content-addressed `blobs/` tree with per-reference descriptor
    /// files under `refs/` and an `oci-layout` marker.
    Oci,
}

/// Options for a save session.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Archive format to emit.
    pub format: ArchiveFormat,
    /// Raw `name[:tag]=override` pairs for OCI reference file names.
    pub ref_overrides: Vec<String>,
}

/// Save the named images as an archive streamed to `out`.
pub fn save(
    store: &Store,
    names: &[String],
    options: &SaveOptions,
    out: impl Write,
    cancel: &CancelToken,
) -> Result<()> {
    if options.format == ArchiveFormat::Legacy && !options.ref_overrides.is_empty() {
        return Err(ArchiveError::ConflictingOptions(
            "reference overrides require the OCI format".to_string(),
        ));
    }
    let overrides = RefOverrides::parse(&options.ref_overrides)?;

    let resolved = resolve(
        store,
        names,
        &overrides,
        options.format == ArchiveFormat::Oci,
    )?;

    let mut session = SaveSession {
        store,
        resolved,
        stager: BlobStager::new()?,
        cancel: cancel.clone(),
    };

    match options.format {
        ArchiveFormat::Legacy => session.save_legacy()?,
        ArchiveFormat::Oci => session.save_oci()?,
    }
    session.write_archive(out)
}

struct SaveSession<'a> {
    store: &'a Store,
    resolved: BTreeMap<ImageId, ImageDescriptor>,
    stager: BlobStager,
    cancel: CancelToken,
}

impl SaveSession<'_> {
    fn save_legacy(&mut self) -> Result<()> {
        let image_store = self.store.image_store();
        let mut items = Vec::new();
        let mut repositories = Repositories::new();

        let resolved = std::mem::take(&mut self.resolved);
        for (id, descriptor) in &resolved {
            self.cancel.check()?;
            let image = image_store.get(id)?;

            self.stager
                .put_blob(image.raw_json(), |d| legacy_config_path(d.hex()))?;

            let layer_dirs = self.stage_legacy_layers(&image)?;
            // The repositories file points at the top layer by chain ID,
            // independent of how the layer directories are named.
            let top_chain = image.chain_id();

            let mut repo_tags = Vec::new();
            for reference in &descriptor.refs {
                repo_tags.push(reference.to_string());
                if let (Some(tag), Some(chain)) = (reference.tag(), &top_chain) {
                    repositories
                        .entry(reference.name().to_string())
                        .or_default()
                        .insert(tag.to_string(), chain.hex().to_string());
                }
            }

            items.push(ManifestItem {
                config: legacy_config_path(id.hex()),
                repo_tags,
                layers: layer_dirs.iter().map(|d| legacy_layer_path(d)).collect(),
            });
            tracing::debug!(image = %id, layers = items.last().unwrap().layers.len(), "staged image");
        }

        self.stager
            .write_file(MANIFESTS_JSON, &serde_json::to_vec(&items)?)?;
        self.stager
            .write_file(REPOSITORIES_FILE, &serde_json::to_vec(&repositories)?)?;
        Ok(())
    }

    /// Stage every layer of `image` as `<diffHex>/layer.tar` plus the
    /// legacy `VERSION` and `json` companions; returns the layer directory
    /// names in rootfs order.
    fn stage_legacy_layers(&mut self, image: &Image) -> Result<Vec<String>> {
        let layer_store = self.store.layer_store();
        let mut dirs = Vec::new();
        let mut parent_dir: Option<String> = None;

        for depth in 1..=image.diff_ids().len() {
            self.cancel.check()?;
            let chain = image.chain_id_at(depth).expect("depth is in range");
            let layer = layer_store.get(&chain)?.ok_or_else(|| missing_layer(&chain))?;

            let dir_hex = layer.diff_id().hex().to_string();
            self.stager.put_layer(
                layer.diff_id(),
                layer.tar_stream()?,
                LayerArchiveMode::Uncompressed,
                |d| legacy_layer_path(d.hex()),
                &self.cancel,
            )?;

            // Companion metadata once per directory; a shared directory
            // keeps the metadata of its first writer.
            let meta_path = format!("{dir_hex}/{LEGACY_LAYER_JSON}");
            if !self.stager.dir().try_exists(&meta_path)? {
                self.stager.write_file(
                    &format!("{dir_hex}/{LEGACY_VERSION_FILE}"),
                    LEGACY_VERSION.as_bytes(),
                )?;
                let meta = LegacyLayerMeta {
                    id: dir_hex.clone(),
                    parent: parent_dir.clone(),
                };
                self.stager
                    .write_file(&meta_path, &serde_json::to_vec(&meta)?)?;
            }

            parent_dir = Some(dir_hex.clone());
            dirs.push(dir_hex);
        }
        Ok(dirs)
    }

    fn save_oci(&mut self) -> Result<()> {
        let image_store = self.store.image_store();
        // Manifest blob digest and size per image, so an image referenced
        // by several names serializes its manifest once.
        let mut saved: HashMap<ImageId, (Digest, u64)> = HashMap::new();

        let resolved = std::mem::take(&mut self.resolved);
        for (id, image_descriptor) in &resolved {
            self.cancel.check()?;
            if !saved.contains_key(id) {
                let image = image_store.get(id)?;
                let staged = self.stage_oci_image(id, &image)?;
                saved.insert(id.clone(), staged);
            }
            let (manifest_digest, manifest_size) = &saved[id];
            let manifest_descriptor = descriptor(
                MediaType::ImageManifest,
                manifest_digest,
                *manifest_size,
            )?;
            let descriptor_json = serde_json::to_vec(&manifest_descriptor)?;

            if image_descriptor.refs.is_empty() {
                self.stager
                    .write_file(&format!("{REFS_DIR}/{}", id.hex()), &descriptor_json)?;
            } else {
                for reference in &image_descriptor.refs {
                    let tag = reference.tag().expect("resolved refs are tagged");
                    self.stager
                        .write_file(&format!("{REFS_DIR}/{tag}"), &descriptor_json)?;
                }
            }
        }

        self.stager.write_file(
            OCI_LAYOUT_FILE,
            &serde_json::to_vec(&OciLayout::default())?,
        )?;
        Ok(())
    }

    /// Stage the config, layer, and manifest blobs of one image; returns
    /// the manifest blob's digest and size.
    fn stage_oci_image(&mut self, id: &ImageId, image: &Image) -> Result<(Digest, u64)> {
        if image.diff_ids().is_empty() {
            return Err(ArchiveError::EmptyExport(format!(
                "image {id} has no layers"
            )));
        }

        let (config_digest, config_size) =
            self.stager.put_blob(image.raw_json(), blob_rel_path)?;
        let config_descriptor =
            descriptor(MediaType::ImageConfig, &config_digest, config_size)?;

        let layer_store = self.store.layer_store();
        let mut layer_descriptors = Vec::new();
        for depth in 1..=image.diff_ids().len() {
            self.cancel.check()?;
            let chain = image.chain_id_at(depth).expect("depth is in range");
            let layer = layer_store.get(&chain)?.ok_or_else(|| missing_layer(&chain))?;

            let (blob_digest, blob_size) = self.stager.put_layer(
                layer.diff_id(),
                layer.tar_stream()?,
                LayerArchiveMode::Gzip,
                blob_rel_path,
                &self.cancel,
            )?;
            layer_descriptors.push(descriptor(
                MediaType::ImageLayerGzip,
                &blob_digest,
                blob_size,
            )?);
        }

        let manifest = build_oci_manifest(config_descriptor, layer_descriptors)?;
        let manifest_json = serde_json::to_vec(&manifest)?;
        let staged = self.stager.put_blob(&manifest_json, blob_rel_path)?;
        tracing::debug!(image = %id, manifest = %staged.0, "staged OCI image");
        Ok(staged)
    }

    /// Stream the staging tree as a single uncompressed tar, entries in
    /// sorted path order.
    fn write_archive(&self, out: impl Write) -> Result<()> {
        let mut builder = tar::Builder::new(out);
        self.append_dir_sorted(&mut builder, self.stager.path(), Path::new(""))?;
        builder.finish()?;
        Ok(())
    }

    fn append_dir_sorted<W: Write>(
        &self,
        builder: &mut tar::Builder<W>,
        abs: &Path,
        rel: &Path,
    ) -> Result<()> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(abs)?
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<_>>()?;
        entries.sort();

        for path in entries {
            self.cancel.check()?;
            let name = path.file_name().expect("read_dir yields named entries");
            let entry_rel = rel.join(name);
            if path.is_dir() {
                builder.append_dir(&entry_rel, &path)?;
                self.append_dir_sorted(builder, &path, &entry_rel)?;
            } else {
                builder.append_path_with_name(&path, &entry_rel)?;
            }
        }
        Ok(())
    }
}

fn missing_layer(chain: &crate::digest::ChainId) -> ArchiveError {
    ArchiveError::LayoutMalformed(format!("layer {chain} not present in layer store"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_conflict_with_legacy_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_or_init(dir.path()).unwrap();
        let options = SaveOptions {
            format: ArchiveFormat::Legacy,
            ref_overrides: vec!["name=alt".to_string()],
        };
        let result = save(
            &store,
            &["name".to_string()],
            &options,
            Vec::new(),
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(ArchiveError::ConflictingOptions(_))));
    }

    #[test]
    fn test_default_format_is_legacy() {
        assert_eq!(SaveOptions::default().format, ArchiveFormat::Legacy);
    }
}
