//! Archive metadata documents for both formats.
//!
//! Legacy archives carry a top-level `manifests.json` (one
//! [`ManifestItem`] per image), a `repositories` map for tagged images,
//! and per-layer `VERSION`/`json` files. OCI archives carry an
//! `oci-layout` marker, content-addressed blobs, and one descriptor file
//! per reference under `refs/`.

use std::collections::BTreeMap;
use std::str::FromStr;

use oci_spec::image::{
    Descriptor, DescriptorBuilder, ImageManifest, ImageManifestBuilder, MediaType, SCHEMA_VERSION,
};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{ArchiveError, Result};

/// Top-level legacy manifest file name.
pub const MANIFESTS_JSON: &str = "manifests.json";
/// Legacy repositories file name.
pub const REPOSITORIES_FILE: &str = "repositories";
/// OCI layout marker file name.
pub const OCI_LAYOUT_FILE: &str = "oci-layout";
/// OCI layout version this engine emits and accepts.
pub const OCI_LAYOUT_VERSION: &str = "1.0.0";
/// Directory of per-reference descriptor files in OCI archives.
pub const REFS_DIR: &str = "refs";
/// Blob tree root in OCI archives.
pub const BLOBS_DIR: &str = "blobs";
/// Per-layer version marker in legacy archives.
pub const LEGACY_VERSION_FILE: &str = "VERSION";
/// Content of the per-layer version marker.
pub const LEGACY_VERSION: &str = "1.0";
/// Per-layer metadata file in legacy archives (tolerated, ignored on load).
pub const LEGACY_LAYER_JSON: &str = "json";

/// One entry of the legacy `manifests.json` array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestItem {
    /// Config file path at the archive root (`<hex>.json`).
    pub config: String,

    /// `name:tag` strings for this image; empty for unnamed images.
    #[serde(default)]
    pub repo_tags: Vec<String>,

    /// Layer tar paths (`<hex>/layer.tar`) in rootfs order.
    pub layers: Vec<String>,
}

/// The legacy `repositories` document: `{name: {tag: topLayerDirHex}}`.
pub type Repositories = BTreeMap<String, BTreeMap<String, String>>;

/// Per-layer legacy metadata written next to each `layer.tar`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyLayerMeta {
    /// Layer directory name (hex).
    pub id: String,

    /// Parent layer directory name, absent for base layers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// The `oci-layout` marker document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OciLayout {
    /// Layout version; `1.0.0` for the layouts this engine handles.
    #[serde(rename = "imageLayoutVersion")]
    pub image_layout_version: String,
}

impl Default for OciLayout {
    fn default() -> Self {
        OciLayout {
            image_layout_version: OCI_LAYOUT_VERSION.to_string(),
        }
    }
}

/// Archive-relative path of a content-addressed blob.
pub fn blob_rel_path(digest: &Digest) -> String {
    format!("{}/{}/{}", BLOBS_DIR, digest.algorithm(), digest.hex())
}

/// Archive-relative path of a legacy layer tar.
pub fn legacy_layer_path(dir_hex: &str) -> String {
    format!("{dir_hex}/layer.tar")
}

/// Archive-relative path of a legacy config blob.
pub fn legacy_config_path(hex: &str) -> String {
    format!("{hex}.json")
}

/// Convert a [`Digest`] into the oci-spec digest type.
pub fn oci_digest(digest: &Digest) -> Result<oci_spec::image::Digest> {
    oci_spec::image::Digest::from_str(digest.as_str()).map_err(|e| {
        ArchiveError::LayoutMalformed(format!("invalid digest {digest}: {e}"))
    })
}

/// Build an OCI descriptor.
pub fn descriptor(media_type: MediaType, digest: &Digest, size: u64) -> Result<Descriptor> {
    Ok(DescriptorBuilder::default()
        .media_type(media_type)
        .digest(oci_digest(digest)?)
        .size(size)
        .build()?)
}

/// Build an OCI image manifest from a config descriptor and ordered layer
/// descriptors.
pub fn build_oci_manifest(config: Descriptor, layers: Vec<Descriptor>) -> Result<ImageManifest> {
    Ok(ImageManifestBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::ImageManifest)
        .config(config)
        .layers(layers)
        .build()?)
}

/// Parse the digest of an OCI descriptor into the engine's digest type.
pub fn descriptor_digest(descriptor: &Descriptor) -> Result<Digest> {
    descriptor.digest().to_string().parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_item_serialization() {
        let item = ManifestItem {
            config: "abc.json".to_string(),
            repo_tags: vec!["app:latest".to_string()],
            layers: vec!["def/layer.tar".to_string()],
        };
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("\"Config\""));
        assert!(json.contains("\"RepoTags\""));
        assert!(json.contains("\"Layers\""));

        let back: ManifestItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_manifest_item_tolerates_missing_repo_tags() {
        let item: ManifestItem =
            serde_json::from_str(r#"{"Config":"a.json","Layers":["b/layer.tar"]}"#).unwrap();
        assert!(item.repo_tags.is_empty());
    }

    #[test]
    fn test_oci_layout_marker() {
        let json = serde_json::to_string(&OciLayout::default()).unwrap();
        assert_eq!(json, r#"{"imageLayoutVersion":"1.0.0"}"#);
    }

    #[test]
    fn test_blob_rel_path() {
        let digest = Digest::sha256_of(b"blob");
        assert_eq!(
            blob_rel_path(&digest),
            format!("blobs/sha256/{}", digest.hex())
        );
    }

    #[test]
    fn test_build_oci_manifest() {
        let config_digest = Digest::sha256_of(b"config");
        let layer_digest = Digest::sha256_of(b"layer blob");
        let config = descriptor(MediaType::ImageConfig, &config_digest, 7).unwrap();
        let layer = descriptor(MediaType::ImageLayerGzip, &layer_digest, 42).unwrap();

        let manifest = build_oci_manifest(config, vec![layer]).unwrap();
        assert_eq!(manifest.schema_version(), 2);
        assert_eq!(manifest.media_type(), &Some(MediaType::ImageManifest));
        assert_eq!(manifest.layers().len(), 1);
        assert_eq!(
            descriptor_digest(&manifest.layers()[0]).unwrap(),
            layer_digest
        );

        // Serializes with the standard field names.
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"schemaVersion\":2"));
        assert!(json.contains("application/vnd.oci.image.manifest.v1+json"));
        assert!(json.contains("application/vnd.oci.image.layer.v1.tar+gzip"));
    }

    #[test]
    fn test_descriptor_roundtrip_through_json() {
        let digest = Digest::sha256_of(b"manifest");
        let desc = descriptor(MediaType::ImageManifest, &digest, 123).unwrap();
        let json = serde_json::to_vec(&desc).unwrap();
        let back: Descriptor = serde_json::from_slice(&json).unwrap();
        assert_eq!(descriptor_digest(&back).unwrap(), digest);
        assert_eq!(back.size(), 123);
        assert_eq!(back.media_type(), &MediaType::ImageManifest);
    }
}
