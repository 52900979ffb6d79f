//! Image store: configuration blobs keyed by image ID.
//!
//! The image store maps an [`ImageId`] (digest of the configuration JSON)
//! to the configuration bytes, plus a parent linkage used by locally built
//! image chains. Creation is idempotent: registering a configuration that
//! already exists returns the existing ID and changes nothing.

use serde::{Deserialize, Serialize};

use crate::digest::ImageId;
use crate::error::{ArchiveError, Result};
use crate::image::Image;
use crate::store::{IMAGES_DIR, Store, read_json_or_default, write_json_atomic};

const IMAGES_JSON: &str = "images.json";
const CONFIG_FILE: &str = "config.json";

/// An image record in `images.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ImageRecord {
    /// Full image digest (`sha256:<hex>`).
    pub id: String,

    /// Parent image digest, if linkage has been recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Creation timestamp in RFC3339 format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
}

/// View over the image store of a [`Store`].
#[derive(Debug)]
pub struct ImageStore<'a> {
    store: &'a Store,
}

impl<'a> ImageStore<'a> {
    /// Register configuration bytes, returning the canonical image ID.
    ///
    /// Idempotent on the ID: an already-present configuration is left
    /// untouched and its ID returned.
    pub fn create(&self, config: &[u8]) -> Result<ImageId> {
        // Validate before persisting anything.
        let image = Image::from_json(config.to_vec())?;
        let id = image.id().clone();

        let images_dir = self.store.root_dir().open_dir(IMAGES_DIR)?;
        if images_dir.try_exists(id.hex())? {
            return Ok(id);
        }

        images_dir.create_dir(id.hex())?;
        images_dir.open_dir(id.hex())?.write(CONFIG_FILE, config)?;

        let mut records = self.load_records()?;
        if !records.iter().any(|r| r.id == id.to_string()) {
            records.push(ImageRecord {
                id: id.to_string(),
                parent: None,
                created: Some(chrono::Utc::now().to_rfc3339()),
            });
            self.save_records(&records)?;
        }

        tracing::debug!(image = %id, "registered image config");
        Ok(id)
    }

    /// Fetch an image by ID.
    pub fn get(&self, id: &ImageId) -> Result<Image> {
        let images_dir = self.store.root_dir().open_dir(IMAGES_DIR)?;
        let image_dir = images_dir
            .open_dir(id.hex())
            .map_err(|_| ArchiveError::NotFound(id.to_string()))?;
        let config = image_dir.read(CONFIG_FILE)?;
        Image::from_json(config)
    }

    /// Whether an image with this ID exists.
    pub fn contains(&self, id: &ImageId) -> Result<bool> {
        let images_dir = self.store.root_dir().open_dir(IMAGES_DIR)?;
        Ok(images_dir.try_exists(id.hex())?)
    }

    /// Resolve a hex prefix to a unique image ID.
    pub fn search(&self, prefix: &str) -> Result<ImageId> {
        let records = self.load_records()?;
        let mut matches = records
            .iter()
            .filter(|r| r.id.strip_prefix("sha256:").unwrap_or(&r.id).starts_with(prefix));

        let found = matches.next().ok_or_else(|| {
            ArchiveError::NotFound(prefix.to_string())
        })?;
        if matches.next().is_some() {
            return Err(ArchiveError::InvalidReference(
                prefix.to_string(),
                "ambiguous image ID prefix".to_string(),
            ));
        }
        found.id.parse()
    }

    /// Record the parent linkage of an image. Both images must exist.
    pub fn set_parent(&self, id: &ImageId, parent: &ImageId) -> Result<()> {
        if !self.contains(parent)? {
            return Err(ArchiveError::NotFound(parent.to_string()));
        }
        let mut records = self.load_records()?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id.to_string())
            .ok_or_else(|| ArchiveError::NotFound(id.to_string()))?;
        record.parent = Some(parent.to_string());
        self.save_records(&records)
    }

    /// The recorded parent of an image, if any.
    pub fn parent(&self, id: &ImageId) -> Result<Option<ImageId>> {
        let records = self.load_records()?;
        let record = records
            .iter()
            .find(|r| r.id == id.to_string())
            .ok_or_else(|| ArchiveError::NotFound(id.to_string()))?;
        record.parent.as_deref().map(str::parse).transpose()
    }

    /// All image records.
    pub fn list(&self) -> Result<Vec<ImageRecord>> {
        self.load_records()
    }

    fn load_records(&self) -> Result<Vec<ImageRecord>> {
        let images_dir = self.store.root_dir().open_dir(IMAGES_DIR)?;
        read_json_or_default(&images_dir, IMAGES_JSON)
    }

    fn save_records(&self, records: &[ImageRecord]) -> Result<()> {
        let images_dir = self.store.root_dir().open_dir(IMAGES_DIR)?;
        write_json_atomic(&images_dir, IMAGES_JSON, &records.to_vec())
    }
}

impl Store {
    /// View over the image store.
    pub fn image_store(&self) -> ImageStore<'_> {
        ImageStore { store: self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_or_init(dir.path()).unwrap();
        (dir, store)
    }

    fn config(marker: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "comment": marker,
            "rootfs": {"type": "layers", "diff_ids": [Digest::sha256_of(marker.as_bytes()).to_string()]},
        }))
        .unwrap()
    }

    #[test]
    fn test_create_is_idempotent() {
        let (_dir, store) = test_store();
        let is = store.image_store();

        let id1 = is.create(&config("a")).unwrap();
        let id2 = is.create(&config("a")).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(is.list().unwrap().len(), 1);
    }

    #[test]
    fn test_get_preserves_bytes() {
        let (_dir, store) = test_store();
        let is = store.image_store();

        let raw = config("exact");
        let id = is.create(&raw).unwrap();
        let image = is.get(&id).unwrap();
        assert_eq!(image.raw_json(), raw.as_slice());
        assert_eq!(image.id(), &id);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (_dir, store) = test_store();
        let missing = ImageId::from_config(b"no such config");
        match store.image_store().get(&missing) {
            Err(ArchiveError::NotFound(name)) => assert_eq!(name, missing.to_string()),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_search_by_prefix() {
        let (_dir, store) = test_store();
        let is = store.image_store();

        let id = is.create(&config("searchable")).unwrap();
        let found = is.search(&id.hex()[..12]).unwrap();
        assert_eq!(found, id);

        assert!(matches!(
            is.search("ffffffffffff"),
            Err(ArchiveError::NotFound(_))
        ));
    }

    #[test]
    fn test_parent_linkage() {
        let (_dir, store) = test_store();
        let is = store.image_store();

        let parent = is.create(&config("parent")).unwrap();
        let child = is.create(&config("child")).unwrap();

        assert_eq!(is.parent(&child).unwrap(), None);
        is.set_parent(&child, &parent).unwrap();
        assert_eq!(is.parent(&child).unwrap(), Some(parent.clone()));

        let missing = ImageId::from_config(b"missing");
        assert!(is.set_parent(&child, &missing).is_err());
    }
}
