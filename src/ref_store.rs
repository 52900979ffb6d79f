//! Reference store: persistent `name:tag` → image ID associations.
//!
//! Backed by a single `repositories.json` document at the store root,
//! shaped `{name: {tag: imageIdHex}}`. Maps are ordered so lookups and
//! serialization are deterministic. Binding is last-writer-wins; there is
//! no coordination across concurrent sessions beyond the atomic rewrite
//! of the document.

use std::collections::BTreeMap;

use crate::digest::ImageId;
use crate::error::{ArchiveError, Result};
use crate::reference::Reference;
use crate::store::{Store, read_json_or_default, write_json_atomic};

const REPOSITORIES_JSON: &str = "repositories.json";

type RepoMap = BTreeMap<String, BTreeMap<String, String>>;

/// View over the reference store of a [`Store`].
#[derive(Debug)]
pub struct RefStore<'a> {
    store: &'a Store,
}

impl RefStore<'_> {
    /// Bind `reference` (normalized to a tagged form) to an image,
    /// overwriting any existing binding.
    pub fn bind(&self, reference: &Reference, id: &ImageId) -> Result<()> {
        let tagged = reference.clone().with_default_tag();
        let tag = tagged.tag().ok_or_else(|| {
            ArchiveError::InvalidReference(
                reference.to_string(),
                "cannot bind a digest reference to a tag".to_string(),
            )
        })?;

        let mut repos = self.load()?;
        repos
            .entry(tagged.name().to_string())
            .or_default()
            .insert(tag.to_string(), id.hex().to_string());
        self.save(&repos)?;

        tracing::debug!(reference = %tagged, image = %id, "bound reference");
        Ok(())
    }

    /// Look up the image bound to a tagged reference.
    pub fn get(&self, reference: &Reference) -> Result<ImageId> {
        let tagged = reference.clone().with_default_tag();
        let not_found = || ArchiveError::NotFound(reference.to_string());

        let repos = self.load()?;
        let tags = repos.get(tagged.name()).ok_or_else(not_found)?;
        let hex = tags
            .get(tagged.tag().expect("normalized reference has a tag"))
            .ok_or_else(not_found)?;
        format!("sha256:{hex}").parse()
    }

    /// All tagged references under `name`, sorted by tag.
    pub fn references_by_name(&self, name: &str) -> Result<Vec<(Reference, ImageId)>> {
        let repos = self.load()?;
        let Some(tags) = repos.get(name) else {
            return Ok(Vec::new());
        };

        let base = Reference::parse(name)?;
        let mut result = Vec::new();
        for (tag, hex) in tags {
            let id: ImageId = format!("sha256:{hex}").parse()?;
            result.push((base.with_tag(tag), id));
        }
        Ok(result)
    }

    fn load(&self) -> Result<RepoMap> {
        read_json_or_default(self.store.root_dir(), REPOSITORIES_JSON)
    }

    fn save(&self, repos: &RepoMap) -> Result<()> {
        write_json_atomic(self.store.root_dir(), REPOSITORIES_JSON, repos)
    }
}

impl Store {
    /// View over the reference store.
    pub fn ref_store(&self) -> RefStore<'_> {
        RefStore { store: self }
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

    fn id(marker: &[u8]) -> ImageId {
        ImageId(Digest::sha256_of(marker))
    }

    #[test]
    fn test_bind_and_get() {
        let (_dir, store) = test_store();
        let rs = store.ref_store();

        let reference = Reference::parse("repo-one:v1").unwrap();
        rs.bind(&reference, &id(b"one")).unwrap();
        assert_eq!(rs.get(&reference).unwrap(), id(b"one"));
    }

    #[test]
    fn test_bind_applies_default_tag() {
        let (_dir, store) = test_store();
        let rs = store.ref_store();

        rs.bind(&Reference::parse("bare").unwrap(), &id(b"x")).unwrap();
        assert_eq!(
            rs.get(&Reference::parse("bare:latest").unwrap()).unwrap(),
            id(b"x")
        );
    }

    #[test]
    fn test_bind_is_last_writer_wins() {
        let (_dir, store) = test_store();
        let rs = store.ref_store();

        let reference = Reference::parse("name:tag").unwrap();
        rs.bind(&reference, &id(b"old")).unwrap();
        rs.bind(&reference, &id(b"new")).unwrap();
        assert_eq!(rs.get(&reference).unwrap(), id(b"new"));
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (_dir, store) = test_store();
        let reference = Reference::parse("ghost:tag").unwrap();
        match store.ref_store().get(&reference) {
            Err(ArchiveError::NotFound(name)) => assert_eq!(name, "ghost:tag"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_references_by_name_sorted() {
        let (_dir, store) = test_store();
        let rs = store.ref_store();

        rs.bind(&Reference::parse("multi:zz").unwrap(), &id(b"z")).unwrap();
        rs.bind(&Reference::parse("multi:aa").unwrap(), &id(b"a")).unwrap();

        let refs = rs.references_by_name("multi").unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].0.to_string(), "multi:aa");
        assert_eq!(refs[1].0.to_string(), "multi:zz");

        assert!(rs.references_by_name("none").unwrap().is_empty());
    }
}
