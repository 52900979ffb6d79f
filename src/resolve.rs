//! Resolution of user-supplied save tokens to concrete images.
//!
//! Each token is one of: a full image ID (bare hex or `sha256:` form), a
//! canonical `name@digest` reference, a bare `name` (fanning out to every
//! tag known for that name, falling back to image-store prefix search), or
//! `name:tag`. The result maps image IDs to the ordered set of tagged
//! references to emit for each image.
//!
//! OCI output additionally requires the *tag component* of every resolved
//! reference to be unique across all images, because each tag becomes one
//! `refs/<tag>` file in the archive; `--ref` overrides are applied before
//! that check.

use std::collections::{BTreeMap, BTreeSet};

use crate::digest::ImageId;
use crate::error::{ArchiveError, Result};
use crate::reference::{IdOrReference, Reference, parse_id_or_reference, validate_override_tag};
use crate::store::Store;

/// An image selected for save, with the references to emit for it.
#[derive(Debug, Clone, Default)]
pub struct ImageDescriptor {
    /// Tagged references in first-seen order, deduplicated.
    pub refs: Vec<Reference>,
}

/// Parsed `--ref name[:tag]=override` pairs, keyed by the normalized
/// `name:tag` they apply to.
#[derive(Debug, Clone, Default)]
pub struct RefOverrides {
    map: BTreeMap<String, String>,
}

impl RefOverrides {
    /// Parse raw `name[:tag]=override` pairs.
    ///
    /// Canonical (digest) references need no override and are skipped.
    /// Override tags are restricted to `[A-Za-z0-9._-]`.
    pub fn parse(pairs: &[String]) -> Result<RefOverrides> {
        let mut map = BTreeMap::new();
        for pair in pairs {
            let (name, tag) = pair.split_once('=').ok_or_else(|| {
                ArchiveError::InvalidReference(
                    pair.clone(),
                    "expected name[:tag]=reference".to_string(),
                )
            })?;
            let reference = Reference::parse(name)?;
            if reference.is_canonical() {
                continue;
            }
            validate_override_tag(name, tag)?;
            let tagged = reference.with_default_tag();
            map.insert(tagged.to_string(), tag.to_string());
        }
        Ok(RefOverrides { map })
    }

    /// Whether any overrides were given.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn lookup(&self, tagged: &Reference) -> Option<&str> {
        self.map.get(&tagged.to_string()).map(String::as_str)
    }
}

struct Resolver<'a> {
    resolved: BTreeMap<ImageId, ImageDescriptor>,
    seen_tags: BTreeSet<String>,
    overrides: &'a RefOverrides,
    unique_tags: bool,
}

impl Resolver<'_> {
    fn add(&mut self, id: ImageId, reference: Option<Reference>) -> Result<()> {
        let descriptor = self.resolved.entry(id).or_default();

        let Some(reference) = reference else {
            return Ok(());
        };
        if reference.is_canonical() {
            // Digest references identify the image but never name a tag.
            return Ok(());
        }

        let mut tagged = reference.with_default_tag();
        if let Some(alt) = self.overrides.lookup(&tagged) {
            tagged = tagged.with_tag(alt);
        }

        if descriptor.refs.contains(&tagged) {
            return Ok(());
        }
        if self.unique_tags {
            let tag = tagged.tag().expect("normalized reference has a tag");
            if !self.seen_tags.insert(tag.to_string()) {
                return Err(ArchiveError::DuplicateReference(tag.to_string()));
            }
        }
        descriptor.refs.push(tagged);
        Ok(())
    }
}

/// Resolve save tokens against the store.
///
/// With `unique_tags` (OCI mode), a tag collision across the resolved set
/// is a [`DuplicateReference`](ArchiveError::DuplicateReference) error.
/// The returned map iterates in image-ID order, making session output
/// independent of token order and hash state.
pub fn resolve(
    store: &Store,
    tokens: &[String],
    overrides: &RefOverrides,
    unique_tags: bool,
) -> Result<BTreeMap<ImageId, ImageDescriptor>> {
    let image_store = store.image_store();
    let ref_store = store.ref_store();

    let mut resolver = Resolver {
        resolved: BTreeMap::new(),
        seen_tags: BTreeSet::new(),
        overrides,
        unique_tags,
    };

    for token in tokens {
        let not_found = || ArchiveError::NotFound(token.clone());
        match parse_id_or_reference(token)? {
            IdOrReference::Id(hex) => {
                let id: ImageId = format!("sha256:{hex}").parse()?;
                if !image_store.contains(&id)? {
                    return Err(not_found());
                }
                resolver.add(id, None)?;
            }
            IdOrReference::Ref(reference) => {
                if let Some(digest) = reference.digest() {
                    let id = ImageId(digest.clone());
                    if !image_store.contains(&id)? {
                        return Err(not_found());
                    }
                    resolver.add(id, Some(reference))?;
                } else if reference.is_name_only() {
                    let assocs = ref_store.references_by_name(reference.name())?;
                    if assocs.is_empty() {
                        let id = image_store.search(token).map_err(|e| match e {
                            ArchiveError::NotFound(_) => not_found(),
                            other => other,
                        })?;
                        resolver.add(id, None)?;
                    } else {
                        for (assoc_ref, id) in assocs {
                            resolver.add(id, Some(assoc_ref))?;
                        }
                    }
                } else {
                    let id = ref_store.get(&reference).map_err(|e| match e {
                        ArchiveError::NotFound(_) => not_found(),
                        other => other,
                    })?;
                    resolver.add(id, Some(reference))?;
                }
            }
        }
    }

    Ok(resolver.resolved)
}
