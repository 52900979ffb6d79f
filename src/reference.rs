//! Parsing and normalization of human-readable image references.
//!
//! A reference is `name`, `name:tag`, or `name@digest`. Bare names pick up
//! the default tag `latest` when a tagged form is required. References are
//! normalized before comparison; equality is on the normalized string form.

use std::fmt;

use crate::digest::{Digest, is_full_hex};
use crate::error::{ArchiveError, Result};

/// Tag applied to bare names when a tagged reference is required.
pub const DEFAULT_TAG: &str = "latest";

/// The identifier part of a reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RefKind {
    /// A bare name without tag or digest.
    NameOnly,
    /// A named tag.
    Tag(String),
    /// A content-addressed digest (canonical reference).
    Digest(Digest),
}

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reference {
    name: String,
    kind: RefKind,
}

impl Reference {
    /// Parse a reference string.
    ///
    /// Accepts `name`, `name:tag`, and `name@algo:hex`. A colon whose
    /// remainder contains `/` is part of the name (registry port), not a
    /// tag separator.
    pub fn parse(input: &str) -> Result<Reference> {
        let invalid = |reason: &str| {
            ArchiveError::InvalidReference(input.to_string(), reason.to_string())
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty reference"));
        }

        let (name, kind) = if let Some((name, digest)) = trimmed.split_once('@') {
            let digest: Digest = digest
                .parse()
                .map_err(|_| invalid("invalid digest component"))?;
            (name, RefKind::Digest(digest))
        } else {
            match trimmed.rsplit_once(':') {
                Some((name, tag)) if !tag.contains('/') => {
                    if !is_valid_tag(tag) {
                        return Err(invalid("invalid tag format"));
                    }
                    (name, RefKind::Tag(tag.to_string()))
                }
                _ => (trimmed, RefKind::NameOnly),
            }
        };

        if name.is_empty() {
            return Err(invalid("empty name component"));
        }
        if !is_valid_name(name) {
            return Err(invalid("invalid name component"));
        }

        Ok(Reference {
            name: name.to_string(),
            kind,
        })
    }

    /// The name component.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tag component, if this is a tagged reference.
    pub fn tag(&self) -> Option<&str> {
        match &self.kind {
            RefKind::Tag(tag) => Some(tag),
            _ => None,
        }
    }

    /// The digest component, if this is a canonical reference.
    pub fn digest(&self) -> Option<&Digest> {
        match &self.kind {
            RefKind::Digest(digest) => Some(digest),
            _ => None,
        }
    }

    /// Whether this reference is a bare name.
    pub fn is_name_only(&self) -> bool {
        matches!(self.kind, RefKind::NameOnly)
    }

    /// Whether this reference pins a digest.
    pub fn is_canonical(&self) -> bool {
        matches!(self.kind, RefKind::Digest(_))
    }

    /// Normalize to a tagged reference, applying [`DEFAULT_TAG`] to bare
    /// names. Canonical references are returned unchanged.
    pub fn with_default_tag(self) -> Reference {
        match self.kind {
            RefKind::NameOnly => Reference {
                name: self.name,
                kind: RefKind::Tag(DEFAULT_TAG.to_string()),
            },
            _ => self,
        }
    }

    /// Replace the tag component.
    pub fn with_tag(&self, tag: &str) -> Reference {
        Reference {
            name: self.name.clone(),
            kind: RefKind::Tag(tag.to_string()),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RefKind::NameOnly => f.write_str(&self.name),
            RefKind::Tag(tag) => write!(f, "{}:{}", self.name, tag),
            RefKind::Digest(digest) => write!(f, "{}@{}", self.name, digest),
        }
    }
}

/// A save token classified as either an image ID or a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdOrReference {
    /// A full image ID (bare 64-hex or `sha256:<hex>`).
    Id(String),
    /// Anything else, parsed as a reference.
    Ref(Reference),
}

/// Classify a user token the way the save path resolves it: a full hex
/// string (with or without the `sha256:` prefix) is an image ID, anything
/// else is a reference. Short hex prefixes go through the reference path
/// and fall back to image-store search.
pub fn parse_id_or_reference(token: &str) -> Result<IdOrReference> {
    if is_full_hex(token) {
        return Ok(IdOrReference::Id(token.to_string()));
    }
    if let Some(hex) = token.strip_prefix("sha256:") {
        if is_full_hex(hex) {
            return Ok(IdOrReference::Id(hex.to_string()));
        }
    }
    Ok(IdOrReference::Ref(Reference::parse(token)?))
}

/// Charset allowed for OCI reference-file override tags.
///
/// Returns the canonical error for a violation, naming the offending
/// `name=ref` pair and the allowed character set.
pub fn validate_override_tag(name: &str, tag: &str) -> Result<()> {
    let ok = !tag.is_empty()
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if ok {
        Ok(())
    } else {
        Err(ArchiveError::InvalidReference(
            format!("{name}={tag}"),
            "reference must not include characters outside of the set of \
             \"A\" to \"Z\", \"a\" to \"z\", \"0\" to \"9\", the hyphen \"-\", \
             the dot \".\", and the underscore \"_\""
                .to_string(),
        ))
    }
}

fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        && !tag.starts_with(['.', '-'])
}

fn is_valid_name(name: &str) -> bool {
    name.bytes().all(|b| {
        b.is_ascii_lowercase()
            || b.is_ascii_digit()
            || matches!(b, b'.' | b'_' | b'-' | b'/' | b':')
    }) && !name.starts_with(['/', ':'])
        && !name.ends_with(['/', ':'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;

    #[test]
    fn test_parse_name_only() {
        let r = Reference::parse("busybox").unwrap();
        assert_eq!(r.name(), "busybox");
        assert!(r.is_name_only());
        assert_eq!(r.to_string(), "busybox");
    }

    #[test]
    fn test_parse_name_and_tag() {
        let r = Reference::parse("repo-one:v1.2").unwrap();
        assert_eq!(r.name(), "repo-one");
        assert_eq!(r.tag(), Some("v1.2"));
        assert_eq!(r.to_string(), "repo-one:v1.2");
    }

    #[test]
    fn test_parse_digest_reference() {
        let digest = Digest::sha256_of(b"config");
        let input = format!("busybox@{digest}");
        let r = Reference::parse(&input).unwrap();
        assert!(r.is_canonical());
        assert_eq!(r.digest(), Some(&digest));
        assert_eq!(r.to_string(), input);
    }

    #[test]
    fn test_registry_port_is_not_a_tag() {
        let r = Reference::parse("registry:5000/app").unwrap();
        assert_eq!(r.name(), "registry:5000/app");
        assert!(r.is_name_only());
    }

    #[test]
    fn test_default_tag() {
        let r = Reference::parse("busybox").unwrap().with_default_tag();
        assert_eq!(r.tag(), Some(DEFAULT_TAG));
        assert_eq!(r.to_string(), "busybox:latest");

        // Already tagged: unchanged.
        let r = Reference::parse("busybox:edge").unwrap().with_default_tag();
        assert_eq!(r.tag(), Some("edge"));
    }

    #[test]
    fn test_with_tag() {
        let r = Reference::parse("busybox:latest").unwrap().with_tag("alt");
        assert_eq!(r.to_string(), "busybox:alt");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Reference::parse("").is_err());
        assert!(Reference::parse("UPPER").is_err());
        assert!(Reference::parse("name:").is_err());
        assert!(Reference::parse("name:-bad").is_err());
        assert!(Reference::parse("name@sha256:short").is_err());
    }

    #[test]
    fn test_parse_id_or_reference() {
        let hex = "a".repeat(64);
        assert_eq!(
            parse_id_or_reference(&hex).unwrap(),
            IdOrReference::Id(hex.clone())
        );
        assert_eq!(
            parse_id_or_reference(&format!("sha256:{hex}")).unwrap(),
            IdOrReference::Id(hex)
        );
        // Short hex falls through to the reference path.
        match parse_id_or_reference("abcd").unwrap() {
            IdOrReference::Ref(r) => assert_eq!(r.name(), "abcd"),
            other => panic!("expected a reference, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_override_tag() {
        assert!(validate_override_tag("busybox", "Alt_1.0-x").is_ok());

        let err = validate_override_tag("busybox", "invalid:reference").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("busybox=invalid:reference"));
        assert!(msg.contains("the underscore \"_\""));
    }
}
