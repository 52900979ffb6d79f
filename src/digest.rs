//! Content digests and the identifiers derived from them.
//!
//! Everything in the archive formats is addressed by a SHA-256 digest in
//! the canonical `<algorithm>:<hex>` form. Three roles of that one shape
//! get their own newtypes so they cannot be mixed up:
//!
//! - [`DiffId`] — digest of a layer's *uncompressed* tar stream.
//! - [`ChainId`] — recursive digest over a layer stack; the key a layer
//!   store addresses layers by.
//! - [`ImageId`] — digest of an image's configuration JSON.
//!
//! A blob digest (digest of the bytes actually stored in an archive, which
//! for OCI layers is the *compressed* form) stays a plain [`Digest`].
//!
//! [`Digester`] and [`DigestWriter`] compute digests over streams without
//! buffering the payload.

use std::fmt;
use std::io::Write;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{ArchiveError, Result};

/// The only digest algorithm the archive formats emit.
pub const SHA256_ALGORITHM: &str = "sha256";

/// A validated content digest in `<algorithm>:<hex>` form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Compute the SHA-256 digest of a byte slice.
    pub fn sha256_of(data: &[u8]) -> Digest {
        Digest(format!("{}:{:x}", SHA256_ALGORITHM, Sha256::digest(data)))
    }

    /// The algorithm component (e.g. `sha256`).
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or("")
    }

    /// The hex component, without the algorithm prefix.
    pub fn hex(&self) -> &str {
        self.0.split_once(':').map(|(_, h)| h).unwrap_or(&self.0)
    }

    /// The full `<algorithm>:<hex>` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self> {
        let (algo, hex) = s.split_once(':').ok_or_else(|| {
            ArchiveError::InvalidReference(s.to_string(), "digest is missing an algorithm".into())
        })?;
        if algo != SHA256_ALGORITHM {
            return Err(ArchiveError::InvalidReference(
                s.to_string(),
                format!("unsupported digest algorithm {algo:?}"),
            ));
        }
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        {
            return Err(ArchiveError::InvalidReference(
                s.to_string(),
                "digest hex must be 64 lowercase hex characters".into(),
            ));
        }
        Ok(Digest(s.to_string()))
    }
}

/// Returns true if `s` looks like a full image ID hex (64 hex chars).
pub fn is_full_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

macro_rules! digest_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Digest);

        impl $name {
            /// The hex component, without the algorithm prefix.
            pub fn hex(&self) -> &str {
                self.0.hex()
            }

            /// The underlying digest.
            pub fn digest(&self) -> &Digest {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = ArchiveError;

            fn from_str(s: &str) -> Result<Self> {
                Ok($name(s.parse()?))
            }
        }
    };
}

digest_newtype! {
    /// Digest of a layer's uncompressed tar stream.
    DiffId
}

digest_newtype! {
    /// Recursive digest identifying a stacked layer's cumulative identity.
    ChainId
}

digest_newtype! {
    /// Digest of an image's configuration JSON; the canonical image identity.
    ImageId
}

impl ImageId {
    /// Derive the image ID from configuration bytes.
    pub fn from_config(config: &[u8]) -> ImageId {
        ImageId(Digest::sha256_of(config))
    }
}

/// Compute the chain ID of a layer stacked on `parent`.
///
/// `chain(0) = diff(0)`; `chain(i) = sha256(chain(i-1) + " " + diff(i))`.
pub fn chain_id(parent: Option<&ChainId>, diff_id: &DiffId) -> ChainId {
    match parent {
        None => ChainId(diff_id.0.clone()),
        Some(parent) => {
            let material = format!("{} {}", parent, diff_id);
            ChainId(Digest::sha256_of(material.as_bytes()))
        }
    }
}

/// Compute the chain ID of a full stack of diff IDs, base first.
///
/// Returns `None` for an empty stack.
pub fn chain_id_for(diff_ids: &[DiffId]) -> Option<ChainId> {
    let mut chain: Option<ChainId> = None;
    for diff_id in diff_ids {
        chain = Some(chain_id(chain.as_ref(), diff_id));
    }
    chain
}

/// Incremental SHA-256 digest computation.
#[derive(Default)]
pub struct Digester {
    hasher: Sha256,
    count: u64,
}

impl Digester {
    /// Create a fresh digester.
    pub fn new() -> Digester {
        Digester::default()
    }

    /// Feed bytes into the digest.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.count += data.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Finish and return the digest together with the byte count.
    pub fn finalize(self) -> (Digest, u64) {
        let digest = Digest(format!("{}:{:x}", SHA256_ALGORITHM, self.hasher.finalize()));
        (digest, self.count)
    }
}

/// A writer adapter that digests and counts everything written through it.
pub struct DigestWriter<W: Write> {
    inner: W,
    digester: Digester,
}

impl<W: Write> DigestWriter<W> {
    /// Wrap `inner`, digesting all bytes passed through.
    pub fn new(inner: W) -> DigestWriter<W> {
        DigestWriter {
            inner,
            digester: Digester::new(),
        }
    }

    /// Unwrap, returning the inner writer and the `(digest, size)` pair.
    pub fn finish(self) -> (W, Digest, u64) {
        let (digest, size) = self.digester.finalize();
        (self.inner, digest, size)
    }
}

/// A reader adapter that digests and counts everything read through it.
pub struct DigestReader<R: std::io::Read> {
    inner: R,
    digester: Digester,
}

impl<R: std::io::Read> DigestReader<R> {
    /// Wrap `inner`, digesting all bytes read through.
    pub fn new(inner: R) -> DigestReader<R> {
        DigestReader {
            inner,
            digester: Digester::new(),
        }
    }

    /// Finish, returning the `(digest, size)` pair over the bytes read.
    pub fn finish(self) -> (Digest, u64) {
        self.digester.finalize()
    }
}

impl<R: std::io::Read> std::io::Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
