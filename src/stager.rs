//! Content-addressed staging area for save sessions.
//!
//! A [`BlobStager`] owns the temporary directory a save session assembles
//! the archive in. Blobs land at their canonical archive-relative paths;
//! a digest staged once is never written again, so a blob referenced by
//! several manifests appears in the archive exactly once. An internal
//! `DiffId → (blob digest, size)` cache short-circuits re-compressing a
//! layer already emitted under a previous image in the same session.
//!
//! The directory is a [`tempfile::TempDir`]: it is removed when the stager
//! drops, which covers both the failure paths and the normal completion
//! (the session streams the directory into the output tar first).

use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::path::Path;

use cap_std::ambient_authority;
use cap_std::fs::Dir;

use crate::cancel::CancelToken;
use crate::digest::{Digest, DiffId};
use crate::error::Result;
use crate::pipe::{LayerArchiveMode, stream_layer};
use crate::store::temp_name;

/// Staging area with digest-keyed blob deduplication.
#[derive(Debug)]
pub struct BlobStager {
    temp: tempfile::TempDir,
    dir: Dir,
    staged: BTreeSet<Digest>,
    layer_cache: HashMap<DiffId, (Digest, u64)>,
}

impl BlobStager {
    /// Create a staging area in a fresh temporary directory.
    pub fn new() -> Result<BlobStager> {
        let temp = tempfile::TempDir::new()?;
        let dir = Dir::open_ambient_dir(temp.path(), ambient_authority())?;
        Ok(BlobStager {
            temp,
            dir,
            staged: BTreeSet::new(),
            layer_cache: HashMap::new(),
        })
    }

    /// Filesystem path of the staging root.
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Capability handle to the staging root.
    pub fn dir(&self) -> &Dir {
        &self.dir
    }

    /// Whether a blob with this digest has been staged.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.staged.contains(digest)
    }

    /// Write a non-blob metadata file (manifests.json, repositories,
    /// refs/*, oci-layout, VERSION, ...) at `rel`, creating parents.
    pub fn write_file(&self, rel: &str, bytes: &[u8]) -> Result<()> {
        self.ensure_parent(rel)?;
        self.dir.write(rel, bytes)?;
        Ok(())
    }

    /// Stage an in-memory blob (config or manifest JSON) at the path
    /// derived from its digest. Returns `(digest, size)`; staging the same
    /// bytes twice writes nothing the second time.
    pub fn put_blob(
        &mut self,
        bytes: &[u8],
        path_for: impl FnOnce(&Digest) -> String,
    ) -> Result<(Digest, u64)> {
        let digest = Digest::sha256_of(bytes);
        let size = bytes.len() as u64;
        if self.staged.contains(&digest) {
            return Ok((digest, size));
        }
        let rel = path_for(&digest);
        self.ensure_parent(&rel)?;
        self.dir.write(&rel, bytes)?;
        self.staged.insert(digest.clone());
        Ok((digest, size))
    }

    /// Stream a layer tar into the staging area, compressing per `mode`,
    /// at the path derived from the resulting blob digest.
    ///
    /// A diff ID already staged in this session is returned from the cache
    /// without re-reading the source; a blob digest already staged (same
    /// output bytes under a different diff) is dropped after compression.
    pub fn put_layer(
        &mut self,
        diff_id: &DiffId,
        tar: impl Read + Send,
        mode: LayerArchiveMode,
        path_for: impl FnOnce(&Digest) -> String,
        cancel: &CancelToken,
    ) -> Result<(Digest, u64)> {
        if let Some((digest, size)) = self.layer_cache.get(diff_id) {
            tracing::trace!(diff = %diff_id, "layer blob served from session cache");
            return Ok((digest.clone(), *size));
        }

        let temp = temp_name("layer-blob");
        let result = (|| {
            let file = self.dir.create(&temp)?;
            let (digest, size) = stream_layer(tar, mode, file, cancel)?;

            if self.staged.contains(&digest) {
                self.dir.remove_file(&temp)?;
            } else {
                let rel = path_for(&digest);
                self.ensure_parent(&rel)?;
                self.dir.rename(&temp, &self.dir, &rel)?;
                self.staged.insert(digest.clone());
            }
            Ok((digest, size))
        })();

        match result {
            Ok((digest, size)) => {
                self.layer_cache
                    .insert(diff_id.clone(), (digest.clone(), size));
                Ok((digest, size))
            }
            Err(e) => {
                let _ = self.dir.remove_file(&temp);
                Err(e)
            }
        }
    }

    fn ensure_parent(&self, rel: &str) -> Result<()> {
        if let Some((parent, _)) = rel.rsplit_once('/') {
            self.dir.create_dir_all(parent)?;
        }
        Ok(())
    }
}
