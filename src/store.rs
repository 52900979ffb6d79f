//! Root handle for the local image, layer, and reference stores.
//!
//! A [`Store`] owns a capability-based directory handle to the store root;
//! every file operation is fd-relative via [`cap_std::fs::Dir`], so store
//! access cannot escape the root. The save/load sessions receive the store
//! as an injected capability and reach the three collaborator stores
//! through the [`image_store`](Store::image_store),
//! [`layer_store`](Store::layer_store) and [`ref_store`](Store::ref_store)
//! accessors.
//!
//! # On-disk layout
//!
//! ```text
//! <root>/
//! ├── images/
//! │   ├── images.json          # image records
//! │   └── <imageIdHex>/config.json
//! ├── layers/
//! │   ├── layers.json          # layer records
//! │   └── <chainIdHex>/layer.tar
//! └── repositories.json        # {name: {tag: imageIdHex}}
//! ```
//!
//! Index files are rewritten atomically (temp name, then rename).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use cap_std::ambient_authority;
use cap_std::fs::Dir;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::digest::ChainId;
use crate::error::Result;

pub(crate) const IMAGES_DIR: &str = "images";
pub(crate) const LAYERS_DIR: &str = "layers";

/// Handle to a store root directory.
#[derive(Debug)]
pub struct Store {
    root_dir: Dir,
    /// In-memory reference counts for acquired layer handles. Sessions
    /// must hold a handle for every layer they read or write; the count
    /// drops when the handle does.
    pub(crate) layer_refs: Mutex<HashMap<ChainId, u64>>,
}

impl Store {
    /// Open an existing store root.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Store> {
        let root_dir = Dir::open_ambient_dir(root.as_ref(), ambient_authority())?;
        Ok(Store {
            root_dir,
            layer_refs: Mutex::new(HashMap::new()),
        })
    }

    /// Open a store root, creating the directory structure if needed.
    pub fn open_or_init<P: AsRef<Path>>(root: P) -> Result<Store> {
        std::fs::create_dir_all(root.as_ref())?;
        let store = Store::open(root)?;
        for dir in [IMAGES_DIR, LAYERS_DIR] {
            if !store.root_dir.try_exists(dir)? {
                store.root_dir.create_dir(dir)?;
            }
        }
        Ok(store)
    }

    /// The capability handle to the store root.
    pub fn root_dir(&self) -> &Dir {
        &self.root_dir
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A process-unique temporary file name for atomic writes into `dir`.
pub(crate) fn temp_name(base: &str) -> String {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{base}.{}.{n}.tmp", std::process::id())
}

/// Write `value` as JSON to `name` in `dir` atomically via temp + rename.
pub(crate) fn write_json_atomic<T: Serialize>(dir: &Dir, name: &str, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let temp = temp_name(name);
    dir.write(&temp, json.as_bytes())?;
    dir.rename(&temp, dir, name)?;
    Ok(())
}

/// Read `name` from `dir` as JSON, returning `T::default()` if the file
/// does not exist yet.
pub(crate) fn read_json_or_default<T>(dir: &Dir, name: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match dir.read_to_string(name) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_open_or_init_creates_structure() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_or_init(dir.path()).unwrap();
        assert!(store.root_dir().try_exists(IMAGES_DIR).unwrap());
        assert!(store.root_dir().try_exists(LAYERS_DIR).unwrap());

        // Idempotent.
        let _again = Store::open_or_init(dir.path()).unwrap();
    }

    #[test]
    fn test_json_atomic_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_or_init(dir.path()).unwrap();

        let empty: BTreeMap<String, u32> = read_json_or_default(store.root_dir(), "x.json").unwrap();
        assert!(empty.is_empty());

        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1u32);
        write_json_atomic(store.root_dir(), "x.json", &map).unwrap();

        let back: BTreeMap<String, u32> = read_json_or_default(store.root_dir(), "x.json").unwrap();
        assert_eq!(back, map);

        // No temp files left behind.
        let leftovers: Vec<_> = store
            .root_dir()
            .entries()
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "leftover temp files: {leftovers:?}");
    }
}
