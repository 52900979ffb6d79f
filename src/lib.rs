#![forbid(unsafe_code)]
//! Save and load container images as streamable tar archives.
//!
//! This library serializes locally stored container images — layers,
//! configuration, and human-readable references — into a single archive,
//! and reconstructs images from such archives into a local image and
//! layer store. Two archive formats are supported in parallel:
//!
//! - A **legacy** layout: one directory per image with an uncompressed
//!   `layer.tar` per layer, plus top-level `manifests.json` and
//!   `repositories` files.
//! - A content-addressed **OCI image layout**: a `blobs/<algo>/<hex>`
//!   tree, per-reference descriptor files under `refs/`, and an
//!   `oci-layout` marker. Layer blobs are gzip-compressed.
//!
//! # Overview
//!
//! A save session resolves names to images, streams each layer through a
//! compression pipe into a content-addressed staging area (blobs shared
//! between images are written once), builds per-format manifests, and
//! emits the staging tree as one uncompressed tar. A load session runs
//! the inverse: safe extraction, format detection, digest verification of
//! every blob against what the archive declares, layer hydration, image
//! registration, and reference binding.
//!
//! The image, layer, and reference stores are injected capabilities
//! reached through a [`Store`] handle; all store file access is
//! fd-relative via `cap-std`.
//!
//! # Example
//!
//! ```no_run
//! use imagetar::{ArchiveFormat, CancelToken, SaveOptions, Store};
//!
//! let store = Store::open("/var/lib/imagetar")?;
//! let cancel = CancelToken::new();
//!
//! // Save an image to stdout in OCI layout.
//! let options = SaveOptions { format: ArchiveFormat::Oci, ..Default::default() };
//! imagetar::save(
//!     &store,
//!     &["busybox:latest".to_string()],
//!     &options,
//!     std::io::stdout().lock(),
//!     &cancel,
//! )?;
//!
//! // Load an archive from stdin, printing progress.
//! imagetar::load(&store, std::io::stdin().lock(), &cancel, |event| {
//!     println!("{event}");
//! })?;
//! # Ok::<(), imagetar::ArchiveError>(())
//! ```

// Identity and data model
pub mod digest;
pub mod error;
pub mod image;
pub mod reference;

// Store collaborators
pub mod image_store;
pub mod layer_store;
pub mod ref_store;
pub mod store;

// Save/load engine
pub mod cancel;
pub mod load;
pub mod manifest;
pub mod pipe;
pub mod resolve;
pub mod save;
pub mod stager;

pub use cancel::CancelToken;
pub use digest::{ChainId, Digest, DiffId, ImageId};
pub use error::{ArchiveError, Result};
pub use image::Image;
pub use load::{LoadEvent, load};
pub use reference::Reference;
pub use resolve::{ImageDescriptor, RefOverrides};
pub use save::{ArchiveFormat, SaveOptions, save};
pub use store::Store;
