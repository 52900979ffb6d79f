//! Error types for the imagetar library.
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `Result<T, ArchiveError>`. Error variants map one-to-one onto the
//! failure classes a save or load session can hit:
//!
//! - **Resolution**: [`NotFound`], [`InvalidReference`], [`DuplicateReference`]
//! - **Archive content**: [`DigestMismatch`], [`LayoutMalformed`], [`EmptyExport`]
//! - **Caller mistakes**: [`ConflictingOptions`]
//! - **System**: [`Io`], [`JsonParse`], [`OciSpec`]
//! - **Session control**: [`Cancelled`]
//!
//! [`NotFound`]: ArchiveError::NotFound
//! [`InvalidReference`]: ArchiveError::InvalidReference
//! [`DuplicateReference`]: ArchiveError::DuplicateReference
//! [`DigestMismatch`]: ArchiveError::DigestMismatch
//! [`LayoutMalformed`]: ArchiveError::LayoutMalformed
//! [`EmptyExport`]: ArchiveError::EmptyExport
//! [`ConflictingOptions`]: ArchiveError::ConflictingOptions
//! [`Io`]: ArchiveError::Io
//! [`JsonParse`]: ArchiveError::JsonParse
//! [`OciSpec`]: ArchiveError::OciSpec
//! [`Cancelled`]: ArchiveError::Cancelled
//!
//! There is no recovery policy: any error aborts the running session and
//! triggers cleanup of staging state. The `From` conversions let the `?`
//! operator work directly with `std::io::Error` and `serde_json::Error`.

/// Result type alias for operations that may return an ArchiveError.
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Error surface of save and load sessions.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// An image name or ID did not resolve to a stored image.
    #[error("No such image: {0}")]
    NotFound(String),

    /// A user-supplied reference or override could not be parsed.
    #[error("invalid reference {0:?}: {1}")]
    InvalidReference(String, String),

    /// Two images would occupy the same reference file in OCI output.
    #[error("unable to include unique references {0:?} in OCI image")]
    DuplicateReference(String),

    /// A blob's computed digest disagrees with the digest the archive
    /// declares for it.
    #[error("digest mismatch for {context}: expected {expected}, got {actual}")]
    DigestMismatch {
        /// What was being verified (blob path, layer index, ...).
        context: String,
        /// Digest declared by the archive.
        expected: String,
        /// Digest computed over the actual bytes.
        actual: String,
    },

    /// The archive is structurally invalid: unknown or ambiguous format,
    /// missing required files, escaping entry paths, broken parent links.
    #[error("malformed archive: {0}")]
    LayoutMalformed(String),

    /// The image cannot be exported in the requested format.
    #[error("empty export: {0}")]
    EmptyExport(String),

    /// Incompatible command options, detected before any I/O.
    #[error("conflicting options: {0}")]
    ConflictingOptions(String),

    /// The session was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error from an upstream reader, writer, or the filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Error constructing or parsing OCI spec types.
    #[error("OCI spec error: {0}")]
    OciSpec(#[from] oci_spec::OciSpecError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = ArchiveError::NotFound("busybox:latest".to_string());
        assert_eq!(err.to_string(), "No such image: busybox:latest");
    }

    #[test]
    fn test_duplicate_reference_message() {
        let err = ArchiveError::DuplicateReference("latest".to_string());
        assert_eq!(
            err.to_string(),
            "unable to include unique references \"latest\" in OCI image"
        );
    }

    #[test]
    fn test_digest_mismatch_message() {
        let err = ArchiveError::DigestMismatch {
            context: "layer 0".to_string(),
            expected: "sha256:aa".to_string(),
            actual: "sha256:bb".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("layer 0"));
        assert!(msg.contains("sha256:aa"));
        assert!(msg.contains("sha256:bb"));
    }

    #[test]
    fn test_io_conversion() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(ArchiveError::Io(_))));
    }
}
