//! # depot-cas
//!
//! Content-Addressable Storage (CAS) for depot.
//!
//! Blobs are addressed by SHA-256 checksum plus byte size and sharded by the
//! first two checksum characters to bound per-directory fan-out.
//!
//! ## Directory Layout
//!
//! ```text
//! <root>/file-store/
//! ├── stored/
//! │   └── 59/
//! │       └── 0c1484...a0b9/
//! │           └── 3367.blob          # size.blob
//! └── uploading/
//!     └── 59/
//!         └── 0c1484...a0b9/
//!             └── 3367-k2x9q8aa.tmp  # size-token.tmp, one per uploader
//! ```
//!
//! ## Lifecycle
//!
//! A blob goes `Absent -> Uploading -> Stored`. Uploaders stream into a
//! private file in `uploading/`; [`BlobStore::promote_to_stored`] moves it into
//! `stored/`, and is a no-op if an identical blob got there first. The store
//! keeps no in-memory index: every status query goes to the filesystem.

pub mod address;
mod store;
pub mod touch;
mod upload;

pub use address::BlobKey;
pub use store::{BlobStatus, BlobStore, CasStats, PromoteOutcome, ResolveMode, StoredBlob, UploadEntry};
pub use upload::{StagedUpload, UploadFile};

use std::io;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors that can occur during CAS operations
#[derive(Error, Debug)]
pub enum CasError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid checksum {0:?}: expected 64 lowercase hex characters")]
    InvalidChecksum(String),

    #[error("size mismatch for {key}: declared {expected} bytes, received {actual}")]
    SizeMismatch {
        key: BlobKey,
        expected: u64,
        actual: u64,
    },

    #[error("checksum mismatch: declared {expected}, received {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

impl CasError {
    /// Whether this is a filesystem not-found error, as opposed to a
    /// storage malfunction.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CasError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, CasError>;

/// Compute the hex SHA-256 checksum of the given bytes.
#[inline]
pub fn compute_checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute the key of everything `reader` yields.
pub fn compute_key<R: io::Read>(mut reader: R) -> io::Result<BlobKey> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    let checksum = hex::encode(hasher.finalize());
    BlobKey::new(checksum, size).map_err(io::Error::other)
}
