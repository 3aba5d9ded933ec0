//! # depot-checkout
//!
//! Materializes sets of stored blobs as directories of symlinks.
//!
//! A checkout lives under the checkout root and contains nothing but links
//! into the blob store's `stored/` bin. Creating one allocates a unique
//! directory, links every requested file and touches each linked blob so the
//! reclaimer keeps it. Erasing one removes the link tree; blobs are never
//! deleted through a checkout.

mod manager;
pub mod path;
pub mod request;

pub use manager::CheckoutManager;
pub use request::{CheckoutRequest, FileSpec};

use std::io;
use std::path::{Path, PathBuf};

use depot_cas::{BlobKey, CasError};
use thiserror::Error;

/// Maximum number of directory names tried for one checkout.
pub const MAX_ALLOCATION_ATTEMPTS: usize = 10;

#[derive(Error, Debug)]
pub enum CheckoutError {
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("{} requested file(s) not stored yet", missing.len())]
    MissingFiles { missing: Vec<BlobKey> },

    #[error("could not allocate a checkout directory for {path:?} after {attempts} attempts")]
    AllocationExhausted { path: String, attempts: usize },

    #[error("{} already links to {}, wanted {}", link.display(), existing.display(), wanted.display())]
    LinkConflict {
        link: PathBuf,
        existing: PathBuf,
        wanted: PathBuf,
    },

    #[error("checkout {0:?} does not exist")]
    NotFound(String),

    #[error("checkout cancelled")]
    Cancelled,

    #[error("blob store error: {0}")]
    Store(#[from] CasError),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CheckoutError {
    pub(crate) fn invalid(path: &str, reason: &'static str) -> Self {
        CheckoutError::InvalidPath {
            path: path.to_string(),
            reason,
        }
    }

    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        CheckoutError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the caller sent something unusable, as opposed to the server
    /// failing.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CheckoutError::InvalidPath { .. }
                | CheckoutError::MissingFiles { .. }
                | CheckoutError::NotFound(_)
                | CheckoutError::Store(CasError::InvalidChecksum(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, CheckoutError>;
