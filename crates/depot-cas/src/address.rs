//! Address scheme: maps a blob identity to its location inside the store.
//!
//! A blob is identified by its SHA-256 checksum (lowercase hex) and its size
//! in bytes. Both go into the path so that two blobs with the same digest but
//! a different length can never alias:
//!
//! ```text
//! stored/59/0c148428...a0b9/3367.blob
//! uploading/59/0c148428...a0b9/3367-k2x9q8aa.tmp
//! ```
//!
//! The mapping is a stable on-disk convention; changing it orphans every
//! blob already stored.

use std::fmt;
use std::path::PathBuf;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{CasError, Result};

/// Length of a hex-encoded SHA-256 digest.
pub const CHECKSUM_HEX_LEN: usize = 64;

/// Number of checksum characters used for the shard directory.
pub const SHARD_PREFIX_LEN: usize = 2;

/// Extension of stored blobs.
pub const BLOB_EXTENSION: &str = "blob";

/// Extension of in-progress upload files.
pub const UPLOAD_EXTENSION: &str = "tmp";

/// Identity of a blob: `(checksum, size)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawBlobKey")]
pub struct BlobKey {
    #[serde(rename = "sha")]
    checksum: String,
    size: u64,
}

#[derive(Deserialize)]
struct RawBlobKey {
    sha: String,
    size: u64,
}

impl TryFrom<RawBlobKey> for BlobKey {
    type Error = CasError;

    fn try_from(raw: RawBlobKey) -> Result<Self> {
        BlobKey::new(raw.sha, raw.size)
    }
}

impl BlobKey {
    /// Validate and build a key.
    ///
    /// The checksum must be exactly 64 lowercase hex characters.
    pub fn new(checksum: impl Into<String>, size: u64) -> Result<Self> {
        let checksum = checksum.into();
        if !is_valid_checksum(&checksum) {
            return Err(CasError::InvalidChecksum(checksum));
        }
        Ok(Self { checksum, size })
    }

    /// Key for the given bytes.
    pub fn for_bytes(data: &[u8]) -> Self {
        Self {
            checksum: crate::compute_checksum(data),
            size: data.len() as u64,
        }
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Shard directory plus per-checksum directory: `ab/cdef...`.
    fn checksum_dir(&self) -> PathBuf {
        let (prefix, rest) = self.checksum.split_at(SHARD_PREFIX_LEN);
        PathBuf::from(prefix).join(rest)
    }

    /// Location of the stored blob, relative to the `stored` bin.
    pub fn stored_relpath(&self) -> PathBuf {
        self.checksum_dir()
            .join(format!("{}.{}", self.size, BLOB_EXTENSION))
    }

    /// Directory holding in-progress uploads of this key, relative to the
    /// `uploading` bin.
    pub fn upload_reldir(&self) -> PathBuf {
        self.checksum_dir()
    }

    /// Private upload file name for one uploader.
    pub fn upload_filename(&self, token: &str) -> String {
        format!("{}-{}.{}", self.size, token, UPLOAD_EXTENSION)
    }

    /// Whether `file_name` is an upload file of this key.
    pub(crate) fn is_upload_filename(&self, file_name: &str) -> bool {
        file_name
            .strip_prefix(&format!("{}-", self.size))
            .is_some_and(|rest| rest.ends_with(&format!(".{}", UPLOAD_EXTENSION)))
    }

    /// Parse a key back from a stored blob path relative to the `stored` bin.
    pub fn from_stored_relpath(relpath: &std::path::Path) -> Option<Self> {
        let mut components = relpath.components();
        let prefix = components.next()?.as_os_str().to_str()?;
        let rest = components.next()?.as_os_str().to_str()?;
        let file = components.next()?.as_os_str().to_str()?;
        if components.next().is_some() {
            return None;
        }
        let size = file
            .strip_suffix(&format!(".{}", BLOB_EXTENSION))?
            .parse()
            .ok()?;
        BlobKey::new(format!("{prefix}{rest}"), size).ok()
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.checksum, self.size)
    }
}

/// Check the textual form of a checksum.
pub fn is_valid_checksum(checksum: &str) -> bool {
    checksum.len() == CHECKSUM_HEX_LEN
        && checksum
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Random lowercase alphanumeric token.
pub fn random_token(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
