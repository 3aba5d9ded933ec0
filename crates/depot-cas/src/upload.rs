//! Streaming upload sink.
//!
//! Each uploader writes to its own file under `uploading/`, so concurrent
//! uploads of the same blob never share a file. The checksum is computed
//! while the bytes stream in and checked in [`UploadFile::finish`].
//!
//! Both [`UploadFile`] and [`StagedUpload`] delete their file when dropped
//! before reaching the next stage, so abandoned uploads clean up after
//! themselves.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::{BlobKey, CasError, Result};

/// An in-progress upload of one blob.
#[derive(Debug)]
pub struct UploadFile {
    key: BlobKey,
    path: PathBuf,
    file: Option<File>,
    hasher: Sha256,
    written: u64,
    done: bool,
}

impl UploadFile {
    /// Create the upload file. Fails if `path` already exists.
    pub(crate) async fn create(key: BlobKey, path: PathBuf) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        Ok(Self {
            key,
            path,
            file: Some(file),
            hasher: Sha256::new(),
            written: 0,
            done: false,
        })
    }

    pub fn key(&self) -> &BlobKey {
        &self.key
    }

    /// Path of the private upload file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Append `data`. Writing past the declared size fails immediately.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let total = self.written + data.len() as u64;
        if total > self.key.size() {
            return Err(CasError::SizeMismatch {
                key: self.key.clone(),
                expected: self.key.size(),
                actual: total,
            });
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| std::io::Error::other("upload file already closed"))?;
        file.write_all(data).await?;
        self.hasher.update(data);
        self.written = total;
        Ok(())
    }

    /// Verify size and checksum, flush to disk and hand over the staged file.
    ///
    /// On any mismatch the upload file is removed.
    pub async fn finish(mut self) -> Result<StagedUpload> {
        if self.written != self.key.size() {
            return Err(CasError::SizeMismatch {
                key: self.key.clone(),
                expected: self.key.size(),
                actual: self.written,
            });
        }

        let actual = hex::encode(std::mem::take(&mut self.hasher).finalize());
        if actual != self.key.checksum() {
            return Err(CasError::ChecksumMismatch {
                expected: self.key.checksum().to_string(),
                actual,
            });
        }

        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }

        self.done = true;
        Ok(StagedUpload {
            key: self.key.clone(),
            path: std::mem::take(&mut self.path),
            promoted: false,
        })
    }
}

impl Drop for UploadFile {
    fn drop(&mut self) {
        if !self.done {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// A verified upload waiting to be promoted into the stored bin.
#[derive(Debug)]
pub struct StagedUpload {
    key: BlobKey,
    path: PathBuf,
    promoted: bool,
}

impl StagedUpload {
    pub fn key(&self) -> &BlobKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The file was moved away (or deliberately discarded) by the store.
    pub(crate) fn mark_promoted(&mut self) {
        self.promoted = true;
    }
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        if !self.promoted {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
