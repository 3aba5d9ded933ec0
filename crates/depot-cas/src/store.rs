//! The on-disk blob store.
//!
//! `BlobStore` owns `<base>/stored` and `<base>/uploading`. There is no
//! in-memory status cache; every query goes to the filesystem, so several
//! processes (or a restarted one) see the same state.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use depot_config::{log_store_debug, log_store_info};
use walkdir::WalkDir;

use crate::address::{random_token, UPLOAD_EXTENSION};
use crate::upload::{StagedUpload, UploadFile};
use crate::{touch, BlobKey, Result};

const STORED_DIR: &str = "stored";
const UPLOADING_DIR: &str = "uploading";

/// Length of the random part of upload file names.
const UPLOAD_TOKEN_LEN: usize = 8;

/// Attempts at creating a private upload file before giving up.
const UPLOAD_CREATE_ATTEMPTS: usize = 5;

/// Lifecycle state of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobStatus {
    Absent,
    Uploading,
    Stored,
}

impl BlobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobStatus::Absent => "absent",
            BlobStatus::Uploading => "uploading",
            BlobStatus::Stored => "stored",
        }
    }
}

impl std::fmt::Display for BlobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which states [`BlobStore::resolve`] may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Only stored blobs count; in-progress uploads report `Absent`.
    StoredOnly,
    /// Also report in-progress uploads.
    Everything,
}

/// Result of a promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// The staged file became the stored blob.
    Stored,
    /// An identical blob was already stored; the staged file was discarded.
    AlreadyStored,
}

/// A blob found while walking the stored bin.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub key: BlobKey,
    pub path: PathBuf,
    /// Actual length on disk.
    pub len: u64,
    pub modified: SystemTime,
}

/// An in-progress (or abandoned) upload file.
#[derive(Debug, Clone)]
pub struct UploadEntry {
    pub path: PathBuf,
    pub len: u64,
    pub modified: SystemTime,
}

/// Statistics about the store
#[derive(Debug, Clone, Default)]
pub struct CasStats {
    /// Number of stored blobs
    pub blob_count: u64,
    /// Total bytes stored
    pub total_bytes: u64,
    /// Upload files currently in the uploading bin
    pub upload_count: u64,
    /// Bytes held by upload files
    pub upload_bytes: u64,
}

impl CasStats {
    /// Calculate average blob size
    pub fn avg_blob_size(&self) -> u64 {
        if self.blob_count == 0 {
            0
        } else {
            self.total_bytes / self.blob_count
        }
    }
}

/// Content-addressable blob store.
///
/// Cloning is cheap; clones share the promotion lock.
#[derive(Debug, Clone)]
pub struct BlobStore {
    base: PathBuf,
    stored: PathBuf,
    uploading: PathBuf,
    /// Serializes moves into and deletions from the stored bin.
    promotion_lock: Arc<Mutex<()>>,
}

impl BlobStore {
    /// Open the store rooted at `base`, creating both bins if needed.
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        let stored = base.join(STORED_DIR);
        let uploading = base.join(UPLOADING_DIR);
        fs::create_dir_all(&stored)?;
        fs::create_dir_all(&uploading)?;

        log_store_debug!(base = %base.display(), "opened blob store");
        Ok(Self {
            base,
            stored,
            uploading,
            promotion_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Open the store configured in `config`.
    pub fn from_config(config: &depot_config::Config) -> Result<Self> {
        Self::new(config.file_store_path())
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    pub fn stored_path(&self) -> &Path {
        &self.stored
    }

    pub fn uploading_path(&self) -> &Path {
        &self.uploading
    }

    /// Canonical location of a stored blob, whether or not it exists.
    pub fn blob_path(&self, key: &BlobKey) -> PathBuf {
        self.stored.join(key.stored_relpath())
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.promotion_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Find where a blob lives and what state it is in.
    ///
    /// For `Absent` the returned location is where the blob would be stored.
    /// For `Uploading` it is one of the in-progress upload files. Not-found
    /// conditions map to `Absent`; any other filesystem error is returned.
    pub fn resolve(&self, key: &BlobKey, mode: ResolveMode) -> Result<(PathBuf, BlobStatus)> {
        let stored = self.blob_path(key);
        match fs::metadata(&stored) {
            Ok(meta) if meta.is_file() => return Ok((stored, BlobStatus::Stored)),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if mode == ResolveMode::Everything {
            if let Some(upload) = self.find_upload(key)? {
                return Ok((upload, BlobStatus::Uploading));
            }
        }
        Ok((stored, BlobStatus::Absent))
    }

    fn find_upload(&self, key: &BlobKey) -> Result<Option<PathBuf>> {
        let dir = self.uploading.join(key.upload_reldir());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_str().is_some_and(|n| key.is_upload_filename(n)) {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }

    /// Current status, including in-progress uploads.
    pub fn status(&self, key: &BlobKey) -> Result<BlobStatus> {
        Ok(self.resolve(key, ResolveMode::Everything)?.1)
    }

    /// Check if a blob is stored.
    pub fn exists(&self, key: &BlobKey) -> bool {
        self.blob_path(key).is_file()
    }

    /// Start an upload into a fresh private file.
    ///
    /// Concurrent uploads of the same key each get their own file, so none
    /// can see another's partial data.
    pub async fn open_for_upload(&self, key: &BlobKey) -> Result<UploadFile> {
        let dir = self.uploading.join(key.upload_reldir());
        let mut last_err = None;

        for _ in 0..UPLOAD_CREATE_ATTEMPTS {
            tokio::fs::create_dir_all(&dir).await?;
            let path = dir.join(key.upload_filename(&random_token(UPLOAD_TOKEN_LEN)));
            match UploadFile::create(key.clone(), path).await {
                Ok(file) => {
                    log_store_debug!(checksum = %key, path = %file.path().display(), "upload started");
                    return Ok(file);
                }
                // Token collision, or the directory was pruned after a
                // concurrent promotion. Both are worth another go.
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::AlreadyExists | io::ErrorKind::NotFound
                    ) =>
                {
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_err
            .unwrap_or_else(|| io::Error::other("could not create upload file"))
            .into())
    }

    /// Move a verified staged file into its canonical stored location.
    ///
    /// If an identical blob is already stored the staged file is removed and
    /// `AlreadyStored` returned; promotion is idempotent.
    pub fn promote_to_stored(&self, key: &BlobKey, staged: &Path) -> Result<PromoteOutcome> {
        let target = self.blob_path(key);

        let outcome = {
            let _guard = self.lock();

            if target.is_file() {
                fs::remove_file(staged)?;
                PromoteOutcome::AlreadyStored
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(staged, &target)?;
                PromoteOutcome::Stored
            }
        };

        if let Some(parent) = staged.parent() {
            prune_empty_dirs(parent, &self.uploading);
        }

        match outcome {
            PromoteOutcome::Stored => {
                log_store_info!(checksum = %key, path = %target.display(), "blob stored");
            }
            PromoteOutcome::AlreadyStored => {
                log_store_debug!(checksum = %key, "blob was already stored, discarded upload");
            }
        }
        Ok(outcome)
    }

    /// Promote a finished upload.
    pub fn promote(&self, mut staged: StagedUpload) -> Result<PromoteOutcome> {
        let key = staged.key().clone();
        let outcome = self.promote_to_stored(&key, staged.path())?;
        staged.mark_promoted();
        Ok(outcome)
    }

    /// Store `data` in one go.
    ///
    /// This is the synchronous path used by tools and tests; servers stream
    /// through [`BlobStore::open_for_upload`].
    pub fn store(&self, data: &[u8]) -> Result<(BlobKey, PromoteOutcome)> {
        let key = BlobKey::for_bytes(data);
        if self.exists(&key) {
            return Ok((key, PromoteOutcome::AlreadyStored));
        }

        let dir = self.uploading.join(key.upload_reldir());
        fs::create_dir_all(&dir)?;
        let staged = dir.join(key.upload_filename(&random_token(UPLOAD_TOKEN_LEN)));

        let written = write_new_file(&staged, data);
        if let Err(e) = written {
            let _ = fs::remove_file(&staged);
            return Err(e.into());
        }

        match self.promote_to_stored(&key, &staged) {
            Ok(outcome) => Ok((key, outcome)),
            Err(e) => {
                let _ = fs::remove_file(&staged);
                Err(e)
            }
        }
    }

    /// Store the contents of a file on disk.
    pub fn store_file<P: AsRef<Path>>(&self, path: P) -> Result<(BlobKey, PromoteOutcome)> {
        let data = fs::read(path)?;
        self.store(&data)
    }

    /// Mark a stored blob as referenced now.
    pub fn touch(&self, key: &BlobKey) -> Result<()> {
        touch::touch(&self.blob_path(key))?;
        Ok(())
    }

    /// Delete a stored blob unless it was modified at or after `cutoff`.
    ///
    /// Returns the number of bytes freed, or `None` when the blob was
    /// refreshed in the meantime and left alone. A blob that is already gone
    /// is reported as not-found.
    pub fn remove_if_older(&self, key: &BlobKey, cutoff: SystemTime) -> Result<Option<u64>> {
        let path = self.blob_path(key);
        let _guard = self.lock();

        let meta = fs::metadata(&path)?;
        if meta.modified()? >= cutoff {
            return Ok(None);
        }
        fs::remove_file(&path)?;
        if let Some(parent) = path.parent() {
            prune_empty_dirs(parent, &self.stored);
        }
        log_store_debug!(checksum = %key, "blob deleted");
        Ok(Some(meta.len()))
    }

    /// Walk the stored bin.
    ///
    /// Files that do not follow the address scheme are skipped.
    pub fn stored_blobs(&self) -> impl Iterator<Item = Result<StoredBlob>> + '_ {
        WalkDir::new(&self.stored)
            .min_depth(3)
            .max_depth(3)
            .into_iter()
            .filter_map(move |entry| {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => return Some(Err(io::Error::from(e).into())),
                };
                if !entry.file_type().is_file() {
                    return None;
                }
                let key = entry
                    .path()
                    .strip_prefix(&self.stored)
                    .ok()
                    .and_then(BlobKey::from_stored_relpath)?;
                Some(
                    entry
                        .metadata()
                        .map_err(io::Error::from)
                        .and_then(|meta| Ok((meta.len(), meta.modified()?)))
                        .map(|(len, modified)| StoredBlob {
                            key,
                            path: entry.into_path(),
                            len,
                            modified,
                        })
                        .map_err(Into::into),
                )
            })
    }

    /// Walk the uploading bin.
    pub fn upload_files(&self) -> impl Iterator<Item = Result<UploadEntry>> + '_ {
        WalkDir::new(&self.uploading)
            .min_depth(3)
            .max_depth(3)
            .into_iter()
            .filter_map(|entry| {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => return Some(Err(io::Error::from(e).into())),
                };
                let is_upload = entry.file_type().is_file()
                    && entry
                        .path()
                        .extension()
                        .is_some_and(|ext| ext == UPLOAD_EXTENSION);
                if !is_upload {
                    return None;
                }
                Some(
                    entry
                        .metadata()
                        .map_err(io::Error::from)
                        .and_then(|meta| Ok((meta.len(), meta.modified()?)))
                        .map(|(len, modified)| UploadEntry {
                            path: entry.into_path(),
                            len,
                            modified,
                        })
                        .map_err(Into::into),
                )
            })
    }

    /// Remove an upload file, typically an abandoned one.
    pub fn remove_upload_file(&self, path: &Path) -> Result<()> {
        if !path.starts_with(&self.uploading) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not in the uploading bin", path.display()),
            )
            .into());
        }
        fs::remove_file(path)?;
        if let Some(parent) = path.parent() {
            prune_empty_dirs(parent, &self.uploading);
        }
        Ok(())
    }

    /// Get statistics about the store.
    pub fn stats(&self) -> Result<CasStats> {
        let mut stats = CasStats::default();
        for blob in self.stored_blobs() {
            let blob = blob?;
            stats.blob_count += 1;
            stats.total_bytes += blob.len;
        }
        for upload in self.upload_files() {
            let upload = upload?;
            stats.upload_count += 1;
            stats.upload_bytes += upload.len;
        }
        Ok(stats)
    }
}

fn write_new_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file: File = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

/// Remove `dir` and its ancestors while they are empty, stopping at `root`.
///
/// Best effort: a non-empty or concurrently used directory simply stays.
fn prune_empty_dirs(dir: &Path, root: &Path) {
    let mut current = dir;
    while current != root && current.starts_with(root) {
        if fs::remove_dir(current).is_err() {
            return;
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store() -> (TempDir, BlobStore) {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::new(temp.path().join("file-store")).unwrap();
        (temp, store)
    }

    fn stage(store: &BlobStore, key: &BlobKey, data: &[u8]) -> PathBuf {
        let dir = store.uploading_path().join(key.upload_reldir());
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(key.upload_filename(&random_token(8)));
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_new_creates_bins() {
        let (_temp, store) = store();
        assert!(store.stored_path().is_dir());
        assert!(store.uploading_path().is_dir());
    }

    #[test]
    fn test_store_and_resolve() {
        let (_temp, store) = store();
        let (key, outcome) = store.store(b"Hello, depot!").unwrap();
        assert_eq!(outcome, PromoteOutcome::Stored);

        let (path, status) = store.resolve(&key, ResolveMode::StoredOnly).unwrap();
        assert_eq!(status, BlobStatus::Stored);
        assert_eq!(path, store.blob_path(&key));
        assert_eq!(fs::read(path).unwrap(), b"Hello, depot!");
        assert!(store.exists(&key));
    }

    #[test]
    fn test_deduplication() {
        let (_temp, store) = store();
        let (a, _) = store.store(b"same").unwrap();
        let (b, outcome) = store.store(b"same").unwrap();
        assert_eq!(a, b);
        assert_eq!(outcome, PromoteOutcome::AlreadyStored);
        assert_eq!(store.stats().unwrap().blob_count, 1);
    }

    #[test]
    fn test_resolve_absent() {
        let (_temp, store) = store();
        let key = BlobKey::for_bytes(b"never stored");
        let (path, status) = store.resolve(&key, ResolveMode::Everything).unwrap();
        assert_eq!(status, BlobStatus::Absent);
        assert_eq!(path, store.blob_path(&key));
        assert!(!store.exists(&key));
    }

    #[test]
    fn test_uploading_hidden_in_stored_only_mode() {
        let (_temp, store) = store();
        let key = BlobKey::for_bytes(b"partial");
        let staged = stage(&store, &key, b"par");

        let (_, status) = store.resolve(&key, ResolveMode::StoredOnly).unwrap();
        assert_eq!(status, BlobStatus::Absent);

        let (path, status) = store.resolve(&key, ResolveMode::Everything).unwrap();
        assert_eq!(status, BlobStatus::Uploading);
        assert_eq!(path, staged);
        assert_eq!(store.status(&key).unwrap(), BlobStatus::Uploading);
    }

    #[test]
    fn test_upload_of_other_size_is_not_reported() {
        let (_temp, store) = store();
        let key = BlobKey::for_bytes(b"four");
        let other = BlobKey::new(key.checksum(), 5).unwrap();
        stage(&store, &other, b"fiver");
        assert_eq!(store.status(&key).unwrap(), BlobStatus::Absent);
    }

    #[test]
    fn test_promote_moves_and_prunes_upload_dir() {
        let (_temp, store) = store();
        let data = b"promote me";
        let key = BlobKey::for_bytes(data);
        let staged = stage(&store, &key, data);

        let outcome = store.promote_to_stored(&key, &staged).unwrap();
        assert_eq!(outcome, PromoteOutcome::Stored);
        assert!(!staged.exists());
        assert!(!staged.parent().unwrap().exists());
        assert!(store.uploading_path().is_dir());
        assert_eq!(fs::read(store.blob_path(&key)).unwrap(), data);
    }

    #[test]
    fn test_promote_twice_is_noop() {
        let (_temp, store) = store();
        let data = b"twice";
        let key = BlobKey::for_bytes(data);

        let first = stage(&store, &key, data);
        let second = stage(&store, &key, data);
        assert_eq!(store.promote_to_stored(&key, &first).unwrap(), PromoteOutcome::Stored);
        assert_eq!(
            store.promote_to_stored(&key, &second).unwrap(),
            PromoteOutcome::AlreadyStored
        );
        assert!(!second.exists());
        assert_eq!(fs::read(store.blob_path(&key)).unwrap(), data);
    }

    #[test]
    fn test_promote_missing_staged_file_keeps_error_kind() {
        let (_temp, store) = store();
        let key = BlobKey::for_bytes(b"ghost");
        let err = store
            .promote_to_stored(&key, &store.uploading_path().join("nope.tmp"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_touch_refreshes_mtime() {
        let (_temp, store) = store();
        let (key, _) = store.store(b"touch me").unwrap();
        let old = FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_times(store.blob_path(&key), old, old).unwrap();

        store.touch(&key).unwrap();

        let mtime = fs::metadata(store.blob_path(&key)).unwrap().modified().unwrap();
        assert!(mtime > SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000));
    }

    #[test]
    fn test_touch_absent_blob_is_not_found() {
        let (_temp, store) = store();
        let err = store.touch(&BlobKey::for_bytes(b"nothing")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_remove_if_older() {
        let (_temp, store) = store();
        let (key, _) = store.store(b"old blob").unwrap();
        let path = store.blob_path(&key);
        let shard = path.parent().unwrap().parent().unwrap().to_path_buf();

        // fresh blob survives
        let cutoff = SystemTime::now() - Duration::from_secs(3600);
        assert_eq!(store.remove_if_older(&key, cutoff).unwrap(), None);
        assert!(path.exists());

        let old = FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_times(&path, old, old).unwrap();
        assert_eq!(store.remove_if_older(&key, cutoff).unwrap(), Some(8));
        assert!(!path.exists());
        assert!(!shard.exists());
        assert!(store.stored_path().is_dir());

        assert!(store.remove_if_older(&key, cutoff).unwrap_err().is_not_found());
    }

    #[test]
    fn test_stored_blobs_skips_foreign_files() {
        let (_temp, store) = store();
        let (a, _) = store.store(b"one").unwrap();
        let (b, _) = store.store(b"two").unwrap();
        let stray = store.stored_path().join("zz").join("not-a-checksum");
        fs::create_dir_all(&stray).unwrap();
        fs::write(stray.join("1.blob"), b"x").unwrap();

        let mut keys: Vec<BlobKey> = store
            .stored_blobs()
            .map(|b| b.unwrap().key)
            .collect();
        keys.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_upload_files_and_removal() {
        let (_temp, store) = store();
        let key = BlobKey::for_bytes(b"abandoned");
        let staged = stage(&store, &key, b"aban");

        let uploads: Vec<UploadEntry> = store.upload_files().map(|u| u.unwrap()).collect();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].path, staged);
        assert_eq!(uploads[0].len, 4);

        store.remove_upload_file(&staged).unwrap();
        assert_eq!(store.upload_files().count(), 0);
        assert!(store.uploading_path().is_dir());
    }

    #[test]
    fn test_remove_upload_file_outside_bin_refused() {
        let (temp, store) = store();
        let outside = temp.path().join("precious.txt");
        fs::write(&outside, b"keep").unwrap();
        assert!(store.remove_upload_file(&outside).is_err());
        assert!(outside.exists());
    }

    #[test]
    fn test_stats() {
        let (_temp, store) = store();
        store.store(b"12345").unwrap();
        store.store(b"1234567890").unwrap();
        let key = BlobKey::for_bytes(b"in flight");
        stage(&store, &key, b"in");

        let stats = store.stats().unwrap();
        assert_eq!(stats.blob_count, 2);
        assert_eq!(stats.total_bytes, 15);
        assert_eq!(stats.avg_blob_size(), 7);
        assert_eq!(stats.upload_count, 1);
        assert_eq!(stats.upload_bytes, 2);
    }

    #[tokio::test]
    async fn test_streaming_upload() {
        let (_temp, store) = store();
        let data = vec![42u8; 100_000];
        let key = BlobKey::for_bytes(&data);

        let mut upload = store.open_for_upload(&key).await.unwrap();
        assert_eq!(store.status(&key).unwrap(), BlobStatus::Uploading);
        for chunk in data.chunks(4096) {
            upload.write(chunk).await.unwrap();
        }
        let staged = upload.finish().await.unwrap();
        assert_eq!(store.promote(staged).unwrap(), PromoteOutcome::Stored);

        assert_eq!(store.status(&key).unwrap(), BlobStatus::Stored);
        assert_eq!(fs::read(store.blob_path(&key)).unwrap(), data);
        assert_eq!(store.upload_files().count(), 0);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_nothing() {
        let (_temp, store) = store();
        let key = BlobKey::for_bytes(b"expected");

        let mut upload = store.open_for_upload(&key).await.unwrap();
        upload.write(b"xpected!").await.unwrap();
        let err = upload.finish().await.unwrap_err();
        assert!(matches!(err, crate::CasError::ChecksumMismatch { .. }));

        assert_eq!(store.status(&key).unwrap(), BlobStatus::Absent);
        assert_eq!(store.upload_files().count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_write_rejected() {
        let (_temp, store) = store();
        let key = BlobKey::for_bytes(b"tiny");

        let mut upload = store.open_for_upload(&key).await.unwrap();
        let err = upload.write(b"far too big").await.unwrap_err();
        assert!(matches!(err, crate::CasError::SizeMismatch { .. }));
        drop(upload);
        assert_eq!(store.upload_files().count(), 0);
    }

    #[tokio::test]
    async fn test_short_upload_rejected() {
        let (_temp, store) = store();
        let key = BlobKey::for_bytes(b"complete");

        let mut upload = store.open_for_upload(&key).await.unwrap();
        upload.write(b"comp").await.unwrap();
        assert!(matches!(
            upload.finish().await,
            Err(crate::CasError::SizeMismatch { actual: 4, .. })
        ));
        assert_eq!(store.upload_files().count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_staged_upload_is_removed() {
        let (_temp, store) = store();
        let key = BlobKey::for_bytes(b"dropped");

        let mut upload = store.open_for_upload(&key).await.unwrap();
        upload.write(b"dropped").await.unwrap();
        let staged = upload.finish().await.unwrap();
        let path = staged.path().to_path_buf();
        assert!(path.exists());
        drop(staged);
        assert!(!path.exists());
    }
}
