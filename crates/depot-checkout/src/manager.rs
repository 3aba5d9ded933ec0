//! Checkout allocation, linking and erasure.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use depot_cas::address::random_token;
use depot_cas::{touch, BlobKey, BlobStatus, BlobStore, ResolveMode};
use depot_config::path::is_within_directory;
use depot_config::{log_checkout_debug, log_checkout_error, log_checkout_info, log_checkout_warn};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::path::{validate_checkout_path, validate_file_path};
use crate::{CheckoutError, CheckoutRequest, Result, MAX_ALLOCATION_ATTEMPTS};

/// Length of the suffix that disambiguates colliding checkout names.
const SUFFIX_LEN: usize = 4;

/// Creates and removes checkouts under one checkout root.
#[derive(Debug)]
pub struct CheckoutManager {
    store: BlobStore,
    root: PathBuf,
    /// Held only around the exists-check and mkdir of a new checkout.
    allocation_lock: Mutex<()>,
    /// Background touches, drained by [`CheckoutManager::shutdown`].
    touches: TaskTracker,
}

impl CheckoutManager {
    /// Create a manager for `root`, creating the directory if needed.
    pub fn new(store: BlobStore, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| CheckoutError::io(&root, e))?;
        log_checkout_debug!(root = %root.display(), "checkout manager ready");

        Ok(Self {
            store,
            root,
            allocation_lock: Mutex::new(()),
            touches: TaskTracker::new(),
        })
    }

    pub fn from_config(config: &depot_config::Config, store: BlobStore) -> Result<Self> {
        Self::new(store, config.checkout_path())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    /// Absolute path of a checkout ID.
    pub fn checkout_dir(&self, checkout_id: &str) -> PathBuf {
        self.root.join(checkout_id)
    }

    /// Allocate a fresh directory for `requested`.
    ///
    /// Returns the checkout ID actually used: `requested` itself, or
    /// `requested-xxxx` when that name was taken. No two calls from this
    /// process get the same ID.
    pub fn prepare_checkout(&self, requested: &str) -> Result<String> {
        validate_checkout_path(requested)?;

        let _guard = self
            .allocation_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut candidate = requested.to_string();
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let dir = self.root.join(&candidate);
            if let Some(parent) = dir.parent() {
                fs::create_dir_all(parent).map_err(|e| CheckoutError::io(parent, e))?;
            }

            match fs::create_dir(&dir) {
                Ok(()) => {
                    log_checkout_debug!(checkout = %candidate, "allocated checkout directory");
                    return Ok(candidate);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let next = format!("{requested}-{}", random_token(SUFFIX_LEN));
                    log_checkout_debug!(taken = %candidate, next = %next, "checkout path exists, trying another");
                    candidate = next;
                }
                Err(e) => return Err(CheckoutError::io(&dir, e)),
            }
        }

        log_checkout_error!(requested = %requested, attempts = MAX_ALLOCATION_ATTEMPTS, "could not allocate checkout directory");
        Err(CheckoutError::AllocationExhausted {
            path: requested.to_string(),
            attempts: MAX_ALLOCATION_ATTEMPTS,
        })
    }

    /// Symlink `checkout_dir/relpath` to `blob` and touch the blob.
    ///
    /// An existing link to the same target counts as success. The touch runs
    /// in the background; its failure is logged and otherwise ignored.
    pub fn link_into_checkout(&self, blob: &Path, checkout_dir: &Path, relpath: &str) -> Result<()> {
        let target = std::path::absolute(blob).map_err(|e| CheckoutError::io(blob, e))?;
        let link = checkout_dir.join(relpath);

        let mut created_parent = false;
        loop {
            match symlink(&target, &link) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::NotFound && !created_parent => {
                    // Parent directories are only made once a link needs them.
                    if let Some(parent) = link.parent() {
                        fs::create_dir_all(parent).map_err(|e| CheckoutError::io(parent, e))?;
                    }
                    created_parent = true;
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    self.check_existing_link(&link, &target)?;
                    break;
                }
                Err(e) => return Err(CheckoutError::io(&link, e)),
            }
        }

        self.spawn_touch(target);
        Ok(())
    }

    fn check_existing_link(&self, link: &Path, wanted: &Path) -> Result<()> {
        let existing = fs::read_link(link).map_err(|e| CheckoutError::io(link, e))?;
        if existing == wanted {
            log_checkout_warn!(link = %link.display(), "link already exists with the same target");
            return Ok(());
        }

        log_checkout_error!(
            link = %link.display(),
            existing = %existing.display(),
            wanted = %wanted.display(),
            "link already exists and points elsewhere"
        );
        Err(CheckoutError::LinkConflict {
            link: link.to_path_buf(),
            existing,
            wanted: wanted.to_path_buf(),
        })
    }

    fn spawn_touch(&self, blob: PathBuf) {
        let task = move || {
            if let Err(e) = touch::touch(&blob) {
                log_checkout_warn!(blob = %blob.display(), error = %e, "unable to touch blob");
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                self.touches.spawn_blocking_on(task, &handle);
            }
            // No runtime to hand the work to; touch inline.
            Err(_) => task(),
        }
    }

    /// Create a checkout of every file in `request`.
    ///
    /// All files must already be stored. On any failure after the directory
    /// was allocated, the directory is removed again before the error is
    /// returned. `cancel` is honored while blobs are being resolved.
    pub async fn checkout(&self, request: &CheckoutRequest, cancel: &CancellationToken) -> Result<String> {
        validate_checkout_path(&request.checkout_path)?;
        let mut files = Vec::with_capacity(request.files.len());
        for file in &request.files {
            validate_file_path(&file.path)?;
            files.push((file.key()?, file.path.as_str()));
        }

        let checkout_id = self.prepare_checkout(&request.checkout_path)?;
        let dir = self.root.join(&checkout_id);

        match self.populate(&dir, &files, cancel).await {
            Ok(()) => {
                log_checkout_info!(checkout = %checkout_id, files = files.len(), "checkout created");
                Ok(checkout_id)
            }
            Err(e) => {
                log_checkout_debug!(checkout = %checkout_id, error = %e, "checkout failed, removing it");
                self.remove_checkout_dir(&dir);
                Err(e)
            }
        }
    }

    async fn populate(
        &self,
        dir: &Path,
        files: &[(BlobKey, &str)],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut resolved = Vec::with_capacity(files.len());
        let mut missing = Vec::new();

        for (key, relpath) in files {
            if cancel.is_cancelled() {
                return Err(CheckoutError::Cancelled);
            }
            let (blob, status) = self.store.resolve(key, ResolveMode::StoredOnly)?;
            if status == BlobStatus::Stored {
                resolved.push((blob, *relpath));
            } else {
                missing.push(key.clone());
            }
            tokio::task::yield_now().await;
        }

        if !missing.is_empty() {
            log_checkout_warn!(missing = missing.len(), "checkout requests files that are not stored");
            return Err(CheckoutError::MissingFiles { missing });
        }

        for (blob, relpath) in &resolved {
            self.link_into_checkout(blob, dir, relpath)?;
        }
        Ok(())
    }

    /// Remove the checkout `checkout_id` and, if now empty, its parent.
    pub fn erase_checkout(&self, checkout_id: &str) -> Result<()> {
        validate_checkout_path(checkout_id)?;
        let dir = self.root.join(checkout_id);

        match fs::symlink_metadata(&dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(CheckoutError::NotFound(checkout_id.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CheckoutError::NotFound(checkout_id.to_string()))
            }
            Err(e) => return Err(CheckoutError::io(&dir, e)),
        }

        if !is_within_directory(&dir, &self.root) || same_file(&dir, &self.root) {
            log_checkout_error!(checkout = %checkout_id, "refusing to erase outside the checkout root");
            return Err(CheckoutError::invalid(checkout_id, "outside the checkout root"));
        }

        fs::remove_dir_all(&dir).map_err(|e| CheckoutError::io(&dir, e))?;
        self.prune_parent(&dir);

        log_checkout_info!(checkout = %checkout_id, "checkout erased");
        Ok(())
    }

    /// Best-effort removal of a partially created checkout.
    fn remove_checkout_dir(&self, dir: &Path) {
        if let Err(e) = fs::remove_dir_all(dir) {
            if e.kind() != io::ErrorKind::NotFound {
                log_checkout_error!(path = %dir.display(), error = %e, "unable to remove failed checkout");
                return;
            }
        }
        self.prune_parent(dir);
    }

    fn prune_parent(&self, dir: &Path) {
        let Some(parent) = dir.parent() else {
            return;
        };
        if parent == self.root || !parent.starts_with(&self.root) {
            return;
        }
        if fs::remove_dir(parent).is_ok() {
            log_checkout_debug!(path = %parent.display(), "removed empty checkout parent");
        }
    }

    /// Wait until every background touch has finished.
    pub async fn shutdown(&self) {
        self.touches.close();
        log_checkout_debug!(pending = self.touches.len(), "waiting for blob touches");
        self.touches.wait().await;
    }

    /// Number of background touches still running.
    pub fn pending_touches(&self) -> usize {
        self.touches.len()
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (TempDir, CheckoutManager) {
        let temp = TempDir::new().unwrap();
        let store = BlobStore::new(temp.path().join("file-store")).unwrap();
        let manager = CheckoutManager::new(store, temp.path().join("jobs")).unwrap();
        (temp, manager)
    }

    #[test]
    fn test_prepare_returns_requested_name_first() {
        let (_temp, manager) = manager();
        assert_eq!(manager.prepare_checkout("job1").unwrap(), "job1");
        assert!(manager.root().join("job1").is_dir());
    }

    #[test]
    fn test_prepare_suffixes_taken_names() {
        let (_temp, manager) = manager();
        manager.prepare_checkout("job1").unwrap();
        let second = manager.prepare_checkout("job1").unwrap();
        assert_ne!(second, "job1");
        assert!(second.starts_with("job1-"));
        assert_eq!(second.len(), "job1-".len() + SUFFIX_LEN);
    }

    #[test]
    fn test_prepare_nested_path() {
        let (_temp, manager) = manager();
        let id = manager.prepare_checkout("a3/a3ef-job").unwrap();
        assert_eq!(id, "a3/a3ef-job");
        assert!(manager.root().join("a3").join("a3ef-job").is_dir());
    }

    #[test]
    fn test_prepare_invalid_path_has_no_side_effects() {
        let (_temp, manager) = manager();
        let err = manager.prepare_checkout("../outside").unwrap_err();
        assert!(matches!(err, CheckoutError::InvalidPath { .. }));
        assert_eq!(fs::read_dir(manager.root()).unwrap().count(), 0);
    }

    #[test]
    fn test_link_creates_parent_lazily() {
        let (_temp, manager) = manager();
        let (key, _) = manager.store().store(b"texture").unwrap();
        let id = manager.prepare_checkout("job").unwrap();
        let dir = manager.checkout_dir(&id);

        manager
            .link_into_checkout(&manager.store().blob_path(&key), &dir, "tex/wood/oak.png")
            .unwrap();

        let link = dir.join("tex/wood/oak.png");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&link).unwrap(), b"texture");
        assert!(fs::read_link(&link).unwrap().is_absolute());
    }

    #[test]
    fn test_relink_same_target_is_ok() {
        let (_temp, manager) = manager();
        let (key, _) = manager.store().store(b"same").unwrap();
        let blob = manager.store().blob_path(&key);
        let dir = manager.checkout_dir(&manager.prepare_checkout("job").unwrap());

        manager.link_into_checkout(&blob, &dir, "a.txt").unwrap();
        manager.link_into_checkout(&blob, &dir, "a.txt").unwrap();
        assert_eq!(fs::read(dir.join("a.txt")).unwrap(), b"same");
    }

    #[test]
    fn test_relink_other_target_conflicts() {
        let (_temp, manager) = manager();
        let (a, _) = manager.store().store(b"first").unwrap();
        let (b, _) = manager.store().store(b"second").unwrap();
        let dir = manager.checkout_dir(&manager.prepare_checkout("job").unwrap());

        manager
            .link_into_checkout(&manager.store().blob_path(&a), &dir, "a.txt")
            .unwrap();
        let err = manager
            .link_into_checkout(&manager.store().blob_path(&b), &dir, "a.txt")
            .unwrap_err();
        assert!(matches!(err, CheckoutError::LinkConflict { .. }));
        assert_eq!(fs::read(dir.join("a.txt")).unwrap(), b"first");
    }

    #[test]
    fn test_erase_missing_checkout() {
        let (_temp, manager) = manager();
        assert!(matches!(
            manager.erase_checkout("nope"),
            Err(CheckoutError::NotFound(_))
        ));
    }

    #[test]
    fn test_erase_prunes_empty_parent_but_not_root() {
        let (_temp, manager) = manager();
        let id = manager.prepare_checkout("shard/job").unwrap();
        manager.erase_checkout(&id).unwrap();
        assert!(!manager.root().join("shard").exists());
        assert!(manager.root().is_dir());

        let id = manager.prepare_checkout("top").unwrap();
        manager.erase_checkout(&id).unwrap();
        assert!(manager.root().is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn test_erase_refuses_symlinked_escape() {
        let (temp, manager) = manager();
        let outside = temp.path().join("outside");
        fs::create_dir_all(outside.join("victim")).unwrap();
        std::os::unix::fs::symlink(&outside, manager.root().join("escape")).unwrap();

        let err = manager.erase_checkout("escape/victim").unwrap_err();
        assert!(matches!(err, CheckoutError::InvalidPath { .. }));
        assert!(outside.join("victim").is_dir());
    }
}
