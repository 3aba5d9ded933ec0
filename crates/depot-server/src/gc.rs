//! # Garbage Collection
//!
//! Deletes stored blobs that have not been referenced for longer than the
//! retention window.
//!
//! A blob is deleted only when all of these hold:
//! - its mtime (last touch) is older than `now - max_age`
//! - no symlink under the checkout root or the extra checkout directories
//!   points at it
//! - its mtime is still old when it is about to be removed
//!
//! Live checkouts stay safe as long as they are refreshed (re-checked out,
//! which touches their blobs) more often than `max_age`.
//!
//! One window remains: a checkout that links a cold blob after the symlink
//! scan, but whose background touch has not landed before the final mtime
//! check, loses that blob and is left with a dangling link. `max_age` must
//! therefore be far larger than the time any blob spends between falling
//! out of use and being checked out again.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use depot_cas::{BlobStore, StoredBlob};
use depot_config::{log_gc_debug, log_gc_info, log_gc_warn, Config};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Settings of one sweep.
#[derive(Debug, Clone)]
pub struct GcOptions {
    /// Blobs untouched for longer than this are candidates.
    pub max_age: Duration,
    /// Trees whose symlinks keep blobs alive.
    pub checkout_dirs: Vec<PathBuf>,
    /// Report what would be deleted without deleting it.
    pub dry_run: bool,
}

impl GcOptions {
    pub fn from_config(config: &Config) -> Self {
        let mut checkout_dirs = vec![config.checkout_path()];
        checkout_dirs.extend(config.gc.extra_checkout_dirs());
        Self {
            max_age: config.gc.max_age(),
            checkout_dirs,
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Stored blobs looked at
    pub checked: u64,
    /// Blobs older than the retention window
    pub old: u64,
    /// Old blobs kept because a checkout links to them or they were touched
    /// during the sweep
    pub referenced: u64,
    /// Blobs deleted (or that would be, in a dry run)
    pub deleted: u64,
    pub bytes_deleted: u64,
    /// Blobs or upload files that could not be inspected or removed
    pub failed: u64,
    /// Abandoned upload files removed
    pub stale_uploads: u64,
}

/// Sweeps one blob store.
#[derive(Debug, Clone)]
pub struct Reclaimer {
    store: BlobStore,
    options: GcOptions,
}

impl Reclaimer {
    pub fn new(store: BlobStore, options: GcOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &GcOptions {
        &self.options
    }

    /// Run one sweep. Problems with single blobs are logged and counted,
    /// never fatal.
    pub fn run(&self) -> GcStats {
        let started = std::time::Instant::now();
        let cutoff = SystemTime::now()
            .checked_sub(self.options.max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut stats = GcStats::default();

        log_gc_info!(
            max_age = ?self.options.max_age,
            dry_run = self.options.dry_run,
            "starting garbage collection"
        );

        let mut candidates = self.find_old_blobs(cutoff, &mut stats);
        if !candidates.is_empty() {
            for dir in &self.options.checkout_dirs {
                self.remove_linked(dir, &mut candidates, &mut stats);
            }
        }
        self.delete_candidates(candidates, cutoff, &mut stats);
        self.remove_stale_uploads(cutoff, &mut stats);

        log_gc_info!(
            checked = stats.checked,
            old = stats.old,
            referenced = stats.referenced,
            deleted = stats.deleted,
            bytes_deleted = stats.bytes_deleted,
            failed = stats.failed,
            stale_uploads = stats.stale_uploads,
            dry_run = self.options.dry_run,
            duration = ?started.elapsed(),
            "garbage collection finished"
        );
        stats
    }

    /// Old blobs, keyed by absolute path so link targets can be matched.
    fn find_old_blobs(&self, cutoff: SystemTime, stats: &mut GcStats) -> HashMap<PathBuf, StoredBlob> {
        let mut candidates = HashMap::new();
        for blob in self.store.stored_blobs() {
            let blob = match blob {
                Ok(blob) => blob,
                Err(e) => {
                    log_gc_warn!(error = %e, "error walking blob store");
                    stats.failed += 1;
                    continue;
                }
            };
            stats.checked += 1;
            if blob.modified < cutoff {
                stats.old += 1;
                candidates.insert(absolute(&blob.path), blob);
            }
        }
        log_gc_debug!(checked = stats.checked, old = stats.old, "found old blobs");
        candidates
    }

    fn remove_linked(&self, dir: &Path, candidates: &mut HashMap<PathBuf, StoredBlob>, stats: &mut GcStats) {
        if !dir.is_dir() {
            log_gc_debug!(dir = %dir.display(), "checkout directory does not exist, skipping");
            return;
        }

        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log_gc_warn!(dir = %dir.display(), error = %e, "error walking checkout directory");
                    continue;
                }
            };
            if !entry.path_is_symlink() {
                continue;
            }

            let target = match fs::read_link(entry.path()) {
                Ok(target) => target,
                Err(e) => {
                    log_gc_warn!(link = %entry.path().display(), error = %e, "unable to read symlink");
                    continue;
                }
            };
            let target = match entry.path().parent() {
                Some(parent) if target.is_relative() => parent.join(target),
                _ => target,
            };

            if candidates.remove(&absolute(&target)).is_some() {
                stats.referenced += 1;
                if candidates.is_empty() {
                    return;
                }
            }
        }
    }

    fn delete_candidates(
        &self,
        candidates: HashMap<PathBuf, StoredBlob>,
        cutoff: SystemTime,
        stats: &mut GcStats,
    ) {
        for blob in candidates.into_values() {
            if self.options.dry_run {
                log_gc_info!(checksum = %blob.key, bytes = blob.len, "would delete blob");
                stats.deleted += 1;
                stats.bytes_deleted += blob.len;
                continue;
            }

            match self.store.remove_if_older(&blob.key, cutoff) {
                Ok(Some(bytes)) => {
                    log_gc_debug!(checksum = %blob.key, bytes, "deleted blob");
                    stats.deleted += 1;
                    stats.bytes_deleted += bytes;
                }
                Ok(None) => {
                    log_gc_debug!(checksum = %blob.key, "blob was touched during the sweep, keeping it");
                    stats.referenced += 1;
                }
                Err(e) if e.is_not_found() => {
                    log_gc_debug!(checksum = %blob.key, "blob already gone");
                }
                Err(e) => {
                    log_gc_warn!(checksum = %blob.key, error = %e, "unable to delete blob");
                    stats.failed += 1;
                }
            }
        }
    }

    fn remove_stale_uploads(&self, cutoff: SystemTime, stats: &mut GcStats) {
        for upload in self.store.upload_files() {
            let upload = match upload {
                Ok(upload) => upload,
                Err(e) => {
                    log_gc_warn!(error = %e, "error walking upload directory");
                    stats.failed += 1;
                    continue;
                }
            };
            if upload.modified >= cutoff {
                continue;
            }

            if self.options.dry_run {
                log_gc_info!(path = %upload.path.display(), "would remove abandoned upload");
                stats.stale_uploads += 1;
                continue;
            }
            match self.store.remove_upload_file(&upload.path) {
                Ok(()) => stats.stale_uploads += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    log_gc_warn!(path = %upload.path.display(), error = %e, "unable to remove abandoned upload");
                    stats.failed += 1;
                }
            }
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Run a sweep every `period` until `cancel` fires. The first sweep starts
/// right away.
pub async fn run_periodic(reclaimer: Reclaimer, period: Duration, cancel: CancellationToken) {
    if period.is_zero() {
        log_gc_warn!("zero garbage collection period, not starting");
        return;
    }
    log_gc_info!(period = ?period, max_age = ?reclaimer.options.max_age, "periodic garbage collection started");

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let sweep = reclaimer.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || sweep.run()).await {
            log_gc_warn!(error = %e, "garbage collection task failed");
        }
    }

    log_gc_debug!("periodic garbage collection stopped");
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Format number with comma separators
pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 bytes");
        assert_eq!(format_bytes(1023), "1023 bytes");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
    }

    #[test]
    fn test_options_include_extra_dirs() {
        let mut config = Config::default();
        config.storage.root = PathBuf::from("/srv/depot");
        config.gc.extra_checkout_dirs = vec![PathBuf::from("/mnt/old-jobs")];

        let options = GcOptions::from_config(&config).dry_run(true);
        assert_eq!(
            options.checkout_dirs,
            vec![PathBuf::from("/srv/depot/jobs"), PathBuf::from("/mnt/old-jobs")]
        );
        assert!(options.dry_run);
        assert_eq!(options.max_age, config.gc.max_age());
    }
}
