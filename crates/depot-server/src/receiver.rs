//! Upload receiving: deduplication, deferral and early termination.
//!
//! Uploads of the same blob within this process are tracked in a map of
//! watch channels. Whoever promotes the blob first flips the channel to
//! `true`, which stops every other uploader of that blob and wakes callers
//! that chose to wait.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use depot_cas::{BlobKey, BlobStatus, BlobStore, CasError, PromoteOutcome};
use depot_config::{log_server_debug, log_server_info};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;

use crate::Result;

/// Read buffer size for upload bodies.
const CHUNK_SIZE: usize = 64 * 1024;

/// How an upload call ended. All variants mean the blob is now stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// This call's bytes became the stored blob.
    Stored,
    /// The blob was stored before this call started.
    AlreadyStored,
    /// Another upload finished first; this call's bytes were discarded.
    CompletedByOther,
}

struct InFlight {
    done: watch::Sender<bool>,
    uploaders: usize,
}

/// Receives blob uploads into a [`BlobStore`].
pub struct UploadReceiver {
    store: BlobStore,
    in_flight: DashMap<BlobKey, InFlight>,
    defer_timeout: Duration,
}

/// Unregisters an uploader when dropped, whatever way the upload ended.
struct Registration<'a> {
    receiver: &'a UploadReceiver,
    key: BlobKey,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if let Entry::Occupied(mut entry) = self.receiver.in_flight.entry(self.key.clone()) {
            entry.get_mut().uploaders -= 1;
            if entry.get().uploaders == 0 {
                entry.remove();
            }
        }
    }
}

enum Step {
    OtherFinished,
    Read(std::io::Result<usize>),
}

impl UploadReceiver {
    pub fn new(store: BlobStore, defer_timeout: Duration) -> Self {
        Self {
            store,
            in_flight: DashMap::new(),
            defer_timeout,
        }
    }

    /// Number of blobs currently being uploaded through this receiver.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Receive `body` as the contents of `key`.
    ///
    /// With `can_defer`, a call that finds the same blob already being
    /// uploaded here waits (up to the configured timeout) for that upload
    /// instead of sending the bytes again. `original_filename` is only used
    /// for logging.
    pub async fn receive<R>(
        &self,
        key: &BlobKey,
        body: R,
        can_defer: bool,
        original_filename: &str,
    ) -> Result<UploadOutcome>
    where
        R: AsyncRead + Unpin,
    {
        log_server_debug!(checksum = %key, filename = %original_filename, can_defer, "upload requested");

        let status = self.store.status(key)?;
        if status == BlobStatus::Stored {
            log_server_debug!(checksum = %key, "blob already stored, skipping upload");
            return Ok(UploadOutcome::AlreadyStored);
        }

        if can_defer {
            if let Some(outcome) = self.defer_to_other(key).await {
                return Ok(outcome);
            }
        }

        self.upload(key, body, original_filename).await
    }

    /// Wait for an in-process upload of `key`, if there is one.
    ///
    /// Returns `None` when the caller should upload itself.
    async fn defer_to_other(&self, key: &BlobKey) -> Option<UploadOutcome> {
        let mut done = self.in_flight.get(key)?.done.subscribe();

        log_server_info!(checksum = %key, "identical upload in progress, waiting for it");
        match tokio::time::timeout(self.defer_timeout, done.wait_for(|stored| *stored)).await {
            Ok(Ok(_)) => {}
            // Every other uploader gave up.
            Ok(Err(_)) => return None,
            Err(_) => {
                log_server_info!(checksum = %key, timeout = ?self.defer_timeout, "waited too long for identical upload");
                return None;
            }
        }

        self.store
            .exists(key)
            .then_some(UploadOutcome::CompletedByOther)
    }

    fn register(&self, key: &BlobKey) -> (Registration<'_>, watch::Receiver<bool>) {
        let done = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().uploaders += 1;
                entry.get().done.subscribe()
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(false);
                entry.insert(InFlight {
                    done: tx,
                    uploaders: 1,
                });
                rx
            }
        };
        let registration = Registration {
            receiver: self,
            key: key.clone(),
        };
        (registration, done)
    }

    fn announce_stored(&self, key: &BlobKey) {
        if let Some(entry) = self.in_flight.get(key) {
            entry.done.send_replace(true);
        }
    }

    async fn upload<R>(&self, key: &BlobKey, mut body: R, original_filename: &str) -> Result<UploadOutcome>
    where
        R: AsyncRead + Unpin,
    {
        let (_registration, mut done) = self.register(key);
        let mut file = self.store.open_for_upload(key).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];

        loop {
            let step = tokio::select! {
                biased;
                Ok(_) = done.wait_for(|stored| *stored) => Step::OtherFinished,
                read = body.read(&mut buf) => Step::Read(read),
            };

            match step {
                Step::OtherFinished => {
                    log_server_info!(
                        checksum = %key,
                        filename = %original_filename,
                        received = file.bytes_written(),
                        "identical upload finished first, stopping this one"
                    );
                    // Dropping the file removes the partial upload.
                    return Ok(UploadOutcome::CompletedByOther);
                }
                Step::Read(read) => {
                    let n = read.map_err(CasError::Io)?;
                    if n == 0 {
                        break;
                    }
                    file.write(&buf[..n]).await?;
                }
            }
        }

        let staged = file.finish().await?;
        let outcome = self.store.promote(staged)?;
        self.announce_stored(key);

        match outcome {
            PromoteOutcome::Stored => {
                log_server_info!(checksum = %key, filename = %original_filename, "upload stored");
                Ok(UploadOutcome::Stored)
            }
            PromoteOutcome::AlreadyStored => Ok(UploadOutcome::CompletedByOther),
        }
    }
}
