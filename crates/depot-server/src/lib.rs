//! # depot-server
//!
//! Ties the blob store, the checkout manager and the garbage collector
//! together behind the operations a transport layer needs:
//!
//! - [`Server::report_missing`]: which required blobs still need uploading
//! - [`Server::upload`]: receive one blob
//! - [`Server::checkout`] / [`Server::erase_checkout`]
//! - [`Server::file_status`]: poll a single blob
//!
//! [`Server::start`] launches the periodic garbage collector and
//! [`Server::shutdown`] stops it and waits for background blob touches.

pub mod gc;
pub mod receiver;

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use depot_cas::{BlobKey, BlobStatus, BlobStore, CasError, CasStats};
use depot_checkout::{CheckoutError, CheckoutManager, CheckoutRequest};
use depot_config::{log_gc_debug, log_gc_warn, log_server_debug, log_server_info, Config, ConfigError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use gc::{GcOptions, GcStats, Reclaimer};
pub use receiver::{UploadOutcome, UploadReceiver};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("blob storage is disabled in the configuration")]
    Disabled,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("blob store error: {0}")]
    Store(#[from] CasError),

    #[error(transparent)]
    Checkout(#[from] CheckoutError),
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Status of a blob as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Unknown,
    Uploading,
    Stored,
}

impl From<BlobStatus> for FileStatus {
    fn from(status: BlobStatus) -> Self {
        match status {
            BlobStatus::Absent => FileStatus::Unknown,
            BlobStatus::Uploading => FileStatus::Uploading,
            BlobStatus::Stored => FileStatus::Stored,
        }
    }
}

/// A required blob that is not stored yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingBlob {
    #[serde(flatten)]
    pub key: BlobKey,
    pub status: FileStatus,
}

/// The files a job needs, as sent by clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requirements {
    pub files: Vec<BlobKey>,
}

/// The storage server.
pub struct Server {
    config: Config,
    store: BlobStore,
    checkouts: CheckoutManager,
    receiver: UploadReceiver,
    shutdown: CancellationToken,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Open the store and checkout area described by `config`.
    pub fn new(config: &Config) -> Result<Self> {
        if !config.storage.enabled {
            return Err(ServerError::Disabled);
        }
        config.validate()?;

        let store = BlobStore::from_config(config)?;
        let checkouts = CheckoutManager::from_config(config, store.clone())?;
        let receiver = UploadReceiver::new(store.clone(), config.upload.defer_timeout());

        log_server_info!(
            store = %store.base_path().display(),
            checkouts = %checkouts.root().display(),
            "storage server ready"
        );
        Ok(Self {
            config: config.clone(),
            store,
            checkouts,
            receiver,
            shutdown: CancellationToken::new(),
            gc_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    pub fn checkouts(&self) -> &CheckoutManager {
        &self.checkouts
    }

    /// Start background work. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let gc = &self.config.gc;
        if gc.silently_disable {
            log_gc_debug!("garbage collection disabled");
            return;
        }
        if gc.period_secs == 0 {
            log_gc_warn!("garbage collection disabled, the blob store will grow without bound");
            return;
        }

        let mut task = self.gc_task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            log_server_debug!("background tasks already running");
            return;
        }

        let reclaimer = Reclaimer::new(self.store.clone(), GcOptions::from_config(&self.config));
        *task = Some(tokio::spawn(gc::run_periodic(
            reclaimer,
            gc.period(),
            self.shutdown.child_token(),
        )));
    }

    /// Stop the garbage collector and wait for in-flight blob touches.
    pub async fn shutdown(&self) {
        log_server_info!("shutting down");
        self.shutdown.cancel();

        let task = self
            .gc_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log_gc_warn!(error = %e, "garbage collector did not stop cleanly");
            }
        }

        self.checkouts.shutdown().await;
        log_server_info!("shutdown complete");
    }

    /// The required blobs that are not stored yet, each listed once.
    pub fn report_missing(&self, required: &[BlobKey]) -> Result<Vec<MissingBlob>> {
        let mut seen = HashSet::new();
        let mut missing = Vec::new();

        for key in required {
            if !seen.insert(key) {
                continue;
            }
            let status = self.store.status(key)?;
            if status != BlobStatus::Stored {
                missing.push(MissingBlob {
                    key: key.clone(),
                    status: status.into(),
                });
            }
        }

        log_server_debug!(required = required.len(), missing = missing.len(), "reported missing files");
        Ok(missing)
    }

    /// Receive a blob. See [`UploadReceiver::receive`].
    pub async fn upload<R>(
        &self,
        key: &BlobKey,
        body: R,
        can_defer: bool,
        original_filename: &str,
    ) -> Result<UploadOutcome>
    where
        R: AsyncRead + Unpin,
    {
        self.receiver
            .receive(key, body, can_defer, original_filename)
            .await
    }

    /// Create a checkout; returns the checkout ID actually used.
    pub async fn checkout(&self, request: &CheckoutRequest, cancel: &CancellationToken) -> Result<String> {
        Ok(self.checkouts.checkout(request, cancel).await?)
    }

    pub fn erase_checkout(&self, checkout_id: &str) -> Result<()> {
        Ok(self.checkouts.erase_checkout(checkout_id)?)
    }

    pub fn file_status(&self, key: &BlobKey) -> Result<FileStatus> {
        Ok(self.store.status(key)?.into())
    }

    /// Run one garbage collection sweep now, regardless of the schedule.
    pub fn collect_garbage(&self, dry_run: bool) -> GcStats {
        let options = GcOptions::from_config(&self.config).dry_run(dry_run);
        Reclaimer::new(self.store.clone(), options).run()
    }

    pub fn stats(&self) -> Result<CasStats> {
        Ok(self.store.stats()?)
    }
}
