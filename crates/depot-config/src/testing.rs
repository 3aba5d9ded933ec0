//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A temporary storage root
//! - A separate checkout root
//! - A `Config` pointing at both
//!
//! # Usage
//!
//! ```ignore
//! use depot_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let config = env.config();
//!     // config.file_store_path() and config.checkout_path() are isolated
//! }
//! ```

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Storage root (`storage.root`)
    pub storage_root: PathBuf,
    /// Checkout root (`storage.checkout_dir`)
    pub checkout_root: PathBuf,
    /// Scratch space for files that live outside the store
    pub scratch: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let storage_root = root.join("storage");
        let checkout_root = root.join("storage").join("jobs");
        let scratch = root.join("scratch");

        std::fs::create_dir_all(&storage_root)?;
        std::fs::create_dir_all(&scratch)?;

        Ok(Self {
            _temp_dir: temp_dir,
            storage_root,
            checkout_root,
            scratch,
            test_id,
        })
    }

    /// Config rooted in this environment.
    ///
    /// Periodic collection is off so tests drive sweeps explicitly.
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.storage.root = self.storage_root.clone();
        cfg.storage.checkout_dir = Some(self.checkout_root.clone());
        cfg.gc.period_secs = 0;
        cfg.upload.defer_timeout_secs = 5;
        cfg
    }

    /// Create a scratch file with content
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.scratch.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

/// Shared buffer the capturing subscriber writes into.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` under a debug-level subscriber local to this thread and return
/// everything it logged, formatted without colors.
pub fn capture_logs(f: impl FnOnce()) -> String {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .finish();
    tracing::subscriber::with_default(subscriber, f);

    let bytes = buffer.0.lock().unwrap_or_else(PoisonError::into_inner);
    String::from_utf8_lossy(&bytes).into_owned()
}
