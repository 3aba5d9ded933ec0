//! Reference marking.
//!
//! A blob's mtime doubles as its "last referenced" timestamp: the checkout
//! manager touches every blob it links, and the reclaimer only considers
//! blobs whose mtime is older than the retention window.

use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use depot_config::{log_store_debug, log_store_warn};
use filetime::FileTime;

/// Touches slower than this are reported; they usually mean the shared
/// storage is struggling.
const SLOW_TOUCH: Duration = Duration::from_secs(1);

/// Set both access and modification time of `path` to now.
///
/// The update is a single synchronous syscall, so once this returns any
/// later `stat` observes the new timestamp.
pub fn touch(path: &Path) -> io::Result<()> {
    if path.as_os_str().is_empty() {
        return Err(io::Error::from(io::ErrorKind::InvalidInput));
    }

    log_store_debug!(file = %path.display(), "touching file");
    let started = Instant::now();

    let now = FileTime::now();
    filetime::set_file_times(path, now, now)?;

    let elapsed = started.elapsed();
    if elapsed > SLOW_TOUCH {
        log_store_warn!(
            file = %path.display(),
            duration = ?elapsed,
            "done touching but took a long time"
        );
    }
    Ok(())
}
