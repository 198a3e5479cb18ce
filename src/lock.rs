//! Lock Detector
//!
//! Zotero keeps its database in exclusive locking mode while running, so an
//! exclusive transaction that cannot start means the app holds the file.

use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const LOCK_CHECK_TIMEOUT: Duration = Duration::from_millis(100);

/// Returns `false` only when an exclusive lock was acquired and released.
/// Every error, including a missing file, counts as locked.
pub fn is_database_locked(path: &Path) -> bool {
    if !path.is_file() {
        debug!("Lock check: {} is not a file", path.display());
        return true;
    }

    match try_exclusive(path) {
        Ok(()) => false,
        Err(e) => {
            debug!("Lock check on {} failed: {}", path.display(), e);
            true
        }
    }
}

fn try_exclusive(path: &Path) -> rusqlite::Result<()> {
    // no SQLITE_OPEN_CREATE: the check must never create a file
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(LOCK_CHECK_TIMEOUT)?;
    conn.execute_batch("BEGIN EXCLUSIVE; ROLLBACK;")?;
    Ok(())
}
