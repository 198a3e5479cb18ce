//! Backup Manager
//!
//! Timestamped, size-verified snapshots of the database file, taken before
//! every write session. Existing snapshots are never touched.

use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("cannot read {}: {source}", .path.display())]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("backup directory {} is not writable: {source}", .path.display())]
    DirectoryNotWritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("copy to {} failed: {source}", .path.display())]
    Copy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("size mismatch for {}: expected {expected} bytes, got {actual}", .path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
}

/// Writes snapshots into a single backup directory.
#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy `source` to `<stem>_backup_YYYYMMDD_HHMMSS.sqlite` and verify its size.
    ///
    /// A non-empty `-wal` file next to the source is copied alongside, so the
    /// snapshot is complete even if reconciliation could not run.
    pub fn create_backup(&self, source: &Path) -> Result<PathBuf, BackupError> {
        let expected = fs::metadata(source)
            .and_then(|m| {
                if m.is_file() {
                    Ok(m.len())
                } else {
                    Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"))
                }
            })
            .map_err(|e| BackupError::SourceUnreadable {
                path: source.to_path_buf(),
                source: e,
            })?;

        fs::create_dir_all(&self.dir).map_err(|e| BackupError::DirectoryNotWritable {
            path: self.dir.clone(),
            source: e,
        })?;

        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("database");
        let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();

        let (target, mut out) = self.reserve(stem, &timestamp)?;
        let mut input = File::open(source).map_err(|e| BackupError::SourceUnreadable {
            path: source.to_path_buf(),
            source: e,
        })?;

        let copied = io::copy(&mut input, &mut out).and_then(|n| out.sync_all().map(|_| n));
        drop(out);
        if let Err(e) = copied {
            let _ = fs::remove_file(&target);
            return Err(BackupError::Copy {
                path: target,
                source: e,
            });
        }

        let actual = fs::metadata(&target).map(|m| m.len()).unwrap_or(0);
        if actual != expected {
            warn!(
                "Backup {} is {} bytes, source was {}; removing it",
                target.display(),
                actual,
                expected
            );
            let _ = fs::remove_file(&target);
            return Err(BackupError::SizeMismatch {
                path: target,
                expected,
                actual,
            });
        }

        self.copy_wal(source, &target)?;

        info!("Backup created: {} ({} bytes)", target.display(), actual);
        Ok(target)
    }

    /// Create the snapshot file exclusively, adding `_N` until the name is free.
    fn reserve(&self, stem: &str, timestamp: &str) -> Result<(PathBuf, File), BackupError> {
        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("{}_backup_{}.sqlite", stem, timestamp)
            } else {
                format!("{}_backup_{}_{}.sqlite", stem, timestamp, attempt)
            };
            let path = self.dir.join(name);

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("Backup name {} taken", path.display());
                    attempt += 1;
                }
                Err(e) => {
                    return Err(BackupError::DirectoryNotWritable {
                        path: self.dir.clone(),
                        source: e,
                    })
                }
            }
        }
    }

    fn copy_wal(&self, source: &Path, target: &Path) -> Result<(), BackupError> {
        let wal = sidecar(source, "-wal");
        let len = match fs::metadata(&wal) {
            Ok(m) => m.len(),
            Err(_) => return Ok(()),
        };
        if len == 0 {
            return Ok(());
        }

        let wal_target = sidecar(target, "-wal");
        fs::copy(&wal, &wal_target).map_err(|e| BackupError::Copy {
            path: wal_target.clone(),
            source: e,
        })?;
        debug!("Copied pending WAL ({} bytes) to {}", len, wal_target.display());
        Ok(())
    }

    /// Snapshots in the backup directory, oldest first.
    pub fn list_backups(&self) -> io::Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut backups: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension().map(|e| e == "sqlite").unwrap_or(false)
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.contains("_backup_"))
                        .unwrap_or(false)
            })
            .collect();
        backups.sort();
        Ok(backups)
    }
}

/// `foo.sqlite` -> `foo.sqlite-wal`
pub(crate) fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
