//! Error types for research-clerk
//!
//! `ClerkError` covers everything that aborts a session. Per-record rule
//! violations found while applying a proposal are `ValidationError`s and
//! travel inside the apply report instead.

use std::path::PathBuf;
use thiserror::Error;

use crate::backup::BackupError;

#[derive(Error, Debug)]
pub enum ClerkError {
    #[error("Zotero database not found. Checked:\n{}", format_candidates(.0))]
    DatabaseNotFound(Vec<PathBuf>),

    #[error("Database is in use by Zotero: {0} (close Zotero before making changes)")]
    DatabaseBusy(PathBuf),

    #[error("Backup failed: {0}")]
    Backup(#[from] BackupError),

    #[error("Schema mismatch: {0}")]
    SchemaViolation(String),

    #[error("Transaction rolled back: {0}")]
    Transaction(#[source] Box<ClerkError>),

    #[error("Connection is read-only")]
    ReadOnly,

    #[error("Invalid item key: {0:?} (expected 8 uppercase alphanumeric characters)")]
    InvalidKey(String),

    #[error("Invalid collection path: {0:?}")]
    InvalidPath(String),

    #[error("Invalid suggestions in {source_name}: {}", .problems.join("; "))]
    Suggestions {
        source_name: String,
        problems: Vec<String>,
    },

    #[error("Decision provider error: {0}")]
    Provider(String),

    #[error("Process control error: {0}")]
    Process(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ClerkError {
    /// Errors after which the watch loop must give up instead of retrying.
    pub fn is_fatal(&self) -> bool {
        match self {
            ClerkError::DatabaseNotFound(_)
            | ClerkError::SchemaViolation(_)
            | ClerkError::Config(_) => true,
            ClerkError::Transaction(inner) => inner.is_fatal(),
            _ => false,
        }
    }
}

fn format_candidates(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, ClerkError>;

/// Why a single proposed change was rejected. The rest of the batch still applies.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("path {path} is {depth} levels deep (max {max})")]
    DepthExceeded { path: String, depth: usize, max: usize },

    #[error("new collection {path} would have {support} member(s), needs at least {required}")]
    InsufficientSupport {
        path: String,
        support: usize,
        required: usize,
    },

    #[error("{count} tag(s) proposed, expected {min}-{max}")]
    TagCountInvalid { count: usize, min: usize, max: usize },

    #[error("item is an attachment or note and cannot be filed on its own")]
    RecordIsAttachment,

    #[error("item not found in the library")]
    RecordNotFound,

    #[error("invalid collection path: {0}")]
    InvalidPath(String),

    #[error("current collection {0} does not exist")]
    CurrentCollectionMissing(String),
}
