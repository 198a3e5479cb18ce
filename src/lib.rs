//! research-clerk - safe categorization of a Zotero library
//!
//! Reads unfiled items without disturbing a running Zotero, asks a decision
//! provider where they belong, and writes collections and tags back in a
//! single guarded transaction (lock check, backup, rollback on failure).

pub mod backup;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod models;
pub mod owner;
pub mod provider;
pub mod suggestions;
pub mod watch;

pub use backup::{BackupError, BackupManager};
pub use catalog::{Catalog, CatalogConnection, CatalogTx, CatalogWriter};
pub use config::Config;
pub use engine::{ApplyReport, Policy, RecordOutcome, StructureEngine};
pub use error::{ClerkError, Result, ValidationError};
pub use lock::is_database_locked;
pub use models::{CollectionPath, CollectionTree, Placement, Proposal, Record, RecordKey};
pub use owner::{OwnerProcess, ZoteroProcess};
pub use provider::{CommandProvider, DecisionProvider};
pub use suggestions::SuggestionStore;
pub use watch::{CycleOutcome, WatchLoop, WatchSettings, WatchState};
