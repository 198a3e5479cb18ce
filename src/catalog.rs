//! Database Access Layer
//!
//! Every query and mutation against Zotero's schema lives here. Reads go
//! through [`CatalogConnection`], structural writes only through
//! [`CatalogTx`] inside [`CatalogConnection::with_transaction`].

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backup::{sidecar, BackupManager};
use crate::error::{ClerkError, Result};
use crate::lock::is_database_locked;
use crate::models::{
    format_timestamp, parse_timestamp, Collection, CollectionPath, CollectionTree, FiledRecord,
    Record, RecordKey, RecordKind,
};
use chrono::NaiveDateTime;

/// Alphabet Zotero draws object keys from (no 0, 1, O).
const KEY_ALPHABET: &[u8] = b"23456789ABCDEFGHIJKLMNPQRSTUVWXYZ";

const WRITE_BUSY_TIMEOUT: Duration = Duration::from_secs(1);

/// Tables and columns every query below relies on.
const REQUIRED_SCHEMA: &[(&str, &[&str])] = &[
    ("items", &["itemID", "itemTypeID", "dateAdded", "libraryID", "key"]),
    ("itemTypes", &["itemTypeID", "typeName"]),
    ("fields", &["fieldID", "fieldName"]),
    ("itemData", &["itemID", "fieldID", "valueID"]),
    ("itemDataValues", &["valueID", "value"]),
    ("itemAttachments", &["itemID", "parentItemID"]),
    ("itemNotes", &["itemID", "parentItemID"]),
    ("deletedItems", &["itemID"]),
    (
        "collections",
        &[
            "collectionID",
            "collectionName",
            "parentCollectionID",
            "clientDateModified",
            "libraryID",
            "key",
            "version",
            "synced",
        ],
    ),
    ("deletedCollections", &["collectionID"]),
    ("collectionItems", &["collectionID", "itemID", "orderIndex"]),
    ("tags", &["tagID", "name"]),
    ("itemTags", &["itemID", "tagID", "type"]),
    ("libraries", &["libraryID"]),
];

const RECORD_SELECT: &str = "
    SELECT i.itemID, i.key, i.dateAdded, t.typeName,
        (SELECT v.value FROM itemData d
            JOIN fields f ON f.fieldID = d.fieldID
            JOIN itemDataValues v ON v.valueID = d.valueID
            WHERE d.itemID = i.itemID AND f.fieldName = 'title') AS title,
        (SELECT v.value FROM itemData d
            JOIN fields f ON f.fieldID = d.fieldID
            JOIN itemDataValues v ON v.valueID = d.valueID
            WHERE d.itemID = i.itemID AND f.fieldName = 'abstractNote') AS abstract,
        COALESCE(
            (SELECT p.key FROM itemAttachments a JOIN items p ON p.itemID = a.parentItemID
                WHERE a.itemID = i.itemID),
            (SELECT p.key FROM itemNotes n JOIN items p ON p.itemID = n.parentItemID
                WHERE n.itemID = i.itemID)) AS parentKey,
        EXISTS (SELECT 1 FROM itemAttachments a WHERE a.itemID = i.itemID) AS isAttachment,
        EXISTS (SELECT 1 FROM itemNotes n WHERE n.itemID = i.itemID) AS isNote
    FROM items i
    JOIN itemTypes t ON t.itemTypeID = i.itemTypeID
    WHERE i.libraryID = ?1
      AND i.itemID NOT IN (SELECT itemID FROM deletedItems)";

const STANDALONE: &str = "
      AND NOT EXISTS (SELECT 1 FROM itemAttachments a WHERE a.itemID = i.itemID)
      AND NOT EXISTS (SELECT 1 FROM itemNotes n WHERE n.itemID = i.itemID)
      AND t.typeName NOT IN ('attachment', 'note', 'annotation')";

const MEMBERSHIP: &str = "
    EXISTS (SELECT 1 FROM collectionItems ci
        WHERE ci.itemID = i.itemID
          AND ci.collectionID NOT IN (SELECT collectionID FROM deletedCollections))";

/// Handle on the Zotero database file.
#[derive(Debug, Clone)]
pub struct Catalog {
    path: PathBuf,
}

impl Catalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_exists(&self) -> Result<()> {
        if self.path.is_file() {
            Ok(())
        } else {
            Err(ClerkError::DatabaseNotFound(vec![self.path.clone()]))
        }
    }

    /// Open for inspection while Zotero may be running.
    ///
    /// `immutable=1` takes no locks and never creates `-wal`/`-shm` files.
    /// Changes still sitting in an unreconciled WAL are not visible.
    pub fn open_read_only(&self) -> Result<CatalogConnection> {
        self.ensure_exists()?;

        let uri = format!("file:{}?mode=ro&immutable=1", encode_uri_path(&self.path));
        let conn = Connection::open_with_flags(
            &uri,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        verify_schema(&conn)?;
        let library_id = library_id(&conn)?;
        debug!("Opened {} read-only (library {})", self.path.display(), library_id);

        Ok(CatalogConnection {
            conn,
            read_only: true,
            library_id,
            backup: None,
        })
    }

    /// Start a write session: lock check, WAL reconciliation, backup, open.
    ///
    /// Nothing is written (not even a backup) when Zotero holds the file.
    pub fn open_write(&self, backups: &BackupManager) -> Result<CatalogConnection> {
        self.ensure_exists()?;

        if is_database_locked(&self.path) {
            warn!("{} is locked, refusing to write", self.path.display());
            return Err(ClerkError::DatabaseBusy(self.path.clone()));
        }

        self.reconcile_wal()?;
        let backup = backups.create_backup(&self.path)?;

        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(WRITE_BUSY_TIMEOUT)?;
        verify_schema(&conn)?;
        let library_id = library_id(&conn)?;

        if let Some(version) = schema_version(&conn)? {
            debug!("Zotero userdata schema version {}", version);
        }
        info!("Opened {} for writing", self.path.display());

        Ok(CatalogConnection {
            conn,
            read_only: false,
            library_id,
            backup: Some(backup),
        })
    }

    /// Merge a pending `-wal` file into the main database.
    ///
    /// Needs exclusive access; returns `Ok(false)` when there was no WAL.
    pub fn reconcile_wal(&self) -> Result<bool> {
        let wal = sidecar(&self.path, "-wal");
        if !wal.exists() {
            return Ok(false);
        }

        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(WRITE_BUSY_TIMEOUT)?;

        let (busy, frames, checkpointed): (i64, i64, i64) =
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;

        if busy != 0 {
            return Err(ClerkError::DatabaseBusy(self.path.clone()));
        }

        info!(
            "Reconciled WAL for {} ({}/{} frames)",
            self.path.display(),
            checkpointed,
            frames
        );
        Ok(true)
    }
}

/// An open connection, read-only or inside a write session.
pub struct CatalogConnection {
    conn: Connection,
    read_only: bool,
    library_id: i64,
    backup: Option<PathBuf>,
}

impl CatalogConnection {
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Snapshot taken when this write session started.
    pub fn backup_path(&self) -> Option<&Path> {
        self.backup.as_deref()
    }

    pub fn library_id(&self) -> i64 {
        self.library_id
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        schema_version(&self.conn)
    }

    /// Standalone records with no collection membership, oldest first.
    pub fn list_unfiled(&self) -> Result<Vec<Record>> {
        query_unfiled(&self.conn, self.library_id, None)
    }

    /// Unfiled records added strictly after `since`.
    pub fn list_unfiled_since(&self, since: &NaiveDateTime) -> Result<Vec<Record>> {
        query_unfiled(&self.conn, self.library_id, Some(since))
    }

    pub fn max_unfiled_timestamp(&self) -> Result<Option<NaiveDateTime>> {
        let sql = format!(
            "SELECT MAX(dateAdded) FROM ({} {} AND NOT {})",
            RECORD_SELECT, STANDALONE, MEMBERSHIP
        );
        let max: Option<String> = self
            .conn
            .query_row(&sql, params![self.library_id], |row| row.get(0))?;
        Ok(max.as_deref().and_then(parse_timestamp))
    }

    /// Standalone records that are in at least one collection, with their paths.
    pub fn list_filed(&self) -> Result<Vec<FiledRecord>> {
        let tree = load_collections(&self.conn, self.library_id)?;
        let sql = format!(
            "{} {} AND {} ORDER BY i.dateAdded, i.itemID",
            RECORD_SELECT, STANDALONE, MEMBERSHIP
        );
        let records = query_records(&self.conn, &sql, params![self.library_id])?;

        records
            .into_iter()
            .map(|record| {
                let collections = membership_ids(&self.conn, record.item_id)?
                    .into_iter()
                    .filter_map(|id| tree.path_of(id))
                    .collect();
                Ok(FiledRecord {
                    record,
                    collections,
                })
            })
            .collect()
    }

    pub fn collections(&self) -> Result<CollectionTree> {
        load_collections(&self.conn, self.library_id)
    }

    pub fn record(&self, key: &RecordKey) -> Result<Option<Record>> {
        query_record(&self.conn, self.library_id, key)
    }

    /// Paths of every live collection that contains `key`.
    pub fn collections_of(&self, key: &RecordKey) -> Result<Vec<CollectionPath>> {
        let Some(record) = self.record(key)? else {
            return Ok(Vec::new());
        };
        let tree = self.collections()?;
        Ok(membership_ids(&self.conn, record.item_id)?
            .into_iter()
            .filter_map(|id| tree.path_of(id))
            .collect())
    }

    /// Run `body` in one transaction. Any error rolls everything back and is
    /// returned as [`ClerkError::Transaction`].
    pub fn with_transaction<T, F>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&CatalogTx<'_>) -> Result<T>,
    {
        if self.read_only {
            return Err(ClerkError::ReadOnly);
        }

        let library_id = self.library_id;
        let tx = self.conn.transaction()?;
        let outcome = body(&CatalogTx {
            conn: &tx,
            library_id,
        });

        match outcome {
            Ok(value) => {
                tx.commit()
                    .map_err(|e| ClerkError::Transaction(Box::new(e.into())))?;
                debug!("Transaction committed");
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    warn!("Rollback failed: {}", rollback);
                }
                warn!("Transaction rolled back: {}", e);
                Err(ClerkError::Transaction(Box::new(e)))
            }
        }
    }
}

/// Operations the mutation engine needs inside a transaction.
pub trait CatalogWriter {
    /// Current hierarchy, read inside the transaction.
    fn hierarchy(&self) -> Result<CollectionTree>;
    fn record(&self, key: &RecordKey) -> Result<Option<Record>>;
    fn membership(&self, record: &Record) -> Result<Vec<i64>>;
    fn create_collection(&self, name: &str, parent_id: Option<i64>) -> Result<Collection>;
    /// Returns `false` when the record was already a member.
    fn link_record(&self, record: &Record, collection_id: i64) -> Result<bool>;
    fn unlink_record(&self, record: &Record, collection_id: i64) -> Result<bool>;
    /// Returns how many tags were newly attached.
    fn add_tags(&self, record: &Record, tags: &[String]) -> Result<usize>;
    fn move_members(&self, from: i64, to: i64) -> Result<usize>;
    fn reparent_children(&self, from: i64, to: i64) -> Result<usize>;
    fn delete_collection(&self, id: i64) -> Result<()>;
}

/// Write access inside [`CatalogConnection::with_transaction`].
pub struct CatalogTx<'a> {
    conn: &'a Connection,
    library_id: i64,
}

impl CatalogTx<'_> {
    fn unused_key(&self) -> Result<String> {
        loop {
            let key = generate_key();
            let taken = self
                .conn
                .query_row(
                    "SELECT 1 FROM collections WHERE libraryID = ?1 AND key = ?2",
                    params![self.library_id, key],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !taken {
                return Ok(key);
            }
        }
    }

    fn link_item(&self, item_id: i64, collection_id: i64) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM collectionItems WHERE collectionID = ?1 AND itemID = ?2",
                params![collection_id, item_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Ok(false);
        }

        let order_index: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(orderIndex), -1) + 1 FROM collectionItems WHERE collectionID = ?1",
            params![collection_id],
            |row| row.get(0),
        )?;
        self.conn.execute(
            "INSERT INTO collectionItems (collectionID, itemID, orderIndex) VALUES (?1, ?2, ?3)",
            params![collection_id, item_id, order_index],
        )?;
        Ok(true)
    }

    fn tag_id(&self, name: &str) -> Result<i64> {
        let exact = self
            .conn
            .query_row(
                "SELECT tagID FROM tags WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = exact {
            return Ok(id);
        }

        let folded = self
            .conn
            .query_row(
                "SELECT tagID FROM tags WHERE name = ?1 COLLATE NOCASE ORDER BY tagID LIMIT 1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = folded {
            return Ok(id);
        }

        self.conn
            .execute("INSERT INTO tags (name) VALUES (?1)", params![name])?;
        Ok(self.conn.last_insert_rowid())
    }
}

impl CatalogWriter for CatalogTx<'_> {
    fn hierarchy(&self) -> Result<CollectionTree> {
        load_collections(self.conn, self.library_id)
    }

    fn record(&self, key: &RecordKey) -> Result<Option<Record>> {
        query_record(self.conn, self.library_id, key)
    }

    fn membership(&self, record: &Record) -> Result<Vec<i64>> {
        membership_ids(self.conn, record.item_id)
    }

    fn create_collection(&self, name: &str, parent_id: Option<i64>) -> Result<Collection> {
        let key = self.unused_key()?;
        self.conn.execute(
            "INSERT INTO collections
                (collectionName, parentCollectionID, clientDateModified, libraryID, key, version, synced)
             VALUES (?1, ?2, CURRENT_TIMESTAMP, ?3, ?4, 0, 0)",
            params![name, parent_id, self.library_id, key],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!("Created collection {:?} ({}, id {})", name, key, id);

        Ok(Collection {
            id,
            key,
            name: name.to_string(),
            parent_id,
        })
    }

    fn link_record(&self, record: &Record, collection_id: i64) -> Result<bool> {
        self.link_item(record.item_id, collection_id)
    }

    fn unlink_record(&self, record: &Record, collection_id: i64) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM collectionItems WHERE collectionID = ?1 AND itemID = ?2",
            params![collection_id, record.item_id],
        )?;
        Ok(removed > 0)
    }

    fn add_tags(&self, record: &Record, tags: &[String]) -> Result<usize> {
        let mut added = 0;
        for tag in tags {
            let tag_id = self.tag_id(tag)?;
            // type 0: tag added by the user rather than imported
            added += self.conn.execute(
                "INSERT OR IGNORE INTO itemTags (itemID, tagID, type) VALUES (?1, ?2, 0)",
                params![record.item_id, tag_id],
            )?;
        }
        Ok(added)
    }

    fn move_members(&self, from: i64, to: i64) -> Result<usize> {
        let item_ids: Vec<i64> = {
            let mut stmt = self.conn.prepare(
                "SELECT itemID FROM collectionItems WHERE collectionID = ?1 ORDER BY orderIndex, itemID",
            )?;
            let rows = stmt.query_map(params![from], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut moved = 0;
        for item_id in item_ids {
            if self.link_item(item_id, to)? {
                moved += 1;
            }
        }
        self.conn.execute(
            "DELETE FROM collectionItems WHERE collectionID = ?1",
            params![from],
        )?;
        Ok(moved)
    }

    fn reparent_children(&self, from: i64, to: i64) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE collections
             SET parentCollectionID = ?2, clientDateModified = CURRENT_TIMESTAMP, synced = 0
             WHERE parentCollectionID = ?1",
            params![from, to],
        )?;
        Ok(changed)
    }

    fn delete_collection(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "DELETE FROM collectionItems WHERE collectionID = ?1",
            params![id],
        )?;
        self.conn
            .execute("DELETE FROM collections WHERE collectionID = ?1", params![id])?;
        Ok(())
    }
}

/// Fail with [`ClerkError::SchemaViolation`] if a required table or column is missing.
pub fn verify_schema(conn: &Connection) -> Result<()> {
    let mut problems = Vec::new();
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;

    for (table, columns) in REQUIRED_SCHEMA {
        let present: Vec<String> = stmt
            .query_map(params![table], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        if present.is_empty() {
            problems.push(format!("missing table {}", table));
            continue;
        }
        for column in columns.iter() {
            if !present.iter().any(|c| c == column) {
                problems.push(format!("missing column {}.{}", table, column));
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ClerkError::SchemaViolation(problems.join(", ")))
    }
}

fn schema_version(conn: &Connection) -> Result<Option<i64>> {
    let has_table = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'version'",
            [],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !has_table {
        return Ok(None);
    }

    Ok(conn
        .query_row(
            "SELECT version FROM version WHERE schema = 'userdata'",
            [],
            |row| row.get(0),
        )
        .optional()?)
}

fn library_id(conn: &Connection) -> Result<i64> {
    let id = conn
        .query_row(
            "SELECT libraryID FROM libraries ORDER BY libraryID LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id.unwrap_or(1))
}

fn query_unfiled(
    conn: &Connection,
    library_id: i64,
    since: Option<&NaiveDateTime>,
) -> Result<Vec<Record>> {
    match since {
        Some(ts) => {
            let sql = format!(
                "{} {} AND NOT {} AND i.dateAdded > ?2 ORDER BY i.dateAdded, i.itemID",
                RECORD_SELECT, STANDALONE, MEMBERSHIP
            );
            query_records(conn, &sql, params![library_id, format_timestamp(ts)])
        }
        None => {
            let sql = format!(
                "{} {} AND NOT {} ORDER BY i.dateAdded, i.itemID",
                RECORD_SELECT, STANDALONE, MEMBERSHIP
            );
            query_records(conn, &sql, params![library_id])
        }
    }
}

fn query_record(conn: &Connection, library_id: i64, key: &RecordKey) -> Result<Option<Record>> {
    let sql = format!("{} AND i.key = ?2", RECORD_SELECT);
    Ok(query_records(conn, &sql, params![library_id, key.as_str()])?
        .into_iter()
        .next())
}

struct RecordRow {
    item_id: i64,
    key: String,
    date_added: String,
    item_type: String,
    title: Option<String>,
    abstract_note: Option<String>,
    parent_key: Option<String>,
    is_attachment: bool,
    is_note: bool,
}

fn query_records(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Record>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(RecordRow {
                item_id: row.get(0)?,
                key: row.get(1)?,
                date_added: row.get(2)?,
                item_type: row.get(3)?,
                title: row.get(4)?,
                abstract_note: row.get(5)?,
                parent_key: row.get(6)?,
                is_attachment: row.get(7)?,
                is_note: row.get(8)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let Ok(key) = RecordKey::parse(&row.key) else {
            warn!("Skipping item {} with malformed key {:?}", row.item_id, row.key);
            continue;
        };
        let Some(date_added) = parse_timestamp(&row.date_added) else {
            warn!("Skipping item {} with unreadable dateAdded {:?}", key, row.date_added);
            continue;
        };

        let kind = if row.is_attachment || row.item_type == "attachment" {
            RecordKind::Attachment
        } else if row.is_note || row.item_type == "note" || row.item_type == "annotation" {
            RecordKind::Note
        } else {
            RecordKind::Regular
        };

        records.push(Record {
            item_id: row.item_id,
            tags: record_tags(conn, row.item_id)?,
            key,
            title: row
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| "Untitled".to_string()),
            abstract_note: row.abstract_note.filter(|a| !a.trim().is_empty()),
            item_type: row.item_type,
            date_added,
            parent_key: row.parent_key.and_then(|k| RecordKey::parse(&k).ok()),
            kind,
        });
    }
    Ok(records)
}

fn record_tags(conn: &Connection, item_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT t.name FROM itemTags x JOIN tags t ON t.tagID = x.tagID
         WHERE x.itemID = ?1 ORDER BY t.name",
    )?;
    let tags = stmt
        .query_map(params![item_id], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(tags)
}

fn membership_ids(conn: &Connection, item_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare_cached(
        "SELECT collectionID FROM collectionItems
         WHERE itemID = ?1
           AND collectionID NOT IN (SELECT collectionID FROM deletedCollections)
         ORDER BY collectionID",
    )?;
    let ids = stmt
        .query_map(params![item_id], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(ids)
}

fn load_collections(conn: &Connection, library_id: i64) -> Result<CollectionTree> {
    let mut stmt = conn.prepare(
        "SELECT collectionID, key, collectionName, parentCollectionID
         FROM collections
         WHERE libraryID = ?1
           AND collectionID NOT IN (SELECT collectionID FROM deletedCollections)
         ORDER BY collectionID",
    )?;
    let collections = stmt
        .query_map(params![library_id], |row| {
            Ok(Collection {
                id: row.get(0)?,
                key: row.get(1)?,
                name: row.get(2)?,
                parent_id: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(CollectionTree::from_collections(collections))
}

/// Random key in Zotero's alphabet, seeded from a v4 UUID.
fn generate_key() -> String {
    uuid::Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(8)
        .map(|b| KEY_ALPHABET[*b as usize % KEY_ALPHABET.len()] as char)
        .collect()
}

/// Percent-encode the characters SQLite's URI parser treats specially.
fn encode_uri_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '?' => out.push_str("%3f"),
            '#' => out.push_str("%23"),
            ' ' => out.push_str("%20"),
            _ => out.push(c),
        }
    }
    out
}
