//! Shared fixture: a throwaway library with a minimal Zotero schema.
#![allow(dead_code)]

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use tempfile::TempDir;

use research_clerk::models::{parse_timestamp, CollectionPath, Placement};
use research_clerk::{BackupManager, Catalog, RecordKey};

const SCHEMA: &str = "
    CREATE TABLE version (schema TEXT PRIMARY KEY, version INT NOT NULL);
    CREATE TABLE libraries (libraryID INTEGER PRIMARY KEY, type TEXT NOT NULL);
    CREATE TABLE itemTypes (itemTypeID INTEGER PRIMARY KEY, typeName TEXT);
    CREATE TABLE items (
        itemID INTEGER PRIMARY KEY,
        itemTypeID INT NOT NULL,
        dateAdded TIMESTAMP NOT NULL,
        libraryID INT NOT NULL,
        key TEXT NOT NULL,
        UNIQUE (libraryID, key)
    );
    CREATE TABLE fields (fieldID INTEGER PRIMARY KEY, fieldName TEXT);
    CREATE TABLE itemDataValues (valueID INTEGER PRIMARY KEY, value UNIQUE);
    CREATE TABLE itemData (itemID INT, fieldID INT, valueID INT, PRIMARY KEY (itemID, fieldID));
    CREATE TABLE itemAttachments (itemID INTEGER PRIMARY KEY, parentItemID INT);
    CREATE TABLE itemNotes (itemID INTEGER PRIMARY KEY, parentItemID INT);
    CREATE TABLE deletedItems (itemID INTEGER PRIMARY KEY);
    CREATE TABLE collections (
        collectionID INTEGER PRIMARY KEY,
        collectionName TEXT NOT NULL,
        parentCollectionID INT DEFAULT NULL,
        clientDateModified TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        libraryID INT NOT NULL,
        key TEXT NOT NULL,
        version INT NOT NULL DEFAULT 0,
        synced INT NOT NULL DEFAULT 0,
        UNIQUE (libraryID, key)
    );
    CREATE TABLE deletedCollections (collectionID INTEGER PRIMARY KEY);
    CREATE TABLE collectionItems (
        collectionID INT NOT NULL,
        itemID INT NOT NULL,
        orderIndex INT NOT NULL DEFAULT 0,
        PRIMARY KEY (collectionID, itemID)
    );
    CREATE TABLE tags (tagID INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE);
    CREATE TABLE itemTags (
        itemID INT NOT NULL,
        tagID INT NOT NULL,
        type INT NOT NULL,
        PRIMARY KEY (itemID, tagID)
    );

    INSERT INTO version VALUES ('userdata', 120);
    INSERT INTO libraries VALUES (1, 'user');
    INSERT INTO itemTypes VALUES (1, 'journalArticle'), (2, 'attachment'), (3, 'note'), (4, 'book');
    INSERT INTO fields VALUES (1, 'title'), (2, 'abstractNote');
";

pub struct Library {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl Library {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("zotero.sqlite");
        let conn = Connection::open(&path).expect("Failed to create database");
        conn.execute_batch(SCHEMA).expect("Failed to create schema");
        Self { dir, path }
    }

    /// Short-lived connection; dropped before the code under test runs.
    pub fn conn(&self) -> Connection {
        Connection::open(&self.path).expect("Failed to open fixture database")
    }

    pub fn catalog(&self) -> Catalog {
        Catalog::new(&self.path)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.dir.path().join("backups")
    }

    pub fn backups(&self) -> BackupManager {
        BackupManager::new(self.backup_dir())
    }

    pub fn backup_files(&self) -> Vec<PathBuf> {
        self.backups().list_backups().expect("Failed to list backups")
    }

    fn insert_item(&self, key: &str, type_id: i64, date_added: &str) -> i64 {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO items (itemTypeID, dateAdded, libraryID, key) VALUES (?1, ?2, 1, ?3)",
            params![type_id, date_added, key],
        )
        .expect("Failed to insert item");
        conn.last_insert_rowid()
    }

    fn set_field(&self, item_id: i64, field_id: i64, value: &str) {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO itemDataValues (value) VALUES (?1)",
            params![value],
        )
        .expect("Failed to insert value");
        let value_id: i64 = conn
            .query_row(
                "SELECT valueID FROM itemDataValues WHERE value = ?1",
                params![value],
                |row| row.get(0),
            )
            .expect("Failed to read value id");
        conn.execute(
            "INSERT INTO itemData (itemID, fieldID, valueID) VALUES (?1, ?2, ?3)",
            params![item_id, field_id, value_id],
        )
        .expect("Failed to insert item data");
    }

    fn item_id(&self, key: &str) -> i64 {
        self.conn()
            .query_row("SELECT itemID FROM items WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .expect("Unknown item key")
    }

    pub fn add_item(&self, key: &str, title: &str, date_added: &str) -> i64 {
        let id = self.insert_item(key, 1, date_added);
        self.set_field(id, 1, title);
        id
    }

    pub fn add_item_with_abstract(&self, key: &str, title: &str, abstract_note: &str, date_added: &str) -> i64 {
        let id = self.add_item(key, title, date_added);
        self.set_field(id, 2, abstract_note);
        id
    }

    pub fn add_attachment(&self, key: &str, parent_key: &str, date_added: &str) -> i64 {
        let parent = self.item_id(parent_key);
        let id = self.insert_item(key, 2, date_added);
        self.conn()
            .execute(
                "INSERT INTO itemAttachments (itemID, parentItemID) VALUES (?1, ?2)",
                params![id, parent],
            )
            .expect("Failed to insert attachment");
        id
    }

    pub fn add_standalone_note(&self, key: &str, date_added: &str) -> i64 {
        let id = self.insert_item(key, 3, date_added);
        self.conn()
            .execute(
                "INSERT INTO itemNotes (itemID, parentItemID) VALUES (?1, NULL)",
                params![id],
            )
            .expect("Failed to insert note");
        id
    }

    pub fn add_collection(&self, name: &str, parent: Option<i64>) -> i64 {
        let conn = self.conn();
        let next: i64 = conn
            .query_row("SELECT COALESCE(MAX(collectionID), 0) + 1 FROM collections", [], |row| {
                row.get(0)
            })
            .expect("Failed to read next id");
        conn.execute(
            "INSERT INTO collections (collectionID, collectionName, parentCollectionID, libraryID, key)
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![next, name, parent, format!("COLL{:04}", next)],
        )
        .expect("Failed to insert collection");
        next
    }

    pub fn delete_collection(&self, collection_id: i64) {
        self.conn()
            .execute(
                "INSERT INTO deletedCollections (collectionID) VALUES (?1)",
                params![collection_id],
            )
            .expect("Failed to trash collection");
    }

    pub fn file_item(&self, key: &str, collection_id: i64) {
        let item = self.item_id(key);
        self.conn()
            .execute(
                "INSERT INTO collectionItems (collectionID, itemID, orderIndex)
                 VALUES (?1, ?2, (SELECT COUNT(*) FROM collectionItems WHERE collectionID = ?1))",
                params![collection_id, item],
            )
            .expect("Failed to file item");
    }

    pub fn delete_item(&self, key: &str) {
        let item = self.item_id(key);
        self.conn()
            .execute("INSERT INTO deletedItems (itemID) VALUES (?1)", params![item])
            .expect("Failed to trash item");
    }

    pub fn tag_item(&self, key: &str, tag: &str) {
        let item = self.item_id(key);
        let conn = self.conn();
        conn.execute("INSERT OR IGNORE INTO tags (name) VALUES (?1)", params![tag])
            .expect("Failed to insert tag");
        conn.execute(
            "INSERT INTO itemTags (itemID, tagID, type)
             SELECT ?1, tagID, 0 FROM tags WHERE name = ?2",
            params![item, tag],
        )
        .expect("Failed to tag item");
    }

    pub fn tags_of(&self, key: &str) -> Vec<String> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT t.name FROM itemTags x
                 JOIN tags t ON t.tagID = x.tagID
                 JOIN items i ON i.itemID = x.itemID
                 WHERE i.key = ?1 ORDER BY t.name",
            )
            .expect("Failed to prepare");
        let tags = stmt
            .query_map(params![key], |row| row.get(0))
            .expect("Failed to query tags")
            .collect::<rusqlite::Result<Vec<String>>>()
            .expect("Failed to read tags");
        tags
    }

    pub fn collection_id(&self, path: &str) -> Option<i64> {
        let path = CollectionPath::parse(path).expect("Invalid path");
        let tree = self
            .catalog()
            .open_read_only()
            .expect("Failed to open read-only")
            .collections()
            .expect("Failed to load collections");
        tree.find(&path).map(|c| c.id)
    }

    /// Every collection path, exactly as named, sorted.
    pub fn collection_paths(&self) -> Vec<String> {
        let tree = self
            .catalog()
            .open_read_only()
            .expect("Failed to open read-only")
            .collections()
            .expect("Failed to load collections");
        let mut paths: Vec<String> = tree.paths().into_iter().map(|(p, _)| p.to_string()).collect();
        paths.sort();
        paths
    }

    /// Keys of the items in the collection with this exact id.
    pub fn members(&self, collection_id: i64) -> Vec<String> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT i.key FROM collectionItems ci JOIN items i ON i.itemID = ci.itemID
                 WHERE ci.collectionID = ?1 ORDER BY i.key",
            )
            .expect("Failed to prepare");
        let keys = stmt
            .query_map(params![collection_id], |row| row.get(0))
            .expect("Failed to query members")
            .collect::<rusqlite::Result<Vec<String>>>()
            .expect("Failed to read members");
        keys
    }

    pub fn collection_count(&self) -> i64 {
        self.conn()
            .query_row("SELECT COUNT(*) FROM collections", [], |row| row.get(0))
            .expect("Failed to count collections")
    }

    /// Structural state that a write session may change, as one string.
    pub fn snapshot(&self) -> String {
        let conn = self.conn();
        let mut out = String::new();
        for sql in [
            "SELECT collectionID || ':' || collectionName || ':' || COALESCE(parentCollectionID, '-') FROM collections ORDER BY collectionID",
            "SELECT collectionID || ':' || itemID || ':' || orderIndex FROM collectionItems ORDER BY collectionID, itemID",
            "SELECT tagID || ':' || name FROM tags ORDER BY tagID",
            "SELECT itemID || ':' || tagID FROM itemTags ORDER BY itemID, tagID",
        ] {
            let mut stmt = conn.prepare(sql).expect("Failed to prepare snapshot");
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .expect("Failed to snapshot")
                .collect::<rusqlite::Result<Vec<_>>>()
                .expect("Failed to read snapshot");
            out.push_str(&rows.join("\n"));
            out.push_str("\n--\n");
        }
        out
    }

    pub fn file_size(&self) -> u64 {
        std::fs::metadata(&self.path).expect("Failed to stat database").len()
    }

    pub fn has_table_row(&self, sql: &str) -> bool {
        self.conn()
            .query_row(sql, [], |_| Ok(()))
            .optional()
            .expect("Failed to query")
            .is_some()
    }
}

pub fn key(value: &str) -> RecordKey {
    RecordKey::parse(value).expect("Invalid test key")
}

pub fn ts(value: &str) -> NaiveDateTime {
    parse_timestamp(value).expect("Invalid test timestamp")
}

pub fn placement(path: &str, tags: &[&str]) -> Placement {
    Placement {
        title: None,
        path: CollectionPath::parse(path).expect("Invalid test path"),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        rationale: format!("belongs in {}", path),
    }
}
