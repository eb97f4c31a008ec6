//! State Tracker
//!
//! Persistent replica catalog: the ordered chain of layers with their
//! parent links, plus the replica's durable scalar state (geometry,
//! revision counter anchor, mode, rebuild flag). Every chain mutation is
//! committed as one SQLite transaction, which is the atomic commit point
//! for the snapshot chain.

use std::path::PathBuf;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::ReplicaMode;
use crate::revision::PersistedRevision;
use crate::error::{Error, Result};

/// Catalog database file name
pub const DB_FILE: &str = "replica.db";

/// Catalog row for one layer of the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRecord {
    /// Layer name
    pub name: String,
    /// Backing file name inside the replica directory
    pub file: String,
    /// Parent layer name
    pub parent: Option<String>,
    /// Revision counter when the layer was frozen
    pub created_revision: u64,
    /// Current checkpoint marker
    pub checkpoint: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl DiskRecord {
    /// Create a new record stamped with the current time
    pub fn new(name: &str, file: String, parent: Option<String>, created_revision: u64) -> Self {
        Self {
            name: name.to_string(),
            file,
            parent,
            created_revision,
            checkpoint: false,
            created_at: Utc::now(),
        }
    }
}

/// Set of changes committed atomically
#[derive(Debug, Default)]
pub struct CatalogUpdate<'a> {
    /// Replace the whole chain (base first)
    pub chain: Option<&'a [DiskRecord]>,
    /// New revision counter anchor
    pub revision: Option<PersistedRevision>,
    /// Rebuild-in-progress flag
    pub rebuilding: Option<bool>,
    /// New volume size
    pub size: Option<u64>,
    /// New replica mode
    pub mode: Option<ReplicaMode>,
}

/// Persistent replica state backed by SQLite
pub struct StateTracker {
    /// Database connection
    conn: Connection,
    /// Database path
    db_path: PathBuf,
}

impl StateTracker {
    /// Create or open the replica catalog
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join(DB_FILE);
        let conn = Connection::open(&db_path)?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;

            CREATE TABLE IF NOT EXISTS replica_state (
                key TEXT PRIMARY KEY,
                value_int INTEGER,
                value_text TEXT,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS disks (
                position INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                file TEXT NOT NULL UNIQUE,
                parent TEXT,
                created_revision INTEGER NOT NULL,
                checkpoint INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            "#,
        )?;

        Ok(Self { conn, db_path })
    }

    /// Check whether a chain has been created in this directory
    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.get_int("block_size")?.is_some())
    }

    /// Record geometry and the initial chain of a fresh replica
    pub fn initialize(&mut self, size: u64, block_size: u32, chain: &[DiskRecord]) -> Result<()> {
        let tx = self.conn.transaction()?;
        put_int(&tx, "size", size as i64)?;
        put_int(&tx, "block_size", block_size as i64)?;
        put_int(&tx, "revision_counter", 0)?;
        put_int(&tx, "revision_offset", crate::chain::HEADER_SIZE as i64)?;
        put_int(&tx, "rebuilding", 0)?;
        put_text(&tx, "mode", ReplicaMode::ReadWrite.as_str())?;
        write_chain(&tx, chain)?;
        tx.commit()?;
        Ok(())
    }

    /// Load the chain, base first
    pub fn load_chain(&self) -> Result<Vec<DiskRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, file, parent, created_revision, checkpoint, created_at
             FROM disks ORDER BY position",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut chain = Vec::new();
        for row in rows {
            let (name, file, parent, created_revision, checkpoint, created_at) = row?;
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| Error::ChainCorruption(format!("Bad timestamp on layer {}: {}", name, e)))?
                .with_timezone(&Utc);
            chain.push(DiskRecord {
                name,
                file,
                parent,
                created_revision: created_revision as u64,
                checkpoint: checkpoint != 0,
                created_at,
            });
        }

        Ok(chain)
    }

    /// Apply a set of changes in a single transaction
    pub fn commit(&mut self, update: CatalogUpdate<'_>) -> Result<()> {
        let tx = self.conn.transaction()?;
        if let Some(chain) = update.chain {
            write_chain(&tx, chain)?;
        }
        if let Some(revision) = update.revision {
            put_int(&tx, "revision_counter", revision.counter as i64)?;
            put_int(&tx, "revision_offset", revision.head_offset as i64)?;
        }
        if let Some(rebuilding) = update.rebuilding {
            put_int(&tx, "rebuilding", rebuilding as i64)?;
        }
        if let Some(size) = update.size {
            put_int(&tx, "size", size as i64)?;
        }
        if let Some(mode) = update.mode {
            put_text(&tx, "mode", mode.as_str())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Volume size in bytes
    pub fn size(&self) -> Result<u64> {
        self.require_int("size").map(|v| v as u64)
    }

    /// Block size in bytes
    pub fn block_size(&self) -> Result<u32> {
        self.require_int("block_size").map(|v| v as u32)
    }

    /// Persisted revision counter anchor
    pub fn revision(&self) -> Result<PersistedRevision> {
        Ok(PersistedRevision {
            counter: self.get_int("revision_counter")?.unwrap_or(0) as u64,
            head_offset: self
                .get_int("revision_offset")?
                .unwrap_or(crate::chain::HEADER_SIZE as i64) as u64,
        })
    }

    /// Rebuild-in-progress flag
    pub fn rebuilding(&self) -> Result<bool> {
        Ok(self.get_int("rebuilding")?.unwrap_or(0) != 0)
    }

    /// Last persisted replica mode
    pub fn mode(&self) -> Result<ReplicaMode> {
        match self.get_text("mode")? {
            Some(text) => text.parse(),
            None => Ok(ReplicaMode::ReadWrite),
        }
    }

    /// Database path
    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    fn require_int(&self, key: &str) -> Result<i64> {
        self.get_int(key)?
            .ok_or_else(|| Error::State(format!("Replica state key '{}' missing", key)))
    }

    fn get_int(&self, key: &str) -> Result<Option<i64>> {
        let value = self
            .conn
            .query_row(
                "SELECT value_int FROM replica_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    fn get_text(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value_text FROM replica_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(value.flatten())
    }
}

fn put_int(conn: &Connection, key: &str, value: i64) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO replica_state (key, value_int) VALUES (?1, ?2)
        ON CONFLICT(key) DO UPDATE SET value_int = ?2, updated_at = CURRENT_TIMESTAMP
        "#,
        params![key, value],
    )?;
    Ok(())
}

fn put_text(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO replica_state (key, value_text) VALUES (?1, ?2)
        ON CONFLICT(key) DO UPDATE SET value_text = ?2, updated_at = CURRENT_TIMESTAMP
        "#,
        params![key, value],
    )?;
    Ok(())
}

fn write_chain(conn: &Connection, chain: &[DiskRecord]) -> Result<()> {
    conn.execute("DELETE FROM disks", [])?;
    for (position, disk) in chain.iter().enumerate() {
        conn.execute(
            r#"
            INSERT INTO disks (position, name, file, parent, created_revision, checkpoint, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                position as i64,
                disk.name,
                disk.file,
                disk.parent,
                disk.created_revision as i64,
                disk.checkpoint as i64,
                disk.created_at.to_rfc3339(),
            ],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn chain() -> Vec<DiskRecord> {
        vec![
            DiskRecord::new("snap-1", "disk-a.img".into(), None, 3),
            DiskRecord::new("volume-head", "disk-b.img".into(), Some("snap-1".into()), 0),
        ]
    }

    #[test]
    fn test_initialize_and_reload() {
        let dir = tempdir().unwrap();
        let mut tracker = StateTracker::new(dir.path().to_path_buf()).unwrap();
        assert!(!tracker.is_initialized().unwrap());

        tracker.initialize(1 << 20, 4096, &chain()).unwrap();
        drop(tracker);

        let tracker = StateTracker::new(dir.path().to_path_buf()).unwrap();
        assert!(tracker.is_initialized().unwrap());
        assert_eq!(tracker.size().unwrap(), 1 << 20);
        assert_eq!(tracker.block_size().unwrap(), 4096);
        assert_eq!(tracker.load_chain().unwrap(), chain());
        assert_eq!(tracker.mode().unwrap(), ReplicaMode::ReadWrite);
    }

    #[test]
    fn test_commit_is_atomic_set() {
        let dir = tempdir().unwrap();
        let mut tracker = StateTracker::new(dir.path().to_path_buf()).unwrap();
        tracker.initialize(1 << 20, 4096, &chain()).unwrap();

        let shorter = vec![DiskRecord::new("volume-head", "disk-c.img".into(), None, 0)];
        tracker
            .commit(CatalogUpdate {
                chain: Some(&shorter),
                revision: Some(PersistedRevision { counter: 9, head_offset: 32 }),
                rebuilding: Some(true),
                mode: Some(ReplicaMode::WriteOnly),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(tracker.load_chain().unwrap().len(), 1);
        assert_eq!(tracker.revision().unwrap().counter, 9);
        assert!(tracker.rebuilding().unwrap());
        assert_eq!(tracker.mode().unwrap(), ReplicaMode::WriteOnly);
    }
}
