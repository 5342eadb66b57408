//! Persisted state surfaces
//!
//! Sender models, trust profiles and queue items are written as versioned
//! JSON envelopes, one row per user and kind.

use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::error::{Result, TriageError};

/// Bump when a persisted shape changes incompatibly
pub const SCHEMA_VERSION: u32 = 1;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Envelope around every persisted surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub data: T,
}

impl<T> Versioned<T> {
    pub fn new(data: T) -> Self {
        Self {
            version: SCHEMA_VERSION,
            saved_at: Utc::now(),
            data,
        }
    }

    /// Unwrap the payload, refusing versions written by a newer engine
    pub fn into_current(self) -> Result<T> {
        if self.version > SCHEMA_VERSION {
            return Err(TriageError::Parse(format!(
                "Snapshot schema version {} is newer than supported version {}",
                self.version, SCHEMA_VERSION
            )));
        }
        Ok(self.data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotKind {
    SenderModels,
    TrustProfile,
    ActionQueue,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SenderModels => "sender_models",
            Self::TrustProfile => "trust_profile",
            Self::ActionQueue => "action_queue",
        }
    }
}

/// SQLite-backed store for the persisted surfaces
pub struct SnapshotStore {
    pool: DbPool,
}

impl SnapshotStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("Opening triage state database at {:?}", db_path);
        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder().max_size(4).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;",
        )?;
        drop(conn);

        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Private in-memory database, mainly for tests
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager).map_err(|e| {
            TriageError::Database(format!("Failed to create state database pool: {}", e))
        })?;

        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    fn connection(&self) -> Result<DbConnection> {
        self.pool.get().map_err(|e| {
            TriageError::Database(format!("Failed to get state database connection: {}", e))
        })
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS triage_state (
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                version INTEGER NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, kind)
            );
            "#,
        )?;
        Ok(())
    }

    /// Write `data` for `(user_id, kind)`, replacing what was there
    pub fn save<T: Serialize>(&self, user_id: &str, kind: SnapshotKind, data: &T) -> Result<()> {
        let envelope = Versioned::new(data);
        let payload = serde_json::to_string(&envelope)?;

        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO triage_state (user_id, kind, version, payload, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, kind) DO UPDATE SET
                version = excluded.version,
                payload = excluded.payload,
                updated_at = excluded.updated_at",
            params![
                user_id,
                kind.as_str(),
                envelope.version,
                payload,
                envelope.saved_at.to_rfc3339()
            ],
        )?;

        debug!(
            "Saved {} snapshot for {} ({} bytes)",
            kind.as_str(),
            user_id,
            payload.len()
        );
        Ok(())
    }

    /// Read the payload for `(user_id, kind)`, `None` when nothing was saved
    pub fn load<T: DeserializeOwned>(&self, user_id: &str, kind: SnapshotKind) -> Result<Option<T>> {
        let conn = self.connection()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM triage_state WHERE user_id = ?1 AND kind = ?2",
                params![user_id, kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        let envelope: Versioned<serde_json::Value> = serde_json::from_str(&payload)?;
        let data = envelope.into_current()?;
        Ok(Some(serde_json::from_value(data)?))
    }

    pub fn delete(&self, user_id: &str, kind: SnapshotKind) -> Result<bool> {
        let conn = self.connection()?;
        let rows = conn.execute(
            "DELETE FROM triage_state WHERE user_id = ?1 AND kind = ?2",
            params![user_id, kind.as_str()],
        )?;
        Ok(rows > 0)
    }
}
