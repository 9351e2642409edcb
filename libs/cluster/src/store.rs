//! SQLite-based state store for managed clusters.
//!
//! One record per cluster, keyed by the remote cluster id. The record keeps
//! the last observed state and the hash of the spec that produced it, so a
//! restarted reconciler can adopt the cluster and skip unchanged specs.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use cirrus_id::ClusterId;
use cirrus_reconcile::SpecHash;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

use crate::model::{ClusterSpec, ClusterState, ClusterStatus};

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state: {0}")]
    Invalid(String),
}

/// Persisted record of one managed cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterRecord {
    pub cluster_id: ClusterId,
    pub name: String,
    pub status: ClusterStatus,
    /// Hash of the spec last applied to this cluster.
    pub spec_hash: SpecHash,
    pub state: ClusterState,
    pub updated_at: DateTime<Utc>,
}

impl ClusterRecord {
    /// Build a record for `state`, produced by applying `spec`.
    pub fn new(spec: &ClusterSpec, state: ClusterState) -> Result<Self, StateStoreError> {
        Ok(Self {
            cluster_id: state.id.clone(),
            name: state.attributes.name.clone(),
            status: state.status,
            spec_hash: SpecHash::of(spec)?,
            state,
            updated_at: Utc::now(),
        })
    }
}

/// SQLite state store.
pub struct StateStore {
    conn: Connection,
}

const SELECT_COLUMNS: &str =
    "SELECT cluster_id, name, status, spec_hash, state_json, updated_at FROM clusters";

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS clusters (
                cluster_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                spec_hash TEXT NOT NULL,
                state_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_clusters_name ON clusters(name);
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    /// Insert or update a cluster record.
    pub fn upsert(&self, record: &ClusterRecord) -> Result<(), StateStoreError> {
        let state_json = serde_json::to_string(&record.state)?;
        self.conn.execute(
            r#"
            INSERT INTO clusters (cluster_id, name, status, spec_hash, state_json, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(cluster_id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                spec_hash = excluded.spec_hash,
                state_json = excluded.state_json,
                updated_at = excluded.updated_at
            "#,
            params![
                record.cluster_id.as_str(),
                record.name,
                record.status.as_str(),
                record.spec_hash.as_str(),
                state_json,
                record.updated_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Get a cluster record.
    pub fn get(&self, cluster_id: &ClusterId) -> Result<Option<ClusterRecord>, StateStoreError> {
        let raw = self
            .conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE cluster_id = ?1"),
                params![cluster_id.as_str()],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::decode).transpose()
    }

    /// Find the record of a cluster by name.
    pub fn find_by_name(&self, name: &str) -> Result<Option<ClusterRecord>, StateStoreError> {
        let raw = self
            .conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE name = ?1 ORDER BY updated_at DESC LIMIT 1"),
                params![name],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::decode).transpose()
    }

    /// Returns true if `spec` hashes the same as the spec last applied to
    /// `cluster_id`.
    pub fn is_unchanged(
        &self,
        cluster_id: &ClusterId,
        spec: &ClusterSpec,
    ) -> Result<bool, StateStoreError> {
        let hash = SpecHash::of(spec)?;
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT spec_hash FROM clusters WHERE cluster_id = ?1",
                params![cluster_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stored.is_some_and(|s| SpecHash::from_stored(s) == hash))
    }

    /// Delete a cluster record.
    pub fn delete(&self, cluster_id: &ClusterId) -> Result<(), StateStoreError> {
        self.conn.execute(
            "DELETE FROM clusters WHERE cluster_id = ?1",
            params![cluster_id.as_str()],
        )?;
        Ok(())
    }

    /// List all records, oldest update first.
    pub fn list(&self) -> Result<Vec<ClusterRecord>, StateStoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_COLUMNS} ORDER BY updated_at, cluster_id"))?;
        let raw = stmt
            .query_map([], RawRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawRecord::decode).collect()
    }
}

/// Column values before decoding.
struct RawRecord {
    cluster_id: String,
    name: String,
    status: String,
    spec_hash: String,
    state_json: String,
    updated_at: i64,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            cluster_id: row.get(0)?,
            name: row.get(1)?,
            status: row.get(2)?,
            spec_hash: row.get(3)?,
            state_json: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn decode(self) -> Result<ClusterRecord, StateStoreError> {
        let cluster_id = ClusterId::parse(&self.cluster_id)
            .map_err(|e| StateStoreError::Invalid(format!("cluster id {}: {e}", self.cluster_id)))?;
        let status: ClusterStatus = self
            .status
            .parse()
            .map_err(|e| StateStoreError::Invalid(format!("status: {e}")))?;
        let updated_at = Utc
            .timestamp_opt(self.updated_at, 0)
            .single()
            .ok_or_else(|| StateStoreError::Invalid(format!("timestamp {}", self.updated_at)))?;
        let state: ClusterState = serde_json::from_str(&self.state_json)?;

        Ok(ClusterRecord {
            cluster_id,
            name: self.name,
            status,
            spec_hash: SpecHash::from_stored(self.spec_hash),
            state,
            updated_at,
        })
    }
}
