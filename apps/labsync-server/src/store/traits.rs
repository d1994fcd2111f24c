use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::sync::{ConflictRecord, EntitySnapshot, EntityType, MutationLogEntry};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("{entity_type} {entity_id} changed since it was read")]
    StaleSnapshot {
        entity_type: EntityType,
        entity_id: String,
    },
    #[error("Mutation {0} is already recorded")]
    DuplicateMutation(String),
    #[error("Constraint violation: {0}")]
    Constraint(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Corrupt stored data: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::error::ErrorKind;

        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => StoreError::Unavailable(err.to_string()),
            sqlx::Error::Database(ref db_err) => match db_err.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => StoreError::Constraint(db_err.message().to_string()),
                _ => StoreError::Backend(err.to_string()),
            },
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(err.to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// Change applied to an entity row
#[derive(Debug, Clone, PartialEq)]
pub enum EntityChange {
    /// Merge top-level fields into the entity, creating it when absent
    Merge(Map<String, Value>),
    /// Tombstone the entity
    Delete,
}

/// Entity write guarded by an optimistic `updated_at` check
#[derive(Debug, Clone, PartialEq)]
pub struct EntityWrite {
    pub entity_type: EntityType,
    pub entity_id: String,
    /// `updated_at` the change was resolved against; `None` means the entity
    /// must not exist yet
    pub expected_updated_at: Option<DateTime<Utc>>,
    /// Client timestamp of the mutation making the change
    pub modified_at: DateTime<Utc>,
    pub change: EntityChange,
}

/// Everything one mutation writes, committed in a single transaction
#[derive(Debug, Clone, PartialEq)]
pub struct MutationCommit {
    pub entry: MutationLogEntry,
    pub write: Option<EntityWrite>,
    pub conflicts: Vec<ConflictRecord>,
}

/// Aggregates over a user's mutation log and pull history
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerSummary {
    pub failed_mutations: u64,
    pub last_push_at: Option<DateTime<Utc>>,
    pub last_pull_at: Option<DateTime<Utc>>,
}

/// Persisted conflict record with its provenance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredConflict {
    #[serde(rename = "mutationId")]
    pub mutation_id: String,
    #[serde(flatten)]
    pub record: ConflictRecord,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Transactional storage of domain entities
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Cheap round trip used to fail a request before anything is recorded.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn load(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<EntitySnapshot>, StoreError>;

    /// Live entities with `updated_at > since`, ordered by `(updated_at, id)`.
    async fn changed_since(
        &self,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<EntitySnapshot>, StoreError>;
}

/// Idempotency ledger plus per-device pull watermarks
#[async_trait]
pub trait MutationLog: Send + Sync {
    async fn find_mutation(&self, mutation_id: &str)
        -> Result<Option<MutationLogEntry>, StoreError>;

    /// Record a rejected mutation. Entries with a final status are left alone.
    async fn record_failure(&self, entry: &MutationLogEntry) -> Result<(), StoreError>;

    /// Newest first.
    async fn recent_conflicts(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredConflict>, StoreError>;

    async fn summary(&self, user_id: &str) -> Result<LedgerSummary, StoreError>;

    /// Store `max(current, watermark)` for the device and return the stored value.
    async fn advance_watermark(
        &self,
        user_id: &str,
        device_id: &str,
        watermark: DateTime<Utc>,
        pulled_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, StoreError>;
}

/// Entity store and mutation log sharing one transaction per mutation
#[async_trait]
pub trait SyncStore: EntityStore + MutationLog {
    /// Atomically write the log entry, the conflict records and the entity
    /// change. Returns the entity's new `updated_at` when it was written.
    ///
    /// Fails with `DuplicateMutation` when the id already has a final status
    /// and with `StaleSnapshot` when the entity moved past
    /// `expected_updated_at`.
    async fn commit(&self, commit: &MutationCommit) -> Result<Option<DateTime<Utc>>, StoreError>;
}
