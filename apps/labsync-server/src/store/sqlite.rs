//! SQLite backend for the sync engine
//!
//! Entities live in one table per entity type (`participants`, `samples`),
//! the ledger in `sync_mutations`, `sync_conflicts` and `sync_watermarks`.
//! Each `commit` runs in its own transaction; the first statement of any
//! entity write bumps `sync_clock`, which takes SQLite's write lock so stamps
//! are issued in commit order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::SqlitePool;

use super::clock::{from_micros, to_micros, truncate_micros};
use super::merge_fields;
use super::traits::{
    EntityChange, EntityStore, LedgerSummary, MutationCommit, MutationLog, StoreError,
    StoredConflict, SyncStore,
};
use crate::sync::{ConflictRecord, EntitySnapshot, EntityType, MutationLogEntry};

/// Repository-style store over a shared SQLite pool
#[derive(Clone)]
pub struct SqliteSyncStore {
    pool: SqlitePool,
}

impl SqliteSyncStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn table(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Participant => "participants",
        EntityType::Sample => "samples",
    }
}

#[async_trait]
impl EntityStore for SqliteSyncStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn load(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<EntitySnapshot>, StoreError> {
        let query = format!(
            "SELECT id, data, is_deleted, updated_at, modified_at FROM {} WHERE id = ?",
            table(entity_type)
        );

        let row = sqlx::query_as::<_, EntityRow>(&query)
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_snapshot(entity_type)).transpose()
    }

    async fn changed_since(
        &self,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<EntitySnapshot>, StoreError> {
        let query = format!(
            r#"
            SELECT id, data, is_deleted, updated_at, modified_at
            FROM {}
            WHERE is_deleted = 0 AND updated_at > ?
            ORDER BY updated_at ASC, id ASC
            LIMIT ?
            "#,
            table(entity_type)
        );

        let rows = sqlx::query_as::<_, EntityRow>(&query)
            .bind(since.map_or(i64::MIN, to_micros))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|r| r.into_snapshot(entity_type))
            .collect()
    }
}

#[async_trait]
impl MutationLog for SqliteSyncStore {
    async fn find_mutation(
        &self,
        mutation_id: &str,
    ) -> Result<Option<MutationLogEntry>, StoreError> {
        let row = sqlx::query_as::<_, MutationRow>(
            r#"
            SELECT id, user_id, device_id, mutation_type, entity_type, entity_id,
                   status, reason, client_timestamp, received_at
            FROM sync_mutations
            WHERE id = ?
            "#,
        )
        .bind(mutation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(MutationRow::into_entry).transpose()
    }

    async fn record_failure(&self, entry: &MutationLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_mutations (
                id, user_id, device_id, mutation_type, entity_type, entity_id,
                status, reason, client_timestamp, received_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                reason = excluded.reason,
                received_at = excluded.received_at
            WHERE sync_mutations.status = 'failed'
            "#,
        )
        .bind(&entry.mutation_id)
        .bind(&entry.user_id)
        .bind(&entry.device_id)
        .bind(&entry.kind)
        .bind(entry.entity_type.map(EntityType::as_str))
        .bind(&entry.entity_id)
        .bind(entry.status.as_str())
        .bind(&entry.reason)
        .bind(to_micros(entry.client_timestamp))
        .bind(to_micros(entry.received_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_conflicts(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredConflict>, StoreError> {
        let rows = sqlx::query_as::<_, ConflictRow>(
            r#"
            SELECT mutation_id, entity_type, entity_id, field,
                   client_value, server_value, resolved_value, created_at
            FROM sync_conflicts
            WHERE user_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ConflictRow::into_conflict).collect()
    }

    async fn summary(&self, user_id: &str) -> Result<LedgerSummary, StoreError> {
        let (failed, last_push): (Option<i64>, Option<i64>) = sqlx::query_as(
            r#"
            SELECT SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), MAX(received_at)
            FROM sync_mutations
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let (last_pull,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(pulled_at) FROM sync_watermarks WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(LedgerSummary {
            failed_mutations: failed.unwrap_or(0).max(0) as u64,
            last_push_at: last_push.map(from_micros).transpose()?,
            last_pull_at: last_pull.map(from_micros).transpose()?,
        })
    }

    async fn advance_watermark(
        &self,
        user_id: &str,
        device_id: &str,
        watermark: DateTime<Utc>,
        pulled_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, StoreError> {
        let (stored,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO sync_watermarks (user_id, device_id, watermark, pulled_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id, device_id) DO UPDATE SET
                watermark = MAX(watermark, excluded.watermark),
                pulled_at = excluded.pulled_at
            RETURNING watermark
            "#,
        )
        .bind(user_id)
        .bind(device_id)
        .bind(to_micros(watermark))
        .bind(to_micros(pulled_at))
        .fetch_one(&self.pool)
        .await?;

        from_micros(stored)
    }
}

#[async_trait]
impl SyncStore for SqliteSyncStore {
    async fn commit(&self, commit: &MutationCommit) -> Result<Option<DateTime<Utc>>, StoreError> {
        let entry = &commit.entry;
        let mut tx = self.pool.begin().await?;

        let mut stamped = None;
        if let Some(write) = &commit.write {
            let (stamp,): (i64,) = sqlx::query_as(
                "UPDATE sync_clock SET last_micros = MAX(last_micros + 1, ?) WHERE id = 1 RETURNING last_micros",
            )
            .bind(to_micros(truncate_micros(Utc::now())))
            .fetch_one(&mut *tx)
            .await?;

            let select = format!(
                "SELECT id, data, is_deleted, updated_at, modified_at FROM {} WHERE id = ?",
                table(write.entity_type)
            );
            let current = sqlx::query_as::<_, EntityRow>(&select)
                .bind(&write.entity_id)
                .fetch_optional(&mut *tx)
                .await?;

            let current_stamp = current.as_ref().map(|r| r.updated_at);
            if current_stamp != write.expected_updated_at.map(to_micros) {
                return Err(StoreError::StaleSnapshot {
                    entity_type: write.entity_type,
                    entity_id: write.entity_id.clone(),
                });
            }

            match (&write.change, current) {
                (EntityChange::Merge(fields), current) => {
                    let mut data = match current {
                        Some(row) => parse_object(&row.data)?,
                        None => Map::new(),
                    };
                    merge_fields(&mut data, fields);

                    let upsert = format!(
                        r#"
                        INSERT INTO {} (id, data, is_deleted, created_at, updated_at, modified_at)
                        VALUES (?, ?, 0, ?, ?, ?)
                        ON CONFLICT(id) DO UPDATE SET
                            data = excluded.data,
                            updated_at = excluded.updated_at,
                            modified_at = excluded.modified_at
                        "#,
                        table(write.entity_type)
                    );
                    sqlx::query(&upsert)
                        .bind(&write.entity_id)
                        .bind(serde_json::to_string(&data)?)
                        .bind(stamp)
                        .bind(stamp)
                        .bind(to_micros(write.modified_at))
                        .execute(&mut *tx)
                        .await?;
                }
                (EntityChange::Delete, Some(_)) => {
                    let delete = format!(
                        "UPDATE {} SET is_deleted = 1, updated_at = ?, modified_at = ? WHERE id = ?",
                        table(write.entity_type)
                    );
                    sqlx::query(&delete)
                        .bind(stamp)
                        .bind(to_micros(write.modified_at))
                        .bind(&write.entity_id)
                        .execute(&mut *tx)
                        .await?;
                }
                (EntityChange::Delete, None) => {
                    return Err(StoreError::Constraint(format!(
                        "cannot delete missing {} {}",
                        write.entity_type, write.entity_id
                    )));
                }
            }

            stamped = Some(from_micros(stamp)?);
        }

        // A failed entry may be replaced; a final one means the id was already handled.
        let logged = sqlx::query(
            r#"
            INSERT INTO sync_mutations (
                id, user_id, device_id, mutation_type, entity_type, entity_id,
                status, reason, client_timestamp, received_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                reason = excluded.reason,
                entity_type = excluded.entity_type,
                entity_id = excluded.entity_id,
                received_at = excluded.received_at
            WHERE sync_mutations.status = 'failed'
            "#,
        )
        .bind(&entry.mutation_id)
        .bind(&entry.user_id)
        .bind(&entry.device_id)
        .bind(&entry.kind)
        .bind(entry.entity_type.map(EntityType::as_str))
        .bind(&entry.entity_id)
        .bind(entry.status.as_str())
        .bind(&entry.reason)
        .bind(to_micros(entry.client_timestamp))
        .bind(to_micros(entry.received_at))
        .execute(&mut *tx)
        .await?;

        if logged.rows_affected() == 0 {
            return Err(StoreError::DuplicateMutation(entry.mutation_id.clone()));
        }

        for record in &commit.conflicts {
            sqlx::query(
                r#"
                INSERT INTO sync_conflicts (
                    mutation_id, user_id, entity_type, entity_id, field,
                    client_value, server_value, resolved_value, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.mutation_id)
            .bind(&entry.user_id)
            .bind(record.entity_type.as_str())
            .bind(&record.entity_id)
            .bind(&record.field)
            .bind(serde_json::to_string(&record.client_value)?)
            .bind(serde_json::to_string(&record.server_value)?)
            .bind(serde_json::to_string(&record.resolved_value)?)
            .bind(to_micros(entry.received_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(stamped)
    }
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, StoreError> {
    match serde_json::from_str(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Corrupt(format!(
            "entity data is not an object: {}",
            other
        ))),
    }
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    id: String,
    data: String,
    is_deleted: bool,
    updated_at: i64,
    modified_at: i64,
}

impl EntityRow {
    fn into_snapshot(self, entity_type: EntityType) -> Result<EntitySnapshot, StoreError> {
        Ok(EntitySnapshot {
            entity_type,
            data: parse_object(&self.data)?,
            id: self.id,
            is_deleted: self.is_deleted,
            updated_at: from_micros(self.updated_at)?,
            modified_at: from_micros(self.modified_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MutationRow {
    id: String,
    user_id: String,
    device_id: Option<String>,
    mutation_type: String,
    entity_type: Option<String>,
    entity_id: Option<String>,
    status: String,
    reason: Option<String>,
    client_timestamp: i64,
    received_at: i64,
}

impl MutationRow {
    fn into_entry(self) -> Result<MutationLogEntry, StoreError> {
        let entity_type = self
            .entity_type
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(StoreError::Corrupt)?;

        Ok(MutationLogEntry {
            mutation_id: self.id,
            user_id: self.user_id,
            device_id: self.device_id,
            kind: self.mutation_type,
            entity_type,
            entity_id: self.entity_id,
            status: self.status.parse().map_err(StoreError::Corrupt)?,
            reason: self.reason,
            client_timestamp: from_micros(self.client_timestamp)?,
            received_at: from_micros(self.received_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConflictRow {
    mutation_id: String,
    entity_type: String,
    entity_id: String,
    field: String,
    client_value: String,
    server_value: String,
    resolved_value: String,
    created_at: i64,
}

impl ConflictRow {
    fn into_conflict(self) -> Result<StoredConflict, StoreError> {
        Ok(StoredConflict {
            mutation_id: self.mutation_id,
            record: ConflictRecord {
                entity_type: self.entity_type.parse().map_err(StoreError::Corrupt)?,
                entity_id: self.entity_id,
                field: self.field,
                client_value: serde_json::from_str(&self.client_value)?,
                server_value: serde_json::from_str(&self.server_value)?,
                resolved_value: serde_json::from_str(&self.resolved_value)?,
            },
            created_at: from_micros(self.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::store::EntityWrite;
    use crate::sync::MutationStatus;
    use serde_json::json;

    fn entry(id: &str, status: MutationStatus) -> MutationLogEntry {
        MutationLogEntry {
            mutation_id: id.to_string(),
            user_id: "user-1".to_string(),
            device_id: Some("device-1".to_string()),
            kind: "sample_register".to_string(),
            entity_type: Some(EntityType::Sample),
            entity_id: Some("s-1".to_string()),
            status,
            reason: None,
            client_timestamp: truncate_micros(Utc::now()),
            received_at: truncate_micros(Utc::now()),
        }
    }

    fn merge(entity_id: &str, expected: Option<DateTime<Utc>>, fields: Value) -> EntityWrite {
        EntityWrite {
            entity_type: EntityType::Sample,
            entity_id: entity_id.to_string(),
            expected_updated_at: expected,
            modified_at: truncate_micros(Utc::now()),
            change: EntityChange::Merge(fields.as_object().cloned().unwrap()),
        }
    }

    #[tokio::test]
    async fn test_commit_creates_and_merges() {
        let store = SqliteSyncStore::new(test_pool().await);

        let first = store
            .commit(&MutationCommit {
                entry: entry("m-1", MutationStatus::Applied),
                write: Some(merge("s-1", None, json!({"kind": "blood", "tube": 1}))),
                conflicts: vec![],
            })
            .await
            .unwrap()
            .unwrap();

        let second = store
            .commit(&MutationCommit {
                entry: entry("m-2", MutationStatus::Applied),
                write: Some(merge("s-1", Some(first), json!({"tube": 2}))),
                conflicts: vec![],
            })
            .await
            .unwrap()
            .unwrap();
        assert!(second > first);

        let snapshot = store.load(EntityType::Sample, "s-1").await.unwrap().unwrap();
        assert_eq!(snapshot.data["kind"], "blood");
        assert_eq!(snapshot.data["tube"], 2);
        assert_eq!(snapshot.updated_at, second);
    }

    #[tokio::test]
    async fn test_stale_commit_rolls_back() {
        let store = SqliteSyncStore::new(test_pool().await);
        store
            .commit(&MutationCommit {
                entry: entry("m-1", MutationStatus::Applied),
                write: Some(merge("s-1", None, json!({"tube": 1}))),
                conflicts: vec![],
            })
            .await
            .unwrap();

        let err = store
            .commit(&MutationCommit {
                entry: entry("m-2", MutationStatus::Applied),
                write: Some(merge("s-1", None, json!({"tube": 9}))),
                conflicts: vec![],
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::StaleSnapshot { .. }));
        assert!(store.find_mutation("m-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_mutation_detected() {
        let store = SqliteSyncStore::new(test_pool().await);
        let commit = MutationCommit {
            entry: entry("m-1", MutationStatus::Applied),
            write: Some(merge("s-1", None, json!({"tube": 1}))),
            conflicts: vec![],
        };
        store.commit(&commit).await.unwrap();

        let replay = MutationCommit {
            write: None,
            ..commit
        };
        let err = store.commit(&replay).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateMutation(_)));
    }

    #[tokio::test]
    async fn test_failed_entry_can_be_superseded() {
        let store = SqliteSyncStore::new(test_pool().await);
        store
            .record_failure(&entry("m-1", MutationStatus::Failed))
            .await
            .unwrap();
        assert_eq!(store.summary("user-1").await.unwrap().failed_mutations, 1);

        store
            .commit(&MutationCommit {
                entry: entry("m-1", MutationStatus::Applied),
                write: Some(merge("s-1", None, json!({"tube": 1}))),
                conflicts: vec![],
            })
            .await
            .unwrap();

        let logged = store.find_mutation("m-1").await.unwrap().unwrap();
        assert_eq!(logged.status, MutationStatus::Applied);
        assert_eq!(store.summary("user-1").await.unwrap().failed_mutations, 0);
    }

    #[tokio::test]
    async fn test_changefeed_order_and_tombstones() {
        let store = SqliteSyncStore::new(test_pool().await);
        let mut stamps = Vec::new();
        for (i, id) in ["s-b", "s-a", "s-c"].iter().enumerate() {
            let stamp = store
                .commit(&MutationCommit {
                    entry: entry(&format!("m-{}", i), MutationStatus::Applied),
                    write: Some(merge(id, None, json!({"n": i}))),
                    conflicts: vec![],
                })
                .await
                .unwrap()
                .unwrap();
            stamps.push(stamp);
        }

        store
            .commit(&MutationCommit {
                entry: entry("m-del", MutationStatus::Applied),
                write: Some(EntityWrite {
                    entity_type: EntityType::Sample,
                    entity_id: "s-a".to_string(),
                    expected_updated_at: Some(stamps[1]),
                    modified_at: truncate_micros(Utc::now()),
                    change: EntityChange::Delete,
                }),
                conflicts: vec![],
            })
            .await
            .unwrap();

        let all = store
            .changed_since(EntityType::Sample, None, 10)
            .await
            .unwrap();
        let ids: Vec<_> = all.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s-b", "s-c"]);

        let after_first = store
            .changed_since(EntityType::Sample, Some(stamps[0]), 10)
            .await
            .unwrap();
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0].id, "s-c");
    }

    #[tokio::test]
    async fn test_conflicts_persisted_newest_first() {
        let store = SqliteSyncStore::new(test_pool().await);
        for (i, field) in ["site", "status"].iter().enumerate() {
            store
                .commit(&MutationCommit {
                    entry: entry(&format!("m-{}", i), MutationStatus::Conflict),
                    write: None,
                    conflicts: vec![ConflictRecord {
                        entity_type: EntityType::Participant,
                        entity_id: "p-1".to_string(),
                        field: field.to_string(),
                        client_value: json!("client"),
                        server_value: json!("server"),
                        resolved_value: json!("server"),
                    }],
                })
                .await
                .unwrap();
        }

        let conflicts = store.recent_conflicts("user-1", 10).await.unwrap();
        assert_eq!(conflicts.len(), 2);
        assert_eq!(conflicts[0].record.field, "status");
        assert_eq!(conflicts[1].mutation_id, "m-0");
        assert!(store.recent_conflicts("user-2", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watermark_is_monotonic() {
        let store = SqliteSyncStore::new(test_pool().await);
        let later = truncate_micros(Utc::now());
        let earlier = later - chrono::Duration::seconds(30);

        store
            .advance_watermark("user-1", "device-1", later, later)
            .await
            .unwrap();
        let stored = store
            .advance_watermark("user-1", "device-1", earlier, later)
            .await
            .unwrap();

        assert_eq!(stored, later);
        assert_eq!(store.summary("user-1").await.unwrap().last_pull_at, Some(later));
    }
}
