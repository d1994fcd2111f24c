use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::clock::next_stamp;
use super::traits::{
    EntityChange, EntityStore, LedgerSummary, MutationCommit, MutationLog, StoreError,
    StoredConflict, SyncStore,
};
use super::merge_fields;
use crate::sync::{EntitySnapshot, EntityType, MutationLogEntry, MutationStatus};

/// Non-persistent store holding every table behind one mutex.
///
/// Holding the lock for a whole commit gives the same per-mutation atomicity
/// the SQLite backend gets from its transactions.
pub struct MemorySyncStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    entities: HashMap<(EntityType, String), EntityRow>,
    mutations: HashMap<String, MutationLogEntry>,
    conflicts: Vec<(String, StoredConflict)>,
    watermarks: HashMap<(String, String), (DateTime<Utc>, DateTime<Utc>)>,
    last_stamp: Option<DateTime<Utc>>,
    unavailable: bool,
    rejected_entities: HashSet<String>,
}

#[derive(Clone)]
struct EntityRow {
    data: Map<String, Value>,
    is_deleted: bool,
    updated_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

impl MemoryState {
    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Simulate losing the backing store; every call fails with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Make every write to `entity_id` fail with a constraint violation.
    pub fn reject_writes_to(&self, entity_id: &str) {
        self.state
            .lock()
            .rejected_entities
            .insert(entity_id.to_string());
    }

    /// Number of stored entities of a type, tombstones included
    pub fn entity_count(&self, entity_type: EntityType) -> usize {
        self.state
            .lock()
            .entities
            .keys()
            .filter(|(t, _)| *t == entity_type)
            .count()
    }
}

impl Default for MemorySyncStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for MemorySyncStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.state.lock().ensure_available()
    }

    async fn load(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<EntitySnapshot>, StoreError> {
        let state = self.state.lock();
        state.ensure_available()?;

        Ok(state
            .entities
            .get(&(entity_type, entity_id.to_string()))
            .map(|row| EntitySnapshot {
                entity_type,
                id: entity_id.to_string(),
                data: row.data.clone(),
                is_deleted: row.is_deleted,
                updated_at: row.updated_at,
                modified_at: row.modified_at,
            }))
    }

    async fn changed_since(
        &self,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<EntitySnapshot>, StoreError> {
        let state = self.state.lock();
        state.ensure_available()?;

        let mut changed: Vec<EntitySnapshot> = state
            .entities
            .iter()
            .filter(|((t, _), row)| {
                *t == entity_type
                    && !row.is_deleted
                    && since.map_or(true, |since| row.updated_at > since)
            })
            .map(|((_, id), row)| EntitySnapshot {
                entity_type,
                id: id.clone(),
                data: row.data.clone(),
                is_deleted: false,
                updated_at: row.updated_at,
                modified_at: row.modified_at,
            })
            .collect();

        changed.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        changed.truncate(limit);
        Ok(changed)
    }
}

#[async_trait]
impl MutationLog for MemorySyncStore {
    async fn find_mutation(
        &self,
        mutation_id: &str,
    ) -> Result<Option<MutationLogEntry>, StoreError> {
        let state = self.state.lock();
        state.ensure_available()?;
        Ok(state.mutations.get(mutation_id).cloned())
    }

    async fn record_failure(&self, entry: &MutationLogEntry) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.ensure_available()?;

        let is_final = state
            .mutations
            .get(&entry.mutation_id)
            .map_or(false, |existing| existing.status.is_final());
        if !is_final {
            state.mutations.insert(entry.mutation_id.clone(), entry.clone());
        }
        Ok(())
    }

    async fn recent_conflicts(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredConflict>, StoreError> {
        let state = self.state.lock();
        state.ensure_available()?;

        Ok(state
            .conflicts
            .iter()
            .rev()
            .filter(|(owner, _)| owner == user_id)
            .take(limit)
            .map(|(_, conflict)| conflict.clone())
            .collect())
    }

    async fn summary(&self, user_id: &str) -> Result<LedgerSummary, StoreError> {
        let state = self.state.lock();
        state.ensure_available()?;

        let mine = state.mutations.values().filter(|e| e.user_id == user_id);
        let mut summary = LedgerSummary::default();
        for entry in mine {
            if entry.status == MutationStatus::Failed {
                summary.failed_mutations += 1;
            }
            summary.last_push_at = summary.last_push_at.max(Some(entry.received_at));
        }

        summary.last_pull_at = state
            .watermarks
            .iter()
            .filter(|((owner, _), _)| owner == user_id)
            .map(|(_, (_, pulled_at))| *pulled_at)
            .max();

        Ok(summary)
    }

    async fn advance_watermark(
        &self,
        user_id: &str,
        device_id: &str,
        watermark: DateTime<Utc>,
        pulled_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, StoreError> {
        let mut state = self.state.lock();
        state.ensure_available()?;

        let slot = state
            .watermarks
            .entry((user_id.to_string(), device_id.to_string()))
            .or_insert((watermark, pulled_at));
        slot.0 = slot.0.max(watermark);
        slot.1 = pulled_at;
        Ok(slot.0)
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn commit(&self, commit: &MutationCommit) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut state = self.state.lock();
        state.ensure_available()?;

        let entry = &commit.entry;
        if let Some(existing) = state.mutations.get(&entry.mutation_id) {
            if existing.status.is_final() {
                return Err(StoreError::DuplicateMutation(entry.mutation_id.clone()));
            }
        }

        // Validate everything before touching state so a failed commit leaves no trace.
        let mut stamped = None;
        if let Some(write) = &commit.write {
            if state.rejected_entities.contains(&write.entity_id) {
                return Err(StoreError::Constraint(format!(
                    "write to {} {} rejected",
                    write.entity_type, write.entity_id
                )));
            }

            let key = (write.entity_type, write.entity_id.clone());
            let current = state.entities.get(&key).map(|row| row.updated_at);
            if current != write.expected_updated_at {
                return Err(StoreError::StaleSnapshot {
                    entity_type: write.entity_type,
                    entity_id: write.entity_id.clone(),
                });
            }
            if current.is_none() && write.change == EntityChange::Delete {
                return Err(StoreError::Constraint(format!(
                    "cannot delete missing {} {}",
                    write.entity_type, write.entity_id
                )));
            }

            let stamp = next_stamp(state.last_stamp, Utc::now());
            state.last_stamp = Some(stamp);

            let row = state.entities.entry(key).or_insert_with(|| EntityRow {
                data: Map::new(),
                is_deleted: false,
                updated_at: stamp,
                modified_at: write.modified_at,
            });
            match &write.change {
                EntityChange::Merge(fields) => merge_fields(&mut row.data, fields),
                EntityChange::Delete => row.is_deleted = true,
            }
            row.updated_at = stamp;
            row.modified_at = write.modified_at;
            stamped = Some(stamp);
        }

        state
            .mutations
            .insert(entry.mutation_id.clone(), entry.clone());
        for record in &commit.conflicts {
            state.conflicts.push((
                entry.user_id.clone(),
                StoredConflict {
                    mutation_id: entry.mutation_id.clone(),
                    record: record.clone(),
                    created_at: entry.received_at,
                },
            ));
        }

        Ok(stamped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityWrite;
    use serde_json::json;

    fn entry(id: &str, status: MutationStatus) -> MutationLogEntry {
        MutationLogEntry {
            mutation_id: id.to_string(),
            user_id: "user-1".to_string(),
            device_id: Some("device-1".to_string()),
            kind: "participant_enroll".to_string(),
            entity_type: Some(EntityType::Participant),
            entity_id: Some("p-1".to_string()),
            status,
            reason: None,
            client_timestamp: Utc::now(),
            received_at: Utc::now(),
        }
    }

    fn create(id: &str, entity_id: &str, fields: Value) -> MutationCommit {
        MutationCommit {
            entry: entry(id, MutationStatus::Applied),
            write: Some(EntityWrite {
                entity_type: EntityType::Participant,
                entity_id: entity_id.to_string(),
                expected_updated_at: None,
                modified_at: Utc::now(),
                change: EntityChange::Merge(fields.as_object().cloned().unwrap()),
            }),
            conflicts: vec![],
        }
    }

    #[tokio::test]
    async fn test_commit_and_load() {
        let store = MemorySyncStore::new();
        let stamp = store
            .commit(&create("m-1", "p-1", json!({"name": "Ada"})))
            .await
            .unwrap()
            .unwrap();

        let snapshot = store.load(EntityType::Participant, "p-1").await.unwrap().unwrap();
        assert_eq!(snapshot.data["name"], "Ada");
        assert_eq!(snapshot.updated_at, stamp);
        assert!(store.find_mutation("m-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_commit_rejected() {
        let store = MemorySyncStore::new();
        store.commit(&create("m-1", "p-1", json!({"a": 1}))).await.unwrap();

        let err = store
            .commit(&create("m-1", "p-2", json!({"a": 2})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateMutation(_)));
        assert!(store.load(EntityType::Participant, "p-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_write_rejected_without_side_effects() {
        let store = MemorySyncStore::new();
        store.commit(&create("m-1", "p-1", json!({"a": 1}))).await.unwrap();

        // Creating again assumes the entity is absent, which is no longer true.
        let err = store
            .commit(&create("m-2", "p-1", json!({"a": 2})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleSnapshot { .. }));
        assert!(store.find_mutation("m-2").await.unwrap().is_none());

        let snapshot = store.load(EntityType::Participant, "p-1").await.unwrap().unwrap();
        assert_eq!(snapshot.data["a"], 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_overwrite_final_status() {
        let store = MemorySyncStore::new();
        store.commit(&create("m-1", "p-1", json!({"a": 1}))).await.unwrap();
        store
            .record_failure(&entry("m-1", MutationStatus::Failed))
            .await
            .unwrap();

        let logged = store.find_mutation("m-1").await.unwrap().unwrap();
        assert_eq!(logged.status, MutationStatus::Applied);
    }

    #[tokio::test]
    async fn test_watermark_never_rolls_back() {
        let store = MemorySyncStore::new();
        let later = Utc::now();
        let earlier = later - chrono::Duration::minutes(5);

        let stored = store
            .advance_watermark("user-1", "device-1", later, Utc::now())
            .await
            .unwrap();
        assert_eq!(stored, later);

        let stored = store
            .advance_watermark("user-1", "device-1", earlier, Utc::now())
            .await
            .unwrap();
        assert_eq!(stored, later);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemorySyncStore::new();
        store.set_unavailable(true);

        assert!(matches!(store.ping().await, Err(StoreError::Unavailable(_))));
        assert!(matches!(
            store.find_mutation("m-1").await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
