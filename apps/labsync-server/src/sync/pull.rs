//! Pull cursor engine
//!
//! Serves the changefeed of live entities updated after a watermark. Each
//! entity type is capped independently; when any type is truncated the
//! returned watermark stops at the earliest truncation point so the next
//! pull resumes without gaps.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::error::{SyncError, SyncResult};
use super::types::{EntityType, PullResponse};
use crate::config::SyncConfig;
use crate::store::{EntityStore, MutationLog, SyncStore};

/// Watermark key used when the caller does not identify its device
pub const DEFAULT_DEVICE: &str = "default";

/// Parse requested entity type names; `None` selects every syncable type.
pub fn parse_entity_types(names: Option<&[String]>) -> SyncResult<Vec<EntityType>> {
    let Some(names) = names else {
        return Ok(EntityType::ALL.to_vec());
    };

    let mut types = Vec::with_capacity(names.len());
    for name in names {
        let entity_type: EntityType = name.trim().parse().map_err(SyncError::UnknownEntityType)?;
        if !types.contains(&entity_type) {
            types.push(entity_type);
        }
    }
    types.sort();
    Ok(types)
}

/// Serves capped changefeed pages and records per-device watermarks
pub struct PullCursor {
    store: Arc<dyn SyncStore>,
    participant_cap: usize,
    sample_cap: usize,
}

impl PullCursor {
    pub fn new(store: Arc<dyn SyncStore>, config: &SyncConfig) -> Self {
        Self {
            store,
            participant_cap: config.participant_cap,
            sample_cap: config.sample_cap,
        }
    }

    pub fn cap(&self, entity_type: EntityType) -> usize {
        match entity_type {
            EntityType::Participant => self.participant_cap,
            EntityType::Sample => self.sample_cap,
        }
    }

    pub async fn pull(
        &self,
        user_id: &str,
        device_id: Option<&str>,
        since: Option<DateTime<Utc>>,
        entity_types: &[EntityType],
    ) -> SyncResult<PullResponse> {
        let mut entities = BTreeMap::new();
        let mut newest: Option<DateTime<Utc>> = None;
        let mut truncated_at: Option<DateTime<Utc>> = None;

        for &entity_type in entity_types {
            let cap = self.cap(entity_type);
            // One extra row tells a full page apart from a truncated one
            let mut rows = self.store.changed_since(entity_type, since, cap + 1).await?;

            if rows.len() > cap {
                rows.truncate(cap);
                if let Some(last) = rows.last() {
                    let stamp = last.updated_at;
                    truncated_at = Some(truncated_at.map_or(stamp, |t| t.min(stamp)));
                }
                tracing::debug!("Pull of {} truncated at {} rows", entity_type, cap);
            }

            if let Some(last) = rows.last() {
                newest = newest.max(Some(last.updated_at));
            }
            entities.insert(entity_type, rows);
        }

        let has_more = truncated_at.is_some();
        let watermark = truncated_at.or_else(|| newest.max(since));

        let device = device_id.unwrap_or(DEFAULT_DEVICE);
        let pulled_at = Utc::now();
        self.store
            .advance_watermark(
                user_id,
                device,
                watermark.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                pulled_at,
            )
            .await?;

        tracing::info!(
            "Pull for user {} device {}: {} entities, watermark {:?}, has_more {}",
            user_id,
            device,
            entities.values().map(Vec::len).sum::<usize>(),
            watermark,
            has_more
        );

        Ok(PullResponse {
            entities,
            watermark,
            has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EntityChange, EntityWrite, MemorySyncStore, MutationCommit};
    use crate::sync::{MutationLogEntry, MutationStatus};
    use serde_json::{json, Map};

    async fn seed(store: &MemorySyncStore, entity_type: EntityType, id: &str) -> DateTime<Utc> {
        let mut fields = Map::new();
        fields.insert("label".to_string(), json!(id));
        let commit = MutationCommit {
            entry: MutationLogEntry {
                mutation_id: format!("seed-{}-{}", entity_type, id),
                user_id: "seeder".to_string(),
                device_id: None,
                kind: "seed".to_string(),
                entity_type: Some(entity_type),
                entity_id: Some(id.to_string()),
                status: MutationStatus::Applied,
                reason: None,
                client_timestamp: Utc::now(),
                received_at: Utc::now(),
            },
            write: Some(EntityWrite {
                entity_type,
                entity_id: id.to_string(),
                expected_updated_at: None,
                modified_at: Utc::now(),
                change: EntityChange::Merge(fields),
            }),
            conflicts: Vec::new(),
        };
        store.commit(&commit).await.unwrap().unwrap()
    }

    fn small_caps() -> SyncConfig {
        SyncConfig {
            participant_cap: 3,
            sample_cap: 5,
            ..SyncConfig::default()
        }
    }

    #[test]
    fn test_parse_entity_types() {
        assert_eq!(parse_entity_types(None).unwrap(), EntityType::ALL.to_vec());

        let names = vec!["samples".to_string(), "sample".to_string()];
        assert_eq!(parse_entity_types(Some(&names)).unwrap(), vec![EntityType::Sample]);

        let names = vec!["freezers".to_string()];
        assert!(matches!(
            parse_entity_types(Some(&names)),
            Err(SyncError::UnknownEntityType(_))
        ));
    }

    #[tokio::test]
    async fn test_participant_cap_and_watermark() {
        let store = Arc::new(MemorySyncStore::new());
        let mut stamps = Vec::new();
        for i in 0..520 {
            stamps.push(seed(&store, EntityType::Participant, &format!("p-{:04}", i)).await);
        }
        let cursor = PullCursor::new(store.clone(), &SyncConfig::default());

        let page = cursor
            .pull("user-1", Some("tablet"), None, &[EntityType::Participant])
            .await
            .unwrap();

        let participants = &page.entities[&EntityType::Participant];
        assert_eq!(participants.len(), 500);
        assert!(page.has_more);
        assert_eq!(page.watermark, Some(stamps[499]));

        let rest = cursor
            .pull("user-1", Some("tablet"), page.watermark, &[EntityType::Participant])
            .await
            .unwrap();
        assert_eq!(rest.entities[&EntityType::Participant].len(), 20);
        assert!(!rest.has_more);
        assert_eq!(rest.watermark, Some(stamps[519]));
    }

    #[tokio::test]
    async fn test_resume_covers_every_entity() {
        let store = Arc::new(MemorySyncStore::new());
        for i in 0..4 {
            seed(&store, EntityType::Participant, &format!("p-{}", i)).await;
        }
        for i in 0..7 {
            seed(&store, EntityType::Sample, &format!("s-{}", i)).await;
        }
        let cursor = PullCursor::new(store.clone(), &small_caps());

        let mut since = None;
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10 {
            let page = cursor.pull("user-1", None, since, &EntityType::ALL).await.unwrap();
            for rows in page.entities.values() {
                for row in rows {
                    seen.insert((row.entity_type, row.id.clone()));
                }
            }
            since = page.watermark;
            if !page.has_more {
                break;
            }
        }

        assert_eq!(seen.len(), 11);
    }

    #[tokio::test]
    async fn test_watermark_falls_back_to_since() {
        let store = Arc::new(MemorySyncStore::new());
        let stamp = seed(&store, EntityType::Sample, "s-1").await;
        let cursor = PullCursor::new(store.clone(), &SyncConfig::default());

        let page = cursor
            .pull("user-1", None, Some(stamp), &EntityType::ALL)
            .await
            .unwrap();
        assert!(page.entities.values().all(Vec::is_empty));
        assert_eq!(page.watermark, Some(stamp));
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_empty_initial_pull() {
        let store = Arc::new(MemorySyncStore::new());
        let cursor = PullCursor::new(store.clone(), &SyncConfig::default());

        let page = cursor.pull("user-1", None, None, &EntityType::ALL).await.unwrap();
        assert_eq!(page.watermark, None);
        assert!(store.summary("user-1").await.unwrap().last_pull_at.is_some());
    }

    #[tokio::test]
    async fn test_type_filter_and_tombstones() {
        let store = Arc::new(MemorySyncStore::new());
        seed(&store, EntityType::Participant, "p-1").await;
        seed(&store, EntityType::Sample, "s-1").await;
        let cursor = PullCursor::new(store.clone(), &SyncConfig::default());

        let page = cursor
            .pull("user-1", None, None, &[EntityType::Sample])
            .await
            .unwrap();
        assert!(!page.entities.contains_key(&EntityType::Participant));
        assert_eq!(page.entities[&EntityType::Sample].len(), 1);

        let snapshot = store.load(EntityType::Sample, "s-1").await.unwrap().unwrap();
        let delete = MutationCommit {
            entry: MutationLogEntry {
                mutation_id: "del-1".to_string(),
                user_id: "user-1".to_string(),
                device_id: None,
                kind: "sample_delete".to_string(),
                entity_type: Some(EntityType::Sample),
                entity_id: Some("s-1".to_string()),
                status: MutationStatus::Applied,
                reason: None,
                client_timestamp: Utc::now(),
                received_at: Utc::now(),
            },
            write: Some(EntityWrite {
                entity_type: EntityType::Sample,
                entity_id: "s-1".to_string(),
                expected_updated_at: Some(snapshot.updated_at),
                modified_at: Utc::now(),
                change: EntityChange::Delete,
            }),
            conflicts: Vec::new(),
        };
        store.commit(&delete).await.unwrap();

        let page = cursor.pull("user-1", None, None, &EntityType::ALL).await.unwrap();
        assert!(page.entities[&EntityType::Sample].is_empty());
        assert_eq!(page.entities[&EntityType::Participant].len(), 1);
    }

    #[tokio::test]
    async fn test_stored_watermark_never_regresses() {
        let store = Arc::new(MemorySyncStore::new());
        let first = seed(&store, EntityType::Participant, "p-1").await;
        let second = seed(&store, EntityType::Participant, "p-2").await;
        let cursor = PullCursor::new(store.clone(), &SyncConfig::default());

        cursor
            .pull("user-1", Some("tablet"), None, &EntityType::ALL)
            .await
            .unwrap();
        let replayed = cursor
            .pull("user-1", Some("tablet"), Some(first - chrono::Duration::seconds(1)), &EntityType::ALL)
            .await
            .unwrap();
        assert_eq!(replayed.watermark, Some(second));

        let stored = store
            .advance_watermark("user-1", "tablet", first, Utc::now())
            .await
            .unwrap();
        assert_eq!(stored, second);
    }
}
