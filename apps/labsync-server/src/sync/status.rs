//! Sync status reporting

use std::sync::Arc;

use super::error::SyncResult;
use super::types::SyncStatus;
use crate::store::{MutationLog, StoredConflict, SyncStore};

/// Upper bound on conflict records returned by one audit read
pub const MAX_CONFLICT_PAGE: usize = 500;

/// Read-only view over the mutation log
pub struct StatusReporter {
    store: Arc<dyn SyncStore>,
}

impl StatusReporter {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    pub async fn get_status(&self, user_id: &str) -> SyncResult<SyncStatus> {
        let summary = self.store.summary(user_id).await?;

        Ok(SyncStatus {
            last_successful_pull: summary.last_pull_at,
            pending_mutation_count: summary.failed_mutations,
            last_push_at: summary.last_push_at,
        })
    }

    /// Most recent conflicts recorded for the user, newest first
    pub async fn recent_conflicts(
        &self,
        user_id: &str,
        limit: usize,
    ) -> SyncResult<Vec<StoredConflict>> {
        let conflicts = self
            .store
            .recent_conflicts(user_id, limit.min(MAX_CONFLICT_PAGE))
            .await?;
        Ok(conflicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::store::MemorySyncStore;
    use crate::sync::{EntityType, MutationRecord, PullCursor, PushProcessor};
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn enroll(id: &str, entity_id: &str) -> MutationRecord {
        MutationRecord {
            id: id.to_string(),
            kind: "participant_enroll".to_string(),
            entity_id: Some(entity_id.to_string()),
            timestamp: Utc::now(),
            payload: json!({"name": "Ada", "site": "north"}),
        }
    }

    #[tokio::test]
    async fn test_status_for_new_user() {
        let reporter = StatusReporter::new(Arc::new(MemorySyncStore::new()));

        let status = reporter.get_status("nobody").await.unwrap();
        assert_eq!(status, SyncStatus::default());
    }

    #[tokio::test]
    async fn test_status_tracks_push_and_pull() {
        let store = Arc::new(MemorySyncStore::new());
        let config = SyncConfig::default();
        let push = PushProcessor::new(store.clone(), &config);
        let pull = PullCursor::new(store.clone(), &config);
        let reporter = StatusReporter::new(store.clone());

        let batch = vec![
            enroll("m-1", "p-1"),
            MutationRecord {
                id: "m-2".to_string(),
                kind: "participant_update".to_string(),
                entity_id: Some("p-missing".to_string()),
                timestamp: Utc::now(),
                payload: json!({"site": "south"}),
            },
        ];
        push.process_push(&batch, "user-1", Some("tablet")).await.unwrap();

        let status = reporter.get_status("user-1").await.unwrap();
        assert_eq!(status.pending_mutation_count, 1);
        assert!(status.last_push_at.is_some());
        assert!(status.last_successful_pull.is_none());

        pull.pull("user-1", Some("tablet"), None, &EntityType::ALL)
            .await
            .unwrap();
        let status = reporter.get_status("user-1").await.unwrap();
        assert!(status.last_successful_pull.is_some());

        assert_eq!(reporter.get_status("user-2").await.unwrap().pending_mutation_count, 0);
    }

    #[tokio::test]
    async fn test_recent_conflicts_newest_first() {
        let store = Arc::new(MemorySyncStore::new());
        let push = PushProcessor::new(store.clone(), &SyncConfig::default());
        let reporter = StatusReporter::new(store.clone());

        push.process_push(&[enroll("m-1", "p-1")], "user-1", None)
            .await
            .unwrap();

        let stale = |id: &str, site: &str| MutationRecord {
            id: id.to_string(),
            kind: "participant_update".to_string(),
            entity_id: Some("p-1".to_string()),
            timestamp: Utc::now() - Duration::hours(1),
            payload: json!({ "site": site }),
        };
        push.process_push(&[stale("m-2", "east"), stale("m-3", "west")], "user-1", None)
            .await
            .unwrap();

        let conflicts = reporter.recent_conflicts("user-1", 10_000).await.unwrap();
        assert_eq!(conflicts.len(), 2);
        assert_eq!(conflicts[0].mutation_id, "m-3");
        assert_eq!(conflicts[0].record.client_value, "west");

        assert_eq!(reporter.recent_conflicts("user-1", 1).await.unwrap().len(), 1);
        assert!(reporter.recent_conflicts("user-2", 10).await.unwrap().is_empty());
    }
}
