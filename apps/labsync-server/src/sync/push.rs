//! Push processing
//!
//! Applies a device's queued mutations in the order the device sent them.
//! Each mutation is checked against the mutation log, validated, resolved
//! against the current entity snapshot and committed in its own transaction,
//! so one bad mutation never rolls back or blocks the others.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use super::conflict::{ConflictResolver, Resolution};
use super::error::{SyncError, SyncResult};
use super::types::{
    ConflictRecord, CreatedEntity, EntitySnapshot, EntityType, MutationAction, MutationFailure,
    MutationKind, MutationLogEntry, MutationRecord, MutationStatus, PushOutcome, DELETED_FIELD,
};
use super::validate::{prepare, MutationError, PreparedMutation, PARTICIPANT_REF};
use crate::config::SyncConfig;
use crate::store::{
    EntityChange, EntityStore, EntityWrite, MutationCommit, MutationLog, StoreError, SyncStore,
};

/// What happened to one mutation
#[derive(Debug)]
enum Step {
    /// Carries the entity id when the server generated it
    Applied(Option<CreatedEntity>),
    Skipped,
    Conflict(Vec<ConflictRecord>),
}

/// Identity of the pushing caller
struct PushContext<'a> {
    user_id: &'a str,
    device_id: Option<&'a str>,
}

/// Applies push batches against a `SyncStore`
pub struct PushProcessor {
    store: Arc<dyn SyncStore>,
    resolver: ConflictResolver,
    max_batch_size: usize,
    commit_attempts: usize,
}

impl PushProcessor {
    pub fn new(store: Arc<dyn SyncStore>, config: &SyncConfig) -> Self {
        Self {
            store,
            resolver: ConflictResolver::new(),
            max_batch_size: config.max_batch_size,
            commit_attempts: config.commit_attempts.max(1),
        }
    }

    /// Apply a batch of mutations in client order.
    ///
    /// Only an oversized batch or an unreachable store fails the call; every
    /// other problem is reported per mutation in the outcome.
    pub async fn process_push(
        &self,
        mutations: &[MutationRecord],
        user_id: &str,
        device_id: Option<&str>,
    ) -> SyncResult<PushOutcome> {
        if mutations.len() > self.max_batch_size {
            return Err(SyncError::BatchTooLarge {
                size: mutations.len(),
                max: self.max_batch_size,
            });
        }

        // Fail before recording anything when the store is down
        self.store.ping().await?;

        let ctx = PushContext { user_id, device_id };
        let mut outcome = PushOutcome {
            total: mutations.len(),
            ..Default::default()
        };

        for record in mutations {
            match self.process_one(record, &ctx).await {
                Ok(Step::Applied(created)) => {
                    outcome.applied += 1;
                    outcome.created.extend(created);
                }
                Ok(Step::Skipped) => {
                    tracing::debug!("Mutation {} already processed, skipping", record.id);
                    outcome.skipped += 1;
                }
                Ok(Step::Conflict(conflicts)) => {
                    tracing::debug!(
                        "Mutation {} lost to newer server state ({} fields)",
                        record.id,
                        conflicts.len()
                    );
                    outcome.conflicts.extend(conflicts);
                }
                Err(MutationError::Storage(StoreError::Unavailable(reason))) => {
                    tracing::error!("Store became unavailable during push: {}", reason);
                    return Err(StoreError::Unavailable(reason).into());
                }
                Err(err) => {
                    tracing::warn!("Mutation {} rejected: {}", record.id, err);
                    self.record_failure(record, &ctx, &err).await?;
                    outcome.errors.push(MutationFailure {
                        mutation_id: record.id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            "Push from user {} device {}: {} total, {} applied, {} skipped, {} conflicts, {} errors",
            user_id,
            device_id.unwrap_or("-"),
            outcome.total,
            outcome.applied,
            outcome.skipped,
            outcome.conflicts.len(),
            outcome.errors.len()
        );

        Ok(outcome)
    }

    async fn process_one(
        &self,
        record: &MutationRecord,
        ctx: &PushContext<'_>,
    ) -> Result<Step, MutationError> {
        if let Some(existing) = self.store.find_mutation(&record.id).await? {
            if existing.status.is_final() {
                return Ok(Step::Skipped);
            }
        }

        let mutation = prepare(record)?;

        for attempt in 1..=self.commit_attempts {
            let snapshot = self
                .store
                .load(mutation.entity_type, &mutation.entity_id)
                .await?;
            self.check_preconditions(&mutation, snapshot.as_ref()).await?;

            let resolution = self.resolver.resolve(snapshot.as_ref(), &mutation);
            let commit = self.build_commit(&mutation, snapshot.as_ref(), &resolution, ctx);

            match self.store.commit(&commit).await {
                Ok(_) if resolution.is_conflict() => {
                    return Ok(Step::Conflict(resolution.conflicts));
                }
                Ok(_) => {
                    let generated = record
                        .entity_id
                        .as_deref()
                        .map_or(true, |id| id.trim().is_empty());
                    return Ok(Step::Applied(generated.then(|| CreatedEntity {
                        mutation_id: mutation.id.clone(),
                        entity_type: mutation.entity_type,
                        entity_id: mutation.entity_id.clone(),
                    })));
                }
                Err(StoreError::DuplicateMutation(_)) => return Ok(Step::Skipped),
                Err(StoreError::StaleSnapshot { .. }) => {
                    tracing::debug!(
                        "{} {} changed during mutation {} (attempt {}), re-resolving",
                        mutation.entity_type,
                        mutation.entity_id,
                        mutation.id,
                        attempt
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(MutationError::Contended {
            entity_type: mutation.entity_type,
            entity_id: mutation.entity_id,
            attempts: self.commit_attempts,
        })
    }

    /// Checks that need the store: target existence, tombstones and references.
    async fn check_preconditions(
        &self,
        mutation: &PreparedMutation,
        snapshot: Option<&EntitySnapshot>,
    ) -> Result<(), MutationError> {
        match snapshot {
            None if mutation.action() != MutationAction::Create => {
                // Orphan reference: nothing earlier in this batch or on the server created it
                return Err(MutationError::EntityNotFound {
                    entity_type: mutation.entity_type,
                    entity_id: mutation.entity_id.clone(),
                });
            }
            Some(s)
                if s.is_deleted
                    && mutation.action() != MutationAction::Delete
                    && !self.resolver.is_stale(Some(s), mutation.client_timestamp) =>
            {
                return Err(MutationError::EntityDeleted {
                    entity_type: mutation.entity_type,
                    entity_id: mutation.entity_id.clone(),
                });
            }
            _ => {}
        }

        if mutation.entity_type == EntityType::Sample {
            if let Some(reference) = mutation.fields.get(PARTICIPANT_REF) {
                let target = match reference {
                    Value::String(id) => id.as_str(),
                    other => {
                        return Err(MutationError::MissingReference {
                            field: PARTICIPANT_REF,
                            target: other.to_string(),
                        })
                    }
                };

                let participant = self.store.load(EntityType::Participant, target).await?;
                let live = participant.map_or(false, |p| !p.is_deleted);
                if !live {
                    return Err(MutationError::MissingReference {
                        field: PARTICIPANT_REF,
                        target: target.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    fn build_commit(
        &self,
        mutation: &PreparedMutation,
        snapshot: Option<&EntitySnapshot>,
        resolution: &Resolution,
        ctx: &PushContext<'_>,
    ) -> MutationCommit {
        let status = if resolution.is_conflict() {
            MutationStatus::Conflict
        } else {
            MutationStatus::Applied
        };

        let change = if resolution.is_conflict() || resolution.is_noop() {
            None
        } else if mutation.action() == MutationAction::Delete {
            // Deleting a tombstone changes nothing
            match snapshot {
                Some(s) if s.is_deleted => None,
                _ => Some(EntityChange::Delete),
            }
        } else {
            let mut fields = resolution.applied.clone();
            fields.remove(DELETED_FIELD);
            Some(EntityChange::Merge(fields))
        };

        MutationCommit {
            entry: MutationLogEntry {
                mutation_id: mutation.id.clone(),
                user_id: ctx.user_id.to_string(),
                device_id: ctx.device_id.map(str::to_string),
                kind: mutation.kind.as_str().to_string(),
                entity_type: Some(mutation.entity_type),
                entity_id: Some(mutation.entity_id.clone()),
                status,
                reason: None,
                client_timestamp: mutation.client_timestamp,
                received_at: Utc::now(),
            },
            write: change.map(|change| EntityWrite {
                entity_type: mutation.entity_type,
                entity_id: mutation.entity_id.clone(),
                expected_updated_at: snapshot.map(|s| s.updated_at),
                modified_at: mutation.client_timestamp,
                change,
            }),
            conflicts: resolution.conflicts.clone(),
        }
    }

    /// Log a rejected mutation so status reports can count it. Only an
    /// unreachable store aborts the batch.
    async fn record_failure(
        &self,
        record: &MutationRecord,
        ctx: &PushContext<'_>,
        err: &MutationError,
    ) -> SyncResult<()> {
        let kind = record.kind.parse::<MutationKind>().ok();
        let entry = MutationLogEntry {
            mutation_id: record.id.clone(),
            user_id: ctx.user_id.to_string(),
            device_id: ctx.device_id.map(str::to_string),
            kind: record.kind.clone(),
            entity_type: kind.map(MutationKind::entity_type),
            entity_id: record.entity_id.clone(),
            status: MutationStatus::Failed,
            reason: Some(err.to_string()),
            client_timestamp: record.timestamp,
            received_at: Utc::now(),
        };

        match self.store.record_failure(&entry).await {
            Ok(()) => Ok(()),
            Err(StoreError::Unavailable(reason)) => Err(StoreError::Unavailable(reason).into()),
            Err(other) => {
                tracing::warn!("Failed to log rejected mutation {}: {}", record.id, other);
                Ok(())
            }
        }
    }
}
