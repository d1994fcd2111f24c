//! Conflict detection and resolution
//!
//! Last-writer-wins by entity freshness. Freshness is measured on the device
//! clock: a mutation created before the mutation behind the entity's latest
//! write (`modified_at`) loses as a whole. None of its fields are applied,
//! and every field whose value differs from the server's is reported.
//! Mixing client and server fields within one entity is never done.
//!
//! The server's own `updated_at` stamp only orders the changefeed and is never
//! compared with device timestamps.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::types::{ConflictRecord, EntitySnapshot, MutationAction, DELETED_FIELD};
use super::validate::PreparedMutation;

/// Stateless last-writer-wins resolver
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

/// Fields to write, or the conflicts that prevented writing them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub applied: Map<String, Value>,
    pub conflicts: Vec<ConflictRecord>,
}

impl Resolution {
    pub fn is_conflict(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Nothing to write and nothing lost
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() && self.conflicts.is_empty()
    }
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Whether the entity's latest write came from a mutation made after this one
    pub fn is_stale(&self, snapshot: Option<&EntitySnapshot>, client_timestamp: DateTime<Utc>) -> bool {
        snapshot.map_or(false, |s| s.modified_at > client_timestamp)
    }

    /// Resolve a mutation against the current server state.
    ///
    /// `applied` and `conflicts` are never both non-empty.
    pub fn resolve(
        &self,
        snapshot: Option<&EntitySnapshot>,
        mutation: &PreparedMutation,
    ) -> Resolution {
        let Some(snapshot) = snapshot else {
            // Creations have nothing to conflict with
            return Resolution {
                applied: mutation.fields.clone(),
                conflicts: Vec::new(),
            };
        };

        let mut touched = mutation.fields.clone();
        if snapshot.is_deleted && mutation.action() != MutationAction::Delete {
            // Writing to a tombstone implicitly asks for it to be live again
            touched.insert(DELETED_FIELD.to_string(), Value::Bool(false));
        }

        if !self.is_stale(Some(snapshot), mutation.client_timestamp) {
            return Resolution {
                applied: touched,
                conflicts: Vec::new(),
            };
        }

        let conflicts = touched
            .into_iter()
            .filter_map(|(field, client_value)| {
                let server_value = snapshot.field(&field);
                (server_value != client_value).then(|| ConflictRecord {
                    entity_type: snapshot.entity_type,
                    entity_id: snapshot.id.clone(),
                    field,
                    client_value,
                    resolved_value: server_value.clone(),
                    server_value,
                })
            })
            .collect();

        Resolution {
            applied: Map::new(),
            conflicts,
        }
    }
}
