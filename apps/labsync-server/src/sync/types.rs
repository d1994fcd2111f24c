//! Sync data types
//!
//! Defines the wire and ledger types of the offline sync protocol:
//! - Client mutations and their kinds
//! - Entity snapshots served by the entity store
//! - Conflict records, log entries and push/pull payloads

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Types of entities that can be synced
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    #[serde(alias = "participants")]
    Participant,
    #[serde(alias = "samples")]
    Sample,
}

impl EntityType {
    /// Every syncable entity type, in pull order
    pub const ALL: [EntityType; 2] = [EntityType::Participant, EntityType::Sample];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Participant => "participant",
            EntityType::Sample => "sample",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "participant" | "participants" => Ok(EntityType::Participant),
            "sample" | "samples" => Ok(EntityType::Sample),
            other => Err(format!("unknown entity type: {}", other)),
        }
    }
}

/// What a mutation does to its entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

/// Mutation kinds accepted from field devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    ParticipantEnroll,
    ParticipantUpdate,
    ParticipantCheckin,
    ParticipantDelete,
    SampleRegister,
    SampleUpdate,
    SampleDelete,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::ParticipantEnroll => "participant_enroll",
            MutationKind::ParticipantUpdate => "participant_update",
            MutationKind::ParticipantCheckin => "participant_checkin",
            MutationKind::ParticipantDelete => "participant_delete",
            MutationKind::SampleRegister => "sample_register",
            MutationKind::SampleUpdate => "sample_update",
            MutationKind::SampleDelete => "sample_delete",
        }
    }

    pub fn entity_type(self) -> EntityType {
        match self {
            MutationKind::ParticipantEnroll
            | MutationKind::ParticipantUpdate
            | MutationKind::ParticipantCheckin
            | MutationKind::ParticipantDelete => EntityType::Participant,
            MutationKind::SampleRegister
            | MutationKind::SampleUpdate
            | MutationKind::SampleDelete => EntityType::Sample,
        }
    }

    pub fn action(self) -> MutationAction {
        match self {
            MutationKind::ParticipantEnroll | MutationKind::SampleRegister => {
                MutationAction::Create
            }
            MutationKind::ParticipantDelete | MutationKind::SampleDelete => MutationAction::Delete,
            _ => MutationAction::Update,
        }
    }
}

impl FromStr for MutationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "participant_enroll" => MutationKind::ParticipantEnroll,
            "participant_update" => MutationKind::ParticipantUpdate,
            "participant_checkin" => MutationKind::ParticipantCheckin,
            "participant_delete" => MutationKind::ParticipantDelete,
            "sample_register" => MutationKind::SampleRegister,
            "sample_update" => MutationKind::SampleUpdate,
            "sample_delete" => MutationKind::SampleDelete,
            other => return Err(format!("unknown mutation type: {}", other)),
        };
        Ok(kind)
    }
}

/// A mutation queued on a device and submitted in a push
///
/// `kind` stays a raw string so that one unknown type fails only its own
/// mutation instead of the whole request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRecord {
    /// Client-generated id, unique per device
    pub id: String,
    /// Mutation kind, e.g. `participant_checkin`
    #[serde(rename = "type")]
    pub kind: String,
    /// Target entity; may be absent for creations
    #[serde(rename = "entityId", default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Device clock at mutation creation
    pub timestamp: DateTime<Utc>,
    /// Field changes
    #[serde(default)]
    pub payload: Value,
}

/// Authoritative server-side state of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    #[serde(rename = "entityType")]
    pub entity_type: EntityType,
    pub id: String,
    pub data: Map<String, Value>,
    #[serde(rename = "isDeleted")]
    pub is_deleted: bool,
    /// Server stamp of the latest write; orders the changefeed
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    /// Device timestamp of the mutation behind the latest write
    #[serde(rename = "modifiedAt")]
    pub modified_at: DateTime<Utc>,
}

impl EntitySnapshot {
    /// Current value of a field; `is_deleted` is exposed as a pseudo-field
    pub fn field(&self, name: &str) -> Value {
        if name == DELETED_FIELD {
            return Value::Bool(self.is_deleted);
        }
        self.data.get(name).cloned().unwrap_or(Value::Null)
    }
}

/// Pseudo-field used to express deletions as field changes
pub const DELETED_FIELD: &str = "is_deleted";

/// One field of a losing mutation, kept as an audit artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    #[serde(rename = "entityType")]
    pub entity_type: EntityType,
    #[serde(rename = "entityId")]
    pub entity_id: String,
    pub field: String,
    #[serde(rename = "clientValue")]
    pub client_value: Value,
    #[serde(rename = "serverValue")]
    pub server_value: Value,
    #[serde(rename = "resolvedValue")]
    pub resolved_value: Value,
}

/// Outcome recorded for a mutation id in the mutation log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    /// Payload written to the entity store
    Applied,
    /// Lost to fresher server state; conflict records written
    Conflict,
    /// Rejected; may be resubmitted under the same id
    Failed,
}

impl MutationStatus {
    /// Final statuses make later submissions of the same id no-ops
    pub fn is_final(self) -> bool {
        matches!(self, MutationStatus::Applied | MutationStatus::Conflict)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MutationStatus::Applied => "applied",
            MutationStatus::Conflict => "conflict",
            MutationStatus::Failed => "failed",
        }
    }
}

impl FromStr for MutationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applied" => Ok(MutationStatus::Applied),
            "conflict" => Ok(MutationStatus::Conflict),
            "failed" => Ok(MutationStatus::Failed),
            other => Err(format!("unknown mutation status: {}", other)),
        }
    }
}

/// Mutation log row
#[derive(Debug, Clone, PartialEq)]
pub struct MutationLogEntry {
    pub mutation_id: String,
    pub user_id: String,
    pub device_id: Option<String>,
    pub kind: String,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub status: MutationStatus,
    pub reason: Option<String>,
    pub client_timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// A mutation that could not be applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationFailure {
    #[serde(rename = "mutationId")]
    pub mutation_id: String,
    pub reason: String,
}

/// Request to push queued mutations to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    /// Device making the push
    #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Mutations in the order the device created them
    pub mutations: Vec<MutationRecord>,
}

/// Entity id the server generated for a creation sent without one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedEntity {
    #[serde(rename = "mutationId")]
    pub mutation_id: String,
    #[serde(rename = "entityType")]
    pub entity_type: EntityType,
    #[serde(rename = "entityId")]
    pub entity_id: String,
}

/// Aggregate result of one push
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushOutcome {
    pub total: usize,
    pub applied: usize,
    /// Already-applied ids replayed by the device
    pub skipped: usize,
    pub conflicts: Vec<ConflictRecord>,
    pub errors: Vec<MutationFailure>,
    /// Server-generated ids, so the device can target them before its next pull
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub created: Vec<CreatedEntity>,
}

/// Request to pull the server changefeed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequest {
    #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Watermark returned by the previous pull
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    /// Entity types to include; all syncable types when absent
    #[serde(rename = "entityTypes", default, skip_serializing_if = "Option::is_none")]
    pub entity_types: Option<Vec<String>>,
}

/// Changefeed page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    pub entities: BTreeMap<EntityType, Vec<EntitySnapshot>>,
    /// Resume point for the next pull
    pub watermark: Option<DateTime<Utc>>,
    /// Whether any entity type was truncated at its cap
    #[serde(rename = "hasMore")]
    pub has_more: bool,
}

/// Sync status for a user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    #[serde(rename = "lastSuccessfulPull")]
    pub last_successful_pull: Option<DateTime<Utc>>,
    /// Mutations received but not applied
    #[serde(rename = "pendingMutationCount")]
    pub pending_mutation_count: u64,
    #[serde(rename = "lastPushAt")]
    pub last_push_at: Option<DateTime<Utc>>,
}
