//! Per-mutation validation
//!
//! Turns a raw `MutationRecord` into a `PreparedMutation` or a reason that
//! ends up in the push outcome's `errors` list.
//!
//! Creations may omit `entityId`; the server then assigns a v4 uuid and
//! reports it back in the push outcome's `created` list.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use super::types::{EntityType, MutationAction, MutationKind, MutationRecord, DELETED_FIELD};
use crate::store::StoreError;

/// Fields the entity store maintains itself
const RESERVED_FIELDS: [&str; 4] = ["id", "created_at", "updated_at", DELETED_FIELD];

/// Sample field pointing at the owning participant
pub const PARTICIPANT_REF: &str = "participant_id";

/// Why a single mutation was not applied
#[derive(Debug, Error)]
pub enum MutationError {
    #[error("mutation id must not be empty")]
    EmptyId,

    #[error("unknown mutation type: {0}")]
    UnknownType(String),

    #[error("payload must be a JSON object")]
    PayloadNotObject,

    #[error("field `{0}` is managed by the server")]
    ReservedField(String),

    #[error("{0} requires an entityId")]
    MissingEntityId(&'static str),

    #[error("field `{field}` is required for {kind}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("{entity_type} {entity_id} does not exist")]
    EntityNotFound {
        entity_type: EntityType,
        entity_id: String,
    },

    #[error("{entity_type} {entity_id} has been deleted")]
    EntityDeleted {
        entity_type: EntityType,
        entity_id: String,
    },

    #[error("`{field}` references unknown participant {target}")]
    MissingReference { field: &'static str, target: String },

    #[error("{entity_type} {entity_id} kept changing; gave up after {attempts} attempts")]
    Contended {
        entity_type: EntityType,
        entity_id: String,
        attempts: usize,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

/// A validated mutation, ready for conflict resolution
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedMutation {
    pub id: String,
    pub kind: MutationKind,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub client_timestamp: DateTime<Utc>,
    /// Fields the mutation touches; deletions touch only `is_deleted`
    pub fields: Map<String, Value>,
}

impl PreparedMutation {
    pub fn action(&self) -> MutationAction {
        self.kind.action()
    }
}

/// Validate a client mutation in isolation (no store access).
pub fn prepare(record: &MutationRecord) -> Result<PreparedMutation, MutationError> {
    if record.id.trim().is_empty() {
        return Err(MutationError::EmptyId);
    }

    let kind: MutationKind = record
        .kind
        .parse()
        .map_err(|_| MutationError::UnknownType(record.kind.clone()))?;

    let mut fields = match &record.payload {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        _ => return Err(MutationError::PayloadNotObject),
    };

    if let Some(reserved) = RESERVED_FIELDS.iter().find(|f| fields.contains_key(**f)) {
        return Err(MutationError::ReservedField(reserved.to_string()));
    }

    let entity_id = match (kind.action(), record.entity_id.as_deref().map(str::trim)) {
        (_, Some(id)) if !id.is_empty() => id.to_string(),
        (MutationAction::Create, _) => Uuid::new_v4().to_string(),
        _ => return Err(MutationError::MissingEntityId(kind.as_str())),
    };

    match kind {
        MutationKind::SampleRegister => {
            if !matches!(fields.get(PARTICIPANT_REF), Some(Value::String(_))) {
                return Err(MutationError::MissingField {
                    kind: kind.as_str(),
                    field: PARTICIPANT_REF,
                });
            }
        }
        MutationKind::ParticipantCheckin => {
            fields
                .entry("status")
                .or_insert_with(|| Value::String("checked_in".to_string()));
            fields.entry("checked_in_at").or_insert_with(|| {
                Value::String(record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true))
            });
        }
        MutationKind::ParticipantDelete | MutationKind::SampleDelete => {
            fields = Map::new();
            fields.insert(DELETED_FIELD.to_string(), Value::Bool(true));
        }
        _ => {}
    }

    if kind.action() != MutationAction::Delete && fields.is_empty() {
        return Err(MutationError::MissingField {
            kind: kind.as_str(),
            field: "payload",
        });
    }

    Ok(PreparedMutation {
        id: record.id.clone(),
        kind,
        entity_type: kind.entity_type(),
        entity_id,
        client_timestamp: record.timestamp,
        fields,
    })
}
