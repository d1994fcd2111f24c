//! Offline sync engine for field devices
//!
//! Provides:
//! - Idempotent push of queued mutations
//! - Last-writer-wins conflict resolution with persisted conflict records
//! - Capped, watermark-based pull of the server changefeed
//! - Per-user sync status
//!
//! # Sync Protocol
//!
//! 1. Device sends a `PushRequest` with the mutations it queued offline
//! 2. Server skips ids it has already applied, validates the rest and
//!    resolves each against the device timestamp of the entity's last write
//! 3. Stale mutations lose to the server and come back as conflicts
//! 4. Device sends a `PullRequest` with the watermark from its last pull
//! 5. Server returns live entities updated after the watermark and a new
//!    watermark to resume from
//!
//! # Conflict Resolution
//!
//! - A mutation made before the entity's latest applied mutation loses entirely
//! - Equal timestamps favor the client
//! - Deletion is a change to `is_deleted` and follows the same rule

mod conflict;
mod error;
mod pull;
mod push;
mod status;
mod types;
mod validate;

pub use conflict::{ConflictResolver, Resolution};
pub use error::{SyncError, SyncResult};
pub use pull::{parse_entity_types, PullCursor, DEFAULT_DEVICE};
pub use push::PushProcessor;
pub use status::{StatusReporter, MAX_CONFLICT_PAGE};
pub use types::{
    ConflictRecord, CreatedEntity, EntitySnapshot, EntityType, MutationAction, MutationFailure,
    MutationKind, MutationLogEntry, MutationRecord, MutationStatus, PullRequest, PullResponse,
    PushOutcome, PushRequest, SyncStatus, DELETED_FIELD,
};
pub use validate::{prepare, MutationError, PreparedMutation};
