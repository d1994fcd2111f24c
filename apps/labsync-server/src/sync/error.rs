//! Request-level sync errors
//!
//! Anything here fails the whole push or pull. Per-mutation problems are
//! `MutationError`s and are reported inside the push outcome instead.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("batch of {size} mutations exceeds the limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("{0}")]
    UnknownEntityType(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
