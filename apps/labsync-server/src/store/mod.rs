//! Storage collaborators of the sync engine
//!
//! The engine only sees the `EntityStore`, `MutationLog` and `SyncStore`
//! traits. Two backends implement them:
//! - `SqliteSyncStore`: sqlx/SQLite, one transaction per mutation
//! - `MemorySyncStore`: in-process, for isolated tests and throwaway servers

pub mod clock;
mod memory;
mod sqlite;
mod traits;

pub use memory::MemorySyncStore;
pub use sqlite::SqliteSyncStore;
pub use traits::{
    EntityChange, EntityStore, EntityWrite, LedgerSummary, MutationCommit, MutationLog,
    StoreError, StoredConflict, SyncStore,
};

use serde_json::{Map, Value};

/// Shallow merge: payload keys replace stored keys, other keys are kept.
pub(crate) fn merge_fields(data: &mut Map<String, Value>, fields: &Map<String, Value>) {
    for (key, value) in fields {
        data.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_keeps_untouched_fields() {
        let mut data = json!({"name": "Ada", "site": "north"})
            .as_object()
            .cloned()
            .unwrap();
        let fields = json!({"site": "south", "status": null})
            .as_object()
            .cloned()
            .unwrap();

        merge_fields(&mut data, &fields);

        assert_eq!(data["name"], "Ada");
        assert_eq!(data["site"], "south");
        assert!(data.contains_key("status"));
    }
}
