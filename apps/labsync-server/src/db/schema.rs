//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

// Timestamps are INTEGER microseconds since the epoch so that ordering and
// watermark comparisons are exact. `updated_at` is the server stamp that orders
// the changefeed; `modified_at` is the device timestamp of the mutation that
// last wrote the row and decides last-writer-wins.
const SCHEMA_SQL: &str = r#"
-- Participants (entity store)
CREATE TABLE IF NOT EXISTS participants (
    id TEXT PRIMARY KEY,
    data TEXT NOT NULL DEFAULT '{}',
    is_deleted INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    modified_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_participants_changefeed ON participants(updated_at, id);

-- Samples (entity store)
CREATE TABLE IF NOT EXISTS samples (
    id TEXT PRIMARY KEY,
    data TEXT NOT NULL DEFAULT '{}',
    is_deleted INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    modified_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_samples_changefeed ON samples(updated_at, id);

-- Mutation log (idempotency ledger)
CREATE TABLE IF NOT EXISTS sync_mutations (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    device_id TEXT,
    mutation_type TEXT NOT NULL,
    entity_type TEXT,
    entity_id TEXT,
    status TEXT NOT NULL,
    reason TEXT,
    client_timestamp INTEGER NOT NULL,
    received_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_mutations_user ON sync_mutations(user_id, status);

-- Conflict records (append-only audit)
CREATE TABLE IF NOT EXISTS sync_conflicts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mutation_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    field TEXT NOT NULL,
    client_value TEXT NOT NULL,
    server_value TEXT NOT NULL,
    resolved_value TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_conflicts_user ON sync_conflicts(user_id, id);

-- Pull watermarks per device
CREATE TABLE IF NOT EXISTS sync_watermarks (
    user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    watermark INTEGER NOT NULL,
    pulled_at INTEGER NOT NULL,
    PRIMARY KEY (user_id, device_id)
);

-- Store-wide updated_at clock
CREATE TABLE IF NOT EXISTS sync_clock (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_micros INTEGER NOT NULL
);

INSERT OR IGNORE INTO sync_clock (id, last_micros) VALUES (1, 0);
"#;
