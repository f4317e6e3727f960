/// Schema for the local store and the sync queue.
///
/// Both live in one database file so a mutation and its queue entry share a
/// durability domain, even though they are written by separate statements.
pub const SCHEMA: &str = r#"
-- Keyed records per collection (serialized JSON)
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    record_key TEXT NOT NULL,
    parent_id TEXT,
    synced INTEGER NOT NULL DEFAULT 0,
    last_modified TEXT NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (collection, record_key)
);

CREATE INDEX IF NOT EXISTS idx_records_parent
    ON records(collection, parent_id);

CREATE INDEX IF NOT EXISTS idx_records_synced
    ON records(collection, synced);

-- Pending mutations, drained in id order
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueue_timestamp TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    idempotency_key TEXT NOT NULL UNIQUE,
    last_error TEXT,
    record_collection TEXT,
    record_key TEXT
);
"#;
