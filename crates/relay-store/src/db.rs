use rusqlite::{Connection, Result};

/// Initialise the key-value table. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_kv_table(conn)
}

/// `expires_at` is a unix timestamp in seconds; NULL means the entry never expires.
fn create_kv_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS kv (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            expires_at  INTEGER,
            updated_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_kv_expires
            ON kv(expires_at);",
    )
}
