use rusqlite::Connection;

use crate::error::Result;

/// Initialise the claims schema in `conn`.
///
/// Timestamps are unix milliseconds so the claim upsert can compare them
/// without parsing.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS claims (
            key         TEXT    NOT NULL PRIMARY KEY,
            owner       TEXT    NOT NULL,
            claimed_at  INTEGER NOT NULL,
            expires_at  INTEGER NOT NULL
        ) STRICT;

        -- Housekeeping: DELETE … WHERE expires_at <= ?
        CREATE INDEX IF NOT EXISTS idx_claims_expires_at ON claims (expires_at);
        ",
    )?;
    Ok(())
}
