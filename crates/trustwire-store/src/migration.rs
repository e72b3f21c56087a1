//! Database schema migrations for SQLite.
//!
//! Each applied step is recorded in `schema_migrations`; opening a database
//! runs whatever steps it has not seen yet inside one transaction.

use rusqlite::{params, Connection, OptionalExtension};
use trustwire_core::now_millis;

use crate::error::{Result, StoreError};

/// Schema steps in order. Step `i` moves the schema to version `i + 1`.
const STEPS: &[&str] = &[
    // v1: attributes keyed by (actor, bucket, name) plus the secondary index
    r#"
    CREATE TABLE attributes (
        actor_id TEXT NOT NULL,
        bucket TEXT NOT NULL,
        name TEXT NOT NULL,
        value TEXT NOT NULL,              -- canonical JSON (sorted keys)
        expires_at INTEGER,               -- Unix ms, NULL = never
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (actor_id, bucket, name)
    );

    CREATE TABLE attribute_index (
        index_name TEXT NOT NULL,
        lookup TEXT NOT NULL,
        target TEXT NOT NULL,             -- encoded AttrKey
        PRIMARY KEY (index_name, lookup)
    );

    CREATE INDEX idx_attributes_expires ON attributes(expires_at)
        WHERE expires_at IS NOT NULL;
    "#,
];

/// Current schema version.
pub const CURRENT_VERSION: u32 = STEPS.len() as u32;

/// Bring the schema up to [`CURRENT_VERSION`]. Idempotent; refuses a
/// database written by a newer version.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        );",
    )?;

    let applied = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get::<_, Option<u32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);

    if applied > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "schema version {applied} is newer than supported {CURRENT_VERSION}"
        )));
    }
    if applied == CURRENT_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for (version, sql) in (1u32..).zip(STEPS).skip(applied as usize) {
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, now_millis()],
        )?;
    }
    tx.commit()?;

    tracing::debug!(from = applied, to = CURRENT_VERSION, "migrated attribute schema");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"attributes".to_string()));
        assert!(tables.contains(&"attribute_index".to_string()));
        assert!(tables.contains(&"schema_migrations".to_string()));
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_newer_schema_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, 0)",
            [CURRENT_VERSION + 1],
        )
        .unwrap();

        assert!(matches!(migrate(&mut conn), Err(StoreError::Migration(_))));
    }
}
