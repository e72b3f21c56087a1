//! SQLite implementation of the AttributeStore trait.
//!
//! This is the persistent backend. It uses rusqlite with bundled SQLite,
//! wrapped in async via tokio::spawn_blocking. Values are stored as
//! canonical JSON text so compare-and-swap is a single conditional UPDATE.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use trustwire_core::now_millis;

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{canonical_json, expiry_for, AttrKey, AttributeStore, SweepReport};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking operation on the connection off the async runtime.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::LockPoisoned(format!("sqlite connection: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(format!("spawn_blocking failed: {}", e)))?
    }
}

fn decode_value(text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|e| StoreError::InvalidData(format!("stored value: {}", e)))
}

const LIVE: &str = "(expires_at IS NULL OR expires_at > ?)";

#[async_trait]
impl AttributeStore for SqliteStore {
    async fn get_attr(&self, key: &AttrKey) -> Result<Option<Value>> {
        let key = key.clone();
        self.run(move |conn| {
            let text: Option<String> = conn
                .query_row(
                    &format!(
                        "SELECT value FROM attributes
                         WHERE actor_id = ? AND bucket = ? AND name = ? AND {LIVE}"
                    ),
                    params![key.actor_id, key.bucket, key.name, now_millis()],
                    |row| row.get(0),
                )
                .optional()?;
            text.as_deref().map(decode_value).transpose()
        })
        .await
    }

    async fn set_attr(&self, key: &AttrKey, value: Value, ttl: Option<Duration>) -> Result<()> {
        let key = key.clone();
        let text = canonical_json(&value);
        self.run(move |conn| {
            let now = now_millis();
            let expires_at = ttl.map(|ttl| expiry_for(now, ttl));
            conn.execute(
                "INSERT INTO attributes (actor_id, bucket, name, value, expires_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (actor_id, bucket, name) DO UPDATE SET
                    value = excluded.value,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at",
                params![key.actor_id, key.bucket, key.name, text, expires_at, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_attr(&self, key: &AttrKey) -> Result<bool> {
        let key = key.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let live = tx.execute(
                &format!(
                    "DELETE FROM attributes
                     WHERE actor_id = ? AND bucket = ? AND name = ? AND {LIVE}"
                ),
                params![key.actor_id, key.bucket, key.name, now_millis()],
            )?;
            // Drop any expired leftover too.
            tx.execute(
                "DELETE FROM attributes WHERE actor_id = ?1 AND bucket = ?2 AND name = ?3",
                params![key.actor_id, key.bucket, key.name],
            )?;
            tx.commit()?;
            Ok(live > 0)
        })
        .await
    }

    async fn conditional_update_attr(
        &self,
        key: &AttrKey,
        old: Option<&Value>,
        new: Value,
    ) -> Result<bool> {
        let key = key.clone();
        let old = old.map(canonical_json);
        let new = canonical_json(&new);
        self.run(move |conn| {
            let now = now_millis();
            let changed = match old {
                Some(old) => conn.execute(
                    &format!(
                        "UPDATE attributes SET value = ?, expires_at = NULL, updated_at = ?
                         WHERE actor_id = ? AND bucket = ? AND name = ? AND value = ? AND {LIVE}"
                    ),
                    params![new, now, key.actor_id, key.bucket, key.name, old, now],
                )?,
                None => {
                    let tx = conn.transaction()?;
                    tx.execute(
                        "DELETE FROM attributes
                         WHERE actor_id = ?1 AND bucket = ?2 AND name = ?3
                           AND expires_at IS NOT NULL AND expires_at <= ?4",
                        params![key.actor_id, key.bucket, key.name, now],
                    )?;
                    let inserted = tx.execute(
                        "INSERT INTO attributes (actor_id, bucket, name, value, expires_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, NULL, ?5)
                         ON CONFLICT (actor_id, bucket, name) DO NOTHING",
                        params![key.actor_id, key.bucket, key.name, new, now],
                    )?;
                    tx.commit()?;
                    inserted
                }
            };
            Ok(changed == 1)
        })
        .await
    }

    async fn list_bucket(&self, actor_id: &str, bucket: &str) -> Result<BTreeMap<String, Value>> {
        let actor_id = actor_id.to_string();
        let bucket = bucket.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT name, value FROM attributes
                 WHERE actor_id = ? AND bucket = ? AND {LIVE}
                 ORDER BY name"
            ))?;
            let rows = stmt.query_map(params![actor_id, bucket, now_millis()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut out = BTreeMap::new();
            for row in rows {
                let (name, text) = row?;
                out.insert(name, decode_value(&text)?);
            }
            Ok(out)
        })
        .await
    }

    async fn delete_bucket(&self, actor_id: &str, bucket: &str) -> Result<usize> {
        let actor_id = actor_id.to_string();
        let bucket = bucket.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let live = tx.execute(
                &format!("DELETE FROM attributes WHERE actor_id = ? AND bucket = ? AND {LIVE}"),
                params![actor_id, bucket, now_millis()],
            )?;
            tx.execute(
                "DELETE FROM attributes WHERE actor_id = ?1 AND bucket = ?2",
                params![actor_id, bucket],
            )?;
            tx.commit()?;
            Ok(live)
        })
        .await
    }

    async fn list_buckets(&self, actor_id: &str) -> Result<Vec<String>> {
        let actor_id = actor_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT DISTINCT bucket FROM attributes
                 WHERE actor_id = ? AND {LIVE}
                 ORDER BY bucket"
            ))?;
            let buckets = stmt
                .query_map(params![actor_id, now_millis()], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(buckets)
        })
        .await
    }

    async fn set_index(&self, index: &str, lookup: &str, target: &AttrKey) -> Result<()> {
        let index = index.to_string();
        let lookup = lookup.to_string();
        let target = target.to_index_target();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO attribute_index (index_name, lookup, target) VALUES (?1, ?2, ?3)
                 ON CONFLICT (index_name, lookup) DO UPDATE SET target = excluded.target",
                params![index, lookup, target],
            )?;
            Ok(())
        })
        .await
    }

    async fn lookup_index(&self, index: &str, lookup: &str) -> Result<Option<AttrKey>> {
        let index = index.to_string();
        let lookup = lookup.to_string();
        self.run(move |conn| {
            let target: Option<String> = conn
                .query_row(
                    "SELECT target FROM attribute_index WHERE index_name = ?1 AND lookup = ?2",
                    params![index, lookup],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(target.and_then(|t| AttrKey::from_index_target(&t)))
        })
        .await
    }

    async fn delete_index(&self, index: &str, lookup: &str) -> Result<bool> {
        let index = index.to_string();
        let lookup = lookup.to_string();
        self.run(move |conn| {
            let removed = conn.execute(
                "DELETE FROM attribute_index WHERE index_name = ?1 AND lookup = ?2",
                params![index, lookup],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn sweep_expired(&self, now: i64) -> Result<SweepReport> {
        let report = self
            .run(move |conn| {
                let tx = conn.transaction()?;
                let mut report = SweepReport {
                    expired: tx.execute(
                        "DELETE FROM attributes WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                        params![now],
                    )?,
                    ..SweepReport::default()
                };

                let entries: Vec<(String, String, String)> = {
                    let mut stmt =
                        tx.prepare("SELECT index_name, lookup, target FROM attribute_index")?;
                    let rows = stmt.query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })?;
                    rows.collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?
                };

                for (index, lookup, target) in entries {
                    let Some(key) = AttrKey::from_index_target(&target) else {
                        report.malformed_index += 1;
                        continue;
                    };
                    let exists: bool = tx.query_row(
                        "SELECT EXISTS(SELECT 1 FROM attributes
                         WHERE actor_id = ?1 AND bucket = ?2 AND name = ?3)",
                        params![key.actor_id, key.bucket, key.name],
                        |row| row.get(0),
                    )?;
                    if !exists {
                        tx.execute(
                            "DELETE FROM attribute_index WHERE index_name = ?1 AND lookup = ?2",
                            params![index, lookup],
                        )?;
                        report.orphaned_index += 1;
                    }
                }

                tx.commit()?;
                Ok(report)
            })
            .await?;

        if report.malformed_index > 0 {
            tracing::warn!(count = report.malformed_index, "skipped malformed index entries");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StoreExt;
    use crate::memory::MemoryStore;
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn key(name: &str) -> AttrKey {
        AttrKey::new("alice", "_callback_state", name)
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .set_attr(&key("bob:sub1"), json!({"last_sequence": 3, "pending": {}}), None)
            .await
            .unwrap();

        let got = store.get_attr(&key("bob:sub1")).await.unwrap().unwrap();
        assert_eq!(got["last_sequence"], 3);
        assert_eq!(store.get_attr(&key("missing")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_clears_ttl() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .set_attr(&key("k"), json!(1), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        store.set_attr(&key("k"), json!(2), None).await.unwrap();

        let report = store.sweep_expired(i64::MAX).await.unwrap();
        assert_eq!(report.expired, 0);
        assert_eq!(store.get_attr(&key("k")).await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_cas_semantics() {
        let store = SqliteStore::open_memory().unwrap();
        let k = key("seq");

        assert!(store.conditional_update_attr(&k, None, json!({"n": 1})).await.unwrap());
        assert!(!store.conditional_update_attr(&k, None, json!({"n": 9})).await.unwrap());

        let old: Value = serde_json::from_str(r#"{"n":1}"#).unwrap();
        assert!(store
            .conditional_update_attr(&k, Some(&old), json!({"n": 2}))
            .await
            .unwrap());
        assert!(!store
            .conditional_update_attr(&k, Some(&old), json!({"n": 3}))
            .await
            .unwrap());
        assert_eq!(store.get_attr(&k).await.unwrap(), Some(json!({"n": 2})));
    }

    #[tokio::test]
    async fn test_cas_key_order_independent() {
        let store = SqliteStore::open_memory().unwrap();
        let k = key("state");
        let stored: Value = serde_json::from_str(r#"{"z":1,"a":{"y":2,"b":3}}"#).unwrap();
        store.set_attr(&k, stored, None).await.unwrap();

        let expected = json!({"a": {"b": 3, "y": 2}, "z": 1});
        assert!(store
            .conditional_update_attr(&k, Some(&expected), json!(0))
            .await
            .unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cas_single_winner() {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let k = key("race");

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                store.conditional_update_attr(&k, None, json!(i)).await.unwrap()
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_increment_counter_contended() {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let k = AttrKey::new("alice", "_outbound_sequence", "bob:sub1");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                for _ in 0..5 {
                    got.push(store.increment_counter(&k).await.unwrap());
                }
                got
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        all.sort();
        assert_eq!(all, (1..=20).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_expired_reads_as_absent_and_cas_can_recreate() {
        let store = SqliteStore::open_memory().unwrap();
        let k = key("ttl");
        store.set_attr(&k, json!("old"), None).await.unwrap();

        // Force the row into the past.
        {
            let conn = store.conn.lock().unwrap();
            conn.execute("UPDATE attributes SET expires_at = 1", []).unwrap();
        }

        assert_eq!(store.get_attr(&k).await.unwrap(), None);
        assert!(store.list_bucket("alice", "_callback_state").await.unwrap().is_empty());
        assert!(store.conditional_update_attr(&k, None, json!("new")).await.unwrap());
        assert_eq!(store.get_attr(&k).await.unwrap(), Some(json!("new")));
    }

    #[tokio::test]
    async fn test_sweep_and_index() {
        let store = SqliteStore::open_memory().unwrap();
        let target = AttrKey::new("alice", "_trust", "bob");
        store.set_attr(&target, json!({}), Some(Duration::from_secs(5))).await.unwrap();
        store.set_index("trust_by_secret", "abc", &target).await.unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO attribute_index (index_name, lookup, target) VALUES ('x', 'y', 'garbage')",
                [],
            )
            .unwrap();
        }

        assert_eq!(
            store.lookup_index("trust_by_secret", "abc").await.unwrap(),
            Some(target.clone())
        );
        assert_eq!(store.lookup_index("x", "y").await.unwrap(), None);

        let report = store.sweep_expired(now_millis() + 3_600_000).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                expired: 1,
                orphaned_index: 1,
                malformed_index: 1
            }
        );
        assert_eq!(store.lookup_index("trust_by_secret", "abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trustwire.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .set_attr(&AttrKey::new("alice", "_trust", "bob"), json!({"approved": true}), None)
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.list_buckets("alice").await.unwrap(),
            vec!["_trust".to_string()]
        );
        assert_eq!(store.delete_bucket("alice", "_trust").await.unwrap(), 1);
        assert!(store.list_buckets("alice").await.unwrap().is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(u8),
        Cas(Option<u8>, u8),
        Delete,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4).prop_map(Op::Set),
            (prop::option::of(0u8..4), 0u8..4).prop_map(|(old, new)| Op::Cas(old, new)),
            Just(Op::Delete),
        ]
    }

    proptest! {
        #[test]
        fn sqlite_cas_matches_memory(ops in prop::collection::vec(op(), 1..20)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let memory = MemoryStore::new();
                let sqlite = SqliteStore::open_memory().unwrap();
                let key = key("bob:sub1");
                for op in ops {
                    let (m, s) = match op {
                        Op::Set(v) => {
                            memory.set_attr(&key, json!({"v": v}), None).await.unwrap();
                            sqlite.set_attr(&key, json!({"v": v}), None).await.unwrap();
                            (true, true)
                        }
                        Op::Cas(old, new) => {
                            let old = old.map(|v| json!({"v": v}));
                            (
                                memory
                                    .conditional_update_attr(&key, old.as_ref(), json!({"v": new}))
                                    .await
                                    .unwrap(),
                                sqlite
                                    .conditional_update_attr(&key, old.as_ref(), json!({"v": new}))
                                    .await
                                    .unwrap(),
                            )
                        }
                        Op::Delete => (
                            memory.delete_attr(&key).await.unwrap(),
                            sqlite.delete_attr(&key).await.unwrap(),
                        ),
                    };
                    prop_assert_eq!(m, s);
                    prop_assert_eq!(
                        memory.get_attr(&key).await.unwrap(),
                        sqlite.get_attr(&key).await.unwrap()
                    );
                }
                Ok(())
            })?;
        }
    }
}
