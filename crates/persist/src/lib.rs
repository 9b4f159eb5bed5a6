//! Keel persistence: a small key/value state store remembering what a
//! reconciler previously claimed. Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::debug;

/// Key/value store for reconciler state. Values are JSON documents.
///
/// `set` with `force = false` refuses to overwrite an existing key.
pub trait StateStore: Send + Sync {
    fn list_keys(&self) -> Result<BTreeSet<String>>;
    fn get(&self, key: &str) -> Result<Option<Json>>;
    fn set(&self, key: &str, value: &Json, force: bool) -> Result<()>;
}

/// SQLite-backed store. Simple, synchronous; one connection behind a mutex.
pub struct SqliteStateStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStateStore {
    pub fn open_default() -> Result<Self> {
        let path = default_db_path();
        if let Some(dir) = std::path::Path::new(&path).parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        Self::open(&path)
    }

    /// Open an existing database without creating the file, its directory or
    /// the state table. Writes through this handle fail.
    pub fn open_read_only(path: &str) -> Result<Self> {
        let flags = rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let db = rusqlite::Connection::open_with_flags(path, flags)
            .with_context(|| format!("opening sqlite db read-only at {}", path))?;
        debug!(path, "state store opened read-only");
        Ok(Self { db: Mutex::new(db) })
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS state (
                key   TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            )",
            [],
        )
        .context("creating state table")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, "state store opened");
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("state db lock poisoned"))
    }
}

impl StateStore for SqliteStateStore {
    fn list_keys(&self) -> Result<BTreeSet<String>> {
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT key FROM state")?;
        let mut rows = stmt.query([])?;
        let mut out = BTreeSet::new();
        while let Some(row) = rows.next()? {
            out.insert(row.get::<_, String>(0)?);
        }
        Ok(out)
    }

    fn get(&self, key: &str) -> Result<Option<Json>> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT value FROM state WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        let out = match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Some(serde_json::from_str(&raw).with_context(|| format!("decoding state value for {}", key))?)
            }
            None => None,
        };
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn set(&self, key: &str, value: &Json, force: bool) -> Result<()> {
        let started = std::time::Instant::now();
        let raw = serde_json::to_string(value)?;
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        if force {
            tx.execute(
                "INSERT INTO state(key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                (key, &raw),
            )?;
        } else {
            let exists: bool = tx.query_row("SELECT EXISTS(SELECT 1 FROM state WHERE key = ?1)", [key], |r| r.get(0))?;
            if exists {
                return Err(anyhow!("state key already exists: {}", key));
            }
            tx.execute("INSERT INTO state(key, value) VALUES (?1, ?2)", (key, &raw))?;
        }
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }
}

/// In-process store for dry runs and tests.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<BTreeMap<String, Json>>,
}

impl MemoryStateStore {
    pub fn new() -> Self { Self::default() }

    pub fn with_entries<I: IntoIterator<Item = (String, Json)>>(entries: I) -> Self {
        Self { inner: Mutex::new(entries.into_iter().collect()) }
    }

    fn map(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Json>>> {
        self.inner.lock().map_err(|_| anyhow!("memory state lock poisoned"))
    }
}

impl StateStore for MemoryStateStore {
    fn list_keys(&self) -> Result<BTreeSet<String>> { Ok(self.map()?.keys().cloned().collect()) }

    fn get(&self, key: &str) -> Result<Option<Json>> { Ok(self.map()?.get(key).cloned()) }

    fn set(&self, key: &str, value: &Json, force: bool) -> Result<()> {
        let mut map = self.map()?;
        if !force && map.contains_key(key) {
            return Err(anyhow!("state key already exists: {}", key));
        }
        map.insert(key.to_string(), value.clone());
        Ok(())
    }
}

/// `KEEL_STATE_DB`, else `~/.keel/state.db`, else `keel-state.db` in the
/// working directory. Nothing is created.
pub fn default_db_path() -> String {
    if let Ok(path) = std::env::var("KEEL_STATE_DB") {
        return path;
    }
    match std::env::var_os("HOME") {
        Some(home) => std::path::PathBuf::from(home).join(".keel").join("state.db").to_string_lossy().to_string(),
        None => "keel-state.db".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("keel-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    fn exercise(store: &dyn StateStore) {
        assert!(store.list_keys().unwrap().is_empty());
        assert_eq!(store.get("c1/ns1-managed-labels").unwrap(), None);

        store.set("c1/ns1-managed-labels", &json!(["env"]), false).unwrap();
        assert_eq!(store.get("c1/ns1-managed-labels").unwrap(), Some(json!(["env"])));

        let err = store.set("c1/ns1-managed-labels", &json!(["team"]), false).unwrap_err();
        assert!(err.to_string().contains("already exists"), "err={}", err);

        store.set("c1/ns1-managed-labels", &json!(["env", "team"]), true).unwrap();
        store.set("c2/ns2-managed-labels", &json!([]), true).unwrap();
        assert_eq!(store.get("c1/ns1-managed-labels").unwrap(), Some(json!(["env", "team"])));

        let keys: Vec<String> = store.list_keys().unwrap().into_iter().collect();
        assert_eq!(keys, vec!["c1/ns1-managed-labels", "c2/ns2-managed-labels"]);
    }

    #[test]
    fn sqlite_store_roundtrip_and_force() {
        let path = temp_db();
        let s = SqliteStateStore::open(&path).unwrap();
        exercise(&s);
        drop(s);
        // survives reopen
        let s = SqliteStateStore::open(&path).unwrap();
        assert_eq!(s.list_keys().unwrap().len(), 2);
    }

    #[test]
    fn read_only_open_sees_data_but_refuses_writes() {
        let path = temp_db();
        assert!(SqliteStateStore::open_read_only(&path).is_err());
        assert!(!std::path::Path::new(&path).exists());

        let s = SqliteStateStore::open(&path).unwrap();
        s.set("c1/ns1-managed-labels", &json!(["env"]), true).unwrap();
        drop(s);

        let ro = SqliteStateStore::open_read_only(&path).unwrap();
        assert_eq!(ro.get("c1/ns1-managed-labels").unwrap(), Some(json!(["env"])));
        assert!(ro.set("c1/ns2-managed-labels", &json!([]), true).is_err());
        assert_eq!(ro.list_keys().unwrap().len(), 1);
    }

    #[test]
    fn memory_store_roundtrip_and_force() {
        exercise(&MemoryStateStore::new());
    }
}
