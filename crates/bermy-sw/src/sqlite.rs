//! SQLite-backed cache storage.
//!
//! Caches survive restarts of the agent. Every write runs in a transaction,
//! so a failed `put_all` leaves no trace.

use std::path::Path;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};
use url::Url;

use crate::cache::{now_millis, CacheEntry, CacheError, CacheStorage, RequestKey};

/// Schema version stored in `PRAGMA user_version`.
const SCHEMA_VERSION: i32 = 2;

/// Cache storage persisted in a SQLite database.
#[derive(Clone)]
pub struct SqliteCacheStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCacheStorage {
    /// Open (or create) the database at `path`.
    pub fn open_path(path: &Path) -> Result<Self, CacheError> {
        info!(path = %path.display(), "Opening cache database");
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Database that lives only as long as this value.
    pub fn in_memory() -> Result<Self, CacheError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CacheError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version == 1 {
            // v1 kept header values as lossy UTF-8 strings; the caches are
            // refilled by the next install.
            info!("Dropping v1 cache schema");
            conn.execute_batch("DROP TABLE IF EXISTS entries; DROP TABLE IF EXISTS caches;")?;
        }
        if version < SCHEMA_VERSION {
            create_schema(&conn)?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(&mut Connection) -> Result<T, CacheError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| CacheError::Storage("connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))?
    }
}

fn create_schema(conn: &Connection) -> Result<(), CacheError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS caches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entries (
            cache_id INTEGER NOT NULL REFERENCES caches(id) ON DELETE CASCADE,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            status INTEGER NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL,
            cached_at INTEGER NOT NULL,
            PRIMARY KEY (cache_id, method, url)
        );

        "#,
    )?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    debug!("Created cache schema v{}", SCHEMA_VERSION);
    Ok(())
}

/// Id of cache `name`, creating it if needed.
fn ensure_cache(conn: &Connection, name: &str) -> Result<i64, CacheError> {
    conn.execute(
        "INSERT OR IGNORE INTO caches (name, created_at) VALUES (?1, ?2)",
        params![name, now_millis() as i64],
    )?;
    let id = conn.query_row("SELECT id FROM caches WHERE name = ?1", params![name], |row| {
        row.get(0)
    })?;
    Ok(id)
}

fn insert_entry(conn: &Connection, cache_id: i64, entry: &CacheEntry) -> Result<(), CacheError> {
    let headers = serde_json::to_string(&entry.headers)?;
    conn.execute(
        "INSERT OR REPLACE INTO entries (cache_id, method, url, status, headers, body, cached_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            cache_id,
            entry.key.method,
            entry.key.url.as_str(),
            entry.status,
            headers,
            entry.body,
            entry.cached_at as i64
        ],
    )?;
    Ok(())
}

fn parse_url(raw: &str) -> Result<Url, CacheError> {
    Url::parse(raw).map_err(|e| CacheError::Storage(format!("stored url '{}': {}", raw, e)))
}

impl CacheStorage for SqliteCacheStorage {
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), CacheError>> {
        let name = name.to_string();
        Box::pin(self.with_conn(move |conn| ensure_cache(conn, &name).map(|_| ())))
    }

    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
        let name = name.to_string();
        Box::pin(self.with_conn(move |conn| {
            let found: Option<i64> = conn
                .query_row("SELECT id FROM caches WHERE name = ?1", params![name], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(found.is_some())
        }))
    }

    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, CacheError>> {
        Box::pin(self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM caches ORDER BY id")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        }))
    }

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
        let name = name.to_string();
        Box::pin(self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM caches WHERE name = ?1", params![name])?;
            Ok(removed > 0)
        }))
    }

    fn put<'a>(
        &'a self,
        name: &'a str,
        entry: CacheEntry,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        self.put_all(name, vec![entry])
    }

    fn put_all<'a>(
        &'a self,
        name: &'a str,
        entries: Vec<CacheEntry>,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        let name = name.to_string();
        Box::pin(self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let cache_id = ensure_cache(&tx, &name)?;
            for entry in &entries {
                insert_entry(&tx, cache_id, entry)?;
            }
            tx.commit()?;
            Ok(())
        }))
    }

    fn match_in<'a>(
        &'a self,
        name: &'a str,
        key: &'a RequestKey,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>, CacheError>> {
        let name = name.to_string();
        let key = key.clone();
        Box::pin(self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT e.status, e.headers, e.body, e.cached_at
                     FROM entries e JOIN caches c ON c.id = e.cache_id
                     WHERE c.name = ?1 AND e.method = ?2 AND e.url = ?3",
                    params![name, key.method, key.url.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, u16>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()?;

            match row {
                Some((status, headers, body, cached_at)) => Ok(Some(CacheEntry {
                    key,
                    status,
                    headers: serde_json::from_str(&headers)?,
                    body,
                    cached_at: cached_at as u64,
                })),
                None => Ok(None),
            }
        }))
    }

    fn entry_keys<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<RequestKey>, CacheError>> {
        let name = name.to_string();
        Box::pin(self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT e.method, e.url FROM entries e JOIN caches c ON c.id = e.cache_id
                 WHERE c.name = ?1 ORDER BY e.rowid",
            )?;
            let rows = stmt
                .query_map(params![name], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(method, url)| {
                    parse_url(&url).map(|url| RequestKey { method, url })
                })
                .collect::<Result<Vec<_>, CacheError>>()
        }))
    }
}
