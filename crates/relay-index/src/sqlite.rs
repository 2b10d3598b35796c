//! SQLite-backed ordered KV namespace.
//!
//! # Schema
//! One `kv` table: `key BLOB PRIMARY KEY, value BLOB NOT NULL`. BLOB keys
//! compare bytewise, which gives the ordered keyspace the index layer
//! requires.
//!
//! # Durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000.
//! PRAGMA integrity_check runs at open; returns an error if it fails.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use relay_types::kv::{KeyRange, Kv, KvError, KvOp};

const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS kv (
    key   BLOB PRIMARY KEY,
    value BLOB NOT NULL
) WITHOUT ROWID;";

/// An exclusively owned KV namespace over a single SQLite database.
pub struct SqliteKv {
    conn: Mutex<Option<Connection>>,
}

impl SqliteKv {
    /// Open (or create) the namespace at `path`.
    ///
    /// Applies PRAGMAs, runs `PRAGMA integrity_check`, and creates the
    /// schema if needed.
    pub fn open(path: &Path) -> Result<Self, KvError> {
        let conn = Connection::open(path).map_err(backend)?;
        Self::init(conn)
    }

    /// Open an in-memory namespace. Contents are lost on close.
    pub fn open_in_memory() -> Result<Self, KvError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, KvError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA wal_autocheckpoint=1000;",
        )
        .map_err(backend)?;
        let check: String = conn
            .pragma_query_value(None, "integrity_check", |row| row.get(0))
            .map_err(backend)?;
        if check != "ok" {
            return Err(KvError::Corrupt(check));
        }
        conn.execute_batch(SCHEMA_SQL).map_err(backend)?;
        Ok(SqliteKv {
            conn: Mutex::new(Some(conn)),
        })
    }
}

impl Kv for SqliteKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        let guard = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let conn = guard.as_ref().ok_or(KvError::Closed)?;
        let mut stmt = conn
            .prepare_cached("SELECT value FROM kv WHERE key = ?1")
            .map_err(backend)?;
        let mut rows = stmt
            .query_map(params![key], |row| row.get::<_, Vec<u8>>(0))
            .map_err(backend)?;
        rows.next().transpose().map_err(backend)
    }

    fn write(&self, batch: Vec<KvOp>) -> Result<(), KvError> {
        let mut guard = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let conn = guard.as_mut().ok_or(KvError::Closed)?;
        let tx = conn.transaction().map_err(backend)?;
        for op in batch {
            match op {
                KvOp::Put { key, value } => {
                    tx.execute(
                        "INSERT INTO kv (key, value) VALUES (?1, ?2)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                        params![key, value],
                    )
                    .map_err(backend)?;
                }
                KvOp::Del { key } => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", params![key])
                        .map_err(backend)?;
                }
            }
        }
        tx.commit().map_err(backend)
    }

    fn scan(&self, range: &KeyRange, reverse: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
        let guard = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let conn = guard.as_ref().ok_or(KvError::Closed)?;

        let mut sql = String::from("SELECT key, value FROM kv WHERE 1=1");
        let mut args: Vec<&Vec<u8>> = Vec::new();
        if let Some(b) = &range.gt {
            args.push(b);
            sql.push_str(&format!(" AND key > ?{}", args.len()));
        }
        if let Some(b) = &range.gte {
            args.push(b);
            sql.push_str(&format!(" AND key >= ?{}", args.len()));
        }
        if let Some(b) = &range.lt {
            args.push(b);
            sql.push_str(&format!(" AND key < ?{}", args.len()));
        }
        if let Some(b) = &range.lte {
            args.push(b);
            sql.push_str(&format!(" AND key <= ?{}", args.len()));
        }
        sql.push_str(if reverse {
            " ORDER BY key DESC"
        } else {
            " ORDER BY key ASC"
        });

        let mut stmt = conn.prepare_cached(&sql).map_err(backend)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(backend)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(backend)?);
        }
        Ok(out)
    }

    fn close(&self) -> Result<(), KvError> {
        let mut guard = self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        // Dropping the connection closes the database; repeated close is a
        // no-op.
        guard.take();
        Ok(())
    }
}

fn backend(e: rusqlite::Error) -> KvError {
    KvError::Backend(e.to_string())
}
