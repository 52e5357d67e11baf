//! SQLite-backed key/value tree holding the applied replicated-log state.
//!
//! Keys are the bucket-tree paths of the persisted layout
//! (`/v1/apps/<app>/...`); values are serialized structs. The KV is only
//! ever written by the log apply task, so a plain connection behind a
//! mutex is enough.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::StoreError;

pub struct Kv {
    conn: Mutex<Connection>,
}

impl Kv {
    /// Open or create the KV at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let kv = Self {
            conn: Mutex::new(conn),
        };
        kv.init_schema()?;
        Ok(kv)
    }

    /// Open an in-memory KV (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let kv = Self {
            conn: Mutex::new(conn),
        };
        kv.init_schema()?;
        Ok(kv)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );",
        )?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Removes every key under a path prefix.
    pub fn delete_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "DELETE FROM kv WHERE substr(key, 1, length(?1)) = ?1",
            params![prefix],
        )?;
        Ok(())
    }

    /// Lists `(key, value)` pairs under a path prefix, ordered by key.
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_round_trip() {
        let kv = Kv::open_in_memory().unwrap();
        kv.put("/v1/apps/web-ops-c1/meta", b"hello").unwrap();
        assert_eq!(
            kv.get("/v1/apps/web-ops-c1/meta").unwrap().as_deref(),
            Some(&b"hello"[..])
        );

        kv.delete("/v1/apps/web-ops-c1/meta").unwrap();
        assert_eq!(kv.get("/v1/apps/web-ops-c1/meta").unwrap(), None);
    }

    #[test]
    fn scan_and_delete_by_prefix() {
        let kv = Kv::open_in_memory().unwrap();
        kv.put("/v1/apps/a-x-c1/meta", b"a").unwrap();
        kv.put("/v1/apps/a-x-c1/slots/0/meta", b"s0").unwrap();
        kv.put("/v1/apps/a-x-c1/slots/1/meta", b"s1").unwrap();
        kv.put("/v1/apps/b-x-c1/meta", b"b").unwrap();

        let slots = kv.scan_prefix("/v1/apps/a-x-c1/slots/").unwrap();
        assert_eq!(slots.len(), 2);
        assert!(slots[0].0.ends_with("0/meta"));

        kv.delete_prefix("/v1/apps/a-x-c1/").unwrap();
        assert!(kv.scan_prefix("/v1/apps/a-x-c1/").unwrap().is_empty());
        assert!(kv.contains("/v1/apps/b-x-c1/meta").unwrap());
    }
}
