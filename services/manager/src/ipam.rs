//! IP address reservations for fixed-mode apps.
//!
//! The address allocator proper is external; the manager only records
//! which app holds which static IP so a double-assignment is caught at
//! slot creation instead of on the wire.

use std::path::Path;
use std::sync::Mutex;

use bosun_id::AppId;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum IpamError {
    #[error("ip {ip} is already reserved by {owner}")]
    Conflict { ip: String, owner: String },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub struct IpamStore {
    conn: Mutex<Connection>,
}

impl IpamStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, IpamError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, IpamError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), IpamError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS reservations (
                ip     TEXT PRIMARY KEY,
                app_id TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Reserves an IP for an app. Re-reserving an IP the same app already
    /// holds is a no-op so state reload stays idempotent.
    pub fn reserve(&self, app_id: &AppId, ip: &str) -> Result<(), IpamError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let owner: Option<String> = conn
            .query_row(
                "SELECT app_id FROM reservations WHERE ip = ?1",
                params![ip],
                |row| row.get(0),
            )
            .optional()?;

        match owner {
            Some(owner) if owner == app_id.as_str() => Ok(()),
            Some(owner) => Err(IpamError::Conflict {
                ip: ip.to_string(),
                owner,
            }),
            None => {
                conn.execute(
                    "INSERT INTO reservations (ip, app_id) VALUES (?1, ?2)",
                    params![ip, app_id.as_str()],
                )?;
                debug!(ip, app_id = %app_id, "IP reserved");
                Ok(())
            }
        }
    }

    pub fn release(&self, ip: &str) -> Result<(), IpamError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM reservations WHERE ip = ?1", params![ip])?;
        Ok(())
    }

    /// Releases every reservation held by an app (app deletion cleanup).
    pub fn release_app(&self, app_id: &AppId) -> Result<(), IpamError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "DELETE FROM reservations WHERE app_id = ?1",
            params![app_id.as_str()],
        )?;
        Ok(())
    }

    pub fn reserved_count(&self) -> Result<u64, IpamError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM reservations", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_is_exclusive_per_ip() {
        let store = IpamStore::open_in_memory().unwrap();
        let a = AppId::parse("a-ops-c1").unwrap();
        let b = AppId::parse("b-ops-c1").unwrap();

        store.reserve(&a, "10.0.1.10").unwrap();
        store.reserve(&a, "10.0.1.10").unwrap();
        assert!(matches!(
            store.reserve(&b, "10.0.1.10"),
            Err(IpamError::Conflict { .. })
        ));

        store.release("10.0.1.10").unwrap();
        store.reserve(&b, "10.0.1.10").unwrap();
    }

    #[test]
    fn release_app_clears_all() {
        let store = IpamStore::open_in_memory().unwrap();
        let a = AppId::parse("a-ops-c1").unwrap();
        store.reserve(&a, "10.0.1.10").unwrap();
        store.reserve(&a, "10.0.1.11").unwrap();
        assert_eq!(store.reserved_count().unwrap(), 2);

        store.release_app(&a).unwrap();
        assert_eq!(store.reserved_count().unwrap(), 0);
    }
}
