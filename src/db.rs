use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info};

use crate::error::StoreError;
use crate::ports::KeyValueStore;

/// SQLite-backed settings store. Each key holds one JSON document.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Creates a new `SqliteStore` and ensures the database connection is valid.
    pub fn new(db_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;

        info!("Initializing settings schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );
        "#,
        ) {
            Ok(_) => {
                info!("Settings schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize settings schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|text| serde_json::from_str(&text).map_err(StoreError::from))
            .transpose()
    }

    fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES (?1, ?2, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value.to_string()],
        )?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        // Autocommit writes are durable in rollback-journal mode; this covers WAL databases.
        self.conn()?
            .query_row("PRAGMA wal_checkpoint(FULL)", [], |_| Ok(()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_get_overwrites() {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize_db().unwrap();

        assert!(store.get("settings-file-scrapers").unwrap().is_none());
        store.set("settings-file-scrapers", json!([{"name": "S1"}])).unwrap();
        store.set("settings-file-scrapers", json!([])).unwrap();
        store.flush().unwrap();

        assert_eq!(store.get("settings-file-scrapers").unwrap(), Some(json!([])));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.db");
        let path = path.to_str().unwrap();

        {
            let store = SqliteStore::new(path).unwrap();
            store.initialize_db().unwrap();
            store.set("settings-file-mqtt-broker", json!({"host": "broker.local"})).unwrap();
            store.flush().unwrap();
        }

        let store = SqliteStore::new(path).unwrap();
        store.initialize_db().unwrap();
        assert_eq!(
            store.get("settings-file-mqtt-broker").unwrap(),
            Some(json!({"host": "broker.local"}))
        );
    }

    #[test]
    fn corrupt_documents_surface_as_errors() {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize_db().unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "INSERT INTO settings (key, value) VALUES ('broken', 'not json')",
                [],
            )
            .unwrap();
        assert!(matches!(store.get("broken"), Err(StoreError::Serialization(_))));
    }
}
