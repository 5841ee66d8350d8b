use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use shoppack_core::ProgressRecord;
use tracing::debug;

use crate::StoreError;

const PROGRESS_KEY_PREFIX: &str = "progress:";
const MAINTENANCE_KEY: &str = "shop.maintenance";

/// Durable per-transaction progress. Every failure is surfaced; nothing is
/// silently treated as "no record".
pub trait ProgressStore {
    fn has(&self, txid: &str) -> Result<bool, StoreError>;
    fn get(&self, txid: &str) -> Result<Option<ProgressRecord>, StoreError>;
    fn set(&self, txid: &str, record: &ProgressRecord) -> Result<(), StoreError>;
    fn delete(&self, txid: &str) -> Result<(), StoreError>;
}

/// A typed value in the key/value table. Booleans and strings are encoded
/// differently, so `Text("true")` never reads back as `Bool(true)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    Bool(bool),
    Text(String),
}

impl StoredValue {
    fn encode(&self) -> String {
        match self {
            Self::Bool(value) => serde_json::Value::Bool(*value).to_string(),
            Self::Text(value) => serde_json::Value::String(value.clone()).to_string(),
        }
    }

    fn decode(key: &str, raw: &str) -> Result<Self, StoreError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|source| StoreError::Decode {
                key: key.to_string(),
                source,
            })?;
        Ok(match value {
            serde_json::Value::Bool(value) => Self::Bool(value),
            serde_json::Value::String(value) => Self::Text(value),
            other => Self::Text(other.to_string()),
        })
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            Self::Text(_) => None,
        }
    }
}

pub trait KeyValueStore {
    fn get_value(&self, key: &str) -> Result<Option<StoredValue>, StoreError>;
    fn set_value(&self, key: &str, value: &StoredValue) -> Result<(), StoreError>;
    fn has_key(&self, key: &str) -> Result<bool, StoreError>;
    fn delete_key(&self, key: &str) -> Result<(), StoreError>;
}

/// SQLite-backed `kv(key, value)` table. A fresh connection is opened per
/// operation so separate processes polling the same store see each other's
/// writes.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                StoreError::unavailable(format!("create {}", parent.display()), err)
            })?;
        }
        let store = Self { path };
        let conn = store.connection()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .map_err(|err| StoreError::unavailable("initialize schema", err))?;
        debug!(path = %store.path.display(), "progress store ready");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connection(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path).map_err(|err| {
            StoreError::unavailable(format!("open {}", self.path.display()), err)
        })?;
        conn.busy_timeout(Duration::from_secs(10))
            .map_err(|err| StoreError::unavailable("set busy timeout", err))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| StoreError::unavailable("enable WAL", err))?;
        Ok(conn)
    }

    fn read_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.connection()?;
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get::<_, String>(0)
        })
        .optional()
        .map_err(|err| StoreError::unavailable(format!("read '{key}'"), err))
    }

    fn write_raw(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| StoreError::unavailable(format!("begin write of '{key}'"), err))?;
        tx.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(|err| StoreError::unavailable(format!("write '{key}'"), err))?;
        tx.commit()
            .map_err(|err| StoreError::unavailable(format!("commit '{key}'"), err))
    }

    fn delete_raw(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(|err| StoreError::unavailable(format!("delete '{key}'"), err))?;
        Ok(())
    }
}

fn progress_key(txid: &str) -> String {
    format!("{PROGRESS_KEY_PREFIX}{txid}")
}

impl ProgressStore for SqliteStore {
    fn has(&self, txid: &str) -> Result<bool, StoreError> {
        Ok(self.read_raw(&progress_key(txid))?.is_some())
    }

    fn get(&self, txid: &str) -> Result<Option<ProgressRecord>, StoreError> {
        let key = progress_key(txid);
        let Some(raw) = self.read_raw(&key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Decode { key, source })
    }

    fn set(&self, txid: &str, record: &ProgressRecord) -> Result<(), StoreError> {
        let key = progress_key(txid);
        let raw = serde_json::to_string(record).map_err(|source| StoreError::Decode {
            key: key.clone(),
            source,
        })?;
        self.write_raw(&key, &raw)
    }

    fn delete(&self, txid: &str) -> Result<(), StoreError> {
        self.delete_raw(&progress_key(txid))
    }
}

impl KeyValueStore for SqliteStore {
    fn get_value(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        self.read_raw(key)?
            .map(|raw| StoredValue::decode(key, &raw))
            .transpose()
    }

    fn set_value(&self, key: &str, value: &StoredValue) -> Result<(), StoreError> {
        self.write_raw(key, &value.encode())
    }

    fn has_key(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.read_raw(key)?.is_some())
    }

    fn delete_key(&self, key: &str) -> Result<(), StoreError> {
        self.delete_raw(key)
    }
}

/// The shop-wide settings the removal flow needs.
pub trait ShopConfig {
    fn maintenance_enabled(&self) -> Result<bool, StoreError>;
    fn set_maintenance(&self, enabled: bool) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct StoreShopConfig<S> {
    store: S,
}

impl<S: KeyValueStore> StoreShopConfig<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: KeyValueStore> ShopConfig for StoreShopConfig<S> {
    fn maintenance_enabled(&self) -> Result<bool, StoreError> {
        Ok(match self.store.get_value(MAINTENANCE_KEY)? {
            Some(StoredValue::Bool(value)) => value,
            // Older installs stored the flag as a "1"/"0" string.
            Some(StoredValue::Text(value)) => matches!(value.trim(), "1" | "true"),
            None => false,
        })
    }

    fn set_maintenance(&self, enabled: bool) -> Result<(), StoreError> {
        self.store
            .set_value(MAINTENANCE_KEY, &StoredValue::Bool(enabled))
    }
}
