//! Key-value storage shared by all extension contexts
//!
//! Two backends implement [`KeyValueStore`]: [`SqliteStore`] keeps values as
//! JSON text in a SQLite table and survives restarts, [`MemoryStore`] holds
//! values as-is for the lifetime of the process.

use crate::error::ChatEmError;
use async_trait::async_trait;
use log::{debug, error};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set(&self, key: &str, value: Value) -> Result<(), ChatEmError>;

    /// `None` when the key is absent
    async fn get(&self, key: &str) -> Result<Option<Value>, ChatEmError>;

    async fn remove(&self, key: &str) -> Result<(), ChatEmError>;

    async fn clear(&self) -> Result<(), ChatEmError>;

    async fn get_all(&self) -> Result<Map<String, Value>, ChatEmError>;
}

/// Serializes `value` and stores it under `key`
pub async fn save_item<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), ChatEmError> {
    let value = serde_json::to_value(value).map_err(|e| ChatEmError::serialization(key, e))?;
    store.set(key, value).await
}

/// Reads `key` and decodes it into `T`
pub async fn get_item<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, ChatEmError> {
    match store.get(key).await? {
        None => Ok(None),
        Some(value) => {
            let raw = value.to_string();
            serde_json::from_value(value)
                .map(Some)
                .map_err(|e| ChatEmError::Serialization {
                    key: key.to_string(),
                    message: e.to_string(),
                    raw: Some(raw),
                })
        }
    }
}

// ============ SQLite Store ============

/// Durable store: one row per key, values kept as JSON text
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) the database, creating tables if needed
    pub fn open(path: &Path) -> Result<Self, ChatEmError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ChatEmError::Storage(format!("Failed to create storage directory: {}", e))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| ChatEmError::Storage(format!("Failed to open storage: {}", e)))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, ChatEmError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ChatEmError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| ChatEmError::Storage(format!("Failed to create table: {}", e)))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Writes raw text under `key`, bypassing encoding
    pub async fn set_raw(&self, key: &str, text: &str) -> Result<(), ChatEmError> {
        let key = key.to_string();
        let text = text.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, text],
            )?;
            Ok(())
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, ChatEmError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, ChatEmError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| ChatEmError::Storage("Storage connection poisoned".to_string()))?;
            f(&guard)
        })
        .await?
    }
}

fn decode_row(key: &str, text: String) -> Result<Value, ChatEmError> {
    serde_json::from_str(&text).map_err(|e| {
        error!("[storage] Failed to parse stored value for \"{}\": {}", key, e);
        ChatEmError::Serialization {
            key: key.to_string(),
            message: e.to_string(),
            raw: Some(text),
        }
    })
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn set(&self, key: &str, value: Value) -> Result<(), ChatEmError> {
        let text = serde_json::to_string(&value).map_err(|e| ChatEmError::serialization(key, e))?;
        debug!("[storage] set \"{}\" ({} bytes)", key, text.len());
        self.set_raw(key, &text).await
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, ChatEmError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let text: Option<String> = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()?;
            text.map(|text| decode_row(&key, text)).transpose()
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), ChatEmError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn clear(&self) -> Result<(), ChatEmError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv", [])?;
            Ok(())
        })
        .await
    }

    async fn get_all(&self) -> Result<Map<String, Value>, ChatEmError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM kv ORDER BY key")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut all = Map::new();
            for row in rows {
                let (key, text) = row?;
                let value = decode_row(&key, text)?;
                all.insert(key, value);
            }
            Ok(all)
        })
        .await
    }
}

// ============ Memory Store ============

/// Pass-through store: values are kept exactly as given, nothing touches disk
#[derive(Default)]
pub struct MemoryStore {
    items: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Value>>, ChatEmError> {
        self.items
            .lock()
            .map_err(|_| ChatEmError::Storage("Memory store poisoned".to_string()))
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set(&self, key: &str, value: Value) -> Result<(), ChatEmError> {
        self.items()?.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, ChatEmError> {
        Ok(self.items()?.get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<(), ChatEmError> {
        self.items()?.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), ChatEmError> {
        self.items()?.clear();
        Ok(())
    }

    async fn get_all(&self) -> Result<Map<String, Value>, ChatEmError> {
        Ok(self
            .items()?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Settings;
    use serde_json::json;

    #[tokio::test]
    async fn sqlite_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("storage.db");
        let nested = json!({ "a": [1, 2.5, null, "x"], "b": { "c": true } });

        {
            let store = SqliteStore::open(&path).unwrap();
            store.set("nested", nested.clone()).await.unwrap();
            store.set("gone", json!(1)).await.unwrap();
            store.remove("gone").await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("nested").await.unwrap(), Some(nested));
        assert_eq!(store.get("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_text_keeps_raw_in_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set_raw("settings", "{not json").await.unwrap();

        match store.get("settings").await {
            Err(ChatEmError::Serialization { key, raw, .. }) => {
                assert_eq!(key, "settings");
                assert_eq!(raw.as_deref(), Some("{not json"));
            }
            other => panic!("expected serialization error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn get_all_and_clear() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set("b", json!("two")).await.unwrap();
        store.set("a", json!(1)).await.unwrap();
        store.set("a", json!(3)).await.unwrap();

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["a"], json!(3));

        store.clear().await.unwrap();
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn typed_items_round_trip_through_memory_store() {
        let store = MemoryStore::new();
        let mut settings = Settings::default();
        settings.temperature = 0.2;

        save_item(&store, "settings", &settings).await.unwrap();
        let loaded: Option<Settings> = get_item(&store, "settings").await.unwrap();
        assert_eq!(loaded, Some(settings));

        let missing: Option<Settings> = get_item(&store, "nothing").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn typed_decode_failure_is_serialization_error() {
        let store = MemoryStore::new();
        store.set("settings", json!("not an object")).await.unwrap();

        let result: Result<Option<Settings>, _> = get_item(&store, "settings").await;
        assert!(matches!(result, Err(ChatEmError::Serialization { .. })));
    }
}
