use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::error::StorageError;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRead {
    fetched_at_ms: u64,
    body_json: String,
}

/// A refreshed read, as last downloaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedRead {
    pub fetched_at_ms: u64,
    pub body: Value,
}

/// Durable cache of data downloaded during the refresh phase, keyed by the
/// refresher name. Lets readers keep working from the last download while
/// offline.
#[derive(Clone)]
pub struct ReadCache {
    tree: sled::Tree,
}

impl ReadCache {
    const TREE_NAME: &'static str = "__read_cache__";

    pub fn new(db: &sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            tree: db.open_tree(Self::TREE_NAME)?,
        })
    }

    pub async fn put(&self, name: &str, body: &Value, fetched_at_ms: u64) -> Result<(), StorageError> {
        let stored = StoredRead {
            fetched_at_ms,
            body_json: serde_json::to_string(body)
                .map_err(|e| StorageError::EncodeError(e.to_string()))?,
        };
        let bytes = bincode::serde::encode_to_vec(&stored, bincode::config::standard())
            .map_err(|e| StorageError::EncodeError(e.to_string()))?;

        self.tree.insert(name.as_bytes(), bytes)?;
        self.tree.flush_async().await?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<CachedRead>, StorageError> {
        let Some(bytes) = self.tree.get(name.as_bytes())? else {
            return Ok(None);
        };

        let corrupt = |reason: String| StorageError::Corrupt {
            key: name.to_string(),
            reason,
        };
        let (stored, _): (StoredRead, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| corrupt(e.to_string()))?;
        let body = serde_json::from_str(&stored.body_json).map_err(|e| corrupt(e.to_string()))?;

        Ok(Some(CachedRead {
            fetched_at_ms: stored.fetched_at_ms,
            body,
        }))
    }

    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for key in self.tree.iter().keys() {
            keys.push(String::from_utf8_lossy(&key?).into_owned());
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn put_then_get_returns_latest_body() {
        let temp_dir = TempDir::new().unwrap();
        let db = sled::open(temp_dir.path()).unwrap();
        let cache = ReadCache::new(&db).unwrap();

        assert!(cache.get("sessions").unwrap().is_none());

        cache.put("sessions", &json!({"items": [1]}), 100).await.unwrap();
        cache.put("sessions", &json!({"items": [1, 2]}), 200).await.unwrap();
        cache.put("items", &json!([]), 150).await.unwrap();

        let read = cache.get("sessions").unwrap().unwrap();
        assert_eq!(read.fetched_at_ms, 200);
        assert_eq!(read.body, json!({"items": [1, 2]}));

        let mut keys = cache.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["items".to_string(), "sessions".to_string()]);
    }
}
