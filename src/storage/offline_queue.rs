use std::collections::BTreeSet;
use std::convert::TryInto;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::storage::error::StorageError;
use crate::storage::mutation::{
    MutationId, MutationKind, MutationState, NewMutation, PendingMutation, QueueStats,
};
use crate::storage::queue::QueueStore;

/// On-disk layout of one queued mutation. The payload is kept as JSON text
/// because bincode cannot decode self-describing values.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMutation {
    id: u64,
    kind: MutationKind,
    payload_json: String,
    created_at_ms: u64,
    retry_count: u32,
    state: MutationState,
    last_error: Option<String>,
}

fn encode(mutation: &PendingMutation) -> Result<Vec<u8>, StorageError> {
    let stored = StoredMutation {
        id: mutation.id.0,
        kind: mutation.kind.clone(),
        payload_json: serde_json::to_string(&mutation.payload)
            .map_err(|e| StorageError::EncodeError(e.to_string()))?,
        created_at_ms: mutation.created_at_ms,
        retry_count: mutation.retry_count,
        state: mutation.state,
        last_error: mutation.last_error.clone(),
    };

    bincode::serde::encode_to_vec(&stored, bincode::config::standard())
        .map_err(|e| StorageError::EncodeError(e.to_string()))
}

fn decode(key: &[u8], value: &[u8]) -> Result<PendingMutation, StorageError> {
    let corrupt = |reason: String| StorageError::Corrupt {
        key: describe_key(key),
        reason,
    };

    let (stored, _): (StoredMutation, usize) =
        bincode::serde::decode_from_slice(value, bincode::config::standard())
            .map_err(|e| corrupt(e.to_string()))?;

    if key_id(key) != Some(stored.id) {
        return Err(corrupt(format!("entry carries id {}", stored.id)));
    }

    let payload = serde_json::from_str(&stored.payload_json).map_err(|e| corrupt(e.to_string()))?;

    Ok(PendingMutation {
        id: MutationId(stored.id),
        kind: stored.kind,
        payload,
        created_at_ms: stored.created_at_ms,
        retry_count: stored.retry_count,
        state: stored.state,
        last_error: stored.last_error,
    })
}

fn key_id(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn describe_key(key: &[u8]) -> String {
    match key_id(key) {
        Some(id) => id.to_string(),
        None => String::from_utf8_lossy(key).into_owned(),
    }
}

/// Persistent mutation queue backed by a dedicated Sled tree.
///
/// Keys are the mutation ids encoded big-endian, so iteration order is
/// insertion order (FIFO). The id counter is persisted under a metadata key
/// in the same atomic batch as each appended record, which keeps ids unique
/// across restarts even after the queue has drained. Every write is flushed
/// before the call returns.
pub struct SledQueueStore {
    tree: sled::Tree,
    next_id: Mutex<u64>,
    max_retries: u32,
}

impl SledQueueStore {
    const TREE_NAME: &'static str = "__mutation_queue__";
    const META_NEXT_ID_KEY: &'static [u8] = b"__next_id__";

    /// Open or create the mutation queue inside the given database.
    pub fn new(db: &sled::Db, max_retries: u32) -> Result<Self, StorageError> {
        let tree = db.open_tree(Self::TREE_NAME)?;

        let next_id = match tree.get(Self::META_NEXT_ID_KEY)? {
            Some(bytes) => key_id(&bytes).ok_or_else(|| StorageError::Corrupt {
                key: String::from_utf8_lossy(Self::META_NEXT_ID_KEY).into_owned(),
                reason: format!("expected 8 bytes, found {}", bytes.len()),
            })?,
            // No counter yet: continue after the highest id present, if any.
            None => {
                let mut last_id: u64 = 0;
                for item in tree.iter() {
                    let (key, _value) = item?;
                    if let Some(id) = key_id(&key) {
                        last_id = last_id.max(id);
                    }
                }
                last_id
            }
        };

        log::debug!(
            "Opened mutation queue tree '{}' (next id {})",
            Self::TREE_NAME,
            next_id + 1
        );

        Ok(Self {
            tree,
            next_id: Mutex::new(next_id),
            max_retries,
        })
    }

    /// Number of queued entries in any state.
    pub fn len(&self) -> Result<usize, StorageError> {
        let mut count: usize = 0;
        for item in self.tree.iter() {
            let (key, _value) = item?;
            if key.len() == 8 {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Read-modify-write of one entry. Retries when another writer changed
    /// the entry in between; a vanished entry yields `None`.
    fn modify<F>(&self, id: MutationId, mut apply: F) -> Result<Option<PendingMutation>, StorageError>
    where
        F: FnMut(&mut PendingMutation),
    {
        let key = id.0.to_be_bytes();
        loop {
            let current = match self.tree.get(key)? {
                Some(current) => current,
                None => return Ok(None),
            };

            let mut mutation = decode(&key, &current)?;
            apply(&mut mutation);
            let encoded = encode(&mutation)?;

            match self.tree.compare_and_swap(key, Some(current), Some(encoded))? {
                Ok(()) => return Ok(Some(mutation)),
                Err(_) => continue,
            }
        }
    }

    async fn flush(&self) -> Result<(), StorageError> {
        self.tree.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for SledQueueStore {
    async fn append(&self, mutation: NewMutation) -> Result<MutationId, StorageError> {
        let id = {
            let mut next_id = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
            let id = next_id.wrapping_add(1);
            let entry = mutation.into_pending(MutationId(id));

            let mut batch = sled::Batch::default();
            batch.insert(id.to_be_bytes().to_vec(), encode(&entry)?);
            batch.insert(Self::META_NEXT_ID_KEY, id.to_be_bytes().to_vec());
            self.tree.apply_batch(batch)?;

            *next_id = id;
            MutationId(id)
        };

        self.flush().await?;
        Ok(id)
    }

    async fn list(&self) -> Result<Vec<PendingMutation>, StorageError> {
        let mut entries = Vec::new();
        for item in self.tree.iter() {
            let (key, value) = item?;

            // Only 8-byte keys are queued mutations; skip metadata.
            if key.len() != 8 {
                continue;
            }
            entries.push(decode(&key, &value)?);
        }
        Ok(entries)
    }

    async fn get(&self, id: MutationId) -> Result<Option<PendingMutation>, StorageError> {
        let key = id.0.to_be_bytes();
        match self.tree.get(key)? {
            Some(value) => Ok(Some(decode(&key, &value)?)),
            None => Ok(None),
        }
    }

    async fn update_state(
        &self,
        id: MutationId,
        state: MutationState,
        error: Option<String>,
    ) -> Result<bool, StorageError> {
        let updated = self.modify(id, |m| {
            m.state = state;
            if error.is_some() {
                m.last_error = error.clone();
            }
        })?;

        if updated.is_none() {
            return Ok(false);
        }
        self.flush().await?;
        Ok(true)
    }

    async fn update_retry(
        &self,
        id: MutationId,
        error: Option<String>,
    ) -> Result<Option<PendingMutation>, StorageError> {
        let max_retries = self.max_retries;
        let updated = self.modify(id, |m| {
            m.record_transient_failure(error.clone(), max_retries);
        })?;

        if updated.is_some() {
            self.flush().await?;
        }
        Ok(updated)
    }

    async fn remove(&self, id: MutationId) -> Result<bool, StorageError> {
        let removed = self.tree.remove(id.0.to_be_bytes())?.is_some();
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn remove_many(&self, ids: &[MutationId]) -> Result<usize, StorageError> {
        let unique: BTreeSet<MutationId> = ids.iter().copied().collect();

        let mut batch = sled::Batch::default();
        let mut removed = 0usize;
        for id in unique {
            let key = id.0.to_be_bytes();
            if self.tree.contains_key(key)? {
                batch.remove(key.to_vec());
                removed += 1;
            }
        }

        if removed > 0 {
            self.tree.apply_batch(batch)?;
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn stats(&self) -> Result<QueueStats, StorageError> {
        let mut stats = QueueStats::default();
        for item in self.tree.iter() {
            let (key, value) = item?;
            if key.len() != 8 {
                continue;
            }
            stats.count(decode(&key, &value)?.state);
        }
        Ok(stats)
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}
