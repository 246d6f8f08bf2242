//! Two-tier backing store traits and implementations.
//!
//! The structured backend is a row store keyed by address digest with a
//! secondary index on `(timeline_root, n)` supporting "n ≥ N" range
//! queries. The blob backend holds payloads of oversized or binary-flagged
//! frames under the same keys. Batch operations may report an unprocessed
//! subset; callers (the remote adapter) are responsible for re-issuing it.

use crate::error::StoreError;
use crate::store::record::FrameRow;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;

/// Result of a structured batch get.
#[derive(Debug, Default)]
pub struct BatchGetOutput {
    pub rows: Vec<FrameRow>,
    /// Keys the backend declined to process this call.
    pub unprocessed: Vec<String>,
}

/// Result of a structured batch put.
#[derive(Debug, Default)]
pub struct BatchPutOutput {
    /// Rows the backend declined to process this call.
    pub unprocessed: Vec<FrameRow>,
}

/// Row store with a timeline index.
#[async_trait]
pub trait StructuredBackend: Send + Sync {
    /// Fetch rows by key. Keys with no row are simply absent from the
    /// output; keys the backend could not process this call are returned
    /// in `unprocessed`.
    async fn batch_get(&self, keys: &[String]) -> Result<BatchGetOutput, StoreError>;

    /// Write rows, overwriting by key.
    async fn batch_put(&self, rows: &[FrameRow]) -> Result<BatchPutOutput, StoreError>;

    /// Delete rows by key. Unknown keys are ignored.
    async fn batch_delete(&self, keys: &[String]) -> Result<(), StoreError>;

    /// All rows of a timeline with sequence number `>= n_least`.
    async fn query_newer(
        &self,
        timeline_root: &str,
        n_least: u64,
    ) -> Result<Vec<FrameRow>, StoreError>;

    /// Every row in the store.
    async fn scan(&self) -> Result<Vec<FrameRow>, StoreError>;
}

/// Opaque payload store for oversized/binary frames.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn put_blob(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
    async fn blob_exists(&self, key: &str) -> Result<bool, StoreError>;
    async fn delete_blob(&self, key: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Faults the in-memory backend injects into upcoming calls, for exercising
/// the adapter's retry paths.
#[derive(Debug, Default)]
pub struct FaultPlan {
    /// For each upcoming `batch_get`, leave this many keys unprocessed.
    pub unprocessed_gets: VecDeque<usize>,
    /// For each upcoming `batch_put`, leave this many rows unprocessed.
    pub unprocessed_puts: VecDeque<usize>,
    /// Fail this many upcoming calls with a capacity error.
    pub capacity_errors: u32,
}

/// In-memory two-tier backend. Primarily for tests; also documents the
/// minimal contract a real backend must meet.
#[derive(Default)]
pub struct MemoryBackend {
    rows: RwLock<HashMap<String, FrameRow>>,
    /// `(timeline_root, n, key)` → key. The composite key keeps multiple
    /// frames at the same sequence number distinct.
    index: RwLock<BTreeMap<(String, u64, String), String>>,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    faults: Mutex<FaultPlan>,
    get_log: Mutex<Vec<Vec<String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue faults for upcoming calls.
    pub fn inject_faults<F: FnOnce(&mut FaultPlan)>(&self, f: F) {
        f(&mut self.faults.lock());
    }

    /// Key sets of every `batch_get` call so far, in call order.
    pub fn get_calls(&self) -> Vec<Vec<String>> {
        self.get_log.lock().clone()
    }

    fn take_capacity_fault(&self) -> bool {
        let mut faults = self.faults.lock();
        if faults.capacity_errors > 0 {
            faults.capacity_errors -= 1;
            true
        } else {
            false
        }
    }

    fn index_insert(&self, row: &FrameRow) {
        if let (Some(root), Some(n)) = (&row.timeline_root, row.n) {
            self.index
                .write()
                .insert((root.clone(), n, row.key.clone()), row.key.clone());
        }
    }

    fn index_remove(&self, row: &FrameRow) {
        if let (Some(root), Some(n)) = (&row.timeline_root, row.n) {
            self.index.write().remove(&(root.clone(), n, row.key.clone()));
        }
    }
}

#[async_trait]
impl StructuredBackend for MemoryBackend {
    async fn batch_get(&self, keys: &[String]) -> Result<BatchGetOutput, StoreError> {
        self.get_log.lock().push(keys.to_vec());
        if self.take_capacity_fault() {
            return Err(StoreError::Capacity("injected capacity fault".into()));
        }
        let leave = self.faults.lock().unprocessed_gets.pop_front().unwrap_or(0);
        let split = keys.len().saturating_sub(leave);
        let rows_guard = self.rows.read();
        let rows = keys[..split]
            .iter()
            .filter_map(|k| rows_guard.get(k).cloned())
            .collect();
        Ok(BatchGetOutput {
            rows,
            unprocessed: keys[split..].to_vec(),
        })
    }

    async fn batch_put(&self, rows: &[FrameRow]) -> Result<BatchPutOutput, StoreError> {
        if self.take_capacity_fault() {
            return Err(StoreError::Capacity("injected capacity fault".into()));
        }
        let leave = self.faults.lock().unprocessed_puts.pop_front().unwrap_or(0);
        let split = rows.len().saturating_sub(leave);
        for row in &rows[..split] {
            if let Some(old) = self.rows.write().insert(row.key.clone(), row.clone()) {
                self.index_remove(&old);
            }
            self.index_insert(row);
        }
        Ok(BatchPutOutput {
            unprocessed: rows[split..].to_vec(),
        })
    }

    async fn batch_delete(&self, keys: &[String]) -> Result<(), StoreError> {
        for key in keys {
            if let Some(old) = self.rows.write().remove(key) {
                self.index_remove(&old);
            }
        }
        Ok(())
    }

    async fn query_newer(
        &self,
        timeline_root: &str,
        n_least: u64,
    ) -> Result<Vec<FrameRow>, StoreError> {
        if self.take_capacity_fault() {
            return Err(StoreError::Capacity("injected capacity fault".into()));
        }
        let index = self.index.read();
        let rows = self.rows.read();
        let range_start = (timeline_root.to_string(), n_least, String::new());
        let result = index
            .range(range_start..)
            .take_while(|((root, _, _), _)| root == timeline_root)
            .filter_map(|(_, key)| rows.get(key).cloned())
            .collect();
        Ok(result)
    }

    async fn scan(&self) -> Result<Vec<FrameRow>, StoreError> {
        Ok(self.rows.read().values().cloned().collect())
    }
}

#[async_trait]
impl BlobBackend for MemoryBackend {
    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blobs.read().get(key).cloned())
    }

    async fn put_blob(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.blobs.write().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn blob_exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.blobs.read().contains_key(key))
    }

    async fn delete_blob(&self, key: &str) -> Result<(), StoreError> {
        self.blobs.write().remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sled implementation
// ---------------------------------------------------------------------------

const TREE_ROWS: &str = "rows";
const TREE_INDEX: &str = "timeline_index";
const TREE_BLOBS: &str = "blobs";

/// Sled-backed two-tier backend.
pub struct SledBackend {
    rows: sled::Tree,
    index: sled::Tree,
    blobs: sled::Tree,
}

impl SledBackend {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            rows: db.open_tree(TREE_ROWS)?,
            index: db.open_tree(TREE_INDEX)?,
            blobs: db.open_tree(TREE_BLOBS)?,
        })
    }

    /// Index key: `root \x00 n(be bytes) \x00 rowkey`, so a range scan from
    /// `(root, n_least)` walks ascending sequence numbers.
    fn index_key(root: &str, n: u64, row_key: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(root.len() + row_key.len() + 10);
        key.extend_from_slice(root.as_bytes());
        key.push(0);
        key.extend_from_slice(&n.to_be_bytes());
        key.push(0);
        key.extend_from_slice(row_key.as_bytes());
        key
    }

    fn index_prefix(root: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(root.len() + 1);
        prefix.extend_from_slice(root.as_bytes());
        prefix.push(0);
        prefix
    }

    fn decode_row(bytes: &[u8]) -> Result<FrameRow, StoreError> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Serde(e.to_string()))
    }

    fn encode_row(row: &FrameRow) -> Result<Vec<u8>, StoreError> {
        bincode::serialize(row).map_err(|e| StoreError::Serde(e.to_string()))
    }
}

#[async_trait]
impl StructuredBackend for SledBackend {
    async fn batch_get(&self, keys: &[String]) -> Result<BatchGetOutput, StoreError> {
        let mut rows = Vec::new();
        for key in keys {
            if let Some(bytes) = self.rows.get(key.as_bytes())? {
                rows.push(Self::decode_row(&bytes)?);
            }
        }
        Ok(BatchGetOutput {
            rows,
            unprocessed: Vec::new(),
        })
    }

    async fn batch_put(&self, rows: &[FrameRow]) -> Result<BatchPutOutput, StoreError> {
        let mut batch = sled::Batch::default();
        let mut index_batch = sled::Batch::default();
        for row in rows {
            // drop a stale index entry when overwriting a row in place
            if let Some(old_bytes) = self.rows.get(row.key.as_bytes())? {
                let old = Self::decode_row(&old_bytes)?;
                if let (Some(root), Some(n)) = (&old.timeline_root, old.n) {
                    index_batch.remove(Self::index_key(root, n, &old.key));
                }
            }
            batch.insert(row.key.as_bytes(), Self::encode_row(row)?);
            if let (Some(root), Some(n)) = (&row.timeline_root, row.n) {
                index_batch.insert(Self::index_key(root, n, &row.key), row.key.as_bytes());
            }
        }
        self.rows.apply_batch(batch)?;
        self.index.apply_batch(index_batch)?;
        Ok(BatchPutOutput::default())
    }

    async fn batch_delete(&self, keys: &[String]) -> Result<(), StoreError> {
        for key in keys {
            if let Some(bytes) = self.rows.remove(key.as_bytes())? {
                let row = Self::decode_row(&bytes)?;
                if let (Some(root), Some(n)) = (&row.timeline_root, row.n) {
                    self.index.remove(Self::index_key(root, n, &row.key))?;
                }
            }
        }
        Ok(())
    }

    async fn query_newer(
        &self,
        timeline_root: &str,
        n_least: u64,
    ) -> Result<Vec<FrameRow>, StoreError> {
        let prefix = Self::index_prefix(timeline_root);
        let start = Self::index_key(timeline_root, n_least, "");
        let mut rows = Vec::new();
        for item in self.index.range(start..) {
            let (key, row_key) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            if let Some(bytes) = self.rows.get(&row_key)? {
                rows.push(Self::decode_row(&bytes)?);
            }
        }
        Ok(rows)
    }

    async fn scan(&self) -> Result<Vec<FrameRow>, StoreError> {
        let mut rows = Vec::new();
        for item in self.rows.iter() {
            let (_, bytes) = item?;
            rows.push(Self::decode_row(&bytes)?);
        }
        Ok(rows)
    }
}

#[async_trait]
impl BlobBackend for SledBackend {
    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blobs.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    async fn put_blob(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.blobs.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    async fn blob_exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.blobs.contains_key(key.as_bytes())?)
    }

    async fn delete_blob(&self, key: &str) -> Result<(), StoreError> {
        self.blobs.remove(key.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::integrity::compute_gib;
    use crate::frame::Frame;
    use serde_json::json;

    fn row(ib: &str, root: Option<&str>, n: Option<u64>) -> FrameRow {
        let mut frame = Frame::primitive(ib);
        frame.data.insert("x".to_string(), json!(ib));
        frame.gib = compute_gib(&frame).unwrap();
        let mut row = FrameRow::from_frame(&frame).unwrap();
        row.timeline_root = root.map(String::from);
        row.n = n;
        row
    }

    #[tokio::test]
    async fn test_memory_put_get() {
        let backend = MemoryBackend::new();
        let r = row("comment a", None, None);
        backend.batch_put(std::slice::from_ref(&r)).await.unwrap();
        let out = backend.batch_get(&[r.key.clone()]).await.unwrap();
        assert_eq!(out.rows, vec![r]);
        assert!(out.unprocessed.is_empty());
    }

    #[tokio::test]
    async fn test_memory_query_newer() {
        let backend = MemoryBackend::new();
        let rows: Vec<FrameRow> = (0u64..4)
            .map(|n| row(&format!("comment {n}"), Some("ROOT"), Some(n)))
            .collect();
        backend.batch_put(&rows).await.unwrap();

        let newer = backend.query_newer("ROOT", 2).await.unwrap();
        let ns: Vec<u64> = newer.iter().filter_map(|r| r.n).collect();
        assert_eq!(ns, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_memory_unprocessed_fault() {
        let backend = MemoryBackend::new();
        let rows: Vec<FrameRow> = (0u64..10)
            .map(|n| row(&format!("comment {n}"), None, None))
            .collect();
        backend.batch_put(&rows).await.unwrap();
        backend.inject_faults(|f| f.unprocessed_gets.push_back(3));

        let keys: Vec<String> = rows.iter().map(|r| r.key.clone()).collect();
        let out = backend.batch_get(&keys).await.unwrap();
        assert_eq!(out.rows.len(), 7);
        assert_eq!(out.unprocessed.len(), 3);
    }

    #[tokio::test]
    async fn test_sled_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = SledBackend::new(dir.path()).unwrap();

        let rows: Vec<FrameRow> = (0u64..3)
            .map(|n| row(&format!("comment {n}"), Some("ROOT"), Some(n)))
            .collect();
        backend.batch_put(&rows).await.unwrap();

        let keys: Vec<String> = rows.iter().map(|r| r.key.clone()).collect();
        let out = backend.batch_get(&keys).await.unwrap();
        assert_eq!(out.rows.len(), 3);

        let newer = backend.query_newer("ROOT", 1).await.unwrap();
        assert_eq!(newer.len(), 2);

        backend.batch_delete(&keys[..1]).await.unwrap();
        let newer = backend.query_newer("ROOT", 0).await.unwrap();
        assert_eq!(newer.len(), 2);
    }

    #[tokio::test]
    async fn test_sled_blobs() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = SledBackend::new(dir.path()).unwrap();
        assert!(!backend.blob_exists("k").await.unwrap());
        backend.put_blob("k", b"payload").await.unwrap();
        assert!(backend.blob_exists("k").await.unwrap());
        assert_eq!(backend.get_blob("k").await.unwrap().unwrap(), b"payload");
    }
}
