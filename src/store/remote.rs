//! Remote store adapter
//!
//! Translates frame operations onto the two-tier backing store with
//! batching, inter-batch throttling, and two independent retry regimes:
//! unprocessed batch subsets are re-issued with exponential backoff (a
//! call that makes progress does not consume a retry), and backend
//! capacity errors are retried with their own backoff and bound. Oversized
//! or binary-flagged frames go to the blob store with only a placeholder
//! row in the structured store; blob existence probes are cached for the
//! life of the process.

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::frame::{split_timelines, Frame};
use crate::store::backend::{BlobBackend, StructuredBackend};
use crate::store::record::{
    frame_from_blob, frame_to_blob, is_binary_ib, row_key, FrameRow,
};
use crate::store::{
    DeleteOutcome, ExistsOutcome, FetchOutcome, PutOutcome, StoreAdapter,
};
use crate::types::{Addr, TjpAddr};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct RemoteStore {
    structured: Arc<dyn StructuredBackend>,
    blobs: Arc<dyn BlobBackend>,
    config: StoreConfig,
    /// Blob keys confirmed present, to skip repeat existence probes.
    blob_exists_cache: Mutex<HashSet<String>>,
}

impl RemoteStore {
    pub fn new(
        structured: Arc<dyn StructuredBackend>,
        blobs: Arc<dyn BlobBackend>,
        config: StoreConfig,
    ) -> Self {
        Self {
            structured,
            blobs,
            config,
            blob_exists_cache: Mutex::new(HashSet::new()),
        }
    }

    /// Both tiers served by one backend.
    pub fn with_backend<B>(backend: Arc<B>, config: StoreConfig) -> Self
    where
        B: StructuredBackend + BlobBackend + 'static,
    {
        Self::new(backend.clone(), backend, config)
    }

    async fn throttle(&self, round: usize) {
        if round > 0 && self.config.throttle_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.throttle_ms)).await;
        }
    }

    async fn backoff(&self, attempt: u32) {
        let ms = 2u64.saturating_pow(attempt) * self.config.backoff_base_ms;
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    /// Whether a frame's payload belongs in the blob store.
    fn goes_to_blob(&self, frame: &Frame, serialized_len: usize) -> bool {
        is_binary_ib(&frame.ib) || serialized_len >= self.config.blob_threshold_bytes
    }

    /// Structured batch get with capacity retries and unprocessed-subset
    /// re-issue for a single chunk of keys.
    async fn get_chunk(&self, keys: &[String]) -> Result<Vec<FrameRow>, StoreError> {
        let mut rows = Vec::new();
        let mut pending: Vec<String> = keys.to_vec();
        let mut retries = 0u32;
        while !pending.is_empty() {
            let out = self.capacity_retry_get(&pending).await?;
            rows.extend(out.rows);
            if out.unprocessed.is_empty() {
                break;
            }
            if out.unprocessed.len() < pending.len() {
                // progress was made; re-issue the remainder without
                // consuming a retry
                debug!(unprocessed = out.unprocessed.len(), "re-issuing unprocessed keys");
            } else {
                retries += 1;
                if retries > self.config.max_unprocessed_retries {
                    return Err(StoreError::UnprocessedExhausted {
                        retries: self.config.max_unprocessed_retries,
                        remaining: out.unprocessed.len(),
                    });
                }
                warn!(retries, "batch get made no progress; backing off");
                self.backoff(retries).await;
            }
            pending = out.unprocessed;
        }
        Ok(rows)
    }

    async fn capacity_retry_get(
        &self,
        keys: &[String],
    ) -> Result<crate::store::backend::BatchGetOutput, StoreError> {
        let mut attempt = 0u32;
        loop {
            match self.structured.batch_get(keys).await {
                Err(StoreError::Capacity(msg)) if attempt < self.config.max_capacity_retries => {
                    attempt += 1;
                    warn!(attempt, %msg, "capacity error on batch get; backing off");
                    self.backoff(attempt).await;
                }
                other => return other,
            }
        }
    }

    async fn put_chunk(&self, rows: &[FrameRow]) -> Result<(), StoreError> {
        let mut pending: Vec<FrameRow> = rows.to_vec();
        let mut retries = 0u32;
        while !pending.is_empty() {
            let out = self.capacity_retry_put(&pending).await?;
            if out.unprocessed.is_empty() {
                break;
            }
            if out.unprocessed.len() < pending.len() {
                debug!(unprocessed = out.unprocessed.len(), "re-issuing unprocessed rows");
            } else {
                retries += 1;
                if retries > self.config.max_unprocessed_retries {
                    return Err(StoreError::UnprocessedExhausted {
                        retries: self.config.max_unprocessed_retries,
                        remaining: out.unprocessed.len(),
                    });
                }
                warn!(retries, "batch put made no progress; backing off");
                self.backoff(retries).await;
            }
            pending = out.unprocessed;
        }
        Ok(())
    }

    async fn capacity_retry_put(
        &self,
        rows: &[FrameRow],
    ) -> Result<crate::store::backend::BatchPutOutput, StoreError> {
        let mut attempt = 0u32;
        loop {
            match self.structured.batch_put(rows).await {
                Err(StoreError::Capacity(msg)) if attempt < self.config.max_capacity_retries => {
                    attempt += 1;
                    warn!(attempt, %msg, "capacity error on batch put; backing off");
                    self.backoff(attempt).await;
                }
                other => return other,
            }
        }
    }

    async fn query_newer_rows(
        &self,
        timeline_root: &str,
        n_least: u64,
    ) -> Result<Vec<FrameRow>, StoreError> {
        let mut attempt = 0u32;
        loop {
            match self.structured.query_newer(timeline_root, n_least).await {
                Err(StoreError::Capacity(msg)) if attempt < self.config.max_capacity_retries => {
                    attempt += 1;
                    warn!(attempt, %msg, "capacity error on newer query; backing off");
                    self.backoff(attempt).await;
                }
                other => return other,
            }
        }
    }

    /// Fetch rows for all keys, in throttled chunks.
    async fn get_rows(&self, keys: &[String]) -> Result<Vec<FrameRow>, StoreError> {
        let mut rows = Vec::new();
        for (round, chunk) in keys.chunks(self.config.get_batch_size.max(1)).enumerate() {
            self.throttle(round).await;
            rows.extend(self.get_chunk(chunk).await?);
        }
        Ok(rows)
    }

    async fn blob_exists_cached(&self, key: &str) -> Result<bool, StoreError> {
        if self.blob_exists_cache.lock().contains(key) {
            return Ok(true);
        }
        let exists = self.blobs.blob_exists(key).await?;
        if exists {
            self.blob_exists_cache.lock().insert(key.to_string());
        }
        Ok(exists)
    }

    /// Turn a fetched row into a frame, following blob placeholders.
    async fn row_to_frame(&self, row: &FrameRow) -> Result<Frame, StoreError> {
        if !row.large_object {
            return row.to_frame();
        }
        match self.blobs.get_blob(&row.key).await? {
            Some(bytes) => frame_from_blob(&bytes),
            None => Err(StoreError::Backend(format!(
                "placeholder row {} has no blob payload",
                row.addr()
            ))),
        }
    }
}

#[async_trait]
impl StoreAdapter for RemoteStore {
    async fn get_frames(&self, addrs: &[Addr]) -> Result<FetchOutcome, StoreError> {
        let keys: Vec<String> = addrs.iter().map(|a| row_key(a)).collect();
        let rows = self.get_rows(&keys).await?;
        let by_key: HashMap<&str, &FrameRow> =
            rows.iter().map(|r| (r.key.as_str(), r)).collect();

        let mut outcome = FetchOutcome::default();
        for (addr, key) in addrs.iter().zip(&keys) {
            match by_key.get(key.as_str()) {
                Some(row) => outcome.frames.push(self.row_to_frame(row).await?),
                None => outcome.not_found.push(addr.clone()),
            }
        }
        debug!(
            requested = addrs.len(),
            found = outcome.frames.len(),
            "multi-get complete"
        );
        Ok(outcome)
    }

    async fn put_frames(&self, frames: &[Frame]) -> Result<PutOutcome, StoreError> {
        let keys: Vec<String> = frames.iter().map(|f| row_key(&f.addr())).collect();
        let existing: HashSet<String> = self
            .get_rows(&keys)
            .await?
            .into_iter()
            .map(|r| r.key)
            .collect();

        let mut outcome = PutOutcome::default();
        let mut rows = Vec::with_capacity(frames.len());
        for (frame, key) in frames.iter().zip(&keys) {
            if existing.contains(key) {
                outcome.already_present.push(frame.addr());
            } else {
                outcome.stored.push(frame.addr());
            }
            let payload = frame_to_blob(frame)?;
            if self.goes_to_blob(frame, payload.len()) {
                self.blobs.put_blob(key, &payload).await?;
                self.blob_exists_cache.lock().insert(key.clone());
                rows.push(FrameRow::placeholder(frame));
            } else {
                rows.push(FrameRow::from_frame(frame)?);
            }
        }

        for (round, chunk) in rows.chunks(self.config.put_batch_size.max(1)).enumerate() {
            self.throttle(round).await;
            self.put_chunk(chunk).await?;
        }
        debug!(
            stored = outcome.stored.len(),
            already_present = outcome.already_present.len(),
            "multi-put complete"
        );
        Ok(outcome)
    }

    async fn delete_frames(&self, addrs: &[Addr]) -> Result<DeleteOutcome, StoreError> {
        let keys: Vec<String> = addrs.iter().map(|a| row_key(a)).collect();
        let existing: HashSet<String> = self
            .get_rows(&keys)
            .await?
            .into_iter()
            .map(|r| r.key)
            .collect();

        let mut outcome = DeleteOutcome::default();
        for (addr, key) in addrs.iter().zip(&keys) {
            if existing.contains(key) {
                outcome.deleted.push(addr.clone());
            } else {
                outcome.not_found.push(addr.clone());
            }
        }
        for chunk in keys.chunks(self.config.put_batch_size.max(1)) {
            self.structured.batch_delete(chunk).await?;
        }
        for key in &keys {
            self.blobs.delete_blob(key).await?;
            self.blob_exists_cache.lock().remove(key);
        }
        Ok(outcome)
    }

    async fn list_addrs(&self) -> Result<Vec<Addr>, StoreError> {
        let rows = self.structured.scan().await?;
        Ok(rows.iter().map(FrameRow::addr).collect())
    }

    async fn exists(&self, addrs: &[Addr]) -> Result<ExistsOutcome, StoreError> {
        let keys: Vec<String> = addrs.iter().map(|a| row_key(a)).collect();
        let present_rows: HashSet<String> = self
            .get_rows(&keys)
            .await?
            .into_iter()
            .map(|r| r.key)
            .collect();

        let mut outcome = ExistsOutcome::default();
        for (addr, key) in addrs.iter().zip(&keys) {
            let present = present_rows.contains(key)
                || (is_binary_ib(crate::frame::addr::ib_of(addr))
                    && self.blob_exists_cached(key).await?);
            if present {
                outcome.present.push(addr.clone());
            } else {
                outcome.absent.push(addr.clone());
            }
        }
        Ok(outcome)
    }

    async fn latest_addrs(
        &self,
        frames: &[Frame],
    ) -> Result<BTreeMap<TjpAddr, Option<Addr>>, StoreError> {
        let split = split_timelines(frames);
        let mut map = BTreeMap::new();

        let roots: Vec<(TjpAddr, String)> = split
            .timelines
            .keys()
            .map(|tjp_addr| {
                let root = crate::frame::addr::punctiliar_of(crate::frame::addr::gib_of(tjp_addr))
                    .to_string();
                (tjp_addr.clone(), root)
            })
            .collect();

        for (round, chunk) in roots.chunks(self.config.query_batch_size.max(1)).enumerate() {
            self.throttle(round).await;
            // the queries of one round run concurrently
            let queries = chunk.iter().map(|(tjp_addr, root)| async move {
                let rows = self.query_newer_rows(root, 0).await?;
                // latest = highest n; equal-n collisions resolve by gib so
                // the pick is at least deterministic
                let latest = rows
                    .iter()
                    .max_by(|a, b| a.n.cmp(&b.n).then_with(|| a.gib.cmp(&b.gib)))
                    .map(FrameRow::addr);
                Ok::<_, StoreError>((tjp_addr.clone(), latest))
            });
            for result in futures::future::join_all(queries).await {
                let (tjp_addr, latest) = result?;
                map.insert(tjp_addr, latest);
            }
        }

        // frames outside timelines reduce to presence checks
        if !split.without_tjp.is_empty() {
            let addrs: Vec<Addr> = split.without_tjp.iter().map(Frame::addr).collect();
            let exists = self.exists(&addrs).await?;
            let present: HashSet<Addr> = exists.present.into_iter().collect();
            for addr in addrs {
                let value = present.contains(&addr).then(|| addr.clone());
                map.insert(addr, value);
            }
        }
        Ok(map)
    }

    async fn newer_frames(
        &self,
        timeline_root: &str,
        n_least: u64,
    ) -> Result<Vec<Frame>, StoreError> {
        let rows = self.query_newer_rows(timeline_root, n_least).await?;
        let mut frames = Vec::with_capacity(rows.len());
        for row in &rows {
            frames.push(self.row_to_frame(row).await?);
        }
        Ok(frames)
    }
}
