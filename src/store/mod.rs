//! Frame stores
//!
//! `StoreAdapter` is the seam between the command substrate / sync engine
//! and a concrete backing store: only leaf operations, no routing. The
//! provided implementation, [`remote::RemoteStore`], translates frame
//! operations onto a two-tier backend (structured rows + blobs) with
//! batching, throttling and retry.

pub mod backend;
pub mod record;
pub mod remote;

pub use backend::{BlobBackend, MemoryBackend, SledBackend, StructuredBackend};
pub use remote::RemoteStore;

use crate::error::StoreError;
use crate::frame::Frame;
use crate::types::{Addr, TjpAddr};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Result of a multi-get.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub frames: Vec<Frame>,
    pub not_found: Vec<Addr>,
}

/// Result of a multi-put.
#[derive(Debug, Default)]
pub struct PutOutcome {
    pub stored: Vec<Addr>,
    /// Addresses that already had content in the store. Re-putting them is
    /// idempotent (content addressing), so this is informational.
    pub already_present: Vec<Addr>,
}

/// Result of a multi-delete.
#[derive(Debug, Default)]
pub struct DeleteOutcome {
    pub deleted: Vec<Addr>,
    pub not_found: Vec<Addr>,
}

/// Result of an existence check.
#[derive(Debug, Default)]
pub struct ExistsOutcome {
    pub present: Vec<Addr>,
    pub absent: Vec<Addr>,
}

/// Leaf operations every concrete store implements.
///
/// The latest/newer queries are timeline-aware: they consult the
/// `(timeline_root, n)` index rather than individual addresses.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    async fn get_frames(&self, addrs: &[Addr]) -> Result<FetchOutcome, StoreError>;

    async fn put_frames(&self, frames: &[Frame]) -> Result<PutOutcome, StoreError>;

    async fn delete_frames(&self, addrs: &[Addr]) -> Result<DeleteOutcome, StoreError>;

    async fn list_addrs(&self) -> Result<Vec<Addr>, StoreError>;

    async fn exists(&self, addrs: &[Addr]) -> Result<ExistsOutcome, StoreError>;

    /// For each given frame, the latest address the store holds:
    /// timeline-bearing frames map their origin address to the
    /// highest-sequence member found (`None` when the timeline is absent);
    /// frames outside any timeline map their own address to presence.
    async fn latest_addrs(
        &self,
        frames: &[Frame],
    ) -> Result<BTreeMap<TjpAddr, Option<Addr>>, StoreError>;

    /// All frames of a timeline with sequence number `>= n_least`.
    /// `timeline_root` is the origin's punctiliar hash.
    async fn newer_frames(
        &self,
        timeline_root: &str,
        n_least: u64,
    ) -> Result<Vec<Frame>, StoreError>;
}
