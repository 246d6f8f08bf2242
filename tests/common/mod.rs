//! Shared helpers for integration tests.
#![allow(dead_code)]

use serde_json::{json, Map};
use std::sync::Arc;
use weft::config::WeftConfig;
use weft::frame::transform::{self, TransformOpts, TransformResult};
use weft::frame::Frame;
use weft::store::{MemoryBackend, RemoteStore};
use weft::sync::status::StatusIb;
use weft::sync::{SagaEvent, SagaHandle};

/// Config with all delays minimized for tests.
pub fn fast_config() -> Arc<WeftConfig> {
    let mut cfg = WeftConfig::default();
    cfg.store.throttle_ms = 0;
    cfg.store.backoff_base_ms = 1;
    cfg.graph.retry_delay_ms = 1;
    cfg.lock.max_delay_ms = 2;
    cfg.lock.max_attempts = 3;
    Arc::new(cfg)
}

/// An in-memory remote store plus a handle to its backend for fault
/// injection and call inspection.
pub fn memory_store() -> (Arc<MemoryBackend>, Arc<RemoteStore>) {
    let backend = Arc::new(MemoryBackend::new());
    let store = Arc::new(RemoteStore::with_backend(
        backend.clone(),
        fast_config().store.clone(),
    ));
    (backend, store)
}

/// Fork a fresh timeline origin. The fork itself records no DNA, so a
/// member's DNA list holds exactly its mut8/rel8 descriptors.
pub fn origin(dest_ib: &str) -> Frame {
    transform::apply(
        &Frame::primitive("note"),
        &TransformOpts::Fork {
            src_addr: None,
            dest_ib: Some(dest_ib.to_string()),
            tjp: true,
            n_counter: true,
            dna: false,
        },
    )
    .unwrap()
    .new_frame
}

/// One mut8 step patching a single key.
pub fn mut8_step(src: &Frame, key: &str, value: &str, dna: bool) -> TransformResult {
    let mut patch = Map::new();
    patch.insert(key.to_string(), json!(value));
    transform::apply(
        src,
        &TransformOpts::Mut8 {
            src_addr: None,
            mut8_ib: None,
            data_to_add_or_patch: Some(patch),
            data_to_remove: vec![],
            dna,
        },
    )
    .unwrap()
}

/// A timeline chain plus everything needed to sync it.
pub struct Chain {
    /// Members ascending by sequence number.
    pub members: Vec<Frame>,
    /// DNA frames created along the way.
    pub dna: Vec<Frame>,
}

impl Chain {
    pub fn origin(&self) -> &Frame {
        &self.members[0]
    }

    pub fn latest(&self) -> &Frame {
        self.members.last().unwrap()
    }

    /// Members and DNA together, the set a caller hands to sync.
    pub fn all_frames(&self) -> Vec<Frame> {
        let mut all = self.members.clone();
        all.extend(self.dna.clone());
        all
    }

    /// Extend the chain by one mut8 step.
    pub fn push_step(&mut self, key: &str, value: &str, dna: bool) {
        let result = mut8_step(self.latest(), key, value, dna);
        if let Some(d) = result.dna {
            self.dna.push(d);
        }
        self.members.push(result.new_frame);
    }
}

/// Build a chain: origin plus one mut8 per `(key, value)` step.
pub fn chain(dest_ib: &str, steps: &[(&str, &str)], dna: bool) -> Chain {
    let mut chain = Chain {
        members: vec![origin(dest_ib)],
        dna: vec![],
    };
    for (key, value) in steps {
        chain.push_step(key, value, dna);
    }
    chain
}

/// Drain a saga's event stream to completion.
///
/// Returns every published status frame and the failure message, if the
/// saga failed.
pub async fn collect_events(mut handle: SagaHandle) -> (Vec<Frame>, Option<String>) {
    let mut statuses = Vec::new();
    let mut failure = None;
    while let Some(event) = handle.events.recv().await {
        match event {
            SagaEvent::Status(frame) => statuses.push(frame),
            SagaEvent::Failed(msg) => failure = Some(msg),
        }
    }
    (statuses, failure)
}

/// The decision codes carried by a saga's status frames, in order.
pub fn codes_of(statuses: &[Frame]) -> Vec<String> {
    statuses
        .iter()
        .filter_map(|f| StatusIb::code_of(f).map(|c| c.as_str().to_string()))
        .collect()
}
