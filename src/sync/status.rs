//! Sync status frames
//!
//! Each saga gets its own small timeline recording progress: a `started`
//! origin, one frame per reconciled timeline carrying that timeline's
//! decision code and accounting, and a terminal `completed` frame. The
//! status timeline's origin address doubles as the saga's stream id.

use crate::error::SpaceError;
use crate::frame::transform::{self, TransformOpts};
use crate::frame::Frame;
use crate::sync::Participant;
use crate::types::{Addr, SagaId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Progress codes a status frame can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Started,
    AlreadySynced,
    Updated,
    Inserted,
    MergedDna,
    MergedState,
    Completed,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Started => "started",
            StatusCode::AlreadySynced => "already_synced",
            StatusCode::Updated => "updated",
            StatusCode::Inserted => "inserted",
            StatusCode::MergedDna => "merged_dna",
            StatusCode::MergedState => "merged_state",
            StatusCode::Completed => "completed",
        }
    }
}

/// Helpers for the deterministic status ib, `sync status <code> <sagaId>`.
pub struct StatusIb;

impl StatusIb {
    pub fn build(code: StatusCode, saga_id: &str) -> String {
        format!("sync status {} {saga_id}", code.as_str())
    }

    /// Parse the code back out of a status ib.
    pub fn code_of(frame: &Frame) -> Option<StatusCode> {
        frame
            .data
            .get("status_code")
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_value(json!(s)).ok())
    }
}

/// Per-timeline accounting attached to a status frame.
#[derive(Debug, Clone, Default)]
pub struct Accounting {
    /// Addresses written to the store this step.
    pub did_rx: Vec<Addr>,
    /// Store-only addresses pulled down for the caller this step.
    pub did_tx: Vec<Addr>,
    /// Addresses created by merging this step.
    pub did_create: Vec<Addr>,
    /// Old local latest address → new latest address after a merge.
    pub did_merge_map: BTreeMap<Addr, Addr>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Accounting {
    fn patch(&self, code: StatusCode) -> Map<String, Value> {
        let mut patch = Map::new();
        patch.insert("status_code".to_string(), json!(code.as_str()));
        patch.insert("success".to_string(), json!(self.errors.is_empty()));
        if !self.did_rx.is_empty() {
            patch.insert("did_rx".to_string(), json!(self.did_rx));
        }
        if !self.did_tx.is_empty() {
            patch.insert("did_tx".to_string(), json!(self.did_tx));
        }
        if !self.did_create.is_empty() {
            patch.insert("did_create".to_string(), json!(self.did_create));
        }
        if !self.did_merge_map.is_empty() {
            patch.insert("did_merge_map".to_string(), json!(self.did_merge_map));
        }
        if !self.errors.is_empty() {
            patch.insert("errors".to_string(), json!(self.errors));
        }
        if !self.warnings.is_empty() {
            patch.insert("warnings".to_string(), json!(self.warnings));
        }
        patch
    }
}

/// Create the `started` origin of a new status timeline.
///
/// Returns the origin frame and the full set of frames to persist for it.
pub fn start_status(
    saga_id: &SagaId,
    participants: &[Participant],
    to_tx: &[Addr],
) -> Result<(Frame, Vec<Frame>), SpaceError> {
    let parent = Frame::primitive("sync status");
    let result = transform::apply(
        &parent,
        &TransformOpts::Fork {
            src_addr: None,
            dest_ib: Some(StatusIb::build(StatusCode::Started, saga_id)),
            tjp: true,
            n_counter: true,
            dna: false,
        },
    )?;
    let mut origin = result.new_frame;
    origin
        .data
        .insert("status_code".to_string(), json!(StatusCode::Started.as_str()));
    origin.data.insert(
        "participants".to_string(),
        serde_json::to_value(participants)
            .map_err(|e| SpaceError::Transform(e.to_string()))?,
    );
    origin.data.insert("to_tx".to_string(), json!(to_tx));
    origin.gib = crate::frame::integrity::compute_gib(&origin)?;

    Ok((origin.clone(), vec![origin]))
}

/// Mutate the running status frame to the next code, carrying accounting.
///
/// Status frames never record DNA; the chain is only linked through
/// `past`.
pub fn advance(
    status: &Frame,
    saga_id: &SagaId,
    code: StatusCode,
    accounting: &Accounting,
) -> Result<Frame, SpaceError> {
    let result = transform::apply(
        status,
        &TransformOpts::Mut8 {
            src_addr: None,
            mut8_ib: Some(StatusIb::build(code, saga_id)),
            data_to_add_or_patch: Some(accounting.patch(code)),
            data_to_remove: vec![],
            dna: false,
        },
    )?;
    Ok(result.new_frame)
}
