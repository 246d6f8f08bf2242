//! Witness / command substrate
//!
//! A witness consumes a command argument and returns a result; a space is
//! a witness that stores and serves frames. Witness-hood is explicit: the
//! trait below, plus a boolean capability marker on descriptor frames —
//! never inferred from a frame's shape.

pub mod router;

pub use router::Space;

use crate::frame::Frame;
use crate::sync::{SagaHandle, SyncRequest};
use crate::types::{Addr, SpaceId, TjpAddr};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Data key of the capability marker on witness descriptor frames.
pub const DATA_KEY_WITNESS: &str = "witness";

/// True when a descriptor frame declares the witness capability.
pub fn is_witness_frame(frame: &Frame) -> bool {
    frame
        .data
        .get(DATA_KEY_WITNESS)
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

/// Command verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cmd {
    Get,
    Put,
    Delete,
}

/// Command modifiers; the combination with the verb selects the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmdModifier {
    /// Existence/capability check instead of the operation itself.
    Can,
    /// Operate on addresses rather than frames.
    Addrs,
    /// Resolve per-timeline latest.
    Latest,
    /// Subscribe to / drain timeline update notifications.
    Watch,
    /// Drop a timeline update subscription.
    Unwatch,
    /// Resolve timeline origins.
    Tjps,
    /// Run the put through the sync reconciliation engine.
    Sync,
}

/// Argument consumed by a witness.
#[derive(Debug, Clone, Default)]
pub struct CommandArg {
    pub cmd: Option<Cmd>,
    pub modifiers: BTreeSet<CmdModifier>,
    pub addrs: Vec<Addr>,
    pub frames: Vec<Frame>,
    /// Space issuing the command; required for watch bookkeeping.
    pub src_space_id: Option<SpaceId>,
    /// Saga parameters; required for `put … sync`.
    pub sync: Option<SyncRequest>,
}

impl CommandArg {
    pub fn new(cmd: Cmd) -> Self {
        CommandArg {
            cmd: Some(cmd),
            ..Default::default()
        }
    }

    pub fn with_modifier(mut self, modifier: CmdModifier) -> Self {
        self.modifiers.insert(modifier);
        self
    }

    pub fn with_addrs(mut self, addrs: Vec<Addr>) -> Self {
        self.addrs = addrs;
        self
    }

    pub fn with_frames(mut self, frames: Vec<Frame>) -> Self {
        self.frames = frames;
        self
    }

    pub fn with_src_space(mut self, space_id: &str) -> Self {
        self.src_space_id = Some(space_id.to_string());
        self
    }

    pub fn with_sync(mut self, sync: SyncRequest) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn has_modifier(&self, modifier: CmdModifier) -> bool {
        self.modifiers.contains(&modifier)
    }
}

/// Result returned by a witness. Failures are carried in `errors` with
/// `success == false`; the call itself does not error.
#[derive(Debug, Default)]
pub struct CommandResult {
    pub success: bool,
    pub frames: Vec<Frame>,
    pub addrs: Vec<Addr>,
    pub addrs_not_found: Vec<Addr>,
    pub addrs_already_present: Vec<Addr>,
    pub latest_addr_map: BTreeMap<Addr, Option<Addr>>,
    pub watch_update_map: BTreeMap<TjpAddr, Addr>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Live handle to the reconciliation saga started by `put … sync`.
    pub saga: Option<SagaHandle>,
}

impl CommandResult {
    pub fn failure(errors: Vec<String>) -> Self {
        CommandResult {
            success: false,
            errors,
            ..Default::default()
        }
    }

    pub fn ok() -> Self {
        CommandResult {
            success: true,
            ..Default::default()
        }
    }
}

/// A witness: consumes a command argument, returns a result.
#[async_trait]
pub trait Witness: Send + Sync {
    /// The witness's descriptor frame, carrying the explicit capability
    /// marker in its data.
    fn descriptor(&self) -> Frame;

    async fn witness(&self, arg: CommandArg) -> CommandResult;
}

/// External authorization gate a space may consult before executing a
/// command. The gate's internals (challenge/response schemes etc.) are
/// outside this crate.
#[async_trait]
pub trait AuthGate: Send + Sync {
    async fn authorize(&self, arg: &CommandArg) -> Result<(), String>;
}

/// Default gate: every command is allowed.
pub struct AllowAll;

#[async_trait]
impl AuthGate for AllowAll {
    async fn authorize(&self, _arg: &CommandArg) -> Result<(), String> {
        Ok(())
    }
}
