//! Sync Reconciliation Engine
//!
//! Reconciles a local collection of frames against a remote, shared store
//! under a put-merge, auto-resolving strategy. One saga spans any number
//! of timelines destined for one sync space; per timeline the engine
//! decides between no-op, push, insert, or one of two merge strategies,
//! while continuously persisting and broadcasting its own status timeline.

pub mod engine;
pub mod merge;
pub mod status;

pub use engine::start_saga;
pub use status::{StatusCode, StatusIb};

use crate::error::SpaceError;
use crate::types::{SagaId, SpaceId, TjpAddr};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Role of a space participating in a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    /// The space the frames come from.
    Src,
    /// A space receiving them.
    Dest,
}

/// One participating space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub space_id: SpaceId,
    pub role: ParticipantRole,
}

impl Participant {
    pub fn src(space_id: &str) -> Self {
        Participant {
            space_id: space_id.to_string(),
            role: ParticipantRole::Src,
        }
    }

    pub fn dest(space_id: &str) -> Self {
        Participant {
            space_id: space_id.to_string(),
            role: ParticipantRole::Dest,
        }
    }
}

/// Parameters of one synchronization saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub saga_id: SagaId,
    pub participants: Vec<Participant>,
}

impl SyncRequest {
    /// The single source participant's space id.
    pub fn src_space_id(&self) -> Result<&SpaceId, SpaceError> {
        let mut sources = self
            .participants
            .iter()
            .filter(|p| p.role == ParticipantRole::Src);
        let first = sources
            .next()
            .ok_or_else(|| SpaceError::validation("sync participants require a src"))?;
        if sources.next().is_some() {
            return Err(SpaceError::validation("sync participants allow only one src"));
        }
        Ok(&first.space_id)
    }

    pub fn validate(&self) -> Result<(), SpaceError> {
        if self.saga_id.is_empty() {
            return Err(SpaceError::validation("saga id required"));
        }
        self.src_space_id()?;
        if !self
            .participants
            .iter()
            .any(|p| p.role == ParticipantRole::Dest)
        {
            return Err(SpaceError::validation(
                "sync participants require at least one dest",
            ));
        }
        Ok(())
    }
}

/// One element of the live status stream.
#[derive(Debug, Clone)]
pub enum SagaEvent {
    /// A freshly persisted status frame.
    Status(crate::frame::Frame),
    /// The saga failed; no `completed` status will follow and the stream
    /// closes after this event.
    Failed(String),
}

/// Caller's handle to a running saga. In-flight work runs to completion
/// whether or not the stream is observed.
pub struct SagaHandle {
    pub saga_id: SagaId,
    /// Origin address of the saga's status timeline.
    pub status_tjp_addr: TjpAddr,
    pub events: mpsc::UnboundedReceiver<SagaEvent>,
}

impl std::fmt::Debug for SagaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaHandle")
            .field("saga_id", &self.saga_id)
            .field("status_tjp_addr", &self.status_tjp_addr)
            .finish_non_exhaustive()
    }
}
