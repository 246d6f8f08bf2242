//! Content-addressed frames
//!
//! The immutable unit of the data model. A frame is `{ib, gib, data,
//! rel8ns}`; its address is `ib^gib` and, unless the gib is the reserved
//! no-integrity sentinel, `gib` is a hash of the other three fields.
//! Frames that share one originating frame (the tjp) form a timeline.

pub mod addr;
pub mod integrity;
pub mod transform;

pub use addr::{format_addr, parse_addr};
pub use integrity::{compute_gib, validate_intrinsically};

use crate::types::{Addr, Gib, Ib, TjpAddr, GIB_SENTINEL};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Relation holding the ancestor chain within a timeline.
pub const REL8N_PAST: &str = "past";
/// Relation holding lineage across timelines (fork sources).
pub const REL8N_ANCESTOR: &str = "ancestor";
/// Relation holding the transform descriptors that produced this frame.
pub const REL8N_DNA: &str = "dna";
/// Relation pointing at the timeline's originating frame.
pub const REL8N_TJP: &str = "tjp";
/// Relation holding identity attestations.
pub const REL8N_IDENTITY: &str = "identity";

/// Data key for the monotonic sequence number within a timeline.
pub const DATA_KEY_N: &str = "n";
/// Data key marking a frame as a timeline origin.
pub const DATA_KEY_IS_TJP: &str = "is_tjp";
/// Data key for the uuid stamped onto timeline origins.
pub const DATA_KEY_UUID: &str = "uuid";
/// Data key for the timestamp stamped onto timeline origins.
pub const DATA_KEY_TIMESTAMP: &str = "timestamp";

/// Immutable content-addressed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub ib: Ib,
    pub gib: Gib,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rel8ns: BTreeMap<String, Vec<Addr>>,
}

impl Frame {
    /// A primitive frame: sentinel gib, no integrity guarantees.
    pub fn primitive<S: Into<Ib>>(ib: S) -> Self {
        Frame {
            ib: ib.into(),
            gib: GIB_SENTINEL.to_string(),
            data: Map::new(),
            rel8ns: BTreeMap::new(),
        }
    }

    /// The frame's address, `ib^gib`.
    pub fn addr(&self) -> Addr {
        addr::format_addr(&self.ib, &self.gib)
    }

    pub fn is_primitive(&self) -> bool {
        addr::is_primitive_gib(&self.gib)
    }

    /// The addresses related under `name`, empty when absent.
    pub fn rel8n(&self, name: &str) -> &[Addr] {
        self.rel8ns.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True when this frame is itself a timeline origin.
    pub fn is_tjp(&self) -> bool {
        self.data
            .get(DATA_KEY_IS_TJP)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// True when this frame belongs to a timeline (is the origin or relates
    /// to one).
    pub fn has_tjp(&self) -> bool {
        self.is_tjp() || !self.rel8n(REL8N_TJP).is_empty()
    }

    /// True when this frame records the transforms that produced it.
    pub fn has_dna(&self) -> bool {
        !self.rel8n(REL8N_DNA).is_empty()
    }

    /// Address of this frame's timeline origin, if it has one.
    pub fn tjp_addr(&self) -> Option<TjpAddr> {
        if self.is_tjp() {
            Some(self.addr())
        } else {
            self.rel8n(REL8N_TJP).first().cloned()
        }
    }

    /// Sequence number within the timeline, if stamped.
    pub fn n(&self) -> Option<u64> {
        self.data.get(DATA_KEY_N).and_then(Value::as_u64)
    }
}

/// A set of frames split into timelines and the frames outside any.
#[derive(Debug, Default)]
pub struct TimelineSplit {
    /// Timeline members keyed by origin address, each sorted ascending by
    /// sequence number.
    pub timelines: BTreeMap<TjpAddr, Vec<Frame>>,
    /// Frames with no timeline ("stones").
    pub without_tjp: Vec<Frame>,
}

/// Group frames by the timeline they belong to.
///
/// Members are sorted ascending by `data.n`; frames without a sequence
/// number sort first. Frames with no timeline land in `without_tjp`.
pub fn split_timelines(frames: &[Frame]) -> TimelineSplit {
    let mut split = TimelineSplit::default();
    for frame in frames {
        match frame.tjp_addr() {
            Some(tjp_addr) => {
                split.timelines.entry(tjp_addr).or_default().push(frame.clone());
            }
            None => split.without_tjp.push(frame.clone()),
        }
    }
    for members in split.timelines.values_mut() {
        members.sort_by_key(|f| f.n().unwrap_or(0));
    }
    split
}
