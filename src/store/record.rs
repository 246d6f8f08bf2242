//! Structured-store row shape and frame conversions.
//!
//! The structured store keys rows by a digest of the frame address. A row
//! carries the frame's fields in serialized columns plus the two values the
//! timeline index needs: the timeline root (origin hash) and the sequence
//! number. Frames that are oversized or binary-flagged live in the blob
//! store; their row is only a placeholder with the `large_object` flag set.

use crate::error::StoreError;
use crate::frame::{addr, Frame};
use crate::types::{Addr, Gib, Ib};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Characters rewritten in the serialized data column. Escaping is
/// idempotent to decode because `%` itself is escaped.
const DATA_ESCAPES: &AsciiSet = &CONTROLS.add(b'%');

/// One row in the structured store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRow {
    /// Primary key: digest of the frame address.
    pub key: String,
    pub ib: Ib,
    pub gib: Gib,
    /// Serialized (and escaped where necessary) `data` column.
    pub data: Option<String>,
    /// Serialized `rel8ns` column.
    pub rel8ns: Option<String>,
    /// Sequence number, for the timeline index.
    pub n: Option<u64>,
    /// Timeline root (origin hash), for the timeline index.
    pub timeline_root: Option<Gib>,
    /// True when the payload lives in the blob store and this row is only
    /// a placeholder.
    pub large_object: bool,
}

/// Primary key for an address.
pub fn row_key(frame_addr: &str) -> String {
    blake3::hash(frame_addr.as_bytes()).to_hex().to_string()
}

/// True when the frame's payload is binary by convention of its label.
pub fn is_binary_ib(ib: &str) -> bool {
    ib == "bin" || ib.starts_with("bin ")
}

/// Timeline root of a frame: the punctiliar hash of its origin's gib.
pub fn timeline_root_of(frame: &Frame) -> Option<Gib> {
    frame
        .tjp_addr()
        .map(|tjp_addr| addr::punctiliar_of(addr::gib_of(&tjp_addr)).to_string())
}

impl FrameRow {
    /// Build the full row for a frame.
    pub fn from_frame(frame: &Frame) -> Result<Self, StoreError> {
        let data = if frame.data.is_empty() {
            None
        } else {
            let json = serde_json::to_string(&frame.data)?;
            Some(utf8_percent_encode(&json, DATA_ESCAPES).to_string())
        };
        let rel8ns = if frame.rel8ns.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&frame.rel8ns)?)
        };
        Ok(FrameRow {
            key: row_key(&frame.addr()),
            ib: frame.ib.clone(),
            gib: frame.gib.clone(),
            data,
            rel8ns,
            n: frame.n(),
            timeline_root: timeline_root_of(frame),
            large_object: false,
        })
    }

    /// Build the placeholder row for a frame whose payload goes to the
    /// blob store.
    pub fn placeholder(frame: &Frame) -> Self {
        FrameRow {
            key: row_key(&frame.addr()),
            ib: frame.ib.clone(),
            gib: frame.gib.clone(),
            data: None,
            rel8ns: None,
            n: frame.n(),
            timeline_root: timeline_root_of(frame),
            large_object: true,
        }
    }

    /// The address this row stores.
    pub fn addr(&self) -> Addr {
        addr::format_addr(&self.ib, &self.gib)
    }

    /// Reconstruct the frame from a full (non-placeholder) row.
    pub fn to_frame(&self) -> Result<Frame, StoreError> {
        if self.large_object {
            return Err(StoreError::Serde(format!(
                "row {} is a blob placeholder; payload lives in the blob store",
                self.addr()
            )));
        }
        let data = match &self.data {
            Some(escaped) => {
                let json = percent_decode_str(escaped)
                    .decode_utf8()
                    .map_err(|e| StoreError::Serde(e.to_string()))?;
                serde_json::from_str(&json)?
            }
            None => serde_json::Map::new(),
        };
        let rel8ns: BTreeMap<String, Vec<Addr>> = match &self.rel8ns {
            Some(json) => serde_json::from_str(json)?,
            None => BTreeMap::new(),
        };
        Ok(Frame {
            ib: self.ib.clone(),
            gib: self.gib.clone(),
            data,
            rel8ns,
        })
    }
}

/// Serialize a frame for blob storage.
pub fn frame_to_blob(frame: &Frame) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(frame)?)
}

/// Deserialize a frame from blob storage.
pub fn frame_from_blob(bytes: &[u8]) -> Result<Frame, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}
