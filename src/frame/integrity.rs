//! Integrity hashing for frames.
//!
//! A frame's gib is computed from its ib, data and rel8ns:
//!
//! ```text
//! gib = H( H(ib) + H(json(rel8ns)) + H(json(data)) )
//! ```
//!
//! where `H` is uppercase-hex SHA-256 and the inner hashes of empty
//! data/rel8ns contribute an empty string. A frame with neither data nor
//! rel8ns hashes just its ib. Frames that belong to a timeline carry the
//! timeline origin's hash as a suffix on the gib, so the address itself
//! pins the frame to its timeline.
//!
//! JSON serialization is deterministic: rel8ns use ordered maps and
//! `serde_json` objects keep sorted keys.

use crate::error::SpaceError;
use crate::frame::addr::{
    self, is_primitive_gib, punctiliar_of, tjp_gib_of, validate_addr,
};
use crate::frame::{Frame, REL8N_TJP};
use crate::types::{Gib, GIB_TJP_DELIMITER};
use sha2::{Digest, Sha256};

/// Uppercase-hex SHA-256 of a text value.
pub fn hash_text(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode_upper(digest)
}

/// Compute a frame's own hash, ignoring any timeline-origin suffix.
pub fn compute_punctiliar_gib(frame: &Frame) -> Result<Gib, SpaceError> {
    let ib_hash = hash_text(&frame.ib);

    let has_data = !frame.data.is_empty();
    let has_rel8ns = frame.rel8ns.values().any(|addrs| !addrs.is_empty());

    if !has_data && !has_rel8ns {
        return Ok(hash_text(&ib_hash));
    }

    let rel8ns_hash = if has_rel8ns {
        let json = serde_json::to_string(&frame.rel8ns)
            .map_err(|e| SpaceError::Integrity(vec![format!("rel8ns serialization: {e}")]))?;
        hash_text(&json)
    } else {
        String::new()
    };
    let data_hash = if has_data {
        let json = serde_json::to_string(&frame.data)
            .map_err(|e| SpaceError::Integrity(vec![format!("data serialization: {e}")]))?;
        hash_text(&json)
    } else {
        String::new()
    };

    Ok(hash_text(&format!("{ib_hash}{rel8ns_hash}{data_hash}")))
}

/// Recompute the full gib for a frame, including the timeline-origin suffix
/// when the frame carries a `tjp` relation.
///
/// The origin frame of a timeline gets no suffix: its own hash *is* the
/// timeline-origin hash.
pub fn compute_gib(frame: &Frame) -> Result<Gib, SpaceError> {
    let punctiliar = compute_punctiliar_gib(frame)?;
    match frame.rel8n(REL8N_TJP).first() {
        Some(tjp_addr) => {
            let tjp_gib = punctiliar_of(addr::gib_of(tjp_addr)).to_string();
            Ok(format!("{punctiliar}{GIB_TJP_DELIMITER}{tjp_gib}"))
        }
        None => Ok(punctiliar),
    }
}

/// Validate a frame against itself: address character rules, recomputed
/// hash, and timeline-origin linkage.
///
/// Returns every problem found, empty when the frame is intact. The
/// no-integrity sentinel short-circuits the hash checks entirely.
pub fn validate_intrinsically(frame: &Frame) -> Result<Vec<String>, SpaceError> {
    let mut errors = validate_addr(&frame.addr());
    if !errors.is_empty() {
        return Ok(errors);
    }
    if is_primitive_gib(&frame.gib) {
        return Ok(errors);
    }

    let expected = compute_punctiliar_gib(frame)?;
    let actual = punctiliar_of(&frame.gib);
    if actual != expected {
        errors.push(format!(
            "gib mismatch for {}: expected {expected}, found {actual}",
            frame.ib
        ));
    }

    // the gib's timeline suffix must agree with the tjp relation
    let declared_tjp_gib = tjp_gib_of(&frame.gib);
    let related_tjp_gib = frame
        .rel8n(REL8N_TJP)
        .first()
        .map(|tjp_addr| punctiliar_of(addr::gib_of(tjp_addr)).to_string());
    match (declared_tjp_gib, related_tjp_gib) {
        (Some(declared), Some(related)) if declared != related => {
            errors.push(format!(
                "timeline-origin mismatch for {}: gib declares {declared}, tjp relation is {related}",
                frame.ib
            ));
        }
        (Some(declared), None) => {
            errors.push(format!(
                "gib of {} declares timeline origin {declared} but frame has no tjp relation",
                frame.ib
            ));
        }
        (None, Some(related)) => {
            errors.push(format!(
                "frame {} relates to timeline origin {related} but its gib carries no origin component",
                frame.ib
            ));
        }
        _ => {}
    }

    Ok(errors)
}
