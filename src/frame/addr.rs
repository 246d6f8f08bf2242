//! Address formatting, parsing and validation.
//!
//! An address is `<ib><delimiter><gib>`. The ib is free text that must not
//! contain the delimiter; the gib is either the no-integrity sentinel or an
//! uppercase-hex hash (32 or 64 chars), optionally suffixed with a
//! timeline-origin hash component via a secondary delimiter.

use crate::error::SpaceError;
use crate::types::{
    Addr, Gib, Ib, ADDR_DELIMITER, GIB_SENTINEL, GIB_TJP_DELIMITER,
};

/// Build an address from its parts.
pub fn format_addr(ib: &str, gib: &str) -> Addr {
    format!("{ib}{ADDR_DELIMITER}{gib}")
}

/// Split an address into `(ib, gib)`.
///
/// Only the first delimiter splits; the gib may not contain the delimiter,
/// so everything after the first occurrence is the gib.
pub fn parse_addr(addr: &str) -> Result<(Ib, Gib), SpaceError> {
    match addr.split_once(ADDR_DELIMITER) {
        Some((ib, gib)) if !ib.is_empty() && !gib.is_empty() => {
            Ok((ib.to_string(), gib.to_string()))
        }
        _ => Err(SpaceError::validation(format!(
            "address must be `ib{ADDR_DELIMITER}gib`: {addr}"
        ))),
    }
}

/// The gib part of an address, or the whole address if it has no delimiter.
pub fn gib_of(addr: &str) -> &str {
    addr.split_once(ADDR_DELIMITER)
        .map(|(_, gib)| gib)
        .unwrap_or(addr)
}

/// The ib part of an address.
pub fn ib_of(addr: &str) -> &str {
    addr.split_once(ADDR_DELIMITER)
        .map(|(ib, _)| ib)
        .unwrap_or(addr)
}

/// True when the gib is the no-integrity sentinel.
pub fn is_primitive_gib(gib: &str) -> bool {
    gib == GIB_SENTINEL
}

/// True when the address points at a primitive frame.
pub fn is_primitive_addr(addr: &str) -> bool {
    is_primitive_gib(gib_of(addr))
}

/// The frame's own hash, without any timeline-origin suffix.
pub fn punctiliar_of(gib: &str) -> &str {
    gib.split_once(GIB_TJP_DELIMITER)
        .map(|(own, _)| own)
        .unwrap_or(gib)
}

/// The timeline-origin hash component of a gib, if present.
pub fn tjp_gib_of(gib: &str) -> Option<&str> {
    gib.split_once(GIB_TJP_DELIMITER).map(|(_, tjp)| tjp)
}

fn is_hash_component(s: &str) -> bool {
    (s.len() == 32 || s.len() == 64) && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Validate an ib. Returns the (possibly empty) list of problems found.
pub fn validate_ib(ib: &str) -> Vec<String> {
    let mut errors = Vec::new();
    if ib.is_empty() {
        errors.push("ib required".to_string());
        return errors;
    }
    if ib.contains(ADDR_DELIMITER) {
        errors.push(format!("ib contains address delimiter ({ADDR_DELIMITER}): {ib}"));
    }
    errors
}

/// Validate a gib. Returns the (possibly empty) list of problems found.
///
/// The sentinel is always valid. Otherwise both the hash and, when present,
/// the timeline-origin suffix must be 32- or 64-char hex strings.
pub fn validate_gib(gib: &str) -> Vec<String> {
    let mut errors = Vec::new();
    if gib.is_empty() {
        errors.push("gib required".to_string());
        return errors;
    }
    if is_primitive_gib(gib) {
        return errors;
    }
    if gib.contains(ADDR_DELIMITER) {
        errors.push(format!("gib contains address delimiter ({ADDR_DELIMITER}): {gib}"));
        return errors;
    }
    if !is_hash_component(punctiliar_of(gib)) {
        errors.push(format!("gib hash is neither a 32- nor 64-char hex string: {gib}"));
    }
    if let Some(tjp_gib) = tjp_gib_of(gib) {
        if !is_hash_component(punctiliar_of(tjp_gib)) {
            errors.push(format!("gib timeline-origin component is not a hash: {gib}"));
        }
    }
    errors
}

/// Validate a whole address. Returns the (possibly empty) list of problems.
pub fn validate_addr(addr: &str) -> Vec<String> {
    let mut errors = Vec::new();
    if addr.is_empty() {
        errors.push("address required".to_string());
        return errors;
    }
    if !addr.contains(ADDR_DELIMITER) {
        errors.push(format!("no delimiter ({ADDR_DELIMITER}) found in address: {addr}"));
        return errors;
    }
    if addr.starts_with(ADDR_DELIMITER) {
        errors.push(format!("address starts with delimiter: {addr}"));
        return errors;
    }
    if let Some((ib, gib)) = addr.split_once(ADDR_DELIMITER) {
        errors.extend(validate_ib(ib));
        errors.extend(validate_gib(gib));
    }
    errors
}
