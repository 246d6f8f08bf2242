//! Property tests: address round-trips and hash determinism.

use proptest::prelude::*;
use weft::frame::addr::{format_addr, parse_addr, validate_addr};
use weft::frame::{compute_gib, Frame};

/// ib strings free of the address delimiter.
fn arb_ib() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 _.-]{1,40}".prop_filter("no delimiter", |s| !s.contains('^'))
}

/// Uppercase 64-char hex gibs.
fn arb_gib() -> impl Strategy<Value = String> {
    "[0-9A-F]{64}"
}

/// Small JSON-ish data maps.
fn arb_data() -> impl Strategy<Value = Vec<(String, String)>> {
    proptest::collection::vec(("[a-z_]{1,10}", "[a-zA-Z0-9 ]{0,20}"), 0..5)
}

fn frame_with(ib: &str, data: &[(String, String)]) -> Frame {
    let mut frame = Frame::primitive(ib);
    for (key, value) in data {
        frame
            .data
            .insert(key.clone(), serde_json::json!(value));
    }
    frame.gib = compute_gib(&frame).unwrap();
    frame
}

proptest! {
    /// parse(format(ib, gib)) == (ib, gib) for all delimiter-free parts.
    #[test]
    fn prop_addr_round_trip(ib in arb_ib(), gib in arb_gib()) {
        let addr = format_addr(&ib, &gib);
        let (parsed_ib, parsed_gib) = parse_addr(&addr).unwrap();
        prop_assert_eq!(parsed_ib, ib);
        prop_assert_eq!(parsed_gib, gib);
    }

    /// Formatted addresses from valid parts validate cleanly.
    #[test]
    fn prop_formatted_addrs_validate(ib in arb_ib(), gib in arb_gib()) {
        let addr = format_addr(&ib, &gib);
        prop_assert!(validate_addr(&addr).is_empty());
    }

    /// Hashing is deterministic: same fields, same gib.
    #[test]
    fn prop_hash_deterministic(ib in arb_ib(), data in arb_data()) {
        let first = frame_with(&ib, &data);
        let second = frame_with(&ib, &data);
        prop_assert_eq!(first.gib, second.gib);
    }

    /// The gib covers the data: any extra key changes it.
    #[test]
    fn prop_hash_covers_data(ib in arb_ib(), data in arb_data()) {
        let frame = frame_with(&ib, &data);
        let mut tampered = frame.clone();
        tampered
            .data
            .insert("tamper_evidence".to_string(), serde_json::json!(true));
        tampered.gib = compute_gib(&tampered).unwrap();
        prop_assert_ne!(frame.gib, tampered.gib);
    }

    /// Non-sentinel gibs are 64 uppercase hex chars.
    #[test]
    fn prop_gib_shape(ib in arb_ib(), data in arb_data()) {
        let frame = frame_with(&ib, &data);
        prop_assert_eq!(frame.gib.len(), 64);
        prop_assert!(frame.gib.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
