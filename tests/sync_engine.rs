//! Integration tests for the sync reconciliation engine: the full
//! per-timeline decision table, status stream behavior, and merge
//! correctness.

mod common;

use common::*;
use std::collections::BTreeMap;
use weft::frame::{Frame, REL8N_DNA};
use weft::lock;
use weft::store::StoreAdapter;
use weft::sync::{start_saga, Participant, SyncRequest};

fn request(saga_id: &str) -> SyncRequest {
    SyncRequest {
        saga_id: saga_id.to_string(),
        participants: vec![Participant::src("space-local"), Participant::dest("space-sync")],
    }
}

/// A brand-new timeline is inserted whole.
#[tokio::test]
async fn test_insert_new_timeline() {
    let (_, store) = memory_store();
    let chain = chain("note insert", &[("text", "a"), ("text", "b")], true);

    let handle = start_saga(
        store.clone(),
        fast_config(),
        "sync-space".to_string(),
        request("saga-insert"),
        chain.all_frames(),
    )
    .await
    .unwrap();
    let (statuses, failure) = collect_events(handle).await;

    assert!(failure.is_none());
    assert_eq!(codes_of(&statuses), ["started", "inserted", "completed"]);

    // every member and dna frame is now in the store
    let addrs: Vec<String> = chain.all_frames().iter().map(Frame::addr).collect();
    let outcome = store.get_frames(&addrs).await.unwrap();
    assert!(outcome.not_found.is_empty());
}

/// Reconciling an already-identical timeline writes no timeline frames.
#[tokio::test]
async fn test_already_synced_is_no_op() {
    let (_, store) = memory_store();
    let chain = chain("note noop", &[("text", "a")], true);

    let first = start_saga(
        store.clone(),
        fast_config(),
        "sync-space".to_string(),
        request("saga-first"),
        chain.all_frames(),
    )
    .await
    .unwrap();
    collect_events(first).await;

    let second = start_saga(
        store.clone(),
        fast_config(),
        "sync-space".to_string(),
        request("saga-second"),
        chain.all_frames(),
    )
    .await
    .unwrap();
    let (statuses, failure) = collect_events(second).await;

    assert!(failure.is_none());
    assert_eq!(codes_of(&statuses), ["started", "already_synced", "completed"]);
    // the already_synced status carries no written addresses
    let synced = &statuses[1];
    assert!(synced.data.get("did_rx").is_none());
}

/// A store that holds a strict prefix of the local chain receives only
/// the newer frames.
#[tokio::test]
async fn test_update_pushes_only_newer() {
    let (backend, store) = memory_store();
    let mut chain = chain("note update", &[("text", "a")], true);

    let first = start_saga(
        store.clone(),
        fast_config(),
        "sync-space".to_string(),
        request("saga-prefix"),
        chain.all_frames(),
    )
    .await
    .unwrap();
    collect_events(first).await;

    // extend locally past what the store has
    chain.push_step("text", "b", true);
    chain.push_step("text", "c", true);

    let before = backend.get_calls().len();
    let second = start_saga(
        store.clone(),
        fast_config(),
        "sync-space".to_string(),
        request("saga-update"),
        chain.all_frames(),
    )
    .await
    .unwrap();
    let (statuses, failure) = collect_events(second).await;
    assert!(before > 0);

    assert!(failure.is_none());
    assert_eq!(codes_of(&statuses), ["started", "updated", "completed"]);

    // the store's latest is now the local latest
    let latest = store.latest_addrs(&chain.all_frames()).await.unwrap();
    let tjp_addr = chain.origin().addr();
    assert_eq!(latest[&tjp_addr], Some(chain.latest().addr()));
}

/// Merge correctness via DNA: local n=0,1,2 against a store that shares
/// n=0,1 but continued independently to n=3. The local post-divergence
/// transform replays on top of the store's latest, producing n=4.
#[tokio::test]
async fn test_merged_dna_replays_local_transforms() {
    let (_, store) = memory_store();

    // shared prefix: origin (n=0) + one mut8 (n=1)
    let mut shared = chain("note merge", &[("text", "shared")], true);

    // the store's side continues with two more steps (n=2, n=3)
    let mut store_side = Chain {
        members: shared.members.clone(),
        dna: shared.dna.clone(),
    };
    store_side.push_step("text", "store two", true);
    store_side.push_step("text", "store three", true);
    store.put_frames(&store_side.all_frames()).await.unwrap();

    // the local side diverges with its own step (n=2)
    shared.push_step("text", "local two", true);
    let local_latest = shared.latest().clone();

    let handle = start_saga(
        store.clone(),
        fast_config(),
        "sync-space".to_string(),
        request("saga-dna"),
        shared.all_frames(),
    )
    .await
    .unwrap();
    let (statuses, failure) = collect_events(handle).await;

    assert!(failure.is_none());
    assert_eq!(codes_of(&statuses), ["started", "merged_dna", "completed"]);

    // divergence was at dna index 1: only the local n=2 transform replayed
    let merged_status = &statuses[1];
    let merge_map: BTreeMap<String, String> =
        serde_json::from_value(merged_status.data["did_merge_map"].clone()).unwrap();
    let new_latest_addr = merge_map[&local_latest.addr()].clone();

    let fetched = store.get_frames(&[new_latest_addr.clone()]).await.unwrap();
    let new_latest = &fetched.frames[0];
    assert_eq!(new_latest.n(), Some(4));
    assert_eq!(new_latest.data["text"], serde_json::json!("local two"));
    assert_eq!(new_latest.tjp_addr(), Some(shared.origin().addr()));
    // the merged frame's dna is the store's plus the replayed local step
    assert_eq!(new_latest.rel8n(REL8N_DNA).len(), 4);

    // the store-only subtree was pulled down for the caller
    let did_tx: Vec<String> =
        serde_json::from_value(merged_status.data["did_tx"].clone()).unwrap();
    assert!(did_tx.contains(&store_side.latest().addr()));
}

/// With DNA unavailable, divergent timelines merge by state: store
/// dominant, sequence number past both sides.
#[tokio::test]
async fn test_merged_state_store_dominant() {
    let (_, store) = memory_store();

    let shared = chain("note stateful", &[], false);

    let mut store_side = Chain {
        members: shared.members.clone(),
        dna: vec![],
    };
    store_side.push_step("color", "store red", false);
    store.put_frames(&store_side.all_frames()).await.unwrap();

    let mut local = Chain {
        members: shared.members.clone(),
        dna: vec![],
    };
    local.push_step("color", "local blue", false);
    local.push_step("size", "local large", false);

    let handle = start_saga(
        store.clone(),
        fast_config(),
        "sync-space".to_string(),
        request("saga-state"),
        local.all_frames(),
    )
    .await
    .unwrap();
    let (statuses, failure) = collect_events(handle).await;

    assert!(failure.is_none());
    assert_eq!(codes_of(&statuses), ["started", "merged_state", "completed"]);

    let merge_map: BTreeMap<String, String> =
        serde_json::from_value(statuses[1].data["did_merge_map"].clone()).unwrap();
    let merged_addr = merge_map[&local.latest().addr()].clone();
    let merged = store
        .get_frames(&[merged_addr])
        .await
        .unwrap()
        .frames
        .remove(0);

    // n moves past both sides (local n=2, store n=1)
    assert_eq!(merged.n(), Some(3));
    // scalar conflict favors the store; local-only keys survive
    assert_eq!(merged.data["color"], serde_json::json!("store red"));
    assert_eq!(merged.data["size"], serde_json::json!("local large"));
}

/// A held lock aborts the timeline and the saga closes with a failure
/// instead of `completed`.
#[tokio::test]
async fn test_lock_timeout_aborts_saga() {
    let (_, store) = memory_store();
    let chain = chain("note locked", &[("text", "a")], true);

    // another instance holds the timeline's lock
    let scope = {
        let tjp_addr = chain.origin().addr();
        let gib = tjp_addr.split('^').nth(1).unwrap().to_string();
        gib
    };
    let mut lock_cfg = weft::config::LockConfig::default();
    lock_cfg.max_attempts = 1;
    lock::acquire(
        &*store,
        &"sync-space".to_string(),
        &scope,
        "someone-else",
        &lock_cfg,
    )
    .await
    .unwrap();

    let handle = start_saga(
        store.clone(),
        fast_config(),
        "sync-space".to_string(),
        request("saga-locked"),
        chain.all_frames(),
    )
    .await
    .unwrap();
    let (statuses, failure) = collect_events(handle).await;

    let failure = failure.expect("saga should fail on lock timeout");
    assert!(failure.contains("lock"), "unexpected failure: {failure}");
    assert!(!codes_of(&statuses).contains(&"completed".to_string()));
}

/// Divergent frames at the same sequence number are reported as a
/// warning, not a failure.
#[tokio::test]
async fn test_merge_ambiguity_warns() {
    let (_, store) = memory_store();

    let shared = chain("note ambiguous", &[], false);
    // two independent continuations at n=1 both live in the store
    let fork_a = mut8_step(shared.latest(), "text", "version a", false).new_frame;
    let fork_b = mut8_step(shared.latest(), "text", "version b", false).new_frame;
    store
        .put_frames(&[shared.origin().clone(), fork_a, fork_b])
        .await
        .unwrap();

    // the local side has its own continuation
    let mut local = Chain {
        members: shared.members.clone(),
        dna: vec![],
    };
    local.push_step("text", "version local", false);

    let handle = start_saga(
        store.clone(),
        fast_config(),
        "sync-space".to_string(),
        request("saga-ambiguous"),
        local.all_frames(),
    )
    .await
    .unwrap();
    let (statuses, failure) = collect_events(handle).await;

    assert!(failure.is_none(), "ambiguity must not hard-fail");
    assert_eq!(codes_of(&statuses), ["started", "merged_state", "completed"]);
    let warnings: Vec<String> =
        serde_json::from_value(statuses[1].data["warnings"].clone()).unwrap();
    assert!(warnings.iter().any(|w| w.contains("divergent")), "{warnings:?}");
}

/// Frames outside any timeline ride along with an insert.
#[tokio::test]
async fn test_stones_ride_along() {
    let (_, store) = memory_store();
    let chain = chain("note stones", &[("text", "a")], true);

    let mut stone = Frame::primitive("stone standalone");
    stone
        .data
        .insert("text".to_string(), serde_json::json!("free-floating"));
    stone.gib = weft::frame::compute_gib(&stone).unwrap();

    let mut frames = chain.all_frames();
    frames.push(stone.clone());

    let handle = start_saga(
        store.clone(),
        fast_config(),
        "sync-space".to_string(),
        request("saga-stones"),
        frames,
    )
    .await
    .unwrap();
    let (_, failure) = collect_events(handle).await;
    assert!(failure.is_none());

    let outcome = store.get_frames(&[stone.addr()]).await.unwrap();
    assert_eq!(outcome.frames.len(), 1);
}
