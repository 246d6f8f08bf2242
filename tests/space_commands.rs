//! Integration tests for the command substrate: validation, routing, and
//! the watch/sync modifiers end to end through a space.

mod common;

use common::*;
use weft::frame::{compute_gib, Frame};
use weft::sync::{Participant, SyncRequest};
use weft::witness::{Cmd, CmdModifier, CommandArg, Space, Witness};

fn space() -> Space {
    let (_, store) = memory_store();
    Space::new("test-sync", store, fast_config())
}

fn request(saga_id: &str, src: &str) -> SyncRequest {
    SyncRequest {
        saga_id: saga_id.to_string(),
        participants: vec![Participant::src(src), Participant::dest("the-sync-space")],
    }
}

#[tokio::test]
async fn test_get_requires_addrs() {
    let space = space();
    let result = space.witness(CommandArg::new(Cmd::Get)).await;
    assert!(!result.success);
    assert!(result.errors.iter().any(|e| e.contains("addrs required")));
}

#[tokio::test]
async fn test_put_requires_frames() {
    let space = space();
    let result = space.witness(CommandArg::new(Cmd::Put)).await;
    assert!(!result.success);
    assert!(result.errors.iter().any(|e| e.contains("frames required")));
}

#[tokio::test]
async fn test_put_rejects_tampered_frame() {
    let space = space();
    let mut frame = Frame::primitive("note tampered");
    frame.data.insert("text".to_string(), serde_json::json!("v1"));
    frame.gib = compute_gib(&frame).unwrap();
    frame.data.insert("text".to_string(), serde_json::json!("v2"));

    let result = space
        .witness(CommandArg::new(Cmd::Put).with_frames(vec![frame]))
        .await;
    assert!(!result.success);
    assert!(result.errors.iter().any(|e| e.contains("gib mismatch")));
}

#[tokio::test]
async fn test_put_rejects_addr_frame_mismatch() {
    let space = space();
    let mut frame = Frame::primitive("note matched");
    frame.data.insert("text".to_string(), serde_json::json!("v"));
    frame.gib = compute_gib(&frame).unwrap();

    let result = space
        .witness(
            CommandArg::new(Cmd::Put)
                .with_frames(vec![frame])
                .with_addrs(vec!["someone else^ABCD".to_string()]),
        )
        .await;
    assert!(!result.success);
    assert!(result
        .errors
        .iter()
        .any(|e| e.contains("not among the given addrs")));
}

#[tokio::test]
async fn test_put_get_delete_round_trip() {
    let space = space();
    let timeline = chain("note cycle", &[("text", "hello")], false);
    let frames = timeline.all_frames();

    let put = space
        .witness(CommandArg::new(Cmd::Put).with_frames(frames.clone()))
        .await;
    assert!(put.success, "{:?}", put.errors);
    assert_eq!(put.addrs.len(), frames.len());

    let addrs: Vec<String> = frames.iter().map(Frame::addr).collect();
    let get = space
        .witness(CommandArg::new(Cmd::Get).with_addrs(addrs.clone()))
        .await;
    assert!(get.success);
    assert_eq!(get.frames.len(), frames.len());

    let delete = space
        .witness(CommandArg::new(Cmd::Delete).with_addrs(addrs.clone()))
        .await;
    assert!(delete.success);
    assert_eq!(delete.addrs.len(), frames.len());

    let gone = space
        .witness(CommandArg::new(Cmd::Get).with_addrs(addrs))
        .await;
    assert!(gone.frames.is_empty());
    assert_eq!(gone.addrs_not_found.len(), frames.len());
}

#[tokio::test]
async fn test_existence_checks() {
    let space = space();
    let timeline = chain("note exists", &[("text", "hello")], false);
    let present = timeline.latest().clone();
    let absent_addr = "note never^1234123412341234123412341234123412341234123412341234123412341234"
        .to_string();

    space
        .witness(CommandArg::new(Cmd::Put).with_frames(timeline.all_frames()))
        .await;

    let can_get = space
        .witness(
            CommandArg::new(Cmd::Get)
                .with_modifier(CmdModifier::Can)
                .with_addrs(vec![present.addr(), absent_addr.clone()]),
        )
        .await;
    assert!(can_get.success);
    assert_eq!(can_get.addrs, vec![present.addr()]);
    assert_eq!(can_get.addrs_not_found, vec![absent_addr.clone()]);

    let can_put = space
        .witness(
            CommandArg::new(Cmd::Put)
                .with_modifier(CmdModifier::Can)
                .with_frames(timeline.all_frames()),
        )
        .await;
    assert!(can_put.success);
    assert!(can_put.addrs_already_present.contains(&present.addr()));
}

#[tokio::test]
async fn test_get_latest_addrs() {
    let space = space();
    let mut timeline = chain("note latest", &[("text", "a")], false);
    space
        .witness(CommandArg::new(Cmd::Put).with_frames(timeline.all_frames()))
        .await;

    // locally stale view: ask for latest with only the origin in hand
    let stale = vec![timeline.origin().clone()];
    timeline.push_step("text", "b", false);

    let result = space
        .witness(
            CommandArg::new(Cmd::Get)
                .with_modifier(CmdModifier::Latest)
                .with_modifier(CmdModifier::Addrs)
                .with_frames(stale),
        )
        .await;
    assert!(result.success);
    let latest = result.latest_addr_map[&timeline.origin().addr()]
        .clone()
        .unwrap();
    // the store's latest is the n=1 frame; the local n=2 step never synced
    assert_eq!(latest, timeline.members[1].addr());
}

#[tokio::test]
async fn test_get_tjp_addrs() {
    let space = space();
    let timeline = chain("note origins", &[("text", "a"), ("text", "b")], false);
    space
        .witness(CommandArg::new(Cmd::Put).with_frames(timeline.all_frames()))
        .await;

    let result = space
        .witness(
            CommandArg::new(Cmd::Get)
                .with_modifier(CmdModifier::Tjps)
                .with_modifier(CmdModifier::Addrs)
                .with_addrs(vec![timeline.latest().addr()]),
        )
        .await;
    assert!(result.success);
    assert_eq!(result.addrs, vec![timeline.origin().addr()]);
}

#[tokio::test]
async fn test_list_addrs() {
    let space = space();
    let timeline = chain("note listed", &[("text", "a")], false);
    space
        .witness(CommandArg::new(Cmd::Put).with_frames(timeline.all_frames()))
        .await;

    let result = space
        .witness(CommandArg::new(Cmd::Get).with_modifier(CmdModifier::Addrs))
        .await;
    assert!(result.success);
    for frame in timeline.all_frames() {
        assert!(result.addrs.contains(&frame.addr()));
    }
}

/// The full `put … sync watch` flow: space A subscribes while syncing,
/// space B updates the timeline, A's next interaction drains the stamp.
#[tokio::test]
async fn test_put_sync_watch_flow() {
    let space = space();
    let mut timeline = chain("note shared", &[("text", "v1")], true);

    // A syncs and watches
    let a_sync = space
        .witness(
            CommandArg::new(Cmd::Put)
                .with_modifier(CmdModifier::Sync)
                .with_modifier(CmdModifier::Watch)
                .with_frames(timeline.all_frames())
                .with_src_space("device-a")
                .with_sync(request("saga-a", "device-a")),
        )
        .await;
    assert!(a_sync.success, "{:?}", a_sync.errors);
    let (statuses, failure) = collect_events(a_sync.saga.unwrap()).await;
    assert!(failure.is_none());
    assert_eq!(codes_of(&statuses), ["started", "inserted", "completed"]);

    // B extends the timeline and syncs it
    timeline.push_step("text", "v2", true);
    let b_sync = space
        .witness(
            CommandArg::new(Cmd::Put)
                .with_modifier(CmdModifier::Sync)
                .with_frames(timeline.all_frames())
                .with_src_space("device-b")
                .with_sync(request("saga-b", "device-b")),
        )
        .await;
    assert!(b_sync.success, "{:?}", b_sync.errors);
    let (statuses, failure) = collect_events(b_sync.saga.unwrap()).await;
    assert!(failure.is_none());
    assert_eq!(codes_of(&statuses), ["started", "updated", "completed"]);

    // A's next interaction receives the stamped update
    let a_drain = space
        .witness(
            CommandArg::new(Cmd::Get)
                .with_modifier(CmdModifier::Watch)
                .with_src_space("device-a"),
        )
        .await;
    assert!(a_drain.success);
    assert_eq!(
        a_drain.watch_update_map.get(&timeline.origin().addr()),
        Some(&timeline.latest().addr())
    );

    // drained means cleared
    let a_again = space
        .witness(
            CommandArg::new(Cmd::Get)
                .with_modifier(CmdModifier::Watch)
                .with_src_space("device-a"),
        )
        .await;
    assert!(a_again.watch_update_map.is_empty());
}

#[tokio::test]
async fn test_put_sync_requires_request() {
    let space = space();
    let timeline = chain("note reqless", &[("text", "a")], false);
    let result = space
        .witness(
            CommandArg::new(Cmd::Put)
                .with_modifier(CmdModifier::Sync)
                .with_frames(timeline.all_frames()),
        )
        .await;
    assert!(!result.success);
    assert!(result
        .errors
        .iter()
        .any(|e| e.contains("sync request required")));
}

#[tokio::test]
async fn test_delete_unwatch() {
    let space = space();
    let timeline = chain("note unwatched", &[("text", "a")], false);
    let tjp_addr = timeline.origin().addr();

    weft::watch::subscribe(&*space.store(), &"device-a".to_string(), &[tjp_addr.clone()])
        .await
        .unwrap();

    let result = space
        .witness(
            CommandArg::new(Cmd::Delete)
                .with_modifier(CmdModifier::Unwatch)
                .with_addrs(vec![tjp_addr.clone()])
                .with_src_space("device-a"),
        )
        .await;
    assert!(result.success, "{:?}", result.errors);

    // a later update no longer stamps device-a
    let updates = std::collections::BTreeMap::from([(
        tjp_addr,
        "note unwatched^EEEE0000EEEE0000EEEE0000EEEE0000".to_string(),
    )]);
    weft::watch::notify(&*space.store(), &"device-b".to_string(), &updates).await;
    let drained = weft::watch::drain(&*space.store(), &"device-a".to_string())
        .await
        .unwrap();
    assert!(drained.is_empty());
}
