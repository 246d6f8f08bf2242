//! Watch/notify subsystem
//!
//! Subscription bookkeeping for timeline updates, stored as ordinary
//! sentinel-gib frames at deterministic addresses:
//!
//! - per space: `watch space <spaceId>^gib`, whose data maps each watched
//!   timeline to a pending update address or null;
//! - per timeline: `watch tjp <tjpGib> <tjpAddrHash>^gib`, whose data
//!   lists the spaces watching it. The address hash keeps records distinct
//!   even if two origins ever collided on gib alone.
//!
//! Records share the store's best-effort update discipline: an update
//! between a record's load and re-save is lost. Draining minimizes the
//! window by re-persisting the cleared record before returning.

use crate::error::SpaceError;
use crate::frame::{addr, Frame};
use crate::store::StoreAdapter;
use crate::types::{Addr, SpaceId, TjpAddr, ADDR_DELIMITER, GIB_SENTINEL};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const DATA_KEY_UPDATES: &str = "updates";
const DATA_KEY_TJP_ADDR: &str = "tjp_addr";
const DATA_KEY_SPACE_IDS: &str = "space_ids_watching";

/// Address of a space's watch record.
pub fn space_watch_addr(space_id: &str) -> Addr {
    format!("watch space {space_id}{ADDR_DELIMITER}{GIB_SENTINEL}")
}

/// Address of a timeline's watcher-list record.
pub fn tjp_watch_addr(tjp_addr: &str) -> Addr {
    let tjp_gib = addr::punctiliar_of(addr::gib_of(tjp_addr));
    let tjp_addr_hash = blake3::hash(tjp_addr.as_bytes()).to_hex().to_string();
    format!("watch tjp {tjp_gib} {tjp_addr_hash}{ADDR_DELIMITER}{GIB_SENTINEL}")
}

fn record_frame(record_addr: &Addr) -> Frame {
    Frame::primitive(addr::ib_of(record_addr).to_string())
}

fn updates_of(frame: &Frame) -> BTreeMap<TjpAddr, Option<Addr>> {
    frame
        .data
        .get(DATA_KEY_UPDATES)
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(k, v)| (k.clone(), v.as_str().map(String::from)))
                .collect()
        })
        .unwrap_or_default()
}

fn set_updates(frame: &mut Frame, updates: &BTreeMap<TjpAddr, Option<Addr>>) {
    let map: serde_json::Map<String, Value> = updates
        .iter()
        .map(|(k, v)| {
            (
                k.clone(),
                v.as_ref().map(|a| json!(a)).unwrap_or(Value::Null),
            )
        })
        .collect();
    frame.data.insert(DATA_KEY_UPDATES.to_string(), Value::Object(map));
}

fn watchers_of(frame: &Frame) -> Vec<SpaceId> {
    frame
        .data
        .get(DATA_KEY_SPACE_IDS)
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

async fn load_record(
    store: &dyn StoreAdapter,
    record_addr: &Addr,
) -> Result<Option<Frame>, SpaceError> {
    let outcome = store.get_frames(std::slice::from_ref(record_addr)).await?;
    Ok(outcome.frames.into_iter().next())
}

/// Subscribe a space to the given timelines.
///
/// Creates or extends the space's watch record (pending entries start
/// null) and appends the space to each timeline's watcher list.
pub async fn subscribe(
    store: &dyn StoreAdapter,
    space_id: &SpaceId,
    tjp_addrs: &[TjpAddr],
) -> Result<(), SpaceError> {
    if tjp_addrs.is_empty() {
        return Ok(());
    }

    let record_addr = space_watch_addr(space_id);
    let mut record = load_record(store, &record_addr)
        .await?
        .unwrap_or_else(|| record_frame(&record_addr));
    let mut updates = updates_of(&record);
    let mut changed = false;
    for tjp_addr in tjp_addrs {
        updates.entry(tjp_addr.clone()).or_insert_with(|| {
            changed = true;
            None
        });
    }

    let mut to_put: Vec<Frame> = Vec::new();
    if changed {
        set_updates(&mut record, &updates);
        to_put.push(record);
    }

    // each timeline's watcher list gains this space if absent
    for tjp_addr in tjp_addrs {
        let watcher_addr = tjp_watch_addr(tjp_addr);
        let mut watcher_record = load_record(store, &watcher_addr)
            .await?
            .unwrap_or_else(|| record_frame(&watcher_addr));
        let mut watchers = watchers_of(&watcher_record);
        if !watchers.iter().any(|id| id == space_id) {
            watchers.push(space_id.clone());
            watcher_record
                .data
                .insert(DATA_KEY_TJP_ADDR.to_string(), json!(tjp_addr));
            watcher_record
                .data
                .insert(DATA_KEY_SPACE_IDS.to_string(), json!(watchers));
            to_put.push(watcher_record);
        }
    }

    if !to_put.is_empty() {
        store.put_frames(&to_put).await?;
        debug!(space_id = %space_id, timelines = tjp_addrs.len(), "watch subscriptions saved");
    }
    Ok(())
}

/// Remove a space from the given timelines' watcher lists and drop the
/// corresponding pending entries from its watch record.
pub async fn unsubscribe(
    store: &dyn StoreAdapter,
    space_id: &SpaceId,
    tjp_addrs: &[TjpAddr],
) -> Result<(), SpaceError> {
    let mut to_put: Vec<Frame> = Vec::new();

    let record_addr = space_watch_addr(space_id);
    if let Some(mut record) = load_record(store, &record_addr).await? {
        let mut updates = updates_of(&record);
        let before = updates.len();
        updates.retain(|tjp_addr, _| !tjp_addrs.contains(tjp_addr));
        if updates.len() != before {
            set_updates(&mut record, &updates);
            to_put.push(record);
        }
    }

    for tjp_addr in tjp_addrs {
        let watcher_addr = tjp_watch_addr(tjp_addr);
        if let Some(mut watcher_record) = load_record(store, &watcher_addr).await? {
            let mut watchers = watchers_of(&watcher_record);
            let before = watchers.len();
            watchers.retain(|id| id != space_id);
            if watchers.len() != before {
                watcher_record
                    .data
                    .insert(DATA_KEY_SPACE_IDS.to_string(), json!(watchers));
                to_put.push(watcher_record);
            }
        }
    }

    if !to_put.is_empty() {
        store.put_frames(&to_put).await?;
    }
    Ok(())
}

/// Stamp every space watching the updated timelines — except the
/// originating space — with the new latest address.
///
/// Best effort: a failure here is logged and swallowed, since the sync
/// itself has already succeeded.
pub async fn notify(
    store: &dyn StoreAdapter,
    src_space_id: &SpaceId,
    updates: &BTreeMap<TjpAddr, Addr>,
) {
    if updates.is_empty() {
        return;
    }
    if let Err(err) = notify_inner(store, src_space_id, updates).await {
        warn!(%err, "watch notification failed");
    }
}

async fn notify_inner(
    store: &dyn StoreAdapter,
    src_space_id: &SpaceId,
    updates: &BTreeMap<TjpAddr, Addr>,
) -> Result<(), SpaceError> {
    // collate spaceId -> updated timelines so each space record is
    // rewritten exactly once
    let mut per_space: BTreeMap<SpaceId, Vec<TjpAddr>> = BTreeMap::new();
    for tjp_addr in updates.keys() {
        let watcher_addr = tjp_watch_addr(tjp_addr);
        let Some(watcher_record) = load_record(store, &watcher_addr).await? else {
            continue;
        };
        for watcher in watchers_of(&watcher_record) {
            if &watcher != src_space_id {
                per_space.entry(watcher).or_default().push(tjp_addr.clone());
            }
        }
    }
    if per_space.is_empty() {
        return Ok(());
    }

    let mut to_put: Vec<Frame> = Vec::new();
    for (space_id, tjp_addrs) in per_space {
        let record_addr = space_watch_addr(&space_id);
        let mut record = load_record(store, &record_addr)
            .await?
            .unwrap_or_else(|| record_frame(&record_addr));
        let mut pending = updates_of(&record);
        for tjp_addr in tjp_addrs {
            let new_latest = updates[&tjp_addr].clone();
            pending.insert(tjp_addr, Some(new_latest));
        }
        set_updates(&mut record, &pending);
        to_put.push(record);
    }
    store.put_frames(&to_put).await?;
    debug!(spaces = to_put.len(), "watch records stamped");
    Ok(())
}

/// Drain a space's pending updates.
///
/// Reads the record, clears every entry to null and re-persists the
/// cleared record immediately — minimizing the race window between read
/// and clear — then returns the non-null entries.
pub async fn drain(
    store: &dyn StoreAdapter,
    space_id: &SpaceId,
) -> Result<BTreeMap<TjpAddr, Addr>, SpaceError> {
    let record_addr = space_watch_addr(space_id);
    let Some(mut record) = load_record(store, &record_addr).await? else {
        return Ok(BTreeMap::new());
    };
    let pending = updates_of(&record);
    if pending.values().all(Option::is_none) {
        return Ok(BTreeMap::new());
    }

    let cleared: BTreeMap<TjpAddr, Option<Addr>> =
        pending.keys().map(|k| (k.clone(), None)).collect();
    set_updates(&mut record, &cleared);
    store.put_frames(&[record]).await?;

    Ok(pending
        .into_iter()
        .filter_map(|(tjp_addr, update)| update.map(|u| (tjp_addr, u)))
        .collect())
}
