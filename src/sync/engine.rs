//! Saga execution: per-timeline decisions, writes, status publication and
//! watch notification.
//!
//! `start_saga` persists and publishes the `started` status, then spawns
//! the actual work and returns immediately with a live handle. Within one
//! timeline the steps are strictly sequential (lock → reconcile → write →
//! publish → notify → unlock); across timelines no order is promised. Any
//! unrecoverable error aborts the remaining timelines and closes the
//! stream with a failure event instead of `completed`.

use crate::config::WeftConfig;
use crate::error::SpaceError;
use crate::frame::{addr, split_timelines, Frame};
use crate::graph::{resolve_closure, ClosureOpts};
use crate::lock;
use crate::store::StoreAdapter;
use crate::sync::merge;
use crate::sync::status::{self, Accounting, StatusCode};
use crate::sync::{SagaEvent, SagaHandle, SyncRequest};
use crate::types::{Addr, SagaId, SpaceId, TjpAddr};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Outcome of reconciling one timeline.
struct TimelineOutcome {
    code: StatusCode,
    /// Frames to write to the store.
    to_store: Vec<Frame>,
    /// Frames created by merging (also written).
    created: Vec<Frame>,
    /// Store-only frames pulled down for the caller.
    pulled: Vec<Frame>,
    /// Old local latest address → new latest address.
    merge_map: BTreeMap<Addr, Addr>,
    /// New latest address to stamp onto watchers, if the timeline moved.
    new_latest: Option<Addr>,
    warnings: Vec<String>,
}

/// Start a reconciliation saga for `frames` against the sync space served
/// by `store`.
///
/// Returns once the `started` status is persisted and published; the rest
/// of the saga runs in a spawned task and reports through the handle's
/// event stream.
pub async fn start_saga(
    store: Arc<dyn StoreAdapter>,
    config: Arc<WeftConfig>,
    sync_space_id: SpaceId,
    request: SyncRequest,
    frames: Vec<Frame>,
) -> Result<SagaHandle, SpaceError> {
    request.validate()?;
    if frames.is_empty() {
        return Err(SpaceError::validation("sync requires at least one frame"));
    }
    let src_space_id = request.src_space_id()?.clone();
    let addrs: Vec<Addr> = frames.iter().map(Frame::addr).collect();

    let (status, status_graph) =
        status::start_status(&request.saga_id, &request.participants, &addrs)?;
    let status_tjp_addr = status.addr();

    let (tx, rx) = mpsc::unbounded_channel();
    store.put_frames(&status_graph).await?;
    let _ = tx.send(SagaEvent::Status(status.clone()));
    info!(saga_id = %request.saga_id, frames = frames.len(), "sync saga started");

    let saga_id = request.saga_id.clone();
    tokio::spawn(run_saga(
        store,
        config,
        sync_space_id,
        src_space_id,
        saga_id,
        frames,
        status,
        tx,
    ));

    Ok(SagaHandle {
        saga_id: request.saga_id,
        status_tjp_addr,
        events: rx,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_saga(
    store: Arc<dyn StoreAdapter>,
    config: Arc<WeftConfig>,
    sync_space_id: SpaceId,
    src_space_id: SpaceId,
    saga_id: SagaId,
    frames: Vec<Frame>,
    status: Frame,
    tx: mpsc::UnboundedSender<SagaEvent>,
) {
    match run_saga_inner(
        &*store,
        &config,
        &sync_space_id,
        &src_space_id,
        &saga_id,
        frames,
        status,
        &tx,
    )
    .await
    {
        Ok(()) => {
            info!(%saga_id, "sync saga completed");
        }
        Err(err) => {
            error!(%saga_id, %err, "sync saga failed");
            let _ = tx.send(SagaEvent::Failed(err.to_string()));
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_saga_inner(
    store: &dyn StoreAdapter,
    config: &WeftConfig,
    sync_space_id: &SpaceId,
    src_space_id: &SpaceId,
    saga_id: &SagaId,
    frames: Vec<Frame>,
    mut status: Frame,
    tx: &mpsc::UnboundedSender<SagaEvent>,
) -> Result<(), SpaceError> {
    let latest_map = store.latest_addrs(&frames).await?;
    let split = split_timelines(&frames);
    let all_local: BTreeMap<Addr, Frame> =
        frames.iter().map(|f| (f.addr(), f.clone())).collect();

    // addresses the latest map proves present; writes skip them
    let known_present: BTreeSet<Addr> =
        latest_map.values().flatten().cloned().collect();

    for (tjp_addr, members) in &split.timelines {
        let scope = addr::punctiliar_of(addr::gib_of(tjp_addr)).to_string();
        let guard = lock::acquire(store, sync_space_id, &scope, src_space_id, &config.lock).await?;

        let result = reconcile_timeline(
            store,
            config,
            tjp_addr,
            members,
            &split.without_tjp,
            latest_map.get(tjp_addr).cloned().flatten(),
            &all_local,
        )
        .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                lock::release(store, &guard).await;
                return Err(err);
            }
        };

        let step = execute_timeline(
            store,
            src_space_id,
            saga_id,
            tjp_addr,
            outcome,
            &known_present,
            &mut status,
            tx,
        )
        .await;
        lock::release(store, &guard).await;
        step?;
    }

    // terminal status
    status = status::advance(&status, saga_id, StatusCode::Completed, &Accounting::default())?;
    store.put_frames(std::slice::from_ref(&status)).await?;
    let _ = tx.send(SagaEvent::Status(status));
    Ok(())
}

/// Write a timeline's outcome, publish its status frame and stamp
/// watchers. Runs under the timeline's lock.
#[allow(clippy::too_many_arguments)]
async fn execute_timeline(
    store: &dyn StoreAdapter,
    src_space_id: &SpaceId,
    saga_id: &SagaId,
    tjp_addr: &TjpAddr,
    outcome: TimelineOutcome,
    known_present: &BTreeSet<Addr>,
    status: &mut Frame,
    tx: &mpsc::UnboundedSender<SagaEvent>,
) -> Result<(), SpaceError> {
    let to_store: Vec<Frame> = outcome
        .to_store
        .into_iter()
        .filter(|f| !known_present.contains(&f.addr()))
        .collect();

    let mut accounting = Accounting {
        did_tx: outcome.pulled.iter().map(Frame::addr).collect(),
        did_create: outcome.created.iter().map(Frame::addr).collect(),
        did_merge_map: outcome.merge_map,
        warnings: outcome.warnings,
        ..Default::default()
    };

    if !to_store.is_empty() {
        let put = store.put_frames(&to_store).await?;
        accounting.did_rx = put.stored;
    }

    debug!(
        timeline = %tjp_addr,
        code = outcome.code.as_str(),
        wrote = accounting.did_rx.len(),
        "timeline reconciled"
    );

    *status = status::advance(status, saga_id, outcome.code, &accounting)?;
    store.put_frames(std::slice::from_ref(status)).await?;
    let _ = tx.send(SagaEvent::Status(status.clone()));

    if let Some(new_latest) = outcome.new_latest {
        let updates = BTreeMap::from([(tjp_addr.clone(), new_latest)]);
        crate::watch::notify(store, src_space_id, &updates).await;
    }
    Ok(())
}

/// Decide how one timeline reconciles against the store.
async fn reconcile_timeline(
    store: &dyn StoreAdapter,
    config: &WeftConfig,
    tjp_addr: &TjpAddr,
    members: &[Frame],
    stones: &[Frame],
    latest_store: Option<Addr>,
    all_local: &BTreeMap<Addr, Frame>,
) -> Result<TimelineOutcome, SpaceError> {
    let member_addrs: Vec<Addr> = members.iter().map(Frame::addr).collect();
    let local_latest = members
        .last()
        .ok_or_else(|| SpaceError::validation(format!("empty timeline group for {tjp_addr}")))?;
    let local_latest_addr = local_latest.addr();

    let Some(store_latest_addr) = latest_store else {
        // the timeline does not exist in the store yet
        debug!(timeline = %tjp_addr, "timeline absent from store; inserting");
        let mut to_store = members.to_vec();
        to_store.extend(stones.iter().cloned());
        return Ok(TimelineOutcome {
            code: StatusCode::Inserted,
            to_store,
            created: vec![],
            pulled: vec![],
            merge_map: BTreeMap::new(),
            new_latest: Some(local_latest_addr),
            warnings: vec![],
        });
    };

    if store_latest_addr == local_latest_addr {
        return Ok(TimelineOutcome {
            code: StatusCode::AlreadySynced,
            to_store: vec![],
            created: vec![],
            pulled: vec![],
            merge_map: BTreeMap::new(),
            new_latest: None,
            warnings: vec![],
        });
    }

    if let Some(index) = member_addrs.iter().position(|a| a == &store_latest_addr) {
        // the store's latest is an ancestor of ours: push what it lacks
        debug!(timeline = %tjp_addr, "store behind local; pushing newer frames");
        let mut to_store: Vec<Frame> = members[index + 1..].to_vec();
        to_store.extend(stones.iter().cloned());
        return Ok(TimelineOutcome {
            code: StatusCode::Updated,
            to_store,
            created: vec![],
            pulled: vec![],
            merge_map: BTreeMap::new(),
            new_latest: Some(local_latest_addr),
            warnings: vec![],
        });
    }

    // the store has frames we do not: merge
    merge_timeline(
        store,
        config,
        tjp_addr,
        local_latest,
        &store_latest_addr,
        all_local,
    )
    .await
}

async fn merge_timeline(
    store: &dyn StoreAdapter,
    config: &WeftConfig,
    tjp_addr: &TjpAddr,
    local_latest: &Frame,
    store_latest_addr: &Addr,
    all_local: &BTreeMap<Addr, Frame>,
) -> Result<TimelineOutcome, SpaceError> {
    let fetched = store
        .get_frames(std::slice::from_ref(store_latest_addr))
        .await?;
    let store_latest = fetched.frames.into_iter().next().ok_or_else(|| {
        SpaceError::NotFound {
            addrs: vec![store_latest_addr.clone()],
        }
    })?;

    let mut warnings = detect_merge_ambiguity(store, tjp_addr, &store_latest).await;

    if local_latest.has_dna() && store_latest.has_dna() {
        // replay our post-divergence transforms onto the store's latest
        let local_dna = local_latest.rel8n(crate::frame::REL8N_DNA);
        let store_dna = store_latest.rel8n(crate::frame::REL8N_DNA);
        let divergence = merge::first_divergence(local_dna, store_dna);
        let to_apply: Vec<Addr> = local_dna[divergence..].to_vec();
        debug!(
            timeline = %tjp_addr,
            divergence,
            replaying = to_apply.len(),
            "merging via dna"
        );

        // pull the store-only side of the timeline so the caller can
        // rebase: past, dna, and anything a store-only rel8 referenced
        let closure_opts = ClosureOpts {
            live: true,
            skip_addrs: all_local.keys().cloned().collect(),
            max_retries: config.graph.max_retries,
            retry_delay: Duration::from_millis(config.graph.retry_delay_ms),
            ..Default::default()
        };
        let pulled_map = resolve_closure(
            vec![store_latest.clone()],
            vec![],
            &closure_opts,
            store,
        )
        .await?;
        let pulled: Vec<Frame> = pulled_map.into_values().collect();

        let replayed = merge::replay_chain(&store_latest, &to_apply, all_local)?;
        let new_latest_addr = replayed.latest.addr();
        if to_apply.is_empty() {
            warn!(timeline = %tjp_addr, "dna merge had no local transforms to replay");
        }
        return Ok(TimelineOutcome {
            code: StatusCode::MergedDna,
            to_store: replayed.created.clone(),
            created: replayed.created,
            pulled,
            merge_map: BTreeMap::from([(local_latest.addr(), new_latest_addr.clone())]),
            new_latest: Some(new_latest_addr),
            warnings,
        });
    }

    // dna unavailable on at least one side: naive state merge
    debug!(timeline = %tjp_addr, "merging via state");
    if local_latest.has_dna() != store_latest.has_dna() {
        warnings.push(format!(
            "timeline {tjp_addr}: dna present on only one side; falling back to state merge"
        ));
    }
    let merged = merge::merge_state(local_latest, &store_latest)?;
    let merged_addr = merged.addr();
    Ok(TimelineOutcome {
        code: StatusCode::MergedState,
        to_store: vec![merged.clone()],
        created: vec![merged],
        pulled: vec![store_latest],
        merge_map: BTreeMap::from([(local_latest.addr(), merged_addr.clone())]),
        new_latest: Some(merged_addr),
        warnings,
    })
}

/// Multiple divergent frames at one sequence number are detected and
/// reported as a warning only; reconciliation proceeds against the frame
/// the store reports as latest.
async fn detect_merge_ambiguity(
    store: &dyn StoreAdapter,
    tjp_addr: &TjpAddr,
    store_latest: &Frame,
) -> Vec<String> {
    let root = addr::punctiliar_of(addr::gib_of(tjp_addr)).to_string();
    let n_least = store_latest.n().unwrap_or(0);
    match store.newer_frames(&root, n_least).await {
        Ok(frames) => {
            let mut per_n: BTreeMap<u64, usize> = BTreeMap::new();
            for frame in &frames {
                *per_n.entry(frame.n().unwrap_or(0)).or_default() += 1;
            }
            per_n
                .into_iter()
                .filter(|(_, count)| *count > 1)
                .map(|(n, count)| {
                    format!(
                        "timeline {tjp_addr}: {count} divergent frames observed at sequence {n}; \
                         proceeding against the store's reported latest"
                    )
                })
                .collect()
        }
        Err(err) => {
            warn!(timeline = %tjp_addr, %err, "ambiguity scan failed");
            vec![]
        }
    }
}
