//! Dependency graph resolver
//!
//! Computes the reachable-frame closure from a seed set: every frame
//! referenced (transitively, via allowed relation names) by a seed is
//! fetched from the space until no new addresses are discovered. Live
//! resolution additionally checks each seed timeline for newer frames in
//! the space and folds those in first.
//!
//! The traversal is an explicit worklist over a visited map — no
//! recursion, no shared accumulator aliasing.

use crate::error::SpaceError;
use crate::frame::{addr, split_timelines, Frame};
use crate::store::StoreAdapter;
use crate::types::{Addr, TjpAddr};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, warn};

/// Options for a closure resolution.
#[derive(Debug, Clone, Default)]
pub struct ClosureOpts {
    /// Check seed timelines for newer frames in the space before taking
    /// the closure.
    pub live: bool,
    /// Addresses never fetched nor returned; skipping an address
    /// implicitly skips whatever is reachable only through it.
    pub skip_addrs: BTreeSet<Addr>,
    /// Relation names not traversed.
    pub skip_rel8n_names: Vec<String>,
    /// When set, only these relation names are traversed.
    pub only_rel8n_names: Option<Vec<String>>,
    /// Delayed re-fetch attempts for addresses the space reports missing.
    pub max_retries: u32,
    /// Delay before each re-fetch attempt.
    pub retry_delay: Duration,
}

impl ClosureOpts {
    fn allows_rel8n(&self, name: &str) -> bool {
        if self.skip_rel8n_names.iter().any(|n| n == name) {
            return false;
        }
        match &self.only_rel8n_names {
            Some(only) => only.iter().any(|n| n == name),
            None => true,
        }
    }
}

/// Resolve the closure of `seed_frames` ∪ `seed_addrs` within `space`.
///
/// The returned map is closed under the allowed relation names: every
/// referenced address is present, except primitives and addresses in
/// `skip_addrs`. Missing addresses surviving `max_retries` delayed
/// attempts are fatal.
pub async fn resolve_closure(
    seed_frames: Vec<Frame>,
    seed_addrs: Vec<Addr>,
    opts: &ClosureOpts,
    space: &dyn StoreAdapter,
) -> Result<BTreeMap<Addr, Frame>, SpaceError> {
    if seed_frames.is_empty() && seed_addrs.is_empty() {
        return Err(SpaceError::validation(
            "closure resolution requires at least one seed frame or address",
        ));
    }

    let mut gotten: BTreeMap<Addr, Frame> = BTreeMap::new();
    let mut worklist: Vec<Addr> = Vec::new();

    for frame in seed_frames {
        let frame_addr = frame.addr();
        if frame.is_primitive() || opts.skip_addrs.contains(&frame_addr) {
            continue;
        }
        gotten.insert(frame_addr, frame);
    }
    for seed_addr in seed_addrs {
        if addr::is_primitive_addr(&seed_addr)
            || opts.skip_addrs.contains(&seed_addr)
            || gotten.contains_key(&seed_addr)
        {
            continue;
        }
        worklist.push(seed_addr);
    }

    if opts.live {
        resolve_live(&mut gotten, &mut worklist, opts, space).await?;
    }
    resolve_fixed_point(&mut gotten, worklist, opts, space).await?;
    Ok(gotten)
}

/// Live phase: for each distinct timeline among the frames held so far,
/// pull anything strictly newer from the space (plus the new frames'
/// direct references), repeating until no timeline reports newer content.
async fn resolve_live(
    gotten: &mut BTreeMap<Addr, Frame>,
    worklist: &mut Vec<Addr>,
    opts: &ClosureOpts,
    space: &dyn StoreAdapter,
) -> Result<(), SpaceError> {
    // seed addresses must be loaded before their timelines can be examined
    let pending = std::mem::take(worklist);
    fetch_into(gotten, pending, opts, space).await?;

    let mut analyzed: BTreeSet<TjpAddr> = BTreeSet::new();
    loop {
        let held: Vec<Frame> = gotten.values().cloned().collect();
        let split = split_timelines(&held);

        let mut newer_found = false;
        for (tjp_addr, members) in &split.timelines {
            if analyzed.contains(tjp_addr) {
                continue;
            }
            let latest_held_n = members.iter().filter_map(Frame::n).max().unwrap_or(0);
            let root = addr::punctiliar_of(addr::gib_of(tjp_addr)).to_string();
            let newer = space.newer_frames(&root, latest_held_n).await?;
            let mut found_for_timeline = false;
            for frame in newer {
                let frame_addr = frame.addr();
                if frame.n().unwrap_or(0) <= latest_held_n
                    || gotten.contains_key(&frame_addr)
                    || opts.skip_addrs.contains(&frame_addr)
                {
                    continue;
                }
                debug!(%frame_addr, timeline = %tjp_addr, "live closure found newer frame");
                gotten.insert(frame_addr, frame);
                found_for_timeline = true;
            }
            if found_for_timeline {
                // newly pulled frames may reference yet more timelines, so
                // this timeline gets reexamined next round
                newer_found = true;
            } else {
                analyzed.insert(tjp_addr.clone());
            }
        }

        if !newer_found {
            return Ok(());
        }
    }
}

/// Non-live phase: fixed-point loop collecting referenced addresses from
/// allowed relation names and batch-fetching them until nothing new turns
/// up.
async fn resolve_fixed_point(
    gotten: &mut BTreeMap<Addr, Frame>,
    mut worklist: Vec<Addr>,
    opts: &ClosureOpts,
    space: &dyn StoreAdapter,
) -> Result<(), SpaceError> {
    loop {
        let mut queued: BTreeSet<Addr> = worklist.drain(..).collect();
        let mut invalid: Vec<String> = Vec::new();

        for frame in gotten.values() {
            for (name, related) in &frame.rel8ns {
                if !opts.allows_rel8n(name) {
                    continue;
                }
                for related_addr in related {
                    if addr::is_primitive_addr(related_addr)
                        || opts.skip_addrs.contains(related_addr)
                        || gotten.contains_key(related_addr)
                        || queued.contains(related_addr)
                    {
                        continue;
                    }
                    let errors = addr::validate_addr(related_addr);
                    if errors.is_empty() {
                        queued.insert(related_addr.clone());
                    } else {
                        invalid.extend(errors);
                    }
                }
            }
        }
        if !invalid.is_empty() {
            return Err(SpaceError::Validation(invalid));
        }
        if queued.is_empty() {
            return Ok(());
        }
        fetch_into(gotten, queued.into_iter().collect(), opts, space).await?;
    }
}

/// Fetch the given addresses into `gotten`, retrying missing subsets with
/// delay up to the configured bound.
async fn fetch_into(
    gotten: &mut BTreeMap<Addr, Frame>,
    addrs: Vec<Addr>,
    opts: &ClosureOpts,
    space: &dyn StoreAdapter,
) -> Result<(), SpaceError> {
    let mut to_get: Vec<Addr> = addrs
        .into_iter()
        .filter(|a| !gotten.contains_key(a))
        .collect();
    if to_get.is_empty() {
        return Ok(());
    }

    let mut attempt = 0u32;
    loop {
        if attempt > 0 {
            warn!(
                attempt,
                missing = to_get.len(),
                "retrying fetch of missing closure addresses"
            );
            tokio::time::sleep(opts.retry_delay).await;
        }
        let outcome = space.get_frames(&to_get).await?;
        for frame in outcome.frames {
            gotten.insert(frame.addr(), frame);
        }
        if outcome.not_found.is_empty() {
            return Ok(());
        }
        to_get = outcome.not_found;
        attempt += 1;
        if attempt > opts.max_retries {
            return Err(SpaceError::NotFound { addrs: to_get });
        }
    }
}
