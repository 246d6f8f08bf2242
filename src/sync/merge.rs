//! Timeline merge strategies.
//!
//! When the store holds frames a local timeline does not know about, one
//! of two merges reconciles them: replaying the local side's
//! post-divergence transforms onto the store's latest frame (when both
//! sides carry DNA), or a naive state merge with the store dominant (when
//! DNA is unavailable on either side).

use crate::error::SpaceError;
use crate::frame::transform;
use crate::frame::{
    Frame, DATA_KEY_IS_TJP, DATA_KEY_N, REL8N_ANCESTOR, REL8N_PAST, REL8N_TJP,
};
use crate::types::Addr;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

/// Index of the first position where two address sequences diverge.
///
/// Equal sequences diverge at their (equal) length; a strict prefix
/// diverges at its own length.
pub fn first_divergence(a: &[Addr], b: &[Addr]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Result of replaying a transform chain.
#[derive(Debug)]
pub struct ReplayOutcome {
    /// The frame produced by the final transform.
    pub latest: Frame,
    /// Everything created along the way: regenerated DNA frames and every
    /// intermediate frame, including `latest`.
    pub created: Vec<Frame>,
}

/// Replay the given DNA addresses, in order, on top of `src`.
///
/// The DNA frames themselves must be present in `pool` (they come from
/// the local side of the merge). Replaying is expected to regenerate DNA
/// identical to what was applied; a mismatch is logged, not fatal.
pub fn replay_chain(
    src: &Frame,
    dna_addrs: &[Addr],
    pool: &BTreeMap<Addr, Frame>,
) -> Result<ReplayOutcome, SpaceError> {
    let mut current = src.clone();
    let mut created: Vec<Frame> = Vec::new();

    for dna_addr in dna_addrs {
        let dna = pool.get(dna_addr).ok_or_else(|| {
            SpaceError::Transform(format!("dna frame not supplied for replay: {dna_addr}"))
        })?;
        let result = transform::replay(&current, dna)?;
        match &result.dna {
            Some(regenerated) if &regenerated.addr() != dna_addr => {
                warn!(
                    expected = %dna_addr,
                    regenerated = %regenerated.addr(),
                    "replay regenerated different dna than applied"
                );
                created.push(regenerated.clone());
            }
            Some(regenerated) => created.push(regenerated.clone()),
            None => {
                warn!(%dna_addr, "replayed transform did not regenerate dna");
            }
        }
        created.push(result.new_frame.clone());
        current = result.new_frame;
    }

    Ok(ReplayOutcome {
        latest: current,
        created,
    })
}

/// Naive deep merge of two JSON object maps, dominant winning scalar
/// conflicts, arrays unioned (dominant order first), objects merged
/// recursively.
pub fn naive_merge(dominant: &Map<String, Value>, recessive: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = Map::new();
    for (key, dom_val) in dominant {
        match (dom_val, recessive.get(key)) {
            (Value::Object(dom), Some(Value::Object(rec))) => {
                merged.insert(key.clone(), Value::Object(naive_merge(dom, rec)));
            }
            (Value::Array(dom), Some(Value::Array(rec))) => {
                merged.insert(key.clone(), Value::Array(union_arrays(dom, rec)));
            }
            _ => {
                merged.insert(key.clone(), dom_val.clone());
            }
        }
    }
    for (key, rec_val) in recessive {
        if !merged.contains_key(key) {
            merged.insert(key.clone(), rec_val.clone());
        }
    }
    merged
}

fn union_arrays(dominant: &[Value], recessive: &[Value]) -> Vec<Value> {
    let mut union = dominant.to_vec();
    for value in recessive {
        if !union.contains(value) {
            union.push(value.clone());
        }
    }
    union
}

/// Construct the merged frame when DNA is unavailable on either side.
///
/// The store side is dominant, the local side recessive; the sequence
/// number moves past both. The dominance rule is a best-effort default,
/// not a verified contract.
pub fn merge_state(local_latest: &Frame, store_latest: &Frame) -> Result<Frame, SpaceError> {
    let store_addr = store_latest.addr();

    let mut data = naive_merge(&store_latest.data, &local_latest.data);
    let n_next = local_latest
        .n()
        .unwrap_or(0)
        .max(store_latest.n().unwrap_or(0))
        + 1;
    data.insert(DATA_KEY_N.to_string(), json!(n_next));
    // the merged frame extends the timeline; it is never itself an origin
    data.remove(DATA_KEY_IS_TJP);

    let mut rel8ns = BTreeMap::new();
    for (name, addrs) in &store_latest.rel8ns {
        rel8ns.insert(name.clone(), addrs.clone());
    }
    for (name, addrs) in &local_latest.rel8ns {
        let entry = rel8ns.entry(name.clone()).or_default();
        for a in addrs {
            if !entry.contains(a) {
                entry.push(a.clone());
            }
        }
    }
    // lineage columns come from the store side alone, rebased on its latest
    let mut past = store_latest.rel8n(REL8N_PAST).to_vec();
    past.push(store_addr.clone());
    rel8ns.insert(REL8N_PAST.to_string(), past);
    match store_latest.tjp_addr() {
        Some(tjp_addr) => {
            rel8ns.insert(REL8N_TJP.to_string(), vec![tjp_addr]);
        }
        None => {
            rel8ns.remove(REL8N_TJP);
        }
    }
    if store_latest.rel8n(REL8N_ANCESTOR).is_empty() {
        rel8ns.remove(REL8N_ANCESTOR);
    } else {
        rel8ns.insert(
            REL8N_ANCESTOR.to_string(),
            store_latest.rel8n(REL8N_ANCESTOR).to_vec(),
        );
    }

    let mut merged = Frame {
        ib: store_latest.ib.clone(),
        gib: String::new(),
        data,
        rel8ns,
    };
    merged.gib = crate::frame::integrity::compute_gib(&merged)?;
    Ok(merged)
}
