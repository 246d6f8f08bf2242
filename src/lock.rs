//! Advisory locking
//!
//! Locks are ordinary sentinel-gib frames at deterministic addresses
//! (`lock <spaceId> <scope>^gib`) holding an instance id and an expiry.
//! They are cooperative only: the store does not enforce them, and an
//! expired lock is simply overwritten. Acquisition retries with a
//! randomized bounded delay up to a configured attempt count.

use crate::config::LockConfig;
use crate::error::SpaceError;
use crate::frame::Frame;
use crate::store::StoreAdapter;
use crate::types::{Addr, SpaceId, ADDR_DELIMITER, GIB_SENTINEL};
use rand::Rng;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

const DATA_KEY_INSTANCE: &str = "instance_id";
const DATA_KEY_EXPIRES_AT: &str = "expires_at";

/// Address of the lock record for a scope within a space.
///
/// The scope must not contain the address delimiter; timeline scopes use
/// the origin's gib, which cannot.
pub fn lock_addr(space_id: &str, scope: &str) -> Addr {
    let scope = scope.replace(ADDR_DELIMITER, "_");
    format!("lock {space_id} {scope}{ADDR_DELIMITER}{GIB_SENTINEL}")
}

/// A held advisory lock. Release explicitly with [`release`]; dropping the
/// guard does nothing (the TTL is the backstop).
#[derive(Debug, Clone)]
pub struct LockGuard {
    pub addr: Addr,
    pub instance_id: String,
}

fn lock_frame(addr: &Addr, instance_id: &str, ttl_secs: i64) -> Frame {
    let (ib, _) = addr
        .split_once(ADDR_DELIMITER)
        .map(|(ib, gib)| (ib.to_string(), gib.to_string()))
        .unwrap_or((addr.clone(), GIB_SENTINEL.to_string()));
    let mut frame = Frame::primitive(ib);
    frame
        .data
        .insert(DATA_KEY_INSTANCE.to_string(), json!(instance_id));
    frame.data.insert(
        DATA_KEY_EXPIRES_AT.to_string(),
        json!(chrono::Utc::now().timestamp() + ttl_secs),
    );
    frame
}

fn is_expired(frame: &Frame) -> bool {
    frame
        .data
        .get(DATA_KEY_EXPIRES_AT)
        .and_then(serde_json::Value::as_i64)
        .map(|expires_at| expires_at <= chrono::Utc::now().timestamp())
        .unwrap_or(true)
}

fn holder_of(frame: &Frame) -> Option<&str> {
    frame
        .data
        .get(DATA_KEY_INSTANCE)
        .and_then(serde_json::Value::as_str)
}

/// Acquire the advisory lock for `scope` in the given space.
///
/// Best effort: between the read and the write another instance can slip
/// in; the TTL bounds the damage of an instance that never releases.
pub async fn acquire(
    store: &dyn StoreAdapter,
    space_id: &SpaceId,
    scope: &str,
    instance_id: &str,
    config: &LockConfig,
) -> Result<LockGuard, SpaceError> {
    let addr = lock_addr(space_id, scope);
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let outcome = store.get_frames(std::slice::from_ref(&addr)).await?;
        let holdable = match outcome.frames.first() {
            None => true,
            Some(existing) => is_expired(existing) || holder_of(existing) == Some(instance_id),
        };
        if holdable {
            let frame = lock_frame(&addr, instance_id, config.ttl_secs);
            store.put_frames(&[frame]).await?;
            debug!(%addr, instance_id, "lock acquired");
            return Ok(LockGuard {
                addr,
                instance_id: instance_id.to_string(),
            });
        }
        if attempts >= config.max_attempts {
            warn!(%addr, attempts, "lock unobtainable");
            return Err(SpaceError::LockTimeout {
                scope: scope.to_string(),
                attempts,
            });
        }
        let delay_ms = rand::thread_rng().gen_range(1..=config.max_delay_ms.max(1));
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}

/// Release a held lock. Best effort: failures are logged, not propagated,
/// since the TTL will expire the lock regardless.
pub async fn release(store: &dyn StoreAdapter, guard: &LockGuard) {
    if let Err(err) = store.delete_frames(std::slice::from_ref(&guard.addr)).await {
        warn!(addr = %guard.addr, %err, "failed to release lock; ttl will expire it");
    }
}
