//! The space engine: command validation and routing.
//!
//! One generic engine composed with a pluggable [`StoreAdapter`] — the
//! adapter implements only leaf operations, the engine owns validation,
//! the `(cmd, modifiers)` routing table, watch bookkeeping and the sync
//! saga entry point.

use crate::config::WeftConfig;
use crate::frame::{split_timelines, validate_intrinsically, Frame};
use crate::store::StoreAdapter;
use crate::sync;
use crate::types::{Addr, SpaceId, TjpAddr};
use crate::watch;
use crate::witness::{
    AllowAll, AuthGate, Cmd, CmdModifier, CommandArg, CommandResult, Witness, DATA_KEY_WITNESS,
};
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// A space: a witness that stores and serves frames through a pluggable
/// backing store.
pub struct Space {
    id: SpaceId,
    name: String,
    store: Arc<dyn StoreAdapter>,
    config: Arc<WeftConfig>,
    auth: Arc<dyn AuthGate>,
}

impl Space {
    pub fn new(name: &str, store: Arc<dyn StoreAdapter>, config: Arc<WeftConfig>) -> Self {
        let id = hex::encode(rand::random::<[u8; 16]>());
        Space {
            id,
            name: name.to_string(),
            store,
            config,
            auth: Arc::new(AllowAll),
        }
    }

    /// Consult this gate before executing any command.
    pub fn with_auth_gate(mut self, auth: Arc<dyn AuthGate>) -> Self {
        self.auth = auth;
        self
    }

    pub fn id(&self) -> &SpaceId {
        &self.id
    }

    pub fn store(&self) -> Arc<dyn StoreAdapter> {
        self.store.clone()
    }

    /// Per-command validation, before any dispatch. Returns every problem
    /// found; a non-empty list aborts the command.
    async fn validate_arg(&self, arg: &CommandArg) -> Vec<String> {
        let mut errors = Vec::new();
        let Some(cmd) = arg.cmd else {
            errors.push("cmd required".to_string());
            return errors;
        };

        match cmd {
            Cmd::Get => {
                let listing = arg.has_modifier(CmdModifier::Addrs)
                    || arg.has_modifier(CmdModifier::Latest)
                    || arg.has_modifier(CmdModifier::Watch);
                if !listing && arg.addrs.is_empty() && arg.frames.is_empty() {
                    errors.push("addrs required for get".to_string());
                }
            }
            Cmd::Put => {
                if arg.frames.is_empty() {
                    errors.push("frames required for put".to_string());
                }
                if arg.has_modifier(CmdModifier::Sync) {
                    match &arg.sync {
                        Some(request) => {
                            if let Err(err) = request.validate() {
                                errors.push(err.to_string());
                            }
                        }
                        None => errors.push("sync request required for put sync".to_string()),
                    }
                }
                if self.config.validate_addr_frame_correspondence && !arg.addrs.is_empty() {
                    errors.extend(validate_correspondence(&arg.addrs, &arg.frames));
                }
                for frame in &arg.frames {
                    match validate_intrinsically(frame) {
                        Ok(frame_errors) => errors.extend(frame_errors),
                        Err(err) => errors.push(err.to_string()),
                    }
                }
            }
            Cmd::Delete => {
                if arg.addrs.is_empty() {
                    errors.push("addrs required for delete".to_string());
                }
            }
        }

        if (arg.has_modifier(CmdModifier::Watch) || arg.has_modifier(CmdModifier::Unwatch))
            && arg.src_space_id.is_none()
        {
            errors.push("src space id required for watch/unwatch".to_string());
        }
        errors
    }

    /// The `(cmd, modifiers)` routing table.
    async fn route(&self, arg: CommandArg) -> Result<CommandResult, crate::error::SpaceError> {
        let cmd = arg
            .cmd
            .ok_or_else(|| crate::error::SpaceError::validation("cmd required"))?;
        match cmd {
            Cmd::Get => {
                if arg.has_modifier(CmdModifier::Can) {
                    self.existence_check(&arg.addrs, false).await
                } else if arg.has_modifier(CmdModifier::Latest) {
                    if arg.has_modifier(CmdModifier::Addrs) {
                        self.get_latest_addrs(&arg).await
                    } else {
                        self.get_latest_frames(&arg).await
                    }
                } else if arg.has_modifier(CmdModifier::Tjps) {
                    self.get_tjps(&arg).await
                } else if arg.has_modifier(CmdModifier::Watch) {
                    self.get_with_watch(&arg).await
                } else if arg.has_modifier(CmdModifier::Addrs) && arg.addrs.is_empty() {
                    self.list_addrs().await
                } else {
                    self.get(&arg.addrs).await
                }
            }
            Cmd::Put => {
                if arg.has_modifier(CmdModifier::Can) {
                    self.existence_check(&frame_addrs(&arg), true).await
                } else if arg.has_modifier(CmdModifier::Sync) {
                    self.put_sync(arg).await
                } else {
                    self.put(&arg.frames).await
                }
            }
            Cmd::Delete => {
                if arg.has_modifier(CmdModifier::Can) {
                    self.existence_check(&arg.addrs, false).await
                } else if arg.has_modifier(CmdModifier::Unwatch) {
                    self.unwatch(&arg).await
                } else {
                    self.delete(&arg.addrs).await
                }
            }
        }
    }

    async fn get(&self, addrs: &[Addr]) -> Result<CommandResult, crate::error::SpaceError> {
        let outcome = self.store.get_frames(addrs).await?;
        let mut result = CommandResult::ok();
        result.frames = outcome.frames;
        result.addrs_not_found = outcome.not_found;
        Ok(result)
    }

    async fn put(&self, frames: &[Frame]) -> Result<CommandResult, crate::error::SpaceError> {
        let outcome = self.store.put_frames(frames).await?;
        let mut result = CommandResult::ok();
        result.addrs = outcome.stored;
        result.addrs_already_present = outcome.already_present;
        Ok(result)
    }

    async fn delete(&self, addrs: &[Addr]) -> Result<CommandResult, crate::error::SpaceError> {
        let outcome = self.store.delete_frames(addrs).await?;
        let mut result = CommandResult::ok();
        result.addrs = outcome.deleted;
        result.addrs_not_found = outcome.not_found;
        Ok(result)
    }

    async fn list_addrs(&self) -> Result<CommandResult, crate::error::SpaceError> {
        let mut result = CommandResult::ok();
        result.addrs = self.store.list_addrs().await?;
        Ok(result)
    }

    /// Existence check backing both `can get` and `can put`: which of the
    /// addresses are present, which absent.
    async fn existence_check(
        &self,
        addrs: &[Addr],
        for_put: bool,
    ) -> Result<CommandResult, crate::error::SpaceError> {
        let outcome = self.store.exists(addrs).await?;
        let mut result = CommandResult::ok();
        if for_put {
            result.addrs_already_present = outcome.present;
            result.addrs = outcome.absent;
        } else {
            result.addrs = outcome.present;
            result.addrs_not_found = outcome.absent;
        }
        Ok(result)
    }

    /// Frames named by the arg: given directly, or fetched by address.
    async fn arg_frames(&self, arg: &CommandArg) -> Result<Vec<Frame>, crate::error::SpaceError> {
        if !arg.frames.is_empty() {
            return Ok(arg.frames.clone());
        }
        let outcome = self.store.get_frames(&arg.addrs).await?;
        Ok(outcome.frames)
    }

    async fn get_latest_addrs(
        &self,
        arg: &CommandArg,
    ) -> Result<CommandResult, crate::error::SpaceError> {
        let frames = self.arg_frames(arg).await?;
        let mut result = CommandResult::ok();
        result.latest_addr_map = self.store.latest_addrs(&frames).await?;
        Ok(result)
    }

    async fn get_latest_frames(
        &self,
        arg: &CommandArg,
    ) -> Result<CommandResult, crate::error::SpaceError> {
        let frames = self.arg_frames(arg).await?;
        let latest_map = self.store.latest_addrs(&frames).await?;
        let latest_addrs: Vec<Addr> = latest_map.values().flatten().cloned().collect();
        let outcome = self.store.get_frames(&latest_addrs).await?;
        let mut result = CommandResult::ok();
        result.frames = outcome.frames;
        result.addrs_not_found = outcome.not_found;
        result.latest_addr_map = latest_map;
        Ok(result)
    }

    /// Resolve timeline origins for the given addresses. With the `addrs`
    /// modifier only the origin addresses are returned; otherwise the
    /// origin frames are fetched too.
    async fn get_tjps(&self, arg: &CommandArg) -> Result<CommandResult, crate::error::SpaceError> {
        let frames = self.arg_frames(arg).await?;
        let mut tjp_addrs: Vec<TjpAddr> = Vec::new();
        let mut seen = BTreeSet::new();
        for frame in &frames {
            if let Some(tjp_addr) = frame.tjp_addr() {
                if seen.insert(tjp_addr.clone()) {
                    tjp_addrs.push(tjp_addr);
                }
            }
        }
        let mut result = CommandResult::ok();
        if arg.has_modifier(CmdModifier::Addrs) {
            result.addrs = tjp_addrs;
        } else {
            let outcome = self.store.get_frames(&tjp_addrs).await?;
            result.frames = outcome.frames;
            result.addrs_not_found = outcome.not_found;
        }
        Ok(result)
    }

    /// `get … watch`: drain pending updates for the calling space, plus a
    /// plain get when addresses were also given.
    async fn get_with_watch(
        &self,
        arg: &CommandArg,
    ) -> Result<CommandResult, crate::error::SpaceError> {
        let src_space_id = require_src_space(arg)?;
        let mut result = if arg.addrs.is_empty() {
            CommandResult::ok()
        } else {
            self.get(&arg.addrs).await?
        };
        result.watch_update_map = watch::drain(&*self.store, &src_space_id).await?;
        Ok(result)
    }

    /// `delete … unwatch`: drop the calling space's subscription to the
    /// given timelines.
    async fn unwatch(&self, arg: &CommandArg) -> Result<CommandResult, crate::error::SpaceError> {
        let src_space_id = require_src_space(arg)?;
        watch::unsubscribe(&*self.store, &src_space_id, &arg.addrs).await?;
        Ok(CommandResult::ok())
    }

    /// `put … sync`: hand the frames to the reconciliation engine. With
    /// the `watch` modifier the calling space is also subscribed to every
    /// timeline in the set and its pending updates are drained into the
    /// result.
    async fn put_sync(&self, arg: CommandArg) -> Result<CommandResult, crate::error::SpaceError> {
        let request = arg
            .sync
            .clone()
            .ok_or_else(|| crate::error::SpaceError::validation("sync request required"))?;
        let mut result = CommandResult::ok();

        if arg.has_modifier(CmdModifier::Watch) {
            let src_space_id = require_src_space(&arg)?;
            let split = split_timelines(&arg.frames);
            let tjp_addrs: Vec<TjpAddr> = split.timelines.keys().cloned().collect();
            watch::subscribe(&*self.store, &src_space_id, &tjp_addrs).await?;
            result.watch_update_map = watch::drain(&*self.store, &src_space_id).await?;
        }

        let handle = sync::start_saga(
            self.store.clone(),
            self.config.clone(),
            self.id.clone(),
            request,
            arg.frames,
        )
        .await?;
        debug!(saga_id = %handle.saga_id, "sync saga handed to caller");
        result.saga = Some(handle);
        Ok(result)
    }
}

#[async_trait]
impl Witness for Space {
    fn descriptor(&self) -> Frame {
        let mut frame = Frame::primitive(format!("witness space {} {}", self.name, self.id));
        frame.data.insert(DATA_KEY_WITNESS.to_string(), json!(true));
        frame.data.insert("uuid".to_string(), json!(self.id));
        frame.data.insert("name".to_string(), json!(self.name));
        frame
    }

    async fn witness(&self, arg: CommandArg) -> CommandResult {
        let errors = self.validate_arg(&arg).await;
        if !errors.is_empty() {
            warn!(?errors, "command rejected by validation");
            return CommandResult::failure(errors);
        }
        if let Err(reason) = self.auth.authorize(&arg).await {
            return CommandResult::failure(vec![format!("unauthorized: {reason}")]);
        }
        match self.route(arg).await {
            Ok(result) => result,
            Err(err) => CommandResult::failure(vec![err.to_string()]),
        }
    }
}

fn require_src_space(arg: &CommandArg) -> Result<SpaceId, crate::error::SpaceError> {
    arg.src_space_id
        .clone()
        .ok_or_else(|| crate::error::SpaceError::validation("src space id required"))
}

/// Strict 1:1 correspondence between given addresses and frames.
fn validate_correspondence(addrs: &[Addr], frames: &[Frame]) -> Vec<String> {
    let mut errors = Vec::new();
    if addrs.len() != frames.len() {
        errors.push(format!(
            "address/frame count mismatch: {} addrs, {} frames",
            addrs.len(),
            frames.len()
        ));
        return errors;
    }
    let mut remaining: Vec<&Addr> = addrs.iter().collect();
    for frame in frames {
        let frame_addr = frame.addr();
        match remaining.iter().position(|a| **a == frame_addr) {
            Some(index) => {
                remaining.swap_remove(index);
            }
            None => {
                errors.push(format!(
                    "frame address {frame_addr} not among the given addrs"
                ));
                return errors;
            }
        }
    }
    errors
}

fn frame_addrs(arg: &CommandArg) -> Vec<Addr> {
    if arg.addrs.is_empty() {
        arg.frames.iter().map(Frame::addr).collect()
    } else {
        arg.addrs.clone()
    }
}
