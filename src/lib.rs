//! Weft: content-addressed frame timelines with put-merge synchronization.
//!
//! Frames are immutable, hash-linked records; frames sharing one
//! originating frame form a timeline. A space serves frames through a
//! command substrate, and the sync engine reconciles local timelines
//! against a remote two-tier store, merging divergent histories
//! automatically and notifying watching spaces of updates.

pub mod config;
pub mod error;
pub mod frame;
pub mod graph;
pub mod lock;
pub mod logging;
pub mod store;
pub mod sync;
pub mod types;
pub mod watch;
pub mod witness;
