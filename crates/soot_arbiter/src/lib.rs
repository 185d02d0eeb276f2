//! Dirty arbiter: supervisor of the dirty worker pool.
//!
//! The arbiter owns the pool's listening socket and its worker processes.
//! It spawns workers according to the per-app placement policy, keeps one
//! ordered link per worker for request forwarding, watches heartbeats,
//! respawns crashed workers with the app set they hosted, and serves the
//! stash and control surfaces. Lifecycle is signal-driven: TERM drains,
//! QUIT/INT stop at once, HUP reloads blue/green, USR1 reopens logs,
//! TTIN/TTOU resize the pool.

mod arbiter;
pub mod placement;
mod router;
pub mod stash;

pub use arbiter::{Arbiter, Controller, WorkerCommand};
pub use placement::ResolvedApp;
pub use stash::Stash;
