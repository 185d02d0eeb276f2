//! Dirty worker process runtime.
//!
//! A worker owns one Unix socket, hosts the app instances it was assigned,
//! and serves framed requests from the arbiter: one RESPONSE per unary
//! call, CHUNK* followed by END for streaming calls, ERROR on failure.
//! User code runs on a bounded execution pool so the event loop stays
//! responsive; a heartbeat file tells the arbiter the process is live.

mod heartbeat;
mod worker;

pub use heartbeat::Heartbeat;
pub use worker::{ShutdownKind, WorkerConfig, WorkerProcess};
