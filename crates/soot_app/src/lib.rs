//! App contract for the dirty pool.
//!
//! An app is a long-lived object hosted inside a dirty worker process. It is
//! built once per worker by a registered factory, initialized after the
//! worker process starts (so heavy resources are never inherited across a
//! spawn), serves `dispatch` calls for the worker's lifetime, and is closed
//! exactly once at shutdown.
//!
//! Apps are addressed by an import path of the form `module:Class`; the
//! registry maps those paths to factories. A deployment spec may append
//! `:N` to cap how many workers host the app (`heavy:Heavy:2`), which
//! overrides any limit declared at registration time.

pub mod config;
pub mod registry;
pub mod spec;

pub use config::{Hooks, PoolConfig, WorkerView};
pub use registry::AppRegistry;
pub use spec::{parse_spec, AppSpec, SpecError};

use std::collections::BTreeMap;
use std::sync::Arc;

use soot_protocol::Value;

/// Positional arguments of a dispatch call.
pub type Args = [Value];

/// Keyword arguments of a dispatch call.
pub type Kwargs = BTreeMap<String, Value>;

/// What a dispatch call produced: a single value, or a lazy finite sequence
/// streamed back one CHUNK per element.
pub enum Outcome {
    Value(Value),
    Stream(ValueStream),
}

/// A lazy, finite, non-restartable sequence of values.
///
/// The worker pulls elements on its execution pool, so an iterator may block
/// between elements without stalling the worker's event loop.
pub type ValueStream = Box<dyn Iterator<Item = anyhow::Result<Value>> + Send>;

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Outcome::Value(value)
    }
}

impl Outcome {
    /// Stream each item of an iterator of values.
    pub fn stream<I>(iter: I) -> Outcome
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Outcome::Stream(Box::new(iter.into_iter().map(Ok)))
    }
}

/// A hosted app instance.
///
/// Instances are shared across the worker's execution threads, so
/// implementations guard their own mutable state; with the default single
/// execution thread calls never overlap.
pub trait App: Send + Sync {
    /// One-time initialization, run in the worker process before it starts
    /// serving. Failure is fatal for the worker boot.
    fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle one action. Errors are reported to the caller and never crash
    /// the worker.
    fn dispatch(&self, action: &str, args: &Args, kwargs: &Kwargs) -> anyhow::Result<Outcome>;

    /// Release resources at worker shutdown.
    fn close(&self) {}
}

/// Factory producing one app instance per hosting worker.
pub type AppFactory = Arc<dyn Fn() -> Arc<dyn App> + Send + Sync>;
