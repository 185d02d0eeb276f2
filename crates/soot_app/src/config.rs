//! Pool configuration and lifecycle hooks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The configuration contract between a host and the dirty pool.
///
/// Field-per-option mapping to the host's recognized settings:
/// `apps` = `dirty_apps`, `workers` = `dirty_workers`, `threads` =
/// `dirty_threads`, `timeout` = `dirty_timeout` (`None` disables, the
/// host's `0`), `graceful_timeout` = `dirty_graceful_timeout`.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// App spec strings, `mod:Class` or `mod:Class:N`.
    pub apps: Vec<String>,
    /// Initial and target pool size.
    pub workers: usize,
    /// Execution threads per worker.
    pub threads: usize,
    /// Per-request wall-clock deadline; `None` disables deadlines and the
    /// heartbeat murder sweep.
    pub timeout: Option<Duration>,
    /// Shutdown drain window.
    pub graceful_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            apps: Vec::new(),
            workers: 1,
            threads: 1,
            timeout: Some(Duration::from_secs(30)),
            graceful_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Timeout in seconds as carried in error details; 0.0 when disabled.
    pub fn timeout_secs(&self) -> f64 {
        self.timeout.map(|t| t.as_secs_f64()).unwrap_or(0.0)
    }
}

/// What hooks may see of a worker: identity only, never live handles.
#[derive(Debug, Clone)]
pub struct WorkerView {
    pub pid: u32,
    pub age: u64,
    pub apps: Vec<String>,
}

type ArbiterHook = Arc<dyn Fn(&std::path::Path) + Send + Sync>;
type WorkerHook = Arc<dyn Fn(&WorkerView) + Send + Sync>;

/// Host callbacks around the pool lifecycle. All default to no-ops.
#[derive(Clone, Default)]
pub struct Hooks {
    /// Arbiter is about to start; receives the arbiter socket path.
    pub on_starting: Option<ArbiterHook>,
    /// A worker process was spawned (runs in the arbiter).
    pub post_spawn: Option<WorkerHook>,
    /// A worker finished booting (runs in the worker process).
    pub worker_init: Option<WorkerHook>,
    /// A worker exited and was cleaned up (runs in the arbiter).
    pub worker_exit: Option<WorkerHook>,
}

impl Hooks {
    pub fn starting(&self, socket_path: &std::path::Path) {
        if let Some(hook) = &self.on_starting {
            hook(socket_path);
        }
    }

    pub fn spawned(&self, view: &WorkerView) {
        if let Some(hook) = &self.post_spawn {
            hook(view);
        }
    }

    pub fn booted(&self, view: &WorkerView) {
        if let Some(hook) = &self.worker_init {
            hook(view);
        }
    }

    pub fn exited(&self, view: &WorkerView) {
        if let Some(hook) = &self.worker_exit {
            hook(view);
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_starting", &self.on_starting.is_some())
            .field("post_spawn", &self.post_spawn.is_some())
            .field("worker_init", &self.worker_init.is_some())
            .field("worker_exit", &self.worker_exit.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.workers, 1);
        assert_eq!(config.threads, 1);
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn timeout_secs_disabled_is_zero() {
        let config = PoolConfig {
            timeout: None,
            ..PoolConfig::default()
        };
        assert_eq!(config.timeout_secs(), 0.0);
    }

    #[test]
    fn hooks_fire_when_set() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let hooks = Hooks {
            post_spawn: Some(Arc::new(move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
            })),
            ..Hooks::default()
        };

        let view = WorkerView {
            pid: 100,
            age: 1,
            apps: vec!["a:B".to_string()],
        };
        hooks.spawned(&view);
        hooks.exited(&view); // unset hook: no-op
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
