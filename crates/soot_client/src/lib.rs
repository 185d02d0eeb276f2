//! Clients for the dirty pool.
//!
//! Request-serving processes use these to call apps hosted in the pool.
//! Two APIs share the framed protocol:
//!
//! - [`DirtyClient`] — blocking, safe to share across threads (one
//!   connection guarded by a lock), for traditional sync request handlers.
//! - [`AsyncDirtyClient`] — `&mut self`, one per task, for async handlers.
//!   Tasks own their client; there is no implicit per-task cache.
//!
//! Both resolve the arbiter socket from an explicit path or the
//! `SOOT_DIRTY_SOCKET` environment variable, keep one connection, and
//! reconnect transparently after any error.

mod async_client;
mod blocking;
mod stash;

pub use async_client::{AsyncCallStream, AsyncDirtyClient};
pub use blocking::{CallStream, DirtyClient};
pub use stash::{StashClient, StashTable};

pub use soot_protocol::{DirtyError, ErrorKind, Value};

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Unique in-flight request ids, process-wide.
static REQUEST_IDS: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_request_id() -> u64 {
    REQUEST_IDS.fetch_add(1, Ordering::Relaxed)
}

static DEFAULT_SOCKET: OnceLock<PathBuf> = OnceLock::new();

/// Set the process-wide default arbiter socket path. First call wins;
/// returns whether this call set it. The host does this before request
/// handlers run.
pub fn set_default_socket_path(path: impl Into<PathBuf>) -> bool {
    DEFAULT_SOCKET.set(path.into()).is_ok()
}

/// Resolve the arbiter socket path: explicit value, process default, then
/// the `SOOT_DIRTY_SOCKET` environment variable.
pub fn resolve_socket_path(explicit: Option<&Path>) -> Result<PathBuf, DirtyError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = DEFAULT_SOCKET.get() {
        return Ok(path.clone());
    }
    match std::env::var(soot_protocol::SOCKET_ENV_VAR) {
        Ok(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Err(DirtyError::connection(
            format!(
                "dirty pool socket path not configured (set {} or call set_default_socket_path)",
                soot_protocol::SOCKET_ENV_VAR
            ),
            None,
        )),
    }
}

thread_local! {
    static SHARED_CLIENT: RefCell<Option<Arc<DirtyClient>>> = const { RefCell::new(None) };
}

/// The cached per-thread client, created on first use from the default
/// socket path.
pub fn shared_client() -> Result<Arc<DirtyClient>, DirtyError> {
    SHARED_CLIENT.with(|cell| {
        let mut slot = cell.borrow_mut();
        if let Some(client) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }
        let path = resolve_socket_path(None)?;
        let client = Arc::new(DirtyClient::new(path));
        *slot = Some(Arc::clone(&client));
        Ok(client)
    })
}

/// Drop this thread's cached client, closing its connection.
pub fn close_shared_client() {
    SHARED_CLIENT.with(|cell| {
        cell.borrow_mut().take();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_and_increasing() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b > a);
    }

    #[test]
    fn explicit_path_wins() {
        let path = resolve_socket_path(Some(Path::new("/tmp/x.sock"))).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/x.sock"));
    }
}
