//! Blocking client for sync request handlers.

use std::collections::BTreeMap;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use soot_protocol::{
    read_frame, write_frame, DirtyError, Frame, Manage, MsgType, ProtocolError, Request, Value,
};

use crate::{next_request_id, resolve_socket_path};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Blocking dirty-pool client.
///
/// Keeps one connection to the arbiter behind a lock, so a client may be
/// shared across threads; calls on it serialize. Any I/O or protocol error
/// closes the connection and the next call reconnects.
pub struct DirtyClient {
    socket_path: PathBuf,
    timeout: Option<Duration>,
    conn: Mutex<Option<UnixStream>>,
}

impl DirtyClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Some(DEFAULT_TIMEOUT),
            conn: Mutex::new(None),
        }
    }

    /// Client against the socket from the process default or environment.
    pub fn from_env() -> Result<Self, DirtyError> {
        Ok(Self::new(resolve_socket_path(None)?))
    }

    /// Per-operation timeout; `None` blocks indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Call an app action and return its result.
    pub fn execute(
        &self,
        app_path: &str,
        action: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value, DirtyError> {
        let request = Request::new(app_path, action)
            .with_args(args)
            .with_kwargs(kwargs);
        let reply = self.roundtrip(&Frame::request(next_request_id(), &request))?;
        expect_result(reply)
    }

    /// Call a streaming app action. The REQUEST is sent on the first
    /// advance; the stream holds the client's connection lock until it
    /// reaches its terminal message (or is dropped, which closes the
    /// connection so the leftover reply sequence cannot leak into later
    /// calls).
    pub fn execute_stream(
        &self,
        app_path: &str,
        action: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> CallStream<'_> {
        let request = Request::new(app_path, action)
            .with_args(args)
            .with_kwargs(kwargs);
        CallStream {
            client: self,
            pending: Some(Frame::request(next_request_id(), &request)),
            guard: None,
            done: false,
        }
    }

    /// Pool state snapshot (STATUS).
    pub fn status(&self) -> Result<Value, DirtyError> {
        let reply = self.roundtrip(&Frame::status(next_request_id()))?;
        expect_result(reply)
    }

    /// Grow the pool (MANAGE ADD).
    pub fn add_workers(&self, count: i64) -> Result<Value, DirtyError> {
        self.manage(&Manage::add(count))
    }

    /// Shrink the pool (MANAGE REMOVE); the arbiter enforces its floor.
    pub fn remove_workers(&self, count: i64) -> Result<Value, DirtyError> {
        self.manage(&Manage::remove(count))
    }

    /// Gracefully terminate one worker by pid.
    pub fn kill_worker(&self, pid: u32) -> Result<Value, DirtyError> {
        self.manage(&Manage::kill(pid))
    }

    /// Blue/green reload of the whole pool.
    pub fn reload(&self) -> Result<Value, DirtyError> {
        self.manage(&Manage::reload())
    }

    /// Ask the arbiter to shut down.
    pub fn shutdown(&self, graceful: bool) -> Result<Value, DirtyError> {
        self.manage(&Manage::shutdown(graceful))
    }

    fn manage(&self, manage: &Manage) -> Result<Value, DirtyError> {
        let reply = self.roundtrip(&Frame::manage(next_request_id(), manage))?;
        expect_result(reply)
    }

    /// Close the connection; the next call reconnects.
    pub fn close(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> MutexGuard<'_, Option<UnixStream>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect(&self) -> Result<UnixStream, DirtyError> {
        let stream = UnixStream::connect(&self.socket_path).map_err(|err| {
            DirtyError::connection(
                format!("failed to connect to dirty arbiter: {err}"),
                self.socket_path.to_str(),
            )
        })?;
        stream
            .set_read_timeout(self.timeout)
            .and_then(|_| stream.set_write_timeout(self.timeout))
            .map_err(|err| {
                DirtyError::connection(
                    format!("failed to configure socket timeouts: {err}"),
                    self.socket_path.to_str(),
                )
            })?;
        Ok(stream)
    }

    fn ensure<'g>(
        &self,
        guard: &'g mut Option<UnixStream>,
    ) -> Result<&'g mut UnixStream, DirtyError> {
        if guard.is_none() {
            *guard = Some(self.connect()?);
        }
        match guard.as_mut() {
            Some(stream) => Ok(stream),
            None => Err(DirtyError::connection(
                "connection unavailable".to_string(),
                self.socket_path.to_str(),
            )),
        }
    }

    /// One request, one terminal reply, under the connection lock.
    pub(crate) fn roundtrip(&self, frame: &Frame) -> Result<Frame, DirtyError> {
        let mut guard = self.lock();
        let stream = self.ensure(&mut guard)?;

        if let Err(err) = write_frame(stream, frame) {
            *guard = None;
            return Err(self.map_error(err));
        }
        match read_frame(stream) {
            Ok(reply) => Ok(reply),
            Err(err) => {
                *guard = None;
                Err(self.map_error(err))
            }
        }
    }

    fn map_error(&self, err: ProtocolError) -> DirtyError {
        map_protocol_error(err, self.timeout, &self.socket_path)
    }
}

fn map_protocol_error(
    err: ProtocolError,
    timeout: Option<Duration>,
    socket_path: &Path,
) -> DirtyError {
    match err {
        ProtocolError::Io(io_err)
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) =>
        {
            DirtyError::timeout(
                "timed out waiting for dirty pool reply",
                timeout.map(|t| t.as_secs_f64()).unwrap_or(0.0),
            )
        }
        ProtocolError::Io(io_err) => DirtyError::connection(
            format!("dirty pool connection failed: {io_err}"),
            socket_path.to_str(),
        ),
        ProtocolError::Closed => DirtyError::connection(
            "dirty pool connection closed".to_string(),
            socket_path.to_str(),
        ),
        other => DirtyError::from(other),
    }
}

fn expect_result(reply: Frame) -> Result<Value, DirtyError> {
    match reply.msg_type {
        MsgType::Response => Ok(reply.result()?.clone()),
        MsgType::Error => Err(reply.dirty_error()?),
        other => Err(DirtyError::from(ProtocolError::UnexpectedMessage {
            found: other,
        })),
    }
}

/// Lazy, finite, non-restartable stream of values from a streaming call.
pub struct CallStream<'a> {
    client: &'a DirtyClient,
    pending: Option<Frame>,
    guard: Option<MutexGuard<'a, Option<UnixStream>>>,
    done: bool,
}

impl CallStream<'_> {
    fn fail(&mut self, err: DirtyError) -> Option<Result<Value, DirtyError>> {
        if let Some(guard) = self.guard.as_mut() {
            **guard = None;
        }
        self.finish();
        Some(Err(err))
    }

    fn finish(&mut self) {
        self.done = true;
        self.guard = None;
    }
}

impl Iterator for CallStream<'_> {
    type Item = Result<Value, DirtyError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if let Some(frame) = self.pending.take() {
            let mut guard = self.client.lock();
            let stream = match self.client.ensure(&mut guard) {
                Ok(stream) => stream,
                Err(err) => {
                    self.finish();
                    return Some(Err(err));
                }
            };
            if let Err(err) = write_frame(stream, &frame) {
                *guard = None;
                self.finish();
                return Some(Err(self.client.map_error(err)));
            }
            self.guard = Some(guard);
        }

        let guard = self.guard.as_mut()?;
        let stream = match guard.as_mut() {
            Some(stream) => stream,
            None => {
                self.finish();
                return None;
            }
        };

        match read_frame(stream) {
            Ok(reply) => match reply.msg_type {
                MsgType::Chunk => match reply.data() {
                    Ok(data) => Some(Ok(data.clone())),
                    Err(err) => self.fail(DirtyError::from(err)),
                },
                MsgType::End => {
                    self.finish();
                    None
                }
                MsgType::Error => {
                    let err = match reply.dirty_error() {
                        Ok(err) => err,
                        Err(protocol_err) => DirtyError::from(protocol_err),
                    };
                    self.finish();
                    Some(Err(err))
                }
                other => self.fail(DirtyError::from(ProtocolError::UnexpectedMessage {
                    found: other,
                })),
            },
            Err(err) => {
                let mapped = self.client.map_error(err);
                self.fail(mapped)
            }
        }
    }
}

impl Drop for CallStream<'_> {
    fn drop(&mut self) {
        // Dropping mid-stream abandons the reply sequence; close the
        // connection so the remnants cannot be read as a later reply.
        if !self.done {
            if let Some(guard) = self.guard.as_mut() {
                **guard = None;
            }
        }
    }
}
