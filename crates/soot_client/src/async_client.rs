//! Async client for cooperative request handlers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::UnixStream;

use soot_protocol::{
    read_frame_async, write_frame_async, DirtyError, Frame, Manage, MsgType, ProtocolError,
    Request, Value,
};

use crate::{next_request_id, resolve_socket_path};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Async dirty-pool client. One per task: methods take `&mut self` and the
/// single connection is never shared across tasks.
pub struct AsyncDirtyClient {
    socket_path: PathBuf,
    timeout: Option<Duration>,
    conn: Option<UnixStream>,
}

impl AsyncDirtyClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Some(DEFAULT_TIMEOUT),
            conn: None,
        }
    }

    /// Client against the socket from the process default or environment.
    pub fn from_env() -> Result<Self, DirtyError> {
        Ok(Self::new(resolve_socket_path(None)?))
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Call an app action and return its result.
    pub async fn execute(
        &mut self,
        app_path: &str,
        action: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value, DirtyError> {
        let request = Request::new(app_path, action)
            .with_args(args)
            .with_kwargs(kwargs);
        let reply = self
            .roundtrip(&Frame::request(next_request_id(), &request))
            .await?;
        self.expect_result(reply)
    }

    /// Call a streaming app action; the REQUEST goes out on the first
    /// `next`. Dropping the stream before its terminal closes the
    /// connection.
    pub fn execute_stream(
        &mut self,
        app_path: &str,
        action: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> AsyncCallStream<'_> {
        let request = Request::new(app_path, action)
            .with_args(args)
            .with_kwargs(kwargs);
        AsyncCallStream {
            client: self,
            pending: Some(Frame::request(next_request_id(), &request)),
            done: false,
        }
    }

    /// Pool state snapshot (STATUS).
    pub async fn status(&mut self) -> Result<Value, DirtyError> {
        let reply = self.roundtrip(&Frame::status(next_request_id())).await?;
        self.expect_result(reply)
    }

    pub async fn add_workers(&mut self, count: i64) -> Result<Value, DirtyError> {
        self.manage(Manage::add(count)).await
    }

    pub async fn remove_workers(&mut self, count: i64) -> Result<Value, DirtyError> {
        self.manage(Manage::remove(count)).await
    }

    pub async fn kill_worker(&mut self, pid: u32) -> Result<Value, DirtyError> {
        self.manage(Manage::kill(pid)).await
    }

    pub async fn reload(&mut self) -> Result<Value, DirtyError> {
        self.manage(Manage::reload()).await
    }

    pub async fn shutdown(&mut self, graceful: bool) -> Result<Value, DirtyError> {
        self.manage(Manage::shutdown(graceful)).await
    }

    async fn manage(&mut self, manage: Manage) -> Result<Value, DirtyError> {
        let reply = self
            .roundtrip(&Frame::manage(next_request_id(), &manage))
            .await?;
        self.expect_result(reply)
    }

    /// Close the connection; the next call reconnects.
    pub fn close(&mut self) {
        self.conn = None;
    }

    async fn ensure(&mut self) -> Result<&mut UnixStream, DirtyError> {
        if self.conn.is_none() {
            let connect = UnixStream::connect(&self.socket_path);
            let stream = match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, connect).await {
                    Ok(res) => res,
                    Err(_) => {
                        return Err(DirtyError::timeout(
                            "timed out connecting to dirty arbiter",
                            limit.as_secs_f64(),
                        ))
                    }
                },
                None => connect.await,
            }
            .map_err(|err| {
                DirtyError::connection(
                    format!("failed to connect to dirty arbiter: {err}"),
                    self.socket_path.to_str(),
                )
            })?;
            self.conn = Some(stream);
        }
        match self.conn.as_mut() {
            Some(stream) => Ok(stream),
            None => Err(DirtyError::connection(
                "connection unavailable".to_string(),
                self.socket_path.to_str(),
            )),
        }
    }

    async fn roundtrip(&mut self, frame: &Frame) -> Result<Frame, DirtyError> {
        self.send(frame).await?;
        self.receive().await
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), DirtyError> {
        let socket_path = self.socket_path.clone();
        let stream = self.ensure().await?;
        if let Err(err) = write_frame_async(stream, frame).await {
            self.conn = None;
            return Err(map_protocol_error(err, &socket_path));
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Frame, DirtyError> {
        let limit = self.timeout;
        let socket_path = self.socket_path.clone();
        let stream = self.ensure().await?;
        let read = read_frame_async(stream);
        let result = match limit {
            Some(limit) => match tokio::time::timeout(limit, read).await {
                Ok(res) => res,
                Err(_) => {
                    self.conn = None;
                    return Err(DirtyError::timeout(
                        "timed out waiting for dirty pool reply",
                        limit.as_secs_f64(),
                    ));
                }
            },
            None => read.await,
        };
        match result {
            Ok(frame) => Ok(frame),
            Err(err) => {
                self.conn = None;
                Err(map_protocol_error(err, &socket_path))
            }
        }
    }

    fn expect_result(&mut self, reply: Frame) -> Result<Value, DirtyError> {
        match reply.msg_type {
            MsgType::Response => Ok(reply.result()?.clone()),
            MsgType::Error => Err(reply.dirty_error()?),
            other => {
                self.conn = None;
                Err(DirtyError::from(ProtocolError::UnexpectedMessage {
                    found: other,
                }))
            }
        }
    }
}

fn map_protocol_error(err: ProtocolError, socket_path: &Path) -> DirtyError {
    match err {
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

/// Async counterpart of the blocking streaming iterator.
pub struct AsyncCallStream<'a> {
    client: &'a mut AsyncDirtyClient,
    pending: Option<Frame>,
    done: bool,
}

impl AsyncCallStream<'_> {
    /// Advance the stream: `None` after the terminal END; errors carry the
    /// typed failure and end the stream.
    pub async fn next(&mut self) -> Option<Result<Value, DirtyError>> {
        if self.done {
            return None;
        }

        if let Some(frame) = self.pending.take() {
            if let Err(err) = self.client.send(&frame).await {
                self.done = true;
                return Some(Err(err));
            }
        }

        match self.client.receive().await {
            Ok(reply) => match reply.msg_type {
                MsgType::Chunk => match reply.data() {
                    Ok(data) => Some(Ok(data.clone())),
                    Err(err) => {
                        self.client.conn = None;
                        self.done = true;
                        Some(Err(DirtyError::from(err)))
                    }
                },
                MsgType::End => {
                    self.done = true;
                    None
                }
                MsgType::Error => {
                    self.done = true;
                    match reply.dirty_error() {
                        Ok(err) => Some(Err(err)),
                        Err(protocol_err) => Some(Err(DirtyError::from(protocol_err))),
                    }
                }
                other => {
                    self.client.conn = None;
                    self.done = true;
                    Some(Err(DirtyError::from(ProtocolError::UnexpectedMessage {
                        found: other,
                    })))
                }
            },
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }

    /// Collect the remaining items, failing on the first error.
    pub async fn drain(mut self) -> Result<Vec<Value>, DirtyError> {
        let mut values = Vec::new();
        while let Some(item) = self.next().await {
            values.push(item?);
        }
        Ok(values)
    }
}

impl Drop for AsyncCallStream<'_> {
    fn drop(&mut self) {
        // An abandoned stream leaves replies in flight; drop the connection
        // rather than let them surface on a later call.
        if !self.done {
            self.client.conn = None;
        }
    }
}
