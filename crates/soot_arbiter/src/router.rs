//! Per-worker request forwarding.
//!
//! Each worker has one long-lived link owned by a forwarder task. Requests
//! queue on the link's mailbox and are served strictly FIFO: one request is
//! written, then every reply frame is relayed verbatim to that request's
//! client until a terminal message, then the next request starts. Replies
//! on a link therefore arrive in request order.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use soot_protocol::{read_frame_async, write_frame_async, DirtyError, Frame};

/// How long a freshly spawned worker gets to bring up its socket.
pub(crate) const BOOT_GRACE: Duration = Duration::from_secs(5);
const BOOT_POLL: Duration = Duration::from_millis(100);

/// Write half of a client session, shared between the session task and the
/// forwarders relaying replies to it.
pub(crate) type ClientWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

pub(crate) async fn write_client(writer: &ClientWriter, frame: &Frame) -> Result<(), soot_protocol::ProtocolError> {
    let mut guard = writer.lock().await;
    write_frame_async(&mut *guard, frame).await
}

/// One queued (request, client writer) pair.
pub(crate) struct RoutedRequest {
    pub request_id: u64,
    pub frame: Frame,
    pub writer: ClientWriter,
}

/// Arbiter-side handle to a worker link.
pub(crate) struct WorkerLink {
    pub tx: mpsc::UnboundedSender<RoutedRequest>,
    pub dead: Arc<AtomicBool>,
}

pub(crate) struct ForwarderCtx {
    pub pid: u32,
    pub socket_path: PathBuf,
    pub dead: Arc<AtomicBool>,
    pub timeout: Option<Duration>,
}

/// The per-worker consumer task. Ends when the mailbox sender is dropped
/// (worker removed); queued requests drain with WorkerError replies once
/// the dead flag is up.
pub(crate) async fn run_forwarder(ctx: ForwarderCtx, mut rx: mpsc::UnboundedReceiver<RoutedRequest>) {
    let mut conn: Option<UnixStream> = None;

    while let Some(request) = rx.recv().await {
        if ctx.dead.load(Ordering::Acquire) {
            let err = DirtyError::worker("dirty worker exited", Some(ctx.pid));
            reply_error(&request, &err).await;
            continue;
        }

        if conn.is_none() {
            match connect_worker(&ctx.socket_path, ctx.pid).await {
                Ok(stream) => conn = Some(stream),
                Err(err) => {
                    reply_error(&request, &err).await;
                    continue;
                }
            }
        }
        let Some(stream) = conn.as_mut() else {
            continue;
        };

        if let Err(err) = write_frame_async(stream, &request.frame).await {
            warn!(pid = ctx.pid, %err, "worker link write failed");
            conn = None;
            let err = DirtyError::worker(format!("worker link write failed: {err}"), Some(ctx.pid));
            reply_error(&request, &err).await;
            continue;
        }

        if !forward_replies(&ctx, stream, &request).await {
            conn = None;
        }
    }
}

/// Relay reply frames for one request until its terminal message.
///
/// Returns whether the link is still usable. A reply deadline or link
/// failure poisons the link; a client that went away does not — the link
/// is drained to the terminal so the next queued request starts clean.
async fn forward_replies(ctx: &ForwarderCtx, stream: &mut UnixStream, request: &RoutedRequest) -> bool {
    let mut client_ok = true;
    loop {
        let read = read_frame_async(stream);
        let reply = match ctx.timeout {
            Some(limit) => match tokio::time::timeout(limit, read).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(pid = ctx.pid, "reply deadline exceeded, dropping worker link");
                    let err =
                        DirtyError::timeout("request deadline exceeded", limit.as_secs_f64());
                    reply_error(request, &err).await;
                    return false;
                }
            },
            None => read.await,
        };

        match reply {
            Ok(frame) => {
                let terminal = frame.msg_type.is_terminal();
                if client_ok {
                    if let Err(err) = write_client(&request.writer, &frame).await {
                        // Client gone mid-stream: stop forwarding, keep
                        // draining. The worker runs the call to completion
                        // either way.
                        debug!(pid = ctx.pid, %err, "client went away mid-reply");
                        client_ok = false;
                    }
                }
                if terminal {
                    return true;
                }
            }
            Err(err) => {
                warn!(pid = ctx.pid, %err, "worker link failed mid-reply");
                let err = DirtyError::worker(format!("worker link failed: {err}"), Some(ctx.pid));
                reply_error(request, &err).await;
                return false;
            }
        }
    }
}

async fn reply_error(request: &RoutedRequest, err: &DirtyError) {
    let frame = Frame::error(request.request_id, err);
    if let Err(write_err) = write_client(&request.writer, &frame).await {
        debug!(%write_err, "could not deliver error to client");
    }
}

/// Connect to a worker socket, waiting out the boot grace window.
async fn connect_worker(socket_path: &Path, pid: u32) -> Result<UnixStream, DirtyError> {
    let deadline = Instant::now() + BOOT_GRACE;
    loop {
        match UnixStream::connect(socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if Instant::now() >= deadline {
                    return Err(DirtyError::worker(
                        format!(
                            "worker socket not ready: {} ({err})",
                            socket_path.display()
                        ),
                        Some(pid),
                    ));
                }
                tokio::time::sleep(BOOT_POLL).await;
            }
        }
    }
}
