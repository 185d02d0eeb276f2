//! Worker process: socket service and request execution.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use soot_app::{App, AppRegistry, Hooks, Outcome, ValueStream, WorkerView};
use soot_logging::LogHandle;
use soot_protocol::{
    read_frame_async, write_frame_async, DirtyError, Frame, MsgType, ProtocolError, Request,
    WORKER_BOOT_ERROR,
};

use crate::heartbeat::Heartbeat;

/// Capacity of the channel between a streaming iterator on the execution
/// pool and the event loop writing CHUNK frames. This is the stream's
/// backpressure window.
const STREAM_BUFFER: usize = 32;

/// Heartbeat cadence when no request timeout is configured.
const IDLE_HEARTBEAT: Duration = Duration::from_secs(30);

/// Worker process configuration, normally assembled from the spawn
/// arguments the arbiter passes.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub socket_path: PathBuf,
    pub heartbeat_path: PathBuf,
    /// Monotonic spawn counter assigned by the arbiter.
    pub age: u64,
    /// Import paths of the apps this worker hosts.
    pub apps: Vec<String>,
    /// Execution pool size.
    pub threads: usize,
    /// Per-request deadline; `None` disables.
    pub timeout: Option<Duration>,
}

impl WorkerConfig {
    fn heartbeat_interval(&self) -> Duration {
        match self.timeout {
            Some(t) => (t / 2).max(Duration::from_millis(250)),
            None => IDLE_HEARTBEAT,
        }
    }
}

/// How the worker was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    Running,
    /// Stop accepting, let in-flight requests finish.
    Graceful,
    /// Stop now, drop in-flight work.
    Immediate,
}

struct Shared {
    apps: HashMap<String, Arc<dyn App>>,
    exec: Arc<Semaphore>,
    heartbeat: Heartbeat,
    timeout: Option<Duration>,
}

/// A dirty worker process: hosts apps and serves the arbiter link.
pub struct WorkerProcess {
    config: WorkerConfig,
    registry: AppRegistry,
    hooks: Hooks,
    log_handle: Option<LogHandle>,
}

impl WorkerProcess {
    pub fn new(config: WorkerConfig, registry: AppRegistry) -> Self {
        Self {
            config,
            registry,
            hooks: Hooks::default(),
            log_handle: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_log_handle(mut self, handle: LogHandle) -> Self {
        self.log_handle = Some(handle);
        self
    }

    /// Run the worker to completion and return its exit code. Installs the
    /// signal-driven lifecycle: TERM drains, QUIT/INT/ABRT stop
    /// immediately, USR1 reopens logs.
    pub fn run(self) -> i32 {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(err) => {
                error!(%err, "failed to build worker runtime");
                return WORKER_BOOT_ERROR;
            }
        };

        runtime.block_on(async {
            let (tx, rx) = watch::channel(ShutdownKind::Running);
            for (kind, mode) in [
                (SignalKind::terminate(), ShutdownKind::Graceful),
                (SignalKind::quit(), ShutdownKind::Immediate),
                (SignalKind::interrupt(), ShutdownKind::Immediate),
                (SignalKind::from_raw(nix::libc::SIGABRT), ShutdownKind::Immediate),
            ] {
                tokio::spawn(forward_signal(kind, mode, tx.clone()));
            }
            if let Some(handle) = self.log_handle.clone() {
                tokio::spawn(reopen_logs_on_usr1(handle));
            }
            self.run_with_shutdown(rx).await
        })
    }

    /// Run with an externally driven shutdown channel. `run` wires signals
    /// to this; tests drive it directly.
    pub async fn run_with_shutdown(self, shutdown: watch::Receiver<ShutdownKind>) -> i32 {
        let shared = match self.boot() {
            Ok(shared) => Arc::new(shared),
            Err(err) => {
                error!("dirty worker boot failed: {err:#}");
                return WORKER_BOOT_ERROR;
            }
        };

        let view = WorkerView {
            pid: std::process::id(),
            age: self.config.age,
            apps: self.config.apps.clone(),
        };
        self.hooks.booted(&view);

        let code = match serve(Arc::clone(&shared), &self.config, shutdown).await {
            Ok(()) => 0,
            Err(err) => {
                error!("dirty worker failed: {err:#}");
                1
            }
        };

        for (path, app) in &shared.apps {
            app.close();
            debug!(app = %path, "closed app");
        }
        let _ = std::fs::remove_file(&self.config.socket_path);
        info!(age = self.config.age, "dirty worker exiting");
        code
    }

    /// Load and initialize the hosted apps. Any failure here is a boot
    /// error: the process exits with the well-known boot code.
    fn boot(&self) -> Result<Shared> {
        let heartbeat = Heartbeat::create(&self.config.heartbeat_path)
            .context("failed to create heartbeat file")?;

        let mut apps: HashMap<String, Arc<dyn App>> = HashMap::new();
        for path in &self.config.apps {
            let app = self
                .registry
                .instantiate(path)
                .with_context(|| format!("failed to load app {path}"))?;
            app.init()
                .with_context(|| format!("failed to initialize app {path}"))?;
            info!(app = %path, "initialized app");
            apps.insert(path.clone(), app);
        }

        Ok(Shared {
            apps,
            exec: Arc::new(Semaphore::new(self.config.threads.max(1))),
            heartbeat,
            timeout: self.config.timeout,
        })
    }
}

async fn forward_signal(kind: SignalKind, mode: ShutdownKind, tx: watch::Sender<ShutdownKind>) {
    match signal(kind) {
        Ok(mut sig) => {
            sig.recv().await;
            let _ = tx.send(mode);
        }
        Err(err) => warn!(%err, "failed to install signal handler"),
    }
}

async fn reopen_logs_on_usr1(handle: LogHandle) {
    let mut sig = match signal(SignalKind::user_defined1()) {
        Ok(sig) => sig,
        Err(err) => {
            warn!(%err, "failed to install SIGUSR1 handler");
            return;
        }
    };
    while sig.recv().await.is_some() {
        if let Err(err) = handle.reopen() {
            warn!(%err, "failed to reopen log file");
        }
    }
}

async fn serve(
    shared: Arc<Shared>,
    config: &WorkerConfig,
    mut shutdown: watch::Receiver<ShutdownKind>,
) -> Result<()> {
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)
            .context("failed to remove stale worker socket")?;
    }
    let listener =
        UnixListener::bind(&config.socket_path).context("failed to bind worker socket")?;
    std::fs::set_permissions(&config.socket_path, std::fs::Permissions::from_mode(0o600))
        .context("failed to restrict worker socket permissions")?;

    info!(
        age = config.age,
        socket = %config.socket_path.display(),
        apps = config.apps.len(),
        "dirty worker listening"
    );

    let beat = {
        let shared = Arc::clone(&shared);
        let period = config.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                shared.heartbeat.touch();
            }
        })
    };

    let parent = nix::unistd::getppid();
    let mut parent_check = tokio::time::interval(Duration::from_secs(1));

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    connections.spawn(handle_connection(
                        Arc::clone(&shared),
                        stream,
                        shutdown.clone(),
                    ));
                }
                Err(err) => warn!(%err, "accept failed"),
            },
            _ = parent_check.tick() => {
                if nix::unistd::getppid() != parent {
                    warn!("arbiter is gone, shutting down");
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    drop(listener);

    let shutdown_kind = *shutdown.borrow();
    match shutdown_kind {
        ShutdownKind::Immediate => {
            connections.shutdown().await;
            info!("dirty worker stopping immediately");
        }
        _ => {
            // Keep the heartbeat alive through the drain so a long
            // in-flight request is not mistaken for a stuck worker.
            info!("dirty worker draining in-flight requests");
            while connections.join_next().await.is_some() {}
        }
    }
    beat.abort();
    Ok(())
}

/// Serve one arbiter connection: a sequence of REQUESTs answered strictly
/// in order.
async fn handle_connection(
    shared: Arc<Shared>,
    stream: UnixStream,
    mut shutdown: watch::Receiver<ShutdownKind>,
) {
    let (mut reader, mut writer) = stream.into_split();
    loop {
        let frame = tokio::select! {
            res = read_frame_async(&mut reader) => match res {
                Ok(frame) => frame,
                Err(err) if err.is_clean_close() => break,
                Err(err) => {
                    warn!(%err, "arbiter link read error");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        };

        shared.heartbeat.touch();
        if let Err(err) = handle_frame(&shared, frame, &mut writer).await {
            warn!(%err, "failed to write reply, dropping link");
            break;
        }
    }
}

async fn handle_frame(
    shared: &Shared,
    frame: Frame,
    writer: &mut OwnedWriteHalf,
) -> Result<(), ProtocolError> {
    let request_id = frame.request_id;

    if frame.msg_type != MsgType::Request {
        let err = DirtyError::worker(
            format!("unexpected message type: {:?}", frame.msg_type),
            None,
        );
        return write_frame_async(writer, &Frame::error(request_id, &err)).await;
    }

    let request = match Request::from_value(&frame.payload) {
        Ok(request) => request,
        Err(err) => {
            return write_frame_async(writer, &Frame::error(request_id, &DirtyError::from(err)))
                .await;
        }
    };

    let Some(app) = shared.apps.get(&request.app_path) else {
        let err = DirtyError::app_not_found(&request.app_path);
        return write_frame_async(writer, &Frame::error(request_id, &err)).await;
    };

    let app_path = request.app_path.clone();
    let action = request.action.clone();
    let dispatch = dispatch_on_pool(shared, Arc::clone(app), request);
    let outcome = match shared.timeout {
        Some(limit) => match tokio::time::timeout(limit, dispatch).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(app = %app_path, %action, "dispatch deadline exceeded");
                let err = DirtyError::timeout("request deadline exceeded", limit.as_secs_f64());
                return write_frame_async(writer, &Frame::error(request_id, &err)).await;
            }
        },
        None => dispatch.await,
    };

    match outcome {
        Ok(Outcome::Value(value)) => {
            write_frame_async(writer, &Frame::response(request_id, value)).await
        }
        Ok(Outcome::Stream(stream)) => {
            stream_reply(shared, request_id, &app_path, &action, writer, stream).await
        }
        Err(err) => {
            error!(app = %app_path, %action, "dispatch failed: {}", err.message);
            write_frame_async(writer, &Frame::error(request_id, &err)).await
        }
    }
}

/// Run one dispatch call on the execution pool.
///
/// The pool permit travels into the blocking closure, so a call that
/// outlives its deadline keeps its execution slot occupied until user code
/// actually returns. User code is never interrupted.
async fn dispatch_on_pool(
    shared: &Shared,
    app: Arc<dyn App>,
    request: Request,
) -> Result<Outcome, DirtyError> {
    let permit = shared
        .exec
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| DirtyError::worker("execution pool closed", None))?;

    let app_path = request.app_path.clone();
    let action = request.action.clone();
    let handle = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        app.dispatch(&request.action, &request.args, &request.kwargs)
    });

    match handle.await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(err)) => Err(DirtyError::app(
            err.to_string(),
            &app_path,
            &action,
            Some(format!("{err:?}")),
        )),
        Err(join_err) => Err(panic_to_app_error(join_err, &app_path, &action)),
    }
}

/// Drain a streaming outcome: the iterator runs on the execution pool and
/// feeds a bounded channel; the event loop writes a CHUNK per element and a
/// single terminal END, or ERROR if the iterator fails part-way.
async fn stream_reply(
    shared: &Shared,
    request_id: u64,
    app_path: &str,
    action: &str,
    writer: &mut OwnedWriteHalf,
    stream: ValueStream,
) -> Result<(), ProtocolError> {
    let permit = match shared.exec.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            let err = DirtyError::worker("execution pool closed", None);
            return write_frame_async(writer, &Frame::error(request_id, &err)).await;
        }
    };

    let (tx, mut rx) = mpsc::channel(STREAM_BUFFER);
    let drain = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        for item in stream {
            if tx.blocking_send(item).is_err() {
                break;
            }
        }
    });

    while let Some(item) = rx.recv().await {
        shared.heartbeat.touch();
        match item {
            Ok(value) => write_frame_async(writer, &Frame::chunk(request_id, value)).await?,
            Err(err) => {
                // Already-sent chunks stand; the error replaces END.
                let err = DirtyError::app(
                    err.to_string(),
                    app_path,
                    action,
                    Some(format!("{err:?}")),
                );
                return write_frame_async(writer, &Frame::error(request_id, &err)).await;
            }
        }
    }

    match drain.await {
        Ok(()) => write_frame_async(writer, &Frame::end(request_id)).await,
        Err(join_err) => {
            let err = panic_to_app_error(join_err, app_path, action);
            write_frame_async(writer, &Frame::error(request_id, &err)).await
        }
    }
}

fn panic_to_app_error(join_err: tokio::task::JoinError, app_path: &str, action: &str) -> DirtyError {
    let reason = match join_err.try_into_panic() {
        Ok(panic) => {
            if let Some(msg) = panic.downcast_ref::<&str>() {
                (*msg).to_string()
            } else if let Some(msg) = panic.downcast_ref::<String>() {
                msg.clone()
            } else {
                "app panicked".to_string()
            }
        }
        Err(err) => err.to_string(),
    };
    DirtyError::app(format!("app panicked: {reason}"), app_path, action, None)
}
