//! The arbiter process: supervision, routing, control.

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use soot_app::{parse_spec, AppRegistry, Hooks, PoolConfig, WorkerView};
use soot_logging::LogHandle;
use soot_protocol::{
    read_frame_async, DirtyError, Frame, Manage, ManageOp, MsgType, ProtocolError, Request,
    StashRequest, Value, WORKER_BOOT_ERROR,
};

use crate::placement::{initial_plan, next_app_set, worker_floor, ResolvedApp};
use crate::router::{
    run_forwarder, write_client, ClientWriter, ForwarderCtx, RoutedRequest, WorkerLink,
};
use crate::stash::Stash;

/// Monitor cadence: heartbeat sweep and pool reconciliation.
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// How the arbiter launches a worker process. The command is invoked with
/// `--socket-path`, `--heartbeat-path`, `--age`, `--apps`, `--threads` and
/// `--timeout-ms` appended; the target must route those into the worker
/// runtime with the same app registry as the host.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-invoke the current executable with a subcommand (the usual
    /// arrangement: one binary is both arbiter and worker).
    pub fn current_exe(subcommand: &str) -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec![OsString::from(subcommand)],
        })
    }
}

/// Events funneled into the arbiter loop: signal shims, worker exits, the
/// periodic monitor, and in-band control requests.
enum Event {
    Monitor,
    Reconcile,
    WorkerExited {
        pid: u32,
        code: Option<i32>,
        signal: Option<i32>,
    },
    Ttin,
    Ttou,
    Reload,
    ReopenLogs,
    Shutdown {
        graceful: bool,
    },
}

/// Handle for programmatically driving a running arbiter.
#[derive(Clone)]
pub struct Controller {
    events: mpsc::UnboundedSender<Event>,
}

impl Controller {
    pub fn shutdown(&self, graceful: bool) {
        let _ = self.events.send(Event::Shutdown { graceful });
    }

    pub fn reload(&self) {
        let _ = self.events.send(Event::Reload);
    }
}

/// One supervised worker, bookkeeping only (the process itself is a child;
/// the link to it lives in `Pool::links`).
struct WorkerHandle {
    pid: u32,
    age: u64,
    apps: BTreeSet<String>,
    socket_path: PathBuf,
    heartbeat_path: PathBuf,
    /// Timeout sweep already sent SIGABRT once.
    aborted: bool,
    /// Deliberately terminated (downscale, reload, kill command): not
    /// counted live, excluded from excess culling.
    stopping: bool,
}

impl WorkerHandle {
    fn view(&self) -> WorkerView {
        WorkerView {
            pid: self.pid,
            age: self.age,
            apps: self.apps.iter().cloned().collect(),
        }
    }
}

/// Pool state owned by the arbiter loop.
struct Pool {
    workers: HashMap<u32, WorkerHandle>,
    links: HashMap<u32, WorkerLink>,
    /// Rotating pid queue per app path: pop front, push back = round robin.
    app_worker_map: HashMap<String, VecDeque<u32>>,
    /// App sets of dead workers, consumed FIFO by the next spawns.
    pending_respawns: VecDeque<BTreeSet<String>>,
    /// Target pool size.
    num_workers: usize,
    /// Lower bound on `num_workers`.
    floor: usize,
    worker_age: u64,
}

impl Pool {
    fn new(num_workers: usize, floor: usize) -> Self {
        Self {
            workers: HashMap::new(),
            links: HashMap::new(),
            app_worker_map: HashMap::new(),
            pending_respawns: VecDeque::new(),
            num_workers,
            floor,
            worker_age: 0,
        }
    }

    fn register_worker(&mut self, handle: WorkerHandle, link: WorkerLink) {
        for app in &handle.apps {
            self.app_worker_map
                .entry(app.clone())
                .or_default()
                .push_back(handle.pid);
        }
        self.links.insert(handle.pid, link);
        self.workers.insert(handle.pid, handle);
    }

    /// Remove a dead worker: queue its app set for respawn, drop it from
    /// every map, and poison its link so queued requests fail fast.
    ///
    /// Only crashes queue a respawn set. A deliberately terminated worker
    /// (downscale, reload, kill command) queuing one would shadow a real
    /// crash's set at the front of the FIFO while the pool is full, leaving
    /// a limited app unhosted with no spawn left to fix it.
    fn remove_worker(&mut self, pid: u32) -> Option<WorkerHandle> {
        let handle = self.workers.remove(&pid)?;
        if !handle.stopping {
            self.pending_respawns.push_back(handle.apps.clone());
        }
        for pids in self.app_worker_map.values_mut() {
            pids.retain(|p| *p != pid);
        }
        if let Some(link) = self.links.remove(&pid) {
            link.dead.store(true, Ordering::Release);
        }
        Some(handle)
    }

    /// Round-robin pick among the workers hosting an app.
    fn pick_worker(&mut self, app_path: &str) -> Option<u32> {
        let queue = self.app_worker_map.get_mut(app_path)?;
        let pid = queue.pop_front()?;
        queue.push_back(pid);
        Some(pid)
    }

    fn hosted_counts(&self) -> HashMap<String, usize> {
        self.app_worker_map
            .iter()
            .map(|(path, pids)| (path.clone(), pids.len()))
            .collect()
    }

    fn live_count(&self) -> usize {
        self.workers.values().filter(|w| !w.stopping).count()
    }

    /// Mark up to `count` of the youngest live workers as stopping and
    /// return their pids, youngest first.
    fn cull_youngest(&mut self, count: usize) -> Vec<u32> {
        let mut live: Vec<(u64, u32)> = self
            .workers
            .values()
            .filter(|w| !w.stopping)
            .map(|w| (w.age, w.pid))
            .collect();
        live.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        let picked: Vec<u32> = live.into_iter().take(count).map(|(_, pid)| pid).collect();
        for pid in &picked {
            if let Some(handle) = self.workers.get_mut(pid) {
                handle.stopping = true;
            }
        }
        picked
    }

    /// Shrink the target, clamped at the floor. Returns the new target and
    /// whether the floor blocked the request.
    fn shrink(&mut self, count: usize) -> (usize, bool) {
        let want = self.num_workers.saturating_sub(count);
        if want < self.floor {
            self.num_workers = self.floor;
            (self.num_workers, true)
        } else {
            self.num_workers = want;
            (self.num_workers, false)
        }
    }
}

/// Immutable bits a client session needs.
struct SessionCtx {
    state: Arc<Mutex<Pool>>,
    stash: Arc<Mutex<Stash>>,
    specs: Arc<Vec<ResolvedApp>>,
    events: mpsc::UnboundedSender<Event>,
    arbiter_pid: u32,
    config: PoolConfig,
}

/// The dirty arbiter. Build with [`Arbiter::new`], then [`Arbiter::run`].
pub struct Arbiter {
    cfg: PoolConfig,
    hooks: Hooks,
    worker_command: WorkerCommand,
    specs: Arc<Vec<ResolvedApp>>,
    state: Arc<Mutex<Pool>>,
    stash: Arc<Mutex<Stash>>,
    events: mpsc::UnboundedSender<Event>,
    events_rx: Option<mpsc::UnboundedReceiver<Event>>,
    tmpdir: tempfile::TempDir,
    socket_path: PathBuf,
    log_handle: Option<LogHandle>,
}

impl Arbiter {
    /// Resolve the configuration against the registry and set up state.
    /// Fails on unparseable specs, unregistered apps, or an unusable
    /// socket directory.
    pub fn new(
        cfg: PoolConfig,
        registry: &AppRegistry,
        worker_command: WorkerCommand,
    ) -> Result<Self> {
        let specs = resolve_specs(&cfg.apps, registry)?;
        let floor = worker_floor(&specs);
        let num_workers = if cfg.workers < floor {
            warn!(
                requested = cfg.workers,
                floor, "pool size raised to the per-app worker floor"
            );
            floor
        } else {
            cfg.workers
        };

        let tmpdir = tempfile::Builder::new()
            .prefix("soot-dirty-")
            .tempdir()
            .context("failed to create arbiter temp directory")?;
        let socket_path = tmpdir.path().join("arbiter.sock");

        let (events, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            cfg,
            hooks: Hooks::default(),
            worker_command,
            specs: Arc::new(specs),
            state: Arc::new(Mutex::new(Pool::new(num_workers, floor))),
            stash: Arc::new(Mutex::new(Stash::new())),
            events,
            events_rx: Some(events_rx),
            tmpdir,
            socket_path,
            log_handle: None,
        })
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_log_handle(mut self, handle: LogHandle) -> Self {
        self.log_handle = Some(handle);
        self
    }

    /// Listen somewhere other than the default temp-directory socket.
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn controller(&self) -> Controller {
        Controller {
            events: self.events.clone(),
        }
    }

    /// Run the arbiter until shut down by signal, control command, or
    /// [`Controller::shutdown`].
    pub async fn run(&mut self) -> Result<()> {
        let mut events_rx = self
            .events_rx
            .take()
            .context("arbiter is already running")?;

        self.hooks.starting(&self.socket_path);

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("failed to remove stale arbiter socket")?;
        }
        let listener =
            UnixListener::bind(&self.socket_path).context("failed to bind arbiter socket")?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))
            .context("failed to restrict arbiter socket permissions")?;

        info!(
            pid = std::process::id(),
            socket = %self.socket_path.display(),
            workers = self.state_lock().num_workers,
            apps = self.specs.len(),
            "dirty arbiter listening"
        );

        let plan = initial_plan(&self.specs, self.state_lock().num_workers);
        for set in plan {
            if let Err(err) = self.spawn_worker(set) {
                error!("failed to spawn dirty worker: {err:#}");
            }
        }

        let monitor = {
            let events = self.events.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
                loop {
                    ticker.tick().await;
                    if events.send(Event::Monitor).is_err() {
                        break;
                    }
                }
            })
        };
        self.install_signals();

        let ctx = Arc::new(SessionCtx {
            state: Arc::clone(&self.state),
            stash: Arc::clone(&self.stash),
            specs: Arc::clone(&self.specs),
            events: self.events.clone(),
            arbiter_pid: std::process::id(),
            config: self.cfg.clone(),
        });

        let graceful = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_session(Arc::clone(&ctx), stream));
                    }
                    Err(err) => warn!(%err, "accept failed"),
                },
                event = events_rx.recv() => match event {
                    Some(Event::Monitor) => {
                        self.murder_workers();
                        self.manage_workers();
                    }
                    Some(Event::Reconcile) => self.manage_workers(),
                    Some(Event::WorkerExited { pid, code, signal }) => {
                        self.handle_worker_exit(pid, code, signal);
                    }
                    Some(Event::Ttin) => {
                        let target = {
                            let mut pool = self.state_lock();
                            pool.num_workers += 1;
                            pool.num_workers
                        };
                        info!(target, "growing dirty pool");
                        self.manage_workers();
                    }
                    Some(Event::Ttou) => {
                        let (target, clamped) = self.state_lock().shrink(1);
                        if clamped {
                            warn!(
                                floor = target,
                                "cannot shrink dirty pool below the per-app worker floor"
                            );
                        } else {
                            info!(target, "shrinking dirty pool");
                        }
                        self.manage_workers();
                    }
                    Some(Event::Reload) => self.reload(),
                    Some(Event::ReopenLogs) => {
                        if let Some(handle) = &self.log_handle {
                            if let Err(err) = handle.reopen() {
                                warn!(%err, "failed to reopen log file");
                            }
                        }
                    }
                    Some(Event::Shutdown { graceful }) => break graceful,
                    None => break true,
                }
            }
        };

        drop(listener);
        monitor.abort();
        info!(graceful, "dirty arbiter stopping");
        self.stop(graceful, &mut events_rx).await;
        let _ = std::fs::remove_file(&self.socket_path);
        info!("dirty arbiter exiting");
        Ok(())
    }

    fn state_lock(&self) -> MutexGuard<'_, Pool> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn install_signals(&self) {
        let signals: [(SignalKind, fn() -> Event); 7] = [
            (SignalKind::terminate(), || Event::Shutdown { graceful: true }),
            (SignalKind::quit(), || Event::Shutdown { graceful: false }),
            (SignalKind::interrupt(), || Event::Shutdown {
                graceful: false,
            }),
            (SignalKind::hangup(), || Event::Reload),
            (SignalKind::user_defined1(), || Event::ReopenLogs),
            (SignalKind::from_raw(nix::libc::SIGTTIN), || Event::Ttin),
            (SignalKind::from_raw(nix::libc::SIGTTOU), || Event::Ttou),
        ];
        for (kind, make_event) in signals {
            let events = self.events.clone();
            tokio::spawn(async move {
                let mut sig = match unix_signal(kind) {
                    Ok(sig) => sig,
                    Err(err) => {
                        warn!(%err, "failed to install signal handler");
                        return;
                    }
                };
                while sig.recv().await.is_some() {
                    if events.send(make_event()).is_err() {
                        break;
                    }
                }
            });
        }
    }

    /// Spawn one worker hosting `apps` and register it.
    fn spawn_worker(&self, apps: BTreeSet<String>) -> Result<u32> {
        let age = {
            let mut pool = self.state_lock();
            pool.worker_age += 1;
            pool.worker_age
        };
        let socket_path = self.tmpdir.path().join(format!("worker-{age}.sock"));
        let heartbeat_path = self.tmpdir.path().join(format!("worker-{age}.hb"));
        let app_list: Vec<String> = apps.iter().cloned().collect();

        let mut command = tokio::process::Command::new(&self.worker_command.program);
        command
            .args(&self.worker_command.args)
            .arg("--socket-path")
            .arg(&socket_path)
            .arg("--heartbeat-path")
            .arg(&heartbeat_path)
            .arg("--age")
            .arg(age.to_string())
            .arg("--apps")
            .arg(app_list.join(","))
            .arg("--threads")
            .arg(self.cfg.threads.to_string())
            .arg("--timeout-ms")
            .arg(
                self.cfg
                    .timeout
                    .map(|t| t.as_millis())
                    .unwrap_or(0)
                    .to_string(),
            );

        let mut child = command.spawn().context("failed to spawn dirty worker")?;
        let pid = child
            .id()
            .context("spawned dirty worker has no pid")?;

        let events = self.events.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let (code, signal) = match &status {
                Ok(status) => {
                    use std::os::unix::process::ExitStatusExt;
                    (status.code(), status.signal())
                }
                Err(_) => (None, None),
            };
            let _ = events.send(Event::WorkerExited { pid, code, signal });
        });

        let dead = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_forwarder(
            ForwarderCtx {
                pid,
                socket_path: socket_path.clone(),
                dead: Arc::clone(&dead),
                timeout: self.cfg.timeout,
            },
            rx,
        ));

        let handle = WorkerHandle {
            pid,
            age,
            apps,
            socket_path,
            heartbeat_path,
            aborted: false,
            stopping: false,
        };
        let view = handle.view();
        self.state_lock().register_worker(handle, WorkerLink { tx, dead });

        self.hooks.spawned(&view);
        info!(pid, age, apps = ?view.apps, "spawned dirty worker");
        Ok(pid)
    }

    /// Reconcile pool size with the target: spawn up using the placement
    /// policy, cull down youngest-first.
    fn manage_workers(&self) {
        loop {
            let next = {
                let mut pool = self.state_lock();
                if pool.live_count() < pool.num_workers {
                    let hosted = pool.hosted_counts();
                    Some(next_app_set(&self.specs, &hosted, &mut pool.pending_respawns))
                } else {
                    None
                }
            };
            match next {
                Some(set) => {
                    if let Err(err) = self.spawn_worker(set) {
                        error!("failed to spawn dirty worker: {err:#}");
                        break;
                    }
                }
                None => break,
            }
        }

        let excess = {
            let mut pool = self.state_lock();
            let live = pool.live_count();
            let num_workers = pool.num_workers;
            if live > num_workers {
                pool.cull_youngest(live - num_workers)
            } else {
                Vec::new()
            }
        };
        for pid in excess {
            info!(pid, "terminating excess dirty worker");
            send_signal(pid, Signal::SIGTERM);
        }
    }

    /// Heartbeat sweep: SIGABRT a stuck worker once, SIGKILL it next tick.
    fn murder_workers(&self) {
        let Some(limit) = self.cfg.timeout else {
            return;
        };
        let limit_secs = limit.as_secs_f64();

        let victims: Vec<(u32, bool)> = {
            let mut pool = self.state_lock();
            let mut found = Vec::new();
            for handle in pool.workers.values_mut() {
                let Some(age) = heartbeat_age(&handle.heartbeat_path) else {
                    continue;
                };
                if age <= limit_secs {
                    continue;
                }
                found.push((handle.pid, handle.aborted));
                handle.aborted = true;
            }
            found
        };

        for (pid, already_aborted) in victims {
            if already_aborted {
                send_signal(pid, Signal::SIGKILL);
            } else {
                error!(pid, "DIRTY WORKER TIMEOUT");
                send_signal(pid, Signal::SIGABRT);
            }
        }
    }

    fn handle_worker_exit(&self, pid: u32, code: Option<i32>, signal: Option<i32>) {
        match (code, signal) {
            (Some(0), _) => info!(pid, "dirty worker exited"),
            (Some(code), _) if code == WORKER_BOOT_ERROR => {
                error!(pid, "dirty worker failed to boot")
            }
            (Some(code), _) => warn!(pid, code, "dirty worker exited abnormally"),
            (None, Some(signal)) => warn!(pid, signal, "dirty worker killed by signal"),
            (None, None) => warn!(pid, "dirty worker exited with unknown status"),
        }
        self.cleanup_worker(pid);
        self.manage_workers();
    }

    fn cleanup_worker(&self, pid: u32) {
        let removed = self.state_lock().remove_worker(pid);
        if let Some(handle) = removed {
            let _ = std::fs::remove_file(&handle.socket_path);
            let _ = std::fs::remove_file(&handle.heartbeat_path);
            self.hooks.exited(&handle.view());
        }
    }

    /// Blue/green reload: take the old generation out of routing, spawn a
    /// full fresh generation, then terminate the old one gracefully.
    fn reload(&self) {
        info!("reloading dirty workers");
        let old: Vec<u32> = {
            let mut pool = self.state_lock();
            let pids: Vec<u32> = pool
                .workers
                .values()
                .filter(|w| !w.stopping)
                .map(|w| w.pid)
                .collect();
            for pid in &pids {
                if let Some(handle) = pool.workers.get_mut(pid) {
                    handle.stopping = true;
                }
            }
            for pids_queue in pool.app_worker_map.values_mut() {
                pids_queue.retain(|p| !pids.contains(p));
            }
            pids
        };

        let plan = initial_plan(&self.specs, self.state_lock().num_workers);
        for set in plan {
            if let Err(err) = self.spawn_worker(set) {
                error!("failed to spawn replacement dirty worker: {err:#}");
            }
        }

        for pid in old {
            send_signal(pid, Signal::SIGTERM);
        }
    }

    /// Stop every worker: signal, drain up to the graceful window, kill
    /// the rest.
    async fn stop(&self, graceful: bool, events_rx: &mut mpsc::UnboundedReceiver<Event>) {
        let sig = if graceful {
            Signal::SIGTERM
        } else {
            Signal::SIGQUIT
        };
        let pids: Vec<u32> = {
            let mut pool = self.state_lock();
            let pids: Vec<u32> = pool.workers.keys().copied().collect();
            for pid in &pids {
                if let Some(handle) = pool.workers.get_mut(pid) {
                    handle.stopping = true;
                }
            }
            pids
        };
        for pid in &pids {
            send_signal(*pid, sig);
        }

        let deadline = Instant::now() + self.cfg.graceful_timeout;
        while Instant::now() < deadline {
            if self.state_lock().workers.is_empty() {
                break;
            }
            match tokio::time::timeout(Duration::from_millis(100), events_rx.recv()).await {
                Ok(Some(Event::WorkerExited { pid, .. })) => self.cleanup_worker(pid),
                Ok(Some(_)) | Err(_) => {}
                Ok(None) => break,
            }
        }

        let survivors: Vec<u32> = self.state_lock().workers.keys().copied().collect();
        for pid in survivors {
            warn!(pid, "dirty worker did not stop in time, killing");
            send_signal(pid, Signal::SIGKILL);
            self.cleanup_worker(pid);
        }
    }
}

fn resolve_specs(spec_strings: &[String], registry: &AppRegistry) -> Result<Vec<ResolvedApp>> {
    let mut resolved: Vec<ResolvedApp> = Vec::new();
    for raw in spec_strings {
        let spec = parse_spec(raw)?;
        if resolved.iter().any(|r| r.import_path == spec.import_path) {
            warn!(app = %spec.import_path, "duplicate app spec ignored");
            continue;
        }
        if !registry.contains(&spec.import_path) {
            bail!("app not registered: {}", spec.import_path);
        }
        let worker_count = match spec.worker_count {
            Some(count) => Some(count),
            None => registry.registered_workers(&spec.import_path)?,
        };
        resolved.push(ResolvedApp {
            import_path: spec.import_path,
            worker_count,
        });
    }
    Ok(resolved)
}

fn send_signal(pid: u32, sig: Signal) {
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(pid, %err, "failed to signal dirty worker"),
    }
}

/// Seconds since the worker's last heartbeat; `None` while the file is not
/// readable yet (worker still booting).
fn heartbeat_age(path: &Path) -> Option<f64> {
    let mtime = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(
        SystemTime::now()
            .duration_since(mtime)
            .unwrap_or_default()
            .as_secs_f64(),
    )
}

// ----------------------------------------------------------------------------
// Client sessions
// ----------------------------------------------------------------------------

async fn handle_session(ctx: Arc<SessionCtx>, stream: UnixStream) {
    debug!("client session opened");
    let (mut reader, writer) = stream.into_split();
    let writer: ClientWriter = Arc::new(tokio::sync::Mutex::new(writer));

    loop {
        let frame = match read_frame_async(&mut reader).await {
            Ok(frame) => frame,
            Err(err) if err.is_clean_close() => break,
            Err(err) => {
                // Malformed traffic poisons the session; no partial
                // replies are delivered.
                warn!(%err, "client session error");
                break;
            }
        };

        let reply = match frame.msg_type {
            MsgType::Request => route_request(&ctx, &frame, &writer),
            MsgType::Stash => Some(handle_stash(&ctx, &frame)),
            MsgType::Status => Some(build_status(&ctx, frame.request_id)),
            MsgType::Manage => Some(handle_manage(&ctx, &frame)),
            other => Some(Frame::error(
                frame.request_id,
                &DirtyError::from(ProtocolError::UnexpectedMessage { found: other }),
            )),
        };

        if let Some(reply) = reply {
            if let Err(err) = write_client(&writer, &reply).await {
                debug!(%err, "client went away");
                break;
            }
        }
    }
    debug!("client session closed");
}

/// Pick a worker for a REQUEST and enqueue it on that worker's link.
/// Returns an immediate error frame when routing is impossible.
fn route_request(ctx: &SessionCtx, frame: &Frame, writer: &ClientWriter) -> Option<Frame> {
    let request = match Request::from_value(&frame.payload) {
        Ok(request) => request,
        Err(err) => return Some(Frame::error(frame.request_id, &DirtyError::from(err))),
    };

    if !ctx
        .specs
        .iter()
        .any(|spec| spec.import_path == request.app_path)
    {
        return Some(Frame::error(
            frame.request_id,
            &DirtyError::app_not_found(&request.app_path),
        ));
    }

    let mut pool = ctx.state.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(pid) = pool.pick_worker(&request.app_path) else {
        return Some(Frame::error(
            frame.request_id,
            &DirtyError::no_workers_available(&request.app_path),
        ));
    };
    let Some(link) = pool.links.get(&pid) else {
        return Some(Frame::error(
            frame.request_id,
            &DirtyError::worker("worker link unavailable", Some(pid)),
        ));
    };

    let routed = RoutedRequest {
        request_id: frame.request_id,
        frame: frame.clone(),
        writer: Arc::clone(writer),
    };
    if link.tx.send(routed).is_err() {
        return Some(Frame::error(
            frame.request_id,
            &DirtyError::worker("dirty worker unavailable", Some(pid)),
        ));
    }
    debug!(pid, app = %request.app_path, action = %request.action, "routed request");
    None
}

fn handle_stash(ctx: &SessionCtx, frame: &Frame) -> Frame {
    let request = match StashRequest::from_value(&frame.payload) {
        Ok(request) => request,
        Err(err) => return Frame::error(frame.request_id, &DirtyError::from(err)),
    };
    let result = ctx
        .stash
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .handle(&request);
    match result {
        Ok(value) => Frame::response(frame.request_id, value),
        Err(err) => Frame::error(frame.request_id, &err),
    }
}

fn build_status(ctx: &SessionCtx, request_id: u64) -> Frame {
    let pool = ctx.state.lock().unwrap_or_else(PoisonError::into_inner);

    let mut workers: Vec<&WorkerHandle> = pool.workers.values().collect();
    workers.sort_unstable_by_key(|w| w.age);
    let worker_list: Vec<Value> = workers
        .into_iter()
        .map(|w| {
            let mut entry = BTreeMap::new();
            entry.insert("pid".to_string(), Value::Int(w.pid as i64));
            entry.insert("age".to_string(), Value::Int(w.age as i64));
            entry.insert(
                "apps".to_string(),
                Value::List(w.apps.iter().map(|a| Value::Str(a.clone())).collect()),
            );
            entry.insert("aborted".to_string(), Value::Bool(w.aborted));
            entry.insert("stopping".to_string(), Value::Bool(w.stopping));
            Value::Dict(entry)
        })
        .collect();

    let mut apps = BTreeMap::new();
    for spec in ctx.specs.iter() {
        let mut entry = BTreeMap::new();
        entry.insert(
            "worker_count".to_string(),
            match spec.worker_count {
                Some(count) => Value::Int(count as i64),
                None => Value::Null,
            },
        );
        let pids = pool
            .app_worker_map
            .get(&spec.import_path)
            .map(|pids| pids.iter().map(|p| Value::Int(*p as i64)).collect())
            .unwrap_or_default();
        entry.insert("pids".to_string(), Value::List(pids));
        apps.insert(spec.import_path.clone(), Value::Dict(entry));
    }

    let mut config = BTreeMap::new();
    config.insert(
        "dirty_workers".to_string(),
        Value::Int(pool.num_workers as i64),
    );
    config.insert(
        "dirty_threads".to_string(),
        Value::Int(ctx.config.threads as i64),
    );
    config.insert(
        "dirty_timeout".to_string(),
        Value::Float(ctx.config.timeout_secs()),
    );
    config.insert(
        "dirty_graceful_timeout".to_string(),
        Value::Float(ctx.config.graceful_timeout.as_secs_f64()),
    );
    config.insert(
        "dirty_apps".to_string(),
        Value::List(
            ctx.config
                .apps
                .iter()
                .map(|a| Value::Str(a.clone()))
                .collect(),
        ),
    );

    let mut result = BTreeMap::new();
    result.insert("pid".to_string(), Value::Int(ctx.arbiter_pid as i64));
    result.insert("num_workers".to_string(), Value::Int(pool.num_workers as i64));
    result.insert("alive_workers".to_string(), Value::Int(pool.workers.len() as i64));
    result.insert("workers".to_string(), Value::List(worker_list));
    result.insert("apps".to_string(), Value::Dict(apps));
    result.insert("config".to_string(), Value::Dict(config));
    result.insert(
        "stash_tables".to_string(),
        Value::Int(
            ctx.stash
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .table_count() as i64,
        ),
    );

    Frame::response(request_id, Value::Dict(result))
}

fn handle_manage(ctx: &SessionCtx, frame: &Frame) -> Frame {
    let manage = match Manage::from_value(&frame.payload) {
        Ok(manage) => manage,
        Err(err) => return Frame::error(frame.request_id, &DirtyError::from(err)),
    };

    match manage.op {
        ManageOp::Add => {
            let count = manage.count.max(1) as usize;
            let target = {
                let mut pool = ctx.state.lock().unwrap_or_else(PoisonError::into_inner);
                pool.num_workers += count;
                pool.num_workers
            };
            info!(target, "growing dirty pool (manage)");
            let _ = ctx.events.send(Event::Reconcile);
            num_workers_reply(frame.request_id, target)
        }
        ManageOp::Remove => {
            let count = manage.count.max(1) as usize;
            let (target, clamped) = ctx
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .shrink(count);
            if clamped {
                warn!(
                    floor = target,
                    "cannot shrink dirty pool below the per-app worker floor"
                );
            } else {
                info!(target, "shrinking dirty pool (manage)");
            }
            let _ = ctx.events.send(Event::Reconcile);
            num_workers_reply(frame.request_id, target)
        }
        ManageOp::Kill => {
            let Some(pid) = manage.pid else {
                return Frame::error(
                    frame.request_id,
                    &DirtyError::generic("kill requires a pid"),
                );
            };
            let known = {
                let mut pool = ctx.state.lock().unwrap_or_else(PoisonError::into_inner);
                match pool.workers.get_mut(&pid) {
                    Some(handle) => {
                        handle.stopping = true;
                        true
                    }
                    None => false,
                }
            };
            if !known {
                return Frame::error(
                    frame.request_id,
                    &DirtyError::generic(format!("no dirty worker with pid {pid}")),
                );
            }
            info!(pid, "terminating dirty worker (manage)");
            send_signal(pid, Signal::SIGTERM);
            let _ = ctx.events.send(Event::Reconcile);
            Frame::response(frame.request_id, Value::Bool(true))
        }
        ManageOp::Reload => {
            let _ = ctx.events.send(Event::Reload);
            Frame::response(frame.request_id, Value::Bool(true))
        }
        ManageOp::Shutdown => {
            let _ = ctx.events.send(Event::Shutdown {
                graceful: manage.graceful,
            });
            Frame::response(frame.request_id, Value::Bool(true))
        }
    }
}

fn num_workers_reply(request_id: u64, target: usize) -> Frame {
    let mut result = BTreeMap::new();
    result.insert("num_workers".to_string(), Value::Int(target as i64));
    Frame::response(request_id, Value::Dict(result))
}
