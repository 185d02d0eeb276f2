//! soot: a supervised dirty pool for long-running, stateful work.
//!
//! Usage:
//!     soot serve --app counter:CounterApp --workers 4
//!     soot ctl status
//!
//! The hidden `worker` subcommand is how the arbiter spawns its children:
//! the same binary, same app registry, different role.

mod apps;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use soot_arbiter::{Arbiter, WorkerCommand};
use soot_client::DirtyClient;
use soot_logging::{init_logging, LogConfig};
use soot_protocol::{Value, SOCKET_ENV_VAR, WORKER_BOOT_ERROR};
use soot_worker::{WorkerConfig, WorkerProcess};

#[derive(Parser)]
#[command(name = "soot", about = "Dirty worker pool for long-running, stateful work")]
struct Cli {
    /// Mirror file-level logging on stderr.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dirty arbiter and its worker pool.
    Serve(ServeArgs),
    /// Internal: one dirty worker, spawned by the arbiter.
    #[command(hide = true)]
    Worker(WorkerArgs),
    /// Operator commands against a running arbiter.
    Ctl(CtlArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// App spec, `module:Class` or `module:Class:N`; repeatable.
    #[arg(long = "app", value_name = "SPEC")]
    apps: Vec<String>,

    /// Worker pool size.
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Execution threads per worker.
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Per-request deadline in seconds; 0 disables.
    #[arg(long, default_value_t = 30.0)]
    timeout: f64,

    /// Shutdown drain window in seconds.
    #[arg(long = "graceful-timeout", default_value_t = 30.0)]
    graceful_timeout: f64,

    /// Listen here instead of the per-arbiter temp directory.
    #[arg(long)]
    socket_path: Option<PathBuf>,
}

#[derive(Args)]
struct WorkerArgs {
    #[arg(long)]
    socket_path: PathBuf,

    #[arg(long)]
    heartbeat_path: PathBuf,

    #[arg(long)]
    age: u64,

    /// Comma-separated import paths to host.
    #[arg(long)]
    apps: String,

    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Per-request deadline in milliseconds; 0 disables.
    #[arg(long, default_value_t = 0)]
    timeout_ms: u64,
}

#[derive(Args)]
struct CtlArgs {
    /// Arbiter socket path; defaults to $SOOT_DIRTY_SOCKET.
    #[arg(long, env = SOCKET_ENV_VAR)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: CtlCommand,
}

#[derive(Subcommand)]
enum CtlCommand {
    /// Pool state snapshot.
    Status,
    /// Spawn additional workers.
    Add {
        #[arg(default_value_t = 1)]
        count: i64,
    },
    /// Retire workers (never below the per-app floor).
    Remove {
        #[arg(default_value_t = 1)]
        count: i64,
    },
    /// Gracefully terminate one worker.
    Kill { pid: u32 },
    /// Blue/green reload of the pool.
    Reload,
    /// Stop the arbiter and its workers.
    Shutdown {
        /// Skip the graceful drain.
        #[arg(long)]
        quick: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Serve(args) => match serve(args, cli.verbose) {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("soot serve failed: {err:#}");
                1
            }
        },
        Command::Worker(args) => worker(args, cli.verbose),
        Command::Ctl(args) => match ctl(args) {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("soot ctl failed: {err:#}");
                1
            }
        },
    };
    std::process::exit(code);
}

fn serve(args: ServeArgs, verbose: bool) -> Result<()> {
    let log = init_logging(LogConfig {
        app_name: "soot-arbiter",
        verbose,
    })?;

    let cfg = soot_app::PoolConfig {
        apps: args.apps,
        workers: args.workers,
        threads: args.threads.max(1),
        timeout: seconds_opt(args.timeout),
        graceful_timeout: Duration::from_secs_f64(args.graceful_timeout.max(0.0)),
    };
    let registry = apps::builtin_registry()?;
    let worker_command =
        WorkerCommand::current_exe("worker").context("failed to locate the soot executable")?;

    let mut arbiter = Arbiter::new(cfg, &registry, worker_command)?.with_log_handle(log);
    if let Some(path) = args.socket_path {
        arbiter = arbiter.with_socket_path(path);
    }

    // Advertise the socket for anything this process starts later.
    std::env::set_var(SOCKET_ENV_VAR, arbiter.socket_path());
    tracing::info!(socket = %arbiter.socket_path().display(), "starting dirty arbiter");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build arbiter runtime")?;
    runtime.block_on(arbiter.run())
}

fn worker(args: WorkerArgs, verbose: bool) -> i32 {
    let log = match init_logging(LogConfig {
        app_name: "soot-worker",
        verbose,
    }) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("soot worker failed to set up logging: {err:#}");
            return WORKER_BOOT_ERROR;
        }
    };

    let registry = match apps::builtin_registry() {
        Ok(registry) => registry,
        Err(err) => {
            tracing::error!("failed to build app registry: {err:#}");
            return WORKER_BOOT_ERROR;
        }
    };

    let config = WorkerConfig {
        socket_path: args.socket_path,
        heartbeat_path: args.heartbeat_path,
        age: args.age,
        apps: args
            .apps
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        threads: args.threads.max(1),
        timeout: match args.timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        },
    };

    WorkerProcess::new(config, registry)
        .with_log_handle(log)
        .run()
}

fn ctl(args: CtlArgs) -> Result<()> {
    let socket = args
        .socket
        .context("no arbiter socket: pass --socket or set SOOT_DIRTY_SOCKET")?;
    let client = DirtyClient::new(socket);

    let reply = match args.command {
        CtlCommand::Status => client.status()?,
        CtlCommand::Add { count } => client.add_workers(count)?,
        CtlCommand::Remove { count } => client.remove_workers(count)?,
        CtlCommand::Kill { pid } => client.kill_worker(pid)?,
        CtlCommand::Reload => client.reload()?,
        CtlCommand::Shutdown { quick } => client.shutdown(!quick)?,
    };

    println!("{}", serde_json::to_string_pretty(&value_to_json(&reply))?);
    Ok(())
}

fn seconds_opt(seconds: f64) -> Option<Duration> {
    if seconds <= 0.0 {
        None
    } else {
        Some(Duration::from_secs_f64(seconds))
    }
}

/// Render a TLV value as JSON for operator output. Bytes become arrays of
/// numbers; non-finite floats become null, like JSON itself.
fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(n) => serde_json::Value::from(*n),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(bytes) => {
            serde_json::Value::Array(bytes.iter().map(|b| serde_json::Value::from(*b)).collect())
        }
        Value::List(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Dict(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_disables() {
        assert_eq!(seconds_opt(0.0), None);
        assert_eq!(seconds_opt(-1.0), None);
        assert_eq!(seconds_opt(1.5), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn json_rendering_covers_every_kind() {
        let mut map = std::collections::BTreeMap::new();
        map.insert("n".to_string(), Value::Int(1));
        map.insert("f".to_string(), Value::Float(0.5));
        map.insert("s".to_string(), Value::Str("x".into()));
        map.insert("b".to_string(), Value::Bytes(vec![1, 2]));
        map.insert("l".to_string(), Value::List(vec![Value::Bool(true), Value::Null]));
        let json = value_to_json(&Value::Dict(map));
        assert_eq!(
            json,
            serde_json::json!({"n": 1, "f": 0.5, "s": "x", "b": [1, 2], "l": [true, null]})
        );
    }
}
