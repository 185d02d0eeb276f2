//! End-to-end tests: the real binary, real worker processes, real sockets.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use soot_client::{DirtyClient, ErrorKind, Value};

struct Pool {
    child: Child,
    socket_path: PathBuf,
    _dir: tempfile::TempDir,
}

impl Pool {
    fn client(&self) -> DirtyClient {
        DirtyClient::new(&self.socket_path)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn start_pool(extra_args: &[&str]) -> Pool {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("arbiter.sock");

    let mut command = Command::new(env!("CARGO_BIN_EXE_soot"));
    command
        .arg("serve")
        .arg("--app")
        .arg("counter:CounterApp")
        .arg("--app")
        .arg("stream:StreamApp")
        .arg("--app")
        .arg("sleep:SleepApp")
        .arg("--socket-path")
        .arg(&socket_path)
        .args(extra_args)
        .env("SOOT_HOME", dir.path())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let child = command.spawn().expect("failed to start soot serve");

    let deadline = Instant::now() + Duration::from_secs(10);
    while !socket_path.exists() {
        assert!(
            Instant::now() < deadline,
            "arbiter socket never appeared at {}",
            socket_path.display()
        );
        std::thread::sleep(Duration::from_millis(50));
    }

    Pool {
        child,
        socket_path,
        _dir: dir,
    }
}

#[test]
fn unary_calls_hit_the_same_stateful_app() {
    let pool = start_pool(&["--workers", "1"]);
    let client = pool.client();

    let result = client
        .execute(
            "counter:CounterApp",
            "increment",
            vec![Value::Int(5)],
            BTreeMap::new(),
        )
        .unwrap();
    assert_eq!(result, Value::Int(5));

    let result = client
        .execute(
            "counter:CounterApp",
            "increment",
            vec![Value::Int(1)],
            BTreeMap::new(),
        )
        .unwrap();
    assert_eq!(result, Value::Int(6));
}

#[test]
fn streaming_call_yields_letters_in_order() {
    let pool = start_pool(&["--workers", "1"]);
    let client = pool.client();

    let values: Result<Vec<Value>, _> = client
        .execute_stream("stream:StreamApp", "letters", vec![], BTreeMap::new())
        .collect();
    assert_eq!(
        values.unwrap(),
        vec![Value::from("a"), Value::from("b"), Value::from("c")]
    );

    // The connection survives a completed stream.
    let result = client
        .execute("counter:CounterApp", "current", vec![], BTreeMap::new())
        .unwrap();
    assert_eq!(result, Value::Int(0));
}

#[test]
fn slow_call_times_out_quickly() {
    let pool = start_pool(&["--workers", "1", "--timeout", "1"]);
    let client = pool.client();

    let started = Instant::now();
    let err = client
        .execute(
            "sleep:SleepApp",
            "sleep",
            vec![Value::Float(5.0)],
            BTreeMap::new(),
        )
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(err.timeout_secs(), Some(1.0));
    assert!(
        elapsed < Duration::from_millis(2000),
        "timeout took {elapsed:?}"
    );
}

#[test]
fn status_reports_workers_and_their_apps() {
    let pool = start_pool(&["--workers", "2"]);
    let client = pool.client();

    // Workers register at spawn time, before they finish booting.
    let status = client.status().unwrap();
    assert_eq!(status.get("alive_workers"), Some(&Value::Int(2)));

    let workers = status.get("workers").and_then(Value::as_list).unwrap();
    assert_eq!(workers.len(), 2);
    for worker in workers {
        let apps = worker.get("apps").and_then(Value::as_list).unwrap();
        assert!(apps.contains(&Value::from("counter:CounterApp")));
    }

    let config = status.get("config").unwrap();
    assert_eq!(config.get("dirty_workers"), Some(&Value::Int(2)));
    assert_eq!(config.get("dirty_threads"), Some(&Value::Int(1)));
}

#[test]
fn killed_worker_is_replaced_and_serves_again() {
    let pool = start_pool(&["--workers", "1"]);
    let client = pool.client();

    // Warm up and learn the worker pid.
    client
        .execute("counter:CounterApp", "current", vec![], BTreeMap::new())
        .unwrap();
    let status = client.status().unwrap();
    let workers = status.get("workers").and_then(Value::as_list).unwrap();
    let old_pid = workers[0].get("pid").and_then(Value::as_i64).unwrap();

    client.kill_worker(old_pid as u32).unwrap();

    // The replacement eventually serves requests; its counter starts over
    // (state lives and dies with the worker process).
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        assert!(Instant::now() < deadline, "pool never recovered");
        std::thread::sleep(Duration::from_millis(200));

        let status = match client.status() {
            Ok(status) => status,
            Err(_) => continue,
        };
        let workers = status.get("workers").and_then(Value::as_list).unwrap();
        let fresh = workers
            .iter()
            .filter_map(|w| w.get("pid").and_then(Value::as_i64))
            .any(|pid| pid != old_pid);
        if !fresh {
            continue;
        }

        match client.execute("counter:CounterApp", "current", vec![], BTreeMap::new()) {
            Ok(value) => {
                assert_eq!(value, Value::Int(0));
                break;
            }
            Err(_) => continue,
        }
    }
}

#[test]
fn unknown_app_and_unknown_action_are_typed_errors() {
    let pool = start_pool(&["--workers", "1"]);
    let client = pool.client();

    let err = client
        .execute("ghost:App", "x", vec![], BTreeMap::new())
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::AppNotFound);

    let err = client
        .execute("counter:CounterApp", "detonate", vec![], BTreeMap::new())
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::App);
    assert!(err.message.contains("unknown action"));
}

#[test]
fn ctl_status_renders_json() {
    let pool = start_pool(&["--workers", "1"]);

    let output = Command::new(env!("CARGO_BIN_EXE_soot"))
        .arg("ctl")
        .arg("--socket")
        .arg(&pool.socket_path)
        .arg("status")
        .output()
        .expect("failed to run soot ctl");
    assert!(output.status.success());

    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed["alive_workers"], serde_json::json!(1));
    assert!(parsed["workers"].is_array());
}
