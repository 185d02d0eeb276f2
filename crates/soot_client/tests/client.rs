//! Client behavior against a scripted arbiter endpoint.

use std::collections::BTreeMap;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use soot_client::{AsyncDirtyClient, DirtyClient, ErrorKind};
use soot_protocol::{read_frame, write_frame, DirtyError, Frame, MsgType, Request, Value};

struct FakeArbiter {
    socket_path: PathBuf,
    connections: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
    _dir: tempfile::TempDir,
}

fn spawn_fake_arbiter() -> FakeArbiter {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("arbiter.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(AtomicUsize::new(0));

    let conn_count = Arc::clone(&connections);
    let req_count = Arc::clone(&requests);
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            conn_count.fetch_add(1, Ordering::SeqCst);
            let req_count = Arc::clone(&req_count);
            std::thread::spawn(move || serve_connection(stream, req_count));
        }
    });

    FakeArbiter {
        socket_path,
        connections,
        requests,
        _dir: dir,
    }
}

fn serve_connection(mut stream: UnixStream, requests: Arc<AtomicUsize>) {
    loop {
        let frame = match read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(_) => return,
        };
        requests.fetch_add(1, Ordering::SeqCst);
        let id = frame.request_id;

        let result = match frame.msg_type {
            MsgType::Request => {
                let request = Request::from_value(&frame.payload).unwrap();
                match request.action.as_str() {
                    "ok" => write_frame(&mut stream, &Frame::response(id, Value::Int(42))),
                    "echo" => {
                        let first = request.args.first().cloned().unwrap_or(Value::Null);
                        write_frame(&mut stream, &Frame::response(id, first))
                    }
                    "fail" => {
                        let err = DirtyError::app(
                            "boom",
                            &request.app_path,
                            &request.action,
                            Some("trace".to_string()),
                        );
                        write_frame(&mut stream, &Frame::error(id, &err))
                    }
                    "letters" => ["a", "b", "c"]
                        .iter()
                        .try_for_each(|s| {
                            write_frame(&mut stream, &Frame::chunk(id, Value::from(*s)))
                        })
                        .and_then(|_| write_frame(&mut stream, &Frame::end(id))),
                    "failstream" => {
                        write_frame(&mut stream, &Frame::chunk(id, Value::from("a"))).unwrap();
                        let err = DirtyError::app("stream broke", &request.app_path, "x", None);
                        write_frame(&mut stream, &Frame::error(id, &err))
                    }
                    "hang" => {
                        std::thread::sleep(Duration::from_secs(2));
                        write_frame(&mut stream, &Frame::response(id, Value::Null))
                    }
                    "drop" => return,
                    _ => {
                        let err = DirtyError::generic("unknown scripted action");
                        write_frame(&mut stream, &Frame::error(id, &err))
                    }
                }
            }
            MsgType::Status => {
                let mut map = BTreeMap::new();
                map.insert("num_workers".to_string(), Value::Int(1));
                write_frame(&mut stream, &Frame::response(id, Value::Dict(map)))
            }
            _ => write_frame(
                &mut stream,
                &Frame::error(id, &DirtyError::generic("unexpected message")),
            ),
        };
        if result.is_err() {
            return;
        }
    }
}

#[test]
fn execute_returns_result() {
    let arbiter = spawn_fake_arbiter();
    let client = DirtyClient::new(&arbiter.socket_path);
    let result = client
        .execute("any:App", "ok", vec![], BTreeMap::new())
        .unwrap();
    assert_eq!(result, Value::Int(42));
}

#[test]
fn execute_demarshals_typed_errors() {
    let arbiter = spawn_fake_arbiter();
    let client = DirtyClient::new(&arbiter.socket_path);
    let err = client
        .execute("calc:Calc", "fail", vec![], BTreeMap::new())
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::App);
    assert_eq!(err.message, "boom");
    assert_eq!(err.app_path(), Some("calc:Calc"));
    assert_eq!(err.traceback(), Some("trace"));
}

#[test]
fn connection_is_reused_across_calls() {
    let arbiter = spawn_fake_arbiter();
    let client = DirtyClient::new(&arbiter.socket_path);
    for _ in 0..3 {
        client
            .execute("any:App", "ok", vec![], BTreeMap::new())
            .unwrap();
    }
    assert_eq!(arbiter.connections.load(Ordering::SeqCst), 1);
}

#[test]
fn reconnects_after_connection_failure() {
    let arbiter = spawn_fake_arbiter();
    let client = DirtyClient::new(&arbiter.socket_path);

    let err = client
        .execute("any:App", "drop", vec![], BTreeMap::new())
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Connection);

    let result = client
        .execute("any:App", "ok", vec![], BTreeMap::new())
        .unwrap();
    assert_eq!(result, Value::Int(42));
    assert_eq!(arbiter.connections.load(Ordering::SeqCst), 2);
}

#[test]
fn slow_reply_times_out() {
    let arbiter = spawn_fake_arbiter();
    let client =
        DirtyClient::new(&arbiter.socket_path).with_timeout(Some(Duration::from_millis(100)));
    let err = client
        .execute("any:App", "hang", vec![], BTreeMap::new())
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
}

#[test]
fn missing_socket_is_connection_error() {
    let dir = tempfile::tempdir().unwrap();
    let client = DirtyClient::new(dir.path().join("absent.sock"));
    let err = client
        .execute("any:App", "ok", vec![], BTreeMap::new())
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Connection);
    assert!(err.details.contains_key("socket_path"));
}

#[test]
fn stream_yields_values_in_order() {
    let arbiter = spawn_fake_arbiter();
    let client = DirtyClient::new(&arbiter.socket_path);
    let values: Result<Vec<Value>, DirtyError> = client
        .execute_stream("any:App", "letters", vec![], BTreeMap::new())
        .collect();
    assert_eq!(
        values.unwrap(),
        vec![Value::from("a"), Value::from("b"), Value::from("c")]
    );

    // Terminal END leaves the connection reusable.
    let result = client
        .execute("any:App", "ok", vec![], BTreeMap::new())
        .unwrap();
    assert_eq!(result, Value::Int(42));
    assert_eq!(arbiter.connections.load(Ordering::SeqCst), 1);
}

#[test]
fn stream_is_lazy_until_first_advance() {
    let arbiter = spawn_fake_arbiter();
    let client = DirtyClient::new(&arbiter.socket_path);
    {
        let _stream = client.execute_stream("any:App", "letters", vec![], BTreeMap::new());
        // Never advanced: no request, no connection.
    }
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(arbiter.connections.load(Ordering::SeqCst), 0);
    assert_eq!(arbiter.requests.load(Ordering::SeqCst), 0);
}

#[test]
fn stream_error_is_raised_from_iterator() {
    let arbiter = spawn_fake_arbiter();
    let client = DirtyClient::new(&arbiter.socket_path);
    let mut stream = client.execute_stream("any:App", "failstream", vec![], BTreeMap::new());

    assert_eq!(stream.next().unwrap().unwrap(), Value::from("a"));
    let err = stream.next().unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::App);
    assert!(stream.next().is_none(), "stream must be fused after error");
}

#[test]
fn dropping_mid_stream_closes_the_connection() {
    let arbiter = spawn_fake_arbiter();
    let client = DirtyClient::new(&arbiter.socket_path);
    {
        let mut stream = client.execute_stream("any:App", "letters", vec![], BTreeMap::new());
        assert_eq!(stream.next().unwrap().unwrap(), Value::from("a"));
        // Dropped with chunks still in flight.
    }
    let result = client
        .execute("any:App", "ok", vec![], BTreeMap::new())
        .unwrap();
    assert_eq!(result, Value::Int(42));
    assert_eq!(arbiter.connections.load(Ordering::SeqCst), 2);
}

#[test]
fn status_returns_snapshot() {
    let arbiter = spawn_fake_arbiter();
    let client = DirtyClient::new(&arbiter.socket_path);
    let status = client.status().unwrap();
    assert_eq!(status.get("num_workers"), Some(&Value::Int(1)));
}

#[tokio::test]
async fn async_execute_and_stream() {
    let arbiter = spawn_fake_arbiter();
    let mut client = AsyncDirtyClient::new(&arbiter.socket_path);

    let result = client
        .execute("any:App", "echo", vec![Value::Int(7)], BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(result, Value::Int(7));

    let values = client
        .execute_stream("any:App", "letters", vec![], BTreeMap::new())
        .drain()
        .await
        .unwrap();
    assert_eq!(
        values,
        vec![Value::from("a"), Value::from("b"), Value::from("c")]
    );
}

#[tokio::test]
async fn async_errors_are_typed() {
    let arbiter = spawn_fake_arbiter();
    let mut client = AsyncDirtyClient::new(&arbiter.socket_path);
    let err = client
        .execute("calc:Calc", "fail", vec![], BTreeMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::App);
    assert_eq!(err.message, "boom");
}

#[test]
fn shared_client_is_cached_per_thread() {
    let arbiter = spawn_fake_arbiter();
    soot_client::set_default_socket_path(&arbiter.socket_path);

    let first = soot_client::shared_client().unwrap();
    let second = soot_client::shared_client().unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let other_thread = std::thread::spawn(|| soot_client::shared_client().unwrap());
    let third = other_thread.join().unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
}
