//! End-to-end tests over real loopback sockets.
//!
//! Each test builds its own environments. Where the far side must misbehave
//! (never answer, answer out of order, hang up) it is played by a plain
//! blocking socket speaking the wire format by hand.

use parking_lot::Mutex;
use rtremote::codec::{encode_frame, FrameDecoder};
use rtremote::{
    CorrelationKey, Document, Endpoint, Environment, RemoteConfig, RemoteError, Stream,
    StreamListener, StreamState,
};
use serde_json::json;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MAX: usize = 1024 * 1024;

/// Route transport logs to the test harness; `RUST_LOG=rtremote=trace` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ────────────────────────────────────────────────────────────────────────────
// Fixtures
// ────────────────────────────────────────────────────────────────────────────

/// Echo server: answers every request with `<type>.response` carrying the
/// request's fields. Pumped by its own thread until shut down.
struct EchoServer {
    env: Arc<Environment>,
    endpoint: Endpoint,
    threads: Vec<JoinHandle<()>>,
}

impl EchoServer {
    fn start(bind: Endpoint) -> Self {
        init_tracing();
        let env = Environment::new(RemoteConfig::default()).unwrap();
        env.set_request_handler(|stream: &Arc<Stream>, doc: &Document| -> rtremote::Result<()> {
            stream.send(&doc.response(doc.value().clone()))
        });

        let listener = StreamListener::bind(&env, &bind).unwrap();
        let endpoint = listener.local_endpoint().unwrap();

        let accept_env = Arc::clone(&env);
        let acceptor = thread::spawn(move || {
            while !accept_env.is_shutdown() {
                if listener.accept().is_err() {
                    break;
                }
            }
        });

        let pump_env = Arc::clone(&env);
        let pump = thread::spawn(move || {
            while pump_env
                .process_single_work_item(Duration::from_millis(10))
                .is_ok()
            {}
        });

        Self {
            env,
            endpoint,
            threads: vec![pump, acceptor],
        }
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.env.shutdown();
        // The acceptor may still be parked in accept(); only the pump is joined.
        if let Some(pump) = self.threads.drain(..).next() {
            let _ = pump.join();
        }
    }
}

/// Hand-driven peer over a blocking TCP socket.
struct RawPeer {
    socket: TcpStream,
    decoder: FrameDecoder,
}

impl RawPeer {
    fn recv(&mut self) -> Document {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(doc) = self.decoder.next_frame().unwrap() {
                if doc.is_keep_alive() {
                    continue;
                }
                return doc;
            }
            let n = self.socket.read(&mut chunk).unwrap();
            assert!(n > 0, "client hung up");
            self.decoder.extend(&chunk[..n]);
        }
    }

    fn send(&mut self, doc: &Document) {
        self.socket.write_all(&encode_frame(doc, MAX).unwrap()).unwrap();
    }

    fn reply_to(&mut self, request: &Document) {
        let reply = request.response(json!({ "answer": request.correlation_key().unwrap().get() }));
        self.send(&reply);
    }
}

/// Connect a new stream of `env` to a fresh raw peer.
fn connect_raw(env: &Arc<Environment>) -> (Arc<Stream>, RawPeer) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = Endpoint::Tcp(listener.local_addr().unwrap());
    let stream = env.connect(&endpoint).unwrap();
    let (socket, _) = listener.accept().unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let peer = RawPeer {
        socket,
        decoder: FrameDecoder::new(MAX),
    };
    (stream, peer)
}

/// A client environment connected to a fresh raw peer.
fn client_and_raw_peer() -> (Arc<Environment>, Arc<Stream>, RawPeer) {
    init_tracing();
    let env = Environment::new(RemoteConfig::default()).unwrap();
    let (stream, peer) = connect_raw(&env);
    (env, stream, peer)
}

fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn request(message_type: &str) -> Document {
    Document::new(json!({ "message.type": message_type, "object.id": "obj" }))
}

// ────────────────────────────────────────────────────────────────────────────
// Round trips
// ────────────────────────────────────────────────────────────────────────────

#[test]
fn test_echo_round_trip_tcp() {
    let server = EchoServer::start("127.0.0.1:0".parse().unwrap());
    let env = Environment::new(RemoteConfig::default()).unwrap();
    let stream = env.connect(&server.endpoint).unwrap();

    let mut handle = stream.send_with_wait(&request("get.byname.request")).unwrap();
    handle.wait(2000).unwrap();

    let reply = handle.response().unwrap();
    assert_eq!(reply.message_type(), Some("get.byname.request.response"));
    assert_eq!(reply.correlation_key(), Some(handle.key()));
    assert_eq!(reply.get("object.id"), Some(&json!("obj")));
    assert!(!env.registry().contains(handle.key()));
}

#[test]
fn test_round_trip_after_accept_handle_dropped() {
    init_tracing();
    let server_env = Environment::new(RemoteConfig::default()).unwrap();
    server_env.set_request_handler(|stream: &Arc<Stream>, doc: &Document| -> rtremote::Result<()> {
        stream.send(&doc.response(json!({ "ok": true })))
    });
    let listener = StreamListener::bind(&server_env, &"127.0.0.1:0".parse().unwrap()).unwrap();

    let env = Environment::new(RemoteConfig::default()).unwrap();
    let stream = env.connect(&listener.local_endpoint().unwrap()).unwrap();
    drop(listener.accept().unwrap());
    assert_eq!(server_env.adopted_streams(), 1);

    let mut handle = stream.send_with_wait(&request("get.byname.request")).unwrap();
    let pump_env = Arc::clone(&server_env);
    let pump = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            let _ = pump_env.process_single_work_item(Duration::from_millis(10));
        }
    });

    handle.wait(2000).unwrap();
    assert_eq!(handle.response().unwrap().get("ok"), Some(&json!(true)));
    assert_eq!(stream.state(), StreamState::Opened);

    stream.close().unwrap();
    assert!(eventually(Duration::from_secs(2), || server_env.adopted_streams() == 0));
    pump.join().unwrap();
}

#[test]
fn test_echo_round_trip_unix() {
    let dir = tempfile::tempdir().unwrap();
    let server = EchoServer::start(Endpoint::Unix(dir.path().join("echo.sock")));
    let env = Environment::new(RemoteConfig::default()).unwrap();
    let stream = env.connect(&server.endpoint).unwrap();

    let mut handle = stream.send_with_wait(&request("set.byname.request")).unwrap();
    handle.wait(2000).unwrap();
    assert_eq!(
        handle.response().and_then(|r| r.message_type().map(str::to_string)),
        Some("set.byname.request.response".to_string())
    );
}

#[test]
fn test_concurrent_waits_on_one_stream() {
    let server = EchoServer::start("127.0.0.1:0".parse().unwrap());
    let env = Environment::new(RemoteConfig::default()).unwrap();
    let stream = env.connect(&server.endpoint).unwrap();

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let stream = Arc::clone(&stream);
            thread::spawn(move || {
                let doc = Document::new(json!({ "message.type": "method.call.request", "n": i }));
                let mut handle = stream.send_with_wait(&doc).unwrap();
                handle.wait(5000).unwrap();
                let reply = handle.response().unwrap();
                assert_eq!(reply.correlation_key(), Some(handle.key()));
                reply.get("n").cloned()
            })
        })
        .collect();

    let mut seen: Vec<i64> = workers
        .into_iter()
        .map(|w| w.join().unwrap().and_then(|v| v.as_i64()).unwrap())
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..8).collect::<Vec<_>>());
    assert!(env.registry().is_empty());
}

// ────────────────────────────────────────────────────────────────────────────
// Correlation and timeouts
// ────────────────────────────────────────────────────────────────────────────

#[test]
fn test_timeout_without_reply_deregisters() {
    let (env, stream, mut peer) = client_and_raw_peer();
    let mut handle = stream.send_with_wait(&request("get.byname.request")).unwrap();
    let key = handle.key();
    assert_eq!(peer.recv().correlation_key(), Some(key));

    let start = Instant::now();
    let err = handle.wait(100).unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, RemoteError::Timeout(100)));
    assert!(elapsed >= Duration::from_millis(100), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1000), "returned after {:?}", elapsed);
    assert!(!env.registry().contains(key));

    // A reply arriving after the deadline is dropped, not misrouted.
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&requests);
    env.set_request_handler(move |_s: &Arc<Stream>, _d: &Document| -> rtremote::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    peer.send(&Document::new(json!({ "message.type": "get.byname.request.response", "correlation.key": key.get() })));
    for _ in 0..20 {
        env.process_single_work_item(Duration::from_millis(10)).unwrap();
    }
    assert_eq!(requests.load(Ordering::SeqCst), 0);
    assert!(handle.wait(10).unwrap_err().is_timeout());
}

#[test]
fn test_out_of_order_replies() {
    let (env, stream, mut peer) = client_and_raw_peer();
    let mut first = stream.send_with_wait(&request("a.request")).unwrap();
    let mut second = stream.send_with_wait(&request("b.request")).unwrap();
    let req1 = peer.recv();
    let req2 = peer.recv();
    assert_eq!(req1.correlation_key(), Some(first.key()));
    assert_eq!(req2.correlation_key(), Some(second.key()));

    peer.reply_to(&req2);
    second.wait(2000).unwrap();
    assert_eq!(
        second.response().unwrap().get("answer"),
        Some(&json!(second.key().get()))
    );
    assert!(!first.is_completed());
    assert!(env.registry().contains(first.key()));

    peer.reply_to(&req1);
    first.wait(2000).unwrap();
    assert_eq!(
        first.response().unwrap().get("answer"),
        Some(&json!(first.key().get()))
    );
}

#[test]
fn test_reply_routed_while_another_handle_pumps() {
    let (_env, stream, mut peer) = client_and_raw_peer();
    let mut first = stream.send_with_wait(&request("a.request")).unwrap();
    let mut second = stream.send_with_wait(&request("b.request")).unwrap();
    let req1 = peer.recv();
    let req2 = peer.recv();

    peer.reply_to(&req1);
    peer.reply_to(&req2);

    // Waiting on the second delivers the first along the way.
    second.wait(2000).unwrap();
    assert!(first.is_completed());

    let start = Instant::now();
    first.wait(2000).unwrap();
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(first.response().unwrap().correlation_key(), Some(first.key()));
}

#[test]
fn test_completed_handle_wait_needs_no_connection() {
    let server = EchoServer::start("127.0.0.1:0".parse().unwrap());
    let env = Environment::new(RemoteConfig::default()).unwrap();
    let stream = env.connect(&server.endpoint).unwrap();

    let mut handle = stream.send_with_wait(&request("x.request")).unwrap();
    handle.wait(2000).unwrap();
    stream.close().unwrap();
    handle.wait(2000).unwrap();
    assert!(handle.response().is_some());
}

#[test]
fn test_stale_reply_is_not_a_request() {
    let (env, _stream, mut peer) = client_and_raw_peer();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&requests);
    env.set_request_handler(move |_s: &Arc<Stream>, d: &Document| -> rtremote::Result<()> {
        sink.lock().push(d.message_type().map(str::to_string));
        Ok(())
    });

    peer.send(&Document::new(json!({ "message.type": "x.response", "correlation.key": 4242 })));
    peer.send(&Document::with_type("ping.request"));

    assert!(eventually(Duration::from_secs(2), || {
        let _ = env.process_single_work_item(Duration::from_millis(10));
        !requests.lock().is_empty()
    }));
    assert_eq!(requests.lock().as_slice(), &[Some("ping.request".to_string())]);
}

#[test]
fn test_shutdown_fails_outstanding_wait() {
    let (env, stream, mut peer) = client_and_raw_peer();
    let mut handle = stream.send_with_wait(&request("slow.request")).unwrap();
    peer.recv();

    let stopper_env = Arc::clone(&env);
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        stopper_env.shutdown();
    });

    let start = Instant::now();
    let err = handle.wait(5000).unwrap_err();
    stopper.join().unwrap();
    assert!(matches!(err, RemoteError::ShutdownInProgress));
    assert!(start.elapsed() < Duration::from_millis(2000));
    assert!(matches!(
        stream.send_with_wait(&request("late.request")),
        Err(RemoteError::ShutdownInProgress)
    ));
}

// ────────────────────────────────────────────────────────────────────────────
// Stream lifecycle on the selector
// ────────────────────────────────────────────────────────────────────────────

#[test]
fn test_remove_stream_from_own_handler() {
    let (env, stream, mut peer) = client_and_raw_peer();
    let handled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&handled);
    let weak_env = Arc::downgrade(&env);
    stream.set_message_handler(move |s: &Arc<Stream>, _d: &Document| -> rtremote::Result<()> {
        if let Some(env) = weak_env.upgrade() {
            env.selector().remove_stream(s)?;
        }
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    assert!(env.selector().contains(&stream));

    peer.send(&Document::with_type("notify.request"));
    assert!(eventually(Duration::from_secs(2), || handled.load(Ordering::SeqCst)));
    assert!(!env.selector().contains(&stream));
    assert!(env.selector().is_running());

    // The selector keeps serving the environment's other streams.
    let (other, mut other_peer) = connect_raw(&env);
    let mut handle = other.send_with_wait(&request("after.request")).unwrap();
    let req = other_peer.recv();
    other_peer.reply_to(&req);
    handle.wait(2000).unwrap();
    assert_eq!(stream.state(), StreamState::Opened);
}

#[test]
fn test_close_twice_notifies_once_and_unregisters() {
    let (env, stream, _peer) = client_and_raw_peer();
    let closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closed);
    stream.set_state_changed_handler(move |_s: &Arc<Stream>, state: StreamState| -> rtremote::Result<()> {
        if state == StreamState::Closed {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    });

    stream.close().unwrap();
    stream.close().unwrap();
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(!env.selector().contains(&stream));
    assert!(matches!(
        stream.send(&Document::with_type("x.request")),
        Err(RemoteError::Io(_))
    ));
}

#[test]
fn test_peer_disconnect_closes_stream() {
    let (env, stream, peer) = client_and_raw_peer();
    let closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closed);
    stream.set_state_changed_handler(move |_s: &Arc<Stream>, state: StreamState| -> rtremote::Result<()> {
        if state == StreamState::Closed {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    });

    drop(peer);
    assert!(eventually(Duration::from_secs(2), || stream.state() == StreamState::Closed));
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(!env.selector().contains(&stream));
}

#[test]
fn test_keys_unique_across_threads() {
    let env = Environment::new(RemoteConfig::default()).unwrap();
    let minted: Vec<CorrelationKey> = (0..4)
        .map(|_| {
            let env = Arc::clone(&env);
            thread::spawn(move || (0..250).map(|_| env.next_correlation_key()).collect::<Vec<_>>())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .flat_map(|t| t.join().unwrap())
        .collect();
    let mut sorted = minted.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), minted.len());
}
