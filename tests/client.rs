//! end-to-end scenarios driving a real loopback server: a plain success, a retry across a bad
//! host, and a keep-alive socket cache reuse, among others. each test spins up its own ephemeral
//! `tokio::net::TcpListener` as a throwaway HTTP/1.1 server.

use std::{cell::RefCell, rc::Rc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::LocalSet,
};

use swarm_http::{DriverBuilder, ErrorKind, Host, RequestOptions, RunUntil, SocketCache, State};

async fn read_request_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "peer closed before the request head was complete");
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return buf;
        }
    }
}

/// accept exactly one connection, discard the request, and reply with `response` verbatim.
async fn one_shot_server(response: &'static [u8]) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_request_head(&mut stream).await;
        stream.write_all(response).await.unwrap();
        let _ = stream.shutdown().await;
    });
    addr
}

/// accept a connection and never respond, holding it open indefinitely -- a stand-in for a peer
/// that never finishes sending a response within the test's lifetime.
async fn black_hole_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        // hold the socket open without ever writing a response; dropped when the test's runtime
        // tears down at the end of the test.
        let _stream = stream;
        std::future::pending::<()>().await;
    });
    addr
}

#[tokio::test]
async fn basic_request_completes_with_response() {
    let addr = one_shot_server(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;

    let outcome = Rc::new(RefCell::new(None));
    let outcome_cb = outcome.clone();

    let (mut driver, _storage) = DriverBuilder::new()
        .host(Host::single(format!("127.0.0.1:{}", addr.port())))
        .path("/")
        .callback(move |ctx| {
            *outcome_cb.borrow_mut() = Some((ctx.error_kind(), ctx.response()));
        })
        .finish();

    driver.request(RequestOptions::new());

    LocalSet::new().run_until(async { driver.run(None, None).await }).await;

    let (kind, response) = outcome.borrow_mut().take().expect("terminal callback did not fire");
    assert_eq!(kind, ErrorKind::NoError);
    let response = response.expect("response must be populated on success");
    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(&response.body[..], b"ok");
}

#[tokio::test]
async fn bad_host_then_good_host_retries_once() {
    let addr = one_shot_server(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;

    // port 1 on loopback refuses connections immediately -- a reliable, deterministic stand-in
    // for the "first host refuses connection" scenario, with no dependence on outside network
    // state.
    let hosts = Host::list(["127.0.0.1:1".to_string(), format!("127.0.0.1:{}", addr.port())]);

    let outcome = Rc::new(RefCell::new(None));
    let outcome_cb = outcome.clone();

    let (mut driver, _storage) = DriverBuilder::new()
        .host(hosts)
        .path("/")
        .retries(1)
        .callback(move |ctx| {
            *outcome_cb.borrow_mut() = Some((ctx.error_kind(), ctx.errors(), ctx.response()));
        })
        .finish();

    driver.request(RequestOptions::new());

    LocalSet::new().run_until(async { driver.run(None, None).await }).await;

    let (kind, errors, response) = outcome.borrow_mut().take().expect("terminal callback did not fire");
    assert_eq!(kind, ErrorKind::NoError);
    assert_eq!(errors.len(), 1, "exactly one CONNECT_ERROR from the refused first host");
    assert_eq!(errors[0].kind, ErrorKind::ConnectError);
    assert_eq!(&response.unwrap().body[..], b"ok");
}

#[tokio::test]
async fn retry_limit_reached_reports_the_last_attempts_real_failure_kind() {
    // loopback port 1 refuses every attempt; with retries(2) that is 3 attempts total (the
    // initial one plus 2 retries), each appending its own CONNECT_ERROR entry -- no synthetic
    // entry or kind is added once the budget runs out.
    let (mut driver, _storage) = DriverBuilder::new()
        .host(Host::single("127.0.0.1:1"))
        .path("/")
        .retries(2)
        .callback(|ctx| {
            assert_eq!(ctx.error_kind(), ErrorKind::ConnectError);
            assert_eq!(ctx.attempts_left(), 0);
            assert!(ctx.response().is_none());
            let errors = ctx.errors();
            assert_eq!(errors.len(), 3, "one CONNECT_ERROR entry per attempt, no extra RETRY_LIMIT entry");
            assert!(errors.iter().all(|e| e.kind == ErrorKind::ConnectError));
        })
        .finish();

    driver.request(RequestOptions::new());
    LocalSet::new().run_until(async { driver.run(None, None).await }).await;
}

#[tokio::test]
async fn keep_alive_response_returns_socket_to_cache() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // a single accepted connection serves two keep-alive responses in a row. if the client
    // failed to reuse the cached socket, it would instead open a second TCP connection that
    // this server never accepts or drains -- the second request would then hang until its
    // (short, below) request_timeout fires and ultimately fail with a recoverable error rather
    // than succeeding, rather than hanging the test suite indefinitely.
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        for _ in 0..2 {
            read_request_head(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
        }
    });

    let successes = Rc::new(RefCell::new(0u32));
    let successes_cb = successes.clone();

    let (mut driver, _storage) = DriverBuilder::new()
        .host(Host::single(format!("127.0.0.1:{}", addr.port())))
        .path("/")
        .request_timeout(Duration::from_millis(500))
        .connect_timeout(Duration::from_millis(500))
        .socket_cache(SocketCache::new())
        .callback(move |ctx| {
            if ctx.error_kind() == ErrorKind::NoError && &ctx.response().unwrap().body[..] == b"ok" {
                *successes_cb.borrow_mut() += 1;
            }
        })
        .finish();

    let first = driver.request(RequestOptions::new());
    LocalSet::new().run_until(async { driver.run(None, None).await }).await;
    assert_eq!(driver.conn_state(first), None, "connection is reaped once COMPLETED");

    let second = driver.request(RequestOptions::new());
    LocalSet::new().run_until(async { driver.run(None, None).await }).await;
    assert_eq!(driver.conn_state(second), None);

    assert_eq!(*successes.borrow(), 2, "both requests must complete successfully via the shared socket");
}

#[tokio::test]
async fn break_loop_from_callback_stops_run_promptly() {
    let addr = one_shot_server(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;

    let (mut driver, _storage) = DriverBuilder::new()
        .host(Host::single(format!("127.0.0.1:{}", addr.port())))
        .path("/")
        .callback(|ctx| ctx.break_loop())
        .finish();

    driver.request(RequestOptions::new());

    LocalSet::new().run_until(async { driver.run(None, None).await }).await;

    assert!(!driver.is_running());
}

#[tokio::test]
async fn panicking_hook_transitions_to_user_action_with_internal_error() {
    let addr = one_shot_server(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;

    let outcome = Rc::new(RefCell::new(None));
    let outcome_cb = outcome.clone();

    let (mut driver, _storage) = DriverBuilder::new()
        .host(Host::single(format!("127.0.0.1:{}", addr.port())))
        .path("/")
        .connecting_callback(|_ctx| panic!("boom"))
        .callback(move |ctx| {
            *outcome_cb.borrow_mut() = Some((ctx.error_kind(), ctx.error_message().map(str::to_owned)));
        })
        .finish();

    driver.request(RequestOptions::new());
    LocalSet::new().run_until(async { driver.run(None, None).await }).await;

    let (kind, message) = outcome.borrow_mut().take().expect("terminal callback must still run");
    assert_eq!(kind, ErrorKind::InternalError);
    assert_eq!(message.as_deref(), Some("boom"));
}

#[tokio::test]
async fn missing_content_length_is_a_terminal_error() {
    let addr = one_shot_server(b"HTTP/1.1 200 OK\r\n\r\n").await;

    let outcome = Rc::new(RefCell::new(None));
    let outcome_cb = outcome.clone();

    let (mut driver, _storage) = DriverBuilder::new()
        .host(Host::single(format!("127.0.0.1:{}", addr.port())))
        .path("/")
        .retries(3)
        .callback(move |ctx| {
            *outcome_cb.borrow_mut() = Some((ctx.error_kind(), ctx.attempts_left()));
        })
        .finish();

    driver.request(RequestOptions::new());
    LocalSet::new().run_until(async { driver.run(None, None).await }).await;

    let (kind, attempts_left) = outcome.borrow_mut().take().unwrap();
    assert_eq!(kind, ErrorKind::ResponseError);
    // a terminal error short-circuits straight to USER_ACTION without consuming a retry.
    assert_eq!(attempts_left, 3);
}

#[tokio::test]
async fn keep_timeline_records_the_happy_path_in_order() {
    let addr = one_shot_server(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;

    let timeline = Rc::new(RefCell::new(Vec::new()));
    let timeline_cb = timeline.clone();
    let path_seen = Rc::new(RefCell::new(String::new()));
    let path_seen_cb = path_seen.clone();

    let (mut driver, _storage) = DriverBuilder::new()
        .host(Host::single(format!("127.0.0.1:{}", addr.port())))
        .path("/hello")
        .keep_timeline(true)
        .callback(move |ctx| {
            *timeline_cb.borrow_mut() = ctx.timeline().into_iter().map(|e| e.state).collect();
            *path_seen_cb.borrow_mut() = ctx.request_spec().path.clone();
        })
        .finish();

    let id = driver.request(RequestOptions::new());
    LocalSet::new().run_until(async { driver.run(None, None).await }).await;

    assert_eq!(
        timeline.borrow().as_slice(),
        [
            State::Initialized,
            State::ResolveDns,
            State::Connecting,
            State::Connected,
            State::Writing,
            State::Reading,
            State::UserAction,
        ]
    );
    assert_eq!(path_seen.borrow().as_str(), "/hello");
    // the connection is reaped once COMPLETED, so the by-id accessors see nothing afterward.
    assert_eq!(driver.conn_id(id), None);
    assert_eq!(driver.conn_timeline(id), None);
}

#[tokio::test]
async fn reinit_from_terminal_callback_retargets_the_request() {
    let good_addr = one_shot_server(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;

    let saw_301 = Rc::new(RefCell::new(false));
    let saw_301_cb = saw_301.clone();
    let final_body = Rc::new(RefCell::new(Vec::new()));
    let final_body_cb = final_body.clone();

    let host_for_redirect = format!("127.0.0.1:{}", good_addr.port());

    let (mut driver, _storage) = DriverBuilder::new()
        .host(Host::single("127.0.0.1:1")) // placeholder, overridden per-request below
        .path("/")
        .retries(1)
        .callback(move |ctx| {
            if ctx.error_kind() == ErrorKind::NoError {
                let status = ctx.response().unwrap().status;
                if status.as_u16() == 301 && !*saw_301_cb.borrow() {
                    *saw_301_cb.borrow_mut() = true;
                    ctx.reinit(swarm_http::ReinitOverrides {
                        host: Some(Host::single(host_for_redirect.clone())),
                        ..Default::default()
                    });
                } else {
                    *final_body_cb.borrow_mut() = ctx.response().unwrap().body.to_vec();
                }
            }
        })
        .finish();

    let redirecting_addr = one_shot_server(b"HTTP/1.1 301 Moved\r\nContent-Length: 0\r\n\r\n").await;
    driver.request(RequestOptions::new().host(Host::single(format!("127.0.0.1:{}", redirecting_addr.port()))));

    LocalSet::new().run_until(async { driver.run(None, None).await }).await;

    assert!(*saw_301.borrow());
    assert_eq!(&final_body.borrow()[..], b"ok");
}

#[tokio::test]
async fn run_with_id_list_returns_once_named_connections_are_done() {
    let fast_addr = one_shot_server(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
    let slow_addr = black_hole_server().await;

    let fast_done = Rc::new(RefCell::new(false));
    let fast_done_cb = fast_done.clone();

    let (mut driver, _storage) = DriverBuilder::new()
        .path("/")
        .request_timeout(Duration::from_secs(10))
        .connect_timeout(Duration::from_secs(10))
        .callback(move |_ctx| *fast_done_cb.borrow_mut() = true)
        .finish();

    let fast_id = driver.request(RequestOptions::new().host(Host::single(format!("127.0.0.1:{}", fast_addr.port()))));
    let slow_id = driver.request(RequestOptions::new().host(Host::single(format!("127.0.0.1:{}", slow_addr.port()))));

    LocalSet::new()
        .run_until(async {
            driver
                .run(Some(RunUntil::State(State::Completed)), Some(&[fast_id]))
                .await
        })
        .await;

    assert!(*fast_done.borrow(), "the named connection must have completed");
    assert_eq!(driver.conn_id(fast_id), None, "completed connections are reaped");
    assert!(
        driver.conn_id(slow_id).is_some(),
        "the unnamed connection is left mid-flight, not forced to completion"
    );
}
