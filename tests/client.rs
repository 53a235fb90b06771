use hwire::client::{AsyncClient, AsyncClientParams};
use hwire::net::{DefaultSocketFactory, Socket, SocketFactory};
use hwire::prelude::*;

mod common;
use common::TestServer;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

fn client_for(server: &TestServer, max_connections: usize) -> AsyncClient {
    let mut params = AsyncClientParams::new("127.0.0.1", server.port());
    params.max_connections = max_connections;
    AsyncClient::new(params).unwrap()
}

#[test]
fn single_request() {
    common::setup_logger();
    let server = TestServer::start(common::test_router());
    let client = client_for(&server, 1);

    let pending = client.queue(Request::get("/").unwrap()).unwrap();
    let resp = pending.wait().unwrap().expect("not aborted");
    assert_eq!(resp.status.code, 200);
    assert_eq!(resp.body_text(), "root");
}

#[test]
fn host_header_is_injected() {
    common::setup_logger();

    let mut router = Router::new();
    router
        .add(Method::Get, "/host", |req, _params| {
            Ok(Response::text(200, req.headers.get("Host").to_owned()))
        })
        .unwrap();
    let server = TestServer::start(router);
    let client = client_for(&server, 1);

    let pending = client.queue(Request::get("/host").unwrap()).unwrap();
    let resp = pending.wait().unwrap().unwrap();
    assert_eq!(resp.body_text(), format!("127.0.0.1:{}", server.port()));
}

#[test]
fn explicit_host_wins_over_default() {
    common::setup_logger();

    let mut router = Router::new();
    router
        .add(Method::Get, "/host", |req, _params| {
            Ok(Response::text(200, req.headers.get("Host").to_owned()))
        })
        .unwrap();
    let server = TestServer::start(router);
    let client = client_for(&server, 1);

    let req = Request::get("/host").unwrap().header("Host", "override.example");
    let resp = client.queue(req).unwrap().wait().unwrap().unwrap();
    assert_eq!(resp.body_text(), "override.example");
}

#[test]
fn many_requests_across_workers() {
    common::setup_logger();
    let server = TestServer::start(common::test_router());
    let client = client_for(&server, 4);

    let pendings: Vec<_> = (0..20)
        .map(|i| {
            let req = Request::get(&format!("/echo-query?q=n{}", i)).unwrap();
            (i, client.queue(req).unwrap())
        })
        .collect();

    for (i, pending) in pendings {
        let resp = pending.wait().unwrap().expect("not aborted");
        assert_eq!(resp.status.code, 200);
        assert_eq!(resp.body_text(), format!("n{}", i));
    }
}

#[test]
fn completion_callback_runs_before_fulfilment() {
    common::setup_logger();
    let server = TestServer::start(common::test_router());
    let client = client_for(&server, 1);

    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();
    let pending = client
        .queue_with(
            Request::get("/").unwrap(),
            Some(Box::new(move |_req, resp| {
                assert_eq!(resp.status.code, 200);
                flag.store(true, Ordering::SeqCst);
            })),
            None,
        )
        .unwrap();

    let resp = pending.wait().unwrap().unwrap();
    assert_eq!(resp.status.code, 200);
    assert!(called.load(Ordering::SeqCst));
}

#[test]
fn exception_callback_on_connect_failure() {
    common::setup_logger();

    // nothing listens on this port
    let mut params = AsyncClientParams::new("127.0.0.1", 1);
    params.max_connections = 1;
    let client = AsyncClient::new(params).unwrap();

    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();
    let pending = client
        .queue_with(
            Request::get("/").unwrap(),
            Some(Box::new(|_req, _resp| panic!("must not complete"))),
            Some(Box::new(move |_req| {
                flag.store(true, Ordering::SeqCst);
            })),
        )
        .unwrap();

    match pending.wait() {
        Err(Error::Connection { port: 1, .. }) => {}
        other => panic!("expected connection error, got ok={}", other.is_ok()),
    }
    assert!(called.load(Ordering::SeqCst));
}

/// A factory that blocks all connects until released, counting concurrency.
struct BlockingFactory {
    open: Mutex<bool>,
    cond: Condvar,
    concurrent: AtomicUsize,
    peak: AtomicUsize,
    attempts: AtomicUsize,
    inner: DefaultSocketFactory,
}

impl BlockingFactory {
    fn new() -> Arc<BlockingFactory> {
        Arc::new(BlockingFactory {
            open: Mutex::new(false),
            cond: Condvar::new(),
            concurrent: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            inner: DefaultSocketFactory,
        })
    }

    fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }
}

impl SocketFactory for BlockingFactory {
    fn connect(&self, host: &str, port: u16, tls: bool) -> Result<Socket, Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
        drop(open);

        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        self.inner.connect(host, port, tls)
    }
}

#[test]
fn worker_pool_bounds_concurrent_connects() {
    common::setup_logger();
    let server = TestServer::start(common::test_router());

    let factory = BlockingFactory::new();
    let mut params = AsyncClientParams::new("127.0.0.1", server.port());
    params.max_connections = 4;
    params.socket_factory = factory.clone();
    let client = AsyncClient::new(params).unwrap();

    let pendings: Vec<_> = (0..6)
        .map(|_| client.queue(Request::get("/").unwrap()).unwrap())
        .collect();

    // within bounded time all four workers sit in connect
    let deadline = Instant::now() + Duration::from_secs(5);
    while factory.concurrent.load(Ordering::SeqCst) < 4 {
        assert!(Instant::now() < deadline, "workers never saturated");
        std::thread::sleep(Duration::from_millis(5));
    }
    // and never more than the pool size at once
    assert_eq!(factory.peak.load(Ordering::SeqCst), 4);

    factory.release();
    for pending in pendings {
        let resp = pending.wait().unwrap().expect("not aborted");
        assert_eq!(resp.status.code, 200);
    }
    assert!(factory.peak.load(Ordering::SeqCst) <= 4);
}

#[test]
fn abort_removes_queued_request() {
    common::setup_logger();
    let server = TestServer::start(common::test_router());

    let factory = BlockingFactory::new();
    let mut params = AsyncClientParams::new("127.0.0.1", server.port());
    params.max_connections = 1;
    params.socket_factory = factory.clone();
    let client = AsyncClient::new(params).unwrap();

    // the first request occupies the only worker inside connect
    let first = client.queue(Request::get("/").unwrap()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while factory.concurrent.load(Ordering::SeqCst) < 1 {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(5));
    }

    // the second is still queued and can be aborted
    let second = client.queue(Request::get("/").unwrap()).unwrap();
    assert!(client.abort(&second));
    assert!(second.wait().unwrap().is_none());

    // an in-flight request is not abortable
    assert!(!client.abort(&first));

    factory.release();
    assert!(first.wait().unwrap().is_some());
}

#[test]
fn exit_fulfils_queued_with_none() {
    common::setup_logger();
    let server = TestServer::start(common::test_router());

    let factory = BlockingFactory::new();
    let mut params = AsyncClientParams::new("127.0.0.1", server.port());
    params.max_connections = 1;
    params.socket_factory = factory.clone();
    let client = AsyncClient::new(params).unwrap();

    let first = client.queue(Request::get("/").unwrap()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while factory.concurrent.load(Ordering::SeqCst) < 1 {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(5));
    }
    let queued = client.queue(Request::get("/").unwrap()).unwrap();

    // exit joins the worker, so release the factory from another thread
    let factory2 = factory.clone();
    let releaser = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        factory2.release();
    });
    client.exit();
    releaser.join().unwrap();

    // the in-flight request ran to completion, the queued one was dropped
    assert!(first.wait().unwrap().is_some());
    assert!(queued.wait().unwrap().is_none());
    // only the in-flight request ever reached the factory
    assert_eq!(factory.attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn keep_alive_connections_are_reused() {
    common::setup_logger();
    let server = TestServer::start(common::test_router());

    let factory = BlockingFactory::new();
    factory.release();
    let mut params = AsyncClientParams::new("127.0.0.1", server.port());
    params.max_connections = 1;
    params.socket_factory = factory.clone();
    params
        .default_headers
        .set("Connection", "keep-alive");
    let client = AsyncClient::new(params).unwrap();

    for _ in 0..5 {
        let resp = client
            .queue(Request::get("/").unwrap())
            .unwrap()
            .wait()
            .unwrap()
            .expect("not aborted");
        assert_eq!(resp.status.code, 200);
    }
    // one connection serviced all requests
    assert_eq!(factory.attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn rate_limited_client_still_completes() {
    common::setup_logger();
    let server = TestServer::start(common::test_router());

    let mut params = AsyncClientParams::new("127.0.0.1", server.port());
    params.max_connections = 2;
    params.rate_limit = 50;
    let client = AsyncClient::new(params).unwrap();

    let pendings: Vec<_> = (0..10)
        .map(|_| client.queue(Request::get("/").unwrap()).unwrap())
        .collect();
    for pending in pendings {
        assert!(pending.wait().unwrap().is_some());
    }
}
