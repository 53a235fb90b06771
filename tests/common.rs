#![allow(unused)]

use hwire::prelude::*;
use hwire::server::ServerHandle;
use std::net::SocketAddr;
use std::sync::Once;
use std::thread::JoinHandle;

pub fn setup_logger() {
    static START: Once = Once::new();
    START.call_once(|| {
        let test_log = std::env::var("TEST_LOG")
            .map(|x| x != "0" && x.to_lowercase() != "false")
            .unwrap_or(false);
        let level = if test_log {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Info
        };
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Warn)
            .filter_module("hwire", level)
            .target(env_logger::Target::Stdout)
            .init();
    });
}

/// A server on an ephemeral port, torn down on drop.
pub struct TestServer {
    pub addr: SocketAddr,
    handle: ServerHandle,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start(router: Router) -> TestServer {
        let mut server = Server::new(router).unwrap();
        server.add_listener("127.0.0.1", 0);
        server.start().unwrap();
        let addr = server.local_addrs()[0];
        let handle = server.handle();
        let thread = std::thread::spawn(move || {
            server.run().unwrap();
        });
        TestServer {
            addr,
            handle,
            thread: Some(thread),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.exit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The router used by most tests.
pub fn test_router() -> Router {
    let mut router = Router::new();
    router
        .add(Method::Get, "/", |_req, _params| {
            Ok(Response::text(200, "root"))
        })
        .unwrap();
    router
        .add(Method::Get, "/echo-query", |req, _params| {
            Ok(Response::text(200, req.url.query_param("q").to_owned()))
        })
        .unwrap();
    router
        .add(Method::Post, "/echo-body", |req, _params| {
            Ok(Response::text(200, req.body.clone()))
        })
        .unwrap();
    router
        .add(Method::Get, "/forums/:forum_name/topics/:topic_id/post", |_req, params| {
            Ok(Response::text(
                200,
                format!("{}/{}", params["forum_name"], params["topic_id"]),
            ))
        })
        .unwrap();
    router
        .add(Method::Get, "/fail", |_req, _params| {
            Err(hwire::ErrorResponse::new(403, "not for you").into())
        })
        .unwrap();
    router
        .add(Method::Get, "/negotiate", |req, _params| {
            let accept = req.headers.get("Accept");
            if accept.is_empty() || accept.contains("text/plain") || accept.contains("*/*") {
                Ok(Response::text(200, "negotiated"))
            } else {
                Err(hwire::ErrorResponse::not_acceptable(vec!["text/plain".into()]).into())
            }
        })
        .unwrap();
    router
        .add(Method::Get, "/boom", |_req, _params| {
            Err(Error::Network("database down".into()))
        })
        .unwrap();
    router
        .add(Method::Head, "/head", |_req, _params| {
            Ok(Response::text(200, "suppressed"))
        })
        .unwrap();
    router
}
