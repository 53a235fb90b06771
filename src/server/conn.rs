//! Per-connection protocol driving for the server.
//!
//! Each accepted socket gets a `Conn` slot in a slab arena. Reactor
//! completions refer to a connection only by `(slot, id)` and re-check
//! liveness at dispatch, so a completion arriving after the connection died
//! is dropped on the floor. All state stepping happens on the reactor
//! thread.
//!
//! The per-connection cycle: read and parse until a request completes, run
//! the routed handler, write the response, then either reset the parser for
//! the next request (keep-alive, leftover pipelined bytes included) or
//! disconnect.

use crate::error::{Error, ErrorResponse};
use crate::method::Method;
use crate::net::{AsyncIo, IoHandle, PrivateCert, Socket, TcpSocket, TlsSocket};
use crate::parser::{RequestParser, State, LINE_SIZE};
use crate::request::Request;
use crate::response::Response;
use crate::server::router::Router;
use crate::url::Url;
use crate::writer;
use slab::Slab;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

struct Conn {
    id: u64,
    sock: Socket,
    buf: Vec<u8>,
    parser: RequestParser,
    keep_alive: bool,
    peer: String,
}

pub(crate) struct ServerCore {
    pub(crate) io: AsyncIo,
    pub(crate) router: Router,
    conns: Mutex<Slab<Conn>>,
    next_id: AtomicU64,
}

impl ServerCore {
    pub(crate) fn new(io: AsyncIo, router: Router) -> Arc<ServerCore> {
        Arc::new(ServerCore {
            io,
            router,
            conns: Mutex::new(Slab::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn insert(&self, sock: Socket, peer: String) -> (usize, u64) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = self.conns.lock().unwrap().insert(Conn {
            id,
            sock,
            buf: Vec::with_capacity(LINE_SIZE),
            parser: RequestParser::new(),
            keep_alive: false,
            peer,
        });
        (slot, id)
    }

    fn remove(&self, slot: usize, id: u64) -> Option<Conn> {
        let mut conns = self.conns.lock().unwrap();
        match conns.get(slot) {
            Some(conn) if conn.id == id => Some(conns.remove(slot)),
            _ => None,
        }
    }

    /// Run `f` on the connection if it is still alive.
    fn with_conn<R>(&self, slot: usize, id: u64, f: impl FnOnce(&mut Conn) -> R) -> Option<R> {
        let mut conns = self.conns.lock().unwrap();
        match conns.get_mut(slot) {
            Some(conn) if conn.id == id => Some(f(conn)),
            _ => None,
        }
    }

    fn submit_sock(&self, slot: usize, id: u64) -> Option<IoHandle> {
        self.with_conn(slot, id, |conn| conn.sock.io_handle())
    }
}

/// Entry point from the accept loop.
pub(crate) fn accepted(core: &Arc<ServerCore>, tcp: TcpSocket, cert: Option<&PrivateCert>) {
    let peer = tcp.peer_address_string().to_owned();
    trace!("connection from {}", peer);

    match cert {
        None => {
            let (slot, id) = core.insert(Socket::Tcp(tcp), peer);
            start_read(core, slot, id);
        }
        Some(cert) => {
            let tls = match TlsSocket::new_server(tcp, cert) {
                Ok(tls) => tls,
                Err(e) => {
                    debug!("tls session setup failed for {}: {}", peer, e);
                    return;
                }
            };
            let driver = tls.handle_clone();
            let (slot, id) = core.insert(Socket::Tls(tls), peer);
            let done = {
                let core = core.clone();
                move || start_read(&core, slot, id)
            };
            let fail = {
                let core = core.clone();
                move |e: Error| {
                    debug!("tls handshake failed: {}", e);
                    drop(core.remove(slot, id));
                }
            };
            driver.async_handshake(&core.io, done, fail);
        }
    }
}

/// Reading: receive into the buffer tail.
fn start_read(core: &Arc<ServerCore>, slot: usize, id: u64) {
    let sock = match core.submit_sock(slot, id) {
        Some(sock) => sock,
        None => return,
    };
    let free = core
        .with_conn(slot, id, |conn| LINE_SIZE - conn.buf.len())
        .unwrap_or(0);
    if free == 0 {
        // the parser is stuck on an oversized component
        overlong(core, slot, id);
        return;
    }

    let on_data = {
        let core = core.clone();
        move |data: Vec<u8>| on_data(&core, slot, id, data)
    };
    let on_error = {
        let core = core.clone();
        move |e: Error| {
            match e {
                Error::Aborted => trace!("read aborted during shutdown"),
                e => debug!("read failed: {}", e),
            }
            drop(core.remove(slot, id));
        }
    };
    sock.async_recv(&core.io, free, on_data, on_error);
}

fn on_data(core: &Arc<ServerCore>, slot: usize, id: u64, data: Vec<u8>) {
    if data.is_empty() {
        // orderly remote close
        if let Some(conn) = core.remove(slot, id) {
            if conn.parser.state() != State::Start || !conn.buf.is_empty() {
                debug!("{} disconnected mid-request", conn.peer);
            } else {
                trace!("{} disconnected", conn.peer);
            }
        }
        return;
    }
    let alive = core
        .with_conn(slot, id, |conn| conn.buf.extend_from_slice(&data))
        .is_some();
    if alive {
        process_buffer(core, slot, id);
    }
}

enum Next {
    Read,
    Handle(Request),
    Fail(ErrorResponse),
}

/// Feed buffered bytes to the parser and decide the next step.
fn process_buffer(core: &Arc<ServerCore>, slot: usize, id: u64) {
    let next = core.with_conn(slot, id, |conn| {
        if conn.buf.is_empty() {
            return Next::Read;
        }
        match conn.parser.read(&conn.buf) {
            Err(e) => {
                let status = if e.status == 0 { 400 } else { e.status };
                Next::Fail(ErrorResponse::new(status, e.message))
            }
            Ok(used) => {
                conn.buf.drain(..used);
                if conn.parser.is_completed() {
                    match build_request(&mut conn.parser) {
                        Ok(req) => {
                            let wants = req.headers.get("Connection");
                            conn.keep_alive = wants.eq_ignore_ascii_case("keep-alive");
                            Next::Handle(req)
                        }
                        Err(err) => Next::Fail(err),
                    }
                } else if used == 0 && conn.buf.len() >= LINE_SIZE {
                    if conn.parser.state() == State::Start {
                        Next::Fail(ErrorResponse::new(414, "Request line too long"))
                    } else {
                        Next::Fail(ErrorResponse::new(431, "Header line too long"))
                    }
                } else {
                    Next::Read
                }
            }
        }
    });

    match next {
        None => {}
        Some(Next::Read) => start_read(core, slot, id),
        Some(Next::Handle(req)) => handle_request(core, slot, id, req),
        Some(Next::Fail(err)) => fail_request(core, slot, id, err),
    }
}

fn overlong(core: &Arc<ServerCore>, slot: usize, id: u64) {
    let err = match core.with_conn(slot, id, |conn| conn.parser.state()) {
        Some(State::Start) => ErrorResponse::new(414, "Request line too long"),
        Some(_) => ErrorResponse::new(431, "Header line too long"),
        None => return,
    };
    fail_request(core, slot, id, err);
}

fn build_request(parser: &mut RequestParser) -> Result<Request, ErrorResponse> {
    let raw_url = parser.uri().to_owned();
    let url = Url::parse_request(&raw_url)
        .map_err(|e| ErrorResponse::bad_request(e.to_string()))?;
    Ok(Request {
        method: parser.method(),
        raw_url,
        url,
        headers: parser.take_headers(),
        body: parser.take_body(),
    })
}

/// Handling: route and run the user handler.
fn handle_request(core: &Arc<ServerCore>, slot: usize, id: u64, req: Request) {
    debug!("{} {}", req.method, req.raw_url);

    let result = match core.router.get(req.method, &req.url.path) {
        Ok(Some(matched)) => (matched.handler)(&req, &matched.path_params),
        Ok(None) => Err(ErrorResponse::not_found(&req.url.path).into()),
        Err(Error::MethodNotAllowed { method, path }) => {
            Err(ErrorResponse::method_not_allowed(method, &path).into())
        }
        Err(e) => Err(e),
    };

    let resp = match result {
        Ok(resp) => resp,
        Err(Error::ErrorResponse(err)) => {
            core.with_conn(slot, id, |conn| conn.keep_alive = false);
            Response::text(err.status, err.message)
        }
        Err(e) => {
            core.with_conn(slot, id, |conn| conn.keep_alive = false);
            Response::text(500, e.to_string())
        }
    };

    write_response(core, slot, id, resp, req.method);
}

/// A request that failed before it could be routed: answer with the error's
/// message and status, then close.
fn fail_request(core: &Arc<ServerCore>, slot: usize, id: u64, err: ErrorResponse) {
    let alive = core
        .with_conn(slot, id, |conn| conn.keep_alive = false)
        .is_some();
    if alive {
        write_response(core, slot, id, Response::text(err.status, err.message), Method::Get);
    }
}

/// Writing: headers first, then the body unless suppressed.
fn write_response(
    core: &Arc<ServerCore>,
    slot: usize,
    id: u64,
    mut resp: Response,
    req_method: Method,
) {
    let keep_alive = match core.with_conn(slot, id, |conn| conn.keep_alive) {
        Some(v) => v,
        None => return,
    };
    resp.headers.set(
        "Connection",
        if keep_alive { "keep-alive" } else { "close" },
    );

    let head = match writer::encode_response_head(&mut resp) {
        Ok(head) => head,
        Err(e) => {
            // handler produced an unwritable response, e.g. a body on a 204
            error!("{}", e);
            core.with_conn(slot, id, |conn| conn.keep_alive = false);
            resp = Response::text(500, e.to_string());
            resp.headers.set("Connection", "close");
            match writer::encode_response_head(&mut resp) {
                Ok(head) => head,
                Err(_) => return,
            }
        }
    };

    let send_body = req_method != Method::Head
        && !writer::status_forbids_body(resp.status.code)
        && !resp.body.is_empty();
    let body = std::mem::take(&mut resp.body);

    let sock = match core.submit_sock(slot, id) {
        Some(sock) => sock,
        None => return,
    };

    let on_sent = {
        let core = core.clone();
        move |_n: usize| {
            if !send_body {
                finish_request(&core, slot, id);
                return;
            }
            let sock = match core.submit_sock(slot, id) {
                Some(sock) => sock,
                None => return,
            };
            let done = {
                let core = core.clone();
                move |_n: usize| finish_request(&core, slot, id)
            };
            let fail = {
                let core = core.clone();
                move |e: Error| send_failed(&core, slot, id, e)
            };
            sock.async_send_all(&core.io, body, done, fail);
        }
    };
    let on_error = {
        let core = core.clone();
        move |e: Error| send_failed(&core, slot, id, e)
    };
    sock.async_send_all(&core.io, head, on_sent, on_error);
}

fn send_failed(core: &Arc<ServerCore>, slot: usize, id: u64, e: Error) {
    match e {
        Error::Aborted => trace!("send aborted during shutdown"),
        e => debug!("send failed: {}", e),
    }
    drop(core.remove(slot, id));
}

/// KeepAlive: either reset for the next request or close gracefully.
fn finish_request(core: &Arc<ServerCore>, slot: usize, id: u64) {
    let again = core.with_conn(slot, id, |conn| {
        if conn.keep_alive {
            conn.parser.reset();
            true
        } else {
            false
        }
    });
    match again {
        Some(true) => process_buffer(core, slot, id),
        Some(false) => close_graceful(core, slot, id),
        None => {}
    }
}

fn close_graceful(core: &Arc<ServerCore>, slot: usize, id: u64) {
    if let Some(conn) = core.remove(slot, id) {
        trace!("closing {}", conn.peer);
        let peer = conn.peer;
        conn.sock.async_disconnect(&core.io, move || {
            trace!("closed {}", peer);
        });
    }
}
