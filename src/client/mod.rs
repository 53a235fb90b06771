//! HTTP clients: a blocking per-connection client and a pooled async one.
//!
//! [`AsyncClient`] keeps a FIFO queue of requests and `max_connections`
//! worker threads, each owning one connection to the configured host.
//! Requests start in queue order; because they run in parallel, completion
//! order is unspecified. Keep-alive connections are reused, a configurable
//! rate limit caps request starts per second, and every queued request is
//! fulfilled exactly once: with a response, with an error, or with `None`
//! when aborted or dropped in a client shutdown.
//!
//! [`AsyncClient`]: struct.AsyncClient.html

mod conn;

pub use conn::ClientConnection;

use crate::error::Error;
use crate::headers::Headers;
use crate::net::{DefaultSocketFactory, SocketFactory};
use crate::request::Request;
use crate::response::Response;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Callback invoked on the worker thread after a successful response,
/// before the pending handle is fulfilled.
pub type CompletionFn = Box<dyn FnOnce(&Request, &Response) + Send>;
/// Callback invoked on the worker thread before an error is delivered.
pub type ExceptionFn = Box<dyn FnOnce(&Request) + Send>;
/// What a queued request resolves to: a response, `None` when aborted or
/// dropped in a shutdown, or the error that failed it.
pub type Outcome = Result<Option<Response>, Error>;

/// Configuration for [`AsyncClient`].
///
/// [`AsyncClient`]: struct.AsyncClient.html
pub struct AsyncClientParams {
    /// Host to connect to.
    pub host: String,
    /// Port to connect to.
    pub port: u16,
    /// Wrap connections in TLS.
    pub tls: bool,
    /// Worker connections. More connections improve throughput against the
    /// blocking request/response cycle, at the cost of server-side load.
    pub max_connections: usize,
    /// Max requests started per second across all connections; 0 or
    /// negative means unlimited.
    pub rate_limit: i32,
    /// Headers added to each request that does not already carry them.
    /// `Host` is filled in from `host:port` unless set here.
    pub default_headers: Headers,
    /// Factory for the worker connections.
    pub socket_factory: Arc<dyn SocketFactory>,
}

impl AsyncClientParams {
    pub fn new(host: impl Into<String>, port: u16) -> AsyncClientParams {
        AsyncClientParams {
            host: host.into(),
            port,
            tls: false,
            max_connections: 4,
            rate_limit: 0,
            default_headers: Headers::new(),
            socket_factory: Arc::new(DefaultSocketFactory),
        }
    }
}

/// The pending side of a queued request. `wait` blocks for the outcome:
/// `Ok(Some(response))`, `Ok(None)` when the request was aborted or the
/// client shut down before starting it, or the error that failed it.
pub struct AsyncRequest {
    id: u64,
    rx: mpsc::Receiver<Outcome>,
}

impl AsyncRequest {
    pub fn wait(self) -> Outcome {
        match self.rx.recv() {
            Ok(outcome) => outcome,
            Err(_) => Ok(None),
        }
    }
}

struct QueuedRequest {
    id: u64,
    req: Request,
    tx: mpsc::Sender<Outcome>,
    on_completion: Option<CompletionFn>,
    on_exception: Option<ExceptionFn>,
}

impl QueuedRequest {
    fn fulfil(mut self, resp: Response) {
        if let Some(cb) = self.on_completion.take() {
            cb(&self.req, &resp);
        }
        let _ = self.tx.send(Ok(Some(resp)));
    }

    fn fail(mut self, e: Error) {
        if let Some(cb) = self.on_exception.take() {
            // a failing exception callback must not mask the real error
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(&self.req)));
        }
        let _ = self.tx.send(Err(e));
    }

    fn abort(self) {
        let _ = self.tx.send(Ok(None));
    }
}

struct RateLimiter {
    limit: i32,
    allowance: AtomicI32,
    last_refill: Mutex<u64>,
}

impl RateLimiter {
    fn new(limit: i32) -> RateLimiter {
        RateLimiter {
            limit,
            allowance: AtomicI32::new(limit.max(0)),
            last_refill: Mutex::new(now_secs()),
        }
    }

    /// Take one token, sleeping into the next second when the current one
    /// is spent. Simultaneous under-flow across workers can let a small
    /// burst above the limit through; the bound is limit + workers.
    fn acquire(&self) {
        if self.limit <= 0 {
            return;
        }
        loop {
            if self.allowance.fetch_sub(1, Ordering::SeqCst) > 0 {
                return;
            }
            let mut last = self.last_refill.lock().unwrap();
            let next_ms = (*last + 1) * 1000;
            let now_ms = now_millis();
            if now_ms < next_ms {
                thread::sleep(Duration::from_millis(next_ms - now_ms));
            }
            *last = now_secs();
            self.allowance.store(self.limit, Ordering::SeqCst);
            // retry the decrement alongside the other workers
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn now_secs() -> u64 {
    now_millis() / 1000
}

struct ClientInner {
    params: AsyncClientParams,
    queue: Mutex<VecDeque<QueuedRequest>>,
    cond: Condvar,
    exiting: AtomicBool,
}

/// HTTP client using background threads to process requests.
///
/// See [`AsyncClientParams`] for configuration. The client starts its
/// workers on construction and joins them on [`exit`] or drop.
///
/// [`AsyncClientParams`]: struct.AsyncClientParams.html
/// [`exit`]: #method.exit
pub struct AsyncClient {
    inner: Arc<ClientInner>,
    rate: Arc<RateLimiter>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl AsyncClient {
    pub fn new(mut params: AsyncClientParams) -> Result<AsyncClient, Error> {
        if params.max_connections == 0 {
            return Err(Error::User("max_connections must be non-zero".into()));
        }
        params
            .default_headers
            .set_default("Host", format!("{}:{}", params.host, params.port));

        let rate = Arc::new(RateLimiter::new(params.rate_limit));
        let client = AsyncClient {
            inner: Arc::new(ClientInner {
                params,
                queue: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                exiting: AtomicBool::new(false),
            }),
            rate,
            threads: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        };
        client.start();
        Ok(client)
    }

    /// Start processing requests. The client is constructed started; this
    /// only matters after an [`exit`].
    ///
    /// [`exit`]: #method.exit
    pub fn start(&self) {
        self.inner.exiting.store(false, Ordering::SeqCst);
        let mut threads = self.threads.lock().unwrap();
        while threads.len() < self.inner.params.max_connections {
            let inner = self.inner.clone();
            let rate = self.rate.clone();
            let handle = thread::Builder::new()
                .name(format!("hwire-client-{}", threads.len()))
                .spawn(move || worker(inner, rate))
                .expect("spawn client worker");
            threads.push(handle);
        }
    }

    /// Queue a request. Returns the pending handle immediately; its use is
    /// optional when callbacks do the work.
    pub fn queue(&self, req: Request) -> Result<AsyncRequest, Error> {
        self.queue_with(req, None, None)
    }

    /// Queue a request with optional callbacks. `on_completion` runs on the
    /// worker thread after a successful response, before the pending handle
    /// is fulfilled; `on_exception` runs before an error is delivered. For
    /// each request exactly one of completion, exception or abort happens.
    pub fn queue_with(
        &self,
        req: Request,
        on_completion: Option<CompletionFn>,
        on_exception: Option<ExceptionFn>,
    ) -> Result<AsyncRequest, Error> {
        if self.inner.exiting.load(Ordering::SeqCst) {
            return Err(Error::Aborted);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.push_back(QueuedRequest {
                id,
                req,
                tx,
                on_completion,
                on_exception,
            });
            self.inner.cond.notify_one();
        }
        Ok(AsyncRequest { id, rx })
    }

    /// Abort a pending request. Succeeds only while it is still queued, in
    /// which case its handle yields `Ok(None)`. An in-flight request runs
    /// to completion.
    pub fn abort(&self, pending: &AsyncRequest) -> bool {
        let removed = {
            let mut queue = self.inner.queue.lock().unwrap();
            match queue.iter().position(|item| item.id == pending.id) {
                Some(at) => queue.remove(at),
                None => None,
            }
        };
        match removed {
            Some(item) => {
                item.abort();
                true
            }
            None => false,
        }
    }

    /// Stop the workers and join them. Requests already being processed run
    /// to completion; still-queued ones are fulfilled with `Ok(None)`.
    pub fn exit(&self) {
        {
            let _queue = self.inner.queue.lock().unwrap();
            self.inner.exiting.store(true, Ordering::SeqCst);
            self.inner.cond.notify_all();
        }
        let threads = {
            let mut threads = self.threads.lock().unwrap();
            std::mem::take(&mut *threads)
        };
        for handle in threads {
            let _ = handle.join();
        }
        let orphans = {
            let mut queue = self.inner.queue.lock().unwrap();
            std::mem::take(&mut *queue)
        };
        for item in orphans {
            item.abort();
        }
    }
}

impl Drop for AsyncClient {
    fn drop(&mut self) {
        self.exit();
    }
}

fn worker(inner: Arc<ClientInner>, rate: Arc<RateLimiter>) {
    let mut conn = ClientConnection::new();
    loop {
        let item = {
            let mut queue = inner.queue.lock().unwrap();
            loop {
                if inner.exiting.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(item) = queue.pop_front() {
                    break item;
                }
                queue = inner.cond.wait(queue).unwrap();
            }
        };
        process_request(&inner, &rate, &mut conn, item);
    }
}

fn process_request(
    inner: &ClientInner,
    rate: &RateLimiter,
    conn: &mut ClientConnection,
    mut item: QueuedRequest,
) {
    for (name, value) in &inner.params.default_headers {
        item.req.headers.set_default(name, value.clone());
    }

    rate.acquire();

    // try the kept keep-alive connection first; a socket-level failure
    // there only means the server closed it in the meantime
    let mut sent = false;
    if conn.is_connected() {
        match conn.send_request(&mut item.req) {
            Ok(()) => sent = true,
            Err(Error::Socket(e)) => {
                trace!("keep-alive connection went stale: {}", e);
                conn.discard();
            }
            Err(e) => {
                conn.discard();
                item.fail(e);
                return;
            }
        }
    }

    if !sent {
        let params = &inner.params;
        let socket = match params
            .socket_factory
            .connect(&params.host, params.port, params.tls)
        {
            Ok(socket) => socket,
            Err(e) => {
                item.fail(e);
                return;
            }
        };
        conn.reset(socket);
        if let Err(e) = conn.send_request(&mut item.req) {
            conn.discard();
            item.fail(e);
            return;
        }
    }

    match conn.recv_response() {
        Ok(resp) => item.fulfil(resp),
        Err(e) => {
            // the stream position is unknown; this connection is done
            conn.discard();
            item.fail(e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Instant;

    #[test]
    fn rate_limiter_unlimited_never_blocks() {
        let rate = RateLimiter::new(0);
        let start = Instant::now();
        for _ in 0..10_000 {
            rate.acquire();
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn rate_limiter_within_allowance_is_fast() {
        let rate = RateLimiter::new(1000);
        let start = Instant::now();
        for _ in 0..100 {
            rate.acquire();
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn rate_limiter_refills_when_spent() {
        let rate = RateLimiter::new(2);
        rate.acquire();
        rate.acquire();
        // the third token only exists after a refill boundary
        rate.acquire();
        assert_eq!(rate.allowance.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn max_connections_must_be_positive() {
        let mut params = AsyncClientParams::new("localhost", 80);
        params.max_connections = 0;
        assert!(AsyncClient::new(params).is_err());
    }

    #[test]
    fn host_default_header() {
        let params = AsyncClientParams::new("example.com", 8080);
        let client = AsyncClient::new(params).unwrap();
        assert_eq!(
            client.inner.params.default_headers.get("Host"),
            "example.com:8080"
        );
        client.exit();
    }
}
