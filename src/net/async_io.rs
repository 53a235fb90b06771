//! Single-threaded asynchronous socket I/O.
//!
//! [`AsyncIo`] multiplexes accept/recv/send completions for many sockets on
//! one dispatcher thread. Operations may be submitted from any thread; the
//! completions always run on the thread inside [`run`], so handlers must not
//! block. Operations on the same socket start in submission order and their
//! completions fire in submission order; completions for different sockets
//! interleave freely.
//!
//! The reactor holds sockets only by file descriptor. Ownership stays with
//! the submitter, which must keep the socket alive (and non-blocking) until
//! the completion or error handler has run.
//!
//! A handler that panics tears down the dispatcher; the reactor cannot
//! recover without application knowledge.
//!
//! [`AsyncIo`]: struct.AsyncIo.html
//! [`run`]: struct.AsyncIo.html#method.run

use crate::error::Error;
use crate::net::tcp::TcpSocket;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::mem::ManuallyDrop;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::{Arc, Condvar, Mutex};

const WAKER_TOKEN: Token = Token(usize::MAX);

type AcceptHandler = Box<dyn FnOnce(TcpSocket) + Send>;
type RecvHandler = Box<dyn FnOnce(Vec<u8>) + Send>;
type SendHandler = Box<dyn FnOnce(usize) + Send>;
type ErrorHandler = Box<dyn FnOnce(Error) + Send>;

enum Kind {
    Accept {
        on_done: AcceptHandler,
    },
    Recv {
        max: usize,
        on_done: RecvHandler,
    },
    Send {
        data: Vec<u8>,
        sent: usize,
        all: bool,
        on_done: SendHandler,
    },
}

struct Op {
    fd: RawFd,
    kind: Kind,
    on_err: ErrorHandler,
}

impl Op {
    fn abort(self) {
        (self.on_err)(Error::Aborted);
    }
}

#[derive(Default)]
struct FdOps {
    // accept and recv share read readiness
    read: VecDeque<Op>,
    write: VecDeque<Op>,
    registered: Option<Interest>,
}

impl FdOps {
    fn wanted(&self) -> Option<Interest> {
        match (self.read.is_empty(), self.write.is_empty()) {
            (false, false) => Some(Interest::READABLE | Interest::WRITABLE),
            (false, true) => Some(Interest::READABLE),
            (true, false) => Some(Interest::WRITABLE),
            (true, true) => None,
        }
    }
}

struct Shared {
    queue: Vec<Op>,
    exiting: bool,
    running: bool,
    poll: Option<Poll>,
}

struct Inner {
    waker: Waker,
    shared: Mutex<Shared>,
    drained: Condvar,
}

/// Handle to the reactor. Clones share the same dispatcher.
#[derive(Clone)]
pub struct AsyncIo {
    inner: Arc<Inner>,
}

impl AsyncIo {
    pub fn new() -> Result<AsyncIo, Error> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(AsyncIo {
            inner: Arc::new(Inner {
                waker,
                shared: Mutex::new(Shared {
                    queue: Vec::new(),
                    exiting: false,
                    running: false,
                    poll: Some(poll),
                }),
                drained: Condvar::new(),
            }),
        })
    }

    /// Accept one connection on a listening socket. The accepted socket is
    /// set non-blocking before it is handed to `on_accept`.
    pub fn accept(
        &self,
        fd: RawFd,
        on_accept: impl FnOnce(TcpSocket) + Send + 'static,
        on_error: impl FnOnce(Error) + Send + 'static,
    ) {
        self.submit(Op {
            fd,
            kind: Kind::Accept {
                on_done: Box::new(on_accept),
            },
            on_err: Box::new(on_error),
        });
    }

    /// Receive up to `max` bytes. The completion gets the bytes read; an
    /// empty buffer means the peer closed the connection in an orderly way.
    pub fn recv(
        &self,
        fd: RawFd,
        max: usize,
        on_done: impl FnOnce(Vec<u8>) + Send + 'static,
        on_error: impl FnOnce(Error) + Send + 'static,
    ) {
        self.submit(Op {
            fd,
            kind: Kind::Recv {
                max,
                on_done: Box::new(on_done),
            },
            on_err: Box::new(on_error),
        });
    }

    /// Send as much of `data` as a single successful write manages. The
    /// completion reports the byte count.
    pub fn send(
        &self,
        fd: RawFd,
        data: Vec<u8>,
        on_done: impl FnOnce(usize) + Send + 'static,
        on_error: impl FnOnce(Error) + Send + 'static,
    ) {
        self.submit(Op {
            fd,
            kind: Kind::Send {
                data,
                sent: 0,
                all: false,
                on_done: Box::new(on_done),
            },
            on_err: Box::new(on_error),
        });
    }

    /// Send all of `data`, looping inside the reactor until done or failed.
    pub fn send_all(
        &self,
        fd: RawFd,
        data: Vec<u8>,
        on_done: impl FnOnce(usize) + Send + 'static,
        on_error: impl FnOnce(Error) + Send + 'static,
    ) {
        self.submit(Op {
            fd,
            kind: Kind::Send {
                data,
                sent: 0,
                all: true,
                on_done: Box::new(on_done),
            },
            on_err: Box::new(on_error),
        });
    }

    fn submit(&self, op: Op) {
        let aborted = {
            let mut shared = self.inner.shared.lock().unwrap();
            if shared.exiting {
                Some(op)
            } else {
                shared.queue.push(op);
                None
            }
        };
        if let Some(op) = aborted {
            op.abort();
            return;
        }
        // waking when the loop is not (yet) running is harmless
        let _ = self.inner.waker.wake();
    }

    /// Set the exit flag, wake the dispatcher, and block until it has
    /// drained. Every pending operation fails with [`Error::Aborted`].
    ///
    /// [`Error::Aborted`]: ../enum.Error.html#variant.Aborted
    pub fn exit(&self) {
        let mut shared = self.inner.shared.lock().unwrap();
        shared.exiting = true;
        let _ = self.inner.waker.wake();
        let orphans = if shared.running {
            while shared.running {
                shared = self.inner.drained.wait(shared).unwrap();
            }
            Vec::new()
        } else {
            // never ran (or already drained); abort queued ops here
            std::mem::take(&mut shared.queue)
        };
        drop(shared);
        for op in orphans {
            op.abort();
        }
    }

    /// Run the dispatcher on the calling thread until [`exit`] is called.
    ///
    /// [`exit`]: #method.exit
    pub fn run(&self) -> Result<(), Error> {
        let mut poll = {
            let mut shared = self.inner.shared.lock().unwrap();
            if shared.exiting {
                return Ok(());
            }
            let poll = shared
                .poll
                .take()
                .ok_or_else(|| Error::User("AsyncIo::run() may only be called once".into()))?;
            shared.running = true;
            poll
        };

        let result = self.run_loop(&mut poll);

        let mut shared = self.inner.shared.lock().unwrap();
        shared.running = false;
        let orphans = std::mem::take(&mut shared.queue);
        drop(shared);
        for op in orphans {
            op.abort();
        }
        self.inner.drained.notify_all();
        result
    }

    fn run_loop(&self, poll: &mut Poll) -> Result<(), Error> {
        let mut events = Events::with_capacity(256);
        let mut fds: HashMap<RawFd, FdOps> = HashMap::new();

        loop {
            // pick up newly submitted operations
            let (new_ops, exiting) = {
                let mut shared = self.inner.shared.lock().unwrap();
                (std::mem::take(&mut shared.queue), shared.exiting)
            };
            if exiting {
                trace!("reactor exiting, aborting {} fds", fds.len());
                for (fd, ops) in fds.drain() {
                    if ops.registered.is_some() {
                        let _ = poll.registry().deregister(&mut SourceFd(&fd));
                    }
                    for op in ops.read.into_iter().chain(ops.write) {
                        op.abort();
                    }
                }
                for op in new_ops {
                    op.abort();
                }
                return Ok(());
            }
            for op in new_ops {
                let fd = op.fd;
                let entry = fds.entry(fd).or_default();
                match op.kind {
                    Kind::Accept { .. } | Kind::Recv { .. } => entry.read.push_back(op),
                    Kind::Send { .. } => entry.write.push_back(op),
                }
                if let Err(e) = update_registration(poll, fd, entry) {
                    // a stale descriptor fails the ops on it, not the loop
                    if let Some(ops) = fds.remove(&fd) {
                        fail_fd_ops(ops, e);
                    }
                }
            }

            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                let fd = event.token().0 as RawFd;
                let mut ops = match fds.remove(&fd) {
                    Some(ops) => ops,
                    None => continue,
                };
                // drain until would-block; edge-triggered readiness
                process_read_ops(&mut ops.read);
                process_write_ops(&mut ops.write);
                match update_registration(poll, fd, &mut ops) {
                    Ok(Some(_)) => {
                        fds.insert(fd, ops);
                    }
                    Ok(None) => {}
                    Err(e) => fail_fd_ops(ops, e),
                }
            }
        }
    }
}

/// Sync the mio registration with the wanted interest. Returns the interest
/// still registered, if any.
fn update_registration(
    poll: &mut Poll,
    fd: RawFd,
    ops: &mut FdOps,
) -> Result<Option<Interest>, std::io::Error> {
    let wanted = ops.wanted();
    if wanted == ops.registered {
        return Ok(wanted);
    }
    let registry = poll.registry();
    match (ops.registered, wanted) {
        (None, Some(interest)) => {
            registry.register(&mut SourceFd(&fd), Token(fd as usize), interest)?
        }
        (Some(_), Some(interest)) => {
            registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interest)?
        }
        (Some(_), None) => {
            // a completion may have closed the descriptor already, which
            // removed it from the poller
            let _ = registry.deregister(&mut SourceFd(&fd));
        }
        (None, None) => {}
    }
    ops.registered = wanted;
    Ok(wanted)
}

fn fail_fd_ops(ops: FdOps, e: std::io::Error) {
    let kind = e.kind();
    for op in ops.read.into_iter().chain(ops.write) {
        (op.on_err)(Error::Socket(std::io::Error::new(kind, e.to_string())));
    }
}

// The reactor does not own the sockets; it borrows the descriptor for the
// duration of one OS call. ManuallyDrop keeps the borrowed handle from
// closing the descriptor.
fn borrow_stream<R>(fd: RawFd, f: impl FnOnce(&mut TcpStream) -> R) -> R {
    let mut stream = ManuallyDrop::new(unsafe { TcpStream::from_raw_fd(fd) });
    f(&mut stream)
}

fn borrow_listener<R>(fd: RawFd, f: impl FnOnce(&mut TcpListener) -> R) -> R {
    let mut listener = ManuallyDrop::new(unsafe { TcpListener::from_raw_fd(fd) });
    f(&mut listener)
}

fn process_read_ops(queue: &mut VecDeque<Op>) {
    while let Some(op) = queue.pop_front() {
        match op.kind {
            Kind::Accept { on_done } => {
                match borrow_listener(op.fd, |l| l.accept()) {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nonblocking(true) {
                            (op.on_err)(Error::Socket(e));
                            continue;
                        }
                        on_done(TcpSocket::from_accepted(stream, peer));
                    }
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        queue.push_front(Op {
                            fd: op.fd,
                            kind: Kind::Accept { on_done },
                            on_err: op.on_err,
                        });
                        return;
                    }
                    Err(e) => (op.on_err)(Error::Socket(e)),
                }
            }
            Kind::Recv { max, on_done } => {
                let mut buf = vec![0u8; max];
                match borrow_stream(op.fd, |s| s.read(&mut buf)) {
                    Ok(n) => {
                        buf.truncate(n);
                        on_done(buf);
                    }
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        queue.push_front(Op {
                            fd: op.fd,
                            kind: Kind::Recv { max, on_done },
                            on_err: op.on_err,
                        });
                        return;
                    }
                    Err(e) => (op.on_err)(Error::Socket(e)),
                }
            }
            Kind::Send { .. } => unreachable!("send op in read queue"),
        }
    }
}

fn process_write_ops(queue: &mut VecDeque<Op>) {
    while let Some(op) = queue.pop_front() {
        let Op { fd, kind, on_err } = op;
        let (data, mut sent, all, on_done) = match kind {
            Kind::Send {
                data,
                sent,
                all,
                on_done,
            } => (data, sent, all, on_done),
            _ => unreachable!("non-send op in write queue"),
        };
        loop {
            match borrow_stream(fd, |s| s.write(&data[sent..])) {
                Ok(0) => {
                    on_err(Error::Socket(std::io::Error::new(
                        ErrorKind::WriteZero,
                        "socket send returned 0",
                    )));
                    break;
                }
                Ok(n) => {
                    sent += n;
                    if sent == data.len() || !all {
                        on_done(sent);
                        break;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    queue.push_front(Op {
                        fd,
                        kind: Kind::Send {
                            data,
                            sent,
                            all,
                            on_done,
                        },
                        on_err,
                    });
                    return;
                }
                Err(e) => {
                    on_err(Error::Socket(e));
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;
    use std::os::unix::io::AsRawFd;
    use std::sync::mpsc;
    use std::thread;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    #[test]
    fn recv_completes_with_data() {
        let io = AsyncIo::new().unwrap();
        let (a, mut b) = pair();
        a.set_nonblocking(true).unwrap();

        let (tx, rx) = mpsc::channel();
        io.recv(
            a.as_raw_fd(),
            64,
            move |data| tx.send(data).unwrap(),
            |e| panic!("recv error: {}", e),
        );

        let io2 = io.clone();
        let runner = thread::spawn(move || io2.run().unwrap());

        b.write_all(b"hello").unwrap();
        assert_eq!(rx.recv().unwrap(), b"hello");

        io.exit();
        runner.join().unwrap();
    }

    #[test]
    fn recv_zero_on_close() {
        let io = AsyncIo::new().unwrap();
        let (a, b) = pair();
        a.set_nonblocking(true).unwrap();

        let (tx, rx) = mpsc::channel();
        io.recv(
            a.as_raw_fd(),
            64,
            move |data| tx.send(data).unwrap(),
            |e| panic!("recv error: {}", e),
        );

        let io2 = io.clone();
        let runner = thread::spawn(move || io2.run().unwrap());

        drop(b);
        assert_eq!(rx.recv().unwrap(), b"");

        io.exit();
        runner.join().unwrap();
    }

    #[test]
    fn recv_order_is_submission_order() {
        let io = AsyncIo::new().unwrap();
        let (a, mut b) = pair();
        a.set_nonblocking(true).unwrap();

        let (tx, rx) = mpsc::channel();
        for i in 0..3u8 {
            let tx = tx.clone();
            io.recv(
                a.as_raw_fd(),
                1,
                move |data| tx.send((i, data)).unwrap(),
                |e| panic!("recv error: {}", e),
            );
        }

        let io2 = io.clone();
        let runner = thread::spawn(move || io2.run().unwrap());

        b.write_all(b"xyz").unwrap();
        assert_eq!(rx.recv().unwrap(), (0, b"x".to_vec()));
        assert_eq!(rx.recv().unwrap(), (1, b"y".to_vec()));
        assert_eq!(rx.recv().unwrap(), (2, b"z".to_vec()));

        io.exit();
        runner.join().unwrap();
    }

    #[test]
    fn send_all_large_buffer() {
        let io = AsyncIo::new().unwrap();
        let (a, mut b) = pair();
        a.set_nonblocking(true).unwrap();

        let big = vec![7u8; 1_000_000];
        let (tx, rx) = mpsc::channel();
        io.send_all(
            a.as_raw_fd(),
            big.clone(),
            move |n| tx.send(n).unwrap(),
            |e| panic!("send error: {}", e),
        );

        let io2 = io.clone();
        let runner = thread::spawn(move || io2.run().unwrap());

        let mut got = Vec::new();
        let mut buf = [0u8; 65536];
        while got.len() < big.len() {
            let n = b.read(&mut buf).unwrap();
            assert!(n > 0);
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(rx.recv().unwrap(), big.len());
        assert_eq!(got, big);

        io.exit();
        runner.join().unwrap();
    }

    #[test]
    fn exit_aborts_pending() {
        let io = AsyncIo::new().unwrap();
        let (a, _b) = pair();
        a.set_nonblocking(true).unwrap();

        let (tx, rx) = mpsc::channel();
        io.recv(
            a.as_raw_fd(),
            64,
            |_| panic!("should not complete"),
            move |e| tx.send(e).unwrap(),
        );

        let io2 = io.clone();
        let runner = thread::spawn(move || io2.run().unwrap());

        io.exit();
        runner.join().unwrap();

        match rx.recv().unwrap() {
            Error::Aborted => {}
            other => panic!("expected abort, got {}", other),
        }
    }
}
