//! Stream sockets, plain and TLS, with blocking and reactor-driven I/O.

mod async_io;
mod tcp;
mod tls;

pub use async_io::AsyncIo;
pub use tcp::{TcpListenSocket, TcpSocket};
pub use tls::{PrivateCert, TlsSocket};

use crate::error::Error;
use std::os::unix::io::RawFd;
use std::sync::Once;

/// Process-wide networking initialisation. Idempotent; called implicitly
/// before any socket is created. Prepares the TLS client configuration,
/// which loads the system trust store once.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        debug!("initialising networking");
        let _ = tls::client_config();
    });
}

/// A connected stream socket: plain TCP or TLS over TCP.
///
/// The socket exclusively owns its OS handle; moving the value transfers
/// ownership and dropping closes it. The async operations delegate to an
/// [`AsyncIo`] reactor and hand their results to completions running on the
/// reactor thread.
///
/// [`AsyncIo`]: struct.AsyncIo.html
pub enum Socket {
    Tcp(TcpSocket),
    Tls(TlsSocket),
}

impl Socket {
    pub fn native_handle(&self) -> RawFd {
        match self {
            Socket::Tcp(s) => s.native_handle(),
            Socket::Tls(s) => s.native_handle(),
        }
    }

    pub fn peer_address_string(&self) -> String {
        match self {
            Socket::Tcp(s) => s.peer_address_string().to_owned(),
            Socket::Tls(s) => s.peer_address_string().to_owned(),
        }
    }

    /// Receive into `buf`; 0 means the peer closed in an orderly way.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        match self {
            Socket::Tcp(s) => s.recv(buf),
            Socket::Tls(s) => s.recv(buf),
        }
    }

    /// Send from `buf`, returning the (plaintext) bytes accepted.
    pub fn send(&mut self, buf: &[u8]) -> Result<usize, Error> {
        match self {
            Socket::Tcp(s) => s.send(buf),
            Socket::Tls(s) => s.send(buf),
        }
    }

    /// Send all of `buf`; a zero-byte send is an error.
    pub fn send_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        match self {
            Socket::Tcp(s) => s.send_all(buf),
            Socket::Tls(s) => s.send_all(buf),
        }
    }

    /// True if bytes are buffered locally above the OS socket.
    pub fn recv_pending(&self) -> bool {
        match self {
            Socket::Tcp(s) => s.recv_pending(),
            Socket::Tls(s) => s.recv_pending(),
        }
    }

    /// Non-blocking probe that succeeds only on a clean remote close.
    pub fn check_recv_disconnect(&mut self) -> Result<bool, Error> {
        match self {
            Socket::Tcp(s) => s.check_recv_disconnect(),
            Socket::Tls(s) => s.check_recv_disconnect(),
        }
    }

    /// Graceful shutdown with a brief drain, then close.
    pub fn disconnect(self) {
        match self {
            Socket::Tcp(s) => s.disconnect(),
            Socket::Tls(s) => s.disconnect(),
        }
    }

    /// Receive up to `max` bytes through the reactor. The completion gets
    /// decrypted bytes; empty means the peer closed.
    pub fn async_recv(
        &self,
        io: &AsyncIo,
        max: usize,
        on_done: impl FnOnce(Vec<u8>) + Send + 'static,
        on_error: impl FnOnce(Error) + Send + 'static,
    ) {
        match self {
            Socket::Tcp(s) => s.async_recv(io, max, on_done, on_error),
            Socket::Tls(s) => s.async_recv(io, max, on_done, on_error),
        }
    }

    /// Send through the reactor without the all-or-error guarantee. For TLS
    /// this still encrypts and sends whole records.
    pub fn async_send(
        &self,
        io: &AsyncIo,
        data: Vec<u8>,
        on_done: impl FnOnce(usize) + Send + 'static,
        on_error: impl FnOnce(Error) + Send + 'static,
    ) {
        match self {
            Socket::Tcp(s) => s.async_send(io, data, on_done, on_error),
            // one tls record roundtrip always covers the whole buffer
            Socket::Tls(s) => s.async_send_all(io, data, on_done, on_error),
        }
    }

    /// Send all of `data` through the reactor. The completion reports the
    /// full (plaintext) length.
    pub fn async_send_all(
        &self,
        io: &AsyncIo,
        data: Vec<u8>,
        on_done: impl FnOnce(usize) + Send + 'static,
        on_error: impl FnOnce(Error) + Send + 'static,
    ) {
        match self {
            Socket::Tcp(s) => s.async_send_all(io, data, on_done, on_error),
            Socket::Tls(s) => s.async_send_all(io, data, on_done, on_error),
        }
    }

    /// Graceful shutdown through the reactor; the socket is released once
    /// `on_done` runs.
    pub fn async_disconnect(self, io: &AsyncIo, on_done: impl FnOnce() + Send + 'static) {
        match self {
            Socket::Tcp(s) => s.async_disconnect(io, on_done),
            Socket::Tls(s) => s.async_disconnect(io, on_done),
        }
    }
}

/// A submission handle detached from socket ownership, so reactor
/// operations can be started without holding whatever lock guards the
/// owning connection. TLS completions may run synchronously.
pub(crate) enum IoHandle {
    Tcp(RawFd),
    Tls(TlsSocket),
}

impl Socket {
    pub(crate) fn io_handle(&self) -> IoHandle {
        match self {
            Socket::Tcp(s) => IoHandle::Tcp(s.native_handle()),
            Socket::Tls(s) => IoHandle::Tls(s.handle_clone()),
        }
    }
}

impl IoHandle {
    pub(crate) fn async_recv(
        &self,
        io: &AsyncIo,
        max: usize,
        on_done: impl FnOnce(Vec<u8>) + Send + 'static,
        on_error: impl FnOnce(Error) + Send + 'static,
    ) {
        match self {
            IoHandle::Tcp(fd) => io.recv(*fd, max, on_done, on_error),
            IoHandle::Tls(s) => s.async_recv(io, max, on_done, on_error),
        }
    }

    pub(crate) fn async_send_all(
        &self,
        io: &AsyncIo,
        data: Vec<u8>,
        on_done: impl FnOnce(usize) + Send + 'static,
        on_error: impl FnOnce(Error) + Send + 'static,
    ) {
        match self {
            IoHandle::Tcp(fd) => io.send_all(*fd, data, on_done, on_error),
            IoHandle::Tls(s) => s.async_send_all(io, data, on_done, on_error),
        }
    }
}

/// Creates outbound sockets for the clients. Implementations must be usable
/// from multiple worker threads at once.
pub trait SocketFactory: Send + Sync {
    fn connect(&self, host: &str, port: u16, tls: bool) -> Result<Socket, Error>;
}

/// The stock factory: plain TCP, or a TLS client handshake verifying
/// against the system trust store.
#[derive(Debug, Default)]
pub struct DefaultSocketFactory;

impl SocketFactory for DefaultSocketFactory {
    fn connect(&self, host: &str, port: u16, tls: bool) -> Result<Socket, Error> {
        if tls {
            Ok(Socket::Tls(TlsSocket::connect(host, port)?))
        } else {
            Ok(Socket::Tcp(TcpSocket::connect(host, port)?))
        }
    }
}
