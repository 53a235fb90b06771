use crate::error::Error;
use crate::net::async_io::AsyncIo;
use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

/// How long `disconnect` waits for the remote FIN after half-closing.
const DISCONNECT_LINGER: Duration = Duration::from_secs(1);

/// A connected TCP stream socket.
///
/// The socket uniquely owns its OS handle; moves transfer it and dropping
/// closes it. Prefer [`disconnect`] over dropping for an orderly close.
///
/// [`disconnect`]: #method.disconnect
#[derive(Debug)]
pub struct TcpSocket {
    stream: TcpStream,
    peer: String,
}

impl TcpSocket {
    /// Resolve `host:port` and connect. IPv4 addresses are tried first; the
    /// first successful address wins.
    pub fn connect(host: &str, port: u16) -> Result<TcpSocket, Error> {
        crate::net::init();

        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::Connection {
                host: host.to_owned(),
                port,
                cause: e,
            })?
            .collect();

        let mut last_err = None;
        let ordered = addrs
            .iter()
            .filter(|a| a.is_ipv4())
            .chain(addrs.iter().filter(|a| a.is_ipv6()));
        for addr in ordered {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    trace!("connected {}:{} via {}", host, port, addr);
                    return Ok(TcpSocket {
                        stream,
                        peer: format!("{}:{}", host, port),
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(Error::Connection {
            host: host.to_owned(),
            port,
            cause: last_err
                .unwrap_or_else(|| ErrorKind::AddrNotAvailable.into()),
        })
    }

    /// Wrap a socket accepted from a listener.
    pub fn from_accepted(stream: TcpStream, peer: SocketAddr) -> TcpSocket {
        TcpSocket {
            stream,
            peer: peer.to_string(),
        }
    }

    pub fn native_handle(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    // the tls record layer reads and writes through the raw stream
    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// The peer as `host:port` for display purposes.
    pub fn peer_address_string(&self) -> &str {
        &self.peer
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), Error> {
        Ok(self.stream.set_nonblocking(nonblocking)?)
    }

    /// Receive into `buf`. 0 means the peer closed. A would-block error is
    /// reported as [`Error::Socket`] with kind `WouldBlock`.
    ///
    /// [`Error::Socket`]: ../enum.Error.html#variant.Socket
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        Ok(self.stream.read(buf)?)
    }

    /// Send from `buf`, returning the bytes accepted by the OS.
    pub fn send(&mut self, buf: &[u8]) -> Result<usize, Error> {
        Ok(self.stream.write(buf)?)
    }

    /// Send the whole of `buf`. A zero-length send is an error.
    pub fn send_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut sent = 0;
        while sent < buf.len() {
            let n = self.send(&buf[sent..])?;
            if n == 0 {
                return Err(Error::Socket(std::io::Error::new(
                    ErrorKind::WriteZero,
                    "socket send returned 0",
                )));
            }
            sent += n;
        }
        Ok(())
    }

    /// True if bytes are buffered locally above the OS socket. Always false
    /// for plain TCP.
    pub fn recv_pending(&self) -> bool {
        false
    }

    /// Non-blocking check whether the remote performed an orderly close.
    /// Receiving actual data here is a protocol violation and errors.
    pub fn check_recv_disconnect(&mut self) -> Result<bool, Error> {
        self.stream.set_nonblocking(true)?;
        let mut probe = [0u8; 1];
        let result = self.stream.peek(&mut probe);
        self.stream.set_nonblocking(false)?;
        match result {
            Ok(0) => Ok(true),
            Ok(_) => Err(Error::Network(
                "Unexpected data while checking for disconnect".into(),
            )),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(Error::Socket(e)),
        }
    }

    /// Orderly close: half-close the send side, wait briefly for the remote
    /// FIN, then release the handle.
    pub fn disconnect(self) {
        let _ = self.stream.shutdown(Shutdown::Write);
        let _ = self.stream.set_nonblocking(false);
        let _ = self.stream.set_read_timeout(Some(DISCONNECT_LINGER));
        let mut drain = [0u8; 256];
        let mut stream = self.stream;
        loop {
            match stream.read(&mut drain) {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }

    pub fn async_recv(
        &self,
        io: &AsyncIo,
        max: usize,
        on_done: impl FnOnce(Vec<u8>) + Send + 'static,
        on_error: impl FnOnce(Error) + Send + 'static,
    ) {
        io.recv(self.native_handle(), max, on_done, on_error);
    }

    pub fn async_send(
        &self,
        io: &AsyncIo,
        data: Vec<u8>,
        on_done: impl FnOnce(usize) + Send + 'static,
        on_error: impl FnOnce(Error) + Send + 'static,
    ) {
        io.send(self.native_handle(), data, on_done, on_error);
    }

    pub fn async_send_all(
        &self,
        io: &AsyncIo,
        data: Vec<u8>,
        on_done: impl FnOnce(usize) + Send + 'static,
        on_error: impl FnOnce(Error) + Send + 'static,
    ) {
        io.send_all(self.native_handle(), data, on_done, on_error);
    }

    /// Half-close, drain until the remote FIN arrives through the reactor,
    /// then close. The socket lives inside the completion until then; if
    /// the drain errors the socket is closed without `on_done` running.
    pub fn async_disconnect(self, io: &AsyncIo, on_done: impl FnOnce() + Send + 'static) {
        let _ = self.stream.shutdown(Shutdown::Write);
        async_drain(self, io.clone(), Box::new(on_done), 16);
    }
}

// closing with unread input in the kernel raises a reset that can destroy
// data already sent, so read until the fin (bounded by `rounds`)
fn async_drain(sock: TcpSocket, io: AsyncIo, on_done: Box<dyn FnOnce() + Send>, rounds: u32) {
    let fd = sock.native_handle();
    io.clone().recv(
        fd,
        4096,
        move |data| {
            if data.is_empty() || rounds == 0 {
                drop(sock);
                on_done();
            } else {
                async_drain(sock, io, on_done, rounds - 1);
            }
        },
        move |_err| {
            // the socket closed with the dropped completion
        },
    );
}

/// A listening TCP socket.
#[derive(Debug)]
pub struct TcpListenSocket {
    listener: TcpListener,
}

impl TcpListenSocket {
    pub fn bind(bind: &str, port: u16) -> Result<TcpListenSocket, Error> {
        crate::net::init();
        let addr = format!("{}:{}", bind, port);
        let listener = TcpListener::bind(&addr).map_err(|e| Error::Connection {
            host: bind.to_owned(),
            port,
            cause: e,
        })?;
        Ok(TcpListenSocket { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    pub fn native_handle(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), Error> {
        Ok(self.listener.set_nonblocking(nonblocking)?)
    }

    /// Accept one connection, blocking.
    pub fn accept(&self) -> Result<TcpSocket, Error> {
        let (stream, peer) = self.listener.accept()?;
        Ok(TcpSocket::from_accepted(stream, peer))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    fn pair() -> (TcpSocket, TcpSocket) {
        let listener = TcpListenSocket::bind("127.0.0.1", 0).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || TcpSocket::connect("127.0.0.1", addr.port()).unwrap());
        let server = listener.accept().unwrap();
        (client.join().unwrap(), server)
    }

    #[test]
    fn send_recv() {
        let (mut a, mut b) = pair();
        a.send_all(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn peer_address() {
        let (a, b) = pair();
        assert!(a.peer_address_string().starts_with("127.0.0.1:"));
        assert!(b.peer_address_string().starts_with("127.0.0.1:"));
    }

    #[test]
    fn check_recv_disconnect_states() {
        let (mut a, mut b) = pair();
        // nothing happened yet
        assert!(!a.check_recv_disconnect().unwrap());
        // peer closed cleanly
        b.send_all(b"").unwrap();
        drop(b);
        // allow the fin to arrive
        thread::sleep(Duration::from_millis(50));
        assert!(a.check_recv_disconnect().unwrap());

        let (mut c, mut d) = pair();
        d.send_all(b"stray").unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(c.check_recv_disconnect().is_err());
    }

    #[test]
    fn connect_failure_reports_host() {
        // port 1 on localhost is almost certainly closed
        match TcpSocket::connect("127.0.0.1", 1) {
            Err(Error::Connection { host, port, .. }) => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, 1);
            }
            Ok(_) => panic!("unexpected connect success"),
            Err(e) => panic!("unexpected error kind: {}", e),
        }
    }
}
