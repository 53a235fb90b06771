//! TLS over a TCP socket, client and server side.
//!
//! One [`TlsSocket`] type implements both roles; the role is fixed at
//! construction. The rustls session drives on memory buffers while this
//! module performs the real I/O — blocking against the owned [`TcpSocket`],
//! or through the reactor for the async paths, where suspension happens
//! exactly when the session wants more bytes or has bytes to write.
//!
//! [`TlsSocket`]: struct.TlsSocket.html
//! [`TcpSocket`]: struct.TcpSocket.html

use crate::error::Error;
use crate::net::async_io::AsyncIo;
use crate::net::tcp::TcpSocket;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};
use std::convert::TryFrom;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

/// Max plaintext bytes per TLS record.
const MAX_PLAINTEXT: usize = 16384;
/// Read size for encrypted input: one max record plus framing overhead.
const RECORD_BUF: usize = MAX_PLAINTEXT + 2048;

/// A loaded server identity: certificate chain and private key, optionally
/// with a CA chain appended to the certificate file.
#[derive(Clone, Debug)]
pub struct PrivateCert {
    config: Arc<ServerConfig>,
}

impl PrivateCert {
    /// Load from PEM contents: a certificate chain (leaf first) and a
    /// PKCS#8/RSA/SEC1 private key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<PrivateCert, Error> {
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<_, _>>()
            .map_err(|_| Error::User("Failed to extract certificates from PEM".into()))?;
        if certs.is_empty() {
            return Err(Error::User("No certificates in PEM contents".into()));
        }
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|_| Error::User("Failed to extract private key from PEM".into()))?
            .ok_or_else(|| Error::User("No private key in PEM contents".into()))?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(PrivateCert {
            config: Arc::new(config),
        })
    }

    /// Load from PEM files.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<PrivateCert, Error> {
        let mut cert_pem = Vec::new();
        BufReader::new(File::open(cert_path)?).read_to_end(&mut cert_pem)?;
        let mut key_pem = Vec::new();
        BufReader::new(File::open(key_path)?).read_to_end(&mut key_pem)?;
        PrivateCert::from_pem(&cert_pem, &key_pem)
    }

    pub(crate) fn server_config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

/// Process-wide client configuration: system trust store, falling back to
/// the bundled webpki roots when the system store yields nothing.
pub(crate) fn client_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let mut roots = RootCertStore::empty();
            match rustls_native_certs::load_native_certs() {
                Ok(certs) => {
                    let mut failed = 0;
                    for cert in certs {
                        if roots.add(cert).is_err() {
                            failed += 1;
                        }
                    }
                    if failed > 0 {
                        debug!("ignored {} unparseable native root certs", failed);
                    }
                }
                Err(e) => warn!("failed to load native root certs: {}", e),
            }
            if roots.is_empty() {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            Arc::new(config)
        })
        .clone()
}

struct TlsInner {
    tcp: TcpSocket,
    conn: Connection,
}

/// A TLS session over an exclusively owned TCP socket.
///
/// The inner state sits behind a mutex so that in-flight reactor
/// continuations can reach the session; at any point in time only the
/// blocking caller or the reactor thread is driving a given socket.
pub struct TlsSocket {
    inner: Arc<Mutex<TlsInner>>,
    peer: String,
}

impl TlsSocket {
    /// Connect and run the client handshake, verifying the peer certificate
    /// against the trust store.
    pub fn connect(host: &str, port: u16) -> Result<TlsSocket, Error> {
        let mut tcp = TcpSocket::connect(host, port)?;

        let server_name = ServerName::try_from(host.to_owned()).map_err(|_| {
            Error::Url(format!("Invalid TLS server name: {}", host))
        })?;
        let client = ClientConnection::new(client_config(), server_name)?;
        let mut conn = Connection::from(client);

        complete_handshake(&mut conn, &mut tcp).map_err(|e| handshake_error(e, host, port))?;
        trace!("tls client handshake done: {}:{}", host, port);

        let peer = tcp.peer_address_string().to_owned();
        Ok(TlsSocket {
            inner: Arc::new(Mutex::new(TlsInner { tcp, conn })),
            peer,
        })
    }

    /// Take ownership of an accepted socket and prepare the server side of
    /// the handshake. The handshake itself runs on the first I/O for the
    /// async path, or via [`accept`].
    ///
    /// [`accept`]: #method.accept
    pub fn new_server(tcp: TcpSocket, cert: &PrivateCert) -> Result<TlsSocket, Error> {
        let server = ServerConnection::new(cert.server_config())?;
        let peer = tcp.peer_address_string().to_owned();
        Ok(TlsSocket {
            inner: Arc::new(Mutex::new(TlsInner {
                tcp,
                conn: Connection::from(server),
            })),
            peer,
        })
    }

    /// Server handshake, blocking.
    pub fn accept(tcp: TcpSocket, cert: &PrivateCert) -> Result<TlsSocket, Error> {
        let socket = TlsSocket::new_server(tcp, cert)?;
        {
            let mut inner = socket.inner.lock().unwrap();
            let inner = &mut *inner;
            complete_handshake(&mut inner.conn, &mut inner.tcp)?;
        }
        trace!("tls server handshake done: {}", socket.peer);
        Ok(socket)
    }

    pub fn native_handle(&self) -> RawFd {
        self.inner.lock().unwrap().tcp.native_handle()
    }

    // a second handle onto the same session, for in-flight reactor work
    pub(crate) fn handle_clone(&self) -> TlsSocket {
        TlsSocket {
            inner: self.inner.clone(),
            peer: self.peer.clone(),
        }
    }

    pub fn peer_address_string(&self) -> &str {
        &self.peer
    }

    /// Receive decrypted bytes. 0 means the peer closed the session (or the
    /// connection) in an orderly way.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        loop {
            let state = inner.conn.process_new_packets()?;
            if state.plaintext_bytes_to_read() > 0 {
                let n = inner.conn.reader().read(buf)?;
                return Ok(n);
            }
            if state.peer_has_closed() {
                return Ok(0);
            }
            // session renegotiation emits bytes without consuming any
            while inner.conn.wants_write() {
                inner.conn.write_tls(inner.tcp.stream_mut())?;
            }
            let n = inner.conn.read_tls(inner.tcp.stream_mut())?;
            if n == 0 {
                return Ok(0);
            }
        }
    }

    /// Encrypt and send up to one record worth of `buf`. Returns the
    /// plaintext bytes accepted.
    pub fn send(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let chunk = &buf[..buf.len().min(MAX_PLAINTEXT)];
        let mut accepted = 0;
        while accepted < chunk.len() {
            accepted += inner.conn.writer().write(&chunk[accepted..]).map_err(Error::Socket)?;
        }
        while inner.conn.wants_write() {
            inner.conn.write_tls(inner.tcp.stream_mut())?;
        }
        Ok(accepted)
    }

    pub fn send_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut sent = 0;
        while sent < buf.len() {
            sent += self.send(&buf[sent..])?;
        }
        Ok(())
    }

    /// True if decrypted or still-encrypted input is buffered locally. This
    /// disambiguates "no kernel-level readiness" from "application still
    /// has data" for the reactor integration.
    pub fn recv_pending(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.conn.process_new_packets() {
            Ok(state) => state.plaintext_bytes_to_read() > 0,
            Err(_) => false,
        }
    }

    /// Non-blocking check whether the remote closed the session or the
    /// connection cleanly. Application data arriving here is a protocol
    /// violation and errors.
    pub fn check_recv_disconnect(&mut self) -> Result<bool, Error> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        // drain what the kernel has without blocking, then judge the
        // session state; a close-notify record is a clean close here
        inner.tcp.set_nonblocking(true)?;
        let read = inner.conn.read_tls(inner.tcp.stream_mut());
        inner.tcp.set_nonblocking(false)?;
        match read {
            Ok(0) => return Ok(true),
            Ok(_) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(Error::Socket(e)),
        }
        let state = inner.conn.process_new_packets()?;
        if state.plaintext_bytes_to_read() > 0 {
            return Err(Error::Network(
                "Unexpected data while checking for disconnect".into(),
            ));
        }
        Ok(state.peer_has_closed())
    }

    /// Send the TLS close-notify and close the TCP socket.
    pub fn disconnect(self) {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => {
                let mut inner = mutex.into_inner().unwrap();
                inner.conn.send_close_notify();
                while inner.conn.wants_write() {
                    if inner.conn.write_tls(inner.tcp.stream_mut()).is_err() {
                        break;
                    }
                }
                inner.tcp.disconnect();
            }
            Err(arc) => {
                // a reactor continuation still holds the session; just get
                // the close-notify out
                let mut guard = arc.lock().unwrap();
                let inner = &mut *guard;
                inner.conn.send_close_notify();
                while inner.conn.wants_write() {
                    if inner.conn.write_tls(inner.tcp.stream_mut()).is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Drive the server handshake through the reactor. `on_done` runs on
    /// the reactor thread once the session is established.
    pub fn async_handshake(
        &self,
        io: &AsyncIo,
        on_done: impl FnOnce() + Send + 'static,
        on_error: impl FnOnce(Error) + Send + 'static,
    ) {
        handshake_step(
            self.inner.clone(),
            io.clone(),
            Box::new(on_done),
            SharedErr::new(on_error),
        );
    }

    /// Receive decrypted bytes through the reactor. If buffered plaintext
    /// can satisfy the call, the completion runs synchronously. An empty
    /// buffer means the peer closed.
    pub fn async_recv(
        &self,
        io: &AsyncIo,
        max: usize,
        on_done: impl FnOnce(Vec<u8>) + Send + 'static,
        on_error: impl FnOnce(Error) + Send + 'static,
    ) {
        recv_step(
            self.inner.clone(),
            io.clone(),
            max,
            Box::new(on_done),
            SharedErr::new(on_error),
        );
    }

    /// Encrypt all of `data` into one outbound buffer and send it through
    /// the reactor. The completion reports the plaintext byte count.
    pub fn async_send_all(
        &self,
        io: &AsyncIo,
        data: Vec<u8>,
        on_done: impl FnOnce(usize) + Send + 'static,
        on_error: impl FnOnce(Error) + Send + 'static,
    ) {
        let fd;
        let out = {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            fd = inner.tcp.native_handle();
            match encrypt_all(inner, &data) {
                Ok(out) => out,
                Err(e) => {
                    drop(guard);
                    on_error(e);
                    return;
                }
            }
        };
        let plain_len = data.len();
        io.send_all(fd, out, move |_| on_done(plain_len), on_error);
    }

    /// Send the close-notify through the reactor, then close the socket.
    pub fn async_disconnect(self, io: &AsyncIo, on_done: impl FnOnce() + Send + 'static) {
        let (fd, out) = {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            inner.conn.send_close_notify();
            let mut out = Vec::new();
            while inner.conn.wants_write() {
                if inner.conn.write_tls(&mut out).is_err() {
                    break;
                }
            }
            (inner.tcp.native_handle(), out)
        };
        io.send_all(
            fd,
            out,
            move |_| {
                drop(self);
                on_done();
            },
            move |_err| {
                // close without the notify making it out
            },
        );
    }
}

fn handshake_error(e: Error, host: &str, port: u16) -> Error {
    match e {
        Error::Tls(rustls::Error::InvalidCertificate(_)) => Error::CertificateVerification {
            host: host.to_owned(),
            port,
        },
        Error::Socket(cause) => Error::Connection {
            host: host.to_owned(),
            port,
            cause,
        },
        other => other,
    }
}

/// Drive a handshake on a blocking socket until established.
fn complete_handshake(conn: &mut Connection, tcp: &mut TcpSocket) -> Result<(), Error> {
    while conn.is_handshaking() {
        while conn.wants_write() {
            conn.write_tls(tcp.stream_mut())?;
        }
        if !conn.is_handshaking() {
            break;
        }
        let n = conn.read_tls(tcp.stream_mut())?;
        if n == 0 {
            return Err(Error::Network("Disconnect during TLS handshake".into()));
        }
        conn.process_new_packets()?;
    }
    while conn.wants_write() {
        conn.write_tls(tcp.stream_mut())?;
    }
    Ok(())
}

/// An error continuation that can be armed from several closures but fires
/// at most once.
#[derive(Clone)]
struct SharedErr(Arc<Mutex<Option<Box<dyn FnOnce(Error) + Send>>>>);

impl SharedErr {
    fn new(f: impl FnOnce(Error) + Send + 'static) -> Self {
        SharedErr(Arc::new(Mutex::new(Some(Box::new(f)))))
    }

    fn fire(&self, e: Error) {
        if let Some(f) = self.0.lock().unwrap().take() {
            f(e);
        }
    }
}

fn feed_tls(inner: &mut TlsInner, data: &[u8]) -> Result<(), Error> {
    let mut slice = data;
    while !slice.is_empty() {
        let n = inner.conn.read_tls(&mut slice)?;
        inner.conn.process_new_packets()?;
        if n == 0 {
            break;
        }
    }
    Ok(())
}

fn encrypt_all(inner: &mut TlsInner, data: &[u8]) -> Result<Vec<u8>, Error> {
    for chunk in data.chunks(MAX_PLAINTEXT) {
        let mut accepted = 0;
        while accepted < chunk.len() {
            accepted += inner
                .conn
                .writer()
                .write(&chunk[accepted..])
                .map_err(Error::Socket)?;
        }
    }
    let mut out = Vec::new();
    while inner.conn.wants_write() {
        inner.conn.write_tls(&mut out)?;
    }
    Ok(out)
}

fn handshake_step(
    inner: Arc<Mutex<TlsInner>>,
    io: AsyncIo,
    on_done: Box<dyn FnOnce() + Send>,
    on_error: SharedErr,
) {
    enum Next {
        Done,
        Write(Vec<u8>),
        Read,
    }

    let fd;
    let next = {
        let mut guard = inner.lock().unwrap();
        let inner = &mut *guard;
        fd = inner.tcp.native_handle();
        if inner.conn.wants_write() {
            let mut out = Vec::new();
            let mut failed = None;
            while inner.conn.wants_write() {
                if let Err(e) = inner.conn.write_tls(&mut out) {
                    failed = Some(e);
                    break;
                }
            }
            match failed {
                Some(e) => {
                    drop(guard);
                    on_error.fire(Error::Socket(e));
                    return;
                }
                None => Next::Write(out),
            }
        } else if inner.conn.is_handshaking() {
            Next::Read
        } else {
            Next::Done
        }
    };

    match next {
        Next::Done => on_done(),
        Next::Write(out) => {
            let err = on_error.clone();
            io.send_all(
                fd,
                out,
                {
                    let io = io.clone();
                    move |_| handshake_step(inner, io, on_done, on_error)
                },
                move |e| err.fire(e),
            );
        }
        Next::Read => {
            let err = on_error.clone();
            io.recv(
                fd,
                RECORD_BUF,
                {
                    let io = io.clone();
                    move |data| {
                        if data.is_empty() {
                            on_error.fire(Error::Network(
                                "Disconnect during TLS handshake".into(),
                            ));
                            return;
                        }
                        {
                            let mut guard = inner.lock().unwrap();
                            if let Err(e) = feed_tls(&mut guard, &data) {
                                drop(guard);
                                on_error.fire(e);
                                return;
                            }
                        }
                        handshake_step(inner, io, on_done, on_error)
                    }
                },
                move |e| err.fire(e),
            );
        }
    }
}

fn recv_step(
    inner: Arc<Mutex<TlsInner>>,
    io: AsyncIo,
    max: usize,
    on_done: Box<dyn FnOnce(Vec<u8>) + Send>,
    on_error: SharedErr,
) {
    enum Next {
        Deliver(Vec<u8>),
        Closed,
        Flush(Vec<u8>),
        Read,
    }

    let fd;
    let next = {
        let mut guard = inner.lock().unwrap();
        let inner_ref = &mut *guard;
        fd = inner_ref.tcp.native_handle();
        match inner_ref.conn.process_new_packets() {
            Err(e) => {
                drop(guard);
                on_error.fire(e.into());
                return;
            }
            Ok(state) => {
                if state.plaintext_bytes_to_read() > 0 {
                    let mut buf = vec![0u8; max.min(state.plaintext_bytes_to_read())];
                    match inner_ref.conn.reader().read(&mut buf) {
                        Ok(n) => {
                            buf.truncate(n);
                            Next::Deliver(buf)
                        }
                        Err(e) => {
                            drop(guard);
                            on_error.fire(Error::Socket(e));
                            return;
                        }
                    }
                } else if state.peer_has_closed() {
                    Next::Closed
                } else if inner_ref.conn.wants_write() {
                    // renegotiation wants to emit bytes before more input
                    let mut out = Vec::new();
                    let mut failed = None;
                    while inner_ref.conn.wants_write() {
                        if let Err(e) = inner_ref.conn.write_tls(&mut out) {
                            failed = Some(e);
                            break;
                        }
                    }
                    match failed {
                        Some(e) => {
                            drop(guard);
                            on_error.fire(Error::Socket(e));
                            return;
                        }
                        None => Next::Flush(out),
                    }
                } else {
                    Next::Read
                }
            }
        }
    };

    match next {
        Next::Deliver(buf) => on_done(buf),
        Next::Closed => on_done(Vec::new()),
        Next::Flush(out) => {
            let err = on_error.clone();
            io.send_all(
                fd,
                out,
                {
                    let io = io.clone();
                    move |_| recv_step(inner, io, max, on_done, on_error)
                },
                move |e| err.fire(e),
            );
        }
        Next::Read => {
            let err = on_error.clone();
            io.recv(
                fd,
                RECORD_BUF,
                {
                    let io = io.clone();
                    move |data| {
                        if data.is_empty() {
                            // tcp-level close without close-notify; treat as
                            // an orderly end of stream
                            on_done(Vec::new());
                            return;
                        }
                        {
                            let mut guard = inner.lock().unwrap();
                            if let Err(e) = feed_tls(&mut guard, &data) {
                                drop(guard);
                                on_error.fire(e);
                                return;
                            }
                        }
                        recv_step(inner, io, max, on_done, on_error)
                    }
                },
                move |e| err.fire(e),
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pem_without_key_fails() {
        let err = PrivateCert::from_pem(b"not a pem", b"also not a pem").unwrap_err();
        match err {
            Error::User(_) => {}
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn missing_file_fails() {
        assert!(PrivateCert::from_pem_files("/nonexistent/cert.pem", "/nonexistent/key.pem").is_err());
    }

    #[test]
    fn client_config_builds() {
        let config = client_config();
        // cached instance is reused
        assert!(Arc::ptr_eq(&config, &client_config()));
    }
}
