use crate::error::Error;
use crate::method::Method;
use crate::net::Socket;
use crate::parser::{ResponseParser, LINE_SIZE};
use crate::request::Request;
use crate::response::Response;
use crate::writer;

/// One request→response cycle on a socket.
///
/// The socket can be replaced to reconnect; the parser is reset with each
/// request's method so the response body rules apply.
pub struct ClientConnection {
    socket: Option<Socket>,
    parser: ResponseParser,
}

impl ClientConnection {
    pub fn new() -> ClientConnection {
        ClientConnection {
            socket: None,
            parser: ResponseParser::new(Method::Get),
        }
    }

    pub fn with_socket(socket: Socket) -> ClientConnection {
        let mut conn = ClientConnection::new();
        conn.reset(socket);
        conn
    }

    /// Replace the underlying socket.
    pub fn reset(&mut self, socket: Socket) {
        self.socket = Some(socket);
    }

    /// Drop the underlying socket, e.g. after an I/O failure.
    pub fn discard(&mut self) {
        self.socket = None;
    }

    /// True if a socket is held and the remote has not closed it.
    pub fn is_connected(&mut self) -> bool {
        match &mut self.socket {
            None => false,
            Some(socket) => !socket.check_recv_disconnect().unwrap_or(true),
        }
    }

    /// Write the request and prime the parser for its response.
    pub fn send_request(&mut self, req: &mut Request) -> Result<(), Error> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| Error::User("ClientConnection has no socket".into()))?;
        writer::send_request(socket, req)?;
        self.parser.reset(req.method);
        Ok(())
    }

    /// Read until the response completes. Bytes past the end of the
    /// response are a protocol violation (requests are not pipelined here).
    pub fn recv_response(&mut self) -> Result<Response, Error> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| Error::User("ClientConnection has no socket".into()))?;

        let mut buf = vec![0u8; LINE_SIZE];
        let mut len = 0;
        while !self.parser.is_completed() {
            let n = socket.recv(&mut buf[len..])?;
            if n == 0 {
                return Err(Error::Network(
                    "Server disconnected before response was complete".into(),
                ));
            }
            len += n;

            let used = self.parser.read(&buf[..len])?;
            if used == 0 && len == buf.len() {
                return Err(Error::Network("Response line too large".into()));
            }
            buf.copy_within(used..len, 0);
            len -= used;
        }
        if len != 0 {
            return Err(Error::Network("Unexpected content after response".into()));
        }

        Ok(Response {
            status: self.parser.take_status(),
            headers: self.parser.take_headers(),
            body: self.parser.take_body(),
        })
    }

    /// Prime the parser for the response to a request with `method` that
    /// was written to the socket by other means, then receive it.
    pub fn recv_response_for(&mut self, method: Method) -> Result<Response, Error> {
        self.parser.reset(method);
        self.recv_response()
    }

    /// Send one request and receive its response.
    pub fn make_request(&mut self, req: &mut Request) -> Result<Response, Error> {
        self.send_request(req)?;
        self.recv_response()
    }
}

impl Default for ClientConnection {
    fn default() -> Self {
        ClientConnection::new()
    }
}
