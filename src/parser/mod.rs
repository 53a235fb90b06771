//! Incremental HTTP/1.1 message parsing.
//!
//! [`RequestParser`] and [`ResponseParser`] share one state machine. Input
//! arrives in arbitrary splits via `read`, which consumes a prefix of the
//! bytes and reports how much was used; the caller keeps unconsumed bytes
//! and appends more. Bytes past the end of a completed message are left for
//! the next, pipelined message.
//!
//! Feeding the same byte sequence in any split yields the same result.
//!
//! [`RequestParser`]: struct.RequestParser.html
//! [`ResponseParser`]: struct.ResponseParser.html

mod lex;

pub use lex::Version;

use crate::error::ParserError;
use crate::headers::Headers;
use crate::method::Method;
use crate::status::Status;
use std::mem;
use std::str::FromStr;

/// Max size of any line. A buffer of this size can hold any parseable
/// component of a message.
pub const LINE_SIZE: usize = 8192;
/// Max number of headers in one message (trailers included).
pub const MAX_HEADER_COUNT: usize = 100;
/// Max combined size of all header lines.
pub const MAX_HEADERS_SIZE: usize = 65536;
/// Max size of a chunk length line, CRLF included.
pub const MAX_CHUNK_LINE_SIZE: usize = 10;

/// Parser states. `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Start,
    Headers,
    Body,
    BodyChunk,
    BodyChunkLen,
    BodyChunkTerminator,
    /// Read body data until the connection closes. Entered only to record
    /// where an unframed response got to; this engine does not support
    /// framing-by-close and errors on the transition.
    BodyUntilClose,
    TrailerHeaders,
    Completed,
}

enum Role {
    Request {
        method: Method,
        uri: String,
    },
    Response {
        /// Method of the request this response answers, for the
        /// method-dependent body rules.
        method: Method,
        status: Status,
    },
}

struct Core {
    state: State,
    role: Role,
    version: Version,
    headers: Headers,
    body: Vec<u8>,
    content_length: usize,
    remaining: usize,
    headers_size: usize,
}

impl Core {
    fn new(role: Role) -> Self {
        Core {
            state: State::Start,
            role,
            version: Version::default(),
            headers: Headers::new(),
            body: Vec::new(),
            content_length: 0,
            remaining: 0,
            headers_size: 0,
        }
    }

    fn reset(&mut self, role: Role) {
        self.state = State::Start;
        self.role = role;
        self.version = Version::default();
        self.headers.clear();
        self.body.clear();
        self.content_length = 0;
        self.remaining = 0;
        self.headers_size = 0;
    }

    /// Locate the next CRLF-terminated line at `pos`. `Ok(None)` means more
    /// input is needed. Lines longer than `LINE_SIZE` fail without waiting
    /// for the CRLF to arrive.
    fn take_line<'a>(
        &self,
        buf: &'a [u8],
        pos: usize,
    ) -> Result<Option<(&'a [u8], usize)>, ParserError> {
        let window = &buf[pos..];
        match lex::find_crlf(window) {
            Some(nl) if nl <= LINE_SIZE => Ok(Some((&window[..nl], pos + nl + 2))),
            Some(_) => Err(self.line_overflow()),
            None if window.len() > LINE_SIZE => Err(self.line_overflow()),
            None => Ok(None),
        }
    }

    fn line_overflow(&self) -> ParserError {
        if self.state == State::Start {
            match self.role {
                Role::Request { .. } => {
                    ParserError::with_status("Request line too long", 414)
                }
                Role::Response { .. } => ParserError::new("Status line too long"),
            }
        } else {
            ParserError::with_status("Header line too long", 431)
        }
    }

    fn read_first_line(&mut self, line: &[u8]) -> Result<(), ParserError> {
        match &mut self.role {
            Role::Request { method, uri } => {
                let (method_str, uri_bytes, version) = lex::read_request_line(line)?;
                let method_str = std::str::from_utf8(method_str)
                    .map_err(|_| ParserError::new("Expected SP after request method"))?;
                *method = Method::from_str(method_str)?;
                *uri = String::from_utf8_lossy(uri_bytes).into_owned();
                self.version = version;
            }
            Role::Response { status, .. } => {
                let (version, code, phrase) = lex::read_status_line(line)?;
                *status = Status::new(code, String::from_utf8_lossy(phrase).into_owned());
                self.version = version;
            }
        }
        if self.version.major != 1 {
            return Err(ParserError::with_status("Unsupported HTTP version", 505));
        }
        self.state = State::Headers;
        Ok(())
    }

    fn add_header(&mut self, line: &[u8]) -> Result<(), ParserError> {
        if self.headers.len() + 1 > MAX_HEADER_COUNT {
            return Err(ParserError::with_status("Too many headers", 431));
        }
        self.headers_size += line.len() + 2;
        if self.headers_size > MAX_HEADERS_SIZE {
            return Err(ParserError::with_status("Headers too large", 431));
        }
        let (name, value) = lex::read_header_line(line)?;
        // header names are tokens, so always valid utf-8
        let name = String::from_utf8_lossy(name).into_owned();
        let value = String::from_utf8_lossy(value).into_owned();
        self.headers.add(name, value);
        Ok(())
    }

    /// Select body framing once the header block is complete. RFC 7230 3.3.
    fn start_body(&mut self) -> Result<(), ParserError> {
        if let Role::Response { method, status } = &self.role {
            let code = status.code;
            let no_body = code / 100 == 1
                || code == 204
                || code == 304
                || *method == Method::Head
                || (*method == Method::Connect && code / 100 == 2);
            if no_body {
                self.state = State::Completed;
                return Ok(());
            }
        }

        let te = self.headers.get("Transfer-Encoding");
        if !te.is_empty() {
            if te == "chunked" {
                self.state = State::BodyChunkLen;
                return Ok(());
            }
            return Err(ParserError::with_status(
                "Only 'chunked' transfer encoding is supported",
                501,
            ));
        }

        let len_str = self.headers.get("Content-Length");
        if !len_str.is_empty() {
            let len = parse_decimal_strict(len_str)
                .ok_or_else(|| ParserError::new("Invalid Content-Length header value"))?;
            self.content_length = len;
            self.remaining = len;
            self.state = if len == 0 { State::Completed } else { State::Body };
            return Ok(());
        }

        match self.role {
            Role::Request { .. } => {
                self.state = State::Completed;
                Ok(())
            }
            Role::Response { .. } => {
                self.state = State::BodyUntilClose;
                Err(ParserError::with_status(
                    "Responses with a body but no Transfer-Encoding or Content-Length are not supported",
                    411,
                ))
            }
        }
    }

    fn read(&mut self, buf: &[u8]) -> Result<usize, ParserError> {
        let mut pos = 0;

        if self.state == State::Start {
            match self.take_line(buf, pos)? {
                None => return Ok(pos),
                Some((line, next)) => {
                    self.read_first_line(line)?;
                    pos = next;
                }
            }
        }

        while self.state == State::Headers {
            match self.take_line(buf, pos)? {
                None => return Ok(pos),
                Some((line, next)) => {
                    pos = next;
                    if line.is_empty() {
                        self.start_body()?;
                    } else {
                        self.add_header(line)?;
                    }
                }
            }
        }

        if self.state == State::Body {
            let consume = (buf.len() - pos).min(self.remaining);
            self.body.extend_from_slice(&buf[pos..pos + consume]);
            self.remaining -= consume;
            pos += consume;
            if self.remaining == 0 {
                self.state = State::Completed;
            }
            return Ok(pos);
        }

        loop {
            match self.state {
                State::BodyChunk => {
                    let consume = (buf.len() - pos).min(self.remaining);
                    self.body.extend_from_slice(&buf[pos..pos + consume]);
                    self.remaining -= consume;
                    pos += consume;
                    if self.remaining != 0 {
                        return Ok(pos);
                    }
                    self.state = State::BodyChunkTerminator;
                }
                State::BodyChunkLen => {
                    let limit = buf.len().min(pos + MAX_CHUNK_LINE_SIZE);
                    match lex::find_crlf(&buf[pos..limit]) {
                        None => {
                            if limit == pos + MAX_CHUNK_LINE_SIZE {
                                return Err(ParserError::new(
                                    "Did not find chunk length CRLF within allowed length",
                                ));
                            }
                            return Ok(pos);
                        }
                        Some(nl) => {
                            let len = parse_hex_strict(&buf[pos..pos + nl])
                                .ok_or_else(|| ParserError::new("Invalid chunk size"))?;
                            pos += nl + 2;
                            self.remaining = len;
                            self.content_length += len;
                            self.state = if len == 0 {
                                State::TrailerHeaders
                            } else {
                                State::BodyChunk
                            };
                        }
                    }
                }
                State::BodyChunkTerminator => {
                    if buf.len() - pos < 2 {
                        return Ok(pos);
                    }
                    if buf[pos] != b'\r' || buf[pos + 1] != b'\n' {
                        return Err(ParserError::new("Expected CRLF after chunk data"));
                    }
                    pos += 2;
                    self.state = State::BodyChunkLen;
                }
                _ => break,
            }
        }

        while self.state == State::TrailerHeaders {
            match self.take_line(buf, pos)? {
                None => return Ok(pos),
                Some((line, next)) => {
                    pos = next;
                    if line.is_empty() {
                        self.state = State::Completed;
                        return Ok(pos);
                    }
                    self.add_header(line)?;
                }
            }
        }

        Ok(pos)
    }
}

// strict: digits only, no sign, no surrounding whitespace
fn parse_decimal_strict(s: &str) -> Option<usize> {
    if s.is_empty() || !s.bytes().all(|c| c.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

// strict: hex digits only; max 8 digits fit any practical chunk
fn parse_hex_strict(s: &[u8]) -> Option<usize> {
    if s.is_empty() || !s.iter().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let s = std::str::from_utf8(s).ok()?;
    usize::from_str_radix(s, 16).ok()
}

macro_rules! common_accessors {
    () => {
        /// Consume input, returning how many bytes were used. Unconsumed
        /// bytes must be fed again, with more appended, on the next call.
        pub fn read(&mut self, buf: &[u8]) -> Result<usize, ParserError> {
            if self.core.state == State::Completed {
                return Ok(0);
            }
            self.core.read(buf)
        }

        pub fn state(&self) -> State {
            self.core.state
        }

        pub fn is_completed(&self) -> bool {
            self.core.state == State::Completed
        }

        pub fn version(&self) -> Version {
            self.core.version
        }

        pub fn headers(&self) -> &Headers {
            &self.core.headers
        }

        /// Move the headers out. Valid once past the header block.
        pub fn take_headers(&mut self) -> Headers {
            mem::take(&mut self.core.headers)
        }

        pub fn body(&self) -> &[u8] {
            &self.core.body
        }

        /// Move the body out. Valid once completed.
        pub fn take_body(&mut self) -> Vec<u8> {
            mem::take(&mut self.core.body)
        }

        /// True once the body length is known, in `Body` or `Completed`.
        pub fn has_content_length(&self) -> bool {
            self.core.state == State::Body || self.core.state == State::Completed
        }

        /// Body length: the `Content-Length` value, or the accumulated
        /// chunk sizes for a chunked message.
        pub fn content_length(&self) -> usize {
            self.core.content_length
        }
    };
}

/// Parser for requests, used server side.
pub struct RequestParser {
    core: Core,
}

impl RequestParser {
    pub fn new() -> Self {
        RequestParser {
            core: Core::new(Role::Request {
                method: Method::Get,
                uri: String::new(),
            }),
        }
    }

    /// Make ready for the next message.
    pub fn reset(&mut self) {
        self.core.reset(Role::Request {
            method: Method::Get,
            uri: String::new(),
        });
    }

    /// The request method. Valid once past the first line.
    pub fn method(&self) -> Method {
        match &self.core.role {
            Role::Request { method, .. } => *method,
            Role::Response { .. } => unreachable!(),
        }
    }

    /// The raw request-target. Valid once past the first line.
    pub fn uri(&self) -> &str {
        match &self.core.role {
            Role::Request { uri, .. } => uri,
            Role::Response { .. } => unreachable!(),
        }
    }

    common_accessors!();
}

impl Default for RequestParser {
    fn default() -> Self {
        RequestParser::new()
    }
}

/// Parser for responses, used client side.
///
/// Reset with the method of the originating request so the method-dependent
/// body rules apply (HEAD and CONNECT responses have no body).
pub struct ResponseParser {
    core: Core,
}

impl ResponseParser {
    pub fn new(method: Method) -> Self {
        ResponseParser {
            core: Core::new(Role::Response {
                method,
                status: Status::new(0, ""),
            }),
        }
    }

    /// Make ready for the response to a request with the given method.
    pub fn reset(&mut self, method: Method) {
        self.core.reset(Role::Response {
            method,
            status: Status::new(0, ""),
        });
    }

    /// The response status. Valid once past the first line.
    pub fn status(&self) -> &Status {
        match &self.core.role {
            Role::Response { status, .. } => status,
            Role::Request { .. } => unreachable!(),
        }
    }

    /// Move the status out.
    pub fn take_status(&mut self) -> Status {
        match &mut self.core.role {
            Role::Response { status, .. } => mem::replace(status, Status::new(0, "")),
            Role::Request { .. } => unreachable!(),
        }
    }

    common_accessors!();
}

#[cfg(test)]
mod test {
    use super::*;

    fn feed(parser: &mut RequestParser, input: &str) -> String {
        let used = parser.read(input.as_bytes()).unwrap();
        input[used..].to_owned()
    }

    fn feed_resp(parser: &mut ResponseParser, input: &str) -> String {
        let used = parser.read(input.as_bytes()).unwrap();
        input[used..].to_owned()
    }

    #[test]
    fn request_get_incremental() {
        let mut parser = RequestParser::new();

        assert_eq!(feed(&mut parser, "GET /"), "GET /");
        assert_eq!(parser.state(), State::Start);

        assert_eq!(
            feed(&mut parser, "GET /index.html HTTP/1.1\r\nHost:"),
            "Host:"
        );
        assert_eq!(parser.state(), State::Headers);
        assert_eq!(parser.method(), Method::Get);
        assert_eq!(parser.uri(), "/index.html");

        assert_eq!(feed(&mut parser, "Host: localhost"), "Host: localhost");
        assert_eq!(parser.headers().len(), 0);

        assert_eq!(feed(&mut parser, "Host: localhost\r\nAccept: \t*/*  \r\n"), "");
        assert_eq!(parser.state(), State::Headers);
        assert_eq!(parser.headers().get("Host"), "localhost");
        assert_eq!(parser.headers().get("Accept"), "*/*");

        assert_eq!(feed(&mut parser, "\r\nPOST /next"), "POST /next");
        assert!(parser.is_completed());
        assert!(parser.has_content_length());
        assert_eq!(parser.content_length(), 0);
        assert_eq!(parser.body(), b"");
    }

    #[test]
    fn request_content_length_zero() {
        let mut parser = RequestParser::new();
        assert_eq!(
            feed(&mut parser, "GET / HTTP/1.1\r\nContent-Length: 0\r\n\r\n"),
            ""
        );
        assert!(parser.is_completed());
        assert_eq!(parser.content_length(), 0);
        assert_eq!(parser.body(), b"");
    }

    #[test]
    fn request_post_body() {
        let mut parser = RequestParser::new();
        assert_eq!(
            feed(&mut parser, "POST /test HTTP/1.1\r\nContent-Length: 10\r\n\r\n"),
            ""
        );
        assert_eq!(parser.state(), State::Body);
        assert!(parser.has_content_length());
        assert_eq!(parser.content_length(), 10);

        // pipelined bytes after the body stay unconsumed
        assert_eq!(feed(&mut parser, "0123456789GET /next"), "GET /next");
        assert!(parser.is_completed());
        assert_eq!(parser.body(), b"0123456789");
    }

    #[test]
    fn request_post_body_split() {
        let mut parser = RequestParser::new();
        feed(&mut parser, "POST /test HTTP/1.1\r\nContent-Length: 10\r\n\r\n");
        assert_eq!(feed(&mut parser, "012345"), "");
        assert!(!parser.is_completed());
        assert_eq!(feed(&mut parser, "6789GET /next"), "GET /next");
        assert!(parser.is_completed());
        assert_eq!(parser.body(), b"0123456789");
    }

    #[test]
    fn request_chunked_stepwise() {
        let mut parser = RequestParser::new();
        assert_eq!(
            feed(
                &mut parser,
                "POST /test HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n"
            ),
            ""
        );
        assert_eq!(parser.state(), State::BodyChunkLen);

        assert_eq!(feed(&mut parser, "5\r\n"), "");
        assert_eq!(parser.state(), State::BodyChunk);

        assert_eq!(feed(&mut parser, "0123"), "");
        assert_eq!(parser.state(), State::BodyChunk);

        assert_eq!(feed(&mut parser, "4"), "");
        assert_eq!(parser.state(), State::BodyChunkTerminator);

        assert_eq!(feed(&mut parser, "\r\n"), "");
        assert_eq!(parser.state(), State::BodyChunkLen);

        assert_eq!(feed(&mut parser, "0\r\n"), "");
        assert_eq!(parser.state(), State::TrailerHeaders);

        assert_eq!(feed(&mut parser, "\r\n"), "");
        assert!(parser.is_completed());
        assert_eq!(parser.content_length(), 5);
        assert_eq!(parser.body(), b"01234");
    }

    #[test]
    fn request_chunked_trailers() {
        let mut parser = RequestParser::new();
        feed(
            &mut parser,
            "POST /test HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert_eq!(
            feed(&mut parser, "3\r\nabc\r\n0\r\nExpires: never\r\n\r\nrest"),
            "rest"
        );
        assert!(parser.is_completed());
        assert_eq!(parser.body(), b"abc");
        assert_eq!(parser.headers().get("Expires"), "never");
    }

    #[test]
    fn request_chunk_extension_rejected() {
        let mut parser = RequestParser::new();
        feed(
            &mut parser,
            "POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        let err = parser.read(b"5;ext=1\r\n").unwrap_err();
        assert_eq!(err.message, "Invalid chunk size");
    }

    #[test]
    fn request_other_transfer_encoding_rejected() {
        let mut parser = RequestParser::new();
        let err = parser
            .read(b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n")
            .unwrap_err();
        assert_eq!(err.status, 501);
    }

    #[test]
    fn request_bad_content_length() {
        for bad in &["-1", "1x", "0x5", "1 2"] {
            let mut parser = RequestParser::new();
            let msg = format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", bad);
            assert!(parser.read(msg.as_bytes()).is_err(), "{:?}", bad);
        }
    }

    #[test]
    fn request_unknown_method() {
        let mut parser = RequestParser::new();
        let err = parser.read(b"BREW /pot HTTP/1.1\r\n\r\n").unwrap_err();
        assert_eq!(err.status, 501);
    }

    #[test]
    fn request_version_2_rejected() {
        let mut parser = RequestParser::new();
        let err = parser.read(b"GET / HTTP/2.0\r\n\r\n").unwrap_err();
        assert_eq!(err.status, 505);
    }

    #[test]
    fn request_line_overflow() {
        let mut parser = RequestParser::new();
        let input = vec![b'a'; LINE_SIZE + 2];
        let err = parser.read(&input).unwrap_err();
        assert_eq!(err.status, 414);
    }

    #[test]
    fn header_overflow() {
        let mut parser = RequestParser::new();
        feed(&mut parser, "GET / HTTP/1.1\r\n");
        let mut line = b"X-Big: ".to_vec();
        line.resize(LINE_SIZE + 2, b'x');
        let err = parser.read(&line).unwrap_err();
        assert_eq!(err.status, 431);
    }

    #[test]
    fn too_many_headers() {
        let mut parser = RequestParser::new();
        let mut msg = String::from("GET / HTTP/1.1\r\n");
        for i in 0..MAX_HEADER_COUNT + 1 {
            msg.push_str(&format!("X-H{}: v\r\n", i));
        }
        msg.push_str("\r\n");
        let err = parser.read(msg.as_bytes()).unwrap_err();
        assert_eq!(err.status, 431);
    }

    #[test]
    fn split_invariance() {
        let msg = "POST /p?a=1 HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
                   5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n";
        // single read
        let mut whole = RequestParser::new();
        let used = whole.read(msg.as_bytes()).unwrap();
        assert_eq!(used, msg.len());
        assert!(whole.is_completed());

        // byte at a time, carrying unconsumed input forward
        let mut parser = RequestParser::new();
        let mut pending = Vec::new();
        for b in msg.bytes() {
            pending.push(b);
            let used = parser.read(&pending).unwrap();
            pending.drain(..used);
        }
        assert!(parser.is_completed());
        assert!(pending.is_empty());
        assert_eq!(parser.body(), whole.body());
        assert_eq!(parser.headers().get("Host"), "x");
        assert_eq!(parser.content_length(), 11);
    }

    #[test]
    fn response_with_body() {
        let mut parser = ResponseParser::new(Method::Get);
        let rest = feed_resp(
            &mut parser,
            "HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789NEXT",
        );
        assert_eq!(rest, "NEXT");
        assert!(parser.is_completed());
        assert_eq!(parser.status().code, 200);
        assert_eq!(parser.status().msg, "OK");
        assert_eq!(parser.body(), b"0123456789");
    }

    #[test]
    fn response_chunked() {
        let mut parser = ResponseParser::new(Method::Get);
        let rest = feed_resp(
            &mut parser,
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
             5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n",
        );
        assert_eq!(rest, "");
        assert!(parser.is_completed());
        assert_eq!(parser.body(), b"Hello World");
        assert_eq!(parser.content_length(), 11);
    }

    #[test]
    fn response_head_has_no_body() {
        let mut parser = ResponseParser::new(Method::Head);
        feed_resp(&mut parser, "HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n");
        assert!(parser.is_completed());
        assert_eq!(parser.body(), b"");
    }

    #[test]
    fn response_204_and_304_have_no_body() {
        for code in &[204, 304] {
            let mut parser = ResponseParser::new(Method::Get);
            let msg = format!("HTTP/1.1 {} X\r\n\r\n", code);
            let used = parser.read(msg.as_bytes()).unwrap();
            assert_eq!(used, msg.len());
            assert!(parser.is_completed(), "{}", code);
        }
    }

    #[test]
    fn response_connect_2xx_has_no_body() {
        let mut parser = ResponseParser::new(Method::Connect);
        feed_resp(&mut parser, "HTTP/1.1 200 OK\r\n\r\n");
        assert!(parser.is_completed());
    }

    #[test]
    fn response_unframed_rejected() {
        let mut parser = ResponseParser::new(Method::Get);
        let err = parser
            .read(b"HTTP/1.1 200 OK\r\nServer: x\r\n\r\nbody")
            .unwrap_err();
        assert_eq!(err.status, 411);
        assert_eq!(parser.state(), State::BodyUntilClose);
    }

    #[test]
    fn response_reset_reuses_parser() {
        let mut parser = ResponseParser::new(Method::Get);
        feed_resp(&mut parser, "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi");
        assert!(parser.is_completed());
        parser.reset(Method::Get);
        assert_eq!(parser.state(), State::Start);
        feed_resp(&mut parser, "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
        assert!(parser.is_completed());
        assert_eq!(parser.status().code, 404);
        assert_eq!(parser.body(), b"");
    }

    #[test]
    fn response_iis_extended_code() {
        let mut parser = ResponseParser::new(Method::Get);
        feed_resp(&mut parser, "HTTP/1.1 404.3 Not Found\r\nContent-Length: 0\r\n\r\n");
        assert!(parser.is_completed());
        assert_eq!(parser.status().code, 404);
    }
}
