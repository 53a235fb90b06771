use crate::method::Method;
use std::fmt;
use std::io;

/// Error while parsing an HTTP message off the wire.
///
/// If `status` is non-zero it is a suggested HTTP status code for the error
/// response, such as 414 for an overlong request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserError {
    pub message: &'static str,
    pub status: u16,
}

impl ParserError {
    pub(crate) fn new(message: &'static str) -> Self {
        ParserError { message, status: 0 }
    }

    pub(crate) fn with_status(message: &'static str, status: u16) -> Self {
        ParserError { message, status }
    }
}

impl fmt::Display for ParserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// An HTTP error signalled by application code, carrying the status to send.
///
/// Returning `Err(ErrorResponse.into())` from a request handler makes the
/// server send a response with this status, the message as a `text/plain`
/// body, and keep-alive disabled.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub status: u16,
    pub message: String,
    /// Acceptable content types, only populated by [`not_acceptable`].
    ///
    /// [`not_acceptable`]: #method.not_acceptable
    pub accepts: Vec<String>,
}

impl ErrorResponse {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        ErrorResponse {
            status,
            message: message.into(),
            accepts: Vec::new(),
        }
    }

    /// 400 Bad Request.
    pub fn bad_request(message: impl Into<String>) -> Self {
        ErrorResponse::new(400, message)
    }

    /// 404 Not Found.
    pub fn not_found(path: &str) -> Self {
        ErrorResponse::new(404, format!("Not Found {}", path))
    }

    /// 405 Method Not Allowed.
    pub fn method_not_allowed(method: Method, path: &str) -> Self {
        ErrorResponse::new(405, format!("{} not allowed for {}", method, path))
    }

    /// 406 Not Acceptable, carrying the content types that would have been
    /// acceptable.
    pub fn not_acceptable(accepts: Vec<String>) -> Self {
        let mut err = ErrorResponse::new(406, "No acceptable content type");
        err.accepts = accepts;
        err
    }

    /// True for 4xx statuses.
    pub fn is_client_error(&self) -> bool {
        self.status / 100 == 4
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

/// Errors of this crate.
#[derive(Debug)]
pub enum Error {
    /// Protocol violation detected while reading bytes.
    Parser(ParserError),
    /// Semantic failure decided by application code or framing rules.
    ErrorResponse(ErrorResponse),
    /// Malformed URL or percent-encoding.
    Url(String),
    /// Route registration conflict.
    InvalidRoute(String),
    /// Path matched a route, but not for this method.
    MethodNotAllowed { method: Method, path: String },
    /// Protocol-level failure that is not attributable to parsing a message,
    /// such as a disconnect in the middle of a body.
    Network(String),
    /// An OS-level socket operation failed.
    Socket(io::Error),
    /// Establishing a connection failed.
    Connection {
        host: String,
        port: u16,
        cause: io::Error,
    },
    /// The peer certificate did not verify against the trust store.
    CertificateVerification { host: String, port: u16 },
    /// TLS failure other than certificate verification.
    Tls(rustls::Error),
    /// The operation was cancelled by a reactor or client shutdown. Always
    /// an expected, quiet signal.
    Aborted,
    /// Local misuse of the library api.
    User(String),
}

impl Error {
    /// The status code to use when synthesising an error response.
    pub fn suggested_status(&self) -> u16 {
        match self {
            Error::Parser(p) if p.status != 0 => p.status,
            Error::Parser(_) => 400,
            Error::ErrorResponse(e) => e.status,
            Error::MethodNotAllowed { .. } => 405,
            _ => 500,
        }
    }

    /// True if this wraps an OS-level I/O error.
    pub fn is_io(&self) -> bool {
        match self {
            Error::Socket(_) | Error::Connection { .. } => true,
            _ => false,
        }
    }

    /// True if this is a non-blocking socket signalling "try again".
    pub fn is_would_block(&self) -> bool {
        match self {
            Error::Socket(e) => e.kind() == io::ErrorKind::WouldBlock,
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Parser(v) => write!(f, "parser: {}", v),
            Error::ErrorResponse(v) => write!(f, "{}", v),
            Error::Url(v) => write!(f, "url: {}", v),
            Error::InvalidRoute(v) => write!(f, "invalid route: {}", v),
            Error::MethodNotAllowed { method, path } => {
                write!(f, "{} not allowed for {}", method, path)
            }
            Error::Network(v) => write!(f, "network: {}", v),
            Error::Socket(v) => write!(f, "socket: {}", v),
            Error::Connection { host, port, cause } => {
                write!(f, "failed to connect {}:{}: {}", host, port, cause)
            }
            Error::CertificateVerification { host, port } => {
                write!(f, "certificate verification failed for {}:{}", host, port)
            }
            Error::Tls(v) => write!(f, "tls: {}", v),
            Error::Aborted => write!(f, "aborted"),
            Error::User(v) => write!(f, "{}", v),
        }
    }
}

impl std::error::Error for Error {}

impl From<ParserError> for Error {
    fn from(e: ParserError) -> Self {
        Error::Parser(e)
    }
}

impl From<ErrorResponse> for Error {
    fn from(e: ErrorResponse) -> Self {
        Error::ErrorResponse(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Socket(e)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e)
    }
}
