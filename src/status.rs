use std::fmt;

/// Response status line: numeric code and reason phrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub msg: String,
}

impl Status {
    /// Status with the canonical reason phrase for `code`.
    pub fn from_code(code: u16) -> Self {
        Status {
            code,
            msg: default_status_msg(code).to_owned(),
        }
    }

    /// Status with an explicit reason phrase.
    pub fn new(code: u16, msg: impl Into<String>) -> Self {
        Status {
            code,
            msg: msg.into(),
        }
    }

    pub fn is_informational(&self) -> bool {
        self.code / 100 == 1
    }

    pub fn is_success(&self) -> bool {
        self.code / 100 == 2
    }

    pub fn is_redirect(&self) -> bool {
        self.code / 100 == 3
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::from_code(200)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.msg)
    }
}

/// The canonical reason phrase for a status code, or `"Unknown"`.
pub fn default_status_msg(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        102 => "Processing",

        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        207 => "Multi-Status",
        208 => "Already Reported",
        226 => "IM Used",

        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",

        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        421 => "Misdirected Request",
        422 => "Unprocessable Entity",
        423 => "Locked",
        424 => "Failed Dependency",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        451 => "Unavailable For Legal Reasons",

        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        506 => "Variant Also Negotiates",
        507 => "Insufficient Storage",
        508 => "Loop Detected",
        510 => "Not Extended",
        511 => "Network Authentication Required",

        _ => "Unknown",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_phrases() {
        assert_eq!(default_status_msg(200), "OK");
        assert_eq!(default_status_msg(404), "Not Found");
        assert_eq!(default_status_msg(431), "Request Header Fields Too Large");
        assert_eq!(default_status_msg(511), "Network Authentication Required");
    }

    #[test]
    fn unknown_phrase() {
        assert_eq!(default_status_msg(299), "Unknown");
        assert_eq!(default_status_msg(600), "Unknown");
    }

    #[test]
    fn display() {
        assert_eq!(Status::from_code(200).to_string(), "200 OK");
    }
}
