//! URLs and percent coding.

use crate::error::Error;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::fmt;
use std::fmt::Write;

// RFC 3986 unreserved characters stay literal, as does '/' so encoded paths
// keep their segment structure. Everything else, including non-ascii bytes,
// becomes %XX.
const PATH_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

// Query coding is path coding except space, which is emitted as '+'.
const QUERY_SET: &AsciiSet = &PATH_SET.remove(b' ');

fn url_error(url: &str, msg: &str) -> Error {
    Error::Url(format!("{}: {}", msg, url))
}

fn hex_value(url: &str, c: u8) -> Result<u8, Error> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(url_error(url, "Invalid percent encoding hex value")),
    }
}

fn decode_inner(s: &str, plus_as_space: bool) -> Result<String, Error> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                if i + 2 >= bytes.len() {
                    return Err(url_error(s, "Truncated percent encoding"));
                }
                let hi = hex_value(s, bytes[i + 1])?;
                let lo = hex_value(s, bytes[i + 2])?;
                out.push((hi << 4) | lo);
                i += 3;
            }
            b'+' if plus_as_space => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| url_error(s, "Percent encoding is not utf-8"))
}

/// Expand `%XX` sequences. Malformed sequences are errors.
pub fn decode(s: &str) -> Result<String, Error> {
    decode_inner(s, false)
}

/// Expand `%XX` sequences and map `+` to space.
pub fn decode_query(s: &str) -> Result<String, Error> {
    decode_inner(s, true)
}

/// Percent-encode a path, preserving `/` and RFC 3986 unreserved characters.
pub fn encode_path(s: &str) -> String {
    utf8_percent_encode(s, PATH_SET).to_string()
}

/// Percent-encode a query name or value; space becomes `+`.
pub fn encode_query(s: &str) -> String {
    utf8_percent_encode(s, QUERY_SET).to_string().replace(' ', "+")
}

/// A URL split into its components.
///
/// `query_params` maps each decoded name to the ordered sequence of decoded
/// values it appeared with, left to right.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Url {
    pub protocol: String,
    pub host: String,
    /// 0 means the default port for the protocol.
    pub port: u16,
    pub path: String,
    query_params: Vec<(String, Vec<String>)>,
}

impl Url {
    pub fn new(path: impl Into<String>) -> Self {
        Url {
            path: path.into(),
            ..Url::default()
        }
    }

    /// Parse a request-target: `/path[?name=value&...]`.
    ///
    /// The string must start with `/`. A query parameter without `=` gets an
    /// empty value but still exists for [`has_query_param`].
    ///
    /// [`has_query_param`]: #method.has_query_param
    pub fn parse_request(s: &str) -> Result<Url, Error> {
        if !s.starts_with('/') {
            return Err(url_error(s, "Request URL must start with a '/'"));
        }
        let mut url = Url::default();

        let (path, query) = match s.find('?') {
            Some(q) => (&s[..q], Some(&s[q + 1..])),
            None => (s, None),
        };
        url.path = decode(path)?;

        if let Some(query) = query {
            for pair in query.split('&') {
                if pair.is_empty() {
                    continue;
                }
                let (name, value) = match pair.find('=') {
                    Some(eq) => (&pair[..eq], &pair[eq + 1..]),
                    None => (pair, ""),
                };
                url.add_query_param(decode_query(name)?, decode_query(value)?);
            }
        }
        Ok(url)
    }

    /// Append a value for a query parameter name.
    pub fn add_query_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.query_params.iter_mut().find(|(n, _)| *n == name) {
            Some((_, values)) => values.push(value.into()),
            None => self.query_params.push((name, vec![value.into()])),
        }
    }

    pub fn has_query_param(&self, name: &str) -> bool {
        self.query_params.iter().any(|(n, _)| n == name)
    }

    /// The first value for `name`, or `""` when not present.
    pub fn query_param(&self, name: &str) -> &str {
        self.query_param_list(name)
            .first()
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    /// All values for `name` in left-to-right order.
    pub fn query_param_list(&self, name: &str) -> &[String] {
        self.query_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    /// Encode the path and query portion.
    pub fn encode_request(&self) -> String {
        let mut out = encode_path(&self.path);
        let mut sep = '?';
        for (name, values) in &self.query_params {
            for value in values {
                let _ = write!(out, "{}{}={}", sep, encode_query(name), encode_query(value));
                sep = '&';
            }
        }
        out
    }

    /// Encode the full URL including protocol, host and port when present.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        if !self.protocol.is_empty() {
            let _ = write!(out, "{}:", self.protocol);
        }
        if !self.host.is_empty() {
            let _ = write!(out, "//{}", self.host);
            if self.port != 0 {
                let _ = write!(out, ":{}", self.port);
            }
        }
        out.push_str(&self.encode_request());
        out
    }

    /// The explicit port, else the default for the protocol.
    pub fn port_or_default(&self) -> Result<u16, Error> {
        if self.port != 0 {
            return Ok(self.port);
        }
        match self.protocol.as_str() {
            "http" => Ok(80),
            "https" => Ok(443),
            _ => Err(url_error(
                &self.protocol,
                "No known default port for protocol",
            )),
        }
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}
