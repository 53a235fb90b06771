//! Wire-format output of requests and responses.
//!
//! The writer owns the framing rules: `Content-Length` reflecting the body,
//! `Date` filled in when absent, default reason phrases, and the statuses
//! that forbid a body. Connection management headers (`Connection`) are the
//! server's concern, not the writer's.

use crate::error::Error;
use crate::headers::Headers;
use crate::method::Method;
use crate::net::Socket;
use crate::request::Request;
use crate::response::Response;
use crate::status::default_status_msg;
use crate::time::{format_time, now_utc};
use std::io::Write;

/// Statuses that must not carry a body.
pub(crate) fn status_forbids_body(code: u16) -> bool {
    code == 204 || code == 205 || code == 304
}

fn write_headers(out: &mut Vec<u8>, headers: &Headers) {
    for (name, value) in headers {
        let _ = write!(out, "{}: {}\r\n", name, value);
    }
    out.extend_from_slice(b"\r\n");
}

/// Serialise a request head and body into one buffer.
///
/// Sets `Date` if absent and `Content-Length` when the body is non-empty.
/// The request-target is `raw_url` verbatim when non-empty, else the encoded
/// `url`.
pub fn encode_request(req: &mut Request) -> Vec<u8> {
    req.headers.set_default("Date", format_time(now_utc()));
    if !req.body.is_empty() {
        req.headers.set("Content-Length", req.body.len().to_string());
    }

    let mut out = Vec::with_capacity(256 + req.body.len());
    let target = if req.raw_url.is_empty() {
        req.url.encode_request()
    } else {
        req.raw_url.clone()
    };
    let _ = write!(out, "{} {} HTTP/1.1\r\n", req.method, target);
    write_headers(&mut out, &req.headers);
    out.extend_from_slice(&req.body);

    if log_enabled!(log::Level::Trace) {
        trace!(
            "encode_request: {:?}",
            String::from_utf8_lossy(&out[..out.len() - req.body.len()])
        );
    }
    out
}

/// Serialise a response head (status line and headers, no body).
///
/// Fills an empty reason phrase with the default for the code, sets `Date`
/// if absent and `Content-Length` to the body length. Statuses 204, 205 and
/// 304 forbid a body: a non-empty body is an error and `Content-Length` is
/// removed. For a HEAD request the body is suppressed by the caller, but
/// `Content-Length` still reflects it.
pub fn encode_response_head(resp: &mut Response) -> Result<Vec<u8>, Error> {
    if resp.status.msg.is_empty() {
        resp.status.msg = default_status_msg(resp.status.code).to_owned();
    }
    resp.headers.set_default("Date", format_time(now_utc()));

    if status_forbids_body(resp.status.code) {
        if !resp.body.is_empty() {
            return Err(Error::User(format!(
                "Response with status {} can not have a body",
                resp.status.code
            )));
        }
        resp.headers.remove("Content-Length");
    } else {
        resp.headers
            .set("Content-Length", resp.body.len().to_string());
    }

    let mut out = Vec::with_capacity(256);
    let _ = write!(out, "HTTP/1.1 {} {}\r\n", resp.status.code, resp.status.msg);
    write_headers(&mut out, &resp.headers);

    if log_enabled!(log::Level::Trace) {
        trace!("encode_response_head: {:?}", String::from_utf8_lossy(&out));
    }
    Ok(out)
}

/// Write a request to a socket, blocking until fully sent.
pub fn send_request(socket: &mut Socket, req: &mut Request) -> Result<(), Error> {
    let buf = encode_request(req);
    socket.send_all(&buf)
}

/// Write a response to a socket, blocking until fully sent. `req_method` is
/// the method of the request being answered, for HEAD body suppression.
pub fn send_response(
    socket: &mut Socket,
    resp: &mut Response,
    req_method: Method,
) -> Result<(), Error> {
    let head = encode_response_head(resp)?;
    socket.send_all(&head)?;
    if req_method != Method::Head && !status_forbids_body(resp.status.code) && !resp.body.is_empty()
    {
        socket.send_all(&resp.body)?;
    }
    Ok(())
}
