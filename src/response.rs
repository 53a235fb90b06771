use crate::headers::Headers;
use crate::status::Status;

/// An HTTP response. The body is bytes, but commonly text.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status: Status,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    /// An empty response with the default phrase for `code`.
    pub fn with_status(code: u16) -> Self {
        Response {
            status: Status::from_code(code),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// A `text/plain` response.
    pub fn text(code: u16, body: impl Into<Vec<u8>>) -> Self {
        let mut resp = Response::with_status(code);
        resp.headers.add("Content-Type", "text/plain");
        resp.body = body.into();
        resp
    }

    /// Add a header, builder style.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    /// The body interpreted as utf-8, lossily.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn text_response() {
        let resp = Response::text(404, "nope");
        assert_eq!(resp.status.code, 404);
        assert_eq!(resp.status.msg, "Not Found");
        assert_eq!(resp.headers.get("Content-Type"), "text/plain");
        assert_eq!(resp.body_text(), "nope");
    }
}
