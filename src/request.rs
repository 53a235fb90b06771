use crate::error::Error;
use crate::headers::Headers;
use crate::method::Method;
use crate::url::Url;

/// An HTTP request.
///
/// `raw_url`, when non-empty, is written verbatim as the request-target;
/// otherwise `url` is encoded. Requests parsed off the wire keep the exact
/// bytes the client sent in `raw_url` alongside the decoded `url`.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: Method,
    pub raw_url: String,
    pub url: Url,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    /// A request for a request-target such as `/search?q=x`.
    pub fn new(method: Method, target: &str) -> Result<Self, Error> {
        Ok(Request {
            method,
            raw_url: target.to_owned(),
            url: Url::parse_request(target)?,
            headers: Headers::new(),
            body: Vec::new(),
        })
    }

    pub fn get(target: &str) -> Result<Self, Error> {
        Request::new(Method::Get, target)
    }

    pub fn post(target: &str, body: impl Into<Vec<u8>>) -> Result<Self, Error> {
        let mut req = Request::new(Method::Post, target)?;
        req.body = body.into();
        Ok(req)
    }

    /// Add a header, builder style.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn new_parses_target() {
        let req = Request::new(Method::Get, "/a%20b?x=1").unwrap();
        assert_eq!(req.raw_url, "/a%20b?x=1");
        assert_eq!(req.url.path, "/a b");
        assert_eq!(req.url.query_param("x"), "1");
    }

    #[test]
    fn new_rejects_bad_target() {
        assert!(Request::new(Method::Get, "no-slash").is_err());
    }

    #[test]
    fn post_with_body() {
        let req = Request::post("/submit", "payload").unwrap();
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.body, b"payload");
    }
}
