//! URL-path routing over a segment trie.

use crate::error::Error;
use crate::method::Method;
use crate::request::Request;
use crate::response::Response;
use crate::url;
use std::collections::HashMap;

/// Parameters captured from `:name` segments, keyed by parameter name.
pub type PathParams = HashMap<String, String>;

/// A request handler. Returning `Err(Error::ErrorResponse(_))` maps to that
/// status on the wire; any other error becomes a 500.
pub type Handler = dyn Fn(&Request, &PathParams) -> Result<Response, Error> + Send + Sync;

struct ParamChild {
    name: String,
    node: Box<Node>,
}

#[derive(Default)]
struct Node {
    methods: HashMap<Method, Box<Handler>>,
    children: HashMap<String, Node>,
    param: Option<ParamChild>,
    prefix: bool,
}

/// A matched route: the handler plus captured path parameters.
pub struct RouteMatch<'a> {
    pub handler: &'a Handler,
    pub path_params: PathParams,
}

/// Maps (method, path) to handlers.
///
/// Patterns are `/`-separated segments. A segment `:name` captures the
/// request's segment as a parameter; a trailing `*` makes the route match
/// any deeper path. Literal segments take priority over parameters.
/// Matching is case sensitive and empty segments (doubled or trailing `/`)
/// are ignored.
#[derive(Default)]
pub struct Router {
    root: Node,
}

impl Router {
    pub fn new() -> Router {
        Router::default()
    }

    // split on '/', drop empty segments, percent-decode each
    fn parts(path: &str) -> Result<Vec<String>, Error> {
        if !path.starts_with('/') {
            return Err(Error::Url(format!(
                "Expect URL path to begin with '/': {}",
                path
            )));
        }
        path.split('/')
            .filter(|s| !s.is_empty())
            .map(url::decode)
            .collect()
    }

    /// Register a handler for `(method, pattern)`.
    ///
    /// Fails with [`Error::InvalidRoute`] when the pattern conflicts with an
    /// existing route: a different parameter name at the same position, a
    /// route beneath a prefix route, turning a node with children into a
    /// prefix, or an exact duplicate.
    ///
    /// [`Error::InvalidRoute`]: ../enum.Error.html#variant.InvalidRoute
    pub fn add(
        &mut self,
        method: Method,
        pattern: &str,
        handler: impl Fn(&Request, &PathParams) -> Result<Response, Error> + Send + Sync + 'static,
    ) -> Result<(), Error> {
        let mut parts = Self::parts(pattern)?;
        let prefix = parts.last().map(|p| p == "*").unwrap_or(false);
        if prefix {
            parts.pop();
        }

        let mut node = &mut self.root;
        for part in &parts {
            if node.prefix {
                if prefix {
                    break;
                }
                return Err(Error::InvalidRoute(format!(
                    "Path already used as a prefix: {} {}",
                    method, pattern
                )));
            }
            if let Some(name) = part.strip_prefix(':') {
                if let Some(param) = &node.param {
                    if param.name != name {
                        return Err(Error::InvalidRoute(format!(
                            "Differing route parameter names for :{}: {} {}",
                            name, method, pattern
                        )));
                    }
                } else {
                    node.param = Some(ParamChild {
                        name: name.to_owned(),
                        node: Box::new(Node::default()),
                    });
                }
                node = &mut *node.param.as_mut().unwrap().node;
            } else {
                node = node.children.entry(part.clone()).or_default();
            }
        }

        if prefix && !node.prefix {
            if !node.children.is_empty() || node.param.is_some() {
                return Err(Error::InvalidRoute(format!(
                    "Cant add as prefix because already has children: {} {}",
                    method, pattern
                )));
            }
            node.prefix = true;
        }

        if node.methods.insert(method, Box::new(handler)).is_some() {
            return Err(Error::InvalidRoute(format!(
                "Route already exists: {} {}",
                method, pattern
            )));
        }
        Ok(())
    }

    /// Look up the handler for `(method, path)`.
    ///
    /// `Ok(None)` means no route matched; turning that into a 404 is the
    /// caller's decision. A path that matches with a different method fails
    /// with [`Error::MethodNotAllowed`].
    ///
    /// [`Error::MethodNotAllowed`]: ../enum.Error.html#variant.MethodNotAllowed
    pub fn get(&self, method: Method, path: &str) -> Result<Option<RouteMatch<'_>>, Error> {
        let parts = Self::parts(path)?;

        let mut path_params = PathParams::new();
        let mut node = &self.root;
        for part in parts {
            if node.prefix {
                break;
            }
            if let Some(child) = node.children.get(&part) {
                node = child;
            } else if let Some(param) = &node.param {
                path_params.insert(param.name.clone(), part);
                node = &*param.node;
            } else {
                return Ok(None);
            }
        }

        match node.methods.get(&method) {
            Some(handler) => Ok(Some(RouteMatch {
                handler: handler.as_ref(),
                path_params,
            })),
            None if node.methods.is_empty() => Ok(None),
            None => Err(Error::MethodNotAllowed {
                method,
                path: path.to_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ok(_: &Request, _: &PathParams) -> Result<Response, Error> {
        Ok(Response::with_status(200))
    }

    fn tagged(tag: &'static str) -> impl Fn(&Request, &PathParams) -> Result<Response, Error> {
        move |_, _| Ok(Response::text(200, tag))
    }

    fn lookup_tag(router: &Router, method: Method, path: &str) -> String {
        let matched = router.get(method, path).unwrap().unwrap();
        let resp = (matched.handler)(&Request::get("/").unwrap(), &matched.path_params).unwrap();
        resp.body_text()
    }

    #[test]
    fn simple() {
        let mut router = Router::new();
        router.add(Method::Get, "/", tagged("root")).unwrap();
        router.add(Method::Get, "/index.html", tagged("index")).unwrap();
        router.add(Method::Get, "/login", tagged("login-get")).unwrap();
        router.add(Method::Post, "/login", tagged("login-post")).unwrap();

        assert_eq!(lookup_tag(&router, Method::Get, "/"), "root");
        assert_eq!(lookup_tag(&router, Method::Get, "/index.html"), "index");
        assert_eq!(lookup_tag(&router, Method::Get, "/login"), "login-get");
        assert_eq!(lookup_tag(&router, Method::Post, "/login"), "login-post");
        // extra slashes are not significant
        assert_eq!(lookup_tag(&router, Method::Get, "//index.html"), "index");
        assert_eq!(lookup_tag(&router, Method::Get, "/login/"), "login-get");

        // found path, but not the method
        match router.get(Method::Post, "/index.html") {
            Err(Error::MethodNotAllowed { .. }) => {}
            other => panic!("expected MethodNotAllowed, got {:?}", other.is_ok()),
        }
        // not found
        assert!(router.get(Method::Get, "/not_found").unwrap().is_none());
        assert!(router.get(Method::Post, "/not_found").unwrap().is_none());
        // case sensitive
        assert!(router.get(Method::Get, "/Index.html").unwrap().is_none());

        // duplicates are not allowed
        assert!(router.add(Method::Get, "/index.html", ok).is_err());
        // invalid path
        assert!(router.add(Method::Get, "", ok).is_err());
    }

    #[test]
    fn prefix() {
        let mut router = Router::new();
        router.add(Method::Get, "/assets/*", ok).unwrap();

        assert!(router.get(Method::Get, "/assets/").unwrap().is_some());
        assert!(router
            .get(Method::Get, "/assets/application.js")
            .unwrap()
            .is_some());
        assert!(router
            .get(Method::Get, "/assets/dark/application.css")
            .unwrap()
            .is_some());

        match router.get(Method::Post, "/assets/hack.js") {
            Err(Error::MethodNotAllowed { .. }) => {}
            _ => panic!("expected MethodNotAllowed"),
        }

        assert!(router.get(Method::Get, "/index").unwrap().is_none());

        // children below a prefix are invalid
        assert!(router.add(Method::Get, "/assets/other", ok).is_err());
        // a node with children can not become a prefix
        router.add(Method::Get, "/other/child", ok).unwrap();
        assert!(router.add(Method::Get, "/other/*", ok).is_err());
    }

    #[test]
    fn path_params() {
        let mut router = Router::new();
        router.add(Method::Get, "/forums/:forum_name", ok).unwrap();
        router.add(Method::Get, "/forums/:forum_name/post", ok).unwrap();
        router
            .add(Method::Get, "/forums/:forum_name/topics/:topic_id", ok)
            .unwrap();
        router
            .add(Method::Get, "/forums/:forum_name/topics/:topic_id/post", ok)
            .unwrap();

        let matched = router.get(Method::Get, "/forums/General").unwrap().unwrap();
        assert_eq!(matched.path_params["forum_name"], "General");

        let matched = router
            .get(Method::Get, "/forums/General/topics/567/post")
            .unwrap()
            .unwrap();
        assert_eq!(matched.path_params["forum_name"], "General");
        assert_eq!(matched.path_params["topic_id"], "567");

        // same position must keep the same parameter name
        assert!(router
            .add(Method::Get, "/forums/:forum_name2/unread", ok)
            .is_err());
    }

    #[test]
    fn literal_beats_param() {
        let mut router = Router::new();
        router.add(Method::Get, "/u/:id", tagged("param")).unwrap();
        router.add(Method::Get, "/u/admin", tagged("literal")).unwrap();

        assert_eq!(lookup_tag(&router, Method::Get, "/u/admin"), "literal");
        assert_eq!(lookup_tag(&router, Method::Get, "/u/42"), "param");
    }

    #[test]
    fn segments_are_percent_decoded() {
        let mut router = Router::new();
        router.add(Method::Get, "/a%20b", tagged("spaced")).unwrap();
        assert_eq!(lookup_tag(&router, Method::Get, "/a b"), "spaced");
        assert_eq!(lookup_tag(&router, Method::Get, "/a%20b"), "spaced");
    }

    #[test]
    fn add_order_is_irrelevant() {
        let build = |patterns: &[&str]| {
            let mut router = Router::new();
            for p in patterns {
                router.add(Method::Get, p, ok).unwrap();
            }
            router
        };
        let a = build(&["/x/:p/y", "/x/lit/y", "/z/*"]);
        let b = build(&["/z/*", "/x/lit/y", "/x/:p/y"]);
        for router in &[a, b] {
            assert!(router.get(Method::Get, "/x/lit/y").unwrap().is_some());
            assert!(router.get(Method::Get, "/x/other/y").unwrap().is_some());
            assert!(router.get(Method::Get, "/z/deep/er").unwrap().is_some());
        }
    }
}
