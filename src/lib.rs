//! hwire is an HTTP/1.1 client and server library implementing the wire
//! protocol end-to-end over TCP, optionally wrapped in TLS.
//!
//! The crate is built from a small number of tightly interlocking parts:
//!
//!   * An incremental [message parser] shared between client and server,
//!     including chunked transfer encoding and trailer headers.
//!   * A [writer] producing wire-format output with correct framing.
//!   * A [`Socket`] abstraction with plain TCP and TLS variants, exposing
//!     both blocking and reactor-driven asynchronous operations.
//!   * A single-threaded asynchronous I/O reactor, [`AsyncIo`].
//!   * A connection-oriented [`Server`] with keep-alive semantics and a
//!     path-segment [`Router`].
//!   * A blocking [`ClientConnection`] and a pooled [`AsyncClient`] with a
//!     bounded worker set and a request rate limit.
//!
//! ## Server example
//!
//! ```no_run
//! use hwire::prelude::*;
//!
//! let mut router = Router::new();
//! router
//!     .add(Method::Get, "/hello/:name", |_req, params| {
//!         Ok(Response::text(200, format!("Hello {}", params["name"])))
//!     })
//!     .unwrap();
//!
//! let mut server = Server::new(router).unwrap();
//! server.add_listener("127.0.0.1", 8080);
//! server.start().unwrap();
//! server.run().unwrap();
//! ```
//!
//! ## Client example
//!
//! ```no_run
//! use hwire::prelude::*;
//! use hwire::client::{AsyncClient, AsyncClientParams};
//!
//! let mut params = AsyncClientParams::new("example.com", 80);
//! params.max_connections = 2;
//! let client = AsyncClient::new(params).unwrap();
//!
//! let pending = client.queue(Request::new(Method::Get, "/").unwrap()).unwrap();
//! let response = pending.wait().unwrap().unwrap();
//! assert_eq!(response.status.code, 200);
//! ```
//!
//! [message parser]: parser/index.html
//! [writer]: writer/index.html
//! [`Socket`]: net/enum.Socket.html
//! [`AsyncIo`]: net/struct.AsyncIo.html
//! [`Server`]: server/struct.Server.html
//! [`Router`]: server/struct.Router.html
//! [`ClientConnection`]: client/struct.ClientConnection.html
//! [`AsyncClient`]: client/struct.AsyncClient.html

#![warn(clippy::all)]

#[macro_use]
extern crate log;

mod error;
mod headers;
mod method;
mod request;
mod response;
mod status;
mod time;

pub mod client;
pub mod net;
pub mod parser;
pub mod server;
pub mod url;
pub mod writer;

pub use crate::error::{Error, ErrorResponse, ParserError};
pub use crate::headers::{ContentType, Headers};
pub use crate::method::Method;
pub use crate::request::Request;
pub use crate::response::Response;
pub use crate::status::{default_status_msg, Status};
pub use crate::time::{format_time, parse_time};
pub use crate::url::Url;

pub mod prelude {
    //! Convenience import of the most commonly used types.
    pub use crate::client::AsyncClient;
    pub use crate::net::{Socket, SocketFactory};
    pub use crate::server::{Router, Server};
    pub use crate::{Error, Headers, Method, Request, Response, Status, Url};
}
