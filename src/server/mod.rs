//! Server that accepts connections and routes requests to handlers.
//!
//! The server owns a set of listeners, each plain TCP or TLS with a
//! [`PrivateCert`], and drives every accepted connection through one
//! single-threaded reactor. Handlers are plain functions from request and
//! path parameters to a response; see [`Router`] for the path grammar.
//!
//! ## Example
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
//! server.add_listener("0.0.0.0", 8080);
//! server.start().unwrap();
//!
//! let handle = server.handle();
//! std::thread::spawn(move || server.run().unwrap());
//! // ... later:
//! handle.exit();
//! ```
//!
//! [`PrivateCert`]: ../net/struct.PrivateCert.html
//! [`Router`]: struct.Router.html

mod conn;
mod router;

pub use router::{Handler, PathParams, RouteMatch, Router};

use crate::error::Error;
use crate::net::{AsyncIo, PrivateCert, TcpListenSocket};
use conn::ServerCore;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;

struct ListenerConfig {
    bind: String,
    port: u16,
    cert: Option<PrivateCert>,
}

/// A handle for stopping a running server from another thread.
#[derive(Clone)]
pub struct ServerHandle {
    io: AsyncIo,
}

impl ServerHandle {
    /// Stop the reactor. Blocks until the run loop has drained; pending
    /// operations observe a quiet `Aborted`.
    pub fn exit(&self) {
        self.io.exit();
    }
}

/// HTTP server over a router.
pub struct Server {
    io: AsyncIo,
    router: Option<Router>,
    configs: Vec<ListenerConfig>,
    listeners: Vec<TcpListenSocket>,
    core: Option<Arc<ServerCore>>,
}

impl Server {
    pub fn new(router: Router) -> Result<Server, Error> {
        crate::net::init();
        Ok(Server {
            io: AsyncIo::new()?,
            router: Some(router),
            configs: Vec::new(),
            listeners: Vec::new(),
            core: None,
        })
    }

    /// Add a plain TCP listener. Use port 0 for an ephemeral port.
    pub fn add_listener(&mut self, bind: &str, port: u16) {
        self.configs.push(ListenerConfig {
            bind: bind.to_owned(),
            port,
            cert: None,
        });
    }

    /// Add a TLS listener serving the given identity.
    pub fn add_listener_tls(&mut self, bind: &str, port: u16, cert: PrivateCert) {
        self.configs.push(ListenerConfig {
            bind: bind.to_owned(),
            port,
            cert: Some(cert),
        });
    }

    /// Bind the listeners and post the initial accepts. After this the
    /// bound addresses are known; [`run`] does the actual work.
    ///
    /// [`run`]: #method.run
    pub fn start(&mut self) -> Result<(), Error> {
        if self.core.is_some() {
            return Err(Error::User("Server already started".into()));
        }
        if self.configs.is_empty() {
            return Err(Error::User("Server has no listeners".into()));
        }

        let router = self
            .router
            .take()
            .ok_or_else(|| Error::User("Server already started".into()))?;
        let core = ServerCore::new(self.io.clone(), router);

        for config in self.configs.drain(..) {
            let socket = TcpListenSocket::bind(&config.bind, config.port)?;
            socket.set_nonblocking(true)?;
            info!(
                "listening on {} ({})",
                socket.local_addr()?,
                if config.cert.is_some() { "tls" } else { "tcp" }
            );
            post_accept(&core, socket.native_handle(), config.cert);
            self.listeners.push(socket);
        }

        self.core = Some(core);
        Ok(())
    }

    /// Addresses actually bound, in listener order. Valid after `start`.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// A handle that can stop this server from another thread.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            io: self.io.clone(),
        }
    }

    /// Run the reactor on the calling thread until [`exit`] is called.
    /// Calls [`start`] first if that has not happened yet.
    ///
    /// [`start`]: #method.start
    /// [`exit`]: struct.ServerHandle.html#method.exit
    pub fn run(&mut self) -> Result<(), Error> {
        if self.core.is_none() {
            self.start()?;
        }
        self.io.run()
    }
}

/// Keep one accept posted per listener; each completion posts the next.
fn post_accept(core: &Arc<ServerCore>, fd: RawFd, cert: Option<PrivateCert>) {
    let on_accept = {
        let core = core.clone();
        let cert = cert.clone();
        move |tcp| {
            post_accept(&core, fd, cert.clone());
            conn::accepted(&core, tcp, cert.as_ref());
        }
    };
    let on_error = {
        let core = core.clone();
        move |e: Error| match e {
            Error::Aborted => trace!("accept aborted during shutdown"),
            e => {
                // we end up here when out of file descriptors; keep listening
                warn!("accept failed: {}, retrying", e);
                post_accept(&core, fd, cert);
            }
        }
    };
    core.io.accept(fd, on_accept, on_error);
}
