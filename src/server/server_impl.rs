//! Public server surface: builder, startup validation, shutdown handle.

use crate::{limits::ServerLimits, server::reactor::Reactor};
use mio::Waker;
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    io,
    net::{SocketAddr, TcpListener},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::error;

/// Configuration shared by every component the reactor drives.
pub(crate) struct ServerContext {
    pub(crate) document_root: PathBuf,
    pub(crate) limits: ServerLimits,
}

/// An HTTP/1.1 static-file server.
///
/// Construction validates the document root (including the error templates
/// at `error/404.html` and `error/error.html`) and registers the listener;
/// [`run`](Server::run) then blocks on the event loop until a
/// [`ShutdownHandle`] fires.
///
/// # Examples
///
/// ```no_run
/// use ember_web::Server;
///
/// fn main() -> std::io::Result<()> {
///     let listener = Server::bind("127.0.0.1:8080".parse().unwrap())?;
///
///     Server::builder()
///         .listener(listener)
///         .document_root("/var/www/html")
///         .build()?
///         .run()
/// }
/// ```
pub struct Server {
    reactor: Reactor,
    local_addr: SocketAddr,
    shutdown: ShutdownHandle,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            listener: None,
            document_root: None,
            limits: None,
        }
    }

    /// Binds a non-blocking listener with `SO_REUSEADDR` set, ready to hand
    /// to [`ServerBuilder::listener`].
    pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }

    /// The address the listener is bound to. Useful with port `0`.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle that stops the event loop from any thread.
    #[inline]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Runs the event loop on the calling thread.
    ///
    /// Returns once a [`ShutdownHandle`] fires (after closing the listener
    /// and every connection), or on a fatal poll error.
    pub fn run(mut self) -> io::Result<()> {
        self.reactor.run()
    }
}

/// Stops a running [`Server`] from another thread.
///
/// Signal handling is deliberately left to the embedding process: install
/// your handler of choice and call [`shutdown`](ShutdownHandle::shutdown)
/// from it.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Requests shutdown and wakes the reactor. Idempotent.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "shutdown wake failed");
        }
    }
}

/// Builder for configuring and creating [`Server`] instances.
pub struct ServerBuilder {
    listener: Option<TcpListener>,
    document_root: Option<PathBuf>,
    limits: Option<ServerLimits>,
}

impl ServerBuilder {
    /// Sets the TCP listener the server will accept connections from.
    ///
    /// **This is a required component.** [`Server::bind`] produces a
    /// suitable listener; any `std` listener works, it is switched to
    /// non-blocking mode during [`build`](Self::build).
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the directory request targets resolve under.
    ///
    /// **This is a required component.** The directory must contain
    /// `error/404.html` and `error/error.html`.
    #[inline(always)]
    pub fn document_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.document_root = Some(root.into());
        self
    }

    /// Overrides the default [`ServerLimits`].
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use ember_web::{limits::ServerLimits, Server};
    /// # use std::time::Duration;
    /// # let listener = Server::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    /// let server = Server::builder()
    ///     .listener(listener)
    ///     .document_root("/var/www/html")
    ///     .limits(ServerLimits {
    ///         idle_timeout: Duration::from_secs(30),
    ///         ..ServerLimits::default()
    ///     })
    ///     .build();
    /// ```
    #[inline(always)]
    pub fn limits(mut self, limits: ServerLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Finalizes the builder and constructs a [`Server`].
    ///
    /// Fails when the document root or an error template is missing, when a
    /// limit is out of range, or when the OS poll cannot be set up.
    ///
    /// # Panics
    ///
    /// Panics when [`listener`](Self::listener) or
    /// [`document_root`](Self::document_root) was not called.
    #[track_caller]
    pub fn build(self) -> io::Result<Server> {
        let listener = self
            .listener
            .expect("The `listener` method must be called to create");
        let document_root = self
            .document_root
            .expect("The `document_root` method must be called to create");
        let limits = self.limits.unwrap_or_default();

        validate_limits(&limits)?;
        validate_document_root(&document_root)?;

        let local_addr = listener.local_addr()?;
        let ctx = ServerContext {
            document_root,
            limits,
        };
        let (reactor, waker, flag) = Reactor::new(listener, ctx)?;

        Ok(Server {
            reactor,
            local_addr,
            shutdown: ShutdownHandle {
                flag,
                waker: Arc::new(waker),
            },
        })
    }
}

fn validate_limits(limits: &ServerLimits) -> io::Result<()> {
    if limits.max_connections == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "max_connections must be at least 1",
        ));
    }
    if limits.idle_timeout.is_zero() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "idle_timeout must be non-zero",
        ));
    }
    if limits.request_buffer_size == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "request_buffer_size must be non-zero",
        ));
    }
    Ok(())
}

// Startup contract: refusing to serve beats discovering a missing template
// on the first failing request.
fn validate_document_root(root: &Path) -> io::Result<()> {
    if !root.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("document root {} is not a directory", root.display()),
        ));
    }
    for template in ["error/404.html", "error/error.html"] {
        let path = root.join(template);
        if !path.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("required error template {} is missing", path.display()),
            ));
        }
    }
    Ok(())
}
