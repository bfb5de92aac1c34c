//! ember_web - Event-driven HTTP/1.1 static-file server
//!
//! A single-threaded static-file server built around three pieces:
//!
//! - a non-blocking **reactor** that multiplexes readiness events across
//!   every live connection,
//! - a per-connection **state machine** (read request, send headers, send
//!   body, keep-alive idle),
//! - an **indexed min-heap** of connections keyed by last activity, which
//!   gives the reactor its wait timeout and lets an idle sweeper reclaim
//!   stale keep-alive connections in logarithmic time.
//!
//! Bodies are served straight from the filesystem with `sendfile(2)`, so a
//! response never passes through userspace once the headers are out.
//!
//! # Quick Start
//!
//! ```no_run
//! use ember_web::Server;
//!
//! fn main() -> std::io::Result<()> {
//!     let listener = Server::bind("127.0.0.1:8080".parse().unwrap())?;
//!
//!     Server::builder()
//!         .listener(listener)
//!         .document_root("/var/www/html")
//!         .build()?
//!         .run()
//! }
//! ```
//!
//! The document root must contain `error/404.html` and `error/error.html`;
//! they are served as the bodies of 404 and 500 responses and their absence
//! is a startup error.
//!
//! # Connection management
//!
//! Every accepted connection is enqueued into the activity heap with
//! priority "now", and every read or write event refreshes that priority.
//! Each reactor iteration sweeps the heap root while it is older than
//! [`idle_timeout`](limits::ServerLimits::idle_timeout), so an idle
//! keep-alive connection costs exactly one heap slot until it expires.
//! When the heap is full, new connections are answered `429` and closed
//! without ever entering the loop.
pub(crate) mod http {
    pub(crate) mod mime;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod queue;
    pub(crate) mod reactor;
    pub(crate) mod server_impl;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::server::server_impl::{Server, ServerBuilder, ShutdownHandle};
