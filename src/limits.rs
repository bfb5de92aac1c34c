//! Server configuration limits and timeouts
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - File-descriptor exhaustion
//! - Slowloris-style idle connection hoarding
//! - Oversized request heads
//!
//! # Examples
//!
//! ```no_run
//! use ember_web::{limits::ServerLimits, Server};
//! use std::time::Duration;
//!
//! fn main() -> std::io::Result<()> {
//!     let listener = Server::bind("127.0.0.1:8080".parse().unwrap())?;
//!
//!     Server::builder()
//!         .listener(listener)
//!         .document_root("/var/www/html")
//!         .limits(ServerLimits {
//!             max_connections: 4096,
//!             idle_timeout: Duration::from_secs(15),
//!             ..ServerLimits::default()
//!         })
//!         .build()?
//!         .run()
//! }
//! ```

use std::time::Duration;

/// Controls connection admission, idle reclamation, and request sizing.
///
/// The server pre-sizes its connection arena and activity heap from
/// `max_connections`, so every limit here is fixed for the lifetime of the
/// reactor.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Maximum number of concurrent connections (default: `1024`).
    ///
    /// Accepted sockets beyond this limit receive an immediate HTTP `429`
    /// response and are closed without entering the event loop.
    pub max_connections: usize,

    /// Maximum time a connection may sit without any socket activity
    /// before the sweeper closes it (default: `5 seconds`).
    ///
    /// This single knob governs both keep-alive expiry and the reactor's
    /// maximum wait between sweeps. It is also advertised to clients as
    /// `keep-alive: timeout=<seconds>`.
    pub idle_timeout: Duration,

    /// Size of the per-connection request buffer in bytes (default: `8192`).
    ///
    /// A request head that does not fit receives a `400` response and the
    /// connection is closed.
    pub request_buffer_size: usize,

    /// Value of the `server` response header
    /// (default: `ember_web/<crate version>`).
    pub server_name: String,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            idle_timeout: Duration::from_secs(5),
            request_buffer_size: 8192,
            server_name: concat!("ember_web/", env!("CARGO_PKG_VERSION")).to_string(),

            _priv: (),
        }
    }
}
