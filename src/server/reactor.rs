//! The event loop: one thread owning the readiness poll, the connection
//! arena, and the activity queue.
//!
//! Each iteration waits at most until the oldest queued connection would
//! expire, dispatches whatever readiness arrived, then sweeps expired
//! connections off the heap root. All connection mutation happens here, so
//! none of it needs locks.

use crate::{
    errors::ErrorKind,
    http::response,
    server::{
        connection::{ConnState, Connection},
        queue::{ConnectionQueue, QueueFull},
        server_impl::ServerContext,
    },
};
use mio::{
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Token, Waker,
};
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, error, info, trace, warn};

pub(crate) const LISTENER: Token = Token(usize::MAX);
pub(crate) const WAKER: Token = Token(usize::MAX - 1);

const EVENTS_CAPACITY: usize = 1024;

pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
    /// Scratch copy of the current batch, so dispatch can borrow freely.
    ready: Vec<(Token, bool, bool)>,
    listener: TcpListener,
    /// Connection records, indexed by handle. A handle doubles as the mio
    /// token and as the key into the activity queue.
    connections: Vec<Option<Connection>>,
    free: Vec<usize>,
    queue: ConnectionQueue,
    ctx: ServerContext,
    shutdown: Arc<AtomicBool>,
}

impl Reactor {
    pub(crate) fn new(
        listener: std::net::TcpListener,
        ctx: ServerContext,
    ) -> io::Result<(Self, Waker, Arc<AtomicBool>)> {
        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let max = ctx.limits.max_connections;
        let mut connections = Vec::with_capacity(max);
        connections.resize_with(max, || None);

        let reactor = Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            ready: Vec::new(),
            listener,
            connections,
            free: (0..max).rev().collect(),
            queue: ConnectionQueue::with_capacity(max),
            ctx,
            shutdown: Arc::clone(&shutdown),
        };
        Ok((reactor, waker, shutdown))
    }

    pub(crate) fn run(&mut self) -> io::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(%addr, root = %self.ctx.document_root.display(), "serving");

        while !self.shutdown.load(Ordering::Acquire) {
            let timeout = self.poll_timeout();
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            self.ready.clear();
            for event in self.events.iter() {
                self.ready
                    .push((event.token(), event.is_readable(), event.is_writable()));
            }

            for i in 0..self.ready.len() {
                let (token, readable, writable) = self.ready[i];
                match token {
                    LISTENER => self.accept_loop(),
                    WAKER => {}
                    Token(handle) => self.drive(handle, readable, writable),
                }
            }

            self.sweep();
        }

        self.drain_all();
        info!("reactor stopped");
        Ok(())
    }

    /// Wait no longer than it takes the oldest connection to expire.
    fn poll_timeout(&self) -> Duration {
        match self.queue.peek_min() {
            Some(entry) => self
                .ctx
                .limits
                .idle_timeout
                .saturating_sub(entry.priority.elapsed()),
            None => self.ctx.limits.idle_timeout,
        }
    }

    fn accept_loop(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let Some(handle) = self.free.pop() else {
            return reject_overloaded(stream, peer);
        };
        if let Err(QueueFull) = self.queue.enqueue(handle, Instant::now()) {
            self.free.push(handle);
            return reject_overloaded(stream, peer);
        }
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, Token(handle), Interest::READABLE)
        {
            error!(peer = %peer, error = %e, "connection register failed");
            self.queue.remove(handle);
            self.free.push(handle);
            return;
        }

        debug!(peer = %peer, handle, queued = self.queue.len(), "accepted");
        self.connections[handle] = Some(Connection::new(
            stream,
            peer,
            self.ctx.limits.request_buffer_size,
        ));
    }

    fn drive(&mut self, handle: usize, readable: bool, writable: bool) {
        {
            let Some(conn) = self.connections.get_mut(handle).and_then(Option::as_mut) else {
                // Closed earlier in this batch; stale readiness.
                return;
            };
            if readable {
                conn.advance_read(&self.ctx);
            }
            if writable {
                conn.advance_write();
            }
        }
        self.after_advance(handle);
    }

    /// Applies whatever the state machine decided: keep-alive reset, close,
    /// interest change. The queue slot is refreshed before the next event
    /// is looked at, so the sweeper always sees a consistent view.
    fn after_advance(&mut self, handle: usize) {
        let Some(conn) = self.connections.get_mut(handle).and_then(Option::as_mut) else {
            return;
        };

        if conn.state == ConnState::Done && conn.keep_alive && !conn.done_for_close {
            conn.reset_for_keep_alive();
        }
        if conn.done_for_close || conn.state == ConnState::Done {
            self.close_connection(handle);
            return;
        }

        let desired = conn.desired_interest();
        if desired != conn.registered {
            if let Err(e) = self
                .poll
                .registry()
                .reregister(&mut conn.stream, Token(handle), desired)
            {
                error!(handle, error = %e, "reregister failed");
                self.close_connection(handle);
                return;
            }
            conn.registered = desired;
        }

        self.queue.update(handle, Instant::now());
    }

    /// Closes every connection whose last activity is older than the idle
    /// timeout. The heap keeps the oldest at the root, so this stops at the
    /// first survivor.
    fn sweep(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.queue.peek_min() {
            if now.duration_since(entry.priority) < self.ctx.limits.idle_timeout {
                break;
            }
            let handle = entry.handle;
            trace!(queue = ?self.queue, "sweep state");
            debug!(handle, "idle timeout expired");
            self.close_connection(handle);
        }
    }

    fn close_connection(&mut self, handle: usize) {
        self.teardown(handle);
        self.queue.remove(handle);
    }

    // Release order: poll registration first, then the record itself (body
    // file before socket, buffers with the record), then the handle.
    fn teardown(&mut self, handle: usize) {
        let Some(mut conn) = self.connections.get_mut(handle).and_then(Option::take) else {
            warn!(handle, "teardown of handle with no connection record");
            return;
        };
        if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
            debug!(handle, error = %e, "deregister failed");
        }
        debug!(peer = %conn.peer, handle, "connection closed");
        drop(conn);
        self.free.push(handle);
    }

    fn drain_all(&mut self) {
        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            debug!(error = %e, "listener deregister failed");
        }
        while let Some(entry) = self.queue.dequeue_min() {
            self.teardown(entry.handle);
        }
    }
}

fn reject_overloaded(mut stream: TcpStream, peer: SocketAddr) {
    warn!(peer = %peer, "connection limit reached, rejecting");
    response::send_inline(&mut stream, ErrorKind::TooManyConnections.as_http());
    // Dropping the stream closes it; it never enters the loop.
}
