//! Per-connection state: socket, buffers, offsets, parsed request, response
//! progress, and the state machine the reactor advances on each readiness
//! event.

use crate::{
    errors::ErrorKind,
    http::{
        request::{self, ReadProgress, Request, RequestBuffer},
        response::{self, WriteProgress},
        types::{StatusCode, Version},
    },
    server::server_impl::ServerContext,
};
use mio::{net::TcpStream, Interest};
use std::{fs::File, net::SocketAddr, path::PathBuf};
use tracing::{debug, error};

/// Position of a connection in its request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    ReadingRequest,
    SendingHeaders,
    SendingBody,
    Done,
    KeepAliveIdle,
}

pub(crate) struct Connection {
    pub(crate) stream: TcpStream,
    pub(crate) peer: SocketAddr,
    pub(crate) state: ConnState,
    pub(crate) done_for_close: bool,
    pub(crate) keep_alive: bool,
    /// Interest currently registered with the poll; the reactor keeps this
    /// in sync when the state machine moves between reading and writing.
    pub(crate) registered: Interest,

    request_buf: RequestBuffer,
    request: Option<Request>,
    absolute_path: Option<PathBuf>,

    status: StatusCode,
    head_buf: Vec<u8>,
    head_offset: usize,
    body: Option<File>,
    body_len: u64,
    body_offset: u64,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr, buffer_size: usize) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::ReadingRequest,
            done_for_close: false,
            keep_alive: false,
            registered: Interest::READABLE,

            request_buf: RequestBuffer::new(buffer_size),
            request: None,
            absolute_path: None,

            status: StatusCode::Ok,
            head_buf: Vec::new(),
            head_offset: 0,
            body: None,
            body_len: 0,
            body_offset: 0,
        }
    }

    /// The interest matching the current state. Writability is wanted only
    /// while a response is in flight, so idle sockets never busy-spin.
    pub(crate) fn desired_interest(&self) -> Interest {
        match self.state {
            ConnState::SendingHeaders | ConnState::SendingBody => Interest::WRITABLE,
            _ => Interest::READABLE,
        }
    }

    /// Drives the read side: drain the socket, and once the head terminator
    /// has been seen, parse, resolve, and build the response.
    pub(crate) fn advance_read(&mut self, ctx: &ServerContext) {
        if self.state == ConnState::KeepAliveIdle {
            self.state = ConnState::ReadingRequest;
        }
        if self.state != ConnState::ReadingRequest {
            return;
        }

        match self.request_buf.drain(&mut self.stream) {
            ReadProgress::Incomplete => {}
            ReadProgress::Closed => self.done_for_close = true,
            ReadProgress::Overflow => {
                debug!(peer = %self.peer, "request head exceeds buffer");
                self.reject(&ErrorKind::BadRequest);
            }
            ReadProgress::HeadComplete(end) => self.on_head(end, ctx),
        }
    }

    fn on_head(&mut self, end: usize, ctx: &ServerContext) {
        let parsed = request::parse_head(self.request_buf.head(end));
        match parsed {
            Err(kind) => {
                debug!(peer = %self.peer, error = %kind, "rejecting request");
                self.reject(&kind);
            }
            Ok(req) => {
                let path = request::resolve_target(&ctx.document_root, &req.target);
                debug!(
                    peer = %self.peer,
                    method = ?req.method,
                    target = %req.target,
                    path = %path.display(),
                    "request"
                );

                self.keep_alive = response::negotiate_keep_alive(&req);
                self.absolute_path = Some(path);
                self.request = Some(req);
                self.state = ConnState::SendingHeaders;
                self.build_response(ctx);
            }
        }
    }

    fn build_response(&mut self, ctx: &ServerContext) {
        let Some(path) = self.absolute_path.as_deref() else {
            self.done_for_close = true;
            return;
        };

        match response::open_body(&ctx.document_root, path) {
            Err(e) => {
                error!(peer = %self.peer, error = %e, "response unavailable");
                self.reject(&ErrorKind::from(e));
            }
            Ok(body) => {
                let version = self
                    .request
                    .as_ref()
                    .map(|req| req.version)
                    .unwrap_or(Version::Http11);

                self.status = body.status;
                self.head_buf = response::compose_headers(
                    version,
                    body.status,
                    self.keep_alive,
                    ctx.limits.idle_timeout.as_secs(),
                    body.len,
                    body.mime,
                    body.modified,
                    &ctx.limits.server_name,
                );
                self.head_offset = 0;
                self.body_len = body.len;
                self.body_offset = 0;
                self.body = Some(body.file);
            }
        }
    }

    /// Drives the write side: headers first, then the body, both resumable
    /// across writability events.
    pub(crate) fn advance_write(&mut self) {
        if self.state == ConnState::SendingHeaders {
            match response::send_headers(&mut self.stream, &self.head_buf, &mut self.head_offset) {
                WriteProgress::Suspend => return,
                WriteProgress::Closed => {
                    self.done_for_close = true;
                    return;
                }
                WriteProgress::Complete => {
                    self.head_offset = 0;
                    self.state = ConnState::SendingBody;
                }
            }
        }

        if self.state == ConnState::SendingBody {
            let progress = match &self.body {
                None => WriteProgress::Complete,
                Some(file) => response::send_body(
                    &mut self.stream,
                    file,
                    &mut self.body_offset,
                    self.body_len,
                ),
            };

            match progress {
                WriteProgress::Suspend => {}
                WriteProgress::Closed => self.done_for_close = true,
                WriteProgress::Complete => {
                    debug!(peer = %self.peer, status = self.status.code(), "response sent");
                    self.body = None;
                    self.body_offset = 0;
                    self.state = ConnState::Done;
                }
            }
        }
    }

    /// Sends a canned response inline and flags the connection for
    /// teardown. Used for requests that never reach the response builder.
    pub(crate) fn reject(&mut self, kind: &ErrorKind) {
        response::send_inline(&mut self.stream, kind.as_http());
        self.keep_alive = false;
        self.done_for_close = true;
    }

    /// Clears all per-request state so the next request starts clean. The
    /// header buffer is released and the body is gone by the time we are
    /// back to idle.
    pub(crate) fn reset_for_keep_alive(&mut self) {
        self.request_buf.reset();
        self.request = None;
        self.absolute_path = None;
        self.status = StatusCode::Ok;
        self.head_buf = Vec::new();
        self.head_offset = 0;
        self.body = None;
        self.body_len = 0;
        self.body_offset = 0;
        self.state = ConnState::KeepAliveIdle;
    }
}
