//! Response assembly and non-blocking delivery.
//!
//! Building a response opens the body file up front (falling back to the
//! error templates), composes the complete header block into one buffer,
//! and leaves delivery to two resumable send phases: the header buffer via
//! `write(2)`, then the body via `sendfile(2)`.

use crate::http::{
    mime,
    request::Request,
    types::{StatusCode, Version},
};
use mio::net::TcpStream;
use std::{
    fmt::Write as _,
    fs::File,
    io::{self, Write},
    path::Path,
    time::SystemTime,
};
use tracing::{debug, error};

/// An opened response body with everything the header block needs.
pub(crate) struct BodySource {
    pub(crate) status: StatusCode,
    pub(crate) file: File,
    pub(crate) len: u64,
    pub(crate) modified: SystemTime,
    pub(crate) mime: &'static str,
}

fn open_file(path: &Path) -> io::Result<(File, std::fs::Metadata)> {
    let file = File::open(path)?;
    let meta = file.metadata()?;
    if meta.is_dir() {
        return Err(io::Error::from(io::ErrorKind::NotFound));
    }
    Ok((file, meta))
}

/// Opens the resolved path, substituting the 404 or generic error template
/// when it cannot be served. A missing template propagates as an error; the
/// caller answers with a canned 500 and closes.
pub(crate) fn open_body(root: &Path, absolute: &Path) -> io::Result<BodySource> {
    let (status, path, opened) = match open_file(absolute) {
        Ok(opened) => (StatusCode::Ok, absolute.to_path_buf(), opened),
        Err(e) => {
            let (status, template) = match e.kind() {
                io::ErrorKind::NotFound => {
                    debug!(path = %absolute.display(), "not found");
                    (StatusCode::NotFound, root.join("error/404.html"))
                }
                _ => {
                    error!(path = %absolute.display(), error = %e, "body open failed");
                    (StatusCode::InternalServerError, root.join("error/error.html"))
                }
            };
            let opened = open_file(&template)?;
            (status, template, opened)
        }
    };

    let (file, meta) = opened;
    Ok(BodySource {
        status,
        len: meta.len(),
        modified: meta.modified()?,
        mime: mime::from_path(&path),
        file,
    })
}

/// Keep-alive holds iff the request's `Connection` value begins with `k`
/// and the protocol is HTTP/1.1.
pub(crate) fn negotiate_keep_alive(request: &Request) -> bool {
    request.version == Version::Http11
        && matches!(
            request.headers.get(b"connection").and_then(|v| v.first()),
            Some(&b'k') | Some(&b'K')
        )
}

/// Composes the complete header block, blank line included.
///
/// Lines are `\n`-terminated, matching the observed wire format of the
/// served protocol rather than strict CRLF.
pub(crate) fn compose_headers(
    version: Version,
    status: StatusCode,
    keep_alive: bool,
    idle_timeout_secs: u64,
    body_len: u64,
    body_mime: &str,
    modified: SystemTime,
    server_name: &str,
) -> Vec<u8> {
    let mut head = String::with_capacity(256);

    let _ = writeln!(head, "{} {} {}", version.as_str(), status.code(), status.reason());
    if keep_alive {
        head.push_str("connection: keep-alive\n");
        let _ = writeln!(head, "keep-alive: timeout={idle_timeout_secs}");
    } else {
        head.push_str("connection: close\n");
    }
    let _ = writeln!(head, "content-length: {body_len}");
    if mime::is_text(body_mime) {
        let _ = writeln!(head, "content-type: {body_mime}; charset=UTF-8");
    } else {
        let _ = writeln!(head, "content-type: {body_mime}");
    }
    let _ = writeln!(head, "date: {}", httpdate::fmt_http_date(SystemTime::now()));
    let _ = writeln!(head, "last-modified: {}", httpdate::fmt_http_date(modified));
    let _ = writeln!(head, "server: {server_name}");
    head.push_str("cache-control: private, no-cache, no-store, must-revalidate\n");
    head.push('\n');

    head.into_bytes()
}

/// Progress of one resumable send phase.
#[derive(Debug, PartialEq)]
pub(crate) enum WriteProgress {
    /// Everything queued for this phase went out.
    Complete,
    /// Backpressure; resume on the next writability event.
    Suspend,
    /// Peer gone or hard error; tear the connection down.
    Closed,
}

/// Sends `buf[*offset..]`, advancing the offset across partial writes.
pub(crate) fn send_headers<W: Write>(
    stream: &mut W,
    buf: &[u8],
    offset: &mut usize,
) -> WriteProgress {
    while *offset < buf.len() {
        match stream.write(&buf[*offset..]) {
            Ok(0) => {
                debug!("zero-byte send, client disconnected");
                return WriteProgress::Closed;
            }
            Ok(n) => *offset += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return WriteProgress::Suspend,
            Err(e) => {
                error!(error = %e, "header send failed");
                return WriteProgress::Closed;
            }
        }
    }
    WriteProgress::Complete
}

/// Transfers `file[*offset..len]` to the socket, advancing the offset as
/// the kernel reports progress.
pub(crate) fn send_body(
    stream: &mut TcpStream,
    file: &File,
    offset: &mut u64,
    len: u64,
) -> WriteProgress {
    while *offset < len {
        let remaining = (len - *offset) as usize;
        match transfer(stream, file, offset, remaining) {
            Ok(0) => {
                debug!("zero-byte body send, client disconnected");
                return WriteProgress::Closed;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return WriteProgress::Suspend,
            Err(e) => {
                error!(error = %e, "body send failed");
                return WriteProgress::Closed;
            }
        }
    }
    WriteProgress::Complete
}

// Zero-copy file-to-socket transfer; the kernel advances the offset.
#[cfg(target_os = "linux")]
fn transfer(stream: &mut TcpStream, file: &File, offset: &mut u64, count: usize) -> io::Result<usize> {
    use std::os::fd::AsRawFd;

    let mut off = *offset as libc::off_t;
    let sent = unsafe { libc::sendfile(stream.as_raw_fd(), file.as_raw_fd(), &mut off, count) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    *offset = off as u64;
    Ok(sent as usize)
}

// Staging-buffer fallback where sendfile(2) is unavailable. Offset
// semantics match the zero-copy path: only bytes the socket accepted count.
#[cfg(not(target_os = "linux"))]
fn transfer(stream: &mut TcpStream, file: &File, offset: &mut u64, count: usize) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;

    let mut staged = [0u8; 8192];
    let take = count.min(staged.len());
    let read = file.read_at(&mut staged[..take], *offset)?;
    if read == 0 {
        return Ok(0);
    }
    let written = stream.write(&staged[..read])?;
    *offset += written as u64;
    Ok(written)
}

/// Best-effort delivery of a canned response on a connection that is about
/// to be torn down. Backpressure and errors are not retried.
pub(crate) fn send_inline<W: Write>(stream: &mut W, response: &'static [u8]) {
    let mut offset = 0;
    send_headers(stream, response, &mut offset);
}

#[cfg(test)]
mod response_self {
    use super::*;
    use crate::http::request::parse_head;
    use std::{collections::VecDeque, time::Duration};

    enum WStep {
        Accept(usize),
        Block,
        Interrupt,
        Zero,
    }

    struct ScriptedWriter {
        steps: VecDeque<WStep>,
        written: Vec<u8>,
    }

    impl ScriptedWriter {
        fn new<const N: usize>(steps: [WStep; N]) -> Self {
            Self {
                steps: steps.into_iter().collect(),
                written: Vec::new(),
            }
        }
    }

    impl Write for ScriptedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.steps.pop_front() {
                None | Some(WStep::Block) => Err(io::ErrorKind::WouldBlock.into()),
                Some(WStep::Interrupt) => Err(io::ErrorKind::Interrupted.into()),
                Some(WStep::Zero) => Ok(0),
                Some(WStep::Accept(n)) => {
                    let n = n.min(buf.len());
                    self.written.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn headers_partial_sends_resume() {
        let buf = b"HTTP/1.1 200 OK\n\n";
        let mut offset = 0;

        let mut writer = ScriptedWriter::new([WStep::Accept(5), WStep::Block]);
        assert_eq!(
            send_headers(&mut writer, buf, &mut offset),
            WriteProgress::Suspend
        );
        assert_eq!(offset, 5);

        let mut writer = ScriptedWriter::new([WStep::Accept(64)]);
        assert_eq!(
            send_headers(&mut writer, buf, &mut offset),
            WriteProgress::Complete
        );
        assert_eq!(offset, buf.len());
        assert_eq!(writer.written, &buf[5..]);
    }

    #[test]
    fn headers_interrupted_is_retried() {
        let buf = b"HTTP/1.1 200 OK\n\n";
        let mut offset = 0;
        let mut writer = ScriptedWriter::new([WStep::Interrupt, WStep::Accept(64)]);

        assert_eq!(
            send_headers(&mut writer, buf, &mut offset),
            WriteProgress::Complete
        );
    }

    #[test]
    fn headers_zero_byte_send_closes() {
        let mut offset = 0;
        let mut writer = ScriptedWriter::new([WStep::Zero]);

        assert_eq!(
            send_headers(&mut writer, b"x", &mut offset),
            WriteProgress::Closed
        );
    }

    #[test]
    fn offset_never_exceeds_length() {
        let buf = b"0123456789";
        let mut offset = 0;
        let mut writer = ScriptedWriter::new([WStep::Accept(3), WStep::Accept(3), WStep::Accept(64)]);

        send_headers(&mut writer, buf, &mut offset);
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn keep_alive_negotiation() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n", true),
            ("GET / HTTP/1.1\r\nconnection: Keep-Alive\r\n\r\n", true),
            ("GET / HTTP/1.1\r\nConnection: close\r\n\r\n",      false),
            ("GET / HTTP/1.1\r\n\r\n",                           false),
            // HTTP/1.0 never keeps alive, whatever the header says.
            ("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n", false),
        ];

        for (raw, expected) in cases {
            let request = parse_head(raw.as_bytes()).unwrap();
            assert_eq!(negotiate_keep_alive(&request), expected, "{raw:?}");
        }
    }

    #[test]
    fn header_block_order_and_format() {
        let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(784111777);
        let head = compose_headers(
            Version::Http11,
            StatusCode::Ok,
            true,
            5,
            11,
            "text/plain",
            modified,
            "ember_web/test",
        );
        let head = String::from_utf8(head).unwrap();
        let lines: Vec<&str> = head.split('\n').collect();

        assert_eq!(lines[0], "HTTP/1.1 200 OK");
        assert_eq!(lines[1], "connection: keep-alive");
        assert_eq!(lines[2], "keep-alive: timeout=5");
        assert_eq!(lines[3], "content-length: 11");
        assert_eq!(lines[4], "content-type: text/plain; charset=UTF-8");
        assert!(lines[5].starts_with("date: "), "{}", lines[5]);
        assert!(lines[5].ends_with(" GMT"));
        assert_eq!(lines[6], "last-modified: Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(lines[7], "server: ember_web/test");
        assert_eq!(
            lines[8],
            "cache-control: private, no-cache, no-store, must-revalidate"
        );
        // Blank line terminates the block; no CR anywhere.
        assert_eq!(&lines[9..], &["", ""]);
        assert!(!head.contains('\r'));
    }

    #[test]
    fn close_responses_omit_keep_alive_headers() {
        let head = compose_headers(
            Version::Http10,
            StatusCode::NotFound,
            false,
            5,
            0,
            "application/json",
            SystemTime::UNIX_EPOCH,
            "s",
        );
        let head = String::from_utf8(head).unwrap();

        assert!(head.starts_with("HTTP/1.0 404 Not Found\n"));
        assert!(head.contains("connection: close\n"));
        assert!(!head.contains("keep-alive:"));
        assert!(head.contains("content-type: application/json\n"));
    }

    fn scratch_root(tag: &str) -> std::path::PathBuf {
        let root = std::env::temp_dir().join(format!("ember-resp-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(root.join("error")).unwrap();
        std::fs::write(root.join("error/404.html"), "<h1>404</h1>").unwrap();
        std::fs::write(root.join("error/error.html"), "<h1>oops</h1>").unwrap();
        root
    }

    #[test]
    fn open_body_serves_existing_files() {
        let root = scratch_root("ok");
        std::fs::write(root.join("hello.txt"), "hello world").unwrap();

        let body = open_body(&root, &root.join("hello.txt")).unwrap();
        assert_eq!(body.status, StatusCode::Ok);
        assert_eq!(body.len, 11);
        assert_eq!(body.mime, "text/plain");

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn open_body_substitutes_404_template() {
        let root = scratch_root("404");

        let body = open_body(&root, &root.join("missing.html")).unwrap();
        assert_eq!(body.status, StatusCode::NotFound);
        assert_eq!(body.len, 12);
        assert_eq!(body.mime, "text/html");

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn open_body_missing_template_is_an_error() {
        let root = scratch_root("fatal");
        std::fs::remove_dir_all(root.join("error")).unwrap();

        assert!(open_body(&root, &root.join("missing.html")).is_err());

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn open_body_directory_is_not_found() {
        let root = scratch_root("dir");
        std::fs::create_dir_all(root.join("docs")).unwrap();

        let body = open_body(&root, &root.join("docs")).unwrap();
        assert_eq!(body.status, StatusCode::NotFound);

        std::fs::remove_dir_all(&root).unwrap();
    }
}
