use std::{error, fmt, io};

#[derive(Debug, PartialEq)]
pub(crate) enum ErrorKind {
    BadRequest,
    UnsupportedVersion,
    TooManyConnections,
    Io(IoError),
}

// Canned single-buffer responses for requests that never reach the response
// builder. The `\n` line terminator matches the wire format of every other
// response this server produces.
macro_rules! canned_responses {
    ($($name:ident: $status:expr;)*) => {
        pub(crate) const fn as_http(&self) -> &'static [u8] {
            match self { $(
                Self::$name { .. } => concat!(
                    "HTTP/1.1 ", $status, "\n",
                    "connection: close\n",
                    "content-length: 0\n",
                    "\n",
                ),
            )* }.as_bytes()
        }
    };
}

impl ErrorKind {
    canned_responses! {
        BadRequest: "400 Bad Request";
        UnsupportedVersion: "505 HTTP Version Not Supported";
        TooManyConnections: "429 Too Many Requests";
        Io: "500 Internal Server Error";
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}
