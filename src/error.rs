//! Error taxonomy for the runtime.
//!
//! Two tiers, matching the four categories the original draws between
//! programming-contract violations, foundational syscall failures,
//! recoverable per-connection I/O errors, and protocol failures that map to
//! an HTTP status. The first two never return a `Result` at all -- they go
//! through [`fatal`] instead, since the original has no recovery path for
//! them either (`LOG_SYSFATAL`/`LOG_FATAL`/assertion failure).

use std::fmt;

/// Recoverable failures a caller can act on: close the connection, respond
/// with a status, retry later.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// The three failure statuses `HttpConnection` can hand back to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    BadRequest,
    Forbidden,
    NotFound,
}

impl ProtocolError {
    pub fn status_line(self) -> &'static str {
        match self {
            ProtocolError::BadRequest => "HTTP/1.1 400 Bad Request\r\n",
            ProtocolError::Forbidden => "HTTP/1.1 403 Forbidden\r\n",
            ProtocolError::NotFound => "HTTP/1.1 404 Not Found\r\n",
        }
    }

    pub fn error_page_name(self) -> &'static str {
        match self {
            ProtocolError::BadRequest => "400.html",
            ProtocolError::Forbidden => "403.html",
            ProtocolError::NotFound => "404.html",
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ProtocolError::BadRequest => "bad request",
            ProtocolError::Forbidden => "forbidden",
            ProtocolError::NotFound => "not found",
        };
        write!(f, "{name}")
    }
}

/// Logs at `error!` and aborts the process. Used at the handful of call
/// sites the original treats as unrecoverable: creating the wakeup eventfd
/// or per-loop timerfd, the initial listen/bind, a wrong-thread assertion.
pub fn fatal(context: &str, err: &dyn std::error::Error) -> ! {
    tracing::error!(%context, %err, "fatal error, aborting");
    std::process::abort();
}
