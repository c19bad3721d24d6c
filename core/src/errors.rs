//! Error types for the dropwire core crate.
//!
//! The fixture and the client harness each get their own enum; [`CoreError`]
//! wraps both for callers (tests, config loading) that deal with either.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type encompassing all core error categories.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A mock upstream fixture error.
    #[error("Fixture error: {0}")]
    Fixture(#[from] FixtureError),

    /// A client harness error.
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    /// A configuration error (invalid values, missing fields).
    #[error("Config error: {0}")]
    Config(String),

    /// A configuration file could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A low-level I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the mock upstream fixture.
#[derive(Error, Debug)]
pub enum FixtureError {
    /// The listening socket could not be acquired.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The listen address did not resolve to a socket address.
    #[error("Invalid listen address: {0}")]
    InvalidAddress(String),

    /// The fixture configuration is invalid.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// A low-level I/O error while running the fixture.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broad classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The TCP connection could not be established (refused, unreachable,
    /// connect timeout).
    Connect,
    /// A configured request or read timeout elapsed.
    Timeout,
    /// The peer reset or closed the connection before a full response.
    Reset,
    /// Anything else reported by the client library.
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Reset => "reset",
            Self::Other => "other",
        };
        f.write_str(label)
    }
}

/// Errors raised by the client-under-test harness.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The client configuration is invalid.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// `send` was called before `start`.
    #[error("Client not started")]
    NotStarted,

    /// The client has been closed.
    #[error("Client closed")]
    Closed,

    /// `start` was called outside a tokio runtime.
    #[error("No tokio runtime available to start the client")]
    NoRuntime,

    /// The underlying HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    Build(String),

    /// The request target is malformed.
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// The request failed at the transport layer.
    #[error("Transport error ({kind}): {source}")]
    Transport {
        kind: TransportErrorKind,
        #[source]
        source: reqwest::Error,
    },

    /// The request was still pending when the caller stopped waiting.
    #[error("Request still pending after {waited:?}")]
    Hung { waited: Duration },

    /// The request was cancelled before it resolved.
    #[error("Request cancelled")]
    Cancelled,

    /// The outcome of this request was already handed to an earlier wait.
    #[error("Request outcome already taken")]
    OutcomeTaken,
}

impl ClientError {
    /// Returns the transport classification, if this is a transport failure.
    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(source: reqwest::Error) -> Self {
        Self::Transport {
            kind: classify_transport(&source),
            source,
        }
    }
}

/// Classify a reqwest error by its own flags and its source chain.
///
/// The `io::ErrorKind` of any I/O error in the chain decides first. Only
/// when there is none does the error text get a look: hyper reports a peer
/// that closed mid-message without an `io::Error` underneath.
pub fn classify_transport(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_timeout() {
        return TransportErrorKind::Timeout;
    }
    if err.is_connect() {
        return TransportErrorKind::Connect;
    }

    let mut source = err.source();
    while let Some(cause) = source {
        let io = cause.downcast_ref::<std::io::Error>();
        if let Some(kind) = io.and_then(classify_io) {
            return kind;
        }
        source = cause.source();
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if is_closed_message(&cause.to_string()) {
            return TransportErrorKind::Reset;
        }
        source = cause.source();
    }

    TransportErrorKind::Other
}

fn is_closed_message(text: &str) -> bool {
    text.contains("connection closed before message completed")
        || text.contains("connection reset")
}

fn classify_io(err: &std::io::Error) -> Option<TransportErrorKind> {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => Some(TransportErrorKind::Reset),
        ErrorKind::ConnectionRefused | ErrorKind::NotConnected => {
            Some(TransportErrorKind::Connect)
        }
        ErrorKind::TimedOut => Some(TransportErrorKind::Timeout),
        _ => None,
    }
}
