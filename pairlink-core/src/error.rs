//! Error types surfaced through callbacks and to the host.

/// Failure of a send or request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// Platform reports the link capability as unsupported. The host must stop.
    #[error("link not supported on this device")]
    Unsupported,
    #[error("peer not reachable")]
    NotReachable,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("request timed out")]
    Timeout,
    #[error("link deactivated")]
    Deactivated,
}

/// Reply payload did not have the shape the request requires.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("reply is missing field `{0}`")]
    MissingField(&'static str),
    #[error("reply field `{field}` has type {found}, expected {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },
}

/// Outcome of a log pull that did not produce a file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogPullError {
    #[error("no log bundle arrived before the deadline")]
    Timeout,
    #[error("peer could not produce a log bundle")]
    Unavailable,
    #[error("replaced by a newer log pull")]
    Superseded,
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("link deactivated")]
    Deactivated,
}
