//! Error taxonomy for the session engine.
//!
//! Single-command failures (non-zero exit, timeout) are returned as values
//! inside [`crate::session::CommandResult`]; only connection loss, closed
//! sessions, authentication failures, and framing violations surface as
//! errors here.

use thiserror::Error;

/// The channel never reached a usable shell.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection to {target} failed: {source}")]
    Transport {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("authentication for {target} was rejected")]
    AuthRejected { target: String },

    #[error("no secret available for {target}")]
    MissingSecret { target: String },

    #[error("shell on {target} never became ready")]
    ShellInit { target: String },
}

/// Failure of a live session or of one framed command on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The underlying channel died. The session moves to `Disconnected`
    /// and every queued request fails with this error.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The session was closed; no further commands are accepted.
    #[error("session is closed")]
    Closed,

    /// A credential prompt went unanswered, or a second prompt appeared
    /// after the secret was injected (the remote rejected it).
    #[error("authentication failed while running `{command}`")]
    AuthenticationFailed { command: String },

    /// The delimiter protocol was violated. Engine-internal invariant;
    /// closes the session.
    #[error("command framing violated: {0}")]
    Protocol(String),
}

/// A file operation did not produce its success sentinel.
#[derive(Debug, Error)]
pub enum OpError {
    #[error("{op} failed for '{path}': {message}")]
    Failed {
        op: &'static str,
        path: String,
        message: String,
    },

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl OpError {
    pub fn failed(op: &'static str, path: impl Into<String>, message: impl Into<String>) -> Self {
        OpError::Failed {
            op,
            path: path.into(),
            message: message.into(),
        }
    }
}
