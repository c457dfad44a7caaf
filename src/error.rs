//! Error taxonomy for dataset operations.
//!
//! Every failure is local to one operation's result stream. The [`ErrorKind`]
//! classifies an error the same way on both sides of a process boundary, so a
//! worker can report a failure as `(kind, message)` and the proxy can rebuild
//! it as [`Error::Remote`] without losing the category.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A user-supplied map, sketch, or zip capability failed or panicked.
    UserFunction,
    /// Unknown handle, mismatched zip operands, malformed payload, and the like.
    Protocol,
    /// Timeouts and connection failures.
    Transport,
    /// Anything else: lost tasks, invariant violations.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::UserFunction => "user-function",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Transport => "transport",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("user function `{kind}` failed: {source:#}")]
    UserFunction {
        kind: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("unknown dataset handle {handle}")]
    UnknownHandle { handle: i64 },

    #[error("zip command invalid for proxies across different servers | left: {left}, right: {right}")]
    ZipEndpointMismatch { left: String, right: String },

    #[error("different sizes for composite datasets: {left} vs. {right}")]
    ZipSizeMismatch { left: usize, right: usize },

    #[error("unexpected operand in zip: {left} with {right}")]
    ZipShapeMismatch {
        left: &'static str,
        right: &'static str,
    },

    #[error("dataset type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: String,
        found: &'static str,
    },

    #[error("no {method} operation registered under `{kind}`")]
    UnknownOperation { method: String, kind: String },

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("call to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    #[error("transport failure talking to {endpoint}: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{endpoint} reported a {kind} error: {message}")]
    Remote {
        endpoint: String,
        kind: ErrorKind,
        message: String,
    },

    #[error("compute task for `{0}` ended without producing a result")]
    TaskLost(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Wrap a failure of a user capability.
    pub fn user(kind: impl Into<String>, source: anyhow::Error) -> Self {
        Error::UserFunction {
            kind: kind.into(),
            source,
        }
    }

    /// Category of this error; remote errors keep the category the worker saw.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UserFunction { .. } => ErrorKind::UserFunction,
            Error::UnknownHandle { .. }
            | Error::ZipEndpointMismatch { .. }
            | Error::ZipSizeMismatch { .. }
            | Error::ZipShapeMismatch { .. }
            | Error::TypeMismatch { .. }
            | Error::UnknownOperation { .. }
            | Error::Malformed(_)
            | Error::Protocol(_) => ErrorKind::Protocol,
            Error::Timeout { .. } | Error::Transport { .. } => ErrorKind::Transport,
            Error::Remote { kind, .. } => *kind,
            Error::TaskLost(_) | Error::Config(_) => ErrorKind::Internal,
        }
    }
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Error::Malformed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(Error::UnknownHandle { handle: 7 }.kind(), ErrorKind::Protocol);
        assert_eq!(
            Error::ZipSizeMismatch { left: 2, right: 3 }.kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            Error::user("inc", anyhow::anyhow!("boom")).kind(),
            ErrorKind::UserFunction
        );
        let remote = Error::Remote {
            endpoint: "10.0.0.1:3569".into(),
            kind: ErrorKind::UserFunction,
            message: "boom".into(),
        };
        assert_eq!(remote.kind(), ErrorKind::UserFunction);
    }

    #[test]
    fn every_kind_has_a_wire_name() {
        let names: Vec<String> = [
            ErrorKind::UserFunction,
            ErrorKind::Protocol,
            ErrorKind::Transport,
            ErrorKind::Internal,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(names, ["user-function", "protocol", "transport", "internal"]);
    }

    #[test]
    fn zip_size_message_names_both_sizes() {
        let msg = Error::ZipSizeMismatch { left: 2, right: 3 }.to_string();
        assert!(msg.contains("2 vs. 3"), "{msg}");
    }
}
