//! Error types for the anneal operator
//!
//! Errors are classified by how the tick loop and operators react to them:
//!
//! - [`Error::Cancelled`] propagates verbatim; the tick loop unwinds and
//!   the running operator is discarded.
//! - [`Error::Transport`] and [`Error::Remote`] surface communication and
//!   remote-command failures; inside the etcd sync wait they are absorbed
//!   into the retry budget, everywhere else they terminate the operator.
//! - [`Error::Precondition`] marks a condition a commander cannot repair
//!   (no SSH key for a node, a member without peer URLs).
//! - [`Error::SyncTimeout`] means the etcd health wait exhausted its
//!   attempts; the next tick observes status again.
//! - [`Error::Fatal`] marks malformed inputs that retrying cannot fix,
//!   such as an unparsable peer URL.
//!
//! Operators abort on the first error. The tick loop logs the failed
//! commander's descriptor and continues to the next tick after a back-off;
//! state convergence is the recovery mechanism, not retries.

use thiserror::Error;

/// Main error type for anneal operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The surrounding context was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// SSH/HTTP/gRPC communication failure
    #[error("transport error: {0}")]
    Transport(String),

    /// A remote command ran but exited with failure
    #[error("remote command failed on {target}: {command}: {detail}")]
    Remote {
        /// Node address the command ran on
        target: String,
        /// The command line that failed
        command: String,
        /// Trailing stderr of the failed command
        detail: String,
    },

    /// A precondition the commander cannot repair is violated
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The etcd cluster did not report enough healthy endpoints in time
    #[error("etcd sync timeout")]
    SyncTimeout,

    /// Malformed input that cannot be retried
    #[error("fatal: {0}")]
    Fatal(String),

    /// Local I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// etcd client error
    #[error("etcd client error: {0}")]
    Etcd(#[from] etcd_client::Error),

    /// HTTP client error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Certificate generation error
    #[error("certificate error: {0}")]
    Pki(#[from] rcgen::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a transport error with the given message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a precondition error with the given message
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create a fatal error with the given message
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True if this error is a cancellation.
    ///
    /// Fan-out aggregation uses this to prefer a real failure over the
    /// cancellations it induced in sibling tasks.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
