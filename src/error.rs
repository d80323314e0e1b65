//! Unified error handling for the ESL client.
//!
//! Mirrors the single-enum, `thiserror`-derived approach the teacher
//! workspace uses for its application-wide `AppError` (see
//! `apolo-core::error::AppError`), scoped down to the error kinds spec.md
//! §7 actually names for this protocol. Unlike `AppError` this enum has no
//! HTTP mapping — this is a transport-level library, not a web service.

use thiserror::Error;

/// The reason an inbound connection attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFailureReason {
    /// No `auth/request` arrived within the connect timeout.
    Timeout,
    /// FreeSWITCH rejected the `auth <password>` command.
    InvalidPassword,
    /// The TCP connection itself could not be established or failed before
    /// authentication completed.
    TransportError,
}

/// Errors surfaced by this crate.
#[derive(Debug, Error)]
pub enum EslError {
    /// No reply arrived within the configured response timeout. The
    /// connection is unaffected; later commands may still succeed.
    #[error("command timed out waiting for a reply")]
    Timeout,

    /// The connection was disposed, or the peer disconnected, before a
    /// reply arrived.
    #[error("operation cancelled: connection disposed or disconnected")]
    Cancelled,

    /// `InboundSocket::connect` failed.
    #[error("inbound connection to {endpoint} failed: {message}")]
    InboundConnectionFailed {
        reason: InboundFailureReason,
        message: String,
        endpoint: String,
    },

    /// The message receiver (framer or transport) hit an unrecoverable
    /// error. The connection is disposed and the event stream has
    /// completed with this error.
    #[error("message receiver failed: {0}")]
    MessageReceiverFatal(String),

    /// A message was malformed beyond what the framer can recover from
    /// (e.g. a non-numeric `Content-Length`). Always escalates to
    /// `MessageReceiverFatal` for the connection as a whole.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A `send_*` call was made on a connection that was never connected.
    #[error("not connected")]
    NotConnected,

    /// A `send_*` call was made on a connection that has already been
    /// disposed.
    #[error("connection disposed")]
    Disposed,

    /// Low-level I/O failure from the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EslError {
    /// True for errors that leave the connection itself usable.
    pub fn is_transaction_local(&self) -> bool {
        matches!(self, EslError::Timeout)
    }

    /// True for errors that mean the connection has terminated.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EslError::Cancelled
                | EslError::MessageReceiverFatal(_)
                | EslError::ProtocolViolation(_)
                | EslError::Disposed
        )
    }
}

pub type Result<T> = std::result::Result<T, EslError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_transaction_local_not_terminal() {
        assert!(EslError::Timeout.is_transaction_local());
        assert!(!EslError::Timeout.is_terminal());
    }

    #[test]
    fn cancelled_is_terminal() {
        assert!(EslError::Cancelled.is_terminal());
        assert!(!EslError::Cancelled.is_transaction_local());
    }

    #[test]
    fn display_includes_endpoint_and_message() {
        let err = EslError::InboundConnectionFailed {
            reason: InboundFailureReason::InvalidPassword,
            message: "Invalid Password".to_string(),
            endpoint: "127.0.0.1:8021".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("127.0.0.1:8021"));
        assert!(text.contains("Invalid Password"));
    }
}
