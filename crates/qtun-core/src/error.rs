//! Error types for qtun-core.

use thiserror::Error;

/// Main error type for qtun operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation or unexpected message.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Codec error during encoding/decoding.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// Authentication failed (missing, unknown or disabled token).
    #[error("authentication failed: {reason}")]
    Auth { reason: String },

    /// Catalog lookup or append failed.
    #[error("catalog error: {message}")]
    Catalog { message: String },

    /// Invalid forward configuration.
    #[error("invalid forward: {message}")]
    Forward { message: String },

    /// A remote port is already bound by another forward.
    #[error("port {port} already bound")]
    PortInUse { port: u16 },

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,
}

impl Error {
    /// Shorthand for a protocol error with a formatted message.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    /// Shorthand for a codec error with a formatted message.
    pub fn codec(message: impl Into<String>) -> Self {
        Error::Codec {
            message: message.into(),
        }
    }

    /// Returns true if this error is transient and a reconnect may help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Timeout | Error::ConnectionClosed | Error::Catalog { .. }
        )
    }

    /// Returns true if this error is fatal and reconnecting won't help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Auth { .. } | Error::Protocol { .. })
    }
}

/// Convenience result type for qtun operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_protocol() {
        let err = Error::protocol("unexpected first frame");
        assert_eq!(err.to_string(), "protocol error: unexpected first frame");
    }

    #[test]
    fn error_display_port_in_use() {
        let err = Error::PortInUse { port: 7001 };
        assert_eq!(err.to_string(), "port 7001 already bound");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn transient_vs_fatal() {
        assert!(Error::Timeout.is_transient());
        assert!(Error::ConnectionClosed.is_transient());
        assert!(!Error::Timeout.is_fatal());

        let auth = Error::Auth {
            reason: "unknown token".into(),
        };
        assert!(auth.is_fatal());
        assert!(!auth.is_transient());
    }
}
