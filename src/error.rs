//! Error types for the tunnel.

use thiserror::Error;

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during tunnel operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration option
    #[error("configuration error: {0}")]
    Config(String),

    /// Raw socket or firewall unavailable (needs root)
    #[error("privilege error: {0}")]
    Privilege(String),

    /// Network I/O failure
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed packet; dropped and counted by the caller
    #[error("malformed packet: {0}")]
    Parse(String),

    /// Firewall rule operation failed
    #[error("firewall error: {0}")]
    Firewall(String),

    /// Cryptographic operation failed
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Block window advanced without enough shards to reconstruct
    #[error("FEC block incomplete: window advanced with too few shards")]
    FecIncomplete,

    /// Reed-Solomon reconstruction failed despite enough shards present
    #[error("FEC reconstruction failed")]
    FecUnrecoverable,

    /// Queue full after the deadline sweep; caller must drop or retry
    #[error("queue full: backpressure")]
    Backpressure,

    /// Operation timed out
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// Connection has been closed
    #[error("connection closed")]
    Closed,
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new privilege error
    pub fn privilege(msg: impl Into<String>) -> Self {
        Error::Privilege(msg.into())
    }

    /// Create a new parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Error::Parse(msg.into())
    }

    /// Create a new firewall error
    pub fn firewall(msg: impl Into<String>) -> Self {
        Error::Firewall(msg.into())
    }

    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Check if this error is recoverable without tearing down the session.
    ///
    /// Parse failures and FEC losses are local to one packet or block;
    /// I/O errors are retried with backoff before the connection is closed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Parse(_)
                | Error::FecIncomplete
                | Error::FecUnrecoverable
                | Error::Backpressure
                | Error::Timeout(_)
        )
    }

    /// Process exit code for a fatal error.
    ///
    /// 1 = config error, 2 = privilege error, 3 = I/O failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 1,
            Error::Privilege(_) => 2,
            _ => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Backpressure;
        assert_eq!(err.to_string(), "queue full: backpressure");

        let err = Error::Timeout(5000);
        assert_eq!(err.to_string(), "timeout after 5000ms");
    }

    #[test]
    fn test_error_recoverable() {
        assert!(Error::FecIncomplete.is_recoverable());
        assert!(Error::Backpressure.is_recoverable());
        assert!(Error::parse("truncated").is_recoverable());
        assert!(!Error::config("bad key").is_recoverable());
        assert!(!Error::privilege("no raw socket").is_recoverable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::config("x").exit_code(), 1);
        assert_eq!(Error::privilege("x").exit_code(), 2);
        assert_eq!(
            Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "tx")).exit_code(),
            3
        );
    }
}
