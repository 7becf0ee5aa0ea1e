//! Error types shared by the protocol clients, controller and supervisor.
//!
//! Every failure in this crate degrades to one of a few kinds: the caller
//! asked for something the current state does not allow, a server message
//! could not be parsed, the transport failed, or the controller lock was
//! contended for too long. None of them are fatal to the process.

/// Crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The client is not connected to its server.
    #[error("not connected")]
    NotConnected,

    /// A precondition for the operation is not met (e.g. no acknowledged
    /// acquisition for the throttle).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A caller-supplied argument is out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A server message could not be parsed.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Connect, send or receive failed at the transport layer.
    #[error("transport error: {0}")]
    Transport(String),

    /// A transport operation did not complete in time.
    #[error("timeout")]
    Timeout,

    /// The controller state lock could not be taken within its deadline.
    #[error("controller lock timed out")]
    LockTimeout,

    /// Configuration could not be loaded or stored.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true for errors that mean the caller's request was refused
    /// rather than that something broke.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Error::NotConnected | Error::InvalidState(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::NotConnected.to_string(), "not connected");
        assert_eq!(
            Error::InvalidState("throttle 2 has no locomotive".into()).to_string(),
            "invalid state: throttle 2 has no locomotive"
        );
        assert_eq!(Error::LockTimeout.to_string(), "controller lock timed out");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("reset"));
    }

    #[test]
    fn test_invalid_state_classification() {
        assert!(Error::NotConnected.is_invalid_state());
        assert!(Error::InvalidState("x".into()).is_invalid_state());
        assert!(!Error::Timeout.is_invalid_state());
        assert!(!Error::Transport("refused".into()).is_invalid_state());
    }
}
