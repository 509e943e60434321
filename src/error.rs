/// Unified error handling for the session manager
///
/// Every component reports failures through the closed [`Error`] enum below.
/// Callers of the dispatcher only ever observe a successful reply, a
/// [`CommandError`], a [`NetworkError`] carrying its ambiguity flag, or
/// [`Error::NoSuitableServer`]; transport exceptions never leak out raw.
use crate::core::Endpoint;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

pub use crate::config::ConfigError;

/// Main error type for session manager operations
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed connection string or option, raised at construction time
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The wait queue for an endpoint is full, or the caller asked not to wait
    #[error("Connection pool exhausted for {endpoint}")]
    PoolExhausted { endpoint: Endpoint },

    /// No connection was released within the wait window
    #[error("Timed out after {waited:?} waiting for a connection to {endpoint}")]
    PoolTimeout { endpoint: Endpoint, waited: Duration },

    /// The pool has been shut down
    #[error("Connection pool is closed")]
    PoolClosed,

    /// Transport-level failure before or after the command was sent
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Server selection found no eligible endpoint in time
    #[error("No suitable server for {preference} after {waited:?}")]
    NoSuitableServer { preference: String, waited: Duration },

    /// The server executed the command and reported failure
    #[error(transparent)]
    Command(#[from] CommandError),

    /// A cursor was asked for a document after it ran out
    #[error("Cursor has no more documents")]
    NoMoreDocuments,

    /// A document could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// What went wrong on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Connect,
    Send,
    Receive,
    Timeout,
    Protocol,
    PoolExhausted,
    PoolTimeout,
    PoolClosed,
    /// A pinned endpoint is marked down or has left the topology
    Unavailable,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkErrorKind::Connect => "connect",
            NetworkErrorKind::Send => "send",
            NetworkErrorKind::Receive => "receive",
            NetworkErrorKind::Timeout => "timeout",
            NetworkErrorKind::Protocol => "protocol",
            NetworkErrorKind::PoolExhausted => "pool exhausted",
            NetworkErrorKind::PoolTimeout => "pool timeout",
            NetworkErrorKind::PoolClosed => "pool closed",
            NetworkErrorKind::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// Transport-level failure.
///
/// `ambiguous` is true when the request reached the wire but no reply was
/// decoded, so the server-side outcome is unknown. Non-idempotent operations
/// failing this way are never retried.
#[derive(Debug, Error)]
pub struct NetworkError {
    pub endpoint: Endpoint,
    pub kind: NetworkErrorKind,
    pub ambiguous: bool,
    /// Retries consumed before giving up
    pub retries: u32,
    pub message: String,
    #[source]
    pub source: Option<io::Error>,
}

impl NetworkError {
    pub fn new<S: Into<String>>(endpoint: Endpoint, kind: NetworkErrorKind, message: S) -> Self {
        Self {
            endpoint,
            kind,
            ambiguous: false,
            retries: 0,
            message: message.into(),
            source: None,
        }
    }

    /// Classify an I/O error raised while talking to `endpoint`
    pub fn from_io(endpoint: Endpoint, kind: NetworkErrorKind, err: io::Error) -> Self {
        let kind = if err.kind() == io::ErrorKind::TimedOut {
            NetworkErrorKind::Timeout
        } else {
            kind
        };
        Self {
            endpoint,
            kind,
            ambiguous: false,
            retries: 0,
            message: err.to_string(),
            source: Some(err),
        }
    }

    pub fn ambiguous(mut self, ambiguous: bool) -> Self {
        self.ambiguous = ambiguous;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Network error ({}) talking to {}: {}",
            self.kind, self.endpoint, self.message
        )?;
        if self.ambiguous {
            write!(f, " [outcome unknown]")?;
        }
        Ok(())
    }
}

/// Failure reported by the server itself (`ok: 0`, a write error or a write
/// concern error). A normal outcome, not a defect.
#[derive(Debug, Clone, Error, PartialEq)]
pub struct CommandError {
    pub code: i32,
    pub code_name: Option<String>,
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code_name {
            Some(name) => write!(f, "Command failed with code {} ({}): {}", self.code, name, self.message),
            None => write!(f, "Command failed with code {}: {}", self.code, self.message),
        }
    }
}

impl CommandError {
    pub fn new<S: Into<String>>(code: i32, code_name: Option<String>, message: S) -> Self {
        Self {
            code,
            code_name,
            message: message.into(),
        }
    }

    /// Duplicate key on insert (11000) or on update (11001)
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self.code, 11000 | 11001)
    }
}

/// Document encoding/decoding errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Result type alias for session manager operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a network error
    pub fn network<S: Into<String>>(endpoint: Endpoint, kind: NetworkErrorKind, message: S) -> Self {
        Error::Network(NetworkError::new(endpoint, kind, message))
    }

    /// Create a command error
    pub fn command<S: Into<String>>(code: i32, message: S) -> Self {
        Error::Command(CommandError::new(code, None, message))
    }

    /// Check if a fresh attempt of the same request could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(err) => !err.ambiguous,
            Error::PoolTimeout { .. } => true,
            Error::PoolExhausted { .. } => true,
            Error::NoSuitableServer { .. } => true,
            _ => false,
        }
    }

    /// True for network errors where the server may have applied the command
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Error::Network(err) if err.ambiguous)
    }

    /// Server-reported error code, if any
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Command(err) => Some(err.code),
            _ => None,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Error::Config(_) => ErrorSeverity::Critical,
            Error::Codec(_) => ErrorSeverity::Critical,
            Error::Network(_) => ErrorSeverity::Warning,
            Error::PoolTimeout { .. } => ErrorSeverity::Warning,
            Error::PoolExhausted { .. } => ErrorSeverity::Warning,
            Error::NoSuitableServer { .. } => ErrorSeverity::Warning,
            Error::NoMoreDocuments => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about expected terminal conditions
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new("db1.example.net", 27017)
    }

    #[test]
    fn test_command_error_display() {
        let error = Error::Command(CommandError::new(
            11000,
            Some("DuplicateKey".to_string()),
            "E11000 duplicate key error",
        ));
        assert_eq!(
            error.to_string(),
            "Command failed with code 11000 (DuplicateKey): E11000 duplicate key error"
        );
        assert_eq!(error.code(), Some(11000));
    }

    #[test]
    fn test_duplicate_key_codes() {
        assert!(CommandError::new(11000, None, "dup").is_duplicate_key());
        assert!(CommandError::new(11001, None, "dup").is_duplicate_key());
        assert!(!CommandError::new(2, None, "bad value").is_duplicate_key());
    }

    #[test]
    fn test_network_error_ambiguity() {
        let sent = NetworkError::new(endpoint(), NetworkErrorKind::Receive, "reset").ambiguous(true);
        assert!(sent.to_string().contains("[outcome unknown]"));

        let error = Error::Network(sent);
        assert!(error.is_ambiguous());
        assert!(!error.is_retryable());

        let refused = Error::network(endpoint(), NetworkErrorKind::Connect, "refused");
        assert!(!refused.is_ambiguous());
        assert!(refused.is_retryable());
    }

    #[test]
    fn test_io_timeout_is_classified() {
        let err = io::Error::new(io::ErrorKind::TimedOut, "deadline");
        let network = NetworkError::from_io(endpoint(), NetworkErrorKind::Receive, err);
        assert_eq!(network.kind, NetworkErrorKind::Timeout);
        assert!(network.source.is_some());
    }

    #[test]
    fn test_error_severity() {
        let config_error = Error::Config(ConfigError::InvalidOption {
            option: "maxPoolSize".to_string(),
            message: "must be a number".to_string(),
        });
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);
        assert_eq!(Error::NoMoreDocuments.severity(), ErrorSeverity::Info);
        assert_eq!(Error::command(2, "bad").severity(), ErrorSeverity::Error);
        assert_eq!(ErrorSeverity::Warning.to_string(), "WARNING");
    }
}
