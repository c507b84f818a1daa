use std::time::Duration;
use std::{fmt, io};

use crate::error::server::ServerErrorInfo;

/// Crate-wide `Result` type using [`MongoWireError`] as the error.
///
/// This alias is re-exported by the parent `error` module and is intended
/// to be used throughout the crate for fallible operations.
pub type Result<T> = std::result::Result<T, MongoWireError>;

/// Top-level error type for mongowire operations.
///
/// The variants follow the recovery contract of the client:
/// - `Timeout` is recoverable, the connection stays usable
/// - `Io` and `Protocol` leave the connection broken
/// - everything else is reported by the server or by the caller's input
#[derive(Debug)]
pub enum MongoWireError {
    /// A client-side deadline elapsed on a blocking read.
    Timeout(TimeoutError),

    /// Socket-level failure.
    Io(io::Error),

    /// Malformed or unexpected bytes on the wire.
    Protocol(ProtocolError),

    /// Connection-related errors.
    Connection(ConnectionError),

    /// Query, command and cursor errors.
    Execution(ExecutionError),

    /// Configuration errors.
    Config(ConfigError),

    /// Generic error with a free-form message.
    Generic(String),
}

/// A deadline elapsed before a complete reply arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutError {
    /// The deadline that was configured for the read.
    pub after: Duration,

    /// Request whose reply was abandoned, if a request was in flight.
    pub request_id: Option<i32>,
}

/// Wire-level decoding failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Fewer bytes than a field or frame requires.
    Truncated { needed: usize, available: usize },

    /// `messageLength` smaller than a header or otherwise impossible.
    InvalidLength(i32),

    /// `messageLength` larger than the configured maximum.
    MessageTooLarge { length: usize, max: usize },

    /// Opcode not expected at this point.
    UnexpectedOpCode(i32),

    /// A reply answered a request nobody is waiting for.
    UnexpectedResponse { expected: i32, found: i32 },

    /// `numberReturned` does not match the documents in the body.
    DocumentCountMismatch { declared: i32, found: usize },

    /// Bytes left over after the last field of a message.
    TrailingBytes(usize),

    /// A BSON document or cstring could not be decoded.
    InvalidDocument(String),
}

/// Connection-specific errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Failed to establish a connection.
    ConnectionFailed(String),

    /// Connect attempt exceeded its timeout.
    Timeout,

    /// Invalid connection URI.
    InvalidUri(String),

    /// The connection saw an I/O or protocol failure and must be reopened.
    Broken(String),

    /// Reconnect is not possible for this transport.
    ReconnectUnsupported,
}

/// Execution-specific errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionError {
    /// Query reply carried the QueryFailure flag.
    QueryFailed(ServerErrorInfo),

    /// Command answered with `ok: 0`.
    CommandFailed(ServerErrorInfo),

    /// Acknowledged write reported an error.
    WriteFailed(ServerErrorInfo),

    /// The server no longer knows the cursor id.
    CursorNotFound(i64),

    /// The cursor was opened on a connection that has since been reopened.
    CursorInvalidated,

    /// Invalid operation parameters.
    InvalidParameters(String),

    /// A GridFS file is missing, duplicated or has damaged chunks.
    GridFs(String),
}

/// Configuration-specific errors.
#[derive(Debug)]
pub enum ConfigError {
    /// Config file not found.
    FileNotFound(String),

    /// Invalid config format.
    InvalidFormat(String),

    /// Invalid field value.
    InvalidValue { field: String, value: String },
}

impl MongoWireError {
    /// True when the error is a client-side timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MongoWireError::Timeout(_))
    }

    /// True when the error leaves the connection unusable until reconnect.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            MongoWireError::Io(_)
                | MongoWireError::Protocol(_)
                | MongoWireError::Connection(ConnectionError::Broken(_))
        )
    }
}

/* ========================= Display & Error impls ========================= */

impl fmt::Display for MongoWireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MongoWireError::Timeout(e) => write!(f, "{e}"),
            MongoWireError::Io(e) => write!(f, "I/O error: {e}"),
            MongoWireError::Protocol(e) => write!(f, "Protocol error: {e}"),
            MongoWireError::Connection(e) => write!(f, "Connection error: {e}"),
            MongoWireError::Execution(e) => write!(f, "Execution error: {e}"),
            MongoWireError::Config(e) => write!(f, "Configuration error: {e}"),
            MongoWireError::Generic(msg) => write!(f, "{msg}"),
        }
    }
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.request_id {
            Some(id) => write!(
                f,
                "Read timed out after {}ms (request {id})",
                self.after.as_millis()
            ),
            None => write!(f, "Read timed out after {}ms", self.after.as_millis()),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Truncated { needed, available } => {
                write!(f, "Truncated message: needed {needed} bytes, {available} available")
            }
            ProtocolError::InvalidLength(len) => write!(f, "Invalid message length: {len}"),
            ProtocolError::MessageTooLarge { length, max } => {
                write!(f, "Message too large: {length} bytes (max {max} bytes)")
            }
            ProtocolError::UnexpectedOpCode(op) => write!(f, "Unexpected opcode: {op}"),
            ProtocolError::UnexpectedResponse { expected, found } => {
                write!(f, "Reply to request {found} while waiting for request {expected}")
            }
            ProtocolError::DocumentCountMismatch { declared, found } => {
                write!(f, "Reply declared {declared} documents, found {found}")
            }
            ProtocolError::TrailingBytes(n) => write!(f, "{n} trailing bytes after message"),
            ProtocolError::InvalidDocument(msg) => write!(f, "Invalid document: {msg}"),
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::ConnectionFailed(msg) => write!(f, "Failed to connect: {msg}"),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::InvalidUri(uri) => write!(f, "Invalid connection URI: {uri}"),
            ConnectionError::Broken(reason) => {
                write!(f, "Connection is unusable and must be reopened: {reason}")
            }
            ConnectionError::ReconnectUnsupported => {
                write!(f, "Reconnect is not supported for this transport")
            }
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::QueryFailed(info) => write!(f, "Query failed: {info}"),
            ExecutionError::CommandFailed(info) => write!(f, "Command failed: {info}"),
            ExecutionError::WriteFailed(info) => write!(f, "Write failed: {info}"),
            ExecutionError::CursorNotFound(id) => write!(f, "Cursor {id} not found on server"),
            ExecutionError::CursorInvalidated => {
                write!(f, "Cursor belongs to a connection that has been reopened")
            }
            ExecutionError::InvalidParameters(msg) => write!(f, "Invalid parameters: {msg}"),
            ExecutionError::GridFs(msg) => write!(f, "GridFS error: {msg}"),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {path}"),
            ConfigError::InvalidFormat(msg) => write!(f, "Invalid config format: {msg}"),
            ConfigError::InvalidValue { field, value } => {
                write!(f, "Invalid value '{value}' for field '{field}'")
            }
        }
    }
}

impl std::error::Error for MongoWireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MongoWireError::Io(e) => Some(e),
            _ => None,
        }
    }
}
impl std::error::Error for TimeoutError {}
impl std::error::Error for ProtocolError {}
impl std::error::Error for ConnectionError {}
impl std::error::Error for ExecutionError {}
impl std::error::Error for ConfigError {}

/* ========================= Conversions to MongoWireError ========================= */

impl From<io::Error> for MongoWireError {
    fn from(err: io::Error) -> Self {
        MongoWireError::Io(err)
    }
}

impl From<TimeoutError> for MongoWireError {
    fn from(err: TimeoutError) -> Self {
        MongoWireError::Timeout(err)
    }
}

impl From<ProtocolError> for MongoWireError {
    fn from(err: ProtocolError) -> Self {
        MongoWireError::Protocol(err)
    }
}

impl From<ConnectionError> for MongoWireError {
    fn from(err: ConnectionError) -> Self {
        MongoWireError::Connection(err)
    }
}

impl From<ExecutionError> for MongoWireError {
    fn from(err: ExecutionError) -> Self {
        MongoWireError::Execution(err)
    }
}

impl From<ConfigError> for MongoWireError {
    fn from(err: ConfigError) -> Self {
        MongoWireError::Config(err)
    }
}

impl From<bson::ser::Error> for MongoWireError {
    fn from(err: bson::ser::Error) -> Self {
        MongoWireError::Protocol(ProtocolError::InvalidDocument(err.to_string()))
    }
}

impl From<bson::de::Error> for MongoWireError {
    fn from(err: bson::de::Error) -> Self {
        MongoWireError::Protocol(ProtocolError::InvalidDocument(err.to_string()))
    }
}

impl From<String> for MongoWireError {
    fn from(msg: String) -> Self {
        MongoWireError::Generic(msg)
    }
}

impl From<&str> for MongoWireError {
    fn from(msg: &str) -> Self {
        MongoWireError::Generic(msg.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_not_fatal() {
        let err: MongoWireError = TimeoutError {
            after: Duration::from_millis(500),
            request_id: Some(7),
        }
        .into();
        assert!(err.is_timeout());
        assert!(!err.is_connection_fatal());
        assert_eq!(err.to_string(), "Read timed out after 500ms (request 7)");
    }

    #[test]
    fn test_io_and_protocol_are_fatal() {
        let io: MongoWireError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        let proto: MongoWireError = ProtocolError::InvalidLength(3).into();
        assert!(io.is_connection_fatal());
        assert!(proto.is_connection_fatal());
        assert!(!proto.is_timeout());
    }

    #[test]
    fn test_broken_connection_is_fatal() {
        let err: MongoWireError = ConnectionError::Broken("reset".to_string()).into();
        assert!(err.is_connection_fatal());
        assert!(err.to_string().contains("reset"));
    }
}
