use thiserror::Error;

/// Error reported by a native client library call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct NativeError {
    /// Numeric error code from the native library (0 when it has none).
    pub code: u32,
    /// SQLSTATE, when the server supplied one.
    pub sqlstate: Option<String>,
    pub message: String,
}

impl NativeError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            sqlstate: None,
            message: message.into(),
        }
    }

    pub fn with_sqlstate(mut self, sqlstate: impl Into<String>) -> Self {
        self.sqlstate = Some(sqlstate.into());
        self
    }
}

/// Error type for connrs operations
#[derive(Debug, Clone, Error)]
pub enum ConnRsError {
    #[error("Cannot create native handle: {0}")]
    HandleAllocation(String),

    #[error("Connection failed: {0}")]
    Connect(NativeError),

    #[error("Session configuration failed: {0}")]
    Configuration(NativeError),

    #[error("Query failed: {0}")]
    Query(NativeError),

    #[error("Result could not be stored: {0}")]
    ResultShape(NativeError),

    #[error("Not connected")]
    NotConnected,

    #[error("Transaction lost: the session that opened it has ended")]
    TransactionLost,

    #[error("Expected {expected} row(s), got {actual}")]
    UnexpectedRowCount { expected: usize, actual: usize },

    #[error("No current row; call next() first")]
    NoCurrentRow,

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Cannot decode column {column}: {message}")]
    Decode { column: String, message: String },

    #[error("Invalid account: {0}")]
    InvalidAccount(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl ConnRsError {
    /// Native error code carried by this error, 0 when there is none.
    pub fn code(&self) -> u32 {
        self.native().map_or(0, |e| e.code)
    }

    /// The underlying native error, if this error came from the native library.
    pub fn native(&self) -> Option<&NativeError> {
        match self {
            Self::Connect(e) | Self::Configuration(e) | Self::Query(e) | Self::ResultShape(e) => {
                Some(e)
            }
            _ => None,
        }
    }

    /// Re-tag a native failure as a session configuration failure.
    pub(crate) fn into_configuration(self) -> Self {
        match self {
            Self::Connect(e) | Self::Query(e) | Self::ResultShape(e) => Self::Configuration(e),
            other => other,
        }
    }
}

/// Result type alias for connrs operations
pub type Result<T> = std::result::Result<T, ConnRsError>;
