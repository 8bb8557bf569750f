use thiserror::Error;

use crate::protocol::response::ServerError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Connection failed: {0}")]
    ConnectFailed(#[source] Box<Error>),

    #[error("Failed to prepare statement `{id}`: {source}")]
    PrepareFailed {
        id: String,
        #[source]
        source: ServerError,
    },

    #[error("Command has no target table")]
    MissingTable,

    #[error("Command has no statement id")]
    MissingStatementId,

    #[error("Command has no columns")]
    NoColumns,

    /// The same statement id was reused with a different column list.
    #[error(
        "Statement `{id}` is cached with {expected_params} parameters but the command binds {actual_params}"
    )]
    StatementMismatch {
        id: String,
        expected_params: usize,
        actual_params: usize,
    },

    #[error("Command failed: {0}")]
    CommandFailed(#[source] ServerError),

    #[error("{operation} did not complete after {attempts} attempts")]
    Timeout {
        operation: &'static str,
        attempts: u32,
    },

    #[error("Server Error: {0}")]
    ServerError(#[from] ServerError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(#[from] native_tls::Error),

    #[error("Bad config error: {0}")]
    BadConfigError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Unsupported authentication method: {0}")]
    UnsupportedAuth(String),

    #[error("Connection closed by server")]
    ConnectionClosed,

    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    #[error("Transaction belongs to connection {expected}, not {actual}")]
    ConnectionMismatch { expected: u64, actual: u64 },

    #[error("Transaction was rolled back by the server")]
    RolledBack,

    #[error("Malformed {path}: {reason}")]
    ProcFormat { path: String, reason: String },
}

impl Error {
    /// Whether the session can no longer be used after this error.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Self::IoError(err) => err.kind() != std::io::ErrorKind::WouldBlock,
            Self::ConnectFailed(_)
            | Self::TlsError(_)
            | Self::InvalidMessage(_)
            | Self::ConnectionClosed => true,
            Self::ServerError(err) | Self::CommandFailed(err) => err.is_fatal(),
            _ => false,
        }
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}

pub type Result<T> = std::result::Result<T, Error>;
