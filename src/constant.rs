use postgres_protocol::Oid;

/// Default PostgreSQL port
pub const DEFAULT_PORT: u16 = 5432;

/// OID reported for rows of tables created without OIDs
pub const INVALID_OID: Oid = 0;

/// Server reply to an SSLRequest when it is willing to negotiate TLS
pub const SSL_ACCEPTED: u8 = b'S';

/// Server reply to an SSLRequest when TLS is unavailable
pub const SSL_REFUSED: u8 = b'N';

/// SQLSTATE codes this crate reacts to
pub mod sqlstate {
    /// `invalid_sql_statement_name`: the prepared statement no longer exists
    pub const INVALID_SQL_STATEMENT_NAME: &str = "26000";
    /// `in_failed_sql_transaction`
    pub const IN_FAILED_SQL_TRANSACTION: &str = "25P02";
}

/// Transaction status reported by ReadyForQuery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    #[default]
    Idle,
    InTransaction,
    Failed,
}

impl TransactionStatus {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'I' => Some(Self::Idle),
            b'T' => Some(Self::InTransaction),
            b'E' => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn in_transaction(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// Client-side transaction bracket state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    #[default]
    Idle,
    Open,
    Committing,
}

/// Lifecycle of the connection owned by a [`Session`](crate::sync::Session)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}
