//! Error types for the PostgreSQL client.
//!
//! Every failure the driver can produce is a [`PgError`]. The enum is
//! `Clone` so that a fatal transport failure can be delivered to every
//! request still queued on the connection that died.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
#[derive(Error, Debug, Clone)]
pub enum PgError {
    /// I/O error on the transport.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Malformed frame or invalid payload for a known message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Bad credentials, unsupported mechanism or SCRAM verification failure.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The server answered with an ErrorResponse.
    #[error("{0}")]
    Server(DbError),

    /// Transport refused, reset, or TLS negotiation failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connection is closed or was never usable.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Type conversion error.
    #[error("Type error: {0}")]
    Type(String),

    /// A connect or acquire deadline elapsed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Acquire attempted after or during `PgPool::end`.
    #[error("Cannot use a pool after calling end on the pool")]
    PoolShutdown,

    /// The caller used the API in a way the protocol cannot honour.
    #[error("Usage error: {0}")]
    Usage(String),
}

impl PgError {
    /// Whether this error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PgError::Io(_) | PgError::Protocol(_) | PgError::Connection(_) | PgError::ConnectionClosed
        )
    }

    /// The SQLSTATE code, for errors reported by the server.
    pub fn code(&self) -> Option<&str> {
        match self {
            PgError::Server(db) => Some(&db.code),
            _ => None,
        }
    }

    /// The server-side error, if this is one.
    pub fn as_db_error(&self) -> Option<&DbError> {
        match self {
            PgError::Server(db) => Some(db),
            _ => None,
        }
    }
}

impl From<io::Error> for PgError {
    fn from(e: io::Error) -> Self {
        PgError::Io(Arc::new(e))
    }
}

/// Fields of an ErrorResponse or NoticeResponse.
///
/// Field codes follow the protocol's "Error and Notice Message Fields".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<String>,
    pub internal_position: Option<String>,
    pub internal_query: Option<String>,
    pub where_: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub data_type: Option<String>,
    pub constraint: Option<String>,
    pub file: Option<String>,
    pub line: Option<String>,
    pub routine: Option<String>,
}

impl DbError {
    /// Build from the raw field map of an ErrorResponse/NoticeResponse.
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        let get = |code: u8| fields.get(&code).cloned();
        Self {
            // 'V' is the non-localized severity; prefer it when present
            severity: get(b'V').or_else(|| get(b'S')).unwrap_or_default(),
            code: get(b'C').unwrap_or_default(),
            message: get(b'M').unwrap_or_default(),
            detail: get(b'D'),
            hint: get(b'H'),
            position: get(b'P'),
            internal_position: get(b'p'),
            internal_query: get(b'q'),
            where_: get(b'W'),
            schema: get(b's'),
            table: get(b't'),
            column: get(b'c'),
            data_type: get(b'd'),
            constraint: get(b'n'),
            file: get(b'F'),
            line: get(b'L'),
            routine: get(b'R'),
        }
    }

    /// SQLSTATE class 28: invalid authorization specification.
    pub fn is_auth_failure(&self) -> bool {
        self.code.starts_with("28")
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}

/// Convert the fields of an ErrorResponse into a [`PgError`].
pub(crate) fn error_from_fields(fields: &HashMap<u8, String>) -> PgError {
    PgError::Server(DbError::from_fields(fields))
}
