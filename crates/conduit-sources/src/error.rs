//! Error types for event source adapters.

use thiserror::Error;

/// Result alias for source operations.
pub type Result<T> = std::result::Result<T, SourceError>;

/// Failure constructing or polling an event source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The configured table does not exist.
    #[error("table not found: {message}")]
    TableNotFound {
        /// Driver message
        message: String,
    },

    /// A configured column does not exist.
    #[error("column not found: {message}")]
    ColumnNotFound {
        /// Driver message
        message: String,
    },

    /// The credentials were rejected or lack privileges.
    #[error("access denied: {message}")]
    AccessDenied {
        /// Driver message
        message: String,
    },

    /// The backend could not be reached.
    #[error("host unreachable: {message}")]
    HostUnreachable {
        /// Transport message
        message: String,
    },

    /// The connection settings carry no username.
    #[error("connection settings are missing credentials")]
    MissingCredentials,

    /// A table or column name failed validation.
    #[error("invalid identifier '{identifier}': {reason}")]
    InvalidIdentifier {
        /// Offending identifier
        identifier: String,
        /// What was wrong
        reason: String,
    },

    /// The push queue is at capacity.
    #[error("push queue is full ({capacity} events)")]
    QueueFull {
        /// Configured capacity
        capacity: usize,
    },

    /// Required configuration is missing or malformed.
    #[error("invalid source configuration: {message}")]
    InvalidConfig {
        /// What was wrong
        message: String,
    },

    /// Any other backend failure.
    #[error("source backend error: {message}")]
    Backend {
        /// Backend message
        message: String,
    },
}

impl SourceError {
    /// Stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::TableNotFound { .. } => "SOURCE_TABLE_NOT_FOUND",
            Self::ColumnNotFound { .. } => "SOURCE_COLUMN_NOT_FOUND",
            Self::AccessDenied { .. } => "SOURCE_ACCESS_DENIED",
            Self::HostUnreachable { .. } => "SOURCE_HOST_UNREACHABLE",
            Self::MissingCredentials => "SOURCE_MISSING_CREDENTIALS",
            Self::InvalidIdentifier { .. } => "SOURCE_INVALID_IDENTIFIER",
            Self::QueueFull { .. } => "SOURCE_QUEUE_FULL",
            Self::InvalidConfig { .. } => "SOURCE_INVALID_CONFIG",
            Self::Backend { .. } => "SOURCE_BACKEND_ERROR",
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig { message: message.into() }
    }
}

impl From<sqlx::Error> for SourceError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let message = db.message().to_string();
                match db.code().as_deref() {
                    Some("42P01") => Self::TableNotFound { message },
                    Some("42703") => Self::ColumnNotFound { message },
                    Some("28P01" | "28000" | "42501") => Self::AccessDenied { message },
                    _ => Self::Backend { message },
                }
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed => Self::HostUnreachable { message: err.to_string() },
            _ => Self::Backend { message: err.to_string() },
        }
    }
}

impl From<rskafka::client::error::Error> for SourceError {
    fn from(err: rskafka::client::error::Error) -> Self {
        match &err {
            rskafka::client::error::Error::Connection(_) => {
                Self::HostUnreachable { message: err.to_string() }
            },
            _ => Self::Backend { message: err.to_string() },
        }
    }
}
