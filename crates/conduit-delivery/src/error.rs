//! Error types for delivery operations.
//!
//! [`DeliveryError`] classifies the outcome of one outbound HTTP attempt and
//! drives retry decisions. [`AuthError`] covers header construction.
//! [`DispatchError`] wraps every way a single rule target can fail before or
//! during delivery and carries the category written to dead-letter entries.

use std::{fmt, time::Duration};

use conduit_core::{models::RuleId, UrlValidationError};
use conduit_transform::TransformError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Outcome classification of a failed HTTP attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Connection, DNS, TLS or body transfer failure.
    #[error("network connection failed: {message}")]
    Network {
        /// Transport message
        message: String,
    },

    /// The request did not finish within its timeout.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout
        timeout_ms: u64,
    },

    /// 4xx other than 429.
    #[error("client error: HTTP {status_code}")]
    Client {
        /// HTTP status code
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// 5xx.
    #[error("server error: HTTP {status_code}")]
    Server {
        /// HTTP status code
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// 429, optionally with a `Retry-After` hint.
    #[error("rate limited by target")]
    RateLimited {
        /// Parsed `Retry-After`
        retry_after: Option<Duration>,
        /// Truncated response body
        body: String,
    },

    /// 1xx or 3xx left after redirects.
    #[error("unexpected status: HTTP {status_code}")]
    UnexpectedStatus {
        /// HTTP status code
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// A redirect pointed somewhere the URL policy forbids, or the chain
    /// was too long.
    #[error("redirect refused: {reason}")]
    RedirectRejected {
        /// Why the hop was refused
        reason: String,
    },

    /// The HTTP client could not be built or the request was malformed.
    #[error("invalid delivery configuration: {message}")]
    Configuration {
        /// What was wrong
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether another attempt may succeed.
    ///
    /// Network errors, timeouts, 5xx and 429 are retryable. Everything else
    /// is permanent.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Timeout { .. } | Self::Server { .. } | Self::RateLimited { .. }
        )
    }

    /// Delay requested by the target, overriding computed backoff.
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// HTTP status of the response, if one arrived.
    pub const fn status_code(&self) -> Option<u16> {
        match self {
            Self::Client { status_code, .. }
            | Self::Server { status_code, .. }
            | Self::UnexpectedStatus { status_code, .. } => Some(*status_code),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Response body, if one arrived.
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Client { body, .. }
            | Self::Server { body, .. }
            | Self::RateLimited { body, .. }
            | Self::UnexpectedStatus { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Network { .. } => "DELIVERY_NETWORK_ERROR",
            Self::Timeout { .. } => "DELIVERY_TIMEOUT",
            Self::Client { .. } => "DELIVERY_CLIENT_ERROR",
            Self::Server { .. } => "DELIVERY_SERVER_ERROR",
            Self::RateLimited { .. } => "DELIVERY_RATE_LIMITED",
            Self::UnexpectedStatus { .. } => "DELIVERY_UNEXPECTED_STATUS",
            Self::RedirectRejected { .. } => "DELIVERY_REDIRECT_REJECTED",
            Self::Configuration { .. } => "DELIVERY_CONFIGURATION_ERROR",
        }
    }
}

/// Failure building authentication headers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// A required config field is absent or empty.
    #[error("auth config is missing required field '{field}'")]
    MissingField {
        /// Field name
        field: String,
    },

    /// A custom header value is null.
    #[error("custom header '{header}' has a null value")]
    NullHeaderValue {
        /// Header name
        header: String,
    },

    /// The token endpoint could not be reached.
    #[error("token endpoint unreachable: {message}")]
    TokenEndpointUnreachable {
        /// Transport message
        message: String,
    },

    /// The token endpoint answered with a non-2xx status.
    #[error("token request failed with HTTP {status_code}")]
    TokenRequestFailed {
        /// HTTP status code
        status_code: u16,
    },

    /// The token response body is not JSON.
    #[error("token response is not JSON: {message}")]
    TokenResponseNotJson {
        /// Parser message
        message: String,
    },

    /// The configured response path does not resolve to a token.
    #[error("token response has no value at '{path}'")]
    TokenPathUnresolved {
        /// Configured path
        path: String,
    },

    /// The auth type is not known.
    #[error("unsupported auth type '{auth_type}'")]
    UnsupportedType {
        /// Configured type
        auth_type: String,
    },

    /// A header name or value cannot be sent.
    #[error("invalid header '{header}'")]
    InvalidHeader {
        /// Header name
        header: String,
    },
}

impl AuthError {
    /// Stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingField { .. } => "AUTH_MISSING_FIELD",
            Self::NullHeaderValue { .. } => "AUTH_NULL_HEADER_VALUE",
            Self::TokenEndpointUnreachable { .. } => "AUTH_TOKEN_ENDPOINT_UNREACHABLE",
            Self::TokenRequestFailed { .. } => "AUTH_TOKEN_REQUEST_FAILED",
            Self::TokenResponseNotJson { .. } => "AUTH_TOKEN_RESPONSE_NOT_JSON",
            Self::TokenPathUnresolved { .. } => "AUTH_TOKEN_PATH_UNRESOLVED",
            Self::UnsupportedType { .. } => "AUTH_UNSUPPORTED_TYPE",
            Self::InvalidHeader { .. } => "AUTH_INVALID_HEADER",
        }
    }

    pub(crate) fn missing(field: &str) -> Self {
        Self::MissingField { field: field.to_string() }
    }
}

/// Dead-letter error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Code lookup failed.
    Lookup,
    /// Transform or script failed.
    Transform,
    /// Auth headers could not be built.
    Auth,
    /// Target URL rejected.
    Validation,
    /// Circuit breaker open.
    Circuit,
    /// Network or timeout.
    Network,
    /// 4xx or other permanent status.
    Client,
    /// 5xx.
    Server,
    /// 429.
    RateLimit,
    /// Persistence failure.
    Storage,
    /// Anything else.
    Internal,
}

impl ErrorCategory {
    /// Text stored in `dlq_entries.error_category`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Lookup => "lookup",
            Self::Transform => "transform",
            Self::Auth => "auth",
            Self::Validation => "validation",
            Self::Circuit => "circuit",
            Self::Network => "network",
            Self::Client => "client",
            Self::Server => "server",
            Self::RateLimit => "rate_limit",
            Self::Storage => "storage",
            Self::Internal => "internal",
        }
    }
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Network { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::Client { .. } | DeliveryError::UnexpectedStatus { .. } => Self::Client,
            DeliveryError::Server { .. } => Self::Server,
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::RedirectRejected { .. } => Self::Validation,
            DeliveryError::Configuration { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why one rule target was not delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Lookup chain aborted.
    #[error("lookup failed: {0}")]
    Lookup(TransformError),

    /// Transform or script failed.
    #[error("transform failed: {0}")]
    Transform(TransformError),

    /// Auth headers could not be built.
    #[error("auth failed: {0}")]
    Auth(#[from] AuthError),

    /// Target URL rejected.
    #[error("target URL rejected: {0}")]
    Validation(#[from] UrlValidationError),

    /// Breaker is open for the rule.
    #[error("circuit breaker open for rule {rule_id}")]
    CircuitOpen {
        /// Rule whose circuit is open
        rule_id: RuleId,
    },

    /// Final HTTP attempt failed.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// Persistence failed.
    #[error("storage error: {message}")]
    Storage {
        /// Storage message
        message: String,
    },

    /// Unexpected internal failure.
    #[error("internal dispatch error: {message}")]
    Internal {
        /// What went wrong
        message: String,
    },
}

impl DispatchError {
    /// Wraps a lookup or transform failure under the right variant.
    pub fn from_transform(err: TransformError) -> Self {
        if err.is_lookup() {
            Self::Lookup(err)
        } else {
            Self::Transform(err)
        }
    }

    /// Dead-letter category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Lookup(_) => ErrorCategory::Lookup,
            Self::Transform(_) => ErrorCategory::Transform,
            Self::Auth(_) => ErrorCategory::Auth,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::CircuitOpen { .. } => ErrorCategory::Circuit,
            Self::Delivery(e) => ErrorCategory::from(e),
            Self::Storage { .. } => ErrorCategory::Storage,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Lookup(e) | Self::Transform(e) => e.code(),
            Self::Auth(e) => e.code(),
            Self::Validation(e) => e.code(),
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::Delivery(e) => e.code(),
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// HTTP status of the final response, if any.
    pub const fn response_status(&self) -> Option<u16> {
        match self {
            Self::Delivery(e) => e.status_code(),
            _ => None,
        }
    }
}

impl From<conduit_core::CoreError> for DispatchError {
    fn from(err: conduit_core::CoreError) -> Self {
        Self::Storage { message: err.to_string() }
    }
}
