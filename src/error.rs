use serde::Serialize;
use std::time::Duration;

/// Low-level transport failure reported by the HTTP client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    ConnectionReset,
    ConnectionRefused,
    ConnectionAborted,
    HostUnreachable,
    NetworkTimeout,
}

impl TransportErrorKind {
    /// Conventional socket error code, used in log fields and messages.
    pub fn code(&self) -> &'static str {
        match self {
            TransportErrorKind::ConnectionReset => "ECONNRESET",
            TransportErrorKind::ConnectionRefused => "ECONNREFUSED",
            TransportErrorKind::ConnectionAborted => "ECONNABORTED",
            TransportErrorKind::HostUnreachable => "ENOTFOUND",
            TransportErrorKind::NetworkTimeout => "ETIMEDOUT",
        }
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Coarse failure class every [`AppError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network resets, server-side unavailability. Safe to retry.
    Transient,
    /// The request itself is wrong; retrying cannot help.
    ClientFault,
    /// A local budget (queue, memory) rejected the work before any I/O.
    ResourceExhaustion,
    /// A local scheduling deadline expired.
    Timeout,
    Internal,
}

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request queue is full (max {max_queue_size} waiting requests)")]
    QueueFull { max_queue_size: usize },

    #[error("File size exceeds limit: {actual} bytes (max: {limit} bytes)")]
    FileSizeExceeded { actual: u64, limit: u64 },

    #[error(
        "Memory limit exceeded: requested {requested} bytes with {allocated} bytes allocated (max: {limit} bytes)"
    )]
    MemoryLimitExceeded {
        requested: u64,
        allocated: u64,
        limit: u64,
    },

    #[error("Allocation already active for operation: {operation_id}")]
    DuplicateAllocation { operation_id: String },

    #[error("Request timeout after {timeout:?}")]
    RequestTimeout { timeout: Duration },

    #[error("Health check '{name}' timed out after {timeout:?}")]
    HealthCheckTimeout { name: String, timeout: Duration },

    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Connection pool has been shut down")]
    PoolClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl AppError {
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        AppError::Transport {
            kind,
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        AppError::Http {
            status,
            message: message.into(),
        }
    }

    /// Explicit HTTP status carried by the error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AppError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            AppError::Transport { .. } | AppError::ServiceUnavailable(_) => {
                ErrorCategory::Transient
            }
            AppError::Http { status, .. } if *status >= 500 => ErrorCategory::Transient,
            AppError::Http { .. }
            | AppError::AuthError(_)
            | AppError::ValidationError(_)
            | AppError::Forbidden(_)
            | AppError::NotFound(_)
            | AppError::DuplicateAllocation { .. } => ErrorCategory::ClientFault,
            AppError::QueueFull { .. }
            | AppError::FileSizeExceeded { .. }
            | AppError::MemoryLimitExceeded { .. } => ErrorCategory::ResourceExhaustion,
            AppError::RequestTimeout { .. } | AppError::HealthCheckTimeout { .. } => {
                ErrorCategory::Timeout
            }
            AppError::HealthCheckFailed(_)
            | AppError::PoolClosed
            | AppError::ConfigError(_)
            | AppError::InternalServerError(_) => ErrorCategory::Internal,
        }
    }

    /// Only transient failures are retried; anything unclassified is not.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
                Some(TransportErrorKind::ConnectionReset)
            }
            ErrorKind::ConnectionRefused => Some(TransportErrorKind::ConnectionRefused),
            ErrorKind::ConnectionAborted => Some(TransportErrorKind::ConnectionAborted),
            ErrorKind::TimedOut => Some(TransportErrorKind::NetworkTimeout),
            ErrorKind::NotConnected | ErrorKind::AddrNotAvailable => {
                Some(TransportErrorKind::HostUnreachable)
            }
            _ => None,
        };

        match kind {
            Some(kind) => AppError::transport(kind, err.to_string()),
            None => AppError::InternalServerError(format!("IO error: {}", err)),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return AppError::http(status.as_u16(), err.to_string());
        }
        if err.is_timeout() {
            return AppError::transport(TransportErrorKind::NetworkTimeout, err.to_string());
        }
        if err.is_connect() {
            return AppError::transport(TransportErrorKind::ConnectionRefused, err.to_string());
        }
        if err.is_request() || err.is_body() {
            return AppError::transport(TransportErrorKind::ConnectionReset, err.to_string());
        }
        AppError::InternalServerError(format!("HTTP client error: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InternalServerError(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::ConfigError(format!("YAML error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
