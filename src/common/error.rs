//! Error types for usermesh

use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Coordination Errors ===
    #[error("Coordination service unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Lease {0} not found or expired")]
    LeaseNotFound(i64),

    #[error("Service {0} is already registered by this registry")]
    AlreadyRegistered(String),

    #[error("Watch stream closed: {0}")]
    WatchClosed(String),

    // === Discovery Errors ===
    #[error("No available instance for service {0}")]
    NoAvailableInstance(String),

    #[error("Invalid instance address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    // === Cache / Store Errors ===
    #[error("Cache store error: {0}")]
    CacheStore(String),

    #[error("Backing store error: {0}")]
    BackingStore(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// One failure delivered to every waiter of a coalescing group
    #[error("{0}")]
    Shared(Arc<Error>),

    // === Network Errors ===
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Shared(inner) => inner.is_retryable(),
            _ => matches!(
                self,
                Error::Timeout(_)
                    | Error::CoordinationUnavailable(_)
                    | Error::WatchClosed(_)
                    | Error::NoAvailableInstance(_)
                    | Error::CacheStore(_)
                    | Error::Redis(_)
                    | Error::Transport(_)
            ),
        }
    }

    /// Unwraps coalescing wrappers down to the originating error
    pub fn root(&self) -> &Error {
        match self {
            Error::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// Convert to gRPC status for RPC responses
    pub fn to_grpc_status(&self) -> tonic::Status {
        use tonic::Code;
        match self.root() {
            Error::NotFound(_) => tonic::Status::new(Code::NotFound, self.to_string()),
            Error::Conflict(_) => tonic::Status::new(Code::AlreadyExists, self.to_string()),
            Error::InvalidConfig(_) | Error::InvalidRequest(_) => {
                tonic::Status::new(Code::InvalidArgument, self.to_string())
            }
            Error::Timeout(_) => tonic::Status::new(Code::DeadlineExceeded, self.to_string()),
            Error::NoAvailableInstance(_) | Error::CoordinationUnavailable(_) => {
                tonic::Status::new(Code::Unavailable, self.to_string())
            }
            _ => tonic::Status::new(Code::Internal, self.to_string()),
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self.root() {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::InvalidRequest(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::NoAvailableInstance(_) | Error::CoordinationUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Error::CoordinationUnavailable(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
