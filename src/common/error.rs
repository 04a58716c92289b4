//! Error types for scarab

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Counter Store Errors ===
    #[error("Counter {counter_id} storage corrupted: {reason}")]
    StorageCorruption { counter_id: String, reason: String },

    #[error("Counter not found: {0}")]
    CounterNotFound(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    // === Ownership / Consensus Errors ===
    #[error("Not leader: current owner is {owner_hint}")]
    NotLeader { owner_hint: String },

    #[error("Stale term: held {held}, committed {committed}")]
    StaleTerm { held: u64, committed: u64 },

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Consensus timeout")]
    ConsensusTimeout,

    // === Network Errors ===
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Metadata Errors ===
    #[error("RocksDB error: {0}")]
    Meta(#[from] rocksdb::Error),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// StorageCorruption scoped to a single counter.
    pub fn corruption(counter_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::StorageCorruption {
            counter_id: counter_id.into(),
            reason: reason.into(),
        }
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::ConsensusTimeout
                | Error::NotLeader { .. }
                | Error::Unavailable(_)
                | Error::ResourceExhausted(_)
        )
    }

    /// Convert to gRPC status for RPC responses
    pub fn to_grpc_status(&self) -> tonic::Status {
        use tonic::Code;
        match self {
            Error::CounterNotFound(_) => tonic::Status::new(Code::NotFound, self.to_string()),
            Error::NotLeader { owner_hint } => {
                let mut status = tonic::Status::new(Code::FailedPrecondition, self.to_string());
                if let Ok(value) = owner_hint.parse() {
                    status.metadata_mut().insert("owner-hint", value);
                }
                status
            }
            Error::StaleTerm { .. } => tonic::Status::new(Code::Aborted, self.to_string()),
            Error::InvalidConfig(_) => tonic::Status::new(Code::InvalidArgument, self.to_string()),
            Error::ResourceExhausted(_) => {
                tonic::Status::new(Code::ResourceExhausted, self.to_string())
            }
            Error::Unavailable(_) => tonic::Status::new(Code::Unavailable, self.to_string()),
            Error::ConsensusTimeout | Error::Timeout(_) => {
                tonic::Status::new(Code::DeadlineExceeded, self.to_string())
            }
            Error::Grpc(status) => status.clone(),
            _ => tonic::Status::new(Code::Internal, self.to_string()),
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::CounterNotFound(_) => StatusCode::NOT_FOUND,
            Error::NotLeader { .. } => StatusCode::TEMPORARY_REDIRECT,
            Error::StaleTerm { .. } => StatusCode::CONFLICT,
            Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) | Error::ConsensusTimeout => StatusCode::REQUEST_TIMEOUT,
            Error::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::Unavailable(_) | Error::ConnectionFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
