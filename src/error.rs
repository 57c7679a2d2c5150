//! Error types for the Multishare Operator
//!
//! Provides structured error types for the reconciler, admission logic,
//! record store and cloud client, plus the mapping of those errors onto
//! provisioning status codes.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes / Record Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Update conflict on {kind}/{name}: object has been modified")]
    Conflict { kind: String, name: String },

    #[error("Record store not synced: {0}")]
    StoreNotSynced(String),

    // =========================================================================
    // Cloud API Errors
    // =========================================================================
    #[error("Filestore connection error: {0}")]
    FilestoreConnection(#[from] reqwest::Error),

    #[error("Filestore API error ({status}): {message}")]
    FilestoreApi { status: u16, message: String },

    #[error("Operation {op_id} failed: {reason}")]
    OperationFailed { op_id: String, reason: String },

    // =========================================================================
    // Provisioning Errors
    // =========================================================================
    #[error("Operation pending: {0}")]
    Pending(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Capacity out of range: {0}")]
    OutOfRange(String),

    #[error("Volume {volume} already exists with different parameters: {reason}")]
    VolumeMismatch { volume: String, reason: String },

    #[error("An operation with the given volume key {0} already exists")]
    Aborted(String),

    #[error("Insufficient capacity: requested {requested} bytes, available {available} bytes")]
    InsufficientCapacity { requested: u64, available: u64 },

    #[error("Invalid volume ID: {0}")]
    InvalidVolumeId(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

/// Status code surfaced to provisioning callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    InvalidArgument,
    OutOfRange,
    NotFound,
    AlreadyExists,
    Aborted,
    /// Desired state recorded but not realized yet; callers retry
    Unavailable,
    ResourceExhausted,
    Internal,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::FilestoreConnection(_)
            | Error::Kube(_)
            | Error::Conflict { .. }
            | Error::StoreNotSynced(_) => ErrorAction::RequeueWithBackoff,

            // Waiting on the reconciler or a running operation
            Error::Pending(_) | Error::Aborted(_) => {
                ErrorAction::RequeueAfter(Duration::from_secs(5))
            }

            Error::InsufficientCapacity { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(60))
            }

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::InvalidArgument(_)
            | Error::OutOfRange(_)
            | Error::InvalidVolumeId(_)
            | Error::VolumeMismatch { .. } => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error only signals that work is still in flight
    pub fn is_pending(&self) -> bool {
        matches!(self, Error::Pending(_))
    }

    /// Check if this is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// Check if this error means the target object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            Error::FilestoreApi { status, .. } => *status == 404,
            _ => false,
        }
    }

    /// Map onto the status code returned by the provisioning surface
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidArgument(_) | Error::InvalidVolumeId(_) => StatusCode::InvalidArgument,
            Error::OutOfRange(_) => StatusCode::OutOfRange,
            Error::ResourceNotFound { .. } => StatusCode::NotFound,
            Error::VolumeMismatch { .. } | Error::ResourceExists { .. } => {
                StatusCode::AlreadyExists
            }
            Error::Aborted(_) => StatusCode::Aborted,
            Error::Pending(_) => StatusCode::Unavailable,
            Error::InsufficientCapacity { .. } => StatusCode::ResourceExhausted,
            _ => StatusCode::Internal,
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
