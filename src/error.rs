//! Error types for the proxy-replenisher crate.

use http::StatusCode;
use thiserror::Error;

/// Error returned when no usable proxy is available in the pool.
#[derive(Debug, Error)]
#[error("No proxy available in pool")]
pub struct NoProxyAvailable;

/// The backing store could not serve an operation.
///
/// Store failures are never retried locally; they propagate to whoever drove
/// the operation.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store is unreachable or rejected the operation.
    #[error("proxy store unavailable: {0}")]
    Unavailable(String),
}

/// Misuse of the validator's round protocol.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidatorError {
    /// `start` was called while the previous round's workers are still live.
    #[error("validation round still in progress")]
    RoundInProgress,
    /// An item was submitted before any round was started.
    #[error("validator has not been started")]
    NotStarted,
}

/// Failure while fetching a source page.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(StatusCode),
}

/// Failure while talking to the echo endpoint through a proxy.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("echo request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("echo response carried no origin")]
    MissingOrigin,
}

/// Top-level error for pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Validator(#[from] ValidatorError),
    #[error(transparent)]
    NoProxyAvailable(#[from] NoProxyAvailable),
    /// Replenishment did not reach the configured minimum in time.
    #[error("replenishment timed out")]
    ReplenishTimedOut,
    /// The pool is shutting down.
    #[error("operation cancelled by shutdown")]
    Cancelled,
    /// A validation round's task panicked or was cancelled, so its result
    /// cannot be trusted.
    #[error("validation round `{0}` aborted")]
    RoundAborted(String),
    /// A discovery pipeline's control loop is gone.
    #[error("discovery pipeline `{0}` is closed")]
    PipelineClosed(String),
}
