//! Capture pipeline errors

use thiserror::Error;

/// Capture error type
///
/// None of these terminate the process. Each is handled where it occurs: a
/// filtered event, a downgrade to connection polling, a stopped poller, or an
/// `Err` returned to the caller of the lifecycle API.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No external IPv4 address found")]
    NoExternalAddress,

    #[error("No native capture backend available")]
    NoCaptureBackendAvailable,

    #[error("No network devices found")]
    NoDevicesFound,

    #[error("Capture backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Capture backend failed at runtime: {0}")]
    BackendRuntimeError(String),

    #[error("Connection table query failed: {0}")]
    PollQueryFailure(String),

    #[error("Capture session already active")]
    SessionAlreadyActive,

    #[error("No Tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type CaptureResult<T> = Result<T, CaptureError>;
