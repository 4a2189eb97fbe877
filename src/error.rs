use std::io;

use thiserror::Error;

/// Errors surfaced by the worker and its runners.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker has shut down and accepts no further calls.
    #[error("worker shutdown")]
    Shutdown,

    /// A job with the given id already exists in the caller's namespace.
    #[error("ID already exists")]
    IdAlreadyExists,

    #[error("cannot set root FS on non-limited worker")]
    RootFsWithoutLimits,

    #[error("cannot have job root in non-limited runner")]
    RootFsNotSupported,

    #[error("must set either both or neither CPU limit")]
    InvalidCpuLimits,

    /// A read was requested past the end of the captured output.
    #[error("offset {offset} out of bounds for length {total}")]
    OffsetOutOfBounds { offset: usize, total: usize },

    #[error("getting device info for executable: {0}")]
    DeviceInfo(#[source] io::Error),

    #[error("starting job: {0}")]
    Start(#[from] io::Error),

    #[cfg(not(target_os = "linux"))]
    #[error("job limits are only supported on linux")]
    LimitsUnsupported,
}

pub type Result<T> = std::result::Result<T, WorkerError>;
