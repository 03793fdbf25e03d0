use thiserror::Error;

pub type GpuResult<T> = Result<T, GpuError>;

/// Errors surfaced by the submission engine.
///
/// Failures are always recovered at the call boundary and returned to the
/// caller; nothing is retried internally. [`GpuError::DeviceLost`] is latched
/// by the device: once observed, subsequent operations fail fast with the
/// same error instead of touching the native API again.
#[derive(Debug, Error)]
pub enum GpuError {
    /// The native device reported a loss-of-device condition.
    #[error("device lost")]
    DeviceLost,

    /// A request was rejected before any native call was issued.
    #[error("validation: {0}")]
    Validation(String),

    /// The (format, sample count, feature) combination is not supported by
    /// this backend. Rejected before any native work is recorded.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// A native device call failed with a non-fatal error code.
    #[error("native device call failed: {0}")]
    Native(String),

    /// A resource allocation (native object or staging memory) failed.
    #[error("allocation failed: {0}")]
    AllocationFailed(&'static str),
}

impl GpuError {
    pub fn validation(msg: impl Into<String>) -> Self {
        GpuError::Validation(msg.into())
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(self, GpuError::DeviceLost)
    }
}
