use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

/// The error taxonomy for the core: one variant per failure mode a caller
/// needs to branch on. `is_retryable`/`severity` mirror how callers decide
/// whether to retry a job or fail it outright.
#[derive(Debug, Clone, Error)]
pub enum PercyError {
    #[error("config validation failed: {0}")]
    ConfigValidationError(String),

    #[error("browser launch failed: {0}")]
    BrowserLaunchError(String),

    #[error("navigation failed for {url}: {reason}")]
    NavigationError { url: String, reason: String },

    #[error("resource skipped: {0}")]
    ResourceSkipped(String),

    #[error("build API error: {0}")]
    ApiError(String),

    #[error("core is not running")]
    NotRunningError,

    #[error("snapshot discovery failed: {0}")]
    SnapshotDiscoveryError(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("io error: {0}")]
    IoError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("semaphore error: {0}")]
    SemaphoreError(String),
}

impl PercyError {
    /// Whether a caller may retry the operation that produced this error.
    /// Only the build-client path actually retries; everything else is
    /// either fatal or already-handled at the point it's raised.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PercyError::ApiError(_) | PercyError::Timeout(_))
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PercyError::ConfigValidationError(_) => ErrorSeverity::Critical,
            PercyError::BrowserLaunchError(_) => ErrorSeverity::Critical,
            PercyError::NavigationError { .. } => ErrorSeverity::Medium,
            PercyError::ResourceSkipped(_) => ErrorSeverity::Low,
            PercyError::ApiError(_) => ErrorSeverity::High,
            PercyError::NotRunningError => ErrorSeverity::Low,
            PercyError::SnapshotDiscoveryError(_) => ErrorSeverity::High,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<AcquireError> for PercyError {
    fn from(err: AcquireError) -> Self {
        PercyError::SemaphoreError(err.to_string())
    }
}

impl From<std::io::Error> for PercyError {
    fn from(err: std::io::Error) -> Self {
        PercyError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for PercyError {
    fn from(err: serde_json::Error) -> Self {
        PercyError::SerializationError(err.to_string())
    }
}

/// Retry policy for the build client: exponential backoff, capped attempts,
/// used only on the retryable 5xx/network branch of APIError.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let scaled = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis((scaled as u64).min(self.max_delay.as_millis() as u64))
    }
}
