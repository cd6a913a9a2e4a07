use crate::utils::retry::Cancellable;

/// Transfer failures. Cloneable so a shared in-flight transfer can hand the same outcome to
/// every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DownloadError {
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Partial transfer: {0}")]
    PartialTransfer(String),
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("Too large: {size} bytes exceeds {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("Cancelled")]
    Cancelled,
    #[error("IO error: {0}")]
    Io(String),
}

impl DownloadError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::UpstreamUnavailable(_))
    }
}

impl Cancellable for DownloadError {
    fn cancelled() -> Self {
        Self::Cancelled
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout(error.to_string())
        } else {
            Self::UpstreamUnavailable(error.to_string())
        }
    }
}
