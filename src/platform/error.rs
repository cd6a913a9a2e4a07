use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("Schema changed: {0}")]
    SchemaChanged(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid url: {0}")]
    InvalidUrl(String),
    #[error("Invalid platform: {0}")]
    InvalidPlatform(String),
}

impl PlatformError {
    pub fn from_status(status: StatusCode, context: &str) -> Self {
        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => Self::NotFound(format!("{} returned {}", context, status)),
            _ => Self::UpstreamUnavailable(format!("{} returned {}", context, status)),
        }
    }
}

impl From<reqwest::Error> for PlatformError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => Self::from_status(status, "request"),
            None => Self::UpstreamUnavailable(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for PlatformError {
    fn from(error: serde_json::Error) -> Self {
        Self::SchemaChanged(error.to_string())
    }
}
