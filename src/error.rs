use serde::Serialize;

use crate::{
    config::ConfigError, delivery::DeliveryError, download::DownloadError, expander::ExpandError,
    platform::PlatformError,
};

/// Where in the pipeline a candidate failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Setup,
    Expand,
    Resolve,
    Delivery,
    Download,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Expand error: {0}")]
    Expand(#[from] ExpandError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Http client error: {0}")]
    Client(#[from] reqwest::Error),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Expand(_) => Stage::Expand,
            Self::Platform(_) => Stage::Resolve,
            Self::Delivery(_) => Stage::Delivery,
            Self::Download(_) => Stage::Download,
            Self::Config(_) | Self::Client(_) => Stage::Setup,
        }
    }

    /// Short reason shown to chat users. Never carries transport details.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Expand(ExpandError::TooManyRedirects { .. }) => "too many redirects",
            Self::Expand(ExpandError::InvalidUrl(_)) => "invalid link",
            Self::Expand(ExpandError::Cancelled) | Self::Download(DownloadError::Cancelled) => "cancelled",
            Self::Expand(_) => "short link could not be opened",
            Self::Platform(PlatformError::NotFound(_)) => "content not found or deleted",
            Self::Platform(PlatformError::SchemaChanged(_)) => "platform response format changed",
            Self::Platform(PlatformError::InvalidUrl(_) | PlatformError::InvalidPlatform(_)) => "unsupported link",
            Self::Platform(PlatformError::UpstreamUnavailable(_)) => "platform unavailable, try again later",
            Self::Delivery(DeliveryError::ConfigurationRequired { .. }) => {
                "this media needs a cache directory to be configured"
            }
            Self::Download(DownloadError::Timeout(_)) => "download timed out",
            Self::Download(DownloadError::PartialTransfer(_)) => "download incomplete",
            Self::Download(DownloadError::UnsupportedFormat(_)) => "unsupported media format",
            Self::Download(DownloadError::TooLarge { .. }) => "media too large",
            Self::Download(DownloadError::UpstreamUnavailable(_)) => "media blocked by the platform",
            Self::Download(DownloadError::Io(_)) => "cache write failed",
            Self::Config(_) | Self::Client(_) => "misconfigured",
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
