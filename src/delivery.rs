use serde::Serialize;

use crate::{
    config::PipelineConfig,
    platform::{MediaItem, MediaKind, Platform},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementLevel {
    /// The url is unusable without a local copy (referer gates, segmented streams).
    Mandatory,
    /// Direct links work most of the time but are often throttled or blocked.
    Probabilistic,
    Optional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    PreDownload,
    DirectUrl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    PlatformMandated,
    RiskControl,
    ConfigDriven,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeliveryDecision {
    pub mode: DeliveryMode,
    pub level: RequirementLevel,
    pub reason: DecisionReason,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("{platform} {kind:?} needs a cache directory to be delivered")]
    ConfigurationRequired { platform: Platform, kind: MediaKind },
}

pub fn requirement(platform: Platform, item: &MediaItem) -> RequirementLevel {
    use RequirementLevel::*;

    if item.is_segmented() {
        return Mandatory;
    }
    match (platform, item.kind) {
        (Platform::Weibo, _) => Mandatory,
        (Platform::Xiaoheihe, MediaKind::Video) => Mandatory,
        (Platform::Kuaishou, _) => Probabilistic,
        (Platform::Douyin | Platform::Xiaohongshu, MediaKind::Image) => Probabilistic,
        (Platform::Twitter, MediaKind::Video) => Probabilistic,
        _ => Optional,
    }
}

/// Decides per item whether it is sent as a url or fetched into the cache first.
#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    has_cache: bool,
    pre_download: bool,
}

impl DeliveryPolicy {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            has_cache: config.cache_directory.is_some(),
            pre_download: config.pre_download_enabled,
        }
    }

    pub fn decide(&self, platform: Platform, item: &MediaItem) -> Result<DeliveryDecision, DeliveryError> {
        let level = requirement(platform, item);
        let decision = match level {
            RequirementLevel::Mandatory if !self.has_cache => {
                return Err(DeliveryError::ConfigurationRequired {
                    platform,
                    kind: item.kind,
                })
            }
            RequirementLevel::Mandatory => DeliveryDecision {
                mode: DeliveryMode::PreDownload,
                level,
                reason: DecisionReason::PlatformMandated,
            },
            _ if self.has_cache && self.pre_download => DeliveryDecision {
                mode: DeliveryMode::PreDownload,
                level,
                reason: match level {
                    RequirementLevel::Probabilistic => DecisionReason::RiskControl,
                    _ => DecisionReason::ConfigDriven,
                },
            },
            _ => DeliveryDecision {
                mode: DeliveryMode::DirectUrl,
                level,
                reason: DecisionReason::ConfigDriven,
            },
        };
        debug!("{} {:?}: {:?}", platform, item.kind, decision);
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use url::Url;

    use super::*;
    use crate::platform::FormatHint;

    fn video() -> MediaItem {
        MediaItem::video(Url::parse("https://cdn.example.com/v.mp4").unwrap())
    }

    fn image() -> MediaItem {
        MediaItem::image(Url::parse("https://cdn.example.com/i.jpg").unwrap())
    }

    fn policy(cache: bool, pre_download: bool) -> DeliveryPolicy {
        DeliveryPolicy::new(&PipelineConfig {
            cache_directory: cache.then(|| PathBuf::from("/tmp/linkstash")),
            pre_download_enabled: pre_download,
            ..Default::default()
        })
    }

    #[test]
    fn test_requirement_table() {
        assert_eq!(requirement(Platform::Bilibili, &video()), RequirementLevel::Optional);
        assert_eq!(requirement(Platform::Douyin, &image()), RequirementLevel::Probabilistic);
        assert_eq!(requirement(Platform::Kuaishou, &video()), RequirementLevel::Probabilistic);
        assert_eq!(requirement(Platform::Weibo, &image()), RequirementLevel::Mandatory);
        assert_eq!(requirement(Platform::Xiaohongshu, &video()), RequirementLevel::Optional);
        assert_eq!(requirement(Platform::Xiaoheihe, &video()), RequirementLevel::Mandatory);
        assert_eq!(requirement(Platform::Twitter, &image()), RequirementLevel::Optional);
    }

    #[test]
    fn test_segmented_is_always_mandatory() {
        let hls = video().with_format(FormatHint::Hls);
        assert_eq!(requirement(Platform::Bilibili, &hls), RequirementLevel::Mandatory);

        let parts = video().with_segments(vec![Url::parse("https://cdn.example.com/v/0.ts").unwrap()]);
        assert_eq!(requirement(Platform::Bilibili, &parts), RequirementLevel::Mandatory);
    }

    #[test]
    fn test_mandatory_without_cache_fails() {
        for platform in [Platform::Weibo, Platform::Xiaoheihe] {
            let result = policy(false, true).decide(platform, &video());
            assert!(matches!(result, Err(DeliveryError::ConfigurationRequired { .. })));
        }
    }

    #[test]
    fn test_mandatory_ignores_pre_download_flag() {
        let decision = policy(true, false).decide(Platform::Weibo, &image()).unwrap();
        assert_eq!(decision.mode, DeliveryMode::PreDownload);
        assert_eq!(decision.reason, DecisionReason::PlatformMandated);
    }

    #[test]
    fn test_pre_download_reasons() {
        let decision = policy(true, true).decide(Platform::Kuaishou, &video()).unwrap();
        assert_eq!(decision.reason, DecisionReason::RiskControl);

        let decision = policy(true, true).decide(Platform::Bilibili, &video()).unwrap();
        assert_eq!(decision.mode, DeliveryMode::PreDownload);
        assert_eq!(decision.reason, DecisionReason::ConfigDriven);
    }

    #[test]
    fn test_direct_url_without_pre_download() {
        let decision = policy(true, false).decide(Platform::Kuaishou, &video()).unwrap();
        assert_eq!(decision.mode, DeliveryMode::DirectUrl);

        let decision = policy(false, true).decide(Platform::Bilibili, &video()).unwrap();
        assert_eq!(decision.mode, DeliveryMode::DirectUrl);
        assert_eq!(decision.level, RequirementLevel::Optional);
    }
}
