mod model;

use std::sync::LazyLock;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use url::Url;

use model::{EmbedResponse, Tweet};

use crate::utils::{
    http::{header_map, HttpService},
    timestamp_to_datetime, truncate_chars,
};

use super::{
    util::{find_links_with, URL_TAIL},
    FormatHint, MediaItem, Platform, PlatformCapability, PlatformError, PostText, QualityHint, ResolvedIdentity,
    ResolvedMedia, ResourceKind,
};

static TWITTER_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"https?://(?:t\.co/[A-Za-z0-9]+|(?:(?:www|mobile)\.)?(?:twitter|x|fxtwitter|vxtwitter|fixupx|fixvx)\.com/[A-Za-z0-9_]{{1,15}}/status/\d+){}",
        URL_TAIL
    ))
    .context("Failed to create Twitter URL regex")
    .unwrap()
});

/// Hosts the embed proxy links to directly; these are commonly blocked without a proxy.
const PROXY_SENSITIVE_HOSTS: [&str; 2] = ["pbs.twimg.com", "video.twimg.com"];

pub struct PlatformTwitter {
    http_service: HttpService,
    embed_base: Url,
}

#[async_trait]
impl PlatformCapability for PlatformTwitter {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    fn platform_name(&self) -> &str {
        "Twitter/X"
    }

    fn find_links(&self, text: &str) -> Vec<(usize, String)> {
        find_links_with(&TWITTER_URL_REGEX, text)
    }

    fn is_short_link(&self, url: &Url) -> bool {
        url.host_str() == Some("t.co")
    }

    fn extract_identity(&self, url: &Url) -> Result<ResolvedIdentity, PlatformError> {
        let segments: Vec<_> = url
            .path_segments()
            .map(|s| s.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        match segments.as_slice() {
            [_user, "status", id, ..] if id.chars().all(|c| c.is_ascii_digit()) => {
                Ok(ResolvedIdentity::new(Platform::Twitter, *id, ResourceKind::Post))
            }
            _ => Err(PlatformError::InvalidUrl(url.to_string())),
        }
    }

    async fn fetch_media(&self, identity: &ResolvedIdentity) -> Result<ResolvedMedia, PlatformError> {
        info!("Fetching tweet {} via embed proxy", identity.id);
        let endpoint = self
            .embed_base
            .join(&format!("status/{}", identity.id))
            .map_err(|e| PlatformError::InvalidUrl(e.to_string()))?;

        let response = self
            .http_service
            .client()
            .get(endpoint.as_str())
            .headers(header_map([("Accept", "application/json")]))
            .send()
            .await?;

        // The proxy mirrors its status code into the body, including for 404s.
        let status = response.status();
        let body = response.text().await?;
        let parsed: EmbedResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => return Err(PlatformError::from_status(status, endpoint.as_str())),
            Err(e) => return Err(PlatformError::SchemaChanged(format!("embed proxy: {}", e))),
        };

        let tweet = match parsed.code {
            200 => parsed
                .tweet
                .ok_or_else(|| PlatformError::SchemaChanged("embed response has no tweet".to_string()))?,
            404 | 401 => return Err(PlatformError::NotFound(format!("tweet {}: {}", identity.id, parsed.message))),
            code => {
                return Err(PlatformError::UpstreamUnavailable(format!(
                    "embed proxy returned {}: {}",
                    code, parsed.message
                )))
            }
        };

        let mut items = Self::media_items(&tweet);
        if items.is_empty() {
            if let Some(quote) = &tweet.quote {
                items = Self::media_items(quote);
            }
        }

        Ok(ResolvedMedia {
            items,
            post: Self::post_text(&tweet),
        })
    }
}

impl PlatformTwitter {
    pub fn new(http_service: HttpService, embed_base: &str) -> Result<Self, PlatformError> {
        let mut embed_base = Url::parse(embed_base).map_err(|e| PlatformError::InvalidUrl(e.to_string()))?;
        if !embed_base.path().ends_with('/') {
            let path = format!("{}/", embed_base.path());
            embed_base.set_path(&path);
        }
        Ok(Self {
            http_service,
            embed_base,
        })
    }

    fn media_items(tweet: &Tweet) -> Vec<MediaItem> {
        let Some(media) = &tweet.media else {
            return Vec::new();
        };

        let photos = media
            .photos
            .iter()
            .filter_map(|photo| Url::parse(&photo.url).ok())
            .map(MediaItem::image);

        let videos = media.videos.iter().filter_map(|video| {
            let url = Url::parse(&video.url).ok()?;
            let format = match video.format.as_deref() {
                Some("application/x-mpegURL") => FormatHint::Hls,
                _ => FormatHint::Mp4,
            };
            Some(MediaItem::video(url).with_format(format).with_quality(QualityHint {
                id: 0,
                bandwidth: 0,
                width: video.width,
                height: video.height,
            }))
        });

        photos
            .chain(videos)
            .map(|item| {
                let sensitive = item
                    .url
                    .host_str()
                    .is_some_and(|host| PROXY_SENSITIVE_HOSTS.contains(&host));
                if sensitive {
                    item.requiring_proxy()
                } else {
                    item
                }
            })
            .collect()
    }

    fn post_text(tweet: &Tweet) -> PostText {
        PostText {
            author: tweet
                .author
                .as_ref()
                .map(|a| format!("{} (@{})", a.name, a.screen_name)),
            description: Some(truncate_chars(&tweet.text, 300)),
            published_at: tweet.created_timestamp.and_then(timestamp_to_datetime),
            forwarded: tweet.quote.as_ref().map(|quote| Box::new(Self::post_text(quote))),
            ..Default::default()
        }
    }
}
