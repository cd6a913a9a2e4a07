mod model;

use std::sync::LazyLock;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use url::Url;

use model::{Status, StatusResponse};

use crate::utils::{
    http::{header_map, HttpService, MOBILE_UA},
    truncate_chars,
};

use super::{
    util::{find_links_with, URL_TAIL},
    FormatHint, MediaItem, Platform, PlatformCapability, PlatformError, PostText, ResolvedIdentity, ResolvedMedia,
    ResourceKind,
};

const API_BASE: &str = "https://m.weibo.cn";
/// The image and video CDNs reject requests without a weibo referer.
const MEDIA_REFERER: &str = "https://weibo.com/";
const BASE62: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
/// Api messages meaning the status is really gone, as opposed to a login wall or risk control.
const GONE_MARKERS: [&str; 5] = ["删除", "不存在", "暂无查看权限", "not exist", "deleted"];

static WEIBO_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"https?://(?:t\.cn/[A-Za-z0-9]+|m\.weibo\.cn/(?:status|detail)/[A-Za-z0-9]+|(?:www\.)?weibo\.com/(?:detail/\d+|\d+/[A-Za-z0-9]+)|(?:www\.)?weibo\.cn/status/[A-Za-z0-9]+){}",
        URL_TAIL
    ))
    .context("Failed to create Weibo URL regex")
    .unwrap()
});

static BR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<br\s*/?>")
        .context("Failed to create line break regex")
        .unwrap()
});

static TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<[^>]+>")
        .context("Failed to create html tag regex")
        .unwrap()
});

pub struct PlatformWeibo {
    http_service: HttpService,
    api_base: Url,
}

#[async_trait]
impl PlatformCapability for PlatformWeibo {
    fn platform(&self) -> Platform {
        Platform::Weibo
    }

    fn find_links(&self, text: &str) -> Vec<(usize, String)> {
        find_links_with(&WEIBO_URL_REGEX, text)
    }

    fn is_short_link(&self, url: &Url) -> bool {
        url.host_str() == Some("t.cn")
    }

    fn extract_identity(&self, url: &Url) -> Result<ResolvedIdentity, PlatformError> {
        let host = url.host_str().unwrap_or_default();
        if !(host.ends_with("weibo.com") || host.ends_with("weibo.cn")) {
            return Err(PlatformError::InvalidUrl(url.to_string()));
        }

        let segments: Vec<_> = url
            .path_segments()
            .map(|s| s.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        let id = match segments.as_slice() {
            ["status" | "detail", id] => *id,
            [uid, id] if uid.chars().all(|c| c.is_ascii_digit()) => *id,
            _ => return Err(PlatformError::InvalidUrl(url.to_string())),
        };
        // Links name a post either by numeric mid or by its base62 form.
        let mid = if is_mid(id) {
            id.to_string()
        } else {
            bid_to_mid(id).ok_or_else(|| PlatformError::InvalidUrl(url.to_string()))?
        };
        Ok(ResolvedIdentity::new(Platform::Weibo, mid, ResourceKind::Post))
    }

    async fn fetch_media(&self, identity: &ResolvedIdentity) -> Result<ResolvedMedia, PlatformError> {
        info!("Fetching weibo status {}", identity.id);
        let endpoint = self
            .api_base
            .join("statuses/show")
            .map_err(|e| PlatformError::InvalidUrl(e.to_string()))?;

        let response: StatusResponse = self
            .http_service
            .get_json(
                endpoint.as_str(),
                &[("id", identity.id.clone())],
                header_map([
                    ("User-Agent", MOBILE_UA),
                    ("Referer", "https://m.weibo.cn/"),
                    ("X-Requested-With", "XMLHttpRequest"),
                ]),
            )
            .await?;

        if response.ok != 1 {
            let reason = format!("weibo {} (ok={}): {}", identity.id, response.ok, response.msg);
            return Err(if GONE_MARKERS.iter().any(|marker| response.msg.contains(marker)) {
                PlatformError::NotFound(reason)
            } else {
                PlatformError::UpstreamUnavailable(reason)
            });
        }
        let status = response
            .data
            .ok_or_else(|| PlatformError::SchemaChanged("status response has no data".to_string()))?;

        // A repost carries its media on the forwarded status.
        let media_source = match &status.retweeted_status {
            Some(original) if !status.has_media() => original.as_ref(),
            _ => &status,
        };
        let items = Self::media_items(media_source);

        Ok(ResolvedMedia {
            items,
            post: Self::post_text(&status),
        })
    }
}

impl PlatformWeibo {
    pub fn new(http_service: HttpService) -> Result<Self, PlatformError> {
        let api_base = Url::parse(API_BASE).map_err(|e| PlatformError::InvalidUrl(e.to_string()))?;
        Ok(Self::with_api_base(http_service, api_base))
    }

    pub fn with_api_base(http_service: HttpService, api_base: Url) -> Self {
        Self { http_service, api_base }
    }

    fn media_items(status: &Status) -> Vec<MediaItem> {
        let mut items: Vec<MediaItem> = status
            .pics
            .iter()
            .filter_map(|pic| Url::parse(pic.best_url()).ok())
            .map(|url| MediaItem::image(url).with_header("Referer", MEDIA_REFERER))
            .collect();

        if let Some(url) = status
            .page_info
            .as_ref()
            .filter(|page| page.kind.as_deref().map_or(true, |kind| kind == "video"))
            .and_then(|page| page.media_info.as_ref())
            .and_then(|media| media.best_url())
            .and_then(|url| Url::parse(url).ok())
        {
            let format = match FormatHint::from_url(&url) {
                FormatHint::Unknown => FormatHint::Mp4,
                format => format,
            };
            items.push(
                MediaItem::video(url)
                    .with_format(format)
                    .with_header("Referer", MEDIA_REFERER),
            );
        }
        items
    }

    fn post_text(status: &Status) -> PostText {
        PostText {
            author: status.user.as_ref().map(|u| u.screen_name.clone()),
            description: Some(truncate_chars(&strip_html(&status.text), 300)),
            published_at: status.published_at(),
            forwarded: status
                .retweeted_status
                .as_ref()
                .map(|original| Box::new(Self::post_text(original))),
            ..Default::default()
        }
    }
}

fn is_mid(id: &str) -> bool {
    id.len() >= 16 && id.bytes().all(|b| b.is_ascii_digit())
}

/// Decodes a base62 post id four characters at a time from the right. Every group but the
/// leading one stands for exactly seven digits of the mid.
fn bid_to_mid(bid: &str) -> Option<String> {
    if bid.is_empty() {
        return None;
    }
    let groups = bid
        .as_bytes()
        .rchunks(4)
        .map(|chunk| {
            chunk.iter().try_fold(0u64, |value, byte| {
                let digit = BASE62.iter().position(|c| c == byte)?;
                Some(value * 62 + digit as u64)
            })
        })
        .collect::<Option<Vec<_>>>()?;

    let last = groups.len() - 1;
    Some(
        groups
            .iter()
            .enumerate()
            .rev()
            .map(|(i, value)| if i == last { value.to_string() } else { format!("{:07}", value) })
            .collect(),
    )
}

fn strip_html(text: &str) -> String {
    let text = BR_REGEX.replace_all(text, "\n");
    TAG_REGEX.replace_all(&text, "").trim().to_string()
}
