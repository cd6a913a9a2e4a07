mod model;

use std::sync::LazyLock;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use url::Url;

use model::RouterData;

use crate::utils::{
    http::{header_map, HttpService, MOBILE_UA},
    timestamp_to_datetime, truncate_chars,
};

use super::{
    util::{find_links_with, parse_embedded_state, URL_TAIL},
    FormatHint, MediaItem, Platform, PlatformCapability, PlatformError, PostText, ResolvedIdentity, ResolvedMedia,
    ResourceKind,
};

const SHARE_BASE: &str = "https://www.iesdouyin.com";
const PLAY_ENDPOINT: &str = "https://www.douyin.com/aweme/v1/play/";
const REFERER: &str = "https://www.douyin.com/";
const ROUTER_DATA_MARKER: &str = "window._ROUTER_DATA = ";

static DOUYIN_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"https?://(?:v\.douyin\.com/[A-Za-z0-9_\-]+|(?:www\.)?(?:douyin|iesdouyin)\.com/[A-Za-z0-9/_\-.?=&%]*?\d{{19}}){}",
        URL_TAIL
    ))
    .context("Failed to create Douyin URL regex")
    .unwrap()
});

static AWEME_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{19})")
        .context("Failed to create Douyin id regex")
        .unwrap()
});

pub struct PlatformDouyin {
    http_service: HttpService,
    share_base: Url,
}

#[async_trait]
impl PlatformCapability for PlatformDouyin {
    fn platform(&self) -> Platform {
        Platform::Douyin
    }

    fn find_links(&self, text: &str) -> Vec<(usize, String)> {
        find_links_with(&DOUYIN_URL_REGEX, text)
    }

    fn is_short_link(&self, url: &Url) -> bool {
        url.host_str() == Some("v.douyin.com")
    }

    fn extract_identity(&self, url: &Url) -> Result<ResolvedIdentity, PlatformError> {
        let modal_id = url
            .query_pairs()
            .find(|(k, _)| k == "modal_id")
            .map(|(_, v)| v.into_owned());

        let id = modal_id
            .or_else(|| AWEME_ID_REGEX.find(url.path()).map(|m| m.as_str().to_string()))
            .ok_or_else(|| PlatformError::InvalidUrl(url.to_string()))?;

        let kind = if url.path().contains("/note/") {
            ResourceKind::ImageSet
        } else {
            ResourceKind::Video
        };
        Ok(ResolvedIdentity::new(Platform::Douyin, id, kind))
    }

    async fn fetch_media(&self, identity: &ResolvedIdentity) -> Result<ResolvedMedia, PlatformError> {
        info!("Fetching douyin share page for {}", identity.id);
        let page_url = self
            .share_base
            .join(&format!("share/video/{}/", identity.id))
            .map_err(|e| PlatformError::InvalidUrl(e.to_string()))?;

        let html = self
            .http_service
            .get_text(
                page_url.as_str(),
                header_map([("User-Agent", MOBILE_UA), ("Referer", REFERER)]),
            )
            .await?;

        let router: RouterData = parse_embedded_state(&html, ROUTER_DATA_MARKER)?;
        let info = router.video_info()?;

        let Some(item) = info.item_list.into_iter().next() else {
            let reason = info
                .filter_list
                .first()
                .map(|f| f.filter_reason.clone())
                .unwrap_or_else(|| "item list is empty".to_string());
            return Err(PlatformError::NotFound(format!("douyin {}: {}", identity.id, reason)));
        };

        let images: Vec<MediaItem> = item
            .images
            .unwrap_or_default()
            .iter()
            .filter_map(|image| {
                let mut urls = image.url_list.iter().filter_map(|url| Url::parse(url).ok());
                let primary = urls.next()?;
                Some(Self::with_headers(MediaItem::image(primary).with_fallbacks(urls)))
            })
            .collect();

        let items = if !images.is_empty() {
            images
        } else {
            let video = item
                .video
                .ok_or_else(|| PlatformError::SchemaChanged("aweme has neither images nor video".to_string()))?;
            vec![Self::with_headers(
                MediaItem::video(Self::play_url(&video.play_addr.uri)?).with_format(FormatHint::Mp4),
            )]
        };

        Ok(ResolvedMedia {
            items,
            post: PostText {
                title: Some(truncate_chars(&item.desc, 200)),
                author: Some(item.author.nickname),
                published_at: item.create_time.and_then(timestamp_to_datetime),
                ..Default::default()
            },
        })
    }
}

impl PlatformDouyin {
    pub fn new(http_service: HttpService) -> Result<Self, PlatformError> {
        let share_base = Url::parse(SHARE_BASE).map_err(|e| PlatformError::InvalidUrl(e.to_string()))?;
        Ok(Self::with_share_base(http_service, share_base))
    }

    pub fn with_share_base(http_service: HttpService, share_base: Url) -> Self {
        Self {
            http_service,
            share_base,
        }
    }

    /// The share page only hands out a play uri; full urls are kept as they are.
    fn play_url(uri: &str) -> Result<Url, PlatformError> {
        if uri.starts_with("https://") || uri.starts_with("http://") {
            return Url::parse(uri).map_err(|e| PlatformError::SchemaChanged(e.to_string()));
        }
        Url::parse_with_params(PLAY_ENDPOINT, &[("video_id", uri)])
            .map_err(|e| PlatformError::SchemaChanged(e.to_string()))
    }

    fn with_headers(item: MediaItem) -> MediaItem {
        item.with_header("User-Agent", MOBILE_UA).with_header("Referer", REFERER)
    }
}
