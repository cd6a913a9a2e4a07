mod model;

use std::sync::LazyLock;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use url::Url;

use model::InitState;

use crate::utils::{
    http::{header_map, HttpService, MOBILE_UA},
    timestamp_to_datetime, truncate_chars,
};

use super::{
    util::{find_links_with, parse_embedded_state, URL_TAIL},
    FormatHint, MediaItem, Platform, PlatformCapability, PlatformError, PostText, ResolvedIdentity, ResolvedMedia,
    ResourceKind,
};

const PAGE_BASE: &str = "https://v.m.chenzhongtech.com";
const REFERER: &str = "https://www.kuaishou.com/";
const INIT_STATE_MARKER: &str = "window.INIT_STATE = ";

static KUAISHOU_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"https?://(?:v\.kuaishou\.com/[A-Za-z0-9]+|(?:www\.|v\.m\.|m\.)?(?:kuaishou|chenzhongtech|gifshow)\.com/(?:short-video|fw/photo|photo)/[A-Za-z0-9_\-]+){}",
        URL_TAIL
    ))
    .context("Failed to create Kuaishou URL regex")
    .unwrap()
});

pub struct PlatformKuaishou {
    http_service: HttpService,
    page_base: Url,
}

#[async_trait]
impl PlatformCapability for PlatformKuaishou {
    fn platform(&self) -> Platform {
        Platform::Kuaishou
    }

    fn find_links(&self, text: &str) -> Vec<(usize, String)> {
        find_links_with(&KUAISHOU_URL_REGEX, text)
    }

    fn is_short_link(&self, url: &Url) -> bool {
        url.host_str() == Some("v.kuaishou.com")
    }

    fn extract_identity(&self, url: &Url) -> Result<ResolvedIdentity, PlatformError> {
        let segments: Vec<_> = url
            .path_segments()
            .map(|s| s.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        match segments.as_slice() {
            ["short-video", id, ..] | ["fw", "photo", id, ..] | ["photo", id, ..] => {
                Ok(ResolvedIdentity::new(Platform::Kuaishou, *id, ResourceKind::Video))
            }
            _ => Err(PlatformError::InvalidUrl(url.to_string())),
        }
    }

    async fn fetch_media(&self, identity: &ResolvedIdentity) -> Result<ResolvedMedia, PlatformError> {
        info!("Fetching kuaishou photo page for {}", identity.id);
        let page_url = self
            .page_base
            .join(&format!("fw/photo/{}", identity.id))
            .map_err(|e| PlatformError::InvalidUrl(e.to_string()))?;

        let html = self
            .http_service
            .get_text(
                page_url.as_str(),
                header_map([("User-Agent", MOBILE_UA), ("Referer", REFERER)]),
            )
            .await?;

        let state: InitState = parse_embedded_state(&html, INIT_STATE_MARKER)?;
        let state = state.photo_state()?;
        if state.result != 1 {
            return Err(PlatformError::NotFound(format!(
                "kuaishou {} returned result {}",
                identity.id, state.result
            )));
        }
        let photo = state
            .photo
            .ok_or_else(|| PlatformError::SchemaChanged("photo missing from state".to_string()))?;

        let images: Vec<MediaItem> = state
            .atlas
            .map(|atlas| atlas.image_urls())
            .unwrap_or_default()
            .iter()
            .filter_map(|url| Url::parse(url).ok())
            .map(|url| MediaItem::image(url).with_header("Referer", REFERER))
            .collect();

        let items = if !images.is_empty() {
            images
        } else {
            let video = photo
                .main_mv_urls
                .first()
                .ok_or_else(|| PlatformError::SchemaChanged("photo has neither atlas nor video".to_string()))?;
            let url = Url::parse(&video.url).map_err(|e| PlatformError::SchemaChanged(e.to_string()))?;
            vec![MediaItem::video(url)
                .with_format(FormatHint::Mp4)
                .with_header("Referer", REFERER)]
        };

        Ok(ResolvedMedia {
            items,
            post: PostText {
                title: Some(truncate_chars(&photo.caption, 200)),
                author: Some(photo.user_name),
                published_at: photo.timestamp.and_then(timestamp_to_datetime),
                ..Default::default()
            },
        })
    }
}

impl PlatformKuaishou {
    pub fn new(http_service: HttpService) -> Result<Self, PlatformError> {
        let page_base = Url::parse(PAGE_BASE).map_err(|e| PlatformError::InvalidUrl(e.to_string()))?;
        Ok(Self::with_page_base(http_service, page_base))
    }

    pub fn with_page_base(http_service: HttpService, page_base: Url) -> Self {
        Self {
            http_service,
            page_base,
        }
    }
}
