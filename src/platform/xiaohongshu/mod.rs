mod model;

use std::sync::LazyLock;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use url::Url;

use model::{InitialState, Note};

use crate::utils::{
    http::{header_map, HttpService, DESKTOP_UA},
    timestamp_to_datetime, truncate_chars,
};

use super::{
    pick_best,
    util::{find_links_with, parse_embedded_state, URL_TAIL},
    FormatHint, MediaItem, Platform, PlatformCapability, PlatformError, PostText, QualityHint, ResolvedIdentity,
    ResolvedMedia, ResourceKind,
};

const WEB_BASE: &str = "https://www.xiaohongshu.com";
const REFERER: &str = "https://www.xiaohongshu.com/";
const INITIAL_STATE_MARKER: &str = "window.__INITIAL_STATE__=";

static XHS_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"https?://(?:xhslink\.com/[A-Za-z0-9/]+|(?:www\.)?xiaohongshu\.com/(?:explore|discovery/item|user/profile/[0-9a-f]+)/[0-9a-f]{{24}}){}",
        URL_TAIL
    ))
    .context("Failed to create Xiaohongshu URL regex")
    .unwrap()
});

static NOTE_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/([0-9a-f]{24})(?:/|$)")
        .context("Failed to create Xiaohongshu note id regex")
        .unwrap()
});

pub struct PlatformXiaohongshu {
    http_service: HttpService,
    web_base: Url,
    /// Notes are only served with the `xsec_token` the share link carried.
    tokens: DashMap<String, String>,
}

#[async_trait]
impl PlatformCapability for PlatformXiaohongshu {
    fn platform(&self) -> Platform {
        Platform::Xiaohongshu
    }

    fn find_links(&self, text: &str) -> Vec<(usize, String)> {
        find_links_with(&XHS_URL_REGEX, text)
    }

    fn is_short_link(&self, url: &Url) -> bool {
        url.host_str() == Some("xhslink.com")
    }

    fn extract_identity(&self, url: &Url) -> Result<ResolvedIdentity, PlatformError> {
        let id = NOTE_ID_REGEX
            .captures(url.path())
            .map(|caps| caps[1].to_string())
            .ok_or_else(|| PlatformError::InvalidUrl(url.to_string()))?;

        if let Some((_, token)) = url.query_pairs().find(|(k, _)| k == "xsec_token") {
            self.tokens.insert(id.clone(), token.into_owned());
        }
        Ok(ResolvedIdentity::new(Platform::Xiaohongshu, id, ResourceKind::Post))
    }

    async fn fetch_media(&self, identity: &ResolvedIdentity) -> Result<ResolvedMedia, PlatformError> {
        // A token is spent by the fetch it was extracted for. Sharing the link again brings it back.
        let token = self.tokens.remove(&identity.id).map(|(_, token)| token);
        self.fetch_note(identity, token.as_deref()).await
    }
}

impl PlatformXiaohongshu {
    pub fn new(http_service: HttpService) -> Result<Self, PlatformError> {
        let web_base = Url::parse(WEB_BASE).map_err(|e| PlatformError::InvalidUrl(e.to_string()))?;
        Ok(Self::with_web_base(http_service, web_base))
    }

    pub fn with_web_base(http_service: HttpService, web_base: Url) -> Self {
        Self {
            http_service,
            web_base,
            tokens: DashMap::new(),
        }
    }

    async fn fetch_note(&self, identity: &ResolvedIdentity, token: Option<&str>) -> Result<ResolvedMedia, PlatformError> {
        info!("Fetching xiaohongshu note {}", identity.id);
        let mut page_url = self
            .web_base
            .join(&format!("explore/{}", identity.id))
            .map_err(|e| PlatformError::InvalidUrl(e.to_string()))?;
        if let Some(token) = token {
            page_url
                .query_pairs_mut()
                .append_pair("xsec_token", token)
                .append_pair("xsec_source", "pc_share");
        }

        let html = self
            .http_service
            .get_text(
                page_url.as_str(),
                header_map([("User-Agent", DESKTOP_UA), ("Referer", REFERER)]),
            )
            .await?;

        let mut state: InitialState = parse_embedded_state(&html, INITIAL_STATE_MARKER)?;
        let note = state
            .note
            .note_detail_map
            .remove(&identity.id)
            .and_then(|detail| detail.note)
            .ok_or_else(|| PlatformError::NotFound(format!("xiaohongshu note {} is unavailable", identity.id)))?;

        Ok(ResolvedMedia {
            items: Self::media_items(&note)?,
            post: PostText {
                title: Some(note.title).filter(|t| !t.is_empty()),
                author: note.user.map(|u| u.nickname),
                description: Some(truncate_chars(&note.desc, 300)),
                published_at: note.time.and_then(timestamp_to_datetime),
                ..Default::default()
            },
        })
    }

    fn media_items(note: &Note) -> Result<Vec<MediaItem>, PlatformError> {
        if note.kind == "video" {
            let video = note
                .video
                .as_ref()
                .ok_or_else(|| PlatformError::SchemaChanged("video note without video".to_string()))?;
            let streams: Vec<_> = video.media.stream.h264.iter().chain(video.media.stream.h265.iter()).collect();
            let best = pick_best(&streams, |s| QualityHint {
                id: 0,
                bandwidth: s.video_bitrate,
                width: s.width,
                height: s.height,
            })
            .ok_or_else(|| PlatformError::SchemaChanged("video note has no streams".to_string()))?;
            let url = Url::parse(&best.master_url).map_err(|e| PlatformError::SchemaChanged(e.to_string()))?;
            return Ok(vec![MediaItem::video(url)
                .with_format(FormatHint::Mp4)
                .with_header("Referer", REFERER)]);
        }

        Ok(note
            .image_list
            .iter()
            .filter_map(|image| Url::parse(&image.url_default).ok())
            .map(|url| MediaItem::image(url).with_header("Referer", REFERER))
            .collect())
    }
}
