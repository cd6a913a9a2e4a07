mod model;

use std::sync::LazyLock;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use url::Url;

use model::{GameDetail, GameDetailResponse};

use crate::utils::{
    http::{header_map, HttpService, DESKTOP_UA},
    truncate_chars,
};

use super::{
    util::{find_links_with, URL_TAIL},
    FormatHint, MediaItem, Platform, PlatformCapability, PlatformError, PostText, ResolvedIdentity, ResolvedMedia,
    ResourceKind,
};

const API_BASE: &str = "https://api.xiaoheihe.cn";
const REFERER: &str = "https://www.xiaoheihe.cn/";

static XIAOHEIHE_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"https?://(?:www\.xiaoheihe\.cn/app/topic/game/[a-z]+/\d+|api\.xiaoheihe\.cn/game/share_game_detail\?[A-Za-z0-9_=&]*appid=\d+){}",
        URL_TAIL
    ))
    .context("Failed to create Xiaoheihe URL regex")
    .unwrap()
});

/// Game pages. Detail text is public; the preview trailer needs an api token.
pub struct PlatformXiaoheihe {
    http_service: HttpService,
    api_base: Url,
    token: Option<String>,
}

#[async_trait]
impl PlatformCapability for PlatformXiaoheihe {
    fn platform(&self) -> Platform {
        Platform::Xiaoheihe
    }

    fn find_links(&self, text: &str) -> Vec<(usize, String)> {
        find_links_with(&XIAOHEIHE_URL_REGEX, text)
    }

    fn is_short_link(&self, _url: &Url) -> bool {
        false
    }

    fn extract_identity(&self, url: &Url) -> Result<ResolvedIdentity, PlatformError> {
        let segments: Vec<_> = url
            .path_segments()
            .map(|s| s.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        let (game_type, appid) = match segments.as_slice() {
            ["app", "topic", "game", game_type, appid] => (game_type.to_string(), appid.to_string()),
            ["game", "share_game_detail"] => {
                let param = |name: &str| {
                    url.query_pairs()
                        .find(|(k, _)| k == name)
                        .map(|(_, v)| v.into_owned())
                };
                let appid = param("appid").ok_or_else(|| PlatformError::InvalidUrl(url.to_string()))?;
                (param("game_type").unwrap_or_else(|| "pc".to_string()), appid)
            }
            _ => return Err(PlatformError::InvalidUrl(url.to_string())),
        };

        if appid.is_empty() || !appid.chars().all(|c| c.is_ascii_digit()) {
            return Err(PlatformError::InvalidUrl(url.to_string()));
        }
        Ok(ResolvedIdentity::new(
            Platform::Xiaoheihe,
            format!("{}:{}", game_type, appid),
            ResourceKind::GameDetail,
        ))
    }

    async fn fetch_media(&self, identity: &ResolvedIdentity) -> Result<ResolvedMedia, PlatformError> {
        let (game_type, appid) = identity
            .id
            .split_once(':')
            .ok_or_else(|| PlatformError::InvalidUrl(identity.id.clone()))?;
        info!("Fetching xiaoheihe game {} ({})", appid, game_type);

        let endpoint = self
            .api_base
            .join("game/get_game_detail/")
            .map_err(|e| PlatformError::InvalidUrl(e.to_string()))?;

        let cookie = self.token.as_ref().map(|token| format!("x_xhh_tokenid={}", token));
        let mut headers = vec![("User-Agent", DESKTOP_UA), ("Referer", REFERER)];
        if let Some(cookie) = &cookie {
            headers.push(("Cookie", cookie.as_str()));
        }

        let response: GameDetailResponse = self
            .http_service
            .get_json(
                endpoint.as_str(),
                &[("appid", appid.to_string()), ("game_type", game_type.to_string())],
                header_map(headers),
            )
            .await?;

        if response.status != "ok" {
            return Err(match response.status.as_str() {
                "failed" if response.msg.contains("不存在") => PlatformError::NotFound(response.msg),
                _ => PlatformError::UpstreamUnavailable(format!("{}: {}", response.status, response.msg)),
            });
        }
        let detail = response
            .result
            .ok_or_else(|| PlatformError::SchemaChanged("game detail has no result".to_string()))?;

        Ok(ResolvedMedia {
            items: self.preview_items(&detail)?,
            post: Self::post_text(detail),
        })
    }
}

impl PlatformXiaoheihe {
    pub fn new(http_service: HttpService, token: Option<String>) -> Result<Self, PlatformError> {
        let api_base = Url::parse(API_BASE).map_err(|e| PlatformError::InvalidUrl(e.to_string()))?;
        Ok(Self::with_api_base(http_service, api_base, token))
    }

    pub fn with_api_base(http_service: HttpService, api_base: Url, token: Option<String>) -> Self {
        Self {
            http_service,
            api_base,
            token,
        }
    }

    fn preview_items(&self, detail: &GameDetail) -> Result<Vec<MediaItem>, PlatformError> {
        if self.token.is_none() {
            return Ok(Vec::new());
        }
        let Some(movie) = detail.movies.first() else {
            return Ok(Vec::new());
        };
        let url = Url::parse(&movie.url).map_err(|e| PlatformError::SchemaChanged(e.to_string()))?;
        Ok(vec![MediaItem::video(url)
            .with_format(FormatHint::Hls)
            .with_header("Referer", REFERER)
            .requiring_proxy()])
    }

    fn post_text(detail: GameDetail) -> PostText {
        let mut extra = Vec::new();
        if let Some(price) = &detail.price {
            let mut line = format!("Price: {}", price.current.as_deref().unwrap_or("-"));
            if let (Some(initial), Some(discount)) = (&price.initial, price.discount.filter(|d| *d > 0)) {
                line.push_str(&format!(" (was {}, -{}%)", initial, discount));
            }
            extra.push(line);
        }
        if let Some(score) = detail.score.as_deref().filter(|s| !s.is_empty()) {
            extra.push(format!("Score: {}", score));
        }
        if !detail.tags.is_empty() {
            let tags: Vec<_> = detail.tags.iter().take(8).map(|t| t.desc.as_str()).collect();
            extra.push(format!("Tags: {}", tags.join(" / ")));
        }

        let title = if detail.name_en.is_empty() || detail.name_en == detail.name {
            detail.name
        } else {
            format!("{} ({})", detail.name, detail.name_en)
        };

        PostText {
            title: Some(title),
            description: Some(truncate_chars(&detail.about_the_game, 300)),
            extra,
            ..Default::default()
        }
    }
}
