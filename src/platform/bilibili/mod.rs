mod model;
mod util;

use std::future::Future;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use url::Url;

pub use util::av2bv;

use model::{ApiResponse, PgcPlayUrl, PlayUrlData, SeasonView, VideoPage, VideoView};
use util::{find_bare_bvids, parse_target, VideoTarget, BILIBILI_URL_REGEX};

use crate::utils::{
    http::{header_map, HttpService, DESKTOP_UA},
    timestamp_to_datetime, truncate_chars,
};

use super::{
    pick_best, util::find_links_with, FormatHint, MediaItem, Platform, PlatformCapability, PlatformError, PostText,
    QualityHint, ResolvedIdentity, ResolvedMedia, ResourceKind,
};

const API_BASE: &str = "https://api.bilibili.com";
const REFERER: &str = "https://www.bilibili.com/";
/// Requests every stream type at once (dash, hdr, 4k, 8k, av1).
const FNVAL_ALL: u32 = 4048;
const PROBE_QN: u32 = 120;
const FALLBACK_QN: u32 = 80;

pub struct PlatformBilibili {
    http_service: HttpService,
    api_base: Url,
}

#[async_trait]
impl PlatformCapability for PlatformBilibili {
    fn platform(&self) -> Platform {
        Platform::Bilibili
    }

    fn find_links(&self, text: &str) -> Vec<(usize, String)> {
        let mut links = find_links_with(&BILIBILI_URL_REGEX, text);
        let bare = find_bare_bvids(text, &links);
        links.extend(bare);
        links
    }

    fn is_short_link(&self, url: &Url) -> bool {
        matches!(url.host_str(), Some("b23.tv" | "bili2233.cn"))
    }

    fn extract_identity(&self, url: &Url) -> Result<ResolvedIdentity, PlatformError> {
        let identity = match parse_target(url)? {
            VideoTarget::Ugc { bvid, page } if page > 1 => {
                ResolvedIdentity::new(Platform::Bilibili, format!("{}_p{}", bvid, page), ResourceKind::Video)
            }
            VideoTarget::Ugc { bvid, .. } => ResolvedIdentity::new(Platform::Bilibili, bvid, ResourceKind::Video),
            VideoTarget::Pgc { ep_id } => {
                ResolvedIdentity::new(Platform::Bilibili, format!("ep{}", ep_id), ResourceKind::Video)
            }
        };
        Ok(identity)
    }

    async fn fetch_media(&self, identity: &ResolvedIdentity) -> Result<ResolvedMedia, PlatformError> {
        if let Some(ep_id) = identity.id.strip_prefix("ep") {
            let ep_id = ep_id
                .parse::<u64>()
                .map_err(|_| PlatformError::InvalidUrl(identity.id.clone()))?;
            return self.fetch_episode(ep_id).await;
        }

        let (bvid, page) = match identity.id.split_once("_p") {
            Some((bvid, page)) => (
                bvid,
                page.parse::<u32>()
                    .map_err(|_| PlatformError::InvalidUrl(identity.id.clone()))?,
            ),
            None => (identity.id.as_str(), 1),
        };
        self.fetch_video(bvid, page).await
    }
}

impl PlatformBilibili {
    pub fn new(http_service: HttpService) -> Result<Self, PlatformError> {
        let api_base = Url::parse(API_BASE).map_err(|e| PlatformError::InvalidUrl(e.to_string()))?;
        Ok(Self::with_api_base(http_service, api_base))
    }

    pub fn with_api_base(http_service: HttpService, api_base: Url) -> Self {
        Self { http_service, api_base }
    }

    fn endpoint(&self, path: &str) -> Result<String, PlatformError> {
        self.api_base
            .join(path)
            .map(String::from)
            .map_err(|e| PlatformError::InvalidUrl(e.to_string()))
    }

    fn headers(referer: &str) -> HeaderMap {
        header_map([
            ("User-Agent", DESKTOP_UA),
            ("Referer", referer),
            ("Origin", "https://www.bilibili.com"),
        ])
    }

    async fn fetch_video(&self, bvid: &str, page: u32) -> Result<ResolvedMedia, PlatformError> {
        info!("Fetching bilibili video {} (p{})", bvid, page);
        let view: VideoView = self
            .http_service
            .get_json::<ApiResponse<VideoView>>(
                &self.endpoint("x/web-interface/view")?,
                &[("bvid", bvid.to_string())],
                Self::headers(REFERER),
            )
            .await?
            .into_data("view")?;

        let pages = if view.pages.is_empty() {
            self.http_service
                .get_json::<ApiResponse<Vec<VideoPage>>>(
                    &self.endpoint("x/player/pagelist")?,
                    &[("bvid", bvid.to_string())],
                    Self::headers(REFERER),
                )
                .await?
                .into_data("pagelist")?
        } else {
            view.pages
        };

        let part = pages
            .get(page.max(1) as usize - 1)
            .ok_or_else(|| PlatformError::NotFound(format!("{} has no part {}", bvid, page)))?;

        let page_url = match page {
            1 => format!("https://www.bilibili.com/video/{}", view.bvid),
            _ => format!("https://www.bilibili.com/video/{}?p={}", view.bvid, page),
        };

        let item = self
            .resolve_stream(&page_url, |qn, fnval| {
                let query = vec![
                    ("bvid", bvid.to_string()),
                    ("cid", part.cid.to_string()),
                    ("qn", qn.to_string()),
                    ("fnver", "0".to_string()),
                    ("fnval", fnval.to_string()),
                    ("fourk", "1".to_string()),
                    ("otype", "json".to_string()),
                    ("platform", "html5".to_string()),
                    ("high_quality", "1".to_string()),
                ];
                self.play_url("x/player/playurl", query, &page_url)
            })
            .await?;

        let title = if pages.len() > 1 && !part.part.is_empty() {
            format!("{} (P{} {})", view.title, page, part.part)
        } else {
            view.title
        };

        Ok(ResolvedMedia {
            items: vec![item],
            post: PostText {
                title: Some(title),
                author: Some(format!("{}(uid:{})", view.owner.name, view.owner.mid)),
                description: Some(truncate_chars(&view.desc, 200)),
                published_at: view.pubdate.and_then(timestamp_to_datetime),
                ..Default::default()
            },
        })
    }

    async fn fetch_episode(&self, ep_id: u64) -> Result<ResolvedMedia, PlatformError> {
        info!("Fetching bilibili episode ep{}", ep_id);
        let season: SeasonView = self
            .http_service
            .get_json::<ApiResponse<SeasonView>>(
                &self.endpoint("pgc/view/web/season")?,
                &[("ep_id", ep_id.to_string())],
                Self::headers(REFERER),
            )
            .await?
            .into_data("pgc season view")?;

        let page_url = format!("https://www.bilibili.com/bangumi/play/ep{}", ep_id);
        let item = self
            .resolve_stream(&page_url, |qn, fnval| {
                let query = vec![
                    ("ep_id", ep_id.to_string()),
                    ("qn", qn.to_string()),
                    ("fnver", "0".to_string()),
                    ("fnval", fnval.to_string()),
                    ("fourk", "1".to_string()),
                    ("otype", "json".to_string()),
                ];
                self.pgc_play_url(query, &page_url)
            })
            .await?;

        let episode = season.episodes.iter().find(|e| e.ep_id == ep_id);
        let title = episode
            .map(|e| [&e.share_copy, &e.long_title, &e.title])
            .and_then(|candidates| candidates.into_iter().find(|t| !t.is_empty()).cloned())
            .or_else(|| [season.season_title.clone(), season.title.clone()].into_iter().find(|t| !t.is_empty()));
        let author = season.up_info.as_ref().filter(|up| !up.name.is_empty()).map(|up| match up.mid {
            0 => up.name.clone(),
            mid => format!("{}(uid:{})", up.name, mid),
        });

        Ok(ResolvedMedia {
            items: vec![item],
            post: PostText {
                title,
                author,
                description: Some(truncate_chars(&season.evaluate, 200)),
                published_at: episode.and_then(|e| e.pub_time).and_then(timestamp_to_datetime),
                ..Default::default()
            },
        })
    }

    /// Probes the best quality the account may see, then prefers a merged stream and falls
    /// back to the best dash video track.
    async fn resolve_stream<F, Fut>(&self, page_url: &str, play_url: F) -> Result<MediaItem, PlatformError>
    where
        F: Fn(u32, u32) -> Fut,
        Fut: Future<Output = Result<PlayUrlData, PlatformError>>,
    {
        let probe = play_url(PROBE_QN, FNVAL_ALL).await?;
        let target_qn = probe.best_quality().or(probe.quality).unwrap_or(FALLBACK_QN);
        debug!("Bilibili target quality {}", target_qn);

        let merged = play_url(target_qn, 0).await?;
        if let Some(durl) = merged.durl.first() {
            let url = Url::parse(&durl.url).map_err(|e| PlatformError::SchemaChanged(e.to_string()))?;
            let mirrors = durl.backup_url.iter().filter_map(|url| Url::parse(url).ok());
            let item = Self::media_item(url, page_url)
                .with_fallbacks(mirrors)
                .with_format(FormatHint::Mp4)
                .with_quality(QualityHint {
                    id: merged.quality.unwrap_or(target_qn),
                    ..Default::default()
                });
            // Long uploads come back split into parts that play back to back.
            if merged.durl.len() > 1 {
                let parts = merged.durl.iter().filter_map(|part| Url::parse(&part.url).ok()).collect();
                return Ok(item.with_segments(parts));
            }
            return Ok(item);
        }

        let dash = play_url(target_qn, FNVAL_ALL).await?;
        let streams = dash.dash.map(|d| d.video).unwrap_or_default();
        let best = pick_best(&streams, |s| QualityHint {
            id: s.id,
            bandwidth: s.bandwidth,
            width: s.width,
            height: s.height,
        })
        .ok_or_else(|| PlatformError::SchemaChanged("playurl returned neither durl nor dash streams".to_string()))?;

        let url = Url::parse(&best.base_url).map_err(|e| PlatformError::SchemaChanged(e.to_string()))?;
        let mut item = Self::media_item(url, page_url)
            .with_format(FormatHint::Dash)
            .with_quality(QualityHint {
                id: best.id,
                bandwidth: best.bandwidth,
                width: best.width,
                height: best.height,
            });
        item.range_capable = Some(true);
        Ok(item)
    }

    fn media_item(url: Url, page_url: &str) -> MediaItem {
        MediaItem::video(url)
            .with_header("Referer", page_url)
            .with_header("User-Agent", DESKTOP_UA)
    }

    async fn play_url(
        &self,
        path: &str,
        query: Vec<(&str, String)>,
        referer: &str,
    ) -> Result<PlayUrlData, PlatformError> {
        self.http_service
            .get_json::<ApiResponse<PlayUrlData>>(&self.endpoint(path)?, &query, Self::headers(referer))
            .await?
            .into_data("playurl")
    }

    async fn pgc_play_url(&self, query: Vec<(&str, String)>, referer: &str) -> Result<PlayUrlData, PlatformError> {
        Ok(self
            .http_service
            .get_json::<ApiResponse<PgcPlayUrl>>(
                &self.endpoint("pgc/player/web/v2/playurl")?,
                &query,
                Self::headers(referer),
            )
            .await?
            .into_data("pgc playurl")?
            .into_play_url())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use axum::{extract::Query, routing::get, Json, Router};
    use serde_json::{json, Value};

    use super::*;
    use crate::{
        platform::MediaKind,
        utils::test::{serve, test_http},
    };

    fn resolver(base: Url) -> PlatformBilibili {
        PlatformBilibili::with_api_base(test_http(), base)
    }

    fn view() -> Value {
        json!({
            "code": 0,
            "message": "0",
            "data": {
                "bvid": "BV1xx411c7mD",
                "title": "字幕君交流场所",
                "desc": "test",
                "pubdate": 1_256_000_000,
                "owner": {"mid": 2, "name": "碧诗"},
                "pages": [{"cid": 62131, "page": 1, "part": ""}]
            }
        })
    }

    #[test]
    fn test_extract_identity() {
        let bilibili = resolver(Url::parse(API_BASE).unwrap());
        let url = Url::parse("https://www.bilibili.com/video/av170001?p=2").unwrap();
        let identity = bilibili.extract_identity(&url).unwrap();
        assert_eq!(identity.id, "BV17x411w7KC_p2");
        assert_eq!(identity.kind, ResourceKind::Video);

        let url = Url::parse("https://m.bilibili.com/video/BV17x411w7KC").unwrap();
        assert_eq!(bilibili.extract_identity(&url).unwrap().id, "BV17x411w7KC");
    }

    #[test]
    fn test_find_links() {
        let bilibili = resolver(Url::parse(API_BASE).unwrap());
        let links = bilibili.find_links("【视频】https://b23.tv/Ab12CdE 以及 BV17x411w7KC");
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].1, "https://b23.tv/Ab12CdE");
        assert_eq!(links[1].1, "https://www.bilibili.com/video/BV17x411w7KC");
        assert!(bilibili.is_short_link(&Url::parse("https://b23.tv/Ab12CdE").unwrap()));
    }

    #[tokio::test]
    async fn test_fetch_media_prefers_merged_stream() {
        let router = Router::new()
            .route("/x/web-interface/view", get(|| async { Json(view()) }))
            .route(
                "/x/player/playurl",
                get(|Query(q): Query<std::collections::HashMap<String, String>>| async move {
                    if q.get("fnval").map(String::as_str) == Some("0") {
                        Json(json!({"code": 0, "data": {"quality": 80, "durl": [{"url": "https://upos.bilivideo.com/merged.mp4", "size": 10, "backup_url": ["https://upos-hz.bilivideo.com/merged.mp4", "not a url"]}]}}))
                    } else {
                        Json(json!({"code": 0, "data": {"quality": 64, "accept_quality": [80, 64, 32]}}))
                    }
                }),
            );
        let bilibili = resolver(serve(router).await);

        let identity = ResolvedIdentity::new(Platform::Bilibili, "BV1xx411c7mD", ResourceKind::Video);
        let media = bilibili.fetch_media(&identity).await.unwrap();
        assert_eq!(media.items.len(), 1);
        let item = &media.items[0];
        assert_eq!(item.kind, MediaKind::Video);
        assert_eq!(item.url.as_str(), "https://upos.bilivideo.com/merged.mp4");
        assert_eq!(
            item.fallback_urls,
            vec![Url::parse("https://upos-hz.bilivideo.com/merged.mp4").unwrap()]
        );
        assert_eq!(item.format, FormatHint::Mp4);
        assert_eq!(item.quality.unwrap().id, 80);
        assert_eq!(item.headers["Referer"], "https://www.bilibili.com/video/BV1xx411c7mD");
        assert_eq!(media.post.author.as_deref(), Some("碧诗(uid:2)"));
    }

    #[tokio::test]
    async fn test_fetch_media_split_stream_keeps_parts() {
        let router = Router::new()
            .route("/x/web-interface/view", get(|| async { Json(view()) }))
            .route(
                "/x/player/playurl",
                get(|| async {
                    Json(json!({"code": 0, "data": {"quality": 80, "accept_quality": [80], "durl": [
                        {"url": "https://upos.bilivideo.com/part1.flv", "size": 10},
                        {"url": "https://upos.bilivideo.com/part2.flv", "size": 10}
                    ]}}))
                }),
            );
        let bilibili = resolver(serve(router).await);

        let identity = ResolvedIdentity::new(Platform::Bilibili, "BV1xx411c7mD", ResourceKind::Video);
        let item = bilibili.fetch_media(&identity).await.unwrap().items.remove(0);
        assert!(item.is_segmented());
        let parts: Vec<_> = item.segments.unwrap().iter().map(|url| url.to_string()).collect();
        assert_eq!(
            parts,
            vec!["https://upos.bilivideo.com/part1.flv", "https://upos.bilivideo.com/part2.flv"]
        );
    }

    #[tokio::test]
    async fn test_fetch_media_falls_back_to_dash() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let router = Router::new()
            .route("/x/web-interface/view", get(|| async { Json(view()) }))
            .route(
                "/x/player/playurl",
                get(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async {
                        Json(json!({"code": 0, "data": {"accept_quality": [116, 80], "dash": {"video": [
                            {"id": 80, "baseUrl": "https://upos.bilivideo.com/80.m4s", "bandwidth": 900},
                            {"id": 116, "baseUrl": "https://upos.bilivideo.com/116a.m4s", "bandwidth": 2000},
                            {"id": 116, "baseUrl": "https://upos.bilivideo.com/116b.m4s", "bandwidth": 2000}
                        ]}}}))
                    }
                }),
            );
        let bilibili = resolver(serve(router).await);

        let identity = ResolvedIdentity::new(Platform::Bilibili, "BV1xx411c7mD", ResourceKind::Video);
        let media = bilibili.fetch_media(&identity).await.unwrap();
        let item = &media.items[0];
        assert_eq!(item.url.as_str(), "https://upos.bilivideo.com/116a.m4s");
        assert_eq!(item.format, FormatHint::Dash);
        assert_eq!(item.range_capable, Some(true));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_media_missing_part_is_not_found() {
        let router = Router::new().route("/x/web-interface/view", get(|| async { Json(view()) }));
        let bilibili = resolver(serve(router).await);

        let identity = ResolvedIdentity::new(Platform::Bilibili, "BV1xx411c7mD_p4", ResourceKind::Video);
        let result = bilibili.fetch_media(&identity).await;
        assert!(matches!(result, Err(PlatformError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fetch_media_schema_change() {
        let router = Router::new().route(
            "/x/web-interface/view",
            get(|| async { Json(json!({"code": 0, "data": {"unexpected": true}})) }),
        );
        let bilibili = resolver(serve(router).await);

        let identity = ResolvedIdentity::new(Platform::Bilibili, "BV1xx411c7mD", ResourceKind::Video);
        let result = bilibili.fetch_media(&identity).await;
        assert!(matches!(result, Err(PlatformError::SchemaChanged(_))));
    }
}
