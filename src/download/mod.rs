mod cache;
mod error;
mod fetch;
mod hls;
mod transcode;

use std::{path::PathBuf, sync::Arc};

use dashmap::{mapref::entry::Entry, DashMap};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use reqwest::{header::HeaderMap, Client};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use url::Url;

pub use cache::{CacheEntry, CacheKey, CacheStore};
pub use error::DownloadError;
pub use fetch::MIN_PARTITION_SIZE;
pub use transcode::ImageSignature;

use crate::{
    config::{PipelineConfig, ProxyRoutes},
    platform::{MediaItem, MediaKind},
    state::PipelineStats,
    utils::{http::headers_from, retry::RetryPolicy},
};

type SharedTransfer = Shared<BoxFuture<'static, Result<CacheEntry, DownloadError>>>;

/// Finished transfers remembered for `state` before the oldest ones are forgotten.
const MAX_TRACKED_STATES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    Fetching,
    /// Segments are on disk and being joined.
    Merging,
    Complete,
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Fetches media into the cache directory. At most one transfer runs per cache key; later
/// requests for the same key wait on the running one.
#[derive(Clone)]
pub struct DownloadManager {
    client: Client,
    /// Client for the routes switched on in `proxy_routes`.
    proxied: Option<Client>,
    proxy_routes: ProxyRoutes,
    store: CacheStore,
    retry: RetryPolicy,
    chunks: usize,
    max_video_bytes: Option<u64>,
    max_tracked_states: usize,
    in_flight: Arc<DashMap<CacheKey, SharedTransfer>>,
    states: Arc<DashMap<CacheKey, TransferState>>,
    stats: Arc<PipelineStats>,
}

impl DownloadManager {
    pub fn new(client: Client, cache_dir: PathBuf, config: &PipelineConfig, stats: Arc<PipelineStats>) -> Self {
        Self {
            client,
            proxied: None,
            proxy_routes: config.proxy_routes.clone(),
            store: CacheStore::new(cache_dir),
            retry: RetryPolicy::from_config(config),
            chunks: config.concurrent_chunks.max(1),
            max_video_bytes: config.max_video_bytes(),
            max_tracked_states: MAX_TRACKED_STATES,
            in_flight: Arc::new(DashMap::new()),
            states: Arc::new(DashMap::new()),
            stats,
        }
    }

    /// Sends items that may require a proxy through `client` when their route is switched on.
    pub fn with_proxied_client(mut self, client: Client) -> Self {
        self.proxied = Some(client);
        self
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub async fn clean_stale(&self) -> Result<usize, DownloadError> {
        Ok(self.store.clean_stale().await?)
    }

    pub fn state(&self, key: &CacheKey) -> Option<TransferState> {
        self.states.get(key).map(|state| *state)
    }

    fn set_state(&self, key: &CacheKey, state: TransferState) {
        debug!("{} -> {:?}", key, state);
        if state.is_terminal() && self.states.len() >= self.max_tracked_states {
            self.states.retain(|_, state| !state.is_terminal());
        }
        self.states.insert(key.clone(), state);
    }

    fn client_for(&self, key: &CacheKey, item: &MediaItem) -> &Client {
        match &self.proxied {
            Some(proxied) if item.may_require_proxy && self.proxy_routes.media(key.platform, item.kind) => {
                debug!("Fetching {} through the platform proxy", key);
                proxied
            }
            _ => &self.client,
        }
    }

    pub async fn fetch(
        &self,
        key: CacheKey,
        item: &MediaItem,
        token: &CancellationToken,
    ) -> Result<CacheEntry, DownloadError> {
        if let Some(entry) = self.store.lookup(&key).await {
            info!("Cache hit for {}", key);
            self.set_state(&key, TransferState::Complete);
            self.stats.record_cache_hit();
            return Ok(entry);
        }

        // A joined transfer can be cancelled by whoever started it. Start over once in that
        // case as long as our own token is still live.
        for _ in 0..2 {
            let (transfer, started) = self.join_or_start(&key, item, token);
            let result = if started {
                transfer.await
            } else {
                debug!("Joining in-flight transfer for {}", key);
                tokio::select! {
                    _ = token.cancelled() => return Err(DownloadError::Cancelled),
                    result = transfer => result,
                }
            };
            match result {
                Err(DownloadError::Cancelled) if !started && !token.is_cancelled() => continue,
                result => return result,
            }
        }
        Err(DownloadError::Cancelled)
    }

    fn join_or_start(&self, key: &CacheKey, item: &MediaItem, token: &CancellationToken) -> (SharedTransfer, bool) {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(running) => (running.get().clone(), false),
            Entry::Vacant(slot) => {
                // Runs on its own task, so it reaches a terminal state and releases its
                // scratch files even when every waiter is dropped.
                let handle = tokio::spawn(self.clone().transfer(key.clone(), item.clone(), token.clone()));
                let transfer = async move {
                    handle
                        .await
                        .unwrap_or_else(|e| Err(DownloadError::Io(format!("transfer task failed: {}", e))))
                }
                .boxed()
                .shared();
                slot.insert(transfer.clone());
                (transfer, true)
            }
        }
    }

    async fn transfer(self, key: CacheKey, item: MediaItem, token: CancellationToken) -> Result<CacheEntry, DownloadError> {
        self.set_state(&key, TransferState::Pending);

        let result = match self.store.prepare(&key).await {
            Ok(()) => tokio::select! {
                _ = token.cancelled() => Err(DownloadError::Cancelled),
                result = self.run(&key, &item, &token) => result,
            },
            Err(e) => Err(e.into()),
        };
        let result = match result {
            Ok(ext) => self.store.publish(&key, ext).await.map_err(DownloadError::from),
            Err(e) => Err(e),
        };

        match &result {
            Ok(entry) => {
                info!("Stored {} ({} bytes)", key, entry.size);
                self.set_state(&key, TransferState::Complete);
                self.stats.record_download(entry.size);
            }
            Err(e) => {
                warn!("Transfer of {} failed: {}", key, e);
                self.store.discard(&key).await;
                self.set_state(&key, TransferState::Failed);
                self.stats.record_download_failure();
            }
        }
        self.in_flight.remove(&key);
        result
    }

    /// Writes the item into the key's `.part` file and returns the extension to publish under.
    async fn run(&self, key: &CacheKey, item: &MediaItem, token: &CancellationToken) -> Result<&'static str, DownloadError> {
        self.set_state(key, TransferState::Fetching);
        let client = self.client_for(key, item);
        let headers = headers_from(&item.headers);
        let limit = match item.kind {
            MediaKind::Video => self.max_video_bytes,
            MediaKind::Image => None,
        };

        if item.is_segmented() {
            return self.run_segmented(client, key, item, &headers, limit, token).await;
        }

        let mut last_error = None;
        for url in item.urls() {
            match self.fetch_url(client, key, url, &headers, limit, token).await {
                Ok(()) => {
                    return match item.kind {
                        MediaKind::Image => transcode::normalize(&self.store.part_path(key)).await,
                        MediaKind::Video => Ok("mp4"),
                    }
                }
                Err(e @ (DownloadError::Cancelled | DownloadError::TooLarge { .. })) => return Err(e),
                Err(e) => {
                    warn!("Fetching {} from {} failed: {}", key, url, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| DownloadError::UpstreamUnavailable(format!("{} has no url", key))))
    }

    async fn run_segmented(
        &self,
        client: &Client,
        key: &CacheKey,
        item: &MediaItem,
        headers: &HeaderMap,
        limit: Option<u64>,
        token: &CancellationToken,
    ) -> Result<&'static str, DownloadError> {
        let plan = match &item.segments {
            Some(pieces) if !pieces.is_empty() => hls::SegmentPlan { pieces: pieces.clone() },
            _ => hls::resolve_plan(client, &item.url, headers, &self.retry, token).await?,
        };
        info!("Fetching {} segments for {}", plan.pieces.len(), key);
        let pieces = hls::fetch_pieces(
            client,
            &plan,
            headers,
            |index| self.store.piece_path(key, index),
            self.chunks,
            &self.retry,
            token,
        )
        .await?;

        self.set_state(key, TransferState::Merging);
        let size = hls::merge_pieces(&pieces, &self.store.part_path(key)).await?;
        if let Some(limit) = limit.filter(|limit| size > *limit) {
            return Err(DownloadError::TooLarge { size, limit });
        }
        Ok("ts")
    }

    async fn fetch_url(
        &self,
        client: &Client,
        key: &CacheKey,
        url: &Url,
        headers: &HeaderMap,
        limit: Option<u64>,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let part = self.store.part_path(key);
        let probe = fetch::probe(client, url, headers, &self.retry, token).await?;
        if let (Some(limit), Some(size)) = (limit, probe.length) {
            if size > limit {
                return Err(DownloadError::TooLarge { size, limit });
            }
        }

        match probe.length.filter(|_| probe.supports_partitioning(self.chunks)) {
            Some(total) => {
                debug!("{} supports ranges, splitting {} bytes", key, total);
                fetch::fetch_ranges(client, url, headers, &part, total, self.chunks, &self.retry, token).await?;
            }
            None => {
                fetch::fetch_single(client, url, headers, &part, limit, &self.retry, token).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use axum::{
        body::Bytes,
        extract::{Path, State},
        http::{header, HeaderMap, Method, StatusCode},
        response::{IntoResponse, Response},
        routing::get,
        Router,
    };
    use image::ImageFormat;
    use url::Url;

    use super::*;
    use crate::{
        platform::{FormatHint, Platform},
        utils::{
            http::HttpService,
            test::{encode_image, serve, test_config, test_http},
        },
    };

    #[derive(Default)]
    struct Hits {
        gets: AtomicU32,
        ranges: AtomicU32,
        segments: AtomicU32,
    }

    #[derive(Clone)]
    struct Media {
        body: Arc<Vec<u8>>,
        content_type: &'static str,
        hits: Arc<Hits>,
        /// Range requests starting here always fail.
        poisoned_offset: Option<u64>,
        delay: Duration,
    }

    impl Media {
        fn new(body: Vec<u8>, content_type: &'static str) -> Self {
            Self {
                body: Arc::new(body),
                content_type,
                hits: Arc::new(Hits::default()),
                poisoned_offset: None,
                delay: Duration::ZERO,
            }
        }
    }

    async fn serve_media(State(media): State<Media>, method: Method, headers: HeaderMap) -> Response {
        let len = media.body.len() as u64;
        let range = headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.split_once('-'))
            .and_then(|(start, end)| Some((start.parse::<u64>().ok()?, end.parse::<u64>().ok()?)));

        if method == Method::GET {
            media.hits.gets.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(media.delay).await;
        }

        match range {
            Some((start, _)) if Some(start) == media.poisoned_offset => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            Some((start, end)) => {
                media.hits.ranges.fetch_add(1, Ordering::SeqCst);
                let slice = media.body[start as usize..=end as usize].to_vec();
                (
                    StatusCode::PARTIAL_CONTENT,
                    [
                        (header::CONTENT_TYPE, media.content_type.to_string()),
                        (header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, len)),
                    ],
                    slice,
                )
                    .into_response()
            }
            None => (
                [
                    (header::CONTENT_TYPE, media.content_type.to_string()),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                    (header::CONTENT_LENGTH, len.to_string()),
                ],
                media.body.as_ref().clone(),
            )
                .into_response(),
        }
    }

    async fn media_url(media: Media, name: &str) -> Url {
        let base = serve(Router::new().route("/media/{name}", get(serve_media)).with_state(media)).await;
        base.join(&format!("media/{}", name)).unwrap()
    }

    fn manager(dir: &std::path::Path, config: PipelineConfig) -> DownloadManager {
        DownloadManager::new(
            test_http().client().clone(),
            dir.to_path_buf(),
            &config,
            Arc::new(PipelineStats::default()),
        )
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn no_scratch_files(dir: &std::path::Path) -> bool {
        walk(dir).iter().all(|path| !path.to_string_lossy().contains(".part"))
    }

    fn walk(dir: &std::path::Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap().flatten() {
            let path = entry.path();
            if path.is_dir() {
                out.extend(walk(&path));
            } else {
                out.push(path);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_range_download_matches_single_stream() {
        let body = payload(512 * 1024);
        let media = Media::new(body.clone(), "video/mp4");
        let hits = media.hits.clone();
        let url = media_url(media, "v.mp4").await;

        let dir = tempfile::tempdir().unwrap();
        let ranged = manager(dir.path(), test_config());
        let key = CacheKey::new(Platform::Bilibili, "BV1xx411c7mD", 0);
        let entry = ranged
            .fetch(key.clone(), &MediaItem::video(url.clone()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(hits.ranges.load(Ordering::SeqCst), 4);
        assert_eq!(entry.path.extension().unwrap(), "mp4");
        assert_eq!(ranged.state(&key), Some(TransferState::Complete));

        let single = manager(
            dir.path(),
            PipelineConfig {
                concurrent_chunks: 1,
                ..test_config()
            },
        );
        let other = CacheKey::new(Platform::Bilibili, "BV1xx411c7mE", 0);
        let single_entry = single
            .fetch(other, &MediaItem::video(url), &CancellationToken::new())
            .await
            .unwrap();

        let ranged_bytes = std::fs::read(&entry.path).unwrap();
        assert_eq!(ranged_bytes, body);
        assert_eq!(ranged_bytes, std::fs::read(&single_entry.path).unwrap());
        assert!(no_scratch_files(dir.path()));
    }

    #[tokio::test]
    async fn test_failed_partition_leaves_nothing_visible() {
        let mut media = Media::new(payload(512 * 1024), "video/mp4");
        media.poisoned_offset = Some(128 * 1024);
        let url = media_url(media, "v.mp4").await;

        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(dir.path(), test_config());
        let key = CacheKey::new(Platform::Kuaishou, "3xabc", 0);
        let result = downloads
            .fetch(key.clone(), &MediaItem::video(url), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(DownloadError::PartialTransfer(_))));
        assert_eq!(downloads.state(&key), Some(TransferState::Failed));
        assert!(downloads.store().lookup(&key).await.is_none());
        assert!(no_scratch_files(dir.path()));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_network() {
        let jpeg = encode_image(ImageFormat::Jpeg);
        let media = Media::new(jpeg.clone(), "image/jpeg");
        let hits = media.hits.clone();
        let url = media_url(media, "a.jpg").await;

        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(dir.path(), test_config());
        let key = CacheKey::new(Platform::Weibo, "NzAbCdEfG", 0);
        let item = MediaItem::image(url);

        let first = downloads.fetch(key.clone(), &item, &CancellationToken::new()).await.unwrap();
        let second = downloads.fetch(key, &item, &CancellationToken::new()).await.unwrap();
        assert_eq!(first.path, second.path);
        assert_eq!(hits.gets.load(Ordering::SeqCst), 1);
        // JPEG passes through untouched.
        assert_eq!(std::fs::read(&first.path).unwrap(), jpeg);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_transfer() {
        let mut media = Media::new(payload(1024), "video/mp4");
        media.delay = Duration::from_millis(200);
        let hits = media.hits.clone();
        let url = media_url(media, "v.mp4").await;

        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(dir.path(), test_config());
        let key = CacheKey::new(Platform::Douyin, "7300000000000000000", 0);
        let item = MediaItem::video(url);
        let token = CancellationToken::new();

        let (a, b) = tokio::join!(
            downloads.fetch(key.clone(), &item, &token),
            downloads.fetch(key.clone(), &item, &token)
        );
        assert_eq!(a.unwrap().path, b.unwrap().path);
        assert_eq!(hits.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_webp_is_reencoded() {
        let url = media_url(Media::new(encode_image(ImageFormat::WebP), "image/webp"), "a.webp").await;

        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(dir.path(), test_config());
        let key = CacheKey::new(Platform::Xiaohongshu, "6512a3b4000000001f03e1aa", 1);
        let entry = downloads
            .fetch(key, &MediaItem::image(url), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(entry.path.extension().unwrap(), "jpg");
        assert_eq!(ImageSignature::detect(&std::fs::read(&entry.path).unwrap()), ImageSignature::Jpeg);
    }

    #[tokio::test]
    async fn test_html_body_is_rejected() {
        let url = media_url(Media::new(b"<html>blocked</html>".to_vec(), "text/html"), "v.mp4").await;

        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(dir.path(), test_config());
        let result = downloads
            .fetch(
                CacheKey::new(Platform::Douyin, "1", 0),
                &MediaItem::video(url),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(DownloadError::UpstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn test_size_limit() {
        let url = media_url(Media::new(payload(2 * 1024 * 1024), "video/mp4"), "v.mp4").await;

        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(
            dir.path(),
            PipelineConfig {
                max_video_size_mb: 1,
                ..test_config()
            },
        );
        let result = downloads
            .fetch(
                CacheKey::new(Platform::Twitter, "20", 0),
                &MediaItem::video(url),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(DownloadError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn test_cancellation_removes_scratch_files() {
        let mut media = Media::new(payload(1024), "video/mp4");
        media.delay = Duration::from_secs(3);
        let url = media_url(media, "v.mp4").await;

        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(dir.path(), test_config());
        let key = CacheKey::new(Platform::Bilibili, "BV1L9Uoa9EUx", 0);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let result = downloads.fetch(key.clone(), &MediaItem::video(url), &token).await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert_eq!(downloads.state(&key), Some(TransferState::Failed));
        assert!(downloads.store().lookup(&key).await.is_none());
        assert!(no_scratch_files(dir.path()));
    }

    async fn hls_server(hits: Arc<Hits>) -> Url {
        let master = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=500000\nlo/index.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=1500000\nhi/index.m3u8\n";
        let media = "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXTINF:2.0,\nseg0.ts\n#EXTINF:2.0,\nseg1.ts\n#EXTINF:2.0,\nseg2.ts\n#EXT-X-ENDLIST\n";
        let router = Router::new()
            .route("/live/master.m3u8", get(move || async move { master }))
            .route("/live/hi/index.m3u8", get(move || async move { media }))
            .route(
                "/live/hi/{segment}",
                get(|State(hits): State<Arc<Hits>>, Path(segment): Path<String>| async move {
                    hits.segments.fetch_add(1, Ordering::SeqCst);
                    Bytes::from(format!("[{}]", segment))
                }),
            )
            .with_state(hits);
        serve(router).await.join("live/master.m3u8").unwrap()
    }

    #[tokio::test]
    async fn test_hls_download_merges_in_order() {
        let hits = Arc::new(Hits::default());
        let url = hls_server(hits.clone()).await;

        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(dir.path(), test_config());
        let key = CacheKey::new(Platform::Xiaoheihe, "pc:730", 0);
        let item = MediaItem::video(url).with_format(FormatHint::Hls);

        let entry = downloads.fetch(key.clone(), &item, &CancellationToken::new()).await.unwrap();
        assert_eq!(entry.path.extension().unwrap(), "ts");
        assert_eq!(std::fs::read_to_string(&entry.path).unwrap(), "[seg0.ts][seg1.ts][seg2.ts]");
        assert_eq!(hits.segments.load(Ordering::SeqCst), 3);
        assert!(no_scratch_files(dir.path()));

        downloads.fetch(key, &item, &CancellationToken::new()).await.unwrap();
        assert_eq!(hits.segments.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_pre_resolved_segments_skip_playlist() {
        let hits = Arc::new(Hits::default());
        let master = hls_server(hits.clone()).await;
        let segment = |name: &str| master.join(&format!("hi/{}", name)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(dir.path(), test_config());
        let key = CacheKey::new(Platform::Bilibili, "BV1xx411c7mD", 0);
        let item = MediaItem::video(segment("seg2.ts")).with_segments(vec![segment("seg2.ts"), segment("seg0.ts")]);

        let entry = downloads.fetch(key, &item, &CancellationToken::new()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&entry.path).unwrap(), "[seg2.ts][seg0.ts]");
        assert_eq!(hits.segments.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fallback_url_used_when_primary_is_blocked() {
        let jpeg = encode_image(ImageFormat::Jpeg);
        let mirror = media_url(Media::new(jpeg.clone(), "image/jpeg"), "a.jpg").await;
        let blocked = serve(Router::new().route("/a.jpg", get(|| async { StatusCode::FORBIDDEN })))
            .await
            .join("a.jpg")
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(dir.path(), test_config());
        let key = CacheKey::new(Platform::Douyin, "7300000000000000001", 0);
        let item = MediaItem::image(blocked).with_fallbacks([mirror]);

        let entry = downloads.fetch(key.clone(), &item, &CancellationToken::new()).await.unwrap();
        assert_eq!(std::fs::read(&entry.path).unwrap(), jpeg);
        assert_eq!(downloads.state(&key), Some(TransferState::Complete));
    }

    #[tokio::test]
    async fn test_proxy_route_sends_flagged_items_through_platform_proxy() {
        let media = Media::new(encode_image(ImageFormat::Jpeg), "image/jpeg");
        let hits = media.hits.clone();
        // Plain http through a local forward proxy stands in for the image cdn.
        let proxy = media_url(media, "unused").await;
        let proxy = format!("http://{}:{}", proxy.host_str().unwrap(), proxy.port().unwrap());

        let config = PipelineConfig {
            platform_proxy: Some(proxy.clone()),
            proxy_routes: ProxyRoutes {
                twitter_image: true,
                ..Default::default()
            },
            ..test_config()
        };
        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(dir.path(), config.clone())
            .with_proxied_client(HttpService::with_proxy(&config, &proxy).unwrap().client().clone());

        let item = MediaItem::image(Url::parse("http://pbs.twimg.com/media/ok.jpg").unwrap()).requiring_proxy();
        let entry = downloads
            .fetch(CacheKey::new(Platform::Twitter, "20", 0), &item, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(hits.gets.load(Ordering::SeqCst), 1);
        assert_eq!(ImageSignature::detect(&std::fs::read(&entry.path).unwrap()), ImageSignature::Jpeg);
    }

    #[tokio::test]
    async fn test_transfer_outlives_dropped_starter() {
        let mut media = Media::new(payload(1024), "video/mp4");
        media.delay = Duration::from_millis(300);
        let hits = media.hits.clone();
        let url = media_url(media, "v.mp4").await;

        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(dir.path(), test_config());
        let key = CacheKey::new(Platform::Twitter, "21", 0);
        let item = MediaItem::video(url);
        let token = CancellationToken::new();

        let starter = tokio::time::timeout(Duration::from_millis(50), downloads.fetch(key.clone(), &item, &token)).await;
        assert!(starter.is_err());
        assert_eq!(downloads.state(&key), Some(TransferState::Fetching));

        let joined = downloads.fetch(key.clone(), &item, &token).await.unwrap();
        assert_eq!(std::fs::read(&joined.path).unwrap(), payload(1024));
        assert_eq!(hits.gets.load(Ordering::SeqCst), 1);
        assert_eq!(downloads.state(&key), Some(TransferState::Complete));
        assert!(no_scratch_files(dir.path()));
    }

    #[tokio::test]
    async fn test_abandoned_transfer_still_finishes() {
        let mut media = Media::new(payload(1024), "video/mp4");
        media.delay = Duration::from_millis(200);
        let url = media_url(media, "v.mp4").await;

        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(dir.path(), test_config());
        let key = CacheKey::new(Platform::Twitter, "22", 0);
        let token = CancellationToken::new();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), downloads.fetch(key.clone(), &MediaItem::video(url), &token))
                .await;
        assert!(abandoned.is_err());

        for _ in 0..60 {
            if downloads.state(&key).is_some_and(|state| state.is_terminal()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(downloads.state(&key), Some(TransferState::Complete));
        assert!(downloads.store().lookup(&key).await.is_some());
        assert!(no_scratch_files(dir.path()));
    }

    #[tokio::test]
    async fn test_joined_waiter_restarts_after_starter_cancels() {
        let mut media = Media::new(payload(1024), "video/mp4");
        media.delay = Duration::from_millis(300);
        let hits = media.hits.clone();
        let url = media_url(media, "v.mp4").await;

        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(dir.path(), test_config());
        let key = CacheKey::new(Platform::Douyin, "7300000000000000002", 0);
        let item = MediaItem::video(url);
        let starter = CancellationToken::new();
        let joiner = CancellationToken::new();

        let canceller = starter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let (first, second) = tokio::join!(downloads.fetch(key.clone(), &item, &starter), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            downloads.fetch(key.clone(), &item, &joiner).await
        });
        assert!(matches!(first, Err(DownloadError::Cancelled)));
        assert_eq!(std::fs::read(&second.unwrap().path).unwrap(), payload(1024));
        assert_eq!(hits.gets.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_finished_states_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut downloads = manager(dir.path(), test_config());
        downloads.max_tracked_states = 3;
        let key = |id: &str| CacheKey::new(Platform::Weibo, id, 0);

        downloads.set_state(&key("a"), TransferState::Complete);
        downloads.set_state(&key("b"), TransferState::Failed);
        downloads.set_state(&key("c"), TransferState::Fetching);
        downloads.set_state(&key("d"), TransferState::Complete);

        assert_eq!(downloads.state(&key("a")), None);
        assert_eq!(downloads.state(&key("b")), None);
        assert_eq!(downloads.state(&key("c")), Some(TransferState::Fetching));
        assert_eq!(downloads.state(&key("d")), Some(TransferState::Complete));
    }

    #[tokio::test]
    async fn test_clean_stale_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let downloads = manager(dir.path(), test_config());
        let key = CacheKey::new(Platform::Weibo, "x", 0);
        downloads.store().prepare(&key).await.unwrap();
        std::fs::write(downloads.store().part_path(&key), b"half").unwrap();

        assert_eq!(downloads.clean_stale().await.unwrap(), 1);
        assert!(no_scratch_files(dir.path()));
    }
}
