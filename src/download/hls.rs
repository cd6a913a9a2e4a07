use std::path::{Path, PathBuf};

use futures::{future::BoxFuture, stream, FutureExt, StreamExt, TryStreamExt};
use m3u8_rs::{KeyMethod, MasterPlaylist, MediaPlaylist, Playlist};
use reqwest::{header::HeaderMap, Client, StatusCode};
use tokio::{fs::File, io::AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    platform::{pick_best, QualityHint},
    utils::retry::{is_retryable_reqwest_error, retry_with_backoff, RetryAction, RetryPolicy},
};

use super::DownloadError;

/// Segment urls of one media playlist, in play order. The init section, if any, comes first.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentPlan {
    pub pieces: Vec<Url>,
}

async fn fetch_bytes(
    client: &Client,
    url: &Url,
    headers: &HeaderMap,
    policy: &RetryPolicy,
    token: &CancellationToken,
) -> Result<Vec<u8>, DownloadError> {
    retry_with_backoff(policy, token, |_| async move {
        let response = match client.get(url.as_str()).headers(headers.clone()).send().await {
            Ok(response) => response,
            Err(e) if is_retryable_reqwest_error(&e) => return RetryAction::Retry(e.into()),
            Err(e) => return RetryAction::Fail(e.into()),
        };
        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return RetryAction::Retry(DownloadError::UpstreamUnavailable(format!("{} returned {}", url, status)));
        }
        if !status.is_success() {
            return RetryAction::Fail(DownloadError::PartialTransfer(format!("{} returned {}", url, status)));
        }
        match response.bytes().await {
            Ok(bytes) if bytes.is_empty() => {
                RetryAction::Fail(DownloadError::PartialTransfer(format!("{} is empty", url)))
            }
            Ok(bytes) => RetryAction::Success(bytes.to_vec()),
            Err(e) => RetryAction::Retry(e.into()),
        }
    })
    .await
}

fn parse(bytes: &[u8], url: &Url) -> Result<Playlist, DownloadError> {
    m3u8_rs::parse_playlist_res(bytes)
        .map_err(|e| DownloadError::UnsupportedFormat(format!("{} is not a playlist: {}", url, e)))
}

/// Highest bandwidth variant, first-listed on a tie. I-frame only variants are skipped.
fn select_variant(master: &MasterPlaylist, base: &Url) -> Result<Url, DownloadError> {
    let variants: Vec<_> = master.variants.iter().filter(|v| !v.is_i_frame).collect();
    let best = pick_best(&variants, |v| QualityHint {
        bandwidth: v.bandwidth,
        ..Default::default()
    })
    .ok_or_else(|| DownloadError::UnsupportedFormat("master playlist has no variants".to_string()))?;
    base.join(&best.uri)
        .map_err(|e| DownloadError::UnsupportedFormat(e.to_string()))
}

fn plan_media(media: &MediaPlaylist, base: &Url) -> Result<SegmentPlan, DownloadError> {
    if media
        .segments
        .iter()
        .filter_map(|segment| segment.key.as_ref())
        .any(|key| key.method != KeyMethod::None)
    {
        return Err(DownloadError::UnsupportedFormat("encrypted playlists are not supported".to_string()));
    }
    if media.segments.is_empty() {
        return Err(DownloadError::UnsupportedFormat("playlist has no segments".to_string()));
    }

    let join = |uri: &str| base.join(uri).map_err(|e| DownloadError::UnsupportedFormat(e.to_string()));
    let mut pieces = Vec::with_capacity(media.segments.len() + 1);
    if let Some(map) = media.segments.iter().find_map(|segment| segment.map.as_ref()) {
        pieces.push(join(&map.uri)?);
    }
    for segment in &media.segments {
        pieces.push(join(&segment.uri)?);
    }
    Ok(SegmentPlan { pieces })
}

/// Resolves `url` down to a media playlist, following one master level.
pub async fn resolve_plan(
    client: &Client,
    url: &Url,
    headers: &HeaderMap,
    policy: &RetryPolicy,
    token: &CancellationToken,
) -> Result<SegmentPlan, DownloadError> {
    let bytes = fetch_bytes(client, url, headers, policy, token).await?;
    match parse(&bytes, url)? {
        Playlist::MediaPlaylist(media) => plan_media(&media, url),
        Playlist::MasterPlaylist(master) => {
            let variant = select_variant(&master, url)?;
            debug!("Selected variant {}", variant);
            let bytes = fetch_bytes(client, &variant, headers, policy, token).await?;
            match parse(&bytes, &variant)? {
                Playlist::MediaPlaylist(media) => plan_media(&media, &variant),
                Playlist::MasterPlaylist(_) => Err(DownloadError::UnsupportedFormat(
                    "variant points at another master playlist".to_string(),
                )),
            }
        }
    }
}

/// Fetches every piece into its own scratch file with bounded concurrency. A piece that
/// cannot be fetched fails the whole stream.
pub async fn fetch_pieces<F>(
    client: &Client,
    plan: &SegmentPlan,
    headers: &HeaderMap,
    piece_path: F,
    concurrency: usize,
    policy: &RetryPolicy,
    token: &CancellationToken,
) -> Result<Vec<PathBuf>, DownloadError>
where
    F: Fn(usize) -> PathBuf,
{
    let fetches: Vec<BoxFuture<'_, Result<(usize, PathBuf), DownloadError>>> = plan
        .pieces
        .iter()
        .enumerate()
        .map(|(index, url)| {
            let path = piece_path(index);
            async move {
                let bytes = fetch_bytes(client, url, headers, policy, token).await.map_err(|e| match e {
                    DownloadError::Cancelled => DownloadError::Cancelled,
                    e => DownloadError::PartialTransfer(format!("segment {}: {}", index, e)),
                })?;
                tokio::fs::write(&path, &bytes).await?;
                Ok((index, path))
            }
            .boxed()
        })
        .collect();

    let mut paths = stream::iter(fetches)
        .buffer_unordered(concurrency.max(1))
        .try_collect::<Vec<_>>()
        .await?;

    paths.sort_by_key(|(index, _)| *index);
    Ok(paths.into_iter().map(|(_, path)| path).collect())
}

/// Concatenates pieces in order into `target` and removes them.
pub async fn merge_pieces(pieces: &[PathBuf], target: &Path) -> Result<u64, DownloadError> {
    let mut out = File::create(target).await?;
    let mut total = 0;
    for piece in pieces {
        let mut input = File::open(piece).await?;
        total += tokio::io::copy(&mut input, &mut out).await?;
    }
    out.flush().await?;
    for piece in pieces {
        let _ = tokio::fs::remove_file(piece).await;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://cdn.example.com/live/index.m3u8").unwrap()
    }

    #[test]
    fn test_select_variant_highest_bandwidth_first_on_tie() {
        let master = b"#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360
low/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1280x720
mid/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1920x1080
high/index.m3u8
";
        let Playlist::MasterPlaylist(master) = parse(master, &base()).unwrap() else {
            panic!("expected master playlist");
        };
        let variant = select_variant(&master, &base()).unwrap();
        assert_eq!(variant.as_str(), "https://cdn.example.com/live/mid/index.m3u8");
    }

    #[test]
    fn test_plan_media_puts_init_first() {
        let media = b"#EXTM3U
#EXT-X-VERSION:7
#EXT-X-TARGETDURATION:4
#EXT-X-MAP:URI=\"init.mp4\"
#EXTINF:4.0,
seg0.m4s
#EXTINF:4.0,
seg1.m4s
#EXT-X-ENDLIST
";
        let Playlist::MediaPlaylist(media) = parse(media, &base()).unwrap() else {
            panic!("expected media playlist");
        };
        let plan = plan_media(&media, &base()).unwrap();
        let names: Vec<_> = plan.pieces.iter().map(|u| u.path().rsplit('/').next().unwrap().to_string()).collect();
        assert_eq!(names, vec!["init.mp4", "seg0.m4s", "seg1.m4s"]);
    }

    #[test]
    fn test_plan_media_rejects_encryption() {
        let media = b"#EXTM3U
#EXT-X-TARGETDURATION:4
#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"
#EXTINF:4.0,
seg0.ts
#EXT-X-ENDLIST
";
        let Playlist::MediaPlaylist(media) = parse(media, &base()).unwrap() else {
            panic!("expected media playlist");
        };
        assert!(matches!(plan_media(&media, &base()), Err(DownloadError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse(b"<html></html>", &base()), Err(DownloadError::UnsupportedFormat(_))));
    }
}
