use std::{io::SeekFrom, path::Path};

use futures::{future::BoxFuture, stream, FutureExt, StreamExt, TryStreamExt};
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_TYPE, RANGE},
    Client, Response, StatusCode,
};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::utils::retry::{is_retryable_reqwest_error, retry_with_backoff, RetryAction, RetryPolicy};

use super::DownloadError;

/// Partitions smaller than this are not worth a separate request.
pub const MIN_PARTITION_SIZE: u64 = 64 * 1024;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Probe {
    pub length: Option<u64>,
    pub accepts_ranges: bool,
}

impl Probe {
    pub fn supports_partitioning(&self, chunks: usize) -> bool {
        chunks > 1
            && self.accepts_ranges
            && self
                .length
                .is_some_and(|length| length >= chunks as u64 * MIN_PARTITION_SIZE)
    }
}

/// What a request outcome means for the retry loop.
fn classify<T>(result: Result<Response, reqwest::Error>, url: &Url) -> Result<Response, RetryAction<T, DownloadError>> {
    let response = match result {
        Ok(response) => response,
        Err(e) if is_retryable_reqwest_error(&e) => return Err(RetryAction::Retry(e.into())),
        Err(e) => return Err(RetryAction::Fail(e.into())),
    };

    let status = response.status();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(RetryAction::Retry(DownloadError::UpstreamUnavailable(format!(
            "{} returned {}",
            url, status
        ))));
    }
    if !status.is_success() {
        // 403 on a media cdn is a risk control block; retrying only makes it worse.
        return Err(RetryAction::Fail(DownloadError::UpstreamUnavailable(format!(
            "{} returned {}",
            url, status
        ))));
    }
    if let Some(content_type) = response.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        if content_type.starts_with("text/") || content_type.starts_with("application/json") {
            return Err(RetryAction::Fail(DownloadError::UpstreamUnavailable(format!(
                "{} served {} instead of media",
                url, content_type
            ))));
        }
    }
    Ok(response)
}

fn header_u64(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

/// HEAD request for size and range support. Servers that refuse HEAD get an empty probe.
pub async fn probe(
    client: &Client,
    url: &Url,
    headers: &HeaderMap,
    policy: &RetryPolicy,
    token: &CancellationToken,
) -> Result<Probe, DownloadError> {
    retry_with_backoff(policy, token, |_| async move {
        let result = client.head(url.as_str()).headers(headers.clone()).send().await;
        if let Ok(response) = &result {
            if matches!(response.status(), StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED) {
                return RetryAction::Success(Probe::default());
            }
        }
        match classify(result, url) {
            Ok(response) => {
                let headers = response.headers();
                RetryAction::Success(Probe {
                    length: header_u64(headers, CONTENT_LENGTH).filter(|length| *length > 0),
                    accepts_ranges: headers
                        .get(ACCEPT_RANGES)
                        .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"bytes")),
                })
            }
            Err(action) => action,
        }
    })
    .await
}

/// Streams the whole body into `target`, restarting from scratch on a retryable failure.
pub async fn fetch_single(
    client: &Client,
    url: &Url,
    headers: &HeaderMap,
    target: &Path,
    limit: Option<u64>,
    policy: &RetryPolicy,
    token: &CancellationToken,
) -> Result<u64, DownloadError> {
    retry_with_backoff(policy, token, |_| async move {
        let response = match classify(client.get(url.as_str()).headers(headers.clone()).send().await, url) {
            Ok(response) => response,
            Err(action) => return action,
        };
        match stream_to_file(response, target, limit).await {
            Ok(written) => RetryAction::Success(written),
            Err(e) if e.is_retryable() => RetryAction::Retry(e),
            Err(e) => RetryAction::Fail(e),
        }
    })
    .await
}

async fn stream_to_file(response: Response, target: &Path, limit: Option<u64>) -> Result<u64, DownloadError> {
    let expected = response.content_length();
    let mut file = File::create(target).await?;
    let mut body = response.bytes_stream();
    let mut written = 0u64;

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        if let Some(limit) = limit.filter(|limit| written > *limit) {
            return Err(DownloadError::TooLarge { size: written, limit });
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    if expected.is_some_and(|expected| expected != written) {
        return Err(DownloadError::UpstreamUnavailable(format!(
            "body ended after {} of {:?} bytes",
            written, expected
        )));
    }
    Ok(written)
}

/// Inclusive byte ranges covering `0..total`, as even as possible.
pub fn partitions(total: u64, chunks: usize) -> Vec<(u64, u64)> {
    if total == 0 {
        return Vec::new();
    }
    let chunks = (chunks.max(1) as u64).min(total.max(1));
    let size = total.div_ceil(chunks);
    (0..chunks)
        .map(|i| (i * size, ((i + 1) * size).min(total) - 1))
        .filter(|(start, end)| start <= end)
        .collect()
}

/// Fetches `total` bytes as `chunks` concurrent range requests written in place into a
/// pre-sized `target`. One partition failing for good fails the transfer.
pub async fn fetch_ranges(
    client: &Client,
    url: &Url,
    headers: &HeaderMap,
    target: &Path,
    total: u64,
    chunks: usize,
    policy: &RetryPolicy,
    token: &CancellationToken,
) -> Result<u64, DownloadError> {
    let file = File::create(target).await?;
    file.set_len(total).await?;
    drop(file);

    let fetches: Vec<BoxFuture<'_, Result<(), DownloadError>>> = partitions(total, chunks)
        .into_iter()
        .map(|(start, end)| {
            async move {
                retry_with_backoff(policy, token, |_| fetch_partition(client, url, headers, target, start, end))
                    .await
                    .map_err(|e| match e {
                        DownloadError::Cancelled => DownloadError::Cancelled,
                        e => DownloadError::PartialTransfer(format!("bytes {}-{}: {}", start, end, e)),
                    })
            }
            .boxed()
        })
        .collect();
    debug!("Fetching {} in {} partitions", url, fetches.len());

    stream::iter(fetches)
        .buffer_unordered(chunks.max(1))
        .try_collect::<Vec<()>>()
        .await?;

    Ok(total)
}

async fn fetch_partition(
    client: &Client,
    url: &Url,
    headers: &HeaderMap,
    target: &Path,
    start: u64,
    end: u64,
) -> RetryAction<(), DownloadError> {
    let mut headers = headers.clone();
    match HeaderValue::from_str(&format!("bytes={}-{}", start, end)) {
        Ok(range) => headers.insert(RANGE, range),
        Err(e) => return RetryAction::Fail(DownloadError::PartialTransfer(e.to_string())),
    };

    let response = match classify(client.get(url.as_str()).headers(headers).send().await, url) {
        Ok(response) => response,
        Err(action) => return action,
    };
    if response.status() != StatusCode::PARTIAL_CONTENT {
        return RetryAction::Fail(DownloadError::PartialTransfer(format!(
            "expected 206 for range, got {}",
            response.status()
        )));
    }

    match write_at(response, target, start, end - start + 1).await {
        Ok(()) => RetryAction::Success(()),
        Err(e) if e.is_retryable() => RetryAction::Retry(e),
        Err(e) => RetryAction::Fail(e),
    }
}

async fn write_at(response: Response, target: &Path, offset: u64, expected: u64) -> Result<(), DownloadError> {
    let mut file = OpenOptions::new().write(true).open(target).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let mut body = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        if written > expected {
            return Err(DownloadError::PartialTransfer(format!("range overran by {} bytes", written - expected)));
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    if written != expected {
        return Err(DownloadError::UpstreamUnavailable(format!(
            "range ended after {} of {} bytes",
            written, expected
        )));
    }
    Ok(())
}
