use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters owned by one pipeline and shared with its download manager.
#[derive(Debug, Default)]
pub struct PipelineStats {
    messages: AtomicU64,
    candidates: AtomicU64,
    resolved: AtomicU64,
    failed: AtomicU64,
    direct_urls: AtomicU64,
    cache_hits: AtomicU64,
    downloads: AtomicU64,
    download_failures: AtomicU64,
    bytes_downloaded: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub messages: u64,
    pub candidates: u64,
    pub resolved: u64,
    pub failed: u64,
    pub direct_urls: u64,
    pub cache_hits: u64,
    pub downloads: u64,
    pub download_failures: u64,
    pub bytes_downloaded: u64,
}

impl PipelineStats {
    pub fn record_message(&self, candidates: usize) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.candidates.fetch_add(candidates as u64, Ordering::Relaxed);
    }

    pub fn record_resolved(&self) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_direct_url(&self) {
        self.direct_urls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download(&self, bytes: u64) {
        self.downloads.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_download_failure(&self) {
        self.download_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages: self.messages.load(Ordering::Relaxed),
            candidates: self.candidates.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            direct_urls: self.direct_urls.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            download_failures: self.download_failures.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.messages,
            &self.candidates,
            &self.resolved,
            &self.failed,
            &self.direct_urls,
            &self.cache_hits,
            &self.downloads,
            &self.download_failures,
            &self.bytes_downloaded,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
