pub mod http;
pub mod retry;

use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};

/// Stable, filesystem safe digest of a resource id.
pub fn hash_id(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    hex::encode(&digest[..8])
}

/// Cuts text to at most `max` characters, appending an ellipsis when something was dropped.
pub fn truncate_chars(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push('…');
    out
}

pub fn timestamp_to_datetime(secs: i64) -> Option<DateTime<Utc>> {
    // Some APIs hand out milliseconds.
    let secs = if secs > 10_000_000_000 { secs / 1000 } else { secs };
    Utc.timestamp_opt(secs, 0).single()
}
