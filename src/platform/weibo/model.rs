use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub ok: i64,
    #[serde(default)]
    pub msg: String,
    pub data: Option<Status>,
}

#[derive(Debug, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub text: String,
    pub created_at: Option<String>,
    pub user: Option<User>,
    #[serde(default)]
    pub pics: Vec<Pic>,
    pub page_info: Option<PageInfo>,
    pub retweeted_status: Option<Box<Status>>,
}

impl Status {
    /// `Sat Oct 18 12:00:00 +0800 2025`
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.created_at.as_deref()?;
        DateTime::parse_from_str(raw, "%a %b %d %H:%M:%S %z %Y")
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn has_media(&self) -> bool {
        !self.pics.is_empty() || self.page_info.as_ref().and_then(|p| p.media_info.as_ref()).is_some()
    }
}

#[derive(Debug, Deserialize)]
pub struct User {
    pub screen_name: String,
}

#[derive(Debug, Deserialize)]
pub struct Pic {
    pub url: String,
    pub large: Option<PicVariant>,
}

impl Pic {
    pub fn best_url(&self) -> &str {
        self.large.as_ref().map(|l| l.url.as_str()).unwrap_or(&self.url)
    }
}

#[derive(Debug, Deserialize)]
pub struct PicVariant {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct PageInfo {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub media_info: Option<MediaInfo>,
}

/// Stream urls, listed from best to worst. Missing streams come back as empty strings.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MediaInfo {
    pub mp4_720p_mp4: String,
    pub mp4_hd_url: String,
    pub stream_url_hd: String,
    pub mp4_sd_url: String,
    pub stream_url: String,
}

impl MediaInfo {
    pub fn best_url(&self) -> Option<&str> {
        [
            &self.mp4_720p_mp4,
            &self.mp4_hd_url,
            &self.stream_url_hd,
            &self.mp4_sd_url,
            &self.stream_url,
        ]
        .into_iter()
        .map(String::as_str)
        .find(|url| !url.is_empty())
    }
}
