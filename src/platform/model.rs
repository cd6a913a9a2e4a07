use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::PlatformError;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Bilibili,
    Douyin,
    Kuaishou,
    Weibo,
    Xiaohongshu,
    Xiaoheihe,
    Twitter,
}

impl Platform {
    pub const fn all() -> &'static [Platform] {
        &[
            Self::Bilibili,
            Self::Douyin,
            Self::Kuaishou,
            Self::Weibo,
            Self::Xiaohongshu,
            Self::Xiaoheihe,
            Self::Twitter,
        ]
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Bilibili => "bilibili",
            Self::Douyin => "douyin",
            Self::Kuaishou => "kuaishou",
            Self::Weibo => "weibo",
            Self::Xiaohongshu => "xiaohongshu",
            Self::Xiaoheihe => "xiaoheihe",
            Self::Twitter => "twitter",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Bilibili => "Bilibili",
            Self::Douyin => "Douyin",
            Self::Kuaishou => "Kuaishou",
            Self::Weibo => "Weibo",
            Self::Xiaohongshu => "Xiaohongshu",
            Self::Xiaoheihe => "Xiaoheihe",
            Self::Twitter => "Twitter",
        }
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Platform {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bilibili" => Ok(Self::Bilibili),
            "douyin" => Ok(Self::Douyin),
            "kuaishou" => Ok(Self::Kuaishou),
            "weibo" => Ok(Self::Weibo),
            "xiaohongshu" | "xhs" => Ok(Self::Xiaohongshu),
            "xiaoheihe" => Ok(Self::Xiaoheihe),
            "twitter" | "x" => Ok(Self::Twitter),
            _ => Err(PlatformError::InvalidPlatform(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Post,
    Video,
    ImageSet,
    Repost,
    GameDetail,
}

/// Canonical identity of a resource. Two links naming the same resource resolve to equal
/// identities, which is what per-message deduplication keys on.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub platform: Platform,
    pub id: String,
    pub kind: ResourceKind,
}

impl ResolvedIdentity {
    pub fn new(platform: Platform, id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            platform,
            id: id.into(),
            kind,
        }
    }

    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.platform, self.id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Image,
}

impl Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FormatHint {
    Mp4,
    Dash,
    Hls,
    Jpeg,
    Png,
    Webp,
    Gif,
    Heic,
    Unknown,
}

impl FormatHint {
    /// Guesses the container from the url path extension.
    pub fn from_url(url: &Url) -> Self {
        let path = url.path().to_ascii_lowercase();
        let ext = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
        match ext {
            "m3u8" => Self::Hls,
            "mp4" | "mov" => Self::Mp4,
            "m4s" => Self::Dash,
            "jpg" | "jpeg" => Self::Jpeg,
            "png" => Self::Png,
            "webp" => Self::Webp,
            "gif" => Self::Gif,
            "heic" | "heif" => Self::Heic,
            _ => Self::Unknown,
        }
    }

    pub fn is_segmented(&self) -> bool {
        matches!(self, Self::Hls)
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::Jpeg | Self::Png | Self::Webp | Self::Gif | Self::Heic)
    }
}

/// Ranking input for picking between quality variants of the same media.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QualityHint {
    pub id: u32,
    pub bandwidth: u64,
    pub width: u32,
    pub height: u32,
}

impl QualityHint {
    pub fn rank(&self) -> (u32, u64, u64) {
        (self.id, self.bandwidth, self.width as u64 * self.height as u64)
    }
}

/// Picks the highest ranked variant. On a full tie the first-listed variant wins.
pub fn pick_best<T, F>(variants: &[T], rank: F) -> Option<&T>
where
    F: Fn(&T) -> QualityHint,
{
    let mut best: Option<(&T, (u32, u64, u64))> = None;
    for variant in variants {
        let current = rank(variant).rank();
        match best {
            Some((_, best_rank)) if current <= best_rank => {}
            _ => best = Some((variant, current)),
        }
    }
    best.map(|(variant, _)| variant)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaItem {
    pub kind: MediaKind,
    pub url: Url,
    /// Mirrors of `url`, tried in order when it cannot be fetched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_urls: Vec<Url>,
    /// Headers the platform requires when the url is fetched (referer, user agent, ...).
    pub headers: BTreeMap<String, String>,
    pub format: FormatHint,
    pub range_capable: Option<bool>,
    /// Chunk urls in play order, when the resolver already knows them.
    pub segments: Option<Vec<Url>>,
    pub quality: Option<QualityHint>,
    pub may_require_proxy: bool,
}

impl MediaItem {
    pub fn new(kind: MediaKind, url: Url) -> Self {
        let format = FormatHint::from_url(&url);
        Self {
            kind,
            url,
            fallback_urls: Vec::new(),
            headers: BTreeMap::new(),
            format,
            range_capable: None,
            segments: None,
            quality: None,
            may_require_proxy: false,
        }
    }

    pub fn video(url: Url) -> Self {
        Self::new(MediaKind::Video, url)
    }

    pub fn image(url: Url) -> Self {
        Self::new(MediaKind::Image, url)
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    pub fn with_format(mut self, format: FormatHint) -> Self {
        self.format = format;
        self
    }

    pub fn with_quality(mut self, quality: QualityHint) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn requiring_proxy(mut self) -> Self {
        self.may_require_proxy = true;
        self
    }

    pub fn with_fallbacks(mut self, urls: impl IntoIterator<Item = Url>) -> Self {
        self.fallback_urls.extend(urls.into_iter().filter(|url| *url != self.url));
        self
    }

    pub fn with_segments(mut self, segments: Vec<Url>) -> Self {
        self.segments = Some(segments);
        self
    }

    /// Whether the item is fetched piecewise and joined locally.
    pub fn is_segmented(&self) -> bool {
        self.format.is_segmented() || self.segments.as_ref().is_some_and(|segments| !segments.is_empty())
    }

    /// The primary url followed by its fallbacks.
    pub fn urls(&self) -> impl Iterator<Item = &Url> {
        std::iter::once(&self.url).chain(self.fallback_urls.iter())
    }
}

/// Human readable part of a resolved post.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PostText {
    pub title: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    /// Extra `label: value` lines, e.g. game prices.
    pub extra: Vec<String>,
    pub forwarded: Option<Box<PostText>>,
}

impl PostText {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.author.is_none()
            && self.description.is_none()
            && self.published_at.is_none()
            && self.extra.is_empty()
            && self.forwarded.is_none()
    }

    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        self.render_into(&mut lines, "");
        lines.join("\n")
    }

    fn render_into(&self, lines: &mut Vec<String>, indent: &str) {
        if let Some(title) = non_empty(&self.title) {
            lines.push(format!("{}Title: {}", indent, title));
        }
        if let Some(author) = non_empty(&self.author) {
            lines.push(format!("{}Author: {}", indent, author));
        }
        if let Some(description) = non_empty(&self.description) {
            lines.push(format!("{}Description: {}", indent, description));
        }
        if let Some(published_at) = self.published_at {
            lines.push(format!("{}Published: {}", indent, published_at.format("%Y-%m-%d %H:%M")));
        }
        for line in &self.extra {
            lines.push(format!("{}{}", indent, line));
        }
        if let Some(forwarded) = &self.forwarded {
            lines.push(format!("{}Forwarded:", indent));
            forwarded.render_into(lines, &format!("{}  ", indent));
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResolvedMedia {
    pub items: Vec<MediaItem>,
    pub post: PostText,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_from_str() {
        assert_eq!("bilibili".parse::<Platform>().unwrap(), Platform::Bilibili);
        assert_eq!("X".parse::<Platform>().unwrap(), Platform::Twitter);
        assert!("instagram".parse::<Platform>().is_err());
        for platform in Platform::all() {
            assert_eq!(platform.tag().parse::<Platform>().unwrap(), *platform);
        }
    }

    #[test]
    fn test_format_from_url() {
        let url = |s: &str| Url::parse(s).unwrap();
        assert_eq!(FormatHint::from_url(&url("https://a.com/x/index.m3u8?t=1")), FormatHint::Hls);
        assert_eq!(FormatHint::from_url(&url("https://a.com/v.MP4")), FormatHint::Mp4);
        assert_eq!(FormatHint::from_url(&url("https://a.com/p.webp")), FormatHint::Webp);
        assert_eq!(FormatHint::from_url(&url("https://a.com/aweme/v1/play/")), FormatHint::Unknown);
        assert!(FormatHint::Hls.is_segmented());
        assert!(!FormatHint::Mp4.is_segmented());
    }

    #[test]
    fn test_pick_best_prefers_first_listed_on_tie() {
        let variants = vec![
            ("a", QualityHint { id: 80, bandwidth: 100, ..Default::default() }),
            ("b", QualityHint { id: 116, bandwidth: 50, ..Default::default() }),
            ("c", QualityHint { id: 116, bandwidth: 50, ..Default::default() }),
            ("d", QualityHint { id: 112, bandwidth: 999, ..Default::default() }),
        ];
        let best = pick_best(&variants, |(_, q)| *q).unwrap();
        assert_eq!(best.0, "b");
        assert!(pick_best(&Vec::<(&str, QualityHint)>::new(), |(_, q)| *q).is_none());
    }

    #[test]
    fn test_pick_best_uses_bandwidth_then_area() {
        let variants = vec![
            QualityHint { id: 0, bandwidth: 800, width: 640, height: 360 },
            QualityHint { id: 0, bandwidth: 800, width: 1280, height: 720 },
            QualityHint { id: 0, bandwidth: 600, width: 1920, height: 1080 },
        ];
        let best = pick_best(&variants, |q| *q).unwrap();
        assert_eq!(best.width, 1280);
    }

    #[test]
    fn test_post_text_render_nests_forwarded() {
        let post = PostText {
            title: Some("hello".to_string()),
            author: Some("alice".to_string()),
            description: Some("  ".to_string()),
            forwarded: Some(Box::new(PostText {
                author: Some("bob".to_string()),
                description: Some("original".to_string()),
                ..Default::default()
            })),
            ..Default::default()
        };
        assert_eq!(
            post.render(),
            "Title: hello\nAuthor: alice\nForwarded:\n  Author: bob\n  Description: original"
        );
    }

    #[test]
    fn test_media_item_urls_and_segments() {
        let url = |s: &str| Url::parse(s).unwrap();
        let item = MediaItem::image(url("https://p3.example.com/a.jpg"))
            .with_fallbacks([url("https://p3.example.com/a.jpg"), url("https://p9.example.com/a.jpg")]);
        let urls: Vec<_> = item.urls().map(Url::as_str).collect();
        assert_eq!(urls, vec!["https://p3.example.com/a.jpg", "https://p9.example.com/a.jpg"]);
        assert!(!item.is_segmented());

        let item = MediaItem::video(url("https://cdn.example.com/v/part0.flv"))
            .with_segments(vec![url("https://cdn.example.com/v/part0.flv"), url("https://cdn.example.com/v/part1.flv")]);
        assert!(item.is_segmented());
        assert!(!MediaItem::video(url("https://cdn.example.com/v.mp4")).with_segments(Vec::new()).is_segmented());
    }

    #[test]
    fn test_identity_cache_key() {
        let identity = ResolvedIdentity::new(Platform::Douyin, "7301234567890123456", ResourceKind::Video);
        assert_eq!(identity.cache_key(), "douyin:7301234567890123456");
    }
}
