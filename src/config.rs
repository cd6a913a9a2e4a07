use std::{path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::platform::{MediaKind, Platform};

pub const DEFAULT_MARKER: &str = "Original link:";
pub const DEFAULT_EMBED_PROXY: &str = "https://api.fxtwitter.com";

const ENV_CACHE_DIR: &str = "LINKSTASH_CACHE_DIR";
const ENV_PRE_DOWNLOAD: &str = "LINKSTASH_PRE_DOWNLOAD";
const ENV_CONCURRENT_CHUNKS: &str = "LINKSTASH_CONCURRENT_CHUNKS";
const ENV_PROXY: &str = "LINKSTASH_PROXY";
const ENV_GAME_API_TOKEN: &str = "LINKSTASH_GAME_API_TOKEN";
const ENV_REQUEST_TIMEOUT: &str = "LINKSTASH_REQUEST_TIMEOUT_SECS";
const ENV_CONNECT_TIMEOUT: &str = "LINKSTASH_CONNECT_TIMEOUT_SECS";
const ENV_MAX_REDIRECTS: &str = "LINKSTASH_MAX_REDIRECTS";
const ENV_MAX_RETRIES: &str = "LINKSTASH_MAX_RETRIES";
const ENV_MAX_VIDEO_SIZE: &str = "LINKSTASH_MAX_VIDEO_SIZE_MB";
const ENV_MARKER: &str = "LINKSTASH_MARKER";
const ENV_AUTO_PARSE: &str = "LINKSTASH_AUTO_PARSE";
const ENV_TRIGGER_KEYWORDS: &str = "LINKSTASH_TRIGGER_KEYWORDS";
const ENV_PLATFORMS: &str = "LINKSTASH_PLATFORMS";
const ENV_EMBED_PROXY: &str = "LINKSTASH_EMBED_PROXY";
const ENV_PLATFORM_PROXY: &str = "LINKSTASH_PLATFORM_PROXY";
const ENV_PROXY_ROUTES: &str = "LINKSTASH_PROXY_ROUTES";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("Out of range: {0}")]
    OutOfRange(String),
    #[error("Invalid proxy url: {0}")]
    InvalidProxy(String),
    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),
    #[error("Unknown proxy route: {0}")]
    UnknownProxyRoute(String),
}

/// Traffic sent through `platform_proxy`. Everything else uses the regular client.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyRoutes {
    pub twitter_parse: bool,
    pub twitter_image: bool,
    pub twitter_video: bool,
    pub xiaoheihe_video: bool,
}

impl ProxyRoutes {
    /// Parses a comma separated list such as `twitter_image,twitter_video`.
    pub fn parse(list: &str) -> Result<Self, ConfigError> {
        let mut routes = Self::default();
        for route in split_list(list) {
            match route.as_str() {
                "twitter_parse" => routes.twitter_parse = true,
                "twitter_image" => routes.twitter_image = true,
                "twitter_video" => routes.twitter_video = true,
                "xiaoheihe_video" => routes.xiaoheihe_video = true,
                _ => return Err(ConfigError::UnknownProxyRoute(route)),
            }
        }
        Ok(routes)
    }

    pub fn media(&self, platform: Platform, kind: MediaKind) -> bool {
        match (platform, kind) {
            (Platform::Twitter, MediaKind::Image) => self.twitter_image,
            (Platform::Twitter, MediaKind::Video) => self.twitter_video,
            (Platform::Xiaoheihe, MediaKind::Video) => self.xiaoheihe_video,
            _ => false,
        }
    }

    pub fn any(&self) -> bool {
        self.twitter_parse || self.twitter_image || self.twitter_video || self.xiaoheihe_video
    }
}

/// Settings for one pipeline instance. Passed explicitly, never stored globally.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Absent means pre-download is impossible; mandatory items then fail.
    pub cache_directory: Option<PathBuf>,
    pub pre_download_enabled: bool,
    pub concurrent_chunks: usize,
    /// Applies to all outbound traffic.
    pub proxy: Option<String>,
    /// Applies only to the traffic switched on in `proxy_routes`.
    pub platform_proxy: Option<String>,
    pub proxy_routes: ProxyRoutes,
    pub game_api_token: Option<String>,
    pub request_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub max_redirects: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// 0 disables the limit.
    pub max_video_size_mb: u64,
    pub marker_text: String,
    pub auto_parse: bool,
    pub trigger_keywords: Vec<String>,
    pub enabled_platforms: Vec<Platform>,
    pub embed_proxy_base: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_directory: None,
            pre_download_enabled: false,
            concurrent_chunks: 4,
            proxy: None,
            platform_proxy: None,
            proxy_routes: ProxyRoutes::default(),
            game_api_token: None,
            request_timeout_seconds: 30,
            connect_timeout_seconds: 10,
            max_redirects: 10,
            max_retries: 3,
            retry_base_delay_ms: 500,
            max_video_size_mb: 0,
            marker_text: DEFAULT_MARKER.to_string(),
            auto_parse: true,
            trigger_keywords: vec!["parse video".to_string()],
            enabled_platforms: Platform::all().to_vec(),
            embed_proxy_base: DEFAULT_EMBED_PROXY.to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        info!("Building PipelineConfig from environment...");
        let mut config = Self::default();

        if let Some(dir) = env_var(ENV_CACHE_DIR) {
            config.cache_directory = Some(PathBuf::from(dir));
        }
        if let Some(flag) = parse_env::<bool>(ENV_PRE_DOWNLOAD)? {
            config.pre_download_enabled = flag;
        }
        if let Some(chunks) = parse_env::<usize>(ENV_CONCURRENT_CHUNKS)? {
            config.concurrent_chunks = chunks;
        }
        config.proxy = env_var(ENV_PROXY);
        config.platform_proxy = env_var(ENV_PLATFORM_PROXY);
        if let Some(routes) = env_var(ENV_PROXY_ROUTES) {
            config.proxy_routes = ProxyRoutes::parse(&routes)?;
        }
        config.game_api_token = env_var(ENV_GAME_API_TOKEN);
        if let Some(secs) = parse_env::<u64>(ENV_REQUEST_TIMEOUT)? {
            config.request_timeout_seconds = secs;
        }
        if let Some(secs) = parse_env::<u64>(ENV_CONNECT_TIMEOUT)? {
            config.connect_timeout_seconds = secs;
        }
        if let Some(hops) = parse_env::<usize>(ENV_MAX_REDIRECTS)? {
            config.max_redirects = hops;
        }
        if let Some(retries) = parse_env::<u32>(ENV_MAX_RETRIES)? {
            config.max_retries = retries;
        }
        if let Some(limit) = parse_env::<u64>(ENV_MAX_VIDEO_SIZE)? {
            config.max_video_size_mb = limit;
        }
        if let Some(marker) = env_var(ENV_MARKER) {
            config.marker_text = marker;
        }
        if let Some(flag) = parse_env::<bool>(ENV_AUTO_PARSE)? {
            config.auto_parse = flag;
        }
        if let Some(keywords) = env_var(ENV_TRIGGER_KEYWORDS) {
            config.trigger_keywords = split_list(&keywords);
        }
        if let Some(platforms) = env_var(ENV_PLATFORMS) {
            config.enabled_platforms = split_list(&platforms)
                .iter()
                .map(|tag| Platform::from_str(tag).map_err(|_| ConfigError::UnknownPlatform(tag.clone())))
                .collect::<Result<Vec<_>, _>>()?;
        }
        if let Some(base) = env_var(ENV_EMBED_PROXY) {
            config.embed_proxy_base = base;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=16).contains(&self.concurrent_chunks) {
            return Err(ConfigError::OutOfRange(format!(
                "concurrent_chunks must be within 1..=16, got {}",
                self.concurrent_chunks
            )));
        }
        if self.request_timeout_seconds == 0 || self.connect_timeout_seconds == 0 {
            return Err(ConfigError::OutOfRange("timeouts must be positive".to_string()));
        }
        if self.max_redirects == 0 {
            return Err(ConfigError::OutOfRange("max_redirects must be positive".to_string()));
        }
        if self.marker_text.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "marker_text",
                value: self.marker_text.clone(),
            });
        }
        for proxy in self.proxy.iter().chain(self.platform_proxy.iter()) {
            let parsed = Url::parse(proxy).map_err(|_| ConfigError::InvalidProxy(proxy.clone()))?;
            if !matches!(parsed.scheme(), "http" | "https" | "socks5" | "socks5h") {
                return Err(ConfigError::InvalidProxy(proxy.clone()));
            }
        }
        if self.proxy_routes.any() && self.platform_proxy.is_none() {
            warn!("Proxy routes are set but no platform proxy is configured, routes are ignored");
        }
        Url::parse(&self.embed_proxy_base).map_err(|_| ConfigError::InvalidValue {
            key: "embed_proxy_base",
            value: self.embed_proxy_base.clone(),
        })?;
        Ok(())
    }

    /// Creates the cache directory. When that fails pre-download is switched off and the
    /// directory is forgotten, so mandatory items surface a configuration error instead.
    pub fn prepare_cache_directory(&mut self) {
        let Some(dir) = &self.cache_directory else {
            return;
        };
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!("Failed to create cache directory {}: {}, pre-download disabled", dir.display(), e);
            self.cache_directory = None;
            self.pre_download_enabled = false;
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn max_video_bytes(&self) -> Option<u64> {
        (self.max_video_size_mb > 0).then(|| self.max_video_size_mb * 1024 * 1024)
    }

    /// The proxy for Twitter metadata requests, when that route is switched on.
    pub fn parse_proxy(&self, platform: Platform) -> Option<&str> {
        self.platform_proxy
            .as_deref()
            .filter(|_| platform == Platform::Twitter && self.proxy_routes.twitter_parse)
    }

    pub fn is_enabled(&self, platform: Platform) -> bool {
        self.enabled_platforms.contains(&platform)
    }

    /// Whether a message should be looked at at all.
    pub fn should_parse(&self, text: &str) -> bool {
        self.auto_parse
            || self
                .trigger_keywords
                .iter()
                .any(|keyword| !keyword.is_empty() && text.contains(keyword.as_str()))
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env_var(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(None),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
