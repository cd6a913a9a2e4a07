mod error;
mod model;
pub mod traits;
mod util;

use std::sync::Arc;

use dashmap::DashMap;

use crate::{config::PipelineConfig, utils::http::HttpService};

pub use error::*;
pub use model::*;
pub use traits::PlatformCapability;
pub use util::*;

pub use bilibili::PlatformBilibili;
pub use douyin::PlatformDouyin;
pub use kuaishou::PlatformKuaishou;
pub use twitter::PlatformTwitter;
pub use weibo::PlatformWeibo;
pub use xiaoheihe::PlatformXiaoheihe;
pub use xiaohongshu::PlatformXiaohongshu;

pub mod bilibili;
pub mod douyin;
pub mod kuaishou;
pub mod twitter;
pub mod weibo;
pub mod xiaoheihe;
pub mod xiaohongshu;

/// Resolvers keyed by platform tag. Dispatch never inspects concrete types.
#[derive(Clone)]
pub struct PlatformRegistry {
    platforms: Arc<DashMap<Platform, Arc<dyn PlatformCapability>>>,
}

impl PlatformRegistry {
    /// Registers a resolver for every platform enabled in `config`.
    pub fn new(config: &PipelineConfig, http_service: &HttpService) -> Result<Self, PlatformError> {
        info!("Initializing platform registry");
        let registry = Self::empty();

        for platform in &config.enabled_platforms {
            let http = match config.parse_proxy(*platform) {
                Some(proxy) => {
                    info!("Routing {} requests through {}", platform, proxy);
                    HttpService::with_proxy(config, proxy)?
                }
                None => http_service.clone(),
            };
            let resolver: Arc<dyn PlatformCapability> = match platform {
                Platform::Bilibili => Arc::new(PlatformBilibili::new(http)?),
                Platform::Douyin => Arc::new(PlatformDouyin::new(http)?),
                Platform::Kuaishou => Arc::new(PlatformKuaishou::new(http)?),
                Platform::Weibo => Arc::new(PlatformWeibo::new(http)?),
                Platform::Xiaohongshu => Arc::new(PlatformXiaohongshu::new(http)?),
                Platform::Xiaoheihe => Arc::new(PlatformXiaoheihe::new(http, config.game_api_token.clone())?),
                Platform::Twitter => Arc::new(PlatformTwitter::new(http, &config.embed_proxy_base)?),
            };
            registry.register(resolver);
        }

        info!("Platform registry initialized with {} platforms", registry.platforms.len());
        Ok(registry)
    }

    pub fn empty() -> Self {
        Self {
            platforms: Arc::new(DashMap::new()),
        }
    }

    pub fn register(&self, resolver: Arc<dyn PlatformCapability>) {
        info!("Registering {} platform", resolver.platform_name());
        self.platforms.insert(resolver.platform(), resolver);
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PlatformCapability>> {
        self.platforms.get(&platform).map(|p| p.value().clone())
    }

    /// Registered platforms in their canonical order.
    pub fn supported_platforms(&self) -> Vec<Platform> {
        Platform::all()
            .iter()
            .copied()
            .filter(|platform| self.platforms.contains_key(platform))
            .collect()
    }

    pub fn resolvers(&self) -> Vec<Arc<dyn PlatformCapability>> {
        self.supported_platforms()
            .into_iter()
            .filter_map(|platform| self.get(platform))
            .collect()
    }
}
