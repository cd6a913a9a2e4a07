use async_trait::async_trait;
use url::Url;

use super::{Platform, PlatformError, ResolvedIdentity, ResolvedMedia};

#[async_trait]
pub trait PlatformCapability: Send + Sync {
    fn platform(&self) -> Platform;

    fn platform_name(&self) -> &str {
        self.platform().display_name()
    }

    /// Links of this platform found in free text, as `(byte offset, link)`.
    fn find_links(&self, text: &str) -> Vec<(usize, String)>;

    /// Whether the link has to go through redirect expansion first.
    fn is_short_link(&self, url: &Url) -> bool;

    fn extract_identity(&self, url: &Url) -> Result<ResolvedIdentity, PlatformError>;

    async fn fetch_media(&self, identity: &ResolvedIdentity) -> Result<ResolvedMedia, PlatformError>;
}
