use std::collections::HashSet;

use reqwest::{header::LOCATION, StatusCode};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    config::PipelineConfig,
    matcher::LinkCandidate,
    platform::PlatformRegistry,
    utils::{
        http::HttpService,
        retry::{is_retryable_reqwest_error, retry_with_backoff, Cancellable, RetryAction, RetryPolicy},
    },
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExpandError {
    #[error("Too many redirects after {hops} hops")]
    TooManyRedirects { hops: usize },
    #[error("Redirect without location at {0}")]
    MissingLocation(String),
    #[error("Network error during {stage}: {reason}")]
    Network { stage: &'static str, reason: String },
    #[error("Invalid url: {0}")]
    InvalidUrl(String),
    #[error("Cancelled")]
    Cancelled,
}

impl Cancellable for ExpandError {
    fn cancelled() -> Self {
        Self::Cancelled
    }
}

impl ExpandError {
    fn network(reason: impl ToString) -> Self {
        Self::Network {
            stage: "expand",
            reason: reason.to_string(),
        }
    }
}

enum Hop {
    Redirect(Url),
    Final,
}

/// Follows short-link redirects by hand so every hop is counted and loops are caught.
pub struct ShortLinkExpander {
    http_service: HttpService,
    registry: PlatformRegistry,
    max_redirects: usize,
    retry: RetryPolicy,
}

impl ShortLinkExpander {
    /// `http_service` must not follow redirects itself.
    pub fn new(http_service: HttpService, registry: PlatformRegistry, config: &PipelineConfig) -> Self {
        Self {
            http_service,
            registry,
            max_redirects: config.max_redirects,
            retry: RetryPolicy::from_config(config),
        }
    }

    pub async fn expand(&self, candidate: &LinkCandidate, token: &CancellationToken) -> Result<Url, ExpandError> {
        let url = Url::parse(&candidate.raw).map_err(|_| ExpandError::InvalidUrl(candidate.raw.clone()))?;

        let is_short = self
            .registry
            .get(candidate.platform)
            .is_some_and(|resolver| resolver.is_short_link(&url));
        if !is_short {
            return Ok(url);
        }

        let expanded = self.follow(url, token).await?;
        info!("Expanded {} -> {}", candidate.raw, expanded);
        Ok(expanded)
    }

    async fn follow(&self, start: Url, token: &CancellationToken) -> Result<Url, ExpandError> {
        let mut visited = HashSet::from([start.clone()]);
        let mut current = start;
        let mut hops = 0;

        loop {
            let hop = retry_with_backoff(&self.retry, token, |_| self.probe(&current)).await?;
            let next = match hop {
                Hop::Final => return Ok(current),
                Hop::Redirect(next) => next,
            };

            hops += 1;
            if hops > self.max_redirects || !visited.insert(next.clone()) {
                warn!("Redirect chain from {} exceeded {} hops or looped", current, self.max_redirects);
                return Err(ExpandError::TooManyRedirects { hops });
            }
            debug!("Hop {}: {}", hops, next);
            current = next;
        }
    }

    async fn probe(&self, url: &Url) -> RetryAction<Hop, ExpandError> {
        let response = match self.http_service.client().get(url.as_str()).send().await {
            Ok(response) => response,
            Err(e) if is_retryable_reqwest_error(&e) => return RetryAction::Retry(ExpandError::network(e)),
            Err(e) => return RetryAction::Fail(ExpandError::network(e)),
        };

        let status = response.status();
        if status.is_redirection() && status != StatusCode::NOT_MODIFIED {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok());
            return match location.map(|location| url.join(location)) {
                Some(Ok(next)) => RetryAction::Success(Hop::Redirect(next)),
                Some(Err(e)) => RetryAction::Fail(ExpandError::InvalidUrl(e.to_string())),
                None => RetryAction::Fail(ExpandError::MissingLocation(url.to_string())),
            };
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return RetryAction::Retry(ExpandError::network(format!("{} returned {}", url, status)));
        }
        RetryAction::Success(Hop::Final)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use axum::{
        extract::{Path, State},
        http::{header, StatusCode},
        response::{IntoResponse, Redirect},
        routing::get,
        Router,
    };

    use super::*;
    use crate::{
        matcher::LinkSource,
        platform::{Platform, PlatformCapability, PlatformError, ResolvedIdentity, ResolvedMedia},
        utils::test::test_config,
    };

    /// Treats every link on the test server as a short link.
    struct LocalShortener;

    #[async_trait::async_trait]
    impl PlatformCapability for LocalShortener {
        fn platform(&self) -> Platform {
            Platform::Bilibili
        }

        fn find_links(&self, _text: &str) -> Vec<(usize, String)> {
            Vec::new()
        }

        fn is_short_link(&self, url: &Url) -> bool {
            url.path().starts_with("/s/")
        }

        fn extract_identity(&self, url: &Url) -> Result<ResolvedIdentity, PlatformError> {
            Err(PlatformError::InvalidUrl(url.to_string()))
        }

        async fn fetch_media(&self, _identity: &ResolvedIdentity) -> Result<ResolvedMedia, PlatformError> {
            Err(PlatformError::NotFound(String::new()))
        }
    }

    async fn expander(router: Router) -> (ShortLinkExpander, Url) {
        let base = crate::utils::test::serve(router).await;
        let config = test_config();
        let registry = PlatformRegistry::empty();
        registry.register(Arc::new(LocalShortener));
        let http = HttpService::without_redirects(&config).unwrap();
        (ShortLinkExpander::new(http, registry, &config), base)
    }

    fn candidate(raw: String) -> LinkCandidate {
        LinkCandidate {
            platform: Platform::Bilibili,
            raw,
            source: LinkSource::Text,
            position: 0,
        }
    }

    #[tokio::test]
    async fn test_expand_follows_chain() {
        let router = Router::new()
            .route("/s/a", get(|| async { Redirect::temporary("/s/b") }))
            .route("/s/b", get(|| async { Redirect::permanent("/video/BV1xx411c7mD?p=2") }))
            .route("/video/{id}", get(|| async { "ok" }));
        let (expander, base) = expander(router).await;

        let url = expander
            .expand(&candidate(format!("{}s/a", base)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(url.path(), "/video/BV1xx411c7mD");
        assert_eq!(url.query(), Some("p=2"));
    }

    #[tokio::test]
    async fn test_expand_passes_long_links_through() {
        let (expander, base) = expander(Router::new()).await;
        let raw = format!("{}video/BV1xx411c7mD", base);
        let url = expander.expand(&candidate(raw.clone()), &CancellationToken::new()).await.unwrap();
        assert_eq!(url.as_str(), raw);
    }

    #[tokio::test]
    async fn test_expand_detects_loop() {
        let router = Router::new()
            .route("/s/a", get(|| async { Redirect::temporary("/s/b") }))
            .route("/s/b", get(|| async { Redirect::temporary("/s/a") }));
        let (expander, base) = expander(router).await;

        let result = expander
            .expand(&candidate(format!("{}s/a", base)), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ExpandError::TooManyRedirects { hops: 2 })));
    }

    #[tokio::test]
    async fn test_expand_caps_hops() {
        let router = Router::new().route(
            "/s/{n}",
            get(|Path(n): Path<u32>| async move { Redirect::temporary(&format!("/s/{}", n + 1)) }),
        );
        let (expander, base) = expander(router).await;

        let result = expander
            .expand(&candidate(format!("{}s/0", base)), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ExpandError::TooManyRedirects { hops: 11 })));
    }

    #[tokio::test]
    async fn test_expand_missing_location() {
        let router = Router::new().route("/s/a", get(|| async { StatusCode::FOUND }));
        let (expander, base) = expander(router).await;

        let result = expander
            .expand(&candidate(format!("{}s/a", base)), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ExpandError::MissingLocation(_))));
    }

    #[tokio::test]
    async fn test_expand_retries_server_errors() {
        let hits = Arc::new(AtomicU32::new(0));
        let router = Router::new()
            .route(
                "/s/a",
                get(|State(hits): State<Arc<AtomicU32>>| async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        StatusCode::BAD_GATEWAY.into_response()
                    } else {
                        (StatusCode::FOUND, [(header::LOCATION, "/final")]).into_response()
                    }
                }),
            )
            .with_state(hits.clone());
        let (expander, base) = expander(router).await;

        let url = expander
            .expand(&candidate(format!("{}s/a", base)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(url.path(), "/final");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expand_cancelled() {
        let (expander, base) = expander(Router::new()).await;
        let token = CancellationToken::new();
        token.cancel();
        let result = expander.expand(&candidate(format!("{}s/a", base)), &token).await;
        assert!(matches!(result, Err(ExpandError::Cancelled)));
    }
}
