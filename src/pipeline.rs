use std::{collections::HashSet, sync::Arc};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    assembler::{DeliveredItem, ItemFailure, MediaReference, ReplyPayload, ResolutionResult, ResultAssembler},
    config::PipelineConfig,
    delivery::{DeliveryDecision, DeliveryError, DeliveryMode, DeliveryPolicy},
    download::{CacheKey, DownloadError, DownloadManager},
    error::{PipelineError, PipelineResult},
    expander::ShortLinkExpander,
    matcher::{LinkCandidate, LinkMatcher},
    message::MessagePayload,
    platform::{MediaItem, PlatformCapability, PlatformError, PlatformRegistry, ResolvedIdentity, ResourceKind},
    state::{PipelineStats, StatsSnapshot},
    utils::http::HttpService,
};

/// Everything produced for one message, before it is turned into a reply.
#[derive(Debug, Default)]
pub struct MessageOutcome {
    /// Tags every log line written for this message.
    pub message_id: String,
    pub results: Vec<ResolutionResult>,
    pub delivered: Vec<DeliveredItem>,
}

struct Identified {
    candidate: LinkCandidate,
    resolver: Arc<dyn PlatformCapability>,
    identity: ResolvedIdentity,
}

pub struct Pipeline {
    config: PipelineConfig,
    registry: PlatformRegistry,
    matcher: LinkMatcher,
    expander: ShortLinkExpander,
    delivery: DeliveryPolicy,
    downloads: Option<DownloadManager>,
    assembler: ResultAssembler,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub async fn new(config: PipelineConfig) -> PipelineResult<Self> {
        config.validate()?;
        let http_service = HttpService::new(&config)?;
        let registry = PlatformRegistry::new(&config, &http_service)?;
        Self::with_registry(config, registry).await
    }

    /// Builds a pipeline around an existing set of resolvers.
    pub async fn with_registry(mut config: PipelineConfig, registry: PlatformRegistry) -> PipelineResult<Self> {
        config.validate()?;
        config.prepare_cache_directory();

        let stats = Arc::new(PipelineStats::default());
        let downloads = match &config.cache_directory {
            Some(dir) => {
                let mut manager = DownloadManager::new(
                    HttpService::new(&config)?.client().clone(),
                    dir.clone(),
                    &config,
                    stats.clone(),
                );
                if let Some(proxy) = &config.platform_proxy {
                    manager = manager.with_proxied_client(HttpService::with_proxy(&config, proxy)?.client().clone());
                }
                if let Err(e) = manager.clean_stale().await {
                    warn!("Failed to clean stale files in {}: {}", dir.display(), e);
                }
                Some(manager)
            }
            None => {
                info!("No cache directory configured, pre-download disabled");
                None
            }
        };

        let expander = ShortLinkExpander::new(HttpService::without_redirects(&config)?, registry.clone(), &config);

        Ok(Self {
            matcher: LinkMatcher::new(registry.clone(), &config),
            expander,
            delivery: DeliveryPolicy::new(&config),
            downloads,
            assembler: ResultAssembler::new(config.marker_text.clone()),
            registry,
            stats,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &PlatformRegistry {
        &self.registry
    }

    pub fn downloads(&self) -> Option<&DownloadManager> {
        self.downloads.as_ref()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Resolves every link in `message` and builds the reply. `None` means there was nothing
    /// to answer.
    pub async fn handle(&self, message: &MessagePayload, token: &CancellationToken) -> Option<ReplyPayload> {
        let outcome = self.process(message, token).await;
        self.assembler.assemble(&outcome.results, &outcome.delivered)
    }

    pub async fn process(&self, message: &MessagePayload, token: &CancellationToken) -> MessageOutcome {
        let candidates = self.matcher.extract(message);
        if candidates.is_empty() {
            return MessageOutcome::default();
        }
        self.stats.record_message(candidates.len());
        let message_id = Uuid::new_v4().to_string();
        info!("[{}] Processing {} link(s)", message_id, candidates.len());

        let identified = join_all(candidates.into_iter().map(|candidate| self.identify(candidate, token))).await;

        // Links naming a resource already seen in this message are dropped.
        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        for entry in identified {
            match entry {
                Ok(identified) if !seen.insert(identified.identity.clone()) => {
                    debug!("[{}] Dropping duplicate {}", message_id, identified.candidate.raw);
                }
                entry => pending.push(entry),
            }
        }

        let resolved = join_all(pending.into_iter().map(|entry| async move {
            match entry {
                Ok(identified) => self.resolve(identified, token).await,
                Err(failed) => (failed, Vec::new()),
            }
        }))
        .await;

        let mut outcome = MessageOutcome {
            message_id,
            ..Default::default()
        };
        for (index, (result, references)) in resolved.into_iter().enumerate() {
            match &result.outcome {
                Ok(()) => self.stats.record_resolved(),
                Err(e) => {
                    warn!("[{}] {} failed at {:?}: {}", outcome.message_id, result.candidate.raw, e.stage(), e);
                    self.stats.record_failed();
                }
            }
            outcome
                .delivered
                .extend(references.into_iter().map(|(item_index, reference)| DeliveredItem {
                    result_index: index,
                    item_index,
                    reference,
                }));
            outcome.results.push(result);
        }
        outcome
    }

    async fn identify(&self, candidate: LinkCandidate, token: &CancellationToken) -> Result<Identified, ResolutionResult> {
        let Some(resolver) = self.registry.get(candidate.platform) else {
            let error = PlatformError::InvalidPlatform(candidate.platform.to_string());
            return Err(ResolutionResult::failed(candidate, None, error.into()));
        };

        let url = match self.expander.expand(&candidate, token).await {
            Ok(url) => url,
            Err(e) => return Err(ResolutionResult::failed(candidate, None, e.into())),
        };
        match resolver.extract_identity(&url) {
            Ok(identity) => Ok(Identified {
                candidate,
                resolver,
                identity,
            }),
            Err(e) => Err(ResolutionResult::failed(candidate, None, e.into())),
        }
    }

    async fn resolve(
        &self,
        identified: Identified,
        token: &CancellationToken,
    ) -> (ResolutionResult, Vec<(usize, MediaReference)>) {
        let Identified {
            candidate,
            resolver,
            mut identity,
        } = identified;
        info!("Resolving {} as {}", candidate.raw, identity.cache_key());

        let media = tokio::select! {
            _ = token.cancelled() => Err(PipelineError::from(DownloadError::Cancelled)),
            media = resolver.fetch_media(&identity) => media.map_err(PipelineError::from),
        };
        let media = match media {
            Ok(media) => media,
            Err(e) => return (ResolutionResult::failed(candidate, Some(identity), e), Vec::new()),
        };

        if identity.kind == ResourceKind::Post && media.post.forwarded.is_some() {
            identity.kind = ResourceKind::Repost;
        }

        let rendered = media.post.render();
        let text = if rendered.is_empty() {
            format!("[{}]", resolver.platform_name())
        } else {
            format!("[{}]\n{}", resolver.platform_name(), rendered)
        };

        let (references, mut failed_items) = self.deliver(&identity, &media.items, token).await;
        // A game detail is still worth its text when the trailer is unavailable.
        if references.is_empty() && !failed_items.is_empty() && identity.kind != ResourceKind::GameDetail {
            let error = failed_items.remove(0).error;
            return (ResolutionResult::failed(candidate, Some(identity), error), Vec::new());
        }

        (
            ResolutionResult {
                candidate,
                identity: Some(identity),
                items: media.items,
                text,
                failed_items,
                outcome: Ok(()),
            },
            references,
        )
    }

    /// Delivers every item on its own. A failed item is reported next to its delivered siblings.
    async fn deliver(
        &self,
        identity: &ResolvedIdentity,
        items: &[MediaItem],
        token: &CancellationToken,
    ) -> (Vec<(usize, MediaReference)>, Vec<ItemFailure>) {
        let deliveries = items.iter().enumerate().map(|(index, item)| async move {
            let delivered = match self.delivery.decide(identity.platform, item) {
                Ok(decision) => self.deliver_item(identity, index, item, decision, token).await,
                Err(e) => Err(e.into()),
            };
            (index, delivered)
        });

        let mut references = Vec::new();
        let mut failures = Vec::new();
        for (index, delivered) in join_all(deliveries).await {
            match delivered {
                Ok(reference) => references.push((index, reference)),
                Err(error) => {
                    warn!("Item {} of {} not delivered: {}", index, identity.cache_key(), error);
                    failures.push(ItemFailure { index, error });
                }
            }
        }
        (references, failures)
    }

    async fn deliver_item(
        &self,
        identity: &ResolvedIdentity,
        index: usize,
        item: &MediaItem,
        decision: DeliveryDecision,
        token: &CancellationToken,
    ) -> PipelineResult<MediaReference> {
        match decision.mode {
            DeliveryMode::DirectUrl => {
                self.stats.record_direct_url();
                Ok(MediaReference::direct(item))
            }
            DeliveryMode::PreDownload => {
                let downloads = self.downloads.as_ref().ok_or(DeliveryError::ConfigurationRequired {
                    platform: identity.platform,
                    kind: item.kind,
                })?;
                let key = CacheKey::new(identity.platform, identity.id.clone(), index);
                let entry = downloads.fetch(key, item, token).await?;
                Ok(MediaReference::local(item.kind, entry.path))
            }
        }
    }
}
