use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;

use crate::{
    config::PipelineConfig,
    message::MessagePayload,
    platform::{Platform, PlatformRegistry},
};

/// Card fields known to carry the shared target url.
const CARD_URL_FIELDS: [&str; 5] = ["jumpUrl", "qqdocurl", "doc_url", "url", "target_url"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "field", rename_all = "snake_case")]
pub enum LinkSource {
    Text,
    CardField(String),
}

/// A link found in a message, before any network work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkCandidate {
    pub platform: Platform,
    pub raw: String,
    pub source: LinkSource,
    /// Byte offset for text links; card links are numbered after the text.
    pub position: usize,
}

pub struct LinkMatcher {
    registry: PlatformRegistry,
    config: PipelineConfig,
}

impl LinkMatcher {
    pub fn new(registry: PlatformRegistry, config: &PipelineConfig) -> Self {
        Self {
            registry,
            config: config.clone(),
        }
    }

    /// Candidates in order of first appearance, text before card, without duplicates.
    pub fn extract(&self, message: &MessagePayload) -> Vec<LinkCandidate> {
        if self.is_own_output(message) {
            debug!("Message carries the marker, skipping");
            return Vec::new();
        }
        if !self.config.should_parse(&message.text) {
            debug!("Auto parse disabled and no trigger keyword present");
            return Vec::new();
        }

        let mut candidates = self.scan(&message.text, LinkSource::Text);

        if let Some(card) = &message.card {
            let mut fields = Vec::new();
            collect_card_fields(card, &mut fields);
            let mut position = message.text.len();
            for (field, value) in fields {
                for mut candidate in self.scan(value, LinkSource::CardField(field.to_string())) {
                    candidate.position = position;
                    position += 1;
                    candidates.push(candidate);
                }
            }
        }

        let mut seen = HashSet::new();
        candidates.retain(|candidate| seen.insert(candidate.raw.clone()));

        if !candidates.is_empty() {
            info!("Matched {} link(s)", candidates.len());
        }
        candidates
    }

    fn scan(&self, text: &str, source: LinkSource) -> Vec<LinkCandidate> {
        let mut found: Vec<LinkCandidate> = self
            .registry
            .resolvers()
            .into_iter()
            .filter(|resolver| self.config.is_enabled(resolver.platform()))
            .flat_map(|resolver| {
                let platform = resolver.platform();
                let source = source.clone();
                resolver
                    .find_links(text)
                    .into_iter()
                    .map(move |(offset, raw)| LinkCandidate {
                        platform,
                        raw,
                        source: source.clone(),
                        position: offset,
                    })
            })
            .collect();
        found.sort_by_key(|candidate| candidate.position);
        found
    }

    fn is_own_output(&self, message: &MessagePayload) -> bool {
        message.text.contains(&self.config.marker_text)
            || message
                .card_strings()
                .iter()
                .any(|value| value.contains(&self.config.marker_text))
    }
}

/// Known url fields anywhere in the card, depth first.
fn collect_card_fields<'a>(value: &'a Value, out: &mut Vec<(&'a str, &'a str)>) {
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                match value {
                    Value::String(s) if CARD_URL_FIELDS.contains(&key.as_str()) => out.push((key, s)),
                    _ => collect_card_fields(value, out),
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_card_fields(item, out)),
        _ => {}
    }
}
