use std::{collections::BTreeMap, path::PathBuf};

use serde::Serialize;
use url::Url;

use crate::{
    error::PipelineError,
    matcher::LinkCandidate,
    platform::{MediaItem, MediaKind, ResolvedIdentity},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaReference {
    DirectUrl {
        kind: MediaKind,
        url: Url,
        /// Headers the recipient has to send for the url to work.
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        required_headers: BTreeMap<String, String>,
    },
    LocalFile {
        kind: MediaKind,
        path: PathBuf,
    },
}

impl MediaReference {
    pub fn direct(item: &MediaItem) -> Self {
        Self::DirectUrl {
            kind: item.kind,
            url: item.url.clone(),
            required_headers: item.headers.clone(),
        }
    }

    pub fn local(kind: MediaKind, path: PathBuf) -> Self {
        Self::LocalFile { kind, path }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ReplySegment {
    Text(String),
    Media(MediaReference),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplyPayload {
    pub segments: Vec<ReplySegment>,
}

impl ReplyPayload {
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            ReplySegment::Text(text) => Some(text.as_str()),
            ReplySegment::Media(_) => None,
        })
    }

    pub fn media(&self) -> impl Iterator<Item = &MediaReference> {
        self.segments.iter().filter_map(|segment| match segment {
            ReplySegment::Media(media) => Some(media),
            ReplySegment::Text(_) => None,
        })
    }
}

/// An item that could not be delivered while the rest of its result was.
#[derive(Debug)]
pub struct ItemFailure {
    pub index: usize,
    pub error: PipelineError,
}

/// Everything the pipeline learned about one candidate.
#[derive(Debug)]
pub struct ResolutionResult {
    pub candidate: LinkCandidate,
    pub identity: Option<ResolvedIdentity>,
    pub items: Vec<MediaItem>,
    pub text: String,
    pub failed_items: Vec<ItemFailure>,
    pub outcome: Result<(), PipelineError>,
}

impl ResolutionResult {
    pub fn failed(candidate: LinkCandidate, identity: Option<ResolvedIdentity>, error: PipelineError) -> Self {
        Self {
            candidate,
            identity,
            items: Vec::new(),
            text: String::new(),
            failed_items: Vec::new(),
            outcome: Err(error),
        }
    }
}

/// How one item of one result ended up being delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredItem {
    pub result_index: usize,
    pub item_index: usize,
    pub reference: MediaReference,
}

pub struct ResultAssembler {
    marker: String,
}

impl ResultAssembler {
    pub fn new(marker: impl Into<String>) -> Self {
        Self { marker: marker.into() }
    }

    fn marker_line(&self, link: &str) -> String {
        format!("{} {}", self.marker, link)
    }

    /// Builds the reply in candidate order. Returns `None` when nothing was produced.
    pub fn assemble(&self, results: &[ResolutionResult], delivered: &[DeliveredItem]) -> Option<ReplyPayload> {
        let mut segments = Vec::new();

        for (index, result) in results.iter().enumerate() {
            let link = &result.candidate.raw;
            match &result.outcome {
                Err(error) => {
                    segments.push(ReplySegment::Text(format!(
                        "Parsing failed: {}\n{}",
                        error.user_message(),
                        self.marker_line(link)
                    )));
                }
                Ok(()) => {
                    let mut lines: Vec<String> = Vec::new();
                    let text = result.text.trim();
                    if !text.is_empty() {
                        lines.push(text.to_string());
                    }
                    lines.extend(
                        result
                            .failed_items
                            .iter()
                            .map(|failure| format!("Media {} unavailable: {}", failure.index + 1, failure.error.user_message())),
                    );
                    lines.push(self.marker_line(link));
                    segments.push(ReplySegment::Text(lines.join("\n")));

                    let mut media: Vec<_> = delivered.iter().filter(|d| d.result_index == index).collect();
                    media.sort_by_key(|d| d.item_index);
                    segments.extend(media.into_iter().map(|d| ReplySegment::Media(d.reference.clone())));
                }
            }
        }

        (!segments.is_empty()).then_some(ReplyPayload { segments })
    }
}
