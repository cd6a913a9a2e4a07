use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::platform::PlatformError;

/// `window._ROUTER_DATA` of the share page.
#[derive(Debug, Deserialize)]
pub struct RouterData {
    #[serde(rename = "loaderData")]
    pub loader_data: HashMap<String, Value>,
}

impl RouterData {
    /// The loader that carries `videoInfoRes`; its key changes with page variants.
    pub fn video_info(self) -> Result<VideoInfoRes, PlatformError> {
        let value = self
            .loader_data
            .into_values()
            .find_map(|mut loader| loader.get_mut("videoInfoRes").map(Value::take))
            .ok_or_else(|| PlatformError::SchemaChanged("videoInfoRes missing from router data".to_string()))?;
        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Debug, Deserialize)]
pub struct VideoInfoRes {
    #[serde(default)]
    pub item_list: Vec<AwemeItem>,
    #[serde(default)]
    pub filter_list: Vec<FilterReason>,
}

#[derive(Debug, Deserialize)]
pub struct FilterReason {
    #[serde(default)]
    pub filter_reason: String,
}

#[derive(Debug, Deserialize)]
pub struct AwemeItem {
    #[serde(default)]
    pub desc: String,
    pub create_time: Option<i64>,
    pub author: Author,
    pub video: Option<Video>,
    #[serde(default)]
    pub images: Option<Vec<ImageInfo>>,
}

#[derive(Debug, Deserialize)]
pub struct Author {
    pub nickname: String,
}

#[derive(Debug, Deserialize)]
pub struct Video {
    pub play_addr: PlayAddr,
}

#[derive(Debug, Deserialize)]
pub struct PlayAddr {
    pub uri: String,
    #[serde(default)]
    pub url_list: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ImageInfo {
    #[serde(default)]
    pub url_list: Vec<String>,
}
