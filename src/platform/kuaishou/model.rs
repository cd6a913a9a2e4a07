use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::platform::PlatformError;

/// `window.INIT_STATE` is keyed by opaque request hashes; the photo lives under one of them.
#[derive(Debug, Deserialize)]
pub struct InitState(pub HashMap<String, Value>);

impl InitState {
    pub fn photo_state(self) -> Result<PhotoState, PlatformError> {
        let value = self
            .0
            .into_values()
            .find(|entry| entry.get("photo").is_some() || entry.get("result").is_some_and(|r| r.is_number()))
            .ok_or_else(|| PlatformError::SchemaChanged("photo state missing from INIT_STATE".to_string()))?;
        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Debug, Deserialize)]
pub struct PhotoState {
    pub result: i64,
    pub photo: Option<Photo>,
    pub atlas: Option<Atlas>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Photo {
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub user_name: String,
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub main_mv_urls: Vec<CdnUrl>,
}

#[derive(Debug, Deserialize)]
pub struct CdnUrl {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct Atlas {
    #[serde(default)]
    pub cdn: Vec<String>,
    #[serde(default)]
    pub list: Vec<String>,
}

impl Atlas {
    pub fn image_urls(&self) -> Vec<String> {
        let Some(cdn) = self.cdn.first() else {
            return Vec::new();
        };
        self.list.iter().map(|path| format!("https://{}{}", cdn, path)).collect()
    }
}
