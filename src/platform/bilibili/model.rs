use serde::Deserialize;

use crate::platform::PlatformError;

/// Common envelope of the web api. Bangumi endpoints put the payload under `result`.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(alias = "result")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn into_data(self, api: &str) -> Result<T, PlatformError> {
        match self.code {
            0 => self
                .data
                .ok_or_else(|| PlatformError::SchemaChanged(format!("{} returned no data", api))),
            -404 | 62002 | 62004 | 62012 | -10403 => {
                Err(PlatformError::NotFound(format!("{}: {} {}", api, self.code, self.message)))
            }
            _ => Err(PlatformError::UpstreamUnavailable(format!(
                "{}: {} {}",
                api, self.code, self.message
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VideoView {
    pub bvid: String,
    pub title: String,
    #[serde(default)]
    pub desc: String,
    pub pubdate: Option<i64>,
    pub owner: Owner,
    #[serde(default)]
    pub pages: Vec<VideoPage>,
}

#[derive(Debug, Deserialize)]
pub struct Owner {
    pub mid: u64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct VideoPage {
    pub cid: u64,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub part: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PlayUrlData {
    pub quality: Option<u32>,
    pub accept_quality: Vec<u32>,
    pub durl: Vec<Durl>,
    pub dash: Option<Dash>,
}

impl PlayUrlData {
    pub fn best_quality(&self) -> Option<u32> {
        self.accept_quality
            .iter()
            .copied()
            .max()
            .or_else(|| self.dash.as_ref()?.video.iter().map(|v| v.id).max())
    }
}

#[derive(Debug, Deserialize)]
pub struct Durl {
    pub url: String,
    #[serde(default)]
    pub size: u64,
    /// Mirrors on other cdn nodes.
    #[serde(default)]
    pub backup_url: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Dash {
    pub video: Vec<DashStream>,
}

#[derive(Debug, Deserialize)]
pub struct DashStream {
    pub id: u32,
    #[serde(alias = "baseUrl")]
    pub base_url: String,
    #[serde(default)]
    pub bandwidth: u64,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

/// `pgc/player/web/v2/playurl` nests the stream info one level deeper than the ugc api.
#[derive(Debug, Default, Deserialize)]
pub struct PgcPlayUrl {
    #[serde(default)]
    pub video_info: Option<PlayUrlData>,
    #[serde(flatten)]
    pub inline: PlayUrlData,
}

impl PgcPlayUrl {
    pub fn into_play_url(self) -> PlayUrlData {
        self.video_info.unwrap_or(self.inline)
    }
}

#[derive(Debug, Deserialize)]
pub struct SeasonView {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub season_title: String,
    #[serde(default)]
    pub evaluate: String,
    #[serde(default)]
    pub episodes: Vec<Episode>,
    pub up_info: Option<UpInfo>,
}

#[derive(Debug, Deserialize)]
pub struct Episode {
    pub ep_id: u64,
    #[serde(default)]
    pub share_copy: String,
    #[serde(default)]
    pub long_title: String,
    #[serde(default)]
    pub title: String,
    pub pub_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpInfo {
    #[serde(default)]
    pub mid: u64,
    #[serde(default, alias = "uname")]
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_codes() {
        let ok: ApiResponse<u32> = serde_json::from_str(r#"{"code":0,"message":"0","data":7}"#).unwrap();
        assert_eq!(ok.into_data("view").unwrap(), 7);

        let gone: ApiResponse<u32> = serde_json::from_str(r#"{"code":-404,"message":"啥都木有"}"#).unwrap();
        assert!(matches!(gone.into_data("view"), Err(PlatformError::NotFound(_))));

        let blocked: ApiResponse<u32> = serde_json::from_str(r#"{"code":-412,"message":"请求被拦截"}"#).unwrap();
        assert!(matches!(blocked.into_data("view"), Err(PlatformError::UpstreamUnavailable(_))));
    }

    #[test]
    fn test_pgc_play_url_nesting() {
        let nested: PgcPlayUrl =
            serde_json::from_str(r#"{"video_info":{"quality":80,"accept_quality":[80,64],"durl":[{"url":"u"}]}}"#)
                .unwrap();
        assert_eq!(nested.into_play_url().durl.len(), 1);

        let flat: PgcPlayUrl = serde_json::from_str(r#"{"quality":64,"accept_quality":[64],"durl":[]}"#).unwrap();
        assert_eq!(flat.into_play_url().best_quality(), Some(64));
    }
}
