use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct InitialState {
    pub note: NoteState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteState {
    #[serde(default)]
    pub note_detail_map: HashMap<String, NoteDetail>,
}

#[derive(Debug, Deserialize)]
pub struct NoteDetail {
    pub note: Option<Note>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub desc: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub user: Option<NoteUser>,
    pub time: Option<i64>,
    #[serde(default)]
    pub image_list: Vec<NoteImage>,
    pub video: Option<NoteVideo>,
}

#[derive(Debug, Deserialize)]
pub struct NoteUser {
    #[serde(default)]
    pub nickname: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteImage {
    #[serde(default)]
    pub url_default: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Deserialize)]
pub struct NoteVideo {
    pub media: VideoMedia,
}

#[derive(Debug, Deserialize)]
pub struct VideoMedia {
    pub stream: VideoStreams,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct VideoStreams {
    pub h264: Vec<VideoStream>,
    pub h265: Vec<VideoStream>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStream {
    pub master_url: String,
    #[serde(default)]
    pub video_bitrate: u64,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}
