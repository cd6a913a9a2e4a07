use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct EmbedResponse {
    pub code: u16,
    #[serde(default)]
    pub message: String,
    pub tweet: Option<Tweet>,
}

#[derive(Debug, Deserialize)]
pub struct Tweet {
    #[serde(default)]
    pub text: String,
    pub author: Option<TweetAuthor>,
    pub created_timestamp: Option<i64>,
    pub media: Option<TweetMedia>,
    pub quote: Option<Box<Tweet>>,
}

#[derive(Debug, Deserialize)]
pub struct TweetAuthor {
    pub name: String,
    pub screen_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TweetMedia {
    pub photos: Vec<TweetPhoto>,
    pub videos: Vec<TweetVideo>,
}

#[derive(Debug, Deserialize)]
pub struct TweetPhoto {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct TweetVideo {
    pub url: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    pub format: Option<String>,
}
