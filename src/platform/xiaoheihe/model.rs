use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct GameDetailResponse {
    pub status: String,
    #[serde(default)]
    pub msg: String,
    pub result: Option<GameDetail>,
}

#[derive(Debug, Deserialize)]
pub struct GameDetail {
    pub name: String,
    #[serde(default)]
    pub name_en: String,
    pub score: Option<String>,
    #[serde(default)]
    pub about_the_game: String,
    pub price: Option<GamePrice>,
    #[serde(default)]
    pub tags: Vec<GameTag>,
    #[serde(default)]
    pub movies: Vec<GameMovie>,
}

#[derive(Debug, Deserialize)]
pub struct GamePrice {
    pub current: Option<String>,
    pub initial: Option<String>,
    pub discount: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct GameTag {
    pub desc: String,
}

#[derive(Debug, Deserialize)]
pub struct GameMovie {
    pub url: String,
    #[serde(default)]
    pub thumbnail: String,
}
