use std::sync::LazyLock;

use anyhow::Context;
use regex::Regex;
use url::Url;

use crate::platform::{util::URL_TAIL, PlatformError};

const BV_TABLE: &[u8; 58] = b"FcwAPNKTMug3GV5Lj7EJnHpWsx4tb8haYeviqBz6rkCy12mUSDQX9RdoZf";
const XOR_CODE: u64 = 23442827791579;
const MAX_AID: u64 = 1 << 51;
const BASE: u64 = 58;

pub(super) static BILIBILI_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)https?://(?:(?:b23\.tv|bili2233\.cn)/[A-Za-z0-9]|(?:www\.|m\.|mobile\.)?bilibili\.com/(?:video/(?:bv[0-9a-z]{{10}}|av\d+)|bangumi/play/ep\d+)){}",
        URL_TAIL
    ))
    .context("Failed to create Bilibili URL regex")
    .unwrap()
});

static BARE_BVID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(BV1[0-9A-Za-z]{9})\b")
        .context("Failed to create Bilibili BV id regex")
        .unwrap()
});

static BVID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^bv([0-9a-z]{10})$")
        .context("Failed to create Bilibili BV path regex")
        .unwrap()
});

static AID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^av(\d+)$")
        .context("Failed to create Bilibili AV path regex")
        .unwrap()
});

static EP_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^ep(\d+)$")
        .context("Failed to create Bilibili episode regex")
        .unwrap()
});

pub fn av2bv(aid: u64) -> Result<String, PlatformError> {
    if aid == 0 || aid >= MAX_AID {
        return Err(PlatformError::InvalidUrl(format!("av{} is out of range", aid)));
    }

    let mut bytes = *b"BV1000000000";
    let mut idx = bytes.len() - 1;
    let mut tmp = (MAX_AID | aid) ^ XOR_CODE;
    while tmp > 0 {
        bytes[idx] = BV_TABLE[(tmp % BASE) as usize];
        tmp /= BASE;
        idx -= 1;
    }
    bytes.swap(3, 9);
    bytes.swap(4, 7);

    Ok(bytes.iter().map(|b| *b as char).collect())
}

/// Bare `BV1...` ids that are not part of a link, rewritten to canonical video urls.
pub fn find_bare_bvids(text: &str, links: &[(usize, String)]) -> Vec<(usize, String)> {
    BARE_BVID_REGEX
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .filter(|m| {
            !links
                .iter()
                .any(|(start, link)| m.start() >= *start && m.start() < start + link.len())
        })
        .map(|m| (m.start(), format!("https://www.bilibili.com/video/{}", m.as_str())))
        .collect()
}

pub enum VideoTarget {
    Ugc { bvid: String, page: u32 },
    Pgc { ep_id: u64 },
}

pub fn parse_target(url: &Url) -> Result<VideoTarget, PlatformError> {
    let segments: Vec<_> = url.path_segments().map(|s| s.filter(|s| !s.is_empty()).collect()).unwrap_or_default();

    let page = url
        .query_pairs()
        .find(|(k, _)| k == "p")
        .and_then(|(_, v)| v.parse::<u32>().ok())
        .unwrap_or(1)
        .max(1);

    match segments.as_slice() {
        ["video", id, ..] => {
            if let Some(caps) = BVID_REGEX.captures(id) {
                Ok(VideoTarget::Ugc {
                    bvid: format!("BV{}", &caps[1]),
                    page,
                })
            } else if let Some(caps) = AID_REGEX.captures(id) {
                let aid = caps[1]
                    .parse::<u64>()
                    .map_err(|_| PlatformError::InvalidUrl(url.to_string()))?;
                Ok(VideoTarget::Ugc {
                    bvid: av2bv(aid)?,
                    page,
                })
            } else {
                Err(PlatformError::InvalidUrl(url.to_string()))
            }
        }
        ["bangumi", "play", ep, ..] => {
            let caps = EP_REGEX
                .captures(ep)
                .ok_or_else(|| PlatformError::InvalidUrl(url.to_string()))?;
            let ep_id = caps[1]
                .parse::<u64>()
                .map_err(|_| PlatformError::InvalidUrl(url.to_string()))?;
            Ok(VideoTarget::Pgc { ep_id })
        }
        _ => url
            .query_pairs()
            .find(|(k, _)| k == "ep_id")
            .and_then(|(_, v)| v.parse::<u64>().ok())
            .map(|ep_id| VideoTarget::Pgc { ep_id })
            .ok_or_else(|| PlatformError::InvalidUrl(url.to_string())),
    }
}
