use regex::Regex;
use serde::de::DeserializeOwned;

use super::PlatformError;

/// Characters a link may continue with. Excludes quotes, brackets and anything non-ascii so
/// links glued to surrounding chat text stop at the right place.
pub const URL_TAIL: &str = r"[A-Za-z0-9\-._~:/?#@!$&*+,;=%]*";

/// All matches of `regex` in `text` as `(offset, link)`, with trailing punctuation removed.
pub fn find_links_with(regex: &Regex, text: &str) -> Vec<(usize, String)> {
    regex
        .find_iter(text)
        .map(|m| (m.start(), trim_link(m.as_str()).to_string()))
        .collect()
}

pub fn trim_link(link: &str) -> &str {
    link.trim_end_matches(['.', ',', ';', ':', '!', '?'])
}

/// Cuts the JSON object assigned after `marker` out of an html page. Braces inside string
/// literals are skipped.
pub fn extract_json_object<'a>(html: &'a str, marker: &str) -> Option<&'a str> {
    let start = html.find(marker)? + marker.len();
    let open = start + html[start..].find('{')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in html[open..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&html[open..=open + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parses an embedded page state blob into `T`. Pages embed JS literals, so bare
/// `undefined` values are turned into `null` first.
pub fn parse_embedded_state<T: DeserializeOwned>(html: &str, marker: &str) -> Result<T, PlatformError> {
    let raw = extract_json_object(html, marker)
        .ok_or_else(|| PlatformError::SchemaChanged(format!("{} not found in page", marker.trim())))?;
    let normalized = raw.replace(":undefined", ":null").replace("\\u002F", "/");
    Ok(serde_json::from_str(&normalized)?)
}
