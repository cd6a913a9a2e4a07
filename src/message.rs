use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One inbound chat message: its text plus the JSON of a shared card, if any.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePayload {
    pub text: String,
    #[serde(default)]
    pub card: Option<Value>,
}

impl MessagePayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            card: None,
        }
    }

    pub fn with_card(mut self, card: Value) -> Self {
        self.card = Some(card);
        self
    }

    /// Every string value inside the card, depth first.
    pub fn card_strings(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(card) = &self.card {
            collect_strings(card, &mut out);
        }
        out
    }
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_strings(item, out)),
        _ => {}
    }
}
