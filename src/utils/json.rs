use regex::Regex;
use serde_json::Value as JsonValue;
use std::sync::OnceLock;

fn fence_open() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^```(?:json)?\s*").expect("valid regex"))
}

fn fence_close() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*```\s*$").expect("valid regex"))
}

fn outer_object() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"))
}

pub fn strip_code_fences(text: &str) -> String {
    let s = text.trim();
    let s = fence_open().replace(s, "");
    fence_close().replace(&s, "").trim().to_string()
}

/// Best-effort recovery of a JSON object from model output: strip fences, parse,
/// and failing that parse the outermost `{...}` span.
pub fn parse_json_object(text: &str) -> Option<JsonValue> {
    let raw = strip_code_fences(text);
    if raw.is_empty() {
        return None;
    }
    if let Ok(v) = serde_json::from_str::<JsonValue>(&raw) {
        if v.is_object() {
            return Some(v);
        }
    }
    let span = outer_object().find(&raw)?;
    serde_json::from_str::<JsonValue>(span.as_str())
        .ok()
        .filter(JsonValue::is_object)
}
