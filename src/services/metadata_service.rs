//! Canonical, language-independent renderings of question metadata.
//!
//! The text produced here is the only input to dedupe embeddings. Question
//! prose is avoided on purpose so that two paraphrases of the same fact
//! pattern (same operation, same numbers) land on the same vector.

use crate::models::question::{BilingualOptions, CandidateQuestion, QuestionMetadata};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

const OPTION_KEYS: [&str; 4] = ["A", "B", "C", "D"];

/// Grade/subject/knowledge-point prefix for dedupe texts.
#[derive(Debug, Clone, Copy, Default)]
pub struct DedupeContext {
    pub grade_id: Option<i32>,
    pub subject_id: Option<i32>,
    pub knowledge_point_id: Option<i32>,
}

pub struct MetadataService;

impl MetadataService {
    /// Normalize raw metadata into either the compact `{type, nums, context}`
    /// shape or a key-sorted generic object. Returns `None` when nothing usable
    /// remains.
    pub fn canonicalize(raw: &JsonValue) -> Option<QuestionMetadata> {
        let obj = raw.as_object()?;

        let kind = obj
            .get("type")
            .and_then(scalar_to_string)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let nums: Vec<f64> = obj
            .get("nums")
            .and_then(JsonValue::as_array)
            .map(|a| a.iter().filter_map(number_like).collect())
            .unwrap_or_default();
        if !kind.is_empty() && !nums.is_empty() {
            let context = obj
                .get("context")
                .and_then(scalar_to_string)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            return Some(QuestionMetadata::Compact { kind, nums, context });
        }

        let generic: BTreeMap<String, JsonValue> = obj
            .iter()
            .filter(|(k, _)| !k.is_empty())
            .map(|(k, v)| (k.clone(), normalize_value(v)))
            .collect();
        if generic.is_empty() {
            None
        } else {
            Some(QuestionMetadata::Generic(generic))
        }
    }

    /// `key=value | key=value`; for the compact shape exactly
    /// `type=.. | nums=.. | context=..` with empty parts omitted.
    pub fn to_embedding_text(metadata: &QuestionMetadata) -> String {
        let parts: Vec<String> = match metadata {
            QuestionMetadata::Compact { kind, nums, context } => {
                let nums = nums.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(",");
                [
                    ("type", kind.trim().to_string()),
                    ("nums", nums),
                    ("context", context.clone().unwrap_or_default().trim().to_string()),
                ]
                .into_iter()
                .filter(|(_, v)| !v.is_empty())
                .map(|(k, v)| format!("{}={}", k, v))
                .collect()
            }
            QuestionMetadata::Generic(map) => map
                .iter()
                .filter_map(|(k, v)| render_value(v).map(|v| format!("{}={}", k, v)))
                .collect(),
        };
        normalize_whitespace(&parts.join(" | "))
    }

    /// Canonicalize-then-render in one step; empty when there is no usable metadata.
    pub fn raw_embedding_text(raw: &JsonValue) -> String {
        Self::canonicalize(raw)
            .map(|m| Self::to_embedding_text(&m))
            .unwrap_or_default()
    }

    /// Content + English options, used only when a question has no metadata.
    pub fn content_embedding_text(content_en: &str, options_en: &[String]) -> String {
        let content = normalize_whitespace(content_en);
        let opts: Vec<&str> = options_en
            .iter()
            .map(|o| o.trim())
            .filter(|o| !o.is_empty())
            .collect();
        let joined = opts.join(" | ");
        let parts: Vec<&str> = [content.as_str(), joined.as_str()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();
        normalize_whitespace(&parts.join(" || "))
    }

    /// Text embedded for the vector-index gate and for `qmeta:<id>` records.
    pub fn dedupe_text(question: &CandidateQuestion, ctx: DedupeContext) -> String {
        let meta_text = question
            .metadata
            .as_ref()
            .map(Self::to_embedding_text)
            .unwrap_or_default();

        let mut parts = Vec::new();
        if let Some(g) = ctx.grade_id {
            parts.push(format!("grade_id={}", g));
        }
        if let Some(s) = ctx.subject_id {
            parts.push(format!("subject_id={}", s));
        }
        if let Some(kp) = ctx.knowledge_point_id.or(question.knowledge_point_id) {
            parts.push(format!("knowledge_point_id={}", kp));
        }
        if meta_text.is_empty() {
            let fallback = Self::content_embedding_text(&question.content_en, &question.options.en);
            if !fallback.is_empty() {
                parts.push(fallback);
            }
        } else {
            parts.push(meta_text);
        }
        normalize_whitespace(&parts.join(" | "))
    }

    /// Accepts `{zh:[..], en:[..]}`, single-language objects, `{A:{zh,en},..,D:{zh,en}}`
    /// and bare arrays (treated as both languages).
    pub fn extract_bilingual_options(raw: &JsonValue) -> Option<BilingualOptions> {
        if let Some(obj) = raw.as_object() {
            let zh = obj.get("zh").and_then(normalize_options);
            let en = obj.get("en").and_then(normalize_options);
            match (zh, en) {
                (Some(zh), Some(en)) => return Some(BilingualOptions { zh, en }),
                (None, Some(en)) => return Some(BilingualOptions { zh: en.clone(), en }),
                (Some(zh), None) => return Some(BilingualOptions { en: zh.clone(), zh }),
                (None, None) => {}
            }

            let mut zh = Vec::with_capacity(4);
            let mut en = Vec::with_capacity(4);
            for key in OPTION_KEYS {
                let entry = obj.get(key)?.as_object()?;
                let z = entry.get("zh").and_then(scalar_to_string).unwrap_or_default();
                let e = entry.get("en").and_then(scalar_to_string).unwrap_or_default();
                if z.trim().is_empty() || e.trim().is_empty() {
                    return None;
                }
                zh.push(z.trim().to_string());
                en.push(e.trim().to_string());
            }
            return Some(BilingualOptions { zh, en });
        }

        let arr = normalize_options(raw)?;
        Some(BilingualOptions { zh: arr.clone(), en: arr })
    }
}

/// Options coerced to trimmed strings; `null` entries become empty strings.
pub fn normalize_options(raw: &JsonValue) -> Option<Vec<String>> {
    raw.as_array().map(|a| {
        a.iter()
            .map(|x| scalar_to_string(x).unwrap_or_default().trim().to_string())
            .collect()
    })
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn scalar_to_string(v: &JsonValue) -> Option<String> {
    match v {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn number_like(v: &JsonValue) -> Option<f64> {
    let n = match v {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn normalize_value(v: &JsonValue) -> JsonValue {
    match v {
        JsonValue::String(s) => JsonValue::String(s.trim().to_string()),
        other => other.clone(),
    }
}

fn render_value(v: &JsonValue) -> Option<String> {
    let out = match v {
        JsonValue::Null => return None,
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Array(items) => items
            .iter()
            .filter_map(render_value)
            .collect::<Vec<_>>()
            .join(","),
        JsonValue::Object(_) => v.to_string(),
    };
    (!out.is_empty()).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compact_shape_is_preferred_for_math() {
        let m = MetadataService::canonicalize(&json!({
            "type": " division ",
            "nums": [12, "3", null, "x"],
            "context": "apples"
        }))
        .unwrap();
        assert_eq!(
            m,
            QuestionMetadata::Compact {
                kind: "division".into(),
                nums: vec![12.0, 3.0],
                context: Some("apples".into()),
            }
        );
        assert_eq!(
            MetadataService::to_embedding_text(&m),
            "type=division | nums=12,3 | context=apples"
        );
    }

    #[test]
    fn blank_context_is_dropped_from_text() {
        let m = MetadataService::canonicalize(&json!({"type": "addition", "nums": [1.5, 2], "context": "  "}))
            .unwrap();
        assert_eq!(MetadataService::to_embedding_text(&m), "type=addition | nums=1.5,2");
    }

    #[test]
    fn generic_shape_is_key_sorted() {
        let m = MetadataService::canonicalize(&json!({
            "word": " apple ",
            "type": "vocabulary",
            "context": "fruit",
            "extra": null
        }))
        .unwrap();
        assert_eq!(
            MetadataService::to_embedding_text(&m),
            "context=fruit | type=vocabulary | word=apple"
        );
    }

    #[test]
    fn key_order_does_not_change_text() {
        let a = MetadataService::raw_embedding_text(&json!({"skill": "x", "domain": "y"}));
        let b = MetadataService::raw_embedding_text(&json!({"domain": "y", "skill": "x"}));
        assert_eq!(a, b);
    }

    #[test]
    fn unusable_metadata_yields_none() {
        assert!(MetadataService::canonicalize(&json!(null)).is_none());
        assert!(MetadataService::canonicalize(&json!([1, 2])).is_none());
        assert!(MetadataService::canonicalize(&json!({})).is_none());
        assert_eq!(MetadataService::raw_embedding_text(&json!("text")), "");
    }

    #[test]
    fn extracts_all_option_layouts() {
        let both = MetadataService::extract_bilingual_options(&json!({
            "zh": ["一", "二", "三", "四"], "en": [" one", "two", "three", "four "]
        }))
        .unwrap();
        assert_eq!(both.en, vec!["one", "two", "three", "four"]);
        assert_eq!(both.zh[0], "一");

        let en_only = MetadataService::extract_bilingual_options(&json!({"en": ["a", "b"]})).unwrap();
        assert_eq!(en_only.zh, en_only.en);

        let letters = MetadataService::extract_bilingual_options(&json!({
            "A": {"zh": "甲", "en": "a"},
            "B": {"zh": "乙", "en": "b"},
            "C": {"zh": "丙", "en": "c"},
            "D": {"zh": "丁", "en": "d"}
        }))
        .unwrap();
        assert_eq!(letters.en, vec!["a", "b", "c", "d"]);
        assert_eq!(letters.zh, vec!["甲", "乙", "丙", "丁"]);

        let arr = MetadataService::extract_bilingual_options(&json!([1, 2, 3, 4])).unwrap();
        assert_eq!(arr.en, vec!["1", "2", "3", "4"]);

        assert!(MetadataService::extract_bilingual_options(&json!({"A": {"zh": "甲"}})).is_none());
        assert!(MetadataService::extract_bilingual_options(&json!("a,b,c,d")).is_none());
    }
}
