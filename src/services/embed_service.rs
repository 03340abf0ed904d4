use crate::error::Result;
use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const QUESTION_METADATA_KIND: &str = "question_metadata";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedMode {
    Query,
    Passage,
}

impl EmbedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbedMode::Query => "query",
            EmbedMode::Passage => "passage",
        }
    }
}

/// Equality filter for `question_metadata` vectors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetadataFilter {
    pub grade_id: i32,
    pub subject_id: i32,
    pub knowledge_point_id: Option<i32>,
}

impl MetadataFilter {
    pub fn new(grade_id: i32, subject_id: i32) -> Self {
        Self {
            grade_id,
            subject_id,
            knowledge_point_id: None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        let mut filter = serde_json::json!({
            "kind": { "$eq": QUESTION_METADATA_KIND },
            "grade_id": { "$eq": self.grade_id },
            "subject_id": { "$eq": self.subject_id },
        });
        if let Some(kp) = self.knowledge_point_id {
            filter["knowledge_point_id"] = serde_json::json!({ "$eq": kp });
        }
        filter
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    #[serde(default)]
    pub score: f32,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

impl VectorMatch {
    pub fn question_id(&self) -> Option<i32> {
        let v = self.metadata.as_ref()?.get("question_id")?;
        v.as_i64()
            .or_else(|| v.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .and_then(|n| i32::try_from(n).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

/// Contract of the vector index: embedding, ANN query, idempotent upsert.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn embed(&self, texts: &[String], mode: EmbedMode) -> Result<Vec<Vec<f32>>>;

    async fn query_by_vector(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<VectorMatch>>;

    async fn upsert_vectors(&self, records: Vec<VectorRecord>) -> Result<()>;
}

#[derive(Clone)]
pub struct EmbedService {
    client: Client,
    api_key: String,
    api_base: String,
    index_host: String,
    model: String,
}

impl EmbedService {
    pub fn new(
        api_key: String,
        index_host: String,
        api_base: String,
        model: String,
        client: Client,
    ) -> Self {
        let index_host = if index_host.starts_with("http") {
            index_host
        } else {
            format!("https://{}", index_host)
        };
        Self {
            client,
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
            index_host: index_host.trim_end_matches('/').to_string(),
            model,
        }
    }

    async fn post_json(&self, url: &str, body: &JsonValue, what: &str) -> Result<JsonValue> {
        let resp = self
            .client
            .post(url)
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", "2024-10")
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await
            .with_context(|| format!("{} request failed", what))?;

        let status = resp.status();
        let txt = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow::anyhow!("{} status {}: {}", what, status.as_u16(), txt).into());
        }
        if txt.trim().is_empty() {
            return Ok(JsonValue::Null);
        }
        let parsed = serde_json::from_str(&txt).with_context(|| format!("{} parse failed", what))?;
        Ok(parsed)
    }
}

#[async_trait]
impl VectorIndex for EmbedService {
    async fn embed(&self, texts: &[String], mode: EmbedMode) -> Result<Vec<Vec<f32>>> {
        #[derive(Deserialize)]
        struct EmbData {
            #[serde(default)]
            values: Vec<f32>,
        }
        #[derive(Deserialize)]
        struct EmbResp {
            #[serde(default)]
            data: Vec<EmbData>,
        }

        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "parameters": { "input_type": mode.as_str(), "truncate": "END" },
            "inputs": texts.iter().map(|t| serde_json::json!({ "text": t })).collect::<Vec<_>>(),
        });
        let url = format!("{}/embed", self.api_base);
        let raw = self.post_json(&url, &body, "embeddings").await?;
        let parsed: EmbResp = serde_json::from_value(raw).context("embeddings parse failed")?;
        Ok(parsed.data.into_iter().map(|d| d.values).collect())
    }

    async fn query_by_vector(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<VectorMatch>> {
        #[derive(Deserialize)]
        struct QueryResp {
            #[serde(default)]
            matches: Vec<VectorMatch>,
        }

        let body = serde_json::json!({
            "vector": vector,
            "topK": top_k.max(1),
            "includeMetadata": true,
            "filter": filter.to_json(),
        });
        let url = format!("{}/query", self.index_host);
        let raw = self.post_json(&url, &body, "vector query").await?;
        let parsed: QueryResp = serde_json::from_value(raw).context("vector query parse failed")?;
        Ok(parsed.matches)
    }

    async fn upsert_vectors(&self, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let vectors: Vec<VectorRecord> = records
            .into_iter()
            .map(|mut r| {
                r.metadata = r.metadata.and_then(sanitize_metadata);
                r
            })
            .collect();
        let body = serde_json::json!({ "vectors": vectors });
        let url = format!("{}/vectors/upsert", self.index_host);
        self.post_json(&url, &body, "vector upsert").await?;
        Ok(())
    }
}

/// The index rejects null metadata values; drop them, and drop the whole
/// object when nothing is left.
pub fn sanitize_metadata(md: JsonValue) -> Option<JsonValue> {
    let JsonValue::Object(map) = md else {
        return None;
    };
    let cleaned: Map<String, JsonValue> = map
        .into_iter()
        .filter(|(k, v)| !k.is_empty() && !v.is_null())
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(JsonValue::Object(cleaned))
    }
}

/// Cosine similarity, or `-1.0` when the vectors are not comparable
/// (length mismatch, empty, non-finite entries, zero norm).
pub fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return -1.0;
    }
    let mut dot = 0f64;
    let mut na = 0f64;
    let mut nb = 0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        if !x.is_finite() || !y.is_finite() {
            return -1.0;
        }
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na <= 0.0 || nb <= 0.0 {
        return -1.0;
    }
    (dot / (na.sqrt() * nb.sqrt())) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let s = cosine_sim(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]);
        assert!((s - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert!(cosine_sim(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn cosine_returns_sentinel_when_incomparable() {
        assert_eq!(cosine_sim(&[1.0, 2.0], &[1.0]), -1.0);
        assert_eq!(cosine_sim(&[], &[]), -1.0);
        assert_eq!(cosine_sim(&[0.0, 0.0], &[1.0, 1.0]), -1.0);
        assert_eq!(cosine_sim(&[f32::NAN, 1.0], &[1.0, 1.0]), -1.0);
        assert_eq!(cosine_sim(&[f32::INFINITY, 1.0], &[1.0, 1.0]), -1.0);
    }

    #[test]
    fn filter_includes_knowledge_point_only_when_set() {
        let mut f = MetadataFilter::new(3, 7);
        let v = f.to_json();
        assert_eq!(v["kind"]["$eq"], "question_metadata");
        assert_eq!(v["grade_id"]["$eq"], 3);
        assert!(v.get("knowledge_point_id").is_none());

        f.knowledge_point_id = Some(11);
        assert_eq!(f.to_json()["knowledge_point_id"]["$eq"], 11);
    }

    #[test]
    fn match_back_reference_accepts_float_ids() {
        let m = VectorMatch {
            id: "qmeta:9".into(),
            score: 0.5,
            metadata: Some(json!({"question_id": 9.0})),
        };
        assert_eq!(m.question_id(), Some(9));
        let none = VectorMatch {
            id: "x".into(),
            score: 0.5,
            metadata: None,
        };
        assert_eq!(none.question_id(), None);
    }

    #[test]
    fn sanitize_drops_nulls_and_empty_objects() {
        let md = sanitize_metadata(json!({"a": 1, "b": null})).unwrap();
        assert_eq!(md, json!({"a": 1}));
        assert!(sanitize_metadata(json!({"b": null})).is_none());
        assert!(sanitize_metadata(json!("x")).is_none());
    }
}
