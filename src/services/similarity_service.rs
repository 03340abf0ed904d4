use crate::models::history::StoredEmbedding;
use crate::services::embed_service::{cosine_sim, EmbedMode, MetadataFilter, VectorIndex, VectorMatch};
use std::sync::Arc;

/// A similarity lookup could not be answered. Callers treat this as "no match".
#[derive(Debug, thiserror::Error)]
#[error("similarity oracle unavailable: {0}")]
pub struct OracleUnavailable(pub String);

/// Per-gate dedupe settings for one invocation. Relaxed by building new values,
/// never by mutating a shared one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupeConfig {
    pub enabled: bool,
    pub threshold: f32,
    pub top_k: usize,
}

impl DedupeConfig {
    pub fn is_too_similar(&self, score: f32) -> bool {
        score.is_finite() && score >= self.threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalMatch {
    pub question_id: i32,
    pub score: f32,
}

/// Local cosine over resident vectors, or remote ANN against the vector index.
/// Both report scores on the same scale and share the `score >= threshold` rule.
#[derive(Clone)]
pub struct SimilarityService {
    index: Arc<dyn VectorIndex>,
}

impl SimilarityService {
    pub fn new(index: Arc<dyn VectorIndex>) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Highest cosine between `vector` and any of `others`; `-1.0` if none compare.
    pub fn max_local(vector: &[f32], others: &[Vec<f32>]) -> f32 {
        others
            .iter()
            .map(|o| cosine_sim(vector, o))
            .fold(-1.0, f32::max)
    }

    /// Best match against already-stored embeddings.
    pub fn best_stored(vector: &[f32], corpus: &[StoredEmbedding]) -> Option<LocalMatch> {
        corpus
            .iter()
            .map(|e| LocalMatch {
                question_id: e.question_id,
                score: cosine_sim(vector, &e.embedding),
            })
            .filter(|m| m.score > -1.0)
            .max_by(|a, b| a.score.total_cmp(&b.score))
    }

    pub async fn embed_one(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>, OracleUnavailable> {
        let vecs = self
            .index
            .embed(&[text.to_string()], mode)
            .await
            .map_err(|e| OracleUnavailable(e.to_string()))?;
        vecs.into_iter()
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| OracleUnavailable("embedding response was empty".to_string()))
    }

    pub async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<VectorMatch>, OracleUnavailable> {
        self.index
            .query_by_vector(vector, top_k, filter)
            .await
            .map_err(|e| OracleUnavailable(e.to_string()))
    }

    /// Embed `text` in query mode and return the best remote score, `None` when
    /// the index has no neighbour at all.
    pub async fn best_remote_score(
        &self,
        text: &str,
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Option<f32>, OracleUnavailable> {
        let vector = self.embed_one(text, EmbedMode::Query).await?;
        let matches = self.query(&vector, top_k, filter).await?;
        Ok(matches
            .iter()
            .map(|m| m.score)
            .filter(|s| s.is_finite())
            .fold(None, |best: Option<f32>, s| Some(best.map_or(s, |b| b.max(s)))))
    }
}
