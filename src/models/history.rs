use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One answered question. Rows are only ever appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub user_id: i32,
    pub question_id: i32,
    pub given_answer: String,
    pub correct: bool,
    pub created_at: DateTime<Utc>,
}

/// A cached embedding of an existing question, used by the semantic gate.
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub question_id: i32,
    pub content_options_hash: Option<String>,
    pub embedding: Vec<f32>,
}
