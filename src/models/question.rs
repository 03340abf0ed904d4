use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Four-way choices in both languages. `zh[i]` and `en[i]` are the same choice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BilingualOptions {
    pub zh: Vec<String>,
    pub en: Vec<String>,
}

impl BilingualOptions {
    pub fn is_four_way(&self) -> bool {
        self.zh.len() == 4 && self.en.len() == 4
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuestionMetadata {
    /// Quantitative shape: `{type, nums, context}`.
    Compact {
        #[serde(rename = "type")]
        kind: String,
        nums: Vec<f64>,
        context: Option<String>,
    },
    /// Any other stable object, keys kept sorted.
    Generic(BTreeMap<String, JsonValue>),
}

/// A question persisted in the relational store. Always carries its row id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: i32,
    #[serde(rename = "type")]
    pub question_type: String,
    pub content_cn: String,
    pub content_en: String,
    pub options: BilingualOptions,
    pub content_options_hash: Option<String>,
    pub answer_cn: String,
    pub answer_en: String,
    pub explanation_cn: String,
    pub explanation_en: String,
    pub metadata: Option<QuestionMetadata>,
    pub knowledge_point_id: Option<i32>,
}

/// A generated question that has not been committed yet and therefore has no id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateQuestion {
    pub content_cn: String,
    pub content_en: String,
    pub options: BilingualOptions,
    pub content_options_hash: String,
    pub answer_cn: String,
    pub answer_en: String,
    pub explanation_cn: String,
    pub explanation_en: String,
    pub metadata: Option<QuestionMetadata>,
    pub knowledge_point_id: Option<i32>,
    #[serde(skip)]
    pub claimed_knowledge_point_id: Option<i32>,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl CandidateQuestion {
    /// Attach the row id obtained from a successful commit.
    pub fn into_question(self, id: i32) -> Question {
        Question {
            id,
            question_type: "mcq".to_string(),
            content_cn: self.content_cn,
            content_en: self.content_en,
            options: self.options,
            content_options_hash: Some(self.content_options_hash),
            answer_cn: self.answer_cn,
            answer_en: self.answer_en,
            explanation_cn: self.explanation_cn,
            explanation_en: self.explanation_en,
            metadata: self.metadata,
            knowledge_point_id: self.knowledge_point_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub images: Vec<String>,
}
