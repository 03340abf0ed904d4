use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::Validate;

use crate::models::question::{Lesson, Question};
use crate::services::assembler_service::{AssembleOutput, AssembleRequest};
use crate::services::prompts::Lang;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AssembleQuestionsRequest {
    #[validate(range(min = 1, max = 50))]
    pub num_questions: u32,
    pub grade_id: i32,
    pub subject_id: i32,
    pub knowledge_point_id: Option<i32>,
    pub preferred_knowledge_point_ids: Option<Vec<i32>>,
    /// Every account of the student; merged accounts are added server-side.
    #[validate(length(min = 1))]
    pub student_user_ids: Vec<i32>,
    #[serde(default)]
    pub lang: Lang,
    pub student_profile: Option<JsonValue>,
}

impl From<AssembleQuestionsRequest> for AssembleRequest {
    fn from(req: AssembleQuestionsRequest) -> Self {
        Self {
            num_questions: req.num_questions as usize,
            grade_id: req.grade_id,
            subject_id: req.subject_id,
            knowledge_point_id: req.knowledge_point_id,
            preferred_knowledge_point_ids: req.preferred_knowledge_point_ids,
            student_user_ids: req.student_user_ids,
            lang: req.lang,
            student_profile: req.student_profile.unwrap_or(JsonValue::Null),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembleQuestionsResponse {
    pub lesson: Lesson,
    pub questions: Vec<Question>,
    pub total: usize,
    pub generated: usize,
}

impl From<AssembleOutput> for AssembleQuestionsResponse {
    fn from(out: AssembleOutput) -> Self {
        Self {
            total: out.questions.len(),
            generated: out.generated,
            lesson: out.lesson,
            questions: out.questions,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppendHistoryRequest {
    #[validate(range(min = 1))]
    pub user_id: i32,
    #[validate(range(min = 1))]
    pub question_id: i32,
    #[validate(length(max = 1000))]
    pub given_answer: String,
    pub correct: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendHistoryResponse {
    pub recorded: bool,
    pub question_id: i32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}
