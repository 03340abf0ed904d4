use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgePoint {
    pub id: i32,
    pub name_cn: Option<String>,
    pub name_en: Option<String>,
    pub unit_name_cn: Option<String>,
    pub unit_name_en: Option<String>,
    pub description: Option<String>,
    pub sort_order: Option<i32>,
}

impl KnowledgePoint {
    pub fn new(id: i32) -> Self {
        Self {
            id,
            name_cn: None,
            name_en: None,
            unit_name_cn: None,
            unit_name_en: None,
            description: None,
            sort_order: None,
        }
    }
}

/// Accuracy of one student (all merged accounts) on one knowledge point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgePointScore {
    pub knowledge_point_id: i32,
    pub total: i64,
    pub correct: i64,
}

impl KnowledgePointScore {
    pub fn score_percent(&self) -> f64 {
        if self.total > 0 {
            self.correct as f64 / self.total as f64 * 100.0
        } else {
            0.0
        }
    }
}

/// Admin-maintained scope for one grade/subject pairing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradeSubjectProfile {
    pub grade_code: Option<String>,
    pub grade_level: Option<i32>,
    pub subject_code: Option<String>,
    pub notes: Option<String>,
}
