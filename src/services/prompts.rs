//! Generation prompt templates (English and Chinese).
//!
//! Placeholders use `{{name}}` and are filled by [`apply_template`]. The
//! templates ask for metadata in a language-independent shape because that
//! object is what dedupe embeds.

use crate::models::knowledge_point::GradeSubjectProfile;
use crate::models::question::Lesson;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    En,
    #[default]
    Zh,
}

pub const SYSTEM_EN: &str = r#"You are an assessment designer. Produce ONLY valid JSON. Keep text minimal; the output must be parseable.

Quality rules (apply internally, do NOT output your working):
- For any math or fact, solve it and then check it again.
- The correct answer must really be correct and must appear in the options exactly once.
- Distractors must be wrong but plausible.
- Explanations are one sentence, no step-by-step working.

For shape recognition or geometry, never rely on pictures. Describe the shape by its properties in text."#;

pub const SYSTEM_ZH: &str = r#"你是出题与诊断的教师，只输出严格、可解析的 JSON，内容尽量简短。

质量规则（在内部完成计算与复核，不要输出演算过程）：
- 数学或事实类题目必须先算出正确答案，再自检一遍。
- 正确答案必须真的正确，并且在选项中只出现一次。
- 干扰项必须错误但合理。
- 解析只写一句话。

涉及图形识别时不要依赖图片，请用文字描述图形的特征来出题。"#;

pub const USER_EN: &str = r#"Generate a diagnostic test for this student. Inputs: {{student_profile}}.
Grade/difficulty guidance (MUST follow): {{grade_guidance}}

Generate exactly {{num_questions}} questions. Every question is multiple choice (type "mcq") with exactly 4 options in each language (options.en and options.zh both have length 4) and exactly one correct answer. Reference snippets: {{retrieval_snippets}}.

Metadata (used for deduplication):
- Every question has a "metadata" object. It must be specific, stable and language-independent; free-text values are in English.
- Math questions use exactly {"type": "division"|"multiplication"|"addition"|"subtraction"|"fraction"|"geometry"|"other", "nums": number[], "context": string|null}, e.g. {"type":"division","nums":[12,3],"context":"apples"}.
- Other subjects may use any stable object; vocabulary questions prefer {"type":"vocabulary","word":"apple","context":"fruit"}.
- Avoid questions similar to these frequent patterns for this student: {{avoid_metadata}}.
- When a story template repeats, change the numbers.

Knowledge points are pre-seeded; do not invent new ones: {{knowledge_points}}.
Assignment plan per question index: {{knowledge_point_ids_plan}}. It has length {{num_questions}}; question i (0-based) MUST have knowledge_point_id equal to plan[i].

Return strict JSON: {"lesson": {"title","explanation","images":[]}, "questions": [{"id","type":"mcq","content_cn":"string","content_en":"string","options":{"zh":["","","",""],"en":["","","",""]},"answer_cn":"string","answer_en":"string","explanation_cn":"string","explanation_en":"string","knowledge_point_id":123,"metadata":{}}]}. Provide every text field in both Chinese and English. Return nothing but JSON."#;

pub const USER_ZH: &str = r#"为学生生成诊断测试。输入：{{student_profile}}。
年级/难度要求（必须遵守）：{{grade_guidance}}

严格生成 {{num_questions}} 道题。全部为四选一选择题（type: "mcq"），options.en 与 options.zh 都必须有 4 个选项，且只有一个正确答案。参考片段：{{retrieval_snippets}}。

metadata（用于去重）：
- 每道题必须有 metadata 对象，要具体、稳定、与语言无关；自由文本一律用英文。
- 数学题严格使用 {"type":"division"|"multiplication"|"addition"|"subtraction"|"fraction"|"geometry"|"other","nums":number[],"context":string|null}，例如 {"type":"division","nums":[12,3],"context":"apples"}。
- 其他学科可用任意稳定对象；词汇题建议 {"type":"vocabulary","word":"apple","context":"fruit"}。
- 避开该学生高频出现的模式：{{avoid_metadata}}。
- 情境重复时请更换数字。

知识点已预先入库，不要自造：{{knowledge_points}}。
每道题的知识点分配计划：{{knowledge_point_ids_plan}}，长度为 {{num_questions}}；第 i 题（从 0 开始）的 knowledge_point_id 必须等于 plan[i]。

返回严格 JSON：{"lesson": {"title","explanation","images":[]}, "questions": [{"id","type":"mcq","content_cn":"string","content_en":"string","options":{"zh":["","","",""],"en":["","","",""]},"answer_cn":"string","answer_en":"string","explanation_cn":"string","explanation_en":"string","knowledge_point_id":123,"metadata":{}}]}。所有文本字段都要中英文齐全。只返回 JSON。"#;

/// Values substituted into the user template.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    pub student_profile: JsonValue,
    pub grade_guidance: String,
    pub num_questions: usize,
    pub knowledge_points: JsonValue,
    pub knowledge_point_ids_plan: Vec<i32>,
    pub avoid_metadata: Vec<JsonValue>,
}

pub fn system_prompt(lang: Lang) -> &'static str {
    match lang {
        Lang::En => SYSTEM_EN,
        Lang::Zh => SYSTEM_ZH,
    }
}

pub fn user_prompt(lang: Lang, inputs: &PromptInputs) -> String {
    let template = match lang {
        Lang::En => USER_EN,
        Lang::Zh => USER_ZH,
    };
    let plan = serde_json::to_string(&inputs.knowledge_point_ids_plan).unwrap_or_else(|_| "[]".into());
    let avoid = serde_json::to_string(&inputs.avoid_metadata).unwrap_or_else(|_| "[]".into());
    apply_template(
        template,
        &[
            ("student_profile", inputs.student_profile.to_string()),
            ("grade_guidance", inputs.grade_guidance.clone()),
            ("num_questions", inputs.num_questions.to_string()),
            ("retrieval_snippets", "[]".to_string()),
            ("knowledge_points", inputs.knowledge_points.to_string()),
            ("knowledge_point_ids_plan", plan),
            ("avoid_metadata", avoid),
        ],
    )
}

/// Replace every `{{key}}`. Unknown placeholders are left as they are.
pub fn apply_template(template: &str, vars: &[(&str, String)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{{{}}}}}", key), value)
    })
}

/// Admin scope notes win; otherwise a short generic instruction naming the
/// grade and subject codes.
pub fn grade_guidance(lang: Lang, profile: &GradeSubjectProfile) -> String {
    if let Some(notes) = profile.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        return notes.to_string();
    }
    let subject = profile.subject_code.as_deref().unwrap_or_default();
    let grade = profile
        .grade_code
        .clone()
        .or_else(|| profile.grade_level.map(|l| format!("G{}", l)))
        .unwrap_or_default();

    match lang {
        Lang::Zh => {
            let g = if grade.is_empty() { String::new() } else { format!("（{}）", grade) };
            let s = if subject.is_empty() { String::new() } else { format!("（{}）", subject) };
            format!("请严格围绕 knowledge_points 出题，并匹配该年级{}与学科{}的常见范围与难度；不要超纲。", g, s)
        }
        Lang::En => format!(
            "Stay strictly within the provided knowledge_points and match the typical scope/difficulty for grade {} and subject {}; do not go beyond scope.",
            if grade.is_empty() { "(unknown)" } else { grade.as_str() },
            if subject.is_empty() { "(unknown)" } else { subject },
        ),
    }
}

pub fn default_lesson(lang: Lang) -> Lesson {
    match lang {
        Lang::Zh => Lesson {
            title: "诊断测试".to_string(),
            explanation: "请完成以下题目以评估学习水平。".to_string(),
            images: Vec::new(),
        },
        Lang::En => Lesson {
            title: "Diagnostic Test".to_string(),
            explanation: "Please complete these questions to assess your level.".to_string(),
            images: Vec::new(),
        },
    }
}
