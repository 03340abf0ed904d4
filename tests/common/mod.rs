#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tutor_pool::config::DedupeSettings;
use tutor_pool::database::question_store::{Placement, QuestionStore};
use tutor_pool::error::{Error, Result};
use tutor_pool::models::history::{HistoryRecord, StoredEmbedding};
use tutor_pool::models::knowledge_point::{GradeSubjectProfile, KnowledgePoint, KnowledgePointScore};
use tutor_pool::models::question::{BilingualOptions, CandidateQuestion, Question};
use tutor_pool::services::ai_service::LlmProvider;
use tutor_pool::services::assembler_service::{AssembleRequest, PoolAssembler};
use tutor_pool::services::embed_service::{
    cosine_sim, EmbedMode, MetadataFilter, VectorIndex, VectorMatch, VectorRecord,
    QUESTION_METADATA_KIND,
};
use tutor_pool::services::prompts::Lang;
use tutor_pool::utils::fingerprint::content_options_hash;

pub const GRADE: i32 = 3;
pub const SUBJECT: i32 = 1;
pub const STUDENT: i32 = 42;

struct StoredRow {
    question: Question,
    grade_id: i32,
    subject_id: i32,
    embedding: Option<Vec<f32>>,
}

#[derive(Default)]
struct StoreInner {
    rows: Vec<StoredRow>,
    history: Vec<HistoryRecord>,
    knowledge_points: Vec<(i32, i32, KnowledgePoint)>,
    usernames: HashMap<i32, String>,
}

/// In-memory relational store with the same uniqueness rule as the real table.
#[derive(Default)]
pub struct FakeStore {
    inner: Mutex<StoreInner>,
}

impl FakeStore {
    pub fn with_knowledge_points(grade_id: i32, subject_id: i32, ids: &[i32]) -> Arc<Self> {
        let store = Self::default();
        {
            let mut inner = store.inner.lock().unwrap();
            for (order, id) in ids.iter().enumerate() {
                let mut kp = KnowledgePoint::new(*id);
                kp.name_en = Some(format!("Point {}", id));
                kp.sort_order = Some(order as i32);
                inner.knowledge_points.push((grade_id, subject_id, kp));
            }
        }
        Arc::new(store)
    }

    pub fn add_user(&self, id: i32, username: &str) {
        self.inner.lock().unwrap().usernames.insert(id, username.to_string());
    }

    /// Seed a stored question and return its id.
    pub fn seed_question(&self, grade_id: i32, subject_id: i32, kp: i32, content_en: &str) -> i32 {
        let options = four_options();
        let mut inner = self.inner.lock().unwrap();
        let id = inner.rows.len() as i32 + 1;
        inner.rows.push(StoredRow {
            question: Question {
                id,
                question_type: "mcq".into(),
                content_cn: content_en.into(),
                content_en: content_en.into(),
                content_options_hash: Some(content_options_hash(content_en, &options.en)),
                options,
                answer_cn: "1".into(),
                answer_en: "1".into(),
                explanation_cn: String::new(),
                explanation_en: String::new(),
                metadata: None,
                knowledge_point_id: Some(kp),
            },
            grade_id,
            subject_id,
            embedding: None,
        });
        id
    }

    pub fn question_count(&self) -> usize {
        self.inner.lock().unwrap().rows.len()
    }

    pub fn stored_hashes(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .rows
            .iter()
            .filter_map(|r| r.question.content_options_hash.clone())
            .collect()
    }

    fn seen_by(inner: &StoreInner, user_ids: &[i32]) -> HashSet<i32> {
        inner
            .history
            .iter()
            .filter(|h| user_ids.contains(&h.user_id))
            .map(|h| h.question_id)
            .collect()
    }

    fn history_rows<'a>(
        inner: &'a StoreInner,
        user_ids: &'a [i32],
        grade_id: i32,
        subject_id: i32,
    ) -> impl Iterator<Item = (&'a HistoryRecord, &'a StoredRow)> + 'a {
        inner
            .history
            .iter()
            .filter(move |h| user_ids.contains(&h.user_id))
            .filter_map(move |h| {
                inner
                    .rows
                    .iter()
                    .find(|r| r.question.id == h.question_id)
                    .filter(|r| r.grade_id == grade_id && r.subject_id == subject_id)
                    .map(|r| (h, r))
            })
    }
}

#[async_trait]
impl QuestionStore for FakeStore {
    async fn query_unused_questions(
        &self,
        user_ids: &[i32],
        grade_id: i32,
        subject_id: i32,
        knowledge_point_id: Option<i32>,
        limit: i64,
    ) -> Result<Vec<Question>> {
        let inner = self.inner.lock().unwrap();
        let seen = Self::seen_by(&inner, user_ids);
        Ok(inner
            .rows
            .iter()
            .filter(|r| r.grade_id == grade_id && r.subject_id == subject_id)
            .filter(|r| knowledge_point_id.map_or(true, |kp| r.question.knowledge_point_id == Some(kp)))
            .filter(|r| !seen.contains(&r.question.id))
            .take(limit.max(0) as usize)
            .map(|r| r.question.clone())
            .collect())
    }

    async fn upsert_question_by_hash(
        &self,
        question: &CandidateQuestion,
        placement: Placement,
    ) -> Result<Option<i32>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(row) = inner
            .rows
            .iter_mut()
            .find(|r| r.question.content_options_hash.as_deref() == Some(question.content_options_hash.as_str()))
        {
            if question.embedding.is_some() {
                row.embedding = question.embedding.clone();
            }
            return Ok(Some(row.question.id));
        }
        let id = inner.rows.len() as i32 + 1;
        inner.rows.push(StoredRow {
            question: question.clone().into_question(id),
            grade_id: placement.grade_id,
            subject_id: placement.subject_id,
            embedding: question.embedding.clone(),
        });
        Ok(Some(id))
    }

    async fn select_id_by_hash(&self, hash: &str) -> Result<Option<i32>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .rows
            .iter()
            .find(|r| r.question.content_options_hash.as_deref() == Some(hash))
            .map(|r| r.question.id))
    }

    async fn existing_hashes(&self, hashes: &[String]) -> Result<HashSet<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .rows
            .iter()
            .filter_map(|r| r.question.content_options_hash.clone())
            .filter(|h| hashes.contains(h))
            .collect())
    }

    async fn query_knowledge_point_attempt_counts(
        &self,
        user_ids: &[i32],
        grade_id: i32,
        subject_id: i32,
        knowledge_point_ids: &[i32],
    ) -> Result<HashMap<i32, i64>> {
        let inner = self.inner.lock().unwrap();
        let mut counts = HashMap::new();
        for (_, row) in Self::history_rows(&inner, user_ids, grade_id, subject_id) {
            if let Some(kp) = row.question.knowledge_point_id.filter(|kp| knowledge_point_ids.contains(kp)) {
                *counts.entry(kp).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn knowledge_point_scores(
        &self,
        user_ids: &[i32],
        grade_id: i32,
        subject_id: i32,
    ) -> Result<Vec<KnowledgePointScore>> {
        let inner = self.inner.lock().unwrap();
        let mut by_kp: HashMap<i32, (i64, i64)> = HashMap::new();
        for (h, row) in Self::history_rows(&inner, user_ids, grade_id, subject_id) {
            if let Some(kp) = row.question.knowledge_point_id {
                let entry = by_kp.entry(kp).or_insert((0, 0));
                entry.0 += 1;
                if h.correct {
                    entry.1 += 1;
                }
            }
        }
        Ok(by_kp
            .into_iter()
            .map(|(kp, (total, correct))| KnowledgePointScore {
                knowledge_point_id: kp,
                total,
                correct,
            })
            .collect())
    }

    async fn query_frequent_history_metadata(
        &self,
        user_ids: &[i32],
        grade_id: i32,
        subject_id: i32,
        knowledge_point_id: Option<i32>,
        top_n: i64,
    ) -> Result<Vec<JsonValue>> {
        let inner = self.inner.lock().unwrap();
        let mut counts: Vec<(JsonValue, i64)> = Vec::new();
        for (_, row) in Self::history_rows(&inner, user_ids, grade_id, subject_id) {
            if knowledge_point_id.is_some() && row.question.knowledge_point_id != knowledge_point_id {
                continue;
            }
            let Some(md) = row.question.metadata.as_ref() else {
                continue;
            };
            let md = serde_json::to_value(md)?;
            match counts.iter_mut().find(|(m, _)| *m == md) {
                Some((_, c)) => *c += 1,
                None => counts.push((md, 1)),
            }
        }
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(counts.into_iter().take(top_n.max(0) as usize).map(|(m, _)| m).collect())
    }

    async fn history_question_metadata(
        &self,
        user_ids: &[i32],
        grade_id: i32,
        subject_id: i32,
        limit: i64,
    ) -> Result<Vec<(Option<Vec<f32>>, Option<JsonValue>)>> {
        let inner = self.inner.lock().unwrap();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (_, row) in Self::history_rows(&inner, user_ids, grade_id, subject_id) {
            if row.question.metadata.is_none() || !seen.insert(row.question.id) {
                continue;
            }
            let md = serde_json::to_value(&row.question.metadata)?;
            out.push((row.embedding.clone(), Some(md)));
        }
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn recent_embeddings(
        &self,
        grade_id: i32,
        subject_id: i32,
        limit: i64,
    ) -> Result<Vec<StoredEmbedding>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .rows
            .iter()
            .rev()
            .filter(|r| r.grade_id == grade_id && r.subject_id == subject_id)
            .filter_map(|r| {
                r.embedding.clone().map(|embedding| StoredEmbedding {
                    question_id: r.question.id,
                    content_options_hash: r.question.content_options_hash.clone(),
                    embedding,
                })
            })
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn active_knowledge_points(&self, grade_id: i32, subject_id: i32) -> Result<Vec<KnowledgePoint>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .knowledge_points
            .iter()
            .filter(|(g, s, _)| *g == grade_id && *s == subject_id)
            .map(|(_, _, kp)| kp.clone())
            .collect())
    }

    async fn grade_subject_profile(
        &self,
        _grade_id: i32,
        _subject_id: i32,
    ) -> Result<Option<GradeSubjectProfile>> {
        Ok(Some(GradeSubjectProfile {
            grade_code: Some("G3".into()),
            grade_level: Some(3),
            subject_code: Some("MATH".into()),
            notes: None,
        }))
    }

    async fn merged_user_ids(&self, user_id: i32) -> Result<Vec<i32>> {
        let inner = self.inner.lock().unwrap();
        let Some(name) = inner.usernames.get(&user_id) else {
            return Ok(Vec::new());
        };
        let mut ids: Vec<i32> = inner
            .usernames
            .iter()
            .filter(|(_, n)| *n == name)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn append_history(&self, record: &HistoryRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.rows.iter().any(|r| r.question.id == record.question_id) {
            return Err(Error::NotFound(format!("question {}", record.question_id)));
        }
        inner.history.push(record.clone());
        Ok(())
    }
}

/// Deterministic embedding: equal texts give equal vectors, different texts
/// are practically orthogonal.
pub fn fake_vector(text: &str) -> Vec<f32> {
    Sha256::digest(text.as_bytes())
        .iter()
        .map(|b| (*b as f32 - 127.5) / 127.5)
        .collect()
}

#[derive(Default)]
pub struct FakeIndex {
    records: Mutex<HashMap<String, VectorRecord>>,
}

impl FakeIndex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn record(&self, id: &str) -> Option<VectorRecord> {
        self.records.lock().unwrap().get(id).cloned()
    }
}

fn metadata_matches(md: &JsonValue, filter: &MetadataFilter) -> bool {
    md["kind"] == QUESTION_METADATA_KIND
        && md["grade_id"] == filter.grade_id
        && md["subject_id"] == filter.subject_id
        && filter
            .knowledge_point_id
            .map_or(true, |kp| md["knowledge_point_id"] == kp)
}

#[async_trait]
impl VectorIndex for FakeIndex {
    async fn embed(&self, texts: &[String], _mode: EmbedMode) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| fake_vector(t)).collect())
    }

    async fn query_by_vector(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<VectorMatch>> {
        let records = self.records.lock().unwrap();
        let mut matches: Vec<VectorMatch> = records
            .values()
            .filter(|r| r.metadata.as_ref().map_or(false, |md| metadata_matches(md, filter)))
            .map(|r| VectorMatch {
                id: r.id.clone(),
                score: cosine_sim(vector, &r.values),
                metadata: r.metadata.clone(),
            })
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(top_k.max(1));
        Ok(matches)
    }

    async fn upsert_vectors(&self, records: Vec<VectorRecord>) -> Result<()> {
        let mut stored = self.records.lock().unwrap();
        for r in records {
            stored.insert(r.id.clone(), r);
        }
        Ok(())
    }
}

type Script = dyn Fn(usize, &str) -> String + Send + Sync;

/// LLM double answering from a script keyed by call index.
pub struct ScriptedLlm {
    script: Box<Script>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new(script: impl Fn(usize, &str) -> String + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn complete_json(&self, _system: &str, user: &str, _max_tokens: u32) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(user.to_string());
        Ok((self.script)(call, user))
    }
}

pub fn four_options() -> BilingualOptions {
    let opts: Vec<String> = ["1", "2", "3", "4"].iter().map(|s| s.to_string()).collect();
    BilingualOptions {
        zh: opts.clone(),
        en: opts,
    }
}

/// One provider item whose answer is "1" and whose metadata is an addition of `nums`.
pub fn generated_item(content: &str, nums: [i64; 2]) -> JsonValue {
    json!({
        "type": "mcq",
        "content_cn": content,
        "content_en": content,
        "options": {"zh": ["1", "2", "3", "4"], "en": ["1", "2", "3", "4"]},
        "answer_cn": "1",
        "answer_en": "1",
        "explanation_cn": "",
        "explanation_en": "",
        "metadata": {"type": "addition", "nums": nums, "context": null}
    })
}

pub fn llm_batch(items: Vec<JsonValue>) -> String {
    json!({
        "lesson": {"title": "Warm-up", "explanation": "Short practice.", "images": []},
        "questions": items
    })
    .to_string()
}

pub fn request(n: usize) -> AssembleRequest {
    AssembleRequest {
        num_questions: n,
        grade_id: GRADE,
        subject_id: SUBJECT,
        knowledge_point_id: None,
        preferred_knowledge_point_ids: None,
        student_user_ids: vec![STUDENT],
        lang: Lang::En,
        student_profile: json!({"name": "Ana"}),
    }
}

pub fn assembler(
    store: Arc<FakeStore>,
    llm: Option<Arc<ScriptedLlm>>,
    index: Option<Arc<FakeIndex>>,
) -> PoolAssembler {
    PoolAssembler::new(
        store,
        llm.map(|l| l as Arc<dyn LlmProvider>),
        index.map(|i| i as Arc<dyn VectorIndex>),
        DedupeSettings::default(),
    )
}
