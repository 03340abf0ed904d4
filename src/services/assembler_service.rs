use crate::config::DedupeSettings;
use crate::database::question_store::{commit_question, Placement, QuestionStore};
use crate::error::{Error, Result};
use crate::models::history::StoredEmbedding;
use crate::models::knowledge_point::{GradeSubjectProfile, KnowledgePoint, KnowledgePointScore};
use crate::models::question::{CandidateQuestion, Lesson, Question, QuestionMetadata};
use crate::services::ai_service::LlmProvider;
use crate::services::embed_service::{
    EmbedMode, MetadataFilter, VectorIndex, VectorRecord, QUESTION_METADATA_KIND,
};
use crate::services::generation_service::{GenerationRequest, GenerationService, DEFAULT_MAX_TOKENS};
use crate::services::metadata_service::{DedupeContext, MetadataService};
use crate::services::planner_service::PlannerService;
use crate::services::prompts::{self, Lang};
use crate::services::selector_service::{KpScope, SelectionRequest, SelectorService};
use crate::services::similarity_service::{DedupeConfig, SimilarityService};
use crate::utils::fingerprint::Fingerprinted;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value as JsonValue};
use std::collections::HashSet;
use std::sync::Arc;

const METADATA_RELAX_STEP: f32 = 0.04;
const SEMANTIC_RELAX_STEP: f32 = 0.03;
const MAX_THRESHOLD: f32 = 0.999;
const METADATA_GATE_TOP_K: usize = 3;
const RECENT_EMBEDDINGS_LIMIT: i64 = 2000;

/// Gate strictness for one fill attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttemptSettings {
    pub attempt: usize,
    pub enable_metadata: bool,
    pub enable_semantic: bool,
    pub metadata_threshold: f32,
    pub semantic_threshold: f32,
    /// Pre-insert dedupe handed to generation rounds of this attempt.
    pub question_dedupe: DedupeConfig,
}

fn relax(base: f32, step: f32, attempt: usize) -> f32 {
    (base + step * attempt as f32).min(MAX_THRESHOLD).max(base)
}

impl AttemptSettings {
    pub fn for_attempt(attempt: usize, base: &DedupeSettings) -> Self {
        Self {
            attempt,
            enable_metadata: attempt < 2,
            enable_semantic: base.semantic_enabled && attempt < 1,
            metadata_threshold: relax(base.metadata_threshold, METADATA_RELAX_STEP, attempt),
            semantic_threshold: relax(base.semantic_threshold, SEMANTIC_RELAX_STEP, attempt),
            question_dedupe: DedupeConfig {
                enabled: base.question_dedupe_enabled,
                threshold: relax(base.question_dedupe_threshold, METADATA_RELAX_STEP, attempt),
                top_k: base.top_k,
            },
        }
    }
}

/// One row per fill attempt, in order.
pub fn attempt_table(base: &DedupeSettings) -> Vec<AttemptSettings> {
    (0..base.max_attempts)
        .map(|a| AttemptSettings::for_attempt(a, base))
        .collect()
}

#[derive(Debug, Clone)]
pub struct AssembleRequest {
    pub num_questions: usize,
    pub grade_id: i32,
    pub subject_id: i32,
    pub knowledge_point_id: Option<i32>,
    pub preferred_knowledge_point_ids: Option<Vec<i32>>,
    pub student_user_ids: Vec<i32>,
    pub lang: Lang,
    pub student_profile: JsonValue,
}

#[derive(Debug, Clone)]
pub struct AssembleOutput {
    pub questions: Vec<Question>,
    pub lesson: Lesson,
    pub generated: usize,
}

/// Rank practised points by lowest accuracy, then fewest attempts, then at
/// random, keeping only allowed ids.
pub fn rank_focus_points<R: Rng>(
    mut scores: Vec<KnowledgePointScore>,
    allowed: &[i32],
    desired: usize,
    rng: &mut R,
) -> Vec<i32> {
    scores.retain(|s| allowed.contains(&s.knowledge_point_id));
    scores.shuffle(rng);
    scores.sort_by(|a, b| {
        a.score_percent()
            .total_cmp(&b.score_percent())
            .then(a.total.cmp(&b.total))
    });
    scores
        .into_iter()
        .map(|s| s.knowledge_point_id)
        .take(desired)
        .collect()
}

#[derive(Clone)]
pub struct PoolAssembler {
    store: Arc<dyn QuestionStore>,
    llm: Option<Arc<dyn LlmProvider>>,
    index: Option<Arc<dyn VectorIndex>>,
    settings: DedupeSettings,
    selector: SelectorService,
    planner: PlannerService,
}

impl PoolAssembler {
    pub fn new(
        store: Arc<dyn QuestionStore>,
        llm: Option<Arc<dyn LlmProvider>>,
        index: Option<Arc<dyn VectorIndex>>,
        settings: DedupeSettings,
    ) -> Self {
        Self {
            selector: SelectorService::new(store.clone()),
            planner: PlannerService::new(store.clone()),
            store,
            llm,
            index,
            settings,
        }
    }

    pub fn settings(&self) -> &DedupeSettings {
        &self.settings
    }

    /// Both generation collaborators are configured.
    pub fn can_generate(&self) -> bool {
        self.llm.is_some() && self.index.is_some()
    }

    pub async fn assemble(&self, req: AssembleRequest) -> Result<AssembleOutput> {
        let n = req.num_questions;
        if n == 0 {
            return Err(Error::BadRequest("num_questions must be at least 1".to_string()));
        }
        if req.student_user_ids.is_empty() {
            return Err(Error::BadRequest("student_user_ids required".to_string()));
        }

        let user_ids = self.merge_user_ids(&req.student_user_ids).await;
        let knowledge_points = self.knowledge_points_for(&req).await?;
        let allowed: Vec<i32> = knowledge_points.iter().map(|k| k.id).collect();

        let scope = match (req.knowledge_point_id, &req.preferred_knowledge_point_ids) {
            (Some(kp), _) => KpScope::Single(kp),
            (None, Some(ids)) if !ids.is_empty() => KpScope::Preferred(ids.clone()),
            _ => {
                let focus = self.focus_points(&user_ids, &req, &allowed, n).await;
                if focus.is_empty() {
                    KpScope::Any
                } else {
                    KpScope::Preferred(focus)
                }
            }
        };

        let mut questions = self
            .selector
            .select_unused(&SelectionRequest {
                user_ids: &user_ids,
                grade_id: req.grade_id,
                subject_id: req.subject_id,
                scope: &scope,
                limit: n,
                allowed: &allowed,
            })
            .await;
        tracing::info!(selected = questions.len(), need = n, "DB-first selection done");

        if questions.len() >= n {
            questions.truncate(n);
            return Ok(AssembleOutput {
                questions,
                lesson: prompts::default_lesson(req.lang),
                generated: 0,
            });
        }

        let (llm, index) = match (&self.llm, &self.index) {
            (Some(l), Some(i)) => (l.clone(), i.clone()),
            (None, _) => return Err(Error::Config("OpenAI not configured".to_string())),
            (_, None) => return Err(Error::Config("Vector index not configured".to_string())),
        };
        let oracle = SimilarityService::new(index);
        let generator = GenerationService::new(llm, self.store.clone(), oracle.clone(), self.planner.clone());

        let profile = self.grade_profile(&req).await;
        let grade_guidance = prompts::grade_guidance(req.lang, &profile);
        let student_profile = build_student_profile(&req, &profile, &scope);

        let mut fill = FillState::new(&questions);
        let existing = self.recent_embeddings(&req).await;
        let placement = Placement {
            grade_id: req.grade_id,
            subject_id: req.subject_id,
        };

        let mut pool: Vec<CandidateQuestion> = Vec::new();
        let mut lesson: Option<Lesson> = None;
        let mut last_generation_error: Option<Error> = None;
        let mut generated_total = 0usize;

        for settings in attempt_table(&self.settings) {
            if questions.len() >= n {
                break;
            }
            let remaining = n - questions.len();

            if pool.len() < remaining {
                let gen_req = GenerationRequest {
                    missing: remaining,
                    user_ids: &user_ids,
                    grade_id: req.grade_id,
                    subject_id: req.subject_id,
                    kp_filter: req.knowledge_point_id,
                    knowledge_points: &knowledge_points,
                    lang: req.lang,
                    student_profile: &student_profile,
                    grade_guidance: &grade_guidance,
                    dedupe: settings.question_dedupe,
                    avoid_threshold: self.settings.avoid_threshold,
                    max_tokens: DEFAULT_MAX_TOKENS,
                };
                let known = fill.known_hashes(&pool);
                match generator.generate(&gen_req, &known).await {
                    Ok(out) => {
                        generated_total += out.accepted.len();
                        pool.extend(out.accepted);
                        if lesson.is_none() {
                            lesson = out.lesson;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, attempt = settings.attempt, "generation round failed");
                        last_generation_error = Some(e);
                    }
                }
            }

            let before = questions.len();
            let mut leftover = Vec::with_capacity(pool.len());
            for candidate in std::mem::take(&mut pool) {
                if questions.len() >= n {
                    leftover.push(candidate);
                    continue;
                }
                if self
                    .blocked_by_gates(&candidate, &settings, &oracle, &existing, &req)
                    .await
                {
                    leftover.push(candidate);
                    continue;
                }
                if let Some(q) = self.commit(candidate, placement, &oracle, &mut fill).await {
                    questions.push(q);
                }
            }
            pool = leftover;

            tracing::info!(
                attempt = settings.attempt,
                added = questions.len() - before,
                now = questions.len(),
                need = n,
                enable_metadata = settings.enable_metadata,
                enable_semantic = settings.enable_semantic,
                metadata_threshold = settings.metadata_threshold,
                semantic_threshold = settings.semantic_threshold,
                "fill attempt done"
            );
        }

        if questions.len() < n {
            if generated_total == 0 {
                if let Some(e) = last_generation_error {
                    return Err(e);
                }
            }
            return Err(Error::InsufficientQuestions {
                requested: n,
                returned: questions.len(),
            });
        }

        let generated = questions.len() - fill.selected;
        Ok(AssembleOutput {
            questions,
            lesson: lesson.unwrap_or_else(|| prompts::default_lesson(req.lang)),
            generated,
        })
    }

    /// True when a gate says the candidate is too close to something stored.
    /// Gate failures never block.
    async fn blocked_by_gates(
        &self,
        candidate: &CandidateQuestion,
        settings: &AttemptSettings,
        oracle: &SimilarityService,
        existing: &[StoredEmbedding],
        req: &AssembleRequest,
    ) -> bool {
        if settings.enable_metadata {
            let text = MetadataService::dedupe_text(candidate, dedupe_context(req, candidate));
            if !text.is_empty() {
                let filter = MetadataFilter::new(req.grade_id, req.subject_id);
                match oracle.best_remote_score(&text, METADATA_GATE_TOP_K, &filter).await {
                    Ok(Some(score)) if score.is_finite() && score >= settings.metadata_threshold => {
                        tracing::debug!(
                            score,
                            threshold = settings.metadata_threshold,
                            hash = %candidate.content_options_hash,
                            "metadata gate skip"
                        );
                        return true;
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "metadata gate unavailable"),
                }
            }
        }

        if settings.enable_semantic && !existing.is_empty() {
            if let Some(v) = candidate.embedding.as_deref() {
                if let Some(best) = SimilarityService::best_stored(v, existing) {
                    if best.score >= settings.semantic_threshold {
                        tracing::debug!(
                            similarity = best.score,
                            existing_id = best.question_id,
                            "semantic gate skip"
                        );
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Persist, then index the metadata vector best-effort. `None` drops the
    /// candidate for good.
    async fn commit(
        &self,
        candidate: CandidateQuestion,
        placement: Placement,
        oracle: &SimilarityService,
        fill: &mut FillState,
    ) -> Option<Question> {
        if fill.hashes.contains(&candidate.content_options_hash) {
            return None;
        }
        let Some(id) = commit_question(self.store.as_ref(), &candidate, placement).await else {
            tracing::warn!(hash = %candidate.content_options_hash, "dropped: no persisted id");
            return None;
        };
        if !fill.ids.insert(id) {
            tracing::warn!(id, "dropped: commit resolved to a question already in this pool");
            return None;
        }
        fill.hashes.insert(candidate.content_options_hash.clone());

        self.index_metadata(id, &candidate, placement, oracle).await;
        Some(candidate.into_question(id))
    }

    async fn index_metadata(
        &self,
        id: i32,
        candidate: &CandidateQuestion,
        placement: Placement,
        oracle: &SimilarityService,
    ) {
        let ctx = DedupeContext {
            grade_id: Some(placement.grade_id),
            subject_id: Some(placement.subject_id),
            knowledge_point_id: candidate.knowledge_point_id,
        };
        let text = MetadataService::dedupe_text(candidate, ctx);
        if text.is_empty() {
            return;
        }
        let vector = match oracle.embed_one(&text, EmbedMode::Passage).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, id, "metadata vector not indexed");
                return;
            }
        };
        let record = VectorRecord {
            id: format!("qmeta:{}", id),
            values: vector,
            metadata: Some(json!({
                "kind": QUESTION_METADATA_KIND,
                "question_id": id,
                "grade_id": placement.grade_id,
                "subject_id": placement.subject_id,
                "knowledge_point_id": candidate.knowledge_point_id,
                "expression": metadata_expression(candidate.metadata.as_ref()),
                "content_options_hash": candidate.content_options_hash,
            })),
        };
        if let Err(e) = oracle.index().upsert_vectors(vec![record]).await {
            tracing::warn!(error = %e, id, "vector upsert failed");
        }
    }

    async fn merge_user_ids(&self, ids: &[i32]) -> Vec<i32> {
        let mut merged: Vec<i32> = Vec::new();
        for &id in ids {
            match self.store.merged_user_ids(id).await {
                Ok(found) if !found.is_empty() => merged.extend(found),
                Ok(_) => merged.push(id),
                Err(e) => {
                    tracing::warn!(error = %e, user_id = id, "account merge failed");
                    merged.push(id);
                }
            }
        }
        merged.sort_unstable();
        merged.dedup();
        merged
    }

    async fn knowledge_points_for(&self, req: &AssembleRequest) -> Result<Vec<KnowledgePoint>> {
        let all = self
            .store
            .active_knowledge_points(req.grade_id, req.subject_id)
            .await?;
        if all.is_empty() {
            return Err(Error::BadRequest(
                "No knowledge points seeded for this grade and subject".to_string(),
            ));
        }
        match req.knowledge_point_id {
            Some(kp) => {
                let picked: Vec<KnowledgePoint> = all.into_iter().filter(|k| k.id == kp).collect();
                if picked.is_empty() {
                    return Err(Error::BadRequest(format!(
                        "knowledge_point_id {} is not active for this grade and subject",
                        kp
                    )));
                }
                Ok(picked)
            }
            None => Ok(all),
        }
    }

    async fn focus_points(
        &self,
        user_ids: &[i32],
        req: &AssembleRequest,
        allowed: &[i32],
        n: usize,
    ) -> Vec<i32> {
        let scores = match self
            .store
            .knowledge_point_scores(user_ids, req.grade_id, req.subject_id)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "focus knowledge points unavailable");
                return Vec::new();
            }
        };
        let desired = n.min(allowed.len()).max(1);
        rank_focus_points(scores, allowed, desired, &mut rand::thread_rng())
    }

    async fn grade_profile(&self, req: &AssembleRequest) -> GradeSubjectProfile {
        match self
            .store
            .grade_subject_profile(req.grade_id, req.subject_id)
            .await
        {
            Ok(p) => p.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "grade profile unavailable, using generic guidance");
                Default::default()
            }
        }
    }

    async fn recent_embeddings(&self, req: &AssembleRequest) -> Vec<StoredEmbedding> {
        if !self.settings.semantic_enabled {
            return Vec::new();
        }
        match self
            .store
            .recent_embeddings(req.grade_id, req.subject_id, RECENT_EMBEDDINGS_LIMIT)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "semantic gate runs without stored embeddings");
                Vec::new()
            }
        }
    }
}

/// Fingerprints and ids already in the pool being assembled.
struct FillState {
    hashes: HashSet<String>,
    ids: HashSet<i32>,
    selected: usize,
}

impl FillState {
    fn new(selected: &[Question]) -> Self {
        Self {
            hashes: selected.iter().map(|q| q.fingerprint()).collect(),
            ids: selected.iter().map(|q| q.id).collect(),
            selected: selected.len(),
        }
    }

    fn known_hashes(&self, pending: &[CandidateQuestion]) -> HashSet<String> {
        self.hashes
            .iter()
            .cloned()
            .chain(pending.iter().map(|c| c.content_options_hash.clone()))
            .collect()
    }
}

fn dedupe_context(req: &AssembleRequest, candidate: &CandidateQuestion) -> DedupeContext {
    DedupeContext {
        grade_id: Some(req.grade_id),
        subject_id: Some(req.subject_id),
        knowledge_point_id: candidate.knowledge_point_id,
    }
}

fn metadata_expression(metadata: Option<&QuestionMetadata>) -> Option<String> {
    match metadata? {
        QuestionMetadata::Generic(map) => map
            .get("expression")
            .and_then(JsonValue::as_str)
            .map(str::to_string),
        QuestionMetadata::Compact { .. } => None,
    }
}

fn build_student_profile(
    req: &AssembleRequest,
    profile: &GradeSubjectProfile,
    scope: &KpScope,
) -> JsonValue {
    let mut out = match &req.student_profile {
        JsonValue::Object(map) => JsonValue::Object(map.clone()),
        _ => json!({}),
    };
    out["lang"] = json!(req.lang);
    out["grade_code"] = json!(profile.grade_code);
    out["grade_level"] = json!(profile.grade_level);
    out["subject_code"] = json!(profile.subject_code);
    out["grade_subject_notes"] = json!(profile.notes);
    if let KpScope::Preferred(ids) = scope {
        out["focus_knowledge_points"] = json!(ids);
    }
    out
}
