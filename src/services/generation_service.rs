use crate::database::question_store::QuestionStore;
use crate::error::{Error, Result};
use crate::models::knowledge_point::KnowledgePoint;
use crate::models::question::{BilingualOptions, CandidateQuestion, Lesson};
use crate::services::ai_service::LlmProvider;
use crate::services::embed_service::{cosine_sim, EmbedMode, MetadataFilter};
use crate::services::metadata_service::MetadataService;
use crate::services::planner_service::PlannerService;
use crate::services::prompts::{self, Lang, PromptInputs};
use crate::services::similarity_service::{DedupeConfig, SimilarityService};
use crate::utils::fingerprint::{content_options_hash, unique_by_hash};
use crate::utils::json::parse_json_object;
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::sync::Arc;

const BACKLOG_BONUS: usize = 5;
const AVOID_BACKLOG_BONUS: usize = 10;
const AVOID_LIST_SIZE: i64 = 5;
const HISTORY_LAYER_LIMIT: i64 = 200;
pub const DEFAULT_MAX_TOKENS: u32 = 5000;

/// Everything one generation round needs to know about the request.
#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub missing: usize,
    pub user_ids: &'a [i32],
    pub grade_id: i32,
    pub subject_id: i32,
    pub kp_filter: Option<i32>,
    pub knowledge_points: &'a [KnowledgePoint],
    pub lang: Lang,
    pub student_profile: &'a JsonValue,
    pub grade_guidance: &'a str,
    /// Pre-insert dedupe for this round (intra-batch and history layers).
    pub dedupe: DedupeConfig,
    pub avoid_threshold: f32,
    pub max_tokens: u32,
}

impl GenerationRequest<'_> {
    fn allowed_ids(&self) -> Vec<i32> {
        self.knowledge_points.iter().map(|k| k.id).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerationOutput {
    pub accepted: Vec<CandidateQuestion>,
    pub lesson: Option<Lesson>,
}

#[derive(Clone)]
pub struct GenerationService {
    llm: Arc<dyn LlmProvider>,
    store: Arc<dyn QuestionStore>,
    oracle: SimilarityService,
    planner: PlannerService,
}

impl GenerationService {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        store: Arc<dyn QuestionStore>,
        oracle: SimilarityService,
        planner: PlannerService,
    ) -> Self {
        Self {
            llm,
            store,
            oracle,
            planner,
        }
    }

    /// Ask the provider for a surplus of candidates and return the ones that
    /// pass validation and pre-insert dedupe, most novel first. `known_hashes`
    /// are fingerprints already in the caller's pool.
    pub async fn generate(
        &self,
        req: &GenerationRequest<'_>,
        known_hashes: &HashSet<String>,
    ) -> Result<GenerationOutput> {
        let avoid = self.avoid_metadata(req).await;
        let ask_n = req.missing + if avoid.is_empty() { BACKLOG_BONUS } else { AVOID_BACKLOG_BONUS };

        let allowed = req.allowed_ids();
        let plan = self
            .planner
            .plan(&allowed, ask_n, req.user_ids, req.grade_id, req.subject_id)
            .await;
        tracing::info!(missing = req.missing, ask_n, avoid = avoid.len(), "requesting generated questions");

        let inputs = PromptInputs {
            student_profile: req.student_profile.clone(),
            grade_guidance: req.grade_guidance.to_string(),
            num_questions: ask_n,
            knowledge_points: serde_json::to_value(req.knowledge_points)?,
            knowledge_point_ids_plan: plan.clone(),
            avoid_metadata: avoid.clone(),
        };
        let text = self
            .llm
            .complete_json(
                prompts::system_prompt(req.lang),
                &prompts::user_prompt(req.lang, &inputs),
                req.max_tokens,
            )
            .await
            .map_err(|e| Error::Generation(format!("LLM call failed: {}", e)))?;

        let parsed = parse_json_object(&text)
            .filter(|v| v.get("questions").map_or(false, JsonValue::is_array))
            .ok_or_else(|| Error::Generation("Failed to parse generated JSON".to_string()))?;
        let lesson = parsed
            .get("lesson")
            .filter(|l| l.is_object())
            .and_then(|l| serde_json::from_value::<Lesson>(l.clone()).ok());
        let raw_questions = parsed["questions"].as_array().cloned().unwrap_or_default();

        let mut accepted = self.validate_batch(&raw_questions, known_hashes).await;
        let returned = raw_questions.len();
        assign_knowledge_points(&mut accepted, &plan, req.kp_filter, &allowed);

        if !avoid.is_empty() && !accepted.is_empty() {
            accepted = self
                .rank_by_avoid_list(accepted, &avoid, req.missing, req.avoid_threshold)
                .await;
        }

        let accepted = self.dedupe_before_insert(accepted, req).await;
        tracing::info!(returned, accepted = accepted.len(), "generation round finished");
        Ok(GenerationOutput { accepted, lesson })
    }

    /// Top metadata patterns from the students' history, canonicalized.
    async fn avoid_metadata(&self, req: &GenerationRequest<'_>) -> Vec<JsonValue> {
        match self
            .store
            .query_frequent_history_metadata(
                req.user_ids,
                req.grade_id,
                req.subject_id,
                req.kp_filter,
                AVOID_LIST_SIZE,
            )
            .await
        {
            Ok(rows) => rows
                .iter()
                .filter_map(MetadataService::canonicalize)
                .filter_map(|m| serde_json::to_value(m).ok())
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "avoid-list query failed, generating without it");
                Vec::new()
            }
        }
    }

    /// Structural validation plus batch and store hash dedupe.
    async fn validate_batch(
        &self,
        raw: &[JsonValue],
        known_hashes: &HashSet<String>,
    ) -> Vec<CandidateQuestion> {
        let mut seen = known_hashes.clone();
        let mut parsed = Vec::new();
        for item in raw {
            let Some(c) = parse_candidate(item) else {
                continue;
            };
            if seen.insert(c.content_options_hash.clone()) {
                parsed.push(c);
            }
        }

        let hashes: Vec<String> = parsed.iter().map(|c| c.content_options_hash.clone()).collect();
        let in_db = match self.store.existing_hashes(&hashes).await {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "existing-hash lookup failed");
                HashSet::new()
            }
        };

        parsed
            .into_iter()
            .filter(|c| {
                if !c.options.is_four_way() {
                    tracing::debug!(hash = %c.content_options_hash, "rejected: not four options per language");
                    return false;
                }
                if !answers_in_options(c) {
                    tracing::debug!(hash = %c.content_options_hash, "rejected: answer not among options");
                    return false;
                }
                !in_db.contains(&c.content_options_hash)
            })
            .collect()
    }

    /// Farthest-first by maximum similarity to the avoid-list. The filtered set
    /// is used only when it can still cover the shortfall.
    async fn rank_by_avoid_list(
        &self,
        accepted: Vec<CandidateQuestion>,
        avoid: &[JsonValue],
        missing: usize,
        avoid_threshold: f32,
    ) -> Vec<CandidateQuestion> {
        let avoid_texts: Vec<String> = avoid
            .iter()
            .map(MetadataService::raw_embedding_text)
            .filter(|t| !t.is_empty())
            .collect();

        let (with_text, no_text): (Vec<_>, Vec<_>) = accepted
            .into_iter()
            .map(|q| {
                let text = q
                    .metadata
                    .as_ref()
                    .map(MetadataService::to_embedding_text)
                    .unwrap_or_default();
                (q, text)
            })
            .partition(|(_, t)| !t.is_empty());

        let restore = |with_text: Vec<(CandidateQuestion, String)>, no_text: Vec<(CandidateQuestion, String)>| {
            with_text.into_iter().chain(no_text).map(|(q, _)| q).collect::<Vec<_>>()
        };
        if avoid_texts.is_empty() || with_text.is_empty() {
            return restore(with_text, no_text);
        }

        let index = self.oracle.index();
        let cand_texts: Vec<String> = with_text.iter().map(|(_, t)| t.clone()).collect();
        let vectors = async {
            let a = index.embed(&avoid_texts, EmbedMode::Query).await?;
            let c = index.embed(&cand_texts, EmbedMode::Query).await?;
            Ok::<_, Error>((a, c))
        }
        .await;
        let (avoid_vecs, cand_vecs) = match vectors {
            Ok((a, c)) if a.len() == avoid_texts.len() && c.len() == cand_texts.len() => (a, c),
            Ok(_) => {
                tracing::warn!("avoid ranking skipped: embedding count mismatch");
                return restore(with_text, no_text);
            }
            Err(e) => {
                tracing::warn!(error = %e, "avoid ranking skipped: embedding failed");
                return restore(with_text, no_text);
            }
        };

        let mut scored: Vec<(CandidateQuestion, f32)> = with_text
            .into_iter()
            .zip(cand_vecs.iter())
            .map(|((q, _), v)| {
                let max_sim = SimilarityService::max_local(v, &avoid_vecs);
                // Incomparable scores rank last.
                let max_sim = if !max_sim.is_finite() || max_sim < 0.0 { 1.0 } else { max_sim };
                (q, max_sim)
            })
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));

        let filtered_len = scored.iter().filter(|(_, s)| *s < avoid_threshold).count();
        let ranked: Vec<CandidateQuestion> = if filtered_len >= missing {
            scored
                .into_iter()
                .filter(|(_, s)| *s < avoid_threshold)
                .map(|(q, _)| q)
                .collect()
        } else {
            tracing::info!(filtered_len, missing, "avoid filter too strict, keeping full ranking");
            scored.into_iter().map(|(q, _)| q).collect()
        };
        ranked.into_iter().chain(no_text.into_iter().map(|(q, _)| q)).collect()
    }

    /// Hash layer, passage embedding, intra-batch similarity, then the
    /// per-student history layer. Every embedding or index failure passes the
    /// batch through unchanged.
    pub async fn dedupe_before_insert(
        &self,
        questions: Vec<CandidateQuestion>,
        req: &GenerationRequest<'_>,
    ) -> Vec<CandidateQuestion> {
        let mut batch = unique_by_hash(questions);
        self.embed_missing(&mut batch).await;

        let mut kept: Vec<CandidateQuestion> = Vec::with_capacity(batch.len());
        for q in batch {
            let too_close = match q.embedding.as_deref() {
                Some(v) => kept
                    .iter()
                    .filter_map(|k| k.embedding.as_deref())
                    .any(|kv| req.dedupe.is_too_similar(cosine_sim(v, kv))),
                None => false,
            };
            if too_close {
                tracing::debug!(hash = %q.content_options_hash, "dropped: near-duplicate inside batch");
            } else {
                kept.push(q);
            }
        }

        if !req.dedupe.enabled {
            return kept;
        }
        self.dedupe_against_history(kept, req).await
    }

    async fn embed_missing(&self, batch: &mut [CandidateQuestion]) {
        let targets: Vec<(usize, String)> = batch
            .iter()
            .enumerate()
            .filter(|(_, q)| q.embedding.is_none())
            .filter_map(|(i, q)| {
                let text = q.metadata.as_ref().map(MetadataService::to_embedding_text)?;
                (!text.is_empty()).then_some((i, text))
            })
            .collect();
        if targets.is_empty() {
            return;
        }
        let texts: Vec<String> = targets.iter().map(|(_, t)| t.clone()).collect();
        match self.oracle.index().embed(&texts, EmbedMode::Passage).await {
            Ok(vecs) if vecs.len() == texts.len() => {
                for ((i, _), v) in targets.iter().zip(vecs) {
                    if !v.is_empty() {
                        batch[*i].embedding = Some(v);
                    }
                }
            }
            Ok(_) => tracing::warn!("passage embedding count mismatch, batch left unembedded"),
            Err(e) => tracing::warn!(error = %e, "passage embedding failed"),
        }
    }

    /// Neighbours of what the students already answered form an avoid set of
    /// question ids; candidates whose own neighbours hit that set are dropped.
    async fn dedupe_against_history(
        &self,
        questions: Vec<CandidateQuestion>,
        req: &GenerationRequest<'_>,
    ) -> Vec<CandidateQuestion> {
        if questions.is_empty() || req.user_ids.is_empty() {
            return questions;
        }
        let rows = match self
            .store
            .history_question_metadata(req.user_ids, req.grade_id, req.subject_id, HISTORY_LAYER_LIMIT)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "history layer skipped: query failed");
                return questions;
            }
        };

        let mut history_vecs: Vec<Vec<f32>> = Vec::new();
        let mut to_embed: Vec<String> = Vec::new();
        for (embedding, metadata) in rows {
            match embedding {
                Some(v) => history_vecs.push(v),
                None => {
                    let text = metadata
                        .as_ref()
                        .map(MetadataService::raw_embedding_text)
                        .unwrap_or_default();
                    if !text.is_empty() {
                        to_embed.push(text);
                    }
                }
            }
        }
        if !to_embed.is_empty() {
            match self.oracle.index().embed(&to_embed, EmbedMode::Query).await {
                Ok(vecs) if vecs.len() == to_embed.len() => {
                    history_vecs.extend(vecs.into_iter().filter(|v| !v.is_empty()));
                }
                Ok(_) => tracing::warn!("history embedding count mismatch"),
                Err(e) => tracing::warn!(error = %e, "history embedding failed"),
            }
        }
        if history_vecs.is_empty() {
            return questions;
        }

        let filter = MetadataFilter::new(req.grade_id, req.subject_id);
        let mut avoid_ids: HashSet<i32> = HashSet::new();
        for hv in &history_vecs {
            match self.oracle.query(hv, req.dedupe.top_k, &filter).await {
                Ok(matches) => avoid_ids.extend(
                    matches
                        .iter()
                        .filter(|m| req.dedupe.is_too_similar(m.score))
                        .filter_map(|m| m.question_id()),
                ),
                Err(e) => tracing::debug!(error = %e, "history neighbour query failed"),
            }
        }
        if avoid_ids.is_empty() {
            return questions;
        }

        let mut out = Vec::with_capacity(questions.len());
        for q in questions {
            let Some(v) = q.embedding.as_deref() else {
                out.push(q);
                continue;
            };
            let hit = match self.oracle.query(v, req.dedupe.top_k, &filter).await {
                Ok(matches) => matches.iter().any(|m| {
                    req.dedupe.is_too_similar(m.score)
                        && m.question_id().map_or(false, |id| avoid_ids.contains(&id))
                }),
                Err(e) => {
                    tracing::debug!(error = %e, "candidate neighbour query failed");
                    false
                }
            };
            if hit {
                tracing::debug!(hash = %q.content_options_hash, "dropped: close to the students' history");
            } else {
                out.push(q);
            }
        }
        out
    }
}

/// Map one raw provider item to a candidate; `None` when content or options
/// are unusable.
fn parse_candidate(item: &JsonValue) -> Option<CandidateQuestion> {
    let text = |key: &str| item.get(key).and_then(JsonValue::as_str).unwrap_or_default().to_string();
    let content_en = text("content_en");
    let content_cn = text("content_cn");
    if content_en.trim().is_empty() && content_cn.trim().is_empty() {
        return None;
    }
    let options: BilingualOptions = MetadataService::extract_bilingual_options(item.get("options")?)?;
    let hash = content_options_hash(&content_en, &options.en);

    // Non-string answers are kept empty so the option check rejects them.
    let answer_en = item.get("answer_en").and_then(JsonValue::as_str).map(str::trim).unwrap_or_default();
    let answer_cn = item.get("answer_cn").and_then(JsonValue::as_str).map(str::trim).unwrap_or_default();

    Some(CandidateQuestion {
        content_cn,
        content_en,
        options,
        content_options_hash: hash,
        answer_cn: answer_cn.to_string(),
        answer_en: answer_en.to_string(),
        explanation_cn: text("explanation_cn"),
        explanation_en: text("explanation_en"),
        metadata: item.get("metadata").and_then(MetadataService::canonicalize),
        knowledge_point_id: None,
        claimed_knowledge_point_id: item.get("knowledge_point_id").and_then(int_like),
        embedding: None,
    })
}

fn int_like(v: &JsonValue) -> Option<i32> {
    let n = match v {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }?;
    i32::try_from(n).ok()
}

fn answers_in_options(q: &CandidateQuestion) -> bool {
    !q.answer_en.is_empty()
        && !q.answer_cn.is_empty()
        && q.options.en.iter().any(|o| *o == q.answer_en)
        && q.options.zh.iter().any(|o| *o == q.answer_cn)
}

/// Planned id (if allowed), then the explicit filter, then the provider's own
/// claim (if allowed), then the first allowed point.
pub fn assign_knowledge_points(
    questions: &mut [CandidateQuestion],
    plan: &[i32],
    kp_filter: Option<i32>,
    allowed: &[i32],
) {
    let is_allowed = |id: i32| allowed.is_empty() || allowed.contains(&id);
    let fallback = allowed.first().copied();
    for (idx, q) in questions.iter_mut().enumerate() {
        q.knowledge_point_id = plan
            .get(idx)
            .copied()
            .filter(|id| is_allowed(*id))
            .or(kp_filter)
            .or(q.claimed_knowledge_point_id.filter(|id| is_allowed(*id)))
            .or(fallback);
    }
}
