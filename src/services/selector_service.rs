use crate::database::question_store::{backfill_hash, QuestionStore};
use crate::error::Result;
use crate::models::question::Question;
use crate::utils::fingerprint::unique_by_hash;
use std::sync::Arc;

const MAX_OVERFETCH: usize = 250;
const SELECT_RETRIES: usize = 2;
const PER_POINT_FIRST_PASS: i64 = 3;
const PER_POINT_RETRY: i64 = 2;

/// Which knowledge points a DB-first selection draws from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KpScope {
    #[default]
    Any,
    Single(i32),
    /// Try a few rows from each point in order.
    Preferred(Vec<i32>),
}

impl KpScope {
    pub fn single(&self) -> Option<i32> {
        match self {
            KpScope::Single(id) => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectionRequest<'a> {
    pub user_ids: &'a [i32],
    pub grade_id: i32,
    pub subject_id: i32,
    pub scope: &'a KpScope,
    pub limit: usize,
    /// Allowed knowledge points in display order; the first is the fallback.
    pub allowed: &'a [i32],
}

/// Rows requested per round: enough headroom to absorb hash collisions.
pub fn overfetch_limit(n: usize) -> usize {
    MAX_OVERFETCH.min((n * 5).max(n + 5))
}

#[derive(Clone)]
pub struct SelectorService {
    store: Arc<dyn QuestionStore>,
}

impl SelectorService {
    pub fn new(store: Arc<dyn QuestionStore>) -> Self {
        Self { store }
    }

    /// Up to `limit` distinct unused questions. Store failures end the
    /// selection early with whatever was already fetched.
    pub async fn select_unused(&self, req: &SelectionRequest<'_>) -> Vec<Question> {
        if req.limit == 0 || req.user_ids.is_empty() {
            return Vec::new();
        }
        let overfetch = overfetch_limit(req.limit);
        let mut selected: Vec<Question> = Vec::new();

        if let Err(e) = self.fetch_round(req, overfetch, 0, &mut selected).await {
            tracing::warn!(error = %e, "unused question fetch failed");
        } else {
            let mut tries = 0;
            while count_unique(&selected) < req.limit && tries < SELECT_RETRIES {
                tries += 1;
                if let Err(e) = self.fetch_round(req, overfetch, tries, &mut selected).await {
                    tracing::warn!(error = %e, tries, "unused question retry failed");
                    break;
                }
            }
        }

        let null_hash = selected
            .iter()
            .filter(|q| q.content_options_hash.is_none())
            .count();
        for q in selected.iter_mut() {
            if q.content_options_hash.is_none() {
                q.content_options_hash = Some(backfill_hash(q));
            }
            q.knowledge_point_id = remap_knowledge_point(q.knowledge_point_id, req.scope.single(), req.allowed);
        }

        let fetched = selected.len();
        let mut unique = unique_by_hash(selected);
        unique.truncate(req.limit);
        if unique.len() < req.limit {
            tracing::info!(
                fetched,
                unique = unique.len(),
                need = req.limit,
                null_hash,
                kp_filter = ?req.scope.single(),
                "DB-first selection short of unique questions"
            );
        }
        unique
    }

    async fn fetch_round(
        &self,
        req: &SelectionRequest<'_>,
        overfetch: usize,
        tries: usize,
        selected: &mut Vec<Question>,
    ) -> Result<()> {
        match req.scope {
            KpScope::Single(kp) => {
                selected.extend(self.fetch(req, Some(*kp), overfetch as i64).await?);
            }
            KpScope::Preferred(kps) if !kps.is_empty() => {
                let per_point = if tries == 0 { PER_POINT_FIRST_PASS } else { PER_POINT_RETRY };
                let cap = overfetch * (tries + 1);
                for kp in kps {
                    if selected.len() >= cap {
                        break;
                    }
                    selected.extend(self.fetch(req, Some(*kp), per_point).await?);
                }
            }
            _ => {
                selected.extend(self.fetch(req, None, overfetch as i64).await?);
            }
        }
        Ok(())
    }

    async fn fetch(&self, req: &SelectionRequest<'_>, kp: Option<i32>, limit: i64) -> Result<Vec<Question>> {
        self.store
            .query_unused_questions(req.user_ids, req.grade_id, req.subject_id, kp, limit)
            .await
    }
}

fn count_unique(questions: &[Question]) -> usize {
    let mut seen = std::collections::HashSet::new();
    questions
        .iter()
        .filter(|q| seen.insert(backfill_hash(q)))
        .count()
}

/// The explicit filter wins; otherwise keep the row's own point when allowed,
/// else fall back to the first allowed point.
pub fn remap_knowledge_point(own: Option<i32>, filter: Option<i32>, allowed: &[i32]) -> Option<i32> {
    let kp = filter.or(own);
    match kp {
        Some(id) if allowed.is_empty() || allowed.contains(&id) => Some(id),
        _ => allowed.first().copied().or(kp),
    }
}
