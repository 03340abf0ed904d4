use crate::database::question_store::QuestionStore;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Build a per-question knowledge-point assignment of exactly `desired` ids.
///
/// With attempt counts the ids are ordered least-practised first (ties broken
/// randomly), otherwise shuffled. Demand beyond the distinct ids is filled by
/// sampling the lowest third of that order.
pub fn build_plan<R: Rng>(
    ids: &[i32],
    desired: usize,
    counts: Option<&HashMap<i32, i64>>,
    rng: &mut R,
) -> Vec<i32> {
    let mut seen = HashSet::new();
    let mut ordered: Vec<i32> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
    if ordered.is_empty() || desired == 0 {
        return Vec::new();
    }

    ordered.shuffle(rng);
    if let Some(counts) = counts {
        // Stable sort after a shuffle leaves equal counts in random order.
        ordered.sort_by_key(|id| counts.get(id).copied().unwrap_or(0));
    }

    if desired <= ordered.len() {
        ordered.truncate(desired);
        return ordered;
    }

    let pool_size = repeat_pool_size(ordered.len());
    let repeat_pool = ordered[..pool_size].to_vec();
    let mut plan = ordered;
    while plan.len() < desired {
        plan.push(repeat_pool[rng.gen_range(0..repeat_pool.len())]);
    }
    plan
}

fn repeat_pool_size(len: usize) -> usize {
    len.min(3usize.max(len.div_ceil(3)))
}

#[derive(Clone)]
pub struct PlannerService {
    store: Arc<dyn QuestionStore>,
}

impl PlannerService {
    pub fn new(store: Arc<dyn QuestionStore>) -> Self {
        Self { store }
    }

    /// Plan using the students' attempt counts; a failed count query degrades
    /// to a uniform shuffle.
    pub async fn plan(
        &self,
        ids: &[i32],
        desired: usize,
        user_ids: &[i32],
        grade_id: i32,
        subject_id: i32,
    ) -> Vec<i32> {
        if ids.is_empty() || desired == 0 {
            return Vec::new();
        }
        let counts = match self
            .store
            .query_knowledge_point_attempt_counts(user_ids, grade_id, subject_id, ids)
            .await
        {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!(error = %e, "attempt counts unavailable, shuffling knowledge points");
                None
            }
        };
        build_plan(ids, desired, counts.as_ref(), &mut rand::thread_rng())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::question_store::MockQuestionStore;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn plan_has_requested_length() {
        let mut rng = StdRng::seed_from_u64(7);
        let ids = [1, 2, 3, 4, 5];
        for m in 0..40 {
            assert_eq!(build_plan(&ids, m, None, &mut rng).len(), m);
        }
        assert!(build_plan(&[], 5, None, &mut rng).is_empty());
    }

    #[test]
    fn least_practised_points_come_first() {
        let mut rng = StdRng::seed_from_u64(1);
        let counts = HashMap::from([(1, 10), (2, 0), (3, 4)]);
        let plan = build_plan(&[1, 2, 3], 2, Some(&counts), &mut rng);
        assert_eq!(plan, vec![2, 3]);
    }

    #[test]
    fn repeats_come_from_the_lowest_third() {
        let mut rng = StdRng::seed_from_u64(3);
        let ids: Vec<i32> = (1..=9).collect();
        let counts: HashMap<i32, i64> = ids.iter().map(|&i| (i, i as i64)).collect();
        let plan = build_plan(&ids, 30, Some(&counts), &mut rng);

        assert_eq!(&plan[..9], &ids[..]);
        assert!(plan[9..].iter().all(|id| [1, 2, 3].contains(id)));
    }

    #[test]
    fn duplicate_ids_are_collapsed() {
        let mut rng = StdRng::seed_from_u64(5);
        let plan = build_plan(&[4, 4, 4], 1, None, &mut rng);
        assert_eq!(plan, vec![4]);
    }

    #[test]
    fn repeat_pool_has_at_least_three_members_when_possible() {
        assert_eq!(repeat_pool_size(1), 1);
        assert_eq!(repeat_pool_size(2), 2);
        assert_eq!(repeat_pool_size(4), 3);
        assert_eq!(repeat_pool_size(12), 4);
    }

    #[tokio::test]
    async fn count_failure_still_produces_a_full_plan() {
        let mut store = MockQuestionStore::new();
        store
            .expect_query_knowledge_point_attempt_counts()
            .returning(|_, _, _, _| Err(crate::error::Error::Internal("db down".into())));
        let planner = PlannerService::new(Arc::new(store));
        let plan = planner.plan(&[1, 2], 5, &[9], 1, 1).await;
        assert_eq!(plan.len(), 5);
        assert!(plan.iter().all(|id| *id == 1 || *id == 2));
    }
}
