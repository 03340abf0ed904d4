use crate::error::Result;
use crate::models::history::{HistoryRecord, StoredEmbedding};
use crate::models::knowledge_point::{GradeSubjectProfile, KnowledgePoint, KnowledgePointScore};
use crate::models::question::{CandidateQuestion, Question, QuestionMetadata};
use crate::services::metadata_service::MetadataService;
use crate::utils::fingerprint::content_options_hash;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::collections::{HashMap, HashSet};

/// Where a committed question lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub grade_id: i32,
    pub subject_id: i32,
}

/// Relational store contract used by the pool assembly flow.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuestionStore: Send + Sync {
    /// Random sample of questions none of `user_ids` has answered.
    async fn query_unused_questions(
        &self,
        user_ids: &[i32],
        grade_id: i32,
        subject_id: i32,
        knowledge_point_id: Option<i32>,
        limit: i64,
    ) -> Result<Vec<Question>>;

    /// Insert, or update the row owning the same hash. `None` when the write
    /// raced and produced no id.
    async fn upsert_question_by_hash(
        &self,
        question: &CandidateQuestion,
        placement: Placement,
    ) -> Result<Option<i32>>;

    async fn select_id_by_hash(&self, hash: &str) -> Result<Option<i32>>;

    /// Subset of `hashes` that already exist.
    async fn existing_hashes(&self, hashes: &[String]) -> Result<HashSet<String>>;

    async fn query_knowledge_point_attempt_counts(
        &self,
        user_ids: &[i32],
        grade_id: i32,
        subject_id: i32,
        knowledge_point_ids: &[i32],
    ) -> Result<HashMap<i32, i64>>;

    async fn knowledge_point_scores(
        &self,
        user_ids: &[i32],
        grade_id: i32,
        subject_id: i32,
    ) -> Result<Vec<KnowledgePointScore>>;

    /// Most frequent raw metadata objects in the students' history.
    async fn query_frequent_history_metadata(
        &self,
        user_ids: &[i32],
        grade_id: i32,
        subject_id: i32,
        knowledge_point_id: Option<i32>,
        top_n: i64,
    ) -> Result<Vec<JsonValue>>;

    /// Metadata and cached embeddings of questions the students have seen.
    async fn history_question_metadata(
        &self,
        user_ids: &[i32],
        grade_id: i32,
        subject_id: i32,
        limit: i64,
    ) -> Result<Vec<(Option<Vec<f32>>, Option<JsonValue>)>>;

    /// Newest cached embeddings in a grade/subject.
    async fn recent_embeddings(
        &self,
        grade_id: i32,
        subject_id: i32,
        limit: i64,
    ) -> Result<Vec<StoredEmbedding>>;

    async fn active_knowledge_points(
        &self,
        grade_id: i32,
        subject_id: i32,
    ) -> Result<Vec<KnowledgePoint>>;

    async fn grade_subject_profile(
        &self,
        grade_id: i32,
        subject_id: i32,
    ) -> Result<Option<GradeSubjectProfile>>;

    /// Every account id sharing `user_id`'s username.
    async fn merged_user_ids(&self, user_id: i32) -> Result<Vec<i32>>;

    async fn append_history(&self, record: &HistoryRecord) -> Result<()>;
}

/// Upsert by hash, falling back to a lookup when a concurrent writer won the
/// race. `None` means the question has no persisted id and must not be served.
pub async fn commit_question(
    store: &dyn QuestionStore,
    question: &CandidateQuestion,
    placement: Placement,
) -> Option<i32> {
    match store.upsert_question_by_hash(question, placement).await {
        Ok(Some(id)) => return Some(id),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, hash = %question.content_options_hash, "question upsert failed"),
    }
    match store.select_id_by_hash(&question.content_options_hash).await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(error = %e, hash = %question.content_options_hash, "lookup by hash failed");
            None
        }
    }
}

#[derive(Clone)]
pub struct PgQuestionStore {
    pool: PgPool,
}

impl PgQuestionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_question_row(row: &PgRow) -> Result<Question> {
        let options_raw: Option<JsonValue> = row.try_get("options")?;
        let options = options_raw
            .as_ref()
            .and_then(MetadataService::extract_bilingual_options)
            .unwrap_or_default();
        let metadata_raw: Option<JsonValue> = row.try_get("metadata")?;
        let metadata: Option<QuestionMetadata> =
            metadata_raw.as_ref().and_then(MetadataService::canonicalize);

        Ok(Question {
            id: row.try_get("id")?,
            question_type: "mcq".to_string(),
            content_cn: row.try_get::<Option<String>, _>("content_cn")?.unwrap_or_default(),
            content_en: row.try_get::<Option<String>, _>("content_en")?.unwrap_or_default(),
            options,
            content_options_hash: row
                .try_get::<Option<String>, _>("content_options_hash")?
                .filter(|h| !h.is_empty()),
            answer_cn: row.try_get::<Option<String>, _>("answer_cn")?.unwrap_or_default(),
            answer_en: row.try_get::<Option<String>, _>("answer_en")?.unwrap_or_default(),
            explanation_cn: row.try_get::<Option<String>, _>("explanation_cn")?.unwrap_or_default(),
            explanation_en: row.try_get::<Option<String>, _>("explanation_en")?.unwrap_or_default(),
            metadata,
            knowledge_point_id: row.try_get("knowledge_point_id")?,
        })
    }
}

#[async_trait]
impl QuestionStore for PgQuestionStore {
    async fn query_unused_questions(
        &self,
        user_ids: &[i32],
        grade_id: i32,
        subject_id: i32,
        knowledge_point_id: Option<i32>,
        limit: i64,
    ) -> Result<Vec<Question>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT id, content_cn, content_en, options, content_options_hash, metadata,
                   answer_cn, answer_en, explanation_cn, explanation_en, knowledge_point_id
            FROM questions q
            WHERE q.grade_id = $2
              AND q.subject_id = $3
              AND ($4::int IS NULL OR q.knowledge_point_id = $4)
              AND NOT EXISTS (
                  SELECT 1 FROM history h
                  WHERE h.user_id = ANY($1::int[]) AND h.question_id = q.id
              )
            ORDER BY RANDOM()
            LIMIT $5
            "#,
        )
        .bind(user_ids)
        .bind(grade_id)
        .bind(subject_id)
        .bind(knowledge_point_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::map_question_row).collect()
    }

    async fn upsert_question_by_hash(
        &self,
        question: &CandidateQuestion,
        placement: Placement,
    ) -> Result<Option<i32>> {
        let row = sqlx::query(
            r#"
            INSERT INTO questions (
                content_cn, content_en, options, content_options_hash, metadata, embedding,
                answer_cn, answer_en, explanation_cn, explanation_en,
                knowledge_point_id, grade_id, subject_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (content_options_hash) DO UPDATE
            SET content_cn = EXCLUDED.content_cn,
                content_en = EXCLUDED.content_en,
                options = EXCLUDED.options,
                metadata = EXCLUDED.metadata,
                embedding = COALESCE(EXCLUDED.embedding, questions.embedding),
                answer_cn = EXCLUDED.answer_cn,
                answer_en = EXCLUDED.answer_en,
                explanation_cn = EXCLUDED.explanation_cn,
                explanation_en = EXCLUDED.explanation_en,
                knowledge_point_id = EXCLUDED.knowledge_point_id,
                grade_id = EXCLUDED.grade_id,
                subject_id = EXCLUDED.subject_id
            RETURNING id
            "#,
        )
        .bind(&question.content_cn)
        .bind(&question.content_en)
        .bind(Json(&question.options))
        .bind(&question.content_options_hash)
        .bind(question.metadata.as_ref().map(Json))
        .bind(question.embedding.as_deref())
        .bind(&question.answer_cn)
        .bind(&question.answer_en)
        .bind(&question.explanation_cn)
        .bind(&question.explanation_en)
        .bind(question.knowledge_point_id)
        .bind(placement.grade_id)
        .bind(placement.subject_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(r.try_get("id")?)),
            None => Ok(None),
        }
    }

    async fn select_id_by_hash(&self, hash: &str) -> Result<Option<i32>> {
        let id = sqlx::query_scalar::<_, i32>(
            "SELECT id FROM questions WHERE content_options_hash = $1 LIMIT 1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn existing_hashes(&self, hashes: &[String]) -> Result<HashSet<String>> {
        if hashes.is_empty() {
            return Ok(HashSet::new());
        }
        let found = sqlx::query_scalar::<_, String>(
            "SELECT content_options_hash FROM questions WHERE content_options_hash = ANY($1::text[])",
        )
        .bind(hashes)
        .fetch_all(&self.pool)
        .await?;
        Ok(found.into_iter().collect())
    }

    async fn query_knowledge_point_attempt_counts(
        &self,
        user_ids: &[i32],
        grade_id: i32,
        subject_id: i32,
        knowledge_point_ids: &[i32],
    ) -> Result<HashMap<i32, i64>> {
        let rows = sqlx::query(
            r#"
            SELECT q.knowledge_point_id, COUNT(*)::bigint AS cnt
            FROM history h
            JOIN questions q ON q.id = h.question_id
            WHERE h.user_id = ANY($1::int[])
              AND q.grade_id = $2
              AND q.subject_id = $3
              AND q.knowledge_point_id = ANY($4::int[])
            GROUP BY q.knowledge_point_id
            "#,
        )
        .bind(user_ids)
        .bind(grade_id)
        .bind(subject_id)
        .bind(knowledge_point_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let kp: i32 = row.try_get("knowledge_point_id")?;
            let cnt: i64 = row.try_get("cnt")?;
            counts.insert(kp, cnt);
        }
        Ok(counts)
    }

    async fn knowledge_point_scores(
        &self,
        user_ids: &[i32],
        grade_id: i32,
        subject_id: i32,
    ) -> Result<Vec<KnowledgePointScore>> {
        let rows = sqlx::query(
            r#"
            SELECT q.knowledge_point_id,
                   COUNT(*)::bigint AS total,
                   SUM(CASE WHEN h.correct THEN 1 ELSE 0 END)::bigint AS correct
            FROM history h
            JOIN questions q ON q.id = h.question_id
            WHERE h.user_id = ANY($1::int[])
              AND q.grade_id = $2
              AND q.subject_id = $3
              AND q.knowledge_point_id IS NOT NULL
            GROUP BY q.knowledge_point_id
            "#,
        )
        .bind(user_ids)
        .bind(grade_id)
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(KnowledgePointScore {
                    knowledge_point_id: row.try_get("knowledge_point_id")?,
                    total: row.try_get("total")?,
                    correct: row.try_get::<Option<i64>, _>("correct")?.unwrap_or(0),
                })
            })
            .collect()
    }

    async fn query_frequent_history_metadata(
        &self,
        user_ids: &[i32],
        grade_id: i32,
        subject_id: i32,
        knowledge_point_id: Option<i32>,
        top_n: i64,
    ) -> Result<Vec<JsonValue>> {
        let rows = sqlx::query(
            r#"
            SELECT q.metadata, COUNT(*)::bigint AS cnt
            FROM history h
            JOIN questions q ON q.id = h.question_id
            WHERE h.user_id = ANY($1::int[])
              AND q.grade_id = $2
              AND q.subject_id = $3
              AND q.metadata IS NOT NULL
              AND ($4::int IS NULL OR q.knowledge_point_id = $4)
            GROUP BY q.metadata
            ORDER BY cnt DESC
            LIMIT $5
            "#,
        )
        .bind(user_ids)
        .bind(grade_id)
        .bind(subject_id)
        .bind(knowledge_point_id)
        .bind(top_n)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok(row.try_get::<JsonValue, _>("metadata")?))
            .collect()
    }

    async fn history_question_metadata(
        &self,
        user_ids: &[i32],
        grade_id: i32,
        subject_id: i32,
        limit: i64,
    ) -> Result<Vec<(Option<Vec<f32>>, Option<JsonValue>)>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT q.id, q.embedding, q.metadata
            FROM history h
            JOIN questions q ON q.id = h.question_id
            WHERE h.user_id = ANY($1::int[])
              AND q.grade_id = $2
              AND q.subject_id = $3
              AND q.metadata IS NOT NULL
            ORDER BY q.id DESC
            LIMIT $4
            "#,
        )
        .bind(user_ids)
        .bind(grade_id)
        .bind(subject_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let embedding: Option<Vec<f32>> = row.try_get("embedding")?;
                let metadata: Option<JsonValue> = row.try_get("metadata")?;
                Ok((embedding.filter(|e| !e.is_empty()), metadata))
            })
            .collect()
    }

    async fn recent_embeddings(
        &self,
        grade_id: i32,
        subject_id: i32,
        limit: i64,
    ) -> Result<Vec<StoredEmbedding>> {
        let rows = sqlx::query(
            r#"
            SELECT id, content_options_hash, embedding
            FROM questions
            WHERE grade_id = $1 AND subject_id = $2 AND embedding IS NOT NULL
            ORDER BY created_at DESC NULLS LAST, id DESC
            LIMIT $3
            "#,
        )
        .bind(grade_id)
        .bind(subject_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let embedding: Vec<f32> = row.try_get("embedding")?;
            if embedding.is_empty() {
                continue;
            }
            out.push(StoredEmbedding {
                question_id: row.try_get("id")?,
                content_options_hash: row.try_get("content_options_hash")?,
                embedding,
            });
        }
        Ok(out)
    }

    async fn active_knowledge_points(
        &self,
        grade_id: i32,
        subject_id: i32,
    ) -> Result<Vec<KnowledgePoint>> {
        let rows = sqlx::query(
            r#"
            SELECT kp.id, kp.name_cn, kp.name_en, kp.unit_name_cn, kp.unit_name_en,
                   kp.description, kp.sort_order
            FROM knowledge_points kp
            JOIN grade_subjects gs ON gs.id = kp.grade_subject_id
            WHERE gs.grade_id = $1
              AND gs.subject_id = $2
              AND (kp.is_active IS NULL OR kp.is_active = TRUE)
            ORDER BY kp.sort_order NULLS LAST, kp.id ASC
            "#,
        )
        .bind(grade_id)
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(KnowledgePoint {
                    id: row.try_get("id")?,
                    name_cn: row.try_get("name_cn")?,
                    name_en: row.try_get("name_en")?,
                    unit_name_cn: row.try_get("unit_name_cn")?,
                    unit_name_en: row.try_get("unit_name_en")?,
                    description: row.try_get("description")?,
                    sort_order: row.try_get("sort_order")?,
                })
            })
            .collect()
    }

    async fn grade_subject_profile(
        &self,
        grade_id: i32,
        subject_id: i32,
    ) -> Result<Option<GradeSubjectProfile>> {
        let row = sqlx::query(
            r#"
            SELECT g.code AS grade_code, g.level AS grade_level,
                   s.code AS subject_code, gs.notes
            FROM grade_subjects gs
            JOIN grades g ON g.id = gs.grade_id
            JOIN subjects s ON s.id = gs.subject_id
            WHERE gs.grade_id = $1 AND gs.subject_id = $2
            LIMIT 1
            "#,
        )
        .bind(grade_id)
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(GradeSubjectProfile {
                grade_code: r.try_get("grade_code")?,
                grade_level: r.try_get("grade_level")?,
                subject_code: r.try_get("subject_code")?,
                notes: r.try_get("notes")?,
            })
        })
        .transpose()
    }

    async fn merged_user_ids(&self, user_id: i32) -> Result<Vec<i32>> {
        let ids = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT u.id FROM users u
            WHERE u.username = (SELECT username FROM users WHERE id = $1)
            ORDER BY u.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn append_history(&self, record: &HistoryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO history (user_id, question_id, given_answer, correct, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.user_id)
        .bind(record.question_id)
        .bind(&record.given_answer)
        .bind(record.correct)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Hash a stored row that predates the hash column.
pub fn backfill_hash(question: &Question) -> String {
    question
        .content_options_hash
        .clone()
        .unwrap_or_else(|| content_options_hash(&question.content_en, &question.options.en))
}
