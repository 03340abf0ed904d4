use axum::{extract::State, http::StatusCode, response::Json};
use chrono::Utc;

use crate::dto::assemble_dto::{AppendHistoryRequest, AppendHistoryResponse};
use crate::error::{Error, Result};
use crate::models::history::HistoryRecord;
use crate::utils::validation::validate;
use crate::AppState;

#[axum::debug_handler]
pub async fn append_history(
    State(state): State<AppState>,
    Json(payload): Json<AppendHistoryRequest>,
) -> Result<(StatusCode, Json<AppendHistoryResponse>)> {
    validate(&payload)?;
    let record = HistoryRecord {
        user_id: payload.user_id,
        question_id: payload.question_id,
        given_answer: payload.given_answer.trim().to_string(),
        correct: payload.correct,
        created_at: Utc::now(),
    };

    match state.store.append_history(&record).await {
        Ok(()) => {}
        Err(Error::Database(sqlx::Error::Database(db))) if db.is_foreign_key_violation() => {
            return Err(Error::NotFound(format!(
                "Unknown user {} or question {}",
                record.user_id, record.question_id
            )));
        }
        Err(e) => return Err(e),
    }

    Ok((
        StatusCode::CREATED,
        Json(AppendHistoryResponse {
            recorded: true,
            question_id: record.question_id,
            timestamp: record.created_at,
        }),
    ))
}
