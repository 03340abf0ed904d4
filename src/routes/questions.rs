use axum::{extract::State, response::Json};

use crate::dto::assemble_dto::{AssembleQuestionsRequest, AssembleQuestionsResponse};
use crate::error::Result;
use crate::utils::validation::validate;
use crate::AppState;

#[axum::debug_handler]
pub async fn assemble_questions(
    State(state): State<AppState>,
    Json(payload): Json<AssembleQuestionsRequest>,
) -> Result<Json<AssembleQuestionsResponse>> {
    validate(&payload)?;
    tracing::info!(
        num_questions = payload.num_questions,
        grade_id = payload.grade_id,
        subject_id = payload.subject_id,
        knowledge_point_id = ?payload.knowledge_point_id,
        "assembling question pool"
    );
    let output = state.assembler.assemble(payload.into()).await?;
    Ok(Json(output.into()))
}
