pub mod config;
pub mod database;
pub mod dto;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod utils;

use crate::config::{get_config, DedupeSettings};
use crate::database::question_store::{PgQuestionStore, QuestionStore};
use crate::services::{
    ai_service::{AIService, LlmProvider},
    assembler_service::PoolAssembler,
    embed_service::{EmbedService, VectorIndex},
};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use reqwest::Client;
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn QuestionStore>,
    pub assembler: PoolAssembler,
}

impl AppState {
    pub fn new(pool: PgPool) -> error::Result<Self> {
        let config = get_config();
        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()?;

        let llm: Option<Arc<dyn LlmProvider>> = config.openai_api_key.clone().map(|key| {
            Arc::new(AIService::new(
                key,
                config.openai_model.clone(),
                config.openai_base_url.clone(),
                http_client.clone(),
            )) as Arc<dyn LlmProvider>
        });
        let index: Option<Arc<dyn VectorIndex>> = match (
            config.pinecone_api_key.clone(),
            config.pinecone_index_host.clone(),
        ) {
            (Some(key), Some(host)) => Some(Arc::new(EmbedService::new(
                key,
                host,
                config.pinecone_api_base.clone(),
                config.pinecone_embed_model.clone(),
                http_client,
            )) as Arc<dyn VectorIndex>),
            _ => None,
        };
        if llm.is_none() || index.is_none() {
            tracing::warn!(
                llm = llm.is_some(),
                vector_index = index.is_some(),
                "generation disabled; only stored questions can be served"
            );
        }

        let store: Arc<dyn QuestionStore> = Arc::new(PgQuestionStore::new(pool));
        Ok(Self::from_parts(store, llm, index, config.dedupe.clone()))
    }

    /// Wire the state from already-built collaborators.
    pub fn from_parts(
        store: Arc<dyn QuestionStore>,
        llm: Option<Arc<dyn LlmProvider>>,
        index: Option<Arc<dyn VectorIndex>>,
        settings: DedupeSettings,
    ) -> Self {
        let assembler = PoolAssembler::new(store.clone(), llm, index, settings);
        Self { store, assembler }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health::health))
        .route("/api/questions/assemble", post(routes::questions::assemble_questions))
        .route("/api/history", post(routes::history::append_history))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(1024 * 1024))
}
