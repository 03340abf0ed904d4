use crate::error::{Error, Result};
use dotenvy::dotenv;
use std::env;
use std::sync::OnceLock;

pub const DEFAULT_METADATA_THRESHOLD: f32 = 0.9;
pub const DEFAULT_SEMANTIC_THRESHOLD: f32 = 0.92;
pub const DEFAULT_QUESTION_DEDUPE_THRESHOLD: f32 = 0.9;
pub const DEFAULT_AVOID_THRESHOLD: f32 = 0.9;
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;
pub const MAX_ATTEMPTS_CAP: usize = 4;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_address: String,
    pub database_url: String,
    pub database_max_connections: u32,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    pub pinecone_api_key: Option<String>,
    pub pinecone_index_host: Option<String>,
    pub pinecone_embed_model: String,
    pub pinecone_api_base: String,
    pub dedupe: DedupeSettings,
}

/// Base dedupe tuning. Per-request configs are derived from this and relaxed
/// per fill attempt; nothing here is mutated after startup.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupeSettings {
    pub metadata_threshold: f32,
    pub semantic_threshold: f32,
    pub semantic_enabled: bool,
    pub question_dedupe_enabled: bool,
    pub question_dedupe_threshold: f32,
    pub avoid_threshold: f32,
    pub top_k: usize,
    pub max_attempts: usize,
}

impl Default for DedupeSettings {
    fn default() -> Self {
        Self {
            metadata_threshold: DEFAULT_METADATA_THRESHOLD,
            semantic_threshold: DEFAULT_SEMANTIC_THRESHOLD,
            semantic_enabled: true,
            question_dedupe_enabled: true,
            question_dedupe_threshold: DEFAULT_QUESTION_DEDUPE_THRESHOLD,
            avoid_threshold: DEFAULT_AVOID_THRESHOLD,
            top_k: 3,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl DedupeSettings {
    pub fn from_env() -> Result<Self> {
        let common = get_env_opt_parse::<f32>("PINECONE_DEDUPE_THRESHOLD")?;
        let threshold = |name: &str, default: f32| -> Result<f32> {
            let specific = get_env_opt_parse::<f32>(name)?;
            Ok(clamp_threshold(specific.or(common).unwrap_or(default)))
        };

        let top_k = get_env_opt_parse::<usize>("PINECONE_QUESTION_DEDUPE_TOPK")?
            .unwrap_or(3)
            .clamp(1, 10);
        let max_attempts = get_env_opt_parse::<usize>("FILL_MAX_ATTEMPTS")?
            .unwrap_or(DEFAULT_MAX_ATTEMPTS)
            .clamp(1, MAX_ATTEMPTS_CAP);

        Ok(Self {
            metadata_threshold: threshold("METADATA_DEDUPE_THRESHOLD", DEFAULT_METADATA_THRESHOLD)?,
            semantic_threshold: threshold("SEMANTIC_DEDUPE_THRESHOLD", DEFAULT_SEMANTIC_THRESHOLD)?,
            semantic_enabled: flag_enabled("SEMANTIC_DEDUPE"),
            question_dedupe_enabled: flag_enabled("PINECONE_QUESTION_DEDUPE"),
            question_dedupe_threshold: threshold(
                "PINECONE_QUESTION_DEDUPE_THRESHOLD",
                DEFAULT_QUESTION_DEDUPE_THRESHOLD,
            )?,
            avoid_threshold: threshold("AVOID_METADATA_THRESHOLD", DEFAULT_AVOID_THRESHOLD)?,
            top_k,
            max_attempts,
        })
    }
}

/// Thresholds live in `[0, 1)`; a threshold of 1.0 would never match anything.
pub fn clamp_threshold(value: f32) -> f32 {
    if !value.is_finite() {
        return 0.0;
    }
    value.clamp(0.0, 0.999)
}

pub static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        Ok(Self {
            server_address: get_env("SERVER_ADDRESS")?,
            database_url: get_env("DATABASE_URL")?,
            database_max_connections: get_env_opt_parse::<u32>("DATABASE_MAX_CONNECTIONS")?
                .unwrap_or(20)
                .max(1),
            openai_api_key: get_env_opt("OPENAI_API_KEY"),
            openai_model: get_env_opt("OPENAI_MODEL").unwrap_or_else(|| "gpt-4.1-mini".to_string()),
            openai_base_url: get_env_opt("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            pinecone_api_key: get_env_opt("PINECONE_API_KEY"),
            pinecone_index_host: get_env_opt("PINECONE_INDEX_HOST"),
            pinecone_embed_model: get_env_opt("PINECONE_EMBED_MODEL")
                .unwrap_or_else(|| "llama-text-embed-v2".to_string()),
            pinecone_api_base: get_env_opt("PINECONE_API_BASE")
                .unwrap_or_else(|| "https://api.pinecone.io".to_string()),
            dedupe: DedupeSettings::from_env()?,
        })
    }
}

fn get_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("Missing environment variable: {}", name)))
}

fn get_env_opt(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn get_env_opt_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get_env_opt(name) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("Invalid value for {}: {}", name, e))),
        None => Ok(None),
    }
}

// Unset means enabled; only an explicit "0" turns a gate off.
fn flag_enabled(name: &str) -> bool {
    get_env_opt(name).map(|v| v != "0").unwrap_or(true)
}

pub fn init_config() -> Result<()> {
    let config = Config::from_env()?;
    CONFIG
        .set(config)
        .map_err(|_| Error::Config("Configuration has already been initialized".to_string()))?;
    Ok(())
}

pub fn get_config() -> &'static Config {
    CONFIG
        .get()
        .expect("Configuration has not been initialized")
}
