use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value as JsonValue;
use std::time::Duration;

/// Chat completion returning the raw text of the first choice. The caller is
/// responsible for recovering JSON from it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete_json(&self, system: &str, user: &str, max_tokens: u32) -> Result<String>;
}

#[derive(Clone)]
pub struct AIService {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AIService {
    pub fn new(api_key: String, model: String, base_url: String, client: Client) -> Self {
        Self {
            client,
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn chat_openai(&self, payload: &JsonValue) -> Result<String> {
        let res = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(payload)
            .timeout(Duration::from_secs(120))
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(Error::Generation(format!("OpenAI API Error {}: {}", status, text)));
        }

        let body: JsonValue = res.json().await?;
        body.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Generation("Invalid OpenAI response format".to_string()))
    }
}

/// Providers that do not know JSON mode reject the request naming the
/// parameter; those get one retry without it.
fn rejects_json_mode(err: &Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("response_format") || msg.contains("unknown parameter")
}

#[async_trait]
impl LlmProvider for AIService {
    async fn complete_json(&self, system: &str, user: &str, max_tokens: u32) -> Result<String> {
        let mut payload = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user}
            ],
            "max_tokens": max_tokens.max(1),
            "temperature": 0,
            "response_format": { "type": "json_object" }
        });

        match self.chat_openai(&payload).await {
            Ok(text) => Ok(text),
            Err(e) if rejects_json_mode(&e) => {
                tracing::warn!(error = %e, "JSON mode rejected, retrying without response_format");
                if let Some(obj) = payload.as_object_mut() {
                    obj.remove("response_format");
                }
                self.chat_openai(&payload).await
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_json_mode_rejection() {
        let e = Error::Generation(
            "OpenAI API Error 400: Invalid parameter: 'response_format' is not supported".into(),
        );
        assert!(rejects_json_mode(&e));
        let e = Error::Generation("OpenAI API Error 400: Unknown parameter: foo".into());
        assert!(rejects_json_mode(&e));
        let e = Error::Generation("OpenAI API Error 429: rate limited".into());
        assert!(!rejects_json_mode(&e));
    }

    #[test]
    fn base_url_is_normalized() {
        let svc = AIService::new("k".into(), "m".into(), "http://x/v1/".into(), Client::new());
        assert_eq!(svc.base_url, "http://x/v1");
    }
}
