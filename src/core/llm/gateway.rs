use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{error, warn};

use super::{ChatMessage, Completion, LlmBackend, LlmError};
use crate::config::LlmConfig;

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// OpenAI-compatible gateway client (`/models`, `/chat/completions`).
pub struct GatewayClient {
    base_url: String,
    api_key: String,
    max_tokens: u32,
    free_marker: String,
    auto_model: String,
    list_limit: usize,
    fallback_models: Vec<String>,
    client: Client,
}

impl GatewayClient {
    pub fn new(config: &LlmConfig) -> Self {
        if config.api_key.is_empty() {
            warn!("[LLM] No API key configured, gateway requests will be rejected");
        }
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            max_tokens: config.max_tokens,
            free_marker: config.free_marker.clone(),
            auto_model: config.auto_model.clone(),
            list_limit: config.model_list_limit,
            fallback_models: config.fallback_models.clone(),
            client: Client::new(),
        }
    }

    async fn fetch_models(&self) -> Result<Vec<String>, LlmError> {
        let res = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(LlmError::Http {
                status: res.status().as_u16(),
                body: res.text().await.unwrap_or_default(),
            });
        }
        let parsed: ModelsResponse = res.json().await?;
        Ok(self.rank_free(parsed.data.into_iter().map(|m| m.id)))
    }

    fn rank_free(&self, ids: impl Iterator<Item = String>) -> Vec<String> {
        ids.filter(|id| id.contains(&self.free_marker) || *id == self.auto_model)
            .take(self.list_limit)
            .collect()
    }
}

#[async_trait]
impl LlmBackend for GatewayClient {
    async fn free_models(&self) -> Result<Vec<String>, LlmError> {
        match self.fetch_models().await {
            Ok(models) => Ok(models),
            Err(e) if !self.fallback_models.is_empty() => {
                error!("[LLM] Error fetching models: {}, using fallback list", e);
                Ok(self.fallback_models.clone())
            }
            Err(e) => Err(e),
        }
    }

    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<Completion, LlmError> {
        let req = CompletionRequest {
            model,
            messages,
            max_tokens: self.max_tokens,
        };

        let started = Instant::now();
        let res = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            error!("[LLM] Query error [HTTP {}]: {}", status, body);
            return Err(LlmError::Http { status, body });
        }
        let parsed: CompletionResponse = res.json().await?;
        let elapsed = started.elapsed();

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(LlmError::EmptyResponse)?;
        Ok(Completion { text, elapsed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> GatewayClient {
        GatewayClient::new(&LlmConfig::default())
    }

    #[test]
    fn rank_keeps_free_and_auto_in_gateway_order() {
        let ids = [
            "openai/gpt-5",
            "kilo/auto",
            "minimax/minimax-m2.5:free",
            "anthropic/claude",
            "z-ai/glm-5:free",
        ]
        .into_iter()
        .map(String::from);
        assert_eq!(
            client().rank_free(ids),
            vec!["kilo/auto", "minimax/minimax-m2.5:free", "z-ai/glm-5:free"]
        );
    }

    #[test]
    fn rank_truncates_to_limit() {
        let ids = (0..25).map(|i| format!("vendor/model-{}:free", i));
        let ranked = client().rank_free(ids);
        assert_eq!(ranked.len(), 10);
        assert_eq!(ranked[0], "vendor/model-0:free");
    }

    #[test]
    fn request_body_shape() {
        let messages = vec![
            ChatMessage::new("system", "be brief"),
            ChatMessage::new("user", "hi"),
        ];
        let req = CompletionRequest {
            model: "kilo/auto",
            messages: &messages,
            max_tokens: 1000,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["model"], "kilo/auto");
        assert_eq!(json["max_tokens"], 1000);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
    }

    #[tokio::test]
    async fn unreachable_gateway_falls_back() {
        let config = LlmConfig {
            base_url: "http://127.0.0.1:1".into(),
            ..LlmConfig::default()
        };
        let models = GatewayClient::new(&config).free_models().await.unwrap();
        assert_eq!(models, config.fallback_models);
    }
}
