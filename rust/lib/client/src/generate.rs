use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use pulse_core::{ClientConfig, ClientError, Result};

use crate::collab::TextGenerator;

/// Text generation against an OpenAI-compatible chat completion endpoint.
pub struct ChatCompletionGenerator {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl ChatCompletionGenerator {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// `None` when endpoint or key is missing; callers pass text through.
    pub fn from_config(config: &ClientConfig) -> Option<Self> {
        match (&config.ai_endpoint, &config.ai_key) {
            (Some(endpoint), Some(key)) => {
                Some(Self::new(endpoint.clone(), key.clone(), config.ai_model.clone()))
            }
            _ => None,
        }
    }
}

/// First choice's trimmed content from a completion response body.
pub fn extract_content(body: &str) -> Result<String> {
    let resp: CompletionResponse = serde_json::from_str(body)?;
    resp.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ClientError::Decode("completion has no content".into()))
}

#[async_trait::async_trait]
impl TextGenerator for ChatCompletionGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = CompletionRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        debug!(model = %self.model, "chat completion request");
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(30))
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(ClientError::Backend(format!("HTTP {}: {}", status.as_u16(), text)));
        }
        extract_content(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_without_key() {
        let config = ClientConfig {
            ai_endpoint: Some("https://api.example.com/v1/chat/completions".into()),
            ..Default::default()
        };
        assert!(ChatCompletionGenerator::from_config(&config).is_none());
    }

    #[test]
    fn extracts_first_choice() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"  Sunset vibes ✨ \n"}}]}"#;
        assert_eq!(extract_content(body).unwrap(), "Sunset vibes ✨");
    }

    #[test]
    fn empty_choices_is_decode_error() {
        assert_eq!(extract_content(r#"{"choices":[]}"#).unwrap_err().error_code(), "DECODE");
        let blank = r#"{"choices":[{"message":{"content":"   "}}]}"#;
        assert!(extract_content(blank).is_err());
    }
}
