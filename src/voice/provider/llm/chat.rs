//! OpenAI-compatible chat completions (Groq by default).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ChatConfig;
use crate::voice::provider::{
    ProviderError, ReplyGenerator, ReplyRequest, ensure_success, require,
};
use crate::voice::state::Language;

pub struct ChatCompletionsGenerator {
    config: ChatConfig,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl ChatCompletionsGenerator {
    pub fn new(config: ChatConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn build_request<'a>(&'a self, request: &ReplyRequest) -> ChatRequest<'a> {
        let mut messages = vec![ChatMessage {
            role: "system",
            content: self.config.system_prompt.clone(),
        }];
        let hint = match request.language {
            Language::Ru => Some("The user is currently speaking Russian."),
            Language::En => Some("The user is currently speaking English."),
            Language::Unknown => None,
        };
        if let Some(hint) = hint {
            messages.push(ChatMessage {
                role: "system",
                content: hint.to_string(),
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: request.text.clone(),
        });

        ChatRequest {
            model: &self.config.model,
            temperature: self.config.temperature,
            messages,
        }
    }
}

/// Pull the first choice's content out of a completions body.
fn extract_reply(body: ChatResponse) -> Result<String, ProviderError> {
    body.choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| ProviderError::Malformed("no choices[0].message.content".into()))
}

#[async_trait]
impl ReplyGenerator for ChatCompletionsGenerator {
    async fn generate(&self, request: &ReplyRequest) -> Result<String, ProviderError> {
        let api_key = require(&self.config.api_key, "chat.api_key")?;
        let body = self.build_request(request);

        debug!(
            model = %self.config.model,
            lang = %request.language,
            chars = request.text.chars().count(),
            "Requesting reply"
        );

        let resp = self
            .client
            .post(format!(
                "{}/chat/completions",
                self.config.base_url.trim_end_matches('/')
            ))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;
        let parsed: ChatResponse = ensure_success(resp)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        extract_reply(parsed)
    }

    fn name(&self) -> &str {
        "chat"
    }
}
