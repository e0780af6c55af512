//! Chat-completions provider.
//!
//! Speaks the OpenAI protocol; `base_url` may point at any compatible
//! endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::http_client::{build_http_client, send_json};
use crate::provider::LlmProvider;
use crate::types::{
    Completion, CompletionRequest, LlmResult, ProviderConfig, StopReason, TokenUsage, WireTurn,
};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAIProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: ProviderConfig) -> LlmResult<Self> {
        let client = build_http_client(config.timeout())?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(OPENAI_API_URL)
    }

    fn body<'a>(&'a self, request: &'a CompletionRequest) -> ChatBody<'a> {
        let system = request.system.as_deref().map(|content| WireTurn {
            role: "system",
            content,
        });
        ChatBody {
            model: &self.config.model,
            max_tokens: request.max_tokens.unwrap_or(self.config.max_tokens),
            temperature: request.temperature.unwrap_or(self.config.temperature),
            messages: system
                .into_iter()
                .chain(request.messages.iter().map(WireTurn::from))
                .collect(),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAIProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, request: CompletionRequest) -> LlmResult<Completion> {
        let api_key = self.config.require_api_key()?;
        tracing::debug!(
            provider = "openai",
            model = %self.config.model,
            turns = request.messages.len(),
            "sending completion request"
        );

        let http = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&self.body(&request));
        let reply: ChatReply = send_json(http, "openai", self.config.timeout_secs).await?;
        Ok(reply.into())
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<WireTurn<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    model: String,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl From<ChatReply> for Completion {
    fn from(reply: ChatReply) -> Self {
        let choice = reply.choices.into_iter().next();
        let stop_reason =
            StopReason::from_wire(choice.as_ref().and_then(|c| c.finish_reason.as_deref()));
        Completion {
            text: choice.and_then(|c| c.message).and_then(|m| m.content),
            stop_reason,
            usage: reply
                .usage
                .map(|u| TokenUsage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                })
                .unwrap_or_default(),
            model: reply.model,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, ProviderType};

    fn provider() -> OpenAIProvider {
        OpenAIProvider::new(ProviderConfig {
            provider: ProviderType::OpenAI,
            api_key: Some("sk-test".to_string()),
            model: "gpt-4o".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_system_turn_comes_first() {
        let provider = provider();
        let request = CompletionRequest::new(vec![Message::user("Hello!"), Message::assistant("SELECT 1")])
            .with_system("You write SQL.")
            .deterministic();
        let body = serde_json::to_value(provider.body(&request)).unwrap();

        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Hello!");
        assert_eq!(body["messages"][2]["role"], "assistant");
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["model"], "gpt-4o");
    }

    #[test]
    fn test_request_overrides_token_budget() {
        let provider = provider();
        let request = CompletionRequest {
            max_tokens: Some(256),
            ..CompletionRequest::new(vec![Message::user("x")])
        };
        let body = serde_json::to_value(provider.body(&request)).unwrap();
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_reply_conversion() {
        let reply: ChatReply = serde_json::from_str(
            r#"{"model":"gpt-4o","choices":[{"message":{"content":"{\"done\":true}"},"finish_reason":"length"}],"usage":{"prompt_tokens":10,"completion_tokens":3}}"#,
        )
        .unwrap();
        let completion = Completion::from(reply);
        assert_eq!(completion.text.as_deref(), Some("{\"done\":true}"));
        assert_eq!(completion.stop_reason, StopReason::MaxTokens);
        assert_eq!(completion.usage.output_tokens, 3);
    }

    #[test]
    fn test_reply_without_choices_has_no_text() {
        let reply: ChatReply = serde_json::from_str(r#"{"model":"gpt-4o","choices":[]}"#).unwrap();
        assert!(Completion::from(reply).into_text().is_none());
    }
}
