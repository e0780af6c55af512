//! Anthropic Messages API provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::http_client::{build_http_client, send_json};
use crate::provider::LlmProvider;
use crate::types::{
    Completion, CompletionRequest, LlmResult, ProviderConfig, StopReason, TokenUsage, WireTurn,
};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig) -> LlmResult<Self> {
        let client = build_http_client(config.timeout())?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(ANTHROPIC_API_URL)
    }

    fn body<'a>(&'a self, request: &'a CompletionRequest) -> MessagesBody<'a> {
        // Every step of a run shares the system prompt, so mark it cacheable.
        let system = request
            .system
            .as_deref()
            .map(|text| {
                vec![SystemBlock {
                    kind: "text",
                    text,
                    cache_control: CacheControl { kind: "ephemeral" },
                }]
            })
            .unwrap_or_default();

        MessagesBody {
            model: &self.config.model,
            max_tokens: request.max_tokens.unwrap_or(self.config.max_tokens),
            temperature: request.temperature.unwrap_or(self.config.temperature),
            system,
            messages: request.messages.iter().map(WireTurn::from).collect(),
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, request: CompletionRequest) -> LlmResult<Completion> {
        let api_key = self.config.require_api_key()?;
        tracing::debug!(
            provider = "anthropic",
            model = %self.config.model,
            turns = request.messages.len(),
            "sending completion request"
        );

        let http = self
            .client
            .post(self.endpoint())
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.body(&request));
        let reply: MessagesReply = send_json(http, "anthropic", self.config.timeout_secs).await?;
        Ok(reply.into())
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    system: Vec<SystemBlock<'a>>,
    messages: Vec<WireTurn<'a>>,
}

#[derive(Debug, Serialize)]
struct SystemBlock<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
    cache_control: CacheControl,
}

#[derive(Debug, Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct MessagesReply {
    content: Vec<ReplyBlock>,
    model: String,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: TokenUsage,
}

/// Only text blocks carry the answer; thinking and other blocks are skipped.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ReplyBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

impl From<MessagesReply> for Completion {
    fn from(reply: MessagesReply) -> Self {
        let text: String = reply
            .content
            .into_iter()
            .filter_map(|block| match block {
                ReplyBlock::Text { text } => Some(text),
                ReplyBlock::Other => None,
            })
            .collect();
        Completion {
            text: (!text.is_empty()).then_some(text),
            stop_reason: StopReason::from_wire(reply.stop_reason.as_deref()),
            usage: reply.usage,
            model: reply.model,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LlmError, Message};

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new(ProviderConfig {
            api_key: Some("sk-ant-test".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_body_marks_system_prompt_cacheable() {
        let provider = provider();
        let request = CompletionRequest::new(vec![Message::user("Analyze this question: top states")])
            .with_system("You are an analyst.")
            .deterministic();
        let body = serde_json::to_value(provider.body(&request)).unwrap();

        assert_eq!(body["system"][0]["text"], "You are an analyst.");
        assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["max_tokens"], 4096);
    }

    #[test]
    fn test_body_without_system_omits_field() {
        let provider = provider();
        let body = serde_json::to_value(provider.body(&CompletionRequest::new(vec![]))).unwrap();
        assert!(body.get("system").is_none());
    }

    #[test]
    fn test_reply_joins_text_blocks() {
        let reply: MessagesReply = serde_json::from_str(
            r#"{"content":[{"type":"thinking","thinking":"..."},{"type":"text","text":"{\"plan\":"},{"type":"text","text":"[]}"}],
                "model":"claude-sonnet-4-5","stop_reason":"end_turn","usage":{"input_tokens":5,"output_tokens":2}}"#,
        )
        .unwrap();
        let completion = Completion::from(reply);
        assert_eq!(completion.text.as_deref(), Some("{\"plan\":[]}"));
        assert_eq!(completion.usage.input_tokens, 5);
        assert_eq!(completion.stop_reason, StopReason::EndTurn);
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_request() {
        let provider = AnthropicProvider::new(ProviderConfig::default()).unwrap();
        let err = provider
            .complete(CompletionRequest::new(vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::MissingApiKey { provider: "anthropic" }));
    }
}
