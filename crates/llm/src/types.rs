//! LLM Types
//!
//! Provider configuration, completion requests and responses, and the error
//! type shared by every provider.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_TIMEOUT_SECS: u64 = 120;

// ============================================================================
// Configuration
// ============================================================================

/// Wire protocol spoken by the configured endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Anthropic,
    /// OpenAI or any endpoint speaking the chat-completions protocol
    #[serde(alias = "openai-compatible")]
    OpenAI,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Anthropic => "anthropic",
            ProviderType::OpenAI => "openai",
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model endpoint and sampling defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: ProviderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Full endpoint URL; the provider's public API when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// 0.0 - 1.0
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: ProviderType::Anthropic,
            api_key: None,
            base_url: None,
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: 0.0,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The configured key, or `MissingApiKey` before any request is made.
    pub fn require_api_key(&self) -> LlmResult<&str> {
        self.api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(LlmError::MissingApiKey {
                provider: self.provider.as_str(),
            })
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// A text turn in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: text.into(),
        }
    }
}

/// One completion call. Unset sampling fields fall back to the provider
/// configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Greedy sampling, so that the same prompt yields the same query.
    pub fn deterministic(mut self) -> Self {
        self.temperature = Some(0.0);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Role/content pair as both chat APIs expect it on the wire.
#[derive(Debug, Serialize)]
pub(crate) struct WireTurn<'a> {
    pub role: &'static str,
    pub content: &'a str,
}

impl<'a> From<&'a Message> for WireTurn<'a> {
    fn from(message: &'a Message) -> Self {
        Self {
            role: message.role.as_str(),
            content: &message.content,
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    Other(String),
}

impl StopReason {
    /// Map either provider's finish reason.
    pub fn from_wire(reason: Option<&str>) -> Self {
        match reason.map(str::to_ascii_lowercase).as_deref() {
            None | Some("end_turn") | Some("stop") | Some("stop_sequence") => StopReason::EndTurn,
            Some("max_tokens") | Some("length") => StopReason::MaxTokens,
            Some(other) => StopReason::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A finished completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: Option<String>,
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
    pub model: String,
}

impl Completion {
    /// Completion carrying only `text`, for scripted providers.
    pub fn from_text(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage::default(),
            model: model.into(),
        }
    }

    /// The text, unless it is missing or blank.
    pub fn into_text(self) -> Option<String> {
        self.text.filter(|t| !t.trim().is_empty())
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("API key not configured for {provider}")]
    MissingApiKey { provider: &'static str },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Model request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Malformed provider response: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: &str, provider: &str) -> Self {
        match status {
            401 | 403 => LlmError::Auth(format!("{} rejected the API key", provider)),
            429 => LlmError::RateLimited(body.to_string()),
            400 | 404 | 422 => LlmError::InvalidRequest(body.to_string()),
            _ => LlmError::Server {
                status,
                message: body.to_string(),
            },
        }
    }

    /// Map a transport failure, keeping timeouts distinct.
    pub fn from_transport(err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            LlmError::Timeout {
                seconds: timeout_secs,
            }
        } else {
            LlmError::Network(err.to_string())
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, LlmError::Timeout { .. })
    }
}

pub type LlmResult<T> = Result<T, LlmError>;
