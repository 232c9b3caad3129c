//! Contract for the underlying LLM agent.
//!
//! The runner never talks to a provider directly. It hands a prompt, the
//! converted conversation history and the model settings to an [`Agent`] and
//! classifies whatever comes back: rate limits and transient connection
//! failures are retried, everything else is passed through.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod convert;

pub use convert::{DefaultMessageConverter, HistoryEntry, MessageConverter};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(role: &str) -> Option<Self> {
        match role {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }
}

/// Token usage reported by the agent for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Total prompt tokens, including any served from the provider's prompt cache
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Tokens written to the provider's prompt cache (Anthropic cache_creation_input_tokens)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_tokens: Option<u64>,
    /// Tokens read from the provider's prompt cache (Anthropic cache_read_input_tokens, OpenAI cached_tokens)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_output_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Default::default()
        }
    }

    pub fn with_cache(
        input_tokens: u64,
        output_tokens: u64,
        cache_creation_tokens: Option<u64>,
        cache_read_tokens: Option<u64>,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cache_creation_tokens,
            cache_read_tokens,
            cached_output_tokens: None,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Generation settings forwarded to the agent. They change the output, so
/// they are part of the cache key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

/// What a successful invocation hands back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse<T> {
    pub output: T,
    pub usage: TokenUsage,
}

impl<T> AgentResponse<T> {
    pub fn new(output: T, usage: TokenUsage) -> Self {
        Self { output, usage }
    }
}

/// Kinds of connection failure worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Timeout,
    ConnectionRefused,
    ConnectionReset,
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransientKind::Timeout => "timeout",
            TransientKind::ConnectionRefused => "connection refused",
            TransientKind::ConnectionReset => "connection reset",
        };
        f.write_str(name)
    }
}

/// Failure reported by an agent invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Provider rate limit or usage limit hit.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Timeout, refused or reset connection.
    #[error("{kind}: {message}")]
    Transient { kind: TransientKind, message: String },

    /// Anything else. Never retried.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
        }
    }
}

/// An LLM agent whose responses can be cached.
///
/// `identity` must capture every piece of agent configuration that shapes the
/// output (system prompt, output schema, tools). Two agents with the same
/// model and identity are treated as interchangeable by the cache.
#[async_trait]
pub trait Agent: Send + Sync {
    type Output: Serialize + DeserializeOwned + Send + Sync;

    /// Model name used for cost lookup and the cache key.
    fn model_name(&self) -> &str;

    /// Stable description of the agent's configuration.
    fn identity(&self) -> String {
        String::new()
    }

    async fn invoke(
        &self,
        prompt: &str,
        history: &[Message],
        settings: &ModelSettings,
    ) -> Result<AgentResponse<Self::Output>, AgentError>;
}
