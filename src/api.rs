//! # API Module
//!
//! The language-model side of the pipeline. [`LanguageModel`] is the seam the
//! orchestrator talks to; [`OpenAiChat`] implements it against any
//! OpenAI-compatible chat-completions endpoint through `async-openai`.
//!
//! # Example
//!
//! ```no_run
//! use sigma_rag::api::{ChatMessage, LanguageModel, OpenAiChat};
//! use sigma_rag::config::LlmConfig;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let llm = OpenAiChat::new(&LlmConfig::default())?;
//! let answer = llm
//!     .complete(&[
//!         ChatMessage::System("You are a Lean Six Sigma consultant.".into()),
//!         ChatMessage::User("What is a control chart?".into()),
//!     ])
//!     .await?;
//! println!("{answer}");
//! # Ok(()) }
//! ```
use async_openai::{
    Client,
    config::OpenAIConfig,
    error::{ApiError, OpenAIError},
    types::chat::{
        ChatCompletionRequestAssistantMessage, ChatCompletionRequestAssistantMessageContent,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
        ChatCompletionRequestUserMessageContent, CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::LlmConfig;
use crate::conversation::{Role, Turn};
use crate::retry::Retryable;

/// Failures from the completion provider.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Network-level failure or timeout.
    #[error("transport error: {0}")]
    Transport(String),
    /// The provider understood the request and rejected it.
    #[error("api error: {0}")]
    Api(String),
    /// Server-side failure or rate limiting; worth another attempt.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("model returned an empty response")]
    EmptyResponse,
}

impl Retryable for LlmError {
    fn is_transient(&self) -> bool {
        matches!(self, LlmError::Transport(_) | LlmError::Unavailable(_))
    }
}

impl From<OpenAIError> for LlmError {
    fn from(e: OpenAIError) -> Self {
        match e {
            OpenAIError::Reqwest(inner) => LlmError::Transport(inner.to_string()),
            OpenAIError::ApiError(api) if is_overloaded(&api) => {
                LlmError::Unavailable(api.to_string())
            }
            other => LlmError::Api(other.to_string()),
        }
    }
}

/// 5xx bodies reach us as a bare message with no type, code or param; rate
/// limits carry `rate_limit_exceeded`. Quota exhaustion is not retryable.
fn is_overloaded(error: &ApiError) -> bool {
    let server_error = error.r#type.is_none() && error.code.is_none() && error.param.is_none();
    let rate_limited = error.code.as_deref() == Some("rate_limit_exceeded")
        || matches!(error.r#type.as_deref(), Some("requests" | "tokens"));
    server_error || rate_limited
}

/// A backoff that gives up after the first failure. Retries belong to
/// [`crate::retry::RetryPolicy`].
fn single_attempt() -> ExponentialBackoff {
    ExponentialBackoff {
        max_elapsed_time: Some(Duration::ZERO),
        ..ExponentialBackoff::default()
    }
}

/// One message of a completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatMessage {
    System(String),
    User(String),
    Assistant(String),
}

impl ChatMessage {
    pub fn content(&self) -> &str {
        match self {
            ChatMessage::System(s) | ChatMessage::User(s) | ChatMessage::Assistant(s) => s,
        }
    }
}

impl From<&Turn> for ChatMessage {
    fn from(turn: &Turn) -> Self {
        match turn.role {
            Role::User => ChatMessage::User(turn.content.clone()),
            Role::Assistant => ChatMessage::Assistant(turn.content.clone()),
        }
    }
}

impl From<&ChatMessage> for ChatCompletionRequestMessage {
    fn from(message: &ChatMessage) -> Self {
        match message {
            ChatMessage::System(text) => {
                ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                    content: ChatCompletionRequestSystemMessageContent::Text(text.clone()),
                    name: None,
                })
            }
            ChatMessage::User(text) => {
                ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                    content: ChatCompletionRequestUserMessageContent::Text(text.clone()),
                    name: None,
                })
            }
            #[allow(deprecated)]
            ChatMessage::Assistant(text) => {
                ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                    content: Some(ChatCompletionRequestAssistantMessageContent::Text(
                        text.clone(),
                    )),
                    name: None,
                    refusal: None,
                    audio: None,
                    tool_calls: None,
                    function_call: None,
                })
            }
        }
    }
}

/// A chat-completion backend.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Complete the conversation and return the assistant's text.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;
}

/// OpenAI-compatible chat completions.
pub struct OpenAiChat {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    max_response_tokens: Option<u32>,
}

impl OpenAiChat {
    /// Creates the client from configuration, with the configured request timeout
    /// and async-openai's own retry loop switched off.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let openai_config = OpenAIConfig::new()
            .with_api_key(config.api_key.clone())
            .with_api_base(config.api_base.clone());

        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| LlmError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client: Client::with_config(openai_config)
                .with_http_client(http)
                .with_backoff(single_attempt()),
            model: config.model.clone(),
            temperature: config.temperature,
            max_response_tokens: config.max_response_tokens,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiChat {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let messages: Vec<ChatCompletionRequestMessage> =
            messages.iter().map(ChatCompletionRequestMessage::from).collect();

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(self.model.clone())
            .temperature(self.temperature)
            .messages(messages);
        if let Some(max_tokens) = self.max_response_tokens {
            args.max_completion_tokens(max_tokens);
        }
        let request = args.build()?;

        debug!("Sending request: {:?}", request);

        let response = self.client.chat().create(request).await?;

        let mut response_string = String::new();
        response.choices.iter().for_each(|chat_choice| {
            if let Some(message_text) = &chat_choice.message.content {
                response_string.push_str(message_text);
            }
        });

        if response_string.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(response_string)
    }
}
