//! # LLM Client Seam
//!
//! The engine delegates natural-language understanding (spec lowering) and
//! slot-restricted code emission to a language model behind the `LlmClient`
//! trait. Everything above this seam is deterministic; the trait is the only
//! place free-form text enters the pipeline, and every caller validates what
//! comes back before accepting it.
//!
//! Two implementations ship:
//! - `HttpLlmClient`: OpenAI-compatible chat-completions transport over
//!   reqwest with a hard deadline and one bounded retry.
//! - `ScriptedLlmClient`: replays canned responses in order; used by tests
//!   and by deterministic pipeline runs that must not touch the network.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Default per-call deadline. Calls for specs larger than `STREAM_THRESHOLD`
/// should be streamed by the transport; the deadline still applies end to end.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(120);

/// Spec size above which the transport requests streamed output.
pub const STREAM_THRESHOLD: usize = 20 * 1024;

/// A single completion request.
#[derive(Debug, Clone, Serialize)]
pub struct LlmRequest {
    /// System preamble (role constraints, output contract)
    pub system: String,
    /// User prompt
    pub prompt: String,
    pub max_tokens: u32,
    /// Overall deadline for the call
    #[serde(skip)]
    pub deadline: Duration,
}

impl LlmRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        LlmRequest {
            system: system.into(),
            prompt: prompt.into(),
            max_tokens: 4096,
            deadline: DEFAULT_DEADLINE,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// A completion with its token accounting, recorded in the manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub model: String,
}

/// Transport-level LLM errors. Transient failures are retried once by the
/// caller; everything else escalates.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM transport error: {0}")]
    Transport(String),

    #[error("LLM returned an empty completion")]
    EmptyCompletion,

    #[error("scripted client exhausted after {served} responses")]
    ScriptExhausted { served: usize },
}

impl LlmError {
    /// Whether a single retry is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Timeout(_) | LlmError::Transport(_))
    }
}

/// The LLM seam. Implementations must be safe to share across the emitter's
/// worker pool.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;
}

// ============================================================================
// HTTP transport
// ============================================================================

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: ChatUsage,
}

/// OpenAI-compatible chat-completions client.
pub struct HttpLlmClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpLlmClient {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        HttpLlmClient {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    async fn call_once(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: 0.0,
            stream: request.prompt.len() > STREAM_THRESHOLD,
        };

        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let send = async {
            let response = req
                .send()
                .await
                .map_err(|e| LlmError::Transport(e.to_string()))?;
            let response = response
                .error_for_status()
                .map_err(|e| LlmError::Transport(e.to_string()))?;
            response
                .json::<ChatResponse>()
                .await
                .map_err(|e| LlmError::Transport(e.to_string()))
        };

        let parsed = tokio::time::timeout(request.deadline, send)
            .await
            .map_err(|_| LlmError::Timeout(request.deadline))??;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(LlmError::EmptyCompletion);
        }

        Ok(LlmResponse {
            text,
            tokens_in: parsed.usage.prompt_tokens,
            tokens_out: parsed.usage.completion_tokens,
            model: self.model.clone(),
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        match self.call_once(&request).await {
            Ok(response) => Ok(response),
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "LLM call failed, retrying once");
                self.call_once(&request).await
            }
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Scripted transport
// ============================================================================

/// Replays queued responses in order. Deterministic; exhaustion is an error
/// so a test that issues an unexpected extra call fails loudly.
pub struct ScriptedLlmClient {
    responses: parking_lot::Mutex<VecDeque<String>>,
    /// When set, every call past the end of the queue answers with this text
    repeat_text: parking_lot::Mutex<Option<String>>,
    served: parking_lot::Mutex<usize>,
    /// Prompts seen, for assertions about prompt content (pattern injection)
    prompts: parking_lot::Mutex<Vec<String>>,
}

impl ScriptedLlmClient {
    pub fn new(responses: Vec<String>) -> Self {
        ScriptedLlmClient {
            responses: parking_lot::Mutex::new(responses.into()),
            repeat_text: parking_lot::Mutex::new(None),
            served: parking_lot::Mutex::new(0),
            prompts: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// A client that answers every call with the same text.
    pub fn repeating(text: impl Into<String>) -> Self {
        let client = ScriptedLlmClient::new(Vec::new());
        client.repeat_text.lock().replace(text.into());
        client
    }

    /// Prompts observed so far.
    pub fn seen_prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

impl Default for ScriptedLlmClient {
    fn default() -> Self {
        ScriptedLlmClient::new(Vec::new())
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        self.prompts.lock().push(request.prompt.clone());

        let next = self.responses.lock().pop_front();
        let text = match next {
            Some(text) => text,
            None => match self.repeat_text.lock().clone() {
                Some(text) => text,
                None => {
                    return Err(LlmError::ScriptExhausted {
                        served: *self.served.lock(),
                    })
                }
            },
        };
        *self.served.lock() += 1;
        Ok(LlmResponse {
            text,
            tokens_in: (request.prompt.len() / 4) as u32,
            tokens_out: 64,
            model: "scripted".to_string(),
        })
    }
}
