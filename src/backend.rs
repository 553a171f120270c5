//! Completion backends
//!
//! One backend per configured provider. The wire contract is deliberately
//! thin: a prompt string in, raw text out. All structure recovery happens
//! in the parser. `HttpBackend` speaks the OpenAI-style chat-completions
//! shape that OpenRouter, Ollama, and most gateways accept.

use crate::error::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Raw completion text plus whatever usage accounting the provider reported.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub token_count: u32,
}

/// A text-completion call against one provider.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Provider name as it appears in configuration and the performance log.
    fn provider_name(&self) -> &str;

    async fn complete(&self, model: &str, prompt: &str) -> Result<Completion, BackendError>;
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: String,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    total_tokens: u32,
}

/// System prompt sent with every report request.
const REPORT_SYSTEM_PROMPT: &str = "You are an analytical report writer. \
Respond with a single JSON object containing \"executive_summary\" (string), \
\"principal_findings\" (array of strings), and \"analytic_sections\" \
(object mapping section names to prose). Output ONLY the JSON object.";

const DEFAULT_MAX_TOKENS: u32 = 4096;

/// HTTP chat-completions backend for one provider.
pub struct HttpBackend {
    provider_name: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpBackend {
    /// `base_url` is the full completions endpoint, e.g.
    /// `https://openrouter.ai/api/v1/chat/completions`. The API key is read
    /// once from `api_key_env` at construction; providers without
    /// authentication (local gateways) may leave it unset.
    pub fn new(provider_name: &str, base_url: &str, api_key_env: Option<&str>) -> Self {
        let api_key = api_key_env.and_then(|var| std::env::var(var).ok());
        Self::with_api_key(provider_name, base_url, api_key)
    }

    /// Construct with an already-resolved key.
    pub fn with_api_key(provider_name: &str, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            provider_name: provider_name.to_string(),
            base_url: base_url.to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CompletionBackend for HttpBackend {
    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    async fn complete(&self, model: &str, prompt: &str) -> Result<Completion, BackendError> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: REPORT_SYSTEM_PROMPT.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            max_tokens: DEFAULT_MAX_TOKENS,
            stream: false,
            response_format: Some(ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        };

        let mut builder = self
            .client
            .post(&self.base_url)
            .header("Content-Type", "application/json")
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| BackendError::Connect(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::Connect(e.to_string()))?;

        if !status.is_success() {
            return Err(match status.as_u16() {
                429 => BackendError::RateLimited(truncate_body(&text)),
                500..=599 => BackendError::Server {
                    status: status.as_u16(),
                    body: truncate_body(&text),
                },
                _ => BackendError::Other(format!("{}: {}", status, truncate_body(&text))),
            });
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| BackendError::Other(format!("unreadable completion envelope: {}", e)))?;

        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| BackendError::Other("completion had no choices".to_string()))?;

        Ok(Completion {
            text: content,
            token_count: parsed.usage.unwrap_or_default().total_tokens,
        })
    }
}

/// Truncate an error body for messages (Unicode-safe).
fn truncate_body(s: &str) -> String {
    const MAX: usize = 200;
    if s.chars().count() <= MAX {
        s.to_string()
    } else {
        s.chars().take(MAX).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_carries_resolved_key() {
        let backend = HttpBackend::with_api_key(
            "openrouter",
            "https://openrouter.ai/api/v1/chat/completions",
            Some("sk-test".to_string()),
        );
        assert_eq!(backend.provider_name(), "openrouter");
        assert_eq!(backend.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn backend_without_key_env_has_no_key() {
        let backend = HttpBackend::new("local", "http://127.0.0.1:11434/v1/chat/completions", None);
        assert!(backend.api_key.is_none());
    }

    #[test]
    fn unset_key_env_yields_no_key() {
        // Reads only; never mutates process environment.
        let backend = HttpBackend::new(
            "openrouter",
            "https://openrouter.ai/api/v1/chat/completions",
            Some("TRENDSCRIBE_KEY_VAR_THAT_IS_NEVER_SET"),
        );
        assert!(backend.api_key.is_none());
    }

    #[test]
    fn chat_request_serializes_json_mode() {
        let request = ChatRequest {
            model: "m".into(),
            messages: vec![],
            max_tokens: 16,
            stream: false,
            response_format: Some(ResponseFormat {
                format_type: "json_object".into(),
            }),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"type\":\"json_object\""));
    }

    #[test]
    fn chat_response_parses_usage() {
        let json = r#"{"choices":[{"message":{"content":"hi"}}],"usage":{"total_tokens":12}}"#;
        let parsed: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.choices[0].message.content, "hi");
        assert_eq!(parsed.usage.unwrap().total_tokens, 12);
    }

    #[test]
    fn truncate_body_is_unicode_safe() {
        let body = "é".repeat(300);
        assert_eq!(truncate_body(&body).chars().count(), 200);
    }
}
