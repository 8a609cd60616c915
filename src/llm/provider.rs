//! The underlying LLM invocation client (§1, §6): out of scope as a design
//! concern, but a concrete implementation is required for the crate to run.
//! [`LlmClient`](crate::llm::client::LlmClient) wraps any [`LlmInvoker`] with
//! the retry/backoff/fallback/session/metrics behavior that *is* in scope
//! (§4.2).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Text,
}

/// §4.2 "Options (enumerated)".
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub model: Option<String>,
    pub fallback_model: Option<String>,
    pub timeout: Option<Duration>,
    pub max_turns: Option<u32>,
    pub tools: Vec<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub json_schema: Option<serde_json::Value>,
    pub output_format: Option<OutputFormat>,
    pub new_session: bool,
    pub skip_permissions: bool,
}

#[derive(Debug, Clone)]
pub struct CallResult {
    pub response: String,
    pub session_id: String,
    pub cost_usd: Option<f64>,
    pub duration: Duration,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub tool_calls: Option<u32>,
    pub structured_output: Option<serde_json::Value>,
}

/// The raw, out-of-scope invocation surface (§6 "LLM client (consumed)").
#[async_trait]
pub trait LlmInvoker: Send + Sync {
    async fn send_prompt(&self, prompt: &str, opts: &CallOptions) -> Result<CallResult, LlmError>;
    async fn start_session(&self, system_context: &str, prompt: &str, opts: &CallOptions) -> Result<CallResult, LlmError>;
    async fn continue_session(&self, agent_name: &str, prompt: &str, opts: &CallOptions) -> Result<CallResult, LlmError>;
}

/// Default concrete invoker: calls the Anthropic Messages API directly.
/// Exists so the crate is runnable; the retry/fallback/session semantics
/// that matter for this specification live one layer up in
/// [`crate::llm::client::LlmClient`], not here.
pub struct HttpLlmInvoker {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl HttpLlmInvoker {
    pub fn new(api_key: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com/v1/messages".to_string(),
            default_model: default_model.into(),
        }
    }

    async fn call(&self, system: Option<&str>, prompt: &str, opts: &CallOptions) -> Result<CallResult, LlmError> {
        let start = std::time::Instant::now();
        let model = opts.model.clone().unwrap_or_else(|| self.default_model.clone());
        let mut body = serde_json::json!({
            "model": model,
            "max_tokens": 4096,
            "messages": [{"role": "user", "content": prompt}],
        });
        if let Some(system) = system {
            body["system"] = serde_json::Value::String(system.to_string());
        }

        let timeout = opts.timeout.unwrap_or(Duration::from_secs(120));
        let response = tokio::time::timeout(
            timeout,
            self.http
                .post(&self.base_url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| LlmError::new(crate::error::LlmErrorKind::Timeout, "request timed out"))?
        .map_err(|e| LlmError::new(crate::error::categorize_error(&e.to_string()), e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = format!("HTTP {status}: {body}");
            return Err(LlmError::new(crate::error::categorize_error(&message), message));
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::new(crate::error::LlmErrorKind::Unknown, e.to_string()))?;

        let text = parsed["content"][0]["text"].as_str().unwrap_or_default().to_string();
        let tokens_in = parsed["usage"]["input_tokens"].as_u64();
        let tokens_out = parsed["usage"]["output_tokens"].as_u64();

        Ok(CallResult {
            response: text,
            session_id: uuid::Uuid::new_v4().to_string(),
            cost_usd: None,
            duration: start.elapsed(),
            tokens_in,
            tokens_out,
            tool_calls: None,
            structured_output: None,
        })
    }
}

#[async_trait]
impl LlmInvoker for HttpLlmInvoker {
    async fn send_prompt(&self, prompt: &str, opts: &CallOptions) -> Result<CallResult, LlmError> {
        self.call(opts.system_prompt.as_deref(), prompt, opts).await
    }

    async fn start_session(&self, system_context: &str, prompt: &str, opts: &CallOptions) -> Result<CallResult, LlmError> {
        self.call(Some(system_context), prompt, opts).await
    }

    async fn continue_session(&self, _agent_name: &str, prompt: &str, opts: &CallOptions) -> Result<CallResult, LlmError> {
        self.call(opts.system_prompt.as_deref(), prompt, opts).await
    }
}
