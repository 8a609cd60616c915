//! The LLM client wrapper (SYSTEM OVERVIEW component C, §4.2): retry with
//! exponential backoff, error categorization, fallback models, a per-agent
//! session table, callbacks, and metrics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::{categorize_error, LlmError, LlmErrorKind};
use crate::llm::provider::{CallOptions, CallResult, LlmInvoker};

pub type Callback = Arc<dyn Fn(&str) + Send + Sync>;
pub type RetryCallback = Arc<dyn Fn(&str, u32, Duration) + Send + Sync>;

/// §4.2 "Callbacks": a record of optional function-typed fields, never a
/// dynamic string lookup (§9).
#[derive(Default, Clone)]
pub struct Callbacks {
    pub on_start: Option<Callback>,
    pub on_complete: Option<Callback>,
    pub on_error: Option<Callback>,
    pub on_retry: Option<RetryCallback>,
    pub on_fallback: Option<Callback>,
    pub on_stdout: Option<Callback>,
    pub on_stderr: Option<Callback>,
}

macro_rules! fire {
    ($cb:expr, $($arg:expr),*) => {
        if let Some(f) = $cb.as_ref() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f($($arg),*)));
            if result.is_err() {
                tracing::warn!("llm client callback panicked; swallowed");
            }
        }
    };
}

/// §4.2 "Metrics". `metrics()` returns a deep copy (plain `Clone`, no shared
/// state leaks to the caller).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmMetrics {
    pub total_calls: u64,
    pub total_retries: u64,
    pub total_fallbacks: u64,
    pub total_cost_usd: f64,
    pub calls_by_agent: HashMap<String, u64>,
}

pub struct LlmClientConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// §4.2: UNKNOWN errors use the caller's default, which defaults to "do
    /// not retry".
    pub retry_unknown: bool,
}

impl Default for LlmClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            retry_unknown: false,
        }
    }
}

pub struct LlmClient {
    invoker: Arc<dyn LlmInvoker>,
    config: LlmClientConfig,
    callbacks: Callbacks,
    sessions: RwLock<HashMap<String, String>>,
    metrics: Mutex<LlmMetrics>,
}

impl LlmClient {
    pub fn new(invoker: Arc<dyn LlmInvoker>) -> Self {
        Self {
            invoker,
            config: LlmClientConfig::default(),
            callbacks: Callbacks::default(),
            sessions: RwLock::new(HashMap::new()),
            metrics: Mutex::new(LlmMetrics::default()),
        }
    }

    pub fn with_config(mut self, config: LlmClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    fn should_retry(kind: LlmErrorKind, retry_unknown: bool) -> bool {
        match kind {
            LlmErrorKind::Timeout | LlmErrorKind::Transient => true,
            LlmErrorKind::Permanent => false,
            LlmErrorKind::Unknown => retry_unknown,
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let jitter_ms = rand::thread_rng().gen_range(0..100);
        self.config.base_delay * 2u32.pow(attempt) + Duration::from_millis(jitter_ms)
    }

    async fn record_call(&self, agent_name: &str, result: &CallResult) {
        let mut metrics = self.metrics.lock().await;
        metrics.total_calls += 1;
        if let Some(cost) = result.cost_usd {
            metrics.total_cost_usd += cost;
        }
        *metrics.calls_by_agent.entry(agent_name.to_string()).or_insert(0) += 1;
    }

    async fn remember_session(&self, agent_name: &str, session_id: &str) {
        self.sessions
            .write()
            .await
            .insert(agent_name.to_string(), session_id.to_string());
    }

    /// Shared retry loop: `attempt` performs one invocation attempt, given
    /// the model to use for that attempt (which may be the fallback model
    /// after two retries, §4.2).
    async fn run_with_retry<F, Fut>(&self, agent_name: &str, opts: &CallOptions, attempt: F) -> Result<CallResult, LlmError>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<CallResult, LlmError>>,
    {
        fire!(self.callbacks.on_start, agent_name);

        let mut model = opts.model.clone().unwrap_or_default();
        let mut last_err: Option<LlmError> = None;

        for attempt_num in 0..=self.config.max_retries {
            if attempt_num >= 2
                && let Some(fallback) = &opts.fallback_model
                && model != *fallback
            {
                model = fallback.clone();
                self.metrics.lock().await.total_fallbacks += 1;
                fire!(self.callbacks.on_fallback, agent_name);
            }

            match attempt(model.clone()).await {
                Ok(result) => {
                    self.record_call(agent_name, &result).await;
                    fire!(self.callbacks.on_complete, agent_name);
                    return Ok(result);
                }
                Err(err) => {
                    fire!(self.callbacks.on_error, agent_name);
                    let retryable = Self::should_retry(err.kind, self.config.retry_unknown);
                    let is_last_attempt = attempt_num == self.config.max_retries;
                    last_err = Some(err);
                    if !retryable || is_last_attempt {
                        break;
                    }
                    let delay = self.backoff_delay(attempt_num);
                    self.metrics.lock().await.total_retries += 1;
                    if let Some(f) = self.callbacks.on_retry.as_ref() {
                        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            f(agent_name, attempt_num, delay)
                        }));
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| LlmError::new(LlmErrorKind::Unknown, "no attempts were made")))
    }

    pub async fn send_prompt(&self, agent_name: &str, prompt: &str, opts: CallOptions) -> Result<CallResult, LlmError> {
        let invoker = self.invoker.clone();
        let prompt = prompt.to_string();
        let base_opts = opts.clone();
        let result = self
            .run_with_retry(agent_name, &opts, |model| {
                let invoker = invoker.clone();
                let prompt = prompt.clone();
                let mut call_opts = base_opts.clone();
                call_opts.model = Some(model);
                async move { invoker.send_prompt(&prompt, &call_opts).await }
            })
            .await?;
        self.remember_session(agent_name, &result.session_id).await;
        Ok(result)
    }

    pub async fn start_session(
        &self,
        agent_name: &str,
        system_context: &str,
        prompt: &str,
        opts: CallOptions,
    ) -> Result<CallResult, LlmError> {
        let invoker = self.invoker.clone();
        let system_context = system_context.to_string();
        let prompt = prompt.to_string();
        let base_opts = opts.clone();
        let result = self
            .run_with_retry(agent_name, &opts, |model| {
                let invoker = invoker.clone();
                let system_context = system_context.clone();
                let prompt = prompt.clone();
                let mut call_opts = base_opts.clone();
                call_opts.model = Some(model);
                async move { invoker.start_session(&system_context, &prompt, &call_opts).await }
            })
            .await?;
        self.remember_session(agent_name, &result.session_id).await;
        Ok(result)
    }

    /// §4.2: fails with `NO_SESSION` if the session table has no entry for
    /// `agent_name`, unless `opts.new_session` bypasses resume entirely (in
    /// which case this behaves like `start_session` with an empty context).
    pub async fn continue_session(&self, agent_name: &str, prompt: &str, opts: CallOptions) -> Result<CallResult, LlmError> {
        if !opts.new_session && self.sessions.read().await.get(agent_name).is_none() {
            return Err(LlmError::new(
                LlmErrorKind::Unknown,
                format!("NO_SESSION: no session recorded for agent {agent_name}"),
            ));
        }

        let invoker = self.invoker.clone();
        let agent = agent_name.to_string();
        let prompt = prompt.to_string();
        let base_opts = opts.clone();
        let result = self
            .run_with_retry(agent_name, &opts, |model| {
                let invoker = invoker.clone();
                let agent = agent.clone();
                let prompt = prompt.clone();
                let mut call_opts = base_opts.clone();
                call_opts.model = Some(model);
                async move { invoker.continue_session(&agent, &prompt, &call_opts).await }
            })
            .await?;
        self.remember_session(agent_name, &result.session_id).await;
        Ok(result)
    }

    pub async fn metrics(&self) -> LlmMetrics {
        self.metrics.lock().await.clone()
    }

    pub async fn session_for(&self, agent_name: &str) -> Option<String> {
        self.sessions.read().await.get(agent_name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyInvoker {
        fail_times: AtomicU32,
        error_kind: LlmErrorKind,
    }

    #[async_trait]
    impl LlmInvoker for FlakyInvoker {
        async fn send_prompt(&self, _prompt: &str, _opts: &CallOptions) -> Result<CallResult, LlmError> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                let message = match self.error_kind {
                    LlmErrorKind::Transient => "upstream overloaded",
                    LlmErrorKind::Permanent => "invalid_api_key",
                    _ => "mystery failure",
                };
                return Err(LlmError::new(self.error_kind, message));
            }
            Ok(CallResult {
                response: "ok".to_string(),
                session_id: "sess-1".to_string(),
                cost_usd: Some(0.01),
                duration: Duration::from_millis(1),
                tokens_in: Some(10),
                tokens_out: Some(5),
                tool_calls: None,
                structured_output: None,
            })
        }

        async fn start_session(&self, _s: &str, _p: &str, _o: &CallOptions) -> Result<CallResult, LlmError> {
            unreachable!()
        }

        async fn continue_session(&self, _a: &str, _p: &str, _o: &CallOptions) -> Result<CallResult, LlmError> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let invoker = Arc::new(FlakyInvoker {
            fail_times: AtomicU32::new(2),
            error_kind: LlmErrorKind::Transient,
        });
        let client = LlmClient::new(invoker).with_config(LlmClientConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            retry_unknown: false,
        });
        let result = client.send_prompt("planner", "hi", CallOptions::default()).await;
        assert!(result.is_ok());
        assert_eq!(client.metrics().await.total_retries, 2);
    }

    #[tokio::test]
    async fn never_retries_permanent_errors() {
        let invoker = Arc::new(FlakyInvoker {
            fail_times: AtomicU32::new(1),
            error_kind: LlmErrorKind::Permanent,
        });
        let client = LlmClient::new(invoker);
        let result = client.send_prompt("planner", "hi", CallOptions::default()).await;
        assert!(result.is_err());
        assert_eq!(client.metrics().await.total_retries, 0);
    }

    #[tokio::test]
    async fn continue_session_without_prior_session_fails() {
        let invoker = Arc::new(FlakyInvoker {
            fail_times: AtomicU32::new(0),
            error_kind: LlmErrorKind::Unknown,
        });
        let client = LlmClient::new(invoker);
        let result = client.continue_session("coder", "hi", CallOptions::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn session_table_updates_after_successful_call() {
        let invoker = Arc::new(FlakyInvoker {
            fail_times: AtomicU32::new(0),
            error_kind: LlmErrorKind::Unknown,
        });
        let client = LlmClient::new(invoker);
        client.send_prompt("planner", "hi", CallOptions::default()).await.unwrap();
        assert_eq!(client.session_for("planner").await, Some("sess-1".to_string()));
    }
}
