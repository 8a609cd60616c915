//! Coder worker (SYSTEM OVERVIEW component E, §4.4).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::bus::{AgentMessage, Worker};
use crate::domain::{CodeOutput, DetailedFixPlan, PlanStep};
use crate::llm::{CallOptions, LlmClient};
use crate::parsing::parse_code_response;
use crate::workers::CODER_AGENT;

const DEFAULT_MAX_FIX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixCycleState {
    NotStarted,
    InProgress,
    Resolved,
    MaxAttemptsReached,
}

#[derive(Debug, Clone)]
pub struct FixCycleInfo {
    pub state: FixCycleState,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl FixCycleInfo {
    fn new(max_attempts: u32) -> Self {
        Self {
            state: FixCycleState::NotStarted,
            attempts: 0,
            max_attempts,
        }
    }

    fn record_attempt(&mut self) -> FixCycleState {
        self.attempts += 1;
        self.state = if self.attempts >= self.max_attempts {
            FixCycleState::MaxAttemptsReached
        } else {
            FixCycleState::InProgress
        };
        self.state
    }

    fn resolve(&mut self) {
        self.state = FixCycleState::Resolved;
    }
}

struct Inner {
    fix_cycles: HashMap<String, FixCycleInfo>,
    max_fix_attempts: u32,
}

pub struct Coder {
    llm: Arc<LlmClient>,
    inner: Mutex<Inner>,
}

impl Coder {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self::with_max_fix_attempts(llm, DEFAULT_MAX_FIX_ATTEMPTS)
    }

    pub fn with_max_fix_attempts(llm: Arc<LlmClient>, max_fix_attempts: u32) -> Self {
        Self {
            llm,
            inner: Mutex::new(Inner {
                fix_cycles: HashMap::new(),
                max_fix_attempts,
            }),
        }
    }

    fn system_context() -> &'static str {
        "You are the Coder in an autonomous multi-agent orchestration engine. \
         Implement the requested step. Respond in this exact format: a \
         `### Summary` section with a one or two sentence description of the \
         change, a `### Files Created` and/or `### Files Modified` section \
         listing each file as a back-quoted path immediately followed by a \
         fenced code block with its full contents, a `### Tests Created` \
         section in the same back-quoted-path-plus-fenced-block form, and \
         optionally a `### Commands Run` section with one shell command per \
         line. If the step cannot be implemented as given, respond with the \
         single line STEP BLOCKED: <reason> and nothing else."
    }

    /// §4.4 `implement(step, context)`. 10 minute timeout.
    pub async fn implement(&self, step: &PlanStep, context: &str) -> CodeOutput {
        let prompt = format!(
            "STEP {}: {}\nCONTEXT: {context}\n\nImplement this step now.",
            step.number, step.description
        );
        let opts = CallOptions {
            timeout: Some(Duration::from_secs(600)),
            ..Default::default()
        };

        let result = self
            .llm
            .start_session(CODER_AGENT, Self::system_context(), &prompt, opts)
            .await;

        match result {
            Ok(call) => parse_code_response(&call.response),
            Err(e) => CodeOutput::blocked(format!("implementation call failed: {e}")),
        }
    }

    /// §4.4 `applyFix(step, fixPlan, fixCycleInfo)`. 5 minute timeout.
    /// Uses a different approach once `attempts > 1`, and raises
    /// `requiresSubPlan` once the per-step cycle is exhausted.
    pub async fn apply_fix(&self, step: &PlanStep, fix_plan: &DetailedFixPlan) -> CodeOutput {
        let (state, attempts, max_attempts) = {
            let mut inner = self.inner.lock().await;
            let max_fix_attempts = inner.max_fix_attempts;
            let cycle = inner
                .fix_cycles
                .entry(step.id.clone())
                .or_insert_with(|| FixCycleInfo::new(max_fix_attempts));
            let state = cycle.record_attempt();
            (state, cycle.attempts, cycle.max_attempts)
        };

        if state == FixCycleState::MaxAttemptsReached {
            let mut output = CodeOutput::new(format!(
                "fix cycle for step {} exhausted after {attempts}/{max_attempts} attempts",
                step.number
            ));
            output.mark_requires_sub_plan(format!(
                "unable to resolve step {} after {attempts} fix attempts",
                step.number
            ));
            return output;
        }

        let different_approach = if attempts > 1 {
            "Previous fix attempts did not resolve the issue. Try a materially \
             different implementation approach this time, not a minor variation."
        } else {
            ""
        };

        let issues_text = fix_plan
            .issues
            .iter()
            .map(|i| format!("- [{:?}] {} ({})", i.severity, i.description, i.category))
            .collect::<Vec<_>>()
            .join("\n");
        let steps_text = fix_plan
            .fix_steps
            .iter()
            .map(|s| format!("- {}", s.description))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "STEP {}: {}\nThe previous implementation has these issues:\n{issues_text}\n\n\
             Recommended fix steps:\n{steps_text}\n{different_approach}\n\nApply the fix now.",
            step.number, step.description
        );

        let opts = CallOptions {
            timeout: Some(Duration::from_secs(300)),
            ..Default::default()
        };

        let continued = self.llm.continue_session(CODER_AGENT, &prompt, opts.clone()).await;
        let response = match continued {
            Ok(result) => Ok(result),
            Err(_) => self.llm.start_session(CODER_AGENT, Self::system_context(), &prompt, opts).await,
        };

        match response {
            Ok(call) => parse_code_response(&call.response),
            Err(e) => CodeOutput::blocked(format!("fix call failed: {e}")),
        }
    }

    /// §4.4 `requestTestsForImplementation(step, codeOutput)`: asks the
    /// Coder's own session to propose a test plan when the implementation
    /// arrived with no tests attached.
    pub async fn request_tests_for_implementation(&self, step: &PlanStep, code_output: &CodeOutput) -> Vec<String> {
        if code_output.test_coverage.has_tests {
            return code_output.tests.clone();
        }

        let files_text = code_output
            .files
            .iter()
            .map(|f| f.path.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let prompt = format!(
            "STEP {}: {}\nThe implementation touched these files: {files_text}\n\
             Propose the test file(s) needed to cover this change.",
            step.number, step.description
        );
        let opts = CallOptions {
            timeout: Some(Duration::from_secs(300)),
            ..Default::default()
        };

        let continued = self.llm.continue_session(CODER_AGENT, &prompt, opts.clone()).await;
        let response = match continued {
            Ok(result) => Ok(result),
            Err(_) => self.llm.start_session(CODER_AGENT, Self::system_context(), &prompt, opts).await,
        };

        match response {
            Ok(call) => parse_code_response(&call.response).tests,
            Err(_) => Vec::new(),
        }
    }

    pub async fn fix_cycle_state(&self, step_id: &str) -> FixCycleState {
        self.inner
            .lock()
            .await
            .fix_cycles
            .get(step_id)
            .map(|c| c.state)
            .unwrap_or(FixCycleState::NotStarted)
    }

    pub async fn mark_resolved(&self, step_id: &str) {
        if let Some(cycle) = self.inner.lock().await.fix_cycles.get_mut(step_id) {
            cycle.resolve();
        }
    }

    pub async fn reset_fix_cycle(&self, step_id: &str) {
        self.inner.lock().await.fix_cycles.remove(step_id);
    }
}

#[async_trait]
impl Worker for Coder {
    async fn handle_message(&self, msg: AgentMessage) -> AgentMessage {
        match msg.message_type.as_str() {
            "code_request" => {
                let step: PlanStep = match serde_json::from_value(msg.payload["step"].clone()) {
                    Ok(step) => step,
                    Err(e) => {
                        return AgentMessage::respond_to(&msg, "error_response", json!({ "error": e.to_string() }));
                    }
                };
                let context = msg.payload["context"].as_str().unwrap_or_default().to_string();
                let output = self.implement(&step, &context).await;
                AgentMessage::respond_to(&msg, "code_response", json!({ "code_output": output }))
            }
            "fix_request" => {
                let step: PlanStep = match serde_json::from_value(msg.payload["step"].clone()) {
                    Ok(step) => step,
                    Err(e) => {
                        return AgentMessage::respond_to(&msg, "error_response", json!({ "error": e.to_string() }));
                    }
                };
                let fix_plan: DetailedFixPlan = match serde_json::from_value(msg.payload["fix_plan"].clone()) {
                    Ok(plan) => plan,
                    Err(e) => {
                        return AgentMessage::respond_to(&msg, "error_response", json!({ "error": e.to_string() }));
                    }
                };
                let output = self.apply_fix(&step, &fix_plan).await;
                let state = self.fix_cycle_state(&step.id).await;
                AgentMessage::respond_to(
                    &msg,
                    "fix_response",
                    json!({ "code_output": output, "fix_cycle_state": state }),
                )
            }
            other => AgentMessage::respond_to(
                &msg,
                "error_response",
                json!({ "error": format!("coder does not handle message type {other}") }),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Complexity, FixIssue, FixStep, IssueSeverity};
    use crate::error::LlmError;
    use crate::llm::provider::{CallResult, LlmInvoker};
    use std::time::Duration as StdDuration;

    struct ScriptedInvoker(String);

    #[async_trait]
    impl LlmInvoker for ScriptedInvoker {
        async fn send_prompt(&self, _p: &str, _o: &CallOptions) -> Result<CallResult, LlmError> {
            unreachable!()
        }
        async fn start_session(&self, _s: &str, _p: &str, _o: &CallOptions) -> Result<CallResult, LlmError> {
            Ok(CallResult {
                response: self.0.clone(),
                session_id: "s1".into(),
                cost_usd: None,
                duration: StdDuration::from_millis(1),
                tokens_in: None,
                tokens_out: None,
                tool_calls: None,
                structured_output: None,
            })
        }
        async fn continue_session(&self, _a: &str, _p: &str, _o: &CallOptions) -> Result<CallResult, LlmError> {
            Ok(CallResult {
                response: self.0.clone(),
                session_id: "s1".into(),
                cost_usd: None,
                duration: StdDuration::from_millis(1),
                tokens_in: None,
                tokens_out: None,
                tool_calls: None,
                structured_output: None,
            })
        }
    }

    fn coder_with_response(response: &str) -> Coder {
        let llm = Arc::new(LlmClient::new(Arc::new(ScriptedInvoker(response.to_string()))));
        Coder::new(llm)
    }

    fn sample_fix_plan() -> DetailedFixPlan {
        let mut plan = DetailedFixPlan::new(
            "tr-1",
            vec![FixIssue {
                severity: IssueSeverity::Major,
                category: "logic_error".to_string(),
                description: "off by one in loop bound".to_string(),
                location: Some("src/lib.rs:10".to_string()),
                suggested_fix: None,
                root_cause: None,
            }],
        );
        plan.fix_steps.push(FixStep {
            description: "correct the loop bound".to_string(),
            target_file: Some("src/lib.rs".to_string()),
        });
        plan
    }

    #[tokio::test]
    async fn implement_parses_successful_response() {
        let coder = coder_with_response(
            "### Summary\nAdded function a.\n\n### Files Created\n`src/lib.rs`\n```rust\nfn a() {}\n```\n",
        );
        let step = PlanStep::new(1, "Add function a", Complexity::Simple);
        let output = coder.implement(&step, "").await;
        assert!(!output.blocked);
        assert_eq!(output.files.len(), 1);
    }

    #[tokio::test]
    async fn implement_surfaces_blocked_sentinel() {
        let coder = coder_with_response("STEP BLOCKED: missing upstream dependency");
        let step = PlanStep::new(1, "Add function a", Complexity::Simple);
        let output = coder.implement(&step, "").await;
        assert!(output.blocked);
    }

    #[tokio::test]
    async fn apply_fix_raises_requires_sub_plan_after_max_attempts() {
        let coder = coder_with_response(
            "### Summary\nAttempted fix.\n\n### Files Modified\n`src/lib.rs`\n```rust\nfn a() {}\n```\n",
        );
        let step = PlanStep::new(1, "Add function a", Complexity::Simple);
        let fix_plan = sample_fix_plan();

        let first = coder.apply_fix(&step, &fix_plan).await;
        assert!(!first.requires_sub_plan);
        let second = coder.apply_fix(&step, &fix_plan).await;
        assert!(!second.requires_sub_plan);
        let third = coder.apply_fix(&step, &fix_plan).await;
        assert!(third.requires_sub_plan, "third attempt should exhaust the default 3-attempt cycle");

        assert_eq!(coder.fix_cycle_state(&step.id).await, FixCycleState::MaxAttemptsReached);
    }

    #[tokio::test]
    async fn request_tests_returns_existing_tests_without_a_call() {
        let coder = coder_with_response("unused");
        let step = PlanStep::new(1, "Add function a", Complexity::Simple);
        let mut output = CodeOutput::new("done");
        output.tests.push("tests/a_test.rs".to_string());
        output.test_coverage.has_tests = true;
        let tests = coder.request_tests_for_implementation(&step, &output).await;
        assert_eq!(tests, vec!["tests/a_test.rs".to_string()]);
    }
}
