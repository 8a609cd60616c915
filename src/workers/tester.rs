//! Tester worker (SYSTEM OVERVIEW component F, §4.5): an automated
//! subprocess phase, an LLM exploratory phase, and a deterministic merge.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::bus::{AgentMessage, Worker};
use crate::domain::{
    CodeOutput, DetailedFixPlan, FixIssue, FixStep, IssueCategory, IssueSeverity, PlanStep,
    PreviousFixAttempt, TestCoverageAnalysis, TestIssue, TestOutcome, TestResult,
};
use crate::llm::{CallOptions, LlmClient};
use crate::parsing::parse_exploratory_response;
use crate::workers::TESTER_AGENT;

const AUTOMATED_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_AUTOMATED_ISSUES: usize = 10;

struct TestRunner {
    probe_file: &'static str,
    command: &'static str,
    args: &'static [&'static str],
}

const RUNNERS: &[TestRunner] = &[
    TestRunner { probe_file: "Cargo.toml", command: "cargo", args: &["test", "--quiet"] },
    TestRunner { probe_file: "package.json", command: "npm", args: &["test", "--silent"] },
    TestRunner { probe_file: "pytest.ini", command: "pytest", args: &["-q"] },
    TestRunner { probe_file: "setup.py", command: "pytest", args: &["-q"] },
    TestRunner { probe_file: "go.mod", command: "go", args: &["test", "./..."] },
    TestRunner { probe_file: "Makefile", command: "make", args: &["test"] },
];

static JEST_FAILURE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*✕\s*(.+)$|FAIL\s+(.+)$").unwrap());
static PYTEST_FAILURE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^FAILED\s+(.+?)(?:\s+-\s+(.+))?$").unwrap());
static GO_FAILURE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^--- FAIL:\s*(.+)$").unwrap());
static EDGE_CASE_WORDS: &[&str] = &["null", "empty", "boundary", "negative", "overflow", "concurrent", "unicode"];

fn find_runner(working_dir: &Path) -> Option<&'static TestRunner> {
    RUNNERS.iter().find(|r| working_dir.join(r.probe_file).exists())
}

fn parse_automated_failures(output: &str) -> Vec<TestIssue> {
    let mut issues = Vec::new();

    for caps in JEST_FAILURE.captures_iter(output) {
        let description = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str().trim().to_string());
        if let Some(description) = description {
            issues.push(TestIssue {
                severity: IssueSeverity::Major,
                category: IssueCategory::TestFailure,
                description,
                location: None,
            });
        }
    }
    for caps in PYTEST_FAILURE.captures_iter(output) {
        issues.push(TestIssue {
            severity: IssueSeverity::Major,
            category: IssueCategory::TestFailure,
            description: caps[1].trim().to_string(),
            location: None,
        });
    }
    for caps in GO_FAILURE.captures_iter(output) {
        issues.push(TestIssue {
            severity: IssueSeverity::Major,
            category: IssueCategory::TestFailure,
            description: caps[1].trim().to_string(),
            location: None,
        });
    }

    issues.truncate(MAX_AUTOMATED_ISSUES);
    issues
}

/// Flags a missing-test issue, and a minor edge-case reminder when the test
/// names don't mention any of the common edge-case keywords.
fn scan_for_missing_edge_cases(code_output: &CodeOutput) -> Vec<TestIssue> {
    let mut issues = Vec::new();
    if !code_output.test_coverage.has_tests && !code_output.files.is_empty() {
        issues.push(TestIssue {
            severity: IssueSeverity::Major,
            category: IssueCategory::MissingTest,
            description: "no tests were provided for the implementation".to_string(),
            location: None,
        });
        return issues;
    }

    let combined_tests = code_output.tests.join(" ").to_lowercase();
    if code_output.test_coverage.has_tests && !EDGE_CASE_WORDS.iter().any(|w| combined_tests.contains(w)) {
        issues.push(TestIssue {
            severity: IssueSeverity::Minor,
            category: IssueCategory::EdgeCase,
            description: "test names do not suggest edge-case coverage (null, boundary, negative, ...)".to_string(),
            location: None,
        });
    }
    issues
}

struct Inner {
    fix_history: HashMap<String, Vec<PreviousFixAttempt>>,
}

pub struct Tester {
    llm: Arc<LlmClient>,
    inner: Mutex<Inner>,
}

impl Tester {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self {
            llm,
            inner: Mutex::new(Inner { fix_history: HashMap::new() }),
        }
    }

    fn system_context() -> &'static str {
        "You are the Tester in an autonomous multi-agent orchestration engine. \
         Explore the implementation for correctness and edge cases beyond what \
         automated tests cover. Respond with VERDICT: PASS or VERDICT: FAIL \
         followed by any issues as `[CRITICAL|MAJOR|MINOR] description` lines."
    }

    async fn run_automated(&self, working_dir: &Path) -> (TestOutcome, String, Vec<TestIssue>) {
        let Some(runner) = find_runner(working_dir) else {
            return (TestOutcome::Ran, "no recognized test runner found in working directory".to_string(), Vec::new());
        };

        let child = Command::new(runner.command)
            .args(runner.args)
            .current_dir(working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        match tokio::time::timeout(AUTOMATED_TIMEOUT, child).await {
            Ok(Ok(output)) => {
                let combined = format!(
                    "{}\n{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                );
                let issues = parse_automated_failures(&combined);
                (TestOutcome::Ran, combined, issues)
            }
            Ok(Err(e)) => (TestOutcome::Errored, format!("failed to launch test runner: {e}"), Vec::new()),
            Err(_) => (TestOutcome::TimedOut, "automated test run exceeded the wall clock".to_string(), Vec::new()),
        }
    }

    async fn run_exploratory(&self, step: &PlanStep, code_output: &CodeOutput) -> (bool, Vec<TestIssue>) {
        let files_text = code_output.files.iter().map(|f| f.path.as_str()).collect::<Vec<_>>().join(", ");
        let prompt = format!(
            "STEP {}: {}\nImplementation summary: {}\nFiles touched: {files_text}\n\
             Explore this implementation for edge cases and correctness issues.",
            step.number, step.description, code_output.summary
        );
        let opts = CallOptions {
            timeout: Some(Duration::from_secs(300)),
            ..Default::default()
        };

        let result = self
            .llm
            .start_session(TESTER_AGENT, Self::system_context(), &prompt, opts)
            .await;

        match result {
            Ok(call) => parse_exploratory_response(&call.response),
            Err(_) => (true, Vec::new()),
        }
    }

    /// §4.5 `runTests(step, codeOutput, workingDir)`.
    pub async fn run_tests(&self, step: &PlanStep, code_output: &CodeOutput, working_dir: &Path) -> TestResult {
        if code_output.blocked {
            return TestResult::errored(step.id.clone(), "implementation was blocked; nothing to test".to_string());
        }

        let (automated_outcome, raw_output, mut issues) = self.run_automated(working_dir).await;
        if automated_outcome == TestOutcome::TimedOut {
            return TestResult::timed_out(step.id.clone());
        }

        let (_exploratory_claim, exploratory_issues) = self.run_exploratory(step, code_output).await;
        issues.extend(exploratory_issues);
        issues.extend(scan_for_missing_edge_cases(code_output));
        issues.truncate(MAX_AUTOMATED_ISSUES);

        let passed = TestResult::compute_passed(&issues);
        let coverage = TestCoverageAnalysis::compute(
            &code_output.files.iter().map(|f| f.path.clone()).collect::<Vec<_>>(),
            &code_output.tests,
            issues.len(),
        );

        TestResult {
            step_id: step.id.clone(),
            passed,
            outcome: automated_outcome,
            issues,
            suggestions: Vec::new(),
            raw_output,
            coverage: Some(coverage),
        }
    }

    /// Builds a [`DetailedFixPlan`] from a failed [`TestResult`], folding in
    /// previously unsuccessful approaches (§4.5, `avoidApproaches`).
    pub async fn build_fix_plan(&self, test_result: &TestResult) -> DetailedFixPlan {
        let issues: Vec<FixIssue> = test_result
            .issues
            .iter()
            .map(|issue| FixIssue {
                severity: issue.severity,
                category: format!("{:?}", issue.category),
                description: issue.description.clone(),
                location: issue.location.clone(),
                suggested_fix: None,
                root_cause: None,
            })
            .collect();

        let fix_steps: Vec<FixStep> = test_result
            .issues
            .iter()
            .map(|issue| FixStep {
                description: format!("Resolve: {}", issue.description),
                target_file: issue.location.clone(),
            })
            .collect();

        let mut plan = DetailedFixPlan::new(test_result.step_id.clone(), issues);
        plan.fix_steps = fix_steps;

        let history = self
            .inner
            .lock()
            .await
            .fix_history
            .get(&test_result.step_id)
            .cloned()
            .unwrap_or_default();
        plan.with_learning(history)
    }

    pub async fn record_fix_attempt(&self, step_id: impl Into<String>, approach: impl Into<String>, succeeded: bool) {
        let step_id = step_id.into();
        let mut inner = self.inner.lock().await;
        inner
            .fix_history
            .entry(step_id)
            .or_default()
            .push(PreviousFixAttempt { approach: approach.into(), succeeded });
    }
}

#[async_trait]
impl Worker for Tester {
    async fn handle_message(&self, msg: AgentMessage) -> AgentMessage {
        match msg.message_type.as_str() {
            "test_request" => {
                let step: PlanStep = match serde_json::from_value(msg.payload["step"].clone()) {
                    Ok(step) => step,
                    Err(e) => return AgentMessage::respond_to(&msg, "error_response", json!({ "error": e.to_string() })),
                };
                let code_output: CodeOutput = match serde_json::from_value(msg.payload["code_output"].clone()) {
                    Ok(output) => output,
                    Err(e) => return AgentMessage::respond_to(&msg, "error_response", json!({ "error": e.to_string() })),
                };
                let working_dir = msg.payload["working_dir"].as_str().unwrap_or(".").to_string();
                let result = self.run_tests(&step, &code_output, Path::new(&working_dir)).await;
                let fix_plan = if result.passed { None } else { Some(self.build_fix_plan(&result).await) };
                AgentMessage::respond_to(
                    &msg,
                    "test_response",
                    json!({ "test_result": result, "fix_plan": fix_plan }),
                )
            }
            other => AgentMessage::respond_to(
                &msg,
                "error_response",
                json!({ "error": format!("tester does not handle message type {other}") }),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Complexity, FileAction, FileChange};
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
            unreachable!()
        }
    }

    fn tester_with_response(response: &str) -> Tester {
        let llm = Arc::new(LlmClient::new(Arc::new(ScriptedInvoker(response.to_string()))));
        Tester::new(llm)
    }

    fn sample_code_output(with_tests: bool) -> CodeOutput {
        let mut out = CodeOutput::new("implemented the thing");
        out.push_file(FileChange {
            path: "src/thing.rs".to_string(),
            action: FileAction::Created,
            content: "pub fn thing() {}".to_string(),
            language: Some("rust".to_string()),
        });
        if with_tests {
            out.tests.push("tests/thing_test.rs".to_string());
            out.test_coverage.has_tests = true;
            out.test_coverage.test_count = 1;
        }
        out
    }

    #[tokio::test]
    async fn blocked_implementation_errors_without_running() {
        let tester = tester_with_response("VERDICT: PASS");
        let step = PlanStep::new(1, "Add thing", Complexity::Simple);
        let blocked = CodeOutput::blocked("missing dependency");
        let result = tester.run_tests(&step, &blocked, Path::new(".")).await;
        assert_eq!(result.outcome, TestOutcome::Errored);
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn no_tests_is_flagged_as_a_missing_test_issue() {
        let tester = tester_with_response("VERDICT: PASS\nNo further issues.");
        let step = PlanStep::new(1, "Add thing", Complexity::Simple);
        let output = sample_code_output(false);
        let result = tester.run_tests(&step, &output, Path::new("/nonexistent-dir-for-test")).await;
        assert!(result.issues.iter().any(|i| i.category == IssueCategory::MissingTest));
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn clean_run_with_tests_passes() {
        let tester = tester_with_response("VERDICT: PASS\nLooks solid.");
        let step = PlanStep::new(1, "Add thing", Complexity::Simple);
        let output = sample_code_output(true);
        let result = tester.run_tests(&step, &output, Path::new("/nonexistent-dir-for-test")).await;
        assert!(result.passed);
    }

    #[tokio::test]
    async fn build_fix_plan_carries_previous_failed_approaches() {
        let tester = tester_with_response("VERDICT: FAIL\n[CRITICAL] race condition in counter increment");
        tester.record_fix_attempt("step-1", "added a mutex", false).await;
        let mut result = TestResult::errored("step-1", "raw");
        result.issues.push(TestIssue {
            severity: IssueSeverity::Critical,
            category: IssueCategory::LogicError,
            description: "race condition in counter increment".to_string(),
            location: None,
        });
        let fix_plan = tester.build_fix_plan(&result).await;
        assert_eq!(fix_plan.avoid_approaches, vec!["added a mutex".to_string()]);
    }
}
