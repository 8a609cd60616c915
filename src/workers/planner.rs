//! Planner worker (SYSTEM OVERVIEW component D, §4.3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use crate::bus::{AgentMessage, Worker};
use crate::domain::{Complexity, ExecutionPlan, PlanStep};
use crate::error::DomainError;
use crate::llm::{CallOptions, LlmClient};
use crate::parsing::parse_plan_response;
use crate::ring::RingBuffer;
use crate::workers::PLANNER_AGENT;

const MAX_SUBPLAN_ATTEMPTS: u32 = 3;

fn step_cap_for_depth(depth: u8) -> usize {
    match depth {
        1 => 5,
        2 => 3,
        _ => 2,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub blocked_reasons: Vec<String>,
    pub successful_approaches: RingBuffer<String>,
}

impl ExecutionContext {
    fn new() -> Self {
        Self {
            successful_approaches: RingBuffer::new(20),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DependencyTracker {
    pub deps: HashMap<String, Vec<String>>,
    pub reverse_deps: HashMap<String, Vec<String>>,
}

impl DependencyTracker {
    fn record(&mut self, deps: &HashMap<String, Vec<String>>) {
        for (step_id, depends_on) in deps {
            self.deps.insert(step_id.clone(), depends_on.clone());
            for dep in depends_on {
                self.reverse_deps.entry(dep.clone()).or_default().push(step_id.clone());
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanQualityIssue {
    pub severity: IssueWeight,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueWeight {
    Critical,
    Major,
    Minor,
}

impl IssueWeight {
    fn penalty(self) -> i32 {
        match self {
            IssueWeight::Critical => 30,
            IssueWeight::Major => 15,
            IssueWeight::Minor => 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanQualityAssessment {
    pub score: u8,
    pub approved: bool,
    pub issues: Vec<PlanQualityIssue>,
}

const ACTION_VERBS: &[&str] = &[
    "implement", "create", "add", "build", "write", "set", "configure", "test", "refactor", "update",
    "remove", "fix", "design", "deploy", "integrate", "validate", "migrate", "extract", "define",
    "wire", "register", "handle", "parse", "expose", "generate",
];

fn starts_with_action_verb(description: &str) -> bool {
    description
        .split_whitespace()
        .next()
        .map(|w| ACTION_VERBS.contains(&w.to_lowercase().as_str()))
        .unwrap_or(false)
}

struct Inner {
    sub_plan_attempts: HashMap<String, u32>,
    execution_context: ExecutionContext,
    dependency_tracker: DependencyTracker,
}

pub struct Planner {
    llm: Arc<LlmClient>,
    inner: Mutex<Inner>,
}

impl Planner {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self {
            llm,
            inner: Mutex::new(Inner {
                sub_plan_attempts: HashMap::new(),
                execution_context: ExecutionContext::new(),
                dependency_tracker: DependencyTracker::default(),
            }),
        }
    }

    fn system_context() -> &'static str {
        "You are the Planner in an autonomous multi-agent orchestration engine. \
         Produce a numbered, ordered implementation plan. Respond with sections \
         ANALYSIS:, PLAN:, DEPENDENCIES:, RISKS:, TOTAL_STEPS:. Each plan line must \
         read `N. description | complexity` with complexity one of simple, medium, complex."
    }

    /// §4.3 `plan(goal, context)` → `ExecutionPlan` at depth 0.
    pub async fn plan(&self, goal: &str, context: &str) -> ExecutionPlan {
        if goal.trim().is_empty() {
            return ExecutionPlan::fallback(goal);
        }

        let prompt = format!("GOAL: {goal}\nCONTEXT: {context}\n\nProduce the plan now.");
        let opts = CallOptions {
            timeout: Some(Duration::from_secs(600)),
            ..Default::default()
        };

        let response = self
            .llm
            .start_session(PLANNER_AGENT, Self::system_context(), &prompt, opts)
            .await;

        let plan = match response {
            Ok(result) => parse_plan_response(goal, &result.response).unwrap_or_else(|_| ExecutionPlan::fallback(goal)),
            Err(_) => ExecutionPlan::fallback(goal),
        };

        let mut inner = self.inner.lock().await;
        inner.dependency_tracker.record(&plan.dependencies);
        plan
    }

    /// §4.3 `subPlan(blockedStep, reason, newDepth)`.
    pub async fn sub_plan(
        &self,
        blocked_step: &PlanStep,
        reason: &str,
        new_depth: u8,
    ) -> Result<ExecutionPlan, DomainError> {
        if new_depth > 3 {
            return Err(DomainError::MaxDepthReached);
        }

        {
            let mut inner = self.inner.lock().await;
            let attempts = inner.sub_plan_attempts.entry(blocked_step.id.clone()).or_insert(0);
            if *attempts >= MAX_SUBPLAN_ATTEMPTS {
                return Err(DomainError::MaxSubplanAttempts(blocked_step.id.clone()));
            }
            *attempts += 1;
        }

        let cap = step_cap_for_depth(new_depth);
        let adaptive_notes = self.adaptive_notes().await;

        let prompt = format!(
            "The step \"{}\" is blocked: {reason}\n\
             Produce a sub-plan of at most {cap} steps to work around this blocker.\n\
             {adaptive_notes}\n\
             Respond in the same ANALYSIS:/PLAN:/DEPENDENCIES:/RISKS:/TOTAL_STEPS: format.",
            blocked_step.description
        );

        let opts = CallOptions {
            timeout: Some(Duration::from_secs(600)),
            ..Default::default()
        };

        let continued = self.llm.continue_session(PLANNER_AGENT, &prompt, opts.clone()).await;
        let response = match continued {
            Ok(result) => Ok(result),
            Err(_) => self.llm.start_session(PLANNER_AGENT, Self::system_context(), &prompt, opts).await,
        };

        let mut plan = match response {
            Ok(result) => parse_plan_response(&blocked_step.description, &result.response)
                .unwrap_or_else(|_| ExecutionPlan::fallback(&blocked_step.description)),
            Err(_) => ExecutionPlan::fallback(&blocked_step.description),
        };

        if plan.steps.len() > cap {
            plan.steps.truncate(cap);
        }
        plan.depth = new_depth;
        plan.parent_plan_id = Some(blocked_step.id.clone());
        for step in &mut plan.steps {
            step.depth = new_depth;
            step.parent_step_id = Some(blocked_step.id.clone());
        }

        Ok(plan)
    }

    async fn adaptive_notes(&self) -> String {
        let inner = self.inner.lock().await;
        if inner.execution_context.failed_steps.is_empty() && inner.execution_context.successful_approaches.is_empty() {
            return String::new();
        }
        let failed: Vec<&str> = inner.execution_context.failed_steps.iter().map(String::as_str).collect();
        let successful: Vec<&&String> = inner.execution_context.successful_approaches.iter().collect();
        format!(
            "Previously failed approaches: {:?}. Known-successful patterns: {:?}. Use a different approach.",
            failed, successful
        )
    }

    /// §4.3 `assessPlanQuality(plan)`.
    pub fn assess_plan_quality(plan: &ExecutionPlan) -> PlanQualityAssessment {
        let mut issues = Vec::new();

        if plan.steps.len() < 2 {
            issues.push(PlanQualityIssue {
                severity: IssueWeight::Major,
                message: "plan has fewer than 2 steps".to_string(),
            });
        }
        if plan.steps.len() > 15 {
            issues.push(PlanQualityIssue {
                severity: IssueWeight::Minor,
                message: "plan has more than 15 steps".to_string(),
            });
        }
        let complex_count = plan.steps.iter().filter(|s| s.complexity == Complexity::Complex).count();
        if !plan.steps.is_empty() && complex_count * 2 > plan.steps.len() {
            issues.push(PlanQualityIssue {
                severity: IssueWeight::Major,
                message: "more than half of the steps are complex".to_string(),
            });
        }
        for step in &plan.steps {
            if step.description.trim().len() < 15 {
                issues.push(PlanQualityIssue {
                    severity: IssueWeight::Minor,
                    message: format!("step {} description is too brief", step.number),
                });
            }
            if !starts_with_action_verb(&step.description) {
                issues.push(PlanQualityIssue {
                    severity: IssueWeight::Minor,
                    message: format!("step {} does not start with an action verb", step.number),
                });
            }
        }
        if plan.analysis.trim().is_empty() || plan.analysis.trim().len() < 20 {
            issues.push(PlanQualityIssue {
                severity: IssueWeight::Minor,
                message: "analysis is missing or too brief".to_string(),
            });
        }

        let mut score: i32 = 100;
        for issue in &issues {
            score -= issue.severity.penalty();
        }
        let score = score.clamp(0, 100) as u8;

        PlanQualityAssessment {
            score,
            approved: score >= 70,
            issues,
        }
    }

    pub async fn record_step_completed(&self, step_id: impl Into<String>) {
        self.inner.lock().await.execution_context.completed_steps.push(step_id.into());
    }

    pub async fn record_step_failed(&self, step_id: impl Into<String>, reason: impl Into<String>) {
        let mut inner = self.inner.lock().await;
        inner.execution_context.failed_steps.push(step_id.into());
        inner.execution_context.blocked_reasons.push(reason.into());
    }

    pub async fn record_successful_approach(&self, approach: impl Into<String>) {
        self.inner
            .lock()
            .await
            .execution_context
            .successful_approaches
            .push(approach.into());
    }

    /// `resetExecutionContext` (§4.3).
    pub async fn reset_execution_context(&self) {
        let mut inner = self.inner.lock().await;
        inner.execution_context = ExecutionContext::new();
    }
}

#[async_trait]
impl Worker for Planner {
    async fn handle_message(&self, msg: AgentMessage) -> AgentMessage {
        match msg.message_type.as_str() {
            "plan_request" => {
                let goal = msg.payload["goal"].as_str().unwrap_or_default().to_string();
                let context = msg.payload["context"].as_str().unwrap_or_default().to_string();
                let plan = self.plan(&goal, &context).await;
                AgentMessage::respond_to(&msg, "plan_response", json!({ "plan": plan }))
            }
            "replan_request" => {
                let reason = msg.payload["reason"].as_str().unwrap_or_default().to_string();
                let new_depth = msg.payload["new_depth"].as_u64().unwrap_or(1) as u8;
                let step: PlanStep = match serde_json::from_value(msg.payload["blocked_step"].clone()) {
                    Ok(step) => step,
                    Err(e) => {
                        return AgentMessage::respond_to(
                            &msg,
                            "replan_response",
                            json!({ "success": false, "error": e.to_string() }),
                        );
                    }
                };
                match self.sub_plan(&step, &reason, new_depth).await {
                    Ok(plan) => AgentMessage::respond_to(&msg, "replan_response", json!({ "success": true, "plan": plan })),
                    Err(e) => AgentMessage::respond_to(
                        &msg,
                        "replan_response",
                        json!({ "success": false, "error": e.to_string() }),
                    ),
                }
            }
            other => AgentMessage::respond_to(
                &msg,
                "error_response",
                json!({ "error": format!("planner does not handle message type {other}") }),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::{CallResult, LlmInvoker};
    use crate::error::LlmError;
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

    fn planner_with_response(response: &str) -> Planner {
        let llm = Arc::new(LlmClient::new(Arc::new(ScriptedInvoker(response.to_string()))));
        Planner::new(llm)
    }

    #[tokio::test]
    async fn empty_goal_returns_fallback() {
        let planner = planner_with_response("PLAN:\n1. do something | simple\n");
        let plan = planner.plan("", "").await;
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].complexity, Complexity::Complex);
    }

    #[tokio::test]
    async fn parses_llm_plan_for_nonempty_goal() {
        let planner = planner_with_response(
            "ANALYSIS:\nNeeds four steps to reach a complete application with tests.\nPLAN:\n1. Set up scaffold | simple\n2. Implement model | medium\n3. Implement API | medium\n4. Add tests | simple\n",
        );
        let plan = planner.plan("Build a todo application", "").await;
        assert_eq!(plan.steps.len(), 4);
        assert_eq!(plan.depth, 0);
    }

    #[test]
    fn quality_assessment_rewards_well_formed_plans() {
        let plan = ExecutionPlan::new(
            "goal",
            "This plan sets up the scaffold, implements the model, wires the API, and adds tests.",
            vec![
                PlanStep::new(1, "Implement the storage layer for todos", Complexity::Medium),
                PlanStep::new(2, "Add integration tests for the API", Complexity::Simple),
            ],
        );
        let assessment = Planner::assess_plan_quality(&plan);
        assert!(assessment.approved, "score was {}", assessment.score);
    }

    #[test]
    fn quality_assessment_penalizes_sparse_plans() {
        let plan = ExecutionPlan::new("goal", "", vec![PlanStep::new(1, "x", Complexity::Complex)]);
        let assessment = Planner::assess_plan_quality(&plan);
        assert!(!assessment.approved);
    }

    #[tokio::test]
    async fn subplan_fails_past_max_depth() {
        let planner = planner_with_response("PLAN:\n1. retry | simple\n");
        let step = PlanStep::new(1, "blocked step", Complexity::Medium);
        let result = planner.sub_plan(&step, "missing dependency", 4).await;
        assert!(matches!(result, Err(DomainError::MaxDepthReached)));
    }

    #[tokio::test]
    async fn subplan_caps_attempts_at_three() {
        let planner = planner_with_response("PLAN:\n1. retry | simple\n");
        let step = PlanStep::new(1, "blocked step", Complexity::Medium);
        for _ in 0..3 {
            assert!(planner.sub_plan(&step, "reason", 1).await.is_ok());
        }
        let result = planner.sub_plan(&step, "reason", 1).await;
        assert!(matches!(result, Err(DomainError::MaxSubplanAttempts(_))));
    }

    #[tokio::test]
    async fn subplan_respects_step_cap_per_depth() {
        let mut many_steps = String::from("PLAN:\n");
        for i in 1..=8 {
            many_steps.push_str(&format!("{i}. step {i} | simple\n"));
        }
        let planner = planner_with_response(&many_steps);
        let step = PlanStep::new(1, "blocked step", Complexity::Medium);
        let plan = planner.sub_plan(&step, "reason", 2).await.unwrap();
        assert!(plan.steps.len() <= 3);
    }
}
