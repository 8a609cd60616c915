//! The orchestrator (SYSTEM OVERVIEW component H, §4.7): drives the Planner,
//! Coder, Tester, and Supervisor through the bus to take a goal from nothing
//! to a verified result, with recursive re-planning and a time budget.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bus::{AgentMessage, HistoryFilter, MessageBus, Worker};
use crate::config::CliConfig;
use crate::domain::{
    CodeOutput, DetailedFixPlan, EventKind, ExecutionPlan, GateDecision, Metrics, OrchestrationState,
    OrchestrationStatus, OrchestratorEvent, PlanStatus, QualityGate, Role, AgentStatus, StepStatus, TestResult,
    TimeBudget, VerificationResult, VerificationType, WorkflowLoop, WorkflowPhase,
};
use crate::error::{BusError, DomainError};
use crate::llm::{LlmClient, LlmInvoker};
use crate::orchestrator::report::{
    MessageBusStats, OrchestrationReport, PlanProgress, TimeBudgetSummary, WorkflowSummary,
};
use crate::workers::{Coder, Planner, Supervisor, Tester, CODER_AGENT, ORCHESTRATOR_AGENT, PLANNER_AGENT, SUPERVISOR_AGENT, TESTER_AGENT};

/// §6 recommendation mapping for `PROGRESS` verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgressAction {
    Abort,
    Refocus,
    Correct,
    Continue,
}

/// Case-insensitive keyword match on the Supervisor's free-text
/// `recommendation` field (§6: `ABORT -> abort, INTERVENTION -> refocus,
/// GUIDANCE -> correct, NONE -> continue`). `recommendation` is never
/// structured (`parse_verification_response` always leaves `extra` null),
/// so this mirrors the taxonomy in [`crate::error::categorize_error`].
fn map_progress_recommendation(recommendation: &str) -> ProgressAction {
    let lower = recommendation.to_lowercase();
    if lower.contains("abort") {
        ProgressAction::Abort
    } else if lower.contains("intervention") || lower.contains("refocus") {
        ProgressAction::Refocus
    } else if lower.contains("guidance") || lower.contains("correct") {
        ProgressAction::Correct
    } else {
        ProgressAction::Continue
    }
}

enum StepOutcome {
    Continue(ExecutionPlan),
    SubPlanPushed,
}

struct Inner {
    state: OrchestrationState,
    workflow: WorkflowLoop,
    time_budget: TimeBudget,
    context: String,
    plan_revision_count: u32,
    last_progress_check_ms: i64,
}

/// Owns the bus and the four workers and drives one run end to end.
pub struct Orchestrator {
    bus: Arc<MessageBus>,
    planner: Arc<Planner>,
    coder: Arc<Coder>,
    tester: Arc<Tester>,
    supervisor: Arc<Supervisor>,
    llm: Arc<LlmClient>,
    config: CliConfig,
    inner: Mutex<Option<Inner>>,
}

impl Orchestrator {
    pub fn new(config: CliConfig, invoker: Arc<dyn LlmInvoker>) -> Self {
        let llm = Arc::new(LlmClient::new(invoker));
        let coder = Arc::new(Coder::with_max_fix_attempts(llm.clone(), config.max_fix_cycles));
        Self {
            bus: Arc::new(MessageBus::new()),
            planner: Arc::new(Planner::new(llm.clone())),
            coder,
            tester: Arc::new(Tester::new(llm.clone())),
            supervisor: Arc::new(Supervisor::new(llm.clone())),
            llm,
            config,
            inner: Mutex::new(None),
        }
    }

    fn role_for_agent(agent: &str) -> Option<Role> {
        match agent {
            PLANNER_AGENT => Some(Role::Planner),
            CODER_AGENT => Some(Role::Coder),
            TESTER_AGENT => Some(Role::Tester),
            SUPERVISOR_AGENT => Some(Role::Supervisor),
            _ => None,
        }
    }

    async fn register_workers(&self) {
        self.bus.register(PLANNER_AGENT, self.planner.clone() as Arc<dyn Worker>).await;
        self.bus.register(CODER_AGENT, self.coder.clone() as Arc<dyn Worker>).await;
        self.bus.register(TESTER_AGENT, self.tester.clone() as Arc<dyn Worker>).await;
        self.bus.register(SUPERVISOR_AGENT, self.supervisor.clone() as Arc<dyn Worker>).await;
    }

    /// §4.7 `initialize(goal, context)`.
    pub async fn initialize(&self, goal: impl Into<String>, context: impl Into<String>) {
        self.bus.reset().await;
        self.register_workers().await;
        self.planner.reset_execution_context().await;

        let goal = goal.into();
        let mut state = OrchestrationState::new(goal.clone());
        state.record(OrchestratorEvent::new(EventKind::Initialized, json!({ "goal": goal })));

        *self.inner.lock().await = Some(Inner {
            state,
            workflow: WorkflowLoop::default(),
            time_budget: TimeBudget::new(self.config.time_limit.as_millis() as i64),
            context: context.into(),
            plan_revision_count: 0,
            last_progress_check_ms: 0,
        });
    }

    /// Observer registration for the event stream (§6), implemented purely
    /// in terms of the bus's own `subscribe` (§4.1) rather than a second
    /// mechanism.
    pub async fn subscribe_events(&self, handler: Arc<dyn Fn(&AgentMessage) -> Result<(), String> + Send + Sync>) -> u64 {
        self.bus.subscribe("*", handler).await
    }

    pub async fn unsubscribe_events(&self, id: u64) {
        self.bus.unsubscribe(id).await;
    }

    /// §4.7 `stop()`: a cooperative flag checked between steps and phases.
    pub async fn stop(&self) {
        if let Some(inner) = self.inner.lock().await.as_mut() {
            inner.state.should_stop = true;
            inner.state.record(OrchestratorEvent::simple(EventKind::Stopping));
        }
        info!("orchestrator stop requested");
    }

    /// §4.7 `run()`: Planning, Execution, Verification, in order.
    pub async fn run(&self) -> Result<OrchestrationReport, DomainError> {
        if self.inner.lock().await.is_none() {
            return Err(DomainError::NotInitialized);
        }

        if let Some(inner) = self.inner.lock().await.as_mut() {
            inner.state.record(OrchestratorEvent::simple(EventKind::Started));
        }

        self.run_planning_phase().await?;
        self.run_execution_phase().await?;
        self.run_verification_phase().await?;
        self.generate_report().await
    }

    // ---- phase 1: planning -------------------------------------------

    async fn run_planning_phase(&self) -> Result<(), DomainError> {
        self.workflow_transition(WorkflowPhase::Planning).await;
        self.record_event(EventKind::PhaseStarted, json!({ "phase": "planning" })).await;

        let (goal, mut context) = {
            let guard = self.inner.lock().await;
            let inner = guard.as_ref().ok_or(DomainError::NotInitialized)?;
            (inner.state.primary_goal.clone(), inner.context.clone())
        };

        let mut plan = self.request_plan(&goal, &context).await;
        self.record_event(EventKind::PlanCreated, json!({ "plan_id": plan.id, "steps": plan.steps.len() })).await;

        if self.config.require_pre_plan_review {
            loop {
                let result = self
                    .call(
                        SUPERVISOR_AGENT,
                        "verify_request",
                        json!({ "verification_type": VerificationType::PlanPre, "target_id": plan.id, "context": plan.analysis }),
                        Duration::from_secs(180),
                    )
                    .await
                    .ok()
                    .and_then(|r| serde_json::from_value::<VerificationResult>(r.payload["result"].clone()).ok());

                let approved = result.as_ref().map(|r| r.verified).unwrap_or(true);
                self.bump_metrics(|m| {
                    if approved {
                        m.verifications_passed += 1;
                    } else {
                        m.verifications_failed += 1;
                    }
                })
                .await;
                self.record_event(EventKind::PlanReviewed, json!({ "plan_id": plan.id, "approved": approved })).await;

                if approved {
                    self.record_event(EventKind::PlanApproved, json!({ "plan_id": plan.id })).await;
                    break;
                }

                let revision_count = {
                    let mut guard = self.inner.lock().await;
                    let inner = guard.as_mut().ok_or(DomainError::NotInitialized)?;
                    inner.plan_revision_count += 1;
                    inner.plan_revision_count
                };

                if revision_count > self.config.max_plan_revisions {
                    warn!(plan_id = %plan.id, "max plan revisions exhausted, proceeding with last plan");
                    self.record_event(
                        EventKind::Warning,
                        json!({ "reason": "max plan revisions exhausted, proceeding with last plan" }),
                    )
                    .await;
                    break;
                }

                self.record_event(EventKind::PlanNeedsRevision, json!({ "plan_id": plan.id })).await;
                let reason = result.map(|r| r.reason).unwrap_or_default();
                context = format!("{context}\nPrevious plan was rejected: {reason}");
                let revised = self.request_plan(&goal, &context).await;
                plan = revised;
                self.record_event(EventKind::PlanRevised, json!({ "plan_id": plan.id })).await;
            }
        }

        {
            let mut guard = self.inner.lock().await;
            let inner = guard.as_mut().ok_or(DomainError::NotInitialized)?;
            inner.state.metrics.total_steps = plan.steps.len() as u32;
            inner.state.current_plan = Some(plan);
        }
        self.record_event(EventKind::PhaseCompleted, json!({ "phase": "planning" })).await;
        Ok(())
    }

    async fn request_plan(&self, goal: &str, context: &str) -> ExecutionPlan {
        match self
            .call(PLANNER_AGENT, "plan_request", json!({ "goal": goal, "context": context }), Duration::from_secs(650))
            .await
        {
            Ok(resp) => serde_json::from_value(resp.payload["plan"].clone()).unwrap_or_else(|_| ExecutionPlan::fallback(goal)),
            Err(_) => ExecutionPlan::fallback(goal),
        }
    }

    // ---- phase 2: execution --------------------------------------------

    async fn run_execution_phase(&self) -> Result<(), DomainError> {
        self.workflow_transition(WorkflowPhase::Executing).await;
        self.record_event(EventKind::PhaseStarted, json!({ "phase": "execution" })).await;

        loop {
            if !self.should_continue().await {
                break;
            }
            self.bump_iteration().await;

            let Some(plan) = self.take_plan().await else { break };
            let outcome = self.process_step(plan).await;
            match outcome {
                StepOutcome::Continue(plan) => self.put_plan(plan).await,
                StepOutcome::SubPlanPushed => {}
            }
            self.finalize_if_subplan_complete().await;

            tokio::time::sleep(Duration::from_millis(250)).await;
            self.maybe_run_progress_check().await?;
        }

        let mut guard = self.inner.lock().await;
        let inner = guard.as_mut().ok_or(DomainError::NotInitialized)?;
        if inner.time_budget.is_expired() {
            inner.state.record(OrchestratorEvent::simple(EventKind::TimeExpired));
            inner.state.finish(OrchestrationStatus::TimeExpired);
            inner.workflow.transition(WorkflowPhase::TimeExpired);
        } else if inner.state.should_stop && inner.state.status == OrchestrationStatus::Running {
            inner.state.finish(OrchestrationStatus::Aborted);
            inner.workflow.transition(WorkflowPhase::Aborted);
        }
        self.record_event(EventKind::PhaseCompleted, json!({ "phase": "execution" })).await;
        Ok(())
    }

    /// Runs the 9-step per-step algorithm (§4.7) for the plan's current step
    /// and returns the updated plan, or signals that a sub-plan replaced it.
    async fn process_step(&self, mut plan: ExecutionPlan) -> StepOutcome {
        let step_index = plan.current_step_index;
        let working_dir = self.config.working_dir.to_string_lossy().to_string();
        let context = plan.analysis.clone();

        {
            let step = &mut plan.steps[step_index];
            step.mark_in_progress();
        }
        let step = plan.steps[step_index].clone();
        self.record_event(
            EventKind::StepStarted,
            json!({ "step_id": step.id, "number": step.number, "description": step.description }),
        )
        .await;

        let mut code_output = match self
            .call(CODER_AGENT, "code_request", json!({ "step": step, "context": context }), Duration::from_secs(650))
            .await
        {
            Ok(resp) => serde_json::from_value::<CodeOutput>(resp.payload["code_output"].clone())
                .unwrap_or_else(|_| CodeOutput::blocked("malformed code_response")),
            Err(e) => CodeOutput::blocked(format!("coder request failed: {e}")),
        };

        if code_output.blocked {
            let reason = code_output.block_reason.clone().unwrap_or_else(|| "implementation blocked".to_string());
            plan.steps[step_index].mark_blocked(reason);
            return self.handle_blocked_step(plan, step_index).await;
        }

        if self.config.require_tests && !code_output.test_coverage.has_tests {
            self.record_event(EventKind::TestsMissing, json!({ "step_id": step.id })).await;
            let mut fix_plan = DetailedFixPlan::new(
                step.id.clone(),
                vec![crate::domain::FixIssue {
                    severity: crate::domain::IssueSeverity::Major,
                    category: "missing_test".to_string(),
                    description: "tests are required but were not provided".to_string(),
                    location: None,
                    suggested_fix: None,
                    root_cause: None,
                }],
            );
            fix_plan.fix_steps.push(crate::domain::FixStep {
                description: "add tests covering the implementation".to_string(),
                target_file: None,
            });
            if let Ok(resp) = self
                .call(CODER_AGENT, "fix_request", json!({ "step": step, "fix_plan": fix_plan }), Duration::from_secs(320))
                .await
                && let Ok(fixed) = serde_json::from_value::<CodeOutput>(resp.payload["code_output"].clone())
            {
                code_output = fixed;
            }
        }

        if self.config.verify_all_outputs
            && let Some(gate) = self.verify_gate(VerificationType::Code, &step.id, &code_output.summary).await
            && gate.decision == GateDecision::Rejected
        {
            plan.steps[step_index].mark_blocked(format!("code quality gate rejected for step {}", step.number));
            return self.handle_blocked_step(plan, step_index).await;
        }

        let mut test_result = self.request_tests(&step, &code_output, &working_dir).await.0;
        let mut fix_cycles = 0u32;

        while !test_result.passed && fix_cycles < self.config.max_fix_cycles {
            self.record_event(EventKind::FixCycleStarted, json!({ "step_id": step.id, "attempt": fix_cycles + 1 })).await;

            let (test_result_before, fix_plan) = (test_result.clone(), self.tester.build_fix_plan(&test_result).await);
            let summary_before = code_output.summary.clone();

            let fixed = match self
                .call(CODER_AGENT, "fix_request", json!({ "step": step, "fix_plan": fix_plan }), Duration::from_secs(320))
                .await
            {
                Ok(resp) => serde_json::from_value::<CodeOutput>(resp.payload["code_output"].clone())
                    .unwrap_or_else(|_| CodeOutput::blocked("malformed fix_response")),
                Err(e) => CodeOutput::blocked(format!("fix request failed: {e}")),
            };

            fix_cycles += 1;
            self.bump_metrics(|m| m.fix_cycles += 1).await;

            if fixed.requires_sub_plan {
                self.tester.record_fix_attempt(step.id.clone(), summary_before, false).await;
                self.record_event(
                    EventKind::FixCycleCompleted,
                    json!({ "step_id": step.id, "passed": false, "requires_sub_plan": true }),
                )
                .await;
                let reason = fixed.sub_plan_reason.clone().unwrap_or_else(|| "fix cycle exhausted".to_string());
                plan.steps[step_index].mark_blocked(reason);
                plan.steps[step_index].code_output = Some(fixed);
                plan.steps[step_index].test_results = Some(test_result_before);
                return self.handle_blocked_step(plan, step_index).await;
            }

            code_output = fixed;
            let (next_result, _) = self.request_tests(&step, &code_output, &working_dir).await;
            test_result = next_result;
            self.tester.record_fix_attempt(step.id.clone(), code_output.summary.clone(), test_result.passed).await;
            self.record_event(EventKind::FixCycleCompleted, json!({ "step_id": step.id, "passed": test_result.passed })).await;
        }

        if test_result.passed {
            if self.config.verify_all_outputs {
                let context = format!("step {} completed: {}", step.number, code_output.summary);
                if let Some(result) = self.verify_step(VerificationType::Step, &step.id, &context).await
                    && !result.verified
                {
                    self.record_event(
                        EventKind::Warning,
                        json!({ "step_id": step.id, "reason": "step verification failed", "detail": result.reason }),
                    )
                    .await;
                }
            }
            plan.steps[step_index].code_output = Some(code_output.clone());
            plan.steps[step_index].test_results = Some(test_result);
            plan.advance();
            self.bump_metrics(|m| m.completed_steps += 1).await;
            self.planner.record_step_completed(step.id.clone()).await;
            self.planner.record_successful_approach(code_output.summary).await;
            self.record_event(EventKind::StepCompleted, json!({ "step_id": step.id })).await;
        } else {
            let reason = test_result.raw_output.clone();
            plan.steps[step_index].code_output = Some(code_output);
            plan.steps[step_index].test_results = Some(test_result);
            plan.steps[step_index].mark_failed(reason.clone());
            plan.current_step_index += 1;
            if plan.is_complete() {
                plan.status = PlanStatus::Complete;
            }
            self.bump_metrics(|m| m.failed_steps += 1).await;
            self.planner.record_step_failed(step.id.clone(), reason).await;
            self.record_event(EventKind::StepFailed, json!({ "step_id": step.id })).await;
        }

        StepOutcome::Continue(plan)
    }

    async fn request_tests(&self, step: &crate::domain::PlanStep, code_output: &CodeOutput, working_dir: &str) -> (TestResult, ()) {
        let result = self
            .call(
                TESTER_AGENT,
                "test_request",
                json!({ "step": step, "code_output": code_output, "working_dir": working_dir }),
                Duration::from_secs(320),
            )
            .await;
        match result {
            Ok(resp) => {
                let test_result = serde_json::from_value(resp.payload["test_result"].clone())
                    .unwrap_or_else(|_| TestResult::errored(step.id.clone(), "malformed test_response"));
                (test_result, ())
            }
            Err(e) => (TestResult::errored(step.id.clone(), format!("tester request failed: {e}")), ()),
        }
    }

    /// Issues a single `verify_request` and returns both the verdict and the
    /// quality gate the Supervisor derived from it, bumping the metrics
    /// counters exactly once.
    async fn verify(&self, verification_type: VerificationType, target_id: &str, context: &str) -> Option<(VerificationResult, Option<QualityGate>)> {
        let resp = self
            .call(
                SUPERVISOR_AGENT,
                "verify_request",
                json!({ "verification_type": verification_type, "target_id": target_id, "context": context }),
                Duration::from_secs(200),
            )
            .await
            .ok()?;
        let result: VerificationResult = serde_json::from_value(resp.payload["result"].clone()).ok()?;
        let gate = serde_json::from_value::<Option<QualityGate>>(resp.payload["gate"].clone()).ok().flatten();
        self.bump_metrics(|m| {
            if result.verified {
                m.verifications_passed += 1;
            } else {
                m.verifications_failed += 1;
            }
        })
        .await;
        Some((result, gate))
    }

    async fn verify_gate(&self, verification_type: VerificationType, target_id: &str, context: &str) -> Option<QualityGate> {
        self.verify(verification_type, target_id, context).await?.1
    }

    async fn verify_step(&self, verification_type: VerificationType, target_id: &str, context: &str) -> Option<VerificationResult> {
        self.verify(verification_type, target_id, context).await.map(|(result, _)| result)
    }

    async fn handle_blocked_step(&self, mut plan: ExecutionPlan, step_index: usize) -> StepOutcome {
        let reason = plan.steps[step_index].fail_reason.clone().unwrap_or_else(|| "blocked".to_string());
        let depth = plan.depth;
        let step_id = plan.steps[step_index].id.clone();
        self.record_event(EventKind::StepError, json!({ "step_id": step_id, "reason": reason })).await;

        if depth >= 3 {
            self.record_event(EventKind::ReplanLimitReached, json!({ "step_id": step_id })).await;
            plan.steps[step_index].mark_failed(reason);
            plan.current_step_index += 1;
            if plan.is_complete() {
                plan.status = PlanStatus::Complete;
            }
            self.bump_metrics(|m| m.failed_steps += 1).await;
            return StepOutcome::Continue(plan);
        }

        self.record_event(EventKind::ReplanStarted, json!({ "step_id": step_id, "reason": reason })).await;
        let blocked_step = plan.steps[step_index].clone();
        let new_depth = depth + 1;

        let resp = self
            .call(
                PLANNER_AGENT,
                "replan_request",
                json!({ "blocked_step": blocked_step, "reason": reason, "new_depth": new_depth }),
                Duration::from_secs(650),
            )
            .await;

        self.bump_metrics(|m| m.replan_count += 1).await;

        let sub_plan = resp.ok().and_then(|r| {
            let success = r.payload["success"].as_bool().unwrap_or(false);
            success.then(|| serde_json::from_value::<ExecutionPlan>(r.payload["plan"].clone()).ok()).flatten()
        });

        match sub_plan {
            Some(sub_plan) => {
                self.record_event(
                    EventKind::ReplanCompleted,
                    json!({ "parent_step_id": blocked_step.id, "sub_plan_id": sub_plan.id }),
                )
                .await;
                self.put_plan(plan).await;
                self.push_sub_plan(sub_plan).await;
                StepOutcome::SubPlanPushed
            }
            None => {
                self.record_event(EventKind::ReplanFailed, json!({ "step_id": blocked_step.id })).await;
                plan.steps[step_index].mark_failed(format!("{}; re-planning also failed", blocked_step.fail_reason.unwrap_or_default()));
                plan.current_step_index += 1;
                if plan.is_complete() {
                    plan.status = PlanStatus::Complete;
                }
                self.bump_metrics(|m| m.failed_steps += 1).await;
                StepOutcome::Continue(plan)
            }
        }
    }

    async fn maybe_run_progress_check(&self) -> Result<(), DomainError> {
        if !self.config.enable_progress_checks {
            return Ok(());
        }

        let (now_ms, due, metrics) = {
            let guard = self.inner.lock().await;
            let inner = guard.as_ref().ok_or(DomainError::NotInitialized)?;
            let now_ms = inner.time_budget.elapsed_ms();
            let interval_ms = self.config.progress_check_interval.as_millis() as i64;
            (now_ms, now_ms - inner.last_progress_check_ms >= interval_ms, inner.state.metrics)
        };
        if !due {
            return Ok(());
        }
        if let Some(inner) = self.inner.lock().await.as_mut() {
            inner.last_progress_check_ms = now_ms;
        }

        let (stalled, trend) = match self
            .call(SUPERVISOR_AGENT, "progress_check_request", json!({ "now_ms": now_ms, "metrics": metrics }), Duration::from_secs(60))
            .await
        {
            Ok(resp) => (
                resp.payload["stalled"].as_bool().unwrap_or(false),
                resp.payload["trend"].as_str().unwrap_or("insufficient").to_string(),
            ),
            Err(_) => (false, "insufficient".to_string()),
        };
        self.record_event(EventKind::ProgressCheck, json!({ "stalled": stalled, "trend": trend })).await;

        let context = format!("stalled={stalled} trend={trend}");
        if let Some(result) = self.verify_step(VerificationType::Progress, "progress", &context).await {
            match map_progress_recommendation(&result.recommendation) {
                ProgressAction::Abort => {
                    self.record_event(EventKind::AbortRecommended, json!({ "reason": result.reason })).await;
                    if let Some(inner) = self.inner.lock().await.as_mut() {
                        inner.state.should_stop = true;
                    }
                }
                ProgressAction::Refocus | ProgressAction::Correct => {
                    self.record_event(EventKind::Escalation, json!({ "recommendation": result.recommendation })).await;
                }
                ProgressAction::Continue => {}
            }
        }
        Ok(())
    }

    // ---- phase 3: verification -----------------------------------------

    async fn run_verification_phase(&self) -> Result<(), DomainError> {
        let already_terminal = {
            let guard = self.inner.lock().await;
            let inner = guard.as_ref().ok_or(DomainError::NotInitialized)?;
            inner.state.status != OrchestrationStatus::Running
        };
        if already_terminal {
            return Ok(());
        }

        self.workflow_transition(WorkflowPhase::Verifying).await;
        self.record_event(EventKind::PhaseStarted, json!({ "phase": "verification" })).await;

        let (goal, metrics) = {
            let guard = self.inner.lock().await;
            let inner = guard.as_ref().ok_or(DomainError::NotInitialized)?;
            (inner.state.primary_goal.clone(), inner.state.metrics)
        };
        let context = format!(
            "{} of {} steps completed, {} failed",
            metrics.completed_steps, metrics.total_steps, metrics.failed_steps
        );

        let result = self.verify_step(VerificationType::Goal, &goal, &context).await;
        let verified = result.map(|r| r.verified).unwrap_or(true);

        let mut guard = self.inner.lock().await;
        let inner = guard.as_mut().ok_or(DomainError::NotInitialized)?;
        if verified {
            inner.state.record(OrchestratorEvent::simple(EventKind::GoalAchieved));
            inner.state.finish(OrchestrationStatus::Completed);
            inner.workflow.transition(WorkflowPhase::Completed);
        } else {
            inner.state.record(OrchestratorEvent::simple(EventKind::GoalVerificationFailed));
            inner.state.finish(OrchestrationStatus::VerificationFailed);
            inner.workflow.transition(WorkflowPhase::Failed);
        }
        drop(guard);
        self.record_event(EventKind::PhaseCompleted, json!({ "phase": "verification" })).await;
        Ok(())
    }

    // ---- report -----------------------------------------------------------

    pub async fn generate_report(&self) -> Result<OrchestrationReport, DomainError> {
        let history = self.bus.get_history(&HistoryFilter::default()).await;
        let mut by_type = std::collections::HashMap::new();
        for msg in &history {
            *by_type.entry(msg.message_type.clone()).or_insert(0u32) += 1;
        }

        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(DomainError::NotInitialized)?;

        let plan_progress = inner.state.current_plan.as_ref().map(|p| PlanProgress {
            total_steps: p.steps.len(),
            completed_steps: p.steps.iter().filter(|s| s.status == StepStatus::Completed).count(),
            current_step_index: p.current_step_index,
            plan_depth: p.depth,
        });

        Ok(OrchestrationReport {
            status: inner.state.status,
            goal: inner.state.primary_goal.clone(),
            elapsed_ms: inner.time_budget.elapsed_ms(),
            iterations: inner.state.iteration,
            plan_progress,
            metrics: inner.state.metrics,
            plan_depth: inner.state.plan_depth(),
            plan_revisions: inner.plan_revision_count,
            workflow: WorkflowSummary {
                phase: inner.workflow.phase,
                transition_count: inner.workflow.history.len(),
            },
            time_budget: Some(TimeBudgetSummary {
                total_ms: inner.time_budget.total_ms,
                elapsed_ms: inner.time_budget.elapsed_ms(),
                remaining_ms: inner.time_budget.remaining_ms(),
                phase_allocations: inner.time_budget.phase_allocations,
            }),
            message_bus: MessageBusStats { total_messages: history.len(), by_type },
            agent_stats: self.llm.metrics().await,
            recent_events: inner.state.event_log.last_n(50).into_iter().cloned().collect(),
        })
    }

    // ---- small state helpers --------------------------------------------

    async fn call(&self, to: &str, message_type: &str, payload: serde_json::Value, timeout: Duration) -> Result<AgentMessage, BusError> {
        if let Some(role) = Self::role_for_agent(to) {
            self.set_agent_status(role, AgentStatus::Busy, None).await;
        }
        let msg = AgentMessage::new(message_type, ORCHESTRATOR_AGENT, to, payload);
        let result = self.bus.request(msg, timeout).await;
        if let Some(role) = Self::role_for_agent(to) {
            let status = if result.is_ok() { AgentStatus::Idle } else { AgentStatus::Errored };
            self.set_agent_status(role, status, None).await;
        }
        result
    }

    async fn set_agent_status(&self, role: Role, status: AgentStatus, last_output: Option<String>) {
        if let Some(inner) = self.inner.lock().await.as_mut()
            && let Some(entry) = inner.state.agents.get_mut(&role)
        {
            entry.status = status;
            if last_output.is_some() {
                entry.last_output = last_output;
            }
        }
    }

    async fn should_continue(&self) -> bool {
        let guard = self.inner.lock().await;
        let Some(inner) = guard.as_ref() else { return false };
        if inner.state.should_stop || inner.time_budget.is_expired() {
            return false;
        }
        inner.state.current_plan.as_ref().map(|p| !p.is_complete()).unwrap_or(false)
    }

    async fn take_plan(&self) -> Option<ExecutionPlan> {
        self.inner.lock().await.as_mut().and_then(|inner| inner.state.current_plan.take())
    }

    async fn put_plan(&self, plan: ExecutionPlan) {
        if let Some(inner) = self.inner.lock().await.as_mut() {
            inner.state.current_plan = Some(plan);
        }
    }

    async fn push_sub_plan(&self, plan: ExecutionPlan) {
        if let Some(inner) = self.inner.lock().await.as_mut() {
            inner.state.push_plan(plan);
        }
    }

    async fn bump_iteration(&self) {
        if let Some(inner) = self.inner.lock().await.as_mut() {
            inner.state.iteration += 1;
        }
    }

    async fn record_event(&self, kind: EventKind, detail: serde_json::Value) {
        if let Some(inner) = self.inner.lock().await.as_mut() {
            inner.state.record(OrchestratorEvent::new(kind, detail));
        }
    }

    async fn bump_metrics(&self, f: impl FnOnce(&mut Metrics)) {
        if let Some(inner) = self.inner.lock().await.as_mut() {
            f(&mut inner.state.metrics);
        }
    }

    async fn workflow_transition(&self, phase: WorkflowPhase) {
        if let Some(inner) = self.inner.lock().await.as_mut() {
            inner.workflow.transition(phase);
        }
    }

    /// Pops a completed sub-plan onto its parent once the active plan
    /// (which may be a sub-plan) has run out of steps (§3, §4.7 item 7).
    async fn finalize_if_subplan_complete(&self) {
        let mut guard = self.inner.lock().await;
        let Some(inner) = guard.as_mut() else { return };
        let complete = inner.state.current_plan.as_ref().map(|p| p.is_complete()).unwrap_or(false);
        if !complete || inner.state.plan_stack.is_empty() {
            return;
        }
        if let Some(finished) = inner.state.pop_plan() {
            if let Some(parent) = inner.state.current_plan.as_mut() {
                if let Some(parent_step) = parent.current_step_mut() {
                    parent_step.mark_completed_via_sub_plan(finished.id.clone());
                }
                parent.current_step_index += 1;
                if parent.is_complete() {
                    parent.status = PlanStatus::Complete;
                }
            }
            inner.state.record(OrchestratorEvent::new(EventKind::SubplanCompleted, json!({ "sub_plan_id": finished.id })));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{CallOptions, CallResult};
    use async_trait::async_trait;
    use std::time::Duration as StdDuration;

    /// Scripted invoker keyed by agent name: the Planner always produces a
    /// two-step plan, the Coder a trivial file, the Tester/Supervisor always
    /// pass.
    struct ScriptedInvoker;

    #[async_trait]
    impl LlmInvoker for ScriptedInvoker {
        async fn send_prompt(&self, _prompt: &str, _opts: &CallOptions) -> Result<CallResult, LlmError> {
            unreachable!()
        }

        async fn start_session(&self, system_context: &str, _prompt: &str, _opts: &CallOptions) -> Result<CallResult, LlmError> {
            let response = if system_context.contains("Planner") {
                "ANALYSIS:\nA two-step rollout covering implementation and coverage.\nPLAN:\n1. Implement the storage layer | simple\n2. Add integration tests for it | simple\n"
                    .to_string()
            } else if system_context.contains("Coder") {
                "### Summary\nImplemented the step with a small, well-documented function.\n\n\
                 ### Files Created\n`src/lib.rs`\n```rust\npub fn run() {}\n```\n\n\
                 ### Tests Created\n`tests/run_test.rs`\n```rust\n#[test]\nfn it_works() {}\n```\n\n\
                 ### Status\nCOMPLETE\n"
                    .to_string()
            } else {
                "VERIFIED: YES\nSCORE: 90\nRECOMMENDATION: continue\nREASON: looks complete".to_string()
            };
            Ok(CallResult {
                response,
                session_id: "sess".to_string(),
                cost_usd: Some(0.0),
                duration: StdDuration::from_millis(1),
                tokens_in: None,
                tokens_out: None,
                tool_calls: None,
                structured_output: None,
            })
        }

        async fn continue_session(&self, agent: &str, prompt: &str, opts: &CallOptions) -> Result<CallResult, LlmError> {
            self.start_session(agent, prompt, opts).await
        }
    }

    fn test_config() -> CliConfig {
        let mut config = CliConfig::default();
        config.time_limit = Duration::from_secs(3600);
        config.working_dir = std::env::temp_dir();
        config
    }

    #[tokio::test]
    async fn run_before_initialize_fails() {
        let orchestrator = Orchestrator::new(test_config(), Arc::new(ScriptedInvoker));
        let result = orchestrator.run().await;
        assert!(matches!(result, Err(DomainError::NotInitialized)));
    }

    #[tokio::test]
    async fn happy_path_completes_and_reports() {
        let orchestrator = Orchestrator::new(test_config(), Arc::new(ScriptedInvoker));
        orchestrator.initialize("build a todo list API", "").await;
        let report = orchestrator.run().await.unwrap();
        assert_eq!(report.status, OrchestrationStatus::Completed);
        assert!(report.metrics.completed_steps >= 1);
        assert!(!report.recent_events.is_empty());
    }

    #[test]
    fn progress_recommendation_keywords_map_correctly() {
        assert_eq!(map_progress_recommendation("ABORT immediately"), ProgressAction::Abort);
        assert_eq!(map_progress_recommendation("needs INTERVENTION"), ProgressAction::Refocus);
        assert_eq!(map_progress_recommendation("provide GUIDANCE"), ProgressAction::Correct);
        assert_eq!(map_progress_recommendation("continue as planned"), ProgressAction::Continue);
    }
}
