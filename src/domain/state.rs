//! `OrchestrationState` (§3) — owned exclusively by the orchestrator (§5).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::events::OrchestratorEvent;
use crate::domain::plan::ExecutionPlan;
use crate::ring::RingBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Planner,
    Coder,
    Tester,
    Supervisor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Errored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRuntimeStatus {
    pub status: AgentStatus,
    pub last_output: Option<String>,
}

impl Default for AgentRuntimeStatus {
    fn default() -> Self {
        Self {
            status: AgentStatus::Idle,
            last_output: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub total_steps: u32,
    pub completed_steps: u32,
    pub failed_steps: u32,
    pub replan_count: u32,
    pub fix_cycles: u32,
    pub verifications_passed: u32,
    pub verifications_failed: u32,
}

impl Metrics {
    /// Progress score used by the progress monitor (§4.6).
    pub fn progress_score(&self) -> i64 {
        10 * self.completed_steps as i64 - 5 * self.failed_steps as i64
            + 2 * self.fix_cycles as i64
            + 3 * self.verifications_passed as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    Running,
    Completed,
    VerificationFailed,
    Failed,
    Aborted,
    TimeExpired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub primary_goal: String,
    pub status: OrchestrationStatus,
    pub current_plan: Option<ExecutionPlan>,
    /// LIFO stack of suspended parent plans; `current_plan` is the active
    /// frame, `plan_stack` holds everything beneath it (§3, §5).
    pub plan_stack: Vec<ExecutionPlan>,
    pub iteration: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub agents: HashMap<Role, AgentRuntimeStatus>,
    pub metrics: Metrics,
    #[serde(skip, default = "default_event_log")]
    pub event_log: RingBuffer<OrchestratorEvent>,
    pub should_stop: bool,
}

fn default_event_log() -> RingBuffer<OrchestratorEvent> {
    RingBuffer::new(200)
}

impl OrchestrationState {
    pub fn new(primary_goal: impl Into<String>) -> Self {
        let mut agents = HashMap::new();
        for role in [Role::Planner, Role::Coder, Role::Tester, Role::Supervisor] {
            agents.insert(role, AgentRuntimeStatus::default());
        }
        Self {
            primary_goal: primary_goal.into(),
            status: OrchestrationStatus::Running,
            current_plan: None,
            plan_stack: Vec::new(),
            iteration: 0,
            start_time: Utc::now(),
            end_time: None,
            agents,
            metrics: Metrics::default(),
            event_log: default_event_log(),
            should_stop: false,
        }
    }

    pub fn record(&mut self, event: OrchestratorEvent) {
        self.event_log.push(event);
    }

    pub fn plan_depth(&self) -> u8 {
        self.current_plan.as_ref().map(|p| p.depth).unwrap_or(0)
    }

    /// §3: `canCreateSubPlan ⇔ planStack.depth < 3`.
    pub fn can_create_sub_plan(&self) -> bool {
        self.plan_depth() < 3
    }

    /// Suspends the current plan beneath the stack and makes `sub_plan` the
    /// active frame. Balanced by [`Self::pop_plan`] (§8 idempotence property).
    pub fn push_plan(&mut self, sub_plan: ExecutionPlan) {
        if let Some(current) = self.current_plan.take() {
            self.plan_stack.push(current);
        }
        self.current_plan = Some(sub_plan);
    }

    /// Restores the parent plan. Returns the completed sub-plan, if any was
    /// active.
    pub fn pop_plan(&mut self) -> Option<ExecutionPlan> {
        let finished = self.current_plan.take();
        self.current_plan = self.plan_stack.pop();
        finished
    }

    pub fn finish(&mut self, status: OrchestrationStatus) {
        self.status = status;
        self.end_time = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::plan::{Complexity, ExecutionPlan, PlanStep};

    fn plan(goal: &str) -> ExecutionPlan {
        ExecutionPlan::new(goal, "analysis", vec![PlanStep::new(1, "step", Complexity::Simple)])
    }

    #[test]
    fn push_then_pop_restores_parent_referentially() {
        let mut state = OrchestrationState::new("goal");
        state.current_plan = Some(plan("parent"));
        let parent_id = state.current_plan.as_ref().unwrap().id.clone();

        state.push_plan(plan("child"));
        assert_eq!(state.plan_stack.len(), 1);
        assert_ne!(state.current_plan.as_ref().unwrap().id, parent_id);

        let finished = state.pop_plan().unwrap();
        assert_ne!(finished.id, parent_id);
        assert_eq!(state.current_plan.as_ref().unwrap().id, parent_id);
        assert!(state.plan_stack.is_empty());
    }

    #[test]
    fn can_create_sub_plan_false_at_depth_three() {
        let mut state = OrchestrationState::new("goal");
        let mut p = plan("goal");
        p.depth = 3;
        state.current_plan = Some(p);
        assert!(!state.can_create_sub_plan());
    }
}
