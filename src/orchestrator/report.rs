//! `generateReport()` (§4.7): the snapshot returned to callers once a run
//! ends, win or lose.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::{Metrics, OrchestratorEvent, OrchestrationStatus, PhaseAllocations, WorkflowPhase};
use crate::llm::LlmMetrics;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanProgress {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub current_step_index: usize,
    pub plan_depth: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeBudgetSummary {
    pub total_ms: i64,
    pub elapsed_ms: i64,
    pub remaining_ms: i64,
    pub phase_allocations: PhaseAllocations,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub phase: WorkflowPhase,
    pub transition_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBusStats {
    pub total_messages: usize,
    pub by_type: HashMap<String, u32>,
}

/// §4.7 `generateReport()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationReport {
    pub status: OrchestrationStatus,
    pub goal: String,
    pub elapsed_ms: i64,
    pub iterations: u32,
    pub plan_progress: Option<PlanProgress>,
    pub metrics: Metrics,
    pub plan_depth: u8,
    pub plan_revisions: u32,
    pub workflow: WorkflowSummary,
    pub time_budget: Option<TimeBudgetSummary>,
    pub message_bus: MessageBusStats,
    pub agent_stats: LlmMetrics,
    pub recent_events: Vec<OrchestratorEvent>,
}
