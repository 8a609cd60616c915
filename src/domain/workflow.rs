//! `WorkflowLoop` (§3) — the orchestrator's own phase tracker, distinct from
//! step status and from the [`crate::domain::state::OrchestrationStatus`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ring::RingBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Initializing,
    Planning,
    PlanReview,
    Executing,
    Testing,
    Fixing,
    Verifying,
    Replanning,
    Completed,
    Failed,
    Aborted,
    TimeExpired,
}

impl WorkflowPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowPhase::Completed | WorkflowPhase::Failed | WorkflowPhase::Aborted | WorkflowPhase::TimeExpired
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: WorkflowPhase,
    pub to: WorkflowPhase,
    pub at: DateTime<Utc>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowLoop {
    pub phase: WorkflowPhase,
    #[serde(skip, default = "default_history")]
    pub history: RingBuffer<PhaseTransition>,
}

fn default_history() -> RingBuffer<PhaseTransition> {
    RingBuffer::new(200)
}

impl Default for WorkflowLoop {
    fn default() -> Self {
        Self {
            phase: WorkflowPhase::Initializing,
            history: default_history(),
        }
    }
}

impl WorkflowLoop {
    pub fn transition(&mut self, to: WorkflowPhase) {
        self.transition_with_note(to, None);
    }

    pub fn transition_with_note(&mut self, to: WorkflowPhase, note: Option<String>) {
        let from = self.phase;
        self.history.push(PhaseTransition {
            from,
            to,
            at: Utc::now(),
            note,
        });
        self.phase = to;
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}
