//! The orchestrator's observer-facing event vocabulary (§6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Initialized,
    Started,
    Stopping,
    PhaseStarted,
    PhaseCompleted,
    PlanCreated,
    PlanReviewed,
    PlanApproved,
    PlanNeedsRevision,
    PlanRevised,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepError,
    TestsMissing,
    FixCycleStarted,
    FixCycleCompleted,
    ReplanStarted,
    ReplanCompleted,
    ReplanFailed,
    ReplanLimitReached,
    SubplanCompleted,
    ProgressCheck,
    AbortRecommended,
    GoalAchieved,
    GoalVerificationFailed,
    TimeExpired,
    Escalation,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorEvent {
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    pub detail: serde_json::Value,
}

impl OrchestratorEvent {
    pub fn new(kind: EventKind, detail: serde_json::Value) -> Self {
        Self {
            kind,
            at: Utc::now(),
            detail,
        }
    }

    pub fn simple(kind: EventKind) -> Self {
        Self::new(kind, serde_json::Value::Null)
    }
}
