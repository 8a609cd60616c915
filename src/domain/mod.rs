//! The typed domain model (SYSTEM OVERVIEW component A): `Plan`/`PlanStep`,
//! `TestResult`, `VerificationResult`, `DetailedFixPlan`, `QualityGate`, and
//! `OrchestrationState`.

pub mod events;
pub mod fix_plan;
pub mod plan;
pub mod quality_gate;
pub mod state;
pub mod test_result;
pub mod time_budget;
pub mod verification;
pub mod workflow;

pub use events::{EventKind, OrchestratorEvent};
pub use fix_plan::{DetailedFixPlan, FixIssue, FixPriority, FixStep, PreviousFixAttempt};
pub use plan::{
    CodeOutput, Complexity, CoverageEstimate, ExecutionPlan, FileAction, FileChange,
    ImplementationQuality, PlanStatus, PlanStep, StepStatus, TestCoverage,
};
pub use quality_gate::{GateDecision, QualityGate};
pub use state::{AgentRuntimeStatus, AgentStatus, Metrics, OrchestrationState, OrchestrationStatus, Role};
pub use test_result::{
    CoverageBucket, IssueCategory, IssueSeverity, TestCoverageAnalysis, TestIssue, TestOutcome, TestQuality,
    TestResult,
};
pub use time_budget::{PhaseAllocations, PhaseElapsed, TimeBudget};
pub use verification::{VerificationResult, VerificationType};
pub use workflow::{PhaseTransition, WorkflowLoop, WorkflowPhase};
