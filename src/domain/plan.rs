//! `PlanStep` and `ExecutionPlan` — the plan/step tree (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub action: FileAction,
    pub content: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageEstimate {
    None,
    Minimal,
    Partial,
    Good,
    Excellent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCoverage {
    pub has_tests: bool,
    pub test_count: u32,
    pub coverage_estimate: CoverageEstimate,
}

impl Default for TestCoverage {
    fn default() -> Self {
        Self {
            has_tests: false,
            test_count: 0,
            coverage_estimate: CoverageEstimate::None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ImplementationQuality {
    pub score: u8,
    pub issues: Vec<String>,
    pub strengths: Vec<String>,
}

/// Output of the Coder worker for one step (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeOutput {
    pub files: Vec<FileChange>,
    pub commands: Vec<String>,
    pub tests: Vec<String>,
    pub summary: String,
    pub blocked: bool,
    pub block_reason: Option<String>,
    pub requires_sub_plan: bool,
    pub sub_plan_reason: Option<String>,
    pub test_coverage: TestCoverage,
    pub implementation_quality: ImplementationQuality,
}

impl CodeOutput {
    const MAX_CONTENT_CHARS: usize = 5000;
    const MAX_SUMMARY_CHARS: usize = 500;

    pub fn new(summary: impl Into<String>) -> Self {
        let mut summary = summary.into();
        summary.truncate(Self::MAX_SUMMARY_CHARS);
        Self {
            files: Vec::new(),
            commands: Vec::new(),
            tests: Vec::new(),
            summary,
            blocked: false,
            block_reason: None,
            requires_sub_plan: false,
            sub_plan_reason: None,
            test_coverage: TestCoverage::default(),
            implementation_quality: ImplementationQuality::default(),
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        let mut out = Self::new("");
        out.blocked = true;
        out.block_reason = Some(reason.into());
        out
    }

    pub fn push_file(&mut self, mut file: FileChange) {
        file.content.truncate(Self::MAX_CONTENT_CHARS);
        self.files.push(file);
    }

    pub fn mark_requires_sub_plan(&mut self, reason: impl Into<String>) {
        self.requires_sub_plan = true;
        self.sub_plan_reason = Some(reason.into());
    }

    /// Quality score (§4.4): base 100, -20 no tests, -30 no files, -10
    /// missing/brief summary, +10 comprehensive, clamped to [0,100].
    pub fn compute_quality_score(&self) -> u8 {
        let mut score: i32 = 100;
        if !self.test_coverage.has_tests {
            score -= 20;
        }
        if self.files.is_empty() {
            score -= 30;
        }
        if self.summary.trim().len() < 20 {
            score -= 10;
        } else if self.summary.trim().len() > 120 {
            score += 10;
        }
        score.clamp(0, 100) as u8
    }

    /// §4.4: `meetsMinimumQuality(requireTests)`.
    pub fn meets_minimum_quality(&self, require_tests: bool) -> bool {
        !self.blocked
            && !self.files.is_empty()
            && (!require_tests || self.test_coverage.has_tests)
            && self.compute_quality_score() >= 50
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub number: u32,
    pub description: String,
    pub complexity: Complexity,
    pub status: StepStatus,
    pub depth: u8,
    pub parent_step_id: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub code_output: Option<CodeOutput>,
    pub test_results: Option<crate::domain::test_result::TestResult>,
    pub verification_result: Option<crate::domain::verification::VerificationResult>,
    pub fail_reason: Option<String>,
    pub sub_steps: Vec<PlanStep>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_via_sub_plan: Option<String>,
}

impl PlanStep {
    pub fn new(number: u32, description: impl Into<String>, complexity: Complexity) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            number,
            description: description.into(),
            complexity,
            status: StepStatus::Pending,
            depth: 0,
            parent_step_id: None,
            attempts: 0,
            max_attempts: 3,
            code_output: None,
            test_results: None,
            verification_result: None,
            fail_reason: None,
            sub_steps: Vec::new(),
            completed_at: None,
            completed_via_sub_plan: None,
        }
    }

    /// §3 invariant: `attempts ≤ maxAttempts`.
    pub fn is_retryable(&self) -> bool {
        self.attempts < self.max_attempts && self.depth < 3
    }

    pub fn mark_in_progress(&mut self) {
        self.status = StepStatus::InProgress;
        self.attempts += 1;
    }

    pub fn mark_completed(&mut self) {
        self.status = StepStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_completed_via_sub_plan(&mut self, sub_plan_id: impl Into<String>) {
        self.completed_via_sub_plan = Some(sub_plan_id.into());
        self.mark_completed();
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.fail_reason = Some(reason.into());
    }

    pub fn mark_blocked(&mut self, reason: impl Into<String>) {
        self.status = StepStatus::Blocked;
        self.fail_reason = Some(reason.into());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Active,
    Complete,
    Abandoned,
}

/// §3: `ExecutionPlan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub goal: String,
    pub analysis: String,
    pub steps: Vec<PlanStep>,
    pub current_step_index: usize,
    pub depth: u8,
    pub parent_plan_id: Option<String>,
    pub status: PlanStatus,
    pub dependencies: HashMap<String, Vec<String>>,
}

impl ExecutionPlan {
    pub fn new(goal: impl Into<String>, analysis: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            goal: goal.into(),
            analysis: analysis.into(),
            steps,
            current_step_index: 0,
            depth: 0,
            parent_plan_id: None,
            status: PlanStatus::Active,
            dependencies: HashMap::new(),
        }
    }

    /// Empty-goal / zero-step fallback (§8 boundary behavior).
    pub fn fallback(goal: impl Into<String>) -> Self {
        let mut step = PlanStep::new(1, "Execute the goal directly", Complexity::Complex);
        step.max_attempts = 3;
        Self::new(goal, "No structured plan could be produced; executing directly.", vec![step])
    }

    pub fn is_complete(&self) -> bool {
        self.current_step_index >= self.steps.len()
    }

    pub fn current_step(&self) -> Option<&PlanStep> {
        self.steps.get(self.current_step_index)
    }

    pub fn current_step_mut(&mut self) -> Option<&mut PlanStep> {
        self.steps.get_mut(self.current_step_index)
    }

    /// Monotone advance: marks the current step completed with a timestamp
    /// and moves the index forward. No-op once already complete.
    pub fn advance(&mut self) {
        if self.is_complete() {
            return;
        }
        if let Some(step) = self.current_step_mut() {
            step.mark_completed();
        }
        self.current_step_index += 1;
        if self.is_complete() {
            self.status = PlanStatus::Complete;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_complete_iff_index_equals_len() {
        let mut plan = ExecutionPlan::new(
            "goal",
            "analysis",
            vec![PlanStep::new(1, "do a thing", Complexity::Simple)],
        );
        assert!(!plan.is_complete());
        plan.advance();
        assert!(plan.is_complete());
    }

    #[test]
    fn advance_is_monotone_and_stamps_completion() {
        let mut plan = ExecutionPlan::new(
            "goal",
            "analysis",
            vec![
                PlanStep::new(1, "step one", Complexity::Simple),
                PlanStep::new(2, "step two", Complexity::Simple),
            ],
        );
        plan.advance();
        assert_eq!(plan.current_step_index, 1);
        assert!(plan.steps[0].completed_at.is_some());
        assert_eq!(plan.steps[0].status, StepStatus::Completed);
        plan.advance();
        assert!(plan.is_complete());
        plan.advance();
        assert_eq!(plan.current_step_index, 2, "advance past completion is a no-op");
    }

    #[test]
    fn step_is_retryable_respects_attempts_and_depth() {
        let mut step = PlanStep::new(1, "thing", Complexity::Medium);
        assert!(step.is_retryable());
        step.attempts = step.max_attempts;
        assert!(!step.is_retryable());
        step.attempts = 0;
        step.depth = 3;
        assert!(!step.is_retryable());
    }

    #[test]
    fn code_output_quality_scoring_clamped() {
        let mut out = CodeOutput::new("a");
        out.push_file(FileChange {
            path: "a.rs".into(),
            action: FileAction::Created,
            content: "fn a() {}".into(),
            language: Some("rust".into()),
        });
        // no tests, short summary: 100 - 20 - 10 = 70
        assert_eq!(out.compute_quality_score(), 70);
        out.test_coverage.has_tests = true;
        assert_eq!(out.compute_quality_score(), 90);
    }

    #[test]
    fn fallback_plan_has_one_complex_step() {
        let plan = ExecutionPlan::fallback("");
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].complexity, Complexity::Complex);
    }
}
