//! `DetailedFixPlan` (§3), produced by the Tester when a test run fails.

use serde::{Deserialize, Serialize};

use crate::domain::test_result::IssueSeverity;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixIssue {
    pub severity: IssueSeverity,
    pub category: String,
    pub description: String,
    pub location: Option<String>,
    pub suggested_fix: Option<String>,
    pub root_cause: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixStep {
    pub description: String,
    pub target_file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixPriority {
    Suggestion,
    Minor,
    Major,
    Critical,
}

impl From<IssueSeverity> for FixPriority {
    fn from(s: IssueSeverity) -> Self {
        match s {
            IssueSeverity::Suggestion => FixPriority::Suggestion,
            IssueSeverity::Minor => FixPriority::Minor,
            IssueSeverity::Major => FixPriority::Major,
            IssueSeverity::Critical => FixPriority::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviousFixAttempt {
    pub approach: String,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailedFixPlan {
    pub id: String,
    pub test_result_id: String,
    pub issues: Vec<FixIssue>,
    pub fix_steps: Vec<FixStep>,
    pub priority: FixPriority,
    pub previous_attempts: Vec<PreviousFixAttempt>,
    pub suggested_approach: String,
    pub avoid_approaches: Vec<String>,
}

impl DetailedFixPlan {
    pub fn new(test_result_id: impl Into<String>, issues: Vec<FixIssue>) -> Self {
        let priority = issues
            .iter()
            .map(|i| FixPriority::from(i.severity))
            .max()
            .unwrap_or(FixPriority::Suggestion);
        let avoid_approaches = Vec::new();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            test_result_id: test_result_id.into(),
            issues,
            fix_steps: Vec::new(),
            priority,
            previous_attempts: Vec::new(),
            suggested_approach: String::new(),
            avoid_approaches,
        }
    }

    /// Derives `avoidApproaches` from failed attempts recorded so far.
    pub fn with_learning(mut self, previous_attempts: Vec<PreviousFixAttempt>) -> Self {
        self.avoid_approaches = previous_attempts
            .iter()
            .filter(|a| !a.succeeded)
            .map(|a| a.approach.clone())
            .collect();
        self.previous_attempts = previous_attempts;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_derives_from_max_severity() {
        let plan = DetailedFixPlan::new(
            "tr-1",
            vec![
                FixIssue {
                    severity: IssueSeverity::Minor,
                    category: "style".into(),
                    description: "nit".into(),
                    location: None,
                    suggested_fix: None,
                    root_cause: None,
                },
                FixIssue {
                    severity: IssueSeverity::Critical,
                    category: "security".into(),
                    description: "sql injection".into(),
                    location: None,
                    suggested_fix: None,
                    root_cause: None,
                },
            ],
        );
        assert_eq!(plan.priority, FixPriority::Critical);
    }
}
