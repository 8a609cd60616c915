//! Tester worker output types (§4.5).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Suggestion,
    Minor,
    Major,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    LogicError,
    EdgeCase,
    ErrorHandling,
    Security,
    Performance,
    CodeQuality,
    TestFailure,
    MissingTest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestIssue {
    pub severity: IssueSeverity,
    pub category: IssueCategory,
    pub description: String,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageBucket {
    None,
    Poor,
    Partial,
    Good,
    Excellent,
}

impl CoverageBucket {
    pub fn from_percent(percent: f32) -> Self {
        if percent <= 0.0 {
            CoverageBucket::None
        } else if percent < 40.0 {
            CoverageBucket::Poor
        } else if percent < 70.0 {
            CoverageBucket::Partial
        } else if percent < 90.0 {
            CoverageBucket::Good
        } else {
            CoverageBucket::Excellent
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestQuality {
    Good,
    Acceptable,
    Poor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCoverageAnalysis {
    pub modified_files: u32,
    pub tested_files: u32,
    pub percent: f32,
    pub bucket: CoverageBucket,
    pub quality: TestQuality,
}

impl TestCoverageAnalysis {
    pub fn compute(modified_files: &[String], test_files: &[String], issue_count: usize) -> Self {
        let modified = modified_files.len() as u32;
        let tested = modified_files
            .iter()
            .filter(|m| {
                test_files.iter().any(|t| {
                    let stem = std::path::Path::new(m)
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or(m);
                    t.contains(stem)
                })
            })
            .count() as u32;
        let percent = if modified == 0 {
            0.0
        } else {
            (tested as f32 / modified as f32) * 100.0
        };
        let bucket = CoverageBucket::from_percent(percent);
        let quality = if issue_count == 0 && tested > 0 {
            TestQuality::Good
        } else if issue_count <= 2 {
            TestQuality::Acceptable
        } else {
            TestQuality::Poor
        };
        Self {
            modified_files: modified,
            tested_files: tested,
            percent,
            bucket,
            quality,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestOutcome {
    TimedOut,
    Errored,
    Ran,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub step_id: String,
    pub passed: bool,
    pub outcome: TestOutcome,
    pub issues: Vec<TestIssue>,
    pub suggestions: Vec<String>,
    pub raw_output: String,
    pub coverage: Option<TestCoverageAnalysis>,
}

impl TestResult {
    /// §4.5 verdict rule: passed iff no issue is critical or major.
    pub fn compute_passed(issues: &[TestIssue]) -> bool {
        !issues
            .iter()
            .any(|i| matches!(i.severity, IssueSeverity::Critical | IssueSeverity::Major))
    }

    pub fn errored(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            passed: false,
            outcome: TestOutcome::Errored,
            issues: Vec::new(),
            suggestions: Vec::new(),
            raw_output: message.into(),
            coverage: None,
        }
    }

    pub fn timed_out(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            passed: false,
            outcome: TestOutcome::TimedOut,
            issues: Vec::new(),
            suggestions: Vec::new(),
            raw_output: "test run exceeded the wall clock and was terminated".to_string(),
            coverage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passed_iff_no_critical_or_major() {
        let minor = vec![TestIssue {
            severity: IssueSeverity::Minor,
            category: IssueCategory::CodeQuality,
            description: "nit".into(),
            location: None,
        }];
        assert!(TestResult::compute_passed(&minor));

        let critical = vec![TestIssue {
            severity: IssueSeverity::Critical,
            category: IssueCategory::Security,
            description: "sql injection".into(),
            location: None,
        }];
        assert!(!TestResult::compute_passed(&critical));
    }

    #[test]
    fn coverage_buckets_follow_thresholds() {
        assert_eq!(CoverageBucket::from_percent(0.0), CoverageBucket::None);
        assert_eq!(CoverageBucket::from_percent(39.9), CoverageBucket::Poor);
        assert_eq!(CoverageBucket::from_percent(69.9), CoverageBucket::Partial);
        assert_eq!(CoverageBucket::from_percent(89.9), CoverageBucket::Good);
        assert_eq!(CoverageBucket::from_percent(90.0), CoverageBucket::Excellent);
    }
}
