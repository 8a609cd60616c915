//! Tester exploratory-phase response parsing (§4.5): `VERDICT: PASS|FAIL`
//! plus `[CRITICAL|MAJOR|MINOR] description` issue lines.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::{IssueCategory, IssueSeverity, TestIssue};

static VERDICT_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)VERDICT:\s*(PASS|FAIL)").unwrap());
static ISSUE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[(CRITICAL|MAJOR|MINOR)\]\s*(.+)").unwrap());

fn classify_category(description: &str) -> IssueCategory {
    let lower = description.to_lowercase();
    if lower.contains("inject") || lower.contains("secret") || lower.contains("auth") {
        IssueCategory::Security
    } else if lower.contains("null") || lower.contains("undefined") || lower.contains("boundary") {
        IssueCategory::EdgeCase
    } else if lower.contains("error") || lower.contains("exception") || lower.contains("panic") {
        IssueCategory::ErrorHandling
    } else if lower.contains("slow") || lower.contains("performance") || lower.contains("n+1") {
        IssueCategory::Performance
    } else if lower.contains("test") && (lower.contains("missing") || lower.contains("no test")) {
        IssueCategory::MissingTest
    } else if lower.contains("fail") {
        IssueCategory::TestFailure
    } else if lower.contains("logic") {
        IssueCategory::LogicError
    } else {
        IssueCategory::CodeQuality
    }
}

/// Parses the LLM exploratory-review response into a pass/fail verdict and
/// a bounded issue list. `VERDICT:` is informational only — §4.5 computes
/// the real verdict deterministically from issue severities via
/// [`crate::domain::TestResult::compute_passed`]; this function never
/// trusts the model's self-reported pass/fail.
pub fn parse_exploratory_response(response: &str) -> (bool, Vec<TestIssue>) {
    let claimed_pass = VERDICT_LINE
        .captures(response)
        .map(|c| c[1].eq_ignore_ascii_case("PASS"))
        .unwrap_or(true);

    let issues: Vec<TestIssue> = ISSUE_LINE
        .captures_iter(response)
        .map(|c| {
            let severity = match c[1].to_uppercase().as_str() {
                "CRITICAL" => IssueSeverity::Critical,
                "MAJOR" => IssueSeverity::Major,
                _ => IssueSeverity::Minor,
            };
            let description = c[2].trim().to_string();
            TestIssue {
                category: classify_category(&description),
                severity,
                description,
                location: None,
            }
        })
        .take(10)
        .collect();

    (claimed_pass, issues)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pass_with_no_issues() {
        let (claimed, issues) = parse_exploratory_response("VERDICT: PASS\nNo issues found.");
        assert!(claimed);
        assert!(issues.is_empty());
    }

    #[test]
    fn parses_fail_with_critical_issue() {
        let (claimed, issues) = parse_exploratory_response("VERDICT: FAIL\n[CRITICAL] SQL injection in query builder");
        assert!(!claimed);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, IssueSeverity::Critical);
        assert_eq!(issues[0].category, IssueCategory::Security);
    }

    #[test]
    fn caps_at_ten_issues() {
        let mut text = String::from("VERDICT: FAIL\n");
        for i in 0..20 {
            text.push_str(&format!("[MINOR] issue number {i}\n"));
        }
        let (_, issues) = parse_exploratory_response(&text);
        assert_eq!(issues.len(), 10);
    }
}
