//! Plan response parsing (§6): `ANALYSIS:`/`PLAN:`/`DEPENDENCIES:`/`RISKS:`/
//! `TOTAL_STEPS:` sections, each step line
//! `^\d+\. description \| (simple|medium|complex)$`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use crate::domain::{Complexity, ExecutionPlan, PlanStep};
use crate::error::DomainError;

static STEP_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(\d+)\.\s*(.+?)\s*\|\s*(simple|medium|complex)\s*$").unwrap());

static DEPENDENCY_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*(\d+)\s*->\s*(.+)$").unwrap());

fn section(text: &str, header: &str, next_headers: &[&str]) -> Option<String> {
    let start = text.find(header)? + header.len();
    let rest = &text[start..];
    let mut end = rest.len();
    for next in next_headers {
        if let Some(idx) = rest.find(next)
            && idx < end
        {
            end = idx;
        }
    }
    Some(rest[..end].trim().to_string())
}

const HEADERS: [&str; 5] = ["ANALYSIS:", "PLAN:", "DEPENDENCIES:", "RISKS:", "TOTAL_STEPS:"];

/// Parses an LLM plan response into an [`ExecutionPlan`] at depth 0.
///
/// On total parse failure (no step lines at all) returns
/// [`DomainError::ParseFailure`]; callers fall back to
/// [`ExecutionPlan::fallback`] per §8 boundary behavior.
pub fn parse_plan_response(goal: &str, response: &str) -> Result<ExecutionPlan, DomainError> {
    let analysis = section(response, "ANALYSIS:", &HEADERS[1..]).unwrap_or_default();
    let plan_section = section(response, "PLAN:", &HEADERS[2..]).unwrap_or_else(|| response.to_string());
    let deps_section = section(response, "DEPENDENCIES:", &HEADERS[3..]);
    let risks_section = section(response, "RISKS:", &HEADERS[4..]);
    let _ = risks_section;

    let mut steps: Vec<PlanStep> = STEP_LINE
        .captures_iter(&plan_section)
        .map(|caps| {
            let number: u32 = caps[1].parse().unwrap_or(0);
            let description = caps[2].trim().to_string();
            let complexity = match &caps[3] {
                "simple" => Complexity::Simple,
                "medium" => Complexity::Medium,
                _ => Complexity::Complex,
            };
            PlanStep::new(number, description, complexity)
        })
        .collect();

    if steps.is_empty() {
        return Err(DomainError::ParseFailure(
            "no step lines matched the expected `N. description | complexity` format".to_string(),
        ));
    }

    // §4.3: clamp to 2-15 steps.
    if steps.len() > 15 {
        steps.truncate(15);
    }

    let mut plan = ExecutionPlan::new(goal, analysis, steps);

    if let Some(deps_text) = deps_section {
        let mut deps: HashMap<String, Vec<String>> = HashMap::new();
        for caps in DEPENDENCY_LINE.captures_iter(&deps_text) {
            let from_number = caps[1].trim();
            let to_numbers: Vec<String> = caps[2]
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if let Some(step) = plan.steps.iter().find(|s| s.number.to_string() == from_number) {
                deps.insert(step.id.clone(), to_numbers);
            }
        }
        plan.dependencies = deps;
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "ANALYSIS:\nA simple todo app needs CRUD endpoints and storage.\nPLAN:\n1. Set up project scaffold | simple\n2. Implement todo model and storage | medium\n3. Implement CRUD API endpoints | medium\n4. Add integration tests | simple\nDEPENDENCIES:\n2 -> 1\n3 -> 2\nRISKS:\nNone significant.\nTOTAL_STEPS: 4\n";

    #[test]
    fn parses_steps_in_order_with_complexity() {
        let plan = parse_plan_response("Build a todo application", SAMPLE).unwrap();
        assert_eq!(plan.steps.len(), 4);
        assert_eq!(plan.steps[0].complexity, Complexity::Simple);
        assert_eq!(plan.steps[1].complexity, Complexity::Medium);
        assert_eq!(plan.steps[0].number, 1);
        assert!(plan.analysis.contains("CRUD"));
    }

    #[test]
    fn no_step_lines_is_a_parse_failure() {
        let result = parse_plan_response("goal", "I don't know what to do.");
        assert!(result.is_err());
    }

    #[test]
    fn clamps_to_fifteen_steps() {
        let mut text = "PLAN:\n".to_string();
        for i in 1..=20 {
            text.push_str(&format!("{i}. step number {i} | simple\n"));
        }
        let plan = parse_plan_response("goal", &text).unwrap();
        assert_eq!(plan.steps.len(), 15);
    }
}
