//! Quality gates (§3, §4.6).

use serde::{Deserialize, Serialize};

use crate::domain::verification::VerificationType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Pending,
    Approved,
    NeedsRevision,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGate {
    pub gate_type: VerificationType,
    pub target_id: String,
    pub threshold: u8,
    pub score: u8,
    pub passed: bool,
    pub decision: GateDecision,
}

impl QualityGate {
    /// §3: `score < threshold - 20 ⇒ decision = rejected`.
    pub fn evaluate(gate_type: VerificationType, target_id: impl Into<String>, score: u8, threshold: u8) -> Self {
        let passed = score >= threshold;
        let decision = if passed {
            GateDecision::Approved
        } else if (threshold as i32 - score as i32) > 20 {
            GateDecision::Rejected
        } else {
            GateDecision::NeedsRevision
        };
        Self {
            gate_type,
            target_id: target_id.into(),
            threshold,
            score,
            passed,
            decision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_69_threshold_70_needs_revision() {
        let gate = QualityGate::evaluate(VerificationType::Plan, "p1", 69, 70);
        assert!(!gate.passed);
        assert_eq!(gate.decision, GateDecision::NeedsRevision);
    }

    #[test]
    fn score_49_threshold_70_is_rejected() {
        let gate = QualityGate::evaluate(VerificationType::Plan, "p1", 49, 70);
        assert_eq!(gate.decision, GateDecision::Rejected);
    }

    #[test]
    fn score_at_threshold_passes() {
        let gate = QualityGate::evaluate(VerificationType::Code, "c1", 60, 60);
        assert!(gate.passed);
        assert_eq!(gate.decision, GateDecision::Approved);
    }
}
