//! Supervisor verification results (§4.6).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationType {
    PlanPre,
    Plan,
    Code,
    Test,
    Step,
    Goal,
    Progress,
}

impl VerificationType {
    /// Quality gate threshold associated with this verification type, where
    /// applicable (§3, §6).
    pub fn gate_threshold(self) -> Option<u8> {
        match self {
            VerificationType::PlanPre | VerificationType::Plan => Some(70),
            VerificationType::Code => Some(60),
            VerificationType::Step => Some(70),
            VerificationType::Goal => Some(80),
            VerificationType::Test | VerificationType::Progress => None,
        }
    }
}

/// Uniform response schema produced by every Supervisor verification
/// operation (§4.6): `SCORE`, `VERIFIED`/`APPROVED`/`GOAL_ACHIEVED`,
/// `RECOMMENDATION`, `REASON`, plus type-specific fields carried in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verification_type: VerificationType,
    pub target_id: String,
    pub score: u8,
    pub verified: bool,
    pub recommendation: String,
    pub reason: String,
    pub extra: serde_json::Value,
}

impl VerificationResult {
    pub fn optimistic_pass(verification_type: VerificationType, target_id: impl Into<String>, score: u8) -> Self {
        Self {
            verification_type,
            target_id: target_id.into(),
            score,
            verified: true,
            recommendation: "continue".to_string(),
            reason: "verification unavailable, proceeding optimistically".to_string(),
            extra: serde_json::Value::Null,
        }
    }
}
