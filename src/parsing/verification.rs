//! Verification response parsing (§4.6, §6): a uniform schema across all
//! seven `VerificationType`s — `SCORE`, one of
//! `VERIFIED`/`APPROVED`/`GOAL_ACHIEVED`, `RECOMMENDATION`, `REASON` — plus
//! type-specific fields carried through untouched as `extra`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::{VerificationResult, VerificationType};

static SCORE_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)SCORE:\s*(\d+)").unwrap());
static VERDICT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(VERIFIED|APPROVED|GOAL_ACHIEVED):\s*(YES|NO|TRUE|FALSE)").unwrap());
static RECOMMENDATION_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)RECOMMENDATION:\s*(.+)").unwrap());
static REASON_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)REASON:\s*(.+)").unwrap());

/// Fields present but unmatched default as documented in §6: score 50,
/// verified false, a generic recommendation/reason.
pub fn parse_verification_response(
    verification_type: VerificationType,
    target_id: impl Into<String>,
    response: &str,
) -> VerificationResult {
    let score = SCORE_LINE
        .captures(response)
        .and_then(|c| c[1].parse::<u8>().ok())
        .unwrap_or(50)
        .min(100);

    let verified = VERDICT_LINE
        .captures(response)
        .map(|c| matches!(c[2].to_uppercase().as_str(), "YES" | "TRUE"))
        .unwrap_or(false);

    let recommendation = RECOMMENDATION_LINE
        .captures(response)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_else(|| "continue".to_string());

    let reason = REASON_LINE
        .captures(response)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_else(|| "no reason provided".to_string());

    VerificationResult {
        verification_type,
        target_id: target_id.into(),
        score,
        verified,
        recommendation,
        reason,
        extra: serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_response() {
        let text = "VERIFIED: YES\nSCORE: 90\nRECOMMENDATION: continue\nREASON: all acceptance criteria met";
        let result = parse_verification_response(VerificationType::Step, "step-1", text);
        assert!(result.verified);
        assert_eq!(result.score, 90);
    }

    #[test]
    fn unmatched_fields_default() {
        let result = parse_verification_response(VerificationType::Goal, "goal", "not sure honestly");
        assert!(!result.verified);
        assert_eq!(result.score, 50);
        assert_eq!(result.recommendation, "continue");
    }

    #[test]
    fn goal_achieved_keyword_is_recognized() {
        let text = "GOAL_ACHIEVED: YES\nSCORE: 95\nREASON: feature complete";
        let result = parse_verification_response(VerificationType::Goal, "goal", text);
        assert!(result.verified);
    }
}
