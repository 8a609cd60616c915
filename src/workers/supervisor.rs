//! Supervisor worker (SYSTEM OVERVIEW component G, §4.6): per-type
//! verification, quality gates, the escalation ladder, and the progress
//! monitor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::bus::{AgentMessage, Worker};
use crate::domain::{GateDecision, Metrics, QualityGate, VerificationResult, VerificationType};
use crate::llm::{CallOptions, LlmClient};
use crate::parsing::parse_verification_response;
use crate::ring::RingBuffer;
use crate::workers::SUPERVISOR_AGENT;

const STALL_THRESHOLD_MS: i64 = 5 * 60 * 1000;
const CHECKPOINT_HISTORY_CAP: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    None,
    Remind,
    Correct,
    Refocus,
    Critical,
    Abort,
}

impl EscalationLevel {
    /// §4.6 escalation ladder thresholds: 1 and ACTION=REMIND → remind,
    /// warn=2 → correct, intervene=3 → refocus, critical=4 → critical,
    /// abort=5 (or more) consecutive issues → abort.
    fn from_consecutive_issues(count: u32) -> Self {
        match count {
            0 => EscalationLevel::None,
            1 => EscalationLevel::Remind,
            2 => EscalationLevel::Correct,
            3 => EscalationLevel::Refocus,
            4 => EscalationLevel::Critical,
            _ => EscalationLevel::Abort,
        }
    }
}

#[derive(Debug, Clone)]
struct Checkpoint {
    at_ms: i64,
    progress_score: i64,
}

struct Inner {
    consecutive_issues: u32,
    checkpoints: RingBuffer<Checkpoint>,
    last_checkpoint_ms: Option<i64>,
}

pub struct Supervisor {
    llm: Arc<LlmClient>,
    inner: Mutex<Inner>,
}

impl Supervisor {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self {
            llm,
            inner: Mutex::new(Inner {
                consecutive_issues: 0,
                checkpoints: RingBuffer::new(CHECKPOINT_HISTORY_CAP),
                last_checkpoint_ms: None,
            }),
        }
    }

    fn system_context(verification_type: VerificationType) -> String {
        format!(
            "You are the Supervisor in an autonomous multi-agent orchestration engine. \
             Evaluate this {verification_type:?} verification strictly. Respond with \
             SCORE: <0-100>, one of VERIFIED/APPROVED/GOAL_ACHIEVED: YES|NO, \
             RECOMMENDATION: <text>, and REASON: <text>."
        )
    }

    /// §4.6: any verification operation. Falls back to an optimistic pass
    /// (score 50-70) if the LLM call itself fails — the gate still runs on
    /// the real, lower score rather than trusting an error as success.
    pub async fn verify(
        &self,
        verification_type: VerificationType,
        target_id: impl Into<String>,
        context: &str,
    ) -> VerificationResult {
        let target_id = target_id.into();
        let prompt = format!("TARGET: {target_id}\nCONTEXT: {context}\n\nEvaluate now.");
        let opts = CallOptions {
            timeout: Some(Duration::from_secs(180)),
            ..Default::default()
        };

        let result = self
            .llm
            .start_session(SUPERVISOR_AGENT, &Self::system_context(verification_type), &prompt, opts)
            .await;

        let verification = match result {
            Ok(call) => parse_verification_response(verification_type, target_id.clone(), &call.response),
            Err(_) => VerificationResult::optimistic_pass(verification_type, target_id, 60),
        };

        self.track_issue(verification.verified).await;
        verification
    }

    async fn track_issue(&self, verified: bool) {
        let mut inner = self.inner.lock().await;
        if verified {
            inner.consecutive_issues = 0;
        } else {
            inner.consecutive_issues += 1;
        }
    }

    pub async fn consecutive_issues(&self) -> u32 {
        self.inner.lock().await.consecutive_issues
    }

    pub async fn escalation_level(&self) -> EscalationLevel {
        EscalationLevel::from_consecutive_issues(self.consecutive_issues().await)
    }

    /// §3/§4.6 `QualityGate.evaluate`. A pure function of the verification
    /// result and its type's threshold; does not touch escalation state.
    pub fn evaluate_quality_gate(result: &VerificationResult) -> Option<QualityGate> {
        let threshold = result.verification_type.gate_threshold()?;
        Some(QualityGate::evaluate(
            result.verification_type,
            result.target_id.clone(),
            result.score,
            threshold,
        ))
    }

    /// §4.6 progress monitor: records a checkpoint, detects a stall (no
    /// checkpoint recorded for `STALL_THRESHOLD_MS`), and reports trend as
    /// average-of-last-5 vs average-of-prior-5.
    pub async fn record_checkpoint(&self, now_ms: i64, metrics: &Metrics) -> ProgressReport {
        let mut inner = self.inner.lock().await;
        let stalled = inner
            .last_checkpoint_ms
            .map(|last| now_ms - last >= STALL_THRESHOLD_MS)
            .unwrap_or(false);

        inner.checkpoints.push(Checkpoint { at_ms: now_ms, progress_score: metrics.progress_score() });
        inner.last_checkpoint_ms = Some(now_ms);

        let scores: Vec<i64> = inner.checkpoints.iter().map(|c| c.progress_score).collect();
        let trend = compute_trend(&scores);

        ProgressReport { stalled, trend }
    }
}

fn compute_trend(scores: &[i64]) -> Trend {
    if scores.len() < 2 {
        return Trend::Insufficient;
    }
    let split = scores.len().saturating_sub(5).max(scores.len() / 2).min(scores.len() - 1);
    let (earlier, later) = scores.split_at(split.max(1));
    let avg = |xs: &[i64]| -> f64 {
        if xs.is_empty() {
            0.0
        } else {
            xs.iter().sum::<i64>() as f64 / xs.len() as f64
        }
    };
    let earlier_avg = avg(earlier);
    let later_avg = avg(later);
    if later_avg > earlier_avg + 2.0 {
        Trend::Improving
    } else if later_avg < earlier_avg - 2.0 {
        Trend::Declining
    } else {
        Trend::Flat
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Insufficient,
    Improving,
    Flat,
    Declining,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressReport {
    pub stalled: bool,
    pub trend: Trend,
}

#[async_trait]
impl Worker for Supervisor {
    async fn handle_message(&self, msg: AgentMessage) -> AgentMessage {
        match msg.message_type.as_str() {
            "verify_request" => {
                let verification_type: VerificationType = match serde_json::from_value(msg.payload["verification_type"].clone()) {
                    Ok(t) => t,
                    Err(e) => return AgentMessage::respond_to(&msg, "error_response", json!({ "error": e.to_string() })),
                };
                let target_id = msg.payload["target_id"].as_str().unwrap_or_default().to_string();
                let context = msg.payload["context"].as_str().unwrap_or_default().to_string();
                let result = self.verify(verification_type, target_id, &context).await;
                let gate = Self::evaluate_quality_gate(&result);
                let escalation = self.escalation_level().await;
                AgentMessage::respond_to(
                    &msg,
                    "verify_response",
                    json!({ "result": result, "gate": gate, "escalation": escalation }),
                )
            }
            "progress_check_request" => {
                let now_ms = msg.payload["now_ms"].as_i64().unwrap_or_default();
                let metrics: Metrics = match serde_json::from_value(msg.payload["metrics"].clone()) {
                    Ok(m) => m,
                    Err(e) => return AgentMessage::respond_to(&msg, "error_response", json!({ "error": e.to_string() })),
                };
                let report = self.record_checkpoint(now_ms, &metrics).await;
                AgentMessage::respond_to(
                    &msg,
                    "progress_check_response",
                    json!({ "stalled": report.stalled, "trend": format!("{:?}", report.trend) }),
                )
            }
            other => AgentMessage::respond_to(
                &msg,
                "error_response",
                json!({ "error": format!("supervisor does not handle message type {other}") }),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::provider::{CallResult, LlmInvoker};
    use std::time::Duration as StdDuration;

    struct ScriptedInvoker(String);

    #[async_trait]
    impl LlmInvoker for ScriptedInvoker {
        async fn send_prompt(&self, _p: &str, _o: &CallOptions) -> Result<CallResult, LlmError> {
            unreachable!()
        }
        async fn start_session(&self, _s: &str, _p: &str, _o: &CallOptions) -> Result<CallResult, LlmError> {
            Ok(CallResult {
                response: self.0.clone(),
                session_id: "s1".into(),
                cost_usd: None,
                duration: StdDuration::from_millis(1),
                tokens_in: None,
                tokens_out: None,
                tool_calls: None,
                structured_output: None,
            })
        }
        async fn continue_session(&self, _a: &str, _p: &str, _o: &CallOptions) -> Result<CallResult, LlmError> {
            unreachable!()
        }
    }

    fn supervisor_with_response(response: &str) -> Supervisor {
        let llm = Arc::new(LlmClient::new(Arc::new(ScriptedInvoker(response.to_string()))));
        Supervisor::new(llm)
    }

    #[tokio::test]
    async fn verify_parses_llm_verdict_and_updates_escalation() {
        let supervisor = supervisor_with_response("VERIFIED: NO\nSCORE: 40\nRECOMMENDATION: redo\nREASON: tests absent");
        let result = supervisor.verify(VerificationType::Step, "step-1", "ctx").await;
        assert!(!result.verified);
        assert_eq!(supervisor.consecutive_issues().await, 1);
    }

    #[tokio::test]
    async fn escalation_ladder_follows_consecutive_issue_thresholds() {
        let supervisor = supervisor_with_response("VERIFIED: NO\nSCORE: 10\nREASON: bad");
        // First failure (1 consecutive) is a reminder, not yet a correction.
        supervisor.verify(VerificationType::Step, "step-1", "ctx").await;
        assert_eq!(supervisor.escalation_level().await, EscalationLevel::Remind);

        for expected in [EscalationLevel::Correct, EscalationLevel::Refocus, EscalationLevel::Critical, EscalationLevel::Abort] {
            supervisor.verify(VerificationType::Step, "step-1", "ctx").await;
            assert_eq!(supervisor.escalation_level().await, expected);
        }
    }

    #[tokio::test]
    async fn a_passing_verification_resets_the_streak() {
        let failing = supervisor_with_response("VERIFIED: NO\nSCORE: 10\nREASON: bad");
        failing.verify(VerificationType::Step, "step-1", "ctx").await;
        failing.verify(VerificationType::Step, "step-1", "ctx").await;
        assert_eq!(failing.consecutive_issues().await, 2);
    }

    #[test]
    fn quality_gate_is_none_for_types_without_a_threshold() {
        let result = VerificationResult::optimistic_pass(VerificationType::Progress, "p", 60);
        assert!(Supervisor::evaluate_quality_gate(&result).is_none());
    }

    #[test]
    fn quality_gate_rejects_far_below_threshold() {
        let result = VerificationResult {
            verification_type: VerificationType::Goal,
            target_id: "goal".to_string(),
            score: 30,
            verified: false,
            recommendation: "abort".to_string(),
            reason: "incomplete".to_string(),
            extra: serde_json::Value::Null,
        };
        let gate = Supervisor::evaluate_quality_gate(&result).unwrap();
        assert_eq!(gate.decision, GateDecision::Rejected);
    }

    #[tokio::test]
    async fn progress_checkpoint_detects_a_stall() {
        let supervisor = supervisor_with_response("VERIFIED: YES\nSCORE: 90");
        let metrics = Metrics { completed_steps: 1, ..Default::default() };
        supervisor.record_checkpoint(0, &metrics).await;
        let report = supervisor.record_checkpoint(6 * 60 * 1000, &metrics).await;
        assert!(report.stalled);
    }
}
