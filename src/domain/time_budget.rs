//! `TimeBudget` (§3) — phase allocations and expiry tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PhaseAllocations {
    pub planning_ms: i64,
    pub execution_ms: i64,
    pub verification_ms: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PhaseElapsed {
    pub planning_ms: i64,
    pub execution_ms: i64,
    pub verification_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeBudget {
    pub total_ms: i64,
    pub started_at: DateTime<Utc>,
    pub phase_allocations: PhaseAllocations,
    pub phase_elapsed: PhaseElapsed,
}

impl TimeBudget {
    const PLANNING_CAP_MS: i64 = 15 * 60 * 1000;
    const VERIFICATION_CAP_MS: i64 = 10 * 60 * 1000;

    pub fn new(total_ms: i64) -> Self {
        let planning_ms = ((total_ms as f64) * 0.10).round() as i64;
        let verification_ms = ((total_ms as f64) * 0.10).round() as i64;
        let planning_ms = planning_ms.min(Self::PLANNING_CAP_MS);
        let verification_ms = verification_ms.min(Self::VERIFICATION_CAP_MS);
        let execution_ms = ((total_ms as f64) * 0.80).round() as i64;
        Self {
            total_ms,
            started_at: Utc::now(),
            phase_allocations: PhaseAllocations {
                planning_ms,
                execution_ms,
                verification_ms,
            },
            phase_elapsed: PhaseElapsed::default(),
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed_ms() >= self.total_ms
    }

    pub fn remaining_ms(&self) -> i64 {
        (self.total_ms - self.elapsed_ms()).max(0)
    }
}
