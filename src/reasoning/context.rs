use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::generation::TokenBudget;

/// Cooperative wall-clock deadline for one run.
///
/// Checked before a collaborator call starts. Calls already in flight run to
/// completion or to their own timeout.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn new(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn expired(&self) -> bool {
        self.started.elapsed() >= self.limit
    }

    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.started.elapsed())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Counters for collaborator calls made during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStats {
    /// Retriever invocations, including failed ones.
    pub retrieval_calls: u32,
    pub retrieval_failures: u32,
    /// AnswerGenerator invocations that reached the provider.
    pub generation_calls: u32,
    pub generation_failures: u32,
    /// Individual provider attempts, retries included.
    pub provider_attempts: u32,
    pub decomposition_calls: u32,
    pub rewrite_calls: u32,
    pub step_answer_calls: u32,
    pub synthesis_calls: u32,
    pub judge_calls: u32,
    pub evaluations: u32,
    /// Collaborator calls that returned successfully.
    pub successful_calls: u32,
}

/// Request-scoped mutable state threaded through one run.
#[derive(Debug)]
pub struct RunContext {
    pub budget: TokenBudget,
    pub deadline: Deadline,
    pub stats: CallStats,
    pub timed_out: bool,
}

impl RunContext {
    pub fn new(token_budget: u32, timeout: Duration) -> Self {
        Self {
            budget: TokenBudget::new(token_budget),
            deadline: Deadline::new(timeout),
            stats: CallStats::default(),
            timed_out: false,
        }
    }

    /// Check the deadline, latching `timed_out` once it has passed.
    pub fn deadline_passed(&mut self) -> bool {
        if self.deadline.expired() {
            self.timed_out = true;
        }
        self.timed_out
    }
}
