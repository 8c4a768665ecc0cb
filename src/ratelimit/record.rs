//! Per-identifier throttling state and the decisions derived from it.

use serde::Serialize;

use super::policy::{block_duration_ms, Policy};

/// Counters and penalty state for one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Record {
    /// Attempts counted in the current window
    pub count: u32,
    /// When the current window ends (epoch ms)
    pub window_reset_at: u64,
    /// Most recent counted or violating attempt (epoch ms)
    pub last_attempt_at: u64,
    /// Most recent violation; blocks are measured from here (epoch ms)
    pub blocked_since: u64,
    /// Consecutive window exhaustions not yet decayed
    pub penalty_level: u32,
    /// Base block length of the policy that last evaluated this record
    pub block_base_ms: u64,
}

impl Record {
    /// A record for a first-seen identifier, with this attempt counted.
    pub(crate) fn first_attempt(now: u64, policy: &Policy) -> Self {
        Self {
            count: 1,
            window_reset_at: window_end(now, policy),
            last_attempt_at: now,
            blocked_since: 0,
            penalty_level: 0,
            block_base_ms: policy.base_block_duration_ms,
        }
    }

    /// End of the current block, if a penalty is pending.
    pub fn block_until(&self) -> Option<u64> {
        if self.penalty_level == 0 {
            return None;
        }
        Some(
            self.blocked_since
                .saturating_add(block_duration_ms(self.block_base_ms, self.penalty_level)),
        )
    }

    /// Whether the counting window has run out. A request landing exactly on
    /// the boundary belongs to the next window.
    pub fn window_expired(&self, now: u64) -> bool {
        now >= self.window_reset_at
    }

    /// Start a new window with this attempt counted. The penalty is left
    /// alone; only the sweep lowers it.
    pub(crate) fn open_window(&mut self, now: u64, policy: &Policy) {
        self.count = 1;
        self.window_reset_at = window_end(now, policy);
        self.last_attempt_at = now;
    }
}

fn window_end(now: u64, policy: &Policy) -> u64 {
    // Keep the window strictly after its opening instant.
    now.saturating_add(policy.window_duration_ms.max(1))
}

/// Outcome of evaluating one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Attempts left in the current window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
    /// When the current window ends (epoch ms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<u64>,
    /// Earliest time a retry can succeed (epoch ms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Whether the identifier is serving a penalty block
    pub blocked: bool,
}

impl Decision {
    pub(crate) fn allow(remaining: u32, reset_at: u64) -> Self {
        Self {
            allowed: true,
            remaining: Some(remaining),
            reset_at: Some(reset_at),
            retry_after: None,
            blocked: false,
        }
    }

    pub(crate) fn blocked(retry_after: u64) -> Self {
        Self {
            allowed: false,
            remaining: None,
            reset_at: None,
            retry_after: Some(retry_after),
            blocked: true,
        }
    }

    pub(crate) fn over_limit(reset_at: u64, retry_after: u64, blocked: bool) -> Self {
        Self {
            allowed: false,
            remaining: Some(0),
            reset_at: Some(reset_at),
            retry_after: Some(retry_after),
            blocked,
        }
    }
}
