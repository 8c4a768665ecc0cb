//! The record store and decision engine.
//!
//! Records live in a sharded concurrent map. Each evaluation holds the shard
//! lock of its key for the whole read-modify-write, so evaluations of one
//! identifier are linearizable while unrelated identifiers rarely contend.
//! The sweep takes the same shard locks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::policy::Policy;
use super::record::{Decision, Record};

/// In-memory throttling state shared by request handlers and the sweeper.
pub struct RecordStore {
    /// Records indexed by identifier
    records: DashMap<String, Record>,
    /// Source of the current time
    clock: Arc<dyn Clock>,
    allowed_total: AtomicU64,
    denied_total: AtomicU64,
}

/// Point-in-time counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Records currently held
    pub records: usize,
    /// Records with a pending penalty
    pub penalized: usize,
    /// Evaluations allowed since start
    pub allowed_total: u64,
    /// Evaluations denied since start
    pub denied_total: u64,
}

/// What one cleanup pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Expired, unpenalized records deleted
    pub removed: usize,
    /// Records whose penalty level dropped by one
    pub decayed: usize,
    /// Records left in place
    pub retained: usize,
}

impl RecordStore {
    /// Create a store backed by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store with a custom time source.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
            allowed_total: AtomicU64::new(0),
            denied_total: AtomicU64::new(0),
        }
    }

    /// Current time according to the store's clock.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Decide whether a request from `identifier` may proceed under `policy`,
    /// recording the attempt.
    pub fn evaluate(&self, identifier: &str, policy: &Policy) -> Decision {
        self.evaluate_timed(identifier, policy).0
    }

    /// Like [`RecordStore::evaluate`], also returning the instant the
    /// decision was taken at.
    pub(crate) fn evaluate_timed(&self, identifier: &str, policy: &Policy) -> (Decision, u64) {
        let now = self.clock.now_ms();

        trace!(identifier = %identifier, now = now, "Evaluating request");

        let (decision, created) = match self.records.entry(identifier.to_string()) {
            Entry::Vacant(slot) => {
                let record = slot.insert(Record::first_attempt(now, policy));
                let decision = Decision::allow(
                    policy.max_attempts.saturating_sub(1),
                    record.window_reset_at,
                );
                (decision, true)
            }
            Entry::Occupied(mut slot) => (decide(slot.get_mut(), now, policy), false),
        };

        // Shard lock released; log outside the critical section.
        if created {
            debug!(
                identifier = %identifier,
                window_reset_at = ?decision.reset_at,
                "Created throttle record"
            );
        }

        if decision.allowed {
            self.allowed_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied_total.fetch_add(1, Ordering::Relaxed);
            debug!(
                identifier = %identifier,
                blocked = decision.blocked,
                retry_after = ?decision.retry_after,
                "Request throttled"
            );
        }

        (decision, now)
    }

    /// Forget everything about an identifier.
    pub fn clear(&self, identifier: &str) {
        if self.records.remove(identifier).is_some() {
            debug!(identifier = %identifier, "Cleared throttle record");
        }
    }

    /// Snapshot of an identifier's record, if one exists.
    pub fn status(&self, identifier: &str) -> Option<Record> {
        self.records.get(identifier).map(|r| *r)
    }

    /// Delete expired records and decay served penalties.
    ///
    /// A record with no penalty is deleted once its window has expired. A
    /// penalized record loses one level per pass once its current block has
    /// elapsed and its window has expired; it is deleted on a later pass after
    /// reaching level zero.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now_ms();
        let mut report = SweepReport::default();

        self.records.retain(|_, record| {
            if record.penalty_level == 0 {
                if record.window_expired(now) {
                    report.removed += 1;
                    return false;
                }
            } else if record.window_expired(now)
                && record.block_until().is_some_and(|until| now >= until)
            {
                record.penalty_level -= 1;
                report.decayed += 1;
            }
            report.retained += 1;
            true
        });

        report
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no records are held.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Collect observability counters.
    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            allowed_total: self.allowed_total.load(Ordering::Relaxed),
            denied_total: self.denied_total.load(Ordering::Relaxed),
            ..StoreStats::default()
        };
        for entry in self.records.iter() {
            stats.records += 1;
            if entry.penalty_level > 0 {
                stats.penalized += 1;
            }
        }
        stats
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply one attempt to an existing record.
fn decide(record: &mut Record, now: u64, policy: &Policy) -> Decision {
    // A blocked client accrues no window usage.
    if policy.progressive_penalty && record.penalty_level > 0 {
        let block_until = record
            .blocked_since
            .saturating_add(policy.block_duration_ms(record.penalty_level));
        if now < block_until {
            return Decision::blocked(block_until);
        }
    }

    if record.window_expired(now) {
        record.open_window(now, policy);
        return Decision::allow(policy.max_attempts.saturating_sub(1), record.window_reset_at);
    }

    if record.count >= policy.max_attempts {
        record.penalty_level = record
            .penalty_level
            .saturating_add(1)
            .min(policy.max_penalty_level.max(1));
        record.last_attempt_at = now;
        record.blocked_since = now;
        record.block_base_ms = policy.base_block_duration_ms;

        let retry_after = if policy.progressive_penalty {
            now.saturating_add(policy.block_duration_ms(record.penalty_level))
        } else {
            record.window_reset_at
        };
        return Decision::over_limit(record.window_reset_at, retry_after, policy.progressive_penalty);
    }

    record.count += 1;
    record.last_attempt_at = now;
    Decision::allow(
        policy.max_attempts.saturating_sub(record.count),
        record.window_reset_at,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    const START: u64 = 1_700_000_000_000;

    fn scenario_policy() -> Policy {
        Policy {
            window_duration_ms: 1_000,
            max_attempts: 3,
            progressive_penalty: true,
            base_block_duration_ms: 1_000,
            max_penalty_level: 8,
        }
    }

    fn store_at(start: u64) -> (RecordStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        (RecordStore::with_clock(clock.clone()), clock)
    }

    /// Exhaust the window and return the denying decision.
    fn exhaust(store: &RecordStore, id: &str, policy: &Policy) -> Decision {
        for _ in 0..policy.max_attempts {
            assert!(store.evaluate(id, policy).allowed);
        }
        store.evaluate(id, policy)
    }

    #[test]
    fn test_first_seen_identifier_is_allowed() {
        let (store, _clock) = store_at(START);
        for (i, policy) in [Policy::CONTACT_SUBMISSION, Policy::READ_API, scenario_policy()]
            .iter()
            .enumerate()
        {
            let decision = store.evaluate(&format!("fresh-{}", i), policy);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, Some(policy.max_attempts - 1));
            assert!(!decision.blocked);
        }
    }

    #[test]
    fn test_ceiling_enforced_within_window() {
        let (store, clock) = store_at(START);
        let policy = Policy::READ_API;

        for i in 0..policy.max_attempts {
            let decision = store.evaluate("client", &policy);
            assert!(decision.allowed, "attempt {} should pass", i + 1);
            assert_eq!(decision.remaining, Some(policy.max_attempts - i - 1));
            clock.advance_ms(1);
        }

        let decision = store.evaluate("client", &policy);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, Some(0));
    }

    #[test]
    fn test_count_never_exceeds_ceiling() {
        let (store, _clock) = store_at(START);
        let policy = Policy::READ_API;
        for _ in 0..(policy.max_attempts * 2) {
            store.evaluate("client", &policy);
        }
        assert_eq!(store.status("client").unwrap().count, policy.max_attempts);
    }

    #[test]
    fn test_window_reset_after_waiting() {
        let (store, clock) = store_at(START);
        let policy = Policy {
            base_block_duration_ms: 200,
            ..scenario_policy()
        };

        let denied = exhaust(&store, "client", &policy);
        assert!(!denied.allowed);

        clock.advance_ms(policy.window_duration_ms + 1);
        let decision = store.evaluate("client", &policy);

        assert!(decision.allowed);
        assert_eq!(decision.remaining, Some(policy.max_attempts - 1));
        let record = store.status("client").unwrap();
        assert_eq!(record.count, 1);
        // Penalty is tracked independently of counting.
        assert_eq!(record.penalty_level, 1);
    }

    #[test]
    fn test_window_reset_without_penalty_policy() {
        let (store, clock) = store_at(START);
        let policy = Policy {
            window_duration_ms: 1_000,
            max_attempts: 2,
            ..Policy::READ_API
        };

        exhaust(&store, "client", &policy);
        clock.advance_ms(1_001);

        assert!(store.evaluate("client", &policy).allowed);
        assert_eq!(store.status("client").unwrap().count, 1);
    }

    #[test]
    fn test_request_at_window_boundary_opens_new_window() {
        let (store, clock) = store_at(START);
        let policy = Policy::READ_API;

        for _ in 0..policy.max_attempts {
            store.evaluate("client", &policy);
        }
        clock.set_ms(START + policy.window_duration_ms);

        let decision = store.evaluate("client", &policy);
        assert!(decision.allowed);
        assert_eq!(
            decision.reset_at,
            Some(START + 2 * policy.window_duration_ms)
        );
    }

    #[test]
    fn test_backoff_doubles_on_consecutive_violations() {
        let (store, clock) = store_at(START);
        let base = 1_000;
        let policy = Policy {
            window_duration_ms: 3_600_000,
            max_attempts: 3,
            progressive_penalty: true,
            base_block_duration_ms: base,
            max_penalty_level: 8,
        };

        let denied = exhaust(&store, "client", &policy);
        assert_eq!(denied.retry_after, Some(START + base));
        let first = store.status("client").unwrap();
        assert_eq!(first.penalty_level, 1);

        let mut previous_block = base;
        let mut expected = base;
        for level in 2..=5u32 {
            clock.advance_ms(previous_block);
            let decision = store.evaluate("client", &policy);
            let record = store.status("client").unwrap();

            expected *= 2;
            assert!(!decision.allowed);
            assert!(decision.blocked);
            assert_eq!(record.penalty_level, level);
            assert_eq!(decision.retry_after.unwrap() - record.last_attempt_at, expected);
            previous_block = expected;
        }
    }

    #[test]
    fn test_penalty_level_is_capped() {
        let (store, clock) = store_at(START);
        let policy = Policy {
            window_duration_ms: u64::MAX / 4,
            max_attempts: 1,
            progressive_penalty: true,
            base_block_duration_ms: 10,
            max_penalty_level: 3,
        };

        store.evaluate("client", &policy);
        for _ in 0..10 {
            let decision = store.evaluate("client", &policy);
            clock.set_ms(decision.retry_after.unwrap());
        }

        let record = store.status("client").unwrap();
        assert_eq!(record.penalty_level, 3);
        let decision = store.evaluate("client", &policy);
        assert_eq!(decision.retry_after.unwrap() - clock.now_ms(), 40);
    }

    #[test]
    fn test_clear_then_evaluate_behaves_as_fresh() {
        let (store, _clock) = store_at(START);
        let policy = scenario_policy();

        exhaust(&store, "client", &policy);
        store.clear("client");
        assert!(store.status("client").is_none());

        let decision = store.evaluate("client", &policy);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, Some(policy.max_attempts - 1));
        assert_eq!(store.status("client").unwrap().penalty_level, 0);
    }

    #[test]
    fn test_clear_unknown_identifier_is_noop() {
        let (store, _clock) = store_at(START);
        store.clear("nobody");
        assert!(store.is_empty());
    }

    #[test]
    fn test_scenario_a_fourth_call_blocked() {
        let (store, clock) = store_at(START);
        let policy = scenario_policy();

        for _ in 0..3 {
            assert!(store.evaluate("client", &policy).allowed);
            clock.advance_ms(100);
        }
        let decision = store.evaluate("client", &policy);

        assert!(!decision.allowed);
        assert!(decision.blocked);
        assert_eq!(decision.retry_after, Some(clock.now_ms() + 1_000));
        assert_eq!(decision.reset_at, Some(START + 1_000));
    }

    #[test]
    fn test_scenario_b_allowed_after_block_and_window_expire() {
        let (store, clock) = store_at(START);
        let policy = scenario_policy();

        let denied = exhaust(&store, "client", &policy);
        assert!(denied.blocked);

        clock.advance_ms(1_500);
        let decision = store.evaluate("client", &policy);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, Some(2));
    }

    #[test]
    fn test_served_penalty_does_not_rearm_on_allowed_requests() {
        let (store, clock) = store_at(START);
        let policy = scenario_policy();

        exhaust(&store, "client", &policy);
        clock.advance_ms(1_500);
        assert!(store.evaluate("client", &policy).allowed);

        clock.advance_ms(1);
        let sixth = store.evaluate("client", &policy);
        assert!(sixth.allowed);
        assert!(!sixth.blocked);
        assert_eq!(sixth.remaining, Some(1));

        clock.advance_ms(1);
        assert_eq!(store.evaluate("client", &policy).remaining, Some(0));

        let record = store.status("client").unwrap();
        assert_eq!(record.count, 3);
        assert_eq!(record.penalty_level, 1);
        assert_eq!(record.blocked_since, START);
    }

    #[test]
    fn test_violation_after_recovery_without_decay_escalates() {
        let (store, clock) = store_at(START);
        let policy = scenario_policy();

        exhaust(&store, "client", &policy);
        clock.advance_ms(1_500);

        let denied = exhaust(&store, "client", &policy);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(clock.now_ms() + 2 * policy.base_block_duration_ms));
        assert_eq!(store.status("client").unwrap().penalty_level, 2);
    }

    #[test]
    fn test_violation_after_decay_restarts_at_base_block() {
        let (store, clock) = store_at(START);
        let policy = scenario_policy();

        exhaust(&store, "client", &policy);
        clock.advance_ms(2_000);
        assert_eq!(store.sweep().decayed, 1);
        assert_eq!(store.status("client").unwrap().penalty_level, 0);

        let denied = exhaust(&store, "client", &policy);
        assert!(denied.blocked);
        assert_eq!(denied.retry_after, Some(clock.now_ms() + policy.base_block_duration_ms));
        assert_eq!(store.status("client").unwrap().penalty_level, 1);
    }

    #[test]
    fn test_scenario_c_blocked_retry_unchanged() {
        let (store, clock) = store_at(START);
        let policy = scenario_policy();

        let denied = exhaust(&store, "client", &policy);
        let before = store.status("client").unwrap();

        clock.advance_ms(500);
        let decision = store.evaluate("client", &policy);

        assert!(!decision.allowed);
        assert!(decision.blocked);
        assert_eq!(decision.retry_after, denied.retry_after);
        // Blocked attempts do not touch the record.
        assert_eq!(store.status("client").unwrap(), before);
    }

    #[test]
    fn test_scenario_d_identifiers_are_isolated() {
        let (store, _clock) = store_at(START);
        let policy = scenario_policy();

        let denied = exhaust(&store, "alice", &policy);
        assert!(!denied.allowed);

        let decision = store.evaluate("bob", &policy);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, Some(2));
        assert_eq!(store.status("bob").unwrap().penalty_level, 0);
        assert_eq!(store.status("alice").unwrap().count, 3);
    }

    #[test]
    fn test_non_progressive_denial_retries_at_window_reset() {
        let (store, _clock) = store_at(START);
        let policy = Policy {
            max_attempts: 2,
            ..Policy::READ_API
        };

        let decision = exhaust(&store, "client", &policy);
        assert!(!decision.allowed);
        assert!(!decision.blocked);
        assert_eq!(decision.retry_after, decision.reset_at);
        assert_eq!(decision.reset_at, Some(START + policy.window_duration_ms));
    }

    #[test]
    fn test_sweep_removes_expired_records() {
        let (store, clock) = store_at(START);
        let policy = Policy::READ_API;

        store.evaluate("old", &policy);
        clock.advance_ms(policy.window_duration_ms / 2);
        store.evaluate("new", &policy);

        clock.advance_ms(policy.window_duration_ms / 2);
        let report = store.sweep();

        assert_eq!(report.removed, 1);
        assert_eq!(report.retained, 1);
        assert!(store.status("old").is_none());
        assert!(store.status("new").is_some());
    }

    #[test]
    fn test_sweep_keeps_active_penalty_past_window() {
        let (store, clock) = store_at(START);
        let policy = Policy {
            base_block_duration_ms: 10_000,
            ..scenario_policy()
        };

        exhaust(&store, "client", &policy);
        clock.advance_ms(2_000);

        let report = store.sweep();
        assert_eq!(report.removed, 0);
        assert_eq!(report.decayed, 0);
        assert_eq!(store.status("client").unwrap().penalty_level, 1);
    }

    #[test]
    fn test_sweep_decays_then_removes() {
        let (store, clock) = store_at(START);
        let policy = scenario_policy();

        exhaust(&store, "client", &policy);
        clock.advance_ms(policy.block_duration_ms(1) + policy.window_duration_ms);

        let first = store.sweep();
        assert_eq!(first.decayed, 1);
        assert_eq!(store.status("client").unwrap().penalty_level, 0);

        let second = store.sweep();
        assert_eq!(second.removed, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_sweep_decays_one_level_per_pass() {
        let (store, clock) = store_at(START);
        let policy = Policy {
            window_duration_ms: 60_000,
            ..scenario_policy()
        };

        exhaust(&store, "client", &policy);
        clock.advance_ms(1_000);
        store.evaluate("client", &policy);
        assert_eq!(store.status("client").unwrap().penalty_level, 2);

        clock.advance_ms(120_000);
        store.sweep();
        assert_eq!(store.status("client").unwrap().penalty_level, 1);
        store.sweep();
        assert_eq!(store.status("client").unwrap().penalty_level, 0);
        store.sweep();
        assert!(store.status("client").is_none());
    }

    #[test]
    fn test_sweep_does_not_decay_inside_live_window() {
        let (store, clock) = store_at(START);
        let policy = Policy {
            window_duration_ms: 60_000,
            ..scenario_policy()
        };

        exhaust(&store, "client", &policy);
        clock.advance_ms(5_000);

        assert_eq!(store.sweep().decayed, 0);
        assert_eq!(store.status("client").unwrap().penalty_level, 1);
    }

    #[test]
    fn test_stats_track_decisions() {
        let (store, _clock) = store_at(START);
        let policy = scenario_policy();

        exhaust(&store, "alice", &policy);
        store.evaluate("bob", &policy);

        let stats = store.stats();
        assert_eq!(stats.records, 2);
        assert_eq!(stats.penalized, 1);
        assert_eq!(stats.allowed_total, 4);
        assert_eq!(stats.denied_total, 1);
    }

    #[test]
    fn test_concurrent_evaluations_respect_ceiling() {
        let (store, _clock) = store_at(START);
        let policy = Policy {
            max_attempts: 100,
            ..Policy::READ_API
        };
        let allowed = AtomicU64::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        if store.evaluate("shared", &policy).allowed {
                            allowed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(allowed.load(Ordering::Relaxed), 100);
        assert_eq!(store.status("shared").unwrap().count, 100);
    }
}
