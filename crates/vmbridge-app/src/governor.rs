//! Recovery budget across outages.
//!
//! The supervisor's backoff bounds a single outage. The [`RecoveryGovernor`]
//! bounds how many outages per target are recovered automatically: each
//! outage consumes one attempt, and the count only resets after a quiet
//! period with no outage. Without it, a target that crashes right after
//! every successful reconnect would be reconnected forever.
//!
//! One governor is shared by every supervisor in the process. Records are
//! keyed by target id, so targets never consume each other's budget.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use vmbridge_core::prelude::*;

/// Default number of automatic recoveries per window.
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Default quiet period after which a target's count resets.
pub const DEFAULT_RESET_WINDOW: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorPolicy {
    pub max_attempts: u32,
    pub reset_window: Duration,
}

impl Default for GovernorPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
            reset_window: DEFAULT_RESET_WINDOW,
        }
    }
}

/// Recovery history for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryRecord {
    /// Attempts since the last reset, refused ones included.
    pub count: u32,
    pub last_attempt: Instant,
}

#[derive(Debug, Default)]
pub struct RecoveryGovernor {
    policy: GovernorPolicy,
    records: Mutex<HashMap<String, RecoveryRecord>>,
}

impl RecoveryGovernor {
    pub fn new(policy: GovernorPolicy) -> Self {
        Self {
            policy,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> GovernorPolicy {
        self.policy
    }

    /// Ask whether `target` may start another recovery now.
    pub fn attempt(&self, target: &str) -> bool {
        self.attempt_at(target, Instant::now())
    }

    /// [`attempt`](Self::attempt) with an explicit clock.
    ///
    /// The count resets when more than `reset_window` has passed since the
    /// previous attempt. The attempt is recorded whether or not it is allowed.
    pub fn attempt_at(&self, target: &str, now: Instant) -> bool {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records.entry(target.to_string()).or_insert(RecoveryRecord {
            count: 0,
            last_attempt: now,
        });

        if now.saturating_duration_since(record.last_attempt) > self.policy.reset_window {
            debug!("Recovery budget for {} reset after quiet period", target);
            record.count = 0;
        }

        let allowed = record.count < self.policy.max_attempts;
        record.count += 1;
        record.last_attempt = now;

        if allowed {
            info!(
                "Recovery attempt {}/{} for {}",
                record.count, self.policy.max_attempts, target
            );
        } else {
            warn!(
                "Recovery budget exhausted for {} ({} attempts within {:?})",
                target, self.policy.max_attempts, self.policy.reset_window
            );
        }
        allowed
    }

    /// Forget `target`'s history (manual intervention).
    pub fn reset(&self, target: &str) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(target);
    }

    pub fn record(&self, target: &str) -> Option<RecoveryRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(target)
            .copied()
    }
}
