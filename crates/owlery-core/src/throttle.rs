//! Attempt throttling.
//!
//! When a user has no relay list anywhere, every lookup for them fails
//! and, without a brake, gets retried on the next render. The attempt
//! registry is a process-wide memo of "we last tried this at T" that
//! callers consult before scheduling work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::{Clock, SystemClock};

/// Default minimum interval between attempts for the same key.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Process-wide memo of last-attempt times, keyed by caller-chosen
/// strings.
pub struct AttemptRegistry {
    min_interval_secs: u64,
    clock: Arc<dyn Clock>,
    last_attempt: Mutex<HashMap<String, u64>>,
}

impl AttemptRegistry {
    /// A registry with the default one-hour interval and the wall clock.
    pub fn once_an_hour() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL, Arc::new(SystemClock))
    }

    pub fn new(min_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            min_interval_secs: min_interval.as_secs(),
            clock,
            last_attempt: Mutex::new(HashMap::new()),
        }
    }

    /// Check-and-record: returns true when no attempt for `key` happened
    /// within the minimum interval, recording the current time as the new
    /// last attempt. Returns false (and records nothing) otherwise.
    pub fn should_attempt(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut last = self.last_attempt.lock();
        match last.get(key) {
            Some(&t) if now < t + self.min_interval_secs => false,
            _ => {
                last.insert(key.to_string(), now);
                true
            }
        }
    }
}

impl Default for AttemptRegistry {
    fn default() -> Self {
        Self::once_an_hour()
    }
}
