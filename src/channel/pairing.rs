//! Brute-force guard for `/pair` token attempts.
//!
//! Failures are counted per sender inside a sliding window. Reaching
//! `max_failures` inside one window locks the sender out for `block`.
//! State is process-lifetime only and owned by one [`PairingGuard`].

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::config::PairingConfig;

/// Lockout thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingPolicy {
    /// Failures inside one window that trigger a lockout.
    pub max_failures: u32,
    /// Length of the failure-counting window.
    pub window: Duration,
    /// How long a lockout lasts.
    pub block: Duration,
}

impl PairingPolicy {
    /// Build the policy from config values.
    pub fn from_config(config: &PairingConfig) -> Self {
        Self {
            max_failures: config.max_failures.max(1),
            window: secs(config.window_secs),
            block: secs(config.block_secs),
        }
    }
}

impl Default for PairingPolicy {
    fn default() -> Self {
        Self::from_config(&PairingConfig::default())
    }
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000))
}

/// Failure bookkeeping for one sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingAttemptState {
    /// Failures in the current window.
    pub count: u32,
    /// When the current window opened.
    pub window_started_at: DateTime<Utc>,
    /// End of the active lockout, if any.
    pub blocked_until: Option<DateTime<Utc>>,
}

impl PairingAttemptState {
    fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }

    fn window_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now.signed_duration_since(self.window_started_at) > window
    }
}

/// Outcome of one pairing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingDecision {
    /// No token configured; pairing is off.
    Disabled,
    /// The sender is locked out.
    LockedOut {
        /// Time left until attempts are accepted again.
        retry_after: Duration,
    },
    /// Token matched; the sender's failure state was cleared.
    Paired,
    /// Token did not match.
    Invalid {
        /// Failures recorded in the current window.
        failures: u32,
    },
}

/// Per-sender sliding-window lockout around a shared pairing token.
#[derive(Debug)]
pub struct PairingGuard {
    token: Option<String>,
    policy: PairingPolicy,
    attempts: Mutex<HashMap<String, PairingAttemptState>>,
}

impl PairingGuard {
    /// Create a guard. An empty token is treated as no token.
    pub fn new(token: Option<String>, policy: PairingPolicy) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
            policy,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a pairing token is configured.
    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    /// The active lockout policy.
    pub fn policy(&self) -> PairingPolicy {
        self.policy
    }

    /// Evaluate a pairing attempt by `sender` at `now`.
    pub fn attempt(&self, sender: &str, supplied: &str, now: DateTime<Utc>) -> PairingDecision {
        let Some(ref expected) = self.token else {
            return PairingDecision::Disabled;
        };

        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let window = self.policy.window;
        attempts.retain(|_, s| s.is_blocked(now) || !s.window_expired(now, window));

        if let Some(until) = attempts
            .get(sender)
            .and_then(|s| s.blocked_until)
            .filter(|until| *until > now)
        {
            return PairingDecision::LockedOut {
                retry_after: until.signed_duration_since(now),
            };
        }

        if constant_time_eq(supplied.as_bytes(), expected.as_bytes()) {
            attempts.remove(sender);
            return PairingDecision::Paired;
        }

        let state = attempts
            .entry(sender.to_owned())
            .and_modify(|s| {
                if s.window_expired(now, window) {
                    *s = fresh_window(now);
                } else {
                    s.count = s.count.saturating_add(1);
                }
            })
            .or_insert_with(|| fresh_window(now));

        if state.count >= self.policy.max_failures {
            let until = now
                .checked_add_signed(self.policy.block)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            state.blocked_until = Some(until);
            return PairingDecision::LockedOut {
                retry_after: self.policy.block,
            };
        }

        PairingDecision::Invalid {
            failures: state.count,
        }
    }

    /// Time left on an active lockout for `sender`, if any.
    pub fn locked_out_for(&self, sender: &str, now: DateTime<Utc>) -> Option<Duration> {
        let attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts
            .get(sender)
            .and_then(|s| s.blocked_until)
            .filter(|until| *until > now)
            .map(|until| until.signed_duration_since(now))
    }

    /// Snapshot of the failure state for `sender`.
    pub fn state_for(&self, sender: &str) -> Option<PairingAttemptState> {
        let attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.get(sender).cloned()
    }
}

fn fresh_window(now: DateTime<Utc>) -> PairingAttemptState {
    PairingAttemptState {
        count: 1,
        window_started_at: now,
        blocked_until: None,
    }
}

/// Compare `supplied` against `expected` in time that depends only on the
/// length of `expected`.
///
/// A length mismatch is folded into the accumulator instead of returning
/// early.
pub fn constant_time_eq(supplied: &[u8], expected: &[u8]) -> bool {
    let mut diff = supplied.len() ^ expected.len();
    for (i, y) in expected.iter().enumerate() {
        let x = supplied.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}
