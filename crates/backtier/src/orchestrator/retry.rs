//! Retry policy and the pure retry state machine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::executor::Classification;

/// Exponential backoff between attempts of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    #[serde(default = "RetryPolicy::default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt in milliseconds.
    #[serde(default = "RetryPolicy::default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Maximum delay between attempts in milliseconds.
    #[serde(default = "RetryPolicy::default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Symmetric jitter as a fraction of the delay (0.2 = ±20%).
    #[serde(default)]
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            initial_delay_ms: Self::default_initial_delay_ms(),
            max_delay_ms: Self::default_max_delay_ms(),
            jitter_ratio: 0.0,
        }
    }
}

impl RetryPolicy {
    fn default_max_attempts() -> u32 {
        3
    }

    fn default_initial_delay_ms() -> u64 {
        30_000
    }

    fn default_max_delay_ms() -> u64 {
        600_000
    }

    /// Delay after failed attempt `attempt` (1-based).
    ///
    /// Delay = min(initial * 2^(attempt-1), max), then jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let base = self.initial_delay_ms.saturating_mul(1u64 << exp);
        let capped = base.min(self.max_delay_ms);

        if self.jitter_ratio <= 0.0 {
            return Duration::from_millis(capped);
        }
        let ratio = self.jitter_ratio.min(1.0);
        let factor = 1.0 - ratio + rand::random::<f64>() * 2.0 * ratio;
        Duration::from_millis((capped as f64 * factor) as u64)
    }
}

// ============================================================================
// State machine
// ============================================================================

/// What to do after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Succeeded,
    RetryAfter(Duration),
    GiveUp { permanent: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Attempting,
    Backoff,
    Done,
}

/// `pending → attempting → {succeeded, backoff → attempting, gave up}`
///
/// Pure: the caller performs the attempts and the sleeps.
#[derive(Debug, Clone)]
pub struct RetryMachine {
    policy: RetryPolicy,
    state: State,
    attempts: u32,
    elapsed_backoff: Duration,
}

impl RetryMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: State::Pending,
            attempts: 0,
            elapsed_backoff: Duration::ZERO,
        }
    }

    /// Begin the first attempt. Returns its 1-based number.
    pub fn start(&mut self) -> u32 {
        debug_assert_eq!(self.state, State::Pending);
        self.begin()
    }

    /// Begin the next attempt after a backoff. Returns its 1-based number.
    pub fn resume(&mut self) -> u32 {
        debug_assert_eq!(self.state, State::Backoff);
        self.begin()
    }

    fn begin(&mut self) -> u32 {
        self.state = State::Attempting;
        self.attempts += 1;
        self.attempts
    }

    /// Record the current attempt's outcome.
    pub fn record(&mut self, classification: Classification) -> Step {
        debug_assert_eq!(self.state, State::Attempting);
        match classification {
            Classification::Success => {
                self.state = State::Done;
                Step::Succeeded
            }
            Classification::PermanentFailure => {
                self.state = State::Done;
                Step::GiveUp { permanent: true }
            }
            Classification::TransientFailure if self.attempts >= self.policy.max_attempts.max(1) => {
                self.state = State::Done;
                Step::GiveUp { permanent: false }
            }
            Classification::TransientFailure => {
                let delay = self.policy.delay_for_attempt(self.attempts);
                self.elapsed_backoff += delay;
                self.state = State::Backoff;
                Step::RetryAfter(delay)
            }
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Sum of all backoff delays handed out so far.
    pub fn elapsed_backoff(&self) -> Duration {
        self.elapsed_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 30_000,
            max_delay_ms: 600_000,
            jitter_ratio: 0.0,
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let p = policy(10);
        assert_eq!(p.delay_for_attempt(1), Duration::from_secs(30));
        assert_eq!(p.delay_for_attempt(2), Duration::from_secs(60));
        assert_eq!(p.delay_for_attempt(5), Duration::from_secs(480));
        assert_eq!(p.delay_for_attempt(6), Duration::from_secs(600));
        assert_eq!(p.delay_for_attempt(64), Duration::from_secs(600));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let p = RetryPolicy {
            jitter_ratio: 0.2,
            ..policy(3)
        };
        for _ in 0..50 {
            let ms = p.delay_for_attempt(1).as_millis();
            assert!((24_000..=36_000).contains(&ms), "{ms}");
        }
    }

    #[test]
    fn transient_then_success() {
        let mut m = RetryMachine::new(policy(3));
        assert_eq!(m.start(), 1);
        assert_eq!(
            m.record(Classification::TransientFailure),
            Step::RetryAfter(Duration::from_secs(30))
        );
        assert_eq!(m.resume(), 2);
        assert_eq!(m.record(Classification::Success), Step::Succeeded);
        assert_eq!(m.attempts(), 2);
        assert_eq!(m.elapsed_backoff(), Duration::from_secs(30));
    }

    #[test]
    fn transient_exhausts_budget() {
        let mut m = RetryMachine::new(policy(3));
        m.start();
        assert!(matches!(m.record(Classification::TransientFailure), Step::RetryAfter(_)));
        m.resume();
        assert!(matches!(m.record(Classification::TransientFailure), Step::RetryAfter(_)));
        m.resume();
        assert_eq!(
            m.record(Classification::TransientFailure),
            Step::GiveUp { permanent: false }
        );
        assert_eq!(m.attempts(), 3);
        assert_eq!(m.elapsed_backoff(), Duration::from_secs(90));
    }

    #[test]
    fn permanent_gives_up_immediately() {
        let mut m = RetryMachine::new(policy(3));
        m.start();
        assert_eq!(
            m.record(Classification::PermanentFailure),
            Step::GiveUp { permanent: true }
        );
        assert_eq!(m.attempts(), 1);
        assert_eq!(m.elapsed_backoff(), Duration::ZERO);
    }

    #[test]
    fn zero_max_attempts_still_runs_once() {
        let mut m = RetryMachine::new(policy(0));
        m.start();
        assert_eq!(
            m.record(Classification::TransientFailure),
            Step::GiveUp { permanent: false }
        );
    }

    #[test]
    fn policy_fields_default_when_omitted() {
        let p: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 5}"#).unwrap();
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.initial_delay_ms, 30_000);
        assert_eq!(p.max_delay_ms, 600_000);
        assert_eq!(p.jitter_ratio, 0.0);
    }
}
