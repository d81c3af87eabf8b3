//! Retry state machine for notification sends.
//!
//! A send moves through `Idle → Attempting(n) → {Success, Retrying, Failed}`.
//! [`RetryMachine`] owns the transitions; the caller performs the attempts
//! and the waits, the latter through a [`Sleeper`] so tests never sleep.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::RetryConfig;
use crate::errors::{ErrorCategory, MailError};

/// Suspends the current task between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync + fmt::Debug {
    /// Waits for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Sleeper that returns immediately and remembers every requested delay.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the delays requested so far.
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.push(duration);
        }
    }
}

/// Linear backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay unit.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Returns the wait after failed attempt `attempt` (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.max(1))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// States of one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// Nothing attempted yet.
    Idle,
    /// Attempt `n` (1-indexed) in progress.
    Attempting(u32),
    /// Waiting before attempt `next`.
    Retrying {
        /// Attempt that follows the wait.
        next: u32,
        /// Wait before it.
        delay: Duration,
        /// Whether the resolution cache must be cleared first.
        invalidate_cache: bool,
    },
    /// Delivered.
    Success,
    /// Gave up.
    Failed(ErrorCategory),
}

impl SendState {
    /// Returns true for `Success` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SendState::Success | SendState::Failed(_))
    }
}

/// Drives [`SendState`] transitions for one send.
#[derive(Debug)]
pub struct RetryMachine {
    policy: RetryPolicy,
    state: SendState,
    unknown_retried: bool,
}

impl RetryMachine {
    /// Creates an idle machine.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: SendState::Idle,
            unknown_retried: false,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> SendState {
        self.state
    }

    /// Starts the first attempt.
    pub fn begin(&mut self) -> SendState {
        self.state = SendState::Attempting(1);
        self.state
    }

    /// Moves from a wait to the attempt that follows it.
    pub fn resume(&mut self) -> SendState {
        if let SendState::Retrying { next, .. } = self.state {
            self.state = SendState::Attempting(next);
        }
        self.state
    }

    /// Records a delivered attempt.
    pub fn succeed(&mut self) -> SendState {
        self.state = SendState::Success;
        self.state
    }

    /// Records a failed attempt and decides what comes next.
    pub fn fail(&mut self, error: &MailError) -> SendState {
        let attempt = match self.state {
            SendState::Attempting(n) => n,
            _ => 1,
        };
        let category = error.category();
        let remaining = attempt < self.policy.max_attempts;

        self.state = if category.is_fatal() || !remaining {
            SendState::Failed(category)
        } else if category.is_dns_class() {
            SendState::Retrying {
                next: attempt + 1,
                delay: self.policy.delay_for(attempt),
                invalidate_cache: true,
            }
        } else if !self.unknown_retried {
            self.unknown_retried = true;
            SendState::Retrying {
                next: attempt + 1,
                delay: self.policy.delay_for(attempt),
                invalidate_cache: false,
            }
        } else {
            SendState::Failed(category)
        };

        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::MailErrorKind;
    use rstest::rstest;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_linear_backoff() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(3));
    }

    #[rstest]
    #[case(MailErrorKind::ConfigurationMissing, ErrorCategory::Configuration)]
    #[case(MailErrorKind::CredentialsInvalid, ErrorCategory::Authentication)]
    #[case(MailErrorKind::AuthMethodNotSupported, ErrorCategory::Authentication)]
    fn test_fatal_errors_fail_immediately(#[case] kind: MailErrorKind, #[case] category: ErrorCategory) {
        let mut machine = RetryMachine::new(policy());
        machine.begin();
        assert_eq!(machine.fail(&MailError::new(kind, "boom")), SendState::Failed(category));
    }

    #[rstest]
    #[case(MailErrorKind::DnsResolution)]
    #[case(MailErrorKind::ConnectionRefused)]
    #[case(MailErrorKind::GreetingTimeout)]
    fn test_dns_class_retries_with_invalidation(#[case] kind: MailErrorKind) {
        let mut machine = RetryMachine::new(policy());
        machine.begin();

        let state = machine.fail(&MailError::new(kind, "boom"));
        assert_eq!(
            state,
            SendState::Retrying {
                next: 2,
                delay: Duration::from_secs(1),
                invalidate_cache: true,
            }
        );
        assert_eq!(machine.resume(), SendState::Attempting(2));

        let state = machine.fail(&MailError::new(kind, "boom"));
        assert!(matches!(state, SendState::Retrying { next: 3, delay, .. } if delay == Duration::from_secs(2)));
        machine.resume();

        assert_eq!(machine.fail(&MailError::new(kind, "boom")), SendState::Failed(kind.category()));
    }

    #[test]
    fn test_unknown_retried_once() {
        let mut machine = RetryMachine::new(policy());
        machine.begin();

        let err = MailError::from_smtp_response(451, "Local error");
        assert!(matches!(
            machine.fail(&err),
            SendState::Retrying { next: 2, invalidate_cache: false, .. }
        ));
        machine.resume();
        assert_eq!(machine.fail(&err), SendState::Failed(ErrorCategory::Unknown));
    }

    #[test]
    fn test_single_attempt_policy() {
        let mut machine = RetryMachine::new(RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_secs(1),
        });
        machine.begin();
        let err = MailError::resolution("no such host");
        assert_eq!(machine.fail(&err), SendState::Failed(ErrorCategory::Resolution));
        assert!(machine.state().is_terminal());
    }

    #[tokio::test]
    async fn test_recording_sleeper() {
        let sleeper = RecordingSleeper::new();
        sleeper.sleep(Duration::from_millis(5)).await;
        sleeper.sleep(Duration::from_millis(10)).await;
        assert_eq!(sleeper.delays(), vec![Duration::from_millis(5), Duration::from_millis(10)]);
    }
}
