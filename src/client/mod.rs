//! Notification client.
//!
//! [`Notifier`] is the entry point for the rest of the application. Each
//! send runs the retry state machine: resolve the host, build the
//! transport, submit under the attempt bound, then decide from the error
//! category whether to wait and go again. Errors never escape; callers get
//! a [`SendReport`] or its boundary form, [`NotificationOutcome`].

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::{FailurePolicy, MailConfig};
use crate::errors::{ErrorCategory, MailError, MailErrorKind, MailResult};
use crate::message::{Addressing, EncodedMessage, Message};
use crate::observability::MailMetrics;
use crate::resilience::{RetryMachine, RetryPolicy, SendState, Sleeper, TokioSleeper};
use crate::resolver::{Clock, HostResolver, Resolution, SystemClock};
use crate::transport::{MailSubmitter, SmtpSubmitter, Submission, TransportSpec};

/// Outcome handed to the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationOutcome {
    /// Whether the message was accepted by the server.
    pub success: bool,
    /// Provider message identifier on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Failure category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    /// Human-readable summary.
    pub message: String,
}

/// One attempt as the orchestrator saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// Attempt number, from 1.
    pub attempt: u32,
    /// Where the dialed address came from.
    pub source: &'static str,
    /// Address dialed, if pre-resolved.
    pub address: Option<IpAddr>,
    /// Failure category, if the attempt failed.
    pub error: Option<ErrorCategory>,
    /// Wall time spent on the attempt.
    pub elapsed: Duration,
}

/// Full result of one send.
#[derive(Debug)]
pub struct SendReport {
    /// Generated Message-ID.
    pub message_id: String,
    /// Accepted submission, on success.
    pub submission: Option<Submission>,
    /// Final error, on failure.
    pub error: Option<MailError>,
    /// Every attempt made.
    pub attempts: Vec<AttemptRecord>,
    /// Terminal state.
    pub state: SendState,
}

impl SendReport {
    /// Returns true if the message was delivered.
    pub fn is_success(&self) -> bool {
        self.state == SendState::Success
    }

    /// Returns the failure category.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self.state {
            SendState::Failed(category) => Some(category),
            _ => None,
        }
    }

    /// Returns the server queue id when reported, else the Message-ID.
    pub fn provider_message_id(&self) -> Option<String> {
        let submission = self.submission.as_ref()?;
        Some(submission.queue_id.clone().unwrap_or_else(|| self.message_id.clone()))
    }

    /// Converts to the boundary form.
    pub fn into_outcome(self) -> NotificationOutcome {
        match self.category() {
            None if self.is_success() => NotificationOutcome {
                success: true,
                message_id: self.provider_message_id(),
                error_category: None,
                message: format!("Notification delivered after {} attempt(s)", self.attempts.len()),
            },
            category => {
                let category = category.unwrap_or(ErrorCategory::Unknown);
                let message = match &self.error {
                    Some(error) => format!("{} ({})", category.explanation(), error),
                    None => category.explanation().to_string(),
                };
                NotificationOutcome {
                    success: false,
                    message_id: None,
                    error_category: Some(category),
                    message,
                }
            }
        }
    }
}

/// How [`Notifier::dispatch`] ran the send.
#[derive(Debug)]
pub enum Dispatch {
    /// Awaited; the outcome belongs to the request.
    Completed(NotificationOutcome),
    /// Spawned; the request does not wait for it.
    Detached(JoinHandle<NotificationOutcome>),
}

/// Notification mailer.
#[derive(Debug, Clone)]
pub struct Notifier {
    config: Arc<MailConfig>,
    resolver: Arc<HostResolver>,
    submitter: Arc<dyn MailSubmitter>,
    sleeper: Arc<dyn Sleeper>,
    metrics: Arc<MailMetrics>,
    policy: RetryPolicy,
}

impl Notifier {
    /// Creates a notifier with production collaborators.
    pub fn new(config: MailConfig) -> MailResult<Self> {
        Self::builder(config).build()
    }

    /// Creates a notifier from the process environment.
    pub fn from_env() -> MailResult<Self> {
        Self::new(MailConfig::from_env()?)
    }

    /// Creates a builder.
    pub fn builder(config: MailConfig) -> NotifierBuilder {
        NotifierBuilder {
            config,
            resolver: None,
            submitter: None,
            sleeper: None,
            clock: None,
            metrics: None,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &MailConfig {
        &self.config
    }

    /// Returns the metrics collector.
    pub fn metrics(&self) -> &MailMetrics {
        &self.metrics
    }

    /// Returns the resolver.
    pub fn resolver(&self) -> &HostResolver {
        &self.resolver
    }

    /// Sends an anonymous treehole message.
    pub async fn send_notification(&self, content: &str) -> NotificationOutcome {
        let message = Message::treehole(content, Addressing::from_config(&self.config), Utc::now());
        self.send_message(&message).await.into_outcome()
    }

    /// Sends a diary notification.
    pub async fn send_diary_notification(&self, content: &str, written_at: DateTime<Utc>) -> NotificationOutcome {
        let message = Message::diary(content, written_at, Addressing::from_config(&self.config));
        self.send_message(&message).await.into_outcome()
    }

    /// Sends a treehole message under the configured failure policy.
    pub async fn dispatch(&self, content: &str) -> Dispatch {
        match self.config.failure_policy {
            FailurePolicy::FailRequest => Dispatch::Completed(self.send_notification(content).await),
            FailurePolicy::FireAndForget => {
                let notifier = self.clone();
                let content = content.to_string();
                Dispatch::Detached(tokio::spawn(async move {
                    let outcome = notifier.send_notification(&content).await;
                    if !outcome.success {
                        tracing::error!(
                            category = ?outcome.error_category,
                            message = %outcome.message,
                            "Background notification failed"
                        );
                    }
                    outcome
                }))
            }
        }
    }

    /// Connects, authenticates and quits without sending.
    pub async fn verify_connection(&self) -> MailResult<()> {
        let resolution = self.resolver.resolve(&self.config.host, 1).await;
        let spec = TransportSpec::build(&self.config, &resolution)?;

        let result = match timeout(self.config.timeouts.send, self.submitter.verify(&spec)).await {
            Ok(result) => result,
            Err(_) => Err(MailError::timeout(
                MailErrorKind::SendTimeout,
                format!("Verification of {} timed out", spec.endpoint()),
            )),
        };

        match &result {
            Ok(()) => tracing::info!(endpoint = %spec.endpoint(), "SMTP connection verified"),
            Err(e) => {
                if e.is_dns_class() {
                    self.resolver.invalidate();
                }
                tracing::warn!(endpoint = %spec.endpoint(), error = %e, "SMTP connection check failed");
            }
        }
        result
    }

    /// Sends `message`, retrying per the error category.
    pub async fn send_message(&self, message: &Message) -> SendReport {
        self.metrics.record_send();
        let encoded = message.encode();

        let mut machine = RetryMachine::new(self.policy);
        let mut state = machine.begin();
        let mut attempts = Vec::new();
        let mut submission = None;
        let mut last_error = None;

        loop {
            match state {
                SendState::Attempting(attempt) => {
                    let started = Instant::now();
                    let (resolution, result) = self.attempt(attempt, &encoded).await;

                    let mut record = AttemptRecord {
                        attempt,
                        source: resolution.source(),
                        address: resolution.ip(),
                        error: None,
                        elapsed: started.elapsed(),
                    };

                    state = match result {
                        Ok(accepted) => {
                            submission = Some(accepted);
                            machine.succeed()
                        }
                        Err(error) => {
                            tracing::warn!(
                                attempt,
                                max_attempts = self.policy.max_attempts,
                                source = record.source,
                                category = %error.category(),
                                error = %error,
                                "Notification attempt failed"
                            );
                            record.error = Some(error.category());
                            let next = machine.fail(&error);
                            last_error = Some(error);
                            next
                        }
                    };
                    attempts.push(record);
                }
                SendState::Retrying {
                    next,
                    delay,
                    invalidate_cache,
                } => {
                    if invalidate_cache {
                        self.resolver.invalidate();
                    }
                    self.metrics.record_retry(invalidate_cache);
                    tracing::info!(next_attempt = next, delay_ms = delay.as_millis() as u64, "Retrying notification");

                    self.sleeper.sleep(delay).await;
                    state = machine.resume();
                }
                SendState::Success | SendState::Failed(_) | SendState::Idle => break,
            }
        }

        let report = SendReport {
            message_id: encoded.message_id,
            submission,
            error: if state == SendState::Success { None } else { last_error },
            attempts,
            state,
        };

        match report.state {
            SendState::Success => {
                self.metrics.record_delivered();
                tracing::info!(
                    message_id = ?report.provider_message_id(),
                    attempts = report.attempts.len(),
                    "Notification delivered"
                );
            }
            SendState::Failed(category) => {
                self.metrics.record_failed(category);
                tracing::error!(
                    category = %category,
                    attempts = report.attempts.len(),
                    "Notification failed"
                );
            }
            _ => {}
        }

        report
    }

    async fn attempt(&self, attempt: u32, message: &EncodedMessage) -> (Resolution, MailResult<Submission>) {
        let resolution = self.resolver.resolve(&self.config.host, attempt).await;
        self.metrics.record_attempt(&resolution);

        let spec = match TransportSpec::build(&self.config, &resolution) {
            Ok(spec) => spec,
            Err(e) => return (resolution, Err(e)),
        };

        tracing::debug!(attempt, endpoint = %spec.endpoint(), source = resolution.source(), "Submitting notification");

        let result = match timeout(self.config.timeouts.send, self.submitter.submit(&spec, message)).await {
            Ok(result) => result,
            Err(_) => Err(MailError::timeout(
                MailErrorKind::SendTimeout,
                format!("Attempt {} to {} timed out", attempt, spec.endpoint()),
            )),
        };

        (resolution, result)
    }
}

/// Builder for [`Notifier`].
#[derive(Debug)]
pub struct NotifierBuilder {
    config: MailConfig,
    resolver: Option<HostResolver>,
    submitter: Option<Arc<dyn MailSubmitter>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<Arc<MailMetrics>>,
}

impl NotifierBuilder {
    /// Uses a prepared resolver.
    pub fn resolver(mut self, resolver: HostResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Uses a custom submitter.
    pub fn submitter(mut self, submitter: Arc<dyn MailSubmitter>) -> Self {
        self.submitter = Some(submitter);
        self
    }

    /// Uses a custom sleeper.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    /// Uses a custom clock for the resolution cache.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Shares a metrics collector.
    pub fn metrics(mut self, metrics: Arc<MailMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the notifier.
    pub fn build(self) -> MailResult<Notifier> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let resolver = self
            .resolver
            .unwrap_or_else(|| HostResolver::from_config(&self.config, clock));

        Ok(Notifier {
            policy: RetryPolicy::from(&self.config.retry),
            config: Arc::new(self.config),
            resolver: Arc::new(resolver),
            submitter: self.submitter.unwrap_or_else(|| Arc::new(SmtpSubmitter)),
            sleeper: self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper)),
            metrics: self.metrics.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{ManualClock, RecordingSleeper, ScriptedSubmitter, StaticStrategy, Step};
    use crate::resolver::ResolutionCache;

    fn config() -> MailConfig {
        MailConfig::builder()
            .credentials("me@qq.com", "auth-code")
            .recipient("you@qq.com")
            .build()
            .unwrap()
    }

    fn resolver(ip: &str) -> HostResolver {
        let cache = Arc::new(ResolutionCache::new(Duration::from_secs(3600), Arc::new(ManualClock::new())));
        HostResolver::new(
            cache,
            vec![Box::new(StaticStrategy::succeeding("a-record", ip.parse().unwrap()))],
        )
    }

    fn notifier(config: MailConfig, submitter: Arc<ScriptedSubmitter>, sleeper: Arc<RecordingSleeper>) -> Notifier {
        Notifier::builder(config)
            .resolver(resolver("192.0.2.1"))
            .submitter(submitter)
            .sleeper(sleeper)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_reports_queue_id() {
        let submitter = Arc::new(ScriptedSubmitter::new().then_succeed("QUEUE42"));
        let notifier = notifier(config(), submitter.clone(), Arc::new(RecordingSleeper::new()));

        let outcome = notifier.send_notification("hello").await;

        assert!(outcome.success);
        assert_eq!(outcome.message_id.as_deref(), Some("QUEUE42"));
        assert_eq!(outcome.error_category, None);
        let attempts = submitter.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].server_name, "smtp.qq.com");
        assert_eq!(attempts[0].address, Some("192.0.2.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_success_without_queue_id_uses_message_id() {
        let submitter = Arc::new(ScriptedSubmitter::new().then(Step::Succeed(None)));
        let notifier = notifier(config(), submitter, Arc::new(RecordingSleeper::new()));

        let message = Message::treehole("hi", Addressing::from_config(notifier.config()), Utc::now());
        let report = notifier.send_message(&message).await;

        assert!(report.is_success());
        assert_eq!(report.provider_message_id(), Some(report.message_id.clone()));
        assert!(report.message_id.ends_with("@qq.com"));
    }

    #[tokio::test]
    async fn test_missing_configuration_fails_after_one_attempt() {
        let config = MailConfig::builder().username("me@qq.com").build().unwrap();
        let submitter = Arc::new(ScriptedSubmitter::new());
        let sleeper = Arc::new(RecordingSleeper::new());
        let notifier = notifier(config, submitter.clone(), sleeper.clone());

        let message = Message::treehole("hi", Addressing::from_config(notifier.config()), Utc::now());
        let report = notifier.send_message(&message).await;

        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.category(), Some(ErrorCategory::Configuration));
        assert!(submitter.attempts().is_empty());
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn test_dns_failure_invalidates_cache() {
        let submitter = Arc::new(
            ScriptedSubmitter::new()
                .then_fail(MailErrorKind::ConnectionRefused)
                .then_succeed("OK1"),
        );
        let notifier = notifier(config(), submitter, Arc::new(RecordingSleeper::new()));

        let message = Message::treehole("hi", Addressing::from_config(notifier.config()), Utc::now());
        let report = notifier.send_message(&message).await;

        assert!(report.is_success());
        assert_eq!(report.attempts[0].source, "a-record");
        // Cleared after the failure, so the second attempt resolved again.
        assert_eq!(report.attempts[1].source, "a-record");
        let snapshot = notifier.metrics().snapshot();
        assert_eq!(snapshot.cache_invalidations, 1);
        assert_eq!(snapshot.cache_hits, 0);
    }

    #[tokio::test]
    async fn test_unknown_failure_keeps_cache() {
        let submitter = Arc::new(
            ScriptedSubmitter::new()
                .then_fail(MailErrorKind::UnexpectedResponse)
                .then_succeed("OK1"),
        );
        let notifier = notifier(config(), submitter, Arc::new(RecordingSleeper::new()));

        let message = Message::treehole("hi", Addressing::from_config(notifier.config()), Utc::now());
        let report = notifier.send_message(&message).await;

        assert!(report.is_success());
        assert_eq!(report.attempts[1].source, "cache");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_attempt_times_out() {
        let submitter = Arc::new(ScriptedSubmitter::new().then(Step::Hang(Duration::from_secs(60))));
        let sleeper = Arc::new(RecordingSleeper::new());
        let notifier = notifier(config(), submitter.clone(), sleeper.clone());

        let outcome = notifier.send_notification("hi").await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_category, Some(ErrorCategory::Timeout));
        assert_eq!(submitter.attempts().len(), 3);
        assert_eq!(sleeper.delays(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
    }

    #[tokio::test]
    async fn test_outcome_serializes_camel_case() {
        let submitter = Arc::new(ScriptedSubmitter::always_failing(MailErrorKind::CredentialsInvalid));
        let notifier = notifier(config(), submitter, Arc::new(RecordingSleeper::new()));

        let outcome = notifier.send_notification("hi").await;
        let json = serde_json::to_value(&outcome).unwrap();

        assert_eq!(json["success"], false);
        assert_eq!(json["errorCategory"], "authentication");
        assert!(json.get("messageId").is_none());
        assert!(json["message"].as_str().unwrap().contains("SMTP_PASS"));
    }

    #[tokio::test]
    async fn test_dispatch_fire_and_forget() {
        let mut config = config();
        config.failure_policy = FailurePolicy::FireAndForget;
        let submitter = Arc::new(ScriptedSubmitter::new().then_succeed("BG1"));
        let notifier = notifier(config, submitter, Arc::new(RecordingSleeper::new()));

        match notifier.dispatch("hi").await {
            Dispatch::Detached(handle) => {
                let outcome = handle.await.unwrap();
                assert_eq!(outcome.message_id.as_deref(), Some("BG1"));
            }
            Dispatch::Completed(_) => panic!("expected a detached send"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_fail_request_awaits() {
        let submitter = Arc::new(ScriptedSubmitter::always_failing(MailErrorKind::CredentialsInvalid));
        let notifier = notifier(config(), submitter, Arc::new(RecordingSleeper::new()));

        match notifier.dispatch("hi").await {
            Dispatch::Completed(outcome) => assert!(!outcome.success),
            Dispatch::Detached(_) => panic!("expected an awaited send"),
        }
    }

    #[tokio::test]
    async fn test_verify_connection() {
        let submitter = Arc::new(ScriptedSubmitter::new());
        let notifier = notifier(config(), submitter.clone(), Arc::new(RecordingSleeper::new()));

        notifier.verify_connection().await.unwrap();
        assert_eq!(submitter.attempts()[0].message_id, None);

        let failing = Arc::new(ScriptedSubmitter::always_failing(MailErrorKind::ConnectionReset));
        let notifier = self::notifier(config(), failing, Arc::new(RecordingSleeper::new()));
        notifier.verify_connection().await.unwrap_err();
        assert!(notifier.resolver().cache().snapshot().is_none());
    }

    #[tokio::test]
    async fn test_diary_notification() {
        let submitter = Arc::new(ScriptedSubmitter::new().then_succeed("D1"));
        let notifier = notifier(config(), submitter, Arc::new(RecordingSleeper::new()));

        let outcome = notifier.send_diary_notification("今天", Utc::now()).await;
        assert!(outcome.success);
    }
}
