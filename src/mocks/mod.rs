//! Mock implementations for testing.
//!
//! Hand-written doubles for every seam of the mailer: the wire
//! ([`MockTransport`]), the submitter ([`ScriptedSubmitter`]), resolver
//! strategies ([`StaticStrategy`]) and the cache clock ([`ManualClock`]).

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::errors::{MailError, MailErrorKind, MailResult};
use crate::message::EncodedMessage;
use crate::protocol::{codes, SmtpCommand, SmtpResponse};
use crate::resolver::{Clock, ResolveStrategy};
use crate::transport::{MailSubmitter, SmtpTransport, Submission, TransportSpec};

pub use crate::resilience::RecordingSleeper;

/// Mock SMTP transport replaying queued replies.
#[derive(Debug)]
pub struct MockTransport {
    commands: Vec<SmtpCommand>,
    responses: VecDeque<SmtpResponse>,
    default_response: SmtpResponse,
    data_received: Vec<Vec<u8>>,
    tls_server_name: Option<String>,
    tls_enabled: bool,
}

impl MockTransport {
    /// Creates a transport answering `250 OK` to everything.
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
            responses: VecDeque::new(),
            default_response: SmtpResponse::new(codes::OK, "OK"),
            data_received: Vec::new(),
            tls_server_name: None,
            tls_enabled: false,
        }
    }

    /// Queues a reply.
    pub fn with_response(mut self, response: SmtpResponse) -> Self {
        self.responses.push_back(response);
        self
    }

    /// Starts with TLS already established (implicit TLS).
    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.tls_enabled = enabled;
        self
    }

    /// Returns the wire form of recorded commands.
    pub fn commands(&self) -> Vec<String> {
        self.commands.iter().map(SmtpCommand::to_smtp_string).collect()
    }

    /// Returns raw data written outside commands.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.data_received.clone()
    }

    /// Returns the name the TLS upgrade verified against.
    pub fn tls_server_name(&self) -> Option<String> {
        self.tls_server_name.clone()
    }

    fn next_response(&mut self) -> SmtpResponse {
        self.responses
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SmtpTransport for MockTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> MailResult<SmtpResponse> {
        self.commands.push(command.clone());
        Ok(self.next_response())
    }

    async fn send_data(&mut self, data: &[u8]) -> MailResult<()> {
        self.data_received.push(data.to_vec());
        Ok(())
    }

    async fn read_response(&mut self) -> MailResult<SmtpResponse> {
        Ok(self.next_response())
    }

    async fn upgrade_tls(&mut self, server_name: &str) -> MailResult<()> {
        self.tls_server_name = Some(server_name.to_string());
        self.tls_enabled = true;
        Ok(())
    }

    fn is_tls(&self) -> bool {
        self.tls_enabled
    }

    async fn close(&mut self) -> MailResult<()> {
        self.commands.push(SmtpCommand::Quit);
        Ok(())
    }
}

/// Clock moved by hand.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Creates a clock at an arbitrary origin.
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }
}

/// Resolver strategy with a fixed answer.
#[derive(Debug)]
pub struct StaticStrategy {
    name: &'static str,
    answer: Option<IpAddr>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl StaticStrategy {
    /// Always resolves to `ip`.
    pub fn succeeding(name: &'static str, ip: IpAddr) -> Self {
        Self {
            name,
            answer: Some(ip),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Always fails with a resolution error.
    pub fn failing(name: &'static str) -> Self {
        Self {
            name,
            answer: None,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Waits before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Returns the shared call counter.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl ResolveStrategy for StaticStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn lookup(&self, host: &str) -> MailResult<IpAddr> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.answer
            .ok_or_else(|| MailError::resolution(format!("{} cannot resolve {}", self.name, host)))
    }
}

/// One scripted submission outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Accept, optionally reporting a queue id.
    Succeed(Option<String>),
    /// Fail with an error of this kind.
    Fail(MailErrorKind),
    /// Never answer within `Duration`, then accept.
    Hang(Duration),
}

/// What the submitter saw on one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedAttempt {
    /// Hostname used for TLS identity.
    pub server_name: String,
    /// Address dialed, if pre-resolved.
    pub address: Option<IpAddr>,
    /// Message-ID of the submitted message.
    pub message_id: Option<String>,
}

/// Submitter replaying a script of outcomes.
///
/// When the script runs out the last step repeats.
#[derive(Debug, Default)]
pub struct ScriptedSubmitter {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    attempts: Mutex<Vec<SubmittedAttempt>>,
}

impl ScriptedSubmitter {
    /// Creates a submitter that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a submitter that always fails with `kind`.
    pub fn always_failing(kind: MailErrorKind) -> Self {
        Self::new().then(Step::Fail(kind))
    }

    /// Appends a step.
    pub fn then(self, step: Step) -> Self {
        self.steps.lock().unwrap().push_back(step);
        self
    }

    /// Appends a failure.
    pub fn then_fail(self, kind: MailErrorKind) -> Self {
        self.then(Step::Fail(kind))
    }

    /// Appends a success with a queue id.
    pub fn then_succeed(self, queue_id: &str) -> Self {
        self.then(Step::Succeed(Some(queue_id.to_string())))
    }

    /// Returns every call seen so far.
    pub fn attempts(&self) -> Vec<SubmittedAttempt> {
        self.attempts.lock().unwrap().clone()
    }

    fn next_step(&self) -> Step {
        let mut last = self.last.lock().unwrap();
        match self.steps.lock().unwrap().pop_front() {
            Some(step) => {
                *last = Some(step.clone());
                step
            }
            None => last.clone().unwrap_or(Step::Succeed(None)),
        }
    }

    async fn play(&self, spec: &TransportSpec, message_id: Option<String>) -> MailResult<Submission> {
        self.attempts.lock().unwrap().push(SubmittedAttempt {
            server_name: spec.server_name.clone(),
            address: spec.address,
            message_id,
        });

        match self.next_step() {
            Step::Succeed(queue_id) => Ok(Submission {
                queue_id,
                response: "OK".to_string(),
            }),
            Step::Fail(kind) => Err(MailError::new(kind, format!("scripted {}", kind))),
            Step::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Ok(Submission {
                    queue_id: None,
                    response: "OK".to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl MailSubmitter for ScriptedSubmitter {
    async fn submit(&self, spec: &TransportSpec, message: &EncodedMessage) -> MailResult<Submission> {
        self.play(spec, Some(message.message_id.clone())).await
    }

    async fn verify(&self, spec: &TransportSpec) -> MailResult<()> {
        self.play(spec, None).await.map(|_| ())
    }
}
