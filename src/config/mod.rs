//! Configuration types for the notification mailer.
//!
//! Provides configuration with a builder pattern and environment loading for:
//! - Server connection settings and TLS posture
//! - Account credentials and the fixed recipient
//! - Resolution cache, fallback addresses and override IP
//! - Retry policy and per-stage timeouts
//! - Failure policy for the calling request

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::{MailError, MailResult};

/// Default SMTP host.
pub const DEFAULT_HOST: &str = "smtp.qq.com";

/// Default SMTP port (implicit TLS).
pub const DEFAULT_PORT: u16 = 465;

/// Port that implies implicit TLS.
pub const IMPLICIT_TLS_PORT: u16 = 465;

/// Port that implies a required STARTTLS upgrade.
pub const SUBMISSION_PORT: u16 = 587;

/// Default lifetime of a resolution cache entry.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Default display name of the sender.
pub const DEFAULT_SENDER_NAME: &str = "树洞倾诉";

/// Operator-curated addresses for [`DEFAULT_HOST`], used only when live
/// resolution fails. Override with `SMTP_FALLBACK_IPS`.
pub const DEFAULT_FALLBACK_ADDRESSES: &[&str] = &["183.47.101.192", "157.148.54.34", "109.244.211.90"];

/// TLS posture for SMTP connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// No TLS (insecure, local testing only).
    None,
    /// Opportunistic STARTTLS.
    StartTls,
    /// Required STARTTLS (fail if not supported).
    StartTlsRequired,
    /// Implicit TLS from the first byte.
    Implicit,
}

impl TlsMode {
    /// Selects the posture by port convention.
    pub fn for_port(port: u16) -> Self {
        match port {
            IMPLICIT_TLS_PORT => TlsMode::Implicit,
            SUBMISSION_PORT => TlsMode::StartTlsRequired,
            _ => TlsMode::StartTls,
        }
    }
}

/// What a failed notification means for the request that triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Await delivery and surface its failure to the caller.
    #[default]
    FailRequest,
    /// Spawn delivery in the background; failures are only logged.
    FireAndForget,
}

impl FromStr for FailurePolicy {
    type Err = MailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail-request" | "fail_request" | "fail" => Ok(FailurePolicy::FailRequest),
            "fire-and-forget" | "fire_and_forget" | "background" => Ok(FailurePolicy::FireAndForget),
            other => Err(MailError::configuration(format!("Unknown failure policy: {}", other))),
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay unit; attempt `n` waits `n * base_delay` before the next one.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
}

fn default_max_attempts() -> u32 { 3 }
fn default_base_delay() -> Duration { Duration::from_secs(1) }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
        }
    }
}

/// Per-stage time bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Bound applied to each resolver strategy.
    #[serde(default = "default_dns_timeout", with = "humantime_serde")]
    pub dns: Duration,
    /// TCP connect (and TLS handshake) bound.
    #[serde(default = "default_stage_timeout", with = "humantime_serde")]
    pub connect: Duration,
    /// Bound on the server greeting.
    #[serde(default = "default_stage_timeout", with = "humantime_serde")]
    pub greeting: Duration,
    /// Bound on each socket read or write.
    #[serde(default = "default_stage_timeout", with = "humantime_serde")]
    pub socket: Duration,
    /// Bound on one whole send attempt.
    #[serde(default = "default_send_timeout", with = "humantime_serde")]
    pub send: Duration,
}

fn default_dns_timeout() -> Duration { Duration::from_secs(5) }
fn default_stage_timeout() -> Duration { Duration::from_secs(10) }
fn default_send_timeout() -> Duration { Duration::from_secs(15) }

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dns: default_dns_timeout(),
            connect: default_stage_timeout(),
            greeting: default_stage_timeout(),
            socket: default_stage_timeout(),
            send: default_send_timeout(),
        }
    }
}

/// Notification mailer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// SMTP server hostname.
    #[serde(default = "default_host")]
    pub host: String,
    /// SMTP server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Forced TLS posture; derived from the port when absent.
    #[serde(default)]
    pub tls_mode: Option<TlsMode>,
    /// Account identity.
    pub username: Option<String>,
    /// Account secret (serialization skipped).
    #[serde(skip)]
    pub password: Option<SecretString>,
    /// Fixed notification recipient.
    pub recipient: Option<String>,
    /// Display name used in the From header.
    #[serde(default = "default_sender_name")]
    pub sender_name: String,
    /// Address dialed instead of resolving the host.
    #[serde(default)]
    pub override_ip: Option<IpAddr>,
    /// Fallback addresses keyed by provider host.
    #[serde(default = "default_fallbacks")]
    pub fallback_addresses: HashMap<String, Vec<IpAddr>>,
    /// Resolution cache entry lifetime.
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Retry configuration.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Stage timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Failure policy for the calling request.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Client identifier for EHLO.
    pub client_id: Option<String>,
}

fn default_host() -> String { DEFAULT_HOST.to_string() }
fn default_port() -> u16 { DEFAULT_PORT }
fn default_sender_name() -> String { DEFAULT_SENDER_NAME.to_string() }
fn default_cache_ttl() -> Duration { DEFAULT_CACHE_TTL }

fn default_fallbacks() -> HashMap<String, Vec<IpAddr>> {
    let addresses = DEFAULT_FALLBACK_ADDRESSES
        .iter()
        .filter_map(|ip| ip.parse().ok())
        .collect();
    HashMap::from([(DEFAULT_HOST.to_string(), addresses)])
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls_mode: None,
            username: None,
            password: None,
            recipient: None,
            sender_name: default_sender_name(),
            override_ip: None,
            fallback_addresses: default_fallbacks(),
            cache_ttl: default_cache_ttl(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
            failure_policy: FailurePolicy::default(),
            client_id: None,
        }
    }
}

impl MailConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> MailConfigBuilder {
        MailConfigBuilder::default()
    }

    /// Loads configuration from the process environment.
    ///
    /// Missing credentials are not an error here; they surface as a
    /// configuration failure on the first send.
    pub fn from_env() -> MailResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> MailResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mut builder = Self::builder();

        if let Some(host) = var("SMTP_HOST") {
            builder = builder.host(host);
        }
        if let Some(port) = var("SMTP_PORT") {
            let port = port
                .parse::<u16>()
                .map_err(|_| MailError::configuration(format!("SMTP_PORT is not a port: {}", port)))?;
            builder = builder.port(port);
        }
        if let Some(user) = var("SMTP_USER") {
            builder = builder.username(user);
        }
        if let Some(pass) = var("SMTP_PASS") {
            builder = builder.password(pass);
        }
        if let Some(recipient) = var("RECIPIENT_EMAIL") {
            builder = builder.recipient(recipient);
        }
        if let Some(name) = var("EMAIL_SENDER_NAME") {
            builder = builder.sender_name(name);
        }
        if let Some(ip) = var("SMTP_IP") {
            let ip = ip
                .parse::<IpAddr>()
                .map_err(|_| MailError::configuration(format!("SMTP_IP is not an IP address: {}", ip)))?;
            builder = builder.override_ip(ip);
        }
        if let Some(retries) = var("SMTP_MAX_RETRIES") {
            let retries = retries.parse::<u32>().map_err(|_| {
                MailError::configuration(format!("SMTP_MAX_RETRIES is not a number: {}", retries))
            })?;
            builder = builder.max_attempts(retries);
        }
        if let Some(list) = var("SMTP_FALLBACK_IPS") {
            let addresses = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<IpAddr>().map_err(|_| {
                        MailError::configuration(format!("SMTP_FALLBACK_IPS entry is not an IP: {}", s))
                    })
                })
                .collect::<MailResult<Vec<_>>>()?;
            builder = builder.fallback_addresses_for_host(addresses);
        }
        if let Some(policy) = var("EMAIL_FAILURE_POLICY") {
            builder = builder.failure_policy(policy.parse()?);
        }

        builder.build()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> MailResult<()> {
        if self.host.is_empty() {
            return Err(MailError::configuration("Host is required"));
        }

        if self.port == 0 {
            return Err(MailError::configuration("Port must be non-zero"));
        }

        if self.retry.max_attempts == 0 {
            return Err(MailError::configuration("max_attempts must be at least 1"));
        }

        Ok(())
    }

    /// Returns the effective TLS posture.
    pub fn tls_mode(&self) -> TlsMode {
        self.tls_mode.unwrap_or_else(|| TlsMode::for_port(self.port))
    }

    /// Returns the names of mandatory settings that are absent.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.username.as_deref().map_or(true, str::is_empty) {
            missing.push("SMTP_USER");
        }
        if self.password.is_none() {
            missing.push("SMTP_PASS");
        }
        if self.recipient.as_deref().map_or(true, str::is_empty) {
            missing.push("RECIPIENT_EMAIL");
        }
        missing
    }

    /// Returns the client identifier for EHLO.
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("localhost")
    }
}

/// Builder for mail configuration.
#[derive(Debug, Default)]
pub struct MailConfigBuilder {
    config: MailConfig,
}

impl MailConfigBuilder {
    /// Sets the SMTP server host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Sets the SMTP server port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Forces a TLS posture instead of deriving it from the port.
    pub fn tls_mode(mut self, mode: TlsMode) -> Self {
        self.config.tls_mode = Some(mode);
        self
    }

    /// Sets account identity and secret.
    pub fn credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username(username).password(password)
    }

    /// Sets the account identity.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self
    }

    /// Sets the account secret.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets the notification recipient.
    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.config.recipient = Some(recipient.into());
        self
    }

    /// Sets the sender display name.
    pub fn sender_name(mut self, name: impl Into<String>) -> Self {
        self.config.sender_name = name.into();
        self
    }

    /// Sets an address to dial instead of resolving the host.
    pub fn override_ip(mut self, ip: IpAddr) -> Self {
        self.config.override_ip = Some(ip);
        self
    }

    /// Sets fallback addresses for a provider host.
    pub fn fallback_addresses(mut self, host: impl Into<String>, addresses: Vec<IpAddr>) -> Self {
        self.config.fallback_addresses.insert(host.into(), addresses);
        self
    }

    /// Sets fallback addresses for the configured host.
    fn fallback_addresses_for_host(mut self, addresses: Vec<IpAddr>) -> Self {
        let host = self.config.host.clone();
        self.config.fallback_addresses.insert(host, addresses);
        self
    }

    /// Removes every fallback address.
    pub fn no_fallbacks(mut self) -> Self {
        self.config.fallback_addresses.clear();
        self
    }

    /// Sets the resolution cache lifetime.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    /// Sets the maximum number of attempts.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    /// Sets the retry configuration.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.config.retry = config;
        self
    }

    /// Sets the stage timeouts.
    pub fn timeouts(mut self, config: TimeoutConfig) -> Self {
        self.config.timeouts = config;
        self
    }

    /// Sets the failure policy.
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    /// Sets the client identifier for EHLO.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.config.client_id = Some(id.into());
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> MailResult<MailConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
