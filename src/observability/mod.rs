//! Observability for notification delivery.
//!
//! Structured logging goes through `tracing`; [`LoggingConfig`] installs a
//! subscriber for binaries. [`MailMetrics`] keeps process-local counters.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::errors::{ErrorCategory, MailError};
use crate::resolver::Resolution;

/// Log levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = MailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(MailError::configuration(format!("Unknown log level: {}", other))),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format.
    Pretty,
    /// JSON lines.
    Json,
    /// Compact single-line format.
    Compact,
}

impl FromStr for LogFormat {
    type Err = MailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(MailError::configuration(format!("Unknown log format: {}", other))),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Minimum level, combined with `RUST_LOG` directives.
    pub level: LogLevel,
    /// Output format.
    pub format: LogFormat,
    /// Whether to include the module target.
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

impl LoggingConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the level.
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Sets the format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets whether to include the module target.
    pub fn with_target(mut self, include: bool) -> Self {
        self.include_target = include;
        self
    }

    /// Installs the global subscriber.
    ///
    /// # Errors
    ///
    /// Returns an error if a subscriber is already installed.
    pub fn init(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let filter = EnvFilter::from_default_env().add_directive(LevelFilter::from(self.level).into());

        match self.format {
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_target(self.include_target))
                    .try_init()?;
            }
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json())
                    .try_init()?;
            }
            LogFormat::Compact => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().compact().with_target(self.include_target))
                    .try_init()?;
            }
        }

        Ok(())
    }
}

/// Delivery counters.
#[derive(Debug, Default)]
pub struct MailMetrics {
    sends: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    cache_hits: AtomicU64,
    fallbacks: AtomicU64,
    cache_invalidations: AtomicU64,
    auth_failures: AtomicU64,
}

impl MailMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the start of a send.
    pub fn record_send(&self) {
        self.sends.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one attempt and where its address came from.
    pub fn record_attempt(&self, resolution: &Resolution) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        match resolution {
            Resolution::Cached(_) => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
            }
            Resolution::Fallback(_) => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Records a scheduled retry.
    pub fn record_retry(&self, invalidated_cache: bool) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        if invalidated_cache {
            self.cache_invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a delivered message.
    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a send that gave up.
    pub fn record_failed(&self, category: ErrorCategory) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if category == ErrorCategory::Authentication {
            self.auth_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sends: self.sends.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            cache_invalidations: self.cache_invalidations.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`MailMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Sends started.
    pub sends: u64,
    /// Sends delivered.
    pub delivered: u64,
    /// Sends that gave up.
    pub failed: u64,
    /// Attempts across all sends.
    pub attempts: u64,
    /// Retries scheduled.
    pub retries: u64,
    /// Attempts served from the resolution cache.
    pub cache_hits: u64,
    /// Attempts that dialed a fallback address.
    pub fallbacks: u64,
    /// Cache clears after DNS-class failures.
    pub cache_invalidations: u64,
    /// Sends that ended in an authentication failure.
    pub auth_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = MailMetrics::new();
        let ip = "192.0.2.1".parse().unwrap();

        metrics.record_send();
        metrics.record_attempt(&Resolution::Cached(ip));
        metrics.record_retry(true);
        metrics.record_attempt(&Resolution::Fallback(ip));
        metrics.record_retry(false);
        metrics.record_attempt(&Resolution::Unresolved);
        metrics.record_failed(ErrorCategory::Authentication);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sends, 1);
        assert_eq!(snapshot.attempts, 3);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.fallbacks, 1);
        assert_eq!(snapshot.retries, 2);
        assert_eq!(snapshot.cache_invalidations, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.auth_failures, 1);
        assert_eq!(snapshot.delivered, 0);
    }

    #[test]
    fn test_parse_logging_options() {
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
