//! # Treehole Mailer
//!
//! Notification delivery for the treehole and diary features:
//! - Hostname resolution with a TTL cache, ordered lookup strategies and
//!   static fallback addresses
//! - Transport security by port (implicit TLS, STARTTLS) with the TLS
//!   identity kept on the hostname while dialing a resolved address
//! - A retry state machine with linear backoff driven by error category
//! - HTML-escaped, deterministic message construction
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use treehole_mailer::Notifier;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // SMTP_USER, SMTP_PASS and RECIPIENT_EMAIL come from the environment.
//!     let notifier = Notifier::from_env()?;
//!
//!     let outcome = notifier.send_notification("今天也要开心").await;
//!     println!("{}", serde_json::to_string(&outcome)?);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;

// Name resolution
pub mod resolver;

// Protocol layer
pub mod protocol;

// Transport layer
pub mod transport;

// Authentication
pub mod auth;

// Message construction
pub mod message;

// Resilience
pub mod resilience;

// Observability
pub mod observability;

// Client
pub mod client;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use client::{AttemptRecord, Dispatch, NotificationOutcome, Notifier, NotifierBuilder, SendReport};
pub use config::{FailurePolicy, MailConfig, MailConfigBuilder, RetryConfig, TimeoutConfig, TlsMode};
pub use errors::{ErrorCategory, MailError, MailErrorKind, MailResult};
pub use auth::{AuthMethod, Credentials};
pub use message::{escape_html, Addressing, EncodedMessage, Message};
pub use observability::{LogFormat, LogLevel, LoggingConfig, MailMetrics};
pub use protocol::{EsmtpCapabilities, SmtpCommand, SmtpResponse};
pub use resilience::{RetryPolicy, SendState, Sleeper, TokioSleeper};
pub use resolver::{FallbackTable, HostResolver, Resolution, ResolutionCache, ResolveStrategy};
pub use transport::{MailSubmitter, SmtpSubmitter, SmtpTransport, TransportSpec};
