//! Error types for notification delivery.
//!
//! Every low-level failure is mapped to a [`MailErrorKind`], and every kind
//! belongs to exactly one [`ErrorCategory`]. The category drives the retry
//! decision and the message shown to the caller.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for mail operations.
pub type MailResult<T> = Result<T, MailError>;

/// Mail error kinds categorizing different failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MailErrorKind {
    // Configuration errors
    /// A mandatory setting (username, secret, recipient) is absent.
    ConfigurationMissing,
    /// A setting is present but unusable.
    ConfigurationInvalid,

    // Resolution errors
    /// Hostname could not be translated to an address.
    DnsResolution,
    /// Name lookup exceeded its bound.
    DnsTimeout,

    // Connection errors
    /// Connection was refused.
    ConnectionRefused,
    /// Connection was reset or closed early.
    ConnectionReset,
    /// Network is unreachable.
    NetworkUnreachable,
    /// TLS handshake failed.
    TlsHandshakeFailed,
    /// Server is shutting down (421).
    ServerShutdown,

    // Timeout errors
    /// TCP connect timed out.
    ConnectTimeout,
    /// Server greeting did not arrive in time.
    GreetingTimeout,
    /// Socket read timed out.
    ReadTimeout,
    /// Socket write timed out.
    WriteTimeout,
    /// The whole attempt exceeded its bound.
    SendTimeout,

    // Authentication errors
    /// Credentials were rejected.
    CredentialsInvalid,
    /// Server requires authentication.
    AuthenticationRequired,
    /// No mutually supported mechanism.
    AuthMethodNotSupported,

    // Everything else
    /// Malformed server reply.
    InvalidResponse,
    /// Reply code not expected at this step.
    UnexpectedResponse,
    /// Recipient refused by the server.
    RecipientRejected,
    /// Message exceeds the server's size limit.
    MessageTooLarge,
    /// Unknown or internal error.
    Unknown,
}

impl MailErrorKind {
    /// Returns the category this kind belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            MailErrorKind::ConfigurationMissing | MailErrorKind::ConfigurationInvalid => {
                ErrorCategory::Configuration
            }
            MailErrorKind::DnsResolution | MailErrorKind::DnsTimeout => ErrorCategory::Resolution,
            MailErrorKind::ConnectionRefused
            | MailErrorKind::ConnectionReset
            | MailErrorKind::NetworkUnreachable
            | MailErrorKind::TlsHandshakeFailed
            | MailErrorKind::ServerShutdown => ErrorCategory::Connection,
            MailErrorKind::ConnectTimeout
            | MailErrorKind::GreetingTimeout
            | MailErrorKind::ReadTimeout
            | MailErrorKind::WriteTimeout
            | MailErrorKind::SendTimeout => ErrorCategory::Timeout,
            MailErrorKind::CredentialsInvalid
            | MailErrorKind::AuthenticationRequired
            | MailErrorKind::AuthMethodNotSupported => ErrorCategory::Authentication,
            MailErrorKind::InvalidResponse
            | MailErrorKind::UnexpectedResponse
            | MailErrorKind::RecipientRejected
            | MailErrorKind::MessageTooLarge
            | MailErrorKind::Unknown => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for MailErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailErrorKind::ConfigurationMissing => write!(f, "Missing configuration"),
            MailErrorKind::ConfigurationInvalid => write!(f, "Invalid configuration"),
            MailErrorKind::DnsResolution => write!(f, "DNS resolution failed"),
            MailErrorKind::DnsTimeout => write!(f, "DNS lookup timed out"),
            MailErrorKind::ConnectionRefused => write!(f, "Connection refused"),
            MailErrorKind::ConnectionReset => write!(f, "Connection reset"),
            MailErrorKind::NetworkUnreachable => write!(f, "Network unreachable"),
            MailErrorKind::TlsHandshakeFailed => write!(f, "TLS handshake failed"),
            MailErrorKind::ServerShutdown => write!(f, "Server shutting down"),
            MailErrorKind::ConnectTimeout => write!(f, "Connect timeout"),
            MailErrorKind::GreetingTimeout => write!(f, "Greeting timeout"),
            MailErrorKind::ReadTimeout => write!(f, "Read timeout"),
            MailErrorKind::WriteTimeout => write!(f, "Write timeout"),
            MailErrorKind::SendTimeout => write!(f, "Send timeout"),
            MailErrorKind::CredentialsInvalid => write!(f, "Invalid credentials"),
            MailErrorKind::AuthenticationRequired => write!(f, "Authentication required"),
            MailErrorKind::AuthMethodNotSupported => write!(f, "Auth method not supported"),
            MailErrorKind::InvalidResponse => write!(f, "Invalid server response"),
            MailErrorKind::UnexpectedResponse => write!(f, "Unexpected response"),
            MailErrorKind::RecipientRejected => write!(f, "Recipient rejected"),
            MailErrorKind::MessageTooLarge => write!(f, "Message too large"),
            MailErrorKind::Unknown => write!(f, "Unknown error"),
        }
    }
}

/// Coarse error category exposed across the subsystem boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Missing or invalid settings; fatal.
    Configuration,
    /// Name resolution failed; retryable.
    Resolution,
    /// TCP/TLS establishment failed; retryable.
    Connection,
    /// A stage exceeded its bound; retryable.
    Timeout,
    /// The server rejected the credentials; fatal.
    Authentication,
    /// Anything else; retried once.
    Unknown,
}

impl ErrorCategory {
    /// Returns true for the DNS-class categories that clear the
    /// resolution cache and are retried with backoff.
    pub fn is_dns_class(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Resolution | ErrorCategory::Connection | ErrorCategory::Timeout
        )
    }

    /// Returns true if retrying can never fix this category.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorCategory::Configuration | ErrorCategory::Authentication)
    }

    /// Returns the stable identifier used in outcomes and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Resolution => "resolution",
            ErrorCategory::Connection => "connection",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Human-readable explanation for the caller.
    pub fn explanation(&self) -> &'static str {
        match self {
            ErrorCategory::Configuration => {
                "Mail service is not configured; set SMTP_USER, SMTP_PASS and RECIPIENT_EMAIL"
            }
            ErrorCategory::Resolution => {
                "Could not resolve the mail server address; transient network issue, retried automatically"
            }
            ErrorCategory::Connection => {
                "Could not connect to the mail server; transient network issue, retried automatically"
            }
            ErrorCategory::Timeout => {
                "Mail server did not respond in time; transient network issue, retried automatically"
            }
            ErrorCategory::Authentication => {
                "Mail server rejected the login; check SMTP_USER and the SMTP_PASS authorization code"
            }
            ErrorCategory::Unknown => "Mail delivery failed for an unexpected reason",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mail error with detailed information.
#[derive(Error, Debug)]
pub struct MailError {
    kind: MailErrorKind,
    message: String,
    smtp_code: Option<u16>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl MailError {
    /// Creates a new mail error.
    pub fn new(kind: MailErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            cause: None,
        }
    }

    /// Sets the SMTP status code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> MailErrorKind {
        self.kind
    }

    /// Returns the error category.
    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP status code if available.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns true if this error belongs to the DNS class.
    pub fn is_dns_class(&self) -> bool {
        self.category().is_dns_class()
    }

    // Convenience constructors

    /// Creates a missing-configuration error.
    pub fn not_configured(message: impl Into<String>) -> Self {
        Self::new(MailErrorKind::ConfigurationMissing, message)
    }

    /// Creates an invalid-configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(MailErrorKind::ConfigurationInvalid, message)
    }

    /// Creates a resolution error.
    pub fn resolution(message: impl Into<String>) -> Self {
        Self::new(MailErrorKind::DnsResolution, message)
    }

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(MailErrorKind::ConnectionRefused, message)
    }

    /// Creates a timeout error.
    pub fn timeout(kind: MailErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(MailErrorKind::TlsHandshakeFailed, message)
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(MailErrorKind::CredentialsInvalid, message)
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(MailErrorKind::InvalidResponse, message)
    }

    /// Creates an error from an SMTP reply.
    pub fn from_smtp_response(code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            421 => MailErrorKind::ServerShutdown,
            500..=504 => MailErrorKind::InvalidResponse,
            530 | 534 => MailErrorKind::AuthenticationRequired,
            535 => MailErrorKind::CredentialsInvalid,
            550 | 551 | 553 => MailErrorKind::RecipientRejected,
            552 => MailErrorKind::MessageTooLarge,
            400..=599 => MailErrorKind::UnexpectedResponse,
            _ => MailErrorKind::Unknown,
        };
        Self::new(kind, message).with_smtp_code(code)
    }
}

impl fmt::Display for MailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_categories() {
        assert_eq!(MailErrorKind::DnsTimeout.category(), ErrorCategory::Resolution);
        assert_eq!(MailErrorKind::TlsHandshakeFailed.category(), ErrorCategory::Connection);
        assert_eq!(MailErrorKind::GreetingTimeout.category(), ErrorCategory::Timeout);
        assert_eq!(MailErrorKind::ConfigurationMissing.category(), ErrorCategory::Configuration);
        assert_eq!(MailErrorKind::RecipientRejected.category(), ErrorCategory::Unknown);
    }

    #[test]
    fn test_dns_class_and_fatal() {
        assert!(ErrorCategory::Resolution.is_dns_class());
        assert!(ErrorCategory::Connection.is_dns_class());
        assert!(ErrorCategory::Timeout.is_dns_class());
        assert!(!ErrorCategory::Unknown.is_dns_class());

        assert!(ErrorCategory::Configuration.is_fatal());
        assert!(ErrorCategory::Authentication.is_fatal());
        assert!(!ErrorCategory::Timeout.is_fatal());
    }

    #[test]
    fn test_error_from_smtp_response() {
        let err = MailError::from_smtp_response(535, "Login fail");
        assert_eq!(err.kind(), MailErrorKind::CredentialsInvalid);
        assert_eq!(err.category(), ErrorCategory::Authentication);
        assert_eq!(err.smtp_code(), Some(535));

        let err = MailError::from_smtp_response(421, "Service not available");
        assert_eq!(err.category(), ErrorCategory::Connection);
        assert!(err.is_dns_class());

        let err = MailError::from_smtp_response(451, "Try again later");
        assert_eq!(err.kind(), MailErrorKind::UnexpectedResponse);
    }

    #[test]
    fn test_display_includes_code() {
        let err = MailError::from_smtp_response(550, "Mailbox unavailable");
        assert_eq!(err.to_string(), "Recipient rejected: Mailbox unavailable (SMTP 550)");
    }

    #[test]
    fn test_category_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCategory::Authentication).unwrap();
        assert_eq!(json, "\"authentication\"");
    }
}
