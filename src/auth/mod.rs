//! Authentication mechanisms for SMTP.
//!
//! Supports the mechanisms mail providers offer for account/secret pairs:
//! - PLAIN (RFC 4616)
//! - LOGIN (obsolete but widely used)
//! - CRAM-MD5 (RFC 2195)

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::Md5;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{MailError, MailErrorKind, MailResult};

/// Authentication methods supported by the mailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// PLAIN authentication (RFC 4616).
    Plain,
    /// LOGIN authentication (obsolete).
    Login,
    /// CRAM-MD5 challenge-response.
    CramMd5,
}

impl AuthMethod {
    /// Returns the SMTP AUTH mechanism name.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            AuthMethod::Plain => "PLAIN",
            AuthMethod::Login => "LOGIN",
            AuthMethod::CramMd5 => "CRAM-MD5",
        }
    }

    /// Returns the priority for auto-selection (higher is better).
    pub fn priority(&self) -> u8 {
        match self {
            AuthMethod::CramMd5 => 3,
            AuthMethod::Plain => 2,
            AuthMethod::Login => 1,
        }
    }

    /// Parses from SMTP capability string.
    pub fn from_capability(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(AuthMethod::Plain),
            "LOGIN" => Some(AuthMethod::Login),
            "CRAM-MD5" => Some(AuthMethod::CramMd5),
            _ => None,
        }
    }

    /// Returns true if this method sends the secret in the clear.
    pub fn requires_tls(&self) -> bool {
        matches!(self, AuthMethod::Plain | AuthMethod::Login)
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mechanism_name())
    }
}

/// Account identity and secret.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: SecretString,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: SecretString) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }

    /// Creates credentials from plain strings.
    pub fn plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(username, SecretString::new(password.into()))
    }

    /// Returns the account identity.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the protected secret.
    pub fn password(&self) -> &SecretString {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Authentication mechanism implementation.
pub struct Authenticator;

impl Authenticator {
    /// Generates the initial response for PLAIN authentication.
    pub fn plain_initial_response(credentials: &Credentials) -> String {
        // Format: \0username\0password
        let response = format!("\0{}\0{}", credentials.username, credentials.password.expose_secret());
        BASE64.encode(response)
    }

    /// Generates LOGIN username response.
    pub fn login_username(credentials: &Credentials) -> String {
        BASE64.encode(&credentials.username)
    }

    /// Generates LOGIN password response.
    pub fn login_password(credentials: &Credentials) -> String {
        BASE64.encode(credentials.password.expose_secret())
    }

    /// Generates CRAM-MD5 response.
    pub fn cram_md5_response(challenge: &str, credentials: &Credentials) -> MailResult<String> {
        let challenge_bytes = BASE64
            .decode(challenge.trim())
            .map_err(|e| MailError::protocol(format!("Invalid CRAM-MD5 challenge: {}", e)))?;

        type HmacMd5 = Hmac<Md5>;
        let mut mac = HmacMd5::new_from_slice(credentials.password.expose_secret().as_bytes())
            .map_err(|e| MailError::authentication(format!("HMAC error: {}", e)))?;
        mac.update(&challenge_bytes);
        let digest = mac.finalize().into_bytes();

        // Format: username space hex-digest
        let hex_digest: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Ok(BASE64.encode(format!("{} {}", credentials.username, hex_digest)))
    }

    /// Selects the best authentication method from the advertised ones.
    pub fn select_best_method(available: &[AuthMethod], tls_enabled: bool) -> MailResult<AuthMethod> {
        available
            .iter()
            .filter(|m| !m.requires_tls() || tls_enabled)
            .copied()
            .max_by_key(|m| m.priority())
            .ok_or_else(|| {
                MailError::new(
                    MailErrorKind::AuthMethodNotSupported,
                    "No compatible authentication method available",
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_method_from_capability() {
        assert_eq!(AuthMethod::from_capability("PLAIN"), Some(AuthMethod::Plain));
        assert_eq!(AuthMethod::from_capability("login"), Some(AuthMethod::Login));
        assert_eq!(AuthMethod::from_capability("CRAM-MD5"), Some(AuthMethod::CramMd5));
        assert_eq!(AuthMethod::from_capability("XOAUTH2"), None);
    }

    #[test]
    fn test_plain_initial_response() {
        let creds = Credentials::plain("user", "password");
        let response = Authenticator::plain_initial_response(&creds);
        let decoded = BASE64.decode(&response).unwrap();
        assert_eq!(decoded, b"\0user\0password");
    }

    #[test]
    fn test_login_responses() {
        let creds = Credentials::plain("user@qq.com", "code");
        assert_eq!(Authenticator::login_username(&creds), BASE64.encode("user@qq.com"));
        assert_eq!(Authenticator::login_password(&creds), BASE64.encode("code"));
    }

    #[test]
    fn test_cram_md5_rfc2195_vector() {
        let creds = Credentials::plain("tim", "tanstaaftanstaaf");
        let challenge = BASE64.encode("<1896.697170952@postoffice.reston.mci.net>");
        let response = Authenticator::cram_md5_response(&challenge, &creds).unwrap();
        let decoded = String::from_utf8(BASE64.decode(response).unwrap()).unwrap();
        assert_eq!(decoded, "tim b913a602c7eda7a495b4e6e7334d3890");
    }

    #[test]
    fn test_select_best_method() {
        let available = vec![AuthMethod::Plain, AuthMethod::Login, AuthMethod::CramMd5];
        assert_eq!(
            Authenticator::select_best_method(&available, true).unwrap(),
            AuthMethod::CramMd5
        );

        let available = vec![AuthMethod::Plain, AuthMethod::Login];
        assert_eq!(
            Authenticator::select_best_method(&available, true).unwrap(),
            AuthMethod::Plain
        );
        let err = Authenticator::select_best_method(&available, false).unwrap_err();
        assert_eq!(err.kind(), MailErrorKind::AuthMethodNotSupported);
    }

    #[test]
    fn test_credentials_debug() {
        let creds = Credentials::plain("user", "secret_password");
        let debug_str = format!("{:?}", creds);
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("secret_password"));
    }
}
