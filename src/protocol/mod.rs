//! SMTP commands and replies.
//!
//! Implements the RFC 5321 commands and replies used by a submission
//! session, including the ESMTP capability advertisement.

use std::collections::HashSet;
use std::fmt;

use crate::auth::AuthMethod;
use crate::errors::{MailError, MailResult};

/// SMTP commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// Authentication mechanism.
        mechanism: String,
        /// Initial response (optional).
        initial_response: Option<String>,
    },
    /// MAIL FROM command.
    MailFrom {
        /// Sender address.
        address: String,
        /// SIZE parameter (optional).
        size: Option<usize>,
        /// 8BITMIME parameter.
        body_8bit: bool,
    },
    /// RCPT TO command.
    RcptTo {
        /// Recipient address.
        address: String,
    },
    /// DATA command.
    Data,
    /// Reset transaction.
    Rset,
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command for sending.
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response,
            } => match initial_response {
                Some(response) => format!("AUTH {} {}", mechanism, response),
                None => format!("AUTH {}", mechanism),
            },
            SmtpCommand::MailFrom {
                address,
                size,
                body_8bit,
            } => {
                let mut cmd = format!("MAIL FROM:<{}>", address);
                if let Some(s) = size {
                    cmd.push_str(&format!(" SIZE={}", s));
                }
                if *body_8bit {
                    cmd.push_str(" BODY=8BITMIME");
                }
                cmd
            }
            SmtpCommand::RcptTo { address } => format!("RCPT TO:<{}>", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Rset => "RSET".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }

    /// Returns a form safe to log (AUTH payloads are masked).
    pub fn redacted(&self) -> String {
        match self {
            SmtpCommand::Auth {
                mechanism,
                initial_response: Some(_),
            } => format!("AUTH {} ****", mechanism),
            other => other.to_smtp_string(),
        }
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// SMTP reply from the server.
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    /// Status code (e.g., 250, 354, 550).
    pub code: u16,
    /// Reply text lines.
    pub message: Vec<String>,
}

impl SmtpResponse {
    /// Creates a single-line reply.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: vec![message.into()],
        }
    }

    /// Parses a reply from raw lines.
    pub fn parse(lines: &[String]) -> MailResult<Self> {
        if lines.is_empty() {
            return Err(MailError::protocol("Empty response"));
        }

        let mut code = 0u16;
        let mut messages = Vec::with_capacity(lines.len());

        for (i, line) in lines.iter().enumerate() {
            let parsed_code: u16 = line
                .get(..3)
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| MailError::protocol(format!("Invalid status line: {}", line)))?;

            if i == 0 {
                code = parsed_code;
            } else if parsed_code != code {
                return Err(MailError::protocol("Inconsistent status codes in multiline response"));
            }

            messages.push(line.get(4..).unwrap_or("").to_string());
        }

        Ok(Self { code, message: messages })
    }

    /// Returns true if this is a success reply (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns the first message line.
    pub fn first_message(&self) -> &str {
        self.message.first().map(|s| s.as_str()).unwrap_or("")
    }

    /// Returns all message lines joined.
    pub fn full_message(&self) -> String {
        self.message.join("\n")
    }

    /// Extracts the provider queue identifier from a DATA completion reply,
    /// e.g. `250 2.0.0 Ok: queued as 4F3A2B`.
    pub fn queue_id(&self) -> Option<String> {
        let text = self.full_message();
        let lower = text.to_ascii_lowercase();
        let start = lower.find("queued as")? + "queued as".len();
        text[start..]
            .split_whitespace()
            .next()
            .map(|id| id.trim_matches(|c: char| !c.is_ascii_alphanumeric()).to_string())
            .filter(|id| !id.is_empty())
    }

    /// Converts to an error.
    pub fn to_error(&self) -> MailError {
        MailError::from_smtp_response(self.code, self.full_message())
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_message())
    }
}

/// ESMTP server capabilities.
#[derive(Debug, Clone, Default)]
pub struct EsmtpCapabilities {
    /// Maximum message size.
    pub size: Option<usize>,
    /// Supported authentication mechanisms.
    pub auth_mechanisms: HashSet<AuthMethod>,
    /// STARTTLS supported.
    pub starttls: bool,
    /// 8BITMIME supported.
    pub eight_bit_mime: bool,
    /// Raw capability strings.
    pub raw: Vec<String>,
}

impl EsmtpCapabilities {
    /// Parses capabilities from an EHLO reply. The first line is the
    /// server greeting and carries no capability.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        for line in response.message.iter().skip(1) {
            let line = line.trim().to_uppercase();
            caps.raw.push(line.clone());

            // Some servers still advertise "AUTH=LOGIN PLAIN".
            let mut parts = line.splitn(2, |c: char| c == ' ' || c == '=');
            let capability = parts.next().unwrap_or("");
            let params = parts.next().unwrap_or("");

            match capability {
                "SIZE" => caps.size = params.parse().ok(),
                "AUTH" => {
                    caps.auth_mechanisms
                        .extend(params.split_whitespace().filter_map(AuthMethod::from_capability));
                }
                "STARTTLS" => caps.starttls = true,
                "8BITMIME" => caps.eight_bit_mime = true,
                _ => {}
            }
        }

        caps
    }

    /// Returns the advertised mechanisms.
    pub fn auth_methods(&self) -> Vec<AuthMethod> {
        self.auth_mechanisms.iter().copied().collect()
    }
}

/// Reply codes for the submission session.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// OK.
    pub const OK: u16 = 250;
    /// Continue (AUTH).
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
}
