//! Notification message construction.
//!
//! Builds the treehole and diary notifications and renders them as
//! RFC 5322 `multipart/alternative` messages ready for the DATA phase.
//!
//! Rendering is deterministic: the same content, timestamp and
//! [`MessageIdentity`] always produce the same bytes.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, FixedOffset, Utc};
use uuid::Uuid;

use crate::config::MailConfig;

/// Offset of the recipient's local time (UTC+8).
const LOCAL_OFFSET_SECONDS: i32 = 8 * 3600;

/// Longest chunk of raw header text per RFC 2047 encoded word.
const ENCODED_WORD_BYTES: usize = 45;

/// Escapes text for inclusion in HTML.
pub fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Escapes text and turns line breaks into `<br>`.
pub fn html_paragraph(input: &str) -> String {
    escape_html(&normalize_newlines(input)).replace('\n', "<br>")
}

/// Formats `at` in the recipient's local time, `YYYY/MM/DD HH:MM`.
pub fn format_local_time(at: DateTime<Utc>) -> String {
    match FixedOffset::east_opt(LOCAL_OFFSET_SECONDS) {
        Some(offset) => at.with_timezone(&offset).format("%Y/%m/%d %H:%M").to_string(),
        None => at.format("%Y/%m/%d %H:%M UTC").to_string(),
    }
}

fn normalize_newlines(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

/// Sender and recipient of every notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addressing {
    /// Envelope and header sender (the account).
    pub sender: String,
    /// Display name of the sender.
    pub sender_name: String,
    /// Fixed recipient.
    pub recipient: String,
}

impl Addressing {
    /// Takes addressing from configuration.
    ///
    /// Absent settings stay empty; they are rejected when the transport is
    /// built for the first attempt.
    pub fn from_config(config: &MailConfig) -> Self {
        Self {
            sender: config.username.clone().unwrap_or_default(),
            sender_name: config.sender_name.clone(),
            recipient: config.recipient.clone().unwrap_or_default(),
        }
    }

    fn domain(&self) -> &str {
        self.sender
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .filter(|domain| !domain.is_empty())
            .unwrap_or("localhost")
    }
}

/// A notification ready to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Sender and recipient.
    pub addressing: Addressing,
    /// Subject line (unencoded).
    pub subject: String,
    /// Plain-text alternative.
    pub text_body: String,
    /// HTML alternative.
    pub html_body: String,
}

impl Message {
    /// Builds an anonymous treehole notification.
    pub fn treehole(content: &str, addressing: Addressing, at: DateTime<Utc>) -> Self {
        let time = format_local_time(at);
        let title = addressing.sender_name.clone();

        Self {
            subject: format!("{} - {}", title, time),
            text_body: format!("{}\n\n{}\n\n时间: {}", title, normalize_newlines(content), time),
            html_body: render_html(&title, "🌳", content, &time),
            addressing,
        }
    }

    /// Builds a diary notification for an entry written at `written_at`.
    pub fn diary(content: &str, written_at: DateTime<Utc>, addressing: Addressing) -> Self {
        let time = format_local_time(written_at);
        let title = "新的日记记录";

        Self {
            subject: format!("📝 {} - {}", title, time),
            text_body: format!("{}\n\n{}\n\n时间: {}", title, normalize_newlines(content), time),
            html_body: render_html(title, "📝", content, &time),
            addressing,
        }
    }

    /// Renders with a freshly generated identity.
    pub fn encode(&self) -> EncodedMessage {
        self.encode_with(&MessageIdentity::generate(self.addressing.domain()))
    }

    /// Renders with the given identity.
    pub fn encode_with(&self, identity: &MessageIdentity) -> EncodedMessage {
        let mut output = Vec::with_capacity(self.html_body.len() * 2);
        let from = format!("{} <{}>", encode_header_value(&self.addressing.sender_name), self.addressing.sender);

        write_header(&mut output, "Date", &identity.date.to_rfc2822());
        write_header(&mut output, "From", &from);
        write_header(&mut output, "To", &self.addressing.recipient);
        write_header(&mut output, "Subject", &encode_header_value(&self.subject));
        write_header(&mut output, "Message-ID", &format!("<{}>", identity.message_id));
        write_header(&mut output, "MIME-Version", "1.0");
        write_header(
            &mut output,
            "Content-Type",
            &format!("multipart/alternative; boundary=\"{}\"", identity.boundary),
        );
        output.extend_from_slice(b"\r\n");

        write_part(&mut output, &identity.boundary, "text/plain", &self.text_body);
        write_part(&mut output, &identity.boundary, "text/html", &self.html_body);
        output.extend_from_slice(format!("--{}--\r\n", identity.boundary).as_bytes());

        EncodedMessage {
            message_id: identity.message_id.clone(),
            sender: self.addressing.sender.clone(),
            recipient: self.addressing.recipient.clone(),
            data: prepare_data(&output),
        }
    }
}

/// Per-message generated values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageIdentity {
    /// Message-ID without angle brackets.
    pub message_id: String,
    /// MIME boundary.
    pub boundary: String,
    /// Date header value.
    pub date: DateTime<Utc>,
}

impl MessageIdentity {
    /// Generates a unique identity for `domain`.
    pub fn generate(domain: &str) -> Self {
        let date = Utc::now();
        Self {
            message_id: format!("{}.{}@{}", Uuid::new_v4().simple(), date.timestamp(), domain),
            boundary: format!("----=_Part_{}", Uuid::new_v4().simple()),
            date,
        }
    }
}

/// A rendered message with its envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    /// Message-ID without angle brackets.
    pub message_id: String,
    /// Envelope sender.
    pub sender: String,
    /// Envelope recipient.
    pub recipient: String,
    /// Dot-stuffed DATA payload including the terminating `.` line.
    pub data: Vec<u8>,
}

fn render_html(title: &str, icon: &str, content: &str, time: &str) -> String {
    format!(
        concat!(
            "<div style=\"font-family: 'Microsoft YaHei', Arial, sans-serif; padding: 20px; ",
            "background-color: #FFF5F5; border-radius: 10px;\">\n",
            "<h2 style=\"color: #E91E63; margin-bottom: 20px;\">{icon} {title}</h2>\n",
            "<div style=\"background-color: white; padding: 20px; border-radius: 8px; ",
            "border-left: 4px solid #FFB6C1; white-space: pre-wrap; line-height: 1.8; color: #4A4A4A;\">",
            "{content}</div>\n",
            "<p style=\"color: #C97D9E; margin-top: 20px; font-size: 12px;\">时间: {time}</p>\n",
            "<p style=\"color: #999; font-size: 12px;\">这是一封来自小确幸日记网站的自动通知邮件</p>\n",
            "</div>\n",
        ),
        icon = icon,
        title = escape_html(title),
        content = html_paragraph(content),
        time = time,
    )
}

fn write_header(output: &mut Vec<u8>, name: &str, value: &str) {
    output.extend_from_slice(name.as_bytes());
    output.extend_from_slice(b": ");
    output.extend_from_slice(value.as_bytes());
    output.extend_from_slice(b"\r\n");
}

fn write_part(output: &mut Vec<u8>, boundary: &str, mime_type: &str, body: &str) {
    output.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    write_header(output, "Content-Type", &format!("{}; charset=utf-8", mime_type));
    write_header(output, "Content-Transfer-Encoding", "quoted-printable");
    output.extend_from_slice(b"\r\n");

    let crlf_body = normalize_newlines(body).replace('\n', "\r\n");
    output.extend_from_slice(&quoted_printable::encode(crlf_body.as_bytes()));
    output.extend_from_slice(b"\r\n");
}

/// Encodes a header value with RFC 2047 when it is not plain ASCII.
///
/// Long values are split into several encoded words on character
/// boundaries and folded.
pub fn encode_header_value(value: &str) -> String {
    if value.chars().all(|c| c.is_ascii() && !c.is_control()) {
        return value.to_string();
    }

    let mut words = Vec::new();
    let mut chunk = String::new();
    for c in value.chars() {
        if chunk.len() + c.len_utf8() > ENCODED_WORD_BYTES {
            words.push(format!("=?UTF-8?B?{}?=", BASE64.encode(chunk.as_bytes())));
            chunk.clear();
        }
        chunk.push(c);
    }
    if !chunk.is_empty() {
        words.push(format!("=?UTF-8?B?{}?=", BASE64.encode(chunk.as_bytes())));
    }

    words.join("\r\n ")
}

/// Applies dot-stuffing and appends the `<CRLF>.<CRLF>` terminator.
fn prepare_data(content: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(content.len() + 64);
    let mut at_line_start = true;

    for &byte in content {
        if at_line_start && byte == b'.' {
            output.push(b'.');
        }
        output.push(byte);
        at_line_start = byte == b'\n';
    }

    if !output.ends_with(b"\r\n") {
        output.extend_from_slice(b"\r\n");
    }
    output.extend_from_slice(b".\r\n");
    output
}
