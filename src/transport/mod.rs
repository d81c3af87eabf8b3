//! Transport layer for SMTP connections.
//!
//! [`TransportSpec`] captures everything one attempt needs to reach the
//! server: the hostname used for TLS identity, the address actually dialed,
//! the TLS posture and the time bounds. [`TcpTransport`] carries the bytes,
//! and [`SmtpSubmitter`] drives a full submission session over it.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;

use crate::auth::{AuthMethod, Authenticator, Credentials};
use crate::config::{MailConfig, TimeoutConfig, TlsMode};
use crate::errors::{MailError, MailErrorKind, MailResult};
use crate::message::EncodedMessage;
use crate::protocol::{codes, EsmtpCapabilities, SmtpCommand, SmtpResponse};
use crate::resolver::Resolution;

/// Trait for SMTP transport abstraction.
#[async_trait]
pub trait SmtpTransport: Send + fmt::Debug {
    /// Sends a command and receives a response.
    async fn send_command(&mut self, command: &SmtpCommand) -> MailResult<SmtpResponse>;

    /// Sends raw data (AUTH continuation lines, DATA body).
    async fn send_data(&mut self, data: &[u8]) -> MailResult<()>;

    /// Reads a response from the server.
    async fn read_response(&mut self) -> MailResult<SmtpResponse>;

    /// Upgrades the connection to TLS, verifying `server_name`.
    async fn upgrade_tls(&mut self, server_name: &str) -> MailResult<()>;

    /// Returns true if TLS is enabled.
    fn is_tls(&self) -> bool;

    /// Closes the connection gracefully.
    async fn close(&mut self) -> MailResult<()>;
}

/// Connection parameters for one send attempt.
#[derive(Debug, Clone)]
pub struct TransportSpec {
    /// Hostname used for SNI and certificate verification.
    pub server_name: String,
    /// Server port.
    pub port: u16,
    /// Pre-resolved address to dial, if any.
    pub address: Option<IpAddr>,
    /// TLS posture.
    pub tls_mode: TlsMode,
    /// Account credentials.
    pub credentials: Credentials,
    /// Client identifier for EHLO.
    pub client_id: String,
    /// Stage timeouts.
    pub timeouts: TimeoutConfig,
}

impl TransportSpec {
    /// Builds the connection parameters for one attempt.
    ///
    /// Fails with `ConfigurationMissing` naming every absent mandatory
    /// setting (account, secret, recipient).
    pub fn build(config: &MailConfig, resolution: &Resolution) -> MailResult<Self> {
        let missing = config.missing_credentials();
        let (Some(username), Some(password), true) =
            (config.username.as_ref(), config.password.as_ref(), missing.is_empty())
        else {
            return Err(MailError::not_configured(format!(
                "Missing mail settings: {}",
                missing.join(", ")
            )));
        };

        Ok(Self {
            server_name: config.host.clone(),
            port: config.port,
            address: resolution.ip(),
            tls_mode: config.tls_mode(),
            credentials: Credentials::new(username.clone(), password.clone()),
            client_id: config.client_id().to_string(),
            timeouts: config.timeouts.clone(),
        })
    }

    /// Returns true if the credential secret is non-empty.
    pub fn has_secret(&self) -> bool {
        !self.credentials.password().expose_secret().is_empty()
    }

    /// Returns the label of the endpoint being dialed.
    pub fn endpoint(&self) -> String {
        match self.address {
            Some(ip) => format!("{} ({}:{})", self.server_name, ip, self.port),
            None => format!("{}:{}", self.server_name, self.port),
        }
    }
}

/// Longest reply line accepted: the RFC 5321 limit of 512 octets plus slack.
pub const MAX_REPLY_LINE: usize = 1024;

trait SmtpStream: AsyncBufRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncBufRead + AsyncWrite + Unpin + Send> SmtpStream for T {}

/// Stream type that can be plain TCP or TLS.
enum TransportStream {
    Plain(BufReader<TcpStream>),
    Tls(BufReader<TlsStream<TcpStream>>),
    Closed,
}

/// TCP connection with optional TLS.
pub struct TcpTransport {
    stream: TransportStream,
    socket_timeout: Duration,
    handshake_timeout: Duration,
    server_name: String,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("server_name", &self.server_name)
            .field("tls_enabled", &self.is_tls())
            .finish()
    }
}

impl TcpTransport {
    /// Connects to the server described by `spec` and consumes the greeting.
    ///
    /// With implicit TLS the handshake completes before the greeting is read.
    pub async fn connect(spec: &TransportSpec) -> MailResult<Self> {
        let connect = match spec.address {
            Some(ip) => {
                timeout(spec.timeouts.connect, TcpStream::connect(SocketAddr::new(ip, spec.port))).await
            }
            None => {
                timeout(
                    spec.timeouts.connect,
                    TcpStream::connect((spec.server_name.as_str(), spec.port)),
                )
                .await
            }
        };

        let stream = connect
            .map_err(|_| {
                MailError::timeout(
                    MailErrorKind::ConnectTimeout,
                    format!("Connect to {} timed out", spec.endpoint()),
                )
            })?
            .map_err(|e| Self::map_io_error(e, spec))?;

        stream.set_nodelay(true).ok();

        let mut transport = Self {
            stream: TransportStream::Plain(BufReader::new(stream)),
            socket_timeout: spec.timeouts.socket,
            handshake_timeout: spec.timeouts.connect,
            server_name: spec.server_name.clone(),
        };

        if spec.tls_mode == TlsMode::Implicit {
            transport.upgrade_tls(&spec.server_name).await?;
        }

        let greeting = match timeout(spec.timeouts.greeting, transport.read_response()).await {
            Ok(greeting) => greeting?,
            Err(_) => {
                return Err(MailError::timeout(
                    MailErrorKind::GreetingTimeout,
                    format!("No greeting from {}", spec.endpoint()),
                ))
            }
        };
        if greeting.code != codes::SERVICE_READY {
            return Err(greeting.to_error());
        }

        tracing::debug!(endpoint = %spec.endpoint(), tls = transport.is_tls(), "Connected to SMTP server");
        Ok(transport)
    }

    /// Maps IO errors to mail errors.
    fn map_io_error(error: io::Error, spec: &TransportSpec) -> MailError {
        let endpoint = spec.endpoint();
        let mapped = match error.kind() {
            io::ErrorKind::ConnectionRefused => {
                MailError::new(MailErrorKind::ConnectionRefused, format!("Connection refused by {}", endpoint))
            }
            io::ErrorKind::TimedOut => {
                MailError::timeout(MailErrorKind::ConnectTimeout, format!("Connect to {} timed out", endpoint))
            }
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                MailError::new(MailErrorKind::ConnectionReset, format!("Connection to {} reset", endpoint))
            }
            // Hostname dialing failed before any socket existed.
            _ if spec.address.is_none() => {
                MailError::resolution(format!("Could not resolve {}", spec.server_name))
            }
            _ => MailError::new(MailErrorKind::NetworkUnreachable, format!("Cannot reach {}", endpoint)),
        };
        mapped.with_cause(error)
    }

    fn stream_mut(&mut self) -> MailResult<&mut dyn SmtpStream> {
        match &mut self.stream {
            TransportStream::Plain(stream) => Ok(stream as &mut dyn SmtpStream),
            TransportStream::Tls(stream) => Ok(stream as &mut dyn SmtpStream),
            TransportStream::Closed => {
                Err(MailError::new(MailErrorKind::ConnectionReset, "Connection already closed"))
            }
        }
    }

    /// Reads lines until we have a complete response.
    async fn read_response_inner<R: AsyncBufRead + Unpin + ?Sized>(
        reader: &mut R,
        timeout_duration: Duration,
    ) -> MailResult<SmtpResponse> {
        let mut lines = Vec::new();

        loop {
            let mut raw = Vec::new();

            let read = timeout(timeout_duration, Self::read_line_capped(reader, &mut raw))
                .await
                .map_err(|_| MailError::timeout(MailErrorKind::ReadTimeout, "Read timed out"))??;

            if read == 0 {
                return Err(MailError::new(MailErrorKind::ConnectionReset, "Server closed connection"));
            }

            let line = String::from_utf8_lossy(&raw).trim_end().to_string();
            let is_continuation = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line);

            if !is_continuation {
                break;
            }
        }

        SmtpResponse::parse(&lines)
    }

    /// Reads one reply line of at most [`MAX_REPLY_LINE`] bytes.
    ///
    /// Returns 0 at end of stream.
    async fn read_line_capped<R: AsyncBufRead + Unpin + ?Sized>(
        reader: &mut R,
        line: &mut Vec<u8>,
    ) -> MailResult<usize> {
        loop {
            let (used, complete) = {
                let available = reader
                    .fill_buf()
                    .await
                    .map_err(|e| MailError::new(MailErrorKind::ConnectionReset, "Read failed").with_cause(e))?;
                if available.is_empty() {
                    return Ok(line.len());
                }
                match available.iter().position(|&b| b == b'\n') {
                    Some(end) => {
                        line.extend_from_slice(&available[..=end]);
                        (end + 1, true)
                    }
                    None => {
                        line.extend_from_slice(available);
                        (available.len(), false)
                    }
                }
            };
            reader.consume(used);

            if line.len() > MAX_REPLY_LINE {
                return Err(MailError::new(
                    MailErrorKind::InvalidResponse,
                    format!("Reply line exceeds {} bytes", MAX_REPLY_LINE),
                ));
            }
            if complete {
                return Ok(line.len());
            }
        }
    }

    /// Writes data to the stream.
    async fn write_all<W: AsyncWrite + Unpin + ?Sized>(
        writer: &mut W,
        data: &[u8],
        timeout_duration: Duration,
    ) -> MailResult<()> {
        timeout(timeout_duration, writer.write_all(data))
            .await
            .map_err(|_| MailError::timeout(MailErrorKind::WriteTimeout, "Write timed out"))?
            .map_err(|e| MailError::new(MailErrorKind::ConnectionReset, "Write failed").with_cause(e))?;

        timeout(timeout_duration, writer.flush())
            .await
            .map_err(|_| MailError::timeout(MailErrorKind::WriteTimeout, "Flush timed out"))?
            .map_err(|e| MailError::new(MailErrorKind::ConnectionReset, "Flush failed").with_cause(e))?;

        Ok(())
    }

    fn tls_connector() -> tokio_rustls::TlsConnector {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        tokio_rustls::TlsConnector::from(Arc::new(tls_config))
    }
}

#[async_trait]
impl SmtpTransport for TcpTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> MailResult<SmtpResponse> {
        tracing::trace!(command = %command, "Sending SMTP command");

        let line = format!("{}\r\n", command.to_smtp_string());
        let socket_timeout = self.socket_timeout;
        Self::write_all(self.stream_mut()?, line.as_bytes(), socket_timeout).await?;

        self.read_response().await
    }

    async fn send_data(&mut self, data: &[u8]) -> MailResult<()> {
        let socket_timeout = self.socket_timeout;
        Self::write_all(self.stream_mut()?, data, socket_timeout).await
    }

    async fn read_response(&mut self) -> MailResult<SmtpResponse> {
        let socket_timeout = self.socket_timeout;
        let response = Self::read_response_inner(self.stream_mut()?, socket_timeout).await?;

        tracing::trace!(code = response.code, message = %response.first_message(), "Received SMTP response");
        Ok(response)
    }

    async fn upgrade_tls(&mut self, server_name: &str) -> MailResult<()> {
        use rustls::pki_types::ServerName;

        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| MailError::tls(format!("Invalid server name: {}", server_name)))?;

        let tcp_stream = match std::mem::replace(&mut self.stream, TransportStream::Closed) {
            TransportStream::Plain(reader) => reader.into_inner(),
            tls @ TransportStream::Tls(_) => {
                self.stream = tls;
                return Ok(());
            }
            TransportStream::Closed => {
                return Err(MailError::new(MailErrorKind::ConnectionReset, "Connection already closed"))
            }
        };

        let tls_stream = timeout(self.handshake_timeout, Self::tls_connector().connect(name, tcp_stream))
            .await
            .map_err(|_| MailError::timeout(MailErrorKind::ConnectTimeout, "TLS handshake timed out"))?
            .map_err(|e| MailError::tls(format!("TLS handshake with {} failed", server_name)).with_cause(e))?;

        self.stream = TransportStream::Tls(BufReader::new(tls_stream));
        Ok(())
    }

    fn is_tls(&self) -> bool {
        matches!(self.stream, TransportStream::Tls(_))
    }

    async fn close(&mut self) -> MailResult<()> {
        if !matches!(self.stream, TransportStream::Closed) {
            self.send_command(&SmtpCommand::Quit)
                .await
                .map_err(|e| tracing::trace!(error = %e, "QUIT not acknowledged"))
                .ok();
            self.stream = TransportStream::Closed;
        }
        Ok(())
    }
}

/// Result of an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Server queue identifier, when the final reply carries one.
    pub queue_id: Option<String>,
    /// Final server reply text.
    pub response: String,
}

/// Submits encoded messages to a server.
#[async_trait]
pub trait MailSubmitter: Send + Sync + fmt::Debug {
    /// Delivers one message over a fresh connection.
    async fn submit(&self, spec: &TransportSpec, message: &EncodedMessage) -> MailResult<Submission>;

    /// Connects, authenticates and quits without sending.
    async fn verify(&self, spec: &TransportSpec) -> MailResult<()>;
}

/// Submitter speaking SMTP over [`TcpTransport`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SmtpSubmitter;

#[async_trait]
impl MailSubmitter for SmtpSubmitter {
    async fn submit(&self, spec: &TransportSpec, message: &EncodedMessage) -> MailResult<Submission> {
        let mut transport = TcpTransport::connect(spec).await?;
        let result = deliver(&mut transport, spec, message).await;
        release(transport);
        result
    }

    async fn verify(&self, spec: &TransportSpec) -> MailResult<()> {
        let mut transport = TcpTransport::connect(spec).await?;
        let result = open_session(&mut transport, spec).await.map(|_| ());
        release(transport);
        result
    }
}

/// Says QUIT in the background.
///
/// The outcome of a submission is settled by the DATA reply; a server
/// that is slow to acknowledge QUIT must not turn it into a failure.
fn release(mut transport: TcpTransport) {
    tokio::spawn(async move {
        transport.close().await.ok();
    });
}

/// Runs EHLO, the TLS upgrade when the posture asks for one, and AUTH.
pub async fn open_session<T>(transport: &mut T, spec: &TransportSpec) -> MailResult<EsmtpCapabilities>
where
    T: SmtpTransport + ?Sized,
{
    let mut capabilities = greet(transport, &spec.client_id).await?;

    if !transport.is_tls() {
        match spec.tls_mode {
            TlsMode::StartTls | TlsMode::StartTlsRequired if capabilities.starttls => {
                let response = transport.send_command(&SmtpCommand::StartTls).await?;
                if response.is_success() {
                    transport.upgrade_tls(&spec.server_name).await?;
                    capabilities = greet(transport, &spec.client_id).await?;
                } else if spec.tls_mode == TlsMode::StartTlsRequired {
                    return Err(MailError::tls(format!("STARTTLS refused: {}", response)));
                }
            }
            TlsMode::StartTlsRequired => {
                return Err(MailError::tls("Server does not offer STARTTLS"));
            }
            TlsMode::Implicit => {
                return Err(MailError::tls("Implicit TLS session is not encrypted"));
            }
            TlsMode::StartTls | TlsMode::None => {}
        }
    }

    authenticate(transport, &capabilities, &spec.credentials).await?;
    Ok(capabilities)
}

/// Runs a whole session: setup, one envelope, DATA.
pub async fn deliver<T>(
    transport: &mut T,
    spec: &TransportSpec,
    message: &EncodedMessage,
) -> MailResult<Submission>
where
    T: SmtpTransport + ?Sized,
{
    let capabilities = open_session(transport, spec).await?;

    if let Some(limit) = capabilities.size {
        if limit > 0 && message.data.len() > limit {
            return Err(MailError::new(
                MailErrorKind::MessageTooLarge,
                format!("Message of {} bytes exceeds server limit {}", message.data.len(), limit),
            ));
        }
    }

    let mail_from = SmtpCommand::MailFrom {
        address: message.sender.clone(),
        size: capabilities.size.map(|_| message.data.len()),
        body_8bit: capabilities.eight_bit_mime,
    };
    expect_success(transport.send_command(&mail_from).await?)?;

    let rcpt_to = SmtpCommand::RcptTo {
        address: message.recipient.clone(),
    };
    let response = transport.send_command(&rcpt_to).await?;
    if !response.is_success() {
        transport.send_command(&SmtpCommand::Rset).await.ok();
        return Err(response.to_error());
    }

    let response = transport.send_command(&SmtpCommand::Data).await?;
    if response.code != codes::START_MAIL_INPUT {
        return Err(response.to_error());
    }

    transport.send_data(&message.data).await?;
    let response = expect_success(transport.read_response().await?)?;

    Ok(Submission {
        queue_id: response.queue_id(),
        response: response.full_message(),
    })
}

async fn greet<T>(transport: &mut T, client_id: &str) -> MailResult<EsmtpCapabilities>
where
    T: SmtpTransport + ?Sized,
{
    let response = transport.send_command(&SmtpCommand::Ehlo(client_id.to_string())).await?;
    if response.is_success() {
        return Ok(EsmtpCapabilities::from_ehlo_response(&response));
    }

    let response = transport.send_command(&SmtpCommand::Helo(client_id.to_string())).await?;
    expect_success(response)?;
    Ok(EsmtpCapabilities::default())
}

async fn authenticate<T>(
    transport: &mut T,
    capabilities: &EsmtpCapabilities,
    credentials: &Credentials,
) -> MailResult<()>
where
    T: SmtpTransport + ?Sized,
{
    let available = capabilities.auth_methods();
    let method = if available.is_empty() {
        // Servers that omit AUTH from EHLO commonly still take LOGIN, but
        // only an encrypted session may carry the secret that way.
        if !transport.is_tls() {
            return Err(MailError::new(
                MailErrorKind::AuthMethodNotSupported,
                "Server advertises no AUTH mechanism and the session is not encrypted",
            ));
        }
        AuthMethod::Login
    } else {
        Authenticator::select_best_method(&available, transport.is_tls())?
    };

    let response = match method {
        AuthMethod::Plain => {
            let command = SmtpCommand::Auth {
                mechanism: method.mechanism_name().to_string(),
                initial_response: Some(Authenticator::plain_initial_response(credentials)),
            };
            transport.send_command(&command).await?
        }
        AuthMethod::Login => {
            let response = auth_start(transport, method).await?;
            expect_continue(response)?;
            let line = format!("{}\r\n", Authenticator::login_username(credentials));
            transport.send_data(line.as_bytes()).await?;
            expect_continue(transport.read_response().await?)?;
            let line = format!("{}\r\n", Authenticator::login_password(credentials));
            transport.send_data(line.as_bytes()).await?;
            transport.read_response().await?
        }
        AuthMethod::CramMd5 => {
            let challenge = expect_continue(auth_start(transport, method).await?)?;
            let line = format!(
                "{}\r\n",
                Authenticator::cram_md5_response(challenge.first_message(), credentials)?
            );
            transport.send_data(line.as_bytes()).await?;
            transport.read_response().await?
        }
    };

    if response.code == codes::AUTH_SUCCESS {
        tracing::debug!(method = %method, user = credentials.username(), "Authenticated");
        return Ok(());
    }

    let error = response.to_error();
    if response.code >= 500 && !error.category().is_fatal() {
        // Providers answer bad authorization codes with assorted 5xx replies.
        return Err(MailError::authentication(format!(
            "{} rejected for {}: {}",
            method,
            credentials.username(),
            response.full_message()
        ))
        .with_smtp_code(response.code));
    }
    Err(error)
}

async fn auth_start<T>(transport: &mut T, method: AuthMethod) -> MailResult<SmtpResponse>
where
    T: SmtpTransport + ?Sized,
{
    transport
        .send_command(&SmtpCommand::Auth {
            mechanism: method.mechanism_name().to_string(),
            initial_response: None,
        })
        .await
}

fn expect_success(response: SmtpResponse) -> MailResult<SmtpResponse> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(response.to_error())
    }
}

fn expect_continue(response: SmtpResponse) -> MailResult<SmtpResponse> {
    if response.code == codes::AUTH_CONTINUE {
        Ok(response)
    } else if response.code >= 500 {
        Err(MailError::new(MailErrorKind::AuthMethodNotSupported, response.full_message())
            .with_smtp_code(response.code))
    } else {
        Err(response.to_error())
    }
}
