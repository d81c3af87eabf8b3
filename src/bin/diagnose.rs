//! Mail delivery diagnostics.
//!
//! Prints the effective configuration (secret masked), then either checks
//! the connection (`--verify`) or sends a test notification, and explains
//! any failure by category.
//!
//! Logging honours `RUST_LOG`, plus `LOG_LEVEL` and `LOG_FORMAT`.

use std::process::ExitCode;

use secrecy::ExposeSecret;
use treehole_mailer::{ErrorCategory, LogFormat, LogLevel, LoggingConfig, MailConfig, Notifier, SendReport};

fn hints(category: ErrorCategory) -> &'static [&'static str] {
    match category {
        ErrorCategory::Configuration => &[
            "Set SMTP_USER, SMTP_PASS and RECIPIENT_EMAIL",
            "Check SMTP_PORT, SMTP_IP and SMTP_FALLBACK_IPS for typos",
        ],
        ErrorCategory::Authentication => &[
            "Check that SMTP_USER is the full mailbox address",
            "SMTP_PASS must be the SMTP authorization code, not the login password",
        ],
        ErrorCategory::Resolution => &[
            "The mail host name could not be resolved from this environment",
            "Set SMTP_IP to dial a known address, or SMTP_FALLBACK_IPS to extend the fallback list",
        ],
        ErrorCategory::Connection => &[
            "Check SMTP_HOST and SMTP_PORT",
            "Outbound SMTP may be blocked; try port 465 or set SMTP_IP",
        ],
        ErrorCategory::Timeout => &[
            "The server did not answer in time",
            "The network path to the mail server may be filtered",
        ],
        ErrorCategory::Unknown => &["Inspect the error message above and the debug log (LOG_LEVEL=debug)"],
    }
}

fn print_config(config: &MailConfig) {
    let show = |value: Option<&str>| value.map(str::to_string).unwrap_or_else(|| "(not set)".to_string());
    let secret = match &config.password {
        Some(secret) => format!("set ({} chars)", secret.expose_secret().chars().count()),
        None => "(not set)".to_string(),
    };

    println!("1. Configuration");
    println!("   host:            {}", config.host);
    println!("   port:            {} ({:?})", config.port, config.tls_mode());
    println!("   user:            {}", show(config.username.as_deref()));
    println!("   secret:          {}", secret);
    println!("   recipient:       {}", show(config.recipient.as_deref()));
    println!(
        "   override ip:     {}",
        config.override_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "(not set)".to_string())
    );
    let fallbacks = config
        .fallback_addresses
        .get(&config.host)
        .map(|ips| ips.iter().map(|ip| ip.to_string()).collect::<Vec<_>>().join(", "))
        .unwrap_or_else(|| "(none)".to_string());
    println!("   fallback ips:    {}", fallbacks);
    println!("   max attempts:    {}", config.retry.max_attempts);
    println!("   failure policy:  {:?}", config.failure_policy);
    println!();
}

/// Shows the outcome exactly as the HTTP layer receives it.
fn print_outcome(report: SendReport) {
    match serde_json::to_string_pretty(&report.into_outcome()) {
        Ok(json) => println!("\n   outcome: {}", json),
        Err(e) => println!("\n   outcome could not be serialized: {}", e),
    }
}

fn init_logging() {
    let level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|v| v.parse::<LogLevel>().ok())
        .unwrap_or(LogLevel::Warn);
    let format = std::env::var("LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse::<LogFormat>().ok())
        .unwrap_or(LogFormat::Compact);

    if let Err(e) = LoggingConfig::new().with_level(level).with_format(format).init() {
        eprintln!("logging disabled: {}", e);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let verify_only = std::env::args().skip(1).any(|arg| arg == "--verify");

    println!("=== Mail delivery diagnostics ===\n");

    let config = match MailConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            println!("Configuration could not be loaded: {}", e);
            return ExitCode::FAILURE;
        }
    };
    print_config(&config);

    let missing = config.missing_credentials();
    if !missing.is_empty() {
        println!("Missing required settings: {}", missing.join(", "));
        for hint in hints(ErrorCategory::Configuration) {
            println!("   - {}", hint);
        }
        return ExitCode::FAILURE;
    }

    let notifier = match Notifier::new(config) {
        Ok(notifier) => notifier,
        Err(e) => {
            println!("Mailer could not be created: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if verify_only {
        println!("2. Verifying connection");
        return match notifier.verify_connection().await {
            Ok(()) => {
                println!("   connection and login OK");
                ExitCode::SUCCESS
            }
            Err(e) => {
                println!("   failed: {}", e);
                println!("\n3. Analysis: {}", e.category().explanation());
                for hint in hints(e.category()) {
                    println!("   - {}", hint);
                }
                ExitCode::FAILURE
            }
        };
    }

    println!("2. Sending test notification");
    let content = format!(
        "This is a diagnostic message for the notification mailer.\nSent at {}",
        treehole_mailer::message::format_local_time(chrono::Utc::now())
    );
    let message = treehole_mailer::Message::treehole(
        &content,
        treehole_mailer::Addressing::from_config(notifier.config()),
        chrono::Utc::now(),
    );
    let report = notifier.send_message(&message).await;

    for attempt in &report.attempts {
        println!(
            "   attempt {}: via {}{} -> {}",
            attempt.attempt,
            attempt.source,
            attempt.address.map(|ip| format!(" ({})", ip)).unwrap_or_default(),
            attempt.error.map(|c| c.to_string()).unwrap_or_else(|| "delivered".to_string()),
        );
    }

    if report.is_success() {
        println!("   delivered, message id {}", report.provider_message_id().unwrap_or_default());
        print_outcome(report);
        println!("\n=== Done ===");
        return ExitCode::SUCCESS;
    }

    let category = report.category().unwrap_or(ErrorCategory::Unknown);
    if let Some(error) = &report.error {
        println!("   last error: {}", error);
        if let Some(code) = error.smtp_code() {
            println!("   smtp code:  {}", code);
        }
    }
    println!("\n3. Analysis: {}", category.explanation());
    for hint in hints(category) {
        println!("   - {}", hint);
    }
    print_outcome(report);
    ExitCode::FAILURE
}
