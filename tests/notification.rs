//! Integration tests for notification delivery.

#[cfg(test)]
mod notification_tests {
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use treehole_mailer::message::MessageIdentity;
    use treehole_mailer::mocks::{ManualClock, RecordingSleeper, ScriptedSubmitter, StaticStrategy};
    use treehole_mailer::{
        Addressing, ErrorCategory, FallbackTable, HostResolver, MailConfig, MailErrorKind, Message, Notifier,
        ResolutionCache, ResolveStrategy, SendState,
    };

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn config() -> MailConfig {
        MailConfig::builder()
            .credentials("me@qq.com", "auth-code")
            .recipient("you@qq.com")
            .build()
            .unwrap()
    }

    fn resolver(clock: Arc<ManualClock>, strategies: Vec<Box<dyn ResolveStrategy>>) -> HostResolver {
        let cache = Arc::new(ResolutionCache::new(Duration::from_secs(3600), clock));
        HostResolver::new(cache, strategies)
    }

    fn healthy_resolver() -> HostResolver {
        resolver(
            Arc::new(ManualClock::new()),
            vec![Box::new(StaticStrategy::succeeding("a-record", ip("192.0.2.1")))],
        )
    }

    fn build(
        config: MailConfig,
        resolver: HostResolver,
        submitter: Arc<ScriptedSubmitter>,
        sleeper: Arc<RecordingSleeper>,
    ) -> Notifier {
        Notifier::builder(config)
            .resolver(resolver)
            .submitter(submitter)
            .sleeper(sleeper)
            .build()
            .unwrap()
    }

    #[rstest]
    #[case(MailErrorKind::CredentialsInvalid, ErrorCategory::Authentication)]
    #[case(MailErrorKind::AuthenticationRequired, ErrorCategory::Authentication)]
    #[case(MailErrorKind::ConfigurationInvalid, ErrorCategory::Configuration)]
    #[tokio::test]
    async fn test_fatal_failure_makes_exactly_one_attempt(
        #[case] kind: MailErrorKind,
        #[case] category: ErrorCategory,
    ) {
        let submitter = Arc::new(ScriptedSubmitter::always_failing(kind));
        let sleeper = Arc::new(RecordingSleeper::new());
        let notifier = build(config(), healthy_resolver(), submitter.clone(), sleeper.clone());

        let outcome = notifier.send_notification("hello").await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_category, Some(category));
        assert_eq!(submitter.attempts().len(), 1);
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn test_missing_settings_fail_without_contacting_server() {
        let submitter = Arc::new(ScriptedSubmitter::new());
        let sleeper = Arc::new(RecordingSleeper::new());
        let config = MailConfig::builder().build().unwrap();
        let notifier = build(config, healthy_resolver(), submitter.clone(), sleeper.clone());

        let outcome = notifier.send_notification("hello").await;

        assert_eq!(outcome.error_category, Some(ErrorCategory::Configuration));
        assert!(outcome.message.contains("SMTP_USER, SMTP_PASS, RECIPIENT_EMAIL"));
        assert!(submitter.attempts().is_empty());
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn test_resolution_failures_then_success_backs_off() {
        let submitter = Arc::new(
            ScriptedSubmitter::new()
                .then_fail(MailErrorKind::DnsResolution)
                .then_fail(MailErrorKind::DnsTimeout)
                .then_succeed("8A7B6C"),
        );
        let sleeper = Arc::new(RecordingSleeper::new());
        let notifier = build(config(), healthy_resolver(), submitter.clone(), sleeper.clone());

        let outcome = notifier.send_notification("hello").await;

        assert!(outcome.success);
        assert_eq!(outcome.message_id.as_deref(), Some("8A7B6C"));
        assert_eq!(submitter.attempts().len(), 3);

        let delays = sleeper.delays();
        assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
        assert!(delays.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn test_connection_failures_exhaust_attempts() {
        let submitter = Arc::new(ScriptedSubmitter::always_failing(MailErrorKind::ConnectionRefused));
        let sleeper = Arc::new(RecordingSleeper::new());
        let notifier = build(config(), healthy_resolver(), submitter.clone(), sleeper.clone());

        let message = Message::treehole("hello", Addressing::from_config(notifier.config()), Utc::now());
        let report = notifier.send_message(&message).await;

        assert_eq!(report.state, SendState::Failed(ErrorCategory::Connection));
        assert_eq!(report.attempts.len(), 3);
        assert_eq!(submitter.attempts().len(), 3);
        assert_eq!(sleeper.delays().len(), 2);

        let snapshot = notifier.metrics().snapshot();
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.retries, 2);
    }

    #[tokio::test]
    async fn test_max_attempts_from_configuration() {
        let mut config = config();
        config.retry.max_attempts = 5;
        let submitter = Arc::new(ScriptedSubmitter::always_failing(MailErrorKind::ReadTimeout));
        let sleeper = Arc::new(RecordingSleeper::new());
        let notifier = build(config, healthy_resolver(), submitter.clone(), sleeper.clone());

        let outcome = notifier.send_notification("hello").await;

        assert_eq!(outcome.error_category, Some(ErrorCategory::Timeout));
        assert_eq!(submitter.attempts().len(), 5);
        assert_eq!(sleeper.delays().last(), Some(&Duration::from_secs(4)));
    }

    #[tokio::test]
    async fn test_fallback_addresses_follow_attempt_number() {
        let resolver = resolver(
            Arc::new(ManualClock::new()),
            vec![
                Box::new(StaticStrategy::failing("a-record")),
                Box::new(StaticStrategy::failing("system")),
            ],
        )
        .with_fallbacks(FallbackTable::new(HashMap::from([(
            "smtp.qq.com".to_string(),
            vec![ip("198.51.100.1"), ip("198.51.100.2")],
        )])));
        let submitter = Arc::new(ScriptedSubmitter::always_failing(MailErrorKind::ConnectionReset));
        let notifier = build(config(), resolver, submitter.clone(), Arc::new(RecordingSleeper::new()));

        notifier.send_notification("hello").await;

        let attempts = submitter.attempts();
        let addresses: Vec<_> = attempts.iter().map(|a| a.address).collect();
        assert_eq!(
            addresses,
            vec![Some(ip("198.51.100.1")), Some(ip("198.51.100.2")), Some(ip("198.51.100.2"))]
        );
        assert!(attempts.iter().all(|a| a.server_name == "smtp.qq.com"));
        assert_eq!(notifier.metrics().snapshot().fallbacks, 3);
    }

    #[tokio::test]
    async fn test_unresolvable_host_without_fallback_dials_by_name() {
        let mut config = config();
        config.host = "smtp.example.com".to_string();
        let resolver = resolver(
            Arc::new(ManualClock::new()),
            vec![Box::new(StaticStrategy::failing("a-record"))],
        );
        let submitter = Arc::new(ScriptedSubmitter::new().then_succeed("X1"));
        let notifier = build(config, resolver, submitter.clone(), Arc::new(RecordingSleeper::new()));

        assert!(notifier.send_notification("hello").await.success);
        assert_eq!(submitter.attempts()[0].address, None);
        assert_eq!(submitter.attempts()[0].server_name, "smtp.example.com");
    }

    #[tokio::test]
    async fn test_cache_survives_between_sends_until_ttl() {
        let clock = Arc::new(ManualClock::new());
        let strategy = StaticStrategy::succeeding("a-record", ip("192.0.2.1"));
        let lookups = strategy.calls();
        let resolver = resolver(clock.clone(), vec![Box::new(strategy)]);
        let submitter = Arc::new(ScriptedSubmitter::new());
        let notifier = build(config(), resolver, submitter, Arc::new(RecordingSleeper::new()));

        notifier.send_notification("one").await;
        notifier.send_notification("two").await;
        assert_eq!(lookups.load(std::sync::atomic::Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(3600));
        notifier.send_notification("three").await;
        assert_eq!(lookups.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(notifier.metrics().snapshot().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_concurrent_sends_share_the_cache() {
        let submitter = Arc::new(ScriptedSubmitter::new());
        let notifier = build(config(), healthy_resolver(), submitter.clone(), Arc::new(RecordingSleeper::new()));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let notifier = notifier.clone();
                tokio::spawn(async move { notifier.send_notification(&format!("message {}", i)).await })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().success);
        }
        assert_eq!(submitter.attempts().len(), 8);
        assert!(submitter.attempts().iter().all(|a| a.address == Some(ip("192.0.2.1"))));
    }

    #[test]
    fn test_script_content_is_escaped() {
        let addressing = Addressing {
            sender: "me@qq.com".to_string(),
            sender_name: "树洞倾诉".to_string(),
            recipient: "you@qq.com".to_string(),
        };
        let message = Message::treehole("<script>alert('x')</script>", addressing, Utc::now());

        assert!(!message.html_body.contains("<script>"));
        assert!(message.html_body.contains("&lt;script&gt;alert(&#39;x&#39;)&lt;/script&gt;"));
    }

    #[test]
    fn test_message_construction_is_deterministic() {
        let addressing = Addressing {
            sender: "me@qq.com".to_string(),
            sender_name: "树洞倾诉".to_string(),
            recipient: "you@qq.com".to_string(),
        };
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let identity = MessageIdentity {
            message_id: "id@qq.com".to_string(),
            boundary: "b".to_string(),
            date: at,
        };

        let first = Message::treehole("第一行\n第二行", addressing.clone(), at).encode_with(&identity);
        let second = Message::treehole("第一行\n第二行", addressing, at).encode_with(&identity);
        assert_eq!(first.data, second.data);
    }

    #[tokio::test]
    #[ignore] // Only run with SMTP_USER, SMTP_PASS and RECIPIENT_EMAIL set
    async fn test_live_delivery() {
        let notifier = Notifier::from_env().expect("mail settings must be present");
        notifier.verify_connection().await.expect("connection check");

        let outcome = notifier.send_notification("integration test").await;
        assert!(outcome.success, "{}", outcome.message);
    }
}
