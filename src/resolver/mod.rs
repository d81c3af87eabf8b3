//! Hostname resolution for the SMTP host.
//!
//! Resolution degrades through, in order:
//! 1. an operator override address,
//! 2. the single-entry [`ResolutionCache`],
//! 3. an ordered list of [`ResolveStrategy`] implementations, each bounded
//!    by the same timeout,
//! 4. the static [`FallbackTable`] for well-known provider hosts,
//! 5. [`Resolution::Unresolved`], leaving resolution to the socket layer.
//!
//! Failure to resolve is a normal outcome here, never an error.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokio::time::timeout;
use trust_dns_resolver::config::{LookupIpStrategy, ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::MailConfig;
use crate::errors::{MailError, MailErrorKind, MailResult};

/// Source of the current time for cache expiry.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// One cached resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Host the address belongs to.
    pub hostname: String,
    /// Resolved address.
    pub ip: IpAddr,
    /// When the address was resolved.
    pub resolved_at: Instant,
}

/// Single-entry resolution cache with a TTL.
///
/// The slot is replaced as a whole on every write, so concurrent readers
/// see either the previous entry or the new one.
#[derive(Debug)]
pub struct ResolutionCache {
    slot: ArcSwapOption<CacheEntry>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl ResolutionCache {
    /// Creates an empty cache.
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            ttl,
            clock,
        }
    }

    /// Creates an empty cache on the wall clock.
    pub fn with_system_clock(ttl: Duration) -> Self {
        Self::new(ttl, Arc::new(SystemClock))
    }

    /// Returns the cached address for `hostname` if still valid.
    pub fn get(&self, hostname: &str) -> Option<IpAddr> {
        let entry = self.slot.load_full()?;
        if entry.hostname != hostname {
            return None;
        }
        let age = self.clock.now().saturating_duration_since(entry.resolved_at);
        (age < self.ttl).then_some(entry.ip)
    }

    /// Replaces the cached entry.
    pub fn store(&self, hostname: &str, ip: IpAddr) {
        self.slot.store(Some(Arc::new(CacheEntry {
            hostname: hostname.to_string(),
            ip,
            resolved_at: self.clock.now(),
        })));
    }

    /// Clears the cache so the next lookup resolves afresh.
    pub fn invalidate(&self) {
        self.slot.store(None);
    }

    /// Returns the raw entry, expired or not.
    pub fn snapshot(&self) -> Option<CacheEntry> {
        self.slot.load_full().map(|entry| (*entry).clone())
    }
}

/// A way of turning a hostname into an IPv4 address.
#[async_trait]
pub trait ResolveStrategy: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Looks up one address for `host`.
    async fn lookup(&self, host: &str) -> MailResult<IpAddr>;
}

/// Direct A-record query through the DNS resolver.
#[derive(Debug)]
pub struct AddressRecordLookup {
    resolver: TokioAsyncResolver,
}

impl AddressRecordLookup {
    /// Creates a lookup using the system resolver configuration, or public
    /// defaults when none can be read.
    pub fn new(query_timeout: Duration) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = query_timeout;
        opts.attempts = 1;
        opts.ip_strategy = LookupIpStrategy::Ipv4Only;

        let resolver = match trust_dns_resolver::system_conf::read_system_conf() {
            Ok((config, _)) => TokioAsyncResolver::tokio(config, opts),
            Err(_) => TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
        };

        Self { resolver }
    }
}

#[async_trait]
impl ResolveStrategy for AddressRecordLookup {
    fn name(&self) -> &'static str {
        "a-record"
    }

    async fn lookup(&self, host: &str) -> MailResult<IpAddr> {
        let lookup = self.resolver.lookup_ip(host).await.map_err(|e| {
            MailError::resolution(format!("A-record lookup for {} failed", host)).with_cause(e)
        })?;

        lookup
            .iter()
            .find(IpAddr::is_ipv4)
            .ok_or_else(|| MailError::resolution(format!("No A record for {}", host)))
    }
}

/// Generic name lookup through the operating system, IPv4 only.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLookup;

#[async_trait]
impl ResolveStrategy for SystemLookup {
    fn name(&self) -> &'static str {
        "system"
    }

    async fn lookup(&self, host: &str) -> MailResult<IpAddr> {
        let mut addrs = tokio::net::lookup_host((host, 0)).await.map_err(|e| {
            MailError::resolution(format!("System lookup for {} failed", host)).with_cause(e)
        })?;

        addrs
            .find(|addr| addr.is_ipv4())
            .map(|addr| addr.ip())
            .ok_or_else(|| MailError::resolution(format!("No IPv4 address for {}", host)))
    }
}

/// Operator-curated fallback addresses per provider host.
#[derive(Debug, Clone, Default)]
pub struct FallbackTable {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl FallbackTable {
    /// Creates a table from host → addresses.
    pub fn new(entries: HashMap<String, Vec<IpAddr>>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(host, addrs)| (host.to_ascii_lowercase(), addrs))
            .filter(|(_, addrs)| !addrs.is_empty())
            .collect();
        Self { entries }
    }

    /// Selects the address for 1-indexed `attempt`: index `min(k, N) - 1`.
    pub fn select(&self, host: &str, attempt: u32) -> Option<IpAddr> {
        let addrs = self.entries.get(&host.to_ascii_lowercase())?;
        let k = attempt.max(1) as usize;
        addrs.get(k.min(addrs.len()) - 1).copied()
    }
}

/// Outcome of resolving the SMTP host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Operator override address.
    Override(IpAddr),
    /// Valid cache entry.
    Cached(IpAddr),
    /// Freshly resolved by the named strategy.
    Resolved {
        /// Resolved address.
        ip: IpAddr,
        /// Strategy that produced it.
        strategy: &'static str,
    },
    /// Static fallback address.
    Fallback(IpAddr),
    /// Nothing available; connect by hostname.
    Unresolved,
}

impl Resolution {
    /// Returns the address to dial, if any.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Resolution::Override(ip)
            | Resolution::Cached(ip)
            | Resolution::Resolved { ip, .. }
            | Resolution::Fallback(ip) => Some(*ip),
            Resolution::Unresolved => None,
        }
    }

    /// Returns a short label of where the address came from.
    pub fn source(&self) -> &'static str {
        match self {
            Resolution::Override(_) => "override",
            Resolution::Cached(_) => "cache",
            Resolution::Resolved { strategy, .. } => *strategy,
            Resolution::Fallback(_) => "fallback",
            Resolution::Unresolved => "hostname",
        }
    }
}

/// Resolver for the SMTP host.
#[derive(Debug)]
pub struct HostResolver {
    cache: Arc<ResolutionCache>,
    strategies: Vec<Box<dyn ResolveStrategy>>,
    fallbacks: FallbackTable,
    override_ip: Option<IpAddr>,
    strategy_timeout: Duration,
}

impl HostResolver {
    /// Creates a resolver over the given cache and ordered strategies.
    pub fn new(cache: Arc<ResolutionCache>, strategies: Vec<Box<dyn ResolveStrategy>>) -> Self {
        Self {
            cache,
            strategies,
            fallbacks: FallbackTable::default(),
            override_ip: None,
            strategy_timeout: Duration::from_secs(5),
        }
    }

    /// Creates the production resolver: A-record lookup, then system lookup.
    pub fn from_config(config: &MailConfig, clock: Arc<dyn Clock>) -> Self {
        let cache = Arc::new(ResolutionCache::new(config.cache_ttl, clock));
        let strategies: Vec<Box<dyn ResolveStrategy>> = vec![
            Box::new(AddressRecordLookup::new(config.timeouts.dns)),
            Box::new(SystemLookup),
        ];

        let mut resolver = Self::new(cache, strategies)
            .with_fallbacks(FallbackTable::new(config.fallback_addresses.clone()))
            .with_strategy_timeout(config.timeouts.dns);
        resolver.override_ip = config.override_ip;
        resolver
    }

    /// Sets the fallback table.
    pub fn with_fallbacks(mut self, fallbacks: FallbackTable) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    /// Sets an address that bypasses resolution entirely.
    pub fn with_override(mut self, ip: IpAddr) -> Self {
        self.override_ip = Some(ip);
        self
    }

    /// Sets the bound applied to every strategy.
    pub fn with_strategy_timeout(mut self, bound: Duration) -> Self {
        self.strategy_timeout = bound;
        self
    }

    /// Returns the shared cache.
    pub fn cache(&self) -> &Arc<ResolutionCache> {
        &self.cache
    }

    /// Drops the cached entry.
    pub fn invalidate(&self) {
        self.cache.invalidate();
    }

    /// Resolves `host` for 1-indexed `attempt`.
    pub async fn resolve(&self, host: &str, attempt: u32) -> Resolution {
        if let Some(ip) = self.override_ip {
            return Resolution::Override(ip);
        }

        if let Some(ip) = self.cache.get(host) {
            tracing::debug!(host, %ip, "Resolution cache hit");
            return Resolution::Cached(ip);
        }

        for strategy in &self.strategies {
            match self.run_strategy(strategy.as_ref(), host).await {
                Ok(ip) => {
                    self.cache.store(host, ip);
                    tracing::debug!(host, %ip, strategy = strategy.name(), "Resolved SMTP host");
                    return Resolution::Resolved {
                        ip,
                        strategy: strategy.name(),
                    };
                }
                Err(e) => {
                    tracing::warn!(host, strategy = strategy.name(), error = %e, "Resolver strategy failed");
                }
            }
        }

        if let Some(ip) = self.fallbacks.select(host, attempt) {
            tracing::warn!(host, %ip, attempt, "Using fallback address");
            return Resolution::Fallback(ip);
        }

        tracing::warn!(host, "Resolution unavailable, connecting by hostname");
        Resolution::Unresolved
    }

    async fn run_strategy(&self, strategy: &dyn ResolveStrategy, host: &str) -> MailResult<IpAddr> {
        timeout(self.strategy_timeout, strategy.lookup(host))
            .await
            .map_err(|_| {
                MailError::timeout(
                    MailErrorKind::DnsTimeout,
                    format!("{} lookup for {} timed out", strategy.name(), host),
                )
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{ManualClock, StaticStrategy};
    use rstest::rstest;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn resolver_with(
        clock: Arc<ManualClock>,
        strategies: Vec<Box<dyn ResolveStrategy>>,
    ) -> HostResolver {
        let cache = Arc::new(ResolutionCache::new(Duration::from_secs(3600), clock));
        HostResolver::new(cache, strategies)
    }

    #[test]
    fn test_cache_respects_ttl() {
        let clock = Arc::new(ManualClock::new());
        let cache = ResolutionCache::new(Duration::from_secs(3600), clock.clone());

        cache.store("smtp.qq.com", ip("192.0.2.1"));
        clock.advance(Duration::from_secs(3599));
        assert_eq!(cache.get("smtp.qq.com"), Some(ip("192.0.2.1")));
        assert_eq!(cache.get("smtp.163.com"), None);

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get("smtp.qq.com"), None);
        assert!(cache.snapshot().is_some());

        cache.invalidate();
        assert!(cache.snapshot().is_none());
    }

    #[test]
    fn test_cache_is_single_entry() {
        let cache = ResolutionCache::new(Duration::from_secs(60), Arc::new(ManualClock::new()));
        cache.store("a.example.com", ip("192.0.2.1"));
        cache.store("b.example.com", ip("192.0.2.2"));

        assert_eq!(cache.get("a.example.com"), None);
        assert_eq!(cache.get("b.example.com"), Some(ip("192.0.2.2")));
    }

    #[rstest]
    #[case(1, "192.0.2.1")]
    #[case(2, "192.0.2.2")]
    #[case(3, "192.0.2.3")]
    #[case(4, "192.0.2.3")]
    #[case(0, "192.0.2.1")]
    fn test_fallback_selection(#[case] attempt: u32, #[case] expected: &str) {
        let table = FallbackTable::new(HashMap::from([(
            "SMTP.QQ.COM".to_string(),
            vec![ip("192.0.2.1"), ip("192.0.2.2"), ip("192.0.2.3")],
        )]));

        assert_eq!(table.select("smtp.qq.com", attempt), Some(ip(expected)));
        assert_eq!(table.select("smtp.163.com", attempt), None);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_strategies() {
        let clock = Arc::new(ManualClock::new());
        let strategy = StaticStrategy::succeeding("a-record", ip("192.0.2.7"));
        let calls = strategy.calls();
        let resolver = resolver_with(clock.clone(), vec![Box::new(strategy)]);

        let first = resolver.resolve("smtp.qq.com", 1).await;
        assert_eq!(first, Resolution::Resolved { ip: ip("192.0.2.7"), strategy: "a-record" });

        let second = resolver.resolve("smtp.qq.com", 1).await;
        assert_eq!(second, Resolution::Cached(ip("192.0.2.7")));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(3600));
        let third = resolver.resolve("smtp.qq.com", 1).await;
        assert!(matches!(third, Resolution::Resolved { .. }));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_strategies_tried_in_order() {
        let failing = StaticStrategy::failing("a-record");
        let fallback_strategy = StaticStrategy::succeeding("system", ip("192.0.2.9"));
        let resolver = resolver_with(
            Arc::new(ManualClock::new()),
            vec![Box::new(failing), Box::new(fallback_strategy)],
        );

        let resolution = resolver.resolve("smtp.qq.com", 1).await;
        assert_eq!(resolution, Resolution::Resolved { ip: ip("192.0.2.9"), strategy: "system" });
        assert_eq!(resolver.cache().get("smtp.qq.com"), Some(ip("192.0.2.9")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_strategy_is_bounded() {
        let slow = StaticStrategy::succeeding("a-record", ip("192.0.2.1"))
            .with_delay(Duration::from_secs(30));
        let resolver = resolver_with(Arc::new(ManualClock::new()), vec![Box::new(slow)])
            .with_strategy_timeout(Duration::from_secs(5));

        assert_eq!(resolver.resolve("smtp.qq.com", 1).await, Resolution::Unresolved);
    }

    #[tokio::test]
    async fn test_fallback_then_unresolved() {
        let resolver = resolver_with(
            Arc::new(ManualClock::new()),
            vec![Box::new(StaticStrategy::failing("a-record")), Box::new(StaticStrategy::failing("system"))],
        )
        .with_fallbacks(FallbackTable::new(HashMap::from([(
            "smtp.qq.com".to_string(),
            vec![ip("192.0.2.1"), ip("192.0.2.2")],
        )])));

        assert_eq!(resolver.resolve("smtp.qq.com", 1).await, Resolution::Fallback(ip("192.0.2.1")));
        assert_eq!(resolver.resolve("smtp.qq.com", 2).await, Resolution::Fallback(ip("192.0.2.2")));
        assert_eq!(resolver.resolve("smtp.qq.com", 3).await, Resolution::Fallback(ip("192.0.2.2")));
        assert_eq!(resolver.resolve("smtp.example.com", 1).await, Resolution::Unresolved);
        // Fallbacks never populate the cache.
        assert!(resolver.cache().snapshot().is_none());
    }

    #[tokio::test]
    async fn test_override_wins() {
        let strategy = StaticStrategy::succeeding("a-record", ip("192.0.2.7"));
        let calls = strategy.calls();
        let resolver = resolver_with(Arc::new(ManualClock::new()), vec![Box::new(strategy)])
            .with_override(ip("198.51.100.1"));

        let resolution = resolver.resolve("smtp.qq.com", 1).await;
        assert_eq!(resolution, Resolution::Override(ip("198.51.100.1")));
        assert_eq!(resolution.source(), "override");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
