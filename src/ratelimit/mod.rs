//! Per-client-IP token-bucket rate limiting with CIDR allow/deny lists.
//!
//! Each bucket is a `tokio::sync::Mutex`-protected token count plus an atomic
//! `last_access` timestamp so the eviction sweep can scan for idle entries
//! without taking any bucket's lock.

use dashmap::DashMap;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

const PRECISION: u64 = 1_000_000;

/// Entries idle longer than this are eligible for eviction.
const IDLE_EVICT_SECS: u64 = 60 * 60;
/// Hard cap on the table; exceeding it truncates the whole table.
const MAX_ENTRIES: usize = 10_000;
/// Eviction sweep interval.
const GC_INTERVAL_SECS: u64 = 10 * 60;

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_micros() as u64
}

struct Bucket {
    inner: Mutex<BucketInner>,
    last_access: AtomicU64,
}

struct BucketInner {
    tokens: u64,
    last_refill: u64,
    rate_per_us: f64,
    max_tokens: u64,
}

impl Bucket {
    fn new(rate_per_us: f64, max_tokens: u64) -> Self {
        let now = now_us();
        Self {
            inner: Mutex::new(BucketInner {
                tokens: max_tokens,
                last_refill: now,
                rate_per_us,
                max_tokens,
            }),
            last_access: AtomicU64::new(now),
        }
    }

    /// Infinite-rate bucket for allow-listed IPs: always admits, but is still
    /// recorded in the table so eviction bookkeeping treats it like any entry.
    fn unlimited() -> Self {
        Self::new(f64::MAX, u64::MAX)
    }

    async fn try_acquire(&self) -> bool {
        let now = now_us();
        let mut b = self.inner.lock().await;

        let elapsed = now.saturating_sub(b.last_refill);
        if elapsed > 0 {
            let refill = (elapsed as f64 * b.rate_per_us * PRECISION as f64) as u64;
            b.tokens = b.tokens.saturating_add(refill).min(b.max_tokens);
            b.last_refill = now;
        }

        if b.tokens >= PRECISION {
            b.tokens -= PRECISION;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CidrLists {
    pub allow: Vec<IpNetwork>,
    pub deny: Vec<IpNetwork>,
}

impl CidrLists {
    /// Parse config string lists into CIDR networks. A bare IP is promoted to
    /// `/32` (v4) or `/128` (v6); malformed entries are logged and skipped.
    pub fn parse(allow: &[String], deny: &[String]) -> Self {
        Self {
            allow: allow.iter().filter_map(|s| parse_one(s)).collect(),
            deny: deny.iter().filter_map(|s| parse_one(s)).collect(),
        }
    }

    fn matches_deny(&self, ip: &IpAddr) -> bool {
        self.deny.iter().any(|net| net.contains(*ip))
    }

    fn matches_allow(&self, ip: &IpAddr) -> bool {
        self.allow.iter().any(|net| net.contains(*ip))
    }
}

fn parse_one(s: &str) -> Option<IpNetwork> {
    if let Ok(net) = s.parse::<IpNetwork>() {
        return Some(net);
    }
    match s.parse::<IpAddr>() {
        Ok(ip) => IpNetwork::new(ip, if ip.is_ipv4() { 32 } else { 128 }).ok(),
        Err(_) => {
            tracing::warn!(entry = %s, "skipping unparseable CIDR entry");
            None
        }
    }
}

pub enum Verdict {
    Allowed,
    RateLimited,
    IpDenied,
}

/// Normalise a client IP to its bucket key: IPv4 is kept exact, IPv6 is
/// truncated to its top 64 bits so prefix-sharing addresses share a bucket.
pub fn normalize_key(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            format!(
                "{:x}:{:x}:{:x}:{:x}::/64",
                segments[0], segments[1], segments[2], segments[3]
            )
        }
    }
}

pub struct RateLimiter {
    buckets: DashMap<String, Arc<Bucket>>,
    cidr: arc_swap::ArcSwap<CidrLists>,
}

impl RateLimiter {
    pub fn new(cidr: CidrLists) -> Arc<Self> {
        Arc::new(Self {
            buckets: DashMap::new(),
            cidr: arc_swap::ArcSwap::from_pointee(cidr),
        })
    }

    /// Replace the parsed CIDR lists after a config reload. Existing buckets
    /// are untouched; only the allow/deny decision path changes.
    pub fn update_cidr(&self, cidr: CidrLists) {
        self.cidr.store(Arc::new(cidr));
    }

    /// Check and consume one token for `ip` under the given rate parameters.
    /// `requests_per_period`/`period_hours` come straight from the published
    /// `ConfigSnapshot`, so refill rate tracks config changes on the next call.
    pub async fn check(&self, ip: IpAddr, requests_per_period: u64, period_hours: f64) -> Verdict {
        let cidr = self.cidr.load();
        if cidr.matches_deny(&ip) {
            return Verdict::IpDenied;
        }

        let key = normalize_key(&ip);
        let allowed_unlimited = cidr.matches_allow(&ip);

        let bucket = if let Some(entry) = self.buckets.get(&key) {
            entry.value().clone()
        } else {
            let rate = (requests_per_period as f64 / (period_hours * 3600.0)).max(0.0);
            let burst = requests_per_period.max(1);
            let new_bucket = if allowed_unlimited {
                Bucket::unlimited()
            } else {
                Bucket::new(rate / 1_000_000.0, burst * PRECISION)
            };
            self.buckets
                .entry(key.clone())
                .or_insert_with(|| Arc::new(new_bucket))
                .clone()
        };

        bucket.last_access.store(now_us(), Ordering::Relaxed);

        if bucket.try_acquire().await {
            Verdict::Allowed
        } else {
            Verdict::RateLimited
        }
    }

    pub fn spawn_eviction(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(GC_INTERVAL_SECS));
            loop {
                interval.tick().await;
                limiter.evict_stale();
            }
        })
    }

    fn evict_stale(&self) {
        let now = now_us();
        let expire_us = IDLE_EVICT_SECS * 1_000_000;
        self.buckets
            .retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_us);

        if self.buckets.len() > MAX_ENTRIES {
            tracing::warn!(
                size = self.buckets.len(),
                "rate limiter table exceeded cap after idle eviction, truncating fully"
            );
            self.buckets.clear();
        }
    }
}

/// Paths exempt from rate-limit accounting (still served, never counted).
pub fn is_exempt_path(path: &str) -> bool {
    matches!(path, "/" | "/favicon.ico" | "/images.html" | "/search.html") || path.starts_with("/public/")
}

/// Resolve the client IP per the header precedence, falling back to the
/// transport peer address. Strips any `:port` suffix left over from a
/// bracketed IPv6 literal or `host:port` pair.
pub fn resolve_client_ip(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    original_forwarded_for: Option<&str>,
    peer: IpAddr,
) -> IpAddr {
    let candidate = forwarded_for
        .and_then(first_value)
        .or_else(|| real_ip.and_then(first_value))
        .or_else(|| original_forwarded_for.and_then(first_value));

    candidate
        .and_then(|s| strip_port(&s).parse::<IpAddr>().ok())
        .unwrap_or(peer)
}

fn first_value(header: &str) -> Option<String> {
    header.split(',').next().map(|s| s.trim().to_string())
}

fn strip_port(s: &str) -> String {
    if let Some(stripped) = s.strip_prefix('[') {
        if let Some(end) = stripped.find(']') {
            return stripped[..end].to_string();
        }
    }
    if s.matches(':').count() == 1 {
        if let Some((host, _port)) = s.rsplit_once(':') {
            return host.to_string();
        }
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_key_ipv4_exact() {
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        assert_eq!(normalize_key(&ip), "1.2.3.4");
    }

    #[test]
    fn test_normalize_key_ipv6_truncates_to_64() {
        let a: IpAddr = "2001:db8::1".parse().unwrap();
        let b: IpAddr = "2001:db8::ffff".parse().unwrap();
        assert_eq!(normalize_key(&a), normalize_key(&b));

        let c: IpAddr = "2001:db8:1::1".parse().unwrap();
        assert_ne!(normalize_key(&a), normalize_key(&c));
    }

    #[tokio::test]
    async fn test_token_bucket_allows_burst_then_rejects() {
        let limiter = RateLimiter::new(CidrLists::default());
        let ip: IpAddr = "9.9.9.9".parse().unwrap();

        let mut allowed = 0;
        for _ in 0..25 {
            if matches!(limiter.check(ip, 20, 1.0).await, Verdict::Allowed) {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 20);
    }

    #[tokio::test]
    async fn test_deny_list_rejects_regardless_of_bucket() {
        let cidr = CidrLists::parse(&[], &["1.2.3.0/24".to_string()]);
        let limiter = RateLimiter::new(cidr);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        assert!(matches!(limiter.check(ip, 20, 1.0).await, Verdict::IpDenied));
    }

    #[tokio::test]
    async fn test_allow_list_bypasses_bucket() {
        let cidr = CidrLists::parse(&["5.5.5.5/32".to_string()], &[]);
        let limiter = RateLimiter::new(cidr);
        let ip: IpAddr = "5.5.5.5".parse().unwrap();
        for _ in 0..1000 {
            assert!(matches!(limiter.check(ip, 1, 1.0).await, Verdict::Allowed));
        }
    }

    #[test]
    fn test_resolve_client_ip_precedence() {
        let peer: IpAddr = "10.0.0.9".parse().unwrap();
        assert_eq!(
            resolve_client_ip(Some("2001:db8::1, 10.0.0.1"), None, None, peer),
            "2001:db8::1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            resolve_client_ip(None, Some("1.2.3.4"), None, peer),
            "1.2.3.4".parse::<IpAddr>().unwrap()
        );
        assert_eq!(resolve_client_ip(None, None, None, peer), peer);
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("1.2.3.4:8080"), "1.2.3.4");
        assert_eq!(strip_port("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn test_exempt_paths() {
        assert!(is_exempt_path("/"));
        assert!(is_exempt_path("/favicon.ico"));
        assert!(is_exempt_path("/public/logo.png"));
        assert!(!is_exempt_path("/v2/library/nginx/manifests/latest"));
    }
}
