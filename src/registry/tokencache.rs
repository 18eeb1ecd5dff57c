//! TTL-keyed cache of registry bearer tokens, keyed as
//! `(upstreamName, scope, service, authorizationHeaderPresent)`.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Tokens are never served within this margin of their expiry.
const SAFETY_MARGIN: Duration = Duration::from_secs(30);
const MIN_TTL: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct Entry {
    bearer: String,
    expires_at: Instant,
}

pub struct TokenCache {
    enabled: bool,
    default_ttl: Duration,
    entries: DashMap<String, Entry>,
}

impl TokenCache {
    pub fn new(enabled: bool, default_ttl_secs: u64) -> Self {
        Self {
            enabled,
            default_ttl: Duration::from_secs(default_ttl_secs),
            entries: DashMap::new(),
        }
    }

    pub fn key(upstream: &str, scope: &str, service: &str, has_auth: bool) -> String {
        format!("{upstream}\u{1}{scope}\u{1}{service}\u{1}{has_auth}")
    }

    /// Returns the cached bearer token only if it has at least `SAFETY_MARGIN`
    /// left before expiry. A disabled cache is a constant miss.
    pub fn get(&self, key: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let entry = self.entries.get(key)?;
        let now = Instant::now();
        if entry.expires_at > now + SAFETY_MARGIN {
            Some(entry.bearer.clone())
        } else {
            None
        }
    }

    /// Insert/overwrite a token. `expires_in_secs` comes from the upstream's
    /// `expires_in` field when present: TTL is `expires_in - 30s`, floored at
    /// `defaultTTL` and at `MIN_TTL`. Without `expires_in`, TTL is `defaultTTL`.
    pub fn put(&self, key: String, bearer: String, expires_in_secs: Option<u64>) {
        if !self.enabled {
            return;
        }
        let ttl = match expires_in_secs {
            Some(secs) => Duration::from_secs(secs.saturating_sub(30)).max(self.default_ttl),
            None => self.default_ttl,
        }
        .max(MIN_TTL);

        self.entries.insert(
            key,
            Entry {
                bearer,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}
