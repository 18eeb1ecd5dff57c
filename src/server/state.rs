use crate::client::{self, HubClient};
use crate::config::{ConfigSnapshot, ConfigStore};
use crate::metrics::Metrics;
use crate::ratelimit::{CidrLists, RateLimiter};
use crate::registry::RegistryProxy;
use crate::urlproxy::UrlProxy;
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Shared proxy state, cheaply cloneable. `config` is the single source of
/// truth every other field is (re)derived from; `registry` is rebuilt
/// wholesale (its token cache keys off `config`'s TTL settings) while
/// `rate_limit` only needs its CIDR lists refreshed.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub rate_limit: Arc<RateLimiter>,
    pub registry: Arc<ArcSwap<RegistryProxy>>,
    pub url_proxy: Arc<UrlProxy>,
    pub metrics: Metrics,
    client: HubClient,
}

impl AppState {
    pub async fn new(config_path: std::path::PathBuf) -> Result<Self> {
        let store = Arc::new(ConfigStore::load(config_path)?);
        let snapshot = store.get();

        let client = client::build_client();
        let registry = RegistryProxy::new(client.clone(), &snapshot);
        let url_proxy = UrlProxy::new(client.clone());

        let cidr = CidrLists::parse(&snapshot.ip_white_list, &snapshot.ip_black_list);
        let rate_limit = RateLimiter::new(cidr);

        let metrics = Metrics::install();

        Ok(Self {
            config: store,
            rate_limit,
            registry: Arc::new(ArcSwap::from_pointee(registry)),
            url_proxy: Arc::new(url_proxy),
            metrics,
            client,
        })
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.config.get()
    }

    /// Rebuild the rate limiter's CIDR lists and the registry's token cache
    /// from whatever `ConfigSnapshot` is currently published. Idempotent —
    /// safe to call on a timer regardless of whether the snapshot actually
    /// changed since the last call.
    pub fn resync_derived(&self) {
        let snapshot = self.config.get();
        self.rate_limit
            .update_cidr(CidrLists::parse(&snapshot.ip_white_list, &snapshot.ip_black_list));
        self.registry
            .store(Arc::new(RegistryProxy::new(self.client.clone(), &snapshot)));
    }
}
