//! Single shared outbound HTTP client used by the registry proxy, the
//! generic URL proxy, and registry auth subrequests alike — one connection
//! pool, tuned once at startup, instead of one per upstream cluster.

use crate::body::HubBody;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

pub type HubClient = Client<HttpsConnector<HttpConnector>, HubBody>;

/// Idle connections are kept warm for this long before the pool drops them.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// Max idle connections kept per upstream host.
const POOL_MAX_IDLE_PER_HOST: usize = 32;
/// TCP connect deadline. There is deliberately no total-request timeout —
/// streaming downloads of arbitrary size must not be cut off mid-transfer.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the proxy's single outbound client. Certificate validation is
/// always enforced — every upstream here is a public registry or CDN over
/// the public internet, never an internal mesh hop.
///
/// Redirects are not auto-followed: `hyper_util`'s legacy `Client` never
/// follows redirects itself, which is exactly the "automatic redirects
/// disabled" behaviour the registry and URL proxies need so they can
/// rewrite `Location` headers before choosing whether to follow them.
pub fn build_client() -> HubClient {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(POOL_IDLE_TIMEOUT));
    http.set_connect_timeout(Some(CONNECT_TIMEOUT));
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build(https)
}
