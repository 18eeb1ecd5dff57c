mod admin;
pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::AppState;

use crate::body::{full_body, json_body, HubBody};
use crate::config::watcher;
use crate::error::HubProxyError;
use crate::ratelimit::{self, Verdict};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Run the main proxy server with graceful shutdown support.
///
/// When `shutdown` is notified the server stops accepting new connections
/// and waits up to `DRAIN_TIMEOUT` for in-flight requests to finish before
/// forcibly dropping them.
pub async fn run_proxy_server(listen: &str, state: AppState, shutdown: Arc<Notify>) -> anyhow::Result<()> {
    const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: proxy listening, addr={}", addr);

    let in_flight = Arc::new(tokio::sync::Semaphore::new(0));
    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: proxy: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!("hubproxy_connections_total", "status" => "accepted").increment(1);
                v
            }
            Err(e) => {
                error!("server: proxy: accept failed, error={}", e);
                metrics::counter!("hubproxy_connections_total", "status" => "error").increment(1);
                continue;
            }
        };

        metrics::gauge!("hubproxy_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        in_flight.add_permits(1);
        let in_flight = in_flight.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let state_inner = state.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state_inner.clone();
                async move { Ok::<_, std::convert::Infallible>(dispatch(req, state, peer_addr).await) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: proxy: connection error, peer={}, error={}", peer_addr, e);
                }
            }

            metrics::gauge!("hubproxy_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
            let _ = in_flight.acquire().await;
        });
    }

    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!("server: proxy: waiting for {} active connections to drain", active);
        let drain = async {
            loop {
                if active_conns.load(Ordering::Relaxed) == 0 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(_) => info!("server: proxy: all connections drained"),
            Err(_) => {
                let remaining = active_conns.load(Ordering::Relaxed);
                info!(
                    "server: proxy: drain timeout ({}s), {} connections still active",
                    DRAIN_TIMEOUT.as_secs(),
                    remaining
                );
            }
        }
    }

    Ok(())
}

/// Run a simple admin server for health/readiness checks and metrics.
pub async fn run_admin_server(listen: &str, state: AppState) -> anyhow::Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}

/// Spawn the background tasks every running proxy needs regardless of how it
/// was started: the config-file watcher (republishes a fresh `ConfigSnapshot`
/// on mtime change) plus a resync loop that rebuilds the rate limiter's CIDR
/// lists and the registry's token cache from whatever snapshot is currently
/// published, and rate-limiter bucket eviction.
pub fn spawn_background_tasks(state: &AppState) {
    watcher::spawn(state.config.clone());

    let resync_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(watcher::POLL_INTERVAL);
        loop {
            interval.tick().await;
            resync_state.resync_derived();
        }
    });

    state.rate_limit.clone().spawn_eviction();
}

/// Top-level request pipeline, uniform across every route: rate limit first
/// (including `/token*` — exempting it would let a client dodge the limiter
/// by hitting the token endpoint directly), then static paths, then the
/// registry proxy for `/v2/*`+`/token*`, then the generic URL proxy as
/// catch-all. Panics inside a handler are isolated per task and surfaced as
/// a `500 INTERNAL_ERROR` instead of taking the connection down.
async fn dispatch(req: Request<Incoming>, state: AppState, peer_addr: SocketAddr) -> Response<HubBody> {
    let snapshot = state.snapshot();
    let path = req.uri().path().to_string();

    let client_ip = ratelimit::resolve_client_ip(
        req.headers().get("x-forwarded-for").and_then(|v| v.to_str().ok()),
        req.headers().get("x-real-ip").and_then(|v| v.to_str().ok()),
        req.headers().get("x-original-forwarded-for").and_then(|v| v.to_str().ok()),
        peer_addr.ip(),
    );

    if !ratelimit::is_exempt_path(&path) {
        let verdict = state
            .rate_limit
            .check(client_ip, snapshot.requests_per_period, snapshot.period_hours)
            .await;
        match verdict {
            Verdict::Allowed => {
                metrics::counter!("hubproxy_rate_limit_allowed_total").increment(1);
            }
            Verdict::RateLimited => {
                metrics::counter!("hubproxy_rate_limit_rejected_total", "reason" => "rate").increment(1);
                return error_response(&HubProxyError::RateLimited);
            }
            Verdict::IpDenied => {
                metrics::counter!("hubproxy_rate_limit_rejected_total", "reason" => "ip_denied").increment(1);
                return error_response(&HubProxyError::IpDenied);
            }
        }
    }

    let req = req.map(|incoming| {
        use http_body_util::BodyExt;
        incoming.boxed()
    });

    let result = tokio::spawn(route(req, state, snapshot, client_ip, path))
        .await
        .unwrap_or_else(|join_err| {
            error!("server: handler task panicked, error={}", join_err);
            Err(HubProxyError::PanicRecovered)
        });

    match result {
        Ok(resp) => resp,
        Err(e) => error_response(&e),
    }
}

async fn route(
    req: Request<HubBody>,
    state: AppState,
    snapshot: Arc<crate::config::ConfigSnapshot>,
    client_ip: std::net::IpAddr,
    path: String,
) -> Result<Response<HubBody>, HubProxyError> {
    if path == "/" || path == "/favicon.ico" {
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .body(full_body(Bytes::from_static(b"hubproxy")))
            .map_err(|e| HubProxyError::Internal(e.to_string()))?);
    }

    if path.starts_with("/v2") {
        let registry = state.registry.load();
        return registry.handle_v2(req, &snapshot, client_ip).await;
    }

    if path == "/token" || path.starts_with("/token/") {
        let registry = state.registry.load();
        return registry.handle_token(req, &snapshot).await;
    }

    state.url_proxy.handle(req, &snapshot, client_ip).await
}

fn error_response(err: &HubProxyError) -> Response<HubBody> {
    let (status, message) = err.status_and_message();
    let body = match err.code() {
        Some(code) => json!({ "error": message, "code": code }),
        None => json!({ "error": message }),
    };
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(json_body(&body))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(full_body(Bytes::from_static(b"{\"error\":\"internal\"}")))
                .unwrap()
        })
}
