pub mod patterns;

use crate::access;
use crate::body::HubBody;
use crate::client::HubClient;
use crate::config::ConfigSnapshot;
use crate::error::HubProxyError;
use crate::headers::{inject_forwarded_headers, strip_hop_by_hop, strip_security_headers};
use crate::rewrite;
use http::{HeaderValue, Request, Response, Uri};
use std::net::IpAddr;
use std::sync::Arc;

const MAX_REDIRECTS: u32 = 20;

pub struct UrlProxy {
    client: HubClient,
}

impl UrlProxy {
    pub fn new(client: HubClient) -> Self {
        Self { client }
    }

    /// Handle any request that didn't match a registered route. The request
    /// path (minus its leading slash) is treated as the target URL.
    pub async fn handle(
        &self,
        req: Request<HubBody>,
        snapshot: &Arc<ConfigSnapshot>,
        client_ip: IpAddr,
    ) -> Result<Response<HubBody>, HubProxyError> {
        let target = normalize_target(req.uri())?;

        let (pattern, user_repo) = patterns::match_url(&target).ok_or(HubProxyError::InvalidTargetUrl)?;
        let _ = pattern;

        if let Some((user, repo)) = &user_repo {
            let decision = access::check_github(user, repo, &snapshot.repo_white_list, &snapshot.repo_black_list);
            if let access::Decision::Deny(reason) = decision {
                return Err(HubProxyError::AccessDenied(reason));
            }
        }

        let target = patterns::rewrite_blob_to_raw(&target).unwrap_or(target);
        let proxy_host = request_proxy_origin(&req, snapshot);

        self.forward(req, target, snapshot, client_ip, &proxy_host, 0).await
    }

    fn forward<'a>(
        &'a self,
        req: Request<HubBody>,
        target: String,
        snapshot: &'a Arc<ConfigSnapshot>,
        client_ip: IpAddr,
        proxy_host: &'a str,
        hop: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Response<HubBody>, HubProxyError>> + Send + 'a>> {
        Box::pin(async move {
            if hop >= MAX_REDIRECTS {
                return Err(HubProxyError::RedirectLoop);
            }

            let uri: Uri = target.parse().map_err(|_| HubProxyError::InvalidTargetUrl)?;
            let host = uri.host().unwrap_or("").to_string();

            let (mut parts, body) = req.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            inject_forwarded_headers(&mut parts.headers, client_ip, &host);
            parts.headers.remove(http::header::HOST);
            parts.uri = uri;

            let upstream_req = Request::from_parts(parts, body);

            let resp = self
                .client
                .request(upstream_req)
                .await
                .map_err(|e| HubProxyError::UpstreamDial(e.to_string()))?;

            self.handle_response(resp, snapshot, client_ip, proxy_host, hop, &target).await
        })
    }

    async fn handle_response(
        &self,
        resp: Response<hyper::body::Incoming>,
        snapshot: &Arc<ConfigSnapshot>,
        client_ip: IpAddr,
        proxy_host: &str,
        hop: u32,
        requested_target: &str,
    ) -> Result<Response<HubBody>, HubProxyError> {
        if let Some(len) = resp
            .headers()
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
        {
            if len > snapshot.max_body_bytes {
                return Err(HubProxyError::BodyTooLarge(snapshot.max_body_bytes));
            }
        }

        if resp.status().is_redirection() {
            if let Some(location) = resp.headers().get(http::header::LOCATION).and_then(|v| v.to_str().ok()) {
                let absolute = resolve_location(requested_target, location);
                if patterns::match_url(&absolute).is_some() {
                    return Ok(redirect_to_self(&absolute));
                }

                let req = Request::builder()
                    .method(http::Method::GET)
                    .uri(absolute.parse::<Uri>().map_err(|_| HubProxyError::RedirectLoop)?)
                    .body(crate::body::empty_body())
                    .map_err(|e| HubProxyError::Internal(e.to_string()))?;
                return self.forward(req, absolute, snapshot, client_ip, proxy_host, hop + 1).await;
            }
        }

        let (mut parts, body) = resp.into_parts();
        strip_security_headers(&mut parts.headers);
        strip_hop_by_hop(&mut parts.headers);

        let body = if requested_target.to_ascii_lowercase().ends_with(".sh") {
            let is_gzip = parts
                .headers
                .get(http::header::CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case("gzip"))
                .unwrap_or(false);

            if is_gzip {
                parts.headers.remove(http::header::CONTENT_ENCODING);
                parts.headers.remove(http::header::CONTENT_LENGTH);
                parts.headers.insert(
                    http::header::TRANSFER_ENCODING,
                    HeaderValue::from_static("chunked"),
                );
            }

            use http_body_util::BodyExt;
            rewrite::rewrite_stream(body.boxed(), is_gzip, proxy_host.to_string())
        } else {
            use http_body_util::BodyExt;
            body.boxed()
        };

        Ok(Response::from_parts(parts, body))
    }
}

/// The origin this proxy is reachable at for *this* request, used to prefix
/// rewritten URLs inside `.sh` bodies. Read from the request's own authority
/// (`:authority` on h2, `Host` on h1) rather than the bind address, since the
/// bind address is usually `0.0.0.0` and tells a downloaded script nothing
/// about the hostname a client actually used to reach the proxy.
fn request_proxy_origin(req: &Request<HubBody>, snapshot: &ConfigSnapshot) -> String {
    let host = req
        .uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            req.headers()
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| snapshot.bind_host.clone());

    format!("https://{host}")
}

/// Step 1 of the generic URL proxy: treat the path (minus leading slashes)
/// as the target URL, stripping a malformed `http:/`/`https:/` prefix and
/// prepending `https://` when the scheme is missing entirely.
fn normalize_target(uri: &Uri) -> Result<String, HubProxyError> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let stripped = path.trim_start_matches('/');

    let candidate = if stripped.starts_with("https://") || stripped.starts_with("http://") {
        stripped.to_string()
    } else if let Some(rest) = stripped
        .strip_prefix("https:/")
        .or_else(|| stripped.strip_prefix("http:/"))
    {
        format!("https://{}", rest.trim_start_matches('/'))
    } else {
        format!("https://{stripped}")
    };

    if !candidate.starts_with("https://") && !candidate.starts_with("http://") {
        return Err(HubProxyError::InvalidTargetUrl);
    }

    Ok(candidate)
}

fn resolve_location(base: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        location.to_string()
    } else if let Some(scheme_end) = base.find("://") {
        let scheme_host_end = base[scheme_end + 3..].find('/').map(|i| i + scheme_end + 3).unwrap_or(base.len());
        format!("{}{}", &base[..scheme_host_end], location)
    } else {
        location.to_string()
    }
}

fn redirect_to_self(target: &str) -> Response<HubBody> {
    Response::builder()
        .status(http::StatusCode::FOUND)
        .header(http::header::LOCATION, format!("/{target}"))
        .body(crate::body::empty_body())
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Uri;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_normalize_target_prepends_https() {
        let t = normalize_target(&uri("/github.com/user/repo/releases/download/v1/x.tar.gz")).unwrap();
        assert_eq!(t, "https://github.com/user/repo/releases/download/v1/x.tar.gz");
    }

    #[test]
    fn test_normalize_target_passes_through_explicit_https() {
        let t = normalize_target(&uri("/https://github.com/user/repo/releases/download/v1/x.tar.gz")).unwrap();
        assert_eq!(t, "https://github.com/user/repo/releases/download/v1/x.tar.gz");
    }

    #[test]
    fn test_normalize_target_fixes_malformed_scheme() {
        let t = normalize_target(&uri("/https:/github.com/user/repo/raw/main/x.sh")).unwrap();
        assert_eq!(t, "https://github.com/user/repo/raw/main/x.sh");
    }

    #[test]
    fn test_resolve_location_relative_to_base_origin() {
        let resolved = resolve_location("https://github.com/u/r/releases/download/v1/x", "/u/r/releases/v1/x2");
        assert_eq!(resolved, "https://github.com/u/r/releases/v1/x2");
    }

    #[test]
    fn test_resolve_location_absolute_passthrough() {
        let resolved = resolve_location("https://github.com/x", "https://cdn.example.com/y");
        assert_eq!(resolved, "https://cdn.example.com/y");
    }

    fn snapshot_with_bind_host(host: &str) -> ConfigSnapshot {
        let mut raw = crate::config::RawConfig::default();
        raw.server.host = host.to_string();
        ConfigSnapshot::build(raw)
    }

    #[test]
    fn test_request_proxy_origin_prefers_host_header() {
        let snapshot = snapshot_with_bind_host("0.0.0.0");
        let req = Request::builder()
            .uri("/github.com/u/r/raw/main/x.sh")
            .header(http::header::HOST, "proxy.example.com")
            .body(crate::body::empty_body())
            .unwrap();
        assert_eq!(request_proxy_origin(&req, &snapshot), "https://proxy.example.com");
    }

    #[test]
    fn test_request_proxy_origin_falls_back_to_bind_host() {
        let snapshot = snapshot_with_bind_host("0.0.0.0");
        let req = Request::builder()
            .uri("/github.com/u/r/raw/main/x.sh")
            .body(crate::body::empty_body())
            .unwrap();
        assert_eq!(request_proxy_origin(&req, &snapshot), "https://0.0.0.0");
    }
}
