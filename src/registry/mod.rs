//! OCI v2 request translation, registry auth-challenge handling, and response
//! streaming — accepts everything under `/v2/*` and `/token*`.

pub mod auth;
pub mod tokencache;

use crate::access;
use crate::body::HubBody;
use crate::client::HubClient;
use crate::config::{AuthType, ConfigSnapshot};
use crate::error::HubProxyError;
use crate::headers::{inject_forwarded_headers, strip_hop_by_hop, strip_security_headers};
use bytes::Bytes;
use http::{HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use std::net::IpAddr;
use std::sync::Arc;
use tokencache::TokenCache;

const DOCKER_HUB_UPSTREAM: &str = "registry-1.docker.io";
const MAX_REDIRECTS: u32 = 20;

/// Parsed `{namespace, repository, tag}` image reference, per the Docker
/// image-reference grammar: a first path segment containing a `.` names an
/// explicit registry host rather than a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub upstream_host: Option<String>,
    pub namespace: String,
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.repository)
    }

    pub fn parse(reference: &str) -> Self {
        let (name_part, tag) = match reference.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => (name, tag.to_string()),
            _ => (reference, "latest".to_string()),
        };

        let mut segments: Vec<&str> = name_part.split('/').filter(|s| !s.is_empty()).collect();
        let upstream_host = if segments.len() > 1 && segments[0].contains('.') {
            Some(segments.remove(0).to_string())
        } else {
            None
        };

        let (namespace, repository) = match segments.len() {
            0 => ("library".to_string(), String::new()),
            1 => ("library".to_string(), segments[0].to_string()),
            _ => (segments[0].to_string(), segments[1..].join("/")),
        };

        Self {
            upstream_host,
            namespace,
            repository,
            tag,
        }
    }
}

/// Where an incoming `/v2/<rest>` request should be forwarded, after
/// stripping any leading registry-name segment and injecting `library/`
/// for bare Docker Hub single-segment image names.
struct Translated {
    upstream_host: String,
    auth_host: String,
    auth_type: AuthType,
    path: String,
}

fn translate_path(snapshot: &ConfigSnapshot, v2_rest: &str) -> Translated {
    let rest = v2_rest.trim_start_matches('/');
    let mut parts = rest.splitn(2, '/');
    let first = parts.next().unwrap_or("");
    let remainder = parts.next().unwrap_or("");

    if let Some(entry) = snapshot.registries.get(first) {
        return Translated {
            upstream_host: entry.upstream.clone(),
            auth_host: entry.auth_host.clone().unwrap_or_else(|| entry.upstream.clone()),
            auth_type: entry.auth_type,
            path: format!("/v2/{remainder}"),
        };
    }

    // Docker Hub: inject `library/` when only one path segment precedes the
    // resource verb (manifests/blobs/tags).
    let segment_count = rest.split('/').filter(|s| !s.is_empty()).count();
    let path = if segment_count <= 3 {
        format!("/v2/library/{rest}")
    } else {
        format!("/v2/{rest}")
    };

    Translated {
        upstream_host: DOCKER_HUB_UPSTREAM.to_string(),
        auth_host: "auth.docker.io".to_string(),
        auth_type: AuthType::Docker,
        path,
    }
}

/// Extract the image name component from a translated `/v2/<name>/<verb>/<ref>`
/// path, for access-control purposes.
fn image_ref_from_path(path: &str) -> Option<ImageRef> {
    let rest = path.strip_prefix("/v2/")?;
    let (name, suffix) = rest.rsplit_once('/')?;
    let (name, _verb) = name.rsplit_once('/').map(|(n, v)| (n, Some(v))).unwrap_or((name, None));
    let _ = suffix;
    Some(ImageRef::parse(name))
}

pub struct RegistryProxy {
    client: HubClient,
    tokens: TokenCache,
}

impl RegistryProxy {
    pub fn new(client: HubClient, snapshot: &ConfigSnapshot) -> Self {
        Self {
            client,
            tokens: TokenCache::new(snapshot.token_cache_enabled, snapshot.token_cache_default_ttl),
        }
    }

    /// Handle any request under `/v2/*`.
    pub async fn handle_v2(
        &self,
        req: Request<HubBody>,
        snapshot: &Arc<ConfigSnapshot>,
        client_ip: IpAddr,
    ) -> Result<Response<HubBody>, HubProxyError> {
        let v2_rest = req.uri().path().strip_prefix("/v2").unwrap_or("");
        let translated = translate_path(snapshot, v2_rest);

        if let Some(image) = image_ref_from_path(&translated.path) {
            let decision = access::check(
                &access::FullName::new(&image.namespace, &image.repository),
                &snapshot.repo_white_list,
                &snapshot.repo_black_list,
            );
            if let access::Decision::Deny(reason) = decision {
                return Err(HubProxyError::AccessDenied(reason));
            }
        }

        self.forward_with_auth(req, &translated, client_ip).await
    }

    /// `/token` and `/token/*` — pass-through to the resolved auth host. Does
    /// not consult the token cache; C3 rate limiting still applies at the router.
    pub async fn handle_token(
        &self,
        req: Request<HubBody>,
        snapshot: &Arc<ConfigSnapshot>,
    ) -> Result<Response<HubBody>, HubProxyError> {
        let service = query_param(req.uri(), "service").unwrap_or_default();
        let auth_host = snapshot
            .registries
            .values()
            .find(|r| r.auth_host.as_deref() == Some(service.as_str()) || r.upstream == service)
            .and_then(|r| r.auth_host.clone())
            .unwrap_or_else(|| "auth.docker.io".to_string());

        let mut parts = req.into_parts();
        let uri = rebuild_uri(&auth_host, parts.0.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/"))?;
        parts.0.uri = uri;
        parts.0.headers.remove(http::header::HOST);
        let upstream_req = Request::from_parts(parts.0, parts.1);

        let resp = self
            .client
            .request(upstream_req)
            .await
            .map_err(|e| HubProxyError::UpstreamDial(e.to_string()))?;
        Ok(convert_response(resp))
    }

    async fn forward_with_auth(
        &self,
        req: Request<HubBody>,
        translated: &Translated,
        client_ip: IpAddr,
    ) -> Result<Response<HubBody>, HubProxyError> {
        let (parts, body) = req.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| HubProxyError::UpstreamRead(e.to_string()))?
            .to_bytes();

        let original_auth = parts.headers.get(http::header::AUTHORIZATION).cloned();
        let has_auth = original_auth.is_some();

        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);
        inject_forwarded_headers(&mut headers, client_ip, &translated.upstream_host);
        headers.remove(http::header::HOST);

        let first_resp = self
            .send_upstream(&parts.method, &translated.upstream_host, &translated.path, &headers, body_bytes.clone())
            .await?;

        if first_resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(self.finish_response(first_resp, 0).await?);
        }

        let challenge = first_resp
            .headers()
            .get(http::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(auth::Challenge::parse);

        let Some(challenge) = challenge else {
            return Ok(self.finish_response(first_resp, 0).await?);
        };

        let cache_key = TokenCache::key(&translated.upstream_host, &challenge.scope, &challenge.service, has_auth);

        let bearer = match self.tokens.get(&cache_key) {
            Some(token) => Some(token),
            None => {
                let fetched = auth::fetch_token(
                    &self.client,
                    &challenge,
                    translated.auth_type,
                    original_auth.as_ref(),
                )
                .await?;
                if let Some((ref token, expires_in)) = fetched {
                    self.tokens.put(cache_key, token.clone(), expires_in);
                }
                fetched.map(|(t, _)| t)
            }
        };

        let Some(bearer) = bearer else {
            return Ok(self.finish_response(first_resp, 0).await?);
        };

        let mut retry_headers = headers.clone();
        retry_headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {bearer}")).map_err(|e| HubProxyError::Internal(e.to_string()))?,
        );

        let retry_resp = self
            .send_upstream(&parts.method, &translated.upstream_host, &translated.path, &retry_headers, body_bytes)
            .await?;

        if retry_resp.status() == StatusCode::UNAUTHORIZED {
            return Err(HubProxyError::AuthFailed);
        }

        Ok(self.finish_response(retry_resp, 0).await?)
    }

    async fn send_upstream(
        &self,
        method: &http::Method,
        upstream_host: &str,
        path: &str,
        headers: &http::HeaderMap,
        body: Bytes,
    ) -> Result<Response<HubBody>, HubProxyError> {
        let uri = rebuild_uri(upstream_host, path)?;
        let mut builder = Request::builder().method(method.clone()).uri(uri);
        *builder.headers_mut().unwrap() = headers.clone();
        let req = builder
            .body(crate::body::full_body(body))
            .map_err(|e| HubProxyError::Internal(e.to_string()))?;

        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| HubProxyError::UpstreamDial(e.to_string()))?;
        Ok(convert_response(resp))
    }

    /// Follow blob-storage `307` redirects server-side up to `MAX_REDIRECTS`
    /// hops, then return the terminal response with headers cleaned up.
    async fn finish_response(&self, mut resp: Response<HubBody>, hop: u32) -> Result<Response<HubBody>, HubProxyError> {
        if resp.status().is_redirection() {
            if hop >= MAX_REDIRECTS {
                return Err(HubProxyError::RedirectLoop);
            }
            if let Some(location) = resp.headers().get(http::header::LOCATION).and_then(|v| v.to_str().ok()) {
                let absolute = location.to_string();
                let uri: Uri = absolute.parse().map_err(|_| HubProxyError::RedirectLoop)?;
                let req = Request::builder()
                    .method(http::Method::GET)
                    .uri(uri)
                    .body(crate::body::empty_body())
                    .map_err(|e| HubProxyError::Internal(e.to_string()))?;
                let next = self
                    .client
                    .request(req)
                    .await
                    .map_err(|e| HubProxyError::UpstreamDial(e.to_string()))?;
                return Box::pin(self.finish_response(convert_response(next), hop + 1)).await;
            }
        }

        strip_security_headers(resp.headers_mut());
        strip_hop_by_hop(resp.headers_mut());
        // Never forward the upstream's own challenge to the client: it names
        // the upstream's auth host/service, which confuses a `docker` client
        // talking to this proxy instead.
        resp.headers_mut().remove(http::header::WWW_AUTHENTICATE);
        Ok(resp)
    }
}

fn convert_response(resp: Response<hyper::body::Incoming>) -> Response<HubBody> {
    let (parts, body) = resp.into_parts();
    Response::from_parts(parts, body.boxed())
}

fn rebuild_uri(host: &str, path_and_query: &str) -> Result<Uri, HubProxyError> {
    format!("https://{host}{path_and_query}")
        .parse()
        .map_err(|_| HubProxyError::InvalidTargetUrl)
}

fn query_param<'a>(uri: &'a Uri, key: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|kv| {
        let (k, v) = kv.split_once('=')?;
        (k == key).then(|| urlencoding_decode(v))
    })
}

fn urlencoding_decode(s: &str) -> String {
    s.replace('+', " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_image_defaults_library_and_latest() {
        let r = ImageRef::parse("nginx");
        assert_eq!(r.namespace, "library");
        assert_eq!(r.repository, "nginx");
        assert_eq!(r.tag, "latest");
        assert_eq!(r.upstream_host, None);
    }

    #[test]
    fn test_parse_namespace_repo_tag() {
        let r = ImageRef::parse("bitnami/nginx:1.25");
        assert_eq!(r.namespace, "bitnami");
        assert_eq!(r.repository, "nginx");
        assert_eq!(r.tag, "1.25");
    }

    #[test]
    fn test_parse_explicit_host_segment() {
        let r = ImageRef::parse("myregistry.example.com/team/app:v1");
        assert_eq!(r.upstream_host.as_deref(), Some("myregistry.example.com"));
        assert_eq!(r.namespace, "team");
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag, "v1");
    }

    #[test]
    fn test_full_name() {
        let r = ImageRef::parse("library/nginx");
        assert_eq!(r.full_name(), "library/nginx");
    }

    #[test]
    fn test_translate_known_registry_strips_segment() {
        let snapshot = ConfigSnapshot::build(crate::config::RawConfig::default());
        let t = translate_path(&snapshot, "/ghcr.io/owner/img/blobs/sha256:abc");
        assert_eq!(t.upstream_host, "ghcr.io");
        assert_eq!(t.path, "/v2/owner/img/blobs/sha256:abc");
    }

    #[test]
    fn test_translate_docker_hub_injects_library() {
        let snapshot = ConfigSnapshot::build(crate::config::RawConfig::default());
        let t = translate_path(&snapshot, "/nginx/manifests/latest");
        assert_eq!(t.upstream_host, DOCKER_HUB_UPSTREAM);
        assert_eq!(t.path, "/v2/library/nginx/manifests/latest");
    }

    #[test]
    fn test_image_ref_from_path() {
        let img = image_ref_from_path("/v2/library/nginx/manifests/latest").unwrap();
        assert_eq!(img.full_name(), "library/nginx");
    }
}
