//! Parses a registry's `WWW-Authenticate: Bearer ...` challenge and performs
//! the token exchange against its `realm`.

use crate::body::empty_body;
use crate::client::HubClient;
use crate::config::AuthType;
use crate::error::HubProxyError;
use http::{HeaderValue, Request};
use http_body_util::BodyExt;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub service: String,
    pub scope: String,
}

impl Challenge {
    /// Parse `Bearer realm="...",service="...",scope="..."`. Unquoted or
    /// reordered parameters are tolerated; a missing `realm` fails the parse.
    pub fn parse(header: &str) -> Option<Self> {
        let rest = header.trim().strip_prefix("Bearer")?.trim();
        let mut realm = None;
        let mut service = String::new();
        let mut scope = String::new();

        for part in split_params(rest) {
            let (key, value) = part.split_once('=')?;
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "realm" => realm = Some(value),
                "service" => service = value,
                "scope" => scope = value,
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }
}

/// Split on commas that are not inside a quoted value.
fn split_params(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in s.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl TokenResponse {
    fn bearer(&self) -> Option<String> {
        self.token.clone().or_else(|| self.access_token.clone())
    }
}

/// Perform the unauthenticated (or basic-carrying) GET against `realm` and
/// parse the JSON token response. Returns `(bearer, expires_in)`.
pub async fn fetch_token(
    client: &HubClient,
    challenge: &Challenge,
    auth_type: AuthType,
    original_auth: Option<&HeaderValue>,
) -> Result<Option<(String, Option<u64>)>, HubProxyError> {
    let mut url = format!("{}?service={}", challenge.realm, urlencode(&challenge.service));
    if !challenge.scope.is_empty() {
        url.push_str(&format!("&scope={}", urlencode(&challenge.scope)));
    }

    let mut builder = Request::builder().method(http::Method::GET).uri(
        url.parse::<http::Uri>()
            .map_err(|_| HubProxyError::InvalidTargetUrl)?,
    );

    if matches!(auth_type, AuthType::Basic) {
        if let Some(auth) = original_auth {
            builder = builder.header(http::header::AUTHORIZATION, auth.clone());
        }
    }

    let req = builder
        .body(empty_body())
        .map_err(|e| HubProxyError::Internal(e.to_string()))?;

    let resp = client
        .request(req)
        .await
        .map_err(|e| HubProxyError::UpstreamDial(e.to_string()))?;

    if !resp.status().is_success() {
        return Ok(None);
    }

    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| HubProxyError::UpstreamRead(e.to_string()))?
        .to_bytes();

    let parsed: TokenResponse =
        serde_json::from_slice(&body).map_err(|e| HubProxyError::UpstreamRead(e.to_string()))?;

    Ok(parsed.bearer().map(|b| (b, parsed.expires_in)))
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b':' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge_basic() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#;
        let c = Challenge::parse(header).unwrap();
        assert_eq!(c.realm, "https://auth.docker.io/token");
        assert_eq!(c.service, "registry.docker.io");
        assert_eq!(c.scope, "repository:library/nginx:pull");
    }

    #[test]
    fn test_parse_challenge_missing_realm_fails() {
        let header = r#"Bearer service="registry.docker.io""#;
        assert!(Challenge::parse(header).is_none());
    }

    #[test]
    fn test_parse_challenge_reordered_params() {
        let header = r#"Bearer scope="repository:x:pull",realm="https://r",service="s""#;
        let c = Challenge::parse(header).unwrap();
        assert_eq!(c.realm, "https://r");
        assert_eq!(c.service, "s");
        assert_eq!(c.scope, "repository:x:pull");
    }

    #[test]
    fn test_urlencode_preserves_colon() {
        assert_eq!(urlencode("repository:library/nginx:pull"), "repository:library%2Fnginx:pull");
    }

    #[test]
    fn test_token_response_prefers_token_over_access_token() {
        let resp: TokenResponse = serde_json::from_str(r#"{"token":"a","access_token":"b"}"#).unwrap();
        assert_eq!(resp.bearer(), Some("a".to_string()));
    }
}
