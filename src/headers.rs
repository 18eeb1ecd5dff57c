//! Header-copying helpers shared by the registry proxy and the generic URL
//! proxy: stripping hop-by-hop and security headers, and injecting
//! forwarded-for/proto headers toward the upstream.

use http::header::{HeaderName, HeaderValue, CONNECTION, TRANSFER_ENCODING};
use http::HeaderMap;
use std::net::IpAddr;

fn hop_by_hop() -> &'static [HeaderName] {
    static HEADERS: std::sync::OnceLock<Vec<HeaderName>> = std::sync::OnceLock::new();
    HEADERS.get_or_init(|| {
        vec![
            CONNECTION,
            HeaderName::from_static("keep-alive"),
            HeaderName::from_static("proxy-authenticate"),
            HeaderName::from_static("proxy-authorization"),
            HeaderName::from_static("te"),
            HeaderName::from_static("trailers"),
            TRANSFER_ENCODING,
            HeaderName::from_static("upgrade"),
        ]
    })
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for h in hop_by_hop() {
        headers.remove(h);
    }
}

fn security_headers() -> &'static [HeaderName] {
    static HEADERS: std::sync::OnceLock<Vec<HeaderName>> = std::sync::OnceLock::new();
    HEADERS.get_or_init(|| {
        vec![
            HeaderName::from_static("content-security-policy"),
            HeaderName::from_static("referrer-policy"),
            HeaderName::from_static("strict-transport-security"),
        ]
    })
}

pub fn strip_security_headers(headers: &mut HeaderMap) {
    for h in security_headers() {
        headers.remove(h);
    }
}

/// Inject `X-Forwarded-For`/`X-Forwarded-Proto`/`X-Forwarded-Host` on the
/// outbound request toward an upstream, so an upstream operator reading its
/// own access log can trace the request back to the original client.
pub fn inject_forwarded_headers(headers: &mut HeaderMap, client_ip: IpAddr, original_host: &str) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");

    let ip_str = client_ip.to_string();
    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let combined = format!("{existing}, {ip_str}");
        if let Ok(value) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), value);
        }
    } else if let Ok(value) = HeaderValue::from_str(&ip_str) {
        headers.insert(XFF.clone(), value);
    }

    headers.insert(XFP.clone(), HeaderValue::from_static("https"));
    if let Ok(value) = HeaderValue::from_str(original_host) {
        headers.insert(XFH.clone(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_strip_hop_by_hop_removes_all() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        strip_hop_by_hop(&mut headers);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_strip_security_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-security-policy",
            HeaderValue::from_static("default-src 'self'"),
        );
        strip_security_headers(&mut headers);
        assert!(!headers.contains_key("content-security-policy"));
    }

    #[test]
    fn test_inject_forwarded_headers_appends_to_existing_xff() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        inject_forwarded_headers(&mut headers, "1.2.3.4".parse().unwrap(), "example.com");
        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "10.0.0.1, 1.2.3.4"
        );
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "example.com");
    }
}
