use http::StatusCode;
use std::fmt;

/// Every failure mode the proxy can surface, mapped to a wire response by
/// `HubProxyError::status_and_message` at the edge of the router. Handlers
/// propagate this type with `?` instead of building `Response`s inline.
#[derive(Debug)]
#[allow(dead_code)]
pub enum HubProxyError {
    ConfigParse(String),
    InvalidTargetUrl,
    AccessDenied(String),
    BodyTooLarge(u64),
    RedirectLoop,
    UpstreamDial(String),
    UpstreamRead(String),
    AuthFailed,
    RateLimited,
    IpDenied,
    Internal(String),
    PanicRecovered,
}

impl fmt::Display for HubProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubProxyError::ConfigParse(msg) => write!(f, "config parse error: {}", msg),
            HubProxyError::InvalidTargetUrl => write!(f, "invalid target url"),
            HubProxyError::AccessDenied(reason) => write!(f, "access denied: {}", reason),
            HubProxyError::BodyTooLarge(limit) => write!(f, "body exceeds limit of {} bytes", limit),
            HubProxyError::RedirectLoop => write!(f, "redirect loop"),
            HubProxyError::UpstreamDial(msg) => write!(f, "upstream dial error: {}", msg),
            HubProxyError::UpstreamRead(msg) => write!(f, "upstream read error: {}", msg),
            HubProxyError::AuthFailed => write!(f, "upstream authentication failed"),
            HubProxyError::RateLimited => write!(f, "rate limited"),
            HubProxyError::IpDenied => write!(f, "ip denied"),
            HubProxyError::Internal(msg) => write!(f, "internal error: {}", msg),
            HubProxyError::PanicRecovered => write!(f, "handler task panicked"),
        }
    }
}

impl std::error::Error for HubProxyError {}

impl HubProxyError {
    /// Map a typed error to its wire disposition: status code and body message.
    /// Registry-path callers must not forward this to a client via the upstream
    /// `WWW-Authenticate` header — see `registry::auth`.
    pub fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            HubProxyError::ConfigParse(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            HubProxyError::InvalidTargetUrl => (StatusCode::FORBIDDEN, "无效输入".to_string()),
            HubProxyError::AccessDenied(reason) => (StatusCode::FORBIDDEN, reason.clone()),
            HubProxyError::BodyTooLarge(limit) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("body exceeds limit of {} bytes", limit),
            ),
            HubProxyError::RedirectLoop => (
                StatusCode::from_u16(508).unwrap_or(StatusCode::LOOP_DETECTED),
                "重定向次数过多".to_string(),
            ),
            HubProxyError::UpstreamDial(msg) | HubProxyError::UpstreamRead(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
            HubProxyError::AuthFailed => {
                (StatusCode::UNAUTHORIZED, "authentication failed".to_string())
            }
            HubProxyError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "请求频率过快，暂时限制访问".to_string(),
            ),
            HubProxyError::IpDenied => (StatusCode::FORBIDDEN, "您已被限制访问".to_string()),
            HubProxyError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            HubProxyError::PanicRecovered => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        }
    }

    /// Machine-readable error code included in the wire body alongside
    /// `message`. Only `PanicRecovered` carries one; every other variant's
    /// message is itself the client-facing signal.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            HubProxyError::PanicRecovered => Some("INTERNAL_ERROR"),
            _ => None,
        }
    }
}
