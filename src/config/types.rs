use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Raw, directly-deserialized `config.toml` shape. Every section has field
/// defaults so a partial file is valid — see `ConfigSnapshot::build` for the
/// defaults-then-env-override precedence described for the published snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default, rename = "rateLimit")]
    pub rate_limit: RateLimitSection,

    #[serde(default)]
    pub security: SecuritySection,

    #[serde(default)]
    pub proxy: ProxySection,

    #[serde(default)]
    pub download: DownloadSection,

    #[serde(default)]
    pub registries: HashMap<String, RegistrySection>,

    #[serde(default, rename = "tokenCache")]
    pub token_cache: TokenCacheSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Max request/response body size in bytes.
    #[serde(default = "default_file_size", rename = "fileSize")]
    pub file_size: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            file_size: default_file_size(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_file_size() -> u64 {
    2 * 1024 * 1024 * 1024 // 2 GiB
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSection {
    #[serde(default = "default_request_limit", rename = "requestLimit")]
    pub request_limit: u64,
    #[serde(default = "default_period_hours", rename = "periodHours")]
    pub period_hours: f64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            request_limit: default_request_limit(),
            period_hours: default_period_hours(),
        }
    }
}

fn default_request_limit() -> u64 {
    20
}

fn default_period_hours() -> f64 {
    1.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecuritySection {
    #[serde(default, rename = "whiteList")]
    pub white_list: Vec<String>,
    #[serde(default, rename = "blackList")]
    pub black_list: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxySection {
    #[serde(default, rename = "whiteList")]
    pub white_list: Vec<String>,
    #[serde(default, rename = "blackList")]
    pub black_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSection {
    #[serde(default = "default_max_images", rename = "maxImages")]
    pub max_images: u32,
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            max_images: default_max_images(),
        }
    }
}

fn default_max_images() -> u32 {
    10
}

/// Upstream authentication style — determines how the registry proxy performs
/// the bearer-token exchange on a `401` challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Docker,
    Github,
    Google,
    Quay,
    Basic,
    Anonymous,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySection {
    pub upstream: String,
    #[serde(default, rename = "authHost")]
    pub auth_host: Option<String>,
    #[serde(default = "default_auth_type", rename = "authType")]
    pub auth_type: AuthType,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_auth_type() -> AuthType {
    AuthType::Anonymous
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCacheSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Default TTL in seconds when the upstream does not return `expires_in`.
    #[serde(default = "default_token_ttl", rename = "defaultTTL")]
    pub default_ttl: u64,
}

impl Default for TokenCacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: default_token_ttl(),
        }
    }
}

fn default_token_ttl() -> u64 {
    300
}

/// Immutable, atomically-published view of the running configuration.
/// Built by `ConfigSnapshot::build` from defaults ← TOML ← environment,
/// one instance per successful load/reload (see `ConfigStore`).
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub bind_host: String,
    pub bind_port: u16,
    pub max_body_bytes: u64,

    pub requests_per_period: u64,
    pub period_hours: f64,

    pub ip_white_list: Vec<String>,
    pub ip_black_list: Vec<String>,

    pub repo_white_list: Vec<String>,
    pub repo_black_list: Vec<String>,

    pub max_images: u32,

    pub registries: HashMap<String, RegistrySection>,

    pub token_cache_enabled: bool,
    pub token_cache_default_ttl: u64,
}

/// Registries prepopulated when absent from both the TOML file and the
/// defaults above — the upstreams named explicitly as the external
/// interfaces this proxy accelerates.
fn default_registries() -> HashMap<String, RegistrySection> {
    let mut m = HashMap::new();
    m.insert(
        "ghcr.io".to_string(),
        RegistrySection {
            upstream: "ghcr.io".to_string(),
            auth_host: Some("ghcr.io".to_string()),
            auth_type: AuthType::Github,
            enabled: true,
        },
    );
    m.insert(
        "gcr.io".to_string(),
        RegistrySection {
            upstream: "gcr.io".to_string(),
            auth_host: Some("gcr.io".to_string()),
            auth_type: AuthType::Google,
            enabled: true,
        },
    );
    m.insert(
        "quay.io".to_string(),
        RegistrySection {
            upstream: "quay.io".to_string(),
            auth_host: Some("quay.io".to_string()),
            auth_type: AuthType::Quay,
            enabled: true,
        },
    );
    m.insert(
        "registry.k8s.io".to_string(),
        RegistrySection {
            upstream: "registry.k8s.io".to_string(),
            auth_host: Some("registry.k8s.io".to_string()),
            auth_type: AuthType::Anonymous,
            enabled: true,
        },
    );
    m
}

impl ConfigSnapshot {
    /// Merge built-in defaults with a parsed `RawConfig`. Environment overrides
    /// are applied by the caller (`RawConfig::apply_env_overrides`) before this
    /// runs, so this function only has to fold `RawConfig` fields over defaults.
    pub fn build(raw: RawConfig) -> Self {
        let mut registries = default_registries();
        for (name, entry) in raw.registries {
            registries.insert(name, entry);
        }

        Self {
            bind_host: raw.server.host,
            bind_port: raw.server.port,
            max_body_bytes: raw.server.file_size,
            requests_per_period: raw.rate_limit.request_limit,
            period_hours: raw.rate_limit.period_hours,
            ip_white_list: raw.security.white_list,
            ip_black_list: raw.security.black_list,
            repo_white_list: raw.proxy.white_list,
            repo_black_list: raw.proxy.black_list,
            max_images: raw.download.max_images,
            registries,
            token_cache_enabled: raw.token_cache.enabled,
            token_cache_default_ttl: raw.token_cache.default_ttl,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.bind_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_config_defaults() {
        let raw = RawConfig::default();
        assert_eq!(raw.server.host, "0.0.0.0");
        assert_eq!(raw.server.port, 5000);
        assert_eq!(raw.server.file_size, 2 * 1024 * 1024 * 1024);
        assert_eq!(raw.rate_limit.request_limit, 20);
        assert_eq!(raw.rate_limit.period_hours, 1.0);
        assert!(raw.security.white_list.is_empty());
        assert_eq!(raw.download.max_images, 10);
        assert!(raw.token_cache.enabled);
        assert_eq!(raw.token_cache.default_ttl, 300);
    }

    #[test]
    fn test_snapshot_prepopulates_registries() {
        let snapshot = ConfigSnapshot::build(RawConfig::default());
        assert_eq!(snapshot.registries.len(), 4);
        assert!(snapshot.registries.contains_key("ghcr.io"));
        assert_eq!(
            snapshot.registries.get("ghcr.io").unwrap().auth_type,
            AuthType::Github
        );
    }

    #[test]
    fn test_snapshot_registry_override_merges_not_replaces() {
        let mut raw = RawConfig::default();
        raw.registries.insert(
            "my-mirror".to_string(),
            RegistrySection {
                upstream: "mirror.internal".to_string(),
                auth_host: None,
                auth_type: AuthType::Anonymous,
                enabled: true,
            },
        );
        let snapshot = ConfigSnapshot::build(raw);
        assert_eq!(snapshot.registries.len(), 5);
        assert!(snapshot.registries.contains_key("my-mirror"));
        assert!(snapshot.registries.contains_key("ghcr.io"));
    }

    #[test]
    fn test_toml_parse_full_section_names() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 8080
            fileSize = 1048576

            [rateLimit]
            requestLimit = 100
            periodHours = 2.0

            [security]
            whiteList = ["1.2.3.4"]
            blackList = ["5.6.7.8"]

            [proxy]
            whiteList = ["library/nginx"]
            blackList = []

            [download]
            maxImages = 5

            [registries.custom]
            upstream = "custom.example.com"
            authHost = "auth.example.com"
            authType = "basic"
            enabled = true

            [tokenCache]
            enabled = false
            defaultTTL = 60
        "#;
        let raw: RawConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(raw.server.host, "127.0.0.1");
        assert_eq!(raw.server.port, 8080);
        assert_eq!(raw.server.file_size, 1048576);
        assert_eq!(raw.rate_limit.request_limit, 100);
        assert_eq!(raw.rate_limit.period_hours, 2.0);
        assert_eq!(raw.security.white_list, vec!["1.2.3.4"]);
        assert_eq!(raw.proxy.white_list, vec!["library/nginx"]);
        assert_eq!(raw.download.max_images, 5);
        assert!(!raw.token_cache.enabled);
        assert_eq!(raw.token_cache.default_ttl, 60);
        let custom = raw.registries.get("custom").unwrap();
        assert_eq!(custom.upstream, "custom.example.com");
        assert_eq!(custom.auth_type, AuthType::Basic);
    }
}
