pub mod types;
pub mod watcher;

pub use types::*;

use anyhow::Result;
use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

impl RawConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — the proxy starts with zero configuration for local runs.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: RawConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            RawConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variable overrides, applied after the file is parsed and
    /// before validation. Lets an operator tweak the running container
    /// without editing the mounted config file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SERVER_HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("SERVER_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.server.port = n;
            }
        }
        if let Ok(v) = std::env::var("MAX_FILE_SIZE") {
            if let Ok(n) = v.parse::<u64>() {
                self.server.file_size = n;
            }
        }
        if let Ok(v) = std::env::var("RATE_LIMIT") {
            if let Ok(n) = v.parse::<u64>() {
                self.rate_limit.request_limit = n;
            }
        }
        if let Ok(v) = std::env::var("RATE_PERIOD_HOURS") {
            if let Ok(n) = v.parse::<f64>() {
                self.rate_limit.period_hours = n;
            }
        }
        if let Ok(v) = std::env::var("IP_WHITELIST") {
            self.security.white_list = split_csv(&v);
        }
        if let Ok(v) = std::env::var("IP_BLACKLIST") {
            self.security.black_list = split_csv(&v);
        }
        if let Ok(v) = std::env::var("MAX_IMAGES") {
            if let Ok(n) = v.parse::<u32>() {
                self.download.max_images = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be nonzero");
        }
        if self.server.file_size == 0 {
            anyhow::bail!("server.fileSize must be nonzero");
        }
        if self.rate_limit.period_hours <= 0.0 {
            anyhow::bail!("rateLimit.periodHours must be positive");
        }
        for (name, entry) in &self.registries {
            if entry.upstream.is_empty() {
                anyhow::bail!("registries.{name}.upstream cannot be empty");
            }
        }
        Ok(())
    }
}

fn split_csv(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Owns the single source of truth for the running `ConfigSnapshot`, published
/// behind an `ArcSwap` so request handlers can grab a cheap, lock-free `Arc`
/// clone without ever blocking a writer. `watcher::spawn` is the only thing
/// that calls `publish` after startup.
pub struct ConfigStore {
    path: PathBuf,
    current: ArcSwap<ConfigSnapshot>,
}

impl ConfigStore {
    pub fn load(path: PathBuf) -> Result<Self> {
        let raw = RawConfig::load(&path)?;
        let snapshot = ConfigSnapshot::build(raw);
        Ok(Self {
            path,
            current: ArcSwap::from_pointee(snapshot),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// O(1) read — the hot path used by every request handler.
    pub fn get(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Re-read the config file from disk and publish a new snapshot if it
    /// parses and validates. Returns `Err` without touching the published
    /// snapshot on any failure — a bad edit never takes the proxy down.
    pub fn reload(&self) -> Result<Arc<ConfigSnapshot>> {
        let raw = RawConfig::load(&self.path)?;
        let snapshot = Arc::new(ConfigSnapshot::build(raw));
        self.current.store(snapshot.clone());
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let path = PathBuf::from("/tmp/hubproxy-does-not-exist-xyz.toml");
        let store = ConfigStore::load(path).unwrap();
        let snapshot = store.get();
        assert_eq!(snapshot.bind_port, 5000);
    }

    #[test]
    fn test_reload_picks_up_file_changes() {
        let mut file = tempfile_toml("[server]\nport = 6000\n");
        let store = ConfigStore::load(file.path().to_path_buf()).unwrap();
        assert_eq!(store.get().bind_port, 6000);

        file.rewrite("[server]\nport = 6001\n");
        let snapshot = store.reload().unwrap();
        assert_eq!(snapshot.bind_port, 6001);
        assert_eq!(store.get().bind_port, 6001);
    }

    #[test]
    fn test_reload_rejects_invalid_and_keeps_old_snapshot() {
        let mut file = tempfile_toml("[server]\nport = 7000\n");
        let store = ConfigStore::load(file.path().to_path_buf()).unwrap();
        assert_eq!(store.get().bind_port, 7000);

        file.rewrite("[server]\nport = 0\n");
        assert!(store.reload().is_err());
        assert_eq!(store.get().bind_port, 7000);
    }

    struct TempToml {
        path: PathBuf,
        handle: std::fs::File,
    }

    impl TempToml {
        fn rewrite(&mut self, content: &str) {
            self.handle = std::fs::File::create(&self.path).unwrap();
            self.handle.write_all(content.as_bytes()).unwrap();
        }

        fn path(&self) -> &Path {
            &self.path
        }
    }

    fn tempfile_toml(content: &str) -> TempToml {
        let path = std::env::temp_dir().join(format!(
            "hubproxy-test-{}.toml",
            std::process::id()
        ));
        let mut handle = std::fs::File::create(&path).unwrap();
        handle.write_all(content.as_bytes()).unwrap();
        TempToml { path, handle }
    }
}
