//! Configuration loader and validator for the offline reader core.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub cache: Cache,
    pub network: Network,
    pub sync: SyncTarget,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Prefix of the versioned cache region, e.g. `news-reader`.
    pub cache_name: String,
    /// Bumping this is the only supported cache migration.
    pub cache_version: u32,
}

/// Request classification and generation manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cache {
    /// Paths preloaded into every new generation, relative to `network.base_url`.
    pub static_assets: Vec<String>,
    #[serde(default)]
    pub static_prefixes: Vec<String>,
    pub api_prefixes: Vec<String>,
    #[serde(default)]
    pub api_hosts: Vec<String>,
    #[serde(default = "default_revalidate_attempts")]
    pub revalidate_attempts: u32,
}

/// Origin and connectivity probing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Network {
    pub base_url: String,
    #[serde(default)]
    pub probe_url: Option<String>,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Applied by the HTTP fetcher only; the cache engine never times out on its own.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

/// Pending-action replay target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncTarget {
    pub endpoint: String,
}

fn default_revalidate_attempts() -> u32 {
    1
}

fn default_probe_interval_ms() -> u64 {
    5_000
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.resolved_data_dir())
    }

    /// `app.data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        let dir = self.app.data_dir.trim();
        if let Some(rest) = dir.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return format!("{}/{}", home.trim_end_matches('/'), rest);
            }
        }
        dir.to_string()
    }

    /// SQLite URL for the persistent store; `DATABASE_URL` wins when set.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/offline.db", self.resolved_data_dir()))
    }

    /// Name of the configured cache generation, e.g. `news-reader-v1`.
    pub fn generation_name(&self) -> String {
        format!("{}-v{}", self.app.cache_name, self.app.cache_version)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    let name = cfg.app.cache_name.trim();
    if name.is_empty() {
        return Err(ConfigError::Invalid("app.cache_name must be non-empty"));
    }
    if name.contains(char::is_whitespace) {
        return Err(ConfigError::Invalid("app.cache_name must not contain whitespace"));
    }
    if cfg.app.cache_version == 0 {
        return Err(ConfigError::Invalid("app.cache_version must be > 0"));
    }

    if cfg.cache.api_prefixes.iter().any(|p| !p.starts_with('/')) {
        return Err(ConfigError::Invalid("cache.api_prefixes entries must start with '/'"));
    }
    if cfg.cache.static_prefixes.iter().any(|p| !p.starts_with('/')) {
        return Err(ConfigError::Invalid("cache.static_prefixes entries must start with '/'"));
    }
    if cfg.cache.revalidate_attempts == 0 {
        return Err(ConfigError::Invalid("cache.revalidate_attempts must be > 0"));
    }

    if reqwest::Url::parse(&cfg.network.base_url).is_err() {
        return Err(ConfigError::Invalid("network.base_url must be an absolute URL"));
    }
    if let Some(probe) = &cfg.network.probe_url {
        if reqwest::Url::parse(probe).is_err() {
            return Err(ConfigError::Invalid("network.probe_url must be an absolute URL"));
        }
    }
    if cfg.network.probe_interval_ms == 0 {
        return Err(ConfigError::Invalid("network.probe_interval_ms must be > 0"));
    }

    if reqwest::Url::parse(&cfg.sync.endpoint).is_err() {
        return Err(ConfigError::Invalid("sync.endpoint must be an absolute URL"));
    }

    Ok(())
}

/// Returns the example YAML shipped with the crate.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  cache_name: "news-reader"
  cache_version: 1

cache:
  static_assets:
    - "/"
    - "/index.html"
    - "/manifest.json"
  static_prefixes:
    - "/assets/"
  api_prefixes:
    - "/api/"
    - "/v2/"
  api_hosts:
    - "newsapi.org"
  revalidate_attempts: 1

network:
  base_url: "http://localhost:5173/"
  probe_url: "http://localhost:5173/manifest.json"
  probe_interval_ms: 5000

sync:
  endpoint: "http://localhost:5173/api/sync"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.generation_name(), "news-reader-v1");
    }

    #[test]
    fn invalid_cache_identity() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.cache_name = "  ".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("app.cache_name")), _ => panic!("wrong error") }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.cache_version = 0;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("cache_version")), _ => panic!("wrong error") }
    }

    #[test]
    fn invalid_urls() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.network.base_url = "not a url".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.sync.endpoint = "".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("sync.endpoint")), _ => panic!("wrong error") }
    }

    #[test]
    fn invalid_prefixes() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.cache.api_prefixes = vec!["api/".into()];
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.cache.revalidate_attempts = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn defaults_apply_when_omitted() {
        let yaml = example()
            .replace("  revalidate_attempts: 1\n", "")
            .replace("  probe_interval_ms: 5000\n", "");
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg.cache.revalidate_attempts, 1);
        assert_eq!(cfg.network.probe_interval_ms, 5_000);
        assert!(cfg.network.request_timeout_ms.is_none());
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.cache.static_assets.len(), 3);
        assert_eq!(cfg.cache.api_hosts, vec!["newsapi.org".to_string()]);
    }
}
