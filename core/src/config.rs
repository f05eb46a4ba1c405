use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, StrataError};

/// Default uncompressed distance between two interval checkpoints: 2 MiB.
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 2 * 1024 * 1024;

/// Default entry size that triggers a checkpoint right before the entry: 512 KiB.
pub const DEFAULT_LARGE_FILE_THRESHOLD: u64 = 512 * 1024;

/// Default freshness window for memoized registry credentials.
pub const DEFAULT_CREDENTIAL_TTL_SECS: u64 = 600;

/// Strata configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    /// Indexing parameters
    pub index: IndexConfig,

    /// Disk and remote cache settings
    pub cache: CacheConfig,

    /// Registry access settings
    pub registry: RegistryConfig,

    /// Log level used when `RUST_LOG` is not set
    pub log_level: LogLevel,
}

impl StrataConfig {
    /// Load configuration from a JSON or YAML file (chosen by extension).
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            StrataError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&data)?,
            _ => serde_json::from_str(&data)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply `STRATA_*` environment overrides.
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(dir) = std::env::var("STRATA_CACHE_DIR") {
            self.cache.disk_dir = Some(PathBuf::from(dir));
        }
        if let Ok(url) = std::env::var("STRATA_REMOTE_CACHE_URL") {
            self.cache.remote_url = Some(url);
        }
        if let Ok(max) = std::env::var("STRATA_MAX_CACHE_BYTES") {
            let max = max.parse::<u64>().map_err(|e| {
                StrataError::Config(format!("Invalid STRATA_MAX_CACHE_BYTES '{}': {}", max, e))
            })?;
            self.cache.max_disk_bytes = Some(max);
        }
        Ok(self)
    }

    /// Reject values the indexer cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.index.checkpoint_interval == 0 {
            return Err(StrataError::Config(
                "index.checkpoint_interval must be greater than zero".to_string(),
            ));
        }
        if self.index.large_file_threshold == 0 {
            return Err(StrataError::Config(
                "index.large_file_threshold must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Indexing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Uncompressed bytes between interval checkpoints
    pub checkpoint_interval: u64,

    /// Entries at least this large get a checkpoint right before their data
    pub large_file_threshold: u64,

    /// Leave /proc, /sys and /dev out of the index
    pub skip_runtime_dirs: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            large_file_threshold: DEFAULT_LARGE_FILE_THRESHOLD,
            skip_runtime_dirs: true,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding decompressed layers (None disables the disk tier)
    pub disk_dir: Option<PathBuf>,

    /// Evict least-recently-accessed layers above this many bytes
    pub max_disk_bytes: Option<u64>,

    /// Base URL of a remote content cache
    pub remote_url: Option<String>,

    /// Push freshly populated layers to the remote cache
    pub push_to_remote: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            disk_dir: dirs::home_dir().map(|home| {
                home.join(".strata").join("cache").join("layers")
            }),
            max_disk_bytes: None,
            remote_url: None,
            push_to_remote: true,
        }
    }
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry hosts reached over plain HTTP
    pub plain_http: Vec<String>,

    /// Freshness window for memoized credentials, in seconds
    pub credential_ttl_secs: u64,

    /// Docker config file (defaults to $DOCKER_CONFIG/config.json or ~/.docker/config.json)
    pub docker_config: Option<PathBuf>,

    /// Strata credential store (defaults to ~/.strata/auth/credentials.json)
    pub credential_store: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            plain_http: Vec::new(),
            credential_ttl_secs: DEFAULT_CREDENTIAL_TTL_SECS,
            docker_config: None,
            credential_store: None,
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = StrataConfig::default();
        assert_eq!(config.index.checkpoint_interval, 2 * 1024 * 1024);
        assert_eq!(config.index.large_file_threshold, 512 * 1024);
        assert!(config.index.skip_runtime_dirs);
        assert!(config.cache.push_to_remote);
        assert_eq!(config.registry.credential_ttl_secs, 600);
        assert_eq!(config.log_level, LogLevel::Warn);
    }

    #[test]
    fn test_load_yaml_partial() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("strata.yaml");
        std::fs::write(
            &path,
            "index:\n  checkpoint_interval: 1048576\ncache:\n  disk_dir: /var/cache/strata\nlog_level: debug\n",
        )
        .unwrap();

        let config = StrataConfig::load(&path).unwrap();
        assert_eq!(config.index.checkpoint_interval, 1024 * 1024);
        assert_eq!(config.index.large_file_threshold, DEFAULT_LARGE_FILE_THRESHOLD);
        assert_eq!(
            config.cache.disk_dir,
            Some(PathBuf::from("/var/cache/strata"))
        );
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_load_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("strata.json");
        std::fs::write(
            &path,
            r#"{"registry": {"plain_http": ["localhost:5000"]}}"#,
        )
        .unwrap();

        let config = StrataConfig::load(&path).unwrap();
        assert_eq!(config.registry.plain_http, vec!["localhost:5000"]);
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = StrataConfig::default();
        config.index.checkpoint_interval = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, StrataError::Config(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = StrataConfig::load(Path::new("/nonexistent/strata.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn test_log_level_to_tracing() {
        let level: tracing::Level = LogLevel::Info.into();
        assert_eq!(level, tracing::Level::INFO);
    }
}
