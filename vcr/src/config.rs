//! Record/replay configuration loading
//!
//! Loads configuration from `~/.config/codex/vcr.toml` (or `CODEX_VCR_CONFIG` env),
//! then applies `CODEX_VCR_MODE` / `CODEX_VCR_DIR` overrides. The result is
//! resolved once into an immutable [`VcrSession`].

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::error::VcrError;
use crate::mode::VcrMode;
use crate::provider::Provider;
use crate::redact::DEFAULT_REDACTED_KEYS;
use crate::redact::KeyRedactor;
use crate::redact::NoopRedactor;
use crate::redact::Redactor;
use crate::seal::Sealer;
use crate::store::CassetteStore;
use crate::upstream::HttpUpstream;
use crate::upstream::UpstreamError;

/// Root configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct VcrConfig {
    /// Operating mode
    #[serde(default)]
    pub mode: VcrMode,

    /// Cassette store root; relative paths resolve against the working directory
    #[serde(default = "default_store_dir")]
    pub store_dir: String,

    /// Name of the environment variable holding the seal key. The key itself
    /// never lives in this file.
    #[serde(default = "default_seal_key_env")]
    pub seal_key_env: String,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub redaction: RedactionConfig,

    /// Per-provider base URL overrides for the HTTP upstream, keyed by
    /// provider name
    #[serde(default)]
    pub upstreams: BTreeMap<String, String>,
}

fn default_store_dir() -> String {
    ".ai-tests/cassettes".to_string()
}

fn default_seal_key_env() -> String {
    "CODEX_VCR_SEAL_KEY".to_string()
}

/// Retention settings
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RetentionConfig {
    /// Delete cassettes older than this many days. Unset disables retention.
    #[serde(default)]
    pub max_age_days: Option<u64>,

    /// Seconds between background sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_days: None,
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Timeout settings
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TimeoutConfig {
    #[serde(default = "default_upstream_secs")]
    pub upstream_secs: u64,

    #[serde(default = "default_storage_secs")]
    pub storage_secs: u64,
}

fn default_upstream_secs() -> u64 {
    120
}

fn default_storage_secs() -> u64 {
    10
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            upstream_secs: default_upstream_secs(),
            storage_secs: default_storage_secs(),
        }
    }
}

/// Redaction settings
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RedactionConfig {
    #[serde(default = "default_redaction_enabled")]
    pub enabled: bool,

    /// Object keys whose values are masked before persistence
    #[serde(default = "default_redacted_keys")]
    pub keys: Vec<String>,
}

fn default_redaction_enabled() -> bool {
    true
}

fn default_redacted_keys() -> Vec<String> {
    DEFAULT_REDACTED_KEYS.iter().map(ToString::to_string).collect()
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: default_redaction_enabled(),
            keys: default_redacted_keys(),
        }
    }
}

impl Default for VcrConfig {
    fn default() -> Self {
        Self {
            mode: VcrMode::default(),
            store_dir: default_store_dir(),
            seal_key_env: default_seal_key_env(),
            retention: RetentionConfig::default(),
            timeouts: TimeoutConfig::default(),
            redaction: RedactionConfig::default(),
            upstreams: BTreeMap::new(),
        }
    }
}

impl VcrConfig {
    /// Environment variable for config path override
    pub const ENV_CONFIG_PATH: &'static str = "CODEX_VCR_CONFIG";

    /// Environment variable overriding `mode`
    pub const ENV_MODE: &'static str = "CODEX_VCR_MODE";

    /// Environment variable overriding `store_dir`
    pub const ENV_STORE_DIR: &'static str = "CODEX_VCR_DIR";

    /// Default config filename
    pub const DEFAULT_CONFIG_FILENAME: &'static str = "vcr.toml";

    /// Load configuration from file and the environment
    ///
    /// Resolution order:
    /// 1. `CODEX_VCR_CONFIG` environment variable
    /// 2. `~/.config/codex/vcr.toml`
    ///
    /// If the config file doesn't exist, defaults are used. Environment
    /// overrides are applied afterwards.
    pub fn load() -> Result<Self> {
        let path = Self::resolve_config_path();

        let mut cfg = if path.exists() {
            Self::load_from_path(&path)?
        } else {
            tracing::info!(
                path = %path.display(),
                "vcr config not found, using defaults"
            );
            Self::default()
        };

        cfg.apply_env_overrides(|name| std::env::var(name).ok())?;
        Ok(cfg)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            VcrError::config(format!("failed to read config at {}: {e}", path.display()))
        })?;

        Self::parse(&contents)
    }

    /// Parse configuration from TOML string
    pub fn parse(contents: &str) -> Result<Self> {
        let cfg: VcrConfig = toml::from_str(contents)
            .map_err(|e| VcrError::config(format!("failed to parse config: {e}")))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `CODEX_VCR_MODE` and `CODEX_VCR_DIR` from `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup(Self::ENV_MODE).filter(|v| !v.trim().is_empty()) {
            self.mode = mode
                .parse()
                .map_err(|e| VcrError::config(format!("{}: {e}", Self::ENV_MODE)))?;
        }
        if let Some(dir) = lookup(Self::ENV_STORE_DIR).filter(|v| !v.trim().is_empty()) {
            self.store_dir = dir;
        }
        self.validate()
    }

    fn resolve_config_path() -> PathBuf {
        if let Ok(path) = std::env::var(Self::ENV_CONFIG_PATH) {
            return PathBuf::from(path);
        }

        dirs::home_dir()
            .map(|h| {
                h.join(".config")
                    .join("codex")
                    .join(Self::DEFAULT_CONFIG_FILENAME)
            })
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_CONFIG_FILENAME))
    }

    fn validate(&self) -> Result<()> {
        if self.store_dir.trim().is_empty() {
            return Err(VcrError::config("store_dir must not be empty"));
        }
        if self.timeouts.upstream_secs == 0 || self.timeouts.storage_secs == 0 {
            return Err(VcrError::config("timeouts must be at least one second"));
        }
        if self.retention.max_age_days == Some(0) {
            return Err(VcrError::config(
                "retention.max_age_days must be positive; omit it to disable retention",
            ));
        }
        if self.retention.sweep_interval_secs == 0 {
            return Err(VcrError::config("retention.sweep_interval_secs must be positive"));
        }
        self.upstream_base_urls()?;
        if self.redaction.enabled && self.redaction.keys.is_empty() {
            tracing::warn!("redaction enabled with no keys; cassettes are stored unredacted");
        }
        Ok(())
    }

    /// Base URL overrides with provider names resolved
    pub fn upstream_base_urls(&self) -> Result<BTreeMap<Provider, String>> {
        self.upstreams
            .iter()
            .map(|(name, url)| {
                let provider = name
                    .parse::<Provider>()
                    .map_err(|e| VcrError::config(format!("upstreams: {e}")))?;
                Ok((provider, url.clone()))
            })
            .collect()
    }

    /// Get the resolved store directory (expanding ~ if needed)
    pub fn resolved_store_dir(&self) -> PathBuf {
        let path = &self.store_dir;
        if let Some(stripped) = path.strip_prefix("~/")
            && let Some(home) = dirs::home_dir()
        {
            return home.join(stripped);
        }
        PathBuf::from(path)
    }
}

/// Resolved, immutable runtime settings shared by every component.
#[derive(Debug, Clone)]
pub struct VcrSession {
    mode: VcrMode,
    store_root: PathBuf,
    sealer: Sealer,
    redactor: Arc<dyn Redactor>,
    retention: Option<Duration>,
    sweep_interval: Duration,
    upstream_timeout: Duration,
    storage_timeout: Duration,
    upstream_base_urls: BTreeMap<Provider, String>,
}

impl VcrSession {
    /// Session with default timeouts, key redaction, an unkeyed seal and no
    /// retention.
    pub fn new(mode: VcrMode, store_root: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            store_root: store_root.into(),
            sealer: Sealer::unkeyed(),
            redactor: Arc::new(KeyRedactor::default()),
            retention: None,
            sweep_interval: Duration::from_secs(default_sweep_interval_secs()),
            upstream_timeout: Duration::from_secs(default_upstream_secs()),
            storage_timeout: Duration::from_secs(default_storage_secs()),
            upstream_base_urls: BTreeMap::new(),
        }
    }

    /// Resolve a config, reading the seal key from the process environment.
    pub fn from_config(config: &VcrConfig) -> Result<Self> {
        Self::from_config_with_env(config, |name| std::env::var(name).ok())
    }

    pub fn from_config_with_env<F>(config: &VcrConfig, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let sealer = match lookup(&config.seal_key_env).filter(|k| !k.is_empty()) {
            Some(key) => Sealer::keyed(key.as_bytes())?,
            None => Sealer::unkeyed(),
        };
        let redactor: Arc<dyn Redactor> = if config.redaction.enabled {
            Arc::new(KeyRedactor::new(&config.redaction.keys))
        } else {
            Arc::new(NoopRedactor)
        };
        let retention = config
            .retention
            .max_age_days
            .map(|days| Duration::from_secs(days.saturating_mul(24 * 60 * 60)));

        let session = Self {
            mode: config.mode,
            store_root: config.resolved_store_dir(),
            sealer,
            redactor,
            retention,
            sweep_interval: Duration::from_secs(config.retention.sweep_interval_secs),
            upstream_timeout: Duration::from_secs(config.timeouts.upstream_secs),
            storage_timeout: Duration::from_secs(config.timeouts.storage_secs),
            upstream_base_urls: config.upstream_base_urls()?,
        };
        tracing::info!(
            mode = %session.mode,
            store = %session.store_root.display(),
            keyed_seal = session.sealer.is_keyed(),
            retention_days = config.retention.max_age_days,
            "vcr session resolved"
        );
        Ok(session)
    }

    pub fn with_sealer(mut self, sealer: Sealer) -> Self {
        self.sealer = sealer;
        self
    }

    pub fn with_redactor(mut self, redactor: Arc<dyn Redactor>) -> Self {
        self.redactor = redactor;
        self
    }

    pub fn with_retention(mut self, max_age: Option<Duration>) -> Self {
        self.retention = max_age;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    pub fn with_storage_timeout(mut self, timeout: Duration) -> Self {
        self.storage_timeout = timeout;
        self
    }

    pub fn mode(&self) -> VcrMode {
        self.mode
    }

    pub fn store_root(&self) -> &Path {
        &self.store_root
    }

    pub fn redactor(&self) -> &dyn Redactor {
        self.redactor.as_ref()
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn upstream_timeout(&self) -> Duration {
        self.upstream_timeout
    }

    pub fn storage_timeout(&self) -> Duration {
        self.storage_timeout
    }

    /// Store rooted at this session's directory, sealing with its key.
    pub fn store(&self) -> CassetteStore {
        CassetteStore::open(self.store_root.clone(), self.sealer.clone())
    }

    /// HTTP upstream honoring this session's timeout and base URL overrides.
    pub fn http_upstream(&self) -> std::result::Result<HttpUpstream, UpstreamError> {
        let mut upstream = HttpUpstream::new(self.upstream_timeout)?;
        for (provider, url) in &self.upstream_base_urls {
            upstream = upstream.with_base_url(*provider, url.clone());
        }
        Ok(upstream)
    }
}
