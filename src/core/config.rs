use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::Level;

/// Runtime configuration loaded from `tenantd.toml`, with environment overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub dispatcher: DispatcherConfig,
    pub jobs: JobsConfig,
    pub webhooks: WebhookConfig,
    pub logging: LoggingConfig,
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Browser origins allowed by CORS. Empty allows the localhost origins of `port`.
    pub cors_origins: Vec<String>,
    /// Take the client address from the first `x-forwarded-for` hop. Only enable behind a
    /// proxy that overwrites the header.
    pub trust_forwarded: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 17990,
            cors_origins: Vec::new(),
            trust_forwarded: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub system_db: String,
    /// Shared cache file. Instances pointing at the same file see each other's invalidations.
    /// `None` keeps the cache in-process.
    pub cache_db: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            system_db: "system.db".to_string(),
            cache_db: Some("cache.db".to_string()),
        }
    }
}

impl StorageConfig {
    pub fn system_db_path(&self) -> PathBuf {
        self.data_dir.join(&self.system_db)
    }

    pub fn cache_db_path(&self) -> Option<PathBuf> {
        self.cache_db.as_ref().map(|name| self.data_dir.join(name))
    }

    pub fn tenants_dir(&self) -> PathBuf {
        self.data_dir.join("tenants")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub batch_size: usize,
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub max_response_bytes: usize,
    pub require_echo: bool,
    pub stale_claim_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5,
            batch_size: 50,
            concurrency: 8,
            timeout_secs: 10,
            max_response_bytes: 64 * 1024,
            require_echo: false,
            stale_claim_secs: 300,
        }
    }
}

impl DispatcherConfig {
    /// Longest a round can spend delivering one claimed batch.
    pub fn worst_round_secs(&self) -> u64 {
        let waves = self.batch_size.div_ceil(self.concurrency.max(1)) as u64;
        self.timeout_secs.saturating_mul(waves)
    }

    /// Claims younger than a full round must never be reaped.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 || self.batch_size == 0 {
            bail!("dispatcher.batch_size and dispatcher.concurrency must be positive");
        }
        let worst = self.worst_round_secs();
        if self.stale_claim_secs <= worst {
            bail!(
                "dispatcher.stale_claim_secs ({}) must exceed the worst-case round time of {}s",
                self.stale_claim_secs,
                worst
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// A tick is dropped while the previous run of the same job is still active.
    Skip,
    Allow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Only one instance of a deployment should run with this enabled.
    pub enabled: bool,
    pub overlap: OverlapPolicy,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            overlap: OverlapPolicy::Skip,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Bounds a before-webhook round trip, which runs while the tenant transaction is open.
    pub timeout_secs: u64,
    pub max_response_bytes: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3,
            max_response_bytes: 1024 * 1024,
        }
    }
}

pub const MAX_HOOK_TIMEOUT_SECS: u64 = 30;

impl WebhookConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 || self.timeout_secs > MAX_HOOK_TIMEOUT_SECS {
            bail!(
                "webhooks.timeout_secs must be between 1 and {}, got {}",
                MAX_HOOK_TIMEOUT_SECS,
                self.timeout_secs
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn max_level(&self) -> Level {
        match self.level.to_ascii_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub token_flush_cron: Option<String>,
    pub query_flush_cron: Option<String>,
    pub stats_cron: Option<String>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            token_flush_cron: Some("0 0 * * * *".to_string()),
            query_flush_cron: Some("0 30 * * * *".to_string()),
            stats_cron: Some("0 * * * * *".to_string()),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".tenantd"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

impl Config {
    /// Reads the config file (a missing file yields defaults), then applies `TENANTD_*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("TENANTD_CONFIG").ok().map(PathBuf::from);
        let path = path.map(Path::to_path_buf).or(env_path);

        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(&p)
                    .with_context(|| format!("Failed to read config file {}", p.display()))?;
                toml::from_str::<Config>(&raw)
                    .with_context(|| format!("Failed to parse config file {}", p.display()))?
            }
            _ => Config::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.dispatcher.validate()?;
        config.webhooks.validate()?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("TENANTD_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(host) = lookup("TENANTD_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("TENANTD_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("TENANTD_PORT is not a valid port: {}", port))?;
        }
        Ok(())
    }
}
