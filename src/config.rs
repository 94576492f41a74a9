use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{providers::{Env, Format, Toml}, Figment};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::anchor::RetryPolicy;
use crate::domain::SiteConfig;
use crate::error::ConfigError;
use crate::simulation::{PowerModelParams, SimulationSettings};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const ENV_PREFIX: &str = "SOLAR__";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub model: PowerModelParams,
    #[serde(default)]
    pub anchor: AnchorConfig,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}
impl ServerConfig {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

fn default_request_timeout() -> u64 { 120 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig { pub seed: u64, pub interval_minutes: u32 }
impl Default for SimulationConfig {
    fn default() -> Self { Self { seed: 42, interval_minutes: 5 } }
}

/// Attestation service settings. `api_key` and `shared_secret` usually come
/// from `SOLAR__ANCHOR__API_KEY` / `SOLAR__ANCHOR__SHARED_SECRET`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(skip_serializing)]
    pub shared_secret: Option<String>,
    pub uri_base: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_secs: u64,
}
impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://127.0.0.1:8787".to_string(),
            api_key: None,
            shared_secret: None,
            uri_base: None,
            timeout_secs: 10,
            max_attempts: 3,
            base_delay_secs: 1,
        }
    }
}
impl AnchorConfig {
    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs) }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_secs(self.base_delay_secs),
        }
    }

    /// Longest one anchoring call can run: every attempt times out and
    /// every backoff is waited.
    pub fn retry_budget(&self) -> Duration {
        let policy = self.retry_policy();
        let backoff: Duration = (1..policy.max_attempts).map(|n| policy.delay_after(n)).sum();
        self.timeout().saturating_mul(policy.max_attempts) + backoff
    }
}

/// Daily digest job: every `interval_minutes`, process the previous UTC day.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig { pub enabled: bool, pub interval_minutes: u64, pub anchor: bool }
impl Default for JobConfig {
    fn default() -> Self { Self { enabled: false, interval_minutes: 60, anchor: true } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig { pub dir: PathBuf }
impl Default for ExportConfig {
    fn default() -> Self { Self { dir: PathBuf::from("exports") } }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbConfig { #[serde(default)] pub url: Option<String> }

impl Config {
    /// `.env`, then `config/default.toml`, then `SOLAR__*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        let cfg: Config = figment.extract()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let cfg: Config = Figment::new().merge(Toml::string(toml)).extract()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Site-level field checks plus the cross-field rules no single site can
    /// see.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let interval = self.simulation.interval_minutes;
        if interval == 0 || interval > 60 || 1440 % interval != 0 {
            return Err(ConfigError::Invalid(format!(
                "simulation.interval_minutes must divide a day and be in 1..=60, got {interval}"
            )));
        }
        if self.anchor.max_attempts == 0 {
            return Err(ConfigError::Invalid("anchor.max_attempts must be at least 1".into()));
        }
        if self.anchor.enabled {
            let budget = self.anchor.retry_budget();
            if Duration::from_secs(self.server.request_timeout_secs) <= budget {
                return Err(ConfigError::Invalid(format!(
                    "server.request_timeout_secs must exceed the anchor retry budget of {}s",
                    budget.as_secs()
                )));
            }
        }
        if self.job.interval_minutes == 0 {
            return Err(ConfigError::Invalid("job.interval_minutes must be at least 1".into()));
        }
        if !(self.model.module_area_m2 > 0.0 && self.model.module_efficiency > 0.0) {
            return Err(ConfigError::Invalid(
                "model.module_area_m2 and model.module_efficiency must be positive".into(),
            ));
        }

        let mut seen = HashSet::new();
        for site in &self.sites {
            site.validate().map_err(|errors| ConfigError::InvalidSite {
                site_id: site.id.clone(),
                errors,
            })?;
            if !seen.insert(site.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate site id '{}'", site.id)));
            }
        }
        Ok(())
    }

    pub fn simulation_settings(&self) -> SimulationSettings {
        SimulationSettings {
            seed: self.simulation.seed,
            interval_minutes: self.simulation.interval_minutes,
            power: self.model,
        }
    }

    pub fn site(&self, site_id: &str) -> Option<&SiteConfig> {
        self.sites.iter().find(|s| s.id == site_id)
    }
}
