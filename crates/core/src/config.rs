use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::SamplingPolicy;
use crate::error::{HoplineError, Result};

/// What a hop does when its forward attempt times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Answer the caller with this hop's partial result.
    #[default]
    Degrade,
    /// Fail the request upward.
    Propagate,
}

impl TimeoutPolicy {
    pub fn parse(input: &str) -> Result<Self> {
        match input.to_ascii_lowercase().as_str() {
            "degrade" => Ok(Self::Degrade),
            "propagate" => Ok(Self::Propagate),
            other => Err(HoplineError::Config(format!(
                "unknown timeout policy: {other}"
            ))),
        }
    }
}

/// What a hop does when the next service answers with an error status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownstreamPolicy {
    /// Swallow the failure and answer with a fallback result.
    Absorb,
    /// Mirror the failure upward.
    #[default]
    Propagate,
}

impl DownstreamPolicy {
    pub fn parse(input: &str) -> Result<Self> {
        match input.to_ascii_lowercase().as_str() {
            "absorb" => Ok(Self::Absorb),
            "propagate" => Ok(Self::Propagate),
            other => Err(HoplineError::Config(format!(
                "unknown downstream policy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    pub name: String,
    pub listen_addr: String,
    pub on_timeout: TimeoutPolicy,
    pub on_downstream_error: DownstreamPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub db_path: PathBuf,
    pub forward_timeout: Duration,
    pub persist_budget: Duration,
    pub export_channel_capacity: usize,
    pub export_batch_size: usize,
    pub export_flush_ms: u64,
    pub sampling: SamplingPolicy,
    pub services: Vec<ServiceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let data_home = env::var("XDG_DATA_HOME").ok();

        let data_root = data_home
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(home).join(".local/share"));

        Self {
            db_path: data_root.join("hopline/hopline.duckdb"),
            forward_timeout: Duration::from_secs(10),
            persist_budget: Duration::from_secs(2),
            export_channel_capacity: 512,
            export_batch_size: 256,
            export_flush_ms: 200,
            sampling: SamplingPolicy::Always,
            services: vec![
                ServiceConfig {
                    name: "user-service".to_string(),
                    listen_addr: "127.0.0.1:7301".to_string(),
                    on_timeout: TimeoutPolicy::Degrade,
                    on_downstream_error: DownstreamPolicy::Propagate,
                },
                ServiceConfig {
                    name: "order-service".to_string(),
                    listen_addr: "127.0.0.1:7302".to_string(),
                    on_timeout: TimeoutPolicy::Degrade,
                    on_downstream_error: DownstreamPolicy::Propagate,
                },
                ServiceConfig {
                    name: "audit-service".to_string(),
                    listen_addr: "127.0.0.1:7303".to_string(),
                    on_timeout: TimeoutPolicy::Degrade,
                    on_downstream_error: DownstreamPolicy::Propagate,
                },
            ],
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut cfg = Self::default();
        let config_path = config_file_path();
        if let Some(file_overrides) = load_file_overrides(&config_path)? {
            apply_overrides(&mut cfg, file_overrides, "config file")?;
        }
        let env_overrides = load_env_overrides()?;
        apply_overrides(&mut cfg, env_overrides, "environment")?;
        Ok(cfg)
    }

    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let mut cfg = Self::default();
        let Some(file_overrides) = load_file_overrides(path)? else {
            return Err(HoplineError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        };
        apply_overrides(&mut cfg, file_overrides, "config file")?;
        let env_overrides = load_env_overrides()?;
        apply_overrides(&mut cfg, env_overrides, "environment")?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        let env_overrides = load_env_overrides()?;
        apply_overrides(&mut cfg, env_overrides, "environment")?;
        Ok(cfg)
    }

    pub fn topology(&self) -> Result<ChainTopology> {
        ChainTopology::new(self.services.clone())
    }
}

/// Ordered list of services forming the chain. Position decides everything:
/// the first entry takes external traffic, each hop forwards to its
/// successor, and the last entry serves the trace query endpoints.
#[derive(Debug, Clone)]
pub struct ChainTopology {
    services: Vec<ServiceConfig>,
}

impl ChainTopology {
    pub fn new(services: Vec<ServiceConfig>) -> Result<Self> {
        if services.is_empty() {
            return Err(HoplineError::Config("service chain is empty".into()));
        }
        for (idx, svc) in services.iter().enumerate() {
            if svc.name.is_empty() || svc.listen_addr.is_empty() {
                return Err(HoplineError::Config(format!(
                    "service at position {idx} is missing a name or listen_addr"
                )));
            }
            if services[..idx].iter().any(|s| s.name == svc.name) {
                return Err(HoplineError::Config(format!(
                    "duplicate service name in chain: {}",
                    svc.name
                )));
            }
        }
        Ok(Self { services })
    }

    pub fn services(&self) -> &[ServiceConfig] {
        &self.services
    }

    pub fn entry(&self) -> &ServiceConfig {
        &self.services[0]
    }

    pub fn terminal(&self) -> &ServiceConfig {
        &self.services[self.services.len() - 1]
    }

    pub fn get(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn next_hop(&self, name: &str) -> Option<&ServiceConfig> {
        let pos = self.services.iter().position(|s| s.name == name)?;
        self.services.get(pos + 1)
    }

    pub fn is_terminal(&self, name: &str) -> bool {
        self.terminal().name == name
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigOverrides {
    db_path: Option<PathBuf>,
    forward_timeout: Option<String>,
    persist_budget: Option<String>,
    export_channel_capacity: Option<usize>,
    export_batch_size: Option<usize>,
    export_flush_ms: Option<u64>,
    sampling: Option<String>,
    services: Option<Vec<ServiceOverride>>,
}

#[derive(Debug, Deserialize)]
struct ServiceOverride {
    name: String,
    listen_addr: String,
    on_timeout: Option<String>,
    on_downstream_error: Option<String>,
}

fn config_file_path() -> PathBuf {
    if let Ok(path) = env::var("HOPLINE_CONFIG") {
        return PathBuf::from(path);
    }

    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let config_home = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(home).join(".config"));
    config_home.join("hopline/config.toml")
}

fn load_file_overrides(path: &PathBuf) -> Result<Option<ConfigOverrides>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| HoplineError::Config(format!("failed reading {}: {e}", path.display())))?;
    let parsed: ConfigOverrides = toml::from_str(&raw)
        .map_err(|e| HoplineError::Config(format!("failed parsing {}: {e}", path.display())))?;
    Ok(Some(parsed))
}

fn load_env_overrides() -> Result<ConfigOverrides> {
    Ok(ConfigOverrides {
        db_path: env::var("HOPLINE_DB_PATH").ok().map(PathBuf::from),
        forward_timeout: env::var("HOPLINE_FORWARD_TIMEOUT").ok(),
        persist_budget: env::var("HOPLINE_PERSIST_BUDGET").ok(),
        export_channel_capacity: None,
        export_batch_size: None,
        export_flush_ms: None,
        sampling: env::var("HOPLINE_SAMPLING").ok(),
        services: None,
    })
}

fn apply_overrides(cfg: &mut Config, overrides: ConfigOverrides, source: &str) -> Result<()> {
    if let Some(v) = overrides.db_path {
        cfg.db_path = v;
    }
    if let Some(v) = overrides.forward_timeout {
        cfg.forward_timeout = humantime::parse_duration(&v).map_err(|e| {
            HoplineError::Config(format!("bad forward_timeout in {source}: {e} (value={v})"))
        })?;
    }
    if let Some(v) = overrides.persist_budget {
        cfg.persist_budget = humantime::parse_duration(&v).map_err(|e| {
            HoplineError::Config(format!("bad persist_budget in {source}: {e} (value={v})"))
        })?;
    }
    if let Some(v) = overrides.export_channel_capacity {
        cfg.export_channel_capacity = v;
    }
    if let Some(v) = overrides.export_batch_size {
        cfg.export_batch_size = v;
    }
    if let Some(v) = overrides.export_flush_ms {
        cfg.export_flush_ms = v;
    }
    if let Some(v) = overrides.sampling {
        cfg.sampling = SamplingPolicy::parse(&v)
            .map_err(|e| HoplineError::Config(format!("bad sampling in {source}: {e}")))?;
    }
    if let Some(v) = overrides.services {
        cfg.services = v
            .into_iter()
            .map(|svc| parse_service_override(svc, source))
            .collect::<Result<Vec<_>>>()?;
    }
    Ok(())
}

fn parse_service_override(raw: ServiceOverride, source: &str) -> Result<ServiceConfig> {
    let on_timeout = match raw.on_timeout {
        Some(v) => TimeoutPolicy::parse(&v).map_err(|e| {
            HoplineError::Config(format!("bad on_timeout for {} in {source}: {e}", raw.name))
        })?,
        None => TimeoutPolicy::default(),
    };
    let on_downstream_error = match raw.on_downstream_error {
        Some(v) => DownstreamPolicy::parse(&v).map_err(|e| {
            HoplineError::Config(format!(
                "bad on_downstream_error for {} in {source}: {e}",
                raw.name
            ))
        })?,
        None => DownstreamPolicy::default(),
    };
    Ok(ServiceConfig {
        name: raw.name,
        listen_addr: raw.listen_addr,
        on_timeout,
        on_downstream_error,
    })
}
