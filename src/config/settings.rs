/*
* Balancer configuration
* ----------------------
*
* Layers, lowest to highest priority:
* 1. Hardcoded defaults (`Settings::default()`)
* 2. <CONFIG_PATH>/default.toml
* 3. <CONFIG_PATH>/local.toml
* 4. VMMEM_* environment variables, `__` between sections
*    (e.g. VMMEM_BALANCER__FREE_MEM_LEFT_MIB=64)
*
* Memory sizes are configured in MiB and handed to the core in bytes.
*/

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::errors::SettingsError;
use crate::utils::mib;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub balancer: BalancerSettings,
    pub planner: PlannerSettings,
    pub hypervisor: HypervisorSettings,
    pub ingest: IngestSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub api_prefix: String,
    /// Unix socket for synchronous balloon requests; unset disables it.
    pub balloon_socket: Option<PathBuf>,
    /// Upper bound on how long a balloon-socket client may keep the state locked.
    pub balloon_hold_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerSettings {
    /// Free memory the host tries to keep in reserve.
    pub free_mem_left_mib: u64,
    /// Hard minimum of free memory left after a balloon request.
    pub free_mem_min_mib: u64,
    pub retry_delay_ms: u64,
    pub apply_retries: u32,
    pub balloon_iterations: u32,
    /// 0 means balancing only runs on events.
    pub periodic_interval_secs: u64,
    /// Store path whose presence disables balancing.
    pub disable_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSettings {
    pub cache_factor: f64,
    pub control_domain_boost_mib: u64,
    pub reserved_floor_mib: u64,
    pub donor_min_excess_mib: u64,
    pub balloon_safety_factor: f64,
    pub min_total_transfer_mib: u64,
    pub min_change_under_pref_mib: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Xl,
    Sim,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorSettings {
    pub backend: Backend,
    pub xl_path: PathBuf,
    pub xenstore_read: PathBuf,
    pub xenstore_write: PathBuf,
    pub xenstore_exists: PathBuf,
    /// Host size for the simulated backend.
    pub sim_total_mib: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub reports_per_second: u32,
    pub burst: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3010,
            api_prefix: "/api/v1".to_string(),
            balloon_socket: Some(PathBuf::from("/var/run/vm-mem-balancer.sock")),
            balloon_hold_secs: 60,
        }
    }
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            free_mem_left_mib: 50,
            free_mem_min_mib: 25,
            retry_delay_ms: 100,
            apply_retries: 5,
            balloon_iterations: 20,
            periodic_interval_secs: 0,
            disable_path: "/vm-mem-balancer/do-not-membalance".to_string(),
        }
    }
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            cache_factor: 1.3,
            control_domain_boost_mib: 350,
            reserved_floor_mib: 32,
            donor_min_excess_mib: 10,
            balloon_safety_factor: 1.05,
            min_total_transfer_mib: 150,
            min_change_under_pref_mib: 15,
        }
    }
}

impl Default for HypervisorSettings {
    fn default() -> Self {
        Self {
            backend: Backend::Xl,
            xl_path: PathBuf::from("xl"),
            xenstore_read: PathBuf::from("xenstore-read"),
            xenstore_write: PathBuf::from("xenstore-write"),
            xenstore_exists: PathBuf::from("xenstore-exists"),
            sim_total_mib: 4096,
        }
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            reports_per_second: 2,
            burst: 5,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl BalancerSettings {
    pub fn free_mem_left(&self) -> u64 {
        mib(self.free_mem_left_mib)
    }

    pub fn free_mem_min(&self) -> u64 {
        mib(self.free_mem_min_mib)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Settings {
    pub fn new() -> Result<Self, SettingsError> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());

        info!("Loading configuration from path: {}", config_path);

        let config = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::with_name(&format!("{}/default", config_path)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_path)).required(false))
            .add_source(
                Environment::with_prefix("VMMEM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn new_from_file(path: &Path) -> Result<Self, SettingsError> {
        let config = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::from(path))
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let b = &self.balancer;
        if b.free_mem_left_mib == 0 {
            return Err(invalid("balancer.free_mem_left_mib", "must be positive"));
        }
        if b.free_mem_min_mib > b.free_mem_left_mib {
            return Err(invalid(
                "balancer.free_mem_min_mib",
                format!("{} exceeds free_mem_left_mib {}", b.free_mem_min_mib, b.free_mem_left_mib),
            ));
        }
        if b.apply_retries == 0 {
            return Err(invalid("balancer.apply_retries", "must be at least 1"));
        }
        if b.balloon_iterations == 0 {
            return Err(invalid("balancer.balloon_iterations", "must be at least 1"));
        }

        let p = &self.planner;
        if !(p.cache_factor >= 1.0) {
            return Err(invalid("planner.cache_factor", format!("{} is below 1.0", p.cache_factor)));
        }
        if !(p.balloon_safety_factor >= 1.0) {
            return Err(invalid(
                "planner.balloon_safety_factor",
                format!("{} is below 1.0", p.balloon_safety_factor),
            ));
        }
        if p.min_change_under_pref_mib > p.min_total_transfer_mib {
            return Err(invalid(
                "planner.min_change_under_pref_mib",
                "must not exceed min_total_transfer_mib",
            ));
        }

        if self.ingest.reports_per_second == 0 {
            return Err(invalid("ingest.reports_per_second", "must be positive"));
        }
        if !self.server.api_prefix.starts_with('/') {
            return Err(invalid("server.api_prefix", "must start with '/'"));
        }

        Ok(())
    }
}

fn invalid(key: &'static str, message: impl Into<String>) -> SettingsError {
    SettingsError::Invalid {
        key,
        message: message.into(),
    }
}
