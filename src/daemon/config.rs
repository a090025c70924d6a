use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use keel::{
    agent::{
        AgentConfig, MigrationSettings, control_plane::ControlPlaneConfig, cpuset::CpusetBalancer,
        hypervisor::qemu::QemuConfig, storage::StorageConfig,
    },
    constants::{
        DEFAULT_CPUSET_BALANCE_INTERVAL, DEFAULT_MIGRATE_EXPECTED_RATE_MB,
        DEFAULT_MIN_MIGRATE_TIMEOUT, DEFAULT_PRECOPY_POLL, DEFAULT_PRECOPY_TIMEOUT,
        DEFAULT_RECONCILE_RETRY, DEFAULT_STOP_TIMEOUT, DEFAULT_STORE_SIZE_MIB,
    },
};
use serde::Deserialize;
use tokio::fs::read_to_string;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(skip_deserializing)]
    pub config_path: PathBuf,

    #[serde(rename = "host-id")]
    pub host_id: String,
    #[serde(rename = "master-ip")]
    pub master_ip: String,
    #[serde(rename = "servers-path")]
    pub servers_path: Option<PathBuf>,
    #[serde(rename = "memory-snapshots-path")]
    pub memory_snapshots_path: PathBuf,
    #[serde(rename = "store-path")]
    pub store_path: PathBuf,
    #[serde(rename = "store-size-mib", default = "default_store_size")]
    pub store_size_mib: usize,
    #[serde(rename = "sdn-socket-path")]
    pub sdn_socket_path: PathBuf,

    #[serde(rename = "enable-cpu-binding", default)]
    pub enable_cpu_binding: bool,
    #[serde(rename = "disable-set-cgroup", default)]
    pub disable_set_cgroup: bool,
    #[serde(rename = "cpuset-balance-interval-secs", default = "default_balance_interval")]
    pub cpuset_balance_interval_secs: u64,
    #[serde(rename = "reconcile-retry-secs", default = "default_reconcile_retry")]
    pub reconcile_retry_secs: u64,
    #[serde(rename = "stop-timeout-secs", default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    #[serde(rename = "stop-shared-guests-on-exit", default = "default_true")]
    pub stop_shared_guests_on_exit: bool,

    #[serde(rename = "control-plane")]
    pub control_plane: ControlPlaneConfig,

    #[serde(rename = "migration", default)]
    pub migration: MigrationConfig,

    #[serde(rename = "storage", default)]
    pub storage: Vec<StorageConfig>,

    #[serde(rename = "hypervisor", default)]
    pub hypervisor: QemuConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    #[serde(rename = "expected-rate-mb", default = "default_expected_rate")]
    pub expected_rate_mb: u64,
    #[serde(rename = "min-timeout-secs", default = "default_min_timeout")]
    pub min_timeout_secs: u64,
    #[serde(rename = "precopy-timeout-secs", default = "default_precopy_timeout")]
    pub precopy_timeout_secs: u64,
    #[serde(rename = "precopy-poll-millis", default = "default_precopy_poll")]
    pub precopy_poll_millis: u64,
    #[serde(rename = "fetch-timeout-secs", default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            expected_rate_mb: default_expected_rate(),
            min_timeout_secs: default_min_timeout(),
            precopy_timeout_secs: default_precopy_timeout(),
            precopy_poll_millis: default_precopy_poll(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

fn default_balance_interval() -> u64 {
    DEFAULT_CPUSET_BALANCE_INTERVAL.as_secs()
}

fn default_reconcile_retry() -> u64 {
    DEFAULT_RECONCILE_RETRY.as_secs()
}

fn default_stop_timeout() -> u64 {
    DEFAULT_STOP_TIMEOUT.as_secs()
}

fn default_true() -> bool {
    true
}

fn default_store_size() -> usize {
    DEFAULT_STORE_SIZE_MIB
}

fn default_expected_rate() -> u64 {
    DEFAULT_MIGRATE_EXPECTED_RATE_MB
}

fn default_min_timeout() -> u64 {
    DEFAULT_MIN_MIGRATE_TIMEOUT.as_secs()
}

fn default_precopy_timeout() -> u64 {
    DEFAULT_PRECOPY_TIMEOUT.as_secs()
}

fn default_precopy_poll() -> u64 {
    DEFAULT_PRECOPY_POLL.as_millis() as u64
}

fn default_fetch_timeout() -> u64 {
    300
}

fn resolve_config_path(path_override: Option<PathBuf>) -> Result<PathBuf> {
    let config_path =
        path_override.or_else(|| std::env::var("KEEL_CONFIG").ok().map(PathBuf::from));

    if let Some(path) = config_path {
        return Ok(path);
    }

    warn!("No config path override found, looking for config in default locations");

    let path = std::env::current_dir()?.join("keel.toml");
    if path.exists() {
        return Ok(path);
    }
    warn!("No config found in current directory ({})", path.display());

    let Some(project_dirs) = directories::ProjectDirs::from("dev", "keel", "keel") else {
        bail!("Failed to get config dir");
    };
    let path = project_dirs.config_dir().join("config.toml");
    if path.exists() {
        return Ok(path);
    }
    warn!("No config found in home config dir ({})", path.display());

    let path = PathBuf::from("/etc/keel/config.toml");
    if path.exists() {
        return Ok(path);
    }
    warn!("No config found in global config dir ({})", path.display());

    bail!("Couldn't load config file.");
}

impl Config {
    pub async fn load(path_override: Option<PathBuf>) -> Result<Self> {
        let config_path = resolve_config_path(path_override)?;

        let config_str = read_to_string(&config_path).await?;
        let mut config = Self::parse(&config_str)?;
        config.config_path = config_path;

        Ok(config)
    }

    fn parse(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.migration.fetch_timeout_secs)
    }

    pub fn to_agent_config(&self) -> AgentConfig {
        AgentConfig {
            host_id: self.host_id.clone(),
            master_ip: self.master_ip.clone(),
            servers_path: self.servers_path.clone(),
            memory_snapshots_path: self.memory_snapshots_path.clone(),
            store_path: self.store_path.clone(),
            store_size_mib: self.store_size_mib,
            sdn_socket_path: self.sdn_socket_path.clone(),
            enable_cpu_binding: self.enable_cpu_binding,
            host_cores: CpusetBalancer::host_cores(),
            cpuset_balance_interval: Duration::from_secs(self.cpuset_balance_interval_secs),
            reconcile_retry: Duration::from_secs(self.reconcile_retry_secs),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            stop_shared_guests_on_exit: self.stop_shared_guests_on_exit,
            migration: MigrationSettings {
                expected_rate_mb: self.migration.expected_rate_mb,
                min_timeout: Duration::from_secs(self.migration.min_timeout_secs),
                precopy_timeout: Duration::from_secs(self.migration.precopy_timeout_secs),
                precopy_poll: Duration::from_millis(self.migration.precopy_poll_millis),
            },
        }
    }
}
