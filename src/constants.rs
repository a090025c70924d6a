use std::time::Duration;

pub const DESCRIPTOR_FILE_NAME: &str = "desc";
pub const MONITOR_SOCKET_NAME: &str = "monitor.sock";
pub const PID_FILE_NAME: &str = "pid";
pub const MIGRATE_CERTS_DIR_NAME: &str = "migrate-certs";

pub const VNC_PORT_BASE: u16 = 5900;
/// Guest monitor ports pair with VNC ports by offset.
pub const MONITOR_PORT_BASE: u16 = 55900;
pub const VNC_PORT_WRAP: u16 = 5000;

pub const DEFAULT_RECONCILE_RETRY: Duration = Duration::from_secs(30);
pub const DEFAULT_CPUSET_BALANCE_INTERVAL: Duration = Duration::from_secs(120);

pub const DEFAULT_PRECOPY_POLL: Duration = Duration::from_secs(1);
pub const DEFAULT_PRECOPY_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_MIGRATE_EXPECTED_RATE_MB: u64 = 32;
pub const DEFAULT_MIN_MIGRATE_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_STORE_SIZE_MIB: usize = 256;

/// Name the destination's migration certificate is issued for.
pub const MIGRATE_TLS_HOSTNAME: &str = "keel-migrate";
pub const MIGRATE_PORT_BASE: u16 = 4396;
