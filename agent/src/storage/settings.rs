//! Settings file management

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Deploy service connection
    #[serde(default)]
    pub service: ServiceSettings,

    /// Directory holding the status file, host info and script configs
    #[serde(default = "default_agent_dir")]
    pub agent_dir: PathBuf,

    /// Directory where builds are downloaded and extracted
    #[serde(default = "default_builds_dir")]
    pub builds_dir: PathBuf,

    /// Directory for the agent log and per-environment script logs
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Parent of the per-environment target directory
    #[serde(default = "default_target_default_dir")]
    pub target_default_dir: PathBuf,

    /// Name of the script directory shipped inside each build
    #[serde(default = "default_script_dir_name")]
    pub script_dir_name: String,

    /// Subprocess tunables
    #[serde(default)]
    pub process: ProcessSettings,

    /// Number of builds kept on disk regardless of staleness
    #[serde(default = "default_num_builds_to_retain")]
    pub num_builds_to_retain: usize,

    /// Sleep between cycles in daemon mode, in seconds
    #[serde(default = "default_daemon_sleep_time")]
    pub daemon_sleep_time: u64,

    /// Upper bound of the random delay before a one-shot run, in seconds
    #[serde(default = "default_init_sleep_time")]
    pub init_sleep_time: u64,

    /// Optional host-type sentinel file maintained alongside the status file
    #[serde(default)]
    pub host_type_sentinel: Option<HostTypeSentinelSettings>,
}

fn default_agent_dir() -> PathBuf {
    PathBuf::from("/tmp/deployd")
}

fn default_builds_dir() -> PathBuf {
    PathBuf::from("/tmp/deployd/builds")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/tmp/deployd/logs")
}

fn default_target_default_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_script_dir_name() -> String {
    "teletraan".to_string()
}

fn default_num_builds_to_retain() -> usize {
    2
}

fn default_daemon_sleep_time() -> u64 {
    30
}

fn default_init_sleep_time() -> u64 {
    50
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            service: ServiceSettings::default(),
            agent_dir: default_agent_dir(),
            builds_dir: default_builds_dir(),
            log_dir: default_log_dir(),
            target_default_dir: default_target_default_dir(),
            script_dir_name: default_script_dir_name(),
            process: ProcessSettings::default(),
            num_builds_to_retain: default_num_builds_to_retain(),
            daemon_sleep_time: default_daemon_sleep_time(),
            init_sleep_time: default_init_sleep_time(),
            host_type_sentinel: None,
        }
    }
}

/// Deploy service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Base URL of the deploy service
    #[serde(default = "default_service_url")]
    pub url: String,

    /// API version path segment
    #[serde(default = "default_service_version")]
    pub version: String,

    /// API token, sent as `Authorization: token <token>`
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

fn default_service_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_service_version() -> String {
    "v1".to_string()
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            url: default_service_url(),
            version: default_service_version(),
            token: None,
        }
    }
}

/// Subprocess supervision tunables. Durations are in seconds.
///
/// Each field can be overridden per environment by the runtime config the
/// server sends with a deploy goal, using the field name as key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSettings {
    /// Wall-clock limit for one attempt
    #[serde(default = "default_process_timeout")]
    pub process_timeout: u64,

    /// Heartbeat interval while a script runs
    #[serde(default = "default_min_running_time")]
    pub min_running_time: u64,

    /// Attempts before giving up
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,

    /// Bytes of script output captured into the report
    #[serde(default = "default_max_tail_bytes")]
    pub max_tail_bytes: u64,

    /// Poll interval of a running script
    #[serde(default = "default_process_wait_interval")]
    pub process_wait_interval: u64,

    /// Multiplier applied to the retry delay after each failure
    #[serde(default = "default_back_off_factor")]
    pub back_off_factor: u32,

    /// Upper bound of the retry delay
    #[serde(default = "default_max_sleep_interval")]
    pub max_sleep_interval: u64,
}

fn default_process_timeout() -> u64 {
    1800
}

fn default_min_running_time() -> u64 {
    60
}

fn default_max_retry() -> u32 {
    3
}

fn default_max_tail_bytes() -> u64 {
    10240
}

fn default_process_wait_interval() -> u64 {
    2
}

fn default_back_off_factor() -> u32 {
    2
}

fn default_max_sleep_interval() -> u64 {
    60
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            process_timeout: default_process_timeout(),
            min_running_time: default_min_running_time(),
            max_retry: default_max_retry(),
            max_tail_bytes: default_max_tail_bytes(),
            process_wait_interval: default_process_wait_interval(),
            back_off_factor: default_back_off_factor(),
            max_sleep_interval: default_max_sleep_interval(),
        }
    }
}

/// Sentinel file touched while any tracked environment belongs to `host_type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostTypeSentinelSettings {
    /// Directory holding the sentinel file
    #[serde(default = "default_sentinel_dir")]
    pub dir: PathBuf,

    /// Stage name that marks the host, also used as the file name
    pub host_type: String,
}

fn default_sentinel_dir() -> PathBuf {
    PathBuf::from("/var/run")
}
