//! Application configuration options

use std::path::PathBuf;

use crate::ping::host_info::HostOverrides;
use crate::storage::settings::Settings;

/// Default location of the settings file
pub const DEFAULT_SETTINGS_FILE: &str = "/etc/deployd/settings.json";

/// Main application options
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    /// Keep serving until a shutdown signal instead of running one cycle
    pub daemon: bool,

    /// Settings file the agent was started with, forwarded to helper commands
    pub config_file: Option<PathBuf>,

    /// Host identity given on the command line
    pub host_overrides: HostOverrides,

    /// Loaded settings
    pub settings: Settings,
}
