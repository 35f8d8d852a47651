//! Config provider
//!
//! Combines the settings file with the runtime overrides of the active
//! environment and derives the per-step values the executor needs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, warn};

use crate::deploy::context::StepContext;
use crate::deploy::executor::ExecutorSettings;
use crate::models::deploy_status::DeployStatus;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Runtime config key that overrides the target directory
const TARGET_KEY: &str = "target";

/// Active agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    settings: Settings,
    config_file: Option<PathBuf>,
    layout: StorageLayout,
    runtime: BTreeMap<String, String>,
    env_name: Option<String>,
    context: StepContext,
}

impl Config {
    pub fn new(settings: Settings, config_file: Option<PathBuf>) -> Self {
        let layout = StorageLayout::new(&settings.agent_dir);
        Self {
            settings,
            config_file,
            layout,
            runtime: BTreeMap::new(),
            env_name: None,
            context: StepContext::default(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Settings file the agent was started with, forwarded to helper commands
    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Point the config at an environment: refresh its runtime overrides and
    /// rebuild the step context
    pub fn update_variables(&mut self, status: &DeployStatus) {
        self.runtime = status.runtime_config.clone().unwrap_or_default();
        self.env_name = Some(status.env_name().to_string()).filter(|name| !name.is_empty());
        self.context = StepContext::new(status, &self.target(), self.builds_dir());
        debug!(
            "Config switched to env {:?} with {} runtime overrides",
            self.env_name,
            self.runtime.len()
        );
    }

    /// Runtime override of the active environment
    pub fn get_var(&self, name: &str) -> Option<&str> {
        self.runtime.get(name).map(String::as_str)
    }

    fn tunable<T: FromStr>(&self, name: &str, fallback: T) -> T {
        match self.get_var(name) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!("Ignoring invalid runtime override {}={}", name, raw);
                fallback
            }),
            None => fallback,
        }
    }

    pub fn env_name(&self) -> Option<&str> {
        self.env_name.as_deref()
    }

    /// Directory the active environment is deployed to
    pub fn target(&self) -> PathBuf {
        if let Some(target) = self.get_var(TARGET_KEY).filter(|t| !t.is_empty()) {
            return PathBuf::from(target);
        }
        let base = &self.settings.target_default_dir;
        match self.env_name() {
            Some(env_name) => base.join(env_name),
            None => base.clone(),
        }
    }

    /// Directory holding the active environment's stage scripts. A
    /// per-environment subdirectory wins when the build ships one.
    pub fn script_dir(&self) -> PathBuf {
        let script_dir = self.target().join(&self.settings.script_dir_name);
        if let Some(env_name) = self.env_name() {
            let env_dir = script_dir.join(env_name);
            if env_dir.is_dir() {
                return env_dir;
            }
        }
        script_dir
    }

    pub fn builds_dir(&self) -> &Path {
        &self.settings.builds_dir
    }

    pub fn num_builds_to_retain(&self) -> usize {
        self.tunable("num_builds_to_retain", self.settings.num_builds_to_retain)
    }

    /// Log file receiving the output of the active environment's scripts
    pub fn subprocess_log_file(&self) -> PathBuf {
        match self.env_name() {
            Some(env_name) => self.settings.log_dir.join(format!("{}.log", env_name)),
            None => self.settings.log_dir.join("deploy_subprocess.log"),
        }
    }

    pub fn step_context(&self) -> &StepContext {
        &self.context
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        let process = &self.settings.process;
        ExecutorSettings {
            log_file: self.subprocess_log_file(),
            script_dir: self.script_dir(),
            max_running_time: Duration::from_secs(
                self.tunable("process_timeout", process.process_timeout),
            ),
            min_running_time: Duration::from_secs(
                self.tunable("min_running_time", process.min_running_time),
            ),
            max_retry: self.tunable("max_retry", process.max_retry),
            max_tail_bytes: self.tunable("max_tail_bytes", process.max_tail_bytes),
            poll_interval: Duration::from_secs(
                self.tunable("process_wait_interval", process.process_wait_interval),
            ),
            back_off: self.tunable("back_off_factor", process.back_off_factor),
            max_sleep_interval: Duration::from_secs(
                self.tunable("max_sleep_interval", process.max_sleep_interval),
            ),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Settings::default(), None)
    }
}
