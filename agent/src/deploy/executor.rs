//! Stage executor
//!
//! Supervises one external process per deploy stage. The process runs in its
//! own process group with output appended to the environment's log file. While
//! it runs the executor heartbeats to the server, aborting when the plan
//! changes, and enforces a wall-clock limit per attempt. Failed attempts are
//! retried with exponential backoff.

use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::deploy::context::StepContext;
use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::models::report::DeployReport;
use crate::models::status::{AgentStatus, DeployStage, PingStatus};
use crate::storage::config::Config;
use crate::storage::settings::ProcessSettings;

/// Shortest sleep between two polls
const MIN_POLL_SLEEP: Duration = Duration::from_millis(10);

/// Executor tunables, derived from the config of the active environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub log_file: PathBuf,
    pub script_dir: PathBuf,
    pub max_running_time: Duration,
    /// Heartbeat interval
    pub min_running_time: Duration,
    pub max_retry: u32,
    pub max_tail_bytes: u64,
    pub poll_interval: Duration,
    pub back_off: u32,
    pub max_sleep_interval: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        let process = ProcessSettings::default();
        Self {
            log_file: PathBuf::from("/tmp/deployd/logs/deploy_subprocess.log"),
            script_dir: PathBuf::from("/tmp/teletraan"),
            max_running_time: Duration::from_secs(process.process_timeout),
            min_running_time: Duration::from_secs(process.min_running_time),
            max_retry: process.max_retry,
            max_tail_bytes: process.max_tail_bytes,
            poll_interval: Duration::from_secs(process.process_wait_interval),
            back_off: process.back_off_factor,
            max_sleep_interval: Duration::from_secs(process.max_sleep_interval),
        }
    }
}

/// External command run for a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCommand {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
}

impl StepCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

impl fmt::Display for StepCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Mid-execution report to the server while a step runs
#[async_trait]
pub trait Heartbeat: Send {
    async fn beat(&mut self, report: &DeployReport) -> PingStatus;
}

/// Runs deploy steps
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Refresh tunables and the step context from the active environment
    fn update_configs(&mut self, config: &Config);

    /// Run a command until it succeeds, fails for good, times out or is
    /// superseded by a new plan
    async fn run_cmd(&self, cmd: &StepCommand, heartbeat: &mut dyn Heartbeat) -> DeployReport;

    /// Run the user script of a stage from the script directory
    async fn execute_command(
        &self,
        stage: DeployStage,
        heartbeat: &mut dyn Heartbeat,
    ) -> DeployReport;
}

/// Executor spawning real processes
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    settings: ExecutorSettings,
    context: StepContext,
}

impl ProcessExecutor {
    pub fn new(settings: ExecutorSettings, context: StepContext) -> Self {
        Self { settings, context }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    async fn spawn(&self, cmd: &StepCommand) -> Result<(Child, u64), AgentError> {
        let log = &self.settings.log_file;
        if let Some(parent) = log.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let out = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .await?;
        let offset = out.metadata().await?.len();
        let out = out.into_std().await;
        let err = out.try_clone()?;

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(self.context.vars())
            .stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err))
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = cmd.current_dir.as_ref() {
            command.current_dir(dir);
        }

        let child = command
            .spawn()
            .map_err(|e| AgentError::DeployError(format!("Failed to run {}: {}", cmd, e)))?;
        Ok((child, offset))
    }

    /// Heartbeat when the interval has elapsed. Returns true when the server
    /// changed the plan and the step must be abandoned.
    async fn beat_if_due(
        &self,
        last_beat: &mut Instant,
        cmd: &StepCommand,
        report: &mut DeployReport,
        heartbeat: &mut dyn Heartbeat,
    ) -> bool {
        if last_beat.elapsed() < self.settings.min_running_time {
            return false;
        }
        *last_beat = Instant::now();
        info!(
            "Exceeded min running time {:?}, reporting to the server",
            self.settings.min_running_time
        );

        if heartbeat.beat(report).await == PingStatus::PlanChanged {
            report.status_code = AgentStatus::AbortedByServer;
            info!("Deploy goal has changed, aborting the current command {}", cmd);
            return true;
        }
        false
    }

    /// Sleep until the next poll without overshooting the heartbeat deadline
    fn poll_sleep(&self, last_beat: Instant, interval: Duration) -> Duration {
        let until_beat = self
            .settings
            .min_running_time
            .saturating_sub(last_beat.elapsed());
        interval.min(until_beat.max(MIN_POLL_SLEEP))
    }

    async fn tail(&self, offset: u64) -> Option<String> {
        match read_tail(&self.settings.log_file, offset, self.settings.max_tail_bytes).await {
            Ok(output) => Some(output),
            Err(e) => {
                warn!("Could not read output from {}: {}", self.settings.log_file.display(), e);
                None
            }
        }
    }
}

#[async_trait]
impl StageExecutor for ProcessExecutor {
    fn update_configs(&mut self, config: &Config) {
        self.settings = config.executor_settings();
        self.context = config.step_context().clone();
        debug!(
            "Executor configs updated: ping interval {:?}, timeout {:?}, max retry {}",
            self.settings.min_running_time, self.settings.max_running_time, self.settings.max_retry
        );
    }

    async fn run_cmd(&self, cmd: &StepCommand, heartbeat: &mut dyn Heartbeat) -> DeployReport {
        let settings = &self.settings;
        info!("Running: {} with {} retries", cmd, settings.max_retry);

        let mut report = DeployReport::new(AgentStatus::Unknown);
        let mut interval = settings.poll_interval;
        let mut last_beat = Instant::now();
        let mut attempts = 0;

        while attempts < settings.max_retry {
            match self.spawn(cmd).await {
                Ok((mut child, offset)) => {
                    let started = Instant::now();
                    let pgid = child.id().map(|id| Pid::from_raw(id as i32));

                    let exit = loop {
                        match child.try_wait() {
                            Ok(Some(status)) => break Ok(status),
                            Ok(None) => {}
                            Err(e) => break Err(e),
                        }

                        if self
                            .beat_if_due(&mut last_beat, cmd, &mut report, heartbeat)
                            .await
                        {
                            terminate(&mut child, pgid).await;
                            return report;
                        }

                        let elapsed = started.elapsed();
                        if elapsed >= settings.max_running_time {
                            terminate(&mut child, pgid).await;
                            report.output_msg = self.tail(offset).await;
                            report.status_code = AgentStatus::ScriptTimeout;
                            report.error_code = 1;
                            info!("Exceeded max running time {:?}", settings.max_running_time);
                            return report;
                        }

                        let remaining = settings.max_running_time - elapsed;
                        let sleep = self
                            .poll_sleep(last_beat, settings.poll_interval)
                            .min(remaining.max(MIN_POLL_SLEEP));
                        tokio::time::sleep(sleep).await;
                    };

                    match exit {
                        Ok(status) => {
                            report.error_code = status.code().unwrap_or(-1);
                            report.output_msg = self.tail(offset).await;
                            if status.success() {
                                info!("Running: {} succeeded", cmd);
                                report.status_code = AgentStatus::Succeeded;
                                return report;
                            }
                        }
                        Err(e) => {
                            terminate(&mut child, pgid).await;
                            error!("Lost track of {}: {}", cmd, e);
                            report.error_code = 1;
                            report.output_msg = Some(e.to_string());
                        }
                    }
                }
                Err(e) => {
                    error!("{}", e);
                    report.error_code = 1;
                    report.output_msg = Some(e.to_string());
                }
            }

            report.status_code = AgentStatus::ScriptFailed;
            report.retry_times += 1;
            attempts += 1;

            if attempts >= settings.max_retry {
                report.status_code = AgentStatus::TooManyRetry;
                return report;
            }

            info!(
                "Failed: {}, at {} retry. Error:\n{}",
                cmd,
                report.retry_times,
                report.output_msg.as_deref().unwrap_or_default()
            );

            let first = self.poll_sleep(last_beat, interval);
            tokio::time::sleep(first).await;
            if self
                .beat_if_due(&mut last_beat, cmd, &mut report, heartbeat)
                .await
            {
                return report;
            }
            if interval > first {
                tokio::time::sleep(interval - first).await;
            }
            interval = interval
                .checked_mul(settings.back_off)
                .unwrap_or(settings.max_sleep_interval)
                .min(settings.max_sleep_interval);
        }

        report.status_code = AgentStatus::TooManyRetry;
        report
    }

    async fn execute_command(
        &self,
        stage: DeployStage,
        heartbeat: &mut dyn Heartbeat,
    ) -> DeployReport {
        let script_dir = Dir::new(&self.settings.script_dir);
        if !script_dir.exists().await {
            // never deployed before, nothing shipped yet
            let message = format!(
                "script directory {} cannot be found in step {}",
                script_dir.path().display(),
                stage
            );
            if stage.is_pre_stage() {
                warn!("{}", message);
                return DeployReport::succeeded();
            }
            error!("{}", message);
            return DeployReport::agent_failed(message);
        }

        let script = script_dir.file(stage.as_str());
        if !script.exists().await {
            if stage == DeployStage::Restarting {
                let message = "RESTARTING script does not exist.";
                error!("{}", message);
                return DeployReport::agent_failed(message);
            }
            info!("Script {} does not exist", script.path().display());
            return DeployReport::succeeded();
        }

        if let Err(e) = script.set_owner_executable().await {
            error!("Failed to execute {}: {}", script.path().display(), e);
            return DeployReport::agent_failed(e.to_string());
        }

        let cmd = StepCommand::new(script.path().display().to_string())
            .current_dir(script_dir.path());
        self.run_cmd(&cmd, heartbeat).await
    }
}

/// Kill the whole process group of a child and reap it
async fn terminate(child: &mut Child, pgid: Option<Pid>) {
    match pgid {
        Some(pgid) => match killpg(pgid, Signal::SIGKILL) {
            // already gone
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => debug!("Failed to kill process group {}: {}", pgid, e),
        },
        None => {
            if let Err(e) = child.start_kill() {
                debug!("Failed to kill process: {}", e);
            }
        }
    }
    if let Err(e) = child.wait().await {
        debug!("Failed to reap process: {}", e);
    }
}

/// Last `max_bytes` of the log written since `offset`, without the final newline
async fn read_tail(path: &Path, offset: u64, max_bytes: u64) -> Result<String, AgentError> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    // one extra byte for a trailing newline
    let start = offset.max(len.saturating_sub(max_bytes.saturating_add(1)));
    file.seek(SeekFrom::Start(start)).await?;
    let mut output = Vec::new();
    file.read_to_end(&mut output).await?;

    if output.last() == Some(&b'\n') {
        output.pop();
    }
    let start = output.len().saturating_sub(max_bytes as usize);
    Ok(String::from_utf8_lossy(&output[start..]).into_owned())
}
