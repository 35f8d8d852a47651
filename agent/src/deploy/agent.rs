//! Deploy agent controller
//!
//! Drives every tracked environment through the stages the server asks for.
//! One cycle pings the server, merges the returned goal, executes its stage,
//! reports the outcome and repeats until the server has nothing left to do.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::deploy::executor::{Heartbeat, StageExecutor, StepCommand};
use crate::deploy::helper::BuildHelper;
use crate::deploy::plan::plan_changed;
use crate::errors::AgentError;
use crate::models::deploy_status::{DeployStatus, Envs};
use crate::models::goal::DeployGoal;
use crate::models::ping::PingResponse;
use crate::models::report::DeployReport;
use crate::models::status::{AgentStatus, DeployStage, PingStatus};
use crate::ping::client::PingClient;
use crate::storage::config::Config;
use crate::storage::env_status::EnvStatus;
use crate::telemetry::{
    Metrics, Tags, DEPLOY_INFO, DEPLOY_STATUS_SUM, FAILED_STATUS_FILE, STAGE_TIME_ELAPSED,
};

pub const DOWNLOADER: &str = "deploy-downloader";
pub const STAGER: &str = "deploy-stager";

/// Goal whose stage is being timed
#[derive(Debug)]
struct StageTimer {
    goal: DeployGoal,
    started: Instant,
}

/// Everything the controller mutates while a step runs. Kept apart from
/// the executor so it can serve as the executor's heartbeat.
pub struct AgentState {
    client: Box<dyn PingClient>,
    store: EnvStatus,
    config: Config,
    envs: Envs,
    current: Option<String>,
    response: Option<PingResponse>,
    first_run: bool,
    metrics: Metrics,
    stage_timer: Option<StageTimer>,
}

impl AgentState {
    fn current_status(&self) -> Option<&DeployStatus> {
        self.envs.get(self.current.as_ref()?)
    }

    fn current_status_mut(&mut self) -> Option<&mut DeployStatus> {
        self.envs.get_mut(self.current.as_ref()?)
    }

    /// Reload tracked environments from disk
    async fn load_status_file(&mut self) {
        self.envs = match self.store.load_envs().await {
            Ok(envs) => envs,
            Err(AgentError::CorruptState(reason)) => {
                error!("Status file is corrupt, starting over: {}", reason);
                self.metrics.incr(FAILED_STATUS_FILE, vec![]);
                match self.store.quarantine().await {
                    Ok(path) => warn!("Moved corrupt status file to {}", path.display()),
                    Err(e) => error!("Failed to move corrupt status file aside: {}", e),
                }
                Envs::new()
            }
            Err(e) => {
                error!("Failed to load status file: {}", e);
                self.metrics.incr(FAILED_STATUS_FILE, vec![]);
                Envs::new()
            }
        };

        if self.envs.is_empty() {
            self.first_run = true;
        }
        self.current = self.envs.keys().next().cloned();
        if let Some(status) = self.current.as_ref().and_then(|name| self.envs.get(name)) {
            self.config.update_variables(status);
        }
    }

    /// Apply a step outcome to the current environment and persist all
    /// environments. A failed write is reported to the server as an agent
    /// failure.
    async fn update_ping_reports(&mut self, report: &DeployReport) {
        if let Some(status) = self.current_status_mut() {
            status.update_by_deploy_report(report);
        }

        if !self.store.dump_envs(&self.envs).await {
            if let Some(status) = self.current_status_mut() {
                status.update_by_deploy_report(&DeployReport {
                    status_code: AgentStatus::AgentFailed,
                    error_code: 1,
                    output_msg: Some("Failed to dump status to the disk".to_string()),
                    retry_times: 0,
                });
            }
        }
    }

    /// Report a step outcome and fetch the next goal
    async fn update_deploy_status(&mut self, report: &DeployReport) -> PingStatus {
        self.update_ping_reports(report).await;

        let Some(response) = self.client.send_reports(&self.envs).await else {
            // keep the previous response
            info!("Failed to get response from server");
            return PingStatus::PingFailed;
        };

        let changed = plan_changed(self.response.as_ref(), Some(&response));
        self.response = Some(response.clone());

        let merged = self.update_internal_deploy_goal(&response).await;
        if merged.status_code != AgentStatus::Succeeded {
            self.update_ping_reports(&merged).await;
            self.response = self.client.send_reports(&self.envs).await;
            return PingStatus::PlanChanged;
        }

        if changed {
            PingStatus::PlanChanged
        } else {
            PingStatus::PlanNoChange
        }
    }

    /// Merge the goal of a response into the tracked environments and make
    /// its environment the current one
    async fn update_internal_deploy_goal(&mut self, response: &PingResponse) -> DeployReport {
        match self.merge_goal(response).await {
            Ok(()) => DeployReport::succeeded(),
            Err(e) => {
                error!("Failed to update the deploy goal: {}", e);
                DeployReport::agent_failed(e.to_string())
            }
        }
    }

    async fn merge_goal(&mut self, response: &PingResponse) -> Result<(), AgentError> {
        let Some(goal) = response.deploy_goal.as_ref() else {
            debug!("No deploy goal to be updated");
            self.record_stage_elapsed();
            return Ok(());
        };

        let env_name = if !goal.env_name.is_empty() {
            goal.env_name.clone()
        } else if response.op_code.is_removal() {
            match self.resolve_deleted_env_name(&goal.env_name, &goal.env_id) {
                Some(name) => name,
                None => {
                    info!("Environment {} is no longer tracked", goal.env_id);
                    return Ok(());
                }
            }
        } else {
            return Err(AgentError::DeployError(format!(
                "Deploy goal {} has no environment name",
                goal.deploy_id
            )));
        };

        let status = self.envs.entry(env_name.clone()).or_default();
        status.update_by_response(response);
        status.report.env_name = env_name.clone();

        self.write_script_config(&env_name, goal).await?;

        if self.stage_timer.as_ref().map(|timer| &timer.goal) != Some(goal) {
            self.record_stage_elapsed();
            self.stage_timer = Some(StageTimer {
                goal: goal.clone(),
                started: Instant::now(),
            });
        }

        self.current = Some(env_name.clone());
        if let Some(status) = self.envs.get(&env_name) {
            self.config.update_variables(status);
        }
        info!("Current deploy goal is: {:?}", goal);
        Ok(())
    }

    /// Variables for template substitution, one `key=value` per line
    async fn write_script_config(
        &self,
        env_name: &str,
        goal: &DeployGoal,
    ) -> Result<(), AgentError> {
        let file = self.config.layout().script_config_file(env_name);
        match goal.script_variables.as_ref().filter(|vars| !vars.is_empty()) {
            Some(vars) => {
                info!("Generating script variables for deploy {}", goal.deploy_id);
                let contents: String = vars
                    .iter()
                    .map(|(key, value)| format!("{}={}\n", key, value))
                    .collect();
                file.write_string(&contents).await
            }
            None => {
                if file.exists().await {
                    match file.delete().await {
                        Ok(()) => info!(
                            "Removed script config file {}, no script variables",
                            file.path().display()
                        ),
                        Err(e) => warn!(
                            "Failed to remove script config file {}: {}",
                            file.path().display(),
                            e
                        ),
                    }
                }
                Ok(())
            }
        }
    }

    /// Name of the environment a removal goal refers to. The server may send
    /// an empty name once the environment is gone, leaving only its id.
    fn resolve_deleted_env_name(&self, env_name: &str, env_id: &str) -> Option<String> {
        if !env_name.is_empty() {
            return Some(env_name.to_string());
        }
        self.envs
            .iter()
            .find(|(_, status)| status.report.env_id == env_id)
            .map(|(name, _)| name.clone())
    }

    fn goal_tags(&self, goal: &DeployGoal) -> Tags {
        let mut tags: Tags = vec![("first_run", self.first_run.to_string())];
        tags.push(("deploy_stage", goal.deploy_stage.to_string()));
        if !goal.env_name.is_empty() {
            tags.push(("env_name", goal.env_name.clone()));
        }
        if !goal.stage_name.is_empty() {
            tags.push(("stage_name", goal.stage_name.clone()));
        }
        tags
    }

    fn record_stage_elapsed(&self) {
        if let Some(timer) = self.stage_timer.as_ref() {
            self.metrics.timing(
                STAGE_TIME_ELAPSED,
                timer.started.elapsed(),
                self.goal_tags(&timer.goal),
            );
        }
    }

    fn send_deploy_status_stats(&self, report: &DeployReport) {
        let Some(goal) = self.response.as_ref().and_then(|r| r.deploy_goal.as_ref()) else {
            return;
        };
        let mut tags = self.goal_tags(goal);
        tags.push(("status_code", report.status_code.to_string()));
        self.metrics.incr(DEPLOY_STATUS_SUM, tags);
    }

    /// Artifact and commit of every environment serving its build
    fn send_deploy_info_stats(&self) {
        for (env_name, status) in &self.envs {
            if status.report.deploy_stage != DeployStage::ServingBuild {
                debug!(
                    "Skip deploy info metric for {} in stage {}",
                    env_name, status.report.deploy_stage
                );
                continue;
            }
            let build = status.build_info.as_ref();
            let (Some(artifact), Some(commit)) = (
                build.and_then(|b| b.build_name.clone()).filter(|n| !n.is_empty()),
                build.and_then(|b| b.build_commit.clone()).filter(|c| !c.is_empty()),
            ) else {
                debug!("Skip deploy info metric for {}, build is incomplete", env_name);
                continue;
            };
            self.metrics.incr(
                DEPLOY_INFO,
                vec![
                    ("source", "deployd".to_string()),
                    ("artifact", artifact),
                    ("commit_sha", commit),
                ],
            );
        }
    }
}

#[async_trait]
impl Heartbeat for AgentState {
    async fn beat(&mut self, report: &DeployReport) -> PingStatus {
        self.update_deploy_status(report).await
    }
}

/// Top-level deploy controller
pub struct DeployAgent {
    executor: Box<dyn StageExecutor>,
    helper: Box<dyn BuildHelper>,
    state: AgentState,
}

impl DeployAgent {
    /// Create the agent and resume tracking from the status file
    pub async fn new(
        client: Box<dyn PingClient>,
        store: EnvStatus,
        config: Config,
        executor: Box<dyn StageExecutor>,
        helper: Box<dyn BuildHelper>,
        metrics: Metrics,
    ) -> Self {
        let mut agent = Self {
            executor,
            helper,
            state: AgentState {
                client,
                store,
                config,
                envs: Envs::new(),
                current: None,
                response: None,
                first_run: false,
                metrics,
                stage_timer: None,
            },
        };
        agent.load_status_file().await;
        agent
    }

    pub fn envs(&self) -> &Envs {
        &self.state.envs
    }

    /// Name of the environment the agent currently works on
    pub fn current_env(&self) -> Option<&str> {
        self.state.current.as_deref()
    }

    /// Last response received from the server
    pub fn response(&self) -> Option<&PingResponse> {
        self.state.response.as_ref()
    }

    /// True when no status existed at some point during this process' life
    pub fn first_run(&self) -> bool {
        self.state.first_run
    }

    pub fn config(&self) -> &Config {
        &self.state.config
    }

    pub async fn load_status_file(&mut self) {
        self.state.load_status_file().await;
        self.executor.update_configs(&self.state.config);
    }

    /// Run one convergence cycle against the server
    pub async fn serve_build(&mut self) {
        info!("The deploy agent is starting");

        let response = self.state.client.send_reports(&self.state.envs).await;
        self.state.response = response.clone();

        if let Some(response) = response.as_ref() {
            let report = self.state.update_internal_deploy_goal(response).await;
            if report.status_code != AgentStatus::Succeeded {
                self.state.update_ping_reports(&report).await;
                self.state.client.send_reports(&self.state.envs).await;
                return;
            }
        }

        loop {
            let response = match self.state.response.clone() {
                Some(response) if response.is_actionable() => response,
                _ => break,
            };

            let report = if response.deploy_goal.is_some() {
                match self.process_deploy(&response).await {
                    Ok(report) => report,
                    Err(e) => {
                        error!("Failed to process the deploy goal: {}", e);
                        DeployReport::agent_failed(e.to_string())
                    }
                }
            } else {
                info!("No new deploy goal to get updated");
                DeployReport::succeeded()
            };

            if report.status_code == AgentStatus::AbortedByServer {
                info!(
                    "Switching to the new deploy goal: {:?}",
                    self.state.response.as_ref().and_then(|r| r.deploy_goal.as_ref())
                );
                continue;
            }

            self.state.send_deploy_status_stats(&report);

            if self.state.update_deploy_status(&report).await == PingStatus::PingFailed {
                return;
            }

            if report.status_code.is_terminal() {
                error!(
                    "Unexpected failure: {}, error message {}",
                    report.status_code,
                    report.output_msg.as_deref().unwrap_or_default()
                );
                return;
            }
        }

        self.clean_stale_builds().await;

        if let Some(response) = self.state.response.clone() {
            if response.deploy_goal.is_some() {
                self.state.update_internal_deploy_goal(&response).await;
            }
            info!("Completed the current deploy with response: {:?}", response);
        } else {
            info!("Failed to get response from server, exit");
        }

        self.state.send_deploy_info_stats();
    }

    /// Execute the goal of a response
    pub async fn process_deploy(
        &mut self,
        response: &PingResponse,
    ) -> Result<DeployReport, AgentError> {
        let goal = response
            .deploy_goal
            .as_ref()
            .ok_or_else(|| AgentError::DeployError("Response carries no deploy goal".to_string()))?;

        if response.op_code.is_removal() {
            let env_name = self
                .state
                .resolve_deleted_env_name(&goal.env_name, &goal.env_id)
                .unwrap_or_else(|| goal.env_name.clone());
            if self.state.envs.remove(&env_name).is_none() {
                info!("Cannot find env {} in the ping report", env_name);
            }
            if self.state.current.as_deref() == Some(env_name.as_str()) {
                self.state.current = None;
            }
            return Ok(DeployReport {
                status_code: AgentStatus::Succeeded,
                retry_times: 1,
                ..Default::default()
            });
        }

        self.executor.update_configs(&self.state.config);

        let stage = goal.deploy_stage;
        info!("The current deploy stage is: {}", stage);
        let report = match stage {
            DeployStage::Downloading => {
                let cmd = self.download_command(goal)?;
                self.executor.run_cmd(&cmd, &mut self.state).await
            }
            DeployStage::Staging => {
                info!("Setting up symlink for the package: {}", goal.deploy_id);
                let cmd = self.staging_command()?;
                self.executor.run_cmd(&cmd, &mut self.state).await
            }
            _ => self.executor.execute_command(stage, &mut self.state).await,
        };
        Ok(report)
    }

    fn current_env_name(&self) -> Result<String, AgentError> {
        self.state
            .current_status()
            .map(|status| status.env_name().to_string())
            .ok_or_else(|| AgentError::DeployError("No current environment".to_string()))
    }

    fn helper_command(&self, program: &str) -> StepCommand {
        let cmd = StepCommand::new(program);
        match self.state.config.config_file() {
            Some(file) => cmd.arg("-f").arg(file.display().to_string()),
            None => cmd,
        }
    }

    /// Command line of the reserved DOWNLOADING stage
    pub fn download_command(&self, goal: &DeployGoal) -> Result<StepCommand, AgentError> {
        let url = goal.artifact_url().ok_or_else(|| {
            AgentError::DeployError("Cannot find build or build url in the deploy goal".to_string())
        })?;
        let build_id = goal
            .build
            .as_ref()
            .and_then(|build| build.build_id.clone())
            .unwrap_or_default();

        Ok(self
            .helper_command(DOWNLOADER)
            .arg("-v")
            .arg(build_id)
            .arg("-u")
            .arg(url)
            .arg("-e")
            .arg(self.current_env_name()?))
    }

    /// Command line of the reserved STAGING stage
    pub fn staging_command(&self) -> Result<StepCommand, AgentError> {
        let build_id = self
            .state
            .current_status()
            .and_then(|status| status.build_info.as_ref())
            .and_then(|build| build.build_id.clone())
            .ok_or_else(|| AgentError::DeployError("Cannot find build id to stage".to_string()))?;

        Ok(self
            .helper_command(STAGER)
            .arg("-v")
            .arg(build_id)
            .arg("-t")
            .arg(self.state.config.target().display().to_string())
            .arg("-e")
            .arg(self.current_env_name()?))
    }

    /// Report a step outcome and fetch the next goal
    pub async fn update_deploy_status(&mut self, report: &DeployReport) -> PingStatus {
        self.state.update_deploy_status(report).await
    }

    /// Remove builds no tracked environment refers to, beyond the newest few
    async fn clean_stale_builds(&self) {
        if self.state.envs.is_empty() {
            return;
        }
        let Some(current) = self.state.current_status() else {
            return;
        };

        let keep: Vec<String> = self
            .state
            .envs
            .values()
            .filter_map(|status| status.build_info.as_ref()?.build_id.clone())
            .collect();
        if keep.is_empty() {
            return;
        }

        let env_name = current.env_name().to_string();
        let builds_dir = self.state.config.builds_dir().to_path_buf();
        let retain = self.state.config.num_builds_to_retain();

        let available = self.helper.builds_available_locally(&builds_dir).await;
        for build in self.helper.get_stale_builds(available, retain) {
            if !keep.contains(&build) {
                info!("Stale build {} found in {}, removing", build, builds_dir.display());
                self.helper.clean_package(&builds_dir, &build, &env_name).await;
            }
        }
    }
}
