//! Scripted collaborators for driving the agent in tests

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;

use deployd::deploy::agent::DeployAgent;
use deployd::deploy::executor::{Heartbeat, StageExecutor, StepCommand};
use deployd::deploy::helper::BuildHelper;
use deployd::models::deploy_status::Envs;
use deployd::models::goal::{Build, DeployGoal};
use deployd::models::ping::PingResponse;
use deployd::models::report::DeployReport;
use deployd::models::status::{AgentStatus, DeployStage, OpCode, PingStatus};
use deployd::ping::client::PingClient;
use deployd::storage::config::Config;
use deployd::storage::env_status::EnvStatus;
use deployd::storage::settings::Settings;
use deployd::telemetry::Metrics;

pub fn settings_in(dir: &Path) -> Settings {
    Settings {
        agent_dir: dir.join("agent"),
        builds_dir: dir.join("builds"),
        log_dir: dir.join("logs"),
        target_default_dir: dir.join("targets"),
        ..Default::default()
    }
}

pub fn goal(env_name: &str, deploy_id: &str, stage: DeployStage) -> DeployGoal {
    DeployGoal {
        deploy_id: deploy_id.to_string(),
        env_id: format!("{}-id", env_name),
        env_name: env_name.to_string(),
        stage_name: "prod".to_string(),
        deploy_stage: stage,
        build: Some(Build {
            build_id: Some("b-1".to_string()),
            build_name: Some(env_name.to_string()),
            artifact_url: Some(format!("https://artifacts/{}-b-1.tar.gz", env_name)),
            scm_commit: Some("abc123".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn deploy(env_name: &str, stage: DeployStage) -> PingResponse {
    PingResponse {
        op_code: OpCode::Deploy,
        deploy_goal: Some(goal(env_name, "d-1", stage)),
    }
}

pub fn noop() -> PingResponse {
    PingResponse::default()
}

/// Ping client answering from a queue, NOOP once the queue runs dry
#[derive(Clone, Default)]
pub struct FakePingClient {
    responses: Arc<Mutex<VecDeque<Option<PingResponse>>>>,
    sent: Arc<Mutex<Vec<Envs>>>,
}

impl FakePingClient {
    pub fn new(responses: Vec<Option<PingResponse>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            sent: Arc::default(),
        }
    }

    pub fn sent(&self) -> Vec<Envs> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PingClient for FakePingClient {
    async fn send_reports(&self, envs: &Envs) -> Option<PingResponse> {
        self.sent.lock().unwrap().push(envs.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Some(noop()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Run(StepCommand),
    Execute(DeployStage),
}

/// Executor recording what it was asked to run
#[derive(Clone)]
pub struct FakeExecutor {
    calls: Arc<Mutex<Vec<Call>>>,
    reports: Arc<Mutex<VecDeque<DeployReport>>>,
    beat_first: Arc<Mutex<bool>>,
    pub configured_for: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self {
            calls: Arc::default(),
            reports: Arc::default(),
            beat_first: Arc::default(),
            configured_for: Arc::default(),
        }
    }

    /// Reports returned by the next calls, SUCCEEDED afterwards
    pub fn with_reports(self, reports: Vec<DeployReport>) -> Self {
        *self.reports.lock().unwrap() = reports.into();
        self
    }

    /// Heartbeat once during the first call, aborting on a plan change
    pub fn beating_once(self) -> Self {
        *self.beat_first.lock().unwrap() = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    async fn finish(&self, call: Call, heartbeat: &mut dyn Heartbeat) -> DeployReport {
        self.calls.lock().unwrap().push(call);

        let beat = std::mem::take(&mut *self.beat_first.lock().unwrap());
        if beat {
            let running = DeployReport::new(AgentStatus::Unknown);
            if heartbeat.beat(&running).await == PingStatus::PlanChanged {
                return DeployReport::new(AgentStatus::AbortedByServer);
            }
        }

        self.reports
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(DeployReport::succeeded)
    }
}

#[async_trait]
impl StageExecutor for FakeExecutor {
    fn update_configs(&mut self, config: &Config) {
        self.configured_for
            .lock()
            .unwrap()
            .push(config.executor_settings().log_file);
    }

    async fn run_cmd(&self, cmd: &StepCommand, heartbeat: &mut dyn Heartbeat) -> DeployReport {
        self.finish(Call::Run(cmd.clone()), heartbeat).await
    }

    async fn execute_command(
        &self,
        stage: DeployStage,
        heartbeat: &mut dyn Heartbeat,
    ) -> DeployReport {
        self.finish(Call::Execute(stage), heartbeat).await
    }
}

/// Helper with a fixed set of local builds
#[derive(Clone, Default)]
pub struct FakeHelper {
    builds: Vec<(String, SystemTime)>,
    cleaned: Arc<Mutex<Vec<(String, String)>>>,
}

impl FakeHelper {
    pub fn new(builds: Vec<(String, SystemTime)>) -> Self {
        Self {
            builds,
            cleaned: Arc::default(),
        }
    }

    /// `(build, build_name)` of every cleaned package
    pub fn cleaned(&self) -> Vec<(String, String)> {
        self.cleaned.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildHelper for FakeHelper {
    async fn builds_available_locally(&self, _builds_dir: &Path) -> Vec<(String, SystemTime)> {
        self.builds.clone()
    }

    async fn clean_package(&self, _builds_dir: &Path, build: &str, build_name: &str) {
        self.cleaned
            .lock()
            .unwrap()
            .push((build.to_string(), build_name.to_string()));
    }
}

/// Agent wired to fakes, with its state under `dir`
pub async fn agent_in(
    dir: &Path,
    client: FakePingClient,
    executor: FakeExecutor,
    helper: FakeHelper,
    metrics: Metrics,
) -> DeployAgent {
    let config = Config::new(settings_in(dir), None);
    let store = EnvStatus::new(config.layout().env_status_file());
    DeployAgent::new(
        Box::new(client),
        store,
        config,
        Box::new(executor),
        Box::new(helper),
        metrics,
    )
    .await
}
