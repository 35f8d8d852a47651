//! Deploy agent convergence tests

use std::path::Path;
use std::time::{Duration, SystemTime};

use deployd::deploy::agent::{DOWNLOADER, STAGER};
use deployd::deploy::executor::StepCommand;
use deployd::models::deploy_status::{BuildInfo, DeployStatus, Envs};
use deployd::models::ping::PingResponse;
use deployd::models::report::DeployReport;
use deployd::models::status::{AgentStatus, DeployStage, OpCode, PingStatus};
use deployd::storage::env_status::EnvStatus;
use deployd::storage::layout::StorageLayout;
use deployd::telemetry::{Metrics, DEPLOY_INFO, FAILED_STATUS_FILE};

use crate::fakes::{
    agent_in, deploy, goal, settings_in, Call, FakeExecutor, FakeHelper, FakePingClient,
};

fn tracked(env_name: &str, env_id: &str, build_id: &str) -> DeployStatus {
    let mut status = DeployStatus::default();
    status.report.env_name = env_name.to_string();
    status.report.env_id = env_id.to_string();
    status.report.deploy_stage = DeployStage::ServingBuild;
    status.report.status = AgentStatus::Succeeded;
    status.op_code = OpCode::Deploy;
    status.build_info = Some(BuildInfo {
        build_id: Some(build_id.to_string()),
        ..Default::default()
    });
    status
}

async fn seed(dir: &Path, statuses: Vec<DeployStatus>) {
    let layout = StorageLayout::new(settings_in(dir).agent_dir);
    let envs: Envs = statuses
        .into_iter()
        .map(|status| (status.env_name().to_string(), status))
        .collect();
    assert!(EnvStatus::new(layout.env_status_file()).dump_envs(&envs).await);
}

async fn stored(dir: &Path) -> Envs {
    let layout = StorageLayout::new(settings_in(dir).agent_dir);
    EnvStatus::new(layout.env_status_file()).load_envs().await.unwrap()
}

fn removal(op_code: OpCode, env_name: &str, env_id: &str) -> PingResponse {
    let mut goal = goal(env_name, "d-1", DeployStage::Unknown);
    goal.env_id = env_id.to_string();
    PingResponse {
        op_code,
        deploy_goal: Some(goal),
    }
}

#[tokio::test]
async fn test_full_pipeline_then_delete() {
    let dir = tempfile::tempdir().unwrap();
    let client = FakePingClient::new(vec![
        Some(deploy("web", DeployStage::PreDownload)),
        Some(deploy("web", DeployStage::Downloading)),
        Some(deploy("web", DeployStage::Staging)),
        Some(deploy("web", DeployStage::PreRestart)),
        Some(removal(OpCode::Delete, "web", "web-id")),
    ]);
    let executor = FakeExecutor::new();
    let mut agent = agent_in(
        dir.path(),
        client.clone(),
        executor.clone(),
        FakeHelper::default(),
        Metrics::new(),
    )
    .await;
    assert!(agent.first_run());

    agent.serve_build().await;

    let target = dir.path().join("targets").join("web");
    assert_eq!(
        executor.calls(),
        vec![
            Call::Execute(DeployStage::PreDownload),
            Call::Run(
                StepCommand::new(DOWNLOADER)
                    .arg("-v")
                    .arg("b-1")
                    .arg("-u")
                    .arg("https://artifacts/web-b-1.tar.gz")
                    .arg("-e")
                    .arg("web")
            ),
            Call::Run(
                StepCommand::new(STAGER)
                    .arg("-v")
                    .arg("b-1")
                    .arg("-t")
                    .arg(target.display().to_string())
                    .arg("-e")
                    .arg("web")
            ),
            Call::Execute(DeployStage::PreRestart),
        ]
    );

    assert!(agent.envs().is_empty());
    assert_eq!(agent.current_env(), None);
    assert!(stored(dir.path()).await.is_empty());
    assert_eq!(
        executor.configured_for.lock().unwrap().last(),
        Some(&dir.path().join("logs").join("web.log"))
    );

    // first ping carries nothing, later pings report the finished steps
    let sent = client.sent();
    assert!(sent[0].is_empty());
    let after_pre_restart = &sent[4]["web"];
    assert_eq!(after_pre_restart.report.deploy_stage, DeployStage::PreRestart);
    assert_eq!(after_pre_restart.report.status, AgentStatus::Succeeded);
}

#[tokio::test]
async fn test_update_deploy_status_plan_change() {
    let dir = tempfile::tempdir().unwrap();
    let response = deploy("web", DeployStage::PreDownload);
    let client = FakePingClient::new(vec![Some(response.clone()), Some(response.clone()), None]);
    let mut agent = agent_in(
        dir.path(),
        client,
        FakeExecutor::new(),
        FakeHelper::default(),
        Metrics::new(),
    )
    .await;

    let report = DeployReport::succeeded();
    assert_eq!(agent.update_deploy_status(&report).await, PingStatus::PlanChanged);
    assert_eq!(agent.current_env(), Some("web"));
    assert_eq!(agent.update_deploy_status(&report).await, PingStatus::PlanNoChange);
    assert_eq!(agent.update_deploy_status(&report).await, PingStatus::PingFailed);

    // previous response survives a failed ping
    assert_eq!(agent.response(), Some(&response));
}

#[tokio::test]
async fn test_terminal_status_stops_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let client = FakePingClient::new(vec![
        Some(deploy("web", DeployStage::PreRestart)),
        Some(deploy("web", DeployStage::PreRestart)),
    ]);
    let executor = FakeExecutor::new().with_reports(vec![DeployReport {
        status_code: AgentStatus::TooManyRetry,
        error_code: 1,
        output_msg: Some("exit 1".to_string()),
        retry_times: 3,
    }]);
    let mut agent = agent_in(
        dir.path(),
        client.clone(),
        executor.clone(),
        FakeHelper::default(),
        Metrics::new(),
    )
    .await;

    agent.serve_build().await;

    assert_eq!(executor.calls(), vec![Call::Execute(DeployStage::PreRestart)]);
    assert_eq!(client.sent().len(), 2);

    let status = &stored(dir.path()).await["web"];
    assert_eq!(status.report.status, AgentStatus::TooManyRetry);
    assert_eq!(status.report.fail_count, 3);
    assert_eq!(status.report.error_message.as_deref(), Some("exit 1"));
}

#[tokio::test]
async fn test_delete_untracked_env() {
    let dir = tempfile::tempdir().unwrap();
    let mut agent = agent_in(
        dir.path(),
        FakePingClient::default(),
        FakeExecutor::new(),
        FakeHelper::default(),
        Metrics::new(),
    )
    .await;

    let report = agent
        .process_deploy(&removal(OpCode::Delete, "ghost", "ghost-id"))
        .await
        .unwrap();
    assert_eq!(report.status_code, AgentStatus::Succeeded);
    assert_eq!(report.retry_times, 1);
    assert!(agent.envs().is_empty());
}

#[tokio::test]
async fn test_terminate_without_env_name_resolves_by_id() {
    let dir = tempfile::tempdir().unwrap();
    seed(
        dir.path(),
        vec![tracked("api", "api-id", "b-0"), tracked("web", "web-id", "b-1")],
    )
    .await;
    let client = FakePingClient::new(vec![Some(removal(OpCode::Terminate, "", "web-id"))]);
    let executor = FakeExecutor::new();
    let mut agent = agent_in(
        dir.path(),
        client,
        executor.clone(),
        FakeHelper::default(),
        Metrics::new(),
    )
    .await;

    agent.serve_build().await;

    assert!(executor.calls().is_empty());
    assert_eq!(agent.envs().keys().collect::<Vec<_>>(), vec!["api"]);
    assert!(!stored(dir.path()).await.contains_key("web"));
}

#[tokio::test]
async fn test_goal_without_env_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let client = FakePingClient::new(vec![Some(deploy("", DeployStage::PreDownload))]);
    let executor = FakeExecutor::new();
    let mut agent = agent_in(
        dir.path(),
        client.clone(),
        executor.clone(),
        FakeHelper::default(),
        Metrics::new(),
    )
    .await;

    agent.serve_build().await;

    // reported back once, nothing executed
    assert!(executor.calls().is_empty());
    assert_eq!(client.sent().len(), 2);
    assert!(agent.envs().is_empty());
}

#[tokio::test]
async fn test_corrupt_status_file_is_quarantined() {
    let dir = tempfile::tempdir().unwrap();
    let status_file = dir.path().join("agent").join("env_status");
    std::fs::create_dir_all(status_file.parent().unwrap()).unwrap();
    std::fs::write(&status_file, "{not json").unwrap();

    let metrics = Metrics::new();
    let agent = agent_in(
        dir.path(),
        FakePingClient::default(),
        FakeExecutor::new(),
        FakeHelper::default(),
        metrics.clone(),
    )
    .await;

    assert!(agent.envs().is_empty());
    assert!(agent.first_run());
    assert!(!status_file.exists());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("agent").join("env_status.corrupt")).unwrap(),
        "{not json"
    );
    assert_eq!(metrics.count(FAILED_STATUS_FILE), 1);
}

#[tokio::test]
async fn test_resume_from_status_file() {
    let dir = tempfile::tempdir().unwrap();
    seed(
        dir.path(),
        vec![tracked("web", "web-id", "b-1"), tracked("api", "api-id", "b-0")],
    )
    .await;

    let agent = agent_in(
        dir.path(),
        FakePingClient::default(),
        FakeExecutor::new(),
        FakeHelper::default(),
        Metrics::new(),
    )
    .await;

    assert!(!agent.first_run());
    assert_eq!(agent.envs().len(), 2);
    assert_eq!(agent.current_env(), Some("api"));
    assert_eq!(agent.config().env_name(), Some("api"));
}

#[tokio::test]
async fn test_script_config_follows_goal() {
    let dir = tempfile::tempdir().unwrap();
    let mut with_vars = deploy("web", DeployStage::PreRestart);
    if let Some(goal) = with_vars.deploy_goal.as_mut() {
        goal.script_variables = Some(
            [("B", "2"), ("A", "1")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }
    let without_vars = deploy("web", DeployStage::PreRestart);
    let client = FakePingClient::new(vec![Some(with_vars), Some(without_vars)]);
    let mut agent = agent_in(
        dir.path(),
        client,
        FakeExecutor::new(),
        FakeHelper::default(),
        Metrics::new(),
    )
    .await;

    let script_config = dir.path().join("agent").join("web_SCRIPT_CONFIG");
    agent.update_deploy_status(&DeployReport::succeeded()).await;
    assert_eq!(std::fs::read_to_string(&script_config).unwrap(), "A=1\nB=2\n");
    assert_eq!(agent.config().step_context().get("A"), Some("1"));

    agent.update_deploy_status(&DeployReport::succeeded()).await;
    assert!(!script_config.exists());
}

#[tokio::test]
async fn test_downloading_without_artifact_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut response = deploy("web", DeployStage::Downloading);
    if let Some(build) = response.deploy_goal.as_mut().and_then(|g| g.build.as_mut()) {
        build.artifact_url = None;
    }
    let client = FakePingClient::new(vec![Some(response.clone()), Some(response)]);
    let executor = FakeExecutor::new();
    let mut agent = agent_in(
        dir.path(),
        client.clone(),
        executor.clone(),
        FakeHelper::default(),
        Metrics::new(),
    )
    .await;

    agent.serve_build().await;

    assert!(executor.calls().is_empty());
    assert_eq!(client.sent().len(), 2);
    let report = &client.sent()[1]["web"].report;
    assert_eq!(report.status, AgentStatus::AgentFailed);
    assert!(report
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("build url"));
}

#[tokio::test]
async fn test_stale_builds_are_cleaned() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path(), vec![tracked("api", "api-id", "b1")]).await;

    let at = |secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
    let helper = FakeHelper::new(vec![
        ("b2".to_string(), at(40)),
        ("b0".to_string(), at(10)),
        ("b-1".to_string(), at(30)),
        ("b1".to_string(), at(20)),
    ]);
    let client = FakePingClient::new(vec![Some(deploy("web", DeployStage::ServingBuild))]);
    let mut agent = agent_in(
        dir.path(),
        client,
        FakeExecutor::new(),
        helper.clone(),
        Metrics::new(),
    )
    .await;

    agent.serve_build().await;

    // b1 is stale but still tracked by api
    assert_eq!(helper.cleaned(), vec![("b0".to_string(), "web".to_string())]);
}

#[tokio::test]
async fn test_heartbeat_switches_to_new_goal() {
    let dir = tempfile::tempdir().unwrap();
    let client = FakePingClient::new(vec![
        Some(deploy("web", DeployStage::PreRestart)),
        Some(deploy("web", DeployStage::PostRestart)),
    ]);
    let executor = FakeExecutor::new().beating_once();
    let mut agent = agent_in(
        dir.path(),
        client,
        executor.clone(),
        FakeHelper::default(),
        Metrics::new(),
    )
    .await;

    agent.serve_build().await;

    assert_eq!(
        executor.calls(),
        vec![
            Call::Execute(DeployStage::PreRestart),
            Call::Execute(DeployStage::PostRestart),
        ]
    );
    let status = &agent.envs()["web"];
    assert_eq!(status.report.deploy_stage, DeployStage::PostRestart);
    assert_eq!(status.report.status, AgentStatus::Succeeded);
}

#[tokio::test]
async fn test_failed_status_write_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    // a directory where the temp file goes makes every write fail
    std::fs::create_dir_all(dir.path().join("agent").join("env_status.tmp").join("x")).unwrap();
    let client = FakePingClient::new(vec![
        Some(deploy("web", DeployStage::PreRestart)),
        Some(deploy("web", DeployStage::PreRestart)),
    ]);
    let mut agent = agent_in(
        dir.path(),
        client.clone(),
        FakeExecutor::new(),
        FakeHelper::default(),
        Metrics::new(),
    )
    .await;

    agent.serve_build().await;

    let report = &client.sent()[1]["web"].report;
    assert_eq!(report.status, AgentStatus::AgentFailed);
    assert_eq!(report.error_code, 1);
    assert_eq!(
        report.error_message.as_deref(),
        Some("Failed to dump status to the disk")
    );
    assert!(!dir.path().join("agent").join("env_status").exists());
}

#[tokio::test]
async fn test_deploy_info_for_serving_envs() {
    let dir = tempfile::tempdir().unwrap();
    let mut web = tracked("web", "web-id", "b-1");
    if let Some(build) = web.build_info.as_mut() {
        build.build_name = Some("web".to_string());
        build.build_commit = Some("abc123".to_string());
    }
    let mut worker = tracked("worker", "worker-id", "b-2");
    worker.report.deploy_stage = DeployStage::PreRestart;
    if let Some(build) = worker.build_info.as_mut() {
        build.build_name = Some("worker".to_string());
        build.build_commit = Some("def456".to_string());
    }
    // serving, but without a commit
    let api = tracked("api", "api-id", "b-0");
    seed(dir.path(), vec![web, worker, api]).await;

    let metrics = Metrics::new();
    let mut agent = agent_in(
        dir.path(),
        FakePingClient::default(),
        FakeExecutor::new(),
        FakeHelper::default(),
        metrics.clone(),
    )
    .await;

    agent.serve_build().await;

    assert_eq!(metrics.count(DEPLOY_INFO), 1);
}
