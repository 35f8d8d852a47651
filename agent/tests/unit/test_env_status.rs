//! Status file tests

use deployd::filesys::file::File;
use deployd::models::deploy_status::{DeployStatus, Envs};
use deployd::models::status::{AgentStatus, DeployStage, OpCode};
use deployd::storage::env_status::EnvStatus;

#[tokio::test]
async fn test_dump_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let store = EnvStatus::new(File::new(dir.path().join("env_status")));

    let mut status = DeployStatus::default();
    status.report.env_name = "web".to_string();
    status.report.deploy_stage = DeployStage::Staging;
    status.report.status = AgentStatus::ScriptFailed;
    status.report.error_message = Some("exit 2".to_string());
    status.op_code = OpCode::Deploy;
    let mut envs = Envs::new();
    envs.insert("web".to_string(), status);

    assert!(store.dump_envs(&envs).await);
    assert_eq!(store.load_envs().await.unwrap(), envs);

    // keyed by env name, camelCase report
    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("env_status")).unwrap())
            .unwrap();
    assert_eq!(raw["web"]["report"]["deployStage"], "STAGING");
    assert_eq!(raw["web"]["op_code"], "DEPLOY");
    assert!(!dir.path().join("env_status.tmp").exists());
}

#[tokio::test]
async fn test_load_legacy_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("env_status");
    std::fs::write(
        &path,
        r#"{
            "web": {
                "report": {
                    "deployId": "d-1",
                    "envId": "e-1",
                    "envName": "web",
                    "stageName": "prod",
                    "deployStage": "SERVING_BUILD",
                    "status": "SUCCEEDED",
                    "errorCode": 0,
                    "failCount": 0
                },
                "build_info": {"build_id": "b-1", "build_name": "web"},
                "runtime_config": {"max_retry": "5"},
                "op_code": 4,
                "script_variables": {"PORT": "8080"}
            }
        }"#,
    )
    .unwrap();

    let envs = EnvStatus::new(File::new(&path)).load_envs().await.unwrap();
    let status = &envs["web"];
    assert_eq!(status.op_code, OpCode::Delete);
    assert_eq!(status.report.deploy_stage, DeployStage::ServingBuild);
    assert_eq!(
        status.script_variables.as_ref().unwrap().get("PORT").map(String::as_str),
        Some("8080")
    );
}

#[tokio::test]
async fn test_empty_map_is_written() {
    let dir = tempfile::tempdir().unwrap();
    let store = EnvStatus::new(File::new(dir.path().join("state").join("env_status")));

    assert!(store.dump_envs(&Envs::new()).await);
    assert!(store.load_envs().await.unwrap().is_empty());
    assert!(dir.path().join("state").join("env_status.lock").exists());
}
