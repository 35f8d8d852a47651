//! Environment handed to deploy step processes

use std::collections::BTreeMap;
use std::path::Path;

use crate::models::deploy_status::DeployStatus;
use crate::models::status::{DeployStage, DeployType};

/// Variables exported to every process spawned for the current step.
///
/// Built from the active environment's status and passed straight to the
/// spawn call; the agent's own process environment is never modified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepContext {
    env_name: Option<String>,
    deploy_stage: DeployStage,
    vars: BTreeMap<String, String>,
}

impl StepContext {
    pub fn new(status: &DeployStatus, target: &Path, builds_dir: &Path) -> Self {
        let report = &status.report;
        let mut vars = BTreeMap::new();

        vars.insert("DEPLOY_ID".to_string(), report.deploy_id.clone());
        vars.insert(
            "DEPLOY_STEP".to_string(),
            report.deploy_stage.as_str().to_string(),
        );
        vars.insert("OPCODE".to_string(), status.op_code.as_str().to_string());
        vars.insert(
            "DEPLOY_TYPE".to_string(),
            DeployType::from_op_code(status.op_code).as_str().to_string(),
        );

        if !report.env_name.is_empty() {
            vars.insert("ENV_NAME".to_string(), report.env_name.clone());
        }
        if !report.stage_name.is_empty() {
            vars.insert("STAGE_NAME".to_string(), report.stage_name.clone());
        }
        // scripts compare against the capitalized literal
        if status.first_deploy == Some(true) {
            vars.insert("FIRST_DEPLOY".to_string(), "True".to_string());
        }
        if status.is_docker == Some(true) {
            vars.insert("IS_DOCKER".to_string(), "True".to_string());
        }
        vars.insert("TARGET".to_string(), target.display().to_string());

        if let Some(script_vars) = status.script_variables.as_ref() {
            for (key, value) in script_vars {
                vars.insert(key.clone(), value.clone());
            }
        }

        if let Some(build) = status.build_info.as_ref() {
            let fields = [
                ("BUILD_COMMIT", &build.build_commit),
                ("BUILD_NAME", &build.build_name),
                ("BUILD_REPO", &build.build_repo),
                ("BUILD_BRANCH", &build.build_branch),
                ("BUILD_ID", &build.build_id),
                ("BUILD_URL", &build.build_url),
            ];
            for (key, value) in fields {
                if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
                    vars.insert(key.to_string(), value.clone());
                }
            }
        }

        vars.insert("BUILDS_DIR".to_string(), builds_dir.display().to_string());

        Self {
            env_name: Some(report.env_name.clone()).filter(|name| !name.is_empty()),
            deploy_stage: report.deploy_stage,
            vars,
        }
    }

    pub fn env_name(&self) -> Option<&str> {
        self.env_name.as_deref()
    }

    pub fn deploy_stage(&self) -> DeployStage {
        self.deploy_stage
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }
}
