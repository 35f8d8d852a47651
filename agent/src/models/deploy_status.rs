//! Per-environment deploy status tracked by the agent

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::goal::Build;
use crate::models::ping::PingResponse;
use crate::models::report::{DeployReport, PingReport};
use crate::models::status::{AgentStatus, OpCode};

/// Tracked environments keyed by environment name
pub type Envs = BTreeMap<String, DeployStatus>;

/// Build currently targeted by an environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildInfo {
    pub build_commit: Option<String>,
    pub build_url: Option<String>,
    pub build_id: Option<String>,
    pub build_name: Option<String>,
    pub build_repo: Option<String>,
    pub build_branch: Option<String>,
}

impl From<&Build> for BuildInfo {
    fn from(build: &Build) -> Self {
        Self {
            build_commit: build.scm_commit.clone(),
            build_url: build.artifact_url.clone(),
            build_id: build.build_id.clone(),
            build_name: build.build_name.clone(),
            build_repo: build.scm_repo.clone(),
            build_branch: build.scm_branch.clone(),
        }
    }
}

/// Deploy status of one environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployStatus {
    pub report: PingReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_info: Option<BuildInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_config: Option<BTreeMap<String, String>>,
    pub op_code: OpCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_variables: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_deploy: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_docker: Option<bool>,
}

impl DeployStatus {
    pub fn env_name(&self) -> &str {
        &self.report.env_name
    }

    /// Apply a new server goal. The report status resets to `UNKNOWN`
    /// until the new stage has been executed.
    pub fn update_by_response(&mut self, response: &PingResponse) {
        self.op_code = response.op_code;
        let Some(goal) = response.deploy_goal.as_ref() else {
            return;
        };

        self.report.env_id = goal.env_id.clone();
        self.report.deploy_id = goal.deploy_id.clone();
        self.report.deploy_stage = goal.deploy_stage;
        self.report.deploy_alias = goal.deploy_alias.clone();
        self.report.env_name = goal.env_name.clone();
        self.report.stage_name = goal.stage_name.clone();
        self.report.status = AgentStatus::Unknown;
        self.first_deploy = goal.first_deploy;
        self.is_docker = goal.is_docker;

        if let Some(build) = goal.build.as_ref() {
            self.build_info = Some(BuildInfo::from(build));
        }
        if let Some(vars) = goal.script_variables.as_ref() {
            self.script_variables = Some(vars.clone());
        }
        if let Some(config) = goal.runtime_config.as_ref() {
            self.runtime_config = Some(config.clone());
        }
    }

    /// Apply the outcome of a locally executed step
    pub fn update_by_deploy_report(&mut self, deploy_report: &DeployReport) {
        // a superseded step is neither success nor failure
        self.report.status = match deploy_report.status_code {
            AgentStatus::AbortedByServer => AgentStatus::Unknown,
            status => status,
        };
        self.report.error_code = deploy_report.error_code;
        self.report.error_message = if self.report.status != AgentStatus::Succeeded {
            deploy_report.output_msg.clone()
        } else {
            None
        };
        self.report.fail_count = deploy_report.retry_times;
    }
}
