//! Deploy goal issued by the server

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::status::DeployStage;

/// Build descriptor as sent on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Build {
    pub build_id: Option<String>,
    pub build_name: Option<String>,
    pub artifact_url: Option<String>,
    pub scm_commit: Option<String>,
    pub scm_repo: Option<String>,
    pub scm_branch: Option<String>,
}

/// Server-issued snapshot naming the target build and pipeline stage
/// of one environment. Read-only once received.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeployGoal {
    pub deploy_id: String,
    pub env_id: String,
    pub env_name: String,
    pub stage_name: String,
    pub deploy_stage: DeployStage,
    pub build: Option<Build>,
    pub deploy_alias: Option<String>,
    pub script_variables: Option<BTreeMap<String, String>>,
    #[serde(rename = "agentConfigs", alias = "config")]
    pub runtime_config: Option<BTreeMap<String, String>>,
    pub first_deploy: Option<bool>,
    pub is_docker: Option<bool>,
}

impl DeployGoal {
    /// Artifact URL of the goal's build, if any
    pub fn artifact_url(&self) -> Option<&str> {
        self.build.as_ref()?.artifact_url.as_deref()
    }
}
