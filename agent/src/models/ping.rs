//! Ping request and response exchanged with the deploy service

use serde::{Deserialize, Serialize};

use crate::models::goal::DeployGoal;
use crate::models::report::PingReport;
use crate::models::status::OpCode;

/// Host identity plus the current report of every tracked environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingRequest {
    pub host_id: String,
    pub host_name: String,
    pub host_ip: Option<String>,
    pub groups: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
    pub reports: Vec<PingReport>,
}

/// Next instruction from the server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    #[serde(default)]
    pub op_code: OpCode,
    #[serde(default)]
    pub deploy_goal: Option<DeployGoal>,
}

impl PingResponse {
    /// Whether the server has anything for the agent to do
    pub fn is_actionable(&self) -> bool {
        self.op_code != OpCode::Noop
    }
}
