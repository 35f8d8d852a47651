//! Per-environment status reports

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::status::{AgentStatus, DeployStage};

/// Outbound status of one environment, sent with every ping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PingReport {
    pub deploy_id: String,
    pub env_id: String,
    pub env_name: String,
    pub stage_name: String,
    pub deploy_stage: DeployStage,
    pub status: AgentStatus,
    pub error_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub fail_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy_alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_info: Option<BTreeMap<String, String>>,
}

impl PingReport {
    /// Copy of the report with a server-safe (ASCII only) error message
    pub fn sanitized(&self) -> Self {
        let mut report = self.clone();
        if let Some(message) = report.error_message.as_mut() {
            message.retain(|c| c.is_ascii());
        }
        report
    }
}

/// Outcome of one executed step. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployReport {
    pub status_code: AgentStatus,
    pub error_code: i32,
    pub output_msg: Option<String>,
    pub retry_times: u32,
}

impl DeployReport {
    pub fn new(status_code: AgentStatus) -> Self {
        Self {
            status_code,
            ..Default::default()
        }
    }

    pub fn succeeded() -> Self {
        Self::new(AgentStatus::Succeeded)
    }

    /// Agent-side failure, reported with error code 1 and a single attempt
    pub fn agent_failed(message: impl Into<String>) -> Self {
        Self {
            status_code: AgentStatus::AgentFailed,
            error_code: 1,
            output_msg: Some(message.into()),
            retry_times: 1,
        }
    }
}
