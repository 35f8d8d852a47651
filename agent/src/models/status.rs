//! Status, stage and opcode enums shared by the wire protocol and the status file

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Outcome of executing a deploy step on the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Succeeded,
    #[default]
    Unknown,
    AgentFailed,
    RetryableAgentFailed,
    ScriptFailed,
    AbortedByService,
    ScriptTimeout,
    TooManyRetry,
    RuntimeMismatch,
    AbortedByServer,
}

impl AgentStatus {
    /// Statuses that end the current convergence cycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::AgentFailed | AgentStatus::TooManyRetry | AgentStatus::ScriptTimeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Succeeded => "SUCCEEDED",
            AgentStatus::Unknown => "UNKNOWN",
            AgentStatus::AgentFailed => "AGENT_FAILED",
            AgentStatus::RetryableAgentFailed => "RETRYABLE_AGENT_FAILED",
            AgentStatus::ScriptFailed => "SCRIPT_FAILED",
            AgentStatus::AbortedByService => "ABORTED_BY_SERVICE",
            AgentStatus::ScriptTimeout => "SCRIPT_TIMEOUT",
            AgentStatus::TooManyRetry => "TOO_MANY_RETRY",
            AgentStatus::RuntimeMismatch => "RUNTIME_MISMATCH",
            AgentStatus::AbortedByServer => "ABORTED_BY_SERVER",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of the deploy pipeline.
///
/// The server decides which stage comes next; the agent only executes the
/// stage it is told about. Unrecognized stage names decode as `Unknown`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DeployStage {
    #[default]
    Unknown,
    PreDownload,
    Downloading,
    PostDownload,
    Staging,
    PreRestart,
    Restarting,
    PostRestart,
    ServingBuild,
    Stopping,
    Stopped,
}

impl DeployStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStage::Unknown => "UNKNOWN",
            DeployStage::PreDownload => "PRE_DOWNLOAD",
            DeployStage::Downloading => "DOWNLOADING",
            DeployStage::PostDownload => "POST_DOWNLOAD",
            DeployStage::Staging => "STAGING",
            DeployStage::PreRestart => "PRE_RESTART",
            DeployStage::Restarting => "RESTARTING",
            DeployStage::PostRestart => "POST_RESTART",
            DeployStage::ServingBuild => "SERVING_BUILD",
            DeployStage::Stopping => "STOPPING",
            DeployStage::Stopped => "STOPPED",
        }
    }

    /// Stages that run before the build is staged on the host. A host
    /// without a script directory during these stages has simply never
    /// been deployed.
    pub fn is_pre_stage(&self) -> bool {
        matches!(
            self,
            DeployStage::PreDownload
                | DeployStage::Downloading
                | DeployStage::PostDownload
                | DeployStage::Staging
        )
    }
}

impl FromStr for DeployStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNKNOWN" => Ok(DeployStage::Unknown),
            "PRE_DOWNLOAD" => Ok(DeployStage::PreDownload),
            "DOWNLOADING" => Ok(DeployStage::Downloading),
            "POST_DOWNLOAD" => Ok(DeployStage::PostDownload),
            "STAGING" => Ok(DeployStage::Staging),
            "PRE_RESTART" => Ok(DeployStage::PreRestart),
            "RESTARTING" => Ok(DeployStage::Restarting),
            "POST_RESTART" => Ok(DeployStage::PostRestart),
            "SERVING_BUILD" => Ok(DeployStage::ServingBuild),
            "STOPPING" => Ok(DeployStage::Stopping),
            "STOPPED" => Ok(DeployStage::Stopped),
            _ => Err(format!("Invalid deploy stage: {}", s)),
        }
    }
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DeployStage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DeployStage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().unwrap_or_default())
    }
}

/// Top-level instruction class sent by the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum OpCode {
    #[default]
    Noop,
    Deploy,
    Update,
    Restart,
    Delete,
    Terminate,
    Wait,
    Rollback,
    Stop,
}

impl OpCode {
    /// Declaration order, which is also the legacy integer encoding
    pub const ALL: [OpCode; 9] = [
        OpCode::Noop,
        OpCode::Deploy,
        OpCode::Update,
        OpCode::Restart,
        OpCode::Delete,
        OpCode::Terminate,
        OpCode::Wait,
        OpCode::Rollback,
        OpCode::Stop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OpCode::Noop => "NOOP",
            OpCode::Deploy => "DEPLOY",
            OpCode::Update => "UPDATE",
            OpCode::Restart => "RESTART",
            OpCode::Delete => "DELETE",
            OpCode::Terminate => "TERMINATE",
            OpCode::Wait => "WAIT",
            OpCode::Rollback => "ROLLBACK",
            OpCode::Stop => "STOP",
        }
    }

    /// Whether this opcode removes the environment from the host
    pub fn is_removal(&self) -> bool {
        matches!(self, OpCode::Delete | OpCode::Terminate)
    }

    pub fn from_legacy(value: u64) -> Option<Self> {
        Self::ALL.get(usize::try_from(value).ok()?).copied()
    }
}

impl FromStr for OpCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OpCode::ALL
            .iter()
            .find(|op| op.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Invalid opcode: {}", s))
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for OpCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OpCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Name(String),
            Legacy(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Name(name) => name.parse().map_err(serde::de::Error::custom),
            Raw::Legacy(value) => OpCode::from_legacy(value)
                .ok_or_else(|| serde::de::Error::custom(format!("Invalid opcode: {}", value))),
        }
    }
}

/// Deploy type exposed to scripts as `DEPLOY_TYPE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployType {
    Regular,
    Rollback,
    Restart,
    Stop,
}

impl DeployType {
    pub fn from_op_code(op_code: OpCode) -> Self {
        match op_code {
            OpCode::Restart => DeployType::Restart,
            OpCode::Rollback => DeployType::Rollback,
            OpCode::Stop | OpCode::Terminate => DeployType::Stop,
            _ => DeployType::Regular,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeployType::Regular => "REGULAR",
            DeployType::Rollback => "ROLLBACK",
            DeployType::Restart => "RESTART",
            DeployType::Stop => "STOP",
        }
    }
}

/// Result of reporting status to the server mid-deploy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingStatus {
    /// The deploy plan is unchanged
    PlanNoChange,
    /// The server issued a different goal
    PlanChanged,
    /// The server could not be reached
    PingFailed,
}
