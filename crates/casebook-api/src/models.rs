//! Normalized records returned by the case-management API.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientLabel {
    pub owner: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub client_version: Option<u32>,
    #[serde(default)]
    pub build_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsInfo {
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub release: Option<String>,
    #[serde(default)]
    pub fqdn: Option<String>,
}

/// Latest known attributes of a monitored host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub client_id: String,
    #[serde(default)]
    pub agent_info: AgentInfo,
    #[serde(default)]
    pub os_info: OsInfo,
    #[serde(default)]
    pub first_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_booted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: Vec<ClientLabel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending { reason: String },
    Valid,
    Invalid { reason: String },
    Expired { reason: String },
}

impl ApprovalStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, ApprovalStatus::Valid)
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, ApprovalStatus::Expired { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientApproval {
    pub approval_id: String,
    pub client_id: String,
    pub requestor: String,
    pub reason: String,
    pub status: ApprovalStatus,
    #[serde(default)]
    pub requested_approvers: Vec<String>,
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default)]
    pub expiration_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientApprovalRequest {
    pub client_id: String,
    pub reason: String,
    pub approvers: Vec<String>,
    pub cc: Vec<String>,
    pub expiration_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupInfo {
    #[serde(default)]
    pub agent_info: Option<AgentInfo>,
    #[serde(default)]
    pub boot_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSnapshot {
    pub client_id: String,
    #[serde(default)]
    pub source_flow_id: Option<String>,
    #[serde(default)]
    pub os_release: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub kernel: Option<String>,
    #[serde(default)]
    pub memory_size: Option<u64>,
    #[serde(default)]
    pub startup_info: Option<StartupInfo>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    Unset,
    Running,
    Finished,
    Error,
}

impl FlowState {
    /// No further transitions are expected once a flow finished or errored.
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowState::Finished | FlowState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub flow_id: String,
    pub client_id: String,
    pub name: String,
    pub creator: String,
    pub started_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub state: FlowState,
    #[serde(default)]
    pub args: Option<serde_json::Value>,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub is_robot: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Declared type tag of a flow result record, e.g. `StatEntry`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadType(pub String);

impl PayloadType {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowResult {
    pub client_id: String,
    #[serde(default)]
    pub payload_type: Option<PayloadType>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub tag: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFlowResultsResult {
    #[serde(default, rename = "items")]
    pub results: Vec<FlowResult>,
    #[serde(default)]
    pub total_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledFlow {
    pub scheduled_flow_id: String,
    pub client_id: String,
    pub creator: String,
    pub flow_name: String,
    #[serde(default)]
    pub flow_args: Option<serde_json::Value>,
    pub create_time: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListFlowsArgs {
    pub client_id: String,
    pub count: usize,
    pub top_flows_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowResultsParams {
    pub client_id: String,
    pub flow_id: String,
    pub offset: usize,
    pub count: usize,
    pub with_tag: Option<String>,
    pub with_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartFlowArgs {
    pub flow_name: String,
    pub flow_args: serde_json::Value,
    pub disable_rrg_support: bool,
}
