use std::fmt;
use std::sync::Arc;

use casebook_api::ApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("client id is not set, call `initialize` first")]
    MissingClientId,
    #[error("store is already bound to client {existing}")]
    ClientIdAlreadySet { existing: String },
    #[error("current user is not known yet")]
    MissingCurrentUser,
    #[error("approval duration is out of range")]
    InvalidDuration,
    #[error("session store was destroyed")]
    Destroyed,
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// The loop or fetch a background error came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollSource {
    Client,
    Access,
    Approvals,
    Snapshots,
    StartupInfos,
    Flows,
    ScheduledFlows,
    Flow(String),
    FlowResults(String),
}

impl fmt::Display for PollSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollSource::Client => f.write_str("client"),
            PollSource::Access => f.write_str("access"),
            PollSource::Approvals => f.write_str("approvals"),
            PollSource::Snapshots => f.write_str("snapshots"),
            PollSource::StartupInfos => f.write_str("startup_infos"),
            PollSource::Flows => f.write_str("flows"),
            PollSource::ScheduledFlows => f.write_str("scheduled_flows"),
            PollSource::Flow(flow_id) => write!(f, "flow/{flow_id}"),
            PollSource::FlowResults(flow_id) => write!(f, "flow_results/{flow_id}"),
        }
    }
}

/// A failed background tick. State keeps its last good value; the next
/// scheduled tick is the only retry.
#[derive(Debug, Clone)]
pub struct SyncError {
    pub source: PollSource,
    pub error: Arc<ApiError>,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sync failed: {}", self.source, self.error)
    }
}
