//! Session state container.
//!
//! State is only ever changed by applying a [`StateUpdate`]. Each update
//! replaces exactly one field, bumps that field's version counter and yields a
//! [`StoreEvent`] describing the change. Collections are `Arc`-shared and
//! replaced rather than mutated, so `Arc::ptr_eq` on two snapshots tells a
//! reader whether a collection changed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use casebook_api::{
    Client, ClientApproval, ClientSnapshot, Flow, FlowResult, ListFlowResultsResult, PayloadType,
    ScheduledFlow, StartupInfo,
};

/// Default number of flows requested per page.
pub const FLOWS_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    ClientId,
    Client,
    Access,
    Approvals,
    Snapshots,
    StartupInfos,
    FlowsPageSize,
    Flows,
    FlowsById,
    FlowResults,
    ScheduledFlows,
    CurrentUser,
}

impl Field {
    const COUNT: usize = 12;

    fn index(self) -> usize {
        self as usize
    }
}

/// One monotonically increasing counter per field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldVersions {
    counters: [u64; Field::COUNT],
}

impl FieldVersions {
    pub fn get(&self, field: Field) -> u64 {
        self.counters[field.index()]
    }

    fn bump(&mut self, field: Field) -> u64 {
        let slot = &mut self.counters[field.index()];
        *slot += 1;
        *slot
    }
}

/// Published after every applied update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub field: Field,
    pub version: u64,
    /// Set for per-flow fields.
    pub flow_id: Option<String>,
}

/// Results of one flow, bucketed by payload type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowResults {
    pub results_by_payload_type: BTreeMap<PayloadType, Vec<FlowResult>>,
    /// Records in the last page, including untyped ones.
    pub count_loaded: usize,
    pub total_count: u64,
}

impl FlowResults {
    pub fn is_empty(&self) -> bool {
        self.count_loaded == 0
    }

    pub fn results_of(&self, payload_type: &str) -> &[FlowResult] {
        self.results_by_payload_type
            .get(&PayloadType::new(payload_type))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Groups a page by payload type, keeping page order within each type.
/// Records without a declared type are counted but not bucketed.
pub fn group_results_by_payload_type(page: ListFlowResultsResult) -> FlowResults {
    let count_loaded = page.results.len();
    let mut results_by_payload_type: BTreeMap<PayloadType, Vec<FlowResult>> = BTreeMap::new();
    for result in page.results {
        if let Some(kind) = result.payload_type.clone() {
            results_by_payload_type.entry(kind).or_default().push(result);
        }
    }
    FlowResults {
        results_by_payload_type,
        count_loaded,
        total_count: page.total_count.unwrap_or(0),
    }
}

/// Stable sort, newest first, by the given key.
pub fn sort_newest_first<T, K, F>(items: &mut [T], key: F)
where
    K: Ord,
    F: Fn(&T) -> K,
{
    items.sort_by(|a, b| key(b).cmp(&key(a)));
}

#[derive(Debug, Clone)]
pub enum StateUpdate {
    ClientId(String),
    Client(Client),
    Access(bool),
    Approvals(Vec<ClientApproval>),
    /// Server order, oldest first.
    Snapshots(Vec<ClientSnapshot>),
    /// Server order, oldest first.
    StartupInfos(Vec<StartupInfo>),
    GrowFlowsPage(usize),
    Flows(Vec<Flow>),
    Flow(Flow),
    FlowResults {
        flow_id: String,
        results: FlowResults,
    },
    ScheduledFlows(Vec<ScheduledFlow>),
    CurrentUser(String),
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub client_id: Option<String>,
    pub client: Option<Client>,
    pub has_access: Option<bool>,
    pub approvals: Arc<Vec<ClientApproval>>,
    pub snapshots: Arc<Vec<ClientSnapshot>>,
    pub startup_infos: Arc<Vec<StartupInfo>>,
    pub flows_page_size: usize,
    pub flows: Arc<Vec<Flow>>,
    pub flows_by_id: Arc<HashMap<String, Flow>>,
    pub flow_results_by_id: Arc<HashMap<String, FlowResults>>,
    pub scheduled_flows: Arc<Vec<ScheduledFlow>>,
    pub current_user: Option<String>,
    pub versions: FieldVersions,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(FLOWS_PAGE_SIZE)
    }
}

impl SessionState {
    pub fn new(flows_page_size: usize) -> Self {
        Self {
            client_id: None,
            client: None,
            has_access: None,
            approvals: Arc::default(),
            snapshots: Arc::default(),
            startup_infos: Arc::default(),
            flows_page_size,
            flows: Arc::default(),
            flows_by_id: Arc::default(),
            flow_results_by_id: Arc::default(),
            scheduled_flows: Arc::default(),
            current_user: None,
            versions: FieldVersions::default(),
        }
    }

    pub fn apply(&mut self, update: StateUpdate) -> StoreEvent {
        let (field, flow_id) = match update {
            StateUpdate::ClientId(client_id) => {
                self.client_id = Some(client_id);
                (Field::ClientId, None)
            }
            StateUpdate::Client(client) => {
                self.client = Some(client);
                (Field::Client, None)
            }
            StateUpdate::Access(granted) => {
                self.has_access = Some(granted);
                (Field::Access, None)
            }
            StateUpdate::Approvals(approvals) => {
                self.approvals = Arc::new(approvals);
                (Field::Approvals, None)
            }
            StateUpdate::Snapshots(mut snapshots) => {
                snapshots.reverse();
                self.snapshots = Arc::new(snapshots);
                (Field::Snapshots, None)
            }
            StateUpdate::StartupInfos(mut startup_infos) => {
                startup_infos.reverse();
                self.startup_infos = Arc::new(startup_infos);
                (Field::StartupInfos, None)
            }
            StateUpdate::GrowFlowsPage(n) => {
                self.flows_page_size = self.flows_page_size.saturating_add(n);
                (Field::FlowsPageSize, None)
            }
            StateUpdate::Flows(mut flows) => {
                sort_newest_first(&mut flows, |flow| flow.started_at);
                self.flows = Arc::new(flows);
                (Field::Flows, None)
            }
            StateUpdate::Flow(flow) => {
                let flow_id = flow.flow_id.clone();
                let mut by_id = (*self.flows_by_id).clone();
                by_id.insert(flow_id.clone(), flow);
                self.flows_by_id = Arc::new(by_id);
                (Field::FlowsById, Some(flow_id))
            }
            StateUpdate::FlowResults { flow_id, results } => {
                let mut by_id = (*self.flow_results_by_id).clone();
                by_id.insert(flow_id.clone(), results);
                self.flow_results_by_id = Arc::new(by_id);
                (Field::FlowResults, Some(flow_id))
            }
            StateUpdate::ScheduledFlows(mut scheduled) => {
                sort_newest_first(&mut scheduled, |flow| flow.create_time);
                self.scheduled_flows = Arc::new(scheduled);
                (Field::ScheduledFlows, None)
            }
            StateUpdate::CurrentUser(name) => {
                self.current_user = Some(name);
                (Field::CurrentUser, None)
            }
        };
        let version = self.versions.bump(field);
        StoreEvent {
            field,
            version,
            flow_id,
        }
    }

    /// Best-effort: the API returns no total, so a full page is taken to mean
    /// more flows may exist.
    pub fn has_more_flows(&self) -> bool {
        self.flows_page_size <= self.flows.len()
    }

    /// First approval that has not expired.
    pub fn latest_approval(&self) -> Option<&ClientApproval> {
        self.approvals
            .iter()
            .find(|approval| !approval.status.is_expired())
    }

    pub fn flow(&self, flow_id: &str) -> Option<&Flow> {
        self.flows_by_id.get(flow_id)
    }

    pub fn flow_results(&self, flow_id: &str) -> Option<&FlowResults> {
        self.flow_results_by_id.get(flow_id)
    }

    /// `true` once the flow is known locally and finished or errored.
    pub fn flow_is_terminal(&self, flow_id: &str) -> bool {
        self.flows_by_id
            .get(flow_id)
            .map(|flow| flow.state.is_terminal())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casebook_api::{ApprovalStatus, FlowState};
    use chrono::{TimeZone, Utc};

    fn flow(id: &str, started: i64) -> Flow {
        Flow {
            flow_id: id.into(),
            client_id: "C.1234".into(),
            name: "ListProcesses".into(),
            creator: "analyst".into(),
            started_at: Utc.timestamp_opt(started, 0).unwrap(),
            last_active_at: Utc.timestamp_opt(started, 0).unwrap(),
            state: FlowState::Running,
            args: None,
            error_description: None,
            is_robot: false,
            tags: Vec::new(),
        }
    }

    fn result(kind: Option<&str>, tag: &str) -> FlowResult {
        FlowResult {
            client_id: "C.1234".into(),
            payload_type: kind.map(PayloadType::new),
            payload: serde_json::json!({ "tag": tag }),
            tag: tag.into(),
            timestamp: Utc.timestamp_opt(0, 0).unwrap(),
        }
    }

    fn approval(id: &str, status: ApprovalStatus) -> ClientApproval {
        ClientApproval {
            approval_id: id.into(),
            client_id: "C.1234".into(),
            requestor: "analyst".into(),
            reason: "case 17".into(),
            status,
            requested_approvers: vec!["lead".into()],
            approvers: Vec::new(),
            expiration_time: None,
        }
    }

    #[test]
    fn flows_are_stored_newest_first() {
        let mut state = SessionState::default();
        state.apply(StateUpdate::Flows(vec![
            flow("F.1", 100),
            flow("F.3", 300),
            flow("F.2", 200),
        ]));
        let ids: Vec<_> = state.flows.iter().map(|f| f.flow_id.as_str()).collect();
        assert_eq!(ids, ["F.3", "F.2", "F.1"]);
    }

    #[test]
    fn snapshots_are_reversed_from_server_order() {
        let mut state = SessionState::default();
        let snapshot = |flow: &str| ClientSnapshot {
            client_id: "C.1234".into(),
            source_flow_id: Some(flow.into()),
            os_release: None,
            os_version: None,
            kernel: None,
            memory_size: None,
            startup_info: None,
            timestamp: None,
        };
        state.apply(StateUpdate::Snapshots(vec![snapshot("old"), snapshot("new")]));
        assert_eq!(state.snapshots[0].source_flow_id.as_deref(), Some("new"));
    }

    #[test]
    fn grouping_keeps_order_within_each_payload_type() {
        let grouped = group_results_by_payload_type(ListFlowResultsResult {
            results: vec![
                result(Some("A"), "first"),
                result(Some("B"), "second"),
                result(Some("A"), "third"),
                result(None, "untyped"),
            ],
            total_count: Some(10),
        });

        assert_eq!(grouped.results_by_payload_type.len(), 2);
        let a: Vec<_> = grouped.results_of("A").iter().map(|r| r.tag.as_str()).collect();
        assert_eq!(a, ["first", "third"]);
        assert_eq!(grouped.results_of("B")[0].tag, "second");
        assert_eq!(grouped.count_loaded, 4);
        assert_eq!(grouped.total_count, 10);
    }

    #[test]
    fn each_update_bumps_only_its_field() {
        let mut state = SessionState::default();
        let event = state.apply(StateUpdate::Access(false));
        assert_eq!(event.field, Field::Access);
        assert_eq!(event.version, 1);
        state.apply(StateUpdate::Access(true));
        assert_eq!(state.versions.get(Field::Access), 2);
        assert_eq!(state.versions.get(Field::Flows), 0);
    }

    #[test]
    fn single_flow_merge_is_copy_on_write() {
        let mut state = SessionState::default();
        state.apply(StateUpdate::Flow(flow("F.1", 1)));
        let before = state.clone();

        let event = state.apply(StateUpdate::Flow(flow("F.2", 2)));
        assert_eq!(event.flow_id.as_deref(), Some("F.2"));
        assert!(!Arc::ptr_eq(&before.flows_by_id, &state.flows_by_id));
        assert!(Arc::ptr_eq(&before.flows, &state.flows));
        assert_eq!(before.flows_by_id.len(), 1);
        assert_eq!(state.flows_by_id.len(), 2);
    }

    #[test]
    fn has_more_flows_compares_page_size_with_loaded_count() {
        let mut state = SessionState::new(2);
        state.apply(StateUpdate::Flows(vec![flow("F.1", 1)]));
        assert!(!state.has_more_flows());
        state.apply(StateUpdate::Flows(vec![flow("F.1", 1), flow("F.2", 2)]));
        assert!(state.has_more_flows());
        state.apply(StateUpdate::GrowFlowsPage(1));
        assert!(!state.has_more_flows());
    }

    #[test]
    fn latest_approval_skips_expired_entries() {
        let mut state = SessionState::default();
        state.apply(StateUpdate::Approvals(vec![
            approval(
                "A.1",
                ApprovalStatus::Expired {
                    reason: "expired".into(),
                },
            ),
            approval(
                "A.2",
                ApprovalStatus::Pending {
                    reason: "needs 1 approver".into(),
                },
            ),
        ]));
        assert_eq!(
            state.latest_approval().map(|a| a.approval_id.as_str()),
            Some("A.2")
        );
    }

    #[test]
    fn unknown_flow_is_not_terminal() {
        let mut state = SessionState::default();
        assert!(!state.flow_is_terminal("F.1"));
        let mut finished = flow("F.1", 1);
        finished.state = FlowState::Finished;
        state.apply(StateUpdate::Flow(finished));
        assert!(state.flow_is_terminal("F.1"));
    }
}
