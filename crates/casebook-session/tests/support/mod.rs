#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use casebook_api::{
    ApiError, ApiResult, ApprovalStatus, CaseApi, Client, ClientApproval, ClientApprovalRequest,
    ClientLabel, ClientSnapshot, CurrentUser, Flow, FlowResult, FlowResultsParams, FlowState,
    ListFlowResultsResult, ListFlowsArgs, PayloadType, ScheduledFlow, StartFlowArgs, StartupInfo,
    StatusCode,
};
use casebook_session::{ClientStore, SyncConfig};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

pub const CLIENT_ID: &str = "C.1234";
pub const INTERVAL: Duration = Duration::from_secs(5);

type Responder<T> = Arc<dyn Fn() -> ApiResult<T> + Send + Sync>;

/// Scripted answers for one API operation: queued responses first, then the
/// fallback. Calls without either fail with `NotFound`.
pub struct Script<T> {
    queue: Mutex<VecDeque<ApiResult<T>>>,
    fallback: Mutex<Option<Responder<T>>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl<T> Default for Script<T> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Script<T> {
    pub fn push(&self, value: T) -> &Self {
        self.queue.lock().push_back(Ok(value));
        self
    }

    pub fn push_err(&self, error: ApiError) -> &Self {
        self.queue.lock().push_back(Err(error));
        self
    }

    pub fn always(&self, value: T) -> &Self {
        *self.fallback.lock() = Some(Arc::new(move || Ok(value.clone())));
        self
    }

    pub fn always_with<F>(&self, responder: F) -> &Self
    where
        F: Fn() -> ApiResult<T> + Send + Sync + 'static,
    {
        *self.fallback.lock() = Some(Arc::new(responder));
        self
    }

    /// Every response is held back this long after the call.
    pub fn delay(&self, delay: Duration) -> &Self {
        *self.delay.lock() = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn next(&self) -> ApiResult<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.queue.lock().pop_front();
        let response = match scripted {
            Some(response) => response,
            None => {
                let fallback = self.fallback.lock().clone();
                match fallback {
                    Some(responder) => responder(),
                    None => Err(ApiError::NotFound {
                        resource: "unscripted call".into(),
                    }),
                }
            }
        };
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        response
    }
}

#[derive(Default)]
pub struct FakeCaseApi {
    pub client: Script<Client>,
    pub access: Script<bool>,
    pub approvals: Script<Vec<ClientApproval>>,
    pub request_approval: Script<ClientApproval>,
    pub snapshots: Script<Vec<ClientSnapshot>>,
    pub startup_infos: Script<Vec<StartupInfo>>,
    pub add_label: Script<()>,
    pub remove_label: Script<()>,
    pub flows: Script<Vec<Flow>>,
    pub flow: Script<Flow>,
    pub flow_results: Script<ListFlowResultsResult>,
    pub scheduled_flows: Script<Vec<ScheduledFlow>>,
    pub start_flow: Script<Flow>,
    pub schedule_flow: Script<ScheduledFlow>,
    pub cancel_flow: Script<()>,
    pub unschedule_flow: Script<()>,
    pub current_user: Script<CurrentUser>,

    pub approval_requests: Mutex<Vec<ClientApprovalRequest>>,
    pub label_calls: Mutex<Vec<(String, String)>>,
    pub flows_args: Mutex<Vec<ListFlowsArgs>>,
    pub flow_ids: Mutex<Vec<String>>,
    pub results_params: Mutex<Vec<FlowResultsParams>>,
    pub scheduled_creators: Mutex<Vec<String>>,
    pub launched: Mutex<Vec<StartFlowArgs>>,
}

impl FakeCaseApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answers the calls `initialize` makes with an empty, denied session.
    pub fn with_session_defaults() -> Arc<Self> {
        let api = Self::new();
        api.client.always(client(&[]));
        api.access.always(false);
        api.snapshots.always(Vec::new());
        api.startup_infos.always(Vec::new());
        api
    }
}

#[async_trait]
impl CaseApi for FakeCaseApi {
    async fn fetch_client(&self, _client_id: &str) -> ApiResult<Client> {
        self.client.next().await
    }

    async fn verify_client_access(&self, _client_id: &str) -> ApiResult<bool> {
        self.access.next().await
    }

    async fn list_client_approvals(&self, _client_id: &str) -> ApiResult<Vec<ClientApproval>> {
        self.approvals.next().await
    }

    async fn request_client_approval(
        &self,
        request: ClientApprovalRequest,
    ) -> ApiResult<ClientApproval> {
        self.approval_requests.lock().push(request);
        self.request_approval.next().await
    }

    async fn fetch_client_snapshots(&self, _client_id: &str) -> ApiResult<Vec<ClientSnapshot>> {
        self.snapshots.next().await
    }

    async fn fetch_client_startup_infos(&self, _client_id: &str) -> ApiResult<Vec<StartupInfo>> {
        self.startup_infos.next().await
    }

    async fn add_client_label(&self, _client_id: &str, label: &str) -> ApiResult<()> {
        self.label_calls
            .lock()
            .push(("add".to_string(), label.to_string()));
        self.add_label.next().await
    }

    async fn remove_client_label(&self, _client_id: &str, label: &str) -> ApiResult<()> {
        self.label_calls
            .lock()
            .push(("remove".to_string(), label.to_string()));
        self.remove_label.next().await
    }

    async fn list_flows(&self, args: ListFlowsArgs) -> ApiResult<Vec<Flow>> {
        self.flows_args.lock().push(args);
        self.flows.next().await
    }

    async fn fetch_flow(&self, _client_id: &str, flow_id: &str) -> ApiResult<Flow> {
        self.flow_ids.lock().push(flow_id.to_string());
        self.flow.next().await
    }

    async fn list_flow_results(
        &self,
        params: FlowResultsParams,
    ) -> ApiResult<ListFlowResultsResult> {
        self.results_params.lock().push(params);
        self.flow_results.next().await
    }

    async fn list_scheduled_flows(
        &self,
        _client_id: &str,
        creator: &str,
    ) -> ApiResult<Vec<ScheduledFlow>> {
        self.scheduled_creators.lock().push(creator.to_string());
        self.scheduled_flows.next().await
    }

    async fn start_flow(&self, _client_id: &str, args: StartFlowArgs) -> ApiResult<Flow> {
        self.launched.lock().push(args);
        self.start_flow.next().await
    }

    async fn schedule_flow(
        &self,
        _client_id: &str,
        args: StartFlowArgs,
    ) -> ApiResult<ScheduledFlow> {
        self.launched.lock().push(args);
        self.schedule_flow.next().await
    }

    async fn cancel_flow(&self, _client_id: &str, _flow_id: &str) -> ApiResult<()> {
        self.cancel_flow.next().await
    }

    async fn unschedule_flow(&self, _client_id: &str, _scheduled_flow_id: &str) -> ApiResult<()> {
        self.unschedule_flow.next().await
    }

    async fn fetch_current_user(&self) -> ApiResult<CurrentUser> {
        self.current_user.next().await
    }
}

pub fn config() -> SyncConfig {
    SyncConfig {
        polling_interval_ms: INTERVAL.as_millis() as u64,
        ..SyncConfig::default()
    }
}

pub fn store(api: &Arc<FakeCaseApi>) -> ClientStore {
    store_with(api, config())
}

pub fn store_with(api: &Arc<FakeCaseApi>, config: SyncConfig) -> ClientStore {
    ClientStore::new(api.clone(), &config)
}

/// Lets every ready task run to its next suspension point.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn denied() -> ApiError {
    ApiError::MissingApproval {
        message: "No approval found".into(),
    }
}

pub fn server_error() -> ApiError {
    ApiError::UnexpectedStatus {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: "internal error".into(),
    }
}

pub fn client(labels: &[&str]) -> Client {
    Client {
        client_id: CLIENT_ID.into(),
        agent_info: Default::default(),
        os_info: Default::default(),
        first_seen_at: None,
        last_seen_at: None,
        last_booted_at: None,
        labels: labels
            .iter()
            .map(|name| ClientLabel {
                owner: "analyst".into(),
                name: (*name).into(),
            })
            .collect(),
    }
}

pub fn approval(id: &str, status: ApprovalStatus) -> ClientApproval {
    ClientApproval {
        approval_id: id.into(),
        client_id: CLIENT_ID.into(),
        requestor: "analyst".into(),
        reason: "case 17".into(),
        status,
        requested_approvers: vec!["lead".into()],
        approvers: Vec::new(),
        expiration_time: None,
    }
}

pub fn pending(id: &str) -> ClientApproval {
    approval(
        id,
        ApprovalStatus::Pending {
            reason: "Need at least 1 more approver.".into(),
        },
    )
}

pub fn valid(id: &str) -> ClientApproval {
    approval(id, ApprovalStatus::Valid)
}

pub fn flow(id: &str, started: i64, state: FlowState) -> Flow {
    Flow {
        flow_id: id.into(),
        client_id: CLIENT_ID.into(),
        name: "CollectFilesByKnownPath".into(),
        creator: "analyst".into(),
        started_at: at(started),
        last_active_at: at(started),
        state,
        args: None,
        error_description: None,
        is_robot: false,
        tags: Vec::new(),
    }
}

pub fn result(kind: &str, tag: &str) -> FlowResult {
    FlowResult {
        client_id: CLIENT_ID.into(),
        payload_type: Some(PayloadType::new(kind)),
        payload: serde_json::json!({ "tag": tag }),
        tag: tag.into(),
        timestamp: at(0),
    }
}

pub fn scheduled(id: &str, created: i64) -> ScheduledFlow {
    ScheduledFlow {
        scheduled_flow_id: id.into(),
        client_id: CLIENT_ID.into(),
        creator: "analyst".into(),
        flow_name: "CollectFilesByKnownPath".into(),
        flow_args: None,
        create_time: at(created),
        error: None,
    }
}

pub fn snapshot(ts: i64) -> ClientSnapshot {
    ClientSnapshot {
        client_id: CLIENT_ID.into(),
        source_flow_id: None,
        os_release: None,
        os_version: None,
        kernel: None,
        memory_size: None,
        startup_info: None,
        timestamp: Some(at(ts)),
    }
}

pub fn startup(ts: i64) -> StartupInfo {
    StartupInfo {
        agent_info: None,
        boot_time: None,
        timestamp: Some(at(ts)),
    }
}
