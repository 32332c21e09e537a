//! Per-session synchronization store.
//!
//! A [`ClientStore`] is opened for one client. It owns the session state and
//! every loop and request started on its behalf; dropping the store (or
//! calling [`ClientStore::destroy`]) cancels all of them. Loop methods spawn
//! onto the current Tokio runtime and return immediately.

use std::sync::Arc;
use std::time::Duration;

use casebook_api::{
    ApiError, CaseApi, Client, ClientApproval, ClientApprovalRequest, ClientSnapshot, CurrentUser,
    Flow, FlowResultsParams, ListFlowsArgs, ScheduledFlow, StartFlowArgs, StartupInfo,
};
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{PollSource, StoreError, SyncError};
use crate::history::{merge_history, ClientHistoryEntry};
use crate::poll::{poll, PollOptions};
use crate::scope::{KeyedSubscriptions, SessionScope};
use crate::state::{
    group_results_by_payload_type, FlowResults, SessionState, StateUpdate, StoreEvent,
};

const ACCESS_KEY: &str = "access";
const FLOWS_KEY: &str = "flows";
const SCHEDULED_FLOWS_KEY: &str = "scheduled-flows";

/// One page of results to keep in sync for a flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowResultsQuery {
    /// May be unknown while the caller is still resolving it.
    pub flow_id: Option<String>,
    pub offset: usize,
    pub count: usize,
    pub with_tag: Option<String>,
    pub with_type: Option<String>,
}

/// Outcome of [`ClientStore::schedule_or_start_flow`].
#[derive(Debug, Clone, PartialEq)]
pub enum FlowLaunch {
    Started(Flow),
    Scheduled(ScheduledFlow),
}

struct StoreInner {
    api: Arc<dyn CaseApi>,
    state: RwLock<SessionState>,
    scope: SessionScope,
    subscriptions: KeyedSubscriptions,
    flows_signal: watch::Sender<u64>,
    scheduled_flows_signal: watch::Sender<u64>,
    events: broadcast::Sender<StoreEvent>,
    errors: broadcast::Sender<SyncError>,
    polling_interval: Duration,
}

impl StoreInner {
    fn client_id(&self) -> Result<String, StoreError> {
        let state = self.state.read();
        if self.scope.is_cancelled() {
            return Err(StoreError::Destroyed);
        }
        state.client_id.clone().ok_or(StoreError::MissingClientId)
    }

    /// Applies `update` unless `token` (or the whole scope) was cancelled.
    /// The check and the write happen under the same lock that `destroy`
    /// takes, so nothing lands after destruction.
    fn commit_with<R>(
        &self,
        token: Option<&CancellationToken>,
        apply: impl FnOnce(&mut SessionState) -> (StoreEvent, R),
    ) -> Option<R> {
        let (event, out) = {
            let mut state = self.state.write();
            if self.scope.is_cancelled() || token.map(|t| t.is_cancelled()).unwrap_or(false) {
                return None;
            }
            apply(&mut state)
        };
        debug!(
            target: "casebook.session",
            field = ?event.field,
            version = event.version,
            flow_id = ?event.flow_id,
            "state committed"
        );
        let _ = self.events.send(event);
        Some(out)
    }

    fn commit(&self, token: Option<&CancellationToken>, update: StateUpdate) -> bool {
        self.commit_with(token, |state| (state.apply(update), ()))
            .is_some()
    }

    fn report(&self, source: PollSource, error: ApiError) {
        warn!(target: "casebook.session", source = %source, error = %error, "sync failed");
        let _ = self.errors.send(SyncError {
            source,
            error: Arc::new(error),
        });
    }

    fn bump(signal: &watch::Sender<u64>) {
        signal.send_modify(|value| *value += 1);
    }

    /// Spawns a loop whose responses are committed through `on_response` and
    /// whose failures go to the error channel under `source`.
    fn spawn_loop<T, R, Fut, H>(
        self: &Arc<Self>,
        token: CancellationToken,
        options: PollOptions<T>,
        source: PollSource,
        request: R,
        mut on_response: H,
    ) where
        T: Send + 'static,
        R: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, ApiError>> + Send + 'static,
        H: FnMut(&StoreInner, &CancellationToken, T) + Send + 'static,
    {
        let inner = Arc::clone(self);
        let response_token = token.clone();
        let error_inner = Arc::clone(self);
        poll(
            token,
            options,
            request,
            move |response| on_response(&*inner, &response_token, response),
            move |error| error_inner.report(source.clone(), error),
        );
    }
}

/// Synchronizes one client's session with the case-management API.
pub struct ClientStore {
    inner: Arc<StoreInner>,
}

impl ClientStore {
    pub fn new(api: Arc<dyn CaseApi>, config: &SyncConfig) -> Self {
        let (flows_signal, _) = watch::channel(0);
        let (scheduled_flows_signal, _) = watch::channel(0);
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (errors, _) = broadcast::channel(config.error_channel_capacity.max(1));
        Self {
            inner: Arc::new(StoreInner {
                api,
                state: RwLock::new(SessionState::new(config.flows_page_size)),
                scope: SessionScope::new(),
                subscriptions: KeyedSubscriptions::new(),
                flows_signal,
                scheduled_flows_signal,
                events,
                errors,
                polling_interval: config.polling_interval(),
            }),
        }
    }

    /// Binds the store to `client_id` and starts the base loops: client
    /// polling, the access gate, snapshots and startup history.
    pub fn initialize(&self, client_id: impl Into<String>) -> Result<(), StoreError> {
        let client_id = client_id.into();
        let event = {
            let mut state = self.inner.state.write();
            if self.inner.scope.is_cancelled() {
                return Err(StoreError::Destroyed);
            }
            if let Some(existing) = &state.client_id {
                if *existing == client_id {
                    return Ok(());
                }
                return Err(StoreError::ClientIdAlreadySet {
                    existing: existing.clone(),
                });
            }
            state.apply(StateUpdate::ClientId(client_id.clone()))
        };
        let _ = self.inner.events.send(event);
        info!(target: "casebook.session", client_id = %client_id, "session initialized");

        self.poll_client(self.inner.polling_interval)?;
        self.poll_until_access()?;
        self.fetch_client_snapshots()?;
        self.fetch_client_startup_infos()?;
        Ok(())
    }

    /// Polls the client record every `interval`; a zero interval fetches once.
    pub fn poll_client(&self, interval: Duration) -> Result<(), StoreError> {
        let client_id = self.inner.client_id()?;
        let api = Arc::clone(&self.inner.api);
        self.inner.spawn_loop(
            self.inner.scope.child(),
            PollOptions::new("client", interval),
            PollSource::Client,
            move || {
                let api = Arc::clone(&api);
                let client_id = client_id.clone();
                async move { api.fetch_client(&client_id).await }
            },
            |inner, token, client: Client| {
                inner.commit(Some(token), StateUpdate::Client(client));
            },
        );
        Ok(())
    }

    /// Re-fetches the client record once and waits for it.
    pub async fn fetch_client(&self) -> Result<Client, StoreError> {
        let client_id = self.inner.client_id()?;
        let client = self
            .inner
            .scope
            .run(self.inner.api.fetch_client(&client_id))
            .await??;
        if !self
            .inner
            .commit(None, StateUpdate::Client(client.clone()))
        {
            return Err(StoreError::Destroyed);
        }
        Ok(client)
    }

    /// Polls access until it is granted. The flows refresh signal is bumped
    /// once, on the transition to granted.
    pub fn poll_until_access(&self) -> Result<(), StoreError> {
        let client_id = self.inner.client_id()?;
        let Some(token) = self
            .inner
            .subscriptions
            .start_if_absent(&self.inner.scope, ACCESS_KEY)
        else {
            return Ok(());
        };
        let api = Arc::clone(&self.inner.api);
        self.inner.spawn_loop(
            token,
            PollOptions::new("access", self.inner.polling_interval)
                .stop_when(|granted: &bool| *granted),
            PollSource::Access,
            move || {
                let api = Arc::clone(&api);
                let client_id = client_id.clone();
                async move { api.verify_client_access(&client_id).await }
            },
            |inner, token, granted: bool| {
                let transitioned = inner.commit_with(Some(token), |state| {
                    let was = state.has_access;
                    let event = state.apply(StateUpdate::Access(granted));
                    (event, granted && was != Some(true))
                });
                if transitioned == Some(true) {
                    info!(target: "casebook.session", "client access granted");
                    StoreInner::bump(&inner.flows_signal);
                }
            },
        );
        Ok(())
    }

    /// Polls approvals until one is valid. Each call starts a fresh loop.
    pub fn poll_client_approvals(&self, interval: Duration) -> Result<(), StoreError> {
        let client_id = self.inner.client_id()?;
        let api = Arc::clone(&self.inner.api);
        self.inner.spawn_loop(
            self.inner.scope.child(),
            PollOptions::new("approvals", interval).stop_when(|approvals: &Vec<ClientApproval>| {
                approvals.iter().any(|approval| approval.status.is_valid())
            }),
            PollSource::Approvals,
            move || {
                let api = Arc::clone(&api);
                let client_id = client_id.clone();
                async move { api.list_client_approvals(&client_id).await }
            },
            |inner, token, approvals: Vec<ClientApproval>| {
                let valid = approvals.iter().any(|approval| approval.status.is_valid());
                if inner.commit(Some(token), StateUpdate::Approvals(approvals)) && valid {
                    info!(target: "casebook.session", "valid approval found");
                }
            },
        );
        Ok(())
    }

    /// Requests access for `duration` from now and refreshes the approval
    /// list once the request is accepted.
    pub async fn request_client_approval(
        &self,
        reason: impl Into<String>,
        approvers: Vec<String>,
        duration: Duration,
        cc: Vec<String>,
    ) -> Result<ClientApproval, StoreError> {
        let client_id = self.inner.client_id()?;
        let duration =
            chrono::Duration::from_std(duration).map_err(|_| StoreError::InvalidDuration)?;
        let expiration_time = Utc::now()
            .checked_add_signed(duration)
            .ok_or(StoreError::InvalidDuration)?;
        let request = ClientApprovalRequest {
            client_id,
            reason: reason.into(),
            approvers,
            cc,
            expiration_time,
        };
        let approval = self
            .inner
            .scope
            .run(self.inner.api.request_client_approval(request))
            .await??;
        info!(
            target: "casebook.session",
            approval_id = %approval.approval_id,
            "approval requested"
        );
        self.poll_client_approvals(Duration::ZERO)?;
        Ok(approval)
    }

    /// Adds a label, then replaces the client with a fresh server copy.
    pub async fn add_client_label(&self, label: &str) -> Result<(), StoreError> {
        let client_id = self.inner.client_id()?;
        self.inner
            .scope
            .run(self.inner.api.add_client_label(&client_id, label))
            .await??;
        self.fetch_client().await.map(|_| ())
    }

    /// Removes a label, then replaces the client with a fresh server copy.
    pub async fn remove_client_label(&self, label: &str) -> Result<(), StoreError> {
        let client_id = self.inner.client_id()?;
        self.inner
            .scope
            .run(self.inner.api.remove_client_label(&client_id, label))
            .await??;
        self.fetch_client().await.map(|_| ())
    }

    pub fn fetch_client_snapshots(&self) -> Result<(), StoreError> {
        let client_id = self.inner.client_id()?;
        let api = Arc::clone(&self.inner.api);
        self.inner.spawn_loop(
            self.inner.scope.child(),
            PollOptions::new("snapshots", Duration::ZERO),
            PollSource::Snapshots,
            move || {
                let api = Arc::clone(&api);
                let client_id = client_id.clone();
                async move { api.fetch_client_snapshots(&client_id).await }
            },
            |inner, token, snapshots: Vec<ClientSnapshot>| {
                inner.commit(Some(token), StateUpdate::Snapshots(snapshots));
            },
        );
        Ok(())
    }

    pub fn fetch_client_startup_infos(&self) -> Result<(), StoreError> {
        let client_id = self.inner.client_id()?;
        let api = Arc::clone(&self.inner.api);
        self.inner.spawn_loop(
            self.inner.scope.child(),
            PollOptions::new("startup_infos", Duration::ZERO),
            PollSource::StartupInfos,
            move || {
                let api = Arc::clone(&api);
                let client_id = client_id.clone();
                async move { api.fetch_client_startup_infos(&client_id).await }
            },
            |inner, token, startup_infos: Vec<StartupInfo>| {
                inner.commit(Some(token), StateUpdate::StartupInfos(startup_infos));
            },
        );
        Ok(())
    }

    /// Grows the flows page by `n` and asks the flows loop for an immediate
    /// refetch. `n == 0` only triggers the refetch.
    pub fn increase_flows_page_size(&self, n: usize) -> Result<(), StoreError> {
        self.inner.client_id()?;
        if !self.inner.commit(None, StateUpdate::GrowFlowsPage(n)) {
            return Err(StoreError::Destroyed);
        }
        StoreInner::bump(&self.inner.flows_signal);
        Ok(())
    }

    /// Keeps the flow list in sync. Page size and access are read on every
    /// tick; without access the list is empty and no request is made. An
    /// access-denied answer leaves the last list in place.
    pub fn poll_flows(&self) -> Result<(), StoreError> {
        let client_id = self.inner.client_id()?;
        let Some(token) = self
            .inner
            .subscriptions
            .start_if_absent(&self.inner.scope, FLOWS_KEY)
        else {
            return Ok(());
        };
        let inner = Arc::clone(&self.inner);
        self.inner.spawn_loop(
            token,
            PollOptions::new("flows", self.inner.polling_interval)
                .with_trigger(self.inner.flows_signal.subscribe()),
            PollSource::Flows,
            move || {
                let inner = Arc::clone(&inner);
                let client_id = client_id.clone();
                async move {
                    let (granted, count) = {
                        let state = inner.state.read();
                        (state.has_access == Some(true), state.flows_page_size)
                    };
                    if !granted {
                        return Ok(Some(Vec::new()));
                    }
                    let args = ListFlowsArgs {
                        client_id,
                        count,
                        top_flows_only: false,
                    };
                    match inner.api.list_flows(args).await {
                        Ok(flows) => Ok(Some(flows)),
                        Err(err) if err.is_access_denied() => {
                            debug!(target: "casebook.session", error = %err, "flows not accessible yet");
                            Ok(None)
                        }
                        Err(err) => Err(err),
                    }
                }
            },
            |inner, token, flows: Option<Vec<Flow>>| {
                if let Some(flows) = flows {
                    inner.commit(Some(token), StateUpdate::Flows(flows));
                }
            },
        );
        Ok(())
    }

    /// Records the signed-in user and refreshes scheduled flows.
    pub fn set_current_user(&self, name: impl Into<String>) -> Result<(), StoreError> {
        self.inner.client_id()?;
        if !self
            .inner
            .commit(None, StateUpdate::CurrentUser(name.into()))
        {
            return Err(StoreError::Destroyed);
        }
        StoreInner::bump(&self.inner.scheduled_flows_signal);
        Ok(())
    }

    pub async fn load_current_user(&self) -> Result<CurrentUser, StoreError> {
        self.inner.client_id()?;
        let user = self
            .inner
            .scope
            .run(self.inner.api.fetch_current_user())
            .await??;
        self.set_current_user(user.name.clone())?;
        Ok(user)
    }

    /// Keeps the current user's scheduled flows in sync. Until the user is
    /// known the list is empty and no request is made.
    pub fn poll_scheduled_flows(&self) -> Result<(), StoreError> {
        let client_id = self.inner.client_id()?;
        let Some(token) = self
            .inner
            .subscriptions
            .start_if_absent(&self.inner.scope, SCHEDULED_FLOWS_KEY)
        else {
            return Ok(());
        };
        let inner = Arc::clone(&self.inner);
        self.inner.spawn_loop(
            token,
            PollOptions::new("scheduled_flows", self.inner.polling_interval)
                .with_trigger(self.inner.scheduled_flows_signal.subscribe()),
            PollSource::ScheduledFlows,
            move || {
                let inner = Arc::clone(&inner);
                let client_id = client_id.clone();
                async move {
                    let creator = inner.state.read().current_user.clone();
                    match creator {
                        Some(creator) => inner.api.list_scheduled_flows(&client_id, &creator).await,
                        None => Ok(Vec::new()),
                    }
                }
            },
            |inner, token, scheduled: Vec<ScheduledFlow>| {
                inner.commit(Some(token), StateUpdate::ScheduledFlows(scheduled));
            },
        );
        Ok(())
    }

    /// Starts the flow when access is granted, otherwise schedules it for
    /// approval.
    pub async fn schedule_or_start_flow(
        &self,
        flow_name: impl Into<String>,
        flow_args: serde_json::Value,
        disable_rrg_support: bool,
    ) -> Result<FlowLaunch, StoreError> {
        let client_id = self.inner.client_id()?;
        let granted = self.inner.state.read().has_access == Some(true);
        let args = StartFlowArgs {
            flow_name: flow_name.into(),
            flow_args,
            disable_rrg_support,
        };

        if granted {
            let flow = self
                .inner
                .scope
                .run(self.inner.api.start_flow(&client_id, args))
                .await??;
            info!(target: "casebook.session", flow_id = %flow.flow_id, "flow started");
            self.increase_flows_page_size(1)?;
            Ok(FlowLaunch::Started(flow))
        } else {
            let scheduled = self
                .inner
                .scope
                .run(self.inner.api.schedule_flow(&client_id, args))
                .await??;
            info!(
                target: "casebook.session",
                scheduled_flow_id = %scheduled.scheduled_flow_id,
                "flow scheduled"
            );
            StoreInner::bump(&self.inner.scheduled_flows_signal);
            Ok(FlowLaunch::Scheduled(scheduled))
        }
    }

    pub async fn cancel_flow(&self, flow_id: &str) -> Result<(), StoreError> {
        let client_id = self.inner.client_id()?;
        self.inner
            .scope
            .run(self.inner.api.cancel_flow(&client_id, flow_id))
            .await??;
        StoreInner::bump(&self.inner.flows_signal);
        Ok(())
    }

    /// Removes one of the current user's scheduled flows. Scheduled flows are
    /// listed per creator, so the user must be known first.
    pub async fn unschedule_flow(&self, scheduled_flow_id: &str) -> Result<(), StoreError> {
        let client_id = self.inner.client_id()?;
        if self.inner.state.read().current_user.is_none() {
            return Err(StoreError::MissingCurrentUser);
        }
        self.inner
            .scope
            .run(self.inner.api.unschedule_flow(&client_id, scheduled_flow_id))
            .await??;
        StoreInner::bump(&self.inner.scheduled_flows_signal);
        Ok(())
    }

    /// Keeps one flow's metadata in sync, also after it finished. Repeated
    /// calls for a flow that is already polled are no-ops.
    pub fn poll_flow(&self, flow_id: Option<&str>) -> Result<(), StoreError> {
        let client_id = self.inner.client_id()?;
        let Some(flow_id) = flow_id else {
            return Ok(());
        };
        let Some(token) = self
            .inner
            .subscriptions
            .start_if_absent(&self.inner.scope, &format!("flow:{flow_id}"))
        else {
            return Ok(());
        };
        let api = Arc::clone(&self.inner.api);
        let flow_id = flow_id.to_string();
        self.inner.spawn_loop(
            token,
            PollOptions::new(format!("flow/{flow_id}"), self.inner.polling_interval),
            PollSource::Flow(flow_id.clone()),
            move || {
                let api = Arc::clone(&api);
                let client_id = client_id.clone();
                let flow_id = flow_id.clone();
                async move { api.fetch_flow(&client_id, &flow_id).await }
            },
            |inner, token, flow: Flow| {
                inner.commit(Some(token), StateUpdate::Flow(flow));
            },
        );
        Ok(())
    }

    /// Keeps one page of a flow's results in sync until the flow is known to
    /// be finished or errored. A new query for the same flow replaces the
    /// running one.
    pub fn poll_flow_results(&self, query: FlowResultsQuery) -> Result<(), StoreError> {
        let client_id = self.inner.client_id()?;
        let Some(flow_id) = query.flow_id.clone() else {
            return Ok(());
        };
        let token = self
            .inner
            .subscriptions
            .replace(&self.inner.scope, &format!("results:{flow_id}"));

        // An empty page is answered locally, once.
        let interval = if query.count == 0 {
            Duration::ZERO
        } else {
            self.inner.polling_interval
        };
        let stop_inner = Arc::clone(&self.inner);
        let stop_flow_id = flow_id.clone();
        let api = Arc::clone(&self.inner.api);
        let params = FlowResultsParams {
            client_id,
            flow_id: flow_id.clone(),
            offset: query.offset,
            count: query.count,
            with_tag: query.with_tag,
            with_type: query.with_type,
        };
        let commit_flow_id = flow_id.clone();
        self.inner.spawn_loop(
            token,
            PollOptions::new(format!("flow_results/{flow_id}"), interval).stop_when(
                move |_: &FlowResults| stop_inner.state.read().flow_is_terminal(&stop_flow_id),
            ),
            PollSource::FlowResults(flow_id),
            move || {
                let api = Arc::clone(&api);
                let params = params.clone();
                async move {
                    if params.count == 0 {
                        return Ok(FlowResults::default());
                    }
                    api.list_flow_results(params)
                        .await
                        .map(group_results_by_payload_type)
                }
            },
            move |inner, token, results: FlowResults| {
                inner.commit(
                    Some(token),
                    StateUpdate::FlowResults {
                        flow_id: commit_flow_id.clone(),
                        results,
                    },
                );
            },
        );
        Ok(())
    }

    /// Cancels every loop and request of this session. Responses that arrive
    /// later are dropped. Idempotent.
    pub fn destroy(&self) {
        let _state = self.inner.state.write();
        if !self.inner.scope.is_cancelled() {
            self.inner.scope.cancel();
            info!(target: "casebook.session", "session destroyed");
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.scope.is_cancelled()
    }

    /// Snapshot of the whole session state.
    pub fn state(&self) -> SessionState {
        self.inner.state.read().clone()
    }

    pub fn client_id(&self) -> Option<String> {
        self.inner.state.read().client_id.clone()
    }

    pub fn client(&self) -> Option<Client> {
        self.inner.state.read().client.clone()
    }

    pub fn has_access(&self) -> Option<bool> {
        self.inner.state.read().has_access
    }

    pub fn approvals(&self) -> Arc<Vec<ClientApproval>> {
        Arc::clone(&self.inner.state.read().approvals)
    }

    pub fn latest_approval(&self) -> Option<ClientApproval> {
        self.inner.state.read().latest_approval().cloned()
    }

    pub fn flows_page_size(&self) -> usize {
        self.inner.state.read().flows_page_size
    }

    pub fn flows(&self) -> Arc<Vec<Flow>> {
        Arc::clone(&self.inner.state.read().flows)
    }

    pub fn has_more_flows(&self) -> bool {
        self.inner.state.read().has_more_flows()
    }

    pub fn flow(&self, flow_id: &str) -> Option<Flow> {
        self.inner.state.read().flow(flow_id).cloned()
    }

    pub fn flow_results(&self, flow_id: &str) -> Option<FlowResults> {
        self.inner.state.read().flow_results(flow_id).cloned()
    }

    pub fn scheduled_flows(&self) -> Arc<Vec<ScheduledFlow>> {
        Arc::clone(&self.inner.state.read().scheduled_flows)
    }

    pub fn current_user(&self) -> Option<String> {
        self.inner.state.read().current_user.clone()
    }

    pub fn client_history(&self) -> Vec<ClientHistoryEntry> {
        let state = self.inner.state.read();
        merge_history(&state.snapshots, &state.startup_infos)
    }

    pub fn refresh_flows_signal(&self) -> u64 {
        *self.inner.flows_signal.borrow()
    }

    pub fn refresh_scheduled_flows_signal(&self) -> u64 {
        *self.inner.scheduled_flows_signal.borrow()
    }

    /// Change notifications, one per applied update.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    /// Failures of background loops and one-shot fetches.
    pub fn errors(&self) -> broadcast::Receiver<SyncError> {
        self.inner.errors.subscribe()
    }
}

impl Drop for ClientStore {
    fn drop(&mut self) {
        self.destroy();
    }
}
