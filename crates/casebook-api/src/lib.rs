//! Asynchronous client for the Casebook case-management API.
//!
//! The session store consumes the [`CaseApi`] trait, one async operation per
//! resource. [`HttpCaseApi`] implements it over the `/api/v2` REST surface;
//! tests substitute scripted implementations.

use async_trait::async_trait;

pub mod error;
mod http;
pub mod models;

pub use error::{ApiError, ApiResult};
pub use http::{ApiConfig, HttpCaseApi, URL_PREFIX};
pub use models::*;
pub use reqwest::StatusCode;

#[async_trait]
pub trait CaseApi: Send + Sync {
    async fn fetch_client(&self, client_id: &str) -> ApiResult<Client>;

    /// `Ok(false)` when the server denies access; only transport and server
    /// failures are errors.
    async fn verify_client_access(&self, client_id: &str) -> ApiResult<bool>;

    async fn list_client_approvals(&self, client_id: &str) -> ApiResult<Vec<ClientApproval>>;

    async fn request_client_approval(
        &self,
        request: ClientApprovalRequest,
    ) -> ApiResult<ClientApproval>;

    /// Snapshots in server order, oldest first.
    async fn fetch_client_snapshots(&self, client_id: &str) -> ApiResult<Vec<ClientSnapshot>>;

    /// Startup records in server order, oldest first.
    async fn fetch_client_startup_infos(&self, client_id: &str) -> ApiResult<Vec<StartupInfo>>;

    async fn add_client_label(&self, client_id: &str, label: &str) -> ApiResult<()>;

    async fn remove_client_label(&self, client_id: &str, label: &str) -> ApiResult<()>;

    async fn list_flows(&self, args: ListFlowsArgs) -> ApiResult<Vec<Flow>>;

    async fn fetch_flow(&self, client_id: &str, flow_id: &str) -> ApiResult<Flow>;

    async fn list_flow_results(&self, params: FlowResultsParams)
        -> ApiResult<ListFlowResultsResult>;

    async fn list_scheduled_flows(
        &self,
        client_id: &str,
        creator: &str,
    ) -> ApiResult<Vec<ScheduledFlow>>;

    async fn start_flow(&self, client_id: &str, args: StartFlowArgs) -> ApiResult<Flow>;

    async fn schedule_flow(&self, client_id: &str, args: StartFlowArgs)
        -> ApiResult<ScheduledFlow>;

    async fn cancel_flow(&self, client_id: &str, flow_id: &str) -> ApiResult<()>;

    async fn unschedule_flow(&self, client_id: &str, scheduled_flow_id: &str) -> ApiResult<()>;

    async fn fetch_current_user(&self) -> ApiResult<CurrentUser>;
}
