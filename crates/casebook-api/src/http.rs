use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ApiError, ApiResult};
use crate::models::{
    Client, ClientApproval, ClientApprovalRequest, ClientSnapshot, CurrentUser, Flow,
    FlowResultsParams, ListFlowResultsResult, ListFlowsArgs, ScheduledFlow, StartFlowArgs,
    StartupInfo,
};
use crate::CaseApi;

/// Common prefix for all API calls.
pub const URL_PREFIX: &str = "/api/v2";

/// Responses may be prefixed to defeat JSON hijacking; the prefix is not JSON.
const XSSI_PREFIX: &str = ")]}'\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
}

#[derive(Clone)]
pub struct HttpCaseApi {
    http: HttpClient,
    base_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct Items<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LabelsArgs<'a> {
    client_ids: [&'a str; 1],
    labels: [&'a str; 1],
}

impl HttpCaseApi {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http: HttpClient::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn from_config(config: &ApiConfig) -> Self {
        Self::new(config.base_url.clone(), config.token.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, URL_PREFIX, path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, resource: &str) -> ApiResult<Response> {
        let res = self.authorize(builder).send().await?;
        let status = res.status();
        debug!(target: "casebook.api", resource, status = %status, "api response");
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        match status {
            StatusCode::FORBIDDEN => Err(ApiError::MissingApproval {
                message: if body.is_empty() {
                    format!("access to {resource} denied")
                } else {
                    body
                },
            }),
            StatusCode::NOT_FOUND => Err(ApiError::NotFound {
                resource: resource.to_string(),
            }),
            _ => Err(ApiError::UnexpectedStatus { status, body }),
        }
    }

    async fn decode<T: DeserializeOwned>(res: Response) -> ApiResult<T> {
        let text = res.text().await?;
        let json = text.strip_prefix(XSSI_PREFIX).unwrap_or(&text);
        Ok(serde_json::from_str(json)?)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> ApiResult<T> {
        let builder = self.http.get(self.url(path)).query(query);
        let res = self.send(builder, path).await?;
        Self::decode(res).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ApiResult<T> {
        let builder = self.http.post(self.url(path)).json(body);
        let res = self.send(builder, path).await?;
        Self::decode(res).await
    }

    async fn post_ack<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> ApiResult<()> {
        let builder = self.http.post(self.url(path)).json(body);
        self.send(builder, path).await.map(|_| ())
    }

    /// Snapshot and startup history are requested from one second after the
    /// epoch up to now, in microseconds.
    fn history_range() -> Vec<(&'static str, String)> {
        let end_us = Utc::now().timestamp_micros();
        vec![
            ("start", "1000000".to_string()),
            ("end", end_us.to_string()),
        ]
    }
}

#[async_trait]
impl CaseApi for HttpCaseApi {
    async fn fetch_client(&self, client_id: &str) -> ApiResult<Client> {
        self.get_json(&format!("/clients/{client_id}"), &[]).await
    }

    async fn verify_client_access(&self, client_id: &str) -> ApiResult<bool> {
        let path = format!("/clients/{client_id}/access");
        let builder = self.http.head(self.url(&path));
        match self.send(builder, &path).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_access_denied() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn list_client_approvals(&self, client_id: &str) -> ApiResult<Vec<ClientApproval>> {
        let items: Items<ClientApproval> = self
            .get_json(&format!("/users/me/approvals/client/{client_id}"), &[])
            .await?;
        Ok(items.items)
    }

    async fn request_client_approval(
        &self,
        request: ClientApprovalRequest,
    ) -> ApiResult<ClientApproval> {
        let path = format!("/users/me/approvals/client/{}", request.client_id);
        self.post_json(&path, &request).await
    }

    async fn fetch_client_snapshots(&self, client_id: &str) -> ApiResult<Vec<ClientSnapshot>> {
        let items: Items<ClientSnapshot> = self
            .get_json(
                &format!("/clients/{client_id}/snapshots"),
                &Self::history_range(),
            )
            .await?;
        Ok(items.items)
    }

    async fn fetch_client_startup_infos(&self, client_id: &str) -> ApiResult<Vec<StartupInfo>> {
        let mut query = Self::history_range();
        query.push(("exclude_snapshot_collections", "true".to_string()));
        let items: Items<StartupInfo> = self
            .get_json(&format!("/clients/{client_id}/startup-infos"), &query)
            .await?;
        Ok(items.items)
    }

    async fn add_client_label(&self, client_id: &str, label: &str) -> ApiResult<()> {
        let body = LabelsArgs {
            client_ids: [client_id],
            labels: [label],
        };
        self.post_ack("/clients/labels/add", &body).await
    }

    async fn remove_client_label(&self, client_id: &str, label: &str) -> ApiResult<()> {
        let body = LabelsArgs {
            client_ids: [client_id],
            labels: [label],
        };
        self.post_ack("/clients/labels/remove", &body).await
    }

    async fn list_flows(&self, args: ListFlowsArgs) -> ApiResult<Vec<Flow>> {
        let query = [
            ("count", args.count.to_string()),
            ("top_flows_only", args.top_flows_only.to_string()),
        ];
        let items: Items<Flow> = self
            .get_json(&format!("/clients/{}/flows", args.client_id), &query)
            .await?;
        Ok(items.items)
    }

    async fn fetch_flow(&self, client_id: &str, flow_id: &str) -> ApiResult<Flow> {
        self.get_json(&format!("/clients/{client_id}/flows/{flow_id}"), &[])
            .await
    }

    async fn list_flow_results(
        &self,
        params: FlowResultsParams,
    ) -> ApiResult<ListFlowResultsResult> {
        let mut query = vec![
            ("offset", params.offset.to_string()),
            ("count", params.count.to_string()),
        ];
        if let Some(tag) = params.with_tag.filter(|tag| !tag.is_empty()) {
            query.push(("with_tag", tag));
        }
        if let Some(kind) = params.with_type.filter(|kind| !kind.is_empty()) {
            query.push(("with_type", kind));
        }
        let path = format!(
            "/clients/{}/flows/{}/results",
            params.client_id, params.flow_id
        );
        self.get_json(&path, &query).await
    }

    async fn list_scheduled_flows(
        &self,
        client_id: &str,
        creator: &str,
    ) -> ApiResult<Vec<ScheduledFlow>> {
        let items: Items<ScheduledFlow> = self
            .get_json(&format!("/clients/{client_id}/scheduled-flows/{creator}"), &[])
            .await?;
        Ok(items.items)
    }

    async fn start_flow(&self, client_id: &str, args: StartFlowArgs) -> ApiResult<Flow> {
        self.post_json(&format!("/clients/{client_id}/flows"), &args)
            .await
    }

    async fn schedule_flow(&self, client_id: &str, args: StartFlowArgs) -> ApiResult<ScheduledFlow> {
        self.post_json(&format!("/clients/{client_id}/scheduled-flows"), &args)
            .await
    }

    async fn cancel_flow(&self, client_id: &str, flow_id: &str) -> ApiResult<()> {
        let path = format!("/clients/{client_id}/flows/{flow_id}/actions/cancel");
        self.post_ack(&path, &serde_json::json!({})).await
    }

    async fn unschedule_flow(&self, client_id: &str, scheduled_flow_id: &str) -> ApiResult<()> {
        let path = format!("/clients/{client_id}/scheduled-flows/{scheduled_flow_id}");
        let builder = self.http.delete(self.url(&path));
        self.send(builder, &path).await.map(|_| ())
    }

    async fn fetch_current_user(&self) -> ApiResult<CurrentUser> {
        self.get_json("/users/me", &[]).await
    }
}
