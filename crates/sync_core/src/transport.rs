use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ApprovalId, ScopeId},
    error::ErrorBody,
    protocol::{
        ApprovalDecision, ApprovalRequest, CreateMessageRequest, MarkReadRequest, Message,
        NotificationEvent, ResolveApprovalRequest,
    },
};

use crate::error::ApiFailure;

/// Header carrying the opaque caller identity token on every request.
pub const IDENTITY_TOKEN_HEADER: &str = "x-identity-token";

/// Pull-based half of the backend contract. The engine only ever talks to the
/// backend through this seam, so tests can substitute programmable doubles.
#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn fetch_messages(&self, scope_id: ScopeId) -> Result<Vec<Message>, ApiFailure>;
    async fn create_message(&self, request: CreateMessageRequest) -> Result<Message, ApiFailure>;
    async fn fetch_notifications(
        &self,
        scope_ids: &[ScopeId],
    ) -> Result<Vec<NotificationEvent>, ApiFailure>;
    async fn mark_read(&self, request: MarkReadRequest) -> Result<(), ApiFailure>;
    async fn fetch_approvals(
        &self,
        scope_ids: &[ScopeId],
    ) -> Result<Vec<ApprovalRequest>, ApiFailure>;
    async fn resolve_approval(
        &self,
        approval_id: ApprovalId,
        decision: ApprovalDecision,
    ) -> Result<ApprovalRequest, ApiFailure>;
}

pub struct MissingBackend;

#[async_trait]
impl BackendApi for MissingBackend {
    async fn fetch_messages(&self, scope_id: ScopeId) -> Result<Vec<Message>, ApiFailure> {
        Err(ApiFailure::Transport(format!(
            "backend unavailable for scope {}",
            scope_id.0
        )))
    }

    async fn create_message(&self, request: CreateMessageRequest) -> Result<Message, ApiFailure> {
        Err(ApiFailure::Transport(format!(
            "backend unavailable for scope {}",
            request.scope_id.0
        )))
    }

    async fn fetch_notifications(
        &self,
        _scope_ids: &[ScopeId],
    ) -> Result<Vec<NotificationEvent>, ApiFailure> {
        Err(ApiFailure::Transport("backend unavailable".to_string()))
    }

    async fn mark_read(&self, request: MarkReadRequest) -> Result<(), ApiFailure> {
        Err(ApiFailure::Transport(format!(
            "backend unavailable for scope {}",
            request.scope_id().0
        )))
    }

    async fn fetch_approvals(
        &self,
        _scope_ids: &[ScopeId],
    ) -> Result<Vec<ApprovalRequest>, ApiFailure> {
        Err(ApiFailure::Transport("backend unavailable".to_string()))
    }

    async fn resolve_approval(
        &self,
        approval_id: ApprovalId,
        _decision: ApprovalDecision,
    ) -> Result<ApprovalRequest, ApiFailure> {
        Err(ApiFailure::Transport(format!(
            "backend unavailable for approval {}",
            approval_id.0
        )))
    }
}

/// reqwest-backed implementation of [`BackendApi`].
pub struct HttpBackend {
    http: Client,
    server_url: String,
    identity_token: String,
}

impl HttpBackend {
    pub fn new(server_url: impl Into<String>, identity_token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
            identity_token: identity_token.into(),
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http
            .get(format!("{}{path}", self.server_url))
            .header(IDENTITY_TOKEN_HEADER, &self.identity_token)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.http
            .post(format!("{}{path}", self.server_url))
            .header(IDENTITY_TOKEN_HEADER, &self.identity_token)
    }

    async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiFailure> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|err| ApiFailure::Transport(err.to_string()));
        }
        Err(Self::api_error(status, response).await)
    }

    async fn read_ok(response: Response) -> Result<(), ApiFailure> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(Self::api_error(status, response).await)
    }

    async fn api_error(status: reqwest::StatusCode, response: Response) -> ApiFailure {
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => format!("status {status}"),
        };
        ApiFailure::Api {
            status: status.as_u16(),
            message,
        }
    }

    fn scope_ids_param(scope_ids: &[ScopeId]) -> String {
        scope_ids
            .iter()
            .map(|scope_id| scope_id.0.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn fetch_messages(&self, scope_id: ScopeId) -> Result<Vec<Message>, ApiFailure> {
        let response = self
            .get(&format!("/scopes/{}/messages", scope_id.0))
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn create_message(&self, request: CreateMessageRequest) -> Result<Message, ApiFailure> {
        let response = self.post("/messages").json(&request).send().await?;
        Self::read_json(response).await
    }

    async fn fetch_notifications(
        &self,
        scope_ids: &[ScopeId],
    ) -> Result<Vec<NotificationEvent>, ApiFailure> {
        let response = self
            .get("/notifications")
            .query(&[("scope_ids", Self::scope_ids_param(scope_ids))])
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn mark_read(&self, request: MarkReadRequest) -> Result<(), ApiFailure> {
        let response = self
            .post("/notifications/read")
            .json(&request)
            .send()
            .await?;
        Self::read_ok(response).await
    }

    async fn fetch_approvals(
        &self,
        scope_ids: &[ScopeId],
    ) -> Result<Vec<ApprovalRequest>, ApiFailure> {
        let response = self
            .get("/approvals")
            .query(&[("scope_ids", Self::scope_ids_param(scope_ids))])
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn resolve_approval(
        &self,
        approval_id: ApprovalId,
        decision: ApprovalDecision,
    ) -> Result<ApprovalRequest, ApiFailure> {
        let response = self
            .post(&format!("/approvals/{}/resolve", approval_id.0))
            .json(&ResolveApprovalRequest { decision })
            .send()
            .await?;
        Self::read_json(response).await
    }
}
