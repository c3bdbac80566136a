//! HTTP surface over the approval workflow

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::models::{
    Actor, ApprovalDecisionRequest, ApprovalHistory, AuditLogResponse, Capability,
    CapabilityApproval, PendingApprovals, RequestApprovalRequest, Stage, UserPermissions,
    WorkflowRulesResponse,
};
use crate::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/approvals/request", post(request_approval))
        .route("/approvals/pending", get(pending_approvals))
        .route("/approvals/rules", get(workflow_rules))
        .route("/approvals/:id", get(get_approval))
        .route("/approvals/:id/approve", post(approve))
        .route("/approvals/:id/reject", post(reject))
        .route("/approvals/:id/withdraw", post(withdraw))
        .route("/approval-permissions/:role", get(user_permissions))
        .route("/capabilities/:id/approvals", get(approval_history))
        .route("/capabilities/:id/audit-log", get(audit_log))
        .route("/capabilities/:id/advance", post(advance_stage))
        .with_state(state)
}

/// Identity is resolved upstream and forwarded as headers
#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        actor_from_headers(&parts.headers)
    }
}

fn actor_from_headers(headers: &HeaderMap) -> Result<Actor> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::Unauthenticated(format!("missing {} header", name)))
    };

    let user_id = header(USER_ID_HEADER)?
        .parse::<i64>()
        .map_err(|_| AppError::Unauthenticated(format!("invalid {} header", USER_ID_HEADER)))?;
    let role = header(USER_ROLE_HEADER)?;

    Ok(Actor::new(user_id, role))
}

async fn health() -> &'static str {
    "ok"
}

async fn request_approval(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(req): Json<RequestApprovalRequest>,
) -> Result<impl IntoResponse> {
    let stage: Stage = req.stage.parse().map_err(AppError::Validation)?;
    let approval = state
        .workflow
        .request_approval(req.capability_id, stage, &actor)
        .await?;
    Ok((StatusCode::CREATED, Json(approval)))
}

async fn pending_approvals(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> Result<Json<PendingApprovals>> {
    Ok(Json(state.workflow.pending_approvals(&actor).await?))
}

async fn workflow_rules(
    State(state): State<Arc<AppState>>,
    _actor: Actor,
) -> Result<Json<WorkflowRulesResponse>> {
    let rules = state.workflow.workflow_rules().await?;
    Ok(Json(WorkflowRulesResponse { rules }))
}

async fn get_approval(
    State(state): State<Arc<AppState>>,
    _actor: Actor,
    Path(id): Path<i64>,
) -> Result<Json<CapabilityApproval>> {
    Ok(Json(state.workflow.approval(id).await?))
}

async fn approve(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<i64>,
    body: Option<Json<ApprovalDecisionRequest>>,
) -> Result<Json<CapabilityApproval>> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let approval = state
        .workflow
        .approve(id, &actor, req.feedback.as_deref())
        .await?;
    Ok(Json(approval))
}

async fn reject(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<i64>,
    body: Option<Json<ApprovalDecisionRequest>>,
) -> Result<Json<CapabilityApproval>> {
    let feedback = body.and_then(|Json(b)| b.feedback).unwrap_or_default();
    let approval = state.workflow.reject(id, &actor, &feedback).await?;
    Ok(Json(approval))
}

async fn withdraw(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<i64>,
) -> Result<Json<CapabilityApproval>> {
    Ok(Json(state.workflow.withdraw(id, &actor).await?))
}

async fn user_permissions(
    State(state): State<Arc<AppState>>,
    _actor: Actor,
    Path(role): Path<String>,
) -> Result<Json<UserPermissions>> {
    Ok(Json(state.workflow.user_permissions(&role).await?))
}

async fn approval_history(
    State(state): State<Arc<AppState>>,
    _actor: Actor,
    Path(id): Path<i64>,
) -> Result<Json<ApprovalHistory>> {
    Ok(Json(state.workflow.approval_history(id).await?))
}

async fn audit_log(
    State(state): State<Arc<AppState>>,
    _actor: Actor,
    Path(id): Path<i64>,
) -> Result<Json<AuditLogResponse>> {
    let audit_log = state.workflow.audit_log(id).await?;
    Ok(Json(AuditLogResponse {
        capability_id: id,
        audit_log,
    }))
}

async fn advance_stage(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<i64>,
) -> Result<Json<Capability>> {
    Ok(Json(state.workflow.advance_stage(id, &actor).await?))
}
