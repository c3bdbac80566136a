//! Approval workflow orchestration
//!
//! Each mutating operation runs in one transaction that writes first and
//! validates after: the approval or capability row is updated (claiming
//! SQLite's write lock), then permissions and ownership are checked against
//! what was written. Any failure drops the transaction, which rolls back the
//! approval row, the capability mirror and the audit entry together.

use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::future::Future;

use super::audit::{AuditLog, NewAuditEntry};
use super::permissions::{self, PermissionResolver};
use super::tracker::{CapabilityPatch, StageTracker};
use crate::config::{StageAdvancePolicy, WorkflowConfig};
use crate::error::{AppError, Result};
use crate::models::{
    Actor, ApprovalHistory, ApprovalStatus, ApprovalView, AuditAction, AuditLogEntry, Capability,
    CapabilityApproval, CapabilityStatus, PendingApprovals, Stage, UserPermissions, WorkflowRule,
};
use crate::store::{ApprovalStore, Decision};

pub struct ApprovalWorkflow {
    pool: SqlitePool,
    store: ApprovalStore,
    audit: AuditLog,
    tracker: StageTracker,
    config: WorkflowConfig,
}

impl ApprovalWorkflow {
    pub fn new(pool: SqlitePool, config: WorkflowConfig) -> Self {
        Self {
            store: ApprovalStore::new(pool.clone()),
            audit: AuditLog::new(pool.clone()),
            tracker: StageTracker::new(pool.clone()),
            pool,
            config,
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Run `operation` under the configured deadline. On expiry the future is
    /// dropped mid-flight, and with it any open transaction.
    async fn with_deadline<T>(
        &self,
        name: &'static str,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.operation_timeout, operation).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(operation = name, timeout = ?self.config.operation_timeout, "Workflow operation timed out");
                Err(AppError::Timeout(format!(
                    "{} exceeded {:?}",
                    name, self.config.operation_timeout
                )))
            }
        }
    }

    /// Open a review of `capability_id` at `stage`
    pub async fn request_approval(
        &self,
        capability_id: i64,
        stage: Stage,
        actor: &Actor,
    ) -> Result<CapabilityApproval> {
        self.with_deadline("request_approval", async {
            let now = Utc::now();
            let mut tx = self.pool.begin().await?;

            StageTracker::apply(&mut tx, capability_id, &CapabilityPatch::requested(stage), now)
                .await?;

            let permissions = PermissionResolver::load(&mut *tx, &actor.role).await?;
            if !permissions.can_request(stage) {
                return Err(forbidden(actor, "request approval", stage));
            }

            let approval =
                ApprovalStore::insert_pending(&mut tx, capability_id, stage, actor.user_id, now)
                    .await
                    .map_err(|e| {
                        if matches!(e, AppError::Conflict(_)) {
                            tracing::warn!(capability_id, %stage, "Approval already pending");
                        }
                        e
                    })?;

            AuditLog::append(
                &mut tx,
                NewAuditEntry {
                    approval_id: Some(approval.id),
                    capability_id,
                    action: AuditAction::Requested,
                    stage,
                    performed_by: actor.user_id,
                    performed_at: now,
                    details: json!({ "stage": stage.as_str() }),
                },
            )
            .await?;

            tx.commit().await?;

            tracing::info!(
                approval_id = approval.id,
                capability_id,
                %stage,
                requested_by = actor.user_id,
                "Approval requested"
            );

            self.store.get_approval(approval.id).await
        })
        .await
    }

    /// Grant a pending approval
    pub async fn approve(
        &self,
        approval_id: i64,
        actor: &Actor,
        feedback: Option<&str>,
    ) -> Result<CapabilityApproval> {
        let feedback = feedback.map(str::trim).filter(|f| !f.is_empty());

        self.with_deadline("approve", async {
            let now = Utc::now();
            let mut tx = self.pool.begin().await?;

            let approval = ApprovalStore::close(
                &mut tx,
                approval_id,
                &Decision {
                    status: ApprovalStatus::Approved,
                    decided_by: actor.user_id,
                    decided_at: now,
                    feedback,
                },
            )
            .await?;

            let permissions = PermissionResolver::load(&mut *tx, &actor.role).await?;
            if !permissions.can_approve(approval.stage) {
                return Err(forbidden(actor, "approve", approval.stage));
            }

            let at_stage = StageTracker::apply_at(
                &mut tx,
                approval.capability_id,
                approval.stage,
                &CapabilityPatch::approved(actor.user_id, now),
                now,
            )
            .await?;

            AuditLog::append(
                &mut tx,
                NewAuditEntry {
                    approval_id: Some(approval.id),
                    capability_id: approval.capability_id,
                    action: AuditAction::Approved,
                    stage: approval.stage,
                    performed_by: actor.user_id,
                    performed_at: now,
                    details: json!({
                        "stage": approval.stage.as_str(),
                        "feedback": feedback.unwrap_or_default(),
                    }),
                },
            )
            .await?;

            // A stale review for an earlier stage never moves the capability
            let next = approval.stage.next().filter(|_| at_stage);
            if let (StageAdvancePolicy::Auto, Some(next)) = (self.config.stage_advance, next) {
                if StageTracker::advance(&mut tx, approval.capability_id, approval.stage, next, now)
                    .await?
                {
                    AuditLog::append(
                        &mut tx,
                        NewAuditEntry {
                            approval_id: None,
                            capability_id: approval.capability_id,
                            action: AuditAction::Advanced,
                            stage: next,
                            performed_by: actor.user_id,
                            performed_at: now,
                            details: json!({
                                "from": approval.stage.as_str(),
                                "to": next.as_str(),
                            }),
                        },
                    )
                    .await?;
                }
            }

            tx.commit().await?;

            tracing::info!(
                approval_id,
                capability_id = approval.capability_id,
                stage = %approval.stage,
                decided_by = actor.user_id,
                "Approval granted"
            );

            self.store.get_approval(approval_id).await
        })
        .await
    }

    /// Turn down a pending approval; feedback is mandatory
    pub async fn reject(
        &self,
        approval_id: i64,
        actor: &Actor,
        feedback: &str,
    ) -> Result<CapabilityApproval> {
        let feedback = feedback.trim();
        if feedback.is_empty() {
            return Err(AppError::Validation(
                "feedback is required when rejecting".to_string(),
            ));
        }

        self.with_deadline("reject", async {
            let now = Utc::now();
            let mut tx = self.pool.begin().await?;

            let approval = ApprovalStore::close(
                &mut tx,
                approval_id,
                &Decision {
                    status: ApprovalStatus::Rejected,
                    decided_by: actor.user_id,
                    decided_at: now,
                    feedback: Some(feedback),
                },
            )
            .await?;

            let permissions = PermissionResolver::load(&mut *tx, &actor.role).await?;
            if !permissions.can_reject(approval.stage) {
                return Err(forbidden(actor, "reject", approval.stage));
            }

            // Stage stays put so the capability can be reworked
            StageTracker::apply_at(
                &mut tx,
                approval.capability_id,
                approval.stage,
                &CapabilityPatch::status(CapabilityStatus::Rejected),
                now,
            )
            .await?;

            AuditLog::append(
                &mut tx,
                NewAuditEntry {
                    approval_id: Some(approval.id),
                    capability_id: approval.capability_id,
                    action: AuditAction::Rejected,
                    stage: approval.stage,
                    performed_by: actor.user_id,
                    performed_at: now,
                    details: json!({
                        "stage": approval.stage.as_str(),
                        "feedback": feedback,
                    }),
                },
            )
            .await?;

            tx.commit().await?;

            tracing::info!(
                approval_id,
                capability_id = approval.capability_id,
                stage = %approval.stage,
                decided_by = actor.user_id,
                "Approval rejected"
            );

            self.store.get_approval(approval_id).await
        })
        .await
    }

    /// Pull back a pending request; only its requester may do so
    pub async fn withdraw(&self, approval_id: i64, actor: &Actor) -> Result<CapabilityApproval> {
        self.with_deadline("withdraw", async {
            let now = Utc::now();
            let mut tx = self.pool.begin().await?;

            let approval = ApprovalStore::close(
                &mut tx,
                approval_id,
                &Decision {
                    status: ApprovalStatus::Withdrawn,
                    decided_by: actor.user_id,
                    decided_at: now,
                    feedback: None,
                },
            )
            .await?;

            if approval.requested_by != actor.user_id {
                tracing::warn!(
                    approval_id,
                    user_id = actor.user_id,
                    requested_by = approval.requested_by,
                    "Withdraw refused"
                );
                return Err(AppError::Forbidden(
                    "only the requester can withdraw an approval request".to_string(),
                ));
            }

            StageTracker::apply_at(
                &mut tx,
                approval.capability_id,
                approval.stage,
                &CapabilityPatch::status(CapabilityStatus::Draft),
                now,
            )
            .await?;

            AuditLog::append(
                &mut tx,
                NewAuditEntry {
                    approval_id: Some(approval.id),
                    capability_id: approval.capability_id,
                    action: AuditAction::Withdrawn,
                    stage: approval.stage,
                    performed_by: actor.user_id,
                    performed_at: now,
                    details: json!({ "stage": approval.stage.as_str() }),
                },
            )
            .await?;

            tx.commit().await?;

            tracing::info!(
                approval_id,
                capability_id = approval.capability_id,
                stage = %approval.stage,
                "Approval withdrawn"
            );

            self.store.get_approval(approval_id).await
        })
        .await
    }

    /// Promote an approved capability to its next stage
    pub async fn advance_stage(&self, capability_id: i64, actor: &Actor) -> Result<Capability> {
        self.with_deadline("advance_stage", async {
            let now = Utc::now();
            let mut tx = self.pool.begin().await?;

            let capability = StageTracker::find(&mut *tx, capability_id)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("Capability {} not found", capability_id))
                })?;

            if capability.approval_status != CapabilityStatus::Approved {
                return Err(AppError::InvalidState(format!(
                    "capability {} is {}, not approved",
                    capability_id,
                    capability.approval_status.as_str()
                )));
            }

            let from = capability.current_stage;

            // The most recent review of the current stage must be the granted one
            match ApprovalStore::latest_for_stage(&mut *tx, capability_id, from).await? {
                Some(review) if review.status == ApprovalStatus::Approved => {}
                Some(review) => {
                    return Err(AppError::InvalidState(format!(
                        "latest {} review {} for capability {} is {}",
                        from,
                        review.id,
                        capability_id,
                        review.status.as_str()
                    )))
                }
                None => {
                    return Err(AppError::InvalidState(format!(
                        "capability {} has no approved {} review",
                        capability_id, from
                    )))
                }
            }

            let to = from.next().ok_or_else(|| {
                AppError::InvalidState(format!(
                    "capability {} is already at the final stage",
                    capability_id
                ))
            })?;

            let permissions = PermissionResolver::load(&mut *tx, &actor.role).await?;
            if !permissions.can_request(to) {
                return Err(forbidden(actor, "advance to", to));
            }

            if !StageTracker::advance(&mut tx, capability_id, from, to, now).await? {
                return Err(AppError::InvalidState(format!(
                    "capability {} changed while advancing",
                    capability_id
                )));
            }

            AuditLog::append(
                &mut tx,
                NewAuditEntry {
                    approval_id: None,
                    capability_id,
                    action: AuditAction::Advanced,
                    stage: to,
                    performed_by: actor.user_id,
                    performed_at: now,
                    details: json!({ "from": from.as_str(), "to": to.as_str() }),
                },
            )
            .await?;

            tx.commit().await?;

            tracing::info!(capability_id, %from, %to, "Capability advanced");

            self.tracker.get(capability_id).await
        })
        .await
    }

    // Queries

    /// Every open review, oldest first, with what `actor` may do about each
    pub async fn pending_approvals(&self, actor: &Actor) -> Result<PendingApprovals> {
        self.with_deadline("pending_approvals", async {
            let permissions = PermissionResolver::load(&self.pool, &actor.role).await?;
            let pending = self.store.pending_with_capability().await?;

            let mut by_stage: HashMap<Stage, usize> = HashMap::new();
            let approvals: Vec<ApprovalView> = pending
                .into_iter()
                .map(|(approval, capability_name)| {
                    *by_stage.entry(approval.stage).or_default() += 1;
                    ApprovalView {
                        can_approve: permissions.can_approve(approval.stage),
                        can_reject: permissions.can_reject(approval.stage),
                        can_withdraw: approval.requested_by == actor.user_id,
                        capability_name,
                        approval,
                    }
                })
                .collect();

            Ok(PendingApprovals {
                total_count: approvals.len(),
                approvals,
                by_stage,
            })
        })
        .await
    }

    pub async fn approval(&self, approval_id: i64) -> Result<CapabilityApproval> {
        self.with_deadline("approval", self.store.get_approval(approval_id))
            .await
    }

    /// Approvals newest first, with the capability's current mirror and audit trail
    pub async fn approval_history(&self, capability_id: i64) -> Result<ApprovalHistory> {
        self.with_deadline("approval_history", async {
            let capability = self.tracker.get(capability_id).await?;
            let approvals = self.store.history(capability_id).await?;
            let audit_log = self.audit.for_capability(capability_id).await?;

            Ok(ApprovalHistory {
                capability_id,
                capability_name: capability.name,
                current_stage: capability.current_stage,
                current_status: capability.approval_status,
                approvals,
                audit_log,
            })
        })
        .await
    }

    pub async fn audit_log(&self, capability_id: i64) -> Result<Vec<AuditLogEntry>> {
        self.with_deadline("audit_log", self.audit.for_capability(capability_id))
            .await
    }

    pub async fn workflow_rules(&self) -> Result<Vec<WorkflowRule>> {
        self.with_deadline("workflow_rules", permissions::workflow_rules(&self.pool))
            .await
    }

    pub async fn user_permissions(&self, role: &str) -> Result<UserPermissions> {
        self.with_deadline("user_permissions", async {
            let resolver = PermissionResolver::load(&self.pool, role).await?;
            Ok(resolver.user_permissions())
        })
        .await
    }
}

fn forbidden(actor: &Actor, action: &str, stage: Stage) -> AppError {
    tracing::warn!(
        user_id = actor.user_id,
        role = %actor.role,
        action,
        %stage,
        "Permission denied"
    );
    AppError::Forbidden(format!(
        "role '{}' may not {} at stage {}",
        actor.role, action, stage
    ))
}
