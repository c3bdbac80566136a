//! Persistence for capability approval records

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};

use crate::error::{AppError, Result};
use crate::models::{ApprovalStatus, CapabilityApproval, Stage};

const APPROVAL_COLUMNS: &str = r#"
    ca.id, ca.capability_id, ca.stage, ca.status, ca.requested_by, ca.requested_at,
    ca.decided_by, ca.decided_at, ca.feedback, ca.created_at, ca.updated_at,
    u1.name AS requester_name, u2.name AS decider_name
"#;

const APPROVAL_JOINS: &str = r#"
    FROM capability_approvals ca
    LEFT JOIN users u1 ON ca.requested_by = u1.id
    LEFT JOIN users u2 ON ca.decided_by = u2.id
"#;

/// The terminal transition applied to a pending approval
#[derive(Debug, Clone)]
pub struct Decision<'a> {
    pub status: ApprovalStatus,
    pub decided_by: i64,
    pub decided_at: DateTime<Utc>,
    pub feedback: Option<&'a str>,
}

/// Database store for `capability_approvals`
#[derive(Clone)]
pub struct ApprovalStore {
    pool: SqlitePool,
}

impl ApprovalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // Transaction-scoped writes

    /// Open a review. The partial unique index on pending rows turns a
    /// concurrent or repeated request into a `Conflict`.
    pub async fn insert_pending(
        conn: &mut SqliteConnection,
        capability_id: i64,
        stage: Stage,
        requested_by: i64,
        now: DateTime<Utc>,
    ) -> Result<CapabilityApproval> {
        let row = sqlx::query_as::<_, ApprovalRow>(
            r#"
            INSERT INTO capability_approvals
                (capability_id, stage, status, requested_by, requested_at, created_at, updated_at)
            VALUES (?, ?, 'pending_approval', ?, ?, ?, ?)
            RETURNING id, capability_id, stage, status, requested_by, requested_at,
                      decided_by, decided_at, feedback, created_at, updated_at,
                      NULL AS requester_name, NULL AS decider_name
            "#,
        )
        .bind(capability_id)
        .bind(stage.as_str())
        .bind(requested_by)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(format!(
                    "approval already pending for capability {} at stage {}",
                    capability_id, stage
                ))
            } else {
                AppError::Database(e)
            }
        })?;

        row.try_into()
    }

    /// Move a pending approval to its terminal status.
    ///
    /// The update only matches rows still in `pending_approval`, so of two
    /// racing deciders exactly one wins. The loser is told whether the row is
    /// missing or already decided.
    pub async fn close(
        conn: &mut SqliteConnection,
        approval_id: i64,
        decision: &Decision<'_>,
    ) -> Result<CapabilityApproval> {
        if !decision.status.is_terminal() {
            return Err(AppError::Internal(
                "pending_approval is not a terminal status".to_string(),
            ));
        }

        let row = sqlx::query_as::<_, ApprovalRow>(
            r#"
            UPDATE capability_approvals
            SET status = ?, decided_by = ?, decided_at = ?, feedback = ?, updated_at = ?
            WHERE id = ? AND status = 'pending_approval'
            RETURNING id, capability_id, stage, status, requested_by, requested_at,
                      decided_by, decided_at, feedback, created_at, updated_at,
                      NULL AS requester_name, NULL AS decider_name
            "#,
        )
        .bind(decision.status.as_str())
        .bind(decision.decided_by)
        .bind(decision.decided_at)
        .bind(decision.feedback)
        .bind(decision.decided_at)
        .bind(approval_id)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => match Self::find(&mut *conn, approval_id).await? {
                None => Err(AppError::NotFound(format!(
                    "Approval {} not found",
                    approval_id
                ))),
                Some(existing) => Err(AppError::InvalidState(format!(
                    "approval {} is {}, not pending_approval",
                    approval_id,
                    existing.status.as_str()
                ))),
            },
        }
    }

    // Reads

    /// Look up an approval with requester/decider names
    pub async fn find<'e, E>(executor: E, approval_id: i64) -> Result<Option<CapabilityApproval>>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT {} {} WHERE ca.id = ?",
            APPROVAL_COLUMNS, APPROVAL_JOINS
        );
        sqlx::query_as::<_, ApprovalRow>(&sql)
            .bind(approval_id)
            .fetch_optional(executor)
            .await?
            .map(TryInto::try_into)
            .transpose()
    }

    /// Most recent review opened for `stage` of a capability.
    ///
    /// At most one row per stage can be pending, and a pending row blocks any
    /// newer one, so a pending review is always the latest.
    pub async fn latest_for_stage<'e, E>(
        executor: E,
        capability_id: i64,
        stage: Stage,
    ) -> Result<Option<CapabilityApproval>>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT {} {} WHERE ca.capability_id = ? AND ca.stage = ? ORDER BY ca.id DESC LIMIT 1",
            APPROVAL_COLUMNS, APPROVAL_JOINS
        );
        sqlx::query_as::<_, ApprovalRow>(&sql)
            .bind(capability_id)
            .bind(stage.as_str())
            .fetch_optional(executor)
            .await?
            .map(TryInto::try_into)
            .transpose()
    }

    pub async fn get_approval(&self, approval_id: i64) -> Result<CapabilityApproval> {
        Self::find(&self.pool, approval_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Approval {} not found", approval_id)))
    }

    /// Every open review, oldest request first, with its capability's name
    pub async fn pending_with_capability(&self) -> Result<Vec<(CapabilityApproval, String)>> {
        let sql = format!(
            "SELECT {}, c.name AS capability_name {} \
             LEFT JOIN capabilities c ON ca.capability_id = c.id \
             WHERE ca.status = 'pending_approval' \
             ORDER BY ca.requested_at ASC, ca.id ASC",
            APPROVAL_COLUMNS, APPROVAL_JOINS
        );
        let rows = sqlx::query_as::<_, PendingRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|r| {
                let name = r.capability_name.unwrap_or_default();
                r.approval.try_into().map(|a| (a, name))
            })
            .collect()
    }

    /// All approvals for a capability, newest first
    pub async fn history(&self, capability_id: i64) -> Result<Vec<CapabilityApproval>> {
        let sql = format!(
            "SELECT {} {} WHERE ca.capability_id = ? ORDER BY ca.id DESC",
            APPROVAL_COLUMNS, APPROVAL_JOINS
        );
        let rows = sqlx::query_as::<_, ApprovalRow>(&sql)
            .bind(capability_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

// Internal row types for sqlx

#[derive(sqlx::FromRow)]
struct ApprovalRow {
    id: i64,
    capability_id: i64,
    stage: String,
    status: String,
    requested_by: i64,
    requested_at: DateTime<Utc>,
    decided_by: Option<i64>,
    decided_at: Option<DateTime<Utc>>,
    feedback: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    requester_name: Option<String>,
    decider_name: Option<String>,
}

#[derive(sqlx::FromRow)]
struct PendingRow {
    #[sqlx(flatten)]
    approval: ApprovalRow,
    capability_name: Option<String>,
}

impl TryFrom<ApprovalRow> for CapabilityApproval {
    type Error = AppError;

    fn try_from(row: ApprovalRow) -> Result<Self> {
        Ok(CapabilityApproval {
            id: row.id,
            capability_id: row.capability_id,
            stage: row
                .stage
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid stage: {}", e)))?,
            status: row
                .status
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid status: {}", e)))?,
            requested_by: row.requested_by,
            requested_at: row.requested_at,
            requester_name: row.requester_name,
            decided_by: row.decided_by,
            decided_at: row.decided_at,
            decider_name: row.decider_name,
            feedback: row.feedback,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
