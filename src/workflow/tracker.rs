//! Denormalized stage and approval status on the capability row

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};

use crate::error::{AppError, Result};
use crate::models::{Capability, CapabilityStatus, Stage};

/// Partial update of the workflow-owned capability columns.
///
/// `None` leaves a column untouched. Every patch is applied by the same
/// parameterized statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityPatch {
    pub current_stage: Option<Stage>,
    pub approval_status: Option<CapabilityStatus>,
    pub approved_by: Option<i64>,
    pub approved_at: Option<DateTime<Utc>>,
}

impl CapabilityPatch {
    /// A review was opened for `stage`
    pub fn requested(stage: Stage) -> Self {
        Self {
            current_stage: Some(stage),
            approval_status: Some(CapabilityStatus::PendingApproval),
            ..Self::default()
        }
    }

    pub fn approved(by: i64, at: DateTime<Utc>) -> Self {
        Self {
            approval_status: Some(CapabilityStatus::Approved),
            approved_by: Some(by),
            approved_at: Some(at),
            ..Self::default()
        }
    }

    pub fn status(status: CapabilityStatus) -> Self {
        Self {
            approval_status: Some(status),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct StageTracker {
    pool: SqlitePool,
}

impl StageTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply `patch` inside the caller's transaction
    pub async fn apply(
        conn: &mut SqliteConnection,
        capability_id: i64,
        patch: &CapabilityPatch,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if Self::update(conn, capability_id, None, patch, now).await? == 0 {
            return Err(AppError::NotFound(format!(
                "Capability {} not found",
                capability_id
            )));
        }

        Ok(())
    }

    /// Apply `patch` only while the capability is still at `stage`.
    ///
    /// A decision on a review for some other stage must not overwrite the
    /// status of the stage the capability is actually in. Returns false when
    /// the capability has moved to a different stage.
    pub async fn apply_at(
        conn: &mut SqliteConnection,
        capability_id: i64,
        stage: Stage,
        patch: &CapabilityPatch,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = Self::update(conn, capability_id, Some(stage), patch, now).await? == 1;
        if !updated {
            tracing::debug!(capability_id, %stage, "Capability no longer at decided stage");
        }
        Ok(updated)
    }

    async fn update(
        conn: &mut SqliteConnection,
        capability_id: i64,
        only_at: Option<Stage>,
        patch: &CapabilityPatch,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let only_at = only_at.map(|s| s.as_str());
        let result = sqlx::query(
            r#"
            UPDATE capabilities
            SET current_stage = COALESCE(?, current_stage),
                approval_status = COALESCE(?, approval_status),
                approved_by = COALESCE(?, approved_by),
                approved_at = COALESCE(?, approved_at),
                updated_at = ?
            WHERE id = ? AND (? IS NULL OR current_stage = ?)
            "#,
        )
        .bind(patch.current_stage.map(|s| s.as_str()))
        .bind(patch.approval_status.map(|s| s.as_str()))
        .bind(patch.approved_by)
        .bind(patch.approved_at)
        .bind(now)
        .bind(capability_id)
        .bind(only_at)
        .bind(only_at)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    /// Move an approved capability from `from` to `to`.
    ///
    /// Guarded on the stage and status the caller observed; returns false
    /// when either changed underneath it.
    pub async fn advance(
        conn: &mut SqliteConnection,
        capability_id: i64,
        from: Stage,
        to: Stage,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !Stage::can_transition(from, to) {
            return Err(AppError::InvalidState(format!(
                "cannot move from {} to {}",
                from, to
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE capabilities
            SET current_stage = ?, approval_status = 'draft', updated_at = ?
            WHERE id = ? AND current_stage = ? AND approval_status = 'approved'
            "#,
        )
        .bind(to.as_str())
        .bind(now)
        .bind(capability_id)
        .bind(from.as_str())
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn find<'e, E>(executor: E, capability_id: i64) -> Result<Option<Capability>>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, CapabilityRow>(
            r#"
            SELECT id, name, current_stage, approval_status, approved_by, approved_at, updated_at
            FROM capabilities
            WHERE id = ?
            "#,
        )
        .bind(capability_id)
        .fetch_optional(executor)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    pub async fn get(&self, capability_id: i64) -> Result<Capability> {
        Self::find(&self.pool, capability_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Capability {} not found", capability_id)))
    }
}

#[derive(sqlx::FromRow)]
struct CapabilityRow {
    id: i64,
    name: String,
    current_stage: String,
    approval_status: String,
    approved_by: Option<i64>,
    approved_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CapabilityRow> for Capability {
    type Error = AppError;

    fn try_from(row: CapabilityRow) -> Result<Self> {
        Ok(Capability {
            id: row.id,
            name: row.name,
            current_stage: row
                .current_stage
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid stage: {}", e)))?,
            approval_status: row
                .approval_status
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid capability status: {}", e)))?,
            approved_by: row.approved_by,
            approved_at: row.approved_at,
            updated_at: row.updated_at,
        })
    }
}
