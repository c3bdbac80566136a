//! Append-only audit trail of workflow actions

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::{AppError, Result};
use crate::models::{AuditAction, AuditLogEntry, Stage};

/// An audit record about to be written
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub approval_id: Option<i64>,
    pub capability_id: i64,
    pub action: AuditAction,
    pub stage: Stage,
    pub performed_by: i64,
    pub performed_at: DateTime<Utc>,
    pub details: serde_json::Value,
}

#[derive(Clone)]
pub struct AuditLog {
    pool: SqlitePool,
}

impl AuditLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append inside the caller's transaction
    pub async fn append(conn: &mut SqliteConnection, entry: NewAuditEntry) -> Result<i64> {
        let details = serde_json::to_string(&entry.details)
            .map_err(|e| AppError::Internal(format!("Invalid audit details: {}", e)))?;

        let result = sqlx::query(
            r#"
            INSERT INTO approval_audit_log
                (approval_id, capability_id, action, stage, performed_by, performed_at, details)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.approval_id)
        .bind(entry.capability_id)
        .bind(entry.action.as_str())
        .bind(entry.stage.as_str())
        .bind(entry.performed_by)
        .bind(entry.performed_at)
        .bind(details)
        .execute(&mut *conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Full trail for a capability, newest first.
    ///
    /// Rows are ordered by id, which follows commit order because SQLite
    /// admits one writer at a time.
    pub async fn for_capability(&self, capability_id: i64) -> Result<Vec<AuditLogEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT al.id, al.approval_id, al.capability_id, al.action, al.stage,
                   al.performed_by, al.performed_at, al.details, u.name AS performer_name
            FROM approval_audit_log al
            LEFT JOIN users u ON al.performed_by = u.id
            WHERE al.capability_id = ?
            ORDER BY al.id DESC
            "#,
        )
        .bind(capability_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: i64,
    approval_id: Option<i64>,
    capability_id: i64,
    action: String,
    stage: String,
    performed_by: i64,
    performed_at: DateTime<Utc>,
    details: String,
    performer_name: Option<String>,
}

impl TryFrom<AuditRow> for AuditLogEntry {
    type Error = AppError;

    fn try_from(row: AuditRow) -> Result<Self> {
        Ok(AuditLogEntry {
            id: row.id,
            approval_id: row.approval_id,
            capability_id: row.capability_id,
            action: row
                .action
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid audit action: {}", e)))?,
            stage: row
                .stage
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid stage: {}", e)))?,
            performed_by: row.performed_by,
            performer_name: row.performer_name,
            performed_at: row.performed_at,
            details: serde_json::from_str(&row.details)
                .map_err(|e| AppError::Internal(format!("Invalid audit details: {}", e)))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MIGRATOR;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");
        MIGRATOR.run(&pool).await.expect("Failed to run migrations");
        sqlx::query("INSERT INTO users (id, name) VALUES (7, 'Ada')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO capabilities (id, name) VALUES (42, 'Checkout')")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    fn entry(action: AuditAction, details: serde_json::Value) -> NewAuditEntry {
        NewAuditEntry {
            approval_id: None,
            capability_id: 42,
            action,
            stage: Stage::Design,
            performed_by: 7,
            performed_at: Utc::now(),
            details,
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let pool = setup_test_db().await;
        {
            let mut conn = pool.acquire().await.unwrap();
            AuditLog::append(
                &mut conn,
                entry(AuditAction::Rejected, json!({"stage": "design", "feedback": "no"})),
            )
            .await
            .unwrap();
        }

        let log = AuditLog::new(pool).for_capability(42).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action, AuditAction::Rejected);
        assert_eq!(log[0].stage, Stage::Design);
        assert_eq!(log[0].performer_name.as_deref(), Some("Ada"));
        assert_eq!(log[0].details["feedback"], "no");
        assert!(log[0].approval_id.is_none());
    }

    #[tokio::test]
    async fn test_newest_first() {
        let pool = setup_test_db().await;
        {
            let mut conn = pool.acquire().await.unwrap();
            for action in [
                AuditAction::Requested,
                AuditAction::Withdrawn,
                AuditAction::Requested,
            ] {
                AuditLog::append(&mut conn, entry(action, json!({}))).await.unwrap();
            }
        }

        let log = AuditLog::new(pool).for_capability(42).await.unwrap();
        let actions: Vec<AuditAction> = log.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::Requested,
                AuditAction::Withdrawn,
                AuditAction::Requested
            ]
        );
        assert!(log[0].id > log[1].id && log[1].id > log[2].id);
    }

    #[tokio::test]
    async fn test_entries_cannot_be_changed() {
        let pool = setup_test_db().await;
        let id = {
            let mut conn = pool.acquire().await.unwrap();
            AuditLog::append(&mut conn, entry(AuditAction::Requested, json!({})))
                .await
                .unwrap()
        };

        let update = sqlx::query("UPDATE approval_audit_log SET action = 'approved' WHERE id = ?")
            .bind(id)
            .execute(&pool)
            .await;
        assert!(update.is_err());

        let delete = sqlx::query("DELETE FROM approval_audit_log WHERE id = ?")
            .bind(id)
            .execute(&pool)
            .await;
        assert!(delete.is_err());
    }

    #[tokio::test]
    async fn test_other_capabilities_excluded() {
        let pool = setup_test_db().await;
        sqlx::query("INSERT INTO capabilities (id, name) VALUES (43, 'Search')")
            .execute(&pool)
            .await
            .unwrap();
        {
            let mut conn = pool.acquire().await.unwrap();
            let mut other = entry(AuditAction::Requested, json!({}));
            other.capability_id = 43;
            AuditLog::append(&mut conn, other).await.unwrap();
        }

        let log = AuditLog::new(pool).for_capability(42).await.unwrap();
        assert!(log.is_empty());
    }
}
