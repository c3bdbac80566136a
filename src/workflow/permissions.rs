//! Role-based permission resolution over workflow rules
//!
//! A rule applies either to one stage or to `all` stages. Wildcard rules are
//! expanded first and stage-specific rules then override them, so a role can
//! be granted broadly and narrowed (or widened) for a single stage.

use chrono::{DateTime, Utc};
use sqlx::Sqlite;
use std::collections::BTreeMap;

use crate::error::{AppError, Result};
use crate::models::{RuleScope, Stage, UserPermissions, WorkflowRule};

/// What a role may do at one stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagePermissions {
    pub can_request: bool,
    pub can_approve: bool,
    pub can_reject: bool,
}

/// Resolved permissions for a single role
#[derive(Debug, Clone)]
pub struct PermissionResolver {
    role: String,
    stages: BTreeMap<Stage, StagePermissions>,
}

impl PermissionResolver {
    /// Build from rules; rules for other roles are ignored
    pub fn from_rules<'a>(role: &str, rules: impl IntoIterator<Item = &'a WorkflowRule>) -> Self {
        let mut stages: BTreeMap<Stage, StagePermissions> =
            Stage::ALL.iter().map(|s| (*s, StagePermissions::default())).collect();

        let (wildcard, specific): (Vec<&WorkflowRule>, Vec<&WorkflowRule>) = rules
            .into_iter()
            .filter(|r| r.role == role)
            .partition(|r| r.stage == RuleScope::All);

        for rule in wildcard.into_iter().chain(specific) {
            let granted = StagePermissions {
                can_request: rule.can_request_approval,
                can_approve: rule.can_approve,
                can_reject: rule.can_reject,
            };
            for stage in Stage::ALL {
                if rule.stage.covers(stage) {
                    stages.insert(stage, granted);
                }
            }
        }

        Self {
            role: role.to_string(),
            stages,
        }
    }

    /// Load the rules for `role` and resolve them
    pub async fn load<'e, E>(executor: E, role: &str) -> Result<Self>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let rows = sqlx::query_as::<_, RuleRow>(
            r#"
            SELECT id, role, stage, can_request_approval, can_approve, can_reject, created_at, updated_at
            FROM approval_workflow_rules
            WHERE role = ?
            "#,
        )
        .bind(role)
        .fetch_all(executor)
        .await?;

        let rules = rows
            .into_iter()
            .map(|r| r.try_into())
            .collect::<Result<Vec<WorkflowRule>>>()?;

        Ok(Self::from_rules(role, &rules))
    }

    pub fn at(&self, stage: Stage) -> StagePermissions {
        self.stages.get(&stage).copied().unwrap_or_default()
    }

    pub fn can_request(&self, stage: Stage) -> bool {
        self.at(stage).can_request
    }

    pub fn can_approve(&self, stage: Stage) -> bool {
        self.at(stage).can_approve
    }

    pub fn can_reject(&self, stage: Stage) -> bool {
        self.at(stage).can_reject
    }

    /// Per-stage maps covering all four stages
    pub fn user_permissions(&self) -> UserPermissions {
        let pick = |f: fn(&StagePermissions) -> bool| -> BTreeMap<Stage, bool> {
            self.stages.iter().map(|(s, p)| (*s, f(p))).collect()
        };

        UserPermissions {
            role: self.role.clone(),
            can_request_approval: pick(|p| p.can_request),
            can_approve: pick(|p| p.can_approve),
            can_reject: pick(|p| p.can_reject),
        }
    }
}

/// All configured rules, ordered by role then stage
pub async fn workflow_rules<'e, E>(executor: E) -> Result<Vec<WorkflowRule>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query_as::<_, RuleRow>(
        r#"
        SELECT id, role, stage, can_request_approval, can_approve, can_reject, created_at, updated_at
        FROM approval_workflow_rules
        ORDER BY role, stage
        "#,
    )
    .fetch_all(executor)
    .await?;

    rows.into_iter().map(|r| r.try_into()).collect()
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    id: i64,
    role: String,
    stage: String,
    can_request_approval: bool,
    can_approve: bool,
    can_reject: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RuleRow> for WorkflowRule {
    type Error = AppError;

    fn try_from(row: RuleRow) -> Result<Self> {
        Ok(WorkflowRule {
            id: row.id,
            role: row.role,
            stage: row
                .stage
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid rule stage: {}", e)))?,
            can_request_approval: row.can_request_approval,
            can_approve: row.can_approve,
            can_reject: row.can_reject,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MIGRATOR;
    use sqlx::sqlite::SqlitePoolOptions;

    fn rule(role: &str, stage: RuleScope, request: bool, approve: bool, reject: bool) -> WorkflowRule {
        WorkflowRule {
            id: 0,
            role: role.to_string(),
            stage,
            can_request_approval: request,
            can_approve: approve,
            can_reject: reject,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_wildcard_expands_to_every_stage() {
        let rules = vec![rule("admin", RuleScope::All, true, true, true)];
        let resolver = PermissionResolver::from_rules("admin", &rules);

        for stage in Stage::ALL {
            assert!(resolver.can_request(stage));
            assert!(resolver.can_approve(stage));
            assert!(resolver.can_reject(stage));
        }
    }

    #[test]
    fn test_specific_rule_overrides_wildcard() {
        // Listed specific-first to show order of rows does not matter
        let rules = vec![
            rule("designer", RuleScope::Stage(Stage::Design), true, true, true),
            rule("designer", RuleScope::All, true, false, false),
        ];
        let resolver = PermissionResolver::from_rules("designer", &rules);

        assert!(resolver.can_approve(Stage::Design));
        assert!(resolver.can_reject(Stage::Design));
        assert!(!resolver.can_approve(Stage::Definition));
        assert!(resolver.can_request(Stage::Execution));
    }

    #[test]
    fn test_uncovered_stages_default_to_false() {
        let rules = vec![rule("user", RuleScope::Stage(Stage::Specification), true, false, false)];
        let resolver = PermissionResolver::from_rules("user", &rules);

        assert!(resolver.can_request(Stage::Specification));
        assert!(!resolver.can_request(Stage::Definition));
        assert_eq!(resolver.at(Stage::Execution), StagePermissions::default());
    }

    #[test]
    fn test_other_roles_ignored() {
        let rules = vec![rule("admin", RuleScope::All, true, true, true)];
        let resolver = PermissionResolver::from_rules("engineer", &rules);

        for stage in Stage::ALL {
            assert_eq!(resolver.at(stage), StagePermissions::default());
        }
    }

    #[test]
    fn test_user_permissions_cover_all_stages() {
        let rules = vec![rule("designer", RuleScope::Stage(Stage::Design), false, true, false)];
        let permissions = PermissionResolver::from_rules("designer", &rules).user_permissions();

        assert_eq!(permissions.role, "designer");
        assert_eq!(permissions.can_request_approval.len(), 4);
        assert_eq!(permissions.can_approve.len(), 4);
        assert_eq!(permissions.can_reject.len(), 4);
        assert!(permissions.can_approve[&Stage::Design]);
        assert!(!permissions.can_approve[&Stage::Execution]);
    }

    async fn setup_test_db() -> sqlx::SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");
        MIGRATOR.run(&pool).await.expect("Failed to run migrations");
        pool
    }

    #[tokio::test]
    async fn test_load_seeded_rules() {
        let pool = setup_test_db().await;

        let admin = PermissionResolver::load(&pool, "admin").await.unwrap();
        assert!(admin.can_approve(Stage::Execution));

        let engineer = PermissionResolver::load(&pool, "engineer").await.unwrap();
        assert!(engineer.can_request(Stage::Design));
        assert!(!engineer.can_approve(Stage::Design));

        let designer = PermissionResolver::load(&pool, "designer").await.unwrap();
        assert!(designer.can_approve(Stage::Design));
        assert!(!designer.can_approve(Stage::Specification));

        let stranger = PermissionResolver::load(&pool, "guest").await.unwrap();
        assert!(!stranger.can_request(Stage::Specification));
    }

    #[tokio::test]
    async fn test_workflow_rules_ordered() {
        let pool = setup_test_db().await;
        let rules = workflow_rules(&pool).await.unwrap();

        assert!(!rules.is_empty());
        let keys: Vec<(String, String)> = rules
            .iter()
            .map(|r| (r.role.clone(), r.stage.as_str().to_string()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
