//! Data models for capability approvals, workflow rules and the audit trail

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Review stage a capability passes through, in progression order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Specification,
    Definition,
    Design,
    Execution,
}

impl Stage {
    /// Every stage, first to last
    pub const ALL: [Stage; 4] = [
        Stage::Specification,
        Stage::Definition,
        Stage::Design,
        Stage::Execution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Specification => "specification",
            Stage::Definition => "definition",
            Stage::Design => "design",
            Stage::Execution => "execution",
        }
    }

    /// The stage that follows this one; `Execution` is terminal
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Specification => Some(Stage::Definition),
            Stage::Definition => Some(Stage::Design),
            Stage::Design => Some(Stage::Execution),
            Stage::Execution => None,
        }
    }

    /// Only single forward steps are legal
    pub fn can_transition(from: Stage, to: Stage) -> bool {
        from.next() == Some(to)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "specification" => Ok(Stage::Specification),
            "definition" => Ok(Stage::Definition),
            "design" => Ok(Stage::Design),
            "execution" => Ok(Stage::Execution),
            _ => Err(format!(
                "Invalid stage: {}. Must be one of: specification, definition, design, execution",
                s
            )),
        }
    }
}

/// Status of a single approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    PendingApproval,
    Approved,
    Rejected,
    Withdrawn,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::PendingApproval => "pending_approval",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Withdrawn => "withdrawn",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::PendingApproval)
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_approval" => Ok(ApprovalStatus::PendingApproval),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            "withdrawn" => Ok(ApprovalStatus::Withdrawn),
            _ => Err(format!("Invalid approval status: {}", s)),
        }
    }
}

/// Approval status mirrored onto the capability itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStatus {
    Draft,
    PendingApproval,
    Approved,
    Rejected,
}

impl CapabilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityStatus::Draft => "draft",
            CapabilityStatus::PendingApproval => "pending_approval",
            CapabilityStatus::Approved => "approved",
            CapabilityStatus::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for CapabilityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CapabilityStatus::Draft),
            "pending_approval" => Ok(CapabilityStatus::PendingApproval),
            "approved" => Ok(CapabilityStatus::Approved),
            "rejected" => Ok(CapabilityStatus::Rejected),
            _ => Err(format!("Invalid capability status: {}", s)),
        }
    }
}

/// Workflow action recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Requested,
    Approved,
    Rejected,
    Withdrawn,
    /// Capability moved on to its next stage
    Advanced,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Requested => "requested",
            AuditAction::Approved => "approved",
            AuditAction::Rejected => "rejected",
            AuditAction::Withdrawn => "withdrawn",
            AuditAction::Advanced => "advanced",
        }
    }
}

impl std::str::FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(AuditAction::Requested),
            "approved" => Ok(AuditAction::Approved),
            "rejected" => Ok(AuditAction::Rejected),
            "withdrawn" => Ok(AuditAction::Withdrawn),
            "advanced" => Ok(AuditAction::Advanced),
            _ => Err(format!("Invalid audit action: {}", s)),
        }
    }
}

/// One review request for one capability at one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityApproval {
    pub id: i64,
    pub capability_id: i64,
    pub stage: Stage,
    pub status: ApprovalStatus,
    pub requested_by: i64,
    pub requested_at: DateTime<Utc>,
    /// Joined from users
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requester_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    /// Joined from users
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decider_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The workflow-owned view of a capability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub id: i64,
    pub name: String,
    pub current_stage: Stage,
    pub approval_status: CapabilityStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Stage a workflow rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum RuleScope {
    All,
    Stage(Stage),
}

impl RuleScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleScope::All => "all",
            RuleScope::Stage(stage) => stage.as_str(),
        }
    }

    pub fn covers(&self, stage: Stage) -> bool {
        match self {
            RuleScope::All => true,
            RuleScope::Stage(s) => *s == stage,
        }
    }
}

impl std::str::FromStr for RuleScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            Ok(RuleScope::All)
        } else {
            s.parse().map(RuleScope::Stage)
        }
    }
}

impl From<RuleScope> for String {
    fn from(scope: RuleScope) -> Self {
        scope.as_str().to_string()
    }
}

impl TryFrom<String> for RuleScope {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Role-to-permission mapping for a stage or for every stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRule {
    pub id: i64,
    pub role: String,
    pub stage: RuleScope,
    pub can_request_approval: bool,
    pub can_approve: bool,
    pub can_reject: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One immutable audit trail record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<i64>,
    pub capability_id: i64,
    pub action: AuditAction,
    pub stage: Stage,
    pub performed_by: i64,
    /// Joined from users
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performer_name: Option<String>,
    pub performed_at: DateTime<Utc>,
    pub details: serde_json::Value,
}

/// Per-stage permission maps for a role, covering every stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPermissions {
    pub role: String,
    pub can_request_approval: BTreeMap<Stage, bool>,
    pub can_approve: BTreeMap<Stage, bool>,
    pub can_reject: BTreeMap<Stage, bool>,
}

/// The caller of a workflow operation, as resolved by the identity provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: i64,
    pub role: String,
}

impl Actor {
    pub fn new(user_id: i64, role: impl Into<String>) -> Self {
        Self {
            user_id,
            role: role.into(),
        }
    }
}

/// Request to open a review
#[derive(Debug, Deserialize)]
pub struct RequestApprovalRequest {
    pub capability_id: i64,
    pub stage: String,
}

/// Body of an approve or reject call
#[derive(Debug, Default, Deserialize)]
pub struct ApprovalDecisionRequest {
    #[serde(default)]
    pub feedback: Option<String>,
}

/// A pending approval with what the caller may do about it
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalView {
    pub approval: CapabilityApproval,
    pub capability_name: String,
    pub can_approve: bool,
    pub can_reject: bool,
    pub can_withdraw: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingApprovals {
    pub approvals: Vec<ApprovalView>,
    pub total_count: usize,
    pub by_stage: HashMap<Stage, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalHistory {
    pub capability_id: i64,
    pub capability_name: String,
    pub current_stage: Stage,
    pub current_status: CapabilityStatus,
    pub approvals: Vec<CapabilityApproval>,
    pub audit_log: Vec<AuditLogEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditLogResponse {
    pub capability_id: i64,
    pub audit_log: Vec<AuditLogEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRulesResponse {
    pub rules: Vec<WorkflowRule>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_from_str() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert!("review".parse::<Stage>().is_err());
        assert!("all".parse::<Stage>().is_err());
    }

    #[test]
    fn test_stage_next() {
        assert_eq!(Stage::Specification.next(), Some(Stage::Definition));
        assert_eq!(Stage::Definition.next(), Some(Stage::Design));
        assert_eq!(Stage::Design.next(), Some(Stage::Execution));
        assert_eq!(Stage::Execution.next(), None);
    }

    #[test]
    fn test_stage_can_transition() {
        assert!(Stage::can_transition(Stage::Specification, Stage::Definition));
        assert!(Stage::can_transition(Stage::Design, Stage::Execution));
        // No skipping, no moving backward, no standing still
        assert!(!Stage::can_transition(Stage::Specification, Stage::Design));
        assert!(!Stage::can_transition(Stage::Design, Stage::Definition));
        assert!(!Stage::can_transition(Stage::Execution, Stage::Execution));
    }

    #[test]
    fn test_stage_ordering() {
        assert!(Stage::Specification < Stage::Definition);
        assert!(Stage::Definition < Stage::Design);
        assert!(Stage::Design < Stage::Execution);
    }

    #[test]
    fn test_approval_status_is_terminal() {
        assert!(!ApprovalStatus::PendingApproval.is_terminal());
        assert!(ApprovalStatus::Approved.is_terminal());
        assert!(ApprovalStatus::Rejected.is_terminal());
        assert!(ApprovalStatus::Withdrawn.is_terminal());
    }

    #[test]
    fn test_approval_status_serialization() {
        let json = serde_json::to_string(&ApprovalStatus::PendingApproval).unwrap();
        assert_eq!(json, "\"pending_approval\"");
        assert_eq!(
            "pending_approval".parse::<ApprovalStatus>().unwrap(),
            ApprovalStatus::PendingApproval
        );
    }

    #[test]
    fn test_rule_scope_round_trip() {
        assert_eq!("all".parse::<RuleScope>().unwrap(), RuleScope::All);
        assert_eq!(
            "design".parse::<RuleScope>().unwrap(),
            RuleScope::Stage(Stage::Design)
        );
        assert!("everything".parse::<RuleScope>().is_err());

        let json = serde_json::to_string(&RuleScope::All).unwrap();
        assert_eq!(json, "\"all\"");
        let scope: RuleScope = serde_json::from_str("\"execution\"").unwrap();
        assert_eq!(scope, RuleScope::Stage(Stage::Execution));
    }

    #[test]
    fn test_rule_scope_covers() {
        assert!(RuleScope::All.covers(Stage::Execution));
        assert!(RuleScope::Stage(Stage::Design).covers(Stage::Design));
        assert!(!RuleScope::Stage(Stage::Design).covers(Stage::Definition));
    }

    #[test]
    fn test_user_permissions_serialize_stage_keys() {
        let mut can_approve = BTreeMap::new();
        can_approve.insert(Stage::Design, true);
        let permissions = UserPermissions {
            role: "designer".to_string(),
            can_request_approval: BTreeMap::new(),
            can_approve,
            can_reject: BTreeMap::new(),
        };
        let json = serde_json::to_value(&permissions).unwrap();
        assert_eq!(json["can_approve"]["design"], true);
    }

    #[test]
    fn test_approval_decision_request_feedback_optional() {
        let req: ApprovalDecisionRequest = serde_json::from_str("{}").unwrap();
        assert!(req.feedback.is_none());
    }
}
