//! Capability approval workflow
//!
//! A capability moves through specification, definition, design and
//! execution. At each stage a review may be requested, then approved,
//! rejected or withdrawn. Every decision is mirrored onto the capability
//! row and appended to the audit trail in the same transaction.

pub mod audit;
pub mod engine;
pub mod permissions;
pub mod tracker;

pub use audit::{AuditLog, NewAuditEntry};
pub use engine::ApprovalWorkflow;
pub use permissions::{PermissionResolver, StagePermissions};
pub use tracker::{CapabilityPatch, StageTracker};
