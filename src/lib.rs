//! Stagegate server - capability approval workflow engine

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod store;
pub mod workflow;

use sqlx::SqlitePool;
use std::sync::Arc;

use crate::config::WorkflowConfig;
use crate::workflow::ApprovalWorkflow;

/// Application state shared across handlers
pub struct AppState {
    pub workflow: ApprovalWorkflow,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: WorkflowConfig) -> Arc<Self> {
        Arc::new(Self {
            workflow: ApprovalWorkflow::new(pool, config),
        })
    }
}
