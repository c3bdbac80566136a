//! Server and workflow configuration

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Whether granting an approval promotes the capability to its next stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StageAdvancePolicy {
    /// Approval leaves `current_stage` alone; promotion is an explicit call
    #[default]
    Manual,
    /// Approval moves the capability to the next stage in the same transaction
    Auto,
}

/// Settings the approval workflow engine itself consumes
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub stage_advance: StageAdvancePolicy,
    /// Deadline applied to every workflow operation
    pub operation_timeout: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            stage_advance: StageAdvancePolicy::Manual,
            operation_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "stagegate")]
#[command(about = "Capability approval workflow server")]
#[command(version)]
pub struct ServerConfig {
    /// SQLite database URL
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:stagegate.db")]
    pub database_url: String,

    /// Address to listen on
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3000")]
    pub bind_addr: String,

    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,

    /// Per-operation deadline in milliseconds
    #[arg(long, env = "OPERATION_TIMEOUT_MS", default_value_t = 5000)]
    pub operation_timeout_ms: u64,

    #[arg(long, env = "STAGE_ADVANCE", value_enum, default_value_t = StageAdvancePolicy::Manual)]
    pub stage_advance: StageAdvancePolicy,
}

impl ServerConfig {
    pub fn workflow(&self) -> WorkflowConfig {
        WorkflowConfig {
            stage_advance: self.stage_advance,
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::try_parse_from(["stagegate"]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.stage_advance, StageAdvancePolicy::Manual);

        let workflow = config.workflow();
        assert_eq!(workflow.operation_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_auto_advance_flag() {
        let config = ServerConfig::try_parse_from([
            "stagegate",
            "--stage-advance",
            "auto",
            "--operation-timeout-ms",
            "250",
        ])
        .unwrap();
        let workflow = config.workflow();
        assert_eq!(workflow.stage_advance, StageAdvancePolicy::Auto);
        assert_eq!(workflow.operation_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let result = ServerConfig::try_parse_from(["stagegate", "--stage-advance", "sometimes"]);
        assert!(result.is_err());
    }
}
