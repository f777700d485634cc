//! RPC parameter and response types.

use serde::{Deserialize, Serialize};

/// `status` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Butler name.
    pub name: String,
    /// Listener port.
    pub port: u16,
    /// Health flag; false only while draining.
    pub healthy: bool,
    /// Enabled module names in startup order.
    pub modules: Vec<String>,
    /// Seconds since daemon start.
    pub uptime_s: u64,
    /// Crate version.
    pub version: String,
}

/// `trigger` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerParams {
    /// Prompt for the spawner.
    pub prompt: String,
    /// Optional structured context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

/// `state_set` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSetParams {
    /// Key.
    pub key: String,
    /// JSON value.
    pub value: serde_json::Value,
}

/// `schedule_create` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleCreateParams {
    /// Unique task name.
    pub name: String,
    /// Cron expression.
    pub cron: String,
    /// Prompt dispatched when due.
    pub prompt: String,
}
