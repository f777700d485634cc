//! Manifest types.
//!
//! Every section defaults so a minimal manifest (identity + db) produces
//! a working butler. Module blocks stay as raw TOML values; the module
//! runtime deserializes each block against its own config schema.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root butler manifest, parsed from `butler.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButlerManifest {
    /// Identity, daemon, and integration settings.
    pub butler: ButlerSection,
    /// Enabled modules with their config blocks, keyed by module name.
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleSection>,
    /// Model pricing table for session cost reporting, keyed by model
    /// name.
    #[serde(default)]
    pub pricing: BTreeMap<String, PricingEntry>,
}

/// The `[butler]` section and its subsections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButlerSection {
    /// Globally unique butler name.
    pub name: String,
    /// RPC listener port.
    pub port: u16,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Database settings.
    pub db: DbSection,
    /// Spawner/runtime settings.
    #[serde(default)]
    pub runtime: RuntimeSection,
    /// Switchboard integration.
    #[serde(default)]
    pub switchboard: SwitchboardSection,
    /// Security policy.
    #[serde(default)]
    pub security: SecuritySection,
    /// Environment variable declarations.
    #[serde(default)]
    pub env: EnvSection,
    /// Declarative schedule entries.
    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,
}

/// The `[butler.db]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbSection {
    /// Logical database name.
    pub name: String,
    /// Schema owned by this butler.
    pub schema: String,
}

/// Which ephemeral runtime spawns LLM sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// The `claude_code` child-process runtime.
    #[default]
    ClaudeCode,
    /// The `codex` child-process runtime.
    Codex,
    /// The `opencode` child-process runtime.
    Opencode,
}

/// The `[butler.runtime]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    /// Runtime flavour.
    #[serde(rename = "type")]
    pub kind: RuntimeKind,
    /// Model passed to the runtime.
    pub model: String,
    /// Spawner concurrency; almost always 1.
    pub max_concurrent_sessions: usize,
    /// IANA timezone for cron evaluation.
    pub timezone: String,
    /// Per-session deadline in seconds.
    pub session_timeout_s: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::default(),
            model: "claude-sonnet-4-20250514".to_owned(),
            max_concurrent_sessions: 1,
            timezone: "UTC".to_owned(),
            session_timeout_s: 600,
        }
    }
}

/// The `[butler.switchboard]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardSection {
    /// Switchboard RPC endpoint.
    pub url: String,
    /// Whether this butler advertises itself into the registry.
    pub advertise: bool,
    /// Registry liveness TTL in seconds.
    pub liveness_ttl_s: u64,
    /// Lowest route contract version this butler accepts.
    pub route_contract_min: u32,
    /// Highest route contract version this butler accepts.
    pub route_contract_max: u32,
}

impl Default for SwitchboardSection {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8001".to_owned(),
            advertise: true,
            liveness_ttl_s: 60,
            route_contract_min: 1,
            route_contract_max: 1,
        }
    }
}

/// The `[butler.security]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    /// Callers allowed to invoke `route_execute`.
    pub trusted_route_callers: Vec<String>,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            trusted_route_callers: vec!["switchboard".to_owned()],
        }
    }
}

/// The `[butler.env]` section.
///
/// Only declared variables reach spawned child processes; everything
/// else is stripped from the credential snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvSection {
    /// Variables that must resolve at startup.
    pub required: Vec<String>,
    /// Variables passed through when present.
    pub optional: Vec<String>,
}

impl EnvSection {
    /// All declared variable names, required first.
    #[must_use]
    pub fn declared(&self) -> Vec<&str> {
        self.required
            .iter()
            .map(String::as_str)
            .chain(self.optional.iter().map(String::as_str))
            .collect()
    }
}

/// How a schedule entry dispatches when due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScheduleDispatch {
    /// Spawn a session with this prompt.
    Prompt {
        /// The prompt text.
        prompt: String,
    },
    /// Run a registered module job instead of a session.
    Job {
        /// Must be `"job"`.
        dispatch_mode: String,
        /// Name of the registered job.
        job_name: String,
    },
}

/// One `[[butler.schedule]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Unique name within the butler.
    pub name: String,
    /// Cron expression (seconds-resolution, six fields).
    pub cron: String,
    /// What to do when due.
    #[serde(flatten)]
    pub dispatch: ScheduleDispatch,
    /// Whether the entry starts enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// A `[modules.<name>]` block.
///
/// The `provider` key is lifted out; everything else stays as raw TOML
/// for the module's own schema. `[modules.approvals]` instead
/// deserializes into [`ApprovalsSection`] by the approval gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleSection {
    /// Optional provider selection within the module.
    pub provider: Option<String>,
    /// Module-specific configuration.
    #[serde(flatten)]
    pub config: toml::value::Table,
}

/// The `[modules.approvals]` config schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalsSection {
    /// Tools gated behind human approval, beyond the identity-default
    /// rule.
    pub gated_tools: Vec<GatedTool>,
}

/// One gated tool declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatedTool {
    /// Tool name to gate.
    pub tool: String,
    /// Seconds until a pending action expires.
    #[serde(default)]
    pub expiry_s: Option<u64>,
}

/// Per-model token pricing, USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingEntry {
    /// Input token price.
    pub input_per_million: f64,
    /// Output token price.
    pub output_per_million: f64,
}

impl ButlerManifest {
    /// Whether a module is enabled.
    #[must_use]
    pub fn module_enabled(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// The approvals section, when configured.
    #[must_use]
    pub fn approvals(&self) -> Option<ApprovalsSection> {
        let section = self.modules.get("approvals")?;
        let value = toml::Value::Table(section.config.clone());
        value.try_into().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_manifest_parses_with_defaults() {
        let manifest: ButlerManifest = toml::from_str(
            r#"
            [butler]
            name = "health"
            port = 8011

            [butler.db]
            name = "butlers"
            schema = "health"
            "#,
        )
        .unwrap();

        assert_eq!(manifest.butler.name, "health");
        assert_eq!(manifest.butler.runtime.max_concurrent_sessions, 1);
        assert_eq!(
            manifest.butler.security.trusted_route_callers,
            vec!["switchboard".to_owned()]
        );
        assert!(manifest.butler.schedule.is_empty());
    }

    #[test]
    fn schedule_entry_parses_prompt_and_job_forms() {
        let manifest: ButlerManifest = toml::from_str(
            r#"
            [butler]
            name = "health"
            port = 8011

            [butler.db]
            name = "butlers"
            schema = "health"

            [[butler.schedule]]
            name = "digest"
            cron = "0 0 8 * * *"
            prompt = "Summarize overnight vitals"

            [[butler.schedule]]
            name = "decay"
            cron = "0 30 3 * * *"
            dispatch_mode = "job"
            job_name = "memory_decay"
            enabled = false
            "#,
        )
        .unwrap();

        let entries = &manifest.butler.schedule;
        assert_eq!(entries.len(), 2);
        assert!(matches!(
            entries[0].dispatch,
            ScheduleDispatch::Prompt { .. }
        ));
        assert!(entries[0].enabled);
        assert!(matches!(entries[1].dispatch, ScheduleDispatch::Job { .. }));
        assert!(!entries[1].enabled);
    }

    #[test]
    fn approvals_section_extracts_gated_tools() {
        let manifest: ButlerManifest = toml::from_str(
            r#"
            [butler]
            name = "messenger"
            port = 8002

            [butler.db]
            name = "butlers"
            schema = "messenger"

            [modules.approvals]
            gated_tools = [{ tool = "user_telegram_send_message", expiry_s = 3600 }]
            "#,
        )
        .unwrap();

        let approvals = manifest.approvals().unwrap();
        assert_eq!(approvals.gated_tools.len(), 1);
        assert_eq!(approvals.gated_tools[0].tool, "user_telegram_send_message");
        assert_eq!(approvals.gated_tools[0].expiry_s, Some(3600));
    }

    #[test]
    fn module_blocks_keep_free_form_config() {
        let manifest: ButlerManifest = toml::from_str(
            r#"
            [butler]
            name = "general"
            port = 8010

            [butler.db]
            name = "butlers"
            schema = "general"

            [modules.telegram]
            provider = "telegram_bot_api"
            poll_interval_s = 2
            "#,
        )
        .unwrap();

        let telegram = manifest.modules.get("telegram").unwrap();
        assert_eq!(telegram.provider.as_deref(), Some("telegram_bot_api"));
        assert_eq!(
            telegram.config.get("poll_interval_s").and_then(toml::Value::as_integer),
            Some(2)
        );
    }
}
