//! Built-in capability modules.
//!
//! The memory module lives in its own crate; the channel and utility
//! modules here are thin: channel modules contribute egress tool
//! descriptors whose handlers submit `notify.v1` through Switchboard
//! (so the egress-ownership strip is what actually decides where they
//! run), contacts and calendar own small domain tables.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Row;

use butlers_core::{ErrorClass, NotifyV1};
use butlers_memory::MemoryModule;
use butlers_module::{
    ApprovalDefault, ButlerModule, ModuleContext, ModuleError, ModuleResult, ToolDescriptor,
    ToolHandler, ToolOutput, ToolScope,
};
use butlers_rpc::ButlerClient;
use butlers_storage::{Migration, MigrationChain};

use crate::error::{DaemonError, DaemonResult};

/// Construct a module by its manifest name.
///
/// `switchboard` is the client channel modules use for notify egress.
///
/// # Errors
///
/// Unknown names were already rejected at config validation; this
/// returns [`DaemonError::Config`]-shaped failures only for modules
/// that need wiring the caller did not provide.
pub fn build_module(
    name: &str,
    butler_name: &str,
    switchboard: Option<ButlerClient>,
) -> DaemonResult<Option<Arc<dyn ButlerModule>>> {
    match name {
        "memory" => Ok(Some(Arc::new(MemoryModule))),
        "telegram" => Ok(Some(Arc::new(ChannelModule::telegram(
            butler_name,
            switchboard,
        )))),
        "email" => Ok(Some(Arc::new(ChannelModule::email(
            butler_name,
            switchboard,
        )))),
        "contacts" => Ok(Some(Arc::new(ContactsModule))),
        "calendar" => Ok(Some(Arc::new(CalendarModule))),
        // The approvals block configures the gate, not a module.
        "approvals" => Ok(None),
        other => Err(DaemonError::Config(
            butlers_config::ConfigError::UnknownModule {
                name: other.to_owned(),
            },
        )),
    }
}

// ---------------------------------------------------------------------------
// Channel modules (telegram / email)
// ---------------------------------------------------------------------------

/// A channel capability: contributes egress tools backed by `notify`.
///
/// On every butler except Messenger the egress tools are stripped at
/// registration; keeping the declaration here (instead of special-
/// casing Messenger) is what makes the ownership invariant testable.
struct ChannelModule {
    name: &'static str,
    env_vars: Vec<&'static str>,
    butler_name: String,
    switchboard: Option<ButlerClient>,
}

impl ChannelModule {
    fn telegram(butler_name: &str, switchboard: Option<ButlerClient>) -> Self {
        Self {
            name: "telegram",
            env_vars: vec!["BUTLER_TELEGRAM_TOKEN"],
            butler_name: butler_name.to_owned(),
            switchboard,
        }
    }

    fn email(butler_name: &str, switchboard: Option<ButlerClient>) -> Self {
        Self {
            name: "email",
            env_vars: vec!["BUTLER_EMAIL_ADDRESS", "BUTLER_EMAIL_PASSWORD"],
            butler_name: butler_name.to_owned(),
            switchboard,
        }
    }

    fn channel(&self) -> &'static str {
        self.name
    }
}

struct NotifyEgressHandler {
    origin: String,
    channel: &'static str,
    switchboard: Option<ButlerClient>,
}

#[async_trait]
impl ToolHandler for NotifyEgressHandler {
    async fn call(&self, args: serde_json::Value) -> ToolOutput {
        let Some(message) = args.get("message").and_then(|v| v.as_str()) else {
            return ToolOutput::Error {
                class: ErrorClass::ValidationError,
                message: "message is required".to_owned(),
            };
        };
        let Some(switchboard) = &self.switchboard else {
            return ToolOutput::Error {
                class: ErrorClass::TargetUnavailable,
                message: "no switchboard configured".to_owned(),
            };
        };

        let mut envelope = NotifyV1::send(self.origin.clone(), self.channel, message);
        envelope.delivery.recipient = args
            .get("recipient")
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        envelope.delivery.contact_id = args
            .get("contact_id")
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        envelope.delivery.subject = args
            .get("subject")
            .and_then(|v| v.as_str())
            .map(str::to_owned);

        match switchboard.notify(&self.origin, &envelope).await {
            Ok(response) => match response.status {
                butlers_core::RouteStatus::Ok => {
                    ToolOutput::ok(serde_json::to_value(&response).unwrap_or_default())
                },
                butlers_core::RouteStatus::Error => {
                    let error = response.error.unwrap_or_else(|| {
                        butlers_core::ErrorEnvelope::new(
                            ErrorClass::InternalError,
                            "delivery failed",
                        )
                    });
                    ToolOutput::Error {
                        class: error.class,
                        message: error.message,
                    }
                },
            },
            Err(e) => ToolOutput::Error {
                class: ErrorClass::TargetUnavailable,
                message: e.to_string(),
            },
        }
    }
}

#[async_trait]
impl ButlerModule for ChannelModule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn env_vars(&self) -> Vec<&'static str> {
        self.env_vars.clone()
    }

    fn register_tools(&self, _ctx: &ModuleContext) -> Vec<(ToolDescriptor, Arc<dyn ToolHandler>)> {
        let channel = self.channel();
        let send_name = format!("user_{channel}_send_message");
        let bot_send_name = format!("bot_{channel}_send_message");

        let user_handler = Arc::new(NotifyEgressHandler {
            origin: self.butler_name.clone(),
            channel,
            switchboard: self.switchboard.clone(),
        }) as Arc<dyn ToolHandler>;
        let bot_handler = Arc::new(NotifyEgressHandler {
            origin: self.butler_name.clone(),
            channel,
            switchboard: self.switchboard.clone(),
        }) as Arc<dyn ToolHandler>;

        vec![
            (
                ToolDescriptor::new(send_name, format!("Send a {channel} message as the user"))
                    .scope(ToolScope::User)
                    .approval(ApprovalDefault::Always),
                user_handler,
            ),
            (
                ToolDescriptor::new(
                    bot_send_name,
                    format!("Send a {channel} message as the butler"),
                )
                .scope(ToolScope::Bot)
                .approval(ApprovalDefault::Conditional),
                bot_handler,
            ),
        ]
    }
}

// ---------------------------------------------------------------------------
// Contacts
// ---------------------------------------------------------------------------

/// Contact book over the `contact_info` table.
struct ContactsModule;

struct ContactAddHandler {
    ctx_db: butlers_storage::Database,
}

#[async_trait]
impl ToolHandler for ContactAddHandler {
    async fn call(&self, args: serde_json::Value) -> ToolOutput {
        let contact_id = args.get("contact_id").and_then(|v| v.as_str());
        let channel = args.get("channel").and_then(|v| v.as_str());
        let identifier = args.get("identifier").and_then(|v| v.as_str());
        let (Some(contact_id), Some(channel), Some(identifier)) =
            (contact_id, channel, identifier)
        else {
            return ToolOutput::Error {
                class: ErrorClass::ValidationError,
                message: "contact_id, channel, and identifier are required".to_owned(),
            };
        };
        let display_name = args.get("display_name").and_then(|v| v.as_str());
        let result = sqlx::query(
            "INSERT INTO contact_info (contact_id, channel, identifier, display_name)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (contact_id, channel) DO UPDATE SET
                identifier = $3, display_name = $4, deleted = FALSE, updated_at = now()",
        )
        .bind(contact_id)
        .bind(channel)
        .bind(identifier)
        .bind(display_name)
        .execute(self.ctx_db.pool())
        .await;
        match result {
            Ok(_) => ToolOutput::ok(serde_json::json!({"stored": true})),
            Err(e) => ToolOutput::Error {
                class: ErrorClass::InternalError,
                message: e.to_string(),
            },
        }
    }
}

struct ContactListHandler {
    ctx_db: butlers_storage::Database,
}

#[async_trait]
impl ToolHandler for ContactListHandler {
    async fn call(&self, _args: serde_json::Value) -> ToolOutput {
        let rows = sqlx::query(
            "SELECT contact_id, channel, identifier, display_name FROM contact_info
             WHERE NOT deleted ORDER BY contact_id, channel",
        )
        .fetch_all(self.ctx_db.pool())
        .await;
        match rows {
            Ok(rows) => {
                let contacts: Vec<serde_json::Value> = rows
                    .iter()
                    .map(|row| {
                        serde_json::json!({
                            "contact_id": row.try_get::<String, _>("contact_id").ok(),
                            "channel": row.try_get::<String, _>("channel").ok(),
                            "identifier": row.try_get::<String, _>("identifier").ok(),
                            "display_name": row.try_get::<Option<String>, _>("display_name").ok().flatten(),
                        })
                    })
                    .collect();
                ToolOutput::ok(serde_json::json!({"contacts": contacts}))
            },
            Err(e) => ToolOutput::Error {
                class: ErrorClass::InternalError,
                message: e.to_string(),
            },
        }
    }
}

#[async_trait]
impl ButlerModule for ContactsModule {
    fn name(&self) -> &'static str {
        "contacts"
    }

    fn register_tools(&self, ctx: &ModuleContext) -> Vec<(ToolDescriptor, Arc<dyn ToolHandler>)> {
        vec![
            (
                ToolDescriptor::new("contact_add", "Add or update a contact identifier"),
                Arc::new(ContactAddHandler {
                    ctx_db: ctx.db.clone(),
                }) as Arc<dyn ToolHandler>,
            ),
            (
                ToolDescriptor::new("contact_list", "List known contacts"),
                Arc::new(ContactListHandler {
                    ctx_db: ctx.db.clone(),
                }) as Arc<dyn ToolHandler>,
            ),
        ]
    }
}

// ---------------------------------------------------------------------------
// Calendar
// ---------------------------------------------------------------------------

/// Minimal calendar capability over one table.
struct CalendarModule;

struct CalendarAddHandler {
    ctx_db: butlers_storage::Database,
}

#[async_trait]
impl ToolHandler for CalendarAddHandler {
    async fn call(&self, args: serde_json::Value) -> ToolOutput {
        let title = args.get("title").and_then(|v| v.as_str());
        let starts_at = args
            .get("starts_at")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<chrono::DateTime<chrono::Utc>>().ok());
        let (Some(title), Some(starts_at)) = (title, starts_at) else {
            return ToolOutput::Error {
                class: ErrorClass::ValidationError,
                message: "title and starts_at (RFC 3339) are required".to_owned(),
            };
        };
        let id = uuid::Uuid::new_v4();
        let result = sqlx::query(
            "INSERT INTO calendar_events (id, title, starts_at) VALUES ($1, $2, $3)",
        )
        .bind(id)
        .bind(title)
        .bind(starts_at)
        .execute(self.ctx_db.pool())
        .await;
        match result {
            Ok(_) => ToolOutput::ok(serde_json::json!({"event_id": id})),
            Err(e) => ToolOutput::Error {
                class: ErrorClass::InternalError,
                message: e.to_string(),
            },
        }
    }
}

struct CalendarListHandler {
    ctx_db: butlers_storage::Database,
}

#[async_trait]
impl ToolHandler for CalendarListHandler {
    async fn call(&self, _args: serde_json::Value) -> ToolOutput {
        let rows = sqlx::query(
            "SELECT id, title, starts_at FROM calendar_events
             WHERE starts_at >= now() ORDER BY starts_at LIMIT 50",
        )
        .fetch_all(self.ctx_db.pool())
        .await;
        match rows {
            Ok(rows) => {
                let events: Vec<serde_json::Value> = rows
                    .iter()
                    .map(|row| {
                        serde_json::json!({
                            "id": row.try_get::<uuid::Uuid, _>("id").ok(),
                            "title": row.try_get::<String, _>("title").ok(),
                            "starts_at": row
                                .try_get::<chrono::DateTime<chrono::Utc>, _>("starts_at")
                                .ok(),
                        })
                    })
                    .collect();
                ToolOutput::ok(serde_json::json!({"events": events}))
            },
            Err(e) => ToolOutput::Error {
                class: ErrorClass::InternalError,
                message: e.to_string(),
            },
        }
    }
}

#[async_trait]
impl ButlerModule for CalendarModule {
    fn name(&self) -> &'static str {
        "calendar"
    }

    fn check_config(&self, config: &toml::value::Table) -> ModuleResult<()> {
        if let Some(provider) = config.get("provider").and_then(toml::Value::as_str) {
            if provider != "local" && provider != "google" {
                return Err(ModuleError::BadConfig {
                    module: "calendar".to_owned(),
                    message: format!("unknown provider '{provider}'"),
                });
            }
        }
        Ok(())
    }

    fn env_vars(&self) -> Vec<&'static str> {
        vec!["GOOGLE_OAUTH_CLIENT_ID", "GOOGLE_OAUTH_CLIENT_SECRET"]
    }

    fn migration_chain(&self) -> Option<MigrationChain> {
        Some(MigrationChain::new(
            "calendar",
            vec![Migration::new(
                "calendar_0001_initial",
                r"
                CREATE TABLE IF NOT EXISTS calendar_events (
                    id UUID PRIMARY KEY,
                    title TEXT NOT NULL,
                    starts_at TIMESTAMPTZ NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );
                CREATE INDEX IF NOT EXISTS calendar_events_starts_idx
                    ON calendar_events (starts_at);
                ",
            )],
        ))
    }

    fn register_tools(&self, ctx: &ModuleContext) -> Vec<(ToolDescriptor, Arc<dyn ToolHandler>)> {
        vec![
            (
                ToolDescriptor::new("calendar_add_event", "Create a calendar event"),
                Arc::new(CalendarAddHandler {
                    ctx_db: ctx.db.clone(),
                }) as Arc<dyn ToolHandler>,
            ),
            (
                ToolDescriptor::new("calendar_list_events", "List upcoming calendar events"),
                Arc::new(CalendarListHandler {
                    ctx_db: ctx.db.clone(),
                }) as Arc<dyn ToolHandler>,
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_known_module_name_resolves() {
        for name in ["memory", "telegram", "email", "contacts", "calendar"] {
            let module = build_module(name, "health", None).unwrap();
            assert!(module.is_some(), "{name} should build");
        }
        // approvals configures the gate rather than a module.
        assert!(build_module("approvals", "health", None).unwrap().is_none());
    }

    #[test]
    fn unknown_module_name_errors() {
        assert!(build_module("teleportation", "health", None).is_err());
    }

    #[tokio::test]
    async fn channel_modules_declare_gated_egress() {
        let module = build_module("telegram", "health", None).unwrap().unwrap();
        let ctx = ModuleContext {
            butler_name: "health".to_owned(),
            db: butlers_storage::Database::connect_lazy(
                "postgres://localhost/butlers",
                "test_modules",
            )
            .unwrap(),
            config: toml::value::Table::new(),
        };
        let tools = module.register_tools(&ctx);
        let user_send = tools
            .iter()
            .find(|(d, _)| d.name == "user_telegram_send_message")
            .expect("user egress declared");
        assert_eq!(user_send.0.scope, Some(ToolScope::User));
        assert_eq!(user_send.0.approval_default, ApprovalDefault::Always);
        assert!(butlers_module::is_channel_egress_tool(&user_send.0.name));
    }

    #[test]
    fn calendar_rejects_unknown_provider() {
        let module = CalendarModule;
        let mut config = toml::value::Table::new();
        config.insert(
            "provider".to_owned(),
            toml::Value::String("outlook".to_owned()),
        );
        assert!(module.check_config(&config).is_err());
    }
}
