//! Tool descriptors and handlers.
//!
//! Tool I/O descriptors are data, not reflection: a module declares
//! each tool's name, scope, direction, and approval default up front,
//! and pairs it with an async handler.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use butlers_core::{ButlerError, ErrorClass};

/// Whether a tool acts on behalf of the human user or the bot itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolScope {
    /// User-scoped: acts as the human (e.g. sending from their account).
    User,
    /// Bot-scoped: acts as the butler's own identity.
    Bot,
}

/// Default approval posture for a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDefault {
    /// Never gated unless config says so.
    #[default]
    None,
    /// Gated when config opts the tool in.
    Conditional,
    /// Always gated.
    Always,
}

/// Declarative description of one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name, unique per butler.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Scope, when the tool touches an external identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ToolScope>,
    /// Input parameter names consumed from the user side.
    #[serde(default)]
    pub user_inputs: Vec<String>,
    /// Output surfaces on the user side.
    #[serde(default)]
    pub user_outputs: Vec<String>,
    /// Input parameter names consumed from the bot side.
    #[serde(default)]
    pub bot_inputs: Vec<String>,
    /// Output surfaces on the bot side.
    #[serde(default)]
    pub bot_outputs: Vec<String>,
    /// Approval posture.
    #[serde(default)]
    pub approval_default: ApprovalDefault,
}

impl ToolDescriptor {
    /// Create a descriptor with just a name and description.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            scope: None,
            user_inputs: Vec::new(),
            user_outputs: Vec::new(),
            bot_inputs: Vec::new(),
            bot_outputs: Vec::new(),
            approval_default: ApprovalDefault::default(),
        }
    }

    /// Set the scope.
    #[must_use]
    pub fn scope(mut self, scope: ToolScope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Set the approval default.
    #[must_use]
    pub fn approval(mut self, default: ApprovalDefault) -> Self {
        self.approval_default = default;
        self
    }
}

/// The result of one tool invocation.
///
/// Approval gating is a variant, never an exception: a gated call that
/// lacks approval returns [`ToolOutput::PendingApproval`] without
/// invoking the underlying handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutput {
    /// The tool ran and produced a value.
    Ok {
        /// The tool's result.
        result: serde_json::Value,
    },
    /// The call is parked awaiting a human decision.
    PendingApproval {
        /// The pending action to approve or reject.
        action_id: butlers_core::ActionId,
    },
    /// The tool failed with a classified error.
    Error {
        /// Canonical class.
        class: ErrorClass,
        /// Human-readable message.
        message: String,
    },
}

impl ToolOutput {
    /// A success output.
    #[must_use]
    pub fn ok(result: serde_json::Value) -> Self {
        Self::Ok { result }
    }

    /// An error output from a [`ButlerError`].
    #[must_use]
    pub fn error(err: &ButlerError) -> Self {
        Self::Error {
            class: err.class,
            message: err.message.clone(),
        }
    }
}

/// Async handler behind a registered tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool with JSON arguments.
    async fn call(&self, args: serde_json::Value) -> ToolOutput;
}

/// Blanket impl so `Arc<dyn ToolHandler>` composes.
#[async_trait]
impl ToolHandler for Arc<dyn ToolHandler> {
    async fn call(&self, args: serde_json::Value) -> ToolOutput {
        (**self).call(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_builder() {
        let desc = ToolDescriptor::new("user_telegram_send_message", "send a telegram message")
            .scope(ToolScope::User)
            .approval(ApprovalDefault::Always);
        assert_eq!(desc.scope, Some(ToolScope::User));
        assert_eq!(desc.approval_default, ApprovalDefault::Always);
    }

    #[test]
    fn output_serializes_with_status_tag() {
        let out = ToolOutput::ok(serde_json::json!({"sent": true}));
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["status"], "ok");

        let out = ToolOutput::Error {
            class: ErrorClass::ValidationError,
            message: "bad args".to_owned(),
        };
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["class"], "validation_error");
    }
}
