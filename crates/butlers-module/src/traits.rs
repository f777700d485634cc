//! The module interface.

use std::sync::Arc;

use async_trait::async_trait;

use butlers_storage::{Database, MigrationChain};

use crate::error::ModuleResult;
use crate::tool::{ToolDescriptor, ToolHandler};

/// Everything a module sees at startup.
#[derive(Clone)]
pub struct ModuleContext {
    /// The owning butler's name.
    pub butler_name: String,
    /// The butler's schema-pinned database.
    pub db: Database,
    /// The module's config block from the manifest.
    pub config: toml::value::Table,
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("butler_name", &self.butler_name)
            .finish_non_exhaustive()
    }
}

/// A capability module.
///
/// Implementations contribute tools, a migration chain, and lifecycle
/// hooks. Registration is declarative: `register_tools` returns
/// descriptor/handler pairs as data, and the runtime decides what
/// actually gets exposed (e.g. stripping channel egress tools on
/// non-Messenger butlers).
#[async_trait]
pub trait ButlerModule: Send + Sync {
    /// Unique module name (matches the `[modules.<name>]` key).
    fn name(&self) -> &'static str;

    /// Names of modules that must start before this one.
    fn dependencies(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Validate the module's config block.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ModuleError::BadConfig`] describing the first
    /// violation.
    fn check_config(&self, _config: &toml::value::Table) -> ModuleResult<()> {
        Ok(())
    }

    /// The module's migration chain, if it owns tables.
    fn migration_chain(&self) -> Option<MigrationChain> {
        None
    }

    /// Extra environment variable names this module needs passed to
    /// spawned child processes.
    fn env_vars(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// The tools this module contributes.
    fn register_tools(&self, ctx: &ModuleContext) -> Vec<(ToolDescriptor, Arc<dyn ToolHandler>)>;

    /// Startup hook, run in dependency order after migrations.
    ///
    /// # Errors
    ///
    /// A failure blocks butler startup.
    async fn on_startup(&self, _ctx: &ModuleContext) -> ModuleResult<()> {
        Ok(())
    }

    /// Shutdown hook, run in reverse dependency order.
    ///
    /// # Errors
    ///
    /// Failures are logged, never fatal.
    async fn on_shutdown(&self, _ctx: &ModuleContext) -> ModuleResult<()> {
        Ok(())
    }
}
