//! Module resolution and the tool table.
//!
//! Startup order is a topological sort of the dependency DAG (stable:
//! ties break on declaration order). Unknown dependency names and
//! cycles block startup before any hook runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use regex::Regex;
use tracing::{info, warn};

use crate::error::{ModuleError, ModuleResult};
use crate::tool::{ToolDescriptor, ToolHandler};
use crate::traits::{ButlerModule, ModuleContext};

/// Matches channel egress tools: `user_telegram_send_message`,
/// `bot_email_reply`, etc. Only Messenger may execute these.
const EGRESS_PATTERN: &str = r"^(user|bot)_[a-z0-9]+_(send|reply|react)(_[a-z0-9_]+)?$";

/// Whether a tool name is a channel egress tool.
#[must_use]
pub fn is_channel_egress_tool(name: &str) -> bool {
    // The pattern is a compile-time constant; construction cannot fail.
    #[allow(clippy::expect_used)]
    Regex::new(EGRESS_PATTERN)
        .expect("egress pattern is valid")
        .is_match(name)
}

/// The resolved set of modules for one butler, in startup order, with
/// the merged tool table.
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn ButlerModule>>,
    contexts: BTreeMap<String, ModuleContext>,
    tools: BTreeMap<String, (ToolDescriptor, Arc<dyn ToolHandler>)>,
    is_messenger: bool,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.module_names())
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ModuleRegistry {
    /// Resolve enabled modules into startup order and register tools.
    ///
    /// `is_messenger` controls egress enforcement: on any other butler,
    /// channel egress tools are stripped before registration and the
    /// stripped set is logged.
    ///
    /// # Errors
    ///
    /// Unknown dependency names, dependency cycles, bad module config,
    /// and duplicate tool names all block startup.
    pub fn resolve(
        enabled: Vec<(Arc<dyn ButlerModule>, ModuleContext)>,
        is_messenger: bool,
    ) -> ModuleResult<Self> {
        let ordered = topo_sort(&enabled)?;

        let mut contexts = BTreeMap::new();
        let mut tools: BTreeMap<String, (ToolDescriptor, Arc<dyn ToolHandler>)> = BTreeMap::new();
        let mut modules = Vec::with_capacity(ordered.len());
        let mut stripped: Vec<String> = Vec::new();

        for (module, ctx) in ordered {
            module.check_config(&ctx.config)?;

            for (descriptor, handler) in module.register_tools(&ctx) {
                if !is_messenger && is_channel_egress_tool(&descriptor.name) {
                    stripped.push(descriptor.name.clone());
                    continue;
                }
                if tools.contains_key(&descriptor.name) {
                    return Err(ModuleError::DuplicateTool {
                        tool: descriptor.name,
                        module: module.name().to_owned(),
                    });
                }
                tools.insert(descriptor.name.clone(), (descriptor, handler));
            }

            contexts.insert(module.name().to_owned(), ctx);
            modules.push(module);
        }

        if !stripped.is_empty() {
            warn!(
                stripped = ?stripped,
                "stripped channel egress tools; Messenger is the sole outbound plane"
            );
        }

        Ok(Self {
            modules,
            contexts,
            tools,
            is_messenger,
        })
    }

    /// Module names in startup order.
    #[must_use]
    pub fn module_names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    /// The registered tool table.
    #[must_use]
    pub fn tools(&self) -> &BTreeMap<String, (ToolDescriptor, Arc<dyn ToolHandler>)> {
        &self.tools
    }

    /// Look up one tool.
    #[must_use]
    pub fn tool(&self, name: &str) -> Option<&(ToolDescriptor, Arc<dyn ToolHandler>)> {
        self.tools.get(name)
    }

    /// Whether this registry belongs to the Messenger butler.
    #[must_use]
    pub fn is_messenger(&self) -> bool {
        self.is_messenger
    }

    /// Extra env var names enabled modules declare for child processes.
    #[must_use]
    pub fn env_vars(&self) -> Vec<&'static str> {
        let mut vars: Vec<&'static str> = self
            .modules
            .iter()
            .flat_map(|m| m.env_vars())
            .collect();
        vars.sort_unstable();
        vars.dedup();
        vars
    }

    /// Migration chains in startup (dependency topological) order.
    #[must_use]
    pub fn migration_chains(&self) -> Vec<butlers_storage::MigrationChain> {
        self.modules
            .iter()
            .filter_map(|m| m.migration_chain())
            .collect()
    }

    /// Run startup hooks in dependency order.
    ///
    /// # Errors
    ///
    /// The first failing hook blocks startup.
    pub async fn startup(&self) -> ModuleResult<()> {
        for module in &self.modules {
            if let Some(ctx) = self.contexts.get(module.name()) {
                module.on_startup(ctx).await?;
                info!(module = module.name(), "module started");
            }
        }
        Ok(())
    }

    /// Run shutdown hooks in reverse dependency order. Failures are
    /// logged and do not stop remaining hooks.
    pub async fn shutdown(&self) {
        for module in self.modules.iter().rev() {
            if let Some(ctx) = self.contexts.get(module.name()) {
                if let Err(e) = module.on_shutdown(ctx).await {
                    warn!(module = module.name(), error = %e, "shutdown hook failed");
                } else {
                    info!(module = module.name(), "module stopped");
                }
            }
        }
    }
}

/// Stable Kahn topological sort over the dependency DAG.
fn topo_sort(
    enabled: &[(Arc<dyn ButlerModule>, ModuleContext)],
) -> ModuleResult<Vec<(Arc<dyn ButlerModule>, ModuleContext)>> {
    let names: BTreeSet<&str> = enabled.iter().map(|(m, _)| m.name()).collect();

    // Validate dependency names first so the error is precise.
    for (module, _) in enabled {
        for dep in module.dependencies() {
            if !names.contains(dep) {
                return Err(ModuleError::UnknownDependency {
                    module: module.name().to_owned(),
                    dependency: dep.to_owned(),
                });
            }
        }
    }

    let mut remaining: Vec<(Arc<dyn ButlerModule>, ModuleContext)> = enabled.to_vec();
    let mut ordered = Vec::with_capacity(remaining.len());
    let mut placed: BTreeSet<String> = BTreeSet::new();

    while !remaining.is_empty() {
        let ready_idx = remaining.iter().position(|(m, _)| {
            m.dependencies()
                .iter()
                .all(|dep| placed.contains(*dep))
        });
        match ready_idx {
            Some(idx) => {
                let (module, ctx) = remaining.remove(idx);
                placed.insert(module.name().to_owned());
                ordered.push((module, ctx));
            },
            None => {
                // Every remaining module waits on another remaining one.
                let module = remaining
                    .first()
                    .map(|(m, _)| m.name().to_owned())
                    .unwrap_or_default();
                return Err(ModuleError::DependencyCycle { module });
            },
        }
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolOutput;
    use async_trait::async_trait;

    struct NullHandler;

    #[async_trait]
    impl ToolHandler for NullHandler {
        async fn call(&self, _args: serde_json::Value) -> ToolOutput {
            ToolOutput::ok(serde_json::Value::Null)
        }
    }

    struct FakeModule {
        name: &'static str,
        deps: Vec<&'static str>,
        tools: Vec<&'static str>,
    }

    #[async_trait]
    impl ButlerModule for FakeModule {
        fn name(&self) -> &'static str {
            self.name
        }

        fn dependencies(&self) -> Vec<&'static str> {
            self.deps.clone()
        }

        fn register_tools(
            &self,
            _ctx: &ModuleContext,
        ) -> Vec<(ToolDescriptor, Arc<dyn ToolHandler>)> {
            self.tools
                .iter()
                .map(|name| {
                    (
                        ToolDescriptor::new(*name, "test tool"),
                        Arc::new(NullHandler) as Arc<dyn ToolHandler>,
                    )
                })
                .collect()
        }
    }

    fn ctx() -> ModuleContext {
        // Tests never touch the database; a lazy pool is enough.
        ModuleContext {
            butler_name: "test".to_owned(),
            db: test_db(),
            config: toml::value::Table::new(),
        }
    }

    fn test_db() -> butlers_storage::Database {
        // A lazy pool never dials until a query runs; these tests don't.
        butlers_storage::Database::connect_lazy("postgres://localhost/butlers", "test_schema")
            .unwrap()
    }

    fn module(
        name: &'static str,
        deps: Vec<&'static str>,
        tools: Vec<&'static str>,
    ) -> (Arc<dyn ButlerModule>, ModuleContext) {
        (
            Arc::new(FakeModule { name, deps, tools }) as Arc<dyn ButlerModule>,
            ctx(),
        )
    }

    // -----------------------------------------------------------------------
    // Egress pattern
    // -----------------------------------------------------------------------

    #[test]
    fn egress_pattern_matches_channel_send_tools() {
        assert!(is_channel_egress_tool("user_telegram_send_message"));
        assert!(is_channel_egress_tool("bot_email_reply"));
        assert!(is_channel_egress_tool("user_telegram_react"));
        assert!(is_channel_egress_tool("bot_telegram_send"));
    }

    #[test]
    fn egress_pattern_ignores_other_tools() {
        assert!(!is_channel_egress_tool("memory_store"));
        assert!(!is_channel_egress_tool("user_telegram_list_chats"));
        assert!(!is_channel_egress_tool("calendar_create_event"));
        assert!(!is_channel_egress_tool("send_message"));
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn dependency_order_is_respected() {
        let registry = ModuleRegistry::resolve(
            vec![
                module("calendar", vec!["memory"], vec![]),
                module("memory", vec![], vec![]),
            ],
            false,
        )
        .unwrap();
        assert_eq!(registry.module_names(), vec!["memory", "calendar"]);
    }

    #[tokio::test]
    async fn unknown_dependency_blocks_startup() {
        let err =
            ModuleRegistry::resolve(vec![module("calendar", vec!["ghost"], vec![])], false)
                .unwrap_err();
        assert!(matches!(
            err,
            ModuleError::UnknownDependency { dependency, .. } if dependency == "ghost"
        ));
    }

    #[tokio::test]
    async fn cycle_blocks_startup() {
        let err = ModuleRegistry::resolve(
            vec![
                module("a", vec!["b"], vec![]),
                module("b", vec!["a"], vec![]),
            ],
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ModuleError::DependencyCycle { .. }));
    }

    #[tokio::test]
    async fn duplicate_tool_blocks_startup() {
        let err = ModuleRegistry::resolve(
            vec![
                module("a", vec![], vec!["memory_store"]),
                module("b", vec![], vec!["memory_store"]),
            ],
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ModuleError::DuplicateTool { tool, .. } if tool == "memory_store"));
    }

    // -----------------------------------------------------------------------
    // Egress enforcement
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn non_messenger_strips_egress_tools() {
        let registry = ModuleRegistry::resolve(
            vec![module(
                "telegram",
                vec![],
                vec!["user_telegram_send_message", "user_telegram_list_chats"],
            )],
            false,
        )
        .unwrap();
        assert!(registry.tool("user_telegram_send_message").is_none());
        assert!(registry.tool("user_telegram_list_chats").is_some());
    }

    #[tokio::test]
    async fn messenger_keeps_egress_tools() {
        let registry = ModuleRegistry::resolve(
            vec![module(
                "telegram",
                vec![],
                vec!["user_telegram_send_message"],
            )],
            true,
        )
        .unwrap();
        assert!(registry.tool("user_telegram_send_message").is_some());
    }
}
