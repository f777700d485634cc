//! Module runtime error types.

use thiserror::Error;

/// Errors from module resolution and lifecycle.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// A module depends on a name no enabled module provides.
    #[error("module '{module}' depends on unknown module '{dependency}'")]
    UnknownDependency {
        /// The declaring module.
        module: String,
        /// The missing dependency.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("module dependency cycle involving '{module}'")]
    DependencyCycle {
        /// A module on the cycle.
        module: String,
    },

    /// Two modules registered the same tool name.
    #[error("duplicate tool '{tool}' (from module '{module}')")]
    DuplicateTool {
        /// The conflicting tool name.
        tool: String,
        /// The module that lost the registration.
        module: String,
    },

    /// A module's config block failed its schema.
    #[error("module '{module}' config: {message}")]
    BadConfig {
        /// The module.
        module: String,
        /// What went wrong.
        message: String,
    },

    /// A lifecycle hook failed.
    #[error("module '{module}' {hook} hook failed: {message}")]
    HookFailed {
        /// The module.
        module: String,
        /// Which hook (`on_startup` / `on_shutdown`).
        hook: String,
        /// What went wrong.
        message: String,
    },
}

/// Result type for module operations.
pub type ModuleResult<T> = Result<T, ModuleError>;
