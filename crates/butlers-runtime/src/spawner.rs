//! The per-butler spawner.
//!
//! Invocation steps, in order:
//! 1. Create the session row in an open state.
//! 2. Compose the system prompt: the butler's personality document,
//!    then memory context after a blank line when available (fail-open
//!    to the raw document if retrieval fails).
//! 3. Snapshot credentials: only declared env vars reach the child.
//! 4. Execute the runtime adapter under the session deadline.
//! 5. Write terminal fields; store an episode in memory (fail-open).
//!
//! `duration_ms` is measured from before step 1 so pre-invocation
//! failures record a real duration.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use butlers_core::{RequestContext, SessionId, TriggerSource};
use butlers_storage::{OpenSession, SessionLog, SessionTerminal};

use crate::adapter::{RuntimeAdapter, SpawnRequest, SpawnedResult};
use crate::error::{RuntimeError, RuntimeResult};

/// Optional memory integration, wired in by the daemon so the runtime
/// stays independent of the memory module. Both operations fail open.
#[async_trait]
pub trait ContextHook: Send + Sync {
    /// Retrieve memory context for a prompt.
    async fn memory_context(&self, prompt: &str) -> Option<String>;

    /// Store an episode describing a completed session.
    async fn store_episode(&self, prompt: &str, result: &str);
}

/// Spawner configuration.
#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// The butler's name.
    pub butler_name: String,
    /// Model passed to the adapter.
    pub model: String,
    /// Concurrency permit count; almost always 1.
    pub max_concurrent_sessions: usize,
    /// Per-session deadline in seconds.
    pub session_timeout_s: u64,
    /// The personality document (`CLAUDE.md`) text.
    pub personality: String,
    /// The credential snapshot passed to children.
    pub env: BTreeMap<String, String>,
}

/// Summary of one completed session, returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    /// The session id.
    pub session_id: SessionId,
    /// Whether the invocation succeeded.
    pub success: bool,
    /// Final output.
    pub result: Option<String>,
    /// Failure description.
    pub error: Option<String>,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

/// The per-butler spawner. Holds at most `max_concurrent_sessions`
/// invocations; further attempts fail fast with `overload_rejected`.
pub struct Spawner {
    config: SpawnerConfig,
    adapter: Arc<dyn RuntimeAdapter>,
    sessions: SessionLog,
    permits: Arc<Semaphore>,
    hook: Option<Arc<dyn ContextHook>>,
}

impl std::fmt::Debug for Spawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spawner")
            .field("butler", &self.config.butler_name)
            .field("adapter", &self.adapter.name())
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl Spawner {
    /// Create a spawner.
    #[must_use]
    pub fn new(
        config: SpawnerConfig,
        adapter: Arc<dyn RuntimeAdapter>,
        sessions: SessionLog,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_sessions.max(1)));
        Self {
            config,
            adapter,
            sessions,
            permits,
            hook: None,
        }
    }

    /// Attach the memory hook.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn ContextHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Whether an invocation could start right now.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.permits.available_permits() > 0
    }

    /// Run one session to completion.
    ///
    /// # Errors
    ///
    /// Fails fast with [`RuntimeError::Overloaded`] when the permit is
    /// held (self-invocation guard), and otherwise reports adapter or
    /// bookkeeping failures. Deadline expiry finalizes the session row
    /// with a `timeout` class before returning.
    pub async fn invoke(
        &self,
        trigger_source: TriggerSource,
        prompt: &str,
        request_context: Option<&RequestContext>,
    ) -> RuntimeResult<SessionSummary> {
        // Fail fast instead of queueing: a trigger issued while this
        // butler's permit is held would deadlock if it blocked here.
        let _permit = self.permits.clone().try_acquire_owned().map_err(|_| {
            RuntimeError::Overloaded(format!(
                "butler '{}' is already running a session",
                self.config.butler_name
            ))
        })?;

        let started = Instant::now();

        // Step 1: open the session row before the model runs.
        let open = OpenSession {
            trigger_source: trigger_source.clone(),
            prompt: prompt.to_owned(),
            model: self.config.model.clone(),
            parent_session_id: None,
            request_id: request_context.map(|c| c.request_id),
            subrequest_id: request_context.and_then(|c| c.subrequest_id),
            segment_id: request_context
                .and_then(|c| c.segment_id.as_ref())
                .map(|s| s.as_str().to_owned()),
        };
        let session_id = self.sessions.create(&open).await?;

        // Step 2: compose the system prompt (memory is fail-open).
        let system_prompt = self.compose_system_prompt(prompt).await;

        // Steps 3-4: adapter execution under the session deadline.
        let request = SpawnRequest {
            system_prompt,
            prompt: prompt.to_owned(),
            model: self.config.model.clone(),
            env: self.config.env.clone(),
        };
        let deadline = std::time::Duration::from_secs(self.config.session_timeout_s);
        let outcome = tokio::time::timeout(deadline, self.adapter.invoke(request)).await;

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let trace_id = request_context.and_then(|c| c.trace_context.clone());

        // Step 5: finalize and (fail-open) store the episode.
        match outcome {
            Err(_elapsed) => {
                let terminal = SessionTerminal {
                    success: false,
                    result: None,
                    error: Some(format!(
                        "timeout after {}s",
                        self.config.session_timeout_s
                    )),
                    tool_calls: 0,
                    input_tokens: 0,
                    output_tokens: 0,
                    duration_ms: i64::try_from(duration_ms).unwrap_or(i64::MAX),
                    trace_id,
                };
                self.sessions.complete(session_id, &terminal).await?;
                Err(RuntimeError::Deadline {
                    timeout_s: self.config.session_timeout_s,
                })
            },
            Ok(Err(e)) => {
                let terminal = SessionTerminal {
                    success: false,
                    result: None,
                    error: Some(e.to_string()),
                    tool_calls: 0,
                    input_tokens: 0,
                    output_tokens: 0,
                    duration_ms: i64::try_from(duration_ms).unwrap_or(i64::MAX),
                    trace_id,
                };
                self.sessions.complete(session_id, &terminal).await?;
                Err(e)
            },
            Ok(Ok(result)) => {
                self.finalize(session_id, &result, duration_ms, trace_id, prompt)
                    .await?;
                Ok(SessionSummary {
                    session_id,
                    success: result.success,
                    result: result.result,
                    error: result.error,
                    duration_ms,
                })
            },
        }
    }

    async fn compose_system_prompt(&self, prompt: &str) -> String {
        let Some(hook) = &self.hook else {
            return self.config.personality.clone();
        };
        match hook.memory_context(prompt).await {
            Some(context) if !context.is_empty() => {
                format!("{}\n\n{context}", self.config.personality)
            },
            _ => {
                debug!(butler = %self.config.butler_name, "no memory context; using raw personality");
                self.config.personality.clone()
            },
        }
    }

    async fn finalize(
        &self,
        session_id: SessionId,
        result: &SpawnedResult,
        duration_ms: u64,
        trace_id: Option<String>,
        prompt: &str,
    ) -> RuntimeResult<()> {
        let terminal = SessionTerminal {
            success: result.success,
            result: result.result.clone(),
            error: result.error.clone(),
            tool_calls: i64::try_from(result.tool_calls.len()).unwrap_or(i64::MAX),
            input_tokens: result.usage.input_tokens,
            output_tokens: result.usage.output_tokens,
            duration_ms: i64::try_from(duration_ms).unwrap_or(i64::MAX),
            trace_id,
        };
        self.sessions.complete(session_id, &terminal).await?;

        if let (Some(hook), Some(text)) = (&self.hook, &result.result) {
            // Fail-open: episode storage must never fail the session.
            hook.store_episode(prompt, text).await;
        }
        if !result.success {
            warn!(
                butler = %self.config.butler_name,
                session = %session_id,
                "session completed with error"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::SpawnUsage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Adapter that parks until told to finish, counting invocations.
    struct SlowAdapter {
        invocations: AtomicUsize,
        hold: tokio::sync::Mutex<()>,
    }

    #[async_trait]
    impl RuntimeAdapter for SlowAdapter {
        fn name(&self) -> &'static str {
            "slow_test"
        }

        async fn invoke(&self, _request: SpawnRequest) -> RuntimeResult<SpawnedResult> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let _guard = self.hold.lock().await;
            Ok(SpawnedResult {
                success: true,
                result: Some("ok".to_owned()),
                error: None,
                tool_calls: Vec::new(),
                usage: SpawnUsage::default(),
            })
        }
    }

    struct StaticHook;

    #[async_trait]
    impl ContextHook for StaticHook {
        async fn memory_context(&self, _prompt: &str) -> Option<String> {
            Some("## Memory\n- user prefers coffee".to_owned())
        }

        async fn store_episode(&self, _prompt: &str, _result: &str) {}
    }

    struct FailingHook;

    #[async_trait]
    impl ContextHook for FailingHook {
        async fn memory_context(&self, _prompt: &str) -> Option<String> {
            None
        }

        async fn store_episode(&self, _prompt: &str, _result: &str) {}
    }

    fn spawner_with(hook: Option<Arc<dyn ContextHook>>) -> Spawner {
        let config = SpawnerConfig {
            butler_name: "health".to_owned(),
            model: "claude-sonnet-4-20250514".to_owned(),
            max_concurrent_sessions: 1,
            session_timeout_s: 600,
            personality: "You are the health butler.".to_owned(),
            env: BTreeMap::new(),
        };
        let db = butlers_storage::Database::connect_lazy(
            "postgres://localhost/butlers",
            "test_spawner",
        )
        .unwrap();
        let sessions = SessionLog::new(db, butlers_storage::PricingTable::default());
        let adapter = Arc::new(SlowAdapter {
            invocations: AtomicUsize::new(0),
            hold: tokio::sync::Mutex::new(()),
        });
        let spawner = Spawner::new(config, adapter, sessions);
        match hook {
            Some(h) => spawner.with_hook(h),
            None => spawner,
        }
    }

    #[tokio::test]
    async fn system_prompt_appends_memory_after_blank_line() {
        let spawner = spawner_with(Some(Arc::new(StaticHook)));
        let composed = spawner.compose_system_prompt("anything").await;
        assert!(composed.starts_with("You are the health butler.\n\n## Memory"));
    }

    #[tokio::test]
    async fn system_prompt_falls_back_when_memory_empty() {
        let spawner = spawner_with(Some(Arc::new(FailingHook)));
        let composed = spawner.compose_system_prompt("anything").await;
        assert_eq!(composed, "You are the health butler.");
    }

    #[tokio::test]
    async fn system_prompt_without_hook_is_raw_personality() {
        let spawner = spawner_with(None);
        let composed = spawner.compose_system_prompt("anything").await;
        assert_eq!(composed, "You are the health butler.");
    }

    #[tokio::test]
    async fn second_invocation_fails_fast_while_permit_held() {
        // Exercise the guard directly: hold the permit and verify
        // try-acquire semantics rather than driving a database.
        let spawner = spawner_with(None);
        assert!(spawner.is_idle());
        let permit = spawner.permits.clone().try_acquire_owned().unwrap();
        assert!(!spawner.is_idle());

        let err = spawner
            .invoke(TriggerSource::Trigger, "hello", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Overloaded(_)));
        assert_eq!(err.class(), butlers_core::ErrorClass::OverloadRejected);
        drop(permit);
        assert!(spawner.is_idle());
    }
}
