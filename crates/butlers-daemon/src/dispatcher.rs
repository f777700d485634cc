//! Tick dispatch wiring.

use std::sync::Arc;

use async_trait::async_trait;

use butlers_core::TriggerSource;
use butlers_memory::MemoryStore;
use butlers_runtime::Spawner;
use butlers_scheduler::TickDispatcher;

/// Dispatches scheduled work into the spawner and module jobs.
pub struct SpawnerDispatcher {
    spawner: Arc<Spawner>,
    memory: Option<MemoryStore>,
    switchboard: Option<butlers_rpc::ButlerClient>,
}

impl std::fmt::Debug for SpawnerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnerDispatcher").finish_non_exhaustive()
    }
}

impl SpawnerDispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(
        spawner: Arc<Spawner>,
        memory: Option<MemoryStore>,
        switchboard: Option<butlers_rpc::ButlerClient>,
    ) -> Self {
        Self {
            spawner,
            memory,
            switchboard,
        }
    }
}

#[async_trait]
impl TickDispatcher for SpawnerDispatcher {
    async fn dispatch_prompt(
        &self,
        trigger: TriggerSource,
        prompt: &str,
    ) -> Result<String, String> {
        match self.spawner.invoke(trigger, prompt, None).await {
            Ok(summary) if summary.success => {
                Ok(summary.result.unwrap_or_else(|| "ok".to_owned()))
            },
            Ok(summary) => Err(summary.error.unwrap_or_else(|| "session failed".to_owned())),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn dispatch_job(&self, job_name: &str) -> Result<String, String> {
        match job_name {
            "memory_episode_sweep" => {
                let Some(memory) = &self.memory else {
                    return Err("memory module is not enabled".to_owned());
                };
                let removed = memory
                    .sweep_expired_episodes()
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(format!("swept {removed} expired episodes"))
            },
            "fleet_tick" => {
                let Some(switchboard) = &self.switchboard else {
                    return Err("no switchboard configured".to_owned());
                };
                let summary = crate::heartbeat::run_fleet_tick(switchboard).await;
                Ok(summary)
            },
            other => Err(format!("unknown job '{other}'")),
        }
    }
}
