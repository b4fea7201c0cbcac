//! Process-wide default orchestrator plus group-scoped machine ids. Tests
//! and tenants isolate themselves with a `ChannelGroupToken` instead of a
//! private orchestrator: ids minted under a token carry a `#{group}#` infix,
//! and releasing the token unregisters the whole group at once.

use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::machine::Machine;
use crate::orchestrator::EventBusOrchestrator;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

static GLOBAL: OnceLock<Arc<EventBusOrchestrator>> = OnceLock::new();
static NEXT_GROUP: AtomicU64 = AtomicU64::new(1);

/// Accessor for the lazily-initialized process-wide orchestrator.
pub struct GlobalOrchestratorManager;

impl GlobalOrchestratorManager {
    pub fn orchestrator() -> Arc<EventBusOrchestrator> {
        GLOBAL
            .get_or_init(|| Arc::new(EventBusOrchestrator::new(OrchestratorConfig::default())))
            .clone()
    }

    /// Allocate a fresh group on the global orchestrator.
    pub fn create_channel_group(name: impl Into<String>) -> ChannelGroupToken {
        ChannelGroupToken::new(Self::orchestrator(), name)
    }
}

/// Owns every machine registered through it. Machine ids are formatted
/// `{base}#{group}#{uuid}`, so the group membership is recoverable from the
/// id alone.
pub struct ChannelGroupToken {
    group_id: u64,
    name: String,
    created_at: DateTime<Utc>,
    released: AtomicBool,
    orchestrator: Arc<EventBusOrchestrator>,
}

impl ChannelGroupToken {
    pub fn new(orchestrator: Arc<EventBusOrchestrator>, name: impl Into<String>) -> Self {
        Self {
            group_id: NEXT_GROUP.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            created_at: Utc::now(),
            released: AtomicBool::new(false),
            orchestrator,
        }
    }

    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_released() {
            return Err(Error::GroupReleased {
                group_id: self.group_id,
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Mint a group-scoped machine id without registering anything.
    pub fn machine_id(&self, base: &str) -> Result<String> {
        self.ensure_live()?;
        Ok(format!("{base}#{}#{}", self.group_id, Uuid::now_v7()))
    }

    /// Register a machine under a freshly minted group id; returns the id.
    pub fn register(&self, base: &str, machine: Machine) -> Result<String> {
        self.ensure_live()?;
        let id = self.machine_id(base)?;
        self.orchestrator
            .register_grouped(&id, machine, self.group_id)?;
        Ok(id)
    }

    pub async fn start_all(&self) -> Result<usize> {
        self.ensure_live()?;
        let infix = format!("#{}#", self.group_id);
        let mut started = 0;
        for id in self.orchestrator.machine_ids() {
            if id.contains(&infix) {
                self.orchestrator.start_machine(&id).await?;
                started += 1;
            }
        }
        Ok(started)
    }

    /// Unregister every machine in the group and poison the token. Returns
    /// how many machines were removed.
    pub async fn release(&self) -> Result<usize> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(Error::GroupReleased {
                group_id: self.group_id,
                name: self.name.clone(),
            });
        }
        let removed = self.orchestrator.unregister_group(self.group_id).await;
        tracing::info!(group = self.group_id, name = %self.name, removed, "channel group released");
        Ok(removed)
    }
}

impl Drop for ChannelGroupToken {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            let removed = self.orchestrator.force_unregister_group(self.group_id);
            if removed > 0 {
                tracing::warn!(
                    group = self.group_id,
                    name = %self.name,
                    removed,
                    "channel group dropped without release; machines force-unregistered"
                );
            }
        }
    }
}

impl std::fmt::Debug for ChannelGroupToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelGroupToken")
            .field("group_id", &self.group_id)
            .field("name", &self.name)
            .field("released", &self.is_released())
            .finish()
    }
}
