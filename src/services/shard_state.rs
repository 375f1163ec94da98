//! Shard State Service
//!
//! Keeps slot state in step with the shard state store:
//!
//! - **pull**: merges persisted stamps into the in-memory managers, so slots
//!   made Active by other ingesting processes get scheduled here
//! - **push**: writes dirty stamps and clears them once the write succeeded
//!
//! Both directions go through coalescing, so racing pushes and pulls
//! converge on the newest stamp per slot.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::traits::ShardStateStore;
use crate::error::Result;
use crate::metrics;
use crate::schedule::ScheduleContext;
use crate::state::ShardStateManager;
use crate::types::ShardId;

use super::framework::{Service, ServiceError, ServiceStatus};

/// Configuration for the shard state service
#[derive(Debug, Clone)]
pub struct ShardStateServiceConfig {
    /// Interval between pushes of dirty stamps
    pub push_interval: Duration,
    /// Interval between pulls of persisted stamps
    pub pull_interval: Duration,
}

impl Default for ShardStateServiceConfig {
    fn default() -> Self {
        Self {
            push_interval: Duration::from_secs(2),
            pull_interval: Duration::from_secs(20),
        }
    }
}

impl From<&Config> for ShardStateServiceConfig {
    fn from(config: &Config) -> Self {
        Self {
            push_interval: Duration::from_millis(config.state.push_interval_ms),
            pull_interval: Duration::from_millis(config.state.pull_interval_ms),
        }
    }
}

/// Synchronizes slot state with a [`ShardStateStore`]
pub struct ShardStateService {
    config: ShardStateServiceConfig,
    context: Arc<ScheduleContext>,
    store: Arc<dyn ShardStateStore>,
    status: RwLock<ServiceStatus>,
}

impl ShardStateService {
    /// Create the service
    pub fn new(
        config: ShardStateServiceConfig,
        context: Arc<ScheduleContext>,
        store: Arc<dyn ShardStateStore>,
    ) -> Self {
        Self {
            config,
            context,
            store,
            status: RwLock::new(ServiceStatus::Stopped),
        }
    }

    /// Merge the persisted state of one managed shard; returns stamps changed
    pub async fn pull_shard(&self, shard: ShardId) -> Result<usize> {
        let Some(manager) = self.context.shard_state_manager(shard) else {
            return Ok(0);
        };
        let persisted = match self.store.load_shard_state(shard).await {
            Ok(persisted) => persisted,
            Err(e) => {
                metrics::record_state_op("pull", false);
                return Err(e.into());
            },
        };
        metrics::record_state_op("pull", true);

        let changed = manager.load(&persisted);
        if changed > 0 {
            debug!(shard, changed, "Pulled shard state");
        }
        Ok(changed)
    }

    /// Pull every managed shard; failures are logged and the rest continue
    pub async fn pull_all(&self) -> usize {
        let mut changed = 0;
        for shard in self.context.managed_shards() {
            match self.pull_shard(shard).await {
                Ok(n) => changed += n,
                Err(e) => warn!(shard, error = %e, "Shard state pull failed"),
            }
        }
        changed
    }

    /// Push dirty stamps of every managed shard; returns stamps written
    ///
    /// Stamps whose push fails stay dirty and go out with the next push.
    pub async fn push_all(&self) -> usize {
        let mut pushed = 0;
        for shard in self.context.managed_shards() {
            let Some(manager) = self.context.shard_state_manager(shard) else {
                continue;
            };
            match self.push_shard(&manager).await {
                Ok(n) => pushed += n,
                Err(e) => warn!(shard, error = %e, "Shard state push failed"),
            }
        }
        pushed
    }

    async fn push_shard(&self, manager: &ShardStateManager) -> Result<usize> {
        let dirty = manager.dirty_snapshot();
        if dirty.values().all(|slots| slots.is_empty()) {
            return Ok(0);
        }

        if let Err(e) = self.store.persist_shard_state(manager.shard(), &dirty).await {
            metrics::record_state_op("push", false);
            return Err(e.into());
        }
        metrics::record_state_op("push", true);

        let cleared = manager.clear_dirty(&dirty);
        debug!(shard = manager.shard(), cleared, "Pushed shard state");
        Ok(cleared)
    }

    /// Start managing `shard` and load its persisted state
    pub async fn add_shard(&self, shard: ShardId) -> Result<usize> {
        self.context.add_shard(shard);
        metrics::update_managed_shards(self.context.managed_shards().len());
        info!(shard, "Managing shard");
        self.pull_shard(shard).await
    }

    /// Stop managing `shard` after pushing its remaining dirty stamps
    pub async fn remove_shard(&self, shard: ShardId) -> Result<()> {
        if let Some(manager) = self.context.shard_state_manager(shard) {
            self.push_shard(&manager).await?;
        }
        self.context.remove_shard(shard);
        metrics::update_managed_shards(self.context.managed_shards().len());
        info!(shard, "Released shard");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Service for ShardStateService {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> std::result::Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Starting;
        let loaded = self.pull_all().await;
        *self.status.write() = ServiceStatus::Running;
        info!(
            shards = self.context.managed_shards().len(),
            loaded,
            "Shard state service started"
        );

        let mut push = interval(self.config.push_interval);
        push.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pull = interval(self.config.pull_interval);
        pull.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the initial pull already ran
        pull.tick().await;

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            debug!("Shard state service received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(missed = n, "Shard state service broadcast receiver lagged");
                        }
                    }
                }

                _ = push.tick() => {
                    self.push_all().await;
                }

                _ = pull.tick() => {
                    self.pull_all().await;
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopping;
        let pushed = self.push_all().await;
        *self.status.write() = ServiceStatus::Stopped;
        info!(pushed, "Shard state service stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "shard_state"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}
