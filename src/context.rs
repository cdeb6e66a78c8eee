//! Agent context: every long-lived component, built once by the entry point
//! and passed to the agent loop.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AgentConfig;
use crate::executor::{ExecutorEvent, TaskExecutor};
use crate::network::{ConnectionProvider, SocketProvider, TrafficBudget};
use crate::report::ReportStore;
use crate::scheduler::{Scheduler, SchedulerStorage};

pub struct AgentContext {
    pub config: AgentConfig,
    pub provider: Arc<dyn ConnectionProvider>,
    pub scheduler: Scheduler,
    pub executor: TaskExecutor,
    pub reports: ReportStore,
    pub(crate) executor_events: mpsc::UnboundedReceiver<ExecutorEvent>,
    shutdown: CancellationToken,
}

impl AgentContext {
    /// Wire components together.  The executor shares the context's
    /// shutdown token as its stop path.
    pub fn new(
        config: AgentConfig,
        provider: Arc<dyn ConnectionProvider>,
        scheduler: Scheduler,
        reports: ReportStore,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let executor = TaskExecutor::new(
            provider.clone(),
            config.executor.run_timeout(),
            tx,
            shutdown.clone(),
        );
        Self {
            config,
            provider,
            scheduler,
            executor,
            reports,
            executor_events: rx,
            shutdown,
        }
    }

    /// Socket provider, persistent scheduler and report store as configured.
    pub fn from_config(config: AgentConfig) -> Result<Self> {
        let budget = Arc::new(TrafficBudget::new(config.traffic.available_bytes));
        let provider: Arc<dyn ConnectionProvider> =
            Arc::new(SocketProvider::new(budget, &config.traffic));
        let storage = SchedulerStorage::open(&config.scheduler.storage_dir, config.scheduler.realtime)?;
        let reports = ReportStore::open(&config.reports.storage_dir)?;
        Ok(Self::new(config, provider, Scheduler::with_storage(storage), reports))
    }

    /// Like [`AgentContext::from_config`] but with nothing written to disk.
    pub fn ephemeral(config: AgentConfig) -> Self {
        let budget = Arc::new(TrafficBudget::new(config.traffic.available_bytes));
        let provider: Arc<dyn ConnectionProvider> =
            Arc::new(SocketProvider::new(budget, &config.traffic));
        Self::new(config, provider, Scheduler::new(), ReportStore::in_memory())
    }

    /// Re-enqueue every definition found in scheduler storage.
    pub fn restore_pending(&mut self) -> usize {
        let Some(storage) = self.scheduler.storage() else {
            return 0;
        };
        let definitions = storage.load();
        let restored = self.scheduler.restore(definitions, Utc::now());
        info!(restored, "pending tests restored");
        restored
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the running probe and end the agent loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
