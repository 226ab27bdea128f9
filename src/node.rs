use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::management::ManagementService;
use crate::scheduler::acquisition::AcquisitionCycle;
use crate::scheduler::job::Incident;
use crate::scheduler::priority::{ConstantPriority, JobDefaults, PriorityResolver};
use crate::scheduler::retry::RetryPolicy;
use crate::store::JobStore;
use crate::worker::{ExecutionPool, HandlerRegistry, JobHandler, JobRunner};

/// Buffered incidents per subscriber before the slowest one starts lagging.
const INCIDENT_FEED_CAPACITY: usize = 256;

/// One engine node: an acquisition loop feeding a local execution pool,
/// plus the management API, all on top of a store shared with other nodes.
pub struct SchedulerNode {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    resolver: Arc<dyn PriorityResolver>,
    handlers: HandlerRegistry,
    incidents: broadcast::Sender<Incident>,
}

impl SchedulerNode {
    /// Rejects an invalid configuration up front.
    pub fn new(config: SchedulerConfig, store: Arc<dyn JobStore>) -> Result<Self> {
        config.validate()?;
        let (incidents, _) = broadcast::channel(INCIDENT_FEED_CAPACITY);
        Ok(Self {
            resolver: Arc::new(ConstantPriority(config.default_priority)),
            config,
            store,
            clock: Arc::new(SystemClock),
            handlers: HandlerRegistry::new(),
            incidents,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_priority_resolver(mut self, resolver: Arc<dyn PriorityResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_handler(mut self, job_type: &str, handler: impl JobHandler + 'static) -> Self {
        self.handlers = self.handlers.register(job_type, handler);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn management(&self) -> ManagementService {
        ManagementService::new(
            self.store.clone(),
            self.clock.clone(),
            self.resolver.clone(),
            JobDefaults::from(&self.config),
            self.incidents.clone(),
        )
    }

    pub fn subscribe_incidents(&self) -> broadcast::Receiver<Incident> {
        self.incidents.subscribe()
    }

    /// Acquire and execute jobs until `shutdown` fires.
    ///
    /// On shutdown, acquisition stops first, running handlers are cancelled
    /// and every job this node still holds without running it is released.
    pub async fn run(self, shutdown: CancellationToken) {
        let lock_owner = self.config.lock_owner.clone();
        tracing::info!(
            lock_owner = %lock_owner,
            workers = self.config.max_concurrent_executions,
            "Scheduler node starting"
        );

        let runner = Arc::new(JobRunner::new(
            self.store.clone(),
            self.clock.clone(),
            self.handlers,
            RetryPolicy::new(self.config.retry_backoff.clone()),
            self.resolver,
            JobDefaults::from(&self.config),
            lock_owner.clone(),
            self.incidents,
        ));
        let pool = ExecutionPool::start(
            runner,
            self.config.max_concurrent_executions,
            shutdown.clone(),
        );

        let acquisition = AcquisitionCycle::new(&self.config, self.store, self.clock);
        acquisition.run(pool.sender(), shutdown).await;

        pool.join().await;
        tracing::info!(lock_owner = %lock_owner, "Scheduler node stopped");
    }

    /// Spawn [`SchedulerNode::run`] onto the runtime.
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
