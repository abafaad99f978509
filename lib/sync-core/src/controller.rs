//! Controller driving the reconciler from the notification queue

use crate::cache::ClusterCache;
use crate::model::{Notification, Resource, ResourceKey};
use crate::queue::{NotificationQueue, Task};
use crate::reconciler::Reconciler;
use crate::registry::RegistryClient;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Controller tuning
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Maximum handler invocations per task before it is dropped
    pub max_attempts: u32,
    /// Delay before a failed task is retried
    pub retry_delay: Duration,
    /// How often the cache is polled while waiting for the initial list
    pub sync_poll_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            sync_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Progress of the one-time full reconciliation pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateState {
    NotReady,
    Running,
    Done,
}

/// Latch that lets the full pass run exactly once
#[derive(Debug, Default)]
pub struct SyncGate {
    state: AtomicU8,
}

const GATE_NOT_READY: u8 = 0;
const GATE_RUNNING: u8 = 1;
const GATE_DONE: u8 = 2;

impl SyncGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move from `NotReady` to `Running`. Returns false if the pass already
    /// started.
    pub fn begin(&self) -> bool {
        self.state
            .compare_exchange(GATE_NOT_READY, GATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish(&self) {
        self.state.store(GATE_DONE, Ordering::Release);
    }

    pub fn state(&self) -> GateState {
        match self.state.load(Ordering::Acquire) {
            GATE_NOT_READY => GateState::NotReady,
            GATE_RUNNING => GateState::Running,
            _ => GateState::Done,
        }
    }
}

/// Readiness handle that can be queried while the controller runs
pub struct Readiness<C> {
    cache: Arc<C>,
    gate: Arc<SyncGate>,
}

impl<C> Clone for Readiness<C> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            gate: self.gate.clone(),
        }
    }
}

impl<C: ClusterCache> Readiness<C> {
    /// True once the cache is primed and the full pass has been attempted
    pub fn has_synced(&self) -> bool {
        self.cache.has_synced_initial_list() && self.gate.state() == GateState::Done
    }
}

/// Controller drains the notification queue on a single worker.
pub struct Controller<C, R> {
    config: ControllerConfig,
    cache: Arc<C>,
    reconciler: Reconciler<C, R>,
    queue: NotificationQueue,
    gate: Arc<SyncGate>,
}

impl<C, R> Controller<C, R>
where
    C: ClusterCache + 'static,
    R: RegistryClient,
{
    pub fn new(config: ControllerConfig, cache: Arc<C>, client: R) -> Self {
        Self {
            config,
            reconciler: Reconciler::new(cache.clone(), client),
            cache,
            queue: NotificationQueue::new(),
            gate: Arc::new(SyncGate::new()),
        }
    }

    /// Producer handle for the watch cache
    pub fn queue(&self) -> NotificationQueue {
        self.queue.clone()
    }

    pub fn readiness(&self) -> Readiness<C> {
        Readiness {
            cache: self.cache.clone(),
            gate: self.gate.clone(),
        }
    }

    pub fn has_synced(&self) -> bool {
        self.readiness().has_synced()
    }

    pub fn reconciler(&self) -> &Reconciler<C, R> {
        &self.reconciler
    }

    /// Run until `stop` flips to true or its sender is dropped.
    ///
    /// Waits for the cache's initial list, reconciles every cached service
    /// once, then processes queued notifications one at a time. The task in
    /// flight when stop fires is finished before returning.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!("Starting sync controller");

        if !self.wait_for_cache(&mut stop).await {
            info!("Stopped before the cluster cache synced");
            self.queue.shut_down();
            return;
        }

        self.sync_all_services().await;

        let queue = self.queue.clone();
        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                task = queue.get() => match task {
                    Some(task) => self.process(task).await,
                    None => break,
                },
            }
        }

        self.queue.shut_down();
        info!("Sync controller stopped");
    }

    async fn wait_for_cache(&self, stop: &mut watch::Receiver<bool>) -> bool {
        let mut interval = tokio::time::interval(self.config.sync_poll_interval);
        loop {
            if self.cache.has_synced_initial_list() {
                return true;
            }
            tokio::select! {
                _ = stopped(stop) => return false,
                _ = interval.tick() => {}
            }
        }
    }

    /// Reconcile every cached service as an add, exactly once
    pub async fn sync_all_services(&mut self) {
        if !self.gate.begin() {
            return;
        }

        let started = Instant::now();
        let services = self.cache.list_services();
        let total = services.len();
        let mut failed = 0usize;

        for svc in services {
            let notification = Notification::add(Resource::Service(svc));
            if let Err(e) = self.reconciler.reconcile(&notification).await {
                failed += 1;
                warn!(key = %notification.key(), error = %e, "Initial sync of service failed");
            }
        }

        self.gate.finish();
        info!(
            services = total,
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Synced all services to registry"
        );
    }

    /// Handle one task, applying the bounded retry policy on failure
    pub async fn process(&mut self, task: Task<ResourceKey, Notification>) {
        debug!(key = %task.key, "Processing notification");
        let result = self.reconciler.reconcile(&task.payload).await;
        self.queue.done(&task);

        let err = match result {
            Ok(()) => {
                self.queue.forget(&task);
                return;
            }
            Err(e) => e,
        };

        let attempt = self.queue.num_requeues(&task) + 1;
        if err.is_retryable() && attempt < self.config.max_attempts {
            warn!(
                key = %task.key,
                attempt,
                error = %err,
                "Task handle failed, putting it back into the queue"
            );
            self.queue.requeue(task, self.config.retry_delay);
        } else {
            warn!(
                key = %task.key,
                attempt,
                error = %err,
                "Task handle reached max attempts, dropping it"
            );
            self.queue.forget(&task);
        }
    }
}

/// Resolves once the stop flag is set or the sender is gone
pub async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}
