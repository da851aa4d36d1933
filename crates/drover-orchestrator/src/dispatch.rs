//! The dispatcher: pulls work, reserves an endpoint and runs the pipeline.
//!
//! Each worker loops over
//!
//! 1. `pull` an item from the [`WorkQueue`]
//! 2. `reserve` an endpoint from the [`Cluster`]
//! 3. lock the item's resources, `connect`, `setup`, run the stages, `destroy`
//! 4. release the endpoint, `ack` the item and announce the result on the
//!    [`EventBus`]
//!
//! Step failures end up in the run status. Only queue and pool failures
//! stop a worker.
//!
//! A run is stopped when its deadline passes or the queue cancels its
//! claim. Running steps are then killed, remaining stages are skipped and
//! the run ends `killed`; teardown still happens.

use drover_core::line::MAX_LOG_UPLOAD;
use drover_core::{Endpoint, EnvPhase, Event, LineKind, LogFile, Stage, Status, Step, Task, WorkItem};
use drover_transport::{EventBus, LineWriter, Peer, TransportError, WorkQueue};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::backend::{BoxedEngine, EngineFactory};
use crate::cluster::Cluster;
use crate::error::{OrchestratorError, Result};
use crate::lock::{acquire_all, LockManager};

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Pause after a failed pull.
    pub pull_retry_delay: Duration,
    /// Attempts for a retryable setup failure.
    pub setup_attempts: u32,
    /// Pause between setup attempts.
    pub setup_retry_delay: Duration,
    /// Bound on each resource lock acquisition.
    pub lock_timeout: Duration,
    /// How often claims are renewed while a run is in progress. Zero
    /// disables renewal.
    pub lease_interval: Duration,
    /// Run timeout for items that carry none.
    pub run_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            pull_retry_delay: Duration::from_secs(5),
            setup_attempts: 3,
            setup_retry_delay: Duration::from_secs(2),
            lock_timeout: Duration::from_secs(60),
            lease_interval: Duration::from_secs(30),
            run_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// Outcome of the stages of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RunReport {
    status: Status,
    failed_step: Option<String>,
}

/// Ties the queue, the worker pool and the backends together.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn WorkQueue>,
    cluster: Cluster<Endpoint>,
    factory: Arc<dyn EngineFactory>,
    bus: EventBus,
    peer: Arc<dyn Peer>,
    locks: Arc<LockManager>,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        cluster: Cluster<Endpoint>,
        factory: Arc<dyn EngineFactory>,
        bus: EventBus,
        peer: Arc<dyn Peer>,
        locks: Arc<LockManager>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            queue,
            cluster,
            factory,
            bus,
            peer,
            locks,
            config,
        }
    }

    /// Returns the event bus results are announced on.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Returns the worker pool.
    pub fn cluster(&self) -> &Cluster<Endpoint> {
        &self.cluster
    }

    /// Runs the workers until `cancel` fires, the queue closes or the pool
    /// closes. Runs already in progress are finished first.
    pub async fn run(&self, cancel: CancellationToken) {
        let workers = self.config.workers.max(1);
        info!(workers, "dispatcher started");

        let mut set = JoinSet::new();
        for worker in 0..workers {
            let this = self.clone();
            let cancel = cancel.clone();
            set.spawn(async move { this.worker(worker, cancel).await });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "dispatch worker panicked");
            }
        }
        info!("dispatcher stopped");
    }

    async fn worker(&self, worker: usize, cancel: CancellationToken) {
        loop {
            let pulled = tokio::select! {
                _ = cancel.cancelled() => break,
                pulled = self.queue.pull() => pulled,
            };

            let item = match pulled {
                Ok(item) => item,
                Err(TransportError::Closed) => {
                    info!(worker, "queue closed, worker stopping");
                    break;
                }
                Err(e) => {
                    warn!(worker, error = %e, "pull failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.pull_retry_delay) => continue,
                    }
                }
            };

            let reserved = tokio::select! {
                _ = cancel.cancelled() => Err(OrchestratorError::ClusterClosed),
                reserved = self.cluster.reserve() => reserved,
            };
            let reservation = match reserved {
                Ok(reservation) => reservation,
                Err(e) => {
                    warn!(worker, item = %item.id, error = %e, "no endpoint available, worker stopping");
                    if let Err(e) = self.queue.requeue(&item).await {
                        error!(item = %item.id, error = %e, "failed to requeue work item");
                    }
                    break;
                }
            };

            let task = self.execute(&item, reservation.client()).await;

            reservation.release();
            if let Err(e) = self.queue.ack(&item).await {
                warn!(item = %item.id, error = %e, "failed to acknowledge work item");
            }
            self.bus.send(Event::task(task)).await;
        }
    }

    /// Runs one item on `endpoint` and returns its finished task record.
    ///
    /// Emits the `running` event but not the final one.
    pub async fn execute(&self, item: &WorkItem, endpoint: &Endpoint) -> Task {
        info!(item = %item.id, endpoint = %endpoint, "run started");
        let task = Task::running(&item.id, endpoint.to_string());
        self.bus.send(Event::task(task.clone())).await;

        let _lease = self.renew_lease(item);
        let stop = CancellationToken::new();
        let _watch = self.watch_run(item, stop.clone());

        match self.run_item(item, endpoint, &stop).await {
            Ok(report) => {
                info!(item = %item.id, status = %report.status, "run finished");
                let mut task = task.finish(report.status);
                task.failed_step = report.failed_step;
                task
            }
            Err(e) => {
                error!(item = %item.id, error = %e, "run errored");
                let mut task = task.finish(Status::Error);
                task.error = Some(e.to_string());
                task
            }
        }
    }

    fn renew_lease(&self, item: &WorkItem) -> Option<DropGuard> {
        let interval = self.config.lease_interval;
        if interval.is_zero() {
            return None;
        }

        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();
        let queue = Arc::clone(&self.queue);
        let item = item.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = queue.extend(&item).await {
                            warn!(item = %item.id, error = %e, "failed to renew claim");
                        }
                    }
                }
            }
        });

        Some(guard)
    }

    /// Fires `stop` when the run deadline passes or the queue cancels the
    /// claim, whichever comes first.
    fn watch_run(&self, item: &WorkItem, stop: CancellationToken) -> DropGuard {
        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();
        let queue = Arc::clone(&self.queue);
        let item = item.clone();
        let timeout = self.run_timeout(&item);

        tokio::spawn(async move {
            let cancelled = async {
                match queue.cancelled(&item).await {
                    Ok(()) => {}
                    Err(e) => {
                        debug!(item = %item.id, error = %e, "not watching for cancellation");
                        std::future::pending::<()>().await;
                    }
                }
            };

            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    warn!(item = %item.id, ?timeout, "run timed out, stopping");
                    stop.cancel();
                }
                _ = cancelled => {
                    warn!(item = %item.id, "run cancelled, stopping");
                    stop.cancel();
                }
            }
        });

        guard
    }

    async fn run_item(&self, item: &WorkItem, endpoint: &Endpoint, stop: &CancellationToken) -> Result<RunReport> {
        let mut locks = acquire_all(&self.locks, &item.config.resources, self.config.lock_timeout).await?;
        let engine = self.factory.connect(endpoint, item).await?;
        debug!(item = %item.id, backend = engine.name(), "engine connected");

        let mut phase = EnvPhase::Created;
        let result = self.run_pipeline(item, &engine, &mut phase, stop).await;

        if let Err(e) = engine.destroy(&item.config).await {
            error!(item = %item.id, error = %e, "failed to destroy pipeline environment");
        }
        advance(&item.id, &mut phase, EnvPhase::Terminated);

        for lock in &mut locks {
            lock.release();
        }
        result
    }

    async fn run_pipeline(
        &self,
        item: &WorkItem,
        engine: &BoxedEngine,
        phase: &mut EnvPhase,
        stop: &CancellationToken,
    ) -> Result<RunReport> {
        tokio::select! {
            setup = self.setup(item, engine) => setup?,
            _ = stop.cancelled() => return Err(OrchestratorError::RunStopped),
        }
        advance(&item.id, phase, EnvPhase::Ready);

        let secrets = item.config.masked_secrets();
        let mut statuses = Vec::new();
        let mut failed_step = None;

        for stage in &item.config.stages {
            if stop.is_cancelled() {
                debug!(item = %item.id, stage = %stage.name, "run stopped, skipping stage");
                break;
            }
            let failed = statuses.iter().any(Status::is_failure);
            let steps = runnable(stage, failed);
            if steps.is_empty() {
                continue;
            }
            advance(&item.id, phase, EnvPhase::Running);

            let results = join_all(
                steps
                    .iter()
                    .map(|step| self.run_step(item, engine, step, &secrets, stop)),
            )
            .await;

            for (step, status) in steps.iter().zip(results) {
                if status.is_failure() && failed_step.is_none() {
                    failed_step = Some(step.name.clone());
                }
                statuses.push(status);
            }
        }

        let status = if stop.is_cancelled() {
            Status::Killed
        } else {
            Status::aggregate(&statuses)
        };
        advance(&item.id, phase, EnvPhase::from_status(status));
        Ok(RunReport { status, failed_step })
    }

    async fn setup(&self, item: &WorkItem, engine: &BoxedEngine) -> Result<()> {
        let attempts = self.config.setup_attempts.max(1);
        let mut attempt = 1;

        loop {
            match engine.setup(&item.config).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts && e.is_retryable() => {
                    warn!(item = %item.id, attempt, error = %e, "setup failed, retrying");
                    tokio::time::sleep(self.config.setup_retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(OrchestratorError::setup_failed(e.to_string())),
            }
        }
    }

    fn run_timeout(&self, item: &WorkItem) -> Duration {
        if item.timeout_secs > 0 {
            Duration::from_secs(item.timeout_secs)
        } else {
            self.config.run_timeout
        }
    }

    async fn run_step(
        &self,
        item: &WorkItem,
        engine: &BoxedEngine,
        step: &Step,
        secrets: &[String],
        stop: &CancellationToken,
    ) -> Status {
        let mut writer = LineWriter::new(
            Arc::clone(&self.peer),
            &item.id,
            step.display_name(),
            secrets.iter().cloned(),
        );

        if let Err(e) = engine.exec(step).await {
            error!(item = %item.id, step = %step.name, error = %e, "step failed to start");
            writer.write_kind(LineKind::Stderr, e.to_string().as_bytes()).await;
            self.upload(item, step, &writer).await;
            return Status::Error;
        }

        if step.detached {
            debug!(item = %item.id, step = %step.name, "detached step left running");
            return Status::Success;
        }

        let tail = async {
            match engine.tail(step).await {
                Ok(stream) => {
                    if let Err(e) = writer.copy_stream(stream).await {
                        warn!(item = %item.id, step = %step.name, error = %e, "log stream interrupted");
                    }
                }
                Err(e) => warn!(item = %item.id, step = %step.name, error = %e, "failed to tail step"),
            }
        };

        let wait = async {
            tokio::select! {
                waited = engine.wait(step) => match waited {
                    Ok(state) => (Status::from_state(&state), Some(state.exit_code)),
                    Err(e) => {
                        error!(item = %item.id, step = %step.name, error = %e, "failed to wait for step");
                        (Status::Error, None)
                    }
                },
                _ = stop.cancelled() => {
                    warn!(item = %item.id, step = %step.name, "run stopped, killing step");
                    if let Err(e) = engine.kill(step).await {
                        error!(item = %item.id, step = %step.name, error = %e, "failed to kill step");
                    }
                    (Status::Killed, None)
                }
            }
        };

        let ((), (status, exit_code)) = tokio::join!(tail, wait);

        if let Some(code) = exit_code {
            writer.write_kind(LineKind::ExitCode, code.to_string().as_bytes()).await;
        }
        self.upload(item, step, &writer).await;

        info!(item = %item.id, step = %step.name, status = %status, "step finished");
        status
    }

    async fn upload(&self, item: &WorkItem, step: &Step, writer: &LineWriter) {
        match LogFile::from_lines(step.display_name(), writer.lines(), MAX_LOG_UPLOAD) {
            Ok(file) => {
                if let Err(e) = self.peer.upload(&item.id, file).await {
                    warn!(item = %item.id, step = %step.name, error = %e, "failed to upload step log");
                }
            }
            Err(e) => warn!(item = %item.id, step = %step.name, error = %e, "failed to encode step log"),
        }
    }
}

fn runnable(stage: &Stage, failed: bool) -> Vec<&Step> {
    stage
        .steps
        .iter()
        .filter(|step| {
            let run = step.should_run(failed);
            if !run {
                debug!(stage = %stage.name, step = %step.name, "step skipped");
            }
            run
        })
        .collect()
}

fn advance(item: &str, phase: &mut EnvPhase, next: EnvPhase) {
    if *phase == next {
        return;
    }
    if let Err(e) = phase.transition(next) {
        warn!(item, error = %e, "unexpected environment transition");
    }
}

/// Pings every endpoint and allocates the reachable ones. Returns how many
/// were allocated.
pub async fn register_endpoints(
    factory: &dyn EngineFactory,
    cluster: &Cluster<Endpoint>,
    endpoints: impl IntoIterator<Item = Endpoint>,
) -> usize {
    let mut allocated = 0;
    for endpoint in endpoints {
        match factory.ping(&endpoint).await {
            Ok(()) => {
                if cluster.allocate(endpoint.clone()) {
                    info!(endpoint = %endpoint, kind = %endpoint.kind, "endpoint registered");
                    allocated += 1;
                } else {
                    warn!(endpoint = %endpoint, "endpoint not registered (duplicate or pool full)");
                }
            }
            Err(e) => warn!(endpoint = %endpoint, error = %e, "endpoint unreachable, skipping"),
        }
    }
    allocated
}
