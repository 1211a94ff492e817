//! Reconciles the set of running workers with the instances reported by the
//! directory.
//!
//! A single reconciliation loop owns the worker set. Every tick it computes
//! the desired `(driver, instance)` pairs, spawns the missing workers and
//! cancels the ones that are no longer wanted. Workers report back over a
//! channel, so the set is never shared between tasks.
//!
//! ```text
//! absent -> starting -> running -> stopping -> absent
//! ```
//!
//! A worker whose collector cannot be built exits straight from `starting` and
//! is retried on the next tick if it is still desired.

use crate::{
    brokerinfo::{InstanceDirectory, InstanceInfo},
    collectors::CollectorDriver,
    emitter::MetricsSink,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot, watch,
    },
    time::{MissedTickBehavior, interval, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span};
use tracing_futures::Instrument as _;

mod worker;

use self::worker::{Worker, WorkerEvent};

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{what} must be greater than zero")]
    InvalidInterval { what: String },

    #[error("scheduler has already been started")]
    AlreadyRunning,
}

/// Identifies one worker: a driver bound to an instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId {
    pub driver: String,
    pub instance_guid: String,
}

impl WorkerId {
    pub fn new(driver: impl Into<String>, instance_guid: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            instance_guid: instance_guid.into(),
        }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.driver, self.instance_guid)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Stopped,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerState {
    Starting,
    Running,
    Stopping,
}

struct WorkerHandle {
    cancel: CancellationToken,
    state: WorkerState,
}

type Desired = BTreeMap<WorkerId, (Arc<dyn CollectorDriver>, InstanceInfo)>;

/// Every `(driver, instance)` pair where the driver supports the instance type.
fn desired_workers(drivers: &[Arc<dyn CollectorDriver>], instances: &[InstanceInfo]) -> Desired {
    let mut desired = BTreeMap::new();

    for instance in instances {
        for driver in drivers.iter().filter(|d| d.supports(&instance.kind)) {
            desired.insert(
                WorkerId::new(driver.name(), &instance.guid),
                (Arc::clone(driver), instance.clone()),
            );
        }
    }

    desired
}

/// Sets [`RunState::Stopped`] however `run` returns.
struct StateGuard<'a>(&'a watch::Sender<RunState>);

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(RunState::Stopped);
    }
}

pub struct Scheduler {
    directory: Arc<dyn InstanceDirectory>,
    sink: Arc<dyn MetricsSink>,
    drivers: Vec<Arc<dyn CollectorDriver>>,
    refresh_interval: Duration,
    drain_timeout: Duration,
    shutdown: CancellationToken,
    state: watch::Sender<RunState>,
    running: watch::Sender<BTreeSet<WorkerId>>,
}

impl Scheduler {
    pub fn new(
        directory: Arc<dyn InstanceDirectory>,
        sink: Arc<dyn MetricsSink>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            directory,
            sink,
            drivers: Vec::new(),
            refresh_interval,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            shutdown: CancellationToken::new(),
            state: watch::Sender::new(RunState::Idle),
            running: watch::Sender::new(BTreeSet::new()),
        }
    }

    /// Register a driver. Drivers cannot be added once the scheduler runs.
    #[must_use]
    pub fn with_driver(mut self, driver: Arc<dyn CollectorDriver>) -> Self {
        self.drivers.push(driver);
        self
    }

    #[must_use]
    pub fn with_drivers(
        mut self,
        drivers: impl IntoIterator<Item = Arc<dyn CollectorDriver>>,
    ) -> Self {
        self.drivers.extend(drivers);
        self
    }

    #[must_use]
    pub const fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn driver_names(&self) -> Vec<&str> {
        self.drivers.iter().map(|d| d.name()).collect()
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Workers whose collector is up and polling.
    pub fn running_workers(&self) -> BTreeSet<WorkerId> {
        self.running.borrow().clone()
    }

    pub fn subscribe_workers(&self) -> watch::Receiver<BTreeSet<WorkerId>> {
        self.running.subscribe()
    }

    /// Ask `run` to stop and wait until every worker closed its collector or
    /// the drain timeout elapsed. Returns at once if `run` is not active.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s != RunState::Running).await;
    }

    fn validate(&self) -> Result<(), SchedulerError> {
        if self.refresh_interval.is_zero() {
            return Err(SchedulerError::InvalidInterval {
                what: "instance refresh interval".to_string(),
            });
        }

        if let Some(driver) = self.drivers.iter().find(|d| d.collect_interval().is_zero()) {
            return Err(SchedulerError::InvalidInterval {
                what: format!("collect interval of driver {}", driver.name()),
            });
        }

        Ok(())
    }

    /// Reconcile until `stop` is cancelled or [`Scheduler::stop`] is called,
    /// then drain every worker.
    ///
    /// `ready` fires once the first reconciliation is scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] if an interval is zero or the scheduler was
    /// already started
    pub async fn run(
        &self,
        stop: CancellationToken,
        ready: Option<oneshot::Sender<()>>,
    ) -> Result<(), SchedulerError> {
        self.validate()?;

        let started = self.state.send_if_modified(|state| {
            if *state == RunState::Idle {
                *state = RunState::Running;
                true
            } else {
                false
            }
        });

        if !started {
            return Err(SchedulerError::AlreadyRunning);
        }

        let _guard = StateGuard(&self.state);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut workers: HashMap<WorkerId, WorkerHandle> = HashMap::new();

        let mut ticker = interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if let Some(ready) = ready {
            let _ = ready.send(());
        }

        info!(
            drivers = ?self.driver_names(),
            refresh_interval = ?self.refresh_interval,
            "scheduler_started"
        );

        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => {
                    info!("stop signal received");
                    break;
                }
                () = self.shutdown.cancelled() => {
                    info!("stop requested");
                    break;
                }
                Some(event) = events_rx.recv() => self.handle_event(&mut workers, event),
                _ = ticker.tick() => self.reconcile(&mut workers, &events_tx, &stop).await,
            }
        }

        self.drain(&mut workers, &mut events_rx).await;

        info!("scheduler_stopped");

        Ok(())
    }

    fn handle_event(&self, workers: &mut HashMap<WorkerId, WorkerHandle>, event: WorkerEvent) {
        match event {
            WorkerEvent::Started(id) => {
                if let Some(handle) = workers.get_mut(&id)
                    && handle.state == WorkerState::Starting
                {
                    handle.state = WorkerState::Running;
                }
            }
            WorkerEvent::Exited(id) => {
                debug!(worker = %id, "worker exited");
                workers.remove(&id);
            }
        }

        self.publish(workers);
    }

    async fn reconcile(
        &self,
        workers: &mut HashMap<WorkerId, WorkerHandle>,
        events: &UnboundedSender<WorkerEvent>,
        stop: &CancellationToken,
    ) {
        let listing = tokio::select! {
            biased;
            () = stop.cancelled() => return,
            () = self.shutdown.cancelled() => return,
            listing = self.directory.list_instances() => listing,
        };

        let instances = match listing {
            Ok(instances) => instances,
            Err(err) => {
                error!(error = %format!("{err:#}"), "list_instances_failed");
                return;
            }
        };

        let desired = desired_workers(&self.drivers, &instances);

        debug!(
            instances = instances.len(),
            desired = desired.len(),
            current = workers.len(),
            "reconciling"
        );

        for (id, (driver, instance)) in &desired {
            if workers.contains_key(id) {
                continue;
            }

            info!(worker = %id, guid = %instance.guid, driver = %id.driver, "start_worker");

            let cancel = self.shutdown.child_token();
            let worker = Worker {
                id: id.clone(),
                driver: Arc::clone(driver),
                instance: instance.clone(),
                sink: Arc::clone(&self.sink),
                cancel: cancel.clone(),
                events: events.clone(),
            };

            let span = info_span!("worker", worker = %id);
            tokio::spawn(worker.run().instrument(span));

            workers.insert(
                id.clone(),
                WorkerHandle {
                    cancel,
                    state: WorkerState::Starting,
                },
            );
        }

        for (id, handle) in workers.iter_mut() {
            if desired.contains_key(id) || handle.state == WorkerState::Stopping {
                continue;
            }

            info!(worker = %id, "stop_worker");
            handle.cancel.cancel();
            handle.state = WorkerState::Stopping;
        }

        self.publish(workers);
    }

    async fn drain(
        &self,
        workers: &mut HashMap<WorkerId, WorkerHandle>,
        events: &mut UnboundedReceiver<WorkerEvent>,
    ) {
        for (id, handle) in workers.iter_mut() {
            if handle.state != WorkerState::Stopping {
                info!(worker = %id, "stop_worker");
            }
            handle.cancel.cancel();
            handle.state = WorkerState::Stopping;
        }

        self.publish(workers);

        let wait = async {
            while !workers.is_empty() {
                match events.recv().await {
                    Some(WorkerEvent::Exited(id)) => {
                        workers.remove(&id);
                    }
                    Some(WorkerEvent::Started(_)) => {}
                    None => break,
                }
            }
        };

        if timeout(self.drain_timeout, wait).await.is_err() {
            let wedged: Vec<String> = workers.keys().map(ToString::to_string).collect();
            error!(
                workers = ?wedged,
                timeout = ?self.drain_timeout,
                "drain_timeout"
            );
        }

        self.running.send_replace(BTreeSet::new());
    }

    fn publish(&self, workers: &HashMap<WorkerId, WorkerHandle>) {
        let running: BTreeSet<WorkerId> = workers
            .iter()
            .filter(|(_, h)| h.state == WorkerState::Running)
            .map(|(id, _)| id.clone())
            .collect();

        self.running.send_if_modified(|current| {
            if *current == running {
                false
            } else {
                *current = running;
                true
            }
        });
    }
}
