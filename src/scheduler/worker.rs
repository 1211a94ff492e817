use crate::{
    brokerinfo::InstanceInfo,
    collectors::{CollectError, Collector, CollectorDriver},
    emitter::MetricsSink,
    metrics::MetricEnvelope,
    scheduler::WorkerId,
};
use std::sync::Arc;
use tokio::{
    sync::mpsc::UnboundedSender,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum WorkerEvent {
    /// The collector was built and the poll loop is about to start.
    Started(WorkerId),
    /// The task is gone. Sent exactly once per spawned worker.
    Exited(WorkerId),
}

/// Sends [`WorkerEvent::Exited`] when dropped, so a worker reports completion
/// on every path out of its task, unwinding included.
struct Completion {
    id: Option<WorkerId>,
    events: UnboundedSender<WorkerEvent>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            // the receiver is gone only once the scheduler stopped listening
            let _ = self.events.send(WorkerEvent::Exited(id));
        }
    }
}

pub(crate) struct Worker {
    pub(crate) id: WorkerId,
    pub(crate) driver: Arc<dyn CollectorDriver>,
    pub(crate) instance: InstanceInfo,
    pub(crate) sink: Arc<dyn MetricsSink>,
    pub(crate) cancel: CancellationToken,
    pub(crate) events: UnboundedSender<WorkerEvent>,
}

impl Worker {
    pub(crate) async fn run(self) {
        let _completion = Completion {
            id: Some(self.id.clone()),
            events: self.events.clone(),
        };

        let built = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                debug!(worker = %self.id, "cancelled before the collector was built");
                return;
            }
            built = self.driver.new_collector(&self.instance) => built,
        };

        let mut collector = match built {
            Ok(collector) => collector,
            Err(err) => {
                error!(
                    worker = %self.id,
                    guid = %self.instance.guid,
                    driver = %self.id.driver,
                    error = %err,
                    "start_worker_failed"
                );
                return;
            }
        };

        let _ = self.events.send(WorkerEvent::Started(self.id.clone()));
        info!(worker = %self.id, guid = %self.instance.guid, "worker_started");

        let mut ticker = interval(self.driver.collect_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.collect_once(collector.as_mut()).await,
            }
        }

        if let Err(err) = collector.close().await {
            warn!(worker = %self.id, error = %format!("{err:#}"), "close_failed");
        }

        self.sink.forget(&self.instance.guid);

        info!(worker = %self.id, guid = %self.instance.guid, "worker_stopped");
    }

    async fn collect_once(&self, collector: &mut dyn Collector) {
        debug!(worker = %self.id, "collecting_metrics");

        match collector.collect(&self.cancel).await {
            Ok(metrics) => {
                debug!(worker = %self.id, metrics = metrics.len(), "collected");
                for metric in metrics {
                    self.sink
                        .emit(MetricEnvelope::new(&self.instance.guid, metric));
                }
            }
            Err(CollectError::Cancelled) => {
                debug!(worker = %self.id, "collection cancelled");
            }
            Err(err) => {
                error!(
                    worker = %self.id,
                    guid = %self.instance.guid,
                    error = %err,
                    "collect_failed"
                );
            }
        }
    }
}
