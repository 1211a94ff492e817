use crate::{brokerinfo::InstanceInfo, metrics::Metric};
use futures::future::BoxFuture;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod cloudwatch;
pub mod error;
pub mod mysql;
pub mod postgres;
pub mod query;
pub mod sql;

pub use error::{CollectError, ConnectionSetupError, QueryError};

/// A metric source that can be bound to instances of the types it supports.
///
/// Drivers are registered once at startup and live for the whole process.
pub trait CollectorDriver: Send + Sync {
    /// Stable identifier, part of every worker id built from this driver.
    fn name(&self) -> &str;

    /// Instance types this driver can service.
    fn supported_types(&self) -> &[String];

    /// Delay between two `collect` calls of a worker built from this driver.
    fn collect_interval(&self) -> Duration;

    /// Bind the driver to one instance.
    fn new_collector<'a>(
        &'a self,
        instance: &'a InstanceInfo,
    ) -> BoxFuture<'a, Result<Box<dyn Collector>, ConnectionSetupError>>;

    fn supports(&self, kind: &str) -> bool {
        self.supported_types().iter().any(|t| t == kind)
    }
}

/// A live, per-instance handle owned by exactly one worker.
pub trait Collector: Send {
    /// Run every configured fetch against the bound instance.
    ///
    /// A failing query or counter is logged and omitted; only a failed
    /// liveness check fails the whole call. The token aborts remaining
    /// fetches, returning whatever was already collected.
    fn collect<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<Metric>, CollectError>>;

    /// Release the underlying connection or session.
    fn close(&mut self) -> BoxFuture<'_, anyhow::Result<()>>;
}
