//! Instance statistics published by `CloudWatch` under the `AWS/RDS` namespace.

use crate::{
    brokerinfo::{InstanceDirectory, InstanceInfo},
    collectors::{
        Collector, CollectorDriver,
        error::{CollectError, ConnectionSetupError},
    },
    metrics::{Metric, SOURCE_CLOUDWATCH},
};
use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_cloudwatch::{
    Client,
    config::Region,
    operation::get_metric_statistics::builders::GetMetricStatisticsFluentBuilder,
    primitives::DateTime,
    types::{Dimension, Statistic},
};
use futures::future::BoxFuture;
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span};
use tracing_futures::Instrument as _;

const NAMESPACE: &str = "AWS/RDS";
const DIMENSION: &str = "DBInstanceIdentifier";
const PERIOD_SECONDS: i32 = 60;
const WINDOW: Duration = Duration::from_secs(10 * 60);

/// Remote counter name and the metric key it is reported as.
pub const COUNTERS: &[(&str, &str)] = &[
    ("CPUUtilization", "cpu"),
    ("CPUCreditUsage", "cpu_credit_usage"),
    ("CPUCreditBalance", "cpu_credit_balance"),
    ("FreeableMemory", "freeable_memory"),
    ("FreeStorageSpace", "free_storage_space"),
    ("SwapUsage", "swap_usage"),
    ("NetworkReceiveThroughput", "network_receive_rate"),
    ("NetworkTransmitThroughput", "network_transmit_rate"),
    ("DiskQueueDepth", "disk_queue_depth"),
    ("ReadIOPS", "read_iops"),
    ("ReadLatency", "read_latency"),
    ("ReadThroughput", "read_rate"),
    ("WriteIOPS", "write_iops"),
    ("WriteLatency", "write_latency"),
    ("WriteThroughput", "write_rate"),
    ("ReplicaLag", "replica_lag"),
    ("ReplicationSlotDiskUsage", "replica_slot_disk_usage"),
    ("OldestReplicationSlotLag", "replication_lag"),
    ("MaximumUsedTransactionIDs", "max_used_transaction_ids"),
    ("TransactionLogsDiskUsage", "transaction_logs_disk_usage"),
    ("TransactionLogsGeneration", "transaction_logs_generation"),
];

#[derive(Clone, Debug, PartialEq)]
pub struct Datapoint {
    /// Nanoseconds since the Unix epoch.
    pub timestamp_nanos: i64,
    pub value: f64,
    pub unit: String,
}

/// Read access to the averaged datapoints of one counter over the trailing
/// window.
pub trait StatisticsSource: Send + Sync {
    fn fetch<'a>(
        &'a self,
        instance_name: &'a str,
        counter: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Datapoint>>>;
}

pub struct AwsStatisticsSource {
    client: Client,
}

impl AwsStatisticsSource {
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the default credential chain for `region`.
    pub async fn from_region(region: impl Into<String>) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.into()))
            .load()
            .await;

        Self::new(Client::new(&config))
    }
}

fn dimension(instance_name: &str) -> Dimension {
    Dimension::builder()
        .name(DIMENSION)
        .value(instance_name)
        .build()
}

/// `GetMetricStatistics` for the average of `counter` between `start` and `end`.
fn statistics_request(
    client: &Client,
    instance_name: &str,
    counter: &str,
    start: SystemTime,
    end: SystemTime,
) -> GetMetricStatisticsFluentBuilder {
    client
        .get_metric_statistics()
        .namespace(NAMESPACE)
        .metric_name(counter)
        .dimensions(dimension(instance_name))
        .start_time(DateTime::from(start))
        .end_time(DateTime::from(end))
        .period(PERIOD_SECONDS)
        .statistics(Statistic::Average)
}

impl StatisticsSource for AwsStatisticsSource {
    fn fetch<'a>(
        &'a self,
        instance_name: &'a str,
        counter: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Datapoint>>> {
        Box::pin(async move {
            let end = SystemTime::now();
            let start = end.checked_sub(WINDOW).unwrap_or(SystemTime::UNIX_EPOCH);

            let output = statistics_request(&self.client, instance_name, counter, start, end)
                .send()
                .await
                .with_context(|| format!("GetMetricStatistics {counter} for {instance_name}"))?;

            Ok(output
                .datapoints()
                .iter()
                .filter_map(|point| {
                    let timestamp = i64::try_from(point.timestamp()?.as_nanos()).ok()?;
                    Some(Datapoint {
                        timestamp_nanos: timestamp,
                        value: point.average()?,
                        unit: point
                            .unit()
                            .map(|u| u.as_str().to_string())
                            .unwrap_or_default(),
                    })
                })
                .collect())
        })
    }
}

pub struct CloudWatchDriver {
    source: Arc<dyn StatisticsSource>,
    directory: Arc<dyn InstanceDirectory>,
    collect_interval: Duration,
    supported: Vec<String>,
}

impl CloudWatchDriver {
    pub fn new(
        source: Arc<dyn StatisticsSource>,
        directory: Arc<dyn InstanceDirectory>,
        collect_interval: Duration,
    ) -> Self {
        Self {
            source,
            directory,
            collect_interval,
            supported: vec!["postgres".to_string(), "mysql".to_string()],
        }
    }
}

impl CollectorDriver for CloudWatchDriver {
    fn name(&self) -> &str {
        "cloudwatch"
    }

    fn supported_types(&self) -> &[String] {
        &self.supported
    }

    fn collect_interval(&self) -> Duration {
        self.collect_interval
    }

    fn new_collector<'a>(
        &'a self,
        instance: &'a InstanceInfo,
    ) -> BoxFuture<'a, Result<Box<dyn Collector>, ConnectionSetupError>> {
        Box::pin(async move {
            let instance_name = self.directory.instance_name(instance);
            debug!(guid = %instance.guid, instance_name = %instance_name, "resolved instance name");

            Ok(Box::new(CloudWatchCollector {
                source: Arc::clone(&self.source),
                guid: instance.guid.clone(),
                instance_name,
                closed: false,
            }) as Box<dyn Collector>)
        })
    }
}

pub struct CloudWatchCollector {
    source: Arc<dyn StatisticsSource>,
    guid: String,
    instance_name: String,
    closed: bool,
}

fn latest(points: Vec<Datapoint>) -> Option<Datapoint> {
    points.into_iter().max_by_key(|p| p.timestamp_nanos)
}

impl Collector for CloudWatchCollector {
    fn collect<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<Metric>, CollectError>> {
        let span = info_span!("cloudwatch.collect", guid = %self.guid, instance_name = %self.instance_name);

        Box::pin(
            async move {
                if self.closed {
                    return Err(CollectError::Closed);
                }

                let mut metrics = Vec::with_capacity(COUNTERS.len());

                for (counter, key) in COUNTERS {
                    let fetched = tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            debug!("collection cancelled, returning partial result");
                            break;
                        }
                        fetched = self.source.fetch(&self.instance_name, counter) => fetched,
                    };

                    match fetched.map(latest) {
                        Ok(Some(point)) => {
                            let tags = BTreeMap::from([(
                                "source".to_string(),
                                SOURCE_CLOUDWATCH.to_string(),
                            )]);

                            metrics.push(
                                Metric::new(*key, point.value, point.unit.to_lowercase())
                                    .with_timestamp(point.timestamp_nanos)
                                    .with_tags(tags),
                            );
                        }
                        Ok(None) => debug!(counter, "no_metrics_retrieved"),
                        Err(err) => error!(
                            guid = %self.guid,
                            counter,
                            error = %format!("{err:#}"),
                            "fetch_failed"
                        ),
                    }
                }

                Ok(metrics)
            }
            .instrument(span),
        )
    }

    fn close(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.closed = true;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{brokerinfo::FileDirectory, config::InstanceConfig};
    use anyhow::anyhow;
    use std::sync::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeSource {
        datapoints: HashMap<String, Vec<Datapoint>>,
        failing: Vec<String>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl StatisticsSource for FakeSource {
        fn fetch<'a>(
            &'a self,
            instance_name: &'a str,
            counter: &'a str,
        ) -> BoxFuture<'a, Result<Vec<Datapoint>>> {
            Box::pin(async move {
                self.calls
                    .lock()
                    .unwrap()
                    .push((instance_name.to_string(), counter.to_string()));

                if self.failing.iter().any(|c| c == counter) {
                    return Err(anyhow!("throttled"));
                }

                Ok(self.datapoints.get(counter).cloned().unwrap_or_default())
            })
        }
    }

    fn point(timestamp_nanos: i64, value: f64, unit: &str) -> Datapoint {
        Datapoint {
            timestamp_nanos,
            value,
            unit: unit.to_string(),
        }
    }

    fn directory() -> Arc<dyn InstanceDirectory> {
        Arc::new(FileDirectory::from_instances(vec![InstanceConfig {
            guid: "instance-guid".to_string(),
            kind: "postgres".to_string(),
            name: Some("rdsbroker-instance-guid".to_string()),
            address: "h".to_string(),
            port: 5432,
            dbname: "d".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
        }]))
    }

    async fn collector(source: Arc<FakeSource>) -> Box<dyn Collector> {
        CloudWatchDriver::new(source, directory(), Duration::from_secs(60))
            .new_collector(&InstanceInfo::new("instance-guid", "postgres"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_keeps_latest_datapoint() {
        let source = Arc::new(FakeSource {
            datapoints: HashMap::from([(
                "CPUUtilization".to_string(),
                vec![
                    point(1_000, 10.0, "Percent"),
                    point(3_000, 30.0, "Percent"),
                    point(2_000, 20.0, "Percent"),
                ],
            )]),
            ..FakeSource::default()
        });

        let metrics = collector(Arc::clone(&source))
            .await
            .collect(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].key, "cpu");
        assert!((metrics[0].value - 30.0).abs() < f64::EPSILON);
        assert_eq!(metrics[0].timestamp, 3_000);
        assert_eq!(metrics[0].unit, "percent");
        assert_eq!(
            metrics[0].tags.get("source").map(String::as_str),
            Some("cloudwatch")
        );
    }

    #[tokio::test]
    async fn test_queries_every_counter_with_instance_name() {
        let source = Arc::new(FakeSource::default());

        let metrics = collector(Arc::clone(&source))
            .await
            .collect(&CancellationToken::new())
            .await
            .unwrap();

        assert!(metrics.is_empty());

        let calls = source.calls.lock().unwrap();
        assert_eq!(calls.len(), COUNTERS.len());
        assert!(calls.iter().all(|(name, _)| name == "rdsbroker-instance-guid"));
    }

    #[tokio::test]
    async fn test_failed_counter_is_skipped() {
        let source = Arc::new(FakeSource {
            datapoints: HashMap::from([
                ("CPUUtilization".to_string(), vec![point(1, 1.0, "Percent")]),
                ("FreeableMemory".to_string(), vec![point(1, 2.0, "Bytes")]),
            ]),
            failing: vec!["CPUUtilization".to_string()],
            ..FakeSource::default()
        });

        let metrics = collector(source)
            .await
            .collect(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].key, "freeable_memory");
        assert_eq!(metrics[0].unit, "bytes");
    }

    #[tokio::test]
    async fn test_collect_after_close_fails() {
        let mut collector = collector(Arc::new(FakeSource::default())).await;

        collector.close().await.unwrap();

        assert!(matches!(
            collector.collect(&CancellationToken::new()).await,
            Err(CollectError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_cancelled_collect_stops_fetching() {
        let source = Arc::new(FakeSource::default());
        let mut collector = collector(Arc::clone(&source)).await;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let metrics = collector.collect(&cancel).await.unwrap();
        assert!(metrics.is_empty());
        assert!(source.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_driver_metadata() {
        let driver = CloudWatchDriver::new(
            Arc::new(FakeSource::default()),
            directory(),
            Duration::from_secs(60),
        );

        assert_eq!(driver.name(), "cloudwatch");
        assert!(driver.supports("postgres"));
        assert!(driver.supports("mysql"));
        assert!(!driver.supports("redis"));
        assert_eq!(COUNTERS.len(), 21);
    }

    #[test]
    fn test_dimension_names_the_instance() {
        let dimension = dimension("rdsbroker-guid-1");
        assert_eq!(dimension.name(), Some("DBInstanceIdentifier"));
        assert_eq!(dimension.value(), Some("rdsbroker-guid-1"));
    }

    #[tokio::test]
    async fn test_statistics_request_asks_for_the_average_over_the_window() {
        let config = aws_sdk_cloudwatch::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("eu-west-1"))
            .build();
        let client = Client::from_conf(config);

        let end = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let start = end - WINDOW;

        let request = statistics_request(&client, "rdsbroker-guid-1", "ReadIOPS", start, end);
        let input = request.as_input();

        assert_eq!(input.get_namespace().as_deref(), Some("AWS/RDS"));
        assert_eq!(input.get_metric_name().as_deref(), Some("ReadIOPS"));
        assert_eq!(input.get_period(), &Some(60));
        assert_eq!(input.get_statistics(), &Some(vec![Statistic::Average]));
        assert_eq!(
            input.get_dimensions(),
            &Some(vec![dimension("rdsbroker-guid-1")])
        );
        assert_eq!(input.get_start_time(), &Some(DateTime::from(start)));
        assert_eq!(input.get_end_time(), &Some(DateTime::from(end)));
    }
}
