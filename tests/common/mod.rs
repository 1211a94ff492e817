#![allow(dead_code)]

use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use rds_metric_collector::{
    brokerinfo::{ConnectionDetails, InstanceDirectory, InstanceInfo},
    collectors::{CollectError, Collector, CollectorDriver, ConnectionSetupError},
    emitter::MetricsSink,
    metrics::{Metric, MetricEnvelope},
};
use secrecy::SecretString;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// Directory whose listing can be swapped or made to fail between ticks.
#[derive(Default)]
pub struct FakeDirectory {
    instances: Mutex<Vec<InstanceInfo>>,
    fail: Mutex<bool>,
    pub list_calls: AtomicUsize,
}

impl FakeDirectory {
    pub fn new(instances: Vec<InstanceInfo>) -> Arc<Self> {
        Arc::new(Self {
            instances: Mutex::new(instances),
            ..Self::default()
        })
    }

    pub fn set_instances(&self, instances: Vec<InstanceInfo>) {
        *self.instances.lock().unwrap() = instances;
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

impl InstanceDirectory for FakeDirectory {
    fn list_instances(&self) -> BoxFuture<'_, Result<Vec<InstanceInfo>>> {
        Box::pin(async move {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if *self.fail.lock().unwrap() {
                return Err(anyhow!("directory unavailable"));
            }
            Ok(self.instances.lock().unwrap().clone())
        })
    }

    fn connection_details<'a>(
        &'a self,
        instance: &'a InstanceInfo,
    ) -> BoxFuture<'a, Result<ConnectionDetails>> {
        Box::pin(async move {
            Ok(ConnectionDetails {
                address: "localhost".to_string(),
                port: 5432,
                name: instance.guid.clone(),
                username: "postgres".to_string(),
                password: SecretString::from("postgres".to_string()),
            })
        })
    }

    fn instance_name(&self, instance: &InstanceInfo) -> String {
        format!("rdsbroker-{}", instance.guid)
    }
}

/// Per driver counters shared with every collector it builds.
#[derive(Default)]
pub struct Stats {
    pub starts: AtomicUsize,
    pub start_failures: AtomicUsize,
    pub collects: AtomicUsize,
    pub closes: AtomicUsize,
    /// Closes per instance guid.
    pub closed: Mutex<HashMap<String, usize>>,
    /// Set if `collect` ever ran on a closed collector.
    pub collect_after_close: Mutex<bool>,
}

impl Stats {
    pub fn closes_for(&self, guid: &str) -> usize {
        self.closed.lock().unwrap().get(guid).copied().unwrap_or(0)
    }
}

pub struct FakeDriver {
    name: String,
    types: Vec<String>,
    interval: Duration,
    /// Number of `new_collector` calls that fail before one succeeds.
    failures_left: Mutex<usize>,
    always_fail: bool,
    start_delay: Duration,
    /// Collectors ignore cancellation and never close.
    wedged: bool,
    pub stats: Arc<Stats>,
}

impl FakeDriver {
    pub fn new(name: &str, types: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            types: types.iter().map(|t| (*t).to_string()).collect(),
            interval: Duration::from_secs(10),
            failures_left: Mutex::new(0),
            always_fail: false,
            start_delay: Duration::ZERO,
            wedged: false,
            stats: Arc::new(Stats::default()),
        }
    }

    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn failing_times(self, times: usize) -> Self {
        *self.failures_left.lock().unwrap() = times;
        self
    }

    #[must_use]
    pub const fn always_failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    #[must_use]
    pub const fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    #[must_use]
    pub const fn wedged(mut self) -> Self {
        self.wedged = true;
        self
    }

    pub fn into_arc(self) -> (Arc<dyn CollectorDriver>, Arc<Stats>) {
        let stats = Arc::clone(&self.stats);
        (Arc::new(self), stats)
    }
}

impl CollectorDriver for FakeDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_types(&self) -> &[String] {
        &self.types
    }

    fn collect_interval(&self) -> Duration {
        self.interval
    }

    fn new_collector<'a>(
        &'a self,
        instance: &'a InstanceInfo,
    ) -> BoxFuture<'a, Result<Box<dyn Collector>, ConnectionSetupError>> {
        Box::pin(async move {
            if !self.start_delay.is_zero() {
                tokio::time::sleep(self.start_delay).await;
            }

            let should_fail = self.always_fail || {
                let mut left = self.failures_left.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    true
                } else {
                    false
                }
            };

            if should_fail {
                self.stats.start_failures.fetch_add(1, Ordering::SeqCst);
                return Err(ConnectionSetupError::InvalidDetails {
                    instance: instance.guid.clone(),
                    reason: "refused".to_string(),
                });
            }

            self.stats.starts.fetch_add(1, Ordering::SeqCst);

            Ok(Box::new(FakeCollector {
                driver: self.name.clone(),
                guid: instance.guid.clone(),
                wedged: self.wedged,
                closed: false,
                stats: Arc::clone(&self.stats),
            }) as Box<dyn Collector>)
        })
    }
}

pub struct FakeCollector {
    driver: String,
    guid: String,
    wedged: bool,
    closed: bool,
    stats: Arc<Stats>,
}

impl Collector for FakeCollector {
    fn collect<'a>(
        &'a mut self,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<Metric>, CollectError>> {
        Box::pin(async move {
            if self.closed {
                *self.stats.collect_after_close.lock().unwrap() = true;
                return Err(CollectError::Closed);
            }

            self.stats.collects.fetch_add(1, Ordering::SeqCst);

            if self.wedged {
                std::future::pending::<()>().await;
            }

            let tags = BTreeMap::from([("driver".to_string(), self.driver.clone())]);
            Ok(vec![Metric::new("up", 1.0, "gauge").with_tags(tags)])
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.closed = true;
            self.stats.closes.fetch_add(1, Ordering::SeqCst);
            *self
                .stats
                .closed
                .lock()
                .unwrap()
                .entry(self.guid.clone())
                .or_default() += 1;
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    envelopes: Mutex<Vec<MetricEnvelope>>,
    forgotten: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn envelopes(&self) -> Vec<MetricEnvelope> {
        self.envelopes.lock().unwrap().clone()
    }

    pub fn count_for(&self, guid: &str) -> usize {
        self.envelopes
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.instance_guid == guid)
            .count()
    }

    /// Guids passed to `forget`, in call order.
    pub fn forgotten(&self) -> Vec<String> {
        self.forgotten.lock().unwrap().clone()
    }

    pub fn count_for_driver(&self, driver: &str) -> usize {
        self.envelopes
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.metric.tags.get("driver").map(String::as_str) == Some(driver))
            .count()
    }
}

impl MetricsSink for RecordingSink {
    fn emit(&self, envelope: MetricEnvelope) {
        self.envelopes.lock().unwrap().push(envelope);
    }

    fn forget(&self, instance_guid: &str) {
        self.forgotten.lock().unwrap().push(instance_guid.to_string());
    }
}

/// Find an available port for testing (returns port > 1024)
pub fn get_available_port() -> u16 {
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to random port");
    let port = listener
        .local_addr()
        .expect("Failed to get local addr")
        .port();

    assert!(port > 1024, "Assigned port {port} should be > 1024");

    port
}

/// Wait for server to be ready on the given port
pub async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    use tokio::time::sleep;

    for _ in 1..=max_attempts {
        if tokio::net::TcpStream::connect(format!("127.0.0.1:{port}"))
            .await
            .is_ok()
        {
            return true;
        }

        sleep(Duration::from_millis(100)).await;
    }

    eprintln!("Failed to connect to server on port {port} after {max_attempts} attempts");
    false
}

pub fn get_test_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}")
}

/// Config file with no instances and the SQL drivers enabled.
pub fn write_config(extra: &str) -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().expect("Failed to create temp config");
    let body = if extra.is_empty() {
        r#"{"scheduler": {"instance_refresh_interval": 1, "drain_timeout": 1}}"#.to_string()
    } else {
        format!(
            r#"{{"scheduler": {{"instance_refresh_interval": 1, "drain_timeout": 1}}, {extra}}}"#
        )
    };
    std::fs::write(file.path(), body).expect("Failed to write temp config");
    file
}
