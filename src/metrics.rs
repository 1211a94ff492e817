use serde::Serialize;
use std::collections::BTreeMap;

/// Tag added to every metric produced by a SQL query.
pub const SOURCE_SQL: &str = "sql";

/// Tag added to every metric fetched from CloudWatch.
pub const SOURCE_CLOUDWATCH: &str = "cloudwatch";

/// A single observation.
///
/// `timestamp` is in nanoseconds since the Unix epoch; zero means "now".
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Metric {
    pub key: String,
    pub timestamp: i64,
    pub value: f64,
    pub unit: String,
    pub tags: BTreeMap<String, String>,
}

impl Metric {
    pub fn new(key: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value,
            unit: unit.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A metric tagged with the instance it came from, ready for the sink.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricEnvelope {
    pub instance_guid: String,
    pub metric: Metric,
}

impl MetricEnvelope {
    pub fn new(instance_guid: impl Into<String>, metric: Metric) -> Self {
        Self {
            instance_guid: instance_guid.into(),
            metric,
        }
    }
}
