//! Destinations for collected metrics.

use crate::metrics::MetricEnvelope;
use anyhow::{Result, bail};
use std::{fmt, str::FromStr};

pub mod prometheus;
pub mod stdout;

pub use self::{prometheus::PrometheusSink, stdout::StdoutSink};

/// Receives every metric produced by every worker.
///
/// Called synchronously from the worker loops, so implementations must not
/// block. There is no failure channel; a sink that cannot accept a metric
/// drops it.
pub trait MetricsSink: Send + Sync {
    fn emit(&self, envelope: MetricEnvelope);

    /// Called once a worker for `instance_guid` has stopped. Sinks that keep
    /// state per instance drop it here.
    fn forget(&self, _instance_guid: &str) {}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SinkKind {
    #[default]
    Prometheus,
    Stdout,
}

impl SinkKind {
    pub const VARIANTS: [&'static str; 2] = ["prometheus", "stdout"];
}

impl FromStr for SinkKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prometheus" => Ok(Self::Prometheus),
            "stdout" => Ok(Self::Stdout),
            other => bail!("unknown sink '{other}', expected one of {:?}", Self::VARIANTS),
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prometheus => f.write_str("prometheus"),
            Self::Stdout => f.write_str("stdout"),
        }
    }
}
