use crate::{emitter::MetricsSink, metrics::MetricEnvelope};
use std::io::Write;
use tracing::warn;

/// Prints one JSON document per metric on stdout.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdoutSink;

impl StdoutSink {
    pub const fn new() -> Self {
        Self
    }
}

pub(crate) fn render(envelope: &MetricEnvelope) -> serde_json::Result<String> {
    serde_json::to_string(envelope)
}

impl MetricsSink for StdoutSink {
    fn emit(&self, envelope: MetricEnvelope) {
        match render(&envelope) {
            Ok(line) => {
                let mut out = std::io::stdout().lock();
                if let Err(err) = writeln!(out, "{line}") {
                    warn!(error = %err, "failed to write metric to stdout");
                }
            }
            Err(err) => warn!(guid = %envelope.instance_guid, key = %envelope.metric.key, error = %err, "failed to serialize metric"),
        }
    }
}
