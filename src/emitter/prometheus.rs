//! Keeps the latest value of every metric in a Prometheus registry, rendered
//! on `/metrics`.
//!
//! Every metric key becomes a gauge family `rds_<key>` labelled with `guid`,
//! `unit` and the sorted tag keys. Prometheus assigns the scrape time, so
//! metric timestamps are not exported.
//!
//! Series are remembered per instance guid and removed when a worker for that
//! instance stops, so a removed instance disappears from the next scrape.

use crate::{emitter::MetricsSink, metrics::MetricEnvelope};
use anyhow::{Context, Result};
use prometheus::{GaugeVec, Opts, Registry, TextEncoder};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Mutex, PoisonError},
};
use tracing::{debug, warn};

const PREFIX: &str = "rds_";
const RESERVED_LABELS: [&str; 2] = ["guid", "unit"];

struct Family {
    labels: Vec<String>,
    gauge: GaugeVec,
}

#[derive(Default)]
struct State {
    families: HashMap<String, Family>,
    /// Family name and label values of every series, by instance guid.
    series: HashMap<String, BTreeSet<(String, Vec<String>)>>,
}

pub struct PrometheusSink {
    registry: Registry,
    state: Mutex<State>,
}

impl Default for PrometheusSink {
    fn default() -> Self {
        Self::new()
    }
}

fn sanitize(raw: &str, allow_colon: bool) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || (allow_colon && c == ':') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }

    out
}

/// Label names and values for one envelope, `guid` and `unit` first.
fn label_pairs(envelope: &MetricEnvelope) -> Vec<(String, String)> {
    let mut tags: BTreeMap<String, String> = BTreeMap::new();

    for (key, value) in &envelope.metric.tags {
        let mut name = sanitize(key, false);
        if RESERVED_LABELS.contains(&name.as_str()) || name.starts_with("__") {
            name = format!("tag_{name}");
        }
        // two raw keys may sanitize to the same name; the first one wins
        tags.entry(name).or_insert_with(|| value.clone());
    }

    let mut pairs = vec![
        ("guid".to_string(), envelope.instance_guid.clone()),
        ("unit".to_string(), envelope.metric.unit.clone()),
    ];
    pairs.extend(tags);
    pairs
}

impl PrometheusSink {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            state: Mutex::new(State::default()),
        }
    }

    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every gauge set so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be encoded
    pub fn render(&self) -> Result<String> {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .context("Failed to encode metrics")
    }

    fn set(&self, envelope: &MetricEnvelope) -> Result<()> {
        let name = format!("{PREFIX}{}", sanitize(&envelope.metric.key, true));
        let pairs = label_pairs(envelope);
        let label_names: Vec<String> = pairs.iter().map(|(k, _)| k.clone()).collect();
        let values: Vec<&str> = pairs.iter().map(|(_, v)| v.as_str()).collect();

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(family) = state.families.get(&name) {
            anyhow::ensure!(
                family.labels == label_names,
                "label set {label_names:?} does not match registered {:?}",
                family.labels
            );
            family.gauge.with_label_values(&values).set(envelope.metric.value);
        } else {
            let names: Vec<&str> = label_names.iter().map(String::as_str).collect();
            let gauge = GaugeVec::new(
                Opts::new(name.clone(), format!("{} reported by the instance", envelope.metric.key)),
                &names,
            )
            .with_context(|| format!("Failed to create gauge {name}"))?;

            self.registry
                .register(Box::new(gauge.clone()))
                .with_context(|| format!("Failed to register gauge {name}"))?;

            gauge.with_label_values(&values).set(envelope.metric.value);

            state.families.insert(
                name.clone(),
                Family {
                    labels: label_names,
                    gauge,
                },
            );
        }

        state
            .series
            .entry(envelope.instance_guid.clone())
            .or_default()
            .insert((name, values.iter().map(|v| (*v).to_string()).collect()));

        Ok(())
    }

    /// Remove every series exported for `instance_guid`.
    fn remove_instance(&self, instance_guid: &str) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(series) = state.series.remove(instance_guid) else {
            return 0;
        };

        let mut removed = 0;
        for (name, values) in &series {
            let Some(family) = state.families.get(name) else {
                continue;
            };
            let values: Vec<&str> = values.iter().map(String::as_str).collect();
            if family.gauge.remove_label_values(&values).is_ok() {
                removed += 1;
            }
        }

        removed
    }
}

impl MetricsSink for PrometheusSink {
    fn emit(&self, envelope: MetricEnvelope) {
        if let Err(err) = self.set(&envelope) {
            warn!(
                guid = %envelope.instance_guid,
                key = %envelope.metric.key,
                error = %err,
                "dropping metric"
            );
        }
    }

    fn forget(&self, instance_guid: &str) {
        let removed = self.remove_instance(instance_guid);
        if removed > 0 {
            debug!(guid = %instance_guid, series = removed, "removed series");
        }
    }
}
