//! Discovers managed database instances, runs one metric-collection worker per
//! (instance, driver) pair and routes the collected metrics to a sink.

pub mod brokerinfo;
pub mod cli;
pub mod collectors;
pub mod config;
pub mod emitter;
pub mod exporter;
pub mod metrics;
pub mod scheduler;
