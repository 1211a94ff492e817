//! `MySQL` query catalogue.

use crate::{
    brokerinfo::InstanceDirectory,
    collectors::{
        query::{MetricQuery, MetricQueryMeta},
        sql::{Engine, SqlDriver},
    },
    config::SqlDriverConfig,
};
use std::sync::Arc;

// Both columns are VARCHAR, the engine parses the value.
const GLOBAL_STATUS: &str = r"
    SELECT LOWER(variable_name) AS name, variable_value AS value
    FROM performance_schema.global_status
";

const MAX_CONNECTIONS: &str = r"
    SELECT variable_value AS max_connections
    FROM performance_schema.global_variables
    WHERE variable_name = 'max_connections'
";

// SUM yields DECIMAL, which the generic driver cannot decode.
const CONNECTION_ERRORS: &str = r"
    SELECT CAST(COALESCE(SUM(variable_value), 0) AS CHAR) AS connection_errors
    FROM performance_schema.global_status
    WHERE variable_name LIKE 'Connection\_errors\_%'
";

const CONNECTION_STATUS: &[&str] = &[
    "threads_running",
    "threads_connected",
    "threads_created",
    "queries",
    "questions",
    "aborted_connects",
    "aborted_clients",
];

const INNODB_STATUS: &[(&str, &str)] = &[
    ("innodb_row_lock_time", "ms"),
    ("innodb_row_lock_waits", "lock"),
    ("innodb_num_open_files", "file"),
    ("innodb_log_waits", "wait"),
    ("innodb_buffer_pool_bytes_data", "byte"),
    ("innodb_buffer_pool_bytes_dirty", "byte"),
    ("innodb_buffer_pool_pages_data", "page"),
    ("innodb_buffer_pool_pages_dirty", "page"),
    ("innodb_buffer_pool_pages_flushed", "page"),
    ("innodb_buffer_pool_pages_free", "page"),
    ("innodb_buffer_pool_pages_misc", "page"),
    ("innodb_buffer_pool_pages_total", "page"),
    ("innodb_buffer_pool_read_ahead", "page"),
    ("innodb_buffer_pool_read_ahead_evicted", "page"),
    ("innodb_buffer_pool_read_ahead_rnd", "page"),
    ("innodb_buffer_pool_read_requests", "req"),
    ("innodb_buffer_pool_reads", "req"),
    ("innodb_buffer_pool_wait_free", "wait"),
    ("innodb_buffer_pool_write_requests", "req"),
];

/// Every query run by the `MySQL` driver, in execution order.
pub fn queries() -> Vec<MetricQuery> {
    let status = CONNECTION_STATUS
        .iter()
        .map(|key| MetricQueryMeta::new(*key, "conn"))
        .chain(
            INNODB_STATUS
                .iter()
                .map(|(key, unit)| MetricQueryMeta::new(*key, *unit)),
        )
        .collect();

    vec![
        MetricQuery::row(GLOBAL_STATUS, status),
        MetricQuery::column(
            MAX_CONNECTIONS,
            vec![MetricQueryMeta::new("max_connections", "conn")],
        ),
        MetricQuery::column(
            CONNECTION_ERRORS,
            vec![MetricQueryMeta::new("connection_errors", "err")],
        ),
    ]
}

pub fn driver(directory: Arc<dyn InstanceDirectory>, config: &SqlDriverConfig) -> SqlDriver {
    SqlDriver::from_config(Engine::Mysql, directory, queries(), config)
}
