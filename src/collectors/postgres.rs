//! `PostgreSQL` query catalogue.
//!
//! Values are cast to `DOUBLE PRECISION` and tags to `text` so every column
//! decodes through the generic driver.

use crate::{
    brokerinfo::InstanceDirectory,
    collectors::{
        query::{MetricQuery, MetricQueryMeta},
        sql::{Engine, SqlDriver},
    },
    config::SqlDriverConfig,
};
use std::sync::Arc;

const CONNECTIONS: &str = r"
    SELECT CAST(SUM(numbackends) AS DOUBLE PRECISION) AS connections
    FROM pg_stat_database
";

const MAX_CONNECTIONS: &str = r"
    SELECT CAST(setting AS DOUBLE PRECISION) AS max_connections
    FROM pg_settings
    WHERE name = 'max_connections'
";

const DATABASE_STATS: &str = r"
    SELECT
        CAST(pg_database_size(datname) AS DOUBLE PRECISION) AS dbsize,
        CAST(deadlocks AS DOUBLE PRECISION) AS deadlocks,
        CAST(xact_commit AS DOUBLE PRECISION) AS commits,
        CAST(xact_rollback AS DOUBLE PRECISION) AS rollbacks,
        CAST(blks_read AS DOUBLE PRECISION) AS blocks_read,
        CAST(blks_hit AS DOUBLE PRECISION) AS blocks_hit,
        CAST(blk_read_time AS DOUBLE PRECISION) AS read_time,
        CAST(blk_write_time AS DOUBLE PRECISION) AS write_time,
        CAST(temp_bytes AS DOUBLE PRECISION) AS temp_bytes,
        datname::text AS dbname
    FROM pg_stat_database
    WHERE datname IS NOT NULL
      AND datname <> 'rdsadmin'
      AND datname NOT LIKE 'template%'
";

const BLOCKED_CONNECTIONS: &str = r"
    SELECT CAST(COUNT(DISTINCT pid) AS DOUBLE PRECISION) AS blocked_connections
    FROM pg_locks
    WHERE NOT granted
";

const TABLE_SCANS: &str = r"
    SELECT
        CAST(COALESCE(SUM(seq_scan), 0) AS DOUBLE PRECISION) AS seq_scan,
        CAST(COALESCE(SUM(idx_scan), 0) AS DOUBLE PRECISION) AS idx_scan,
        current_database()::text AS dbname
    FROM pg_stat_user_tables
";

const MAX_TX_AGE: &str = r"
    SELECT CAST(COALESCE(MAX(EXTRACT(EPOCH FROM now() - xact_start)), 0) AS DOUBLE PRECISION) AS max_tx_age
    FROM pg_stat_activity
    WHERE xact_start IS NOT NULL
      AND state <> 'idle'
";

/// Every query run by the `PostgreSQL` driver, in execution order.
pub fn queries() -> Vec<MetricQuery> {
    vec![
        MetricQuery::column(CONNECTIONS, vec![MetricQueryMeta::new("connections", "conn")]),
        MetricQuery::column(
            MAX_CONNECTIONS,
            vec![MetricQueryMeta::new("max_connections", "conn")],
        ),
        MetricQuery::column(
            DATABASE_STATS,
            vec![
                MetricQueryMeta::new("dbsize", "byte"),
                MetricQueryMeta::new("deadlocks", "lock"),
                MetricQueryMeta::new("commits", "tx"),
                MetricQueryMeta::new("rollbacks", "tx"),
                MetricQueryMeta::new("blocks_read", "block"),
                MetricQueryMeta::new("blocks_hit", "block"),
                MetricQueryMeta::new("read_time", "ms"),
                MetricQueryMeta::new("write_time", "ms"),
                MetricQueryMeta::new("temp_bytes", "byte"),
            ],
        ),
        MetricQuery::column(
            BLOCKED_CONNECTIONS,
            vec![MetricQueryMeta::new("blocked_connections", "conn")],
        ),
        MetricQuery::column(
            TABLE_SCANS,
            vec![
                MetricQueryMeta::new("seq_scan", "scan"),
                MetricQueryMeta::new("idx_scan", "scan"),
            ],
        ),
        MetricQuery::column(MAX_TX_AGE, vec![MetricQueryMeta::new("max_tx_age", "s")]),
    ]
}

pub fn driver(directory: Arc<dyn InstanceDirectory>, config: &SqlDriverConfig) -> SqlDriver {
    SqlDriver::from_config(Engine::Postgres, directory, queries(), config)
}
