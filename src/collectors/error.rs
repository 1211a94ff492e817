use std::time::Duration;
use thiserror::Error;

/// Failure of a single metric query. The owning collector logs it and keeps
/// going with the next query.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("unable to execute query '{query}': {source}")]
    Execution {
        query: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("column '{column}' of query '{query}' is not numeric: {reason}")]
    TypeCoercion {
        query: String,
        column: String,
        reason: String,
    },

    #[error("unable to find key '{key}' in the query '{query}'")]
    MissingMetricKey { key: String, query: String },

    #[error("query '{query}' {reason}")]
    MalformedResult { query: String, reason: String },

    #[error("query '{query}' timed out after {timeout:?}")]
    Timeout { query: String, timeout: Duration },

    #[error("query '{query}' was cancelled")]
    Cancelled { query: String },
}

/// Failure of a whole `collect` call.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("database is unreachable: {0}")]
    Ping(#[source] sqlx::Error),

    #[error("database ping timed out after {0:?}")]
    PingTimeout(Duration),

    #[error("collector is closed")]
    Closed,

    #[error("collection cancelled")]
    Cancelled,
}

/// A driver could not bind itself to an instance.
#[derive(Debug, Error)]
pub enum ConnectionSetupError {
    #[error("cannot resolve connection details for {instance}: {source}")]
    Directory {
        instance: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid connection details for {instance}: {reason}")]
    InvalidDetails { instance: String, reason: String },

    #[error("cannot open a connection to {instance}: {source}")]
    Connect {
        instance: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Collapse whitespace so multi-line SQL reads well in a single log line.
pub(crate) fn compact_sql(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}
