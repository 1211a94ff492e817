//! Turns the tabular result of a SQL statement into metrics.
//!
//! Two layouts are supported:
//!
//! - **column** queries: the first N columns are the values of the N declared
//!   metrics, any remaining columns are tags shared by the metrics of that row.
//!   Every returned row yields its own set of N metrics.
//!
//! ```text
//!  connections | dbname
//! -------------+--------
//!            3 | app
//! ```
//!
//! - **row** queries: every row is `(key, value, tag_1, tag_2, ...)`. Rows are
//!   folded by lower-cased key and the declared metrics are then looked up in
//!   that fold; keys nobody asked for are ignored.
//!
//! ```text
//!  name              | value
//! -------------------+-------
//!  threads_connected | 1
//! ```
//!
//! Every value is read as `f64`, so very large integers lose precision.

use crate::{
    collectors::error::{QueryError, compact_sql},
    metrics::{Metric, SOURCE_SQL},
};
use sqlx::{AnyPool, Column, Row, TypeInfo, any::AnyRow};
use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span};
use tracing_futures::Instrument as _;

/// Maps one name produced by a query to the key and unit of the final metric.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricQueryMeta {
    pub key: String,
    pub unit: String,
}

impl MetricQueryMeta {
    pub fn new(key: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            unit: unit.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum MetricQuery {
    Column {
        sql: String,
        metrics: Vec<MetricQueryMeta>,
    },
    Row {
        sql: String,
        metrics: Vec<MetricQueryMeta>,
    },
}

/// One decoded database value.
#[derive(Clone, Debug, PartialEq)]
pub enum Cell {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Unsupported(String),
}

impl Cell {
    fn as_f64(&self) -> Result<f64, String> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Int(v) => Ok(*v as f64),
            Self::Float(v) => Ok(*v),
            Self::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            Self::Text(v) => v
                .trim()
                .parse::<f64>()
                .map_err(|e| format!("cannot parse '{v}': {e}")),
            Self::Null => Err("value is NULL".to_string()),
            Self::Unsupported(ty) => Err(format!("unsupported column type {ty}")),
        }
    }

    fn as_tag(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Text(v) => v.clone(),
            Self::Bool(v) => v.to_string(),
            Self::Unsupported(ty) => format!("<{ty}>"),
        }
    }
}

/// Column names plus decoded rows of one statement.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl ResultSet {
    fn from_rows(rows: &[AnyRow]) -> Self {
        let columns = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let rows = rows
            .iter()
            .map(|row| (0..row.len()).map(|i| decode_cell(row, i)).collect())
            .collect();

        Self { columns, rows }
    }
}

// The Any driver only decodes a value into a type it considers compatible, so
// try the supported Rust types in turn.
fn decode_cell(row: &AnyRow, index: usize) -> Cell {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map_or(Cell::Null, Cell::Int);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(index) {
        return v.map_or(Cell::Null, |v| Cell::Int(i64::from(v)));
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(index) {
        return v.map_or(Cell::Null, |v| Cell::Int(i64::from(v)));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v.map_or(Cell::Null, Cell::Float);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(index) {
        return v.map_or(Cell::Null, |v| Cell::Float(f64::from(v)));
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map_or(Cell::Null, Cell::Text);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return v.map_or(Cell::Null, Cell::Bool);
    }

    let ty = row
        .try_column(index)
        .map(|c| c.type_info().name().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    Cell::Unsupported(ty)
}

impl MetricQuery {
    pub fn column(sql: impl Into<String>, metrics: Vec<MetricQueryMeta>) -> Self {
        Self::Column {
            sql: sql.into(),
            metrics,
        }
    }

    pub fn row(sql: impl Into<String>, metrics: Vec<MetricQueryMeta>) -> Self {
        Self::Row {
            sql: sql.into(),
            metrics,
        }
    }

    pub fn sql(&self) -> &str {
        match self {
            Self::Column { sql, .. } | Self::Row { sql, .. } => sql,
        }
    }

    pub fn metrics(&self) -> &[MetricQueryMeta] {
        match self {
            Self::Column { metrics, .. } | Self::Row { metrics, .. } => metrics,
        }
    }

    /// Execute the statement and convert its result.
    ///
    /// # Errors
    ///
    /// Returns a [`QueryError`] if the statement fails, times out, is
    /// cancelled or its result cannot be turned into the declared metrics
    pub async fn fetch(
        &self,
        pool: &AnyPool,
        read_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Metric>, QueryError> {
        let span = info_span!(
            "db.query",
            otel.kind = "client",
            db.statement = %compact_sql(self.sql()),
        );

        let execution = tokio::time::timeout(read_timeout, sqlx::query(self.sql()).fetch_all(pool));

        let rows = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(QueryError::Cancelled { query: compact_sql(self.sql()) });
            }
            fetched = execution.instrument(span) => match fetched {
                Err(_) => {
                    return Err(QueryError::Timeout {
                        query: compact_sql(self.sql()),
                        timeout: read_timeout,
                    });
                }
                Ok(Err(source)) => {
                    return Err(QueryError::Execution {
                        query: compact_sql(self.sql()),
                        source,
                    });
                }
                Ok(Ok(rows)) => rows,
            },
        };

        debug!(rows = rows.len(), "query returned");

        self.to_metrics(&ResultSet::from_rows(&rows))
    }

    /// Convert an already fetched result.
    ///
    /// # Errors
    ///
    /// Returns a [`QueryError`] if a value is not numeric, a declared key is
    /// missing or the result does not have the expected layout
    pub fn to_metrics(&self, result: &ResultSet) -> Result<Vec<Metric>, QueryError> {
        match self {
            Self::Column { sql, metrics } => column_metrics(sql, metrics, result),
            Self::Row { sql, metrics } => row_metrics(sql, metrics, result),
        }
    }
}

fn tags_from<'a>(
    names: impl Iterator<Item = &'a String>,
    cells: impl Iterator<Item = &'a Cell>,
) -> BTreeMap<String, String> {
    let mut tags: BTreeMap<String, String> = names
        .zip(cells)
        .map(|(name, cell)| (name.clone(), cell.as_tag()))
        .collect();
    tags.insert("source".to_string(), SOURCE_SQL.to_string());
    tags
}

fn column_metrics(
    sql: &str,
    declared: &[MetricQueryMeta],
    result: &ResultSet,
) -> Result<Vec<Metric>, QueryError> {
    let values_len = declared.len();
    let mut metrics = Vec::with_capacity(result.rows.len() * values_len);

    for row in &result.rows {
        if row.len() < values_len {
            return Err(QueryError::MalformedResult {
                query: compact_sql(sql),
                reason: format!(
                    "expected {values_len} values but the row only has {} columns",
                    row.len()
                ),
            });
        }

        let tags = tags_from(
            result.columns.iter().skip(values_len),
            row.iter().skip(values_len),
        );

        for meta in declared {
            let position = result
                .columns
                .iter()
                .take(values_len)
                .position(|c| c.eq_ignore_ascii_case(&meta.key))
                .ok_or_else(|| QueryError::MissingMetricKey {
                    key: meta.key.clone(),
                    query: compact_sql(sql),
                })?;

            let value = row
                .get(position)
                .ok_or_else(|| QueryError::MissingMetricKey {
                    key: meta.key.clone(),
                    query: compact_sql(sql),
                })?
                .as_f64()
                .map_err(|reason| QueryError::TypeCoercion {
                    query: compact_sql(sql),
                    column: meta.key.clone(),
                    reason,
                })?;

            metrics.push(Metric::new(&meta.key, value, &meta.unit).with_tags(tags.clone()));
        }
    }

    Ok(metrics)
}

fn row_metrics(
    sql: &str,
    declared: &[MetricQueryMeta],
    result: &ResultSet,
) -> Result<Vec<Metric>, QueryError> {
    if !result.rows.is_empty() && result.columns.len() < 2 {
        return Err(QueryError::MalformedResult {
            query: compact_sql(sql),
            reason: "must return at least 2 columns".to_string(),
        });
    }

    // Duplicate keys: the last row wins. Values are only coerced when a
    // declared metric asks for them.
    let mut folded: HashMap<String, (&Cell, BTreeMap<String, String>)> = HashMap::new();

    for row in &result.rows {
        let (Some(key), Some(value)) = (row.first(), row.get(1)) else {
            return Err(QueryError::MalformedResult {
                query: compact_sql(sql),
                reason: "must return at least 2 columns".to_string(),
            });
        };

        let tags = tags_from(result.columns.iter().skip(2), row.iter().skip(2));
        folded.insert(key.as_tag().to_lowercase(), (value, tags));
    }

    let value_column = result.columns.get(1).map_or("value", String::as_str);

    declared
        .iter()
        .map(|meta| {
            let (cell, tags) =
                folded
                    .get(&meta.key.to_lowercase())
                    .ok_or_else(|| QueryError::MissingMetricKey {
                        key: meta.key.clone(),
                        query: compact_sql(sql),
                    })?;

            let value = cell.as_f64().map_err(|reason| QueryError::TypeCoercion {
                query: compact_sql(sql),
                column: format!("{value_column} ({})", meta.key),
                reason,
            })?;

            Ok(Metric::new(&meta.key, value, &meta.unit).with_tags(tags.clone()))
        })
        .collect()
}
