use crate::{
    brokerinfo::{ConnectionDetails, InstanceDirectory, InstanceInfo},
    collectors::{
        Collector, CollectorDriver,
        error::{CollectError, ConnectionSetupError, QueryError, compact_sql},
        query::MetricQuery,
    },
    config::SqlDriverConfig,
    metrics::Metric,
};
use futures::future::BoxFuture;
use secrecy::ExposeSecret;
use sqlx::{AnyPool, Connection, any::AnyPoolOptions};
use std::{fmt, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span};
use tracing_futures::Instrument as _;
use url::Url;

/// Database engine family served by a [`SqlDriver`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Engine {
    Postgres,
    Mysql,
}

impl Engine {
    /// Instance type and driver name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
        }
    }

    pub const fn default_ssl_mode(self) -> &'static str {
        match self {
            Self::Postgres => "require",
            Self::Mysql => "required",
        }
    }

    const fn ssl_param(self) -> &'static str {
        match self {
            Self::Postgres => "sslmode",
            Self::Mysql => "ssl-mode",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub ssl_mode: Option<String>,
}

impl From<&SqlDriverConfig> for ConnectionSettings {
    fn from(config: &SqlDriverConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout),
            read_timeout: Duration::from_secs(config.read_timeout),
            ssl_mode: config.ssl_mode.clone(),
        }
    }
}

/// Build the connection URL for `details`. Credentials are percent-encoded.
///
/// # Errors
///
/// Returns a description of the first field the URL cannot hold
pub fn connection_string(
    engine: Engine,
    details: &ConnectionDetails,
    ssl_mode: &str,
) -> Result<String, String> {
    if details.address.trim().is_empty() {
        return Err("empty address".to_string());
    }

    let mut url = Url::parse(&format!("{}://localhost", engine.name()))
        .map_err(|e| format!("invalid scheme: {e}"))?;

    url.set_host(Some(&details.address))
        .map_err(|e| format!("invalid address '{}': {e}", details.address))?;
    url.set_port(Some(details.port))
        .map_err(|()| format!("invalid port {}", details.port))?;
    url.set_username(&details.username)
        .map_err(|()| "invalid username".to_string())?;
    url.set_password(Some(details.password.expose_secret()))
        .map_err(|()| "invalid password".to_string())?;
    url.set_path(&format!("/{}", details.name));
    url.query_pairs_mut()
        .append_pair(engine.ssl_param(), ssl_mode);

    Ok(url.into())
}

/// Driver running a fixed query catalogue against every instance of one engine.
pub struct SqlDriver {
    engine: Engine,
    supported: Vec<String>,
    directory: Arc<dyn InstanceDirectory>,
    queries: Arc<[MetricQuery]>,
    collect_interval: Duration,
    settings: ConnectionSettings,
}

impl SqlDriver {
    pub fn new(
        engine: Engine,
        directory: Arc<dyn InstanceDirectory>,
        queries: Vec<MetricQuery>,
        collect_interval: Duration,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            engine,
            supported: vec![engine.name().to_string()],
            directory,
            queries: queries.into(),
            collect_interval,
            settings,
        }
    }

    pub fn from_config(
        engine: Engine,
        directory: Arc<dyn InstanceDirectory>,
        queries: Vec<MetricQuery>,
        config: &SqlDriverConfig,
    ) -> Self {
        Self::new(
            engine,
            directory,
            queries,
            Duration::from_secs(config.collect_interval),
            ConnectionSettings::from(config),
        )
    }

    pub const fn engine(&self) -> Engine {
        self.engine
    }

    pub fn queries(&self) -> &[MetricQuery] {
        &self.queries
    }

    fn ssl_mode(&self) -> &str {
        self.settings
            .ssl_mode
            .as_deref()
            .unwrap_or(self.engine.default_ssl_mode())
    }
}

impl CollectorDriver for SqlDriver {
    fn name(&self) -> &str {
        self.engine.name()
    }

    fn supported_types(&self) -> &[String] {
        &self.supported
    }

    fn collect_interval(&self) -> Duration {
        self.collect_interval
    }

    fn new_collector<'a>(
        &'a self,
        instance: &'a InstanceInfo,
    ) -> BoxFuture<'a, Result<Box<dyn Collector>, ConnectionSetupError>> {
        let span = info_span!("sql.new_collector", driver = %self.engine, guid = %instance.guid);

        Box::pin(async move {
            let details = self
                .directory
                .connection_details(instance)
                .await
                .map_err(|source| ConnectionSetupError::Directory {
                    instance: instance.guid.clone(),
                    source,
                })?;

            let dsn = connection_string(self.engine, &details, self.ssl_mode()).map_err(
                |reason| ConnectionSetupError::InvalidDetails {
                    instance: instance.guid.clone(),
                    reason,
                },
            )?;

            sqlx::any::install_default_drivers();

            // The pool connects on first use; an unreachable database shows up
            // as a failed ping on collect.
            let pool = AnyPoolOptions::new()
                .max_connections(1)
                .min_connections(0)
                .acquire_timeout(self.settings.connect_timeout)
                .connect_lazy(&dsn)
                .map_err(|source| ConnectionSetupError::Connect {
                    instance: instance.guid.clone(),
                    source,
                })?;

            debug!(address = %details.address, port = details.port, "created connection pool");

            Ok(Box::new(SqlCollector {
                guid: instance.guid.clone(),
                engine: self.engine,
                pool,
                queries: Arc::clone(&self.queries),
                read_timeout: self.settings.read_timeout,
            }) as Box<dyn Collector>)
        }
        .instrument(span))
    }
}

pub struct SqlCollector {
    guid: String,
    engine: Engine,
    pool: AnyPool,
    queries: Arc<[MetricQuery]>,
    read_timeout: Duration,
}

impl SqlCollector {
    async fn ping(&self, cancel: &CancellationToken) -> Result<(), CollectError> {
        let check = async {
            let mut conn = self.pool.acquire().await?;
            conn.ping().await
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(CollectError::Cancelled),
            result = tokio::time::timeout(self.read_timeout, check) => match result {
                Err(_) => Err(CollectError::PingTimeout(self.read_timeout)),
                Ok(Err(err)) => Err(CollectError::Ping(err)),
                Ok(Ok(())) => Ok(()),
            },
        }
    }
}

impl Collector for SqlCollector {
    fn collect<'a>(
        &'a mut self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<Metric>, CollectError>> {
        let span = info_span!("sql.collect", driver = %self.engine, guid = %self.guid);

        Box::pin(
            async move {
                if self.pool.is_closed() {
                    return Err(CollectError::Closed);
                }

                self.ping(cancel).await?;

                let mut metrics = Vec::new();

                for query in self.queries.iter() {
                    match query.fetch(&self.pool, self.read_timeout, cancel).await {
                        Ok(found) => metrics.extend(found),
                        Err(QueryError::Cancelled { .. }) => {
                            debug!("collection cancelled, returning partial result");
                            break;
                        }
                        Err(err) => {
                            error!(
                                guid = %self.guid,
                                query = %compact_sql(query.sql()),
                                error = %err,
                                "query_failed"
                            );
                        }
                    }
                }

                Ok(metrics)
            }
            .instrument(span),
        )
    }

    fn close(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.pool.close().await;
            Ok(())
        })
    }
}
