//! JSON configuration file.
//!
//! Every section is optional; missing values take the defaults below and the
//! merged result is validated before use.

use anyhow::{Context, Result, bail, ensure};
use serde::Deserialize;
use std::{collections::HashSet, fmt, ops::RangeInclusive, path::Path, time::Duration};

const INTERVAL_RANGE: RangeInclusive<u64> = 1..=3600;
const DRAIN_TIMEOUT_RANGE: RangeInclusive<u64> = 1..=600;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub postgres: SqlDriverConfig,
    pub mysql: SqlDriverConfig,
    pub cloudwatch: CloudWatchConfig,
    pub instances: Vec<InstanceConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Seconds between two reconciliation ticks.
    pub instance_refresh_interval: u64,
    /// Seconds to wait for workers to close on shutdown.
    pub drain_timeout: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_refresh_interval: 120,
            drain_timeout: 30,
        }
    }
}

impl SchedulerConfig {
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.instance_refresh_interval)
    }

    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SqlDriverConfig {
    pub enabled: bool,
    pub collect_interval: u64,
    pub connect_timeout: u64,
    pub read_timeout: u64,
    /// Engine specific TLS mode; `None` picks the engine default.
    pub ssl_mode: Option<String>,
}

impl Default for SqlDriverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            collect_interval: 60,
            connect_timeout: 10,
            read_timeout: 10,
            ssl_mode: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CloudWatchConfig {
    pub enabled: bool,
    pub collect_interval: u64,
    pub region: Option<String>,
}

impl Default for CloudWatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            collect_interval: 60,
            region: None,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    pub guid: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// External name, used as the CloudWatch dimension value.
    #[serde(default)]
    pub name: Option<String>,
    pub address: String,
    pub port: u16,
    pub dbname: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for InstanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceConfig")
            .field("guid", &self.guid)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Deserialize)]
struct InstancesOnly {
    #[serde(default)]
    instances: Vec<InstanceConfig>,
}

impl Config {
    /// Read, parse and validate the config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON or
    /// fails validation
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&raw)
    }

    /// Parse and validate a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid JSON or failed validation
    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the merged configuration.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint
    pub fn validate(&self) -> Result<()> {
        check_range(
            "scheduler.instance_refresh_interval",
            self.scheduler.instance_refresh_interval,
            &INTERVAL_RANGE,
        )?;
        check_range(
            "scheduler.drain_timeout",
            self.scheduler.drain_timeout,
            &DRAIN_TIMEOUT_RANGE,
        )?;

        for (section, driver) in [("postgres", &self.postgres), ("mysql", &self.mysql)] {
            check_range(
                &format!("{section}.collect_interval"),
                driver.collect_interval,
                &INTERVAL_RANGE,
            )?;
            check_range(
                &format!("{section}.connect_timeout"),
                driver.connect_timeout,
                &INTERVAL_RANGE,
            )?;
            check_range(
                &format!("{section}.read_timeout"),
                driver.read_timeout,
                &INTERVAL_RANGE,
            )?;
        }

        if self.cloudwatch.enabled {
            check_range(
                "cloudwatch.collect_interval",
                self.cloudwatch.collect_interval,
                &INTERVAL_RANGE,
            )?;
            ensure!(
                self.cloudwatch
                    .region
                    .as_deref()
                    .is_some_and(|r| !r.trim().is_empty()),
                "cloudwatch.region is required when cloudwatch is enabled"
            );
        }

        validate_instances(&self.instances)
    }
}

fn check_range(field: &str, value: u64, range: &RangeInclusive<u64>) -> Result<()> {
    if !range.contains(&value) {
        bail!(
            "{field} must be between {} and {}, got {value}",
            range.start(),
            range.end()
        );
    }
    Ok(())
}

fn validate_instances(instances: &[InstanceConfig]) -> Result<()> {
    let mut seen = HashSet::new();

    for instance in instances {
        ensure!(
            !instance.guid.trim().is_empty(),
            "instance guid must not be empty"
        );
        ensure!(
            !instance.kind.trim().is_empty(),
            "instance {} has an empty type",
            instance.guid
        );
        ensure!(
            seen.insert(instance.guid.as_str()),
            "duplicate instance guid {}",
            instance.guid
        );
    }

    Ok(())
}

/// Re-read only the `instances` section of the config file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the instance
/// list is invalid
pub async fn load_instances(path: &Path) -> Result<Vec<InstanceConfig>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let parsed: InstancesOnly = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse instances from {}", path.display()))?;

    validate_instances(&parsed.instances)?;

    Ok(parsed.instances)
}
