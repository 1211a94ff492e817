//! Instance directory: which database instances exist and how to reach them.

use crate::config::{InstanceConfig, load_instances};
use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};
use tracing::{debug, debug_span};
use tracing_futures::Instrument as _;

/// One managed database instance and its engine family.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub guid: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl InstanceInfo {
    pub fn new(guid: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for InstanceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.guid, self.kind)
    }
}

/// Credentials and endpoint used to open a connection to an instance.
#[derive(Clone, Debug)]
pub struct ConnectionDetails {
    pub address: String,
    pub port: u16,
    pub name: String,
    pub username: String,
    pub password: SecretString,
}

pub trait InstanceDirectory: Send + Sync {
    /// Current list of managed instances.
    fn list_instances(&self) -> BoxFuture<'_, Result<Vec<InstanceInfo>>>;

    fn connection_details<'a>(
        &'a self,
        instance: &'a InstanceInfo,
    ) -> BoxFuture<'a, Result<ConnectionDetails>>;

    /// External name of the instance, e.g. the RDS instance identifier.
    fn instance_name(&self, instance: &InstanceInfo) -> String;
}

/// Directory backed by the `instances` section of the config file.
///
/// When built with a path the file is re-read on every listing, so instances
/// can be added or removed without restarting the process. A file that fails
/// to parse leaves the previous listing in place and reports the error.
pub struct FileDirectory {
    path: Option<PathBuf>,
    instances: RwLock<Vec<InstanceConfig>>,
}

impl FileDirectory {
    pub fn new(path: impl AsRef<Path>, instances: Vec<InstanceConfig>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            instances: RwLock::new(instances),
        }
    }

    /// A directory whose listing never changes.
    pub fn from_instances(instances: Vec<InstanceConfig>) -> Self {
        Self {
            path: None,
            instances: RwLock::new(instances),
        }
    }

    fn lookup(&self, guid: &str) -> Option<InstanceConfig> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|i| i.guid == guid)
            .cloned()
    }
}

impl InstanceDirectory for FileDirectory {
    fn list_instances(&self) -> BoxFuture<'_, Result<Vec<InstanceInfo>>> {
        let span = debug_span!("list_instances");
        Box::pin(
            async move {
                if let Some(path) = &self.path {
                    let fresh = load_instances(path).await?;
                    debug!(instances = fresh.len(), "reloaded instance list");
                    *self
                        .instances
                        .write()
                        .unwrap_or_else(PoisonError::into_inner) = fresh;
                }

                Ok(self
                    .instances
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .map(|i| InstanceInfo::new(&i.guid, &i.kind))
                    .collect())
            }
            .instrument(span),
        )
    }

    fn connection_details<'a>(
        &'a self,
        instance: &'a InstanceInfo,
    ) -> BoxFuture<'a, Result<ConnectionDetails>> {
        Box::pin(async move {
            let found = self
                .lookup(&instance.guid)
                .ok_or_else(|| anyhow!("unknown instance {}", instance.guid))?;

            Ok(ConnectionDetails {
                address: found.address,
                port: found.port,
                name: found.dbname,
                username: found.username,
                password: SecretString::from(found.password),
            })
        })
    }

    fn instance_name(&self, instance: &InstanceInfo) -> String {
        self.lookup(&instance.guid)
            .and_then(|i| i.name)
            .unwrap_or_else(|| instance.guid.clone())
    }
}
