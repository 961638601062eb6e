//! Lifecycle cleanup
//!
//! Deletes the workload, then the entrypoint ConfigMap, then the access
//! objects of a session. Absent objects are skipped and every deletion is
//! attempted even if an earlier one failed.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::access::AccessProvisioner;
use crate::cluster::ClusterApi;
use crate::error::{CleanupError, ClusterError, ItemErrors};

/// Names of everything a session may have created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResources {
    pub namespace: String,
    pub name: String,
    pub config_map: bool,
    pub access: bool,
}

impl SessionResources {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            config_map: false,
            access: false,
        }
    }

    pub fn with_config_map(mut self) -> Self {
        self.config_map = true;
        self
    }

    pub fn with_access(mut self) -> Self {
        self.access = true;
        self
    }
}

pub struct LifecycleCleaner {
    cluster: Arc<dyn ClusterApi>,
}

impl LifecycleCleaner {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    pub async fn clean(&self, resources: &SessionResources) -> Result<(), CleanupError> {
        let namespace = &resources.namespace;
        let name = &resources.name;
        let mut errors = ItemErrors::new();

        info!(namespace = %namespace, name = %name, "Cleaning up");

        let deleted = self.cluster.delete_daemon_set(namespace, name).await;
        record(&mut errors, format!("DaemonSet {namespace}/{name}"), deleted);

        if resources.config_map {
            let deleted = self.cluster.delete_config_map(namespace, name).await;
            record(&mut errors, format!("ConfigMap {namespace}/{name}"), deleted);
        }

        if resources.access {
            let revoked = AccessProvisioner::new(self.cluster.clone())
                .revoke(name, namespace)
                .await;
            errors.extend(revoked);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            warn!(name = %name, failures = errors.len(), "Cleanup incomplete");
            Err(CleanupError {
                session: name.clone(),
                errors,
            })
        }
    }
}

fn record(errors: &mut ItemErrors, item: String, result: Result<(), ClusterError>) {
    match result {
        Ok(()) => debug!(item = %item, "Deleted"),
        Err(e) if e.is_not_found() => debug!(item = %item, "Already absent"),
        Err(e) => errors.push(item, e.detail()),
    }
}
