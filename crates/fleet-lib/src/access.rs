//! Temporary cluster access for agents that read cluster metadata
//!
//! A session's identity, role and binding all carry the session name, so
//! a collision with a leftover session fails loudly on create and cleanup
//! can find every object by name alone.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::error::{ClusterError, ItemErrors};

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// A read permission granted to the agent identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRule {
    pub api_groups: Vec<String>,
    pub resources: Vec<String>,
    pub verbs: Vec<String>,
}

impl AccessRule {
    pub fn new(api_group: &str, resources: &[&str], verbs: &[&str]) -> Self {
        Self {
            api_groups: vec![api_group.to_string()],
            resources: resources.iter().map(|r| r.to_string()).collect(),
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
        }
    }

    fn to_policy_rule(&self) -> PolicyRule {
        PolicyRule {
            api_groups: Some(self.api_groups.clone()),
            resources: Some(self.resources.clone()),
            verbs: self.verbs.clone(),
            ..Default::default()
        }
    }
}

/// Creates and removes the identity, role and binding of a session
pub struct AccessProvisioner {
    cluster: Arc<dyn ClusterApi>,
}

impl AccessProvisioner {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Create the three access objects named after the session
    ///
    /// Objects created before a failing step are removed again so a failed
    /// provision leaves nothing behind.
    pub async fn provision(
        &self,
        session: &str,
        namespace: &str,
        rules: &[AccessRule],
    ) -> Result<(), ClusterError> {
        info!(session, namespace, rules = rules.len(), "Provisioning agent access");

        self.cluster
            .create_service_account(&service_account(session, namespace))
            .await?;

        if let Err(e) = self.cluster.create_cluster_role(&cluster_role(session, rules)).await {
            self.rollback(session, namespace, false).await;
            return Err(e);
        }

        if let Err(e) = self
            .cluster
            .create_cluster_role_binding(&cluster_role_binding(session, namespace))
            .await
        {
            self.rollback(session, namespace, true).await;
            return Err(e);
        }

        debug!(session, "Agent access provisioned");
        Ok(())
    }

    async fn rollback(&self, session: &str, namespace: &str, role_created: bool) {
        if role_created {
            if let Err(e) = self.cluster.delete_cluster_role(session).await {
                warn!(session, error = %e.detail(), "Failed to roll back ClusterRole");
            }
        }
        if let Err(e) = self.cluster.delete_service_account(namespace, session).await {
            warn!(session, error = %e.detail(), "Failed to roll back ServiceAccount");
        }
    }

    /// Delete binding, role and identity in that order
    ///
    /// Objects that are already gone are skipped. Every deletion is
    /// attempted even when an earlier one fails.
    pub async fn revoke(&self, session: &str, namespace: &str) -> ItemErrors {
        let mut errors = ItemErrors::new();

        let results = [
            (
                format!("ClusterRoleBinding {session}"),
                self.cluster.delete_cluster_role_binding(session).await,
            ),
            (
                format!("ClusterRole {session}"),
                self.cluster.delete_cluster_role(session).await,
            ),
            (
                format!("ServiceAccount {namespace}/{session}"),
                self.cluster.delete_service_account(namespace, session).await,
            ),
        ];

        for (item, result) in results {
            match result {
                Ok(()) => debug!(item = %item, "Deleted"),
                Err(e) if e.is_not_found() => debug!(item = %item, "Already absent"),
                Err(e) => errors.push(item, e.detail()),
            }
        }

        errors
    }
}

fn service_account(name: &str, namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn cluster_role(name: &str, rules: &[AccessRule]) -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        rules: Some(rules.iter().map(AccessRule::to_policy_rule).collect()),
        ..Default::default()
    }
}

fn cluster_role_binding(name: &str, namespace: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: name.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
            api_group: None,
        }]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCluster, Failure};

    fn rules() -> Vec<AccessRule> {
        vec![
            AccessRule::new("apps", &["daemonsets", "deployments"], &["get", "list"]),
            AccessRule::new("", &["nodes", "nodes/status"], &["get"]),
        ]
    }

    #[test]
    fn test_cluster_role_carries_exact_rules() {
        let role = cluster_role("checker", &rules());
        let policy = role.rules.unwrap();
        assert_eq!(policy.len(), 2);
        assert_eq!(policy[0].api_groups, Some(vec!["apps".to_string()]));
        assert_eq!(policy[1].verbs, vec!["get".to_string()]);
    }

    #[test]
    fn test_binding_targets_session_identity() {
        let binding = cluster_role_binding("checker", "default");
        assert_eq!(binding.role_ref.name, "checker");
        let subject = &binding.subjects.unwrap()[0];
        assert_eq!(subject.kind, "ServiceAccount");
        assert_eq!(subject.namespace.as_deref(), Some("default"));
    }

    #[tokio::test]
    async fn test_provision_creates_three_objects() {
        let cluster = Arc::new(FakeCluster::new());
        let provisioner = AccessProvisioner::new(cluster.clone());

        provisioner.provision("checker", "default", &rules()).await.unwrap();

        assert_eq!(
            cluster.created(),
            vec![
                "ServiceAccount default/checker".to_string(),
                "ClusterRole checker".to_string(),
                "ClusterRoleBinding checker".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_provision_collision_fails_loudly() {
        let cluster = Arc::new(FakeCluster::new());
        let provisioner = AccessProvisioner::new(cluster.clone());

        provisioner.provision("checker", "default", &rules()).await.unwrap();
        let err = provisioner
            .provision("checker", "default", &rules())
            .await
            .unwrap_err();

        assert!(matches!(err, ClusterError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_provision_rolls_back_on_partial_failure() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.fail_on("create ClusterRoleBinding", Failure::Server);
        let provisioner = AccessProvisioner::new(cluster.clone());

        let result = provisioner.provision("checker", "default", &rules()).await;

        assert!(result.is_err());
        assert_eq!(
            cluster.deleted(),
            vec![
                "ClusterRole checker".to_string(),
                "ServiceAccount default/checker".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_revoke_tolerates_absent_objects() {
        let cluster = Arc::new(FakeCluster::new());
        let provisioner = AccessProvisioner::new(cluster);

        let errors = provisioner.revoke("checker", "default").await;
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_revoke_accumulates_errors() {
        let cluster = Arc::new(FakeCluster::new());
        let provisioner = AccessProvisioner::new(cluster.clone());
        provisioner.provision("checker", "default", &rules()).await.unwrap();
        cluster.fail_on("delete ClusterRoleBinding", Failure::Server);

        let errors = provisioner.revoke("checker", "default").await;

        assert_eq!(errors.len(), 1);
        assert!(errors.to_string().starts_with("1. ClusterRoleBinding checker:"));
        assert!(cluster.deleted().contains(&"ClusterRole checker".to_string()));
        assert!(cluster
            .deleted()
            .contains(&"ServiceAccount default/checker".to_string()));
    }
}
