//! Idempotent broker install, upgrade, and removal
//!
//! [`Installer::ensure_broker`] converges the cluster onto one healthy
//! broker Deployment regardless of what a prior attempt left behind:
//!
//! - absent: create namespace, Deployment, and Service, then wait for ready
//! - present and current: verify readiness, touch nothing
//! - present but stale: server-side apply the desired state in place
//! - present but owned by another release: verify reachability only
//!
//! Every mutation is a forced server-side apply under one field manager, so
//! retrying after a failed or interrupted install overwrites the leftover
//! state instead of compounding it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Namespace, PodSpec, PodTemplateSpec, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{
    Error, Result, AGENT_ANNOTATION, BROKER_DEPLOYMENT, BROKER_NAMESPACE, BROKER_PORT,
    BROKER_SERVICE, FIELD_MANAGER, VERSION,
};

/// Label recording which release owns the broker objects
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// How to install or upgrade the broker
#[derive(Debug, Clone)]
pub struct InstallParams {
    /// Broker image override; `None` uses this build's matching image
    pub image: Option<String>,
    /// Bound on waiting for the broker Deployment to become ready
    pub ready_timeout: Duration,
}

impl Default for InstallParams {
    fn default() -> Self {
        Self {
            image: None,
            ready_timeout: Duration::from_secs(60),
        }
    }
}

/// Broker image matching this client's build
pub fn default_broker_image() -> String {
    format!("ghcr.io/gangway/gangway-broker:{VERSION}")
}

/// Cluster effects the installer performs
///
/// Narrow seam over the kube API so the state machine can be exercised
/// against a mock cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// The broker Deployment, or `None` when absent
    async fn get_deployment(&self) -> Result<Option<Deployment>>;

    /// Server-side apply the broker namespace
    async fn apply_namespace(&self, namespace: Namespace) -> Result<()>;

    /// Server-side apply the broker Deployment
    async fn apply_deployment(&self, deployment: Deployment) -> Result<()>;

    /// Server-side apply the broker Service
    async fn apply_service(&self, service: Service) -> Result<()>;

    /// Delete the broker Deployment
    async fn delete_deployment(&self) -> Result<()>;

    /// Delete the broker Service
    async fn delete_service(&self) -> Result<()>;

    /// Drop the agent annotation from a workload; `false` when not found
    async fn clear_agent_annotation(&self, name: &str, namespace: &str) -> Result<bool>;

    /// (name, namespace) of every workload carrying the agent annotation
    async fn list_annotated_workloads(&self) -> Result<Vec<(String, String)>>;
}

/// Installs, upgrades, and removes the broker's cluster footprint
pub struct Installer {
    api: Arc<dyn BrokerApi>,
    params: InstallParams,
}

impl Installer {
    /// Build an installer over the given cluster seam
    pub fn new(api: Arc<dyn BrokerApi>, params: InstallParams) -> Self {
        Self { api, params }
    }

    /// Ensure a healthy broker matching this client's build is present
    ///
    /// Idempotent and convergent: a call after a failed attempt repairs the
    /// leftover state rather than erroring on it. Objects owned by another
    /// release are never mutated; for those only reachability is verified.
    #[instrument(skip(self))]
    pub async fn ensure_broker(&self) -> Result<()> {
        let desired_image = self
            .params
            .image
            .clone()
            .unwrap_or_else(default_broker_image);

        match self.api.get_deployment().await? {
            None => {
                info!(image = %desired_image, "Broker absent, installing");
                self.apply_all(&desired_image).await?;
            }
            Some(existing) => {
                if !managed_by_us(&existing) {
                    info!("Broker belongs to another release, verifying reachability only");
                    return self.wait_ready().await;
                }
                match deployment_image(&existing) {
                    Some(image) if image == desired_image => {
                        debug!(image = %desired_image, "Broker up to date");
                    }
                    image => {
                        info!(
                            from = image.unwrap_or("<none>"),
                            to = %desired_image,
                            "Upgrading broker in place"
                        );
                        self.apply_all(&desired_image).await?;
                    }
                }
            }
        }

        self.wait_ready().await
    }

    /// Remove the broker and, when asked, the listed agents' footprints
    ///
    /// `agents` are (name, namespace) pairs. Targets that are already absent
    /// are success, not error, so the call is safe to repeat.
    #[instrument(skip(self, agents))]
    pub async fn remove_broker_and_agents(
        &self,
        also_agents: bool,
        agents: &[(String, String)],
    ) -> Result<()> {
        if also_agents {
            self.remove_agents(agents).await?;
        }

        for (what, result) in [
            ("service", self.api.delete_service().await),
            ("deployment", self.api.delete_deployment().await),
        ] {
            match result {
                Ok(()) => info!(object = what, "Broker object deleted"),
                Err(e) if e.is_not_found() => debug!(object = what, "Broker object already absent"),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Drop the agent annotation from each listed workload
    ///
    /// Already-absent workloads are skipped silently.
    pub async fn remove_agents(&self, agents: &[(String, String)]) -> Result<()> {
        for (name, namespace) in agents {
            match self.api.clear_agent_annotation(name, namespace).await {
                Ok(true) => info!(workload = %name, namespace = %namespace, "Agent removed"),
                Ok(false) => {
                    debug!(workload = %name, namespace = %namespace, "Workload already absent")
                }
                Err(e) if e.is_not_found() => {
                    debug!(workload = %name, namespace = %namespace, "Workload already absent")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Workloads currently carrying the agent annotation
    pub async fn installed_agents(&self) -> Result<Vec<(String, String)>> {
        self.api.list_annotated_workloads().await
    }

    async fn apply_all(&self, image: &str) -> Result<()> {
        self.api.apply_namespace(broker_namespace()).await?;
        self.api.apply_deployment(broker_deployment(image)).await?;
        self.api.apply_service(broker_service()).await?;
        Ok(())
    }

    /// Poll the Deployment until at least one replica is ready
    async fn wait_ready(&self) -> Result<()> {
        let config = RetryConfig::with_deadline(self.params.ready_timeout);
        retry_with_backoff(&config, "broker_ready", || async {
            let deployment = self
                .api
                .get_deployment()
                .await?
                .ok_or_else(|| Error::cluster("broker deployment disappeared while waiting"))?;
            let ready = deployment
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0);
            if ready > 0 {
                debug!(ready, "Broker ready");
                Ok(())
            } else {
                Err(Error::cluster("broker deployment has no ready replicas"))
            }
        })
        .await
    }
}

fn managed_by_us(deployment: &Deployment) -> bool {
    deployment
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(MANAGED_BY_LABEL))
        .is_some_and(|v| v == FIELD_MANAGER)
}

fn deployment_image(deployment: &Deployment) -> Option<&str> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .image
        .as_deref()
}

fn broker_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), BROKER_DEPLOYMENT.to_string()),
        (MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string()),
    ])
}

fn broker_namespace() -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(BROKER_NAMESPACE.to_string()),
            labels: Some(broker_labels()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(crate) fn broker_deployment(image: &str) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(BROKER_DEPLOYMENT.to_string()),
            namespace: Some(BROKER_NAMESPACE.to_string()),
            labels: Some(broker_labels()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    "app".to_string(),
                    BROKER_DEPLOYMENT.to_string(),
                )])),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(broker_labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "broker".to_string(),
                        image: Some(image.to_string()),
                        ports: Some(vec![ContainerPort {
                            name: Some("grpc".to_string()),
                            container_port: i32::from(BROKER_PORT),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn broker_service() -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(BROKER_SERVICE.to_string()),
            namespace: Some(BROKER_NAMESPACE.to_string()),
            labels: Some(broker_labels()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                "app".to_string(),
                BROKER_DEPLOYMENT.to_string(),
            )])),
            ports: Some(vec![ServicePort {
                name: Some("grpc".to_string()),
                port: i32::from(BROKER_PORT),
                target_port: Some(IntOrString::String("grpc".to_string())),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// [`BrokerApi`] backed by the kube client
pub struct KubeBrokerApi {
    client: Client,
}

impl KubeBrokerApi {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), BROKER_NAMESPACE)
    }

    fn apply_params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }
}

#[async_trait]
impl BrokerApi for KubeBrokerApi {
    async fn get_deployment(&self) -> Result<Option<Deployment>> {
        match self.deployments().get(BROKER_DEPLOYMENT).await {
            Ok(deployment) => Ok(Some(deployment)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_namespace(&self, namespace: Namespace) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.patch(
            BROKER_NAMESPACE,
            &Self::apply_params(),
            &Patch::Apply(&namespace),
        )
        .await?;
        Ok(())
    }

    async fn apply_deployment(&self, deployment: Deployment) -> Result<()> {
        self.deployments()
            .patch(
                BROKER_DEPLOYMENT,
                &Self::apply_params(),
                &Patch::Apply(&deployment),
            )
            .await?;
        Ok(())
    }

    async fn apply_service(&self, service: Service) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), BROKER_NAMESPACE);
        api.patch(
            BROKER_SERVICE,
            &Self::apply_params(),
            &Patch::Apply(&service),
        )
        .await?;
        Ok(())
    }

    async fn delete_deployment(&self) -> Result<()> {
        self.deployments()
            .delete(BROKER_DEPLOYMENT, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn delete_service(&self) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), BROKER_NAMESPACE);
        api.delete(BROKER_SERVICE, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn clear_agent_annotation(&self, name: &str, namespace: &str) -> Result<bool> {
        let patch = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": { AGENT_ANNOTATION: null }
                    }
                }
            }
        });
        let params = PatchParams::default();

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        match deployments
            .patch(name, &params, &Patch::Merge(&patch))
            .await
        {
            Ok(_) => return Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        let stateful_sets: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        match stateful_sets
            .patch(name, &params, &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_annotated_workloads(&self) -> Result<Vec<(String, String)>> {
        let params = ListParams::default();
        let mut found = Vec::new();

        let deployments: Api<Deployment> = Api::all(self.client.clone());
        for deployment in deployments.list(&params).await?.items {
            if has_agent_annotation(
                deployment
                    .spec
                    .as_ref()
                    .and_then(|s| s.template.metadata.as_ref()),
            ) {
                if let (Some(name), Some(ns)) =
                    (deployment.metadata.name, deployment.metadata.namespace)
                {
                    found.push((name, ns));
                }
            }
        }

        let stateful_sets: Api<StatefulSet> = Api::all(self.client.clone());
        for stateful_set in stateful_sets.list(&params).await?.items {
            if has_agent_annotation(
                stateful_set
                    .spec
                    .as_ref()
                    .and_then(|s| s.template.metadata.as_ref()),
            ) {
                if let (Some(name), Some(ns)) =
                    (stateful_set.metadata.name, stateful_set.metadata.namespace)
                {
                    found.push((name, ns));
                }
            }
        }

        Ok(found)
    }
}

fn has_agent_annotation(metadata: Option<&ObjectMeta>) -> bool {
    metadata
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get(AGENT_ANNOTATION))
        .is_some_and(|v| v == "enabled")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn not_found() -> Error {
        Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        }))
    }

    fn ready_deployment(image: &str, managed: bool) -> Deployment {
        let mut deployment = broker_deployment(image);
        if !managed {
            deployment
                .metadata
                .labels
                .as_mut()
                .expect("labels set")
                .insert(MANAGED_BY_LABEL.to_string(), "helm".to_string());
        }
        deployment.status = Some(k8s_openapi::api::apps::v1::DeploymentStatus {
            ready_replicas: Some(1),
            ..Default::default()
        });
        deployment
    }

    fn fast_params() -> InstallParams {
        InstallParams {
            image: None,
            ready_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_absent_broker_is_created_and_waited_for() {
        let mut api = MockBrokerApi::new();
        let gets = AtomicU32::new(0);
        // First get sees nothing; post-apply polls see a ready deployment
        api.expect_get_deployment().returning(move || {
            if gets.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(None)
            } else {
                Ok(Some(ready_deployment(&default_broker_image(), true)))
            }
        });
        api.expect_apply_namespace().times(1).returning(|_| Ok(()));
        api.expect_apply_deployment().times(1).returning(|_| Ok(()));
        api.expect_apply_service().times(1).returning(|_| Ok(()));

        let installer = Installer::new(Arc::new(api), fast_params());
        installer.ensure_broker().await.expect("install succeeds");
    }

    #[tokio::test]
    async fn test_ensure_twice_is_idempotent() {
        let mut api = MockBrokerApi::new();
        api.expect_get_deployment()
            .returning(|| Ok(Some(ready_deployment(&default_broker_image(), true))));
        // No apply expectations: a current broker is never mutated

        let installer = Installer::new(Arc::new(api), fast_params());
        installer.ensure_broker().await.expect("first call");
        installer.ensure_broker().await.expect("second call is a no-op");
    }

    #[tokio::test]
    async fn test_stale_broker_is_upgraded_in_place() {
        let mut api = MockBrokerApi::new();
        let gets = AtomicU32::new(0);
        api.expect_get_deployment().returning(move || {
            if gets.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Some(ready_deployment("ghcr.io/gangway/gangway-broker:0.0.1", true)))
            } else {
                Ok(Some(ready_deployment(&default_broker_image(), true)))
            }
        });
        api.expect_apply_namespace().times(1).returning(|_| Ok(()));
        api.expect_apply_deployment()
            .times(1)
            .withf(|d| deployment_image(d) == Some(default_broker_image().as_str()))
            .returning(|_| Ok(()));
        api.expect_apply_service().times(1).returning(|_| Ok(()));

        let installer = Installer::new(Arc::new(api), fast_params());
        installer.ensure_broker().await.expect("upgrade succeeds");
    }

    #[tokio::test]
    async fn test_external_release_left_untouched() {
        let mut api = MockBrokerApi::new();
        api.expect_get_deployment()
            .returning(|| Ok(Some(ready_deployment("helm-chart:1.0", false))));
        // No apply expectations: another release's objects are never mutated

        let installer = Installer::new(Arc::new(api), fast_params());
        installer.ensure_broker().await.expect("reachability verified");
    }

    #[tokio::test]
    async fn test_unready_external_release_fails_without_mutation() {
        let mut api = MockBrokerApi::new();
        api.expect_get_deployment().returning(|| {
            let mut deployment = ready_deployment("helm-chart:1.0", false);
            deployment.status = None;
            Ok(Some(deployment))
        });

        let installer = Installer::new(Arc::new(api), fast_params());
        let err = installer.ensure_broker().await.expect_err("not reachable");
        assert!(err.to_string().contains("no ready replicas"));
    }

    #[tokio::test]
    async fn test_version_override_is_a_parameter() {
        let mut api = MockBrokerApi::new();
        let gets = AtomicU32::new(0);
        api.expect_get_deployment().returning(move || {
            if gets.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(None)
            } else {
                Ok(Some(ready_deployment("example.com/broker:testing", true)))
            }
        });
        api.expect_apply_namespace().returning(|_| Ok(()));
        api.expect_apply_deployment()
            .withf(|d| deployment_image(d) == Some("example.com/broker:testing"))
            .returning(|_| Ok(()));
        api.expect_apply_service().returning(|_| Ok(()));

        let params = InstallParams {
            image: Some("example.com/broker:testing".to_string()),
            ready_timeout: Duration::from_millis(200),
        };
        let installer = Installer::new(Arc::new(api), params);
        installer.ensure_broker().await.expect("override install");
    }

    /// Story: a failed install converges on retry without manual cleanup
    #[tokio::test]
    async fn story_failed_install_converges_on_retry() {
        let mut api = MockBrokerApi::new();
        let applies = AtomicU32::new(0);
        let gets = AtomicU32::new(0);

        // The deployment apply fails the first time, as if the connection
        // dropped mid-install, leaving the namespace behind.
        api.expect_get_deployment().returning(move || {
            if gets.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(None)
            } else {
                Ok(Some(ready_deployment(&default_broker_image(), true)))
            }
        });
        api.expect_apply_namespace().returning(|_| Ok(()));
        api.expect_apply_deployment().returning(move |_| {
            if applies.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::cluster("connection reset during apply"))
            } else {
                Ok(())
            }
        });
        api.expect_apply_service().returning(|_| Ok(()));

        let installer = Installer::new(Arc::new(api), fast_params());

        // Act 1: the first attempt surfaces the failure to the caller
        let err = installer.ensure_broker().await.expect_err("first attempt fails");
        assert!(err.to_string().contains("connection reset"));

        // Act 2: the second attempt repairs the leftover state and succeeds
        installer.ensure_broker().await.expect("retry converges");
    }

    #[tokio::test]
    async fn test_remove_tolerates_absent_targets() {
        let mut api = MockBrokerApi::new();
        api.expect_delete_service().returning(|| Err(not_found()));
        api.expect_delete_deployment().returning(|| Err(not_found()));
        api.expect_clear_agent_annotation()
            .returning(|_, _| Ok(false));

        let installer = Installer::new(Arc::new(api), fast_params());
        installer
            .remove_broker_and_agents(
                true,
                &[("echo".to_string(), "default".to_string())],
            )
            .await
            .expect("not-found is success");
    }

    #[tokio::test]
    async fn test_remove_agents_clears_annotations() {
        let mut api = MockBrokerApi::new();
        api.expect_clear_agent_annotation()
            .times(2)
            .returning(|_, _| Ok(true));

        let installer = Installer::new(Arc::new(api), fast_params());
        installer
            .remove_agents(&[
                ("echo".to_string(), "default".to_string()),
                ("api".to_string(), "staging".to_string()),
            ])
            .await
            .expect("annotations cleared");
    }

    #[test]
    fn test_manifests_carry_ownership_labels() {
        let deployment = broker_deployment(&default_broker_image());
        assert!(managed_by_us(&deployment));

        let service = broker_service();
        assert_eq!(
            service
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(MANAGED_BY_LABEL)),
            Some(&FIELD_MANAGER.to_string())
        );
        assert_eq!(
            service
                .spec
                .as_ref()
                .and_then(|s| s.ports.as_ref())
                .and_then(|p| p.first())
                .map(|p| p.port),
            Some(i32::from(BROKER_PORT))
        );
    }

    #[test]
    fn test_foreign_manager_label_is_not_ours() {
        let deployment = ready_deployment("x", false);
        assert!(!managed_by_us(&deployment));

        // A deployment with no labels at all is foreign too
        let bare = Deployment::default();
        assert!(!managed_by_us(&bare));
    }
}
