//! Periodically-refreshed join of Services and the workloads they select
//!
//! The [`WorkloadWatcher`] recomputes, on every refresh tick, which
//! Deployments and StatefulSets are selected by which Services in the
//! watched namespaces. Each cycle rebuilds the whole snapshot and swaps it
//! in atomically; consumers are signalled "a new snapshot is ready" and
//! re-read the current one, they are never handed data through the signal.
//!
//! # Join semantics
//!
//! A Service selects a workload when the Service's selector is a non-empty
//! subset of the workload's pod-template labels and both live in the same
//! namespace. Every distinct workload UID appears at most once; when several
//! Services select the same workload, the first Service in list order wins.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Service;
use kube::api::ListParams;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cluster::normalize_namespaces;
use crate::proto::broker::{AgentInfo, InterceptInfo};
use crate::Result;

/// How often the watcher recomputes the join
pub const WATCH_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Kind of workload a snapshot entry describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkloadKind {
    /// An apps/v1 Deployment
    Deployment,
    /// An apps/v1 StatefulSet
    StatefulSet,
}

impl WorkloadKind {
    /// Kubernetes kind string
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One exposed port of the selecting Service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortSpec {
    /// Service port name, if named
    pub name: Option<String>,
    /// Service port number
    pub port: u16,
}

/// One workload joined with the Service that selects it
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadEntry {
    /// Workload name
    pub name: String,
    /// Namespace both objects live in
    pub namespace: String,
    /// Workload kind
    pub kind: WorkloadKind,
    /// Workload UID; snapshot entries are unique by it
    pub uid: String,
    /// Name of the selecting Service
    pub service_name: String,
    /// UID of the selecting Service
    pub service_uid: String,
    /// Ports of the selecting Service
    pub ports: Vec<PortSpec>,
}

/// A snapshot entry enriched with its intercept and agent records
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadInfo {
    /// The joined workload/Service pair
    pub workload: WorkloadEntry,
    /// Agent installed on the workload, if any
    pub agent: Option<AgentInfo>,
    /// Intercept targeting the workload, if any
    pub intercept: Option<InterceptInfo>,
}

/// Which enriched entries a listing returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkloadFilter {
    /// Every matched workload
    #[default]
    All,
    /// Only workloads with an installed agent
    InstalledAgents,
    /// Only workloads with an intercept
    Intercepts,
}

impl WorkloadFilter {
    /// Whether `info` passes this filter
    pub fn admits(&self, info: &WorkloadInfo) -> bool {
        match self {
            WorkloadFilter::All => true,
            WorkloadFilter::InstalledAgents => info.agent.is_some(),
            WorkloadFilter::Intercepts => info.intercept.is_some(),
        }
    }
}

/// List operations the watcher needs from the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadLister: Send + Sync {
    /// Services in `namespace`, or cluster-wide when `None`
    async fn list_services<'a>(&self, namespace: Option<&'a str>) -> Result<Vec<Service>>;

    /// Deployments in `namespace`, or cluster-wide when `None`
    async fn list_deployments<'a>(&self, namespace: Option<&'a str>) -> Result<Vec<Deployment>>;

    /// StatefulSets in `namespace`, or cluster-wide when `None`
    async fn list_stateful_sets<'a>(&self, namespace: Option<&'a str>) -> Result<Vec<StatefulSet>>;
}

/// [`WorkloadLister`] backed by the kube API
pub struct KubeWorkloadLister {
    client: Client,
}

impl KubeWorkloadLister {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn scoped<K>(&self, namespace: Option<&str>) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl WorkloadLister for KubeWorkloadLister {
    async fn list_services<'a>(&self, namespace: Option<&'a str>) -> Result<Vec<Service>> {
        let api: Api<Service> = self.scoped(namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_deployments<'a>(&self, namespace: Option<&'a str>) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = self.scoped(namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_stateful_sets<'a>(&self, namespace: Option<&'a str>) -> Result<Vec<StatefulSet>> {
        let api: Api<StatefulSet> = self.scoped(namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// Identity and pod-template labels of one workload, kind-erased for the join
pub(crate) struct WorkloadMeta {
    pub(crate) name: String,
    pub(crate) namespace: String,
    pub(crate) kind: WorkloadKind,
    pub(crate) uid: String,
    pub(crate) labels: BTreeMap<String, String>,
}

struct WatchState {
    namespaces: Vec<String>,
    entries: Vec<WorkloadEntry>,
    generation: u64,
    /// Bumped whenever the watch set changes
    epoch: u64,
    /// Epoch the last completed refresh was computed for
    synced_epoch: u64,
}

/// Maintains the Service ↔ workload join for the watched namespaces
pub struct WorkloadWatcher {
    lister: Arc<dyn WorkloadLister>,
    state: Mutex<WatchState>,
    notify: watch::Sender<u64>,
}

impl WorkloadWatcher {
    /// Create a watcher over `namespaces` (empty = all)
    pub fn new(lister: Arc<dyn WorkloadLister>, namespaces: &[String]) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            lister,
            state: Mutex::new(WatchState {
                namespaces: normalize_namespaces(namespaces),
                entries: Vec::new(),
                generation: 0,
                epoch: 1,
                synced_epoch: 0,
            }),
            notify,
        }
    }

    /// Signal source that fires once per completed refresh
    ///
    /// Subscribers re-read [`WorkloadWatcher::snapshot`] on each signal; a
    /// subscriber that does not keep up only misses intermediate signals,
    /// never the latest state.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    /// Point-in-time copy of the current snapshot
    pub async fn snapshot(&self) -> Vec<WorkloadEntry> {
        self.state.lock().await.entries.clone()
    }

    /// Change the watched namespaces; takes effect on the next refresh
    pub async fn set_namespaces_to_watch(&self, namespaces: &[String]) {
        let normalized = normalize_namespaces(namespaces);
        let mut state = self.state.lock().await;
        if state.namespaces == normalized {
            return;
        }
        debug!(namespaces = ?normalized, "Watch set changed");
        state.namespaces = normalized;
        state.epoch += 1;
    }

    /// Block until a refresh has completed for the current watch set
    ///
    /// Protects callers from reading an artificially-empty listing right
    /// after a namespace change.
    pub async fn wait_for_sync(&self) {
        let target = self.state.lock().await.epoch;
        let mut rx = self.notify.subscribe();
        loop {
            if self.state.lock().await.synced_epoch >= target {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Recompute the join once and swap the snapshot in
    pub async fn refresh(&self) -> Result<()> {
        let (namespaces, epoch) = {
            let state = self.state.lock().await;
            (state.namespaces.clone(), state.epoch)
        };

        let mut entries = Vec::new();
        if namespaces.is_empty() {
            entries.extend(self.compute(None).await?);
        } else {
            for ns in &namespaces {
                entries.extend(self.compute(Some(ns)).await?);
            }
        }

        let generation = {
            let mut state = self.state.lock().await;
            state.entries = entries;
            state.generation += 1;
            state.synced_epoch = epoch;
            state.generation
        };
        debug!(generation, "Workload snapshot refreshed");
        let _ = self.notify.send(generation);
        Ok(())
    }

    /// Refresh on a fixed interval until cancelled
    ///
    /// List failures are transient: logged, and the stale snapshot stands
    /// until the next tick succeeds.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(WATCH_REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Workload watcher stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "Workload refresh failed");
                    }
                }
            }
        }
    }

    async fn compute(&self, namespace: Option<&str>) -> Result<Vec<WorkloadEntry>> {
        let services = self.lister.list_services(namespace).await?;
        let deployments = self.lister.list_deployments(namespace).await?;
        let stateful_sets = self.lister.list_stateful_sets(namespace).await?;

        let mut workloads: Vec<WorkloadMeta> = Vec::new();
        workloads.extend(deployments.iter().filter_map(deployment_meta));
        workloads.extend(stateful_sets.iter().filter_map(stateful_set_meta));

        Ok(join_services_and_workloads(&services, &workloads))
    }
}

/// Whether `selector` is a non-empty subset of `labels`
pub(crate) fn selector_matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    if selector.is_empty() {
        return false;
    }
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|lv| lv == v))
}

fn join_services_and_workloads(
    services: &[Service],
    workloads: &[WorkloadMeta],
) -> Vec<WorkloadEntry> {
    let mut seen_uids: HashSet<&str> = HashSet::new();
    let mut entries = Vec::new();

    for service in services {
        let Some(spec) = &service.spec else { continue };
        let Some(selector) = &spec.selector else { continue };
        let (Some(svc_name), Some(svc_ns), Some(svc_uid)) = (
            service.metadata.name.as_deref(),
            service.metadata.namespace.as_deref(),
            service.metadata.uid.as_deref(),
        ) else {
            continue;
        };

        let ports: Vec<PortSpec> = spec
            .ports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|p| {
                u16::try_from(p.port).ok().map(|port| PortSpec {
                    name: p.name.clone(),
                    port,
                })
            })
            .collect();

        for workload in workloads {
            if workload.namespace != svc_ns
                || seen_uids.contains(workload.uid.as_str())
                || !selector_matches(selector, &workload.labels)
            {
                continue;
            }
            seen_uids.insert(&workload.uid);
            entries.push(WorkloadEntry {
                name: workload.name.clone(),
                namespace: workload.namespace.clone(),
                kind: workload.kind,
                uid: workload.uid.clone(),
                service_name: svc_name.to_string(),
                service_uid: svc_uid.to_string(),
                ports: ports.clone(),
            });
        }
    }

    entries
}

pub(crate) fn deployment_meta(deployment: &Deployment) -> Option<WorkloadMeta> {
    Some(WorkloadMeta {
        name: deployment.metadata.name.clone()?,
        namespace: deployment.metadata.namespace.clone()?,
        kind: WorkloadKind::Deployment,
        uid: deployment.metadata.uid.clone()?,
        labels: deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.clone())
            .unwrap_or_default(),
    })
}

pub(crate) fn stateful_set_meta(stateful_set: &StatefulSet) -> Option<WorkloadMeta> {
    Some(WorkloadMeta {
        name: stateful_set.metadata.name.clone()?,
        namespace: stateful_set.metadata.namespace.clone()?,
        kind: WorkloadKind::StatefulSet,
        uid: stateful_set.metadata.uid.clone()?,
        labels: stateful_set
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.clone())
            .unwrap_or_default(),
    })
}
