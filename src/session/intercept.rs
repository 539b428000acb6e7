//! Intercept operations on a live session
//!
//! Adding an intercept validates the request against current state, resolves
//! the workload / Service / port triple against the cluster, submits it to
//! the broker, and follows the broker's snapshots until the intercept leaves
//! its waiting disposition. Local-only intercepts skip the broker entirely:
//! they only widen the namespaces the net daemon makes visible, so code
//! running on the workstation can reach a workload's neighbors without
//! rerouting any cluster traffic.

use std::time::Duration;

use k8s_openapi::api::core::v1::{Service, ServicePort};
use tracing::{debug, info, instrument};

use crate::proto::broker::{
    CreateInterceptRequest, Disposition, InterceptInfo, InterceptSpec, RemoveInterceptRequest,
};
use crate::workloads::{deployment_meta, selector_matches, stateful_set_meta};
use crate::{Error, Result};

use super::{Session, Snapshotted};

/// Bound on following an intercept from submission to a settled disposition
const INTERCEPT_ACTIVATION_TIMEOUT: Duration = Duration::from_secs(30);

/// What the user wants intercepted and where the traffic should go
#[derive(Debug, Clone)]
pub struct InterceptRequest {
    /// Workload to intercept; also the intercept's name
    pub workload: String,
    /// Namespace the workload lives in
    pub namespace: String,
    /// Disambiguates when several Services select the workload
    pub service_name: Option<String>,
    /// Service port by name or decimal number; `None` picks the sole port
    pub service_port: Option<String>,
    /// Local address rerouted traffic is delivered to
    pub target_host: String,
    /// Local port rerouted traffic is delivered to
    pub target_port: u16,
}

impl InterceptRequest {
    /// Request rerouting `workload` in `namespace` to a local port
    pub fn new(workload: impl Into<String>, namespace: impl Into<String>, target_port: u16) -> Self {
        Self {
            workload: workload.into(),
            namespace: namespace.into(),
            service_name: None,
            service_port: None,
            target_host: "127.0.0.1".to_string(),
            target_port,
        }
    }
}

impl Session {
    /// Create an intercept and follow it until it settles
    ///
    /// Validates the request against intercepts already in place, resolves
    /// the workload and its Service/port against the cluster, submits the
    /// spec, and then waits for a snapshot in which the intercept has left
    /// its waiting disposition. Returns the active record, or the error
    /// disposition's detail as a user or cluster error.
    #[instrument(skip(self, request), fields(workload = %request.workload, namespace = %request.namespace))]
    pub async fn add_intercept(&self, request: &InterceptRequest) -> Result<InterceptInfo> {
        self.check_conflicts(request).await?;
        let spec = self.resolve_spec(request).await?;

        info!(
            service = %spec.service_name,
            port = %spec.service_port_identifier,
            "Submitting intercept"
        );
        let created = self
            .broker
            .create_intercept(CreateInterceptRequest {
                session: Some(self.info.clone()),
                spec: Some(spec),
            })
            .await?;

        let settled = match created.disposition() {
            Disposition::Waiting | Disposition::Unspecified => {
                tokio::time::timeout(
                    INTERCEPT_ACTIVATION_TIMEOUT,
                    self.follow_until_settled(&request.workload),
                )
                .await
                .map_err(|_| {
                    Error::cluster(format!(
                        "intercept {} did not become active within {:?}",
                        request.workload, INTERCEPT_ACTIVATION_TIMEOUT
                    ))
                })??
            }
            _ => created,
        };

        match settled.disposition() {
            Disposition::Active => {
                info!(intercept = %request.workload, "Intercept active");
                self.reconcile_namespaces().await;
                Ok(settled)
            }
            Disposition::AgentError => Err(Error::cluster(format!(
                "agent rejected intercept {}: {}",
                request.workload, settled.message
            ))),
            Disposition::BadArgs => Err(Error::user(format!(
                "invalid intercept {}: {}",
                request.workload, settled.message
            ))),
            other => Err(Error::internal(format!(
                "intercept {} settled in unexpected disposition {:?}",
                request.workload, other
            ))),
        }
    }

    /// Register a local-only intercept
    ///
    /// No broker involvement and no traffic rerouting; the namespace just
    /// becomes visible to local processes through the net daemon.
    pub async fn add_local_intercept(&self, name: &str, namespace: &str) -> Result<()> {
        {
            let mut local = self.local_intercepts.lock().await;
            if local.contains_key(name) {
                return Err(Error::user(format!("intercept {name} already exists")));
            }
            let remote = self.intercepts.current().await;
            if remote.iter().any(|i| i.key() == name) {
                return Err(Error::user(format!("intercept {name} already exists")));
            }
            local.insert(name.to_string(), namespace.to_string());
        }
        info!(intercept = %name, namespace = %namespace, "Local-only intercept added");
        self.reconcile_namespaces().await;
        Ok(())
    }

    /// Remove one intercept by name, local or broker-side
    ///
    /// Only this client's intercepts can be removed; a broker-side
    /// not-found is success, since the goal state is reached either way.
    pub async fn remove_intercept(&self, name: &str) -> Result<()> {
        if self.local_intercepts.lock().await.remove(name).is_some() {
            info!(intercept = %name, "Local-only intercept removed");
            self.reconcile_namespaces().await;
            return Ok(());
        }

        let current = self.intercepts.current().await;
        let Some(found) = current.iter().find(|i| i.key() == name) else {
            return Err(Error::user(format!("no intercept named {name}")));
        };
        let owner = found.spec.as_ref().map(|s| s.client.as_str()).unwrap_or("");
        if owner != self.identity.name {
            return Err(Error::user(format!(
                "intercept {name} belongs to {owner}, not to this client"
            )));
        }

        match self
            .broker
            .remove_intercept(RemoveInterceptRequest {
                session: Some(self.info.clone()),
                name: name.to_string(),
            })
            .await
        {
            Ok(()) => info!(intercept = %name, "Intercept removed"),
            Err(e) if e.is_not_found() => debug!(intercept = %name, "Intercept already gone"),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Remove every intercept this client owns, local-only ones included
    ///
    /// Used both directly and as the first teardown step. Attempts every
    /// removal even when one fails; the first failure is returned after the
    /// rest were tried.
    pub async fn clear_intercepts(&self) -> Result<()> {
        let mine: Vec<String> = self
            .intercepts
            .current()
            .await
            .iter()
            .filter(|i| {
                i.spec
                    .as_ref()
                    .is_some_and(|s| s.client == self.identity.name)
            })
            .map(|i| i.key())
            .collect();

        let mut first_err = None;
        for name in mine {
            let result = self
                .broker
                .remove_intercept(RemoveInterceptRequest {
                    session: Some(self.info.clone()),
                    name: name.clone(),
                })
                .await;
            match result {
                Ok(()) => debug!(intercept = %name, "Intercept removed"),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        self.local_intercepts.lock().await.clear();
        self.reconcile_namespaces().await;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reject requests conflicting with intercepts already in place
    async fn check_conflicts(&self, request: &InterceptRequest) -> Result<()> {
        if self
            .local_intercepts
            .lock()
            .await
            .contains_key(&request.workload)
        {
            return Err(Error::user(format!(
                "intercept {} already exists",
                request.workload
            )));
        }

        for existing in self.intercepts.current().await {
            let Some(spec) = &existing.spec else { continue };
            if spec.name == request.workload {
                return Err(Error::user(format!(
                    "intercept {} already exists",
                    request.workload
                )));
            }
            if spec.client == self.identity.name && spec.target_port == u32::from(request.target_port)
            {
                return Err(Error::user(format!(
                    "local port {} is already in use by intercept '{}'",
                    request.target_port, spec.name
                )));
            }
        }
        Ok(())
    }

    /// Resolve the workload, Service, and port the request names
    async fn resolve_spec(&self, request: &InterceptRequest) -> Result<InterceptSpec> {
        let ns = request.namespace.as_str();

        let workload = {
            let deployments = self.lister.list_deployments(Some(ns)).await?;
            let found = deployments
                .iter()
                .filter(|d| d.metadata.name.as_deref() == Some(request.workload.as_str()))
                .find_map(deployment_meta);
            match found {
                Some(meta) => meta,
                None => {
                    let stateful_sets = self.lister.list_stateful_sets(Some(ns)).await?;
                    stateful_sets
                        .iter()
                        .filter(|s| s.metadata.name.as_deref() == Some(request.workload.as_str()))
                        .find_map(stateful_set_meta)
                        .ok_or_else(|| {
                            Error::user(format!(
                                "workload {} not found in namespace {ns}",
                                request.workload
                            ))
                        })?
                }
            }
        };

        let services = self.lister.list_services(Some(ns)).await?;
        let candidates: Vec<&Service> = services
            .iter()
            .filter(|svc| {
                svc.spec
                    .as_ref()
                    .and_then(|s| s.selector.as_ref())
                    .is_some_and(|selector| selector_matches(selector, &workload.labels))
            })
            .collect();

        let service = match (&request.service_name, candidates.as_slice()) {
            (_, []) => {
                return Err(Error::user(format!(
                    "no service selects workload {} in namespace {ns}",
                    request.workload
                )))
            }
            (Some(wanted), _) => candidates
                .iter()
                .find(|svc| svc.metadata.name.as_deref() == Some(wanted.as_str()))
                .copied()
                .ok_or_else(|| {
                    Error::user(format!(
                        "service {wanted} does not select workload {}",
                        request.workload
                    ))
                })?,
            (None, [only]) => only,
            (None, many) => {
                let names: Vec<&str> = many
                    .iter()
                    .filter_map(|svc| svc.metadata.name.as_deref())
                    .collect();
                return Err(Error::user(format!(
                    "workload {} is selected by multiple services: {}; pick one with --service",
                    request.workload,
                    names.join(", ")
                )));
            }
        };

        let service_name = service.metadata.name.clone().unwrap_or_default();
        let ports = service
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_deref())
            .unwrap_or_default();
        let port_identifier =
            resolve_port(ports, request.service_port.as_deref(), &service_name)?;

        Ok(InterceptSpec {
            name: request.workload.clone(),
            client: self.identity.name.clone(),
            workload: workload.name,
            workload_kind: workload.kind.as_str().to_string(),
            namespace: request.namespace.clone(),
            service_name,
            service_port_identifier: port_identifier,
            target_host: request.target_host.clone(),
            target_port: u32::from(request.target_port),
            mechanism: "tcp".to_string(),
            mechanism_args: Vec::new(),
        })
    }

    /// Re-register against the intercept cache until the disposition settles
    async fn follow_until_settled(&self, name: &str) -> Result<InterceptInfo> {
        let mut rx = self.intercepts.wait_appear(name).await;
        loop {
            let info = rx
                .await
                .map_err(|_| Error::internal(format!("intercept waiter for {name} displaced")))?;
            if is_settled(&info) {
                return Ok(info);
            }
            rx = self.intercepts.wait_next(name).await;

            // A refresh can land between the delivery above and the
            // re-registration, fulfilling no waiter; the broker only pushes
            // on change, so re-read the snapshot instead of counting on a
            // further refresh.
            let current = self
                .intercepts
                .current()
                .await
                .into_iter()
                .find(|i| i.key() == name);
            if let Some(info) = current {
                if is_settled(&info) {
                    return Ok(info);
                }
            }
        }
    }
}

/// A disposition the broker will not move off on its own
fn is_settled(info: &InterceptInfo) -> bool {
    !matches!(
        info.disposition(),
        Disposition::Waiting | Disposition::Unspecified
    )
}

/// Pick the Service port the intercept attaches to
///
/// An explicit identifier matches a port's name or decimal number; with no
/// identifier the Service must expose exactly one port.
fn resolve_port(
    ports: &[ServicePort],
    identifier: Option<&str>,
    service_name: &str,
) -> Result<String> {
    match identifier {
        Some(wanted) => {
            let matched = ports.iter().any(|p| {
                p.name.as_deref() == Some(wanted) || p.port.to_string() == wanted
            });
            if matched {
                Ok(wanted.to_string())
            } else {
                Err(Error::user(format!(
                    "service {service_name} has no port {wanted}"
                )))
            }
        }
        None => match ports {
            [] => Err(Error::user(format!(
                "service {service_name} exposes no ports"
            ))),
            [only] => Ok(only
                .name
                .clone()
                .unwrap_or_else(|| only.port.to_string())),
            many => {
                let names: Vec<String> = many
                    .iter()
                    .map(|p| p.name.clone().unwrap_or_else(|| p.port.to_string()))
                    .collect();
                Err(Error::user(format!(
                    "service {service_name} exposes multiple ports: {}; pick one with --port",
                    names.join(", ")
                )))
            }
        },
    }
}

/// Synthetic record a local-only intercept is listed as
pub(super) fn local_intercept_info(name: &str, namespace: &str, client: &str) -> InterceptInfo {
    InterceptInfo {
        spec: Some(InterceptSpec {
            name: name.to_string(),
            client: client.to_string(),
            workload: name.to_string(),
            namespace: namespace.to_string(),
            mechanism: "local-only".to_string(),
            ..Default::default()
        }),
        id: String::new(),
        disposition: Disposition::Active as i32,
        message: String::new(),
    }
}
