//! Session lifecycle: establish, run, and tear down the broker session
//!
//! A [`Session`] is the live handshake state between this process and the
//! in-cluster broker. [`Session::establish`] performs the arrival handshake
//! and the one-time reconcile with the local net daemon; [`Session::run`]
//! then fans out the background tasks that serve the session - heartbeat,
//! snapshot watchers, and the dial-request bridge - under one cancellation
//! scope and returns when all of them have stopped.
//!
//! Once created the session's identity is immutable; every piece of mutable
//! state (snapshot caches, the workload watcher, the local intercept map) is
//! owned by the session and cannot outlive it.

pub mod cache;
pub mod dial;
mod intercept;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::{normalize_namespaces, ClusterConfig};
use crate::install::{InstallParams, Installer};
use crate::netd::{outbound_config, NetDaemon};
use crate::proto::broker::broker_client::BrokerClient;
use crate::proto::broker::{
    AgentInfo, AgentSnapshot, ClientInfo, CreateInterceptRequest, InterceptInfo,
    InterceptSnapshot, RemainRequest, RemoveInterceptRequest, SessionInfo,
};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::workloads::{
    WorkloadEntry, WorkloadFilter, WorkloadInfo, WorkloadKind, WorkloadLister, WorkloadWatcher,
};
use crate::{
    ConnectError, Error, Result, BROKER_NAMESPACE, BROKER_PORT, BROKER_SERVICE, PRODUCT_NAME,
    SESSION_HEARTBEAT_INTERVAL, TEARDOWN_TIMEOUT, VERSION,
};

pub use cache::{AgentStore, InterceptStore, SnapshotStore, Snapshotted};
pub use dial::{dial_loop, DialRequestStream, Dialer, TcpDialer};
pub use intercept::InterceptRequest;

/// Bound on confirming an uninstalled agent's disappearance
const AGENT_VANISH_TIMEOUT: Duration = Duration::from_secs(10);

/// A server-pushed stream of full agent snapshots
pub type AgentSnapshotStream =
    Pin<Box<dyn Stream<Item = std::result::Result<AgentSnapshot, tonic::Status>> + Send>>;

/// A server-pushed stream of full intercept snapshots
pub type InterceptSnapshotStream =
    Pin<Box<dyn Stream<Item = std::result::Result<InterceptSnapshot, tonic::Status>> + Send>>;

/// Broker RPCs the session and its background tasks use
///
/// The gRPC channel behind the real implementation is safe for concurrent
/// use; the heartbeat and user-initiated calls may be in flight at once.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Arrival handshake: present the client identity, receive a session
    async fn arrive(&self, identity: ClientInfo) -> Result<SessionInfo>;

    /// Keep-alive, optionally carrying a freshly fetched token
    async fn remain(&self, session: SessionInfo, api_key: String) -> Result<()>;

    /// Graceful departure notice
    async fn depart(&self, session: SessionInfo) -> Result<()>;

    /// Stream of full agent snapshots for the session
    async fn watch_agents(&self, session: SessionInfo) -> Result<AgentSnapshotStream>;

    /// Stream of full intercept snapshots for the session
    async fn watch_intercepts(&self, session: SessionInfo) -> Result<InterceptSnapshotStream>;

    /// Stream of dial requests originated by cluster-side agents
    async fn watch_dial(&self, session: SessionInfo) -> Result<DialRequestStream>;

    /// Submit an intercept; the returned record is usually still waiting
    async fn create_intercept(&self, request: CreateInterceptRequest) -> Result<InterceptInfo>;

    /// Remove an intercept by name
    async fn remove_intercept(&self, request: RemoveInterceptRequest) -> Result<()>;
}

/// Source of auth tokens for a named purpose
///
/// Token fetches are best effort everywhere they are used; a failure never
/// blocks or fails the operation that wanted the token.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Fetch a token for the named purpose
    async fn token(&self, purpose: &str) -> Result<String>;
}

/// [`BrokerTransport`] over the session's shared gRPC channel
pub struct GrpcBroker {
    client: BrokerClient<Channel>,
}

impl GrpcBroker {
    /// Wrap an established channel to the broker
    pub fn new(channel: Channel) -> Self {
        Self {
            client: BrokerClient::new(channel),
        }
    }
}

#[async_trait]
impl BrokerTransport for GrpcBroker {
    async fn arrive(&self, identity: ClientInfo) -> Result<SessionInfo> {
        Ok(self
            .client
            .clone()
            .arrive_as_client(identity)
            .await?
            .into_inner())
    }

    async fn remain(&self, session: SessionInfo, api_key: String) -> Result<()> {
        self.client
            .clone()
            .remain(RemainRequest {
                session: Some(session),
                api_key,
            })
            .await?;
        Ok(())
    }

    async fn depart(&self, session: SessionInfo) -> Result<()> {
        self.client.clone().depart(session).await?;
        Ok(())
    }

    async fn watch_agents(&self, session: SessionInfo) -> Result<AgentSnapshotStream> {
        let stream = self.client.clone().watch_agents(session).await?.into_inner();
        Ok(Box::pin(stream))
    }

    async fn watch_intercepts(&self, session: SessionInfo) -> Result<InterceptSnapshotStream> {
        let stream = self
            .client
            .clone()
            .watch_intercepts(session)
            .await?
            .into_inner();
        Ok(Box::pin(stream))
    }

    async fn watch_dial(&self, session: SessionInfo) -> Result<DialRequestStream> {
        let stream = self.client.clone().watch_dial(session).await?.into_inner();
        Ok(Box::pin(stream))
    }

    async fn create_intercept(&self, request: CreateInterceptRequest) -> Result<InterceptInfo> {
        Ok(self
            .client
            .clone()
            .create_intercept(request)
            .await?
            .into_inner())
    }

    async fn remove_intercept(&self, request: RemoveInterceptRequest) -> Result<()> {
        self.client.clone().remove_intercept(request).await?;
        Ok(())
    }
}

/// Immutable identity of the cluster a session is connected to
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterIdentity {
    /// Kubeconfig context name
    pub context: String,
    /// API server URL
    pub server: String,
    /// UID of the cluster's `default` namespace; may be empty
    pub cluster_id: String,
}

/// What the caller wants a session to look like
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Cluster selection and namespace mapping
    pub cluster: ClusterConfig,
    /// Broker endpoint as seen from the workstation
    pub broker_address: String,
    /// Broker install/upgrade parameters
    pub install: InstallParams,
    /// Bound on the whole ensure-broker step
    pub install_timeout: Duration,
}

impl Default for ConnectRequest {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            broker_address: default_broker_address(),
            install: InstallParams::default(),
            install_timeout: Duration::from_secs(120),
        }
    }
}

/// Broker address as routed through the cluster's DNS
pub fn default_broker_address() -> String {
    format!("http://{BROKER_SERVICE}.{BROKER_NAMESPACE}:{BROKER_PORT}")
}

/// The identity this workstation presents at arrival
///
/// `user@host` from the environment plus product/version strings. The
/// install id comes from `GANGWAY_INSTALL_ID` when set, otherwise it is
/// fresh for this process.
pub fn local_identity(api_key: String) -> ClientInfo {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = local_hostname();
    let install_id = std::env::var("GANGWAY_INSTALL_ID")
        .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
    ClientInfo {
        name: format!("{user}@{host}"),
        install_id,
        product: PRODUCT_NAME.to_string(),
        version: VERSION.to_string(),
        api_key,
    }
}

/// The machine's hostname
///
/// `HOSTNAME` is a shell-internal variable and rarely exported, so the
/// kernel's record is consulted first; the env var is a fallback only.
fn local_hostname() -> String {
    for path in ["/etc/hostname", "/proc/sys/kernel/hostname"] {
        if let Ok(contents) = std::fs::read_to_string(path) {
            let trimmed = contents.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// External collaborators a session is built from
pub struct SessionDeps {
    /// Broker RPC surface
    pub broker: Arc<dyn BrokerTransport>,
    /// Local network daemon RPC surface
    pub netd: Arc<dyn NetDaemon>,
    /// Broker install/remove capability; held by composition, never embedded
    pub installer: Arc<Installer>,
    /// Cluster list operations for the workload watcher
    pub lister: Arc<dyn WorkloadLister>,
    /// Relay implementation for the dial bridge
    pub dialer: Arc<dyn Dialer>,
    /// Optional token source for arrival and heartbeats
    pub token_source: Option<Arc<dyn TokenSource>>,
}

/// Point-in-time view of a live session for the CLI
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    /// Kubeconfig context name
    pub context: String,
    /// API server URL
    pub server: String,
    /// Cluster id; may be empty
    pub cluster_id: String,
    /// Broker-issued session id
    pub session_id: String,
    /// Seconds since arrival
    pub uptime_seconds: u64,
    /// Current agent list
    pub agents: Vec<AgentInfo>,
    /// Current intercept list
    pub intercepts: Vec<InterceptInfo>,
}

/// What an uninstall should remove
#[derive(Debug, Clone)]
pub enum UninstallScope {
    /// The named agents only
    NamedAgents(Vec<String>),
    /// Every installed agent
    AllAgents,
    /// The broker and every installed agent; ends the session
    Everything,
}

type SessionTask = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A live session with the broker
pub struct Session {
    info: SessionInfo,
    identity: ClientInfo,
    cluster: ClusterIdentity,
    broker_address: String,
    broker: Arc<dyn BrokerTransport>,
    netd: Arc<dyn NetDaemon>,
    installer: Arc<Installer>,
    lister: Arc<dyn WorkloadLister>,
    dialer: Arc<dyn Dialer>,
    token_source: Option<Arc<dyn TokenSource>>,
    agents: Arc<AgentStore>,
    intercepts: Arc<InterceptStore>,
    watcher: Arc<WorkloadWatcher>,
    mapped_namespaces: RwLock<Vec<String>>,
    /// Client-owned local-only intercepts: name to namespace
    local_intercepts: Mutex<HashMap<String, String>>,
    last_dns_push: Mutex<Option<(Vec<String>, Vec<String>)>>,
    extra_tasks: Mutex<Vec<(String, SessionTask)>>,
    started_at: DateTime<Utc>,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
}

// Manual impl: the trait-object and task fields aren't Debug.
impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("info", &self.info)
            .field("broker_address", &self.broker_address)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Establish a session with the broker
    ///
    /// Ensures the broker is installed and reachable (bounded by the
    /// request's install timeout), performs the arrival handshake, and
    /// reconciles the local net daemon onto the new session. Every failure
    /// maps to one of the closed-set [`ConnectError`] reasons; the caller is
    /// a long-running daemon and must never see a panic or a free-text
    /// error it has to parse.
    #[instrument(skip_all)]
    pub async fn establish(
        deps: SessionDeps,
        request: &ConnectRequest,
        cluster: ClusterIdentity,
    ) -> std::result::Result<Arc<Self>, ConnectError> {
        match tokio::time::timeout(request.install_timeout, deps.installer.ensure_broker()).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ConnectError::broker(e)),
            Err(_) => {
                return Err(ConnectError::broker(Error::cluster(format!(
                    "broker not ready within {:?}",
                    request.install_timeout
                ))))
            }
        }

        let api_key = match &deps.token_source {
            Some(source) => source.token("arrive").await.unwrap_or_else(|e| {
                debug!(error = %e, "Token fetch failed, arriving without one");
                String::new()
            }),
            None => String::new(),
        };
        let identity = local_identity(api_key);

        // The broker Service's endpoints can lag its Deployment turning
        // ready, so the first RPC gets a short retry window of its own.
        let info = retry_with_backoff(&RetryConfig::with_max_attempts(5), "arrive", || {
            deps.broker.arrive(identity.clone())
        })
        .await
        .map_err(ConnectError::broker)?;
        info!(session = %info.session_id, client = %identity.name, "Arrived as client");

        reconcile_net_daemon(deps.netd.as_ref(), &info, request).await?;

        let mapped = normalize_namespaces(&request.cluster.mapped_namespaces);
        let watcher = Arc::new(WorkloadWatcher::new(deps.lister.clone(), &mapped));

        Ok(Arc::new(Self {
            info,
            identity,
            cluster,
            broker_address: request.broker_address.clone(),
            broker: deps.broker,
            netd: deps.netd,
            installer: deps.installer,
            lister: deps.lister,
            dialer: deps.dialer,
            token_source: deps.token_source,
            agents: Arc::new(AgentStore::new("agents")),
            intercepts: Arc::new(InterceptStore::new("intercepts")),
            watcher,
            mapped_namespaces: RwLock::new(mapped),
            local_intercepts: Mutex::new(HashMap::new()),
            last_dns_push: Mutex::new(None),
            extra_tasks: Mutex::new(Vec::new()),
            started_at: Utc::now(),
            heartbeat_interval: SESSION_HEARTBEAT_INTERVAL,
            cancel: CancellationToken::new(),
        }))
    }

    /// The broker-issued session identity
    pub fn session_info(&self) -> &SessionInfo {
        &self.info
    }

    /// The workload watcher serving this session's listings
    pub fn workload_watcher(&self) -> Arc<WorkloadWatcher> {
        self.watcher.clone()
    }

    /// Signal source firing once per completed workload refresh
    pub fn subscribe_workloads(&self) -> tokio::sync::watch::Receiver<u64> {
        self.watcher.subscribe()
    }

    /// Request cooperative shutdown of every session task
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Register an extra task to run under the session's cancellation scope
    ///
    /// Registered before [`Session::run`]; its failure cancels the session
    /// like any other session task's.
    pub async fn register_task<F>(&self, name: &str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.extra_tasks
            .lock()
            .await
            .push((name.to_string(), Box::pin(task)));
    }

    /// Serve the session until shutdown
    ///
    /// Fans out the heartbeat, both snapshot watchers, the dial bridge, the
    /// workload watcher, and any registered extra tasks. The first fatal
    /// failure cancels the scope and is returned once every task has
    /// unwound; deliberate cancellation is an ordinary `Ok` exit.
    #[instrument(skip(self), fields(session = %self.info.session_id))]
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        let session = self.clone();
        tasks.spawn(async move { session.heartbeat_loop().await });
        let session = self.clone();
        tasks.spawn(async move { session.agent_watch_loop().await });
        let session = self.clone();
        tasks.spawn(async move { session.intercept_watch_loop().await });
        let session = self.clone();
        tasks.spawn(async move { session.dial_bridge().await });
        let watcher = self.watcher.clone();
        let cancel = self.cancel.clone();
        tasks.spawn(async move {
            watcher.run(cancel).await;
            Ok(())
        });
        for (name, task) in self.extra_tasks.lock().await.drain(..) {
            tasks.spawn(async move {
                let result = task.await;
                if let Err(e) = &result {
                    error!(task = %name, error = %e, "Registered session task failed");
                }
                result
            });
        }

        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        error!(error = %e, "Session task failed, shutting down");
                        first_err = Some(e);
                    }
                    self.cancel.cancel();
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(Error::internal(format!("session task panicked: {e}")));
                    }
                    self.cancel.cancel();
                }
            }
        }

        info!(session = %self.info.session_id, "Session stopped");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// One immediate keep-alive carrying a caller-supplied fresh token
    ///
    /// Lets a user stay logged in without a full reconnect; independent of
    /// the heartbeat cadence.
    pub async fn remain_with_token(&self, token: String) -> Result<()> {
        self.broker.remain(self.info.clone(), token).await
    }

    /// Current status snapshot for the CLI
    pub async fn status(&self) -> SessionStatus {
        SessionStatus {
            context: self.cluster.context.clone(),
            server: self.cluster.server.clone(),
            cluster_id: self.cluster.cluster_id.clone(),
            session_id: self.info.session_id.clone(),
            uptime_seconds: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            agents: self.agents.current().await,
            intercepts: self.intercepts.current().await,
        }
    }

    /// Compare a new connect request against the live session
    ///
    /// `cluster` is the identity the new request resolved to; comparing the
    /// resolved server catches a kubeconfig edit that repoints the same
    /// context name elsewhere. Changed connection parameters require a
    /// restart; a changed mapped namespace set is applied in place; an
    /// identical request reports the session as already connected.
    pub async fn update_status(
        &self,
        request: &ConnectRequest,
        cluster: &ClusterIdentity,
    ) -> std::result::Result<SessionStatus, ConnectError> {
        if cluster.context != self.cluster.context || cluster.server != self.cluster.server {
            return Err(ConnectError::MustRestart);
        }
        if request.broker_address != self.broker_address {
            return Err(ConnectError::MustRestart);
        }

        let requested = normalize_namespaces(&request.cluster.mapped_namespaces);
        let changed = {
            let mut current = self.mapped_namespaces.write().await;
            if *current == requested {
                false
            } else {
                *current = requested.clone();
                true
            }
        };
        if !changed {
            return Err(ConnectError::AlreadyConnected {
                context: self.cluster.context.clone(),
            });
        }

        info!(namespaces = ?requested, "Mapped namespaces changed");
        self.watcher.set_namespaces_to_watch(&requested).await;
        self.reconcile_namespaces().await;
        Ok(self.status().await)
    }

    /// List workloads with their agent and intercept records
    ///
    /// `namespace` scopes the listing (`None` = all mapped); the intercept
    /// filter instead scopes to the currently-intercepted namespaces.
    /// Local-only intercepts appear as active entries and never involve the
    /// broker.
    pub async fn list_workloads(
        &self,
        filter: WorkloadFilter,
        namespace: Option<&str>,
    ) -> Vec<WorkloadInfo> {
        self.watcher.wait_for_sync().await;
        let entries = self.watcher.snapshot().await;
        let agents = self.agents.current().await;
        let intercepts = self.intercepts.current().await;
        let local = self.local_intercepts.lock().await.clone();

        let scope: Option<Vec<String>> = match filter {
            WorkloadFilter::Intercepts => {
                let mut namespaces: Vec<String> = intercepts
                    .iter()
                    .filter_map(|i| i.spec.as_ref().map(|s| s.namespace.clone()))
                    .collect();
                namespaces.extend(local.values().cloned());
                namespaces.sort();
                namespaces.dedup();
                Some(namespaces)
            }
            _ => namespace.map(|ns| vec![ns.to_string()]),
        };

        let mut infos = Vec::new();
        for entry in entries {
            if let Some(scope) = &scope {
                if !scope.contains(&entry.namespace) {
                    continue;
                }
            }
            let agent = agents
                .iter()
                .find(|a| a.name == entry.name && a.namespace == entry.namespace)
                .cloned();
            let intercept = intercepts
                .iter()
                .find(|i| {
                    i.spec
                        .as_ref()
                        .is_some_and(|s| s.workload == entry.name && s.namespace == entry.namespace)
                })
                .cloned();
            let info = WorkloadInfo {
                workload: entry,
                agent,
                intercept,
            };
            if filter.admits(&info) {
                infos.push(info);
            }
        }

        if filter != WorkloadFilter::InstalledAgents {
            for (name, ns) in &local {
                if let Some(scope) = &scope {
                    if !scope.contains(ns) {
                        continue;
                    }
                }
                infos.push(WorkloadInfo {
                    workload: WorkloadEntry {
                        name: name.clone(),
                        namespace: ns.clone(),
                        kind: WorkloadKind::Deployment,
                        uid: String::new(),
                        service_name: String::new(),
                        service_uid: String::new(),
                        ports: Vec::new(),
                    },
                    agent: None,
                    intercept: Some(intercept::local_intercept_info(
                        name,
                        ns,
                        &self.identity.name,
                    )),
                });
            }
        }

        infos
    }

    /// Remove agents and, for the widest scope, the broker itself
    ///
    /// Agent scopes resolve one representative record per (name, namespace)
    /// pair through the cache and confirm each disappearance from a later
    /// snapshot, bounded per agent. `Everything` additionally removes the
    /// broker's objects and ends the session.
    #[instrument(skip(self))]
    pub async fn uninstall(&self, scope: UninstallScope) -> Result<()> {
        let representatives = self.agents.representative().await;
        let targets: Vec<AgentInfo> = match &scope {
            UninstallScope::NamedAgents(names) => representatives
                .into_iter()
                .filter(|a| names.contains(&a.name))
                .collect(),
            _ => representatives,
        };
        let pairs: Vec<(String, String)> = targets
            .iter()
            .map(|a| (a.name.clone(), a.namespace.clone()))
            .collect();

        if matches!(scope, UninstallScope::Everything) {
            self.installer.remove_broker_and_agents(true, &pairs).await?;
            info!("Broker and agents removed, ending session");
            self.cancel.cancel();
            return Ok(());
        }

        self.installer.remove_agents(&pairs).await?;
        for agent in &targets {
            let rx = self.agents.wait_vanish(&agent.key()).await;
            match tokio::time::timeout(AGENT_VANISH_TIMEOUT, rx).await {
                Ok(_) => debug!(agent = %agent.name, namespace = %agent.namespace, "Agent gone"),
                Err(_) => {
                    warn!(agent = %agent.name, namespace = %agent.namespace,
                        "Agent still reported after uninstall")
                }
            }
        }
        Ok(())
    }

    /// Fires on a fixed interval for the life of the session
    ///
    /// Each tick sends a keep-alive, opportunistically carrying a fresh
    /// token. Send and token failures are transient. On exit the loop
    /// performs the ordered teardown: clear this client's intercepts, then
    /// a bounded best-effort depart.
    async fn heartbeat_loop(&self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let api_key = self.fresh_token("remain").await;
                    if let Err(e) = self.broker.remain(self.info.clone(), api_key).await {
                        warn!(error = %e, "Heartbeat failed");
                    }
                }
            }
        }

        match tokio::time::timeout(TEARDOWN_TIMEOUT, self.clear_intercepts()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Intercept cleanup failed during teardown"),
            Err(_) => warn!("Intercept cleanup timed out during teardown"),
        }
        match tokio::time::timeout(TEARDOWN_TIMEOUT, self.broker.depart(self.info.clone())).await {
            Ok(Ok(())) => info!(session = %self.info.session_id, "Departed"),
            Ok(Err(e)) => warn!(error = %e, "Depart failed"),
            Err(_) => warn!("Depart timed out"),
        }
        Ok(())
    }

    async fn fresh_token(&self, purpose: &str) -> String {
        match &self.token_source {
            Some(source) => match source.token(purpose).await {
                Ok(token) => token,
                Err(e) => {
                    debug!(error = %e, "Token fetch failed, continuing without");
                    String::new()
                }
            },
            None => String::new(),
        }
    }

    async fn agent_watch_loop(&self) -> Result<()> {
        let mut stream = self.broker.watch_agents(self.info.clone()).await?;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                item = stream.next() => match item {
                    None => {
                        debug!("Agent stream ended");
                        return Ok(());
                    }
                    Some(Err(status)) => return Err(Error::Rpc(status)),
                    Some(Ok(snapshot)) => self.agents.replace(snapshot.agents).await,
                }
            }
        }
    }

    async fn intercept_watch_loop(&self) -> Result<()> {
        let mut stream = self.broker.watch_intercepts(self.info.clone()).await?;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                item = stream.next() => match item {
                    None => {
                        debug!("Intercept stream ended");
                        return Ok(());
                    }
                    Some(Err(status)) => return Err(Error::Rpc(status)),
                    Some(Ok(snapshot)) => {
                        self.intercepts.replace(snapshot.intercepts).await;
                        self.reconcile_namespaces().await;
                    }
                }
            }
        }
    }

    async fn dial_bridge(&self) -> Result<()> {
        let stream = self.broker.watch_dial(self.info.clone()).await?;
        dial_loop(stream, self.dialer.clone(), self.cancel.clone()).await
    }

    /// Push the intercepted-namespace set to the net daemon
    ///
    /// The pushed value is always recomputed from current authoritative
    /// state: the sorted, deduplicated union of remotely- and
    /// locally-intercepted namespaces, plus the mapped namespaces as search
    /// paths. Failures are logged, never retried; the next contributing
    /// change pushes a superseding value.
    pub(crate) async fn reconcile_namespaces(&self) {
        let mut namespaces: Vec<String> = self
            .intercepts
            .current()
            .await
            .iter()
            .filter_map(|i| i.spec.as_ref().map(|s| s.namespace.clone()))
            .collect();
        namespaces.extend(self.local_intercepts.lock().await.values().cloned());
        namespaces.sort();
        namespaces.dedup();

        let paths = self.mapped_namespaces.read().await.clone();

        {
            let mut last = self.last_dns_push.lock().await;
            if last.as_ref() == Some(&(paths.clone(), namespaces.clone())) {
                return;
            }
            *last = Some((paths.clone(), namespaces.clone()));
        }

        debug!(namespaces = ?namespaces, "Pushing DNS search paths");
        if let Err(e) = self.netd.set_dns_search_path(paths, namespaces).await {
            warn!(error = %e, "DNS search path push failed");
        }
    }
}

/// Hand the net daemon the session's outbound routing info
///
/// A daemon that survived a crash of a previous connector process may still
/// be bound to that prior session; in that case exactly one disconnect and
/// retry cycle is issued. A second mismatch means the daemon is wedged and
/// the attempt fails with an internal error rather than looping.
async fn reconcile_net_daemon(
    netd: &dyn NetDaemon,
    info: &SessionInfo,
    request: &ConnectRequest,
) -> std::result::Result<(), ConnectError> {
    let config = outbound_config(
        info.clone(),
        &request.broker_address,
        &request.cluster.also_proxy_subnets,
    );

    let status = netd
        .connect(config.clone())
        .await
        .map_err(ConnectError::netd)?;
    let bound = status
        .session
        .as_ref()
        .map(|s| s.session_id.clone())
        .unwrap_or_default();
    if bound.is_empty() || bound == info.session_id {
        return Ok(());
    }

    warn!(bound = %bound, ours = %info.session_id,
        "Net daemon bound to a prior session, reconnecting once");
    netd.disconnect().await.map_err(ConnectError::netd)?;
    let status = netd.connect(config).await.map_err(ConnectError::netd)?;
    let bound = status
        .session
        .as_ref()
        .map(|s| s.session_id.clone())
        .unwrap_or_default();
    if bound.is_empty() || bound == info.session_id {
        return Ok(());
    }

    Err(ConnectError::Internal(format!(
        "net daemon still bound to session {bound} after reconnect, expected {}",
        info.session_id
    )))
}
