//! Client for the local network daemon
//!
//! The net daemon is a separate privileged process owning DNS and packet
//! routing. The session talks to it through the [`NetDaemon`] trait so the
//! handshake and reconcile logic can be exercised against a mock; the real
//! implementation is a thin gRPC wrapper.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tonic::transport::{Channel, Endpoint};

use crate::proto::netd::net_daemon_client::NetDaemonClient;
use crate::proto::netd::{DisconnectRequest, DnsSearchPaths, NetStatus, OutboundConfig, StatusRequest};
use crate::Result;

/// How long to wait for the daemon's localhost socket before giving up
const NETD_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Operations the session needs from the local network daemon
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NetDaemon: Send + Sync {
    /// Report the daemon's current binding, including the session it serves
    async fn status(&self) -> Result<NetStatus>;

    /// Bind the daemon to a session's outbound routing config
    ///
    /// The returned status carries the session the daemon is bound to after
    /// the call; callers compare it against their own session id.
    async fn connect(&self, config: OutboundConfig) -> Result<NetStatus>;

    /// Release the daemon's current binding
    async fn disconnect(&self) -> Result<()>;

    /// Push DNS search paths and intercepted-namespace visibility
    async fn set_dns_search_path(&self, paths: Vec<String>, namespaces: Vec<String>)
        -> Result<()>;
}

/// Everything the daemon needs to route one session's outbound traffic
pub fn outbound_config(
    session: crate::proto::broker::SessionInfo,
    broker_address: &str,
    also_proxy_subnets: &[String],
) -> OutboundConfig {
    OutboundConfig {
        session: Some(session),
        broker_address: broker_address.to_string(),
        also_proxy_subnets: also_proxy_subnets.to_vec(),
    }
}

/// gRPC-backed [`NetDaemon`] talking to the daemon on localhost
pub struct GrpcNetDaemon {
    client: NetDaemonClient<Channel>,
}

impl GrpcNetDaemon {
    /// Dial the daemon's localhost port
    pub async fn connect_to(port: u16) -> Result<Self> {
        let channel = Endpoint::from_shared(format!("http://127.0.0.1:{port}"))?
            .connect_timeout(NETD_CONNECT_TIMEOUT)
            .connect()
            .await?;
        Ok(Self {
            client: NetDaemonClient::new(channel),
        })
    }
}

#[async_trait]
impl NetDaemon for GrpcNetDaemon {
    async fn status(&self) -> Result<NetStatus> {
        let response = self.client.clone().status(StatusRequest {}).await?;
        Ok(response.into_inner())
    }

    async fn connect(&self, config: OutboundConfig) -> Result<NetStatus> {
        let response = self.client.clone().connect(config).await?;
        Ok(response.into_inner())
    }

    async fn disconnect(&self) -> Result<()> {
        self.client.clone().disconnect(DisconnectRequest {}).await?;
        Ok(())
    }

    async fn set_dns_search_path(
        &self,
        paths: Vec<String>,
        namespaces: Vec<String>,
    ) -> Result<()> {
        self.client
            .clone()
            .set_dns_search_path(DnsSearchPaths { paths, namespaces })
            .await?;
        Ok(())
    }
}
