//! Cluster connection handle
//!
//! A [`Cluster`] wraps the kube client together with the identity of the
//! connection: context name, API server URL, and the cluster id. It is
//! resolved once from user flags at establish time; the mutable per-session
//! state (mapped namespaces, caches) lives on the session that owns it.

use k8s_openapi::api::core::v1::Namespace;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use tracing::{info, warn};

use crate::{Error, Result};

/// How to reach and scope a cluster, resolved from user flags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Kubeconfig context to use; `None` picks the current context
    pub context: Option<String>,
    /// Namespaces mapped into the workstation's network; empty means all
    pub mapped_namespaces: Vec<String>,
    /// Extra CIDRs the net daemon should route into the cluster
    pub also_proxy_subnets: Vec<String>,
}

/// A live connection to one cluster
pub struct Cluster {
    client: Client,
    context: String,
    server: String,
}

impl Cluster {
    /// Connect to the cluster named by `config`
    ///
    /// Loads the kubeconfig, resolves the context, and builds the API
    /// client. Fails with a cluster error when the kubeconfig is missing or
    /// the context is unknown; actual reachability is only probed by later
    /// calls.
    pub async fn connect(config: &ClusterConfig) -> Result<Self> {
        let options = KubeConfigOptions {
            context: config.context.clone(),
            ..Default::default()
        };
        let kube_config = Config::from_kubeconfig(&options)
            .await
            .map_err(|e| Error::cluster(format!("failed to load kubeconfig: {e}")))?;

        let context = match &config.context {
            Some(name) => name.clone(),
            None => Kubeconfig::read()
                .ok()
                .and_then(|k| k.current_context)
                .unwrap_or_default(),
        };
        let server = kube_config.cluster_url.to_string();
        let client = Client::try_from(kube_config)?;

        info!(context = %context, server = %server, "Connected to cluster");

        Ok(Self {
            client,
            context,
            server,
        })
    }

    /// The kube API client
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Name of the kubeconfig context this connection uses
    pub fn context(&self) -> &str {
        &self.context
    }

    /// URL of the API server this connection talks to
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Stable cluster identity: the UID of the `default` namespace
    ///
    /// Best effort; clusters that refuse the read get an empty id.
    pub async fn cluster_id(&self) -> String {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.get("default").await {
            Ok(ns) => ns.metadata.uid.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Could not read default namespace for cluster id");
                String::new()
            }
        }
    }
}

/// Sort and deduplicate a namespace list; `all` collapses to the empty set
///
/// The empty set means "map everything", so listing `all` alongside other
/// namespaces is the same as mapping everything.
pub fn normalize_namespaces(namespaces: &[String]) -> Vec<String> {
    if namespaces.iter().any(|ns| ns == "all") {
        return Vec::new();
    }
    let mut normalized: Vec<String> = namespaces.to_vec();
    normalized.sort();
    normalized.dedup();
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_sorts_and_dedups() {
        let input = vec![
            "staging".to_string(),
            "default".to_string(),
            "staging".to_string(),
        ];
        assert_eq!(normalize_namespaces(&input), vec!["default", "staging"]);
    }

    #[test]
    fn test_normalize_all_collapses_to_empty() {
        let input = vec!["default".to_string(), "all".to_string()];
        assert!(normalize_namespaces(&input).is_empty());
    }

    #[test]
    fn test_normalize_identical_sets_regardless_of_order() {
        let a = vec!["b".to_string(), "a".to_string(), "c".to_string()];
        let b = vec!["c".to_string(), "a".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(normalize_namespaces(&a), normalize_namespaces(&b));
    }
}
