//! Gangway - connector that joins a workstation to a cluster's network
//!
//! Gangway routes the workstation's outbound traffic into a Kubernetes
//! cluster and reroutes traffic destined for chosen workloads back to local
//! processes ("intercepts"). This crate is the client-side control process:
//! it owns the session with the in-cluster broker and coordinates the local
//! privileged network daemon.
//!
//! # Architecture
//!
//! Three processes cooperate:
//! - The **connector** (this crate) establishes a session with the broker,
//!   keeps snapshot caches of intercepts and agents, and bridges
//!   broker-originated dial requests to local connections.
//! - The **broker** runs in the cluster (`gangway-broker` in
//!   `gangway-system`) and owns sessions, intercepts, and dial routing; the
//!   connector installs and upgrades it.
//! - The **net daemon** is a separate privileged local process that owns DNS
//!   and packet routing; the connector hands it outbound routing info and
//!   namespace search paths over gRPC.
//!
//! # Modules
//!
//! - [`session`] - Session lifecycle: establish, heartbeat, teardown, and the
//!   background tasks that serve a live session
//! - [`workloads`] - Periodically-refreshed join of Services and the
//!   workloads they select
//! - [`install`] - Idempotent broker install/upgrade/remove
//! - [`cluster`] - Cluster connection handle and namespace mapping
//! - [`netd`] - Client for the local network daemon
//! - [`proto`] - gRPC protocol definitions for both peers
//! - [`retry`] - Exponential backoff helper
//! - [`error`] - Error types and categories

#![deny(missing_docs)]

use std::time::Duration;

pub mod cluster;
pub mod error;
pub mod install;
pub mod netd;
pub mod proto;
pub mod retry;
pub mod session;
pub mod workloads;

pub use error::{ConnectError, Error, ErrorCategory};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// These constants define the well-known names and timings shared by the
// connector, the installer, and test fixtures.

/// Namespace the broker is installed into
pub const BROKER_NAMESPACE: &str = "gangway-system";

/// Name of the broker Deployment
pub const BROKER_DEPLOYMENT: &str = "gangway-broker";

/// Name of the broker Service
pub const BROKER_SERVICE: &str = "gangway-broker";

/// Port the broker's gRPC API listens on
pub const BROKER_PORT: u16 = 8081;

/// Default localhost port of the net daemon's gRPC API
pub const DEFAULT_NETD_PORT: u16 = 15731;

/// Workload annotation that enables agent injection
///
/// Set to `"enabled"` by intercept setup; removing it is how an agent's
/// in-cluster footprint is uninstalled.
pub const AGENT_ANNOTATION: &str = "gangway.io/agent";

/// Field manager for server-side apply, also the `managed-by` label value
pub const FIELD_MANAGER: &str = "gangway-connector";

/// Interval between session keep-alive heartbeats
pub const SESSION_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Bound on best-effort teardown work (clearing intercepts, departing)
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Product name reported to the broker at arrival
pub const PRODUCT_NAME: &str = "gangway";

/// Crate version, reported to the broker and used as the broker image tag
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
