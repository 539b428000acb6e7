//! Error types for the Gangway connector

use thiserror::Error;

/// Main error type for connector operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// gRPC transport error (channel could not be established or broke)
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// gRPC call failed with a status
    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    /// I/O error from a local socket or file
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The caller asked for something invalid; the message is shown verbatim
    #[error("{0}")]
    User(String),

    /// The cluster rejected or failed an operation
    #[error("cluster error: {0}")]
    Cluster(String),

    /// An invariant of the session or handshake was violated
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse error categories driving propagation policy
///
/// Background tasks swallow [`ErrorCategory::Transient`] failures with a log
/// line and cancel the session scope on anything else; the CLI renders each
/// category differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad request shape, port conflicts, ambiguous selections
    User,
    /// Unreachable API server, failed installs
    Cluster,
    /// Invariant violations; fatal for the current attempt
    Internal,
    /// Self-healing on the next cycle; logged, never propagated
    Transient,
}

impl Error {
    /// Create a user error with the given message
    pub fn user(msg: impl Into<String>) -> Self {
        Self::User(msg.into())
    }

    /// Create a cluster error with the given message
    pub fn cluster(msg: impl Into<String>) -> Self {
        Self::Cluster(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error means the target object does not exist
    ///
    /// Removal paths treat not-found as success.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            Error::Rpc(status) => status.code() == tonic::Code::NotFound,
            _ => false,
        }
    }

    /// The category this error falls into
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::User(_) => ErrorCategory::User,
            Error::Kube(_) | Error::Cluster(_) => ErrorCategory::Cluster,
            Error::Internal(_) => ErrorCategory::Internal,
            Error::Transport(_) | Error::Rpc(_) | Error::Io(_) => ErrorCategory::Transient,
        }
    }
}

/// Why session establishment failed
///
/// A closed set: the daemon's callers match on these to decide what to do
/// next without parsing message text.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The cluster API server could not be reached or refused us
    #[error("cluster unreachable: {0}")]
    ClusterUnreachable(#[source] Box<Error>),

    /// The broker could not be installed, reached, or arrived at
    #[error("broker failed: {0}")]
    BrokerFailed(#[source] Box<Error>),

    /// The local network daemon refused or failed the outbound handshake
    #[error("network daemon failed: {0}")]
    NetDaemonFailed(#[source] Box<Error>),

    /// Connection parameters changed; the daemon must restart to apply them
    #[error("connection parameters changed; restart the daemon to apply them")]
    MustRestart,

    /// A live session with the same parameters already exists
    #[error("already connected to context {context}")]
    AlreadyConnected {
        /// Kube context of the live session
        context: String,
    },

    /// A session invariant was violated; not retried
    #[error("internal error: {0}")]
    Internal(String),
}

impl ConnectError {
    /// Wrap an error as a cluster-unreachable result
    pub fn cluster(err: Error) -> Self {
        Self::ClusterUnreachable(Box::new(err))
    }

    /// Wrap an error as a broker failure result
    pub fn broker(err: Error) -> Self {
        Self::BrokerFailed(Box::new(err))
    }

    /// Wrap an error as a net daemon failure result
    pub fn netd(err: Error) -> Self {
        Self::NetDaemonFailed(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Propagation Through the Session Layer
    // ==========================================================================
    //
    // These tests demonstrate how errors flow through the connector during
    // session establishment and steady-state operation. Each category carries
    // a different propagation policy.

    /// Story: user errors are surfaced verbatim
    ///
    /// When an intercept request conflicts with an existing one, the caller
    /// sees exactly the conflict, with no category prefix in front of it.
    #[test]
    fn story_user_errors_surface_verbatim() {
        // Scenario: second intercept claims an already-used local port
        let err = Error::user("local port 8080 is already in use by intercept 'api'");
        assert_eq!(
            err.to_string(),
            "local port 8080 is already in use by intercept 'api'"
        );
        assert_eq!(err.category(), ErrorCategory::User);

        // Scenario: a workload is selected by several services
        let err = Error::user("workload echo is selected by multiple services: a, b");
        assert!(err.to_string().contains("multiple services"));

        match Error::user("any message") {
            Error::User(msg) => assert_eq!(msg, "any message"),
            _ => panic!("Expected User variant"),
        }
    }

    /// Story: cluster errors carry a typed category for the CLI
    ///
    /// When the API server is unreachable or an install fails, the CLI needs
    /// to know it is looking at a cluster problem without parsing text.
    #[test]
    fn story_cluster_errors_categorized_for_rendering() {
        let err = Error::cluster("broker deployment never became ready");
        assert!(err.to_string().contains("cluster error"));
        assert_eq!(err.category(), ErrorCategory::Cluster);

        // Kubernetes API failures land in the same category
        let kube_err = Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "deployments.apps \"gangway-broker\" is forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        }));
        assert_eq!(kube_err.category(), ErrorCategory::Cluster);
    }

    /// Story: invariant violations are fatal for the attempt
    ///
    /// A net daemon that still reports a foreign session after the one
    /// permitted retry is an internal error; establishment stops there.
    #[test]
    fn story_internal_errors_stop_the_attempt() {
        let err = Error::internal("net daemon bound to session s0 after reconnect, expected s1");
        assert!(err.to_string().contains("internal error"));
        assert_eq!(err.category(), ErrorCategory::Internal);
    }

    /// Story: transient errors are swallowed by background tasks
    ///
    /// A single failed heartbeat or namespace push self-heals on the next
    /// cycle; the category tells the task loop to log and continue.
    #[test]
    fn story_transient_errors_logged_not_propagated() {
        let err = Error::Rpc(tonic::Status::unavailable("broker restarting"));
        assert_eq!(err.category(), ErrorCategory::Transient);

        let err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "relay peer closed",
        ));
        assert_eq!(err.category(), ErrorCategory::Transient);
    }

    /// Story: connect failures form a closed set
    ///
    /// The daemon's callers decide what to do next by matching the variant,
    /// never by inspecting message text.
    #[test]
    fn story_connect_errors_are_a_closed_set() {
        let err = ConnectError::cluster(Error::cluster("no such context: minikube"));
        assert!(matches!(err, ConnectError::ClusterUnreachable(_)));
        assert!(err.to_string().contains("cluster unreachable"));

        let err = ConnectError::broker(Error::cluster("install timed out"));
        assert!(matches!(err, ConnectError::BrokerFailed(_)));

        let err = ConnectError::netd(Error::Rpc(tonic::Status::unavailable("daemon down")));
        assert!(err.to_string().contains("network daemon failed"));

        let err = ConnectError::AlreadyConnected {
            context: "prod-us-west".to_string(),
        };
        assert!(err.to_string().contains("prod-us-west"));

        assert!(ConnectError::MustRestart.to_string().contains("restart"));
    }

    /// Story: removal paths treat not-found as success
    #[test]
    fn story_not_found_is_success_for_removal() {
        let err = Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "deployments.apps \"gangway-broker\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        }));
        assert!(err.is_not_found());

        let err = Error::Rpc(tonic::Status::not_found("no such intercept"));
        assert!(err.is_not_found());

        assert!(!Error::user("port conflict").is_not_found());
        assert!(!Error::Rpc(tonic::Status::unavailable("down")).is_not_found());
    }

    /// Story: error helper functions accept both String and &str
    #[test]
    fn story_error_construction_ergonomics() {
        let dynamic_msg = format!("intercept {} not found", "echo");
        let err = Error::user(dynamic_msg);
        assert!(err.to_string().contains("echo"));

        let err = Error::cluster("static message");
        assert!(err.to_string().contains("static message"));

        let name = "gangway-broker";
        let err = Error::internal(format!("lost track of deployment {}", name));
        assert!(err.to_string().contains("gangway-broker"));
    }
}
