//! gRPC protocol definitions for the connector's two peers
//!
//! This module contains the generated Protobuf and gRPC code for the broker
//! protocol (connector ↔ in-cluster broker) and the net daemon protocol
//! (connector ↔ local privileged network process).
//!
//! # Protocol Overview
//!
//! The connector opens one long-lived channel to the broker and arrives as a
//! client, after which all broker calls share the resulting session:
//!
//! - Unary lifecycle calls: `ArriveAsClient`, `Remain`, `Depart`
//! - Server streams: `WatchAgents`, `WatchIntercepts`, `WatchDial`
//! - A bidirectional `Tunnel` stream per dialed connection
//!
//! The net daemon protocol is unary only: `Connect` hands the daemon the
//! outbound routing config for a session, `SetDnsSearchPath` updates DNS
//! visibility, `Disconnect` releases the binding.
//!
//! # Example
//!
//! ```ignore
//! use gangway::proto::broker::broker_client::BrokerClient;
//!
//! let mut client = BrokerClient::connect("http://gangway-broker.gangway-system:8081").await?;
//! let session = client.arrive_as_client(identity).await?.into_inner();
//!
//! let mut dials = client.watch_dial(session.clone()).await?.into_inner();
//! while let Some(request) = dials.message().await? {
//!     handle_dial(request);
//! }
//! ```

#![allow(missing_docs)] // Generated code doesn't have docs
#![allow(clippy::doc_overindented_list_items)] // Generated proto docs have formatting issues

/// Generated protobuf and gRPC code, nested to match the proto packages
pub mod gangway {
    /// Broker protocol
    pub mod broker {
        /// Version 1 of the broker protocol
        pub mod v1 {
            tonic::include_proto!("gangway.broker.v1");
        }
    }

    /// Net daemon protocol
    pub mod netd {
        /// Version 1 of the net daemon protocol
        pub mod v1 {
            tonic::include_proto!("gangway.netd.v1");
        }
    }
}

// Short aliases so call sites read proto::broker::SessionInfo rather than the
// full package path.
pub use gangway::broker::v1 as broker;
pub use gangway::netd::v1 as netd;
