//! sim-core: In-process simulator for peer-to-peer clusters.
//!
//! This crate provides the core functionality for:
//! - Spawning and killing simulated hosts on a shared in-memory network
//! - Translating per-host connectivity into cluster-wide link events
//! - Maintaining an incremental graph view and streaming minimal diffs
//! - Bootstrap topologies and Network/Host/Overlay trait abstractions

pub mod bus;
pub mod cluster;
pub mod config;
pub mod events;
pub mod graph;
pub mod inproc;
pub mod member;
pub mod network;
pub mod peer_id;
pub mod topology;

pub use bus::{ClusterEvent, LinkChanged, LinkEvent, MembershipBus, NodeChanged, NodeEvent};
pub use cluster::{Cluster, ClusterError};
pub use config::{ClusterConfig, ConfigError};
pub use events::{BusError, Subscription, Topic};
pub use graph::{Diff, Edge, Graph, GraphModel, Link, Node, StateChanged};
pub use inproc::{InProcHost, InProcNetwork, InProcOverlay};
pub use member::{Member, ReleaseError, ShutdownError};
pub use network::{Connectivity, Host, Network, NetworkError, Overlay};
pub use peer_id::{PeerId, PeerIdError};
pub use topology::{Line, Random, Ring, Topology};
