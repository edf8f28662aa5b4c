//! Incremental graph view of the cluster.
//!
//! Nodes are live peers, edges are connections between them. The
//! [`GraphModel`] turns raw node and link events into minimal
//! [`StateChanged`] diffs; [`ModelTask`] drives it from the bus on a
//! single task so the node and edge sets are never mutated concurrently.

pub mod diff;
pub mod model;

pub use diff::{Diff, Edge, Graph, Link, Node, StateChanged};
pub use model::{GraphModel, ModelHandle, ModelTask};
