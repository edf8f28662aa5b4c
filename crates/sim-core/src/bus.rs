//! Cluster-wide event bus.
//!
//! Carries three kinds of event:
//! - [`NodeChanged`]: a member was spawned or died (emitted by the cluster)
//! - [`LinkChanged`]: a connection was created or severed (emitted by members)
//! - [`StateChanged`]: the derived graph diff (emitted by the graph model)
//!
//! Node and link events share one topic as [`ClusterEvent`] so the graph
//! model sees them in a single arrival order. Diffs have their own topic,
//! which is the only one observers outside the cluster can reach.

use crate::PeerId;
use crate::events::{BusError, Subscription, Topic};
use crate::graph::{Edge, StateChanged};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    Spawned,
    Died,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeChanged {
    pub event: NodeEvent,
    pub peer: PeerId,
}

impl NodeChanged {
    pub fn spawned(peer: PeerId) -> Self {
        Self {
            event: NodeEvent::Spawned,
            peer,
        }
    }

    pub fn died(peer: PeerId) -> Self {
        Self {
            event: NodeEvent::Died,
            peer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Created,
    Severed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkChanged {
    pub event: LinkEvent,
    pub edge: Edge,
}

impl LinkChanged {
    pub fn created(x: PeerId, y: PeerId) -> Self {
        Self {
            event: LinkEvent::Created,
            edge: Edge::new(x, y),
        }
    }

    pub fn severed(x: PeerId, y: PeerId) -> Self {
        Self {
            event: LinkEvent::Severed,
            edge: Edge::new(x, y),
        }
    }
}

/// Raw membership events consumed by the graph model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterEvent {
    Node(NodeChanged),
    Link(LinkChanged),
}

impl From<NodeChanged> for ClusterEvent {
    fn from(ev: NodeChanged) -> Self {
        ClusterEvent::Node(ev)
    }
}

impl From<LinkChanged> for ClusterEvent {
    fn from(ev: LinkChanged) -> Self {
        ClusterEvent::Link(ev)
    }
}

/// Shared by the cluster, its members and the graph model.
pub struct MembershipBus {
    events: Topic<ClusterEvent>,
    state: Topic<StateChanged>,
}

impl MembershipBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Topic::new(capacity),
            state: Topic::new(capacity),
        }
    }

    pub async fn emit_node(&self, ev: NodeChanged) -> Result<(), BusError> {
        self.events.emit(ev.into()).await
    }

    pub async fn emit_link(&self, ev: LinkChanged) -> Result<(), BusError> {
        self.events.emit(ev.into()).await
    }

    pub async fn emit_state(&self, ev: StateChanged) -> Result<(), BusError> {
        self.state.emit(ev).await
    }

    pub fn subscribe_events(&self) -> Result<Subscription<ClusterEvent>, BusError> {
        self.events.subscribe()
    }

    pub fn subscribe_state(&self) -> Result<Subscription<StateChanged>, BusError> {
        self.state.subscribe()
    }

    /// Stop accepting node and link events. The graph model drains what
    /// it already received and then closes the state topic.
    pub fn close_events(&self) -> bool {
        self.events.close()
    }

    pub fn close_state(&self) -> bool {
        self.state.close()
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}
