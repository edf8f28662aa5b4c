//! The diff engine.
//!
//! [`GraphModel`] holds the canonical node and edge sets and reports the
//! minimal [`StateChanged`] for each event, or nothing if the event did not
//! change the graph. [`ModelTask`] runs one model on its own task, fed by the
//! bus's event topic and publishing on its state topic.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, trace, warn};

use super::{Diff, Edge, Graph, Node, StateChanged};
use crate::PeerId;
use crate::bus::{ClusterEvent, LinkEvent, MembershipBus, NodeEvent};
use crate::events::{BusError, Subscription};

/// Queries are rare; a small buffer is enough.
const QUERY_CAPACITY: usize = 16;

/// Canonical node and edge sets.
///
/// Invariant: every edge joins two peers in the node set. Edges are also
/// indexed by endpoint so a node's death removes its edges without scanning
/// the whole edge set.
#[derive(Debug, Default)]
pub struct GraphModel {
    nodes: BTreeSet<PeerId>,
    edges: BTreeSet<Edge>,
    incident: HashMap<PeerId, BTreeSet<Edge>>,
}

impl GraphModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event, returning the diff it caused (if any).
    pub fn apply(&mut self, event: &ClusterEvent) -> Option<StateChanged> {
        match *event {
            ClusterEvent::Node(ev) => match ev.event {
                NodeEvent::Spawned => self.on_spawned(ev.peer),
                NodeEvent::Died => self.on_died(ev.peer),
            },
            ClusterEvent::Link(ev) => match ev.event {
                LinkEvent::Created => self.on_created(ev.edge),
                LinkEvent::Severed => self.on_severed(ev.edge),
            },
        }
    }

    fn on_spawned(&mut self, peer: PeerId) -> Option<StateChanged> {
        self.nodes
            .insert(peer)
            .then(|| StateChanged::added(Diff::node(peer)))
    }

    /// Remove a node and, in the same message, every edge touching it.
    fn on_died(&mut self, peer: PeerId) -> Option<StateChanged> {
        if !self.nodes.remove(&peer) {
            return None;
        }

        let cascade = self.incident.remove(&peer).unwrap_or_default();
        for edge in &cascade {
            self.edges.remove(edge);
            if let Some(other) = edge.other(peer) {
                self.unindex(other, edge);
            }
        }

        Some(StateChanged::removed(Diff {
            nodes: vec![Node { id: peer }],
            links: cascade.iter().map(Edge::to_link).collect(),
        }))
    }

    fn on_created(&mut self, edge: Edge) -> Option<StateChanged> {
        let (a, b) = edge.endpoints();
        if edge.is_loop() {
            debug!("Ignoring self-link on {}", a);
            return None;
        }
        if !self.nodes.contains(&a) || !self.nodes.contains(&b) {
            debug!("Ignoring link {} <-> {}: endpoint not in graph", a, b);
            return None;
        }
        if !self.edges.insert(edge) {
            return None;
        }

        self.incident.entry(a).or_default().insert(edge);
        self.incident.entry(b).or_default().insert(edge);
        Some(StateChanged::added(Diff::link(edge)))
    }

    fn on_severed(&mut self, edge: Edge) -> Option<StateChanged> {
        if !self.edges.remove(&edge) {
            return None;
        }

        let (a, b) = edge.endpoints();
        self.unindex(a, &edge);
        self.unindex(b, &edge);
        Some(StateChanged::removed(Diff::link(edge)))
    }

    fn unindex(&mut self, peer: PeerId, edge: &Edge) {
        if let Some(edges) = self.incident.get_mut(&peer) {
            edges.remove(edge);
            if edges.is_empty() {
                self.incident.remove(&peer);
            }
        }
    }

    pub fn graph(&self) -> Graph {
        Graph {
            nodes: self.nodes.iter().map(|&id| Node { id }).collect(),
            links: self.edges.iter().map(Edge::to_link).collect(),
        }
    }

    pub fn contains_node(&self, peer: PeerId) -> bool {
        self.nodes.contains(&peer)
    }

    pub fn contains_edge(&self, edge: Edge) -> bool {
        self.edges.contains(&edge)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn degree(&self, peer: PeerId) -> usize {
        self.incident.get(&peer).map_or(0, BTreeSet::len)
    }
}

enum Query {
    Snapshot(oneshot::Sender<Graph>),
    Watch(oneshot::Sender<Result<(Graph, Subscription<StateChanged>), BusError>>),
}

/// Queries a running [`ModelTask`].
///
/// Events already delivered to the model are applied before a query is
/// answered, so a snapshot taken after an emit returns reflects it.
#[derive(Clone)]
pub struct ModelHandle {
    queries: mpsc::Sender<Query>,
}

impl ModelHandle {
    pub async fn snapshot(&self) -> Result<Graph, BusError> {
        let (tx, rx) = oneshot::channel();
        self.queries
            .send(Query::Snapshot(tx))
            .await
            .map_err(|_| BusError::Closed)?;
        rx.await.map_err(|_| BusError::Closed)
    }

    /// The current graph plus a subscription starting right after it.
    pub async fn watch(&self) -> Result<(Graph, Subscription<StateChanged>), BusError> {
        let (tx, rx) = oneshot::channel();
        self.queries
            .send(Query::Watch(tx))
            .await
            .map_err(|_| BusError::Closed)?;
        rx.await.map_err(|_| BusError::Closed)?
    }
}

/// A [`GraphModel`] running on its own task.
pub struct ModelTask {
    handle: ModelHandle,
    task: JoinHandle<GraphModel>,
}

impl ModelTask {
    /// Subscribe to the bus's events and start the consumption loop.
    pub fn spawn(bus: Arc<MembershipBus>) -> Result<Self, BusError> {
        let input = bus.subscribe_events()?;
        let (tx, rx) = mpsc::channel(QUERY_CAPACITY);
        let task = tokio::spawn(run(GraphModel::new(), input, rx, bus));

        Ok(Self {
            handle: ModelHandle { queries: tx },
            task,
        })
    }

    pub fn handle(&self) -> ModelHandle {
        self.handle.clone()
    }

    /// Wait for the loop to end and return the final model.
    ///
    /// The loop ends once the bus's event topic is closed and drained.
    pub async fn join(self) -> Result<GraphModel, JoinError> {
        self.task.await
    }
}

async fn run(
    mut model: GraphModel,
    mut input: Subscription<ClusterEvent>,
    mut queries: mpsc::Receiver<Query>,
    bus: Arc<MembershipBus>,
) -> GraphModel {
    debug!("Graph model started");

    loop {
        tokio::select! {
            biased;
            event = input.recv() => {
                let Some(event) = event else { break };
                if let Some(change) = model.apply(&event) {
                    trace!("State changed: {:?}", change);
                    if bus.emit_state(change).await.is_err() {
                        warn!("State topic closed, stopping graph model");
                        break;
                    }
                }
            }
            Some(query) = queries.recv() => match query {
                Query::Snapshot(reply) => {
                    let _ = reply.send(model.graph());
                }
                Query::Watch(reply) => {
                    let watched = bus.subscribe_state().map(|sub| (model.graph(), sub));
                    let _ = reply.send(watched);
                }
            },
        }
    }

    bus.close_state();
    debug!(
        "Graph model stopped ({} nodes, {} edges)",
        model.node_count(),
        model.edge_count()
    );
    model
}
