//! Graph entities and the diff messages delivered to observers.
//!
//! Wire form (JSON):
//! - `Node`: `{"id": "<peer>"}`
//! - `Link`: `{"source": "<peer>", "target": "<peer>"}` with `source < target`
//! - `StateChanged`: `{"add": Diff?, "rm": Diff?}`, absent halves omitted

use serde::{Deserialize, Serialize};

use crate::PeerId;

/// An unordered pair of peers.
///
/// Canonicalized on construction so `Edge::new(a, b) == Edge::new(b, a)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    low: PeerId,
    high: PeerId,
}

impl Edge {
    pub fn new(x: PeerId, y: PeerId) -> Self {
        if x <= y {
            Self { low: x, high: y }
        } else {
            Self { low: y, high: x }
        }
    }

    /// Both endpoints, lowest first.
    pub fn endpoints(&self) -> (PeerId, PeerId) {
        (self.low, self.high)
    }

    /// The endpoint opposite `id`, if `id` is an endpoint.
    pub fn other(&self, id: PeerId) -> Option<PeerId> {
        if self.low == id {
            Some(self.high)
        } else if self.high == id {
            Some(self.low)
        } else {
            None
        }
    }

    pub fn is_loop(&self) -> bool {
        self.low == self.high
    }

    pub fn to_link(&self) -> Link {
        Link {
            source: self.low,
            target: self.high,
        }
    }
}

/// A graph vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: PeerId,
}

/// Wire form of an [`Edge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    pub source: PeerId,
    pub target: PeerId,
}

impl Link {
    pub fn edge(&self) -> Edge {
        Edge::new(self.source, self.target)
    }
}

impl From<Edge> for Link {
    fn from(edge: Edge) -> Self {
        edge.to_link()
    }
}

/// An additive or subtractive batch of graph entities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl Diff {
    pub fn node(id: PeerId) -> Self {
        Self {
            nodes: vec![Node { id }],
            links: Vec::new(),
        }
    }

    pub fn link(edge: Edge) -> Self {
        Self {
            nodes: Vec::new(),
            links: vec![edge.to_link()],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.links.is_empty()
    }
}

/// The externally visible unit of change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChanged {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add: Option<Diff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rm: Option<Diff>,
}

impl StateChanged {
    pub fn added(diff: Diff) -> Self {
        Self {
            add: Some(diff),
            rm: None,
        }
    }

    pub fn removed(diff: Diff) -> Self {
        Self {
            add: None,
            rm: Some(diff),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_none() && self.rm.is_none()
    }
}

/// A full snapshot of the graph, sorted for determinism.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub links: Vec<Link>,
}

impl Graph {
    /// Apply a diff to this snapshot, the way an observer would.
    ///
    /// Removals are applied before additions.
    pub fn apply(&mut self, change: &StateChanged) {
        if let Some(rm) = &change.rm {
            self.nodes.retain(|n| !rm.nodes.contains(n));
            self.links
                .retain(|l| !rm.links.iter().any(|r| r.edge() == l.edge()));
        }
        if let Some(add) = &change.add {
            for node in &add.nodes {
                if !self.nodes.contains(node) {
                    self.nodes.push(*node);
                }
            }
            for link in &add.links {
                if !self.links.iter().any(|l| l.edge() == link.edge()) {
                    self.links.push(*link);
                }
            }
        }
        self.nodes.sort_by_key(|n| n.id);
        self.links.sort_by_key(|l| l.edge());
    }

    pub fn contains_node(&self, id: PeerId) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }

    pub fn contains_edge(&self, edge: Edge) -> bool {
        self.links.iter().any(|l| l.edge() == edge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u64) -> PeerId {
        PeerId::from(n)
    }

    #[test]
    fn test_edge_is_canonical() {
        assert_eq!(Edge::new(peer(2), peer(1)), Edge::new(peer(1), peer(2)));
        assert_eq!(Edge::new(peer(2), peer(1)).endpoints(), (peer(1), peer(2)));
    }

    #[test]
    fn test_edge_other() {
        let edge = Edge::new(peer(1), peer(2));
        assert_eq!(edge.other(peer(1)), Some(peer(2)));
        assert_eq!(edge.other(peer(2)), Some(peer(1)));
        assert_eq!(edge.other(peer(3)), None);
        assert!(!edge.is_loop());
        assert!(Edge::new(peer(4), peer(4)).is_loop());
    }

    #[test]
    fn test_state_changed_omits_absent_halves() {
        let change = StateChanged::added(Diff::node(peer(1)));
        let json = serde_json::to_value(&change).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "add": { "nodes": [{ "id": "0000000000000001" }], "links": [] }
            })
        );
    }

    #[test]
    fn test_link_serializes_source_target() {
        let diff = Diff::link(Edge::new(peer(0xb), peer(0xa)));
        let json = serde_json::to_value(&diff).unwrap();

        assert_eq!(
            json["links"][0],
            serde_json::json!({ "source": "000000000000000a", "target": "000000000000000b" })
        );
    }

    #[test]
    fn test_graph_apply() {
        let mut graph = Graph::default();
        graph.apply(&StateChanged::added(Diff::node(peer(1))));
        graph.apply(&StateChanged::added(Diff::node(peer(2))));
        graph.apply(&StateChanged::added(Diff::link(Edge::new(peer(1), peer(2)))));
        assert_eq!(graph.nodes.len(), 2);
        assert!(graph.contains_edge(Edge::new(peer(2), peer(1))));

        graph.apply(&StateChanged::removed(Diff {
            nodes: vec![Node { id: peer(2) }],
            links: vec![Edge::new(peer(1), peer(2)).to_link()],
        }));
        assert!(graph.contains_node(peer(1)));
        assert!(!graph.contains_node(peer(2)));
        assert!(graph.links.is_empty());
    }
}
