//! JSON-line messages exchanged with an observer.
//!
//! Inbound, one [`UserEvent`] per line:
//! `{"spawn": {"n": 3}}`, `{"kill": {"hosts": ["<peer>", ...]}}`,
//! `{"link": {"source": "<peer>", "target": "<peer>"}}`, `{"unlink": ...}`.
//!
//! Outbound, one [`SimulationChanged`] per line: either the full graph
//! (`{"graph": {"id": "<uuid>", "nodes": [...], "links": [...]}}`) or one
//! diff (`{"step": {"add": ..., "rm": ...}}`).

use serde::{Deserialize, Serialize};
use sim_core::{Graph, Link, Node, PeerId, StateChanged};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Invalid user event: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("User event carries no command")]
    Empty,
}

/// A request from the observer. Several commands may share one event; they
/// run in field order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn: Option<Spawn>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill: Option<Kill>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkCommand>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlink: Option<LinkCommand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spawn {
    pub n: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kill {
    pub hosts: Vec<PeerId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCommand {
    pub source: PeerId,
    pub target: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Spawn(Spawn),
    Kill(Kill),
    Link(LinkCommand),
    Unlink(LinkCommand),
}

impl UserEvent {
    /// Parse one input line. Blank lines yield `None`.
    pub fn from_line(line: &str) -> Result<Option<Self>, MessageError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let event: Self = serde_json::from_str(line)?;
        if event.is_empty() {
            return Err(MessageError::Empty);
        }
        Ok(Some(event))
    }

    pub fn is_empty(&self) -> bool {
        self.spawn.is_none() && self.kill.is_none() && self.link.is_none() && self.unlink.is_none()
    }

    pub fn into_commands(self) -> Vec<Command> {
        let mut commands = Vec::new();
        if let Some(spawn) = self.spawn {
            commands.push(Command::Spawn(spawn));
        }
        if let Some(kill) = self.kill {
            commands.push(Command::Kill(kill));
        }
        if let Some(link) = self.link {
            commands.push(Command::Link(link));
        }
        if let Some(unlink) = self.unlink {
            commands.push(Command::Unlink(unlink));
        }
        commands
    }
}

/// Full graph of one session, tagged with the session's ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphView {
    pub id: Uuid,
    pub nodes: Vec<Node>,
    pub links: Vec<Link>,
}

impl GraphView {
    pub fn new(id: Uuid, graph: Graph) -> Self {
        Self {
            id,
            nodes: graph.nodes,
            links: graph.links,
        }
    }
}

/// A message for the observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationChanged {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphView>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StateChanged>,
}

impl SimulationChanged {
    pub fn graph(view: GraphView) -> Self {
        Self {
            graph: Some(view),
            step: None,
        }
    }

    pub fn step(change: StateChanged) -> Self {
        Self {
            graph: None,
            step: Some(change),
        }
    }

    /// Serialize as a single JSON line, without the trailing newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
