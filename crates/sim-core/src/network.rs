//! Network traits for simulated hosts.
//!
//! Implementations:
//! - `InProcNetwork`: all hosts share one in-memory environment
//! - Test doubles that wrap it to inject construction or release failures
//!
//! A [`Network`] mints hosts; each [`Host`] gets an [`Overlay`] that manages
//! its connections and reports them as a stream of [`Connectivity`] events.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::PeerId;
use crate::events::{BusError, Subscription};

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Cannot dial or hang up on self: {0}")]
    SelfDial(PeerId),

    #[error("Endpoint already closed")]
    Closed,

    #[error("Event stream unavailable: {0}")]
    Bus(#[from] BusError),

    #[error("Network error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, NetworkError>;

/// Connection change observed by one host, naming the remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "peer", rename_all = "camelCase")]
pub enum Connectivity {
    Joined(PeerId),
    Left(PeerId),
}

/// A shared environment able to mint virtually-addressed hosts.
#[async_trait]
pub trait Network: Send + Sync + 'static {
    type Host: Host;
    type Overlay: Overlay;

    /// Create and register a new host with a fresh peer ID.
    async fn host(&self) -> Result<Self::Host>;

    /// Attach a connection manager to a host.
    async fn overlay(&self, host: &Self::Host) -> Result<Self::Overlay>;
}

/// One simulated endpoint.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    fn id(&self) -> PeerId;

    /// Deregister from the network. Remaining connections are dropped.
    async fn close(&self) -> Result<()>;
}

/// Per-host connection manager.
#[async_trait]
pub trait Overlay: Send + Sync + 'static {
    /// Subscribe to this host's connectivity changes.
    fn subscribe(&self) -> Result<Subscription<Connectivity>>;

    /// Open a connection to `peer`. Connecting twice is a no-op.
    async fn connect(&self, peer: PeerId) -> Result<()>;

    /// Close the connection to `peer`, if any.
    async fn disconnect(&self, peer: PeerId) -> Result<()>;

    /// Currently connected peers, sorted.
    fn neighbors(&self) -> Vec<PeerId>;

    /// Hang up every connection and end the connectivity stream.
    async fn close(&self) -> Result<()>;
}
