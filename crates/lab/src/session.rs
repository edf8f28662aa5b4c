//! One lab run: a cluster, its ID and its counters.

use serde::Serialize;
use sim_core::{
    Cluster, ClusterConfig, ClusterError, InProcNetwork, Network, PeerId, StateChanged,
    Subscription, Topology,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::message::{Command, GraphView, Kill, LinkCommand, SimulationChanged, UserEvent};

/// Per-session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub spawned: u64,
    pub killed: u64,
    pub failures: u64,
}

pub struct Session<N: Network = InProcNetwork> {
    id: Uuid,
    cluster: Cluster<N>,
    cancel: CancellationToken,
    stats: SessionStats,
}

impl Session<InProcNetwork> {
    pub fn new(config: ClusterConfig) -> Result<Self, ClusterError> {
        Ok(Self::with_cluster(Cluster::new(config)?))
    }
}

impl<N: Network> Session<N> {
    pub fn with_cluster(cluster: Cluster<N>) -> Self {
        let id = Uuid::new_v4();
        debug!("Created session {}", id);
        Self {
            id,
            cluster,
            cancel: CancellationToken::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cluster(&self) -> &Cluster<N> {
        &self.cluster
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Spawn `n` peers and wire them up with `topology`.
    pub async fn populate(&mut self, n: usize, topology: &dyn Topology) -> Result<usize, ClusterError> {
        self.spawn(n).await;
        self.cluster.bootstrap(topology).await
    }

    /// The full graph as an observer message, plus every diff after it.
    pub async fn watch(&self) -> Result<(SimulationChanged, Subscription<StateChanged>), ClusterError> {
        let (graph, steps) = self.cluster.watch(&self.cancel).await?;
        let initial = SimulationChanged::graph(GraphView::new(self.id, graph));
        Ok((initial, steps))
    }

    /// Run every command in `event`. Failures are logged and counted, never
    /// returned.
    pub async fn apply(&mut self, event: UserEvent) {
        for command in event.into_commands() {
            match command {
                Command::Spawn(spawn) => {
                    self.spawn(spawn.n).await;
                }
                Command::Kill(kill) => self.kill(kill).await,
                Command::Link(link) => self.link(link).await,
                Command::Unlink(link) => self.unlink(link).await,
            }
        }
    }

    async fn spawn(&mut self, n: usize) -> Vec<PeerId> {
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            match self.cluster.spawn(&self.cancel).await {
                Ok(id) => {
                    debug!("Spawned host {}", id);
                    self.stats.spawned += 1;
                    ids.push(id);
                }
                Err(e) => {
                    error!("Failed to spawn peer: {}", e);
                    self.stats.failures += 1;
                }
            }
        }
        ids
    }

    async fn kill(&mut self, kill: Kill) {
        for id in kill.hosts {
            match self.cluster.kill(id).await {
                Ok(()) => {
                    debug!("Killed host {}", id);
                    self.stats.killed += 1;
                }
                // The peer is gone either way; only its release failed.
                Err(ClusterError::Shutdown(e)) => {
                    error!("Host {} released with errors: {}", id, e);
                    self.stats.killed += 1;
                    self.stats.failures += 1;
                }
                Err(e) => {
                    error!("Failed to kill host {}: {}", id, e);
                    self.stats.failures += 1;
                }
            }
        }
    }

    async fn link(&mut self, link: LinkCommand) {
        if let Err(e) = self.cluster.connect(link.source, link.target).await {
            error!("Failed to link {} -> {}: {}", link.source, link.target, e);
            self.stats.failures += 1;
        }
    }

    async fn unlink(&mut self, link: LinkCommand) {
        if let Err(e) = self.cluster.disconnect(link.source, link.target).await {
            error!("Failed to unlink {} -> {}: {}", link.source, link.target, e);
            self.stats.failures += 1;
        }
    }

    /// Close the cluster and end every stream handed out by this session.
    pub async fn close(self) -> Result<SessionStats, ClusterError> {
        let result = self.cluster.close().await;
        self.cancel.cancel();
        info!(
            "Session {} closed: {} spawned, {} killed, {} failures",
            self.id, self.stats.spawned, self.stats.killed, self.stats.failures
        );
        result.map(|()| self.stats)
    }
}
