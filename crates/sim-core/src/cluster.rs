//! Lifecycle orchestration for simulated members.
//!
//! The [`Cluster`] owns every active [`Member`], the membership bus and the
//! graph model task. Spawn, kill and close all serialize on one async lock;
//! observers only ever see the derived [`StateChanged`] stream.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::PeerId;
use crate::bus::{MembershipBus, NodeChanged};
use crate::config::{ClusterConfig, ConfigError};
use crate::events::Subscription;
use crate::graph::{Graph, ModelHandle, ModelTask, StateChanged};
use crate::inproc::InProcNetwork;
use crate::member::{Member, ReleaseError, ShutdownError};
use crate::network::{Connectivity, Host, Network, NetworkError, Overlay};
use crate::topology::Topology;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Peer not found: {0}")]
    NotFound(PeerId),

    #[error("Failed to construct member: {0}")]
    Construction(#[source] NetworkError),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    #[error("Network error: {0}")]
    Network(#[source] NetworkError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Cluster closed")]
    Closed,
}

struct Members<N: Network> {
    active: HashMap<PeerId, Member<N>>,
    model: Option<ModelTask>,
    closed: bool,
}

/// A simulated peer-to-peer cluster.
///
/// Must be created inside a Tokio runtime; the graph model starts
/// immediately.
pub struct Cluster<N: Network = InProcNetwork> {
    network: N,
    bus: Arc<MembershipBus>,
    model: ModelHandle,
    members: Mutex<Members<N>>,
}

impl Cluster<InProcNetwork> {
    /// A cluster on a fresh in-process network.
    pub fn new(config: ClusterConfig) -> Result<Self, ClusterError> {
        let network = InProcNetwork::new(config.bus_capacity);
        Self::with_network(network, config)
    }
}

impl<N: Network> Cluster<N> {
    pub fn with_network(network: N, config: ClusterConfig) -> Result<Self, ClusterError> {
        config.validate()?;

        let bus = Arc::new(MembershipBus::new(config.bus_capacity));
        let task = ModelTask::spawn(Arc::clone(&bus)).map_err(|_| ClusterError::Closed)?;
        let model = task.handle();

        Ok(Self {
            network,
            bus,
            model,
            members: Mutex::new(Members {
                active: HashMap::new(),
                model: Some(task),
                closed: false,
            }),
        })
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    /// Start a new member and return its ID.
    ///
    /// Its translation loop stops when `cancel` (or the member) is
    /// cancelled. If construction fails, whatever was built is released
    /// and nothing is registered.
    pub async fn spawn(&self, cancel: &CancellationToken) -> Result<PeerId, ClusterError> {
        let (host, overlay, events) = self.construct().await?;
        let id = host.id();

        let mut members = self.members.lock().await;
        if members.closed {
            release(&host, &overlay).await;
            return Err(ClusterError::Closed);
        }

        if self.bus.emit_node(NodeChanged::spawned(id)).await.is_err() {
            release(&host, &overlay).await;
            return Err(ClusterError::Closed);
        }

        let member = Member::start(
            host,
            overlay,
            events,
            Arc::clone(&self.bus),
            cancel.child_token(),
        );
        members.active.insert(id, member);

        info!("Spawned peer {} ({} active)", id, members.active.len());
        Ok(id)
    }

    async fn construct(
        &self,
    ) -> Result<(N::Host, N::Overlay, Subscription<Connectivity>), ClusterError> {
        let host = self
            .network
            .host()
            .await
            .map_err(ClusterError::Construction)?;

        let overlay = match self.network.overlay(&host).await {
            Ok(overlay) => overlay,
            Err(e) => {
                if let Err(close_err) = host.close().await {
                    warn!("Failed to release host {}: {}", host.id(), close_err);
                }
                return Err(ClusterError::Construction(e));
            }
        };

        match overlay.subscribe() {
            Ok(events) => Ok((host, overlay, events)),
            Err(e) => {
                release(&host, &overlay).await;
                Err(ClusterError::Construction(e))
            }
        }
    }

    /// Remove a member, announce its death and release its resources.
    ///
    /// The member is gone from the cluster even if releasing fails.
    pub async fn kill(&self, id: PeerId) -> Result<(), ClusterError> {
        let mut members = self.members.lock().await;
        let member = members
            .active
            .remove(&id)
            .ok_or(ClusterError::NotFound(id))?;

        let result = self.retire(member).await;
        info!("Killed peer {} ({} active)", id, members.active.len());
        result.map_err(ClusterError::from)
    }

    /// Announce a death, then close the member. Callers hold the lock.
    async fn retire(&self, member: Member<N>) -> Result<(), ShutdownError> {
        let id = member.id();
        let mut errors = ShutdownError::default();

        if let Err(source) = self.bus.emit_node(NodeChanged::died(id)).await {
            errors.push(ReleaseError::Announce { peer: id, source });
        }
        if let Err(e) = member.close().await {
            errors.absorb(e);
        }

        if !errors.is_empty() {
            warn!("Peer {} released with errors: {}", id, errors);
        }
        errors.into_result()
    }

    /// Subscribe to graph diffs. The stream ends when `cancel` fires or the
    /// cluster closes.
    pub fn events(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Subscription<StateChanged>, ClusterError> {
        let sub = self
            .bus
            .subscribe_state()
            .map_err(|_| ClusterError::Closed)?;
        Ok(sub.bind(cancel.clone()))
    }

    /// The current graph.
    pub async fn snapshot(&self) -> Result<Graph, ClusterError> {
        self.model.snapshot().await.map_err(|_| ClusterError::Closed)
    }

    /// The current graph plus every diff after it.
    pub async fn watch(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(Graph, Subscription<StateChanged>), ClusterError> {
        let (graph, sub) = self.model.watch().await.map_err(|_| ClusterError::Closed)?;
        Ok((graph, sub.bind(cancel.clone())))
    }

    /// Ask `from` to open a connection to `to`.
    pub async fn connect(&self, from: PeerId, to: PeerId) -> Result<(), ClusterError> {
        let members = self.members.lock().await;
        let member = members
            .active
            .get(&from)
            .ok_or(ClusterError::NotFound(from))?;
        if !members.active.contains_key(&to) {
            return Err(ClusterError::NotFound(to));
        }

        member
            .overlay()
            .connect(to)
            .await
            .map_err(ClusterError::Network)
    }

    /// Ask `from` to drop its connection to `to`, if any.
    pub async fn disconnect(&self, from: PeerId, to: PeerId) -> Result<(), ClusterError> {
        let members = self.members.lock().await;
        let member = members
            .active
            .get(&from)
            .ok_or(ClusterError::NotFound(from))?;

        member
            .overlay()
            .disconnect(to)
            .await
            .map_err(ClusterError::Network)
    }

    /// Dial each member's neighbors as chosen by `topology`.
    ///
    /// Failed dials are logged and skipped. Returns the number of dials
    /// that succeeded.
    pub async fn bootstrap(&self, topology: &dyn Topology) -> Result<usize, ClusterError> {
        let members = self.members.lock().await;
        if members.closed {
            return Err(ClusterError::Closed);
        }

        let mut ids: Vec<PeerId> = members.active.keys().copied().collect();
        ids.sort();

        let mut dials = 0;
        for &id in &ids {
            let Some(member) = members.active.get(&id) else {
                continue;
            };
            for neighbor in topology.neighbors(id, &ids) {
                match member.overlay().connect(neighbor).await {
                    Ok(()) => dials += 1,
                    Err(e) => warn!("Bootstrap dial {} -> {} failed: {}", id, neighbor, e),
                }
            }
        }

        info!("Bootstrapped {} peers with {} dials", ids.len(), dials);
        Ok(dials)
    }

    /// Active member IDs, sorted.
    pub async fn peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.members.lock().await.active.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.active.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Kill every member concurrently, then stop the graph model.
    ///
    /// Every member gets its release attempt; all failures come back
    /// together. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), ClusterError> {
        let mut members = self.members.lock().await;
        if members.closed {
            return Ok(());
        }
        members.closed = true;

        let retiring: Vec<Member<N>> = members.active.drain().map(|(_, m)| m).collect();
        let count = retiring.len();
        debug!("Closing cluster with {} members", count);

        let mut errors = ShutdownError::default();
        for result in join_all(retiring.into_iter().map(|m| self.retire(m))).await {
            if let Err(e) = result {
                errors.absorb(e);
            }
        }

        self.bus.close_events();
        if let Some(task) = members.model.take() {
            if let Err(e) = task.join().await {
                errors.push(ReleaseError::Model {
                    reason: e.to_string(),
                });
            }
        }

        info!(
            "Cluster closed ({} members, {} release failures)",
            count,
            errors.len()
        );
        errors.into_result().map_err(ClusterError::from)
    }
}

impl<N: Network> Drop for Cluster<N> {
    fn drop(&mut self) {
        // Ends the model loop; remaining members abort their tasks on drop.
        self.bus.close_events();
    }
}

/// Best-effort release of a member that never got registered.
async fn release<H: Host, O: Overlay>(host: &H, overlay: &O) {
    if let Err(e) = overlay.close().await {
        warn!("Failed to release overlay of {}: {}", host.id(), e);
    }
    if let Err(e) = host.close().await {
        warn!("Failed to release host {}: {}", host.id(), e);
    }
}
