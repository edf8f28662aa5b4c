//! In-memory network shared by every simulated host.
//!
//! Hosts address each other by [`PeerId`]. A connection is a symmetric
//! entry in both endpoints' link sets; establishing or dropping one emits
//! `Joined`/`Left` on both endpoints' connectivity topics.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::PeerId;
use crate::config::DEFAULT_BUS_CAPACITY;
use crate::events::{Subscription, Topic};
use crate::network::{Connectivity, Host, Network, NetworkError, Overlay, Result};

struct Endpoint {
    id: PeerId,
    links: Mutex<BTreeSet<PeerId>>,
    events: Topic<Connectivity>,
    host_closed: AtomicBool,
    overlay_closed: AtomicBool,
    overlay_attached: AtomicBool,
}

impl Endpoint {
    fn new(id: PeerId, capacity: usize) -> Self {
        Self {
            id,
            links: Mutex::new(BTreeSet::new()),
            events: Topic::new(capacity),
            host_closed: AtomicBool::new(false),
            overlay_closed: AtomicBool::new(false),
            overlay_attached: AtomicBool::new(false),
        }
    }

    fn is_open(&self) -> bool {
        !self.host_closed.load(Ordering::SeqCst) && !self.overlay_closed.load(Ordering::SeqCst)
    }

    fn links(&self) -> std::sync::MutexGuard<'_, BTreeSet<PeerId>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn notify(&self, event: Connectivity) {
        // A closed topic means nobody is listening any more.
        if self.events.emit(event).await.is_err() {
            trace!("{}: dropped {:?}, event stream closed", self.id, event);
        }
    }
}

struct Env {
    endpoints: RwLock<HashMap<PeerId, Arc<Endpoint>>>,
    capacity: usize,
}

impl Env {
    fn register(&self) -> Arc<Endpoint> {
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        let id = loop {
            let id = PeerId::generate();
            if !endpoints.contains_key(&id) {
                break id;
            }
        };
        let endpoint = Arc::new(Endpoint::new(id, self.capacity));
        endpoints.insert(id, Arc::clone(&endpoint));
        endpoint
    }

    fn lookup(&self, peer: PeerId) -> Option<Arc<Endpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&peer)
            .cloned()
    }

    fn deregister(&self, peer: PeerId) {
        self.endpoints
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&peer);
    }

    /// Link two open endpoints. Returns false if they were already linked.
    fn link(&self, a: &Endpoint, b: &Endpoint) -> Result<bool> {
        debug_assert_ne!(a.id, b.id, "cannot link an endpoint to itself");
        // Lock in ID order so opposite dials cannot deadlock.
        let (first, second) = if a.id < b.id { (a, b) } else { (b, a) };
        let mut first_links = first.links();
        let mut second_links = second.links();

        if !a.is_open() {
            return Err(NetworkError::Closed);
        }
        if !b.is_open() {
            return Err(NetworkError::PeerNotFound(b.id));
        }

        let added = first_links.insert(second.id);
        second_links.insert(first.id);
        Ok(added)
    }

    fn unlink(&self, a: &Endpoint, b: &Endpoint) -> bool {
        debug_assert_ne!(a.id, b.id, "cannot unlink an endpoint from itself");
        let (first, second) = if a.id < b.id { (a, b) } else { (b, a) };
        let mut first_links = first.links();
        let mut second_links = second.links();

        let removed = first_links.remove(&second.id);
        second_links.remove(&first.id);
        removed
    }

    /// Drop every connection of `endpoint`, notifying both ends.
    ///
    /// The caller marks the endpoint closed first, so no new link can be
    /// added while this runs.
    async fn hang_up_all(&self, endpoint: &Endpoint) {
        let peers = std::mem::take(&mut *endpoint.links());
        for peer in peers {
            if let Some(remote) = self.lookup(peer) {
                remote.links().remove(&endpoint.id);
                remote.notify(Connectivity::Left(endpoint.id)).await;
            }
            endpoint.notify(Connectivity::Left(peer)).await;
        }
    }
}

/// A network living entirely in this process.
///
/// Cloning shares the same environment.
#[derive(Clone)]
pub struct InProcNetwork {
    env: Arc<Env>,
}

impl InProcNetwork {
    /// Create an environment whose connectivity streams buffer up to
    /// `capacity` events each.
    pub fn new(capacity: usize) -> Self {
        Self {
            env: Arc::new(Env {
                endpoints: RwLock::new(HashMap::new()),
                capacity,
            }),
        }
    }

    /// Number of registered hosts.
    pub fn len(&self) -> usize {
        self.env
            .endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.env.lookup(peer).is_some()
    }
}

impl Default for InProcNetwork {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

#[async_trait]
impl Network for InProcNetwork {
    type Host = InProcHost;
    type Overlay = InProcOverlay;

    async fn host(&self) -> Result<InProcHost> {
        let endpoint = self.env.register();
        debug!("Registered host {}", endpoint.id);
        Ok(InProcHost {
            endpoint,
            env: Arc::clone(&self.env),
        })
    }

    async fn overlay(&self, host: &InProcHost) -> Result<InProcOverlay> {
        let endpoint = &host.endpoint;
        if endpoint.host_closed.load(Ordering::SeqCst) {
            return Err(NetworkError::Closed);
        }
        if endpoint.overlay_attached.swap(true, Ordering::SeqCst) {
            return Err(NetworkError::Other(format!(
                "overlay already attached to {}",
                endpoint.id
            )));
        }

        Ok(InProcOverlay {
            endpoint: Arc::clone(endpoint),
            env: Arc::clone(&host.env),
        })
    }
}

pub struct InProcHost {
    endpoint: Arc<Endpoint>,
    env: Arc<Env>,
}

#[async_trait]
impl Host for InProcHost {
    fn id(&self) -> PeerId {
        self.endpoint.id
    }

    async fn close(&self) -> Result<()> {
        if self.endpoint.host_closed.swap(true, Ordering::SeqCst) {
            return Err(NetworkError::Closed);
        }

        self.env.hang_up_all(&self.endpoint).await;
        self.env.deregister(self.endpoint.id);
        self.endpoint.events.close();
        debug!("Closed host {}", self.endpoint.id);
        Ok(())
    }
}

pub struct InProcOverlay {
    endpoint: Arc<Endpoint>,
    env: Arc<Env>,
}

#[async_trait]
impl Overlay for InProcOverlay {
    fn subscribe(&self) -> Result<Subscription<Connectivity>> {
        if !self.endpoint.is_open() {
            return Err(NetworkError::Closed);
        }
        Ok(self.endpoint.events.subscribe()?)
    }

    async fn connect(&self, peer: PeerId) -> Result<()> {
        let local = &self.endpoint;
        if !local.is_open() {
            return Err(NetworkError::Closed);
        }
        if peer == local.id {
            return Err(NetworkError::SelfDial(peer));
        }
        let remote = self
            .env
            .lookup(peer)
            .ok_or(NetworkError::PeerNotFound(peer))?;

        if self.env.link(local, &remote)? {
            trace!("{} connected to {}", local.id, peer);
            local.notify(Connectivity::Joined(peer)).await;
            remote.notify(Connectivity::Joined(local.id)).await;
        }
        Ok(())
    }

    async fn disconnect(&self, peer: PeerId) -> Result<()> {
        let local = &self.endpoint;
        if !local.is_open() {
            return Err(NetworkError::Closed);
        }
        // Both link sets would be the same mutex.
        if peer == local.id {
            return Err(NetworkError::SelfDial(peer));
        }
        let Some(remote) = self.env.lookup(peer) else {
            return Ok(());
        };

        if self.env.unlink(local, &remote) {
            trace!("{} disconnected from {}", local.id, peer);
            local.notify(Connectivity::Left(peer)).await;
            remote.notify(Connectivity::Left(local.id)).await;
        }
        Ok(())
    }

    fn neighbors(&self) -> Vec<PeerId> {
        self.endpoint.links().iter().copied().collect()
    }

    async fn close(&self) -> Result<()> {
        if self.endpoint.overlay_closed.swap(true, Ordering::SeqCst) {
            return Err(NetworkError::Closed);
        }

        self.env.hang_up_all(&self.endpoint).await;
        self.endpoint.events.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn host_with_overlay(net: &InProcNetwork) -> (InProcHost, InProcOverlay) {
        let host = net.host().await.unwrap();
        let overlay = net.overlay(&host).await.unwrap();
        (host, overlay)
    }

    #[tokio::test]
    async fn test_connect_notifies_both_ends() {
        let net = InProcNetwork::new(8);
        let (a, oa) = host_with_overlay(&net).await;
        let (b, ob) = host_with_overlay(&net).await;
        let mut sa = oa.subscribe().unwrap();
        let mut sb = ob.subscribe().unwrap();

        oa.connect(b.id()).await.unwrap();
        oa.connect(b.id()).await.unwrap();

        assert_eq!(sa.recv().await, Some(Connectivity::Joined(b.id())));
        assert_eq!(sb.recv().await, Some(Connectivity::Joined(a.id())));
        assert!(sa.try_recv().is_none());
        assert_eq!(oa.neighbors(), vec![b.id()]);
        assert_eq!(ob.neighbors(), vec![a.id()]);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_both_ends() {
        let net = InProcNetwork::new(8);
        let (a, oa) = host_with_overlay(&net).await;
        let (b, ob) = host_with_overlay(&net).await;
        oa.connect(b.id()).await.unwrap();
        let mut sa = oa.subscribe().unwrap();
        let mut sb = ob.subscribe().unwrap();

        ob.disconnect(a.id()).await.unwrap();

        assert_eq!(sa.recv().await, Some(Connectivity::Left(b.id())));
        assert_eq!(sb.recv().await, Some(Connectivity::Left(a.id())));
        assert!(oa.neighbors().is_empty());
    }

    #[tokio::test]
    async fn test_dial_errors() {
        let net = InProcNetwork::new(8);
        let (a, oa) = host_with_overlay(&net).await;

        assert!(matches!(oa.connect(a.id()).await, Err(NetworkError::SelfDial(_))));
        assert!(matches!(
            oa.connect(PeerId::from(1)).await,
            Err(NetworkError::PeerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_self_disconnect_is_rejected() {
        let net = InProcNetwork::new(8);
        let (a, oa) = host_with_overlay(&net).await;

        let result = tokio::time::timeout(Duration::from_secs(5), oa.disconnect(a.id()))
            .await
            .expect("self-disconnect should not block");

        assert!(matches!(result, Err(NetworkError::SelfDial(_))));
        assert!(oa.neighbors().is_empty());
    }

    #[tokio::test]
    async fn test_overlay_close_hangs_up() {
        let net = InProcNetwork::new(8);
        let (a, oa) = host_with_overlay(&net).await;
        let (b, ob) = host_with_overlay(&net).await;
        oa.connect(b.id()).await.unwrap();
        let mut sa = oa.subscribe().unwrap();
        let mut sb = ob.subscribe().unwrap();

        oa.close().await.unwrap();

        assert_eq!(sb.recv().await, Some(Connectivity::Left(a.id())));
        assert_eq!(sa.recv().await, Some(Connectivity::Left(b.id())));
        assert_eq!(sa.recv().await, None);
        assert!(ob.neighbors().is_empty());
        assert!(matches!(oa.close().await, Err(NetworkError::Closed)));
        assert!(matches!(ob.connect(a.id()).await, Err(NetworkError::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn test_host_close_deregisters() {
        let net = InProcNetwork::new(8);
        let (a, _oa) = host_with_overlay(&net).await;
        assert!(net.contains(a.id()));

        a.close().await.unwrap();

        assert!(!net.contains(a.id()));
        assert!(net.is_empty());
        assert!(matches!(a.close().await, Err(NetworkError::Closed)));
        assert!(matches!(net.overlay(&a).await, Err(NetworkError::Closed)));
    }

    #[tokio::test]
    async fn test_one_overlay_per_host() {
        let net = InProcNetwork::new(8);
        let (a, _oa) = host_with_overlay(&net).await;
        assert!(matches!(net.overlay(&a).await, Err(NetworkError::Other(_))));
    }
}
