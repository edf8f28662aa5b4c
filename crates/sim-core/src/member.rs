//! A simulated cluster member.
//!
//! A [`Member`] owns one host, its overlay, and a translation task that turns
//! the host's local `Joined`/`Left` events into cluster-wide
//! [`LinkChanged`] events on the membership bus.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::PeerId;
use crate::bus::{LinkChanged, MembershipBus};
use crate::events::{BusError, Subscription};
use crate::network::{Connectivity, Host, Network, NetworkError, Overlay};

/// One resource that failed to release.
#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("Failed to close overlay of {peer}: {source}")]
    Overlay {
        peer: PeerId,
        #[source]
        source: NetworkError,
    },

    #[error("Failed to close host {peer}: {source}")]
    Host {
        peer: PeerId,
        #[source]
        source: NetworkError,
    },

    #[error("Translation loop of {peer} failed: {reason}")]
    Translation { peer: PeerId, reason: String },

    #[error("Failed to announce death of {peer}: {source}")]
    Announce {
        peer: PeerId,
        #[source]
        source: BusError,
    },

    #[error("Graph model failed: {reason}")]
    Model { reason: String },
}

impl ReleaseError {
    /// The member this failure belongs to, if any.
    pub fn peer(&self) -> Option<PeerId> {
        match self {
            ReleaseError::Overlay { peer, .. }
            | ReleaseError::Host { peer, .. }
            | ReleaseError::Translation { peer, .. }
            | ReleaseError::Announce { peer, .. } => Some(*peer),
            ReleaseError::Model { .. } => None,
        }
    }
}

/// Every release failure from one kill or close.
///
/// Releases never short-circuit: each resource gets its attempt, and all
/// failures are collected here.
#[derive(Debug, Default)]
pub struct ShutdownError {
    errors: Vec<ReleaseError>,
}

impl ShutdownError {
    pub fn errors(&self) -> &[ReleaseError] {
        &self.errors
    }

    /// Distinct members with at least one failure.
    pub fn peers(&self) -> BTreeSet<PeerId> {
        self.errors.iter().filter_map(ReleaseError::peer).collect()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub(crate) fn push(&mut self, err: ReleaseError) {
        self.errors.push(err);
    }

    pub(crate) fn absorb(&mut self, other: ShutdownError) {
        self.errors.extend(other.errors);
    }

    pub(crate) fn into_result(self) -> Result<(), ShutdownError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} release failure(s)", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}", sep, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownError {}

pub struct Member<N: Network> {
    id: PeerId,
    host: N::Host,
    overlay: N::Overlay,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<N: Network> Member<N> {
    /// Take ownership of a constructed host and start translating its
    /// connectivity events. The loop stops when `cancel` fires.
    pub(crate) fn start(
        host: N::Host,
        overlay: N::Overlay,
        events: Subscription<Connectivity>,
        bus: Arc<MembershipBus>,
        cancel: CancellationToken,
    ) -> Self {
        let id = host.id();
        let events = events.bind(cancel.clone());
        let task = tokio::spawn(translate(id, events, bus, cancel.clone()));

        Self {
            id,
            host,
            overlay,
            cancel,
            task: Some(task),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn overlay(&self) -> &N::Overlay {
        &self.overlay
    }

    /// Stop the translation loop, then close the overlay and the host.
    ///
    /// All three are attempted even if an earlier one fails.
    pub async fn close(mut self) -> Result<(), ShutdownError> {
        let mut errors = ShutdownError::default();

        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                errors.push(ReleaseError::Translation {
                    peer: self.id,
                    reason: e.to_string(),
                });
            }
        }

        if let Err(source) = self.overlay.close().await {
            errors.push(ReleaseError::Overlay {
                peer: self.id,
                source,
            });
        }

        if let Err(source) = self.host.close().await {
            errors.push(ReleaseError::Host {
                peer: self.id,
                source,
            });
        }

        debug!("Closed member {} ({} failures)", self.id, errors.len());
        errors.into_result()
    }
}

impl<N: Network> Drop for Member<N> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Forward host-local connectivity as canonical cluster link events.
async fn translate(
    local: PeerId,
    mut events: Subscription<Connectivity>,
    bus: Arc<MembershipBus>,
    cancel: CancellationToken,
) {
    trace!("{}: translation loop started", local);

    while let Some(event) = events.recv().await {
        let change = match event {
            Connectivity::Joined(peer) => LinkChanged::created(local, peer),
            Connectivity::Left(peer) => LinkChanged::severed(local, peer),
        };

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = bus.emit_link(change) => sent,
        };
        if sent.is_err() {
            debug!("{}: membership bus closed, stopping translation", local);
            break;
        }
    }

    trace!("{}: translation loop stopped", local);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ClusterEvent;
    use crate::inproc::InProcNetwork;

    #[tokio::test]
    async fn test_translates_local_events() {
        let net = InProcNetwork::new(8);
        let bus = Arc::new(MembershipBus::new(8));
        let mut out = bus.subscribe_events().unwrap();

        let host = net.host().await.unwrap();
        let overlay = net.overlay(&host).await.unwrap();
        let events = overlay.subscribe().unwrap();
        let member: Member<InProcNetwork> =
            Member::start(host, overlay, events, Arc::clone(&bus), CancellationToken::new());

        let other = net.host().await.unwrap();
        let _other_overlay = net.overlay(&other).await.unwrap();

        member.overlay().connect(other.id()).await.unwrap();
        assert_eq!(
            out.recv().await,
            Some(ClusterEvent::Link(LinkChanged::created(other.id(), member.id())))
        );

        member.overlay().disconnect(other.id()).await.unwrap();
        assert_eq!(
            out.recv().await,
            Some(ClusterEvent::Link(LinkChanged::severed(member.id(), other.id())))
        );

        let id = member.id();
        member.close().await.unwrap();
        assert!(!net.contains(id));
    }

    #[test]
    fn test_shutdown_error_lists_every_failure() {
        let mut errors = ShutdownError::default();
        errors.push(ReleaseError::Overlay {
            peer: PeerId::from(1),
            source: NetworkError::Closed,
        });
        errors.push(ReleaseError::Host {
            peer: PeerId::from(2),
            source: NetworkError::Closed,
        });

        let message = errors.to_string();
        assert!(message.starts_with("2 release failure(s): "));
        assert!(message.contains("overlay of 0000000000000001"));
        assert!(message.contains("host 0000000000000002"));
        assert_eq!(errors.peers().len(), 2);
    }
}
