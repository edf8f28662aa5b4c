//! Bootstrap topologies.
//!
//! A [`Topology`] picks which peers a newly started peer should dial, given
//! every peer in the cluster. The cluster consumes it in
//! `Cluster::bootstrap`; it never decides on its own who connects to whom.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::PeerId;

pub trait Topology: Send + Sync {
    /// Peers `local` should connect to, chosen from `candidates`.
    ///
    /// `candidates` may include `local`; it is never returned. A `local`
    /// that is not among the candidates gets no neighbors from ordered
    /// topologies.
    fn neighbors(&self, local: PeerId, candidates: &[PeerId]) -> Vec<PeerId>;
}

impl<T: Topology + ?Sized> Topology for Box<T> {
    fn neighbors(&self, local: PeerId, candidates: &[PeerId]) -> Vec<PeerId> {
        (**self).neighbors(local, candidates)
    }
}

fn sorted(candidates: &[PeerId]) -> Vec<PeerId> {
    let mut peers = candidates.to_vec();
    peers.sort();
    peers.dedup();
    peers
}

/// Each peer connects to its left and right neighbor in ID order, wrapping
/// around at the ends.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ring;

impl Topology for Ring {
    fn neighbors(&self, local: PeerId, candidates: &[PeerId]) -> Vec<PeerId> {
        let peers = sorted(candidates);
        let Ok(idx) = peers.binary_search(&local) else {
            return Vec::new();
        };

        let n = peers.len();
        let mut out = Vec::with_capacity(2);
        for neighbor in [peers[(idx + n - 1) % n], peers[(idx + 1) % n]] {
            if neighbor != local && !out.contains(&neighbor) {
                out.push(neighbor);
            }
        }
        out
    }
}

/// Each peer connects to the next peer in ID order; the last connects to
/// nobody.
#[derive(Debug, Clone, Copy, Default)]
pub struct Line;

impl Topology for Line {
    fn neighbors(&self, local: PeerId, candidates: &[PeerId]) -> Vec<PeerId> {
        let peers = sorted(candidates);
        match peers.binary_search(&local) {
            Ok(idx) => peers.get(idx + 1).copied().into_iter().collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Each peer connects to up to `k` peers chosen uniformly at random.
///
/// With a seed, the choice for a given local peer and candidate set is
/// repeatable.
#[derive(Debug, Clone, Copy)]
pub struct Random {
    k: usize,
    seed: Option<u64>,
}

impl Random {
    pub fn new(k: usize) -> Self {
        Self { k, seed: None }
    }

    pub fn seeded(k: usize, seed: u64) -> Self {
        Self {
            k,
            seed: Some(seed),
        }
    }
}

impl Topology for Random {
    fn neighbors(&self, local: PeerId, candidates: &[PeerId]) -> Vec<PeerId> {
        let mut others: Vec<PeerId> = sorted(candidates)
            .into_iter()
            .filter(|&p| p != local)
            .collect();

        match self.seed {
            Some(seed) => others.shuffle(&mut StdRng::seed_from_u64(seed ^ local.as_u64())),
            None => others.shuffle(&mut rand::rng()),
        }
        others.truncate(self.k);
        others
    }
}
