//! Primary Election
//!
//! Run by the designated primary member once every subordinate has passed
//! vetting. The primary repeats the direct-neighbor handshake, learns the
//! diagonal peer through its LEFT neighbor's published block and derives the
//! ring numbering from the four serials it can see.

use serde::{Deserialize, Serialize};

use super::channel::AttemptContext;
use super::record::{ElectionStatus, PersistentElectionRecord};
use super::vetting::{require_peer_success, Handshake};
use crate::error::{Error, Result};
use crate::hal::{Direction, LinkMask};

/// Position of one member within its ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingPosition {
    pub node_id: u8,
    pub ring_size: u8,
    /// Serial of the ring's id-0 member, shared by the whole ring
    pub canonical: u64,
}

/// Derive this member's ring position from the serials it can observe.
///
/// Every member of a full ring evaluates this with its own view of the same
/// four serials and arrives at the same numbering, with the minimum serial
/// at id 0.
pub fn compute_position(own: u64, left: u64, right: u64, diagonal: u64, mask: LinkMask) -> RingPosition {
    let two_node_peer = match mask.single_direction() {
        Some(Direction::Right) => Some(right),
        Some(Direction::Left) => Some(left),
        None if mask != LinkMask::BOTH || left == right => Some(left),
        None => None,
    };

    if let Some(peer) = two_node_peer {
        return if own < peer {
            RingPosition { node_id: 0, ring_size: 2, canonical: own }
        } else {
            RingPosition { node_id: 1, ring_size: 2, canonical: peer }
        };
    }

    let (node_id, canonical) = if own < diagonal && own < left && own < right {
        (0, own)
    } else if diagonal < left && diagonal < right {
        (2, diagonal)
    } else if left < right {
        (1, left)
    } else {
        (3, right)
    };
    RingPosition { node_id, ring_size: 4, canonical }
}

/// Serials of every ring position, indexed by node id
pub fn member_table(position: &RingPosition, own: u64, left: u64, right: u64, diagonal: u64) -> Vec<u64> {
    let id = usize::from(position.node_id);
    let mut members = vec![0; usize::from(position.ring_size)];
    if position.ring_size == 4 {
        members[id] = own;
        members[id ^ 1] = left;
        members[3 - id] = right;
        members[id ^ 2] = diagonal;
    } else {
        // Single-link rings only know the one peer.
        members[id] = own;
        members[1 - id] = if left != 0 { left } else { right };
    }
    members
}

/// Outcome of a successful election as seen by this host's primary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingTopology {
    pub node_id: u8,
    pub ring_size: u8,
    pub canonical: u64,
    pub link_mask: LinkMask,
    /// Serials indexed by node id
    pub members: Vec<u64>,
    /// Serial of the local primary
    pub serial: u64,
}

impl RingTopology {
    pub fn position(&self) -> RingPosition {
        RingPosition {
            node_id: self.node_id,
            ring_size: self.ring_size,
            canonical: self.canonical,
        }
    }
}

#[derive(Debug)]
enum ElectPhase {
    Reset,
    SamplePeers,
    Publish,
    ConfirmPeers,
    Compute,
    Settle(RingTopology),
    Done(RingTopology),
}

/// Election run by the primary member
pub struct PrimaryElection<'a> {
    handshake: Handshake<'a>,
    vetted: usize,
}

impl<'a> PrimaryElection<'a> {
    pub fn new(ctx: &'a AttemptContext, member: usize, vetted: usize) -> Result<Self> {
        Ok(Self {
            handshake: Handshake::begin(ctx, member)?,
            vetted,
        })
    }

    pub async fn run(mut self) -> Result<RingTopology> {
        let result = self.drive().await;
        let hs = &mut self.handshake;

        match &result {
            Ok(topology) => {
                hs.finish(false);
                tracing::info!(
                    "{}: ring elected on {} links, node {} of {}, canonical {:016x}",
                    hs.ctx.hal.host_label(),
                    topology.link_mask,
                    topology.node_id,
                    topology.ring_size,
                    topology.canonical
                );
            }
            Err(e) => {
                hs.finish(true);
                let store = &hs.ctx.store;
                if let Err(clear) = store
                    .set_canonical(hs.member, 0)
                    .and_then(|_| store.store_members(hs.member, &[]))
                {
                    tracing::error!("{}: failed to clear ring identity: {}", hs.ctx.hal.host_label(), clear);
                }
                tracing::warn!(
                    "{}: election failed on {} links: {}",
                    hs.ctx.hal.host_label(),
                    hs.ctx.mask,
                    e
                );
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<RingTopology> {
        let expected = self.handshake.ctx.hal.member_count().saturating_sub(1);
        if self.vetted != expected {
            return Err(Error::VettingIncomplete {
                passed: self.vetted,
                expected,
            });
        }

        let hs = &mut self.handshake;
        let mut phase = ElectPhase::Reset;
        loop {
            hs.ctx.check_deadline("election")?;
            phase = match phase {
                ElectPhase::Reset => {
                    let record = PersistentElectionRecord::new(ElectionStatus::InProgress, hs.ctx.mask);
                    hs.ctx.store.store(hs.member, &record)?;
                    ElectPhase::SamplePeers
                }
                ElectPhase::SamplePeers => {
                    hs.sample_peers().await?;
                    ElectPhase::Publish
                }
                ElectPhase::Publish => {
                    hs.publish()?;
                    ElectPhase::ConfirmPeers
                }
                ElectPhase::ConfirmPeers => {
                    hs.confirm_peers().await?;
                    ElectPhase::Compute
                }
                ElectPhase::Compute => ElectPhase::Settle(Self::compute(hs)?),
                ElectPhase::Settle(topology) => {
                    hs.ctx.store.set_canonical(hs.member, topology.canonical)?;
                    hs.ctx.store.store_members(hs.member, &topology.members)?;
                    let record =
                        PersistentElectionRecord::success(topology.link_mask, topology.node_id, topology.ring_size);
                    let outcomes = hs.settle(&record).await?;
                    require_peer_success(&outcomes)?;
                    ElectPhase::Done(topology)
                }
                ElectPhase::Done(topology) => return Ok(topology),
            };
        }
    }

    fn compute(hs: &Handshake<'_>) -> Result<RingTopology> {
        let mask = hs.ctx.mask;
        let own = hs.own_serial;
        let left = hs.sample.serial(Direction::Left).unwrap_or(0);
        let right = hs.sample.serial(Direction::Right).unwrap_or(0);

        let diagonal = if mask == LinkMask::BOTH {
            let view = hs.sample.view(Direction::Left).ok_or_else(|| {
                Error::Internal("LEFT peer view missing after confirmation".into())
            })?;
            // Taken on the LEFT peer's word alone; vetting already proved its wiring.
            let diagonal = view.right;
            check_diagonal(own, left, right, diagonal)?;
            diagonal
        } else {
            0
        };

        let position = compute_position(own, left, right, diagonal, mask);
        Ok(RingTopology {
            node_id: position.node_id,
            ring_size: position.ring_size,
            canonical: position.canonical,
            link_mask: mask,
            members: member_table(&position, own, left, right, diagonal),
            serial: own,
        })
    }
}

/// Consistency of the diagonal serial learned through the LEFT peer
fn check_diagonal(own: u64, left: u64, right: u64, diagonal: u64) -> Result<()> {
    let consistent = if left == right {
        // Two hosts wired on both links: the LEFT peer's RIGHT neighbor is us.
        diagonal == own
    } else {
        diagonal != 0 && diagonal != own && diagonal != left && diagonal != right
    };
    if consistent {
        Ok(())
    } else {
        Err(Error::WiringFault {
            direction: Direction::Left,
            reason: format!("inconsistent diagonal serial {:#x}", diagonal),
        })
    }
}
