//! Vetting Protocol
//!
//! Every non-primary ring member proves its wiring before the primary
//! computes the topology. The direct-neighbor handshake implemented here is
//! shared with the primary election:
//!
//! 1. read each active peer's serial over both lanes
//! 2. publish what we saw, tagged with the attempt's link mask
//! 3. wait for each peer's block and check it names us back
//! 4. persist our own outcome and wait for each peer's outcome
//!
//! Whatever happens, the published block and the sampled peer data are gone
//! when the handshake ends.

use super::channel::{AttemptContext, ChannelSet, PeerStage};
use super::record::{ElectionStatus, NeighborBlock, PersistentElectionRecord};
use crate::error::{Error, Result};
use crate::hal::Direction;

/// What one attempt learned about a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerObservation {
    /// Serial read directly over the link
    pub serial: u64,
    /// The peer's own published neighbor block, once confirmed
    pub view: Option<NeighborBlock>,
}

/// Per-attempt peer data keyed by direction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NeighborSample {
    left: Option<PeerObservation>,
    right: Option<PeerObservation>,
}

impl NeighborSample {
    fn slot(&mut self, direction: Direction) -> &mut Option<PeerObservation> {
        match direction {
            Direction::Left => &mut self.left,
            Direction::Right => &mut self.right,
        }
    }

    pub fn get(&self, direction: Direction) -> Option<&PeerObservation> {
        match direction {
            Direction::Left => self.left.as_ref(),
            Direction::Right => self.right.as_ref(),
        }
    }

    pub fn serial(&self, direction: Direction) -> Option<u64> {
        self.get(direction).map(|o| o.serial)
    }

    pub fn view(&self, direction: Direction) -> Option<NeighborBlock> {
        self.get(direction).and_then(|o| o.view)
    }

    fn record_serial(&mut self, direction: Direction, serial: u64) {
        *self.slot(direction) = Some(PeerObservation { serial, view: None });
    }

    fn record_view(&mut self, direction: Direction, view: NeighborBlock) {
        if let Some(observation) = self.slot(direction) {
            observation.view = Some(view);
        }
    }

    pub fn clear(&mut self) {
        self.left = None;
        self.right = None;
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

/// Direct-neighbor handshake of one member for one attempt
pub struct Handshake<'a> {
    pub(crate) ctx: &'a AttemptContext,
    pub(crate) member: usize,
    pub(crate) own_serial: u64,
    pub(crate) channels: ChannelSet,
    pub(crate) sample: NeighborSample,
}

impl<'a> Handshake<'a> {
    /// Acquire the member's channels for this attempt
    pub fn begin(ctx: &'a AttemptContext, member: usize) -> Result<Self> {
        let own_serial = ctx.hal.serial_number(member)?;
        let channels = ChannelSet::acquire(ctx, member)?;
        Ok(Self {
            ctx,
            member,
            own_serial,
            channels,
            sample: NeighborSample::default(),
        })
    }

    fn label(&self) -> String {
        format!("{} member {}", self.ctx.hal.host_label(), self.member)
    }

    /// Read every active peer's serial
    pub async fn sample_peers(&mut self) -> Result<()> {
        for direction in self.ctx.mask.directions() {
            let serial = self.channels.read_serial(direction).await?;
            if serial == 0 || serial == self.own_serial {
                return Err(Error::WiringFault {
                    direction,
                    reason: format!("peer serial reads {:#x}", serial),
                });
            }
            self.sample.record_serial(direction, serial);
        }
        Ok(())
    }

    /// Make our view of the links visible to the peers
    pub fn publish(&self) -> Result<()> {
        let block = NeighborBlock {
            left: self.sample.serial(Direction::Left).unwrap_or(0),
            right: self.sample.serial(Direction::Right).unwrap_or(0),
            link_mask: self.ctx.mask,
        };
        self.ctx.store.publish_neighbors(self.member, &block)
    }

    /// Wait for every peer's block and require that it names us
    pub async fn confirm_peers(&mut self) -> Result<()> {
        for direction in self.ctx.mask.directions() {
            let block = self.await_block(direction).await?;
            let seen = block.get(direction);
            if seen != self.own_serial {
                return Err(Error::WiringFault {
                    direction,
                    reason: format!(
                        "peer sees {:#x} on its {} link, expected {:#x}",
                        seen, direction, self.own_serial
                    ),
                });
            }
            self.sample.record_view(direction, block);
        }
        Ok(())
    }

    async fn await_block(&mut self, direction: Direction) -> Result<NeighborBlock> {
        let what = format!("{} peer election data of {}", direction, self.label());
        let mut tries = 0;
        loop {
            let block = self.channels.read_neighbors(direction).await?;
            match self.ctx.peer_stage(block.link_mask) {
                PeerStage::Current => return Ok(block),
                PeerStage::Ahead => return Err(Error::PeerReportedFailure { direction }),
                PeerStage::Behind => {
                    // A peer that already failed this attempt will never publish.
                    let record = self.channels.read_record(direction).await?;
                    if record.status == ElectionStatus::Failure
                        && self.ctx.peer_stage(record.link_mask) == PeerStage::Current
                    {
                        return Err(Error::PeerReportedFailure { direction });
                    }
                }
            }
            self.ctx.pause(&what, &mut tries).await?;
        }
    }

    /// Persist our record, then wait for every peer's outcome of this attempt
    pub async fn settle(
        &mut self,
        record: &PersistentElectionRecord,
    ) -> Result<Vec<(Direction, PersistentElectionRecord)>> {
        self.ctx.store.store(self.member, record)?;

        let mut outcomes = Vec::with_capacity(2);
        for direction in self.ctx.mask.directions() {
            let what = format!("{} peer status of {}", direction, self.label());
            let mut tries = 0;
            loop {
                let peer = self.channels.read_record(direction).await?;
                match self.ctx.peer_stage(peer.link_mask) {
                    PeerStage::Ahead => return Err(Error::PeerReportedFailure { direction }),
                    PeerStage::Current if peer.status.is_terminal() => {
                        outcomes.push((direction, peer));
                        break;
                    }
                    _ => {}
                }
                self.ctx.pause(&what, &mut tries).await?;
            }
        }
        Ok(outcomes)
    }

    /// Drop the sample and published block; persist FAILURE if the attempt failed
    pub fn finish(&mut self, failed: bool) {
        self.sample.clear();
        if let Err(e) = self.ctx.store.erase_neighbors(self.member) {
            tracing::error!("{}: failed to erase election data: {}", self.label(), e);
        }
        if failed {
            let record = PersistentElectionRecord::new(ElectionStatus::Failure, self.ctx.mask);
            if let Err(e) = self.ctx.store.store(self.member, &record) {
                tracing::error!("{}: failed to persist FAILURE: {}", self.label(), e);
            }
        }
    }
}

/// Require SUCCESS from every peer outcome
pub fn require_peer_success(outcomes: &[(Direction, PersistentElectionRecord)]) -> Result<()> {
    match outcomes
        .iter()
        .find(|(_, record)| record.status != ElectionStatus::Success)
    {
        Some((direction, _)) => Err(Error::PeerReportedFailure { direction: *direction }),
        None => Ok(()),
    }
}

/// Phases of a subordinate's vetting
#[derive(Debug)]
enum VetPhase {
    Reset,
    SamplePeers,
    Publish,
    ConfirmPeers,
    Settle,
    Evaluate(Vec<(Direction, PersistentElectionRecord)>),
    Passed,
}

/// Wiring check run by a non-primary member
pub struct VettingProtocol<'a> {
    handshake: Handshake<'a>,
}

impl<'a> VettingProtocol<'a> {
    pub fn new(ctx: &'a AttemptContext, member: usize) -> Result<Self> {
        Ok(Self {
            handshake: Handshake::begin(ctx, member)?,
        })
    }

    /// Run to completion; `Ok` means the member passed
    pub async fn run(mut self) -> Result<()> {
        let result = self.drive().await;
        self.handshake.finish(result.is_err());

        let label = self.handshake.label();
        match &result {
            Ok(()) => tracing::debug!("{}: vetting passed on {} links", label, self.handshake.ctx.mask),
            Err(e) => tracing::warn!("{}: vetting failed on {} links: {}", label, self.handshake.ctx.mask, e),
        }
        result
    }

    async fn drive(&mut self) -> Result<()> {
        let hs = &mut self.handshake;
        let mut phase = VetPhase::Reset;
        loop {
            hs.ctx.check_deadline("vetting")?;
            phase = match phase {
                VetPhase::Reset => {
                    let record = PersistentElectionRecord::new(ElectionStatus::Init, hs.ctx.mask);
                    hs.ctx.store.store(hs.member, &record)?;
                    VetPhase::SamplePeers
                }
                VetPhase::SamplePeers => {
                    hs.sample_peers().await?;
                    VetPhase::Publish
                }
                VetPhase::Publish => {
                    hs.publish()?;
                    VetPhase::ConfirmPeers
                }
                VetPhase::ConfirmPeers => {
                    hs.confirm_peers().await?;
                    VetPhase::Settle
                }
                VetPhase::Settle => {
                    let record = PersistentElectionRecord::new(ElectionStatus::Success, hs.ctx.mask);
                    VetPhase::Evaluate(hs.settle(&record).await?)
                }
                VetPhase::Evaluate(outcomes) => {
                    require_peer_success(&outcomes)?;
                    VetPhase::Passed
                }
                VetPhase::Passed => return Ok(()),
            };
        }
    }
}
