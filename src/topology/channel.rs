//! Neighbor Channel
//!
//! Remote reads of a neighbor's exposed scratch region over the DMA
//! transport, and the pacing shared by every wait loop of an election
//! attempt (poll interval, deadline, cancellation, progress logging).

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::record::{NeighborBlock, PersistentElectionRecord, RecordStore};
use crate::config::ElectionSettings;
use crate::error::{Error, Result};
use crate::hal::{regs, Descriptor, DeviceHal, Direction, Lane, LinkMask, QueueId};

/// Sleep between completion-flag checks of one DMA read
const FLAG_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Timing knobs of the protocol
#[derive(Debug, Clone, Copy)]
pub struct ProtocolTiming {
    pub poll_interval: Duration,
    pub dma_timeout: Duration,
    pub dma_retries: u32,
    pub progress_every: u32,
}

impl From<&ElectionSettings> for ProtocolTiming {
    fn from(settings: &ElectionSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            dma_timeout: settings.dma_timeout(),
            dma_retries: settings.dma_retries.max(1),
            progress_every: settings.progress_log_every.max(1),
        }
    }
}

/// Everything one election attempt shares across members
#[derive(Clone)]
pub struct AttemptContext {
    pub hal: Arc<dyn DeviceHal>,
    pub store: RecordStore,
    pub mask: LinkMask,
    pub deadline: Instant,
    pub cancel: CancellationToken,
    pub timing: ProtocolTiming,
    /// Directions with injected faults
    pub faulted: LinkMask,
    pub verbose: bool,
}

/// Where a peer's published state sits relative to our attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStage {
    /// Nothing published yet, or left over from an earlier stage
    Behind,
    /// Same attempt as ours
    Current,
    /// Peer already gave up on our attempt
    Ahead,
}

impl AttemptContext {
    /// Classify data tagged with `theirs` against this attempt's mask
    pub fn peer_stage(&self, theirs: LinkMask) -> PeerStage {
        match theirs.stage().cmp(&self.mask.stage()) {
            Ordering::Less => PeerStage::Behind,
            Ordering::Equal => PeerStage::Current,
            Ordering::Greater => PeerStage::Ahead,
        }
    }

    /// Fail once the attempt's deadline has passed
    pub fn check_deadline(&self, what: &str) -> Result<()> {
        if Instant::now() >= self.deadline {
            return Err(Error::Timeout(what.to_string()));
        }
        Ok(())
    }

    /// One step of a wait loop: deadline check, progress log, cancellable sleep
    pub async fn pause(&self, what: &str, tries: &mut u32) -> Result<()> {
        self.check_deadline(what)?;
        *tries += 1;
        if *tries % self.timing.progress_every == 0 {
            let remaining = self.deadline.saturating_duration_since(Instant::now());
            tracing::info!(
                "{}: still waiting for {} ({} polls, {}s left)",
                self.hal.host_label(),
                what,
                tries,
                remaining.as_secs()
            );
        }
        self.sleep(self.timing.poll_interval).await
    }

    /// Sleep unless cancelled first
    pub async fn sleep(&self, period: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(period) => Ok(()),
        }
    }
}

/// DMA queue towards one neighbor over one lane
pub struct NeighborChannel {
    hal: Arc<dyn DeviceHal>,
    direction: Direction,
    lane: Lane,
    queue: QueueId,
    sequence: u32,
}

impl NeighborChannel {
    fn open(hal: Arc<dyn DeviceHal>, member: usize, direction: Direction, lane: Lane) -> Result<Self> {
        let queue = hal.dma_acquire(member, direction, lane)?;
        Ok(Self {
            hal,
            direction,
            lane,
            queue,
            sequence: 0,
        })
    }

    /// Copy `len` bytes at `offset` of the neighbor's region
    pub async fn read_remote(
        &mut self,
        offset: usize,
        len: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        if len > regs::DMA_DATA_MAX {
            return Err(Error::Internal(format!("remote read of {} bytes is too large", len)));
        }

        self.sequence = self.sequence.wrapping_add(1).max(1);
        self.hal.dma_buffer_clear(self.queue)?;
        self.hal.dma_submit(
            self.queue,
            &[
                Descriptor::CopyFromPeer {
                    remote_offset: offset,
                    local_offset: 0,
                    len,
                },
                Descriptor::WriteFlag {
                    local_offset: regs::DMA_FLAG_OFFSET,
                    value: self.sequence,
                },
            ],
        )?;

        let started = Instant::now();
        loop {
            let flag = self.hal.dma_buffer_read(self.queue, regs::DMA_FLAG_OFFSET, 4)?;
            if LittleEndian::read_u32(&flag) == self.sequence {
                return self.hal.dma_buffer_read(self.queue, 0, len);
            }
            if started.elapsed() >= timeout {
                return Err(Error::Timeout(format!(
                    "{} {} read at {:#x}",
                    self.direction, self.lane, offset
                )));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(FLAG_POLL_INTERVAL) => {}
            }
        }
    }
}

impl Drop for NeighborChannel {
    fn drop(&mut self) {
        self.hal.dma_release(self.queue);
    }
}

/// Both lanes of every active direction for one member.
///
/// Queues are released when the set is dropped, on every exit path.
pub struct ChannelSet {
    ctx: AttemptContext,
    member: usize,
    channels: Vec<(Direction, [NeighborChannel; 2])>,
}

impl ChannelSet {
    pub fn acquire(ctx: &AttemptContext, member: usize) -> Result<Self> {
        let mut channels = Vec::with_capacity(2);
        for direction in ctx.mask.directions() {
            let a = NeighborChannel::open(Arc::clone(&ctx.hal), member, direction, Lane::A)?;
            let b = NeighborChannel::open(Arc::clone(&ctx.hal), member, direction, Lane::B)?;
            channels.push((direction, [a, b]));
        }
        Ok(Self {
            ctx: ctx.clone(),
            member,
            channels,
        })
    }

    /// Read over one lane, retrying timeouts
    async fn read_lane(
        ctx: &AttemptContext,
        channel: &mut NeighborChannel,
        offset: usize,
        len: usize,
    ) -> Result<Bytes> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match channel.read_remote(offset, len, ctx.timing.dma_timeout, &ctx.cancel).await {
                Err(Error::Timeout(what)) if attempt < ctx.timing.dma_retries => {
                    tracing::debug!("Retrying {} (attempt {})", what, attempt);
                }
                other => return other,
            }
        }
    }

    /// Read the same bytes over both lanes of `direction`; they must agree
    pub async fn read_verified(&mut self, direction: Direction, offset: usize, len: usize) -> Result<Bytes> {
        if self.ctx.faulted.contains(direction) {
            return Err(Error::WiringFault {
                direction,
                reason: "link fault injected by configuration".into(),
            });
        }

        let ctx = &self.ctx;
        let member = self.member;
        let (_, lanes) = self
            .channels
            .iter_mut()
            .find(|(d, _)| *d == direction)
            .ok_or_else(|| Error::Internal(format!("{} link is not part of this attempt", direction)))?;

        let [lane_a, lane_b] = lanes;
        let first = Self::read_lane(ctx, lane_a, offset, len).await?;
        let second = Self::read_lane(ctx, lane_b, offset, len).await?;

        if ctx.verbose {
            tracing::debug!(
                "{} member {}: {} read at {:#x} -> {:02x?}",
                ctx.hal.host_label(),
                member,
                direction,
                offset,
                &first[..]
            );
        }

        if first != second {
            return Err(Error::WiringFault {
                direction,
                reason: format!(
                    "redundant lanes disagree at {:#x} ({:02x?} vs {:02x?})",
                    offset,
                    &first[..],
                    &second[..]
                ),
            });
        }
        Ok(first)
    }

    /// Peer serial number
    pub async fn read_serial(&mut self, direction: Direction) -> Result<u64> {
        let bytes = self.read_verified(direction, regs::SERIAL, 8).await?;
        Ok(LittleEndian::read_u64(&bytes))
    }

    /// Peer's published neighbor block
    pub async fn read_neighbors(&mut self, direction: Direction) -> Result<NeighborBlock> {
        let bytes = self
            .read_verified(direction, regs::NEIGHBOR_BASE, regs::NEIGHBOR_BLOCK_LEN)
            .await?;
        NeighborBlock::from_bytes(&bytes)
    }

    /// Peer's persisted record word
    pub async fn read_record(&mut self, direction: Direction) -> Result<PersistentElectionRecord> {
        let bytes = self.read_verified(direction, regs::RECORD_WORD, 4).await?;
        Ok(PersistentElectionRecord::decode(LittleEndian::read_u32(&bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SimFabric;

    fn context(fabric: &SimFabric, host: usize, mask: LinkMask) -> AttemptContext {
        let hal: Arc<dyn DeviceHal> = fabric.host(host);
        AttemptContext {
            store: RecordStore::new(Arc::clone(&hal)),
            hal,
            mask,
            deadline: Instant::now() + Duration::from_secs(5),
            cancel: CancellationToken::new(),
            timing: ProtocolTiming {
                poll_interval: Duration::from_millis(2),
                dma_timeout: Duration::from_millis(20),
                dma_retries: 2,
                progress_every: 10,
            },
            faulted: LinkMask::NONE,
            verbose: true,
        }
    }

    fn fabric() -> SimFabric {
        SimFabric::builder()
            .hosts(4)
            .members(2)
            .serials(|h, m| 0x1000 + (h * 16 + m) as u64)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_reads_peer_serial_over_both_lanes() {
        let fabric = fabric();
        let ctx = context(&fabric, 0, LinkMask::BOTH);
        let mut channels = ChannelSet::acquire(&ctx, 1).unwrap();
        assert_eq!(fabric.open_queues(), 4);

        assert_eq!(channels.read_serial(Direction::Left).await.unwrap(), 0x1011);
        assert_eq!(channels.read_serial(Direction::Right).await.unwrap(), 0x1031);

        drop(channels);
        assert_eq!(fabric.open_queues(), 0);
    }

    #[tokio::test]
    async fn test_lane_mismatch_is_wiring_fault() {
        let fabric = fabric();
        fabric.corrupt_lane(0, 0, Direction::Right, Lane::B);
        let ctx = context(&fabric, 0, LinkMask::BOTH);
        let mut channels = ChannelSet::acquire(&ctx, 0).unwrap();

        let err = channels.read_serial(Direction::Right).await.unwrap_err();
        assert!(matches!(err, Error::WiringFault { direction: Direction::Right, .. }));
        assert!(channels.read_serial(Direction::Left).await.is_ok());
    }

    #[tokio::test]
    async fn test_dead_link_times_out() {
        let fabric = fabric();
        fabric.cut_link(2, Direction::Left);
        let ctx = context(&fabric, 3, LinkMask::LEFT);
        let mut channels = ChannelSet::acquire(&ctx, 0).unwrap();

        let err = channels.read_serial(Direction::Left).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_injected_fault() {
        let fabric = fabric();
        let mut ctx = context(&fabric, 1, LinkMask::BOTH);
        ctx.faulted = LinkMask::LEFT;
        let mut channels = ChannelSet::acquire(&ctx, 0).unwrap();

        let err = channels.read_serial(Direction::Left).await.unwrap_err();
        assert!(matches!(err, Error::WiringFault { direction: Direction::Left, .. }));
    }

    #[tokio::test]
    async fn test_inactive_direction_is_rejected() {
        let fabric = fabric();
        let ctx = context(&fabric, 0, LinkMask::RIGHT);
        let mut channels = ChannelSet::acquire(&ctx, 0).unwrap();
        assert!(matches!(
            channels.read_serial(Direction::Left).await,
            Err(Error::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_honours_cancel_and_deadline() {
        let fabric = fabric();
        let ctx = context(&fabric, 0, LinkMask::BOTH);
        let mut tries = 0;
        ctx.cancel.cancel();
        assert!(matches!(ctx.pause("peer", &mut tries).await, Err(Error::Cancelled)));

        let mut ctx = context(&fabric, 0, LinkMask::BOTH);
        ctx.deadline = Instant::now();
        assert!(matches!(ctx.pause("peer", &mut tries).await, Err(Error::Timeout(_))));
    }

    #[test]
    fn test_peer_stage_ordering() {
        let fabric = fabric();
        let ctx = context(&fabric, 0, LinkMask::RIGHT);
        assert_eq!(ctx.peer_stage(LinkMask::NONE), PeerStage::Behind);
        assert_eq!(ctx.peer_stage(LinkMask::BOTH), PeerStage::Behind);
        assert_eq!(ctx.peer_stage(LinkMask::RIGHT), PeerStage::Current);
        assert_eq!(ctx.peer_stage(LinkMask::LEFT), PeerStage::Ahead);
    }
}
