//! Hardware Abstraction
//!
//! The election protocol only ever touches hardware through [`DeviceHal`]:
//! 32-bit scratch register access on local devices, a tiny DMA queue API used
//! to copy bytes out of a neighbor's exposed scratch region, and two
//! collaborator signals (reset completion, core ownership). Each hardware
//! generation provides one implementation, selected once at start-up and held
//! as an `Arc<dyn DeviceHal>`.

pub mod regs;
pub mod sim;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::Result;

pub use sim::{SimFabric, SimFabricBuilder, SimHostHal};

/// Physical link direction of a device inside its ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    /// Both directions, in processing order
    pub const ALL: [Direction; 2] = [Direction::Left, Direction::Right];

    /// Bit used for this direction inside a [`LinkMask`]
    pub const fn bit(self) -> u8 {
        match self {
            Direction::Left => 0b01,
            Direction::Right => 0b10,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Left => write!(f, "LEFT"),
            Direction::Right => write!(f, "RIGHT"),
        }
    }
}

/// One of the two redundant physical lanes wired for every direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lane(u8);

impl Lane {
    pub const A: Lane = Lane(0);
    pub const B: Lane = Lane(1);
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lane{}", self.0)
    }
}

/// Set of link directions taking part in an election attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkMask(u8);

impl LinkMask {
    pub const NONE: LinkMask = LinkMask(0);
    pub const LEFT: LinkMask = LinkMask(0b01);
    pub const RIGHT: LinkMask = LinkMask(0b10);
    pub const BOTH: LinkMask = LinkMask(0b11);

    /// Full attempt first, then the lame-duck single-link fallbacks.
    const SEQUENCE: [LinkMask; 3] = [LinkMask::BOTH, LinkMask::RIGHT, LinkMask::LEFT];

    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !0b11 == 0 {
            Some(LinkMask(bits))
        } else {
            None
        }
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, direction: Direction) -> bool {
        self.0 & direction.bit() != 0
    }

    /// Active directions, LEFT before RIGHT
    pub fn directions(self) -> impl Iterator<Item = Direction> {
        Direction::ALL.into_iter().filter(move |d| self.contains(*d))
    }

    /// The only active direction, if exactly one is active
    pub fn single_direction(self) -> Option<Direction> {
        match self {
            LinkMask::LEFT => Some(Direction::Left),
            LinkMask::RIGHT => Some(Direction::Right),
            _ => None,
        }
    }

    /// Masks tried by the coordinator, in order.
    ///
    /// With `single_link` the full-ring attempt is skipped.
    pub fn retry_sequence(single_link: bool) -> &'static [LinkMask] {
        if single_link {
            &Self::SEQUENCE[1..]
        } else {
            &Self::SEQUENCE
        }
    }

    /// Position of this mask in the retry sequence; later stages compare greater.
    pub fn stage(self) -> Option<usize> {
        Self::SEQUENCE.iter().position(|m| *m == self)
    }
}

impl std::fmt::Display for LinkMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            LinkMask::NONE => write!(f, "none"),
            LinkMask::LEFT => write!(f, "left"),
            LinkMask::RIGHT => write!(f, "right"),
            _ => write!(f, "left+right"),
        }
    }
}

/// Handle of a DMA queue acquired for one (member, direction, lane)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub u64);

/// Work item submitted to a DMA queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    /// Copy `len` bytes of the neighbor's exposed scratch region into the
    /// queue's local landing buffer
    CopyFromPeer {
        remote_offset: usize,
        local_offset: usize,
        len: usize,
    },
    /// Write a completion value into the landing buffer once every earlier
    /// descriptor has completed
    WriteFlag { local_offset: usize, value: u32 },
}

/// Per-generation hardware access used by the election protocol.
///
/// `member` always indexes a device on this host, `0..member_count()`.
pub trait DeviceHal: Send + Sync {
    /// Short name of the hardware generation, for logs
    fn generation(&self) -> &str;

    /// Host position label, for logs
    fn host_label(&self) -> String;

    /// Number of local ring members (devices) on this host
    fn member_count(&self) -> usize;

    /// Member that runs the primary election; every other member is vetted
    fn primary_member(&self) -> usize {
        0
    }

    /// Immutable device serial number
    fn serial_number(&self, member: usize) -> Result<u64>;

    /// Read one 32-bit word of the member's own scratch region
    fn scratch_read(&self, member: usize, offset: usize) -> Result<u32>;

    /// Write one 32-bit word of the member's own scratch region
    fn scratch_write(&self, member: usize, offset: usize, value: u32) -> Result<()>;

    /// Allocate a DMA queue towards the neighbor in `direction` over `lane`
    fn dma_acquire(&self, member: usize, direction: Direction, lane: Lane) -> Result<QueueId>;

    /// Return a queue obtained from [`DeviceHal::dma_acquire`]
    fn dma_release(&self, queue: QueueId);

    /// Submit descriptors; completion is observed through the landing buffer
    fn dma_submit(&self, queue: QueueId, descriptors: &[Descriptor]) -> Result<()>;

    /// Read back bytes from the queue's local landing buffer
    fn dma_buffer_read(&self, queue: QueueId, offset: usize, len: usize) -> Result<Bytes>;

    /// Zero the queue's local landing buffer
    fn dma_buffer_clear(&self, queue: QueueId) -> Result<()>;

    /// Whether every local member finished device reset successfully
    fn all_members_reset(&self) -> bool;

    /// Compute cores currently owned by user processes
    fn owned_core_count(&self) -> usize;

    /// Subscribe to owned-core count changes
    fn subscribe_core_count(&self) -> watch::Receiver<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_mask_directions() {
        assert_eq!(LinkMask::BOTH.directions().collect::<Vec<_>>(), vec![Direction::Left, Direction::Right]);
        assert_eq!(LinkMask::RIGHT.single_direction(), Some(Direction::Right));
        assert_eq!(LinkMask::BOTH.single_direction(), None);
        assert!(LinkMask::from_bits(0b100).is_none());
        assert!(LinkMask::NONE.directions().next().is_none());
    }

    #[test]
    fn test_retry_sequence_order() {
        assert_eq!(
            LinkMask::retry_sequence(false),
            &[LinkMask::BOTH, LinkMask::RIGHT, LinkMask::LEFT]
        );
        assert_eq!(LinkMask::retry_sequence(true), &[LinkMask::RIGHT, LinkMask::LEFT]);
        assert!(LinkMask::BOTH.stage() < LinkMask::RIGHT.stage());
        assert!(LinkMask::RIGHT.stage() < LinkMask::LEFT.stage());
        assert_eq!(LinkMask::NONE.stage(), None);
    }
}
