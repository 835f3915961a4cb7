//! Persistent Election Record
//!
//! Election state that lives in each device's own scratch region and
//! therefore survives driver reload: a packed status word, the canonical
//! ring serial, the neighbor-visible election data and the ring member table.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hal::{regs, DeviceHal, Direction, LinkMask};

/// Marks a record word as written by this driver
const RECORD_MAGIC: u32 = 0x5A;

const STATUS_MASK: u32 = 0xf;
const LINK_SHIFT: u32 = 4;
const LINK_MASK: u32 = 0x3;
const NODE_SHIFT: u32 = 8;
const NODE_MASK: u32 = 0xf;
const RING_SHIFT: u32 = 12;
const RING_MASK: u32 = 0xf;
const MAGIC_SHIFT: u32 = 24;

/// Encoded node id meaning "no id assigned"
pub const NODE_ID_UNASSIGNED: u8 = 0xf;

/// Election status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElectionStatus {
    /// No election has run since load
    Init,
    /// An election attempt is running
    InProgress,
    /// The ring agreed on a topology
    Success,
    /// The last election failed or was cancelled
    Failure,
}

impl ElectionStatus {
    fn code(self) -> u32 {
        match self {
            ElectionStatus::Init => 0,
            ElectionStatus::InProgress => 1,
            ElectionStatus::Success => 2,
            ElectionStatus::Failure => 3,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(ElectionStatus::Init),
            1 => Some(ElectionStatus::InProgress),
            2 => Some(ElectionStatus::Success),
            3 => Some(ElectionStatus::Failure),
            _ => None,
        }
    }

    /// Whether the status is an outcome rather than a pending state
    pub fn is_terminal(self) -> bool {
        matches!(self, ElectionStatus::Success | ElectionStatus::Failure)
    }
}

impl std::fmt::Display for ElectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionStatus::Init => write!(f, "INIT"),
            ElectionStatus::InProgress => write!(f, "IN_PROGRESS"),
            ElectionStatus::Success => write!(f, "SUCCESS"),
            ElectionStatus::Failure => write!(f, "FAILURE"),
        }
    }
}

/// The packed status word of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentElectionRecord {
    pub status: ElectionStatus,
    pub link_mask: LinkMask,
    node_id: Option<u8>,
    pub ring_size: u8,
}

impl Default for PersistentElectionRecord {
    fn default() -> Self {
        Self::new(ElectionStatus::Init, LinkMask::NONE)
    }
}

impl PersistentElectionRecord {
    /// Record without node assignment
    pub fn new(status: ElectionStatus, link_mask: LinkMask) -> Self {
        Self {
            status,
            link_mask,
            node_id: None,
            ring_size: 0,
        }
    }

    /// Successful record carrying the elected position
    pub fn success(link_mask: LinkMask, node_id: u8, ring_size: u8) -> Self {
        Self {
            status: ElectionStatus::Success,
            link_mask,
            node_id: Some(node_id),
            ring_size,
        }
    }

    /// Node id, only meaningful while the status is SUCCESS
    pub fn node_id(&self) -> Option<u8> {
        match self.status {
            ElectionStatus::Success => self.node_id,
            _ => None,
        }
    }

    /// Pack into the 32-bit record word
    pub fn encode(&self) -> u32 {
        let node = u32::from(self.node_id.unwrap_or(NODE_ID_UNASSIGNED)) & NODE_MASK;
        (RECORD_MAGIC << MAGIC_SHIFT)
            | (u32::from(self.ring_size) & RING_MASK) << RING_SHIFT
            | node << NODE_SHIFT
            | (u32::from(self.link_mask.bits()) & LINK_MASK) << LINK_SHIFT
            | self.status.code()
    }

    /// Unpack a record word; words not written by this driver read as INIT
    pub fn decode(word: u32) -> Self {
        if word >> MAGIC_SHIFT != RECORD_MAGIC {
            return Self::default();
        }
        let Some(status) = ElectionStatus::from_code(word & STATUS_MASK) else {
            return Self::default();
        };
        let node = ((word >> NODE_SHIFT) & NODE_MASK) as u8;
        Self {
            status,
            link_mask: LinkMask::from_bits(((word >> LINK_SHIFT) & LINK_MASK) as u8).unwrap_or_default(),
            node_id: (node != NODE_ID_UNASSIGNED).then_some(node),
            ring_size: ((word >> RING_SHIFT) & RING_MASK) as u8,
        }
    }
}

/// Neighbor-visible election data published by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NeighborBlock {
    /// Serial seen on the LEFT link (0 = none)
    pub left: u64,
    /// Serial seen on the RIGHT link (0 = none)
    pub right: u64,
    /// Mask of the attempt that published the block; empty when erased
    pub link_mask: LinkMask,
}

impl NeighborBlock {
    /// Parse the block as laid out at [`regs::NEIGHBOR_BASE`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < regs::NEIGHBOR_BLOCK_LEN {
            return Err(Error::Hal("neighbor block too short".into()));
        }
        let mask = LittleEndian::read_u32(&bytes[0x10..0x14]);
        Ok(Self {
            left: LittleEndian::read_u64(&bytes[0x00..0x08]),
            right: LittleEndian::read_u64(&bytes[0x08..0x10]),
            link_mask: LinkMask::from_bits((mask & LINK_MASK) as u8).unwrap_or_default(),
        })
    }

    /// Serial recorded for `direction`
    pub fn get(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Left => self.left,
            Direction::Right => self.right,
        }
    }

    pub fn is_erased(&self) -> bool {
        self.left == 0 && self.right == 0 && self.link_mask.is_empty()
    }
}

/// Scratch-register persistence for the devices of one host
#[derive(Clone)]
pub struct RecordStore {
    hal: Arc<dyn DeviceHal>,
}

impl RecordStore {
    pub fn new(hal: Arc<dyn DeviceHal>) -> Self {
        Self { hal }
    }

    fn read_u64(&self, member: usize, offset: usize) -> Result<u64> {
        let lo = self.hal.scratch_read(member, offset)?;
        let hi = self.hal.scratch_read(member, offset + 4)?;
        Ok(u64::from(hi) << 32 | u64::from(lo))
    }

    fn write_u64(&self, member: usize, offset: usize, value: u64) -> Result<()> {
        self.hal.scratch_write(member, offset, value as u32)?;
        self.hal.scratch_write(member, offset + 4, (value >> 32) as u32)
    }

    /// Read the record word of `member`
    pub fn load(&self, member: usize) -> Result<PersistentElectionRecord> {
        Ok(PersistentElectionRecord::decode(
            self.hal.scratch_read(member, regs::RECORD_WORD)?,
        ))
    }

    /// Write the record word of `member`
    pub fn store(&self, member: usize, record: &PersistentElectionRecord) -> Result<()> {
        self.hal.scratch_write(member, regs::RECORD_WORD, record.encode())
    }

    pub fn canonical(&self, member: usize) -> Result<u64> {
        self.read_u64(member, regs::CANONICAL)
    }

    pub fn set_canonical(&self, member: usize, serial: u64) -> Result<()> {
        self.write_u64(member, regs::CANONICAL, serial)
    }

    /// Publish what this device sees on its links; the mask goes last so a
    /// reader never sees a tagged block with stale serials
    pub fn publish_neighbors(&self, member: usize, block: &NeighborBlock) -> Result<()> {
        self.write_u64(member, regs::NEIGHBOR_LEFT, block.left)?;
        self.write_u64(member, regs::NEIGHBOR_RIGHT, block.right)?;
        self.hal
            .scratch_write(member, regs::NEIGHBOR_MASK, u32::from(block.link_mask.bits()))
    }

    /// Erase the neighbor-visible data, mask first
    pub fn erase_neighbors(&self, member: usize) -> Result<()> {
        self.hal.scratch_write(member, regs::NEIGHBOR_MASK, 0)?;
        self.write_u64(member, regs::NEIGHBOR_LEFT, 0)?;
        self.write_u64(member, regs::NEIGHBOR_RIGHT, 0)
    }

    /// Local view of the published neighbor block
    pub fn neighbors(&self, member: usize) -> Result<NeighborBlock> {
        let mask = self.hal.scratch_read(member, regs::NEIGHBOR_MASK)?;
        Ok(NeighborBlock {
            left: self.read_u64(member, regs::NEIGHBOR_LEFT)?,
            right: self.read_u64(member, regs::NEIGHBOR_RIGHT)?,
            link_mask: LinkMask::from_bits((mask & LINK_MASK) as u8).unwrap_or_default(),
        })
    }

    /// Persist the ring member serials, indexed by node id
    pub fn store_members(&self, member: usize, serials: &[u64]) -> Result<()> {
        for slot in 0..regs::MEMBER_TABLE_LEN {
            let serial = serials.get(slot).copied().unwrap_or(0);
            self.write_u64(member, regs::MEMBER_TABLE + slot * 8, serial)?;
        }
        Ok(())
    }

    /// Ring member serials for a ring of `ring_size`
    pub fn members(&self, member: usize, ring_size: u8) -> Result<Vec<u64>> {
        let count = usize::from(ring_size).min(regs::MEMBER_TABLE_LEN);
        (0..count)
            .map(|slot| self.read_u64(member, regs::MEMBER_TABLE + slot * 8))
            .collect()
    }

    /// Forget everything the previous election left behind
    pub fn clear(&self, member: usize) -> Result<()> {
        self.store(member, &PersistentElectionRecord::default())?;
        self.set_canonical(member, 0)?;
        self.erase_neighbors(member)?;
        self.store_members(member, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SimFabric;

    #[test]
    fn test_record_round_trip() {
        for node_id in 0..=3u8 {
            for ring_size in [2u8, 4] {
                let record = PersistentElectionRecord::success(LinkMask::BOTH, node_id, ring_size);
                let decoded = PersistentElectionRecord::decode(record.encode());
                assert_eq!(decoded, record);
                assert_eq!(decoded.node_id(), Some(node_id));
                assert_eq!(decoded.ring_size, ring_size);
                assert_eq!(decoded.link_mask, LinkMask::BOTH);
            }
        }
    }

    #[test]
    fn test_unwritten_word_is_init() {
        assert_eq!(PersistentElectionRecord::decode(0), PersistentElectionRecord::default());
        assert_eq!(PersistentElectionRecord::decode(0xffff_ffff).status, ElectionStatus::Init);
    }

    #[test]
    fn test_node_id_hidden_unless_success() {
        let mut record = PersistentElectionRecord::success(LinkMask::RIGHT, 1, 2);
        record.status = ElectionStatus::Failure;
        assert_eq!(record.node_id(), None);

        let failed = PersistentElectionRecord::decode(record.encode());
        assert_eq!(failed.status, ElectionStatus::Failure);
        assert_eq!(failed.node_id(), None);
    }

    #[test]
    fn test_status_and_mask_survive_encoding() {
        let record = PersistentElectionRecord::new(ElectionStatus::InProgress, LinkMask::LEFT);
        let decoded = PersistentElectionRecord::decode(record.encode());
        assert_eq!(decoded.status, ElectionStatus::InProgress);
        assert_eq!(decoded.link_mask, LinkMask::LEFT);
        assert_eq!(decoded.node_id(), None);
    }

    #[test]
    fn test_store_publish_and_clear() {
        let fabric = SimFabric::builder().hosts(2).seed(21).build().unwrap();
        let store = RecordStore::new(fabric.host(0));

        store
            .store(0, &PersistentElectionRecord::success(LinkMask::BOTH, 3, 4))
            .unwrap();
        store.set_canonical(0, 0xdead_beef_0000_0001).unwrap();
        store
            .publish_neighbors(
                0,
                &NeighborBlock {
                    left: 11,
                    right: 22,
                    link_mask: LinkMask::BOTH,
                },
            )
            .unwrap();
        store.store_members(0, &[5, 6, 7, 8]).unwrap();

        assert_eq!(store.load(0).unwrap().node_id(), Some(3));
        assert_eq!(store.canonical(0).unwrap(), 0xdead_beef_0000_0001);
        assert_eq!(store.neighbors(0).unwrap().get(Direction::Right), 22);
        assert_eq!(store.members(0, 4).unwrap(), vec![5, 6, 7, 8]);

        store.clear(0).unwrap();
        assert_eq!(store.load(0).unwrap().status, ElectionStatus::Init);
        assert_eq!(store.canonical(0).unwrap(), 0);
        assert!(store.neighbors(0).unwrap().is_erased());
        assert_eq!(store.members(0, 2).unwrap(), vec![0, 0]);
    }
}
