//! Exposed scratch region layout.
//!
//! Every device exposes one small scratch region to its ring neighbors. The
//! region is non-volatile across driver reloads. Offsets are in bytes; all
//! multi-word values are little-endian.
//!
//! ```text
//! 0x00  serial number        u64   mirrored by hardware, read-only
//! 0x08  election record word u32   status | link mask | node id | ring size
//! 0x10  canonical serial     u64
//! 0x18  neighbor LEFT        u64   serial seen on the LEFT link
//! 0x20  neighbor RIGHT       u64   serial seen on the RIGHT link
//! 0x28  neighbor mask        u32   link mask of the attempt that published 0x18..0x28
//! 0x30  member table         4 x u64, indexed by node id
//! ```

/// Hardware mirror of the device serial number
pub const SERIAL: usize = 0x00;

/// Packed election record word
pub const RECORD_WORD: usize = 0x08;

/// Canonical ring serial
pub const CANONICAL: usize = 0x10;

/// Start of the neighbor-visible election data block
pub const NEIGHBOR_BASE: usize = 0x18;

/// Serial observed on the LEFT link
pub const NEIGHBOR_LEFT: usize = 0x18;

/// Serial observed on the RIGHT link
pub const NEIGHBOR_RIGHT: usize = 0x20;

/// Link mask of the attempt that published the neighbor block; zero when erased
pub const NEIGHBOR_MASK: usize = 0x28;

/// Neighbor block length as read by peers, padded to 8 bytes
pub const NEIGHBOR_BLOCK_LEN: usize = 0x18;

/// Ring member serials by node id
pub const MEMBER_TABLE: usize = 0x30;

/// Entries in the member table
pub const MEMBER_TABLE_LEN: usize = 4;

/// Total size of the exposed region
pub const REGION_SIZE: usize = 0x50;

/// Landing buffer of a DMA queue: data area followed by the completion flag
pub const DMA_DATA_MAX: usize = 0x100;

/// Offset of the completion flag inside the landing buffer
pub const DMA_FLAG_OFFSET: usize = 0x100;

/// Landing buffer size
pub const DMA_BUFFER_SIZE: usize = 0x108;
