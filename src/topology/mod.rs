//! Topology Election Module
//!
//! Decentralized agreement of the ring members on healthy links, node ids,
//! ring size and the canonical ring serial, plus the operating-mode layer
//! built on top of the elected ring.

mod channel;
mod record;
mod vetting;
pub mod election;
pub mod mode;
pub mod coordinator;

pub use channel::{AttemptContext, NeighborChannel, ProtocolTiming};
pub use record::{ElectionStatus, NeighborBlock, PersistentElectionRecord, RecordStore};
pub use vetting::{NeighborSample, VettingProtocol};
pub use election::{compute_position, PrimaryElection, RingPosition, RingTopology};
pub use mode::{ModeNegotiator, OperatingMode};
pub use coordinator::{Attributes, ControlState, ElectionCoordinator, ElectionHandle, StatusReport};
