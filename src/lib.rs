//! RingTopo - Accelerator Ring Topology Election
//!
//! Control plane that lets accelerator devices wired into rings of 2 or 4
//! agree on which links are healthy, a node id for every device, the ring's
//! size and a canonical ring serial, using only register reads over the
//! device-to-device DMA links.
//!
//! # Architecture
//!
//! Every host runs one election coordinator. Non-primary devices vet their
//! wiring first, then the primary device computes the ring numbering from
//! the serials it can observe directly and through its LEFT neighbor. When
//! the full ring cannot be formed the coordinator narrows to single links.
//!
//! # Features
//!
//! - Dual-lane verified remote reads with wiring-fault detection
//! - Results persisted in device scratch registers across driver reloads
//! - Cooperative cancellation and deadline-bounded retries
//! - Operating modes (full ring, half rings, single node)
//! - HTTP control surface and `ringctl` CLI
//! - Simulated ring fabric for development and tests

pub mod config;
pub mod error;
pub mod hal;
pub mod topology;
pub mod api;

pub use config::RingTopoConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ElectionFlags, RingTopoConfig};
    pub use crate::error::{Error, Result};
    pub use crate::hal::{DeviceHal, Direction, LinkMask, SimFabric};
    pub use crate::topology::{
        ControlState, ElectionCoordinator, ElectionHandle, ElectionStatus, OperatingMode, RingTopology,
        StatusReport,
    };
}
