//! RingTopo Error Types

use thiserror::Error;

use crate::hal::Direction;
use crate::topology::OperatingMode;

/// Result type alias for RingTopo operations
pub type Result<T> = std::result::Result<T, Error>;

/// Linux errno values reported to the control plane
pub mod errno {
    pub const EINTR: i32 = 4;
    pub const EIO: i32 = 5;
    pub const EAGAIN: i32 = 11;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
    pub const ETIMEDOUT: i32 = 110;
    pub const ENOTSUPP: i32 = 524;
}

/// RingTopo error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Hardware errors
    #[error("Hardware access failed: {0}")]
    Hal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Protocol errors
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Wiring fault on {direction} link: {reason}")]
    WiringFault { direction: Direction, reason: String },

    #[error("Peer on {direction} link reported failure")]
    PeerReportedFailure { direction: Direction },

    #[error("Only {passed} of {expected} ring members passed vetting")]
    VettingIncomplete { passed: usize, expected: usize },

    #[error("Election cancelled")]
    Cancelled,

    // Control plane errors
    #[error("Mode {0} is not supported by the elected topology")]
    Unsupported(OperatingMode),

    #[error("Mode {active} already in use, cannot switch to {requested}")]
    Conflict {
        active: OperatingMode,
        requested: OperatingMode,
    },

    #[error("Election has not completed")]
    Busy,

    #[error("Election cannot start: {0}")]
    NotReady(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if narrowing the link mask and retrying could help
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::WiringFault { .. }
                | Error::PeerReportedFailure { .. }
                | Error::VettingIncomplete { .. }
                | Error::Hal(_)
        )
    }

    /// Errno equivalent handed to control-plane callers
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotReady(_) => errno::EAGAIN,
            Error::Busy => errno::EBUSY,
            Error::Conflict { .. } => errno::EEXIST,
            Error::Unsupported(_) => errno::ENOTSUPP,
            Error::Timeout(_) => errno::ETIMEDOUT,
            Error::Cancelled | Error::ShuttingDown => errno::EINTR,
            Error::Config(_) | Error::ConfigParse(_) => errno::EINVAL,
            _ => errno::EIO,
        }
    }

    /// Stable short code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => "CONFIG",
            Error::Hal(_) | Error::Io(_) => "IO_FAULT",
            Error::Timeout(_) => "TIMEOUT",
            Error::WiringFault { .. } => "WIRING_FAULT",
            Error::PeerReportedFailure { .. } => "PEER_FAILURE",
            Error::VettingIncomplete { .. } => "VETTING_INCOMPLETE",
            Error::Cancelled => "CANCELLED",
            Error::Unsupported(_) => "ENOTSUPP",
            Error::Conflict { .. } => "EEXIST",
            Error::Busy => "EBUSY",
            Error::NotReady(_) => "EAGAIN",
            Error::Internal(_) => "INTERNAL",
            Error::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}
