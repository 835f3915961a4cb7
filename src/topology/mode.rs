//! Operating Mode Negotiation
//!
//! After a successful election a caller may lock in a sub-partitioning of
//! the ring: the whole ring, one of the two halves, or a single node. The
//! negotiator remaps the elected position to the view under the locked mode
//! and holds the mode until the owned core count drops to zero.

use serde::{Deserialize, Serialize};

use super::election::{RingPosition, RingTopology};
use super::record::ElectionStatus;
use crate::error::{Error, Result};
use crate::hal::Direction;

/// Sub-partitioning of an elected ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingMode {
    /// No mode locked in
    Unset,
    /// All members of the ring
    FullRing,
    /// Pairs joined by LEFT links
    HalfA,
    /// Pairs joined by RIGHT links
    HalfB,
    /// This node alone
    Single,
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperatingMode::Unset => write!(f, "UNSET"),
            OperatingMode::FullRing => write!(f, "FULL_RING"),
            OperatingMode::HalfA => write!(f, "HALF_A"),
            OperatingMode::HalfB => write!(f, "HALF_B"),
            OperatingMode::Single => write!(f, "SINGLE"),
        }
    }
}

impl std::str::FromStr for OperatingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "UNSET" => Ok(OperatingMode::Unset),
            "FULL_RING" | "FULL" => Ok(OperatingMode::FullRing),
            "HALF_A" => Ok(OperatingMode::HalfA),
            "HALF_B" => Ok(OperatingMode::HalfB),
            "SINGLE" | "SINGLE_NODE" => Ok(OperatingMode::Single),
            _ => Err(Error::Config(format!("unknown operating mode '{}'", s))),
        }
    }
}

/// Modes the elected topology can serve, in preference order
pub fn supported_modes(status: ElectionStatus, topology: Option<&RingTopology>) -> Vec<OperatingMode> {
    match (status, topology) {
        (ElectionStatus::Success, Some(t)) => {
            let mut modes = Vec::with_capacity(4);
            if t.ring_size == 4 {
                modes.push(OperatingMode::FullRing);
            }
            if t.link_mask.contains(Direction::Left) {
                modes.push(OperatingMode::HalfA);
            }
            if t.link_mask.contains(Direction::Right) {
                modes.push(OperatingMode::HalfB);
            }
            modes.push(OperatingMode::Single);
            modes
        }
        (ElectionStatus::Failure, _) => vec![OperatingMode::Single],
        _ => Vec::new(),
    }
}

/// Half-ring view of a 4-node ring: `partner` is the member sharing the link
fn half_view(topology: &RingTopology, partner: usize) -> RingPosition {
    let own = topology.serial;
    let other = topology.members.get(partner).copied().unwrap_or(0);
    if own < other || other == 0 {
        RingPosition { node_id: 0, ring_size: 2, canonical: own }
    } else {
        RingPosition { node_id: 1, ring_size: 2, canonical: other }
    }
}

/// Locked-in operating mode of one host's ring
#[derive(Debug, Default)]
pub struct ModeNegotiator {
    active: Option<OperatingMode>,
}

impl ModeNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> OperatingMode {
        self.active.unwrap_or(OperatingMode::Unset)
    }

    /// Lock in `requested`
    pub fn request(
        &mut self,
        requested: OperatingMode,
        status: ElectionStatus,
        topology: Option<&RingTopology>,
        owned_cores: usize,
    ) -> Result<OperatingMode> {
        if !status.is_terminal() {
            return Err(Error::Busy);
        }
        if !supported_modes(status, topology).contains(&requested) {
            return Err(Error::Unsupported(requested));
        }
        match self.active {
            Some(active) if active != requested && owned_cores > 0 => {
                return Err(Error::Conflict { active, requested });
            }
            Some(active) if active == requested => return Ok(active),
            _ => {}
        }

        tracing::info!("Operating mode set to {}", requested);
        self.active = Some(requested);
        Ok(requested)
    }

    /// Core count reached zero: the mode is free again
    pub fn release(&mut self) {
        if let Some(mode) = self.active.take() {
            tracing::info!("Operating mode {} released", mode);
        }
    }

    /// Modes reported to callers: only the locked mode while one is held
    pub fn advertised(&self, status: ElectionStatus, topology: Option<&RingTopology>) -> Vec<OperatingMode> {
        match self.active {
            Some(mode) => vec![mode],
            None => supported_modes(status, topology),
        }
    }

    /// Position visible under the locked mode; the raw position when unset
    pub fn view(&self, status: ElectionStatus, topology: Option<&RingTopology>, serial: u64) -> Option<RingPosition> {
        let single = RingPosition { node_id: 0, ring_size: 1, canonical: serial };
        match (self.active(), status, topology) {
            (OperatingMode::Single, _, _) => Some(single),
            (mode, ElectionStatus::Success, Some(t)) => {
                let id = usize::from(t.node_id);
                Some(match mode {
                    OperatingMode::HalfA if t.ring_size == 4 => half_view(t, id ^ 1),
                    OperatingMode::HalfB if t.ring_size == 4 => half_view(t, 3 - id),
                    _ => t.position(),
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::LinkMask;

    fn four_ring() -> RingTopology {
        // Ring 0 -L- 1 -R- 2 -L- 3 -R- 0 seen from node 1 (serial 20).
        RingTopology {
            node_id: 1,
            ring_size: 4,
            canonical: 10,
            link_mask: LinkMask::BOTH,
            members: vec![10, 20, 40, 30],
            serial: 20,
        }
    }

    fn two_ring(mask: LinkMask) -> RingTopology {
        RingTopology {
            node_id: 1,
            ring_size: 2,
            canonical: 25,
            link_mask: mask,
            members: vec![25, 40],
            serial: 40,
        }
    }

    #[test]
    fn test_supported_modes() {
        let full = four_ring();
        assert_eq!(
            supported_modes(ElectionStatus::Success, Some(&full)),
            vec![
                OperatingMode::FullRing,
                OperatingMode::HalfA,
                OperatingMode::HalfB,
                OperatingMode::Single
            ]
        );

        let left = two_ring(LinkMask::LEFT);
        assert_eq!(
            supported_modes(ElectionStatus::Success, Some(&left)),
            vec![OperatingMode::HalfA, OperatingMode::Single]
        );
        let right = two_ring(LinkMask::RIGHT);
        assert_eq!(
            supported_modes(ElectionStatus::Success, Some(&right)),
            vec![OperatingMode::HalfB, OperatingMode::Single]
        );

        assert_eq!(supported_modes(ElectionStatus::Failure, None), vec![OperatingMode::Single]);
        assert!(supported_modes(ElectionStatus::InProgress, None).is_empty());
    }

    #[test]
    fn test_full_ring_unsupported_on_two_ring() {
        let mut modes = ModeNegotiator::new();
        let ring = two_ring(LinkMask::RIGHT);
        let err = modes
            .request(OperatingMode::FullRing, ElectionStatus::Success, Some(&ring), 0)
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(OperatingMode::FullRing)));
        assert_eq!(modes.active(), OperatingMode::Unset);
    }

    #[test]
    fn test_busy_while_election_pending() {
        let mut modes = ModeNegotiator::new();
        for status in [ElectionStatus::Init, ElectionStatus::InProgress] {
            let err = modes.request(OperatingMode::Single, status, None, 0).unwrap_err();
            assert!(matches!(err, Error::Busy));
        }
    }

    #[test]
    fn test_conflict_while_cores_owned() {
        let mut modes = ModeNegotiator::new();
        let ring = four_ring();
        modes
            .request(OperatingMode::HalfA, ElectionStatus::Success, Some(&ring), 0)
            .unwrap();

        // Same mode again is fine.
        modes
            .request(OperatingMode::HalfA, ElectionStatus::Success, Some(&ring), 2)
            .unwrap();

        let err = modes
            .request(OperatingMode::FullRing, ElectionStatus::Success, Some(&ring), 2)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Conflict {
                active: OperatingMode::HalfA,
                requested: OperatingMode::FullRing
            }
        ));

        modes.release();
        assert_eq!(modes.active(), OperatingMode::Unset);
        modes
            .request(OperatingMode::FullRing, ElectionStatus::Success, Some(&ring), 2)
            .unwrap();
    }

    #[test]
    fn test_half_views() {
        let ring = four_ring();
        let mut modes = ModeNegotiator::new();
        assert_eq!(
            modes.view(ElectionStatus::Success, Some(&ring), 20),
            Some(RingPosition { node_id: 1, ring_size: 4, canonical: 10 })
        );

        // LEFT partner of node 1 is node 0 (serial 10).
        modes.request(OperatingMode::HalfA, ElectionStatus::Success, Some(&ring), 0).unwrap();
        assert_eq!(
            modes.view(ElectionStatus::Success, Some(&ring), 20),
            Some(RingPosition { node_id: 1, ring_size: 2, canonical: 10 })
        );
        assert_eq!(modes.advertised(ElectionStatus::Success, Some(&ring)), vec![OperatingMode::HalfA]);

        // RIGHT partner of node 1 is node 2 (serial 40).
        modes.release();
        modes.request(OperatingMode::HalfB, ElectionStatus::Success, Some(&ring), 0).unwrap();
        assert_eq!(
            modes.view(ElectionStatus::Success, Some(&ring), 20),
            Some(RingPosition { node_id: 0, ring_size: 2, canonical: 20 })
        );
    }

    #[test]
    fn test_single_view_after_failure() {
        let mut modes = ModeNegotiator::new();
        assert_eq!(modes.view(ElectionStatus::Failure, None, 77), None);
        modes.request(OperatingMode::Single, ElectionStatus::Failure, None, 0).unwrap();
        assert_eq!(
            modes.view(ElectionStatus::Failure, None, 77),
            Some(RingPosition { node_id: 0, ring_size: 1, canonical: 77 })
        );
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!("half-a".parse::<OperatingMode>().unwrap(), OperatingMode::HalfA);
        assert_eq!("FULL_RING".parse::<OperatingMode>().unwrap(), OperatingMode::FullRing);
        assert_eq!("single_node".parse::<OperatingMode>().unwrap(), OperatingMode::Single);
        assert!("ring".parse::<OperatingMode>().is_err());
    }
}
