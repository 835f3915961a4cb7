//! RingTopo Configuration
//!
//! This module provides configuration structures for the ring topology
//! election daemon.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main RingTopo configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingTopoConfig {
    /// Host-specific configuration
    #[serde(default)]
    pub host: HostConfig,

    /// Election protocol configuration
    #[serde(default)]
    pub election: ElectionSettings,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Simulated hardware configuration
    #[serde(default)]
    pub sim: SimConfig,
}

/// Host-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostConfig {
    /// Ring position of the host whose control plane is served
    #[serde(default)]
    pub index: usize,
}

/// Election protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionSettings {
    /// Overall deadline of an election, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Minimum time granted to a narrowed retry, in seconds
    #[serde(default = "default_retry_floor_secs")]
    pub retry_floor_secs: u64,

    /// Sleep between peer polls, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Timeout of a single remote read, in milliseconds
    #[serde(default = "default_dma_timeout_ms")]
    pub dma_timeout_ms: u64,

    /// Attempts per remote read before giving up on the link
    #[serde(default = "default_dma_retries")]
    pub dma_retries: u32,

    /// Poll iterations between progress log lines
    #[serde(default = "default_progress_log_every")]
    pub progress_log_every: u32,

    /// Behaviour flags (see [`ElectionFlags`])
    #[serde(default)]
    pub flags: ElectionFlags,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Simulated hardware configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Hosts in the ring (2 or 4)
    #[serde(default = "default_sim_hosts")]
    pub hosts: usize,

    /// Devices per host
    #[serde(default = "default_sim_members")]
    pub members: usize,

    /// Seed for serial numbers (0 = random)
    #[serde(default)]
    pub serial_seed: u64,

    /// Directory holding file-backed scratch regions (in-memory when unset)
    #[serde(default)]
    pub backing_dir: Option<PathBuf>,
}

/// Election behaviour bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElectionFlags(pub u32);

impl ElectionFlags {
    /// Do not start an election automatically at load
    pub const SKIP_AT_LOAD: u32 = 0x01;
    /// Log every remote read and poll
    pub const VERBOSE: u32 = 0x02;
    /// Treat the LEFT link as faulty
    pub const FAULT_LEFT: u32 = 0x04;
    /// Treat the RIGHT link as faulty
    pub const FAULT_RIGHT: u32 = 0x08;
    /// Skip the full-ring attempt and only use single links
    pub const SINGLE_LINK: u32 = 0x10;
    /// Reset persisted election records at load
    pub const CLEAR_STATE: u32 = 0x20;

    const ALL: u32 = 0x3f;

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    pub fn skip_at_load(self) -> bool {
        self.contains(Self::SKIP_AT_LOAD)
    }

    pub fn verbose(self) -> bool {
        self.contains(Self::VERBOSE)
    }

    pub fn single_link(self) -> bool {
        self.contains(Self::SINGLE_LINK)
    }

    pub fn clear_state(self) -> bool {
        self.contains(Self::CLEAR_STATE)
    }

    /// Directions with injected link faults
    pub fn faulted_links(self) -> crate::hal::LinkMask {
        let mut bits = 0;
        if self.contains(Self::FAULT_LEFT) {
            bits |= crate::hal::Direction::Left.bit();
        }
        if self.contains(Self::FAULT_RIGHT) {
            bits |= crate::hal::Direction::Right.bit();
        }
        crate::hal::LinkMask::from_bits(bits).unwrap_or_default()
    }
}

// Default value functions
fn default_timeout_secs() -> u64 {
    600
}

fn default_retry_floor_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_dma_timeout_ms() -> u64 {
    1000
}

fn default_dma_retries() -> u32 {
    3
}

fn default_progress_log_every() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_sim_hosts() -> usize {
    4
}

fn default_sim_members() -> usize {
    16
}

impl Default for ElectionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            retry_floor_secs: default_retry_floor_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            dma_timeout_ms: default_dma_timeout_ms(),
            dma_retries: default_dma_retries(),
            progress_log_every: default_progress_log_every(),
            flags: ElectionFlags::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            hosts: default_sim_hosts(),
            members: default_sim_members(),
            serial_seed: 0,
            backing_dir: None,
        }
    }
}

impl ElectionSettings {
    /// Overall election deadline
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Minimum time left for a narrowed retry
    pub fn retry_floor(&self) -> Duration {
        Duration::from_secs(self.retry_floor_secs)
    }

    /// Sleep between peer polls
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Timeout of one remote read
    pub fn dma_timeout(&self) -> Duration {
        Duration::from_millis(self.dma_timeout_ms)
    }
}

impl RingTopoConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: RingTopoConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.sim.hosts != 2 && self.sim.hosts != 4 {
            return Err(crate::Error::Config(format!(
                "sim.hosts must be 2 or 4, got {}",
                self.sim.hosts
            )));
        }

        if self.sim.members == 0 || self.sim.members > 16 {
            return Err(crate::Error::Config(format!(
                "sim.members must be within 1..=16, got {}",
                self.sim.members
            )));
        }

        if self.host.index >= self.sim.hosts {
            return Err(crate::Error::Config(format!(
                "host.index {} is outside the {}-host ring",
                self.host.index, self.sim.hosts
            )));
        }

        if self.election.timeout_secs == 0 {
            return Err(crate::Error::Config("election.timeout_secs cannot be 0".into()));
        }

        if self.election.poll_interval_ms == 0 || self.election.dma_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "election poll and DMA intervals must be non-zero".into(),
            ));
        }

        if self.election.dma_retries == 0 {
            return Err(crate::Error::Config("election.dma_retries cannot be 0".into()));
        }

        if self.election.flags.0 & !ElectionFlags::ALL != 0 {
            return Err(crate::Error::Config(format!(
                "unknown election flag bits {:#x}",
                self.election.flags.0 & !ElectionFlags::ALL
            )));
        }

        if self.api.enabled && self.api.bind_address.is_empty() {
            return Err(crate::Error::Config("api.bind_address cannot be empty".into()));
        }

        Ok(())
    }

    /// Sample configuration written by `ringtopod init`
    pub fn sample() -> Self {
        Self {
            host: HostConfig::default(),
            election: ElectionSettings::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
            sim: SimConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[host]
index = 2

[election]
timeout_secs = 120
poll_interval_ms = 50
flags = 0x12

[sim]
hosts = 4
members = 8
serial_seed = 7
"#;

        let config = RingTopoConfig::from_str(toml).unwrap();
        assert_eq!(config.host.index, 2);
        assert_eq!(config.election.timeout(), Duration::from_secs(120));
        assert_eq!(config.election.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.election.retry_floor_secs, 60);
        assert!(config.election.flags.verbose());
        assert!(config.election.flags.single_link());
        assert!(!config.election.flags.skip_at_load());
        assert_eq!(config.sim.members, 8);
        assert!(config.api.enabled);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = RingTopoConfig::from_str("").unwrap();
        assert_eq!(config.election.timeout_secs, 600);
        assert_eq!(config.sim.hosts, 4);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_rejects_bad_ring_size() {
        let err = RingTopoConfig::from_str("[sim]\nhosts = 3\n").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));

        let err = RingTopoConfig::from_str("[host]\nindex = 2\n[sim]\nhosts = 2\n").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_faulted_links() {
        use crate::hal::LinkMask;

        let flags = ElectionFlags(ElectionFlags::FAULT_LEFT);
        assert_eq!(flags.faulted_links(), LinkMask::LEFT);
        let flags = ElectionFlags(ElectionFlags::FAULT_LEFT | ElectionFlags::FAULT_RIGHT);
        assert_eq!(flags.faulted_links(), LinkMask::BOTH);
        assert_eq!(ElectionFlags::default().faulted_links(), LinkMask::NONE);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ringtopo.toml");
        std::fs::write(&path, toml::to_string(&RingTopoConfig::sample()).unwrap()).unwrap();

        let config = RingTopoConfig::from_file(&path).unwrap();
        assert_eq!(config.api.bind_address, "127.0.0.1:8090");
    }
}
