//! Simulated Ring Fabric
//!
//! A software model of several hosts whose devices are wired into rings of 2
//! or 4. Device `m` of every host belongs to the same ring; links pair a LEFT
//! port with the peer's LEFT port and a RIGHT port with the peer's RIGHT port:
//!
//! ```text
//! 4 hosts:  0 -L- 1 -R- 2 -L- 3 -R- 0
//! 2 hosts:  0 -L- 1 and 0 -R- 1
//! ```
//!
//! Scratch regions are memory maps, anonymous or backed by one file per
//! device, so persisted election records survive a simulated driver reload.
//! Links can be cut and individual lanes corrupted to exercise the failure
//! paths of the protocol.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use memmap2::MmapMut;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;

use super::regs;
use super::{Descriptor, DeviceHal, Direction, Lane, QueueId};
use crate::error::{Error, Result};

type SerialFn = Box<dyn Fn(usize, usize) -> u64>;

/// Builder for [`SimFabric`]
pub struct SimFabricBuilder {
    hosts: usize,
    members: usize,
    seed: u64,
    serials: Option<SerialFn>,
    backing_dir: Option<PathBuf>,
}

impl Default for SimFabricBuilder {
    fn default() -> Self {
        Self {
            hosts: 4,
            members: 1,
            seed: 0,
            serials: None,
            backing_dir: None,
        }
    }
}

impl SimFabricBuilder {
    /// Hosts in the ring (2 or 4)
    pub fn hosts(mut self, hosts: usize) -> Self {
        self.hosts = hosts;
        self
    }

    /// Devices per host
    pub fn members(mut self, members: usize) -> Self {
        self.members = members;
        self
    }

    /// Seed for generated serial numbers (0 = random)
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Explicit serial number for every (host, member)
    pub fn serials(mut self, serials: impl Fn(usize, usize) -> u64 + 'static) -> Self {
        self.serials = Some(Box::new(serials));
        self
    }

    /// Back scratch regions with files in `dir`
    pub fn backing_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backing_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Result<SimFabric> {
        if self.hosts != 2 && self.hosts != 4 {
            return Err(Error::Config(format!("a ring has 2 or 4 hosts, not {}", self.hosts)));
        }
        if self.members == 0 || self.members > 16 {
            return Err(Error::Config(format!("{} devices per host is out of range", self.members)));
        }
        if let Some(dir) = &self.backing_dir {
            std::fs::create_dir_all(dir)?;
        }

        let serials = self.assign_serials()?;
        let mut hosts = Vec::with_capacity(self.hosts);
        for (host, host_serials) in serials.into_iter().enumerate() {
            let mut devices = Vec::with_capacity(self.members);
            for (member, serial) in host_serials.into_iter().enumerate() {
                let mut region = match &self.backing_dir {
                    Some(dir) => map_file(&dir.join(format!("host{}-member{}.scratch", host, member)))?,
                    None => MmapMut::map_anon(regs::REGION_SIZE)?,
                };
                LittleEndian::write_u64(&mut region[regs::SERIAL..regs::SERIAL + 8], serial);
                devices.push(SimDevice {
                    serial,
                    region: Mutex::new(region),
                });
            }
            let (cores, _) = watch::channel(0);
            hosts.push(SimHost {
                devices,
                reset_done: AtomicBool::new(true),
                cores,
            });
        }

        tracing::debug!(
            "Simulated fabric ready: {} hosts x {} devices",
            self.hosts,
            self.members
        );

        Ok(SimFabric {
            inner: Arc::new(FabricInner {
                hosts,
                faults: Mutex::new(Faults::default()),
                queues: Mutex::new(HashMap::new()),
                next_queue: AtomicU64::new(1),
            }),
        })
    }

    fn assign_serials(&self) -> Result<Vec<Vec<u64>>> {
        let mut seen = HashSet::new();
        let mut rng = if self.seed == 0 {
            rand::rngs::StdRng::from_entropy()
        } else {
            rand::rngs::StdRng::seed_from_u64(self.seed)
        };

        let mut out = Vec::with_capacity(self.hosts);
        for host in 0..self.hosts {
            let mut row = Vec::with_capacity(self.members);
            for member in 0..self.members {
                let serial = match &self.serials {
                    Some(f) => f(host, member),
                    None => loop {
                        let candidate: u64 = rng.gen();
                        if candidate != 0 && !seen.contains(&candidate) {
                            break candidate;
                        }
                    },
                };
                if serial == 0 || !seen.insert(serial) {
                    return Err(Error::Config(format!(
                        "serial {:#x} of host {} device {} is zero or duplicated",
                        serial, host, member
                    )));
                }
                row.push(serial);
            }
            out.push(row);
        }
        Ok(out)
    }
}

fn map_file(path: &Path) -> Result<MmapMut> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    file.set_len(regs::REGION_SIZE as u64)?;
    // SAFETY: the file is private to this fabric and is never truncated while mapped.
    let map = unsafe { MmapMut::map_mut(&file)? };
    Ok(map)
}

struct SimDevice {
    serial: u64,
    region: Mutex<MmapMut>,
}

struct SimHost {
    devices: Vec<SimDevice>,
    reset_done: AtomicBool,
    cores: watch::Sender<usize>,
}

#[derive(Default)]
struct Faults {
    /// Dead links, recorded at both ends
    cut: HashSet<(usize, Direction)>,
    /// Lanes returning flipped bits, keyed by the reading endpoint
    corrupt: HashSet<(usize, usize, Direction, Lane)>,
}

struct SimQueue {
    host: usize,
    member: usize,
    direction: Direction,
    lane: Lane,
    buffer: Vec<u8>,
}

struct FabricInner {
    hosts: Vec<SimHost>,
    faults: Mutex<Faults>,
    queues: Mutex<HashMap<QueueId, SimQueue>>,
    next_queue: AtomicU64,
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::Hal("simulated fabric lock poisoned".into())
}

impl FabricInner {
    fn peer_host(&self, host: usize, direction: Direction) -> usize {
        match (self.hosts.len(), direction) {
            (2, _) => 1 - host,
            (_, Direction::Left) => host ^ 1,
            (_, Direction::Right) => 3 - host,
        }
    }

    fn device(&self, host: usize, member: usize) -> Result<&SimDevice> {
        self.hosts
            .get(host)
            .and_then(|h| h.devices.get(member))
            .ok_or_else(|| Error::Hal(format!("no device {} on host {}", member, host)))
    }

    fn region(&self, host: usize, member: usize) -> Result<MutexGuard<'_, MmapMut>> {
        self.device(host, member)?.region.lock().map_err(poisoned)
    }

    fn check_word(offset: usize) -> Result<()> {
        if offset % 4 != 0 || offset + 4 > regs::REGION_SIZE {
            return Err(Error::Hal(format!("scratch offset {:#x} is not a valid word", offset)));
        }
        Ok(())
    }
}

/// A simulated multi-host ring
#[derive(Clone)]
pub struct SimFabric {
    inner: Arc<FabricInner>,
}

impl SimFabric {
    pub fn builder() -> SimFabricBuilder {
        SimFabricBuilder::default()
    }

    /// Hardware view of one host
    pub fn host(&self, host: usize) -> Arc<SimHostHal> {
        Arc::new(SimHostHal {
            inner: Arc::clone(&self.inner),
            host,
        })
    }

    pub fn host_count(&self) -> usize {
        self.inner.hosts.len()
    }

    /// Serial number of a device
    pub fn serial(&self, host: usize, member: usize) -> Option<u64> {
        self.inner.device(host, member).ok().map(|d| d.serial)
    }

    /// Host wired to `host` on `direction`
    pub fn peer_host(&self, host: usize, direction: Direction) -> usize {
        self.inner.peer_host(host, direction)
    }

    /// Make the link at `host`/`direction` drop every transfer, at both ends
    pub fn cut_link(&self, host: usize, direction: Direction) {
        let peer = self.inner.peer_host(host, direction);
        if let Ok(mut faults) = self.inner.faults.lock() {
            faults.cut.insert((host, direction));
            faults.cut.insert((peer, direction));
        }
    }

    /// Undo [`SimFabric::cut_link`]
    pub fn restore_link(&self, host: usize, direction: Direction) {
        let peer = self.inner.peer_host(host, direction);
        if let Ok(mut faults) = self.inner.faults.lock() {
            faults.cut.remove(&(host, direction));
            faults.cut.remove(&(peer, direction));
        }
    }

    /// Flip every bit read by `host`/`member` over one lane
    pub fn corrupt_lane(&self, host: usize, member: usize, direction: Direction, lane: Lane) {
        if let Ok(mut faults) = self.inner.faults.lock() {
            faults.corrupt.insert((host, member, direction, lane));
        }
    }

    pub fn set_reset_complete(&self, host: usize, done: bool) {
        if let Some(h) = self.inner.hosts.get(host) {
            h.reset_done.store(done, Ordering::SeqCst);
        }
    }

    /// Simulate user processes taking ownership of compute cores
    pub fn acquire_cores(&self, host: usize, count: usize) {
        if let Some(h) = self.inner.hosts.get(host) {
            h.cores.send_modify(|c| *c += count);
        }
    }

    /// Simulate user processes releasing compute cores
    pub fn release_cores(&self, host: usize, count: usize) {
        if let Some(h) = self.inner.hosts.get(host) {
            h.cores.send_modify(|c| *c = c.saturating_sub(count));
        }
    }

    /// DMA queues currently allocated across the fabric
    pub fn open_queues(&self) -> usize {
        self.inner.queues.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Inspect a 64-bit value in a device's scratch region
    pub fn peek_u64(&self, host: usize, member: usize, offset: usize) -> Result<u64> {
        let region = self.inner.region(host, member)?;
        Ok(LittleEndian::read_u64(&region[offset..offset + 8]))
    }

    /// Inspect a 32-bit value in a device's scratch region
    pub fn peek_u32(&self, host: usize, member: usize, offset: usize) -> Result<u32> {
        let region = self.inner.region(host, member)?;
        Ok(LittleEndian::read_u32(&region[offset..offset + 4]))
    }

    /// Flush file-backed scratch regions
    pub fn flush(&self) -> Result<()> {
        for host in &self.inner.hosts {
            for device in &host.devices {
                device.region.lock().map_err(poisoned)?.flush()?;
            }
        }
        Ok(())
    }
}

/// [`DeviceHal`] implementation for one host of a [`SimFabric`]
pub struct SimHostHal {
    inner: Arc<FabricInner>,
    host: usize,
}

impl SimHostHal {
    fn host(&self) -> &SimHost {
        &self.inner.hosts[self.host]
    }

    fn copy_from_peer(
        &self,
        queue: &mut SimQueue,
        remote_offset: usize,
        local_offset: usize,
        len: usize,
    ) -> Result<bool> {
        if remote_offset + len > regs::REGION_SIZE || local_offset + len > regs::DMA_DATA_MAX {
            return Err(Error::Hal(format!(
                "DMA copy of {} bytes at {:#x} is out of bounds",
                len, remote_offset
            )));
        }

        let (cut, corrupt) = {
            let faults = self.inner.faults.lock().map_err(poisoned)?;
            (
                faults.cut.contains(&(queue.host, queue.direction)),
                faults
                    .corrupt
                    .contains(&(queue.host, queue.member, queue.direction, queue.lane)),
            )
        };
        if cut {
            return Ok(false);
        }

        let peer = self.inner.peer_host(queue.host, queue.direction);
        let region = self.inner.region(peer, queue.member)?;
        let dst = &mut queue.buffer[local_offset..local_offset + len];
        dst.copy_from_slice(&region[remote_offset..remote_offset + len]);
        if corrupt {
            dst.iter_mut().for_each(|b| *b ^= 0xff);
        }
        Ok(true)
    }
}

impl DeviceHal for SimHostHal {
    fn generation(&self) -> &str {
        "sim"
    }

    fn host_label(&self) -> String {
        format!("sim-host{}", self.host)
    }

    fn member_count(&self) -> usize {
        self.host().devices.len()
    }

    fn serial_number(&self, member: usize) -> Result<u64> {
        Ok(self.inner.device(self.host, member)?.serial)
    }

    fn scratch_read(&self, member: usize, offset: usize) -> Result<u32> {
        FabricInner::check_word(offset)?;
        let region = self.inner.region(self.host, member)?;
        Ok(LittleEndian::read_u32(&region[offset..offset + 4]))
    }

    fn scratch_write(&self, member: usize, offset: usize, value: u32) -> Result<()> {
        FabricInner::check_word(offset)?;
        if offset < regs::SERIAL + 8 {
            return Err(Error::Hal("serial number register is read-only".into()));
        }
        let mut region = self.inner.region(self.host, member)?;
        LittleEndian::write_u32(&mut region[offset..offset + 4], value);
        Ok(())
    }

    fn dma_acquire(&self, member: usize, direction: Direction, lane: Lane) -> Result<QueueId> {
        self.inner.device(self.host, member)?;
        let id = QueueId(self.inner.next_queue.fetch_add(1, Ordering::Relaxed));
        self.inner.queues.lock().map_err(poisoned)?.insert(
            id,
            SimQueue {
                host: self.host,
                member,
                direction,
                lane,
                buffer: vec![0; regs::DMA_BUFFER_SIZE],
            },
        );
        Ok(id)
    }

    fn dma_release(&self, queue: QueueId) {
        if let Ok(mut queues) = self.inner.queues.lock() {
            queues.remove(&queue);
        }
    }

    fn dma_submit(&self, queue: QueueId, descriptors: &[Descriptor]) -> Result<()> {
        let mut queues = self.inner.queues.lock().map_err(poisoned)?;
        let q = queues
            .get_mut(&queue)
            .ok_or_else(|| Error::Hal(format!("unknown DMA queue {:?}", queue)))?;

        for descriptor in descriptors {
            match *descriptor {
                Descriptor::CopyFromPeer {
                    remote_offset,
                    local_offset,
                    len,
                } => {
                    // A dead link swallows the transfer and everything queued behind it.
                    if !self.copy_from_peer(q, remote_offset, local_offset, len)? {
                        return Ok(());
                    }
                }
                Descriptor::WriteFlag { local_offset, value } => {
                    if local_offset + 4 > regs::DMA_BUFFER_SIZE {
                        return Err(Error::Hal(format!("flag offset {:#x} out of bounds", local_offset)));
                    }
                    LittleEndian::write_u32(&mut q.buffer[local_offset..local_offset + 4], value);
                }
            }
        }
        Ok(())
    }

    fn dma_buffer_read(&self, queue: QueueId, offset: usize, len: usize) -> Result<Bytes> {
        let queues = self.inner.queues.lock().map_err(poisoned)?;
        let q = queues
            .get(&queue)
            .ok_or_else(|| Error::Hal(format!("unknown DMA queue {:?}", queue)))?;
        if offset + len > q.buffer.len() {
            return Err(Error::Hal(format!("landing buffer read at {:#x} out of bounds", offset)));
        }
        Ok(Bytes::copy_from_slice(&q.buffer[offset..offset + len]))
    }

    fn dma_buffer_clear(&self, queue: QueueId) -> Result<()> {
        let mut queues = self.inner.queues.lock().map_err(poisoned)?;
        let q = queues
            .get_mut(&queue)
            .ok_or_else(|| Error::Hal(format!("unknown DMA queue {:?}", queue)))?;
        q.buffer.iter_mut().for_each(|b| *b = 0);
        Ok(())
    }

    fn all_members_reset(&self) -> bool {
        self.host().reset_done.load(Ordering::SeqCst)
    }

    fn owned_core_count(&self) -> usize {
        *self.host().cores.borrow()
    }

    fn subscribe_core_count(&self) -> watch::Receiver<usize> {
        self.host().cores.subscribe()
    }
}
