//! Election Coordinator
//!
//! One actor task per host owns the election state (status, elected
//! topology, locked mode). Control-plane callers talk to it through an
//! [`ElectionHandle`]; the protocol itself runs on a separate worker task
//! that walks the ring members in index order and reports back once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::channel::{AttemptContext, ProtocolTiming};
use super::election::{PrimaryElection, RingTopology};
use super::mode::{ModeNegotiator, OperatingMode};
use super::record::{ElectionStatus, PersistentElectionRecord, RecordStore};
use super::vetting::VettingProtocol;
use crate::config::ElectionSettings;
use crate::error::{Error, Result};
use crate::hal::{DeviceHal, LinkMask};

/// Coarse state reported to the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlState {
    Busy,
    Success,
    Failure,
    SingleNode,
}

impl std::fmt::Display for ControlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlState::Busy => write!(f, "BUSY"),
            ControlState::Success => write!(f, "SUCCESS"),
            ControlState::Failure => write!(f, "FAILURE"),
            ControlState::SingleNode => write!(f, "SINGLE_NODE"),
        }
    }
}

/// Answer to every control operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: ControlState,
    /// Node id under the negotiated mode; `None` unless assigned
    pub node_id: Option<u8>,
    /// Last status change
    pub since: DateTime<Utc>,
}

/// Read-only attributes, relative to the negotiated mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    /// -1 when unassigned
    pub node_id: i32,
    /// Canonical ring serial, hex
    pub serial: String,
    /// Comma-separated operating modes
    pub supported_modes: String,
}

enum Command {
    RequestElection(oneshot::Sender<Result<StatusReport>>),
    Kill(oneshot::Sender<StatusReport>),
    SetMode(OperatingMode, oneshot::Sender<Result<StatusReport>>),
    Status(oneshot::Sender<StatusReport>),
    Attributes(oneshot::Sender<Attributes>),
    Topology(oneshot::Sender<Option<RingTopology>>),
    ResetComplete,
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable control-plane handle of one coordinator
#[derive(Clone)]
pub struct ElectionHandle {
    tx: mpsc::Sender<Command>,
}

impl ElectionHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| Error::ShuttingDown)?;
        reply_rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Start an election (EAGAIN while cores are owned or members resetting)
    pub async fn request_election(&self) -> Result<StatusReport> {
        self.call(Command::RequestElection).await?
    }

    /// Cancel a running election, or fail one that has not started
    pub async fn kill(&self) -> Result<StatusReport> {
        self.call(Command::Kill).await
    }

    pub async fn set_mode(&self, mode: OperatingMode) -> Result<StatusReport> {
        self.call(|reply| Command::SetMode(mode, reply)).await?
    }

    /// Legacy alias for `set_mode(Single)`
    pub async fn request_single_node(&self) -> Result<StatusReport> {
        self.set_mode(OperatingMode::Single).await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        self.call(Command::Status).await
    }

    pub async fn attributes(&self) -> Result<Attributes> {
        self.call(Command::Attributes).await
    }

    /// Raw elected topology, ignoring the negotiated mode
    pub async fn topology(&self) -> Result<Option<RingTopology>> {
        self.call(Command::Topology).await
    }

    /// Device reset finished somewhere on the host
    pub async fn notify_reset_complete(&self) -> Result<()> {
        self.tx
            .send(Command::ResetComplete)
            .await
            .map_err(|_| Error::ShuttingDown)
    }

    /// Stop the coordinator, cancelling and awaiting any running election
    pub async fn shutdown(&self) -> Result<()> {
        self.call(Command::Shutdown).await
    }
}

enum Event {
    Command(Command),
    Shutdown(oneshot::Sender<()>),
    Outcome(Result<RingTopology>),
    CoresChanged,
    CoresClosed,
    Stopped,
}

/// Election state machine of one host
pub struct ElectionCoordinator {
    hal: Arc<dyn DeviceHal>,
    store: RecordStore,
    settings: ElectionSettings,
    status: ElectionStatus,
    topology: Option<RingTopology>,
    modes: ModeNegotiator,
    since: DateTime<Utc>,
    attempt: Option<(CancellationToken, JoinHandle<()>)>,
    commands: mpsc::Receiver<Command>,
    outcome_tx: mpsc::Sender<Result<RingTopology>>,
    outcome_rx: mpsc::Receiver<Result<RingTopology>>,
    cores: watch::Receiver<usize>,
    watch_cores: bool,
}

impl ElectionCoordinator {
    /// Load persisted state and start the actor
    pub fn spawn(hal: Arc<dyn DeviceHal>, settings: ElectionSettings) -> Result<(ElectionHandle, JoinHandle<()>)> {
        let (tx, commands) = mpsc::channel(64);
        let (outcome_tx, outcome_rx) = mpsc::channel(1);
        let cores = hal.subscribe_core_count();

        let mut coordinator = Self {
            store: RecordStore::new(Arc::clone(&hal)),
            hal,
            settings,
            status: ElectionStatus::Init,
            topology: None,
            modes: ModeNegotiator::new(),
            since: Utc::now(),
            attempt: None,
            commands,
            outcome_tx,
            outcome_rx,
            cores,
            watch_cores: true,
        };
        coordinator.load()?;
        if !coordinator.settings.flags.skip_at_load() {
            coordinator.maybe_auto_start();
        }

        let task = tokio::spawn(coordinator.run());
        Ok((ElectionHandle { tx }, task))
    }

    /// Honour a cached election or prepare a clean slate
    fn load(&mut self) -> Result<()> {
        let members = 0..self.hal.member_count();
        let primary = self.hal.primary_member();

        if self.settings.flags.clear_state() {
            for member in members {
                self.store.clear(member)?;
            }
            tracing::info!("{}: persisted election state cleared", self.hal.host_label());
            return Ok(());
        }

        for member in members.clone() {
            self.store.erase_neighbors(member)?;
        }

        let record = self.store.load(primary)?;
        if let (ElectionStatus::Success, Some(node_id)) = (record.status, record.node_id()) {
            let topology = RingTopology {
                node_id,
                ring_size: record.ring_size,
                canonical: self.store.canonical(primary)?,
                link_mask: record.link_mask,
                members: self.store.members(primary, record.ring_size)?,
                serial: self.hal.serial_number(primary)?,
            };
            tracing::info!(
                "{}: using cached election, node {} of {}, canonical {:016x}",
                self.hal.host_label(),
                topology.node_id,
                topology.ring_size,
                topology.canonical
            );
            self.topology = Some(topology);
            self.set_status(ElectionStatus::Success);
            return Ok(());
        }

        for member in members {
            if self.store.load(member)?.status != ElectionStatus::Success {
                self.store.store(member, &PersistentElectionRecord::default())?;
            }
        }
        Ok(())
    }

    async fn run(mut self) {
        tracing::debug!("{}: election coordinator running", self.hal.host_label());
        loop {
            let event = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => Event::Shutdown(reply),
                    Some(command) => Event::Command(command),
                    None => Event::Stopped,
                },
                Some(outcome) = self.outcome_rx.recv() => Event::Outcome(outcome),
                changed = self.cores.changed(), if self.watch_cores => match changed {
                    Ok(()) => Event::CoresChanged,
                    Err(_) => Event::CoresClosed,
                },
            };

            match event {
                Event::Shutdown(reply) => {
                    self.stop_attempt().await;
                    let _ = reply.send(());
                    break;
                }
                Event::Command(command) => self.handle(command),
                Event::Outcome(outcome) => self.complete(outcome),
                Event::CoresChanged => {
                    if *self.cores.borrow_and_update() == 0 {
                        self.modes.release();
                    }
                }
                Event::CoresClosed => self.watch_cores = false,
                Event::Stopped => {
                    self.stop_attempt().await;
                    break;
                }
            }
        }
        tracing::debug!("{}: election coordinator stopped", self.hal.host_label());
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::RequestElection(reply) => {
                let _ = reply.send(self.request_election());
            }
            Command::Kill(reply) => {
                self.kill();
                let _ = reply.send(self.report());
            }
            Command::SetMode(mode, reply) => {
                let result = self
                    .modes
                    .request(mode, self.status, self.topology.as_ref(), self.hal.owned_core_count())
                    .map(|_| self.report());
                let _ = reply.send(result);
            }
            Command::Status(reply) => {
                let _ = reply.send(self.report());
            }
            Command::Attributes(reply) => {
                let _ = reply.send(self.attributes());
            }
            Command::Topology(reply) => {
                let _ = reply.send(self.topology.clone());
            }
            Command::ResetComplete => {
                if !self.settings.flags.skip_at_load() {
                    self.maybe_auto_start();
                }
            }
            // Intercepted by the actor loop.
            Command::Shutdown(_) => {}
        }
    }

    fn set_status(&mut self, status: ElectionStatus) {
        self.status = status;
        self.since = Utc::now();
    }

    fn serial(&self) -> u64 {
        self.hal.serial_number(self.hal.primary_member()).unwrap_or(0)
    }

    fn report(&self) -> StatusReport {
        let state = match self.status {
            ElectionStatus::Init | ElectionStatus::InProgress => ControlState::Busy,
            _ if self.modes.active() == OperatingMode::Single => ControlState::SingleNode,
            ElectionStatus::Success => ControlState::Success,
            ElectionStatus::Failure => ControlState::Failure,
        };
        let node_id = self
            .modes
            .view(self.status, self.topology.as_ref(), self.serial())
            .map(|view| view.node_id);
        StatusReport {
            state,
            node_id,
            since: self.since,
        }
    }

    fn attributes(&self) -> Attributes {
        let view = self.modes.view(self.status, self.topology.as_ref(), self.serial());
        let modes = self.modes.advertised(self.status, self.topology.as_ref());
        Attributes {
            node_id: view.map(|v| i32::from(v.node_id)).unwrap_or(-1),
            serial: format!("{:016x}", view.map(|v| v.canonical).unwrap_or(0)),
            supported_modes: modes
                .iter()
                .map(|m| m.to_string())
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    fn readiness(&self) -> Result<()> {
        let cores = self.hal.owned_core_count();
        if cores > 0 {
            return Err(Error::NotReady(format!("{} compute cores still owned", cores)));
        }
        if !self.hal.all_members_reset() {
            return Err(Error::NotReady("device reset has not completed".into()));
        }
        Ok(())
    }

    fn request_election(&mut self) -> Result<StatusReport> {
        if self.status == ElectionStatus::InProgress {
            return Ok(self.report());
        }
        self.readiness()?;
        self.start()?;
        Ok(self.report())
    }

    fn maybe_auto_start(&mut self) {
        if self.status != ElectionStatus::Init {
            return;
        }
        match self.readiness() {
            Ok(()) => {
                if let Err(e) = self.start() {
                    tracing::error!("{}: failed to start election: {}", self.hal.host_label(), e);
                }
            }
            Err(e) => tracing::debug!("{}: election deferred: {}", self.hal.host_label(), e),
        }
    }

    fn start(&mut self) -> Result<()> {
        for member in 0..self.hal.member_count() {
            self.store.store(member, &PersistentElectionRecord::default())?;
            self.store.erase_neighbors(member)?;
        }

        self.modes.release();
        self.topology = None;
        self.set_status(ElectionStatus::InProgress);

        let cancel = CancellationToken::new();
        let hal = Arc::clone(&self.hal);
        let settings = self.settings.clone();
        let outcome_tx = self.outcome_tx.clone();
        let token = cancel.clone();
        let worker = tokio::spawn(async move {
            let outcome = run_election(hal, settings, token).await;
            let _ = outcome_tx.send(outcome).await;
        });

        tracing::info!("{}: election started", self.hal.host_label());
        self.attempt = Some((cancel, worker));
        Ok(())
    }

    fn kill(&mut self) {
        match self.status {
            ElectionStatus::InProgress => {
                if let Some((cancel, _)) = &self.attempt {
                    tracing::info!("{}: cancelling election", self.hal.host_label());
                    cancel.cancel();
                }
            }
            ElectionStatus::Init => {
                tracing::info!("{}: election killed before it started", self.hal.host_label());
                mark_failed(&self.store, self.hal.member_count());
                self.set_status(ElectionStatus::Failure);
            }
            _ => {}
        }
    }

    fn complete(&mut self, outcome: Result<RingTopology>) {
        self.attempt = None;
        match outcome {
            Ok(topology) => {
                self.topology = Some(topology);
                self.set_status(ElectionStatus::Success);
            }
            Err(e) => {
                tracing::warn!("{}: election failed: {}", self.hal.host_label(), e);
                self.topology = None;
                self.set_status(ElectionStatus::Failure);
            }
        }
    }

    async fn stop_attempt(&mut self) {
        if let Some((cancel, worker)) = self.attempt.take() {
            cancel.cancel();
            let _ = worker.await;
            if let Ok(outcome) = self.outcome_rx.try_recv() {
                self.complete(outcome);
            }
        }
    }
}

/// Persist FAILURE outside of any attempt stage on every member
fn mark_failed(store: &RecordStore, member_count: usize) {
    let record = PersistentElectionRecord::new(ElectionStatus::Failure, LinkMask::NONE);
    for member in 0..member_count {
        if let Err(e) = store.store(member, &record) {
            tracing::error!("Failed to persist FAILURE for member {}: {}", member, e);
        }
    }
}

/// Full election: every link mask of the retry sequence until one succeeds
pub async fn run_election(
    hal: Arc<dyn DeviceHal>,
    settings: ElectionSettings,
    cancel: CancellationToken,
) -> Result<RingTopology> {
    let store = RecordStore::new(Arc::clone(&hal));
    let flags = settings.flags;
    let primary = hal.primary_member();
    let mut deadline = Instant::now() + settings.timeout();
    let mut last_error = Error::Internal("no link mask attempted".into());

    for (stage, mask) in LinkMask::retry_sequence(flags.single_link()).iter().enumerate() {
        if stage > 0 {
            let floor = Instant::now() + settings.retry_floor();
            if deadline < floor {
                tracing::info!(
                    "{}: extending election deadline by {}s for {} links",
                    hal.host_label(),
                    (floor - deadline).as_secs(),
                    mask
                );
                deadline = floor;
            }
        }

        let ctx = AttemptContext {
            hal: Arc::clone(&hal),
            store: store.clone(),
            mask: *mask,
            deadline,
            cancel: cancel.clone(),
            timing: ProtocolTiming::from(&settings),
            faulted: flags.faulted_links(),
            verbose: flags.verbose(),
        };

        tracing::info!("{}: election attempt on {} links", hal.host_label(), mask);
        match attempt(&ctx, primary).await {
            Ok(topology) => return Ok(topology),
            Err(e) if !e.is_retryable() => {
                last_error = e;
                break;
            }
            Err(e) => {
                tracing::warn!("{}: attempt on {} links failed: {}", hal.host_label(), mask, e);
                last_error = e;
            }
        }
    }

    mark_failed(&store, hal.member_count());
    Err(last_error)
}

/// One stage: vet every subordinate in index order, then elect on the primary
async fn attempt(ctx: &AttemptContext, primary: usize) -> Result<RingTopology> {
    let mut vetted = 0;
    for member in (0..ctx.hal.member_count()).filter(|m| *m != primary) {
        match VettingProtocol::new(ctx, member)?.run().await {
            Ok(()) => vetted += 1,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(_) => {}
        }
    }
    PrimaryElection::new(ctx, primary, vetted)?.run().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::ElectionFlags;
    use crate::hal::{regs, Direction, SimFabric};

    fn settings(flags: u32) -> ElectionSettings {
        ElectionSettings {
            timeout_secs: 5,
            retry_floor_secs: 2,
            poll_interval_ms: 2,
            dma_timeout_ms: 20,
            dma_retries: 2,
            progress_log_every: 100,
            flags: ElectionFlags(flags),
        }
    }

    fn spawn_all(fabric: &SimFabric, flags: u32) -> Vec<ElectionHandle> {
        (0..fabric.host_count())
            .map(|h| ElectionCoordinator::spawn(fabric.host(h), settings(flags)).unwrap().0)
            .collect()
    }

    async fn settled(handle: &ElectionHandle) -> StatusReport {
        let started = std::time::Instant::now();
        loop {
            let report = handle.status().await.unwrap();
            if report.state != ControlState::Busy {
                return report;
            }
            assert!(started.elapsed() < Duration::from_secs(20), "election never settled");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_four_host_ring() {
        let fabric = SimFabric::builder().hosts(4).members(2).seed(99).build().unwrap();
        let handles = spawn_all(&fabric, 0);

        let mut ids = Vec::new();
        let mut canonicals = Vec::new();
        for handle in &handles {
            let report = settled(handle).await;
            assert_eq!(report.state, ControlState::Success);
            ids.push(report.node_id.unwrap());
            let attrs = handle.attributes().await.unwrap();
            assert_eq!(attrs.supported_modes, "FULL_RING,HALF_A,HALF_B,SINGLE");
            canonicals.push(attrs.serial);
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3]);

        let min = (0..4).map(|h| fabric.serial(h, 0).unwrap()).min().unwrap();
        assert!(canonicals.iter().all(|c| *c == format!("{:016x}", min)));
        assert_eq!(fabric.open_queues(), 0);
    }

    #[tokio::test]
    async fn test_two_host_ring() {
        let fabric = SimFabric::builder()
            .hosts(2)
            .serials(|h, _| if h == 0 { 0x40 } else { 0x25 })
            .build()
            .unwrap();
        let handles = spawn_all(&fabric, 0);

        let report = settled(&handles[0]).await;
        assert_eq!(report.state, ControlState::Success);
        assert_eq!(report.node_id, Some(1));

        let topology = handles[0].topology().await.unwrap().unwrap();
        assert_eq!(topology.ring_size, 2);
        assert_eq!(topology.canonical, 0x25);

        let err = handles[0].set_mode(OperatingMode::FullRing).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported(OperatingMode::FullRing)));
    }

    #[tokio::test]
    async fn test_cut_link_narrows_to_right_pairs() {
        let fabric = SimFabric::builder().hosts(4).members(2).seed(7).build().unwrap();
        fabric.cut_link(0, Direction::Left);
        let handles = spawn_all(&fabric, 0);

        for (host, handle) in handles.iter().enumerate() {
            assert_eq!(settled(handle).await.state, ControlState::Success);
            let topology = handle.topology().await.unwrap().unwrap();
            assert_eq!(topology.link_mask, LinkMask::RIGHT);
            assert_eq!(topology.ring_size, 2);

            let peer = fabric.peer_host(host, Direction::Right);
            let pair_min = fabric.serial(host, 0).unwrap().min(fabric.serial(peer, 0).unwrap());
            assert_eq!(topology.canonical, pair_min);

            let attrs = handle.attributes().await.unwrap();
            assert_eq!(attrs.supported_modes, "HALF_B,SINGLE");
        }

        // Healed link: the next election forms the full ring again.
        fabric.restore_link(0, Direction::Left);
        for handle in &handles {
            handle.request_election().await.unwrap();
        }
        for handle in &handles {
            assert_eq!(settled(handle).await.state, ControlState::Success);
            let topology = handle.topology().await.unwrap().unwrap();
            assert_eq!(topology.link_mask, LinkMask::BOTH);
            assert_eq!(topology.ring_size, 4);
        }
    }

    #[tokio::test]
    async fn test_narrowed_retry_gets_deadline_floor() {
        let fabric = SimFabric::builder().hosts(2).members(2).seed(21).build().unwrap();

        // Host 0 spends its whole deadline waiting on the full ring.
        let short = ElectionSettings {
            timeout_secs: 1,
            retry_floor_secs: 3,
            ..settings(0)
        };
        let (host0, _) = ElectionCoordinator::spawn(fabric.host(0), short).unwrap();

        // Host 1 shows up late and only ever tries single links.
        tokio::time::sleep(Duration::from_millis(1300)).await;
        let (host1, _) =
            ElectionCoordinator::spawn(fabric.host(1), settings(ElectionFlags::SINGLE_LINK)).unwrap();

        for handle in [&host0, &host1] {
            assert_eq!(settled(handle).await.state, ControlState::Success);
            let topology = handle.topology().await.unwrap().unwrap();
            assert_eq!(topology.link_mask, LinkMask::RIGHT);
            assert_eq!(topology.ring_size, 2);
        }
    }

    #[tokio::test]
    async fn test_kill_fails_running_election() {
        // The peer host never runs, so host 0 waits on it until killed.
        let fabric = SimFabric::builder().hosts(2).members(2).seed(3).build().unwrap();
        let (handle, task) = ElectionCoordinator::spawn(fabric.host(0), settings(0)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.status().await.unwrap().state, ControlState::Busy);

        let killed = std::time::Instant::now();
        handle.kill().await.unwrap();
        let report = settled(&handle).await;
        assert_eq!(report.state, ControlState::Failure);
        assert_eq!(report.node_id, None);
        assert!(killed.elapsed() < Duration::from_secs(1));

        for member in 0..2 {
            assert_eq!(fabric.peek_u32(0, member, regs::NEIGHBOR_MASK).unwrap(), 0);
            let word = fabric.peek_u32(0, member, regs::RECORD_WORD).unwrap();
            assert_eq!(PersistentElectionRecord::decode(word).status, ElectionStatus::Failure);
        }
        assert_eq!(handle.attributes().await.unwrap().node_id, -1);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_before_start() {
        let fabric = SimFabric::builder().hosts(2).seed(4).build().unwrap();
        let (handle, _) =
            ElectionCoordinator::spawn(fabric.host(0), settings(ElectionFlags::SKIP_AT_LOAD)).unwrap();
        assert_eq!(handle.status().await.unwrap().state, ControlState::Busy);

        let report = handle.kill().await.unwrap();
        assert_eq!(report.state, ControlState::Failure);

        // Only SINGLE is left after a failure.
        let report = handle.request_single_node().await.unwrap();
        assert_eq!(report.state, ControlState::SingleNode);
        assert_eq!(report.node_id, Some(0));
    }

    #[tokio::test]
    async fn test_request_election_gating() {
        let fabric = SimFabric::builder().hosts(2).seed(5).build().unwrap();
        fabric.acquire_cores(0, 1);
        let handles = spawn_all(&fabric, ElectionFlags::SKIP_AT_LOAD);

        let err = handles[0].request_election().await.unwrap_err();
        assert!(matches!(err, Error::NotReady(_)));
        assert!(matches!(handles[0].set_mode(OperatingMode::Single).await, Err(Error::Busy)));

        fabric.release_cores(0, 1);
        fabric.set_reset_complete(0, false);
        assert!(matches!(handles[0].request_election().await, Err(Error::NotReady(_))));

        fabric.set_reset_complete(0, true);
        for handle in &handles {
            handle.request_election().await.unwrap();
        }
        for handle in &handles {
            assert_eq!(settled(handle).await.state, ControlState::Success);
        }
    }

    #[tokio::test]
    async fn test_reset_notification_starts_election() {
        let fabric = SimFabric::builder().hosts(2).seed(6).build().unwrap();
        fabric.set_reset_complete(0, false);
        fabric.set_reset_complete(1, false);
        let handles = spawn_all(&fabric, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handles[0].status().await.unwrap().state, ControlState::Busy);
        assert!(handles[0].topology().await.unwrap().is_none());

        for (host, handle) in handles.iter().enumerate() {
            fabric.set_reset_complete(host, true);
            handle.notify_reset_complete().await.unwrap();
        }
        for handle in &handles {
            assert_eq!(settled(handle).await.state, ControlState::Success);
        }
    }

    #[tokio::test]
    async fn test_cached_election_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let build = || {
            SimFabric::builder()
                .hosts(2)
                .members(2)
                .serials(|h, m| 0x100 + (h * 2 + m) as u64)
                .backing_dir(dir.path())
                .build()
                .unwrap()
        };

        let fabric = build();
        let handles = spawn_all(&fabric, 0);
        let mut before = Vec::new();
        for handle in &handles {
            assert_eq!(settled(handle).await.state, ControlState::Success);
            before.push(handle.topology().await.unwrap().unwrap());
            handle.shutdown().await.unwrap();
        }
        fabric.flush().unwrap();
        drop(fabric);

        // Host 1 is absent after the reload; a fresh election could not finish.
        let fabric = build();
        let (handle, _) = ElectionCoordinator::spawn(fabric.host(0), settings(0)).unwrap();
        let report = handle.status().await.unwrap();
        assert_eq!(report.state, ControlState::Success);
        assert_eq!(handle.topology().await.unwrap().unwrap(), before[0]);

        // Clearing state forgets the cached result.
        handle.shutdown().await.unwrap();
        let flags = ElectionFlags::CLEAR_STATE | ElectionFlags::SKIP_AT_LOAD;
        let (handle, _) = ElectionCoordinator::spawn(fabric.host(0), settings(flags)).unwrap();
        assert_eq!(handle.status().await.unwrap().state, ControlState::Busy);
        assert_eq!(fabric.peek_u64(0, 0, regs::CANONICAL).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mode_released_when_cores_free() {
        let fabric = SimFabric::builder().hosts(4).seed(8).build().unwrap();
        let handles = spawn_all(&fabric, 0);
        for handle in &handles {
            settled(handle).await;
        }

        let handle = &handles[0];
        fabric.acquire_cores(0, 2);
        handle.set_mode(OperatingMode::HalfA).await.unwrap();
        assert_eq!(handle.attributes().await.unwrap().supported_modes, "HALF_A");
        assert_eq!(handle.topology().await.unwrap().unwrap().ring_size, 4);

        let err = handle.set_mode(OperatingMode::FullRing).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        fabric.release_cores(0, 2);
        let started = std::time::Instant::now();
        while handle.set_mode(OperatingMode::FullRing).await.is_err() {
            assert!(started.elapsed() < Duration::from_secs(2));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.status().await.unwrap().state, ControlState::Success);
    }

    #[tokio::test]
    async fn test_injected_fault_falls_back() {
        let fabric = SimFabric::builder().hosts(2).seed(12).build().unwrap();
        let handles: Vec<_> = (0..2)
            .map(|h| {
                ElectionCoordinator::spawn(fabric.host(h), settings(ElectionFlags::FAULT_RIGHT))
                    .unwrap()
                    .0
            })
            .collect();

        for handle in &handles {
            assert_eq!(settled(handle).await.state, ControlState::Success);
            let topology = handle.topology().await.unwrap().unwrap();
            assert_eq!(topology.link_mask, LinkMask::LEFT);
        }
    }
}
