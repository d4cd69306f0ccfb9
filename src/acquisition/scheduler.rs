//! The acquisition round loop.
//!
//! [`SamplingScheduler`] owns the multiplexer (and therefore the bus) and is
//! driven from a single dedicated thread. Its lifecycle is an explicit state
//! machine:
//!
//! ```text
//! Idle ──start──► Scanning ──► Running ──stop──► Stopping ──► Stopped
//!                                 ▲    │
//!                                 └────┘ rescan (at a round boundary)
//! ```
//!
//! Commands arrive over a `std::sync::mpsc` channel and are only looked at
//! between rounds, so a round in flight always completes. The current
//! [`SchedulerStatus`] is published on a `tokio::sync::watch` channel for
//! async observers.

use std::fmt;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{ActiveChannelSet, ChannelScanner, Sample, SampleRound, SharedRound};
use crate::distribution::SampleDistributor;
use crate::error::AcquisitionError;
use crate::hardware::{BusMultiplexer, ChannelId, I2cBus};

/// Timing and fault tolerance of the round loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Period between round starts.
    pub round_interval: Duration,
    /// Consecutive failed reads after which a channel is degraded.
    pub failure_threshold: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            round_interval: Duration::from_millis(10),
            failure_threshold: 3,
        }
    }
}

/// Lifecycle state of the scheduler, ordered by progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SchedulerState {
    /// Constructed, not started.
    #[default]
    Idle,
    /// Running the startup scan.
    Scanning,
    /// Producing rounds.
    Running,
    /// Stop observed; releasing the bus.
    Stopping,
    /// Bus released; no further rounds.
    Stopped,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Commands accepted by [`SamplingScheduler::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerCommand {
    /// Finish the current round, release the bus and return.
    Stop,
    /// Re-run the channel scan and clear degraded channels.
    Rescan,
}

/// Observable scheduler state, republished on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStatus {
    /// Lifecycle state.
    pub state: SchedulerState,
    /// Channels found by the most recent scan.
    pub active: ActiveChannelSet,
    /// Active channels currently excluded after repeated failures.
    pub degraded: Vec<ChannelId>,
    /// Rounds pushed to the distributor.
    pub rounds_completed: u64,
    /// Rounds that took longer than the round interval.
    pub overruns: u64,
    /// Scans performed (startup plus re-scans).
    pub scans: u64,
}

/// Failure bookkeeping for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelHealth {
    /// Failed reads since the last success.
    pub consecutive_failures: u32,
    /// Excluded from rounds until the next scan.
    pub degraded: bool,
}

/// Periodic acquisition over the active channels.
pub struct SamplingScheduler<B: I2cBus> {
    multiplexer: BusMultiplexer<B>,
    scanner: ChannelScanner,
    settings: SchedulerSettings,
    distributor: SampleDistributor,
    active: ActiveChannelSet,
    health: [ChannelHealth; ChannelId::COUNT as usize],
    next_sequence: u64,
    status: watch::Sender<SchedulerStatus>,
}

impl<B: I2cBus> SamplingScheduler<B> {
    /// Build an idle scheduler.
    pub fn new(
        multiplexer: BusMultiplexer<B>,
        scanner: ChannelScanner,
        settings: SchedulerSettings,
        distributor: SampleDistributor,
    ) -> Self {
        let (status, _) = watch::channel(SchedulerStatus::default());
        Self {
            multiplexer,
            scanner,
            settings,
            distributor,
            active: ActiveChannelSet::new(),
            health: [ChannelHealth::default(); ChannelId::COUNT as usize],
            next_sequence: 0,
            status,
        }
    }

    /// Receiver for status updates.
    pub fn subscribe_status(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.subscribe()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SchedulerState {
        self.status.borrow().state
    }

    /// Channels found by the most recent scan.
    pub fn active(&self) -> &ActiveChannelSet {
        &self.active
    }

    /// Failure bookkeeping for `channel`.
    pub fn health(&self, channel: ChannelId) -> ChannelHealth {
        self.health[usize::from(channel.index())]
    }

    /// Settings the scheduler was built with.
    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Scan once and begin running. Does nothing unless idle.
    pub fn start(&mut self) -> &ActiveChannelSet {
        if self.state() != SchedulerState::Idle {
            debug!(state = %self.state(), "Ignoring start: scheduler already started");
            return &self.active;
        }
        self.set_state(SchedulerState::Scanning);
        self.scan();
        self.set_state(SchedulerState::Running);
        info!(
            channels = self.active.len(),
            interval = ?self.settings.round_interval,
            "Sampling scheduler running"
        );
        &self.active
    }

    /// Replace the active set with a fresh scan and clear degraded state.
    ///
    /// Only honoured while running; the caller is responsible for invoking it
    /// between rounds.
    pub fn rescan(&mut self) -> &ActiveChannelSet {
        if self.state() != SchedulerState::Running {
            debug!(state = %self.state(), "Ignoring rescan: scheduler not running");
            return &self.active;
        }
        self.scan();
        info!(channels = ?self.active.as_slice(), "Re-scan complete");
        &self.active
    }

    fn scan(&mut self) {
        let active = self.scanner.scan(&mut self.multiplexer);
        self.active = active;
        self.health = [ChannelHealth::default(); ChannelId::COUNT as usize];
        let active = self.active.clone();
        self.status.send_modify(|status| {
            status.active = active;
            status.degraded.clear();
            status.scans += 1;
        });
    }

    /// Read every non-degraded active channel once and publish the round.
    ///
    /// Channel failures skip that channel for this round only.
    pub fn run_round(&mut self) -> SharedRound {
        let mut builder = SampleRound::builder(self.next_sequence);
        self.next_sequence += 1;

        let channels: Vec<ChannelId> = self
            .active
            .iter()
            .filter(|channel| !self.health(*channel).degraded)
            .collect();

        for channel in channels {
            match self.read_channel(channel) {
                Ok(sample) => {
                    self.health[usize::from(channel.index())].consecutive_failures = 0;
                    builder.push(sample);
                }
                Err(err) => self.record_failure(channel, &err),
            }
        }

        let round = Arc::new(builder.finish());
        self.distributor.publish(Arc::clone(&round));
        self.status.send_modify(|status| status.rounds_completed += 1);
        round
    }

    fn read_channel(&mut self, channel: ChannelId) -> Result<Sample, AcquisitionError> {
        let device = self.scanner.factory().create(channel);
        let mut link = self.multiplexer.select(channel)?;
        let reading = device.read_fifo(&mut link)?;
        Ok(Sample::new(channel, reading, Instant::now()))
    }

    fn record_failure(&mut self, channel: ChannelId, err: &AcquisitionError) {
        let threshold = self.settings.failure_threshold;
        let health = &mut self.health[usize::from(channel.index())];
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        let failures = health.consecutive_failures;

        if failures == 1 {
            warn!(%channel, error = %err, "Channel read failed, skipping for this round");
        } else {
            debug!(%channel, failures, error = %err, "Channel read failed again");
        }

        if failures >= threshold && !health.degraded {
            health.degraded = true;
            warn!(%channel, failures, "Channel degraded, excluded until re-scan");
            self.status.send_modify(|status| {
                status.degraded.push(channel);
                status.degraded.sort_unstable();
            });
        }
    }

    /// Start, then produce rounds at the configured interval until a
    /// [`SchedulerCommand::Stop`] arrives or the command channel closes.
    ///
    /// A round that outlasts the interval is counted as an overrun and the
    /// next round starts immediately.
    pub fn run(&mut self, commands: &Receiver<SchedulerCommand>) {
        self.start();
        let interval = self.settings.round_interval;

        loop {
            let round_start = Instant::now();
            self.run_round();

            let mut deadline = round_start + interval;
            let finished = Instant::now();
            if finished > deadline {
                let overrun = finished - deadline;
                debug!(?overrun, "Round overran its interval");
                self.status.send_modify(|status| status.overruns += 1);
                deadline = finished;
            }

            loop {
                let timeout = deadline.saturating_duration_since(Instant::now());
                match commands.recv_timeout(timeout) {
                    Ok(SchedulerCommand::Rescan) => {
                        self.rescan();
                    }
                    Ok(SchedulerCommand::Stop) | Err(RecvTimeoutError::Disconnected) => {
                        self.stop();
                        return;
                    }
                    Err(RecvTimeoutError::Timeout) => break,
                }
            }
        }
    }

    /// Stop producing rounds and release the bus. Idempotent.
    pub fn stop(&mut self) {
        match self.state() {
            SchedulerState::Stopping | SchedulerState::Stopped => return,
            _ => {}
        }
        self.set_state(SchedulerState::Stopping);
        self.multiplexer.release();
        self.set_state(SchedulerState::Stopped);
        info!(rounds = self.next_sequence, "Sampling scheduler stopped");
    }

    fn set_state(&self, state: SchedulerState) {
        debug!(%state, "Scheduler state change");
        self.status.send_modify(|status| status.state = state);
    }
}

impl<B: I2cBus> fmt::Debug for SamplingScheduler<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplingScheduler")
            .field("state", &self.state())
            .field("active", &self.active)
            .field("settings", &self.settings)
            .field("next_sequence", &self.next_sequence)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::DistributorConfig;
    use crate::hardware::registers::{DEFAULT_DEVICE_ADDRESS, DEFAULT_MULTIPLEXER_ADDRESS};
    use crate::hardware::{DeviceFactory, SimulatedBus, SimulatedHardware};
    use std::sync::mpsc;

    const RECORD: [u8; 6] = [0x01, 0x02, 0x03, 0x00, 0x10, 0x20];

    fn ch(index: u8) -> ChannelId {
        ChannelId::new(index).unwrap()
    }

    fn scheduler(
        channels: &[u8],
        settings: SchedulerSettings,
    ) -> (SamplingScheduler<SimulatedBus>, SimulatedHardware, SampleDistributor) {
        let bus = SimulatedBus::with_sensors(channels.iter().map(|index| ch(*index)), RECORD);
        let hardware = bus.hardware();
        let distributor = SampleDistributor::new(DistributorConfig::new(64));
        let scheduler = SamplingScheduler::new(
            BusMultiplexer::new(bus, DEFAULT_MULTIPLEXER_ADDRESS),
            ChannelScanner::new(DeviceFactory::new(DEFAULT_DEVICE_ADDRESS)),
            settings,
            distributor.clone(),
        );
        (scheduler, hardware, distributor)
    }

    #[test]
    fn start_scans_exactly_once() {
        let (mut scheduler, _hardware, _distributor) = scheduler(&[1, 4], SchedulerSettings::default());
        let status = scheduler.subscribe_status();
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        scheduler.start();
        scheduler.start();

        assert_eq!(scheduler.state(), SchedulerState::Running);
        assert_eq!(status.borrow().scans, 1);
        assert_eq!(status.borrow().active.as_slice(), &[ch(1), ch(4)]);
    }

    #[test]
    fn failing_channel_does_not_block_the_others() {
        let all: Vec<u8> = (0..8).collect();
        let (mut scheduler, hardware, _distributor) = scheduler(&all, SchedulerSettings::default());
        scheduler.start();
        hardware.fail_select(ch(3));

        for _ in 0..5 {
            let round = scheduler.run_round();
            let channels: Vec<u8> = round.channels().map(ChannelId::index).collect();
            assert_eq!(channels, vec![0, 1, 2, 4, 5, 6, 7]);
        }
    }

    #[test]
    fn repeated_failures_degrade_until_rescan() {
        let settings = SchedulerSettings {
            failure_threshold: 3,
            ..SchedulerSettings::default()
        };
        let (mut scheduler, hardware, _distributor) = scheduler(&[0, 2], settings);
        let status = scheduler.subscribe_status();
        scheduler.start();
        hardware.fail_fifo(ch(2));

        for _ in 0..2 {
            scheduler.run_round();
        }
        assert!(!scheduler.health(ch(2)).degraded);
        assert_eq!(scheduler.health(ch(2)).consecutive_failures, 2);

        scheduler.run_round();
        assert!(scheduler.health(ch(2)).degraded);
        assert_eq!(status.borrow().degraded, vec![ch(2)]);

        hardware.heal(ch(2));
        let round = scheduler.run_round();
        assert!(round.get(ch(2)).is_none(), "degraded channel must be skipped");

        scheduler.rescan();
        assert!(status.borrow().degraded.is_empty());
        let round = scheduler.run_round();
        assert!(round.get(ch(2)).is_some());
    }

    #[test]
    fn success_resets_failure_streak() {
        let (mut scheduler, hardware, _distributor) = scheduler(&[5], SchedulerSettings::default());
        scheduler.start();
        hardware.fail_fifo(ch(5));
        scheduler.run_round();
        scheduler.run_round();
        hardware.heal(ch(5));
        scheduler.run_round();
        assert_eq!(scheduler.health(ch(5)), ChannelHealth::default());
    }

    #[test]
    fn rounds_are_sequenced_and_published() {
        let (mut scheduler, _hardware, distributor) = scheduler(&[0, 3], SchedulerSettings::default());
        let (_id, receiver) = distributor.subscribe("test");
        scheduler.start();

        let first = scheduler.run_round();
        let second = scheduler.run_round();
        assert_eq!(first.sequence(), 0);
        assert_eq!(second.sequence(), 1);
        assert!(second.started_at() >= first.started_at());

        let delivered = receiver.try_recv().unwrap();
        assert!(Arc::ptr_eq(&delivered, &first));
    }

    #[test]
    fn run_stops_on_command_and_releases_bus() {
        let settings = SchedulerSettings {
            round_interval: Duration::from_millis(1),
            ..SchedulerSettings::default()
        };
        let (mut scheduler, hardware, _distributor) = scheduler(&[0], settings);
        let status = scheduler.subscribe_status();
        let (tx, rx) = mpsc::channel();
        tx.send(SchedulerCommand::Rescan).unwrap();
        tx.send(SchedulerCommand::Stop).unwrap();

        scheduler.run(&rx);

        let status = status.borrow();
        assert_eq!(status.state, SchedulerState::Stopped);
        assert_eq!(status.scans, 2);
        assert!(status.rounds_completed >= 1);
        assert!(!hardware.is_open());
    }

    /// Simulated bus whose reads take longer than a round interval.
    struct SlowBus {
        inner: SimulatedBus,
        delay: Duration,
    }

    impl I2cBus for SlowBus {
        fn set_address(&mut self, address: u8) -> std::io::Result<()> {
            self.inner.set_address(address)
        }

        fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
            self.inner.write(bytes)
        }

        fn read(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(self.delay);
            self.inner.read(buffer)
        }

        fn reopen(&mut self) -> std::io::Result<()> {
            self.inner.reopen()
        }

        fn close(&mut self) {
            self.inner.close();
        }
    }

    #[test]
    fn slow_rounds_are_counted_as_overruns_and_keep_running() {
        let bus = SlowBus {
            inner: SimulatedBus::with_sensors([ch(0)], RECORD),
            delay: Duration::from_millis(4),
        };
        let distributor = SampleDistributor::new(DistributorConfig::new(8));
        let mut scheduler = SamplingScheduler::new(
            BusMultiplexer::new(bus, DEFAULT_MULTIPLEXER_ADDRESS),
            ChannelScanner::new(DeviceFactory::new(DEFAULT_DEVICE_ADDRESS)),
            SchedulerSettings {
                round_interval: Duration::from_millis(1),
                ..SchedulerSettings::default()
            },
            distributor,
        );
        let status = scheduler.subscribe_status();
        let (tx, rx) = mpsc::channel();

        let worker = std::thread::spawn(move || scheduler.run(&rx));
        std::thread::sleep(Duration::from_millis(200));
        tx.send(SchedulerCommand::Stop).unwrap();
        worker.join().unwrap();

        let status = status.borrow();
        assert_eq!(status.state, SchedulerState::Stopped);
        assert!(status.rounds_completed >= 5, "rounds={}", status.rounds_completed);
        assert!(status.overruns > 0);
        // Every round reads the FIFO once and outlasts the interval.
        assert!(status.overruns + 1 >= status.rounds_completed);
        assert!(status.degraded.is_empty());
    }

    #[test]
    fn stop_is_idempotent() {
        let (mut scheduler, hardware, _distributor) = scheduler(&[0], SchedulerSettings::default());
        scheduler.start();
        scheduler.stop();
        scheduler.stop();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(!hardware.is_open());
    }
}
