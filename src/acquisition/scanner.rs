//! Startup discovery of responding sensors.

use tracing::{debug, info, warn};

use super::ActiveChannelSet;
use crate::error::{BusError, DeviceError};
use crate::hardware::{BusMultiplexer, ChannelId, DeviceFactory, I2cBus};

/// What happened to one channel during a scan.
#[derive(Debug)]
pub enum ChannelOutcome {
    /// Sensor found and initialized.
    Active,
    /// The multiplexer could not be routed to the channel.
    SelectFailed(BusError),
    /// No sensor answered the probe.
    Absent,
    /// A sensor answered but register programming failed.
    InitFailed(DeviceError),
}

impl ChannelOutcome {
    /// True for [`ChannelOutcome::Active`].
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Per-channel results of one scan, in channel order.
#[derive(Debug)]
pub struct ScanReport {
    outcomes: Vec<(ChannelId, ChannelOutcome)>,
}

impl ScanReport {
    /// Outcome of every channel, ascending.
    pub fn outcomes(&self) -> &[(ChannelId, ChannelOutcome)] {
        &self.outcomes
    }

    /// Outcome for one channel.
    pub fn outcome(&self, channel: ChannelId) -> Option<&ChannelOutcome> {
        self.outcomes
            .iter()
            .find(|(scanned, _)| *scanned == channel)
            .map(|(_, outcome)| outcome)
    }

    /// Channels whose sensor was found and initialized.
    pub fn active(&self) -> ActiveChannelSet {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_active())
            .map(|(channel, _)| *channel)
            .collect()
    }
}

/// Probes all multiplexer channels and initializes the sensors it finds.
#[derive(Debug, Clone, Copy)]
pub struct ChannelScanner {
    factory: DeviceFactory,
}

impl ChannelScanner {
    /// Scanner building devices with `factory`.
    pub fn new(factory: DeviceFactory) -> Self {
        Self { factory }
    }

    /// Device factory used for probing and initialization.
    pub fn factory(&self) -> &DeviceFactory {
        &self.factory
    }

    /// Scan channels 0..7 and return those with an initialized sensor.
    ///
    /// Channels that fail select, probe or initialization are skipped without
    /// retry. An empty result is valid.
    pub fn scan<B: I2cBus>(&self, multiplexer: &mut BusMultiplexer<B>) -> ActiveChannelSet {
        self.scan_detailed(multiplexer).active()
    }

    /// Like [`scan`](Self::scan), reporting why each channel was kept or
    /// skipped.
    pub fn scan_detailed<B: I2cBus>(&self, multiplexer: &mut BusMultiplexer<B>) -> ScanReport {
        let outcomes: Vec<_> = ChannelId::all()
            .map(|channel| (channel, self.scan_channel(multiplexer, channel)))
            .collect();
        let report = ScanReport { outcomes };

        let active = report.active();
        if active.is_empty() {
            warn!("Channel scan found no responding sensors");
        } else {
            info!(channels = ?active.as_slice(), "Channel scan complete");
        }
        report
    }

    fn scan_channel<B: I2cBus>(&self, multiplexer: &mut BusMultiplexer<B>, channel: ChannelId) -> ChannelOutcome {
        let mut link = match multiplexer.select(channel) {
            Ok(link) => link,
            Err(err) => {
                warn!(%channel, error = %err, "Skipping channel: select failed");
                return ChannelOutcome::SelectFailed(err);
            }
        };

        let device = self.factory.create(channel);
        if !device.probe(&mut link) {
            debug!(%channel, "No sensor on channel");
            return ChannelOutcome::Absent;
        }

        match device.initialize(&mut link) {
            Ok(()) => ChannelOutcome::Active,
            Err(err) => {
                warn!(%channel, error = %err, "Skipping channel: sensor initialization failed");
                ChannelOutcome::InitFailed(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::registers::{DEFAULT_DEVICE_ADDRESS, DEFAULT_MULTIPLEXER_ADDRESS};
    use crate::hardware::SimulatedBus;
    use tracing_test::traced_test;

    const RECORD: [u8; 6] = [0x01, 0x02, 0x03, 0x00, 0x10, 0x20];

    fn ch(index: u8) -> ChannelId {
        ChannelId::new(index).unwrap()
    }

    fn scanner() -> ChannelScanner {
        ChannelScanner::new(DeviceFactory::new(DEFAULT_DEVICE_ADDRESS))
    }

    #[test]
    fn scan_is_deterministic() {
        let bus = SimulatedBus::with_sensors([ch(6), ch(0), ch(3)], RECORD);
        let mut mux = BusMultiplexer::new(bus, DEFAULT_MULTIPLEXER_ADDRESS);

        let first = scanner().scan(&mut mux);
        let second = scanner().scan(&mut mux);
        assert_eq!(first.as_slice(), &[ch(0), ch(3), ch(6)]);
        assert_eq!(first, second);
    }

    #[test]
    fn failing_select_is_skipped_not_fatal() {
        let bus = SimulatedBus::with_sensors([ch(1), ch(2), ch(3)], RECORD);
        bus.hardware().fail_select(ch(2));
        let mut mux = BusMultiplexer::new(bus, DEFAULT_MULTIPLEXER_ADDRESS);

        let report = scanner().scan_detailed(&mut mux);
        assert_eq!(report.active().as_slice(), &[ch(1), ch(3)]);
        assert!(matches!(report.outcome(ch(2)), Some(ChannelOutcome::SelectFailed(_))));
        assert!(matches!(report.outcome(ch(5)), Some(ChannelOutcome::Absent)));
    }

    #[test]
    #[traced_test]
    fn empty_scan_warns() {
        let mut mux = BusMultiplexer::new(SimulatedBus::new(), DEFAULT_MULTIPLEXER_ADDRESS);
        assert!(scanner().scan(&mut mux).is_empty());
        assert!(logs_contain("no responding sensors"));
    }
}
