//! Engine start, run and shutdown against the simulated bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use ppg_daq::acquisition::{SchedulerState, SharedRound};
use ppg_daq::hardware::{ChannelId, SimulatedBus};
use ppg_daq::{AcquisitionEngine, EngineError, SampleSink, Settings};
use tokio::sync::mpsc;
use tokio::time::timeout;

const RECORD: [u8; 6] = [0x01, 0x02, 0x03, 0x00, 0x10, 0x20];
const WAIT: Duration = Duration::from_secs(10);

fn ch(index: u8) -> ChannelId {
    ChannelId::new(index).unwrap()
}

fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.acquisition.round_interval = Duration::from_millis(1);
    settings.acquisition.reset_settle = Duration::ZERO;
    settings
}

/// Forwards every round it consumes and records whether it was closed.
struct Forwarding {
    rounds: mpsc::UnboundedSender<SharedRound>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl SampleSink for Forwarding {
    fn name(&self) -> &str {
        "forwarding"
    }

    async fn consume(&mut self, round: SharedRound) -> Result<()> {
        let _ = self.rounds.send(round);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_rounds_reach_registered_sink_in_order() {
    let bus = SimulatedBus::with_sensors([ch(0), ch(3)], RECORD);
    let engine = AcquisitionEngine::new(&fast_settings());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    engine
        .register_sink(Forwarding {
            rounds: tx,
            closed: Arc::clone(&closed),
        })
        .unwrap();

    let handle = engine.start_with_bus(bus).unwrap();

    let mut previous = None;
    for _ in 0..20 {
        let round = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        let channels: Vec<_> = round.channels().collect();
        assert_eq!(channels, vec![ch(0), ch(3)]);
        for sample in round.samples() {
            assert_eq!(sample.red(), 0x010203);
            assert_eq!(sample.infrared(), 0x001020);
        }
        if let Some(previous) = previous {
            assert!(round.sequence() > previous);
        }
        previous = Some(round.sequence());
    }

    timeout(WAIT, handle.shutdown()).await.unwrap().unwrap();
    assert!(closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_shutdown_stops_thread_and_releases_bus() {
    let bus = SimulatedBus::with_sensors([ch(1)], RECORD);
    let hardware = bus.hardware();
    let engine = AcquisitionEngine::new(&fast_settings());
    let handle = engine.start_with_bus(bus).unwrap();

    handle
        .wait_for(|status| status.rounds_completed >= 5)
        .await
        .unwrap();
    let status = handle.status_receiver();
    timeout(WAIT, handle.shutdown()).await.unwrap().unwrap();

    assert_eq!(status.borrow().state, SchedulerState::Stopped);
    assert!(!hardware.is_open());
}

#[tokio::test]
async fn test_missing_bus_device_fails_start() {
    let mut settings = fast_settings();
    settings.bus.device_path = "/dev/ppg-daq-no-such-bus".into();
    let engine = AcquisitionEngine::new(&settings);

    match engine.start() {
        Err(EngineError::BusUnavailable { path, .. }) => {
            assert_eq!(path, settings.bus.device_path);
        }
        other => panic!("expected BusUnavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failing_channel_is_isolated_while_running() {
    let bus = SimulatedBus::with_sensors(ChannelId::all(), RECORD);
    let hardware = bus.hardware();
    let engine = AcquisitionEngine::new(&fast_settings());
    let (_id, mut receiver) = engine.subscribe("observer");
    let handle = engine.start_with_bus(bus).unwrap();

    handle
        .wait_for(|status| status.rounds_completed >= 3)
        .await
        .unwrap();
    hardware.fail_select(ch(3));
    let status = timeout(WAIT, handle.wait_for(|status| status.degraded.contains(&ch(3))))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.active.len(), 8);

    // Drain what was queued before the fault took hold, then look at fresh rounds.
    while receiver.try_recv().is_some() {}
    for _ in 0..5 {
        let round = timeout(WAIT, receiver.recv()).await.unwrap().unwrap();
        assert!(round.get(ch(3)).is_none());
        assert_eq!(round.len(), 7);
    }

    hardware.heal(ch(3));
    handle.rescan().unwrap();
    timeout(
        WAIT,
        handle.wait_for(|status| status.scans >= 2 && status.degraded.is_empty()),
    )
    .await
    .unwrap()
    .unwrap();

    timeout(WAIT, handle.shutdown()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_scan_reports_channels_and_closes_bus() {
    let bus = SimulatedBus::with_sensors([ch(2), ch(7)], RECORD);
    let hardware = bus.hardware();
    let engine = AcquisitionEngine::new(&fast_settings());

    let report = engine.scan_with_bus(bus);

    assert_eq!(report.active().as_slice(), &[ch(2), ch(7)]);
    assert!(!hardware.is_open());
}

#[tokio::test]
async fn test_invalid_settings_are_rejected_before_acquiring() {
    let bus = SimulatedBus::with_sensors([ch(0)], RECORD);
    let hardware = bus.hardware();
    let mut settings = fast_settings();
    settings.acquisition.round_interval = Duration::ZERO;
    let engine = AcquisitionEngine::new(&settings);

    assert!(matches!(
        engine.start_with_bus(bus),
        Err(EngineError::Configuration(_))
    ));
    assert!(hardware.register_writes(ch(0)).is_empty());

    let mut settings = fast_settings();
    settings.acquisition.failure_threshold = 0;
    settings.bus.device_path = "/dev/ppg-daq-no-such-bus".into();
    let engine = AcquisitionEngine::new(&settings);
    assert!(matches!(engine.start(), Err(EngineError::Configuration(_))));
}
