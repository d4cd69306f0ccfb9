//! A stalled sink must not slow acquisition or starve other sinks.

use std::time::{Duration, Instant};

use ppg_daq::hardware::{ChannelId, SimulatedBus};
use ppg_daq::{AcquisitionEngine, Settings};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn settings(capacity: usize, round_interval: Duration) -> Settings {
    let mut settings = Settings::default();
    settings.acquisition.round_interval = round_interval;
    settings.acquisition.reset_settle = Duration::ZERO;
    settings.distribution.queue_capacity = capacity;
    settings
}

#[tokio::test]
async fn test_stalled_sink_drops_oldest_while_rounds_continue() {
    const ROUNDS: u64 = 50;
    let interval = Duration::from_millis(10);
    let channels = [ChannelId::new(0).unwrap(), ChannelId::new(4).unwrap()];
    let bus = SimulatedBus::with_sensors(channels, [0, 0, 1, 0, 0, 2]);
    let engine = AcquisitionEngine::new(&settings(4, interval));
    let (_stalled_id, stalled) = engine.subscribe("stalled");
    let (_live_id, mut live) = engine.subscribe("live");
    let handle = engine.start_with_bus(bus).unwrap();

    let first = timeout(WAIT, live.recv()).await.unwrap().unwrap();
    let started = Instant::now();

    // Keep the live sink drained while the stalled one is never read.
    let mut last_seen = first.sequence();
    while last_seen < first.sequence() + ROUNDS {
        let round = timeout(WAIT, live.recv()).await.unwrap().unwrap();
        assert!(round.sequence() > last_seen);
        assert_eq!(round.len(), 2);
        last_seen = round.sequence();
    }
    let elapsed = started.elapsed();

    // At least half the nominal rate despite the stalled queue.
    let rounds_per_second = (last_seen - first.sequence()) as f64 / elapsed.as_secs_f64();
    let nominal = 1.0 / interval.as_secs_f64();
    assert!(
        rounds_per_second >= nominal * 0.5,
        "{rounds_per_second:.1} rounds/s over {elapsed:?}, nominal {nominal:.0}"
    );

    let distributor = handle.distributor().clone();
    timeout(WAIT, handle.shutdown()).await.unwrap().unwrap();

    let metrics = distributor.metrics_snapshot();
    let stalled_metrics = metrics.iter().find(|m| m.sink == "stalled").unwrap();
    assert!(stalled_metrics.total_published > ROUNDS);
    assert_eq!(stalled_metrics.queue_capacity, 4);
    assert_eq!(stalled_metrics.queue_occupancy, 4);
    assert_eq!(
        stalled_metrics.total_dropped,
        stalled_metrics.total_published - 4
    );

    // The stalled queue holds the most recent rounds, oldest first.
    let mut kept = Vec::new();
    while let Some(round) = stalled.try_recv() {
        kept.push(round.sequence());
    }
    assert_eq!(kept.len(), 4);
    assert!(kept.windows(2).all(|pair| pair[1] == pair[0] + 1));
    assert_eq!(kept[3] + 1, stalled_metrics.total_published);
}

#[tokio::test]
async fn test_dropped_receiver_does_not_block_publishing() {
    let channel = ChannelId::new(5).unwrap();
    let bus = SimulatedBus::with_sensors([channel], [0, 0, 1, 0, 0, 2]);
    let engine = AcquisitionEngine::new(&settings(2, Duration::from_millis(1)));
    let (_gone_id, gone) = engine.subscribe("gone");
    drop(gone);
    let (_live_id, mut live) = engine.subscribe("live");
    let handle = engine.start_with_bus(bus).unwrap();

    for _ in 0..10 {
        let round = timeout(WAIT, live.recv()).await.unwrap().unwrap();
        assert_eq!(round.len(), 1);
    }
    handle
        .wait_for(|status| status.rounds_completed >= 20)
        .await
        .unwrap();

    timeout(WAIT, handle.shutdown()).await.unwrap().unwrap();
}
