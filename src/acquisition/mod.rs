//! Acquisition data model, channel scanning and the round loop.
//!
//! # Architecture
//!
//! ```text
//! ChannelScanner ──► ActiveChannelSet ──► SamplingScheduler ──► SampleDistributor
//!                                             │
//!                            BusMultiplexer::select + SensorDevice::read_fifo
//! ```
//!
//! - [`ChannelScanner`] probes channels 0..7 once and initializes every sensor
//!   that answers.
//! - [`SamplingScheduler`] reads each active channel once per round and pushes
//!   the finished [`SampleRound`] to the distributor.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::hardware::{ChannelId, FifoReading};

pub mod scanner;
pub mod scheduler;

pub use scanner::{ChannelOutcome, ChannelScanner, ScanReport};
pub use scheduler::{
    ChannelHealth, SamplingScheduler, SchedulerCommand, SchedulerSettings, SchedulerState,
    SchedulerStatus,
};

/// One red/infrared reading from one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    channel: ChannelId,
    red: u32,
    infrared: u32,
    timestamp: Instant,
}

impl Sample {
    /// Build a sample from a decoded FIFO reading.
    pub fn new(channel: ChannelId, reading: FifoReading, timestamp: Instant) -> Self {
        Self {
            channel,
            red: reading.red,
            infrared: reading.infrared,
            timestamp,
        }
    }

    /// Channel the reading came from.
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Red LED intensity (18 bits).
    pub fn red(&self) -> u32 {
        self.red
    }

    /// Infrared LED intensity (18 bits).
    pub fn infrared(&self) -> u32 {
        self.infrared
    }

    /// Monotonic time the FIFO read completed.
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }
}

/// Ascending, duplicate-free set of channels with a responding sensor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ActiveChannelSet(Vec<ChannelId>);

impl ActiveChannelSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `channel` is in the set.
    pub fn contains(&self, channel: ChannelId) -> bool {
        self.0.binary_search(&channel).is_ok()
    }

    /// Channels in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.0.iter().copied()
    }

    /// Channels as a slice.
    pub fn as_slice(&self) -> &[ChannelId] {
        &self.0
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no channel responded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<ChannelId> for ActiveChannelSet {
    fn from_iter<I: IntoIterator<Item = ChannelId>>(iter: I) -> Self {
        let mut channels: Vec<ChannelId> = iter.into_iter().collect();
        channels.sort_unstable();
        channels.dedup();
        Self(channels)
    }
}

impl<'a> IntoIterator for &'a ActiveChannelSet {
    type Item = ChannelId;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, ChannelId>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter().copied()
    }
}

/// Samples gathered in one pass over the active channels.
///
/// Samples are in ascending channel order with at most one per channel.
/// Rounds are immutable once built and are shared as `Arc<SampleRound>`.
#[derive(Debug, Clone)]
pub struct SampleRound {
    sequence: u64,
    started_at: Instant,
    wall_clock: DateTime<Utc>,
    samples: Vec<Sample>,
}

/// Shared handle to a finished round.
pub type SharedRound = Arc<SampleRound>;

impl SampleRound {
    /// Start building round `sequence`, stamped now.
    pub fn builder(sequence: u64) -> RoundBuilder {
        RoundBuilder {
            round: SampleRound {
                sequence,
                started_at: Instant::now(),
                wall_clock: Utc::now(),
                samples: Vec::with_capacity(usize::from(ChannelId::COUNT)),
            },
        }
    }

    /// Position of this round in the scheduler's output, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Monotonic start time of the round.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Wall-clock start time of the round.
    pub fn wall_clock(&self) -> DateTime<Utc> {
        self.wall_clock
    }

    /// Samples in channel order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Sample for `channel`, if it was read this round.
    pub fn get(&self, channel: ChannelId) -> Option<&Sample> {
        self.samples
            .binary_search_by_key(&channel, Sample::channel)
            .ok()
            .map(|index| &self.samples[index])
    }

    /// Channels that produced a sample.
    pub fn channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.samples.iter().map(Sample::channel)
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True for a round without samples (nothing active, or every read failed).
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Integer mean of red and infrared over the listed channels present in
    /// this round, or `None` if none of them is.
    ///
    /// Used by consumers that display a combined trace for a group of
    /// neighbouring sensors.
    pub fn mean_over(&self, channels: &[ChannelId]) -> Option<(u32, u32)> {
        let (count, red, infrared) = channels
            .iter()
            .filter_map(|channel| self.get(*channel))
            .fold((0u64, 0u64, 0u64), |(n, r, i), sample| {
                (n + 1, r + u64::from(sample.red), i + u64::from(sample.infrared))
            });
        if count == 0 {
            return None;
        }
        // Means of 18-bit values always fit in u32.
        Some(((red / count) as u32, (infrared / count) as u32))
    }
}

/// Accumulates samples for one round in channel order.
#[derive(Debug)]
pub struct RoundBuilder {
    round: SampleRound,
}

impl RoundBuilder {
    /// Append a sample. Rejected (returns `false`) unless its channel is
    /// strictly greater than the last one pushed.
    pub fn push(&mut self, sample: Sample) -> bool {
        if let Some(last) = self.round.samples.last() {
            if sample.channel <= last.channel {
                return false;
            }
        }
        self.round.samples.push(sample);
        true
    }

    /// Finish the round.
    pub fn finish(self) -> SampleRound {
        self.round
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(index: u8) -> ChannelId {
        ChannelId::new(index).unwrap()
    }

    fn sample(index: u8, red: u32, infrared: u32) -> Sample {
        Sample::new(ch(index), FifoReading { red, infrared }, Instant::now())
    }

    #[test]
    fn active_set_is_sorted_and_unique() {
        let set: ActiveChannelSet = [ch(5), ch(1), ch(5), ch(3)].into_iter().collect();
        assert_eq!(set.as_slice(), &[ch(1), ch(3), ch(5)]);
        assert!(set.contains(ch(3)));
        assert!(!set.contains(ch(4)));
    }

    #[test]
    fn builder_rejects_duplicate_and_out_of_order_channels() {
        let mut builder = SampleRound::builder(0);
        assert!(builder.push(sample(2, 1, 1)));
        assert!(!builder.push(sample(2, 9, 9)));
        assert!(!builder.push(sample(1, 9, 9)));
        assert!(builder.push(sample(4, 1, 1)));
        let round = builder.finish();
        assert_eq!(round.channels().collect::<Vec<_>>(), vec![ch(2), ch(4)]);
        assert_eq!(round.get(ch(2)).map(Sample::red), Some(1));
        assert!(round.get(ch(3)).is_none());
    }

    #[test]
    fn mean_over_ignores_missing_channels() {
        let mut builder = SampleRound::builder(7);
        builder.push(sample(2, 100, 10));
        builder.push(sample(3, 200, 30));
        let round = builder.finish();

        assert_eq!(round.mean_over(&[ch(2), ch(3), ch(4)]), Some((150, 20)));
        assert_eq!(round.mean_over(&[ch(5)]), None);
        assert_eq!(round.sequence(), 7);
    }
}
