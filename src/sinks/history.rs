//! Rolling per-channel history for live display.
//!
//! [`LiveHistory`] is a sink that keeps the last `capacity` red/infrared
//! values of every channel. A chart reads them through a [`HistoryView`],
//! which takes a short read lock and copies out a [`HistorySnapshot`], so
//! the renderer never holds the lock while drawing.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::acquisition::SharedRound;
use crate::distribution::SampleSink;
use crate::hardware::ChannelId;

/// One channel's trace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelTrace {
    /// Red values, oldest first.
    pub red: Vec<u32>,
    /// Infrared values, oldest first.
    pub infrared: Vec<u32>,
}

/// Copy of the history at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistorySnapshot {
    /// Sequence of the newest round seen, if any.
    pub last_sequence: Option<u64>,
    /// Traces of every channel that has produced a sample.
    pub channels: BTreeMap<ChannelId, ChannelTrace>,
    /// Mean over the configured channel group, if one is configured.
    pub group_mean: Option<ChannelTrace>,
}

#[derive(Debug, Default)]
struct Trace {
    red: VecDeque<u32>,
    infrared: VecDeque<u32>,
}

impl Trace {
    fn push(&mut self, red: u32, infrared: u32, capacity: usize) {
        if self.red.len() >= capacity {
            self.red.pop_front();
            self.infrared.pop_front();
        }
        self.red.push_back(red);
        self.infrared.push_back(infrared);
    }

    fn to_trace(&self) -> ChannelTrace {
        ChannelTrace {
            red: self.red.iter().copied().collect(),
            infrared: self.infrared.iter().copied().collect(),
        }
    }
}

#[derive(Debug, Default)]
struct HistoryState {
    last_sequence: Option<u64>,
    channels: BTreeMap<ChannelId, Trace>,
    group_mean: Trace,
}

/// Read handle to a [`LiveHistory`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HistoryView {
    state: Arc<RwLock<HistoryState>>,
    has_group: bool,
}

impl HistoryView {
    /// Copy the current traces.
    pub fn snapshot(&self) -> HistorySnapshot {
        let state = self.state.read();
        HistorySnapshot {
            last_sequence: state.last_sequence,
            channels: state
                .channels
                .iter()
                .map(|(channel, trace)| (*channel, trace.to_trace()))
                .collect(),
            group_mean: self.has_group.then(|| state.group_mean.to_trace()),
        }
    }

    /// Number of values held for `channel`.
    pub fn len(&self, channel: ChannelId) -> usize {
        self.state
            .read()
            .channels
            .get(&channel)
            .map_or(0, |trace| trace.red.len())
    }
}

/// Sink keeping bounded per-channel history.
#[derive(Debug)]
pub struct LiveHistory {
    capacity: usize,
    group: Vec<ChannelId>,
    state: Arc<RwLock<HistoryState>>,
}

impl LiveHistory {
    /// History of `capacity` values per channel.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            group: Vec::new(),
            state: Arc::default(),
        }
    }

    /// Also keep the mean of `group` as a combined trace.
    pub fn with_group_mean(mut self, group: impl IntoIterator<Item = ChannelId>) -> Self {
        self.group = group.into_iter().collect();
        self
    }

    /// Read handle sharing this history.
    pub fn view(&self) -> HistoryView {
        HistoryView {
            state: Arc::clone(&self.state),
            has_group: !self.group.is_empty(),
        }
    }
}

#[async_trait]
impl SampleSink for LiveHistory {
    fn name(&self) -> &str {
        "live-history"
    }

    async fn consume(&mut self, round: SharedRound) -> Result<()> {
        let mut state = self.state.write();
        for sample in round.samples() {
            state
                .channels
                .entry(sample.channel())
                .or_default()
                .push(sample.red(), sample.infrared(), self.capacity);
        }
        if !self.group.is_empty() {
            if let Some((red, infrared)) = round.mean_over(&self.group) {
                state.group_mean.push(red, infrared, self.capacity);
            }
        }
        state.last_sequence = Some(round.sequence());
        Ok(())
    }
}
