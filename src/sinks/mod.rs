//! Ready-made consumers for the sample distributor.
//!
//! - [`history`] - bounded per-channel history for a live chart
//! - [`publish`] - per-sample and batched network publishing

pub mod history;
pub mod publish;

pub use history::{ChannelTrace, HistorySnapshot, HistoryView, LiveHistory};
pub use publish::{
    BatchAccumulator, BatchData, BatchPayload, BatchPublishSink, LogPublisher, Publisher,
    RetryPolicy, SampleMessage, SamplePublishSink,
};
