//! Network publishing adapters.
//!
//! The wire client itself is opaque: anything implementing [`Publisher`] can
//! carry the payloads (an MQTT client, an HTTP poster, a test double). The
//! sinks here only decide *what* to send and retry transient failures.
//!
//! Two payload shapes are supported:
//!
//! - [`SamplePublishSink`]: one JSON object per sample,
//!   `{"channel":0,"ir":4128,"red":66051}`.
//! - [`BatchPublishSink`]: many rounds flattened into parallel arrays,
//!
//! ```text
//! {
//!   "start_unix_ms": 1700000000000,
//!   "end_unix_ms":   1700000000990,
//!   "channel_id": [0, 3, 0, 3, ...],
//!   "data": { "reds": [...], "ir": [...] },
//!   "frequency": 100
//! }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::acquisition::{Sample, SampleRound, SharedRound};
use crate::distribution::SampleSink;

/// Opaque wire client.
#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    /// Send `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;
}

#[async_trait]
impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        (**self).publish(topic, payload).await
    }
}

/// Publisher that writes every payload to the log at debug level.
#[derive(Debug, Default)]
pub struct LogPublisher {
    messages: AtomicU64,
}

impl LogPublisher {
    /// New log publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads published so far.
    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.messages.fetch_add(1, Ordering::Relaxed);
        debug!(
            topic,
            bytes = payload.len(),
            payload = %String::from_utf8_lossy(payload),
            "Publish"
        );
        Ok(())
    }
}

/// Retry settings for publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure. Zero disables retries.
    pub max_retries: u32,
    /// Constant delay between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds or the retries are used up, returning the
    /// last error.
    pub async fn run<F, Fut, T>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if retries < self.max_retries => {
                    retries += 1;
                    warn!(
                        operation,
                        attempt = retries,
                        max_retries = self.max_retries,
                        error = %err,
                        "Publish failed, retrying in {:?}",
                        self.backoff
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// One sample as sent by [`SamplePublishSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleMessage {
    /// Channel index.
    pub channel: u8,
    /// Infrared value.
    pub ir: u32,
    /// Red value.
    pub red: u32,
}

impl From<&Sample> for SampleMessage {
    fn from(sample: &Sample) -> Self {
        Self {
            channel: sample.channel().index(),
            ir: sample.infrared(),
            red: sample.red(),
        }
    }
}

/// Publishes every sample of every round as its own message.
#[derive(Debug)]
pub struct SamplePublishSink<P> {
    name: String,
    topic: String,
    publisher: P,
    retry: RetryPolicy,
}

impl<P: Publisher> SamplePublishSink<P> {
    /// Sink publishing on `topic` through `publisher`.
    pub fn new(topic: impl Into<String>, publisher: P, retry: RetryPolicy) -> Self {
        let topic = topic.into();
        Self {
            name: format!("publish-samples:{topic}"),
            topic,
            publisher,
            retry,
        }
    }
}

#[async_trait]
impl<P: Publisher> SampleSink for SamplePublishSink<P> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn consume(&mut self, round: SharedRound) -> Result<()> {
        let mut failed = 0usize;
        for sample in round.samples() {
            let payload = serde_json::to_vec(&SampleMessage::from(sample))?;
            let result = self
                .retry
                .run("publish sample", || self.publisher.publish(&self.topic, &payload))
                .await;
            if let Err(err) = result {
                warn!(channel = %sample.channel(), error = %err, "Dropping sample after retries");
                failed += 1;
            }
        }
        if failed > 0 {
            bail!(
                "{failed} of {} samples in round {} were not published",
                round.len(),
                round.sequence()
            );
        }
        Ok(())
    }
}

/// Parallel arrays of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchData {
    /// Red values, one per sample.
    pub reds: Vec<u32>,
    /// Infrared values, one per sample.
    pub ir: Vec<u32>,
}

/// Batched payload sent by [`BatchPublishSink`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPayload {
    /// Wall-clock start of the first round, Unix milliseconds.
    pub start_unix_ms: i64,
    /// Wall-clock start of the last round, Unix milliseconds.
    pub end_unix_ms: i64,
    /// Channel of each sample, parallel to `data`.
    pub channel_id: Vec<u8>,
    /// Sample values.
    pub data: BatchData,
    /// Nominal round rate in Hz.
    pub frequency: u32,
}

/// Collects rounds into [`BatchPayload`]s of a fixed number of rounds.
#[derive(Debug)]
pub struct BatchAccumulator {
    rounds_per_batch: usize,
    frequency: u32,
    rounds: usize,
    payload: BatchPayload,
}

impl BatchAccumulator {
    /// Accumulator emitting a payload every `rounds_per_batch` rounds.
    pub fn new(rounds_per_batch: usize, frequency: u32) -> Self {
        Self {
            rounds_per_batch: rounds_per_batch.max(1),
            frequency,
            rounds: 0,
            payload: BatchPayload::default(),
        }
    }

    /// Rounds waiting in the current batch.
    pub fn pending_rounds(&self) -> usize {
        self.rounds
    }

    /// Add a round; returns the finished payload once the batch is full.
    pub fn push(&mut self, round: &SampleRound) -> Option<BatchPayload> {
        let stamp = round.wall_clock().timestamp_millis();
        if self.rounds == 0 {
            self.payload.start_unix_ms = stamp;
        }
        self.payload.end_unix_ms = stamp;
        for sample in round.samples() {
            self.payload.channel_id.push(sample.channel().index());
            self.payload.data.reds.push(sample.red());
            self.payload.data.ir.push(sample.infrared());
        }
        self.rounds += 1;

        if self.rounds >= self.rounds_per_batch {
            self.take()
        } else {
            None
        }
    }

    /// Take whatever has accumulated, or `None` if no round is pending.
    pub fn take(&mut self) -> Option<BatchPayload> {
        if self.rounds == 0 {
            return None;
        }
        self.rounds = 0;
        let mut payload = std::mem::take(&mut self.payload);
        payload.frequency = self.frequency;
        Some(payload)
    }
}

/// Publishes rounds in batches, flushing the partial batch on close.
#[derive(Debug)]
pub struct BatchPublishSink<P> {
    name: String,
    topic: String,
    publisher: P,
    retry: RetryPolicy,
    accumulator: BatchAccumulator,
}

impl<P: Publisher> BatchPublishSink<P> {
    /// Sink publishing a batch every `rounds_per_batch` rounds.
    pub fn new(
        topic: impl Into<String>,
        publisher: P,
        retry: RetryPolicy,
        rounds_per_batch: usize,
        frequency: u32,
    ) -> Self {
        let topic = topic.into();
        Self {
            name: format!("publish-batches:{topic}"),
            topic,
            publisher,
            retry,
            accumulator: BatchAccumulator::new(rounds_per_batch, frequency),
        }
    }

    async fn send(&self, payload: &BatchPayload) -> Result<()> {
        let bytes = serde_json::to_vec(payload).context("serializing batch payload")?;
        self.retry
            .run("publish batch", || self.publisher.publish(&self.topic, &bytes))
            .await
            .with_context(|| {
                format!(
                    "batch of {} samples starting at {} not published",
                    payload.channel_id.len(),
                    payload.start_unix_ms
                )
            })
    }
}

#[async_trait]
impl<P: Publisher> SampleSink for BatchPublishSink<P> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn consume(&mut self, round: SharedRound) -> Result<()> {
        match self.accumulator.push(&round) {
            Some(payload) => self.send(&payload).await,
            None => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.accumulator.take() {
            Some(payload) => {
                debug!(sink = %self.name, samples = payload.channel_id.len(), "Flushing partial batch");
                self.send(&payload).await
            }
            None => Ok(()),
        }
    }
}
