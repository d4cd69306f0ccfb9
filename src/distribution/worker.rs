//! Consumer trait and the task that feeds it.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::queue::SinkReceiver;
use crate::acquisition::SharedRound;

/// A consumer of sample rounds, driven by its own worker task.
///
/// `consume` is called once per round in publish order. Errors are logged and
/// the worker moves on to the next round; a sink that needs retries performs
/// them inside `consume`, at its own pace, without affecting acquisition.
#[async_trait]
pub trait SampleSink: Send + 'static {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    /// Handle one round.
    async fn consume(&mut self, round: SharedRound) -> anyhow::Result<()>;

    /// Called once after the last round, when the distributor shuts down.
    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<S: SampleSink + ?Sized> SampleSink for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn consume(&mut self, round: SharedRound) -> anyhow::Result<()> {
        (**self).consume(round).await
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        (**self).close().await
    }
}

/// Feed `sink` from `receiver` until the queue is closed and drained.
pub(crate) async fn drive<S: SampleSink>(mut sink: S, mut receiver: SinkReceiver) {
    let mut consumed = 0u64;
    while let Some(round) = receiver.recv().await {
        let sequence = round.sequence();
        if let Err(err) = sink.consume(round).await {
            warn!(sink = sink.name(), sequence, error = %err, "Sink failed to consume round");
        }
        consumed += 1;
    }
    if let Err(err) = sink.close().await {
        warn!(sink = sink.name(), error = %err, "Sink failed to close");
    }
    debug!(sink = sink.name(), consumed, "Sink worker finished");
}
