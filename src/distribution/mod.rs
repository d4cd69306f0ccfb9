//! Fan-out of sample rounds to independent consumers.
//!
//! # Architecture
//!
//! ```text
//! acquisition thread ──publish──► SampleDistributor ──► [queue 1] ──► worker 1 (chart)
//!                                                  └──► [queue 2] ──► worker 2 (publisher)
//! ```
//!
//! Every sink gets its own bounded queue. `publish` never blocks and never
//! awaits: when a queue is full its oldest round is evicted and counted as a
//! drop, so a slow consumer only ever loses its own backlog. Rounds are
//! shared as `Arc<SampleRound>`, so fan-out costs one reference count per
//! sink.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use ppg_daq::acquisition::SampleRound;
//! use ppg_daq::distribution::{DistributorConfig, SampleDistributor};
//!
//! let distributor = SampleDistributor::new(DistributorConfig::new(16));
//! let (_id, receiver) = distributor.subscribe("chart");
//!
//! distributor.publish(Arc::new(SampleRound::builder(0).finish()));
//! assert_eq!(receiver.try_recv().map(|round| round.sequence()), Some(0));
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::acquisition::SharedRound;
use crate::error::{EngineError, EngineResult};

mod queue;
mod worker;

use queue::{PushOutcome, SinkQueue};
pub use queue::SinkReceiver;
pub use worker::SampleSink;

/// Queue sizing and alarm thresholds for the distributor.
///
/// # Example
///
/// ```rust
/// use ppg_daq::distribution::DistributorConfig;
/// use std::time::Duration;
///
/// let config = DistributorConfig::with_thresholds(
///     256,                       // rounds buffered per sink
///     0.5,                       // warn above 0.5% drops
///     80.0,                      // error above 80% occupancy
///     Duration::from_secs(5),    // metrics window
/// );
/// assert_eq!(config.capacity, 256);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct DistributorConfig {
    /// Maximum number of rounds buffered per sink.
    ///
    /// At the default 10 ms round interval, 128 rounds is a little over one
    /// second of backlog.
    pub capacity: usize,

    /// Drop rate (percentage) over a metrics window that triggers a warning.
    pub warn_drop_rate_percent: f64,

    /// Queue occupancy (percentage) that triggers an error log, once per
    /// window.
    pub error_saturation_percent: f64,

    /// Window over which drop rate and saturation alarms are evaluated.
    pub metrics_window: Duration,
}

impl DistributorConfig {
    /// Default thresholds (1% drops, 90% saturation, 10 s window) with the
    /// given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            warn_drop_rate_percent: 1.0,
            error_saturation_percent: 90.0,
            metrics_window: Duration::from_secs(10),
        }
    }

    /// Fully specified configuration.
    pub fn with_thresholds(
        capacity: usize,
        warn_drop_rate_percent: f64,
        error_saturation_percent: f64,
        metrics_window: Duration,
    ) -> Self {
        Self {
            capacity,
            warn_drop_rate_percent,
            error_saturation_percent,
            metrics_window,
        }
    }
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self::new(128)
    }
}

/// Identifier of a registered sink, unique per distributor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SinkId(u64);

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink-{}", self.0)
    }
}

/// Point-in-time health of one sink.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SinkMetricsSnapshot {
    /// Sink name as registered.
    pub sink: String,
    /// Rounds pushed onto the sink's queue.
    pub total_published: u64,
    /// Rounds the sink has taken off its queue.
    pub total_delivered: u64,
    /// Rounds evicted unread because the queue was full.
    pub total_dropped: u64,
    /// `total_dropped / total_published * 100`.
    pub drop_rate_percent: f64,
    /// Rounds waiting right now.
    pub queue_occupancy: usize,
    /// Queue capacity.
    pub queue_capacity: usize,
    /// False once the sink's receiver was dropped or the distributor shut down.
    pub connected: bool,
}

struct SinkEntry {
    id: SinkId,
    name: String,
    queue: Arc<SinkQueue>,
    metrics: SinkMetrics,
}

struct SinkMetrics {
    total_published: u64,
    total_dropped: u64,
    window_published: u64,
    window_dropped: u64,
    window_start: Instant,
    drop_warn_emitted: bool,
    saturation_error_emitted: bool,
}

impl SinkMetrics {
    fn new(now: Instant) -> Self {
        Self {
            total_published: 0,
            total_dropped: 0,
            window_published: 0,
            window_dropped: 0,
            window_start: now,
            drop_warn_emitted: false,
            saturation_error_emitted: false,
        }
    }

    fn record_publish(&mut self) {
        self.total_published = self.total_published.saturating_add(1);
        self.window_published = self.window_published.saturating_add(1);
    }

    fn record_drop(&mut self) {
        self.total_dropped = self.total_dropped.saturating_add(1);
        self.window_dropped = self.window_dropped.saturating_add(1);
    }

    fn check_window(&mut self, now: Instant, sink: &str, occupancy_percent: f64, config: &DistributorConfig) {
        if now.duration_since(self.window_start) >= config.metrics_window {
            if self.window_published > 0 {
                let drop_rate = (self.window_dropped as f64 / self.window_published as f64) * 100.0;
                if drop_rate >= config.warn_drop_rate_percent && !self.drop_warn_emitted {
                    warn!(
                        sink,
                        drop_rate_percent = drop_rate,
                        dropped = self.window_dropped,
                        "Sustained drop rate on sink queue"
                    );
                    self.drop_warn_emitted = true;
                }
            }

            self.window_published = 0;
            self.window_dropped = 0;
            self.window_start = now;
            self.drop_warn_emitted = false;
            self.saturation_error_emitted = false;
        }

        if occupancy_percent >= config.error_saturation_percent && !self.saturation_error_emitted {
            error!(sink, occupancy_percent, "Sink queue saturated");
            self.saturation_error_emitted = true;
        }
    }
}

struct Inner {
    config: DistributorConfig,
    sinks: Mutex<Vec<SinkEntry>>,
    /// Metrics of sinks that disconnected, kept for the final report.
    retired: Mutex<Vec<SinkMetricsSnapshot>>,
    workers: Mutex<Vec<(SinkId, JoinHandle<()>)>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Non-blocking fan-out of rounds to any number of sinks.
///
/// Cheap to clone; clones share the same sink set.
#[derive(Clone)]
pub struct SampleDistributor {
    inner: Arc<Inner>,
}

impl SampleDistributor {
    /// Distributor with the given queue configuration.
    pub fn new(config: DistributorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sinks: Mutex::new(Vec::new()),
                retired: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Queue configuration.
    pub fn config(&self) -> &DistributorConfig {
        &self.inner.config
    }

    /// Register a queue named `name` and return its receiving end.
    ///
    /// For consumers that run their own loop; [`register_sink`](Self::register_sink)
    /// spawns the loop for you. After shutdown the returned receiver is
    /// already closed.
    pub fn subscribe(&self, name: impl Into<String>) -> (SinkId, SinkReceiver) {
        let mut sinks = self.inner.sinks.lock();
        let (id, receiver) = self.attach(&mut sinks, name.into());
        (id, receiver)
    }

    /// Register `sink` and spawn its worker on the current tokio runtime.
    ///
    /// # Errors
    /// - [`EngineError::NoRuntime`] when called outside a tokio runtime
    /// - [`EngineError::DistributorClosed`] after [`shutdown`](Self::shutdown)
    pub fn register_sink<S: SampleSink>(&self, sink: S) -> EngineResult<SinkId> {
        let handle = Handle::try_current()?;
        // Holding `sinks` until the worker is recorded keeps shutdown from
        // missing it.
        let mut sinks = self.inner.sinks.lock();
        if self.is_closed() {
            return Err(EngineError::DistributorClosed);
        }
        let (id, receiver) = self.attach(&mut sinks, sink.name().to_owned());
        let task = handle.spawn(worker::drive(sink, receiver));
        self.inner.workers.lock().push((id, task));
        Ok(id)
    }

    /// Create a queue for `name`; `sinks` must be the locked sink list.
    fn attach(&self, sinks: &mut Vec<SinkEntry>, name: String) -> (SinkId, SinkReceiver) {
        let id = SinkId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let queue = SinkQueue::new(self.inner.config.capacity);
        let receiver = SinkReceiver::new(Arc::clone(&queue));

        if self.is_closed() {
            queue.close();
            debug!(sink = %name, "Subscribe after shutdown; queue closed");
            return (id, receiver);
        }

        info!(sink = %name, %id, capacity = queue.capacity(), "Sink registered");
        sinks.push(SinkEntry {
            id,
            name,
            queue,
            metrics: SinkMetrics::new(Instant::now()),
        });
        (id, receiver)
    }

    /// Push `round` to every sink without blocking.
    ///
    /// Full queues evict their oldest round; sinks whose receiver is gone are
    /// removed. Does nothing after shutdown.
    pub fn publish(&self, round: SharedRound) {
        if self.is_closed() {
            return;
        }
        let config = &self.inner.config;
        let now = Instant::now();
        let mut sinks = self.inner.sinks.lock();
        let mut disconnected = Vec::new();

        for (index, entry) in sinks.iter_mut().enumerate() {
            match entry.queue.push(Arc::clone(&round)) {
                PushOutcome::Delivered => entry.metrics.record_publish(),
                PushOutcome::DisplacedOldest => {
                    entry.metrics.record_publish();
                    entry.metrics.record_drop();
                }
                PushOutcome::Disconnected => {
                    info!(sink = %entry.name, id = %entry.id, "Sink disconnected");
                    disconnected.push(index);
                    continue;
                }
            }

            let capacity = entry.queue.capacity();
            let occupancy_percent = (entry.queue.len() as f64 / capacity as f64) * 100.0;
            entry
                .metrics
                .check_window(now, &entry.name, occupancy_percent, config);
        }

        if !disconnected.is_empty() {
            let mut retired = self.inner.retired.lock();
            for index in disconnected.into_iter().rev() {
                let entry = sinks.swap_remove(index);
                let mut snapshot = snapshot(&entry);
                snapshot.connected = false;
                retired.push(snapshot);
            }
        }
    }

    /// Number of connected sinks.
    pub fn sink_count(&self) -> usize {
        self.inner.sinks.lock().len()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Metrics for connected sinks, then for sinks that have disconnected.
    pub fn metrics_snapshot(&self) -> Vec<SinkMetricsSnapshot> {
        let closed = self.is_closed();
        let mut snapshots: Vec<_> = self
            .inner
            .sinks
            .lock()
            .iter()
            .map(|entry| {
                let mut snapshot = snapshot(entry);
                snapshot.connected = !closed;
                snapshot
            })
            .collect();
        snapshots.extend(self.inner.retired.lock().iter().cloned());
        snapshots
    }

    /// Close every queue and wait for all sink workers to drain and finish.
    ///
    /// Idempotent. Publishing after shutdown is a no-op.
    pub async fn shutdown(&self) {
        {
            let sinks = self.inner.sinks.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            for entry in sinks.iter() {
                entry.queue.close();
            }
        }

        let workers: Vec<_> = std::mem::take(&mut *self.inner.workers.lock());
        let count = workers.len();
        let (ids, tasks): (Vec<_>, Vec<_>) = workers.into_iter().unzip();
        for (id, result) in ids.into_iter().zip(join_all(tasks).await) {
            if let Err(err) = result {
                error!(%id, error = %err, "Sink worker did not finish cleanly");
            }
        }
        info!(workers = count, "Sample distributor shut down");
    }
}

fn snapshot(entry: &SinkEntry) -> SinkMetricsSnapshot {
    let published = entry.metrics.total_published;
    let dropped = entry.metrics.total_dropped;
    let drop_rate_percent = if published == 0 {
        0.0
    } else {
        (dropped as f64 / published as f64) * 100.0
    };
    SinkMetricsSnapshot {
        sink: entry.name.clone(),
        total_published: published,
        total_delivered: entry.queue.delivered(),
        total_dropped: dropped,
        drop_rate_percent,
        queue_occupancy: entry.queue.len(),
        queue_capacity: entry.queue.capacity(),
        connected: true,
    }
}

impl fmt::Debug for SampleDistributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleDistributor")
            .field("config", &self.inner.config)
            .field("sinks", &self.sink_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
