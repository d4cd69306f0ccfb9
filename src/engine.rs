//! Engine lifecycle: bus ownership, the acquisition thread and shutdown.
//!
//! ```text
//!                 ┌──────────── ppg-acquisition thread ────────────┐
//! EngineHandle ──►│ mpsc<SchedulerCommand> ─► SamplingScheduler     │──► SampleDistributor ──► sink workers (tokio)
//!      ▲          │                        (owns BusMultiplexer)    │
//!      └─ watch<SchedulerStatus> ◄───────────────────────────────────┘
//! ```
//!
//! The bus is opened before the thread is spawned, so an unusable device
//! path fails [`AcquisitionEngine::start`] with
//! [`EngineError::BusUnavailable`] instead of surfacing later. Shutdown stops
//! the round loop at its next round boundary, joins the thread (which closes
//! the bus), then shuts the distributor down and awaits every sink worker.

use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use tokio::sync::watch;
use tracing::{info, info_span, warn};

use crate::acquisition::{
    ChannelScanner, SamplingScheduler, ScanReport, SchedulerCommand, SchedulerSettings,
    SchedulerStatus,
};
use crate::config::Settings;
use crate::distribution::{SampleDistributor, SampleSink, SinkId, SinkReceiver};
use crate::error::{EngineError, EngineResult};
use crate::hardware::{BusMultiplexer, DeviceFactory, I2cBus};

/// Name of the acquisition thread.
pub const ACQUISITION_THREAD_NAME: &str = "ppg-acquisition";

/// A configured, not yet started engine.
///
/// Sinks may be registered before or after [`start`](Self::start).
#[derive(Debug)]
pub struct AcquisitionEngine {
    settings: Settings,
    distributor: SampleDistributor,
}

impl AcquisitionEngine {
    /// Engine for `settings`. Does not touch the bus.
    pub fn new(settings: &Settings) -> Self {
        Self {
            settings: settings.clone(),
            distributor: SampleDistributor::new(settings.distributor_config()),
        }
    }

    /// The engine's distributor.
    pub fn distributor(&self) -> &SampleDistributor {
        &self.distributor
    }

    /// Register a sink and spawn its worker on the current tokio runtime.
    pub fn register_sink<S: SampleSink>(&self, sink: S) -> EngineResult<SinkId> {
        self.distributor.register_sink(sink)
    }

    /// Register a queue and return its receiving end.
    pub fn subscribe(&self, name: impl Into<String>) -> (SinkId, SinkReceiver) {
        self.distributor.subscribe(name)
    }

    fn scanner(&self) -> ChannelScanner {
        let factory: DeviceFactory = self.settings.device_factory();
        ChannelScanner::new(factory)
    }

    fn multiplexer<B: I2cBus>(&self, bus: B) -> BusMultiplexer<B> {
        BusMultiplexer::new(bus, self.settings.bus.multiplexer_address)
    }

    /// Open the configured bus device and start acquiring.
    ///
    /// # Errors
    /// - [`EngineError::Configuration`] if the settings do not validate
    /// - [`EngineError::BusUnavailable`] if the device cannot be opened
    /// - [`EngineError::Spawn`] if the acquisition thread cannot be created
    pub fn start(self) -> EngineResult<EngineHandle> {
        self.settings.validate()?;
        let bus = open_bus(&self.settings)?;
        self.start_with_bus(bus)
    }

    /// Start acquiring on an already opened bus.
    ///
    /// # Errors
    /// Same as [`start`](Self::start), minus `BusUnavailable`. On a
    /// configuration error the bus is dropped unused.
    pub fn start_with_bus<B: I2cBus + 'static>(self, bus: B) -> EngineResult<EngineHandle> {
        self.settings.validate()?;
        let settings: SchedulerSettings = self.settings.scheduler_settings();
        let mut scheduler = SamplingScheduler::new(
            self.multiplexer(bus),
            self.scanner(),
            settings,
            self.distributor.clone(),
        );
        let status = scheduler.subscribe_status();
        let (commands, receiver) = mpsc::channel();

        let thread = thread::Builder::new()
            .name(ACQUISITION_THREAD_NAME.to_string())
            .spawn(move || {
                let span = info_span!("acquisition");
                let _entered = span.enter();
                scheduler.run(&receiver);
            })
            .map_err(EngineError::Spawn)?;

        info!(
            device = %self.settings.bus.device_path.display(),
            interval = ?settings.round_interval,
            "Acquisition engine started"
        );
        Ok(EngineHandle {
            commands,
            thread: Some(thread),
            status,
            distributor: self.distributor,
        })
    }

    /// Open the configured bus, scan once and release it.
    pub fn scan(&self) -> EngineResult<ScanReport> {
        let bus = open_bus(&self.settings)?;
        Ok(self.scan_with_bus(bus))
    }

    /// Scan once on `bus`, then release it.
    pub fn scan_with_bus<B: I2cBus>(&self, bus: B) -> ScanReport {
        let mut multiplexer = self.multiplexer(bus);
        let report = self.scanner().scan_detailed(&mut multiplexer);
        multiplexer.release();
        report
    }
}

#[cfg(target_os = "linux")]
fn open_bus(settings: &Settings) -> EngineResult<crate::hardware::I2cDevBus> {
    let path = &settings.bus.device_path;
    crate::hardware::I2cDevBus::open(path).map_err(|source| EngineError::BusUnavailable {
        path: path.clone(),
        source,
    })
}

#[cfg(not(target_os = "linux"))]
fn open_bus(settings: &Settings) -> EngineResult<crate::hardware::SimulatedBus> {
    Err(EngineError::BusUnavailable {
        path: settings.bus.device_path.clone(),
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "i2c-dev is only available on Linux",
        ),
    })
}

/// Control handle of a running engine.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) still
/// stops the round loop, but does not wait for it or for the sink workers.
#[derive(Debug)]
pub struct EngineHandle {
    commands: Sender<SchedulerCommand>,
    thread: Option<JoinHandle<()>>,
    status: watch::Receiver<SchedulerStatus>,
    distributor: SampleDistributor,
}

impl EngineHandle {
    /// Latest published status.
    pub fn status(&self) -> SchedulerStatus {
        self.status.borrow().clone()
    }

    /// Receiver for status changes.
    pub fn status_receiver(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.clone()
    }

    /// Wait until the status satisfies `predicate`.
    ///
    /// # Errors
    /// [`EngineError::NotRunning`] if the acquisition thread exits first
    /// without the predicate holding.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SchedulerStatus) -> bool,
    ) -> EngineResult<SchedulerStatus> {
        let mut receiver = self.status.clone();
        let status = receiver
            .wait_for(predicate)
            .await
            .map_err(|_| EngineError::NotRunning)?;
        Ok(SchedulerStatus::clone(&status))
    }

    /// Ask for a re-scan at the next round boundary.
    pub fn rescan(&self) -> EngineResult<()> {
        self.commands
            .send(SchedulerCommand::Rescan)
            .map_err(|_| EngineError::NotRunning)
    }

    /// The engine's distributor.
    pub fn distributor(&self) -> &SampleDistributor {
        &self.distributor
    }

    /// Stop acquisition, join the acquisition thread, then drain and stop
    /// every sink worker.
    ///
    /// # Errors
    /// [`EngineError::AcquisitionPanicked`] if the acquisition thread
    /// panicked. The distributor is shut down regardless.
    pub async fn shutdown(mut self) -> EngineResult<()> {
        let _ = self.commands.send(SchedulerCommand::Stop);
        let joined = match self.thread.take() {
            Some(thread) => tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|_| EngineError::AcquisitionPanicked)
                .and_then(|result| result.map_err(|_| EngineError::AcquisitionPanicked)),
            None => Ok(()),
        };
        self.distributor.shutdown().await;

        let status = self.status();
        info!(
            rounds = status.rounds_completed,
            overruns = status.overruns,
            "Acquisition engine shut down"
        );
        joined
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            warn!("Engine handle dropped without shutdown; stopping acquisition in the background");
            let _ = self.commands.send(SchedulerCommand::Stop);
        }
    }
}
