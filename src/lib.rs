//! # PPG DAQ Core Library
//!
//! Multi-channel photoplethysmography acquisition for MAX30102 sensors that
//! share one I2C bus behind a TCA9548A multiplexer. The library owns the bus,
//! samples every responding sensor at a fixed rate and fans the resulting
//! rounds out to independent consumers. The `ppg-daq` binary is a thin CLI on
//! top of it.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: the byte-level bus trait, the Linux i2c-dev transport, the
//!   multiplexer gate, the MAX30102 driver and a simulated bus.
//! - **`acquisition`**: samples and rounds, the startup channel scan and the
//!   round-loop state machine.
//! - **`distribution`**: per-sink drop-oldest queues, the fan-out distributor
//!   and sink workers.
//! - **`sinks`**: live history and network publishing adapters.
//! - **`engine`**: the acquisition thread and orderly shutdown.
//! - **`config`**: `Settings` loaded with figment from TOML and environment.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: error types per layer.

pub mod acquisition;
pub mod config;
pub mod distribution;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod sinks;

pub use acquisition::{ActiveChannelSet, Sample, SampleRound};
pub use config::Settings;
pub use distribution::{SampleDistributor, SampleSink};
pub use engine::{AcquisitionEngine, EngineHandle};
pub use error::{EngineError, EngineResult};
pub use hardware::ChannelId;
