//! Error types for the acquisition engine.
//!
//! Errors are split by the layer that raises them, so callers can decide how
//! far a failure propagates:
//!
//! - **`BusError`**: channel-scoped failures of the shared bus (multiplexer
//!   select, slave addressing, recovery reopen). Transient; the scheduler skips
//!   the channel for the current round.
//! - **`DeviceError`**: channel-scoped failures talking to one sensor (absent
//!   device, rejected register write, short FIFO transfer, malformed record).
//!   Recoverable per round; repeated failures degrade the channel.
//! - **`AcquisitionError`**: either of the above, as seen by the round loop.
//! - **`EngineError`**: engine-level failures. Only `BusUnavailable` aborts
//!   startup; the rest report misuse or lifecycle problems.
//!
//! A full distributor queue is not an error at all: it is handled by dropping
//! the oldest round and counting the drop.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::hardware::registers::Register;
use crate::hardware::ChannelId;

/// Convenience alias for results using the engine error type.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// A channel index outside the multiplexer's eight output lines.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("channel {0} is out of range (multiplexer has channels 0-7)")]
pub struct ChannelOutOfRange(pub u8);

/// A FIFO record whose length is not exactly six bytes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("FIFO record must be 6 bytes, got {len}")]
pub struct MalformedRecord {
    /// Number of bytes actually supplied.
    pub len: usize,
}

/// Failures of the shared bus while routing it to a channel.
#[derive(Error, Debug)]
pub enum BusError {
    /// The multiplexer control byte was not transferred exactly once.
    #[error("select of channel {channel} wrote {written} of 1 control byte")]
    WriteFailed {
        channel: ChannelId,
        written: usize,
        #[source]
        source: Option<io::Error>,
    },

    /// The slave address of the multiplexer could not be set on the bus handle.
    #[error("failed to address bus device 0x{address:02X}: {source}")]
    AddressFailed {
        address: u8,
        #[source]
        source: io::Error,
    },

    /// The recovery reopen after a failed select did not succeed.
    #[error("bus reopen after failed select of channel {channel} failed: {source}")]
    ReopenFailed {
        channel: ChannelId,
        #[source]
        source: io::Error,
    },
}

/// Failures talking to one sensor on an already-selected channel.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The sensor did not acknowledge its bus address.
    #[error("no sensor acknowledged address 0x{address:02X} on channel {channel}")]
    AddressNotPresent { channel: ChannelId, address: u8 },

    /// A configuration register write did not transfer both bytes.
    #[error("write of {register:?}=0x{value:02X} rejected on channel {channel}")]
    RegisterWriteRejected {
        channel: ChannelId,
        register: Register,
        value: u8,
        #[source]
        source: Option<io::Error>,
    },

    /// The FIFO register address write did not transfer exactly one byte.
    #[error("FIFO address write on channel {channel} wrote {written} of 1 byte")]
    ShortWrite {
        channel: ChannelId,
        written: usize,
        #[source]
        source: Option<io::Error>,
    },

    /// The FIFO burst read did not return exactly six bytes.
    #[error("FIFO burst read on channel {channel} returned {read} of 6 bytes")]
    ShortRead {
        channel: ChannelId,
        read: usize,
        #[source]
        source: Option<io::Error>,
    },

    /// The bytes read could not be decoded as a FIFO record.
    #[error("malformed FIFO record on channel {channel}")]
    Malformed {
        channel: ChannelId,
        #[source]
        source: MalformedRecord,
    },
}

impl DeviceError {
    /// Channel the failing sensor sits on.
    pub fn channel(&self) -> ChannelId {
        match self {
            Self::AddressNotPresent { channel, .. }
            | Self::RegisterWriteRejected { channel, .. }
            | Self::ShortWrite { channel, .. }
            | Self::ShortRead { channel, .. }
            | Self::Malformed { channel, .. } => *channel,
        }
    }
}

/// A failed attempt to read one channel during a round.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Engine-level errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The bus device could not be opened at startup. This is the only fatal
    /// condition: without bus access no channel can ever be read.
    #[error("bus device '{path}' could not be opened: {source}")]
    BusUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("acquisition thread panicked")]
    AcquisitionPanicked,

    #[error("acquisition engine is no longer running")]
    NotRunning,

    #[error("sink workers require a tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    #[error("sample distributor has been shut down")]
    DistributorClosed,

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl From<figment::Error> for EngineError {
    fn from(value: figment::Error) -> Self {
        Self::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(index: u8) -> ChannelId {
        ChannelId::new(index).unwrap()
    }

    #[test]
    fn device_error_reports_its_channel() {
        let err = DeviceError::ShortRead {
            channel: channel(5),
            read: 2,
            source: None,
        };
        assert_eq!(err.channel(), channel(5));
        assert_eq!(
            err.to_string(),
            "FIFO burst read on channel 5 returned 2 of 6 bytes"
        );
    }

    #[test]
    fn acquisition_error_is_transparent() {
        let err: AcquisitionError = BusError::WriteFailed {
            channel: channel(3),
            written: 0,
            source: None,
        }
        .into();
        assert_eq!(err.to_string(), "select of channel 3 wrote 0 of 1 control byte");
    }

    #[test]
    fn bus_unavailable_names_the_path() {
        let err = EngineError::BusUnavailable {
            path: PathBuf::from("/dev/i2c-4"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(err.to_string().contains("/dev/i2c-4"));
    }
}
