//! Hardware access for the multiplexed sensor bus.
//!
//! The bus is modelled as a byte-oriented transport ([`I2cBus`]) with a
//! settable slave address, mirroring the Linux i2c-dev interface: every read
//! and write reports how many bytes actually moved, and the callers above check
//! those counts against what the register protocol requires.
//!
//! - [`multiplexer`] - TCA9548A channel arbitration (the only way onto the bus)
//! - [`max30102`] - sensor register programming and FIFO decoding
//! - [`registers`] - fixed register map and initialization sequence
//! - [`i2c_dev`] - Linux `/dev/i2c-N` transport
//! - [`mock`] - simulated bus for tests and `--simulate` runs

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

use crate::error::ChannelOutOfRange;

#[cfg(target_os = "linux")]
pub mod i2c_dev;
pub mod max30102;
pub mod mock;
pub mod multiplexer;
pub mod registers;

#[cfg(target_os = "linux")]
pub use i2c_dev::I2cDevBus;
pub use max30102::{DeviceFactory, FifoReading, RawFifoRecord, SensorDevice};
pub use mock::{SimulatedBus, SimulatedHardware};
pub use multiplexer::{BusMultiplexer, SelectedChannel};

/// One multiplexer output line, and by extension the sensor attached to it.
///
/// Always in `0..=7`; construction outside that range fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ChannelId(u8);

impl ChannelId {
    /// Number of multiplexer output lines.
    pub const COUNT: u8 = 8;

    /// Creates a channel id, or `None` if `index` is not in `0..=7`.
    pub const fn new(index: u8) -> Option<Self> {
        if index < Self::COUNT {
            Some(Self(index))
        } else {
            None
        }
    }

    /// All channels in ascending order.
    pub fn all() -> impl Iterator<Item = ChannelId> {
        (0..Self::COUNT).map(ChannelId)
    }

    /// Raw channel index.
    pub const fn index(self) -> u8 {
        self.0
    }

    /// Multiplexer control byte routing the bus to this channel.
    pub const fn select_mask(self) -> u8 {
        1 << self.0
    }
}

impl TryFrom<u8> for ChannelId {
    type Error = ChannelOutOfRange;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(ChannelOutOfRange(value))
    }
}

impl From<ChannelId> for u8 {
    fn from(value: ChannelId) -> Self {
        value.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte-level access to a shared I2C bus.
///
/// # Contract
/// - `set_address` points subsequent transfers at a 7-bit slave address. On
///   i2c-dev this only configures the handle; it does not prove a device exists.
/// - `write` / `read` return the number of bytes transferred. A short count is
///   not an error at this level; callers compare it with the protocol's needs.
/// - `reopen` closes and reopens the underlying handle. The slave address must
///   be set again afterwards.
/// - `close` releases the handle; later transfers fail until `reopen`.
///
/// # Threading
/// Implementations are `Send` so the bus can be moved into the acquisition
/// thread, which is then its only user. No method takes `&self`.
pub trait I2cBus: Send {
    /// Point subsequent transfers at `address`.
    fn set_address(&mut self, address: u8) -> io::Result<()>;

    /// Write `bytes` to the current slave, returning how many were sent.
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Read into `buffer` from the current slave, returning how many arrived.
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize>;

    /// Close and reopen the underlying handle.
    fn reopen(&mut self) -> io::Result<()>;

    /// Release the underlying handle.
    fn close(&mut self);
}

impl<B: I2cBus + ?Sized> I2cBus for Box<B> {
    fn set_address(&mut self, address: u8) -> io::Result<()> {
        (**self).set_address(address)
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        (**self).write(bytes)
    }

    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        (**self).read(buffer)
    }

    fn reopen(&mut self) -> io::Result<()> {
        (**self).reopen()
    }

    fn close(&mut self) {
        (**self).close()
    }
}
