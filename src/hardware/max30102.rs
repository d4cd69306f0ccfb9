//! MAX30102 pulse-oximetry sensor driver.
//!
//! A [`SensorDevice`] is a plain description of one sensor (channel, address,
//! reset settle time). Every operation takes the [`SelectedChannel`] produced by
//! the multiplexer, so a device can only be talked to while its channel is
//! routed onto the bus.
//!
//! # FIFO records
//!
//! In SpO2 mode each FIFO entry is six bytes: three for red, three for
//! infrared. Only the low 18 bits of each triple are significant:
//!
//! ```text
//! value = ((b0 & 0x03) << 16) | (b1 << 8) | b2
//! ```

use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use super::multiplexer::SelectedChannel;
use super::registers::{
    Register, DEFAULT_DEVICE_ADDRESS, FIFO_RECORD_LEN, INIT_SEQUENCE, SAMPLE_MASK,
};
use super::{ChannelId, I2cBus};
use crate::error::{DeviceError, MalformedRecord};

/// One decoded FIFO entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FifoReading {
    /// Red LED intensity, 18 bits.
    pub red: u32,
    /// Infrared LED intensity, 18 bits.
    pub infrared: u32,
}

/// Raw six-byte FIFO entry as read from `FIFO_DATA`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFifoRecord([u8; FIFO_RECORD_LEN]);

impl RawFifoRecord {
    /// Wrap six raw bytes.
    pub const fn new(bytes: [u8; FIFO_RECORD_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub const fn bytes(&self) -> &[u8; FIFO_RECORD_LEN] {
        &self.0
    }

    /// Decode into red and infrared values. Total over all inputs; both
    /// outputs are at most `0x3FFFF`.
    pub const fn decode(&self) -> FifoReading {
        let b = &self.0;
        FifoReading {
            red: decode_triple(b[0], b[1], b[2]),
            infrared: decode_triple(b[3], b[4], b[5]),
        }
    }
}

impl TryFrom<&[u8]> for RawFifoRecord {
    type Error = MalformedRecord;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        <[u8; FIFO_RECORD_LEN]>::try_from(bytes)
            .map(Self)
            .map_err(|_| MalformedRecord { len: bytes.len() })
    }
}

const fn decode_triple(high: u8, mid: u8, low: u8) -> u32 {
    (((high as u32) & 0x03) << 16 | (mid as u32) << 8 | low as u32) & SAMPLE_MASK
}

/// Decode a FIFO record from a byte slice.
///
/// # Errors
/// [`MalformedRecord`] unless `bytes` is exactly six bytes long; a wrong
/// length is never decoded as zero.
pub fn decode_fifo(bytes: &[u8]) -> Result<FifoReading, MalformedRecord> {
    RawFifoRecord::try_from(bytes).map(|record| record.decode())
}

/// Builds [`SensorDevice`]s for scanned channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFactory {
    /// Sensor slave address.
    pub address: u8,
    /// Pause after the reset write before programming the rest.
    pub reset_settle: Duration,
}

impl DeviceFactory {
    /// Factory for sensors at `address` with no reset settle delay.
    pub fn new(address: u8) -> Self {
        Self {
            address,
            reset_settle: Duration::ZERO,
        }
    }

    /// Set the post-reset settle delay.
    pub fn with_reset_settle(mut self, settle: Duration) -> Self {
        self.reset_settle = settle;
        self
    }

    /// Device description for `channel`.
    pub fn create(&self, channel: ChannelId) -> SensorDevice {
        SensorDevice {
            channel,
            address: self.address,
            reset_settle: self.reset_settle,
        }
    }
}

impl Default for DeviceFactory {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_ADDRESS).with_reset_settle(Duration::from_millis(50))
    }
}

/// One MAX30102 on one multiplexer channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorDevice {
    channel: ChannelId,
    address: u8,
    reset_settle: Duration,
}

impl SensorDevice {
    /// Channel the sensor sits on.
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Sensor slave address.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Report whether a sensor answers on the selected channel.
    ///
    /// Performs a single one-byte read and nothing else: no register is
    /// written, and failures are folded into `false`.
    pub fn probe<B: I2cBus>(&self, link: &mut SelectedChannel<'_, B>) -> bool {
        debug_assert_eq!(link.channel(), self.channel);
        let bus = link.bus();
        if bus.set_address(self.address).is_err() {
            return false;
        }
        let mut byte = [0u8; 1];
        matches!(bus.read(&mut byte), Ok(1))
    }

    /// Program the register sequence for SpO2 acquisition.
    ///
    /// Idempotent: the sequence begins with a reset.
    ///
    /// # Errors
    /// - [`DeviceError::AddressNotPresent`] if the address cannot be set or the
    ///   reset write is not acknowledged
    /// - [`DeviceError::RegisterWriteRejected`] if a later write is short
    pub fn initialize<B: I2cBus>(&self, link: &mut SelectedChannel<'_, B>) -> Result<(), DeviceError> {
        debug_assert_eq!(link.channel(), self.channel);
        let channel = self.channel;
        let bus = link.bus();
        bus.set_address(self.address)
            .map_err(|_| DeviceError::AddressNotPresent {
                channel,
                address: self.address,
            })?;

        for (index, &(register, value)) in INIT_SEQUENCE.iter().enumerate() {
            let outcome = bus.write(&[register.addr(), value]);
            match (index, outcome) {
                (_, Ok(2)) => {}
                (0, _) => {
                    return Err(DeviceError::AddressNotPresent {
                        channel,
                        address: self.address,
                    })
                }
                (_, Ok(_)) => {
                    return Err(DeviceError::RegisterWriteRejected {
                        channel,
                        register,
                        value,
                        source: None,
                    })
                }
                (_, Err(source)) => {
                    return Err(DeviceError::RegisterWriteRejected {
                        channel,
                        register,
                        value,
                        source: Some(source),
                    })
                }
            }
            if index == 0 && !self.reset_settle.is_zero() {
                thread::sleep(self.reset_settle);
            }
        }

        debug!(%channel, address = self.address, "Sensor initialized");
        Ok(())
    }

    /// Read and decode one FIFO entry.
    ///
    /// # Errors
    /// - [`DeviceError::AddressNotPresent`] if the address cannot be set
    /// - [`DeviceError::ShortWrite`] unless the register address write moves 1 byte
    /// - [`DeviceError::ShortRead`] unless the burst read returns 6 bytes
    pub fn read_fifo<B: I2cBus>(&self, link: &mut SelectedChannel<'_, B>) -> Result<FifoReading, DeviceError> {
        debug_assert_eq!(link.channel(), self.channel);
        let channel = self.channel;
        let bus = link.bus();
        bus.set_address(self.address)
            .map_err(|_| DeviceError::AddressNotPresent {
                channel,
                address: self.address,
            })?;

        match bus.write(&[Register::FifoData.addr()]) {
            Ok(1) => {}
            Ok(written) => {
                return Err(DeviceError::ShortWrite {
                    channel,
                    written,
                    source: None,
                })
            }
            Err(source) => {
                return Err(DeviceError::ShortWrite {
                    channel,
                    written: 0,
                    source: Some(source),
                })
            }
        }

        let mut buffer = [0u8; FIFO_RECORD_LEN];
        let read = match bus.read(&mut buffer) {
            Ok(read) => read,
            Err(source) => {
                return Err(DeviceError::ShortRead {
                    channel,
                    read: 0,
                    source: Some(source),
                })
            }
        };
        if read != FIFO_RECORD_LEN {
            return Err(DeviceError::ShortRead {
                channel,
                read,
                source: None,
            });
        }

        let reading = decode_fifo(&buffer[..read])
            .map_err(|source| DeviceError::Malformed { channel, source })?;
        trace!(%channel, red = reading.red, ir = reading.infrared, "FIFO read");
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::registers::DEFAULT_MULTIPLEXER_ADDRESS;
    use crate::hardware::{BusMultiplexer, SimulatedBus};

    const RECORD: [u8; 6] = [0x01, 0x02, 0x03, 0x00, 0x10, 0x20];

    fn ch(index: u8) -> ChannelId {
        ChannelId::new(index).unwrap()
    }

    #[test]
    fn decode_masks_to_eighteen_bits() {
        let reading = RawFifoRecord::new([0xFF; 6]).decode();
        assert_eq!(reading.red, 0x3FFFF);
        assert_eq!(reading.infrared, 0x3FFFF);

        let reading = RawFifoRecord::new(RECORD).decode();
        assert_eq!(reading.red, 0x010203);
        assert_eq!(reading.infrared, 0x001020);
    }

    #[test]
    fn decode_rejects_wrong_lengths() {
        assert_eq!(decode_fifo(&[0u8; 5]), Err(MalformedRecord { len: 5 }));
        assert_eq!(decode_fifo(&[]), Err(MalformedRecord { len: 0 }));
        assert_eq!(decode_fifo(&[0u8; 7]), Err(MalformedRecord { len: 7 }));
    }

    #[test]
    fn initialize_writes_the_full_sequence_twice_identically() {
        let bus = SimulatedBus::new().with_sensor(ch(2), RECORD);
        let hardware = bus.hardware();
        let mut mux = BusMultiplexer::new(bus, DEFAULT_MULTIPLEXER_ADDRESS);
        let device = DeviceFactory::new(DEFAULT_DEVICE_ADDRESS).create(ch(2));

        device.initialize(&mut mux.select(ch(2)).unwrap()).unwrap();
        let after_first = hardware.register(ch(2), Register::ModeConfig);
        device.initialize(&mut mux.select(ch(2)).unwrap()).unwrap();

        let writes = hardware.register_writes(ch(2));
        assert_eq!(writes.len(), INIT_SEQUENCE.len() * 2);
        assert_eq!(&writes[..INIT_SEQUENCE.len()], &INIT_SEQUENCE[..]);
        assert_eq!(hardware.register(ch(2), Register::ModeConfig), after_first);
        assert_eq!(after_first, Some(0x03));
    }

    #[test]
    fn initialize_on_empty_channel_reports_absent_address() {
        let mut mux = BusMultiplexer::new(SimulatedBus::new(), DEFAULT_MULTIPLEXER_ADDRESS);
        let device = DeviceFactory::new(DEFAULT_DEVICE_ADDRESS).create(ch(4));
        let err = device.initialize(&mut mux.select(ch(4)).unwrap()).unwrap_err();
        assert!(matches!(err, DeviceError::AddressNotPresent { address: 0x57, .. }));
    }

    #[test]
    fn probe_never_writes_registers() {
        let bus = SimulatedBus::new().with_sensor(ch(1), RECORD);
        let hardware = bus.hardware();
        let mut mux = BusMultiplexer::new(bus, DEFAULT_MULTIPLEXER_ADDRESS);
        let factory = DeviceFactory::new(DEFAULT_DEVICE_ADDRESS);

        assert!(factory.create(ch(1)).probe(&mut mux.select(ch(1)).unwrap()));
        assert!(!factory.create(ch(6)).probe(&mut mux.select(ch(6)).unwrap()));
        assert!(hardware.register_writes(ch(1)).is_empty());
    }

    #[test]
    fn short_fifo_read_is_an_error_not_zero() {
        let bus = SimulatedBus::new().with_sensor(ch(3), RECORD);
        let hardware = bus.hardware();
        hardware.fail_fifo(ch(3));
        let mut mux = BusMultiplexer::new(bus, DEFAULT_MULTIPLEXER_ADDRESS);
        let device = DeviceFactory::new(DEFAULT_DEVICE_ADDRESS).create(ch(3));

        let err = device.read_fifo(&mut mux.select(ch(3)).unwrap()).unwrap_err();
        assert!(matches!(err, DeviceError::ShortRead { read: 2, .. }));
    }

    #[test]
    fn read_fifo_decodes_record() {
        let bus = SimulatedBus::new().with_sensor(ch(0), RECORD);
        let mut mux = BusMultiplexer::new(bus, DEFAULT_MULTIPLEXER_ADDRESS);
        let device = DeviceFactory::new(DEFAULT_DEVICE_ADDRESS).create(ch(0));
        let reading = device.read_fifo(&mut mux.select(ch(0)).unwrap()).unwrap();
        assert_eq!(
            reading,
            FifoReading {
                red: 0x010203,
                infrared: 0x001020
            }
        );
    }
}
