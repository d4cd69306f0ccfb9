//! MAX30102 register map and TCA9548A defaults.
//!
//! The map is fixed by the datasheet; nothing here is negotiated at runtime.

/// Default 7-bit address of the MAX30102.
pub const DEFAULT_DEVICE_ADDRESS: u8 = 0x57;

/// Default 7-bit address of the TCA9548A multiplexer.
pub const DEFAULT_MULTIPLEXER_ADDRESS: u8 = 0x70;

/// Bytes per FIFO record in SpO2 mode (3 red + 3 infrared).
pub const FIFO_RECORD_LEN: usize = 6;

/// Mask of the 18 significant bits of a decoded FIFO value.
pub const SAMPLE_MASK: u32 = 0x3FFFF;

/// MAX30102 registers used by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Register {
    InterruptStatus1 = 0x00,
    InterruptStatus2 = 0x01,
    InterruptEnable1 = 0x02,
    InterruptEnable2 = 0x03,
    FifoWritePointer = 0x04,
    OverflowCounter = 0x05,
    FifoReadPointer = 0x06,
    FifoData = 0x07,
    FifoConfig = 0x08,
    ModeConfig = 0x09,
    Spo2Config = 0x0A,
    RedLedAmplitude = 0x0C,
    IrLedAmplitude = 0x0D,
    PilotAmplitude = 0x10,
    MultiLedControl1 = 0x11,
    MultiLedControl2 = 0x12,
}

impl Register {
    /// Register address on the device.
    pub const fn addr(self) -> u8 {
        self as u8
    }
}

/// MODE_CONFIG value that resets every register to its power-on state.
pub const MODE_RESET: u8 = 0x40;

/// MODE_CONFIG value selecting SpO2 mode (red + infrared LEDs).
pub const MODE_SPO2: u8 = 0x03;

/// Ordered register writes establishing SpO2 acquisition.
///
/// Starts with a reset, so replaying it always lands in the same state:
/// FIFO pointers cleared, FIFO-almost-full/new-data/ALC interrupts enabled,
/// 15-sample rollover FIFO, SpO2 mode, 4096 nA range at 100 sps with 411 us
/// pulses, ~7 mA on both LEDs, and full pilot amplitude.
pub const INIT_SEQUENCE: [(Register, u8); 12] = [
    (Register::ModeConfig, MODE_RESET),
    (Register::FifoWritePointer, 0x00),
    (Register::OverflowCounter, 0x00),
    (Register::FifoReadPointer, 0x00),
    (Register::InterruptEnable1, 0xE0),
    (Register::InterruptEnable2, 0x00),
    (Register::FifoConfig, 0x0F),
    (Register::ModeConfig, MODE_SPO2),
    (Register::Spo2Config, 0x27),
    (Register::RedLedAmplitude, 0x24),
    (Register::IrLedAmplitude, 0x24),
    (Register::PilotAmplitude, 0x7F),
];
