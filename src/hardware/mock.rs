//! Simulated Bus Hardware
//!
//! Provides a simulated TCA9548A + MAX30102 bus for testing without physical
//! hardware, and for `--simulate` runs of the binary.
//!
//! # Model
//!
//! - The multiplexer answers at its address and accepts one-hot control bytes.
//! - Each populated channel carries one sensor answering at the device address,
//!   with a register file and a FIFO that returns a configured 6-byte record.
//! - Faults can be injected per channel: failing selects, short FIFO reads,
//!   a number of upcoming select glitches, and a failing reopen.
//!
//! The state lives behind an `Arc<Mutex<_>>` so a [`SimulatedHardware`]
//! handle can inspect and change it while the bus itself is owned by the
//! acquisition thread.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use super::registers::{
    Register, DEFAULT_DEVICE_ADDRESS, DEFAULT_MULTIPLEXER_ADDRESS, FIFO_RECORD_LEN,
};
use super::{ChannelId, I2cBus};

const REGISTER_FILE_LEN: usize = 0x20;

/// One simulated sensor.
#[derive(Debug, Clone)]
struct SimulatedSensor {
    registers: [u8; REGISTER_FILE_LEN],
    pointer: u8,
    fifo: [u8; FIFO_RECORD_LEN],
    pulse: Option<Pulse>,
    fifo_reads: u64,
}

/// Sawtooth modulation applied to the FIFO record on every read, so simulated
/// runs produce moving traces.
#[derive(Debug, Clone, Copy)]
struct Pulse {
    base_red: u32,
    base_ir: u32,
    period: u32,
    step: u32,
}

impl SimulatedSensor {
    fn new(fifo: [u8; FIFO_RECORD_LEN]) -> Self {
        Self {
            registers: [0; REGISTER_FILE_LEN],
            pointer: 0,
            fifo,
            pulse: None,
            fifo_reads: 0,
        }
    }

    fn next_record(&mut self) -> [u8; FIFO_RECORD_LEN] {
        self.fifo_reads += 1;
        let Some(pulse) = self.pulse else {
            return self.fifo;
        };
        let phase = (self.fifo_reads % u64::from(pulse.period.max(1))) as u32;
        let offset = phase * pulse.step;
        let red = (pulse.base_red + offset).to_be_bytes();
        let ir = (pulse.base_ir + offset / 2).to_be_bytes();
        [red[1] & 0x03, red[2], red[3], ir[1] & 0x03, ir[2], ir[3]]
    }
}

#[derive(Debug)]
struct SimState {
    multiplexer_address: u8,
    device_address: u8,
    open: bool,
    addressed: Option<u8>,
    selected: Option<ChannelId>,
    sensors: BTreeMap<ChannelId, SimulatedSensor>,
    failing_selects: BTreeSet<ChannelId>,
    failing_fifo: BTreeSet<ChannelId>,
    select_glitches: usize,
    fail_reopen: bool,
    reopen_count: usize,
    select_log: Vec<u8>,
    register_log: Vec<(ChannelId, Register, u8)>,
}

impl SimState {
    fn sensor_mut(&mut self) -> io::Result<(ChannelId, &mut SimulatedSensor)> {
        let channel = self.selected.ok_or_else(no_acknowledge)?;
        self.sensors
            .get_mut(&channel)
            .map(|sensor| (channel, sensor))
            .ok_or_else(no_acknowledge)
    }
}

fn no_acknowledge() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "no acknowledge from slave")
}

fn register_from_addr(addr: u8) -> Option<Register> {
    use Register::*;
    [
        InterruptStatus1,
        InterruptStatus2,
        InterruptEnable1,
        InterruptEnable2,
        FifoWritePointer,
        OverflowCounter,
        FifoReadPointer,
        FifoData,
        FifoConfig,
        ModeConfig,
        Spo2Config,
        RedLedAmplitude,
        IrLedAmplitude,
        PilotAmplitude,
        MultiLedControl1,
        MultiLedControl2,
    ]
    .into_iter()
    .find(|register| register.addr() == addr)
}

/// Simulated multiplexed sensor bus.
///
/// # Example
///
/// ```rust
/// use ppg_daq::hardware::{ChannelId, SimulatedBus};
///
/// let bus = SimulatedBus::new()
///     .with_sensor(ChannelId::new(0).unwrap(), [0x01, 0x02, 0x03, 0x00, 0x10, 0x20]);
/// let hardware = bus.hardware();
/// assert!(hardware.is_open());
/// ```
#[derive(Debug)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBus {
    /// Empty bus at the default multiplexer and device addresses.
    pub fn new() -> Self {
        Self::with_addresses(DEFAULT_MULTIPLEXER_ADDRESS, DEFAULT_DEVICE_ADDRESS)
    }

    /// Empty bus answering at custom addresses.
    pub fn with_addresses(multiplexer_address: u8, device_address: u8) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                multiplexer_address,
                device_address,
                open: true,
                addressed: None,
                selected: None,
                sensors: BTreeMap::new(),
                failing_selects: BTreeSet::new(),
                failing_fifo: BTreeSet::new(),
                select_glitches: 0,
                fail_reopen: false,
                reopen_count: 0,
                select_log: Vec::new(),
                register_log: Vec::new(),
            })),
        }
    }

    /// Bus with a sensor on each listed channel, each returning `fifo`.
    pub fn with_sensors(channels: impl IntoIterator<Item = ChannelId>, fifo: [u8; 6]) -> Self {
        let bus = Self::new();
        for channel in channels {
            bus.hardware().insert_sensor(channel, fifo);
        }
        bus
    }

    /// Add a sensor on `channel` returning `fifo` on every FIFO read.
    pub fn with_sensor(self, channel: ChannelId, fifo: [u8; 6]) -> Self {
        self.hardware().insert_sensor(channel, fifo);
        self
    }

    /// Control handle sharing this bus's state.
    pub fn hardware(&self) -> SimulatedHardware {
        SimulatedHardware {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl I2cBus for SimulatedBus {
    fn set_address(&mut self, address: u8) -> io::Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "bus closed"));
        }
        state.addressed = Some(address);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "bus closed"));
        }
        let addressed = state.addressed.ok_or_else(no_acknowledge)?;

        if addressed == state.multiplexer_address {
            let Some(&mask) = bytes.first() else {
                return Ok(0);
            };
            if state.select_glitches > 0 {
                state.select_glitches -= 1;
                return Ok(0);
            }
            let channel = (mask.count_ones() == 1)
                .then(|| ChannelId::new(mask.trailing_zeros() as u8))
                .flatten();
            match channel {
                Some(channel) if state.failing_selects.contains(&channel) => Ok(0),
                Some(channel) => {
                    state.selected = Some(channel);
                    state.select_log.push(mask);
                    Ok(1)
                }
                None => {
                    state.selected = None;
                    state.select_log.push(mask);
                    Ok(1)
                }
            }
        } else if addressed == state.device_address {
            let (channel, sensor) = state.sensor_mut()?;
            match *bytes {
                [register] => {
                    sensor.pointer = register;
                    Ok(1)
                }
                [register, value] => {
                    sensor.pointer = register;
                    if let Some(slot) = sensor.registers.get_mut(usize::from(register)) {
                        *slot = value;
                    }
                    if register == Register::ModeConfig.addr() && value & 0x40 != 0 {
                        sensor.registers = [0; REGISTER_FILE_LEN];
                    }
                    if let Some(register) = register_from_addr(register) {
                        state.register_log.push((channel, register, value));
                    }
                    Ok(2)
                }
                _ => Ok(0),
            }
        } else {
            Err(no_acknowledge())
        }
    }

    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "bus closed"));
        }
        let addressed = state.addressed.ok_or_else(no_acknowledge)?;

        if addressed == state.multiplexer_address {
            let mask = state.selected.map_or(0, ChannelId::select_mask);
            return match buffer.first_mut() {
                Some(slot) => {
                    *slot = mask;
                    Ok(1)
                }
                None => Ok(0),
            };
        }
        if addressed != state.device_address {
            return Err(no_acknowledge());
        }

        let failing_fifo = state.failing_fifo.clone();
        let (channel, sensor) = state.sensor_mut()?;
        if sensor.pointer == Register::FifoData.addr() {
            if failing_fifo.contains(&channel) {
                return Ok(buffer.len().min(2));
            }
            let record = sensor.next_record();
            let count = buffer.len().min(FIFO_RECORD_LEN);
            buffer[..count].copy_from_slice(&record[..count]);
            return Ok(count);
        }

        let start = usize::from(sensor.pointer);
        let mut count = 0;
        for (slot, value) in buffer.iter_mut().zip(sensor.registers.iter().skip(start)) {
            *slot = *value;
            count += 1;
        }
        Ok(count)
    }

    fn reopen(&mut self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.reopen_count += 1;
        if state.fail_reopen {
            state.open = false;
            return Err(io::Error::new(io::ErrorKind::NotFound, "bus device vanished"));
        }
        state.open = true;
        state.addressed = None;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.open = false;
        state.addressed = None;
    }
}

/// Handle for inspecting and reconfiguring a [`SimulatedBus`] after it has
/// been moved into the engine.
#[derive(Debug, Clone)]
pub struct SimulatedHardware {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedHardware {
    /// Attach a sensor on `channel` (hot-plug).
    pub fn insert_sensor(&self, channel: ChannelId, fifo: [u8; 6]) {
        self.state
            .lock()
            .sensors
            .insert(channel, SimulatedSensor::new(fifo));
    }

    /// Attach a sensor whose readings ramp from the given base values, wrapping
    /// every `period` reads.
    pub fn insert_pulsing_sensor(&self, channel: ChannelId, base_red: u32, base_ir: u32, period: u32) {
        let mut sensor = SimulatedSensor::new([0; FIFO_RECORD_LEN]);
        sensor.pulse = Some(Pulse {
            base_red,
            base_ir,
            period,
            step: 64,
        });
        self.state.lock().sensors.insert(channel, sensor);
    }

    /// Detach the sensor on `channel`.
    pub fn remove_sensor(&self, channel: ChannelId) {
        self.state.lock().sensors.remove(&channel);
    }

    /// Replace the FIFO record returned by the sensor on `channel`.
    pub fn set_fifo(&self, channel: ChannelId, fifo: [u8; 6]) {
        if let Some(sensor) = self.state.lock().sensors.get_mut(&channel) {
            sensor.fifo = fifo;
        }
    }

    /// Make every select of `channel` transfer zero bytes.
    pub fn fail_select(&self, channel: ChannelId) {
        self.state.lock().failing_selects.insert(channel);
    }

    /// Make FIFO burst reads on `channel` come back short.
    pub fn fail_fifo(&self, channel: ChannelId) {
        self.state.lock().failing_fifo.insert(channel);
    }

    /// Clear all per-channel faults on `channel`.
    pub fn heal(&self, channel: ChannelId) {
        let mut state = self.state.lock();
        state.failing_selects.remove(&channel);
        state.failing_fifo.remove(&channel);
    }

    /// Make the next `count` multiplexer writes transfer zero bytes.
    pub fn glitch_selects(&self, count: usize) {
        self.state.lock().select_glitches = count;
    }

    /// Make every reopen fail (and leave the bus closed).
    pub fn fail_reopen(&self, fail: bool) {
        self.state.lock().fail_reopen = fail;
    }

    /// Whether the bus handle is currently open.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Number of reopen attempts so far.
    pub fn reopen_count(&self) -> usize {
        self.state.lock().reopen_count
    }

    /// Control bytes accepted by the multiplexer, in order.
    pub fn select_log(&self) -> Vec<u8> {
        self.state.lock().select_log.clone()
    }

    /// Register writes received by the sensor on `channel`, in order.
    pub fn register_writes(&self, channel: ChannelId) -> Vec<(Register, u8)> {
        self.state
            .lock()
            .register_log
            .iter()
            .filter(|(logged, _, _)| *logged == channel)
            .map(|(_, register, value)| (*register, *value))
            .collect()
    }

    /// Current value of `register` on the sensor at `channel`.
    pub fn register(&self, channel: ChannelId, register: Register) -> Option<u8> {
        self.state
            .lock()
            .sensors
            .get(&channel)
            .and_then(|sensor| sensor.registers.get(usize::from(register.addr())).copied())
    }

    /// FIFO reads served by the sensor on `channel`.
    pub fn fifo_reads(&self, channel: ChannelId) -> u64 {
        self.state
            .lock()
            .sensors
            .get(&channel)
            .map_or(0, |sensor| sensor.fifo_reads)
    }
}
