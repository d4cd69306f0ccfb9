//! TCA9548A channel arbitration.
//!
//! [`BusMultiplexer`] owns the bus. The only way to address a sensor is to
//! [`select`](BusMultiplexer::select) a channel, which hands out a
//! [`SelectedChannel`] borrowing the multiplexer mutably; while it lives no
//! other select can happen, so channel routing and device transfers cannot
//! interleave.

use tracing::{debug, warn};

use super::{ChannelId, I2cBus};
use crate::error::BusError;

/// Gatekeeper for the shared bus.
#[derive(Debug)]
pub struct BusMultiplexer<B> {
    bus: B,
    address: u8,
}

/// The bus, routed to one channel.
///
/// Valid until the next `select`; the borrow checker enforces that.
#[derive(Debug)]
pub struct SelectedChannel<'a, B> {
    bus: &'a mut B,
    channel: ChannelId,
}

impl<B> SelectedChannel<'_, B> {
    /// Channel the bus is routed to.
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub(crate) fn bus(&mut self) -> &mut B {
        self.bus
    }
}

impl<B: I2cBus> BusMultiplexer<B> {
    /// Wrap `bus`, addressing the multiplexer at `address`.
    pub fn new(bus: B, address: u8) -> Self {
        Self { bus, address }
    }

    /// Multiplexer slave address.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Route the bus to `channel`.
    ///
    /// On failure the bus handle is closed and reopened once and the select is
    /// retried once; multiplexers occasionally need a handle reset after a
    /// glitch.
    ///
    /// # Errors
    /// - [`BusError::ReopenFailed`] if the recovery reopen fails
    /// - the retry's error (typically [`BusError::WriteFailed`]) if the second
    ///   select also fails
    pub fn select(&mut self, channel: ChannelId) -> Result<SelectedChannel<'_, B>, BusError> {
        if let Err(first) = self.write_select(channel) {
            warn!(%channel, error = %first, "Channel select failed, reopening bus");
            self.bus
                .reopen()
                .map_err(|source| BusError::ReopenFailed { channel, source })?;
            self.write_select(channel)?;
            debug!(%channel, "Channel select recovered after reopen");
        }
        Ok(SelectedChannel {
            bus: &mut self.bus,
            channel,
        })
    }

    fn write_select(&mut self, channel: ChannelId) -> Result<(), BusError> {
        self.bus
            .set_address(self.address)
            .map_err(|source| BusError::AddressFailed {
                address: self.address,
                source,
            })?;
        match self.bus.write(&[channel.select_mask()]) {
            Ok(1) => Ok(()),
            Ok(written) => Err(BusError::WriteFailed {
                channel,
                written,
                source: None,
            }),
            Err(source) => Err(BusError::WriteFailed {
                channel,
                written: 0,
                source: Some(source),
            }),
        }
    }

    /// Close the bus handle. Selects fail afterwards unless a recovery reopen
    /// succeeds.
    pub fn release(&mut self) {
        self.bus.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::registers::DEFAULT_MULTIPLEXER_ADDRESS;
    use crate::hardware::SimulatedBus;

    fn ch(index: u8) -> ChannelId {
        ChannelId::new(index).unwrap()
    }

    fn multiplexer() -> (BusMultiplexer<SimulatedBus>, crate::hardware::SimulatedHardware) {
        let bus = SimulatedBus::new();
        let hardware = bus.hardware();
        (BusMultiplexer::new(bus, DEFAULT_MULTIPLEXER_ADDRESS), hardware)
    }

    #[test]
    fn select_writes_one_hot_mask() {
        let (mut mux, hardware) = multiplexer();
        let link = mux.select(ch(5)).unwrap();
        assert_eq!(link.channel(), ch(5));
        assert_eq!(hardware.select_log(), vec![0x20]);
        assert_eq!(hardware.reopen_count(), 0);
    }

    #[test]
    fn single_glitch_is_recovered_by_reopen() {
        let (mut mux, hardware) = multiplexer();
        hardware.glitch_selects(1);
        assert!(mux.select(ch(1)).is_ok());
        assert_eq!(hardware.reopen_count(), 1);
        assert_eq!(hardware.select_log(), vec![0x02]);
    }

    #[test]
    fn persistent_failure_surfaces_after_one_retry() {
        let (mut mux, hardware) = multiplexer();
        hardware.fail_select(ch(3));
        let err = mux.select(ch(3)).unwrap_err();
        assert!(matches!(err, BusError::WriteFailed { written: 0, .. }));
        assert_eq!(hardware.reopen_count(), 1);
    }

    #[test]
    fn failed_reopen_is_reported() {
        let (mut mux, hardware) = multiplexer();
        hardware.glitch_selects(1);
        hardware.fail_reopen(true);
        let err = mux.select(ch(0)).unwrap_err();
        assert!(matches!(err, BusError::ReopenFailed { .. }));
    }

    #[test]
    fn release_closes_the_bus() {
        let (mut mux, hardware) = multiplexer();
        mux.release();
        assert!(!hardware.is_open());
    }
}
