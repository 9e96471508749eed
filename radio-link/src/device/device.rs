use std::fmt::Debug;
use std::time::{Duration, Instant};

use embedded_hal::blocking::delay::DelayMs;

use crate::address::PhysicalAddress;

/// Half-duplex packet radio as seen by the protocol layer.
///
/// A device holds one configuration (address and channel) and runs one operation
/// at a time: every call blocks until it is done. The protocol only depends on this
/// trait, each transceiver family gets its own implementation.
///
/// Delays (turnaround, pacing, back-off) and the clock behind every deadline are
/// also taken from the device, so they follow its receive timeouts.
pub trait Device: DelayMs<u32> {
    type Error: Debug;

    /// Fixed size of a packet on this PHY, in bytes.
    fn payload_size(&self) -> usize;

    /// Programs the address and channel used by the next transmit or receive.
    ///
    /// Should be a no-op when nothing changes.
    fn configure(&mut self, address: PhysicalAddress, channel: u8) -> Result<(), Self::Error>;

    /// Transmits one packet to the configured address, padded or truncated to
    /// [payload_size](Device::payload_size). Returns the number of bytes sent.
    fn transmit(&mut self, packet: &[u8]) -> Result<usize, Self::Error>;

    /// Listens on the configured address for at most `timeout`.
    ///
    /// Returns the size of the packet copied into `buffer`, `0` on timeout.
    fn receive(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize, Self::Error>;

    /// Whether a received packet is waiting to be read, without blocking.
    fn ready(&mut self) -> Result<bool, Self::Error>;

    /// Puts the radio in its idle low-power state.
    fn standby(&mut self) -> Result<(), Self::Error>;

    /// Current time of the device clock.
    ///
    /// Wall clock by default. Simulated devices advancing time on their own
    /// (in `delay_ms` and `receive`) override it.
    fn now(&self) -> Instant {
        Instant::now()
    }
}
