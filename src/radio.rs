//! Radio driver contract.
//!
//! A pull-mode, interrupt-free contract: the slot engine (`slot.rs`) drives
//! the radio by polling `receiving_packet`/`pending_packet` inside bounded
//! busy-wait windows rather than being woken by the driver. This mirrors
//! the shape of the `radio` crate's `State`/`Busy`/`Transmit`/`Receive`/
//! `Rssi` traits that a platform driver would likely already implement,
//! specialised to the exact primitives the slot engine needs.

use core::fmt::Debug;

/// External radio driver collaborator. Implemented by the platform; this
/// crate only consumes it.
pub trait Radio<I: radio::ReceiveInfo, E: Debug> {
    /// Select the channel used for the next `prepare`/`transmit`/`on`.
    fn set_channel(&mut self, channel: u8) -> Result<(), E>;

    /// Power up and enter receive mode.
    fn on(&mut self) -> Result<(), E>;

    /// Power down / idle the radio.
    fn off(&mut self) -> Result<(), E>;

    /// Load `buf` into the radio's transmit buffer without starting the
    /// transmission (so the MAC can stamp a Sync-IE as late as possible).
    fn prepare(&mut self, buf: &[u8]) -> Result<(), E>;

    /// Start transmitting the prepared buffer. Returns `Ok(true)` on a
    /// successful hand-off to the radio, `Ok(false)` (NOOK) if the driver
    /// rejected the send.
    fn transmit(&mut self) -> Result<bool, E>;

    /// True once a frame has started arriving over the air.
    fn receiving_packet(&mut self) -> Result<bool, E>;

    /// True once a fully received frame is waiting to be read out.
    fn pending_packet(&mut self) -> Result<bool, E>;

    /// Read a pending packet into `dest`, returning the length and the
    /// driver's receive metadata (RSSI/LQI/timestamp).
    fn read(&mut self, dest: &mut [u8]) -> Result<(usize, I), E>;

    /// Clear-channel assessment: true if the medium is idle.
    fn channel_clear(&mut self) -> Result<bool, E>;

    /// Optional: whether the driver itself filters and forwards ACK
    /// frames to `read` (`address_decode`). Default: frames are always
    /// passed through and the MAC does its own address filtering.
    fn address_decode(&mut self, _enable: bool) -> Result<(), E> {
        Ok(())
    }

    /// Optional hardware SFD timestamp, for platforms that can stamp
    /// frame-start time in the receive path rather than relying on the
    /// busy-wait loop's own clock read.
    fn read_sfd_timer(&mut self) -> Result<Option<u32>, E> {
        Ok(None)
    }
}
