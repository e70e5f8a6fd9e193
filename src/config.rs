//! MAC configuration: slot timing, CSMA limits and the knobs listed for
//! association, beaconing and desynchronisation detection.
//!
//! Grounded on `mac_802154/config.rs`'s `Config` (superframe-order fields,
//! `Default` values, `calculate_asn`/`calculate_rsn`-style helpers) extended
//! with the slot-timing and TSCH policy fields that module never needed.
//! Pool sizes (max neighbours, max slotframes, max links, ring capacities)
//! are const generics on the types that own those pools rather than runtime
//! fields here, matching how `heapless` collections are sized throughout
//! the rest of the crate.

use ieee802154::mac::PanId;

/// Slot timing and MAC policy, all time fields in hardware-timer ticks.
///
/// The timeslot-template defaults (`ts_*`) are the IEEE 802.15.4e default
/// timeslot template values in microseconds; platforms whose timer runs at
/// a different resolution should scale all of them together.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub pan_coordinator: bool,
    pub pan_id: PanId,

    /// Nominal slot length.
    pub ts_slot_duration: u32,
    /// Delay from slot start to the start of transmission.
    pub ts_tx_offset: u32,
    /// Long guard time used by the receiver to bound when a frame may start.
    pub ts_long_gt: u32,
    /// Short guard time used while waiting for an ACK.
    pub ts_short_gt: u32,
    /// Turnaround after TX before listening for the ACK.
    pub ts_tx_ack_delay: u32,
    /// Turnaround after RX before transmitting the ACK.
    pub ts_rx_ack_delay: u32,
    /// Offset into the slot where CCA may begin.
    pub ts_cca_offset: u32,
    /// Duration of the CCA listen.
    pub ts_cca: u32,
    /// Radio TX pipeline compensation.
    pub delay_tx: u32,
    /// Radio RX pipeline compensation.
    pub delay_rx: u32,

    /// Minimum backoff exponent.
    pub min_be: u8,
    /// Maximum backoff exponent.
    pub max_be: u8,
    /// Maximum number of retransmissions after the first attempt.
    pub max_frame_retries: u8,
    /// RSSI threshold below which the channel is considered clear.
    pub channel_clear_threshold: i16,
    /// Whether a CCA listen is performed before transmit.
    pub cca_enable: bool,

    /// Minimum period between Enhanced Beacons.
    pub eb_min_period: u32,
    /// Maximum period between Enhanced Beacons.
    pub eb_max_period: u32,
    /// Time after association during which the EB period is clamped to
    /// `eb_min_period`.
    pub eb_clamp_duration: u32,

    /// Nominal keepalive interval to the time source.
    pub keepalive_period: u32,

    /// Desynchronisation threshold, in slots, before `associated` flips
    /// to false and re-association begins.
    pub desync_threshold: u64,

    /// Highest join priority this node will accept from an EB.
    pub max_join_priority: u8,

    /// Whether a link with the TX option wins an ASN tie-break regardless
    /// of slotframe handle (`false` falls back to lowest-handle-wins).
    pub tx_prioritisation: bool,

    /// Timeout for an association attempt before retrying on another
    /// pseudo-random channel.
    pub assoc_timeout: u64,

    /// Largest ASN divergence, in minutes of estimated wall-clock time, an
    /// Enhanced Beacon may carry before a joiner rejects it as unreliable.
    pub join_asn_divergence_minutes: u32,

    /// Period, in slots, of the pseudo-random channel hop used while
    /// scanning for an Enhanced Beacon during association.
    pub scan_hop_period: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pan_coordinator: false,
            pan_id: PanId(0x0100),

            ts_slot_duration: 10_000,
            ts_tx_offset: 2_120,
            ts_long_gt: 400,
            ts_short_gt: 160,
            ts_tx_ack_delay: 1_000,
            ts_rx_ack_delay: 800,
            ts_cca_offset: 1_800,
            ts_cca: 128,
            delay_tx: 0,
            delay_rx: 0,

            min_be: 2,
            max_be: 5,
            max_frame_retries: 3,
            channel_clear_threshold: -50,
            cca_enable: true,

            eb_min_period: 4_000,
            eb_max_period: 60_000,
            eb_clamp_duration: 60_000,

            keepalive_period: 20_000,

            desync_threshold: 50,

            max_join_priority: 10,
            tx_prioritisation: true,

            assoc_timeout: 10_000,

            join_asn_divergence_minutes: 5,
            scan_hop_period: 1,
        }
    }
}

impl Config {
    /// Half the long guard time: received drift is clamped to this bound.
    pub fn drift_clamp(&self) -> i32 {
        self.ts_long_gt as i32 / 2
    }
}
