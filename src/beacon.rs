//! Periodic Enhanced Beacon emission and time-source keepalives.
//!
//! Scheduling follows the re-arm-on-every-expiry pattern of
//! `mac_802154/mod.rs`'s `tick_beacon` (`next_beacon` pushed forward by one
//! superframe each time it fires), generalised to TSCH's randomised period
//! and to a second, independent keepalive timer. Randomness is threaded in
//! by the caller rather than read from `rand_facade::GlobalRng` directly,
//! matching the convention already used by `neighbor::Neighbor::on_tx_result`.

use ieee802154::mac::Address;

use crate::asn::Asn;
use crate::config::Config;
use crate::neighbor::{NeighborTable, EB_INDEX};
use crate::packet::{OutgoingPacket, Packet};

/// Tracks the next due time, in the same clock the caller advances `tick`
/// with, for the EB and keepalive processes.
#[derive(Debug, Clone, Copy)]
pub struct BeaconScheduler {
    next_eb_due: u64,
    next_keepalive_due: u64,
    associated_since: Option<u64>,
}

impl BeaconScheduler {
    pub fn new() -> Self {
        Self { next_eb_due: u64::MAX, next_keepalive_due: u64::MAX, associated_since: None }
    }

    /// Called once association completes: arms both timers relative to
    /// `now` and starts the one-minute EB clamp window.
    pub fn on_associated(&mut self, now: u64, config: &Config, random_u32: u32) {
        self.associated_since = Some(now);
        self.reschedule_eb(now, config, random_u32);
        self.reschedule_keepalive(now, config, random_u32);
    }

    pub fn on_unassociated(&mut self) {
        self.associated_since = None;
        self.next_eb_due = u64::MAX;
        self.next_keepalive_due = u64::MAX;
    }

    pub fn eb_due(&self, now: u64) -> bool {
        now >= self.next_eb_due
    }

    pub fn keepalive_due(&self, now: u64) -> bool {
        now >= self.next_keepalive_due
    }

    /// Bound on the EB period: clamped to `eb_min_period` for
    /// `eb_clamp_duration` after association, `eb_max_period` afterwards.
    fn eb_period_bound(&self, now: u64, config: &Config) -> u32 {
        match self.associated_since {
            Some(since) if now.saturating_sub(since) < config.eb_clamp_duration as u64 => config.eb_min_period,
            _ => config.eb_max_period,
        }
    }

    /// Randomised delay in `[0.9 * period, period)`.
    fn jittered(period: u32, random_u32: u32) -> u64 {
        let period = period.max(1);
        let lower = (period as u64 * 9) / 10;
        let span = (period as u64 - lower).max(1);
        lower + (random_u32 as u64 % span)
    }

    pub fn reschedule_eb(&mut self, now: u64, config: &Config, random_u32: u32) {
        let period = self.eb_period_bound(now, config);
        self.next_eb_due = now + Self::jittered(period, random_u32);
    }

    pub fn reschedule_keepalive(&mut self, now: u64, config: &Config, random_u32: u32) {
        self.next_keepalive_due = now + Self::jittered(config.keepalive_period, random_u32);
    }

    /// Called on every successful sync event (a valid ACK or EB from the
    /// time source): pushes the keepalive timer back out so an otherwise
    /// idle link doesn't also pay the keepalive overhead.
    pub fn on_sync(&mut self, now: u64, config: &Config, random_u32: u32) {
        if self.associated_since.is_some() {
            self.reschedule_keepalive(now, config, random_u32);
        }
    }
}

impl Default for BeaconScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Enqueue a new Enhanced Beacon onto the EB neighbour's queue, unless one
/// is already pending there.
pub fn enqueue_eb<const N: usize, const Q: usize>(
    table: &mut NeighborTable<N, Q>,
    source: Address,
    seq: u8,
    asn: Asn,
    join_priority: u8,
) -> Result<(), ()> {
    if !table.eb().queue_is_empty() {
        return Ok(());
    }
    let packet = Packet::beacon(source, seq, asn, join_priority);
    table.add_packet_to_index(EB_INDEX, OutgoingPacket::new(packet, None, 0))
}

/// Enqueue an empty unicast keepalive to the current time source, if one is
/// known.
pub fn enqueue_keepalive<const N: usize, const Q: usize>(
    table: &mut NeighborTable<N, Q>,
    source: Address,
    seq: u8,
    config: &Config,
) -> Result<(), ()> {
    let time_source = table.get_time_source().map(|n| n.address).ok_or(())?;
    let packet = Packet::keepalive(time_source, source, seq);
    table.add_packet(time_source, OutgoingPacket::new(packet, None, 0), config).map(|_| ())
}

#[cfg(test)]
mod test {
    use super::*;
    use ieee802154::mac::{ExtendedAddress, PanId};

    fn addr(n: u16) -> Address {
        Address::Extended(PanId(1), ExtendedAddress(n as u64))
    }

    #[test]
    fn eb_is_clamped_to_min_period_right_after_association() {
        let config = Config::default();
        let mut sched = BeaconScheduler::new();
        sched.on_associated(0, &config, 0);

        assert!(sched.next_eb_due <= config.eb_min_period as u64);
    }

    #[test]
    fn eb_uses_max_period_bound_after_clamp_window_elapses() {
        let config = Config::default();
        let mut sched = BeaconScheduler::new();
        sched.on_associated(0, &config, 0);

        let later = config.eb_clamp_duration as u64 + 1;
        sched.reschedule_eb(later, &config, 0);

        let lower = (config.eb_max_period as u64 * 9) / 10;
        assert!(sched.next_eb_due - later >= lower);
    }

    #[test]
    fn keepalive_reschedules_on_sync() {
        let config = Config::default();
        let mut sched = BeaconScheduler::new();
        sched.on_associated(0, &config, 0);
        let first = sched.next_keepalive_due;

        sched.on_sync(first - 1, &config, 5);
        assert_ne!(sched.next_keepalive_due, first);
    }

    #[test]
    fn enqueue_eb_is_skipped_while_one_is_pending() {
        let config = Config::default();
        let mut table: NeighborTable<4, 4> = NeighborTable::new(&config);

        enqueue_eb(&mut table, addr(1), 0, Asn::new(10), 0).unwrap();
        assert_eq!(table.eb().queue_len(), 1);

        enqueue_eb(&mut table, addr(1), 1, Asn::new(11), 0).unwrap();
        assert_eq!(table.eb().queue_len(), 1);
    }

    #[test]
    fn enqueue_keepalive_requires_a_time_source() {
        let config = Config::default();
        let mut table: NeighborTable<4, 4> = NeighborTable::new(&config);
        assert!(enqueue_keepalive(&mut table, addr(1), 0, &config).is_err());

        table.add(addr(2), &config).unwrap();
        table.update_time_source(addr(2));
        assert!(enqueue_keepalive(&mut table, addr(1), 0, &config).is_ok());
    }
}
