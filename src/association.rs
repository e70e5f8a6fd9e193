//! Association: scanning for an Enhanced Beacon, adopting its sender as
//! time source and aligning the local ASN.
//!
//! Grounded on `mac_802154/mod.rs`'s `AssocState`/`SyncState` pair, collapsed
//! here into one state (there is no separate "pending association request"
//! exchange in a TSCH network -- hearing a valid EB *is* joining) plus the
//! channel-scan and ASN-alignment steps.

use ieee802154::mac::Address;

use crate::asn::Asn;
use crate::config::Config;
use crate::packet::{Packet, SyncIe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssocState {
    Unassociated,
    Associated,
}

impl AssocState {
    pub fn is_associated(self) -> bool {
        matches!(self, AssocState::Associated)
    }
}

/// Tracks join priority and the state of the scan-for-EB loop; owned by the
/// MAC context and driven by `mac::Mac::tick`.
#[derive(Debug, Clone)]
pub struct Association {
    state: AssocState,
    join_priority: u8,
}

/// Result of successfully parsing and accepting an Enhanced Beacon.
pub struct JoinResult {
    pub time_source: Address,
    pub asn: Asn,
    pub join_priority: u8,
    /// `current_link_start = packet_timestamp - TsTxOffset`.
    pub current_link_start: u64,
}

/// Why a candidate Enhanced Beacon was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRejection {
    /// The frame carried no Sync-IE at all (not an Enhanced Beacon).
    NoSyncIe,
    /// The beacon's ASN implies a wall-clock estimate too far from ours.
    AsnDivergence,
    /// The beacon's advertised join priority is at or above the configured
    /// ceiling -- joining would put us at or past the network's edge.
    JoinPriorityTooHigh,
}

impl Association {
    pub fn new() -> Self {
        Self { state: AssocState::Unassociated, join_priority: 0 }
    }

    pub fn state(&self) -> AssocState {
        self.state
    }

    pub fn is_associated(&self) -> bool {
        self.state.is_associated()
    }

    pub fn join_priority(&self) -> u8 {
        self.join_priority
    }

    /// Coordinators never scan: associated immediately, join priority 0,
    /// ASN starts at zero and the caller seeds `current_link_start`.
    pub fn start_as_coordinator(&mut self) {
        self.state = AssocState::Associated;
        self.join_priority = 0;
    }

    /// Desynchronisation (or an explicit reset) drops back to scanning.
    pub fn mark_unassociated(&mut self) {
        self.state = AssocState::Unassociated;
        self.join_priority = 0;
    }

    /// Step 1 of the scan loop: a pseudo-random channel derived from the
    /// current ASN, a fixed base offset and an estimate of wall-clock
    /// seconds, so two joiners scanning independently don't camp on the
    /// same channel in lock-step.
    pub fn scan_channel(page: &[u8], asn: Asn, base_offset: u8, wall_clock_seconds: u64) -> u8 {
        let idx = (asn.value().wrapping_add(base_offset as u64).wrapping_add(wall_clock_seconds)) as usize % page.len();
        page[idx]
    }

    /// Steps 2-4: given a just-received candidate Enhanced Beacon and our
    /// own estimate of elapsed wall-clock minutes since boot, either accept
    /// it (advancing `join_priority` and returning the new time source and
    /// ASN alignment) or reject it.
    pub fn try_join(
        &mut self,
        beacon: &Packet,
        sender: Address,
        packet_timestamp: u64,
        wall_clock_minutes: u64,
        config: &Config,
    ) -> Result<JoinResult, JoinRejection> {
        let ie: SyncIe = beacon.sync_ie().ok_or(JoinRejection::NoSyncIe)?;

        if config.join_asn_divergence_minutes > 0 {
            let estimated_minutes = ie.asn.value() / crate::asn::slots_per_minute(config);
            let divergence = estimated_minutes.abs_diff(wall_clock_minutes);
            if divergence > config.join_asn_divergence_minutes as u64 {
                return Err(JoinRejection::AsnDivergence);
            }
        }

        if ie.join_priority >= config.max_join_priority {
            return Err(JoinRejection::JoinPriorityTooHigh);
        }

        self.join_priority = ie.join_priority + 1;
        self.state = AssocState::Associated;

        Ok(JoinResult {
            time_source: sender,
            asn: ie.asn,
            join_priority: self.join_priority,
            current_link_start: packet_timestamp.saturating_sub(config.ts_tx_offset as u64),
        })
    }
}

impl Default for Association {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::asn::Asn;
    use ieee802154::mac::{Address, ExtendedAddress, PanId};

    fn sender() -> Address {
        Address::Extended(PanId(1), ExtendedAddress(42))
    }

    #[test]
    fn coordinator_is_associated_at_join_priority_zero() {
        let mut assoc = Association::new();
        assoc.start_as_coordinator();
        assert!(assoc.is_associated());
        assert_eq!(assoc.join_priority(), 0);
    }

    #[test]
    fn accepts_eb_below_max_join_priority() {
        let mut assoc = Association::new();
        let config = Config::default();
        let beacon = Packet::beacon(sender(), 0, Asn::new(1_000), 2);

        let result = assoc.try_join(&beacon, sender(), 50_000, 0, &config).unwrap();

        assert!(assoc.is_associated());
        assert_eq!(assoc.join_priority(), 3);
        assert_eq!(result.asn.value(), 1_000);
        assert_eq!(result.time_source, sender());
        assert_eq!(result.current_link_start, 50_000 - config.ts_tx_offset as u64);
    }

    #[test]
    fn rejects_eb_at_or_above_max_join_priority() {
        let mut assoc = Association::new();
        let mut config = Config::default();
        config.max_join_priority = 2;
        let beacon = Packet::beacon(sender(), 0, Asn::new(1_000), 2);

        assert_eq!(assoc.try_join(&beacon, sender(), 50_000, 0, &config).unwrap_err(), JoinRejection::JoinPriorityTooHigh);
        assert!(!assoc.is_associated());
    }

    #[test]
    fn rejects_eb_whose_asn_diverges_from_wall_clock_estimate() {
        let mut assoc = Association::new();
        let config = Config::default();
        // ASN 0 implies an elapsed time of ~0 minutes; claim we've been
        // running for a long while instead.
        let beacon = Packet::beacon(sender(), 0, Asn::new(0), 0);

        assert_eq!(assoc.try_join(&beacon, sender(), 50_000, 10_000, &config).unwrap_err(), JoinRejection::AsnDivergence);
    }

    #[test]
    fn mark_unassociated_resets_join_priority() {
        let mut assoc = Association::new();
        let config = Config::default();
        let beacon = Packet::beacon(sender(), 0, Asn::new(1_000), 2);
        assoc.try_join(&beacon, sender(), 50_000, 0, &config).unwrap();

        assoc.mark_unassociated();

        assert!(!assoc.is_associated());
        assert_eq!(assoc.join_priority(), 0);
    }
}
