//! Slotframes, links and the schedule manager.
//!
//! Grounded on `thvdveld-dot15d4`'s `mac/tsch/schedule.rs` (`TschSlotframe`,
//! `TschSchedule`, capacity/duplicate-handle/invalid-timeslot errors, the
//! `next_slot`/`next_active_slot` shape) generalised to the richer link
//! model and tie-break rules called for here: link options (TX/RX/SHARED),
//! advertising-only links, per-link destination addresses, counter
//! maintenance on the owning neighbour, and an ASN tie-break between
//! slotframes that both have a link at the same absolute slot.

use heapless::Vec;
use ieee802154::mac::Address;

use crate::asn::{Asn, Divisor};
use crate::neighbor::NeighborTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    InvalidTimeslot,
    InvalidChannelOffset,
    CapacityExceeded,
    HandleDuplicate,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkOptions {
    pub tx: bool,
    pub rx: bool,
    pub shared: bool,
}

impl LinkOptions {
    pub const fn tx() -> Self {
        Self { tx: true, rx: false, shared: false }
    }

    pub const fn rx() -> Self {
        Self { tx: false, rx: true, shared: false }
    }

    pub const fn tx_shared() -> Self {
        Self { tx: true, rx: false, shared: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Normal,
    Advertising,
    AdvertisingOnly,
}

#[derive(Debug, Clone, Copy)]
pub struct Link {
    pub handle: u16,
    pub timeslot: u16,
    pub channel_offset: u8,
    pub options: LinkOptions,
    pub link_type: LinkType,
    /// Destination for a TX link, or the expected sender for a dedicated
    /// RX link; `None` means broadcast / any.
    pub address: Option<Address>,
}

pub struct Slotframe<const L: usize> {
    pub handle: u16,
    pub size: u16,
    divisor: Divisor,
    links: Vec<Link, L>,
}

impl<const L: usize> Slotframe<L> {
    pub fn new(handle: u16, size: u16) -> Self {
        Self { handle, size, divisor: Divisor::new(size), links: Vec::new() }
    }

    pub fn timeslot_for(&self, asn: Asn) -> u16 {
        self.divisor.modulo(asn)
    }

    pub fn link_at_timeslot(&self, timeslot: u16) -> Option<&Link> {
        self.links.iter().find(|l| l.timeslot == timeslot)
    }

    fn link_index_at_timeslot(&self, timeslot: u16) -> Option<usize> {
        self.links.iter().position(|l| l.timeslot == timeslot)
    }

    pub fn get_link(&self, asn: Asn) -> Option<&Link> {
        self.link_at_timeslot(self.timeslot_for(asn))
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }
}

pub struct Schedule<const S: usize, const L: usize> {
    slotframes: Vec<Slotframe<L>, S>,
    next_link_handle: u16,
    /// Whether a TX-bearing link wins an ASN tie-break regardless of
    /// slotframe handle.
    pub tx_prioritisation: bool,
}

impl<const S: usize, const L: usize> Schedule<S, L> {
    pub fn new(tx_prioritisation: bool) -> Self {
        Self { slotframes: Vec::new(), next_link_handle: 0, tx_prioritisation }
    }

    /// A single-slotframe, single-link schedule: one shared, broadcast,
    /// advertising-only link at timeslot 0, channel offset 0. Just enough
    /// to send and hear Enhanced Beacons before any real schedule has been
    /// negotiated.
    pub fn minimal<const N: usize, const Q: usize>(
        tx_prioritisation: bool,
        neighbors: &mut NeighborTable<N, Q>,
    ) -> Result<Self, ScheduleError> {
        let mut schedule = Self::new(tx_prioritisation);
        schedule.add_slotframe(0, 1)?;
        let options = LinkOptions { tx: true, rx: true, shared: true };
        schedule.add_link(0, options, LinkType::AdvertisingOnly, None, 0, 0, neighbors)?;
        Ok(schedule)
    }

    fn slotframe_index(&self, handle: u16) -> Option<usize> {
        self.slotframes.iter().position(|s| s.handle == handle)
    }

    pub fn slotframe(&self, handle: u16) -> Option<&Slotframe<L>> {
        self.slotframe_index(handle).map(|i| &self.slotframes[i])
    }

    pub fn add_slotframe(&mut self, handle: u16, size: u16) -> Result<(), ScheduleError> {
        if self.slotframe_index(handle).is_some() {
            return Err(ScheduleError::HandleDuplicate);
        }
        self.slotframes.push(Slotframe::new(handle, size)).map_err(|_| ScheduleError::CapacityExceeded)
    }

    /// Removes all its links first (decrementing their destination
    /// neighbours' counters), then the slotframe.
    pub fn remove_slotframe<const N: usize, const Q: usize>(
        &mut self,
        handle: u16,
        neighbors: &mut NeighborTable<N, Q>,
    ) -> Result<(), ScheduleError> {
        let idx = self.slotframe_index(handle).ok_or(ScheduleError::NotFound)?;
        let mut timeslots: Vec<u16, L> = Vec::new();
        for link in self.slotframes[idx].links.iter() {
            let _ = timeslots.push(link.timeslot);
        }
        for timeslot in timeslots {
            let _ = self.remove_link_at(handle, timeslot, neighbors);
        }
        self.slotframes.remove(idx);
        Ok(())
    }

    /// If a link exists at that timeslot, it is removed first (and its
    /// counters reversed) before the new one is assigned a fresh handle.
    pub fn add_link<const N: usize, const Q: usize>(
        &mut self,
        sf_handle: u16,
        options: LinkOptions,
        link_type: LinkType,
        address: Option<Address>,
        timeslot: u16,
        channel_offset: u8,
        neighbors: &mut NeighborTable<N, Q>,
    ) -> Result<u16, ScheduleError> {
        {
            let sf = self.slotframe(sf_handle).ok_or(ScheduleError::NotFound)?;
            if timeslot >= sf.size {
                return Err(ScheduleError::InvalidTimeslot);
            }
        }

        let _ = self.remove_link_at(sf_handle, timeslot, neighbors);

        let handle = self.next_link_handle;
        self.next_link_handle = self.next_link_handle.wrapping_add(1);

        let link = Link { handle, timeslot, channel_offset, options, link_type, address };

        if options.tx {
            if let Some(addr) = address {
                if let Some(n) = neighbors.get_mut(addr) {
                    n.tx_links_count += 1;
                    if !options.shared {
                        n.dedicated_tx_links_count += 1;
                    }
                }
            } else {
                let broadcast = neighbors.broadcast_mut();
                broadcast.tx_links_count += 1;
            }
        }

        let sf_idx = self.slotframe_index(sf_handle).ok_or(ScheduleError::NotFound)?;
        self.slotframes[sf_idx].links.push(link).map_err(|_| ScheduleError::CapacityExceeded)?;
        Ok(handle)
    }

    fn remove_link_at<const N: usize, const Q: usize>(
        &mut self,
        sf_handle: u16,
        timeslot: u16,
        neighbors: &mut NeighborTable<N, Q>,
    ) -> Result<(), ScheduleError> {
        let sf_idx = self.slotframe_index(sf_handle).ok_or(ScheduleError::NotFound)?;
        let link_idx = match self.slotframes[sf_idx].link_index_at_timeslot(timeslot) {
            Some(i) => i,
            None => return Ok(()),
        };
        let link = self.slotframes[sf_idx].links.remove(link_idx);
        self.uncount_link(&link, neighbors);
        Ok(())
    }

    /// Decrements counters symmetrically with `add_link`.
    pub fn remove_link<const N: usize, const Q: usize>(
        &mut self,
        sf_handle: u16,
        link_handle: u16,
        neighbors: &mut NeighborTable<N, Q>,
    ) -> Result<(), ScheduleError> {
        let sf_idx = self.slotframe_index(sf_handle).ok_or(ScheduleError::NotFound)?;
        let link_idx = self.slotframes[sf_idx]
            .links
            .iter()
            .position(|l| l.handle == link_handle)
            .ok_or(ScheduleError::NotFound)?;
        let link = self.slotframes[sf_idx].links.remove(link_idx);
        self.uncount_link(&link, neighbors);
        Ok(())
    }

    fn uncount_link<const N: usize, const Q: usize>(&self, link: &Link, neighbors: &mut NeighborTable<N, Q>) {
        if !link.options.tx {
            return;
        }
        if let Some(addr) = link.address {
            if let Some(n) = neighbors.get_mut(addr) {
                n.tx_links_count = n.tx_links_count.saturating_sub(1);
                if !link.options.shared {
                    n.dedicated_tx_links_count = n.dedicated_tx_links_count.saturating_sub(1);
                }
            }
        } else {
            let broadcast = neighbors.broadcast_mut();
            broadcast.tx_links_count = broadcast.tx_links_count.saturating_sub(1);
        }
    }

    /// Across all slotframes, finds the link whose timeslot equals
    /// `ASN mod sf.size`. On a tie, prefers the TX-bearing link if
    /// `tx_prioritisation` is set, else the lowest slotframe handle.
    pub fn get_link_from_asn(&self, asn: Asn) -> Option<(u16, Link)> {
        let mut best: Option<(u16, Link)> = None;

        for sf in self.slotframes.iter() {
            let Some(link) = sf.get_link(asn) else { continue };

            best = match best {
                None => Some((sf.handle, *link)),
                Some((best_handle, best_link)) => {
                    if self.tx_prioritisation && link.options.tx && !best_link.options.tx {
                        Some((sf.handle, *link))
                    } else if self.tx_prioritisation && best_link.options.tx && !link.options.tx {
                        Some((best_handle, best_link))
                    } else if sf.handle < best_handle {
                        Some((sf.handle, *link))
                    } else {
                        Some((best_handle, best_link))
                    }
                }
            };
        }

        best
    }

    /// Scans all slotframes for the link with the smallest forward
    /// distance from `asn`. 0 distance means "the full cycle length",
    /// i.e. the link fires this slot but we are looking for the *next*
    /// occurrence.
    pub fn get_next_active_link(&self, asn: Asn) -> Option<(u16, Link, u16)> {
        let mut best: Option<(u16, Link, u16)> = None;

        for sf in self.slotframes.iter() {
            let current = sf.timeslot_for(asn);
            for link in sf.links() {
                // Widened to u32: timeslot + size can exceed u16::MAX for
                // slotframes near the top of the u16 range.
                let raw = ((link.timeslot as u32 + sf.size as u32 - current as u32) % sf.size as u32) as u16;
                let distance = if raw == 0 { sf.size } else { raw };

                best = match best {
                    None => Some((sf.handle, *link, distance)),
                    Some((_, _, best_distance)) if distance < best_distance => Some((sf.handle, *link, distance)),
                    other => other,
                };
            }
        }

        best
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use ieee802154::mac::{PanId, ShortAddress};

    fn addr(n: u16) -> Address {
        Address::Short(PanId(1), ShortAddress(n))
    }

    #[test]
    fn add_link_replaces_existing_at_timeslot_and_updates_counters() {
        let config = Config::default();
        let mut neighbors: NeighborTable<4, 8> = NeighborTable::new(&config);
        let mut schedule: Schedule<2, 4> = Schedule::new(true);

        schedule.add_slotframe(20, 5).unwrap();
        schedule.add_link(20, LinkOptions::tx(), LinkType::Normal, Some(addr(1)), 1, 0, &mut neighbors).unwrap();
        assert_eq!(neighbors.get(addr(1)).unwrap().tx_links_count, 1);

        // Replacing the link at timeslot 1 with a different destination
        // must reverse the first neighbour's counters.
        schedule.add_link(20, LinkOptions::tx(), LinkType::Normal, Some(addr(2)), 1, 0, &mut neighbors).unwrap();
        assert_eq!(neighbors.get(addr(1)).unwrap().tx_links_count, 0);
        assert_eq!(neighbors.get(addr(2)).unwrap().tx_links_count, 1);
    }

    #[test]
    fn remove_link_restores_counters() {
        let config = Config::default();
        let mut neighbors: NeighborTable<4, 8> = NeighborTable::new(&config);
        let mut schedule: Schedule<2, 4> = Schedule::new(true);

        schedule.add_slotframe(20, 5).unwrap();
        let handle = schedule.add_link(20, LinkOptions::tx(), LinkType::Normal, Some(addr(1)), 1, 0, &mut neighbors).unwrap();
        schedule.remove_link(20, handle, &mut neighbors).unwrap();

        assert_eq!(neighbors.get(addr(1)).unwrap().tx_links_count, 0);
        assert!(schedule.slotframe(20).unwrap().get_link(Asn::new(1)).is_none());
    }

    #[test]
    fn asn_tie_break_prefers_tx_link_when_enabled() {
        let config = Config::default();
        let mut neighbors: NeighborTable<4, 8> = NeighborTable::new(&config);
        let mut schedule: Schedule<2, 4> = Schedule::new(true);

        schedule.add_slotframe(20, 5).unwrap();
        schedule.add_slotframe(21, 5).unwrap();
        schedule.add_link(21, LinkOptions::tx(), LinkType::Normal, Some(addr(1)), 0, 0, &mut neighbors).unwrap();
        schedule.add_link(20, LinkOptions::rx(), LinkType::Normal, None, 0, 0, &mut neighbors).unwrap();

        let (handle, link) = schedule.get_link_from_asn(Asn::new(0)).unwrap();
        assert_eq!(handle, 21);
        assert!(link.options.tx);
    }

    #[test]
    fn asn_tie_break_falls_back_to_lowest_handle_when_disabled() {
        let config = Config::default();
        let mut neighbors: NeighborTable<4, 8> = NeighborTable::new(&config);
        let mut schedule: Schedule<2, 4> = Schedule::new(false);

        schedule.add_slotframe(20, 5).unwrap();
        schedule.add_slotframe(21, 5).unwrap();
        schedule.add_link(21, LinkOptions::tx(), LinkType::Normal, Some(addr(1)), 0, 0, &mut neighbors).unwrap();
        schedule.add_link(20, LinkOptions::rx(), LinkType::Normal, None, 0, 0, &mut neighbors).unwrap();

        let (handle, _) = schedule.get_link_from_asn(Asn::new(0)).unwrap();
        assert_eq!(handle, 20);
    }

    #[test]
    fn next_active_link_skips_inactive_slots() {
        let config = Config::default();
        let mut neighbors: NeighborTable<4, 8> = NeighborTable::new(&config);
        let mut schedule: Schedule<2, 4> = Schedule::new(true);

        schedule.add_slotframe(1, 3).unwrap();
        schedule.add_link(1, LinkOptions::tx(), LinkType::Normal, None, 0, 0, &mut neighbors).unwrap();
        schedule.add_link(1, LinkOptions::rx(), LinkType::Normal, None, 2, 0, &mut neighbors).unwrap();

        let (_, link, distance) = schedule.get_next_active_link(Asn::new(0)).unwrap();
        assert_eq!(link.timeslot, 2);
        assert_eq!(distance, 2);
    }

    #[test]
    fn next_active_link_handles_slotframes_larger_than_u16_half_range() {
        let config = Config::default();
        let mut neighbors: NeighborTable<4, 8> = NeighborTable::new(&config);
        let mut schedule: Schedule<1, 1> = Schedule::new(true);

        // size + timeslot alone exceeds u16::MAX; this would overflow if the
        // distance search ran the arithmetic at u16 width.
        schedule.add_slotframe(0, 60_000).unwrap();
        schedule.add_link(0, LinkOptions::tx(), LinkType::Normal, None, 59_999, 0, &mut neighbors).unwrap();

        let (_, link, distance) = schedule.get_next_active_link(Asn::new(0)).unwrap();
        assert_eq!(link.timeslot, 59_999);
        assert_eq!(distance, 59_999);
    }

    #[test]
    fn minimal_schedule_has_one_shared_advertising_link_at_timeslot_zero() {
        let config = Config::default();
        let mut neighbors: NeighborTable<4, 8> = NeighborTable::new(&config);
        let schedule: Schedule<1, 1> = Schedule::minimal(true, &mut neighbors).unwrap();

        let (handle, link) = schedule.get_link_from_asn(Asn::new(0)).unwrap();
        assert_eq!(handle, 0);
        assert_eq!(link.timeslot, 0);
        assert!(link.options.tx && link.options.rx && link.options.shared);
        assert_eq!(link.link_type, LinkType::AdvertisingOnly);
        assert!(link.address.is_none());
        assert_eq!(neighbors.broadcast().tx_links_count, 1);
    }

    #[test]
    fn hopping_enumerates_hopping_sequence_in_order() {
        use crate::asn::HoppingSequence;
        use crate::channels::HOPPING_SEQUENCE_4_4;

        let seq = HoppingSequence::new(&HOPPING_SEQUENCE_4_4);
        for i in 0..seq.len() as u64 {
            assert_eq!(seq.channel(Asn::new(i), 0), HOPPING_SEQUENCE_4_4[i as usize]);
        }
    }
}
