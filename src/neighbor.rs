//! Neighbour table: per-neighbour TX queues, CSMA backoff state and time
//! source tracking.
//!
//! The lock-free per-neighbour ring is `ring.rs::Ring`, used the way
//! `mac_802154/mod.rs` uses `heapless::spsc::Queue` for its TX buffer; the
//! table shape itself (fixed `heapless::Vec` of neighbours, linear
//! `iter().find()` lookups, a dedicated "best time source" query) follows
//! `thvdveld-dot15d4`'s `tsch/neighbor.rs`, generalised with the TX-link
//! counters, CSMA backoff fields and broadcast/EB virtual neighbours.

use heapless::Vec;
use ieee802154::mac::Address;

use crate::asn::Asn;
use crate::config::Config;
use crate::packet::OutgoingPacket;
use crate::ring::Ring;

/// Always-present neighbours that never age out, addressed by sentinel
/// instead of a link-layer address.
pub const BROADCAST_INDEX: usize = 0;
pub const EB_INDEX: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborKind {
    Broadcast,
    Eb,
    Unicast,
}

pub struct Neighbor<const Q: usize> {
    pub address: Address,
    pub kind: NeighborKind,
    pub is_time_source: bool,
    /// Count of links, across all slotframes, with this neighbour as the
    /// TX destination.
    pub tx_links_count: u16,
    /// Subset of `tx_links_count` that are dedicated (non-shared) links.
    pub dedicated_tx_links_count: u16,
    pub backoff_exponent: u8,
    pub backoff_window: u32,
    pub last_sync_asn: Asn,
    queue: Ring<OutgoingPacket, Q>,
}

impl<const Q: usize> Neighbor<Q> {
    fn new(address: Address, kind: NeighborKind, config: &Config) -> Self {
        Self {
            address,
            kind,
            is_time_source: false,
            tx_links_count: 0,
            dedicated_tx_links_count: 0,
            backoff_exponent: config.min_be,
            backoff_window: 0,
            last_sync_asn: Asn::new(0),
            queue: Ring::new(),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Eligible for garbage collection once every structural link count
    /// drops to zero, its queue has drained, and it is not a virtual
    /// broadcast/EB neighbour or current time source.
    pub fn is_gc_eligible(&self) -> bool {
        matches!(self.kind, NeighborKind::Unicast)
            && !self.is_time_source
            && self.tx_links_count == 0
            && self.dedicated_tx_links_count == 0
            && self.queue_is_empty()
    }

    /// Post-transmission backoff update: a successful shared-link send or
    /// an empty queue resets to the minimum window, a failed shared-link
    /// send grows the exponent (capped) and redraws the window.
    pub fn on_tx_result(&mut self, is_shared_link: bool, ok: bool, config: &Config, random_u32: u32) {
        if ok {
            if is_shared_link || self.queue_is_empty() {
                self.backoff_exponent = config.min_be;
                self.backoff_window = 0;
            }
            return;
        }

        if !is_shared_link {
            return;
        }

        self.backoff_exponent = (self.backoff_exponent + 1).min(config.max_be);
        let span = (1u32 << self.backoff_exponent) - 1;
        self.backoff_window = (random_u32 % span.max(1)) + 1;
    }

    /// Decrement the backoff window once per matching shared slot; the
    /// caller has already checked that the slot's address matches this
    /// neighbour (or is the shared broadcast address).
    pub fn tick_backoff(&mut self) {
        if self.backoff_window > 0 {
            self.backoff_window -= 1;
        }
    }

    /// True iff a shared-link candidate may transmit this slot.
    pub fn shared_link_ready(&self) -> bool {
        self.backoff_window == 0
    }
}

pub struct NeighborTable<const N: usize, const Q: usize> {
    neighbors: Vec<Neighbor<Q>, N>,
}

impl<const N: usize, const Q: usize> NeighborTable<N, Q> {
    pub fn new(config: &Config) -> Self {
        let mut neighbors = Vec::new();
        let _ = neighbors.push(Neighbor::new(Address::broadcast(&ieee802154::mac::AddressMode::Short), NeighborKind::Broadcast, config));
        let _ = neighbors.push(Neighbor::new(Address::broadcast(&ieee802154::mac::AddressMode::Short), NeighborKind::Eb, config));
        Self { neighbors }
    }

    pub fn broadcast(&self) -> &Neighbor<Q> {
        &self.neighbors[BROADCAST_INDEX]
    }

    pub fn broadcast_mut(&mut self) -> &mut Neighbor<Q> {
        &mut self.neighbors[BROADCAST_INDEX]
    }

    pub fn eb(&self) -> &Neighbor<Q> {
        &self.neighbors[EB_INDEX]
    }

    pub fn eb_mut(&mut self) -> &mut Neighbor<Q> {
        &mut self.neighbors[EB_INDEX]
    }

    /// `add(addr)`: existing or newly allocated neighbour; idempotent.
    pub fn add(&mut self, address: Address, config: &Config) -> Result<usize, ()> {
        if let Some(idx) = self.index_of(address) {
            return Ok(idx);
        }
        self.neighbors.push(Neighbor::new(address, NeighborKind::Unicast, config)).map_err(|_| ())?;
        Ok(self.neighbors.len() - 1)
    }

    pub fn index_of(&self, address: Address) -> Option<usize> {
        self.neighbors.iter().position(|n| matches!(n.kind, NeighborKind::Unicast) && n.address == address)
    }

    pub fn get(&self, address: Address) -> Option<&Neighbor<Q>> {
        self.index_of(address).map(|i| &self.neighbors[i])
    }

    pub fn get_mut(&mut self, address: Address) -> Option<&mut Neighbor<Q>> {
        self.index_of(address).map(move |i| &mut self.neighbors[i])
    }

    pub fn at(&self, index: usize) -> Option<&Neighbor<Q>> {
        self.neighbors.get(index)
    }

    pub fn at_mut(&mut self, index: usize) -> Option<&mut Neighbor<Q>> {
        self.neighbors.get_mut(index)
    }

    pub fn get_time_source(&self) -> Option<&Neighbor<Q>> {
        self.neighbors.iter().find(|n| n.is_time_source)
    }

    pub fn get_time_source_mut(&mut self) -> Option<&mut Neighbor<Q>> {
        self.neighbors.iter_mut().find(|n| n.is_time_source)
    }

    /// Clears the old time-source flag, sets the new one. Returns `true`
    /// iff the time source actually changed.
    pub fn update_time_source(&mut self, address: Address) -> bool {
        let new_idx = match self.index_of(address) {
            Some(i) => i,
            None => return false,
        };

        if self.neighbors[new_idx].is_time_source {
            return false;
        }

        for n in self.neighbors.iter_mut() {
            n.is_time_source = false;
        }
        self.neighbors[new_idx].is_time_source = true;
        true
    }

    /// `add_packet`: reserves a slot in the target neighbour's ring and
    /// commits it. Fails if the queue is full or the neighbour cannot be
    /// allocated; the caller is responsible for checking the global lock
    /// before calling this for structural (non-queue) mutation.
    pub fn add_packet(&mut self, address: Address, packet: OutgoingPacket, config: &Config) -> Result<(), ()> {
        let idx = self.add(address, config)?;
        self.neighbors[idx].queue.push(packet).map_err(|_| ())
    }

    pub fn add_packet_to_index(&mut self, index: usize, packet: OutgoingPacket) -> Result<(), ()> {
        let neighbor = self.neighbors.get(index).ok_or(())?;
        neighbor.queue.push(packet).map_err(|_| ())
    }

    /// `get_packet_for_nbr`: head packet, or `None` if empty, or `None` on
    /// a shared link whose backoff has not expired.
    pub fn get_packet_for_nbr(&self, index: usize, is_shared_link: bool) -> Option<&OutgoingPacket> {
        let neighbor = self.neighbors.get(index)?;
        if is_shared_link && !neighbor.shared_link_ready() {
            return None;
        }
        neighbor.queue.peek()
    }

    /// `get_unicast_packet_for_any`: first non-broadcast neighbour with
    /// zero `tx_links_count` that has a ready packet, used when a
    /// broadcast link is empty but another neighbour has something queued.
    pub fn get_unicast_packet_for_any(&self, is_shared_link: bool) -> Option<usize> {
        self.neighbors.iter().enumerate().find_map(|(i, n)| {
            if matches!(n.kind, NeighborKind::Unicast)
                && n.tx_links_count == 0
                && (!is_shared_link || n.shared_link_ready())
                && !n.queue_is_empty()
            {
                Some(i)
            } else {
                None
            }
        })
    }

    pub fn remove_packet_from_queue(&mut self, index: usize) -> Option<OutgoingPacket> {
        self.neighbors.get(index)?.queue.pop()
    }

    /// Remove any neighbour eligible for garbage collection; the EB and
    /// broadcast virtual neighbours never qualify.
    pub fn collect_garbage(&mut self) {
        self.neighbors.retain(|n| !n.is_gc_eligible());
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neighbor<Q>> {
        self.neighbors.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Neighbor<Q>> {
        self.neighbors.iter_mut()
    }
}
