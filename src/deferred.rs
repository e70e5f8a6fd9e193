//! Deferred events: cooperative-context work polled by the slot engine
//! after every successful TX or RX, kept off the interrupt path.
//!
//! The dequeued-ring drain plays the role of `mac_802154/mod.rs`'s
//! `tx_buff`/ack dispatch (fire the caller's callback, then let idle
//! neighbours be collected); the input-ring drain plays the role of its
//! `handle_received`, minus the parts (PAN/address filtering, ACK framing)
//! already done by `slot::run_rx` before a packet ever reaches this ring.

use ieee802154::mac::{Address, FrameContent};

use crate::asn::Asn;
use crate::dedup::SeqnoCache;
use crate::lock::GlobalLock;
use crate::neighbor::NeighborTable;
use crate::packet::{DequeuedEntry, InputPacket, Packet};
use crate::ring::Ring;

/// Delivers a decoded data payload to the layer above; a function pointer
/// plus opaque argument, matching `packet::SentCallback`'s shape so the
/// core stays free of a boxed closure or trait object.
pub type DeliverCallback = fn(arg: usize, source: Address, payload: &[u8]);

/// Drain every completed transmission: fire its sent-callback with the
/// final outcome and transmission count, then garbage-collect any
/// neighbour left with no structural links, no queued packets and no
/// longer our time source.
pub fn drain_dequeued<const D: usize, const N: usize, const Q: usize>(
    ring: &Ring<DequeuedEntry, D>,
    table: &mut NeighborTable<N, Q>,
) {
    let mut drained_any = false;
    while let Some(entry) = ring.pop() {
        entry.packet.fire_callback();
        drained_any = true;
    }
    if drained_any {
        table.collect_garbage();
    }
}

/// Drain every received frame: suppress a duplicate `Data` frame (same
/// sender and sequence number as one already seen), else deliver it
/// upward; for a `Beacon` from our current time source, nudge `current_asn`
/// one slot toward the beacon's encoded value under the global lock.
#[allow(clippy::too_many_arguments)]
pub fn drain_input<const I: usize, const N: usize, const Q: usize, const DUP: usize>(
    ring: &Ring<InputPacket, I>,
    table: &NeighborTable<N, Q>,
    asn: &mut Asn,
    lock: &GlobalLock,
    dedup: &mut SeqnoCache<DUP>,
    deliver: Option<DeliverCallback>,
    deliver_arg: usize,
) {
    while let Some(input) = ring.pop() {
        let packet = match Packet::decode(input.bytes(), false) {
            Ok(p) => p,
            Err(_) => continue,
        };

        match packet.content {
            FrameContent::Data => {
                let is_duplicate = dedup.check_and_insert(packet.header.source, packet.header.seq);
                if is_duplicate {
                    continue;
                }
                if let Some(cb) = deliver {
                    cb(deliver_arg, packet.header.source, packet.payload());
                }
            }
            FrameContent::Beacon(_) => {
                let from_time_source = table.get_time_source().is_some_and(|ts| ts.address == packet.header.source);
                if !from_time_source {
                    continue;
                }
                let Some(ie) = packet.sync_ie() else { continue };
                if let Some(_guard) = lock.lock() {
                    correct_asn_drift(asn, ie.asn);
                }
            }
            _ => (),
        }
    }
}

/// Single-slot nudge toward `reference`, never a direct jump: the slot
/// engine's own per-slot drift correction handles the bulk of clock
/// skew, this is a coarse backstop against it falling permanently behind.
fn correct_asn_drift(asn: &mut Asn, reference: Asn) {
    if reference.value() > asn.value() {
        asn.advance(1);
    } else if reference.value() < asn.value() {
        asn.retreat(1);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::error::TxOutcome;
    use crate::packet::OutgoingPacket;
    use core::sync::atomic::{AtomicU32, Ordering};
    use ieee802154::mac::{ExtendedAddress, PanId};

    fn addr(n: u64) -> Address {
        Address::Extended(PanId(1), ExtendedAddress(n))
    }

    static CALLS: AtomicU32 = AtomicU32::new(0);
    fn record_callback(_arg: usize, _outcome: TxOutcome, _transmissions: u8) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn drain_dequeued_fires_callbacks_and_collects_garbage() {
        let config = Config::default();
        let mut table: NeighborTable<4, 4> = NeighborTable::new(&config);
        let idx = table.add(addr(1), &config).unwrap();

        let mut packet = OutgoingPacket::new(Packet::keepalive(addr(1), addr(2), 0), Some(record_callback), 0);
        packet.last_result = Some(TxOutcome::Ok);

        let ring: Ring<DequeuedEntry, 4> = Ring::new();
        ring.push(DequeuedEntry { packet, neighbor_index: idx }).unwrap();

        let before = CALLS.load(Ordering::SeqCst);
        drain_dequeued(&ring, &mut table);
        assert_eq!(CALLS.load(Ordering::SeqCst), before + 1);
        // The neighbour had no queued packets and no structural links: collected.
        assert!(table.get(addr(1)).is_none());
    }

    #[test]
    fn drain_input_delivers_data_upward() {
        static RECEIVED: AtomicU32 = AtomicU32::new(0);
        fn deliver(_arg: usize, _source: Address, _payload: &[u8]) {
            RECEIVED.fetch_add(1, Ordering::SeqCst);
        }

        let config = Config::default();
        let table: NeighborTable<4, 4> = NeighborTable::new(&config);
        let lock = GlobalLock::new();
        let mut asn = Asn::new(0);
        let mut dedup: SeqnoCache<4> = SeqnoCache::new();

        let packet = Packet::data(addr(2), addr(1), 0, &[9, 9], false);
        let mut buf = [0u8; 64];
        let n = packet.encode(&mut buf, ieee802154::mac::WriteFooter::No);

        let mut input = InputPacket::empty();
        input.buf[..n].copy_from_slice(&buf[..n]);
        input.len = n;

        let ring: Ring<InputPacket, 4> = Ring::new();
        ring.push(input).unwrap();

        drain_input(&ring, &table, &mut asn, &lock, &mut dedup, Some(deliver), 0);
        assert_eq!(RECEIVED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drain_input_suppresses_a_repeated_sender_and_sequence_number() {
        static RECEIVED: AtomicU32 = AtomicU32::new(0);
        fn deliver(_arg: usize, _source: Address, _payload: &[u8]) {
            RECEIVED.fetch_add(1, Ordering::SeqCst);
        }

        let config = Config::default();
        let table: NeighborTable<4, 4> = NeighborTable::new(&config);
        let lock = GlobalLock::new();
        let mut asn = Asn::new(0);
        let mut dedup: SeqnoCache<4> = SeqnoCache::new();

        let packet = Packet::data(addr(2), addr(1), 3, &[9, 9], false);
        let mut buf = [0u8; 64];
        let n = packet.encode(&mut buf, ieee802154::mac::WriteFooter::No);

        let before = RECEIVED.load(Ordering::SeqCst);
        for _ in 0..2 {
            let mut input = InputPacket::empty();
            input.buf[..n].copy_from_slice(&buf[..n]);
            input.len = n;
            let ring: Ring<InputPacket, 4> = Ring::new();
            ring.push(input).unwrap();
            drain_input(&ring, &table, &mut asn, &lock, &mut dedup, Some(deliver), 0);
        }
        assert_eq!(RECEIVED.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn drain_input_nudges_asn_toward_time_source_beacon() {
        let config = Config::default();
        let mut table: NeighborTable<4, 4> = NeighborTable::new(&config);
        table.add(addr(5), &config).unwrap();
        table.update_time_source(addr(5));

        let lock = GlobalLock::new();
        let mut asn = Asn::new(100);
        let mut dedup: SeqnoCache<4> = SeqnoCache::new();

        let beacon = Packet::beacon(addr(5), 0, Asn::new(150), 0);
        let mut buf = [0u8; 64];
        let n = beacon.encode(&mut buf, ieee802154::mac::WriteFooter::No);

        let mut input = InputPacket::empty();
        input.buf[..n].copy_from_slice(&buf[..n]);
        input.len = n;

        let ring: Ring<InputPacket, 4> = Ring::new();
        ring.push(input).unwrap();

        drain_input(&ring, &table, &mut asn, &lock, &mut dedup, None, 0);
        assert_eq!(asn.value(), 101);
    }
}
