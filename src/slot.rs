//! The per-slot TX/RX sub-machines.
//!
//! The source material writes each slot as a resumable protothread driven
//! by a timer interrupt. Modelled here the way the design notes for this
//! redesign describe: each sub-machine is a short linear function whose
//! "yield points" are the busy-wait windows bounded by the guard times
//! below, and whose phase is tracked by a small state enum
//! (`TxPhase`/`RxPhase`) rather than borrowing a host async runtime. The
//! `Kind`/`State`/`Config` split in `mac_802154/slot.rs` is the direct
//! ancestor of `SlotPhase`/`TxPhase`/`RxPhase` here, fleshed out from its
//! `unimplemented!()` stub into the full sequence.

use log::{debug, trace, warn};

use crate::asn::Asn;
use crate::config::Config;
use crate::error::{CoreError, TxOutcome};
use crate::neighbor::{Neighbor, NeighborTable};
use crate::packet::{DequeuedEntry, InputPacket, OutgoingPacket, Packet};
use crate::radio::Radio;
use crate::ring::Ring;
use crate::timer::Timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    Prepare,
    WaitTx,
    WaitAck,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxPhase {
    WaitRxStart,
    Reading,
    AckWait,
    Done,
}

/// What a slot actually does, decided once per slot by the caller from
/// the outbound candidate search and the link's RX option.
pub enum SlotAction {
    Idle,
    Tx { neighbor_index: usize },
    Rx,
}

/// Outcome of a slot used to drive post-slot bookkeeping: backoff
/// decrement, drift application, `last_sync_asn` update.
#[derive(Debug, Default)]
pub struct SlotOutcome {
    pub tx_result: Option<TxOutcome>,
    /// Clamped drift in ticks observed this slot: positive means the peer
    /// is ahead of us.
    pub drift: Option<i32>,
    pub synced_with_time_source: bool,
}

/// Busy-waits on `timer` until `deadline` (in ticks) or `cond` becomes
/// true, whichever comes first. Returns whether `cond` fired before the
/// deadline.
fn busy_wait_until(timer: &dyn Timer, deadline: u32, mut cond: impl FnMut() -> bool) -> bool {
    loop {
        if cond() {
            return true;
        }
        if timer.ticks().wrapping_sub(deadline) as i32 >= 0 {
            return false;
        }
    }
}

/// TX sub-machine: returns the terminal transmission outcome. The caller
/// (the deferred-events process) removes the packet from its queue and
/// publishes it to the dequeued-ring once `transmissions` has either
/// succeeded or been exhausted.
#[derive(Debug, Default)]
pub struct TxSlotResult {
    pub outcome: TxOutcome,
    pub drift: Option<i32>,
    pub synced_with_time_source: bool,
}

#[allow(clippy::too_many_arguments)]
pub fn run_tx<R, I, E>(
    radio: &mut R,
    timer: &dyn Timer,
    config: &Config,
    packet: &mut Packet,
    ack_request: bool,
    is_eb: bool,
    asn: Asn,
    join_priority: u8,
    slot_start: u32,
    time_source_addr: Option<ieee802154::mac::Address>,
) -> Result<TxSlotResult, CoreError<E>>
where
    R: Radio<I, E>,
    I: radio::ReceiveInfo,
    E: core::fmt::Debug,
{
    let mut result = TxSlotResult::default();
    let mut phase = TxPhase::Prepare;

    if is_eb {
        packet.restamp_beacon_asn(asn, join_priority);
    }

    if config.cca_enable {
        radio.on().map_err(CoreError::Radio)?;
        let cca_deadline = slot_start.wrapping_add(config.ts_cca_offset + config.ts_cca);
        let mut busy = false;
        while timer.ticks().wrapping_sub(cca_deadline) as i32 <= 0 {
            if !radio.channel_clear().map_err(CoreError::Radio)? {
                busy = true;
                break;
            }
        }
        if busy {
            trace!("CCA busy, aborting TX");
            result.outcome = TxOutcome::Collision;
            return Ok(result);
        }
    }

    let mut buf = [0u8; crate::packet::MAX_PAYLOAD_LEN];
    let len = packet.encode(&mut buf, ieee802154::mac::WriteFooter::No);
    radio.prepare(&buf[..len]).map_err(CoreError::Radio)?;

    let tx_deadline = slot_start.wrapping_add(config.ts_tx_offset.saturating_sub(config.delay_tx));
    busy_wait_until(timer, tx_deadline, || false);

    phase = TxPhase::WaitTx;
    let tx_start = timer.ticks();
    let sent = radio.transmit().map_err(CoreError::Radio)?;
    if !sent {
        result.outcome = TxOutcome::Err;
        return Ok(result);
    }
    debug!("TX at tick {}", tx_start);

    if !ack_request {
        phase = TxPhase::Done;
        let _ = phase;
        result.outcome = TxOutcome::Ok;
        return Ok(result);
    }

    phase = TxPhase::WaitAck;
    let ack_wait_start = tx_start.wrapping_add(config.ts_tx_ack_delay.saturating_sub(config.ts_short_gt).saturating_sub(config.delay_rx));
    busy_wait_until(timer, ack_wait_start, || false);
    radio.on().map_err(CoreError::Radio)?;

    let ack_arrival_deadline = ack_wait_start.wrapping_add(config.ts_long_gt);
    let started = busy_wait_until(timer, ack_arrival_deadline, || radio.receiving_packet().unwrap_or(false));
    if !started {
        radio.off().map_err(CoreError::Radio)?;
        result.outcome = TxOutcome::NoAck;
        return Ok(result);
    }

    let completion_deadline = timer.ticks().wrapping_add(config.ts_short_gt + config.ts_long_gt);
    busy_wait_until(timer, completion_deadline, || radio.pending_packet().unwrap_or(false));

    let mut ack_buf = [0u8; crate::packet::MAX_PAYLOAD_LEN];
    let (n, _info) = radio.read(&mut ack_buf).map_err(CoreError::Radio)?;
    radio.off().map_err(CoreError::Radio)?;

    let ack = Packet::decode(&ack_buf[..n], false)?;
    if !ack.is_ack_for(packet) {
        result.outcome = TxOutcome::NoAck;
        return Ok(result);
    }

    if let Some(src) = time_source_addr {
        if ack.header.source == src {
            if let Some(ie) = ack.sync_ie() {
                let clamp = config.drift_clamp();
                result.drift = Some(ie.drift.clamp(-(clamp), clamp) as i32);
                result.synced_with_time_source = true;
            }
        }
    }

    phase = TxPhase::Done;
    let _ = phase;
    result.outcome = TxOutcome::Ok;
    Ok(result)
}

/// RX sub-machine: writes the received frame into `input` if one arrives,
/// optionally replies with an enhanced ACK, and reports drift observed
/// relative to the expected arrival time if the sender is our time source.
#[allow(clippy::too_many_arguments)]
pub fn run_rx<R, I, E>(
    radio: &mut R,
    timer: &dyn Timer,
    config: &Config,
    input: &mut InputPacket,
    own_address: ieee802154::mac::Address,
    time_source_addr: Option<ieee802154::mac::Address>,
    asn: Asn,
    slot_start: u32,
    nack: bool,
) -> Result<SlotOutcome, CoreError<E>>
where
    R: Radio<I, E>,
    I: radio::ReceiveInfo,
    E: core::fmt::Debug,
{
    let mut outcome = SlotOutcome::default();

    let rx_on_deadline = slot_start.wrapping_add(config.ts_tx_offset.saturating_sub(config.ts_long_gt).saturating_sub(config.delay_rx));
    busy_wait_until(timer, rx_on_deadline, || false);
    radio.on().map_err(CoreError::Radio)?;

    let expected_rx_time = slot_start.wrapping_add(config.ts_tx_offset);
    let start_deadline = expected_rx_time.wrapping_add(config.ts_long_gt);

    let started = busy_wait_until(timer, start_deadline, || radio.receiving_packet().unwrap_or(false));
    if !started {
        radio.off().map_err(CoreError::Radio)?;
        return Ok(outcome);
    }

    let rx_start_time = timer.ticks();
    let completion_deadline = rx_start_time.wrapping_add(config.ts_long_gt);
    busy_wait_until(timer, completion_deadline, || radio.pending_packet().unwrap_or(false));

    let (n, info) = radio.read(&mut input.buf).map_err(CoreError::Radio)?;
    input.len = n;
    input.asn = asn;
    input.rssi = 0;
    let _ = info;

    let packet = Packet::decode(&input.buf[..input.len], false)?;

    let for_us = packet.header.destination == own_address
        || matches!(packet.header.destination, ieee802154::mac::Address::Short(_, s) if s == ieee802154::mac::ShortAddress::broadcast());

    if for_us && packet.header.ack_request {
        let rx_end = timer.ticks();
        let expected_drift = (expected_rx_time as i64 - rx_start_time as i64) as i16;
        let ack = Packet::enhanced_ack(&packet, expected_drift, nack, asn);

        let mut ack_buf = [0u8; crate::packet::MAX_PAYLOAD_LEN];
        let len = ack.encode(&mut ack_buf, ieee802154::mac::WriteFooter::No);

        let ack_tx_deadline = rx_end.wrapping_add(config.ts_rx_ack_delay.saturating_sub(config.delay_tx));
        busy_wait_until(timer, ack_tx_deadline, || false);

        radio.prepare(&ack_buf[..len]).map_err(CoreError::Radio)?;
        radio.transmit().map_err(CoreError::Radio)?;
    }

    if let Some(src) = time_source_addr {
        if packet.header.source == src {
            let clamp = config.drift_clamp();
            let observed = (expected_rx_time as i64 - rx_start_time as i64) as i32;
            outcome.drift = Some((-observed).clamp(-clamp, clamp));
            outcome.synced_with_time_source = true;
        }
    }

    radio.off().map_err(CoreError::Radio)?;
    Ok(outcome)
}

/// Post-TX-SHARED-slot backoff decrement. On a broadcast link, the
/// broadcast sentinel always ticks, and so does whichever unicast
/// neighbour `select_outbound_neighbor` actually picked for this slot (via
/// `get_unicast_packet_for_any`) -- otherwise that neighbour's window,
/// once grown by a collision, would never count back down, since it is
/// neither the broadcast sentinel nor the link's own address.
pub fn decrement_shared_backoff<const N: usize, const Q: usize>(
    neighbors: &mut NeighborTable<N, Q>,
    link_address: Option<ieee802154::mac::Address>,
    selected_index: Option<usize>,
) {
    match link_address {
        None => {
            neighbors.broadcast_mut().tick_backoff();
            if let Some(idx) = selected_index {
                if idx != crate::neighbor::BROADCAST_INDEX && idx != crate::neighbor::EB_INDEX {
                    if let Some(n) = neighbors.at_mut(idx) {
                        n.tick_backoff();
                    }
                }
            }
        }
        Some(addr) => {
            if let Some(n) = neighbors.get_mut(addr) {
                n.tick_backoff();
            }
        }
    }
}

/// The outbound candidate for a link: the EB queue if the link is
/// advertising-only; otherwise the link's address queue; otherwise, if
/// the link is broadcast and empty, any ready unicast neighbour.
pub fn select_outbound_neighbor<const N: usize, const Q: usize>(
    neighbors: &NeighborTable<N, Q>,
    link_is_advertising_only: bool,
    link_address: Option<ieee802154::mac::Address>,
    is_shared_link: bool,
) -> Option<usize> {
    if link_is_advertising_only {
        return if neighbors.eb().queue_is_empty() { None } else { Some(crate::neighbor::EB_INDEX) };
    }

    match link_address {
        Some(addr) => neighbors.index_of(addr).filter(|&i| neighbors.get_packet_for_nbr(i, is_shared_link).is_some()),
        None => {
            if !neighbors.broadcast().queue_is_empty() {
                Some(crate::neighbor::BROADCAST_INDEX)
            } else {
                neighbors.get_unicast_packet_for_any(is_shared_link)
            }
        }
    }
}

/// Finalise a TX attempt: applies post-TX backoff policy, increments the
/// retry counter, and either leaves the packet queued for retry or
/// publishes it to the dequeued-ring.
pub fn finish_tx_attempt<const Q: usize, const D: usize>(
    packet: &mut OutgoingPacket,
    neighbor: &mut Neighbor<Q>,
    neighbor_index: usize,
    is_shared_link: bool,
    result: TxOutcome,
    config: &Config,
    random_u32: u32,
    dequeued: &Ring<DequeuedEntry, D>,
) -> bool {
    let ok = matches!(result, TxOutcome::Ok);
    neighbor.on_tx_result(is_shared_link, ok, config, random_u32);

    packet.transmissions += 1;
    packet.last_result = Some(result);

    if ok || packet.transmissions >= config.max_frame_retries + 1 {
        if !ok {
            warn!("dropping packet to neighbor {} after {} attempts", neighbor_index, packet.transmissions);
        }
        let entry = DequeuedEntry { packet: packet.clone(), neighbor_index };
        let _ = dequeued.push(entry);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::timer::mock::MockTimer;
    use core::cell::RefCell;
    use heapless::Vec as HVec;
    use ieee802154::mac::{Address, ExtendedAddress, PanId, WriteFooter};

    fn addr(n: u64) -> Address {
        Address::Extended(PanId(1), ExtendedAddress(n))
    }

    /// A radio double whose clear-channel result, and whether a frame is
    /// waiting to be read, are both set by the test up front -- no field
    /// changes once a test is running, so the bounded busy-wait loops in
    /// `run_tx`/`run_rx` always terminate on their first deadline check.
    struct StubRadio {
        channel_clear: bool,
        incoming: RefCell<Option<HVec<u8, 256>>>,
    }

    impl StubRadio {
        fn idle() -> Self {
            Self { channel_clear: true, incoming: RefCell::new(None) }
        }

        fn busy() -> Self {
            Self { channel_clear: false, incoming: RefCell::new(None) }
        }

        fn with_incoming(bytes: &[u8]) -> Self {
            Self { channel_clear: true, incoming: RefCell::new(Some(HVec::from_slice(bytes).unwrap())) }
        }
    }

    impl Radio<radio::BasicInfo, ()> for StubRadio {
        fn set_channel(&mut self, _channel: u8) -> Result<(), ()> {
            Ok(())
        }
        fn on(&mut self) -> Result<(), ()> {
            Ok(())
        }
        fn off(&mut self) -> Result<(), ()> {
            Ok(())
        }
        fn prepare(&mut self, _buf: &[u8]) -> Result<(), ()> {
            Ok(())
        }
        fn transmit(&mut self) -> Result<bool, ()> {
            Ok(true)
        }
        fn receiving_packet(&mut self) -> Result<bool, ()> {
            Ok(self.incoming.borrow().is_some())
        }
        fn pending_packet(&mut self) -> Result<bool, ()> {
            Ok(self.incoming.borrow().is_some())
        }
        fn read(&mut self, dest: &mut [u8]) -> Result<(usize, radio::BasicInfo), ()> {
            match self.incoming.borrow_mut().take() {
                Some(frame) => {
                    dest[..frame.len()].copy_from_slice(&frame);
                    Ok((frame.len(), radio::BasicInfo::default()))
                }
                None => Ok((0, radio::BasicInfo::default())),
            }
        }
        fn channel_clear(&mut self) -> Result<bool, ()> {
            Ok(self.channel_clear)
        }
    }

    /// All timeslot-template offsets zeroed so every busy-wait deadline in
    /// `run_tx`/`run_rx` equals `slot_start` (0); paired with a `MockTimer`
    /// that starts past every deadline, each busy-wait exits on its very
    /// first check.
    fn zero_timing_config() -> Config {
        let mut config = Config::default();
        config.ts_slot_duration = 0;
        config.ts_tx_offset = 0;
        config.ts_long_gt = 0;
        config.ts_short_gt = 0;
        config.ts_tx_ack_delay = 0;
        config.ts_rx_ack_delay = 0;
        config.ts_cca_offset = 0;
        config.ts_cca = 0;
        config.delay_tx = 0;
        config.delay_rx = 0;
        config
    }

    #[test]
    fn select_outbound_neighbor_prefers_eb_queue_for_advertising_only_links() {
        let config = Config::default();
        let mut neighbors: NeighborTable<4, 4> = NeighborTable::new(&config);
        crate::beacon::enqueue_eb(&mut neighbors, addr(1), 0, Asn::new(0), 0).unwrap();

        let chosen = select_outbound_neighbor(&neighbors, true, None, false);
        assert_eq!(chosen, Some(crate::neighbor::EB_INDEX));
    }

    #[test]
    fn select_outbound_neighbor_falls_back_to_any_unicast_when_broadcast_empty() {
        let config = Config::default();
        let mut neighbors: NeighborTable<4, 4> = NeighborTable::new(&config);
        let idx = neighbors.add(addr(2), &config).unwrap();
        neighbors
            .add_packet(addr(2), OutgoingPacket::new(Packet::keepalive(addr(2), addr(1), 0), None, 0), &config)
            .unwrap();

        let chosen = select_outbound_neighbor(&neighbors, false, None, false);
        assert_eq!(chosen, Some(idx));
    }

    #[test]
    fn decrement_shared_backoff_targets_the_link_address() {
        let config = Config::default();
        let mut neighbors: NeighborTable<4, 4> = NeighborTable::new(&config);
        neighbors.add(addr(3), &config).unwrap();
        neighbors.get_mut(addr(3)).unwrap().backoff_window = 2;

        decrement_shared_backoff(&mut neighbors, Some(addr(3)), None);
        assert_eq!(neighbors.get(addr(3)).unwrap().backoff_window, 1);
    }

    #[test]
    fn decrement_shared_backoff_also_ticks_the_unicast_neighbor_selected_off_a_broadcast_link() {
        let config = Config::default();
        let mut neighbors: NeighborTable<4, 4> = NeighborTable::new(&config);
        let idx = neighbors.add(addr(6), &config).unwrap();
        neighbors.get_mut(addr(6)).unwrap().backoff_window = 2;
        neighbors.broadcast_mut().backoff_window = 3;

        decrement_shared_backoff(&mut neighbors, None, Some(idx));

        assert_eq!(neighbors.get(addr(6)).unwrap().backoff_window, 1);
        assert_eq!(neighbors.broadcast().backoff_window, 2);
    }

    #[test]
    fn finish_tx_attempt_keeps_packet_queued_before_max_retries() {
        let config = Config::default();
        let mut table: NeighborTable<4, 4> = NeighborTable::new(&config);
        let idx = table.add(addr(4), &config).unwrap();
        let dequeued: Ring<DequeuedEntry, 4> = Ring::new();
        let mut packet = OutgoingPacket::new(Packet::keepalive(addr(4), addr(1), 0), None, 0);

        let neighbor = table.at_mut(idx).unwrap();
        let done = finish_tx_attempt(&mut packet, neighbor, idx, false, TxOutcome::NoAck, &config, 0, &dequeued);

        assert!(!done);
        assert_eq!(packet.transmissions, 1);
        assert!(dequeued.pop().is_none());
    }

    #[test]
    fn finish_tx_attempt_drops_after_max_retries() {
        let config = Config::default();
        let mut table: NeighborTable<4, 4> = NeighborTable::new(&config);
        let idx = table.add(addr(5), &config).unwrap();
        let dequeued: Ring<DequeuedEntry, 4> = Ring::new();
        let mut packet = OutgoingPacket::new(Packet::keepalive(addr(5), addr(1), 0), None, 0);
        packet.transmissions = config.max_frame_retries;

        let neighbor = table.at_mut(idx).unwrap();
        let done = finish_tx_attempt(&mut packet, neighbor, idx, false, TxOutcome::NoAck, &config, 0, &dequeued);

        assert!(done);
        assert_eq!(packet.transmissions, config.max_frame_retries + 1);
        assert!(dequeued.pop().is_some());
    }

    #[test]
    fn run_tx_reports_collision_when_channel_busy() {
        let mut config = zero_timing_config();
        config.cca_enable = true;
        let timer = MockTimer::new();
        let mut radio = StubRadio::busy();
        let mut packet = Packet::data(addr(1), addr(2), 0, &[1, 2, 3], false);

        let result: TxSlotResult =
            run_tx::<_, _, ()>(&mut radio, &timer, &config, &mut packet, false, false, Asn::new(0), 0, 0, None::<Address>).unwrap();

        assert_eq!(result.outcome, TxOutcome::Collision);
    }

    #[test]
    fn run_tx_succeeds_for_a_broadcast_with_no_ack_request() {
        let mut config = zero_timing_config();
        config.cca_enable = false;
        let timer = MockTimer::new();
        timer.set(1);
        let mut radio = StubRadio::idle();
        let mut packet = Packet::data(Address::broadcast(&ieee802154::mac::AddressMode::Short), addr(2), 0, &[1, 2, 3], false);

        let result: TxSlotResult =
            run_tx::<_, _, ()>(&mut radio, &timer, &config, &mut packet, false, false, Asn::new(0), 0, 0, None::<Address>).unwrap();

        assert_eq!(result.outcome, TxOutcome::Ok);
    }

    #[test]
    fn run_tx_reports_no_ack_when_nothing_arrives() {
        let mut config = zero_timing_config();
        config.cca_enable = false;
        let timer = MockTimer::new();
        timer.set(1);
        let mut radio = StubRadio::idle();
        let mut packet = Packet::data(addr(3), addr(2), 0, &[1, 2, 3], true);

        let result: TxSlotResult =
            run_tx::<_, _, ()>(&mut radio, &timer, &config, &mut packet, true, false, Asn::new(0), 0, 0, None::<Address>).unwrap();

        assert_eq!(result.outcome, TxOutcome::NoAck);
    }

    #[test]
    fn run_tx_applies_clamped_drift_from_a_valid_time_source_ack() {
        let mut config = zero_timing_config();
        config.cca_enable = false;
        config.ts_long_gt = 100;
        let timer = MockTimer::new();
        timer.set(1);

        let source = addr(9);
        let mut packet = Packet::data(addr(3), addr(2), 7, &[1, 2, 3], true);
        let ack = Packet::enhanced_ack(&packet, 1_000, false, Asn::new(0));
        let mut buf = [0u8; 64];
        let n = ack.encode(&mut buf, WriteFooter::No);
        let mut ack_with_source = Packet::decode(&buf[..n], false).unwrap();
        ack_with_source.header.source = source;
        let mut buf2 = [0u8; 64];
        let n2 = ack_with_source.encode(&mut buf2, WriteFooter::No);

        let mut radio = StubRadio::with_incoming(&buf2[..n2]);

        let result: TxSlotResult =
            run_tx::<_, _, ()>(&mut radio, &timer, &config, &mut packet, true, false, Asn::new(0), 0, 0, Some(source)).unwrap();

        assert_eq!(result.outcome, TxOutcome::Ok);
        assert!(result.synced_with_time_source);
        // Clamp is `ts_long_gt / 2` = 50, well below the raw 1000 tick drift.
        assert_eq!(result.drift, Some(50));
    }

    #[test]
    fn run_rx_reports_nothing_when_no_frame_arrives() {
        let config = zero_timing_config();
        let timer = MockTimer::new();
        timer.set(1);
        let mut radio = StubRadio::idle();
        let mut input = InputPacket::empty();

        let outcome: SlotOutcome =
            run_rx::<_, _, ()>(&mut radio, &timer, &config, &mut input, addr(1), None, Asn::new(0), 0, false).unwrap();

        assert!(outcome.drift.is_none());
        assert_eq!(input.len, 0);
    }

    #[test]
    fn run_rx_records_drift_from_the_time_source() {
        let mut config = zero_timing_config();
        config.ts_long_gt = 100;
        let timer = MockTimer::new();
        timer.set(1);

        let source = addr(7);
        let data = Packet::data(addr(1), source, 0, &[9], false);
        let mut buf = [0u8; 64];
        let n = data.encode(&mut buf, WriteFooter::No);
        let mut radio = StubRadio::with_incoming(&buf[..n]);
        let mut input = InputPacket::empty();

        let outcome: SlotOutcome =
            run_rx::<_, _, ()>(&mut radio, &timer, &config, &mut input, addr(1), Some(source), Asn::new(0), 0, false).unwrap();

        assert!(outcome.synced_with_time_source);
        assert!(outcome.drift.is_some());
        assert_eq!(input.len, n);
    }
}
