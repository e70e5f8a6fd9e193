//! Top-level MAC context: owns the schedule, neighbour table, association
//! and beacon state, and drives the per-slot state machine described for
//! `slot.rs`'s sub-machines.
//!
//! `tick` is the single entry point a platform's high-resolution timer
//! interrupt calls; it implements the seven-step slot iteration (lock
//! check, candidate selection, channel hop, TX/RX/idle, backoff decrement,
//! next-wakeup/ASN/drift bookkeeping, desync check) around the sub-machines
//! `slot::run_tx`/`slot::run_rx` already provide. One entry point dispatches
//! association, beaconing and radio work off a single timer callback, built
//! around TSCH's link-driven schedule instead of a superframe/CAP model.

use ieee802154::mac::Address;
use log::warn;

use crate::asn::{Asn, HoppingSequence};
use crate::association::{Association, JoinRejection};
use crate::beacon::{self, BeaconScheduler, DeliverCallback};
use crate::config::Config;
use crate::dedup::SeqnoCache;
use crate::deferred;
use crate::error::CoreError;
use crate::lock::GlobalLock;
use crate::neighbor::NeighborTable;
use crate::packet::{DequeuedEntry, InputPacket, OutgoingPacket, Packet, SentCallback};
use crate::radio::Radio;
use crate::ring::Ring;
use crate::schedule::Schedule;
use crate::timer::Timer;

/// Bounds the "re-arm, find the deadline already missed, skip another slot"
/// loop in step 6 so a pathological configuration (e.g. a slot duration
/// shorter than the time it takes to compute a wakeup) cannot spin forever.
const MAX_CATCH_UP_SLOTS: u32 = 8;

pub struct Mac<
    'seq,
    const N: usize,
    const Q: usize,
    const S: usize,
    const L: usize,
    const INPUT: usize,
    const DEQ: usize,
    const DUP: usize,
> {
    pub config: Config,
    own_address: Address,
    hopping: HoppingSequence<'seq>,
    scan_page: &'seq [u8],

    current_asn: Asn,
    last_sync_asn: Asn,
    /// Absolute tick time of the current link's slot start.
    current_link_start: u32,
    seq: u8,

    association: Association,
    beacon_scheduler: BeaconScheduler,
    neighbors: NeighborTable<N, Q>,
    schedule: Schedule<S, L>,
    lock: GlobalLock,

    input_ring: Ring<InputPacket, INPUT>,
    dequeued_ring: Ring<DequeuedEntry, DEQ>,
    dedup: SeqnoCache<DUP>,

    input_drops: u32,
}

impl<'seq, const N: usize, const Q: usize, const S: usize, const L: usize, const INPUT: usize, const DEQ: usize, const DUP: usize>
    Mac<'seq, N, Q, S, L, INPUT, DEQ, DUP>
{
    pub fn new(config: Config, own_address: Address, hopping: HoppingSequence<'seq>, scan_page: &'seq [u8]) -> Self {
        let neighbors = NeighborTable::new(&config);
        let tx_prioritisation = config.tx_prioritisation;
        let mut association = Association::new();
        if config.pan_coordinator {
            association.start_as_coordinator();
        }

        Self {
            config,
            own_address,
            hopping,
            scan_page,
            current_asn: Asn::new(0),
            last_sync_asn: Asn::new(0),
            current_link_start: 0,
            seq: 0,
            association,
            beacon_scheduler: BeaconScheduler::new(),
            neighbors,
            schedule: Schedule::new(tx_prioritisation),
            lock: GlobalLock::new(),
            input_ring: Ring::new(),
            dequeued_ring: Ring::new(),
            dedup: SeqnoCache::new(),
            input_drops: 0,
        }
    }

    pub fn is_associated(&self) -> bool {
        self.association.is_associated()
    }

    pub fn current_asn(&self) -> Asn {
        self.current_asn
    }

    pub fn schedule_mut(&mut self) -> &mut Schedule<S, L> {
        &mut self.schedule
    }

    pub fn neighbors_mut(&mut self) -> &mut NeighborTable<N, Q> {
        &mut self.neighbors
    }

    pub fn lock(&self) -> &GlobalLock {
        &self.lock
    }

    fn next_seq(&mut self) -> u8 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Queue a unicast or broadcast data frame. Acquires the global lock,
    /// since adding a new neighbour or appending to its queue is structural
    /// mutation; returns `CoreError::LockHeld` if the slot engine currently
    /// owns it.
    pub fn enqueue<E>(
        &mut self,
        dest: Address,
        payload: &[u8],
        ack_request: bool,
        callback: Option<SentCallback>,
        callback_arg: usize,
    ) -> Result<(), CoreError<E>> {
        let guard = self.lock.lock().ok_or(CoreError::LockHeld)?;
        let seq = self.next_seq();
        let packet = Packet::data(dest, self.own_address, seq, payload, ack_request);
        let outgoing = OutgoingPacket::new(packet, callback, callback_arg);
        let result = self.neighbors.add_packet(dest, outgoing, &self.config).map_err(|_| CoreError::EnqueueFail);
        drop(guard);
        result
    }

    /// The timer-interrupt entry point: drives association scanning while
    /// unassociated, else one atomic slot of the TSCH state machine.
    #[allow(clippy::too_many_arguments)]
    pub fn tick<R, I, E>(
        &mut self,
        radio: &mut R,
        timer: &dyn Timer,
        deliver: Option<DeliverCallback>,
        deliver_arg: usize,
        random_u32: u32,
        wall_clock_seconds: u64,
        wall_clock_minutes: u64,
    ) -> Result<(), CoreError<E>>
    where
        R: Radio<I, E>,
        I: radio::ReceiveInfo,
        E: core::fmt::Debug,
    {
        if !self.association.is_associated() {
            return self.tick_scan(radio, timer, wall_clock_seconds, wall_clock_minutes, random_u32);
        }

        let mut caught_up = false;
        for _ in 0..MAX_CATCH_UP_SLOTS {
            if self.run_one_slot(radio, timer, deliver, deliver_arg, random_u32)? {
                caught_up = true;
                break;
            }
        }

        let mut desynced = false;
        if !self.config.pan_coordinator {
            let slots_since_sync = self.last_sync_asn.forward_distance(self.current_asn);
            if slots_since_sync > self.config.desync_threshold {
                warn!("desynchronised after {} slots, re-associating", slots_since_sync);
                self.association.mark_unassociated();
                self.beacon_scheduler.on_unassociated();
                desynced = true;
            }
        }

        if self.association.is_associated() {
            if self.beacon_scheduler.eb_due(timer.ticks_ms() as u64) {
                let next = self.next_seq();
                let _ = beacon::enqueue_eb(&mut self.neighbors, self.own_address, next, self.current_asn, self.association.join_priority());
                self.beacon_scheduler.reschedule_eb(timer.ticks_ms() as u64, &self.config, random_u32);
            }
            if self.beacon_scheduler.keepalive_due(timer.ticks_ms() as u64) {
                let next = self.next_seq();
                let _ = beacon::enqueue_keepalive(&mut self.neighbors, self.own_address, next, &self.config);
                self.beacon_scheduler.reschedule_keepalive(timer.ticks_ms() as u64, &self.config, random_u32);
            }
        }

        // Report real failures only after every other tick's bookkeeping has
        // already run -- desync takes priority since it is the more serious
        // condition (it also forces re-association).
        if desynced {
            return Err(CoreError::Desync);
        }
        if !caught_up {
            warn!("slot engine did not catch up within {} slots", MAX_CATCH_UP_SLOTS);
            return Err(CoreError::DeadlineMiss);
        }

        Ok(())
    }

    /// Runs one atomic slot (steps 1-6 of the slot state machine); returns
    /// `true` once the computed next wakeup is not already missed, `false`
    /// if the caller should immediately run another (caught-up) slot.
    fn run_one_slot<R, I, E>(
        &mut self,
        radio: &mut R,
        timer: &dyn Timer,
        deliver: Option<DeliverCallback>,
        deliver_arg: usize,
        random_u32: u32,
    ) -> Result<bool, CoreError<E>>
    where
        R: Radio<I, E>,
        I: radio::ReceiveInfo,
        E: core::fmt::Debug,
    {
        // Step 1.
        let link = self.schedule.get_link_from_asn(self.current_asn).map(|(_, l)| l);
        let should_run = link.is_some() && !self.lock.slot_should_yield();

        let mut drift = None;
        let mut synced = false;
        let mut ran_tx_or_rx = false;

        if should_run {
            let link = link.unwrap();
            self.lock.enter_slot_operation();

            // Step 2.
            let is_shared_link = link.options.shared;
            let is_advertising = matches!(link.link_type, crate::schedule::LinkType::Advertising | crate::schedule::LinkType::AdvertisingOnly);
            let neighbor_index = crate::slot::select_outbound_neighbor(&self.neighbors, is_advertising, link.address, is_shared_link);

            // Step 3.
            let channel = self.hopping.channel(self.current_asn, link.channel_offset);
            let _ = radio.set_channel(channel);

            // Step 4.
            let time_source_addr = self.neighbors.get_time_source().map(|n| n.address);
            match neighbor_index {
                Some(idx) if self.neighbors.get_packet_for_nbr(idx, is_shared_link).is_some() => {
                    match self.run_tx_slot(radio, timer, idx, is_shared_link, time_source_addr, random_u32, &mut drift, &mut synced) {
                        Ok(()) => ran_tx_or_rx = true,
                        Err(CoreError::DequeueFull) => {}
                        Err(e) => return Err(e),
                    }
                }
                Some(_) if link.options.rx => match self.run_rx_slot(radio, timer, time_source_addr, &mut drift, &mut synced) {
                    Ok(received) => ran_tx_or_rx |= received,
                    Err(CoreError::InputQueueFull) => {}
                    Err(e) => return Err(e),
                },
                Some(_) => {}
                None if link.options.rx => match self.run_rx_slot(radio, timer, time_source_addr, &mut drift, &mut synced) {
                    Ok(received) => ran_tx_or_rx |= received,
                    Err(CoreError::InputQueueFull) => {}
                    Err(e) => return Err(e),
                },
                None => {}
            }

            // Step 5.
            if is_shared_link {
                crate::slot::decrement_shared_backoff(&mut self.neighbors, link.address, neighbor_index);
            }

            self.lock.exit_slot_operation();
        }

        if synced {
            self.last_sync_asn = self.current_asn;
            self.beacon_scheduler.on_sync(timer.ticks_ms() as u64, &self.config, random_u32);
        }

        if ran_tx_or_rx {
            deferred::drain_dequeued(&self.dequeued_ring, &mut self.neighbors);
            deferred::drain_input(&self.input_ring, &self.neighbors, &mut self.current_asn, &self.lock, &mut self.dedup, deliver, deliver_arg);
        }

        // Step 6.
        let distance = self.schedule.get_next_active_link(self.current_asn).map(|(_, _, d)| d).unwrap_or(1);
        let slots = (distance as u64).max(1);
        self.current_asn.advance(slots);

        let mut next_link_start = self.current_link_start.wrapping_add((slots as u32).wrapping_mul(self.config.ts_slot_duration));
        if let Some(d) = drift {
            next_link_start = if d >= 0 { next_link_start.wrapping_add(d as u32) } else { next_link_start.wrapping_sub((-d) as u32) };
        }
        self.current_link_start = next_link_start;

        Ok(!crate::asn::deadline_missed(timer.ticks(), self.current_link_start, 0, 0))
    }

    /// Runs the TX sub-machine for the neighbour already known to have a
    /// ready packet. Checks the dequeued ring has room *before* running the
    /// transmission, so a momentarily full ring backs the attempt off
    /// (leaving the packet queued, to retry next matching slot) rather than
    /// silently dropping `finish_tx_attempt`'s completed-packet bookkeeping.
    #[allow(clippy::too_many_arguments)]
    fn run_tx_slot<R, I, E>(
        &mut self,
        radio: &mut R,
        timer: &dyn Timer,
        idx: usize,
        is_shared_link: bool,
        time_source_addr: Option<Address>,
        random_u32: u32,
        drift_out: &mut Option<i32>,
        synced_out: &mut bool,
    ) -> Result<(), CoreError<E>>
    where
        R: Radio<I, E>,
        I: radio::ReceiveInfo,
        E: core::fmt::Debug,
    {
        if self.dequeued_ring.reserve().is_none() {
            warn!("dequeued ring full, deferring tx to neighbor {}", idx);
            return Err(CoreError::DequeueFull);
        }

        let mut packet = self.neighbors.get_packet_for_nbr(idx, is_shared_link).cloned().ok_or(CoreError::EnqueueFail)?;
        let ack_request = packet.packet.header.ack_request;
        let is_eb = idx == crate::neighbor::EB_INDEX;
        let result = crate::slot::run_tx(
            radio,
            timer,
            &self.config,
            &mut packet.packet,
            ack_request,
            is_eb,
            self.current_asn,
            self.association.join_priority(),
            self.current_link_start,
            time_source_addr,
        )?;

        *drift_out = result.drift;
        *synced_out = result.synced_with_time_source;

        let neighbor = self.neighbors.at_mut(idx).ok_or(CoreError::EnqueueFail)?;
        let done = crate::slot::finish_tx_attempt(&mut packet, neighbor, idx, is_shared_link, result.outcome, &self.config, random_u32, &self.dequeued_ring);

        self.neighbors.remove_packet_from_queue(idx);
        if !done {
            let _ = self.neighbors.add_packet_to_index(idx, packet);
        }
        Ok(())
    }

    fn run_rx_slot<R, I, E>(
        &mut self,
        radio: &mut R,
        timer: &dyn Timer,
        time_source_addr: Option<Address>,
        drift_out: &mut Option<i32>,
        synced_out: &mut bool,
    ) -> Result<bool, CoreError<E>>
    where
        R: Radio<I, E>,
        I: radio::ReceiveInfo,
        E: core::fmt::Debug,
    {
        let Some(reserved) = self.input_ring.reserve() else {
            self.input_drops = self.input_drops.saturating_add(1);
            warn!("input ring full, dropped a frame ({} total)", self.input_drops);
            return Err(CoreError::InputQueueFull);
        };

        let mut input = InputPacket::empty();
        let outcome = crate::slot::run_rx(
            radio,
            timer,
            &self.config,
            &mut input,
            self.own_address,
            time_source_addr,
            self.current_asn,
            self.current_link_start,
            false,
        )?;

        if input.len == 0 {
            return Ok(false);
        }

        *drift_out = outcome.drift;
        *synced_out = outcome.synced_with_time_source;

        unsafe { self.input_ring.write(reserved, input) };
        self.input_ring.commit_put();
        Ok(true)
    }

    /// Association scan loop: hop to a pseudo-random channel, listen
    /// briefly for a pending frame, and join on a valid EB.
    fn tick_scan<R, I, E>(
        &mut self,
        radio: &mut R,
        timer: &dyn Timer,
        wall_clock_seconds: u64,
        wall_clock_minutes: u64,
        random_u32: u32,
    ) -> Result<(), CoreError<E>>
    where
        R: Radio<I, E>,
        I: radio::ReceiveInfo,
        E: core::fmt::Debug,
    {
        let base_offset = (random_u32 & 0xff) as u8;
        let channel = Association::scan_channel(self.scan_page, self.current_asn, base_offset, wall_clock_seconds);
        radio.set_channel(channel).map_err(CoreError::Radio)?;
        radio.on().map_err(CoreError::Radio)?;

        let listen_deadline = timer.ticks().wrapping_add(self.config.assoc_timeout as u32);
        let mut buf = [0u8; crate::packet::MAX_PAYLOAD_LEN];
        let mut n = 0;
        while timer.ticks().wrapping_sub(listen_deadline) as i32 <= 0 {
            if radio.pending_packet().map_err(CoreError::Radio)? {
                let (len, _info) = radio.read(&mut buf).map_err(CoreError::Radio)?;
                n = len;
                break;
            }
        }
        radio.off().map_err(CoreError::Radio)?;

        if n == 0 {
            return Ok(());
        }

        let packet = Packet::decode(&buf[..n], false)?;
        let sender = packet.header.source;

        match self.association.try_join(&packet, sender, timer.ticks_ms() as u64, wall_clock_minutes, &self.config) {
            Ok(join) => {
                self.current_asn = join.asn;
                self.last_sync_asn = join.asn;
                self.current_link_start = join.current_link_start as u32;
                let _ = self.neighbors.add(join.time_source, &self.config);
                self.neighbors.update_time_source(join.time_source);
                self.beacon_scheduler.on_associated(timer.ticks_ms() as u64, &self.config, random_u32);
                Ok(())
            }
            Err(JoinRejection::JoinPriorityTooHigh) => Err(CoreError::JoinPriorityTooHigh),
            Err(JoinRejection::NoSyncIe) | Err(JoinRejection::AsnDivergence) => Ok(()),
        }
    }
}
