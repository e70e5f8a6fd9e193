//! Packet representation and the TSCH Sync-IE wire format.
//!
//! Built on the `ieee802154` crate's `mac::Header`/`FrameContent` exactly as
//! `mac_802154/packet.rs` does, with owned `heapless` storage so the whole
//! crate stays allocation-free. The pinned `ieee802154` branch exposes
//! `Header::ie_present` but no 2015 Information-Element sub-framing, so the
//! TSCH-specific Sync-IE (ASN + join priority, or ASN + drift + NACK bit)
//! is appended as trailing payload bytes behind that flag -- see
//! `DESIGN.md` for the tradeoff.

use heapless::Vec;
use ieee802154::mac::{Address, DecodeError, FrameContent, FrameType, FrameVersion, Header, Security, WriteFooter};

use crate::asn::Asn;

pub const MAX_PAYLOAD_LEN: usize = 256;

/// An owned 802.15.4 MAC frame.
#[derive(Clone, Debug)]
pub struct Packet {
    pub header: Header,
    pub content: FrameContent,
    payload: Vec<u8, MAX_PAYLOAD_LEN>,
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.content == other.content && self.payload() == other.payload()
    }
}

impl Packet {
    fn header(frame_type: FrameType, dest: Address, source: Address, seq: u8, ack_request: bool, ie_present: bool) -> Header {
        Header {
            frame_type,
            frame_pending: false,
            security: Security::None,
            ack_request,
            pan_id_compress: false,
            version: FrameVersion::Ieee802154_2006,
            destination: dest,
            source,
            seq,
            seq_no_suppress: false,
            ie_present,
        }
    }

    /// Build an Enhanced Beacon carrying the Sync-IE. The ASN must be
    /// stamped at transmit time, so `asn` here is whatever value is current
    /// when the caller is about to hand the buffer to the radio, not when
    /// the EB was enqueued.
    pub fn beacon(source: Address, seq: u8, asn: Asn, join_priority: u8) -> Packet {
        let mut payload = Vec::new();
        let _ = SyncIe { asn, join_priority, drift: 0, nack: false }.encode_beacon(&mut payload);

        Packet {
            header: Self::header(FrameType::Beacon, Address::broadcast(&ieee802154::mac::AddressMode::Short), source, seq, false, true),
            content: FrameContent::Beacon(ieee802154::mac::beacon::Beacon {
                superframe_spec: ieee802154::mac::beacon::SuperframeSpecification {
                    beacon_order: ieee802154::mac::beacon::BeaconOrder::OnDemand,
                    superframe_order: ieee802154::mac::beacon::SuperframeOrder::Inactive,
                    pan_coordinator: false,
                    battery_life_extension: false,
                    association_permit: false,
                    final_cap_slot: 0,
                },
                guaranteed_time_slot_info: ieee802154::mac::beacon::GuaranteedTimeSlotInformation::new(),
                pending_address: ieee802154::mac::beacon::PendingAddress::new(),
            }),
            payload,
        }
    }

    /// Re-stamp an already-built EB's Sync-IE with the current ASN,
    /// required because the EB may sit in the EB neighbour's queue for a
    /// while before its slot comes up.
    pub fn restamp_beacon_asn(&mut self, asn: Asn, join_priority: u8) {
        self.payload.clear();
        let _ = SyncIe { asn, join_priority, drift: 0, nack: false }.encode_beacon(&mut self.payload);
    }

    pub fn data(dest: Address, source: Address, seq: u8, data: &[u8], ack_request: bool) -> Packet {
        let payload = Vec::from_slice(data).unwrap_or_default();
        Packet {
            header: Self::header(FrameType::Data, dest, source, seq, ack_request, false),
            content: FrameContent::Data,
            payload,
        }
    }

    /// Empty unicast keepalive.
    pub fn keepalive(dest: Address, source: Address, seq: u8) -> Packet {
        Packet::data(dest, source, seq, &[], true)
    }

    /// Build an Enhanced ACK carrying the drift Sync-IE.
    pub fn enhanced_ack(request: &Packet, drift: i16, nack: bool, asn: Asn) -> Packet {
        let mut payload = Vec::new();
        let _ = SyncIe { asn, join_priority: 0, drift, nack }.encode_ack(&mut payload);

        Packet {
            header: Self::header(
                FrameType::Acknowledgement,
                request.header.source,
                request.header.destination,
                request.header.seq,
                false,
                true,
            ),
            content: FrameContent::Acknowledgement,
            payload,
        }
    }

    pub fn pan_id(&self) -> ieee802154::mac::PanId {
        match self.header.destination {
            Address::Short(pan_id, _) => return pan_id,
            Address::Extended(pan_id, _) => return pan_id,
            _ => (),
        }
        match self.header.source {
            Address::Short(pan_id, _) => return pan_id,
            Address::Extended(pan_id, _) => return pan_id,
            _ => (),
        }
        ieee802154::mac::PanId(0xfffe)
    }

    pub fn is_ack_for(&self, original: &Packet) -> bool {
        self.header.frame_type == FrameType::Acknowledgement
            && self.header.source == original.header.destination
            && self.header.destination == original.header.source
            && self.header.seq == original.header.seq
            && self.content == FrameContent::Acknowledgement
    }

    /// Decode the Sync-IE trailing a beacon or enhanced ACK, if present.
    pub fn sync_ie(&self) -> Option<SyncIe> {
        if !self.header.ie_present {
            return None;
        }
        match self.header.frame_type {
            FrameType::Beacon => SyncIe::decode_beacon(self.payload()).ok(),
            FrameType::Acknowledgement => SyncIe::decode_ack(self.payload()).ok(),
            _ => None,
        }
    }

    pub fn encode(&self, buf: &mut [u8], write_footer: WriteFooter) -> usize {
        let mut len = 0;
        len += self.header.encode(&mut buf[len..]);
        len += self.content.encode(&mut buf[len..]);
        buf[len..len + self.payload.len()].copy_from_slice(&self.payload);
        len += self.payload.len();
        match write_footer {
            WriteFooter::No => (),
        }
        len
    }

    pub fn decode(buf: &[u8], contains_footer: bool) -> Result<Self, DecodeError> {
        let mut remaining = buf.len();

        let (header, header_len) = Header::decode(buf)?;
        remaining -= header_len;

        if contains_footer {
            if remaining < 2 {
                return Err(DecodeError::NotEnoughBytes);
            }
            remaining -= 2;
        }

        let body = &buf[header_len..header_len + remaining];
        let (content, used) = FrameContent::decode(body, &header)?;

        let payload = Vec::from_slice(&body[used..]).map_err(|_| DecodeError::NotEnoughBytes)?;

        Ok(Packet { header, content, payload })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, body: &[u8]) -> Result<(), ()> {
        self.payload = Vec::from_slice(body).map_err(|_| ())?;
        Ok(())
    }
}

/// Synchronisation Information Element: carried in an Enhanced Beacon
/// (ASN + join priority) or an Enhanced ACK (signed drift ticks + NACK bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncIe {
    pub asn: Asn,
    pub join_priority: u8,
    pub drift: i16,
    pub nack: bool,
}

impl SyncIe {
    fn encode_beacon(&self, out: &mut Vec<u8, MAX_PAYLOAD_LEN>) -> Result<(), ()> {
        let asn = self.asn.value().to_le_bytes();
        out.extend_from_slice(&asn[..5]).map_err(|_| ())?;
        out.push(self.join_priority).map_err(|_| ())
    }

    fn decode_beacon(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < 6 {
            return Err(DecodeError::NotEnoughBytes);
        }
        let mut asn_bytes = [0u8; 8];
        asn_bytes[..5].copy_from_slice(&buf[..5]);
        Ok(SyncIe {
            asn: Asn::new(u64::from_le_bytes(asn_bytes)),
            join_priority: buf[5],
            drift: 0,
            nack: false,
        })
    }

    fn encode_ack(&self, out: &mut Vec<u8, MAX_PAYLOAD_LEN>) -> Result<(), ()> {
        let asn = self.asn.value().to_le_bytes();
        out.extend_from_slice(&asn[..5]).map_err(|_| ())?;
        out.extend_from_slice(&self.drift.to_le_bytes()).map_err(|_| ())?;
        out.push(self.nack as u8).map_err(|_| ())
    }

    fn decode_ack(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < 8 {
            return Err(DecodeError::NotEnoughBytes);
        }
        let mut asn_bytes = [0u8; 8];
        asn_bytes[..5].copy_from_slice(&buf[..5]);
        Ok(SyncIe {
            asn: Asn::new(u64::from_le_bytes(asn_bytes)),
            join_priority: 0,
            drift: i16::from_le_bytes([buf[5], buf[6]]),
            nack: buf[7] != 0,
        })
    }
}

/// A received-but-not-yet-decoded frame: fixed-capacity payload buffer,
/// receive ASN, length and RSSI.
#[derive(Clone)]
pub struct InputPacket {
    pub buf: [u8; MAX_PAYLOAD_LEN],
    pub len: usize,
    pub asn: Asn,
    pub rssi: i16,
}

impl InputPacket {
    pub fn empty() -> Self {
        Self { buf: [0u8; MAX_PAYLOAD_LEN], len: 0, asn: Asn::new(0), rssi: i16::MIN }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Tagged closure stored by value alongside an outbound packet: a function
/// pointer plus an opaque argument, so the radio driver itself never needs
/// to know the callback's concrete type.
pub type SentCallback = fn(arg: usize, outcome: crate::error::TxOutcome, transmissions: u8);

/// An enqueued outbound packet: the frame to send, its sent-callback, a
/// transmission counter and the last result code.
#[derive(Clone)]
pub struct OutgoingPacket {
    pub packet: Packet,
    pub callback: Option<SentCallback>,
    pub callback_arg: usize,
    pub transmissions: u8,
    pub last_result: Option<crate::error::TxOutcome>,
}

impl OutgoingPacket {
    pub fn new(packet: Packet, callback: Option<SentCallback>, callback_arg: usize) -> Self {
        Self { packet, callback, callback_arg, transmissions: 0, last_result: None }
    }

    pub fn fire_callback(&self) {
        if let (Some(cb), Some(result)) = (self.callback, self.last_result) {
            cb(self.callback_arg, result, self.transmissions);
        }
    }
}

/// An entry in the dequeued-packet ring: decouples interrupt-context
/// completion from the cooperative callback dispatch.
#[derive(Clone)]
pub struct DequeuedEntry {
    pub packet: OutgoingPacket,
    pub neighbor_index: usize,
}

#[cfg(test)]
mod test {
    use super::*;
    use ieee802154::mac::{AddressMode, ExtendedAddress, PanId, ShortAddress};

    #[test]
    fn data_packet_round_trips() {
        let dest = Address::Short(PanId(1), ShortAddress(2));
        let src = Address::Short(PanId(1), ShortAddress(3));
        let packet = Packet::data(dest, src, 7, &[1, 2, 3, 4], true);

        let mut buf = [0u8; 64];
        let n = packet.encode(&mut buf, WriteFooter::No);
        let decoded = Packet::decode(&buf[..n], false).unwrap();

        assert_eq!(decoded, packet);
        assert_eq!(decoded.payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn enhanced_ack_carries_signed_drift_and_nack() {
        let dest = Address::Extended(PanId(1), ExtendedAddress(2));
        let src = Address::Extended(PanId(1), ExtendedAddress(3));
        let data = Packet::data(dest, src, 9, &[0], true);

        let ack = Packet::enhanced_ack(&data, -37, true, Asn::new(12345));
        assert!(ack.is_ack_for(&data));

        let ie = ack.sync_ie().unwrap();
        assert_eq!(ie.drift, -37);
        assert!(ie.nack);
        assert_eq!(ie.asn.value(), 12345);
    }

    #[test]
    fn beacon_sync_ie_round_trips_asn_and_join_priority() {
        let src = Address::Extended(PanId(1), ExtendedAddress(0xabcd));
        let beacon = Packet::beacon(src, 0, Asn::new(999_999), 3);

        let ie = beacon.sync_ie().unwrap();
        assert_eq!(ie.asn.value(), 999_999);
        assert_eq!(ie.join_priority, 3);
    }
}
