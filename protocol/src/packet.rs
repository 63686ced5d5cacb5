//! Wire codec.
//!
//! Packet layout - all numbers in network byte order (BE):
//! ```ascii
//! 0: sequence field (u32)
//!    * bit 0-23:  control tag, unreliable sequence or reliable sequence (see `sequence`)
//!    * bit 24-27: metadata type (0 = none, 1 = 8 byte client id chunk follows the header)
//!    * bit 28-31: number of redundant record copies appended to the payload
//! 4: cumulative ack (u32) - the last reliable sequence received in order
//! 8: metadata chunk (8 bytes, only if metadata type is 1)
//! *: payload
//! ```
//!
//! A reliable packet with `k` copies carries
//! `[newest record][copy 1][len 1 (u16)]..[copy k][len k (u16)]` where copy `i` is the record
//! with sequence number `seq - i`.

use crate::{
    errors::{ProtocolError, ProtocolResult},
    sequence::{
        is_control, is_reliable, is_unreliable, reliable_add, RELIABLE_WINDOW, PACKET_CONN,
        PACKET_DISC, PACKET_INIT, PACKET_NAK, PACKET_POKE,
    },
};
use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};

pub const HEADER_SIZE: usize = 8;
/// Largest datagram that is sent or accepted.
pub const MAX_DATAGRAM: usize = 1264;
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - HEADER_SIZE;

pub const META_TYPE_NONE: u8 = 0;
pub const META_TYPE_CLIENT_IDS: u8 = 1;
pub const META_CHUNK_SIZE: usize = 8;

pub const MAX_COPIES: u8 = 15;
pub const COPY_TRAILER_SIZE: usize = 2;

const VALUE_MASK: u32 = 0x00ff_ffff;
const META_SHIFT: u32 = 24;
const COPIES_SHIFT: u32 = 28;
const NIBBLE: u32 = 0xf;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Init,
    Conn,
    Disc,
    Nak,
    Poke,
    Unreliable(u32),
    Reliable(u32),
}

impl PacketKind {
    pub fn from_value(value: u32) -> ProtocolResult<Self> {
        let kind = match value {
            PACKET_INIT => PacketKind::Init,
            PACKET_CONN => PacketKind::Conn,
            PACKET_DISC => PacketKind::Disc,
            PACKET_NAK => PacketKind::Nak,
            PACKET_POKE => PacketKind::Poke,
            v if is_unreliable(v) => PacketKind::Unreliable(v),
            v if is_reliable(v) => PacketKind::Reliable(v),
            _ => return Err(ProtocolError::Malformed("invalid sequence value")),
        };
        Ok(kind)
    }

    pub fn value(&self) -> u32 {
        match *self {
            PacketKind::Init => PACKET_INIT,
            PacketKind::Conn => PACKET_CONN,
            PacketKind::Disc => PACKET_DISC,
            PacketKind::Nak => PACKET_NAK,
            PacketKind::Poke => PACKET_POKE,
            PacketKind::Unreliable(seq) | PacketKind::Reliable(seq) => seq,
        }
    }

    pub fn is_control(&self) -> bool {
        is_control(self.value())
    }
}

/// The first word of every packet, unpacked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SequenceField {
    pub kind: PacketKind,
    pub meta: u8,
    pub copies: u8,
}

impl SequenceField {
    pub fn new(kind: PacketKind) -> Self {
        Self {
            kind,
            meta: META_TYPE_NONE,
            copies: 0,
        }
    }

    pub fn with_meta(mut self, meta: u8) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_copies(mut self, copies: u8) -> Self {
        self.copies = copies;
        self
    }

    pub fn pack(&self) -> u32 {
        (self.kind.value() & VALUE_MASK)
            | ((u32::from(self.meta) & NIBBLE) << META_SHIFT)
            | ((u32::from(self.copies) & NIBBLE) << COPIES_SHIFT)
    }

    pub fn unpack(raw: u32) -> ProtocolResult<Self> {
        let kind = PacketKind::from_value(raw & VALUE_MASK)?;
        let meta = ((raw >> META_SHIFT) & NIBBLE) as u8;
        let copies = ((raw >> COPIES_SHIFT) & NIBBLE) as u8;
        if copies > 0 && !matches!(kind, PacketKind::Reliable(_)) {
            return Err(ProtocolError::Malformed("copies on a non-reliable packet"));
        }
        Ok(Self { kind, meta, copies })
    }
}

/// Local-only packet bookkeeping, never serialized.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PacketHead {
    /// Payload length after the metadata chunk, `None` if there is no payload.
    pub len: Option<usize>,
    /// Tick at which the packet was received.
    pub when: u32,
    /// Metadata type extracted from the sequence field.
    pub meta: u8,
}

/// The 8 byte metadata chunk of type 1: sender and intended receiver client identifiers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MetaChunk {
    pub source: u32,
    pub target: u32,
}

impl MetaChunk {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.source);
        buf.put_u32(self.target);
    }
}

/// Payload of the handshake and teardown control packets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ControlBody {
    pub conn_ident: u32,
    /// Only present in INIT and CONN.
    pub client_ident: Option<u32>,
}

impl ControlBody {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.conn_ident);
        if let Some(client_ident) = self.client_ident {
            buf.put_u32(client_ident);
        }
    }

    pub fn decode(mut payload: &[u8]) -> ProtocolResult<Self> {
        if payload.remaining() < 4 {
            return Err(ProtocolError::Malformed("control packet without identifier"));
        }
        let conn_ident = payload.get_u32();
        let client_ident = if payload.remaining() >= 4 {
            Some(payload.get_u32())
        } else {
            None
        };
        Ok(Self {
            conn_ident,
            client_ident,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet<'a> {
    pub head: PacketHead,
    pub seq: SequenceField,
    pub ack: u32,
    pub meta_chunk: Option<MetaChunk>,
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    pub fn decode(datagram: &'a [u8], when: u32) -> ProtocolResult<Packet<'a>> {
        if datagram.len() < HEADER_SIZE {
            return Err(ProtocolError::Malformed("shorter than the packet header"));
        }
        if datagram.len() > MAX_DATAGRAM {
            return Err(ProtocolError::Malformed("longer than the maximum datagram"));
        }

        let mut cursor = datagram;
        let seq = SequenceField::unpack(cursor.get_u32())?;
        let ack = cursor.get_u32();

        let meta_chunk = match seq.meta {
            META_TYPE_NONE => None,
            META_TYPE_CLIENT_IDS => {
                if cursor.remaining() < META_CHUNK_SIZE {
                    return Err(ProtocolError::Malformed("truncated metadata chunk"));
                }
                Some(MetaChunk {
                    source: cursor.get_u32(),
                    target: cursor.get_u32(),
                })
            }
            _ => return Err(ProtocolError::Malformed("unknown metadata type")),
        };

        let len = if cursor.is_empty() {
            None
        } else {
            Some(cursor.len())
        };

        Ok(Packet {
            head: PacketHead {
                len,
                when,
                meta: seq.meta,
            },
            seq,
            ack,
            meta_chunk,
            payload: cursor,
        })
    }

    /// An empty reliable packet without copies only carries the ack.
    pub fn is_ack_only(&self) -> bool {
        matches!(self.seq.kind, PacketKind::Reliable(_))
            && self.seq.copies == 0
            && self.head.len.is_none()
    }

    /// Splits a reliable payload into its records, oldest first, each with its sequence number.
    pub fn records(&self) -> ProtocolResult<Vec<(u32, &'a [u8])>> {
        let newest = match self.seq.kind {
            PacketKind::Reliable(seq) => seq,
            _ => return Err(ProtocolError::Malformed("records of a non-reliable packet")),
        };

        let copies = u32::from(self.seq.copies);
        let mut records = Vec::with_capacity(copies as usize + 1);
        let mut rest = self.payload;
        // trailers are read back to front, so the oldest copy comes out first
        for i in (1..=copies).rev() {
            if rest.len() < COPY_TRAILER_SIZE {
                return Err(ProtocolError::Malformed("truncated copy trailer"));
            }
            let split = rest.len() - COPY_TRAILER_SIZE;
            let len = BigEndian::read_u16(&rest[split..]) as usize;
            if len == 0 || len > split {
                return Err(ProtocolError::Malformed("invalid copy length"));
            }
            let data = &rest[split - len..split];
            rest = &rest[..split - len];
            records.push((reliable_add(newest, RELIABLE_WINDOW - i), data));
        }
        if rest.is_empty() {
            return Err(ProtocolError::Malformed("reliable packet without a record"));
        }
        records.push((newest, rest));
        Ok(records)
    }
}

pub fn encode_header(seq: SequenceField, ack: u32, buf: &mut BytesMut) {
    buf.put_u32(seq.pack());
    buf.put_u32(ack);
}

/// Appends a redundant copy of an earlier record followed by its length trailer.
pub fn encode_copy(record: &[u8], buf: &mut BytesMut) {
    buf.put_slice(record);
    let mut trailer = [0u8; COPY_TRAILER_SIZE];
    BigEndian::write_u16(&mut trailer, record.len() as u16);
    buf.put_slice(&trailer);
}

/// Encodes a complete packet with a single payload.
pub fn encode(
    seq: SequenceField,
    ack: u32,
    meta_chunk: Option<&MetaChunk>,
    payload: &[u8],
    buf: &mut BytesMut,
) {
    let seq = match meta_chunk {
        Some(_) => seq.with_meta(META_TYPE_CLIENT_IDS),
        None => seq,
    };
    encode_header(seq, ack, buf);
    if let Some(chunk) = meta_chunk {
        chunk.encode(buf);
    }
    buf.put_slice(payload);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sequence::{RELIABLE_BASE, UNRELIABLE_BASE};

    fn encoded(
        seq: SequenceField,
        ack: u32,
        meta_chunk: Option<&MetaChunk>,
        payload: &[u8],
    ) -> BytesMut {
        let mut buf = BytesMut::new();
        encode(seq, ack, meta_chunk, payload, &mut buf);
        buf
    }

    #[test]
    fn sequence_field_packs_nibbles_independently() {
        let field = SequenceField::new(PacketKind::Reliable(RELIABLE_BASE + 7))
            .with_meta(1)
            .with_copies(3);
        let raw = field.pack();
        assert_eq!(raw, 0x3100_0107);
        assert_eq!(SequenceField::unpack(raw).unwrap(), field);
    }

    #[test]
    fn rejects_invalid_sequence_values() {
        assert!(SequenceField::unpack(0).is_err());
        assert!(SequenceField::unpack(6).is_err());
        assert!(SequenceField::unpack(127).is_err());
        // copies only make sense on reliable packets
        assert!(SequenceField::unpack(0x1000_0000 | UNRELIABLE_BASE).is_err());
        assert!(SequenceField::unpack(0x1000_0000 | PACKET_NAK).is_err());
    }

    #[test]
    fn control_kinds_are_told_apart_from_data() {
        let nak = SequenceField::unpack(PACKET_NAK).unwrap().kind;
        assert_eq!(nak, PacketKind::Nak);
        assert!(nak.is_control());
        assert!(PacketKind::Poke.is_control());
        assert!(!PacketKind::Unreliable(UNRELIABLE_BASE).is_control());
        assert!(!PacketKind::Reliable(RELIABLE_BASE).is_control());
    }

    #[test]
    fn rejects_short_datagrams() {
        assert_eq!(
            Packet::decode(&[0, 0, 1, 0, 0, 0, 0], 0).unwrap_err(),
            ProtocolError::Malformed("")
        );
    }

    #[test]
    fn header_fields_survive_the_wire() {
        let seq = SequenceField::new(PacketKind::Unreliable(UNRELIABLE_BASE + 3));
        let buf = encoded(seq, RELIABLE_BASE + 99, None, b"ping");
        assert_eq!(&buf[..4], &[0, 0, 0, 131]);

        let packet = Packet::decode(&buf, 42).unwrap();
        assert_eq!(packet.seq, seq);
        assert_eq!(packet.ack, RELIABLE_BASE + 99);
        assert_eq!(packet.payload, b"ping");
        assert_eq!(packet.head.len, Some(4));
        assert_eq!(packet.head.when, 42);
        assert_eq!(packet.head.meta, 0);
    }

    #[test]
    fn metadata_chunk_is_stripped() {
        let chunk = MetaChunk {
            source: 0xaabb_ccdd,
            target: 7,
        };
        let seq = SequenceField::new(PacketKind::Reliable(RELIABLE_BASE));
        let buf = encoded(seq, RELIABLE_BASE, Some(&chunk), b"abc");
        assert_eq!(buf.len(), HEADER_SIZE + META_CHUNK_SIZE + 3);

        let packet = Packet::decode(&buf, 0).unwrap();
        assert_eq!(packet.head.meta, META_TYPE_CLIENT_IDS);
        assert_eq!(packet.meta_chunk, Some(chunk));
        assert_eq!(packet.payload, b"abc");

        // truncated chunk
        assert!(Packet::decode(&buf[..HEADER_SIZE + 4], 0).is_err());
    }

    #[test]
    fn unknown_metadata_type_is_rejected() {
        let seq = SequenceField::new(PacketKind::Reliable(RELIABLE_BASE)).with_meta(2);
        let buf = encoded(seq, RELIABLE_BASE, None, &[0; 16]);
        assert!(Packet::decode(&buf, 0).is_err());
    }

    #[test]
    fn ack_only_packets_have_no_payload() {
        let seq = SequenceField::new(PacketKind::Reliable(RELIABLE_BASE));
        let buf = encoded(seq, RELIABLE_BASE, None, &[]);
        let packet = Packet::decode(&buf, 0).unwrap();
        assert!(packet.head.len.is_none());
        assert!(packet.is_ack_only());
    }

    #[test]
    fn redundant_copies_are_split_oldest_first() {
        let newest = RELIABLE_BASE + 1;
        let mut buf = BytesMut::new();
        encode_header(
            SequenceField::new(PacketKind::Reliable(newest)).with_copies(2),
            0x00ff_ffff,
            &mut buf,
        );
        buf.put_slice(b"third");
        encode_copy(b"second", &mut buf);
        encode_copy(b"first", &mut buf);

        let packet = Packet::decode(&buf, 0).unwrap();
        let records = packet.records().unwrap();
        assert_eq!(
            records,
            vec![
                (RELIABLE_BASE + RELIABLE_WINDOW - 1, &b"first"[..]),
                (RELIABLE_BASE, &b"second"[..]),
                (newest, &b"third"[..]),
            ]
        );
    }

    #[test]
    fn corrupt_copy_trailer_is_rejected() {
        let mut buf = BytesMut::new();
        encode_header(
            SequenceField::new(PacketKind::Reliable(RELIABLE_BASE + 5)).with_copies(1),
            RELIABLE_BASE,
            &mut buf,
        );
        buf.put_slice(b"ab");
        buf.put_u16(200);
        let packet = Packet::decode(&buf, 0).unwrap();
        assert!(packet.records().is_err());
    }

    #[test]
    fn control_body_round_trip() {
        let body = ControlBody {
            conn_ident: 0xc662_7546,
            client_ident: Some(17),
        };
        let mut buf = BytesMut::new();
        body.encode(&mut buf);
        assert_eq!(ControlBody::decode(&buf).unwrap(), body);

        let disc = ControlBody {
            conn_ident: 3,
            client_ident: None,
        };
        let mut buf = BytesMut::new();
        disc.encode(&mut buf);
        assert_eq!(ControlBody::decode(&buf).unwrap(), disc);
        assert!(ControlBody::decode(&[1, 2]).is_err());
    }
}
