//! Knock protocol packets
//!
//! Every datagram starts with [`MAGIC`] and a one-byte type id:
//! - KNOCK: [magic:8][type:1][client_id:4][timestamp:4][nonce:4][sequence:1][max_sequence:1][tag:N]
//! - NONCE: [magic:8][type:1][session:16]
//! - ACK:   [magic:8][type:1][session:16][sequence:2]
//!
//! All integers are big-endian. Only knocks carry an authentication tag; the
//! tag itself is produced and checked in [`crate::auth`].

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ProtoError;

pub const MAGIC: [u8; 8] = *b"7SzCLCgc";

/// Magic plus type id.
pub const HEADER_LEN: usize = MAGIC.len() + 1;

pub const KNOCK_FIELDS_LEN: usize = 4 + 4 + 4 + 1 + 1;
pub const NONCE_FIELDS_LEN: usize = 16;
pub const ACK_FIELDS_LEN: usize = 16 + 2;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Knock = 0,
    Nonce = 1,
    Ack = 2,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Knock),
            1 => Ok(Self::Nonce),
            2 => Ok(Self::Ack),
            _ => Err(ProtoError::UnknownType(value)),
        }
    }
}

/// Four ASCII bytes naming a trusted client.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId([u8; 4]);

impl ClientId {
    pub fn new(bytes: [u8; 4]) -> Result<Self, ProtoError> {
        if bytes.is_ascii() {
            Ok(Self(bytes))
        } else {
            Err(ProtoError::InvalidClientId)
        }
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl FromStr for ClientId {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| ProtoError::InvalidClientId)?;
        Self::new(bytes)
    }
}

impl TryFrom<String> for ClientId {
    type Error = ProtoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ASCII checked on construction; decode keeps raw bytes, escape those
        for b in self.0 {
            write!(f, "{}", b.escape_ascii())?;
        }
        Ok(())
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self)
    }
}

/// 16-byte session identifier carried by nonce and ack packets.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub [u8; 16]);

impl SessionId {
    /// Wire encoding of "no session": high half `i64::MIN`, low half `i64::MAX`.
    const ABSENT_HIGH: u64 = 0x8000_0000_0000_0000;
    const ABSENT_LOW: u64 = 0x7FFF_FFFF_FFFF_FFFF;

    fn is_absent_pattern(high: u64, low: u64) -> bool {
        high == Self::ABSENT_HIGH && low == Self::ABSENT_LOW
    }

    fn put(id: Option<&SessionId>, buf: &mut BytesMut) {
        match id {
            Some(id) => buf.put_slice(&id.0),
            None => {
                buf.put_u64(Self::ABSENT_HIGH);
                buf.put_u64(Self::ABSENT_LOW);
            }
        }
    }

    fn get(buf: &mut &[u8]) -> Option<SessionId> {
        let high = buf.get_u64();
        let low = buf.get_u64();
        if Self::is_absent_pattern(high, low) {
            return None;
        }
        let mut id = [0u8; 16];
        id[..8].copy_from_slice(&high.to_be_bytes());
        id[8..].copy_from_slice(&low.to_be_bytes());
        Some(SessionId(id))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self)
    }
}

/// One knock of a sequence.
///
/// `sequence <= max_sequence` holds for every knock built with [`Knock::new`].
/// Decoded knocks are taken as-is; semantic checks belong to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Knock {
    client_id: ClientId,
    timestamp: u32,
    nonce: u32,
    sequence: u8,
    max_sequence: u8,
}

impl Knock {
    pub fn new(
        client_id: ClientId,
        nonce: u32,
        timestamp: u32,
        sequence: u8,
        max_sequence: u8,
    ) -> Result<Self, ProtoError> {
        if sequence > max_sequence {
            return Err(ProtoError::SequenceOutOfRange {
                sequence,
                max_sequence,
            });
        }
        Ok(Self {
            client_id,
            timestamp,
            nonce,
            sequence,
            max_sequence,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn max_sequence(&self) -> u8 {
        self.max_sequence
    }

    /// New nonce and transmission time for a resend.
    pub fn restamp(&mut self, nonce: u32, timestamp: u32) {
        self.nonce = nonce;
        self.timestamp = timestamp;
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_slice(self.client_id.as_bytes());
        buf.put_u32(self.timestamp);
        buf.put_u32(self.nonce);
        buf.put_u8(self.sequence);
        buf.put_u8(self.max_sequence);
    }

    fn get(buf: &mut &[u8]) -> Self {
        let mut id = [0u8; 4];
        buf.copy_to_slice(&mut id);
        Self {
            client_id: ClientId(id),
            timestamp: buf.get_u32(),
            nonce: buf.get_u32(),
            sequence: buf.get_u8(),
            max_sequence: buf.get_u8(),
        }
    }
}

/// Acknowledges one knock of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub session: SessionId,
    pub sequence: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    Knock(Knock),
    /// `None` is a request for a session id.
    Nonce(Option<SessionId>),
    Ack(Ack),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Knock(_) => PacketType::Knock,
            Packet::Nonce(_) => PacketType::Nonce,
            Packet::Ack(_) => PacketType::Ack,
        }
    }

    /// Length of the encoding, excluding any authentication tag.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + fields_len(self.packet_type())
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&MAGIC);
        buf.put_u8(self.packet_type() as u8);
        match self {
            Packet::Knock(knock) => knock.put(&mut buf),
            Packet::Nonce(id) => SessionId::put(id.as_ref(), &mut buf),
            Packet::Ack(ack) => {
                SessionId::put(Some(&ack.session), &mut buf);
                buf.put_u16(ack.sequence);
            }
        }
        buf
    }

    /// Decode the packet at the start of `data`.
    ///
    /// Bytes past the variant's fields are left for the caller (the tag of
    /// an authenticated knock).
    pub fn decode(data: &[u8]) -> Result<Self, ProtoError> {
        let mut buf = data;
        if buf.remaining() < HEADER_LEN {
            return Err(ProtoError::InsufficientData {
                need: HEADER_LEN,
                have: data.len(),
            });
        }
        if buf[..MAGIC.len()] != MAGIC {
            return Err(ProtoError::BadMagic);
        }
        buf.advance(MAGIC.len());
        let packet_type = PacketType::try_from(buf.get_u8())?;

        let need = fields_len(packet_type);
        if buf.remaining() < need {
            return Err(ProtoError::InsufficientData {
                need: HEADER_LEN + need,
                have: data.len(),
            });
        }

        let packet = match packet_type {
            PacketType::Knock => Packet::Knock(Knock::get(&mut buf)),
            PacketType::Nonce => Packet::Nonce(SessionId::get(&mut buf)),
            PacketType::Ack => {
                // Acks always name a session; the absent pattern decodes as raw bytes
                let mut session = [0u8; 16];
                buf.copy_to_slice(&mut session);
                Packet::Ack(Ack {
                    session: SessionId(session),
                    sequence: buf.get_u16(),
                })
            }
        };
        Ok(packet)
    }
}

fn fields_len(packet_type: PacketType) -> usize {
    match packet_type {
        PacketType::Knock => KNOCK_FIELDS_LEN,
        PacketType::Nonce => NONCE_FIELDS_LEN,
        PacketType::Ack => ACK_FIELDS_LEN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ClientId {
        s.parse().unwrap()
    }

    #[test]
    fn knock_roundtrip() {
        let knock = Knock::new(id("com1"), 0x00AB_CDEF, 1_700_000_000, 2, 4).unwrap();
        let encoded = Packet::Knock(knock).encode();
        assert_eq!(encoded.len(), HEADER_LEN + KNOCK_FIELDS_LEN);
        assert_eq!(&encoded[..8], b"7SzCLCgc");
        assert_eq!(encoded[8], 0);
        assert_eq!(&encoded[9..13], b"com1");

        match Packet::decode(&encoded).unwrap() {
            Packet::Knock(k) => assert_eq!(k, knock),
            other => panic!("wrong packet: {:?}", other),
        }
    }

    #[test]
    fn nonce_absent_uses_sentinel() {
        let encoded = Packet::Nonce(None).encode();
        assert_eq!(&encoded[9..17], &0x8000_0000_0000_0000u64.to_be_bytes());
        assert_eq!(&encoded[17..25], &0x7FFF_FFFF_FFFF_FFFFu64.to_be_bytes());
        assert_eq!(Packet::decode(&encoded).unwrap(), Packet::Nonce(None));

        let present = Packet::Nonce(Some(SessionId([7u8; 16])));
        assert_eq!(Packet::decode(&present.encode()).unwrap(), present);
    }

    #[test]
    fn ack_roundtrip() {
        let ack = Packet::Ack(Ack {
            session: SessionId(*b"0123456789abcdef"),
            sequence: 0x0102,
        });
        let encoded = ack.encode();
        assert_eq!(encoded.len(), HEADER_LEN + ACK_FIELDS_LEN);
        assert_eq!(Packet::decode(&encoded).unwrap(), ack);
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let knock = Knock::new(id("abcd"), 1, 2, 0, 0).unwrap();
        let mut encoded = Packet::Knock(knock).encode().to_vec();
        encoded.extend_from_slice(&[0xFF; 32]);
        assert_eq!(Packet::decode(&encoded).unwrap(), Packet::Knock(knock));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut encoded = Packet::Nonce(None).encode().to_vec();
        encoded[0] ^= 0x01;
        assert_eq!(Packet::decode(&encoded), Err(ProtoError::BadMagic));
    }

    #[test]
    fn rejects_unknown_type() {
        let mut encoded = Packet::Nonce(None).encode().to_vec();
        encoded[8] = 9;
        assert_eq!(Packet::decode(&encoded), Err(ProtoError::UnknownType(9)));
    }

    #[test]
    fn truncated_buffers_are_insufficient() {
        let knock = Knock::new(id("abcd"), 1, 2, 0, 1).unwrap();
        let encoded = Packet::Knock(knock).encode();
        for len in 0..encoded.len() {
            assert!(
                matches!(
                    Packet::decode(&encoded[..len]),
                    Err(ProtoError::InsufficientData { .. })
                ),
                "len {} decoded",
                len
            );
        }
    }

    #[test]
    fn knock_constructor_validates_sequence() {
        assert_eq!(
            Knock::new(id("abcd"), 0, 0, 3, 2),
            Err(ProtoError::SequenceOutOfRange {
                sequence: 3,
                max_sequence: 2
            })
        );
        assert!(Knock::new(id("abcd"), 0, 0, 2, 2).is_ok());
    }

    #[test]
    fn decode_keeps_out_of_range_sequence() {
        let knock = Knock::new(id("abcd"), 0, 0, 1, 1).unwrap();
        let mut encoded = Packet::Knock(knock).encode().to_vec();
        // sequence byte past client id, timestamp and nonce
        encoded[HEADER_LEN + 12] = 9;
        match Packet::decode(&encoded).unwrap() {
            Packet::Knock(k) => {
                assert_eq!(k.sequence(), 9);
                assert_eq!(k.max_sequence(), 1);
            }
            other => panic!("wrong packet: {:?}", other),
        }
    }

    #[test]
    fn client_id_must_be_four_ascii_bytes() {
        assert!("abc".parse::<ClientId>().is_err());
        assert!("abcde".parse::<ClientId>().is_err());
        assert!("ab\u{e9}".parse::<ClientId>().is_err());
        assert_eq!(id("com1").to_string(), "com1");
    }
}
