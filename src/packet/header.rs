//! Long/short header codec (RFC 9000 §17).
//!
//! Callers are expected to have already removed header protection (see
//! `crate::crypto::HeaderKey`) before calling [`Header::decode`]: the header-form bit, the
//! packet-number-length bits, and the packet-number bytes themselves are read here as plain
//! bytes, not as a protected mask. `Header::encode` is the mirror image, run before applying
//! protection on the way out.

use crate::primitives::bits::BitField;
use crate::primitives::varint::VarInt;
use crate::result::{require, DecodeResult};

use super::types::{ConnectionId, FourBits, HeaderForm, LongPacketType, SingleBit, MAX_CID_LEN};

/// Width (in bytes) of the truncated packet-number field, 1..=4.
pub type PacketNumberLen = u8;

#[derive(PartialEq, Debug, Clone)]
pub enum Header {
    Initial {
        version: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Vec<u8>,
        /// Length, in bytes, of packet number + payload that follows (RFC 9000 §17.2);
        /// lets the dispatcher split coalesced packets out of one UDP datagram.
        length: u64,
        packet_number: Vec<u8>,
    },
    ZeroRtt {
        version: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        length: u64,
        packet_number: Vec<u8>,
    },
    Handshake {
        version: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        length: u64,
        packet_number: Vec<u8>,
    },
    Retry {
        version: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        retry_token: Vec<u8>,
    },
    VersionNegotiate {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        supported_versions: Vec<u32>,
    },
    Short {
        dst_cid: ConnectionId,
        spin_bit: bool,
        key_phase: bool,
        packet_number: Vec<u8>,
    },
}

impl Header {
    pub fn is_long(&self) -> bool {
        !matches!(self, Header::Short { .. })
    }

    /// Packets of these kinds carry no frames (RFC 9000 §17.2.5, §17.2.1).
    pub fn contains_frames(&self) -> bool {
        !matches!(self, Header::Retry { .. } | Header::VersionNegotiate { .. })
    }

    /// For long headers carrying a length field, the number of payload bytes that follow
    /// the packet number (used to split coalesced packets out of one datagram).
    pub fn payload_len(&self) -> Option<usize> {
        match self {
            Header::Initial { length, packet_number, .. }
            | Header::ZeroRtt { length, packet_number, .. }
            | Header::Handshake { length, packet_number, .. } => {
                Some(*length as usize - packet_number.len())
            }
            _ => None,
        }
    }

    pub fn dst_cid(&self) -> &ConnectionId {
        match self {
            Header::Initial { dst_cid, .. }
            | Header::ZeroRtt { dst_cid, .. }
            | Header::Handshake { dst_cid, .. }
            | Header::Retry { dst_cid, .. }
            | Header::VersionNegotiate { dst_cid, .. }
            | Header::Short { dst_cid, .. } => dst_cid,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Header::Initial {
                version,
                dst_cid,
                src_cid,
                token,
                length,
                packet_number,
            } => {
                encode_long_first_byte(
                    &mut buf,
                    LongPacketType::initial(),
                    reserved_and_pn_len(packet_number.len() as u8),
                );
                buf.extend(version.to_be_bytes());
                encode_cid(&mut buf, dst_cid);
                encode_cid(&mut buf, src_cid);
                VarInt::from_u64(token.len() as u64).unwrap().encode(&mut buf);
                buf.extend(token);
                VarInt::from_u64(*length).unwrap().encode(&mut buf);
                buf.extend(packet_number);
            }
            Header::ZeroRtt {
                version,
                dst_cid,
                src_cid,
                length,
                packet_number,
            } => {
                encode_long_first_byte(
                    &mut buf,
                    LongPacketType::zero_rtt(),
                    reserved_and_pn_len(packet_number.len() as u8),
                );
                buf.extend(version.to_be_bytes());
                encode_cid(&mut buf, dst_cid);
                encode_cid(&mut buf, src_cid);
                VarInt::from_u64(*length).unwrap().encode(&mut buf);
                buf.extend(packet_number);
            }
            Header::Handshake {
                version,
                dst_cid,
                src_cid,
                length,
                packet_number,
            } => {
                encode_long_first_byte(
                    &mut buf,
                    LongPacketType::handshake(),
                    reserved_and_pn_len(packet_number.len() as u8),
                );
                buf.extend(version.to_be_bytes());
                encode_cid(&mut buf, dst_cid);
                encode_cid(&mut buf, src_cid);
                VarInt::from_u64(*length).unwrap().encode(&mut buf);
                buf.extend(packet_number);
            }
            Header::Retry {
                version,
                dst_cid,
                src_cid,
                retry_token,
            } => {
                encode_long_first_byte(&mut buf, LongPacketType::retry(), FourBits::zero());
                buf.extend(version.to_be_bytes());
                encode_cid(&mut buf, dst_cid);
                encode_cid(&mut buf, src_cid);
                buf.extend(retry_token);
            }
            Header::VersionNegotiate {
                dst_cid,
                src_cid,
                supported_versions,
            } => {
                buf.push(0x80);
                buf.extend(0u32.to_be_bytes());
                encode_cid(&mut buf, dst_cid);
                encode_cid(&mut buf, src_cid);
                for v in supported_versions {
                    buf.extend(v.to_be_bytes());
                }
            }
            Header::Short {
                dst_cid,
                spin_bit,
                key_phase,
                packet_number,
            } => {
                let mut first = 0u8;
                first |= HeaderForm::short().value();
                first |= SingleBit::one().value() << 1;
                first |= (*spin_bit as u8) << 5;
                first |= (*key_phase as u8) << 2;
                first |= (packet_number.len() as u8 - 1) & 0b11;
                buf.push(first);
                buf.extend(dst_cid.as_slice());
                buf.extend(packet_number);
            }
        }
        buf
    }

    /// Decodes one header from the front of `bytes`, leaving the payload (or, for Retry /
    /// VersionNegotiate, nothing) in the slice.
    pub fn decode(bytes: &mut &[u8], dcid_len_for_short: usize) -> DecodeResult<Self> {
        require(!bytes.is_empty(), "packet shorter than minimum header")?;
        let first = bytes[0];
        let is_long = first & 0x80 != 0;
        if !is_long {
            return Self::decode_short(bytes, dcid_len_for_short);
        }
        Self::decode_long(bytes)
    }

    fn decode_long(bytes: &mut &[u8]) -> DecodeResult<Self> {
        let first = bytes[0];
        let long_type = LongPacketType::from_value((first >> 4) & 0b11);
        let type_specific = FourBits::from_value(first & 0b1111);
        *bytes = &bytes[1..];

        require(bytes.len() >= 4, "long header: truncated version")?;
        let version = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        *bytes = &bytes[4..];

        let dst_cid = decode_cid(bytes)?;
        let src_cid = decode_cid(bytes)?;

        if version == 0 {
            let mut supported_versions = Vec::new();
            while bytes.len() >= 4 {
                supported_versions.push(u32::from_be_bytes(bytes[0..4].try_into().unwrap()));
                *bytes = &bytes[4..];
            }
            return Ok(Header::VersionNegotiate {
                dst_cid,
                src_cid,
                supported_versions,
            });
        }

        if long_type == LongPacketType::retry() {
            let retry_token = bytes.to_vec();
            *bytes = &bytes[bytes.len()..];
            return Ok(Header::Retry {
                version,
                dst_cid,
                src_cid,
                retry_token,
            });
        }

        let token = if long_type == LongPacketType::initial() {
            let len = VarInt::decode(bytes)?.into_usize();
            require(bytes.len() >= len, "long header: truncated token")?;
            let token = bytes[..len].to_vec();
            *bytes = &bytes[len..];
            Some(token)
        } else {
            None
        };

        let length = VarInt::decode(bytes)?.into_inner();
        require(bytes.len() as u64 >= length, "long header: length exceeds remaining datagram")?;

        let pn_len = (type_specific.value() >> 2) + 1;
        require(length >= pn_len as u64, "long header: length shorter than packet number")?;
        require(bytes.len() >= pn_len as usize, "long header: truncated packet number")?;
        let packet_number = bytes[..pn_len as usize].to_vec();
        *bytes = &bytes[pn_len as usize..];

        Ok(match long_type.value() {
            v if v == LongPacketType::initial().value() => Header::Initial {
                version,
                dst_cid,
                src_cid,
                token: token.unwrap_or_default(),
                length,
                packet_number,
            },
            v if v == LongPacketType::zero_rtt().value() => Header::ZeroRtt {
                version,
                dst_cid,
                src_cid,
                length,
                packet_number,
            },
            _ => Header::Handshake {
                version,
                dst_cid,
                src_cid,
                length,
                packet_number,
            },
        })
    }

    fn decode_short(bytes: &mut &[u8], dcid_len: usize) -> DecodeResult<Self> {
        let first = bytes[0];
        let spin_bit = (first >> 5) & 1 == 1;
        let key_phase = (first >> 2) & 1 == 1;
        let pn_len = (first & 0b11) + 1;
        *bytes = &bytes[1..];

        require(bytes.len() >= dcid_len, "short header: truncated dcid")?;
        let dst_cid = ConnectionId::from_slice(&bytes[..dcid_len]);
        *bytes = &bytes[dcid_len..];

        require(bytes.len() >= pn_len as usize, "short header: truncated packet number")?;
        let packet_number = bytes[..pn_len as usize].to_vec();
        *bytes = &bytes[pn_len as usize..];

        Ok(Header::Short {
            dst_cid,
            spin_bit,
            key_phase,
            packet_number,
        })
    }
}

fn reserved_and_pn_len(pn_len: u8) -> FourBits {
    FourBits::from_value((pn_len - 1) << 2)
}

fn encode_long_first_byte(buf: &mut Vec<u8>, long_type: LongPacketType, type_specific: FourBits) {
    // Wire layout is MSB-first here (RFC 9000 Figure 13): header-form at 0x80, fixed bit at
    // 0x40, long packet type at bits 5-4, type-specific bits at 3-0.
    let mut first = 0x80 | (SingleBit::one().value() << 6);
    first |= long_type.value() << 4;
    first |= type_specific.value();
    debug_assert!(HeaderForm::long().value() == 1);
    buf.push(first);
}

fn encode_cid(buf: &mut Vec<u8>, cid: &ConnectionId) {
    buf.push(cid.len() as u8);
    buf.extend(cid.as_slice());
}

fn decode_cid(bytes: &mut &[u8]) -> DecodeResult<ConnectionId> {
    require(!bytes.is_empty(), "truncated connection id length")?;
    let len = bytes[0] as usize;
    *bytes = &bytes[1..];
    require(len <= MAX_CID_LEN, "connection id length exceeds maximum")?;
    require(bytes.len() >= len, "truncated connection id")?;
    let cid = ConnectionId::from_slice(&bytes[..len]);
    *bytes = &bytes[len..];
    Ok(cid)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn initial_header_round_trips() {
        let header = Header::Initial {
            version: 1,
            dst_cid: ConnectionId::from_slice(&[1; 8]),
            src_cid: ConnectionId::from_slice(&[2; 8]),
            token: vec![9, 9, 9],
            length: 2,
            packet_number: vec![0, 1],
        };
        let encoded = header.encode();
        let mut slice = encoded.as_slice();
        let decoded = Header::decode(&mut slice, 0).unwrap();
        assert_eq!(header, decoded);
        assert!(slice.is_empty());
        assert_eq!(header.payload_len(), Some(0));
    }

    #[test]
    fn handshake_header_round_trips() {
        let header = Header::Handshake {
            version: 1,
            dst_cid: ConnectionId::from_slice(&[3; 4]),
            src_cid: ConnectionId::from_slice(&[4; 4]),
            length: 4,
            packet_number: vec![0, 0, 0, 7],
        };
        let encoded = header.encode();
        let mut slice = encoded.as_slice();
        let decoded = Header::decode(&mut slice, 0).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn retry_header_round_trips() {
        let header = Header::Retry {
            version: 1,
            dst_cid: ConnectionId::from_slice(&[5; 8]),
            src_cid: ConnectionId::from_slice(&[6; 8]),
            retry_token: b"opaque-retry-token".to_vec(),
        };
        let encoded = header.encode();
        let mut slice = encoded.as_slice();
        let decoded = Header::decode(&mut slice, 0).unwrap();
        assert_eq!(header, decoded);
        assert!(!header.contains_frames());
    }

    #[test]
    fn short_header_round_trips() {
        let header = Header::Short {
            dst_cid: ConnectionId::from_slice(&[7; 8]),
            spin_bit: false,
            key_phase: true,
            packet_number: vec![0, 42],
        };
        let encoded = header.encode();
        let mut slice = encoded.as_slice();
        let decoded = Header::decode(&mut slice, 8).unwrap();
        assert_eq!(header, decoded);
        assert!(!decoded.is_long());
    }

    #[test]
    fn version_negotiate_round_trips() {
        let header = Header::VersionNegotiate {
            dst_cid: ConnectionId::from_slice(&[1; 8]),
            src_cid: ConnectionId::from_slice(&[2; 8]),
            supported_versions: vec![1, 0xff00_001d],
        };
        let encoded = header.encode();
        let mut slice = encoded.as_slice();
        let decoded = Header::decode(&mut slice, 0).unwrap();
        assert_eq!(header, decoded);
    }
}
