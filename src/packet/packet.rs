//! A decoded packet: header plus the (still-protected) payload bytes that follow it.
//!
//! Packet protection and header protection are applied by the `crypto` trait boundary, not
//! here; this module only knows how to find where one packet ends and the next coalesced
//! one (if any) begins.

use crate::packet::header::Header;
use crate::result::{require, DecodeResult};

/// Packets below this size are not valid QUIC and are dropped outright (RFC 9000 §14.1).
pub const MIN_PACKET_LEN: usize = 21;

#[derive(PartialEq, Debug, Clone)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(header: Header, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoded = self.header.encode();
        encoded.extend(&self.payload);
        encoded
    }

    /// Decodes one packet from the front of `datagram`, returning it along with whatever
    /// bytes remain (a non-empty remainder means the datagram coalesces further packets).
    pub fn decode<'a>(
        datagram: &'a [u8],
        dcid_len_for_short: usize,
    ) -> DecodeResult<(Self, &'a [u8])> {
        require(datagram.len() >= MIN_PACKET_LEN, "packet shorter than minimum valid length")?;

        let mut cursor = datagram;
        let header = Header::decode(&mut cursor, dcid_len_for_short)?;

        let (payload, rest) = match header.payload_len() {
            Some(len) => {
                require(cursor.len() >= len, "coalesced packet: truncated payload")?;
                cursor.split_at(len)
            }
            None => (cursor, &cursor[cursor.len()..]),
        };

        Ok((
            Self {
                header,
                payload: payload.to_vec(),
            },
            rest,
        ))
    }

    /// Splits a UDP datagram into each coalesced QUIC packet it carries (RFC 9000 §12.2).
    pub fn decode_coalesced(mut datagram: &[u8], dcid_len_for_short: usize) -> DecodeResult<Vec<Self>> {
        let mut packets = Vec::new();
        while !datagram.is_empty() {
            let (packet, rest) = Self::decode(datagram, dcid_len_for_short)?;
            packets.push(packet);
            datagram = rest;
        }
        Ok(packets)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::header::Header;
    use crate::packet::types::ConnectionId;

    fn initial(dst: u8, payload: Vec<u8>) -> Packet {
        Packet::new(
            Header::Initial {
                version: 1,
                dst_cid: ConnectionId::from_slice(&[dst; 8]),
                src_cid: ConnectionId::from_slice(&[0xaa; 8]),
                token: vec![],
                length: payload.len() as u64 + 2,
                packet_number: vec![0, 1],
            },
            payload,
        )
    }

    #[test]
    fn single_packet_round_trips() {
        let packet = initial(1, vec![0u8; 20]);
        let encoded = packet.encode();
        let (decoded, rest) = Packet::decode(&encoded, 0).unwrap();
        assert_eq!(packet, decoded);
        assert!(rest.is_empty());
    }

    #[test]
    fn coalesced_datagram_splits_into_two_packets() {
        let first = initial(1, vec![1u8; 30]);
        let second = initial(2, vec![2u8; 30]);
        let mut datagram = first.encode();
        datagram.extend(second.encode());

        let packets = Packet::decode_coalesced(&datagram, 0).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], first);
        assert_eq!(packets[1], second);
    }

    #[test]
    fn undersized_datagram_is_rejected() {
        let tiny = vec![0x80u8; 10];
        assert!(Packet::decode(&tiny, 0).is_err());
    }
}
