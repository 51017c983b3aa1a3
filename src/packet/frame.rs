//! Frame codec: encode/decode for every QUIC frame kind (RFC 9000 §19).
//!
//! STREAM, MAX_STREAMS, STREAMS_BLOCKED, and CONNECTION_CLOSE each cover a small family of
//! wire type codes distinguished by low bits or a transport/application split; those are
//! folded into a single `Frame` variant carrying the distinguishing field rather than kept
//! as separate enum cases, since the semantics (not the tag) are what callers act on.

use crate::frame_types;
use crate::packet::types::ConnectionId;
use crate::primitives::varint::VarInt;
use crate::result::{require, DecodeResult, TransportError};

frame_types! {
    PADDING = 0x00,
    PING = 0x01,
    ACK = 0x02,
    ACK_ECN = 0x03,
    RESET_STREAM = 0x04,
    STOP_SENDING = 0x05,
    CRYPTO = 0x06,
    NEW_TOKEN = 0x07,
    MAX_DATA = 0x10,
    MAX_STREAM_DATA = 0x11,
    MAX_STREAMS_BIDI = 0x12,
    MAX_STREAMS_UNI = 0x13,
    DATA_BLOCKED = 0x14,
    STREAM_DATA_BLOCKED = 0x15,
    STREAMS_BLOCKED_BIDI = 0x16,
    STREAMS_BLOCKED_UNI = 0x17,
    NEW_CONNECTION_ID = 0x18,
    RETIRE_CONNECTION_ID = 0x19,
    PATH_CHALLENGE = 0x1a,
    PATH_RESPONSE = 0x1b,
    CONNECTION_CLOSE_TRANSPORT = 0x1c,
    CONNECTION_CLOSE_APPLICATION = 0x1d,
    HANDSHAKE_DONE = 0x1e,
}

/// Base tag for the eight STREAM frame variants (0x08..=0x0f); OFF/LEN/FIN live in the
/// low three bits.
const STREAM_TAG_BASE: u64 = 0x08;
const STREAM_OFF_BIT: u64 = 0x04;
const STREAM_LEN_BIT: u64 = 0x02;
const STREAM_FIN_BIT: u64 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Bidi,
    Uni,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRange {
    pub gap: u64,
    pub ack_range_len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ecn_ce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding,
    Ping,
    Ack {
        largest: u64,
        delay: u64,
        first_range: u64,
        ranges: Vec<AckRange>,
        ecn: Option<EcnCounts>,
    },
    ResetStream {
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    },
    StopSending {
        stream_id: u64,
        error_code: u64,
    },
    Crypto {
        offset: u64,
        data: Vec<u8>,
    },
    NewToken {
        token: Vec<u8>,
    },
    Stream {
        stream_id: u64,
        offset: u64,
        fin: bool,
        data: Vec<u8>,
    },
    MaxData {
        max: u64,
    },
    MaxStreamData {
        stream_id: u64,
        max: u64,
    },
    MaxStreams {
        dir: Direction,
        max: u64,
    },
    DataBlocked {
        limit: u64,
    },
    StreamDataBlocked {
        stream_id: u64,
        limit: u64,
    },
    StreamsBlocked {
        dir: Direction,
        limit: u64,
    },
    NewConnectionId {
        seq: u64,
        retire_prior_to: u64,
        cid: ConnectionId,
        reset_token: [u8; 16],
    },
    RetireConnectionId {
        seq: u64,
    },
    PathChallenge {
        data: [u8; 8],
    },
    PathResponse {
        data: [u8; 8],
    },
    ConnectionClose {
        error_code: u64,
        frame_type: Option<u64>,
        is_app: bool,
        reason: Vec<u8>,
    },
    HandshakeDone,
}

/// How a lost frame is handled on retransmission. The connection engine
/// dispatches on this rather than replaying the original `Frame` value, since most kinds
/// need to be rebuilt from whatever the current state is by the time loss is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmitPolicy {
    /// Re-queue the exact same frame value.
    Requeue,
    /// Re-queue unless the stream's write side already errored (RESET_STREAM sent).
    RequeueUnlessStreamErrored,
    /// Rebuild with current connection/stream state rather than replaying.
    Regenerate,
    /// Rebuild with current stream state, or drop if the stream no longer exists.
    RegenerateOrDropIfStreamGone,
    /// Drop; the space's `send_ack` counter is bumped to threshold so a fresh ACK goes out.
    DropAndForceFreshAck,
    /// Drop outright; never retransmitted.
    Drop,
}

fn read_varint(bytes: &mut &[u8]) -> DecodeResult<u64> {
    Ok(VarInt::decode(bytes)?.into_inner())
}

fn read_bytes<'a>(bytes: &mut &'a [u8], len: usize) -> DecodeResult<&'a [u8]> {
    require(bytes.len() >= len, "frame: buffer exhausted")?;
    let (head, tail) = bytes.split_at(len);
    *bytes = tail;
    Ok(head)
}

fn read_array<const N: usize>(bytes: &mut &[u8]) -> DecodeResult<[u8; N]> {
    let slice = read_bytes(bytes, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    Ok(out)
}

fn write_varint(buf: &mut Vec<u8>, value: u64) {
    VarInt::from_u64(value)
        .expect("frame field exceeds varint range")
        .encode(buf);
}

impl Frame {
    /// The wire type tag this frame would be encoded with.
    pub fn wire_type(&self) -> u64 {
        match self {
            Frame::Padding => FrameTypeTag::PADDING.wire_value(),
            Frame::Ping => FrameTypeTag::PING.wire_value(),
            Frame::Ack { ecn: None, .. } => FrameTypeTag::ACK.wire_value(),
            Frame::Ack { ecn: Some(_), .. } => FrameTypeTag::ACK_ECN.wire_value(),
            Frame::ResetStream { .. } => FrameTypeTag::RESET_STREAM.wire_value(),
            Frame::StopSending { .. } => FrameTypeTag::STOP_SENDING.wire_value(),
            Frame::Crypto { .. } => FrameTypeTag::CRYPTO.wire_value(),
            Frame::NewToken { .. } => FrameTypeTag::NEW_TOKEN.wire_value(),
            Frame::Stream { offset, fin, .. } => {
                let mut tag = STREAM_TAG_BASE | STREAM_LEN_BIT;
                if *offset != 0 {
                    tag |= STREAM_OFF_BIT;
                }
                if *fin {
                    tag |= STREAM_FIN_BIT;
                }
                tag
            }
            Frame::MaxData { .. } => FrameTypeTag::MAX_DATA.wire_value(),
            Frame::MaxStreamData { .. } => FrameTypeTag::MAX_STREAM_DATA.wire_value(),
            Frame::MaxStreams { dir: Direction::Bidi, .. } => FrameTypeTag::MAX_STREAMS_BIDI.wire_value(),
            Frame::MaxStreams { dir: Direction::Uni, .. } => FrameTypeTag::MAX_STREAMS_UNI.wire_value(),
            Frame::DataBlocked { .. } => FrameTypeTag::DATA_BLOCKED.wire_value(),
            Frame::StreamDataBlocked { .. } => FrameTypeTag::STREAM_DATA_BLOCKED.wire_value(),
            Frame::StreamsBlocked { dir: Direction::Bidi, .. } => FrameTypeTag::STREAMS_BLOCKED_BIDI.wire_value(),
            Frame::StreamsBlocked { dir: Direction::Uni, .. } => FrameTypeTag::STREAMS_BLOCKED_UNI.wire_value(),
            Frame::NewConnectionId { .. } => FrameTypeTag::NEW_CONNECTION_ID.wire_value(),
            Frame::RetireConnectionId { .. } => FrameTypeTag::RETIRE_CONNECTION_ID.wire_value(),
            Frame::PathChallenge { .. } => FrameTypeTag::PATH_CHALLENGE.wire_value(),
            Frame::PathResponse { .. } => FrameTypeTag::PATH_RESPONSE.wire_value(),
            Frame::ConnectionClose { is_app: false, .. } => FrameTypeTag::CONNECTION_CLOSE_TRANSPORT.wire_value(),
            Frame::ConnectionClose { is_app: true, .. } => FrameTypeTag::CONNECTION_CLOSE_APPLICATION.wire_value(),
            Frame::HandshakeDone => FrameTypeTag::HANDSHAKE_DONE.wire_value(),
        }
    }

    /// Whether receiving this frame elicits an ACK (RFC 9000 §13.2).
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding | Frame::Ack { .. } | Frame::ConnectionClose { .. }
        )
    }

    /// What happens to this frame when the packet that carried it is declared lost
    ///. Frames are always regenerated from current state rather than
    /// replayed byte-for-byte, except CRYPTO (same bytes, same offsets) and the handful of
    /// frame kinds that are simply requeued unchanged.
    pub fn retransmit_policy(&self) -> RetransmitPolicy {
        match self {
            Frame::Stream { .. } => RetransmitPolicy::RequeueUnlessStreamErrored,
            Frame::Crypto { .. } => RetransmitPolicy::Requeue,
            Frame::MaxData { .. } => RetransmitPolicy::Regenerate,
            Frame::MaxStreams { .. } => RetransmitPolicy::Regenerate,
            Frame::MaxStreamData { .. } => RetransmitPolicy::RegenerateOrDropIfStreamGone,
            Frame::Ack { .. } => RetransmitPolicy::DropAndForceFreshAck,
            Frame::Ping | Frame::PathResponse { .. } | Frame::ConnectionClose { .. } => {
                RetransmitPolicy::Drop
            }
            Frame::RetireConnectionId { .. }
            | Frame::StopSending { .. }
            | Frame::NewConnectionId { .. }
            | Frame::ResetStream { .. }
            | Frame::HandshakeDone
            | Frame::NewToken { .. } => RetransmitPolicy::Requeue,
            Frame::Padding
            | Frame::DataBlocked { .. }
            | Frame::StreamDataBlocked { .. }
            | Frame::StreamsBlocked { .. }
            | Frame::PathChallenge { .. } => RetransmitPolicy::Requeue,
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_varint(buf, self.wire_type());
        match self {
            Frame::Padding | Frame::Ping | Frame::HandshakeDone => {}
            Frame::Ack {
                largest,
                delay,
                first_range,
                ranges,
                ecn,
            } => {
                write_varint(buf, *largest);
                write_varint(buf, *delay);
                write_varint(buf, ranges.len() as u64);
                write_varint(buf, *first_range);
                for range in ranges {
                    write_varint(buf, range.gap);
                    write_varint(buf, range.ack_range_len);
                }
                if let Some(ecn) = ecn {
                    write_varint(buf, ecn.ect0);
                    write_varint(buf, ecn.ect1);
                    write_varint(buf, ecn.ecn_ce);
                }
            }
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                write_varint(buf, *stream_id);
                write_varint(buf, *error_code);
                write_varint(buf, *final_size);
            }
            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                write_varint(buf, *stream_id);
                write_varint(buf, *error_code);
            }
            Frame::Crypto { offset, data } => {
                write_varint(buf, *offset);
                write_varint(buf, data.len() as u64);
                buf.extend_from_slice(data);
            }
            Frame::NewToken { token } => {
                write_varint(buf, token.len() as u64);
                buf.extend_from_slice(token);
            }
            Frame::Stream {
                stream_id,
                offset,
                data,
                ..
            } => {
                write_varint(buf, *stream_id);
                if *offset != 0 {
                    write_varint(buf, *offset);
                }
                write_varint(buf, data.len() as u64);
                buf.extend_from_slice(data);
            }
            Frame::MaxData { max } => write_varint(buf, *max),
            Frame::MaxStreamData { stream_id, max } => {
                write_varint(buf, *stream_id);
                write_varint(buf, *max);
            }
            Frame::MaxStreams { max, .. } => write_varint(buf, *max),
            Frame::DataBlocked { limit } => write_varint(buf, *limit),
            Frame::StreamDataBlocked { stream_id, limit } => {
                write_varint(buf, *stream_id);
                write_varint(buf, *limit);
            }
            Frame::StreamsBlocked { limit, .. } => write_varint(buf, *limit),
            Frame::NewConnectionId {
                seq,
                retire_prior_to,
                cid,
                reset_token,
            } => {
                write_varint(buf, *seq);
                write_varint(buf, *retire_prior_to);
                buf.push(cid.len() as u8);
                buf.extend_from_slice(cid.as_slice());
                buf.extend_from_slice(reset_token);
            }
            Frame::RetireConnectionId { seq } => write_varint(buf, *seq),
            Frame::PathChallenge { data } | Frame::PathResponse { data } => {
                buf.extend_from_slice(data);
            }
            Frame::ConnectionClose {
                error_code,
                frame_type,
                is_app,
                reason,
            } => {
                write_varint(buf, *error_code);
                if !is_app {
                    write_varint(buf, frame_type.unwrap_or(0));
                }
                write_varint(buf, reason.len() as u64);
                buf.extend_from_slice(reason);
            }
        }
    }

    pub fn decode(bytes: &mut &[u8]) -> DecodeResult<Self> {
        let tag = read_varint(bytes)?;

        if (STREAM_TAG_BASE..=STREAM_TAG_BASE + 0x07).contains(&tag) {
            let off = tag & STREAM_OFF_BIT != 0;
            let has_len = tag & STREAM_LEN_BIT != 0;
            let fin = tag & STREAM_FIN_BIT != 0;
            let stream_id = read_varint(bytes)?;
            let offset = if off { read_varint(bytes)? } else { 0 };
            let len = if has_len {
                read_varint(bytes)? as usize
            } else {
                bytes.len()
            };
            let data = read_bytes(bytes, len)?.to_vec();
            return Ok(Frame::Stream {
                stream_id,
                offset,
                fin,
                data,
            });
        }

        let known = FrameTypeTag::try_from_u64(tag)
            .ok_or_else(|| TransportError::frame_encoding(format!("unknown frame type {tag:#x}")).with_frame_type(tag))?;

        Ok(match known {
            FrameTypeTag::PADDING => Frame::Padding,
            FrameTypeTag::PING => Frame::Ping,
            FrameTypeTag::ACK | FrameTypeTag::ACK_ECN => {
                let largest = read_varint(bytes)?;
                let delay = read_varint(bytes)?;
                let range_count = read_varint(bytes)?;
                let first_range = read_varint(bytes)?;
                let mut ranges = Vec::with_capacity(range_count as usize);
                for _ in 0..range_count {
                    let gap = read_varint(bytes)?;
                    let ack_range_len = read_varint(bytes)?;
                    ranges.push(AckRange { gap, ack_range_len });
                }
                let ecn = if known == FrameTypeTag::ACK_ECN {
                    Some(EcnCounts {
                        ect0: read_varint(bytes)?,
                        ect1: read_varint(bytes)?,
                        ecn_ce: read_varint(bytes)?,
                    })
                } else {
                    None
                };
                Frame::Ack {
                    largest,
                    delay,
                    first_range,
                    ranges,
                    ecn,
                }
            }
            FrameTypeTag::RESET_STREAM => Frame::ResetStream {
                stream_id: read_varint(bytes)?,
                error_code: read_varint(bytes)?,
                final_size: read_varint(bytes)?,
            },
            FrameTypeTag::STOP_SENDING => Frame::StopSending {
                stream_id: read_varint(bytes)?,
                error_code: read_varint(bytes)?,
            },
            FrameTypeTag::CRYPTO => {
                let offset = read_varint(bytes)?;
                let len = read_varint(bytes)? as usize;
                let data = read_bytes(bytes, len)?.to_vec();
                Frame::Crypto { offset, data }
            }
            FrameTypeTag::NEW_TOKEN => {
                let len = read_varint(bytes)? as usize;
                require(len > 0, "NEW_TOKEN token must not be empty")?;
                let token = read_bytes(bytes, len)?.to_vec();
                Frame::NewToken { token }
            }
            FrameTypeTag::MAX_DATA => Frame::MaxData {
                max: read_varint(bytes)?,
            },
            FrameTypeTag::MAX_STREAM_DATA => Frame::MaxStreamData {
                stream_id: read_varint(bytes)?,
                max: read_varint(bytes)?,
            },
            FrameTypeTag::MAX_STREAMS_BIDI => Frame::MaxStreams {
                dir: Direction::Bidi,
                max: read_varint(bytes)?,
            },
            FrameTypeTag::MAX_STREAMS_UNI => Frame::MaxStreams {
                dir: Direction::Uni,
                max: read_varint(bytes)?,
            },
            FrameTypeTag::DATA_BLOCKED => Frame::DataBlocked {
                limit: read_varint(bytes)?,
            },
            FrameTypeTag::STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                stream_id: read_varint(bytes)?,
                limit: read_varint(bytes)?,
            },
            FrameTypeTag::STREAMS_BLOCKED_BIDI => Frame::StreamsBlocked {
                dir: Direction::Bidi,
                limit: read_varint(bytes)?,
            },
            FrameTypeTag::STREAMS_BLOCKED_UNI => Frame::StreamsBlocked {
                dir: Direction::Uni,
                limit: read_varint(bytes)?,
            },
            FrameTypeTag::NEW_CONNECTION_ID => {
                let seq = read_varint(bytes)?;
                let retire_prior_to = read_varint(bytes)?;
                require(retire_prior_to <= seq, "retire_prior_to exceeds sequence number")?;
                let cid_len = *bytes.first().ok_or_else(|| TransportError::frame_encoding("truncated NEW_CONNECTION_ID"))?;
                *bytes = &bytes[1..];
                require(
                    (1..=crate::packet::types::MAX_CID_LEN as u8).contains(&cid_len),
                    "NEW_CONNECTION_ID length out of range",
                )?;
                let cid = ConnectionId::from_slice(read_bytes(bytes, cid_len as usize)?);
                let reset_token = read_array::<16>(bytes)?;
                Frame::NewConnectionId {
                    seq,
                    retire_prior_to,
                    cid,
                    reset_token,
                }
            }
            FrameTypeTag::RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
                seq: read_varint(bytes)?,
            },
            FrameTypeTag::PATH_CHALLENGE => Frame::PathChallenge {
                data: read_array::<8>(bytes)?,
            },
            FrameTypeTag::PATH_RESPONSE => Frame::PathResponse {
                data: read_array::<8>(bytes)?,
            },
            FrameTypeTag::CONNECTION_CLOSE_TRANSPORT => {
                let error_code = read_varint(bytes)?;
                let frame_type = read_varint(bytes)?;
                let reason_len = read_varint(bytes)? as usize;
                let reason = read_bytes(bytes, reason_len)?.to_vec();
                Frame::ConnectionClose {
                    error_code,
                    frame_type: Some(frame_type),
                    is_app: false,
                    reason,
                }
            }
            FrameTypeTag::CONNECTION_CLOSE_APPLICATION => {
                let error_code = read_varint(bytes)?;
                let reason_len = read_varint(bytes)? as usize;
                let reason = read_bytes(bytes, reason_len)?.to_vec();
                Frame::ConnectionClose {
                    error_code,
                    frame_type: None,
                    is_app: true,
                    reason,
                }
            }
            FrameTypeTag::HANDSHAKE_DONE => Frame::HandshakeDone,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(frame: Frame) {
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        let mut slice = buf.as_slice();
        let decoded = Frame::decode(&mut slice).unwrap();
        assert_eq!(frame, decoded);
        assert!(slice.is_empty());
    }

    #[test]
    fn padding_ping_handshake_done_round_trip() {
        round_trip(Frame::Padding);
        round_trip(Frame::Ping);
        round_trip(Frame::HandshakeDone);
    }

    #[test]
    fn ack_without_ecn_round_trips() {
        round_trip(Frame::Ack {
            largest: 42,
            delay: 100,
            first_range: 5,
            ranges: vec![AckRange { gap: 1, ack_range_len: 3 }],
            ecn: None,
        });
    }

    #[test]
    fn ack_with_ecn_round_trips() {
        round_trip(Frame::Ack {
            largest: 9001,
            delay: 0,
            first_range: 0,
            ranges: vec![],
            ecn: Some(EcnCounts { ect0: 1, ect1: 2, ecn_ce: 3 }),
        });
    }

    #[test]
    fn stream_with_offset_and_fin_round_trips() {
        round_trip(Frame::Stream {
            stream_id: 4,
            offset: 16,
            fin: true,
            data: b"hello".to_vec(),
        });
    }

    #[test]
    fn stream_zero_offset_round_trips() {
        round_trip(Frame::Stream {
            stream_id: 0,
            offset: 0,
            fin: false,
            data: b"abcd".to_vec(),
        });
    }

    #[test]
    fn crypto_round_trips() {
        round_trip(Frame::Crypto {
            offset: 0,
            data: b"client hello bytes".to_vec(),
        });
    }

    #[test]
    fn new_token_rejects_empty() {
        let mut buf = Vec::new();
        write_varint(&mut buf, FrameTypeTag::NEW_TOKEN.wire_value());
        write_varint(&mut buf, 0);
        let mut slice = buf.as_slice();
        assert!(Frame::decode(&mut slice).is_err());
    }

    #[test]
    fn new_connection_id_round_trips() {
        round_trip(Frame::NewConnectionId {
            seq: 1,
            retire_prior_to: 0,
            cid: ConnectionId::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]),
            reset_token: [7u8; 16],
        });
    }

    #[test]
    fn connection_close_transport_round_trips() {
        round_trip(Frame::ConnectionClose {
            error_code: 0x0a,
            frame_type: Some(0x06),
            is_app: false,
            reason: b"bad crypto frame".to_vec(),
        });
    }

    #[test]
    fn connection_close_application_round_trips() {
        round_trip(Frame::ConnectionClose {
            error_code: 1,
            frame_type: None,
            is_app: true,
            reason: vec![],
        });
    }

    #[test]
    fn unknown_tag_is_frame_encoding_error() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 0x2f);
        let mut slice = buf.as_slice();
        assert!(Frame::decode(&mut slice).is_err());
    }

    #[test]
    fn ack_eliciting_classification() {
        assert!(!Frame::Padding.is_ack_eliciting());
        assert!(!Frame::ConnectionClose {
            error_code: 0,
            frame_type: None,
            is_app: true,
            reason: vec![]
        }
        .is_ack_eliciting());
        assert!(Frame::Ping.is_ack_eliciting());
        assert!(Frame::HandshakeDone.is_ack_eliciting());
    }

    #[test]
    fn retransmit_policy_matches_spec_table() {
        assert_eq!(Frame::Crypto { offset: 0, data: vec![] }.retransmit_policy(), RetransmitPolicy::Requeue);
        assert_eq!(Frame::Ping.retransmit_policy(), RetransmitPolicy::Drop);
        assert_eq!(
            Frame::ConnectionClose { error_code: 0, frame_type: None, is_app: true, reason: vec![] }
                .retransmit_policy(),
            RetransmitPolicy::Drop
        );
        assert_eq!(
            Frame::Ack { largest: 0, delay: 0, first_range: 0, ranges: vec![], ecn: None }.retransmit_policy(),
            RetransmitPolicy::DropAndForceFreshAck
        );
        assert_eq!(Frame::MaxData { max: 10 }.retransmit_policy(), RetransmitPolicy::Regenerate);
    }
}
