//! Per-stream state: receive buffering/credit, send buffering/credit, and the
//! initiator/direction bits packed into the stream ID.

use std::collections::VecDeque;

use super::reassembly::Reassembler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDir {
    Bidi,
    Uni,
}

/// Decodes the low two bits of a stream ID (RFC 9000 §2.1): bit 0 = initiator, bit 1 = dir.
pub fn decode_stream_id(id: u64) -> (Initiator, StreamDir) {
    let initiator = if id & 0x1 == 0 { Initiator::Client } else { Initiator::Server };
    let dir = if id & 0x2 == 0 { StreamDir::Bidi } else { StreamDir::Uni };
    (initiator, dir)
}

/// Default per-stream receive buffer size when no larger limit was configured.
pub const DEFAULT_STREAM_RECV_BUFFER: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct ReadSide {
    pub reassembler: Option<Reassembler>,
    pub eof_at: Option<u64>,
    pub delivered: VecDeque<u8>,
    pub error: Option<u64>,
}

#[derive(Debug, Default)]
pub struct WriteSide {
    pub queued: VecDeque<u8>,
    pub sent_offset: u64,
    pub acked_offset: u64,
    pub fin_queued: bool,
    pub fin_acked: bool,
    pub error: Option<u64>,
}

pub struct Stream {
    pub id: u64,
    pub initiator: Initiator,
    pub dir: StreamDir,
    pub recv: ReadSide,
    pub send: WriteSide,
    /// Bytes the peer has told us we may send on this stream (MAX_STREAM_DATA from peer).
    pub send_max_data: u64,
    /// Receive credit we have advertised to the peer (our own MAX_STREAM_DATA).
    pub recv_max_data: u64,
    pub recv_buffer_capacity: usize,
}

impl Stream {
    pub fn new(id: u64, recv_buffer_capacity: usize, initial_send_max_data: u64, initial_recv_max_data: u64) -> Self {
        let (initiator, dir) = decode_stream_id(id);
        let mut recv = ReadSide::default();
        if dir == StreamDir::Bidi || matches!((initiator, dir), (Initiator::Client, StreamDir::Uni)) {
            recv.reassembler = Some(Reassembler::new(recv_buffer_capacity));
        }
        Self {
            id,
            initiator,
            dir,
            recv,
            send: WriteSide::default(),
            send_max_data: initial_send_max_data,
            recv_max_data: initial_recv_max_data,
            recv_buffer_capacity,
        }
    }

    pub fn received(&self) -> u64 {
        self.recv.reassembler.as_ref().map(Reassembler::received).unwrap_or(0)
    }

    /// Per-stream receive credit to advertise: bytes already received plus remaining
    /// headroom in the buffer.
    pub fn advertised_recv_max_data(&self) -> u64 {
        self.received() + self.recv_buffer_capacity as u64
    }

    pub fn is_read_closed(&self) -> bool {
        self.recv.eof_at.is_some() || self.recv.error.is_some()
    }

    pub fn is_write_closed(&self) -> bool {
        self.send.fin_acked || self.send.error.is_some()
    }

    pub fn mark_error(&mut self, error_code: u64) {
        self.recv.error = Some(error_code);
        self.send.error = Some(error_code);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stream_id_bits_decode() {
        assert_eq!(decode_stream_id(0), (Initiator::Client, StreamDir::Bidi));
        assert_eq!(decode_stream_id(1), (Initiator::Server, StreamDir::Bidi));
        assert_eq!(decode_stream_id(2), (Initiator::Client, StreamDir::Uni));
        assert_eq!(decode_stream_id(3), (Initiator::Server, StreamDir::Uni));
    }

    #[test]
    fn advertised_credit_tracks_buffer_headroom() {
        let stream = Stream::new(0, 1024, 0, 1024);
        assert_eq!(stream.advertised_recv_max_data(), 1024);
    }
}
