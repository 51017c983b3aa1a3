//! Stream table: creation, ID bookkeeping, and count-based stream limits.

use std::collections::BTreeMap;

use super::stream::{decode_stream_id, Initiator, Stream, StreamDir};
use crate::result::{TransportError, TransportErrorCode};

/// Semantic upper bound on any MAX_STREAMS value: a stream ID is a 62-bit varint with its
/// low 2 bits reserved for initiator/direction, so at most `1 << 60` streams of a given kind
/// can ever exist on the wire.
pub const MAX_STREAMS_LIMIT: u64 = 1u64 << 60;

pub struct StreamTable {
    streams: BTreeMap<u64, Stream>,
    local_role: Initiator,
    recv_buffer_capacity: usize,
    /// Streams of each (initiator, dir) we are permitted to have open, granted by peer.
    peer_max_streams_bidi: u64,
    peer_max_streams_uni: u64,
    /// Streams of each kind the peer is permitted to open, advertised by us.
    local_max_streams_bidi: u64,
    local_max_streams_uni: u64,
    opened_bidi_by_peer: u64,
    opened_uni_by_peer: u64,
    next_bidi_id: u64,
    next_uni_id: u64,
}

impl StreamTable {
    pub fn new(
        local_role: Initiator,
        recv_buffer_capacity: usize,
        local_max_streams_bidi: u64,
        local_max_streams_uni: u64,
    ) -> Self {
        let (first_bidi, first_uni) = match local_role {
            Initiator::Client => (0u64, 2u64),
            Initiator::Server => (1u64, 3u64),
        };
        Self {
            streams: BTreeMap::new(),
            local_role,
            recv_buffer_capacity,
            peer_max_streams_bidi: 0,
            peer_max_streams_uni: 0,
            local_max_streams_bidi,
            local_max_streams_uni,
            opened_bidi_by_peer: 0,
            opened_uni_by_peer: 0,
            next_bidi_id: first_bidi,
            next_uni_id: first_uni,
        }
    }

    pub fn set_peer_limits(&mut self, max_streams_bidi: u64, max_streams_uni: u64) {
        self.peer_max_streams_bidi = max_streams_bidi.min(MAX_STREAMS_LIMIT);
        self.peer_max_streams_uni = max_streams_uni.min(MAX_STREAMS_LIMIT);
    }

    /// Raise the peer-granted bidi stream limit; MAX_STREAMS only ever increases a limit.
    pub fn set_peer_limit_bidi(&mut self, max_streams: u64) {
        self.peer_max_streams_bidi = self.peer_max_streams_bidi.max(max_streams.min(MAX_STREAMS_LIMIT));
    }

    /// Raise the peer-granted uni stream limit; MAX_STREAMS only ever increases a limit.
    pub fn set_peer_limit_uni(&mut self, max_streams: u64) {
        self.peer_max_streams_uni = self.peer_max_streams_uni.max(max_streams.min(MAX_STREAMS_LIMIT));
    }

    pub fn get(&self, id: u64) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn remove(&mut self, id: u64) -> Option<Stream> {
        self.streams.remove(&id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.values_mut()
    }

    /// Opens the next locally-initiated stream of the given direction, enforcing the
    /// peer-granted MAX_STREAMS limit.
    pub fn open_local(&mut self, dir: StreamDir) -> Result<u64, TransportError> {
        let (next_id, limit, opened) = match dir {
            StreamDir::Bidi => (&mut self.next_bidi_id, self.peer_max_streams_bidi, self.next_bidi_id / 4),
            StreamDir::Uni => (&mut self.next_uni_id, self.peer_max_streams_uni, self.next_uni_id / 4),
        };
        if opened >= limit {
            return Err(TransportError::new(
                TransportErrorCode::StreamLimitError,
                "peer stream limit reached",
            ));
        }
        let id = *next_id;
        *next_id += 4;
        let initial_send_max = 0; // raised once peer sends MAX_STREAM_DATA
        self.streams.insert(
            id,
            Stream::new(id, self.recv_buffer_capacity, initial_send_max, self.recv_buffer_capacity as u64),
        );
        Ok(id)
    }

    /// Ensures `id` (and every lower-numbered stream of the same type, per RFC 9000 §2.1)
    /// exists, creating them if this is the first frame referencing them. Returns an error
    /// if `id` exceeds the advertised MAX_STREAMS for its type.
    pub fn ensure_peer_stream(&mut self, id: u64) -> Result<(), TransportError> {
        if self.streams.contains_key(&id) {
            return Ok(());
        }
        let (initiator, dir) = decode_stream_id(id);
        if initiator == self.local_role {
            return Err(TransportError::new(
                TransportErrorCode::StreamStateError,
                "peer referenced a stream ID this endpoint owns",
            ));
        }

        let index = id / 4;
        let (limit, opened) = match dir {
            StreamDir::Bidi => (self.local_max_streams_bidi, &mut self.opened_bidi_by_peer),
            StreamDir::Uni => (self.local_max_streams_uni, &mut self.opened_uni_by_peer),
        };
        if index >= limit {
            return Err(TransportError::new(
                TransportErrorCode::StreamLimitError,
                "peer exceeded advertised stream limit",
            ));
        }

        let base = match (initiator, dir) {
            (Initiator::Client, StreamDir::Bidi) => 0,
            (Initiator::Server, StreamDir::Bidi) => 1,
            (Initiator::Client, StreamDir::Uni) => 2,
            (Initiator::Server, StreamDir::Uni) => 3,
        };
        let mut i = *opened;
        while base + i * 4 <= id {
            let stream_id = base + i * 4;
            self.streams.entry(stream_id).or_insert_with(|| {
                Stream::new(stream_id, self.recv_buffer_capacity, 0, self.recv_buffer_capacity as u64)
            });
            i += 1;
        }
        *opened = i;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn client_opens_bidi_streams_at_multiples_of_four() {
        let mut table = StreamTable::new(Initiator::Client, 1024, 10, 10);
        table.set_peer_limits(10, 10);
        let a = table.open_local(StreamDir::Bidi).unwrap();
        let b = table.open_local(StreamDir::Bidi).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 4);
    }

    #[test]
    fn opening_beyond_peer_limit_fails() {
        let mut table = StreamTable::new(Initiator::Client, 1024, 10, 10);
        table.set_peer_limits(1, 10);
        table.open_local(StreamDir::Bidi).unwrap();
        assert!(table.open_local(StreamDir::Bidi).is_err());
    }

    #[test]
    fn peer_stream_creates_lower_numbered_streams_too() {
        let mut table = StreamTable::new(Initiator::Server, 1024, 10, 10);
        table.ensure_peer_stream(8).unwrap(); // client bidi stream #2 (id 8 = 2*4)
        assert!(table.get(0).is_some());
        assert!(table.get(4).is_some());
        assert!(table.get(8).is_some());
    }

    #[test]
    fn peer_stream_beyond_limit_is_rejected() {
        let mut table = StreamTable::new(Initiator::Server, 1024, 1, 1);
        assert!(table.ensure_peer_stream(4).is_err()); // index 1, limit 1 -> rejected
    }

    #[test]
    fn max_streams_limit_is_two_to_the_sixty() {
        assert_eq!(MAX_STREAMS_LIMIT, 1u64 << 60);
    }
}
