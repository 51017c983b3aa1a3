//! Per-encryption-level packet-number space: send/receive bookkeeping for one of Initial,
//! Handshake, or Application.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::packet::frame::{AckRange, Frame};
use crate::packet::types::PacketNumber;

/// Default range-table capacity: bounds how many disjoint gaps of received packet numbers
/// one space will track before evicting the oldest.
pub const DEFAULT_MAX_RANGES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Initial,
    Handshake,
    Application,
}

/// An unacknowledged, ack-eliciting packet still awaiting acknowledgement or loss detection.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub pn: u64,
    pub sent_at_millis: u64,
    pub size: usize,
    pub ack_eliciting: bool,
    pub frames: Vec<Frame>,
}

/// Outcome of recording a newly-received packet number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckInsert {
    /// Recorded without disturbing the range table's shape.
    Fresh,
    /// Already seen; no state change.
    Duplicate,
    /// Recording `pn` required evicting the oldest tracked range to stay within capacity.
    /// The caller must flush the current ACK frame before relying on ranges older than the
    /// evicted one.
    Overflowed,
}

/// Gap-encoded set of received packet numbers for one space, newest-first on the wire.
///
/// Kept internally as a sorted set; the wire encoding in [`AckAccumulator::to_frame`] is
/// derived from it on demand.
#[derive(Debug, Clone)]
pub struct AckAccumulator {
    received: BTreeSet<u64>,
    capacity: usize,
}

impl AckAccumulator {
    pub fn new(capacity: usize) -> Self {
        Self {
            received: BTreeSet::new(),
            capacity,
        }
    }

    pub fn contains(&self, pn: u64) -> bool {
        self.received.contains(&pn)
    }

    pub fn largest(&self) -> Option<u64> {
        self.received.iter().next_back().copied()
    }

    /// Number of maximal contiguous runs currently tracked.
    fn range_count(&self) -> usize {
        let mut count = 0usize;
        let mut prev: Option<u64> = None;
        for &pn in &self.received {
            match prev {
                Some(p) if p + 1 == pn => {}
                _ => count += 1,
            }
            prev = Some(pn);
        }
        count
    }

    fn oldest_range_start(&self) -> Option<u64> {
        let mut iter = self.received.iter().copied();
        let mut start = iter.next()?;
        let mut prev = start;
        for pn in iter {
            if pn != prev + 1 {
                break;
            }
            prev = pn;
        }
        let _ = prev;
        Some(start)
    }

    fn evict_oldest_range(&mut self) {
        let Some(start) = self.oldest_range_start() else { return };
        let mut pn = start;
        loop {
            if !self.received.remove(&pn) {
                break;
            }
            pn += 1;
            if !self.received.contains(&pn) {
                break;
            }
        }
    }

    pub fn insert(&mut self, pn: u64) -> AckInsert {
        if self.received.contains(&pn) {
            return AckInsert::Duplicate;
        }
        let ranges_before = self.range_count();
        self.received.insert(pn);
        if self.range_count() > ranges_before && ranges_before >= self.capacity {
            if self.received.len() > 1 {
                self.evict_oldest_range();
            }
            return AckInsert::Overflowed;
        }
        AckInsert::Fresh
    }

    /// Builds the `(largest, first_range, ranges)` triple an ACK frame needs, newest-first.
    pub fn to_ranges(&self) -> Option<(u64, u64, Vec<AckRange>)> {
        let largest = self.largest()?;
        let mut blocks: Vec<(u64, u64)> = Vec::new(); // (start, end) inclusive, ascending
        let mut iter = self.received.iter().copied().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end = iter.next().unwrap();
            }
            blocks.push((start, end));
        }
        blocks.reverse(); // newest first

        let (first_start, first_end) = blocks[0];
        debug_assert_eq!(first_end, largest);
        let first_range = first_end - first_start;

        let mut ranges = Vec::with_capacity(blocks.len().saturating_sub(1));
        let mut prev_start = first_start;
        for &(start, end) in &blocks[1..] {
            let gap = prev_start - end - 2;
            let ack_range_len = end - start;
            ranges.push(AckRange { gap, ack_range_len });
            prev_start = start;
        }

        Some((largest, first_range, ranges))
    }

    pub fn to_frame(&self, delay: u64, ecn: Option<crate::packet::frame::EcnCounts>) -> Option<Frame> {
        let (largest, first_range, ranges) = self.to_ranges()?;
        Some(Frame::Ack {
            largest,
            delay,
            first_range,
            ranges,
            ecn,
        })
    }
}

/// Per-level send/receive state.
pub struct PnSpace {
    pub level: Level,
    next_pn: u64,
    pub largest_acked_by_peer: Option<u64>,
    pub acks: AckAccumulator,
    pub pending_frames: VecDeque<Frame>,
    pub sent: BTreeMap<u64, SentPacket>,
    /// Largest ack-eliciting PN received but not yet acked.
    pub pending_ack: Option<u64>,
    pub send_ack: u32,
    /// When the first ack-eliciting packet since the last flush arrived; the ack-delay-push
    /// timer fires `max_ack_delay` after this (spec.md §3, §4.4).
    pub ack_delay_start: Option<u64>,
}

impl PnSpace {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            next_pn: 0,
            largest_acked_by_peer: None,
            acks: AckAccumulator::new(DEFAULT_MAX_RANGES),
            pending_frames: VecDeque::new(),
            sent: BTreeMap::new(),
            pending_ack: None,
            send_ack: 0,
            ack_delay_start: None,
        }
    }

    pub fn next_pn(&self) -> u64 {
        self.next_pn
    }

    pub fn allocate_pn(&mut self) -> PacketNumber {
        let pn = self.next_pn;
        self.next_pn += 1;
        PacketNumber::new(pn)
    }

    pub fn queue(&mut self, frame: Frame) {
        self.pending_frames.push_back(frame);
    }

    /// Records the PN of a packet just transmitted; ack-eliciting packets move to the
    /// sent/unacked table and (re)arm loss detection upstream.
    pub fn on_packet_sent(&mut self, pn: u64, sent_at_millis: u64, size: usize, frames: Vec<Frame>) {
        let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
        if ack_eliciting {
            self.sent.insert(
                pn,
                SentPacket {
                    pn,
                    sent_at_millis,
                    size,
                    ack_eliciting,
                    frames,
                },
            );
        }
    }

    /// Records an incoming packet number, updating the ACK accumulator and `pending_ack`,
    /// and bumps `send_ack` if the packet was ack-eliciting. `now_millis` seeds
    /// `ack_delay_start` the first time a packet goes unacked since the last flush.
    pub fn on_packet_received(&mut self, pn: u64, ack_eliciting: bool, now_millis: u64) -> AckInsert {
        let outcome = self.acks.insert(pn);
        if ack_eliciting {
            self.send_ack += 1;
            self.pending_ack = Some(self.pending_ack.map_or(pn, |p| p.max(pn)));
            self.ack_delay_start.get_or_insert(now_millis);
        }
        outcome
    }

    /// Applies a received ACK frame, removing newly-acked packets from `sent` and returning
    /// them so the caller can feed congestion control / loss detection.
    pub fn apply_ack(&mut self, largest: u64, first_range: u64, ranges: &[AckRange]) -> Vec<SentPacket> {
        self.largest_acked_by_peer = Some(
            self.largest_acked_by_peer
                .map_or(largest, |prev| prev.max(largest)),
        );

        let mut acked_pns: Vec<u64> = (largest.saturating_sub(first_range)..=largest).collect();
        let mut upper = largest.saturating_sub(first_range);
        for range in ranges {
            let range_end = upper.saturating_sub(range.gap + 2);
            let range_start = range_end.saturating_sub(range.ack_range_len);
            acked_pns.extend(range_start..=range_end);
            upper = range_start;
        }

        let mut acked = Vec::new();
        for pn in acked_pns {
            if let Some(packet) = self.sent.remove(&pn) {
                acked.push(packet);
            }
        }
        acked
    }

    pub fn is_ack_due(&self, level_is_application: bool) -> bool {
        if !level_is_application {
            return self.send_ack > 0;
        }
        self.send_ack >= 2
    }

    /// Deadline at which a still-delayed Application-level ACK must be flushed even though
    /// `is_ack_due` hasn't tripped on count alone (spec.md §4.4: "may be delayed up to
    /// `max_ack_delay`"). `None` when there is nothing pending to delay.
    pub fn ack_delay_deadline(&self, max_ack_delay_millis: u64) -> Option<u64> {
        self.ack_delay_start.map(|start| start + max_ack_delay_millis)
    }

    /// Clears all delayed-ack bookkeeping once an ACK frame covering it has been queued.
    pub fn mark_ack_flushed(&mut self) {
        self.send_ack = 0;
        self.pending_ack = None;
        self.ack_delay_start = None;
    }
}

/// Bytes needed to truncate `next_pn` for the wire, given the largest PN the peer has
/// acked so far: `max(1, ceil(log2(delta+1)/8))`, clamped to `{1,2,3,4}`.
pub fn pn_encode_len(next_pn: u64, largest_acked: Option<u64>) -> u8 {
    let delta = match largest_acked {
        Some(acked) => next_pn.saturating_sub(acked),
        None => return 4,
    };
    let bits = 64 - (delta + 1).leading_zeros();
    let bytes = (bits as u64).div_ceil(8).max(1);
    bytes.clamp(1, 4) as u8
}

/// Truncates `pn` to its low `len` bytes, big-endian, for the wire.
pub fn truncate_pn(pn: u64, len: u8) -> Vec<u8> {
    let full = pn.to_be_bytes();
    full[8 - len as usize..].to_vec()
}

/// Reconstructs a full packet number from its wire truncation, given the receiver's
/// expectation of the next PN: the decoded value is
/// whichever full PN consistent with the truncated low bits sits closest to `expected`.
pub fn decode_packet_number(expected: u64, truncated: u64, pn_len_bytes: u8) -> u64 {
    let pn_nbits = pn_len_bytes as u32 * 8;
    let pn_win = 1u64 << pn_nbits;
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;

    let candidate = (expected & !pn_mask) | truncated;
    if candidate + pn_hwin <= expected {
        candidate + pn_win
    } else if candidate > expected + pn_hwin && candidate >= pn_win {
        candidate - pn_win
    } else {
        candidate
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pn_truncation_round_trips_across_window() {
        for expected in [0u64, 1, 127, 128, 1000, 1_000_000] {
            for delta in 0u64..300 {
                let pn = expected + delta;
                let len = pn_encode_len(pn, Some(expected.saturating_sub(1)));
                let truncated_bytes = truncate_pn(pn, len);
                let mut truncated = 0u64;
                for b in &truncated_bytes {
                    truncated = (truncated << 8) | *b as u64;
                }
                let decoded = decode_packet_number(expected, truncated, len);
                assert_eq!(decoded, pn, "expected={expected} delta={delta} len={len}");
            }
        }
    }

    #[test]
    fn pn_encode_len_defaults_to_four_bytes_when_unset() {
        assert_eq!(pn_encode_len(5, None), 4);
    }

    #[test]
    fn contiguous_inserts_form_one_range() {
        let mut acc = AckAccumulator::new(DEFAULT_MAX_RANGES);
        for pn in 0..5 {
            assert_eq!(acc.insert(pn), AckInsert::Fresh);
        }
        let (largest, first_range, ranges) = acc.to_ranges().unwrap();
        assert_eq!(largest, 4);
        assert_eq!(first_range, 4);
        assert!(ranges.is_empty());
    }

    #[test]
    fn duplicate_insert_is_noop() {
        let mut acc = AckAccumulator::new(DEFAULT_MAX_RANGES);
        acc.insert(10);
        assert_eq!(acc.insert(10), AckInsert::Duplicate);
    }

    #[test]
    fn gap_produces_two_ranges() {
        let mut acc = AckAccumulator::new(DEFAULT_MAX_RANGES);
        for pn in [0u64, 1, 2, 5, 6] {
            acc.insert(pn);
        }
        let (largest, first_range, ranges) = acc.to_ranges().unwrap();
        assert_eq!(largest, 6);
        assert_eq!(first_range, 1); // covers 5..=6
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].gap, 1); // 5 - 2 - 2 = 1
        assert_eq!(ranges[0].ack_range_len, 2); // covers 0..=2
    }

    #[test]
    fn random_permutation_matches_sorted_insertion() {
        let pns = [3u64, 1, 9, 0, 8, 2, 15];
        let mut sorted = pns.to_vec();
        sorted.sort_unstable();

        let mut a = AckAccumulator::new(DEFAULT_MAX_RANGES);
        for &pn in &pns {
            a.insert(pn);
        }
        let mut b = AckAccumulator::new(DEFAULT_MAX_RANGES);
        for &pn in &sorted {
            b.insert(pn);
        }
        assert_eq!(a.to_ranges(), b.to_ranges());
    }

    #[test]
    fn overflow_evicts_oldest_range() {
        let mut acc = AckAccumulator::new(2);
        acc.insert(0);
        acc.insert(10); // gap -> 2 ranges, at capacity
        assert_eq!(acc.insert(20), AckInsert::Overflowed); // would be 3rd range
        assert!(!acc.contains(0)); // oldest range evicted
        assert!(acc.contains(10));
        assert!(acc.contains(20));
    }

    #[test]
    fn apply_ack_removes_sent_packets() {
        let mut space = PnSpace::new(Level::Application);
        for pn in 0..3u64 {
            space.on_packet_sent(pn, 0, 100, vec![Frame::Ping]);
        }
        let acked = space.apply_ack(2, 2, &[]);
        assert_eq!(acked.len(), 3);
        assert!(space.sent.is_empty());
    }
}
