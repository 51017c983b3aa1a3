//! Ordered reassembly buffer shared by the CRYPTO stream and every application stream
//! (spec.md §4.8, §4.10: "out-of-order STREAM frames use the same reassembly machinery
//! as CRYPTO").

use std::collections::BTreeMap;

/// Raised when buffering a fragment would exceed the configured capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("reassembly buffer would exceed its {max_buffered}-byte capacity")]
pub struct ReassemblyOverflow {
    pub max_buffered: usize,
}

/// Accepts `(offset, bytes)` fragments in any order and exposes the longest contiguous
/// prefix received so far.
#[derive(Debug)]
pub struct Reassembler {
    /// Number of bytes delivered (or available to deliver) contiguously from offset 0.
    received: u64,
    /// Out-of-order fragments, keyed by start offset, mutually non-overlapping.
    buffered: BTreeMap<u64, Vec<u8>>,
    buffered_bytes: usize,
    max_buffered: usize,
}

impl Reassembler {
    pub fn new(max_buffered: usize) -> Self {
        Self {
            received: 0,
            buffered: BTreeMap::new(),
            buffered_bytes: 0,
            max_buffered,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// Inserts a fragment at `offset`, returning the contiguous bytes (if any) it makes
    /// available for delivery. Bytes already covered by `received` are dropped as
    /// duplicates; bytes that overlap an already-buffered fragment (at the same offset, an
    /// earlier offset, or a later one) are trimmed so `buffered` stays mutually
    /// non-overlapping rather than accumulating an orphaned entry.
    pub fn insert(&mut self, offset: u64, data: &[u8]) -> Result<Vec<u8>, ReassemblyOverflow> {
        let end = offset + data.len() as u64;
        if end <= self.received {
            return Ok(Vec::new());
        }

        let mut start = self.received.max(offset);
        let skip = (start - offset) as usize;
        let mut data = data[skip..].to_vec();
        if data.is_empty() {
            return Ok(Vec::new());
        }

        // Trim against a buffered predecessor whose range already reaches into ours.
        if let Some((&prev_start, prev_data)) = self.buffered.range(..start).next_back() {
            let prev_end = prev_start + prev_data.len() as u64;
            if prev_end > start {
                let skip = (prev_end - start).min(data.len() as u64) as usize;
                data.drain(..skip);
                start += skip as u64;
                if data.is_empty() {
                    return Ok(self.drain_contiguous());
                }
            }
        }

        // Trim/drop against buffered successors our (possibly shortened) range now covers.
        let end = start + data.len() as u64;
        let overlapping: Vec<u64> = self.buffered.range(start..end).map(|(&k, _)| k).collect();
        for key in overlapping {
            let existing_len = match self.buffered.get(&key) {
                Some(v) => v.len(),
                None => continue,
            };
            let existing_end = key + existing_len as u64;
            if existing_end <= end {
                // Fully subsumed by the new fragment; it would otherwise be orphaned once
                // `received` passes its start without ever being its own contiguous key.
                self.buffered_bytes -= existing_len;
                self.buffered.remove(&key);
            } else {
                // Overlaps but extends further than ours: keep it, stop at its start.
                data.truncate((key - start) as usize);
                break;
            }
        }
        if data.is_empty() {
            return Ok(self.drain_contiguous());
        }

        let incoming_len = data.len();
        let prior_len = self.buffered.get(&start).map(Vec::len).unwrap_or(0);
        if self.buffered_bytes + incoming_len - prior_len > self.max_buffered {
            return Err(ReassemblyOverflow {
                max_buffered: self.max_buffered,
            });
        }

        self.buffered_bytes = self.buffered_bytes + incoming_len - prior_len;
        self.buffered.insert(start, data);

        Ok(self.drain_contiguous())
    }

    fn drain_contiguous(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.buffered.remove(&self.received) {
            self.buffered_bytes -= chunk.len();
            self.received += chunk.len() as u64;
            out.extend(chunk);
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn in_order_fragments_deliver_immediately() {
        let mut r = Reassembler::new(1024);
        assert_eq!(r.insert(0, b"ABCD").unwrap(), b"ABCD");
        assert_eq!(r.received(), 4);
    }

    #[test]
    fn out_of_order_fragments_buffer_then_deliver() {
        let mut r = Reassembler::new(1024);
        assert_eq!(r.insert(4, b"DEFG").unwrap(), Vec::<u8>::new());
        assert_eq!(r.insert(8, b"HIJ").unwrap(), Vec::<u8>::new());
        assert_eq!(r.insert(0, b"ABCD").unwrap(), b"ABCDDEFGHIJ");
        assert_eq!(r.received(), 11);
    }

    #[test]
    fn duplicate_fragment_is_dropped() {
        let mut r = Reassembler::new(1024);
        r.insert(0, b"ABCD").unwrap();
        assert_eq!(r.insert(0, b"ABCD").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn partially_overlapping_fragment_trims_to_new_bytes() {
        let mut r = Reassembler::new(1024);
        r.insert(0, b"AB").unwrap();
        assert_eq!(r.insert(1, b"BCD").unwrap(), b"CD");
        assert_eq!(r.received(), 4);
    }

    #[test]
    fn overlapping_out_of_order_fragments_trim_against_each_other() {
        let mut r = Reassembler::new(1024);
        // Full stream is "ABCDEFGHIJ". offset=4 len=4 ("EFGH", bytes 4..8), then an
        // overlapping offset=6 len=4 ("GHIJ", bytes 6..10) sharing bytes 6..8 ("GH").
        assert_eq!(r.insert(4, b"EFGH").unwrap(), Vec::<u8>::new());
        assert_eq!(r.insert(6, b"GHIJ").unwrap(), Vec::<u8>::new());
        assert_eq!(r.insert(0, b"ABCD").unwrap(), b"ABCDEFGHIJ");
        assert_eq!(r.received(), 10);
        assert_eq!(r.buffered_bytes(), 0);
    }

    #[test]
    fn successor_fragment_fully_containing_a_predecessor_drops_it() {
        let mut r = Reassembler::new(1024);
        assert_eq!(r.insert(4, b"DE").unwrap(), Vec::<u8>::new());
        // offset=4 len=6 fully re-covers the earlier 2-byte fragment at the same start.
        assert_eq!(r.insert(4, b"DEFGHI").unwrap(), Vec::<u8>::new());
        assert_eq!(r.insert(0, b"ABCD").unwrap(), b"ABCDDEFGHI");
        assert_eq!(r.buffered_bytes(), 0);
    }

    #[test]
    fn overflow_is_rejected() {
        let mut r = Reassembler::new(4);
        r.insert(10, b"ABCD").unwrap();
        assert!(r.insert(20, b"EFGH").is_err());
    }
}
