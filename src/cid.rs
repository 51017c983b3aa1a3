//! Connection-ID lifecycle: the peer-issued CIDs this endpoint may use as a destination,
//! and the CIDs this endpoint has issued to the peer.

use std::collections::VecDeque;

use crate::packet::types::ConnectionId;
use crate::primitives::rand::random_connection_id_bytes;
use crate::result::{TransportError, TransportErrorCode};

/// One connection ID the peer told us (via the transport handshake or NEW_CONNECTION_ID)
/// we may address them with.
#[derive(Debug, Clone)]
pub struct PeerCidEntry {
    pub seq: u64,
    pub cid: ConnectionId,
    pub reset_token: Option<[u8; 16]>,
}

/// Tracks the set of CIDs the peer has handed us, in issuance order, and the highest
/// `retire_prior_to` value seen so far.
pub struct PeerCidSet {
    entries: VecDeque<PeerCidEntry>,
    max_retired_seqnum: u64,
    active_connection_id_limit: u64,
}

impl PeerCidSet {
    /// `first_scid` is the peer's SCID from its first Initial (seqnum 0, no reset token).
    pub fn new(first_scid: ConnectionId, active_connection_id_limit: u64) -> Self {
        let mut entries = VecDeque::new();
        entries.push_back(PeerCidEntry {
            seq: 0,
            cid: first_scid,
            reset_token: None,
        });
        Self {
            entries,
            max_retired_seqnum: 0,
            active_connection_id_limit,
        }
    }

    pub fn current(&self) -> &PeerCidEntry {
        // Highest seqnum is used as the outbound DCID target.
        self.entries.back().expect("at least the seqnum-0 entry always present")
    }

    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    /// Handles a NEW_CONNECTION_ID frame from the peer.
    pub fn on_new_connection_id(
        &mut self,
        seq: u64,
        retire_prior_to: u64,
        cid: ConnectionId,
        reset_token: [u8; 16],
    ) -> Result<Vec<u64>, TransportError> {
        if let Some(existing) = self.entries.iter().find(|e| e.seq == seq) {
            let matches = existing.cid == cid && existing.reset_token == Some(reset_token);
            if !matches {
                return Err(TransportError::new(
                    TransportErrorCode::ProtocolViolation,
                    "NEW_CONNECTION_ID reused a seqnum with different contents",
                ));
            }
            return Ok(Vec::new());
        }

        if seq >= self.max_retired_seqnum {
            self.entries.push_back(PeerCidEntry {
                seq,
                cid,
                reset_token: Some(reset_token),
            });
        }

        let retired = self.apply_retire_prior_to(retire_prior_to);

        if self.active_count() as u64 > self.active_connection_id_limit {
            return Err(TransportError::new(
                TransportErrorCode::ConnectionIdLimitError,
                "peer issued more active connection IDs than the advertised limit",
            ));
        }

        Ok(retired)
    }

    /// Retires all entries with `seq < retire_prior_to`; returns their seqnums so the
    /// caller can emit RETIRE_CONNECTION_ID for each.
    fn apply_retire_prior_to(&mut self, retire_prior_to: u64) -> Vec<u64> {
        if retire_prior_to <= self.max_retired_seqnum {
            return Vec::new();
        }
        self.max_retired_seqnum = retire_prior_to;
        let mut retired = Vec::new();
        self.entries.retain(|entry| {
            if entry.seq < retire_prior_to {
                retired.push(entry.seq);
                false
            } else {
                true
            }
        });
        retired
    }

    /// Checks an inbound short-header DCID (or any datagram tail) against every known
    /// stateless-reset token, constant-time.
    pub fn matches_reset_token(&self, candidate: &[u8]) -> bool {
        self.entries.iter().any(|e| {
            e.reset_token
                .map(|token| constant_time_eq(&token, candidate))
                .unwrap_or(false)
        })
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (&x, &y)| acc | (x ^ y)) == 0
}

/// One connection ID this endpoint has issued to the peer (the mirror of [`PeerCidEntry`]).
#[derive(Debug, Clone)]
pub struct IssuedCidEntry {
    pub seq: u64,
    pub cid: ConnectionId,
    pub reset_token: [u8; 16],
}

/// Tracks the CIDs this endpoint has issued, so RETIRE_CONNECTION_ID from the peer can be
/// matched and a replacement issued.
pub struct IssuedCidSet {
    entries: Vec<IssuedCidEntry>,
    next_seq: u64,
    cid_len: usize,
}

impl IssuedCidSet {
    pub fn new(cid_len: usize) -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
            cid_len,
        }
    }

    /// Issues `original_dcid` as seqnum-0 without generating fresh randomness for it (the
    /// server's first DCID is chosen once, during connection creation, not here).
    pub fn seed_first(&mut self, cid: ConnectionId, reset_token: impl Fn(&ConnectionId) -> [u8; 16]) {
        let token = reset_token(&cid);
        self.entries.push(IssuedCidEntry { seq: 0, cid, reset_token: token });
        self.next_seq = 1;
    }

    /// Generates and records a new CID, returning the frame fields the caller should
    /// enqueue as NEW_CONNECTION_ID.
    pub fn issue(&mut self, reset_token: impl Fn(&ConnectionId) -> [u8; 16]) -> IssuedCidEntry {
        let seq = self.next_seq;
        self.next_seq += 1;
        let cid = ConnectionId::new(random_connection_id_bytes(self.cid_len));
        let token = reset_token(&cid);
        let entry = IssuedCidEntry { seq, cid, reset_token: token };
        self.entries.push(entry.clone());
        entry
    }

    /// Retires the entry named by `seq`. Returns `true` if it was present (and thus a
    /// replacement should be issued to keep the peer's limit budget full).
    pub fn retire(&mut self, seq: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.seq != seq);
        self.entries.len() != before
    }

    /// Whether `bytes` names one of the CIDs this endpoint has issued and not yet retired.
    pub fn contains(&self, bytes: &[u8]) -> bool {
        self.entries.iter().any(|e| e.cid.as_slice() == bytes)
    }

    /// The most recently issued, still-active CID, as raw bytes for DCID comparison against
    /// an inbound packet.
    pub fn current_bytes(&self) -> &[u8] {
        self.entries
            .last()
            .map(|e| e.cid.as_slice())
            .unwrap_or(&[])
    }

    /// The CID this endpoint should use as its outbound SCID (spec.md §4.11: "the CID with
    /// the highest seqnum").
    pub fn current(&self) -> &ConnectionId {
        &self.entries.last().expect("seqnum-0 entry always seeded before use").cid
    }

    /// Every CID this endpoint has issued and not yet retired, for the dispatcher's
    /// DCID-to-connection routing table.
    pub fn iter(&self) -> impl Iterator<Item = &ConnectionId> {
        self.entries.iter().map(|e| &e.cid)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cid(b: u8) -> ConnectionId {
        ConnectionId::from_slice(&[b; 8])
    }

    #[test]
    fn new_connection_id_adds_entry() {
        let mut set = PeerCidSet::new(cid(0), 4);
        let retired = set.on_new_connection_id(1, 0, cid(1), [7; 16]).unwrap();
        assert!(retired.is_empty());
        assert_eq!(set.active_count(), 2);
        assert_eq!(set.current().seq, 1);
    }

    #[test]
    fn duplicate_seq_with_mismatched_payload_is_protocol_violation() {
        let mut set = PeerCidSet::new(cid(0), 4);
        set.on_new_connection_id(1, 0, cid(1), [7; 16]).unwrap();
        let err = set.on_new_connection_id(1, 0, cid(2), [7; 16]).unwrap_err();
        assert_eq!(err.code, TransportErrorCode::ProtocolViolation);
    }

    #[test]
    fn retire_prior_to_removes_older_entries() {
        let mut set = PeerCidSet::new(cid(0), 4);
        set.on_new_connection_id(1, 0, cid(1), [7; 16]).unwrap();
        set.on_new_connection_id(2, 0, cid(2), [8; 16]).unwrap();
        let retired = set.on_new_connection_id(3, 2, cid(3), [9; 16]).unwrap();
        assert_eq!(retired, vec![0, 1]);
        assert_eq!(set.active_count(), 2);
    }

    #[test]
    fn exceeding_active_limit_errors() {
        let mut set = PeerCidSet::new(cid(0), 1);
        let err = set.on_new_connection_id(1, 0, cid(1), [7; 16]).unwrap_err();
        assert_eq!(err.code, TransportErrorCode::ConnectionIdLimitError);
    }

    #[test]
    fn reset_token_matches_constant_time() {
        let mut set = PeerCidSet::new(cid(0), 4);
        set.on_new_connection_id(1, 0, cid(1), [0x42; 16]).unwrap();
        assert!(set.matches_reset_token(&[0x42; 16]));
        assert!(!set.matches_reset_token(&[0x43; 16]));
    }

    #[test]
    fn issued_set_retire_reports_presence() {
        let mut issued = IssuedCidSet::new(8);
        let entry = issued.issue(|_| [1; 16]);
        assert!(issued.retire(entry.seq));
        assert!(!issued.retire(entry.seq));
    }
}
