//! Randomness used for connection IDs, stateless-reset keys, and token IVs.
//!
//! Anything that needs to be unpredictable to an off-path attacker goes through the `rand`
//! crate's thread-local CSPRNG rather than a hand-rolled generator.

use rand::RngCore;

/// Fills `buf` with cryptographically-random bytes.
pub fn fill_random(buf: &mut [u8]) {
    rand::thread_rng().fill_bytes(buf);
}

/// Generates a random connection ID of the given length (0..=20, per RFC 9000 §17.2).
pub fn random_connection_id_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    fill_random(&mut bytes);
    bytes
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fills_requested_length() {
        let cid = random_connection_id_bytes(8);
        assert_eq!(cid.len(), 8);
    }

    #[test]
    fn zero_length_is_fine() {
        let cid = random_connection_id_bytes(0);
        assert!(cid.is_empty());
    }
}
