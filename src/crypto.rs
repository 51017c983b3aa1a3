//! The crypto/AEAD/TLS trait boundary.
//!
//! This engine does not implement AEAD, HPKE, or TLS 1.3 itself (spec.md §1 scopes them out
//! as external collaborators); it depends only on these traits, the way `quinn-proto`
//! parameterizes `Connection<S: crypto::Session>` over a pluggable crypto backend. A real
//! deployment plugs in `rustls`/`ring` (or similar); tests here exercise an in-memory
//! fixture implementation instead.

use std::fmt;

use crate::packet::types::PacketNumber;

/// Which of the three packet-number spaces (plus 0-RTT, sharing Application's space) a set
/// of keys belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Initial,
    Handshake,
    ZeroRtt,
    Application,
}

/// A sealed packet payload: AEAD-protected bytes plus whatever the AEAD needs to open them.
pub struct Sealed {
    pub payload: Vec<u8>,
}

/// An AEAD key pair for one direction (send or receive) at one encryption level.
pub trait PacketKey: Send + Sync + fmt::Debug {
    /// Overhead, in bytes, the AEAD tag adds to a sealed payload.
    fn tag_len(&self) -> usize;

    /// Encrypts `plaintext` in place into a sealed payload, authenticating `header` as
    /// associated data and using `packet_number` to derive the nonce.
    fn seal(&self, packet_number: PacketNumber, header: &[u8], plaintext: &[u8]) -> Sealed;

    /// Decrypts `payload`, authenticating `header`, returning the plaintext or `None` on
    /// AEAD failure. A failed open must not be treated as a fatal connection error (spec.md
    /// §4.2): the caller drops the packet and keeps going.
    fn open(&self, packet_number: PacketNumber, header: &[u8], payload: &[u8]) -> Option<Vec<u8>>;
}

/// Header-protection key: masks (and unmasks) the low bits of the first byte and the
/// truncated packet number, given a sample of the protected payload.
pub trait HeaderKey: Send + Sync + fmt::Debug {
    /// Length of the sample drawn from the payload to generate the mask.
    fn sample_len(&self) -> usize;

    /// Returns the 5-byte mask (1 for the first-byte low bits, 4 for the packet number).
    fn mask(&self, sample: &[u8]) -> [u8; 5];
}

/// The read/write key pair (packet + header protection) installed at one encryption level.
pub struct Keys {
    pub local_packet: Box<dyn PacketKey>,
    pub local_header: Box<dyn HeaderKey>,
    pub remote_packet: Box<dyn PacketKey>,
    pub remote_header: Box<dyn HeaderKey>,
}

/// A keyed PRF used for stateless-reset tokens and retry/new-token integrity.
pub trait HmacKey: Send + Sync {
    fn sign(&self, data: &[u8]) -> Vec<u8>;
}

/// AEAD used to seal/open Retry tokens and NEW_TOKEN payloads, mirroring
/// `quinn_proto::crypto::HandshakeTokenKey`.
pub trait HandshakeTokenKey: Send + Sync {
    fn aead_from_hkdf(&self, random_bytes: &[u8]) -> Box<dyn PacketKey>;
}

/// Outcome of driving the TLS state machine one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// More input is needed before the provider can produce anything further.
    NeedInput,
    /// The provider produced outbound bytes or installed a key; keep stepping.
    Progress,
    /// The handshake has completed.
    Done,
}

/// The pluggable TLS 1.3 state machine.
///
/// A real implementation wraps `rustls::quic`; tests use an in-memory fixture that shuttles
/// bytes between two `Session`s directly.
pub trait Session: Send {
    /// Derives and installs the Initial encryption level's keys from `dcid` (RFC 9001 §5.2).
    /// Called once, immediately after construction, before the handshake is driven at all —
    /// mirroring how `rustls::quic::Connection::new` takes the original DCID and has Initial
    /// secrets ready before the caller ever calls `do_handshake`.
    fn install_initial_keys(&mut self, dcid: &[u8]);

    fn is_handshaking(&self) -> bool;

    /// Feeds received CRYPTO-stream bytes at `level` to the provider.
    fn read_handshake(&mut self, level: Level, data: &[u8]);

    /// Drains any handshake bytes the provider wants sent at `level`, alongside the secrets
    /// installed so far.
    fn write_handshake(&mut self, buf: &mut Vec<u8>) -> Option<Level>;

    fn step(&mut self) -> HandshakeStep;

    /// Takes the read/write key pair installed for `level` since the last call, if any.
    /// The connection engine polls this after every [`Session::step`] that reports
    /// progress, the way it would pull freshly derived secrets out of a `rustls::quic`
    /// session.
    fn take_keys(&mut self, level: Level) -> Option<Keys>;

    /// `None` until the provider has negotiated an ALPN value.
    fn alpn_protocol(&self) -> Option<&[u8]>;

    fn transport_parameters(&self) -> Option<&[u8]>;

    /// Sets the local transport parameters the provider should carry in its handshake
    /// messages.
    fn set_transport_parameters(&mut self, params: &[u8]);
}

#[cfg(test)]
pub mod fixture {
    //! An in-memory, non-cryptographic stand-in for AEAD/header-protection, used only by
    //! this crate's own tests. XORs with a fixed per-key byte instead of running a real
    //! cipher; good enough to exercise the seal/open and mask/unmask call shape.
    use super::*;

    #[derive(Debug)]
    pub struct XorPacketKey(pub u8);

    impl PacketKey for XorPacketKey {
        fn tag_len(&self) -> usize {
            16
        }

        fn seal(&self, _packet_number: PacketNumber, _header: &[u8], plaintext: &[u8]) -> Sealed {
            let mut payload: Vec<u8> = plaintext.iter().map(|b| b ^ self.0).collect();
            payload.extend(std::iter::repeat(0xAA).take(self.tag_len()));
            Sealed { payload }
        }

        fn open(&self, _packet_number: PacketNumber, _header: &[u8], payload: &[u8]) -> Option<Vec<u8>> {
            if payload.len() < self.tag_len() {
                return None;
            }
            let (body, tag) = payload.split_at(payload.len() - self.tag_len());
            if tag.iter().any(|&b| b != 0xAA) {
                return None;
            }
            Some(body.iter().map(|b| b ^ self.0).collect())
        }
    }

    #[derive(Debug)]
    pub struct XorHeaderKey(pub u8);

    impl HeaderKey for XorHeaderKey {
        fn sample_len(&self) -> usize {
            16
        }

        fn mask(&self, _sample: &[u8]) -> [u8; 5] {
            [self.0; 5]
        }
    }

    #[test]
    fn xor_packet_key_round_trips() {
        let key = XorPacketKey(0x42);
        let sealed = key.seal(PacketNumber::new(1), b"header", b"hello world");
        let opened = key.open(PacketNumber::new(1), b"header", &sealed.payload).unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn xor_packet_key_rejects_corrupted_tag() {
        let key = XorPacketKey(0x42);
        let mut sealed = key.seal(PacketNumber::new(1), b"header", b"hello world");
        *sealed.payload.last_mut().unwrap() ^= 0xFF;
        assert!(key.open(PacketNumber::new(1), b"header", &sealed.payload).is_none());
    }
}
