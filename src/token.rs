//! Retry token and NEW_TOKEN sealing.
//!
//! Both share one envelope: a random IV, an AEAD-sealed body of `client_address || issued_at
//! || odcid`, keyed off the endpoint's `token_key` via the pluggable `crypto::HandshakeTokenKey`
//! trait (so, like the packet-protection AEAD, the concrete cipher stays an external
//! collaborator; `quinn_proto::crypto::HandshakeTokenKey` draws the same boundary).

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::crypto::HandshakeTokenKey;
use crate::packet::types::ConnectionId;
use crate::primitives::rand::fill_random;

const IV_LEN: usize = 16;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("token failed AEAD authentication")]
    Invalid,
    #[error("token payload malformed")]
    Malformed,
    #[error("token has expired")]
    Expired,
}

struct Payload {
    addr: SocketAddr,
    issued_at: u64,
    odcid: ConnectionId,
}

impl Payload {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self.addr {
            SocketAddr::V4(a) => {
                buf.push(4);
                buf.extend_from_slice(&a.ip().octets());
                buf.extend_from_slice(&a.port().to_be_bytes());
            }
            SocketAddr::V6(a) => {
                buf.push(6);
                buf.extend_from_slice(&a.ip().octets());
                buf.extend_from_slice(&a.port().to_be_bytes());
            }
        }
        buf.extend_from_slice(&self.issued_at.to_be_bytes());
        buf.push(self.odcid.len() as u8);
        buf.extend_from_slice(self.odcid.as_slice());
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self, TokenError> {
        let (&family, rest) = bytes.split_first().ok_or(TokenError::Malformed)?;
        let (addr, rest) = match family {
            4 => {
                if rest.len() < 6 {
                    return Err(TokenError::Malformed);
                }
                let (ip, rest) = rest.split_at(4);
                let (port, rest) = rest.split_at(2);
                let ip: [u8; 4] = ip.try_into().unwrap();
                let port = u16::from_be_bytes(port.try_into().unwrap());
                (SocketAddr::from((ip, port)), rest)
            }
            6 => {
                if rest.len() < 18 {
                    return Err(TokenError::Malformed);
                }
                let (ip, rest) = rest.split_at(16);
                let (port, rest) = rest.split_at(2);
                let ip: [u8; 16] = ip.try_into().unwrap();
                let port = u16::from_be_bytes(port.try_into().unwrap());
                (SocketAddr::from((ip, port)), rest)
            }
            _ => return Err(TokenError::Malformed),
        };

        if rest.len() < 8 {
            return Err(TokenError::Malformed);
        }
        let (issued_at, rest) = rest.split_at(8);
        let issued_at = u64::from_be_bytes(issued_at.try_into().unwrap());

        let (&odcid_len, rest) = rest.split_first().ok_or(TokenError::Malformed)?;
        if rest.len() != odcid_len as usize {
            return Err(TokenError::Malformed);
        }
        let odcid = ConnectionId::from_slice(rest);

        Ok(Self { addr, issued_at, odcid })
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Seals a client address + original DCID into an opaque token under `key`.
pub fn seal(key: &dyn HandshakeTokenKey, addr: SocketAddr, odcid: &ConnectionId) -> Vec<u8> {
    let mut iv = [0u8; IV_LEN];
    fill_random(&mut iv);
    let payload = Payload {
        addr,
        issued_at: now_secs(),
        odcid: odcid.clone(),
    };
    let aead = key.aead_from_hkdf(&iv);
    let sealed = aead.seal(
        crate::packet::types::PacketNumber::new(0),
        &iv,
        &payload.encode(),
    );
    let mut token = Vec::with_capacity(IV_LEN + sealed.payload.len());
    token.extend_from_slice(&iv);
    token.extend_from_slice(&sealed.payload);
    token
}

/// Opens a token sealed by [`seal`], checking both AEAD integrity and `lifetime`. Returns
/// the original destination connection ID it was issued for.
pub fn open(
    key: &dyn HandshakeTokenKey,
    token: &[u8],
    addr: SocketAddr,
    lifetime: Duration,
) -> Result<ConnectionId, TokenError> {
    if token.len() < IV_LEN {
        return Err(TokenError::Malformed);
    }
    let (iv, body) = token.split_at(IV_LEN);
    let aead = key.aead_from_hkdf(iv);
    let plaintext = aead
        .open(crate::packet::types::PacketNumber::new(0), iv, body)
        .ok_or(TokenError::Invalid)?;

    let payload = Payload::decode(&plaintext)?;
    if payload.addr != addr {
        return Err(TokenError::Invalid);
    }

    let age = now_secs().saturating_sub(payload.issued_at);
    if age > lifetime.as_secs() {
        return Err(TokenError::Expired);
    }

    Ok(payload.odcid)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::fixture::XorPacketKey;
    use crate::crypto::PacketKey;

    struct FixtureTokenKey;

    impl HandshakeTokenKey for FixtureTokenKey {
        fn aead_from_hkdf(&self, random_bytes: &[u8]) -> Box<dyn PacketKey> {
            Box::new(XorPacketKey(random_bytes.first().copied().unwrap_or(0)))
        }
    }

    #[test]
    fn seal_then_open_round_trips() {
        let key = FixtureTokenKey;
        let addr: SocketAddr = "127.0.0.1:4433".parse().unwrap();
        let odcid = ConnectionId::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let token = seal(&key, addr, &odcid);
        let opened = open(&key, &token, addr, Duration::from_secs(10)).unwrap();
        assert_eq!(opened, odcid);
    }

    #[test]
    fn open_rejects_mismatched_address() {
        let key = FixtureTokenKey;
        let addr: SocketAddr = "127.0.0.1:4433".parse().unwrap();
        let other: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let odcid = ConnectionId::from_slice(&[9; 8]);
        let token = seal(&key, addr, &odcid);
        assert_eq!(open(&key, &token, other, Duration::from_secs(10)), Err(TokenError::Invalid));
    }

    #[test]
    fn open_rejects_expired_token() {
        let key = FixtureTokenKey;
        let addr: SocketAddr = "127.0.0.1:4433".parse().unwrap();
        let odcid = ConnectionId::from_slice(&[9; 8]);
        let token = seal(&key, addr, &odcid);
        assert_eq!(open(&key, &token, addr, Duration::from_secs(0)), Err(TokenError::Expired));
    }
}
