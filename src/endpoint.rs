//! The endpoint dispatcher: owns the UDP socket and the DCID-to-connection routing table,
//! and is the only thing in this crate that actually calls `.await` on I/O. Connections
//! themselves are synchronous and socket-free; this module is the thin `tokio`-based shell
//! they are embedded in, the way `quinn` relates to `quinn-proto`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::config::{EndpointConfig, ServerConfig};
use crate::connection::{Connection, Transmit};
use crate::crypto::Session;
use crate::packet::header::Header;
use crate::packet::packet::{Packet, MIN_PACKET_LEN};
use crate::packet::types::ConnectionId;
use crate::primitives::rand::random_connection_id_bytes;
use crate::token;

/// Largest UDP datagram this endpoint will ever send unsolicited (Initial padding ceiling).
const MAX_DATAGRAM_SIZE: usize = 1200;
/// Stateless reset floor: random prefix + 16-byte token must total at least this many bytes,
/// else the datagram would be distinguishable from a normal short header.
const MIN_STATELESS_RESET_SIZE: usize = 43;

/// A `(bytes, destination)` pair the caller's socket should send. [`Connection::poll_transmit`]
/// only carries payload bytes because a connection does not know its own peer address; the
/// dispatcher is what remembers it.
pub struct Datagram {
    pub payload: Vec<u8>,
    pub destination: SocketAddr,
}

struct ConnectionSlot {
    connection: Connection,
    peer_addr: SocketAddr,
}

/// Demultiplexes inbound datagrams to connections by DCID, creates connections for
/// admissible unknown Initial packets, and emits Version Negotiation, Retry, and Stateless
/// Reset on the dispatcher's own behalf.
pub struct Endpoint {
    socket: UdpSocket,
    endpoint_config: Arc<EndpointConfig>,
    server_config: Arc<ServerConfig>,
    new_session: Arc<dyn Fn() -> Box<dyn Session> + Send + Sync>,
    /// Connections keyed by an opaque handle; looked up indirectly through `routes` so a
    /// connection can be reachable by more than one CID at once.
    connections: HashMap<u64, ConnectionSlot>,
    routes: HashMap<Vec<u8>, u64>,
    next_handle: u64,
    started_at: Instant,
}

impl Endpoint {
    pub fn new(
        socket: UdpSocket,
        endpoint_config: Arc<EndpointConfig>,
        server_config: Arc<ServerConfig>,
        new_session: Arc<dyn Fn() -> Box<dyn Session> + Send + Sync>,
    ) -> Self {
        Self {
            socket,
            endpoint_config,
            server_config,
            new_session,
            connections: HashMap::new(),
            routes: HashMap::new(),
            next_handle: 0,
            started_at: Instant::now(),
        }
    }

    fn now_millis(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// Drives the endpoint until the socket errors. Every tick: drain one inbound datagram
    /// (or time out), flush whatever each touched connection now wants to send, and retire
    /// any connection whose timers have fired or which has gone fully closed.
    pub async fn run(mut self) -> std::io::Result<()> {
        let mut buf = vec![0u8; 65535];
        loop {
            let sleep = tokio::time::sleep(self.next_tick_interval());
            tokio::select! {
                readable = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = readable?;
                    let now = self.now_millis();
                    let outgoing = self.on_datagram(&buf[..len], peer, now);
                    for datagram in outgoing {
                        if let Err(err) = self.socket.send_to(&datagram.payload, datagram.destination).await {
                            warn!(?err, "dispatcher send failed");
                        }
                    }
                }
                _ = sleep => {
                    let now = self.now_millis();
                    let outgoing = self.drive_timers(now);
                    for datagram in outgoing {
                        if let Err(err) = self.socket.send_to(&datagram.payload, datagram.destination).await {
                            warn!(?err, "dispatcher send failed");
                        }
                    }
                }
            }
            self.reap_closed();
        }
    }

    fn next_tick_interval(&self) -> std::time::Duration {
        let now = self.now_millis();
        let earliest = self
            .connections
            .values()
            .filter_map(|slot| slot.connection.poll_timeout(now))
            .min();
        match earliest {
            Some(deadline) => std::time::Duration::from_millis(deadline.saturating_sub(now)),
            None => std::time::Duration::from_millis(100),
        }
    }

    fn drive_timers(&mut self, now: u64) -> Vec<Datagram> {
        let due: Vec<u64> = self
            .connections
            .iter()
            .filter(|(_, slot)| slot.connection.poll_timeout(now).is_some_and(|d| d <= now))
            .map(|(handle, _)| *handle)
            .collect();
        let mut out = Vec::new();
        for handle in due {
            if let Some(slot) = self.connections.get_mut(&handle) {
                slot.connection.on_timeout(now);
            }
            out.extend(self.drain_transmits(handle, now));
        }
        out
    }

    fn reap_closed(&mut self) {
        let closed: Vec<u64> = self
            .connections
            .iter()
            .filter(|(_, slot)| slot.connection.is_closed())
            .map(|(handle, _)| *handle)
            .collect();
        for handle in closed {
            self.connections.remove(&handle);
            self.routes.retain(|_, h| *h != handle);
            trace!(handle, "connection reaped");
        }
    }

    /// Processes one inbound UDP datagram, returning whatever the dispatcher and/or the
    /// routed connection now want sent in response.
    pub fn on_datagram(&mut self, datagram: &[u8], peer: SocketAddr, now_millis: u64) -> Vec<Datagram> {
        if datagram.len() < MIN_PACKET_LEN {
            trace!(len = datagram.len(), "datagram below minimum packet size, dropping");
            return Vec::new();
        }

        if let Some(handle) = self.route(datagram) {
            if let Some(slot) = self.connections.get_mut(&handle) {
                slot.connection.handle_datagram(datagram, now_millis);
                return self.drain_transmits(handle, now_millis);
            }
        }

        let is_long = datagram[0] & 0x80 != 0;
        if !is_long {
            return self.on_unroutable_short_header(datagram, peer);
        }

        self.on_unknown_long_header(datagram, peer, now_millis)
    }

    /// Finds the connection (if any) whose set of active local CIDs contains this
    /// datagram's DCID.
    fn route(&self, datagram: &[u8]) -> Option<u64> {
        let is_long = datagram[0] & 0x80 != 0;
        let dcid_len = if is_long {
            *datagram.get(5)? as usize
        } else {
            self.endpoint_config.local_cid_len
        };
        let dcid = if is_long {
            datagram.get(6..6 + dcid_len)?
        } else {
            datagram.get(1..1 + dcid_len)?
        };
        self.routes.get(dcid).copied()
    }

    /// A short-header datagram that matched no known connection: either a genuine stateless
    /// reset from a peer that lost state for a connection we still track, or noise to drop.
    fn on_unroutable_short_header(&mut self, datagram: &[u8], _peer: SocketAddr) -> Vec<Datagram> {
        for slot in self.connections.values_mut() {
            if slot.connection.matches_stateless_reset(datagram) {
                debug!("stateless reset token matched, entering draining");
                slot.connection.on_stateless_reset(self.now_millis());
                return Vec::new();
            }
        }

        if datagram.len() < MIN_STATELESS_RESET_SIZE {
            return Vec::new();
        }
        vec![Datagram {
            payload: self.build_stateless_reset(datagram),
            destination: _peer,
        }]
    }

    fn build_stateless_reset(&self, received: &[u8]) -> Vec<u8> {
        let dcid_len = self.endpoint_config.local_cid_len.min(received.len().saturating_sub(1));
        let dcid = &received[1..1 + dcid_len];
        let token = crate::connection::stateless_reset_token(self.endpoint_config.reset_key.as_ref(), &ConnectionId::from_slice(dcid));

        let total_len = (3 * received.len()).min(MAX_DATAGRAM_SIZE).max(MIN_STATELESS_RESET_SIZE);
        let mut packet = vec![0u8; total_len];
        crate::primitives::rand::fill_random(&mut packet);
        packet[0] = (packet[0] & !0x80) | 0x40;
        let token_at = total_len - 16;
        packet[token_at..].copy_from_slice(&token);
        packet
    }

    /// A long-header datagram addressed to a DCID this endpoint does not recognize: only
    /// Initial packets are admissible here; everything else (0-RTT with no
    /// matching connection, Handshake, Retry, Version Negotiate) is dropped.
    fn on_unknown_long_header(&mut self, datagram: &[u8], peer: SocketAddr, now_millis: u64) -> Vec<Datagram> {
        let (packet, _rest) = match Packet::decode(datagram, self.endpoint_config.local_cid_len) {
            Ok(p) => p,
            Err(_) => return Vec::new(),
        };

        let Header::Initial {
            version,
            dst_cid,
            src_cid,
            token: client_token,
            ..
        } = &packet.header
        else {
            trace!("non-Initial long header for unknown connection, dropping");
            return Vec::new();
        };

        if !self.endpoint_config.supported_versions.contains(version) {
            return vec![Datagram {
                payload: self.build_version_negotiation(dst_cid, src_cid),
                destination: peer,
            }];
        }

        if dst_cid.len() < 8 {
            trace!("client Initial DCID shorter than 8 bytes, dropping");
            return Vec::new();
        }

        let (original_dcid, retry_scid) = if client_token.is_empty() {
            if self.server_config.retry {
                let retry_scid = ConnectionId::new(random_connection_id_bytes(self.endpoint_config.local_cid_len));
                let sealed = token::seal(self.server_config.token_key.as_ref(), peer, dst_cid);
                return vec![Datagram {
                    payload: self.build_retry(*version, src_cid, dst_cid, &retry_scid, &sealed),
                    destination: peer,
                }];
            }
            (dst_cid.clone(), None)
        } else {
            match token::open(
                self.server_config.token_key.as_ref(),
                client_token,
                peer,
                self.server_config.retry_token_lifetime,
            ) {
                Ok(odcid) => (odcid, Some(dst_cid.clone())),
                Err(err) => {
                    debug!(?err, "rejecting Initial with invalid retry token");
                    return Vec::new();
                }
            }
        };

        // When this Initial followed a Retry, the client is addressing the SCID we handed it
        // in the Retry packet; seed-first must reuse that exact CID or the connection's own
        // DCID-match check (connection::connection::process_one_packet) drops this datagram.
        let server_dcid = match &retry_scid {
            Some(scid) => scid.clone(),
            None => ConnectionId::new(random_connection_id_bytes(self.endpoint_config.local_cid_len)),
        };
        let mut connection = Connection::accept(
            *version,
            original_dcid,
            src_cid.clone(),
            server_dcid,
            retry_scid,
            &self.endpoint_config,
            self.server_config.clone(),
            (self.new_session)(),
            now_millis,
        );
        connection.handle_datagram(datagram, now_millis);

        let handle = self.next_handle;
        self.next_handle += 1;
        for cid in connection.local_connection_ids() {
            self.routes.insert(cid.as_slice().to_vec(), handle);
        }
        self.connections.insert(handle, ConnectionSlot { connection, peer_addr: peer });

        debug!(handle, ?peer, "accepted new connection");
        self.drain_transmits(handle, now_millis)
    }

    fn build_version_negotiation(&self, client_scid: &ConnectionId, client_dcid: &ConnectionId) -> Vec<u8> {
        Header::VersionNegotiate {
            dst_cid: client_dcid.clone(),
            src_cid: client_scid.clone(),
            supported_versions: self.endpoint_config.supported_versions.clone(),
        }
        .encode()
    }

    fn build_retry(
        &self,
        version: u32,
        client_scid: &ConnectionId,
        client_dcid: &ConnectionId,
        retry_scid: &ConnectionId,
        token: &[u8],
    ) -> Vec<u8> {
        Header::Retry {
            version,
            dst_cid: client_scid.clone(),
            src_cid: retry_scid.clone(),
            retry_token: token.to_vec(),
        }
        .encode()
    }

    /// Pulls every pending `Transmit` off a connection and pairs it with the peer address
    /// the dispatcher remembers for it, re-registering any CIDs the connection issued since
    /// the last drain.
    fn drain_transmits(&mut self, handle: u64, now_millis: u64) -> Vec<Datagram> {
        let Some(slot) = self.connections.get_mut(&handle) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while let Some(Transmit { payload }) = slot.connection.poll_transmit(now_millis) {
            out.push(Datagram {
                payload,
                destination: slot.peer_addr,
            });
        }
        for cid in slot.connection.local_connection_ids() {
            self.routes.entry(cid.as_slice().to_vec()).or_insert(handle);
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::TransportConfig;
    use crate::crypto::{self, fixture::{XorHeaderKey, XorPacketKey}, HandshakeStep, HandshakeTokenKey, HmacKey, Keys, PacketKey};
    use std::sync::Arc;

    struct TestHmac;
    impl HmacKey for TestHmac {
        fn sign(&self, data: &[u8]) -> Vec<u8> {
            data.iter().map(|b| b ^ 0x5a).collect()
        }
    }

    struct TestTokenKey;
    impl HandshakeTokenKey for TestTokenKey {
        fn aead_from_hkdf(&self, random_bytes: &[u8]) -> Box<dyn PacketKey> {
            Box::new(XorPacketKey(random_bytes.first().copied().unwrap_or(0)))
        }
    }

    struct TestSession {
        initial_keys: Option<Keys>,
    }
    impl Session for TestSession {
        fn install_initial_keys(&mut self, dcid: &[u8]) {
            let tag = dcid.first().copied().unwrap_or(0);
            self.initial_keys = Some(Keys {
                local_packet: Box::new(XorPacketKey(tag)),
                local_header: Box::new(XorHeaderKey(tag)),
                remote_packet: Box::new(XorPacketKey(tag)),
                remote_header: Box::new(XorHeaderKey(tag)),
            });
        }
        fn is_handshaking(&self) -> bool {
            true
        }
        fn read_handshake(&mut self, _level: crypto::Level, _data: &[u8]) {}
        fn write_handshake(&mut self, _buf: &mut Vec<u8>) -> Option<crypto::Level> {
            None
        }
        fn step(&mut self) -> HandshakeStep {
            HandshakeStep::NeedInput
        }
        fn take_keys(&mut self, level: crypto::Level) -> Option<Keys> {
            if level == crypto::Level::Initial {
                self.initial_keys.take()
            } else {
                None
            }
        }
        fn alpn_protocol(&self) -> Option<&[u8]> {
            None
        }
        fn transport_parameters(&self) -> Option<&[u8]> {
            None
        }
        fn set_transport_parameters(&mut self, _params: &[u8]) {}
    }

    fn test_endpoint_config() -> Arc<EndpointConfig> {
        Arc::new(EndpointConfig::new(Arc::new(TestHmac)))
    }

    fn test_server_config(retry: bool) -> Arc<ServerConfig> {
        let mut config = ServerConfig::new(Arc::new(TestTokenKey));
        config.transport_config(Arc::new(TransportConfig::default()));
        config.retry(retry);
        Arc::new(config)
    }

    fn client_initial(dcid: &[u8], scid: &[u8], token: Vec<u8>) -> Vec<u8> {
        let payload = vec![0u8; 40];
        Header::Initial {
            version: 1,
            dst_cid: ConnectionId::from_slice(dcid),
            src_cid: ConnectionId::from_slice(scid),
            token,
            length: (payload.len() + 2) as u64,
            packet_number: vec![0, 1],
        }
        .encode()
        .into_iter()
        .chain(payload)
        .collect()
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:55555".parse().unwrap()
    }

    async fn test_endpoint(retry: bool) -> Endpoint {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Endpoint::new(
            socket,
            test_endpoint_config(),
            test_server_config(retry),
            Arc::new(|| Box::new(TestSession { initial_keys: None }) as Box<dyn Session>),
        )
    }

    #[tokio::test]
    async fn unknown_initial_without_retry_creates_a_connection() {
        let mut endpoint = test_endpoint(false).await;
        let dcid = [1u8; 8];
        let datagram = client_initial(&dcid, &[2u8; 8], Vec::new());
        let out = endpoint.on_datagram(&datagram, peer(), 0);
        assert!(out.is_empty() || out.iter().all(|d| !d.payload.is_empty()));
        assert_eq!(endpoint.connections.len(), 1);
        assert!(endpoint.routes.contains_key(dcid.as_slice()));
    }

    #[tokio::test]
    async fn unknown_initial_with_retry_required_emits_retry_and_no_connection() {
        let mut endpoint = test_endpoint(true).await;
        let dcid = [3u8; 8];
        let datagram = client_initial(&dcid, &[4u8; 8], Vec::new());
        let out = endpoint.on_datagram(&datagram, peer(), 0);
        assert_eq!(out.len(), 1);
        assert!(endpoint.connections.is_empty());

        let mut cursor = out[0].payload.as_slice();
        let header = Header::decode(&mut cursor, 0).unwrap();
        assert!(matches!(header, Header::Retry { .. }));
    }

    #[tokio::test]
    async fn retry_token_round_trip_admits_the_retried_initial() {
        let mut endpoint = test_endpoint(true).await;
        let dcid = [5u8; 8];
        let first = client_initial(&dcid, &[6u8; 8], Vec::new());
        let retry_out = endpoint.on_datagram(&first, peer(), 0);
        let mut cursor = retry_out[0].payload.as_slice();
        let Header::Retry { src_cid: retry_scid, .. } = Header::decode(&mut cursor, 0).unwrap() else {
            panic!("expected Retry header");
        };

        let token = token::seal(endpoint.server_config.token_key.as_ref(), peer(), &ConnectionId::from_slice(&dcid));
        let second = client_initial(retry_scid.as_slice(), &[6u8; 8], token);
        let out = endpoint.on_datagram(&second, peer(), 1);
        assert_eq!(endpoint.connections.len(), 1);
        let _ = out;
    }

    #[tokio::test]
    async fn unsupported_version_gets_version_negotiation() {
        let mut endpoint = test_endpoint(false).await;
        let datagram = Header::Initial {
            version: 0xdead_beef,
            dst_cid: ConnectionId::from_slice(&[7u8; 8]),
            src_cid: ConnectionId::from_slice(&[8u8; 8]),
            token: Vec::new(),
            length: 42,
            packet_number: vec![0, 1],
        }
        .encode()
        .into_iter()
        .chain(vec![0u8; 40])
        .collect::<Vec<u8>>();

        let out = endpoint.on_datagram(&datagram, peer(), 0);
        assert_eq!(out.len(), 1);
        let mut cursor = out[0].payload.as_slice();
        let header = Header::decode(&mut cursor, 0).unwrap();
        assert!(matches!(header, Header::VersionNegotiate { .. }));
    }

    #[tokio::test]
    async fn short_datagram_below_minimum_is_dropped() {
        let mut endpoint = test_endpoint(false).await;
        let out = endpoint.on_datagram(&[0u8; 10], peer(), 0);
        assert!(out.is_empty());
    }
}
