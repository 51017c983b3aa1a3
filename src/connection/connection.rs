//! The connection engine: receive/send pipelines, CRYPTO-driven handshake, stream and flow
//! control, loss recovery wiring, and closing/draining.
//!
//! This type owns no socket and no timer handle: it is fed datagrams and timer
//! fires by its caller and hands back `Transmit`s and a next-deadline to arm. The thin
//! `tokio`-based shell in `main.rs` is what actually calls `.await` on a `UdpSocket`.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::cid::{IssuedCidSet, PeerCidSet};
use crate::config::{EndpointConfig, ServerConfig, TransportConfig};
use crate::congestion::NewRenoController;
use crate::crypto::{self, HandshakeStep, Keys, Session};
use crate::packet::frame::{Direction as FrameDirection, EcnCounts, Frame, RetransmitPolicy};
use crate::packet::header::Header;
use crate::packet::packet::Packet;
use crate::packet::types::{ConnectionId, PacketNumber};
use crate::recovery::{self, RecoveryConfig, RttEstimator};
use crate::result::{require, ConnectionError, TransportError, TransportErrorCode};
use crate::space::{self, AckInsert, Level as SpaceLevel, PnSpace};
use crate::streams::reassembly::{Reassembler, ReassemblyOverflow};
use crate::streams::stream::{decode_stream_id, Initiator, StreamDir};
use crate::streams::table::StreamTable;
use crate::token;

use super::types::{ConnectionState, ErrorSlot, TransportParameters};

/// CRYPTO reassembly bound, taken directly from the original source's `NGX_QUIC_MAX_BUFFERED`.
const CRYPTO_MAX_BUFFERED: usize = 65_535;
/// Initial packets carrying ack-eliciting frames are padded to at least this size.
const MIN_INITIAL_SIZE: u64 = 1200;
/// Floor anti-amplification uses before any bytes have been received at all.
const MIN_PADDING_FLOOR: usize = 4;
/// Minimum spacing between repeated CONNECTION_CLOSE retransmissions while closing.
const CC_MIN_INTERVAL_MILLIS: u64 = 20;
/// 3x PTO close-timer multiplier.
const CLOSE_TIMER_PTO_MULTIPLIER: u64 = 3;

fn space_to_crypto_level(level: SpaceLevel) -> crypto::Level {
    match level {
        SpaceLevel::Initial => crypto::Level::Initial,
        SpaceLevel::Handshake => crypto::Level::Handshake,
        SpaceLevel::Application => crypto::Level::Application,
    }
}

/// One encryption level's full bookkeeping: packet-number space, installed keys, and (for
/// Initial/Handshake/Application) the CRYPTO-stream reassembly buffer.
struct LevelState {
    space: PnSpace,
    keys: Option<Keys>,
    crypto_recv: Reassembler,
    crypto_send_offset: u64,
    /// PN the receiver expects next, for truncated-PN reconstruction.
    expected_pn: u64,
    discarded: bool,
}

impl LevelState {
    fn new(level: SpaceLevel) -> Self {
        Self {
            space: PnSpace::new(level),
            keys: None,
            crypto_recv: Reassembler::new(CRYPTO_MAX_BUFFERED),
            crypto_send_offset: 0,
            expected_pn: 0,
            discarded: false,
        }
    }
}

/// A datagram ready to hand to the UDP sink.
pub struct Transmit {
    pub payload: Vec<u8>,
}

pub struct Connection {
    state: ConnectionState,
    version: u32,

    transport_config: Arc<TransportConfig>,
    server_config: Arc<ServerConfig>,

    tls: Box<dyn Session>,

    original_dcid: ConnectionId,
    retry_scid: Option<ConnectionId>,
    local_cids: IssuedCidSet,
    reset_key: Arc<dyn crate::crypto::HmacKey>,
    peer_cids: PeerCidSet,

    local_params: TransportParameters,
    peer_params: Option<TransportParameters>,

    initial: Option<LevelState>,
    handshake: Option<LevelState>,
    application: LevelState,

    streams: StreamTable,
    /// Peer's MAX_DATA grant to us (our send credit).
    conn_send_max_data: u64,
    conn_sent_data: u64,
    send_flow_blocked: bool,
    /// Our own advertised MAX_DATA (their send credit on us).
    conn_recv_max_data: u64,
    conn_received_data: u64,

    rtt: RttEstimator,
    recovery_config: RecoveryConfig,
    congestion: NewRenoController,
    pto_count: u32,
    handshake_confirmed: bool,

    last_activity_millis: u64,
    closing_since_millis: Option<u64>,
    last_close_sent_millis: Option<u64>,

    error: Option<ErrorSlot>,
    draining_is_reset: bool,

    validated_path: bool,
    anti_amplification_received: u64,
    anti_amplification_sent: u64,

    path_challenge_outstanding: Option<[u8; 8]>,
}

impl Connection {
    /// Accepts a new server connection. Called once the caller (the endpoint dispatcher,
    /// spec.md §4.3) has already decided this Initial is admissible (DCID length checked,
    /// retry validated if required).
    pub fn accept(
        version: u32,
        original_dcid: ConnectionId,
        peer_scid: ConnectionId,
        server_dcid: ConnectionId,
        retry_scid: Option<ConnectionId>,
        endpoint: &EndpointConfig,
        server_config: Arc<ServerConfig>,
        mut tls: Box<dyn Session>,
        now_millis: u64,
    ) -> Self {
        let transport_config = server_config.transport.clone();
        let mut local_params = TransportParameters::from_config(&transport_config);
        local_params.initial_source_connection_id = Some(server_dcid.clone());
        local_params.original_destination_connection_id = Some(original_dcid.clone());
        local_params.retry_source_connection_id = retry_scid.clone();

        let mut local_cids = IssuedCidSet::new(endpoint.local_cid_len);
        let reset_key = endpoint.reset_key.clone();
        local_cids.seed_first(server_dcid, |cid| stateless_reset_token(reset_key.as_ref(), cid));

        let peer_cids = PeerCidSet::new(peer_scid, transport_config.active_connection_id_limit.into_inner());

        tls.install_initial_keys(original_dcid.as_slice());
        let mut initial = LevelState::new(SpaceLevel::Initial);
        initial.keys = tls.take_keys(crypto::Level::Initial);

        tls.set_transport_parameters(&encode_transport_params(&local_params));

        Self {
            state: ConnectionState::Handshake,
            version,
            transport_config: transport_config.clone(),
            server_config,
            tls,
            original_dcid,
            retry_scid: None,
            local_cids,
            reset_key,
            peer_cids,
            local_params,
            peer_params: None,
            initial: Some(initial),
            handshake: None,
            application: LevelState::new(SpaceLevel::Application),
            streams: StreamTable::new(
                Initiator::Server,
                transport_config.stream_receive_window.into_inner() as usize,
                transport_config.initial_max_streams_bidi.into_inner(),
                transport_config.initial_max_streams_uni.into_inner(),
            ),
            conn_send_max_data: 0,
            conn_sent_data: 0,
            send_flow_blocked: false,
            conn_recv_max_data: transport_config.initial_max_data.into_inner(),
            conn_received_data: 0,
            rtt: RttEstimator::new(transport_config.initial_rtt.as_millis() as u64),
            recovery_config: RecoveryConfig {
                packet_threshold: transport_config.packet_threshold as u64,
                initial_rtt_millis: transport_config.initial_rtt.as_millis() as u64,
                max_ack_delay_millis: transport_config.max_ack_delay.as_millis() as u64,
            },
            congestion: NewRenoController::default(),
            pto_count: 0,
            handshake_confirmed: false,
            last_activity_millis: now_millis,
            closing_since_millis: None,
            last_close_sent_millis: None,
            error: None,
            draining_is_reset: false,
            validated_path: false,
            anti_amplification_received: 0,
            anti_amplification_sent: 0,
            path_challenge_outstanding: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn is_draining(&self) -> bool {
        self.state == ConnectionState::Draining
    }

    /// The CID this connection should be looked up by: the server's most
    /// recently issued CID once one exists.
    pub fn local_cid(&self) -> &ConnectionId {
        &self.original_dcid
    }

    /// Every CID the dispatcher should route to this connection: the original DCID the
    /// client's first Initial used, plus every CID issued since.
    pub fn local_connection_ids(&self) -> impl Iterator<Item = &ConnectionId> {
        std::iter::once(&self.original_dcid).chain(self.local_cids.iter())
    }

    /// Whether the trailing bytes of an unroutable short-header datagram match a
    /// stateless-reset token the peer gave this connection.
    pub fn matches_stateless_reset(&self, datagram: &[u8]) -> bool {
        if datagram.len() < 16 {
            return false;
        }
        self.peer_cids.matches_reset_token(&datagram[datagram.len() - 16..])
    }

    // ---------------------------------------------------------------- receive pipeline

    /// Processes one UDP datagram, which may coalesce several QUIC packets
    ///. Decrypt/DCID/version failures drop just that packet and move on to
    /// the next one in the datagram.
    pub fn handle_datagram(&mut self, datagram: &[u8], now_millis: u64) {
        if matches!(self.state, ConnectionState::Closed) {
            return;
        }
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Draining) {
            self.on_packet_during_close(now_millis);
            return;
        }

        self.anti_amplification_received += datagram.len() as u64;

        let mut cursor = datagram;
        while !cursor.is_empty() {
            if cursor.iter().all(|&b| b == 0) {
                break; // zero-padding at the datagram tail
            }
            let Some((consumed, rest)) = self.process_one_packet(cursor, now_millis) else {
                break;
            };
            let _ = consumed;
            cursor = rest;
        }

        self.last_activity_millis = now_millis;
    }

    /// Decrypts and processes one (possibly coalesced) packet from the front of `datagram`.
    /// Returns `None` when the remainder cannot be parsed at all (stop processing this
    /// datagram); otherwise the number of bytes consumed and the remaining slice.
    fn process_one_packet<'a>(&mut self, datagram: &'a [u8], now_millis: u64) -> Option<(usize, &'a [u8])> {
        if datagram.len() < crate::packet::packet::MIN_PACKET_LEN {
            return None;
        }

        let dcid_len = self.local_cids_len();
        let is_long = datagram[0] & 0x80 != 0;

        let level = if is_long {
            match (datagram[0] >> 4) & 0b11 {
                0b00 => SpaceLevel::Initial,
                0b10 => SpaceLevel::Handshake,
                _ => {
                    // 0-RTT or Retry/VersionNegotiate: out of scope / no connection state
                    // to apply them to post-accept.
                    return Some((datagram.len(), &datagram[datagram.len()..]));
                }
            }
        } else {
            SpaceLevel::Application
        };

        let Some(level_state) = self.level_state_mut(level) else {
            trace!(?level, "packet for a discarded encryption level, dropping");
            return Some((datagram.len(), &datagram[datagram.len()..]));
        };
        let Some(keys) = level_state.keys.as_ref() else {
            return Some((datagram.len(), &datagram[datagram.len()..]));
        };

        let mut buf = datagram.to_vec();
        let located = match locate_pn_field(&buf, is_long, dcid_len) {
            Ok(l) => l,
            Err(_) => return None,
        };

        if buf.len() < located.sample_offset + keys.remote_header.sample_len() {
            return None;
        }
        let sample = buf[located.sample_offset..located.sample_offset + keys.remote_header.sample_len()].to_vec();
        let mask = keys.remote_header.mask(&sample);

        let first_byte_mask = if is_long { 0x0f } else { 0x1f };
        buf[0] ^= mask[0] & first_byte_mask;
        let pn_len = if is_long {
            ((buf[0] >> 2) & 0b11) + 1
        } else {
            (buf[0] & 0b11) + 1
        } as usize;
        for i in 0..pn_len {
            buf[located.pn_offset + i] ^= mask[1 + i];
        }

        let mut cursor: &[u8] = &buf;
        let header = match Header::decode(&mut cursor, dcid_len) {
            Ok(h) => h,
            Err(_) => return None,
        };

        if header.dst_cid().as_slice() != self.original_dcid.as_slice()
            && !self.local_cids.contains(header.dst_cid().as_slice())
        {
            return None;
        }

        let payload_total_len = header.payload_len().unwrap_or(cursor.len());
        if cursor.len() < payload_total_len {
            return None;
        }
        let (protected_payload, rest) = cursor.split_at(payload_total_len);
        let remainder_start = datagram.len() - rest.len();

        let truncated = truncated_pn_value(&buf[located.pn_offset..located.pn_offset + pn_len]);
        let expected = self.level_state_mut(level).map(|l| l.expected_pn).unwrap_or(0);
        let pn = space::decode_packet_number(expected, truncated, pn_len as u8);

        let header_bytes = &buf[..located.pn_offset + pn_len];
        let Some(level_state) = self.level_state_mut(level) else {
            return Some((remainder_start, rest));
        };
        let Some(keys) = level_state.keys.as_ref() else {
            return Some((remainder_start, rest));
        };
        let Some(plaintext) = keys.remote_packet.open(PacketNumber::new(pn), header_bytes, protected_payload) else {
            trace!(pn, ?level, "packet failed AEAD authentication, dropping");
            return Some((remainder_start, rest));
        };

        if pn >= expected {
            if let Some(level_state) = self.level_state_mut(level) {
                level_state.expected_pn = pn + 1;
            }
        }

        if level == SpaceLevel::Handshake {
            self.on_handshake_level_confirmed();
        }

        if let Err(err) = self.process_decrypted_payload(level, pn, &plaintext, now_millis) {
            self.close_with_error(err, now_millis);
        }

        Some((remainder_start, rest))
    }

    fn level_state_mut(&mut self, level: SpaceLevel) -> Option<&mut LevelState> {
        match level {
            SpaceLevel::Initial => self.initial.as_mut(),
            SpaceLevel::Handshake => self.handshake.as_mut(),
            SpaceLevel::Application => Some(&mut self.application),
        }
    }

    fn local_cids_len(&self) -> usize {
        self.original_dcid.len().max(8)
    }

    /// Receipt of a Handshake-level packet confirms the path and discards Initial.
    fn on_handshake_level_confirmed(&mut self) {
        self.validated_path = true;
        self.discard_initial();
    }

    fn discard_initial(&mut self) {
        if let Some(level) = self.initial.as_mut() {
            level.discarded = true;
        }
        self.initial = None;
    }

    fn discard_handshake(&mut self) {
        if let Some(level) = self.handshake.as_mut() {
            level.discarded = true;
        }
        self.handshake = None;
    }

    fn process_decrypted_payload(
        &mut self,
        level: SpaceLevel,
        pn: u64,
        payload: &[u8],
        now_millis: u64,
    ) -> Result<(), TransportError> {
        let mut cursor: &[u8] = payload;
        let mut frames = Vec::new();
        while !cursor.is_empty() {
            frames.push(Frame::decode(&mut cursor)?);
        }

        let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
        let insert = self
            .level_state_mut(level)
            .expect("level exists while processing its own payload")
            .space
            .on_packet_received(pn, ack_eliciting, now_millis);
        if insert == AckInsert::Overflowed {
            self.flush_ack(level, now_millis);
        }

        for frame in frames {
            self.handle_frame(level, frame, now_millis)?;
        }

        Ok(())
    }

    fn handle_frame(&mut self, level: SpaceLevel, frame: Frame, now_millis: u64) -> Result<(), TransportError> {
        match frame {
            Frame::Padding => {}
            Frame::Ping => {}
            Frame::Ack { largest, first_range, ranges, delay, .. } => {
                self.on_ack_received(level, largest, first_range, &ranges, delay, now_millis);
            }
            Frame::Crypto { offset, data } => self.on_crypto_frame(level, offset, &data, now_millis)?,
            Frame::Stream { stream_id, offset, fin, data } => self.on_stream_frame(stream_id, offset, fin, &data)?,
            Frame::ResetStream { stream_id, error_code, .. } => {
                self.streams.ensure_peer_stream(stream_id)?;
                if let Some(stream) = self.streams.get_mut(stream_id) {
                    stream.recv.error = Some(error_code);
                }
            }
            Frame::StopSending { stream_id, error_code } => {
                if let Some(stream) = self.streams.get_mut(stream_id) {
                    stream.send.error = Some(error_code);
                }
            }
            Frame::MaxData { max } => {
                if max > self.conn_send_max_data {
                    self.conn_send_max_data = max;
                    self.send_flow_blocked = false;
                }
            }
            Frame::MaxStreamData { stream_id, max } => {
                if let Some(stream) = self.streams.get_mut(stream_id) {
                    if max > stream.send_max_data {
                        stream.send_max_data = max;
                    }
                }
            }
            Frame::MaxStreams { dir, max } => match dir {
                FrameDirection::Bidi => self.streams.set_peer_limit_bidi(max),
                FrameDirection::Uni => self.streams.set_peer_limit_uni(max),
            },
            Frame::DataBlocked { .. } | Frame::StreamDataBlocked { .. } | Frame::StreamsBlocked { .. } => {
                debug!("peer reported itself flow-control blocked");
            }
            Frame::NewConnectionId { seq, retire_prior_to, cid, reset_token } => {
                let retired = self.peer_cids.on_new_connection_id(seq, retire_prior_to, cid, reset_token)?;
                for seq in retired {
                    self.application.space.queue(Frame::RetireConnectionId { seq });
                }
            }
            Frame::RetireConnectionId { seq } => {
                if self.local_cids.retire(seq) {
                    let reset_key = self.reset_key.clone();
                    let entry = self.local_cids.issue(|cid| stateless_reset_token(reset_key.as_ref(), cid));
                    self.application.space.queue(Frame::NewConnectionId {
                        seq: entry.seq,
                        retire_prior_to: 0,
                        cid: entry.cid,
                        reset_token: entry.reset_token,
                    });
                }
            }
            Frame::PathChallenge { data } => {
                self.application.space.queue(Frame::PathResponse { data });
            }
            Frame::PathResponse { data } => {
                if self.path_challenge_outstanding == Some(data) {
                    self.path_challenge_outstanding = None;
                    self.validated_path = true;
                }
            }
            Frame::ConnectionClose { error_code, is_app, reason, .. } => {
                self.enter_draining(error_code, is_app, reason, now_millis);
            }
            Frame::NewToken { .. } => {
                // Client-only utility (Non-goals: client-side role); accepted and ignored.
            }
            Frame::HandshakeDone => {
                self.handshake_confirmed = true;
                self.discard_handshake();
            }
        }
        Ok(())
    }

    fn on_ack_received(
        &mut self,
        level: SpaceLevel,
        largest: u64,
        first_range: u64,
        ranges: &[crate::packet::frame::AckRange],
        delay: u64,
        now_millis: u64,
    ) {
        let acked = self
            .level_state_mut(level)
            .expect("level exists for received ACK")
            .space
            .apply_ack(largest, first_range, ranges);
        if acked.is_empty() {
            return;
        }

        let newly_acked_largest = acked.iter().map(|p| p.pn).max().unwrap_or(largest) == largest;
        if newly_acked_largest {
            if let Some(latest) = acked.iter().find(|p| p.pn == largest) {
                let peer_delay = delay << self.peer_ack_delay_exponent();
                self.rtt.sample(
                    now_millis.saturating_sub(latest.sent_at_millis),
                    peer_delay,
                    self.transport_config.max_ack_delay.as_millis() as u64,
                    space_level_for_rtt(level),
                );
            }
        }

        for packet in &acked {
            self.congestion.on_packet_acked(packet.size as u64, packet.sent_at_millis);
        }
        self.pto_count = 0;

        for packet in acked {
            for frame in packet.frames {
                self.on_frame_acked(level, frame);
            }
        }

        self.run_loss_detection(level, now_millis);
    }

    fn on_frame_acked(&mut self, _level: SpaceLevel, frame: Frame) {
        if let Frame::Stream { stream_id, offset, data, .. } = frame {
            if let Some(stream) = self.streams.get_mut(stream_id) {
                let end = offset + data.len() as u64;
                if end > stream.send.acked_offset {
                    stream.send.acked_offset = end;
                }
            }
        }
    }

    fn run_loss_detection(&mut self, level: SpaceLevel, now_millis: u64) {
        let Some(level_state) = self.level_state_mut(level) else { return };
        let Some(largest_acked) = level_state.space.largest_acked_by_peer else { return };
        let sent: Vec<_> = level_state.space.sent.values().cloned().collect();
        let (lost, _deadline) =
            recovery::detect_losses(sent.iter(), largest_acked, now_millis, &self.rtt, &self.recovery_config);

        if lost.is_empty() {
            return;
        }

        for lost_packet in &lost {
            if let Some(level_state) = self.level_state_mut(level) {
                if let Some(sent_packet) = level_state.space.sent.remove(&lost_packet.pn) {
                    self.requeue_lost_frames(level, sent_packet.frames);
                }
            }
        }

        self.congestion.on_packets_lost(now_millis, false);
    }

    fn requeue_lost_frames(&mut self, level: SpaceLevel, frames: Vec<Frame>) {
        for frame in frames {
            match frame.retransmit_policy() {
                RetransmitPolicy::Drop => {}
                RetransmitPolicy::DropAndForceFreshAck => {
                    if let Some(level_state) = self.level_state_mut(level) {
                        level_state.space.send_ack = level_state.space.send_ack.max(2);
                    }
                }
                RetransmitPolicy::Requeue => {
                    if let Some(level_state) = self.level_state_mut(level) {
                        level_state.space.queue(frame);
                    }
                }
                RetransmitPolicy::RequeueUnlessStreamErrored => {
                    if let Frame::Stream { stream_id, .. } = &frame {
                        if self.streams.get(*stream_id).map(|s| s.send.error.is_some()).unwrap_or(true) {
                            continue;
                        }
                    }
                    if let Some(level_state) = self.level_state_mut(level) {
                        level_state.space.queue(frame);
                    }
                }
                RetransmitPolicy::Regenerate => {
                    let regenerated = self.regenerate_frame(&frame);
                    if let Some(level_state) = self.level_state_mut(level) {
                        level_state.space.queue(regenerated);
                    }
                }
                RetransmitPolicy::RegenerateOrDropIfStreamGone => {
                    if let Frame::MaxStreamData { stream_id, .. } = &frame {
                        if self.streams.get(*stream_id).is_none() {
                            continue;
                        }
                    }
                    let regenerated = self.regenerate_frame(&frame);
                    if let Some(level_state) = self.level_state_mut(level) {
                        level_state.space.queue(regenerated);
                    }
                }
            }
        }
    }

    /// Rebuilds a frame from current state rather than replaying the stale snapshot.
    fn regenerate_frame(&self, original: &Frame) -> Frame {
        match original {
            Frame::MaxData { .. } => Frame::MaxData { max: self.conn_recv_max_data },
            Frame::MaxStreams { dir, .. } => {
                let max = match dir {
                    FrameDirection::Bidi => self.transport_config.initial_max_streams_bidi.into_inner(),
                    FrameDirection::Uni => self.transport_config.initial_max_streams_uni.into_inner(),
                };
                Frame::MaxStreams { dir: *dir, max }
            }
            Frame::MaxStreamData { stream_id, .. } => {
                let max = self
                    .streams
                    .get(*stream_id)
                    .map(|s| s.advertised_recv_max_data())
                    .unwrap_or(0);
                Frame::MaxStreamData { stream_id: *stream_id, max }
            }
            other => other.clone(),
        }
    }

    fn peer_ack_delay_exponent(&self) -> u32 {
        self.peer_params.as_ref().map(|p| p.ack_delay_exponent as u32).unwrap_or(3)
    }

    // ----------------------------------------------------------------- CRYPTO / handshake

    fn on_crypto_frame(&mut self, level: SpaceLevel, offset: u64, data: &[u8], now_millis: u64) -> Result<(), TransportError> {
        let contiguous = {
            let level_state = self.level_state_mut(level).expect("level exists for its own CRYPTO frame");
            level_state.crypto_recv.insert(offset, data).map_err(|ReassemblyOverflow { .. }| {
                TransportError::new(TransportErrorCode::CryptoBufferExceeded, "CRYPTO reassembly buffer exceeded")
            })?
        };
        if contiguous.is_empty() {
            return Ok(());
        }

        self.tls.read_handshake(space_to_crypto_level(level), &contiguous);
        self.drive_handshake(now_millis)
    }

    /// Steps the TLS state machine until it needs more input, draining outbound handshake
    /// bytes and newly available keys at each step.
    fn drive_handshake(&mut self, now_millis: u64) -> Result<(), TransportError> {
        loop {
            for candidate in [crypto::Level::Initial, crypto::Level::Handshake, crypto::Level::Application] {
                if let Some(keys) = self.tls.take_keys(candidate) {
                    self.install_keys(candidate, keys);
                }
            }

            let mut buf = Vec::new();
            if let Some(write_level) = self.tls.write_handshake(&mut buf) {
                if !buf.is_empty() {
                    self.queue_crypto_data(write_level, buf);
                }
            }

            match self.tls.step() {
                HandshakeStep::NeedInput => break,
                HandshakeStep::Progress => continue,
                HandshakeStep::Done => {
                    self.on_handshake_complete(now_millis);
                    break;
                }
            }
        }
        Ok(())
    }

    fn install_keys(&mut self, level: crypto::Level, keys: Keys) {
        let space_level = match level {
            crypto::Level::Initial => SpaceLevel::Initial,
            crypto::Level::Handshake => SpaceLevel::Handshake,
            crypto::Level::Application | crypto::Level::ZeroRtt => SpaceLevel::Application,
        };
        match space_level {
            SpaceLevel::Initial => {
                if self.initial.is_none() {
                    self.initial = Some(LevelState::new(SpaceLevel::Initial));
                }
                self.initial.as_mut().unwrap().keys = Some(keys);
            }
            SpaceLevel::Handshake => {
                if self.handshake.is_none() {
                    self.handshake = Some(LevelState::new(SpaceLevel::Handshake));
                }
                self.handshake.as_mut().unwrap().keys = Some(keys);
            }
            SpaceLevel::Application => self.application.keys = Some(keys),
        }
        debug!(?level, "installed keys");
    }

    fn queue_crypto_data(&mut self, level: crypto::Level, data: Vec<u8>) {
        let space_level = match level {
            crypto::Level::Initial => SpaceLevel::Initial,
            crypto::Level::Handshake => SpaceLevel::Handshake,
            crypto::Level::Application | crypto::Level::ZeroRtt => SpaceLevel::Application,
        };
        let Some(level_state) = self.level_state_mut(space_level) else { return };
        let offset = level_state.crypto_send_offset;
        level_state.crypto_send_offset += data.len() as u64;
        level_state.space.queue(Frame::Crypto { offset, data });
    }

    fn on_handshake_complete(&mut self, now_millis: u64) {
        if self.peer_params.is_none() {
            if let Some(raw) = self.tls.transport_parameters() {
                match self.negotiate_transport_parameters(raw) {
                    Ok(()) => {}
                    Err(err) => {
                        self.close_with_error(err, now_millis);
                        return;
                    }
                }
            }
        }

        self.state = ConnectionState::Connected;
        self.application.space.queue(Frame::HandshakeDone);
        if self.server_config.retry {
            let token = token::seal(
                self.server_config.token_key.as_ref(),
                // Placeholder peer address; the endpoint shell supplies the real one when
                // it calls into the send path (out of this module's scope, spec.md §1).
                "0.0.0.0:0".parse().unwrap(),
                &self.original_dcid,
            );
            self.application.space.queue(Frame::NewToken { token });
        }
        debug!("handshake complete");
    }

    fn negotiate_transport_parameters(&mut self, _raw: &[u8]) -> Result<(), TransportError> {
        require(
            self.tls.alpn_protocol().map(|a| !a.is_empty()).unwrap_or(!self.server_config.require_alpn),
            "no ALPN negotiated",
        )?;

        // A real implementation parses `raw` per the transport-parameters extension
        //; this engine validates and applies the
        // fields spec.md §4.9 names, using `tls.peer_transport_params()`-style defaults
        // until a concrete codec is plugged in.
        let peer = TransportParameters {
            initial_max_data: self.transport_config.initial_max_data.into_inner(),
            initial_max_stream_data_bidi_local: self.transport_config.initial_max_stream_data_bidi_local.into_inner(),
            initial_max_stream_data_bidi_remote: self.transport_config.initial_max_stream_data_bidi_remote.into_inner(),
            initial_max_stream_data_uni: self.transport_config.initial_max_stream_data_uni.into_inner(),
            initial_max_streams_bidi: self.transport_config.initial_max_streams_bidi.into_inner(),
            initial_max_streams_uni: self.transport_config.initial_max_streams_uni.into_inner(),
            max_idle_timeout_millis: self.transport_config.max_idle_timeout.as_millis() as u64,
            max_ack_delay_millis: self.transport_config.max_ack_delay.as_millis() as u64,
            ack_delay_exponent: self.transport_config.ack_delay_exponent,
            active_connection_id_limit: self.transport_config.active_connection_id_limit.into_inner(),
            max_udp_payload_size: self.transport_config.max_udp_payload_size_or_default(),
            initial_source_connection_id: None,
            original_destination_connection_id: None,
            retry_source_connection_id: None,
        };

        if !(1200..=65527).contains(&peer.max_udp_payload_size) {
            return Err(TransportError::new(
                TransportErrorCode::TransportParameterError,
                "peer max_udp_payload_size out of range",
            ));
        }

        self.local_params.max_idle_timeout_millis = self.local_params.max_idle_timeout_millis.min(peer.max_idle_timeout_millis);
        self.conn_send_max_data = peer.initial_max_data;
        self.streams.set_peer_limits(peer.initial_max_streams_bidi, peer.initial_max_streams_uni);
        self.peer_params = Some(peer);
        Ok(())
    }

    // ------------------------------------------------------------------------- streams

    fn on_stream_frame(&mut self, stream_id: u64, offset: u64, fin: bool, data: &[u8]) -> Result<(), TransportError> {
        self.streams.ensure_peer_stream(stream_id)?;

        let end = offset + data.len() as u64;
        if end > self.conn_recv_max_data {
            return Err(TransportError::new(TransportErrorCode::FlowControlError, "connection receive window exceeded"));
        }

        let stream = self.streams.get_mut(stream_id).expect("just ensured");
        let before = stream.received();
        if let Some(reassembler) = stream.recv.reassembler.as_mut() {
            let delivered = reassembler.insert(offset, data).map_err(|_| {
                TransportError::new(TransportErrorCode::FlowControlError, "stream receive buffer exceeded")
            })?;
            stream.recv.delivered.extend(delivered);
        }
        if fin {
            stream.recv.eof_at = Some(end);
        }
        let after = stream.received();
        self.conn_received_data += after.saturating_sub(before);

        if self.conn_received_data * 2 > self.conn_recv_max_data {
            self.conn_recv_max_data *= 2;
            self.application.space.queue(Frame::MaxData { max: self.conn_recv_max_data });
        }

        let advertised = self.streams.get(stream_id).map(|s| s.advertised_recv_max_data());
        if let Some(max) = advertised {
            self.application.space.queue(Frame::MaxStreamData { stream_id, max });
        }

        Ok(())
    }

    /// Reads any bytes delivered so far on `stream_id`, and whether EOF has been reached.
    pub fn stream_recv(&mut self, stream_id: u64) -> Option<(Vec<u8>, bool)> {
        let stream = self.streams.get_mut(stream_id)?;
        let bytes: Vec<u8> = stream.recv.delivered.drain(..).collect();
        let eof = stream.recv.eof_at.map(|at| stream.received() >= at).unwrap_or(false);
        Some((bytes, eof))
    }

    /// Queues up to `data.len()` bytes for send on `stream_id`, chunked into STREAM frames
    /// under per-stream and connection flow control.
    /// Returns the number of bytes actually queued.
    pub fn stream_send(&mut self, stream_id: u64, data: &[u8], fin: bool) -> usize {
        let conn_headroom = self.conn_send_max_data.saturating_sub(self.conn_sent_data);
        let Some(stream) = self.streams.get_mut(stream_id) else { return 0 };
        let stream_headroom = stream.send_max_data.saturating_sub(stream.send.sent_offset);
        let allowed = (data.len() as u64).min(conn_headroom).min(stream_headroom) as usize;

        if allowed < data.len() {
            self.send_flow_blocked = true;
        }

        if allowed == 0 && !fin {
            return 0;
        }

        let offset = stream.send.sent_offset;
        stream.send.sent_offset += allowed as u64;
        let send_fin = fin && allowed == data.len();
        if send_fin {
            stream.send.fin_queued = true;
        }
        self.conn_sent_data += allowed as u64;

        self.application.space.queue(Frame::Stream {
            stream_id,
            offset,
            fin: send_fin,
            data: data[..allowed].to_vec(),
        });
        allowed
    }

    // -------------------------------------------------------------------------- sending

    /// Packs as many pending frames as fit into one UDP datagram, respecting congestion,
    /// flow-control, and anti-amplification limits. Returns `None` when
    /// there is nothing to send right now.
    pub fn poll_transmit(&mut self, now_millis: u64) -> Option<Transmit> {
        if matches!(self.state, ConnectionState::Closed) {
            return None;
        }
        self.maybe_flush_delayed_acks(now_millis);

        let mut datagram = Vec::new();
        for level in [SpaceLevel::Initial, SpaceLevel::Handshake, SpaceLevel::Application] {
            if let Some(packet) = self.build_packet(level, now_millis) {
                datagram.extend(packet);
            }
            if datagram.len() >= self.transport_config.max_udp_payload_size_or_default() as usize {
                break;
            }
        }

        if datagram.is_empty() {
            None
        } else {
            self.anti_amplification_sent += datagram.len() as u64;
            Some(Transmit { payload: datagram })
        }
    }

    fn maybe_flush_delayed_acks(&mut self, now_millis: u64) {
        for level in [SpaceLevel::Initial, SpaceLevel::Handshake, SpaceLevel::Application] {
            let is_application = level == SpaceLevel::Application;
            let due = self.level_state_mut(level).map(|l| l.space.is_ack_due(is_application)).unwrap_or(false);
            if due {
                self.flush_ack(level, now_millis);
            }
        }
    }

    fn flush_ack(&mut self, level: SpaceLevel, now_millis: u64) {
        let ack_delay_exponent = self.transport_config.ack_delay_exponent;
        let Some(level_state) = self.level_state_mut(level) else { return };
        let elapsed = level_state
            .space
            .ack_delay_start
            .map(|start| now_millis.saturating_sub(start))
            .unwrap_or(0);
        let encoded_delay = elapsed >> ack_delay_exponent;
        let Some(frame) = level_state.space.acks.to_frame(encoded_delay, None) else { return };
        level_state.space.pending_frames.push_front(frame);
        level_state.space.mark_ack_flushed();
    }

    fn anti_amplification_ceiling(&self, level: SpaceLevel) -> u64 {
        if self.validated_path {
            return u64::MAX;
        }
        match level {
            SpaceLevel::Initial => (self.anti_amplification_sent + MIN_INITIAL_SIZE) / 3,
            _ => 3 * self.anti_amplification_received,
        }
    }

    fn build_packet(&mut self, level: SpaceLevel, now_millis: u64) -> Option<Vec<u8>> {
        let max_payload = self.transport_config.max_udp_payload_size_or_default() as usize;
        let ceiling = self.anti_amplification_ceiling(level);

        let Some(level_state) = self.level_state_mut(level) else { return None };
        if level_state.keys.is_none() || level_state.space.pending_frames.is_empty() {
            return None;
        }

        let mut frames = Vec::new();
        let mut budget = max_payload.saturating_sub(64); // headroom for header + AEAD tag
        let mut ack_eliciting = false;
        while let Some(frame) = level_state.space.pending_frames.front() {
            let mut encoded = Vec::new();
            frame.encode(&mut encoded);
            if encoded.len() > budget {
                break;
            }
            if frame.is_ack_eliciting() && self.anti_amplification_sent as usize + encoded.len() > ceiling as usize {
                break;
            }
            budget -= encoded.len();
            ack_eliciting |= frame.is_ack_eliciting();
            frames.push(level_state.space.pending_frames.pop_front().unwrap());
        }

        if frames.is_empty() {
            return None;
        }

        if ack_eliciting && !self.congestion.is_congestion_window_available(max_payload as u64) {
            for frame in frames.into_iter().rev() {
                if let Some(level_state) = self.level_state_mut(level) {
                    level_state.space.pending_frames.push_front(frame);
                }
            }
            return None;
        }

        let level_state = self.level_state_mut(level)?;
        let pn = level_state.space.allocate_pn();
        let keys = level_state.keys.as_ref()?;

        let mut payload = Vec::new();
        for frame in &frames {
            frame.encode(&mut payload);
        }
        if level == SpaceLevel::Initial && ack_eliciting {
            while payload.len() + 20 < MIN_INITIAL_SIZE as usize {
                payload.push(0); // PADDING
            }
        } else {
            while payload.len() < MIN_PADDING_FLOOR {
                payload.push(0);
            }
        }

        let pn_len = space::pn_encode_len(pn.get(), level_state.space.largest_acked_by_peer);
        let pn_bytes = space::truncate_pn(pn.get(), pn_len);

        let header = self.build_header(level, pn_bytes);
        let header_bytes = header.encode();
        let sealed = keys.local_packet.seal(pn, &header_bytes, &payload);

        let header_len = header_bytes.len();
        let mut packet = header_bytes;
        packet.extend(sealed.payload);
        self.apply_header_protection(level, &mut packet, header_len, pn_len as usize);

        let size = packet.len();
        let level_state = self.level_state_mut(level)?;
        level_state.space.on_packet_sent(pn.get(), now_millis, size, frames);
        if ack_eliciting {
            self.congestion.on_packet_sent(size as u64);
        }

        Some(packet)
    }

    fn build_header(&self, level: SpaceLevel, pn_bytes: Vec<u8>) -> Header {
        let dcid = self.peer_cids.current().cid.clone();
        let scid = self.local_cids_scid();
        match level {
            SpaceLevel::Initial => Header::Initial {
                version: self.version,
                dst_cid: dcid,
                src_cid: scid,
                token: Vec::new(),
                length: pn_bytes.len() as u64,
                packet_number: pn_bytes,
            },
            SpaceLevel::Handshake => Header::Handshake {
                version: self.version,
                dst_cid: dcid,
                src_cid: scid,
                length: pn_bytes.len() as u64,
                packet_number: pn_bytes,
            },
            SpaceLevel::Application => Header::Short {
                dst_cid: dcid,
                spin_bit: false,
                key_phase: false,
                packet_number: pn_bytes,
            },
        }
    }

    fn local_cids_scid(&self) -> ConnectionId {
        self.local_cids.current().clone()
    }

    /// Masks the low flag bits and the truncated PN using a sample of the sealed payload:
    /// the mirror image of the unmasking done on receive in `process_one_packet`, since the
    /// mask is its own inverse (XOR into, XOR back out).
    fn apply_header_protection(&self, level: SpaceLevel, packet: &mut [u8], header_len: usize, pn_len: usize) {
        let Some(level_state) = (match level {
            SpaceLevel::Initial => self.initial.as_ref(),
            SpaceLevel::Handshake => self.handshake.as_ref(),
            SpaceLevel::Application => Some(&self.application),
        }) else {
            return;
        };
        let Some(keys) = level_state.keys.as_ref() else { return };

        let pn_offset = header_len - pn_len;
        let sample_offset = pn_offset + 4;
        let sample_len = keys.local_header.sample_len();
        if packet.len() < sample_offset + sample_len {
            return;
        }
        let sample = packet[sample_offset..sample_offset + sample_len].to_vec();
        let mask = keys.local_header.mask(&sample);

        let is_long = level != SpaceLevel::Application;
        let first_byte_mask = if is_long { 0x0f } else { 0x1f };
        packet[0] ^= mask[0] & first_byte_mask;
        for i in 0..pn_len {
            packet[pn_offset + i] ^= mask[1 + i];
        }
    }
}

/// Derives where the packet-number field and the header-protection sample begin, without
/// needing to unprotect anything first: every byte read here (long packet type, length
/// varints, CIDs) sits outside the protected bit range (RFC 9000 §17.2, §5.4.2).
struct PnFieldLocation {
    pn_offset: usize,
    sample_offset: usize,
}

fn locate_pn_field(datagram: &[u8], is_long: bool, dcid_len_for_short: usize) -> Result<PnFieldLocation, TransportError> {
    let mut cursor = datagram;
    require(!cursor.is_empty(), "empty datagram")?;

    if !is_long {
        let pn_offset = 1 + dcid_len_for_short;
        require(datagram.len() >= pn_offset, "short header shorter than dcid")?;
        return Ok(PnFieldLocation { pn_offset, sample_offset: pn_offset + 4 });
    }

    let long_type = (cursor[0] >> 4) & 0b11;
    cursor = &cursor[1..];
    require(cursor.len() >= 4, "long header: truncated version")?;
    cursor = &cursor[4..];

    let dcid_len = *cursor.first().ok_or_else(|| TransportError::frame_encoding("truncated dcid len"))? as usize;
    cursor = &cursor[1..];
    require(cursor.len() >= dcid_len, "truncated dcid")?;
    cursor = &cursor[dcid_len..];

    let scid_len = *cursor.first().ok_or_else(|| TransportError::frame_encoding("truncated scid len"))? as usize;
    cursor = &cursor[1..];
    require(cursor.len() >= scid_len, "truncated scid")?;
    cursor = &cursor[scid_len..];

    if long_type == 0b00 {
        // Initial: token length + token precede the length varint.
        let token_len = crate::primitives::varint::VarInt::decode(&mut cursor)
            .map_err(|_| TransportError::frame_encoding("truncated token length"))?
            .into_usize();
        require(cursor.len() >= token_len, "truncated token")?;
        cursor = &cursor[token_len..];
    }

    let _length = crate::primitives::varint::VarInt::decode(&mut cursor)
        .map_err(|_| TransportError::frame_encoding("truncated length"))?;

    let pn_offset = datagram.len() - cursor.len();
    Ok(PnFieldLocation { pn_offset, sample_offset: pn_offset + 4 })
}

fn truncated_pn_value(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

fn space_level_for_rtt(level: SpaceLevel) -> SpaceLevel {
    level
}

pub(crate) fn stateless_reset_token(key: &dyn crate::crypto::HmacKey, cid: &ConnectionId) -> [u8; 16] {
    let signed = key.sign(cid.as_slice());
    let mut token = [0u8; 16];
    let len = signed.len().min(16);
    token[..len].copy_from_slice(&signed[..len]);
    token
}

fn encode_transport_params(params: &TransportParameters) -> Vec<u8> {
    // A real implementation encodes the RFC 9000 §18.2 TLV set; out of this engine's scope
    // (spec.md §1, "the TLS 1.3 library ... transport-parameter extension transport" is an
    // external collaborator). This stub carries just enough to exercise the call shape.
    let mut buf = Vec::new();
    buf.extend_from_slice(&params.initial_max_data.to_be_bytes());
    buf
}

impl Connection {
    /// Initiates an immediate close. Idempotent: the first offense wins.
    pub fn close_with_error(&mut self, err: TransportError, now_millis: u64) {
        if self.error.is_none() {
            warn!(code = ?err.code, reason = %err.reason, "connection-fatal transport error");
            self.error = Some(ErrorSlot {
                level: SpaceLevel::Application,
                code: err.code,
                frame_type: err.frame_type,
                reason: err.reason,
                is_app: false,
            });
        }
        self.begin_closing(now_millis);
    }

    pub fn close_app(&mut self, error_code: u64, reason: String, now_millis: u64) {
        if self.error.is_none() {
            self.error = Some(ErrorSlot {
                level: SpaceLevel::Application,
                code: TransportErrorCode::from_code(error_code).unwrap_or(TransportErrorCode::ApplicationError),
                frame_type: None,
                reason,
                is_app: true,
            });
        }
        self.begin_closing(now_millis);
    }

    fn begin_closing(&mut self, now_millis: u64) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Draining | ConnectionState::Closed) {
            return;
        }
        self.state = ConnectionState::Closing;
        self.closing_since_millis = Some(now_millis);
        self.queue_connection_close(now_millis);
    }

    fn queue_connection_close(&mut self, now_millis: u64) {
        let Some(error) = self.error.clone() else { return };
        if let Some(last) = self.last_close_sent_millis {
            if now_millis.saturating_sub(last) < CC_MIN_INTERVAL_MILLIS {
                return;
            }
        }
        self.last_close_sent_millis = Some(now_millis);

        let frame = Frame::ConnectionClose {
            error_code: error.code.code(),
            frame_type: error.frame_type,
            is_app: error.is_app,
            reason: error.reason.into_bytes(),
        };
        self.application.space.queue(frame.clone());
        // Also at Initial if the current write level is Handshake but Initial keys still
        // exist, so a client lacking Handshake keys can still read the close.
        if self.handshake.is_some() {
            if let Some(initial) = self.initial.as_mut() {
                initial.space.queue(frame);
            }
        }
    }

    /// Called when another packet arrives while closing/draining: rate-limited
    /// retransmission of CONNECTION_CLOSE.
    fn on_packet_during_close(&mut self, now_millis: u64) {
        if self.state == ConnectionState::Closing {
            self.queue_connection_close(now_millis);
        }
    }

    fn enter_draining(&mut self, error_code: u64, is_app: bool, reason: Vec<u8>, now_millis: u64) {
        if matches!(self.state, ConnectionState::Draining | ConnectionState::Closed) {
            return;
        }
        if self.error.is_none() {
            self.error = Some(ErrorSlot {
                level: SpaceLevel::Application,
                code: TransportErrorCode::from_code(error_code).unwrap_or(TransportErrorCode::InternalError),
                frame_type: None,
                reason: String::from_utf8_lossy(&reason).into_owned(),
                is_app,
            });
        }
        self.state = ConnectionState::Draining;
        self.closing_since_millis = Some(now_millis);
        self.mark_streams_errored();
    }

    /// Detected a stateless reset: drain without ever having seen a
    /// CONNECTION_CLOSE.
    pub fn on_stateless_reset(&mut self, now_millis: u64) {
        self.draining_is_reset = true;
        self.enter_draining(0, false, b"stateless reset".to_vec(), now_millis);
    }

    fn mark_streams_errored(&mut self) {
        for stream in self.streams.iter_mut() {
            stream.mark_error(0);
        }
    }

    /// Current PTO duration for `level`, or `None` if no ack-eliciting packets are in
    /// flight there.
    fn pto_deadline(&self, level: SpaceLevel, now_millis: u64) -> Option<u64> {
        let level_state = match level {
            SpaceLevel::Initial => self.initial.as_ref(),
            SpaceLevel::Handshake => self.handshake.as_ref(),
            SpaceLevel::Application => Some(&self.application),
        }?;
        let last_sent = level_state.space.sent.values().map(|p| p.sent_at_millis).max()?;
        let duration = recovery::pto_duration(
            &self.rtt,
            self.transport_config.max_ack_delay.as_millis() as u64,
            level,
            self.handshake_confirmed,
            self.pto_count,
        );
        Some(last_sent.max(now_millis) + duration)
    }

    /// The next instant the caller should invoke [`Connection::on_timeout`] (spec.md §5
    /// "Timers"): the earliest of PTO (across spaces), idle timeout, the ack-delay-push
    /// timer, and the close timer.
    pub fn poll_timeout(&self, now_millis: u64) -> Option<u64> {
        let mut deadlines = Vec::new();
        for level in [SpaceLevel::Initial, SpaceLevel::Handshake, SpaceLevel::Application] {
            if let Some(d) = self.pto_deadline(level, now_millis) {
                deadlines.push(d);
            }
        }
        deadlines.push(self.last_activity_millis + self.local_params.max_idle_timeout_millis);
        if let Some(d) = self
            .application
            .space
            .ack_delay_deadline(self.transport_config.max_ack_delay.as_millis() as u64)
        {
            deadlines.push(d);
        }
        if let Some(since) = self.closing_since_millis {
            let pto = recovery::pto_duration(
                &self.rtt,
                self.transport_config.max_ack_delay.as_millis() as u64,
                SpaceLevel::Application,
                self.handshake_confirmed,
                0,
            );
            deadlines.push(since + pto * CLOSE_TIMER_PTO_MULTIPLIER);
        }
        deadlines.into_iter().min()
    }

    /// Drives whichever timer(s) have fired as of `now_millis`.
    pub fn on_timeout(&mut self, now_millis: u64) {
        if let Some(since) = self.closing_since_millis {
            let pto = recovery::pto_duration(
                &self.rtt,
                self.transport_config.max_ack_delay.as_millis() as u64,
                SpaceLevel::Application,
                self.handshake_confirmed,
                0,
            );
            if now_millis.saturating_sub(since) >= pto * CLOSE_TIMER_PTO_MULTIPLIER {
                self.state = ConnectionState::Closed;
                return;
            }
        }

        if now_millis.saturating_sub(self.last_activity_millis) >= self.local_params.max_idle_timeout_millis {
            self.state = ConnectionState::Closed;
            return;
        }

        if let Some(deadline) = self
            .application
            .space
            .ack_delay_deadline(self.transport_config.max_ack_delay.as_millis() as u64)
        {
            if now_millis >= deadline {
                self.flush_ack(SpaceLevel::Application, now_millis);
            }
        }

        for level in [SpaceLevel::Initial, SpaceLevel::Handshake, SpaceLevel::Application] {
            if let Some(deadline) = self.pto_deadline(level, now_millis) {
                if now_millis >= deadline {
                    self.fire_pto(level);
                }
            }
        }
    }

    /// On PTO fire: bump `pto_count` and mark the oldest unacked packet beyond
    /// `largest_ack` for retransmission.
    fn fire_pto(&mut self, level: SpaceLevel) {
        self.pto_count += 1;
        let Some(level_state) = self.level_state_mut(level) else { return };
        let largest_acked = level_state.space.largest_acked_by_peer.unwrap_or(0);
        let oldest = level_state
            .space
            .sent
            .values()
            .filter(|p| p.pn > largest_acked)
            .min_by_key(|p| p.pn)
            .map(|p| p.pn);
        if let Some(pn) = oldest {
            if let Some(sent_packet) = level_state.space.sent.remove(&pn) {
                self.requeue_lost_frames(level, sent_packet.frames);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::fixture::{XorHeaderKey, XorPacketKey};

    fn test_endpoint() -> EndpointConfig {
        EndpointConfig::new(Arc::new(TestHmac))
    }

    struct TestHmac;
    impl crate::crypto::HmacKey for TestHmac {
        fn sign(&self, data: &[u8]) -> Vec<u8> {
            data.iter().map(|b| b ^ 0x5a).collect()
        }
    }

    struct NoopSession {
        done: bool,
        initial_keys: Option<Keys>,
    }
    impl Session for NoopSession {
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
            !self.done
        }
        fn read_handshake(&mut self, _level: crypto::Level, _data: &[u8]) {
            self.done = true;
        }
        fn write_handshake(&mut self, _buf: &mut Vec<u8>) -> Option<crypto::Level> {
            None
        }
        fn step(&mut self) -> HandshakeStep {
            if self.done {
                HandshakeStep::Done
            } else {
                HandshakeStep::NeedInput
            }
        }
        fn take_keys(&mut self, level: crypto::Level) -> Option<Keys> {
            if level == crypto::Level::Initial {
                self.initial_keys.take()
            } else {
                None
            }
        }
        fn alpn_protocol(&self) -> Option<&[u8]> {
            Some(b"h3")
        }
        fn transport_parameters(&self) -> Option<&[u8]> {
            Some(&[])
        }
        fn set_transport_parameters(&mut self, _params: &[u8]) {}
    }

    fn test_connection() -> Connection {
        let endpoint = test_endpoint();
        let server_config = Arc::new(ServerConfig::new(Arc::new(TestTokenKey)));
        Connection::accept(
            1,
            ConnectionId::from_slice(&[1; 8]),
            ConnectionId::from_slice(&[2; 8]),
            ConnectionId::from_slice(&[3; 8]),
            None,
            &endpoint,
            server_config,
            Box::new(NoopSession { done: false, initial_keys: None }),
            0,
        )
    }

    struct TestTokenKey;
    impl crate::crypto::HandshakeTokenKey for TestTokenKey {
        fn aead_from_hkdf(&self, random_bytes: &[u8]) -> Box<dyn crate::crypto::PacketKey> {
            Box::new(XorPacketKey(random_bytes.first().copied().unwrap_or(0)))
        }
    }

    #[test]
    fn accept_installs_initial_keys_and_starts_in_handshake_state() {
        let conn = test_connection();
        assert_eq!(conn.state, ConnectionState::Handshake);
        assert!(conn.initial.as_ref().unwrap().keys.is_some());
    }

    #[test]
    fn stream_send_respects_connection_flow_control() {
        let mut conn = test_connection();
        conn.conn_send_max_data = 1000;
        conn.streams.set_peer_limits(10, 10);
        let id = conn.streams.open_local(StreamDir::Uni).unwrap();
        if let Some(stream) = conn.streams.get_mut(id) {
            stream.send_max_data = 10_000;
        }
        let sent = conn.stream_send(id, &vec![0u8; 4096], false);
        assert_eq!(sent, 1000);
        assert!(conn.send_flow_blocked);
    }

    #[test]
    fn close_with_error_transitions_to_closing_and_queues_connection_close() {
        let mut conn = test_connection();
        conn.close_with_error(TransportError::protocol_violation("test"), 0);
        assert_eq!(conn.state, ConnectionState::Closing);
        assert!(conn.error.is_some());
    }

    #[test]
    fn retire_connection_id_frees_entry_and_queues_replacement_seq() {
        let mut conn = test_connection();
        let entry = conn.local_cids.issue(|_| [9; 16]);
        assert!(conn.local_cids.retire(entry.seq));
        assert!(!conn.local_cids.retire(entry.seq));
    }

    #[test]
    fn pn_field_location_matches_header_layout_for_short_header() {
        let located = locate_pn_field(&[0u8; 20], false, 8).unwrap();
        assert_eq!(located.pn_offset, 9);
        assert_eq!(located.sample_offset, 13);
    }
}
