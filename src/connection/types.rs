//! Supporting types for the connection engine: lifecycle state, transport parameters, and
//! the error slot.

use crate::packet::types::ConnectionId;
use crate::result::TransportErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    /// Handshake in progress; Initial (and possibly Handshake) keys only.
    Handshake,
    /// 1-RTT keys installed and HANDSHAKE_DONE sent/received.
    Connected,
    /// Local or remote CONNECTION_CLOSE sent/received; close timer running.
    Closing,
    /// Draining after a peer CONNECTION_CLOSE or a detected stateless reset.
    Draining,
    /// Close timer expired or idle timeout fired; the connection is inert.
    Closed,
}

/// The subset of transport parameters this engine negotiates.
#[derive(Debug, Clone)]
pub struct TransportParameters {
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub max_idle_timeout_millis: u64,
    pub max_ack_delay_millis: u64,
    pub ack_delay_exponent: u8,
    pub active_connection_id_limit: u64,
    pub max_udp_payload_size: u64,
    pub initial_source_connection_id: Option<ConnectionId>,
    pub original_destination_connection_id: Option<ConnectionId>,
    pub retry_source_connection_id: Option<ConnectionId>,
}

impl TransportParameters {
    pub fn from_config(config: &crate::config::TransportConfig) -> Self {
        Self {
            initial_max_data: config.initial_max_data.into_inner(),
            initial_max_stream_data_bidi_local: config.initial_max_stream_data_bidi_local.into_inner(),
            initial_max_stream_data_bidi_remote: config.initial_max_stream_data_bidi_remote.into_inner(),
            initial_max_stream_data_uni: config.initial_max_stream_data_uni.into_inner(),
            initial_max_streams_bidi: config.initial_max_streams_bidi.into_inner(),
            initial_max_streams_uni: config.initial_max_streams_uni.into_inner(),
            max_idle_timeout_millis: config.max_idle_timeout.as_millis() as u64,
            max_ack_delay_millis: config.max_ack_delay.as_millis() as u64,
            ack_delay_exponent: config.ack_delay_exponent,
            active_connection_id_limit: config.active_connection_id_limit.into_inner(),
            max_udp_payload_size: config.max_udp_payload_size_or_default(),
            initial_source_connection_id: None,
            original_destination_connection_id: None,
            retry_source_connection_id: None,
        }
    }
}

/// Populated on the first connection-fatal offense and never overwritten afterward during
/// the same close attempt.
#[derive(Debug, Clone)]
pub struct ErrorSlot {
    pub level: crate::space::Level,
    pub code: TransportErrorCode,
    pub frame_type: Option<u64>,
    pub reason: String,
    pub is_app: bool,
}
