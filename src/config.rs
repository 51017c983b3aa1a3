//! Configuration surface: `TransportConfig` / `EndpointConfig` / `ServerConfig`, mirroring
//! the builder trio `quinn-proto` exposes over the same knobs (spec.md §2 item 13, §3
//! "Configuration objects", §6 "Configuration").

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::congestion::MTU as DEFAULT_MTU;
use crate::crypto::HandshakeTokenKey;
use crate::primitives::varint::{VarInt, VarIntBoundsExceeded};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("configuration value out of valid range")]
    OutOfBounds,
}

impl From<VarIntBoundsExceeded> for ConfigError {
    fn from(_: VarIntBoundsExceeded) -> Self {
        ConfigError::OutOfBounds
    }
}

/// Per-connection tunables: local transport parameters plus the
/// loss/congestion knobs the original source hard-coded as constants.
#[derive(Clone)]
pub struct TransportConfig {
    pub(crate) initial_max_data: VarInt,
    pub(crate) initial_max_stream_data_bidi_local: VarInt,
    pub(crate) initial_max_stream_data_bidi_remote: VarInt,
    pub(crate) initial_max_stream_data_uni: VarInt,
    pub(crate) initial_max_streams_bidi: VarInt,
    pub(crate) initial_max_streams_uni: VarInt,
    pub(crate) max_idle_timeout: Duration,
    pub(crate) max_ack_delay: Duration,
    pub(crate) ack_delay_exponent: u8,
    pub(crate) active_connection_id_limit: VarInt,
    pub(crate) max_udp_payload_size: VarInt,
    pub(crate) stream_receive_window: VarInt,

    pub(crate) packet_threshold: u32,
    pub(crate) time_threshold_num: u32,
    pub(crate) time_threshold_den: u32,
    pub(crate) initial_rtt: Duration,
    pub(crate) persistent_congestion_threshold: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            initial_max_data: VarInt::from_u32(1 << 20),
            initial_max_stream_data_bidi_local: VarInt::from_u32(1 << 20),
            initial_max_stream_data_bidi_remote: VarInt::from_u32(1 << 20),
            initial_max_stream_data_uni: VarInt::from_u32(1 << 20),
            initial_max_streams_bidi: VarInt::from_u32(100),
            initial_max_streams_uni: VarInt::from_u32(100),
            max_idle_timeout: Duration::from_secs(30),
            max_ack_delay: Duration::from_millis(25),
            ack_delay_exponent: 3,
            active_connection_id_limit: VarInt::from_u32(4),
            max_udp_payload_size: VarInt::from_u32(1200),
            stream_receive_window: VarInt::from_u32(64 * 1024),
            packet_threshold: 3,
            time_threshold_num: 9,
            time_threshold_den: 8,
            initial_rtt: Duration::from_millis(333),
            persistent_congestion_threshold: 3,
        }
    }
}

impl TransportConfig {
    pub fn initial_max_data(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        self.initial_max_data = value.try_into()?;
        Ok(self)
    }

    pub fn initial_max_stream_data_bidi_local(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        self.initial_max_stream_data_bidi_local = value.try_into()?;
        Ok(self)
    }

    pub fn initial_max_stream_data_bidi_remote(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        self.initial_max_stream_data_bidi_remote = value.try_into()?;
        Ok(self)
    }

    pub fn initial_max_stream_data_uni(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        self.initial_max_stream_data_uni = value.try_into()?;
        Ok(self)
    }

    pub fn initial_max_streams_bidi(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        self.initial_max_streams_bidi = value.try_into()?;
        Ok(self)
    }

    pub fn initial_max_streams_uni(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        self.initial_max_streams_uni = value.try_into()?;
        Ok(self)
    }

    pub fn max_idle_timeout(&mut self, value: Duration) -> &mut Self {
        self.max_idle_timeout = value;
        self
    }

    pub fn max_ack_delay(&mut self, value: Duration) -> &mut Self {
        self.max_ack_delay = value;
        self
    }

    pub fn ack_delay_exponent(&mut self, value: u8) -> &mut Self {
        self.ack_delay_exponent = value;
        self
    }

    pub fn active_connection_id_limit(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        if value < 2 {
            return Err(ConfigError::OutOfBounds);
        }
        self.active_connection_id_limit = value.try_into()?;
        Ok(self)
    }

    /// Must fall within `[1200, 65527]`.
    pub fn max_udp_payload_size(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        if !(1200..=65527).contains(&value) {
            return Err(ConfigError::OutOfBounds);
        }
        self.max_udp_payload_size = value.try_into()?;
        Ok(self)
    }

    pub fn stream_receive_window(&mut self, value: u64) -> Result<&mut Self, ConfigError> {
        self.stream_receive_window = value.try_into()?;
        Ok(self)
    }

    pub fn packet_threshold(&mut self, value: u32) -> &mut Self {
        self.packet_threshold = value.max(1);
        self
    }

    pub fn time_threshold(&mut self, numerator: u32, denominator: u32) -> &mut Self {
        self.time_threshold_num = numerator;
        self.time_threshold_den = denominator.max(1);
        self
    }

    pub fn initial_rtt(&mut self, value: Duration) -> &mut Self {
        self.initial_rtt = value;
        self
    }

    pub fn persistent_congestion_threshold(&mut self, value: u32) -> &mut Self {
        self.persistent_congestion_threshold = value;
        self
    }

    pub(crate) fn max_udp_payload_size_or_default(&self) -> u64 {
        if self.max_udp_payload_size.into_inner() == 0 {
            DEFAULT_MTU
        } else {
            self.max_udp_payload_size.into_inner()
        }
    }
}

/// Per-endpoint configuration: local CID issuance policy, the keys used for stateless
/// reset, and the QUIC versions this endpoint accepts.
pub struct EndpointConfig {
    pub(crate) local_cid_len: usize,
    pub(crate) reset_key: Arc<dyn crate::crypto::HmacKey>,
    pub(crate) supported_versions: Vec<u32>,
}

impl EndpointConfig {
    pub fn new(reset_key: Arc<dyn crate::crypto::HmacKey>) -> Self {
        Self {
            local_cid_len: 8,
            reset_key,
            supported_versions: vec![1],
        }
    }

    pub fn local_cid_len(&mut self, value: usize) -> Result<&mut Self, ConfigError> {
        if value > crate::packet::types::MAX_CID_LEN {
            return Err(ConfigError::OutOfBounds);
        }
        self.local_cid_len = value;
        self
    }

    pub fn supported_versions(&mut self, value: Vec<u32>) -> &mut Self {
        self.supported_versions = value;
        self
    }
}

/// Per-listener configuration: the transport tunables new connections inherit, token
/// sealing keys, and the ALPN/retry policy.
pub struct ServerConfig {
    pub(crate) transport: Arc<TransportConfig>,
    pub(crate) token_key: Arc<dyn HandshakeTokenKey>,
    pub(crate) require_alpn: bool,
    pub(crate) retry: bool,
    pub(crate) retry_token_lifetime: Duration,
    pub(crate) new_token_lifetime: Duration,
    pub(crate) concurrent_connections: u32,
}

impl ServerConfig {
    pub fn new(token_key: Arc<dyn HandshakeTokenKey>) -> Self {
        Self {
            transport: Arc::new(TransportConfig::default()),
            token_key,
            require_alpn: true,
            retry: false,
            retry_token_lifetime: Duration::from_secs(10),
            new_token_lifetime: Duration::from_secs(2 * 7 * 24 * 3600),
            concurrent_connections: 100_000,
        }
    }

    pub fn transport_config(&mut self, value: Arc<TransportConfig>) -> &mut Self {
        self.transport = value;
        self
    }

    pub fn require_alpn(&mut self, value: bool) -> &mut Self {
        self.require_alpn = value;
        self
    }

    pub fn retry(&mut self, value: bool) -> &mut Self {
        self.retry = value;
        self
    }

    pub fn retry_token_lifetime(&mut self, value: Duration) -> &mut Self {
        self.retry_token_lifetime = value;
        self
    }

    pub fn new_token_lifetime(&mut self, value: Duration) -> &mut Self {
        self.new_token_lifetime = value;
        self
    }

    pub fn concurrent_connections(&mut self, value: u32) -> &mut Self {
        self.concurrent_connections = value;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transport_config_defaults_are_internet_reasonable() {
        let config = TransportConfig::default();
        assert_eq!(config.max_udp_payload_size.into_inner(), 1200);
        assert_eq!(config.active_connection_id_limit.into_inner(), 4);
    }

    #[test]
    fn max_udp_payload_size_rejects_out_of_range() {
        let mut config = TransportConfig::default();
        assert!(config.max_udp_payload_size(100).is_err());
        assert!(config.max_udp_payload_size(70_000).is_err());
        assert!(config.max_udp_payload_size(1200).is_ok());
    }

    #[test]
    fn active_connection_id_limit_rejects_below_two() {
        let mut config = TransportConfig::default();
        assert!(config.active_connection_id_limit(1).is_err());
        assert!(config.active_connection_id_limit(2).is_ok());
    }
}
