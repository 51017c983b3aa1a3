mod connection;
mod types;

pub use connection::{Connection, Transmit};
pub(crate) use connection::stateless_reset_token;
pub(crate) use types::ConnectionState;
pub use types::{ErrorSlot, TransportParameters};
