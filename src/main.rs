pub mod primitives;
pub use primitives::*;

pub mod cid;
pub mod config;
pub mod congestion;
pub mod connection;
pub mod crypto;
pub mod endpoint;
pub mod macros;
pub mod packet;
pub mod recovery;
pub mod result;
pub mod space;
pub mod streams;
pub mod token;

pub const QUIC_VERSION_1: u32 = 0x0000_0001;
pub const QUIC_VERSION_DRAFT29: u32 = 0xff00_001d;

fn main() {
    println!("quic-proto: server-side QUIC transport engine library; see tests for usage");
}
