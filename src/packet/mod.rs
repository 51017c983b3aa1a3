pub mod frame;
pub mod header;
pub mod packet;
pub mod types;

pub use types::*;
