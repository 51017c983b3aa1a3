pub mod bits;
pub mod rand;
pub mod varint;

pub use bits::*;
pub use rand::*;
pub use varint::*;
