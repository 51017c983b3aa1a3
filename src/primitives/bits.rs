use std::fmt::Debug;

/// A fixed-width packed bit sequence, least-significant bit first.
///
/// Header flag bytes are a grab-bag of 1/2/4-bit fields; modeling each field as its own
/// small `Bits<N, u8>` keeps the header codec declarative instead of a wall of manual
/// shifts, at the cost of a little indirection.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct Bits<const N: usize> {
    bits: [bool; N],
}

impl<const N: usize> Bits<N> {
    pub const fn zero() -> Self {
        Self { bits: [false; N] }
    }

    pub fn from_value(value: u8) -> Self {
        let mut bits = [false; N];
        for (i, bit) in bits.iter_mut().enumerate() {
            *bit = (value >> i) & 1 == 1;
        }
        Self { bits }
    }

    pub fn from_bits(bits: [bool; N]) -> Self {
        Self { bits }
    }

    pub fn value(&self) -> u8 {
        let mut out = 0u8;
        for (i, &bit) in self.bits.iter().enumerate() {
            if bit {
                out |= 1 << i;
            }
        }
        out
    }

    pub fn bits(&self) -> &[bool; N] {
        &self.bits
    }
}

/// Common accessors shared by every fixed-width bit-field newtype produced by [`bits_field!`].
pub trait BitField: Sized + Debug + PartialEq {
    const WIDTH: usize;

    fn from_value(value: u8) -> Self;
    fn value(&self) -> u8;

    fn zero() -> Self {
        Self::from_value(0)
    }

    fn one() -> Self {
        Self::from_value(1)
    }
}

/// Splits `byte`, LSB first, into consecutive bit-groups of the requested widths.
///
/// `widths` must sum to at most 8. Returns one `Vec<bool>` per requested width, in order.
pub fn split_bits(mut byte: u8, widths: &[u8]) -> Vec<Vec<bool>> {
    let mut groups = Vec::with_capacity(widths.len());
    for &width in widths {
        let mut group = Vec::with_capacity(width as usize);
        for _ in 0..width {
            group.push(byte & 1 == 1);
            byte >>= 1;
        }
        groups.push(group);
    }
    groups
}

/// Inverse of [`split_bits`]: packs bit-groups back into a single byte, LSB first.
pub fn join_bits(groups: &[&[bool]]) -> u8 {
    let mut byte = 0u8;
    let mut shift = 0u32;
    for group in groups {
        for &bit in *group {
            if bit {
                byte |= 1 << shift;
            }
            shift += 1;
        }
    }
    byte
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_then_join_is_identity() {
        for byte in 0..=255u8 {
            let groups = split_bits(byte, &[1, 1, 2, 4]);
            let refs: Vec<&[bool]> = groups.iter().map(|g| g.as_slice()).collect();
            assert_eq!(join_bits(&refs), byte);
        }
    }

    #[test]
    fn bits_value_round_trips() {
        for value in 0..16u8 {
            let b = Bits::<4>::from_value(value);
            assert_eq!(b.value(), value);
        }
    }
}
