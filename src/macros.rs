/// Declares a newtype wrapping an `N`-bit field of a header flags byte, implementing
/// [`crate::primitives::bits::BitField`] for it.
#[macro_export]
macro_rules! bits_field {
    ($structname:ident, $len:literal) => {
        #[repr(transparent)]
        #[derive(PartialEq, Eq, Clone, Copy, Debug)]
        pub struct $structname($crate::primitives::bits::Bits<$len>);

        impl $crate::primitives::bits::BitField for $structname {
            const WIDTH: usize = $len;

            fn from_value(value: u8) -> Self {
                Self($crate::primitives::bits::Bits::from_value(value))
            }

            fn value(&self) -> u8 {
                self.0.value()
            }
        }
    };
}

/// Declares the `FrameType` enum of wire frame-type tags and a `try_from_u64` lookup,
/// used to dispatch frame decoding by the first varint in a frame's encoding.
#[macro_export]
macro_rules! frame_types {
    {$($typename:ident = $encoding:expr,)*} => {
        #[allow(non_camel_case_types)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum FrameTypeTag {
            $($typename),*
        }

        impl FrameTypeTag {
            pub const fn wire_value(self) -> u64 {
                match self {
                    $(Self::$typename => $encoding),*
                }
            }

            pub fn try_from_u64(value: u64) -> Option<Self> {
                match value {
                    $($encoding => Some(Self::$typename),)*
                    _ => None,
                }
            }
        }
    }
}
