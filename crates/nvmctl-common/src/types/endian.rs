//! Little-endian scalar wrappers for on-media structures.
//!
//! The NVDIMM label and BTT formats are little-endian regardless of host
//! byte order. These wrappers store the raw media bytes and convert on
//! access, so a `#[repr(C)]` struct of them can be cast straight out of a
//! config-area or info-block buffer with bytemuck.

use core::fmt;

macro_rules! le_int {
    ($name:ident, $int:ty, $bytes:literal) => {
        #[repr(transparent)]
        #[derive(Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
        pub struct $name([u8; $bytes]);

        impl $name {
            pub const fn new(value: $int) -> Self {
                Self(value.to_le_bytes())
            }

            pub const fn get(&self) -> $int {
                <$int>::from_le_bytes(self.0)
            }

            pub fn set(&mut self, value: $int) {
                self.0 = value.to_le_bytes();
            }
        }

        impl From<$int> for $name {
            fn from(value: $int) -> Self {
                Self::new(value)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new(0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.get()).finish()
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.get(), f)
            }
        }
    };
}

le_int!(Le16, u16, 2);
le_int!(Le32, u32, 4);
le_int!(Le64, u64, 8);
