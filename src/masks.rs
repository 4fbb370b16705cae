// Warp/Lane Masks - bit-mask newtypes for resident warps and lanes
// A set bit means the warp (lane) exists/is selected at that index.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Mask of warps resident on one SM. Bit `i` refers to warp `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WarpMask(pub u64);

/// Mask of lanes within one warp. Bit `i` refers to lane `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LaneMask(pub u64);

macro_rules! mask_impl {
    ($name:ident) => {
        impl $name {
            pub const EMPTY: $name = $name(0);

            pub fn contains(&self, idx: u32) -> bool {
                idx < 64 && self.0 & (1u64 << idx) != 0
            }

            pub fn set(&mut self, idx: u32) {
                debug_assert!(idx < 64);
                self.0 |= 1u64 << idx;
            }

            pub fn clear(&mut self, idx: u32) {
                debug_assert!(idx < 64);
                self.0 &= !(1u64 << idx);
            }

            pub fn is_empty(&self) -> bool {
                self.0 == 0
            }

            pub fn count(&self) -> u32 {
                self.0.count_ones()
            }

            /// Index of the lowest set bit, if any.
            pub fn lowest(&self) -> Option<u32> {
                if self.0 == 0 {
                    None
                } else {
                    Some(self.0.trailing_zeros())
                }
            }

            pub fn intersects(&self, other: $name) -> bool {
                self.0 & other.0 != 0
            }

            pub fn and_not(&self, other: $name) -> $name {
                $name(self.0 & !other.0)
            }

            pub fn union(&self, other: $name) -> $name {
                $name(self.0 | other.0)
            }

            /// Iterate set bit indices in ascending order.
            pub fn iter(&self) -> impl Iterator<Item = u32> {
                let bits = self.0;
                (0..64u32).filter(move |i| bits & (1u64 << i) != 0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:016x}", self.0)
            }
        }
    };
}

mask_impl!(WarpMask);
mask_impl!(LaneMask);
