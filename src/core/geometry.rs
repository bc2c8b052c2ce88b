// Constants describing one host build's slot-pool allocator.
// Defaults are the values recovered from the observed build; treat them as
// configuration, since other builds may move any of them.
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};

pub const DEFAULT_CAPACITY_OFFSET: u64 = 40;
pub const DEFAULT_FIRST_BLOCK_OFFSET: u64 = 8;
pub const DEFAULT_BLOCK_HEADER_LEN: u64 = 16;
pub const DEFAULT_SLOT_ALIGN: u64 = 8;
pub const DEFAULT_SLOT_STRIDE: u64 = 80;
pub const DEFAULT_CONTROL_WORD_OFFSET: u64 = 12;
pub const DEFAULT_FREE_BIT: u32 = 1;
pub const DEFAULT_PAIR_TABLE_OFFSET: u64 = 24;
pub const PAIR_STRIDE_MIN: u64 = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolGeometry {
    /// Pool header offset of block 0's slot count, the handle division unit.
    #[serde(with = "crate::core::hexint")]
    pub capacity_offset: u64,
    /// Pool header offset of block 0's base pointer.
    #[serde(with = "crate::core::hexint")]
    pub first_block_offset: u64,
    /// Bytes between a block's base and its (unaligned) data region.
    #[serde(with = "crate::core::hexint")]
    pub block_header_len: u64,
    #[serde(with = "crate::core::hexint")]
    pub slot_align: u64,
    #[serde(with = "crate::core::hexint")]
    pub slot_stride: u64,
    #[serde(with = "crate::core::hexint")]
    pub control_word_offset: u64,
    /// Mask OR-ed into the control word on release.
    pub free_bit: u32,
    pub directory: PairTableGeometry,
}

/// Where a snapshot finds the block-pointer pairs the host's own lookup
/// function would return. Unverified against the host: the live path calls
/// the host function instead.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairTableGeometry {
    #[serde(with = "crate::core::hexint")]
    pub table_offset: u64,
    #[serde(with = "crate::core::hexint")]
    pub pair_stride: u64,
}

impl Default for PoolGeometry {
    fn default() -> Self {
        Self {
            capacity_offset: DEFAULT_CAPACITY_OFFSET,
            first_block_offset: DEFAULT_FIRST_BLOCK_OFFSET,
            block_header_len: DEFAULT_BLOCK_HEADER_LEN,
            slot_align: DEFAULT_SLOT_ALIGN,
            slot_stride: DEFAULT_SLOT_STRIDE,
            control_word_offset: DEFAULT_CONTROL_WORD_OFFSET,
            free_bit: DEFAULT_FREE_BIT,
            directory: PairTableGeometry::default(),
        }
    }
}

impl Default for PairTableGeometry {
    fn default() -> Self {
        Self {
            table_offset: DEFAULT_PAIR_TABLE_OFFSET,
            pair_stride: PAIR_STRIDE_MIN,
        }
    }
}

impl PoolGeometry {
    pub fn validate(&self) -> Result<(), Error> {
        if self.slot_stride == 0 {
            return Err(invalid("slot_stride must be non-zero"));
        }
        if self.slot_align == 0 || !self.slot_align.is_power_of_two() {
            return Err(invalid("slot_align must be a power of two"));
        }
        if self.free_bit == 0 {
            return Err(invalid("free_bit mask must be non-zero"));
        }
        if self.control_word_offset.saturating_add(4) > self.slot_stride {
            return Err(invalid("control word must fit inside one slot"));
        }
        if self.directory.pair_stride < PAIR_STRIDE_MIN {
            return Err(invalid("directory pair_stride must hold two pointers"));
        }
        Ok(())
    }

    /// Padding from `data_start` up to the next `slot_align` boundary,
    /// computed as `(-data_start) & (align - 1)`.
    pub fn align_padding(&self, data_start: u64) -> u64 {
        data_start.wrapping_neg() & self.slot_align.wrapping_sub(1)
    }
}

fn invalid(message: &str) -> Error {
    Error::new(ErrorKind::Layout).with_message(format!("pool geometry: {message}"))
}
