//! Segmented slot-pool handle resolution.
//!
//! The host's pool keeps block 0 behind a pointer in the pool header and every
//! later block behind a directory of pointer pairs. A handle is split with
//! block 0's capacity as the division unit, whatever the real size of later
//! blocks, because that is how the host indexes its own pools.
//!
//! Nothing here bounds-checks a handle against the pool's slot count: a valid
//! handle in gives an address out, and an out-of-range handle reads or writes
//! whatever memory the arithmetic lands on.
use serde::Serialize;
use tracing::debug;

use crate::core::directory::Directory;
use crate::core::error::{Error, ErrorKind};
use crate::core::geometry::PoolGeometry;
use crate::core::memory::Memory;

/// Opaque registration handle; 16-bit in the observed binding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Handle(u64);

impl Handle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl From<u16> for Handle {
    fn from(raw: u16) -> Self {
        Self(raw.into())
    }
}

impl From<u32> for Handle {
    fn from(raw: u32) -> Self {
        Self(raw.into())
    }
}

impl From<u64> for Handle {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct DirectoryEntry {
    /// `(block_index - 1) >> 1`
    pub pair_index: u64,
    /// `block_index & 1`: which pointer of the pair holds the block.
    pub parity: u64,
    #[serde(with = "crate::core::hexint")]
    pub pair_address: u64,
}

/// Every intermediate value of one resolution, for diagnostics.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct SlotLocation {
    pub handle: Handle,
    pub block_capacity: u64,
    pub block_index: u64,
    pub index_in_block: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<DirectoryEntry>,
    #[serde(with = "crate::core::hexint")]
    pub block_base: u64,
    #[serde(with = "crate::core::hexint")]
    pub data_start: u64,
    #[serde(with = "crate::core::hexint")]
    pub aligned_start: u64,
    #[serde(with = "crate::core::hexint")]
    pub slot_address: u64,
    #[serde(with = "crate::core::hexint")]
    pub control_word_address: u64,
}

/// A pool header in foreign memory plus the means to walk it.
pub struct SlotPool<'a, M: Memory + ?Sized, D: Directory<M> + ?Sized> {
    memory: &'a M,
    directory: &'a D,
    geometry: &'a PoolGeometry,
    header: u64,
}

impl<'a, M: Memory + ?Sized, D: Directory<M> + ?Sized> SlotPool<'a, M, D> {
    pub fn new(memory: &'a M, directory: &'a D, geometry: &'a PoolGeometry, header: u64) -> Self {
        Self {
            memory,
            directory,
            geometry,
            header,
        }
    }

    pub fn header(&self) -> u64 {
        self.header
    }

    /// Block 0's slot count, re-read on every call.
    pub fn block_capacity(&self) -> Result<u64, Error> {
        let address = self.header.wrapping_add(self.geometry.capacity_offset);
        let capacity = self.memory.read_u64(address)?;
        if capacity == 0 {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("pool block capacity is zero")
                .with_address(address));
        }
        Ok(capacity)
    }

    /// Base address of `block_index`, and the directory entry consulted for it.
    /// Block 0 is read straight from the header.
    pub fn block_base(&self, block_index: u64) -> Result<(u64, Option<DirectoryEntry>), Error> {
        if block_index == 0 {
            let base = self
                .memory
                .read_u64(self.header.wrapping_add(self.geometry.first_block_offset))?;
            return Ok((base, None));
        }
        let pair_index = (block_index - 1) >> 1;
        let parity = block_index & 1;
        let pair_address = self
            .directory
            .pair_address(self.memory, self.header, pair_index)?;
        let base = self.memory.read_u64(pair_address.wrapping_add(8 * parity))?;
        Ok((
            base,
            Some(DirectoryEntry {
                pair_index,
                parity,
                pair_address,
            }),
        ))
    }

    pub fn locate(&self, handle: Handle) -> Result<SlotLocation, Error> {
        let block_capacity = self.block_capacity()?;
        let block_index = handle.raw() / block_capacity;
        let index_in_block = handle.raw() % block_capacity;
        let (block_base, directory) = self.block_base(block_index)?;

        let data_start = block_base.wrapping_add(self.geometry.block_header_len);
        let aligned_start = data_start.wrapping_add(self.geometry.align_padding(data_start));
        let slot_address =
            aligned_start.wrapping_add(index_in_block.wrapping_mul(self.geometry.slot_stride));

        Ok(SlotLocation {
            handle,
            block_capacity,
            block_index,
            index_in_block,
            directory,
            block_base,
            data_start,
            aligned_start,
            slot_address,
            control_word_address: slot_address.wrapping_add(self.geometry.control_word_offset),
        })
    }

    pub fn resolve(&self, handle: Handle) -> Result<u64, Error> {
        Ok(self.locate(handle)?.slot_address)
    }

    pub fn control_word(&self, handle: Handle) -> Result<u32, Error> {
        let location = self.locate(handle)?;
        self.memory.read_u32(location.control_word_address)
    }

    pub fn is_free(&self, handle: Handle) -> Result<bool, Error> {
        Ok(self.control_word(handle)? & self.geometry.free_bit != 0)
    }

    /// Sets the free bit in the slot's control word and returns the slot
    /// address. Plain read-modify-write: the caller must hold whatever
    /// serialization the host uses for this pool.
    pub fn release(&self, handle: Handle) -> Result<u64, Error> {
        Ok(self.release_located(handle)?.slot_address)
    }

    /// Like [`SlotPool::release`], returning the full breakdown.
    pub fn release_located(&self, handle: Handle) -> Result<SlotLocation, Error> {
        let location = self.locate(handle)?;
        let word = self.memory.read_u32(location.control_word_address)?;
        self.memory
            .write_u32(location.control_word_address, word | self.geometry.free_bit)?;
        debug!(
            handle = handle.raw(),
            block_index = location.block_index,
            index_in_block = location.index_in_block,
            slot_address = location.slot_address,
            was_free = word & self.geometry.free_bit != 0,
            "released pool slot"
        );
        Ok(location)
    }
}

/// Resolves `handle` inside the pool at `pool_header` and marks its slot free.
pub fn resolve_and_release<M, D>(
    memory: &M,
    directory: &D,
    geometry: &PoolGeometry,
    pool_header: u64,
    handle: Handle,
) -> Result<u64, Error>
where
    M: Memory + ?Sized,
    D: Directory<M> + ?Sized,
{
    SlotPool::new(memory, directory, geometry, pool_header).release(handle)
}
