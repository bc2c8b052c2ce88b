// Block directory lookup: maps a pair index to the address of two adjacent
// 8-byte block pointers. The host does this with its own function; snapshots
// use a declared pair table instead.
use std::ffi::c_void;

use tracing::trace;

use crate::core::error::{Error, ErrorKind};
use crate::core::geometry::PairTableGeometry;
use crate::core::memory::{Memory, ProcessMemory};

pub trait Directory<M: Memory + ?Sized> {
    /// Address of directory entry `pair_index`: two consecutive block pointers.
    fn pair_address(&self, memory: &M, pool: u64, pair_index: u64) -> Result<u64, Error>;
}

/// Pair array whose base pointer is stored in the pool header.
#[derive(Clone, Copy, Debug)]
pub struct PairTable {
    geometry: PairTableGeometry,
}

impl PairTable {
    pub fn new(geometry: PairTableGeometry) -> Self {
        Self { geometry }
    }
}

impl<M: Memory + ?Sized> Directory<M> for PairTable {
    fn pair_address(&self, memory: &M, pool: u64, pair_index: u64) -> Result<u64, Error> {
        let table = memory.read_u64(pool.wrapping_add(self.geometry.table_offset))?;
        let pair = table.wrapping_add(pair_index.wrapping_mul(self.geometry.pair_stride));
        trace!(pool, pair_index, table, pair, "pair table lookup");
        Ok(pair)
    }
}

/// Signature of the host's pool item lookup.
pub type PoolFindItemFn = unsafe extern "C" fn(pool: *mut c_void, index: u64) -> *mut u8;

/// Calls the host's own lookup function in the current process.
#[derive(Clone, Copy, Debug)]
pub struct HostDirectory {
    find_item: PoolFindItemFn,
}

impl HostDirectory {
    pub fn new(find_item: PoolFindItemFn) -> Self {
        Self { find_item }
    }

    /// # Safety
    ///
    /// `address` must be the entry point of a function with the
    /// [`PoolFindItemFn`] signature inside the current process.
    pub unsafe fn from_address(address: u64) -> Result<Self, Error> {
        if address == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("pool lookup function address is null"));
        }
        let find_item = unsafe { std::mem::transmute::<usize, PoolFindItemFn>(address as usize) };
        Ok(Self { find_item })
    }
}

impl Directory<ProcessMemory> for HostDirectory {
    fn pair_address(&self, _memory: &ProcessMemory, pool: u64, pair_index: u64) -> Result<u64, Error> {
        let pair = unsafe { (self.find_item)(pool as usize as *mut c_void, pair_index) } as u64;
        trace!(pool, pair_index, pair, "host pool lookup");
        if pair == 0 {
            return Err(Error::new(ErrorKind::Fault)
                .with_message(format!("host lookup returned null for pair {pair_index}"))
                .with_address(pool));
        }
        Ok(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::{Directory, HostDirectory, PairTable};
    use crate::core::error::ErrorKind;
    use crate::core::geometry::PairTableGeometry;
    use crate::core::memory::{Memory, ProcessMemory, Segment, SnapshotMemory};
    use std::ffi::c_void;

    #[test]
    fn pair_table_strides_from_header_pointer() {
        let memory = SnapshotMemory::new()
            .with_segment(Segment::zeroed(0x100, 0x40))
            .expect("segment");
        memory.write_u64(0x100 + 24, 0x8000).expect("table");
        let table = PairTable::new(PairTableGeometry::default());
        assert_eq!(table.pair_address(&memory, 0x100, 0).expect("pair"), 0x8000);
        assert_eq!(table.pair_address(&memory, 0x100, 3).expect("pair"), 0x8030);
    }

    #[test]
    fn pair_table_faults_on_unmapped_header() {
        let memory = SnapshotMemory::new();
        let table = PairTable::new(PairTableGeometry::default());
        let err = table.pair_address(&memory, 0x100, 0).expect_err("fault");
        assert_eq!(err.kind(), ErrorKind::Fault);
    }

    extern "C" fn fake_find_item(pool: *mut c_void, index: u64) -> *mut u8 {
        (pool as u64 + 0x100 + index * 16) as usize as *mut u8
    }

    extern "C" fn null_find_item(_pool: *mut c_void, _index: u64) -> *mut u8 {
        std::ptr::null_mut()
    }

    #[test]
    fn host_directory_calls_bound_function() {
        let memory = unsafe { ProcessMemory::new() };
        let address = fake_find_item as usize as u64;
        let directory = unsafe { HostDirectory::from_address(address) }.expect("bind");
        assert_eq!(directory.pair_address(&memory, 0x5000, 2).expect("pair"), 0x5120);

        let directory = HostDirectory::new(null_find_item);
        let err = directory.pair_address(&memory, 0x5000, 0).expect_err("null");
        assert_eq!(err.kind(), ErrorKind::Fault);

        let err = unsafe { HostDirectory::from_address(0) }.expect_err("null address");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
