// Narrow read/write access to memory owned by the host binary.
// `ProcessMemory` is the live in-process view; `SnapshotMemory` is a checked
// set of segments (heap copies or locked file mappings) for offline work and tests.
use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr;

use fs2::FileExt;
use libc::{EACCES, EPERM};
use memmap2::MmapRaw;

use crate::core::error::{Error, ErrorKind};

/// Byte-addressed access to foreign memory.
///
/// Writes take `&self`: the memory belongs to the host, which owns the
/// aliasing discipline, so a view never claims exclusive access.
/// All multi-byte helpers are little-endian.
pub trait Memory {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), Error>;

    fn write(&self, address: u64, bytes: &[u8]) -> Result<(), Error>;

    fn read_u8(&self, address: u64) -> Result<u8, Error> {
        Ok(self.read_array::<1>(address)?[0])
    }

    fn read_u16(&self, address: u64) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.read_array(address)?))
    }

    fn read_u32(&self, address: u64) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.read_array(address)?))
    }

    fn read_u64(&self, address: u64) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.read_array(address)?))
    }

    fn write_u32(&self, address: u64, value: u32) -> Result<(), Error> {
        self.write(address, &value.to_le_bytes())
    }

    fn write_u64(&self, address: u64, value: u64) -> Result<(), Error> {
        self.write(address, &value.to_le_bytes())
    }

    fn read_array<const N: usize>(&self, address: u64) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        self.read(address, &mut out)?;
        Ok(out)
    }

    fn read_bytes(&self, address: u64, len: usize) -> Result<Vec<u8>, Error> {
        let mut out = vec![0u8; len];
        self.read(address, &mut out)?;
        Ok(out)
    }

    /// Reads a NUL-terminated string from a fixed-capacity inline buffer.
    fn read_c_string(&self, address: u64, capacity: usize) -> Result<String, Error> {
        let raw = self.read_bytes(address, capacity)?;
        let end = raw.iter().position(|byte| *byte == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }
}

impl<M: Memory + ?Sized> Memory for &M {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), Error> {
        (**self).read(address, buf)
    }

    fn write(&self, address: u64, bytes: &[u8]) -> Result<(), Error> {
        (**self).write(address, bytes)
    }
}

/// Unchecked access to the current address space.
///
/// Only the null address is trapped; any other invalid address is a hard
/// fault at the line doing the access.
#[derive(Debug)]
pub struct ProcessMemory {
    _private: (),
}

impl ProcessMemory {
    /// # Safety
    ///
    /// Every non-null address later passed to this view must point into
    /// memory that is mapped, readable (and writable for writes) and not
    /// concurrently resized by its owner for the duration of the access.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl Memory for ProcessMemory {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), Error> {
        if address == 0 {
            return Err(Error::fault(address, buf.len()));
        }
        unsafe {
            ptr::copy_nonoverlapping(address as usize as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write(&self, address: u64, bytes: &[u8]) -> Result<(), Error> {
        if address == 0 {
            return Err(Error::fault(address, bytes.len()));
        }
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), address as usize as *mut u8, bytes.len());
        }
        Ok(())
    }
}

#[derive(Debug)]
enum Backing {
    Heap(Box<[Cell<u8>]>),
    Mapped(MappedFile),
}

#[derive(Debug)]
struct MappedFile {
    map: MmapRaw,
    file: File,
    path: PathBuf,
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        let _ = self.map.flush();
        let _ = FileExt::unlock(&self.file);
    }
}

/// One contiguous run of foreign memory placed at `base`.
#[derive(Debug)]
pub struct Segment {
    base: u64,
    backing: Backing,
}

impl Segment {
    pub fn from_bytes(base: u64, bytes: Vec<u8>) -> Self {
        let cells = bytes.into_iter().map(Cell::new).collect();
        Self {
            base,
            backing: Backing::Heap(cells),
        }
    }

    pub fn zeroed(base: u64, len: usize) -> Self {
        Self::from_bytes(base, vec![0u8; len])
    }

    /// Copies a dump file into memory; writes never reach the file.
    pub fn read_file(base: u64, path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|err| {
            Error::new(io_error_kind(&err))
                .with_message("failed to read segment")
                .with_path(path)
                .with_source(err)
        })?;
        Ok(Self::from_bytes(base, bytes))
    }

    /// Maps a dump file read-write under an exclusive advisory lock so
    /// writes patch the file in place.
    pub fn map_file(base: u64, path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| Error::new(io_error_kind(&err)).with_path(&path).with_source(err))?;
        file.try_lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_message("segment file is locked")
                .with_path(&path)
                .with_source(err)
        })?;
        let map = MmapRaw::map_raw(&file).map_err(|err| {
            let _ = FileExt::unlock(&file);
            Error::new(ErrorKind::Io).with_path(&path).with_source(err)
        })?;
        Ok(Self {
            base,
            backing: Backing::Mapped(MappedFile { map, file, path }),
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        match &self.backing {
            Backing::Heap(cells) => cells.len(),
            Backing::Mapped(mapped) => mapped.map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Heap(_) => None,
            Backing::Mapped(mapped) => Some(&mapped.path),
        }
    }

    fn end(&self) -> u64 {
        self.base.saturating_add(self.len() as u64)
    }

    /// Offset of `[address, address + len)` inside this segment, if contained.
    fn offset_of(&self, address: u64, len: usize) -> Option<usize> {
        let end = address.checked_add(len as u64)?;
        if address < self.base || end > self.end() {
            return None;
        }
        Some((address - self.base) as usize)
    }

    fn copy_out(&self, offset: usize, buf: &mut [u8]) {
        match &self.backing {
            Backing::Heap(cells) => {
                let len = buf.len();
                for (dst, src) in buf.iter_mut().zip(&cells[offset..offset + len]) {
                    *dst = src.get();
                }
            }
            Backing::Mapped(mapped) => unsafe {
                ptr::copy_nonoverlapping(mapped.map.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
            },
        }
    }

    fn copy_in(&self, offset: usize, bytes: &[u8]) {
        match &self.backing {
            Backing::Heap(cells) => {
                for (dst, src) in cells[offset..offset + bytes.len()].iter().zip(bytes) {
                    dst.set(*src);
                }
            }
            Backing::Mapped(mapped) => unsafe {
                ptr::copy_nonoverlapping(bytes.as_ptr(), mapped.map.as_mut_ptr().add(offset), bytes.len());
            },
        }
    }

    fn flush(&self) -> Result<(), Error> {
        if let Backing::Mapped(mapped) = &self.backing {
            mapped.map.flush().map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_path(&mapped.path)
                    .with_source(err)
            })?;
        }
        Ok(())
    }
}

/// Checked memory made of non-overlapping segments.
#[derive(Debug, Default)]
pub struct SnapshotMemory {
    segments: Vec<Segment>,
}

impl SnapshotMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_segment(mut self, segment: Segment) -> Result<Self, Error> {
        self.insert(segment)?;
        Ok(self)
    }

    pub fn insert(&mut self, segment: Segment) -> Result<(), Error> {
        if segment.is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("segment is empty")
                .with_address(segment.base));
        }
        if segment.base.checked_add(segment.len() as u64).is_none() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("segment wraps the address space")
                .with_address(segment.base));
        }
        if let Some(other) = self
            .segments
            .iter()
            .find(|other| segment.base < other.end() && other.base < segment.end())
        {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "segment overlaps segment at {:#x}..{:#x}",
                    other.base,
                    other.end()
                ))
                .with_address(segment.base));
        }
        let at = self
            .segments
            .partition_point(|other| other.base < segment.base);
        self.segments.insert(at, segment);
        Ok(())
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn flush(&self) -> Result<(), Error> {
        for segment in &self.segments {
            segment.flush()?;
        }
        Ok(())
    }

    fn locate(&self, address: u64, len: usize) -> Result<(&Segment, usize), Error> {
        let at = self.segments.partition_point(|segment| segment.base <= address);
        at.checked_sub(1)
            .map(|index| &self.segments[index])
            .and_then(|segment| segment.offset_of(address, len).map(|offset| (segment, offset)))
            .ok_or_else(|| Error::fault(address, len))
    }
}

impl Memory for SnapshotMemory {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), Error> {
        let (segment, offset) = self.locate(address, buf.len())?;
        segment.copy_out(offset, buf);
        Ok(())
    }

    fn write(&self, address: u64, bytes: &[u8]) -> Result<(), Error> {
        let (segment, offset) = self.locate(address, bytes.len())?;
        segment.copy_in(offset, bytes);
        Ok(())
    }
}

pub(crate) fn io_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::{Memory, ProcessMemory, Segment, SnapshotMemory};
    use crate::core::error::ErrorKind;
    use std::io::Write;

    fn two_segments() -> SnapshotMemory {
        SnapshotMemory::new()
            .with_segment(Segment::zeroed(0x2000, 0x100))
            .expect("segment")
            .with_segment(Segment::zeroed(0x1000, 0x100))
            .expect("segment")
    }

    #[test]
    fn reads_and_writes_little_endian_words() {
        let memory = two_segments();
        memory.write_u64(0x1008, 0x1122_3344_5566_7788).expect("write");
        assert_eq!(memory.read_u64(0x1008).expect("read"), 0x1122_3344_5566_7788);
        assert_eq!(memory.read_u32(0x1008).expect("read"), 0x5566_7788);
        assert_eq!(memory.read_u16(0x100e).expect("read"), 0x1122);
        assert_eq!(memory.read_u8(0x1008).expect("read"), 0x88);
        assert_eq!(memory.read_u64(0x2000).expect("read"), 0);
    }

    #[test]
    fn access_outside_segments_faults_with_address() {
        let memory = two_segments();
        let err = memory.read_u32(0x1500).expect_err("unmapped");
        assert_eq!(err.kind(), ErrorKind::Fault);
        assert_eq!(err.address(), Some(0x1500));

        let err = memory.read_u64(0x10fc).expect_err("straddles end");
        assert_eq!(err.kind(), ErrorKind::Fault);
        assert_eq!(err.address(), Some(0x10fc));

        let err = memory.write_u32(0xfff, 1).expect_err("before first");
        assert_eq!(err.kind(), ErrorKind::Fault);
    }

    #[test]
    fn overlapping_segments_are_rejected() {
        let mut memory = two_segments();
        let err = memory
            .insert(Segment::zeroed(0x10f0, 0x20))
            .expect_err("overlap");
        assert_eq!(err.kind(), ErrorKind::Usage);
        memory.insert(Segment::zeroed(0x1100, 0x10)).expect("adjacent is fine");
        let bases: Vec<u64> = memory.segments().iter().map(|s| s.base()).collect();
        assert_eq!(bases, vec![0x1000, 0x1100, 0x2000]);
    }

    #[test]
    fn c_string_stops_at_nul() {
        let memory = SnapshotMemory::new()
            .with_segment(Segment::from_bytes(0x40, b"lobby\0junk".to_vec()))
            .expect("segment");
        assert_eq!(memory.read_c_string(0x40, 10).expect("read"), "lobby");
        assert_eq!(memory.read_c_string(0x40, 3).expect("read"), "lob");
    }

    #[test]
    fn process_memory_reads_live_buffer() {
        let mut words = vec![0u64; 4];
        let base = words.as_mut_ptr() as u64;
        let memory = unsafe { ProcessMemory::new() };
        memory.write_u64(base + 8, 0xdead_beef).expect("write");
        assert_eq!(memory.read_u64(base + 8).expect("read"), 0xdead_beef);
        assert_eq!(words[1], 0xdead_beef);
        let err = memory.read_u64(0).expect_err("null");
        assert_eq!(err.kind(), ErrorKind::Fault);
    }

    #[test]
    fn mapped_segment_writes_reach_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("block.bin");
        let mut file = std::fs::File::create(&path).expect("create");
        file.write_all(&[0u8; 64]).expect("write");
        drop(file);

        {
            let memory = SnapshotMemory::new()
                .with_segment(Segment::map_file(0x7000, &path).expect("map"))
                .expect("segment");
            memory.write_u32(0x7010, 0xabcd).expect("write");
            memory.flush().expect("flush");
        }

        let bytes = std::fs::read(&path).expect("read back");
        assert_eq!(&bytes[16..20], &0xabcdu32.to_le_bytes());
    }

    #[test]
    fn missing_segment_file_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Segment::read_file(0, dir.path().join("nope.bin"))
            .err()
            .expect("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.path().is_some());
    }

    #[test]
    fn lock_failures_classify_by_errno() {
        let cases = [
            (libc::EWOULDBLOCK, ErrorKind::Busy),
            (libc::EACCES, ErrorKind::Permission),
            (libc::EPERM, ErrorKind::Permission),
            (libc::EBADF, ErrorKind::Io),
        ];
        for (errno, kind) in cases {
            let err = std::io::Error::from_raw_os_error(errno);
            assert_eq!(super::lock_error_kind(&err), kind, "errno {errno}");
        }
    }

    #[test]
    fn second_mapping_of_a_locked_file_is_busy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("held.bin");
        std::fs::write(&path, [0u8; 16]).expect("write");
        let held = Segment::map_file(0x1000, &path).expect("first map");
        let err = Segment::map_file(0x1000, &path).err().expect("locked");
        assert_eq!(err.kind(), ErrorKind::Busy);
        drop(held);
        Segment::map_file(0x1000, &path).expect("map after release");
    }
}
