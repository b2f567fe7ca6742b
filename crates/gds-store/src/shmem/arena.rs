//! Bump allocator living inside a segment
//!
//! The first bytes of every segment hold a [`SegmentHeader`]; everything
//! after it is carved by advancing the header's cursor. Nothing is freed
//! before the segment goes away.
//!
//! ```text
//! base                                                     base + size
//! +---------------+--------+--------+-----------+---------------------+
//! | SegmentHeader | alloc0 | alloc1 | ...       |     free            |
//! +---------------+--------+--------+-----------+---------------------+
//!                                               ^ cursor
//! ```
//!
//! Pointers inside the arena are absolute addresses. They are valid in any
//! process that mapped the segment at the owner's base, which attach
//! enforces.

use super::segment::{ConnectionInfo, Segment, SegmentKind};
use gds_common::{Error, Result, Value};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, info};

const MAGIC: u64 = 0x4744_5348_4d45_4d31;
const VERSION: u32 = 1;
const ALIGN: usize = 8;

/// Fixed header at offset 0 of every segment
#[repr(C)]
pub struct SegmentHeader {
    magic: u64,
    version: u32,
    ready: AtomicU32,
    base_address: u64,
    size: u64,
    cursor: AtomicU64,
    root: AtomicU64,
}

const HEADER_LEN: usize = size_of::<SegmentHeader>().next_multiple_of(ALIGN);

/// Types that may be placed in an arena
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` plain data whose only references
/// point into the same arena ([`ShmPtr`], [`ShmSlice`], [`ShmStr`]).
pub unsafe trait ArenaSafe: Copy + 'static {}

unsafe impl ArenaSafe for u8 {}
unsafe impl ArenaSafe for u32 {}
unsafe impl ArenaSafe for u64 {}

/// Address of one `T` inside an arena
#[repr(C)]
pub struct ShmPtr<T> {
    addr: u64,
    _marker: PhantomData<T>,
}

impl<T> ShmPtr<T> {
    pub const NULL: Self = Self {
        addr: 0,
        _marker: PhantomData,
    };

    const fn from_addr(addr: u64) -> Self {
        Self {
            addr,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.addr == 0
    }

    #[must_use]
    pub const fn addr(self) -> u64 {
        self.addr
    }
}

impl<T> Clone for ShmPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ShmPtr<T> {}

impl<T> PartialEq for ShmPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl<T> std::fmt::Debug for ShmPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShmPtr({:#x})", self.addr)
    }
}

unsafe impl<T: ArenaSafe> ArenaSafe for ShmPtr<T> {}

/// A run of `len` values inside an arena
#[repr(C)]
pub struct ShmSlice<T> {
    addr: u64,
    len: u64,
    _marker: PhantomData<T>,
}

impl<T> ShmSlice<T> {
    pub const EMPTY: Self = Self {
        addr: 0,
        len: 0,
        _marker: PhantomData,
    };

    #[must_use]
    pub const fn len(self) -> usize {
        self.len as usize
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.len == 0
    }

    /// Pointer to element `idx`
    #[must_use]
    pub const fn at(self, idx: usize) -> Option<ShmPtr<T>> {
        if idx >= self.len() {
            return None;
        }
        Some(ShmPtr::from_addr(self.addr + (idx * size_of::<T>()) as u64))
    }
}

impl<T> Clone for ShmSlice<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ShmSlice<T> {}

impl<T> std::fmt::Debug for ShmSlice<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShmSlice({:#x}, {})", self.addr, self.len)
    }
}

unsafe impl<T: ArenaSafe> ArenaSafe for ShmSlice<T> {}

pub type ShmBytes = ShmSlice<u8>;

/// UTF-8 text inside an arena
#[repr(transparent)]
#[derive(Clone, Copy, Debug)]
pub struct ShmStr(ShmBytes);

impl ShmStr {
    pub const EMPTY: Self = Self(ShmBytes::EMPTY);
}

unsafe impl ArenaSafe for ShmStr {}

/// Usage figures of one arena
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TmaStats {
    pub used: usize,
    pub capacity: usize,
    pub utilization: f64,
}

/// Allocator over one mapped segment
#[derive(Debug)]
pub struct Arena {
    seg: Segment,
}

impl Arena {
    /// Create a segment and initialize its header
    pub fn create(
        path: &Path,
        size: usize,
        at: Option<usize>,
        nsid: &str,
        kind: SegmentKind,
    ) -> Result<Self> {
        if size <= HEADER_LEN {
            return Err(Error::bad_param(format!(
                "segment of {size} bytes cannot hold its header"
            )));
        }
        let seg = Segment::create(path, size, at, nsid, kind)?;
        let header = SegmentHeader {
            magic: MAGIC,
            version: VERSION,
            ready: AtomicU32::new(0),
            base_address: seg.base() as u64,
            size: size as u64,
            cursor: AtomicU64::new(HEADER_LEN as u64),
            root: AtomicU64::new(0),
        };
        unsafe {
            seg.base_ptr().cast::<SegmentHeader>().write(header);
        }
        Ok(Self { seg })
    }

    /// Attach to a published segment
    pub fn open(info: &ConnectionInfo) -> Result<Self> {
        let seg = Segment::attach(info)?;
        let arena = Self { seg };
        let hdr = arena.header();
        if hdr.magic != MAGIC || hdr.version != VERSION {
            return Err(Error::segment(format!(
                "{} is not a store segment",
                info.path.display()
            )));
        }
        if hdr.base_address != info.base as u64 || hdr.size != info.size as u64 {
            return Err(Error::AddressMismatch {
                requested: info.base,
                actual: usize::try_from(hdr.base_address).unwrap_or(usize::MAX),
            });
        }
        if !arena.is_ready() {
            return Err(Error::segment(format!(
                "{} has not been published",
                info.path.display()
            )));
        }
        Ok(arena)
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { &*self.seg.base_ptr().cast::<SegmentHeader>() }
    }

    fn check_owner(&self) -> Result<()> {
        if self.seg.is_owner() {
            Ok(())
        } else {
            Err(Error::segment("attached segments are read-only"))
        }
    }

    /// Owner side, and only until the segment is published
    fn check_writable(&self) -> Result<()> {
        self.check_owner()?;
        if self.is_ready() {
            return Err(Error::segment(format!(
                "{} is published and sealed",
                self.seg.path().display()
            )));
        }
        Ok(())
    }

    fn bump(&mut self, len: usize, align: usize) -> Result<u64> {
        self.check_writable()?;
        let hdr = self.header();
        let cursor = usize::try_from(hdr.cursor.load(Ordering::Acquire))
            .map_err(|_| Error::internal("cursor overflow"))?;
        let start = cursor.next_multiple_of(align.max(ALIGN));
        let end = start
            .checked_add(len)
            .ok_or_else(|| Error::internal("allocation size overflow"))?;
        if end > self.seg.size() {
            return Err(Error::OutOfMemory {
                requested: len,
                available: self.seg.size().saturating_sub(start),
            });
        }
        hdr.cursor.store(end as u64, Ordering::Release);
        Ok((self.seg.base() + start) as u64)
    }

    fn check_range(&self, addr: u64, len: usize, align: usize) -> Result<*const u8> {
        let base = self.seg.base() as u64;
        let cursor = self.header().cursor.load(Ordering::Acquire);
        let in_range = addr >= base + HEADER_LEN as u64
            && addr
                .checked_add(len as u64)
                .is_some_and(|end| end <= base + cursor);
        if !in_range || addr % align as u64 != 0 {
            return Err(Error::segment(format!(
                "pointer {addr:#x}+{len} outside arena {base:#x}"
            )));
        }
        Ok(addr as usize as *const u8)
    }

    /// Place one value
    pub fn alloc<T: ArenaSafe>(&mut self, value: T) -> Result<ShmPtr<T>> {
        let addr = self.bump(size_of::<T>(), align_of::<T>())?;
        unsafe {
            (addr as usize as *mut T).write(value);
        }
        Ok(ShmPtr::from_addr(addr))
    }

    /// Copy a slice of values
    pub fn alloc_slice<T: ArenaSafe>(&mut self, items: &[T]) -> Result<ShmSlice<T>> {
        if items.is_empty() {
            return Ok(ShmSlice::EMPTY);
        }
        let addr = self.bump(size_of_val(items), align_of::<T>())?;
        unsafe {
            std::ptr::copy_nonoverlapping(items.as_ptr(), addr as usize as *mut T, items.len());
        }
        Ok(ShmSlice {
            addr,
            len: items.len() as u64,
            _marker: PhantomData,
        })
    }

    pub fn alloc_str(&mut self, s: &str) -> Result<ShmStr> {
        self.alloc_slice(s.as_bytes()).map(ShmStr)
    }

    /// Store a value as an encoded byte run
    pub fn alloc_value(&mut self, value: &Value) -> Result<ShmBytes> {
        let bytes = bincode::serialize(value)?;
        self.alloc_slice(&bytes)
    }

    /// Overwrite a previously allocated value
    pub fn write<T: ArenaSafe>(&mut self, ptr: ShmPtr<T>, value: T) -> Result<()> {
        self.check_writable()?;
        let p = self.check_range(ptr.addr, size_of::<T>(), align_of::<T>())?;
        unsafe {
            p.cast::<T>().cast_mut().write(value);
        }
        Ok(())
    }

    pub fn get<T: ArenaSafe>(&self, ptr: ShmPtr<T>) -> Result<&T> {
        let p = self.check_range(ptr.addr, size_of::<T>(), align_of::<T>())?;
        Ok(unsafe { &*p.cast::<T>() })
    }

    pub fn slice<T: ArenaSafe>(&self, s: ShmSlice<T>) -> Result<&[T]> {
        if s.is_empty() {
            return Ok(&[]);
        }
        let len = s.len() * size_of::<T>();
        let p = self.check_range(s.addr, len, align_of::<T>())?;
        Ok(unsafe { std::slice::from_raw_parts(p.cast::<T>(), s.len()) })
    }

    pub fn str(&self, s: ShmStr) -> Result<&str> {
        std::str::from_utf8(self.slice(s.0)?)
            .map_err(|e| Error::segment(format!("corrupt string in arena: {e}")))
    }

    /// Decode a value stored with [`Arena::alloc_value`]
    pub fn value(&self, bytes: ShmBytes) -> Result<Value> {
        Ok(bincode::deserialize(self.slice(bytes)?)?)
    }

    /// Record the entry point of the segment's contents
    pub fn set_root<T: ArenaSafe>(&mut self, ptr: ShmPtr<T>) -> Result<()> {
        self.check_writable()?;
        self.header().root.store(ptr.addr, Ordering::Release);
        Ok(())
    }

    #[must_use]
    pub fn root<T: ArenaSafe>(&self) -> ShmPtr<T> {
        ShmPtr::from_addr(self.header().root.load(Ordering::Acquire))
    }

    /// Flag the contents complete; attachers refuse segments without it
    ///
    /// The arena is sealed from then on.
    pub fn mark_ready(&mut self) -> Result<()> {
        self.check_owner()?;
        self.header().ready.store(1, Ordering::Release);
        debug!("segment {} ready", self.seg.path().display());
        Ok(())
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.header().ready.load(Ordering::Acquire) != 0
    }

    #[must_use]
    pub fn stats(&self) -> TmaStats {
        let used = usize::try_from(self.header().cursor.load(Ordering::Acquire)).unwrap_or(0);
        let capacity = self.seg.size();
        #[allow(clippy::cast_precision_loss)]
        let utilization = used as f64 / capacity as f64;
        TmaStats {
            used,
            capacity,
            utilization,
        }
    }

    /// Emit usage figures
    pub fn log_stats(&self) {
        let s = self.stats();
        info!(
            "{} segment {}: {} of {} bytes used ({:.1}%)",
            self.seg.kind(),
            self.seg.path().display(),
            s.used,
            s.capacity,
            s.utilization * 100.0
        );
    }

    #[must_use]
    pub const fn segment(&self) -> &Segment {
        &self.seg
    }

    #[must_use]
    pub fn connection_info(&self) -> ConnectionInfo {
        self.seg.connection_info()
    }
}
