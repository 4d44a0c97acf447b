//! Component A: the shared segment allocator.
//!
//! A growable, process-shared byte region backed by a regular file and
//! mapped at the same logical base in every attached process. All internal
//! references are byte offsets from the base, never raw addresses, so a
//! `remap` (the only operation that changes the mapping's size or address)
//! is transparent to anything re-resolving its offsets afterward.
//!
//! Every accessor returns a reference borrowed from `&self`/`&mut self` for
//! exactly the scope of the dereference. `remap` takes `&mut self`, so the
//! borrow checker statically rejects code that holds a typed reference
//! across a remap, enforced at compile time rather than by a runtime
//! check.

use std::alloc::Layout;
use std::cell::UnsafeCell;
use std::fs::File;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;

use crate::error::{StoreError, StoreResult};
use crate::platform;

const MAGIC: u64 = 0x4D4F_4453_544F_5245; // "MODSTORE" (truncated to u64)
const FORMAT_VERSION: u32 = 1;

/// Fixed header living at offset 0 of every segment.
///
/// Field order matches the data model: magic, format version, current
/// mapped size, bump-allocation cursor, module-list head offset, and the
/// segment-wide allocation lock.
#[repr(C, align(64))]
pub struct SegmentHeader {
    magic: u64,
    format_version: u32,
    _reserved: u32,
    mapped_size: AtomicU64,
    alloc_offset: AtomicU64,
    module_list_head: AtomicU64,
    created_ts: u64,
    alloc_lock: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: `alloc_lock` is a PTHREAD_PROCESS_SHARED mutex; all access to it
// goes through `Segment::lock_alloc`, which upholds the mutex's own
// invariants. The rest of the header is composed of atomics.
unsafe impl Sync for SegmentHeader {}

/// Offset into a [`Segment`], always measured from the segment base.
pub type Offset = u64;

/// RAII guard for the segment-wide allocation lock.
pub struct AllocGuard<'a> {
    header: &'a SegmentHeader,
}

impl Drop for AllocGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.header.alloc_lock.get());
        }
    }
}

/// A growable, process-shared segment.
pub struct Segment {
    mmap: MmapMut,
    file: File,
    path: PathBuf,
    growth: usize,
}

const HEADER_SIZE: usize = size_of::<SegmentHeader>();

impl Segment {
    /// Create a fresh segment backed by `path`, initially `size` bytes.
    pub fn create(path: &Path, size: usize, growth: usize) -> StoreResult<Self> {
        let size = size.max(crate::consts::SHM_MIN_SIZE);
        if size > crate::consts::SHM_MAX_SIZE {
            return Err(StoreError::ResourceExhausted(format!(
                "initial segment size {size} exceeds maximum {}",
                crate::consts::SHM_MAX_SIZE
            )));
        }
        let file = platform::create_backing_file(path, size)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        init_header(&mut mmap, size as u64)?;
        Ok(Self {
            mmap,
            file,
            path: path.to_path_buf(),
            growth,
        })
    }

    /// Attach to an existing segment backed by `path`, validating its header.
    pub fn attach(path: &Path, growth: usize) -> StoreResult<Self> {
        let file = platform::open_backing_file(path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        if mmap.len() < HEADER_SIZE {
            return Err(StoreError::Internal("segment smaller than header".into()));
        }
        let seg = Self {
            mmap,
            file,
            path: path.to_path_buf(),
            growth,
        };
        seg.validate_header()?;
        Ok(seg)
    }

    fn validate_header(&self) -> StoreResult<()> {
        let h = self.header();
        if h.magic != MAGIC {
            return Err(StoreError::Internal("bad segment magic".into()));
        }
        if h.format_version != FORMAT_VERSION {
            return Err(StoreError::Internal(format!(
                "unsupported segment format version {}",
                h.format_version
            )));
        }
        Ok(())
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The header record.
    pub fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.mmap.as_ptr() as *const SegmentHeader) }
    }

    /// Current mapped size in bytes.
    pub fn mapped_size(&self) -> u64 {
        self.header().mapped_size.load(Ordering::Acquire)
    }

    /// Current bump-allocation cursor (first free byte offset).
    pub fn alloc_offset(&self) -> u64 {
        self.header().alloc_offset.load(Ordering::Acquire)
    }

    /// Offset of the first module record, or `None` if the index is empty.
    pub fn module_list_head(&self) -> Option<Offset> {
        match self.header().module_list_head.load(Ordering::Acquire) {
            0 => None,
            off => Some(off),
        }
    }

    /// Set the module-list head offset.
    pub fn set_module_list_head(&self, offset: Offset) {
        self.header()
            .module_list_head
            .store(offset, Ordering::Release);
    }

    fn lock_alloc(&self) -> AllocGuard<'_> {
        let header = self.header();
        unsafe {
            libc::pthread_mutex_lock(header.alloc_lock.get());
        }
        AllocGuard { header }
    }

    /// Grow the segment to at least `min_size` bytes.
    ///
    /// Takes `&mut self`: any outstanding borrow obtained from
    /// [`Segment::get`]/[`Segment::get_mut`] would have to have already
    /// been dropped for this call to type-check, which is exactly the
    /// safety property the offset-only design relies on.
    pub fn remap(&mut self, min_size: usize) -> StoreResult<()> {
        let guard = self.lock_alloc();
        let current = self.mapped_size() as usize;
        if min_size <= current {
            drop(guard);
            return Ok(());
        }
        let mut new_size = current;
        while new_size < min_size {
            new_size += self.growth.max(crate::consts::SHM_MIN_SIZE);
        }
        if new_size > crate::consts::SHM_MAX_SIZE {
            drop(guard);
            return Err(StoreError::ResourceExhausted(format!(
                "segment would grow to {new_size}, exceeding maximum {}",
                crate::consts::SHM_MAX_SIZE
            )));
        }
        platform::resize_backing_file(&self.file, new_size)?;
        // Dropping the old mapping before creating the new one keeps only
        // one mapping of the file alive at a time.
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        self.header().mapped_size.store(new_size as u64, Ordering::Release);
        tracing::debug!(old = current, new = new_size, path = %self.path.display(), "segment remapped");
        drop(guard);
        Ok(())
    }

    /// Shrink the allocation cursor to `new_alloc_offset`, which must not
    /// exceed the current cursor. Only the tail may be released this way.
    pub fn shrink_to(&mut self, new_alloc_offset: u64) -> StoreResult<()> {
        let guard = self.lock_alloc();
        let current = self.alloc_offset();
        if new_alloc_offset > current {
            drop(guard);
            return Err(StoreError::Internal(
                "shrink_to target exceeds current allocation cursor".into(),
            ));
        }
        self.header()
            .alloc_offset
            .store(new_alloc_offset, Ordering::Release);
        drop(guard);
        Ok(())
    }

    /// Bump-allocate `layout`, growing the segment if necessary, and return
    /// the offset of the new region. The region's bytes are zeroed.
    pub fn alloc(&mut self, layout: Layout) -> StoreResult<Offset> {
        let guard = self.lock_alloc();
        let cursor = self.alloc_offset();
        let align = layout.align() as u64;
        let aligned = (cursor + align - 1) & !(align - 1);
        let end = aligned
            .checked_add(layout.size() as u64)
            .ok_or_else(|| StoreError::ResourceExhausted("allocation overflow".into()))?;
        drop(guard);
        if end > self.mapped_size() {
            self.remap(end as usize)?;
        }
        let guard = self.lock_alloc();
        self.header().alloc_offset.store(end, Ordering::Release);
        drop(guard);
        let region = &mut self.mmap[aligned as usize..end as usize];
        region.fill(0);
        Ok(aligned)
    }

    /// Allocate space for `bytes` and copy them in. Returns the offset.
    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> StoreResult<Offset> {
        let layout = Layout::from_size_align(bytes.len().max(1), 8)
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let off = self.alloc(layout)?;
        self.mmap[off as usize..off as usize + bytes.len()].copy_from_slice(bytes);
        Ok(off)
    }

    /// Allocate space for a NUL-terminated copy of `s` and return the offset.
    pub fn alloc_cstr(&mut self, s: &str) -> StoreResult<Offset> {
        let mut buf = Vec::with_capacity(s.len() + 1);
        buf.extend_from_slice(s.as_bytes());
        buf.push(0);
        self.alloc_bytes(&buf)
    }

    /// Read a NUL-terminated UTF-8 string starting at `offset`.
    pub fn read_cstr(&self, offset: Offset) -> StoreResult<String> {
        let bytes = self.bounded_slice(offset, self.mapped_size() - offset)?;
        let end = bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| StoreError::Internal("unterminated string in segment".into()))?;
        std::str::from_utf8(&bytes[..end])
            .map(str::to_owned)
            .map_err(|e| StoreError::Internal(e.to_string()))
    }

    /// Allocate space for `value` and return the offset.
    pub fn alloc_value<T>(&mut self, value: T) -> StoreResult<Offset> {
        let layout = Layout::new::<T>();
        let off = self.alloc(layout)?;
        unsafe {
            let ptr = self.mmap.as_mut_ptr().add(off as usize) as *mut T;
            ptr.write(value);
        }
        Ok(off)
    }

    fn bounded_slice(&self, offset: Offset, len: u64) -> StoreResult<&[u8]> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| StoreError::Internal("offset overflow".into()))?;
        if end > self.mmap.len() as u64 {
            return Err(StoreError::Internal(format!(
                "offset {offset} + {len} exceeds segment size {}",
                self.mmap.len()
            )));
        }
        Ok(&self.mmap[offset as usize..end as usize])
    }

    /// Borrow a typed reference at `offset`, bounds-checked against the
    /// current mapped size. The lifetime is tied to `&self`.
    pub fn get<T>(&self, offset: Offset) -> StoreResult<&T> {
        self.bounded_slice(offset, size_of::<T>() as u64)?;
        Ok(unsafe { &*(self.mmap.as_ptr().add(offset as usize) as *const T) })
    }

    /// Borrow a mutable typed reference at `offset`. The lifetime is tied
    /// to `&mut self`, so it cannot outlive a subsequent `remap`.
    pub fn get_mut<T>(&mut self, offset: Offset) -> StoreResult<&mut T> {
        let end = offset
            .checked_add(size_of::<T>() as u64)
            .ok_or_else(|| StoreError::Internal("offset overflow".into()))?;
        if end > self.mmap.len() as u64 {
            return Err(StoreError::Internal(format!(
                "offset {offset} exceeds segment size {}",
                self.mmap.len()
            )));
        }
        Ok(unsafe { &mut *(self.mmap.as_mut_ptr().add(offset as usize) as *mut T) })
    }

    /// Raw byte slice at `offset..offset+len`, bounds-checked.
    pub fn slice(&self, offset: Offset, len: u64) -> StoreResult<&[u8]> {
        self.bounded_slice(offset, len)
    }

    /// Borrow `count` contiguous `T`s starting at `offset`.
    pub fn get_array<T: Copy>(&self, offset: Offset, count: u64) -> StoreResult<&[T]> {
        if count == 0 {
            return Ok(&[]);
        }
        let bytes = count
            .checked_mul(size_of::<T>() as u64)
            .ok_or_else(|| StoreError::Internal("array size overflow".into()))?;
        self.bounded_slice(offset, bytes)?;
        Ok(unsafe { std::slice::from_raw_parts(self.mmap.as_ptr().add(offset as usize) as *const T, count as usize) })
    }

    /// Mutably borrow `count` contiguous `T`s starting at `offset`.
    pub fn get_array_mut<T: Copy>(&mut self, offset: Offset, count: u64) -> StoreResult<&mut [T]> {
        if count == 0 {
            return Ok(&mut []);
        }
        let bytes = count
            .checked_mul(size_of::<T>() as u64)
            .ok_or_else(|| StoreError::Internal("array size overflow".into()))?;
        let end = offset
            .checked_add(bytes)
            .ok_or_else(|| StoreError::Internal("offset overflow".into()))?;
        if end > self.mmap.len() as u64 {
            return Err(StoreError::Internal(format!(
                "offset {offset} exceeds segment size {}",
                self.mmap.len()
            )));
        }
        Ok(unsafe {
            std::slice::from_raw_parts_mut(self.mmap.as_mut_ptr().add(offset as usize) as *mut T, count as usize)
        })
    }

    /// Allocate space for `count` copies of `T`, writing `items` into it.
    pub fn alloc_array<T: Copy>(&mut self, items: &[T]) -> StoreResult<Offset> {
        let layout = Layout::array::<T>(items.len().max(1))
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let off = self.alloc(layout)?;
        if !items.is_empty() {
            let dst = self.get_array_mut::<T>(off, items.len() as u64)?;
            dst.copy_from_slice(items);
        }
        Ok(off)
    }
}

fn init_header(mmap: &mut MmapMut, size: u64) -> StoreResult<()> {
    let ptr = mmap.as_mut_ptr() as *mut SegmentHeader;
    let created_ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    unsafe {
        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        if libc::pthread_mutexattr_init(&mut attr) != 0 {
            return Err(StoreError::Internal("pthread_mutexattr_init failed".into()));
        }
        if libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED) != 0 {
            return Err(StoreError::Internal("pthread_mutexattr_setpshared failed".into()));
        }
        let mutex_ptr = std::ptr::addr_of_mut!((*ptr).alloc_lock) as *mut libc::pthread_mutex_t;
        if libc::pthread_mutex_init(mutex_ptr, &attr) != 0 {
            return Err(StoreError::Internal("pthread_mutex_init failed".into()));
        }
        libc::pthread_mutexattr_destroy(&mut attr);

        std::ptr::addr_of_mut!((*ptr).magic).write(MAGIC);
        std::ptr::addr_of_mut!((*ptr).format_version).write(FORMAT_VERSION);
        std::ptr::addr_of_mut!((*ptr)._reserved).write(0);
        std::ptr::addr_of_mut!((*ptr).created_ts).write(created_ts);
    }
    let header = unsafe { &*ptr };
    header.mapped_size.store(size, Ordering::Release);
    header
        .alloc_offset
        .store(HEADER_SIZE as u64, Ordering::Release);
    header.module_list_head.store(0, Ordering::Release);
    Ok(())
}
