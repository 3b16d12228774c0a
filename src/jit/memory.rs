//! Section memory management using mmap.
//!
//! The memory manager is the only component that touches raw memory. Every
//! linked object gets a `MemoryBlock` made of up to three page-aligned
//! regions (code, read-only data, writable data). Regions start out
//! read-write; `finalize` applies the final protections, after which code
//! can no longer be written. Dropping a block unmaps it.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::object::{SectionKind, SectionSizes};

/// Error type for memory operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("memory allocation failed")]
    AllocationFailed,
    #[error("memory protection change failed")]
    ProtectionFailed,
    #[error("invalid memory size")]
    InvalidSize,
    #[error("memory limit of {limit} bytes exceeded (requested {requested})")]
    LimitExceeded { limit: usize, requested: usize },
    #[error("{0} section is finalized and no longer writable")]
    Finalized(SectionKind),
    #[error("block has no {0} section")]
    MissingSection(SectionKind),
}

/// Final protection of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadWrite,
    ReadOnly,
    ReadExecute,
}

impl Protection {
    fn for_section(kind: SectionKind) -> Self {
        match kind {
            SectionKind::Text => Protection::ReadExecute,
            SectionKind::ReadOnlyData => Protection::ReadOnly,
            SectionKind::Data => Protection::ReadWrite,
        }
    }

    #[cfg(unix)]
    fn flags(self) -> libc::c_int {
        match self {
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadOnly => libc::PROT_READ,
            Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
        }
    }
}

/// Get the page size for the current system.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

fn round_to_pages(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

/// One mapped, page-aligned region.
struct Region {
    ptr: NonNull<u8>,
    /// Mapped size (page multiple)
    size: usize,
    protection: Protection,
}

impl Region {
    fn new(len: usize) -> Result<Self, MemoryError> {
        if len == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let size = round_to_pages(len);
        let ptr = Self::mmap_alloc(size)?;
        Ok(Self {
            ptr,
            size,
            protection: Protection::ReadWrite,
        })
    }

    #[cfg(unix)]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        // Without mmap the region is plain heap memory and never executable.
        let layout = std::alloc::Layout::from_size_align(size, page_size())
            .map_err(|_| MemoryError::InvalidSize)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocationFailed)
    }

    fn address(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    fn write(&mut self, kind: SectionKind, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.protection != Protection::ReadWrite {
            return Err(MemoryError::Finalized(kind));
        }
        let end = offset.checked_add(data.len()).ok_or(MemoryError::InvalidSize)?;
        if end > self.size {
            return Err(MemoryError::InvalidSize);
        }

        unsafe {
            let dest = self.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len());
        }
        Ok(())
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), MemoryError> {
        let end = offset.checked_add(out.len()).ok_or(MemoryError::InvalidSize)?;
        if end > self.size {
            return Err(MemoryError::InvalidSize);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    #[cfg(unix)]
    fn protect(&mut self, protection: Protection) -> Result<(), MemoryError> {
        if self.protection == protection {
            return Ok(());
        }

        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                protection.flags(),
            )
        };

        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }

        self.protection = protection;
        Ok(())
    }

    #[cfg(not(unix))]
    fn protect(&mut self, protection: Protection) -> Result<(), MemoryError> {
        self.protection = protection;
        Ok(())
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
        #[cfg(not(unix))]
        {
            if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, page_size()) {
                unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
            }
        }
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
unsafe extern "C" {
    fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
unsafe extern "C" {
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

fn flush_instruction_cache(_start: *mut u8, _len: usize) {
    #[cfg(all(target_arch = "aarch64", target_os = "linux"))]
    unsafe {
        __clear_cache(
            _start as *mut libc::c_char,
            _start.add(_len) as *mut libc::c_char,
        );
    }
    #[cfg(all(target_arch = "aarch64", target_os = "macos"))]
    unsafe {
        sys_icache_invalidate(_start as *mut libc::c_void, _len);
    }
}

/// Memory backing one linked object.
///
/// Regions are unmapped when the block is dropped, and the owning manager's
/// live byte count is decremented.
pub struct MemoryBlock {
    id: u64,
    text: Option<Region>,
    rodata: Option<Region>,
    data: Option<Region>,
    finalized: bool,
    accounted: usize,
    live_bytes: Arc<AtomicUsize>,
}

impl MemoryBlock {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn region(&self, kind: SectionKind) -> Option<&Region> {
        match kind {
            SectionKind::Text => self.text.as_ref(),
            SectionKind::ReadOnlyData => self.rodata.as_ref(),
            SectionKind::Data => self.data.as_ref(),
        }
    }

    fn region_mut(&mut self, kind: SectionKind) -> Option<&mut Region> {
        match kind {
            SectionKind::Text => self.text.as_mut(),
            SectionKind::ReadOnlyData => self.rodata.as_mut(),
            SectionKind::Data => self.data.as_mut(),
        }
    }

    /// Base address of a section, if the block has one.
    pub fn base(&self, kind: SectionKind) -> Option<u64> {
        self.region(kind).map(Region::address)
    }

    /// Total mapped bytes.
    pub fn size(&self) -> usize {
        self.accounted
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Copy bytes into a section.
    pub fn write(&mut self, kind: SectionKind, offset: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        let region = self
            .region_mut(kind)
            .ok_or(MemoryError::MissingSection(kind))?;
        region.write(kind, offset, bytes)
    }

    /// Read a little-endian u32 from a section (used to patch instruction words).
    pub fn read_u32(&self, kind: SectionKind, offset: usize) -> Result<u32, MemoryError> {
        let region = self.region(kind).ok_or(MemoryError::MissingSection(kind))?;
        let mut bytes = [0u8; 4];
        region.read(offset, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Check whether a section can still be written.
    pub fn is_writable(&self, kind: SectionKind) -> bool {
        self.region(kind)
            .is_some_and(|r| r.protection == Protection::ReadWrite)
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        self.live_bytes.fetch_sub(self.accounted, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("id", &self.id)
            .field("text", &self.base(SectionKind::Text))
            .field("rodata", &self.base(SectionKind::ReadOnlyData))
            .field("data", &self.base(SectionKind::Data))
            .field("finalized", &self.finalized)
            .finish()
    }
}

// A block exclusively owns its mappings; the raw pointers are never shared
// outside of the block's own methods.
unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

/// Allocates, protects and releases section memory for linked objects.
pub struct MemoryManager {
    limit: Option<usize>,
    live_bytes: Arc<AtomicUsize>,
    next_id: AtomicU64,
}

impl MemoryManager {
    /// Create a manager, optionally capping the total mapped bytes.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            live_bytes: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Bytes currently mapped by live blocks.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }

    /// Allocate writable regions sized for each non-empty section.
    pub fn allocate(&self, sizes: SectionSizes) -> Result<MemoryBlock, MemoryError> {
        let requested: usize = [sizes.text, sizes.rodata, sizes.data]
            .iter()
            .filter(|&&len| len > 0)
            .map(|&len| round_to_pages(len))
            .sum();
        if requested == 0 {
            return Err(MemoryError::InvalidSize);
        }

        self.reserve(requested)?;
        // The block takes over the reservation from here, so an early return
        // below releases it through MemoryBlock::drop.
        let mut block = MemoryBlock {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            text: None,
            rodata: None,
            data: None,
            finalized: false,
            accounted: requested,
            live_bytes: Arc::clone(&self.live_bytes),
        };

        if sizes.text > 0 {
            block.text = Some(Region::new(sizes.text)?);
        }
        if sizes.rodata > 0 {
            block.rodata = Some(Region::new(sizes.rodata)?);
        }
        if sizes.data > 0 {
            block.data = Some(Region::new(sizes.data)?);
        }

        tracing::trace!(block = block.id, bytes = requested, "allocated section memory");
        Ok(block)
    }

    fn reserve(&self, requested: usize) -> Result<(), MemoryError> {
        let mut current = self.live_bytes.load(Ordering::Acquire);
        loop {
            let next = current
                .checked_add(requested)
                .ok_or(MemoryError::InvalidSize)?;
            if let Some(limit) = self.limit
                && next > limit
            {
                return Err(MemoryError::LimitExceeded { limit, requested });
            }
            match self.live_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Apply final page protections: code becomes read+execute, read-only
    /// data becomes read-only, writable data is never executable.
    pub fn finalize(&self, block: &mut MemoryBlock) -> Result<(), MemoryError> {
        if block.finalized {
            return Ok(());
        }

        for kind in [SectionKind::Text, SectionKind::ReadOnlyData, SectionKind::Data] {
            if let Some(region) = block.region_mut(kind) {
                region.protect(Protection::for_section(kind))?;
            }
        }
        if let Some(text) = block.text.as_ref() {
            flush_instruction_cache(text.ptr.as_ptr(), text.size);
        }

        block.finalized = true;
        Ok(())
    }

    /// Release a block, unmapping all of its regions.
    pub fn release(&self, block: MemoryBlock) {
        tracing::trace!(block = block.id, bytes = block.accounted, "released section memory");
        drop(block);
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(text: usize, rodata: usize, data: usize) -> SectionSizes {
        SectionSizes { text, rodata, data }
    }

    #[test]
    fn test_allocate_memory() {
        let manager = MemoryManager::default();
        let block = manager.allocate(sizes(100, 0, 16)).unwrap();
        assert!(block.base(SectionKind::Text).is_some());
        assert!(block.base(SectionKind::ReadOnlyData).is_none());
        assert!(block.base(SectionKind::Data).is_some());
        assert!(!block.is_finalized());
        assert_eq!(manager.live_bytes(), 2 * page_size());
    }

    #[test]
    fn test_empty_allocation_rejected() {
        let manager = MemoryManager::default();
        assert_eq!(
            manager.allocate(SectionSizes::default()).unwrap_err(),
            MemoryError::InvalidSize
        );
    }

    #[test]
    fn test_write_memory() {
        let manager = MemoryManager::default();
        let mut block = manager.allocate(sizes(16, 0, 0)).unwrap();
        block.write(SectionKind::Text, 0, &[0x90, 0x90, 0x90, 0xC3]).unwrap();
        assert_eq!(block.read_u32(SectionKind::Text, 0).unwrap(), 0xC390_9090);
    }

    #[test]
    fn test_write_missing_section() {
        let manager = MemoryManager::default();
        let mut block = manager.allocate(sizes(16, 0, 0)).unwrap();
        assert_eq!(
            block.write(SectionKind::Data, 0, &[1]).unwrap_err(),
            MemoryError::MissingSection(SectionKind::Data)
        );
    }

    #[test]
    fn test_code_not_writable_after_finalize() {
        let manager = MemoryManager::default();
        let mut block = manager.allocate(sizes(16, 8, 8)).unwrap();
        manager.finalize(&mut block).unwrap();

        assert!(block.is_finalized());
        assert!(!block.is_writable(SectionKind::Text));
        assert!(!block.is_writable(SectionKind::ReadOnlyData));
        assert!(block.is_writable(SectionKind::Data));
        assert_eq!(
            block.write(SectionKind::Text, 0, &[0x90]).unwrap_err(),
            MemoryError::Finalized(SectionKind::Text)
        );
        block.write(SectionKind::Data, 0, &[7]).unwrap();
    }

    #[test]
    fn test_limit_exceeded() {
        let manager = MemoryManager::new(Some(page_size()));
        let first = manager.allocate(sizes(8, 0, 0)).unwrap();
        let err = manager.allocate(sizes(8, 0, 0)).unwrap_err();
        assert!(matches!(err, MemoryError::LimitExceeded { .. }));

        manager.release(first);
        assert_eq!(manager.live_bytes(), 0);
        assert!(manager.allocate(sizes(8, 0, 0)).is_ok());
    }
}
