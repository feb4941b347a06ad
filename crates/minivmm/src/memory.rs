//! Guest memory types and utilities.
//!
//! [`GuestMemory`] is the host side of guest RAM: an anonymous shared mapping
//! that KVM maps into the guest physical address space once it is wrapped in
//! a [`MemoryRegion`] and registered with a VM. [`MemoryMap`] is the per-VM
//! table of registered regions and enforces slot uniqueness and non-overlap.

use std::fmt;
use std::ptr::{self, NonNull};

use crate::error::{HypervisorError, Result};

/// Standard page size (4KB).
pub const PAGE_SIZE: usize = 4096;

/// A guest physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct GuestAddress(pub u64);

impl GuestAddress {
    /// Creates a new guest address.
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Returns the raw address value.
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Returns the address offset by the given amount, or `None` on overflow.
    #[must_use]
    pub const fn checked_offset(&self, offset: u64) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Checks if the address is aligned to the given alignment.
    #[must_use]
    pub const fn is_aligned(&self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }
}

impl fmt::Display for GuestAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for GuestAddress {
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl From<GuestAddress> for u64 {
    fn from(addr: GuestAddress) -> Self {
        addr.0
    }
}

/// Host backing for guest RAM.
///
/// The mapping is `MAP_SHARED | MAP_ANONYMOUS`, page aligned and zero filled
/// by the kernel. It is unmapped exactly once, when this value is dropped.
///
/// Once registered with a running VM the guest may write the buffer at any
/// time it is executing, so the host only ever copies data in and out and
/// never hands out references into it.
pub struct GuestMemory {
    host_addr: NonNull<u8>,
    size: usize,
}

// Safety: the mapping is owned by this value and only accessed through
// `&self`/`&mut self` copies.
unsafe impl Send for GuestMemory {}

impl GuestMemory {
    /// Allocates `size` bytes of zeroed, page-aligned shared memory.
    ///
    /// `size` must be a non-zero multiple of [`PAGE_SIZE`].
    pub fn allocate(size: usize) -> Result<Self> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(HypervisorError::AllocationFailed {
                size,
                reason: format!("size must be a non-zero multiple of {PAGE_SIZE}"),
            });
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(HypervisorError::AllocationFailed {
                size,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }

        let host_addr = NonNull::new(addr.cast::<u8>()).ok_or_else(|| {
            HypervisorError::AllocationFailed {
                size,
                reason: "mmap returned a null mapping".to_string(),
            }
        })?;

        tracing::debug!("Allocated {} bytes of guest memory at {:p}", size, host_addr);

        Ok(Self { host_addr, size })
    }

    /// Returns the size of the mapping in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the host virtual address of the mapping.
    ///
    /// This is what gets handed to `KVM_SET_USER_MEMORY_REGION`.
    #[must_use]
    pub fn host_address(&self) -> *mut u8 {
        self.host_addr.as_ptr()
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(HypervisorError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    /// Copies `bytes` into the buffer at `offset`.
    ///
    /// Nothing is written when the range does not fit.
    pub fn load(&mut self, bytes: &[u8], offset: usize) -> Result<()> {
        self.check_range(offset, bytes.len())?;
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.host_addr.as_ptr().add(offset),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Copies `len` bytes starting at `offset` out of the buffer.
    ///
    /// The guest may have written anything here; callers must treat the
    /// contents as untrusted.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check_range(offset, len)?;
        let mut out = vec![0u8; len];
        unsafe {
            ptr::copy_nonoverlapping(self.host_addr.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        Ok(out)
    }
}

impl fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestMemory")
            .field("host_addr", &self.host_addr)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.host_addr.as_ptr().cast(), self.size);
        }
        tracing::debug!("Unmapped {} bytes of guest memory", self.size);
    }
}

/// A guest memory slot: host backing plus where it appears in the guest.
#[derive(Debug)]
pub struct MemoryRegion {
    /// Slot ID, unique within a VM.
    pub slot: u32,
    /// Guest physical address of the region start.
    pub guest_addr: GuestAddress,
    /// Whether the guest may only read the region.
    pub read_only: bool,
    memory: GuestMemory,
}

impl MemoryRegion {
    /// Creates a new memory region backed by `memory`.
    #[must_use]
    pub fn new(slot: u32, guest_addr: GuestAddress, memory: GuestMemory) -> Self {
        Self {
            slot,
            guest_addr,
            read_only: false,
            memory,
        }
    }

    /// Marks the region read-only for the guest.
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Returns the size of the region, always equal to its backing length.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.memory.size() as u64
    }

    /// Returns the end address of the region (exclusive), saturating at
    /// the top of the address space.
    #[must_use]
    pub fn end(&self) -> GuestAddress {
        GuestAddress(self.guest_addr.0.saturating_add(self.size()))
    }

    /// Checks if this region's guest range intersects `other`'s.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.guest_addr < other.end() && other.guest_addr < self.end()
    }

    /// Checks if the region contains the given address.
    #[must_use]
    pub fn contains(&self, addr: GuestAddress) -> bool {
        addr >= self.guest_addr && addr < self.end()
    }

    /// Returns the host backing.
    #[must_use]
    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }
}

/// The set of regions registered with one VM.
#[derive(Debug, Default)]
pub struct MemoryMap {
    regions: Vec<MemoryRegion>,
}

impl MemoryMap {
    /// Creates an empty memory map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifies that `region` could be added without breaking the map's
    /// invariants. Does not modify the map.
    pub fn check(&self, region: &MemoryRegion) -> Result<()> {
        if region.guest_addr.checked_offset(region.size()).is_none() {
            return Err(HypervisorError::invalid_config(format!(
                "region at {} with size {:#x} wraps the guest address space",
                region.guest_addr,
                region.size()
            )));
        }

        for existing in &self.regions {
            if existing.slot == region.slot {
                return Err(HypervisorError::SlotInUse(region.slot));
            }
            if existing.overlaps(region) {
                return Err(HypervisorError::RegionOverlap {
                    start: region.guest_addr.raw(),
                    end: region.end().raw(),
                    existing: existing.slot,
                });
            }
        }

        Ok(())
    }

    /// Adds a region that already passed [`MemoryMap::check`].
    pub(crate) fn insert(&mut self, region: MemoryRegion) {
        self.regions.push(region);
    }

    /// Returns the region registered under `slot`.
    #[must_use]
    pub fn get(&self, slot: u32) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.slot == slot)
    }

    /// Returns the region containing `addr`.
    #[must_use]
    pub fn find(&self, addr: GuestAddress) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    /// Returns the number of regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Returns whether no region is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
