use std::ptr::NonNull;
use std::sync::{Arc, Mutex, PoisonError};

use crate::allocators::{BuddyAllocation, BuddyAllocator, Deallocator};
use crate::driver::{Driver, RawMemory};

/// Persistent host pointer into mapped device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

// SAFETY: the pointer is only a base address. Every access goes through a resource that
// hands out exclusive borrows.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    pub fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Offsets the pointer by `bytes`.
    ///
    /// ## Safety
    /// The result must stay within the mapped memory object.
    pub unsafe fn add(self, bytes: u64) -> Self {
        Self(NonNull::new_unchecked(self.0.as_ptr().add(bytes as usize)))
    }
}

/// A device memory object split into smaller regions by a buddy allocator.
pub struct MemoryBlock {
    driver: Arc<dyn Driver>,
    raw: RawMemory,
    size: u64,
    allocator: Mutex<BuddyAllocator>,
    mapped: Option<MappedPtr>,
}

impl std::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("raw", &self.raw)
            .field("size", &self.size)
            .field("mapped", &self.mapped)
            .finish()
    }
}

impl MemoryBlock {
    /// Creates a new MemoryBlock wrapper from underlying components.
    ///
    /// ## Safety
    /// `raw` must be a live memory object of `driver` at least `allocator.capacity()` bytes big,
    /// and nothing else may free it, as [`MemoryBlock`] frees it on drop.
    pub unsafe fn new(
        driver: Arc<dyn Driver>,
        raw: RawMemory,
        allocator: BuddyAllocator,
        mapped: Option<MappedPtr>,
    ) -> Self {
        Self {
            driver,
            raw,
            size: allocator.capacity(),
            allocator: Mutex::new(allocator),
            mapped,
        }
    }

    /// Returns the underlying memory object.
    ///
    /// The returned handle must not be freed as [`MemoryBlock`] already does that on drop.
    pub fn raw(&self) -> RawMemory {
        self.raw
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mapped(&self) -> Option<MappedPtr> {
        self.mapped
    }

    pub(crate) fn with_allocator<T>(&self, f: impl FnOnce(&mut BuddyAllocator) -> T) -> T {
        let mut allocator = self.allocator.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut allocator)
    }

    pub(crate) fn release(&self, slot: &BuddyAllocation) {
        self.with_allocator(|allocator| allocator.deallocate(slot));
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        log::debug!("freeing memory block {:?} ({}B)", self.raw, self.size);
        self.driver.free_memory(self.raw);
    }
}
