//! Space allocators.
//! These don't actually allocate any memory, they only do the bookkeeping. Allocation methods
//! return allocations with an offset and size that the caller interprets however it needs.
//!
//! The buddy allocator splits device memory blocks for the [`Suballocator`]; the linear
//! allocator drives the cursors of a [`DescriptorPool`].
//!
//! [`Suballocator`]: crate::memory::Suballocator
//! [`DescriptorPool`]: crate::pool::DescriptorPool

mod buddy;
mod linear;

pub use buddy::{BuddyAllocation, BuddyAllocator};
pub use linear::{LinearAllocation, LinearAllocator};

use std::num::NonZeroU64;

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("OOM")]
pub struct OutOfMemory;

pub trait Allocation {
    fn offset(&self) -> u64;
    fn size(&self) -> u64;
}

pub trait Allocator {
    type Allocation: Allocation;

    fn allocate(
        &mut self,
        size: NonZeroU64,
        alignment: NonZeroU64,
    ) -> Result<Self::Allocation, OutOfMemory>;

    /// Creates an allocator that manages `capacity` bytes, handing out at least `min_alloc`
    /// bytes per allocation.
    fn from_properties(min_alloc: u64, capacity: NonZeroU64) -> Self;
}

pub trait Deallocator: Allocator {
    fn deallocate(&mut self, alloc: &Self::Allocation);
}
