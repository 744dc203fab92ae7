mod block;

use std::num::NonZeroU64;
use std::sync::Arc;

use crate::allocators::{Allocator, BuddyAllocation, BuddyAllocator, OutOfMemory};
use crate::driver::{Driver, MemoryAllocateInfo};
use crate::error::{Error, Result};

use super::MemoryType;

pub use self::block::{MappedPtr, MemoryBlock};

/// The pooled blocks of a single [`MemoryType`].
pub struct MemoryTypePool {
    memory_type: MemoryType,
    memory_blocks: Vec<Arc<MemoryBlock>>,
    block_size: NonZeroU64,
    min_alloc_size: u64,
    /// Whether to map the blocks allocated in the memory type into application address space or not.
    mapped: bool,
}

impl MemoryTypePool {
    pub fn new(
        memory_type: MemoryType,
        block_size: NonZeroU64,
        min_alloc_size: u64,
        mapped: bool,
    ) -> Self {
        Self {
            memory_type,
            memory_blocks: vec![],
            block_size,
            min_alloc_size,
            mapped,
        }
    }

    pub fn block_size(&self) -> NonZeroU64 {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.memory_blocks.len()
    }

    fn allocate_block(&mut self, driver: &Arc<dyn Driver>, priority: f32) -> Result<()> {
        let memory = driver.allocate_memory(&MemoryAllocateInfo {
            type_index: self.memory_type.type_index(),
            size: self.block_size.get(),
            priority,
            dedicated: None,
        })?;

        let mapped = if self.mapped {
            match driver.map_memory(memory).map(MappedPtr::new) {
                Ok(Some(ptr)) => Some(ptr),
                Ok(None) => {
                    driver.free_memory(memory);
                    return Err(Error::failure("driver mapped a block to null"));
                }
                Err(e) => {
                    driver.free_memory(memory);
                    return Err(e);
                }
            }
        } else {
            None
        };

        log::debug!(
            "allocated {}MiB block #{} for {:?}",
            self.block_size.get() / 1024 / 1024,
            self.memory_blocks.len(),
            self.memory_type
        );

        let allocator = BuddyAllocator::from_properties(self.min_alloc_size, self.block_size);
        // SAFETY: `memory` was just allocated with `block_size` bytes and is owned by nobody else.
        let block = unsafe { MemoryBlock::new(driver.clone(), memory, allocator, mapped) };
        self.memory_blocks.push(Arc::new(block));

        Ok(())
    }

    /// Places `size` bytes in the first block with room, creating a block only when every
    /// existing one is full.
    pub fn allocate(
        &mut self,
        driver: &Arc<dyn Driver>,
        size: NonZeroU64,
        alignment: NonZeroU64,
        priority: f32,
    ) -> Result<(Arc<MemoryBlock>, BuddyAllocation)> {
        if size > self.block_size {
            return Err(Error::invalid(format!(
                "{size}B do not fit in {}B blocks",
                self.block_size
            )));
        }

        for block in &self.memory_blocks {
            match block.with_allocator(|allocator| allocator.allocate(size, alignment)) {
                Ok(slot) => return Ok((block.clone(), slot)),
                Err(OutOfMemory) => {}
            }
        }

        // If we don't have blocks with free memory left, we allocate a new one and return an allocation from there.
        self.allocate_block(driver, priority)?;
        let block = self
            .memory_blocks
            .last()
            .ok_or(Error::OutOfMemory)?
            .clone();
        let slot = block.with_allocator(|allocator| allocator.allocate(size, alignment))?;
        Ok((block, slot))
    }

    /// Frees blocks no allocation points into anymore. Returns how many were freed.
    pub fn trim(&mut self) -> usize {
        let before = self.memory_blocks.len();
        // Allocations clone the block `Arc` while the owning pool is locked, so a count of one
        // can't go up behind our back.
        self.memory_blocks
            .retain(|block| Arc::strong_count(block) > 1);
        before - self.memory_blocks.len()
    }
}
