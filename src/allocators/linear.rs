use super::OutOfMemory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearAllocation {
    pub offset: u64,
    pub size: u64,
}

impl super::Allocation for LinearAllocation {
    fn offset(&self) -> u64 {
        self.offset
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// A space allocator that allocates lineally without any packing nor space reusal.
///
/// Internally, it uses a cursor that can only move forward. Once the user tries to allocate a size
/// bigger than the space left dictated by the total block size minus the cursor offset, it will
/// fail with an out of memory error and leave the cursor untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearAllocator {
    /// The total available space for the allocator.
    block_size: u64,
    /// Where the allocator will allocate next, relative to the block start.
    cursor_offset: u64,
}

impl LinearAllocator {
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            cursor_offset: 0,
        }
    }

    /// Offsets the internal cursor by the size given. Zero-sized allocations always succeed.
    pub fn allocate(&mut self, size: u64) -> Result<LinearAllocation, OutOfMemory> {
        if size > self.space_free() {
            Err(OutOfMemory)
        } else {
            let offset = self.cursor_offset;
            self.cursor_offset += size;
            Ok(LinearAllocation { offset, size })
        }
    }

    /// Resets the internal cursor offset to 0, thus effectively "freeing the contents" of the
    /// allocator.
    pub fn reset(&mut self) {
        self.cursor_offset = 0;
    }

    /// Returns the space left in the allocator, calculated using the internal cursor offset.
    pub fn space_free(&self) -> u64 {
        self.block_size - self.cursor_offset
    }

    pub fn cursor(&self) -> u64 {
        self.cursor_offset
    }

    pub fn capacity(&self) -> u64 {
        self.block_size
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn grows_until_full() {
        let mut allocator = LinearAllocator::new(10);
        assert_eq!(allocator.allocate(4).unwrap().offset, 0);
        assert_eq!(allocator.allocate(4).unwrap().offset, 4);
        assert_eq!(allocator.allocate(3), Err(OutOfMemory));
        assert_eq!(allocator.cursor(), 8);
        assert_eq!(allocator.allocate(2).unwrap().offset, 8);
        assert_eq!(allocator.space_free(), 0);
        assert_eq!(allocator.allocate(0).unwrap().offset, 10);
    }

    #[test]
    fn reset() {
        let mut allocator = LinearAllocator::new(8);
        allocator.allocate(8).unwrap();
        allocator.reset();
        assert_eq!(allocator.space_free(), 8);
        assert_eq!(allocator.allocate(8).unwrap().offset, 0);
    }
}
