use std::num::NonZeroU64;
use std::sync::{Arc, Mutex, PoisonError};

use ahash::AHashMap;
use nonzero_ext::nonzero;

use crate::allocators::{Allocation as _, BuddyAllocation};
use crate::config::DeviceConfig;
use crate::driver::{Driver, MemoryAllocateInfo, NativeResource, RawMemory};
use crate::error::{ensure, Error, Result};
use crate::util::align_nonzero;

use super::{MappedPtr, MemoryBlock, MemoryCatalog, MemoryType, MemoryTypePool};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AllocationDesc {
    pub size: u64,
    /// Power of two, or 0 for no requirement.
    pub alignment: u64,
    pub memory_type: MemoryType,
    /// Residency hint in `0..=1`.
    pub priority: f32,
    /// Skip the pools and give the allocation its own memory object.
    pub committed: bool,
}

enum Backing {
    Pooled {
        block: Arc<MemoryBlock>,
        slot: BuddyAllocation,
    },
    Dedicated {
        driver: Arc<dyn Driver>,
        resource: Option<NativeResource>,
    },
}

/// A span of device memory kept alive by every [`Allocation`] that points into it.
struct Region {
    memory: RawMemory,
    mapped: Option<MappedPtr>,
    backing: Backing,
}

impl Drop for Region {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Pooled { block, slot } => block.release(slot),
            Backing::Dedicated { driver, .. } => {
                log::debug!("freeing dedicated memory {:?}", self.memory);
                driver.free_memory(self.memory);
            }
        }
    }
}

/// A region of device memory.
///
/// Clones share the region; the memory goes back to its pool (or to the device, for dedicated
/// allocations) once the last clone and every alias of it are dropped.
#[derive(Clone)]
pub struct Allocation {
    region: Arc<Region>,
    offset: u64,
    size: u64,
    memory_type: MemoryType,
    priority: f32,
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("memory", &self.region.memory)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("memory_type", &self.memory_type)
            .field("priority", &self.priority)
            .field("dedicated", &self.is_dedicated())
            .finish()
    }
}

impl Allocation {
    pub fn memory(&self) -> RawMemory {
        self.region.memory
    }

    /// Byte offset into [`Allocation::memory`].
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn priority(&self) -> f32 {
        self.priority
    }

    /// Host pointer to the first byte of the allocation, for host-visible memory types.
    pub fn mapped_ptr(&self) -> Option<MappedPtr> {
        // SAFETY: offset lies within the mapped memory object.
        self.region.mapped.map(|ptr| unsafe { ptr.add(self.offset) })
    }

    /// Whether the allocation owns a whole memory object of its own.
    pub fn is_dedicated(&self) -> bool {
        matches!(self.region.backing, Backing::Dedicated { .. })
    }

    /// The resource the memory object was created for, if it was dedicated to one.
    pub fn dedicated_to(&self) -> Option<NativeResource> {
        match self.region.backing {
            Backing::Dedicated { resource, .. } => resource,
            Backing::Pooled { .. } => None,
        }
    }

    /// Whether both allocations live in the same backing region.
    pub fn shares_region(&self, other: &Allocation) -> bool {
        Arc::ptr_eq(&self.region, &other.region)
    }
}

/// Hands out device memory, pooling small requests into large blocks per memory type.
///
/// Must-be-dedicated types and committed requests bypass the pools. So do requests that don't
/// fit in a block.
pub struct Suballocator {
    driver: Arc<dyn Driver>,
    catalog: MemoryCatalog,
    device_block_size: NonZeroU64,
    host_block_size: NonZeroU64,
    min_alloc_size: u64,
    pools: Mutex<AHashMap<MemoryType, MemoryTypePool>>,
}

impl Suballocator {
    pub fn new(driver: Arc<dyn Driver>, catalog: MemoryCatalog, config: &DeviceConfig) -> Self {
        Self {
            driver,
            catalog,
            device_block_size: config.device_block_size,
            host_block_size: config.host_block_size,
            min_alloc_size: config.min_alloc_size.get(),
            pools: Default::default(),
        }
    }

    pub fn allocate(&self, desc: &AllocationDesc) -> Result<Allocation> {
        self.allocate_for(desc, None)
    }

    /// Like [`Suballocator::allocate`], tagging dedicated memory with the resource it backs.
    pub(crate) fn allocate_for(
        &self,
        desc: &AllocationDesc,
        resource: Option<NativeResource>,
    ) -> Result<Allocation> {
        let size = NonZeroU64::new(desc.size)
            .ok_or_else(|| Error::invalid("cannot allocate 0 bytes"))?;
        let alignment = NonZeroU64::new(desc.alignment).unwrap_or(nonzero!(1u64));
        ensure!(
            alignment.is_power_of_two(),
            "alignment {alignment} is not a power of two"
        );
        let info = self.catalog.resolve(desc.memory_type)?;
        let priority = clamp_priority(desc.priority);

        if info.must_be_dedicated || desc.committed {
            return self.allocate_dedicated(
                desc.memory_type,
                size,
                priority,
                resource,
                info.is_host_visible,
            );
        }

        let block_size = if info.is_host_visible {
            self.host_block_size
        } else {
            self.device_block_size
        };
        let aligned = align_nonzero(alignment, size).ok_or(Error::OutOfMemory)?;
        if aligned > block_size {
            log::warn!(
                "{size}B allocation exceeds the {block_size}B blocks of {:?}, allocating standalone",
                desc.memory_type
            );
            return self.allocate_dedicated(
                desc.memory_type,
                size,
                priority,
                None,
                info.is_host_visible,
            );
        }

        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        let pool = pools.entry(desc.memory_type).or_insert_with(|| {
            MemoryTypePool::new(
                desc.memory_type,
                block_size,
                self.min_alloc_size,
                info.is_host_visible,
            )
        });
        let (block, slot) = pool.allocate(&self.driver, size, alignment, priority)?;
        let offset = slot.offset();

        Ok(Allocation {
            region: Arc::new(Region {
                memory: block.raw(),
                mapped: block.mapped(),
                backing: Backing::Pooled { block, slot },
            }),
            offset,
            size: size.get(),
            memory_type: desc.memory_type,
            priority,
        })
    }

    fn allocate_dedicated(
        &self,
        memory_type: MemoryType,
        size: NonZeroU64,
        priority: f32,
        resource: Option<NativeResource>,
        mapped: bool,
    ) -> Result<Allocation> {
        let memory = self.driver.allocate_memory(&MemoryAllocateInfo {
            type_index: memory_type.type_index(),
            size: size.get(),
            priority,
            dedicated: resource,
        })?;

        let mapped = if mapped {
            match self.driver.map_memory(memory).map(MappedPtr::new) {
                Ok(Some(ptr)) => Some(ptr),
                Ok(None) => {
                    self.driver.free_memory(memory);
                    return Err(Error::failure("driver mapped memory to null"));
                }
                Err(e) => {
                    self.driver.free_memory(memory);
                    return Err(e);
                }
            }
        } else {
            None
        };

        log::debug!("dedicated {size}B allocation {memory:?} for {memory_type:?}");

        Ok(Allocation {
            region: Arc::new(Region {
                memory,
                mapped,
                backing: Backing::Dedicated {
                    driver: self.driver.clone(),
                    resource,
                },
            }),
            offset: 0,
            size: size.get(),
            memory_type,
            priority,
        })
    }

    /// Creates an allocation over `offset..offset + size` of `base`, sharing its memory.
    ///
    /// Used to alias transient resources whose lifetimes don't overlap.
    pub fn alias(&self, base: &Allocation, offset: u64, size: u64) -> Result<Allocation> {
        ensure!(size != 0, "cannot alias 0 bytes");
        let end = offset
            .checked_add(size)
            .ok_or_else(|| Error::invalid("alias range overflows"))?;
        ensure!(
            end <= base.size,
            "alias range {offset}..{end} exceeds the {}B base allocation",
            base.size
        );

        Ok(Allocation {
            region: base.region.clone(),
            offset: base.offset + offset,
            size,
            memory_type: base.memory_type,
            priority: base.priority,
        })
    }

    /// Frees every pooled block that no allocation points into. Returns how many were freed.
    pub fn trim(&self) -> usize {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        let freed = pools.values_mut().map(MemoryTypePool::trim).sum();
        pools.retain(|_, pool| pool.block_count() != 0);
        if freed != 0 {
            log::debug!("trimmed {freed} memory blocks");
        }
        freed
    }

    /// Number of pooled blocks currently held.
    pub fn block_count(&self) -> usize {
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(MemoryTypePool::block_count)
            .sum()
    }
}

fn clamp_priority(priority: f32) -> f32 {
    if (0.0..=1.0).contains(&priority) {
        priority
    } else {
        let clamped = if priority.is_nan() {
            0.5
        } else {
            priority.clamp(0.0, 1.0)
        };
        log::warn!("memory priority {priority} clamped to {clamped}");
        clamped
    }
}
