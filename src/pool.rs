//! Descriptor pools: linear-growth allocation of descriptor sets.

mod update;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::allocators::LinearAllocator;
use crate::descriptor::{DescriptorCounts, DescriptorType, HeapCounts, HeapType};
use crate::device::Device;
use crate::driver::{Driver, PoolCapacity, RawDescriptorPool, RawDescriptorSet};
use crate::error::{ensure, Error, Result};
use crate::layout::{BindingLayout, CompiledSet, RangeMapping};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorPoolDesc {
    pub descriptor_set_max_num: u32,
    /// Descriptors of each kind the pool can hand out, mutable ones counted separately.
    pub capacity: DescriptorCounts,
    /// Required to allocate sets declared with `ALLOW_UPDATE_AFTER_SET`.
    pub update_after_bind: bool,
}

impl DescriptorPoolDesc {
    /// Slots each heap needs to hold the whole capacity.
    pub fn heap_sizes(&self) -> Result<HeapCounts> {
        let mut heaps = HeapCounts::default();
        for ty in DescriptorType::ALL {
            let heap = heaps.get_mut(ty.heap_type());
            *heap = heap
                .checked_add(self.capacity.get(ty))
                .ok_or_else(|| Error::invalid("descriptor pool capacity overflows"))?;
        }
        heaps.resource = heaps
            .resource
            .checked_add(self.capacity.mutable)
            .ok_or_else(|| Error::invalid("descriptor pool capacity overflows"))?;
        Ok(heaps)
    }
}

/// How much of a pool is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolUsage {
    pub sets: u32,
    pub descriptors: DescriptorCounts,
    pub heaps: HeapCounts,
}

/// Forward-only cursors. Never freed individually, only reset together.
#[derive(Debug, Clone)]
struct Cursors {
    sets: LinearAllocator,
    kinds: [LinearAllocator; DescriptorCounts::LEN],
    resource_heap: LinearAllocator,
    sampler_heap: LinearAllocator,
}

impl Cursors {
    fn new(desc: &DescriptorPoolDesc, heaps: HeapCounts) -> Self {
        Self {
            sets: LinearAllocator::new(desc.descriptor_set_max_num as u64),
            kinds: desc
                .capacity
                .to_array()
                .map(|capacity| LinearAllocator::new(capacity as u64)),
            resource_heap: LinearAllocator::new(heaps.resource as u64),
            sampler_heap: LinearAllocator::new(heaps.sampler as u64),
        }
    }

    fn heap(&mut self, heap: HeapType) -> &mut LinearAllocator {
        match heap {
            HeapType::Resource => &mut self.resource_heap,
            HeapType::Sampler => &mut self.sampler_heap,
        }
    }

    /// Claims room for one set, returning where it starts in each heap.
    fn claim(&mut self, counts: &DescriptorCounts, heaps: HeapCounts) -> Result<HeapCounts> {
        self.sets.allocate(1)?;
        for (cursor, count) in self.kinds.iter_mut().zip(counts.to_array()) {
            cursor.allocate(count as u64)?;
        }
        let mut offsets = HeapCounts::default();
        for heap in [HeapType::Resource, HeapType::Sampler] {
            let slot = self.heap(heap).allocate(heaps.get(heap) as u64)?;
            *offsets.get_mut(heap) = slot.offset as u32;
        }
        Ok(offsets)
    }

    fn reset(&mut self) {
        self.sets.reset();
        self.kinds.iter_mut().for_each(LinearAllocator::reset);
        self.resource_heap.reset();
        self.sampler_heap.reset();
    }

    fn usage(&self) -> PoolUsage {
        let mut descriptors = DescriptorCounts::default();
        for (ty, cursor) in DescriptorType::ALL.iter().zip(&self.kinds) {
            *descriptors.get_mut(*ty) = cursor.cursor() as u32;
        }
        descriptors.mutable = self.kinds[DescriptorCounts::LEN - 1].cursor() as u32;
        PoolUsage {
            sets: self.sets.cursor() as u32,
            descriptors,
            heaps: HeapCounts {
                resource: self.resource_heap.cursor() as u32,
                sampler: self.sampler_heap.cursor() as u32,
            },
        }
    }
}

struct PoolShared {
    driver: Arc<dyn Driver>,
    raw: RawDescriptorPool,
    desc: DescriptorPoolDesc,
    cursors: Mutex<Cursors>,
    /// Bumped by every reset. Sets remember the epoch they were allocated in.
    epoch: AtomicU64,
}

impl PoolShared {
    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        log::debug!("destroying descriptor pool {:?}", self.raw);
        self.driver.destroy_descriptor_pool(self.raw);
    }
}

/// A pool of descriptor sets. Allocation and reset may be called from several threads.
pub struct DescriptorPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("raw", &self.shared.raw)
            .field("desc", &self.shared.desc)
            .field("usage", &self.usage())
            .finish()
    }
}

impl DescriptorPool {
    pub fn raw(&self) -> RawDescriptorPool {
        self.shared.raw
    }

    pub fn desc(&self) -> &DescriptorPoolDesc {
        &self.shared.desc
    }

    pub fn usage(&self) -> PoolUsage {
        self.shared
            .cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .usage()
    }

    /// Allocates `count` sets of the set declared at `set_index` in `layout`.
    ///
    /// Either all `count` sets fit and every cursor advances, or the call fails with
    /// [`Error::OutOfMemory`] and no cursor moves.
    pub fn allocate(
        &self,
        layout: &BindingLayout,
        set_index: u32,
        count: u32,
    ) -> Result<Vec<DescriptorSet>> {
        self.allocate_sets(layout, set_index, count, None)
    }

    /// Like [`DescriptorPool::allocate`], sizing the set's variable-sized range to
    /// `variable_count` descriptors.
    pub fn allocate_variable(
        &self,
        layout: &BindingLayout,
        set_index: u32,
        count: u32,
        variable_count: u32,
    ) -> Result<Vec<DescriptorSet>> {
        self.allocate_sets(layout, set_index, count, Some(variable_count))
    }

    fn allocate_sets(
        &self,
        layout: &BindingLayout,
        set_index: u32,
        count: u32,
        variable_count: Option<u32>,
    ) -> Result<Vec<DescriptorSet>> {
        let set = layout
            .set(set_index)
            .ok_or_else(|| Error::invalid(format!("layout has no set {set_index}")))?;
        ensure!(
            !set.update_after_bind() || self.shared.desc.update_after_bind,
            "set {set_index} is update-after-bind, the pool is not"
        );
        let (counts, heaps) = set.footprint(variable_count)?;
        let native_variable_count = variable_count
            .or_else(|| set.variable_range().map(|range| range.descriptor_num))
            .unwrap_or(0);

        let mut cursors = self
            .shared
            .cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = cursors.clone();
        let offsets = (0..count)
            .map(|_| next.claim(&counts, heaps))
            .collect::<Result<Vec<_>>>()?;

        let epoch = self.shared.epoch();
        let mut sets = Vec::with_capacity(offsets.len());
        for heap_offsets in offsets {
            let raw = self.shared.driver.allocate_descriptor_set(
                self.shared.raw,
                set.layout().raw(),
                heap_offsets,
                native_variable_count,
            )?;
            sets.push(DescriptorSet {
                pool: self.shared.clone(),
                epoch,
                raw,
                heap_offsets,
                set: set.clone(),
                variable_count,
            });
        }
        *cursors = next;

        log::trace!(
            "allocated {count} sets of space {} from {:?}",
            set.register_space(),
            self.shared.raw
        );
        Ok(sets)
    }

    /// Returns every set to the pool. Sets allocated before the reset become invalid.
    pub fn reset(&self) -> Result<()> {
        let mut cursors = self
            .shared
            .cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.shared.driver.reset_descriptor_pool(self.shared.raw)?;
        cursors.reset();
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        log::debug!("reset descriptor pool {:?}", self.shared.raw);
        Ok(())
    }
}

/// A set allocated from a [`DescriptorPool`]. Keeps the pool alive, but is only usable until
/// the pool is reset.
pub struct DescriptorSet {
    pool: Arc<PoolShared>,
    epoch: u64,
    raw: RawDescriptorSet,
    heap_offsets: HeapCounts,
    set: Arc<CompiledSet>,
    variable_count: Option<u32>,
}

impl std::fmt::Debug for DescriptorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSet")
            .field("raw", &self.raw)
            .field("heap_offsets", &self.heap_offsets)
            .field("register_space", &self.set.register_space())
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl DescriptorSet {
    pub fn raw(&self) -> RawDescriptorSet {
        self.raw
    }

    /// Where the set starts in each of the pool's heaps.
    pub fn heap_offsets(&self) -> HeapCounts {
        self.heap_offsets
    }

    pub fn compiled(&self) -> &Arc<CompiledSet> {
        &self.set
    }

    /// False once the pool has been reset.
    pub fn is_valid(&self) -> bool {
        self.epoch == self.pool.epoch()
    }

    fn ensure_valid(&self) -> Result<()> {
        ensure!(
            self.is_valid(),
            "set {:?} is stale: its pool was reset",
            self.raw
        );
        Ok(())
    }

    fn range(&self, index: u32) -> Result<&RangeMapping> {
        self.set.ranges().get(index as usize).ok_or_else(|| {
            Error::invalid(format!(
                "range {index} is out of bounds, the set has {}",
                self.set.ranges().len()
            ))
        })
    }

    /// Descriptors range `index` holds in this set, accounting for a variable size.
    pub fn range_descriptor_num(&self, index: u32) -> Result<u32> {
        let range = self.range(index)?;
        Ok(match self.variable_count {
            Some(count) if range.is_variable => count,
            _ => range.descriptor_num,
        })
    }
}

impl Device {
    pub fn create_descriptor_pool(&self, desc: &DescriptorPoolDesc) -> Result<DescriptorPool> {
        let limits = self.limits();
        let heap_sizes = desc.heap_sizes()?;
        ensure!(
            heap_sizes.resource <= limits.resource_heap_size,
            "{} resource descriptors exceed the device's {}",
            heap_sizes.resource,
            limits.resource_heap_size
        );
        ensure!(
            heap_sizes.sampler <= limits.sampler_heap_size,
            "{} samplers exceed the device's {}",
            heap_sizes.sampler,
            limits.sampler_heap_size
        );
        ensure!(
            desc.descriptor_set_max_num <= limits.max_descriptor_set_num,
            "{} sets exceed the device's {}",
            desc.descriptor_set_max_num,
            limits.max_descriptor_set_num
        );

        let raw = self.driver().create_descriptor_pool(&PoolCapacity {
            set_max_num: desc.descriptor_set_max_num,
            counts: desc.capacity,
            heap_sizes,
            update_after_bind: desc.update_after_bind,
        })?;
        log::debug!(
            "created descriptor pool {raw:?}: {} sets, {} resource and {} sampler slots",
            desc.descriptor_set_max_num,
            heap_sizes.resource,
            heap_sizes.sampler
        );

        Ok(DescriptorPool {
            shared: Arc::new(PoolShared {
                driver: self.driver().clone(),
                raw,
                desc: *desc,
                cursors: Mutex::new(Cursors::new(desc, heap_sizes)),
                epoch: AtomicU64::new(0),
            }),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::driver::soft::SoftDriver;
    use crate::layout::{
        DescriptorRangeDesc, DescriptorRangeFlags, DescriptorSetDesc, DescriptorSetFlags,
        PipelineLayoutDesc, ShaderStages,
    };

    fn device() -> (Arc<SoftDriver>, Device) {
        let _ = env_logger::builder().is_test(true).try_init();
        let soft = Arc::new(SoftDriver::new());
        let device = Device::new(soft.clone(), DeviceConfig::default()).unwrap();
        (soft, device)
    }

    fn range(ty: DescriptorType, num: u32, flags: DescriptorRangeFlags) -> DescriptorRangeDesc {
        DescriptorRangeDesc {
            base_register_index: 0,
            descriptor_num: num,
            descriptor_type: ty,
            shader_stages: ShaderStages::ALL_GRAPHICS,
            flags,
        }
    }

    fn layout(device: &Device, ranges: Vec<DescriptorRangeDesc>, flags: DescriptorSetFlags) -> BindingLayout {
        device
            .create_binding_layout(&PipelineLayoutDesc {
                descriptor_sets: vec![DescriptorSetDesc {
                    register_space: 0,
                    ranges,
                    flags,
                }],
                ..Default::default()
            })
            .unwrap()
    }

    fn textures(device: &Device, num: u32) -> BindingLayout {
        layout(
            device,
            vec![range(DescriptorType::Texture, num, DescriptorRangeFlags::ARRAY)],
            DescriptorSetFlags::empty(),
        )
    }

    fn pool(device: &Device, sets: u32, textures: u32) -> DescriptorPool {
        device
            .create_descriptor_pool(&DescriptorPoolDesc {
                descriptor_set_max_num: sets,
                capacity: DescriptorCounts {
                    texture: textures,
                    ..Default::default()
                },
                update_after_bind: false,
            })
            .unwrap()
    }

    #[test]
    fn allocation_is_linear() {
        let (_soft, device) = device();
        let layout = textures(&device, 4);
        let pool = pool(&device, 16, 16);
        let sets = pool.allocate(&layout, 0, 3).unwrap();
        let offsets = sets
            .iter()
            .map(|set| set.heap_offsets().resource)
            .collect::<Vec<_>>();
        assert_eq!(offsets, vec![0, 4, 8]);
        assert_eq!(pool.usage().descriptors.texture, 12);
        assert_eq!(pool.usage().sets, 3);
        assert!(sets.iter().all(DescriptorSet::is_valid));
    }

    #[test]
    fn exhaustion_leaves_cursors_alone() {
        let (_soft, device) = device();
        let layout = textures(&device, 4);
        let pool = pool(&device, 16, 10);
        let _sets = pool.allocate(&layout, 0, 2).unwrap();
        let before = pool.usage();
        assert_eq!(pool.allocate(&layout, 0, 1).unwrap_err(), Error::OutOfMemory);
        assert_eq!(pool.usage(), before);
        // All or nothing, even when the first of several sets would fit.
        let small = textures(&device, 1);
        assert_eq!(pool.allocate(&small, 0, 3).unwrap_err(), Error::OutOfMemory);
        assert_eq!(pool.usage(), before);
        pool.allocate(&small, 0, 2).unwrap();
    }

    #[test]
    fn set_count_is_a_capacity() {
        let (_soft, device) = device();
        let layout = textures(&device, 1);
        let pool = pool(&device, 2, 16);
        pool.allocate(&layout, 0, 2).unwrap();
        assert_eq!(pool.allocate(&layout, 0, 1).unwrap_err(), Error::OutOfMemory);
    }

    #[test]
    fn reset_reclaims_everything() {
        let (_soft, device) = device();
        let pool = pool(&device, 4, 10);
        let sets = pool.allocate(&textures(&device, 3), 0, 2).unwrap();
        pool.reset().unwrap();
        assert_eq!(pool.usage(), PoolUsage::default());
        assert!(sets.iter().all(|set| !set.is_valid()));

        let full = pool.allocate(&textures(&device, 10), 0, 1).unwrap();
        assert_eq!(full[0].heap_offsets().resource, 0);
        assert!(full[0].is_valid());
    }

    #[test]
    fn heaps_are_separate() {
        let (_soft, device) = device();
        let layout = layout(
            &device,
            vec![
                range(DescriptorType::Texture, 2, DescriptorRangeFlags::ARRAY),
                range(DescriptorType::Sampler, 3, DescriptorRangeFlags::ARRAY),
            ],
            DescriptorSetFlags::empty(),
        );
        let pool = device
            .create_descriptor_pool(&DescriptorPoolDesc {
                descriptor_set_max_num: 4,
                capacity: DescriptorCounts {
                    texture: 8,
                    sampler: 12,
                    ..Default::default()
                },
                update_after_bind: false,
            })
            .unwrap();
        let sets = pool.allocate(&layout, 0, 2).unwrap();
        assert_eq!(sets[1].heap_offsets(), HeapCounts { resource: 2, sampler: 3 });
        assert_eq!(pool.usage().heaps, HeapCounts { resource: 4, sampler: 6 });
    }

    #[test]
    fn variable_sized_sets() {
        let (_soft, device) = device();
        let layout = layout(
            &device,
            vec![range(
                DescriptorType::Texture,
                100,
                DescriptorRangeFlags::VARIABLE_SIZED_ARRAY,
            )],
            DescriptorSetFlags::empty(),
        );
        let pool = pool(&device, 4, 40);
        assert_eq!(pool.allocate(&layout, 0, 1).unwrap_err(), Error::OutOfMemory);
        let sets = pool.allocate_variable(&layout, 0, 2, 20).unwrap();
        assert_eq!(sets[1].heap_offsets().resource, 20);
        assert_eq!(sets[1].range_descriptor_num(0).unwrap(), 20);
        assert!(matches!(
            pool.allocate_variable(&layout, 0, 1, 101),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn invalid_requests() {
        let (_soft, device) = device();
        let layout = textures(&device, 1);
        let pool = pool(&device, 4, 4);
        assert!(matches!(
            pool.allocate(&layout, 1, 1),
            Err(Error::InvalidArgument(_))
        ));
        let update_after_bind = self::layout(
            &device,
            vec![range(DescriptorType::Texture, 1, DescriptorRangeFlags::ALLOW_UPDATE_AFTER_SET)],
            DescriptorSetFlags::ALLOW_UPDATE_AFTER_SET,
        );
        assert!(matches!(
            pool.allocate(&update_after_bind, 0, 1),
            Err(Error::InvalidArgument(_))
        ));

        let too_big = device.limits().resource_heap_size + 1;
        assert!(matches!(
            device.create_descriptor_pool(&DescriptorPoolDesc {
                descriptor_set_max_num: 1,
                capacity: DescriptorCounts {
                    mutable: too_big,
                    ..Default::default()
                },
                update_after_bind: false,
            }),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn concurrent_allocation() {
        let (_soft, device) = device();
        let layout = textures(&device, 1);
        let pool = pool(&device, 64, 64);
        let mut offsets = std::thread::scope(|scope| {
            let handles = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        (0..8)
                            .map(|_| pool.allocate(&layout, 0, 1).unwrap().remove(0))
                            .map(|set| set.heap_offsets().resource)
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });
        offsets.sort();
        assert_eq!(offsets, (0..64).collect::<Vec<_>>());
        assert_eq!(pool.allocate(&layout, 0, 1).unwrap_err(), Error::OutOfMemory);
    }
}
