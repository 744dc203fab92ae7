//! A headless driver that keeps every object in host memory.
//!
//! Descriptor pools are modelled the way heap-based APIs work: each pool owns one slot array
//! per heap and a set is nothing but a pair of offsets into them. Used by the test suite and
//! for running the core without a GPU.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use ahash::AHashMap;

use super::*;
use crate::error::Error;
use crate::resource::{BufferUsage, TextureUsage};
use crate::util::align;

const DEVICE_HEAP_SIZE: u64 = 1024 * 1024 * 1024;
const HOST_HEAP_SIZE: u64 = 512 * 1024 * 1024;
const BUFFER_ALIGNMENT: u64 = 256;
const TEXTURE_ALIGNMENT: u64 = 4096;

struct SoftMemory {
    heap: usize,
    size: u64,
    host_visible: bool,
    /// Backing store, created on first map.
    bytes: Option<Box<[u8]>>,
}

struct SoftPool {
    capacity: PoolCapacity,
    /// One slot array per heap, resource first.
    heaps: [Vec<Option<NativeDescriptor>>; 2],
    set_num: u32,
}

struct SoftSet {
    pool: RawDescriptorPool,
    layout: RawSetLayout,
    variable_count: u32,
}

#[derive(Default)]
struct SoftState {
    heap_usage: [u64; 2],
    memory: AHashMap<RawMemory, SoftMemory>,
    buffers: AHashMap<RawBuffer, BufferDesc>,
    textures: AHashMap<RawTexture, TextureDesc>,
    bindings: AHashMap<NativeResource, (RawMemory, u64)>,
    flushes: Vec<(RawMemory, u64, u64)>,
    views: AHashMap<RawView, NativeResource>,
    samplers: AHashMap<RawSampler, SamplerDesc>,
    acceleration_structures: AHashMap<RawAccelerationStructure, AccelerationStructureInfo>,
    /// Live acceleration structures allowed at once; unlimited when `None`.
    acceleration_structure_budget: Option<usize>,
    set_layouts: AHashMap<RawSetLayout, SetLayoutInfo>,
    pipeline_layouts: AHashMap<RawPipelineLayout, Vec<RawSetLayout>>,
    pools: AHashMap<RawDescriptorPool, SoftPool>,
    sets: AHashMap<RawDescriptorSet, SoftSet>,
}

impl SoftState {
    fn pool_slot(&mut self, set: RawDescriptorSet, slot: &DescriptorSlot) -> Option<&mut Option<NativeDescriptor>> {
        let pool = self.sets.get(&set)?.pool;
        self.pools
            .get_mut(&pool)?
            .heaps
            .get_mut(heap_index(slot.heap))?
            .get_mut(slot.heap_offset as usize)
    }
}

fn heap_index(heap: HeapType) -> usize {
    match heap {
        HeapType::Resource => 0,
        HeapType::Sampler => 1,
    }
}

fn binding_heap(kind: &BindingKind) -> HeapType {
    match kind {
        BindingKind::Single(ty) => ty.heap_type(),
        BindingKind::Mutable(_) => HeapType::Resource,
    }
}

pub struct SoftDriver {
    limits: DeviceLimits,
    next_handle: AtomicU64,
    state: Mutex<SoftState>,
}

impl Default for SoftDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftDriver {
    /// Memory type index of the lazily allocated, attachment-only type.
    pub const LAZILY_TYPE_INDEX: u32 = 4;

    pub fn new() -> Self {
        Self::with_limits(Self::default_limits())
    }

    pub fn with_limits(limits: DeviceLimits) -> Self {
        Self {
            limits,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(SoftState::default()),
        }
    }

    pub fn default_limits() -> DeviceLimits {
        DeviceLimits {
            max_bound_descriptor_sets: 32,
            max_push_constant_size: 256,
            max_push_descriptors: 32,
            max_descriptor_set_num: 1 << 20,
            resource_heap_size: 1_000_000,
            sampler_heap_size: 2048,
            constant_buffer_offset_alignment: 256,
            storage_buffer_offset_alignment: 256,
            scratch_buffer_alignment: 512,
            non_coherent_atom_size: 64,
            max_sampler_anisotropy: 16,
            ray_tracing: true,
            mutable_descriptors: true,
        }
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn state(&self) -> MutexGuard<'_, SoftState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn memory_object_count(&self) -> usize {
        self.state().memory.len()
    }

    pub fn memory_size(&self, memory: RawMemory) -> Option<u64> {
        self.state().memory.get(&memory).map(|memory| memory.size)
    }

    /// Copies `len` bytes of memory that has been mapped at least once.
    pub fn read_memory(&self, memory: RawMemory, offset: u64, len: u64) -> Option<Vec<u8>> {
        let state = self.state();
        let bytes = state.memory.get(&memory)?.bytes.as_ref()?;
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        bytes.get(start..end).map(<[u8]>::to_vec)
    }

    pub fn flushes(&self) -> Vec<(RawMemory, u64, u64)> {
        self.state().flushes.clone()
    }

    pub fn is_live_buffer(&self, buffer: RawBuffer) -> bool {
        self.state().buffers.contains_key(&buffer)
    }

    pub fn bound_memory(&self, resource: NativeResource) -> Option<(RawMemory, u64)> {
        self.state().bindings.get(&resource).copied()
    }

    /// Texture and buffer views currently alive. Samplers are not counted.
    pub fn live_view_count(&self) -> usize {
        self.state().views.len()
    }

    pub fn set_acceleration_structure_budget(&self, budget: Option<usize>) {
        self.state().acceleration_structure_budget = budget;
    }

    pub fn live_acceleration_structure_count(&self) -> usize {
        self.state().acceleration_structures.len()
    }

    pub fn set_layout_info(&self, layout: RawSetLayout) -> Option<SetLayoutInfo> {
        self.state().set_layouts.get(&layout).cloned()
    }

    pub fn live_set_layout_count(&self) -> usize {
        self.state().set_layouts.len()
    }

    pub fn pipeline_layout_sets(&self, layout: RawPipelineLayout) -> Option<Vec<RawSetLayout>> {
        self.state().pipeline_layouts.get(&layout).cloned()
    }

    /// What the pool heap slot addressed by `slot` holds.
    pub fn read_slot(&self, set: RawDescriptorSet, slot: &DescriptorSlot) -> Option<NativeDescriptor> {
        self.state().pool_slot(set, slot).and_then(|slot| *slot)
    }

    fn texture_size(desc: &TextureDesc) -> u64 {
        let texel = desc.format.stride().max(1) as u64;
        let layers = desc.layer_num.max(1) as u64 * desc.sample_num.max(1) as u64;
        (0..desc.mip_num.max(1))
            .map(|mip| {
                let extent = |x: u32| (x >> mip).max(1) as u64;
                extent(desc.width) * extent(desc.height) * extent(desc.depth)
            })
            .sum::<u64>()
            * texel
            * layers
    }
}

impl Driver for SoftDriver {
    fn memory_properties(&self) -> MemoryProperties {
        use MemoryPropertyFlags as F;
        let ty = |flags, heap_index| MemoryTypeProperties { flags, heap_index };
        MemoryProperties {
            types: vec![
                ty(F::DEVICE_LOCAL, 0),
                ty(F::HOST_VISIBLE | F::HOST_COHERENT, 1),
                ty(F::HOST_VISIBLE | F::HOST_CACHED, 1),
                ty(F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT, 0),
                ty(F::DEVICE_LOCAL | F::LAZILY_ALLOCATED, 0),
            ],
            heaps: vec![
                MemoryHeapProperties {
                    size: DEVICE_HEAP_SIZE,
                    device_local: true,
                },
                MemoryHeapProperties {
                    size: HOST_HEAP_SIZE,
                    device_local: false,
                },
            ],
        }
    }

    fn limits(&self) -> DeviceLimits {
        self.limits.clone()
    }

    fn allocate_memory(&self, info: &MemoryAllocateInfo) -> Result<RawMemory> {
        let properties = self.memory_properties();
        let ty = properties
            .types
            .get(info.type_index as usize)
            .ok_or_else(|| Error::failure(format!("no memory type {}", info.type_index)))?;
        let heap = ty.heap_index as usize;
        let mut state = self.state();
        let used = state.heap_usage[heap]
            .checked_add(info.size)
            .ok_or(Error::OutOfMemory)?;
        if used > properties.heaps[heap].size {
            return Err(Error::OutOfMemory);
        }
        state.heap_usage[heap] = used;
        let raw = RawMemory(self.handle());
        state.memory.insert(
            raw,
            SoftMemory {
                heap,
                size: info.size,
                host_visible: ty.flags.contains(MemoryPropertyFlags::HOST_VISIBLE),
                bytes: None,
            },
        );
        Ok(raw)
    }

    fn map_memory(&self, memory: RawMemory) -> Result<*mut u8> {
        let mut state = self.state();
        let memory = state
            .memory
            .get_mut(&memory)
            .ok_or_else(|| Error::failure(format!("{memory:?} is not alive")))?;
        if !memory.host_visible {
            return Err(Error::failure("memory is not host-visible"));
        }
        let size = usize::try_from(memory.size).map_err(|_| Error::OutOfMemory)?;
        let bytes = memory
            .bytes
            .get_or_insert_with(|| vec![0; size].into_boxed_slice());
        Ok(bytes.as_mut_ptr())
    }

    fn flush_memory(&self, memory: RawMemory, offset: u64, size: u64) -> Result<()> {
        self.state().flushes.push((memory, offset, size));
        Ok(())
    }

    fn free_memory(&self, memory: RawMemory) {
        let mut state = self.state();
        if let Some(freed) = state.memory.remove(&memory) {
            state.heap_usage[freed.heap] -= freed.size;
        }
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<RawBuffer> {
        let raw = RawBuffer(self.handle());
        self.state().buffers.insert(raw, *desc);
        Ok(raw)
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        let mut state = self.state();
        state.buffers.remove(&buffer);
        state.bindings.remove(&NativeResource::Buffer(buffer));
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<RawTexture> {
        let raw = RawTexture(self.handle());
        self.state().textures.insert(raw, *desc);
        Ok(raw)
    }

    fn destroy_texture(&self, texture: RawTexture) {
        let mut state = self.state();
        state.textures.remove(&texture);
        state.bindings.remove(&NativeResource::Texture(texture));
    }

    fn memory_requirements(&self, resource: NativeResource) -> MemoryRequirements {
        let state = self.state();
        let all_but_lazily = (1 << Self::LAZILY_TYPE_INDEX) - 1;
        match resource {
            NativeResource::Buffer(buffer) => {
                let desc = state.buffers.get(&buffer).copied().unwrap_or_default();
                let alignment = if desc.usage.contains(BufferUsage::SCRATCH_BUFFER) {
                    self.limits.scratch_buffer_alignment
                } else {
                    BUFFER_ALIGNMENT
                };
                MemoryRequirements {
                    size: align(alignment, desc.size.max(1)),
                    alignment,
                    type_bits: all_but_lazily,
                    requires_dedicated: false,
                }
            }
            NativeResource::Texture(texture) => {
                let desc = state.textures.get(&texture).copied().unwrap_or_default();
                let attachment = desc.usage.intersects(
                    TextureUsage::COLOR_ATTACHMENT | TextureUsage::DEPTH_STENCIL_ATTACHMENT,
                );
                MemoryRequirements {
                    size: align(TEXTURE_ALIGNMENT, Self::texture_size(&desc)),
                    alignment: TEXTURE_ALIGNMENT,
                    type_bits: if attachment {
                        all_but_lazily | 1 << Self::LAZILY_TYPE_INDEX
                    } else {
                        all_but_lazily
                    },
                    requires_dedicated: attachment,
                }
            }
        }
    }

    fn bind_memory(&self, resource: NativeResource, memory: RawMemory, offset: u64) -> Result<()> {
        let size = self.memory_requirements(resource).size;
        let mut state = self.state();
        let memory_size = state
            .memory
            .get(&memory)
            .ok_or_else(|| Error::failure(format!("{memory:?} is not alive")))?
            .size;
        if offset.checked_add(size).map_or(true, |end| end > memory_size) {
            return Err(Error::failure(format!(
                "{resource:?} doesn't fit in {memory:?} at {offset}"
            )));
        }
        state.bindings.insert(resource, (memory, offset));
        Ok(())
    }

    fn create_texture_view(&self, info: &TextureViewInfo) -> Result<RawView> {
        let raw = RawView(self.handle());
        self.state()
            .views
            .insert(raw, NativeResource::Texture(info.texture));
        Ok(raw)
    }

    fn create_buffer_view(&self, info: &BufferViewInfo) -> Result<RawView> {
        let raw = RawView(self.handle());
        self.state()
            .views
            .insert(raw, NativeResource::Buffer(info.buffer));
        Ok(raw)
    }

    fn destroy_view(&self, view: RawView) {
        self.state().views.remove(&view);
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<RawSampler> {
        let raw = RawSampler(self.handle());
        self.state().samplers.insert(raw, *desc);
        Ok(raw)
    }

    fn destroy_sampler(&self, sampler: RawSampler) {
        self.state().samplers.remove(&sampler);
    }

    fn create_acceleration_structure(
        &self,
        info: &AccelerationStructureInfo,
    ) -> Result<RawAccelerationStructure> {
        let mut state = self.state();
        if let Some(budget) = state.acceleration_structure_budget {
            if state.acceleration_structures.len() >= budget {
                return Err(Error::failure(format!(
                    "{budget} acceleration structures are already alive"
                )));
            }
        }
        let raw = RawAccelerationStructure(self.handle());
        state.acceleration_structures.insert(raw, *info);
        Ok(raw)
    }

    fn destroy_acceleration_structure(&self, acceleration_structure: RawAccelerationStructure) {
        self.state()
            .acceleration_structures
            .remove(&acceleration_structure);
    }

    fn create_set_layout(&self, info: &SetLayoutInfo) -> Result<RawSetLayout> {
        let raw = RawSetLayout(self.handle());
        self.state().set_layouts.insert(raw, info.clone());
        Ok(raw)
    }

    fn destroy_set_layout(&self, layout: RawSetLayout) {
        self.state().set_layouts.remove(&layout);
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[RawSetLayout],
        push_constants: &[PushConstantRange],
    ) -> Result<RawPipelineLayout> {
        let push_constant_size = push_constants
            .iter()
            .map(|range| range.offset + range.size)
            .max()
            .unwrap_or(0);
        if push_constant_size > self.limits.max_push_constant_size {
            return Err(Error::failure("push constants exceed the device limit"));
        }
        let mut state = self.state();
        if let Some(missing) = set_layouts
            .iter()
            .find(|layout| !state.set_layouts.contains_key(layout))
        {
            return Err(Error::failure(format!("{missing:?} is not alive")));
        }
        let raw = RawPipelineLayout(self.handle());
        state.pipeline_layouts.insert(raw, set_layouts.to_vec());
        Ok(raw)
    }

    fn destroy_pipeline_layout(&self, layout: RawPipelineLayout) {
        self.state().pipeline_layouts.remove(&layout);
    }

    fn create_descriptor_pool(&self, capacity: &PoolCapacity) -> Result<RawDescriptorPool> {
        let raw = RawDescriptorPool(self.handle());
        self.state().pools.insert(
            raw,
            SoftPool {
                capacity: *capacity,
                heaps: [
                    vec![None; capacity.heap_sizes.resource as usize],
                    vec![None; capacity.heap_sizes.sampler as usize],
                ],
                set_num: 0,
            },
        );
        Ok(raw)
    }

    fn destroy_descriptor_pool(&self, pool: RawDescriptorPool) {
        let mut state = self.state();
        state.pools.remove(&pool);
        state.sets.retain(|_, set| set.pool != pool);
    }

    fn reset_descriptor_pool(&self, pool: RawDescriptorPool) -> Result<()> {
        let mut state = self.state();
        let soft = state
            .pools
            .get_mut(&pool)
            .ok_or_else(|| Error::failure(format!("{pool:?} is not alive")))?;
        soft.set_num = 0;
        soft.heaps.iter_mut().flatten().for_each(|slot| *slot = None);
        state.sets.retain(|_, set| set.pool != pool);
        Ok(())
    }

    fn allocate_descriptor_set(
        &self,
        pool: RawDescriptorPool,
        layout: RawSetLayout,
        heap_offsets: HeapCounts,
        variable_count: u32,
    ) -> Result<RawDescriptorSet> {
        let mut state = self.state();
        let info = state
            .set_layouts
            .get(&layout)
            .ok_or_else(|| Error::failure(format!("{layout:?} is not alive")))?;
        if info.flags.contains(SetLayoutFlags::PUSH) {
            return Err(Error::failure("push set layouts are not allocatable"));
        }
        let mut footprint = HeapCounts::default();
        for binding in &info.bindings {
            let count = if binding.flags.contains(BindingFlags::VARIABLE_COUNT) {
                variable_count
            } else {
                binding.count
            };
            *footprint.get_mut(binding_heap(&binding.kind)) += count;
        }

        let soft = state
            .pools
            .get_mut(&pool)
            .ok_or_else(|| Error::failure(format!("{pool:?} is not alive")))?;
        if soft.set_num >= soft.capacity.set_max_num {
            return Err(Error::OutOfMemory);
        }
        for heap in [HeapType::Resource, HeapType::Sampler] {
            let end = heap_offsets.get(heap) as u64 + footprint.get(heap) as u64;
            if end > soft.heaps[heap_index(heap)].len() as u64 {
                return Err(Error::OutOfMemory);
            }
        }
        soft.set_num += 1;

        let raw = RawDescriptorSet(self.handle());
        state.sets.insert(
            raw,
            SoftSet {
                pool,
                layout,
                variable_count,
            },
        );
        Ok(raw)
    }

    fn write_descriptors(&self, writes: &[DescriptorWrite]) {
        let mut state = self.state();
        for write in writes {
            let declared = state.sets.get(&write.set).and_then(|set| {
                let info = state.set_layouts.get(&set.layout)?;
                let binding = info.bindings.iter().find(|b| b.binding == write.slot.binding)?;
                let count = if binding.flags.contains(BindingFlags::VARIABLE_COUNT) {
                    set.variable_count
                } else {
                    binding.count
                };
                Some(write.slot.array_element < count)
            });
            if declared != Some(true) {
                log::warn!("dropping write to undeclared {:?} of {:?}", write.slot, write.set);
                continue;
            }
            match state.pool_slot(write.set, &write.slot) {
                Some(slot) => *slot = Some(write.descriptor),
                None => log::warn!("dropping write outside the pool heap: {:?}", write.slot),
            }
        }
    }

    fn copy_descriptors(&self, copies: &[DescriptorCopy]) {
        let mut state = self.state();
        for copy in copies {
            let src = state
                .pool_slot(copy.src_set, &copy.src_slot)
                .and_then(|slot| *slot);
            match state.pool_slot(copy.dst_set, &copy.dst_slot) {
                Some(slot) => *slot = src,
                None => log::warn!("dropping copy outside the pool heap: {:?}", copy.dst_slot),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn heaps_are_budgeted() {
        let soft = SoftDriver::new();
        let info = |size| MemoryAllocateInfo {
            type_index: 1,
            size,
            priority: 0.5,
            dedicated: None,
        };
        let a = soft.allocate_memory(&info(HOST_HEAP_SIZE / 2)).unwrap();
        let _b = soft.allocate_memory(&info(HOST_HEAP_SIZE / 2)).unwrap();
        assert_eq!(soft.allocate_memory(&info(1)), Err(Error::OutOfMemory));
        soft.free_memory(a);
        soft.allocate_memory(&info(1)).unwrap();
        // Device-local memory is accounted separately.
        soft.allocate_memory(&MemoryAllocateInfo {
            type_index: 0,
            ..info(1)
        })
        .unwrap();
    }

    #[test]
    fn host_memory_is_mappable() {
        let soft = SoftDriver::new();
        let memory = soft
            .allocate_memory(&MemoryAllocateInfo {
                type_index: 1,
                size: 64,
                priority: 0.5,
                dedicated: None,
            })
            .unwrap();
        let ptr = soft.map_memory(memory).unwrap();
        // SAFETY: the mapping covers 64 bytes and nothing else touches it.
        unsafe { ptr.add(3).write(9) };
        assert_eq!(soft.read_memory(memory, 2, 2), Some(vec![0, 9]));
        assert_eq!(soft.read_memory(memory, 60, 8), None);

        let device = soft
            .allocate_memory(&MemoryAllocateInfo {
                type_index: 0,
                size: 64,
                priority: 0.5,
                dedicated: None,
            })
            .unwrap();
        assert!(matches!(soft.map_memory(device), Err(Error::Failure(_))));
    }

    #[test]
    fn sets_must_fit_their_heaps() {
        let soft = SoftDriver::new();
        let layout = soft
            .create_set_layout(&SetLayoutInfo {
                bindings: vec![SetLayoutBinding {
                    binding: 0,
                    kind: BindingKind::Single(DescriptorType::Texture),
                    count: 4,
                    stages: ShaderStages::ALL_GRAPHICS,
                    flags: BindingFlags::empty(),
                    immutable_samplers: vec![],
                }],
                flags: SetLayoutFlags::empty(),
            })
            .unwrap();
        let pool = soft
            .create_descriptor_pool(&PoolCapacity {
                set_max_num: 2,
                counts: DescriptorCounts {
                    texture: 6,
                    ..Default::default()
                },
                heap_sizes: HeapCounts {
                    resource: 6,
                    sampler: 0,
                },
                update_after_bind: false,
            })
            .unwrap();
        soft.allocate_descriptor_set(pool, layout, HeapCounts::default(), 0)
            .unwrap();
        assert_eq!(
            soft.allocate_descriptor_set(pool, layout, HeapCounts { resource: 4, sampler: 0 }, 0),
            Err(Error::OutOfMemory)
        );
        soft.reset_descriptor_pool(pool).unwrap();
        soft.allocate_descriptor_set(pool, layout, HeapCounts { resource: 2, sampler: 0 }, 0)
            .unwrap();
    }
}
