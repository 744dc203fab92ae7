//! The narrow interface between the binding core and a native graphics API.
//!
//! Everything the core needs from the device goes through [`Driver`]. Drivers only marshal
//! descriptions into native calls; all bookkeeping (memory classification, sub-allocation,
//! view validation, layout compilation, pool cursors, descriptor addressing) happens in the
//! core so that every back end observes the same rules.

pub mod soft;
pub mod vulkan;

use crate::descriptor::{DepthStencilReadOnly, DescriptorCounts, DescriptorType, HeapCounts, HeapType, SamplerDesc, ViewDimension};
use crate::error::Result;
use crate::format::Format;
use crate::layout::ShaderStages;
use crate::memory::MemoryPropertyFlags;
use crate::resource::{AccelerationStructureKind, BufferDesc, TextureDesc};

use bitflags::bitflags;

macro_rules! raw_handles {
    ($($(#[$meta:meta])* $name:ident;)*) => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl $name {
            pub fn as_raw(self) -> u64 {
                self.0
            }
        }
    )*};
}

raw_handles! {
    RawMemory;
    RawBuffer;
    RawTexture;
    /// A texture view or a typed (texel) buffer view.
    RawView;
    RawSampler;
    RawAccelerationStructure;
    RawSetLayout;
    RawPipelineLayout;
    RawDescriptorPool;
    RawDescriptorSet;
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryProperties {
    pub types: Vec<MemoryTypeProperties>,
    pub heaps: Vec<MemoryHeapProperties>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTypeProperties {
    pub flags: MemoryPropertyFlags,
    pub heap_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeapProperties {
    pub size: u64,
    pub device_local: bool,
}

/// Upper bounds reported by the adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceLimits {
    pub max_bound_descriptor_sets: u32,
    pub max_push_constant_size: u32,
    pub max_push_descriptors: u32,
    pub max_descriptor_set_num: u32,
    pub resource_heap_size: u32,
    pub sampler_heap_size: u32,
    pub constant_buffer_offset_alignment: u64,
    pub storage_buffer_offset_alignment: u64,
    pub scratch_buffer_alignment: u64,
    pub non_coherent_atom_size: u64,
    pub max_sampler_anisotropy: u32,
    pub ray_tracing: bool,
    pub mutable_descriptors: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeResource {
    Buffer(RawBuffer),
    Texture(RawTexture),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    /// Bit `i` is set if memory type `i` may back the resource.
    pub type_bits: u32,
    pub requires_dedicated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryAllocateInfo {
    pub type_index: u32,
    pub size: u64,
    /// Residency hint in `0..=1`. Drivers are free to ignore it.
    pub priority: f32,
    /// Resource the memory is dedicated to, if any.
    pub dedicated: Option<NativeResource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewUsage {
    ShaderResource,
    Storage,
    ColorAttachment,
    DepthStencil(DepthStencilReadOnly),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureViewInfo {
    pub texture: RawTexture,
    pub dimension: ViewDimension,
    pub format: Format,
    pub mip_offset: u32,
    pub mip_num: u32,
    pub layer_offset: u32,
    pub layer_num: u32,
    pub usage: ViewUsage,
}

/// A typed buffer view. Structured and raw views need no native object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferViewInfo {
    pub buffer: RawBuffer,
    pub format: Format,
    pub offset: u64,
    pub size: u64,
    pub storage: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelerationStructureInfo {
    pub buffer: RawBuffer,
    pub size: u64,
    pub kind: AccelerationStructureKind,
}

bitflags! {
    #[derive(Default)]
    pub struct SetLayoutFlags: u32 {
        /// Bound through push descriptors, never allocated from a pool.
        const PUSH = 1 << 0;
        const UPDATE_AFTER_BIND = 1 << 1;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct BindingFlags: u32 {
        const PARTIALLY_BOUND = 1 << 0;
        const UPDATE_AFTER_BIND = 1 << 1;
        const VARIABLE_COUNT = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingKind {
    Single(DescriptorType),
    /// May hold any of the listed types at a time.
    Mutable(Vec<DescriptorType>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetLayoutBinding {
    pub binding: u32,
    pub kind: BindingKind,
    pub count: u32,
    pub stages: ShaderStages,
    pub flags: BindingFlags,
    pub immutable_samplers: Vec<RawSampler>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetLayoutInfo {
    pub bindings: Vec<SetLayoutBinding>,
    pub flags: SetLayoutFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConstantRange {
    pub stages: ShaderStages,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCapacity {
    pub set_max_num: u32,
    pub counts: DescriptorCounts,
    pub heap_sizes: HeapCounts,
    pub update_after_bind: bool,
}

/// Where a descriptor lives. Set-based drivers read `binding`/`array_element`, heap-based
/// drivers read `heap`/`heap_offset` (absolute within the pool's heap).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSlot {
    pub binding: u32,
    pub array_element: u32,
    pub heap: HeapType,
    pub heap_offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferLayout {
    Constant,
    Typed,
    Structured { stride: u32 },
    Raw,
}

/// The native payload of a shader-visible descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeDescriptor {
    Texture(RawView),
    TexelBuffer(RawView),
    Buffer {
        buffer: RawBuffer,
        offset: u64,
        size: u64,
        layout: BufferLayout,
    },
    Sampler(RawSampler),
    AccelerationStructure(RawAccelerationStructure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub set: RawDescriptorSet,
    pub slot: DescriptorSlot,
    pub descriptor_type: DescriptorType,
    pub descriptor: NativeDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorCopy {
    pub src_set: RawDescriptorSet,
    pub src_slot: DescriptorSlot,
    pub dst_set: RawDescriptorSet,
    pub dst_slot: DescriptorSlot,
}

/// Services of the native device used by the core.
///
/// Calls are synchronous and may block on the driver's own latency. Out-of-memory conditions
/// must be reported as [`Error::OutOfMemory`](crate::Error::OutOfMemory), everything else as
/// [`Error::Failure`](crate::Error::Failure).
pub trait Driver: Send + Sync {
    fn memory_properties(&self) -> MemoryProperties;
    fn limits(&self) -> DeviceLimits;

    fn allocate_memory(&self, info: &MemoryAllocateInfo) -> Result<RawMemory>;
    /// Maps the whole memory object persistently.
    fn map_memory(&self, memory: RawMemory) -> Result<*mut u8>;
    fn flush_memory(&self, memory: RawMemory, offset: u64, size: u64) -> Result<()>;
    fn free_memory(&self, memory: RawMemory);

    fn create_buffer(&self, desc: &BufferDesc) -> Result<RawBuffer>;
    fn destroy_buffer(&self, buffer: RawBuffer);
    fn create_texture(&self, desc: &TextureDesc) -> Result<RawTexture>;
    fn destroy_texture(&self, texture: RawTexture);
    fn memory_requirements(&self, resource: NativeResource) -> MemoryRequirements;
    fn bind_memory(&self, resource: NativeResource, memory: RawMemory, offset: u64) -> Result<()>;

    fn create_texture_view(&self, info: &TextureViewInfo) -> Result<RawView>;
    fn create_buffer_view(&self, info: &BufferViewInfo) -> Result<RawView>;
    fn destroy_view(&self, view: RawView);
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<RawSampler>;
    fn destroy_sampler(&self, sampler: RawSampler);
    fn create_acceleration_structure(
        &self,
        info: &AccelerationStructureInfo,
    ) -> Result<RawAccelerationStructure>;
    fn destroy_acceleration_structure(&self, acceleration_structure: RawAccelerationStructure);

    fn create_set_layout(&self, info: &SetLayoutInfo) -> Result<RawSetLayout>;
    fn destroy_set_layout(&self, layout: RawSetLayout);
    fn create_pipeline_layout(
        &self,
        set_layouts: &[RawSetLayout],
        push_constants: &[PushConstantRange],
    ) -> Result<RawPipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: RawPipelineLayout);

    fn create_descriptor_pool(&self, capacity: &PoolCapacity) -> Result<RawDescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: RawDescriptorPool);
    fn reset_descriptor_pool(&self, pool: RawDescriptorPool) -> Result<()>;
    /// `heap_offsets` is where the set starts in each of the pool's heaps.
    fn allocate_descriptor_set(
        &self,
        pool: RawDescriptorPool,
        layout: RawSetLayout,
        heap_offsets: HeapCounts,
        variable_count: u32,
    ) -> Result<RawDescriptorSet>;
    fn write_descriptors(&self, writes: &[DescriptorWrite]);
    fn copy_descriptors(&self, copies: &[DescriptorCopy]);
}
