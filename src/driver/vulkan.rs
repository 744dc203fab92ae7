//! Driver on top of an existing Vulkan device.
//!
//! Instance and device creation are left to the application. The driver only needs the
//! handles and the list of optional extensions that were enabled.

use std::ffi::c_void;
use std::sync::{Mutex, PoisonError};

use ahash::{AHashMap, AHashSet};
use ash::extensions::khr;
use ash::vk::{self, Handle};

use super::*;
use crate::descriptor::{AddressMode, BorderColor, CompareFunc, Filter};
use crate::error::Error;
use crate::resource::{BufferUsage, TextureKind, TextureUsage};

/// Optional device features the driver may use. Each must have been enabled at device creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VulkanExtensions {
    /// `VK_KHR_acceleration_structure`
    pub acceleration_structure: bool,
    /// `VK_KHR_push_descriptor`
    pub push_descriptor: bool,
    /// `VK_VALVE_mutable_descriptor_type`
    pub mutable_descriptor_type: bool,
    /// `VK_EXT_memory_priority`
    pub memory_priority: bool,
}

pub struct VulkanDriver {
    device: ash::Device,
    acceleration_structure: Option<khr::AccelerationStructure>,
    extensions: VulkanExtensions,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: DeviceLimits,
    /// Sizes of live memory objects, to clamp flushes.
    memory_sizes: Mutex<AHashMap<RawMemory, u64>>,
    /// Views that are buffer views rather than image views.
    buffer_views: Mutex<AHashSet<RawView>>,
}

impl VulkanDriver {
    /// # Safety
    ///
    /// `device` must have been created from `physical_device` of `instance` with every extension
    /// flagged in `extensions` enabled, and must outlive the driver.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        extensions: VulkanExtensions,
    ) -> Self {
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let mut push_descriptor = vk::PhysicalDevicePushDescriptorPropertiesKHR::default();
        let mut acceleration_structure =
            vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties = vk::PhysicalDeviceProperties2::builder();
        if extensions.push_descriptor {
            properties = properties.push_next(&mut push_descriptor);
        }
        if extensions.acceleration_structure {
            properties = properties.push_next(&mut acceleration_structure);
        }
        instance.get_physical_device_properties2(physical_device, &mut properties);
        let vk_limits = properties.properties.limits;

        let limits = DeviceLimits {
            max_bound_descriptor_sets: vk_limits.max_bound_descriptor_sets,
            max_push_constant_size: vk_limits.max_push_constants_size,
            max_push_descriptors: push_descriptor.max_push_descriptors,
            max_descriptor_set_num: u32::MAX,
            // Pools are sized per descriptor type, there is no global heap.
            resource_heap_size: u32::MAX,
            sampler_heap_size: u32::MAX,
            constant_buffer_offset_alignment: vk_limits.min_uniform_buffer_offset_alignment,
            storage_buffer_offset_alignment: vk_limits.min_storage_buffer_offset_alignment,
            scratch_buffer_alignment: (acceleration_structure
                .min_acceleration_structure_scratch_offset_alignment as u64)
                .max(1),
            non_coherent_atom_size: vk_limits.non_coherent_atom_size,
            max_sampler_anisotropy: vk_limits.max_sampler_anisotropy as u32,
            ray_tracing: extensions.acceleration_structure,
            mutable_descriptors: extensions.mutable_descriptor_type,
        };
        log::debug!("vulkan limits: {limits:?}");

        Self {
            acceleration_structure: extensions
                .acceleration_structure
                .then(|| khr::AccelerationStructure::new(instance, &device)),
            device,
            extensions,
            memory_properties,
            limits,
            memory_sizes: Default::default(),
            buffer_views: Default::default(),
        }
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    fn acceleration_structure_ext(&self) -> Result<&khr::AccelerationStructure> {
        self.acceleration_structure
            .as_ref()
            .ok_or_else(|| Error::failure("acceleration structures are not enabled"))
    }

    /// The list every mutable binding and pool entry uses.
    fn mutable_type_list(&self) -> Vec<vk::DescriptorType> {
        mutable_list(&crate::layout::mutable_types(self.limits.ray_tracing))
    }
}

fn mutable_list(types: &[DescriptorType]) -> Vec<vk::DescriptorType> {
    // Structured and storage-structured buffers are both STORAGE_BUFFER.
    let mut seen = AHashSet::new();
    types
        .iter()
        .map(|&ty| descriptor_type(ty))
        .filter(|ty| seen.insert(ty.as_raw()))
        .collect()
}

fn descriptor_type(ty: DescriptorType) -> vk::DescriptorType {
    match ty {
        DescriptorType::Sampler => vk::DescriptorType::SAMPLER,
        DescriptorType::ConstantBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorType::Texture => vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorType::StorageTexture => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorType::Buffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        DescriptorType::StorageBuffer => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
        DescriptorType::StructuredBuffer | DescriptorType::StorageStructuredBuffer => {
            vk::DescriptorType::STORAGE_BUFFER
        }
        DescriptorType::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
    }
}

fn format(format: Format) -> vk::Format {
    match format {
        Format::Unknown => vk::Format::UNDEFINED,
        Format::R8Unorm => vk::Format::R8_UNORM,
        Format::R8Uint => vk::Format::R8_UINT,
        Format::Rg8Unorm => vk::Format::R8G8_UNORM,
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        Format::Rgba8Uint => vk::Format::R8G8B8A8_UINT,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::R16Float => vk::Format::R16_SFLOAT,
        Format::R16Uint => vk::Format::R16_UINT,
        Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::R32Uint => vk::Format::R32_UINT,
        Format::R32Sint => vk::Format::R32_SINT,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::Rg32Float => vk::Format::R32G32_SFLOAT,
        Format::Rgba32Uint => vk::Format::R32G32B32A32_UINT,
        Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::D16Unorm => vk::Format::D16_UNORM,
        Format::D32Float => vk::Format::D32_SFLOAT,
        Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
        Format::D32FloatS8Uint => vk::Format::D32_SFLOAT_S8_UINT,
    }
}

fn aspects(format: Format) -> vk::ImageAspectFlags {
    let mut aspects = vk::ImageAspectFlags::empty();
    if format.has_depth() {
        aspects |= vk::ImageAspectFlags::DEPTH;
    }
    if format.has_stencil() {
        aspects |= vk::ImageAspectFlags::STENCIL;
    }
    if aspects.is_empty() {
        vk::ImageAspectFlags::COLOR
    } else {
        aspects
    }
}

fn shader_stages(stages: ShaderStages) -> vk::ShaderStageFlags {
    const STAGES: [(ShaderStages, vk::ShaderStageFlags); 14] = [
        (ShaderStages::VERTEX, vk::ShaderStageFlags::VERTEX),
        (ShaderStages::TESS_CONTROL, vk::ShaderStageFlags::TESSELLATION_CONTROL),
        (ShaderStages::TESS_EVALUATION, vk::ShaderStageFlags::TESSELLATION_EVALUATION),
        (ShaderStages::GEOMETRY, vk::ShaderStageFlags::GEOMETRY),
        (ShaderStages::FRAGMENT, vk::ShaderStageFlags::FRAGMENT),
        (ShaderStages::COMPUTE, vk::ShaderStageFlags::COMPUTE),
        (ShaderStages::RAYGEN, vk::ShaderStageFlags::RAYGEN_KHR),
        (ShaderStages::MISS, vk::ShaderStageFlags::MISS_KHR),
        (ShaderStages::INTERSECTION, vk::ShaderStageFlags::INTERSECTION_KHR),
        (ShaderStages::CLOSEST_HIT, vk::ShaderStageFlags::CLOSEST_HIT_KHR),
        (ShaderStages::ANY_HIT, vk::ShaderStageFlags::ANY_HIT_KHR),
        (ShaderStages::CALLABLE, vk::ShaderStageFlags::CALLABLE_KHR),
        (ShaderStages::TASK, vk::ShaderStageFlags::TASK_NV),
        (ShaderStages::MESH, vk::ShaderStageFlags::MESH_NV),
    ];
    STAGES
        .iter()
        .filter(|(stage, _)| stages.contains(*stage))
        .fold(vk::ShaderStageFlags::empty(), |acc, (_, vk)| acc | *vk)
}

fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    if usage.contains(BufferUsage::SHADER_RESOURCE) {
        flags |= vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::SHADER_RESOURCE_STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::CONSTANT_BUFFER) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::VERTEX_BUFFER) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX_BUFFER) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::ARGUMENT_BUFFER) {
        flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    if usage.contains(BufferUsage::SCRATCH_BUFFER) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    }
    if usage.contains(BufferUsage::ACCELERATION_STRUCTURE_STORAGE) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    }
    if usage.contains(BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    }
    flags
}

fn texture_usage(usage: TextureUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    if usage.contains(TextureUsage::SHADER_RESOURCE) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::SHADER_RESOURCE_STORAGE) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::COLOR_ATTACHMENT) {
        flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(TextureUsage::DEPTH_STENCIL_ATTACHMENT) {
        flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    flags
}

fn filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
    }
}

fn address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

fn compare_op(func: CompareFunc) -> vk::CompareOp {
    match func {
        CompareFunc::None | CompareFunc::Always => vk::CompareOp::ALWAYS,
        CompareFunc::Never => vk::CompareOp::NEVER,
        CompareFunc::Less => vk::CompareOp::LESS,
        CompareFunc::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareFunc::Equal => vk::CompareOp::EQUAL,
        CompareFunc::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareFunc::Greater => vk::CompareOp::GREATER,
        CompareFunc::NotEqual => vk::CompareOp::NOT_EQUAL,
    }
}

fn border_color(color: BorderColor) -> vk::BorderColor {
    match color {
        BorderColor::FloatTransparentBlack => vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
        BorderColor::FloatOpaqueBlack => vk::BorderColor::FLOAT_OPAQUE_BLACK,
        BorderColor::FloatOpaqueWhite => vk::BorderColor::FLOAT_OPAQUE_WHITE,
        BorderColor::IntTransparentBlack => vk::BorderColor::INT_TRANSPARENT_BLACK,
        BorderColor::IntOpaqueBlack => vk::BorderColor::INT_OPAQUE_BLACK,
        BorderColor::IntOpaqueWhite => vk::BorderColor::INT_OPAQUE_WHITE,
    }
}

fn view_type(dimension: ViewDimension) -> vk::ImageViewType {
    match dimension {
        ViewDimension::D1 => vk::ImageViewType::TYPE_1D,
        ViewDimension::D1Array => vk::ImageViewType::TYPE_1D_ARRAY,
        ViewDimension::D2 => vk::ImageViewType::TYPE_2D,
        ViewDimension::D2Array | ViewDimension::D2MsArray => vk::ImageViewType::TYPE_2D_ARRAY,
        ViewDimension::Cube => vk::ImageViewType::CUBE,
        ViewDimension::CubeArray => vk::ImageViewType::CUBE_ARRAY,
        ViewDimension::D3 => vk::ImageViewType::TYPE_3D,
    }
}

fn memory_flags(flags: vk::MemoryPropertyFlags) -> MemoryPropertyFlags {
    const FLAGS: [(vk::MemoryPropertyFlags, MemoryPropertyFlags); 6] = [
        (vk::MemoryPropertyFlags::DEVICE_LOCAL, MemoryPropertyFlags::DEVICE_LOCAL),
        (vk::MemoryPropertyFlags::HOST_VISIBLE, MemoryPropertyFlags::HOST_VISIBLE),
        (vk::MemoryPropertyFlags::HOST_COHERENT, MemoryPropertyFlags::HOST_COHERENT),
        (vk::MemoryPropertyFlags::HOST_CACHED, MemoryPropertyFlags::HOST_CACHED),
        (vk::MemoryPropertyFlags::LAZILY_ALLOCATED, MemoryPropertyFlags::LAZILY_ALLOCATED),
        (vk::MemoryPropertyFlags::PROTECTED, MemoryPropertyFlags::PROTECTED),
    ];
    FLAGS
        .iter()
        .filter(|(vk, _)| flags.contains(*vk))
        .fold(MemoryPropertyFlags::empty(), |acc, (_, ours)| acc | *ours)
}

/// Pool size entries for a capacity, merging kinds that share a native type.
fn pool_sizes(counts: &DescriptorCounts) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = vec![];
    let entries = DescriptorType::ALL
        .iter()
        .map(|&ty| (descriptor_type(ty), counts.get(ty)))
        .chain(std::iter::once((vk::DescriptorType::MUTABLE_VALVE, counts.mutable)));
    for (ty, count) in entries.filter(|&(_, count)| count != 0) {
        match sizes.iter_mut().find(|size| size.ty == ty) {
            Some(size) => size.descriptor_count += count,
            None => sizes.push(vk::DescriptorPoolSize {
                ty,
                descriptor_count: count,
            }),
        }
    }
    sizes
}

/// Image, buffer, texel buffer or acceleration structure payload of one write.
enum WritePayload {
    Image(vk::DescriptorImageInfo),
    Buffer(vk::DescriptorBufferInfo),
    TexelBuffer(vk::BufferView),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

fn payload(write: &DescriptorWrite) -> WritePayload {
    match write.descriptor {
        NativeDescriptor::Texture(view) => WritePayload::Image(vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: vk::ImageView::from_raw(view.as_raw()),
            image_layout: if write.descriptor_type == DescriptorType::StorageTexture {
                vk::ImageLayout::GENERAL
            } else {
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            },
        }),
        NativeDescriptor::Sampler(sampler) => WritePayload::Image(vk::DescriptorImageInfo {
            sampler: vk::Sampler::from_raw(sampler.as_raw()),
            image_view: vk::ImageView::null(),
            image_layout: vk::ImageLayout::UNDEFINED,
        }),
        NativeDescriptor::TexelBuffer(view) => {
            WritePayload::TexelBuffer(vk::BufferView::from_raw(view.as_raw()))
        }
        NativeDescriptor::Buffer {
            buffer,
            offset,
            size,
            ..
        } => WritePayload::Buffer(vk::DescriptorBufferInfo {
            buffer: vk::Buffer::from_raw(buffer.as_raw()),
            offset,
            range: size,
        }),
        NativeDescriptor::AccelerationStructure(raw) => {
            WritePayload::AccelerationStructure(vk::AccelerationStructureKHR::from_raw(raw.as_raw()))
        }
    }
}

impl Driver for VulkanDriver {
    fn memory_properties(&self) -> MemoryProperties {
        let properties = &self.memory_properties;
        MemoryProperties {
            types: properties.memory_types[..properties.memory_type_count as usize]
                .iter()
                .map(|ty| MemoryTypeProperties {
                    flags: memory_flags(ty.property_flags),
                    heap_index: ty.heap_index,
                })
                .collect(),
            heaps: properties.memory_heaps[..properties.memory_heap_count as usize]
                .iter()
                .map(|heap| MemoryHeapProperties {
                    size: heap.size,
                    device_local: heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL),
                })
                .collect(),
        }
    }

    fn limits(&self) -> DeviceLimits {
        self.limits.clone()
    }

    fn allocate_memory(&self, info: &MemoryAllocateInfo) -> Result<RawMemory> {
        let mut dedicated = vk::MemoryDedicatedAllocateInfo::builder();
        match info.dedicated {
            Some(NativeResource::Buffer(buffer)) => {
                dedicated = dedicated.buffer(vk::Buffer::from_raw(buffer.as_raw()))
            }
            Some(NativeResource::Texture(texture)) => {
                dedicated = dedicated.image(vk::Image::from_raw(texture.as_raw()))
            }
            None => {}
        }
        let mut priority =
            vk::MemoryPriorityAllocateInfoEXT::builder().priority(info.priority.clamp(0.0, 1.0));

        let mut allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(info.size)
            .memory_type_index(info.type_index);
        if info.dedicated.is_some() {
            allocate_info = allocate_info.push_next(&mut dedicated);
        }
        if self.extensions.memory_priority {
            allocate_info = allocate_info.push_next(&mut priority);
        }

        let memory = unsafe { self.device.allocate_memory(&allocate_info, None)? };
        let raw = RawMemory(memory.as_raw());
        self.memory_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(raw, info.size);
        Ok(raw)
    }

    fn map_memory(&self, memory: RawMemory) -> Result<*mut u8> {
        let ptr = unsafe {
            self.device.map_memory(
                vk::DeviceMemory::from_raw(memory.as_raw()),
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )?
        };
        Ok(ptr.cast())
    }

    fn flush_memory(&self, memory: RawMemory, offset: u64, size: u64) -> Result<()> {
        let atom = self.limits.non_coherent_atom_size.max(1);
        let memory_size = self
            .memory_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&memory)
            .copied()
            .unwrap_or(u64::MAX);
        let start = offset / atom * atom;
        let end = crate::util::align(atom, offset.saturating_add(size));
        let size = if end >= memory_size {
            vk::WHOLE_SIZE
        } else {
            end - start
        };
        let range = vk::MappedMemoryRange::builder()
            .memory(vk::DeviceMemory::from_raw(memory.as_raw()))
            .offset(start)
            .size(size)
            .build();
        unsafe { self.device.flush_mapped_memory_ranges(&[range])? };
        Ok(())
    }

    fn free_memory(&self, memory: RawMemory) {
        self.memory_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&memory);
        unsafe {
            self.device
                .free_memory(vk::DeviceMemory::from_raw(memory.as_raw()), None)
        };
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<RawBuffer> {
        let info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None)? };
        Ok(RawBuffer(buffer.as_raw()))
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        unsafe {
            self.device
                .destroy_buffer(vk::Buffer::from_raw(buffer.as_raw()), None)
        };
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<RawTexture> {
        let image_type = match desc.kind {
            TextureKind::D1 => vk::ImageType::TYPE_1D,
            TextureKind::D2 => vk::ImageType::TYPE_2D,
            TextureKind::D3 => vk::ImageType::TYPE_3D,
        };
        let mut flags = vk::ImageCreateFlags::MUTABLE_FORMAT;
        if desc.kind == TextureKind::D2
            && desc.layer_num % 6 == 0
            && desc.width == desc.height
            && desc.sample_num == 1
        {
            flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
        }
        if desc.kind == TextureKind::D3 {
            flags |= vk::ImageCreateFlags::TYPE_2D_ARRAY_COMPATIBLE;
        }
        let info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(image_type)
            .format(format(desc.format))
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: desc.depth,
            })
            .mip_levels(desc.mip_num)
            .array_layers(desc.layer_num)
            .samples(vk::SampleCountFlags::from_raw(desc.sample_num))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(texture_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&info, None)? };
        Ok(RawTexture(image.as_raw()))
    }

    fn destroy_texture(&self, texture: RawTexture) {
        unsafe {
            self.device
                .destroy_image(vk::Image::from_raw(texture.as_raw()), None)
        };
    }

    fn memory_requirements(&self, resource: NativeResource) -> MemoryRequirements {
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements = vk::MemoryRequirements2::builder().push_next(&mut dedicated);
        unsafe {
            match resource {
                NativeResource::Buffer(buffer) => self.device.get_buffer_memory_requirements2(
                    &vk::BufferMemoryRequirementsInfo2::builder()
                        .buffer(vk::Buffer::from_raw(buffer.as_raw())),
                    &mut requirements,
                ),
                NativeResource::Texture(texture) => self.device.get_image_memory_requirements2(
                    &vk::ImageMemoryRequirementsInfo2::builder()
                        .image(vk::Image::from_raw(texture.as_raw())),
                    &mut requirements,
                ),
            }
        }
        let memory = requirements.memory_requirements;
        MemoryRequirements {
            size: memory.size,
            alignment: memory.alignment,
            type_bits: memory.memory_type_bits,
            requires_dedicated: dedicated.requires_dedicated_allocation == vk::TRUE,
        }
    }

    fn bind_memory(&self, resource: NativeResource, memory: RawMemory, offset: u64) -> Result<()> {
        let memory = vk::DeviceMemory::from_raw(memory.as_raw());
        unsafe {
            match resource {
                NativeResource::Buffer(buffer) => self.device.bind_buffer_memory(
                    vk::Buffer::from_raw(buffer.as_raw()),
                    memory,
                    offset,
                )?,
                NativeResource::Texture(texture) => self.device.bind_image_memory(
                    vk::Image::from_raw(texture.as_raw()),
                    memory,
                    offset,
                )?,
            }
        }
        Ok(())
    }

    fn create_texture_view(&self, info: &TextureViewInfo) -> Result<RawView> {
        let (usage, aspect_mask) = match info.usage {
            // Sampling reads a single aspect.
            ViewUsage::ShaderResource if info.format.has_depth() => {
                (vk::ImageUsageFlags::SAMPLED, vk::ImageAspectFlags::DEPTH)
            }
            ViewUsage::ShaderResource => (vk::ImageUsageFlags::SAMPLED, aspects(info.format)),
            ViewUsage::Storage => (vk::ImageUsageFlags::STORAGE, aspects(info.format)),
            ViewUsage::ColorAttachment => {
                (vk::ImageUsageFlags::COLOR_ATTACHMENT, vk::ImageAspectFlags::COLOR)
            }
            ViewUsage::DepthStencil(_) => (
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                aspects(info.format),
            ),
        };
        let mut view_usage = vk::ImageViewUsageCreateInfo::builder().usage(usage);
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(vk::Image::from_raw(info.texture.as_raw()))
            .view_type(view_type(info.dimension))
            .format(format(info.format))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: info.mip_offset,
                level_count: info.mip_num,
                base_array_layer: info.layer_offset,
                layer_count: info.layer_num,
            })
            .push_next(&mut view_usage);
        let view = unsafe { self.device.create_image_view(&create_info, None)? };
        Ok(RawView(view.as_raw()))
    }

    fn create_buffer_view(&self, info: &BufferViewInfo) -> Result<RawView> {
        let create_info = vk::BufferViewCreateInfo::builder()
            .buffer(vk::Buffer::from_raw(info.buffer.as_raw()))
            .format(format(info.format))
            .offset(info.offset)
            .range(info.size);
        let view = unsafe { self.device.create_buffer_view(&create_info, None)? };
        let raw = RawView(view.as_raw());
        self.buffer_views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(raw);
        Ok(raw)
    }

    fn destroy_view(&self, view: RawView) {
        let is_buffer_view = self
            .buffer_views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&view);
        unsafe {
            if is_buffer_view {
                self.device
                    .destroy_buffer_view(vk::BufferView::from_raw(view.as_raw()), None)
            } else {
                self.device
                    .destroy_image_view(vk::ImageView::from_raw(view.as_raw()), None)
            }
        };
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<RawSampler> {
        let anisotropy = desc.anisotropy > 1;
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(filter(desc.mag_filter))
            .min_filter(filter(desc.min_filter))
            .mipmap_mode(match desc.mip_filter {
                Filter::Nearest => vk::SamplerMipmapMode::NEAREST,
                Filter::Linear => vk::SamplerMipmapMode::LINEAR,
            })
            .address_mode_u(address_mode(desc.address_modes[0]))
            .address_mode_v(address_mode(desc.address_modes[1]))
            .address_mode_w(address_mode(desc.address_modes[2]))
            .mip_lod_bias(desc.mip_bias)
            .anisotropy_enable(anisotropy)
            .max_anisotropy(if anisotropy { desc.anisotropy as f32 } else { 1.0 })
            .compare_enable(desc.compare != CompareFunc::None)
            .compare_op(compare_op(desc.compare))
            .min_lod(desc.mip_min)
            .max_lod(desc.mip_max)
            .border_color(border_color(desc.border_color));
        let sampler = unsafe { self.device.create_sampler(&info, None)? };
        Ok(RawSampler(sampler.as_raw()))
    }

    fn destroy_sampler(&self, sampler: RawSampler) {
        unsafe {
            self.device
                .destroy_sampler(vk::Sampler::from_raw(sampler.as_raw()), None)
        };
    }

    fn create_acceleration_structure(
        &self,
        info: &AccelerationStructureInfo,
    ) -> Result<RawAccelerationStructure> {
        let ext = self.acceleration_structure_ext()?;
        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(vk::Buffer::from_raw(info.buffer.as_raw()))
            .size(info.size)
            .ty(match info.kind {
                AccelerationStructureKind::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                AccelerationStructureKind::BottomLevel => {
                    vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL
                }
            });
        let raw = unsafe { ext.create_acceleration_structure(&create_info, None)? };
        Ok(RawAccelerationStructure(raw.as_raw()))
    }

    fn destroy_acceleration_structure(&self, acceleration_structure: RawAccelerationStructure) {
        if let Some(ext) = &self.acceleration_structure {
            unsafe {
                ext.destroy_acceleration_structure(
                    vk::AccelerationStructureKHR::from_raw(acceleration_structure.as_raw()),
                    None,
                )
            };
        }
    }

    fn create_set_layout(&self, info: &SetLayoutInfo) -> Result<RawSetLayout> {
        let immutable_samplers = info
            .bindings
            .iter()
            .map(|binding| {
                binding
                    .immutable_samplers
                    .iter()
                    .map(|sampler| vk::Sampler::from_raw(sampler.as_raw()))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        let mutable_types = info
            .bindings
            .iter()
            .map(|binding| match &binding.kind {
                BindingKind::Mutable(types) => mutable_list(types),
                BindingKind::Single(_) => vec![],
            })
            .collect::<Vec<_>>();

        let bindings = info
            .bindings
            .iter()
            .zip(&immutable_samplers)
            .map(|(binding, samplers)| {
                let ty = match &binding.kind {
                    BindingKind::Single(ty) => descriptor_type(*ty),
                    BindingKind::Mutable(_) => vk::DescriptorType::MUTABLE_VALVE,
                };
                let mut builder = vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding.binding)
                    .descriptor_type(ty)
                    .stage_flags(shader_stages(binding.stages));
                if !samplers.is_empty() {
                    builder = builder.immutable_samplers(samplers);
                }
                // Set after the samplers, which overwrite the count.
                builder.descriptor_count(binding.count).build()
            })
            .collect::<Vec<_>>();
        let binding_flags = info
            .bindings
            .iter()
            .map(|binding| {
                let mut flags = vk::DescriptorBindingFlags::empty();
                if binding.flags.contains(BindingFlags::PARTIALLY_BOUND) {
                    flags |= vk::DescriptorBindingFlags::PARTIALLY_BOUND;
                }
                if binding.flags.contains(BindingFlags::UPDATE_AFTER_BIND) {
                    flags |= vk::DescriptorBindingFlags::UPDATE_AFTER_BIND;
                }
                if binding.flags.contains(BindingFlags::VARIABLE_COUNT) {
                    flags |= vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT;
                }
                flags
            })
            .collect::<Vec<_>>();
        let mutable_lists = mutable_types
            .iter()
            .map(|types| {
                vk::MutableDescriptorTypeListVALVE::builder()
                    .descriptor_types(types)
                    .build()
            })
            .collect::<Vec<_>>();

        let mut flags = vk::DescriptorSetLayoutCreateFlags::empty();
        if info.flags.contains(SetLayoutFlags::PUSH) {
            flags |= vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR;
        }
        if info.flags.contains(SetLayoutFlags::UPDATE_AFTER_BIND) {
            flags |= vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL;
        }

        let mut binding_flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&binding_flags);
        let mut mutable_info = vk::MutableDescriptorTypeCreateInfoVALVE::builder()
            .mutable_descriptor_type_lists(&mutable_lists);
        let mut create_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(flags)
            .bindings(&bindings)
            .push_next(&mut binding_flags_info);
        if info
            .bindings
            .iter()
            .any(|binding| matches!(binding.kind, BindingKind::Mutable(_)))
        {
            create_info = create_info.push_next(&mut mutable_info);
        }

        let layout = unsafe { self.device.create_descriptor_set_layout(&create_info, None)? };
        Ok(RawSetLayout(layout.as_raw()))
    }

    fn destroy_set_layout(&self, layout: RawSetLayout) {
        unsafe {
            self.device.destroy_descriptor_set_layout(
                vk::DescriptorSetLayout::from_raw(layout.as_raw()),
                None,
            )
        };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[RawSetLayout],
        push_constants: &[PushConstantRange],
    ) -> Result<RawPipelineLayout> {
        let set_layouts = set_layouts
            .iter()
            .map(|layout| vk::DescriptorSetLayout::from_raw(layout.as_raw()))
            .collect::<Vec<_>>();
        let push_constants = push_constants
            .iter()
            .map(|range| vk::PushConstantRange {
                stage_flags: shader_stages(range.stages),
                offset: range.offset,
                size: range.size,
            })
            .collect::<Vec<_>>();
        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constants);
        let layout = unsafe { self.device.create_pipeline_layout(&info, None)? };
        Ok(RawPipelineLayout(layout.as_raw()))
    }

    fn destroy_pipeline_layout(&self, layout: RawPipelineLayout) {
        unsafe {
            self.device
                .destroy_pipeline_layout(vk::PipelineLayout::from_raw(layout.as_raw()), None)
        };
    }

    fn create_descriptor_pool(&self, capacity: &PoolCapacity) -> Result<RawDescriptorPool> {
        let sizes = pool_sizes(&capacity.counts);
        let mutable_types = self.mutable_type_list();
        let mutable_lists = sizes
            .iter()
            .map(|size| {
                let types: &[vk::DescriptorType] = if size.ty == vk::DescriptorType::MUTABLE_VALVE {
                    &mutable_types
                } else {
                    &[]
                };
                vk::MutableDescriptorTypeListVALVE::builder()
                    .descriptor_types(types)
                    .build()
            })
            .collect::<Vec<_>>();

        let mut flags = vk::DescriptorPoolCreateFlags::empty();
        if capacity.update_after_bind {
            flags |= vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND;
        }
        let mut mutable_info = vk::MutableDescriptorTypeCreateInfoVALVE::builder()
            .mutable_descriptor_type_lists(&mutable_lists);
        let mut info = vk::DescriptorPoolCreateInfo::builder()
            .flags(flags)
            .max_sets(capacity.set_max_num)
            .pool_sizes(&sizes);
        if capacity.counts.mutable != 0 {
            info = info.push_next(&mut mutable_info);
        }
        let pool = unsafe { self.device.create_descriptor_pool(&info, None)? };
        Ok(RawDescriptorPool(pool.as_raw()))
    }

    fn destroy_descriptor_pool(&self, pool: RawDescriptorPool) {
        unsafe {
            self.device
                .destroy_descriptor_pool(vk::DescriptorPool::from_raw(pool.as_raw()), None)
        };
    }

    fn reset_descriptor_pool(&self, pool: RawDescriptorPool) -> Result<()> {
        unsafe {
            self.device.reset_descriptor_pool(
                vk::DescriptorPool::from_raw(pool.as_raw()),
                vk::DescriptorPoolResetFlags::empty(),
            )?
        };
        Ok(())
    }

    fn allocate_descriptor_set(
        &self,
        pool: RawDescriptorPool,
        layout: RawSetLayout,
        _heap_offsets: HeapCounts,
        variable_count: u32,
    ) -> Result<RawDescriptorSet> {
        let layouts = [vk::DescriptorSetLayout::from_raw(layout.as_raw())];
        let counts = [variable_count];
        // Ignored for layouts without a variable-sized binding.
        let mut variable =
            vk::DescriptorSetVariableDescriptorCountAllocateInfo::builder().descriptor_counts(&counts);
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(vk::DescriptorPool::from_raw(pool.as_raw()))
            .set_layouts(&layouts)
            .push_next(&mut variable);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info)? };
        sets.first()
            .map(|set| RawDescriptorSet(set.as_raw()))
            .ok_or_else(|| Error::failure("driver returned no descriptor set"))
    }

    fn write_descriptors(&self, writes: &[DescriptorWrite]) {
        let payloads = writes.iter().map(payload).collect::<Vec<_>>();
        let acceleration_structures = payloads
            .iter()
            .map(|payload| match payload {
                WritePayload::AccelerationStructure(raw) => {
                    vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                        .acceleration_structures(std::slice::from_ref(raw))
                        .build()
                }
                _ => vk::WriteDescriptorSetAccelerationStructureKHR::default(),
            })
            .collect::<Vec<_>>();

        let vk_writes = writes
            .iter()
            .zip(&payloads)
            .zip(&acceleration_structures)
            .map(|((write, payload), acceleration_structure)| {
                let builder = vk::WriteDescriptorSet::builder()
                    .dst_set(vk::DescriptorSet::from_raw(write.set.as_raw()))
                    .dst_binding(write.slot.binding)
                    .dst_array_element(write.slot.array_element)
                    .descriptor_type(descriptor_type(write.descriptor_type));
                match payload {
                    WritePayload::Image(info) => {
                        builder.image_info(std::slice::from_ref(info)).build()
                    }
                    WritePayload::Buffer(info) => {
                        builder.buffer_info(std::slice::from_ref(info)).build()
                    }
                    WritePayload::TexelBuffer(view) => {
                        builder.texel_buffer_view(std::slice::from_ref(view)).build()
                    }
                    WritePayload::AccelerationStructure(_) => {
                        let mut write = builder.build();
                        write.descriptor_count = 1;
                        write.p_next = acceleration_structure as *const _ as *const c_void;
                        write
                    }
                }
            })
            .collect::<Vec<_>>();

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    fn copy_descriptors(&self, copies: &[DescriptorCopy]) {
        let vk_copies = copies
            .iter()
            .map(|copy| {
                vk::CopyDescriptorSet::builder()
                    .src_set(vk::DescriptorSet::from_raw(copy.src_set.as_raw()))
                    .src_binding(copy.src_slot.binding)
                    .src_array_element(copy.src_slot.array_element)
                    .dst_set(vk::DescriptorSet::from_raw(copy.dst_set.as_raw()))
                    .dst_binding(copy.dst_slot.binding)
                    .dst_array_element(copy.dst_slot.array_element)
                    .descriptor_count(1)
                    .build()
            })
            .collect::<Vec<_>>();
        unsafe { self.device.update_descriptor_sets(&[], &vk_copies) };
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn structured_kinds_share_storage_buffers() {
        let list = mutable_list(&crate::layout::mutable_types(true));
        assert_eq!(list.len(), 7);
        assert_eq!(
            list.iter()
                .filter(|&&ty| ty == vk::DescriptorType::STORAGE_BUFFER)
                .count(),
            1
        );
        assert!(list.contains(&vk::DescriptorType::ACCELERATION_STRUCTURE_KHR));
        assert_eq!(mutable_list(&crate::layout::mutable_types(false)).len(), 6);
    }

    #[test]
    fn pool_sizes_merge() {
        let sizes = pool_sizes(&DescriptorCounts {
            structured_buffer: 3,
            storage_structured_buffer: 2,
            texture: 4,
            mutable: 5,
            ..Default::default()
        });
        let count = |ty| {
            sizes
                .iter()
                .find(|size| size.ty == ty)
                .map(|size| size.descriptor_count)
        };
        assert_eq!(sizes.len(), 3);
        assert_eq!(count(vk::DescriptorType::STORAGE_BUFFER), Some(5));
        assert_eq!(count(vk::DescriptorType::SAMPLED_IMAGE), Some(4));
        assert_eq!(count(vk::DescriptorType::MUTABLE_VALVE), Some(5));
    }

    #[test]
    fn stage_and_memory_flags() {
        assert_eq!(
            shader_stages(ShaderStages::VERTEX | ShaderStages::FRAGMENT),
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(
            memory_flags(vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED),
            MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED
        );
        assert_eq!(aspects(Format::D24UnormS8Uint), vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL);
        assert_eq!(aspects(Format::Rgba8Unorm), vk::ImageAspectFlags::COLOR);
    }
}
