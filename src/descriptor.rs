//! Descriptors: typed, immutable views that bind a shader slot to a resource or sampler.

mod view;

pub use self::view::Subresource;

use std::sync::{Arc, Weak};

use crate::driver::{
    BufferLayout, Driver, NativeDescriptor, RawAccelerationStructure, RawBuffer, RawSampler,
    RawView,
};
use crate::error::{Error, Result};
use crate::format::Format;

/// Count sentinel meaning "everything from the offset to the end".
pub const REMAINING: u32 = u32::MAX;

/// The closed set of shader-visible descriptor kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DescriptorType {
    Sampler,
    ConstantBuffer,
    Texture,
    StorageTexture,
    /// Typed (texel) buffer.
    Buffer,
    StorageBuffer,
    StructuredBuffer,
    StorageStructuredBuffer,
    AccelerationStructure,
}

impl DescriptorType {
    pub const ALL: [DescriptorType; 9] = [
        DescriptorType::Sampler,
        DescriptorType::ConstantBuffer,
        DescriptorType::Texture,
        DescriptorType::StorageTexture,
        DescriptorType::Buffer,
        DescriptorType::StorageBuffer,
        DescriptorType::StructuredBuffer,
        DescriptorType::StorageStructuredBuffer,
        DescriptorType::AccelerationStructure,
    ];

    /// Samplers live in their own heap, everything else shares the resource heap.
    pub fn heap_type(self) -> HeapType {
        match self {
            DescriptorType::Sampler => HeapType::Sampler,
            _ => HeapType::Resource,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    Resource,
    Sampler,
}

/// One number per [`HeapType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HeapCounts {
    pub resource: u32,
    pub sampler: u32,
}

impl HeapCounts {
    pub fn get(&self, heap: HeapType) -> u32 {
        match heap {
            HeapType::Resource => self.resource,
            HeapType::Sampler => self.sampler,
        }
    }

    pub fn get_mut(&mut self, heap: HeapType) -> &mut u32 {
        match heap {
            HeapType::Resource => &mut self.resource,
            HeapType::Sampler => &mut self.sampler,
        }
    }
}

/// Descriptor counts by kind. Mutable ranges are counted apart from the fixed kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DescriptorCounts {
    pub sampler: u32,
    pub constant_buffer: u32,
    pub texture: u32,
    pub storage_texture: u32,
    pub buffer: u32,
    pub storage_buffer: u32,
    pub structured_buffer: u32,
    pub storage_structured_buffer: u32,
    pub acceleration_structure: u32,
    pub mutable: u32,
}

impl DescriptorCounts {
    /// Number of entries in [`DescriptorCounts::to_array`].
    pub const LEN: usize = DescriptorType::ALL.len() + 1;

    pub fn get(&self, ty: DescriptorType) -> u32 {
        match ty {
            DescriptorType::Sampler => self.sampler,
            DescriptorType::ConstantBuffer => self.constant_buffer,
            DescriptorType::Texture => self.texture,
            DescriptorType::StorageTexture => self.storage_texture,
            DescriptorType::Buffer => self.buffer,
            DescriptorType::StorageBuffer => self.storage_buffer,
            DescriptorType::StructuredBuffer => self.structured_buffer,
            DescriptorType::StorageStructuredBuffer => self.storage_structured_buffer,
            DescriptorType::AccelerationStructure => self.acceleration_structure,
        }
    }

    pub fn get_mut(&mut self, ty: DescriptorType) -> &mut u32 {
        match ty {
            DescriptorType::Sampler => &mut self.sampler,
            DescriptorType::ConstantBuffer => &mut self.constant_buffer,
            DescriptorType::Texture => &mut self.texture,
            DescriptorType::StorageTexture => &mut self.storage_texture,
            DescriptorType::Buffer => &mut self.buffer,
            DescriptorType::StorageBuffer => &mut self.storage_buffer,
            DescriptorType::StructuredBuffer => &mut self.structured_buffer,
            DescriptorType::StorageStructuredBuffer => &mut self.storage_structured_buffer,
            DescriptorType::AccelerationStructure => &mut self.acceleration_structure,
        }
    }

    /// The counter a range of `ty` is charged to.
    pub fn entry(&mut self, ty: DescriptorType, mutable: bool) -> &mut u32 {
        if mutable {
            &mut self.mutable
        } else {
            self.get_mut(ty)
        }
    }

    /// Counts in [`DescriptorType::ALL`] order, followed by the mutable count.
    pub fn to_array(&self) -> [u32; Self::LEN] {
        let mut array = [0; Self::LEN];
        for (slot, ty) in array.iter_mut().zip(DescriptorType::ALL) {
            *slot = self.get(ty);
        }
        array[Self::LEN - 1] = self.mutable;
        array
    }

    pub fn total(&self) -> u64 {
        self.to_array().iter().map(|&n| n as u64).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewDimension {
    D1,
    D1Array,
    D2,
    D2Array,
    D2MsArray,
    Cube,
    CubeArray,
    D3,
}

/// Which aspects of a depth-stencil view are read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepthStencilReadOnly {
    None,
    Depth,
    Stencil,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureViewType {
    ShaderResource,
    ShaderResourceArray,
    ShaderResourceCube,
    ShaderResourceCubeArray,
    ShaderResourceStorage,
    ShaderResourceStorageArray,
    ColorAttachment,
    DepthStencilAttachment,
    DepthReadonlyStencilAttachment,
    DepthAttachmentStencilReadonly,
    DepthStencilReadonly,
}

impl TextureViewType {
    /// Read-only aspects of depth-stencil view types, `None` for every other type.
    pub fn depth_stencil_read_only(self) -> Option<DepthStencilReadOnly> {
        match self {
            TextureViewType::DepthStencilAttachment => Some(DepthStencilReadOnly::None),
            TextureViewType::DepthReadonlyStencilAttachment => Some(DepthStencilReadOnly::Depth),
            TextureViewType::DepthAttachmentStencilReadonly => {
                Some(DepthStencilReadOnly::Stencil)
            }
            TextureViewType::DepthStencilReadonly => Some(DepthStencilReadOnly::Both),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureViewDesc {
    pub view_type: TextureViewType,
    /// [`Format::Unknown`] keeps the texture's format.
    pub format: Format,
    pub mip_offset: u32,
    /// May be [`REMAINING`].
    pub mip_num: u32,
    pub layer_offset: u32,
    /// May be [`REMAINING`].
    pub layer_num: u32,
}

impl TextureViewDesc {
    /// A view of every mip and layer.
    pub fn whole(view_type: TextureViewType) -> Self {
        Self {
            view_type,
            format: Format::Unknown,
            mip_offset: 0,
            mip_num: REMAINING,
            layer_offset: 0,
            layer_num: REMAINING,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferViewType {
    ShaderResource,
    ShaderResourceStorage,
    Constant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferViewDesc {
    pub view_type: BufferViewType,
    /// A known format makes a typed view, [`Format::Unknown`] a structured or raw one.
    pub format: Format,
    pub offset: u64,
    /// May be [`WHOLE_SIZE`](crate::resource::WHOLE_SIZE).
    pub size: u64,
    /// Element size of a structured view. 0 takes the buffer's stride.
    pub structure_stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Filter {
    #[default]
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareFunc {
    /// Comparison disabled.
    #[default]
    None,
    Always,
    Never,
    Less,
    LessEqual,
    Equal,
    GreaterEqual,
    Greater,
    NotEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BorderColor {
    #[default]
    FloatTransparentBlack,
    FloatOpaqueBlack,
    FloatOpaqueWhite,
    IntTransparentBlack,
    IntOpaqueBlack,
    IntOpaqueWhite,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub mip_filter: Filter,
    /// U, V and W.
    pub address_modes: [AddressMode; 3],
    pub mip_bias: f32,
    pub mip_min: f32,
    pub mip_max: f32,
    /// 0 or 1 disables anisotropic filtering.
    pub anisotropy: u32,
    pub compare: CompareFunc,
    pub border_color: BorderColor,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: Filter::Linear,
            min_filter: Filter::Linear,
            mip_filter: Filter::Linear,
            address_modes: [AddressMode::Repeat; 3],
            mip_bias: 0.0,
            mip_min: 0.0,
            mip_max: 16.0,
            anisotropy: 0,
            compare: CompareFunc::None,
            border_color: BorderColor::FloatTransparentBlack,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRange {
    pub buffer: RawBuffer,
    pub offset: u64,
    pub size: u64,
}

/// What a shader-resource or storage view points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewTarget {
    Texture(RawView),
    TexelBuffer(RawView),
    /// Structured or raw buffer access, which needs no native view object.
    Buffer { range: BufferRange, layout: BufferLayout },
}

/// The native object behind a [`Descriptor`], tagged by how it is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeView {
    ShaderResource(ViewTarget),
    Storage(ViewTarget),
    ColorAttachment(RawView),
    DepthStencil {
        view: RawView,
        read_only: DepthStencilReadOnly,
    },
    Sampler(RawSampler),
    ConstantBuffer(BufferRange),
    AccelerationStructure(RawAccelerationStructure),
}

/// A view created by the descriptor factory on [`Device`](crate::Device).
///
/// The descriptor owns its native view or sampler and destroys it on drop. It does not own the
/// viewed resource, which must outlive it.
pub struct Descriptor {
    driver: Arc<dyn Driver>,
    view: NativeView,
    format: Format,
    subresource: Option<Subresource>,
    dimension: Option<ViewDimension>,
    /// `None` for samplers.
    liveness: Option<Weak<()>>,
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("view", &self.view)
            .field("format", &self.format)
            .field("subresource", &self.subresource)
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl Descriptor {
    pub fn view(&self) -> &NativeView {
        &self.view
    }

    /// The shader-visible kind, `None` for attachment views.
    pub fn descriptor_type(&self) -> Option<DescriptorType> {
        let ty = match self.view {
            NativeView::ShaderResource(ViewTarget::Texture(_)) => DescriptorType::Texture,
            NativeView::Storage(ViewTarget::Texture(_)) => DescriptorType::StorageTexture,
            NativeView::ShaderResource(ViewTarget::TexelBuffer(_)) => DescriptorType::Buffer,
            NativeView::Storage(ViewTarget::TexelBuffer(_)) => DescriptorType::StorageBuffer,
            NativeView::ShaderResource(ViewTarget::Buffer { .. }) => {
                DescriptorType::StructuredBuffer
            }
            NativeView::Storage(ViewTarget::Buffer { .. }) => {
                DescriptorType::StorageStructuredBuffer
            }
            NativeView::Sampler(_) => DescriptorType::Sampler,
            NativeView::ConstantBuffer(_) => DescriptorType::ConstantBuffer,
            NativeView::AccelerationStructure(_) => DescriptorType::AccelerationStructure,
            NativeView::ColorAttachment(_) | NativeView::DepthStencil { .. } => return None,
        };
        Some(ty)
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn is_integer(&self) -> bool {
        self.format.is_integer()
    }

    /// Resolved mip and layer range of texture views.
    pub fn subresource(&self) -> Option<Subresource> {
        self.subresource
    }

    pub fn dimension(&self) -> Option<ViewDimension> {
        self.dimension
    }

    /// The opaque 64-bit handle command recording binds: the view, sampler or acceleration
    /// structure handle, or the buffer handle for views without a native object.
    pub fn native_handle(&self) -> u64 {
        match self.view {
            NativeView::ShaderResource(target) | NativeView::Storage(target) => match target {
                ViewTarget::Texture(view) | ViewTarget::TexelBuffer(view) => view.as_raw(),
                ViewTarget::Buffer { range, .. } => range.buffer.as_raw(),
            },
            NativeView::ColorAttachment(view) | NativeView::DepthStencil { view, .. } => {
                view.as_raw()
            }
            NativeView::Sampler(sampler) => sampler.as_raw(),
            NativeView::ConstantBuffer(range) => range.buffer.as_raw(),
            NativeView::AccelerationStructure(raw) => raw.as_raw(),
        }
    }

    /// The payload written into descriptor sets.
    pub fn shader_descriptor(&self) -> Result<(DescriptorType, NativeDescriptor)> {
        let ty = self
            .descriptor_type()
            .ok_or_else(|| Error::invalid("attachment views are not shader visible"))?;
        let native = match self.view {
            NativeView::ShaderResource(target) | NativeView::Storage(target) => match target {
                ViewTarget::Texture(view) => NativeDescriptor::Texture(view),
                ViewTarget::TexelBuffer(view) => NativeDescriptor::TexelBuffer(view),
                ViewTarget::Buffer { range, layout } => NativeDescriptor::Buffer {
                    buffer: range.buffer,
                    offset: range.offset,
                    size: range.size,
                    layout,
                },
            },
            NativeView::ConstantBuffer(range) => NativeDescriptor::Buffer {
                buffer: range.buffer,
                offset: range.offset,
                size: range.size,
                layout: BufferLayout::Constant,
            },
            NativeView::Sampler(sampler) => NativeDescriptor::Sampler(sampler),
            NativeView::AccelerationStructure(raw) => NativeDescriptor::AccelerationStructure(raw),
            NativeView::ColorAttachment(_) | NativeView::DepthStencil { .. } => {
                return Err(Error::invalid("attachment views are not shader visible"))
            }
        };
        Ok((ty, native))
    }

    /// Whether the viewed resource still exists. Always true for samplers.
    pub fn is_resource_alive(&self) -> bool {
        self.liveness
            .as_ref()
            .map_or(true, |token| token.strong_count() > 0)
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        match self.view {
            NativeView::ShaderResource(ViewTarget::Texture(view))
            | NativeView::ShaderResource(ViewTarget::TexelBuffer(view))
            | NativeView::Storage(ViewTarget::Texture(view))
            | NativeView::Storage(ViewTarget::TexelBuffer(view))
            | NativeView::ColorAttachment(view)
            | NativeView::DepthStencil { view, .. } => self.driver.destroy_view(view),
            NativeView::Sampler(sampler) => self.driver.destroy_sampler(sampler),
            NativeView::ShaderResource(ViewTarget::Buffer { .. })
            | NativeView::Storage(ViewTarget::Buffer { .. })
            | NativeView::ConstantBuffer(_)
            | NativeView::AccelerationStructure(_) => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn heaps() {
        for ty in DescriptorType::ALL {
            let expected = if ty == DescriptorType::Sampler {
                HeapType::Sampler
            } else {
                HeapType::Resource
            };
            assert_eq!(ty.heap_type(), expected);
        }
    }

    #[test]
    fn counts() {
        let mut counts = DescriptorCounts::default();
        *counts.entry(DescriptorType::Texture, false) += 3;
        *counts.entry(DescriptorType::Texture, true) += 2;
        *counts.entry(DescriptorType::Sampler, false) += 1;
        assert_eq!(counts.texture, 3);
        assert_eq!(counts.mutable, 2);
        assert_eq!(counts.to_array(), [1, 0, 3, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(counts.total(), 6);
    }

    #[test]
    fn depth_stencil_modes_are_one_to_one() {
        let modes = [
            TextureViewType::DepthStencilAttachment,
            TextureViewType::DepthReadonlyStencilAttachment,
            TextureViewType::DepthAttachmentStencilReadonly,
            TextureViewType::DepthStencilReadonly,
        ]
        .map(|ty| ty.depth_stencil_read_only().unwrap());
        assert_eq!(
            modes,
            [
                DepthStencilReadOnly::None,
                DepthStencilReadOnly::Depth,
                DepthStencilReadOnly::Stencil,
                DepthStencilReadOnly::Both
            ]
        );
        assert_eq!(TextureViewType::ColorAttachment.depth_stencil_read_only(), None);
    }
}
