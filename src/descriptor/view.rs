use crate::device::Device;
use crate::driver::{BufferLayout, BufferViewInfo, TextureViewInfo, ViewUsage};
use crate::error::{ensure, Error, Result};
use crate::format::Format;
use crate::resource::{
    AccelerationStructure, Buffer, BufferUsage, Texture, TextureDesc, TextureKind, TextureUsage,
    WHOLE_SIZE,
};
use crate::util::resolve_count;

use super::{
    BufferRange, BufferViewDesc, BufferViewType, Descriptor, NativeView, SamplerDesc,
    TextureViewDesc, TextureViewType, ViewDimension, ViewTarget, REMAINING,
};

/// A resolved mip and layer range. Layers are depth slices for 3D textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subresource {
    pub mip_offset: u32,
    pub mip_num: u32,
    pub layer_offset: u32,
    pub layer_num: u32,
}

impl Subresource {
    /// Resolves [`REMAINING`] counts in `desc` against `texture`. Fails if the range leaves
    /// the texture.
    pub fn resolve(texture: &TextureDesc, desc: &TextureViewDesc) -> Result<Self> {
        let mip_num = resolve_count(texture.mip_num, desc.mip_offset, desc.mip_num, REMAINING)
            .ok_or_else(|| {
                Error::invalid(format!(
                    "mips {}+{} are outside the texture's {}",
                    desc.mip_offset, desc.mip_num, texture.mip_num
                ))
            })?;
        let layer_total = texture.view_layer_num();
        let layer_num = resolve_count(layer_total, desc.layer_offset, desc.layer_num, REMAINING)
            .ok_or_else(|| {
                Error::invalid(format!(
                    "layers {}+{} are outside the texture's {layer_total}",
                    desc.layer_offset, desc.layer_num
                ))
            })?;
        Ok(Self {
            mip_offset: desc.mip_offset,
            mip_num,
            layer_offset: desc.layer_offset,
            layer_num,
        })
    }
}

fn view_usage(view_type: TextureViewType) -> ViewUsage {
    match view_type {
        TextureViewType::ShaderResource
        | TextureViewType::ShaderResourceArray
        | TextureViewType::ShaderResourceCube
        | TextureViewType::ShaderResourceCubeArray => ViewUsage::ShaderResource,
        TextureViewType::ShaderResourceStorage | TextureViewType::ShaderResourceStorageArray => {
            ViewUsage::Storage
        }
        TextureViewType::ColorAttachment => ViewUsage::ColorAttachment,
        TextureViewType::DepthStencilAttachment
        | TextureViewType::DepthReadonlyStencilAttachment
        | TextureViewType::DepthAttachmentStencilReadonly
        | TextureViewType::DepthStencilReadonly => ViewUsage::DepthStencil(
            view_type
                .depth_stencil_read_only()
                .unwrap_or(super::DepthStencilReadOnly::None),
        ),
    }
}

fn required_usage(usage: ViewUsage) -> TextureUsage {
    match usage {
        ViewUsage::ShaderResource => TextureUsage::SHADER_RESOURCE,
        ViewUsage::Storage => TextureUsage::SHADER_RESOURCE_STORAGE,
        ViewUsage::ColorAttachment => TextureUsage::COLOR_ATTACHMENT,
        ViewUsage::DepthStencil(_) => TextureUsage::DEPTH_STENCIL_ATTACHMENT,
    }
}

/// Picks the native dimensionality of a view.
///
/// Multisampled 2D textures always get [`ViewDimension::D2MsArray`], even for a single layer.
/// Attachments are always arrays so that one view type covers any layer count.
fn select_dimension(
    texture: &TextureDesc,
    view_type: TextureViewType,
    layer_num: u32,
) -> Result<ViewDimension> {
    use TextureViewType as T;
    use ViewDimension as D;

    let multisampled = texture.sample_num > 1;
    let single_layer = |dimension: ViewDimension| {
        ensure!(
            layer_num == 1,
            "{view_type:?} views one layer, {layer_num} requested; use an array view type"
        );
        Ok(dimension)
    };

    match (texture.kind, view_type) {
        (TextureKind::D1, T::ShaderResource | T::ShaderResourceStorage) => single_layer(D::D1),
        (TextureKind::D1, T::ShaderResourceArray | T::ShaderResourceStorageArray) => {
            Ok(D::D1Array)
        }
        (
            TextureKind::D1,
            T::ColorAttachment
            | T::DepthStencilAttachment
            | T::DepthReadonlyStencilAttachment
            | T::DepthAttachmentStencilReadonly
            | T::DepthStencilReadonly,
        ) => Ok(D::D1Array),

        (TextureKind::D2, T::ShaderResourceStorage | T::ShaderResourceStorageArray)
            if multisampled =>
        {
            Err(Error::invalid("multisampled textures can't have storage views"))
        }
        (TextureKind::D2, T::ShaderResource | T::ShaderResourceArray) if multisampled => {
            Ok(D::D2MsArray)
        }
        (TextureKind::D2, T::ShaderResource | T::ShaderResourceStorage) => single_layer(D::D2),
        (TextureKind::D2, T::ShaderResourceArray | T::ShaderResourceStorageArray) => {
            Ok(D::D2Array)
        }
        (TextureKind::D2, T::ShaderResourceCube | T::ShaderResourceCubeArray) if multisampled => {
            Err(Error::invalid("multisampled textures can't have cube views"))
        }
        (TextureKind::D2, T::ShaderResourceCube) => {
            ensure!(layer_num == 6, "cube views need 6 layers, {layer_num} requested");
            Ok(D::Cube)
        }
        (TextureKind::D2, T::ShaderResourceCubeArray) => {
            ensure!(
                layer_num % 6 == 0,
                "cube array views need a multiple of 6 layers, {layer_num} requested"
            );
            Ok(D::CubeArray)
        }
        (TextureKind::D2, _) if multisampled => Ok(D::D2MsArray),
        (TextureKind::D2, _) => Ok(D::D2Array),

        (TextureKind::D3, T::ShaderResource | T::ShaderResourceStorage | T::ColorAttachment) => {
            Ok(D::D3)
        }

        (kind, view_type) => Err(Error::invalid(format!(
            "{view_type:?} views are not supported on {kind:?} textures"
        ))),
    }
}

impl Device {
    /// Creates a view of a bound (or wrapped) texture.
    pub fn create_texture_view(
        &self,
        texture: &Texture,
        desc: &TextureViewDesc,
    ) -> Result<Descriptor> {
        ensure!(texture.state().is_viewable(), "texture is not bound to memory");
        let texture_desc = texture.desc();
        let subresource = Subresource::resolve(texture_desc, desc)?;
        let usage = view_usage(desc.view_type);
        ensure!(
            texture_desc.usage.contains(required_usage(usage)),
            "{:?} views need {:?} usage",
            desc.view_type,
            required_usage(usage)
        );

        let format = match desc.format {
            Format::Unknown => texture_desc.format,
            format => format,
        };
        if let ViewUsage::ColorAttachment | ViewUsage::DepthStencil(_) = usage {
            ensure!(
                subresource.mip_num == 1,
                "attachment views cover one mip, {} requested",
                subresource.mip_num
            );
        }
        if let ViewUsage::DepthStencil(_) = usage {
            ensure!(
                format.has_depth() || format.has_stencil(),
                "{format:?} has no depth or stencil aspect"
            );
        }
        let dimension = select_dimension(texture_desc, desc.view_type, subresource.layer_num)?;

        let raw = self.driver().create_texture_view(&TextureViewInfo {
            texture: texture.raw(),
            dimension,
            format,
            mip_offset: subresource.mip_offset,
            mip_num: subresource.mip_num,
            layer_offset: subresource.layer_offset,
            layer_num: subresource.layer_num,
            usage,
        })?;
        let view = match usage {
            ViewUsage::ShaderResource => NativeView::ShaderResource(ViewTarget::Texture(raw)),
            ViewUsage::Storage => NativeView::Storage(ViewTarget::Texture(raw)),
            ViewUsage::ColorAttachment => NativeView::ColorAttachment(raw),
            ViewUsage::DepthStencil(read_only) => NativeView::DepthStencil {
                view: raw,
                read_only,
            },
        };

        Ok(Descriptor {
            driver: self.driver().clone(),
            view,
            format,
            subresource: Some(subresource),
            dimension: Some(dimension),
            liveness: Some(texture.liveness()),
        })
    }

    /// Creates a constant, typed, structured or raw view of a bound (or wrapped) buffer.
    ///
    /// With [`Format::Unknown`], a view whose structure stride comes out as 4 (from the buffer,
    /// or from the view when the buffer's isn't 4) is a raw (byte address) view.
    pub fn create_buffer_view(&self, buffer: &Buffer, desc: &BufferViewDesc) -> Result<Descriptor> {
        ensure!(buffer.state().is_viewable(), "buffer is not bound to memory");
        let buffer_desc = buffer.desc();
        ensure!(
            desc.offset < buffer_desc.size,
            "view offset {} is past the {}B buffer",
            desc.offset,
            buffer_desc.size
        );
        let size = if desc.size == WHOLE_SIZE {
            buffer_desc.size - desc.offset
        } else {
            desc.size
        };
        ensure!(
            size != 0 && size <= buffer_desc.size - desc.offset,
            "view range {}+{size} is outside the {}B buffer",
            desc.offset,
            buffer_desc.size
        );
        let range = BufferRange {
            buffer: buffer.raw(),
            offset: desc.offset,
            size,
        };

        let view = match desc.view_type {
            BufferViewType::Constant => {
                ensure!(
                    buffer_desc.usage.contains(BufferUsage::CONSTANT_BUFFER),
                    "constant views need CONSTANT_BUFFER usage"
                );
                let alignment = self.limits().constant_buffer_offset_alignment.max(1);
                ensure!(
                    desc.offset % alignment == 0,
                    "constant view offset {} is not aligned to {alignment}",
                    desc.offset
                );
                NativeView::ConstantBuffer(range)
            }
            BufferViewType::ShaderResource | BufferViewType::ShaderResourceStorage => {
                let storage = desc.view_type == BufferViewType::ShaderResourceStorage;
                let usage = if storage {
                    BufferUsage::SHADER_RESOURCE_STORAGE
                } else {
                    BufferUsage::SHADER_RESOURCE
                };
                ensure!(
                    buffer_desc.usage.contains(usage),
                    "{:?} views need {usage:?} usage",
                    desc.view_type
                );
                let target = self.buffer_view_target(buffer, desc, range, storage)?;
                if storage {
                    NativeView::Storage(target)
                } else {
                    NativeView::ShaderResource(target)
                }
            }
        };

        Ok(Descriptor {
            driver: self.driver().clone(),
            view,
            format: desc.format,
            subresource: None,
            dimension: None,
            liveness: Some(buffer.liveness()),
        })
    }

    fn buffer_view_target(
        &self,
        buffer: &Buffer,
        desc: &BufferViewDesc,
        range: BufferRange,
        storage: bool,
    ) -> Result<ViewTarget> {
        if desc.format != Format::Unknown {
            let stride = desc.format.stride() as u64;
            ensure!(
                range.offset % stride == 0,
                "typed view offset {} is not a multiple of the {stride}B texel",
                range.offset
            );
            let raw = self.driver().create_buffer_view(&BufferViewInfo {
                buffer: range.buffer,
                format: desc.format,
                offset: range.offset,
                size: range.size,
                storage,
            })?;
            return Ok(ViewTarget::TexelBuffer(raw));
        }

        let stride = match (buffer.desc().structure_stride, desc.structure_stride) {
            (4, _) => 4,
            (stride, 0) => stride,
            (_, stride) => stride,
        };
        ensure!(
            stride != 0,
            "structured views need a structure stride or a format"
        );
        let layout = if stride == 4 {
            BufferLayout::Raw
        } else {
            BufferLayout::Structured { stride }
        };
        let stride = match layout {
            BufferLayout::Structured { stride } => stride as u64,
            _ => 4,
        };
        ensure!(
            range.offset % stride == 0,
            "view offset {} is not a multiple of the {stride}B element",
            range.offset
        );
        if storage {
            let alignment = self.limits().storage_buffer_offset_alignment.max(1);
            ensure!(
                range.offset % alignment == 0,
                "storage view offset {} is not aligned to {alignment}",
                range.offset
            );
        }
        Ok(ViewTarget::Buffer { range, layout })
    }

    pub fn create_sampler(&self, desc: &SamplerDesc) -> Result<Descriptor> {
        ensure!(
            desc.mip_min <= desc.mip_max,
            "sampler mip range {}..{} is empty",
            desc.mip_min,
            desc.mip_max
        );
        ensure!(desc.mip_bias.is_finite(), "sampler mip bias must be finite");

        let max_anisotropy = self.limits().max_sampler_anisotropy;
        let mut desc = *desc;
        if desc.anisotropy > max_anisotropy {
            log::warn!(
                "sampler anisotropy {} clamped to {max_anisotropy}",
                desc.anisotropy
            );
            desc.anisotropy = max_anisotropy;
        }

        let raw = self.driver().create_sampler(&desc)?;
        Ok(Descriptor {
            driver: self.driver().clone(),
            view: NativeView::Sampler(raw),
            format: Format::Unknown,
            subresource: None,
            dimension: None,
            liveness: None,
        })
    }

    /// Shader view of an acceleration structure. The structure must be bound first.
    pub fn create_acceleration_structure_view(
        &self,
        acceleration_structure: &AccelerationStructure,
    ) -> Result<Descriptor> {
        let raw = acceleration_structure
            .raw()
            .ok_or_else(|| Error::invalid("acceleration structure is not bound to memory"))?;
        Ok(Descriptor {
            driver: self.driver().clone(),
            view: NativeView::AccelerationStructure(raw),
            format: Format::Unknown,
            subresource: None,
            dimension: None,
            liveness: Some(acceleration_structure.liveness()),
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::config::DeviceConfig;
    use crate::descriptor::{DepthStencilReadOnly, DescriptorType};
    use crate::driver::soft::SoftDriver;
    use crate::driver::NativeDescriptor;
    use crate::memory::MemoryLocation;
    use crate::resource::{AccelerationStructureDesc, AccelerationStructureKind, BufferDesc};

    fn device() -> (Arc<SoftDriver>, Device) {
        let _ = env_logger::builder().is_test(true).try_init();
        let soft = Arc::new(SoftDriver::new());
        let device = Device::new(soft.clone(), DeviceConfig::default()).unwrap();
        (soft, device)
    }

    fn bound_texture(device: &Device, desc: TextureDesc) -> Texture {
        let mut texture = device.create_texture(&desc).unwrap();
        device
            .allocate_and_bind(&mut texture, MemoryLocation::Device, 0.5, false)
            .unwrap();
        texture
    }

    fn sampled(width: u32, mip_num: u32, layer_num: u32) -> TextureDesc {
        TextureDesc {
            format: Format::Rgba8Unorm,
            width,
            height: width,
            mip_num,
            layer_num,
            usage: TextureUsage::SHADER_RESOURCE | TextureUsage::SHADER_RESOURCE_STORAGE,
            ..Default::default()
        }
    }

    fn bound_buffer(device: &Device, size: u64, structure_stride: u32) -> Buffer {
        let mut buffer = device
            .create_buffer(&BufferDesc {
                size,
                structure_stride,
                usage: BufferUsage::SHADER_RESOURCE
                    | BufferUsage::SHADER_RESOURCE_STORAGE
                    | BufferUsage::CONSTANT_BUFFER,
            })
            .unwrap();
        device
            .allocate_and_bind(&mut buffer, MemoryLocation::Device, 0.5, false)
            .unwrap();
        buffer
    }

    fn buffer_view(format: Format, structure_stride: u32) -> BufferViewDesc {
        BufferViewDesc {
            view_type: BufferViewType::ShaderResource,
            format,
            offset: 0,
            size: WHOLE_SIZE,
            structure_stride,
        }
    }

    #[test]
    fn remaining_counts() {
        let (_soft, device) = device();
        let texture = bound_texture(&device, sampled(1024, 10, 1));

        let view = device
            .create_texture_view(
                &texture,
                &TextureViewDesc {
                    mip_offset: 3,
                    ..TextureViewDesc::whole(TextureViewType::ShaderResource)
                },
            )
            .unwrap();
        assert_eq!(view.subresource().unwrap().mip_num, 7);
        assert_eq!(view.subresource().unwrap().layer_num, 1);

        let view = device
            .create_texture_view(
                &texture,
                &TextureViewDesc {
                    mip_offset: 3,
                    mip_num: 4,
                    ..TextureViewDesc::whole(TextureViewType::ShaderResource)
                },
            )
            .unwrap();
        assert_eq!(view.subresource().unwrap().mip_num, 4);
    }

    #[test]
    fn out_of_range_subresources() {
        let (_soft, device) = device();
        let texture = bound_texture(&device, sampled(256, 4, 2));
        let whole = TextureViewDesc::whole(TextureViewType::ShaderResourceArray);

        for desc in [
            TextureViewDesc { mip_offset: 4, ..whole },
            TextureViewDesc { mip_offset: 2, mip_num: 3, ..whole },
            TextureViewDesc { layer_offset: 2, ..whole },
            TextureViewDesc { layer_offset: 1, layer_num: 2, ..whole },
            TextureViewDesc { mip_num: 0, ..whole },
        ] {
            assert!(matches!(
                device.create_texture_view(&texture, &desc),
                Err(Error::InvalidArgument(_))
            ));
        }
        assert!(device
            .create_texture_view(&texture, &TextureViewDesc { mip_offset: 3, layer_offset: 1, ..whole })
            .is_ok());
    }

    #[test]
    fn unbound_resources_have_no_views() {
        let (_soft, device) = device();
        let texture = device.create_texture(&sampled(64, 1, 1)).unwrap();
        assert!(matches!(
            device.create_texture_view(&texture, &TextureViewDesc::whole(TextureViewType::ShaderResource)),
            Err(Error::InvalidArgument(_))
        ));
        let buffer = device
            .create_buffer(&BufferDesc {
                size: 64,
                structure_stride: 16,
                usage: BufferUsage::SHADER_RESOURCE,
            })
            .unwrap();
        assert!(matches!(
            device.create_buffer_view(&buffer, &buffer_view(Format::Unknown, 0)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn multisampled_views_are_arrays() {
        let (_soft, device) = device();
        let texture = bound_texture(
            &device,
            TextureDesc {
                sample_num: 4,
                usage: TextureUsage::SHADER_RESOURCE | TextureUsage::COLOR_ATTACHMENT,
                ..sampled(128, 1, 1)
            },
        );
        let view = device
            .create_texture_view(&texture, &TextureViewDesc::whole(TextureViewType::ShaderResource))
            .unwrap();
        assert_eq!(view.dimension(), Some(ViewDimension::D2MsArray));
        let view = device
            .create_texture_view(&texture, &TextureViewDesc::whole(TextureViewType::ColorAttachment))
            .unwrap();
        assert_eq!(view.dimension(), Some(ViewDimension::D2MsArray));
        assert!(matches!(
            device.create_texture_view(&texture, &TextureViewDesc::whole(TextureViewType::ShaderResourceCube)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn dimensions() {
        let (_soft, device) = device();
        let array = bound_texture(&device, sampled(64, 1, 12));
        let view = |texture: &Texture, view_type, layer_num| {
            device
                .create_texture_view(
                    texture,
                    &TextureViewDesc {
                        layer_num,
                        ..TextureViewDesc::whole(view_type)
                    },
                )
                .map(|view| view.dimension().unwrap())
        };

        assert_eq!(view(&array, TextureViewType::ShaderResource, 1).unwrap(), ViewDimension::D2);
        assert!(view(&array, TextureViewType::ShaderResource, 2).is_err());
        assert_eq!(
            view(&array, TextureViewType::ShaderResourceArray, 1).unwrap(),
            ViewDimension::D2Array
        );
        assert_eq!(view(&array, TextureViewType::ShaderResourceCube, 6).unwrap(), ViewDimension::Cube);
        assert!(view(&array, TextureViewType::ShaderResourceCube, 4).is_err());
        assert_eq!(
            view(&array, TextureViewType::ShaderResourceCubeArray, REMAINING).unwrap(),
            ViewDimension::CubeArray
        );

        let volume = bound_texture(
            &device,
            TextureDesc {
                kind: TextureKind::D3,
                depth: 16,
                ..sampled(16, 1, 1)
            },
        );
        assert_eq!(
            view(&volume, TextureViewType::ShaderResourceStorage, REMAINING).unwrap(),
            ViewDimension::D3
        );
        assert!(matches!(
            view(&volume, TextureViewType::ShaderResourceArray, REMAINING),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn depth_stencil_views() {
        let (_soft, device) = device();
        let texture = bound_texture(
            &device,
            TextureDesc {
                format: Format::D24UnormS8Uint,
                width: 64,
                height: 64,
                usage: TextureUsage::DEPTH_STENCIL_ATTACHMENT,
                ..Default::default()
            },
        );
        for (view_type, expected) in [
            (TextureViewType::DepthStencilAttachment, DepthStencilReadOnly::None),
            (TextureViewType::DepthReadonlyStencilAttachment, DepthStencilReadOnly::Depth),
            (TextureViewType::DepthAttachmentStencilReadonly, DepthStencilReadOnly::Stencil),
            (TextureViewType::DepthStencilReadonly, DepthStencilReadOnly::Both),
        ] {
            let view = device
                .create_texture_view(&texture, &TextureViewDesc::whole(view_type))
                .unwrap();
            assert!(matches!(
                view.view(),
                NativeView::DepthStencil { read_only, .. } if *read_only == expected
            ));
            assert_eq!(view.descriptor_type(), None);
            assert!(matches!(view.shader_descriptor(), Err(Error::InvalidArgument(_))));
        }
        // No SHADER_RESOURCE usage.
        assert!(matches!(
            device.create_texture_view(&texture, &TextureViewDesc::whole(TextureViewType::ShaderResource)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn stride_four_is_demoted_to_raw() {
        let (_soft, device) = device();
        let raw = bound_buffer(&device, 1024, 4);
        let view = device
            .create_buffer_view(&raw, &buffer_view(Format::Unknown, 0))
            .unwrap();
        assert_eq!(view.descriptor_type(), Some(DescriptorType::StructuredBuffer));
        assert!(matches!(
            view.shader_descriptor().unwrap().1,
            NativeDescriptor::Buffer { layout: BufferLayout::Raw, size: 1024, .. }
        ));

        let structured = bound_buffer(&device, 1024, 16);
        let view = device
            .create_buffer_view(&structured, &buffer_view(Format::Unknown, 0))
            .unwrap();
        assert!(matches!(
            view.shader_descriptor().unwrap().1,
            NativeDescriptor::Buffer { layout: BufferLayout::Structured { stride: 16 }, .. }
        ));
        // A stride of 8 is not relaxed.
        let eight = bound_buffer(&device, 1024, 8);
        let view = device
            .create_buffer_view(&eight, &buffer_view(Format::Unknown, 0))
            .unwrap();
        assert!(matches!(
            view.shader_descriptor().unwrap().1,
            NativeDescriptor::Buffer { layout: BufferLayout::Structured { stride: 8 }, .. }
        ));

        // The view's own stride of 4 demotes too, whatever the buffer declared.
        let view = device
            .create_buffer_view(&structured, &buffer_view(Format::Unknown, 4))
            .unwrap();
        assert!(matches!(
            view.shader_descriptor().unwrap().1,
            NativeDescriptor::Buffer { layout: BufferLayout::Raw, size: 1024, .. }
        ));
        let view = device
            .create_buffer_view(&raw, &buffer_view(Format::Unknown, 16))
            .unwrap();
        assert!(matches!(
            view.shader_descriptor().unwrap().1,
            NativeDescriptor::Buffer { layout: BufferLayout::Raw, .. }
        ));

        let strideless = bound_buffer(&device, 1024, 0);
        assert!(matches!(
            device.create_buffer_view(&strideless, &buffer_view(Format::Unknown, 0)),
            Err(Error::InvalidArgument(_))
        ));
        let typed = device
            .create_buffer_view(&strideless, &buffer_view(Format::R32Float, 0))
            .unwrap();
        assert_eq!(typed.descriptor_type(), Some(DescriptorType::Buffer));
        assert!(matches!(
            typed.shader_descriptor().unwrap().1,
            NativeDescriptor::TexelBuffer(_)
        ));
    }

    #[test]
    fn constant_views_are_aligned() {
        let (_soft, device) = device();
        let buffer = bound_buffer(&device, 4096, 0);
        let alignment = device.limits().constant_buffer_offset_alignment;
        let desc = BufferViewDesc {
            view_type: BufferViewType::Constant,
            offset: alignment,
            size: 256,
            ..buffer_view(Format::Unknown, 0)
        };
        let view = device.create_buffer_view(&buffer, &desc).unwrap();
        assert_eq!(view.descriptor_type(), Some(DescriptorType::ConstantBuffer));
        assert!(matches!(
            device.create_buffer_view(&buffer, &BufferViewDesc { offset: alignment + 4, ..desc }),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            device.create_buffer_view(&buffer, &BufferViewDesc { size: 4096, ..desc }),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn views_are_destroyed_with_the_descriptor() {
        let (soft, device) = device();
        let texture = bound_texture(&device, sampled(64, 1, 1));
        let before = soft.live_view_count();
        let view = device
            .create_texture_view(&texture, &TextureViewDesc::whole(TextureViewType::ShaderResource))
            .unwrap();
        let sampler = device.create_sampler(&SamplerDesc::default()).unwrap();
        assert_eq!(soft.live_view_count(), before + 1);
        assert!(view.is_resource_alive());
        drop(texture);
        assert!(!view.is_resource_alive());
        assert!(sampler.is_resource_alive());
        drop(view);
        assert_eq!(soft.live_view_count(), before);
    }

    #[test]
    fn sampler_validation() {
        let (_soft, device) = device();
        assert!(matches!(
            device.create_sampler(&SamplerDesc {
                mip_min: 4.0,
                mip_max: 1.0,
                ..Default::default()
            }),
            Err(Error::InvalidArgument(_))
        ));
        let sampler = device
            .create_sampler(&SamplerDesc {
                anisotropy: 1000,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(sampler.descriptor_type(), Some(DescriptorType::Sampler));
    }

    #[test]
    fn acceleration_structure_views() {
        let (_soft, device) = device();
        let mut tlas = device
            .create_acceleration_structure(&AccelerationStructureDesc {
                kind: AccelerationStructureKind::TopLevel,
                size: 1024,
            })
            .unwrap();
        assert!(matches!(
            device.create_acceleration_structure_view(&tlas),
            Err(Error::InvalidArgument(_))
        ));
        device
            .allocate_and_bind(&mut tlas, MemoryLocation::Device, 0.5, false)
            .unwrap();
        let view = device.create_acceleration_structure_view(&tlas).unwrap();
        assert_eq!(view.native_handle(), tlas.raw().unwrap().as_raw());
    }
}
