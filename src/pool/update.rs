//! Writing descriptors into sets and copying between them.

use super::DescriptorSet;
use crate::descriptor::Descriptor;
use crate::driver::{BindingKind, DescriptorCopy, DescriptorSlot, DescriptorWrite};
use crate::error::{ensure, Error, Result};
use crate::layout::RangeMapping;

impl DescriptorSet {
    /// Native location of descriptor `index` of range `range_index`.
    pub fn slot(&self, range_index: u32, index: u32) -> Result<DescriptorSlot> {
        let num = self.range_descriptor_num(range_index)?;
        ensure!(
            index < num,
            "descriptor {index} is out of bounds in range {range_index} of {num}"
        );
        Ok(self.slot_unchecked(self.range(range_index)?, index))
    }

    fn slot_unchecked(&self, range: &RangeMapping, index: u32) -> DescriptorSlot {
        let (binding, array_element) = range.native_slot(index);
        DescriptorSlot {
            binding,
            array_element,
            heap: range.heap_type,
            heap_offset: self.heap_offsets.get(range.heap_type) + range.heap_offset + index,
        }
    }

    fn check_span(&self, range_index: u32, base: u32, count: u32) -> Result<()> {
        let num = self.range_descriptor_num(range_index)?;
        let end = base
            .checked_add(count)
            .ok_or_else(|| Error::invalid(format!("{base}+{count} overflows")))?;
        ensure!(
            end <= num,
            "descriptors {base}..{end} are out of bounds in range {range_index} of {num}"
        );
        Ok(())
    }

    /// Writes `descriptors` to consecutive slots of range `range_index`, starting at `base`.
    ///
    /// Every descriptor is checked before anything is written.
    pub fn write(&mut self, range_index: u32, base: u32, descriptors: &[&Descriptor]) -> Result<()> {
        self.ensure_valid()?;
        self.check_span(range_index, base, descriptors.len() as u32)?;
        let range = self.range(range_index)?;

        let mut writes = Vec::with_capacity(descriptors.len());
        for (index, descriptor) in (base..).zip(descriptors) {
            let (descriptor_type, native) = descriptor.shader_descriptor()?;
            ensure!(
                range.accepts(descriptor_type),
                "{descriptor_type:?} can't be written to range {range_index} of {:?}",
                range.kind
            );
            debug_assert!(
                descriptor.is_resource_alive(),
                "descriptor written after its resource was destroyed"
            );
            writes.push(DescriptorWrite {
                set: self.raw,
                slot: self.slot_unchecked(range, index),
                descriptor_type,
                descriptor: native,
            });
        }

        log::trace!(
            "writing {} descriptors to range {range_index} of {:?} at {base}",
            writes.len(),
            self.raw
        );
        self.pool.driver.write_descriptors(&writes);
        Ok(())
    }

    /// Copies `count` descriptors from range `src_range` of `src` into range `dst_range` of this
    /// set. A `count` of zero copies the source range's whole length.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_from(
        &mut self,
        dst_range: u32,
        dst_base: u32,
        src: &DescriptorSet,
        src_range: u32,
        src_base: u32,
        count: u32,
    ) -> Result<()> {
        self.ensure_valid()?;
        src.ensure_valid()?;
        let count = if count == 0 {
            src.range_descriptor_num(src_range)?
        } else {
            count
        };
        src.check_span(src_range, src_base, count)?;
        self.check_span(dst_range, dst_base, count)?;

        let (src_mapping, dst_mapping) = (src.range(src_range)?, self.range(dst_range)?);
        let compatible = match (&src_mapping.kind, &dst_mapping.kind) {
            (BindingKind::Single(ty), _) => dst_mapping.accepts(*ty),
            (BindingKind::Mutable(src_types), BindingKind::Mutable(dst_types)) => {
                src_types.iter().all(|ty| dst_types.contains(ty))
            }
            (BindingKind::Mutable(_), BindingKind::Single(_)) => false,
        };
        ensure!(
            compatible,
            "can't copy {:?} descriptors into {:?}",
            src_mapping.kind,
            dst_mapping.kind
        );

        let copies = (0..count)
            .map(|i| DescriptorCopy {
                src_set: src.raw,
                src_slot: src.slot_unchecked(src_mapping, src_base + i),
                dst_set: self.raw,
                dst_slot: self.slot_unchecked(dst_mapping, dst_base + i),
            })
            .collect::<Vec<_>>();
        log::trace!(
            "copying {count} descriptors from {:?} to {:?}",
            src.raw,
            self.raw
        );
        self.pool.driver.copy_descriptors(&copies);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crate::config::DeviceConfig;
    use crate::descriptor::{
        BufferViewDesc, BufferViewType, DescriptorCounts, DescriptorType, HeapType,
        TextureViewDesc, TextureViewType,
    };
    use crate::device::Device;
    use crate::driver::soft::SoftDriver;
    use crate::driver::NativeDescriptor;
    use crate::error::Error;
    use crate::format::Format;
    use crate::layout::{
        BindingLayout, DescriptorRangeDesc, DescriptorRangeFlags, DescriptorSetDesc,
        PipelineLayoutDesc, ShaderStages,
    };
    use crate::pool::{DescriptorPool, DescriptorPoolDesc};
    use crate::memory::MemoryLocation;
    use crate::resource::{Buffer, BufferDesc, BufferUsage, Texture, TextureDesc, TextureUsage, WHOLE_SIZE};

    fn device() -> (Arc<SoftDriver>, Device) {
        let _ = env_logger::builder().is_test(true).try_init();
        let soft = Arc::new(SoftDriver::new());
        let device = Device::new(soft.clone(), DeviceConfig::default()).unwrap();
        (soft, device)
    }

    fn range(ty: DescriptorType, register: u32, num: u32, flags: DescriptorRangeFlags) -> DescriptorRangeDesc {
        DescriptorRangeDesc {
            base_register_index: register,
            descriptor_num: num,
            descriptor_type: ty,
            shader_stages: ShaderStages::ALL_GRAPHICS,
            flags,
        }
    }

    /// Range 0: four textures as one array. Range 1: two separate textures.
    /// Range 2: eight textures. Range 3: four mutable buffers.
    fn layout(device: &Device) -> BindingLayout {
        device
            .create_binding_layout(&PipelineLayoutDesc {
                descriptor_sets: vec![DescriptorSetDesc {
                    register_space: 0,
                    ranges: vec![
                        range(DescriptorType::Texture, 0, 4, DescriptorRangeFlags::ARRAY),
                        range(DescriptorType::Texture, 4, 2, DescriptorRangeFlags::empty()),
                        range(DescriptorType::Texture, 8, 8, DescriptorRangeFlags::ARRAY),
                        range(DescriptorType::Buffer, 0, 4, DescriptorRangeFlags::MUTABLE),
                    ],
                    ..Default::default()
                }],
                ..Default::default()
            })
            .unwrap()
    }

    fn pool(device: &Device) -> DescriptorPool {
        device
            .create_descriptor_pool(&DescriptorPoolDesc {
                descriptor_set_max_num: 4,
                capacity: DescriptorCounts {
                    texture: 56,
                    mutable: 16,
                    ..Default::default()
                },
                update_after_bind: false,
            })
            .unwrap()
    }

    fn bound_texture(device: &Device, usage: TextureUsage) -> Texture {
        let mut texture = device
            .create_texture(&TextureDesc {
                format: Format::Rgba8Unorm,
                width: 16,
                height: 16,
                usage,
                ..Default::default()
            })
            .unwrap();
        device
            .allocate_and_bind(&mut texture, MemoryLocation::Device, 0.5, false)
            .unwrap();
        texture
    }

    fn texture(device: &Device) -> Texture {
        bound_texture(
            device,
            TextureUsage::SHADER_RESOURCE | TextureUsage::SHADER_RESOURCE_STORAGE,
        )
    }

    fn buffer(device: &Device) -> Buffer {
        let mut buffer = device
            .create_buffer(&BufferDesc {
                size: 1024,
                structure_stride: 16,
                usage: BufferUsage::SHADER_RESOURCE,
            })
            .unwrap();
        device
            .allocate_and_bind(&mut buffer, MemoryLocation::Device, 0.5, false)
            .unwrap();
        buffer
    }

    #[test]
    fn writes_land_in_their_slots() {
        let (soft, device) = device();
        let layout = layout(&device);
        let pool = pool(&device);
        let mut sets = pool.allocate(&layout, 0, 2).unwrap();
        let texture = texture(&device);
        let view = device
            .create_texture_view(&texture, &TextureViewDesc::whole(TextureViewType::ShaderResource))
            .unwrap();

        sets[1].write(0, 1, &[&view, &view]).unwrap();
        let offset = DeviceConfig::default().binding_offsets.texture;
        let slot = sets[1].slot(0, 2).unwrap();
        assert_eq!((slot.binding, slot.array_element), (offset, 2));
        assert_eq!(slot.heap, HeapType::Resource);
        assert_eq!(slot.heap_offset, 18 + 2);
        assert!(matches!(
            soft.read_slot(sets[1].raw(), &slot),
            Some(NativeDescriptor::Texture(_))
        ));
        assert!(soft.read_slot(sets[1].raw(), &sets[1].slot(0, 0).unwrap()).is_none());
        assert!(soft.read_slot(sets[0].raw(), &sets[0].slot(0, 2).unwrap()).is_none());

        // Separate bindings per descriptor outside arrays.
        sets[1].write(1, 1, &[&view]).unwrap();
        let slot = sets[1].slot(1, 1).unwrap();
        assert_eq!((slot.binding, slot.array_element), (offset + 5, 0));
        assert!(soft.read_slot(sets[1].raw(), &slot).is_some());
    }

    #[test]
    fn rejected_writes_write_nothing() {
        let (soft, device) = device();
        let layout = layout(&device);
        let pool = pool(&device);
        let mut set = pool.allocate(&layout, 0, 1).unwrap().remove(0);
        let texture = texture(&device);
        let view = device
            .create_texture_view(&texture, &TextureViewDesc::whole(TextureViewType::ShaderResource))
            .unwrap();
        let storage = device
            .create_texture_view(
                &texture,
                &TextureViewDesc::whole(TextureViewType::ShaderResourceStorage),
            )
            .unwrap();

        assert!(matches!(
            set.write(0, 3, &[&view, &view]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            set.write(0, 0, &[&view, &storage]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            set.write(7, 0, &[&view]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(soft.read_slot(set.raw(), &set.slot(0, 0).unwrap()).is_none());
        assert!(soft.read_slot(set.raw(), &set.slot(0, 3).unwrap()).is_none());
    }

    #[test]
    fn mutable_ranges_take_several_kinds() {
        let (soft, device) = device();
        let layout = layout(&device);
        let pool = pool(&device);
        let mut set = pool.allocate(&layout, 0, 1).unwrap().remove(0);
        let texture = texture(&device);
        let view = device
            .create_texture_view(&texture, &TextureViewDesc::whole(TextureViewType::ShaderResource))
            .unwrap();
        let buffer = buffer(&device);
        let structured = device
            .create_buffer_view(
                &buffer,
                &BufferViewDesc {
                    view_type: BufferViewType::ShaderResource,
                    format: Format::Unknown,
                    offset: 0,
                    size: WHOLE_SIZE,
                    structure_stride: 0,
                },
            )
            .unwrap();
        set.write(3, 0, &[&view, &structured]).unwrap();
        assert!(matches!(
            soft.read_slot(set.raw(), &set.slot(3, 1).unwrap()),
            Some(NativeDescriptor::Buffer { .. })
        ));
    }

    #[test]
    fn copies() {
        let (soft, device) = device();
        let layout = layout(&device);
        let pool = pool(&device);
        let mut sets = pool.allocate(&layout, 0, 2).unwrap();
        let texture = texture(&device);
        let view = device
            .create_texture_view(&texture, &TextureViewDesc::whole(TextureViewType::ShaderResource))
            .unwrap();
        sets[0].write(0, 0, &[&view; 4]).unwrap();
        let (src, dst) = match &mut sets[..] {
            [src, dst] => (src, dst),
            _ => unreachable!(),
        };

        // Zero copies the whole source range.
        dst.copy_from(2, 0, src, 0, 0, 0).unwrap();
        for i in 0..4 {
            assert!(soft.read_slot(dst.raw(), &dst.slot(2, i).unwrap()).is_some());
        }
        assert!(soft.read_slot(dst.raw(), &dst.slot(2, 4).unwrap()).is_none());

        dst.copy_from(2, 6, src, 0, 1, 2).unwrap();
        assert!(soft.read_slot(dst.raw(), &dst.slot(2, 5).unwrap()).is_none());
        assert!(soft.read_slot(dst.raw(), &dst.slot(2, 6).unwrap()).is_some());
        assert!(soft.read_slot(dst.raw(), &dst.slot(2, 7).unwrap()).is_some());

        // Textures fit mutable ranges, not the other way around.
        dst.copy_from(3, 0, src, 0, 0, 4).unwrap();
        assert!(matches!(
            dst.copy_from(0, 0, src, 3, 0, 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            dst.copy_from(2, 7, src, 0, 0, 2),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            dst.copy_from(2, 0, src, 0, 3, 2),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn stale_sets_are_rejected() {
        let (_soft, device) = device();
        let layout = layout(&device);
        let pool = pool(&device);
        let mut stale = pool.allocate(&layout, 0, 1).unwrap().remove(0);
        let texture = texture(&device);
        let view = device
            .create_texture_view(&texture, &TextureViewDesc::whole(TextureViewType::ShaderResource))
            .unwrap();
        pool.reset().unwrap();
        assert!(matches!(
            stale.write(0, 0, &[&view]),
            Err(Error::InvalidArgument(_))
        ));
        let fresh = pool.allocate(&layout, 0, 1).unwrap().remove(0);
        assert!(matches!(
            stale.copy_from(0, 0, &fresh, 0, 0, 1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn attachments_are_not_shader_visible() {
        let (_soft, device) = device();
        let layout = layout(&device);
        let pool = pool(&device);
        let mut set = pool.allocate(&layout, 0, 1).unwrap().remove(0);
        let texture = bound_texture(
            &device,
            TextureUsage::SHADER_RESOURCE | TextureUsage::COLOR_ATTACHMENT,
        );
        let attachment = device
            .create_texture_view(&texture, &TextureViewDesc::whole(TextureViewType::ColorAttachment))
            .unwrap();
        assert!(matches!(
            set.write(0, 0, &[&attachment]),
            Err(Error::InvalidArgument(_))
        ));
    }
}
