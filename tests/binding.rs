use std::sync::Arc;

use binder::descriptor::{DescriptorCounts, TextureViewDesc, TextureViewType, REMAINING};
use binder::driver::soft::SoftDriver;
use binder::format::Format;
use binder::layout::{DescriptorRangeDesc, DescriptorRangeFlags, DescriptorSetDesc, ShaderStages};
use binder::memory::MemoryLocation;
use binder::resource::{Texture, TextureDesc, TextureUsage};
use binder::{
    BindingLayout, DescriptorPool, DescriptorPoolDesc, DescriptorType, Device, DeviceConfig,
    Error, PipelineLayoutDesc,
};

fn device() -> anyhow::Result<(Arc<SoftDriver>, Device)> {
    let _ = env_logger::builder().is_test(true).try_init();
    let soft = Arc::new(SoftDriver::new());
    let device = Device::new(soft.clone(), DeviceConfig::default())?;
    Ok((soft, device))
}

fn texture(device: &Device, mip_num: u32, layer_num: u32) -> anyhow::Result<Texture> {
    let mut texture = device.create_texture(&TextureDesc {
        format: Format::Rgba8Unorm,
        width: 1024,
        height: 1024,
        mip_num,
        layer_num,
        usage: TextureUsage::SHADER_RESOURCE,
        ..Default::default()
    })?;
    device.allocate_and_bind(&mut texture, MemoryLocation::Device, 0.5, false)?;
    Ok(texture)
}

fn range(ty: DescriptorType, register: u32, num: u32, flags: DescriptorRangeFlags) -> DescriptorRangeDesc {
    DescriptorRangeDesc {
        base_register_index: register,
        descriptor_num: num,
        descriptor_type: ty,
        shader_stages: ShaderStages::FRAGMENT,
        flags,
    }
}

fn single_set(device: &Device, ranges: Vec<DescriptorRangeDesc>) -> binder::Result<BindingLayout> {
    device.create_binding_layout(&PipelineLayoutDesc {
        descriptor_sets: vec![DescriptorSetDesc {
            register_space: 0,
            ranges,
            ..Default::default()
        }],
        ..Default::default()
    })
}

fn texture_pool(device: &Device, sets: u32, textures: u32) -> anyhow::Result<DescriptorPool> {
    Ok(device.create_descriptor_pool(&DescriptorPoolDesc {
        descriptor_set_max_num: sets,
        capacity: DescriptorCounts {
            texture: textures,
            ..Default::default()
        },
        update_after_bind: false,
    })?)
}

#[test]
fn views_must_stay_inside_the_texture() -> anyhow::Result<()> {
    let (_soft, device) = device()?;
    let texture = texture(&device, 4, 6)?;
    let view = |mip_offset, mip_num, layer_offset, layer_num| {
        device.create_texture_view(
            &texture,
            &TextureViewDesc {
                mip_offset,
                mip_num,
                layer_offset,
                layer_num,
                ..TextureViewDesc::whole(TextureViewType::ShaderResourceArray)
            },
        )
    };

    for mip_offset in 0..4 {
        for layer_offset in 0..6 {
            view(mip_offset, 1, layer_offset, 1)?;
            view(mip_offset, REMAINING, layer_offset, REMAINING)?;
        }
    }
    view(0, 4, 0, 6)?;

    for (mip_offset, mip_num, layer_offset, layer_num) in [
        (4, 1, 0, 1),
        (0, 1, 6, 1),
        (3, 2, 0, 1),
        (0, 1, 5, 2),
        (4, REMAINING, 0, REMAINING),
        (0, 5, 0, REMAINING),
    ] {
        assert!(
            matches!(
                view(mip_offset, mip_num, layer_offset, layer_num),
                Err(Error::InvalidArgument(_))
            ),
            "mips {mip_offset}+{mip_num}, layers {layer_offset}+{layer_num}"
        );
    }
    Ok(())
}

#[test]
fn resources_bind_once() -> anyhow::Result<()> {
    let (_soft, device) = device()?;
    let mut texture = texture(&device, 1, 1)?;
    assert!(matches!(
        device.allocate_and_bind(&mut texture, MemoryLocation::Device, 0.5, false),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        device.allocate_and_bind(&mut texture, MemoryLocation::Device, 0.5, true),
        Err(Error::InvalidArgument(_))
    ));
    // The first binding survives the rejected ones.
    device.create_texture_view(&texture, &TextureViewDesc::whole(TextureViewType::ShaderResource))?;
    Ok(())
}

#[test]
fn remaining_mips_resolve_against_the_offset() -> anyhow::Result<()> {
    let (_soft, device) = device()?;
    let texture = texture(&device, 10, 1)?;
    let mips = |mip_num| -> anyhow::Result<u32> {
        let view = device.create_texture_view(
            &texture,
            &TextureViewDesc {
                mip_offset: 3,
                mip_num,
                ..TextureViewDesc::whole(TextureViewType::ShaderResource)
            },
        )?;
        Ok(view.subresource().map_or(0, |subresource| subresource.mip_num))
    };

    assert_eq!(mips(REMAINING)?, 7);
    assert_eq!(mips(4)?, 4);
    Ok(())
}

#[test]
fn registers_are_offset_per_kind() -> anyhow::Result<()> {
    let (soft, device) = device()?;
    let layout = single_set(
        &device,
        vec![
            range(DescriptorType::Texture, 5, 1, DescriptorRangeFlags::empty()),
            range(DescriptorType::Buffer, 5, 1, DescriptorRangeFlags::empty()),
        ],
    )?;
    let set = layout.set(0).ok_or_else(|| anyhow::anyhow!("no set 0"))?;
    let offsets = &device.config().binding_offsets;
    let (texture, buffer) = (&set.ranges()[0], &set.ranges()[1]);
    assert_eq!(texture.base_binding, offsets.texture + 5);
    assert_eq!(buffer.base_binding, offsets.buffer + 5);
    assert_ne!(texture.base_binding, buffer.base_binding);

    let info = soft
        .set_layout_info(set.layout().raw())
        .ok_or_else(|| anyhow::anyhow!("set layout is gone"))?;
    let mut bindings = info.bindings.iter().map(|b| b.binding).collect::<Vec<_>>();
    bindings.sort_unstable();
    bindings.dedup();
    assert_eq!(bindings.len(), 2);

    let overlapping = single_set(
        &device,
        vec![
            range(DescriptorType::Texture, 5, 1, DescriptorRangeFlags::empty()),
            range(DescriptorType::Texture, 4, 2, DescriptorRangeFlags::empty()),
        ],
    );
    assert!(matches!(overlapping, Err(Error::InvalidArgument(_))));
    Ok(())
}

#[test]
fn pools_reclaim_on_reset() -> anyhow::Result<()> {
    let (_soft, device) = device()?;
    let layout = single_set(
        &device,
        vec![range(DescriptorType::Texture, 0, 4, DescriptorRangeFlags::ARRAY)],
    )?;
    let pool = texture_pool(&device, 8, 32)?;

    let first = pool.allocate(&layout, 0, 3)?;
    let before = pool.usage();
    assert_eq!(before.sets, 3);
    assert_eq!(before.descriptors.texture, 12);

    assert!(matches!(pool.allocate(&layout, 0, 6), Err(Error::OutOfMemory)));
    assert_eq!(pool.usage(), before);
    let more = pool.allocate(&layout, 0, 5)?;
    assert_eq!(pool.usage().descriptors.texture, 32);
    assert!(matches!(pool.allocate(&layout, 0, 1), Err(Error::OutOfMemory)));

    pool.reset()?;
    assert!(first.iter().chain(&more).all(|set| !set.is_valid()));
    let all = pool.allocate(&layout, 0, 8)?;
    assert_eq!(all.len(), 8);
    assert_eq!(pool.usage().sets, 8);
    Ok(())
}

#[test]
fn copy_counts() -> anyhow::Result<()> {
    let (soft, device) = device()?;
    let layout = single_set(
        &device,
        vec![
            range(DescriptorType::Texture, 0, 3, DescriptorRangeFlags::ARRAY),
            range(DescriptorType::Texture, 4, 8, DescriptorRangeFlags::ARRAY),
        ],
    )?;
    let pool = texture_pool(&device, 2, 22)?;
    let mut sets = pool.allocate(&layout, 0, 2)?;
    let texture = texture(&device, 1, 1)?;
    let view = device.create_texture_view(&texture, &TextureViewDesc::whole(TextureViewType::ShaderResource))?;
    let filled = |set: &binder::DescriptorSet, range: u32, index: u32| -> anyhow::Result<bool> {
        Ok(soft.read_slot(set.raw(), &set.slot(range, index)?).is_some())
    };

    let (src, dst) = match &mut sets[..] {
        [src, dst] => (src, dst),
        _ => anyhow::bail!("expected two sets"),
    };
    src.write(0, 0, &[&view, &view, &view])?;
    src.write(1, 0, &[&view; 8])?;

    dst.copy_from(1, 0, src, 0, 0, 0)?;
    let copied = (0..8)
        .map(|i| filled(&*dst, 1, i))
        .collect::<anyhow::Result<Vec<_>>>()?;
    assert_eq!(copied, [true, true, true, false, false, false, false, false]);

    dst.copy_from(0, 0, src, 1, 2, 2)?;
    let copied = (0..3)
        .map(|i| filled(&*dst, 0, i))
        .collect::<anyhow::Result<Vec<_>>>()?;
    assert_eq!(copied, [true, true, false]);

    // The source range's eight descriptors don't fit the destination's three.
    assert!(matches!(
        dst.copy_from(0, 0, src, 1, 0, 0),
        Err(Error::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn gaps_share_one_placeholder() -> anyhow::Result<()> {
    let (soft, device) = device()?;
    let set = |register_space| DescriptorSetDesc {
        register_space,
        ranges: vec![range(DescriptorType::Texture, 0, 1, DescriptorRangeFlags::empty())],
        ..Default::default()
    };
    let layout = device.create_binding_layout(&PipelineLayoutDesc {
        descriptor_sets: vec![set(0), set(3)],
        ..Default::default()
    })?;

    let layouts = layout.set_layouts();
    assert_eq!(layouts.len(), 4);
    assert!(Arc::ptr_eq(&layouts[1], &layouts[2]));
    for declared in [0, 3] {
        for gap in [1, 2] {
            assert!(!Arc::ptr_eq(&layouts[declared], &layouts[gap]));
        }
    }
    let placeholder = soft
        .set_layout_info(layouts[1].raw())
        .ok_or_else(|| anyhow::anyhow!("placeholder is gone"))?;
    assert!(placeholder.bindings.is_empty());

    let native = soft
        .pipeline_layout_sets(layout.raw())
        .ok_or_else(|| anyhow::anyhow!("pipeline layout is gone"))?;
    assert_eq!(native, layouts.iter().map(|l| l.raw()).collect::<Vec<_>>());
    assert_eq!(layout.set_for_space(3).map(|s| s.register_space()), Some(3));
    Ok(())
}
