use std::num::NonZeroU64;

use nonzero_ext::nonzero;

use crate::descriptor::DescriptorType;
use crate::error::{ensure, Result};

/// 256 MiB
pub const DEVICE_BLOCK_SIZE: NonZeroU64 = nonzero!(256 * 1024 * 1024u64);
/// 64 MiB
pub const HOST_BLOCK_SIZE: NonZeroU64 = nonzero!(64 * 1024 * 1024u64);
/// 1 KiB
pub const MIN_ALLOC_SIZE: NonZeroU64 = nonzero!(1024u64);

/// Per-device knobs. Constructed once and handed to [`Device::new`](crate::Device::new).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub binding_offsets: BindingOffsets,
    /// Size of pooled blocks for memory types that are not host-visible.
    pub device_block_size: NonZeroU64,
    /// Size of pooled blocks for host-visible memory types.
    pub host_block_size: NonZeroU64,
    /// Smallest unit handed out by the block sub-allocators.
    pub min_alloc_size: NonZeroU64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            binding_offsets: BindingOffsets::default(),
            device_block_size: DEVICE_BLOCK_SIZE,
            host_block_size: HOST_BLOCK_SIZE,
            min_alloc_size: MIN_ALLOC_SIZE,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, size) in [
            ("device_block_size", self.device_block_size),
            ("host_block_size", self.host_block_size),
            ("min_alloc_size", self.min_alloc_size),
        ] {
            ensure!(size.is_power_of_two(), "{name} ({size}) must be a power of two");
        }
        ensure!(
            self.min_alloc_size <= self.device_block_size
                && self.min_alloc_size <= self.host_block_size,
            "min_alloc_size ({}) exceeds a block size",
            self.min_alloc_size
        );
        Ok(())
    }
}

/// Flat binding index added to a range's register index, one entry per descriptor type.
///
/// Shader languages number textures, buffers and samplers from zero in separate register
/// classes. Adding a distinct offset per type lets all of them share one binding namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingOffsets {
    pub sampler: u32,
    pub constant_buffer: u32,
    pub texture: u32,
    pub storage_texture: u32,
    pub buffer: u32,
    pub storage_buffer: u32,
    pub structured_buffer: u32,
    pub storage_structured_buffer: u32,
    pub acceleration_structure: u32,
}

impl BindingOffsets {
    pub const ZERO: Self = Self {
        sampler: 0,
        constant_buffer: 0,
        texture: 0,
        storage_texture: 0,
        buffer: 0,
        storage_buffer: 0,
        structured_buffer: 0,
        storage_structured_buffer: 0,
        acceleration_structure: 0,
    };

    /// Window of bindings reserved for each type by [`BindingOffsets::default`].
    pub const DEFAULT_STRIDE: u32 = 128;

    /// Builds offsets from the four HLSL register classes: `s` for samplers, `t` for read-only
    /// resources, `b` for constant buffers and `u` for everything writable.
    pub fn from_register_classes(sampler: u32, texture: u32, constant: u32, storage: u32) -> Self {
        Self {
            sampler,
            constant_buffer: constant,
            texture,
            storage_texture: storage,
            buffer: texture,
            storage_buffer: storage,
            structured_buffer: texture,
            storage_structured_buffer: storage,
            acceleration_structure: texture,
        }
    }

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
}

impl Default for BindingOffsets {
    fn default() -> Self {
        let window = |i: u32| i * Self::DEFAULT_STRIDE;
        Self {
            sampler: window(0),
            constant_buffer: window(1),
            texture: window(2),
            storage_texture: window(3),
            buffer: window(4),
            storage_buffer: window(5),
            structured_buffer: window(6),
            storage_structured_buffer: window(7),
            acceleration_structure: window(8),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_windows_are_distinct() {
        let offsets = BindingOffsets::default();
        let mut all = DescriptorType::ALL.map(|ty| offsets.get(ty));
        all.sort();
        assert!(all.windows(2).all(|w| w[1] - w[0] == BindingOffsets::DEFAULT_STRIDE));
    }

    #[test]
    fn register_classes() {
        let offsets = BindingOffsets::from_register_classes(100, 200, 300, 400);
        assert_eq!(offsets.get(DescriptorType::Sampler), 100);
        assert_eq!(offsets.get(DescriptorType::StructuredBuffer), 200);
        assert_eq!(offsets.get(DescriptorType::ConstantBuffer), 300);
        assert_eq!(offsets.get(DescriptorType::StorageTexture), 400);
    }

    #[test]
    fn validation() {
        DeviceConfig::default().validate().unwrap();
        let config = DeviceConfig {
            host_block_size: nonzero!(3000u64),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = DeviceConfig {
            min_alloc_size: nonzero!(1024u64 * 1024 * 1024),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
