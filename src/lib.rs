//! Resource binding core of a GPU hardware abstraction layer.
//!
//! A [`Device`] wraps a [`Driver`](driver::Driver) and provides:
//!
//! - memory type classification and sub-allocation ([`memory`]),
//! - binding buffers and textures to memory ([`resource`]),
//! - views, samplers and other descriptors ([`descriptor`]),
//! - compilation of declarative binding layouts into native set layouts ([`layout`]),
//! - descriptor pools, set allocation and descriptor updates ([`pool`]).
//!
//! [`driver::soft::SoftDriver`] runs everything on the host; [`driver::vulkan::VulkanDriver`]
//! runs it on a Vulkan device.

pub mod allocators;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod driver;
mod error;
pub mod format;
pub mod layout;
pub mod memory;
pub mod pool;
pub mod resource;
mod util;

pub use config::{BindingOffsets, DeviceConfig};
pub use descriptor::{Descriptor, DescriptorType};
pub use device::Device;
pub use error::{Error, Result};
pub use layout::{BindingLayout, PipelineLayoutDesc};
pub use pool::{DescriptorPool, DescriptorPoolDesc, DescriptorSet};
