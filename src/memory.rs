//! Memory type classification and sub-allocation.

mod mem_type;
mod suballocator;

pub use self::mem_type::{MappedPtr, MemoryBlock, MemoryTypePool};
pub use self::suballocator::{Allocation, AllocationDesc, Suballocator};

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::driver::MemoryProperties;
use crate::error::{Error, Result};

bitflags! {
    /// Same bit layout as `VkMemoryPropertyFlags`.
    #[derive(Default)]
    pub struct MemoryPropertyFlags: u32 {
        const DEVICE_LOCAL = 1 << 0;
        const HOST_VISIBLE = 1 << 1;
        const HOST_COHERENT = 1 << 2;
        const HOST_CACHED = 1 << 3;
        const LAZILY_ALLOCATED = 1 << 4;
        const PROTECTED = 1 << 5;
    }
}

impl MemoryPropertyFlags {
    /// Types with any of these properties can't be split between resources.
    const DEDICATED_ONLY: Self = Self::LAZILY_ALLOCATED.union(Self::PROTECTED);
}

/// Where a resource's memory should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemoryLocation {
    /// Fast GPU memory, not reachable from the host.
    Device,
    /// GPU memory the host writes directly.
    DeviceUpload,
    /// Host memory for staging uploads.
    HostUpload,
    /// Host memory the GPU writes for the host to read back.
    HostReadback,
}

impl MemoryLocation {
    pub const ALL: [MemoryLocation; 4] = [
        MemoryLocation::Device,
        MemoryLocation::DeviceUpload,
        MemoryLocation::HostUpload,
        MemoryLocation::HostReadback,
    ];

    /// `(required, avoided)` property pairs, best first.
    fn preferences(self) -> &'static [(MemoryPropertyFlags, MemoryPropertyFlags)] {
        use MemoryPropertyFlags as F;
        const NONE: F = F::empty();
        const LOCAL: F = F::DEVICE_LOCAL;
        const VISIBLE: F = F::HOST_VISIBLE;
        const VISIBLE_COHERENT: F = VISIBLE.union(F::HOST_COHERENT);
        const VISIBLE_CACHED: F = VISIBLE.union(F::HOST_CACHED);
        const LOCAL_VISIBLE_COHERENT: F = VISIBLE_COHERENT.union(LOCAL);
        const VISIBLE_COHERENT_CACHED: F = VISIBLE_COHERENT.union(F::HOST_CACHED);

        match self {
            MemoryLocation::Device => &[(LOCAL, VISIBLE), (LOCAL, NONE), (NONE, NONE)],
            MemoryLocation::DeviceUpload => {
                &[(LOCAL_VISIBLE_COHERENT, NONE), (VISIBLE_COHERENT, NONE)]
            }
            MemoryLocation::HostUpload => &[(VISIBLE_COHERENT, LOCAL), (VISIBLE_COHERENT, NONE)],
            MemoryLocation::HostReadback => &[
                (VISIBLE_COHERENT_CACHED, NONE),
                (VISIBLE_CACHED, NONE),
                (VISIBLE_COHERENT, NONE),
                (VISIBLE, NONE),
            ],
        }
    }

    fn bits(self) -> u32 {
        match self {
            MemoryLocation::Device => 0,
            MemoryLocation::DeviceUpload => 1,
            MemoryLocation::HostUpload => 2,
            MemoryLocation::HostReadback => 3,
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => MemoryLocation::Device,
            1 => MemoryLocation::DeviceUpload,
            2 => MemoryLocation::HostUpload,
            _ => MemoryLocation::HostReadback,
        }
    }
}

/// Opaque packed memory type handed out by a [`MemoryCatalog`].
///
/// Layout: bits 0..8 type index, 8..10 location, bit 10 must-be-dedicated, 16..32 the id of
/// the catalog that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemoryType(u32);

impl MemoryType {
    const INDEX_MASK: u32 = 0xff;
    const LOCATION_SHIFT: u32 = 8;
    const DEDICATED_BIT: u32 = 1 << 10;
    const CATALOG_SHIFT: u32 = 16;

    fn pack(catalog: u16, type_index: u8, location: MemoryLocation, dedicated: bool) -> Self {
        let mut bits = u32::from(type_index)
            | location.bits() << Self::LOCATION_SHIFT
            | u32::from(catalog) << Self::CATALOG_SHIFT;
        if dedicated {
            bits |= Self::DEDICATED_BIT;
        }
        Self(bits)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u32 {
        self.0
    }

    pub fn type_index(self) -> u32 {
        self.0 & Self::INDEX_MASK
    }

    pub fn location(self) -> MemoryLocation {
        MemoryLocation::from_bits(self.0 >> Self::LOCATION_SHIFT)
    }

    pub fn must_be_dedicated(self) -> bool {
        self.0 & Self::DEDICATED_BIT != 0
    }

    fn catalog(self) -> u16 {
        (self.0 >> Self::CATALOG_SHIFT) as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTypeInfo {
    pub is_host_visible: bool,
    pub is_host_coherent: bool,
    pub must_be_dedicated: bool,
    pub heap_index: u32,
    pub type_index: u32,
    pub location: MemoryLocation,
}

static NEXT_CATALOG_ID: AtomicU32 = AtomicU32::new(1);

/// Classifies the memory types of one device.
#[derive(Debug, Clone)]
pub struct MemoryCatalog {
    id: u16,
    properties: MemoryProperties,
}

impl MemoryCatalog {
    pub fn new(properties: MemoryProperties) -> Result<Self> {
        if properties.types.is_empty() || properties.types.len() > 32 {
            return Err(Error::failure(format!(
                "device reports {} memory types",
                properties.types.len()
            )));
        }
        if let Some(ty) = properties
            .types
            .iter()
            .find(|ty| ty.heap_index as usize >= properties.heaps.len())
        {
            return Err(Error::failure(format!(
                "memory type references missing heap {}",
                ty.heap_index
            )));
        }
        // Ids wrap after 65535 catalogs; 0 is never handed out.
        let id = (NEXT_CATALOG_ID.fetch_add(1, Ordering::Relaxed) % u32::from(u16::MAX)) as u16 + 1;
        Ok(Self { id, properties })
    }

    pub fn properties(&self) -> &MemoryProperties {
        &self.properties
    }

    /// Picks the memory type best suited for `location`.
    pub fn classify(&self, location: MemoryLocation) -> Result<MemoryType> {
        self.classify_for(location, u32::MAX, false)
    }

    /// Picks the memory type best suited for `location` among those allowed by `type_bits`.
    /// `requires_dedicated` forces the result out of the pooled path.
    pub fn classify_for(
        &self,
        location: MemoryLocation,
        type_bits: u32,
        requires_dedicated: bool,
    ) -> Result<MemoryType> {
        for (i, &(required, avoided)) in location.preferences().iter().enumerate() {
            // Only settle for a dedicated-only type when nothing else has these properties.
            for avoided in [avoided | MemoryPropertyFlags::DEDICATED_ONLY, avoided] {
                if let Some(index) = self.find(type_bits, required, avoided) {
                    if i > 0 {
                        log::debug!("memory location {location:?} fell back to {required:?}");
                    }
                    let flags = self.properties.types[index as usize].flags;
                    let dedicated =
                        requires_dedicated || flags.intersects(MemoryPropertyFlags::DEDICATED_ONLY);
                    return Ok(MemoryType::pack(self.id, index, location, dedicated));
                }
            }
        }

        Err(Error::invalid(format!(
            "no memory type in {type_bits:#x} is usable for {location:?}"
        )))
    }

    pub fn resolve(&self, ty: MemoryType) -> Result<MemoryTypeInfo> {
        if ty.catalog() != self.id {
            return Err(Error::invalid(format!("{ty:?} belongs to another device")));
        }
        let props = self
            .properties
            .types
            .get(ty.type_index() as usize)
            .ok_or_else(|| Error::invalid(format!("{ty:?} is out of range")))?;

        Ok(MemoryTypeInfo {
            is_host_visible: props.flags.contains(MemoryPropertyFlags::HOST_VISIBLE),
            is_host_coherent: props.flags.contains(MemoryPropertyFlags::HOST_COHERENT),
            must_be_dedicated: ty.must_be_dedicated()
                || props.flags.intersects(MemoryPropertyFlags::DEDICATED_ONLY),
            heap_index: props.heap_index,
            type_index: ty.type_index(),
            location: ty.location(),
        })
    }

    /// Searches for the first memory type allowed by `type_bits` that has every `required`
    /// property and none of the `avoided` ones.
    fn find(
        &self,
        type_bits: u32,
        required: MemoryPropertyFlags,
        avoided: MemoryPropertyFlags,
    ) -> Option<u8> {
        self.properties
            .types
            .iter()
            .enumerate()
            .find_map(|(index, ty)| {
                let is_allowed = type_bits & (1 << index) != 0;
                let fits = ty.flags.contains(required) && !ty.flags.intersects(avoided);
                (is_allowed && fits).then_some(index as u8)
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::soft::SoftDriver;
    use crate::driver::Driver;

    fn catalog() -> MemoryCatalog {
        MemoryCatalog::new(SoftDriver::new().memory_properties()).unwrap()
    }

    #[test]
    fn every_location_resolves() {
        let catalog = catalog();
        for location in MemoryLocation::ALL {
            let ty = catalog.classify(location).unwrap();
            assert_eq!(ty, catalog.classify(location).unwrap());
            let info = catalog.resolve(ty).unwrap();
            assert_eq!(info.location, location);
            assert!(!info.must_be_dedicated);
            assert_eq!(info.is_host_visible, location != MemoryLocation::Device);
        }
    }

    #[test]
    fn readback_prefers_cached() {
        let catalog = catalog();
        let info = catalog
            .resolve(catalog.classify(MemoryLocation::HostReadback).unwrap())
            .unwrap();
        let flags = catalog.properties().types[info.type_index as usize].flags;
        assert!(flags.contains(MemoryPropertyFlags::HOST_CACHED));
        assert!(!info.is_host_coherent);
    }

    #[test]
    fn dedicated_types() {
        let catalog = catalog();
        let lazily = catalog
            .properties()
            .types
            .iter()
            .position(|ty| ty.flags.contains(MemoryPropertyFlags::LAZILY_ALLOCATED))
            .unwrap();
        let ty = catalog
            .classify_for(MemoryLocation::Device, 1 << lazily, false)
            .unwrap();
        assert!(ty.must_be_dedicated());
        assert!(catalog.resolve(ty).unwrap().must_be_dedicated);

        let ty = catalog
            .classify_for(MemoryLocation::Device, u32::MAX, true)
            .unwrap();
        assert!(catalog.resolve(ty).unwrap().must_be_dedicated);
    }

    #[test]
    fn foreign_and_out_of_range() {
        let a = catalog();
        let b = catalog();
        let ty = a.classify(MemoryLocation::Device).unwrap();
        assert!(matches!(b.resolve(ty), Err(Error::InvalidArgument(_))));

        let bogus = MemoryType::from_raw(ty.as_raw() | 0xff);
        assert!(matches!(a.resolve(bogus), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn no_compatible_type() {
        let catalog = catalog();
        assert!(matches!(
            catalog.classify_for(MemoryLocation::HostUpload, 0, false),
            Err(Error::InvalidArgument(_))
        ));
    }
}
