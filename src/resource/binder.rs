use std::sync::Arc;

use crate::device::Device;
use crate::driver::{AccelerationStructureInfo, DeviceLimits, Driver, MemoryRequirements, NativeResource};
use crate::error::{ensure, Error, Result};
use crate::memory::{Allocation, AllocationDesc, MemoryLocation, MemoryType};

use super::{AccelerationStructure, BindState, BoundMemory, Buffer, BufferUsage, FlushTarget, Texture};

/// What a resource needs from memory, for callers that allocate it themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDesc {
    pub size: u64,
    pub alignment: u64,
    pub memory_type: MemoryType,
    pub must_be_dedicated: bool,
}

pub(crate) mod private {
    use super::*;

    pub trait Sealed {
        fn native(&self) -> NativeResource;
        fn state(&self) -> &BindState;
        fn state_mut(&mut self) -> &mut BindState;

        fn min_alignment(&self, _limits: &DeviceLimits) -> u64 {
            1
        }

        /// Runs once memory is bound natively, before the resource counts as bound. On error
        /// the resource must be left bindable again.
        fn on_bound(&mut self, _driver: &Arc<dyn Driver>) -> Result<()> {
            Ok(())
        }
    }
}

use private::Sealed;

/// A resource memory can be bound to: [`Buffer`], [`Texture`] or [`AccelerationStructure`].
pub trait Bindable: Sealed {}

impl Sealed for Buffer {
    fn native(&self) -> NativeResource {
        NativeResource::Buffer(self.raw)
    }

    fn state(&self) -> &BindState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut BindState {
        &mut self.state
    }

    fn min_alignment(&self, limits: &DeviceLimits) -> u64 {
        if self.desc.usage.contains(BufferUsage::SCRATCH_BUFFER) {
            limits.scratch_buffer_alignment
        } else {
            1
        }
    }
}

impl Bindable for Buffer {}

impl Sealed for Texture {
    fn native(&self) -> NativeResource {
        NativeResource::Texture(self.raw)
    }

    fn state(&self) -> &BindState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut BindState {
        &mut self.state
    }
}

impl Bindable for Texture {}

impl Sealed for AccelerationStructure {
    fn native(&self) -> NativeResource {
        self.buffer.native()
    }

    fn state(&self) -> &BindState {
        &self.buffer.state
    }

    fn state_mut(&mut self) -> &mut BindState {
        &mut self.buffer.state
    }

    fn on_bound(&mut self, driver: &Arc<dyn Driver>) -> Result<()> {
        let created = driver.create_acceleration_structure(&AccelerationStructureInfo {
            buffer: self.buffer.raw,
            size: self.desc.size,
            kind: self.desc.kind,
        });
        match created {
            Ok(raw) => {
                self.raw = Some(raw);
                Ok(())
            }
            Err(err) => {
                // A native buffer binds once, so the next bind needs a fresh one.
                let fresh = driver.create_buffer(&self.buffer.desc)?;
                let stale = std::mem::replace(&mut self.buffer.raw, fresh);
                driver.destroy_buffer(stale);
                log::warn!("acceleration structure creation failed, backing buffer replaced: {err}");
                Err(err)
            }
        }
    }
}

impl Bindable for AccelerationStructure {}

fn ensure_unbound(state: &BindState) -> Result<()> {
    match state {
        BindState::Unbound => Ok(()),
        BindState::Wrapped => Err(Error::invalid("wrapped resources can't be bound")),
        BindState::Bound(_) => Err(Error::invalid("resource is already bound")),
    }
}

impl Device {
    fn requirements(&self, resource: &impl Bindable) -> MemoryRequirements {
        let mut requirements = self.driver().memory_requirements(resource.native());
        requirements.alignment = requirements
            .alignment
            .max(resource.min_alignment(self.limits()))
            .max(1);
        requirements
    }

    /// Size, alignment and memory type `resource` needs in `location`.
    pub fn memory_desc(&self, resource: &impl Bindable, location: MemoryLocation) -> Result<MemoryDesc> {
        let requirements = self.requirements(resource);
        let memory_type = self.catalog().classify_for(
            location,
            requirements.type_bits,
            requirements.requires_dedicated,
        )?;
        Ok(MemoryDesc {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type,
            must_be_dedicated: memory_type.must_be_dedicated(),
        })
    }

    /// Allocates memory for `resource` in `location` and binds it.
    ///
    /// `committed` gives the resource its own memory object even when it could be pooled.
    pub fn allocate_and_bind(
        &self,
        resource: &mut impl Bindable,
        location: MemoryLocation,
        priority: f32,
        committed: bool,
    ) -> Result<()> {
        ensure_unbound(resource.state())?;
        let desc = self.memory_desc(resource, location)?;
        let dedicated = (desc.must_be_dedicated || committed).then(|| resource.native());
        let allocation = self.suballocator().allocate_for(
            &AllocationDesc {
                size: desc.size,
                alignment: desc.alignment,
                memory_type: desc.memory_type,
                priority,
                committed,
            },
            dedicated,
        )?;

        self.driver()
            .bind_memory(resource.native(), allocation.memory(), allocation.offset())?;
        let offset = allocation.offset();
        self.finish_bind(resource, allocation, offset)
    }

    /// Binds `resource` to `allocation` at `offset` bytes into it.
    ///
    /// The allocation is kept alive by the resource.
    pub fn bind_memory(
        &self,
        resource: &mut impl Bindable,
        allocation: &Allocation,
        offset: u64,
    ) -> Result<()> {
        ensure_unbound(resource.state())?;
        let requirements = self.requirements(resource);
        let info = self.catalog().resolve(allocation.memory_type())?;

        ensure!(
            requirements.type_bits & (1 << info.type_index) != 0,
            "memory type {} can't back this resource (allowed: {:#x})",
            info.type_index,
            requirements.type_bits
        );
        if requirements.requires_dedicated {
            ensure!(
                allocation.dedicated_to() == Some(resource.native()) && offset == 0,
                "resource needs memory dedicated to it"
            );
        }
        let end = offset
            .checked_add(requirements.size)
            .ok_or_else(|| Error::invalid("bind offset overflows"))?;
        ensure!(
            end <= allocation.size(),
            "resource needs {}B at offset {offset}, allocation has {}B",
            requirements.size,
            allocation.size()
        );
        let absolute = allocation.offset() + offset;
        ensure!(
            absolute % requirements.alignment == 0,
            "offset {absolute} is not aligned to {}",
            requirements.alignment
        );

        self.driver()
            .bind_memory(resource.native(), allocation.memory(), absolute)?;
        self.finish_bind(resource, allocation.clone(), absolute)
    }

    /// Shared tail of both bind paths: records the host mapping and flush target, then lets the
    /// resource finish its own setup.
    fn finish_bind(
        &self,
        resource: &mut impl Bindable,
        allocation: Allocation,
        offset: u64,
    ) -> Result<()> {
        let info = self.catalog().resolve(allocation.memory_type())?;
        let (mapped, flush) = if info.is_host_visible {
            let relative = offset - allocation.offset();
            // SAFETY: the resource lies within the allocation.
            let mapped = allocation
                .mapped_ptr()
                .map(|ptr| unsafe { ptr.add(relative) });
            let flush = (!info.is_host_coherent).then(|| FlushTarget {
                memory: allocation.memory(),
                offset,
            });
            (mapped, flush)
        } else {
            (None, None)
        };

        resource.on_bound(self.driver())?;
        *resource.state_mut() = BindState::Bound(BoundMemory {
            allocation,
            offset,
            mapped,
            flush,
        });
        Ok(())
    }
}
