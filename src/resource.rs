//! Buffers, textures and acceleration structures, and how memory gets bound to them.

mod binder;

pub use self::binder::{Bindable, MemoryDesc};

use std::sync::{Arc, Weak};

use bitflags::bitflags;

use crate::device::Device;
use crate::driver::{Driver, RawAccelerationStructure, RawBuffer, RawMemory, RawTexture};
use crate::error::{ensure, Error, Result};
use crate::format::Format;
use crate::memory::{Allocation, MappedPtr, MemoryType};

/// Size sentinel meaning "up to the end of the buffer".
pub const WHOLE_SIZE: u64 = u64::MAX;

bitflags! {
    #[derive(Default)]
    pub struct BufferUsage: u32 {
        const SHADER_RESOURCE = 1 << 0;
        const SHADER_RESOURCE_STORAGE = 1 << 1;
        const CONSTANT_BUFFER = 1 << 2;
        const VERTEX_BUFFER = 1 << 3;
        const INDEX_BUFFER = 1 << 4;
        const ARGUMENT_BUFFER = 1 << 5;
        /// Scratch space for acceleration structure builds.
        const SCRATCH_BUFFER = 1 << 6;
        const ACCELERATION_STRUCTURE_STORAGE = 1 << 7;
        const ACCELERATION_STRUCTURE_BUILD_INPUT = 1 << 8;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct TextureUsage: u32 {
        const SHADER_RESOURCE = 1 << 0;
        const SHADER_RESOURCE_STORAGE = 1 << 1;
        const COLOR_ATTACHMENT = 1 << 2;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferDesc {
    pub size: u64,
    /// Element size for structured views. 0 if the buffer is never viewed as structured.
    pub structure_stride: u32,
    pub usage: BufferUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureKind {
    D1,
    #[default]
    D2,
    D3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureDesc {
    pub kind: TextureKind,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_num: u32,
    pub layer_num: u32,
    pub sample_num: u32,
    pub usage: TextureUsage,
}

impl TextureDesc {
    /// Replaces zero counts and extents with 1, and forces the extents a kind doesn't have to 1.
    pub fn normalized(mut self) -> Self {
        let at_least_one = |x: u32| x.max(1);
        self.width = at_least_one(self.width);
        self.height = at_least_one(self.height);
        self.depth = at_least_one(self.depth);
        self.mip_num = at_least_one(self.mip_num);
        self.layer_num = at_least_one(self.layer_num);
        self.sample_num = at_least_one(self.sample_num);
        match self.kind {
            TextureKind::D1 => {
                self.height = 1;
                self.depth = 1;
            }
            TextureKind::D2 => self.depth = 1,
            TextureKind::D3 => self.layer_num = 1,
        }
        self
    }

    /// Layers addressable by a view: array layers, or depth slices for 3D textures.
    pub fn view_layer_num(&self) -> u32 {
        match self.kind {
            TextureKind::D3 => self.depth,
            TextureKind::D1 | TextureKind::D2 => self.layer_num,
        }
    }

    fn max_mip_num(&self) -> u32 {
        let largest = self.width.max(self.height).max(self.depth);
        u32::BITS - largest.leading_zeros()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationStructureKind {
    TopLevel,
    BottomLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelerationStructureDesc {
    pub kind: AccelerationStructureKind,
    /// Bytes of storage the build needs.
    pub size: u64,
}

/// Where a flush of non-coherent memory must go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushTarget {
    pub memory: RawMemory,
    /// Offset of the resource's first byte in `memory`.
    pub offset: u64,
}

/// Memory a resource has been bound to.
#[derive(Debug, Clone)]
pub struct BoundMemory {
    allocation: Allocation,
    offset: u64,
    mapped: Option<MappedPtr>,
    flush: Option<FlushTarget>,
}

impl BoundMemory {
    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    /// Offset of the resource in [`Allocation::memory`].
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn mapped(&self) -> Option<MappedPtr> {
        self.mapped
    }

    /// Set only for host-visible memory that isn't host-coherent.
    pub fn flush_target(&self) -> Option<FlushTarget> {
        self.flush
    }
}

/// Binding state of a resource. Transitions `Unbound -> Bound` once; `Wrapped` never changes.
#[derive(Debug, Clone)]
pub enum BindState {
    /// Wraps a native object created elsewhere; owns nothing.
    Wrapped,
    Unbound,
    Bound(BoundMemory),
}

impl BindState {
    pub fn bound(&self) -> Option<&BoundMemory> {
        match self {
            BindState::Bound(memory) => Some(memory),
            BindState::Wrapped | BindState::Unbound => None,
        }
    }

    /// Whether descriptors may be created for the resource.
    pub fn is_viewable(&self) -> bool {
        !matches!(self, BindState::Unbound)
    }
}

pub struct Buffer {
    driver: Arc<dyn Driver>,
    raw: RawBuffer,
    desc: BufferDesc,
    state: BindState,
    mapped_range: Option<(u64, u64)>,
    liveness: Arc<()>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("raw", &self.raw)
            .field("desc", &self.desc)
            .field("state", &self.state)
            .finish()
    }
}

impl Buffer {
    pub fn raw(&self) -> RawBuffer {
        self.raw
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    pub fn state(&self) -> &BindState {
        &self.state
    }

    pub fn memory_type(&self) -> Option<MemoryType> {
        self.state.bound().map(|m| m.allocation.memory_type())
    }

    pub(crate) fn liveness(&self) -> Weak<()> {
        Arc::downgrade(&self.liveness)
    }

    /// Returns the bytes `offset..offset + size` of a buffer bound to host-visible memory.
    ///
    /// `size` may be [`WHOLE_SIZE`]. Writes to non-coherent memory become visible to the device
    /// after [`Buffer::unmap`], which flushes everything mapped since the last unmap.
    pub fn map(&mut self, offset: u64, size: u64) -> Result<&mut [u8]> {
        let mapped = match &self.state {
            BindState::Bound(memory) => memory
                .mapped
                .ok_or_else(|| Error::invalid("buffer memory is not host-visible"))?,
            BindState::Wrapped => return Err(Error::invalid("wrapped buffers can't be mapped")),
            BindState::Unbound => return Err(Error::invalid("buffer is not bound")),
        };
        ensure!(offset <= self.desc.size, "map offset {offset} is past the buffer end");
        let size = if size == WHOLE_SIZE {
            self.desc.size - offset
        } else {
            size
        };
        ensure!(
            size <= self.desc.size - offset,
            "map range {offset}+{size} exceeds the {}B buffer",
            self.desc.size
        );

        // Nested maps widen the range flushed on unmap.
        self.mapped_range = Some(match self.mapped_range {
            Some((start, len)) => {
                let first = start.min(offset);
                (first, (start + len).max(offset + size) - first)
            }
            None => (offset, size),
        });
        // SAFETY: the range lies within the bound region, which stays mapped for as long as the
        // buffer holds its allocation, and `&mut self` keeps the slice exclusive.
        unsafe {
            Ok(std::slice::from_raw_parts_mut(
                mapped.add(offset).as_ptr(),
                size as usize,
            ))
        }
    }

    /// Ends a [`Buffer::map`], flushing the mapped range if the memory is not host-coherent.
    pub fn unmap(&mut self) -> Result<()> {
        let Some((offset, size)) = self.mapped_range.take() else {
            return Ok(());
        };
        if let Some(target) = self.state.bound().and_then(BoundMemory::flush_target) {
            log::trace!("flushing {size}B of {:?}", target.memory);
            self.driver
                .flush_memory(target.memory, target.offset + offset, size)?;
        }
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if !matches!(self.state, BindState::Wrapped) {
            self.driver.destroy_buffer(self.raw);
        }
    }
}

pub struct Texture {
    driver: Arc<dyn Driver>,
    raw: RawTexture,
    desc: TextureDesc,
    state: BindState,
    liveness: Arc<()>,
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("raw", &self.raw)
            .field("desc", &self.desc)
            .field("state", &self.state)
            .finish()
    }
}

impl Texture {
    pub fn raw(&self) -> RawTexture {
        self.raw
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn state(&self) -> &BindState {
        &self.state
    }

    pub fn memory_type(&self) -> Option<MemoryType> {
        self.state.bound().map(|m| m.allocation.memory_type())
    }

    pub(crate) fn liveness(&self) -> Weak<()> {
        Arc::downgrade(&self.liveness)
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        if !matches!(self.state, BindState::Wrapped) {
            self.driver.destroy_texture(self.raw);
        }
    }
}

/// An acceleration structure living in a buffer. The native object appears once the buffer is
/// bound.
#[derive(Debug)]
pub struct AccelerationStructure {
    buffer: Buffer,
    desc: AccelerationStructureDesc,
    raw: Option<RawAccelerationStructure>,
}

impl AccelerationStructure {
    pub fn desc(&self) -> &AccelerationStructureDesc {
        &self.desc
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// `None` until memory is bound.
    pub fn raw(&self) -> Option<RawAccelerationStructure> {
        self.raw
    }

    pub(crate) fn liveness(&self) -> Weak<()> {
        self.buffer.liveness()
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            self.buffer.driver.destroy_acceleration_structure(raw);
        }
    }
}

impl Device {
    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<Buffer> {
        ensure!(desc.size != 0, "buffers can't be empty");
        let raw = self.driver().create_buffer(desc)?;
        Ok(Buffer {
            driver: self.driver().clone(),
            raw,
            desc: *desc,
            state: BindState::Unbound,
            mapped_range: None,
            liveness: Arc::new(()),
        })
    }

    /// Wraps a buffer whose memory is managed elsewhere. The buffer is not destroyed on drop.
    pub fn wrap_buffer(&self, raw: RawBuffer, desc: &BufferDesc) -> Buffer {
        Buffer {
            driver: self.driver().clone(),
            raw,
            desc: *desc,
            state: BindState::Wrapped,
            mapped_range: None,
            liveness: Arc::new(()),
        }
    }

    pub fn create_texture(&self, desc: &TextureDesc) -> Result<Texture> {
        let desc = validate_texture(desc)?;
        let raw = self.driver().create_texture(&desc)?;
        Ok(Texture {
            driver: self.driver().clone(),
            raw,
            desc,
            state: BindState::Unbound,
            liveness: Arc::new(()),
        })
    }

    /// Wraps a texture whose memory is managed elsewhere, such as a swap chain image. The texture
    /// is not destroyed on drop.
    pub fn wrap_texture(&self, raw: RawTexture, desc: &TextureDesc) -> Result<Texture> {
        Ok(Texture {
            driver: self.driver().clone(),
            raw,
            desc: validate_texture(desc)?,
            state: BindState::Wrapped,
            liveness: Arc::new(()),
        })
    }

    pub fn create_acceleration_structure(
        &self,
        desc: &AccelerationStructureDesc,
    ) -> Result<AccelerationStructure> {
        if !self.limits().ray_tracing {
            return Err(Error::failure("device doesn't support ray tracing"));
        }
        let buffer = self.create_buffer(&BufferDesc {
            size: desc.size,
            structure_stride: 0,
            usage: BufferUsage::ACCELERATION_STRUCTURE_STORAGE,
        })?;
        Ok(AccelerationStructure {
            buffer,
            desc: *desc,
            raw: None,
        })
    }
}

fn validate_texture(desc: &TextureDesc) -> Result<TextureDesc> {
    let desc = desc.normalized();
    ensure!(desc.format != Format::Unknown, "textures need a format");
    ensure!(
        desc.sample_num.is_power_of_two(),
        "sample count {} is not a power of two",
        desc.sample_num
    );
    if desc.sample_num > 1 {
        ensure!(
            desc.kind == TextureKind::D2 && desc.mip_num == 1,
            "only single-mip 2D textures can be multisampled"
        );
    }
    ensure!(
        desc.mip_num <= desc.max_mip_num(),
        "{} mips requested, {}x{}x{} has at most {}",
        desc.mip_num,
        desc.width,
        desc.height,
        desc.depth,
        desc.max_mip_num()
    );
    if desc.usage.contains(TextureUsage::DEPTH_STENCIL_ATTACHMENT) {
        ensure!(
            desc.format.has_depth() || desc.format.has_stencil(),
            "depth-stencil attachments need a depth or stencil format"
        );
    }
    Ok(desc)
}
