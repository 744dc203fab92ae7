//! Compiles logical binding declarations into native set and pipeline layouts.

use std::sync::Arc;

use ahash::AHashSet;
use bitflags::bitflags;

use crate::config::BindingOffsets;
use crate::descriptor::{Descriptor, DescriptorCounts, DescriptorType, HeapCounts, HeapType, NativeView, SamplerDesc};
use crate::device::Device;
use crate::driver::{
    BindingFlags, BindingKind, DeviceLimits, Driver, PushConstantRange, RawPipelineLayout, RawSetLayout,
    SetLayoutBinding, SetLayoutFlags, SetLayoutInfo,
};
use crate::error::{ensure, Error, Result};

bitflags! {
    #[derive(Default)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const TESS_CONTROL = 1 << 1;
        const TESS_EVALUATION = 1 << 2;
        const GEOMETRY = 1 << 3;
        const FRAGMENT = 1 << 4;
        const COMPUTE = 1 << 5;
        const RAYGEN = 1 << 6;
        const MISS = 1 << 7;
        const INTERSECTION = 1 << 8;
        const CLOSEST_HIT = 1 << 9;
        const ANY_HIT = 1 << 10;
        const CALLABLE = 1 << 11;
        const TASK = 1 << 12;
        const MESH = 1 << 13;

        const ALL_GRAPHICS = Self::VERTEX.bits
            | Self::TESS_CONTROL.bits
            | Self::TESS_EVALUATION.bits
            | Self::GEOMETRY.bits
            | Self::FRAGMENT.bits
            | Self::TASK.bits
            | Self::MESH.bits;
        const ALL_RAY_TRACING = Self::RAYGEN.bits
            | Self::MISS.bits
            | Self::INTERSECTION.bits
            | Self::CLOSEST_HIT.bits
            | Self::ANY_HIT.bits
            | Self::CALLABLE.bits;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct PipelineLayoutFlags: u32 {
        /// Use register indices as binding numbers verbatim.
        const IGNORE_GLOBAL_OFFSETS = 1 << 0;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct DescriptorSetFlags: u32 {
        /// Sets may be updated after being bound. Needs an update-after-bind pool.
        const ALLOW_UPDATE_AFTER_SET = 1 << 0;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct DescriptorRangeFlags: u32 {
        const PARTIALLY_BOUND = 1 << 0;
        /// One native binding holding `descriptor_num` descriptors.
        const ARRAY = 1 << 1;
        /// Like `ARRAY`, with the actual size picked at allocation. Must be the set's last range.
        const VARIABLE_SIZED_ARRAY = 1 << 2;
        const ALLOW_UPDATE_AFTER_SET = 1 << 3;
        /// Holds any resource descriptor kind instead of only `descriptor_type`.
        const MUTABLE = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorRangeDesc {
    pub base_register_index: u32,
    pub descriptor_num: u32,
    pub descriptor_type: DescriptorType,
    /// Empty inherits the pipeline layout's stages.
    pub shader_stages: ShaderStages,
    pub flags: DescriptorRangeFlags,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorSetDesc {
    pub register_space: u32,
    pub ranges: Vec<DescriptorRangeDesc>,
    pub flags: DescriptorSetFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootConstantDesc {
    pub register_index: u32,
    /// Bytes, a multiple of 4.
    pub size: u32,
    pub shader_stages: ShaderStages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootDescriptorDesc {
    pub register_index: u32,
    /// `ConstantBuffer`, `StructuredBuffer` or `StorageStructuredBuffer`.
    pub descriptor_type: DescriptorType,
    pub shader_stages: ShaderStages,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RootSamplerDesc {
    pub register_index: u32,
    pub desc: SamplerDesc,
    pub shader_stages: ShaderStages,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineLayoutDesc {
    pub descriptor_sets: Vec<DescriptorSetDesc>,
    pub root_constants: Vec<RootConstantDesc>,
    pub root_descriptors: Vec<RootDescriptorDesc>,
    pub root_samplers: Vec<RootSamplerDesc>,
    /// Space of the push set synthesized from root descriptors and samplers.
    pub root_register_space: u32,
    pub shader_stages: ShaderStages,
    pub flags: PipelineLayoutFlags,
}

/// Native set layout, destroyed once no [`BindingLayout`] or set refers to it.
pub struct SetLayout {
    driver: Arc<dyn Driver>,
    raw: RawSetLayout,
}

impl std::fmt::Debug for SetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SetLayout").field(&self.raw).finish()
    }
}

impl SetLayout {
    pub fn raw(&self) -> RawSetLayout {
        self.raw
    }
}

impl Drop for SetLayout {
    fn drop(&mut self) {
        self.driver.destroy_set_layout(self.raw);
    }
}

/// Where one declared range ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeMapping {
    pub descriptor_type: DescriptorType,
    pub kind: BindingKind,
    pub descriptor_num: u32,
    /// Flat binding of the first descriptor, offsets applied.
    pub base_binding: u32,
    pub heap_type: HeapType,
    /// First slot of the range in the set's part of its heap.
    pub heap_offset: u32,
    /// Whether the range is one native binding (`ARRAY`/`VARIABLE_SIZED_ARRAY`) rather than
    /// one binding per descriptor.
    pub is_array: bool,
    pub is_variable: bool,
    pub flags: DescriptorRangeFlags,
}

impl RangeMapping {
    pub fn is_mutable(&self) -> bool {
        matches!(self.kind, BindingKind::Mutable(_))
    }

    /// Whether a descriptor of `ty` may be written to the range.
    pub fn accepts(&self, ty: DescriptorType) -> bool {
        match &self.kind {
            BindingKind::Single(single) => *single == ty,
            BindingKind::Mutable(types) => types.contains(&ty),
        }
    }

    /// Native `(binding, array_element)` of descriptor `index` of the range.
    pub fn native_slot(&self, index: u32) -> (u32, u32) {
        if self.is_array {
            (self.base_binding, index)
        } else {
            (self.base_binding + index, 0)
        }
    }
}

/// A declared set after compilation.
#[derive(Debug)]
pub struct CompiledSet {
    register_space: u32,
    ranges: Vec<RangeMapping>,
    heap_descriptor_num: HeapCounts,
    counts: DescriptorCounts,
    update_after_bind: bool,
    layout: Arc<SetLayout>,
}

impl CompiledSet {
    pub fn register_space(&self) -> u32 {
        self.register_space
    }

    pub fn ranges(&self) -> &[RangeMapping] {
        &self.ranges
    }

    /// Heap slots one set needs at full size.
    pub fn heap_descriptor_num(&self) -> HeapCounts {
        self.heap_descriptor_num
    }

    /// Descriptors one set needs at full size, by kind.
    pub fn counts(&self) -> DescriptorCounts {
        self.counts
    }

    pub fn update_after_bind(&self) -> bool {
        self.update_after_bind
    }

    pub fn layout(&self) -> &Arc<SetLayout> {
        &self.layout
    }

    pub fn variable_range(&self) -> Option<&RangeMapping> {
        self.ranges.iter().find(|range| range.is_variable)
    }

    /// Counts and heap slots of one set whose variable-sized range holds `variable_count`
    /// descriptors. `None` sizes the range at its declared maximum.
    pub fn footprint(&self, variable_count: Option<u32>) -> Result<(DescriptorCounts, HeapCounts)> {
        let (mut counts, mut heaps) = (self.counts, self.heap_descriptor_num);
        if let Some(count) = variable_count {
            let range = self
                .variable_range()
                .ok_or_else(|| Error::invalid("set has no variable-sized range"))?;
            ensure!(
                count <= range.descriptor_num,
                "variable count {count} exceeds the declared {}",
                range.descriptor_num
            );
            let unused = range.descriptor_num - count;
            *counts.entry(range.descriptor_type, range.is_mutable()) -= unused;
            *heaps.get_mut(range.heap_type) -= unused;
        }
        Ok((counts, heaps))
    }
}

/// Byte placement of a root constant in the push-constant block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootConstant {
    pub register_index: u32,
    pub offset: u32,
    pub size: u32,
    pub stages: ShaderStages,
}

/// The synthesized set holding root descriptors and root samplers.
#[derive(Debug)]
pub struct PushArea {
    register_space: u32,
    layout: Arc<SetLayout>,
    bindings: Vec<u32>,
    root_sampler_binding_offset: u32,
    samplers: Vec<Descriptor>,
}

impl PushArea {
    pub fn register_space(&self) -> u32 {
        self.register_space
    }

    pub fn layout(&self) -> &Arc<SetLayout> {
        &self.layout
    }

    /// Flat binding of every root descriptor, followed by every root sampler.
    pub fn bindings(&self) -> &[u32] {
        &self.bindings
    }

    /// Index of the first root sampler in [`PushArea::bindings`].
    pub fn root_sampler_binding_offset(&self) -> u32 {
        self.root_sampler_binding_offset
    }

    /// Immutable samplers baked into the layout.
    pub fn samplers(&self) -> &[Descriptor] {
        &self.samplers
    }
}

/// A compiled pipeline layout.
pub struct BindingLayout {
    driver: Arc<dyn Driver>,
    raw: RawPipelineLayout,
    sets: Vec<Arc<CompiledSet>>,
    set_layouts: Vec<Arc<SetLayout>>,
    root_constants: Vec<RootConstant>,
    push: Option<PushArea>,
}

impl std::fmt::Debug for BindingLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingLayout")
            .field("raw", &self.raw)
            .field("sets", &self.sets)
            .field("set_layouts", &self.set_layouts)
            .field("root_constants", &self.root_constants)
            .field("push", &self.push)
            .finish()
    }
}

impl BindingLayout {
    pub fn raw(&self) -> RawPipelineLayout {
        self.raw
    }

    /// Compiled sets in declaration order.
    pub fn sets(&self) -> &[Arc<CompiledSet>] {
        &self.sets
    }

    pub fn set(&self, index: u32) -> Option<&Arc<CompiledSet>> {
        self.sets.get(index as usize)
    }

    pub fn set_for_space(&self, register_space: u32) -> Option<&Arc<CompiledSet>> {
        self.sets
            .iter()
            .find(|set| set.register_space == register_space)
    }

    /// Native layouts indexed by register space, gaps filled with one shared empty layout.
    pub fn set_layouts(&self) -> &[Arc<SetLayout>] {
        &self.set_layouts
    }

    pub fn root_constants(&self) -> &[RootConstant] {
        &self.root_constants
    }

    pub fn push_area(&self) -> Option<&PushArea> {
        self.push.as_ref()
    }
}

impl Drop for BindingLayout {
    fn drop(&mut self) {
        self.driver.destroy_pipeline_layout(self.raw);
    }
}

/// Resource kinds a mutable binding may hold.
pub(crate) fn mutable_types(ray_tracing: bool) -> Vec<DescriptorType> {
    let mut types = vec![
        DescriptorType::Texture,
        DescriptorType::StorageTexture,
        DescriptorType::Buffer,
        DescriptorType::StorageBuffer,
        DescriptorType::ConstantBuffer,
        DescriptorType::StructuredBuffer,
        DescriptorType::StorageStructuredBuffer,
    ];
    if ray_tracing {
        types.push(DescriptorType::AccelerationStructure);
    }
    types
}

fn flat_binding(offsets: &BindingOffsets, ty: DescriptorType, register_index: u32) -> Result<u32> {
    register_index
        .checked_add(offsets.get(ty))
        .ok_or_else(|| Error::invalid(format!("register {register_index} of {ty:?} overflows")))
}

/// Flat binding intervals already taken in one set, as `first..end`.
#[derive(Default)]
struct Occupancy(Vec<(u32, u32)>);

impl Occupancy {
    fn claim(&mut self, register_space: u32, first: u32, count: u32) -> Result<()> {
        let end = first.checked_add(count).ok_or_else(|| {
            Error::invalid(format!("bindings {first}+{count} overflow in space {register_space}"))
        })?;
        if let Some(&(taken, taken_end)) = self
            .0
            .iter()
            .find(|&&(taken, taken_end)| first < taken_end && taken < end)
        {
            return Err(Error::invalid(format!(
                "bindings {first}..{end} overlap {taken}..{taken_end} in space {register_space}"
            )));
        }
        self.0.push((first, end));
        Ok(())
    }

    fn max(&self) -> Option<u32> {
        self.0.iter().map(|&(_, end)| end - 1).max()
    }
}

/// A declared set, validated but not yet created natively.
struct SetPlan {
    register_space: u32,
    ranges: Vec<RangeMapping>,
    heap_descriptor_num: HeapCounts,
    counts: DescriptorCounts,
    info: SetLayoutInfo,
}

/// The push set, validated but not yet created natively.
struct PushPlan {
    bindings: Vec<SetLayoutBinding>,
    flat: Vec<u32>,
}

fn plan_set(
    desc: &DescriptorSetDesc,
    offsets: &BindingOffsets,
    stages: ShaderStages,
    limits: &DeviceLimits,
) -> Result<SetPlan> {
    let space = desc.register_space;
    let mut occupancy = Occupancy::default();
    let mut ranges = Vec::with_capacity(desc.ranges.len());
    let mut bindings = vec![];
    let mut heap_descriptor_num = HeapCounts::default();
    let mut counts = DescriptorCounts::default();

    for (index, range) in desc.ranges.iter().enumerate() {
        let ty = range.descriptor_type;
        ensure!(
            range.descriptor_num != 0,
            "range {index} in space {space} is empty"
        );
        let mutable = range.flags.contains(DescriptorRangeFlags::MUTABLE);
        ensure!(
            !(mutable && ty == DescriptorType::Sampler),
            "range {index} in space {space}: samplers can't be mutable"
        );
        let is_variable = range
            .flags
            .contains(DescriptorRangeFlags::VARIABLE_SIZED_ARRAY);
        ensure!(
            !is_variable || index + 1 == desc.ranges.len(),
            "range {index} in space {space}: only the last range may be variable-sized"
        );
        let is_array = is_variable || range.flags.contains(DescriptorRangeFlags::ARRAY);

        let base_binding = flat_binding(offsets, ty, range.base_register_index)?;
        if is_variable {
            ensure!(
                occupancy.max().map_or(true, |max| base_binding > max),
                "range {index} in space {space}: a variable-sized range needs the highest binding"
            );
        }
        occupancy.claim(space, base_binding, if is_array { 1 } else { range.descriptor_num })?;

        let heap_type = ty.heap_type();
        let heap_offset = heap_descriptor_num.get(heap_type);
        *heap_descriptor_num.get_mut(heap_type) = heap_offset
            .checked_add(range.descriptor_num)
            .ok_or_else(|| Error::invalid(format!("space {space} has too many descriptors")))?;
        let heap_size = match heap_type {
            HeapType::Resource => limits.resource_heap_size,
            HeapType::Sampler => limits.sampler_heap_size,
        };
        if heap_descriptor_num.get(heap_type) > heap_size {
            return Err(Error::failure(format!(
                "space {space} needs {} {heap_type:?} descriptors, device heap holds {heap_size}",
                heap_descriptor_num.get(heap_type)
            )));
        }
        let counter = counts.entry(ty, mutable);
        *counter = counter
            .checked_add(range.descriptor_num)
            .ok_or_else(|| Error::invalid(format!("space {space} has too many descriptors")))?;

        let kind = if mutable {
            BindingKind::Mutable(mutable_types(limits.ray_tracing))
        } else {
            BindingKind::Single(ty)
        };
        let mut flags = BindingFlags::empty();
        if range.flags.contains(DescriptorRangeFlags::PARTIALLY_BOUND) {
            flags |= BindingFlags::PARTIALLY_BOUND;
        }
        if range.flags.contains(DescriptorRangeFlags::ALLOW_UPDATE_AFTER_SET) {
            flags |= BindingFlags::UPDATE_AFTER_BIND;
        }
        if is_variable {
            flags |= BindingFlags::VARIABLE_COUNT;
        }
        let range_stages = if range.shader_stages.is_empty() {
            stages
        } else {
            range.shader_stages
        };

        let mapping = RangeMapping {
            descriptor_type: ty,
            kind,
            descriptor_num: range.descriptor_num,
            base_binding,
            heap_type,
            heap_offset,
            is_array,
            is_variable,
            flags: range.flags,
        };
        let binding_num = if is_array { 1 } else { range.descriptor_num };
        bindings.extend((0..binding_num).map(|j| SetLayoutBinding {
            binding: mapping.native_slot(j).0,
            kind: mapping.kind.clone(),
            count: if is_array { range.descriptor_num } else { 1 },
            stages: range_stages,
            flags,
            immutable_samplers: vec![],
        }));
        ranges.push(mapping);
    }

    let mut set_flags = SetLayoutFlags::empty();
    if desc.flags.contains(DescriptorSetFlags::ALLOW_UPDATE_AFTER_SET) {
        set_flags |= SetLayoutFlags::UPDATE_AFTER_BIND;
    }

    Ok(SetPlan {
        register_space: space,
        ranges,
        heap_descriptor_num,
        counts,
        info: SetLayoutInfo {
            bindings,
            flags: set_flags,
        },
    })
}

fn plan_push(
    desc: &PipelineLayoutDesc,
    offsets: &BindingOffsets,
) -> Result<PushPlan> {
    let space = desc.root_register_space;
    let mut occupancy = Occupancy::default();
    let mut bindings = vec![];
    let mut flat = vec![];

    for root in &desc.root_descriptors {
        ensure!(
            matches!(
                root.descriptor_type,
                DescriptorType::ConstantBuffer
                    | DescriptorType::StructuredBuffer
                    | DescriptorType::StorageStructuredBuffer
            ),
            "{:?} can't be a root descriptor",
            root.descriptor_type
        );
        let binding = flat_binding(offsets, root.descriptor_type, root.register_index)?;
        occupancy.claim(space, binding, 1)?;
        flat.push(binding);
        bindings.push(SetLayoutBinding {
            binding,
            kind: BindingKind::Single(root.descriptor_type),
            count: 1,
            stages: or_layout_stages(root.shader_stages, desc.shader_stages),
            flags: BindingFlags::empty(),
            immutable_samplers: vec![],
        });
    }
    for root in &desc.root_samplers {
        let binding = flat_binding(offsets, DescriptorType::Sampler, root.register_index)?;
        occupancy.claim(space, binding, 1)?;
        flat.push(binding);
        // Immutable samplers are filled in once created.
        bindings.push(SetLayoutBinding {
            binding,
            kind: BindingKind::Single(DescriptorType::Sampler),
            count: 1,
            stages: or_layout_stages(root.shader_stages, desc.shader_stages),
            flags: BindingFlags::empty(),
            immutable_samplers: vec![],
        });
    }

    Ok(PushPlan { bindings, flat })
}

fn or_layout_stages(stages: ShaderStages, layout: ShaderStages) -> ShaderStages {
    if stages.is_empty() {
        layout
    } else {
        stages
    }
}

fn plan_root_constants(desc: &PipelineLayoutDesc) -> Result<Vec<RootConstant>> {
    let mut offset = 0u32;
    let mut constants = Vec::with_capacity(desc.root_constants.len());
    for root in &desc.root_constants {
        ensure!(
            root.size != 0 && root.size % 4 == 0,
            "root constant b{} is {}B, not a positive multiple of 4",
            root.register_index,
            root.size
        );
        constants.push(RootConstant {
            register_index: root.register_index,
            offset,
            size: root.size,
            stages: or_layout_stages(root.shader_stages, desc.shader_stages),
        });
        offset = offset
            .checked_add(root.size)
            .ok_or_else(|| Error::invalid("root constants overflow"))?;
    }
    Ok(constants)
}

impl Device {
    fn new_set_layout(&self, info: &SetLayoutInfo) -> Result<Arc<SetLayout>> {
        let raw = self.driver().create_set_layout(info)?;
        Ok(Arc::new(SetLayout {
            driver: self.driver().clone(),
            raw,
        }))
    }

    /// Compiles `desc` into native set layouts and a pipeline layout.
    ///
    /// Declarations are fully validated before anything is created natively.
    pub fn create_binding_layout(&self, desc: &PipelineLayoutDesc) -> Result<BindingLayout> {
        let offsets = if desc.flags.contains(PipelineLayoutFlags::IGNORE_GLOBAL_OFFSETS) {
            BindingOffsets::ZERO
        } else {
            self.config().binding_offsets
        };
        let limits = self.limits();
        let has_push = !desc.root_descriptors.is_empty() || !desc.root_samplers.is_empty();

        let mut spaces = AHashSet::new();
        if has_push {
            spaces.insert(desc.root_register_space);
        }
        let mut plans = Vec::with_capacity(desc.descriptor_sets.len());
        for set in &desc.descriptor_sets {
            ensure!(
                spaces.insert(set.register_space),
                "register space {} is used twice",
                set.register_space
            );
            plans.push(plan_set(set, &offsets, desc.shader_stages, limits)?);
        }
        let push = if has_push {
            Some(plan_push(desc, &offsets)?)
        } else {
            None
        };
        let root_constants = plan_root_constants(desc)?;

        // Everything below is bounded by the device rather than by the declaration.
        let max_space = spaces.iter().copied().max();
        let space_num = match max_space {
            Some(max) => max
                .checked_add(1)
                .filter(|&num| num <= limits.max_bound_descriptor_sets),
            None => Some(0),
        }
        .ok_or_else(|| {
            Error::failure(format!(
                "register space {} is out of range, device binds at most {} sets",
                max_space.unwrap_or_default(),
                limits.max_bound_descriptor_sets
            ))
        })?;
        let push_constant_size: u32 = root_constants.iter().map(|c| c.size).sum();
        if push_constant_size > limits.max_push_constant_size {
            return Err(Error::failure(format!(
                "{push_constant_size}B of root constants, device allows {}B",
                limits.max_push_constant_size
            )));
        }
        if let Some(push) = &push {
            if push.bindings.len() as u64 > limits.max_push_descriptors as u64 {
                return Err(Error::failure(format!(
                    "{} push descriptors, device allows {}",
                    push.bindings.len(),
                    limits.max_push_descriptors
                )));
            }
        }
        let uses_mutable = plans
            .iter()
            .any(|plan| plan.ranges.iter().any(RangeMapping::is_mutable));
        if uses_mutable && !limits.mutable_descriptors {
            return Err(Error::failure("device doesn't support mutable descriptors"));
        }

        let mut sets = Vec::with_capacity(plans.len());
        for plan in plans {
            let layout = self.new_set_layout(&plan.info)?;
            sets.push(Arc::new(CompiledSet {
                register_space: plan.register_space,
                ranges: plan.ranges,
                heap_descriptor_num: plan.heap_descriptor_num,
                counts: plan.counts,
                update_after_bind: plan.info.flags.contains(SetLayoutFlags::UPDATE_AFTER_BIND),
                layout,
            }));
        }

        let push = match push {
            Some(mut plan) => {
                let samplers = desc
                    .root_samplers
                    .iter()
                    .map(|root| self.create_sampler(&root.desc))
                    .collect::<Result<Vec<_>>>()?;
                let root_descriptor_num = desc.root_descriptors.len();
                for (binding, sampler) in plan.bindings[root_descriptor_num..]
                    .iter_mut()
                    .zip(&samplers)
                {
                    if let NativeView::Sampler(raw) = sampler.view() {
                        binding.immutable_samplers.push(*raw);
                    }
                }
                let layout = self.new_set_layout(&SetLayoutInfo {
                    bindings: plan.bindings,
                    flags: SetLayoutFlags::PUSH,
                })?;
                Some(PushArea {
                    register_space: desc.root_register_space,
                    layout,
                    bindings: plan.flat,
                    root_sampler_binding_offset: root_descriptor_num as u32,
                    samplers,
                })
            }
            None => None,
        };

        let mut placeholder = None;
        let mut set_layouts = Vec::with_capacity(space_num as usize);
        for space in 0..space_num {
            let declared = sets
                .iter()
                .find(|set| set.register_space == space)
                .map(|set| set.layout.clone())
                .or_else(|| {
                    push.as_ref()
                        .filter(|push| push.register_space == space)
                        .map(|push| push.layout.clone())
                });
            let layout = match declared {
                Some(layout) => layout,
                None => match &placeholder {
                    Some(layout) => Arc::clone(layout),
                    None => {
                        let layout = self.new_set_layout(&SetLayoutInfo::default())?;
                        placeholder = Some(layout.clone());
                        layout
                    }
                },
            };
            set_layouts.push(layout);
        }

        let raw_layouts = set_layouts.iter().map(|layout| layout.raw).collect::<Vec<_>>();
        let push_constants = root_constants
            .iter()
            .map(|constant| PushConstantRange {
                stages: constant.stages,
                offset: constant.offset,
                size: constant.size,
            })
            .collect::<Vec<_>>();
        let raw = self
            .driver()
            .create_pipeline_layout(&raw_layouts, &push_constants)?;

        log::debug!(
            "compiled binding layout {raw:?}: {} sets over {space_num} spaces ({} gaps), {}B of root constants, {} push descriptors",
            sets.len(),
            set_layouts.len() - sets.len() - push.is_some() as usize,
            push_constant_size,
            push.as_ref().map_or(0, |push| push.bindings.len())
        );

        Ok(BindingLayout {
            driver: self.driver().clone(),
            raw,
            sets,
            set_layouts,
            root_constants,
            push,
        })
    }
}
