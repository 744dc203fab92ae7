/// The texel formats the binding core needs to reason about.
///
/// Only the properties that influence views are modelled: integer-ness, depth/stencil aspects
/// and texel stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    /// Inherit the resource's format, or describe a structured/raw buffer view.
    #[default]
    Unknown,
    R8Unorm,
    R8Uint,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Rgba8Uint,
    Bgra8Unorm,
    R16Float,
    R16Uint,
    Rgba16Float,
    R32Uint,
    R32Sint,
    R32Float,
    Rg32Float,
    Rgba32Uint,
    Rgba32Float,
    D16Unorm,
    D32Float,
    D24UnormS8Uint,
    D32FloatS8Uint,
}

impl Format {
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Format::R8Uint
                | Format::Rgba8Uint
                | Format::R16Uint
                | Format::R32Uint
                | Format::R32Sint
                | Format::Rgba32Uint
        )
    }

    pub fn has_depth(self) -> bool {
        matches!(
            self,
            Format::D16Unorm | Format::D32Float | Format::D24UnormS8Uint | Format::D32FloatS8Uint
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, Format::D24UnormS8Uint | Format::D32FloatS8Uint)
    }

    /// Bytes per texel, 0 for [`Format::Unknown`].
    pub fn stride(self) -> u32 {
        match self {
            Format::Unknown => 0,
            Format::R8Unorm | Format::R8Uint => 1,
            Format::Rg8Unorm | Format::R16Float | Format::R16Uint | Format::D16Unorm => 2,
            Format::Rgba8Unorm
            | Format::Rgba8Srgb
            | Format::Rgba8Uint
            | Format::Bgra8Unorm
            | Format::R32Uint
            | Format::R32Sint
            | Format::R32Float
            | Format::D32Float
            | Format::D24UnormS8Uint => 4,
            Format::Rgba16Float | Format::Rg32Float | Format::D32FloatS8Uint => 8,
            Format::Rgba32Uint | Format::Rgba32Float => 16,
        }
    }
}
