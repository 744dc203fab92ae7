use std::num::NonZeroU64;

/// Returns `size` as a multiple of `alignment`. Same as `u64::next_multiple_of` for powers of two.
pub fn align(alignment: u64, size: u64) -> u64 {
    (size + alignment - 1) & !(alignment - 1)
}

/// Returns `size` as a multiple of `alignment`. See [align].
///
/// Returns `None` if the aligned value does not fit in a `u64`.
pub fn align_nonzero(alignment: NonZeroU64, size: NonZeroU64) -> Option<NonZeroU64> {
    let alignment = alignment.get();
    size.get()
        .checked_add(alignment - 1)
        .and_then(|x| NonZeroU64::new(x & !(alignment - 1)))
}

/// Resolves a possibly-sentinel element count against a total.
///
/// `requested == remaining` yields `total - offset`; anything else is taken verbatim. The
/// resolved range must lie within `0..total`.
pub fn resolve_count<T>(total: T, offset: T, requested: T, remaining: T) -> Option<T>
where
    T: Copy + Ord + std::ops::Sub<Output = T> + std::ops::Add<Output = T> + Default,
{
    if offset >= total {
        return None;
    }
    let count = if requested == remaining {
        total - offset
    } else {
        requested
    };
    (count > T::default() && count <= total - offset).then_some(count)
}
