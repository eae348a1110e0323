//! Decode-time downsampling policy

/// Choose a power-of-two sample factor for decoding `source` pixels towards
/// `target` pixels.
///
/// Starting from half the source dimension, the factor doubles while the
/// halved dimension still exceeds the target. The decoded dimension ends up
/// between `target` and roughly `2 * target`, which bounds decoded memory
/// without dropping below the requested size. A `target` of `0` disables
/// downsampling.
pub fn plan_sample_size(source: u32, target: u32) -> u32 {
    if target == 0 {
        return 1;
    }

    let mut factor = 1;
    let mut dim = source >> 1;
    while dim > target {
        factor <<= 1;
        dim >>= 1;
    }
    factor
}

/// Pick the source dimension a plan is based on.
///
/// With `use_width` the width alone is compared to the target; otherwise the
/// larger of width and height is.
pub fn planning_dimension(width: u32, height: u32, use_width: bool) -> u32 {
    if use_width {
        width
    } else {
        width.max(height)
    }
}
