//! Relative-variation measure shared by the tracker and the visit sessions.

/// Default relative variation below which a signal counts as stable.
pub const DEFAULT_VARIATION_THRESHOLD: f32 = 0.15;

/// Spread of a series relative to its mean: `(max - min) / mean`.
///
/// Returns `0.0` for fewer than two values and `f32::INFINITY` when the mean
/// is not positive (a series of zeros carries no usable signal).
pub fn relative_variation<I>(values: I) -> f32
where
    I: IntoIterator<Item = f32>,
{
    let mut count = 0usize;
    let mut sum = 0.0f32;
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;

    for v in values {
        count += 1;
        sum += v;
        min = min.min(v);
        max = max.max(v);
    }

    if count < 2 {
        return 0.0;
    }

    let mean = sum / count as f32;
    if mean <= 0.0 {
        return f32::INFINITY;
    }
    (max - min) / mean
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_series_has_no_variation() {
        assert_eq!(relative_variation([0.9, 0.9, 0.9]), 0.0);
    }

    #[test]
    fn test_single_value() {
        assert_eq!(relative_variation([0.5]), 0.0);
        assert_eq!(relative_variation(std::iter::empty()), 0.0);
    }

    #[test]
    fn test_erratic_series_exceeds_threshold() {
        let v = relative_variation([0.95, 0.6, 0.95, 0.6]);
        assert!(v > DEFAULT_VARIATION_THRESHOLD);
    }

    #[test]
    fn test_known_value() {
        // range 0.2, mean 1.0
        assert!((relative_variation([0.9, 1.1, 1.0]) - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_zero_mean_is_unstable() {
        assert!(relative_variation([0.0, 0.0]).is_infinite());
    }
}
