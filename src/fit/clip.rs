//! Robust transforms of local-energy batches and importance weights.

/// Smooth odd squashing function: linear near zero, logarithmic in the tails.
///
/// log_squeeze(z) = sign(z) · ln(1 + (|z| + |z|²/2 + |z|³) / (1 + |z|²))
pub fn log_squeeze(x: f64) -> f64 {
    let z = x.abs();
    let squeezed = ((z + 0.5 * z * z + z * z * z) / (1.0 + z * z)).ln_1p();
    if x < 0.0 {
        -squeezed
    } else {
        squeezed
    }
}

/// Linearly interpolated quantile (same convention as numpy's default).
///
/// Returns NaN for an empty slice.
pub fn quantile(xs: &[f64], q: f64) -> f64 {
    if xs.is_empty() {
        return f64::NAN;
    }
    let mut sorted = xs.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo])
}

pub fn median(xs: &[f64]) -> f64 {
    quantile(xs, 0.5)
}

/// Output of [`median_log_squeeze`].
#[derive(Clone, Debug, PartialEq)]
pub struct Squeezed {
    /// Clipped values, re-centred on the median.
    pub values: Vec<f64>,
    /// |x - median| in units of the `quantile`-th percentile of |x - median|.
    pub deviation: Vec<f64>,
}

/// Squeeze a batch around its median.
///
/// The half-width is `width` times the `quantile`-th percentile of the
/// absolute deviations from the median. A batch whose robust scale is zero
/// is passed through unchanged with zero deviation scores.
pub fn median_log_squeeze(x: &[f64], width: f64, quantile_level: f64) -> Squeezed {
    let center = median(x);
    let diff: Vec<f64> = x.iter().map(|xi| xi - center).collect();
    let abs_diff: Vec<f64> = diff.iter().map(|d| d.abs()).collect();
    let scale = quantile(&abs_diff, quantile_level);

    if !(scale > 0.0) || !scale.is_finite() {
        return Squeezed {
            values: x.to_vec(),
            deviation: vec![0.0; x.len()],
        };
    }

    let half_width = width * scale;
    Squeezed {
        values: diff
            .iter()
            .map(|d| center + 2.0 * half_width * log_squeeze(d / (2.0 * half_width)))
            .collect(),
        deviation: abs_diff.iter().map(|d| d / scale).collect(),
    }
}

/// Turn log-weights into linear weights with mean one.
///
/// Shifts by the maximum before exponentiating so large log-weights do not
/// overflow.
pub fn exp_normalize_mean(log_weights: &[f64]) -> Vec<f64> {
    if log_weights.is_empty() {
        return Vec::new();
    }
    let max = log_weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let weights: Vec<f64> = log_weights.iter().map(|lw| (lw - max).exp()).collect();
    let mean = weights.iter().sum::<f64>() / weights.len() as f64;
    weights.into_iter().map(|w| w / mean).collect()
}

/// Mean of `x` over the entries where `mask` is set; zero if none are.
pub fn masked_mean(x: &[f64], mask: &[bool]) -> f64 {
    let (sum, count) = x
        .iter()
        .zip(mask.iter())
        .filter(|(_, keep)| **keep)
        .fold((0.0_f64, 0usize), |(sum, count), (xi, _)| (sum + *xi, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_log_squeeze_is_odd_and_linear_near_zero() {
        for z in [1e-4, 0.3, 2.0, 50.0] {
            assert_relative_eq!(log_squeeze(-z), -log_squeeze(z), epsilon = 1e-15);
        }
        assert_eq!(log_squeeze(0.0), 0.0);
        assert_relative_eq!(log_squeeze(1e-6), 1e-6, epsilon = 1e-12);
    }

    #[test]
    fn test_log_squeeze_slope_vanishes_in_tails() {
        let h = 1e-3;
        let mut previous = f64::INFINITY;
        for z in [10.0, 100.0, 1e4, 1e6] {
            let slope = (log_squeeze(z + h) - log_squeeze(z - h)) / (2.0 * h);
            assert!(slope > 0.0 && slope < previous, "slope {} at {}", slope, z);
            previous = slope;
        }
        assert!(previous < 1e-5);
    }

    #[test]
    fn test_quantile_interpolates() {
        let xs = [4.0, 1.0, 3.0, 2.0];
        assert_relative_eq!(quantile(&xs, 0.95), 3.85, epsilon = 1e-12);
        assert_relative_eq!(median(&xs), 2.5, epsilon = 1e-12);
        assert_relative_eq!(median(&[5.0, 1.0, 3.0]), 3.0, epsilon = 1e-12);
        assert!(quantile(&[], 0.5).is_nan());
    }

    #[test]
    fn test_median_log_squeeze_bounds_heavy_tails() {
        let mut x: Vec<f64> = (0..100).map(|i| -1.0 + 0.01 * i as f64).collect();
        x.push(1e12);
        x.push(-1e12);
        let squeezed = median_log_squeeze(&x, 1.0, 0.95);

        assert!(squeezed.values.iter().all(|v| v.is_finite()));
        let max = squeezed.values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        assert!(max < 100.0, "outlier only squeezed to {}", max);
        assert!(squeezed.deviation[100] > 1e10);

        // sensitivity of the clipped outlier to its raw value is tiny
        let mut shifted = x.clone();
        shifted[100] += 1e6;
        let moved = median_log_squeeze(&shifted, 1.0, 0.95).values[100] - squeezed.values[100];
        assert!(moved.abs() < 1e-3);
    }

    #[test]
    fn test_median_log_squeeze_zero_scale_passes_through() {
        let x = vec![2.0; 20];
        let squeezed = median_log_squeeze(&x, 1.0, 0.95);
        assert_eq!(squeezed.values, x);
        assert!(squeezed.deviation.iter().all(|&d| d == 0.0));
    }

    #[test]
    fn test_exp_normalize_mean() {
        let weights = exp_normalize_mean(&[1000.0, 999.0, 998.0, -50.0]);
        assert!(weights.iter().all(|w| w.is_finite() && *w >= 0.0));
        let mean = weights.iter().sum::<f64>() / weights.len() as f64;
        assert_relative_eq!(mean, 1.0, epsilon = 1e-12);
        assert_relative_eq!(weights[0] / weights[1], 1.0_f64.exp(), epsilon = 1e-10);

        assert_eq!(exp_normalize_mean(&[0.0; 3]), vec![1.0; 3]);
    }

    #[test]
    fn test_masked_mean() {
        assert_relative_eq!(masked_mean(&[1.0, 100.0, 3.0], &[true, false, true]), 2.0);
        assert_eq!(masked_mean(&[1.0, 2.0], &[false, false]), 0.0);
    }

    proptest! {
        #[test]
        fn prop_weights_non_negative_with_unit_mean(
            log_weights in prop::collection::vec(-700.0f64..700.0, 1..64),
        ) {
            let weights = exp_normalize_mean(&log_weights);
            prop_assert_eq!(weights.len(), log_weights.len());
            prop_assert!(weights.iter().all(|w| w.is_finite() && *w >= 0.0));
            let mean = weights.iter().sum::<f64>() / weights.len() as f64;
            prop_assert!((mean - 1.0).abs() < 1e-9, "mean {}", mean);
        }

        #[test]
        fn prop_squeeze_finite_and_contracts_toward_median(
            x in prop::collection::vec(-1e12f64..1e12, 1..64),
            width in 0.1f64..10.0,
            level in 0.5f64..0.99,
        ) {
            let center = median(&x);
            let squeezed = median_log_squeeze(&x, width, level);
            prop_assert_eq!(squeezed.values.len(), x.len());
            let tolerance = 1e-9 * center.abs().max(1.0);
            for ((xi, vi), di) in x.iter().zip(&squeezed.values).zip(&squeezed.deviation) {
                prop_assert!(vi.is_finite());
                prop_assert!(di.is_finite() && *di >= 0.0);
                let raw = xi - center;
                let clipped = vi - center;
                prop_assert!(clipped.abs() <= raw.abs() * (1.0 + 1e-9) + tolerance);
                prop_assert!(raw * clipped >= 0.0);
            }
        }

        #[test]
        fn prop_log_squeeze_slope_bounded(z in -1e6f64..1e6) {
            let h = 1e-6 * z.abs().max(1.0);
            let slope = (log_squeeze(z + h) - log_squeeze(z - h)) / (2.0 * h);
            prop_assert!((0.0..=1.0 + 1e-6).contains(&slope), "slope {} at {}", slope, z);
            prop_assert!(log_squeeze(z).abs() <= z.abs() * (1.0 + 1e-12));
        }
    }
}
