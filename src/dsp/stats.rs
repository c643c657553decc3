// Order statistics via in-place selection.
//
// Everything funnels through `select_nth_unstable_by`, which gives expected
// linear time without a full sort. All helpers reorder the slice they are
// given, so callers pass scratch copies they do not mind losing.

use std::cmp::Ordering;

fn by_value(a: &f32, b: &f32) -> Ordering {
    a.partial_cmp(b).unwrap_or(Ordering::Equal)
}

/// k-th smallest element of `values` (0-based), selected in place.
pub fn kth_smallest(values: &mut [f32], k: usize) -> f32 {
    debug_assert!(k < values.len());
    let (_, kth, _) = values.select_nth_unstable_by(k, by_value);
    *kth
}

/// Median of `values`, selected in place. Even lengths take the upper of
/// the two middle elements; the analysis only ever uses the median as a
/// robust level estimate, so the half-sample bias is irrelevant.
pub fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    kth_smallest(values, values.len() / 2)
}

/// Mean of `values` after discarding the largest outliers, in place.
///
/// Tiered by sample count: up to 5 values drop only the maximum, up to 10
/// drop the two largest, and anything bigger drops the top 20%. The tiers
/// keep the estimator usable for the handful of entries a short window
/// contributes per phase bin while still rejecting burst noise on long
/// windows.
pub fn trimmed_mean(values: &mut [f32]) -> f32 {
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    if n == 1 {
        return values[0];
    }

    let keep = if n <= 5 {
        n - 1
    } else if n <= 10 {
        n - 2
    } else {
        n - n / 5
    };

    // Partition so the kept smallest values occupy the front.
    values.select_nth_unstable_by(keep, by_value);
    let kept = &values[..keep];
    let sum: f64 = kept.iter().map(|&v| v as f64).sum();
    (sum / keep as f64) as f32
}
