use std::cmp::Ordering;

pub fn mean_f64(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Mean of the largest `fraction` of `values`.
///
/// At least one value always takes part, so any non-empty input yields a
/// result. `fraction` is clamped to `(0, 1]`.
pub fn top_fraction_mean(values: &[f64], fraction: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| descending(*a, *b));

    let fraction = fraction.clamp(f64::MIN_POSITIVE, 1.0);
    let count = ((sorted.len() as f64 * fraction).floor() as usize)
        .clamp(1, sorted.len());

    mean_f64(&sorted[..count])
}

fn descending(a: f64, b: f64) -> Ordering {
    b.total_cmp(&a)
}
