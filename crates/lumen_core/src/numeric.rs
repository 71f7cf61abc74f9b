//! Small numeric helpers shared across the pipeline.

/// Guard against NaN and Infinity.
/// If the value is NaN or Inf, replace with the provided fallback.
#[inline]
pub fn sanitize(v: f64, fallback: f64, label: &str) -> f64 {
    if v.is_finite() {
        v
    } else {
        tracing::warn!("NaN/Inf detected in {}, resetting to fallback {}", label, fallback);
        fallback
    }
}

#[inline]
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Cosine similarity; 0.0 when either vector is (near) zero or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom < 1e-8 {
        0.0
    } else {
        dot / denom
    }
}

/// Fraction of the cohort that is <= `value`. Neutral 0.5 for cohorts under 2.
pub fn rank_fraction<'a, I>(value: f64, cohort: I) -> f64
where
    I: IntoIterator<Item = &'a f64>,
{
    let mut n = 0usize;
    let mut rank = 0usize;
    for v in cohort {
        n += 1;
        if *v <= value {
            rank += 1;
        }
    }
    if n < 2 {
        0.5
    } else {
        rank as f64 / n as f64
    }
}

/// Population mean and standard deviation.
pub fn mean_std<'a, I>(values: I) -> (f64, f64)
where
    I: IntoIterator<Item = &'a f64>,
    I::IntoIter: Clone,
{
    let iter = values.into_iter();
    let n = iter.clone().count();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = iter.clone().sum::<f64>() / n as f64;
    let var = iter.map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    (mean, var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize(f64::NAN, 1.0, "x"), 1.0);
        assert_eq!(sanitize(2.0, 1.0, "x"), 2.0);
    }

    #[test]
    fn test_cosine() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_rank_fraction() {
        let cohort = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(rank_fraction(2.5, &cohort), 0.5);
        assert_eq!(rank_fraction(9.0, &cohort), 1.0);
        assert_eq!(rank_fraction(9.0, &[1.0]), 0.5);
    }

    #[test]
    fn test_mean_std() {
        let (m, s) = mean_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((m - 5.0).abs() < 1e-12);
        assert!((s - 2.0).abs() < 1e-12);
    }
}
