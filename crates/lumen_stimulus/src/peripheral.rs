//! Context-alignment amplification.
//!
//! A stimulus that lines up unusually well with the current context
//! (relative to recent stimuli) gets a budget boost of `1 + amplification`.

use lumen_core::numeric::{cosine_similarity, mean_std};
use serde::Serialize;
use std::collections::VecDeque;

const STD_EPSILON: f64 = 1e-8;

#[derive(Debug, Clone, Serialize)]
pub struct PeripheralStats {
    pub observations: usize,
    pub ready: bool,
    pub mean_alignment: f64,
    pub std_alignment: f64,
}

#[derive(Debug, Clone)]
pub struct PeripheralAmplifier {
    cohort_size: usize,
    min_cohort: usize,
    max_amplification: f64,
    alignments: VecDeque<f64>,
}

impl PeripheralAmplifier {
    pub fn new(cohort_size: usize, min_cohort: usize, max_amplification: f64) -> Self {
        let cohort_size = cohort_size.max(min_cohort).max(2);
        Self {
            cohort_size,
            min_cohort,
            max_amplification: max_amplification.max(0.0),
            alignments: VecDeque::with_capacity(cohort_size),
        }
    }

    /// Highest cosine similarity between the stimulus and any context chunk.
    pub fn context_alignment(stimulus: &[f32], context: &[Vec<f32>]) -> Option<f64> {
        context
            .iter()
            .map(|c| cosine_similarity(stimulus, c))
            .reduce(f64::max)
    }

    /// Amplification ∈ [0, max_amplification]: the z-score of this stimulus'
    /// alignment within the cohort of previous alignments. The alignment is
    /// recorded whenever it can be computed, including during bootstrap.
    pub fn amplify(&mut self, stimulus: &[f32], context: &[Vec<f32>]) -> f64 {
        let Some(alignment) = Self::context_alignment(stimulus, context) else {
            return 0.0;
        };
        let ready = self.alignments.len() >= self.min_cohort;
        let z = if ready { self.z_score(alignment) } else { 0.0 };

        if self.alignments.len() >= self.cohort_size {
            self.alignments.pop_front();
        }
        self.alignments.push_back(alignment);

        if !ready {
            tracing::debug!(
                "Peripheral amplifier bootstrapping ({}/{} samples)",
                self.alignments.len(),
                self.min_cohort
            );
        }
        z.clamp(0.0, self.max_amplification)
    }

    fn z_score(&self, value: f64) -> f64 {
        if self.alignments.len() < 2 {
            return 0.0;
        }
        let (mean, std) = mean_std(&self.alignments);
        if std < STD_EPSILON {
            0.0
        } else {
            (value - mean) / std
        }
    }

    pub fn len(&self) -> usize {
        self.alignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alignments.is_empty()
    }

    pub fn stats(&self) -> PeripheralStats {
        let (mean, std) = mean_std(&self.alignments);
        PeripheralStats {
            observations: self.alignments.len(),
            ready: self.alignments.len() >= self.min_cohort,
            mean_alignment: mean,
            std_alignment: std,
        }
    }

    pub fn reset(&mut self) {
        self.alignments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_context_no_amplification() {
        let mut amp = PeripheralAmplifier::new(100, 20, 3.0);
        assert_eq!(amp.amplify(&[1.0, 0.0], &[]), 0.0);
        assert!(amp.is_empty());
    }

    #[test]
    fn test_bootstrap_records_but_returns_zero() {
        let mut amp = PeripheralAmplifier::new(100, 20, 3.0);
        for _ in 0..19 {
            assert_eq!(amp.amplify(&[1.0, 0.0], &[vec![0.0, 1.0]]), 0.0);
        }
        assert_eq!(amp.len(), 19);
    }

    #[test]
    fn test_aligned_outlier_is_amplified_and_capped() {
        let mut amp = PeripheralAmplifier::new(100, 20, 3.0);
        let ctx = vec![vec![1.0, 0.0]];
        for i in 0..40 {
            // Weakly aligned stimuli, alternating between two alignments.
            let x = if i % 2 == 0 { 0.1 } else { 0.5 };
            amp.amplify(&[x, 1.0], &ctx);
        }
        let a = amp.amplify(&[1.0, 0.0], &ctx);
        assert_eq!(a, 3.0);
    }

    #[test]
    fn test_constant_cohort_gives_zero() {
        let mut amp = PeripheralAmplifier::new(100, 5, 3.0);
        let ctx = vec![vec![1.0, 0.0]];
        for _ in 0..10 {
            amp.amplify(&[1.0, 0.0], &ctx);
        }
        assert_eq!(amp.amplify(&[1.0, 0.0], &ctx), 0.0);
    }

    #[test]
    fn test_cohort_bounded() {
        let mut amp = PeripheralAmplifier::new(10, 5, 3.0);
        for _ in 0..30 {
            amp.amplify(&[1.0, 0.0], &[vec![1.0, 1.0]]);
        }
        assert_eq!(amp.len(), 10);
    }
}
