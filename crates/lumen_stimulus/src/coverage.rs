//! Entropy-coverage candidate selection.
//!
//! A peaked similarity distribution (low entropy) needs only its head to
//! cover the stimulus; a flat one (high entropy) needs a wider prefix.

use lumen_core::NodeId;
use serde::{Deserialize, Serialize};

/// A node scored against the incoming stimulus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub node: NodeId,
    /// Similarity to the stimulus, expected in [0, 1].
    pub similarity: f64,
    pub energy: f64,
    pub threshold: f64,
}

impl Candidate {
    pub fn new(node: impl Into<NodeId>, similarity: f64, energy: f64, threshold: f64) -> Self {
        Self {
            node: node.into(),
            similarity,
            energy,
            threshold,
        }
    }

    pub fn gap(&self) -> f64 {
        (self.threshold - self.energy).max(0.0)
    }

    /// Gap as a fraction of the threshold, 0 when already active.
    pub fn deficit_norm(&self) -> f64 {
        if self.threshold <= 0.0 {
            0.0
        } else {
            self.gap() / self.threshold
        }
    }

    fn clean_similarity(&self) -> f64 {
        if self.similarity.is_finite() && self.similarity > 0.0 {
            self.similarity
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Selection {
    /// Chosen candidates, highest similarity first, similarities sanitized.
    pub selected: Vec<Candidate>,
    pub entropy: f64,
    pub coverage_target: f64,
    /// Similarity mass of the selected prefix.
    pub similarity_mass: f64,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    pub fn len(&self) -> usize {
        self.selected.len()
    }
}

/// Shannon entropy (nats) of a non-negative weight vector normalized to sum 1.
pub fn entropy(weights: &[f64]) -> f64 {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    let h = -weights
        .iter()
        .map(|w| w / total)
        .filter(|p| *p > 0.0)
        .map(|p| p * p.ln())
        .sum::<f64>();
    h.max(0.0)
}

/// Keep the shortest prefix (by descending similarity) whose share of the
/// similarity mass reaches ĉ = 1 − e^−H. Ties keep input order.
pub fn select(candidates: &[Candidate]) -> Selection {
    let mut cleaned: Vec<Candidate> = candidates
        .iter()
        .map(|c| Candidate {
            similarity: c.clean_similarity(),
            ..c.clone()
        })
        .collect();
    let total: f64 = cleaned.iter().map(|c| c.similarity).sum();
    if cleaned.is_empty() || total <= 0.0 {
        return Selection::default();
    }

    let weights: Vec<f64> = cleaned.iter().map(|c| c.similarity).collect();
    let h = entropy(&weights);
    let target = 1.0 - (-h).exp();

    // sort_by is stable
    cleaned.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));

    let mut mass = 0.0;
    let mut take = 0;
    for c in &cleaned {
        if c.similarity <= 0.0 {
            break;
        }
        mass += c.similarity;
        take += 1;
        if mass / total >= target {
            break;
        }
    }
    cleaned.truncate(take);

    Selection {
        selected: cleaned,
        entropy: h,
        coverage_target: target,
        similarity_mass: mass,
    }
}
