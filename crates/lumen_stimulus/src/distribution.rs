//! Dual-channel budget distribution.
//!
//! The budget is split by λ into a top-up channel, which pushes
//! under-threshold candidates toward activation (never past their gap), and
//! an amplifier channel, which reinforces the strongest matches with
//! weights s^γ. λ grows with the mean deficit and shrinks when similarity
//! mass is concentrated on a few candidates.

use lumen_core::config::StimulusConfig;
use lumen_core::numeric::sigmoid;
use lumen_core::NodeId;
use serde::Serialize;

use crate::coverage::Candidate;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DistributionParams {
    pub lambda_base: f64,
    pub lambda_min: f64,
    pub lambda_max: f64,
    pub k_deficit: f64,
    pub k_herfindahl: f64,
    pub topup_kappa: f64,
    pub amplifier_gamma: f64,
    pub negligible_delta: f64,
}

impl Default for DistributionParams {
    fn default() -> Self {
        Self::from(&StimulusConfig::default())
    }
}

impl From<&StimulusConfig> for DistributionParams {
    fn from(c: &StimulusConfig) -> Self {
        Self {
            lambda_base: c.lambda_base,
            lambda_min: c.lambda_min,
            lambda_max: c.lambda_max,
            k_deficit: c.k_deficit,
            k_herfindahl: c.k_herfindahl,
            topup_kappa: c.topup_kappa,
            amplifier_gamma: c.amplifier_gamma,
            negligible_delta: c.negligible_delta,
        }
    }
}

/// Energy to add to one node, split by channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeDelta {
    pub node: NodeId,
    pub delta: f64,
    pub topup: f64,
    pub amplifier: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Distribution {
    pub deltas: Vec<NodeDelta>,
    pub lambda: f64,
    pub topup_spent: f64,
    pub amplifier_spent: f64,
    /// True when the summed deltas exceeded the budget and were scaled down.
    pub rescaled: bool,
}

impl Distribution {
    pub fn total(&self) -> f64 {
        self.deltas.iter().map(|d| d.delta).sum()
    }
}

/// λ = clamp(λ_base + k_deficit·mean(gap/θ) − k_herf·(Σp² − 1/n), λ_min, λ_max)
pub fn compute_lambda(selected: &[Candidate], params: &DistributionParams) -> f64 {
    let n = selected.len();
    if n == 0 {
        return params.lambda_base.clamp(params.lambda_min, params.lambda_max);
    }
    let mean_deficit = selected.iter().map(Candidate::deficit_norm).sum::<f64>() / n as f64;
    let total: f64 = selected.iter().map(|c| c.similarity.max(0.0)).sum();
    let herfindahl = if total > 0.0 {
        selected
            .iter()
            .map(|c| (c.similarity.max(0.0) / total).powi(2))
            .sum::<f64>()
    } else {
        1.0 / n as f64
    };
    let lambda = params.lambda_base + params.k_deficit * mean_deficit
        - params.k_herfindahl * (herfindahl - 1.0 / n as f64);
    if lambda.is_finite() {
        lambda.clamp(params.lambda_min, params.lambda_max)
    } else {
        params.lambda_base.clamp(params.lambda_min, params.lambda_max)
    }
}

/// Split `budget` across the selected candidates. Pure; output follows
/// input order.
pub fn distribute(selected: &[Candidate], budget: f64, params: &DistributionParams) -> Distribution {
    if selected.is_empty() || !budget.is_finite() || budget <= 0.0 {
        return Distribution::default();
    }
    let lambda = compute_lambda(selected, params);
    let topup_budget = lambda * budget;
    let amplifier_budget = (1.0 - lambda) * budget;

    // Top-up channel: only nodes still below threshold, each capped at its gap.
    let topup_weights: Vec<f64> = selected
        .iter()
        .map(|c| {
            if c.gap() > 0.0 {
                sigmoid(params.topup_kappa * c.deficit_norm())
            } else {
                0.0
            }
        })
        .collect();
    let topup_total: f64 = topup_weights.iter().sum();
    let topups: Vec<f64> = selected
        .iter()
        .zip(&topup_weights)
        .map(|(c, w)| {
            if topup_total > 0.0 {
                (topup_budget * w / topup_total).min(c.gap())
            } else {
                0.0
            }
        })
        .collect();

    // Amplifier channel: s^γ, uncapped.
    let amp_weights: Vec<f64> = selected
        .iter()
        .map(|c| c.similarity.max(0.0).powf(params.amplifier_gamma))
        .collect();
    let amp_total: f64 = amp_weights.iter().sum();
    let amps: Vec<f64> = amp_weights
        .iter()
        .map(|w| if amp_total > 0.0 { amplifier_budget * w / amp_total } else { 0.0 })
        .collect();

    let mut deltas: Vec<NodeDelta> = selected
        .iter()
        .zip(topups.iter().zip(&amps))
        .map(|(c, (t, a))| NodeDelta {
            node: c.node.clone(),
            delta: t + a,
            topup: *t,
            amplifier: *a,
        })
        .collect();

    let total: f64 = deltas.iter().map(|d| d.delta).sum();
    let rescaled = total > budget;
    if rescaled {
        let scale = budget / total;
        for d in &mut deltas {
            d.delta *= scale;
            d.topup *= scale;
            d.amplifier *= scale;
        }
    }
    deltas.retain(|d| d.delta >= params.negligible_delta);

    Distribution {
        topup_spent: deltas.iter().map(|d| d.topup).sum(),
        amplifier_spent: deltas.iter().map(|d| d.amplifier).sum(),
        deltas,
        lambda,
        rescaled,
    }
}
