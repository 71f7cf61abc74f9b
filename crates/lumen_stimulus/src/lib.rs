//! # Lumen stimulus
//!
//! Turns an external stimulus into per-node energy deltas.
//!
//! ## Pipeline
//!
//! 1. **Coverage**: keep the shortest similarity prefix reaching ĉ = 1 − e^−H
//! 2. **Budget**: similarity mass × f(ρ) × g(source) × (1 + amplification)
//! 3. **Distribution**: top-up toward thresholds plus s^γ amplification
//!
//! The three learned factors stay neutral (1.0, 1.0, 0.0) until they have
//! seen enough frames.

pub mod coverage;
pub mod distribution;
pub mod health;
pub mod injector;
pub mod isotonic;
pub mod peripheral;
pub mod source_gate;

pub use coverage::{entropy, select, Candidate, Selection};
pub use distribution::{compute_lambda, distribute, Distribution, DistributionParams, NodeDelta};
pub use health::{FrameObservation, HealthModulator, HealthStats};
pub use injector::{
    apply_injection, AppliedInjection, BudgetBreakdown, InjectionResult, InjectorStats,
    InjectorToggles, StimulusInjector,
};
pub use isotonic::IsotonicFit;
pub use peripheral::{PeripheralAmplifier, PeripheralStats};
pub use source_gate::{SourceImpactGate, SourceStats};
