//! # Lumen dynamics
//!
//! The energy physics of the tick engine. Everything here is synchronous and
//! operates on a `&mut Graph` owned by the caller.
//!
//! ## Phases
//!
//! 1. **Diffusion**: conservative transfer along links, staged then applied
//! 2. **Decay**: fast energy decay, slow weight decay, emotion decay
//! 3. **Thresholds**: per-node adaptive activation floors
//! 4. **Criticality**: spectral-radius estimate and δ/α feedback control
//! 5. **Safe mode**: tripwire escalation into conservative parameters
//!
//! ## Time Scales
//!
//! - Every tick: diffusion, energy decay, thresholds
//! - Every few ticks: spectral-radius sampling
//! - Every minute: log-weight decay

pub mod criticality;
pub mod decay;
pub mod diffusion;
pub mod safe_mode;
pub mod targets;
pub mod threshold;

pub use criticality::{
    estimate_spectral_radius, BoundsCheck, BranchingTracker, CriticalityController,
    CriticalityMetrics, CriticalityMode, SafetyState, TransitionMatrix,
};
pub use decay::{decay_emotions, decay_energy, DecayReport, WeightDecay, WeightDecayReport};
pub use diffusion::{
    compute_frontier, diffuse, stage_diffusion, ConservationViolation, DeltaBuffer,
    DiffusionParams, DiffusionReport, Frontier,
};
pub use safe_mode::{
    SafeMode, SafeModeOverrides, SafeModeStatus, SafeModeTransition, TripwireType, Violation,
};
pub use targets::{ContextSignals, TargetSelector, TaskContext};
pub use threshold::{soft_activation, NoiseTracker, ThresholdOracle, ThresholdReport};
