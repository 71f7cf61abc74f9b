//! Property-based tests for lumen_core.
//!
//! Uses proptest to verify invariants that must hold for ALL possible inputs:
//! emotion metadata stays bounded, configuration validation always produces
//! legal ranges, and graph seeds survive serialization.

use lumen_core::config::LumenConfig;
use lumen_core::numeric::{cosine_similarity, rank_fraction};
use lumen_core::{EmotionVector, Graph, GraphSeed, Link, Node, NodeKind, EMOTION_MAX_MAGNITUDE};
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

fn arb_components() -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-100.0f32..100.0, 0..8)
}

fn arb_graph() -> impl Strategy<Value = Graph> {
    (1usize..8, prop::collection::vec((0usize..8, 0usize..8, -3.0f64..2.0), 0..20), prop::collection::vec(0.0f64..20.0, 8))
        .prop_map(|(n, edges, energies)| {
            let mut g = Graph::new();
            for i in 0..n {
                g.insert_node(Node::new(format!("n{}", i), NodeKind::Concept).with_energy(energies[i]));
            }
            for (s, t, w) in edges {
                let _ = g.add_link(Link::new(format!("n{}", s % n), format!("n{}", t % n), w));
            }
            g
        })
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    /// Emotion vectors never exceed the magnitude cap, before or after decay.
    #[test]
    fn emotion_magnitude_bounded(c in arb_components(), rate in 0.0f64..1.0, dt in 0.0f64..100.0) {
        let mut e = EmotionVector::new(c);
        prop_assert!(e.magnitude() <= EMOTION_MAX_MAGNITUDE + 1e-5);
        e.decay(rate, dt);
        prop_assert!(e.magnitude() <= EMOTION_MAX_MAGNITUDE + 1e-5);
    }

    /// Validation yields ordered, finite ranges for any scheduler/threshold inputs.
    #[test]
    fn validated_config_has_ordered_ranges(
        min_i in -10.0f64..100.0,
        max_i in -10.0f64..100.0,
        tmin in -5.0f64..20.0,
        tmax in -5.0f64..20.0,
        alpha in -1.0f64..2.0,
    ) {
        let mut cfg = LumenConfig::default();
        cfg.scheduler.min_interval_secs = min_i;
        cfg.scheduler.max_interval_secs = max_i;
        cfg.threshold.theta_min = tmin;
        cfg.threshold.theta_max = tmax;
        cfg.diffusion.alpha = alpha;
        let cfg = cfg.validated();
        prop_assert!(cfg.scheduler.min_interval_secs > 0.0);
        prop_assert!(cfg.scheduler.max_interval_secs >= cfg.scheduler.min_interval_secs);
        prop_assert!(cfg.threshold.theta_min > 0.0);
        prop_assert!(cfg.threshold.theta_max >= cfg.threshold.theta_min);
        prop_assert!(cfg.diffusion.alpha >= cfg.criticality.alpha_min);
        prop_assert!(cfg.diffusion.alpha <= cfg.criticality.alpha_max);
    }

    /// Seeds round-trip through JSON with node/link counts and energy intact.
    #[test]
    fn seed_roundtrip_preserves_totals(g in arb_graph()) {
        let json = serde_json::to_string(&g.to_seed()).unwrap();
        let seed: GraphSeed = serde_json::from_str(&json).unwrap();
        let g2 = Graph::from_seed(seed).unwrap();
        prop_assert_eq!(g.node_count(), g2.node_count());
        prop_assert_eq!(g.link_count(), g2.link_count());
        prop_assert!((g.total_energy() - g2.total_energy()).abs() < 1e-9);
    }

    /// Cosine similarity always lies in [-1, 1].
    #[test]
    fn cosine_in_unit_range(a in prop::collection::vec(-10.0f32..10.0, 4), b in prop::collection::vec(-10.0f32..10.0, 4)) {
        let c = cosine_similarity(&a, &b);
        prop_assert!((-1.0 - 1e-9..=1.0 + 1e-9).contains(&c), "cosine out of range: {}", c);
    }

    /// Rank fraction is a probability.
    #[test]
    fn rank_fraction_in_unit_range(v in -10.0f64..10.0, cohort in prop::collection::vec(-10.0f64..10.0, 0..30)) {
        let r = rank_fraction(v, &cohort);
        prop_assert!((0.0..=1.0).contains(&r));
    }
}
