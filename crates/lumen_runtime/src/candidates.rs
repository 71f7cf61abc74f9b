//! Candidate scoring for an incoming stimulus.
//!
//! Cosine search over node embeddings when the stimulus carries one;
//! otherwise (embedder down, or no embedded nodes) a token-overlap score
//! against node ids.

use lumen_core::numeric::cosine_similarity;
use lumen_core::{Graph, Node, Stimulus};
use lumen_stimulus::Candidate;
use serde::Serialize;
use std::collections::BTreeSet;

use crate::embedding::tokenize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Embedding,
    /// Degraded path.
    TokenOverlap,
}

/// Score nodes against the stimulus, best first, at most `limit`.
pub fn search(graph: &Graph, stimulus: &Stimulus, limit: usize) -> (Vec<Candidate>, SearchMode) {
    if let Some(embedding) = &stimulus.embedding {
        if graph.nodes().any(|n| n.embedding.is_some()) {
            return (by_embedding(graph, embedding, limit), SearchMode::Embedding);
        }
        tracing::debug!("No embedded nodes, falling back to token overlap");
    }
    (by_token_overlap(graph, &stimulus.text, limit), SearchMode::TokenOverlap)
}

pub fn by_embedding(graph: &Graph, embedding: &[f32], limit: usize) -> Vec<Candidate> {
    let scored = graph.nodes().filter_map(|n| {
        let e = n.embedding.as_ref()?;
        Some((n, cosine_similarity(embedding, e)))
    });
    top(scored, limit)
}

/// Jaccard overlap between stimulus tokens and the tokens of each node id.
pub fn by_token_overlap(graph: &Graph, text: &str, limit: usize) -> Vec<Candidate> {
    let query: BTreeSet<String> = tokenize(text).collect();
    if query.is_empty() {
        return Vec::new();
    }
    let scored = graph.nodes().map(|n| {
        let tokens: BTreeSet<String> = tokenize(n.id.as_str()).collect();
        let shared = tokens.intersection(&query).count();
        let union = tokens.union(&query).count();
        let score = if union == 0 { 0.0 } else { shared as f64 / union as f64 };
        (n, score)
    });
    top(scored, limit)
}

fn top<'a>(scored: impl Iterator<Item = (&'a Node, f64)>, limit: usize) -> Vec<Candidate> {
    let mut out: Vec<Candidate> = scored
        .filter(|(_, s)| s.is_finite() && *s > 0.0)
        .map(|(n, s)| Candidate::new(n.id.clone(), s.min(1.0), n.energy, n.threshold))
        .collect();
    // stable: equal scores keep graph order
    out.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    out.truncate(limit);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::{NodeKind, SourceKey, SourceType};

    fn graph() -> Graph {
        let mut g = Graph::new();
        g.insert_node(Node::new("rust_compiler", NodeKind::Concept).with_embedding(vec![1.0, 0.0]));
        g.insert_node(Node::new("borrow_checker", NodeKind::Concept).with_embedding(vec![0.7, 0.7]));
        g.insert_node(Node::new("coffee", NodeKind::Other).with_embedding(vec![-1.0, 0.0]));
        g
    }

    #[test]
    fn test_embedding_search_ranks_and_drops_negative() {
        let g = graph();
        let s = Stimulus::new("q", Some(vec![1.0, 0.0]), SourceKey::of(SourceType::UserMessage));
        let (c, mode) = search(&g, &s, 10);
        assert_eq!(mode, SearchMode::Embedding);
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].node.as_str(), "rust_compiler");
        assert!((c[0].similarity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_fallback_without_embedding() {
        let g = graph();
        let s = Stimulus::new("the Rust compiler is slow", None, SourceKey::of(SourceType::UserMessage));
        let (c, mode) = search(&g, &s, 10);
        assert_eq!(mode, SearchMode::TokenOverlap);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].node.as_str(), "rust_compiler");
        assert!((c[0].similarity - 2.0 / 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_limit_applies_after_ranking() {
        let g = graph();
        let c = by_embedding(&g, &[0.7, 0.7], 1);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].node.as_str(), "borrow_checker");
    }

    #[test]
    fn test_empty_text_scores_nothing() {
        assert!(by_token_overlap(&graph(), "  ", 10).is_empty());
    }
}
