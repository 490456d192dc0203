//! Retrieval quality assessment.
//!
//! A deterministic function from the retrieved chunk list to a coverage
//! grade. The grade gates prompt selection: sufficient coverage keeps the
//! model on retrieved passages only, anything less opens the hybrid path.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::RagQualityConfig;
use crate::knowledge::Chunk;

/// Topic coverage grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coverage {
    Sufficient,
    Partial,
    Sparse,
}

/// Retrieval quality metrics for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagQuality {
    pub chunk_count: usize,
    pub avg_confidence: f64,
    pub max_confidence: f64,
    pub min_confidence: f64,
    /// Unique source names, sorted for stable output
    pub sources_covered: Vec<String>,
    pub source_diversity: usize,
    pub coverage: Coverage,
}

impl RagQuality {
    /// Assess a (already threshold-filtered) chunk list.
    pub fn assess(chunks: &[Chunk], config: &RagQualityConfig) -> Self {
        if chunks.is_empty() {
            return Self {
                chunk_count: 0,
                avg_confidence: 0.0,
                max_confidence: 0.0,
                min_confidence: 0.0,
                sources_covered: Vec::new(),
                source_diversity: 0,
                coverage: Coverage::Sparse,
            };
        }

        let chunk_count = chunks.len();
        let confidences: Vec<f64> = chunks.iter().map(|c| c.confidence).collect();
        let avg_confidence = confidences.iter().sum::<f64>() / chunk_count as f64;
        let max_confidence = confidences.iter().cloned().fold(f64::MIN, f64::max);
        let min_confidence = confidences.iter().cloned().fold(f64::MAX, f64::min);

        let sources: BTreeSet<String> = chunks.iter().map(|c| c.source.clone()).collect();
        let source_diversity = sources.len();

        let coverage = if chunk_count >= config.min_chunks
            && avg_confidence >= config.min_confidence
            && source_diversity >= config.min_sources
        {
            Coverage::Sufficient
        } else if chunk_count >= 1 && avg_confidence >= 0.5 {
            Coverage::Partial
        } else {
            Coverage::Sparse
        };

        Self {
            chunk_count,
            avg_confidence,
            max_confidence,
            min_confidence,
            sources_covered: sources.into_iter().collect(),
            source_diversity,
            coverage,
        }
    }

    /// The prompt-mode gate: only sufficient coverage stays RAG-only.
    pub fn is_sufficient(&self) -> bool {
        self.coverage == Coverage::Sufficient
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn chunk(source: &str, confidence: f64) -> Chunk {
        Chunk::new("text", source, confidence)
    }

    fn config() -> RagQualityConfig {
        RagQualityConfig::default()
    }

    #[test]
    fn test_empty_is_sparse() {
        let quality = RagQuality::assess(&[], &config());
        assert_eq!(quality.coverage, Coverage::Sparse);
        assert_eq!(quality.chunk_count, 0);
        assert!(!quality.is_sufficient());
    }

    #[test]
    fn test_sufficient_at_exact_boundary() {
        // Exactly (3 chunks, 0.7 avg, 2 sources)
        let chunks = vec![chunk("a", 0.7), chunk("a", 0.7), chunk("b", 0.7)];
        let quality = RagQuality::assess(&chunks, &config());
        assert_eq!(quality.coverage, Coverage::Sufficient);
        assert!(quality.is_sufficient());
    }

    #[test]
    fn test_partial_just_below_confidence_boundary() {
        let chunks = vec![chunk("a", 0.69), chunk("a", 0.69), chunk("b", 0.69)];
        let quality = RagQuality::assess(&chunks, &config());
        assert_eq!(quality.coverage, Coverage::Partial);
    }

    #[test]
    fn test_single_source_is_not_sufficient() {
        let chunks = vec![chunk("a", 0.9), chunk("a", 0.9), chunk("a", 0.9)];
        let quality = RagQuality::assess(&chunks, &config());
        assert_eq!(quality.coverage, Coverage::Partial);
        assert_eq!(quality.source_diversity, 1);
    }

    #[test]
    fn test_low_confidence_is_sparse() {
        let chunks = vec![chunk("a", 0.3), chunk("b", 0.4)];
        let quality = RagQuality::assess(&chunks, &config());
        assert_eq!(quality.coverage, Coverage::Sparse);
    }

    #[test]
    fn test_metrics_computed() {
        let chunks = vec![chunk("a", 0.9), chunk("b", 0.5), chunk("c", 0.7)];
        let quality = RagQuality::assess(&chunks, &config());
        assert!((quality.avg_confidence - 0.7).abs() < 1e-9);
        assert_eq!(quality.max_confidence, 0.9);
        assert_eq!(quality.min_confidence, 0.5);
        assert_eq!(quality.sources_covered, vec!["a", "b", "c"]);
    }
}
