//! Knowledge store interface.
//!
//! The vector index itself (chunking, embedding, nearest-neighbour search)
//! lives behind the [`KnowledgeStore`] trait; the core only consumes ranked
//! chunks and collection metadata.

mod staleness;

pub use staleness::{CollectionStaleness, StalenessLevel, StalenessReport};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A retrieved passage with provenance and retrieval confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Passage text (nonempty)
    pub text: String,
    /// Stable collection identifier, e.g. "CamAPS FX Manual"
    pub source: String,
    /// Page in the source document, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// Retrieval confidence in [0, 1]
    pub confidence: f64,
}

impl Chunk {
    pub fn new(text: impl Into<String>, source: impl Into<String>, confidence: f64) -> Self {
        Self {
            text: text.into(),
            source: source.into(),
            page: None,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    /// Copy of this chunk with a different confidence, clamped to [0, 1].
    pub fn with_confidence(&self, confidence: f64) -> Self {
        Self {
            text: self.text.clone(),
            source: self.source.clone(),
            page: self.page,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Metadata for an indexed collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    pub chunk_count: usize,
    pub last_indexed: Option<DateTime<Utc>>,
}

/// Vector search over the indexed corpus.
///
/// Implementations must be concurrency-safe; the pipeline issues queries
/// from parallel request handlers without additional locking.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Nearest-neighbour retrieval over all enabled collections, sorted by
    /// descending confidence.
    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<Chunk>>;

    /// Enumerate indexed collections.
    async fn collections(&self) -> Result<Vec<CollectionInfo>>;
}

/// Convert a cosine distance into a retrieval confidence.
pub fn distance_to_confidence(distance: f64) -> f64 {
    (1.0 - distance / 2.0).clamp(0.0, 1.0)
}
