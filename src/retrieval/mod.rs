//! Retrieval coordination.
//!
//! Runs the knowledge store query with personalization-adjusted parameters,
//! honors router exclusions and applies device boosts.

mod quality;

pub use quality::{Coverage, RagQuality};

use std::sync::Arc;
use tracing::{info, warn};

use crate::devices::UserDevice;
use crate::knowledge::{Chunk, KnowledgeStore};
use crate::personalization::PersonalizationManager;
use crate::router::RouterContext;

/// Coordinates one retrieval pass for a query.
pub struct RetrievalCoordinator {
    store: Arc<dyn KnowledgeStore>,
    personalization: Arc<PersonalizationManager>,
}

impl RetrievalCoordinator {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        personalization: Arc<PersonalizationManager>,
    ) -> Self {
        Self {
            store,
            personalization,
        }
    }

    /// Retrieve chunks for a query.
    ///
    /// Store failures degrade to an empty list; the hybrid prompt path
    /// handles thin retrieval downstream.
    pub async fn retrieve(
        &self,
        query: &str,
        session_id: &str,
        router_context: Option<&RouterContext>,
        devices: &[UserDevice],
    ) -> Vec<Chunk> {
        let strategy = self
            .personalization
            .adjust_retrieval_strategy(query, session_id)
            .await;

        let raw = match self.store.query(query, strategy.top_k).await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!("[retrieval] knowledge store query failed: {e}");
                return Vec::new();
            }
        };
        let raw_count = raw.len();

        let mut chunks: Vec<Chunk> = raw
            .into_iter()
            .filter(|c| c.confidence >= strategy.min_confidence)
            .collect();

        if let Some(context) = router_context {
            if !context.exclude_sources.is_empty() {
                chunks.retain(|c| !is_excluded(&c.source, &context.exclude_sources));
            }
        }

        let mut boosted = self.personalization.apply_device_boost(&chunks, devices);
        boosted.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        info!(
            raw = raw_count,
            kept = boosted.len(),
            top_k = strategy.top_k,
            min_confidence = strategy.min_confidence,
            strategy = %strategy.reason,
            "[retrieval] completed"
        );
        boosted
    }
}

/// Case-insensitive substring match against any excluded term.
fn is_excluded(source: &str, exclude_sources: &[String]) -> bool {
    let source = source.to_lowercase();
    exclude_sources.iter().any(|term| {
        let term = term.to_lowercase();
        !term.is_empty() && (source.contains(&term) || term.contains(&source))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersonalizationConfig;
    use crate::devices::DeviceType;
    use crate::error::{Error, Result};
    use crate::knowledge::CollectionInfo;
    use crate::router::AutomationMode;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct FixedStore {
        chunks: Result<Vec<Chunk>>,
    }

    #[async_trait]
    impl KnowledgeStore for FixedStore {
        async fn query(&self, _text: &str, _top_k: usize) -> Result<Vec<Chunk>> {
            match &self.chunks {
                Ok(chunks) => Ok(chunks.clone()),
                Err(_) => Err(Error::Retrieval("store down".into())),
            }
        }

        async fn collections(&self) -> Result<Vec<CollectionInfo>> {
            Ok(Vec::new())
        }
    }

    fn coordinator(chunks: Result<Vec<Chunk>>) -> (tempfile::TempDir, RetrievalCoordinator) {
        let dir = tempfile::tempdir().unwrap();
        let personalization = Arc::new(PersonalizationManager::new(
            dir.path().join("users"),
            PersonalizationConfig::default(),
        ));
        let coordinator =
            RetrievalCoordinator::new(Arc::new(FixedStore { chunks }), personalization);
        (dir, coordinator)
    }

    #[tokio::test]
    async fn test_low_confidence_chunks_dropped() {
        let (_dir, coordinator) = coordinator(Ok(vec![
            Chunk::new("a", "OpenAPS Documentation", 0.8),
            Chunk::new("b", "OpenAPS Documentation", 0.2),
        ]));
        let chunks = coordinator.retrieve("query", "s1", None, &[]).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "a");
    }

    #[tokio::test]
    async fn test_router_exclusions_filter_sources() {
        let (_dir, coordinator) = coordinator(Ok(vec![
            Chunk::new("a", "camaps_app_features", 0.9),
            Chunk::new("b", "manual_bolus_features", 0.9),
            Chunk::new("c", "Extended_Bolus Guide", 0.9),
        ]));
        let context = RouterContext {
            automation_mode: AutomationMode::Automated,
            exclude_sources: vec!["manual_bolus_features".into(), "extended_bolus".into()],
            ..RouterContext::default()
        };
        let chunks = coordinator
            .retrieve("query", "s1", Some(&context), &[])
            .await;
        let sources: Vec<_> = chunks.iter().map(|c| c.source.as_str()).collect();
        assert_eq!(sources, vec!["camaps_app_features"]);
    }

    #[tokio::test]
    async fn test_store_failure_degrades_to_empty() {
        let (_dir, coordinator) = coordinator(Err(Error::Retrieval("down".into())));
        let chunks = coordinator.retrieve("query", "s1", None, &[]).await;
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_boost_reorders_by_adjusted_confidence() {
        let (_dir, coordinator) = coordinator(Ok(vec![
            Chunk::new("generic", "ADA Standards", 0.8),
            Chunk::new("device", "CamAPS FX Manual", 0.7),
        ]));
        let devices = vec![UserDevice {
            name: "CamAPS FX".into(),
            device_type: DeviceType::Algorithm,
            collection: "user_camaps".into(),
        }];
        let chunks = coordinator.retrieve("query", "s1", None, &devices).await;
        // 0.7 + 0.2 boost beats the unboosted 0.8
        assert_eq!(chunks[0].text, "device");
        assert!((chunks[0].confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_router_context_skips_exclusions() {
        let (_dir, coordinator) = coordinator(Ok(vec![Chunk::new(
            "b",
            "manual_bolus_features",
            0.9,
        )]));
        let chunks = coordinator.retrieve("query", "s1", None, &[]).await;
        assert_eq!(chunks.len(), 1);
    }
}
