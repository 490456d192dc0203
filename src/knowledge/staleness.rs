//! Corpus staleness reporting.
//!
//! Clinical guidelines go out of date; this report surfaces collections
//! whose last index run is older than the configured thresholds so the
//! operator can refresh them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::KnowledgeMonitoringConfig;
use crate::error::Result;
use crate::knowledge::KnowledgeStore;

/// How stale a collection is relative to the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessLevel {
    Fresh,
    Stale,
    Critical,
    /// Collection has never been indexed
    NeverIndexed,
}

/// Per-collection staleness entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStaleness {
    pub name: String,
    pub chunk_count: usize,
    pub last_indexed: Option<DateTime<Utc>>,
    pub age_days: Option<i64>,
    pub level: StalenessLevel,
}

/// Staleness summary across the corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalenessReport {
    pub generated_at: DateTime<Utc>,
    pub collections: Vec<CollectionStaleness>,
}

impl StalenessReport {
    /// Build a report from the store's collection metadata.
    pub async fn collect(
        store: &dyn KnowledgeStore,
        config: &KnowledgeMonitoringConfig,
    ) -> Result<Self> {
        let now = Utc::now();
        let collections = store
            .collections()
            .await?
            .into_iter()
            .map(|info| {
                let age_days = info.last_indexed.map(|t| (now - t).num_days());
                let level = match age_days {
                    None => StalenessLevel::NeverIndexed,
                    Some(days) if days >= i64::from(config.critical_threshold_days) => {
                        StalenessLevel::Critical
                    }
                    Some(days) if days >= i64::from(config.staleness_threshold_days) => {
                        StalenessLevel::Stale
                    }
                    Some(_) => StalenessLevel::Fresh,
                };
                CollectionStaleness {
                    name: info.name,
                    chunk_count: info.chunk_count,
                    last_indexed: info.last_indexed,
                    age_days,
                    level,
                }
            })
            .collect();

        Ok(Self {
            generated_at: now,
            collections,
        })
    }

    /// Collections needing attention (stale, critical or never indexed).
    pub fn needing_refresh(&self) -> impl Iterator<Item = &CollectionStaleness> {
        self.collections
            .iter()
            .filter(|c| c.level != StalenessLevel::Fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{Chunk, CollectionInfo};
    use async_trait::async_trait;
    use chrono::Duration;

    struct FixedStore(Vec<CollectionInfo>);

    #[async_trait]
    impl KnowledgeStore for FixedStore {
        async fn query(&self, _text: &str, _top_k: usize) -> Result<Vec<Chunk>> {
            Ok(Vec::new())
        }

        async fn collections(&self) -> Result<Vec<CollectionInfo>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_staleness_levels() {
        let now = Utc::now();
        let store = FixedStore(vec![
            CollectionInfo {
                name: "fresh".into(),
                chunk_count: 10,
                last_indexed: Some(now - Duration::days(5)),
            },
            CollectionInfo {
                name: "stale".into(),
                chunk_count: 20,
                last_indexed: Some(now - Duration::days(120)),
            },
            CollectionInfo {
                name: "critical".into(),
                chunk_count: 30,
                last_indexed: Some(now - Duration::days(400)),
            },
            CollectionInfo {
                name: "never".into(),
                chunk_count: 0,
                last_indexed: None,
            },
        ]);

        let config = KnowledgeMonitoringConfig {
            staleness_threshold_days: 90,
            critical_threshold_days: 365,
        };
        let report = StalenessReport::collect(&store, &config).await.unwrap();
        let levels: Vec<_> = report.collections.iter().map(|c| c.level).collect();
        assert_eq!(
            levels,
            vec![
                StalenessLevel::Fresh,
                StalenessLevel::Stale,
                StalenessLevel::Critical,
                StalenessLevel::NeverIndexed,
            ]
        );
        assert_eq!(report.needing_refresh().count(), 3);
    }
}
