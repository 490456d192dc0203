//! Device personalization with regularized learning-rate feedback.
//!
//! Two concerns: boosting retrieved chunks that match the user's own pump
//! or CGM, and learning per-device boost levels from explicit feedback.
//! State is keyed by an anonymized session hash so raw session ids never
//! land on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::PersonalizationConfig;
use crate::devices::{DeviceType, UserDevice};
use crate::error::{Error, Result};
use crate::knowledge::Chunk;

/// Broad query buckets used for feedback pattern tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Question,
    Configuration,
    Troubleshooting,
    DeviceSpecific,
    General,
}

impl QueryType {
    /// Keyword-bucket classification.
    pub fn classify(query: &str) -> Self {
        let lower = query.to_lowercase();
        if ["how", "what", "why", "when", "where"]
            .iter()
            .any(|w| lower.contains(w))
        {
            Self::Question
        } else if ["configure", "setup", "install", "set up"]
            .iter()
            .any(|w| lower.contains(w))
        {
            Self::Configuration
        } else if ["error", "problem", "issue", "not working"]
            .iter()
            .any(|w| lower.contains(w))
        {
            Self::Troubleshooting
        } else if ["loop", "openaps", "androidaps", "pump", "cgm"]
            .iter()
            .any(|w| lower.contains(w))
        {
            Self::DeviceSpecific
        } else {
            Self::General
        }
    }
}

/// One boost adjustment, kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostAdjustment {
    pub timestamp: DateTime<Utc>,
    pub feedback_delta: f64,
    pub effective_learning_rate: f64,
    pub old_boost: f64,
    pub new_boost: f64,
    pub feedback_count: u32,
}

/// Persisted boost state for a (session, device type, manufacturer) key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostState {
    pub session_hash: String,
    pub device_type: DeviceType,
    pub manufacturer: String,
    pub feedback_count: u32,
    pub current_boost: f64,
    pub last_adjusted_at: DateTime<Utc>,
    pub adjustment_history: Vec<BoostAdjustment>,
}

/// Negative feedback row appended to `negative_feedback.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegativeFeedbackEntry {
    pub timestamp: DateTime<Utc>,
    /// Truncated for privacy
    pub query: String,
    pub query_length: usize,
    pub response_length: usize,
    pub sources_used: Vec<String>,
    /// Average retrieval confidence at response time, when known
    pub avg_confidence: Option<f64>,
    pub query_type: QueryType,
}

/// Retrieval parameters adjusted from feedback history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalStrategy {
    pub top_k: usize,
    pub min_confidence: f64,
    pub reason: String,
}

impl Default for RetrievalStrategy {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_confidence: 0.35,
            reason: "default".to_string(),
        }
    }
}

/// Anonymize a session id for on-disk state paths.
pub fn anonymize_session_id(session_id: &str) -> String {
    let digest = Sha256::digest(session_id.as_bytes());
    format!("{digest:x}")
}

/// Applies device boosts and learns from feedback.
pub struct PersonalizationManager {
    base_dir: PathBuf,
    config: PersonalizationConfig,
    /// Serializes load-modify-save per (session, device, manufacturer)
    state_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PersonalizationManager {
    pub fn new(base_dir: impl Into<PathBuf>, config: PersonalizationConfig) -> Self {
        Self {
            base_dir: base_dir.into(),
            config,
            state_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Boost chunks whose source matches the user's pump or CGM.
    ///
    /// Matching is a case-insensitive substring test in either direction.
    /// Returns a new list; the input is untouched. Confidence caps at 1.0,
    /// which also makes re-application a no-op for already-boosted chunks.
    pub fn apply_device_boost(&self, chunks: &[Chunk], devices: &[UserDevice]) -> Vec<Chunk> {
        let pump = devices
            .iter()
            .find(|d| matches!(d.device_type, DeviceType::Pump | DeviceType::Algorithm));
        let cgm = devices.iter().find(|d| d.device_type == DeviceType::Cgm);

        chunks
            .iter()
            .map(|chunk| {
                let matched = pump
                    .filter(|d| is_device_match(&chunk.source, &d.name))
                    .or_else(|| cgm.filter(|d| is_device_match(&chunk.source, &d.name)));
                match matched {
                    Some(device) => {
                        let boosted = (chunk.confidence + self.config.device_priority_boost)
                            .min(1.0);
                        debug!(
                            source = %chunk.source,
                            device = %device.name,
                            from = chunk.confidence,
                            to = boosted,
                            "[personalization] device boost applied"
                        );
                        chunk.with_confidence(boosted)
                    }
                    None => chunk.clone(),
                }
            })
            .collect()
    }

    /// Learning rate after `feedback_count` events:
    /// `base_rate / (1 + decay_factor * n)`. Monotonically non-increasing,
    /// so repeated feedback stabilizes the boost.
    pub fn effective_learning_rate(&self, feedback_count: u32) -> f64 {
        self.config.learning_rate / (1.0 + self.config.decay_factor * f64::from(feedback_count))
    }

    /// Adjust the stored boost for a device from one feedback event.
    pub async fn adjust_boost_from_feedback(
        &self,
        session_id: &str,
        device_type: DeviceType,
        manufacturer: &str,
        feedback_delta: f64,
    ) -> Result<BoostState> {
        let session_hash = anonymize_session_id(session_id);
        let key = format!("{session_hash}/{device_type:?}/{manufacturer}");
        let _guard = self.lock_for(&key).await;

        let mut state = self
            .load_boost_state(&session_hash, device_type, manufacturer)
            .await?
            .unwrap_or_else(|| BoostState {
                session_hash: session_hash.clone(),
                device_type,
                manufacturer: manufacturer.to_string(),
                feedback_count: 0,
                current_boost: self.config.device_priority_boost,
                last_adjusted_at: Utc::now(),
                adjustment_history: Vec::new(),
            });

        let rate = self.effective_learning_rate(state.feedback_count);
        let old_boost = state.current_boost;
        let new_boost = (old_boost + rate * feedback_delta).clamp(0.0, self.config.max_boost);

        state.feedback_count += 1;
        state.current_boost = new_boost;
        state.last_adjusted_at = Utc::now();
        state.adjustment_history.push(BoostAdjustment {
            timestamp: state.last_adjusted_at,
            feedback_delta,
            effective_learning_rate: rate,
            old_boost,
            new_boost,
            feedback_count: state.feedback_count,
        });

        self.save_boost_state(&state).await?;
        debug!(
            manufacturer,
            delta = feedback_delta,
            rate,
            old_boost,
            new_boost,
            "[personalization] boost adjusted"
        );
        Ok(state)
    }

    /// Record a not-helpful response for later strategy adjustment.
    pub async fn learn_from_negative_feedback(
        &self,
        session_id: &str,
        query: &str,
        response: &str,
        sources: &[String],
        avg_confidence: Option<f64>,
    ) -> Result<()> {
        let entry = NegativeFeedbackEntry {
            timestamp: Utc::now(),
            query: query.chars().take(200).collect(),
            query_length: query.len(),
            response_length: response.len(),
            sources_used: sources.to_vec(),
            avg_confidence,
            query_type: QueryType::classify(query),
        };

        let session_hash = anonymize_session_id(session_id);
        let path = self.feedback_log_path(&session_hash);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("Cannot create feedback dir: {e}")))?;
        }
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::Storage(format!("Cannot open feedback log: {e}")))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Storage(format!("Cannot append feedback: {e}")))?;

        info!(session = %&session_hash[..8], "[personalization] negative feedback logged");
        Ok(())
    }

    /// Retrieval parameters tuned from this session's feedback history.
    ///
    /// Two or more past entries of the same query type steer the strategy:
    /// low average confidence widens retrieval, high confidence with still
    /// negative feedback raises diversity pressure.
    pub async fn adjust_retrieval_strategy(
        &self,
        query: &str,
        session_id: &str,
    ) -> RetrievalStrategy {
        let path = self.feedback_log_path(&anonymize_session_id(session_id));
        let entries = match self.load_feedback(&path).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("[personalization] could not load feedback history: {e}");
                return RetrievalStrategy::default();
            }
        };
        if entries.is_empty() {
            return RetrievalStrategy::default();
        }

        let query_type = QueryType::classify(query);
        let similar: Vec<_> = entries
            .iter()
            .filter(|e| e.query_type == query_type)
            .collect();
        if similar.len() < 2 {
            return RetrievalStrategy::default();
        }

        let avg_confidence = similar
            .iter()
            .map(|e| e.avg_confidence.unwrap_or(0.7))
            .sum::<f64>()
            / similar.len() as f64;

        if avg_confidence < 0.5 {
            info!(?query_type, "[personalization] widening retrieval after low-confidence feedback");
            RetrievalStrategy {
                top_k: 10,
                min_confidence: 0.25,
                reason: format!("low_confidence_pattern_{query_type:?}").to_lowercase(),
            }
        } else if avg_confidence > 0.8 {
            info!(?query_type, "[personalization] raising diversity after high-confidence feedback");
            RetrievalStrategy {
                top_k: 8,
                min_confidence: 0.4,
                reason: format!("need_diversity_{query_type:?}").to_lowercase(),
            }
        } else {
            RetrievalStrategy::default()
        }
    }

    async fn lock_for(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.state_locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    fn boost_state_path(
        &self,
        session_hash: &str,
        device_type: DeviceType,
        manufacturer: &str,
    ) -> PathBuf {
        let device = format!("{device_type:?}").to_lowercase();
        let manufacturer = manufacturer.to_lowercase().replace([' ', '/'], "_");
        self.base_dir
            .join(session_hash)
            .join(format!("boost_{device}_{manufacturer}.json"))
    }

    fn feedback_log_path(&self, session_hash: &str) -> PathBuf {
        self.base_dir.join(session_hash).join("negative_feedback.jsonl")
    }

    async fn load_boost_state(
        &self,
        session_hash: &str,
        device_type: DeviceType,
        manufacturer: &str,
    ) -> Result<Option<BoostState>> {
        let path = self.boost_state_path(session_hash, device_type, manufacturer);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(state) => Ok(Some(state)),
                Err(e) => {
                    warn!("[personalization] corrupt boost state, starting fresh: {e}");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("Cannot read boost state: {e}"))),
        }
    }

    async fn save_boost_state(&self, state: &BoostState) -> Result<()> {
        let path = self.boost_state_path(&state.session_hash, state.device_type, &state.manufacturer);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("Cannot create state dir: {e}")))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(state)?)
            .await
            .map_err(|e| Error::Storage(format!("Cannot write boost state: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::Storage(format!("Cannot commit boost state: {e}")))
    }

    async fn load_feedback(&self, path: &Path) -> Result<Vec<NegativeFeedbackEntry>> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Storage(format!("Cannot read feedback log: {e}"))),
        };
        Ok(raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

/// Case-insensitive substring match in either direction.
fn is_device_match(source: &str, manufacturer: &str) -> bool {
    let source = source.to_lowercase();
    let manufacturer = manufacturer.to_lowercase();
    if source.is_empty() || manufacturer.is_empty() {
        return false;
    }
    source.contains(&manufacturer) || manufacturer.contains(&source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn manager() -> (tempfile::TempDir, PersonalizationManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = PersonalizationManager::new(
            dir.path().join("users"),
            PersonalizationConfig::default(),
        );
        (dir, manager)
    }

    fn device(name: &str, device_type: DeviceType) -> UserDevice {
        UserDevice {
            name: name.to_string(),
            device_type,
            collection: "c".to_string(),
        }
    }

    #[test]
    fn test_query_type_buckets() {
        assert_eq!(QueryType::classify("How do I fix this?"), QueryType::Question);
        assert_eq!(QueryType::classify("configure autosens"), QueryType::Configuration);
        assert_eq!(QueryType::classify("sensor error today"), QueryType::Troubleshooting);
        assert_eq!(QueryType::classify("pump occlusion"), QueryType::DeviceSpecific);
        assert_eq!(QueryType::classify("dawn phenomenon info"), QueryType::General);
    }

    #[test]
    fn test_device_boost_matches_and_caps() {
        let (_dir, manager) = manager();
        let devices = vec![device("CamAPS FX", DeviceType::Algorithm)];
        let chunks = vec![
            Chunk::new("t", "CamAPS FX Manual", 0.5),
            Chunk::new("t", "CamAPS FX Manual", 0.95),
            Chunk::new("t", "ADA Standards", 0.5),
        ];
        let boosted = manager.apply_device_boost(&chunks, &devices);
        assert!((boosted[0].confidence - 0.7).abs() < 1e-9);
        assert_eq!(boosted[1].confidence, 1.0);
        assert_eq!(boosted[2].confidence, 0.5);
        // Input untouched
        assert_eq!(chunks[0].confidence, 0.5);
    }

    #[test]
    fn test_device_boost_idempotent_at_cap() {
        let (_dir, manager) = manager();
        let devices = vec![device("Dexcom G6", DeviceType::Cgm)];
        let chunks = vec![Chunk::new("t", "Dexcom G6 User Guide", 0.9)];
        let once = manager.apply_device_boost(&chunks, &devices);
        let twice = manager.apply_device_boost(&once, &devices);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_effective_rate_values() {
        let (_dir, manager) = manager();
        assert!((manager.effective_learning_rate(0) - 0.1).abs() < 1e-9);
        assert!((manager.effective_learning_rate(10) - 0.05).abs() < 1e-9);
        // ~30 feedbacks drops the rate to 0.025
        assert!(manager.effective_learning_rate(30) <= 0.025);
    }

    proptest! {
        #[test]
        fn effective_rate_monotone_non_increasing(n in 0u32..1000) {
            let dir = tempfile::tempdir().unwrap();
            let manager = PersonalizationManager::new(
                dir.path(),
                PersonalizationConfig::default(),
            );
            prop_assert!(
                manager.effective_learning_rate(n + 1) <= manager.effective_learning_rate(n)
            );
        }
    }

    #[tokio::test]
    async fn test_boost_adjustment_persists() {
        let (_dir, manager) = manager();
        let state = manager
            .adjust_boost_from_feedback("session-1", DeviceType::Pump, "tandem", 1.0)
            .await
            .unwrap();
        assert_eq!(state.feedback_count, 1);
        assert!((state.current_boost - 0.3).abs() < 1e-9); // 0.2 + 0.1, capped at max 0.3

        let state = manager
            .adjust_boost_from_feedback("session-1", DeviceType::Pump, "tandem", -1.0)
            .await
            .unwrap();
        assert_eq!(state.feedback_count, 2);
        assert!(state.current_boost < 0.3);
        assert_eq!(state.adjustment_history.len(), 2);
    }

    #[tokio::test]
    async fn test_boost_floor_at_zero() {
        let (_dir, manager) = manager();
        for _ in 0..50 {
            manager
                .adjust_boost_from_feedback("s", DeviceType::Cgm, "dexcom", -5.0)
                .await
                .unwrap();
        }
        let state = manager
            .adjust_boost_from_feedback("s", DeviceType::Cgm, "dexcom", -5.0)
            .await
            .unwrap();
        assert_eq!(state.current_boost, 0.0);
    }

    #[tokio::test]
    async fn test_strategy_default_without_feedback() {
        let (_dir, manager) = manager();
        let strategy = manager.adjust_retrieval_strategy("how do I bolus", "s1").await;
        assert_eq!(strategy, RetrievalStrategy::default());
    }

    #[tokio::test]
    async fn test_strategy_widens_on_low_confidence_pattern() {
        let (_dir, manager) = manager();
        for _ in 0..2 {
            manager
                .learn_from_negative_feedback(
                    "s1",
                    "how does autosens work",
                    "some response",
                    &["rag".to_string()],
                    Some(0.3),
                )
                .await
                .unwrap();
        }
        let strategy = manager
            .adjust_retrieval_strategy("what is a basal rate", "s1")
            .await;
        assert_eq!(strategy.top_k, 10);
        assert!((strategy.min_confidence - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_strategy_diversity_on_high_confidence_pattern() {
        let (_dir, manager) = manager();
        for _ in 0..3 {
            manager
                .learn_from_negative_feedback(
                    "s1",
                    "how does autosens work",
                    "some response",
                    &["rag".to_string()],
                    Some(0.9),
                )
                .await
                .unwrap();
        }
        let strategy = manager
            .adjust_retrieval_strategy("why is my graph flat", "s1")
            .await;
        assert_eq!(strategy.top_k, 8);
        assert!((strategy.min_confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_anonymize_is_stable_and_hex() {
        let a = anonymize_session_id("session-1");
        let b = anonymize_session_id("session-1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, anonymize_session_id("session-2"));
    }
}
