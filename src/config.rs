//! Application configuration.
//!
//! The configuration document is YAML with the sections described below.
//! Every threshold is range-checked at load time; an out-of-range value is
//! a fatal `Error::Config`, never a silent clamp.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::units::GlucoseUnit;

/// Retrieval quality gates used to pick the prompt mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagQualityConfig {
    /// Minimum chunk count for sufficient coverage
    pub min_chunks: usize,
    /// Minimum average confidence for sufficient coverage
    pub min_confidence: f64,
    /// Minimum unique sources for sufficient coverage
    pub min_sources: usize,
    /// Per-chunk confidence floor applied before quality assessment
    pub min_chunk_confidence: f64,
}

impl Default for RagQualityConfig {
    fn default() -> Self {
        Self {
            min_chunks: 3,
            min_confidence: 0.7,
            min_sources: 2,
            min_chunk_confidence: 0.35,
        }
    }
}

/// Limits on parametric (model-internal) knowledge use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParametricUsageConfig {
    /// Parametric ratio above which the disclaimer warns the user
    pub max_ratio: f64,
    /// Fixed confidence assigned to parametric content
    pub confidence_score: f64,
}

impl Default for ParametricUsageConfig {
    fn default() -> Self {
        Self {
            max_ratio: 0.5,
            confidence_score: 0.6,
        }
    }
}

/// Safety auditor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Parametric ratio above which hallucination scanning always runs
    pub enhanced_check_threshold: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enhanced_check_threshold: 0.3,
        }
    }
}

/// Severity thresholds for the emergency keyword gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverityThresholds {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            critical: 0.67,
            high: 0.5,
            medium: 0.33,
        }
    }
}

/// Emergency detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyDetectionConfig {
    pub enabled: bool,
    #[serde(default)]
    pub severity_thresholds: SeverityThresholds,
    /// Canned responses keyed by "critical" | "high" | "medium"
    #[serde(default = "default_emergency_templates")]
    pub response_templates: HashMap<String, String>,
}

fn default_emergency_templates() -> HashMap<String, String> {
    let mut templates = HashMap::new();
    templates.insert(
        "critical".to_string(),
        "MEDICAL EMERGENCY: Your symptoms may indicate a medical emergency. \
         Call emergency services now. Do not wait."
            .to_string(),
    );
    templates.insert(
        "high".to_string(),
        "URGENT: These symptoms need prompt medical attention. Contact your \
         healthcare team or an urgent care service right away."
            .to_string(),
    );
    templates.insert(
        "medium".to_string(),
        "CAUTION: These symptoms can become serious. Check your glucose and \
         ketones now and contact your healthcare team if they persist."
            .to_string(),
    );
    templates
}

impl Default for EmergencyDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            severity_thresholds: SeverityThresholds::default(),
            response_templates: default_emergency_templates(),
        }
    }
}

/// Logging configuration (consumed by the host binary's subscriber).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub max_size_mb: u64,
    pub backup_count: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            max_size_mb: 10,
            backup_count: 3,
        }
    }
}

/// Corpus staleness reporting thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeMonitoringConfig {
    pub staleness_threshold_days: u32,
    pub critical_threshold_days: u32,
}

impl Default for KnowledgeMonitoringConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_days: 90,
            critical_threshold_days: 365,
        }
    }
}

/// Device-boost and feedback-learning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalizationConfig {
    pub device_priority_boost: f64,
    pub max_boost: f64,
    pub learning_rate: f64,
    pub decay_factor: f64,
}

impl Default for PersonalizationConfig {
    fn default() -> Self {
        Self {
            device_priority_boost: 0.2,
            max_boost: 0.3,
            learning_rate: 0.1,
            decay_factor: 0.1,
        }
    }
}

/// Cohort experimentation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentationConfig {
    pub enabled: bool,
    pub storage_dir: String,
}

impl Default for ExperimentationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            storage_dir: "data".to_string(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub rag_quality: RagQualityConfig,
    #[serde(default)]
    pub parametric_usage: ParametricUsageConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub emergency_detection: EmergencyDetectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub knowledge_monitoring: KnowledgeMonitoringConfig,
    #[serde(default)]
    pub personalization: PersonalizationConfig,
    #[serde(default)]
    pub experimentation: ExperimentationConfig,
}

impl AppConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "Cannot read config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|e| Error::config(format!("Invalid YAML configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Range-check every threshold. Called by the loaders; public so a
    /// hand-constructed config can be checked too.
    pub fn validate(&self) -> Result<()> {
        let rq = &self.rag_quality;
        if rq.min_chunks < 1 {
            return Err(Error::config("rag_quality.min_chunks must be >= 1"));
        }
        validate_unit_range("rag_quality.min_confidence", rq.min_confidence)?;
        if rq.min_sources < 1 {
            return Err(Error::config("rag_quality.min_sources must be >= 1"));
        }
        validate_unit_range("rag_quality.min_chunk_confidence", rq.min_chunk_confidence)?;

        validate_unit_range("parametric_usage.max_ratio", self.parametric_usage.max_ratio)?;
        validate_unit_range(
            "parametric_usage.confidence_score",
            self.parametric_usage.confidence_score,
        )?;
        validate_unit_range(
            "safety.enhanced_check_threshold",
            self.safety.enhanced_check_threshold,
        )?;

        let st = &self.emergency_detection.severity_thresholds;
        validate_unit_range("emergency_detection.severity_thresholds.critical", st.critical)?;
        validate_unit_range("emergency_detection.severity_thresholds.high", st.high)?;
        validate_unit_range("emergency_detection.severity_thresholds.medium", st.medium)?;

        const LEVELS: [&str; 5] = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"];
        if !LEVELS.contains(&self.logging.level.as_str()) {
            return Err(Error::config(format!(
                "logging.level must be one of {LEVELS:?}"
            )));
        }
        if self.logging.max_size_mb < 1 {
            return Err(Error::config("logging.max_size_mb must be >= 1"));
        }
        if self.logging.backup_count < 1 {
            return Err(Error::config("logging.backup_count must be >= 1"));
        }

        let km = &self.knowledge_monitoring;
        if km.staleness_threshold_days < 1 {
            return Err(Error::config(
                "knowledge_monitoring.staleness_threshold_days must be >= 1",
            ));
        }
        if km.critical_threshold_days < 1 {
            return Err(Error::config(
                "knowledge_monitoring.critical_threshold_days must be >= 1",
            ));
        }

        let p = &self.personalization;
        validate_unit_range("personalization.device_priority_boost", p.device_priority_boost)?;
        validate_unit_range("personalization.max_boost", p.max_boost)?;
        validate_unit_range("personalization.learning_rate", p.learning_rate)?;
        validate_unit_range("personalization.decay_factor", p.decay_factor)?;

        Ok(())
    }
}

fn validate_unit_range(field: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(Error::config(format!(
            "{field} must be between 0.0 and 1.0, got {value}"
        )));
    }
    Ok(())
}

/// Runtime settings resolved from environment variables at startup.
#[derive(Debug, Clone)]
pub struct EnvSettings {
    pub glucose_unit: GlucoseUnit,
    pub llm_provider: String,
    pub max_retries: u32,
    pub retry_base_delay_secs: f64,
}

impl EnvSettings {
    /// Resolve settings from the process environment. Invalid values are
    /// fatal, matching the config loaders.
    pub fn from_env() -> Result<Self> {
        let glucose_unit = GlucoseUnit::from_env()?;
        let llm_provider =
            std::env::var("LLM_PROVIDER").unwrap_or_else(|_| "groq".to_string());
        let max_retries = match std::env::var("MAX_RETRIES") {
            Ok(v) => v
                .parse()
                .map_err(|_| Error::config(format!("MAX_RETRIES must be an integer, got {v}")))?,
            Err(_) => 3,
        };
        let retry_base_delay_secs = match std::env::var("RETRY_BASE_DELAY") {
            Ok(v) => v.parse().map_err(|_| {
                Error::config(format!("RETRY_BASE_DELAY must be a number, got {v}"))
            })?,
            Err(_) => 1.0,
        };
        Ok(Self {
            glucose_unit,
            llm_provider,
            max_retries,
            retry_base_delay_secs,
        })
    }
}

impl Default for EnvSettings {
    fn default() -> Self {
        Self {
            glucose_unit: GlucoseUnit::MmolL,
            llm_provider: "groq".to_string(),
            max_retries: 3,
            retry_base_delay_secs: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
rag_quality:
  min_chunks: 3
  min_confidence: 0.7
  min_sources: 2
  min_chunk_confidence: 0.35
emergency_detection:
  enabled: true
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.rag_quality.min_chunks, 3);
        assert!(config.emergency_detection.enabled);
        // Unlisted sections take defaults
        assert_eq!(config.personalization.device_priority_boost, 0.2);
    }

    #[test]
    fn test_out_of_range_confidence_is_fatal() {
        let yaml = r#"
rag_quality:
  min_chunks: 3
  min_confidence: 1.5
  min_sources: 2
  min_chunk_confidence: 0.35
"#;
        assert!(AppConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_zero_min_chunks_is_fatal() {
        let mut config = AppConfig::default();
        config.rag_quality.min_chunks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_logging_level_is_fatal() {
        let mut config = AppConfig::default();
        config.logging.level = "TRACE".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_emergency_templates_present() {
        let config = AppConfig::default();
        for key in ["critical", "high", "medium"] {
            assert!(config.emergency_detection.response_templates.contains_key(key));
        }
    }
}
