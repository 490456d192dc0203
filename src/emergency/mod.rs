//! Emergency symptom gate.
//!
//! A keyword/regex scan over the raw query that runs before anything else
//! in the pipeline. A match short-circuits generation entirely: the user
//! gets a canned template immediately and no LLM call is made.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::warn;

use crate::config::EmergencyDetectionConfig;

/// Emergency severity, ordered by urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EmergencySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for EmergencySeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Outcome of the emergency scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyMatch {
    pub severity: EmergencySeverity,
    /// Keywords and pattern labels that fired
    pub detected: Vec<String>,
    /// `min(matches / 3, 1)`
    pub score: f64,
    /// Canned response template for this severity
    pub template: String,
}

/// Hypoglycemia, DKA, acute-complication and urgency keywords.
const EMERGENCY_KEYWORDS: [&str; 43] = [
    // Hypoglycemia
    "low blood sugar",
    "hypo",
    "shaking",
    "confusion",
    "unconscious",
    "blood sugar dropping",
    "feeling shaky",
    "cold sweat",
    "difficulty speaking",
    "severe headache",
    "can't think straight",
    "slurred speech",
    "extreme weakness",
    "pale skin",
    "rapid heartbeat",
    // Severe hyperglycemia / DKA
    "dka",
    "ketones",
    "vomiting",
    "fruity breath",
    "ketoacidosis",
    "high ketones",
    "acetone breath",
    "rapid breathing",
    "severe hyperglycemia",
    "blood sugar over 300",
    "blood sugar over 400",
    // Acute complications
    "seizure",
    "stroke symptoms",
    "chest pain",
    "heart attack",
    "severe abdominal pain",
    "can't wake up",
    "severe pain",
    "difficulty breathing",
    "shortness of breath",
    "severe nausea",
    // Urgency context
    "emergency",
    "call ambulance",
    "medical help",
    "life threatening",
    "immediately",
    "urgent",
    "critical condition",
];

static EMERGENCY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(severe|extreme|critical|life.threatening)\b.*\b(pain|symptoms?|condition)\b",
        r"(?i)\b(immediately|right now|asap|urgent)\b.*\b(help|attention|care)\b",
        r"(?i)\b(can'?t|cannot)\b.*\b(breathe|see|speak|move|wake)\b",
        r"(?i)\b(blood sugar|glucose)\b.*\b(under|below)\b.*\b(50|40|30|20)\b",
        r"(?i)\b(blood sugar|glucose)\b.*\b(over|above)\b.*\b(500|600|700)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid regex"))
    .collect()
});

/// Keyword/regex emergency gate.
pub struct EmergencyDetector {
    config: EmergencyDetectionConfig,
}

impl EmergencyDetector {
    pub fn new(config: EmergencyDetectionConfig) -> Self {
        Self { config }
    }

    /// Scan a query. `None` when detection is disabled or nothing fired.
    pub fn detect(&self, query: &str) -> Option<EmergencyMatch> {
        if !self.config.enabled {
            return None;
        }

        let query_lower = query.to_lowercase();
        let mut detected: Vec<String> = EMERGENCY_KEYWORDS
            .iter()
            .filter(|kw| query_lower.contains(*kw))
            .map(|kw| kw.to_string())
            .collect();

        for (i, pattern) in EMERGENCY_PATTERNS.iter().enumerate() {
            if pattern.is_match(&query_lower) {
                detected.push(format!("pattern:{i}"));
            }
        }

        if detected.is_empty() {
            return None;
        }

        let score = (detected.len() as f64 / 3.0).min(1.0);
        let thresholds = &self.config.severity_thresholds;
        let severity = if score >= thresholds.critical {
            EmergencySeverity::Critical
        } else if score >= thresholds.high {
            EmergencySeverity::High
        } else if score >= thresholds.medium {
            EmergencySeverity::Medium
        } else {
            EmergencySeverity::Low
        };

        warn!(%severity, score, ?detected, "[emergency] symptoms detected");

        Some(EmergencyMatch {
            severity,
            template: self.template_for(severity),
            detected,
            score,
        })
    }

    fn template_for(&self, severity: EmergencySeverity) -> String {
        let key = match severity {
            EmergencySeverity::Critical | EmergencySeverity::Low => "critical",
            EmergencySeverity::High => "high",
            EmergencySeverity::Medium => "medium",
        };
        self.config
            .response_templates
            .get(key)
            .cloned()
            .unwrap_or_else(|| {
                "MEDICAL EMERGENCY detected. This may be a medical emergency. \
                 Call emergency services if symptoms worsen."
                    .to_string()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn detector() -> EmergencyDetector {
        EmergencyDetector::new(EmergencyDetectionConfig::default())
    }

    #[test]
    fn test_benign_query_no_match() {
        assert!(detector().detect("What is time in range?").is_none());
    }

    #[test]
    fn test_multiple_hypo_symptoms_critical() {
        let m = detector()
            .detect("I'm shaking, confused, cold sweat, can't think straight")
            .unwrap();
        assert_eq!(m.severity, EmergencySeverity::Critical);
        assert_eq!(m.score, 1.0);
        assert!(m.detected.len() >= 3);
    }

    #[test]
    fn test_single_keyword_scores_one_third() {
        let m = detector().detect("had a hypo yesterday evening").unwrap();
        // 1/3 clears the default medium threshold of 0.33
        assert_eq!(m.severity, EmergencySeverity::Medium);
        assert!((m.score - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_at_threshold_selects_higher_severity() {
        // One keyword scores exactly 1/3, which meets the 0.33 medium threshold
        let m = detector().detect("vomiting since lunch").unwrap();
        assert!(m.score >= 0.33);
        assert_eq!(m.severity, EmergencySeverity::Medium);
    }

    #[test]
    fn test_two_matches_is_high() {
        let m = detector().detect("ketones and vomiting").unwrap();
        assert!((m.score - 2.0 / 3.0).abs() < 1e-9);
        // 2/3 meets high (0.5) but sits below critical (0.67)
        assert_eq!(m.severity, EmergencySeverity::High);
    }

    #[test]
    fn test_regex_pattern_matches() {
        let m = detector().detect("my glucose is under 40").unwrap();
        assert!(m.detected.iter().any(|d| d.starts_with("pattern:")));
    }

    #[test]
    fn test_disabled_detector_never_matches() {
        let config = EmergencyDetectionConfig {
            enabled: false,
            ..EmergencyDetectionConfig::default()
        };
        let detector = EmergencyDetector::new(config);
        assert!(detector.detect("seizure right now emergency").is_none());
    }

    #[test]
    fn test_template_selected_by_severity() {
        let m = detector()
            .detect("I'm shaking, confused, cold sweat, can't think straight")
            .unwrap();
        assert!(m.template.contains("MEDICAL EMERGENCY"));
    }
}
