//! Multi-stage safety audit.
//!
//! Findings, tier decisions and the auditor pipeline that rewrites,
//! overrides or annotates generated responses before they reach the user.

mod auditor;
mod hallucination;
mod tiers;

pub use auditor::{
    AuditResult, AuditSummary, HybridAuditResult, HybridResponseInput, KnowledgeSources,
    SafetyAuditor,
};
pub use hallucination::{HallucinationDetector, HallucinationFinding};
pub use tiers::{SafetyTier, SafetyTierClassifier, TierAction, TierDecision, TierInput};

use serde::{Deserialize, Serialize};

/// Severity of one safety finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Blocked,
}

/// One safety detection on a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyFinding {
    pub severity: Severity,
    /// Category slug, e.g. "specific_dose" or "insulin_stacking"
    pub category: String,
    /// The matched text
    pub original_text: String,
    /// Substitution applied in place when severity is `Blocked`
    pub replacement_text: Option<String>,
    pub reason: String,
}

impl SafetyFinding {
    pub fn blocked(
        category: impl Into<String>,
        original: impl Into<String>,
        replacement: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            severity: Severity::Blocked,
            category: category.into(),
            original_text: original.into(),
            replacement_text: Some(replacement.into()),
            reason: reason.into(),
        }
    }

    pub fn warning(
        category: impl Into<String>,
        original: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            severity: Severity::Warning,
            category: category.into(),
            original_text: original.into(),
            replacement_text: None,
            reason: reason.into(),
        }
    }

    pub fn info(
        category: impl Into<String>,
        original: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            severity: Severity::Info,
            category: category.into(),
            original_text: original.into(),
            replacement_text: None,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Blocked > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn test_finding_constructors() {
        let finding = SafetyFinding::blocked("specific_dose", "take 5 units", "[removed]", "dose");
        assert_eq!(finding.severity, Severity::Blocked);
        assert!(finding.replacement_text.is_some());

        let warning = SafetyFinding::warning("insulin_stacking", "stacking doses", "stacking");
        assert_eq!(warning.severity, Severity::Warning);
        assert!(warning.replacement_text.is_none());
    }
}
