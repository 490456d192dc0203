//! Rule-based hallucination detection.
//!
//! Scans generated text for claims that should be grounded in retrieved
//! chunks: numbers, device versions, dosing language and "studies show"
//! assertions. Numeric matching is exact; a claim whose numeric literals
//! all appear in some chunk is never flagged.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::knowledge::Chunk;

/// One suspected hallucination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HallucinationFinding {
    /// The claim with surrounding context
    pub claim: String,
    /// Category slug, e.g. "percentage_claim" or "dosing_instruction"
    pub category: String,
    /// Detector confidence in [0, 1]
    pub confidence: f64,
    pub evidence: String,
    /// Whether the claim text was checked against retrieved chunks
    pub source_checked: bool,
    pub found_in_sources: bool,
}

static NUMERIC_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"\b(\d+\.?\d*)\s*%", "percentage_claim"),
        (r"\b(\d+\.?\d*)\s*(mg/dL|mmol/L)", "glucose_value"),
        (r"\b(\d+\.?\d*)\s*(units?|U)\b", "dosage_value"),
        (r"(\d+\.?\d*)\s*(hours?|minutes?|days?)", "time_value"),
    ]
    .iter()
    .map(|(p, c)| (Regex::new(&format!("(?i){p}")).expect("invalid regex"), *c))
    .collect()
});

static DEVICE_VERSION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\b(Loop|OpenAPS|AndroidAPS|AAPS|CamAPS)\s+(?:version\s+)?(\d+\.?\d*)",
        r"\b(Omnipod|Tandem|Medtronic|Dexcom)\s+[A-Z]\d+",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).expect("invalid regex"))
    .collect()
});

static DOSING_INSTRUCTION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?:take|use|inject)\s+\d+\.?\d*\s*(?:units?|U)\b",
        r"(?:set|adjust)\s+(?:basal|temp basal)\s+to\s+\d+\.?\d*",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).expect("invalid regex"))
    .collect()
});

static UNCITED_FACT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?:studies show|research indicates|evidence suggests)",
        r"(?:\d+% of (?:people|patients|users))",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).expect("invalid regex"))
    .collect()
});

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.?\d*").expect("invalid regex"));

/// Markers that count as a citation near an uncited-fact pattern.
const CITATION_MARKERS: [&str; 4] = ["according to", "source:", "from ", "documentation"];

/// Rule-based scan over a response, cross-referenced against chunks.
#[derive(Debug, Clone, Default)]
pub struct HallucinationDetector;

impl HallucinationDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn detect(&self, response: &str, chunks: &[Chunk]) -> Vec<HallucinationFinding> {
        let mut findings = Vec::new();

        // Numeric claims must appear in the retrieved chunks.
        for (pattern, category) in NUMERIC_PATTERNS.iter() {
            for m in pattern.find_iter(response) {
                let claim = m.as_str();
                if claim_in_sources(claim, chunks) {
                    continue;
                }
                let context = surrounding(response, m.start(), m.end(), 50);
                findings.push(HallucinationFinding {
                    claim: context.trim().to_string(),
                    category: (*category).to_string(),
                    confidence: 0.7,
                    evidence: format!("Specific {category} '{claim}' not found in sources"),
                    source_checked: true,
                    found_in_sources: false,
                });
            }
        }

        // Device versions are a strong hallucination signal when unmatched.
        for pattern in DEVICE_VERSION_PATTERNS.iter() {
            for m in pattern.find_iter(response) {
                let claim = m.as_str();
                if claim_in_sources(claim, chunks) {
                    continue;
                }
                findings.push(HallucinationFinding {
                    claim: claim.to_string(),
                    category: "device_version".to_string(),
                    confidence: 0.8,
                    evidence: format!(
                        "Specific device version '{claim}' not found in documentation"
                    ),
                    source_checked: true,
                    found_in_sources: false,
                });
            }
        }

        // Dosing instructions never come from parametric knowledge,
        // flagged regardless of source grounding.
        for pattern in DOSING_INSTRUCTION_PATTERNS.iter() {
            for m in pattern.find_iter(response) {
                findings.push(HallucinationFinding {
                    claim: m.as_str().to_string(),
                    category: "dosing_instruction".to_string(),
                    confidence: 0.95,
                    evidence: "Specific dosing instruction detected - should come from user \
                               data or be deferred"
                        .to_string(),
                    source_checked: false,
                    found_in_sources: false,
                });
            }
        }

        // Factual markers need a citation within +/-100 chars.
        for pattern in UNCITED_FACT_PATTERNS.iter() {
            for m in pattern.find_iter(response) {
                let context = surrounding(response, m.start(), m.end(), 100).to_lowercase();
                let has_citation = CITATION_MARKERS.iter().any(|c| context.contains(c));
                if has_citation {
                    continue;
                }
                findings.push(HallucinationFinding {
                    claim: m.as_str().to_string(),
                    category: "uncited_claim".to_string(),
                    confidence: 0.6,
                    evidence: "Factual statement without clear citation".to_string(),
                    source_checked: false,
                    found_in_sources: false,
                });
            }
        }

        findings
    }
}

/// A claim is grounded when its normalized text appears in a chunk, or
/// when every numeric literal in the claim appears in some single chunk.
fn claim_in_sources(claim: &str, chunks: &[Chunk]) -> bool {
    let claim_normalized = normalize(claim);
    let claim_numbers: Vec<&str> = NUMBER_RE
        .find_iter(claim)
        .map(|m| m.as_str())
        .collect();

    for chunk in chunks {
        let chunk_normalized = normalize(&chunk.text);
        if chunk_normalized.contains(&claim_normalized) {
            return true;
        }
        if !claim_numbers.is_empty() {
            let chunk_numbers: Vec<&str> = NUMBER_RE
                .find_iter(&chunk.text)
                .map(|m| m.as_str())
                .collect();
            if claim_numbers.iter().all(|n| chunk_numbers.contains(n)) {
                return true;
            }
        }
    }
    false
}

fn normalize(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Context window around a match, clamped to char boundaries.
fn surrounding(text: &str, start: usize, end: usize, margin: usize) -> &str {
    let mut from = start.saturating_sub(margin);
    while from > 0 && !text.is_char_boundary(from) {
        from -= 1;
    }
    let mut to = (end + margin).min(text.len());
    while to < text.len() && !text.is_char_boundary(to) {
        to += 1;
    }
    &text[from..to]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn chunk(text: &str) -> Chunk {
        Chunk::new(text, "Manual", 0.9)
    }

    #[test]
    fn test_grounded_number_not_flagged() {
        let chunks = vec![chunk("Keep glucose between 70 and 180 mg/dL for a 70% TIR goal.")];
        let findings = HallucinationDetector::new()
            .detect("Aim for 70% time in range with targets of 180 mg/dL.", &chunks);
        assert!(
            findings.iter().all(|f| f.category == "uncited_claim" || f.found_in_sources),
            "grounded numerics must not be flagged: {findings:?}"
        );
        assert!(!findings.iter().any(|f| f.category == "percentage_claim"));
    }

    #[test]
    fn test_ungrounded_percentage_flagged() {
        let chunks = vec![chunk("Exercise lowers glucose.")];
        let findings =
            HallucinationDetector::new().detect("About 85% of users see improvement.", &chunks);
        assert!(findings.iter().any(|f| f.category == "percentage_claim"));
        let finding = findings
            .iter()
            .find(|f| f.category == "percentage_claim")
            .unwrap();
        assert_eq!(finding.confidence, 0.7);
        assert!(finding.source_checked);
    }

    #[test]
    fn test_device_version_flagged_when_unmatched() {
        let findings = HallucinationDetector::new()
            .detect("Loop 3.2 added this feature.", &[chunk("Loop documentation")]);
        let finding = findings.iter().find(|f| f.category == "device_version").unwrap();
        assert_eq!(finding.confidence, 0.8);
    }

    #[test]
    fn test_dosing_instruction_always_flagged() {
        // Even with the exact text in a chunk, dosing language is flagged
        let chunks = vec![chunk("take 5 units before meals")];
        let findings =
            HallucinationDetector::new().detect("You could take 5 units now.", &chunks);
        let finding = findings
            .iter()
            .find(|f| f.category == "dosing_instruction")
            .unwrap();
        assert_eq!(finding.confidence, 0.95);
    }

    #[test]
    fn test_uncited_study_claim_flagged() {
        let findings = HallucinationDetector::new()
            .detect("Studies show better outcomes with CGM use.", &[]);
        assert!(findings.iter().any(|f| f.category == "uncited_claim"));
    }

    #[test]
    fn test_cited_study_claim_not_flagged() {
        let findings = HallucinationDetector::new().detect(
            "According to the ADA documentation, studies show better outcomes with CGM use.",
            &[],
        );
        assert!(!findings.iter().any(|f| f.category == "uncited_claim"));
    }

    #[test]
    fn test_all_numeric_literals_in_chunk_grounds_claim() {
        let chunks = vec![chunk("The guideline range is 70 to 180.")];
        let findings = HallucinationDetector::new()
            .detect("Stay between 70 and 180 mg/dL.", &chunks);
        assert!(!findings.iter().any(|f| f.category == "glucose_value"));
    }

    #[test]
    fn test_exact_match_no_fuzzy_tolerance() {
        let chunks = vec![chunk("Roughly 70% of patients reach target.")];
        let findings = HallucinationDetector::new().detect("About 75% reach target.", &chunks);
        assert!(findings.iter().any(|f| f.category == "percentage_claim"));
    }
}
