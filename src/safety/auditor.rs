//! Safety audit pipeline.
//!
//! Scans generated responses for dose numbers and dangerous phrasing,
//! rewrites blocked spans, runs tier classification (overriding the body
//! on defer/block), enriches allowed responses with clinical guideline
//! citations and appends exactly one tier disclaimer. The hybrid entry
//! point adds parametric-claim extraction, citation enforcement and
//! hallucination scanning.
//!
//! The auditor never returns an error: unexpected input degrades to a
//! tier 1 allow with the generic disclaimer.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock, Mutex};
use tracing::{info, warn};

use crate::knowledge::Chunk;
use crate::llm::LlmClient;
use crate::prompt::GENERAL_KNOWLEDGE_MARKER;
use crate::retrieval::RagQuality;

use super::hallucination::{HallucinationDetector, HallucinationFinding};
use super::tiers::{SafetyTier, SafetyTierClassifier, TierAction, TierDecision, TierInput};
use super::{SafetyFinding, Severity};

/// Replacement for blocked dose spans.
const DOSE_REPLACEMENT: &str = "[specific dose removed - consult your healthcare provider]";
/// Replacement for dosing language inside parametric claims.
const PARAMETRIC_DOSE_REPLACEMENT: &str =
    "[Dosing advice removed - consult your healthcare team]";
/// Generic disclaimer used when the tier classifier produced none.
const DEFAULT_DISCLAIMER: &str = "Disclaimer: This is educational information only. Always \
     consult your healthcare provider before making changes to your diabetes management routine.";

fn compile_tagged(patterns: &[(&str, &'static str)]) -> Vec<(Regex, &'static str)> {
    patterns
        .iter()
        .map(|(p, c)| (Regex::new(&format!("(?i){p}")).expect("invalid regex"), *c))
        .collect()
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?i){p}")).expect("invalid regex"))
        .collect()
}

/// Specific insulin dose statements. Blocked and replaced.
static DOSE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    compile_tagged(&[
        (
            r"\b(take|inject|give|administer|bolus|dose)\s+(\d+\.?\d*)\s*(u|units?|iu)\b",
            "specific_dose",
        ),
        (
            r"\b(\d+\.?\d*)\s*(u|units?|iu)\s+(of\s+)?(insulin|humalog|novolog|fiasp|apidra|lantus|levemir|tresiba|basaglar)\b",
            "specific_dose",
        ),
        (
            r"\b(increas(?:e|ing)|reduc(?:e|ing)|decreas(?:e|ing)|add(?:ing)?|subtract(?:ing)?)\b.{0,30}?\b(\d+\.?\d*)\s*(u|units?|iu)\b",
            "dose_adjustment",
        ),
        (
            r"\b(dose|dosage)\s+(should\s+be|is|of)\s+(\d+\.?\d*)\s*(u|units?|iu)\b",
            "dose_recommendation",
        ),
        (
            r"\b(\d+\.?\d*)\s*(u|units?|iu)\s+(for|per|covers?)\s+\d+\s*(g|grams?|carbs?)\b",
            "calculated_dose",
        ),
    ])
});

/// Dangerous phrasing. Warning only, never replaced.
static DANGER_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    compile_tagged(&[
        (
            r"\b(skip|stop|discontinue)\s+(your\s+)?(insulin|medication|meds)\b",
            "medication_advice",
        ),
        (
            r"\b(don'?t|do\s+not|never)\s+(take|use|inject)\s+(insulin|medication)\b",
            "medication_advice",
        ),
        (r"\b(overdose|double\s+dose|extra\s+dose)\b", "dangerous_dosing"),
        (r"\bstack(ing)?\s+(insulin|doses?|bolus(es)?)\b", "insulin_stacking"),
    ])
});

/// Signs that parametric knowledge leaked unsafe specifics.
static PARAMETRIC_VIOLATION_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> =
    LazyLock::new(|| {
        compile_tagged(&[
            (
                r"\b(step\s+\d+|first,?\s+go\s+to|navigate\s+to|tap\s+on|select\s+the|press\s+the).{0,50}(menu|settings|screen|option|button)\b",
                "device_procedure_hallucination",
            ),
            (
                r"\b(generally|typically|usually|often|commonly)\s+.{0,30}\b(\d+\.?\d*)\s*(u|units?|mg|mmol|%)",
                "parametric_number_guess",
            ),
            (
                r"\bset\s+(your|the)\s+(basal|bolus|correction|sensitivity|ratio)\s+to\s+\d+",
                "uncited_config_advice",
            ),
            (
                r"\b(recommended|should\s+be|optimal|ideal)\s+.{0,20}\b(\d+\.?\d*)\s*(u|units?|mg/dL|mmol/L)",
                "uncited_clinical_number",
            ),
        ])
    });

/// Markers the hybrid prompt requires on parametric content.
static PARAMETRIC_MARKERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\[General medical knowledge\]",
        r"\[General medical knowledge,\s*confidence=[\d.]+\]",
        r"Based on general understanding",
        r"From general medical knowledge",
    ])
});

/// Generic RAG citation phrasings.
static RAG_CITATION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\b(OpenAPS|Loop|AndroidAPS)\s+(documentation|docs|manual)\b",
        r"\b(ADA|American Diabetes Association)\s+(Standards|guidelines)\b",
        r"\bAustralian\s+Diabetes\s+Guidelines\b",
        r"\baccording to\s+(the\s+)?(documentation|manual|guidelines)\b",
        r"\bthe\s+(documentation|manual)\s+(states|says|recommends|suggests)\b",
        r"\bbased on\s+(the\s+)?(retrieved|documentation|manual)\b",
        r"\bper\s+the\s+(manual|guide|documentation)\b",
        r"\[\d+\]",
    ])
});

/// Device-related query markers.
static DEVICE_QUERY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\b(openaps|loop|androidaps|camaps|control.?iq|omnipod|tandem|medtronic|dexcom|libre|guardian)\b",
        r"\b(pump|cgm|sensor|pod|transmitter|receiver)\b",
        r"\b(autosens|autotune|smb|amb|uam|oref)\b",
        r"\b(temp basal|extended bolus|super bolus)\b",
    ])
});

/// Aggressive dosing detection inside parametric claims.
static PARAMETRIC_DOSING_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    compile_tagged(&[
        (
            r"\b(need|require|should\s+take|recommend)\s+.{0,30}\d+\.?\d*\s*(u|units?)\b",
            "recommended_dose",
        ),
        (r"\b(typical|average|standard)\s+(dose|bolus|basal)\s+.{0,20}\d+", "typical_dose"),
        (r"\bstart\s+with\s+\d+\.?\d*\s*(u|units?)\b", "starting_dose"),
        (r"\badjust\s+.{0,30}\b(up|down)\s+.{0,10}\d+", "adjustment_recommendation"),
        (r"\b\d+\.?\d*\s*(u|units?)/(kg|kilogram)\b", "dose_per_kg_ratio"),
    ])
});

/// Queries asking for dosing advice (used for the safety fallback too).
static DOSING_QUERY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\bhow much insulin\b",
        r"\binsulin dose\b",
        r"\bbolus calculation\b",
        r"\bcalculate.*bolus\b",
        r"\bcarb ratio\b",
        r"\binsulin.*carb.*ratio\b",
        r"\bcalculate.*insulin\b",
        r"\bdose.*carbs?\b",
        r"\binsulin.*for.*carbs?\b",
    ])
});

/// Unmarked hedged-generalization sentences counted as parametric content.
static GENERAL_SENTENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(generally|typically|usually|often|commonly)\b.{20,100}[.!?]")
        .expect("invalid regex")
});

/// Clinical guideline citations appended to allowed responses when the
/// response touches the matching topic.
static CLINICAL_GUIDELINE_CITATIONS: LazyLock<Vec<(Regex, Vec<&'static str>)>> =
    LazyLock::new(|| {
        let topics: [(&str, Vec<&'static str>); 6] = [
            (
                r"\b(pump|CGM|continuous glucose monitor|closed[- ]?loop|hybrid|sensor|libre|camaps)\b",
                vec![
                    "This aligns with ADA 2026 Standards Section 7 recommendations for diabetes technology",
                    "The Australian Diabetes Guidelines (Section 3.1-3.3) provide evidence for technology benefits",
                ],
            ),
            (
                r"\b(time[- ]?in[- ]?range|TIR|target|A1C|HbA1c|glucose goal|70[- ]?180)\b",
                vec!["This aligns with ADA 2026 Standards Section 6 glycemic targets"],
            ),
            (
                r"\b(hybrid closed[- ]?loop|automated insulin delivery|AID|camaps|control[- ]?iq)\b",
                vec![
                    "ADA 2026 Standards Section 7 supports hybrid closed-loop systems for appropriate candidates",
                    "The Australian Diabetes Guidelines (Section 3.3) provide conditional recommendation for hybrid closed-loop systems",
                ],
            ),
            (
                r"\b(cardiovascular|heart|CVD|ASCVD|cardio|cardiac)\b",
                vec!["This aligns with ADA 2026 Standards Section 10 cardiovascular disease management"],
            ),
            (
                r"\b(kidney|renal|CKD|nephropathy|eGFR|albuminuria)\b",
                vec!["This aligns with ADA 2026 Standards Section 11 chronic kidney disease recommendations"],
            ),
            (
                r"\b(retinopathy|neuropathy|foot|complication|microvascular)\b",
                vec!["This aligns with ADA 2026 Standards Section 12 complication management"],
            ),
        ];
        topics
            .into_iter()
            .map(|(p, citations)| {
                (Regex::new(&format!("(?i){p}")).expect("invalid regex"), citations)
            })
            .collect()
    });

/// Result of a plain (non-hybrid) audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResult {
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub original_response: String,
    pub safe_response: String,
    pub findings: Vec<SafetyFinding>,
    pub tier: SafetyTier,
    pub tier_action: TierAction,
    pub tier_reason: String,
    pub tier_disclaimer: String,
}

impl AuditResult {
    pub fn max_severity(&self) -> Severity {
        self.findings
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(Severity::Info)
    }

    pub fn was_modified(&self) -> bool {
        self.original_response != self.safe_response
    }
}

/// Knowledge source shares disclosed on hybrid audits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeSources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rag: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parametric: Option<f64>,
    pub glooko_present: bool,
}

/// Result of a hybrid audit: the plain result plus parametric analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridAuditResult {
    #[serde(flatten)]
    pub base: AuditResult,
    pub knowledge_sources: KnowledgeSources,
    pub parametric_claims: Vec<String>,
    pub rag_citations_found: bool,
    pub parametric_ratio: f64,
    pub is_device_query: bool,
    pub device_rag_available: bool,
    pub inappropriate_parametric_use: bool,
    pub hallucination_findings: Vec<HallucinationFinding>,
    pub hybrid_checks_passed: bool,
}

/// Inputs to a hybrid audit.
#[derive(Debug, Clone, Default)]
pub struct HybridResponseInput<'a> {
    pub answer: &'a str,
    pub sources_used: &'a [String],
    pub rag_quality: Option<&'a RagQuality>,
    pub requires_enhanced_check: bool,
    /// Retrieved chunks, for hallucination cross-referencing
    pub chunks: &'a [Chunk],
    pub glooko_available: bool,
}

/// In-memory audit counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AuditSummary {
    pub total: usize,
    pub blocked: usize,
    pub warnings: usize,
    pub info: usize,
    pub modified: usize,
}

/// The safety audit orchestrator.
pub struct SafetyAuditor {
    tier_classifier: SafetyTierClassifier,
    hallucination: HallucinationDetector,
    summary: Mutex<AuditSummary>,
    /// Hallucination scan trigger on hybrid audits
    enhanced_check_threshold: f64,
}

impl Default for SafetyAuditor {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyAuditor {
    pub fn new() -> Self {
        Self {
            tier_classifier: SafetyTierClassifier::new(),
            hallucination: HallucinationDetector::new(),
            summary: Mutex::new(AuditSummary::default()),
            enhanced_check_threshold: 0.3,
        }
    }

    /// Attach an LLM for intent-classification fallback in the tier
    /// classifier.
    pub fn with_intent_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.tier_classifier = SafetyTierClassifier::new().with_llm(llm);
        self
    }

    pub fn with_enhanced_check_threshold(mut self, threshold: f64) -> Self {
        self.enhanced_check_threshold = threshold;
        self
    }

    /// Whether a query asks for dosing advice.
    pub fn is_dosing_query(query: &str) -> bool {
        let lower = query.to_lowercase();
        DOSING_QUERY_PATTERNS.iter().any(|p| p.is_match(&lower))
    }

    /// Whether a query is about specific devices or algorithms.
    pub fn is_device_related_query(query: &str) -> bool {
        let lower = query.to_lowercase();
        DEVICE_QUERY_PATTERNS.iter().any(|p| p.is_match(&lower))
    }

    /// Audit a non-hybrid response.
    pub async fn audit_text(&self, text: &str, query: &str, enhanced_check: bool) -> AuditResult {
        let mut findings = detect_doses(text);
        findings.extend(detect_dangers(text));
        if enhanced_check {
            findings.extend(detect_parametric_violations(text));
        }

        let mut safe_text = apply_transformations(text, &findings);

        let tier_decision = self
            .tier_classifier
            .classify(&TierInput {
                query,
                response_text: &safe_text,
                ..TierInput::default()
            })
            .await;
        safe_text = apply_tier_outcome(safe_text, &tier_decision);

        let result = AuditResult {
            timestamp: Utc::now(),
            query: query.to_string(),
            original_response: text.to_string(),
            safe_response: safe_text,
            findings,
            tier: tier_decision.tier,
            tier_action: tier_decision.action,
            tier_reason: tier_decision.reason,
            tier_disclaimer: tier_decision.disclaimer,
        };
        self.record(&result);
        result
    }

    /// Audit a response produced under the hybrid prompt.
    pub async fn audit_hybrid_response(
        &self,
        input: &HybridResponseInput<'_>,
        query: &str,
    ) -> HybridAuditResult {
        let text = input.answer;
        let parametric_used = input.sources_used.iter().any(|s| s == "parametric");

        let mut findings = detect_doses(text);
        findings.extend(detect_dangers(text));
        if input.requires_enhanced_check || parametric_used {
            findings.extend(detect_parametric_violations(text));
        }

        // Dosing language inside a parametric claim is blocked outright.
        let parametric_claims = extract_parametric_claims(text);
        for claim in &parametric_claims {
            let dose_phrases = dosing_phrases(&claim.text);
            if !dose_phrases.is_empty() {
                findings.push(SafetyFinding::blocked(
                    "parametric_dosing",
                    truncate(&claim.text, 100),
                    PARAMETRIC_DOSE_REPLACEMENT,
                    format!(
                        "Dosing advice detected in parametric section: {:?}",
                        &dose_phrases[..dose_phrases.len().min(2)]
                    ),
                ));
            }
        }

        // RAG citation enforcement: retrieved sources must be cited when
        // parametric knowledge is also in play.
        let expected_sources: Vec<String> = input
            .rag_quality
            .map(|q| q.sources_covered.clone())
            .unwrap_or_default();
        let chunk_count = input.rag_quality.map(|q| q.chunk_count).unwrap_or(0);
        let mut rag_citations_found = false;
        if chunk_count > 0 {
            rag_citations_found = contains_rag_citations(text, &expected_sources);
            if !rag_citations_found && parametric_used {
                findings.push(SafetyFinding::warning(
                    "missing_rag_citation",
                    "",
                    format!(
                        "RAG sources available ({chunk_count} chunks from {expected_sources:?}) \
                         but not cited in response"
                    ),
                ));
            }
        }

        // Device queries with device docs retrieved should not lean on
        // parametric knowledge.
        let is_device_query = Self::is_device_related_query(query);
        let device_rag_available = expected_sources.iter().any(|source| {
            let lower = source.to_lowercase();
            ["openaps", "loop", "androidaps", "camaps", "pump", "cgm", "documentation"]
                .iter()
                .any(|kw| lower.contains(kw))
        });
        let parametric_ratio = parametric_ratio(text, &parametric_claims);
        let inappropriate_parametric_use =
            is_device_query && device_rag_available && parametric_ratio > 0.5;
        if inappropriate_parametric_use {
            findings.push(SafetyFinding::warning(
                "inappropriate_parametric_use",
                "",
                format!(
                    "Response relies {:.0}% on parametric knowledge when device-specific docs \
                     available",
                    parametric_ratio * 100.0
                ),
            ));
        }

        // Hallucination scan when parametric knowledge is in play.
        let mut hallucination_findings = Vec::new();
        if parametric_ratio > self.enhanced_check_threshold || parametric_used {
            hallucination_findings = self.hallucination.detect(text, input.chunks);
            for h in &hallucination_findings {
                if h.confidence >= 0.8 {
                    findings.push(SafetyFinding::warning(
                        format!("hallucination_{}", h.category),
                        truncate(&h.claim, 100),
                        format!("Potential hallucination: {}", h.evidence),
                    ));
                }
            }
        }

        let mut safe_text = apply_transformations(text, &findings);

        let tier_decision = self
            .tier_classifier
            .classify(&TierInput {
                query,
                response_text: &safe_text,
                sources_used: input.sources_used,
                rag_quality: input.rag_quality,
                glooko_available: input.glooko_available,
            })
            .await;
        safe_text = apply_tier_outcome(safe_text, &tier_decision);

        let knowledge_sources = KnowledgeSources {
            rag: input
                .sources_used
                .iter()
                .any(|s| s == "rag")
                .then(|| round2(1.0 - parametric_ratio)),
            parametric: parametric_used.then(|| round2(parametric_ratio)),
            glooko_present: input.sources_used.iter().any(|s| s == "glooko"),
        };

        let hybrid_categories = [
            "parametric_dosing",
            "inappropriate_parametric_use",
            "missing_rag_citation",
        ];
        let hybrid_checks_passed = !findings.iter().any(|f| {
            hybrid_categories.contains(&f.category.as_str())
                && f.severity >= Severity::Warning
        });

        let base = AuditResult {
            timestamp: Utc::now(),
            query: query.to_string(),
            original_response: text.to_string(),
            safe_response: safe_text,
            findings,
            tier: tier_decision.tier,
            tier_action: tier_decision.action,
            tier_reason: tier_decision.reason,
            tier_disclaimer: tier_decision.disclaimer,
        };
        self.record(&base);

        info!(
            tier = ?base.tier,
            action = ?base.tier_action,
            parametric_ratio,
            hybrid_checks_passed,
            "[safety] hybrid audit complete"
        );

        HybridAuditResult {
            base,
            knowledge_sources,
            parametric_claims: parametric_claims
                .iter()
                .map(|c| truncate(&c.text, 100))
                .collect(),
            rag_citations_found,
            parametric_ratio,
            is_device_query,
            device_rag_available,
            inappropriate_parametric_use,
            hallucination_findings,
            hybrid_checks_passed,
        }
    }

    /// Counters across all audits this auditor has run.
    pub fn summary(&self) -> AuditSummary {
        *self.summary.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn record(&self, result: &AuditResult) {
        let mut summary = self.summary.lock().unwrap_or_else(|p| p.into_inner());
        summary.total += 1;
        match result.max_severity() {
            Severity::Blocked => summary.blocked += 1,
            Severity::Warning => summary.warnings += 1,
            Severity::Info => summary.info += 1,
        }
        if result.was_modified() {
            summary.modified += 1;
        }
        if result.tier_action != TierAction::Allow {
            warn!(tier = ?result.tier, action = ?result.tier_action, "[safety] response overridden");
        }
    }
}

fn detect_doses(text: &str) -> Vec<SafetyFinding> {
    let mut findings = Vec::new();
    for (pattern, category) in DOSE_PATTERNS.iter() {
        for m in pattern.find_iter(text) {
            findings.push(SafetyFinding::blocked(
                *category,
                m.as_str(),
                DOSE_REPLACEMENT,
                format!("Specific insulin dose detected: '{}'", m.as_str()),
            ));
        }
    }
    findings
}

fn detect_dangers(text: &str) -> Vec<SafetyFinding> {
    let mut findings = Vec::new();
    for (pattern, category) in DANGER_PATTERNS.iter() {
        for m in pattern.find_iter(text) {
            findings.push(SafetyFinding::warning(
                *category,
                m.as_str(),
                format!("Potentially dangerous advice detected: '{}'", m.as_str()),
            ));
        }
    }
    findings
}

/// Parametric leakage checks. Content attributed with the general
/// knowledge marker within +/-100 chars is downgraded to info.
fn detect_parametric_violations(text: &str) -> Vec<SafetyFinding> {
    let mut findings = Vec::new();
    for (pattern, category) in PARAMETRIC_VIOLATION_PATTERNS.iter() {
        for m in pattern.find_iter(text) {
            let context = surrounding(text, m.start(), m.end(), 100);
            let attributed = context.contains(GENERAL_KNOWLEDGE_MARKER)
                || context.contains("Based on general understanding");
            let matched = truncate(m.as_str(), 50);
            if attributed {
                findings.push(SafetyFinding::info(
                    *category,
                    m.as_str(),
                    format!("Parametric content detected but properly attributed: '{matched}'"),
                ));
            } else {
                findings.push(SafetyFinding::warning(
                    *category,
                    m.as_str(),
                    format!("Potential parametric hallucination (unattributed): '{matched}'"),
                ));
            }
        }
    }
    findings
}

/// A parametric claim: the sentence span around a knowledge marker.
#[derive(Debug, Clone)]
struct ParametricClaim {
    text: String,
    start: usize,
    end: usize,
}

/// Extract sentence spans around each parametric marker, capped at 200
/// chars of lookback/lookahead.
fn extract_parametric_claims(text: &str) -> Vec<ParametricClaim> {
    const SPAN_CAP: usize = 200;
    let bytes = text.as_bytes();
    let mut claims = Vec::new();

    for pattern in PARAMETRIC_MARKERS.iter() {
        for m in pattern.find_iter(text) {
            let mut start = m.start();
            while start > 0
                && !matches!(bytes[start - 1], b'.' | b'!' | b'?' | b'\n')
                && m.start() - start <= SPAN_CAP
            {
                start -= 1;
            }
            while !text.is_char_boundary(start) {
                start -= 1;
            }

            let mut end = m.end();
            while end < bytes.len()
                && !matches!(bytes[end], b'.' | b'!' | b'?' | b'\n')
                && end - m.end() <= SPAN_CAP
            {
                end += 1;
            }
            if end < bytes.len() && matches!(bytes[end], b'.' | b'!' | b'?') {
                end += 1;
            }
            while end < bytes.len() && !text.is_char_boundary(end) {
                end += 1;
            }

            claims.push(ParametricClaim {
                text: text[start..end].trim().to_string(),
                start,
                end,
            });
        }
    }
    claims
}

/// Dosing phrases found in a text span.
fn dosing_phrases(text: &str) -> Vec<String> {
    let mut matched = Vec::new();
    for (pattern, _) in DOSE_PATTERNS.iter() {
        for m in pattern.find_iter(text) {
            matched.push(m.as_str().to_string());
        }
    }
    for (pattern, _) in PARAMETRIC_DOSING_PATTERNS.iter() {
        for m in pattern.find_iter(text) {
            matched.push(m.as_str().to_string());
        }
    }
    matched
}

/// Whether the response cites any expected source or uses a generic
/// citation phrasing.
fn contains_rag_citations(text: &str, expected_sources: &[String]) -> bool {
    for source in expected_sources {
        let words: Vec<&str> = source.split_whitespace().collect();
        if words.len() >= 2 {
            let pattern = format!(
                r"(?i)\b{}\s+{}\b",
                regex::escape(words[0]),
                regex::escape(words[1])
            );
            if Regex::new(&pattern)
                .map(|re| re.is_match(text))
                .unwrap_or(false)
            {
                return true;
            }
        } else if !source.is_empty() {
            let pattern = format!(r"(?i)\b{}\b", regex::escape(source));
            if Regex::new(&pattern)
                .map(|re| re.is_match(text))
                .unwrap_or(false)
            {
                return true;
            }
        }
    }
    RAG_CITATION_PATTERNS.iter().any(|p| p.is_match(text))
}

/// Fraction of the response attributable to parametric knowledge: marked
/// claim spans plus unmarked hedged generalizations, non-overlapping.
fn parametric_ratio(text: &str, claims: &[ParametricClaim]) -> f64 {
    if text.is_empty() {
        return 0.0;
    }
    let total = text.len() as f64;
    let mut parametric_chars: usize = claims.iter().map(|c| c.end - c.start).sum();

    for m in GENERAL_SENTENCE_PATTERN.find_iter(text) {
        let overlaps = claims
            .iter()
            .any(|c| c.start <= m.start() && m.start() <= c.end);
        if !overlaps {
            parametric_chars += m.len();
        }
    }

    (parametric_chars as f64 / total).min(1.0)
}

/// Replace blocked spans, case-insensitively, via the collected match
/// text.
fn apply_transformations(text: &str, findings: &[SafetyFinding]) -> String {
    let mut result = text.to_string();
    for finding in findings {
        let (Severity::Blocked, Some(replacement)) =
            (finding.severity, finding.replacement_text.as_deref())
        else {
            continue;
        };
        if finding.original_text.is_empty() {
            continue;
        }
        let pattern = format!("(?i){}", regex::escape(&finding.original_text));
        if let Ok(re) = Regex::new(&pattern) {
            result = re.replace_all(&result, replacement).into_owned();
        }
    }
    result
}

/// Override the body on defer/block, add guideline citations on allow,
/// then append exactly one disclaimer.
fn apply_tier_outcome(mut text: String, decision: &TierDecision) -> String {
    if decision.action != TierAction::Allow {
        if let Some(override_response) = &decision.override_response {
            if !override_response.is_empty() {
                text = override_response.clone();
            }
        }
    } else {
        let citations = clinical_guideline_citations(&text);
        if !citations.is_empty() {
            text.push_str(&format_guideline_support(&citations));
        }
    }
    add_disclaimer(&text, &decision.disclaimer)
}

/// Citations for evidence-based topics the response touches, deduplicated
/// and skipping any already present in the text.
fn clinical_guideline_citations(text: &str) -> Vec<&'static str> {
    let mut citations = Vec::new();
    for (pattern, topic_citations) in CLINICAL_GUIDELINE_CITATIONS.iter() {
        if !pattern.is_match(text) {
            continue;
        }
        for citation in topic_citations {
            if !text.contains(citation) && !citations.contains(citation) {
                citations.push(*citation);
            }
        }
    }
    citations
}

fn format_guideline_support(citations: &[&str]) -> String {
    if citations.len() == 1 {
        format!("\n\n**Clinical Evidence:** {}.", citations[0])
    } else {
        let list = citations
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n");
        format!("\n\n**Clinical Evidence:**\n{list}")
    }
}

/// Append the tier disclaimer unless one is already present.
fn add_disclaimer(text: &str, disclaimer: &str) -> String {
    let disclaimer = if disclaimer.is_empty() {
        DEFAULT_DISCLAIMER
    } else {
        disclaimer
    };
    if text.to_lowercase().contains("disclaimer:") {
        return text.to_string();
    }
    format!("{text}\n\n---\n**{disclaimer}**")
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

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

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
