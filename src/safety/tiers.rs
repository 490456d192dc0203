//! Evidence-graded safety tiers.
//!
//! Four tiers: education, personalized analysis with small testable
//! adjustments, clinical decisions deferred to the care team, and
//! dangerous content that is blocked outright. Classification is
//! regex-first with an optional LLM intent fallback for queries the
//! catalogs cannot place.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{info, warn};

use crate::llm::{GenerationConfig, LlmClient};
use crate::retrieval::RagQuality;

/// Evidence-graded safety tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyTier {
    /// Tier 1: evidence-based education
    Education,
    /// Tier 2: personalized analysis with small, testable adjustments
    Personalized,
    /// Tier 3: clinical decision requiring clinician oversight
    Clinical,
    /// Tier 4: dangerous advice
    Dangerous,
}

/// Action attached to a tier decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierAction {
    Allow,
    Defer,
    Block,
}

/// Tier decision with safety action and messaging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierDecision {
    pub tier: SafetyTier,
    pub action: TierAction,
    pub reason: String,
    pub disclaimer: String,
    /// Replaces the response body when the action is defer or block
    pub override_response: Option<String>,
    pub evidence_tags: Vec<String>,
}

/// Inputs to one classification.
#[derive(Debug, Clone, Default)]
pub struct TierInput<'a> {
    pub query: &'a str,
    pub response_text: &'a str,
    pub sources_used: &'a [String],
    pub rag_quality: Option<&'a RagQuality>,
    pub glooko_available: bool,
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?i){p}")).expect("invalid regex"))
        .collect()
}

/// Imperative instructions to skip/stop medication, overdoses, stacking.
static DANGEROUS_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\b(you should|i recommend|please|make sure to|be sure to|don't forget to)\s+.{0,20}(skip|stop|discontinue)\s+(your\s+)?(insulin|medication|meds)\b",
        r"\b(skip|stop|discontinue)\s+(your\s+|taking\s+)?(insulin|medication|meds)\b",
        r"\b(do\s+not|don't|never)\s+(take|use|inject)\s+(your\s+)?(insulin|medication|meds)\b",
        r"\b(overdose|double\s+dose|extra\s+dose)\b",
        r"\bstack(ing)?\s+(insulin|doses?|bolus(es)?)\b",
    ])
});

/// Words after "stop insulin" that turn the phrase descriptive:
/// "stop insulin delivery", "stop insulin if...".
const STOP_FOLLOWERS: [&str; 4] = ["delivery", "if", "when", "because"];

/// Queries asking for a dose calculation.
static DOSING_REQUEST_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\bhow much insulin\s+(should|do|to)\b",
        r"\bwhat dose\s+(should|do|of)\b",
        r"\bcalculate\s+(my\s+)?bolus\b",
        r"\binsulin\s+dose\s+for\b",
        r"\bunits?\s+(for|to cover)\b",
    ])
});

/// Legitimate educational/strategy intents checked before the tier 3/4
/// heuristics that would otherwise fire on benign mentions of "adjust".
static EDUCATIONAL_STRATEGY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\bwhat\s+strateg(y|ies)\b",
        r"\bways?\s+to\s+(improve|reduce|fix|address|manage|handle|mitigate|account)\b",
        r"\bhow\s+(can|do|should)\s+i\s+(improve|reduce|fix|address|manage|handle|mitigate|account)\b",
        r"\bhow\s+to\s+(improve|reduce|fix|address|manage|handle|mitigate|account)\b",
        r"\bwhat\s+(can|should)\s+i\s+do\s+(about|for)\b",
        r"\btips?\s+(for|to|on)\b",
        r"\bhelp\s+(with|me)\b",
        r"\b(slow[\s\-]?carb|high[\s\-]?fat|complex\s+carb|protein[\s\-]?rich|fast\s+carb)\b",
        r"\b(meals?|food|eat|eating)\s+(strategies|tips|handling|management|approach)\b",
        r"\b(pizza|pasta|fat|fiber|delayed|spike|absorption|glucose|meal)\b.*\b(account|handle|manage|deal|strategy)\b",
        r"\bdawn\s+phenomenon\b",
        r"\btime\s+in\s+range\b",
        r"\b(high|low)\s+(at night|overnight|morning|after meals?)\b",
        r"\bpattern(s)?\s+(analysis|review|management)\b",
        r"\bbasal\s+(testing|adjustment|optimization)\b",
        r"\bwhat\s+to\s+discuss\s+with\b",
        r"\bquestions?\s+(for|to ask)\s+(my\s+)?(doctor|endo|team|provider)\b",
    ])
});

/// Clinical decisions that belong with the care team.
static CLINICAL_DECISION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\b(can|should)\s+i\s+(stop|discontinue|pause|quit|change|switch)\s+(my\s+)?(insulin|medication|meds?|metformin|glipizide|glyburide|januvia|ozempic|trulicity|jardiance|farxiga|invokana)\b",
        r"\b(stop|discontinue|quit|change|switch)\s+my\s+\w+(in|ide|ity|iga|ana)\b",
        r"\b(you\s+should|i\s+recommend)\s+(stop|discontinue|pause|quit|start|begin|switch|change)\s+(your\s+)?(insulin|medication|meds?)\b",
        r"\b(pregnancy|pregnant|surgery|procedure)\b.*\b(insulin|medication|dose)\b",
    ])
});

/// Markers of cited evidence in responses.
static EVIDENCE_MARKERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\b(ADA|American Diabetes Association)\b",
        r"\b(OpenAPS|Loop|AndroidAPS)\b",
        r"\b(device manual|user manual|manufacturer)\b",
        r"\b(documentation|guidelines|standards)\b",
    ])
});

/// Markers that the response is grounded in the user's own data.
static PERSONAL_DATA_MARKERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\b(your data|your glucose|your readings|your log)\b",
        r"\b(time in range|TIR|hourly|pattern)\b",
        r"\b(glooko)\b",
    ])
});

/// Markers of a testing/monitoring protocol.
static TESTING_MARKERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\b(test|recheck|check|monitor|confirm|verify|track)\b",
        r"\b(fingerstick|meter|CGM)\b",
    ])
});

// The gap is bounded so "HbA1c target for type 1 diabetes" does not pair
// "a1c" with the "1" of "type 1".
static A1C_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(a1c|hba1c)\b[^\d]{0,20}(\d+(?:\.\d+)?)").expect("invalid regex")
});

static UNITS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d+(?:\.\d+)?)\s*(u|units?)\b").expect("invalid regex")
});

static PERCENT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})\s*%").expect("invalid regex"));

/// Classifies (query, response) pairs into safety tiers.
pub struct SafetyTierClassifier {
    /// Optional intent-classification fallback for queries regex cannot place
    llm: Option<Arc<dyn LlmClient>>,
    llm_timeout: Duration,
}

impl Default for SafetyTierClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyTierClassifier {
    pub fn new() -> Self {
        Self {
            llm: None,
            llm_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Classify a query/response pair. First matching rule wins.
    pub async fn classify(&self, input: &TierInput<'_>) -> TierDecision {
        let query_lower = input.query.to_lowercase();
        let response_lower = input.response_text.to_lowercase();

        // Educational-strategy queries are allowed to mention units and
        // "adjust" in an explanatory register; resolve that flag first.
        let is_educational = self.is_educational_strategy_query(&query_lower).await;

        // Tier 4: dangerous advice always blocks, whatever the query was.
        if contains_dangerous_advice(&response_lower) {
            return self.tier4(
                "Potentially dangerous instruction detected (e.g., skipping medication or unsafe dosing).",
                tier4_block_message(),
            );
        }

        if is_dosing_request(&query_lower) {
            return self.tier4(
                "Specific dose calculation requests require clinician oversight.",
                dosing_defer_message(),
            );
        }

        if !is_educational && UNITS_PATTERN.is_match(input.response_text) {
            return self.tier4(
                "Specific insulin dosing detected, which can be unsafe without clinician oversight.",
                tier4_block_message(),
            );
        }

        if contains_dangerous_a1c_target(&query_lower, &response_lower) {
            return self.tier4(
                "Unsafe A1C target detected; overly aggressive targets can increase hypoglycemia risk.",
                tier4_block_message(),
            );
        }

        // Tier 3: clinical decisions defer to the provider.
        if !is_educational && is_clinical_decision(&query_lower, &response_lower) {
            return TierDecision {
                tier: SafetyTier::Clinical,
                action: TierAction::Defer,
                reason: "Clinical decision requires individualized assessment and clinician oversight."
                    .to_string(),
                disclaimer: tier_disclaimer(SafetyTier::Clinical),
                override_response: Some(tier3_defer_message()),
                evidence_tags: Vec::new(),
            };
        }

        // Tier 2: personalized analysis with small adjustments and testing.
        if is_personalized_analysis(&response_lower, input.sources_used, input.glooko_available)
            && has_small_adjustment(input.response_text)
            && has_testing_protocol(&response_lower)
        {
            return TierDecision {
                tier: SafetyTier::Personalized,
                action: TierAction::Allow,
                reason: "Personalized pattern analysis with small, testable adjustments."
                    .to_string(),
                disclaimer: tier_disclaimer(SafetyTier::Personalized),
                override_response: None,
                evidence_tags: evidence_tags(input),
            };
        }

        // Tier 1: evidence-based education (default).
        TierDecision {
            tier: SafetyTier::Education,
            action: TierAction::Allow,
            reason: "Educational guidance with evidence markers or general self-management support."
                .to_string(),
            disclaimer: tier_disclaimer(SafetyTier::Education),
            override_response: None,
            evidence_tags: evidence_tags(input),
        }
    }

    fn tier4(&self, reason: &str, override_response: String) -> TierDecision {
        TierDecision {
            tier: SafetyTier::Dangerous,
            action: TierAction::Block,
            reason: reason.to_string(),
            disclaimer: tier_disclaimer(SafetyTier::Dangerous),
            override_response: Some(override_response),
            evidence_tags: Vec::new(),
        }
    }

    async fn is_educational_strategy_query(&self, query_lower: &str) -> bool {
        if EDUCATIONAL_STRATEGY_PATTERNS
            .iter()
            .any(|p| p.is_match(query_lower))
        {
            return true;
        }
        // LLM fallback for typos and phrasings the catalog misses
        if let Some(llm) = &self.llm {
            return self.llm_classify_educational_intent(llm, query_lower).await;
        }
        false
    }

    /// Strict binary intent classification; anything other than a clear
    /// EDUCATIONAL answer is treated as PRESCRIPTIVE.
    async fn llm_classify_educational_intent(
        &self,
        llm: &Arc<dyn LlmClient>,
        query: &str,
    ) -> bool {
        let prompt = format!(
            "Classify this diabetes-related query.\n\n\
             A query is EDUCATIONAL if it asks:\n\
             - For strategies, tips, approaches, or general guidance on managing a situation\n\
             - How to handle, manage, improve, mitigate, deal with, or address a problem\n\
             - To explain concepts, patterns, or general diabetes management\n\
             - About ways to prevent or reduce problems\n\
             Examples: \"how mitigate highs\", \"ways 2 handle low sugar\", \"tips for managing my glucose\"\n\n\
             A query is PRESCRIPTIVE if it asks:\n\
             - For a specific insulin dose amount or calculation\n\
             - To determine exact medication doses or changes\n\
             - Clinical decisions like starting/stopping medications\n\
             Examples: \"how much insulin for 200 mg/dl\", \"calculate my bolus\", \"should I stop my metformin\"\n\n\
             Query: \"{query}\"\n\n\
             Answer with exactly one word: EDUCATIONAL or PRESCRIPTIVE"
        );

        let config = GenerationConfig::new(0.0, 20);
        let result =
            tokio::time::timeout(self.llm_timeout, llm.generate(&prompt, config)).await;
        match result {
            Ok(Ok(response)) => {
                let verdict = response.text.trim().to_uppercase();
                let educational = verdict.contains("EDUCATIONAL");
                info!(%verdict, educational, "[tiers] LLM intent classification");
                educational
            }
            Ok(Err(e)) => {
                warn!("[tiers] LLM intent classification failed: {e}, defaulting to regex-only");
                false
            }
            Err(_) => {
                warn!("[tiers] LLM intent classification timed out");
                false
            }
        }
    }
}

fn contains_dangerous_advice(response_lower: &str) -> bool {
    for (i, pattern) in DANGEROUS_PATTERNS.iter().enumerate() {
        for m in pattern.find_iter(response_lower) {
            // The bare skip/stop pattern also matches descriptive phrases
            // like "stop insulin delivery"; skip those by peeking at the
            // next word.
            if i == 1 {
                let rest = response_lower[m.end()..].trim_start();
                let next_word: String = rest
                    .chars()
                    .take_while(|c| c.is_ascii_alphabetic())
                    .collect();
                if STOP_FOLLOWERS.contains(&next_word.as_str()) {
                    continue;
                }
            }
            return true;
        }
    }
    false
}

fn is_dosing_request(query_lower: &str) -> bool {
    DOSING_REQUEST_PATTERNS.iter().any(|p| p.is_match(query_lower))
}

fn contains_dangerous_a1c_target(query_lower: &str, response_lower: &str) -> bool {
    let text = format!("{query_lower} {response_lower}");
    for captures in A1C_PATTERN.captures_iter(&text) {
        if let Some(value) = captures.get(2).and_then(|m| m.as_str().parse::<f64>().ok()) {
            if value < 5.5 {
                return true;
            }
        }
    }
    false
}

fn is_clinical_decision(query_lower: &str, response_lower: &str) -> bool {
    let text = format!("{query_lower} {response_lower}");
    CLINICAL_DECISION_PATTERNS.iter().any(|p| p.is_match(&text))
}

fn is_personalized_analysis(
    response_lower: &str,
    sources_used: &[String],
    glooko_available: bool,
) -> bool {
    if glooko_available || sources_used.iter().any(|s| s == "glooko") {
        return true;
    }
    PERSONAL_DATA_MARKERS.iter().any(|p| p.is_match(response_lower))
}

/// A percentage between 1 and 20 counts as a small, testable adjustment.
fn has_small_adjustment(response_text: &str) -> bool {
    PERCENT_PATTERN
        .captures_iter(response_text)
        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse::<u32>().ok()))
        .any(|value| value > 0 && value <= 20)
}

fn has_testing_protocol(response_lower: &str) -> bool {
    TESTING_MARKERS.iter().any(|p| p.is_match(response_lower))
}

fn evidence_tags(input: &TierInput<'_>) -> Vec<String> {
    let mut tags = BTreeSet::new();
    let has_rag_source = input.sources_used.iter().any(|s| s == "rag");
    let has_chunks = input
        .rag_quality
        .map(|q| q.chunk_count > 0)
        .unwrap_or(false);
    if has_rag_source || has_chunks {
        tags.insert("rag".to_string());
    }
    if EVIDENCE_MARKERS
        .iter()
        .any(|p| p.is_match(input.response_text))
    {
        tags.insert("named_guideline".to_string());
    }
    tags.into_iter().collect()
}

fn tier_disclaimer(tier: SafetyTier) -> String {
    match tier {
        SafetyTier::Education => {
            "Disclaimer: Educational guidance based on published standards or manuals. \
             Confirm any changes with your healthcare team."
        }
        SafetyTier::Personalized => {
            "Disclaimer: Personalized pattern analysis. Any changes should be small (under 20%) \
             and tested with close monitoring and your care team."
        }
        SafetyTier::Clinical => {
            "Disclaimer: This is a clinical decision that requires your clinician's oversight \
             because it depends on your history, medications, and risk factors."
        }
        SafetyTier::Dangerous => {
            "Disclaimer: I can't provide that because it could be unsafe. If you feel unwell or \
             at risk, seek urgent medical care."
        }
    }
    .to_string()
}

fn tier3_defer_message() -> String {
    "This decision depends on your medical history, current medications, and risk of \
     hypoglycemia, so it should be made with your clinician. I can explain general principles, \
     but I can't guide a medication change without your care team."
        .to_string()
}

pub(crate) fn tier4_block_message() -> String {
    "I can't help with that because it could be unsafe. If you're worried about your glucose or \
     medications, please contact your healthcare team. If you feel acutely unwell, seek urgent \
     care."
        .to_string()
}

pub(crate) fn dosing_defer_message() -> String {
    "I can't calculate specific insulin doses because dosing depends on your individual factors \
     (insulin sensitivity, carb ratios, activity level, and current glucose). Your healthcare \
     team or diabetes educator can help you determine the right doses for your situation.\n\n\
     I can help you understand general concepts like insulin-to-carb ratios, correction factors, \
     or what questions to ask your care team about dosing."
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn classifier() -> SafetyTierClassifier {
        SafetyTierClassifier::new()
    }

    async fn classify(query: &str, response: &str) -> TierDecision {
        classifier()
            .classify(&TierInput {
                query,
                response_text: response,
                ..TierInput::default()
            })
            .await
    }

    #[tokio::test]
    async fn test_dangerous_advice_blocks() {
        let decision = classify("help", "You should stop your insulin.").await;
        assert_eq!(decision.tier, SafetyTier::Dangerous);
        assert_eq!(decision.action, TierAction::Block);
        assert!(decision.override_response.is_some());
    }

    #[tokio::test]
    async fn test_stop_insulin_delivery_is_descriptive() {
        let decision = classify(
            "how does suspend work",
            "Your pump will stop insulin delivery when glucose is predicted to go low. \
             Check your CGM to confirm recovery.",
        )
        .await;
        assert_eq!(decision.tier, SafetyTier::Education);
    }

    #[tokio::test]
    async fn test_stacking_blocks() {
        let decision = classify("q", "Try stacking insulin doses for stubborn highs.").await;
        assert_eq!(decision.action, TierAction::Block);
    }

    #[tokio::test]
    async fn test_dosing_request_blocked_with_defer_message() {
        let decision = classify(
            "How much insulin should I take for 60g of carbs at blood sugar 200?",
            "",
        )
        .await;
        assert_eq!(decision.tier, SafetyTier::Dangerous);
        assert_eq!(decision.action, TierAction::Block);
        let body = decision.override_response.unwrap();
        assert!(body.contains("can't calculate specific insulin doses"));
    }

    #[tokio::test]
    async fn test_units_in_response_blocked_for_non_educational_query() {
        let decision = classify("what now", "Take 5 units before the meal.").await;
        assert_eq!(decision.tier, SafetyTier::Dangerous);
    }

    #[tokio::test]
    async fn test_units_allowed_in_educational_context() {
        let decision = classify(
            "What strategies help with high-fat meals?",
            "Typical insulin-to-carb discussions use example numbers like 5 units, but your \
             own ratio comes from your care team. Monitor your glucose after meals.",
        )
        .await;
        assert_eq!(decision.tier, SafetyTier::Education);
        assert_eq!(decision.action, TierAction::Allow);
    }

    #[tokio::test]
    async fn test_a1c_boundary() {
        let ok = classify("q", "An A1C target of 5.5% is aggressive but attainable for some.")
            .await;
        assert_ne!(ok.tier, SafetyTier::Dangerous);

        let blocked = classify("q", "Aim for an A1C of 5.4% by doubling down.").await;
        assert_eq!(blocked.tier, SafetyTier::Dangerous);
    }

    #[tokio::test]
    async fn test_clinical_decision_defers() {
        let decision = classify("Should I stop my metformin before surgery?", "").await;
        assert_eq!(decision.tier, SafetyTier::Clinical);
        assert_eq!(decision.action, TierAction::Defer);
        assert!(decision.override_response.unwrap().contains("your clinician"));
    }

    #[tokio::test]
    async fn test_tier2_personalized_with_small_adjustment() {
        let decision = classifier()
            .classify(&TierInput {
                query: "what about my overnight highs",
                response_text: "Your data shows a pattern of overnight rises. A 10% basal \
                     change discussed with your team is a reasonable experiment; test with \
                     fingersticks and monitor your CGM closely.",
                sources_used: &["glooko".to_string()],
                rag_quality: None,
                glooko_available: true,
            })
            .await;
        assert_eq!(decision.tier, SafetyTier::Personalized);
        assert_eq!(decision.action, TierAction::Allow);
    }

    #[tokio::test]
    async fn test_adjustment_over_20_percent_disqualifies_tier2() {
        let decision = classifier()
            .classify(&TierInput {
                query: "what about my overnight highs",
                response_text: "Your data suggests a 21% change; monitor and test often.",
                sources_used: &["glooko".to_string()],
                rag_quality: None,
                glooko_available: true,
            })
            .await;
        assert_eq!(decision.tier, SafetyTier::Education);
    }

    #[tokio::test]
    async fn test_default_tier1_education() {
        let decision = classify(
            "What is time in range?",
            "Time in range measures the share of readings between 70 and 180 mg/dL per ADA \
             guidelines.",
        )
        .await;
        assert_eq!(decision.tier, SafetyTier::Education);
        assert_eq!(decision.action, TierAction::Allow);
        assert!(decision.evidence_tags.contains(&"named_guideline".to_string()));
    }

    #[tokio::test]
    async fn test_disclaimers_are_tier_specific() {
        let education = classify("what is tir", "Time in range is a metric.").await;
        assert!(education.disclaimer.contains("Educational guidance"));

        let dangerous = classify("q", "You should stop your insulin.").await;
        assert!(dangerous.disclaimer.contains("could be unsafe"));
    }

    #[test]
    fn test_small_adjustment_boundary() {
        assert!(has_small_adjustment("try a 20% reduction"));
        assert!(!has_small_adjustment("try a 21% reduction"));
        assert!(!has_small_adjustment("a 0% change"));
    }
}
