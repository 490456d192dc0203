//! Response cleaning and observational verification.
//!
//! Cleaning strips citation artifacts and structure the model was told not
//! to emit. Verification measures citation counts and query/response
//! keyword overlap; both are logged, never blocking.

use regex::Regex;
use std::sync::LazyLock;
use tracing::{info, warn};

/// Citation artifacts stripped from display text.
static CITATION_ARTIFACTS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\s*\([^)]*(?:documentation|standards|guidelines|research|education|data|Wikipedia|ADA|NICE|Glooko)[^)]*\)",
        r"(?i)\s*\[Source:[^\]]*\]",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid regex"))
    .collect()
});

/// Structured headers the model sometimes emits despite instructions.
static STRUCTURED_HEADERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^\s*\d+\.\s*ACKNOWLEDGE:?\s*",
        r"(?i)^\s*\d+\.\s*EVIDENCE-BASED STRATEGIES:?\s*",
        r"(?i)^\s*\d+\.\s*SAFETY BOUNDARY:?\s*",
        r"(?i)^\s*\d+\.\s*HEALTHCARE DISCUSSION STARTER:?\s*",
        r"(?i)^\s*\d\)\s*Strategy:\s*",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid regex"))
    .collect()
});

static TRAILING_SOURCES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?is)\n*###?\s*Sources?\s*\n.*$",
        r"(?is)\n*\*\*Sources?\*\*:?\s*\n.*$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid regex"))
    .collect()
});

static ORPHAN_SENTENCE_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.\s+([a-z])").expect("invalid regex"));

static CITATION_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]+\]").expect("invalid regex"));

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[a-z]{2,}\b").expect("invalid regex"));

/// Stopwords removed before keyword-overlap measurement.
const STOPWORDS: [&str; 38] = [
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "how", "what", "when",
    "where", "why", "who", "which", "do", "does", "did", "can", "could", "should", "would",
    "will", "i", "my", "me", "in", "on", "at", "to", "from", "by", "with", "about", "for", "of",
];

/// Clean a generated response for conversational display.
pub fn clean_response(response: &str) -> String {
    let mut text = response.to_string();

    for pattern in CITATION_ARTIFACTS.iter() {
        text = pattern.replace_all(&text, "").into_owned();
    }

    // Strip structured headers line by line
    let mut cleaned_lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let mut cleaned = line.to_string();
        for pattern in STRUCTURED_HEADERS.iter() {
            cleaned = pattern.replace(&cleaned, "").into_owned();
        }
        let keep_blank = cleaned.trim().is_empty()
            && cleaned_lines.last().map(|l: &String| !l.trim().is_empty()).unwrap_or(false);
        if !cleaned.trim().is_empty() || keep_blank {
            cleaned_lines.push(cleaned);
        }
    }
    text = cleaned_lines.join("\n");

    // Chunk-boundary fragment repairs
    text = text.replace(". of this,", ". Because of this,");
    text = text.replace(".,  being", ". Being");
    text = text.replace(". and continue", ", and continue");

    // Capitalize orphaned sentence starts
    text = ORPHAN_SENTENCE_START
        .replace_all(&text, |caps: &regex::Captures<'_>| {
            format!(". {}", caps[1].to_uppercase())
        })
        .into_owned();

    // Double periods and runaway spacing
    while text.contains("..") {
        text = text.replace("..", ".");
    }
    while text.contains("   ") {
        text = text.replace("   ", "  ");
    }

    // Normalize paragraph spacing
    let paragraphs: Vec<&str> = text
        .split("\n\n")
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();
    text = paragraphs.join("\n\n");

    // Drop any trailing Sources section the model added anyway
    for pattern in TRAILING_SOURCES.iter() {
        text = pattern.replace(&text, "").into_owned();
    }

    text.trim().to_string()
}

/// Citation-count verification result.
#[derive(Debug, Clone, PartialEq)]
pub struct CitationCheck {
    pub citation_count: usize,
    /// False only for substantial responses with zero citations
    pub verified: bool,
    pub response_length: usize,
}

/// Count `[...]` citation markers. Substantial responses (>500 chars)
/// with none at all are flagged for logging.
pub fn verify_citations(response: &str) -> CitationCheck {
    let citation_count = CITATION_MARKER.find_iter(response).count();
    let response_length = response.len();
    let verified = !(response_length > 500 && citation_count == 0);
    if !verified {
        info!(response_length, "[citation] substantial response with no citations");
    }
    CitationCheck {
        citation_count,
        verified,
        response_length,
    }
}

/// Keyword-overlap verification result.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentCheck {
    pub aligned: bool,
    pub overlap: f64,
    pub missing_terms: Vec<String>,
}

/// Measure how many of the query's key terms (stopwords removed) the
/// response echoes. Below `min_overlap` the response is logged as
/// low-relevancy.
pub fn verify_query_alignment(query: &str, response: &str, min_overlap: f64) -> AlignmentCheck {
    let query_lower = query.to_lowercase();
    let key_terms: Vec<&str> = WORD_RE
        .find_iter(&query_lower)
        .map(|m| m.as_str())
        .filter(|w| !STOPWORDS.contains(w))
        .collect();

    if key_terms.is_empty() {
        return AlignmentCheck {
            aligned: true,
            overlap: 1.0,
            missing_terms: Vec::new(),
        };
    }

    let response_lower = response.to_lowercase();
    let missing_terms: Vec<String> = key_terms
        .iter()
        .filter(|term| !response_lower.contains(**term))
        .take(5)
        .map(|term| (*term).to_string())
        .collect();
    let matched = key_terms
        .iter()
        .filter(|term| response_lower.contains(**term))
        .count();

    let overlap = matched as f64 / key_terms.len() as f64;
    let aligned = overlap >= min_overlap;
    if !aligned {
        warn!(
            overlap = format!("{:.0}%", overlap * 100.0),
            ?missing_terms,
            "[relevancy] low keyword overlap"
        );
    }

    AlignmentCheck {
        aligned,
        overlap,
        missing_terms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_citation_artifacts_stripped() {
        let cleaned = clean_response(
            "Targets matter (ADA Standards of Care). Check your trends [Source: Glooko].",
        );
        assert!(!cleaned.contains("ADA Standards of Care"));
        assert!(!cleaned.contains("[Source:"));
    }

    #[test]
    fn test_numbered_citations_preserved() {
        let cleaned = clean_response("Ease-off reduces delivery [1]. Monitor closely [2].");
        assert!(cleaned.contains("[1]"));
        assert!(cleaned.contains("[2]"));
    }

    #[test]
    fn test_trailing_sources_section_removed() {
        let cleaned = clean_response(
            "Answer body here with details.\n\n### Sources\n- Manual page 4\n- ADA",
        );
        assert_eq!(cleaned, "Answer body here with details.");
    }

    #[test]
    fn test_double_periods_deduped() {
        let cleaned = clean_response("Check your levels.. Then wait.");
        assert!(!cleaned.contains(".."));
    }

    #[test]
    fn test_structured_headers_removed() {
        let cleaned = clean_response("1. ACKNOWLEDGE: The spike is frustrating.\nMore text.");
        assert!(!cleaned.contains("ACKNOWLEDGE"));
        assert!(cleaned.contains("The spike is frustrating."));
    }

    #[test]
    fn test_orphan_sentence_capitalized() {
        let cleaned = clean_response("Delivery was suspended. the pump resumed later.");
        assert!(cleaned.contains(". The pump resumed later."));
    }

    #[test]
    fn test_paragraphs_normalized() {
        let cleaned = clean_response("Para one.\n\n\n\nPara two.");
        assert_eq!(cleaned, "Para one.\n\nPara two.");
    }

    #[test]
    fn test_citation_count() {
        let check = verify_citations("Short answer [1] with [Glooko] markers.");
        assert_eq!(check.citation_count, 2);
        assert!(check.verified);
    }

    #[test]
    fn test_long_uncited_response_flagged() {
        let response = "word ".repeat(150);
        let check = verify_citations(&response);
        assert_eq!(check.citation_count, 0);
        assert!(!check.verified);
    }

    #[test]
    fn test_alignment_full_overlap() {
        let check = verify_query_alignment(
            "dawn phenomenon strategies",
            "The dawn phenomenon responds to several strategies.",
            0.6,
        );
        assert!(check.aligned);
        assert_eq!(check.overlap, 1.0);
    }

    #[test]
    fn test_alignment_miss_logged() {
        let check = verify_query_alignment(
            "camaps ease-off exercise",
            "Physical activity lowers glucose levels in general.",
            0.6,
        );
        assert!(!check.aligned);
        assert!(!check.missing_terms.is_empty());
    }

    #[test]
    fn test_stopword_only_query_aligned() {
        let check = verify_query_alignment("how do i", "anything", 0.6);
        assert!(check.aligned);
        assert_eq!(check.overlap, 1.0);
    }
}
