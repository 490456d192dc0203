//! Response types returned by the unified agent.

use serde::{Deserialize, Serialize};

use crate::experiment::Cohort;
use crate::llm::LlmInfo;
use crate::retrieval::Coverage;

/// Response urgency, set by the emergency gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    #[default]
    Normal,
    Medium,
    High,
    Critical,
}

/// Which knowledge source primarily shaped the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimarySourceType {
    Rag,
    Parametric,
    Hybrid,
    Glooko,
}

/// Knowledge composition disclosure for the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBreakdown {
    /// Average retrieval confidence (0 when nothing was retrieved)
    pub rag_confidence: f64,
    /// Fixed confidence assigned to parametric content
    pub parametric_confidence: f64,
    /// Weighted blend of the two by content ratio
    pub blended_confidence: f64,
    pub rag_ratio: f64,
    pub parametric_ratio: f64,
    pub primary_source_type: PrimarySourceType,
}

/// Retrieval quality metrics surfaced on the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagQualityMetrics {
    pub chunk_count: usize,
    pub avg_confidence: f64,
    pub sources_covered: Vec<String>,
    pub coverage: Coverage,
}

/// Final user-visible result of one `process` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedResponse {
    pub success: bool,
    pub answer: String,
    /// Which of "rag", "parametric", "glooko" contributed
    pub sources_used: Vec<String>,
    pub glooko_available: bool,
    pub disclaimer: String,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cohort: Option<Cohort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rag_quality: Option<RagQualityMetrics>,
    pub requires_enhanced_safety_check: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub knowledge_breakdown: Option<KnowledgeBreakdown>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_info: Option<LlmInfo>,
    /// Set to "safety_fallback" when a dosing query failed upstream
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl UnifiedResponse {
    /// Skeleton failure response.
    pub fn failure(answer: impl Into<String>) -> Self {
        Self {
            success: false,
            answer: answer.into(),
            sources_used: Vec::new(),
            glooko_available: false,
            disclaimer: String::new(),
            priority: Priority::Normal,
            cohort: None,
            rag_quality: None,
            requires_enhanced_safety_check: false,
            knowledge_breakdown: None,
            llm_info: None,
            error_type: None,
        }
    }
}
