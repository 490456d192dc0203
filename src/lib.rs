//! # diabuddy-core
//!
//! A safety-audited retrieval-augmented question-answering core for type 1
//! diabetes self-management.
//!
//! ## Core Components
//!
//! - **UnifiedAgent**: the end-to-end query pipeline and only entry point
//! - **Router**: LLM-backed query analysis (automation mode, exclusions)
//! - **Retrieval**: knowledge store coordination and quality grading
//! - **Safety**: tier classification, hallucination detection and the
//!   audit pipeline that rewrites or overrides responses
//! - **Emergency**: keyword gate that bypasses generation entirely
//!
//! ## Example
//!
//! ```rust,ignore
//! use diabuddy_core::{AgentPaths, AppConfig, EnvSettings, GroqClient, UnifiedAgent};
//!
//! let agent = UnifiedAgent::new(
//!     AppConfig::load("config/app.yaml")?,
//!     EnvSettings::from_env()?,
//!     std::sync::Arc::new(GroqClient::new(api_key)),
//!     knowledge_store,
//!     personal_data_loader,
//!     AgentPaths::new("data", "docs/user-sources"),
//! )?;
//!
//! let response = agent.process("What is time in range?", Some("session-1"), None).await?;
//! println!("{}", response.answer);
//! ```

pub mod agent;
pub mod analysis;
pub mod config;
pub mod devices;
pub mod emergency;
pub mod error;
pub mod experiment;
pub mod knowledge;
pub mod llm;
pub mod personal_data;
pub mod personalization;
pub mod prompt;
pub mod retrieval;
pub mod router;
pub mod safety;
pub mod session;
pub mod units;

// Re-exports for convenience
pub use agent::{
    clean_response, dosing_fallback_message, is_dosing_query, verify_citations,
    verify_query_alignment, AgentPaths, AlignmentCheck, CitationCheck, KnowledgeBreakdown,
    PrimarySourceType, Priority, RagQualityMetrics, UnifiedAgent, UnifiedResponse,
};
pub use analysis::{AnalysisLog, AnalysisRecord};
pub use config::{
    AppConfig, EmergencyDetectionConfig, EnvSettings, ExperimentationConfig,
    KnowledgeMonitoringConfig, LoggingConfig, ParametricUsageConfig, PersonalizationConfig,
    RagQualityConfig, SafetyConfig, SeverityThresholds,
};
pub use devices::{DeviceRegistry, DeviceType, UserDevice};
pub use emergency::{EmergencyDetector, EmergencyMatch, EmergencySeverity};
pub use error::{Error, Result};
pub use experiment::{Cohort, ExperimentManager};
pub use knowledge::{
    distance_to_confidence, Chunk, CollectionInfo, CollectionStaleness, KnowledgeStore,
    StalenessLevel, StalenessReport,
};
pub use llm::{
    generate_with_retry, GenerationConfig, GroqClient, LlmClient, LlmInfo, LlmResponse,
    RetryPolicy, TokenUsage,
};
pub use personal_data::{FilePersonalDataLoader, NoPersonalData, PersonalDataLoader};
pub use personalization::{
    anonymize_session_id, BoostAdjustment, BoostState, NegativeFeedbackEntry,
    PersonalizationManager, QueryType, RetrievalStrategy,
};
pub use prompt::{PromptBuilder, PromptInput, GENERAL_KNOWLEDGE_MARKER};
pub use retrieval::{Coverage, RagQuality, RetrievalCoordinator};
pub use router::{AutomationMode, InteractionLayer, RouterAgent, RouterContext};
pub use safety::{
    AuditResult, HallucinationDetector, HallucinationFinding, HybridAuditResult,
    HybridResponseInput, SafetyAuditor, SafetyFinding, SafetyTier, SafetyTierClassifier,
    Severity, TierAction, TierDecision, TierInput,
};
pub use session::{
    format_history_for_prompt, ConversationExchange, SessionData, SessionStore,
};
pub use units::{
    to_mgdl, to_mmol, validate_glucose_range, GlucoseThresholds, GlucoseUnit, MMOL_TO_MGDL,
    THRESHOLDS_MGDL, THRESHOLDS_MMOL,
};
