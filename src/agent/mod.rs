//! Unified query agent.
//!
//! The single public entry point of the pipeline: emergency gate, cohort
//! assignment, personal-data load, routing, retrieval, quality-gated
//! prompt choice, retry-wrapped generation, response cleaning,
//! observational verification and the safety audit, in that order.

mod postprocess;
mod types;

pub use postprocess::{
    clean_response, verify_citations, verify_query_alignment, AlignmentCheck, CitationCheck,
};
pub use types::{
    KnowledgeBreakdown, PrimarySourceType, Priority, RagQualityMetrics, UnifiedResponse,
};

use regex::Regex;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::analysis::AnalysisLog;
use crate::config::{AppConfig, EnvSettings};
use crate::devices::{DeviceRegistry, UserDevice};
use crate::emergency::{EmergencyDetector, EmergencySeverity};
use crate::error::{Error, Result};
use crate::experiment::{Cohort, ExperimentManager};
use crate::knowledge::KnowledgeStore;
use crate::llm::{generate_with_retry, GenerationConfig, LlmClient, RetryPolicy};
use crate::personal_data::PersonalDataLoader;
use crate::personalization::PersonalizationManager;
use crate::prompt::{PromptBuilder, PromptInput};
use crate::retrieval::{RagQuality, RetrievalCoordinator};
use crate::router::RouterAgent;
use crate::safety::{HybridResponseInput, SafetyAuditor, TierAction};
use crate::session::{ConversationExchange, SessionStore};

/// Keyword+number heuristic for dosing queries that the explicit pattern
/// catalog misses ("insulin for 60g at 200").
static QUERY_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d").expect("invalid regex"));

const DOSING_KEYWORDS: [&str; 8] = [
    "insulin", "dose", "dosing", "bolus", "basal", "correction", "carb ratio", "units",
];

/// Whole-request deadline including retries. The LLM client enforces the
/// 60s per-attempt deadline itself.
const REQUEST_DEADLINE: Duration = Duration::from_secs(180);
/// Minimum query length after trimming.
const MIN_QUERY_CHARS: usize = 3;
/// Maximum query length after trimming.
const MAX_QUERY_CHARS: usize = 2000;

/// Filesystem layout for agent state.
#[derive(Debug, Clone)]
pub struct AgentPaths {
    /// Root for sessions, users, analysis subdirectories
    pub data_dir: PathBuf,
    /// Directory of user-uploaded device manuals
    pub manuals_dir: PathBuf,
}

impl AgentPaths {
    pub fn new(data_dir: impl Into<PathBuf>, manuals_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            manuals_dir: manuals_dir.into(),
        }
    }
}

/// End-to-end query pipeline.
pub struct UnifiedAgent {
    config: AppConfig,
    env: EnvSettings,
    llm: Arc<dyn LlmClient>,
    personal_data: Arc<dyn PersonalDataLoader>,
    sessions: SessionStore,
    retrieval: RetrievalCoordinator,
    router: RouterAgent,
    prompt_builder: PromptBuilder,
    emergency: EmergencyDetector,
    auditor: SafetyAuditor,
    analysis: AnalysisLog,
    devices: DeviceRegistry,
    store: Arc<dyn KnowledgeStore>,
    experiment: Option<ExperimentManager>,
}

impl UnifiedAgent {
    pub fn new(
        config: AppConfig,
        env: EnvSettings,
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn KnowledgeStore>,
        personal_data: Arc<dyn PersonalDataLoader>,
        paths: AgentPaths,
    ) -> Result<Self> {
        config.validate()?;

        let sessions = SessionStore::new(paths.data_dir.join("sessions"))?;
        let personalization = Arc::new(PersonalizationManager::new(
            paths.data_dir.join("users"),
            config.personalization.clone(),
        ));
        let retrieval = RetrievalCoordinator::new(Arc::clone(&store), personalization);
        let router = RouterAgent::new(Arc::clone(&llm));
        let emergency = EmergencyDetector::new(config.emergency_detection.clone());
        let auditor = SafetyAuditor::new()
            .with_intent_llm(Arc::clone(&llm))
            .with_enhanced_check_threshold(config.safety.enhanced_check_threshold);
        let analysis = AnalysisLog::new(paths.data_dir.join("analysis"))?;
        let devices = DeviceRegistry::new(paths.manuals_dir);
        let experiment = ExperimentManager::from_config(&config.experimentation);

        Ok(Self {
            config,
            env,
            llm,
            personal_data,
            sessions,
            retrieval,
            router,
            prompt_builder: PromptBuilder::new(),
            emergency,
            auditor,
            analysis,
            devices,
            store,
            experiment,
        })
    }

    /// Session store accessor for host surfaces (history endpoints etc.).
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Analysis log accessor, mainly for shutdown flushing.
    pub fn analysis(&self) -> &AnalysisLog {
        &self.analysis
    }

    /// Process one query end to end.
    pub async fn process(
        &self,
        query: &str,
        session_id: Option<&str>,
        conversation_history: Option<&[ConversationExchange]>,
    ) -> Result<UnifiedResponse> {
        let query = query.trim();
        let query_chars = query.chars().count();
        if query_chars < MIN_QUERY_CHARS || query_chars > MAX_QUERY_CHARS {
            return Err(Error::InputInvalid(format!(
                "Query length must be between {MIN_QUERY_CHARS} and {MAX_QUERY_CHARS} characters"
            )));
        }

        info!(query = %truncate(query, 100), "[unified] processing query");

        // Emergency gate runs before everything; a match bypasses the LLM.
        if let Some(emergency) = self.emergency.detect(query) {
            self.analysis.log_emergency(
                query,
                &emergency.severity.to_string(),
                emergency.detected.clone(),
                emergency.score,
            );
            return Ok(self.emergency_response(&emergency.template, emergency.severity));
        }

        let session_key = session_id.unwrap_or("anonymous");
        let cohort = match &self.experiment {
            Some(manager) => {
                let cohort = manager.cohort_for(session_key);
                manager.log_assignment(session_key, query, cohort).await;
                Some(cohort)
            }
            None => None,
        };
        let control_mode = cohort == Some(Cohort::Control);

        // Personal data and devices load best-effort.
        let personal_data = match self.personal_data.load().await {
            Ok(data) => data,
            Err(e) => {
                warn!("[unified] personal data load failed: {e}");
                None
            }
        };
        let glooko_available = personal_data.is_some();

        let devices = self.devices.user_devices(self.store.as_ref()).await;
        if !devices.is_empty() {
            info!(devices = ?devices.iter().map(|d| &d.name).collect::<Vec<_>>(), "[unified] detected user devices");
        }

        // Router context from the last ten messages.
        let owned_history;
        let history: &[ConversationExchange] = match conversation_history {
            Some(history) => history,
            None => {
                owned_history = self
                    .sessions
                    .history(session_key, 10)
                    .await
                    .unwrap_or_default();
                &owned_history
            }
        };
        let router_context = self.router.analyze_query(query, history).await;

        // Retrieval and quality gate.
        let chunks = self
            .retrieval
            .retrieve(query, session_key, Some(&router_context), &devices)
            .await;
        let rag_quality = RagQuality::assess(&chunks, &self.config.rag_quality);
        info!(
            coverage = ?rag_quality.coverage,
            chunk_count = rag_quality.chunk_count,
            avg_confidence = rag_quality.avg_confidence,
            "[unified] retrieval quality"
        );

        let mut sources_used: Vec<String> = Vec::new();
        if glooko_available {
            sources_used.push("glooko".to_string());
        }
        if !chunks.is_empty() {
            sources_used.push("rag".to_string());
        }

        let prompt_input = PromptInput {
            query,
            chunks: &chunks,
            rag_quality: &rag_quality,
            personal_data: personal_data.as_deref(),
            history,
            primary_device: devices.first(),
        };
        let rag_only = rag_quality.is_sufficient() || control_mode;
        let prompt = if rag_only {
            self.prompt_builder.build_rag_prompt(&prompt_input)
        } else {
            sources_used.push("parametric".to_string());
            self.prompt_builder.build_hybrid_prompt(&prompt_input)
        };
        let requires_enhanced_safety = !rag_only;

        // Generation with retry under the request deadline.
        let generated = tokio::time::timeout(
            REQUEST_DEADLINE,
            generate_with_retry(
                self.llm.as_ref(),
                &prompt,
                GenerationConfig::new(0.3, 3000),
                self.retry_policy(),
            ),
        )
        .await
        .unwrap_or_else(|_| Err(Error::timeout(REQUEST_DEADLINE.as_millis() as u64)));

        let (answer, llm_info) = match generated {
            Ok((response, info)) => (clean_response(&response.text), info),
            Err(e) => {
                return Ok(self.generation_failure_response(query, cohort, glooko_available, &e))
            }
        };

        // Observational checks; logged, never blocking.
        let citation_check = verify_citations(&answer);
        if !citation_check.verified {
            self.analysis
                .log_low_citation(query, &answer, citation_check.citation_count);
        }
        let alignment = verify_query_alignment(query, &answer, 0.6);
        if !alignment.aligned {
            self.analysis.log_low_relevancy(
                query,
                &answer,
                alignment.overlap,
                alignment.missing_terms.clone(),
            );
        }

        let knowledge_breakdown = self.knowledge_breakdown(
            &rag_quality,
            requires_enhanced_safety,
            chunks.is_empty(),
            glooko_available,
        );

        // Safety audit replaces the answer with the audited text.
        let (safe_answer, tier_action, tier_disclaimer) = if requires_enhanced_safety {
            let hybrid = self
                .auditor
                .audit_hybrid_response(
                    &HybridResponseInput {
                        answer: &answer,
                        sources_used: &sources_used,
                        rag_quality: Some(&rag_quality),
                        requires_enhanced_check: true,
                        chunks: &chunks,
                        glooko_available,
                    },
                    query,
                )
                .await;
            for finding in &hybrid.hallucination_findings {
                self.analysis.log_hallucination(
                    query,
                    &finding.category,
                    &finding.claim,
                    finding.confidence,
                );
            }
            (
                hybrid.base.safe_response,
                hybrid.base.tier_action,
                hybrid.base.tier_disclaimer,
            )
        } else {
            let audit = self.auditor.audit_text(&answer, query, false).await;
            (audit.safe_response, audit.tier_action, audit.tier_disclaimer)
        };

        let disclaimer = self.resolve_disclaimer(
            &safe_answer,
            glooko_available,
            &knowledge_breakdown,
            &tier_disclaimer,
        );

        // Session append happens after the audit so the log only ever
        // carries audited text.
        if let Some(id) = session_id {
            let classification = serde_json::json!({
                "tier_action": tier_action,
                "sources_used": sources_used,
                "coverage": rag_quality.coverage,
            });
            if let Err(e) = self
                .sessions
                .append_exchange(id, query, &safe_answer, Some(classification))
                .await
            {
                warn!("[unified] session append failed: {e}");
            }
        }

        Ok(UnifiedResponse {
            success: true,
            answer: safe_answer,
            sources_used,
            glooko_available,
            disclaimer,
            priority: Priority::Normal,
            cohort,
            rag_quality: Some(RagQualityMetrics {
                chunk_count: rag_quality.chunk_count,
                avg_confidence: rag_quality.avg_confidence,
                sources_covered: rag_quality.sources_covered.clone(),
                coverage: rag_quality.coverage,
            }),
            requires_enhanced_safety_check: requires_enhanced_safety,
            knowledge_breakdown: Some(knowledge_breakdown),
            llm_info: Some(llm_info),
            error_type: None,
        })
    }

    /// Streaming variant: identical pre-generation stages, then LLM chunks
    /// forwarded in token order. The audit runs on the concatenated text;
    /// when it rewrites the answer a correction block is emitted after the
    /// stream.
    pub async fn process_stream(
        self: Arc<Self>,
        query: String,
        session_id: Option<String>,
    ) -> Result<mpsc::Receiver<String>> {
        let trimmed = query.trim().to_string();
        let query_chars = trimmed.chars().count();
        if query_chars < MIN_QUERY_CHARS || query_chars > MAX_QUERY_CHARS {
            return Err(Error::InputInvalid(format!(
                "Query length must be between {MIN_QUERY_CHARS} and {MAX_QUERY_CHARS} characters"
            )));
        }

        let (tx, rx) = mpsc::channel::<String>(32);

        if let Some(emergency) = self.emergency.detect(&trimmed) {
            self.analysis.log_emergency(
                &trimmed,
                &emergency.severity.to_string(),
                emergency.detected.clone(),
                emergency.score,
            );
            let response = self.emergency_response(&emergency.template, emergency.severity);
            tokio::spawn(async move {
                let _ = tx.send(response.answer).await;
            });
            return Ok(rx);
        }

        let agent = Arc::clone(&self);
        tokio::spawn(async move {
            let session_key = session_id.as_deref().unwrap_or("anonymous");

            let personal_data = agent.personal_data.load().await.ok().flatten();
            let glooko_available = personal_data.is_some();
            let devices = agent.devices.user_devices(agent.store.as_ref()).await;
            let history = agent
                .sessions
                .history(session_key, 10)
                .await
                .unwrap_or_default();
            let router_context = agent.router.analyze_query(&trimmed, &history).await;
            let chunks = agent
                .retrieval
                .retrieve(&trimmed, session_key, Some(&router_context), &devices)
                .await;
            let rag_quality = RagQuality::assess(&chunks, &agent.config.rag_quality);

            let mut sources_used: Vec<String> = Vec::new();
            if glooko_available {
                sources_used.push("glooko".to_string());
            }
            if !chunks.is_empty() {
                sources_used.push("rag".to_string());
            }

            let prompt_input = PromptInput {
                query: &trimmed,
                chunks: &chunks,
                rag_quality: &rag_quality,
                personal_data: personal_data.as_deref(),
                history: &history,
                primary_device: devices.first(),
            };
            let rag_only = rag_quality.is_sufficient();
            let prompt = if rag_only {
                agent.prompt_builder.build_rag_prompt(&prompt_input)
            } else {
                sources_used.push("parametric".to_string());
                agent.prompt_builder.build_hybrid_prompt(&prompt_input)
            };

            let mut stream = match agent
                .llm
                .generate_stream(&prompt, GenerationConfig::new(0.3, 1000))
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    error!("[unified] stream start failed: {e}");
                    let _ = tx
                        .send(format!(
                            "An error occurred while processing your question: {e}"
                        ))
                        .await;
                    return;
                }
            };

            let mut full_text = String::new();
            while let Some(item) = stream.recv().await {
                match item {
                    Ok(chunk) => {
                        full_text.push_str(&chunk);
                        if tx.send(chunk).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("[unified] stream error mid-generation: {e}");
                        break;
                    }
                }
            }

            // Post-stream audit over the concatenated text.
            let audit_input = HybridResponseInput {
                answer: &full_text,
                sources_used: &sources_used,
                rag_quality: Some(&rag_quality),
                requires_enhanced_check: !rag_only,
                chunks: &chunks,
                glooko_available,
            };
            let audit = agent.auditor.audit_hybrid_response(&audit_input, &trimmed).await;
            if audit.base.tier_action != TierAction::Allow {
                let _ = tx
                    .send(format!(
                        "\n\n[Response revised for safety]\n{}",
                        audit.base.safe_response
                    ))
                    .await;
            } else if !audit.base.safe_response.ends_with(&full_text) {
                // Disclaimer and enrichment live only in the audited text
                let tail = audit
                    .base
                    .safe_response
                    .strip_prefix(&full_text)
                    .unwrap_or("")
                    .to_string();
                if !tail.is_empty() {
                    let _ = tx.send(tail).await;
                }
            }

            if let Some(id) = session_id.as_deref() {
                if let Err(e) = agent
                    .sessions
                    .append_exchange(id, &trimmed, &audit.base.safe_response, None)
                    .await
                {
                    warn!("[unified] session append failed: {e}");
                }
            }
        });

        Ok(rx)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.env.max_retries,
            Duration::from_secs_f64(self.env.retry_base_delay_secs.max(0.0)),
        )
    }

    fn emergency_response(&self, template: &str, severity: EmergencySeverity) -> UnifiedResponse {
        let priority = match severity {
            EmergencySeverity::Critical => Priority::Critical,
            EmergencySeverity::High => Priority::High,
            EmergencySeverity::Medium | EmergencySeverity::Low => Priority::Medium,
        };
        UnifiedResponse {
            success: true,
            answer: format!(
                "{template}\n\nPlease seek immediate medical attention for severe symptoms. \
                 I'm not a substitute for emergency care."
            ),
            sources_used: vec!["emergency safety guidelines".to_string()],
            glooko_available: false,
            disclaimer: template.to_string(),
            priority,
            cohort: None,
            rag_quality: None,
            requires_enhanced_safety_check: false,
            knowledge_breakdown: None,
            llm_info: None,
            error_type: None,
        }
    }

    /// Dosing queries that fail upstream get a fixed safe template rather
    /// than an apology.
    fn generation_failure_response(
        &self,
        query: &str,
        cohort: Option<Cohort>,
        glooko_available: bool,
        error: &Error,
    ) -> UnifiedResponse {
        error!("[unified] generation failed: {error}");
        if is_dosing_query(query) {
            self.analysis
                .log_safety_fallback(query, &truncate(&error.to_string(), 100));
            warn!(query = %truncate(query, 80), "[unified] safety fallback for dosing query");
            let mut response = UnifiedResponse::failure(dosing_fallback_message());
            response.glooko_available = glooko_available;
            response.cohort = cohort;
            response.error_type = Some("safety_fallback".to_string());
            response.disclaimer = "Safety fallback activated - LLM unavailable".to_string();
            return response;
        }

        let mut response = UnifiedResponse::failure(
            "I'm sorry - I couldn't generate a response right now. Please try again in a \
             moment, and reach out to your healthcare team for anything urgent.",
        );
        response.glooko_available = glooko_available;
        response.cohort = cohort;
        response
    }

    fn knowledge_breakdown(
        &self,
        rag_quality: &RagQuality,
        hybrid: bool,
        no_chunks: bool,
        glooko_available: bool,
    ) -> KnowledgeBreakdown {
        let rag_confidence = if rag_quality.chunk_count > 0 {
            rag_quality.avg_confidence
        } else {
            0.0
        };
        let parametric_confidence = self.config.parametric_usage.confidence_score;

        let (rag_ratio, parametric_ratio) = if hybrid {
            if no_chunks {
                (0.4, 0.6)
            } else {
                (0.6, 0.4)
            }
        } else {
            (1.0, 0.0)
        };

        let blended = rag_confidence * rag_ratio + parametric_confidence * parametric_ratio;

        let primary_source_type = if glooko_available {
            PrimarySourceType::Glooko
        } else if parametric_ratio > 0.5 {
            PrimarySourceType::Parametric
        } else if rag_ratio >= 0.8 {
            PrimarySourceType::Rag
        } else {
            PrimarySourceType::Hybrid
        };

        KnowledgeBreakdown {
            rag_confidence: round2(rag_confidence),
            parametric_confidence,
            blended_confidence: round2(blended),
            rag_ratio: round2(rag_ratio),
            parametric_ratio: round2(parametric_ratio),
            primary_source_type,
        }
    }

    /// Response-level disclaimer, independent of the audit's appended
    /// tier disclaimer.
    fn resolve_disclaimer(
        &self,
        answer: &str,
        glooko_available: bool,
        breakdown: &KnowledgeBreakdown,
        tier_disclaimer: &str,
    ) -> String {
        let lower = answer.to_lowercase();
        let base = if lower.contains("healthcare") || lower.contains("doctor") {
            String::new()
        } else if glooko_available {
            "This analysis includes your personal data. Discuss any changes with your \
             healthcare team."
                .to_string()
        } else if !tier_disclaimer.is_empty() {
            tier_disclaimer.to_string()
        } else {
            "This is educational information. Always consult your healthcare provider."
                .to_string()
        };

        if breakdown.parametric_ratio > self.config.parametric_usage.max_ratio {
            let warning = "This answer includes general diabetes knowledge. For \
                           device-specific procedures, consult your device manual or \
                           healthcare provider.";
            if base.is_empty() {
                return warning.to_string();
            }
            return format!("{base}\n\n{warning}");
        }
        base
    }
}

/// Dosing-query heuristic for the safety fallback: the explicit pattern
/// catalog, or a dosing keyword combined with a number.
pub fn is_dosing_query(query: &str) -> bool {
    if SafetyAuditor::is_dosing_query(query) {
        return true;
    }
    let lower = query.to_lowercase();
    let has_keyword = DOSING_KEYWORDS.iter().any(|kw| lower.contains(kw));
    has_keyword && QUERY_NUMBER_RE.is_match(query)
}

/// Fixed body returned when a dosing query fails upstream.
pub fn dosing_fallback_message() -> String {
    "I'm having trouble connecting to our system right now. For insulin dosing questions, \
     please:\n\n\
     1. **Use your pump's bolus calculator/wizard feature** - It calculates based on your \
     individual settings\n\
     2. **Contact your diabetes care team immediately** - They can provide personalized \
     guidance\n\
     3. **If this is an emergency** (blood sugar >300 or <70), call your healthcare provider \
     or 911\n\n\
     **Your safety is the priority. Never guess on insulin doses - always get professional \
     guidance.**"
        .to_string()
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl UnifiedAgent {
    /// Device registry accessor.
    pub fn device_registry(&self) -> &DeviceRegistry {
        &self.devices
    }

    /// Detected devices for the current knowledge store contents.
    pub async fn user_devices(&self) -> Vec<UserDevice> {
        self.devices.user_devices(self.store.as_ref()).await
    }
}
