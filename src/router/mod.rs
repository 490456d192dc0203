//! LLM-backed query router.
//!
//! Analyzes a query before retrieval to extract device context, automation
//! mode and source exclusions. The highest-value safety output is the
//! exclusion list: closed-loop users must never be steered toward manual
//! bolus features their system disables.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::llm::{GenerationConfig, LlmClient};
use crate::session::{format_history_for_prompt, ConversationExchange};

/// Insulin delivery automation mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationMode {
    /// CamAPS FX, Control-IQ, Loop and other closed-loop systems
    Automated,
    /// Manual MDI or pump control
    Manual,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Where the user interacts with their device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionLayer {
    PumpHardware,
    AlgorithmApp,
    CgmSensor,
    Multiple,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Structured context extracted from a query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterContext {
    #[serde(default)]
    pub devices_mentioned: Vec<String>,
    #[serde(default)]
    pub automation_mode: AutomationMode,
    #[serde(default)]
    pub device_interaction_layer: InteractionLayer,
    #[serde(default)]
    pub user_intent: String,
    #[serde(default)]
    pub key_constraints: Vec<String>,
    #[serde(default)]
    pub temporal_context: Option<String>,
    #[serde(default)]
    pub suggested_sources: Vec<String>,
    #[serde(default)]
    pub exclude_sources: Vec<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

impl RouterContext {
    /// Conservative context used whenever analysis fails.
    pub fn fallback() -> Self {
        Self {
            user_intent: "Query analysis failed - needs clarification".to_string(),
            reasoning: "LLM analysis failed, returning safe fallback".to_string(),
            ..Self::default()
        }
    }

    /// Exclusion terms implied by automated insulin delivery.
    const AUTOMATED_EXCLUSIONS: [&'static str; 2] = ["manual_bolus_features", "extended_bolus"];

    /// Automated mode without a manual-bolus exclusion is an unsafe
    /// routing result; supplement the exclusions rather than trust it.
    fn enforce_automation_exclusions(&mut self) {
        if self.automation_mode != AutomationMode::Automated {
            return;
        }
        let has_manual_exclusion = self.exclude_sources.iter().any(|s| {
            let lower = s.to_lowercase();
            lower.contains("manual_bolus") || lower.contains("extended_bolus")
        });
        if !has_manual_exclusion {
            warn!("[router] automated mode without bolus exclusions, supplementing");
            self.exclude_sources
                .extend(Self::AUTOMATED_EXCLUSIONS.iter().map(|s| s.to_string()));
        }
    }
}

const ROUTER_PROMPT_TEMPLATE: &str = r#"You are a query analysis expert for diabetes management queries.
Analyze the user's query and extract structured context to guide retrieval and response generation.

CRITICAL SAFETY RULES:
1. If query mentions CamAPS FX, Control-IQ, Loop, or any automated insulin delivery -> automation_mode = "automated"
2. If automation_mode = "automated" -> user CANNOT use extended or combination bolus (disabled in closed-loop)
3. If automation_mode = "automated" + query about slow carbs/meals -> suggested_sources MUST include "camaps_app_features" and exclude_sources MUST include "manual_bolus_features"
4. If automation_mode = "automated" -> device_interaction_layer is usually "algorithm_app" (phone app, not pump hardware)
5. Manual pump users interact with "pump_hardware"
6. Be conservative: if unsure about automation mode, use "unknown"

QUERY ANALYSIS TASKS:
1. Identify devices mentioned or implied (insulin pumps, CGMs, apps)
2. Determine automation mode (automated/manual/unknown)
3. Identify where user needs to interact (pump buttons vs phone app vs CGM)
4. Extract user's intent (manage meal, troubleshoot spike, learn feature, change settings)
5. Note key constraints (slow-absorbing meal, exercise, etc.)
6. Note temporal context (now, tonight, during exercise)
7. Suggest knowledge base sources to prioritize
8. List sources to EXCLUDE (critical for safety - e.g., exclude manual bolus for automated users)

CONVERSATION HISTORY (if available):
{conversation_history}

USER QUERY:
{query}

OUTPUT FORMAT - Return ONLY valid JSON with this exact structure:
{
  "devices_mentioned": ["device1", "device2"],
  "automation_mode": "automated|manual|unknown",
  "device_interaction_layer": "pump_hardware|algorithm_app|cgm_sensor|multiple|unknown",
  "user_intent": "brief description of what user wants to accomplish",
  "key_constraints": ["constraint1", "constraint2"],
  "temporal_context": "time-related context or null",
  "suggested_sources": ["source1", "source2"],
  "exclude_sources": ["source1", "source2"],
  "confidence": 0.85,
  "reasoning": "brief explanation of analysis decisions"
}

EXAMPLES:

Query: "I use CamAPS FX with my Dana-i pump. How do I handle slow-absorbing meals like pizza?"
{
  "devices_mentioned": ["CamAPS FX", "Dana-i"],
  "automation_mode": "automated",
  "device_interaction_layer": "algorithm_app",
  "user_intent": "manage slow-absorbing meal with automated insulin delivery",
  "key_constraints": ["slow-absorbing meal", "pizza"],
  "temporal_context": null,
  "suggested_sources": ["camaps_app_features", "meal_management", "absorption_profiles"],
  "exclude_sources": ["manual_bolus_features", "extended_bolus"],
  "confidence": 0.95,
  "reasoning": "CamAPS FX detected means automated mode. Slow meal query means app features, exclude manual bolus which is incompatible with automation."
}

Query: "How do I program an extended bolus on my pump for pasta?"
{
  "devices_mentioned": [],
  "automation_mode": "manual",
  "device_interaction_layer": "pump_hardware",
  "user_intent": "program extended bolus for slow-absorbing meal",
  "key_constraints": ["slow-absorbing meal", "pasta"],
  "temporal_context": null,
  "suggested_sources": ["manual_bolus_features", "pump_hardware_guide", "extended_bolus"],
  "exclude_sources": [],
  "confidence": 0.90,
  "reasoning": "Explicit request for extended bolus programming means manual mode. Needs pump hardware interaction."
}

Query: "My glucose is spiking after breakfast"
{
  "devices_mentioned": [],
  "automation_mode": "unknown",
  "device_interaction_layer": "unknown",
  "user_intent": "troubleshoot post-meal glucose spike",
  "key_constraints": ["breakfast", "glucose spike"],
  "temporal_context": "after breakfast",
  "suggested_sources": ["meal_management", "troubleshooting", "glucose_patterns"],
  "exclude_sources": [],
  "confidence": 0.60,
  "reasoning": "No device mentioned, cannot determine automation mode. Need clarification before suggesting device-specific solutions."
}

Now analyze the query above and return ONLY the JSON response:"#;

/// Query analyzer. Routing never raises to the caller; any failure
/// degrades to [`RouterContext::fallback`].
pub struct RouterAgent {
    llm: std::sync::Arc<dyn LlmClient>,
    timeout: Duration,
}

impl RouterAgent {
    const MAX_HISTORY_MESSAGES: usize = 10;

    pub fn new(llm: std::sync::Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Analyze a query with recent conversation context.
    pub async fn analyze_query(
        &self,
        query: &str,
        history: &[ConversationExchange],
    ) -> RouterContext {
        let history_text = if history.is_empty() {
            "(No conversation history)".to_string()
        } else {
            let skip = history.len().saturating_sub(Self::MAX_HISTORY_MESSAGES);
            format_history_for_prompt(&history[skip..])
        };

        let prompt = ROUTER_PROMPT_TEMPLATE
            .replace("{conversation_history}", &history_text)
            .replace("{query}", query);

        let config = GenerationConfig::new(0.3, 1000);
        let generation = tokio::time::timeout(self.timeout, self.llm.generate(&prompt, config));

        let response = match generation.await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!("[router] query analysis failed: {e}");
                return RouterContext::fallback();
            }
            Err(_) => {
                error!("[router] query analysis timed out");
                return RouterContext::fallback();
            }
        };

        match parse_router_response(&response.text) {
            Ok(mut context) => {
                context.enforce_automation_exclusions();
                info!(
                    automation = ?context.automation_mode,
                    layer = ?context.device_interaction_layer,
                    devices = ?context.devices_mentioned,
                    confidence = context.confidence,
                    "[router] query analyzed"
                );
                if !context.exclude_sources.is_empty() {
                    info!(exclude = ?context.exclude_sources, "[router] excluding sources");
                }
                context
            }
            Err(e) => {
                error!("[router] failed to parse response: {e}");
                RouterContext::fallback()
            }
        }
    }
}

/// Strip markdown fences and parse the router JSON.
fn parse_router_response(text: &str) -> crate::error::Result<RouterContext> {
    let trimmed = text.trim();
    let body = if trimmed.starts_with("```") {
        let without_open = trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```");
        without_open.trim_end_matches("```").trim()
    } else {
        trimmed
    };
    Ok(serde_json::from_str(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::llm::{LlmResponse, TokenUsage};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    struct ScriptedLlm {
        response: Result<String>,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn generate(&self, _prompt: &str, _config: GenerationConfig) -> Result<LlmResponse> {
            match &self.response {
                Ok(text) => Ok(LlmResponse {
                    text: text.clone(),
                    model: "test".into(),
                    usage: TokenUsage::default(),
                }),
                Err(_) => Err(Error::llm_transient("boom")),
            }
        }

        async fn generate_stream(
            &self,
            _prompt: &str,
            _config: GenerationConfig,
        ) -> Result<mpsc::Receiver<Result<String>>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        fn model_name(&self) -> &str {
            "test"
        }

        fn provider(&self) -> &str {
            "test"
        }
    }

    const AUTOMATED_JSON: &str = r#"{
        "devices_mentioned": ["CamAPS FX", "Dana-i"],
        "automation_mode": "automated",
        "device_interaction_layer": "algorithm_app",
        "user_intent": "manage slow meal",
        "key_constraints": ["pizza"],
        "temporal_context": null,
        "suggested_sources": ["camaps_app_features"],
        "exclude_sources": ["manual_bolus_features", "extended_bolus"],
        "confidence": 0.95,
        "reasoning": "closed loop"
    }"#;

    #[tokio::test]
    async fn test_parses_valid_json() {
        let router = RouterAgent::new(std::sync::Arc::new(ScriptedLlm {
            response: Ok(AUTOMATED_JSON.to_string()),
        }));
        let context = router.analyze_query("pizza with camaps", &[]).await;
        assert_eq!(context.automation_mode, AutomationMode::Automated);
        assert_eq!(context.device_interaction_layer, InteractionLayer::AlgorithmApp);
        assert_eq!(context.devices_mentioned.len(), 2);
    }

    #[tokio::test]
    async fn test_strips_markdown_fences() {
        let fenced = format!("```json\n{AUTOMATED_JSON}\n```");
        let router = RouterAgent::new(std::sync::Arc::new(ScriptedLlm {
            response: Ok(fenced),
        }));
        let context = router.analyze_query("q", &[]).await;
        assert_eq!(context.automation_mode, AutomationMode::Automated);
    }

    #[tokio::test]
    async fn test_llm_failure_degrades_to_fallback() {
        let router = RouterAgent::new(std::sync::Arc::new(ScriptedLlm {
            response: Err(Error::llm_transient("down")),
        }));
        let context = router.analyze_query("q", &[]).await;
        assert_eq!(context.automation_mode, AutomationMode::Unknown);
        assert_eq!(context.confidence, 0.0);
        assert!(context.exclude_sources.is_empty());
    }

    #[tokio::test]
    async fn test_garbage_json_degrades_to_fallback() {
        let router = RouterAgent::new(std::sync::Arc::new(ScriptedLlm {
            response: Ok("I think the user is asking about meals".to_string()),
        }));
        let context = router.analyze_query("q", &[]).await;
        assert_eq!(context.automation_mode, AutomationMode::Unknown);
    }

    #[tokio::test]
    async fn test_automated_mode_supplements_missing_exclusions() {
        let json = r#"{
            "devices_mentioned": ["Control-IQ"],
            "automation_mode": "automated",
            "device_interaction_layer": "algorithm_app",
            "user_intent": "meal handling",
            "key_constraints": [],
            "temporal_context": null,
            "suggested_sources": [],
            "exclude_sources": [],
            "confidence": 0.8,
            "reasoning": "forgot exclusions"
        }"#;
        let router = RouterAgent::new(std::sync::Arc::new(ScriptedLlm {
            response: Ok(json.to_string()),
        }));
        let context = router.analyze_query("q", &[]).await;
        assert!(context
            .exclude_sources
            .iter()
            .any(|s| s.contains("manual_bolus") || s.contains("extended_bolus")));
    }

    #[test]
    fn test_unknown_enum_values_fall_back() {
        let json = r#"{
            "automation_mode": "hybrid-ish",
            "device_interaction_layer": "telepathy",
            "user_intent": "x",
            "confidence": 0.5,
            "reasoning": "r"
        }"#;
        let context = parse_router_response(json).unwrap();
        assert_eq!(context.automation_mode, AutomationMode::Unknown);
        assert_eq!(context.device_interaction_layer, InteractionLayer::Unknown);
    }
}
