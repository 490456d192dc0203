//! Prompt construction.
//!
//! Exactly two prompt variants leave this module: a RAG-only prompt used
//! when retrieval coverage is sufficient (or the control cohort forces it)
//! and a hybrid prompt that additionally permits clearly-marked general
//! medical knowledge. The builder only assembles strings; it never calls
//! the LLM.

use crate::devices::UserDevice;
use crate::knowledge::Chunk;
use crate::retrieval::RagQuality;
use crate::session::ConversationExchange;

/// Keywords that indicate the user is asking about their own data.
const DATA_INTENT_KEYWORDS: [&str; 11] = [
    "my",
    "glucose",
    "sugar",
    "reading",
    "average",
    "pattern",
    "data",
    "level",
    "a1c",
    "time in range",
    "tir",
];

/// Marker the hybrid prompt requires on parametric content.
pub const GENERAL_KNOWLEDGE_MARKER: &str = "[General medical knowledge]";

const MAX_HISTORY_EXCHANGES: usize = 5;
const MAX_HISTORY_RESPONSE_CHARS: usize = 400;
const MAX_CHUNK_CHARS: usize = 600;

/// Everything the builder needs for one prompt.
pub struct PromptInput<'a> {
    pub query: &'a str,
    pub chunks: &'a [Chunk],
    pub rag_quality: &'a RagQuality,
    /// Pre-formatted personal data block, when indexed
    pub personal_data: Option<&'a str>,
    pub history: &'a [ConversationExchange],
    pub primary_device: Option<&'a UserDevice>,
}

impl PromptInput<'_> {
    fn is_data_question(&self) -> bool {
        let lower = self.query.to_lowercase();
        DATA_INTENT_KEYWORDS.iter().any(|kw| lower.contains(kw))
    }
}

/// Assembles the two prompt variants.
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder;

impl PromptBuilder {
    pub fn new() -> Self {
        Self
    }

    /// RAG-only prompt: the model answers from retrieved passages and the
    /// user's own data, nothing else.
    pub fn build_rag_prompt(&self, input: &PromptInput<'_>) -> String {
        if input.chunks.is_empty() {
            return self.build_thin_context_prompt(input);
        }

        let mut context_parts = Vec::new();
        context_parts.push(format!(
            "RETRIEVED INFORMATION:\n{}",
            retrieved_block(input.chunks)
        ));
        if let Some(data) = input.personal_data {
            if input.is_data_question() {
                context_parts.push(format!("USER'S DIABETES DATA:\n{data}"));
            }
        }
        context_parts.push(sources_available(input));

        format!(
            "You are Diabetes Buddy, a friendly AI assistant helping people with Type 1 diabetes.\n\
             {preamble}\n\
             {history}{numbered}\
             KNOWLEDGE BASE CONTENT:\n{context}\n\n\
             ====================================================================\n\
             USER'S SPECIFIC QUESTION: \"{query}\"\n\n\
             YOUR RESPONSE REQUIREMENTS:\n\
             1. Directly answer the EXACT question asked above\n\
             2. Use key terms from the query in your response\n\
             3. Address the specific scenario described\n\
             4. Start with a direct answer, then provide supporting details\n\
             5. Do NOT provide generic background unless it directly supports the answer\n\n\
             If the query is too vague to answer specifically, ask clarifying questions.\n\
             ====================================================================\n\n\
             CITATION REQUIREMENTS (MANDATORY):\n\
             - Cite EVERY factual claim with source attribution using format: [Source Number]\n\
             - Minimum 3 citations required per response (reference numbers from sources list above)\n\
             - For device-specific claims: cite the device manual [e.g., [1]]\n\
             - For clinical claims: cite clinical sources or guidelines [e.g., [2]]\n\
             - Do NOT make claims about devices, settings, dosages, or physiology without attribution\n\
             - If insufficient sources available, state limitations explicitly\n\n\
             RESPONSE FORMAT - Write 2-3 natural, conversational paragraphs:\n\n\
             Paragraph 1: Acknowledge the user's question. If (and only if) they asked about \
             their data, connect it to their personal patterns. Otherwise, do not mention \
             personal data.\n\n\
             Paragraph 2: Provide 2-4 actionable strategies using their specific device \
             features with citations. Explain HOW and WHEN to use them, and include specific \
             numbers ONLY if they appear explicitly in the retrieved knowledge [e.g., [1]].\n\n\
             Paragraph 3: Brief closing that MUST include \"check with your healthcare team\" \
             or \"consult your healthcare provider\" for personalized adjustments [e.g., [2]].\n\n\
             CRITICAL RULES:\n\
             - NEVER calculate specific insulin doses\n\
             - DO provide evidence-based ranges with citations (\"guidelines suggest 70-180 mg/dL target [1]\")\n\
             - Only mention personal data if the question is about their data\n\
             - DO include device instructions ONLY if cited from retrieved knowledge [e.g., [1]]\n\
             - MUST include actionable words like \"try\", \"consider\", \"adjust\", \"monitor\" with citations\n\
             - MUST end with guidance to consult their healthcare team\n\
             - Use paragraph breaks (blank lines) between paragraphs for readability\n\
             - NO numbered lists, NO section headings, NO bullet points in response body\n\
             - Reference sources by number [1], [2], [3] throughout\n\
             - Sound warm and supportive, like a knowledgeable friend teaching someone\n\
             - If the user has a device, use its EXACT name and feature names throughout\n\
             - If the retrieved knowledge does not include the requested device feature, say so \
             and suggest checking the manual\n\n\
             Write your response now - natural paragraphs with citations, no structured format:\n",
            preamble = device_preamble(input.primary_device),
            history = history_block(input.history),
            numbered = numbered_sources(input.chunks),
            context = context_parts.join("\n\n"),
            query = input.query,
        )
    }

    /// Hybrid prompt: retrieval was partial or sparse, so clearly-marked
    /// general medical knowledge may fill gaps. Dose numbers and invented
    /// device procedures stay forbidden.
    pub fn build_hybrid_prompt(&self, input: &PromptInput<'_>) -> String {
        let mut context_section = String::new();
        if !input.chunks.is_empty() {
            context_section.push_str(&format!(
                "RETRIEVED KNOWLEDGE:\n{}\n",
                retrieved_block(input.chunks)
            ));
        }
        if let Some(data) = input.personal_data {
            if input.is_data_question() {
                context_section.push_str(&format!("\nUSER'S PERSONAL DIABETES DATA:\n{data}\n"));
            }
        }
        context_section.push('\n');
        context_section.push_str(&sources_available(input));

        format!(
            "You are Diabetes Buddy, a friendly AI assistant helping people with Type 1 diabetes.\n\
             {preamble}\n\
             {history}\
             {context}\n\n\
             ====================================================================\n\
             USER'S SPECIFIC QUESTION: \"{query}\"\n\n\
             YOUR RESPONSE REQUIREMENTS:\n\
             1. Directly answer the EXACT question asked above\n\
             2. Use key terms from the query in your response\n\
             3. Address the specific scenario described\n\
             4. Start with a direct answer, then provide supporting details\n\
             5. Do NOT provide generic background unless it directly supports the answer\n\
             ====================================================================\n\n\
             KNOWLEDGE BLENDING RULES:\n\
             - Prefer the RETRIEVED KNOWLEDGE above for every claim it covers, cited as [1], [2]\n\
             - Where retrieval has gaps, you MAY draw on general medical knowledge, but every \
             such statement MUST be marked with {marker}\n\
             - NEVER invent menu navigation, button presses, or screen names for any device\n\
             - NEVER confuse an algorithm app with pump hardware: if the algorithm has no \
             independent user interface, do not write \"tap on\" it\n\
             - NEVER state specific insulin dose numbers from general knowledge\n\
             - NEVER invent device-specific configuration steps\n\n\
             CITATION REQUIREMENTS (MANDATORY):\n\
             - Cite EVERY factual claim: [1], [2] for retrieved knowledge, [Glooko] for personal \
             data, {marker} for general knowledge\n\
             - Minimum 3 citations required per response\n\
             - If insufficient sources available, state limitations explicitly\n\n\
             RESPONSE FORMAT - Write 2-3 natural, conversational paragraphs:\n\n\
             Paragraph 1: Acknowledge the user's question. If (and only if) they asked about \
             their data, reference specific times and patterns with citations [Glooko].\n\n\
             Paragraph 2: Provide 2-4 actionable strategies with citations. If they have a \
             device, mention its specific features by name with source citations.\n\n\
             Paragraph 3: Brief closing that MUST include \"check with your healthcare team\" \
             or \"consult your healthcare provider\" for personalized adjustments.\n\n\
             CRITICAL RULES:\n\
             - NEVER calculate specific insulin doses\n\
             - DO provide evidence-based ranges with citations\n\
             - Only mention personal data if the question is about their data [Glooko]\n\
             - MUST include actionable words like \"try\", \"consider\", \"monitor\" with citations\n\
             - MUST end with guidance to consult the healthcare team\n\
             - Use paragraph breaks (blank lines) between paragraphs\n\
             - NO numbered lists, NO section headings, NO bullet points\n\
             - Sound warm and supportive, like a knowledgeable friend teaching someone\n\
             - If the retrieved knowledge does not include the requested device feature, say so \
             [Source limitation]\n\n\
             Write your response now - natural paragraphs with citations:\n",
            preamble = device_preamble(input.primary_device),
            history = history_block(input.history),
            context = context_section.trim_end(),
            query = input.query,
            marker = GENERAL_KNOWLEDGE_MARKER,
        )
    }

    /// Used when neither retrieval nor relevant personal data exists:
    /// answer from the data block alone, redirect off-topic questions, or
    /// admit the gap.
    fn build_thin_context_prompt(&self, input: &PromptInput<'_>) -> String {
        if let Some(data) = input.personal_data {
            if input.is_data_question() {
                return format!(
                    "You are Diabetes Buddy, a friendly AI assistant helping people with Type 1 diabetes.\n\
                     {preamble}\n\
                     {history}\
                     USER'S DIABETES DATA:\n{data}\n\n\
                     USER QUESTION: {query}\n\n\
                     CITATION REQUIREMENTS (MANDATORY):\n\
                     - Cite [Glooko] when referencing personal patterns\n\
                     - Minimum 3 citations required per response\n\n\
                     RESPONSE FORMAT - Write 2-3 natural, conversational paragraphs:\n\
                     Paragraph 1: Acknowledge what the user is experiencing and reference \
                     specific patterns/times from their data [Glooko].\n\
                     Paragraph 2: Provide 2-4 actionable strategies with citations.\n\
                     Paragraph 3: Brief closing that MUST include \"check with your healthcare \
                     team\" or \"consult your healthcare provider\".\n\n\
                     CRITICAL RULES:\n\
                     - NEVER calculate specific insulin doses\n\
                     - NO numbered lists, NO section headings, NO bullet points\n\
                     - Sound warm and conversational\n\n\
                     Write your response now with citations:\n",
                    preamble = device_preamble(input.primary_device),
                    history = history_block(input.history),
                    data = data,
                    query = input.query,
                );
            }
            return format!(
                "Someone asked: \"{query}\"\n\n\
                 This is off-topic (not about diabetes). Say ONLY this:\n\n\
                 \"I'm focused on diabetes-related questions. Is there anything about your \
                 glucose levels or diabetes management I can help with?\"\n\n\
                 Output that exact sentence and nothing else.",
                query = input.query,
            );
        }

        format!(
            "You are a friendly diabetes assistant. Someone asked: \"{query}\"\n\
             {history}\n\
             You don't have specific information about this topic in your knowledge base.\n\n\
             If it's completely off-topic (not about diabetes at all), respond with:\n\
             \"I'm focused on diabetes-related questions. Is there anything about your glucose \
             levels, device management, or diabetes care I can help with?\"\n\n\
             If it IS about diabetes but you don't have information, respond with something like:\n\
             \"I don't have specific information about that in my knowledge base. For detailed \
             guidance, I'd recommend checking with your healthcare team or your device manual.\"\n\n\
             Keep it to 1-2 sentences. Be friendly and supportive.",
            query = input.query,
            history = history_block(input.history),
        )
    }
}

/// Device preamble: lead with the user's own device and forbid generic
/// pump phrasing. Without a known device, ask for manual-consultation
/// language instead.
fn device_preamble(primary_device: Option<&UserDevice>) -> String {
    match primary_device {
        Some(device) => {
            let name = &device.name;
            format!(
                "\nDEVICE CONTEXT - READ THIS FIRST\n\
                 The user is using: {name}\n\n\
                 YOUR PRIMARY JOB: Explain how THEIR {name} solves this problem.\n\n\
                 MANDATORY RESPONSE STRUCTURE:\n\
                 1. LEAD with {name} features (first 2-3 sentences)\n\
                 2. Reference device-specific capabilities by their EXACT names from the manual\n\
                 3. Use possessive language: \"Your {name}...\" NOT \"Some systems...\" or \"Pumps can...\"\n\n\
                 FORBIDDEN PHRASES (will fail this task):\n\
                 - \"your pump\" or \"your system\" (too generic)\n\
                 - \"insulin delivery systems\" or \"closed-loop technology\" (too academic)\n\
                 - \"Consider adjusting basal rates\" (manual pump advice, not hybrid closed-loop)\n\
                 - \"Some devices have...\" (implies you don't know THEIR device)\n\n\
                 REQUIRED PHRASES (use these):\n\
                 - \"Your {name} has a feature called...\"\n\
                 - \"Use {name}'s [specific feature name] to...\"\n\
                 - \"In your {name} settings, you can...\"\n\n\
                 KNOWLEDGE SOURCE PRIORITY:\n\
                 1. User's {name} manual (retrieved knowledge below) - ALWAYS cite first\n\
                 2. Their personal data patterns\n\
                 3. Clinical guidelines (only if directly relevant to their device usage)\n\n\
                 If you don't have {name}-specific information in the retrieved context, say: \
                 \"Check your {name} manual for [specific feature]\" - NEVER give generic pump advice.\n"
            )
        }
        None => "\nNote: The user has not uploaded device-specific documentation. Provide \
                 general guidance and recommend they consult their specific device manual for \
                 detailed instructions.\n"
            .to_string(),
    }
}

/// Conversation history block, last five exchanges, answers truncated.
fn history_block(history: &[ConversationExchange]) -> String {
    if history.is_empty() {
        return String::new();
    }
    let skip = history.len().saturating_sub(MAX_HISTORY_EXCHANGES);
    let mut lines = Vec::new();
    for exchange in &history[skip..] {
        let response = if exchange.response.chars().count() > MAX_HISTORY_RESPONSE_CHARS {
            let truncated: String = exchange
                .response
                .chars()
                .take(MAX_HISTORY_RESPONSE_CHARS)
                .collect();
            format!("{truncated}...")
        } else {
            exchange.response.clone()
        };
        lines.push(format!("User: {}", exchange.query));
        lines.push(format!("Assistant: {response}"));
    }
    format!(
        "\nCONVERSATION HISTORY (reference previous questions if relevant, build on earlier \
         advice, avoid repeating information already provided):\n{}\n---END HISTORY---\n\n",
        lines.join("\n")
    )
}

/// Chunk texts separated by `---`, each capped at 600 chars.
fn retrieved_block(chunks: &[Chunk]) -> String {
    let mut block = String::new();
    for chunk in chunks {
        let text: String = chunk.text.chars().take(MAX_CHUNK_CHARS).collect();
        block.push_str("---\n");
        block.push_str(&text);
        block.push_str("\n\n");
    }
    block.trim_end().to_string()
}

/// Numbered source list the model cites by index.
fn numbered_sources(chunks: &[Chunk]) -> String {
    if chunks.is_empty() {
        return String::new();
    }
    let mut seen = Vec::new();
    for chunk in chunks {
        if !seen.iter().any(|s| s == &chunk.source) {
            seen.push(chunk.source.clone());
        }
    }
    let mut section =
        String::from("\n=== RETRIEVED SOURCES (CITE BY NUMBER [1], [2], etc.) ===\n");
    for (i, source) in seen.iter().enumerate() {
        section.push_str(&format!("[{}] {source}\n", i + 1));
    }
    section.push_str("=== END SOURCES ===\n\n");
    section
}

/// `SOURCES AVAILABLE` listing with per-source max confidence.
fn sources_available(input: &PromptInput<'_>) -> String {
    let mut source_conf: Vec<(String, f64)> = Vec::new();
    for chunk in input.chunks {
        match source_conf.iter().position(|(s, _)| s == &chunk.source) {
            Some(i) => source_conf[i].1 = source_conf[i].1.max(chunk.confidence),
            None => source_conf.push((chunk.source.clone(), chunk.confidence)),
        }
    }
    source_conf.sort_by(|a, b| a.0.cmp(&b.0));

    let mut lines: Vec<String> = source_conf
        .into_iter()
        .map(|(source, conf)| format!("- {source} (confidence: {conf:.2})"))
        .collect();
    if input.personal_data.is_some() {
        lines.push("- Glooko data (confidence: 1.00)".to_string());
    }
    if lines.is_empty() {
        lines.push("- General knowledge (confidence: 0.50)".to_string());
    }

    format!(
        "SOURCES AVAILABLE (cite using [source_name, confidence: X.X]):\n{}",
        lines.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RagQualityConfig;
    use crate::devices::DeviceType;
    use chrono::Utc;

    fn quality(chunks: &[Chunk]) -> RagQuality {
        RagQuality::assess(chunks, &RagQualityConfig::default())
    }

    fn device() -> UserDevice {
        UserDevice {
            name: "CamAPS FX".to_string(),
            device_type: DeviceType::Algorithm,
            collection: "user_camaps_fx".to_string(),
        }
    }

    fn exchange(query: &str, response: &str) -> ConversationExchange {
        ConversationExchange {
            query: query.to_string(),
            response: response.to_string(),
            classification: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_rag_prompt_contains_chunks_and_sources() {
        let chunks = vec![
            Chunk::new("Ease-off mode reduces insulin delivery.", "CamAPS FX Manual", 0.9),
            Chunk::new("Boost mode increases delivery.", "CamAPS FX Manual", 0.8),
            Chunk::new("Targets of 70-180 mg/dL.", "ADA Standards", 0.7),
        ];
        let q = quality(&chunks);
        let input = PromptInput {
            query: "How do I handle exercise?",
            chunks: &chunks,
            rag_quality: &q,
            personal_data: None,
            history: &[],
            primary_device: Some(&device()),
        };
        let prompt = PromptBuilder::new().build_rag_prompt(&input);

        assert!(prompt.contains("RETRIEVED INFORMATION:"));
        assert!(prompt.contains("Ease-off mode"));
        assert!(prompt.contains("[1] CamAPS FX Manual"));
        assert!(prompt.contains("[2] ADA Standards"));
        assert!(prompt.contains("The user is using: CamAPS FX"));
        assert!(prompt.contains("Minimum 3 citations"));
        assert!(prompt.contains("USER'S SPECIFIC QUESTION: \"How do I handle exercise?\""));
    }

    #[test]
    fn test_chunk_text_truncated_at_600() {
        let chunks = vec![Chunk::new("x".repeat(900), "Manual", 0.9)];
        let q = quality(&chunks);
        let input = PromptInput {
            query: "q",
            chunks: &chunks,
            rag_quality: &q,
            personal_data: None,
            history: &[],
            primary_device: None,
        };
        let prompt = PromptBuilder::new().build_rag_prompt(&input);
        assert!(prompt.contains(&"x".repeat(600)));
        assert!(!prompt.contains(&"x".repeat(601)));
    }

    #[test]
    fn test_personal_data_only_on_data_intent() {
        let chunks = vec![Chunk::new("text", "Manual", 0.9)];
        let q = quality(&chunks);
        let data = "TIR 68%, dawn rise detected";

        let data_input = PromptInput {
            query: "What does my time in range look like?",
            chunks: &chunks,
            rag_quality: &q,
            personal_data: Some(data),
            history: &[],
            primary_device: None,
        };
        let prompt = PromptBuilder::new().build_rag_prompt(&data_input);
        assert!(prompt.contains("USER'S DIABETES DATA:"));

        let plain_input = PromptInput {
            query: "How does Ease-off work?",
            chunks: &chunks,
            rag_quality: &q,
            personal_data: Some(data),
            history: &[],
            primary_device: None,
        };
        let prompt = PromptBuilder::new().build_rag_prompt(&plain_input);
        assert!(!prompt.contains("USER'S DIABETES DATA:"));
    }

    #[test]
    fn test_history_truncated_to_five_exchanges() {
        let history: Vec<_> = (0..8)
            .map(|i| exchange(&format!("q{i}"), "short answer"))
            .collect();
        let chunks = vec![Chunk::new("text", "Manual", 0.9)];
        let q = quality(&chunks);
        let input = PromptInput {
            query: "q",
            chunks: &chunks,
            rag_quality: &q,
            personal_data: None,
            history: &history,
            primary_device: None,
        };
        let prompt = PromptBuilder::new().build_rag_prompt(&input);
        assert!(!prompt.contains("User: q2"));
        assert!(prompt.contains("User: q3"));
        assert!(prompt.contains("User: q7"));
    }

    #[test]
    fn test_history_response_truncated_at_400() {
        let history = vec![exchange("q", &"y".repeat(700))];
        let chunks = vec![Chunk::new("text", "Manual", 0.9)];
        let q = quality(&chunks);
        let input = PromptInput {
            query: "q",
            chunks: &chunks,
            rag_quality: &q,
            personal_data: None,
            history: &history,
            primary_device: None,
        };
        let prompt = PromptBuilder::new().build_rag_prompt(&input);
        assert!(prompt.contains(&format!("{}...", "y".repeat(400))));
        assert!(!prompt.contains(&"y".repeat(401)));
    }

    #[test]
    fn test_hybrid_prompt_permits_marked_general_knowledge() {
        let chunks = vec![Chunk::new("partial info", "Manual", 0.6)];
        let q = quality(&chunks);
        let input = PromptInput {
            query: "What is the honeymoon phase?",
            chunks: &chunks,
            rag_quality: &q,
            personal_data: None,
            history: &[],
            primary_device: None,
        };
        let prompt = PromptBuilder::new().build_hybrid_prompt(&input);
        assert!(prompt.contains(GENERAL_KNOWLEDGE_MARKER));
        assert!(prompt.contains("NEVER invent menu navigation"));
        assert!(prompt.contains("NEVER state specific insulin dose numbers"));
        assert!(prompt.contains("algorithm app with pump hardware"));
    }

    #[test]
    fn test_no_context_prompt_admits_gap() {
        let q = quality(&[]);
        let input = PromptInput {
            query: "What is the honeymoon phase?",
            chunks: &[],
            rag_quality: &q,
            personal_data: None,
            history: &[],
            primary_device: None,
        };
        let prompt = PromptBuilder::new().build_rag_prompt(&input);
        assert!(prompt.contains("don't have specific information"));
    }

    #[test]
    fn test_off_topic_redirect_with_data() {
        let q = quality(&[]);
        let input = PromptInput {
            query: "Who won the football last night?",
            chunks: &[],
            rag_quality: &q,
            personal_data: Some("TIR 70%"),
            history: &[],
            primary_device: None,
        };
        let prompt = PromptBuilder::new().build_rag_prompt(&input);
        assert!(prompt.contains("off-topic"));
        assert!(prompt.contains("Output that exact sentence"));
    }

    #[test]
    fn test_sources_available_lists_max_confidence() {
        let chunks = vec![
            Chunk::new("a", "Manual", 0.6),
            Chunk::new("b", "Manual", 0.9),
        ];
        let q = quality(&chunks);
        let input = PromptInput {
            query: "q",
            chunks: &chunks,
            rag_quality: &q,
            personal_data: Some("data"),
            history: &[],
            primary_device: None,
        };
        let section = sources_available(&input);
        assert!(section.contains("- Manual (confidence: 0.90)"));
        assert!(section.contains("- Glooko data (confidence: 1.00)"));
    }

    #[test]
    fn test_device_preamble_forbids_generic_phrasing() {
        let preamble = device_preamble(Some(&device()));
        assert!(preamble.contains("Your CamAPS FX..."));
        assert!(preamble.contains("FORBIDDEN PHRASES"));
        let no_device = device_preamble(None);
        assert!(no_device.contains("consult their specific device manual"));
    }
}
