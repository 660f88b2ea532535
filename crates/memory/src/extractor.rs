//! LLM-judged semantic operations: entity/relationship/tag extraction,
//! importance rating, semantic-duplicate testing, and conflict resolution.
//!
//! Every operation keeps its fixed system prompt strictly separate from the
//! user-supplied text: memories travel only in the user message, so stored
//! text can never rewrite the instructions. Every operation degrades to a
//! safe default on failure: no extraction, neutral importance, "unique",
//! "skip".

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use keepsake_config::ExtractionConfig;
use keepsake_llm::{AbortSignal, ChatMessage, ChatOracle, extract_json_output};

use crate::schema::{EntityType, MemoryCategory, RelationType, truncate_str};

/// Below this cosine similarity a pair is declared unique without an LLM call.
pub const SEMANTIC_SIM_FAST_PATH: f64 = 0.80;

/// Importance assigned whenever rating is disabled or fails.
pub const NEUTRAL_IMPORTANCE: f64 = 0.5;

const DEFAULT_RELATION_CONFIDENCE: f64 = 0.7;

// ── Prompts ───────────────────────────────────────────────────────────────────

const ENTITY_EXTRACTION_PROMPT: &str = r#"You extract structured knowledge from a single memory text.

Reply with ONLY a JSON object of this exact shape, no prose:
{
  "category": "preference" | "fact" | "decision" | "entity" | "other",
  "entities": [{"name": "...", "type": "person" | "organization" | "location" | "event" | "concept", "aliases": ["..."], "description": "..."}],
  "relationships": [{"source": "...", "target": "...", "type": "WORKS_AT" | "LIVES_AT" | "KNOWS" | "MARRIED_TO" | "PREFERS" | "DECIDED" | "RELATED_TO", "confidence": 0.0}],
  "tags": [{"name": "...", "category": "topic"}]
}

Rules:
- Entity names are the canonical referent ("alice", not "she").
- Relationship source and target must be entity names from the entities list.
- confidence is your certainty in the relationship, 0.0 to 1.0.
- Omit arrays you have nothing for by leaving them empty.
- If the text carries no extractable knowledge, return {"entities": [], "relationships": [], "tags": []}."#;

const IMPORTANCE_PROMPT: &str = r#"Rate how important this memory is to remember long-term, on a scale of 1 to 10.

1-2: noise, filler, pleasantries
3-4: ephemeral session state, one-off logistics
5-6: mildly useful context
7-8: user preferences, key decisions
9: identity facts (name, family, home, health)
10: safety-critical information

Open proposals and questions directed at the user are always 3 or lower.

Reply with ONLY the number."#;

const DUPLICATE_PROMPT: &str = r#"You compare two stored memories and decide whether they express the same fact.

Reply with ONLY a JSON object: {"verdict": "duplicate"} if the second memory adds nothing the first doesn't already say, or {"verdict": "unique"} if either carries information the other lacks. When unsure, answer "unique"."#;

const CONFLICT_PROMPT: &str = r#"Two stored memories may contradict each other. Decide which to keep.

Reply with ONLY a JSON object: {"keep": "a"} to keep the first, {"keep": "b"} to keep the second (usually the newer statement wins a genuine contradiction), {"keep": "both"} if they can both be true, or {"keep": "skip"} if you cannot tell."#;

// ── Result types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: EntityType,
    pub aliases: Vec<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRelationship {
    pub source: String,
    pub target: String,
    pub relation: RelationType,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedTag {
    pub name: String,
    pub category: String,
}

/// Validated output of one extraction call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionResult {
    pub category: Option<MemoryCategory>,
    pub entities: Vec<ExtractedEntity>,
    pub relationships: Vec<ExtractedRelationship>,
    pub tags: Vec<ExtractedTag>,
}

impl ExtractionResult {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty() && self.tags.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictVerdict {
    KeepA,
    KeepB,
    Both,
    Skip,
}

// ── Raw LLM output shapes ─────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(default)]
    relationships: Vec<RawRelationship>,
    #[serde(default)]
    tags: Vec<RawTag>,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    #[serde(default)]
    name: String,
    #[serde(default, rename = "type")]
    entity_type: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRelationship {
    #[serde(default)]
    source: String,
    #[serde(default)]
    target: String,
    #[serde(default, rename = "type")]
    relation: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawTag {
    #[serde(default)]
    name: String,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    #[serde(default)]
    verdict: String,
}

#[derive(Debug, Deserialize)]
struct RawKeep {
    #[serde(default)]
    keep: String,
}

// ── Validation ────────────────────────────────────────────────────────────────

/// Coerce a raw LLM extraction into the typed contract.
///
/// Unknown entity types collapse to `concept`; unknown categories become
/// unset; unknown relationship types drop the whole relationship; names and
/// aliases are lowercased and trimmed, and empty names drop the record;
/// confidence is clamped to `[0, 1]` with a 0.7 default.
fn validate_extraction_result(raw: RawExtraction) -> ExtractionResult {
    let category = raw
        .category
        .as_deref()
        .and_then(MemoryCategory::from_llm_label);

    let entities: Vec<ExtractedEntity> = raw
        .entities
        .into_iter()
        .filter_map(|e| {
            let name = e.name.trim().to_lowercase();
            if name.is_empty() {
                return None;
            }
            let entity_type = e
                .entity_type
                .as_deref()
                .and_then(EntityType::from_llm_label)
                .unwrap_or(EntityType::Concept);
            let aliases: Vec<String> = e
                .aliases
                .into_iter()
                .map(|a| a.trim().to_lowercase())
                .filter(|a| !a.is_empty() && *a != name)
                .collect();
            let description = e
                .description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty());
            Some(ExtractedEntity { name, entity_type, aliases, description })
        })
        .collect();

    let relationships = raw
        .relationships
        .into_iter()
        .filter_map(|r| {
            let relation = RelationType::from_llm_label(r.relation.as_deref()?)?;
            let source = r.source.trim().to_lowercase();
            let target = r.target.trim().to_lowercase();
            if source.is_empty() || target.is_empty() {
                return None;
            }
            let confidence = r
                .confidence
                .unwrap_or(DEFAULT_RELATION_CONFIDENCE)
                .clamp(0.0, 1.0);
            Some(ExtractedRelationship { source, target, relation, confidence })
        })
        .collect();

    let tags = raw
        .tags
        .into_iter()
        .filter_map(|t| {
            let name = t.name.trim().to_lowercase();
            if name.is_empty() {
                return None;
            }
            let category = t
                .category
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| "topic".to_string());
            Some(ExtractedTag { name, category })
        })
        .collect();

    ExtractionResult { category, entities, relationships, tags }
}

/// First numeric token in a free-form reply ("7", "Score: 8.5", "7/10").
fn parse_leading_score(reply: &str) -> Option<f64> {
    reply
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .filter(|t| !t.is_empty() && t.chars().any(|c| c.is_ascii_digit()))
        .find_map(|t| t.parse::<f64>().ok())
}

// ── Extractor ─────────────────────────────────────────────────────────────────

pub struct Extractor {
    config: ExtractionConfig,
    oracle: Arc<dyn ChatOracle>,
}

impl Extractor {
    pub fn new(config: ExtractionConfig, oracle: Arc<dyn ChatOracle>) -> Self {
        Self { config, oracle }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Entity/relationship/tag extraction.
    ///
    /// Returns `(result, transient)`: `(Some, _)` on success, `(None, true)`
    /// when the failure is worth a retry, `(None, false)` when it is not
    /// (disabled config, malformed JSON, permanent HTTP error).
    pub async fn extract_entities(
        &self,
        text: &str,
        abort: &AbortSignal,
    ) -> (Option<ExtractionResult>, bool) {
        if !self.config.enabled {
            return (None, false);
        }

        let messages = [
            ChatMessage::system(ENTITY_EXTRACTION_PROMPT),
            ChatMessage::user(text),
        ];

        let reply = match self.oracle.chat_stream(&messages, abort).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%err, transient = err.is_transient(), "entity extraction call failed");
                return (None, err.is_transient());
            }
        };

        match extract_json_output::<RawExtraction>(&reply) {
            Some(raw) => {
                let result = validate_extraction_result(raw);
                debug!(
                    entities = result.entities.len(),
                    relationships = result.relationships.len(),
                    tags = result.tags.len(),
                    "extraction validated"
                );
                (Some(result), false)
            }
            None => {
                warn!(
                    reply_preview = truncate_str(&reply, 200),
                    "extraction reply is not valid JSON"
                );
                (None, false)
            }
        }
    }

    /// Rate a memory on the 1–10 rubric, mapped into `[0.1, 1.0]`.
    /// Every failure path yields the neutral 0.5.
    pub async fn rate_importance(&self, text: &str) -> f64 {
        if !self.config.enabled {
            return NEUTRAL_IMPORTANCE;
        }

        let messages = [ChatMessage::system(IMPORTANCE_PROMPT), ChatMessage::user(text)];
        let reply = match self.oracle.chat(&messages).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%err, "importance rating call failed, defaulting to neutral");
                return NEUTRAL_IMPORTANCE;
            }
        };

        match parse_leading_score(&reply) {
            Some(score) => (score / 10.0).clamp(0.1, 1.0),
            None => {
                warn!(reply_preview = truncate_str(&reply, 80), "unparseable importance reply");
                NEUTRAL_IMPORTANCE
            }
        }
    }

    /// LLM-judged duplicate test with a cosine fast path: pairs below
    /// [`SEMANTIC_SIM_FAST_PATH`] are unique without a call. Fail-open:
    /// any failure answers `false` so storage is never blocked.
    pub async fn is_semantic_duplicate(
        &self,
        new_text: &str,
        existing_text: &str,
        vector_sim: Option<f64>,
        abort: &AbortSignal,
    ) -> bool {
        if let Some(sim) = vector_sim {
            if sim < SEMANTIC_SIM_FAST_PATH {
                return false;
            }
        }
        if !self.config.enabled {
            return false;
        }

        let user = format!("Memory 1:\n{existing_text}\n\nMemory 2:\n{new_text}");
        let messages = [ChatMessage::system(DUPLICATE_PROMPT), ChatMessage::user(user)];

        match self.oracle.chat_stream(&messages, abort).await {
            Ok(reply) => extract_json_output::<RawVerdict>(&reply)
                .map(|v| v.verdict.eq_ignore_ascii_case("duplicate"))
                .unwrap_or(false),
            Err(err) => {
                warn!(%err, "semantic duplicate call failed, treating as unique");
                false
            }
        }
    }

    /// Ask which of two potentially contradictory memories survives.
    /// Any failure answers [`ConflictVerdict::Skip`].
    pub async fn resolve_conflict(
        &self,
        text_a: &str,
        text_b: &str,
        abort: &AbortSignal,
    ) -> ConflictVerdict {
        if !self.config.enabled {
            return ConflictVerdict::Skip;
        }

        let user = format!("Memory A:\n{text_a}\n\nMemory B:\n{text_b}");
        let messages = [ChatMessage::system(CONFLICT_PROMPT), ChatMessage::user(user)];

        let reply = match self.oracle.chat_stream(&messages, abort).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%err, "conflict resolution call failed, skipping pair");
                return ConflictVerdict::Skip;
            }
        };

        match extract_json_output::<RawKeep>(&reply) {
            Some(raw) => match raw.keep.trim().to_lowercase().as_str() {
                "a" => ConflictVerdict::KeepA,
                "b" => ConflictVerdict::KeepB,
                "both" => ConflictVerdict::Both,
                _ => ConflictVerdict::Skip,
            },
            None => ConflictVerdict::Skip,
        }
    }
}

// ── Test support ──────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted oracle shared by extractor, background-extraction, and
    //! sleep-cycle tests.

    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;
    use keepsake_llm::{AbortSignal, ChatMessage, ChatOracle, LlmError};
    use tokio::sync::Mutex;

    /// Pops one canned reply per call and panics when the script runs dry,
    /// which doubles as an assertion that a code path makes no LLM call.
    pub(crate) struct ScriptedOracle {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
    }

    impl ScriptedOracle {
        pub(crate) fn new(replies: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self { replies: Mutex::new(replies.into_iter().collect()) })
        }

        pub(crate) fn silent() -> Arc<Self> {
            Self::new(Vec::new())
        }

        pub(crate) async fn remaining(&self) -> usize {
            self.replies.lock().await.len()
        }
    }

    #[async_trait]
    impl ChatOracle for ScriptedOracle {
        async fn chat(&self, _messages: &[ChatMessage]) -> Result<String, LlmError> {
            self.replies
                .lock()
                .await
                .pop_front()
                .expect("unexpected LLM call")
        }

        async fn chat_stream(
            &self,
            messages: &[ChatMessage],
            _abort: &AbortSignal,
        ) -> Result<String, LlmError> {
            self.chat(messages).await
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
