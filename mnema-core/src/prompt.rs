//! Prompt templates and output schemas for the consolidation pipeline.
//!
//! Every prompt is a versioned, testable artifact. Templates are consts
//! with `{placeholder}` slots; the render functions here are pure — no
//! global prompt cache, everything is computed from borrowed data per run.
//!
//! The adjudication prompt refers to candidates by small unified-namespace
//! integers rather than database identifiers. That keeps the prompt short
//! and keeps raw ids out of model-visible text.

use std::fmt::Write as _;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::types::{Decision, Fact, Memory, MemoryCategory, Message, UnifiedNamespace};

// ---------------------------------------------------------------------------
// Fact extraction
// ---------------------------------------------------------------------------

/// Extraction prompt (phase 1). Expects a `{transcript}` slot.
pub const EXTRACTION_PROMPT: &str = r#"You are a memory extraction system.
Read the conversation below and extract atomic, self-contained facts about the user.

RULES:
- Each fact must stand alone without the conversation as context.
- Prefer durable facts (preferences, goals, relationships, biography) over small talk.
- importance: how much this fact matters for future conversations (0.0-1.0).
- confidence: how directly the conversation supports the fact (0.0-1.0).
- Return an empty list if nothing is worth remembering.
- Your response must be valid JSON matching the requested schema.

Conversation:
{transcript}"#;

/// Adjudication prompt (phase 3). Expects `{existing}` and `{facts}` slots.
pub const ADJUDICATION_PROMPT: &str = r#"You are a memory deduplication system.
Below are EXISTING MEMORIES about a user and NEW FACTS extracted from a recent conversation.
Each candidate has a numeric id.

For each new fact, decide:
- ADD: the fact is genuinely new. Use the fact's own id.
- UPDATE: the fact restates or refines an existing memory. Use the EXISTING memory's id
  and provide the merged text.

You may skip facts that are not worth keeping. Do not invent ids.
Your response must be valid JSON matching the requested schema.

EXISTING MEMORIES:
{existing}

NEW FACTS:
{facts}"#;

/// Render messages into a role-prefixed transcript, one line per turn.
#[must_use]
pub fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        // Failure writing to a String is impossible; ignore the fmt Result.
        let _ = writeln!(out, "{}: {}", message.role, message.content);
    }
    out
}

/// Build the extraction prompt for a transcript.
#[must_use]
pub fn extraction_prompt(transcript: &str) -> String {
    EXTRACTION_PROMPT.replace("{transcript}", transcript)
}

/// Build the adjudication prompt over the unified namespace: existing
/// memories numbered `1..=N` in discovery order, facts `N+1..=N+M` in
/// extraction order.
#[must_use]
pub fn adjudication_prompt(
    namespace: &UnifiedNamespace,
    existing: &[Memory],
    facts: &[Fact],
) -> String {
    let mut existing_block = String::new();
    for (index, memory) in existing.iter().enumerate() {
        let _ = writeln!(
            existing_block,
            "[{}] ({}) {}",
            namespace.existing_id(index),
            memory.category,
            memory.content
        );
    }
    if existing.is_empty() {
        existing_block.push_str("(none)\n");
    }

    let mut facts_block = String::new();
    for (index, fact) in facts.iter().enumerate() {
        let _ = writeln!(
            facts_block,
            "[{}] ({}) {}",
            namespace.fresh_id(index),
            fact.category,
            fact.text
        );
    }

    ADJUDICATION_PROMPT
        .replace("{existing}", existing_block.trim_end())
        .replace("{facts}", facts_block.trim_end())
}

// ---------------------------------------------------------------------------
// Output schemas and payloads
// ---------------------------------------------------------------------------

/// JSON schema for the fact-retrieval output shape:
/// `{ facts: [{ text, category, importance, confidence }] }`.
#[must_use]
pub fn fact_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "facts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "text": { "type": "string" },
                        "category": {
                            "type": "string",
                            "enum": MemoryCategory::wire_names()
                        },
                        "importance": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
                        "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
                    },
                    "required": ["text", "category", "importance", "confidence"]
                }
            }
        },
        "required": ["facts"]
    })
}

/// JSON schema for the memory-update output shape:
/// `{ memory: [{ id, event, text }] }`.
#[must_use]
pub fn decision_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "memory": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": { "type": "string" },
                        "event": { "type": "string", "enum": ["ADD", "UPDATE"] },
                        "text": { "type": "string" }
                    },
                    "required": ["id", "event"]
                }
            }
        },
        "required": ["memory"]
    })
}

/// Wire payload for the extraction response.
#[derive(Debug, Deserialize)]
pub struct FactsPayload {
    /// The extracted facts, possibly empty.
    pub facts: Vec<Fact>,
}

/// Wire payload for the adjudication response.
#[derive(Debug, Deserialize)]
pub struct DecisionsPayload {
    /// The model's decisions, possibly a subset of candidates or empty.
    pub memory: Vec<Decision>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Embedding, MemoryAction, MemoryId, Role, StoryId, UserId,
    };
    use chrono::Utc;

    fn message(role: Role, content: &str) -> Message {
        Message {
            id: 1,
            story_id: StoryId::new(),
            user_id: UserId::new(),
            role,
            content: content.to_string(),
            extracted: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn memory(content: &str) -> Memory {
        Memory {
            id: MemoryId::new(),
            user_id: UserId::new(),
            content: content.to_string(),
            prev_content: None,
            category: MemoryCategory::UserPreference,
            importance: 0.5,
            confidence: 0.9,
            embedding: Embedding(vec![1.0]),
            action: MemoryAction::Add,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn fact(text: &str) -> Fact {
        Fact {
            text: text.to_string(),
            category: MemoryCategory::UserInfo,
            importance: 0.5,
            confidence: 0.8,
        }
    }

    #[test]
    fn transcript_is_role_prefixed_lines() {
        let messages = vec![
            message(Role::User, "I moved to Lisbon last month"),
            message(Role::Assistant, "How are you finding it?"),
        ];
        let transcript = render_transcript(&messages);
        assert_eq!(
            transcript,
            "user: I moved to Lisbon last month\nassistant: How are you finding it?\n"
        );
    }

    #[test]
    fn extraction_prompt_fills_slot() {
        let prompt = extraction_prompt("user: hello\n");
        assert!(prompt.contains("user: hello"));
        assert!(!prompt.contains("{transcript}"));
    }

    #[test]
    fn adjudication_prompt_numbers_both_ranges() {
        let existing = vec![memory("lives in Lisbon"), memory("likes coffee")];
        let facts = vec![fact("likes espresso"), fact("owns a cat")];
        let ns = UnifiedNamespace::new(existing.len(), facts.len());

        let prompt = adjudication_prompt(&ns, &existing, &facts);
        assert!(prompt.contains("[1] (USER_PREFERENCE) lives in Lisbon"));
        assert!(prompt.contains("[2] (USER_PREFERENCE) likes coffee"));
        assert!(prompt.contains("[3] (USER_INFO) likes espresso"));
        assert!(prompt.contains("[4] (USER_INFO) owns a cat"));
        assert!(!prompt.contains("{existing}"));
        assert!(!prompt.contains("{facts}"));
    }

    #[test]
    fn adjudication_prompt_handles_no_existing() {
        let facts = vec![fact("first fact ever")];
        let ns = UnifiedNamespace::new(0, facts.len());
        let prompt = adjudication_prompt(&ns, &[], &facts);
        assert!(prompt.contains("(none)"));
        assert!(prompt.contains("[1] (USER_INFO) first fact ever"));
    }

    #[test]
    fn fact_schema_lists_all_categories() {
        let schema = fact_schema();
        let enumeration = &schema["properties"]["facts"]["items"]["properties"]["category"]["enum"];
        assert_eq!(enumeration.as_array().map(Vec::len), Some(6));
    }

    #[test]
    fn payloads_parse() {
        let facts: FactsPayload = serde_json::from_str(
            r#"{"facts": [{"text": "likes tea", "category": "USER_PREFERENCE",
                 "importance": 0.6, "confidence": 0.9}]}"#,
        )
        .expect("facts");
        assert_eq!(facts.facts.len(), 1);

        let decisions: DecisionsPayload = serde_json::from_str(
            r#"{"memory": [{"id": "1", "event": "UPDATE", "text": "likes green tea"}]}"#,
        )
        .expect("decisions");
        assert_eq!(decisions.memory.len(), 1);
        assert_eq!(decisions.memory[0].event, MemoryAction::Update);
    }
}
