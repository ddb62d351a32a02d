//! Memory consolidation — distill unprocessed conversation turns into
//! durable, deduplicated memories.
//!
//! One run moves through four phases:
//!
//! 1. **Extraction** — render the user's unextracted messages into a
//!    transcript and ask the completion model for atomic facts.
//! 2. **Dedup** — embed all fact texts in one batch, then fan out one
//!    similarity search per fact to find existing memories that probably
//!    state the same thing.
//! 3. **Adjudication** — number existing memories and new facts into a
//!    unified namespace and ask the model for ADD/UPDATE decisions.
//! 4. **Application** — apply each decision independently, then flip the
//!    `extracted` flag on all fetched messages in one batched update.
//!
//! Phase-level failures (extraction, batch embedding, adjudication) abort
//! the run before any message is marked extracted, so the next invocation
//! retries the same batch. Decision-level failures are isolated: they are
//! logged and the run proceeds to mark messages.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::ConsolidationConfig;
use crate::error::{MnemaError, Result};
use crate::prompt;
use crate::provider::{CompletionProvider, EmbeddingProvider, Stage};
use crate::search::SearchOptions;
use crate::store::{MemoryPatch, NewMemory, Store};
use crate::types::{
    ConsolidationReport, Decision, Embedding, Fact, Memory, MemoryAction, MessageId,
    UnifiedNamespace, UnifiedRef, UserId,
};

/// The consolidation engine.
///
/// Generic over its two remote collaborators so tests can drive it with
/// scripted fakes. Construct with [`Consolidator::new`], or
/// [`Consolidator::with_provider`] when one value serves as both the
/// embedding and the completion provider.
///
/// # Caller responsibility
///
/// The engine does not serialize concurrent runs: two overlapping runs for
/// the same user can both read the same unextracted messages and produce
/// duplicate memories. Ensure at most one in-flight consolidation per user
/// (a per-user lock or a single-writer scheduler at the call site).
pub struct Consolidator<E, C> {
    store: Arc<Store>,
    embedder: E,
    completer: C,
    config: ConsolidationConfig,
}

impl<P> Consolidator<P, P>
where
    P: EmbeddingProvider + CompletionProvider + Clone,
{
    /// Use one provider for both embedding and completion.
    pub fn with_provider(store: Arc<Store>, provider: P, config: ConsolidationConfig) -> Self {
        Self::new(store, provider.clone(), provider, config)
    }
}

impl<E, C> Consolidator<E, C>
where
    E: EmbeddingProvider,
    C: CompletionProvider,
{
    /// Create a consolidator over a store and two providers.
    pub fn new(store: Arc<Store>, embedder: E, completer: C, config: ConsolidationConfig) -> Self {
        Self {
            store,
            embedder,
            completer,
            config,
        }
    }

    /// Run one consolidation pass for `user_id`.
    ///
    /// Returns counts of facts extracted, memory rows written, and
    /// messages marked extracted. With no unextracted messages this is a
    /// no-op: zero counts, zero provider calls.
    ///
    /// # Errors
    ///
    /// Propagates phase-level failures (see module docs); in that case no
    /// message has been marked extracted.
    pub async fn consolidate_user(&self, user_id: UserId) -> Result<ConsolidationReport> {
        let messages = self.store.unextracted_for_user(user_id)?;
        if messages.is_empty() {
            debug!(user = %user_id, "No unextracted messages, skipping run");
            return Ok(ConsolidationReport::default());
        }
        let message_ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();

        // Phase 1: extraction.
        let facts = self.extract_facts(user_id, &messages).await?;
        if facts.is_empty() {
            // A segment with no extractable facts is a valid terminal
            // outcome, not a failure. The messages are still consumed.
            let marked = self.store.mark_extracted(&message_ids)?;
            info!(user = %user_id, messages = marked, "No facts extracted");
            return Ok(ConsolidationReport {
                facts_extracted: 0,
                memories_updated: 0,
                messages_extracted: message_ids.len(),
            });
        }

        // Phase 2: dedup.
        let fact_embeddings = self.embed_facts(&facts).await?;
        let (existing, origin_fact) = self.find_neighbors(user_id, &fact_embeddings).await?;
        let namespace = UnifiedNamespace::new(existing.len(), facts.len());

        // Phase 3: adjudication.
        let decisions = self.adjudicate(user_id, &namespace, &existing, &facts).await?;

        // Phase 4: application. Decisions are independent; failures are
        // collected, never propagated.
        let mut memories_updated = 0;
        for decision in &decisions {
            match self
                .apply_decision(
                    user_id,
                    decision,
                    &namespace,
                    &existing,
                    &origin_fact,
                    &facts,
                    &fact_embeddings,
                )
                .await
            {
                Ok(true) => memories_updated += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        user = %user_id,
                        decision = %decision.id,
                        event = %decision.event,
                        error = %e,
                        "Decision failed, continuing"
                    );
                }
            }
        }

        // Marking runs strictly after every decision attempt has resolved,
        // regardless of individual outcomes.
        self.store.mark_extracted(&message_ids)?;

        let report = ConsolidationReport {
            facts_extracted: facts.len(),
            memories_updated,
            messages_extracted: message_ids.len(),
        };
        info!(
            user = %user_id,
            facts = report.facts_extracted,
            memories = report.memories_updated,
            messages = report.messages_extracted,
            "Consolidation run complete"
        );
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Phase 1: extraction
    // ------------------------------------------------------------------

    async fn extract_facts(
        &self,
        user_id: UserId,
        messages: &[crate::types::Message],
    ) -> Result<Vec<Fact>> {
        let transcript = prompt::render_transcript(messages);
        let raw = self
            .completer
            .complete(&prompt::extraction_prompt(&transcript), &prompt::fact_schema())
            .await
            .map_err(|e| MnemaError::provider(Stage::Extraction, e))?;

        let payload: prompt::FactsPayload =
            serde_json::from_str(&raw).map_err(|e| MnemaError::MalformedOutput {
                stage: Stage::Extraction,
                message: format!("{e} — raw text: '{raw}'"),
            })?;

        let facts: Vec<Fact> = payload.facts.into_iter().map(Fact::clamped).collect();
        debug!(user = %user_id, messages = messages.len(), facts = facts.len(), "Extracted facts");
        Ok(facts)
    }

    // ------------------------------------------------------------------
    // Phase 2: dedup
    // ------------------------------------------------------------------

    async fn embed_facts(&self, facts: &[Fact]) -> Result<Vec<Embedding>> {
        let texts: Vec<String> = facts.iter().map(|f| f.text.clone()).collect();
        let vectors = self
            .embedder
            .embed(&texts, self.config.embedding_dims)
            .await
            .map_err(|e| MnemaError::provider(Stage::Embedding, e))?;

        if vectors.len() != facts.len() {
            return Err(MnemaError::Provider {
                provider: EmbeddingProvider::name(&self.embedder).to_string(),
                stage: Stage::Embedding,
                message: format!("expected {} vectors, got {}", facts.len(), vectors.len()),
            });
        }
        Ok(vectors.into_iter().map(Embedding).collect())
    }

    /// Fan out one similarity search per fact and union the unique
    /// neighbors in discovery order.
    ///
    /// Returns the unique existing memories plus, for each, the index of
    /// the first fact whose search surfaced it — that fact attributes
    /// metadata for UPDATE decisions targeting the memory.
    async fn find_neighbors(
        &self,
        user_id: UserId,
        fact_embeddings: &[Embedding],
    ) -> Result<(Vec<Memory>, Vec<usize>)> {
        let opts = SearchOptions {
            top_k: self.config.top_k,
            user_id: Some(user_id),
            min_similarity: Some(self.config.min_similarity),
            category: None,
        };
        let per_fact = self.store.bulk_search(fact_embeddings, &opts).await?;

        let mut seen = HashSet::new();
        let mut existing = Vec::new();
        let mut origin_fact = Vec::new();
        for (fact_index, hits) in per_fact.into_iter().enumerate() {
            for hit in hits {
                if seen.insert(hit.memory.id) {
                    existing.push(hit.memory);
                    origin_fact.push(fact_index);
                }
            }
        }
        debug!(user = %user_id, neighbors = existing.len(), "Dedup search complete");
        Ok((existing, origin_fact))
    }

    // ------------------------------------------------------------------
    // Phase 3: adjudication
    // ------------------------------------------------------------------

    async fn adjudicate(
        &self,
        user_id: UserId,
        namespace: &UnifiedNamespace,
        existing: &[Memory],
        facts: &[Fact],
    ) -> Result<Vec<Decision>> {
        let raw = self
            .completer
            .complete(
                &prompt::adjudication_prompt(namespace, existing, facts),
                &prompt::decision_schema(),
            )
            .await
            .map_err(|e| MnemaError::provider(Stage::Adjudication, e))?;

        let payload: prompt::DecisionsPayload =
            serde_json::from_str(&raw).map_err(|e| MnemaError::MalformedOutput {
                stage: Stage::Adjudication,
                message: format!("{e} — raw text: '{raw}'"),
            })?;

        debug!(user = %user_id, decisions = payload.memory.len(), "Adjudication complete");
        Ok(payload.memory)
    }

    // ------------------------------------------------------------------
    // Phase 4: application
    // ------------------------------------------------------------------

    /// Apply one decision. `Ok(true)` = a memory row was written,
    /// `Ok(false)` = the decision was skipped as invalid (with a warning).
    #[allow(clippy::too_many_arguments)]
    async fn apply_decision(
        &self,
        user_id: UserId,
        decision: &Decision,
        namespace: &UnifiedNamespace,
        existing: &[Memory],
        origin_fact: &[usize],
        facts: &[Fact],
        fact_embeddings: &[Embedding],
    ) -> Result<bool> {
        match (namespace.resolve(&decision.id), decision.event) {
            (Some(UnifiedRef::Fresh(fact_index)), MemoryAction::Add) => {
                let fact = &facts[fact_index];
                let content = decision
                    .text
                    .clone()
                    .unwrap_or_else(|| fact.text.clone());
                let embedding = self
                    .embedding_for(&content, fact, &fact_embeddings[fact_index])
                    .await?;

                self.store.insert_memory(NewMemory {
                    user_id,
                    content,
                    category: fact.category,
                    importance: fact.importance,
                    confidence: fact.confidence,
                    embedding,
                    action: MemoryAction::Add,
                })?;
                Ok(true)
            }
            (Some(UnifiedRef::Existing(memory_index)), MemoryAction::Update) => {
                let target = &existing[memory_index];
                let fact = &facts[origin_fact[memory_index]];
                let content = decision
                    .text
                    .clone()
                    .unwrap_or_else(|| fact.text.clone());
                let embedding = self
                    .embedding_for(&content, fact, &fact_embeddings[origin_fact[memory_index]])
                    .await?;

                let updated = self.store.update_memory(
                    user_id,
                    target.id,
                    MemoryPatch {
                        content,
                        category: fact.category,
                        importance: fact.importance,
                        confidence: fact.confidence,
                        embedding,
                    },
                )?;
                match updated {
                    Some(_) => Ok(true),
                    None => Err(MnemaError::MemoryNotFound(target.id)),
                }
            }
            (Some(_), event) => {
                warn!(
                    user = %user_id,
                    decision = %decision.id,
                    event = %event,
                    "Decision event does not match its id range, skipping"
                );
                Ok(false)
            }
            (None, _) => {
                warn!(
                    user = %user_id,
                    decision = %decision.id,
                    "Decision id outside the unified namespace, skipping"
                );
                Ok(false)
            }
        }
    }

    /// Embedding for the stored text: reuse the fact's batch embedding when
    /// the text is unchanged, otherwise generate one for the merged text.
    async fn embedding_for(
        &self,
        content: &str,
        fact: &Fact,
        fact_embedding: &Embedding,
    ) -> Result<Embedding> {
        if content == fact.text {
            return Ok(fact_embedding.clone());
        }
        let vectors = self
            .embedder
            .embed(
                std::slice::from_ref(&content.to_string()),
                self.config.embedding_dims,
            )
            .await
            .map_err(|e| MnemaError::provider(Stage::Embedding, e))?;
        vectors
            .into_iter()
            .next()
            .map(Embedding)
            .ok_or_else(|| MnemaError::Provider {
                provider: EmbeddingProvider::name(&self.embedder).to_string(),
                stage: Stage::Embedding,
                message: "empty embedding response".to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;
    use crate::types::{MemoryCategory, Role, StoryId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic unit vector derived from text bytes: identical text
    /// always embeds identically.
    fn fake_vector(text: &str, dims: usize) -> Vec<f32> {
        let mut v = vec![0.0_f32; dims.max(1)];
        let len = v.len();
        for (i, b) in text.bytes().enumerate() {
            v[i % len] += f32::from(b);
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(f32::EPSILON);
        v.iter().map(|x| x / norm).collect()
    }

    #[derive(Clone, Default)]
    struct FakeProvider {
        facts_json: String,
        decisions_json: String,
        poison_text: Option<String>,
        completions: Arc<AtomicUsize>,
        embeds: Arc<AtomicUsize>,
    }

    impl CompletionProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        async fn complete(
            &self,
            _prompt: &str,
            schema: &serde_json::Value,
        ) -> std::result::Result<String, ProviderError> {
            self.completions.fetch_add(1, Ordering::SeqCst);
            if schema["properties"].get("facts").is_some() {
                Ok(self.facts_json.clone())
            } else {
                Ok(self.decisions_json.clone())
            }
        }
    }

    impl EmbeddingProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        async fn embed(
            &self,
            texts: &[String],
            dims: usize,
        ) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
            self.embeds.fetch_add(1, Ordering::SeqCst);
            if let Some(poison) = &self.poison_text {
                if texts.iter().any(|t| t == poison) {
                    return Err(ProviderError::new("fake", "injected embed failure"));
                }
            }
            Ok(texts.iter().map(|t| fake_vector(t, dims)).collect())
        }
    }

    fn config() -> ConsolidationConfig {
        ConsolidationConfig {
            embedding_dims: 16,
            ..ConsolidationConfig::default()
        }
    }

    fn seed_messages(store: &Store, user: UserId, turns: &[(&str, &str)]) {
        let story = StoryId::new();
        for (user_turn, assistant_turn) in turns {
            store
                .append_message(story, user, Role::User, *user_turn)
                .expect("append");
            store
                .append_message(story, user, Role::Assistant, *assistant_turn)
                .expect("append");
        }
    }

    fn facts_json(texts: &[&str]) -> String {
        let facts: Vec<_> = texts
            .iter()
            .map(|t| {
                serde_json::json!({
                    "text": t,
                    "category": "USER_PREFERENCE",
                    "importance": 0.6,
                    "confidence": 0.9
                })
            })
            .collect();
        serde_json::json!({ "facts": facts }).to_string()
    }

    #[tokio::test]
    async fn no_messages_is_a_noop_with_zero_provider_calls() {
        let store = Store::open_in_memory().expect("open");
        let provider = FakeProvider::default();
        let engine = Consolidator::with_provider(Arc::clone(&store), provider.clone(), config());

        let report = engine.consolidate_user(UserId::new()).await.expect("run");
        assert_eq!(report, ConsolidationReport::default());
        assert_eq!(provider.completions.load(Ordering::SeqCst), 0);
        assert_eq!(provider.embeds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn zero_facts_still_marks_messages_extracted() {
        let store = Store::open_in_memory().expect("open");
        let user = UserId::new();
        seed_messages(&store, user, &[("hi", "hello")]);

        let provider = FakeProvider {
            facts_json: r#"{"facts": []}"#.to_string(),
            ..FakeProvider::default()
        };
        let engine = Consolidator::with_provider(Arc::clone(&store), provider.clone(), config());

        let report = engine.consolidate_user(user).await.expect("run");
        assert_eq!(report.facts_extracted, 0);
        assert_eq!(report.memories_updated, 0);
        assert_eq!(report.messages_extracted, 2);
        assert!(store.unextracted_for_user(user).expect("read").is_empty());
        // Only the extraction call happened.
        assert_eq!(provider.completions.load(Ordering::SeqCst), 1);
        assert_eq!(provider.embeds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn add_decision_falls_back_to_fact_text() {
        let store = Store::open_in_memory().expect("open");
        let user = UserId::new();
        seed_messages(&store, user, &[("I love espresso", "noted!")]);

        let provider = FakeProvider {
            facts_json: facts_json(&["likes espresso"]),
            decisions_json: r#"{"memory": [{"id": "1", "event": "ADD"}]}"#.to_string(),
            ..FakeProvider::default()
        };
        let engine = Consolidator::with_provider(Arc::clone(&store), provider, config());

        let report = engine.consolidate_user(user).await.expect("run");
        assert_eq!(report.memories_updated, 1);

        let memories = store.list_memories(user).expect("list");
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].content, "likes espresso");
        assert_eq!(memories[0].action, MemoryAction::Add);
    }

    #[tokio::test]
    async fn out_of_range_decision_ids_are_skipped_not_fatal() {
        let store = Store::open_in_memory().expect("open");
        let user = UserId::new();
        seed_messages(&store, user, &[("I play chess", "nice")]);

        // One valid ADD, one id far outside both ranges, one non-integer.
        let provider = FakeProvider {
            facts_json: facts_json(&["plays chess"]),
            decisions_json: r#"{"memory": [
                {"id": "1", "event": "ADD", "text": "plays chess"},
                {"id": "42", "event": "ADD", "text": "ghost"},
                {"id": "first", "event": "UPDATE", "text": "ghost"}
            ]}"#
            .to_string(),
            ..FakeProvider::default()
        };
        let engine = Consolidator::with_provider(Arc::clone(&store), provider, config());

        let report = engine.consolidate_user(user).await.expect("run");
        assert_eq!(report.memories_updated, 1);
        assert_eq!(store.list_memories(user).expect("list").len(), 1);
        assert!(store.unextracted_for_user(user).expect("read").is_empty());
    }

    #[tokio::test]
    async fn update_decision_merges_into_existing_memory() {
        let store = Store::open_in_memory().expect("open");
        let user = UserId::new();

        // Existing memory embedded exactly like the incoming fact text, so
        // dedup will surface it with similarity 1.0.
        let seeded = store
            .insert_memory(NewMemory {
                user_id: user,
                content: "likes coffee".to_string(),
                category: MemoryCategory::UserPreference,
                importance: 0.5,
                confidence: 0.8,
                embedding: Embedding(fake_vector("likes coffee", 16)),
                action: MemoryAction::Add,
            })
            .expect("seed");

        seed_messages(&store, user, &[("I only drink oat-milk coffee now", "got it")]);

        let provider = FakeProvider {
            facts_json: facts_json(&["likes coffee"]),
            decisions_json:
                r#"{"memory": [{"id": "1", "event": "UPDATE", "text": "likes oat-milk coffee"}]}"#
                    .to_string(),
            ..FakeProvider::default()
        };
        let engine = Consolidator::with_provider(Arc::clone(&store), provider, config());

        let report = engine.consolidate_user(user).await.expect("run");
        assert_eq!(report.memories_updated, 1);

        let updated = store
            .get_memory(user, seeded.id)
            .expect("get")
            .expect("Some");
        assert_eq!(updated.content, "likes oat-milk coffee");
        assert_eq!(updated.prev_content.as_deref(), Some("likes coffee"));
        assert_eq!(updated.action, MemoryAction::Update);
        // Embedding was regenerated for the merged text.
        assert_eq!(updated.embedding.0, fake_vector("likes oat-milk coffee", 16));
    }

    #[tokio::test]
    async fn event_id_range_mismatch_is_skipped() {
        let store = Store::open_in_memory().expect("open");
        let user = UserId::new();
        seed_messages(&store, user, &[("I like tea", "noted")]);

        // UPDATE pointing into the fresh-fact range: invalid, skipped.
        let provider = FakeProvider {
            facts_json: facts_json(&["likes tea"]),
            decisions_json: r#"{"memory": [{"id": "1", "event": "UPDATE", "text": "x"}]}"#
                .to_string(),
            ..FakeProvider::default()
        };
        let engine = Consolidator::with_provider(Arc::clone(&store), provider, config());

        let report = engine.consolidate_user(user).await.expect("run");
        assert_eq!(report.memories_updated, 0);
        assert!(store.list_memories(user).expect("list").is_empty());
        // Messages are still consumed.
        assert_eq!(report.messages_extracted, 2);
    }

    #[tokio::test]
    async fn one_failing_decision_does_not_abort_the_others() {
        let store = Store::open_in_memory().expect("open");
        let user = UserId::new();
        seed_messages(
            &store,
            user,
            &[("I like tea, coffee and juice", "quite the lineup")],
        );

        // The second ADD rewrites its text, forcing a re-embed that the
        // fake fails; the other two reuse their batch embeddings.
        let provider = FakeProvider {
            facts_json: facts_json(&["likes tea", "likes coffee", "likes juice"]),
            decisions_json: r#"{"memory": [
                {"id": "1", "event": "ADD"},
                {"id": "2", "event": "ADD", "text": "poisoned merge"},
                {"id": "3", "event": "ADD"}
            ]}"#
            .to_string(),
            poison_text: Some("poisoned merge".to_string()),
            ..FakeProvider::default()
        };
        let engine = Consolidator::with_provider(Arc::clone(&store), provider, config());

        let report = engine.consolidate_user(user).await.expect("run");
        assert_eq!(report.facts_extracted, 3);
        assert_eq!(report.memories_updated, 2);
        assert_eq!(report.messages_extracted, 2);

        let memories = store.list_memories(user).expect("list");
        assert_eq!(memories.len(), 2);
        // All messages marked despite the failure.
        assert!(store.unextracted_for_user(user).expect("read").is_empty());
    }

    #[tokio::test]
    async fn extraction_failure_leaves_messages_unextracted() {
        let store = Store::open_in_memory().expect("open");
        let user = UserId::new();
        seed_messages(&store, user, &[("hello", "hi")]);

        // Unparseable extraction output: fatal for the phase.
        let provider = FakeProvider {
            facts_json: "not json at all".to_string(),
            ..FakeProvider::default()
        };
        let engine = Consolidator::with_provider(Arc::clone(&store), provider, config());

        let err = engine.consolidate_user(user).await.unwrap_err();
        assert!(matches!(
            err,
            MnemaError::MalformedOutput {
                stage: Stage::Extraction,
                ..
            }
        ));
        // Next invocation will safely retry the same batch.
        assert_eq!(store.unextracted_for_user(user).expect("read").len(), 2);
    }
}
