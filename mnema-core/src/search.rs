//! Vector similarity search over stored memories.
//!
//! The store ranks a user's rows by cosine distance (a ranked scan — there
//! is deliberately no ANN index here). Distance is bounded to [0, 2] and
//! mapped to a [0, 1] similarity via `1 - distance / 2`.
//!
//! Ranking policy: results are ordered by ascending distance, truncated to
//! `top_k` **before** the `min_similarity` floor is applied, then filtered.
//! Fewer than `top_k` results may come back, never more — and a result
//! just below the floor can suppress a same-score tie that would otherwise
//! appear.

use std::sync::Arc;

use ordered_float::OrderedFloat;
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::{MnemaError, Result};
use crate::store::Store;
use crate::types::{Embedding, Memory, MemoryCategory, UserId};

/// Parameters for a similarity search.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Maximum number of results.
    pub top_k: usize,
    /// Restrict to one user's memories.
    pub user_id: Option<UserId>,
    /// Similarity floor; results below it are dropped after top-k
    /// truncation.
    pub min_similarity: Option<f32>,
    /// Restrict to one category.
    pub category: Option<MemoryCategory>,
}

/// One ranked search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// The matching memory.
    pub memory: Memory,
    /// Similarity in [0, 1]; 1 is identical.
    pub similarity: f32,
    /// Cosine distance in [0, 2]; 0 is identical.
    pub distance: f32,
}

/// Map a [0, 2] distance to a [0, 1] similarity.
#[must_use]
pub fn similarity_from_distance(distance: f32) -> f32 {
    1.0 - distance / 2.0
}

impl Store {
    /// Rank the matching memories by ascending distance to `query`, take
    /// the closest `top_k`, then drop anything below the similarity floor.
    ///
    /// # Errors
    ///
    /// Returns [`MnemaError::Database`] on SQLite failures.
    pub fn search(&self, query: &Embedding, opts: &SearchOptions) -> Result<Vec<SearchHit>> {
        let candidates = self.memories_matching(opts.user_id, opts.category)?;

        let mut scored: Vec<(OrderedFloat<f32>, Memory)> = candidates
            .into_iter()
            .map(|memory| {
                let distance = query.cosine_distance(&memory.embedding);
                (OrderedFloat(distance), memory)
            })
            .collect();
        scored.sort_by_key(|(distance, _)| *distance);
        scored.truncate(opts.top_k);

        let floor = opts.min_similarity.unwrap_or(0.0);
        let hits: Vec<SearchHit> = scored
            .into_iter()
            .map(|(distance, memory)| SearchHit {
                similarity: similarity_from_distance(distance.into_inner()),
                distance: distance.into_inner(),
                memory,
            })
            .filter(|hit| hit.similarity >= floor)
            .collect();

        debug!(
            top_k = opts.top_k,
            floor,
            hits = hits.len(),
            "Similarity search"
        );
        Ok(hits)
    }

    /// Run one search per query concurrently and return a same-length,
    /// order-preserving list of result lists. Queries are independent and
    /// share no mutable state.
    ///
    /// # Errors
    ///
    /// Returns the first search error encountered, or [`MnemaError::Task`]
    /// if a search task panicked.
    pub async fn bulk_search(
        self: &Arc<Self>,
        queries: &[Embedding],
        opts: &SearchOptions,
    ) -> Result<Vec<Vec<SearchHit>>> {
        let mut tasks: JoinSet<(usize, Result<Vec<SearchHit>>)> = JoinSet::new();
        for (index, query) in queries.iter().cloned().enumerate() {
            let store = Arc::clone(self);
            let opts = opts.clone();
            tasks.spawn_blocking(move || (index, store.search(&query, &opts)));
        }

        let mut results: Vec<Option<Vec<SearchHit>>> = (0..queries.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined.map_err(|e| MnemaError::Task(e.to_string()))?;
            results[index] = Some(result?);
        }

        results
            .into_iter()
            .map(|slot| slot.ok_or_else(|| MnemaError::Task("search result missing".to_string())))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewMemory;
    use crate::types::MemoryAction;
    use proptest::prelude::*;

    fn insert(store: &Store, user: UserId, content: &str, embedding: &[f32]) -> Memory {
        store
            .insert_memory(NewMemory {
                user_id: user,
                content: content.to_string(),
                category: MemoryCategory::UserInfo,
                importance: 0.5,
                confidence: 0.9,
                embedding: Embedding(embedding.to_vec()),
                action: MemoryAction::Add,
            })
            .expect("insert")
    }

    #[test]
    fn ranked_by_ascending_distance() {
        let store = Store::open_in_memory().expect("open");
        let user = UserId::new();

        insert(&store, user, "far", &[-1.0, 0.0]);
        insert(&store, user, "near", &[0.95, 0.05]);
        insert(&store, user, "exact", &[1.0, 0.0]);

        let hits = store
            .search(
                &Embedding(vec![1.0, 0.0]),
                &SearchOptions {
                    top_k: 3,
                    user_id: Some(user),
                    ..SearchOptions::default()
                },
            )
            .expect("search");

        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].memory.content, "exact");
        assert_eq!(hits[1].memory.content, "near");
        assert_eq!(hits[2].memory.content, "far");
        assert!(hits[0].similarity > hits[1].similarity);
        assert!(hits[1].similarity > hits[2].similarity);
    }

    #[test]
    fn top_k_truncates_before_floor() {
        let store = Store::open_in_memory().expect("open");
        let user = UserId::new();

        // 10 candidates; the 3 closest pass the floor, but top_k = 2.
        for i in 0..3 {
            let wobble = 0.01 * (i as f32 + 1.0);
            insert(&store, user, &format!("close {i}"), &[1.0, wobble]);
        }
        for i in 0..7 {
            insert(&store, user, &format!("far {i}"), &[-1.0, 0.1 * i as f32]);
        }

        let hits = store
            .search(
                &Embedding(vec![1.0, 0.0]),
                &SearchOptions {
                    top_k: 2,
                    user_id: Some(user),
                    min_similarity: Some(0.9),
                    ..SearchOptions::default()
                },
            )
            .expect("search");

        // Exactly 2: the 3rd passing candidate never replaces a truncated slot.
        assert_eq!(hits.len(), 2);
        for hit in &hits {
            assert!(hit.similarity >= 0.9);
        }
    }

    #[test]
    fn floor_filters_after_truncation() {
        let store = Store::open_in_memory().expect("open");
        let user = UserId::new();

        insert(&store, user, "match", &[1.0, 0.0]);
        insert(&store, user, "orthogonal", &[0.0, 1.0]);

        let hits = store
            .search(
                &Embedding(vec![1.0, 0.0]),
                &SearchOptions {
                    top_k: 5,
                    user_id: Some(user),
                    min_similarity: Some(0.7),
                    ..SearchOptions::default()
                },
            )
            .expect("search");

        // Orthogonal has similarity 0.5 — below the floor, so fewer than
        // top_k results come back.
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory.content, "match");
    }

    #[test]
    fn scoped_to_user_and_category() {
        let store = Store::open_in_memory().expect("open");
        let alice = UserId::new();
        let bob = UserId::new();

        insert(&store, alice, "alice memory", &[1.0, 0.0]);
        insert(&store, bob, "bob memory", &[1.0, 0.0]);

        let hits = store
            .search(
                &Embedding(vec![1.0, 0.0]),
                &SearchOptions {
                    top_k: 10,
                    user_id: Some(alice),
                    ..SearchOptions::default()
                },
            )
            .expect("search");

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory.content, "alice memory");
    }

    #[tokio::test]
    async fn bulk_search_preserves_query_order() {
        let store = Store::open_in_memory().expect("open");
        let user = UserId::new();

        insert(&store, user, "east", &[1.0, 0.0]);
        insert(&store, user, "north", &[0.0, 1.0]);

        let queries = vec![
            Embedding(vec![0.0, 1.0]), // expects "north" first
            Embedding(vec![1.0, 0.0]), // expects "east" first
        ];
        let results = store
            .bulk_search(
                &queries,
                &SearchOptions {
                    top_k: 1,
                    user_id: Some(user),
                    ..SearchOptions::default()
                },
            )
            .await
            .expect("bulk search");

        assert_eq!(results.len(), 2);
        assert_eq!(results[0][0].memory.content, "north");
        assert_eq!(results[1][0].memory.content, "east");
    }

    #[tokio::test]
    async fn bulk_search_empty_queries() {
        let store = Store::open_in_memory().expect("open");
        let results = store
            .bulk_search(&[], &SearchOptions::default())
            .await
            .expect("bulk search");
        assert!(results.is_empty());
    }

    proptest! {
        #[test]
        fn similarity_in_unit_range(distance in 0.0f32..=2.0) {
            let similarity = similarity_from_distance(distance);
            prop_assert!((0.0..=1.0).contains(&similarity));
        }

        #[test]
        fn similarity_monotone_in_distance(
            a in 0.0f32..=2.0,
            b in 0.0f32..=2.0,
        ) {
            prop_assume!(a < b);
            prop_assert!(similarity_from_distance(a) > similarity_from_distance(b));
        }
    }
}
