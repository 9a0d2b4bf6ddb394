//! Access-History Manager
//!
//! Records retrieval hits against knowledge nodes: appends the access time to
//! each node's bounded history, recomputes the ACT-R activation, and writes
//! everything back in one version-guarded batch per category. Conflicting
//! writers retry a bounded number of times, then skip silently; losing an
//! activation update is never fatal to the read path.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::activation::base_level_activation;
use crate::config::MemoryConfig;
use crate::error::Result;
use crate::graph::{ActivationWrite, GraphStore, NodeCategory};

/// Default bound on optimistic-concurrency retries
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Outcome of one batched access recording
#[derive(Debug, Clone, Default)]
pub struct BatchAccessResult {
    /// Ids whose activation was updated, in input order
    pub updated: Vec<String>,
    /// Ids skipped after exhausting retries
    pub conflicted: Vec<String>,
    /// New activation values keyed alongside `updated`
    pub activations: Vec<(String, f64)>,
}

/// Batched, retry-safe activation recorder
pub struct AccessHistoryManager {
    store: Arc<GraphStore>,
    max_retries: usize,
}

impl AccessHistoryManager {
    pub fn new(store: Arc<GraphStore>) -> Self {
        Self {
            store,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(store: Arc<GraphStore>, max_retries: usize) -> Self {
        Self { store, max_retries }
    }

    /// Record one access for each node id at `now`
    ///
    /// Ids are deduplicated preserving first occurrence. Only knowledge
    /// categories are accepted; Chunk and Dialogue stay out of the activation
    /// layer by construction.
    pub fn record_batch_access(
        &self,
        category: NodeCategory,
        node_ids: &[String],
        config: &MemoryConfig,
        now: DateTime<Utc>,
    ) -> Result<BatchAccessResult> {
        let mut seen = HashSet::new();
        let unique_ids: Vec<String> = node_ids
            .iter()
            .filter(|id| !id.is_empty() && seen.insert(id.as_str()))
            .cloned()
            .collect();

        if unique_ids.len() < node_ids.len() {
            tracing::debug!(
                category = %category,
                total = node_ids.len(),
                unique = unique_ids.len(),
                "deduplicated access batch"
            );
        }

        let mut result = BatchAccessResult::default();
        if unique_ids.is_empty() {
            return Ok(result);
        }

        let mut pending = unique_ids;
        for attempt in 0..=self.max_retries {
            if pending.is_empty() {
                break;
            }

            let rows = self.store.fetch_activation_rows(category, &pending)?;
            if rows.is_empty() {
                break;
            }

            let writes: Vec<ActivationWrite> = rows
                .iter()
                .map(|row| {
                    let mut history = row.access_history.clone();
                    history.push(now);
                    if history.len() > config.access_history_cap {
                        let overflow = history.len() - config.access_history_cap;
                        history.drain(..overflow);
                    }
                    let activation =
                        base_level_activation(&history, now, config.activation_decay_d);
                    ActivationWrite {
                        id: row.id.clone(),
                        expected_version: row.version,
                        new_history: history,
                        new_activation: activation,
                        accessed_at: now,
                    }
                })
                .collect();

            let applied = self.store.batch_update_activation(category, &writes)?;
            let applied_set: HashSet<&str> = applied.iter().map(|s| s.as_str()).collect();

            for write in &writes {
                if applied_set.contains(write.id.as_str()) {
                    result.updated.push(write.id.clone());
                    if let Some(value) = write.new_activation {
                        result.activations.push((write.id.clone(), value));
                    }
                }
            }

            pending = writes
                .iter()
                .filter(|w| !applied_set.contains(w.id.as_str()))
                .map(|w| w.id.clone())
                .collect();

            if !pending.is_empty() && attempt < self.max_retries {
                tracing::debug!(
                    category = %category,
                    conflicted = pending.len(),
                    attempt = attempt + 1,
                    "activation update conflict, retrying"
                );
            }
        }

        if !pending.is_empty() {
            tracing::warn!(
                category = %category,
                skipped = pending.len(),
                "activation updates skipped after retries"
            );
            result.conflicted = pending;
        }

        Ok(result)
    }
}

// ============================================================================
// TESTS
// ============================================================================
