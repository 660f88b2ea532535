//! Engine facade: the ingest path and the consolidation entry points, wired
//! over a [`GraphStore`], an [`Extractor`], and an embedding backend.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

use keepsake_config::SleepConfig;
use keepsake_llm::{AbortHandle, AbortSignal};
use tokio::sync::mpsc;

use crate::extraction::run_background_extraction;
use crate::extractor::Extractor;
use crate::gate;
use crate::sleep::{SleepCycleOptions, SleepCycleResult, SleepProgress, run_sleep_cycle};
use crate::store::{ExtractionStatusCounts, GraphStore, InsertOptions};

/// Async embedding backend: text in, optional unit-norm vector out. Stored
/// as an `Arc` so it can be cloned into spawned tasks.
pub type EmbedFn = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Option<Vec<f32>>> + Send>> + Send + Sync,
>;

/// Which side of the conversation produced an utterance; selects the gate
/// profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub total_memories: usize,
    pub extraction: ExtractionStatusCounts,
}

pub struct MemoryEngine {
    store: Arc<dyn GraphStore>,
    extractor: Arc<Extractor>,
    embed_fn: EmbedFn,
    agent_id: Option<String>,
    /// Shutdown fan-out for fire-and-forget extraction tasks.
    abort: AbortHandle,
}

impl MemoryEngine {
    pub fn new(
        store: Arc<dyn GraphStore>,
        extractor: Arc<Extractor>,
        embed_fn: EmbedFn,
        agent_id: Option<String>,
    ) -> Self {
        let (abort, _) = AbortHandle::new();
        Self { store, extractor, embed_fn, agent_id, abort }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Signal every in-flight background extraction to wind down.
    pub fn shutdown(&self) {
        self.abort.abort();
    }

    /// Ingest one utterance: gate, embed, rate, insert, then spawn
    /// enrichment. Returns `Ok(None)` when the gate rejects; gate rejections
    /// are the common case and are logged, not errored.
    pub async fn ingest(&self, text: &str, role: SpeakerRole) -> Result<Option<Uuid>> {
        let text = text.trim();
        let gated = match role {
            SpeakerRole::User => gate::user_gate(text),
            SpeakerRole::Assistant => gate::assistant_gate(text),
        };
        if let Err(rejection) = gated {
            debug!(reason = rejection.as_str(), ?role, "attention gate rejected utterance");
            return Ok(None);
        }

        let embedding = (self.embed_fn)(text.to_string())
            .await
            .context("embedding backend returned no vector")?;

        let importance = self.extractor.rate_importance(text).await;
        let opts = InsertOptions {
            importance,
            agent_id: self.agent_id.clone(),
            ..Default::default()
        };
        let id = self
            .store
            .insert_memory(text, embedding, opts)
            .await
            .context("inserting memory")?;

        // Fire-and-forget enrichment; failures log and account retries,
        // nothing propagates to the ingest caller.
        let store = Arc::clone(&self.store);
        let extractor = Arc::clone(&self.extractor);
        let abort = self.abort.signal();
        let text = text.to_string();
        tokio::spawn(async move {
            let outcome =
                run_background_extraction(store.as_ref(), &extractor, id, &text, 0, &abort).await;
            if !outcome.success {
                warn!(memory_id = %id, "background extraction did not complete");
            }
        });

        info!(memory_id = %id, importance, "memory stored");
        Ok(Some(id))
    }

    /// Run one consolidation cycle over this engine's agent scope.
    pub async fn run_sleep_cycle(
        &self,
        config: SleepConfig,
        abort: AbortSignal,
        progress: Option<mpsc::UnboundedSender<SleepProgress>>,
    ) -> SleepCycleResult {
        let options = SleepCycleOptions {
            agent_id: self.agent_id.clone(),
            config,
            abort,
            progress,
        };
        run_sleep_cycle(self.store.as_ref(), &self.extractor, options).await
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let agent = self.agent_id.as_deref();
        Ok(EngineStats {
            total_memories: self.store.count_memories(agent).await?,
            extraction: self.store.count_by_extraction_status(agent).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use keepsake_config::ExtractionConfig;

    use crate::extractor::testing::ScriptedOracle;
    use crate::graph::MemoryGraph;
    use crate::schema::ExtractionStatus;

    use super::*;

    fn fixed_embedder() -> EmbedFn {
        Arc::new(|_text: String| -> Pin<Box<dyn Future<Output = Option<Vec<f32>>> + Send>> {
            Box::pin(async { Some(vec![1.0, 0.0]) })
        })
    }

    fn engine_with(oracle: Arc<ScriptedOracle>) -> MemoryEngine {
        let store = Arc::new(MemoryGraph::new());
        let extractor = Arc::new(Extractor::new(ExtractionConfig::default(), oracle));
        MemoryEngine::new(store, extractor, fixed_embedder(), None)
    }

    #[tokio::test]
    async fn gate_rejections_return_none_without_any_calls() {
        let engine = engine_with(ScriptedOracle::silent());
        let stored = engine.ingest("ok thanks!", SpeakerRole::User).await.unwrap();
        assert!(stored.is_none());
        assert_eq!(engine.stats().await.unwrap().total_memories, 0);
    }

    #[tokio::test]
    async fn ingest_stores_rates_and_enriches() {
        // Reply 1: importance rating. Reply 2: the background extraction.
        let oracle = ScriptedOracle::new(vec![
            Ok("8".into()),
            Ok(r#"{"category": "fact", "entities": [{"name": "maya", "type": "person"}], "relationships": [], "tags": []}"#.into()),
        ]);
        let engine = engine_with(oracle);

        let id = engine
            .ingest(
                "My sister Maya is moving to Lisbon at the end of the summer.",
                SpeakerRole::User,
            )
            .await
            .unwrap()
            .expect("substantive text passes the gate");

        let memory = engine.store().get_memory(id).await.unwrap().unwrap();
        assert_eq!(memory.importance, 0.8);

        // The spawned enrichment settles shortly after.
        for _ in 0..50 {
            let memory = engine.store().get_memory(id).await.unwrap().unwrap();
            if memory.extraction_status == ExtractionStatus::Complete {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("background extraction never completed");
    }

    #[tokio::test]
    async fn assistant_proposals_never_reach_the_store() {
        let engine = engine_with(ScriptedOracle::silent());
        let stored = engine
            .ingest(
                "Want me to submit that pull request for you once the tests pass?",
                SpeakerRole::Assistant,
            )
            .await
            .unwrap();
        assert!(stored.is_none());
    }
}
