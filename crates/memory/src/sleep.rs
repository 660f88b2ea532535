//! The sleep cycle: a seven-phase consolidator that runs over the whole
//! store on a schedule.
//!
//! Phase order matters. Deduplication (vector, then LLM-judged, then
//! conflict adjudication) runs first so later phases score a clean
//! population; Pareto scoring snapshots once and phases 3–5 reuse that
//! snapshot (promotion is one-way, so known staleness is accepted in
//! exchange for a single score query). Extraction catch-up runs before decay
//! so freshly enriched memories get their entity links before anything is
//! pruned. Orphan cleanup and the noise purge close out the cycle.
//!
//! No error escapes: every phase wraps its body, logs, and lets the next
//! phase run. A single abort signal short-circuits each phase on entry and
//! every LLM batch in between; partial progress is kept.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use keepsake_config::SleepConfig;
use keepsake_llm::AbortSignal;

use crate::extraction::run_background_extraction;
use crate::extractor::{ConflictVerdict, Extractor};
use crate::gate::OPEN_PROPOSAL_PATTERNS;
use crate::schema::MemoryCategory;
use crate::scorer;
use crate::store::{DecayQuery, DuplicateCluster, GraphStore, StoreError};

// ── Options & result ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepPhase {
    VectorDedup,
    SemanticDedup,
    ConflictResolution,
    ParetoScoring,
    CorePromotion,
    ExtractionCatchUp,
    DecayPruning,
    OrphanCleanup,
    NoiseCleanup,
}

impl SleepPhase {
    pub fn label(self) -> &'static str {
        match self {
            Self::VectorDedup => "vector deduplication",
            Self::SemanticDedup => "semantic deduplication",
            Self::ConflictResolution => "conflict resolution",
            Self::ParetoScoring => "pareto scoring",
            Self::CorePromotion => "core promotion",
            Self::ExtractionCatchUp => "extraction catch-up",
            Self::DecayPruning => "decay & pruning",
            Self::OrphanCleanup => "orphan cleanup",
            Self::NoiseCleanup => "noise cleanup",
        }
    }
}

/// Human-readable progress event, delivered synchronously at each phase
/// start.
#[derive(Debug, Clone)]
pub struct SleepProgress {
    pub phase: SleepPhase,
    pub message: String,
}

pub struct SleepCycleOptions {
    pub agent_id: Option<String>,
    pub config: SleepConfig,
    pub abort: AbortSignal,
    pub progress: Option<mpsc::UnboundedSender<SleepProgress>>,
}

impl Default for SleepCycleOptions {
    fn default() -> Self {
        Self {
            agent_id: None,
            config: SleepConfig::default(),
            abort: AbortSignal::never(),
            progress: None,
        }
    }
}

/// Per-phase counters aggregated over one cycle.
#[derive(Debug, Clone, Default)]
pub struct SleepCycleResult {
    pub clusters_found: usize,
    pub vector_merges: usize,
    pub vector_invalidated: usize,
    pub semantic_pairs_checked: usize,
    pub semantic_invalidated: usize,
    pub conflicts_checked: usize,
    pub conflicts_invalidated: usize,
    pub memories_scored: usize,
    pub pareto_threshold: f64,
    pub promoted_to_core: usize,
    pub extractions_pending_before: usize,
    pub extractions_succeeded: usize,
    pub extractions_failed: usize,
    pub memories_pruned: usize,
    pub orphan_entities_deleted: usize,
    pub orphan_tags_deleted: usize,
    pub noise_purged: usize,
    pub duration_ms: u64,
    pub aborted: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

pub async fn run_sleep_cycle(
    store: &dyn GraphStore,
    extractor: &Extractor,
    options: SleepCycleOptions,
) -> SleepCycleResult {
    let started = Instant::now();
    let mut cycle = Cycle {
        store,
        extractor,
        agent_id: options.agent_id,
        config: options.config,
        abort: options.abort,
        progress: options.progress,
        invalidated: HashSet::new(),
        score_snapshot: Vec::new(),
        result: SleepCycleResult::default(),
    };

    // Strict phase order; each phase is gated on the abort signal and
    // wrapped so a failure logs and the next phase still runs.
    if !cycle.should_stop() {
        cycle.emit(SleepPhase::VectorDedup, "starting deduplication");
        if let Err(err) = cycle.phase_dedup().await {
            warn!(%err, "deduplication phase failed, continuing");
        }
    }
    if !cycle.should_stop() {
        cycle.emit(SleepPhase::ParetoScoring, "scoring all memories");
        if let Err(err) = cycle.phase_pareto().await {
            warn!(%err, "pareto scoring failed, continuing");
        }
    }
    if !cycle.should_stop() {
        cycle.emit(SleepPhase::CorePromotion, "evaluating core promotion");
        if let Err(err) = cycle.phase_promotion().await {
            warn!(%err, "core promotion failed, continuing");
        }
    }
    if !cycle.should_stop() {
        cycle.emit(SleepPhase::ExtractionCatchUp, "catching up pending extractions");
        if let Err(err) = cycle.phase_extraction().await {
            warn!(%err, "extraction catch-up failed, continuing");
        }
    }
    if !cycle.should_stop() {
        cycle.emit(SleepPhase::DecayPruning, "pruning decayed memories");
        if let Err(err) = cycle.phase_decay().await {
            warn!(%err, "decay pruning failed, continuing");
        }
    }
    if !cycle.should_stop() {
        cycle.emit(SleepPhase::OrphanCleanup, "deleting orphaned entities and tags");
        if let Err(err) = cycle.phase_orphans().await {
            warn!(%err, "orphan cleanup failed, continuing");
        }
    }
    if !cycle.should_stop() {
        cycle.emit(SleepPhase::NoiseCleanup, "purging noise patterns");
        if let Err(err) = cycle.phase_noise().await {
            warn!(%err, "noise cleanup failed, continuing");
        }
    }

    let mut result = cycle.result;
    result.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        merges = result.vector_merges,
        semantic_invalidated = result.semantic_invalidated,
        conflicts_invalidated = result.conflicts_invalidated,
        promoted = result.promoted_to_core,
        pruned = result.memories_pruned,
        noise_purged = result.noise_purged,
        duration_ms = result.duration_ms,
        aborted = result.aborted,
        "sleep cycle complete"
    );
    result
}

// ── Cycle state ───────────────────────────────────────────────────────────────

struct Cycle<'a> {
    store: &'a dyn GraphStore,
    extractor: &'a Extractor,
    agent_id: Option<String>,
    config: SleepConfig,
    abort: AbortSignal,
    progress: Option<mpsc::UnboundedSender<SleepProgress>>,
    /// Memories invalidated during this cycle; later LLM pairs touching one
    /// are skipped so two concurrent verdicts can never contradict each
    /// other's survivor.
    invalidated: HashSet<Uuid>,
    /// Phase 2 snapshot reused by phases 3–5.
    score_snapshot: Vec<crate::store::ScoredMemory>,
    result: SleepCycleResult,
}

struct DedupPair {
    a_id: Uuid,
    a_text: String,
    a_importance: f64,
    b_id: Uuid,
    b_text: String,
    b_importance: f64,
    similarity: f64,
}

impl<'a> Cycle<'a> {
    fn agent(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    /// Check the abort signal, latching the result flag.
    fn should_stop(&mut self) -> bool {
        if self.abort.is_aborted() {
            self.result.aborted = true;
        }
        self.result.aborted
    }

    fn emit(&self, phase: SleepPhase, message: impl Into<String>) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(SleepProgress { phase, message: message.into() });
        }
    }

    // ── Phase 1: vector + semantic dedup, then conflicts ─────────────────────

    async fn phase_dedup(&mut self) -> Result<(), StoreError> {
        let clusters = self
            .store
            .find_duplicate_clusters(self.config.cluster_threshold, self.agent(), true)
            .await?;
        self.result.clusters_found = clusters.len();

        // A cluster with any pair at or above the merge threshold collapses
        // without asking the LLM; everything else becomes candidate pairs.
        let (high, medium): (Vec<_>, Vec<_>) = clusters.into_iter().partition(|c| {
            c.similarities
                .as_ref()
                .is_some_and(|sims| sims.values().any(|&s| s >= self.config.dedup_threshold))
        });

        // Phase 1a: vector merges.
        for cluster in &high {
            if self.should_stop() {
                return Ok(());
            }
            let outcome = self
                .store
                .merge_memory_cluster(&cluster.memory_ids, &cluster.importances)
                .await?;
            self.result.vector_merges += 1;
            self.result.vector_invalidated += outcome.deleted_count;
            for &id in &cluster.memory_ids {
                if id != outcome.kept_id {
                    self.invalidated.insert(id);
                }
            }
        }

        if self.config.skip_semantic_dedup {
            return Ok(());
        }

        // Phase 1b: LLM-judged pairs from medium-similarity clusters.
        self.emit(SleepPhase::SemanticDedup, "judging borderline duplicate pairs");
        let pairs = self.collect_dedup_pairs(&medium);
        for chunk in pairs.chunks(self.config.llm_concurrency.max(1)) {
            if self.should_stop() {
                return Ok(());
            }
            let eligible: Vec<&DedupPair> = chunk
                .iter()
                .filter(|p| {
                    !self.invalidated.contains(&p.a_id) && !self.invalidated.contains(&p.b_id)
                })
                .collect();

            let extractor = self.extractor;
            let abort = self.abort.clone();
            let verdicts = join_all(eligible.iter().map(|pair| {
                let abort = abort.clone();
                async move {
                    let duplicate = extractor
                        .is_semantic_duplicate(
                            &pair.b_text,
                            &pair.a_text,
                            Some(pair.similarity),
                            &abort,
                        )
                        .await;
                    (*pair, duplicate)
                }
            }))
            .await;

            for (pair, duplicate) in verdicts {
                self.result.semantic_pairs_checked += 1;
                if !duplicate {
                    continue;
                }
                // Re-check after the verdict: a concurrent pair in this batch
                // may have already claimed one side.
                if self.invalidated.contains(&pair.a_id) || self.invalidated.contains(&pair.b_id) {
                    continue;
                }
                let loser = if pair.b_importance < pair.a_importance {
                    pair.b_id
                } else {
                    pair.a_id
                };
                self.store.invalidate_memory(loser).await?;
                self.invalidated.insert(loser);
                self.result.semantic_invalidated += 1;
            }
        }

        // Phase 1c: conflict adjudication.
        self.emit(SleepPhase::ConflictResolution, "adjudicating contradictory pairs");
        self.phase_conflicts().await
    }

    fn collect_dedup_pairs(&self, clusters: &[DuplicateCluster]) -> Vec<DedupPair> {
        let mut pairs = Vec::new();
        for cluster in clusters {
            for i in 0..cluster.memory_ids.len() {
                for j in (i + 1)..cluster.memory_ids.len() {
                    let key = scorer::pair_key(cluster.memory_ids[i], cluster.memory_ids[j]);
                    let similarity = cluster
                        .similarities
                        .as_ref()
                        .and_then(|sims| sims.get(&key).copied())
                        .unwrap_or(0.0);
                    pairs.push(DedupPair {
                        a_id: cluster.memory_ids[i],
                        a_text: cluster.texts[i].clone(),
                        a_importance: cluster.importances[i],
                        b_id: cluster.memory_ids[j],
                        b_text: cluster.texts[j].clone(),
                        b_importance: cluster.importances[j],
                        similarity,
                    });
                }
            }
        }
        if pairs.len() > self.config.max_semantic_dedup_pairs {
            warn!(
                total = pairs.len(),
                cap = self.config.max_semantic_dedup_pairs,
                "semantic dedup pair budget exceeded, keeping most-similar pairs"
            );
            pairs.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
            pairs.truncate(self.config.max_semantic_dedup_pairs);
        }
        pairs
    }

    async fn phase_conflicts(&mut self) -> Result<(), StoreError> {
        let conflicts = self.store.find_conflicting_memories(self.agent()).await?;
        for chunk in conflicts.chunks(self.config.llm_concurrency.max(1)) {
            if self.should_stop() {
                return Ok(());
            }
            let eligible: Vec<_> = chunk
                .iter()
                .filter(|p| {
                    !self.invalidated.contains(&p.memory_a.id)
                        && !self.invalidated.contains(&p.memory_b.id)
                })
                .collect();

            let extractor = self.extractor;
            let abort = self.abort.clone();
            let verdicts = join_all(eligible.iter().map(|pair| {
                let abort = abort.clone();
                async move {
                    let verdict = extractor
                        .resolve_conflict(&pair.memory_a.text, &pair.memory_b.text, &abort)
                        .await;
                    (*pair, verdict)
                }
            }))
            .await;

            for (pair, verdict) in verdicts {
                self.result.conflicts_checked += 1;
                let doomed = match verdict {
                    ConflictVerdict::KeepA => Some(pair.memory_b.id),
                    ConflictVerdict::KeepB => Some(pair.memory_a.id),
                    ConflictVerdict::Both | ConflictVerdict::Skip => None,
                };
                let Some(doomed) = doomed else { continue };
                if self.invalidated.contains(&pair.memory_a.id)
                    || self.invalidated.contains(&pair.memory_b.id)
                {
                    continue;
                }
                self.store.invalidate_memory(doomed).await?;
                self.invalidated.insert(doomed);
                self.result.conflicts_invalidated += 1;
            }
        }
        Ok(())
    }

    // ── Phase 2: Pareto scoring ──────────────────────────────────────────────

    async fn phase_pareto(&mut self) -> Result<(), StoreError> {
        let scores = self.store.calculate_all_effective_scores(self.agent()).await?;
        self.result.memories_scored = scores.len();
        let values: Vec<f64> = scores.iter().map(|s| s.effective_score).collect();
        self.result.pareto_threshold =
            scorer::pareto_threshold(&values, self.config.pareto_percentile);
        self.score_snapshot = scores;
        Ok(())
    }

    // ── Phase 3: core promotion ──────────────────────────────────────────────

    async fn phase_promotion(&mut self) -> Result<(), StoreError> {
        if self.config.skip_promotion {
            return Ok(());
        }
        // Uses the Phase 2 snapshot; promotion is one-way, so slight
        // staleness is acceptable.
        let threshold = self.result.pareto_threshold;
        let candidates: Vec<Uuid> = self
            .score_snapshot
            .iter()
            .filter(|s| {
                s.category != MemoryCategory::Core
                    && s.effective_score >= threshold
                    && s.age_days >= self.config.promotion_min_age_days
                    && !self.invalidated.contains(&s.id)
            })
            .map(|s| s.id)
            .collect();
        if !candidates.is_empty() {
            self.result.promoted_to_core = self.store.promote_to_core(&candidates).await?;
        }
        Ok(())
    }

    // ── Phase 4: extraction catch-up ─────────────────────────────────────────

    async fn phase_extraction(&mut self) -> Result<(), StoreError> {
        let counts = self.store.count_by_extraction_status(self.agent()).await?;
        self.result.extractions_pending_before = counts.pending;
        if counts.pending == 0 {
            return Ok(());
        }

        // Memories already attempted this cycle stay pending on transient
        // failure; widening the query window keeps them from shadowing the
        // rest of the backlog.
        let mut attempted: HashSet<Uuid> = HashSet::new();
        loop {
            if self.should_stop() {
                return Ok(());
            }
            let window = self.config.extraction_batch_size + attempted.len();
            let page = self.store.list_pending_extractions(window, self.agent()).await?;
            let fresh: Vec<_> = page
                .into_iter()
                .filter(|p| !attempted.contains(&p.id))
                .take(self.config.extraction_batch_size)
                .collect();
            if fresh.is_empty() {
                return Ok(());
            }

            for chunk in fresh.chunks(self.config.llm_concurrency.max(1)) {
                if self.should_stop() {
                    return Ok(());
                }
                let store = self.store;
                let extractor = self.extractor;
                let abort = self.abort.clone();
                let outcomes = join_all(chunk.iter().map(|pending| {
                    let abort = abort.clone();
                    async move {
                        run_background_extraction(
                            store,
                            extractor,
                            pending.id,
                            &pending.text,
                            pending.extraction_retries,
                            &abort,
                        )
                        .await
                    }
                }))
                .await;
                for outcome in outcomes {
                    if outcome.success {
                        self.result.extractions_succeeded += 1;
                    } else {
                        self.result.extractions_failed += 1;
                    }
                }
            }
            attempted.extend(fresh.iter().map(|p| p.id));

            // A short page means the backlog is drained; otherwise pause
            // between pages, waking early on abort.
            if fresh.len() < self.config.extraction_batch_size {
                return Ok(());
            }
            let delay = Duration::from_millis(self.config.extraction_delay_ms);
            if !self.abort.sleep_unless_aborted(delay).await {
                self.result.aborted = true;
                return Ok(());
            }
        }
    }

    // ── Phase 5: decay & pruning ─────────────────────────────────────────────

    async fn phase_decay(&mut self) -> Result<(), StoreError> {
        let query = DecayQuery {
            decay: self.config.decay.clone(),
            agent_id: self.agent_id.clone(),
        };
        let decayed = self.store.find_decayed_memories(&query).await?;
        if !decayed.is_empty() {
            self.result.memories_pruned = self.store.prune_memories(&decayed).await?;
        }
        Ok(())
    }

    // ── Phase 6: orphan cleanup ──────────────────────────────────────────────

    async fn phase_orphans(&mut self) -> Result<(), StoreError> {
        let entities = self.store.find_orphan_entities().await?;
        if !entities.is_empty() {
            self.result.orphan_entities_deleted =
                self.store.delete_orphan_entities(&entities).await?;
        }
        let tags = self.store.find_orphan_tags().await?;
        if !tags.is_empty() {
            self.result.orphan_tags_deleted = self.store.delete_orphan_tags(&tags).await?;
        }
        Ok(())
    }

    // ── Phase 7: noise purge ─────────────────────────────────────────────────

    /// Open proposals are rejected at the assistant gate; anything that
    /// reached the store through another path is purged here.
    async fn phase_noise(&mut self) -> Result<(), StoreError> {
        let memories = self.store.list_memories(self.agent()).await?;
        let noisy: Vec<Uuid> = memories
            .iter()
            .filter(|m| m.category != MemoryCategory::Core && !m.user_pinned)
            .filter(|m| OPEN_PROPOSAL_PATTERNS.iter().any(|p| p.is_match(&m.text)))
            .map(|m| m.id)
            .collect();
        if !noisy.is_empty() {
            self.result.noise_purged = self.store.prune_memories(&noisy).await?;
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration as ChronoDuration, Utc};
    use keepsake_config::ExtractionConfig;
    use keepsake_llm::{AbortHandle, LlmError};

    use crate::extractor::testing::ScriptedOracle;
    use crate::extractor::ExtractedEntity;
    use crate::graph::MemoryGraph;
    use crate::schema::{content_hash, EntityType, ExtractionStatus, Memory};

    use super::*;

    fn unit(v: Vec<f32>) -> Vec<f32> {
        let mag: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.into_iter().map(|x| x / mag).collect()
    }

    fn memory(text: &str, embedding: Vec<f32>, importance: f64) -> Memory {
        let now = Utc::now();
        Memory {
            id: uuid::Uuid::new_v4(),
            text: text.to_string(),
            embedding,
            category: MemoryCategory::Fact,
            importance,
            retrieval_count: 0,
            created_at: now,
            last_accessed_at: now,
            extraction_status: ExtractionStatus::Complete,
            extraction_retries: 0,
            user_pinned: false,
            invalidated: false,
            agent_id: None,
            content_hash: content_hash(text),
        }
    }

    fn extractor_with(oracle: Arc<ScriptedOracle>) -> Extractor {
        Extractor::new(ExtractionConfig::default(), oracle)
    }

    fn quiet_options() -> SleepCycleOptions {
        SleepCycleOptions {
            config: SleepConfig { skip_semantic_dedup: true, ..Default::default() },
            ..Default::default()
        }
    }

    fn entity(name: &str) -> ExtractedEntity {
        ExtractedEntity {
            name: name.to_string(),
            entity_type: EntityType::Concept,
            aliases: Vec::new(),
            description: None,
        }
    }

    #[tokio::test]
    async fn vector_merge_collapses_high_similarity_cluster() {
        let graph = MemoryGraph::new();
        let mut strong = memory("user lives in lisbon", unit(vec![1.0, 0.02]), 0.8);
        strong.retrieval_count = 2;
        let mut weak = memory("the user is living in lisbon", unit(vec![1.0, 0.0]), 0.5);
        weak.retrieval_count = 3;
        let (strong_id, weak_id) = (strong.id, weak.id);
        graph.insert_raw(strong).await;
        graph.insert_raw(weak).await;
        graph
            .batch_entity_operations(strong_id, &[entity("lisbon")], &[], &[], None)
            .await
            .unwrap();
        graph
            .batch_entity_operations(weak_id, &[entity("portugal")], &[], &[], None)
            .await
            .unwrap();

        let oracle = ScriptedOracle::silent();
        let extractor = extractor_with(oracle);
        let result = run_sleep_cycle(&graph, &extractor, quiet_options()).await;

        assert_eq!(result.clusters_found, 1);
        assert_eq!(result.vector_merges, 1);
        assert_eq!(result.vector_invalidated, 1);
        assert!(!result.aborted);

        let kept = graph.get_memory(strong_id).await.unwrap().unwrap();
        assert!(!kept.invalidated);
        assert_eq!(kept.importance, 0.8);
        assert_eq!(kept.retrieval_count, 5, "retrieval counts sum across the cluster");
        assert!(graph.get_memory(weak_id).await.unwrap().unwrap().invalidated);
        // Both MENTIONS edges survive on the kept memory.
        assert_eq!(graph.edge_snapshot(strong_id).await.mentions.len(), 2);
    }

    #[tokio::test]
    async fn semantic_dedup_prescreens_below_fast_path() {
        let graph = MemoryGraph::new();
        // 38 degrees apart, cos 0.788: clusters at 0.75 but sits below the 0.80
        // LLM fast path, so the pair resolves without a call.
        let a = memory("enjoys hiking on weekends", unit(vec![1.0, 0.0]), 0.6);
        let b = memory("sometimes hikes on saturdays", unit(vec![0.788, 0.616]), 0.4);
        graph.insert_raw(a).await;
        graph.insert_raw(b).await;

        let oracle = ScriptedOracle::silent();
        let extractor = extractor_with(oracle.clone());
        let result = run_sleep_cycle(&graph, &extractor, SleepCycleOptions::default()).await;

        assert_eq!(result.semantic_pairs_checked, 1);
        assert_eq!(result.semantic_invalidated, 0);
        assert_eq!(oracle.remaining().await, 0, "no reply was ever consumed");
    }

    #[tokio::test]
    async fn semantic_dedup_invalidates_lower_importance_on_verdict() {
        let graph = MemoryGraph::new();
        // 30 degrees apart, cos 0.866: above the fast path, below the merge
        // threshold, so the LLM decides.
        let strong = memory("prefers aisle seats on long flights", unit(vec![1.0, 0.0]), 0.7);
        let weak = memory("likes aisle seats", unit(vec![0.866, 0.5]), 0.3);
        let (strong_id, weak_id) = (strong.id, weak.id);
        graph.insert_raw(strong).await;
        graph.insert_raw(weak).await;

        let oracle = ScriptedOracle::new(vec![Ok(r#"{"verdict": "duplicate"}"#.into())]);
        let extractor = extractor_with(oracle);
        let result = run_sleep_cycle(&graph, &extractor, SleepCycleOptions::default()).await;

        assert_eq!(result.semantic_pairs_checked, 1);
        assert_eq!(result.semantic_invalidated, 1);
        assert!(graph.get_memory(weak_id).await.unwrap().unwrap().invalidated);
        assert!(!graph.get_memory(strong_id).await.unwrap().unwrap().invalidated);
    }

    #[tokio::test]
    async fn conflict_verdict_b_invalidates_first_memory() {
        let graph = MemoryGraph::new();
        // 44 degrees apart, cos 0.72: inside the conflict band, below the
        // cluster threshold, so only Phase 1c sees this pair.
        let mut tea = memory("I prefer tea in the mornings", unit(vec![1.0, 0.0]), 0.6);
        tea.category = MemoryCategory::Preference;
        tea.created_at = Utc::now() - ChronoDuration::minutes(5);
        let mut coffee = memory("I prefer coffee in the mornings", unit(vec![0.72, 0.694]), 0.6);
        coffee.category = MemoryCategory::Preference;
        let (tea_id, coffee_id) = (tea.id, coffee.id);
        graph.insert_raw(tea).await;
        graph.insert_raw(coffee).await;

        let oracle = ScriptedOracle::new(vec![Ok(r#"{"keep": "b"}"#.into())]);
        let extractor = extractor_with(oracle);
        let result = run_sleep_cycle(&graph, &extractor, SleepCycleOptions::default()).await;

        assert_eq!(result.conflicts_checked, 1);
        assert_eq!(result.conflicts_invalidated, 1);
        assert!(graph.get_memory(tea_id).await.unwrap().unwrap().invalidated);
        assert!(!graph.get_memory(coffee_id).await.unwrap().unwrap().invalidated);
    }

    #[tokio::test]
    async fn conflict_verdict_both_keeps_both() {
        let graph = MemoryGraph::new();
        let mut tea = memory("I drink tea at work", unit(vec![1.0, 0.0]), 0.6);
        tea.category = MemoryCategory::Preference;
        tea.created_at = Utc::now() - ChronoDuration::minutes(5);
        let mut coffee = memory("I drink coffee at home", unit(vec![0.72, 0.694]), 0.6);
        coffee.category = MemoryCategory::Preference;
        let (tea_id, coffee_id) = (tea.id, coffee.id);
        graph.insert_raw(tea).await;
        graph.insert_raw(coffee).await;

        let oracle = ScriptedOracle::new(vec![Ok(r#"{"keep": "both"}"#.into())]);
        let extractor = extractor_with(oracle);
        let result = run_sleep_cycle(&graph, &extractor, SleepCycleOptions::default()).await;

        assert_eq!(result.conflicts_checked, 1);
        assert_eq!(result.conflicts_invalidated, 0);
        assert!(!graph.get_memory(tea_id).await.unwrap().unwrap().invalidated);
        assert!(!graph.get_memory(coffee_id).await.unwrap().unwrap().invalidated);
    }

    #[tokio::test]
    async fn transient_extraction_failures_accumulate_across_cycles() {
        let graph = MemoryGraph::new();
        let mut pending = memory("alice works at acme corporation", unit(vec![1.0, 0.0]), 0.6);
        pending.extraction_status = ExtractionStatus::Pending;
        let id = pending.id;
        graph.insert_raw(pending).await;

        // One timeout per cycle, three cycles.
        let oracle = ScriptedOracle::new(vec![
            Err(LlmError::Timeout),
            Err(LlmError::Timeout),
            Err(LlmError::Timeout),
        ]);
        let extractor = extractor_with(oracle);

        for expected in [
            (1, ExtractionStatus::Pending),
            (2, ExtractionStatus::Pending),
            (3, ExtractionStatus::Failed),
        ] {
            let result = run_sleep_cycle(&graph, &extractor, quiet_options()).await;
            assert_eq!(result.extractions_pending_before, 1);
            assert_eq!(result.extractions_failed, 1);
            let m = graph.get_memory(id).await.unwrap().unwrap();
            assert_eq!(m.extraction_retries, expected.0);
            assert_eq!(m.extraction_status, expected.1);
        }

        // The budget is spent: later cycles see nothing pending.
        let result = run_sleep_cycle(&graph, &extractor, quiet_options()).await;
        assert_eq!(result.extractions_pending_before, 0);
    }

    #[tokio::test]
    async fn promotion_requires_flag_score_and_age() {
        let graph = MemoryGraph::new();
        let mut veteran = memory("user's long-standing project is keepsake", unit(vec![1.0, 0.0]), 0.9);
        veteran.created_at = Utc::now() - ChronoDuration::days(10);
        veteran.retrieval_count = 8;
        let fresh = memory("mentioned a new cafe yesterday", unit(vec![0.0, 1.0]), 0.3);
        let (veteran_id, fresh_id) = (veteran.id, fresh.id);
        graph.insert_raw(veteran).await;
        graph.insert_raw(fresh).await;

        // Promotion disabled by default: nothing moves.
        let extractor = extractor_with(ScriptedOracle::silent());
        let result = run_sleep_cycle(&graph, &extractor, quiet_options()).await;
        assert_eq!(result.promoted_to_core, 0);

        let mut options = quiet_options();
        options.config.skip_promotion = false;
        let result = run_sleep_cycle(&graph, &extractor, options).await;
        assert_eq!(result.promoted_to_core, 1);
        let veteran = graph.get_memory(veteran_id).await.unwrap().unwrap();
        assert_eq!(veteran.category, MemoryCategory::Core);
        // The young low scorer stays where it is.
        let fresh = graph.get_memory(fresh_id).await.unwrap().unwrap();
        assert_ne!(fresh.category, MemoryCategory::Core);
    }

    #[tokio::test]
    async fn decay_prunes_and_orphans_follow() {
        let graph = MemoryGraph::new();
        let mut stale = memory("trivial aside from last year", unit(vec![1.0, 0.0]), 0.1);
        stale.created_at = Utc::now() - ChronoDuration::days(300);
        let stale_id = stale.id;
        let keeper = memory("the user's sister is named maya", unit(vec![0.0, 1.0]), 0.9);
        graph.insert_raw(stale).await;
        graph.insert_raw(keeper).await;
        graph
            .batch_entity_operations(stale_id, &[entity("aside")], &[], &[], None)
            .await
            .unwrap();

        let extractor = extractor_with(ScriptedOracle::silent());
        let result = run_sleep_cycle(&graph, &extractor, quiet_options()).await;

        assert_eq!(result.memories_pruned, 1);
        assert!(graph.get_memory(stale_id).await.unwrap().is_none());
        // The entity lost its only mention and was swept in Phase 6.
        assert_eq!(result.orphan_entities_deleted, 1);
        assert_eq!(graph.entity_count().await, 0);
    }

    #[tokio::test]
    async fn noise_purge_deletes_stored_proposals_but_spares_pinned() {
        let graph = MemoryGraph::new();
        let proposal = memory(
            "Want me to submit that pull request for you?",
            unit(vec![1.0, 0.0]),
            0.5,
        );
        let mut pinned = memory(
            "Should I keep the weekly review on Mondays?",
            unit(vec![0.0, 1.0]),
            0.5,
        );
        pinned.user_pinned = true;
        let (proposal_id, pinned_id) = (proposal.id, pinned.id);
        graph.insert_raw(proposal).await;
        graph.insert_raw(pinned).await;

        let extractor = extractor_with(ScriptedOracle::silent());
        let result = run_sleep_cycle(&graph, &extractor, quiet_options()).await;

        assert_eq!(result.noise_purged, 1);
        assert!(graph.get_memory(proposal_id).await.unwrap().is_none());
        assert!(graph.get_memory(pinned_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn quiescent_store_yields_empty_second_cycle() {
        let graph = MemoryGraph::new();
        graph.insert_raw(memory("likes quiet mornings", unit(vec![1.0, 0.0]), 0.7)).await;
        graph.insert_raw(memory("owns a telescope", unit(vec![0.0, 1.0]), 0.7)).await;

        let extractor = extractor_with(ScriptedOracle::silent());
        run_sleep_cycle(&graph, &extractor, quiet_options()).await;
        let second = run_sleep_cycle(&graph, &extractor, quiet_options()).await;

        assert_eq!(second.vector_merges, 0);
        assert_eq!(second.semantic_invalidated, 0);
        assert_eq!(second.conflicts_invalidated, 0);
        assert_eq!(second.promoted_to_core, 0);
        assert_eq!(second.memories_pruned, 0);
        assert_eq!(second.noise_purged, 0);
        assert_eq!(second.memories_scored, 2);
    }

    #[tokio::test]
    async fn abort_before_start_short_circuits_every_phase() {
        let graph = MemoryGraph::new();
        // A cluster that would merge if any phase ran.
        let a = memory("duplicate one", unit(vec![1.0, 0.0]), 0.5);
        let b = memory("duplicate two", unit(vec![1.0, 0.001]), 0.5);
        let a_id = a.id;
        graph.insert_raw(a).await;
        graph.insert_raw(b).await;

        let (handle, signal) = AbortHandle::new();
        handle.abort();
        let options = SleepCycleOptions { abort: signal, ..Default::default() };
        let extractor = extractor_with(ScriptedOracle::silent());
        let result = run_sleep_cycle(&graph, &extractor, options).await;

        assert!(result.aborted);
        assert_eq!(result.clusters_found, 0);
        assert_eq!(result.memories_scored, 0);
        assert!(!graph.get_memory(a_id).await.unwrap().unwrap().invalidated);
    }

    #[tokio::test]
    async fn progress_events_fire_per_phase() {
        let graph = MemoryGraph::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = SleepCycleOptions {
            progress: Some(tx),
            config: SleepConfig { skip_semantic_dedup: true, ..Default::default() },
            ..Default::default()
        };
        let extractor = extractor_with(ScriptedOracle::silent());
        run_sleep_cycle(&graph, &extractor, options).await;

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            phases.push(event.phase);
        }
        assert!(phases.contains(&SleepPhase::VectorDedup));
        assert!(phases.contains(&SleepPhase::ParetoScoring));
        assert!(phases.contains(&SleepPhase::NoiseCleanup));
    }
}
