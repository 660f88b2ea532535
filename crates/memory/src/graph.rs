//! In-memory reference implementation of the [`GraphStore`] contract.
//!
//! Backs the engine in tests and single-process deployments; a driver-backed
//! implementation against a Cypher store is a drop-in replacement behind the
//! same trait. All mutation happens under one `RwLock` write guard, which is
//! what makes `batch_entity_operations` atomic here.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::extractor::{ExtractedEntity, ExtractedRelationship, ExtractedTag};
use crate::schema::{
    content_hash, Entity, EntityType, ExtractionStatus, Memory, MemoryCategory, Tag,
};
use crate::scorer;
use crate::store::{
    ConflictPair, DecayQuery, DuplicateCluster, ExtractionStatusCounts, GraphStore, InsertOptions,
    MemorySummary, MergeOutcome, PendingExtraction, ScoredMemory, StoreError, StoreResult,
};

/// Cosine band for conflict candidacy: close enough to talk about the same
/// thing, far enough apart not to be a vector-merge cluster.
const CONFLICT_SIM_LOW: f64 = 0.70;
const CONFLICT_SIM_HIGH: f64 = 0.95;

/// Cap on candidate pairs handed to the LLM adjudicator per query.
const MAX_CONFLICT_PAIRS: usize = 25;

#[derive(Default)]
struct GraphInner {
    memories: HashMap<Uuid, Memory>,
    entities: HashMap<Uuid, Entity>,
    tags: HashMap<Uuid, Tag>,
    /// MERGE key: `(name, type)` → entity id.
    entity_by_key: HashMap<(String, EntityType), Uuid>,
    /// MERGE key: tag name → tag id.
    tag_by_name: HashMap<String, Uuid>,
    /// `(Memory)-[:MENTIONS]->(Entity)`.
    mentions: HashMap<Uuid, HashSet<Uuid>>,
    /// `(Memory)-[:TAGGED]->(Tag)`.
    tagged: HashMap<Uuid, HashSet<Uuid>>,
    /// `(Entity)-[:R]->(Entity)` with confidence.
    entity_rels: HashMap<(Uuid, crate::schema::RelationType, Uuid), f64>,
    /// Dimension locked in by the first insert.
    embedding_dim: Option<usize>,
}

impl GraphInner {
    fn agent_matches(memory: &Memory, agent_id: Option<&str>) -> bool {
        match agent_id {
            Some(agent) => memory.agent_id.as_deref() == Some(agent),
            None => true,
        }
    }

    /// Non-invalidated memories for an agent, in deterministic order
    /// (insertion time, then id).
    fn active(&self, agent_id: Option<&str>) -> Vec<&Memory> {
        let mut memories: Vec<&Memory> = self
            .memories
            .values()
            .filter(|m| !m.invalidated && Self::agent_matches(m, agent_id))
            .collect();
        memories.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        memories
    }

    fn mentioned_entity_ids(&self) -> HashSet<Uuid> {
        self.mentions.values().flatten().copied().collect()
    }

    fn tagged_tag_ids(&self) -> HashSet<Uuid> {
        self.tagged.values().flatten().copied().collect()
    }

    fn drop_memory_edges(&mut self, memory_id: Uuid) {
        self.mentions.remove(&memory_id);
        self.tagged.remove(&memory_id);
    }
}

pub struct MemoryGraph {
    inner: RwLock<GraphInner>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self { inner: RwLock::new(GraphInner::default()) }
    }

    /// Test seam: place a fully-formed memory, bypassing gate and clamps.
    #[cfg(test)]
    pub(crate) async fn insert_raw(&self, memory: Memory) {
        let mut inner = self.inner.write().await;
        if inner.embedding_dim.is_none() && !memory.embedding.is_empty() {
            inner.embedding_dim = Some(memory.embedding.len());
        }
        inner.memories.insert(memory.id, memory);
    }

    /// Test seam: current MENTIONS / TAGGED edges of one memory.
    #[cfg(test)]
    pub(crate) async fn edge_snapshot(&self, memory_id: Uuid) -> crate::store::EdgeSnapshot {
        let inner = self.inner.read().await;
        crate::store::EdgeSnapshot {
            mentions: inner
                .mentions
                .get(&memory_id)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default(),
            tagged: inner
                .tagged
                .get(&memory_id)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default(),
        }
    }

    #[cfg(test)]
    pub(crate) async fn entity_count(&self) -> usize {
        self.inner.read().await.entities.len()
    }

    #[cfg(test)]
    pub(crate) async fn tag_count(&self) -> usize {
        self.inner.read().await.tags.len()
    }
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    async fn insert_memory(
        &self,
        text: &str,
        embedding: Vec<f32>,
        opts: InsertOptions,
    ) -> StoreResult<Uuid> {
        let text = text.trim();
        if text.is_empty() {
            return Err(StoreError::InvalidInput("memory text is empty".into()));
        }
        if embedding.is_empty() {
            return Err(StoreError::InvalidInput("embedding is empty".into()));
        }

        let mut inner = self.inner.write().await;
        match inner.embedding_dim {
            Some(dim) if dim != embedding.len() => {
                return Err(StoreError::InvalidInput(format!(
                    "embedding dimension {} does not match store dimension {dim}",
                    embedding.len()
                )));
            }
            Some(_) => {}
            None => inner.embedding_dim = Some(embedding.len()),
        }

        // Exact-content idempotence: an active twin wins over a new node.
        let hash = content_hash(text);
        if let Some(existing) = inner.memories.values().find(|m| {
            !m.invalidated
                && m.content_hash == hash
                && m.agent_id.as_deref() == opts.agent_id.as_deref()
        }) {
            debug!(id = %existing.id, "exact duplicate content, reusing memory");
            return Ok(existing.id);
        }

        let now = Utc::now();
        let memory = Memory {
            id: Uuid::new_v4(),
            text: text.to_string(),
            embedding,
            category: opts.category,
            importance: opts.importance.clamp(0.1, 1.0),
            retrieval_count: 0,
            created_at: now,
            last_accessed_at: now,
            extraction_status: ExtractionStatus::Pending,
            extraction_retries: 0,
            user_pinned: opts.user_pinned,
            invalidated: false,
            agent_id: opts.agent_id,
            content_hash: hash,
        };
        let id = memory.id;
        inner.memories.insert(id, memory);
        Ok(id)
    }

    async fn get_memory(&self, id: Uuid) -> StoreResult<Option<Memory>> {
        Ok(self.inner.read().await.memories.get(&id).cloned())
    }

    async fn update_extraction_status(
        &self,
        id: Uuid,
        status: ExtractionStatus,
        increment_retries: bool,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let memory = inner
            .memories
            .get_mut(&id)
            .ok_or(StoreError::UnknownMemory(id))?;

        if increment_retries {
            memory.extraction_retries += 1;
        }
        if memory.extraction_status.can_transition_to(status) {
            memory.extraction_status = status;
        } else {
            warn!(
                %id,
                current = ?memory.extraction_status,
                requested = ?status,
                "ignoring non-monotonic extraction status update"
            );
        }
        Ok(())
    }

    async fn batch_entity_operations(
        &self,
        memory_id: Uuid,
        entities: &[ExtractedEntity],
        relationships: &[ExtractedRelationship],
        tags: &[ExtractedTag],
        category: Option<MemoryCategory>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.memories.contains_key(&memory_id) {
            return Err(StoreError::UnknownMemory(memory_id));
        }

        // MERGE entities on (name, type); first description wins, aliases
        // accumulate.
        let mut batch_names: HashMap<String, Uuid> = HashMap::new();
        for extracted in entities {
            let key = (extracted.name.clone(), extracted.entity_type);
            let entity_id = match inner.entity_by_key.get(&key) {
                Some(&id) => {
                    if let Some(entity) = inner.entities.get_mut(&id) {
                        for alias in &extracted.aliases {
                            if !entity.aliases.contains(alias) {
                                entity.aliases.push(alias.clone());
                            }
                        }
                        if entity.description.is_none() {
                            entity.description = extracted.description.clone();
                        }
                    }
                    id
                }
                None => {
                    let entity = Entity {
                        id: Uuid::new_v4(),
                        name: extracted.name.clone(),
                        entity_type: extracted.entity_type,
                        aliases: extracted.aliases.clone(),
                        description: extracted.description.clone(),
                    };
                    let id = entity.id;
                    inner.entity_by_key.insert(key, id);
                    inner.entities.insert(id, entity);
                    id
                }
            };
            batch_names.insert(extracted.name.clone(), entity_id);
            inner.mentions.entry(memory_id).or_default().insert(entity_id);
        }

        // MERGE inter-entity relationships. Endpoints resolve against this
        // batch first, then against any previously stored entity by name.
        for rel in relationships {
            let resolve = |inner: &GraphInner, name: &str| -> Option<Uuid> {
                if let Some(&id) = batch_names.get(name) {
                    return Some(id);
                }
                let mut candidates: Vec<Uuid> = inner
                    .entity_by_key
                    .iter()
                    .filter(|((n, _), _)| n == name)
                    .map(|(_, &id)| id)
                    .collect();
                candidates.sort();
                candidates.first().copied()
            };
            let Some(source) = resolve(&inner, &rel.source) else {
                debug!(source = %rel.source, "relationship source unresolved, dropping edge");
                continue;
            };
            let Some(target) = resolve(&inner, &rel.target) else {
                debug!(target = %rel.target, "relationship target unresolved, dropping edge");
                continue;
            };
            inner
                .entity_rels
                .insert((source, rel.relation, target), rel.confidence);
        }

        // MERGE tags on name.
        for tag in tags {
            let tag_id = match inner.tag_by_name.get(&tag.name) {
                Some(&id) => id,
                None => {
                    let record = Tag {
                        id: Uuid::new_v4(),
                        name: tag.name.clone(),
                        category: tag.category.clone(),
                    };
                    let id = record.id;
                    inner.tag_by_name.insert(tag.name.clone(), id);
                    inner.tags.insert(id, record);
                    id
                }
            };
            inner.tagged.entry(memory_id).or_default().insert(tag_id);
        }

        let memory = inner
            .memories
            .get_mut(&memory_id)
            .expect("presence checked above");
        if let Some(category) = category {
            // The core tier overrides content categories; never demote it.
            if memory.category != MemoryCategory::Core {
                memory.category = category;
            }
        }
        if memory.extraction_status.can_transition_to(ExtractionStatus::Complete) {
            memory.extraction_status = ExtractionStatus::Complete;
        }
        Ok(())
    }

    async fn find_duplicate_clusters(
        &self,
        threshold: f64,
        agent_id: Option<&str>,
        with_scores: bool,
    ) -> StoreResult<Vec<DuplicateCluster>> {
        let inner = self.inner.read().await;
        let memories = inner.active(agent_id);
        let n = memories.len();

        // Union-find over the ≥-threshold pair graph; clusters are its
        // connected components. Transitivity of cosine is NOT assumed; the
        // sleep cycle re-checks individual pairs below the merge threshold.
        let mut parent: Vec<usize> = (0..n).collect();
        fn find(parent: &mut Vec<usize>, i: usize) -> usize {
            if parent[i] != i {
                let root = find(parent, parent[i]);
                parent[i] = root;
            }
            parent[i]
        }

        let mut similarities = scorer::SimilarityMap::new();
        for i in 0..n {
            for j in (i + 1)..n {
                // Cross-agent pairs are never adjacent.
                if memories[i].agent_id != memories[j].agent_id {
                    continue;
                }
                let sim = scorer::cosine_similarity(&memories[i].embedding, &memories[j].embedding);
                if sim >= threshold {
                    similarities.insert(scorer::pair_key(memories[i].id, memories[j].id), sim);
                    let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                    if ri != rj {
                        parent[ri] = rj;
                    }
                }
            }
        }

        let mut components: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..n {
            let root = find(&mut parent, i);
            components.entry(root).or_default().push(i);
        }

        let mut clusters: Vec<DuplicateCluster> = components
            .into_values()
            .filter(|members| members.len() >= 2)
            .map(|members| {
                let cluster_sims = with_scores.then(|| {
                    let mut map = scorer::SimilarityMap::new();
                    for (a_pos, &a) in members.iter().enumerate() {
                        for &b in &members[a_pos + 1..] {
                            let key = scorer::pair_key(memories[a].id, memories[b].id);
                            if let Some(&sim) = similarities.get(&key) {
                                map.insert(key, sim);
                            }
                        }
                    }
                    map
                });
                DuplicateCluster {
                    memory_ids: members.iter().map(|&i| memories[i].id).collect(),
                    texts: members.iter().map(|&i| memories[i].text.clone()).collect(),
                    importances: members.iter().map(|&i| memories[i].importance).collect(),
                    similarities: cluster_sims,
                }
            })
            .collect();
        clusters.sort_by_key(|c| c.memory_ids[0]);
        Ok(clusters)
    }

    async fn merge_memory_cluster(
        &self,
        ids: &[Uuid],
        importances: &[f64],
    ) -> StoreResult<MergeOutcome> {
        if ids.is_empty() || ids.len() != importances.len() {
            return Err(StoreError::InvalidInput(
                "merge needs parallel ids and importances".into(),
            ));
        }

        let mut inner = self.inner.write().await;

        // Only active members participate; re-merging an already-collapsed
        // cluster is a no-op on the survivor.
        let members: Vec<(Uuid, f64)> = ids
            .iter()
            .zip(importances)
            .filter(|(id, _)| inner.memories.get(id).is_some_and(|m| !m.invalidated))
            .map(|(&id, &imp)| (id, imp))
            .collect();
        let Some(&(first_id, _)) = members.first() else {
            return Err(StoreError::InvalidInput("no active memories in cluster".into()));
        };

        // Winner: max importance, tie-broken by retrieval count, then age.
        let mut kept_id = first_id;
        let mut best_importance = f64::MIN;
        for &(id, importance) in &members {
            let memory = &inner.memories[&id];
            let current = &inner.memories[&kept_id];
            let better = importance > best_importance
                || (importance == best_importance
                    && (memory.retrieval_count > current.retrieval_count
                        || (memory.retrieval_count == current.retrieval_count
                            && memory.created_at < current.created_at)));
            if better || best_importance == f64::MIN {
                kept_id = id;
                best_importance = importance;
            }
        }

        let total_retrievals: u64 = members
            .iter()
            .map(|(id, _)| inner.memories[id].retrieval_count)
            .sum();
        let max_importance = members
            .iter()
            .map(|(_, imp)| *imp)
            .fold(f64::MIN, f64::max);

        let mut deleted = 0;
        for &(id, _) in &members {
            if id == kept_id {
                continue;
            }
            // Migrate incoming MENTIONS / TAGGED edges onto the survivor.
            if let Some(entity_ids) = inner.mentions.remove(&id) {
                inner.mentions.entry(kept_id).or_default().extend(entity_ids);
            }
            if let Some(tag_ids) = inner.tagged.remove(&id) {
                inner.tagged.entry(kept_id).or_default().extend(tag_ids);
            }
            if let Some(memory) = inner.memories.get_mut(&id) {
                memory.invalidated = true;
                deleted += 1;
            }
        }

        if let Some(kept) = inner.memories.get_mut(&kept_id) {
            kept.retrieval_count = total_retrievals;
            kept.importance = max_importance.clamp(0.1, 1.0);
        }

        debug!(%kept_id, deleted, "memory cluster merged");
        Ok(MergeOutcome { kept_id, deleted_count: deleted })
    }

    async fn find_conflicting_memories(
        &self,
        agent_id: Option<&str>,
    ) -> StoreResult<Vec<ConflictPair>> {
        let inner = self.inner.read().await;
        let memories = inner.active(agent_id);

        let mut pairs = Vec::new();
        'outer: for (i, a) in memories.iter().enumerate() {
            for b in &memories[i + 1..] {
                if a.agent_id != b.agent_id {
                    continue;
                }
                let sim = scorer::cosine_similarity(&a.embedding, &b.embedding);
                if !(CONFLICT_SIM_LOW..CONFLICT_SIM_HIGH).contains(&sim) {
                    continue;
                }
                let shares_entity = match (inner.mentions.get(&a.id), inner.mentions.get(&b.id)) {
                    (Some(ea), Some(eb)) => !ea.is_disjoint(eb),
                    _ => false,
                };
                let both_stances = matches!(
                    a.category,
                    MemoryCategory::Preference | MemoryCategory::Decision
                ) && a.category == b.category;
                if !(shares_entity || both_stances) {
                    continue;
                }
                pairs.push(ConflictPair {
                    memory_a: summarize(a),
                    memory_b: summarize(b),
                });
                if pairs.len() >= MAX_CONFLICT_PAIRS {
                    break 'outer;
                }
            }
        }
        Ok(pairs)
    }

    async fn invalidate_memory(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let memory = inner
            .memories
            .get_mut(&id)
            .ok_or(StoreError::UnknownMemory(id))?;
        memory.invalidated = true;
        Ok(())
    }

    async fn record_access(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let memory = inner
            .memories
            .get_mut(&id)
            .ok_or(StoreError::UnknownMemory(id))?;
        memory.retrieval_count += 1;
        memory.last_accessed_at = Utc::now();
        Ok(())
    }

    async fn calculate_all_effective_scores(
        &self,
        agent_id: Option<&str>,
    ) -> StoreResult<Vec<ScoredMemory>> {
        let now = Utc::now();
        let inner = self.inner.read().await;
        Ok(inner
            .active(agent_id)
            .into_iter()
            .map(|m| ScoredMemory {
                id: m.id,
                text: m.text.clone(),
                category: m.category,
                effective_score: scorer::effective_score(
                    m.importance,
                    m.retrieval_count,
                    m.days_since_access(now),
                ),
                retrieval_count: m.retrieval_count,
                age_days: m.age_days(now),
            })
            .collect())
    }

    async fn promote_to_core(&self, ids: &[Uuid]) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let mut promoted = 0;
        for id in ids {
            if let Some(memory) = inner.memories.get_mut(id) {
                if !memory.invalidated && memory.category != MemoryCategory::Core {
                    memory.category = MemoryCategory::Core;
                    promoted += 1;
                }
            }
        }
        Ok(promoted)
    }

    async fn find_decayed_memories(&self, query: &DecayQuery) -> StoreResult<Vec<Uuid>> {
        let now = Utc::now();
        let inner = self.inner.read().await;
        Ok(inner
            .active(query.agent_id.as_deref())
            .into_iter()
            .filter(|m| {
                scorer::is_decayed(
                    m.importance,
                    m.age_days(now),
                    m.category,
                    m.user_pinned,
                    &query.decay,
                )
            })
            .map(|m| m.id)
            .collect())
    }

    async fn prune_memories(&self, ids: &[Uuid]) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let mut pruned = 0;
        for id in ids {
            let deletable = inner
                .memories
                .get(id)
                .is_some_and(|m| m.category != MemoryCategory::Core && !m.user_pinned);
            if deletable {
                inner.memories.remove(id);
                inner.drop_memory_edges(*id);
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    async fn find_orphan_entities(&self) -> StoreResult<Vec<Uuid>> {
        let inner = self.inner.read().await;
        let mentioned = inner.mentioned_entity_ids();
        let mut orphans: Vec<Uuid> = inner
            .entities
            .keys()
            .filter(|id| !mentioned.contains(id))
            .copied()
            .collect();
        orphans.sort();
        Ok(orphans)
    }

    async fn delete_orphan_entities(&self, ids: &[Uuid]) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let mentioned = inner.mentioned_entity_ids();
        let mut deleted = 0;
        for id in ids {
            if mentioned.contains(id) {
                continue;
            }
            if let Some(entity) = inner.entities.remove(id) {
                inner.entity_by_key.remove(&(entity.name, entity.entity_type));
                inner
                    .entity_rels
                    .retain(|(source, _, target), _| source != id && target != id);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn find_orphan_tags(&self) -> StoreResult<Vec<Uuid>> {
        let inner = self.inner.read().await;
        let in_use = inner.tagged_tag_ids();
        let mut orphans: Vec<Uuid> = inner
            .tags
            .keys()
            .filter(|id| !in_use.contains(id))
            .copied()
            .collect();
        orphans.sort();
        Ok(orphans)
    }

    async fn delete_orphan_tags(&self, ids: &[Uuid]) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let in_use = inner.tagged_tag_ids();
        let mut deleted = 0;
        for id in ids {
            if in_use.contains(id) {
                continue;
            }
            if let Some(tag) = inner.tags.remove(id) {
                inner.tag_by_name.remove(&tag.name);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn list_pending_extractions(
        &self,
        limit: usize,
        agent_id: Option<&str>,
    ) -> StoreResult<Vec<PendingExtraction>> {
        let inner = self.inner.read().await;
        Ok(inner
            .active(agent_id)
            .into_iter()
            .filter(|m| m.extraction_status == ExtractionStatus::Pending)
            .take(limit)
            .map(|m| PendingExtraction {
                id: m.id,
                text: m.text.clone(),
                extraction_retries: m.extraction_retries,
            })
            .collect())
    }

    async fn count_by_extraction_status(
        &self,
        agent_id: Option<&str>,
    ) -> StoreResult<ExtractionStatusCounts> {
        let inner = self.inner.read().await;
        let mut counts = ExtractionStatusCounts::default();
        for memory in inner.active(agent_id) {
            match memory.extraction_status {
                ExtractionStatus::Pending => counts.pending += 1,
                ExtractionStatus::Complete => counts.complete += 1,
                ExtractionStatus::Failed => counts.failed += 1,
                ExtractionStatus::Skipped => counts.skipped += 1,
            }
        }
        Ok(counts)
    }

    async fn list_memories(&self, agent_id: Option<&str>) -> StoreResult<Vec<MemorySummary>> {
        let inner = self.inner.read().await;
        Ok(inner.active(agent_id).into_iter().map(summarize).collect())
    }

    async fn list_core_memories_ranked(
        &self,
        agent_id: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<MemorySummary>> {
        let now = Utc::now();
        let inner = self.inner.read().await;
        let mut core: Vec<&Memory> = inner
            .active(agent_id)
            .into_iter()
            .filter(|m| m.category == MemoryCategory::Core)
            .collect();
        // Core ranking is pure usage; importance does not participate.
        core.sort_by(|a, b| {
            scorer::usage_score(b.retrieval_count, b.days_since_access(now))
                .total_cmp(&scorer::usage_score(a.retrieval_count, a.days_since_access(now)))
        });
        Ok(core.into_iter().take(limit).map(summarize).collect())
    }

    async fn count_memories(&self, agent_id: Option<&str>) -> StoreResult<usize> {
        Ok(self.inner.read().await.active(agent_id).len())
    }
}

fn summarize(memory: &Memory) -> MemorySummary {
    MemorySummary {
        id: memory.id,
        text: memory.text.clone(),
        importance: memory.importance,
        category: memory.category,
        user_pinned: memory.user_pinned,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
