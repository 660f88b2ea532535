//! The graph-store contract the engine consumes.
//!
//! The persistent substrate is a Cypher-capable transactional driver; that
//! driver is an external collaborator, so the engine is written against
//! [`GraphStore`] and ships with the in-memory [`crate::graph::MemoryGraph`]
//! reference implementation. A driver-backed implementation must honour the
//! same contract, in particular the scoring formulas in [`crate::scorer`] and
//! the monotonic `extraction_status` transition rule.

use async_trait::async_trait;
use uuid::Uuid;

use keepsake_config::DecayConfig;

use crate::extractor::{ExtractedEntity, ExtractedRelationship, ExtractedTag};
use crate::schema::{ExtractionStatus, Memory, MemoryCategory};
use crate::scorer::SimilarityMap;

/// Store failures, split the same way LLM failures are: transient errors are
/// worth a retry inside background extraction, permanent ones are not.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out")]
    Timeout,
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unknown memory {0}")]
    UnknownMemory(Uuid),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Insert-time knobs; everything else starts at its documented default.
#[derive(Debug, Clone)]
pub struct InsertOptions {
    pub category: MemoryCategory,
    /// Clamped into `[0.1, 1.0]` at insert.
    pub importance: f64,
    pub agent_id: Option<String>,
    pub user_pinned: bool,
}

impl Default for InsertOptions {
    fn default() -> Self {
        Self {
            category: MemoryCategory::Other,
            importance: 0.5,
            agent_id: None,
            user_pinned: false,
        }
    }
}

/// A connected component of the cosine-similarity pair graph.
#[derive(Debug, Clone)]
pub struct DuplicateCluster {
    pub memory_ids: Vec<Uuid>,
    pub texts: Vec<String>,
    pub importances: Vec<f64>,
    /// Pairwise cosine similarities keyed by [`crate::scorer::pair_key`];
    /// present only when requested with `with_scores`.
    pub similarities: Option<SimilarityMap>,
}

#[derive(Debug, Clone, Copy)]
pub struct MergeOutcome {
    pub kept_id: Uuid,
    pub deleted_count: usize,
}

/// Lightweight projection used by conflict detection and the noise purge.
#[derive(Debug, Clone)]
pub struct MemorySummary {
    pub id: Uuid,
    pub text: String,
    pub importance: f64,
    pub category: MemoryCategory,
    pub user_pinned: bool,
}

#[derive(Debug, Clone)]
pub struct ConflictPair {
    pub memory_a: MemorySummary,
    pub memory_b: MemorySummary,
}

/// One row of the effective-score snapshot taken in Phase 2.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub id: Uuid,
    pub text: String,
    pub category: MemoryCategory,
    pub effective_score: f64,
    pub retrieval_count: u64,
    pub age_days: f64,
}

#[derive(Debug, Clone)]
pub struct PendingExtraction {
    pub id: Uuid,
    pub text: String,
    pub extraction_retries: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionStatusCounts {
    pub pending: usize,
    pub complete: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Parameters of the Phase 5 decay query.
#[derive(Debug, Clone)]
pub struct DecayQuery {
    pub decay: DecayConfig,
    pub agent_id: Option<String>,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Insert a memory with `extraction_status = pending`. Re-inserting text
    /// whose hash matches an active memory of the same agent returns the
    /// existing id instead of creating a twin.
    async fn insert_memory(
        &self,
        text: &str,
        embedding: Vec<f32>,
        opts: InsertOptions,
    ) -> StoreResult<Uuid>;

    async fn get_memory(&self, id: Uuid) -> StoreResult<Option<Memory>>;

    /// Monotonic status update. A terminal status silently wins over any
    /// later contradictory write; `increment_retries` bumps the retry
    /// counter regardless.
    async fn update_extraction_status(
        &self,
        id: Uuid,
        status: ExtractionStatus,
        increment_retries: bool,
    ) -> StoreResult<()>;

    /// Atomically: MERGE entities by `(name, type)`, create `MENTIONS` edges,
    /// MERGE inter-entity relationships with confidence, MERGE tags, create
    /// `TAGGED` edges, set the memory category (unless the memory is `core`),
    /// and mark extraction `complete`.
    async fn batch_entity_operations(
        &self,
        memory_id: Uuid,
        entities: &[ExtractedEntity],
        relationships: &[ExtractedRelationship],
        tags: &[ExtractedTag],
        category: Option<MemoryCategory>,
    ) -> StoreResult<()>;

    /// Connected components of the pair graph where an edge exists iff
    /// cosine ≥ `threshold`, both memories are active, and agent ids match.
    /// Singleton components are omitted.
    async fn find_duplicate_clusters(
        &self,
        threshold: f64,
        agent_id: Option<&str>,
        with_scores: bool,
    ) -> StoreResult<Vec<DuplicateCluster>>;

    /// Keep the max-importance member (ties: retrieval count, then age),
    /// migrate `MENTIONS`/`TAGGED` edges onto it, sum retrieval counts, take
    /// the max importance, and invalidate the rest. Idempotent on a
    /// singleton survivor.
    async fn merge_memory_cluster(
        &self,
        ids: &[Uuid],
        importances: &[f64],
    ) -> StoreResult<MergeOutcome>;

    /// Candidate pairs for LLM conflict adjudication, pre-filtered by an
    /// embedding similarity band and shared entity mentions.
    async fn find_conflicting_memories(
        &self,
        agent_id: Option<&str>,
    ) -> StoreResult<Vec<ConflictPair>>;

    async fn invalidate_memory(&self, id: Uuid) -> StoreResult<()>;

    /// Bump `retrieval_count` and `last_accessed_at` after a retrieval hit.
    async fn record_access(&self, id: Uuid) -> StoreResult<()>;

    async fn calculate_all_effective_scores(
        &self,
        agent_id: Option<&str>,
    ) -> StoreResult<Vec<ScoredMemory>>;

    /// Set `category = core`. Returns how many memories changed.
    async fn promote_to_core(&self, ids: &[Uuid]) -> StoreResult<usize>;

    async fn find_decayed_memories(&self, query: &DecayQuery) -> StoreResult<Vec<Uuid>>;

    /// Hard delete. `core` and user-pinned memories are skipped no matter
    /// what the caller asks for. Returns how many were deleted.
    async fn prune_memories(&self, ids: &[Uuid]) -> StoreResult<usize>;

    /// Entities with no remaining incoming `MENTIONS` edges.
    async fn find_orphan_entities(&self) -> StoreResult<Vec<Uuid>>;

    async fn delete_orphan_entities(&self, ids: &[Uuid]) -> StoreResult<usize>;

    /// Tags with no remaining incoming `TAGGED` edges.
    async fn find_orphan_tags(&self) -> StoreResult<Vec<Uuid>>;

    async fn delete_orphan_tags(&self, ids: &[Uuid]) -> StoreResult<usize>;

    async fn list_pending_extractions(
        &self,
        limit: usize,
        agent_id: Option<&str>,
    ) -> StoreResult<Vec<PendingExtraction>>;

    async fn count_by_extraction_status(
        &self,
        agent_id: Option<&str>,
    ) -> StoreResult<ExtractionStatusCounts>;

    /// All active memories, projected for text-level scans.
    async fn list_memories(&self, agent_id: Option<&str>) -> StoreResult<Vec<MemorySummary>>;

    /// Core memories ranked by pure usage (`freq_boost × recency`), best
    /// first.
    async fn list_core_memories_ranked(
        &self,
        agent_id: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<MemorySummary>>;

    async fn count_memories(&self, agent_id: Option<&str>) -> StoreResult<usize>;
}

/// `MENTIONS` / `TAGGED` edge sets for one memory, used when inspecting the
/// merge migration.
#[derive(Debug, Clone, Default)]
pub struct EdgeSnapshot {
    pub mentions: Vec<Uuid>,
    pub tagged: Vec<Uuid>,
}
