//! Memory consolidation engine: attention gate, LLM enrichment pipeline,
//! graph-store contract, and the seven-phase sleep cycle.

pub mod engine;
pub mod extraction;
pub mod extractor;
pub mod gate;
pub mod graph;
pub mod scheduler;
pub mod schema;
pub mod scorer;
pub mod sleep;
pub mod store;

pub use engine::{EmbedFn, EngineStats, MemoryEngine, SpeakerRole};
pub use extraction::{ExtractionOutcome, MAX_EXTRACTION_RETRIES, run_background_extraction};
pub use extractor::{ConflictVerdict, ExtractionResult, Extractor, SEMANTIC_SIM_FAST_PATH};
pub use gate::{GateRejection, passes_assistant_gate, passes_user_gate};
pub use graph::MemoryGraph;
pub use scheduler::spawn_consolidation_task;
pub use schema::{
    Entity, EntityType, ExtractionStatus, Memory, MemoryCategory, RelationType, Tag, truncate_str,
};
pub use sleep::{
    SleepCycleOptions, SleepCycleResult, SleepPhase, SleepProgress, run_sleep_cycle,
};
pub use store::{GraphStore, InsertOptions, StoreError};
