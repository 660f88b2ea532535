//! Per-memory fire-and-forget enrichment.
//!
//! The ingest path spawns [`run_background_extraction`] right after a memory
//! lands; the sleep cycle's Phase 4 drives the same function over the pending
//! backlog. Either way the function never panics and never propagates:
//! every outcome ends in a status write and a log line.

use tracing::{debug, warn};
use uuid::Uuid;

use keepsake_llm::AbortSignal;

use crate::extractor::Extractor;
use crate::schema::ExtractionStatus;
use crate::store::GraphStore;

/// Transient-failure budget per memory. Combined with the LLM client's
/// internal retries this allows up to nine attempts total, which is
/// intentional: transient LLM errors cluster temporally, and spreading the
/// outer retries across sleep cycles rides out whole outages.
pub const MAX_EXTRACTION_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct ExtractionOutcome {
    pub success: bool,
    pub memory_id: Uuid,
}

/// Enrich one memory: extract entities, write them in a single transaction,
/// and advance the extraction status. Transient failures leave the memory
/// `pending` with its retry counter bumped until the budget runs out.
pub async fn run_background_extraction(
    store: &dyn GraphStore,
    extractor: &Extractor,
    memory_id: Uuid,
    text: &str,
    current_retries: u32,
    abort: &AbortSignal,
) -> ExtractionOutcome {
    let failure = ExtractionOutcome { success: false, memory_id };
    let success = ExtractionOutcome { success: true, memory_id };

    if !extractor.enabled() {
        set_status(store, memory_id, ExtractionStatus::Skipped, false).await;
        return success;
    }

    let (result, transient) = extractor.extract_entities(text, abort).await;

    let Some(result) = result else {
        if transient {
            let attempted = current_retries + 1;
            if attempted >= MAX_EXTRACTION_RETRIES {
                warn!(%memory_id, attempted, "extraction retry budget exhausted");
                set_status(store, memory_id, ExtractionStatus::Failed, true).await;
            } else {
                debug!(%memory_id, attempted, "transient extraction failure, will retry");
                set_status(store, memory_id, ExtractionStatus::Pending, true).await;
            }
        } else {
            set_status(store, memory_id, ExtractionStatus::Failed, false).await;
        }
        return failure;
    };

    if result.is_empty() {
        // Valid reply, nothing to link: done without graph writes.
        set_status(store, memory_id, ExtractionStatus::Complete, false).await;
        return success;
    }

    match store
        .batch_entity_operations(
            memory_id,
            &result.entities,
            &result.relationships,
            &result.tags,
            result.category,
        )
        .await
    {
        Ok(()) => {
            debug!(
                %memory_id,
                entities = result.entities.len(),
                tags = result.tags.len(),
                "background extraction complete"
            );
            success
        }
        Err(err) if err.is_transient() && current_retries + 1 < MAX_EXTRACTION_RETRIES => {
            warn!(%memory_id, %err, "transient graph failure during extraction, will retry");
            set_status(store, memory_id, ExtractionStatus::Pending, true).await;
            failure
        }
        Err(err) => {
            warn!(%memory_id, %err, "graph failure during extraction");
            set_status(store, memory_id, ExtractionStatus::Failed, true).await;
            failure
        }
    }
}

async fn set_status(
    store: &dyn GraphStore,
    memory_id: Uuid,
    status: ExtractionStatus,
    increment_retries: bool,
) {
    if let Err(err) = store
        .update_extraction_status(memory_id, status, increment_retries)
        .await
    {
        warn!(%memory_id, ?status, %err, "failed to record extraction status");
    }
}
