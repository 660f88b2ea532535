//! Deterministic fallback embedder.
//!
//! The production embedding provider is an external service wired in at
//! deployment time; this hashed bag-of-words projection keeps the CLI fully
//! offline-capable. Vectors are unit-norm so the engine's cosine math works
//! identically to real embeddings; the similarities are just cruder.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use keepsake_memory::EmbedFn;

const DIMENSION: usize = 128;

fn embed(text: &str) -> Option<Vec<f32>> {
    let mut vector = vec![0.0f32; DIMENSION];
    let mut any = false;
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
    {
        let digest = Sha256::digest(token.to_lowercase().as_bytes());
        let bucket = usize::from(digest[0]) << 8 | usize::from(digest[1]);
        vector[bucket % DIMENSION] += 1.0;
        any = true;
    }
    if !any {
        return None;
    }
    let mag: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    for value in &mut vector {
        *value /= mag;
    }
    Some(vector)
}

pub fn hashed_embedder() -> EmbedFn {
    Arc::new(|text: String| -> Pin<Box<dyn Future<Output = Option<Vec<f32>>> + Send>> {
        Box::pin(async move { embed(&text) })
    })
}
