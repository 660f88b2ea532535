//! Scoring formulas shared by retrieval ranking, Pareto promotion, and decay.
//!
//! Every consumer computes these identically; the store's score queries and
//! the sleep cycle both route through this module.

use std::collections::HashMap;

use uuid::Uuid;

use keepsake_config::DecayConfig;

use crate::schema::MemoryCategory;

/// Half-life of the recency factor, in days.
pub const RECENCY_HALF_LIFE_DAYS: f64 = 14.0;

/// `1 + ln(1 + retrieval_count) × 0.3`
pub fn freq_boost(retrieval_count: u64) -> f64 {
    1.0 + (1.0 + retrieval_count as f64).ln() * 0.3
}

/// `2^(−days_since_access / 14)`
pub fn recency_factor(days_since_access: f64) -> f64 {
    (-days_since_access.max(0.0) / RECENCY_HALF_LIFE_DAYS).exp2()
}

/// The universal ranking scalar: `importance × freq_boost × recency`.
pub fn effective_score(importance: f64, retrieval_count: u64, days_since_access: f64) -> f64 {
    importance * freq_boost(retrieval_count) * recency_factor(days_since_access)
}

/// Core-memory retrieval ranking: pure usage, importance excluded.
pub fn usage_score(retrieval_count: u64, days_since_access: f64) -> f64 {
    freq_boost(retrieval_count) * recency_factor(days_since_access)
}

/// Per-memory decay half-life in days.
///
/// `H = base × (1 + (importance − 0.5) × multiplier)`, unless the memory's
/// category carries an explicit curve override.
pub fn decay_half_life(importance: f64, category: MemoryCategory, decay: &DecayConfig) -> f64 {
    if let Some(curve) = decay.decay_curves.get(category.slug()) {
        return curve.half_life_days;
    }
    decay.base_half_life_days * (1.0 + (importance - 0.5) * decay.importance_multiplier)
}

/// Whether a memory has decayed below the retention threshold.
///
/// `core` memories and user-pinned memories never decay.
pub fn is_decayed(
    importance: f64,
    age_days: f64,
    category: MemoryCategory,
    user_pinned: bool,
    decay: &DecayConfig,
) -> bool {
    if category == MemoryCategory::Core || user_pinned {
        return false;
    }
    let half_life = decay_half_life(importance, category, decay);
    if half_life <= 0.0 {
        return true;
    }
    importance * (-age_days / half_life).exp2() < decay.retention_threshold
}

/// The value such that `pct` of the scores lie below it (pct = 0.8 keeps the
/// top 20% at or above the threshold). Exact to within one element.
pub fn pareto_threshold(scores: &[f64], pct: f64) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((pct.clamp(0.0, 1.0) * sorted.len() as f64).floor() as usize).min(sorted.len() - 1);
    sorted[idx]
}

/// Cosine similarity between two embeddings. Mismatched or empty vectors
/// score zero rather than erroring; the store enforces dimensions at insert.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let mag_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}

/// Canonical unordered pair key for similarity maps.
pub fn pair_key(a: Uuid, b: Uuid) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

/// Pre-computed similarity lookup keyed by [`pair_key`].
pub type SimilarityMap = HashMap<String, f64>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freq_boost_grows_logarithmically() {
        assert_eq!(freq_boost(0), 1.0);
        let ten = freq_boost(10);
        let hundred = freq_boost(100);
        assert!(ten > 1.0 && hundred > ten);
        // 10× more retrievals is nowhere near 10× the boost.
        assert!(hundred / ten < 2.0);
    }

    #[test]
    fn recency_halves_every_fourteen_days() {
        assert!((recency_factor(0.0) - 1.0).abs() < 1e-9);
        assert!((recency_factor(14.0) - 0.5).abs() < 1e-9);
        assert!((recency_factor(28.0) - 0.25).abs() < 1e-9);
        // Clock skew cannot produce scores above 1.0.
        assert!((recency_factor(-5.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn effective_score_composes_the_three_factors() {
        let score = effective_score(0.8, 0, 0.0);
        assert!((score - 0.8).abs() < 1e-9);
        assert!(effective_score(0.8, 5, 0.0) > score);
        assert!(effective_score(0.8, 0, 14.0) < score);
    }

    #[test]
    fn usage_score_ignores_importance() {
        assert_eq!(usage_score(3, 7.0), freq_boost(3) * recency_factor(7.0));
    }

    #[test]
    fn decay_half_life_scales_with_importance() {
        let decay = DecayConfig::default();
        let low = decay_half_life(0.1, MemoryCategory::Fact, &decay);
        let neutral = decay_half_life(0.5, MemoryCategory::Fact, &decay);
        let high = decay_half_life(1.0, MemoryCategory::Fact, &decay);
        assert!((neutral - decay.base_half_life_days).abs() < 1e-9);
        assert!(low < neutral && neutral < high);
    }

    #[test]
    fn decay_curve_override_wins() {
        let mut decay = DecayConfig::default();
        decay.decay_curves.insert(
            "preference".to_string(),
            keepsake_config::DecayCurve { half_life_days: 90.0 },
        );
        assert_eq!(decay_half_life(0.2, MemoryCategory::Preference, &decay), 90.0);
        // Other categories still use the importance formula.
        assert_ne!(decay_half_life(0.2, MemoryCategory::Fact, &decay), 90.0);
    }

    #[test]
    fn core_and_pinned_memories_never_decay() {
        let decay = DecayConfig::default();
        assert!(!is_decayed(0.1, 10_000.0, MemoryCategory::Core, false, &decay));
        assert!(!is_decayed(0.1, 10_000.0, MemoryCategory::Fact, true, &decay));
        assert!(is_decayed(0.1, 10_000.0, MemoryCategory::Fact, false, &decay));
    }

    #[test]
    fn fresh_important_memories_survive() {
        let decay = DecayConfig::default();
        assert!(!is_decayed(0.9, 1.0, MemoryCategory::Fact, false, &decay));
    }

    #[test]
    fn pareto_threshold_splits_within_one_element() {
        let scores: Vec<f64> = (1..=10).map(|i| i as f64).collect();
        let threshold = pareto_threshold(&scores, 0.8);
        let below = scores.iter().filter(|s| **s < threshold).count();
        // pct of the population lies below, within one element.
        assert!((below as f64 / scores.len() as f64 - 0.8).abs() <= 1.0 / scores.len() as f64);
        assert_eq!(pareto_threshold(&[], 0.8), 0.0);
        assert_eq!(pareto_threshold(&[3.0], 0.8), 3.0);
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn pair_key_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(pair_key(a, b), pair_key(b, a));
    }
}
