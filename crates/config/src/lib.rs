use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Optional agent id used to scope memories in a shared store.
    pub agent_id: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { agent_id: None }
    }
}

/// Settings for every LLM-judged operation (extraction, importance, dedup,
/// conflict resolution).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub enabled: bool,
    /// OpenAI-compatible chat-completions endpoint.
    pub endpoint: String,
    pub model: String,
    /// API key value. Overridden at runtime by the `KEEPSAKE_API_KEY`
    /// environment variable when set.
    pub api_key: Option<String>,
    /// Retries *inside* the client on transient errors (2 = 3 attempts total).
    pub max_retries: u32,
    pub timeout_ms: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://localhost:11434/v1/chat/completions".to_string(),
            model: "llama3.1:8b".to_string(),
            api_key: None,
            max_retries: 2,
            timeout_ms: 60_000,
        }
    }
}

/// Per-category decay curve override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayCurve {
    pub half_life_days: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayConfig {
    /// A memory is pruned when `importance × 2^(−age/H)` falls below this.
    pub retention_threshold: f64,
    pub base_half_life_days: f64,
    /// Scales the half-life by importance: `H = base × (1 + (imp−0.5) × mult)`.
    pub importance_multiplier: f64,
    /// Optional per-category half-life overrides, keyed by category slug.
    pub decay_curves: HashMap<String, DecayCurve>,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            retention_threshold: 0.05,
            base_half_life_days: 30.0,
            importance_multiplier: 2.0,
            decay_curves: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SleepConfig {
    /// Cosine threshold for cluster candidacy (Phase 1 query).
    pub cluster_threshold: f64,
    /// Pairs at or above this similarity merge without an LLM call.
    pub dedup_threshold: f64,
    /// Hard cap on LLM-judged dedup pairs per cycle.
    pub max_semantic_dedup_pairs: usize,
    /// Concurrent outstanding LLM calls per batch.
    pub llm_concurrency: usize,
    pub skip_semantic_dedup: bool,
    /// Core promotion is opt-in; the tier is user-curated by default.
    pub skip_promotion: bool,
    /// Fraction of scores below the promotion threshold (0.8 = top 20%).
    pub pareto_percentile: f64,
    pub promotion_min_age_days: f64,
    /// Page size for the Phase 4 extraction catch-up.
    pub extraction_batch_size: usize,
    /// Abort-aware pause between extraction pages.
    pub extraction_delay_ms: u64,
    pub decay: DecayConfig,
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self {
            cluster_threshold: 0.75,
            dedup_threshold: 0.95,
            max_semantic_dedup_pairs: 500,
            llm_concurrency: 8,
            skip_semantic_dedup: false,
            skip_promotion: true,
            pareto_percentile: 0.8,
            promotion_min_age_days: 7.0,
            extraction_batch_size: 50,
            extraction_delay_ms: 1000,
            decay: DecayConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Minimum hours between scheduled consolidation runs.
    pub interval_hours: u64,
    pub quiet_start_hour: u32,
    pub quiet_end_hour: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_hours: 22,
            quiet_start_hour: 2,
            quiet_end_hour: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub extraction: ExtractionConfig,
    pub sleep: SleepConfig,
    pub scheduler: SchedulerConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("KEEPSAKE_API_KEY") {
            if !value.is_empty() {
                config.extraction.api_key = Some(value);
            }
        }
        if let Ok(value) = env::var("KEEPSAKE_LLM_ENDPOINT") {
            if !value.is_empty() {
                config.extraction.endpoint = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}
