use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing;

/// Built-in half-lives (hours) per knowledge item class. Meeting notes age
/// fast, decision records slowly; anything unknown falls back to
/// `DecayConfig::default_half_life_hours`.
static DEFAULT_HALF_LIVES: Lazy<BTreeMap<String, f64>> = Lazy::new(|| {
    BTreeMap::from([
        ("meeting_note".to_string(), 168.0),
        ("decision_record".to_string(), 720.0),
        ("document_chunk".to_string(), 336.0),
    ])
});

#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub decay: DecayConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub episodes: EpisodeConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub autonomy: AutonomyConfig,
    #[serde(default)]
    pub logbook: LogbookConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl CoreConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("config.toml");
        let mut cfg = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str::<CoreConfig>(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            tracing::info!(
                "No config file found at {}. Using CoreConfig::default().",
                path.display()
            );
            CoreConfig::default()
        };
        cfg.resolve_paths(root);
        Ok(cfg)
    }

    fn resolve_paths(&mut self, root: &Path) {
        self.store.cache_path = absolutize(root, &self.store.cache_path);
        self.logbook.actions = absolutize(root, &self.logbook.actions);
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            decay: DecayConfig::default(),
            retrieval: RetrievalConfig::default(),
            episodes: EpisodeConfig::default(),
            calibration: CalibrationConfig::default(),
            autonomy: AutonomyConfig::default(),
            logbook: LogbookConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "StoreConfig::default_cache_path")]
    pub cache_path: PathBuf,
    /// Conditional-update retries before a mutation surfaces `Conflict`.
    #[serde(default = "StoreConfig::default_write_retries")]
    pub write_retries: u32,
    #[serde(default = "StoreConfig::default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl StoreConfig {
    fn default_cache_path() -> PathBuf {
        PathBuf::from("cache/engine.db")
    }

    fn default_write_retries() -> u32 {
        4
    }

    fn default_backoff_base_ms() -> u64 {
        5
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_path: Self::default_cache_path(),
            write_retries: Self::default_write_retries(),
            backoff_base_ms: Self::default_backoff_base_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecayConfig {
    /// Half-life (hours) per item class; unknown classes use the default.
    #[serde(default = "DecayConfig::default_class_half_lives")]
    pub class_half_life_hours: BTreeMap<String, f64>,
    #[serde(default = "DecayConfig::default_half_life")]
    pub default_half_life_hours: f64,
    /// Items are aged, not erased: scores never drop below this.
    #[serde(default = "DecayConfig::default_floor")]
    pub floor: f64,
    /// Permanent per-access boost, capped so stale-but-popular items still age.
    #[serde(default = "DecayConfig::default_access_boost")]
    pub access_boost: f64,
    #[serde(default = "DecayConfig::default_boost_cap")]
    pub boost_cap: f64,
    /// Age decays on a slower clock than recency: age half-life =
    /// class half-life * age_scale.
    #[serde(default = "DecayConfig::default_age_scale")]
    pub age_scale: f64,
    /// A stored score older than this is recomputed during retrieval.
    #[serde(default = "DecayConfig::default_recompute_interval_minutes")]
    pub recompute_interval_minutes: i64,
}

impl DecayConfig {
    fn default_class_half_lives() -> BTreeMap<String, f64> {
        DEFAULT_HALF_LIVES.clone()
    }

    fn default_half_life() -> f64 {
        336.0
    }

    fn default_floor() -> f64 {
        0.05
    }

    fn default_access_boost() -> f64 {
        0.02
    }

    fn default_boost_cap() -> f64 {
        0.30
    }

    fn default_age_scale() -> f64 {
        6.0
    }

    fn default_recompute_interval_minutes() -> i64 {
        60
    }

    pub fn half_life_for(&self, item_class: &str) -> f64 {
        self.class_half_life_hours
            .get(item_class)
            .copied()
            .unwrap_or(self.default_half_life_hours)
            .max(f64::MIN_POSITIVE)
    }
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            class_half_life_hours: Self::default_class_half_lives(),
            default_half_life_hours: Self::default_half_life(),
            floor: Self::default_floor(),
            access_boost: Self::default_access_boost(),
            boost_cap: Self::default_boost_cap(),
            age_scale: Self::default_age_scale(),
            recompute_interval_minutes: Self::default_recompute_interval_minutes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "RetrievalConfig::default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "RetrievalConfig::default_decay_weight")]
    pub decay_weight: f64,
    #[serde(default = "RetrievalConfig::default_graph_weight")]
    pub graph_weight: f64,
    /// Candidate superset multiplier: topK fetches k * overfetch_factor.
    #[serde(default = "RetrievalConfig::default_overfetch_factor")]
    pub overfetch_factor: usize,
    #[serde(default = "RetrievalConfig::default_min_similarity")]
    pub min_similarity: f32,
    /// Hop budget for seed -> candidate graph scoring.
    #[serde(default = "RetrievalConfig::default_graph_hops")]
    pub graph_hops: u32,
    /// Default deadline when the caller does not supply one.
    #[serde(default = "RetrievalConfig::default_deadline_ms")]
    pub deadline_ms: u64,
}

impl RetrievalConfig {
    fn default_vector_weight() -> f64 {
        0.6
    }

    fn default_decay_weight() -> f64 {
        0.25
    }

    fn default_graph_weight() -> f64 {
        0.15
    }

    fn default_overfetch_factor() -> usize {
        3
    }

    fn default_min_similarity() -> f32 {
        0.25
    }

    fn default_graph_hops() -> u32 {
        2
    }

    fn default_deadline_ms() -> u64 {
        250
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_weight: Self::default_vector_weight(),
            decay_weight: Self::default_decay_weight(),
            graph_weight: Self::default_graph_weight(),
            overfetch_factor: Self::default_overfetch_factor(),
            min_similarity: Self::default_min_similarity(),
            graph_hops: Self::default_graph_hops(),
            deadline_ms: Self::default_deadline_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EpisodeConfig {
    /// Gap beyond which an active episode closes instead of extending.
    #[serde(default = "EpisodeConfig::default_idle_window_minutes")]
    pub idle_window_minutes: i64,
    /// Hop budget for the graph-connectedness cohesion signal.
    #[serde(default = "EpisodeConfig::default_cohesion_hops")]
    pub cohesion_hops: u32,
    #[serde(default = "EpisodeConfig::default_summary_sentences")]
    pub summary_sentences: u32,
    /// Event text shorter than this is kept verbatim as the summary.
    #[serde(default = "EpisodeConfig::default_summary_min_chars")]
    pub summary_min_chars: usize,
    #[serde(default = "EpisodeConfig::default_title_len")]
    pub title_len: usize,
}

impl EpisodeConfig {
    fn default_idle_window_minutes() -> i64 {
        120
    }

    fn default_cohesion_hops() -> u32 {
        2
    }

    fn default_summary_sentences() -> u32 {
        2
    }

    fn default_summary_min_chars() -> usize {
        400
    }

    fn default_title_len() -> usize {
        64
    }
}

impl Default for EpisodeConfig {
    fn default() -> Self {
        Self {
            idle_window_minutes: Self::default_idle_window_minutes(),
            cohesion_hops: Self::default_cohesion_hops(),
            summary_sentences: Self::default_summary_sentences(),
            summary_min_chars: Self::default_summary_min_chars(),
            title_len: Self::default_title_len(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationConfig {
    /// |stated confidence - binary outcome| above this counts an individual
    /// proposal as over- or under-confident.
    #[serde(default = "CalibrationConfig::default_miscalibration_threshold")]
    pub miscalibration_threshold: f64,
    /// Damping applied to the confidence bias correction.
    #[serde(default = "CalibrationConfig::default_adjustment_damping")]
    pub adjustment_damping: f64,
}

impl CalibrationConfig {
    fn default_miscalibration_threshold() -> f64 {
        0.3
    }

    fn default_adjustment_damping() -> f64 {
        0.5
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            miscalibration_threshold: Self::default_miscalibration_threshold(),
            adjustment_damping: Self::default_adjustment_damping(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutonomyConfig {
    /// Promotion requires calibration error strictly below this.
    #[serde(default = "AutonomyConfig::default_promote_error_threshold")]
    pub promote_error_threshold: f64,
    /// Demotion triggers when calibration error exceeds this.
    #[serde(default = "AutonomyConfig::default_demote_error_threshold")]
    pub demote_error_threshold: f64,
    /// Never promote on scant data: executed proposals required first.
    #[serde(default = "AutonomyConfig::default_min_sample")]
    pub min_sample: u32,
    /// Active mistake pattern occurrences that force a demotion.
    #[serde(default = "AutonomyConfig::default_mistake_threshold")]
    pub mistake_threshold: u32,
}

impl AutonomyConfig {
    fn default_promote_error_threshold() -> f64 {
        0.15
    }

    fn default_demote_error_threshold() -> f64 {
        0.4
    }

    fn default_min_sample() -> u32 {
        5
    }

    fn default_mistake_threshold() -> u32 {
        3
    }
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            promote_error_threshold: Self::default_promote_error_threshold(),
            demote_error_threshold: Self::default_demote_error_threshold(),
            min_sample: Self::default_min_sample(),
            mistake_threshold: Self::default_mistake_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogbookConfig {
    #[serde(default = "LogbookConfig::default_actions")]
    pub actions: PathBuf,
}

impl LogbookConfig {
    fn default_actions() -> PathBuf {
        PathBuf::from("logbook/actions.jsonl")
    }
}

impl Default for LogbookConfig {
    fn default() -> Self {
        Self {
            actions: Self::default_actions(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "AuditConfig::default_enabled")]
    pub enabled: bool,
}

impl AuditConfig {
    fn default_enabled() -> bool {
        true
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
        }
    }
}

fn absolutize(root: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        root.join(value)
    }
}
