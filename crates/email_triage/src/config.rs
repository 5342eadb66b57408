//! Triage engine configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file is a valid
//! configuration. Invariants are checked on every load by [`TriageConfig::validate`];
//! a configuration that fails validation is rejected outright.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::info;

use crate::error::{Result, TriageError};
use crate::trust::TrustStage;
use crate::types::EnsembleWeights;

/// Tolerance used when checking that ensemble weights sum to one.
pub const WEIGHT_EPSILON: f64 = 1e-6;

/// Global configuration instance for the application shell
static CONFIG: OnceCell<RwLock<TriageConfig>> = OnceCell::new();

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriageConfig {
    #[serde(default)]
    pub sender_model: SenderModelConfig,
    #[serde(default)]
    pub tier1: Tier1Config,
    #[serde(default)]
    pub ensemble: EnsembleConfig,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub undo: UndoConfig,
    #[serde(default)]
    pub semantic: SemanticConfig,
}

/// Sender behavior model settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderModelConfig {
    /// Observations required before statistics are trusted (and before a
    /// sender can be auto-flagged VIP)
    #[serde(default = "default_min_emails")]
    pub min_emails_for_confidence: u64,

    /// Half-life used in `exp(-Δt / half_life)`
    #[serde(default = "default_half_life_days")]
    pub decay_half_life_days: f64,

    /// Importance score above which a sender becomes VIP
    #[serde(default = "default_vip_threshold")]
    pub vip_importance_threshold: f64,
}

/// Tier-1 statistical predictor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tier1Config {
    /// Confidence given to the `keep` fallback for unknown senders
    #[serde(default = "default_keep_confidence")]
    pub default_keep_confidence: f64,

    /// Predictions at or below this confidence are considered uninformed
    #[serde(default = "default_low_confidence_floor")]
    pub low_confidence_floor: f64,

    /// Observation count at which the volume ceiling reaches ~63% of its range
    #[serde(default = "default_volume_scale")]
    pub volume_scale: f64,
}

/// Ensemble predictor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    #[serde(default)]
    pub default_weights: EnsembleWeights,

    /// Tier-3 is only consulted when Tier-1 confidence is below this
    #[serde(default = "default_llm_fallback_threshold")]
    pub llm_fallback_threshold: f64,

    /// Maximum outstanding semantic classifier calls during batch prediction
    #[serde(default = "default_max_concurrent_llm")]
    pub max_concurrent_llm: usize,

    /// Per-call timeout for the semantic classifier
    #[serde(default = "default_llm_timeout_ms")]
    pub llm_timeout_ms: u64,

    /// Maximum number of cached predictions
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

/// Trust profile / autonomy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    #[serde(default = "default_training_wheels_threshold")]
    pub training_wheels_threshold: f64,
    #[serde(default = "default_building_confidence_threshold")]
    pub building_confidence_threshold: f64,
    #[serde(default = "default_earned_autonomy_threshold")]
    pub earned_autonomy_threshold: f64,

    #[serde(default)]
    pub training_wheels_batch_cap: usize,
    #[serde(default = "default_building_confidence_cap")]
    pub building_confidence_batch_cap: usize,
    #[serde(default = "default_earned_autonomy_cap")]
    pub earned_autonomy_batch_cap: usize,

    /// Number of most recent dispositions considered for stage changes
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    #[serde(default = "default_promote_building_interactions")]
    pub promote_building_min_interactions: u64,
    #[serde(default = "default_promote_building_accuracy")]
    pub promote_building_min_accuracy: f64,
    #[serde(default = "default_promote_earned_interactions")]
    pub promote_earned_min_interactions: u64,
    #[serde(default = "default_promote_earned_accuracy")]
    pub promote_earned_min_accuracy: f64,

    /// Window entries required before a demotion can happen
    #[serde(default = "default_demotion_min_window")]
    pub demotion_min_window: usize,
    #[serde(default = "default_demote_building_below")]
    pub demote_building_below: f64,
    #[serde(default = "default_demote_earned_below")]
    pub demote_earned_below: f64,
}

/// Action queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Soft capacity. Pending items are never evicted, so the queue may
    /// exceed this while many items await review.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Resolved items kept in the persisted snapshot
    #[serde(default = "default_persisted_resolved")]
    pub persisted_resolved_limit: usize,
}

/// Undo stack settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_undo_capacity")]
    pub capacity: usize,
}

/// Ollama semantic classifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_ollama_model")]
    pub model: String,
    /// Sent as `Authorization: Bearer <key>` when set
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_min_emails() -> u64 {
    5
}
fn default_half_life_days() -> f64 {
    30.0
}
fn default_vip_threshold() -> f64 {
    0.8
}
fn default_keep_confidence() -> f64 {
    0.3
}
fn default_low_confidence_floor() -> f64 {
    0.35
}
fn default_volume_scale() -> f64 {
    20.0
}
fn default_llm_fallback_threshold() -> f64 {
    0.6
}
fn default_max_concurrent_llm() -> usize {
    3
}
fn default_llm_timeout_ms() -> u64 {
    20_000
}
fn default_cache_capacity() -> usize {
    1000
}
fn default_training_wheels_threshold() -> f64 {
    0.95
}
fn default_building_confidence_threshold() -> f64 {
    0.85
}
fn default_earned_autonomy_threshold() -> f64 {
    0.75
}
fn default_building_confidence_cap() -> usize {
    10
}
fn default_earned_autonomy_cap() -> usize {
    50
}
fn default_window_size() -> usize {
    50
}
fn default_promote_building_interactions() -> u64 {
    20
}
fn default_promote_building_accuracy() -> f64 {
    0.8
}
fn default_promote_earned_interactions() -> u64 {
    100
}
fn default_promote_earned_accuracy() -> f64 {
    0.9
}
fn default_demotion_min_window() -> usize {
    20
}
fn default_demote_building_below() -> f64 {
    0.6
}
fn default_demote_earned_below() -> f64 {
    0.75
}
fn default_queue_capacity() -> usize {
    500
}
fn default_persisted_resolved() -> usize {
    100
}
fn default_retention_days() -> i64 {
    30
}
fn default_undo_capacity() -> usize {
    200
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_ollama_model() -> String {
    "ministral-3:3b".to_string()
}

impl Default for SenderModelConfig {
    fn default() -> Self {
        Self {
            min_emails_for_confidence: default_min_emails(),
            decay_half_life_days: default_half_life_days(),
            vip_importance_threshold: default_vip_threshold(),
        }
    }
}

impl Default for Tier1Config {
    fn default() -> Self {
        Self {
            default_keep_confidence: default_keep_confidence(),
            low_confidence_floor: default_low_confidence_floor(),
            volume_scale: default_volume_scale(),
        }
    }
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            default_weights: EnsembleWeights::default(),
            llm_fallback_threshold: default_llm_fallback_threshold(),
            max_concurrent_llm: default_max_concurrent_llm(),
            llm_timeout_ms: default_llm_timeout_ms(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            training_wheels_threshold: default_training_wheels_threshold(),
            building_confidence_threshold: default_building_confidence_threshold(),
            earned_autonomy_threshold: default_earned_autonomy_threshold(),
            training_wheels_batch_cap: 0,
            building_confidence_batch_cap: default_building_confidence_cap(),
            earned_autonomy_batch_cap: default_earned_autonomy_cap(),
            window_size: default_window_size(),
            promote_building_min_interactions: default_promote_building_interactions(),
            promote_building_min_accuracy: default_promote_building_accuracy(),
            promote_earned_min_interactions: default_promote_earned_interactions(),
            promote_earned_min_accuracy: default_promote_earned_accuracy(),
            demotion_min_window: default_demotion_min_window(),
            demote_building_below: default_demote_building_below(),
            demote_earned_below: default_demote_earned_below(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            persisted_resolved_limit: default_persisted_resolved(),
        }
    }
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            capacity: default_undo_capacity(),
        }
    }
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_ollama_url(),
            model: default_ollama_model(),
            api_key: None,
        }
    }
}

impl TrustConfig {
    /// Auto-approve threshold for a stage. This is the only place the
    /// threshold is derived.
    pub fn threshold_for(&self, stage: TrustStage) -> f64 {
        match stage {
            TrustStage::TrainingWheels => self.training_wheels_threshold,
            TrustStage::BuildingConfidence => self.building_confidence_threshold,
            TrustStage::EarnedAutonomy => self.earned_autonomy_threshold,
        }
    }

    /// Maximum number of auto-executed actions per processed batch
    pub fn batch_cap_for(&self, stage: TrustStage) -> usize {
        match stage {
            TrustStage::TrainingWheels => self.training_wheels_batch_cap,
            TrustStage::BuildingConfidence => self.building_confidence_batch_cap,
            TrustStage::EarnedAutonomy => self.earned_autonomy_batch_cap,
        }
    }
}

fn check_unit_interval(name: &str, value: f64) -> Result<()> {
    if !(value > 0.0 && value <= 1.0) {
        return Err(TriageError::Config(format!(
            "{} must be within (0, 1], got {}",
            name, value
        )));
    }
    Ok(())
}

impl TriageConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TriageConfig = toml::from_str(content)
            .map_err(|e| TriageError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_path(path: &Path) -> Result<Self> {
        info!("Loading triage configuration from: {:?}", path);
        let content = fs::read_to_string(path)
            .map_err(|e| TriageError::Config(format!("Failed to read config: {}", e)))?;
        Self::from_toml_str(&content)
    }

    /// Check every configuration invariant.
    pub fn validate(&self) -> Result<()> {
        self.ensemble.default_weights.validate()?;

        check_unit_interval(
            "ensemble.llm_fallback_threshold",
            self.ensemble.llm_fallback_threshold,
        )?;
        if self.ensemble.max_concurrent_llm == 0 {
            return Err(TriageError::Config(
                "ensemble.max_concurrent_llm must be at least 1".into(),
            ));
        }
        if self.ensemble.llm_timeout_ms == 0 {
            return Err(TriageError::Config(
                "ensemble.llm_timeout_ms must be positive".into(),
            ));
        }
        if self.ensemble.cache_capacity == 0 {
            return Err(TriageError::Config(
                "ensemble.cache_capacity must be at least 1".into(),
            ));
        }

        check_unit_interval(
            "sender_model.vip_importance_threshold",
            self.sender_model.vip_importance_threshold,
        )?;
        if self.sender_model.decay_half_life_days <= 0.0 {
            return Err(TriageError::Config(
                "sender_model.decay_half_life_days must be positive".into(),
            ));
        }

        check_unit_interval(
            "tier1.default_keep_confidence",
            self.tier1.default_keep_confidence,
        )?;
        check_unit_interval("tier1.low_confidence_floor", self.tier1.low_confidence_floor)?;
        if self.tier1.volume_scale <= 0.0 {
            return Err(TriageError::Config(
                "tier1.volume_scale must be positive".into(),
            ));
        }

        let trust = &self.trust;
        check_unit_interval("trust.training_wheels_threshold", trust.training_wheels_threshold)?;
        check_unit_interval(
            "trust.building_confidence_threshold",
            trust.building_confidence_threshold,
        )?;
        check_unit_interval("trust.earned_autonomy_threshold", trust.earned_autonomy_threshold)?;
        if !(trust.training_wheels_threshold > trust.building_confidence_threshold
            && trust.building_confidence_threshold > trust.earned_autonomy_threshold)
        {
            return Err(TriageError::Config(
                "trust thresholds must strictly decrease from training_wheels to earned_autonomy"
                    .into(),
            ));
        }
        check_unit_interval(
            "trust.promote_building_min_accuracy",
            trust.promote_building_min_accuracy,
        )?;
        check_unit_interval(
            "trust.promote_earned_min_accuracy",
            trust.promote_earned_min_accuracy,
        )?;
        check_unit_interval("trust.demote_building_below", trust.demote_building_below)?;
        check_unit_interval("trust.demote_earned_below", trust.demote_earned_below)?;
        if trust.window_size == 0 || trust.demotion_min_window > trust.window_size {
            return Err(TriageError::Config(
                "trust.window_size must be positive and at least trust.demotion_min_window"
                    .into(),
            ));
        }

        if self.queue.capacity == 0 {
            return Err(TriageError::Config("queue.capacity must be at least 1".into()));
        }
        if self.undo.capacity == 0 || self.undo.retention_days <= 0 {
            return Err(TriageError::Config(
                "undo.capacity and undo.retention_days must be positive".into(),
            ));
        }

        Ok(())
    }
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("eddie.chat").join("triage.toml"));
    }

    if let Some(home_dir) = dirs::home_dir() {
        paths.push(
            home_dir
                .join(".config")
                .join("eddie.chat")
                .join("triage.toml"),
        );
    }

    paths
}

/// Initialize the global configuration from the default paths
pub fn init_config() -> Result<()> {
    for path in default_config_paths() {
        if path.exists() {
            info!("Found triage config at: {:?}", path);
            return init_config_from_path(&path);
        }
    }

    info!("No triage config file found, using defaults");
    set_config(TriageConfig::default())
}

/// Initialize the global configuration from a specific path
pub fn init_config_from_path(path: &Path) -> Result<()> {
    set_config(TriageConfig::from_path(path)?)
}

fn set_config(config: TriageConfig) -> Result<()> {
    match CONFIG.get() {
        Some(lock) => {
            let mut guard = lock
                .write()
                .map_err(|e| TriageError::Config(format!("Failed to lock config: {}", e)))?;
            *guard = config;
        }
        None => {
            CONFIG.set(RwLock::new(config)).ok();
        }
    }
    Ok(())
}

/// Snapshot of the global configuration
pub fn get_config() -> Result<TriageConfig> {
    let lock = CONFIG
        .get()
        .ok_or_else(|| TriageError::Config("Configuration not initialized".into()))?;
    let guard = lock
        .read()
        .map_err(|e| TriageError::Config(format!("Failed to lock config: {}", e)))?;
    Ok(guard.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        TriageConfig::default().validate().unwrap();
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = TriageConfig::from_toml_str("").unwrap();
        assert_eq!(config.sender_model.min_emails_for_confidence, 5);
        assert_eq!(config.ensemble.max_concurrent_llm, 3);
        assert!((config.ensemble.llm_fallback_threshold - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        let w = TriageConfig::default().ensemble.default_weights;
        assert!((w.tier1 + w.tier2 + w.tier3 - 1.0).abs() < WEIGHT_EPSILON);
    }

    #[test]
    fn test_rejects_weights_not_summing_to_one() {
        let toml = r#"
            [ensemble.default_weights]
            tier1 = 0.5
            tier2 = 0.2
            tier3 = 0.5
        "#;
        let err = TriageConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, TriageError::Config(_)));
    }

    #[test]
    fn test_rejects_threshold_out_of_range() {
        let toml = r#"
            [ensemble]
            llm_fallback_threshold = 1.5
        "#;
        assert!(TriageConfig::from_toml_str(toml).is_err());

        let toml = r#"
            [trust]
            earned_autonomy_threshold = 0.0
        "#;
        assert!(TriageConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_rejects_non_monotonic_stage_thresholds() {
        let toml = r#"
            [trust]
            building_confidence_threshold = 0.70
            earned_autonomy_threshold = 0.80
        "#;
        assert!(TriageConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_stage_thresholds_are_monotonic() {
        let trust = TrustConfig::default();
        assert!(
            trust.threshold_for(TrustStage::TrainingWheels)
                > trust.threshold_for(TrustStage::BuildingConfidence)
        );
        assert!(
            trust.threshold_for(TrustStage::BuildingConfidence)
                > trust.threshold_for(TrustStage::EarnedAutonomy)
        );
        assert_eq!(trust.batch_cap_for(TrustStage::TrainingWheels), 0);
    }

    #[test]
    fn test_partial_override() {
        let toml = r#"
            [semantic]
            enabled = true
            model = "llama3.2:3b"

            [queue]
            capacity = 50
        "#;
        let config = TriageConfig::from_toml_str(toml).unwrap();
        assert!(config.semantic.enabled);
        assert_eq!(config.semantic.model, "llama3.2:3b");
        assert_eq!(config.semantic.url, "http://localhost:11434");
        assert_eq!(config.queue.capacity, 50);
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let toml = r#"
            [ensemble]
            max_concurrent_llm = 0
        "#;
        assert!(TriageConfig::from_toml_str(toml).is_err());
    }
}
