use crate::AffinityError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Default, Clone)]
pub struct AffinityConfig {
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub metrics: crate::metrics::MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrainingConfig {
    /// Labeled results required before a training job may start.
    #[serde(default = "default_min_samples")]
    pub min_samples: i64,
    /// Share of the labeled set held out for validation.
    #[serde(default = "default_holdout_fraction")]
    pub holdout_fraction: f64,
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_l2")]
    pub l2: f64,
    /// Fixed shuffle seed. Unset means a fresh random split per job.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            min_samples: default_min_samples(),
            holdout_fraction: default_holdout_fraction(),
            epochs: default_epochs(),
            learning_rate: default_learning_rate(),
            l2: default_l2(),
            seed: None,
        }
    }
}

fn default_min_samples() -> i64 {
    50
}

fn default_holdout_fraction() -> f64 {
    0.2
}

fn default_epochs() -> u32 {
    200
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_l2() -> f64 {
    0.001
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScoringConfig {
    /// Cosine threshold for matching a trait description against candidate vectors.
    #[serde(default = "default_trait_similarity")]
    pub trait_similarity: f32,
    /// Weight of the learned head inside the physical channel.
    #[serde(default = "default_learned_blend")]
    pub learned_blend: f32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            trait_similarity: default_trait_similarity(),
            learned_blend: default_learned_blend(),
        }
    }
}

fn default_trait_similarity() -> f32 {
    0.25
}

fn default_learned_blend() -> f32 {
    0.5
}

/// Load config from AFFINITY_CONFIG env var, ~/.affinity/config.toml, or defaults.
pub fn load_config() -> Result<AffinityConfig, AffinityError> {
    match config_path() {
        Some(p) if p.exists() => load_config_from(&p),
        _ => Ok(AffinityConfig::default()),
    }
}

pub fn load_config_from(path: &Path) -> Result<AffinityConfig, AffinityError> {
    let content = std::fs::read_to_string(path)?;
    let config: AffinityConfig = toml::from_str(&content)
        .map_err(|e| AffinityError::Config(format!("{}: {e}", path.display())))?;
    validate_config(&config)?;
    Ok(config)
}

fn config_path() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("AFFINITY_CONFIG") {
        return Some(PathBuf::from(p));
    }
    let home = std::env::var("HOME").ok()?;
    Some(Path::new(&home).join(".affinity").join("config.toml"))
}

pub fn validate_config(config: &AffinityConfig) -> Result<(), AffinityError> {
    let t = &config.training;
    if t.min_samples < 2 {
        return Err(AffinityError::Config(format!(
            "training.min_samples must be at least 2, got {}",
            t.min_samples
        )));
    }
    if !(t.holdout_fraction > 0.0 && t.holdout_fraction < 1.0) {
        return Err(AffinityError::Config(format!(
            "training.holdout_fraction must be in (0, 1), got {}",
            t.holdout_fraction
        )));
    }
    if t.epochs == 0 {
        return Err(AffinityError::Config("training.epochs must be positive".into()));
    }
    if t.learning_rate <= 0.0 {
        return Err(AffinityError::Config(format!(
            "training.learning_rate must be positive, got {}",
            t.learning_rate
        )));
    }
    if t.l2 < 0.0 {
        return Err(AffinityError::Config(format!(
            "training.l2 must not be negative, got {}",
            t.l2
        )));
    }

    let s = &config.scoring;
    if !(-1.0..=1.0).contains(&s.trait_similarity) {
        return Err(AffinityError::Config(format!(
            "scoring.trait_similarity must be a cosine in [-1, 1], got {}",
            s.trait_similarity
        )));
    }
    if !(0.0..=1.0).contains(&s.learned_blend) {
        return Err(AffinityError::Config(format!(
            "scoring.learned_blend must be in [0, 1], got {}",
            s.learned_blend
        )));
    }
    Ok(())
}
