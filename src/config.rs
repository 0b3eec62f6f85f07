use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::coords::Screen;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub screen: Screen,
    pub assets: ModelAssets,
    pub trainer: TrainerConfig,
    pub collector: CollectorConfig,
    pub store: StoreConfig,
}

/// Fixed asset locations for both adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelAssets {
    pub reducer_model: PathBuf,
    pub regressor_model: PathBuf,
    pub reducer_artifacts: PathBuf,
    pub regressor_artifacts: PathBuf,
    /// Width of the reduced feature vector.
    pub feature_width: usize,
    pub reducer_outputs: Vec<String>,
    pub regressor_outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub dataset_capacity: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Epochs are skipped until the dataset holds this many samples.
    pub min_samples: usize,
    /// Sleep between skipped epochs.
    pub idle_backoff_ms: u64,
    /// Hand trained weights to the inference runtime every N epochs.
    pub handoff_every: u64,
    /// Fixed shuffle seed. Random when unset.
    pub seed: Option<u64>,
    pub dataset_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// About one second of frames at 30 fps.
    pub backlog_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub dir: PathBuf,
    pub model_key: String,
}

impl Default for ModelAssets {
    fn default() -> Self {
        Self {
            reducer_model: PathBuf::from("models/reducer.onnx"),
            regressor_model: PathBuf::from("models/regressor.onnx"),
            reducer_artifacts: PathBuf::from("models/ort_artifacts/reducer"),
            regressor_artifacts: PathBuf::from("models/ort_artifacts/regressor"),
            feature_width: 32,
            reducer_outputs: vec!["features".to_string()],
            regressor_outputs: vec!["gaze".to_string()],
        }
    }
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            dataset_capacity: 2048,
            batch_size: 64,
            learning_rate: 5e-3,
            min_samples: 64,
            idle_backoff_ms: 100,
            handoff_every: 1,
            seed: None,
            dataset_path: None,
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self { backlog_capacity: 30 }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("cache/store"),
            model_key: "gaze_model".to_string(),
        }
    }
}

impl AppConfig {
    pub const PATH: &'static str = "config.json";

    /// Loads `path`, falling back to defaults for a missing file or missing
    /// fields, then writes the merged result back.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            match serde_json::from_str::<AppConfig>(&content) {
                Ok(c) => {
                    tracing::info!("Loaded configuration from {}", path.display());
                    c
                }
                Err(e) => {
                    tracing::warn!("Error parsing config: {}. Loading defaults.", e);
                    Self::default()
                }
            }
        } else {
            tracing::info!("Configuration file not found. Creating default at {}", path.display());
            Self::default()
        };

        config.save(path)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}
