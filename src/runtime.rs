//! Inference side: reducer + regressor behind a FIFO queue.

use anyhow::Context;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::ModelAssets;
use crate::error::{GazeError, GazeResult};
use crate::stage::{InferenceStage, OrtStage};
use crate::types::{flatten_landmarks, Coord, LandmarkSet, LANDMARK_COUNT};

struct Pipeline {
    reducer: Box<dyn InferenceStage>,
    regressor: Box<dyn InferenceStage>,
    feature_width: usize,
}

impl Pipeline {
    fn forward(&mut self, input: &[f32], batch: usize) -> anyhow::Result<Vec<Coord>> {
        let features = self.reducer.run(input, batch)?;
        anyhow::ensure!(
            features.len() == batch * self.feature_width,
            "{} produced {} values for {} samples",
            self.reducer.name(),
            features.len(),
            batch
        );
        let out = self.regressor.run(&features, batch)?;
        anyhow::ensure!(
            out.len() == batch * 2,
            "{} produced {} values for {} samples",
            self.regressor.name(),
            out.len(),
            batch
        );
        Ok(out.chunks_exact(2).map(|xy| Coord::new(xy[0], xy[1])).collect())
    }
}

/// Serves batched gaze predictions.
///
/// Every call that touches the loaded stages takes the same fair lock, so
/// overlapping callers are served in the order they arrived and never run
/// concurrently against the sessions.
pub struct ModelRuntime {
    assets: ModelAssets,
    pipeline: Arc<Mutex<Option<Pipeline>>>,
    ready: AtomicBool,
    init_attempted: AtomicBool,
}

impl ModelRuntime {
    pub fn new(assets: ModelAssets) -> Self {
        Self {
            assets,
            pipeline: Arc::new(Mutex::new(None)),
            ready: AtomicBool::new(false),
            init_attempted: AtomicBool::new(false),
        }
    }

    /// Runtime backed by already-loaded stages; ready immediately.
    pub fn with_stages(
        assets: ModelAssets,
        reducer: Box<dyn InferenceStage>,
        regressor: Box<dyn InferenceStage>,
    ) -> Self {
        let feature_width = assets.feature_width;
        Self {
            assets,
            pipeline: Arc::new(Mutex::new(Some(Pipeline {
                reducer,
                regressor,
                feature_width,
            }))),
            ready: AtomicBool::new(true),
            init_attempted: AtomicBool::new(true),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Loads both stages. The regressor comes from `saved_weights` when they
    /// load, otherwise from the default asset. A failed init is final for
    /// this instance.
    pub async fn init(&self, saved_weights: Option<Vec<u8>>) -> GazeResult<()> {
        if self.init_attempted.swap(true, Ordering::AcqRel) {
            return Err(GazeError::AlreadyInitialized);
        }

        let assets = self.assets.clone();
        let loaded = tokio::task::spawn_blocking(move || load_pipeline(&assets, saved_weights)).await?;
        match loaded {
            Ok(pipeline) => {
                *self.pipeline.lock().await = Some(pipeline);
                self.ready.store(true, Ordering::Release);
                tracing::info!("Inference runtime ready");
                Ok(())
            }
            Err(e) => {
                tracing::error!("Inference runtime failed to load: {:#}", e);
                Err(GazeError::Engine(e))
            }
        }
    }

    /// One `(x, y)` in model space per input, in input order.
    pub async fn predict(&self, batch: &[LandmarkSet]) -> GazeResult<Vec<Coord>> {
        if !self.is_ready() {
            return Err(GazeError::NotReady);
        }
        if batch.is_empty() {
            return Err(GazeError::EmptyBatch);
        }

        let n = batch.len();
        let input = flatten_landmarks(batch);
        let mut guard = Arc::clone(&self.pipeline).lock_owned().await;
        let result = tokio::task::spawn_blocking(move || {
            let pipeline = guard.as_mut().context("inference pipeline not loaded")?;
            pipeline.forward(&input, n)
        })
        .await?;
        result.map_err(GazeError::Engine)
    }

    /// Swaps in freshly trained regressor weights. Queued behind any
    /// prediction already waiting.
    pub async fn install_weights(&self, bytes: Vec<u8>) -> GazeResult<()> {
        if !self.is_ready() {
            return Err(GazeError::NotReady);
        }
        let size = bytes.len();
        let mut guard = Arc::clone(&self.pipeline).lock_owned().await;
        let result = tokio::task::spawn_blocking(move || {
            let pipeline = guard.as_mut().context("inference pipeline not loaded")?;
            pipeline.regressor.load_weights(bytes)
        })
        .await?;
        result.map_err(GazeError::Engine)?;
        tracing::info!("Installed {} bytes of regressor weights", size);
        Ok(())
    }

    /// Live regressor weights, else the default asset bytes, else `None`.
    pub async fn export_weights(&self) -> Option<Vec<u8>> {
        let live = {
            let guard = self.pipeline.lock().await;
            guard.as_ref().and_then(|p| p.regressor.export_weights())
        };
        if live.is_some() {
            return live;
        }

        match tokio::fs::read(&self.assets.regressor_model).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(
                    "No regressor weights to export ({}: {})",
                    self.assets.regressor_model.display(),
                    e
                );
                None
            }
        }
    }
}

fn load_pipeline(assets: &ModelAssets, saved_weights: Option<Vec<u8>>) -> anyhow::Result<Pipeline> {
    let reducer = OrtStage::from_file("reducer", &assets.reducer_model, &[LANDMARK_COUNT, 3])?;
    let feature_shape = [assets.feature_width];

    let regressor = match saved_weights {
        Some(bytes) => match OrtStage::from_memory("regressor", bytes, &feature_shape) {
            Ok(stage) => stage,
            Err(e) => {
                tracing::warn!("Saved regressor weights unusable ({:#}); loading default", e);
                default_regressor(&assets.regressor_model, &feature_shape)?
            }
        },
        None => default_regressor(&assets.regressor_model, &feature_shape)?,
    };

    Ok(Pipeline {
        reducer: Box::new(reducer),
        regressor: Box::new(regressor),
        feature_width: assets.feature_width,
    })
}

fn default_regressor(path: &Path, feature_shape: &[usize]) -> anyhow::Result<OrtStage> {
    OrtStage::from_file("regressor", path, feature_shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{landmarks, MockLog, MockReducer, MockRegressor};
    use std::time::Duration;

    fn assets() -> ModelAssets {
        ModelAssets {
            feature_width: 4,
            ..ModelAssets::default()
        }
    }

    fn runtime(log: &Arc<MockLog>, delay: Duration) -> ModelRuntime {
        ModelRuntime::with_stages(
            assets(),
            Box::new(MockReducer::new(4)),
            Box::new(MockRegressor::new(Arc::clone(log), delay)),
        )
    }

    #[tokio::test]
    async fn predict_before_init_is_rejected() {
        let rt = ModelRuntime::new(assets());
        let err = rt.predict(&[landmarks(1.0)]).await.unwrap_err();
        assert!(matches!(err, GazeError::NotReady), "got {err:?}");
    }

    #[tokio::test]
    async fn failed_init_is_final() {
        let rt = ModelRuntime::new(ModelAssets {
            reducer_model: "does/not/exist/reducer.onnx".into(),
            regressor_model: "does/not/exist/regressor.onnx".into(),
            ..assets()
        });
        assert!(rt.init(None).await.is_err());
        assert!(!rt.is_ready());
        let again = rt.init(None).await.unwrap_err();
        assert!(matches!(again, GazeError::AlreadyInitialized), "got {again:?}");
        assert!(!rt.is_ready());
    }

    #[tokio::test]
    async fn predictions_keep_input_order() {
        let log = Arc::new(MockLog::default());
        let rt = runtime(&log, Duration::ZERO);
        let out = rt.predict(&[landmarks(1.0), landmarks(2.0), landmarks(3.0)]).await.unwrap();
        assert_eq!(out.len(), 3);
        let xs: Vec<f32> = out.iter().map(|c| c.x).collect();
        assert_eq!(xs, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn overlapping_calls_are_serialized_in_fifo_order() {
        let log = Arc::new(MockLog::default());
        let rt = Arc::new(runtime(&log, Duration::from_millis(20)));

        let mut tasks = Vec::new();
        for id in 1..=4 {
            let rt = Arc::clone(&rt);
            tasks.push(tokio::spawn(async move { rt.predict(&[landmarks(id as f32)]).await }));
            // each call reaches the queue before the next is spawned
            tokio::task::yield_now().await;
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        assert_eq!(log.max_concurrent(), 1, "calls overlapped");
        assert_eq!(log.batches(), vec![vec![1.0], vec![2.0], vec![3.0], vec![4.0]]);
    }

    #[tokio::test]
    async fn install_weights_reaches_regressor() {
        let log = Arc::new(MockLog::default());
        let rt = runtime(&log, Duration::ZERO);
        rt.install_weights(vec![7, 7, 7]).await.unwrap();
        assert_eq!(log.installed(), vec![vec![7, 7, 7]]);
        assert_eq!(rt.export_weights().await, Some(vec![7, 7, 7]));
    }

    #[tokio::test]
    async fn export_falls_back_to_asset_bytes() {
        let path = std::env::temp_dir().join(format!("rusty_gaze_regressor_{}.onnx", std::process::id()));
        std::fs::write(&path, b"onnx-bytes").unwrap();

        let log = Arc::new(MockLog::default());
        let rt = ModelRuntime::with_stages(
            ModelAssets {
                regressor_model: path.clone(),
                ..assets()
            },
            Box::new(MockReducer::new(4)),
            Box::new(MockRegressor::new(log, Duration::ZERO)),
        );
        assert_eq!(rt.export_weights().await, Some(b"onnx-bytes".to_vec()));

        std::fs::remove_file(&path).unwrap();
        assert_eq!(rt.export_weights().await, None);
    }
}
