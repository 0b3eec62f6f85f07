//! Training side: the same two stages, trained on collected samples.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::ModelAssets;
use crate::error::{GazeError, GazeResult};
use crate::stage::TrainableStage;
use crate::types::{LANDMARK_COUNT, LANDMARK_FLOATS};

type StageSlot = Arc<Mutex<Option<Box<dyn TrainableStage>>>>;

/// Runs `f` against the stage on the blocking pool while holding its lock.
/// `Ok(None)` when the slot is empty.
async fn with_stage<T, F>(slot: &StageSlot, f: F) -> GazeResult<Option<T>>
where
    T: Send + 'static,
    F: FnOnce(&mut Box<dyn TrainableStage>) -> anyhow::Result<T> + Send + 'static,
{
    let mut guard = Arc::clone(slot).lock_owned().await;
    if guard.is_none() {
        return Ok(None);
    }
    let out = tokio::task::spawn_blocking(move || match guard.as_mut() {
        Some(stage) => f(stage).map(Some),
        None => Ok(None),
    })
    .await?;
    out.map_err(GazeError::Engine)
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> GazeResult<()> {
    if expected != actual {
        return Err(GazeError::ShapeMismatch { what, expected, actual });
    }
    Ok(())
}

pub struct TrainableRuntime {
    assets: ModelAssets,
    reducer: StageSlot,
    regressor: StageSlot,
    /// Pass-through features used while the reducer is unavailable.
    fallback: std::sync::Mutex<Option<Vec<f32>>>,
    initialized: AtomicBool,
}

impl TrainableRuntime {
    pub fn new(assets: ModelAssets) -> Self {
        Self {
            assets,
            reducer: Arc::new(Mutex::new(None)),
            regressor: Arc::new(Mutex::new(None)),
            fallback: std::sync::Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// Runtime backed by already-loaded stages. Either may be absent.
    pub fn with_stages(
        assets: ModelAssets,
        reducer: Option<Box<dyn TrainableStage>>,
        regressor: Option<Box<dyn TrainableStage>>,
    ) -> Self {
        Self {
            assets,
            reducer: Arc::new(Mutex::new(reducer)),
            regressor: Arc::new(Mutex::new(regressor)),
            fallback: std::sync::Mutex::new(None),
            initialized: AtomicBool::new(true),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub async fn has_regressor(&self) -> bool {
        self.regressor.lock().await.is_some()
    }

    /// Whether `transform` yields real features: a reducer is loaded or a
    /// pass-through buffer was fitted. Otherwise it only returns zeros.
    pub async fn produces_features(&self) -> bool {
        if self.reducer.lock().await.is_some() {
            return true;
        }
        self.fallback.lock().unwrap_or_else(|p| p.into_inner()).is_some()
    }

    /// Loads the training artifacts of both stages. A stage whose artifacts
    /// are missing stays unavailable; that is logged, not returned.
    pub async fn init(&self) -> GazeResult<()> {
        if self.is_initialized() {
            return Err(GazeError::AlreadyInitialized);
        }

        let assets = self.assets.clone();
        let (reducer, regressor) = tokio::task::spawn_blocking(move || {
            let fw = assets.feature_width;
            (
                load_stage("reducer", &assets.reducer_artifacts, &[LANDMARK_COUNT, 3], &[fw], &assets.reducer_outputs),
                load_stage("regressor", &assets.regressor_artifacts, &[fw], &[2], &assets.regressor_outputs),
            )
        })
        .await?;

        match reducer {
            Ok(stage) => *self.reducer.lock().await = Some(stage),
            Err(e) => tracing::warn!("Reducer training unavailable, using pass-through features: {:#}", e),
        }
        match regressor {
            Ok(stage) => *self.regressor.lock().await = Some(stage),
            Err(e) => tracing::warn!("Regressor training unavailable: {:#}", e),
        }

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Trains the reducer towards precomputed feature targets. Without a
    /// reducer the targets become the pass-through features.
    pub async fn fit_reducer(
        &self,
        landmarks: Vec<f32>,
        targets: Vec<f32>,
        sample_count: usize,
        batch_size: usize,
    ) -> GazeResult<()> {
        let fw = self.assets.feature_width;
        check_len("landmarks", sample_count * LANDMARK_FLOATS, landmarks.len())?;
        check_len("feature targets", sample_count * fw, targets.len())?;

        if self.reducer.lock().await.is_none() {
            tracing::debug!("Caching {} pass-through feature rows", sample_count);
            *self.fallback.lock().unwrap_or_else(|p| p.into_inner()) = Some(targets);
            return Ok(());
        }

        let bs = batch_size.max(1);
        with_stage(&self.reducer, move |stage| {
            for start in (0..sample_count).step_by(bs) {
                let end = (start + bs).min(sample_count);
                stage.train_step(
                    &landmarks[start * LANDMARK_FLOATS..end * LANDMARK_FLOATS],
                    &targets[start * fw..end * fw],
                    end - start,
                )?;
                stage.optimizer_step()?;
                stage.reset_grad()?;
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Reduced features for `sample_count` landmark sets, without gradients.
    pub async fn transform(&self, landmarks: Vec<f32>, sample_count: usize) -> GazeResult<Vec<f32>> {
        let fw = self.assets.feature_width;
        check_len("landmarks", sample_count * LANDMARK_FLOATS, landmarks.len())?;

        let reduced = with_stage(&self.reducer, move |stage| stage.eval_step(&landmarks, sample_count)).await?;
        if let Some(features) = reduced {
            check_len("reduced features", sample_count * fw, features.len())?;
            return Ok(features);
        }

        let fallback = self.fallback.lock().unwrap_or_else(|p| p.into_inner());
        match fallback.as_ref() {
            Some(cached) if cached.len() == sample_count * fw => Ok(cached.clone()),
            _ => Ok(vec![0.0; sample_count * fw]),
        }
    }

    /// Trains the regressor for `epochs` passes over `sample_count` samples in
    /// mini-batches of `batch_size`. The optimizer steps and gradients reset
    /// after every mini-batch. Returns the unweighted mean mini-batch loss of
    /// each epoch.
    pub async fn train_batch(
        &self,
        features: Vec<f32>,
        targets: Vec<f32>,
        sample_count: usize,
        batch_size: usize,
        epochs: usize,
        learning_rate: f32,
    ) -> GazeResult<Vec<f32>> {
        if !self.is_initialized() {
            return Err(GazeError::NotInitialized);
        }
        if sample_count == 0 {
            return Err(GazeError::EmptyBatch);
        }
        let fw = self.assets.feature_width;
        check_len("features", sample_count * fw, features.len())?;
        check_len("targets", sample_count * 2, targets.len())?;

        let bs = batch_size.max(1);
        let losses = with_stage(&self.regressor, move |stage| {
            stage.set_learning_rate(learning_rate)?;
            let mut epoch_losses = Vec::with_capacity(epochs);
            for _ in 0..epochs {
                let mut total = 0.0f32;
                let mut batches = 0usize;
                for start in (0..sample_count).step_by(bs) {
                    let end = (start + bs).min(sample_count);
                    total += stage.train_step(
                        &features[start * fw..end * fw],
                        &targets[start * 2..end * 2],
                        end - start,
                    )?;
                    stage.optimizer_step()?;
                    stage.reset_grad()?;
                    batches += 1;
                }
                epoch_losses.push(total / batches as f32);
            }
            Ok(epoch_losses)
        })
        .await?;

        losses.ok_or(GazeError::NotInitialized)
    }

    /// Regressor forward pass in model space, two values per sample.
    pub async fn evaluate(&self, features: Vec<f32>, sample_count: usize) -> GazeResult<Vec<f32>> {
        if !self.is_initialized() {
            return Err(GazeError::NotInitialized);
        }
        check_len("features", sample_count * self.assets.feature_width, features.len())?;
        let out = with_stage(&self.regressor, move |stage| stage.eval_step(&features, sample_count))
            .await?
            .ok_or(GazeError::NotInitialized)?;
        check_len("predictions", sample_count * 2, out.len())?;
        Ok(out)
    }

    /// Current regressor weights as an inference model.
    pub async fn export_weights(&self) -> GazeResult<Option<Vec<u8>>> {
        with_stage(&self.regressor, |stage| stage.export()).await
    }
}

#[cfg(feature = "training")]
fn load_stage(
    name: &str,
    dir: &std::path::Path,
    input_shape: &[usize],
    label_shape: &[usize],
    outputs: &[String],
) -> anyhow::Result<Box<dyn TrainableStage>> {
    let stage = crate::stage::OrtTrainableStage::from_artifacts(name, dir, input_shape, label_shape, outputs)?;
    Ok(Box::new(stage))
}

#[cfg(not(feature = "training"))]
fn load_stage(
    name: &str,
    dir: &std::path::Path,
    _input_shape: &[usize],
    _label_shape: &[usize],
    _outputs: &[String],
) -> anyhow::Result<Box<dyn TrainableStage>> {
    anyhow::bail!(
        "built without the `training` feature; {} artifacts in {} not loaded",
        name,
        dir.display()
    )
}
