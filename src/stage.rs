//! Engine seams for the two model stages and their ONNX Runtime backings.

use anyhow::{Context, Result};
use ort::session::{builder::GraphOptimizationLevel, builder::SessionBuilder, Session};
use std::path::Path;

/// One inference stage: `batch` rows in, `batch` rows out.
pub trait InferenceStage: Send {
    fn name(&self) -> &str;

    fn run(&mut self, input: &[f32], batch: usize) -> Result<Vec<f32>>;

    /// Current weights, if this stage can produce them.
    fn export_weights(&self) -> Option<Vec<u8>> {
        None
    }

    /// Replaces the stage weights with an exported blob.
    fn load_weights(&mut self, bytes: Vec<u8>) -> Result<()> {
        anyhow::bail!("{} stage cannot load {} bytes of weights", self.name(), bytes.len())
    }
}

/// One trainable stage with the train-step / optimizer-step / reset contract.
pub trait TrainableStage: Send {
    fn name(&self) -> &str;

    /// Forward + backward on one mini-batch. Returns the scalar loss.
    fn train_step(&mut self, input: &[f32], labels: &[f32], batch: usize) -> Result<f32>;

    fn optimizer_step(&mut self) -> Result<()>;

    fn reset_grad(&mut self) -> Result<()>;

    fn set_learning_rate(&mut self, lr: f32) -> Result<()>;

    /// Forward pass without gradient tracking.
    fn eval_step(&mut self, input: &[f32], batch: usize) -> Result<Vec<f32>>;

    /// Serialized inference graph with the current weights.
    fn export(&mut self) -> Result<Vec<u8>>;
}

pub(crate) fn batch_shape(batch: usize, sample_shape: &[usize]) -> Vec<i64> {
    std::iter::once(batch)
        .chain(sample_shape.iter().copied())
        .map(|d| d as i64)
        .collect()
}

/// Best available execution provider first, CPU as the floor.
pub(crate) fn session_builder() -> Result<SessionBuilder> {
    Ok(Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .with_execution_providers([
            ort::execution_providers::CoreMLExecutionProvider::default().build(),
            ort::execution_providers::CPUExecutionProvider::default().build(),
        ])?)
}

/// Reads a scratch file and removes it, whether or not the read succeeded.
#[cfg_attr(not(feature = "training"), allow(dead_code))]
pub(crate) fn take_file(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path);
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Could not remove {}: {}", path.display(), e);
        }
    }
    bytes.with_context(|| format!("failed to read {}", path.display()))
}

/// An ONNX inference session for one stage.
pub struct OrtStage {
    name: String,
    session: Session,
    sample_shape: Vec<usize>,
    /// Bytes the session was built from, when loaded from memory.
    source: Option<Vec<u8>>,
}

impl OrtStage {
    pub fn from_file(name: &str, path: &Path, sample_shape: &[usize]) -> Result<Self> {
        tracing::info!("Loading {} stage from {}", name, path.display());
        let session = session_builder()?
            .commit_from_file(path)
            .with_context(|| format!("failed to load {} model from {}", name, path.display()))?;
        Ok(Self {
            name: name.to_string(),
            session,
            sample_shape: sample_shape.to_vec(),
            source: None,
        })
    }

    pub fn from_memory(name: &str, bytes: Vec<u8>, sample_shape: &[usize]) -> Result<Self> {
        tracing::info!("Loading {} stage from {} bytes", name, bytes.len());
        let session = session_builder()?
            .commit_from_memory(&bytes)
            .with_context(|| format!("failed to load {} model from memory", name))?;
        Ok(Self {
            name: name.to_string(),
            session,
            sample_shape: sample_shape.to_vec(),
            source: Some(bytes),
        })
    }
}

impl InferenceStage for OrtStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, input: &[f32], batch: usize) -> Result<Vec<f32>> {
        let shape = batch_shape(batch, &self.sample_shape);
        let tensor = ort::value::Tensor::from_array((shape, input.to_vec()))?;
        let outputs = self.session.run(ort::inputs![tensor])?;
        let (_shape, data) = outputs[0].try_extract_tensor::<f32>()?;
        Ok(data.to_vec())
    }

    fn export_weights(&self) -> Option<Vec<u8>> {
        self.source.clone()
    }

    fn load_weights(&mut self, bytes: Vec<u8>) -> Result<()> {
        *self = OrtStage::from_memory(&self.name, bytes, &self.sample_shape)?;
        Ok(())
    }
}

#[cfg(feature = "training")]
pub use self::training::OrtTrainableStage;

#[cfg(feature = "training")]
mod training {
    use super::{batch_shape, session_builder, take_file, InferenceStage, OrtStage, TrainableStage};
    use anyhow::{Context, Result};
    use ort::training::Trainer;
    use std::path::Path;

    /// ONNX Runtime training session built from a directory of artifacts
    /// (`checkpoint`, `training_model.onnx`, `eval_model.onnx`,
    /// `optimizer_model.onnx`).
    pub struct OrtTrainableStage {
        name: String,
        trainer: Trainer,
        input_shape: Vec<usize>,
        label_shape: Vec<usize>,
        output_names: Vec<String>,
        /// Inference view of the current weights, rebuilt after each update.
        eval: Option<OrtStage>,
    }

    impl OrtTrainableStage {
        pub fn from_artifacts(
            name: &str,
            dir: &Path,
            input_shape: &[usize],
            label_shape: &[usize],
            output_names: &[String],
        ) -> Result<Self> {
            tracing::info!("Loading {} training artifacts from {}", name, dir.display());
            let trainer = Trainer::new_from_artifacts(
                session_builder()?,
                ort::memory::Allocator::default(),
                dir,
                None,
            )
            .with_context(|| format!("failed to load {} training artifacts", name))?;
            Ok(Self {
                name: name.to_string(),
                trainer,
                input_shape: input_shape.to_vec(),
                label_shape: label_shape.to_vec(),
                output_names: output_names.to_vec(),
                eval: None,
            })
        }
    }

    impl TrainableStage for OrtTrainableStage {
        fn name(&self) -> &str {
            &self.name
        }

        fn train_step(&mut self, input: &[f32], labels: &[f32], batch: usize) -> Result<f32> {
            let input = ort::value::Tensor::from_array((batch_shape(batch, &self.input_shape), input.to_vec()))?;
            let labels = ort::value::Tensor::from_array((batch_shape(batch, &self.label_shape), labels.to_vec()))?;
            let outputs = self.trainer.step(ort::inputs![input], ort::inputs![labels])?;
            let (_shape, loss) = outputs[0].try_extract_tensor::<f32>()?;
            loss.first().copied().context("training step produced no loss")
        }

        fn optimizer_step(&mut self) -> Result<()> {
            self.trainer.optimizer().step()?;
            self.eval = None;
            Ok(())
        }

        fn reset_grad(&mut self) -> Result<()> {
            self.trainer.optimizer().reset_grad()?;
            Ok(())
        }

        fn set_learning_rate(&mut self, lr: f32) -> Result<()> {
            self.trainer.optimizer().set_lr(lr)?;
            Ok(())
        }

        fn eval_step(&mut self, input: &[f32], batch: usize) -> Result<Vec<f32>> {
            if self.eval.is_none() {
                let bytes = self.export()?;
                self.eval = Some(OrtStage::from_memory(&self.name, bytes, &self.input_shape)?);
            }
            match self.eval.as_mut() {
                Some(stage) => stage.run(input, batch),
                None => anyhow::bail!("{} eval session unavailable", self.name),
            }
        }

        fn export(&mut self) -> Result<Vec<u8>> {
            let path = std::env::temp_dir().join(format!(
                "rusty_gaze_{}_{}.onnx",
                self.name,
                std::process::id()
            ));
            self.trainer.export(&path, &self.output_names)?;
            take_file(&path).with_context(|| format!("failed to read exported {} model", self.name))
        }
    }
}
